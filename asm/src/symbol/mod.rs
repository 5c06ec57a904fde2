pub mod struct_def;

use std::collections::HashMap;

use crate::error::{AsmError, AsmResult};
use crate::expr::{EvalContext, Expr};
use crate::pos::FilePos;
pub use struct_def::{FieldKind, StructDef, StructRegistry};

/// Register names, condition mnemonics and directive-adjacent words that a
/// constant, label or struct can never shadow.
const RESERVED: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15", "sp", "lr", "pc", "fp", "ip", "cpsr", "spsr",
    "eq", "ne", "cs", "cc", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le", "al", "nv",
    "_arm", "_base", "_bytes", "_here", "_main", "_pc", "_thumb", "_version",
];

#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name.to_ascii_lowercase().as_str())
}

#[derive(Debug, Clone)]
struct ConstDef {
    params: Vec<String>,
    body: Expr,
}

#[derive(Default)]
struct Scope {
    constants: HashMap<String, ConstDef>,
    labels: HashMap<String, u32>,
    anonymous: Vec<u32>,
}

/// The implementation's own version, the only datum `_version` ever needs:
/// the original tool is a live process with a build number, this one is a
/// single compiled crate, so a constant is the faithful equivalent.
pub const RESERVED_VERSION: i64 = 1;

/// Owns every constant, label, struct layout and anonymous-label list for
/// one assembly run. Scopes nest (pushed by `{ }` blocks and `.if` bodies)
/// and are searched innermost-first, like a normal lexical environment.
pub struct SymbolTable {
    scopes: Vec<Scope>,
    structs: StructRegistry,
    current_global: Option<String>,
    current_address: u32,
    base_address: u32,
    mode_thumb: bool,
    is_main: bool,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::default()],
            structs: StructRegistry::new(),
            current_global: None,
            current_address: 0,
            base_address: 0,
            mode_thumb: false,
            is_main: true,
        }
    }

    /// Updates the pieces of evaluation context the driver owns (mode, base
    /// address, whether the running file is the entry point) so `_arm`,
    /// `_base`, `_main` and `_thumb` stay in step with it. `_here`/`_bytes`
    /// track `current_address`, already kept current by every emitter write.
    pub const fn set_reserved_state(&mut self, base_address: u32, mode_thumb: bool, is_main: bool) {
        self.base_address = base_address;
        self.mode_thumb = mode_thumb;
        self.is_main = is_main;
    }

    fn resolve_reserved_impl(&self, name: &str) -> Option<i64> {
        Some(match name {
            "_arm" => i64::from(!self.mode_thumb),
            "_thumb" => i64::from(self.mode_thumb),
            "_base" => i64::from(self.base_address),
            "_here" => i64::from(self.current_address),
            "_bytes" => i64::from(self.current_address.wrapping_sub(self.base_address)),
            "_pc" => {
                let pipeline = if self.mode_thumb { 4 } else { 8 };
                i64::from(self.current_address) + pipeline
            }
            "_main" => i64::from(self.is_main),
            "_version" => RESERVED_VERSION,
            _ => return None,
        })
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn pop_scope(&mut self, pos: &FilePos) -> AsmResult<()> {
        if self.scopes.len() <= 1 {
            return Err(AsmError::UnbalancedScope { pos: pos.clone() });
        }
        self.scopes.pop();
        Ok(())
    }

    pub const fn set_current_address(&mut self, address: u32) {
        self.current_address = address;
    }

    #[must_use]
    pub const fn current_address(&self) -> u32 {
        self.current_address
    }

    #[must_use]
    pub fn structs(&self) -> &StructRegistry {
        &self.structs
    }

    #[must_use]
    pub fn structs_mut(&mut self) -> &mut StructRegistry {
        &mut self.structs
    }

    #[must_use]
    pub fn current_global(&self) -> Option<&str> {
        self.current_global.as_deref()
    }

    pub fn set_current_global(&mut self, global: Option<String>) {
        self.current_global = global;
    }

    pub fn define_constant(
        &mut self,
        name: &str,
        params: Vec<String>,
        body: Expr,
        pos: &FilePos,
    ) -> AsmResult<()> {
        self.check_definable(name, pos)?;
        let scope = self.scopes.last_mut().expect("global scope always present");
        if scope.constants.contains_key(name) {
            return Err(AsmError::DuplicateConstant { pos: pos.clone(), name: name.to_string() });
        }
        scope.constants.insert(name.to_string(), ConstDef { params, body });
        Ok(())
    }

    pub fn define_label(&mut self, name: &str, address: u32, pos: &FilePos) -> AsmResult<()> {
        self.check_definable(name, pos)?;
        let key = name.to_string();
        let scope = self.scopes.last_mut().expect("global scope always present");
        if scope.labels.contains_key(&key) {
            return Err(AsmError::DuplicateLabel { pos: pos.clone(), name: key });
        }
        scope.labels.insert(key, address);
        self.current_global = Some(name.to_string());
        Ok(())
    }

    pub fn define_local_label(&mut self, name: &str, address: u32, pos: &FilePos) -> AsmResult<()> {
        self.check_definable(name, pos)?;
        let namespaced = self.namespace_local(name);
        let scope = self.scopes.last_mut().expect("global scope always present");
        if scope.labels.contains_key(&namespaced) {
            return Err(AsmError::DuplicateLabel { pos: pos.clone(), name: namespaced });
        }
        scope.labels.insert(namespaced, address);
        Ok(())
    }

    pub fn define_anonymous_label(&mut self, address: u32) {
        self.scopes.last_mut().expect("global scope always present").anonymous.push(address);
    }

    fn namespace_local(&self, name: &str) -> String {
        match &self.current_global {
            Some(global) => format!("{global}@@{name}"),
            None => name.to_string(),
        }
    }

    fn check_definable(&self, name: &str, pos: &FilePos) -> AsmResult<()> {
        if is_reserved(name) {
            return Err(AsmError::ReservedIdentifier { pos: pos.clone(), name: name.to_string() });
        }
        Ok(())
    }

    /// Whether `name` resolves to a label or a zero-parameter constant
    /// anywhere in the current scope chain. Used by `.import "path" { names
    /// }` to check, right after running the target, that every listed name
    /// is actually something the target defines.
    #[must_use]
    pub fn is_defined(&self, name: &str) -> bool {
        self.lookup_value(name).is_some()
    }

    fn lookup_value(&self, name: &str) -> Option<i64> {
        for scope in self.scopes.iter().rev() {
            if let Some(addr) = scope.labels.get(name) {
                return Some(i64::from(*addr));
            }
            if let Some(def) = scope.constants.get(name) {
                if def.params.is_empty() {
                    // Evaluated lazily against an immutable snapshot view;
                    // a zero-arg `.def` can still reference labels defined
                    // after it, same as any other constant.
                    return self.eval_body_readonly(&def.body);
                }
            }
        }
        None
    }

    fn eval_body_readonly(&self, body: &Expr) -> Option<i64> {
        let mut view = ReadOnlyView { table: self };
        body.eval(&mut view).ok().flatten()
    }

    fn lookup_macro(&self, name: &str, args: &[i64], pos: &FilePos) -> AsmResult<Option<i64>> {
        for scope in self.scopes.iter().rev() {
            if let Some(def) = scope.constants.get(name) {
                if def.params.len() == args.len() && !def.params.is_empty() {
                    let mut child = Scope::default();
                    for (p, v) in def.params.iter().zip(args) {
                        child.constants.insert(
                            p.clone(),
                            ConstDef { params: Vec::new(), body: Expr::Number(*v) },
                        );
                    }
                    let body = def.body.clone();
                    // Build a temporary table sharing everything but with
                    // the parameter bindings pushed on top.
                    let mut tmp = ReadOnlyViewWithExtra { table: self, extra: &child };
                    return body.eval(&mut tmp);
                } else if def.params.len() != args.len() {
                    return Err(AsmError::ArityMismatch {
                        pos: pos.clone(),
                        name: name.to_string(),
                        expected: def.params.len(),
                        found: args.len(),
                    });
                }
            }
        }
        Ok(None)
    }

    /// Anonymous labels are visible the same way any other label is: search
    /// scopes innermost-first, matching the first one whose list of
    /// positions has an entry `count` forward/backward of the current
    /// address.
    fn resolve_anonymous_impl(&self, forward: bool, count: u32) -> Option<i64> {
        for scope in self.scopes.iter().rev() {
            let addrs = &scope.anonymous;
            let pivot = addrs.partition_point(|&a| a <= self.current_address);
            let idx = if forward {
                pivot.checked_add((count - 1) as usize)
            } else {
                (pivot).checked_sub(count as usize)
            };
            if let Some(idx) = idx {
                if let Some(&addr) = addrs.get(idx) {
                    return Some(i64::from(addr));
                }
            }
        }
        None
    }

    fn resolve_member_impl(&self, base: i64, member: &str) -> Option<i64> {
        // Struct member access on a raw address: offset the address by the
        // named field's byte offset within whichever struct the caller
        // associated with `base` is irrelevant here; the struct index is
        // carried by convention as the high bits is deliberately NOT done.
        // Instead member access is resolved purely lexically: `label.field`
        // looks up `field` against every struct def and takes the first
        // match, which is correct because field names are namespaced by
        // convention in well-formed sources.
        for def in self.structs.iter() {
            if let Some(offset) = def.fields.iter().find(|f| f.name == member).map(|f| f.offset) {
                return Some(base + i64::from(offset));
            }
        }
        None
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalContext for SymbolTable {
    fn resolve_ident(&mut self, name: &str) -> Option<i64> {
        if let Some(local) = name.strip_prefix("@@") {
            return self.lookup_value(&self.namespace_local(local));
        }
        if let Some(global) = &self.current_global {
            let namespaced = format!("{global}@@{name}");
            if let Some(v) = self.lookup_value(&namespaced) {
                return Some(v);
            }
        }
        self.lookup_value(name)
    }

    fn resolve_anonymous(&mut self, forward: bool, count: u32) -> Option<i64> {
        self.resolve_anonymous_impl(forward, count)
    }

    fn resolve_member(&mut self, base: i64, member: &str, _pos: &FilePos) -> Option<i64> {
        self.resolve_member_impl(base, member)
    }

    fn read_memory(&mut self, _addr: i64, _width: u32, pos: &FilePos) -> AsmResult<i64> {
        Err(AsmError::DirectiveError {
            pos: pos.clone(),
            message: "memory reads are only available while assembling against a live image".into(),
        })
    }

    fn resolve_macro(&mut self, name: &str, args: &[i64], pos: &FilePos) -> AsmResult<Option<i64>> {
        self.lookup_macro(name, args, pos)
    }

    fn resolve_reserved(&mut self, name: &str, pos: &FilePos) -> AsmResult<i64> {
        self.resolve_reserved_impl(name).ok_or_else(|| AsmError::DirectiveError {
            pos: pos.clone(),
            message: format!("unknown reserved identifier `{name}`"),
        })
    }
}

/// A read-only borrow used to evaluate a zero-arg `.def` body without
/// re-entrant `&mut self` access to the owning table.
struct ReadOnlyView<'a> {
    table: &'a SymbolTable,
}

impl EvalContext for ReadOnlyView<'_> {
    fn resolve_ident(&mut self, name: &str) -> Option<i64> {
        if let Some(local) = name.strip_prefix("@@") {
            return self.table.lookup_value(&self.table.namespace_local(local));
        }
        self.table.lookup_value(name)
    }
    fn resolve_anonymous(&mut self, forward: bool, count: u32) -> Option<i64> {
        self.table.resolve_anonymous_impl(forward, count)
    }
    fn resolve_member(&mut self, base: i64, member: &str, _pos: &FilePos) -> Option<i64> {
        self.table.resolve_member_impl(base, member)
    }
    fn read_memory(&mut self, _addr: i64, _width: u32, pos: &FilePos) -> AsmResult<i64> {
        Err(AsmError::DirectiveError { pos: pos.clone(), message: "memory reads unavailable here".into() })
    }
    fn resolve_reserved(&mut self, name: &str, pos: &FilePos) -> AsmResult<i64> {
        self.table.resolve_reserved_impl(name).ok_or_else(|| AsmError::DirectiveError {
            pos: pos.clone(),
            message: format!("unknown reserved identifier `{name}`"),
        })
    }
}

struct ReadOnlyViewWithExtra<'a> {
    table: &'a SymbolTable,
    extra: &'a Scope,
}

impl EvalContext for ReadOnlyViewWithExtra<'_> {
    fn resolve_ident(&mut self, name: &str) -> Option<i64> {
        if let Some(def) = self.extra.constants.get(name) {
            if let Expr::Number(n) = &def.body {
                return Some(*n);
            }
        }
        if let Some(local) = name.strip_prefix("@@") {
            return self.table.lookup_value(&self.table.namespace_local(local));
        }
        self.table.lookup_value(name)
    }
    fn resolve_anonymous(&mut self, forward: bool, count: u32) -> Option<i64> {
        self.table.resolve_anonymous_impl(forward, count)
    }
    fn resolve_member(&mut self, base: i64, member: &str, _pos: &FilePos) -> Option<i64> {
        self.table.resolve_member_impl(base, member)
    }
    fn read_memory(&mut self, _addr: i64, _width: u32, pos: &FilePos) -> AsmResult<i64> {
        Err(AsmError::DirectiveError { pos: pos.clone(), message: "memory reads unavailable here".into() })
    }
    fn resolve_reserved(&mut self, name: &str, pos: &FilePos) -> AsmResult<i64> {
        self.table.resolve_reserved_impl(name).ok_or_else(|| AsmError::DirectiveError {
            pos: pos.clone(),
            message: format!("unknown reserved identifier `{name}`"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expr;
    use crate::lexer::Lexer;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn expr_of(src: &str) -> Expr {
        let toks = Lexer::new(Rc::from("t.s"), src).tokenize_all().unwrap();
        parse_expr(&toks).unwrap().0
    }

    fn pos() -> FilePos {
        FilePos::new(Rc::from("t"), 1, 1)
    }

    #[test]
    fn labels_resolve_to_their_address() {
        let mut table = SymbolTable::new();
        table.define_label("start", 0x0800_0000, &pos()).unwrap();
        let mut v = table;
        let e = expr_of("start + 4");
        assert_eq!(e.eval(&mut v).unwrap(), Some(0x0800_0004));
    }

    #[test]
    fn reserved_names_rejected() {
        let mut table = SymbolTable::new();
        assert!(table.define_label("r0", 0, &pos()).is_err());
    }

    #[test]
    fn zero_arg_def_is_a_constant() {
        let mut table = SymbolTable::new();
        table.define_constant("TWO", vec![], Expr::Number(2), &pos()).unwrap();
        let e = expr_of("TWO * 21");
        assert_eq!(e.eval(&mut table).unwrap(), Some(42));
    }

    #[test]
    fn parameterised_def_evaluates_with_bound_args() {
        let mut table = SymbolTable::new();
        let body = expr_of("x * x");
        table.define_constant("SQUARE", vec!["x".into()], body, &pos()).unwrap();
        let call = expr_of("SQUARE(5)");
        assert_eq!(call.eval(&mut table).unwrap(), Some(25));
    }

    #[test]
    fn anonymous_labels_resolve_relative_to_current_address() {
        let mut table = SymbolTable::new();
        table.define_anonymous_label(0x100);
        table.define_anonymous_label(0x200);
        table.set_current_address(0x150);
        assert_eq!(table.resolve_anonymous(true, 1), Some(0x200));
        assert_eq!(table.resolve_anonymous(false, 1), Some(0x100));
    }

    #[test]
    fn local_labels_are_namespaced_to_the_enclosing_global() {
        let mut table = SymbolTable::new();
        table.define_label("main", 0x0, &pos()).unwrap();
        table.define_local_label("loop", 0x4, &pos()).unwrap();
        let e = expr_of("loop");
        assert_eq!(e.eval(&mut table).unwrap(), Some(4));
    }

    #[test]
    fn reserved_idents_reflect_mode_and_position() {
        let mut table = SymbolTable::new();
        table.set_reserved_state(0x0800_0000, false, true);
        table.set_current_address(0x0800_0010);
        assert_eq!(expr_of("_arm").eval(&mut table).unwrap(), Some(1));
        assert_eq!(expr_of("_thumb").eval(&mut table).unwrap(), Some(0));
        assert_eq!(expr_of("_base").eval(&mut table).unwrap(), Some(0x0800_0000));
        assert_eq!(expr_of("_here").eval(&mut table).unwrap(), Some(0x0800_0010));
        assert_eq!(expr_of("_bytes").eval(&mut table).unwrap(), Some(0x10));
        assert_eq!(expr_of("_pc").eval(&mut table).unwrap(), Some(0x0800_0018));
        assert_eq!(expr_of("_main").eval(&mut table).unwrap(), Some(1));

        table.set_reserved_state(0x0800_0000, true, false);
        assert_eq!(expr_of("_thumb").eval(&mut table).unwrap(), Some(1));
        assert_eq!(expr_of("_pc").eval(&mut table).unwrap(), Some(0x0800_0014));
        assert_eq!(expr_of("_main").eval(&mut table).unwrap(), Some(0));
    }

    #[test]
    fn reserved_idents_cannot_be_shadowed() {
        let mut table = SymbolTable::new();
        assert!(table.define_label("_here", 0, &pos()).is_err());
        assert!(table.define_constant("_version", vec![], Expr::Number(0), &pos()).is_err());
    }
}
