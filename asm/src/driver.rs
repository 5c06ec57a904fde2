use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::directive::{self, DirectiveOutcome, Mode};
use crate::emit::{Emitter, Width};
use crate::encoder::condition::Condition;
use crate::encoder::operand::Cursor;
use crate::encoder::{arm, thumb};
use crate::error::{AsmError, AsmResult, Diagnostic, ErrorPolicy};
use crate::expr::Expr;
use crate::import::{ImportArena, ImportKind};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::pos::FilePos;
use crate::script::{BuiltinScriptEngine, ScriptEngine, ScriptValue};
use crate::symbol::SymbolTable;

/// Abstracts away the filesystem so `.include`/`.import`/`.embed` (and the
/// top-level entry point) can be driven from an in-memory fixture in tests,
/// and so the watch coordinator can later swap in a caching reader without
/// the statement loop itself changing.
pub trait SourceReader {
    fn read_to_string(&self, path: &Path) -> AsmResult<String>;
    fn read_bytes(&self, path: &Path) -> AsmResult<Vec<u8>>;
}

/// The real reader, used by the CLI binary.
#[derive(Default)]
pub struct FsReader;

impl SourceReader for FsReader {
    fn read_to_string(&self, path: &Path) -> AsmResult<String> {
        std::fs::read_to_string(path).map_err(|source| AsmError::Io { path: path.to_path_buf(), source })
    }

    fn read_bytes(&self, path: &Path) -> AsmResult<Vec<u8>> {
        std::fs::read(path).map_err(|source| AsmError::Io { path: path.to_path_buf(), source })
    }
}

/// What kind of block a bare `.end` (or a closing `}`) is closing, so the
/// directive layer doesn't need to tell `.if` and `.script` apart itself.
enum ScopeKind {
    Brace,
    Begin,
    If,
    Script,
}

/// One `ldr rd, =expr` waiting to be materialised by `.pool` (or by the
/// automatic flush at end of file).
struct PoolEntry {
    symbol: String,
    value: Expr,
    pos: FilePos,
}

/// Whether the branch of an `.if`/`.elseif`/`.else` currently open is the one
/// being assembled, and whether any branch in this chain has fired yet (so a
/// later `.elseif`/`.else` knows to stay closed once one has matched).
struct CondFrame {
    active: bool,
    matched: bool,
}

/// Drives one top-level assembly: walks the token stream of a root file,
/// recursing into `.include`/`.import`, emitting bytes through a single
/// [`Emitter`] and resolving names through a single [`SymbolTable`]. Mirrors
/// the ownership rule from the concurrency model: everything here is
/// single-threaded and there is exactly one byte emitter for the whole
/// build.
pub struct Driver<'r> {
    reader: &'r dyn SourceReader,
    pub symtab: SymbolTable,
    pub emitter: Emitter,
    mode: Mode,
    mode_stack: Vec<Mode>,
    scope_kinds: Vec<ScopeKind>,
    cond_stack: Vec<CondFrame>,
    imports: ImportArena,
    completed_includes: HashSet<PathBuf>,
    pool: Vec<PoolEntry>,
    pool_seq: usize,
    script_stack: Vec<BuiltinScriptEngine>,
    pub diagnostics: Vec<Diagnostic>,
    policy: ErrorPolicy,
}

impl<'r> Driver<'r> {
    #[must_use]
    pub fn new(reader: &'r dyn SourceReader, base_address: u32, policy: ErrorPolicy) -> Self {
        Self {
            reader,
            symtab: SymbolTable::new(),
            emitter: Emitter::new(base_address),
            mode: Mode::Arm,
            mode_stack: Vec::new(),
            scope_kinds: Vec::new(),
            cond_stack: Vec::new(),
            imports: ImportArena::new(),
            completed_includes: HashSet::new(),
            pool: Vec::new(),
            pool_seq: 0,
            script_stack: Vec::new(),
            diagnostics: Vec::new(),
            policy,
        }
    }

    /// Binds each `--define KEY=VALUE` pair as a zero-parameter constant in
    /// the root scope before anything is read, so the first pass already
    /// sees them the same way a `.def` earlier in the file would produce.
    pub fn with_defines(mut self, defines: &[(String, i64)]) -> AsmResult<Self> {
        let pos = FilePos::start_of(self.imports.root_file("<command line>"));
        for (key, value) in defines {
            self.symtab.define_constant(key, Vec::new(), Expr::Number(*value), &pos)?;
        }
        Ok(self)
    }

    /// Assembles `path` as the root file and returns the final byte image.
    pub fn assemble(&mut self, path: &Path) -> AsmResult<Vec<u8>> {
        self.run_file(path, None)?;
        self.flush_pool(&FilePos::start_of(self.imports.root_file("<eof>")))?;
        self.emitter.finalise(&mut self.symtab)?;
        Ok(std::mem::take(&mut self.emitter.buf))
    }

    /// Every file actually read while assembling, entry point included. The
    /// watch coordinator records each of these as a dependency of the entry
    /// file so a change to any of them is known to require a full rebuild.
    #[must_use]
    pub fn read_paths(&self) -> Vec<PathBuf> {
        self.completed_includes.iter().cloned().collect()
    }

    fn run_file(&mut self, path: &Path, parent: Option<crate::import::ImportId>) -> AsmResult<()> {
        let file: std::rc::Rc<str> = std::rc::Rc::from(path.to_string_lossy().as_ref());
        let src = self.reader.read_to_string(path)?;
        let tokens = Lexer::new(file, &src).tokenize_all()?;
        self.run_statements(&tokens, path, parent)?;
        self.completed_includes.insert(path.to_path_buf());
        Ok(())
    }

    /// Runs one file's worth of already-lexed tokens, grouped into
    /// newline-terminated statements.
    fn run_statements(
        &mut self,
        tokens: &[Token],
        current_path: &Path,
        parent: Option<crate::import::ImportId>,
    ) -> AsmResult<()> {
        let mut i = 0;
        'statements: while i < tokens.len() {
            while matches!(tokens[i].kind, TokenKind::Newline) {
                i += 1;
                if i >= tokens.len() {
                    break 'statements;
                }
            }
            if tokens[i].kind == TokenKind::Eof {
                break;
            }
            let start = i;
            while !matches!(tokens[i].kind, TokenKind::Newline | TokenKind::Eof) {
                i += 1;
            }
            let stmt = &tokens[start..i];

            let outcome = self.run_statement(stmt, current_path, parent);
            match outcome {
                Ok(ControlFlow::Continue) => {}
                Ok(ControlFlow::StopFile) => break 'statements,
                Err(err) => {
                    self.diagnostics.push(Diagnostic::from_error(&err));
                    if self.policy == ErrorPolicy::Abort {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn suppressed(&self) -> bool {
        self.cond_stack.iter().any(|f| !f.active)
    }

    fn run_statement(
        &mut self,
        stmt: &[Token],
        current_path: &Path,
        parent: Option<crate::import::ImportId>,
    ) -> AsmResult<ControlFlow> {
        if stmt.is_empty() {
            return Ok(ControlFlow::Continue);
        }

        self.symtab.set_reserved_state(
            self.emitter.base_address(),
            self.mode == Mode::Thumb,
            parent.is_none(),
        );
        self.symtab.set_current_address(self.emitter.current_address());

        // `{` / `}` push and pop a scope regardless of whether the current
        // branch is suppressed, so nesting depth tracking stays correct.
        if stmt.len() == 1 && stmt[0].kind == TokenKind::LBrace {
            self.symtab.push_scope();
            self.mode_stack.push(self.mode);
            self.scope_kinds.push(ScopeKind::Brace);
            return Ok(ControlFlow::Continue);
        }
        if stmt.len() == 1 && stmt[0].kind == TokenKind::RBrace {
            self.close_scope(&stmt[0].pos)?;
            return Ok(ControlFlow::Continue);
        }

        // `.begin`/`.end` are a directive-spelled, hierarchical pair of the
        // same scope `{ }` pushes/pops; both are intercepted here, ahead of
        // the suppression check below, so nesting depth stays correct for
        // scopes opened or closed inside a suppressed `.if` branch.
        if let TokenKind::Directive(name) = &stmt[0].kind {
            if name == "begin" || name == "if" || name == "elseif" || name == "else" || name == "end" {
                let _ = (current_path, parent);
                return self.run_conditional_directive(name, stmt);
            }
        }

        if self.suppressed() {
            return Ok(ControlFlow::Continue);
        }

        // Inside `.script … .end`, the body is opaque to the assembler
        // proper: only the built-in engine's `export NAME = expr` form is
        // understood here (see `script.rs`).
        if matches!(self.scope_kinds.last(), Some(ScopeKind::Script)) {
            return self.run_script_statement(stmt, &stmt[0].pos);
        }

        // `label:` — a bare identifier followed by a colon defines a label
        // at the current address; `@@name:` is local to the innermost
        // enclosing `.begin`/`.end`, everything else is global.
        if let TokenKind::Ident(name) = &stmt[0].kind {
            if stmt.len() == 2 && stmt[1].kind == TokenKind::Colon {
                if let Some(local) = name.strip_prefix("@@") {
                    self.symtab.define_local_label(local, self.emitter.current_address(), &stmt[0].pos)?;
                } else {
                    self.symtab.define_label(name, self.emitter.current_address(), &stmt[0].pos)?;
                }
                return Ok(ControlFlow::Continue);
            }
        }

        // A statement that is nothing but a run of `+` or a run of `-`
        // tokens defines an anonymous label at the current address, rather
        // than evaluating as an expression statement.
        if let TokenKind::Op(sign @ ("+" | "-")) = &stmt[0].kind {
            if stmt.iter().all(|t| t.kind == TokenKind::Op(sign)) {
                self.symtab.define_anonymous_label(self.emitter.current_address());
                return Ok(ControlFlow::Continue);
            }
        }

        // `bx.eq` — the dotted mnemonic form. `.` only opens a `Directive`
        // token at the start of a line, so mid-line it lexes as `Ident`,
        // `Op(".")`, `Ident`; fuse the three back into one mnemonic before
        // dispatch so `split_mnemonic` sees the same string `bxeq` would
        // produce.
        if let TokenKind::Ident(name) = &stmt[0].kind {
            if stmt.len() >= 3 && stmt[1].kind == TokenKind::Op(".") {
                if let TokenKind::Ident(suffix) = &stmt[2].kind {
                    let fused = format!("{name}{suffix}");
                    return self.run_instruction(fused, &stmt[0].pos, &stmt[3..]);
                }
            }
        }

        match &stmt[0].kind {
            TokenKind::Directive(name) => self.run_directive(name.clone(), &stmt[0].pos, &stmt[1..], current_path, parent),
            TokenKind::Ident(name) => self.run_instruction(name.clone(), &stmt[0].pos, &stmt[1..]),
            other => Err(AsmError::UnexpectedToken {
                pos: stmt[0].pos.clone(),
                expected: "a label, directive or instruction".to_string(),
                found: format!("{other:?}"),
            }),
        }
    }

    fn close_scope(&mut self, pos: &FilePos) -> AsmResult<()> {
        self.symtab.pop_scope(pos)?;
        if let Some(mode) = self.mode_stack.pop() {
            self.mode = mode;
        }
        self.scope_kinds.pop();
        Ok(())
    }

    fn run_conditional_directive(&mut self, name: &str, stmt: &[Token]) -> AsmResult<ControlFlow> {
        let pos = stmt[0].pos.clone();
        let mut cur = Cursor::new(&stmt[1..]);
        match name {
            "begin" => {
                self.symtab.push_scope();
                self.mode_stack.push(self.mode);
                self.scope_kinds.push(ScopeKind::Begin);
                Ok(ControlFlow::Continue)
            }
            "if" => {
                let parent_active = !self.suppressed();
                let taken = parent_active && Self::eval_condition(&mut cur, &pos, &mut self.symtab)?;
                self.cond_stack.push(CondFrame { active: taken, matched: taken });
                self.symtab.push_scope();
                self.mode_stack.push(self.mode);
                self.scope_kinds.push(ScopeKind::If);
                Ok(ControlFlow::Continue)
            }
            "elseif" => {
                let frame = self.cond_stack.last_mut().ok_or_else(|| AsmError::DirectiveError {
                    pos: pos.clone(),
                    message: ".elseif with no open .if".to_string(),
                })?;
                let parent_active = self.cond_stack.len() < 2 || self.cond_stack[..self.cond_stack.len() - 1].iter().all(|f| f.active);
                let take = parent_active && !frame.matched && Self::eval_condition(&mut cur, &pos, &mut self.symtab)?;
                frame.active = take;
                if take {
                    frame.matched = true;
                }
                Ok(ControlFlow::Continue)
            }
            "else" => {
                let frame = self.cond_stack.last_mut().ok_or_else(|| AsmError::DirectiveError {
                    pos: pos.clone(),
                    message: ".else with no open .if".to_string(),
                })?;
                let parent_active = self.cond_stack.len() < 2 || self.cond_stack[..self.cond_stack.len() - 1].iter().all(|f| f.active);
                frame.active = parent_active && !frame.matched;
                if frame.active {
                    frame.matched = true;
                }
                Ok(ControlFlow::Continue)
            }
            "end" => {
                // `.end` closes whatever is innermost: a `.script` block, an
                // `.if` chain, or a `.begin`. Plain `{ }` scopes are closed by
                // `}`, not `.end`.
                match self.scope_kinds.last() {
                    Some(ScopeKind::Script) => {
                        self.scope_kinds.pop();
                        let engine = self.script_stack.pop().expect(".script scope with no matching engine");
                        for (name, value) in engine.exports() {
                            if let Some(n) = value.as_number() {
                                self.symtab.define_constant(name, Vec::new(), Expr::Number(n), &pos)?;
                            }
                        }
                        Ok(ControlFlow::Continue)
                    }
                    Some(ScopeKind::If) => {
                        self.cond_stack.pop();
                        self.close_scope(&pos)?;
                        Ok(ControlFlow::Continue)
                    }
                    Some(ScopeKind::Begin) => {
                        self.close_scope(&pos)?;
                        Ok(ControlFlow::Continue)
                    }
                    _ => Err(AsmError::DirectiveError { pos, message: "stray .end".to_string() }),
                }
            }
            _ => unreachable!(),
        }
    }

    /// Parses and runs one `export NAME = expr` line inside a `.script`
    /// block, binding the result into that block's engine rather than the
    /// symbol table directly — the exports only reach the current scope once
    /// `.end` closes the block (see `run_directive`'s `ScopeKind::Script`
    /// case).
    fn run_script_statement(&mut self, stmt: &[Token], pos: &FilePos) -> AsmResult<ControlFlow> {
        let mut cur = Cursor::new(stmt);
        let TokenKind::Ident(head) = cur.peek().clone() else {
            return Err(AsmError::UnexpectedToken {
                pos: pos.clone(),
                expected: "export NAME = expr".to_string(),
                found: format!("{:?}", cur.peek()),
            });
        };
        if head != "export" {
            return Err(AsmError::UnexpectedToken { pos: pos.clone(), expected: "export NAME = expr".to_string(), found: head });
        }
        cur.bump();
        let TokenKind::Ident(name) = cur.peek().clone() else {
            return Err(AsmError::UnexpectedToken {
                pos: pos.clone(),
                expected: "an identifier".to_string(),
                found: format!("{:?}", cur.peek()),
            });
        };
        cur.bump();
        cur.expect_kind(&TokenKind::Op("="))?;
        let expr = cur.parse_expr()?;
        let value = expr.eval(&mut self.symtab)?.ok_or_else(|| AsmError::DirectiveError {
            pos: pos.clone(),
            message: "script exports must resolve during the initial pass".to_string(),
        })?;
        let engine = self.script_stack.last_mut().expect("script statement outside a .script block");
        engine.export(name, ScriptValue::Number(value));
        Ok(ControlFlow::Continue)
    }

    fn eval_condition(cur: &mut Cursor, pos: &FilePos, symtab: &mut SymbolTable) -> AsmResult<bool> {
        let expr = cur.parse_expr()?;
        let value = expr.eval(symtab)?.ok_or_else(|| AsmError::DirectiveError {
            pos: pos.clone(),
            message: ".if/.elseif conditions must resolve during the initial pass".to_string(),
        })?;
        Ok(value != 0)
    }

    fn run_directive(
        &mut self,
        name: String,
        pos: &FilePos,
        rest: &[Token],
        current_path: &Path,
        parent: Option<crate::import::ImportId>,
    ) -> AsmResult<ControlFlow> {
        let mut cur = Cursor::new(rest);
        let outcome = directive::dispatch(&name, &mut cur, pos, &mut self.symtab, &mut self.emitter)?;
        match outcome {
            DirectiveOutcome::Handled => Ok(ControlFlow::Continue),
            DirectiveOutcome::SetMode(mode) => {
                self.mode = mode;
                Ok(ControlFlow::Continue)
            }
            DirectiveOutcome::SetBase(addr) => {
                if self.emitter.buf.is_empty() {
                    self.emitter = Emitter::new(addr);
                } else {
                    return Err(AsmError::DirectiveError {
                        pos: pos.clone(),
                        message: ".base must appear before any bytes are emitted".to_string(),
                    });
                }
                Ok(ControlFlow::Continue)
            }
            DirectiveOutcome::If(..) | DirectiveOutcome::Elseif(..) | DirectiveOutcome::Else | DirectiveOutcome::EndIf => {
                unreachable!("conditional directives are intercepted before dispatch")
            }
            DirectiveOutcome::Include { path, once, pos: at } => {
                self.run_include(&path, once, current_path, parent, &at)?;
                Ok(ControlFlow::Continue)
            }
            DirectiveOutcome::Import { path, names, pos: at } => {
                self.run_import(&path, &names, current_path, parent, &at)?;
                Ok(ControlFlow::Continue)
            }
            DirectiveOutcome::Embed { path, pos: at } => {
                let resolved = resolve_relative(current_path, &path);
                let bytes = self.reader.read_bytes(&resolved).map_err(|_| AsmError::Io {
                    path: resolved.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "embed target missing"),
                })?;
                self.imports.add(&resolved, ImportKind::Embed, parent, false, &at)?;
                self.emitter.write_bytes(&bytes);
                Ok(ControlFlow::Continue)
            }
            DirectiveOutcome::Logo { path, pos: at } => {
                let resolved = resolve_relative(current_path, &path);
                let bytes = self.reader.read_bytes(&resolved).map_err(|_| AsmError::Io {
                    path: resolved.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "logo file missing"),
                })?;
                self.imports.add(&resolved, ImportKind::Embed, parent, false, &at)?;
                directive::apply_logo(&bytes, &at, &mut self.emitter)?;
                Ok(ControlFlow::Continue)
            }
            DirectiveOutcome::ScriptBegin => {
                self.scope_kinds.push(ScopeKind::Script);
                self.script_stack.push(BuiltinScriptEngine::new());
                Ok(ControlFlow::Continue)
            }
            DirectiveOutcome::Pool => {
                self.flush_pool(pos)?;
                Ok(ControlFlow::Continue)
            }
            DirectiveOutcome::Once => {
                if self.completed_includes.contains(current_path) {
                    Ok(ControlFlow::StopFile)
                } else {
                    Ok(ControlFlow::Continue)
                }
            }
            DirectiveOutcome::Printf(fmt, args, at) => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    let v = a.eval(&mut self.symtab)?.ok_or_else(|| AsmError::DirectiveError {
                        pos: at.clone(),
                        message: ".printf arguments must resolve during the initial pass".to_string(),
                    })?;
                    values.push(v);
                }
                println!("{}", directive::format_printf(&fmt, &values, &at)?);
                Ok(ControlFlow::Continue)
            }
            DirectiveOutcome::Error(message, at) => Err(AsmError::DirectiveError { pos: at, message }),
        }
    }

    fn run_include(
        &mut self,
        path: &str,
        once: bool,
        current_path: &Path,
        parent: Option<crate::import::ImportId>,
        at: &FilePos,
    ) -> AsmResult<()> {
        let resolved = resolve_relative(current_path, path);
        let Some(id) = self.imports.add(&resolved, ImportKind::Include, parent, once, at)? else {
            return Ok(());
        };
        self.run_file(&resolved, Some(id))
    }

    /// `.import "path"` runs the target once (cached by path, like every
    /// other import of the same file) and leaves its top-level scope visible
    /// alongside the importer's own. `.import "path" { name1, name2 }` adds
    /// a check on top: after the target has run, every listed name must
    /// actually resolve, so a typo or a name the target never defines is
    /// caught at the `.import` site instead of wherever it's later used.
    fn run_import(&mut self, path: &str, names: &[String], current_path: &Path, parent: Option<crate::import::ImportId>, at: &FilePos) -> AsmResult<()> {
        let resolved = resolve_relative(current_path, path);
        let Some(id) = self.imports.add(&resolved, ImportKind::Import, parent, false, at)? else {
            return self.check_imported_names(names, path, at);
        };
        if self.completed_includes.contains(&resolved) {
            return self.check_imported_names(names, path, at);
        }
        self.run_file(&resolved, Some(id))?;
        self.check_imported_names(names, path, at)
    }

    fn check_imported_names(&self, names: &[String], path: &str, at: &FilePos) -> AsmResult<()> {
        for name in names {
            if !self.symtab.is_defined(name) {
                return Err(AsmError::DirectiveError {
                    pos: at.clone(),
                    message: format!("`.import \"{path}\"` does not define `{name}`"),
                });
            }
        }
        Ok(())
    }

    fn run_instruction(&mut self, mnemonic: String, pos: &FilePos, rest: &[Token]) -> AsmResult<ControlFlow> {
        if let Some(outcome) = self.try_literal_pool(&mnemonic, pos, rest)? {
            return Ok(outcome);
        }
        let handled = match self.mode {
            Mode::Arm => arm::encode(&mnemonic, rest, pos, &mut self.symtab, &mut self.emitter)?,
            Mode::Thumb => thumb::encode(&mnemonic, rest, pos, &mut self.symtab, &mut self.emitter)?,
        };
        if handled {
            Ok(ControlFlow::Continue)
        } else {
            Err(AsmError::UnknownMnemonic { pos: pos.clone(), mnemonic })
        }
    }

    /// Recognises `ldr rd, =expr` (the literal-pool pseudo-instruction)
    /// ahead of the normal operand-addressing encoder, since `[ ]`-style
    /// addressing never accepts a bare `=`. The value is queued for `.pool`
    /// (or the automatic end-of-file flush) and the load itself is emitted
    /// here as a direct PC-relative fetch, computed the same way a forward
    /// branch is: as a `word_fixup` whose `apply` closure only runs once the
    /// pool entry's address is known.
    fn try_literal_pool(&mut self, mnemonic: &str, pos: &FilePos, rest: &[Token]) -> AsmResult<Option<ControlFlow>> {
        if !mnemonic.eq_ignore_ascii_case("ldr") {
            return Ok(None);
        }
        let eq_idx = rest.iter().position(|t| t.kind == TokenKind::Op("="));
        let Some(eq_idx) = eq_idx else { return Ok(None) };
        if eq_idx == 0 || rest[eq_idx - 1].kind != TokenKind::Comma {
            return Ok(None);
        }

        let mut rd_cur = Cursor::new(&rest[..eq_idx - 1]);
        let rd = rd_cur.expect_register()?;
        let mut value_cur = Cursor::new(&rest[eq_idx + 1..]);
        let value = value_cur.parse_expr()?;

        let symbol = format!("__pool{}", self.pool_seq);
        self.pool_seq += 1;
        let symbol_expr = Expr::Ident(symbol.clone());
        self.pool.push(PoolEntry { symbol, value, pos: pos.clone() });

        match self.mode {
            Mode::Arm => self.emit_arm_pool_load(rd.0, symbol_expr, pos)?,
            Mode::Thumb => self.emit_thumb_pool_load(rd.0, symbol_expr, pos)?,
        }
        Ok(Some(ControlFlow::Continue))
    }

    fn emit_arm_pool_load(&mut self, rd: u8, symbol_expr: Expr, pos: &FilePos) -> AsmResult<()> {
        let instr_addr = i64::from(self.emitter.current_address());
        let base_word = (Condition::Always.value() << 28) | (0b01 << 26) | (1 << 24) | (1 << 20) | (15 << 16) | (u32::from(rd) << 12);
        self.emitter.word_fixup(base_word, Width::W32, symbol_expr, pos.clone(), &mut self.symtab, move |word, target, p| {
            let delta = target - (instr_addr + 8);
            let offset = delta.unsigned_abs();
            if offset > 0xFFF {
                return Err(AsmError::ValueOutOfRange { pos: p.clone(), value: delta, bits: 12 });
            }
            let up = u32::from(delta >= 0) << 23;
            Ok((word & !(1 << 23)) | up | offset as u32)
        })
    }

    fn emit_thumb_pool_load(&mut self, rd: u8, symbol_expr: Expr, pos: &FilePos) -> AsmResult<()> {
        let instr_addr = i64::from(self.emitter.current_address());
        let base_word = 0b0100_1000_0000_0000u32 | (u32::from(rd) << 8);
        self.emitter.word_fixup(base_word, Width::W16, symbol_expr, pos.clone(), &mut self.symtab, move |word, target, p| {
            let base = (instr_addr + 4) & !0b11;
            let delta = target - base;
            if delta < 0 || delta % 4 != 0 || delta / 4 > 0xFF {
                return Err(AsmError::ValueOutOfRange { pos: p.clone(), value: delta, bits: 8 });
            }
            Ok(word | (delta / 4) as u32)
        })
    }

    fn flush_pool(&mut self, pos: &FilePos) -> AsmResult<()> {
        self.emitter.align(4, 0);
        for entry in std::mem::take(&mut self.pool) {
            self.symtab.define_label(&entry.symbol, self.emitter.current_address(), &entry.pos)?;
            self.emitter.expr_at(entry.value, Width::W32, false, entry.pos, &mut self.symtab)?;
        }
        let _ = pos;
        Ok(())
    }
}

enum ControlFlow {
    Continue,
    StopFile,
}

fn resolve_relative(current_file: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    current_file.parent().map_or_else(|| target.to_path_buf(), |dir| dir.join(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FixtureReader {
        files: RefCell<HashMap<PathBuf, String>>,
    }

    impl FixtureReader {
        fn new(files: &[(&str, &str)]) -> Self {
            let map = files.iter().map(|(p, s)| (PathBuf::from(p), (*s).to_string())).collect();
            Self { files: RefCell::new(map) }
        }
    }

    impl SourceReader for FixtureReader {
        fn read_to_string(&self, path: &Path) -> AsmResult<String> {
            self.files.borrow().get(path).cloned().ok_or_else(|| AsmError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            })
        }

        fn read_bytes(&self, path: &Path) -> AsmResult<Vec<u8>> {
            self.read_to_string(path).map(String::into_bytes)
        }
    }

    #[test]
    fn assembles_straight_line_arm_code() {
        let reader = FixtureReader::new(&[("main.s", "mov r0, #1\nadd r1, r0, r0\nbx lr\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn labels_resolve_across_a_forward_branch() {
        let reader = FixtureReader::new(&[("main.s", "b target\nmov r0, #0\ntarget:\nbx lr\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn include_splices_a_second_file_in_place() {
        let reader = FixtureReader::new(&[
            ("main.s", ".include \"sub.s\"\nbx lr\n"),
            ("sub.s", "mov r0, #1\n"),
        ]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn unknown_mnemonic_is_reported() {
        let reader = FixtureReader::new(&[("main.s", "frobnicate r0\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        assert!(driver.assemble(Path::new("main.s")).is_err());
    }

    #[test]
    fn ldr_literal_materialises_a_pool_entry() {
        let reader = FixtureReader::new(&[("main.s", "ldr r0, =0x12345678\nbx lr\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert!(bytes.len() >= 8);
    }

    #[test]
    fn local_label_is_scoped_to_its_enclosing_global() {
        // `@@loop` resolves through the symbol table's
        // `{global}@@{name}` namespacing, so the same local name can be
        // reused under each enclosing global label without colliding.
        let reader = FixtureReader::new(&[(
            "main.s",
            "first:\nb @@loop\n@@loop:\nbx lr\nsecond:\nb @@loop\n@@loop:\nbx lr\n",
        )]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn command_line_defines_are_visible_to_the_first_pass() {
        let reader = FixtureReader::new(&[("main.s", "mov r0, #TILE_COUNT\nbx lr\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort)
            .with_defines(&[("TILE_COUNT".to_string(), 7)])
            .unwrap();
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn conditional_directive_skips_its_false_branch() {
        let reader = FixtureReader::new(&[("main.s", ".if 0\nbx lr\n.else\nmov r0, #1\n.end\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 4);
    }

    #[test]
    fn script_exports_are_visible_to_assembly_after_end() {
        let reader = FixtureReader::new(&[(
            "main.s",
            ".script\nexport TILE_COUNT = 3 + 4\n.end\nmov r0, #TILE_COUNT\nbx lr\n",
        )]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn script_exports_are_invisible_before_the_block_closes() {
        let reader = FixtureReader::new(&[("main.s", "mov r0, #TILE_COUNT\n.script\nexport TILE_COUNT = 7\n.end\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        assert!(driver.assemble(Path::new("main.s")).is_err());
    }

    #[test]
    fn begin_end_scopes_a_local_constant() {
        let reader = FixtureReader::new(&[("main.s", ".begin\n.def LOCAL=5\nmov r0, #LOCAL\n.end\nbx lr\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn constant_defined_inside_begin_end_does_not_escape() {
        let reader = FixtureReader::new(&[("main.s", ".begin\n.def LOCAL=5\n.end\nmov r0, #LOCAL\nbx lr\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        assert!(driver.assemble(Path::new("main.s")).is_err());
    }

    #[test]
    fn stray_end_without_begin_is_an_error() {
        let reader = FixtureReader::new(&[("main.s", ".end\nbx lr\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        assert!(driver.assemble(Path::new("main.s")).is_err());
    }

    #[test]
    fn dotted_mnemonic_form_parses_as_condition_suffix() {
        let reader = FixtureReader::new(&[("main.s", "bx.eq lr\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        let plain_reader = FixtureReader::new(&[("main.s", "bxeq lr\n")]);
        let mut plain_driver = Driver::new(&plain_reader, 0x0800_0000, ErrorPolicy::Abort);
        let plain_bytes = plain_driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes, plain_bytes);
    }

    #[test]
    fn anonymous_label_resolves_to_the_nearest_matching_run() {
        let reader = FixtureReader::new(&[("main.s", "-\nbx lr\nb -\n")]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn named_import_accepts_a_name_the_target_actually_defines() {
        let reader = FixtureReader::new(&[
            ("main.s", ".import \"shared.s\" { TILE_COUNT }\nmov r0, #TILE_COUNT\nbx lr\n"),
            ("shared.s", ".def TILE_COUNT=7\n"),
        ]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        let bytes = driver.assemble(Path::new("main.s")).unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn named_import_rejects_a_name_the_target_never_defines() {
        let reader = FixtureReader::new(&[
            ("main.s", ".import \"shared.s\" { MISSING }\nbx lr\n"),
            ("shared.s", ".def TILE_COUNT=7\n"),
        ]);
        let mut driver = Driver::new(&reader, 0x0800_0000, ErrorPolicy::Abort);
        assert!(driver.assemble(Path::new("main.s")).is_err());
    }
}
