pub mod header;

use crate::error::{AsmError, AsmResult};
use crate::expr::Expr;
use crate::pos::FilePos;
use crate::symbol::SymbolTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    const fn bytes(self) -> usize {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 => 4,
        }
    }

    const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }
}

struct PendingWrite {
    offset: usize,
    width: Width,
    expr: Expr,
    pos: FilePos,
    address: u32,
    global: Option<String>,
    signed: bool,
}

/// Recomputes a whole instruction word once a forward-referenced field
/// (branch offset, rotated immediate, register-list bit...) becomes known,
/// folding it into the word that was already written as a placeholder.
type FixupFn = Box<dyn Fn(u32, i64, &FilePos) -> AsmResult<u32>>;

struct PendingFixup {
    offset: usize,
    width: Width,
    base_word: u32,
    expr: Expr,
    pos: FilePos,
    address: u32,
    global: Option<String>,
    apply: FixupFn,
}

/// Appends bytes to the output image, resolving expressions as it goes and
/// deferring anything that names a not-yet-defined label until
/// [`Emitter::finalise`] runs a fixed-point pass over everything left.
pub struct Emitter {
    pub buf: Vec<u8>,
    base_address: u32,
    pending: Vec<PendingWrite>,
    pending_fixups: Vec<PendingFixup>,
}

impl Emitter {
    #[must_use]
    pub fn new(base_address: u32) -> Self {
        Self { buf: Vec::new(), base_address, pending: Vec::new(), pending_fixups: Vec::new() }
    }

    #[must_use]
    pub const fn base_address(&self) -> u32 {
        self.base_address
    }

    #[must_use]
    pub fn current_address(&self) -> u32 {
        self.base_address + self.buf.len() as u32
    }

    pub fn write8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn align(&mut self, to: u32, fill: u8) {
        let addr = self.current_address();
        let rem = addr % to;
        if rem != 0 {
            for _ in 0..(to - rem) {
                self.write8(fill);
            }
        }
    }

    /// Emits an expression at `width`, falling back to a zero-filled
    /// placeholder plus a pending write when `symtab` can't resolve it yet.
    pub fn expr_at(
        &mut self,
        expr: Expr,
        width: Width,
        signed: bool,
        pos: FilePos,
        symtab: &mut SymbolTable,
    ) -> AsmResult<()> {
        let address = self.current_address();
        symtab.set_current_address(address);
        match expr.eval(symtab)? {
            Some(value) => self.commit(width, value, signed, &pos)?,
            None => {
                let offset = self.buf.len();
                for _ in 0..width.bytes() {
                    self.buf.push(0);
                }
                self.pending.push(PendingWrite {
                    offset,
                    width,
                    expr,
                    pos,
                    address,
                    global: symtab.current_global().map(str::to_owned),
                    signed,
                });
            }
        }
        Ok(())
    }

    fn write_word(&mut self, width: Width, word: u32) {
        match width {
            Width::W8 => self.write8(word as u8),
            Width::W16 => self.write16(word as u16),
            Width::W32 => self.write32(word),
        }
    }

    /// Writes an instruction word built from `base_word` with a field
    /// patched in by `apply` once `expr` resolves to a value. `apply`
    /// receives the still-placeholder word and the resolved value and
    /// returns the word to actually write; it runs immediately if `expr`
    /// is already resolvable, or later during [`Self::finalise`].
    pub fn word_fixup(
        &mut self,
        base_word: u32,
        width: Width,
        expr: Expr,
        pos: FilePos,
        symtab: &mut SymbolTable,
        apply: impl Fn(u32, i64, &FilePos) -> AsmResult<u32> + 'static,
    ) -> AsmResult<()> {
        let address = self.current_address();
        symtab.set_current_address(address);
        match expr.eval(symtab)? {
            Some(value) => {
                let word = apply(base_word, value, &pos)?;
                self.write_word(width, word);
            }
            None => {
                let offset = self.buf.len();
                self.write_word(width, base_word);
                self.pending_fixups.push(PendingFixup {
                    offset,
                    width,
                    base_word,
                    expr,
                    pos,
                    address,
                    global: symtab.current_global().map(str::to_owned),
                    apply: Box::new(apply),
                });
            }
        }
        Ok(())
    }

    fn commit(&mut self, width: Width, value: i64, signed: bool, pos: &FilePos) -> AsmResult<()> {
        check_range(value, width, signed, pos)?;
        let bytes = (value as i128 as u128).to_le_bytes();
        let at = self.buf.len() - width.bytes();
        self.buf[at..at + width.bytes()].copy_from_slice(&bytes[..width.bytes()]);
        Ok(())
    }

    fn patch(&mut self, offset: usize, width: Width, value: i64, signed: bool, pos: &FilePos) -> AsmResult<()> {
        check_range(value, width, signed, pos)?;
        let bytes = (value as i128 as u128).to_le_bytes();
        self.buf[offset..offset + width.bytes()].copy_from_slice(&bytes[..width.bytes()]);
        Ok(())
    }

    /// Runs pending writes to a fixed point: each pass may resolve
    /// references that only became known because a later write in the same
    /// pass defined a label, so passes repeat until nothing changes.
    /// Whatever is still outstanding after that is reported as
    /// [`AsmError::UnresolvedReference`].
    pub fn finalise(&mut self, symtab: &mut SymbolTable) -> AsmResult<()> {
        loop {
            let before = self.pending.len() + self.pending_fixups.len();

            let mut still_pending = Vec::new();
            for mut p in std::mem::take(&mut self.pending) {
                symtab.set_current_address(p.address);
                symtab.set_current_global(p.global.take());
                match p.expr.eval(symtab)? {
                    Some(value) => self.patch(p.offset, p.width, value, p.signed, &p.pos)?,
                    None => still_pending.push(p),
                }
            }
            self.pending = still_pending;

            let mut still_fixups = Vec::new();
            for mut p in std::mem::take(&mut self.pending_fixups) {
                symtab.set_current_address(p.address);
                symtab.set_current_global(p.global.take());
                match p.expr.eval(symtab)? {
                    Some(value) => {
                        let word = (p.apply)(p.base_word, value, &p.pos)?;
                        self.patch_word(p.offset, p.width, word);
                    }
                    None => still_fixups.push(p),
                }
            }
            self.pending_fixups = still_fixups;

            let remaining = self.pending.len() + self.pending_fixups.len();
            if remaining == 0 {
                return Ok(());
            }
            if remaining == before {
                if let Some(p) = self.pending.first() {
                    return Err(AsmError::UnresolvedReference {
                        pos: p.pos.clone(),
                        name: describe_expr(&p.expr),
                    });
                }
                let p = &self.pending_fixups[0];
                return Err(AsmError::UnresolvedReference {
                    pos: p.pos.clone(),
                    name: describe_expr(&p.expr),
                });
            }
        }
    }

    fn patch_word(&mut self, offset: usize, width: Width, word: u32) {
        let bytes = word.to_le_bytes();
        self.buf[offset..offset + width.bytes()].copy_from_slice(&bytes[..width.bytes()]);
    }
}

/// A value fits a directive-emitted width if it is representable either as
/// an unsigned or as a two's complement signed quantity of that width; the
/// `signed` flag only narrows this for callers (like branch encoders) that
/// know their field is exclusively one or the other.
fn check_range(value: i64, width: Width, signed: bool, pos: &FilePos) -> AsmResult<()> {
    let bits = width.bits();
    let signed_lo = -(1i64 << (bits - 1));
    let signed_hi = (1i64 << (bits - 1)) - 1;
    let unsigned_hi = (1i64 << bits) - 1;
    let ok = if signed {
        (signed_lo..=signed_hi).contains(&value)
    } else {
        (0..=unsigned_hi).contains(&value) || (signed_lo..=signed_hi).contains(&value)
    };
    if ok {
        Ok(())
    } else {
        Err(AsmError::ValueOutOfRange { pos: pos.clone(), value, bits })
    }
}

fn describe_expr(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        _ => "expression".to_string(),
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
    fn immediate_values_commit_right_away() {
        let mut e = Emitter::new(0x0800_0000);
        let mut symtab = SymbolTable::new();
        e.expr_at(expr_of("0x1234"), Width::W16, false, pos(), &mut symtab).unwrap();
        assert_eq!(e.buf, vec![0x34, 0x12]);
    }

    #[test]
    fn forward_reference_resolves_at_finalise() {
        let mut e = Emitter::new(0);
        let mut symtab = SymbolTable::new();
        e.expr_at(expr_of("target"), Width::W32, false, pos(), &mut symtab).unwrap();
        symtab.define_label("target", 0xDEAD_BEEF, &pos()).unwrap();
        e.finalise(&mut symtab).unwrap();
        assert_eq!(e.buf, 0xDEAD_BEEFu32.to_le_bytes());
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let mut e = Emitter::new(0);
        let mut symtab = SymbolTable::new();
        e.expr_at(expr_of("missing"), Width::W32, false, pos(), &mut symtab).unwrap();
        assert!(e.finalise(&mut symtab).is_err());
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let mut e = Emitter::new(0);
        let mut symtab = SymbolTable::new();
        let err = e.expr_at(expr_of("256"), Width::W8, false, pos(), &mut symtab);
        assert!(err.is_err());
    }

    #[test]
    fn align_pads_to_boundary() {
        let mut e = Emitter::new(0);
        e.write8(1);
        e.align(4, 0);
        assert_eq!(e.buf, vec![1, 0, 0, 0]);
    }
}
