use crate::error::{AsmError, AsmResult};
use crate::expr::{parse_expr, Expr};
use crate::lexer::{Token, TokenKind};
use crate::pos::FilePos;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

impl Reg {
    /// Renders the register the way `register_number` parses it back:
    /// `sp`/`lr`/`pc` for 13-15, `rN` otherwise. Shared by the disassembler
    /// so both directions agree on register names without a second table.
    #[must_use]
    pub fn name(self) -> String {
        match self.0 {
            13 => "sp".to_string(),
            14 => "lr".to_string(),
            15 => "pc".to_string(),
            n => format!("r{n}"),
        }
    }
}

#[must_use]
pub fn register_number(name: &str) -> Option<u8> {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "sp" => return Some(13),
        "lr" => return Some(14),
        "pc" => return Some(15),
        "fp" => return Some(11),
        "ip" => return Some(12),
        _ => {}
    }
    let digits = lower.strip_prefix('r')?;
    let n: u8 = digits.parse().ok()?;
    (n < 16).then_some(n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
    Rrx,
}

#[must_use]
pub fn shift_kind(name: &str) -> Option<ShiftKind> {
    Some(match name.to_ascii_lowercase().as_str() {
        "lsl" => ShiftKind::Lsl,
        "lsr" => ShiftKind::Lsr,
        "asr" => ShiftKind::Asr,
        "ror" => ShiftKind::Ror,
        "rrx" => ShiftKind::Rrx,
        _ => return None,
    })
}

impl ShiftKind {
    #[must_use]
    pub const fn encoding(self) -> u32 {
        match self {
            Self::Lsl => 0b00,
            Self::Lsr => 0b01,
            Self::Asr => 0b10,
            Self::Ror | Self::Rrx => 0b11,
        }
    }

    /// Inverse of `encoding`; `Rrx` is encoded identically to `Ror` (the
    /// immediate-zero case distinguishes them at the caller), so the decode
    /// direction always yields `Ror` and the disassembler spells out `rrx`
    /// itself when the amount field is zero.
    #[must_use]
    pub const fn from_encoding(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => Self::Lsl,
            0b01 => Self::Lsr,
            0b10 => Self::Asr,
            _ => Self::Ror,
        }
    }

    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Lsl => "lsl",
            Self::Lsr => "lsr",
            Self::Asr => "asr",
            Self::Ror | Self::Rrx => "ror",
        }
    }
}

/// A minimal cursor over a token slice shared by every instruction-operand
/// parser; thin wrapper so `encoder` doesn't need to reach back into
/// `expr::ExprParser`'s internals for simple token matching.
pub struct Cursor<'t> {
    toks: &'t [Token],
    pos: usize,
}

impl<'t> Cursor<'t> {
    #[must_use]
    pub const fn new(toks: &'t [Token]) -> Self {
        Self { toks, pos: 0 }
    }

    #[must_use]
    pub fn peek(&self) -> &TokenKind {
        &self.toks[self.pos.min(self.toks.len() - 1)].kind
    }

    #[must_use]
    pub fn pos(&self) -> FilePos {
        self.toks[self.pos.min(self.toks.len() - 1)].pos.clone()
    }

    pub fn bump(&mut self) -> &Token {
        let tok = &self.toks[self.pos.min(self.toks.len() - 1)];
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    #[must_use]
    pub fn at_end(&self) -> bool {
        matches!(self.peek(), TokenKind::Newline | TokenKind::Eof)
    }

    pub fn expect_comma(&mut self) -> AsmResult<()> {
        if *self.peek() == TokenKind::Comma {
            self.bump();
            Ok(())
        } else {
            Err(AsmError::UnexpectedToken {
                pos: self.pos(),
                expected: "','".to_string(),
                found: self.toks[self.pos.min(self.toks.len() - 1)].describe(),
            })
        }
    }

    pub fn try_register(&mut self) -> Option<Reg> {
        if let TokenKind::Ident(name) = self.peek().clone() {
            if let Some(n) = register_number(&name) {
                self.bump();
                return Some(Reg(n));
            }
        }
        None
    }

    pub fn expect_register(&mut self) -> AsmResult<Reg> {
        self.try_register().ok_or_else(|| AsmError::UnexpectedToken {
            pos: self.pos(),
            expected: "a register".to_string(),
            found: self.toks[self.pos.min(self.toks.len() - 1)].describe(),
        })
    }

    pub fn try_shift_mnemonic(&mut self) -> Option<ShiftKind> {
        if let TokenKind::Ident(name) = self.peek().clone() {
            if let Some(k) = shift_kind(&name) {
                self.bump();
                return Some(k);
            }
        }
        None
    }

    /// Parses an immediate expression. The lexer already discards any `#`
    /// marker, so this is just the next expression in the stream.
    pub fn parse_expr(&mut self) -> AsmResult<Expr> {
        let (e, consumed) = parse_expr(&self.toks[self.pos..])?;
        self.pos += consumed;
        self.pos = self.pos.min(self.toks.len() - 1);
        Ok(e)
    }

    /// Looks `offset` tokens ahead of the cursor without consuming anything,
    /// used by the Thumb encoder to tell apart `mov rd, rs` from
    /// `mov rd, #imm` before committing to a parse path.
    #[must_use]
    pub fn token_at(&self, offset: usize) -> Option<&'t TokenKind> {
        let idx = self.pos + offset;
        (idx < self.toks.len()).then(|| &self.toks[idx].kind)
    }

    /// Parses an expression and requires it to already be a literal number,
    /// for operand positions (shift amounts, 3 bit immediates) that ARM/Thumb
    /// encodings bake directly into the instruction word rather than
    /// deferring through a fixup.
    pub fn const_expr(&mut self) -> AsmResult<i64> {
        let at = self.pos();
        let e = self.parse_expr()?;
        match e {
            Expr::Number(n) => Ok(n),
            _ => Err(AsmError::UnexpectedToken {
                pos: at,
                expected: "a constant expression".to_string(),
                found: "a non-constant expression".to_string(),
            }),
        }
    }

    pub fn expect_kind(&mut self, kind: &TokenKind) -> AsmResult<()> {
        if self.peek() == kind {
            self.bump();
            Ok(())
        } else {
            Err(AsmError::UnexpectedToken {
                pos: self.pos(),
                expected: format!("{kind:?}"),
                found: self.toks[self.pos.min(self.toks.len() - 1)].describe(),
            })
        }
    }
}

/// Either a rotated 8 bit immediate or a (possibly shifted) register, the
/// shape every ARM data-processing `Operand2` field takes.
#[derive(Debug)]
pub enum Operand2 {
    Immediate(Expr),
    Register { reg: Reg, shift: Option<(ShiftKind, ShiftAmount)> },
}

#[derive(Debug)]
pub enum ShiftAmount {
    Immediate(Expr),
    Register(Reg),
}

/// Parses `#imm` or `Rm{, <shift> #n|Rs}` — the ARM data-processing second
/// operand grammar.
pub fn parse_operand2(cur: &mut Cursor) -> AsmResult<Operand2> {
    if let Some(reg) = cur.try_register() {
        let shift = if *cur.peek() == TokenKind::Comma {
            let checkpoint = cur.pos;
            cur.bump();
            if let Some(kind) = cur.try_shift_mnemonic() {
                let amount = if kind == ShiftKind::Rrx {
                    ShiftAmount::Immediate(Expr::Number(0))
                } else if let Some(rs) = cur.try_register() {
                    ShiftAmount::Register(rs)
                } else {
                    ShiftAmount::Immediate(cur.parse_expr()?)
                };
                Some((kind, amount))
            } else {
                cur.pos = checkpoint;
                None
            }
        } else {
            None
        };
        Ok(Operand2::Register { reg, shift })
    } else {
        Ok(Operand2::Immediate(cur.parse_expr()?))
    }
}

/// Finds the minimal-rotation 8 bit-immediate/4 bit-rotation pair that
/// reproduces `value` as `imm ROR (rot * 2)`, the encoding ARM's
/// data-processing immediates use. Returns `None` when no rotation of an 8
/// bit value equals `value`.
#[must_use]
pub fn encode_rotimm(value: u32) -> Option<(u32, u32)> {
    for rot in 0..16u32 {
        let rotated = value.rotate_left(rot * 2);
        if rotated <= 0xFF {
            return Some((rotated, (16 - rot) % 16));
        }
    }
    None
}

#[must_use]
pub fn decode_rotimm(imm: u32, rot: u32) -> u32 {
    imm.rotate_right(rot * 2)
}

/// Parses a `{R0, R1-R3, Lr}` register list into a 16 bit mask.
pub fn parse_reglist(cur: &mut Cursor) -> AsmResult<u16> {
    cur.expect_kind(&TokenKind::LBrace)?;
    let mut mask: u16 = 0;
    if *cur.peek() != TokenKind::RBrace {
        loop {
            let lo = cur.expect_register()?;
            let hi = if *cur.peek() == TokenKind::Op("-") {
                cur.bump();
                cur.expect_register()?
            } else {
                lo
            };
            for r in lo.0..=hi.0 {
                mask |= 1 << r;
            }
            if *cur.peek() == TokenKind::Comma {
                cur.bump();
            } else {
                break;
            }
        }
    }
    cur.expect_kind(&TokenKind::RBrace)?;
    Ok(mask)
}

/// ARM single-data-transfer addressing modes: pre-indexed (with optional
/// writeback), post-indexed, and the plain `[Rn]` no-offset form.
#[derive(Debug)]
pub enum AddrMode {
    PreIndexed { base: Reg, offset: Offset, writeback: bool },
    PostIndexed { base: Reg, offset: Offset },
}

#[derive(Debug)]
pub enum Offset {
    Immediate(Expr),
    Register { reg: Reg, shift: Option<(ShiftKind, Expr)>, subtract: bool },
    None,
}

pub fn parse_addr_mode(cur: &mut Cursor) -> AsmResult<AddrMode> {
    cur.expect_kind(&TokenKind::LBracket)?;
    let base = cur.expect_register()?;
    if *cur.peek() == TokenKind::RBracket {
        cur.bump();
        if *cur.peek() == TokenKind::Comma {
            cur.bump();
            let offset = parse_offset(cur)?;
            return Ok(AddrMode::PostIndexed { base, offset });
        }
        return Ok(AddrMode::PreIndexed { base, offset: Offset::None, writeback: false });
    }
    cur.expect_kind(&TokenKind::Comma)?;
    let offset = parse_offset(cur)?;
    cur.expect_kind(&TokenKind::RBracket)?;
    let writeback = if *cur.peek() == TokenKind::Op("!") {
        cur.bump();
        true
    } else {
        false
    };
    Ok(AddrMode::PreIndexed { base, offset, writeback })
}

fn parse_offset(cur: &mut Cursor) -> AsmResult<Offset> {
    let subtract = if *cur.peek() == TokenKind::Op("-") {
        cur.bump();
        true
    } else {
        false
    };
    if let Some(reg) = cur.try_register() {
        let shift = if *cur.peek() == TokenKind::Comma {
            cur.bump();
            let kind = cur.try_shift_mnemonic().ok_or_else(|| AsmError::UnexpectedToken {
                pos: cur.pos(),
                expected: "a shift mnemonic".to_string(),
                found: format!("{:?}", cur.peek()),
            })?;
            let amount = cur.parse_expr()?;
            Some((kind, amount))
        } else {
            None
        };
        Ok(Offset::Register { reg, shift, subtract })
    } else {
        let e = cur.parse_expr()?;
        let e = if subtract { Expr::Unary(crate::expr::UnaryOp::Neg, Box::new(e), cur.pos()) } else { e };
        Ok(Offset::Immediate(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rotimm_finds_minimal_rotation() {
        assert_eq!(encode_rotimm(0xFF), Some((0xFF, 0)));
        assert_eq!(encode_rotimm(0xFF00), Some((0xFF, 8)));
        assert_eq!(encode_rotimm(0), Some((0, 0)));
        assert_eq!(encode_rotimm(0x101), None);
    }

    #[test]
    fn rotimm_round_trips() {
        let (imm, rot) = encode_rotimm(0xFF00_0000).unwrap();
        assert_eq!(decode_rotimm(imm, rot), 0xFF00_0000);
    }

    #[test]
    fn register_aliases_resolve() {
        assert_eq!(register_number("sp"), Some(13));
        assert_eq!(register_number("lr"), Some(14));
        assert_eq!(register_number("pc"), Some(15));
        assert_eq!(register_number("r7"), Some(7));
        assert_eq!(register_number("r16"), None);
    }
}
