mod value;

pub use value::EvalContext;

use std::rc::Rc;

use crate::error::{AsmError, AsmResult};
use crate::lexer::{Token, TokenKind};
use crate::pos::FilePos;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Identifiers the grammar reserves for evaluation-context queries: current
/// mode, base address, bytes emitted so far, program counter (with pipeline
/// offset folded in) and the assembler's own version. Resolved straight from
/// the evaluation context rather than the symbol table.
pub const RESERVED_IDENTS: &[&str] =
    &["_arm", "_base", "_bytes", "_here", "_main", "_pc", "_thumb", "_version"];

#[derive(Debug, Clone)]
pub enum Expr {
    Number(i64),
    Ident(String),
    /// `_arm`, `_base`, `_bytes`, `_here`, `_main`, `_pc`, `_thumb` or
    /// `_version` — see [`RESERVED_IDENTS`].
    Reserved(String, FilePos),
    /// A dangling run of `+` or `-` tokens with no terminal to attach to
    /// (`+++`/`---`): the nearest anonymous label `count` occurrences
    /// forward/backward of the current address.
    Anonymous { forward: bool, count: u32 },
    Unary(UnaryOp, Box<Expr>, FilePos),
    Binary(BinaryOp, Box<Expr>, Box<Expr>, FilePos),
    Call(String, Vec<Expr>, FilePos),
    Member(Box<Expr>, String, FilePos),
    /// `*addr` / `*8:addr` style memory peek used in `.printf` debug forms.
    MemoryRead { width: u32, addr: Box<Expr>, pos: FilePos },
}

impl Expr {
    /// Evaluates the expression against a resolution context. Returns
    /// `Ok(None)` when evaluation legitimately depends on a forward
    /// reference that is not yet known (propagated up so the emitter can
    /// register a pending write), and `Err` for genuine evaluation errors.
    pub fn eval(&self, ctx: &mut dyn EvalContext) -> AsmResult<Option<i64>> {
        match self {
            Self::Number(n) => Ok(Some(*n)),
            Self::Ident(name) => Ok(ctx.resolve_ident(name)),
            Self::Reserved(name, pos) => ctx.resolve_reserved(name, pos).map(Some),
            Self::Anonymous { forward, count } => Ok(ctx.resolve_anonymous(*forward, *count)),
            Self::Unary(op, inner, pos) => {
                let Some(v) = inner.eval(ctx)? else {
                    return Ok(None);
                };
                Ok(Some(match op {
                    UnaryOp::Neg => v.wrapping_neg(),
                    UnaryOp::Pos => v,
                    UnaryOp::Not => i64::from(v == 0),
                    UnaryOp::BitNot => !v,
                }))
            }
            Self::Binary(op, lhs, rhs, pos) => {
                let (Some(l), Some(r)) = (lhs.eval(ctx)?, rhs.eval(ctx)?) else {
                    return Ok(None);
                };
                Ok(Some(eval_binary(*op, l, r, pos)?))
            }
            Self::Call(name, args, pos) => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    let Some(v) = a.eval(ctx)? else {
                        return Ok(None);
                    };
                    values.push(v);
                }
                if let Some(v) = ctx.resolve_macro(name, &values, pos)? {
                    return Ok(Some(v));
                }
                value::call_builtin(name, &values, pos).map(Some)
            }
            Self::Member(base, member, pos) => {
                let Some(base_val) = base.eval(ctx)? else {
                    return Ok(None);
                };
                Ok(ctx.resolve_member(base_val, member, pos))
            }
            Self::MemoryRead { width, addr, pos } => {
                let Some(a) = addr.eval(ctx)? else {
                    return Ok(None);
                };
                ctx.read_memory(a, *width, pos).map(Some)
            }
        }
    }
}

fn eval_binary(op: BinaryOp, l: i64, r: i64, pos: &FilePos) -> AsmResult<i64> {
    Ok(match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Div => {
            if r == 0 {
                return Err(AsmError::DivisionByZero { pos: pos.clone() });
            }
            l.wrapping_div(r)
        }
        BinaryOp::Mod => {
            if r == 0 {
                return Err(AsmError::DivisionByZero { pos: pos.clone() });
            }
            l.wrapping_rem(r)
        }
        BinaryOp::Shl => l.wrapping_shl(r as u32),
        BinaryOp::Shr => l.wrapping_shr(r as u32),
        BinaryOp::BitAnd => l & r,
        BinaryOp::BitOr => l | r,
        BinaryOp::BitXor => l ^ r,
        BinaryOp::And => i64::from(l != 0 && r != 0),
        BinaryOp::Or => i64::from(l != 0 || r != 0),
        BinaryOp::Eq => i64::from(l == r),
        BinaryOp::Ne => i64::from(l != r),
        BinaryOp::Lt => i64::from(l < r),
        BinaryOp::Le => i64::from(l <= r),
        BinaryOp::Gt => i64::from(l > r),
        BinaryOp::Ge => i64::from(l >= r),
    })
}

/// Recursive-descent / precedence-climbing parser over a token slice.
/// Holds an index rather than consuming the slice so callers (the
/// directive and instruction parsers) can parse one expression and then
/// keep reading from the same cursor.
pub struct ExprParser<'t> {
    toks: &'t [Token],
    pos: usize,
}

const PRECEDENCE: &[&[BinaryOp]] = &[
    &[BinaryOp::Or],
    &[BinaryOp::And],
    &[BinaryOp::BitOr],
    &[BinaryOp::BitXor],
    &[BinaryOp::BitAnd],
    &[BinaryOp::Eq, BinaryOp::Ne],
    &[BinaryOp::Lt, BinaryOp::Le, BinaryOp::Gt, BinaryOp::Ge],
    &[BinaryOp::Shl, BinaryOp::Shr],
    &[BinaryOp::Add, BinaryOp::Sub],
    &[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod],
];

impl<'t> ExprParser<'t> {
    #[must_use]
    pub const fn new(toks: &'t [Token]) -> Self {
        Self { toks, pos: 0 }
    }

    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.pos
    }

    pub const fn set_cursor(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn peek(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    fn bump(&mut self) -> &Token {
        let tok = &self.toks[self.pos.min(self.toks.len() - 1)];
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    pub fn parse(&mut self) -> AsmResult<Expr> {
        self.parse_level(0)
    }

    fn parse_level(&mut self, level: usize) -> AsmResult<Expr> {
        if level >= PRECEDENCE.len() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_level(level + 1)?;
        loop {
            let Some(op) = self.peek_binary_op(PRECEDENCE[level]) else {
                break;
            };
            let pos = self.peek().pos.clone();
            self.bump();
            let rhs = self.parse_level(level + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs), pos);
        }
        Ok(lhs)
    }

    fn peek_binary_op(&self, candidates: &[BinaryOp]) -> Option<BinaryOp> {
        let TokenKind::Op(op) = &self.peek().kind else {
            return None;
        };
        let parsed = op_from_str(op)?;
        candidates.contains(&parsed).then_some(parsed)
    }

    fn parse_unary(&mut self) -> AsmResult<Expr> {
        let pos = self.peek().pos.clone();
        if let TokenKind::Op(op) = self.peek().kind {
            if (op == "+" || op == "-") && self.anonymous_run_len().is_some() {
                return Ok(self.take_anonymous_run());
            }
            let unary = match op {
                "-" => Some(UnaryOp::Neg),
                "+" => Some(UnaryOp::Pos),
                "!" => Some(UnaryOp::Not),
                "~" => Some(UnaryOp::BitNot),
                _ => None,
            };
            if let Some(op) = unary {
                self.bump();
                let inner = self.parse_unary()?;
                return Ok(Expr::Unary(op, Box::new(inner), pos));
            }
        }
        self.parse_postfix()
    }

    /// Looks ahead from the current `+`/`-` token for a maximal run of the
    /// same sign. Returns the run length only if nothing able to start an
    /// operand follows — a run that is itself followed by a terminal
    /// (`+-5`, `++x`) is ordinary nested unary, not an anonymous-label
    /// reference, so the caller falls through to the normal unary parse.
    fn anonymous_run_len(&self) -> Option<usize> {
        let TokenKind::Op(sign) = self.peek().kind else { return None };
        let mut idx = self.pos;
        let mut count = 0usize;
        while idx < self.toks.len() {
            if self.toks[idx].kind == TokenKind::Op(sign) {
                count += 1;
                idx += 1;
            } else {
                break;
            }
        }
        if self.toks.get(idx).is_some_and(|t| starts_operand(&t.kind)) {
            None
        } else {
            Some(count)
        }
    }

    fn take_anonymous_run(&mut self) -> Expr {
        let pos = self.peek().pos.clone();
        let TokenKind::Op(sign) = self.peek().kind else {
            unreachable!("caller already confirmed a +/- token")
        };
        let forward = sign == "+";
        let mut count = 0u32;
        while self.peek().kind == TokenKind::Op(sign) {
            count += 1;
            self.bump();
        }
        let _ = pos;
        Expr::Anonymous { forward, count }
    }

    fn parse_postfix(&mut self) -> AsmResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match &self.peek().kind {
                TokenKind::Op(".") => {
                    let pos = self.peek().pos.clone();
                    self.bump();
                    let name = self.expect_ident()?;
                    expr = Expr::Member(Box::new(expr), name, pos);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> AsmResult<Expr> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Number(n) => {
                self.bump();
                Ok(Expr::Number(n))
            }
            TokenKind::Char(s) => {
                self.bump();
                Ok(Expr::Number(pack_char_literal(&s)))
            }
            TokenKind::LParen => {
                self.bump();
                let inner = self.parse()?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Op("*") => {
                self.bump();
                self.parse_memory_read(tok.pos)
            }
            TokenKind::Ident(name) => {
                self.bump();
                if RESERVED_IDENTS.contains(&name.as_str()) {
                    return Ok(Expr::Reserved(name, tok.pos));
                }
                if self.peek().kind == TokenKind::LParen {
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek().kind != TokenKind::RParen {
                        loop {
                            args.push(self.parse()?);
                            if self.peek().kind == TokenKind::Comma {
                                self.bump();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&TokenKind::RParen)?;
                    Ok(Expr::Call(name, args, tok.pos))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            other => Err(AsmError::UnexpectedToken {
                pos: tok.pos,
                expected: "an expression".to_string(),
                found: Token::new(other, tok.pos.clone()).describe(),
            }),
        }
    }

    /// `*addr` defaults to a 32 bit read; `*16:addr` / `*8:addr` select the
    /// width explicitly, matching the debug memory-peek forms `.printf`
    /// accepts.
    fn parse_memory_read(&mut self, pos: FilePos) -> AsmResult<Expr> {
        let mut width = 32;
        let checkpoint = self.pos;
        if let TokenKind::Number(n) = self.peek().kind {
            if matches!(n, 8 | 16 | 32) {
                self.bump();
                if self.peek().kind == TokenKind::Colon {
                    self.bump();
                    width = n as u32;
                } else {
                    self.pos = checkpoint;
                }
            }
        }
        let addr = self.parse_unary()?;
        Ok(Expr::MemoryRead { width, addr: Box::new(addr), pos })
    }

    fn expect(&mut self, kind: &TokenKind) -> AsmResult<()> {
        if &self.peek().kind == kind {
            self.bump();
            Ok(())
        } else {
            let pos = self.peek().pos.clone();
            let found = self.peek().describe();
            Err(AsmError::UnexpectedToken {
                pos,
                expected: format!("{kind:?}"),
                found,
            })
        }
    }

    fn expect_ident(&mut self) -> AsmResult<String> {
        if let TokenKind::Ident(name) = self.peek().kind.clone() {
            self.bump();
            Ok(name)
        } else {
            let pos = self.peek().pos.clone();
            let found = self.peek().describe();
            Err(AsmError::UnexpectedToken {
                pos,
                expected: "an identifier".to_string(),
                found,
            })
        }
    }
}

/// Whether `kind` can begin a term `parse_unary`/`parse_primary` would
/// recurse into — used to tell a dangling `+`/`-` run (an anonymous-label
/// reference) from one that has a real operand after it.
fn starts_operand(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Number(_)
            | TokenKind::Char(_)
            | TokenKind::Ident(_)
            | TokenKind::LParen
            | TokenKind::Op("+")
            | TokenKind::Op("-")
            | TokenKind::Op("!")
            | TokenKind::Op("~")
            | TokenKind::Op("*")
    )
}

/// Packs a basic-string literal's characters into an integer, low byte
/// first, so `'a'` still evaluates to `0x61` as a single character always
/// has and a multi-character literal like `'GBA\0'` packs into a 32-bit
/// little-endian tag the way fixed magic-number constants are usually
/// written.
fn pack_char_literal(s: &str) -> i64 {
    let mut value: i64 = 0;
    for (i, c) in s.chars().enumerate() {
        let byte = i64::from(u32::from(c) & 0xFF);
        value |= byte << (8 * i);
    }
    value
}

fn op_from_str(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Mod,
        "<<" => BinaryOp::Shl,
        ">>" => BinaryOp::Shr,
        "&" => BinaryOp::BitAnd,
        "|" => BinaryOp::BitOr,
        "^" => BinaryOp::BitXor,
        "&&" => BinaryOp::And,
        "||" => BinaryOp::Or,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        _ => return None,
    })
}

/// Parses a single expression out of a token slice, returning the index of
/// the first unconsumed token alongside it.
pub fn parse_expr(toks: &[Token]) -> AsmResult<(Expr, usize)> {
    let mut p = ExprParser::new(toks);
    let e = p.parse()?;
    Ok((e, p.cursor()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pos::FilePos;
    use pretty_assertions::assert_eq;

    struct NullCtx;
    impl EvalContext for NullCtx {
        fn resolve_ident(&mut self, _name: &str) -> Option<i64> {
            None
        }
        fn resolve_anonymous(&mut self, _forward: bool, _count: u32) -> Option<i64> {
            None
        }
        fn resolve_member(&mut self, _base: i64, _member: &str, _pos: &FilePos) -> Option<i64> {
            None
        }
        fn read_memory(&mut self, _addr: i64, _width: u32, _pos: &FilePos) -> AsmResult<i64> {
            Ok(0)
        }
    }

    fn toks(src: &str) -> Vec<Token> {
        crate::lexer::Lexer::new(Rc::from("t.s"), src)
            .tokenize_all()
            .unwrap()
    }

    fn eval_str(src: &str) -> i64 {
        let t = toks(src);
        let (e, _) = parse_expr(&t).unwrap();
        e.eval(&mut NullCtx).unwrap().unwrap()
    }

    #[test]
    fn precedence() {
        assert_eq!(eval_str("1 + 2 * 3"), 7);
        assert_eq!(eval_str("(1 + 2) * 3"), 9);
        assert_eq!(eval_str("1 << 2 + 1"), 8);
        assert_eq!(eval_str("2 + 3 == 5 && 1"), 1);
    }

    #[test]
    fn unary_and_bitwise() {
        assert_eq!(eval_str("-5 + 10"), 5);
        assert_eq!(eval_str("~0"), -1);
        assert_eq!(eval_str("0xF0 | 0x0F"), 0xFF);
    }

    #[test]
    fn function_calls() {
        assert_eq!(eval_str("abs(-7)"), 7);
        assert_eq!(eval_str("max(3, 9)"), 9);
        assert_eq!(eval_str("min(3, 9)"), 3);
        assert_eq!(eval_str("clamp(15, 0, 10)"), 10);
        assert_eq!(eval_str("log2(8)"), 3);
        assert_eq!(eval_str("pow(2, 5)"), 32);
        assert_eq!(eval_str("sqrt(81)"), 9);
    }

    #[test]
    fn reserved_identifiers_parse_as_their_own_node() {
        let t = toks("_here + 4");
        let (e, _) = parse_expr(&t).unwrap();
        let Expr::Binary(BinaryOp::Add, lhs, _, _) = e else { panic!("expected a binary expr") };
        assert!(matches!(*lhs, Expr::Reserved(name, _) if name == "_here"));
    }

    #[test]
    fn reserved_identifiers_are_not_callable() {
        let t = toks("_version");
        let (e, _) = parse_expr(&t).unwrap();
        assert!(matches!(e, Expr::Reserved(name, _) if name == "_version"));
    }

    #[test]
    fn single_char_literal_evaluates_to_its_byte() {
        let t = toks("'a'");
        let (e, _) = parse_expr(&t).unwrap();
        assert_eq!(e.eval(&mut NullCtx).unwrap(), Some(0x61));
    }

    #[test]
    fn multi_char_literal_packs_little_endian() {
        let t = toks("'AB'");
        let (e, _) = parse_expr(&t).unwrap();
        assert_eq!(e.eval(&mut NullCtx).unwrap(), Some(0x42_41));
    }

    #[test]
    fn division_by_zero_errors() {
        let t = toks("1 / 0");
        let (e, _) = parse_expr(&t).unwrap();
        assert!(e.eval(&mut NullCtx).is_err());
    }
}
