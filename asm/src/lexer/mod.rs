mod token;

use std::rc::Rc;
use std::str::CharIndices;

pub use token::{Token, TokenKind};

use crate::error::{AsmError, AsmResult};
use crate::pos::FilePos;

/// Turns a source file into a flat stream of [`Token`]s.
///
/// Comments start with `//` and run to end of line, or `/* ... */` and run
/// until the closing delimiter. `;` is a statement separator: it produces a
/// [`TokenKind::Newline`] of its own, exactly like a real line ending, so
/// `mov r0, r1; mov r2, r3` is two statements on one line. A line that ends
/// with a bare `\` instead splices the continuation onto the current logical
/// line and produces no `Newline` at all. A `.` encountered at the start of a
/// statement begins a [`TokenKind::Directive`]; anywhere else it is parsed as
/// the member-access operator. `#` is skipped wherever it appears, matching
/// ARM assembly's conventional (but optional here) immediate marker.
pub struct Lexer<'a> {
    file: Rc<str>,
    src: &'a str,
    chars: std::iter::Peekable<CharIndices<'a>>,
    line: u32,
    column: u32,
    at_line_start: bool,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(file: Rc<str>, src: &'a str) -> Self {
        Self {
            file,
            src,
            chars: src.char_indices().peekable(),
            line: 1,
            column: 1,
            at_line_start: true,
        }
    }

    #[must_use]
    pub fn tokenize_all(mut self) -> AsmResult<Vec<Token>> {
        let mut out = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            out.push(tok);
            if done {
                return Ok(out);
            }
        }
    }

    fn pos(&self) -> FilePos {
        FilePos::new(self.file.clone(), self.line, self.column)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn peek2_char(&self) -> Option<char> {
        let mut it = self.chars.clone();
        it.next();
        it.next().map(|(_, c)| c)
    }

    fn bump(&mut self) -> Option<char> {
        let (_, c) = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_inline_space(&mut self) {
        while matches!(self.peek_char(), Some(' ' | '\t' | '\r')) {
            self.bump();
        }
    }

    /// `#` carries no meaning of its own; it is the conventional ARM
    /// assembly marker in front of an immediate (`mov r0, #1`) and is
    /// skipped like whitespace so operand parsing sees the same token
    /// stream whether or not a statement bothers to write it.
    fn skip_immediate_marker(&mut self) {
        if self.peek_char() == Some('#') {
            self.bump();
        }
    }

    #[allow(clippy::too_many_lines)]
    fn next_token(&mut self) -> AsmResult<Token> {
        loop {
            self.skip_inline_space();
            self.skip_immediate_marker();
            self.skip_inline_space();
            match self.peek_char() {
                None => return Ok(Token::new(TokenKind::Eof, self.pos())),
                Some(';') => {
                    let pos = self.pos();
                    self.bump();
                    self.at_line_start = true;
                    return Ok(Token::new(TokenKind::Newline, pos));
                }
                Some('/') if self.peek2_char() == Some('/') => {
                    while !matches!(self.peek_char(), None | Some('\n')) {
                        self.bump();
                    }
                    continue;
                }
                Some('/') if self.peek2_char() == Some('*') => {
                    let pos = self.pos();
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek_char() {
                            None => return Err(AsmError::UnterminatedString { pos }),
                            Some('*') if self.peek2_char() == Some('/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            _ => {
                                self.bump();
                            }
                        }
                    }
                    continue;
                }
                Some('\\') if self.peek2_char() == Some('\n') || self.peek2_char().is_none() => {
                    self.bump();
                    self.bump();
                    continue;
                }
                Some('\n') => {
                    let pos = self.pos();
                    self.bump();
                    self.at_line_start = true;
                    return Ok(Token::new(TokenKind::Newline, pos));
                }
                _ => break,
            }
        }

        let pos = self.pos();
        let at_line_start = self.at_line_start;
        self.at_line_start = false;

        let c = self.peek_char().expect("checked above");

        if c == '.' && at_line_start {
            self.bump();
            let name = self.read_ident_tail();
            if name.is_empty() {
                return Err(AsmError::UnexpectedChar { pos, found: '.' });
            }
            return Ok(Token::new(TokenKind::Directive(name), pos));
        }

        if c.is_ascii_digit() {
            return self.read_number(pos);
        }

        if c == '"' {
            return self.read_string(pos);
        }

        if c == '\'' {
            return self.read_char(pos);
        }

        if is_ident_start(c) {
            let name = self.read_ident_tail();
            return Ok(Token::new(TokenKind::Ident(name), pos));
        }

        if c == '@' {
            return self.read_local_ident(pos);
        }

        self.bump();
        let kind = match c {
            ':' => TokenKind::Colon,
            ',' => TokenKind::Comma,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '.' => TokenKind::Op("."),
            '+' => TokenKind::Op("+"),
            '-' => TokenKind::Op("-"),
            '*' => TokenKind::Op("*"),
            '/' => TokenKind::Op("/"),
            '%' => TokenKind::Op("%"),
            '~' => TokenKind::Op("~"),
            '&' => {
                if self.peek_char() == Some('&') {
                    self.bump();
                    TokenKind::Op("&&")
                } else {
                    TokenKind::Op("&")
                }
            }
            '|' => {
                if self.peek_char() == Some('|') {
                    self.bump();
                    TokenKind::Op("||")
                } else {
                    TokenKind::Op("|")
                }
            }
            '^' => TokenKind::Op("^"),
            '!' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    TokenKind::Op("!=")
                } else {
                    TokenKind::Op("!")
                }
            }
            '=' => {
                if self.peek_char() == Some('=') {
                    self.bump();
                    TokenKind::Op("==")
                } else {
                    TokenKind::Op("=")
                }
            }
            '<' => {
                if self.peek_char() == Some('<') {
                    self.bump();
                    TokenKind::Op("<<")
                } else if self.peek_char() == Some('=') {
                    self.bump();
                    TokenKind::Op("<=")
                } else {
                    TokenKind::Op("<")
                }
            }
            '>' => {
                if self.peek_char() == Some('>') {
                    self.bump();
                    TokenKind::Op(">>")
                } else if self.peek_char() == Some('=') {
                    self.bump();
                    TokenKind::Op(">=")
                } else {
                    TokenKind::Op(">")
                }
            }
            found => return Err(AsmError::UnexpectedChar { pos, found }),
        };
        Ok(Token::new(kind, pos))
    }

    /// `@@name` — a label local to the enclosing `.begin`/`.end` (or a
    /// reference to one). Lexed as an ordinary identifier carrying its `@@`
    /// prefix, so the parser and symbol table need no separate token kind;
    /// `resolve_ident`/label definition special-case the prefix directly.
    fn read_local_ident(&mut self, pos: FilePos) -> AsmResult<Token> {
        self.bump();
        if self.peek_char() != Some('@') {
            return Err(AsmError::UnexpectedChar { pos, found: '@' });
        }
        self.bump();
        let name = self.read_ident_tail();
        if name.is_empty() {
            return Err(AsmError::UnexpectedChar { pos, found: '@' });
        }
        Ok(Token::new(TokenKind::Ident(format!("@@{name}")), pos))
    }

    fn read_ident_tail(&mut self) -> String {
        let mut s = String::new();
        while let Some(c) = self.peek_char() {
            if is_ident_continue(c) {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        s
    }

    /// Decimal, hex (`0x`), octal (`0c`) or binary (`0b`) integer, with an
    /// optional fractional part and an optional exponent (`e`/`E` in base
    /// 10, since `e` is itself a valid hex digit everywhere else; `p`/`P`,
    /// read as a power of two, in the other bases). A literal with no
    /// fractional or exponent part keeps producing exactly the same
    /// [`TokenKind::Number`] as before; one with either is evaluated in
    /// `f64` and truncated toward zero into the same token kind, since
    /// every downstream consumer of a numeric literal is integer-typed.
    fn read_number(&mut self, pos: FilePos) -> AsmResult<Token> {
        let radix = if self.peek_char() == Some('0') {
            let mut it = self.chars.clone();
            it.next();
            match it.next() {
                Some((_, 'x' | 'X')) => {
                    self.bump();
                    self.bump();
                    16
                }
                Some((_, 'c' | 'C')) => {
                    self.bump();
                    self.bump();
                    8
                }
                Some((_, 'b' | 'B')) => {
                    self.bump();
                    self.bump();
                    2
                }
                _ => 10,
            }
        } else {
            10
        };

        let int_part = self.read_digits(radix);

        let mut frac_part = String::new();
        if self.peek_char() == Some('.') {
            let mut it = self.chars.clone();
            it.next();
            if it.next().is_some_and(|(_, c)| c.is_digit(radix)) {
                self.bump();
                frac_part = self.read_digits(radix);
            }
        }

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AsmError::InvalidNumber { pos, text: String::new() });
        }

        let exponent = self.read_exponent(radix);

        if frac_part.is_empty() && exponent.is_none() {
            return i64::from_str_radix(&int_part, radix)
                .map(|n| Token::new(TokenKind::Number(n), pos.clone()))
                .map_err(|_| AsmError::InvalidNumber { pos, text: int_part });
        }

        let int_value = if int_part.is_empty() {
            0.0
        } else {
            i64::from_str_radix(&int_part, radix)
                .map_err(|_| AsmError::InvalidNumber { pos: pos.clone(), text: int_part.clone() })? as f64
        };
        let mut value = int_value;
        if !frac_part.is_empty() {
            let frac_value = i64::from_str_radix(&frac_part, radix)
                .map_err(|_| AsmError::InvalidNumber { pos: pos.clone(), text: frac_part.clone() })? as f64;
            value += frac_value / (radix as f64).powi(frac_part.len() as i32);
        }
        if let Some(exponent) = exponent {
            let base = if radix == 10 { 10.0 } else { 2.0 };
            value *= base.powi(exponent);
        }
        Ok(Token::new(TokenKind::Number(value as i64), pos))
    }

    fn read_digits(&mut self, radix: u32) -> String {
        let mut raw = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_digit(radix) || c == '_' {
                if c != '_' {
                    raw.push(c);
                }
                self.bump();
            } else {
                break;
            }
        }
        raw
    }

    /// `e`/`E` (base 10) or `p`/`P` (every other base), optionally signed,
    /// consumed only when followed by at least one digit so `0x1e` (a plain
    /// hex digit) and `0xFp` (an incomplete exponent) are never misread.
    fn read_exponent(&mut self, radix: u32) -> Option<i32> {
        let marker = self.peek_char()?;
        let is_marker = if radix == 10 { marker == 'e' || marker == 'E' } else { marker == 'p' || marker == 'P' };
        if !is_marker {
            return None;
        }
        let mut it = self.chars.clone();
        it.next();
        let mut lookahead = it.next();
        if let Some((_, sign)) = lookahead {
            if sign == '+' || sign == '-' {
                lookahead = it.next();
            }
        }
        if !lookahead.is_some_and(|(_, c)| c.is_ascii_digit()) {
            return None;
        }
        self.bump();
        let negative = match self.peek_char() {
            Some('-') => {
                self.bump();
                true
            }
            Some('+') => {
                self.bump();
                false
            }
            _ => false,
        };
        let digits = self.read_digits(10);
        let magnitude: i32 = digits.parse().unwrap_or(0);
        Some(if negative { -magnitude } else { magnitude })
    }

    fn read_string(&mut self, pos: FilePos) -> AsmResult<Token> {
        self.bump();
        let mut s = String::new();
        loop {
            match self.peek_char() {
                None | Some('\n') => return Err(AsmError::UnterminatedString { pos }),
                Some('"') => {
                    self.bump();
                    return Ok(Token::new(TokenKind::Str(s), pos));
                }
                Some('\\') => {
                    self.bump();
                    s.push(self.read_escape(&pos)?);
                }
                Some(c) => {
                    s.push(c);
                    self.bump();
                }
            }
        }
    }

    /// The basic `'…'` string: no backslash escapes, `''` is the only way
    /// to get a literal quote inside one, and the body is not limited to a
    /// single character.
    fn read_char(&mut self, pos: FilePos) -> AsmResult<Token> {
        self.bump();
        let mut s = String::new();
        loop {
            match self.peek_char() {
                None | Some('\n') => return Err(AsmError::UnterminatedString { pos }),
                Some('\'') => {
                    self.bump();
                    if self.peek_char() == Some('\'') {
                        self.bump();
                        s.push('\'');
                        continue;
                    }
                    return Ok(Token::new(TokenKind::Char(s), pos));
                }
                Some(c) => {
                    s.push(c);
                    self.bump();
                }
            }
        }
    }

    fn read_escape(&mut self, pos: &FilePos) -> AsmResult<char> {
        let Some(c) = self.bump() else {
            return Err(AsmError::UnterminatedString { pos: pos.clone() });
        };
        Ok(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            'b' => '\u{8}',
            'v' => '\u{B}',
            'f' => '\u{C}',
            'e' => '\u{1B}',
            '\\' => '\\',
            '"' => '"',
            '\'' => '\'',
            '$' => '$',
            'x' => {
                let hi = self.bump().and_then(|c| c.to_digit(16));
                let lo = self.bump().and_then(|c| c.to_digit(16));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => char::from_u32(hi * 16 + lo).unwrap_or('\0'),
                    _ => {
                        return Err(AsmError::InvalidEscape {
                            pos: pos.clone(),
                            escape: 'x',
                        })
                    }
                }
            }
            other => {
                return Err(AsmError::InvalidEscape {
                    pos: pos.clone(),
                    escape: other,
                })
            }
        })
    }
}

const fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

const fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lex(src: &str) -> Vec<TokenKind> {
        Lexer::new(Rc::from("test.s"), src)
            .tokenize_all()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn skips_comments_and_space() {
        let toks = lex("  mov r0, r1 // move\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("mov".into()),
                TokenKind::Ident("r0".into()),
                TokenKind::Comma,
                TokenKind::Ident("r1".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn block_comment_is_skipped_even_across_lines() {
        let toks = lex("mov r0, /* r9,\nr8 */ r1\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("mov".into()),
                TokenKind::Ident("r0".into()),
                TokenKind::Comma,
                TokenKind::Ident("r1".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn semicolon_terminates_a_statement_like_a_newline() {
        let toks = lex("mov r0, r1; mov r2, r3\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("mov".into()),
                TokenKind::Ident("r0".into()),
                TokenKind::Comma,
                TokenKind::Ident("r1".into()),
                TokenKind::Newline,
                TokenKind::Ident("mov".into()),
                TokenKind::Ident("r2".into()),
                TokenKind::Comma,
                TokenKind::Ident("r3".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn semicolon_also_opens_a_directive_like_a_fresh_line() {
        let toks = lex("mov r0, r1; .align 4\n");
        assert_eq!(toks[4], TokenKind::Newline);
        assert_eq!(toks[5], TokenKind::Directive("align".into()));
    }

    #[test]
    fn soft_newline_merges_lines() {
        let toks = lex("mov r0, \\\nr1\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("mov".into()),
                TokenKind::Ident("r0".into()),
                TokenKind::Comma,
                TokenKind::Ident("r1".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn directive_only_at_line_start() {
        let toks = lex(".align 4\n");
        assert_eq!(toks[0], TokenKind::Directive("align".into()));
        assert_eq!(toks[1], TokenKind::Number(4));
    }

    #[test]
    fn member_access_dot_is_not_a_directive() {
        let toks = lex("foo.bar\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("foo".into()),
                TokenKind::Op("."),
                TokenKind::Ident("bar".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numeric_bases() {
        assert_eq!(lex("0x1F\n")[0], TokenKind::Number(0x1F));
        assert_eq!(lex("0b1010\n")[0], TokenKind::Number(0b1010));
        assert_eq!(lex("0c17\n")[0], TokenKind::Number(0o17));
        assert_eq!(lex("1_000\n")[0], TokenKind::Number(1000));
    }

    #[test]
    fn numeric_fractional_and_exponent_parts() {
        assert_eq!(lex("1.5\n")[0], TokenKind::Number(1));
        assert_eq!(lex("1.5e2\n")[0], TokenKind::Number(150));
        assert_eq!(lex("2e3\n")[0], TokenKind::Number(2000));
        assert_eq!(lex("0x1.8p4\n")[0], TokenKind::Number(24));
        // `e` is a hex digit, not an exponent marker, inside a hex literal.
        assert_eq!(lex("0x1e\n")[0], TokenKind::Number(0x1e));
    }

    #[test]
    fn interpolated_string_escapes() {
        let toks = lex("\"a\\nb\\x41\\$\"\n");
        assert_eq!(toks[0], TokenKind::Str("a\nbA$".into()));
    }

    #[test]
    fn interpolated_string_passes_dollar_markers_through_unevaluated() {
        let toks = lex("\"hello ${name}\"\n");
        assert_eq!(toks[0], TokenKind::Str("hello ${name}".into()));
    }

    #[test]
    fn basic_string_has_no_backslash_escapes() {
        // `'…'` has exactly one escape, `''` for a literal quote; a
        // backslash is an ordinary character.
        let toks = lex("'\\t'\n");
        assert_eq!(toks[0], TokenKind::Char("\\t".into()));
    }

    #[test]
    fn basic_string_doubled_quote_is_a_literal_quote() {
        let toks = lex("'it''s'\n");
        assert_eq!(toks[0], TokenKind::Char("it's".into()));
    }

    #[test]
    fn hash_immediate_marker_is_transparent() {
        let toks = lex("mov r0, #1\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("mov".into()),
                TokenKind::Ident("r0".into()),
                TokenKind::Comma,
                TokenKind::Number(1),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn local_label_tokens() {
        let toks = lex("@@loop: beq ++\n");
        assert_eq!(toks[0], TokenKind::Ident("@@loop".into()));
        assert_eq!(toks[1], TokenKind::Colon);
        assert_eq!(toks[3], TokenKind::Op("+"));
        assert_eq!(toks[4], TokenKind::Op("+"));
    }

    #[test]
    fn lone_at_sign_is_rejected() {
        let mut lexer = Lexer::new(Rc::from("t.s"), "@loop\n");
        assert!(lexer.tokenize_all().is_err());
    }

    #[test]
    fn triple_at_sign_is_rejected() {
        let mut lexer = Lexer::new(Rc::from("t.s"), "@@@loop\n");
        assert!(lexer.tokenize_all().is_err());
    }
}
