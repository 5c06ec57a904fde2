use crate::emit::header;
use crate::emit::{Emitter, Width};
use crate::encoder::operand::Cursor;
use crate::error::{AsmError, AsmResult};
use crate::expr::Expr;
use crate::lexer::TokenKind;
use crate::pos::FilePos;
use crate::symbol::{FieldKind, SymbolTable};

/// Assembly mode, selected by `.arm`/`.thumb` and scoped like any other
/// symbol-table state: entering a `{ }` block or an `.if` body snapshots it,
/// leaving one restores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Arm,
    Thumb,
}

impl Mode {
    #[must_use]
    pub const fn instruction_width(self) -> u32 {
        match self {
            Self::Arm => 4,
            Self::Thumb => 2,
        }
    }
}

/// What the driver must do after a directive line runs. Most directives are
/// fully self-contained (`Handled`); the rest need the driver's help because
/// they touch control flow or the filesystem it owns.
pub enum DirectiveOutcome {
    Handled,
    SetMode(Mode),
    SetBase(u32),
    If(Expr, FilePos),
    Elseif(Expr, FilePos),
    Else,
    EndIf,
    Include { path: String, once: bool, pos: FilePos },
    /// `.import "path"` (whole top-level scope visible) or
    /// `.import "path" { name1, name2 }` (only the listed names are
    /// guaranteed to resolve afterwards — see `Driver::run_import`).
    Import { path: String, names: Vec<String>, pos: FilePos },
    Embed { path: String, pos: FilePos },
    Logo { path: String, pos: FilePos },
    ScriptBegin,
    Pool,
    Once,
    Printf(String, Vec<Expr>, FilePos),
    Error(String, FilePos),
}

/// Executes the directives that need no help from the driver, emitting bytes
/// directly through `emitter`/`symtab`. Directives the driver must act on
/// (scope, mode, conditionals, imports, `.pool`, `.script`, `.error`) are
/// returned as a [`DirectiveOutcome`] instead of being run here.
pub fn dispatch(
    name: &str,
    cur: &mut Cursor,
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
) -> AsmResult<DirectiveOutcome> {
    match name {
        "base" => {
            let addr = cur.const_expr()?;
            return Ok(DirectiveOutcome::SetBase(u32::try_from(addr).unwrap_or(0)));
        }
        "arm" => return Ok(DirectiveOutcome::SetMode(Mode::Arm)),
        "thumb" => return Ok(DirectiveOutcome::SetMode(Mode::Thumb)),
        "align" => directive_align(cur, emitter)?,
        "i8" | "b8" => emit_list(cur, pos, symtab, emitter, Width::W8, false)?,
        "i16" => emit_list(cur, pos, symtab, emitter, Width::W16, false)?,
        "i32" => emit_list(cur, pos, symtab, emitter, Width::W32, false)?,
        "b16" => emit_list(cur, pos, symtab, emitter, Width::W16, true)?,
        "b32" => emit_list(cur, pos, symtab, emitter, Width::W32, true)?,
        "i8fill" => emit_fill(cur, pos, symtab, emitter, Width::W8)?,
        "i16fill" => emit_fill(cur, pos, symtab, emitter, Width::W16)?,
        "i32fill" => emit_fill(cur, pos, symtab, emitter, Width::W32)?,
        "def" => directive_def(cur, pos, symtab)?,
        "struct" => directive_struct(cur, pos, symtab)?,
        "printf" => {
            let (fmt, args) = parse_printf(cur, pos)?;
            return Ok(DirectiveOutcome::Printf(fmt, args, pos.clone()));
        }
        "once" => return Ok(DirectiveOutcome::Once),
        "pool" => return Ok(DirectiveOutcome::Pool),
        "if" => {
            let e = cur.parse_expr()?;
            return Ok(DirectiveOutcome::If(e, pos.clone()));
        }
        "elseif" => {
            let e = cur.parse_expr()?;
            return Ok(DirectiveOutcome::Elseif(e, pos.clone()));
        }
        "else" => return Ok(DirectiveOutcome::Else),
        "end" => return Ok(DirectiveOutcome::EndIf),
        "script" => return Ok(DirectiveOutcome::ScriptBegin),
        "crc" => header::patch_checksum(&mut emitter.buf, emitter.base_address() as usize),
        "logo" => {
            let path = expect_string(cur, pos)?;
            return Ok(DirectiveOutcome::Logo { path, pos: pos.clone() });
        }
        "title" => directive_title(cur, pos, emitter)?,
        "gamecode" => directive_game_code(cur, pos, emitter)?,
        "include" => {
            let path = expect_string(cur, pos)?;
            return Ok(DirectiveOutcome::Include { path, once: false, pos: pos.clone() });
        }
        "import" => {
            let path = expect_string(cur, pos)?;
            let names = parse_optional_name_list(cur, pos)?;
            return Ok(DirectiveOutcome::Import { path, names, pos: pos.clone() });
        }
        "embed" => {
            let path = expect_string(cur, pos)?;
            return Ok(DirectiveOutcome::Embed { path, pos: pos.clone() });
        }
        "error" => {
            let message = expect_string(cur, pos)?;
            return Ok(DirectiveOutcome::Error(message, pos.clone()));
        }
        other => {
            return Err(AsmError::UnknownDirective { pos: pos.clone(), name: other.to_string() });
        }
    }
    Ok(DirectiveOutcome::Handled)
}

fn expect_string(cur: &mut Cursor, pos: &FilePos) -> AsmResult<String> {
    if let TokenKind::Str(s) = cur.peek().clone() {
        cur.bump();
        Ok(s)
    } else {
        Err(AsmError::UnexpectedToken {
            pos: pos.clone(),
            expected: "a string literal".to_string(),
            found: format!("{:?}", cur.peek()),
        })
    }
}

/// `{ name1, name2, ... }` after `.import "path"`; absent entirely when the
/// whole file's top-level scope should stay visible, matching callers that
/// predate the named-binding form.
fn parse_optional_name_list(cur: &mut Cursor, pos: &FilePos) -> AsmResult<Vec<String>> {
    if *cur.peek() != TokenKind::LBrace {
        return Ok(Vec::new());
    }
    cur.bump();
    let mut names = Vec::new();
    if *cur.peek() != TokenKind::RBrace {
        loop {
            names.push(expect_directive_ident(cur, pos)?);
            if *cur.peek() == TokenKind::Comma {
                cur.bump();
            } else {
                break;
            }
        }
    }
    cur.expect_kind(&TokenKind::RBrace)?;
    Ok(names)
}

fn directive_align(cur: &mut Cursor, emitter: &mut Emitter) -> AsmResult<()> {
    let to = cur.const_expr()?;
    let fill = if *cur.peek() == TokenKind::Comma {
        cur.bump();
        cur.const_expr()?
    } else {
        0
    };
    emitter.align(u32::try_from(to).unwrap_or(1), fill as u8);
    Ok(())
}

fn emit_list(
    cur: &mut Cursor,
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
    width: Width,
    big_endian: bool,
) -> AsmResult<()> {
    loop {
        if let TokenKind::Str(s) = cur.peek().clone() {
            cur.bump();
            for byte in s.bytes() {
                emitter.expr_at(Expr::Number(i64::from(byte)), Width::W8, false, pos.clone(), symtab)?;
            }
        } else {
            let e = cur.parse_expr()?;
            emit_one(emitter, e, width, big_endian, pos.clone(), symtab)?;
        }
        if *cur.peek() == TokenKind::Comma {
            cur.bump();
        } else {
            break;
        }
    }
    Ok(())
}

/// Big-endian directives reuse the little-endian emitter by byte-swapping a
/// value that is already fully known; a value still awaiting a forward
/// reference is rejected, since the deferred fixup path only ever patches
/// little-endian words.
fn emit_one(
    emitter: &mut Emitter,
    expr: Expr,
    width: Width,
    big_endian: bool,
    pos: FilePos,
    symtab: &mut SymbolTable,
) -> AsmResult<()> {
    if !big_endian {
        return emitter.expr_at(expr, width, false, pos, symtab);
    }
    let Some(value) = expr.eval(symtab)? else {
        return Err(AsmError::DirectiveError {
            pos,
            message: "big-endian directives require an immediately resolvable value".to_string(),
        });
    };
    let swapped = match width {
        Width::W8 => value,
        Width::W16 => i64::from((value as u16).swap_bytes()),
        Width::W32 => i64::from((value as u32).swap_bytes()),
    };
    emitter.expr_at(Expr::Number(swapped), width, false, pos, symtab)
}

fn emit_fill(
    cur: &mut Cursor,
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
    width: Width,
) -> AsmResult<()> {
    let count = cur.const_expr()?;
    cur.expect_comma()?;
    let value = cur.parse_expr()?;
    for _ in 0..count.max(0) {
        emitter.expr_at(value.clone(), width, false, pos.clone(), symtab)?;
    }
    Ok(())
}

fn directive_def(cur: &mut Cursor, pos: &FilePos, symtab: &mut SymbolTable) -> AsmResult<()> {
    let name = expect_directive_ident(cur, pos)?;
    let mut params = Vec::new();
    if *cur.peek() == TokenKind::LParen {
        cur.bump();
        if *cur.peek() != TokenKind::RParen {
            loop {
                params.push(expect_directive_ident(cur, pos)?);
                if *cur.peek() == TokenKind::Comma {
                    cur.bump();
                } else {
                    break;
                }
            }
        }
        cur.expect_kind(&TokenKind::RParen)?;
    }
    cur.expect_kind(&TokenKind::Op("="))?;
    let body = cur.parse_expr()?;
    symtab.define_constant(&name, params, body, pos)
}

fn directive_struct(cur: &mut Cursor, pos: &FilePos, symtab: &mut SymbolTable) -> AsmResult<()> {
    let name = expect_directive_ident(cur, pos)?;
    cur.expect_kind(&TokenKind::LBrace)?;
    let mut fields = Vec::new();
    while *cur.peek() != TokenKind::RBrace {
        let field_name = expect_directive_ident(cur, pos)?;
        cur.expect_kind(&TokenKind::Colon)?;
        let kind_name = expect_directive_ident(cur, pos)?;
        let kind = match kind_name.as_str() {
            "i8" => FieldKind::I8,
            "i16" => FieldKind::I16,
            "i32" => FieldKind::I32,
            other => {
                let idx = symtab.structs().find(other).ok_or_else(|| AsmError::UnknownStruct {
                    pos: pos.clone(),
                    name: other.to_string(),
                })?;
                FieldKind::Struct(idx)
            }
        };
        fields.push((field_name, kind));
        if *cur.peek() == TokenKind::Comma {
            cur.bump();
        }
    }
    cur.expect_kind(&TokenKind::RBrace)?;
    symtab.structs_mut().define(name, fields, pos)?;
    Ok(())
}

fn expect_directive_ident(cur: &mut Cursor, pos: &FilePos) -> AsmResult<String> {
    if let TokenKind::Ident(name) = cur.peek().clone() {
        cur.bump();
        Ok(name)
    } else {
        Err(AsmError::UnexpectedToken {
            pos: pos.clone(),
            expected: "an identifier".to_string(),
            found: format!("{:?}", cur.peek()),
        })
    }
}

/// Parses `.printf "fmt", args…` into the format string and the raw argument
/// expressions; the driver owns evaluating/queuing it since arguments may
/// legitimately depend on forward references.
pub fn parse_printf(cur: &mut Cursor, pos: &FilePos) -> AsmResult<(String, Vec<Expr>)> {
    let fmt = expect_string(cur, pos)?;
    let mut args = Vec::new();
    while *cur.peek() == TokenKind::Comma {
        cur.bump();
        args.push(cur.parse_expr()?);
    }
    Ok((fmt, args))
}

/// Renders one resolved `.printf` statement the way `%d %x %o %b` etc. format
/// an already-evaluated argument list. An unrecognised specifier (`%s`
/// included — there is no string argument type to back it) is a directive
/// error rather than a guess at what the author meant.
pub fn format_printf(fmt: &str, args: &[i64], pos: &FilePos) -> AsmResult<String> {
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    let mut arg_idx = 0;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut flags = String::new();
        while matches!(chars.peek(), Some('0' | '-' | '+' | '#')) {
            flags.push(chars.next().unwrap());
        }
        let mut width = String::new();
        while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
            width.push(chars.next().unwrap());
        }
        let Some(spec) = chars.next() else { break };
        if spec == '%' {
            out.push('%');
            continue;
        }
        let value = args.get(arg_idx).copied().unwrap_or(0);
        arg_idx += 1;
        let rendered = render_printf_arg(spec, value, &flags, pos)?;
        let width: usize = width.parse().unwrap_or(0);
        if flags.contains('-') {
            out.push_str(&format!("{rendered:<width$}"));
        } else if flags.contains('0') {
            out.push_str(&format!("{rendered:0>width$}"));
        } else {
            out.push_str(&format!("{rendered:>width$}"));
        }
    }
    Ok(out)
}

fn render_printf_arg(spec: char, value: i64, flags: &str, pos: &FilePos) -> AsmResult<String> {
    let hash = flags.contains('#');
    Ok(match spec {
        'd' | 'i' => {
            if flags.contains('+') && value >= 0 {
                format!("+{value}")
            } else {
                value.to_string()
            }
        }
        'u' => (value as u32).to_string(),
        'o' => {
            if hash {
                format!("0o{:o}", value as u32)
            } else {
                format!("{:o}", value as u32)
            }
        }
        'b' => {
            if hash {
                format!("0b{:b}", value as u32)
            } else {
                format!("{:b}", value as u32)
            }
        }
        'x' => {
            if hash {
                format!("0x{:x}", value as u32)
            } else {
                format!("{:x}", value as u32)
            }
        }
        'X' => {
            if hash {
                format!("0X{:X}", value as u32)
            } else {
                format!("{:X}", value as u32)
            }
        }
        other => {
            return Err(AsmError::DirectiveError {
                pos: pos.clone(),
                message: format!("unknown .printf specifier '%{other}'"),
            })
        }
    })
}

/// Patches a previously-read logo file's bytes into the header. Called from
/// the driver once it has resolved and read the path through the shared
/// [`crate::driver::SourceReader`], the same way `.embed` supplies its bytes.
pub fn apply_logo(bytes: &[u8], pos: &FilePos, emitter: &mut Emitter) -> AsmResult<()> {
    let logo: [u8; header::LOGO_SIZE] = bytes.get(..header::LOGO_SIZE).map_or(
        Err(AsmError::DirectiveError {
            pos: pos.clone(),
            message: "logo file is shorter than 156 bytes".to_string(),
        }),
        |slice| Ok(slice.try_into().expect("length checked above")),
    )?;
    header::patch_logo(&mut emitter.buf, emitter.base_address() as usize, &logo, pos)
}

fn directive_title(cur: &mut Cursor, pos: &FilePos, emitter: &mut Emitter) -> AsmResult<()> {
    let title = expect_string(cur, pos)?;
    header::patch_title(&mut emitter.buf, emitter.base_address() as usize, &title, pos)
}

fn directive_game_code(cur: &mut Cursor, pos: &FilePos, emitter: &mut Emitter) -> AsmResult<()> {
    let code = expect_string(cur, pos)?;
    header::patch_game_code(&mut emitter.buf, emitter.base_address() as usize, &code, pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pos() -> FilePos {
        FilePos::new(std::rc::Rc::from("t"), 1, 1)
    }

    #[test]
    fn printf_formats_common_specifiers() {
        assert_eq!(format_printf("%d apples", &[3], &pos()).unwrap(), "3 apples");
        assert_eq!(format_printf("0x%04x", &[0xAB], &pos()).unwrap(), "0x00ab");
        assert_eq!(format_printf("%b", &[5], &pos()).unwrap(), "101");
        assert_eq!(format_printf("100%%", &[], &pos()).unwrap(), "100%");
    }

    #[test]
    fn printf_honours_plus_and_hash_flags() {
        assert_eq!(format_printf("%+d", &[3], &pos()).unwrap(), "+3");
        assert_eq!(format_printf("%#x", &[255], &pos()).unwrap(), "0xff");
    }

    #[test]
    fn printf_rejects_unknown_specifier() {
        assert!(format_printf("%s", &[0], &pos()).is_err());
        assert!(format_printf("%q", &[0], &pos()).is_err());
    }
}
