use crate::emit::{Emitter, Width};
use crate::encoder::condition::Condition;
use crate::encoder::operand::{
    encode_rotimm, parse_addr_mode, parse_operand2, parse_reglist, AddrMode, Cursor, Offset,
    Operand2, ShiftAmount,
};
use crate::encoder::split_mnemonic;
use crate::error::{AsmError, AsmResult};
use crate::expr::Expr;
use crate::lexer::Token;
use crate::pos::FilePos;
use crate::symbol::SymbolTable;

/// Name/opcode pairs for the data-processing class, shared with
/// `disasm::arm` so the decode direction looks mnemonics up in the same
/// table instead of keeping its own parallel, opcode-indexed copy.
pub(crate) const DATA_PROCESSING: &[(&str, u32)] = &[
    ("and", 0x0),
    ("eor", 0x1),
    ("sub", 0x2),
    ("rsb", 0x3),
    ("add", 0x4),
    ("adc", 0x5),
    ("sbc", 0x6),
    ("rsc", 0x7),
    ("tst", 0x8),
    ("teq", 0x9),
    ("cmp", 0xA),
    ("cmn", 0xB),
    ("orr", 0xC),
    ("mov", 0xD),
    ("bic", 0xE),
    ("mvn", 0xF),
];

/// Data-processing mnemonics that take only `Rd, Op2` or `Rn, Op2` (the
/// destination-less compares, and mov/mvn which have no first source
/// register at all).
const TWO_OPERAND_COMPARE: &[&str] = &["tst", "teq", "cmp", "cmn"];
const TWO_OPERAND_MOVE: &[&str] = &["mov", "mvn"];

const KNOWN_BASES: &[&str] = &[
    "and", "eor", "sub", "rsb", "add", "adc", "sbc", "rsc", "tst", "teq", "cmp", "cmn", "orr",
    "mov", "bic", "mvn", "mul", "mla", "umull", "umlal", "smull", "smlal", "b", "bl", "bx", "ldr",
    "str", "ldrb", "strb", "ldrh", "strh", "ldrsb", "ldrsh", "ldm", "stm", "ldmia", "ldmib",
    "ldmda", "ldmdb", "stmia", "stmib", "stmda", "stmdb", "push", "pop", "swp", "swpb", "swi",
    "mrs", "msr",
];

fn is_known(name: &str) -> bool {
    KNOWN_BASES.contains(&name)
}

/// Attempts to assemble one ARM-mode instruction. `toks` holds everything
/// after the mnemonic on the line (no leading mnemonic token, no trailing
/// newline). Returns `Ok(false)` when `mnemonic` is not recognised in ARM
/// mode at all, so the driver can try Thumb or report an unknown mnemonic.
pub fn encode(
    mnemonic: &str,
    toks: &[Token],
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
) -> AsmResult<bool> {
    let lower = mnemonic.to_ascii_lowercase();
    let Some((base, cond, set_flags)) = split_mnemonic(&lower, is_known) else {
        return Ok(false);
    };

    let mut cur = Cursor::new(toks);

    if let Some(&(_, opcode)) = DATA_PROCESSING.iter().find(|(n, _)| *n == base) {
        encode_data_processing(base, opcode, cond, set_flags, &mut cur, pos, symtab, emitter)?;
        return Ok(true);
    }

    match base {
        "mul" | "mla" => encode_multiply(base, cond, set_flags, &mut cur, pos, emitter)?,
        "umull" | "umlal" | "smull" | "smlal" => {
            encode_multiply_long(base, cond, set_flags, &mut cur, pos, emitter)?;
        }
        "b" | "bl" => encode_branch(base, cond, &mut cur, pos, symtab, emitter)?,
        "bx" => encode_bx(cond, &mut cur, emitter)?,
        "ldr" | "str" | "ldrb" | "strb" => {
            encode_single_transfer(base, cond, &mut cur, pos, symtab, emitter)?;
        }
        "ldrh" | "strh" | "ldrsb" | "ldrsh" => {
            encode_halfword_transfer(base, cond, &mut cur, pos, symtab, emitter)?;
        }
        "ldm" | "ldmia" | "ldmib" | "ldmda" | "ldmdb" | "stm" | "stmia" | "stmib" | "stmda"
        | "stmdb" => encode_block_transfer(base, cond, &mut cur, pos, emitter)?,
        "push" => encode_push_pop(true, cond, &mut cur, pos, emitter)?,
        "pop" => encode_push_pop(false, cond, &mut cur, pos, emitter)?,
        "swp" | "swpb" => encode_swap(base, cond, &mut cur, pos, emitter)?,
        "swi" => encode_swi(cond, &mut cur, pos, symtab, emitter)?,
        "mrs" => encode_mrs(cond, &mut cur, pos, emitter)?,
        "msr" => encode_msr(cond, &mut cur, pos, symtab, emitter)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn operand2_word(op2: &Operand2, pos: &FilePos) -> AsmResult<(bool, Expr)> {
    match op2 {
        Operand2::Immediate(e) => Ok((true, e.clone())),
        Operand2::Register { reg, shift } => {
            let (shift_type, shift_field): (u32, Expr) = match shift {
                None => (0, Expr::Number(0)),
                Some((kind, ShiftAmount::Immediate(e))) => (kind.encoding(), e.clone()),
                Some((kind, ShiftAmount::Register(rs))) => {
                    // Register-specified shift amount: bit7=0,Rs<<8,type<<5,bit4=1
                    let word = (u32::from(rs.0) << 8) | (kind.encoding() << 5) | 0b1_0000;
                    return Ok((false, Expr::Number(i64::from(word | u32::from(reg.0)))));
                }
            };
            // Immediate shift amount, possibly itself a constant expression;
            // fold Rm and shift-type into the low bits, leave the 5 bit
            // amount to be ORed in once `shift_field` resolves.
            let base = (shift_type << 5) | u32::from(reg.0);
            if let Expr::Number(amount) = shift_field {
                let word = base | ((amount as u32 & 0x1F) << 7);
                Ok((false, Expr::Number(i64::from(word))))
            } else {
                // Forward-referenced shift amounts are rare; reject rather
                // than silently mis-encode.
                Err(AsmError::Other(format!("{pos}: shift amount must be a constant expression")))
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_data_processing(
    base: &str,
    opcode: u32,
    cond: Condition,
    set_flags: bool,
    cur: &mut Cursor,
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let rd_or_rn = cur.expect_register()?;
    let (rd, rn) = if TWO_OPERAND_COMPARE.contains(&base) {
        (0u8, rd_or_rn.0)
    } else if TWO_OPERAND_MOVE.contains(&base) {
        (rd_or_rn.0, 0u8)
    } else {
        cur.expect_comma()?;
        let rn = cur.expect_register()?;
        (rd_or_rn.0, rn.0)
    };
    cur.expect_comma()?;
    let op2 = parse_operand2(cur)?;
    let s = if TWO_OPERAND_COMPARE.contains(&base) { true } else { set_flags };

    let (is_imm, field_expr) = operand2_word(&op2, pos)?;

    let base_word = (cond.value() << 28)
        | (u32::from(is_imm) << 25)
        | (opcode << 21)
        | (u32::from(s) << 20)
        | (u32::from(rn) << 16)
        | (u32::from(rd) << 12);

    if is_imm {
        emitter.word_fixup(base_word, Width::W32, field_expr, pos.clone(), symtab, move |w, v, p| {
            let (imm, rot) = encode_rotimm(v as u32)
                .ok_or(AsmError::NotRotatable { pos: p.clone(), value: v as u32 })?;
            Ok(w | (rot << 8) | imm)
        })?;
    } else {
        emitter.word_fixup(base_word, Width::W32, field_expr, pos.clone(), symtab, |w, v, _| {
            Ok(w | (v as u32 & 0xFFF))
        })?;
    }
    Ok(())
}

fn encode_multiply(
    base: &str,
    cond: Condition,
    set_flags: bool,
    cur: &mut Cursor,
    pos: &FilePos,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let rd = cur.expect_register()?;
    cur.expect_comma()?;
    let rm = cur.expect_register()?;
    cur.expect_comma()?;
    let rs = cur.expect_register()?;
    let rn = if base == "mla" {
        cur.expect_comma()?;
        cur.expect_register()?
    } else {
        crate::encoder::operand::Reg(0)
    };
    let _ = pos;
    let word = (cond.value() << 28)
        | (u32::from(base == "mla") << 21)
        | (u32::from(set_flags) << 20)
        | (u32::from(rd.0) << 16)
        | (u32::from(rn.0) << 12)
        | (u32::from(rs.0) << 8)
        | 0b1001 << 4
        | u32::from(rm.0);
    emitter.write32(word);
    Ok(())
}

fn encode_multiply_long(
    base: &str,
    cond: Condition,
    set_flags: bool,
    cur: &mut Cursor,
    pos: &FilePos,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let rd_lo = cur.expect_register()?;
    cur.expect_comma()?;
    let rd_hi = cur.expect_register()?;
    cur.expect_comma()?;
    let rm = cur.expect_register()?;
    cur.expect_comma()?;
    let rs = cur.expect_register()?;
    let _ = pos;
    let signed = matches!(base, "smull" | "smlal");
    let accumulate = matches!(base, "umlal" | "smlal");
    let word = (cond.value() << 28)
        | (0b1 << 23)
        | (u32::from(signed) << 22)
        | (u32::from(accumulate) << 21)
        | (u32::from(set_flags) << 20)
        | (u32::from(rd_hi.0) << 16)
        | (u32::from(rd_lo.0) << 12)
        | (u32::from(rs.0) << 8)
        | 0b1001 << 4
        | u32::from(rm.0);
    emitter.write32(word);
    Ok(())
}

fn encode_branch(
    base: &str,
    cond: Condition,
    cur: &mut Cursor,
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let target = cur.parse_expr()?;
    let pc = emitter.current_address();
    let link = base == "bl";
    let base_word = (cond.value() << 28) | (0b101 << 25) | (u32::from(link) << 24);
    emitter.word_fixup(base_word, Width::W32, target, pos.clone(), symtab, move |w, v, p| {
        let delta = v - i64::from(pc) - 8;
        if delta % 4 != 0 {
            return Err(AsmError::Misaligned { pos: p.clone(), address: v as u32, align: 4 });
        }
        let off = delta / 4;
        if !(-(1 << 23)..(1 << 23)).contains(&off) {
            return Err(AsmError::BranchOutOfRange { pos: p.clone(), delta });
        }
        Ok(w | (off as u32 & 0x00FF_FFFF))
    })?;
    Ok(())
}

fn encode_bx(cond: Condition, cur: &mut Cursor, emitter: &mut Emitter) -> AsmResult<()> {
    let rm = cur.expect_register()?;
    let word = (cond.value() << 28) | 0x012F_FF10 | u32::from(rm.0);
    emitter.write32(word);
    Ok(())
}

fn encode_single_transfer(
    base: &str,
    cond: Condition,
    cur: &mut Cursor,
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let load = base.starts_with("ldr");
    let byte = base.ends_with('b');
    let rd = cur.expect_register()?;
    cur.expect_comma()?;
    let mode = parse_addr_mode(cur)?;

    let (rn, offset, pre, writeback) = match mode {
        AddrMode::PreIndexed { base, offset, writeback } => (base, offset, true, writeback),
        AddrMode::PostIndexed { base, offset } => (base, offset, false, false),
    };

    let (is_reg, up, offset_expr) = match offset {
        Offset::None => (false, true, Expr::Number(0)),
        Offset::Immediate(e) => (false, true, e),
        Offset::Register { reg, shift, subtract } => {
            let shift_word = match shift {
                None => 0u32,
                Some((kind, Expr::Number(amount))) => (kind.encoding() << 5) | ((amount as u32 & 0x1F) << 7),
                Some(_) => {
                    return Err(AsmError::Other(format!(
                        "{pos}: shifted register offsets require a constant shift amount"
                    )))
                }
            };
            (true, !subtract, Expr::Number(i64::from(shift_word | u32::from(reg.0))))
        }
    };

    let base_word = (cond.value() << 28)
        | (0b01 << 26)
        | (u32::from(is_reg) << 25)
        | (u32::from(pre) << 24)
        | (u32::from(up) << 23)
        | (u32::from(byte) << 22)
        | (u32::from(writeback && pre) << 21)
        | (u32::from(load) << 20)
        | (u32::from(rn.0) << 16)
        | (u32::from(rd.0) << 12);

    emitter.word_fixup(base_word, Width::W32, offset_expr, pos.clone(), symtab, move |w, v, p| {
        if is_reg {
            Ok(w | (v as u32 & 0xFFF))
        } else {
            let mag = v.unsigned_abs();
            if mag > 0xFFF {
                return Err(AsmError::ValueOutOfRange { pos: p.clone(), value: v, bits: 12 });
            }
            Ok(w | (mag as u32 & 0xFFF))
        }
    })?;
    Ok(())
}

fn encode_halfword_transfer(
    base: &str,
    cond: Condition,
    cur: &mut Cursor,
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let load = base.starts_with("ldr");
    let (signed, halfword) = match base {
        "ldrh" | "strh" => (false, true),
        "ldrsb" => (true, false),
        "ldrsh" => (true, true),
        _ => unreachable!("caller only dispatches halfword-family mnemonics"),
    };
    let rd = cur.expect_register()?;
    cur.expect_comma()?;
    let mode = parse_addr_mode(cur)?;
    let (rn, offset, pre, writeback) = match mode {
        AddrMode::PreIndexed { base, offset, writeback } => (base, offset, true, writeback),
        AddrMode::PostIndexed { base, offset } => (base, offset, false, false),
    };

    let (is_imm, up, offset_expr) = match offset {
        Offset::None => (true, true, Expr::Number(0)),
        Offset::Immediate(e) => (true, true, e),
        Offset::Register { reg, subtract, .. } => (false, !subtract, Expr::Number(i64::from(reg.0))),
    };

    let sh = (u32::from(signed) << 1) | u32::from(halfword);
    let base_word = (cond.value() << 28)
        | (u32::from(pre) << 24)
        | (u32::from(up) << 23)
        | (u32::from(is_imm) << 22)
        | (u32::from(writeback && pre) << 21)
        | (u32::from(load) << 20)
        | (u32::from(rn.0) << 16)
        | (u32::from(rd.0) << 12)
        | (0b1 << 7)
        | (sh << 5)
        | (0b1 << 4);

    emitter.word_fixup(base_word, Width::W32, offset_expr, pos.clone(), symtab, move |w, v, p| {
        if is_imm {
            let mag = v.unsigned_abs();
            if mag > 0xFF {
                return Err(AsmError::ValueOutOfRange { pos: p.clone(), value: v, bits: 8 });
            }
            let mag = mag as u32;
            Ok(w | ((mag & 0xF0) << 4) | (mag & 0x0F))
        } else {
            Ok(w | (v as u32 & 0xF))
        }
    })?;
    Ok(())
}

fn encode_block_transfer(
    base: &str,
    cond: Condition,
    cur: &mut Cursor,
    pos: &FilePos,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let load = base.starts_with("ldm");
    let (pre, up) = match &base[3..] {
        "" | "ia" => (false, true),
        "ib" => (true, true),
        "da" => (false, false),
        "db" => (true, false),
        other => {
            return Err(AsmError::Other(format!("{pos}: unknown block transfer suffix {other:?}")))
        }
    };
    let rn = cur.expect_register()?;
    let writeback = if *cur.peek() == crate::lexer::TokenKind::Op("!") {
        cur.bump();
        true
    } else {
        false
    };
    cur.expect_comma()?;
    let reglist = parse_reglist(cur)?;
    let word = (cond.value() << 28)
        | (0b100 << 25)
        | (u32::from(pre) << 24)
        | (u32::from(up) << 23)
        | (u32::from(writeback) << 21)
        | (u32::from(load) << 20)
        | (u32::from(rn.0) << 16)
        | u32::from(reglist);
    emitter.write32(word);
    Ok(())
}

fn encode_push_pop(
    push: bool,
    cond: Condition,
    cur: &mut Cursor,
    pos: &FilePos,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let reglist = parse_reglist(cur)?;
    let _ = pos;
    let (pre, up, load) = if push { (true, false, false) } else { (false, true, true) };
    let word = (cond.value() << 28)
        | (0b100 << 25)
        | (u32::from(pre) << 24)
        | (u32::from(up) << 23)
        | (0b1 << 21)
        | (u32::from(load) << 20)
        | (13 << 16)
        | u32::from(reglist);
    emitter.write32(word);
    Ok(())
}

fn encode_swap(
    base: &str,
    cond: Condition,
    cur: &mut Cursor,
    pos: &FilePos,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let byte = base == "swpb";
    let rd = cur.expect_register()?;
    cur.expect_comma()?;
    let rm = cur.expect_register()?;
    cur.expect_comma()?;
    cur.expect_kind(&crate::lexer::TokenKind::LBracket)?;
    let rn = cur.expect_register()?;
    cur.expect_kind(&crate::lexer::TokenKind::RBracket)?;
    let _ = pos;
    let word = (cond.value() << 28)
        | (0b00010 << 23)
        | (u32::from(byte) << 22)
        | (u32::from(rn.0) << 16)
        | (u32::from(rd.0) << 12)
        | (0b1001 << 4)
        | u32::from(rm.0);
    emitter.write32(word);
    Ok(())
}

fn encode_swi(
    cond: Condition,
    cur: &mut Cursor,
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let comment = cur.parse_expr()?;
    let base_word = (cond.value() << 28) | (0b1111 << 24);
    emitter.word_fixup(base_word, Width::W32, comment, pos.clone(), symtab, |w, v, p| {
        if !(0..=0x00FF_FFFF).contains(&v) {
            return Err(AsmError::ValueOutOfRange { pos: p.clone(), value: v, bits: 24 });
        }
        Ok(w | (v as u32 & 0x00FF_FFFF))
    })?;
    Ok(())
}

fn encode_mrs(cond: Condition, cur: &mut Cursor, pos: &FilePos, emitter: &mut Emitter) -> AsmResult<()> {
    let rd = cur.expect_register()?;
    cur.expect_comma()?;
    let psr = expect_psr_name(cur, pos)?;
    let word = (cond.value() << 28)
        | (0b00010 << 23)
        | (u32::from(psr.spsr) << 22)
        | (0b00_1111 << 16)
        | (u32::from(rd.0) << 12);
    emitter.write32(word);
    Ok(())
}

struct PsrRef {
    spsr: bool,
    mask: u32,
}

fn expect_psr_name(cur: &mut Cursor, pos: &FilePos) -> AsmResult<PsrRef> {
    let crate::lexer::TokenKind::Ident(name) = cur.peek().clone() else {
        return Err(AsmError::UnexpectedToken {
            pos: pos.clone(),
            expected: "cpsr or spsr".to_string(),
            found: "something else".to_string(),
        });
    };
    cur.bump();
    let lower = name.to_ascii_lowercase();
    let (reg, flags) = lower.split_once('_').unwrap_or((lower.as_str(), "fc"));
    let spsr = match reg {
        "cpsr" => false,
        "spsr" => true,
        _ => {
            return Err(AsmError::UnexpectedToken {
                pos: pos.clone(),
                expected: "cpsr or spsr".to_string(),
                found: name,
            })
        }
    };
    let mut mask = 0u32;
    for c in flags.chars() {
        mask |= match c {
            'c' => 1 << 16,
            'x' => 1 << 17,
            's' => 1 << 18,
            'f' => 1 << 19,
            _ => {
                return Err(AsmError::Other(format!(
                    "{pos}: unknown psr field selector {c:?}"
                )))
            }
        };
    }
    Ok(PsrRef { spsr, mask })
}

fn encode_msr(
    cond: Condition,
    cur: &mut Cursor,
    pos: &FilePos,
    symtab: &mut SymbolTable,
    emitter: &mut Emitter,
) -> AsmResult<()> {
    let psr = expect_psr_name(cur, pos)?;
    cur.expect_comma()?;
    let op2 = parse_operand2(cur)?;
    let (is_imm, field_expr) = operand2_word(&op2, pos)?;
    let base_word = (cond.value() << 28)
        | (u32::from(is_imm) << 25)
        | (0b10 << 23)
        | (u32::from(psr.spsr) << 22)
        | (0b10 << 20)
        | psr.mask
        | (0b1111 << 12);
    if is_imm {
        emitter.word_fixup(base_word, Width::W32, field_expr, pos.clone(), symtab, move |w, v, p| {
            let (imm, rot) = encode_rotimm(v as u32)
                .ok_or(AsmError::NotRotatable { pos: p.clone(), value: v as u32 })?;
            Ok(w | (rot << 8) | imm)
        })?;
    } else {
        emitter.word_fixup(base_word, Width::W32, field_expr, pos.clone(), symtab, |w, v, _| {
            Ok(w | (v as u32 & 0xF))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn toks(src: &str) -> Vec<Token> {
        Lexer::new(Rc::from("t.s"), src).tokenize_all().unwrap()
    }

    fn pos() -> FilePos {
        FilePos::new(Rc::from("t"), 1, 1)
    }

    fn assemble_one(line: &str) -> u32 {
        let (mnemonic, rest) = line.split_once(' ').unwrap_or((line, ""));
        let mut symtab = SymbolTable::new();
        let mut emitter = Emitter::new(0x0800_0000);
        let operand_toks = toks(rest);
        let ok = encode(mnemonic, &operand_toks, &pos(), &mut symtab, &mut emitter).unwrap();
        assert!(ok, "{mnemonic} not recognised");
        emitter.finalise(&mut symtab).unwrap();
        u32::from_le_bytes(emitter.buf[0..4].try_into().unwrap())
    }

    #[test]
    fn mov_immediate() {
        assert_eq!(assemble_one("mov r0, #1"), 0xE3A0_0001);
    }

    #[test]
    fn add_register() {
        assert_eq!(assemble_one("add r0, r1, r2"), 0xE081_0002);
    }

    #[test]
    fn movs_sets_the_s_bit() {
        assert_eq!(assemble_one("movs r0, #0"), 0xE3B0_0000);
    }

    #[test]
    fn bx_lr() {
        assert_eq!(assemble_one("bx lr"), 0xE12F_FF1E);
    }

    #[test]
    fn mul_basic() {
        assert_eq!(assemble_one("mul r0, r1, r2"), 0xE000_0291);
    }

    #[test]
    fn push_pop_aliases() {
        assert_eq!(assemble_one("push {r0, r1}"), 0xE92D_0003);
        assert_eq!(assemble_one("pop {r0, r1}"), 0xE8BD_0003);
    }

    #[test]
    fn ldr_immediate_offset() {
        assert_eq!(assemble_one("ldr r0, [r1, #4]"), 0xE591_0004);
    }

    #[test]
    fn swi_comment_field() {
        assert_eq!(assemble_one("swi #0x1F"), 0xEF00_001F);
    }
}
