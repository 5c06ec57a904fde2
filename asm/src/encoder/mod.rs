pub mod arm;
pub mod condition;
pub mod operand;
pub mod thumb;

pub use condition::Condition;

/// Mnemonics that carry the "set flags" `S` suffix. Only these may have a
/// trailing `s` peeled off during suffix splitting; `bls` must never be
/// misread as `bl` + `s`.
const FLAGS_CAPABLE: &[&str] = &[
    "and", "eor", "sub", "rsb", "add", "adc", "sbc", "rsc", "tst", "teq", "cmp", "cmn", "orr",
    "mov", "bic", "mvn", "mul", "mla", "umull", "umlal", "smull", "smlal",
];

/// Thumb format-4 ALU opcode mnemonics, indexed by the 4 bit opcode field.
/// Shared by `thumb::encode` and `disasm::thumb` so the two directions can't
/// drift apart.
pub const THUMB_ALU_NAMES: &[&str] = &[
    "and", "eor", "lsl", "lsr", "asr", "adc", "sbc", "ror", "tst", "neg", "cmp", "cmn", "orr",
    "mul", "bic", "mvn",
];

/// Splits a raw mnemonic like `addseq`, `addeqs` or `bls` into (base,
/// condition, set flags). The flags suffix and the condition suffix can
/// appear in either order (`movsmi` and `movmis` are equivalent); condition
/// suffixes are tried greedily first in both orderings, and a trailing `s`
/// is only ever peeled when doing so leaves a [`FLAGS_CAPABLE`] base, which
/// is what keeps `bls` (branch, condition LS) from being misread as `bl`
/// plus a flags suffix that `bl` doesn't have.
#[must_use]
pub fn split_mnemonic<'a>(
    raw: &'a str,
    is_known: impl Fn(&str) -> bool,
) -> Option<(&'a str, Condition, bool)> {
    let lower = raw;

    // `<base>s<cond>` — flags suffix directly after the base, condition last.
    if lower.len() > 2 {
        let (prefix, suffix) = lower.split_at(lower.len() - 2);
        if let Some(cond) = Condition::parse_suffix(suffix) {
            if let Some(base) = prefix.strip_suffix('s') {
                if FLAGS_CAPABLE.contains(&base) && is_known(base) {
                    return Some((slice_of(raw, base), cond, true));
                }
            }
            if is_known(prefix) {
                return Some((slice_of(raw, prefix), cond, false));
            }
        }
    }

    // `<base><cond>s` — condition directly after the base, flags suffix last.
    if let Some(prefix) = lower.strip_suffix('s') {
        if prefix.len() > 2 {
            let (base, suffix) = prefix.split_at(prefix.len() - 2);
            if let Some(cond) = Condition::parse_suffix(suffix) {
                if FLAGS_CAPABLE.contains(&base) && is_known(base) {
                    return Some((slice_of(raw, base), cond, true));
                }
            }
        }
    }

    if let Some(base) = lower.strip_suffix('s') {
        if FLAGS_CAPABLE.contains(&base) && is_known(base) {
            return Some((slice_of(raw, base), Condition::Always, true));
        }
    }
    if is_known(lower) {
        return Some((raw, Condition::Always, false));
    }
    None
}

/// Recovers a `&'a str` sub-slice equal to `needle` from inside `haystack`,
/// used so callers can keep borrowing from the original mnemonic text.
fn slice_of<'a>(haystack: &'a str, needle: &str) -> &'a str {
    &haystack[..needle.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn known(name: &str) -> bool {
        matches!(name, "b" | "bl" | "bx" | "add" | "mov" | "mul")
    }

    #[test]
    fn bls_is_branch_with_ls_condition_not_bl_plus_s() {
        let (base, cond, flags) = split_mnemonic("bls", known).unwrap();
        assert_eq!(base, "b");
        assert_eq!(cond, Condition::Ls);
        assert!(!flags);
    }

    #[test]
    fn movs_sets_flags_with_no_condition() {
        let (base, cond, flags) = split_mnemonic("movs", known).unwrap();
        assert_eq!(base, "mov");
        assert_eq!(cond, Condition::Always);
        assert!(flags);
    }

    #[test]
    fn addseq_and_addeqs_both_parse() {
        let a = split_mnemonic("addseq", known).unwrap();
        assert_eq!(a, ("add", Condition::Eq, true));
        let b = split_mnemonic("addeqs", known).unwrap();
        assert_eq!(b, ("add", Condition::Eq, true));
    }

    #[test]
    fn movmis_is_condition_before_flags() {
        let (base, cond, flags) = split_mnemonic("movmis", known).unwrap();
        assert_eq!(base, "mov");
        assert_eq!(cond, Condition::Mi);
        assert!(flags);
    }

    #[test]
    fn bare_mnemonic_with_no_suffix() {
        assert_eq!(split_mnemonic("mul", known).unwrap(), ("mul", Condition::Always, false));
    }
}
