use std::fmt;

/// The 4 bit condition field carried by every ARM instruction and by
/// conditional Thumb branches. `Always` is the default when a mnemonic
/// carries no suffix and prints as nothing; `Never` is the deprecated
/// `NV` encoding, kept only so the disassembler can round-trip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Always,
    Never,
}

impl Condition {
    #[must_use]
    pub const fn value(self) -> u32 {
        match self {
            Self::Eq => 0x0,
            Self::Ne => 0x1,
            Self::Cs => 0x2,
            Self::Cc => 0x3,
            Self::Mi => 0x4,
            Self::Pl => 0x5,
            Self::Vs => 0x6,
            Self::Vc => 0x7,
            Self::Hi => 0x8,
            Self::Ls => 0x9,
            Self::Ge => 0xA,
            Self::Lt => 0xB,
            Self::Gt => 0xC,
            Self::Le => 0xD,
            Self::Always => 0xE,
            Self::Never => 0xF,
        }
    }

    #[must_use]
    pub const fn from_value(v: u32) -> Self {
        match v & 0xF {
            0x0 => Self::Eq,
            0x1 => Self::Ne,
            0x2 => Self::Cs,
            0x3 => Self::Cc,
            0x4 => Self::Mi,
            0x5 => Self::Pl,
            0x6 => Self::Vs,
            0x7 => Self::Vc,
            0x8 => Self::Hi,
            0x9 => Self::Ls,
            0xA => Self::Ge,
            0xB => Self::Lt,
            0xC => Self::Gt,
            0xD => Self::Le,
            0xE => Self::Always,
            _ => Self::Never,
        }
    }

    /// Greedy longest-match lookup used when splitting a mnemonic like
    /// `blsne` into base mnemonic + suffix: tries every known 2 letter
    /// condition mnemonic first so `ls` wins over a base mnemonic that
    /// happens to end the same way.
    #[must_use]
    pub fn parse_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix.to_ascii_lowercase().as_str() {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "cs" | "hs" => Self::Cs,
            "cc" | "lo" => Self::Cc,
            "mi" => Self::Mi,
            "pl" => Self::Pl,
            "vs" => Self::Vs,
            "vc" => Self::Vc,
            "hi" => Self::Hi,
            "ls" => Self::Ls,
            "ge" => Self::Ge,
            "lt" => Self::Lt,
            "gt" => Self::Gt,
            "le" => Self::Le,
            "al" => Self::Always,
            "nv" => Self::Never,
            _ => return None,
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Cs => "cs",
            Self::Cc => "cc",
            Self::Mi => "mi",
            Self::Pl => "pl",
            Self::Vs => "vs",
            Self::Vc => "vc",
            Self::Hi => "hi",
            Self::Ls => "ls",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Le => "le",
            Self::Always => "",
            Self::Never => "nv",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_through_value() {
        for v in 0..16u32 {
            assert_eq!(Condition::from_value(v).value(), v);
        }
    }

    #[test]
    fn always_displays_as_empty_string() {
        assert_eq!(Condition::Always.to_string(), "");
    }

    #[test]
    fn parses_aliases() {
        assert_eq!(Condition::parse_suffix("hs"), Some(Condition::Cs));
        assert_eq!(Condition::parse_suffix("lo"), Some(Condition::Cc));
        assert_eq!(Condition::parse_suffix("zz"), None);
    }
}
