use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::pos::FilePos;

/// The full error taxonomy produced while lexing, evaluating, emitting or
/// watching a source tree. Every variant that can be attributed to a single
/// source location carries a [`FilePos`] so [`Diagnostic`] can render a
/// `<path>:<line>:<column>: <message>` line.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("{pos}: unexpected character {found:?}")]
    UnexpectedChar { pos: FilePos, found: char },

    #[error("{pos}: unterminated string literal")]
    UnterminatedString { pos: FilePos },

    #[error("{pos}: invalid escape sequence \\{escape}")]
    InvalidEscape { pos: FilePos, escape: char },

    #[error("{pos}: invalid numeric literal {text:?}")]
    InvalidNumber { pos: FilePos, text: String },

    #[error("{pos}: expected {expected}, found {found}")]
    UnexpectedToken {
        pos: FilePos,
        expected: String,
        found: String,
    },

    #[error("{pos}: unexpected end of input, expected {expected}")]
    UnexpectedEof { pos: FilePos, expected: String },

    #[error("{pos}: unknown identifier {name:?}")]
    UnknownIdentifier { pos: FilePos, name: String },

    #[error("{pos}: unknown function {name:?}")]
    UnknownFunction { pos: FilePos, name: String },

    #[error("{pos}: wrong number of arguments for {name:?}: expected {expected}, found {found}")]
    ArityMismatch {
        pos: FilePos,
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("{pos}: division by zero")]
    DivisionByZero { pos: FilePos },

    #[error("{pos}: log2 of non power of two value {value}")]
    Log2Assert { pos: FilePos, value: i64 },

    #[error("{pos}: negative value {value} has no integer square root")]
    NegativeSqrt { pos: FilePos, value: i64 },

    #[error("{pos}: redefinition of constant {name:?}")]
    DuplicateConstant { pos: FilePos, name: String },

    #[error("{pos}: redefinition of label {name:?}")]
    DuplicateLabel { pos: FilePos, name: String },

    #[error("{pos}: {name:?} is a reserved identifier")]
    ReservedIdentifier { pos: FilePos, name: String },

    #[error("{pos}: no enclosing scope to close")]
    UnbalancedScope { pos: FilePos },

    #[error("{pos}: struct {name:?} is not defined")]
    UnknownStruct { pos: FilePos, name: String },

    #[error("{pos}: struct {name:?} has no member {member:?}")]
    UnknownMember {
        pos: FilePos,
        name: String,
        member: String,
    },

    #[error("{pos}: anonymous label reference out of range")]
    AnonymousLabelOutOfRange { pos: FilePos },

    #[error("{pos}: unknown directive {name:?}")]
    UnknownDirective { pos: FilePos, name: String },

    #[error("{pos}: {message}")]
    DirectiveError { pos: FilePos, message: String },

    #[error("{pos}: unrecognised instruction {mnemonic:?}")]
    UnknownMnemonic { pos: FilePos, mnemonic: String },

    #[error("{pos}: no encoding of {mnemonic:?} matches the given operands")]
    NoMatchingForm { pos: FilePos, mnemonic: String },

    #[error("{pos}: value {value} does not fit in {bits} bits")]
    ValueOutOfRange {
        pos: FilePos,
        value: i64,
        bits: u32,
    },

    #[error("{pos}: {value} cannot be expressed as a rotated 8 bit immediate")]
    NotRotatable { pos: FilePos, value: u32 },

    #[error("{pos}: branch target {delta} is out of reach")]
    BranchOutOfRange { pos: FilePos, delta: i64 },

    #[error("{pos}: misaligned address 0x{address:08x}, expected a multiple of {align}")]
    Misaligned {
        pos: FilePos,
        address: u32,
        align: u32,
    },

    #[error("unresolved reference to {name:?}, first used at {pos}")]
    UnresolvedReference { pos: FilePos, name: String },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{pos}: cannot .include {path:?}: include cycle back to itself")]
    IncludeCycle { pos: FilePos, path: PathBuf },

    #[error("{pos}: .once file {path:?} included more than once, skipping")]
    OnceSkipped { pos: FilePos, path: PathBuf },

    #[error("{pos}: embedded file {path:?} exceeds the addressable range")]
    EmbedTooLarge { pos: FilePos, path: PathBuf },

    #[error("{pos}: script error: {message}")]
    ScriptError { pos: FilePos, message: String },

    #[error("running an assembled image requires an external emulator; none is configured")]
    NoEmulator,

    #[error("{0}")]
    Other(String),
}

impl AsmError {
    #[must_use]
    pub const fn pos(&self) -> Option<&FilePos> {
        match self {
            Self::UnexpectedChar { pos, .. }
            | Self::UnterminatedString { pos }
            | Self::InvalidEscape { pos, .. }
            | Self::InvalidNumber { pos, .. }
            | Self::UnexpectedToken { pos, .. }
            | Self::UnexpectedEof { pos, .. }
            | Self::UnknownIdentifier { pos, .. }
            | Self::UnknownFunction { pos, .. }
            | Self::ArityMismatch { pos, .. }
            | Self::DivisionByZero { pos }
            | Self::Log2Assert { pos, .. }
            | Self::NegativeSqrt { pos, .. }
            | Self::DuplicateConstant { pos, .. }
            | Self::DuplicateLabel { pos, .. }
            | Self::ReservedIdentifier { pos, .. }
            | Self::UnbalancedScope { pos }
            | Self::UnknownStruct { pos, .. }
            | Self::UnknownMember { pos, .. }
            | Self::AnonymousLabelOutOfRange { pos }
            | Self::UnknownDirective { pos, .. }
            | Self::DirectiveError { pos, .. }
            | Self::UnknownMnemonic { pos, .. }
            | Self::NoMatchingForm { pos, .. }
            | Self::ValueOutOfRange { pos, .. }
            | Self::NotRotatable { pos, .. }
            | Self::BranchOutOfRange { pos, .. }
            | Self::Misaligned { pos, .. }
            | Self::UnresolvedReference { pos, .. }
            | Self::IncludeCycle { pos, .. }
            | Self::OnceSkipped { pos, .. }
            | Self::EmbedTooLarge { pos, .. }
            | Self::ScriptError { pos, .. } => Some(pos),
            Self::Io { .. } | Self::NoEmulator | Self::Other(_) => None,
        }
    }
}

/// Policy for what the driver does when a statement produces an [`AsmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Stop at the first error (default for `make`).
    Abort,
    /// Collect every error in the current pass and report them all (used by
    /// watch mode, so a single typo doesn't hide the next one).
    Collect,
}

/// A rendered diagnostic, ready to print to stderr or stream over `rtrb`.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub pos: Option<FilePos>,
    pub message: String,
}

impl Diagnostic {
    #[must_use]
    pub fn from_error(err: &AsmError) -> Self {
        Self {
            pos: err.pos().cloned(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pos {
            Some(pos) => write!(f, "{pos}: {}", strip_pos_prefix(&self.message)),
            None => write!(f, "{}", self.message),
        }
    }
}

/// `AsmError`'s `Display` already includes the position for most variants;
/// when rendering through `Diagnostic` we print the position once, so strip
/// the leading `file:line:col: ` the error's own message carries.
fn strip_pos_prefix(message: &str) -> &str {
    message
        .split_once(": ")
        .filter(|(head, _)| head.matches(':').count() >= 2)
        .map_or(message, |(_, rest)| rest)
}

pub type AsmResult<T> = Result<T, AsmError>;
