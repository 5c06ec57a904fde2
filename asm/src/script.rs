use std::collections::HashMap;
use std::path::Path;

use crate::error::{AsmError, AsmResult};
use crate::pos::FilePos;

/// A value a script can bind under [`ScriptEngine::export`] and later read
/// back through [`ScriptEngine::lookup`]. Scripts only ever need to hand
/// numbers back to assembly source, but bytes are kept distinct so `embed`
/// results round-trip without a lossy numeric reinterpretation.
#[derive(Debug, Clone)]
pub enum ScriptValue {
    Number(i64),
    Bytes(Vec<u8>),
}

impl ScriptValue {
    #[must_use]
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bytes(_) => None,
        }
    }
}

/// The interface the assembler exposes to `.script … .end` blocks (§6).
/// Implemented once by [`BuiltinScriptEngine`]; kept as a trait so a richer
/// embedded-language engine can be swapped in without touching the driver.
pub trait ScriptEngine {
    fn lookup(&self, name: &str) -> Option<ScriptValue>;
    fn export(&mut self, name: String, value: ScriptValue);
    fn embed(&self, path: &Path) -> AsmResult<Vec<u8>>;
    fn include(&self, path: &Path) -> AsmResult<String>;
}

/// A deterministic script engine: `.script` bodies are a flat sequence of
/// `export NAME = expr;`-style bindings, each evaluated against whatever the
/// enclosing scope already resolves plus earlier exports in the same block.
/// Determinism (no clock, no RNG, no environment reads) is exactly what makes
/// watch-mode caching of script results sound.
#[derive(Default)]
pub struct BuiltinScriptEngine {
    exports: HashMap<String, ScriptValue>,
}

impl BuiltinScriptEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn exports(&self) -> &HashMap<String, ScriptValue> {
        &self.exports
    }
}

impl ScriptEngine for BuiltinScriptEngine {
    fn lookup(&self, name: &str) -> Option<ScriptValue> {
        self.exports.get(name).cloned()
    }

    fn export(&mut self, name: String, value: ScriptValue) {
        self.exports.insert(name, value);
    }

    fn embed(&self, path: &Path) -> AsmResult<Vec<u8>> {
        std::fs::read(path).map_err(|source| AsmError::Io { path: path.to_path_buf(), source })
    }

    fn include(&self, path: &Path) -> AsmResult<String> {
        std::fs::read_to_string(path).map_err(|source| AsmError::Io { path: path.to_path_buf(), source })
    }
}

/// One `export NAME = expr` statement inside a `.script` block.
#[derive(Debug, Clone)]
pub struct ScriptExport {
    pub name: String,
    pub value: i64,
    pub pos: FilePos,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exported_values_are_looked_up_by_name() {
        let mut engine = BuiltinScriptEngine::new();
        engine.export("TILE_COUNT".to_string(), ScriptValue::Number(42));
        assert_eq!(engine.lookup("TILE_COUNT").unwrap().as_number(), Some(42));
        assert!(engine.lookup("missing").is_none());
    }
}
