use std::fmt;
use std::rc::Rc;

/// A location inside a source file, used to render diagnostics and to key
/// the watch dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilePos {
    pub file: Rc<str>,
    pub line: u32,
    pub column: u32,
}

impl FilePos {
    #[must_use]
    pub fn new(file: Rc<str>, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }

    #[must_use]
    pub fn start_of(file: Rc<str>) -> Self {
        Self { file, line: 1, column: 1 }
    }
}

impl fmt::Display for FilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}
