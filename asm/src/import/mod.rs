use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{AsmError, AsmResult};
use crate::pos::FilePos;

pub type ImportId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `.include` — must form a DAG; a cycle is a hard error since each
    /// included file is textually spliced into its parent.
    Include,
    /// `.import` — a named, address-resolving reference to another file's
    /// top level scope. Cycles are allowed: two files may `.import` each
    /// other as long as neither needs the other's value before both have
    /// finished their own first pass.
    Import,
    /// `.embed` — raw bytes copied verbatim, never re-parsed.
    Embed,
}

#[derive(Debug)]
pub struct Import {
    pub id: ImportId,
    pub path: PathBuf,
    pub kind: ImportKind,
    pub parent: Option<ImportId>,
    pub requested_at: FilePos,
    pub once: bool,
}

/// An arena of every file pulled in by `.include`/`.import`/`.embed`,
/// addressed by index rather than `Rc` so cyclic `.import` edges don't need
/// reference counting or weak pointers to stay sound.
#[derive(Default)]
pub struct ImportArena {
    nodes: Vec<Import>,
    by_path: HashMap<PathBuf, Vec<ImportId>>,
    once_seen: HashMap<PathBuf, ImportId>,
}

impl ImportArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new import edge, checking `.include` cycles against the
    /// parent chain and `.once` against every previously resolved path.
    /// Returns `Ok(None)` when a `.once` file has already been included and
    /// should be silently skipped.
    pub fn add(
        &mut self,
        path: &Path,
        kind: ImportKind,
        parent: Option<ImportId>,
        once: bool,
        requested_at: &FilePos,
    ) -> AsmResult<Option<ImportId>> {
        let canon = path.to_path_buf();

        if once {
            if let Some(&existing) = self.once_seen.get(&canon) {
                let _ = existing;
                return Ok(None);
            }
        }

        if kind == ImportKind::Include {
            let mut cursor = parent;
            while let Some(id) = cursor {
                if self.nodes[id].path == canon {
                    return Err(AsmError::IncludeCycle {
                        pos: requested_at.clone(),
                        path: canon,
                    });
                }
                cursor = self.nodes[id].parent;
            }
        }

        let id = self.nodes.len();
        self.nodes.push(Import {
            id,
            path: canon.clone(),
            kind,
            parent,
            requested_at: requested_at.clone(),
            once,
        });
        self.by_path.entry(canon.clone()).or_default().push(id);
        if once {
            self.once_seen.insert(canon, id);
        }
        Ok(Some(id))
    }

    #[must_use]
    pub fn get(&self, id: ImportId) -> &Import {
        &self.nodes[id]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes reachable from `id` following `.import` edges, used by the
    /// watch coordinator to decide which in-memory units need re-resolving
    /// when one file on disk changes.
    #[must_use]
    pub fn importers_of(&self, path: &Path) -> Vec<ImportId> {
        self.by_path.get(path).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn root_file(&self, name: &str) -> Rc<str> {
        Rc::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn pos() -> FilePos {
        FilePos::new(Rc::from("t"), 1, 1)
    }

    #[test]
    fn include_cycle_is_rejected() {
        let mut arena = ImportArena::new();
        let a = arena
            .add(&PathBuf::from("a.s"), ImportKind::Include, None, false, &pos())
            .unwrap()
            .unwrap();
        let b = arena
            .add(&PathBuf::from("b.s"), ImportKind::Include, Some(a), false, &pos())
            .unwrap()
            .unwrap();
        let back = arena.add(&PathBuf::from("a.s"), ImportKind::Include, Some(b), false, &pos());
        assert!(back.is_err());
    }

    #[test]
    fn import_cycle_is_allowed() {
        let mut arena = ImportArena::new();
        let a = arena
            .add(&PathBuf::from("a.s"), ImportKind::Import, None, false, &pos())
            .unwrap()
            .unwrap();
        let b = arena
            .add(&PathBuf::from("b.s"), ImportKind::Import, Some(a), false, &pos())
            .unwrap()
            .unwrap();
        let back = arena.add(&PathBuf::from("a.s"), ImportKind::Import, Some(b), false, &pos());
        assert!(back.unwrap().is_some());
    }

    #[test]
    fn once_file_is_skipped_on_second_include() {
        let mut arena = ImportArena::new();
        let first = arena
            .add(&PathBuf::from("shared.s"), ImportKind::Include, None, true, &pos())
            .unwrap();
        assert!(first.is_some());
        let second = arena
            .add(&PathBuf::from("shared.s"), ImportKind::Include, None, true, &pos())
            .unwrap();
        assert_eq!(second, None);
    }
}
