use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use macros::acquire_lock;
use vecfixed::VecFixed;

use crate::driver::{Driver, SourceReader};
use crate::error::{AsmError, AsmResult, Diagnostic, ErrorPolicy};

/// Debounce window: filesystem events are coalesced until this long has
/// passed since the last one, so a save-everything editor doesn't trigger a
/// rebuild per touched file.
const DEBOUNCE: Duration = Duration::from_secs(3);

/// Supplies batches of changed paths. Implemented by [`OsWatcher`] for real
/// runs and by a plain channel/vec in tests, so the invalidation logic below
/// never touches `notify` directly.
pub trait ChangeSource {
    /// Blocks up to `timeout` for the next batch of changed paths; `None`
    /// means nothing changed in that window.
    fn next_batch(&mut self, timeout: Duration) -> Option<Vec<PathBuf>>;
}

/// A `notify`-backed [`ChangeSource`]. Filesystem events are pushed onto a
/// single-producer/single-consumer `rtrb` ring buffer from the watcher's own
/// callback thread and drained here, matching the single
/// background-watcher-task rule: one extra task, one bounded channel.
pub struct OsWatcher {
    _watcher: notify::RecommendedWatcher,
    consumer: rtrb::Consumer<PathBuf>,
}

impl OsWatcher {
    pub fn new(paths: &[PathBuf]) -> AsmResult<Self> {
        use notify::Watcher;

        let (mut producer, consumer) = rtrb::RingBuffer::<PathBuf>::new(256);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let _ = producer.push(path);
                }
            }
        })
        .map_err(|e| AsmError::Other(format!("failed to start filesystem watcher: {e}")))?;

        for path in paths {
            watcher
                .watch(path, notify::RecursiveMode::NonRecursive)
                .map_err(|e| AsmError::Other(format!("failed to watch {}: {e}", path.display())))?;
        }

        Ok(Self { _watcher: watcher, consumer })
    }
}

/// How often to poll the ring buffer while waiting for the first event or
/// for the debounce window to go quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl ChangeSource for OsWatcher {
    fn next_batch(&mut self, timeout: Duration) -> Option<Vec<PathBuf>> {
        let deadline = Instant::now() + timeout;
        let first = loop {
            if let Ok(path) = self.consumer.pop() {
                break path;
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let mut batch = vec![first];
        let mut quiet_until = Instant::now() + DEBOUNCE;
        while Instant::now() < quiet_until {
            match self.consumer.pop() {
                Ok(path) => {
                    batch.push(path);
                    quiet_until = Instant::now() + DEBOUNCE;
                }
                Err(_) => std::thread::sleep(POLL_INTERVAL),
            }
        }
        Some(batch)
    }
}

/// One rebuild outcome, printed the way watch mode's stdout markers describe
/// them (`> <hex bytes>` on success, `! <error>` on failure).
pub enum RebuildOutcome {
    Ok { bytes: Vec<u8>, read: Vec<PathBuf> },
    Err(Diagnostic),
}

/// Tracks the file set read by the last successful build and the
/// `.import`/`.include`/`.embed` dependency edges between them, so a change
/// notification only forces a re-run of what that change could possibly
/// have affected. Per the concurrency model, this owns the only mutable
/// shared state in watch mode: everything else is single-threaded.
pub struct Coordinator<'r> {
    reader: &'r dyn SourceReader,
    base_address: u32,
    entry: PathBuf,
    last_good: Option<Vec<u8>>,
    dependents: HashMap<PathBuf, HashSet<PathBuf>>,
    history: std::sync::Mutex<VecFixed<20, String>>,
}

impl<'r> Coordinator<'r> {
    #[must_use]
    pub fn new(reader: &'r dyn SourceReader, entry: PathBuf, base_address: u32) -> Self {
        Self {
            reader,
            base_address,
            entry,
            last_good: None,
            dependents: HashMap::new(),
            history: std::sync::Mutex::new(VecFixed::new()),
        }
    }

    /// Every file the last successful build actually read, for the caller to
    /// hand to [`OsWatcher::new`].
    #[must_use]
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.dependents.keys().cloned().collect()
    }

    /// The output of the last build that succeeded, kept around so a failed
    /// rebuild leaves the previous good image on disk untouched.
    #[must_use]
    pub fn last_known_good(&self) -> Option<&[u8]> {
        self.last_good.as_deref()
    }

    fn record(&self, line: String) {
        acquire_lock!(self.history, h => { h.push(line) });
    }

    #[must_use]
    pub fn history(&self) -> String {
        acquire_lock!(self.history, h => { h.join("\n") })
    }

    /// Runs (or re-runs) the full build. A fresh [`Driver`] is used every
    /// time: the invalidation bookkeeping here only decides *when* to
    /// rebuild, not how to reuse partial state, since the driver's own
    /// `.import` graph already re-resolves in dependency order and the
    /// remaining cost is re-parsing text, which is cheap next to I/O. Every
    /// file the driver actually read is recorded as a dependency of the
    /// entry point, since a full rebuild is the unit of invalidation here:
    /// there's no partial re-resolution to target more narrowly.
    pub fn build(&mut self) -> RebuildOutcome {
        let mut driver = Driver::new(self.reader, self.base_address, ErrorPolicy::Collect);
        match driver.assemble(&self.entry) {
            Ok(bytes) => {
                for path in driver.read_paths() {
                    self.record_dependency(&path, &self.entry.clone());
                }
                self.last_good = Some(bytes.clone());
                let read = self.watched_paths();
                self.record(format!("ok: {} bytes", bytes.len()));
                RebuildOutcome::Ok { bytes, read }
            }
            Err(err) => {
                let diag = Diagnostic::from_error(&err);
                self.record(format!("err: {diag}"));
                RebuildOutcome::Err(diag)
            }
        }
    }

    /// Registers that `dependent` was read while processing `source` (an
    /// `.import`/`.include`/`.embed` target), so a later change to `source`
    /// is known to require re-checking `dependent`.
    pub fn record_dependency(&mut self, source: &Path, dependent: &Path) {
        self.dependents.entry(source.to_path_buf()).or_default().insert(dependent.to_path_buf());
    }

    /// All files that could be affected by a change to `changed`, found by
    /// walking the dependency edges recorded during the last build. A
    /// changed path that was never read during the last build (so it isn't
    /// a key in `dependents`) contributes nothing: it seeds the walk only
    /// when it's actually part of the known graph, otherwise an edit to a
    /// file the build never touched would trivially "affect" itself and
    /// force a rebuild regardless of relevance.
    #[must_use]
    pub fn affected_by(&self, changed: &[PathBuf]) -> HashSet<PathBuf> {
        let mut affected: HashSet<PathBuf> = HashSet::new();
        let mut frontier: Vec<PathBuf> = Vec::new();
        for path in changed {
            if self.dependents.contains_key(path) && affected.insert(path.clone()) {
                frontier.push(path.clone());
            }
        }
        while let Some(path) = frontier.pop() {
            if let Some(dependents) = self.dependents.get(&path) {
                for dep in dependents {
                    if affected.insert(dep.clone()) {
                        frontier.push(dep.clone());
                    }
                }
            }
        }
        affected
    }

    /// Runs the blocking watch loop: rebuild once immediately, then wait for
    /// change batches and rebuild again each time, printing the same markers
    /// `make`/`dis` diagnostics use plus the watch-specific ones. Returns
    /// only when `source` stops yielding batches (its channel closed).
    pub fn run(&mut self, source: &mut dyn ChangeSource, mut on_outcome: impl FnMut(&RebuildOutcome)) {
        let first = self.build();
        on_outcome(&first);
        loop {
            let Some(batch) = source.next_batch(Duration::from_secs(3600)) else {
                break;
            };
            let affected = self.affected_by(&batch);
            if affected.is_empty() {
                continue;
            }
            let outcome = self.build();
            on_outcome(&outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    struct ScriptedSource {
        batches: std::collections::VecDeque<Vec<PathBuf>>,
    }

    impl ChangeSource for ScriptedSource {
        fn next_batch(&mut self, _timeout: Duration) -> Option<Vec<PathBuf>> {
            self.batches.pop_front()
        }
    }

    #[derive(Default)]
    struct FixtureReader {
        files: RefCell<HashMap<PathBuf, String>>,
    }

    impl FixtureReader {
        fn new(files: &[(&str, &str)]) -> Self {
            let map = files.iter().map(|(p, s)| (PathBuf::from(p), (*s).to_string())).collect();
            Self { files: RefCell::new(map) }
        }
    }

    impl SourceReader for FixtureReader {
        fn read_to_string(&self, path: &Path) -> AsmResult<String> {
            self.files.borrow().get(path).cloned().ok_or_else(|| AsmError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            })
        }

        fn read_bytes(&self, path: &Path) -> AsmResult<Vec<u8>> {
            self.read_to_string(path).map(String::into_bytes)
        }
    }

    #[test]
    fn unrelated_changes_are_filtered_out_before_rebuilding() {
        let reader = FixtureReader::new(&[("main.s", "mov r0, #1\nbx lr\n")]);
        let mut coordinator = Coordinator::new(&reader, PathBuf::from("main.s"), 0x0800_0000);
        coordinator.record_dependency(&PathBuf::from("main.s"), &PathBuf::from("main.s"));

        let mut outcomes = Vec::new();
        let mut source = ScriptedSource { batches: vec![vec![PathBuf::from("unrelated.s")]].into() };
        coordinator.run(&mut source, |o| {
            outcomes.push(matches!(o, RebuildOutcome::Ok { .. }));
        });
        assert_eq!(outcomes, vec![true]);
    }

    #[test]
    fn changing_a_dependency_rebuilds_its_dependents() {
        let reader = FixtureReader::new(&[("main.s", "mov r0, #1\nbx lr\n")]);
        let mut coordinator = Coordinator::new(&reader, PathBuf::from("main.s"), 0x0800_0000);
        coordinator.record_dependency(&PathBuf::from("main.s"), &PathBuf::from("main.s"));
        let affected = coordinator.affected_by(&[PathBuf::from("main.s")]);
        assert!(affected.contains(&PathBuf::from("main.s")));
    }
}
