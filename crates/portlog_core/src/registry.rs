//! Open-segment registry.
//!
//! The registry is the only synchronisation point between capture loops,
//! background compression and the consolidator:
//!
//! - a path is marked **before** its file is opened for writing
//! - it is unmarked only **after** the file is closed and no further writes
//!   or renames will touch it
//! - the consolidator never reads, uploads or deletes a marked path

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Set of segment paths that are currently being written.
///
/// Cloning yields another handle to the same set. A single coarse lock is
/// used; contention is one mark/unmark per rotation and one lookup per file
/// per consolidation pass.
#[derive(Debug, Clone, Default)]
pub struct SegmentRegistry {
    open: Arc<Mutex<HashSet<PathBuf>>>,
}

impl SegmentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `path` as open for writing.
    pub fn mark(&self, path: &Path) {
        self.open.lock().insert(path.to_path_buf());
    }

    /// Releases `path`.
    pub fn unmark(&self, path: &Path) {
        self.open.lock().remove(path);
    }

    /// Returns true if `path` is currently marked open.
    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        self.open.lock().contains(path)
    }

    /// Returns the number of open paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    /// Returns true if no path is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }

    /// Returns the open paths, sorted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.open.lock().iter().cloned().collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn mark_and_unmark() {
        let registry = SegmentRegistry::new();
        let path = Path::new("/data/0_2024-05-01_00-00-00");

        assert!(!registry.is_open(path));
        registry.mark(path);
        assert!(registry.is_open(path));
        assert_eq!(registry.len(), 1);

        registry.unmark(path);
        assert!(!registry.is_open(path));
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let registry = SegmentRegistry::new();
        let other = registry.clone();

        other.mark(Path::new("a"));
        assert!(registry.is_open(Path::new("a")));
    }

    #[test]
    fn unmark_unknown_is_noop() {
        let registry = SegmentRegistry::new();
        registry.unmark(Path::new("missing"));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_marks() {
        let registry = SegmentRegistry::new();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        let path = PathBuf::from(format!("{i}_{j}"));
                        registry.mark(&path);
                        assert!(registry.is_open(&path));
                        if j % 2 == 0 {
                            registry.unmark(&path);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 8 * 50);
        assert_eq!(registry.snapshot().len(), 400);
    }
}
