//! Modification-time bookkeeping for loaded files.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rustc_hash::FxHashMap;

/// How a file's current mtime compares to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// First sighting; the file is recorded, not reloaded.
    Unseen,
    Unchanged,
    Modified,
}

/// Last-seen timestamps per file, plus the files whose last reload skipped
/// conditional definitions.
#[derive(Debug, Clone, Default)]
pub struct ReloadLedger {
    timestamps: FxHashMap<PathBuf, SystemTime>,
    skipped: FxHashMap<PathBuf, SystemTime>,
}

impl ReloadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, path: &Path, mtime: SystemTime) -> FileState {
        match self.timestamps.get(path) {
            None => FileState::Unseen,
            Some(seen) if *seen == mtime => FileState::Unchanged,
            Some(_) => FileState::Modified,
        }
    }

    pub fn record(&mut self, path: &Path, mtime: SystemTime) {
        self.timestamps.insert(path.to_path_buf(), mtime);
    }

    pub fn timestamp(&self, path: &Path) -> Option<SystemTime> {
        self.timestamps.get(path).copied()
    }

    pub fn mark_skipped(&mut self, path: &Path, mtime: SystemTime) {
        self.skipped.insert(path.to_path_buf(), mtime);
    }

    pub fn clear_skipped(&mut self, path: &Path) -> bool {
        self.skipped.remove(path).is_some()
    }

    pub fn is_skipped(&self, path: &Path) -> bool {
        self.skipped.contains_key(path)
    }

    /// Remove and return every skipped file, sorted by path.
    pub fn take_skipped(&mut self) -> Vec<(PathBuf, SystemTime)> {
        let mut files: Vec<_> = self.skipped.drain().collect();
        files.sort();
        files
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_check_states() {
        let mut ledger = ReloadLedger::new();
        let path = Path::new("/tmp/a.php");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = t0 + Duration::from_secs(1);

        assert_eq!(ledger.check(path, t0), FileState::Unseen);
        ledger.record(path, t0);
        assert_eq!(ledger.check(path, t0), FileState::Unchanged);
        assert_eq!(ledger.check(path, t1), FileState::Modified);
        assert_eq!(ledger.timestamp(path), Some(t0));
    }

    #[test]
    fn test_skipped_files() {
        let mut ledger = ReloadLedger::new();
        let t = SystemTime::UNIX_EPOCH;
        ledger.mark_skipped(Path::new("/b.php"), t);
        ledger.mark_skipped(Path::new("/a.php"), t);
        assert!(ledger.is_skipped(Path::new("/a.php")));
        assert_eq!(ledger.skipped_count(), 2);

        assert!(ledger.clear_skipped(Path::new("/b.php")));
        assert!(!ledger.clear_skipped(Path::new("/b.php")));

        ledger.mark_skipped(Path::new("/c.php"), t);
        let taken = ledger.take_skipped();
        assert_eq!(taken[0].0, PathBuf::from("/a.php"));
        assert_eq!(taken.len(), 2);
        assert_eq!(ledger.skipped_count(), 0);
    }
}
