//! Work area - on-disk scratch space for runtime-state blobs
//!
//! Layout:
//!
//! ```text
//! <work_dir>/
//!   .gitignore        ignore everything in here
//!   session.json      persisted session
//!   0/state.blob      state dumped after command 0
//!   1/state.blob
//! ```

use crate::core::CommandLog;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of a runtime-state blob inside a command's entry
pub const STATE_BLOB_FILE: &str = "state.blob";

/// File name of the persisted session
pub const SESSION_FILE: &str = "session.json";

const IGNORE_FILE: &str = ".gitignore";

/// Per-command directories under one root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkArea {
    root: PathBuf,
}

impl WorkArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Where the state blob for command `id` lives
    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.entry_dir(id).join(STATE_BLOB_FILE)
    }

    pub fn session_path(&self) -> PathBuf {
        self.root.join(SESSION_FILE)
    }

    /// Create the entry directory for `id`. Idempotent.
    pub fn reserve(&self, id: &str) -> Result<PathBuf> {
        let dir = self.entry_dir(id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn has_blob(&self, id: &str) -> bool {
        self.blob_path(id).is_file()
    }

    /// Most recent command id in `log` that has a state blob
    pub fn latest_blob(&self, log: &CommandLog) -> Option<String> {
        log.iter()
            .rev()
            .map(|r| r.id.clone())
            .find(|id| self.has_blob(id))
    }

    /// Ask version control tools to ignore the work area
    pub fn mark_ignored(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(IGNORE_FILE), "*\n")?;
        Ok(())
    }

    /// Remove the whole work area
    pub fn purge(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
            log::info!("Removed work area {}", self.root.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reserve_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let area = WorkArea::new(tmp.path().join("work"));

        let first = area.reserve("0").unwrap();
        let second = area.reserve("0").unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert_eq!(area.blob_path("0"), first.join(STATE_BLOB_FILE));
    }

    #[test]
    fn test_purge_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let area = WorkArea::new(tmp.path().join("work"));
        area.reserve("3").unwrap();
        area.mark_ignored().unwrap();

        area.purge().unwrap();
        assert!(!area.root().exists());
        // Purging an absent area is fine.
        area.purge().unwrap();
    }

    #[test]
    fn test_mark_ignored_writes_gitignore() {
        let tmp = TempDir::new().unwrap();
        let area = WorkArea::new(tmp.path());
        area.mark_ignored().unwrap();
        let content = fs::read_to_string(tmp.path().join(".gitignore")).unwrap();
        assert_eq!(content, "*\n");
    }

    #[test]
    fn test_latest_blob_skips_missing_entries() {
        let tmp = TempDir::new().unwrap();
        let area = WorkArea::new(tmp.path());
        let mut log = CommandLog::new();
        for cmd in ["a = 1", "b = 2", "print(a +"] {
            log.push(cmd.to_string());
        }

        assert_eq!(area.latest_blob(&log), None);

        for id in ["0", "1"] {
            area.reserve(id).unwrap();
            fs::write(area.blob_path(id), b"opaque").unwrap();
        }
        area.reserve("2").unwrap();
        assert_eq!(area.latest_blob(&log).as_deref(), Some("1"));
    }
}
