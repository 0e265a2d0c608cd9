//! File-backed set of (resource, class) pairs the account may not query.
//!
//! Persisted as a flat JSON array of `resource::class` strings at
//! `<cache_dir>/rets_lockout.json`. Only the sync engine mutates the set;
//! everything else treats it as read-only.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// File name of the lockout set inside the cache directory.
pub const LOCKOUT_FILE: &str = "rets_lockout.json";

#[derive(Debug)]
pub struct LockoutSet {
    path: PathBuf,
    entries: BTreeSet<String>,
}

impl LockoutSet {
    /// Load the persisted set; a missing or unreadable file starts empty.
    pub fn load(cache_dir: &Path) -> Self {
        let path = cache_dir.join(LOCKOUT_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeSet<String>>(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "ignoring unreadable lockout file");
                    BTreeSet::new()
                }
            },
            Err(_) => BTreeSet::new(),
        };
        Self { path, entries }
    }

    fn key(resource: &str, class: Option<&str>) -> String {
        format!("{}::{}", resource, class.unwrap_or(""))
    }

    pub fn contains(&self, resource: &str, class: Option<&str>) -> bool {
        self.entries.contains(&Self::key(resource, class))
    }

    /// Add a pair and persist the set. Returns false when it was already
    /// present.
    pub fn insert(&mut self, resource: &str, class: Option<&str>) -> std::io::Result<bool> {
        let added = self.entries.insert(Self::key(resource, class));
        if added {
            info!(resource, class = class.unwrap_or(""), "added lockout entry");
            self.persist()?;
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_and_persists_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = LockoutSet::load(dir.path());
        assert!(set.is_empty());

        assert!(set.insert("Property", Some("CI_3")).unwrap());
        assert!(!set.insert("Property", Some("CI_3")).unwrap());
        assert!(set.contains("Property", Some("CI_3")));
        assert!(!set.contains("Property", Some("RE_1")));

        // Reload sees the persisted entry.
        let reloaded = LockoutSet::load(dir.path());
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains("Property", Some("CI_3")));
    }

    #[test]
    fn classless_pairs_use_empty_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = LockoutSet::load(dir.path());
        set.insert("OpenHouse", None).unwrap();
        assert!(set.contains("OpenHouse", None));
        assert!(!set.contains("OpenHouse", Some("OH_1")));

        let raw = std::fs::read_to_string(dir.path().join(LOCKOUT_FILE)).unwrap();
        assert!(raw.contains("OpenHouse::"));
    }

    #[test]
    fn garbage_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCKOUT_FILE), "not json").unwrap();
        let set = LockoutSet::load(dir.path());
        assert!(set.is_empty());
    }
}
