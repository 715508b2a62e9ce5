//! Operator-maintained set of voucher codes that must never be accepted.
//!
//! The list is data, not code: it is loaded from a file at startup and can be
//! swapped at runtime with [`BanList::reload`]. Readers take a cheap snapshot
//! and see either the old or the new version, never a mix.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::models::voucher::VoucherCode;

#[derive(Debug, Default)]
struct BanSet {
    version: u64,
    codes: HashSet<String>,
}

#[derive(Debug)]
pub struct BanList {
    source: Option<PathBuf>,
    current: RwLock<Arc<BanSet>>,
}

impl BanList {
    /// Empty list with no backing file.
    pub fn empty() -> Self {
        Self::from_codes(std::iter::empty::<&str>())
    }

    /// In-memory list. Entries are normalized; malformed ones are skipped.
    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let codes = codes
            .into_iter()
            .filter_map(|c| VoucherCode::parse(c.as_ref()))
            .map(String::from)
            .collect();
        Self {
            source: None,
            current: RwLock::new(Arc::new(BanSet { version: 1, codes })),
        }
    }

    /// Load from a text file (one code per line, `#` comments) or a JSON
    /// array of strings.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BanListError> {
        let path = path.into();
        let codes = read_codes(&path)?;
        info!(path = %path.display(), count = codes.len(), "Loaded ban-list");
        Ok(Self {
            source: Some(path),
            current: RwLock::new(Arc::new(BanSet { version: 1, codes })),
        })
    }

    /// Re-read the backing file and swap the new set in. On error the
    /// current version stays active. Returns the new version number.
    pub fn reload(&self) -> Result<u64, BanListError> {
        let path = self.source.as_ref().ok_or(BanListError::NoSource)?;
        let codes = read_codes(path)?;

        let mut current = self.current.write();
        let version = current.version + 1;
        let count = codes.len();
        *current = Arc::new(BanSet { version, codes });
        drop(current);

        info!(version, count, "Reloaded ban-list");
        Ok(version)
    }

    /// Replace the set in place (for lists without a backing file).
    pub fn replace<I, S>(&self, codes: I) -> u64
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let codes = codes
            .into_iter()
            .filter_map(|c| VoucherCode::parse(c.as_ref()))
            .map(String::from)
            .collect();
        let mut current = self.current.write();
        let version = current.version + 1;
        *current = Arc::new(BanSet { version, codes });
        version
    }

    pub fn contains(&self, code: &str) -> bool {
        self.current.read().codes.contains(code)
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    pub fn len(&self) -> usize {
        self.current.read().codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent view for checking many codes against one version.
    pub fn snapshot(&self) -> BanSnapshot {
        BanSnapshot(self.current.read().clone())
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::empty()
    }
}

/// One immutable version of the ban-list.
#[derive(Debug, Clone)]
pub struct BanSnapshot(Arc<BanSet>);

impl BanSnapshot {
    pub fn contains(&self, code: &str) -> bool {
        self.0.codes.contains(code)
    }

    pub fn version(&self) -> u64 {
        self.0.version
    }
}

fn read_codes(path: &Path) -> Result<HashSet<String>, BanListError> {
    let raw = std::fs::read_to_string(path).map_err(|source| BanListError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let entries: Vec<String> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).map_err(|source| BanListError::Parse {
            path: path.display().to_string(),
            source,
        })?
    } else {
        raw.lines()
            .map(|line| line.split('#').next().unwrap_or_default().trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    };

    let mut codes = HashSet::with_capacity(entries.len());
    for entry in entries {
        match VoucherCode::parse(&entry) {
            Some(code) => {
                codes.insert(String::from(code));
            }
            None => warn!(entry = %entry, "Skipping malformed ban-list entry"),
        }
    }
    Ok(codes)
}

#[derive(Debug, thiserror::Error)]
pub enum BanListError {
    #[error("cannot read ban-list {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse ban-list {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("ban-list has no backing file to reload")]
    NoSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_codes_normalizes_and_skips_malformed() {
        let list = BanList::from_codes(["1234 1234 1234 1234", "123", "9999888877776666"]);
        assert!(list.contains("1234123412341234"));
        assert!(list.contains("9999888877776666"));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_load_text_file_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banned.txt");
        std::fs::write(
            &path,
            "# sample codes printed on every demo card\n1234123412341234\n\n0000 0000 0000 0000 # zeros\nnot-a-code\n",
        )
        .unwrap();

        let list = BanList::load(&path).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains("0000000000000000"));
        assert_eq!(list.version(), 1);
    }

    #[test]
    fn test_load_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banned.json");
        std::fs::write(&path, r#"["1234123412341234", "1111 2222 3333 4444"]"#).unwrap();

        let list = BanList::load(&path).unwrap();
        assert!(list.contains("1111222233334444"));
    }

    #[test]
    fn test_reload_swaps_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banned.txt");
        std::fs::write(&path, "1234123412341234\n").unwrap();
        let list = BanList::load(&path).unwrap();
        let before = list.snapshot();

        std::fs::write(&path, "5555666677778888\n").unwrap();
        assert_eq!(list.reload().unwrap(), 2);

        assert!(!list.contains("1234123412341234"));
        assert!(list.contains("5555666677778888"));
        // Snapshots taken earlier keep their version.
        assert!(before.contains("1234123412341234"));
        assert_eq!(before.version(), 1);
    }

    #[test]
    fn test_failed_reload_keeps_current_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banned.txt");
        std::fs::write(&path, "1234123412341234\n").unwrap();
        let list = BanList::load(&path).unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(list.reload().is_err());
        assert!(list.contains("1234123412341234"));
        assert_eq!(list.version(), 1);
    }

    #[test]
    fn test_reload_without_source() {
        let list = BanList::empty();
        assert!(matches!(list.reload(), Err(BanListError::NoSource)));
        assert_eq!(list.replace(["1234123412341234"]), 2);
        assert!(list.contains("1234123412341234"));
    }
}
