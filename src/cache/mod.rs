//! Persistent memory of processed entries.
//!
//! [`CacheFile`] owns a [`SeenCache`] (entries already handed to the download
//! engine) and an [`ErrorCache`] (entries whose dispatch recently failed) and
//! persists both as one JSON document:
//!
//! ```json
//! { "Version": 1, "Errors": { "<guid>": 1700000000 }, "Seen": [ ... ] }
//! ```
//!
//! Writes go to a temporary file in the target directory which is synced and
//! then renamed over the target, so a crash mid-write never leaves a partial
//! cache behind.

mod errors;
mod seen;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use errors::{ErrorCache, DEFAULT_HOLD_DOWN_HOURS};
pub use seen::{RetentionAnchor, RetentionPolicy, SeenCache, SeenRecord};

/// Highest on-disk format version this build understands.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cache file version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write cache file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// On-disk layout
// ============================================================================

fn default_version() -> u32 {
    CACHE_VERSION
}

#[derive(Deserialize)]
struct CacheDocument {
    #[serde(rename = "Version", default = "default_version")]
    version: u32,
    #[serde(rename = "Errors", default)]
    errors: BTreeMap<String, i64>,
    #[serde(rename = "Seen", default)]
    seen: Vec<SeenRecord>,
}

#[derive(Serialize)]
struct CacheDocumentRef<'a> {
    #[serde(rename = "Version")]
    version: u32,
    #[serde(rename = "Errors")]
    errors: &'a BTreeMap<String, i64>,
    #[serde(rename = "Seen")]
    seen: &'a [SeenRecord],
}

// ============================================================================
// CacheFile
// ============================================================================

/// Seen and error caches bound to a file on disk.
#[derive(Debug)]
pub struct CacheFile {
    path: PathBuf,
    version: u32,
    seen: SeenCache,
    errors: ErrorCache,
}

impl CacheFile {
    /// Empty cache that will be written to `path` on the first flush.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: CACHE_VERSION,
            seen: SeenCache::default(),
            errors: ErrorCache::default(),
        }
    }

    /// Load the cache at `path`.
    ///
    /// A missing or unreadable file yields an empty cache. A file that exists
    /// but does not parse, including a zero-length one, is an error: starting
    /// over would re-submit every entry still in the feeds.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Cache file not found, starting with an empty cache");
                return Ok(Self::empty(path));
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unable to read cache file, starting with an empty cache");
                return Ok(Self::empty(path));
            }
        };

        let doc: CacheDocument = serde_json::from_slice(&bytes).map_err(|source| {
            CacheError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;

        if doc.version > CACHE_VERSION {
            return Err(CacheError::UnsupportedVersion {
                found: doc.version,
                supported: CACHE_VERSION,
            });
        }

        tracing::info!(
            path = %path.display(),
            seen = doc.seen.len(),
            errors = doc.errors.len(),
            "Loaded cache"
        );

        Ok(Self {
            path,
            version: doc.version,
            seen: SeenCache::from_records(doc.seen),
            errors: ErrorCache::from_entries(doc.errors),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn seen(&self) -> &SeenCache {
        &self.seen
    }

    pub fn errors(&self) -> &ErrorCache {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorCache {
        &mut self.errors
    }

    pub fn is_dirty(&self) -> bool {
        self.seen.is_dirty() || self.errors.is_dirty()
    }

    pub fn exists(&self, feed: &str, guid: &str) -> bool {
        self.seen.exists(feed, guid)
    }

    pub fn add_item(&mut self, record: SeenRecord) {
        self.seen.add_item(record);
    }

    pub fn evict(&mut self, policy: RetentionPolicy, now: DateTime<Utc>) -> usize {
        self.seen.evict(policy, now)
    }

    /// Write the cache to disk if anything changed.
    ///
    /// Returns `Ok(false)` without touching the filesystem when nothing is
    /// dirty. On failure the in-memory state, including the dirty flag, is
    /// left as it was so the next flush retries.
    pub fn flush(&mut self) -> Result<bool, CacheError> {
        if !self.is_dirty() {
            return Ok(false);
        }

        // A loaded older version is upgraded on write.
        let doc = CacheDocumentRef {
            version: CACHE_VERSION,
            errors: self.errors.entries(),
            seen: self.seen.records(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        write_atomic(&self.path, &json).map_err(|source| CacheError::Write {
            path: self.path.clone(),
            source,
        })?;

        self.version = CACHE_VERSION;
        self.seen.clear_dirty();
        self.errors.clear_dirty();
        tracing::debug!(path = %self.path.display(), seen = self.seen.len(), "Flushed cache");
        Ok(true)
    }
}

/// Replace `path` with `content` via a synced temp file and a rename.
///
/// The temp name carries a time-derived suffix and is opened with
/// `create_new`, so an existing file (or symlink) at that path is never
/// followed.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(format!(".tmp.{:016x}", suffix));
    let temp_path = path.with_file_name(temp_name);

    let result = (|| {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);

        #[cfg(windows)]
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        std::fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rss2transmission-cache-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record(guid: &str) -> SeenRecord {
        SeenRecord {
            feed: "showA".into(),
            published: None,
            added: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            guid: guid.into(),
            complete: false,
        }
    }

    #[test]
    fn test_flush_clean_cache_is_noop() {
        let dir = temp_dir("noop");
        let path = dir.join("seen.json");
        let mut cache = CacheFile::empty(&path);
        assert!(!cache.flush().unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_flush_writes_pascal_case_layout() {
        let dir = temp_dir("layout");
        let path = dir.join("seen.json");
        let mut cache = CacheFile::empty(&path);
        cache.add_item(record("g1"));
        cache
            .errors_mut()
            .record_failure("g2", Utc.timestamp_opt(0, 0).unwrap());

        assert!(cache.flush().unwrap());
        assert!(!cache.is_dirty());

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["Version"], 1);
        assert_eq!(value["Errors"]["g2"], 3_600);
        assert_eq!(value["Seen"][0]["GUID"], "g1");
        assert_eq!(value["Seen"][0]["Feed"], "showA");
        assert_eq!(value["Seen"][0]["Complete"], false);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = temp_dir("tmpfiles");
        let path = dir.join("seen.json");
        let mut cache = CacheFile::empty(&path);
        cache.add_item(record("g1"));
        cache.flush().unwrap();

        let names: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("seen.json")]);
    }

    #[test]
    fn test_whitespace_file_is_corrupt() {
        let dir = temp_dir("blank");
        let path = dir.join("seen.json");
        std::fs::write(&path, "\n  ").unwrap();
        assert!(matches!(
            CacheFile::open(&path),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = temp_dir("version");
        let path = dir.join("seen.json");
        std::fs::write(&path, r#"{"Version": 2, "Errors": {}, "Seen": []}"#).unwrap();
        match CacheFile::open(&path) {
            Err(CacheError::UnsupportedVersion { found: 2, supported: 1 }) => {}
            other => panic!("Expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_write_atomic_creates_parent_dirs() {
        let dir = temp_dir("parents");
        let path = dir.join("a").join("b").join("seen.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }
}
