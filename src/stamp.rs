//! File stamps: cheap identity summaries used to skip content hashing when a
//! file's metadata is unchanged.
//!
//! Inspired by https://apenwarr.ca/log/20181113

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Snapshot of file metadata.  Equality of stamps is treated as "the file is
/// unchanged for our purposes".  Fields that a platform cannot provide are
/// zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub mtime_unix_nano: i64,
    pub size: u64,
    pub inode: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[cfg(unix)]
pub fn stat_stamp(path: &Path) -> std::io::Result<FileStamp> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path)?;
    Ok(FileStamp {
        mtime_unix_nano: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        size: meta.size(),
        inode: meta.ino(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
    })
}

#[cfg(windows)]
pub fn stat_stamp(path: &Path) -> std::io::Result<FileStamp> {
    // Only mtime and size are reliably available; the rest stays zero.
    let meta = std::fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok(FileStamp {
        mtime_unix_nano: mtime,
        size: meta.len(),
        ..FileStamp::default()
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StampEntry {
    stamp: FileStamp,
    digest: String,
}

#[derive(Default)]
struct StampCacheInner {
    entries: HashMap<String, StampEntry>,
    dirty: bool,
}

/// Persistent, path-keyed cache of (stamp, content digest) pairs.
///
/// Invariant: an entry's digest is a valid content hash of the file as it was
/// when the entry's stamp was observed.  `update` therefore re-stats at
/// update time and drops the entry if the stat fails.
pub struct StampCache {
    path: PathBuf,
    inner: Mutex<StampCacheInner>,
}

impl StampCache {
    pub fn new(path: impl Into<PathBuf>) -> StampCache {
        StampCache {
            path: path.into(),
            inner: Mutex::new(StampCacheInner::default()),
        }
    }

    /// Reads the persisted cache.  A missing file means an empty cache; a
    /// malformed one is discarded and the cache starts empty.
    pub fn load(&self) -> anyhow::Result<()> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).context("read stamp cache"),
        };
        let entries: HashMap<String, StampEntry> = match serde_json::from_slice(&data) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        self.inner.lock().unwrap().entries = entries;
        Ok(())
    }

    /// Writes the cache back out if anything changed since load/save.
    pub fn save(&self) -> anyhow::Result<()> {
        let data = {
            let inner = self.inner.lock().unwrap();
            if !inner.dirty {
                return Ok(());
            }
            serde_json::to_vec(&inner.entries).context("marshal stamp cache")?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("create stamp cache dir")?;
        }
        std::fs::write(&self.path, data).context("write stamp cache")?;
        self.inner.lock().unwrap().dirty = false;
        Ok(())
    }

    /// Returns the cached digest for `path` iff the file's current stamp
    /// matches the cached one.
    pub fn lookup(&self, path: &str) -> Option<String> {
        let entry = self.inner.lock().unwrap().entries.get(path).cloned()?;
        let current = stat_stamp(Path::new(path)).ok()?;
        if entry.stamp != current {
            return None;
        }
        Some(entry.digest)
    }

    /// Records a freshly computed digest for `path`, stamping the file as it
    /// is now.  If the stat fails the update is dropped: the cache must never
    /// hold a stamp it did not observe.
    pub fn update(&self, path: &str, digest: String) {
        let stamp = match stat_stamp(Path::new(path)) {
            Ok(stamp) => stamp,
            Err(_) => return,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(path.to_string(), StampEntry { stamp, digest });
        inner.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_hits_until_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"one").unwrap();
        let file = file.to_str().unwrap();

        let cache = StampCache::new(dir.path().join("stamps.json"));
        assert_eq!(cache.lookup(file), None);

        cache.update(file, "digest-one".to_string());
        assert_eq!(cache.lookup(file), Some("digest-one".to_string()));

        // Changing the size invalidates the stamp even if mtime granularity
        // would hide the write.
        std::fs::write(file, b"other contents").unwrap();
        assert_eq!(cache.lookup(file), None);
    }

    #[test]
    fn update_of_missing_file_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StampCache::new(dir.path().join("stamps.json"));
        cache.update(dir.path().join("gone").to_str().unwrap(), "d".to_string());
        assert_eq!(cache.lookup(dir.path().join("gone").to_str().unwrap()), None);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"contents").unwrap();
        let file = file.to_str().unwrap();
        let cache_path = dir.path().join("cache").join("stamps.json");

        let cache = StampCache::new(&cache_path);
        cache.update(file, "abc123".to_string());
        cache.save().unwrap();

        let reloaded = StampCache::new(&cache_path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.lookup(file), Some("abc123".to_string()));
    }

    #[test]
    fn clean_save_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("stamps.json");
        let cache = StampCache::new(&cache_path);
        cache.save().unwrap();
        assert!(!cache_path.exists());
    }

    #[test]
    fn malformed_cache_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("stamps.json");
        std::fs::write(&cache_path, b"{not json").unwrap();
        let cache = StampCache::new(&cache_path);
        cache.load().unwrap();
        assert_eq!(cache.lookup("anything"), None);
    }
}
