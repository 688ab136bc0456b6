//! Content-addressed cache of completed songs.
//!
//! Entries live at `<root>/<prefix><sha256-hex><suffix>`. Storing the same
//! bytes twice overwrites the same file. Every store is followed by a
//! cleanup pass that evicts least-recently-modified entries until the
//! directory fits the byte budget.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use wss_common::{Config, MetricsContext};

use super::lock::{write_locked, WriteMode};
use super::CacheError;

/// A song held in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    // ---
    pub hash: String,
    pub path: PathBuf,
    pub title: String,
    pub artist: String,
}

/// Result of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub evicted: Vec<PathBuf>,
    pub total_bytes: u64,
}

struct Entry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

pub struct ContentCache {
    // ---
    root: PathBuf,
    prefix: String,
    suffix: String,
    budget_bytes: u64,
    tags: Mutex<HashMap<String, (String, String)>>,
    metrics: Option<MetricsContext>,
}

impl ContentCache {
    // ---
    /// Opens (creating if needed) a cache rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns error if `root` cannot be created.
    pub fn new(
        root: &Path,
        prefix: &str,
        suffix: &str,
        budget_bytes: u64,
        metrics: Option<MetricsContext>,
    ) -> Result<Self, CacheError> {
        // ---
        std::fs::create_dir_all(root).map_err(|e| CacheError::io(root, e))?;

        Ok(Self {
            root: root.to_path_buf(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            budget_bytes,
            tags: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub fn from_config(config: &Config, metrics: Option<MetricsContext>) -> Result<Self, CacheError> {
        // ---
        Self::new(
            &config.cache_dir,
            &config.cache_prefix,
            &config.cache_suffix,
            config.cache_budget_bytes,
            metrics,
        )
    }

    /// Lowercase hex SHA-256 of `bytes`.
    pub fn hash_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{}{}{}", self.prefix, hash, self.suffix))
    }

    /// Writes `bytes` under their content hash, then runs a cleanup pass.
    ///
    /// # Errors
    ///
    /// Returns error if the entry cannot be written. Cleanup failures are
    /// logged and do not fail the store.
    pub fn store(&self, bytes: &[u8], title: &str, artist: &str) -> Result<CacheHandle, CacheError> {
        // ---
        let hash = Self::hash_of(bytes);
        let path = self.path_for(&hash);

        write_locked(&path, bytes, WriteMode::Replace)?;
        self.tags
            .lock()
            .insert(hash.clone(), (title.to_string(), artist.to_string()));
        info!("Cached {} bytes as {}", bytes.len(), path.display());

        if let Err(e) = self.cleanup() {
            warn!("Cache cleanup failed: {}", e);
        }

        Ok(CacheHandle {
            hash,
            path,
            title: title.to_string(),
            artist: artist.to_string(),
        })
    }

    /// Replaces the title and artist recorded for a cached entry.
    ///
    /// Returns the updated handle, or `None` if `hash` is not cached.
    pub fn retag(&self, hash: &str, title: &str, artist: &str) -> Option<CacheHandle> {
        // ---
        if !self.exists(hash) {
            return None;
        }

        self.tags
            .lock()
            .insert(hash.to_string(), (title.to_string(), artist.to_string()));
        self.retrieve(hash)
    }

    pub fn exists(&self, hash: &str) -> bool {
        is_hash(hash) && self.path_for(hash).is_file()
    }

    /// Looks up an entry by hash.
    pub fn retrieve(&self, hash: &str) -> Option<CacheHandle> {
        // ---
        if !self.exists(hash) {
            return None;
        }

        let (title, artist) = self
            .tags
            .lock()
            .get(hash)
            .cloned()
            .unwrap_or_else(|| ("Unknown".to_string(), "Unknown".to_string()));

        Some(CacheHandle {
            hash: hash.to_string(),
            path: self.path_for(hash),
            title,
            artist,
        })
    }

    /// Evicts least-recently-modified files until the directory fits the
    /// budget.
    ///
    /// Subdirectories are not counted.
    pub fn cleanup(&self) -> Result<CleanupReport, CacheError> {
        // ---
        let mut entries = self.scan()?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        let mut report = CleanupReport::default();

        // Oldest last so eviction pops from the end
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));

        while total > self.budget_bytes {
            let Some(oldest) = entries.pop() else {
                break;
            };

            match std::fs::remove_file(&oldest.path) {
                Ok(()) => {
                    debug!("Evicted {} ({} bytes)", oldest.path.display(), oldest.size);
                    total = total.saturating_sub(oldest.size);
                    if let Some(m) = &self.metrics {
                        m.cache_evictions_total.inc();
                    }
                    report.evicted.push(oldest.path);
                }
                Err(e) => warn!("Cannot evict {}: {}", oldest.path.display(), e),
            }

            if entries.is_empty() {
                warn!(
                    "Cache directory {} emptied to fit budget of {} bytes",
                    self.root.display(),
                    self.budget_bytes
                );
                break;
            }
        }

        if let Some(m) = &self.metrics {
            m.cache_bytes.set(total as i64);
        }

        report.total_bytes = total;
        Ok(report)
    }

    /// Deletes every entry.
    pub fn reset(&self) -> Result<usize, CacheError> {
        // ---
        let entries = self.scan()?;
        let mut removed = 0;

        for entry in entries {
            let name = entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !(name.starts_with(&self.prefix) && name.ends_with(&self.suffix)) {
                continue;
            }

            std::fs::remove_file(&entry.path).map_err(|e| CacheError::io(&entry.path, e))?;
            removed += 1;
        }

        self.tags.lock().clear();
        if let Some(m) = &self.metrics {
            m.cache_bytes.set(0);
        }

        info!("Cache reset: {} entries removed", removed);
        Ok(removed)
    }

    fn scan(&self) -> Result<Vec<Entry>, CacheError> {
        // ---
        let dir = std::fs::read_dir(&self.root).map_err(|e| CacheError::io(&self.root, e))?;

        let mut entries = Vec::new();
        for item in dir {
            let item = item.map_err(|e| CacheError::io(&self.root, e))?;
            let meta = match item.metadata() {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping {}: {}", item.path().display(), e);
                    continue;
                }
            };

            entries.push(Entry {
                path: item.path(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }
}

fn is_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    fn age(path: &Path, secs_ago: u64) {
        // ---
        let file = std::fs::File::options()
            .write(true)
            .open(path)
            .expect("open");
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .expect("set mtime");
    }

    #[test]
    fn test_store_is_content_addressed() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ContentCache::new(dir.path(), "wss_", ".audio", 1024, None).expect("cache");

        let a = cache.store(b"same bytes", "Unknown", "Unknown").expect("store");
        let b = cache.store(b"same bytes", "Title", "Artist").expect("store again");

        assert_eq!(a.path, b.path);
        assert_eq!(a.hash.len(), 64);
        assert!(a
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .is_some_and(|n| n.starts_with("wss_") && n.ends_with(".audio")));
        assert_eq!(std::fs::read(&a.path).expect("read"), b"same bytes");
    }

    #[test]
    fn test_exists_and_retrieve() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ContentCache::new(dir.path(), "wss_", ".audio", 1024, None).expect("cache");

        let handle = cache.store(b"tune", "Song", "Band").expect("store");
        assert!(cache.exists(&handle.hash));

        let found = cache.retrieve(&handle.hash).expect("retrieve");
        assert_eq!(found, handle);

        let other = ContentCache::hash_of(b"never stored");
        assert!(!cache.exists(&other));
        assert!(cache.retrieve(&other).is_none());
        assert!(!cache.exists("../../etc/passwd"));
    }

    #[test]
    fn test_cleanup_evicts_oldest_first() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ContentCache::new(dir.path(), "wss_", ".audio", 100, None).expect("cache");

        let old = cache.store(&[1u8; 40], "a", "a").expect("store");
        let mid = cache.store(&[2u8; 40], "b", "b").expect("store");
        age(&old.path, 300);
        age(&mid.path, 200);

        // 120 bytes > 100: only the oldest goes
        let new = cache.store(&[3u8; 40], "c", "c").expect("store");

        assert!(!old.path.exists());
        assert!(mid.path.exists());
        assert!(new.path.exists());
    }

    #[test]
    fn test_oversized_entry_empties_directory() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ContentCache::new(dir.path(), "wss_", ".audio", 10, None).expect("cache");

        let big = cache.store(&[9u8; 50], "big", "big").expect("store");

        assert!(!big.path.exists());
        let report = cache.cleanup().expect("cleanup");
        assert!(report.evicted.is_empty());
        assert_eq!(report.total_bytes, 0);
    }

    #[test]
    fn test_cleanup_ignores_subdirectories() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("stream");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(nested.join("session.audio"), [0u8; 500]).expect("write");

        let cache = ContentCache::new(dir.path(), "wss_", ".audio", 100, None).expect("cache");
        let handle = cache.store(&[1u8; 40], "a", "a").expect("store");

        assert!(handle.path.exists());
        assert!(nested.join("session.audio").exists());
    }

    #[test]
    fn test_reset_removes_entries() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ContentCache::new(dir.path(), "wss_", ".audio", 1024, None).expect("cache");

        let a = cache.store(b"one", "Unknown", "Unknown").expect("store");
        cache.store(b"two", "Unknown", "Unknown").expect("store");
        std::fs::write(dir.path().join("notes.txt"), b"keep").expect("write");

        assert_eq!(cache.reset().expect("reset"), 2);
        assert!(!cache.exists(&a.hash));
        assert!(dir.path().join("notes.txt").exists());
    }
}
