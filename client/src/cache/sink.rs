//! Disk sinks for the song being received.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::lock::{write_locked, WriteMode};
use super::CacheError;

/// Where received audio is persisted while a song streams in.
pub trait DiskSink: Send + Sync {
    /// Persists `bytes`.
    ///
    /// # Errors
    ///
    /// A contended lock or I/O failure is returned to the caller, which
    /// drops the write and keeps streaming.
    fn write_data(&self, bytes: &[u8]) -> Result<(), CacheError>;

    /// Starts a new song.
    fn reset(&self) -> Result<(), CacheError>;

    /// File currently backing the sink.
    fn location(&self) -> PathBuf;

    /// Whether the sink takes payloads as they arrive (`true`) or only the
    /// whole song at completion (`false`).
    fn persists_incrementally(&self) -> bool;
}

/// Which sink policy the client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkKind {
    #[default]
    Dynamic,
    Static,
}

impl std::str::FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.to_ascii_lowercase().as_str() {
            "dynamic" => Ok(Self::Dynamic),
            "static" => Ok(Self::Static),
            other => Err(format!("unknown sink '{other}', expected dynamic or static")),
        }
    }
}

#[derive(Debug)]
struct Session {
    index: u64,
    path: PathBuf,
    used: bool,
}

/// One backing file per session.
///
/// Once a session's file has been written, `reset` moves on to a fresh
/// file so the old one stays intact for anything still playing it. Only
/// the current and the previous session files are kept; older ones, and
/// any left behind by an earlier run, are deleted.
#[derive(Debug)]
pub struct DynamicSink {
    // ---
    dir: PathBuf,
    prefix: String,
    suffix: String,
    session: Mutex<Session>,
}

impl DynamicSink {
    // ---
    /// Creates a sink writing session files into `dir`.
    ///
    /// # Errors
    ///
    /// Returns error if `dir` cannot be created.
    pub fn new(dir: &Path, prefix: &str, suffix: &str) -> Result<Self, CacheError> {
        // ---
        std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;
        purge_sessions(dir, prefix, suffix)?;

        let path = session_path(dir, prefix, suffix, 1);
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            session: Mutex::new(Session {
                index: 1,
                path,
                used: false,
            }),
        })
    }
}

fn session_path(dir: &Path, prefix: &str, suffix: &str, index: u64) -> PathBuf {
    dir.join(format!("{prefix}session-{}-{index}{suffix}", std::process::id()))
}

/// Deletes every session file in `dir`.
fn purge_sessions(dir: &Path, prefix: &str, suffix: &str) -> Result<(), CacheError> {
    // ---
    let marker = format!("{prefix}session-");
    let entries = std::fs::read_dir(dir).map_err(|e| CacheError::io(dir, e))?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&marker) || !name.ends_with(suffix) {
            continue;
        }
        remove_stale(&entry.path());
    }
    Ok(())
}

fn remove_stale(path: &Path) {
    // ---
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale session file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove stale session file {}: {}", path.display(), e),
    }
}

impl DiskSink for DynamicSink {
    fn write_data(&self, bytes: &[u8]) -> Result<(), CacheError> {
        // ---
        let mut session = self.session.lock();
        write_locked(&session.path, bytes, WriteMode::Append)?;
        session.used = true;
        Ok(())
    }

    fn reset(&self) -> Result<(), CacheError> {
        // ---
        let mut session = self.session.lock();

        if session.used {
            session.index += 1;
            session.path = session_path(&self.dir, &self.prefix, &self.suffix, session.index);
            session.used = false;
            debug!("Dynamic sink moved to {}", session.path.display());

            // Keep the previous session for playback, drop the one before
            if session.index > 2 {
                remove_stale(&session_path(
                    &self.dir,
                    &self.prefix,
                    &self.suffix,
                    session.index - 2,
                ));
            }
        }

        // An unused file may hold a partial write from a dropped session
        match std::fs::remove_file(&session.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(&session.path, e)),
        }
    }

    fn location(&self) -> PathBuf {
        self.session.lock().path.clone()
    }

    fn persists_incrementally(&self) -> bool {
        true
    }
}

/// One backing file, deleted and recreated before every write.
#[derive(Debug)]
pub struct StaticSink {
    // ---
    path: PathBuf,
    writer: Mutex<()>,
}

impl StaticSink {
    // ---
    /// Creates a sink backed by `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the parent directory cannot be created.
    pub fn new(path: &Path) -> Result<Self, CacheError> {
        // ---
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(()),
        })
    }

    fn remove(&self) -> Result<(), CacheError> {
        // ---
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(&self.path, e)),
        }
    }
}

impl DiskSink for StaticSink {
    fn write_data(&self, bytes: &[u8]) -> Result<(), CacheError> {
        // ---
        let _writer = self.writer.lock();
        self.remove()?;
        write_locked(&self.path, bytes, WriteMode::Replace)
    }

    fn reset(&self) -> Result<(), CacheError> {
        // ---
        let _writer = self.writer.lock();
        self.remove()
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }

    fn persists_incrementally(&self) -> bool {
        false
    }
}
