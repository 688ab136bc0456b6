//! Writes guarded by an exclusive advisory file lock.
//!
//! Every write follows open, lock, write, unlock, close. The lock guard
//! releases on every exit path, including a failed write.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;

use super::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Truncate after the lock is held, then write
    Replace,

    /// Write at the end of the file
    Append,
}

struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    // ---
    fn try_acquire(file: &'a File, path: &Path) -> Result<Self, CacheError> {
        // ---
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => Ok(Self { file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(CacheError::Contended(path.to_path_buf()))
            }
            Err(e) => Err(CacheError::io(path, e)),
        }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.file);
    }
}

/// Writes `bytes` to `path` under an exclusive lock.
///
/// # Errors
///
/// Returns [`CacheError::Contended`] if another writer holds the lock, or
/// [`CacheError::Io`] if the file cannot be opened or written.
pub(crate) fn write_locked(path: &Path, bytes: &[u8], mode: WriteMode) -> Result<(), CacheError> {
    // ---
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(mode == WriteMode::Append)
        .open(path)
        .map_err(|e| CacheError::io(path, e))?;

    let _lock = FileLock::try_acquire(&file, path)?;

    if mode == WriteMode::Replace {
        file.set_len(0).map_err(|e| CacheError::io(path, e))?;
    }

    (&file)
        .write_all(bytes)
        .and_then(|()| (&file).flush())
        .map_err(|e| CacheError::io(path, e))
}
