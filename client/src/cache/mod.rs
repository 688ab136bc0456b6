//! Disk persistence for received songs.
//!
//! Sinks hold the song currently streaming in; the content cache keeps
//! completed songs across sessions under a byte budget.

mod content;
mod lock;
mod sink;

pub use content::{CacheHandle, CleanupReport, ContentCache};
pub use sink::{DiskSink, DynamicSink, SinkKind, StaticSink};

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{0} is locked by another writer")]
    Contended(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
