//! Durable state: feed checkpoints, delivery records, tracked threads.
//!
//! All state is plain JSON on disk, one file per concern, written with a
//! temp-then-rename replace so a crash mid-write never corrupts the previous
//! state. Files are meant to be readable (and editable, at rest) by a human.

mod manifest;
mod store;

pub use manifest::{ThreadManifest, TrackStatus, TrackedThread, EXPIRE_DAYS};
pub use store::TrackingStore;

use std::io;
use std::path::Path;

use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Atomically replaces `path` with `contents`.
///
/// Writes to `<path>.tmp` in the same directory and renames over the final
/// path, so readers only ever observe the old or the new state.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
