//! Error types for mirra-sync.
//!
//! Taxonomy of per-event failures. None of these stop the consumer loop; the
//! caller logs and moves on to the next event.

use std::path::PathBuf;

use thiserror::Error;

use mirra_core::PathError;

/// All errors that can arise while applying one mutation to the mirror tree.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Path mapping called outside its domain.
    #[error(transparent)]
    InvalidPath(#[from] PathError),

    /// The source vanished between notification and processing.
    #[error("source vanished before processing: {path}")]
    StaleRace { path: PathBuf },

    /// The encoder failed; the mirror keeps its prior state.
    #[error("encode failed for {source_path} -> {dest}: {error}")]
    Encode {
        source_path: PathBuf,
        dest: PathBuf,
        #[source]
        error: EncodeError,
    },

    /// mkdir / rename / unlink / stat failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    /// Expected under concurrent external writers; skipped without noise.
    pub fn is_stale_race(&self) -> bool {
        matches!(self, SyncError::StaleRace { .. })
    }
}

/// Failures reported by an [`crate::Encoder`].
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("encoder rejected {path}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
