//! Error types for mirra-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, with the path that was being touched.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (sample config write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error (sample config write path).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parse error on load; includes file path and line context from the parser.
    #[error("failed to parse config at {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("config not found at {path}")]
    NotFound { path: PathBuf },

    #[error("refusing to overwrite existing config at {path}")]
    AlreadyExists { path: PathBuf },

    /// The file parsed but its values are unusable.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// `dirs::home_dir()` returned `None`; cannot locate `~/.mirra/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Path mapping called outside its domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("invalid path {path}: not under any watched root")]
    OutsideRoots { path: PathBuf },

    #[error("invalid path {path}: not under {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    /// A mirror path was handed to a source-side mapping.
    #[error("invalid path {path}: lies inside mirror directory {mirror}")]
    InsideMirror { path: PathBuf, mirror: PathBuf },

    #[error("invalid path {path}: {reason}")]
    Malformed { path: PathBuf, reason: &'static str },
}

impl PathError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            PathError::OutsideRoots { path }
            | PathError::OutsideRoot { path, .. }
            | PathError::InsideMirror { path, .. }
            | PathError::Malformed { path, .. } => path,
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
