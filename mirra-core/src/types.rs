//! Domain types for the mirra configuration model.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Raw file-facing types derive serde; resolved types are plain values built by
//! [`crate::config`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A normalized file extension: lowercase, no leading dot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Extension(String);

impl Extension {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extension of `path`, normalized. `None` for paths without one.
    pub fn of(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from)
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Extension {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<&str> for Extension {
    fn from(s: &str) -> Self {
        Self(s.trim().trim_start_matches('.').to_ascii_lowercase())
    }
}

impl From<Extension> for String {
    fn from(ext: Extension) -> Self {
        ext.0
    }
}

// ---------------------------------------------------------------------------
// Watched roots
// ---------------------------------------------------------------------------

/// A directory under observation plus the name of its mirror subdirectory.
///
/// The mirror subdirectory lives inside the root and is never source content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchedRoot {
    path: PathBuf,
    mirror_subdir: String,
}

impl WatchedRoot {
    pub fn new(path: impl Into<PathBuf>, mirror_subdir: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mirror_subdir: mirror_subdir.into(),
        }
    }

    /// Absolute path of the watched directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mirror_subdir(&self) -> &str {
        &self.mirror_subdir
    }

    /// `<root>/<mirror_subdir>`
    pub fn mirror_dir(&self) -> PathBuf {
        self.path.join(&self.mirror_subdir)
    }

    /// True when `path` is the mirror directory itself or anything below it.
    pub fn contains_mirror_path(&self, path: &Path) -> bool {
        path.starts_with(self.mirror_dir())
    }
}

impl fmt::Display for WatchedRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.display().fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Encoding options
// ---------------------------------------------------------------------------

/// Options handed to the encoder for one source extension.
///
/// Opaque to the engine: it only looks them up and passes them through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    /// Lossy quality, 0–100.
    pub quality: f32,
    pub lossless: bool,
    /// libwebp effort, 0 (fastest) to 6 (smallest output).
    pub method: u8,
    /// Keep the alpha channel when the source carries one.
    pub keep_alpha: bool,
    /// Copy source timestamps and permission bits onto the artifact.
    pub preserve_metadata: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            quality: 80.0,
            lossless: false,
            method: 6,
            keep_alpha: false,
            preserve_metadata: true,
        }
    }
}

/// Default options plus per-extension overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    pub default: EncodeOptions,
    pub per_extension: BTreeMap<Extension, EncodeOptions>,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        let mut per_extension = BTreeMap::new();
        per_extension.insert(
            Extension::from("png"),
            EncodeOptions {
                keep_alpha: true,
                ..EncodeOptions::default()
            },
        );
        Self {
            default: EncodeOptions::default(),
            per_extension,
        }
    }
}

impl EncodingConfig {
    pub fn options_for(&self, extension: &Extension) -> &EncodeOptions {
        self.per_extension.get(extension).unwrap_or(&self.default)
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully validated, process-wide configuration. Immutable after startup.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorConfig {
    pub roots: Vec<WatchedRoot>,
    pub mirror_subdir: String,
    pub mirror_extension: Extension,
    pub tracked: BTreeSet<Extension>,
    pub debounce_window: Duration,
    pub rename_grace: Duration,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
    pub encoding: EncodingConfig,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub control_socket: Option<PathBuf>,
}

impl MirrorConfig {
    /// True when `path` carries one of the tracked extensions (case-insensitive).
    pub fn is_tracked(&self, path: &Path) -> bool {
        Extension::of(path)
            .map(|ext| self.tracked.contains(&ext))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
