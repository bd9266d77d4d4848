//! Configuration file loading and resolution.
//!
//! # Storage layout
//!
//! ```text
//! ~/.mirra/
//!   config.yaml     (default config location; any path may be passed instead)
//!   mirra.sock      (daemon control socket unless `control_socket` is set)
//! ```
//!
//! # API pattern
//!
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! `.yaml` / `.yml` files are parsed as YAML, everything else as JSON.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::{EncodingConfig, Extension, MirrorConfig, WatchedRoot};

pub const DEFAULT_OUTPUT_SUBDIR: &str = "webp";
pub const DEFAULT_MIRROR_EXTENSION: &str = "webp";
pub const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
pub const DEFAULT_RENAME_GRACE_MS: u64 = 500;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// 1. Raw file model
// ---------------------------------------------------------------------------

/// Configuration exactly as written on disk. Resolve with
/// [`MirrorConfig::from_file`] before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub watch_paths: Vec<PathBuf>,
    #[serde(default = "default_output_subdir")]
    pub output_subdir: String,
    #[serde(default = "default_mirror_extension")]
    pub mirror_extension: String,
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_rename_grace_ms")]
    pub rename_grace_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_socket: Option<PathBuf>,
    #[serde(default)]
    pub encoding: EncodingConfig,
    /// Flat encoder keys from older config files. When present they override
    /// the same setting in `encoding.default` and every per-extension entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webp_quality: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webp_lossless: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webp_method: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_metadata: Option<bool>,
}

fn default_output_subdir() -> String {
    DEFAULT_OUTPUT_SUBDIR.to_string()
}

fn default_mirror_extension() -> String {
    DEFAULT_MIRROR_EXTENSION.to_string()
}

fn default_supported_extensions() -> Vec<String> {
    vec![".jpg".into(), ".jpeg".into(), ".png".into()]
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_rename_grace_ms() -> u64 {
    DEFAULT_RENAME_GRACE_MS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ConfigFile {
    /// Config with every default filled in and the given roots.
    pub fn with_roots(watch_paths: Vec<PathBuf>) -> Self {
        Self {
            watch_paths,
            output_subdir: default_output_subdir(),
            mirror_extension: default_mirror_extension(),
            supported_extensions: default_supported_extensions(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            rename_grace_ms: DEFAULT_RENAME_GRACE_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            log_level: default_log_level(),
            log_file: None,
            control_socket: None,
            encoding: EncodingConfig::default(),
            webp_quality: None,
            webp_lossless: None,
            webp_method: None,
            preserve_metadata: None,
        }
    }

    /// Fold the flat encoder keys into `encoding`.
    fn fold_flat_encoding(&mut self) {
        let entries =
            std::iter::once(&mut self.encoding.default).chain(self.encoding.per_extension.values_mut());
        for opts in entries {
            if let Some(quality) = self.webp_quality {
                opts.quality = quality;
            }
            if let Some(lossless) = self.webp_lossless {
                opts.lossless = lossless;
            }
            if let Some(method) = self.webp_method {
                opts.method = method;
            }
            if let Some(preserve) = self.preserve_metadata {
                opts.preserve_metadata = preserve;
            }
        }
    }

    /// The config written by `mirra config init`.
    pub fn sample() -> Self {
        let mut sample = Self::with_roots(vec![
            PathBuf::from("/path/to/watch1"),
            PathBuf::from("/path/to/watch2"),
        ]);
        sample.log_file = Some(PathBuf::from("/var/log/mirra.log"));
        sample
    }
}

// ---------------------------------------------------------------------------
// 2. Resolution
// ---------------------------------------------------------------------------

impl MirrorConfig {
    /// Validate `file` and resolve relative roots against `base_dir`.
    pub fn from_file(mut file: ConfigFile, base_dir: &Path) -> Result<Self, ConfigError> {
        file.fold_flat_encoding();
        if file.watch_paths.is_empty() {
            return Err(ConfigError::Invalid("watch_paths must not be empty".into()));
        }
        validate_subdir(&file.output_subdir)?;

        let mirror_extension = Extension::from(file.mirror_extension.as_str());
        if mirror_extension.as_str().is_empty() {
            return Err(ConfigError::Invalid("mirror_extension must not be empty".into()));
        }

        let tracked: BTreeSet<Extension> = file
            .supported_extensions
            .iter()
            .map(|ext| Extension::from(ext.as_str()))
            .filter(|ext| !ext.as_str().is_empty())
            .collect();
        if tracked.is_empty() {
            return Err(ConfigError::Invalid(
                "supported_extensions must name at least one extension".into(),
            ));
        }
        if tracked.contains(&mirror_extension) {
            return Err(ConfigError::Invalid(format!(
                "supported_extensions must not include the mirror extension '{mirror_extension}'"
            )));
        }

        if file.debounce_ms == 0 {
            return Err(ConfigError::Invalid("debounce_ms must be greater than 0".into()));
        }
        if file.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be greater than 0".into()));
        }
        let all_options =
            std::iter::once(&file.encoding.default).chain(file.encoding.per_extension.values());
        for opts in all_options {
            if !(0.0..=100.0).contains(&opts.quality) {
                return Err(ConfigError::Invalid(format!(
                    "encoding quality {} is outside 0..=100",
                    opts.quality
                )));
            }
            if opts.method > 6 {
                return Err(ConfigError::Invalid(format!(
                    "encoding method {} is outside 0..=6",
                    opts.method
                )));
            }
        }

        let mut roots: Vec<WatchedRoot> = Vec::new();
        for raw in &file.watch_paths {
            let root = WatchedRoot::new(resolve_root(raw, base_dir), file.output_subdir.clone());
            if !roots.contains(&root) {
                roots.push(root);
            }
        }

        Ok(MirrorConfig {
            roots,
            mirror_subdir: file.output_subdir,
            mirror_extension,
            tracked,
            debounce_window: Duration::from_millis(file.debounce_ms),
            rename_grace: Duration::from_millis(file.rename_grace_ms),
            queue_capacity: file.queue_capacity,
            shutdown_grace: Duration::from_millis(file.shutdown_grace_ms),
            encoding: file.encoding,
            log_level: file.log_level,
            log_file: file.log_file.map(|p| absolutize(&p, base_dir)),
            control_socket: file.control_socket.map(|p| absolutize(&p, base_dir)),
        })
    }
}

fn validate_subdir(subdir: &str) -> Result<(), ConfigError> {
    let mut components = Path::new(subdir).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(ConfigError::Invalid(format!(
            "output_subdir '{subdir}' must be a single directory name"
        ))),
    }
}

fn absolutize(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Canonicalize so notification paths (which arrive as real paths) match
/// `starts_with` checks. Missing roots keep their absolute spelling.
fn resolve_root(raw: &Path, base_dir: &Path) -> PathBuf {
    let absolute = absolutize(raw, base_dir);
    std::fs::canonicalize(&absolute).unwrap_or(absolute)
}

// ---------------------------------------------------------------------------
// 3. Load / write
// ---------------------------------------------------------------------------

/// `<home>/.mirra/`
pub fn mirra_dir_at(home: &Path) -> PathBuf {
    home.join(".mirra")
}

/// `<home>/.mirra/config.yaml`. Pure, no I/O.
pub fn default_path_at(home: &Path) -> PathBuf {
    mirra_dir_at(home).join("config.yaml")
}

/// `default_path_at` convenience wrapper.
pub fn default_path() -> Result<PathBuf, ConfigError> {
    Ok(default_path_at(&home()?))
}

/// Load and resolve the config file at `path`.
///
/// Returns `ConfigError::NotFound` if absent and `ConfigError::Parse` (with
/// path and parser context) if malformed.
pub fn load_at(path: &Path) -> Result<MirrorConfig, ConfigError> {
    let file = read_file_at(path)?;
    let base_dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().map_err(|e| io_err(path, e))?,
    };
    MirrorConfig::from_file(file, &base_dir)
}

/// Parse the config file at `path` without resolving it.
pub fn read_file_at(path: &Path) -> Result<ConfigFile, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if is_yaml(path) {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    } else {
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Write [`ConfigFile::sample`] to `path`, YAML or JSON by extension.
///
/// Refuses to overwrite unless `force` is set.
pub fn write_sample_at(path: &Path, force: bool) -> Result<(), ConfigError> {
    write_file_at(path, &ConfigFile::sample(), force)
}

pub fn write_file_at(path: &Path, file: &ConfigFile, force: bool) -> Result<(), ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    let rendered = if is_yaml(path) {
        serde_yaml::to_string(file)?
    } else {
        serde_json::to_string_pretty(file)?
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }
    std::fs::write(path, rendered).map_err(|e| io_err(path, e))
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        Extension::of(path).as_ref().map(Extension::as_str),
        Some("yaml") | Some("yml")
    )
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
