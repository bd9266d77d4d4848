//! Encoder collaborator: one source image in, one mirror artifact out.
//!
//! ## Write protocol
//!
//! 1. Stat the source; this snapshot is what step 6 stamps onto `dest`.
//! 2. Decode the source (`image`).
//! 3. Encode to WebP in memory (`webp`).
//! 4. Write to `<dest>.mirra.tmp`.
//! 5. Rename onto `dest` (atomic on POSIX); on failure remove the temp file.
//! 6. Optionally copy the snapshot's atime/mtime and permission bits onto
//!    `dest`. A source rewritten during steps 2-5 therefore leaves an
//!    artifact that still reads as stale.

use std::ffi::OsString;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use image::DynamicImage;
use webp::WebPConfig;

use mirra_core::EncodeOptions;

use crate::error::EncodeError;

/// Suffix of the in-progress artifact next to its final path.
pub const TEMP_SUFFIX: &str = ".mirra.tmp";

/// Turns one source file into one artifact at `dest`.
///
/// Implementations must leave `dest` untouched on failure. The engine makes
/// sure the parent directory of `dest` exists before calling.
pub trait Encoder: Send + Sync {
    fn encode(&self, source: &Path, dest: &Path, options: &EncodeOptions) -> Result<(), EncodeError>;
}

/// libwebp-backed encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebpEncoder;

impl WebpEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for WebpEncoder {
    fn encode(&self, source: &Path, dest: &Path, options: &EncodeOptions) -> Result<(), EncodeError> {
        let snapshot = snapshot(source)?;
        let img = image::open(source).map_err(|source_err| EncodeError::Decode {
            path: source.to_path_buf(),
            source: source_err,
        })?;
        let bytes = encode_webp(&img, options, source)?;
        write_atomic(dest, &bytes)?;
        if options.preserve_metadata {
            copy_metadata(&snapshot, dest);
        }
        tracing::debug!(
            "encoded {} -> {} ({} bytes, q={}, m={}, lossless={})",
            source.display(),
            dest.display(),
            bytes.len(),
            options.quality,
            options.method,
            options.lossless
        );
        Ok(())
    }
}

fn encode_webp(img: &DynamicImage, options: &EncodeOptions, source: &Path) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = (img.width(), img.height());
    let config = webp_config(options).ok_or_else(|| EncodeError::Encode {
        path: source.to_path_buf(),
        reason: "libwebp rejected the encoder configuration".to_string(),
    })?;

    // Alpha survives only when asked for and actually present; everything
    // else is flattened to RGB.
    let encoded = if options.keep_alpha && img.color().has_alpha() {
        let rgba = img.to_rgba8();
        webp::Encoder::from_rgba(rgba.as_raw(), width, height).encode_advanced(&config)
    } else {
        let rgb = img.to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), width, height).encode_advanced(&config)
    };
    let memory = encoded.map_err(|reason| EncodeError::Encode {
        path: source.to_path_buf(),
        reason: format!("{reason:?}"),
    })?;

    // WebPMemory is !Send; copy out.
    Ok(memory.to_vec())
}

fn webp_config(options: &EncodeOptions) -> Option<WebPConfig> {
    let mut config = WebPConfig::new().ok()?;
    config.lossless = i32::from(options.lossless);
    config.quality = options.quality.clamp(0.0, 100.0);
    config.method = i32::from(options.method.min(6));
    Some(config)
}

/// `<dest>.mirra.tmp`
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Write `bytes` to `dest` through a temp file and a rename.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), EncodeError> {
    let tmp = temp_path(dest);
    std::fs::write(&tmp, bytes).map_err(|e| EncodeError::Io {
        path: tmp.clone(),
        source: e,
    })?;

    if let Err(e) = std::fs::rename(&tmp, dest) {
        let _ = std::fs::remove_file(&tmp);
        return Err(EncodeError::Io {
            path: dest.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

/// Stat `source` before reading it.
pub fn snapshot(source: &Path) -> Result<Metadata, EncodeError> {
    std::fs::metadata(source).map_err(|e| EncodeError::Io {
        path: source.to_path_buf(),
        source: e,
    })
}

/// Stamp atime/mtime and permission bits from a source snapshot onto `dest`.
/// Best effort: failures are logged, never returned.
pub fn copy_metadata(meta: &Metadata, dest: &Path) {
    let atime = FileTime::from_last_access_time(meta);
    let mtime = FileTime::from_last_modification_time(meta);
    if let Err(err) = filetime::set_file_times(dest, atime, mtime) {
        tracing::warn!("cannot copy timestamps onto {}: {}", dest.display(), err);
    }
    if let Err(err) = std::fs::set_permissions(dest, meta.permissions()) {
        tracing::warn!("cannot copy permissions onto {}: {}", dest.display(), err);
    }
}
