//! mirra core library: configuration model, watched roots, path mapping, errors.
//!
//! Public API surface:
//! - [`types`]: `WatchedRoot`, `MirrorConfig`, encoder options, `Extension`
//! - [`config`]: file loading, validation and sample generation
//! - [`mapper`]: pure source ⇄ mirror path mapping
//! - [`error`]: [`ConfigError`], [`PathError`]

pub mod config;
pub mod error;
pub mod mapper;
pub mod types;

pub use config::ConfigFile;
pub use error::{ConfigError, PathError};
pub use mapper::PathMapper;
pub use types::{EncodeOptions, EncodingConfig, Extension, MirrorConfig, WatchedRoot};
