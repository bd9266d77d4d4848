pub mod config;
pub mod daemon;
pub mod scan;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use mirra_core::{config as core_config, ConfigError, MirrorConfig};

/// `-c FILE` when given, `~/.mirra/config.yaml` otherwise.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => core_config::default_path().context("could not determine default config path"),
    }
}

pub fn load_config(explicit: Option<&Path>) -> Result<MirrorConfig> {
    let path = config_path(explicit)?;
    core_config::load_at(&path).with_context(|| match explicit {
        Some(_) => format!("failed to load config '{}'", path.display()),
        None => format!(
            "failed to load config '{}' (create one with `mirra config init {}`)",
            path.display(),
            path.display()
        ),
    })
}

/// The control socket the daemon for this config listens on. Without a
/// config file at the default location, the default socket is assumed.
pub fn socket_for(explicit: Option<&Path>) -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    let path = config_path(explicit)?;
    match core_config::load_at(&path) {
        Ok(config) => Ok(mirra_daemon::paths::resolve_socket(&config, &home)),
        Err(ConfigError::NotFound { .. }) if explicit.is_none() => {
            Ok(mirra_daemon::paths::socket_path(&home))
        }
        Err(err) => Err(err).with_context(|| format!("failed to load config '{}'", path.display())),
    }
}
