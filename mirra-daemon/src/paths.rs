use std::path::{Path, PathBuf};

use mirra_core::MirrorConfig;

pub const DAEMON_SOCKET: &str = "mirra.sock";

/// `<home>/.mirra`
pub fn mirra_root(home: &Path) -> PathBuf {
    mirra_core::config::mirra_dir_at(home)
}

/// Default control socket: `<home>/.mirra/mirra.sock`.
pub fn socket_path(home: &Path) -> PathBuf {
    mirra_root(home).join(DAEMON_SOCKET)
}

/// The configured control socket, or the default under `home`.
pub fn resolve_socket(config: &MirrorConfig, home: &Path) -> PathBuf {
    config
        .control_socket
        .clone()
        .unwrap_or_else(|| socket_path(home))
}
