//! Daemon runtime: notify watcher, single mirror consumer, control socket.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod watch;

pub use error::DaemonError;
pub use protocol::{exchange, request_rescan, request_status, request_stop, ControlReply, ControlRequest};
pub use runtime::{init_tracing, run, start_blocking};
pub use watch::WatchAdapter;
