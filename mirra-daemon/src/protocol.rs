//! Newline-delimited JSON over the control socket.
//!
//! ```text
//! -> {"cmd":"rescan","root":"/srv/photos"}
//! <- {"ok":true,"data":[{"root":"/srv/photos","converted":3,...}]}
//! ```

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mirra_sync::RootReport;

use crate::error::{io_err, DaemonError};

/// Connection attempts made while a just-started daemon binds its socket.
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// One command line sent to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    /// Reconcile one root (or a directory below one); every root when `None`.
    Rescan {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<PathBuf>,
    },
    Stop,
}

/// One reply line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Payload of a successful reply, decoded as `T`.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, DaemonError> {
        if !self.ok {
            return Err(DaemonError::Protocol(
                self.error.unwrap_or_else(|| "unknown daemon error".to_string()),
            ));
        }
        Ok(serde_json::from_value(self.data.unwrap_or(Value::Null))?)
    }
}

/// Send one request and read one reply.
pub fn exchange(socket: &Path, request: &ControlRequest) -> Result<ControlReply, DaemonError> {
    let not_running = || DaemonError::DaemonNotRunning {
        socket: socket.to_path_buf(),
    };
    if !socket.exists() {
        return Err(not_running());
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound
        | std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionReset => not_running(),
        _ => io_err(socket, err),
    })?;

    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    stream.write_all(&payload).map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))?;

    let mut line = String::new();
    let read = BufReader::new(stream)
        .read_line(&mut line)
        .map_err(|e| io_err(socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// [`exchange`], retried while the socket is not accepting yet.
fn exchange_with_retry(socket: &Path, request: &ControlRequest) -> Result<ControlReply, DaemonError> {
    let mut attempt = 1;
    loop {
        match exchange(socket, request) {
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < CONNECT_ATTEMPTS => {
                attempt += 1;
                sleep(CONNECT_BACKOFF);
            }
            other => return other,
        }
    }
}

/// Status snapshot as the daemon renders it.
pub fn request_status(socket: &Path) -> Result<Value, DaemonError> {
    exchange_with_retry(socket, &ControlRequest::Status)?.into_data()
}

pub fn request_stop(socket: &Path) -> Result<(), DaemonError> {
    exchange(socket, &ControlRequest::Stop)?.into_data::<Value>().map(|_| ())
}

/// Blocks until the daemon's consumer has finished the pass; one report per
/// reconciled root.
pub fn request_rescan(socket: &Path, root: Option<PathBuf>) -> Result<Vec<RootReport>, DaemonError> {
    exchange_with_retry(socket, &ControlRequest::Rescan { root })?.into_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_use_the_cmd_tag() {
        let encoded = serde_json::to_string(&ControlRequest::Status).expect("encode");
        assert_eq!(encoded, r#"{"cmd":"status"}"#);
        let encoded = serde_json::to_string(&ControlRequest::Rescan { root: None }).expect("encode");
        assert_eq!(encoded, r#"{"cmd":"rescan"}"#);

        let decoded: ControlRequest =
            serde_json::from_str(r#"{"cmd":"rescan","root":"/srv/w"}"#).expect("decode");
        assert_eq!(
            decoded,
            ControlRequest::Rescan {
                root: Some(PathBuf::from("/srv/w"))
            }
        );
        assert!(serde_json::from_str::<ControlRequest>(r#"{"cmd":"reboot"}"#).is_err());
    }

    #[test]
    fn error_reply_becomes_protocol_error() {
        let err = ControlReply::error("boom").into_data::<Value>().unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(ref m) if m == "boom"));
        let data: Value = ControlReply::ok(json!({"running": true})).into_data().expect("ok");
        assert_eq!(data["running"], json!(true));
    }

    #[test]
    fn rescan_reply_decodes_into_reports() {
        let reply = ControlReply::ok(json!([{
            "root": "/srv/w",
            "converted": 2,
            "unchanged": 5,
            "removed": 1,
            "pruned": 0,
            "failed": 0,
            "dry_run": false
        }]));
        let reports: Vec<RootReport> = reply.into_data().expect("reports");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].converted, 2);
        assert_eq!(reports[0].removed, 1);
    }

    #[test]
    fn missing_socket_is_not_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = request_stop(&dir.path().join("absent.sock")).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
        let err = request_rescan(&dir.path().join("absent.sock"), None).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
    }
}
