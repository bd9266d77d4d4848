//! Full daemon against a real watcher and a real control socket.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mirra_core::{ConfigFile, EncodeOptions, MirrorConfig};
use mirra_daemon::{request_rescan, request_status, request_stop, DaemonError};
use mirra_sync::{EncodeError, Encoder};
use tempfile::TempDir;
use tokio_test::assert_ok;

struct CopyEncoder;

impl Encoder for CopyEncoder {
    fn encode(&self, source: &Path, dest: &Path, _: &EncodeOptions) -> Result<(), EncodeError> {
        let bytes = fs::read(source).map_err(|source_err| EncodeError::Io {
            path: source.to_path_buf(),
            source: source_err,
        })?;
        mirra_sync::encoder::write_atomic(dest, &bytes)
    }
}

fn config(root: &Path, socket: &Path) -> MirrorConfig {
    let mut file = ConfigFile::with_roots(vec![root.to_path_buf()]);
    file.output_subdir = ".mirror".to_string();
    file.debounce_ms = 100;
    file.rename_grace_ms = 50;
    file.shutdown_grace_ms = 500;
    file.control_socket = Some(socket.to_path_buf());
    MirrorConfig::from_file(file, Path::new("/")).expect("config")
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.expect("blocking call")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_mirrors_live_changes_and_answers_the_socket() {
    let tmp = TempDir::new().expect("tempdir");
    let base = tmp.path().canonicalize().expect("canonical");
    let root = base.join("w");
    fs::create_dir_all(root.join("a")).expect("mkdir");
    fs::write(root.join("a/old.png"), b"old").expect("write");
    let socket = base.join("run/mirra.sock");

    let daemon = tokio::spawn(mirra_daemon::run(
        config(&root, &socket),
        Arc::new(CopyEncoder),
        socket.clone(),
    ));

    // Startup reconciliation converts what was already there.
    let mirror = root.join(".mirror");
    wait_for("startup conversion", || mirror.join("a/old.webp").is_file()).await;

    fs::write(root.join("a/new.png"), b"new").expect("write");
    wait_for("live conversion", || mirror.join("a/new.webp").is_file()).await;

    fs::rename(root.join("a/new.png"), root.join("a/renamed.png")).expect("rename");
    wait_for("rename", || {
        mirror.join("a/renamed.webp").is_file() && !mirror.join("a/new.webp").exists()
    })
    .await;

    fs::remove_file(root.join("a/old.png")).expect("remove");
    wait_for("removal", || !mirror.join("a/old.webp").exists()).await;
    assert!(mirror.join("a").is_dir(), "dir still holds renamed.webp");

    let status = {
        let socket = socket.clone();
        assert_ok!(blocking(move || request_status(&socket)).await)
    };
    assert_eq!(status["running"], serde_json::json!(true));
    assert_eq!(status["roots"], serde_json::json!([root.display().to_string()]));
    assert!(status["events_received"].as_u64().unwrap_or(0) > 0);

    let reports = {
        let socket = socket.clone();
        let root = root.clone();
        assert_ok!(blocking(move || request_rescan(&socket, Some(root))).await)
    };
    assert_eq!(reports[0].converted, 0);
    assert_eq!(reports[0].removed, 0);

    {
        let socket = socket.clone();
        assert_ok!(blocking(move || request_stop(&socket)).await);
    }
    let joined = tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon stops")
        .expect("join");
    assert_ok!(joined);
    assert!(!socket.exists(), "socket removed on shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_refuses_when_no_root_can_be_watched() {
    let tmp = TempDir::new().expect("tempdir");
    let socket = tmp.path().join("mirra.sock");
    let mut cfg = config(tmp.path(), &socket);
    cfg.roots = vec![mirra_core::WatchedRoot::new(PathBuf::from("/definitely/not/here"), ".mirror")];

    let err = mirra_daemon::run(cfg, Arc::new(CopyEncoder), socket.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::NoRootsWatched), "got: {err}");
    assert!(!socket.exists());
}

#[test]
fn status_without_daemon_reports_not_running() {
    let tmp = TempDir::new().expect("tempdir");
    let err = request_status(&tmp.path().join("absent.sock")).unwrap_err();
    assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
}
