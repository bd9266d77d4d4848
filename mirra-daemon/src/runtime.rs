use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, RecommendedWatcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

use mirra_core::{MirrorConfig, PathMapper};
use mirra_sync::{
    reconcile, scan_with, ChangeEvent, ChangeKind, Correlator, Encoder, Mutation, Normalizer,
    RootReport, ScanScope, Synchronizer,
};

use crate::error::{io_err, DaemonError};
use crate::protocol::{ControlReply, ControlRequest};
use crate::watch::{register_roots, WatchAdapter};

/// Upper bound on items taken in one non-blocking drain.
const MAX_PASS_ITEMS: usize = 256;

type RescanReply = oneshot::Sender<Result<Vec<RootReport>, String>>;

/// One entry of the mutation queue.
enum QueueItem {
    Change(ChangeEvent),
    Rescan {
        scope: ScanScope,
        respond_to: Option<RescanReply>,
    },
}

/// Counters shared between the tasks and reported by `status`.
#[derive(Debug, Default)]
struct Stats {
    events_received: AtomicU64,
    events_dropped: AtomicU64,
    mutations_applied: AtomicU64,
    failures: AtomicU64,
    last_event_at_unix: AtomicU64,
}

impl Stats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Build a multi-thread runtime and run the daemon until it is stopped.
pub fn start_blocking(
    config: MirrorConfig,
    encoder: Arc<dyn Encoder>,
    socket: PathBuf,
) -> Result<(), DaemonError> {
    let grace = config.shutdown_grace;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    let result = runtime.block_on(run(config, encoder, socket));
    // An encode still running past its grace is abandoned here.
    runtime.shutdown_timeout(grace);
    result
}

/// Run the daemon: watcher, single consumer, startup reconciliation and the
/// control socket.
pub async fn run(
    config: MirrorConfig,
    encoder: Arc<dyn Encoder>,
    socket: PathBuf,
) -> Result<(), DaemonError> {
    let started_at_unix = unix_seconds_now();
    let config = Arc::new(config);
    let mapper = PathMapper::new(&config);
    let sync = Arc::new(Synchronizer::new(&config, encoder));
    let stats = Arc::new(Stats::default());

    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    prepare_socket_for_bind(&socket)?;
    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = raw_tx.send(event);
    })?;
    if register_roots(&mut watcher, mapper.roots()) == 0 {
        let _ = fs::remove_file(&socket);
        return Err(DaemonError::NoRootsWatched);
    }

    let stale = {
        let mapper = mapper.clone();
        tokio::task::spawn_blocking(move || startup_cleanup(&mapper))
            .await
            .map_err(|err| DaemonError::Protocol(format!("startup task join error: {err}")))?
    };
    tracing::info!(stale = stale.len(), "startup reconciliation planned");

    let (queue_tx, queue_rx) = mpsc::channel::<QueueItem>(config.queue_capacity);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let consumer_handle = {
        let shutdown = shutdown_tx.clone();
        let correlator = Correlator::new(config.debounce_window);
        let sync = sync.clone();
        let stats = stats.clone();
        let config = config.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = consumer_task(
                sync,
                correlator,
                queue_rx,
                stats,
                config.rename_grace,
                config.shutdown_grace,
                shutdown_rx,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let adapter = WatchAdapter::new(mapper.clone());
        let normalizer = Normalizer::new(mapper.clone());
        let queue_tx = queue_tx.clone();
        let stats = stats.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = watcher_task(
                watcher, raw_rx, adapter, normalizer, queue_tx, stats, shutdown_rx,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let startup_handle = {
        let queue_tx = queue_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { startup_task(stale, queue_tx, shutdown_rx).await })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let context = SocketContext {
            config: config.clone(),
            socket: socket.clone(),
            started_at_unix,
            stats: stats.clone(),
            queue_tx: queue_tx.clone(),
            shutdown_tx: shutdown.clone(),
        };
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(listener, context, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };
    drop(queue_tx);

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (consumer_result, watcher_result, startup_result, socket_result, signal_result) = tokio::join!(
        consumer_handle,
        watcher_handle,
        startup_handle,
        socket_handle,
        signal_handle
    );

    handle_join("consumer", consumer_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("startup", startup_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Remove orphans and prune every root's mirror, returning the stale sources
/// for the consumer to convert.
fn startup_cleanup(mapper: &PathMapper) -> Vec<PathBuf> {
    let mut stale = Vec::new();
    for root in mapper.roots() {
        let plan = match reconcile::plan(mapper, root, root.path()) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(root = %root.path().display(), error = %err, "startup reconciliation failed");
                continue;
            }
        };
        let (removed, failed) = reconcile::remove_orphans(&plan, root);
        let pruned = reconcile::prune_scope(mapper, root, root.path()).unwrap_or_else(|err| {
            tracing::warn!(root = %root.path().display(), error = %err, "startup prune failed");
            0
        });
        tracing::info!(
            root = %root.path().display(),
            stale = plan.stale.len(),
            unchanged = plan.unchanged,
            removed,
            pruned,
            failed,
            "startup reconciliation",
        );
        stale.extend(plan.stale);
    }
    stale
}

async fn startup_task(
    stale: Vec<PathBuf>,
    queue_tx: mpsc::Sender<QueueItem>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    for path in stale {
        let item = QueueItem::Change(ChangeEvent::now(ChangeKind::Modified { path }));
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            sent = queue_tx.send(item) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
    tracing::debug!("startup conversions enqueued");
    Ok(())
}

async fn watcher_task(
    watcher: RecommendedWatcher,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    mut adapter: WatchAdapter,
    normalizer: Normalizer,
    queue_tx: mpsc::Sender<QueueItem>,
    stats: Arc<Stats>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    // Dropping the watcher unregisters every root.
    let _watcher = watcher;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = raw_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                for raw in adapter.translate(event) {
                    let Some(change) = normalizer.normalize(raw, Instant::now()) else {
                        continue;
                    };
                    Stats::bump(&stats.events_received);
                    stats.last_event_at_unix.store(unix_seconds_now(), Ordering::Relaxed);
                    match queue_tx.try_send(QueueItem::Change(change)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(QueueItem::Change(change))) => {
                            Stats::bump(&stats.events_dropped);
                            tracing::warn!(
                                path = %change.path().display(),
                                "mutation queue full; dropping event (next rescan repairs it)",
                            );
                        }
                        Err(TrySendError::Full(_)) => Stats::bump(&stats.events_dropped),
                        Err(TrySendError::Closed(_)) => return Ok(()),
                    }
                }
            }
        }
    }
    Ok(())
}

enum Wait {
    Item(QueueItem),
    Idle,
    Closed,
}

async fn next_item(
    queue_rx: &mut mpsc::Receiver<QueueItem>,
    moves_pending: bool,
    rename_grace: Duration,
) -> Wait {
    if moves_pending {
        match tokio::time::timeout(rename_grace, queue_rx.recv()).await {
            Ok(Some(item)) => Wait::Item(item),
            Ok(None) => Wait::Closed,
            Err(_) => Wait::Idle,
        }
    } else {
        match queue_rx.recv().await {
            Some(item) => Wait::Item(item),
            None => Wait::Closed,
        }
    }
}

/// The only task that mutates mirror trees. Each pass is one blocking wait
/// plus a non-blocking drain; unmatched move-outs from the previous pass
/// resolve at its end.
async fn consumer_task(
    sync: Arc<Synchronizer>,
    mut correlator: Correlator,
    mut queue_rx: mpsc::Receiver<QueueItem>,
    stats: Arc<Stats>,
    rename_grace: Duration,
    shutdown_grace: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        let waited = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            waited = next_item(&mut queue_rx, correlator.has_pending(), rename_grace) => waited,
        };
        let mut batch = match waited {
            Wait::Item(item) => vec![item],
            Wait::Idle => Vec::new(),
            Wait::Closed => break,
        };
        while batch.len() < MAX_PASS_ITEMS {
            match queue_rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        correlator.begin_pass();
        for item in batch {
            if shutdown_requested(&mut shutdown_rx) {
                return Ok(());
            }
            let flow = match item {
                QueueItem::Change(event) => {
                    let mut flow = Flow::Continue;
                    for mutation in correlator.accept(event) {
                        flow = apply(&sync, mutation, &stats, &mut shutdown_rx, shutdown_grace).await;
                        if flow == Flow::Stop {
                            break;
                        }
                    }
                    flow
                }
                QueueItem::Rescan { scope, respond_to } => {
                    rescan(&sync, scope, respond_to, &mut shutdown_rx, shutdown_grace).await
                }
            };
            if flow == Flow::Stop {
                return Ok(());
            }
        }
        for mutation in correlator.end_pass() {
            if apply(&sync, mutation, &stats, &mut shutdown_rx, shutdown_grace).await == Flow::Stop {
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn apply(
    sync: &Arc<Synchronizer>,
    mutation: Mutation,
    stats: &Stats,
    shutdown_rx: &mut broadcast::Receiver<()>,
    grace: Duration,
) -> Flow {
    let label = mutation.label();
    let path = mutation.path().to_path_buf();
    let worker = {
        let sync = sync.clone();
        tokio::task::spawn_blocking(move || sync.apply(&mutation))
    };
    let (joined, flow) = finish_blocking(worker, shutdown_rx, grace).await;
    let Some(joined) = joined else {
        tracing::warn!(mutation = label, path = %path.display(), "abandoned in-flight mutation at shutdown");
        return flow;
    };

    match joined {
        Ok(Ok(applied)) => {
            Stats::bump(&stats.mutations_applied);
            tracing::debug!(mutation = label, path = %path.display(), outcome = ?applied, "mutation applied");
        }
        Ok(Err(err)) if err.is_stale_race() => {
            tracing::debug!(mutation = label, path = %path.display(), "source vanished before processing");
        }
        Ok(Err(err)) => {
            Stats::bump(&stats.failures);
            tracing::warn!(mutation = label, path = %path.display(), error = %err, "mutation failed");
        }
        Err(err) => {
            Stats::bump(&stats.failures);
            tracing::error!(mutation = label, path = %path.display(), error = %err, "mutation task panicked");
        }
    }
    flow
}

async fn rescan(
    sync: &Arc<Synchronizer>,
    scope: ScanScope,
    respond_to: Option<RescanReply>,
    shutdown_rx: &mut broadcast::Receiver<()>,
    grace: Duration,
) -> Flow {
    tracing::info!(scope = ?scope, "rescan started");
    let worker = {
        let sync = sync.clone();
        tokio::task::spawn_blocking(move || scan_with(&sync, &scope, false))
    };
    let (joined, flow) = finish_blocking(worker, shutdown_rx, grace).await;
    let outcome = match joined {
        Some(Ok(Ok(reports))) => {
            for report in &reports {
                tracing::info!(
                    root = %report.root.display(),
                    converted = report.converted,
                    removed = report.removed,
                    pruned = report.pruned,
                    failed = report.failed,
                    "rescan finished",
                );
            }
            Ok(reports)
        }
        Some(Ok(Err(err))) => Err(err.to_string()),
        Some(Err(err)) => Err(format!("rescan task join error: {err}")),
        None => Err("daemon shut down during rescan".to_string()),
    };
    if let Err(err) = &outcome {
        tracing::warn!(error = %err, "rescan failed");
    }
    if let Some(respond_to) = respond_to {
        let _ = respond_to.send(outcome);
    }
    flow
}

/// Await a blocking worker. A shutdown arriving meanwhile grants the worker
/// `grace` to finish; `None` means it was abandoned.
async fn finish_blocking<T>(
    mut worker: JoinHandle<T>,
    shutdown_rx: &mut broadcast::Receiver<()>,
    grace: Duration,
) -> (Option<Result<T, JoinError>>, Flow) {
    tokio::select! {
        biased;
        joined = &mut worker => (Some(joined), Flow::Continue),
        _ = shutdown_rx.recv() => {
            match tokio::time::timeout(grace, &mut worker).await {
                Ok(joined) => (Some(joined), Flow::Stop),
                Err(_) => (None, Flow::Stop),
            }
        }
    }
}

fn shutdown_requested(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty))
}

struct SocketContext {
    config: Arc<MirrorConfig>,
    socket: PathBuf,
    started_at_unix: u64,
    stats: Arc<Stats>,
    queue_tx: mpsc::Sender<QueueItem>,
    shutdown_tx: broadcast::Sender<()>,
}

async fn socket_server_task(
    listener: UnixListener,
    context: SocketContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let context = Arc::new(context);
    tracing::info!(socket = %context.socket.display(), "control socket listening");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&context.socket, e))?;
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, &context).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if context.socket.exists() {
        let _ = fs::remove_file(&context.socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, context: &SocketContext) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: ControlRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(&mut writer, &ControlReply::error(format!("invalid request: {err}"))).await?;
                continue;
            }
        };

        let stop = request == ControlRequest::Stop;
        let response = match request {
            ControlRequest::Status => ControlReply::ok(build_status_payload(context)),
            ControlRequest::Rescan { root } => match request_rescan(context, root).await {
                Ok(reports) => ControlReply::ok(json!(reports)),
                Err(err) => ControlReply::error(err),
            },
            ControlRequest::Stop => {
                tracing::info!("stop requested over control socket");
                let _ = context.shutdown_tx.send(());
                ControlReply::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn request_rescan(
    context: &SocketContext,
    root: Option<PathBuf>,
) -> Result<Vec<RootReport>, String> {
    let scope = match root {
        Some(dir) => ScanScope::Dir(fs::canonicalize(&dir).unwrap_or(dir)),
        None => ScanScope::All,
    };
    let (respond_to, response) = oneshot::channel();
    context
        .queue_tx
        .send(QueueItem::Rescan {
            scope,
            respond_to: Some(respond_to),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("mutation queue").to_string())?;
    response
        .await
        .map_err(|_| DaemonError::ChannelClosed("rescan response").to_string())?
}

fn build_status_payload(context: &SocketContext) -> Value {
    let stats = &context.stats;
    let capacity = context.config.queue_capacity;
    let roots: Vec<String> = context
        .config
        .roots
        .iter()
        .map(|root| root.path().display().to_string())
        .collect();
    let last_event = Stats::get(&stats.last_event_at_unix);

    json!({
        "running": true,
        "started_at_unix": context.started_at_unix,
        "roots": roots,
        "queue_capacity": capacity,
        "queued": capacity.saturating_sub(context.queue_tx.capacity()),
        "events_received": Stats::get(&stats.events_received),
        "events_dropped": Stats::get(&stats.events_dropped),
        "mutations_applied": Stats::get(&stats.mutations_applied),
        "failures": Stats::get(&stats.failures),
        "last_event_at_unix": if last_event == 0 { Value::Null } else { json!(last_event) },
        "socket": context.socket.display().to_string(),
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::SocketInUse {
                socket: socket.to_path_buf(),
            });
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &ControlReply,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level`;
/// `log` records from the engine are bridged in. Later calls are no-ops.
pub fn init_tracing(default_level: &str, log_file: Option<&Path>) -> Result<(), DaemonError> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| io_err(path, e))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.try_init(),
    };
    Ok(())
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
