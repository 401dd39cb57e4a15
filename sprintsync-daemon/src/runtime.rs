use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use sprintsync_core::config;
use sprintsync_core::types::SprintId;
use sprintsync_core::Config;
use sprintsync_engine::{FileSnapshotStore, HttpIssueSource, SyncTracker};

use crate::error::{io_err, DaemonError};
use crate::log_rotation::{rotate_logs, RotationPolicy};
use crate::paths::{socket_path, sprintsync_root, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::scheduler::{RefreshResult, Scheduler};
use crate::status::collect_status;

/// Start the tokio runtime and run the daemon until shutdown.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let config = config::load_at(&home)?;
    let tick = config.refresh.tick();
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let scheduler = build_scheduler(&home, config, shutdown_tx.clone())?;
    let started_at = Utc::now();

    // Ticks requested by the watcher outside the regular interval.
    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(8);

    tracing::info!(
        home = %home.display(),
        tick_secs = tick.as_secs(),
        "sprintsync daemon starting"
    );

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let result = scheduler_task(scheduler, tick, trigger_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let result = watcher_task(home, scheduler, trigger_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                scheduler,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

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

    let (scheduler_result, watcher_result, socket_result, rotation_result, signal_result) =
        tokio::join!(
            scheduler_handle,
            watcher_handle,
            socket_handle,
            rotation_handle,
            signal_handle
        );

    handle_join("scheduler", scheduler_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("sprintsync daemon stopped");
    Ok(())
}

/// File-backed scheduler for `home`.
pub fn build_scheduler(
    home: &Path,
    config: Config,
    shutdown: broadcast::Sender<()>,
) -> Result<Arc<Scheduler>, DaemonError> {
    let lease_ttl = chrono::Duration::from_std(config.refresh.lease_ttl())
        .unwrap_or_else(|_| chrono::Duration::minutes(15));
    let tracker = Arc::new(SyncTracker::open_at(home, lease_ttl)?);
    let store = Arc::new(FileSnapshotStore::open_at(home));
    let source = Arc::new(HttpIssueSource::new(&config.source));
    Ok(Scheduler::new(config, source, store, tracker, shutdown))
}

/// One in-process refresh cycle, for when no daemon is running.
pub fn refresh_once_blocking(
    home: &Path,
    sprint: Option<SprintId>,
) -> Result<Vec<RefreshResult>, DaemonError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(async {
        let config = config::load_at(home)?;
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let scheduler = build_scheduler(home, config, shutdown_tx)?;
        scheduler.refresh_now(sprint).await
    })
}

async fn scheduler_task(
    scheduler: Arc<Scheduler>,
    tick: Duration,
    mut trigger_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => run_tick(&scheduler, "interval").await,
            trigger = trigger_rx.recv() => {
                if trigger.is_none() {
                    break;
                }
                run_tick(&scheduler, "watcher").await;
            }
        }
    }
    Ok(())
}

async fn run_tick(scheduler: &Arc<Scheduler>, reason: &str) {
    let started = Instant::now();
    let summary = scheduler.tick().await;
    if summary.results.is_empty() && summary.requeued.is_empty() && summary.skipped.is_empty() {
        return;
    }
    let refreshed = summary
        .results
        .iter()
        .filter(|r| matches!(r, RefreshResult::Refreshed { .. }))
        .count();
    let failed = summary
        .results
        .iter()
        .filter(|r| matches!(r, RefreshResult::Failed { .. }))
        .count();
    tracing::info!(
        reason,
        refreshed,
        failed,
        requeued = summary.requeued.len(),
        skipped = summary.skipped.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "scheduler tick completed"
    );
}

async fn watcher_task(
    home: PathBuf,
    scheduler: Arc<Scheduler>,
    trigger_tx: mpsc::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = sprintsync_root(&home);
    // FSEvents reports real paths (e.g. /private/var/... on macOS).
    let root = fs::canonicalize(&root).unwrap_or(root);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut _watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    _watcher.watch(&root, RecursiveMode::NonRecursive)?;

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                let Some(path) = event.paths.iter().find(|path| is_config_file(path, &root)) else {
                    continue;
                };
                if !should_process_event(&mut debounce, path, Instant::now()) {
                    continue;
                }

                match reload_config(home.clone()).await {
                    Ok(config) => {
                        let source = Arc::new(HttpIssueSource::new(&config.source));
                        let sprints = config.sprints.len();
                        let reset = scheduler.apply_config(config, source).await;
                        tracing::info!(
                            sprints,
                            reset = reset.len(),
                            "config reloaded"
                        );
                        let _ = trigger_tx.try_send(());
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "config reload failed; keeping previous config");
                    }
                }
            }
        }
    }

    Ok(())
}

async fn reload_config(home: PathBuf) -> Result<Config, DaemonError> {
    tokio::task::spawn_blocking(move || config::load_at(&home))
        .await
        .map_err(|err| DaemonError::Protocol(format!("config reload join error: {err}")))?
        .map_err(DaemonError::from)
}

async fn socket_server_task(
    home: PathBuf,
    scheduler: Arc<Scheduler>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let root = sprintsync_root(&home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let scheduler = scheduler.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, scheduler, shutdown_tx, started_at).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    scheduler: Arc<Scheduler>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
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

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => match build_status_payload(&scheduler, started_at).await {
                Ok(payload) => DaemonResponse::ok(payload),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "refresh" => {
                let sprint = request.sprint.clone().map(SprintId::from);
                match scheduler.refresh_now(sprint).await {
                    Ok(results) => DaemonResponse::ok(json!(results)),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(
    scheduler: &Arc<Scheduler>,
    started_at: DateTime<Utc>,
) -> Result<Value, DaemonError> {
    let config = scheduler.config().await;
    let tracker = scheduler.tracker().clone();
    let store = scheduler.store().clone();
    let sprints = tokio::task::spawn_blocking(move || {
        collect_status(&config, &tracker, store.as_ref(), Utc::now())
    })
    .await
    .map_err(|err| DaemonError::Protocol(format!("status join error: {err}")))??;

    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": started_at,
        "sprints": sprints,
    }))
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                tokio::task::spawn_blocking(move || rotate_logs(&home, RotationPolicy::default()))
                    .await
                    .ok();
            }
        }
    }
    Ok(())
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// `config.yaml` directly under the watched root. Editors that save via a
/// temporary file and rename still produce a create event for the target.
fn is_config_file(path: &Path, root: &Path) -> bool {
    path.parent() == Some(root)
        && path.file_name().and_then(|name| name.to_str()) == Some("config.yaml")
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind"
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [
        sprintsync_root(home),
        crate::paths::logs_dir(home),
        sprintsync_engine::snapshot_store::snapshots_dir_at(home),
    ] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
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
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `SPRINTSYNC_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SPRINTSYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
