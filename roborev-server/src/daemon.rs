//! Daemon lifecycle: single-instance handshake, port selection, signal
//! handling and graceful shutdown.
//!
//! The handshake file `<data_dir>/daemon.json` records `{pid, port,
//! startedAt}`. A second daemon refuses to start while the recorded PID
//! is alive and its port answers `/api/status`; clients use the same
//! file to find (or spawn) a daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use roborev_core::config::GlobalConfig;
use roborev_core::paths;

use crate::agent::AgentRegistry;
use crate::server::{router, AppState};
use crate::storage::Storage;
use crate::worker::WorkerPool;

/// Preferred control port when the config does not name one.
pub const DEFAULT_PORT: u16 = 7373;

/// Ports tried after the preferred one is taken.
const PORT_SCAN_RANGE: u16 = 20;

/// Budget for deciding whether an already-recorded daemon is alive.
const TAKEOVER_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a client waits for a freshly spawned daemon.
const SPAWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

pub fn read_handshake(data_dir: &Path) -> Option<Handshake> {
    let raw = std::fs::read_to_string(paths::handshake_path(data_dir)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Write-then-rename so readers never observe a partial file.
pub fn write_handshake(data_dir: &Path, handshake: &Handshake) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create {}", data_dir.display()))?;
    let path = paths::handshake_path(data_dir);
    let tmp = path.with_extension("json.tmp");
    let raw = serde_json::to_string_pretty(handshake).context("serialize handshake")?;
    std::fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

pub fn remove_handshake(data_dir: &Path) {
    let _ = std::fs::remove_file(paths::handshake_path(data_dir));
}

/// Signal 0 probes liveness without affecting the target.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Is a daemon answering on this port?
pub async fn probe_status(port: u16, timeout: Duration) -> bool {
    let url = format!("http://127.0.0.1:{port}/api/status");
    let client = reqwest::Client::new();
    match client.get(&url).timeout(timeout).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// The recorded daemon, if its PID is alive and its port responds.
pub async fn existing_daemon(data_dir: &Path) -> Option<Handshake> {
    let handshake = read_handshake(data_dir)?;
    if !pid_alive(handshake.pid) {
        return None;
    }
    if !probe_status(handshake.port, TAKEOVER_PROBE_TIMEOUT).await {
        return None;
    }
    Some(handshake)
}

/// Bind the preferred port, walking forward on conflicts.
pub async fn bind_listener(preferred: u16) -> Result<(TcpListener, u16)> {
    for offset in 0..=PORT_SCAN_RANGE {
        let port = preferred + offset;
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => debug!(port, error = %e, "port unavailable"),
        }
    }
    bail!(
        "no free port in {preferred}..={}",
        preferred + PORT_SCAN_RANGE
    );
}

/// Run the daemon to completion.
///
/// Returns `Ok` without serving when another daemon already owns the
/// handshake — the second instance exiting successfully is the
/// single-instance contract.
pub async fn run(data_dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create {}", data_dir.display()))?;
    let activity = paths::ActivityLog::new(paths::activity_log_path(&data_dir));

    if let Some(handshake) = existing_daemon(&data_dir).await {
        info!(
            pid = handshake.pid,
            port = handshake.port,
            "daemon already running; exiting"
        );
        return Ok(());
    }

    let global = GlobalConfig::load(&data_dir)?;
    let storage = Storage::open(paths::database_path(&data_dir))
        .map_err(|e| anyhow::anyhow!("open review store: {e}"))?;
    let registry = Arc::new(AgentRegistry::with_defaults(&global));

    let mut pool = WorkerPool::new(storage.clone(), registry.clone(), global.max_workers);
    pool.start();

    let preferred = global.configured_port().unwrap_or(DEFAULT_PORT);
    let (listener, port) = bind_listener(preferred).await?;

    write_handshake(
        &data_dir,
        &Handshake {
            pid: std::process::id(),
            port,
            started_at: Utc::now(),
        },
    )?;
    if let Err(e) = activity.record(&format!("daemon started on port {port}")) {
        warn!(error = %e, "failed to append activity log");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState {
        storage,
        registry,
        global_config: Arc::new(global.clone()),
        active_workers: pool.active_handle(),
        max_workers: global.max_workers,
        shutdown: shutdown_tx.clone(),
    };

    info!(port, "daemon listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_for_shutdown(shutdown_tx, shutdown_rx))
        .await
        .context("serve control API")?;

    info!("control server drained; stopping workers");
    pool.stop().await;
    remove_handshake(&data_dir);
    if let Err(e) = activity.record("daemon stopped") {
        warn!(error = %e, "failed to append activity log");
    }
    info!("daemon stopped");
    Ok(())
}

/// Resolves when SIGINT/SIGTERM arrives or the control API requests
/// shutdown. Whichever fires first also flips the shared flag so
/// enqueues start refusing immediately.
async fn wait_for_shutdown(tx: watch::Sender<bool>, mut rx: watch::Receiver<bool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            let _ = rx.changed().await;
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGINT handler");
            let _ = rx.changed().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        _ = rx.changed() => info!("shutdown requested"),
    }
    tx.send_replace(true);
}

/// Client-side helper: locate a live daemon, spawning one when needed.
///
/// The spawned process is fully detached (null stdio); the caller polls
/// the handshake until the daemon answers or the wait budget runs out.
pub async fn ensure_daemon(data_dir: &Path) -> Result<u16> {
    if let Some(handshake) = existing_daemon(data_dir).await {
        return Ok(handshake.port);
    }

    let exe = std::env::current_exe().context("locate daemon executable")?;
    std::process::Command::new(exe)
        .env(paths::DATA_DIR_ENV, data_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("spawn daemon")?;

    let deadline = tokio::time::Instant::now() + SPAWN_WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Some(handshake) = existing_daemon(data_dir).await {
            return Ok(handshake.port);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("daemon did not come online within {SPAWN_WAIT:?}");
}
