//! Subcommand implementations. Each returns what it wants printed on stdout.

use anyhow::{bail, Context};
use chrono::Utc;
use serde::Serialize;
use shepherd_bridge::{BridgeDaemon, BridgeOptions};
use shepherd_core::{DoneSignal, InboxMessage, ShepherdConfig, Signal, TaskId, TeamPaths, TeamSpec};
use shepherd_orchestrator::{
    observe_team, prepare_team, run_team, PaneManager, PaneSpawner, QualityLogGate,
    TeamController, TeamRunResult, TeamSnapshot, TmuxPaneManager,
};
use shepherd_store::{TeamShutdown, TeamStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Load `shepherd.toml` and pin `data_root` to an absolute path, since panes
/// and bridge daemons may run from another directory.
pub async fn load_config(
    path: &Path,
    data_root: Option<PathBuf>,
) -> anyhow::Result<ShepherdConfig> {
    let mut config = ShepherdConfig::load(path)
        .await
        .with_context(|| format!("failed to load config '{}'", path.display()))?;
    if let Some(root) = data_root {
        config.data_root = root;
    }
    config.data_root = std::path::absolute(&config.data_root)?;
    Ok(config)
}

/// Open an existing team. `holder` names this process in claim tokens.
pub async fn open_team(
    config: &ShepherdConfig,
    team: &str,
    holder: &str,
) -> anyhow::Result<TeamStore> {
    let paths = TeamPaths::new(&config.data_root, team);
    match tokio::fs::metadata(paths.team_dir()).await {
        Ok(meta) if meta.is_dir() => {}
        _ => bail!(
            "team '{team}' not found under {}",
            config.data_root.display()
        ),
    }
    Ok(TeamStore::open(paths, &config.policy, holder))
}

fn panes(socket: Option<String>) -> TmuxPaneManager {
    match socket {
        Some(socket) => TmuxPaneManager::new().with_socket(socket),
        None => TmuxPaneManager::new(),
    }
}

/// Read a team file, resolving a relative `cwd` against the file's directory.
pub async fn load_team_spec(path: &Path) -> anyhow::Result<TeamSpec> {
    let mut spec = TeamSpec::load(path).await?;
    if spec.cwd.is_relative() {
        let base = std::path::absolute(path)?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        spec.cwd = base.join(&spec.cwd);
    }
    Ok(spec)
}

/// `shepherd run`: drive a team until it finishes, fails or is interrupted.
pub async fn run(
    config: ShepherdConfig,
    config_path: &Path,
    team_file: &Path,
    socket: Option<String>,
) -> anyhow::Result<TeamRunResult> {
    let spec = load_team_spec(team_file).await?;
    let store = prepare_team(&config, &spec).await?;
    let panes: Arc<dyn PaneManager> = Arc::new(panes(socket));
    let exe = std::env::current_exe().context("cannot locate the shepherd binary")?;
    let spawner = PaneSpawner::new(panes.clone(), store.clone(), config.clone(), &spec.cwd, exe)
        .with_config_path(std::path::absolute(config_path)?);
    let gate = QualityLogGate::from_config(&config.gate);
    let controller = TeamController::new(store, panes, Arc::new(spawner), config);

    let (cancel_tx, cancel) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting the team down");
            let _ = cancel_tx.send(true);
        }
    });

    Ok(run_team(&controller, &spec, gate.as_ref(), cancel).await)
}

/// `shepherd bridge`: the per-worker daemon a bridge-mode pane runs.
pub async fn bridge(
    config: &ShepherdConfig,
    team: &str,
    worker: &str,
    provider: &str,
    cwd: PathBuf,
) -> anyhow::Result<()> {
    let store = open_team(config, team, worker).await?;
    let options = BridgeOptions::from_config(config, worker, provider, cwd);
    BridgeDaemon::new(store, options)?.run().await?;
    Ok(())
}

/// `shepherd monitor`
pub async fn monitor(
    config: &ShepherdConfig,
    team: &str,
    socket: Option<String>,
) -> anyhow::Result<TeamSnapshot> {
    let store = open_team(config, team, "monitor").await?;
    let panes = panes(socket);
    Ok(observe_team(&store, &panes, &config.policy).await?)
}

/// What `shepherd shutdown` did.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownRequested {
    /// Team the request was for.
    pub team: String,
    /// Whether workers may finish their current task.
    pub drain: bool,
    /// Workers signalled directly. Empty when a live lead handles it.
    pub signalled: Vec<String>,
}

/// `shepherd shutdown`: ask a running lead, or orphaned bridge workers, to stop.
pub async fn shutdown(
    config: &ShepherdConfig,
    team: &str,
    drain: bool,
    reason: &str,
) -> anyhow::Result<ShutdownRequested> {
    let store = open_team(config, team, "operator").await?;
    store
        .signals
        .record_team_shutdown(&TeamShutdown {
            reason: reason.to_string(),
            drain,
            requested_at: Utc::now(),
        })
        .await?;

    // A live lead picks up the record and signals its own workers. Without
    // one, signal whatever bridge daemons are still registered.
    let mut signalled = Vec::new();
    if store.registry.session().await?.is_some() {
        info!(team, drain, "Shutdown recorded for the running lead");
        return Ok(ShutdownRequested {
            team: team.to_string(),
            drain,
            signalled,
        });
    }
    let signal = Signal::new(reason);
    for member in store.registry.members().await? {
        if drain {
            store.signals.request_drain(&member.name, &signal).await?;
        } else {
            store.signals.request_shutdown(&member.name, &signal).await?;
        }
        signalled.push(member.name);
    }
    info!(team, drain, workers = signalled.len(), "Shutdown requested");
    Ok(ShutdownRequested {
        team: team.to_string(),
        drain,
        signalled,
    })
}

/// `shepherd send`: queue a message for a worker's next prompt.
pub async fn send(
    config: &ShepherdConfig,
    team: &str,
    worker: &str,
    text: &str,
) -> anyhow::Result<()> {
    if text.trim().is_empty() {
        bail!("refusing to send an empty message");
    }
    let store = open_team(config, team, "operator").await?;
    store
        .mailbox
        .send_inbox(worker, &InboxMessage::new(text))
        .await?;
    info!(team, worker, "Message queued");
    Ok(())
}

/// How an interactive worker reports the end of its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneOutcome {
    Completed(String),
    Failed(String),
}

/// `shepherd done`: the command interactive workers run when they finish.
pub async fn done(
    config: &ShepherdConfig,
    team: &str,
    worker: &str,
    task: u64,
    outcome: DoneOutcome,
) -> anyhow::Result<()> {
    let store = open_team(config, team, worker).await?;
    let id = TaskId(task);
    let signal = match outcome {
        DoneOutcome::Completed(summary) => DoneSignal::completed(id, summary),
        DoneOutcome::Failed(reason) => DoneSignal::failed(id, reason),
    };
    store.signals.write_done(worker, &signal).await?;
    info!(team, worker, task_id = %id, status = ?signal.status, "Done signal written");
    Ok(())
}
