use crate::monitor::{TaskCounts, TeamSnapshot, WorkerSnapshot};
use crate::pane::PaneManager;
use crate::providers::check_providers;
use crate::spawner::WorkerSpawner;
use crate::watchdog::{ActiveWorker, ActiveWorkers, Watchdog};
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use shepherd_core::fsio::write_atomic;
use shepherd_core::{
    LaunchMode, OutboxKind, OutboxMessage, PolicyConfig, ShepherdConfig, ShepherdResult, Signal,
    TeamPaths, TeamSpec,
};
use shepherd_store::{
    init_team_dir, Member, SessionState, TeamRecord, TeamShutdown, TeamStore,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Create the team directory for `spec` and open its store.
pub async fn prepare_team(config: &ShepherdConfig, spec: &TeamSpec) -> ShepherdResult<TeamStore> {
    let paths = TeamPaths::new(&config.data_root, &spec.name);
    init_team_dir(&paths, spec.backend).await?;
    Ok(TeamStore::open(paths, &config.policy, "lead"))
}

/// Result of [`TeamController::shutdown_team`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Bridge workers that acknowledged in time.
    pub acked: Vec<String>,
    /// Bridge workers that did not acknowledge within the ack timeout.
    pub unacked: Vec<String>,
    /// Worker panes killed.
    pub killed_panes: usize,
}

struct RunningWatchdog {
    watchdog: Arc<Watchdog>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns one team session: its panes, its active workers and its watchdog.
pub struct TeamController {
    store: TeamStore,
    panes: Arc<dyn PaneManager>,
    spawner: Arc<dyn WorkerSpawner>,
    config: ShepherdConfig,
    workers: ActiveWorkers,
    leader_pane: Mutex<Option<String>>,
    watchdog: Mutex<Option<RunningWatchdog>>,
}

impl TeamController {
    /// Controller for the team in `store`. Nothing starts until [`Self::start_team`].
    pub fn new(
        store: TeamStore,
        panes: Arc<dyn PaneManager>,
        spawner: Arc<dyn WorkerSpawner>,
        config: ShepherdConfig,
    ) -> Self {
        Self {
            store,
            panes,
            spawner,
            config,
            workers: Arc::new(Mutex::new(BTreeMap::new())),
            leader_pane: Mutex::new(None),
            watchdog: Mutex::new(None),
        }
    }

    /// The team's shared state.
    pub fn store(&self) -> &TeamStore {
        &self.store
    }

    /// Team name.
    pub fn team(&self) -> &str {
        self.store.paths.team()
    }

    /// Runtime configuration the controller was built with.
    pub fn config(&self) -> &ShepherdConfig {
        &self.config
    }

    /// Snapshot of the lead's active-worker map.
    pub async fn active_workers(&self) -> Vec<ActiveWorker> {
        self.workers.lock().await.values().cloned().collect()
    }

    /// Seed the team, lay out panes, spawn the first workers and start the watchdog.
    pub async fn start_team(&self, spec: &TeamSpec) -> ShepherdResult<()> {
        check_providers(&self.config, spec.providers())?;
        let started = Instant::now();

        self.store
            .registry
            .write_team(&TeamRecord {
                name: spec.name.clone(),
                backend: spec.backend,
                workers: spec.workers,
                cwd: spec.cwd.clone(),
                created_at: Utc::now(),
            })
            .await?;
        self.store.signals.clear_team_shutdown().await?;
        self.seed_tasks(spec).await?;
        let names = spec.worker_names();
        if let Some(overlay) = &spec.overlay {
            for name in &names {
                write_atomic(&self.store.paths.overlay_file(name), overlay.as_bytes()).await?;
            }
        }

        let leader = self
            .panes
            .create_session(&session_name(self.team()), &spec.cwd)
            .await?;
        *self.leader_pane.lock().await = Some(leader.clone());

        // One worker that fails to come up must not strand the ones that did.
        let mut first_failure = None;
        for (index, name) in names.iter().enumerate() {
            let provider = spec.provider_for(index);
            self.store.signals.clear(name).await?;
            self.store.signals.clear_ack(name).await?;
            self.store.signals.clear_done(name).await?;
            match self.spawner.spawn(name, provider, &leader).await {
                Err(e) => {
                    warn!(worker = %name, error = %e, "Worker failed to start");
                    first_failure.get_or_insert(e);
                }
                Ok(None) => info!(worker = %name, "Nothing to claim, worker not started"),
                Ok(Some(spawned)) => {
                    self.store
                        .registry
                        .register(Member::new(name, provider).with_pane(&spawned.pane_id))
                        .await?;
                    self.workers.lock().await.insert(
                        name.clone(),
                        ActiveWorker::new(name, provider, &spawned.pane_id).with_task(spawned.task),
                    );
                }
            }
        }
        if let Some(e) = first_failure {
            if self.workers.lock().await.is_empty() {
                return Err(e);
            }
        }

        self.save_session(&leader).await?;
        if let Err(e) = self.panes.equalize_layout(&leader).await {
            warn!(error = %e, "Could not equalize pane layout");
        }
        self.start_watchdog(&leader).await;
        info!(
            team = %self.team(),
            workers = self.workers.lock().await.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Team started"
        );
        Ok(())
    }

    async fn seed_tasks(&self, spec: &TeamSpec) -> ShepherdResult<()> {
        let mut created = 0;
        for task in spec.seed_tasks() {
            if self.store.tasks.read_task(task.id).await?.is_some() {
                debug!(task_id = %task.id, "Task already seeded");
                continue;
            }
            self.store.tasks.create_task(&task).await?;
            created += 1;
        }
        info!(team = %self.team(), created, "Tasks seeded");
        Ok(())
    }

    async fn save_session(&self, leader: &str) -> ShepherdResult<()> {
        let worker_panes = self
            .workers
            .lock()
            .await
            .values()
            .map(|w| (w.name.clone(), w.pane_id.clone()))
            .collect();
        self.store
            .registry
            .save_session(&SessionState {
                team: self.team().to_string(),
                leader_pane: leader.to_string(),
                worker_panes,
                started_at: Utc::now(),
            })
            .await
    }

    async fn start_watchdog(&self, leader: &str) {
        let watchdog = Arc::new(Watchdog::new(
            self.store.clone(),
            self.panes.clone(),
            self.spawner.clone(),
            self.workers.clone(),
            leader,
            self.config.policy.clone(),
        ));
        let (stop, stop_rx) = watch::channel(false);
        let handle = watchdog.clone().spawn_loop(stop_rx);
        *self.watchdog.lock().await = Some(RunningWatchdog {
            watchdog,
            stop,
            handle,
        });
    }

    async fn stop_watchdog(&self) {
        let Some(running) = self.watchdog.lock().await.take() else {
            return;
        };
        let _ = running.stop.send(true);
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Watchdog task ended abnormally");
        }
    }

    /// Reason the watchdog gave up, if it has.
    pub async fn watchdog_failure(&self) -> Option<String> {
        self.watchdog
            .lock()
            .await
            .as_ref()
            .and_then(|running| running.watchdog.failed())
    }

    /// Read-only view of tasks, panes and heartbeats.
    pub async fn monitor_team(&self) -> ShepherdResult<TeamSnapshot> {
        let active = self.active_workers().await;
        let mut snapshot =
            build_snapshot(&self.store, self.panes.as_ref(), &self.config.policy, active).await?;
        snapshot.watchdog_failure = self.watchdog_failure().await;
        Ok(snapshot)
    }

    /// Read and log every new worker report. Returns them for callers that want more.
    pub async fn drain_outboxes(&self) -> ShepherdResult<Vec<(String, OutboxMessage)>> {
        let mut drained = Vec::new();
        for worker in self.active_workers().await {
            for message in self.store.mailbox.read_outbox(&worker.name).await? {
                log_report(&worker.name, &message);
                drained.push((worker.name.clone(), message));
            }
        }
        Ok(drained)
    }

    /// Stop the team. With `drain`, bridge workers finish their current task first.
    ///
    /// Panes are killed whether or not workers acknowledged; waiting is bounded
    /// by the ack timeout.
    pub async fn shutdown_team(&self, drain: bool, reason: &str) -> ShepherdResult<ShutdownReport> {
        info!(team = %self.team(), drain, reason, "Shutting down team");
        self.store
            .signals
            .record_team_shutdown(&TeamShutdown {
                reason: reason.to_string(),
                drain,
                requested_at: Utc::now(),
            })
            .await?;
        self.stop_watchdog().await;

        let active = self.active_workers().await;
        let mut waiting = BTreeMap::new();
        for worker in &active {
            if self.config.provider(&worker.provider).mode != LaunchMode::Bridge {
                continue;
            }
            let signal = Signal::new(reason);
            if drain {
                self.store.signals.request_drain(&worker.name, &signal).await?;
            } else {
                self.store.signals.request_shutdown(&worker.name, &signal).await?;
            }
            waiting.insert(worker.name.clone(), signal.request_id);
        }

        let mut report = ShutdownReport::default();
        self.await_acks(&mut waiting, &mut report).await?;
        report.unacked = waiting.into_keys().collect();
        if !report.unacked.is_empty() {
            warn!(workers = ?report.unacked, "Workers did not acknowledge shutdown");
        }
        self.drain_outboxes().await?;

        for worker in &active {
            match self.panes.kill_pane(&worker.pane_id).await {
                Ok(()) => report.killed_panes += 1,
                Err(e) => warn!(worker = %worker.name, error = %e, "Could not kill pane"),
            }
            self.store.registry.unregister(&worker.name).await?;
            self.store.signals.clear(&worker.name).await?;
        }
        self.workers.lock().await.clear();

        if let Some(leader) = self.leader_pane.lock().await.take() {
            if let Err(e) = self.panes.kill_pane(&leader).await {
                warn!(pane = %leader, error = %e, "Could not kill leader pane");
            }
        }
        self.store.registry.remove_session().await?;
        info!(
            team = %self.team(),
            acked = report.acked.len(),
            unacked = report.unacked.len(),
            "Team shut down"
        );
        Ok(report)
    }

    async fn await_acks(
        &self,
        waiting: &mut BTreeMap<String, String>,
        report: &mut ShutdownReport,
    ) -> ShepherdResult<()> {
        let deadline = Instant::now() + self.config.policy.ack_timeout();
        let poll = self.config.policy.poll_interval().min(std::time::Duration::from_millis(250));
        while !waiting.is_empty() {
            let mut acked = Vec::new();
            for (worker, request_id) in waiting.iter() {
                if let Some(ack) = self.store.signals.ack(worker).await? {
                    if &ack.request_id == request_id {
                        acked.push(worker.clone());
                    }
                }
            }
            for worker in acked {
                waiting.remove(&worker);
                self.store.signals.clear_ack(&worker).await?;
                report.acked.push(worker);
            }
            if waiting.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }
        Ok(())
    }
}

/// Snapshot of a team from another process, using the registry in place of
/// the lead's in-memory worker map.
pub async fn observe_team(
    store: &TeamStore,
    panes: &dyn PaneManager,
    policy: &PolicyConfig,
) -> ShepherdResult<TeamSnapshot> {
    let members = store
        .registry
        .members()
        .await?
        .into_iter()
        .map(|m| ActiveWorker::new(m.name, m.provider, m.pane_id.unwrap_or_default()))
        .collect();
    build_snapshot(store, panes, policy, members).await
}

async fn build_snapshot(
    store: &TeamStore,
    panes: &dyn PaneManager,
    policy: &PolicyConfig,
    workers: Vec<ActiveWorker>,
) -> ShepherdResult<TeamSnapshot> {
    let tasks = store.tasks.list_tasks().await?;
    let counts = TaskCounts::from_tasks(&tasks);
    let stale_after = policy.heartbeat_stale();
    let now = Utc::now();

    let observed = join_all(workers.into_iter().map(|worker| async move {
        let (alive, heartbeat) = tokio::join!(
            async {
                !worker.pane_id.is_empty() && panes.is_alive(&worker.pane_id).await
            },
            store.heartbeats.read(&worker.name)
        );
        (worker, alive, heartbeat)
    }))
    .await;

    let mut snapshots = Vec::with_capacity(observed.len());
    for (worker, alive, heartbeat) in observed {
        let heartbeat = heartbeat?;
        snapshots.push(WorkerSnapshot {
            status: heartbeat.as_ref().map(|hb| hb.status),
            heartbeat_stale: heartbeat
                .as_ref()
                .is_some_and(|hb| hb.is_stale(stale_after, now)),
            current_task_id: heartbeat
                .and_then(|hb| hb.current_task_id)
                .or(worker.task_id),
            name: worker.name,
            provider: worker.provider,
            pane_id: worker.pane_id,
            pane_alive: alive,
        });
    }

    Ok(TeamSnapshot {
        team: store.paths.team().to_string(),
        phase: counts.phase(),
        counts,
        workers: snapshots,
        watchdog_failure: None,
    })
}

/// tmux session name for a team.
pub fn session_name(team: &str) -> String {
    format!("shepherd-{team}")
}

fn log_report(worker: &str, message: &OutboxMessage) {
    let task_id = message.task_id.map(|id| id.to_string()).unwrap_or_default();
    let text = message
        .summary
        .as_deref()
        .or(message.error.as_deref())
        .or(message.message.as_deref())
        .unwrap_or_default();
    match message.kind {
        OutboxKind::TaskFailed | OutboxKind::Error => {
            warn!(worker, kind = ?message.kind, task_id = %task_id, "{text}")
        }
        _ => info!(worker, kind = ?message.kind, task_id = %task_id, "{text}"),
    }
}
