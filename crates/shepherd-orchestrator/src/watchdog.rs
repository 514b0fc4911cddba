//! Lead-side liveness sweep over the active workers.
//!
//! Every tick looks at each worker once, in priority order: a done signal is
//! applied first, then a dead pane is recovered through the shared retry
//! policy, then a stale heartbeat is counted and escalated to a kill once it
//! reaches the kill threshold. All task mutations go through the task lock,
//! so a watchdog racing another watchdog or a live daemon resolves each
//! failed attempt exactly once.

use crate::pane::PaneManager;
use crate::spawner::WorkerSpawner;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use shepherd_core::{
    DoneSignal, DoneStatus, Heartbeat, PolicyConfig, ShepherdResult, Task, TaskId, TaskStatus,
    WorkerStatus,
};
use shepherd_store::{ClaimChange, Decision, FailureClass, Member, Observation, TeamStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// A worker the lead believes is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWorker {
    /// Worker name.
    pub name: String,
    /// Provider key.
    pub provider: String,
    /// Pane the worker runs in.
    pub pane_id: String,
    /// Task the lead claimed for it at spawn (interactive workers only).
    pub task_id: Option<TaskId>,
    /// When the pane was started.
    pub spawned_at: DateTime<Utc>,
    /// Consecutive ticks with a stale heartbeat.
    pub unresponsive: u32,
}

impl ActiveWorker {
    /// A freshly spawned worker with no task.
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        pane_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            pane_id: pane_id.into(),
            task_id: None,
            spawned_at: Utc::now(),
            unresponsive: 0,
        }
    }

    /// Record the task handed over at launch.
    pub fn with_task(mut self, task_id: Option<TaskId>) -> Self {
        self.task_id = task_id;
        self
    }
}

/// The lead's map of running workers, keyed by worker name.
pub type ActiveWorkers = Arc<Mutex<BTreeMap<String, ActiveWorker>>>;

/// Something the watchdog did during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A done signal was consumed. `applied` is false when the task had already moved on.
    DoneApplied {
        worker: String,
        task_id: TaskId,
        status: DoneStatus,
        applied: bool,
    },
    /// The worker's pane was dead (or killed for being unresponsive).
    Recovered {
        worker: String,
        task_id: Option<TaskId>,
        decision: Option<Decision>,
    },
    /// Stale heartbeat, below the kill threshold so far.
    Unresponsive { worker: String, stale_ticks: u32 },
    /// A replacement took over the worker's name.
    Respawned { worker: String, pane_id: String },
}

/// What one [`Watchdog::tick`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Another tick was still running, so this one did nothing.
    pub skipped: bool,
    /// Recoveries, done signals and respawns, in order.
    pub events: Vec<WorkerEvent>,
}

struct WorkerObservation {
    worker: ActiveWorker,
    /// The worker's claims as read at the start of the tick. Normally at
    /// most one.
    tasks: Vec<Task>,
    done: Option<DoneSignal>,
    alive: bool,
    heartbeat: Option<Heartbeat>,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lead-side supervisor of worker panes. Notices dead or unresponsive
/// workers and done signals, resolves their claims through the retry
/// policy and spawns replacements while work remains.
pub struct Watchdog {
    store: TeamStore,
    panes: Arc<dyn PaneManager>,
    spawner: Arc<dyn WorkerSpawner>,
    workers: ActiveWorkers,
    leader_pane: String,
    policy: PolicyConfig,
    ticking: AtomicBool,
    consecutive_errors: AtomicU32,
    failure: watch::Sender<Option<String>>,
}

impl Watchdog {
    /// Watchdog over `workers`. Call [`Self::spawn_loop`] to start it.
    pub fn new(
        store: TeamStore,
        panes: Arc<dyn PaneManager>,
        spawner: Arc<dyn WorkerSpawner>,
        workers: ActiveWorkers,
        leader_pane: impl Into<String>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            panes,
            spawner,
            workers,
            leader_pane: leader_pane.into(),
            policy,
            ticking: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
            failure: watch::channel(None).0,
        }
    }

    /// Receives `Some(reason)` once the watchdog has given up.
    pub fn failure(&self) -> watch::Receiver<Option<String>> {
        self.failure.subscribe()
    }

    /// The reason the watchdog gave up, if it has.
    pub fn failed(&self) -> Option<String> {
        self.failure.borrow().clone()
    }

    /// Tick every `watchdog_tick` until `stop` flips or the watchdog fails.
    pub fn spawn_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.policy.watchdog_tick());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(team = %self.store.paths.team(), "Watchdog started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if let Err(reason) = self.tick_counted().await {
                    error!(reason = %reason, "Watchdog failed");
                    self.failure.send_replace(Some(reason));
                    break;
                }
            }
            info!(team = %self.store.paths.team(), "Watchdog stopped");
        })
    }

    /// One tick with error accounting. `Err` once the error budget is spent.
    async fn tick_counted(&self) -> Result<TickReport, String> {
        match self.tick().await {
            Ok(report) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                Ok(report)
            }
            Err(e) => {
                let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(consecutive_errors = errors, error = %e, "Watchdog tick failed");
                if errors >= self.policy.watchdog_max_errors {
                    Err(format!("{errors} consecutive watchdog ticks failed; last error: {e}"))
                } else {
                    Ok(TickReport::default())
                }
            }
        }
    }

    /// Sweep all active workers once. A tick that starts while another is
    /// still running returns immediately with `skipped` set.
    pub async fn tick(&self) -> ShepherdResult<TickReport> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Watchdog tick still running, skipping");
            return Ok(TickReport {
                skipped: true,
                events: Vec::new(),
            });
        }
        let _guard = TickGuard(&self.ticking);

        let snapshot: Vec<ActiveWorker> = self.workers.lock().await.values().cloned().collect();
        let mut claims: HashMap<String, Vec<Task>> = HashMap::new();
        for task in self.store.tasks.list_tasks().await? {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            if let Some(owner) = task.owner.clone() {
                claims.entry(owner).or_default().push(task);
            }
        }
        let observations = join_all(snapshot.into_iter().map(|w| {
            let tasks = claims.remove(&w.name).unwrap_or_default();
            self.observe(w, tasks)
        }))
        .await;

        let mut events = Vec::new();
        for observation in observations {
            self.handle(observation?, &mut events).await?;
        }
        Ok(TickReport {
            skipped: false,
            events,
        })
    }

    async fn observe(
        &self,
        worker: ActiveWorker,
        tasks: Vec<Task>,
    ) -> ShepherdResult<WorkerObservation> {
        let (done, alive, heartbeat) = tokio::join!(
            self.store.signals.done(&worker.name),
            self.panes.is_alive(&worker.pane_id),
            self.store.heartbeats.read(&worker.name),
        );
        Ok(WorkerObservation {
            worker,
            tasks,
            done: done?,
            alive,
            heartbeat: heartbeat?,
        })
    }

    async fn handle(
        &self,
        observation: WorkerObservation,
        events: &mut Vec<WorkerEvent>,
    ) -> ShepherdResult<()> {
        let worker = observation.worker;
        if !self.is_current(&worker).await {
            debug!(worker = %worker.name, "Worker was replaced during the tick");
            return Ok(());
        }
        if let Some(done) = observation.done {
            return self.apply_done(&worker, done, events).await;
        }
        if !observation.alive {
            warn!(worker = %worker.name, pane = %worker.pane_id, "Worker pane is dead");
            return self
                .recover(&worker, observation.tasks, "worker pane died", events)
                .await;
        }

        let stale = observation.heartbeat.as_ref().is_some_and(|hb| {
            hb.status != WorkerStatus::Shutdown
                && hb.is_stale(self.policy.heartbeat_stale(), Utc::now())
        });
        if !stale {
            self.set_unresponsive(&worker.name, 0).await;
            return Ok(());
        }
        let stale_ticks = worker.unresponsive + 1;
        if stale_ticks < self.policy.kill_threshold {
            warn!(worker = %worker.name, stale_ticks, "Worker heartbeat is stale");
            self.set_unresponsive(&worker.name, stale_ticks).await;
            events.push(WorkerEvent::Unresponsive {
                worker: worker.name.clone(),
                stale_ticks,
            });
            return Ok(());
        }
        warn!(worker = %worker.name, stale_ticks, "Worker unresponsive, killing it");
        self.set_unresponsive(&worker.name, 0).await;
        self.recover(&worker, observation.tasks, "worker stopped responding", events)
            .await
    }

    /// Whether the map still holds the pane this observation was made against.
    async fn is_current(&self, worker: &ActiveWorker) -> bool {
        self.workers
            .lock()
            .await
            .get(&worker.name)
            .is_some_and(|entry| entry.pane_id == worker.pane_id)
    }

    async fn apply_done(
        &self,
        worker: &ActiveWorker,
        done: DoneSignal,
        events: &mut Vec<WorkerEvent>,
    ) -> ShepherdResult<()> {
        let id = done.task_id;
        let current = self.store.tasks.read_task(id).await?;
        let applied = match current.filter(|t| is_claimed_by(t, &worker.name)) {
            None => false,
            Some(task) => match done.status {
                DoneStatus::Completed => self
                    .store
                    .tasks
                    .update_claimed(
                        id,
                        &worker.name,
                        task.assigned_at,
                        ClaimChange::Complete(done.summary.clone()),
                    )
                    .await?
                    .is_some(),
                DoneStatus::Failed => {
                    let reason = done
                        .summary
                        .clone()
                        .unwrap_or_else(|| "agent reported failure".into());
                    let observation = Observation::new(id, &worker.name, task.assigned_at);
                    !self
                        .store
                        .retry
                        .handle_failure(&observation, &reason, FailureClass::Transient)
                        .await?
                        .is_skipped()
                }
            },
        };
        info!(worker = %worker.name, task_id = %id, status = ?done.status, applied, "Done signal received");
        self.store.signals.clear_done(&worker.name).await?;
        events.push(WorkerEvent::DoneApplied {
            worker: worker.name.clone(),
            task_id: id,
            status: done.status,
            applied,
        });
        self.teardown(worker).await?;
        self.respawn_if_needed(worker, events).await
    }

    /// Resolve every claim the worker held when observed, then replace it.
    /// One `Recovered` event per claim, or a single one without a task.
    async fn recover(
        &self,
        worker: &ActiveWorker,
        tasks: Vec<Task>,
        reason: &str,
        events: &mut Vec<WorkerEvent>,
    ) -> ShepherdResult<()> {
        if tasks.is_empty() {
            events.push(WorkerEvent::Recovered {
                worker: worker.name.clone(),
                task_id: None,
                decision: None,
            });
        }
        for task in tasks {
            let observation = Observation::new(task.id, &worker.name, task.assigned_at);
            let decision = self
                .store
                .retry
                .handle_failure(&observation, reason, FailureClass::Transient)
                .await?;
            if let Decision::Skipped { reason } = &decision {
                debug!(worker = %worker.name, task_id = %task.id, reason = %reason, "Failure already resolved elsewhere");
            }
            events.push(WorkerEvent::Recovered {
                worker: worker.name.clone(),
                task_id: Some(task.id),
                decision: Some(decision),
            });
        }
        self.teardown(worker).await?;
        self.respawn_if_needed(worker, events).await
    }

    /// Kill the worker's pane. Its map entry stays until [`Self::respawn_if_needed`]
    /// replaces or removes it, so the map is never briefly empty mid-tick.
    async fn teardown(&self, worker: &ActiveWorker) -> ShepherdResult<()> {
        if let Err(e) = self.panes.kill_pane(&worker.pane_id).await {
            warn!(worker = %worker.name, pane = %worker.pane_id, error = %e, "Could not kill pane");
        }
        self.store.registry.unregister(&worker.name).await?;
        Ok(())
    }

    async fn respawn_if_needed(
        &self,
        worker: &ActiveWorker,
        events: &mut Vec<WorkerEvent>,
    ) -> ShepherdResult<()> {
        let pending = self
            .store
            .tasks
            .list_tasks()
            .await?
            .iter()
            .any(|t| t.status == TaskStatus::Pending);
        if !pending {
            info!(worker = %worker.name, "No pending work, not replacing worker");
            self.retire(worker).await;
            return Ok(());
        }
        let replaced = match self
            .spawner
            .spawn(&worker.name, &worker.provider, &self.leader_pane)
            .await
        {
            Ok(Some(spawned)) => {
                self.store
                    .registry
                    .register(Member::new(&worker.name, &worker.provider).with_pane(&spawned.pane_id))
                    .await?;
                self.workers.lock().await.insert(
                    worker.name.clone(),
                    ActiveWorker::new(&worker.name, &worker.provider, &spawned.pane_id)
                        .with_task(spawned.task),
                );
                info!(worker = %worker.name, pane = %spawned.pane_id, "Replacement worker spawned");
                events.push(WorkerEvent::Respawned {
                    worker: worker.name.clone(),
                    pane_id: spawned.pane_id,
                });
                true
            }
            Ok(None) => {
                debug!(worker = %worker.name, "Replacement had nothing to do");
                false
            }
            Err(e) => {
                warn!(worker = %worker.name, error = %e, "Replacement spawn failed");
                false
            }
        };
        if !replaced {
            self.retire(worker).await;
        }
        Ok(())
    }

    /// Drop the map entry unless something already replaced it.
    async fn retire(&self, worker: &ActiveWorker) {
        let mut workers = self.workers.lock().await;
        if workers
            .get(&worker.name)
            .is_some_and(|entry| entry.pane_id == worker.pane_id)
        {
            workers.remove(&worker.name);
        }
    }

    async fn set_unresponsive(&self, worker: &str, stale_ticks: u32) {
        if let Some(entry) = self.workers.lock().await.get_mut(worker) {
            entry.unresponsive = stale_ticks;
        }
    }
}

fn is_claimed_by(task: &Task, worker: &str) -> bool {
    task.status == TaskStatus::InProgress && task.owner.as_deref() == Some(worker)
}
