#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use shepherd_core::{
    Backend, DoneSignal, LaunchMode, PolicyConfig, ProviderConfig, ShepherdConfig, ShepherdError,
    ShepherdResult, Task, TaskId, TeamPaths,
};
use shepherd_orchestrator::{
    ActiveWorker, ActiveWorkers, PaneManager, Spawned, Watchdog, WorkerSpawner,
};
use shepherd_store::{init_team_dir, TeamStore};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, Default)]
pub struct PaneState {
    pub alive: bool,
    pub command: Option<String>,
    pub keys: Vec<String>,
    pub enters: u32,
}

/// In-memory panes. `sticky` panes keep showing typed text, so keystroke
/// delivery never succeeds.
#[derive(Default)]
pub struct FakePanes {
    next: AtomicU32,
    pub panes: Mutex<HashMap<String, PaneState>>,
    pub killed: Mutex<Vec<String>>,
    pub sticky: bool,
    pub liveness_delay: Duration,
}

impl FakePanes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sticky() -> Self {
        Self {
            sticky: true,
            ..Self::default()
        }
    }

    pub fn slow(liveness_delay: Duration) -> Self {
        Self {
            liveness_delay,
            ..Self::default()
        }
    }

    pub fn open(&self) -> String {
        let id = format!("%{}", self.next.fetch_add(1, Ordering::SeqCst));
        self.panes.lock().unwrap().insert(
            id.clone(),
            PaneState {
                alive: true,
                ..PaneState::default()
            },
        );
        id
    }

    pub fn crash(&self, pane: &str) {
        if let Some(state) = self.panes.lock().unwrap().get_mut(pane) {
            state.alive = false;
        }
    }

    pub fn state(&self, pane: &str) -> PaneState {
        self.panes.lock().unwrap().get(pane).cloned().unwrap_or_default()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaneManager for FakePanes {
    async fn create_session(&self, _name: &str, _cwd: &Path) -> ShepherdResult<String> {
        Ok(self.open())
    }

    async fn split_pane(&self, target: &str, _cwd: &Path) -> ShepherdResult<String> {
        if !self.panes.lock().unwrap().contains_key(target) {
            return Err(ShepherdError::Pane(format!("can't find pane: {target}")));
        }
        Ok(self.open())
    }

    async fn launch(&self, pane: &str, command: &str) -> ShepherdResult<()> {
        let mut panes = self.panes.lock().unwrap();
        let state = panes
            .get_mut(pane)
            .ok_or_else(|| ShepherdError::Pane(format!("can't find pane: {pane}")))?;
        state.command = Some(command.to_string());
        Ok(())
    }

    async fn send_keys(&self, pane: &str, text: &str) -> ShepherdResult<()> {
        let mut panes = self.panes.lock().unwrap();
        let state = panes
            .get_mut(pane)
            .ok_or_else(|| ShepherdError::Pane(format!("can't find pane: {pane}")))?;
        state.keys.push(text.to_string());
        state.enters += 1;
        Ok(())
    }

    async fn send_enter(&self, pane: &str) -> ShepherdResult<()> {
        if let Some(state) = self.panes.lock().unwrap().get_mut(pane) {
            state.enters += 1;
        }
        Ok(())
    }

    async fn capture_pane(&self, pane: &str) -> ShepherdResult<String> {
        let state = self.state(pane);
        if self.sticky {
            Ok(format!("> {}", state.keys.last().cloned().unwrap_or_default()))
        } else {
            Ok("> ".into())
        }
    }

    async fn is_alive(&self, pane: &str) -> bool {
        if !self.liveness_delay.is_zero() {
            tokio::time::sleep(self.liveness_delay).await;
        }
        self.state(pane).alive
    }

    async fn kill_pane(&self, pane: &str) -> ShepherdResult<()> {
        if let Some(state) = self.panes.lock().unwrap().get_mut(pane) {
            state.alive = false;
        }
        self.killed.lock().unwrap().push(pane.to_string());
        Ok(())
    }
}

/// Stands in for an interactive worker: claims a task on spawn and, with
/// `finish_after` set, writes a completed done signal once that time passes.
pub struct FakeSpawner {
    pub store: TeamStore,
    pub panes: Arc<FakePanes>,
    pub claim: bool,
    pub finish_after: Option<Duration>,
    /// Spawns beyond this many fail.
    pub max_spawns: u32,
    pub spawns: AtomicU32,
}

impl FakeSpawner {
    pub fn new(store: TeamStore, panes: Arc<FakePanes>) -> Self {
        Self {
            store,
            panes,
            claim: true,
            finish_after: None,
            max_spawns: u32::MAX,
            spawns: AtomicU32::new(0),
        }
    }

    pub fn spawn_count(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerSpawner for FakeSpawner {
    async fn spawn(
        &self,
        worker: &str,
        _provider: &str,
        leader_pane: &str,
    ) -> ShepherdResult<Option<Spawned>> {
        if self.spawns.load(Ordering::SeqCst) >= self.max_spawns {
            return Err(ShepherdError::Pane("no room for another pane".into()));
        }
        let task = if self.claim {
            match self.store.tasks.find_next_task(worker).await? {
                Some(task) => Some(task.id),
                None => return Ok(None),
            }
        } else {
            None
        };
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let pane_id = self.panes.split_pane(leader_pane, Path::new(".")).await?;

        if let (Some(delay), Some(id)) = (self.finish_after, task) {
            let store = self.store.clone();
            let worker = worker.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let done = DoneSignal::completed(id, format!("finished {id}"));
                store.signals.write_done(&worker, &done).await.unwrap();
            });
        }
        Ok(Some(Spawned { pane_id, task }))
    }
}

pub struct Team {
    pub dir: TempDir,
    pub store: TeamStore,
    pub panes: Arc<FakePanes>,
    pub leader: String,
    pub workers: ActiveWorkers,
}

pub fn fast_policy() -> PolicyConfig {
    PolicyConfig {
        watchdog_tick_ms: 20,
        monitor_interval_ms: 20,
        poll_interval_ms: 20,
        ack_timeout_secs: 1,
        send_keys_grace_ms: 5,
        lock_retry_delay_ms: 5,
        ..PolicyConfig::default()
    }
}

/// A config whose `fake` provider resolves to `sh`.
pub fn fake_config(data_root: &Path, mode: LaunchMode) -> ShepherdConfig {
    let mut config = ShepherdConfig {
        data_root: data_root.to_path_buf(),
        policy: fast_policy(),
        ..ShepherdConfig::default()
    };
    config.providers.insert(
        "fake".into(),
        ProviderConfig {
            command: "sh".into(),
            args: vec![],
            mode,
        },
    );
    config
}

pub async fn team(backend: Backend, tasks: u64, panes: FakePanes) -> Team {
    let dir = tempfile::tempdir().unwrap();
    let paths = TeamPaths::new(dir.path(), "alpha");
    init_team_dir(&paths, backend).await.unwrap();
    let store = TeamStore::open(paths, &fast_policy(), "lead");
    for i in 1..=tasks {
        let task = Task::new(TaskId(i), format!("task {i}"), "do the thing");
        store.tasks.create_task(&task).await.unwrap();
    }
    let panes = Arc::new(panes);
    let leader = panes.open();
    Team {
        dir,
        store,
        panes,
        leader,
        workers: Arc::new(tokio::sync::Mutex::new(BTreeMap::new())),
    }
}

impl Team {
    pub fn watchdog(&self, spawner: Arc<FakeSpawner>, policy: PolicyConfig) -> Watchdog {
        Watchdog::new(
            self.store.clone(),
            self.panes.clone(),
            spawner,
            self.workers.clone(),
            &self.leader,
            policy,
        )
    }

    /// Spawn `worker` through `spawner` and track it as active.
    pub async fn start_worker(&self, spawner: &FakeSpawner, worker: &str) -> Spawned {
        let spawned = spawner
            .spawn(worker, "fake", &self.leader)
            .await
            .unwrap()
            .expect("worker had nothing to claim");
        self.workers.lock().await.insert(
            worker.to_string(),
            ActiveWorker::new(worker, "fake", &spawned.pane_id).with_task(spawned.task),
        );
        spawned
    }

    pub async fn task(&self, id: u64) -> Task {
        self.store.tasks.read_task(TaskId(id)).await.unwrap().unwrap()
    }

    pub async fn retry_count(&self, id: u64) -> Option<u32> {
        self.store
            .retry
            .sidecar()
            .read(TaskId(id))
            .await
            .unwrap()
            .map(|r| r.retry_count)
    }

    pub async fn pane_of(&self, worker: &str) -> Option<String> {
        self.workers.lock().await.get(worker).map(|w| w.pane_id.clone())
    }
}
