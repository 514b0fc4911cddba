#![allow(clippy::unwrap_used, clippy::expect_used)]

use shepherd_bridge::{AgentCommand, BridgeDaemon, BridgeOptions, TickOutcome};
use shepherd_core::{
    Backend, MailboxDirection, OutboxKind, PermissionConfig, PermissionMode, PolicyConfig, Signal,
    ShepherdResult, Task, TaskId, TaskStatus, TeamPaths, WorkerStatus,
};
use shepherd_store::{init_team_dir, LockPolicy, Member, SignalBoard, TaskLock, TaskStore, TeamStore};
use std::sync::Arc;
use tempfile::TempDir;

const WORKER: &str = "worker-1";

struct Fixture {
    _data: TempDir,
    work: TempDir,
    store: TeamStore,
}

fn policy() -> PolicyConfig {
    PolicyConfig {
        poll_interval_ms: 50,
        agent_timeout_secs: 10,
        kill_grace_ms: 300,
        quarantine_threshold: 2,
        ..PolicyConfig::default()
    }
}

async fn fixture(backend: Backend, tasks: usize) -> Fixture {
    let data = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let paths = TeamPaths::new(data.path(), "alpha");
    init_team_dir(&paths, backend).await.unwrap();
    let store = TeamStore::open(paths, &policy(), WORKER);
    for i in 1..=tasks {
        let task = Task::new(TaskId(i as u64), format!("task {i}"), "do the thing");
        store.tasks.create_task(&task).await.unwrap();
    }
    Fixture {
        _data: data,
        work,
        store,
    }
}

fn daemon(fx: &Fixture, script: &str, permissions: PermissionConfig) -> BridgeDaemon {
    let options = BridgeOptions {
        worker: WORKER.into(),
        provider: "fake".into(),
        command: AgentCommand::new("sh", vec!["-c".into(), script.into()], fx.work.path()),
        policy: policy(),
        permissions,
    };
    BridgeDaemon::new(fx.store.clone(), options).unwrap()
}

async fn task(fx: &Fixture, id: u64) -> Task {
    fx.store.tasks.read_task(TaskId(id)).await.unwrap().unwrap()
}

async fn outbox_kinds(fx: &Fixture) -> Vec<OutboxKind> {
    fx.store
        .mailbox
        .read_outbox(WORKER)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.kind)
        .collect()
}

#[tokio::test]
async fn test_successful_run_completes_task() {
    for backend in [Backend::Legacy, Backend::Structured] {
        let fx = fixture(backend, 1).await;
        let mut d = daemon(&fx, "cat >/dev/null; echo \"done-$SHEPHERD_TASK_ID\"", PermissionConfig::default());

        assert_eq!(d.tick().await, TickOutcome::Ran(TaskId(1)));
        let t = task(&fx, 1).await;
        assert_eq!(t.status, TaskStatus::Completed, "{backend:?}");
        assert_eq!(t.summary.as_deref(), Some("done-1"));
        assert!(t.completed_at.is_some());

        let messages = fx.store.mailbox.read_outbox(WORKER).await.unwrap();
        assert_eq!(messages[0].kind, OutboxKind::Ready);
        assert_eq!(messages[1].kind, OutboxKind::TaskComplete);
        assert_eq!(messages[1].task_id, Some(TaskId(1)));

        let prompt = std::fs::read_to_string(fx.store.paths.prompt_file(WORKER)).unwrap();
        assert!(prompt.contains("<task_id>1</task_id>"));
        let hb = fx.store.heartbeats.read(WORKER).await.unwrap().unwrap();
        assert_eq!(hb.status, WorkerStatus::Polling);
        assert_eq!(hb.current_task_id, None);
    }
}

#[tokio::test]
async fn test_failed_run_is_requeued_with_sidecar() {
    let fx = fixture(Backend::Legacy, 1).await;
    let mut d = daemon(&fx, "echo nope >&2; exit 2", PermissionConfig::default());

    assert_eq!(d.tick().await, TickOutcome::Ran(TaskId(1)));
    let t = task(&fx, 1).await;
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.owner, None);
    let record = fx.store.retry.sidecar().read(TaskId(1)).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 1);
    assert!(record.last_error.contains("exited with code 2"));

    let messages = fx.store.mailbox.read_outbox(WORKER).await.unwrap();
    let failed = messages.iter().find(|m| m.kind == OutboxKind::TaskFailed).unwrap();
    assert!(failed.error.as_deref().unwrap().contains("will retry"));
}

#[tokio::test]
async fn test_last_attempt_fails_permanently() {
    let fx = fixture(Backend::Legacy, 1).await;
    let mut d = daemon(&fx, "exit 1", PermissionConfig::default());
    let max = policy().max_retries;
    for _ in 0..max {
        assert_eq!(d.tick().await, TickOutcome::Ran(TaskId(1)));
    }
    let t = task(&fx, 1).await;
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(t.summary.unwrap().starts_with("gave up after"));
    assert_eq!(d.tick().await, TickOutcome::Idle);
}

#[tokio::test]
async fn test_idle_is_reported_once() {
    let fx = fixture(Backend::Legacy, 0).await;
    let mut d = daemon(&fx, "true", PermissionConfig::default());
    assert_eq!(d.tick().await, TickOutcome::Idle);
    assert_eq!(d.tick().await, TickOutcome::Idle);
    assert_eq!(d.tick().await, TickOutcome::Idle);
    assert_eq!(outbox_kinds(&fx).await, vec![OutboxKind::Ready, OutboxKind::Idle]);
}

#[tokio::test]
async fn test_shutdown_signal_is_acknowledged() {
    let fx = fixture(Backend::Legacy, 1).await;
    fx.store
        .registry
        .register(Member::new(WORKER, "fake"))
        .await
        .unwrap();
    let signal = Signal::new("test");
    fx.store.signals.request_shutdown(WORKER, &signal).await.unwrap();

    let mut d = daemon(&fx, "true", PermissionConfig::default());
    assert_eq!(d.tick().await, TickOutcome::Shutdown);

    let ack = fx.store.signals.ack(WORKER).await.unwrap().unwrap();
    assert_eq!(ack.request_id, signal.request_id);
    assert!(fx.store.signals.shutdown_signal(WORKER).await.unwrap().is_none());
    assert!(fx.store.registry.members().await.unwrap().is_empty());
    let hb = fx.store.heartbeats.read(WORKER).await.unwrap().unwrap();
    assert_eq!(hb.status, WorkerStatus::Shutdown);
    assert_eq!(outbox_kinds(&fx).await, vec![OutboxKind::ShutdownAck]);
    assert_eq!(task(&fx, 1).await.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_drain_claims_nothing() {
    let fx = fixture(Backend::Structured, 2).await;
    fx.store
        .signals
        .request_drain(WORKER, &Signal::new("drain"))
        .await
        .unwrap();
    let mut d = daemon(&fx, "echo ok", PermissionConfig::default());
    assert_eq!(d.tick().await, TickOutcome::Shutdown);
    assert_eq!(task(&fx, 1).await.status, TaskStatus::Pending);
    assert!(fx.store.signals.drain_signal(WORKER).await.unwrap().is_none());
}

/// Task store whose claims are immediately followed by a drain request, as
/// if the operator asked for one while the claim was being written.
struct DrainAfterClaim {
    inner: Arc<dyn TaskStore>,
    signals: SignalBoard,
}

#[async_trait::async_trait]
impl TaskStore for DrainAfterClaim {
    fn backend(&self) -> Backend {
        self.inner.backend()
    }
    fn paths(&self) -> &TeamPaths {
        self.inner.paths()
    }
    fn lock_policy(&self) -> LockPolicy {
        self.inner.lock_policy()
    }
    async fn try_lock(&self, id: TaskId) -> ShepherdResult<Option<TaskLock>> {
        self.inner.try_lock(id).await
    }
    async fn write_task(&self, lock: &TaskLock, task: &Task) -> ShepherdResult<()> {
        self.inner.write_task(lock, task).await
    }
    async fn find_next_task(&self, worker: &str) -> ShepherdResult<Option<Task>> {
        let claimed = self.inner.find_next_task(worker).await?;
        if claimed.is_some() {
            self.signals
                .request_drain(worker, &Signal::new("late drain"))
                .await?;
        }
        Ok(claimed)
    }
}

#[tokio::test]
async fn test_drain_after_claim_releases_without_running() {
    let mut fx = fixture(Backend::Legacy, 1).await;
    fx.store.tasks = Arc::new(DrainAfterClaim {
        inner: fx.store.tasks.clone(),
        signals: fx.store.signals.clone(),
    });
    let marker = fx.work.path().join("ran");
    let mut d = daemon(&fx, "touch ran", PermissionConfig::default());

    assert_eq!(d.tick().await, TickOutcome::Shutdown);
    assert!(!marker.exists());
    let t = task(&fx, 1).await;
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.owner, None);
    assert!(fx.store.retry.sidecar().read(TaskId(1)).await.unwrap().is_none());
    assert!(fx.store.signals.drain_signal(WORKER).await.unwrap().is_none());
}

#[tokio::test]
async fn test_error_after_claim_hands_the_task_back() {
    for backend in [Backend::Legacy, Backend::Structured] {
        let fx = fixture(backend, 1).await;
        // An overlay path that cannot be read as a file fails the prompt step.
        let overlay = fx.store.paths.overlay_file(WORKER);
        std::fs::create_dir_all(&overlay).unwrap();
        let mut d = daemon(&fx, "cat >/dev/null; echo fine", PermissionConfig::default());

        assert_eq!(d.tick().await, TickOutcome::Error);
        let t = task(&fx, 1).await;
        assert_eq!(t.status, TaskStatus::Pending, "{backend:?}");
        assert_eq!(t.owner, None);
        let record = fx.store.retry.sidecar().read(TaskId(1)).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.starts_with("bridge error:"));

        // Once the fault clears the same worker picks the task up again.
        std::fs::remove_dir_all(&overlay).unwrap();
        assert_eq!(d.tick().await, TickOutcome::Ran(TaskId(1)));
        assert_eq!(task(&fx, 1).await.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn test_shutdown_during_run_releases_claim() {
    let fx = fixture(Backend::Legacy, 1).await;
    let mut d = daemon(&fx, "sleep 30", PermissionConfig::default());
    let handle = tokio::spawn(async move { d.tick().await });

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(task(&fx, 1).await.status, TaskStatus::InProgress);
    fx.store
        .signals
        .request_shutdown(WORKER, &Signal::new("stop"))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, TickOutcome::Shutdown);
    let t = task(&fx, 1).await;
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.owner, None);
    assert!(fx.store.retry.sidecar().read(TaskId(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_repeated_errors_quarantine_worker() {
    let fx = fixture(Backend::Legacy, 1).await;
    // An inbox log that cannot be read makes every tick fail.
    let inbox = fx.store.paths.mailbox_log(WORKER, MailboxDirection::Inbox);
    std::fs::create_dir_all(&inbox).unwrap();

    let mut d = daemon(&fx, "echo ok", PermissionConfig::default());
    assert_eq!(d.tick().await, TickOutcome::Error);
    assert_eq!(d.tick().await, TickOutcome::Error);
    assert_eq!(d.consecutive_errors(), 2);
    assert_eq!(d.tick().await, TickOutcome::Quarantined);
    assert_eq!(d.tick().await, TickOutcome::Quarantined);

    let hb = fx.store.heartbeats.read(WORKER).await.unwrap().unwrap();
    assert_eq!(hb.status, WorkerStatus::Quarantined);
    assert_eq!(task(&fx, 1).await.status, TaskStatus::Pending);
    let kinds = outbox_kinds(&fx).await;
    assert_eq!(kinds.iter().filter(|k| **k == OutboxKind::Error).count(), 1);

    fx.store
        .signals
        .request_shutdown(WORKER, &Signal::new("stop"))
        .await
        .unwrap();
    assert_eq!(d.tick().await, TickOutcome::Shutdown);
}

#[tokio::test]
async fn test_write_policy_violation_fails_permanently() {
    let fx = fixture(Backend::Legacy, 1).await;
    std::fs::create_dir_all(fx.work.path().join("src")).unwrap();
    let permissions = PermissionConfig {
        mode: PermissionMode::Enforce,
        allow: vec!["src/**".into()],
        ..PermissionConfig::default()
    };
    let mut d = daemon(&fx, "echo x > src/ok.rs; echo y > outside.txt; echo wrote", permissions);

    assert_eq!(d.tick().await, TickOutcome::Ran(TaskId(1)));
    let t = task(&fx, 1).await;
    assert_eq!(t.status, TaskStatus::Failed);
    let summary = t.summary.unwrap();
    assert!(summary.starts_with("permanent failure"), "{summary}");
    assert!(summary.contains("outside.txt"));
    assert!(!summary.contains("src/ok.rs"));
    assert!(fx.work.path().join("outside.txt").exists());
}
