#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use common::{fake_config, FakePanes, FakeSpawner};
use shepherd_core::{LaunchMode, ShepherdResult, Task, TaskId, TaskStatus, TeamSpec};
use shepherd_orchestrator::{
    prepare_team, run_team, GateReport, NoopGate, ReadinessGate, RunStatus, TeamController,
};
use shepherd_store::TeamShutdown;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const TEAM: &str = r#"
name = "alpha"
workers = 2
provider = "fake"

[[tasks]]
subject = "Write parser"

[[tasks]]
subject = "Write lexer"

[[tasks]]
subject = "Write tests"
blocked_by = [1, 2]
"#;

#[derive(Default)]
struct CountingGate {
    calls: AtomicU32,
    fail: bool,
}

#[async_trait]
impl ReadinessGate for CountingGate {
    async fn check(&self) -> ShepherdResult<GateReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Ok(GateReport {
                passed: false,
                metrics: None,
                violations: vec!["pass rate 0.50 below 0.80".into()],
            })
        } else {
            Ok(GateReport::pass())
        }
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    controller: TeamController,
    spec: TeamSpec,
    panes: Arc<FakePanes>,
    spawner: Arc<FakeSpawner>,
}

async fn harness(configure: impl FnOnce(&mut FakeSpawner)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let spec = TeamSpec::from_toml_str(TEAM).unwrap();
    let config = fake_config(dir.path(), LaunchMode::Interactive);
    let store = prepare_team(&config, &spec).await.unwrap();
    let panes = Arc::new(FakePanes::new());
    let mut spawner = FakeSpawner::new(store.clone(), panes.clone());
    configure(&mut spawner);
    let spawner = Arc::new(spawner);
    let controller = TeamController::new(store, panes.clone(), spawner.clone(), config);
    Harness {
        _dir: dir,
        controller,
        spec,
        panes,
        spawner,
    }
}

#[tokio::test]
async fn test_all_tasks_complete_and_gate_passes() {
    let h = harness(|s| s.finish_after = Some(Duration::from_millis(30))).await;
    let gate = CountingGate::default();
    let (_cancel_tx, cancel) = watch::channel(false);

    let result = tokio::time::timeout(
        Duration::from_secs(20),
        run_team(&h.controller, &h.spec, &gate, cancel),
    )
    .await
    .unwrap();

    assert_eq!(result.status, RunStatus::Success, "{:?}", result.reason);
    assert!(result.is_success());
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.tasks.len(), 3);
    assert!(result
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed && t.retry_count == 0));
    assert_eq!(result.tasks[2].summary.as_deref(), Some("finished 3"));
    assert!(result.duration_secs >= 0.0);
    // Shut down afterwards.
    assert!(h.controller.active_workers().await.is_empty());
    assert!(h.controller.store().registry.session().await.unwrap().is_none());

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["tasks"][0]["status"], "completed");
}

#[tokio::test]
async fn test_gate_failure_fails_the_run() {
    let h = harness(|s| s.finish_after = Some(Duration::from_millis(10))).await;
    let gate = CountingGate {
        fail: true,
        ..CountingGate::default()
    };
    let (_cancel_tx, cancel) = watch::channel(false);

    let result = tokio::time::timeout(
        Duration::from_secs(20),
        run_team(&h.controller, &h.spec, &gate, cancel),
    )
    .await
    .unwrap();

    assert_eq!(result.status, RunStatus::Failure);
    assert!(result.reason.unwrap().contains("pass rate"));
    assert!(!result.gate.unwrap().passed);
}

#[tokio::test]
async fn test_all_panes_dead_with_work_left_fails() {
    // Workers never finish and no replacement can be spawned.
    let h = harness(|s| s.max_spawns = 2).await;
    let controller = &h.controller;
    let panes = h.panes.clone();
    let (_cancel_tx, cancel) = watch::channel(false);

    let killer = async {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let workers = controller.active_workers().await;
            if workers.len() == 2 {
                for worker in workers {
                    panes.crash(&worker.pane_id);
                }
                return;
            }
        }
    };
    let (result, ()) = tokio::time::timeout(Duration::from_secs(20), async {
        tokio::join!(run_team(controller, &h.spec, &NoopGate, cancel), killer)
    })
    .await
    .unwrap();

    assert_eq!(result.status, RunStatus::Failure);
    assert!(result.reason.as_deref().unwrap().contains("outstanding"), "{:?}", result.reason);
    assert_eq!(h.spawner.spawn_count(), 2);
    // The crashed attempts were recorded before the run gave up.
    assert!(result.tasks.iter().filter(|t| t.retry_count == 1).count() >= 1);
}

#[tokio::test]
async fn test_failed_dependency_ends_the_run_once_nothing_else_runs() {
    let h = harness(|s| s.finish_after = Some(Duration::from_millis(30))).await;
    let mut parser = Task::new(TaskId(1), "Write parser", "");
    parser.fail("permanent failure: wrote outside allowed paths");
    h.controller.store().tasks.create_task(&parser).await.unwrap();
    let (_cancel_tx, cancel) = watch::channel(false);

    let result = tokio::time::timeout(
        Duration::from_secs(20),
        run_team(&h.controller, &h.spec, &NoopGate, cancel),
    )
    .await
    .unwrap();

    assert_eq!(result.status, RunStatus::Failure);
    assert_eq!(
        result.reason.as_deref(),
        Some("1 task(s) failed and no work remains in flight")
    );
    // The independent task still ran to completion first.
    assert_eq!(result.tasks[1].status, TaskStatus::Completed);
    assert_eq!(result.tasks[2].status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_cancel_shuts_the_team_down() {
    let h = harness(|_| {}).await;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(true).unwrap();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(20), async {
        tokio::join!(run_team(&h.controller, &h.spec, &NoopGate, cancel_rx), cancel)
    })
    .await
    .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.tasks.len(), 3);
    assert!(h.controller.active_workers().await.is_empty());
    assert!(h.controller.store().signals.team_shutdown().await.unwrap().is_some());
}

#[tokio::test]
async fn test_start_failure_is_reported() {
    let mut h = harness(|_| {}).await;
    h.spec.provider = "surely-not-installed-cli".into();
    let (_cancel_tx, cancel) = watch::channel(false);

    let result = run_team(&h.controller, &h.spec, &NoopGate, cancel).await;

    assert_eq!(result.status, RunStatus::Failure);
    assert!(result.reason.unwrap().starts_with("start failed"));
}

#[tokio::test]
async fn test_shutdown_record_from_another_process_stops_the_run() {
    let h = harness(|_| {}).await;
    let store = h.controller.store().clone();
    let (_cancel_tx, cancel) = watch::channel(false);
    let request = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        store
            .signals
            .record_team_shutdown(&TeamShutdown {
                reason: "operator asked".into(),
                drain: true,
                requested_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(20), async {
        tokio::join!(run_team(&h.controller, &h.spec, &NoopGate, cancel), request)
    })
    .await
    .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.reason.as_deref(), Some("shutdown requested: operator asked"));
    assert!(h.controller.active_workers().await.is_empty());
    assert!(store.signals.team_shutdown().await.unwrap().unwrap().drain);
}
