#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{fake_config, FakePanes, FakeSpawner};
use shepherd_core::{Backend, LaunchMode, OutboxMessage, TaskStatus, TeamSpec};
use shepherd_orchestrator::{observe_team, prepare_team, Phase, TeamController};
use std::sync::Arc;
use std::time::Duration;

const TEAM: &str = r#"
name = "alpha"
workers = 2
provider = "fake"
backend = "structured"
overlay = "Keep commits small."

[[tasks]]
subject = "Write parser"
description = "Tokenize and parse"

[[tasks]]
subject = "Write tests"
blocked_by = [1]
"#;

async fn controller(
    data_root: &std::path::Path,
    mode: LaunchMode,
    claim: bool,
) -> (TeamController, TeamSpec, Arc<FakePanes>) {
    limited_controller(data_root, mode, claim, u32::MAX).await
}

/// Like [`controller`], but spawns after the first `max_spawns` fail.
async fn limited_controller(
    data_root: &std::path::Path,
    mode: LaunchMode,
    claim: bool,
    max_spawns: u32,
) -> (TeamController, TeamSpec, Arc<FakePanes>) {
    let spec = TeamSpec::from_toml_str(TEAM).unwrap();
    let config = fake_config(data_root, mode);
    let store = prepare_team(&config, &spec).await.unwrap();
    let panes = Arc::new(FakePanes::new());
    let mut spawner = FakeSpawner::new(store.clone(), panes.clone());
    spawner.claim = claim;
    spawner.max_spawns = max_spawns;
    let controller = TeamController::new(store, panes.clone(), Arc::new(spawner), config);
    (controller, spec, panes)
}

#[tokio::test]
async fn test_start_seeds_registers_and_lays_out_panes() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, panes) = controller(dir.path(), LaunchMode::Bridge, false).await;

    controller.start_team(&spec).await.unwrap();

    let store = controller.store();
    assert_eq!(store.backend, Backend::Structured);
    let tasks = store.tasks.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending && t.owner.is_none()));

    let overlay = tokio::fs::read_to_string(store.paths.overlay_file("worker-2"))
        .await
        .unwrap();
    assert_eq!(overlay, "Keep commits small.");

    let members = store.registry.members().await.unwrap();
    assert_eq!(members.len(), 2);
    let session = store.registry.session().await.unwrap().unwrap();
    assert_eq!(session.worker_panes.len(), 2);
    assert!(panes.state(&session.leader_pane).alive);
    assert_eq!(store.registry.team().await.unwrap().unwrap().workers, 2);

    let snapshot = controller.monitor_team().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Planning);
    assert_eq!(snapshot.counts.ready, 1);
    assert_eq!(snapshot.live_workers(), 2);

    controller.shutdown_team(false, "test over").await.unwrap();
}

#[tokio::test]
async fn test_start_rejects_missing_provider() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, mut spec, _panes) = controller(dir.path(), LaunchMode::Bridge, false).await;
    spec.provider = "surely-not-installed-cli".into();

    let err = controller.start_team(&spec).await.unwrap_err();
    assert!(err.to_string().contains("not found on PATH"));
    assert!(controller.active_workers().await.is_empty());
}

#[tokio::test]
async fn test_start_keeps_workers_that_came_up() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, _panes) =
        limited_controller(dir.path(), LaunchMode::Bridge, false, 1).await;

    controller.start_team(&spec).await.unwrap();

    let active = controller.active_workers().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "worker-1");
    let session = controller.store().registry.session().await.unwrap().unwrap();
    assert_eq!(session.worker_panes.len(), 1);
    assert_eq!(controller.store().registry.members().await.unwrap().len(), 1);
    controller.shutdown_team(false, "test over").await.unwrap();
}

#[tokio::test]
async fn test_start_fails_when_no_worker_came_up() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, _panes) =
        limited_controller(dir.path(), LaunchMode::Bridge, false, 0).await;

    let err = controller.start_team(&spec).await.unwrap_err();
    assert!(err.to_string().contains("no room for another pane"));
    assert!(controller.active_workers().await.is_empty());
}

#[tokio::test]
async fn test_restart_does_not_reseed_existing_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, _panes) = controller(dir.path(), LaunchMode::Interactive, true).await;
    controller.start_team(&spec).await.unwrap();
    controller.shutdown_team(false, "first run").await.unwrap();
    assert_eq!(
        controller.store().tasks.read_task(shepherd_core::TaskId(1)).await.unwrap().unwrap().status,
        TaskStatus::InProgress
    );

    controller.start_team(&spec).await.unwrap();
    let first = controller
        .store()
        .tasks
        .read_task(shepherd_core::TaskId(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, TaskStatus::InProgress);
    controller.shutdown_team(false, "second run").await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_bridge_acks_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, panes) = controller(dir.path(), LaunchMode::Bridge, false).await;
    controller.start_team(&spec).await.unwrap();
    let store = controller.store().clone();
    let session = store.registry.session().await.unwrap().unwrap();

    // Only worker-1 behaves like a bridge daemon and acknowledges.
    let responder = {
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                if let Some(signal) = store.signals.shutdown_signal("worker-1").await.unwrap() {
                    store.signals.acknowledge("worker-1", &signal.request_id).await.unwrap();
                    store
                        .mailbox
                        .report("worker-1", &OutboxMessage::shutdown_ack(&signal.request_id))
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let report = controller.shutdown_team(false, "done for today").await.unwrap();
    responder.await.unwrap();

    assert_eq!(report.acked, vec!["worker-1".to_string()]);
    assert_eq!(report.unacked, vec!["worker-2".to_string()]);
    assert_eq!(report.killed_panes, 2);
    assert!(panes.killed().contains(&session.leader_pane));
    assert!(store.registry.session().await.unwrap().is_none());
    assert!(store.registry.members().await.unwrap().is_empty());
    assert!(controller.active_workers().await.is_empty());
    let record = store.signals.team_shutdown().await.unwrap().unwrap();
    assert_eq!(record.reason, "done for today");
    assert!(!record.drain);
    assert!(store.signals.shutdown_signal("worker-2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_drain_shutdown_sends_drain_signals() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, _panes) = controller(dir.path(), LaunchMode::Bridge, false).await;
    controller.start_team(&spec).await.unwrap();
    let store = controller.store().clone();

    let responder = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 2 {
                for worker in ["worker-1", "worker-2"] {
                    if seen.contains(&worker) {
                        continue;
                    }
                    assert!(store.signals.shutdown_signal(worker).await.unwrap().is_none());
                    if let Some(signal) = store.signals.drain_signal(worker).await.unwrap() {
                        store.signals.acknowledge(worker, &signal.request_id).await.unwrap();
                        seen.push(worker);
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let report = controller.shutdown_team(true, "drain").await.unwrap();
    responder.await.unwrap();
    assert_eq!(report.acked.len(), 2);
    assert!(report.unacked.is_empty());
    assert!(store.signals.team_shutdown().await.unwrap().unwrap().drain);
}

#[tokio::test]
async fn test_interactive_shutdown_does_not_wait_for_acks() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, _panes) = controller(dir.path(), LaunchMode::Interactive, true).await;
    controller.start_team(&spec).await.unwrap();
    // Only task 1 is ready, so only one interactive worker starts.
    assert_eq!(controller.active_workers().await.len(), 1);

    let started = std::time::Instant::now();
    let report = controller.shutdown_team(false, "stop").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(report.acked.is_empty() && report.unacked.is_empty());
    assert_eq!(report.killed_panes, 1);
}

#[tokio::test]
async fn test_outbox_reports_are_drained_once() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, _panes) = controller(dir.path(), LaunchMode::Interactive, true).await;
    controller.start_team(&spec).await.unwrap();
    let store = controller.store();
    store
        .mailbox
        .report("worker-1", &OutboxMessage::ready("worker-1 ready"))
        .await
        .unwrap();

    let drained = controller.drain_outboxes().await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].0, "worker-1");
    assert!(controller.drain_outboxes().await.unwrap().is_empty());
    controller.shutdown_team(false, "stop").await.unwrap();
}

#[tokio::test]
async fn test_observe_team_reads_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, panes) = controller(dir.path(), LaunchMode::Bridge, false).await;
    controller.start_team(&spec).await.unwrap();
    let store = controller.store().clone();
    let worker_1 = controller.active_workers().await[0].pane_id.clone();
    panes.crash(&worker_1);

    let snapshot = observe_team(&store, panes.as_ref(), &controller.config().policy)
        .await
        .unwrap();

    assert_eq!(snapshot.team, "alpha");
    assert_eq!(snapshot.counts.total(), 2);
    assert_eq!(snapshot.workers.len(), 2);
    assert_eq!(snapshot.live_workers(), 1);
    assert!(snapshot.watchdog_failure.is_none());
    controller.shutdown_team(false, "stop").await.unwrap();
}

#[tokio::test]
async fn test_start_clears_a_previous_shutdown_record() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, spec, _panes) = controller(dir.path(), LaunchMode::Bridge, false).await;
    controller.start_team(&spec).await.unwrap();
    controller.shutdown_team(false, "first").await.unwrap();
    assert!(controller.store().signals.team_shutdown().await.unwrap().is_some());

    controller.start_team(&spec).await.unwrap();
    assert!(controller.store().signals.team_shutdown().await.unwrap().is_none());
    controller.shutdown_team(false, "second").await.unwrap();
}
