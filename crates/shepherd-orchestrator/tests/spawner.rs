#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{fake_config, team, FakePanes};
use shepherd_core::{Backend, InboxMessage, LaunchMode, TaskId, TaskStatus};
use shepherd_orchestrator::{PaneSpawner, WorkerSpawner};

const WORKER: &str = "worker-1";

fn spawner(t: &common::Team, mode: LaunchMode) -> PaneSpawner {
    let config = fake_config(t.dir.path(), mode);
    PaneSpawner::new(
        t.panes.clone(),
        t.store.clone(),
        config,
        "/work/repo",
        "/usr/local/bin/shepherd",
    )
}

#[tokio::test]
async fn test_bridge_worker_runs_the_bridge_command() {
    let t = team(Backend::Legacy, 1, FakePanes::new()).await;
    let spawner = spawner(&t, LaunchMode::Bridge).with_config_path("/etc/shepherd.toml");

    let spawned = spawner.spawn(WORKER, "fake", &t.leader).await.unwrap().unwrap();

    assert!(spawned.task.is_none());
    let command = t.panes.state(&spawned.pane_id).command.unwrap();
    assert!(command.starts_with("/usr/local/bin/shepherd --data-root "), "{command}");
    assert!(command.contains("--config /etc/shepherd.toml"));
    assert!(command.ends_with(
        "bridge --team alpha --worker worker-1 --provider fake --cwd /work/repo"
    ));
    // Bridge workers claim for themselves.
    assert_eq!(t.task(1).await.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_interactive_worker_gets_prompt_file() {
    let t = team(Backend::Legacy, 1, FakePanes::new()).await;
    t.store
        .mailbox
        .send_inbox(WORKER, &InboxMessage::new("prefer small commits"))
        .await
        .unwrap();
    let spawner = spawner(&t, LaunchMode::Interactive);

    let spawned = spawner.spawn(WORKER, "fake", &t.leader).await.unwrap().unwrap();

    assert_eq!(spawned.task, Some(TaskId(1)));
    let pane = t.panes.state(&spawned.pane_id);
    assert_eq!(pane.command.as_deref(), Some("sh"));
    let prompt_path = t.store.paths.prompt_file(WORKER);
    assert_eq!(
        pane.keys,
        vec![format!("Read {} and follow the instructions in it.", prompt_path.display())]
    );

    let prompt = tokio::fs::read_to_string(&prompt_path).await.unwrap();
    assert!(prompt.contains("<task_subject>task 1</task_subject>"));
    assert!(prompt.contains("prefer small commits"));
    assert!(prompt.contains("done --team alpha --worker worker-1 --task 1"));

    let task = t.task(1).await;
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.owner.as_deref(), Some(WORKER));
}

#[tokio::test]
async fn test_interactive_with_nothing_ready_spawns_nothing() {
    let t = team(Backend::Legacy, 0, FakePanes::new()).await;
    let spawner = spawner(&t, LaunchMode::Interactive);
    assert!(spawner.spawn(WORKER, "fake", &t.leader).await.unwrap().is_none());
    assert_eq!(t.panes.panes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_handshake_kills_pane_and_releases_task() {
    let t = team(Backend::Structured, 1, FakePanes::sticky()).await;
    let spawner = spawner(&t, LaunchMode::Interactive);

    let err = spawner.spawn(WORKER, "fake", &t.leader).await.unwrap_err();

    assert!(err.to_string().contains("did not accept its prompt"));
    assert_eq!(t.panes.killed().len(), 1);
    let task = t.task(1).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.owner.is_none());
    assert_eq!(t.retry_count(1).await, None);
}

#[tokio::test]
async fn test_pane_errors_release_the_claim() {
    let t = team(Backend::Legacy, 1, FakePanes::new()).await;
    let spawner = spawner(&t, LaunchMode::Interactive);

    assert!(spawner.spawn(WORKER, "fake", "%404").await.is_err());
    assert_eq!(t.task(1).await.status, TaskStatus::Pending);
}
