//! Filesystem persistence for shepherd teams.
//!
//! Everything the lead and its workers share lives under one team directory:
//! task records guarded by per-task locks, failure sidecars, mailboxes,
//! heartbeats, control signals and the member registry. Two task store
//! backends exist; a team picks one at creation and every process discovers
//! it with [`detect_backend`].

/// Per-task failure sidecars.
pub mod failure;
/// Worker heartbeat files.
pub mod heartbeat;
/// Task store backed by lock files.
pub mod legacy;
/// Create-exclusive lock files with stale-holder recovery.
pub mod lock;
/// Inbox/outbox channels.
pub mod mailbox;
/// Team membership, team record and session state.
pub mod registry;
/// Shared requeue-or-fail decision.
pub mod retry;
/// Shutdown, drain, ack and done signals.
pub mod signals;
/// Task store backed by claim tokens.
pub mod structured;
/// The task store trait and the shared claim/update protocol.
pub mod task_store;

pub use failure::FailureSidecar;
pub use heartbeat::HeartbeatStore;
pub use legacy::LegacyTaskStore;
pub use lock::{is_process_alive, LockPolicy};
pub use mailbox::{LegacyMailbox, Mailbox, StructuredMailbox};
pub use registry::{Member, SessionState, TeamRecord, TeamRegistry};
pub use retry::{Decision, FailureClass, Observation, RetryPolicy};
pub use signals::{ShutdownAck, SignalBoard, TeamShutdown};
pub use structured::{ClaimToken, StructuredTaskStore};
pub use task_store::{ClaimChange, TaskLock, TaskStore};

use shepherd_core::{Backend, PolicyConfig, ShepherdResult, TeamPaths};
use std::sync::Arc;
use tracing::info;

/// Which backend a team uses: the `.structured` marker file selects the
/// structured backend, its absence the legacy one.
pub fn detect_backend(paths: &TeamPaths) -> Backend {
    if paths.structured_marker().exists() {
        Backend::Structured
    } else {
        Backend::Legacy
    }
}

/// Create the team directory and mark its backend.
pub async fn init_team_dir(paths: &TeamPaths, backend: Backend) -> ShepherdResult<()> {
    tokio::fs::create_dir_all(paths.tasks_dir()).await?;
    tokio::fs::create_dir_all(paths.workers_dir()).await?;
    match backend {
        Backend::Structured => {
            tokio::fs::create_dir_all(paths.claims_dir()).await?;
            shepherd_core::fsio::write_atomic(&paths.structured_marker(), b"1\n").await?;
        }
        Backend::Legacy => {
            shepherd_core::fsio::remove_if_exists(&paths.structured_marker()).await?;
        }
    }
    info!(team = %paths.team(), backend = ?backend, "Team directory initialized");
    Ok(())
}

/// Handles onto a team's shared state, with the backend chosen by the marker file.
#[derive(Clone)]
pub struct TeamStore {
    /// Layout of the team directory.
    pub paths: TeamPaths,
    /// Detected from the marker file when the team was opened.
    pub backend: Backend,
    /// Task records and the claim protocol.
    pub tasks: Arc<dyn TaskStore>,
    /// Worker inboxes and outboxes.
    pub mailbox: Arc<dyn Mailbox>,
    /// Worker liveness records.
    pub heartbeats: HeartbeatStore,
    /// Shutdown, drain and done signals.
    pub signals: SignalBoard,
    /// Members, team record and session state.
    pub registry: TeamRegistry,
    /// Shared by everyone who may give up on a claim.
    pub retry: Arc<RetryPolicy>,
}

impl TeamStore {
    /// Open the team at `paths`. `holder` identifies this process in claim tokens.
    pub fn open(paths: TeamPaths, policy: &PolicyConfig, holder: &str) -> Self {
        let backend = detect_backend(&paths);
        let lock_policy = LockPolicy::from_config(policy);
        let (tasks, mailbox): (Arc<dyn TaskStore>, Arc<dyn Mailbox>) = match backend {
            Backend::Legacy => (
                Arc::new(LegacyTaskStore::new(paths.clone(), lock_policy)),
                Arc::new(LegacyMailbox::new(
                    paths.clone(),
                    lock_policy,
                    policy.mailbox_max_bytes,
                    policy.mailbox_max_lines,
                )),
            ),
            Backend::Structured => (
                Arc::new(StructuredTaskStore::new(paths.clone(), lock_policy, holder)),
                Arc::new(StructuredMailbox::new(paths.clone())),
            ),
        };
        Self {
            backend,
            heartbeats: HeartbeatStore::new(paths.clone()),
            signals: SignalBoard::new(paths.clone()),
            registry: TeamRegistry::new(paths.clone(), lock_policy),
            retry: Arc::new(RetryPolicy::new(tasks.clone(), policy.max_retries)),
            tasks,
            mailbox,
            paths,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backend_detection_follows_marker() {
        let dir = tempfile::tempdir().unwrap();
        let paths = TeamPaths::new(dir.path(), "t");
        assert_eq!(detect_backend(&paths), Backend::Legacy);

        init_team_dir(&paths, Backend::Structured).await.unwrap();
        assert_eq!(detect_backend(&paths), Backend::Structured);
        let store = TeamStore::open(paths.clone(), &PolicyConfig::default(), "lead");
        assert_eq!(store.tasks.backend(), Backend::Structured);

        init_team_dir(&paths, Backend::Legacy).await.unwrap();
        let store = TeamStore::open(paths, &PolicyConfig::default(), "lead");
        assert_eq!(store.tasks.backend(), Backend::Legacy);
    }
}
