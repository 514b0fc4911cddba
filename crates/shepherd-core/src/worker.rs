use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a bridge daemon is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Waiting for a claimable task.
    Polling,
    /// Running the agent for `current_task_id`.
    Executing,
    /// Started, nothing polled yet.
    Ready,
    /// Stopped claiming after repeated errors.
    Quarantined,
    /// Exited on request.
    Shutdown,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Polling => write!(f, "polling"),
            WorkerStatus::Executing => write!(f, "executing"),
            WorkerStatus::Ready => write!(f, "ready"),
            WorkerStatus::Quarantined => write!(f, "quarantined"),
            WorkerStatus::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Liveness record a worker rewrites on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Worker this heartbeat belongs to.
    pub worker_name: String,
    /// Team the worker is in.
    pub team_name: String,
    /// Provider the worker runs.
    pub provider: String,
    /// Process id of the daemon.
    pub pid: u32,
    /// Last time the worker polled.
    pub last_poll_at: DateTime<Utc>,
    /// Task being executed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
    /// Failed ticks in a row.
    #[serde(default)]
    pub consecutive_errors: u32,
    /// What the worker is doing.
    pub status: WorkerStatus,
}

impl Heartbeat {
    /// A polling heartbeat for this process, stamped now.
    pub fn new(
        worker_name: impl Into<String>,
        team_name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            team_name: team_name.into(),
            provider: provider.into(),
            pid: std::process::id(),
            last_poll_at: Utc::now(),
            current_task_id: None,
            consecutive_errors: 0,
            status: WorkerStatus::Polling,
        }
    }

    /// Time elapsed since the last poll. Clock skew into the future counts as zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_poll_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the last poll is older than `threshold`.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > threshold
    }
}
