use serde::{Deserialize, Serialize};
use shepherd_core::{Task, TaskId, TaskStatus, WorkerStatus};
use std::collections::HashSet;

/// Where a team stands, derived from its task counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Nothing has been picked up yet.
    Planning,
    /// Work is outstanding, even if some tasks already failed.
    Executing,
    /// Only failures are left: nothing in flight and nothing claimable.
    Fixing,
    /// Every task completed.
    Completed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Planning => write!(f, "planning"),
            Phase::Executing => write!(f, "executing"),
            Phase::Fixing => write!(f, "fixing"),
            Phase::Completed => write!(f, "completed"),
        }
    }
}

/// Task totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    /// Pending, ready or not.
    pub pending: usize,
    /// Claimed and running.
    pub in_progress: usize,
    /// Completed.
    pub completed: usize,
    /// Failed for good.
    pub failed: usize,
    /// Pending tasks whose dependencies have all completed.
    pub ready: usize,
}

impl TaskCounts {
    /// Count `tasks`, computing readiness against the completed ones.
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let completed: HashSet<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => {
                    counts.pending += 1;
                    if task.is_ready(&completed) {
                        counts.ready += 1;
                    }
                }
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// All tasks.
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }

    /// Pending or in progress.
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_progress
    }

    /// True when no worker holds a task and none can be claimed.
    pub fn is_stuck(&self) -> bool {
        self.in_progress == 0 && self.ready == 0 && self.pending > 0
    }

    /// `Fixing` only once failures are all that is left: nothing in flight
    /// and nothing a worker could claim.
    pub fn phase(&self) -> Phase {
        let idle = self.in_progress == 0 && self.ready == 0;
        if self.failed > 0 && idle {
            Phase::Fixing
        } else if self.outstanding() == 0 {
            Phase::Completed
        } else if self.in_progress == 0 && self.completed == 0 && self.failed == 0 {
            Phase::Planning
        } else {
            Phase::Executing
        }
    }
}

/// One worker as seen from the lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    /// Worker name.
    pub name: String,
    /// Provider key.
    pub provider: String,
    /// Pane the worker runs in.
    pub pane_id: String,
    /// Whether the pane still exists.
    pub pane_alive: bool,
    /// Last heartbeat status, if the worker ever wrote one.
    pub status: Option<WorkerStatus>,
    /// Heartbeat older than the stale threshold.
    pub heartbeat_stale: bool,
    /// Task named in the latest heartbeat.
    pub current_task_id: Option<TaskId>,
}

/// Read-only view of a team at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSnapshot {
    /// Team name.
    pub team: String,
    /// Phase derived from [`Self::counts`].
    pub phase: Phase,
    /// Task totals.
    pub counts: TaskCounts,
    /// Registered workers.
    pub workers: Vec<WorkerSnapshot>,
    /// Set once the watchdog has given up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_failure: Option<String>,
}

impl TeamSnapshot {
    /// Workers whose pane is alive.
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.pane_alive).count()
    }

    /// Single progress line for the diagnostic stream.
    pub fn progress_line(&self) -> String {
        format!(
            "[{}] {}: {}/{} completed, {} in progress, {} pending, {} failed, {}/{} workers live",
            self.team,
            self.phase,
            self.counts.completed,
            self.counts.total(),
            self.counts.in_progress,
            self.counts.pending,
            self.counts.failed,
            self.live_workers(),
            self.workers.len(),
        )
    }
}
