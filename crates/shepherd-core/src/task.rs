use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Ordinal identifier of a task within a team. Tasks are seeded as 1, 2, 3, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Parse a task id from a record file stem such as `"12"`.
    pub fn from_stem(stem: &str) -> Option<Self> {
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok().map(TaskId)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by `owner`.
    InProgress,
    /// Done. Never changes again.
    Completed,
    /// Failed for good. Never changes again.
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks take no further work.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A task record as persisted in the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique within the team.
    pub id: TaskId,
    /// One-line title.
    pub subject: String,
    /// Full instructions.
    pub description: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Worker name currently owning the task, `null` when unowned.
    #[serde(default)]
    pub owner: Option<String>,
    /// When the current claim was taken. Distinguishes attempts by the same worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    /// Set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set on permanent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Agent output of the completing run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Completion summary, or the reason for a permanent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Tasks that must be completed before this one is ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<TaskId>,
}

impl Task {
    /// A pending, unowned task with no dependencies.
    pub fn new(id: TaskId, subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            subject: subject.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            owner: None,
            assigned_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            summary: None,
            blocked_by: Vec::new(),
        }
    }

    /// Replace the dependency list.
    pub fn with_blocked_by(mut self, deps: Vec<TaskId>) -> Self {
        self.blocked_by = deps;
        self
    }

    /// A task is ready when every dependency has completed.
    pub fn is_ready(&self, completed: &HashSet<TaskId>) -> bool {
        self.blocked_by.iter().all(|dep| completed.contains(dep))
    }

    /// Whether `worker` may claim this task: pending and unowned (or already reserved for it).
    pub fn is_claimable_by(&self, worker: &str) -> bool {
        self.status == TaskStatus::Pending
            && self.owner.as_deref().map_or(true, |owner| owner == worker)
    }

    /// Mark the task as claimed by `worker`.
    pub fn claim(&mut self, worker: &str) {
        self.status = TaskStatus::InProgress;
        self.owner = Some(worker.to_string());
        self.assigned_at = Some(Utc::now());
    }

    /// Return the task to the pending pool with no owner.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.owner = None;
        self.assigned_at = None;
    }

    /// Mark completed. A summary, if given, becomes both `result` and `summary`.
    pub fn complete(&mut self, summary: Option<String>) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        if summary.is_some() {
            self.result = summary.clone();
            self.summary = summary;
        }
    }

    /// Mark failed for good, keeping `reason` as the summary.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.summary = Some(reason.into());
    }

    /// Merge every non-null field of `patch` into this record.
    pub fn apply(&mut self, patch: TaskPatch) {
        if let Some(subject) = patch.subject {
            self.subject = subject;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(owner) = patch.owner {
            self.owner = Some(owner);
        }
        if let Some(at) = patch.assigned_at {
            self.assigned_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(at) = patch.failed_at {
            self.failed_at = Some(at);
        }
        if let Some(result) = patch.result {
            self.result = Some(result);
        }
        if let Some(summary) = patch.summary {
            self.summary = Some(summary);
        }
        if let Some(deps) = patch.blocked_by {
            self.blocked_by = deps;
        }
    }
}

/// Partial update for [`Task`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    /// New subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// New description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// New owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// New claim time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    /// New completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// New failure time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// New result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// New summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// New dependency list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Vec<TaskId>>,
}

impl TaskPatch {
    /// A patch that only changes the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Also set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Per-task failure record kept beside the task, independent of its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    /// Task the record belongs to.
    pub task_id: TaskId,
    /// Error text of the latest failure.
    pub last_error: String,
    /// Number of recorded failures. Never decreases.
    pub retry_count: u32,
    /// When the latest failure was recorded.
    pub last_failed_at: DateTime<Utc>,
}

impl FailureRecord {
    /// Record for the first failure of `task_id`.
    pub fn first(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            last_error: error.into(),
            retry_count: 1,
            last_failed_at: Utc::now(),
        }
    }

    /// Record one more failure.
    pub fn bump(&mut self, error: impl Into<String>) {
        self.last_error = error.into();
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_failed_at = Utc::now();
    }

    /// Pure exhaustion predicate: once `retry_count >= max` the task must stay failed.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

/// Outcome reported through a done signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    /// The task is done.
    Completed,
    /// The attempt failed; the task may be retried.
    Failed,
}

/// Completion marker written by a pane-hosted worker that does not touch the store itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneSignal {
    /// Task the worker was running.
    pub task_id: TaskId,
    /// How it ended.
    pub status: DoneStatus,
    /// Summary on success, reason on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// When the signal was written.
    pub timestamp: DateTime<Utc>,
}

impl DoneSignal {
    /// Success with `summary`.
    pub fn completed(task_id: TaskId, summary: impl Into<String>) -> Self {
        Self {
            task_id,
            status: DoneStatus::Completed,
            summary: Some(summary.into()),
            timestamp: Utc::now(),
        }
    }

    /// Failure with `reason`.
    pub fn failed(task_id: TaskId, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            status: DoneStatus::Failed,
            summary: Some(reason.into()),
            timestamp: Utc::now(),
        }
    }
}
