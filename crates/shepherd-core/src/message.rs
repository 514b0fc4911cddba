//! Mailbox entries and control signals exchanged between the lead and workers.

use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of report a worker writes to its outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    /// Worker started.
    Ready,
    /// Nothing to claim.
    Idle,
    /// A task finished.
    TaskComplete,
    /// A task attempt failed.
    TaskFailed,
    /// Problem outside any task, e.g. quarantine.
    Error,
    /// A shutdown or drain request was honoured.
    ShutdownAck,
}

/// A worker → lead report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    /// Serialized as `type`.
    #[serde(rename = "type")]
    pub kind: OutboxKind,
    /// Task the report is about, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Free text for ready, idle and acknowledgement reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Agent output for a completed task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// What went wrong, for failure and error reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the report was written.
    pub timestamp: DateTime<Utc>,
}

impl OutboxMessage {
    fn new(kind: OutboxKind) -> Self {
        Self {
            kind,
            task_id: None,
            message: None,
            summary: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// The worker came up and is polling.
    pub fn ready(message: impl Into<String>) -> Self {
        let mut msg = Self::new(OutboxKind::Ready);
        msg.message = Some(message.into());
        msg
    }

    /// Nothing is claimable right now.
    pub fn idle(message: impl Into<String>) -> Self {
        let mut msg = Self::new(OutboxKind::Idle);
        msg.message = Some(message.into());
        msg
    }

    /// `task_id` finished with `summary`.
    pub fn task_complete(task_id: TaskId, summary: impl Into<String>) -> Self {
        let mut msg = Self::new(OutboxKind::TaskComplete);
        msg.task_id = Some(task_id);
        msg.summary = Some(summary.into());
        msg
    }

    /// `task_id` failed with `error`.
    pub fn task_failed(task_id: TaskId, error: impl Into<String>) -> Self {
        let mut msg = Self::new(OutboxKind::TaskFailed);
        msg.task_id = Some(task_id);
        msg.error = Some(error.into());
        msg
    }

    /// A problem not tied to one task.
    pub fn error(error: impl Into<String>) -> Self {
        let mut msg = Self::new(OutboxKind::Error);
        msg.error = Some(error.into());
        msg
    }

    /// The worker acted on shutdown request `request_id`.
    pub fn shutdown_ack(request_id: impl Into<String>) -> Self {
        let mut msg = Self::new(OutboxKind::ShutdownAck);
        msg.message = Some(request_id.into());
        msg
    }
}

/// A lead → worker note. Free text, folded into the worker's next prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    /// Message text.
    pub content: String,
    /// When it was queued.
    pub timestamp: DateTime<Utc>,
}

impl InboxMessage {
    /// A message stamped now.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Shutdown or drain request. Writing the same signal twice is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    /// Echoed back in the acknowledgement.
    pub request_id: String,
    /// Why the stop was requested.
    pub reason: String,
    /// When the request was written.
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// A signal with a fresh request id.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}
