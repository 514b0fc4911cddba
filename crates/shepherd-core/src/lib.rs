//! Core types and error definitions for shepherd.
//!
//! This crate provides the foundational types shared across all shepherd crates:
//! the error enum, the persisted record shapes (tasks, heartbeats, mailbox
//! messages, signals), configuration, and the on-disk layout of a team.
//!
//! # Main types
//!
//! - [`ShepherdError`]: Unified error enum for all shepherd subsystems.
//! - [`ShepherdResult`]: Convenience alias for `Result<T, ShepherdError>`.
//! - [`Task`]: A unit of work with a status lifecycle, owner and dependencies.
//! - [`Heartbeat`]: A periodically refreshed worker liveness record.
//! - [`OutboxMessage`] / [`InboxMessage`]: Mailbox entries.
//! - [`TeamPaths`]: Filesystem layout of a team under the data root.
//! - [`ShepherdConfig`] / [`TeamSpec`]: Runtime configuration and team definitions.

/// Runtime configuration and team specifications.
pub mod config;
/// Atomic file helpers (write-temp-then-rename).
pub mod fsio;
/// Mailbox messages and control signals.
pub mod message;
/// On-disk layout of a team.
pub mod paths;
/// Task records, failure sidecars and done signals.
pub mod task;
/// Worker heartbeats.
pub mod worker;

pub use config::{
    Backend, GateConfig, LaunchMode, PermissionConfig, PermissionMode, PolicyConfig, ProviderConfig,
    ShepherdConfig, TaskSpec, TeamSpec,
};
pub use message::{InboxMessage, OutboxKind, OutboxMessage, Signal};
pub use paths::{MailboxDirection, TeamPaths};
pub use task::{DoneSignal, DoneStatus, FailureRecord, Task, TaskId, TaskPatch, TaskStatus};
pub use worker::{Heartbeat, WorkerStatus};

// --- Error types ---

/// Top-level error type for shepherd.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum ShepherdError {
    /// A task record is missing, corrupt, or could not be mutated.
    #[error("Store error: {0}")]
    Store(String),

    /// A lock or claim could not be acquired or was lost.
    #[error("Lock error: {0}")]
    Lock(String),

    /// A mailbox log or message file could not be read or written.
    #[error("Mailbox error: {0}")]
    Mailbox(String),

    /// An error raised inside a bridge daemon.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// An error raised by the lead-side watchdog.
    #[error("Watchdog error: {0}")]
    Watchdog(String),

    /// An error from the runtime controller or its driver loop.
    #[error("Controller error: {0}")]
    Controller(String),

    /// An error from the terminal-multiplexer pane collaborator.
    #[error("Pane error: {0}")]
    Pane(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A write-permission or sanitization error.
    #[error("Security error: {0}")]
    Security(String),

    /// The readiness gate could not be evaluated.
    #[error("Gate error: {0}")]
    Gate(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ShepherdError`].
pub type ShepherdResult<T> = Result<T, ShepherdError>;
