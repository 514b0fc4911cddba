//! The per-worker bridge daemon.
//!
//! A bridge daemon runs inside a worker pane. Each tick it checks for
//! shutdown and drain signals, refreshes its heartbeat, claims the next
//! eligible task, renders a prompt for it and runs the provider CLI with that
//! prompt on stdin. Results go back into the task store and the worker's
//! outbox; failures go through the shared retry policy.
//!
//! # Main types
//!
//! - [`BridgeDaemon`]: The poll loop.
//! - [`AgentRunner`]: Runs one agent invocation with a timeout and cancellation.
//! - [`PromptRenderer`]: Builds a bounded, sanitized prompt.

/// The bridge daemon poll loop.
pub mod daemon;
/// Prompt composition.
pub mod prompt;
/// Agent subprocess execution.
pub mod runner;

pub use daemon::{BridgeDaemon, BridgeOptions, TickOutcome};
pub use prompt::{Completion, PromptContext, PromptRenderer};
pub use runner::{AgentCommand, AgentExit, AgentOutcome, AgentRunner};
