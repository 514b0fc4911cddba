//! Lead-side runtime for a shepherd team.
//!
//! The lead seeds tasks, lays out terminal panes, spawns one worker per pane
//! and then supervises them. A watchdog recovers crashed or stalled workers
//! through the shared retry policy, and the driver turns the team's
//! aggregate state into one terminal result.
//!
//! # Main types
//!
//! - [`TeamController`]: Start, monitor and shut down one team session.
//! - [`Watchdog`]: Per-tick liveness sweep over the active workers.
//! - [`PaneManager`]: Terminal pane collaborator, implemented by [`TmuxPaneManager`].
//! - [`WorkerSpawner`]: Starts bridge or interactive workers in panes.
//! - [`ReadinessGate`]: Final check before a run counts as a success.

/// Team start, monitor and shutdown.
pub mod controller;
/// Driver loop and run result.
pub mod driver;
/// Readiness gates.
pub mod gate;
/// Phase classification and team snapshots.
pub mod monitor;
/// Pane collaborator trait and keystroke delivery.
pub mod pane;
/// Provider CLI discovery.
pub mod providers;
/// Worker launch in panes.
pub mod spawner;
/// tmux-backed pane manager.
pub mod tmux;
/// Dead and stalled worker recovery.
pub mod watchdog;

pub use controller::{observe_team, prepare_team, session_name, ShutdownReport, TeamController};
pub use driver::{run_team, RunStatus, TaskResult, TeamRunResult};
pub use gate::{GateReport, NoopGate, QualityLogGate, QualityMetrics, ReadinessGate};
pub use monitor::{Phase, TaskCounts, TeamSnapshot, WorkerSnapshot};
pub use pane::{deliver_keys, PaneManager};
pub use providers::{check_providers, find_program};
pub use spawner::{PaneSpawner, Spawned, WorkerSpawner};
pub use tmux::{shell_join, shell_quote, TmuxPaneManager};
pub use watchdog::{ActiveWorker, ActiveWorkers, TickReport, Watchdog, WorkerEvent};
