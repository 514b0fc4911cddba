//! The lead's top-level loop: start a team, supervise it, always shut it down,
//! and produce one terminal result.

use crate::controller::TeamController;
use crate::gate::{GateReport, ReadinessGate};
use crate::monitor::{Phase, TeamSnapshot};
use serde::{Deserialize, Serialize};
use shepherd_core::{ShepherdResult, TaskId, TaskStatus, TeamSpec};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How a team run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every task completed and the gate passed.
    Success,
    /// The run ended with work undone or the gate failed.
    Failure,
    /// Interrupted, or stopped by `shepherd shutdown`.
    Cancelled,
}

/// Final state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Task id.
    pub id: TaskId,
    /// Task subject.
    pub subject: String,
    /// Status at the end of the run.
    pub status: TaskStatus,
    /// Last owner, if the task was ever claimed and not released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Completion summary, or the failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Failed attempts recorded for the task.
    pub retry_count: u32,
}

/// The single result `shepherd run` prints on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRunResult {
    /// Team name.
    pub team: String,
    /// Overall outcome.
    pub status: RunStatus,
    /// Why the run did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Every task, by id.
    pub tasks: Vec<TaskResult>,
    /// Readiness gate report, when the gate ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateReport>,
    /// Wall-clock duration of the run.
    pub duration_secs: f64,
}

impl TeamRunResult {
    /// Whether the run ended in [`RunStatus::Success`].
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

struct Verdict {
    status: RunStatus,
    reason: Option<String>,
    gate: Option<GateReport>,
    /// Let bridge workers finish their current task during shutdown.
    drain: bool,
}

impl Verdict {
    fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failure,
            reason: Some(reason.into()),
            gate: None,
            drain: false,
        }
    }

    fn cancelled(reason: impl Into<String>, drain: bool) -> Self {
        Self {
            status: RunStatus::Cancelled,
            reason: Some(reason.into()),
            gate: None,
            drain,
        }
    }
}

/// Start `spec`, supervise it until it finishes or fails, then shut it down.
///
/// Flipping `cancel` to true stops supervision early; the team is still shut down.
pub async fn run_team(
    controller: &TeamController,
    spec: &TeamSpec,
    gate: &dyn ReadinessGate,
    mut cancel: watch::Receiver<bool>,
) -> TeamRunResult {
    let started = Instant::now();
    info!(team = %spec.name, workers = spec.workers, tasks = spec.tasks.len(), "Team run starting");

    let verdict = match controller.start_team(spec).await {
        Ok(()) => supervise(controller, gate, &mut cancel).await,
        Err(e) => {
            error!(team = %spec.name, error = %e, "Team failed to start");
            Verdict::failure(format!("start failed: {e}"))
        }
    };

    let reason = verdict
        .reason
        .clone()
        .unwrap_or_else(|| "run finished".to_string());
    if let Err(e) = controller.shutdown_team(verdict.drain, &reason).await {
        warn!(team = %spec.name, error = %e, "Shutdown did not complete cleanly");
    }

    let tasks = match collect_results(controller).await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(team = %spec.name, error = %e, "Could not read final task states");
            Vec::new()
        }
    };
    let result = TeamRunResult {
        team: spec.name.clone(),
        status: verdict.status,
        reason: verdict.reason,
        tasks,
        gate: verdict.gate,
        duration_secs: started.elapsed().as_secs_f64(),
    };
    info!(
        team = %result.team,
        status = ?result.status,
        duration_secs = result.duration_secs,
        "Team run finished"
    );
    result
}

async fn supervise(
    controller: &TeamController,
    gate: &dyn ReadinessGate,
    cancel: &mut watch::Receiver<bool>,
) -> Verdict {
    let policy = &controller.config().policy;
    let mut interval = tokio::time::interval(policy.monitor_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The watchdog gets two of its own ticks to replace dead panes before the
    // driver gives up on them.
    let dead_grace = policy.watchdog_tick() * 2;
    let mut all_dead_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Verdict::cancelled("cancelled", false);
                }
                continue;
            }
        }

        // `shepherd shutdown` from another terminal.
        match controller.store().signals.team_shutdown().await {
            Ok(Some(record)) => {
                info!(reason = %record.reason, drain = record.drain, "Shutdown requested");
                return Verdict::cancelled(
                    format!("shutdown requested: {}", record.reason),
                    record.drain,
                );
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read the shutdown record"),
        }

        let snapshot = match controller.monitor_team().await {
            Ok(snapshot) => snapshot,
            Err(e) => return Verdict::failure(format!("monitor failed: {e}")),
        };
        if let Err(e) = controller.drain_outboxes().await {
            warn!(error = %e, "Could not read worker reports");
        }
        info!("{}", snapshot.progress_line());

        if let Some(reason) = &snapshot.watchdog_failure {
            return Verdict::failure(format!("watchdog failed: {reason}"));
        }
        match snapshot.phase {
            Phase::Completed => {
                return match gate.check().await {
                    Ok(report) if report.passed => Verdict {
                        status: RunStatus::Success,
                        reason: None,
                        gate: Some(report),
                        drain: false,
                    },
                    Ok(report) => Verdict {
                        status: RunStatus::Failure,
                        reason: Some(report.summary()),
                        gate: Some(report),
                        drain: false,
                    },
                    Err(e) => Verdict::failure(format!("readiness gate error: {e}")),
                };
            }
            Phase::Fixing => {
                return Verdict::failure(format!(
                    "{} task(s) failed and no work remains in flight",
                    snapshot.counts.failed
                ));
            }
            _ if snapshot.counts.is_stuck() => {
                return Verdict::failure(format!(
                    "{} pending task(s) can never become ready",
                    snapshot.counts.pending
                ));
            }
            _ => {}
        }
        if let Some(verdict) = stalled(&snapshot, &mut all_dead_since, dead_grace) {
            return verdict;
        }
    }
}

/// Failure when outstanding work can no longer make progress.
fn stalled(
    snapshot: &TeamSnapshot,
    all_dead_since: &mut Option<Instant>,
    grace: std::time::Duration,
) -> Option<Verdict> {
    let outstanding = snapshot.counts.outstanding();
    if outstanding == 0 {
        return None;
    }
    if snapshot.workers.is_empty() {
        return Some(Verdict::failure(format!(
            "no workers left with {outstanding} task(s) outstanding"
        )));
    }
    if snapshot.live_workers() > 0 {
        *all_dead_since = None;
        return None;
    }
    let since = *all_dead_since.get_or_insert_with(Instant::now);
    (since.elapsed() >= grace).then(|| {
        Verdict::failure(format!(
            "all worker panes are dead with {outstanding} task(s) outstanding"
        ))
    })
}

async fn collect_results(controller: &TeamController) -> ShepherdResult<Vec<TaskResult>> {
    let store = controller.store();
    let mut results = Vec::new();
    for task in store.tasks.list_tasks().await? {
        let retry_count = store
            .retry
            .sidecar()
            .read(task.id)
            .await?
            .map(|record| record.retry_count)
            .unwrap_or(0);
        results.push(TaskResult {
            id: task.id,
            subject: task.subject,
            status: task.status,
            owner: task.owner,
            summary: task.summary.or(task.result),
            retry_count,
        });
    }
    Ok(results)
}
