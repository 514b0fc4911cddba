use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shepherd_core::fsio::{read_json, remove_if_exists, write_json_atomic};
use shepherd_core::{DoneSignal, ShepherdResult, Signal, TeamPaths};
use tracing::{debug, info};

/// Acknowledgement a worker writes after acting on a shutdown signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownAck {
    /// Id of the signal being acknowledged.
    pub request_id: String,
    /// Worker that acted on it.
    pub worker_name: String,
    /// When it acted.
    pub timestamp: DateTime<Utc>,
}

/// Team-wide shutdown record, written once by the lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamShutdown {
    /// Operator-supplied reason.
    pub reason: String,
    /// Let workers finish what they are running before stopping.
    pub drain: bool,
    /// When the shutdown was requested.
    pub requested_at: DateTime<Utc>,
}

/// File-based control signals between the lead and its workers.
///
/// Signals are overwrite-in-place files, so writing the same one twice is harmless.
#[derive(Debug, Clone)]
pub struct SignalBoard {
    paths: TeamPaths,
}

impl SignalBoard {
    /// Signal files for the team at `paths`.
    pub fn new(paths: TeamPaths) -> Self {
        Self { paths }
    }

    /// Ask `worker` to stop now, releasing any claim it holds.
    pub async fn request_shutdown(&self, worker: &str, signal: &Signal) -> ShepherdResult<()> {
        write_json_atomic(&self.paths.shutdown_signal(worker), signal).await?;
        info!(worker, request_id = %signal.request_id, "Shutdown requested");
        Ok(())
    }

    /// Ask `worker` to stop once its current task is resolved.
    pub async fn request_drain(&self, worker: &str, signal: &Signal) -> ShepherdResult<()> {
        write_json_atomic(&self.paths.drain_signal(worker), signal).await?;
        info!(worker, request_id = %signal.request_id, "Drain requested");
        Ok(())
    }

    /// Pending shutdown request for `worker`.
    pub async fn shutdown_signal(&self, worker: &str) -> ShepherdResult<Option<Signal>> {
        read_json(&self.paths.shutdown_signal(worker)).await
    }

    /// Pending drain request for `worker`.
    pub async fn drain_signal(&self, worker: &str) -> ShepherdResult<Option<Signal>> {
        read_json(&self.paths.drain_signal(worker)).await
    }

    /// Remove both shutdown and drain signals for `worker`.
    pub async fn clear(&self, worker: &str) -> ShepherdResult<()> {
        remove_if_exists(&self.paths.shutdown_signal(worker)).await?;
        remove_if_exists(&self.paths.drain_signal(worker)).await?;
        debug!(worker, "Signals cleared");
        Ok(())
    }

    /// Confirm that `worker` acted on request `request_id`.
    pub async fn acknowledge(&self, worker: &str, request_id: &str) -> ShepherdResult<()> {
        let ack = ShutdownAck {
            request_id: request_id.to_string(),
            worker_name: worker.to_string(),
            timestamp: Utc::now(),
        };
        write_json_atomic(&self.paths.shutdown_ack(worker), &ack).await
    }

    /// Latest acknowledgement from `worker`.
    pub async fn ack(&self, worker: &str) -> ShepherdResult<Option<ShutdownAck>> {
        read_json(&self.paths.shutdown_ack(worker)).await
    }

    /// Drop a stale acknowledgement before a new request.
    pub async fn clear_ack(&self, worker: &str) -> ShepherdResult<()> {
        remove_if_exists(&self.paths.shutdown_ack(worker)).await?;
        Ok(())
    }

    /// Report the end of an interactive worker's task.
    pub async fn write_done(&self, worker: &str, done: &DoneSignal) -> ShepherdResult<()> {
        write_json_atomic(&self.paths.done_signal(worker), done).await
    }

    /// Unprocessed done signal from `worker`.
    pub async fn done(&self, worker: &str) -> ShepherdResult<Option<DoneSignal>> {
        read_json(&self.paths.done_signal(worker)).await
    }

    /// Mark the done signal as processed.
    pub async fn clear_done(&self, worker: &str) -> ShepherdResult<()> {
        remove_if_exists(&self.paths.done_signal(worker)).await?;
        Ok(())
    }

    /// Write the team-wide shutdown record the lead polls for.
    pub async fn record_team_shutdown(&self, record: &TeamShutdown) -> ShepherdResult<()> {
        write_json_atomic(&self.paths.shutdown_record(), record).await
    }

    /// The team-wide shutdown record, if one was written.
    pub async fn team_shutdown(&self) -> ShepherdResult<Option<TeamShutdown>> {
        read_json(&self.paths.shutdown_record()).await
    }

    /// Forget a previous session's shutdown record before a new start.
    pub async fn clear_team_shutdown(&self) -> ShepherdResult<()> {
        remove_if_exists(&self.paths.shutdown_record()).await?;
        Ok(())
    }
}
