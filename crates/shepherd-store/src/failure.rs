use shepherd_core::fsio::{read_json, write_json_atomic};
use shepherd_core::{FailureRecord, ShepherdResult, TaskId, TeamPaths};
use tracing::debug;

/// Per-task failure sidecars in `tasks/<id>.failure.json`.
///
/// Callers mutate a sidecar only while holding the task's lock, which makes
/// the read-increment-write sequence safe.
#[derive(Debug, Clone)]
pub struct FailureSidecar {
    paths: TeamPaths,
}

impl FailureSidecar {
    /// Sidecars under the team's `tasks/` directory.
    pub fn new(paths: TeamPaths) -> Self {
        Self { paths }
    }

    /// The sidecar for `id`, if any failure was ever recorded.
    pub async fn read(&self, id: TaskId) -> ShepherdResult<Option<FailureRecord>> {
        read_json(&self.paths.failure_file(id)).await
    }

    /// The record `id` would have after one more failure. Nothing is written.
    pub async fn next_failure(&self, id: TaskId, error: &str) -> ShepherdResult<FailureRecord> {
        Ok(match self.read(id).await? {
            Some(mut existing) => {
                existing.bump(error);
                existing
            }
            None => FailureRecord::first(id, error),
        })
    }

    /// Persist `record` over whatever sidecar exists.
    pub async fn write(&self, record: &FailureRecord) -> ShepherdResult<()> {
        write_json_atomic(&self.paths.failure_file(record.task_id), record).await?;
        debug!(task_id = %record.task_id, retry_count = record.retry_count, "Failure recorded");
        Ok(())
    }

    /// Record one more failure for `id`, creating the sidecar on first use.
    pub async fn write_failure(&self, id: TaskId, error: &str) -> ShepherdResult<FailureRecord> {
        let record = self.next_failure(id, error).await?;
        self.write(&record).await?;
        Ok(record)
    }

    /// Whether `id` has used up its retry budget. No sidecar means no failures.
    pub async fn is_retry_exhausted(&self, id: TaskId, max_retries: u32) -> ShepherdResult<bool> {
        Ok(self
            .read(id)
            .await?
            .is_some_and(|record| record.is_exhausted(max_retries)))
    }
}
