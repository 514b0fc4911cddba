//! The single place where a failed attempt turns into a requeue or a
//! permanent failure. Both the bridge daemon and the watchdog go through
//! [`RetryPolicy::handle_failure`].

use crate::failure::FailureSidecar;
use crate::task_store::TaskStore;
use chrono::{DateTime, Utc};
use shepherd_core::{ShepherdError, ShepherdResult, TaskId, TaskStatus};
use std::sync::Arc;
use tracing::{info, warn};

/// Whether another attempt could help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Crash, timeout, non-zero exit. Retried until the budget runs out.
    Transient,
    /// Policy violation. Never retried.
    Permanent,
}

/// What the failing party believed about the task when it gave up on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Task that failed.
    pub task_id: TaskId,
    /// Worker the task was claimed by.
    pub worker: String,
    /// Claim time the observer saw. Tells a stale report from a fresh claim.
    pub assigned_at: Option<DateTime<Utc>>,
}

impl Observation {
    /// Observation of `worker` holding `task_id` since `assigned_at`.
    pub fn new(
        task_id: TaskId,
        worker: impl Into<String>,
        assigned_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            task_id,
            worker: worker.into(),
            assigned_at,
        }
    }
}

/// Outcome of [`RetryPolicy::handle_failure`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Back to pending for another worker.
    Requeued { retry_count: u32 },
    /// Terminal failure.
    Failed { retry_count: u32, reason: String },
    /// The task no longer matches the observation; nothing was written.
    Skipped { reason: String },
}

impl Decision {
    /// True when the call was a no-op because the task had already moved on.
    pub fn is_skipped(&self) -> bool {
        matches!(self, Decision::Skipped { .. })
    }
}

/// Decides between requeue and permanent failure, counting attempts in the
/// failure sidecar.
pub struct RetryPolicy {
    store: Arc<dyn TaskStore>,
    sidecar: FailureSidecar,
    max_retries: u32,
}

impl RetryPolicy {
    /// Policy over `store` allowing `max_retries` failed attempts per task.
    pub fn new(store: Arc<dyn TaskStore>, max_retries: u32) -> Self {
        let sidecar = FailureSidecar::new(store.paths().clone());
        Self {
            store,
            sidecar,
            max_retries,
        }
    }

    /// Attempts allowed per task.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The sidecar this policy counts attempts in.
    pub fn sidecar(&self) -> &FailureSidecar {
        &self.sidecar
    }

    /// Record a failed attempt and move the task to exactly one next state.
    ///
    /// Under the task lock the record must still be in progress, owned by the
    /// observed worker, and carry the observed assignment time. Otherwise
    /// someone else already resolved it and this call is a no-op.
    pub async fn handle_failure(
        &self,
        observation: &Observation,
        error: &str,
        class: FailureClass,
    ) -> ShepherdResult<Decision> {
        let id = observation.task_id;
        let lock = self.store.lock(id).await?;
        let mut task = self
            .store
            .read_task(id)
            .await?
            .ok_or_else(|| ShepherdError::Store(format!("task {id} not found")))?;

        if task.status != TaskStatus::InProgress {
            return Ok(Decision::Skipped {
                reason: format!("task is {}", task.status),
            });
        }
        if task.owner.as_deref() != Some(observation.worker.as_str()) {
            return Ok(Decision::Skipped {
                reason: format!(
                    "task is owned by {}",
                    task.owner.as_deref().unwrap_or("nobody")
                ),
            });
        }
        if task.assigned_at != observation.assigned_at {
            return Ok(Decision::Skipped {
                reason: "task was reassigned".into(),
            });
        }

        // The task record goes first. If the sidecar write then fails the
        // count is one short, which costs an extra attempt rather than
        // failing a task that still has budget left.
        let record = self.sidecar.next_failure(id, error).await?;
        let decision = if class == FailureClass::Permanent {
            let reason = format!("permanent failure: {error}");
            task.fail(&reason);
            Decision::Failed {
                retry_count: record.retry_count,
                reason,
            }
        } else if record.is_exhausted(self.max_retries) {
            let reason = format!(
                "gave up after {} attempts; last error: {error}",
                record.retry_count
            );
            task.fail(&reason);
            Decision::Failed {
                retry_count: record.retry_count,
                reason,
            }
        } else {
            task.requeue();
            Decision::Requeued {
                retry_count: record.retry_count,
            }
        };
        self.store.write_task(&lock, &task).await?;
        self.sidecar.write(&record).await?;

        match &decision {
            Decision::Requeued { retry_count } => info!(
                task_id = %id,
                worker = %observation.worker,
                retry_count,
                max_retries = self.max_retries,
                "Task requeued after failure"
            ),
            Decision::Failed { reason, .. } => warn!(
                task_id = %id,
                worker = %observation.worker,
                reason = %reason,
                "Task permanently failed"
            ),
            Decision::Skipped { .. } => {}
        }
        Ok(decision)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::legacy::LegacyTaskStore;
    use crate::lock::LockPolicy;
    use shepherd_core::{Task, TeamPaths};

    async fn setup(dir: &std::path::Path) -> (Arc<dyn TaskStore>, Observation) {
        let store: Arc<dyn TaskStore> = Arc::new(LegacyTaskStore::new(
            TeamPaths::new(dir, "t"),
            LockPolicy::default(),
        ));
        store
            .create_task(&Task::new(TaskId(1), "s", "d"))
            .await
            .unwrap();
        let claimed = store.find_next_task("worker-1").await.unwrap().unwrap();
        let obs = Observation::new(TaskId(1), "worker-1", claimed.assigned_at);
        (store, obs)
    }

    #[tokio::test]
    async fn test_transient_failure_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let (store, obs) = setup(dir.path()).await;
        let policy = RetryPolicy::new(store.clone(), 5);
        let decision = policy
            .handle_failure(&obs, "exit 1", FailureClass::Transient)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Requeued { retry_count: 1 });
        let task = store.read_task(TaskId(1)).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.owner.is_none());
        assert!(task.assigned_at.is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_requeue_but_records() {
        let dir = tempfile::tempdir().unwrap();
        let (store, obs) = setup(dir.path()).await;
        let policy = RetryPolicy::new(store.clone(), 5);
        let decision = policy
            .handle_failure(&obs, "wrote outside allowed paths", FailureClass::Permanent)
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Failed { retry_count: 1, .. }));
        let task = store.read_task(TaskId(1)).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.failed_at.is_some());
        assert!(task.summary.unwrap().contains("outside allowed paths"));
        assert_eq!(
            policy.sidecar().read(TaskId(1)).await.unwrap().unwrap().retry_count,
            1
        );
    }

    #[tokio::test]
    async fn test_stale_observation_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (store, obs) = setup(dir.path()).await;
        let policy = RetryPolicy::new(store.clone(), 5);
        policy
            .handle_failure(&obs, "first", FailureClass::Transient)
            .await
            .unwrap();
        // Same observation again: the task is pending now.
        let again = policy
            .handle_failure(&obs, "second", FailureClass::Transient)
            .await
            .unwrap();
        assert!(again.is_skipped());
        assert_eq!(
            policy.sidecar().read(TaskId(1)).await.unwrap().unwrap().retry_count,
            1
        );
    }

    #[tokio::test]
    async fn test_reassigned_task_is_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let (store, obs) = setup(dir.path()).await;
        let policy = RetryPolicy::new(store.clone(), 5);
        policy
            .handle_failure(&obs, "crash", FailureClass::Transient)
            .await
            .unwrap();
        // A replacement with the same name claims it again.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.find_next_task("worker-1").await.unwrap().unwrap();
        let decision = policy
            .handle_failure(&obs, "late report", FailureClass::Transient)
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Skipped {
                reason: "task was reassigned".into()
            }
        );
        let task = store.read_task(TaskId(1)).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    /// Delegates to a legacy store but can be told to refuse record writes.
    struct RefusingWrites {
        inner: LegacyTaskStore,
        refuse: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl TaskStore for RefusingWrites {
        fn backend(&self) -> shepherd_core::Backend {
            self.inner.backend()
        }
        fn paths(&self) -> &TeamPaths {
            self.inner.paths()
        }
        fn lock_policy(&self) -> LockPolicy {
            self.inner.lock_policy()
        }
        async fn try_lock(&self, id: TaskId) -> ShepherdResult<Option<crate::TaskLock>> {
            self.inner.try_lock(id).await
        }
        async fn write_task(&self, lock: &crate::TaskLock, task: &Task) -> ShepherdResult<()> {
            if self.refuse.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ShepherdError::Store("disk full".into()));
            }
            self.inner.write_task(lock, task).await
        }
    }

    #[tokio::test]
    async fn test_failed_task_write_does_not_spend_a_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RefusingWrites {
            inner: LegacyTaskStore::new(TeamPaths::new(dir.path(), "t"), LockPolicy::default()),
            refuse: std::sync::atomic::AtomicBool::new(false),
        });
        store
            .create_task(&Task::new(TaskId(1), "s", "d"))
            .await
            .unwrap();
        let claimed = store.find_next_task("worker-1").await.unwrap().unwrap();
        let obs = Observation::new(TaskId(1), "worker-1", claimed.assigned_at);
        let policy = RetryPolicy::new(store.clone(), 2);

        store.refuse.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(policy
            .handle_failure(&obs, "crash", FailureClass::Transient)
            .await
            .is_err());
        assert!(policy.sidecar().read(TaskId(1)).await.unwrap().is_none());

        // The retry that follows still sees a full budget.
        store.refuse.store(false, std::sync::atomic::Ordering::SeqCst);
        let decision = policy
            .handle_failure(&obs, "crash", FailureClass::Transient)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Requeued { retry_count: 1 });
    }

    #[tokio::test]
    async fn test_completed_task_is_never_downgraded() {
        let dir = tempfile::tempdir().unwrap();
        let (store, obs) = setup(dir.path()).await;
        store
            .update_task(
                TaskId(1),
                shepherd_core::TaskPatch::status(TaskStatus::Completed),
            )
            .await
            .unwrap();
        let policy = RetryPolicy::new(store.clone(), 5);
        let decision = policy
            .handle_failure(&obs, "pane died", FailureClass::Transient)
            .await
            .unwrap();
        assert!(decision.is_skipped());
        assert!(policy.sidecar().read(TaskId(1)).await.unwrap().is_none());
        let task = store.read_task(TaskId(1)).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
}
