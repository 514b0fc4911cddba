use crate::lock::{try_acquire, LockInfo, LockPolicy};
use crate::task_store::{write_record, TaskLock, TaskStore};
use async_trait::async_trait;
use shepherd_core::{Backend, ShepherdResult, Task, TaskId, TeamPaths};

/// Task store guarded by `tasks/<id>.lock` files holding `{pid, acquiredAt}`.
pub struct LegacyTaskStore {
    paths: TeamPaths,
    policy: LockPolicy,
}

impl LegacyTaskStore {
    /// Store for the team at `paths`.
    pub fn new(paths: TeamPaths, policy: LockPolicy) -> Self {
        Self { paths, policy }
    }
}

#[async_trait]
impl TaskStore for LegacyTaskStore {
    fn backend(&self) -> Backend {
        Backend::Legacy
    }

    fn paths(&self) -> &TeamPaths {
        &self.paths
    }

    fn lock_policy(&self) -> LockPolicy {
        self.policy
    }

    async fn try_lock(&self, id: TaskId) -> ShepherdResult<Option<TaskLock>> {
        let guard = try_acquire(
            &self.paths.task_lock(id),
            &LockInfo::new(),
            self.policy.stale_age,
        )
        .await?;
        Ok(guard.map(|g| TaskLock::new(id, g)))
    }

    async fn write_task(&self, lock: &TaskLock, task: &Task) -> ShepherdResult<()> {
        write_record(&self.paths, lock, task).await
    }
}
