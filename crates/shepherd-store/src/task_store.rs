use crate::lock::{LockGuard, LockPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shepherd_core::fsio::{read_json, write_json_atomic};
use shepherd_core::{
    Backend, ShepherdError, ShepherdResult, Task, TaskId, TaskPatch, TaskStatus, TeamPaths,
};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Exclusive right to mutate one task record. Released when dropped.
#[derive(Debug)]
pub struct TaskLock {
    task_id: TaskId,
    guard: LockGuard,
}

impl TaskLock {
    pub(crate) fn new(task_id: TaskId, guard: LockGuard) -> Self {
        Self { task_id, guard }
    }

    /// The task this lock covers.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub(crate) fn guard(&self) -> &LockGuard {
        &self.guard
    }

    /// Release before the lock goes out of scope.
    pub async fn release(self) -> ShepherdResult<()> {
        self.guard.release().await
    }
}

/// A transition only the worker holding a claim may make.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimChange {
    /// Mark the task completed with this summary.
    Complete(Option<String>),
    /// Hand the task back to the pending pool without counting a failure.
    Release,
}

/// Persistent store of a team's task records.
///
/// Backends differ only in how the per-task lock is represented; reads,
/// listing and the claim/update protocol are shared.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Which on-disk lock layout this store uses.
    fn backend(&self) -> Backend;

    /// The team directory this store reads and writes.
    fn paths(&self) -> &TeamPaths;

    fn lock_policy(&self) -> LockPolicy;

    /// Try once to take the lock for `id`. `Ok(None)` means a live holder has it.
    async fn try_lock(&self, id: TaskId) -> ShepherdResult<Option<TaskLock>>;

    /// Persist `task` while holding `lock`. Fails if the lock was lost.
    async fn write_task(&self, lock: &TaskLock, task: &Task) -> ShepherdResult<()>;

    /// Read a task record. Missing is `Ok(None)`, corrupt is an error.
    async fn read_task(&self, id: TaskId) -> ShepherdResult<Option<Task>> {
        read_json(&self.paths().task_file(id)).await
    }

    /// Ids of all task records, ascending.
    async fn list_task_ids(&self) -> ShepherdResult<Vec<TaskId>> {
        let dir = self.paths().tasks_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".json").and_then(TaskId::from_stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// All readable task records, ascending. Corrupt records are logged and skipped.
    async fn list_tasks(&self) -> ShepherdResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for id in self.list_task_ids().await? {
            match self.read_task(id).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => warn!(task_id = %id, error = %e, "Skipping unreadable task record"),
            }
        }
        Ok(tasks)
    }

    /// Seed a new record. Fails if a record with the same id exists.
    async fn create_task(&self, task: &Task) -> ShepherdResult<()> {
        let lock = self.lock(task.id).await?;
        if self.read_task(task.id).await?.is_some() {
            return Err(ShepherdError::Store(format!("task {} already exists", task.id)));
        }
        self.write_task(&lock, task).await
    }

    /// Take the lock for `id`, retrying per the lock policy.
    async fn lock(&self, id: TaskId) -> ShepherdResult<TaskLock> {
        let policy = self.lock_policy();
        for attempt in 1..=policy.retry_attempts {
            if let Some(lock) = self.try_lock(id).await? {
                return Ok(lock);
            }
            if attempt < policy.retry_attempts {
                tokio::time::sleep(policy.retry_delay).await;
            }
        }
        Err(ShepherdError::Lock(format!(
            "task {id} is locked by another holder"
        )))
    }

    /// Merge the non-null fields of `patch` into the record under its lock.
    async fn update_task(&self, id: TaskId, patch: TaskPatch) -> ShepherdResult<Task> {
        let lock = self.lock(id).await?;
        let mut task = self
            .read_task(id)
            .await?
            .ok_or_else(|| ShepherdError::Store(format!("task {id} not found")))?;
        task.apply(patch);
        self.write_task(&lock, &task).await?;
        debug!(task_id = %id, status = %task.status, "Task updated");
        Ok(task)
    }

    /// Claim the lowest-numbered ready task that `worker` may take.
    ///
    /// Contention is never an error: a task whose lock is held elsewhere, or
    /// whose record changed before the lock was taken, is skipped.
    async fn find_next_task(&self, worker: &str) -> ShepherdResult<Option<Task>> {
        let tasks = self.list_tasks().await?;
        let completed: HashSet<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();

        for candidate in tasks {
            if !candidate.is_claimable_by(worker) || !candidate.is_ready(&completed) {
                continue;
            }
            let lock = match self.try_lock(candidate.id).await {
                Ok(Some(lock)) => lock,
                Ok(None) => continue,
                Err(e) => {
                    debug!(task_id = %candidate.id, error = %e, "Claim attempt failed");
                    continue;
                }
            };
            let Some(mut current) = self.read_task(candidate.id).await? else {
                continue;
            };
            if !current.is_claimable_by(worker) || !current.is_ready(&completed) {
                continue;
            }
            current.claim(worker);
            self.write_task(&lock, &current).await?;
            info!(task_id = %current.id, worker, "Task claimed");
            return Ok(Some(current));
        }
        Ok(None)
    }

    /// Apply `change` if the record is still the attempt `worker` claimed at
    /// `assigned_at`. Returns the new record, or `None` when the task has
    /// already moved on (resolved elsewhere, reassigned or missing).
    async fn update_claimed(
        &self,
        id: TaskId,
        worker: &str,
        assigned_at: Option<DateTime<Utc>>,
        change: ClaimChange,
    ) -> ShepherdResult<Option<Task>> {
        let lock = self.lock(id).await?;
        let Some(mut task) = self.read_task(id).await? else {
            return Ok(None);
        };
        let still_claimed = task.status == TaskStatus::InProgress
            && task.owner.as_deref() == Some(worker)
            && task.assigned_at == assigned_at;
        if !still_claimed {
            debug!(task_id = %id, worker, status = %task.status, "Claim no longer current");
            return Ok(None);
        }
        match change {
            ClaimChange::Complete(summary) => task.complete(summary),
            ClaimChange::Release => task.requeue(),
        }
        self.write_task(&lock, &task).await?;
        lock.release().await?;
        Ok(Some(task))
    }
}

/// Shared record write: confirm the lock is still ours, then write atomically.
pub(crate) async fn write_record(
    paths: &TeamPaths,
    lock: &TaskLock,
    task: &Task,
) -> ShepherdResult<()> {
    if lock.task_id() != task.id {
        return Err(ShepherdError::Lock(format!(
            "lock for task {} used to write task {}",
            lock.task_id(),
            task.id
        )));
    }
    if !lock.guard().is_held().await {
        return Err(ShepherdError::Lock(format!(
            "lock for task {} was lost before writing",
            task.id
        )));
    }
    write_json_atomic(&paths.task_file(task.id), task).await
}
