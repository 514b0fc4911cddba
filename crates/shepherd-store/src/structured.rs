use crate::lock::{try_acquire, LockPolicy, LockRecord};
use crate::task_store::{write_record, TaskLock, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shepherd_core::{Backend, ShepherdError, ShepherdResult, Task, TaskId, TeamPaths};
use uuid::Uuid;

/// Claim token stored in `claims/<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimToken {
    /// Random id, unique per claim.
    pub token: String,
    /// Worker or process name that took the claim.
    pub holder: String,
    /// Process id of the holder, for staleness checks.
    pub pid: u32,
    /// When the claim was taken.
    pub claimed_at: DateTime<Utc>,
}

impl ClaimToken {
    /// Fresh token for `holder` in this process.
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            holder: holder.into(),
            pid: std::process::id(),
            claimed_at: Utc::now(),
        }
    }
}

impl LockRecord for ClaimToken {
    fn holder_pid(&self) -> u32 {
        self.pid
    }

    fn acquired_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }
}

/// Task store that serializes mutations through claim tokens. Every write
/// re-reads the claim file and refuses to proceed unless the token matches.
pub struct StructuredTaskStore {
    paths: TeamPaths,
    policy: LockPolicy,
    holder: String,
}

impl StructuredTaskStore {
    /// `holder` names the process taking claims, e.g. a worker name or `lead`.
    pub fn new(paths: TeamPaths, policy: LockPolicy, holder: impl Into<String>) -> Self {
        Self {
            paths,
            policy,
            holder: holder.into(),
        }
    }

    /// Current claim on `id`, if any.
    pub async fn read_claim(&self, id: TaskId) -> ShepherdResult<Option<ClaimToken>> {
        shepherd_core::fsio::read_json(&self.paths.claim_file(id)).await
    }
}

#[async_trait]
impl TaskStore for StructuredTaskStore {
    fn backend(&self) -> Backend {
        Backend::Structured
    }

    fn paths(&self) -> &TeamPaths {
        &self.paths
    }

    fn lock_policy(&self) -> LockPolicy {
        self.policy
    }

    async fn try_lock(&self, id: TaskId) -> ShepherdResult<Option<TaskLock>> {
        let claim = ClaimToken::new(&self.holder);
        let guard = try_acquire(&self.paths.claim_file(id), &claim, self.policy.stale_age).await?;
        Ok(guard.map(|g| TaskLock::new(id, g)))
    }

    async fn write_task(&self, lock: &TaskLock, task: &Task) -> ShepherdResult<()> {
        let ours: ClaimToken = lock.guard().record()?;
        match self.read_claim(task.id).await? {
            Some(current) if current.token == ours.token => {}
            Some(current) => {
                return Err(ShepherdError::Lock(format!(
                    "claim on task {} now held by {}",
                    task.id, current.holder
                )))
            }
            None => {
                return Err(ShepherdError::Lock(format!(
                    "claim on task {} vanished before writing",
                    task.id
                )))
            }
        }
        write_record(&self.paths, lock, task).await
    }
}
