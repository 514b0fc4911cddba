//! Create-exclusive lock files with stale-holder recovery.
//!
//! A lock is a small JSON file published with a hard link from a fully written
//! temp file, so the link either fails because another holder exists or lands
//! with complete contents. A lock whose holder process is gone, or which is older
//! than the stale age, may be reclaimed by anyone.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shepherd_core::{PolicyConfig, ShepherdError, ShepherdResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether a process with `pid` currently exists on this host.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a way to check, every holder is presumed alive.
#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Retry and staleness settings for lock acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    /// A lock older than this is taken over even if its holder lives.
    pub stale_age: Duration,
    /// Tries before [`crate::TaskStore::lock`] gives up. At least one.
    pub retry_attempts: u32,
    /// Pause between tries.
    pub retry_delay: Duration,
}

impl LockPolicy {
    /// Lock settings from the `[policy]` table. Zero attempts is raised to one.
    pub fn from_config(policy: &PolicyConfig) -> Self {
        Self {
            stale_age: policy.lock_stale_age(),
            retry_attempts: policy.lock_retry_attempts.max(1),
            retry_delay: policy.lock_retry_delay(),
        }
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

/// Contents of a lock file.
pub trait LockRecord: Serialize + DeserializeOwned + Send + Sync {
    fn holder_pid(&self) -> u32;
    fn acquired_at(&self) -> DateTime<Utc>;

    /// Stale when the holder is gone or the lock has outlived `stale_age`.
    fn is_stale(&self, stale_age: Duration, now: DateTime<Utc>) -> bool {
        let age = now
            .signed_duration_since(self.acquired_at())
            .to_std()
            .unwrap_or(Duration::ZERO);
        !is_process_alive(self.holder_pid()) || age > stale_age
    }
}

/// Legacy lock file body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Process that wrote the lock.
    pub pid: u32,
    /// When it was taken.
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    /// A record naming this process, stamped now.
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

impl Default for LockInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRecord for LockInfo {
    fn holder_pid(&self) -> u32 {
        self.pid
    }

    fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

/// A held lock. The file is removed when the guard is dropped, but only if it
/// still carries the contents this guard wrote.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    contents: Vec<u8>,
    released: bool,
}

impl LockGuard {
    /// The lock file this guard owns.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the lock file on disk is still the one this guard created.
    pub async fn is_held(&self) -> bool {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes == self.contents,
            Err(_) => false,
        }
    }

    /// Parse the record this guard wrote.
    pub fn record<R: LockRecord>(&self) -> ShepherdResult<R> {
        Ok(serde_json::from_slice(&self.contents)?)
    }

    /// Remove the lock file now instead of on drop. A file another holder
    /// has since replaced is left alone.
    pub async fn release(mut self) -> ShepherdResult<()> {
        self.released = true;
        if self.is_held().await {
            shepherd_core::fsio::remove_if_exists(&self.path).await?;
            debug!(path = %self.path.display(), "Lock released");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes == self.contents => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    if e.kind() != ErrorKind::NotFound && !std::thread::panicking() {
                        warn!(path = %self.path.display(), error = %e, "Failed to release lock");
                    }
                }
            }
            _ => {}
        }
    }
}

/// Try once to take the lock at `path`, reclaiming it if the current holder is stale.
///
/// Returns `Ok(None)` when a live holder owns the lock.
pub async fn try_acquire<R: LockRecord>(
    path: &Path,
    record: &R,
    stale_age: Duration,
) -> ShepherdResult<Option<LockGuard>> {
    let contents = serde_json::to_vec(record)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // One attempt, plus one more after reclaiming a stale lock.
    for _ in 0..2 {
        if publish(path, &contents).await? {
            return Ok(Some(LockGuard {
                path: path.to_path_buf(),
                contents,
                released: false,
            }));
        }
        if !reclaim_if_stale::<R>(path, stale_age).await? {
            return Ok(None);
        }
    }
    Ok(None)
}

/// Take the lock, retrying while a live holder owns it.
pub async fn acquire<R: LockRecord>(
    path: &Path,
    make_record: impl Fn() -> R + Send,
    policy: LockPolicy,
) -> ShepherdResult<LockGuard> {
    for attempt in 1..=policy.retry_attempts {
        if let Some(guard) = try_acquire(path, &make_record(), policy.stale_age).await? {
            return Ok(guard);
        }
        if attempt < policy.retry_attempts {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }
    Err(ShepherdError::Lock(format!(
        "could not acquire '{}' after {} attempts",
        path.display(),
        policy.retry_attempts
    )))
}

/// Write a temp file and hard-link it into place. `false` means the lock already exists.
async fn publish(path: &Path, contents: &[u8]) -> ShepherdResult<bool> {
    let tmp = path.with_file_name(format!(
        ".{}.{}.tmp",
        file_name(path),
        Uuid::new_v4().simple()
    ));
    tokio::fs::write(&tmp, contents).await?;
    let linked = tokio::fs::hard_link(&tmp, path).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove a stale lock. Returns `true` if the path is now free to retry.
async fn reclaim_if_stale<R: LockRecord>(path: &Path, stale_age: Duration) -> ShepherdResult<bool> {
    let observed = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };

    let stale = match serde_json::from_slice::<R>(&observed) {
        Ok(record) => record.is_stale(stale_age, Utc::now()),
        // Unreadable lock: judge by file age.
        Err(_) => file_age(path).await.is_some_and(|age| age > stale_age),
    };
    if !stale {
        return Ok(false);
    }

    // Move the stale lock aside, then confirm it is the one we judged. If a
    // fresh holder slipped in between, put theirs back.
    let tombstone = path.with_file_name(format!(
        ".{}.{}.stale",
        file_name(path),
        Uuid::new_v4().simple()
    ));
    match tokio::fs::rename(path, &tombstone).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }
    let moved = tokio::fs::read(&tombstone).await.unwrap_or_default();
    if moved != observed {
        if tokio::fs::hard_link(&tombstone, path).await.is_err() {
            warn!(path = %path.display(), "Lost a fresh lock while reclaiming a stale one");
        }
        let _ = tokio::fs::remove_file(&tombstone).await;
        return Ok(false);
    }
    let _ = tokio::fs::remove_file(&tombstone).await;
    info!(path = %path.display(), "Reclaimed stale lock");
    Ok(true)
}

async fn file_age(path: &Path) -> Option<Duration> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    meta.modified().ok()?.elapsed().ok()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
