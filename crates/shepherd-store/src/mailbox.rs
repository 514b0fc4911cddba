//! Per-worker inbox/outbox channels.
//!
//! Each (worker, direction) pair has exactly one reader. Readers only ever see
//! complete records, in append order, and never the same record twice.

use crate::lock::{acquire, LockInfo, LockPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shepherd_core::fsio::{read_json, remove_if_exists, write_atomic, write_json_atomic};
use shepherd_core::{
    InboxMessage, MailboxDirection, OutboxMessage, ShepherdError, ShepherdResult, TeamPaths,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-worker message queues. Inbox carries lead-to-worker messages, outbox
/// carries worker reports back to the lead.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Append one record to a worker's inbox or outbox.
    async fn append(&self, worker: &str, direction: MailboxDirection, record: Value)
        -> ShepherdResult<()>;

    /// Records appended since the previous call, oldest first.
    async fn read_new(&self, worker: &str, direction: MailboxDirection)
        -> ShepherdResult<Vec<Value>>;

    /// Drop records that have already been delivered.
    async fn prune(&self, worker: &str) -> ShepherdResult<()>;

    async fn send_inbox(&self, worker: &str, message: &InboxMessage) -> ShepherdResult<()> {
        self.append(worker, MailboxDirection::Inbox, serde_json::to_value(message)?)
            .await
    }

    async fn report(&self, worker: &str, message: &OutboxMessage) -> ShepherdResult<()> {
        self.append(worker, MailboxDirection::Outbox, serde_json::to_value(message)?)
            .await
    }

    async fn read_inbox(&self, worker: &str) -> ShepherdResult<Vec<InboxMessage>> {
        let raw = self.read_new(worker, MailboxDirection::Inbox).await?;
        Ok(decode_all(worker, raw))
    }

    async fn read_outbox(&self, worker: &str) -> ShepherdResult<Vec<OutboxMessage>> {
        let raw = self.read_new(worker, MailboxDirection::Outbox).await?;
        Ok(decode_all(worker, raw))
    }
}

fn decode_all<T: DeserializeOwned>(worker: &str, raw: Vec<Value>) -> Vec<T> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(worker, error = %e, "Skipping mailbox record with unexpected shape");
                None
            }
        })
        .collect()
}

// --- Legacy: JSONL log + byte cursor ---

/// Offsets just past each newline.
fn newline_offsets(bytes: &[u8]) -> Vec<usize> {
    bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(|(i, _)| i + 1)
        .collect()
}

/// Append-only JSONL logs with a persisted byte cursor per reader.
///
/// The cursor only moves past newline-terminated lines, so a writer caught
/// mid-append is picked up on the next read. When a log grows past either
/// threshold the reader compacts it to the most recent half of its lines,
/// dropping only lines it has consumed, and shifts its cursor by the same
/// number of bytes.
pub struct LegacyMailbox {
    paths: TeamPaths,
    lock_policy: LockPolicy,
    max_bytes: u64,
    max_lines: usize,
}

impl LegacyMailbox {
    /// Mailbox whose logs are compacted past `max_bytes` or `max_lines`.
    pub fn new(paths: TeamPaths, lock_policy: LockPolicy, max_bytes: u64, max_lines: usize) -> Self {
        Self {
            paths,
            lock_policy,
            max_bytes,
            max_lines,
        }
    }

    fn log_lock(log: &Path) -> PathBuf {
        let mut name = log.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn read_cursor(&self, path: &Path) -> ShepherdResult<u64> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(text.trim().parse().unwrap_or_else(|_| {
                warn!(path = %path.display(), "Unreadable mailbox cursor, starting over");
                0
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_cursor(&self, path: &Path, cursor: u64) -> ShepherdResult<()> {
        write_atomic(path, cursor.to_string().as_bytes()).await?;
        Ok(())
    }

    async fn read_log(path: &Path) -> ShepherdResult<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Compact `log` if it is over a threshold. Returns the re-based cursor.
    async fn maybe_rotate(&self, log: &Path, cursor_path: &Path, cursor: u64) -> ShepherdResult<u64> {
        let meta = match tokio::fs::metadata(log).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(cursor),
            Err(e) => return Err(e.into()),
        };
        let bytes = Self::read_log(log).await?;
        let line_ends = newline_offsets(&bytes);
        if meta.len() <= self.max_bytes && line_ends.len() <= self.max_lines {
            return Ok(cursor);
        }

        let _guard = acquire(&Self::log_lock(log), LockInfo::new, self.lock_policy).await?;
        // Re-read under the lock; a writer may have appended.
        let bytes = Self::read_log(log).await?;
        let line_ends = newline_offsets(&bytes);
        let keep_from = line_ends.len() / 2;
        let cursor_usize = usize::try_from(cursor).unwrap_or(usize::MAX);
        // Drop the older half, but never a line the reader has not consumed.
        let dropped = line_ends
            .iter()
            .take(keep_from)
            .copied()
            .filter(|end| *end <= cursor_usize)
            .last()
            .unwrap_or(0);
        if dropped == 0 {
            return Ok(cursor);
        }
        write_atomic(log, &bytes[dropped..]).await?;
        let rebased = cursor.saturating_sub(dropped as u64);
        self.write_cursor(cursor_path, rebased).await?;
        info!(
            log = %log.display(),
            dropped_bytes = dropped,
            kept_bytes = bytes.len() - dropped,
            "Mailbox log rotated"
        );
        Ok(rebased)
    }
}

#[async_trait]
impl Mailbox for LegacyMailbox {
    async fn append(
        &self,
        worker: &str,
        direction: MailboxDirection,
        record: Value,
    ) -> ShepherdResult<()> {
        let log = self.paths.mailbox_log(worker, direction);
        if let Some(parent) = log.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = acquire(&Self::log_lock(&log), LockInfo::new, self.lock_policy).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .await
            .map_err(|e| ShepherdError::Mailbox(format!("open '{}': {e}", log.display())))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_new(
        &self,
        worker: &str,
        direction: MailboxDirection,
    ) -> ShepherdResult<Vec<Value>> {
        let log = self.paths.mailbox_log(worker, direction);
        let cursor_path = self.paths.mailbox_cursor(worker, direction);
        let mut cursor = self.read_cursor(&cursor_path).await?;
        let bytes = Self::read_log(&log).await?;

        if cursor > bytes.len() as u64 {
            warn!(
                worker,
                direction = direction.as_str(),
                cursor,
                len = bytes.len(),
                "Mailbox cursor past end of log, rereading from start"
            );
            cursor = 0;
            self.write_cursor(&cursor_path, 0).await?;
        }
        let start = usize::try_from(cursor).unwrap_or(0);
        let tail = &bytes[start..];
        let Some(last_newline) = tail.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &tail[..=last_newline];

        let mut records = Vec::new();
        for line in complete.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Value>(line) {
                Ok(value) => records.push(value),
                Err(e) => warn!(
                    worker,
                    direction = direction.as_str(),
                    error = %e,
                    "Skipping malformed mailbox line"
                ),
            }
        }

        let advanced = cursor + complete.len() as u64;
        self.write_cursor(&cursor_path, advanced).await?;
        self.maybe_rotate(&log, &cursor_path, advanced).await?;
        debug!(worker, direction = direction.as_str(), count = records.len(), "Mailbox read");
        Ok(records)
    }

    async fn prune(&self, worker: &str) -> ShepherdResult<()> {
        for direction in [MailboxDirection::Inbox, MailboxDirection::Outbox] {
            let log = self.paths.mailbox_log(worker, direction);
            let cursor_path = self.paths.mailbox_cursor(worker, direction);
            let cursor = self.read_cursor(&cursor_path).await?;
            self.maybe_rotate(&log, &cursor_path, cursor).await?;
        }
        Ok(())
    }
}

// --- Structured: one file per message ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMessage {
    id: String,
    created_at: DateTime<Utc>,
    delivered: bool,
    payload: Value,
}

/// One JSON file per message, ordered by a time-prefixed file name. Each file
/// carries its own `delivered` flag and is deleted by `prune` once delivered.
pub struct StructuredMailbox {
    paths: TeamPaths,
}

impl StructuredMailbox {
    /// Mailbox rooted at the team's `mailbox/` directory.
    pub fn new(paths: TeamPaths) -> Self {
        Self { paths }
    }

    async fn message_files(dir: &Path) -> ShepherdResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl Mailbox for StructuredMailbox {
    async fn append(
        &self,
        worker: &str,
        direction: MailboxDirection,
        record: Value,
    ) -> ShepherdResult<()> {
        let now = Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default().max(0);
        let id = Uuid::new_v4().simple().to_string();
        let path = self
            .paths
            .mailbox_dir(worker, direction)
            .join(format!("{nanos:020}-{id}.json"));
        let stored = StoredMessage {
            id,
            created_at: now,
            delivered: false,
            payload: record,
        };
        write_json_atomic(&path, &stored).await
    }

    async fn read_new(
        &self,
        worker: &str,
        direction: MailboxDirection,
    ) -> ShepherdResult<Vec<Value>> {
        let dir = self.paths.mailbox_dir(worker, direction);
        let mut records = Vec::new();
        for path in Self::message_files(&dir).await? {
            let mut stored: StoredMessage = match read_json(&path).await {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker, path = %path.display(), error = %e, "Skipping unreadable message");
                    continue;
                }
            };
            if stored.delivered {
                continue;
            }
            stored.delivered = true;
            write_json_atomic(&path, &stored).await?;
            records.push(stored.payload);
        }
        Ok(records)
    }

    async fn prune(&self, worker: &str) -> ShepherdResult<()> {
        let mut removed = 0usize;
        for direction in [MailboxDirection::Inbox, MailboxDirection::Outbox] {
            let dir = self.paths.mailbox_dir(worker, direction);
            for path in Self::message_files(&dir).await? {
                if let Ok(Some(stored)) = read_json::<StoredMessage>(&path).await {
                    if stored.delivered && remove_if_exists(&path).await? {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            debug!(worker, removed, "Pruned delivered messages");
        }
        Ok(())
    }
}
