use crate::task::TaskId;
use std::path::{Path, PathBuf};

/// Direction of a worker mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxDirection {
    /// Lead → worker.
    Inbox,
    /// Worker → lead.
    Outbox,
}

impl MailboxDirection {
    /// File stem used for this direction.
    pub fn as_str(self) -> &'static str {
        match self {
            MailboxDirection::Inbox => "inbox",
            MailboxDirection::Outbox => "outbox",
        }
    }
}

/// Filesystem layout of one team under the data root.
///
/// ```text
/// <data_root>/teams/<team>/
///   .structured              backend marker
///   team.json members.json session.json shutdown.json
///   tasks/<id>.json          task records
///   tasks/<id>.lock          legacy lock files
///   tasks/<id>.failure.json  failure sidecars
///   claims/<id>.json         structured claim tokens
///   workers/<name>/          heartbeat, signals, overlay, prompt, mailboxes
/// ```
#[derive(Debug, Clone)]
pub struct TeamPaths {
    team: String,
    root: PathBuf,
}

impl TeamPaths {
    /// Paths for `team` under `data_root`.
    pub fn new(data_root: impl AsRef<Path>, team: impl Into<String>) -> Self {
        let team = team.into();
        Self {
            root: data_root.as_ref().join("teams").join(&team),
            team,
        }
    }

    /// Team name.
    pub fn team(&self) -> &str {
        &self.team
    }

    /// Root of the team directory.
    pub fn team_dir(&self) -> &Path {
        &self.root
    }

    /// Present only for structured-backend teams.
    pub fn structured_marker(&self) -> PathBuf {
        self.root.join(".structured")
    }

    /// `team.json`
    pub fn team_file(&self) -> PathBuf {
        self.root.join("team.json")
    }

    /// `members.json`
    pub fn members_file(&self) -> PathBuf {
        self.root.join("members.json")
    }

    /// Guards every edit of `members.json`.
    pub fn members_lock(&self) -> PathBuf {
        self.root.join("members.lock")
    }

    /// `session.json`
    pub fn session_file(&self) -> PathBuf {
        self.root.join("session.json")
    }

    /// Team-wide `shutdown.json`, written by `shepherd shutdown`.
    pub fn shutdown_record(&self) -> PathBuf {
        self.root.join("shutdown.json")
    }

    /// `tasks/`
    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    /// `tasks/<id>.json`
    pub fn task_file(&self, id: TaskId) -> PathBuf {
        self.tasks_dir().join(format!("{id}.json"))
    }

    /// `tasks/<id>.lock`
    pub fn task_lock(&self, id: TaskId) -> PathBuf {
        self.tasks_dir().join(format!("{id}.lock"))
    }

    /// `tasks/<id>.failure.json`
    pub fn failure_file(&self, id: TaskId) -> PathBuf {
        self.tasks_dir().join(format!("{id}.failure.json"))
    }

    /// `claims/`
    pub fn claims_dir(&self) -> PathBuf {
        self.root.join("claims")
    }

    /// `claims/<id>.json`
    pub fn claim_file(&self, id: TaskId) -> PathBuf {
        self.claims_dir().join(format!("{id}.json"))
    }

    /// `workers/`
    pub fn workers_dir(&self) -> PathBuf {
        self.root.join("workers")
    }

    /// `workers/<name>/`
    pub fn worker_dir(&self, worker: &str) -> PathBuf {
        self.workers_dir().join(worker)
    }

    /// `workers/<name>/heartbeat.json`
    pub fn heartbeat_file(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("heartbeat.json")
    }

    /// `workers/<name>/shutdown.json`
    pub fn shutdown_signal(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("shutdown.json")
    }

    /// `workers/<name>/drain.json`
    pub fn drain_signal(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("drain.json")
    }

    /// `workers/<name>/shutdown-ack.json`
    pub fn shutdown_ack(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("shutdown-ack.json")
    }

    /// `workers/<name>/done.json`
    pub fn done_signal(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("done.json")
    }

    /// Extra instructions prepended to every prompt for this worker.
    pub fn overlay_file(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("overlay.md")
    }

    /// Last prompt rendered for this worker, kept for inspection.
    pub fn prompt_file(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("prompt.md")
    }

    /// Append-only JSONL log used by the legacy mailbox.
    pub fn mailbox_log(&self, worker: &str, direction: MailboxDirection) -> PathBuf {
        self.worker_dir(worker)
            .join(format!("{}.jsonl", direction.as_str()))
    }

    /// Byte cursor persisted next to a legacy mailbox log.
    pub fn mailbox_cursor(&self, worker: &str, direction: MailboxDirection) -> PathBuf {
        self.worker_dir(worker)
            .join(format!("{}.cursor", direction.as_str()))
    }

    /// One-file-per-message directory used by the structured mailbox.
    pub fn mailbox_dir(&self, worker: &str, direction: MailboxDirection) -> PathBuf {
        self.worker_dir(worker)
            .join("messages")
            .join(direction.as_str())
    }
}
