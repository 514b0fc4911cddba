use crate::lock::{acquire, LockInfo, LockPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shepherd_core::fsio::{read_json, remove_if_exists, write_json_atomic};
use shepherd_core::{Backend, ShepherdResult, TeamPaths};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

/// Static description of a team, written once at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRecord {
    /// Team name, also the directory name.
    pub name: String,
    /// Backend the team was created with.
    pub backend: Backend,
    /// Worker count requested at start.
    pub workers: usize,
    /// Directory the workers run in.
    pub cwd: PathBuf,
    /// When the team was first started.
    pub created_at: DateTime<Utc>,
}

/// A worker registered with the team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Unique within the team, e.g. `worker-2`.
    pub name: String,
    /// Provider key from the config.
    pub provider: String,
    /// Pane running the worker. Unset for a bridge that registered itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    /// When the member was (re)registered.
    pub joined_at: DateTime<Utc>,
}

impl Member {
    /// A member without a pane, joined now.
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            pane_id: None,
            joined_at: Utc::now(),
        }
    }

    /// Attach the pane the worker runs in.
    pub fn with_pane(mut self, pane_id: impl Into<String>) -> Self {
        self.pane_id = Some(pane_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemberList {
    members: Vec<Member>,
}

/// Multiplexer panes of a running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Team this session belongs to.
    pub team: String,
    /// Pane the lead process runs in.
    pub leader_pane: String,
    /// Worker name to pane id.
    pub worker_panes: BTreeMap<String, String>,
    /// When the session was laid out.
    pub started_at: DateTime<Utc>,
}

/// Team membership (`members.json`), the team record and session state.
///
/// Bridge daemons unregister themselves on shutdown, so membership is edited
/// from several processes and every change happens under `members.lock`.
#[derive(Debug, Clone)]
pub struct TeamRegistry {
    paths: TeamPaths,
    lock_policy: LockPolicy,
}

impl TeamRegistry {
    /// Registry for the team at `paths`.
    pub fn new(paths: TeamPaths, lock_policy: LockPolicy) -> Self {
        Self { paths, lock_policy }
    }

    /// Write `team.json`.
    pub async fn write_team(&self, record: &TeamRecord) -> ShepherdResult<()> {
        write_json_atomic(&self.paths.team_file(), record).await
    }

    /// Read `team.json`.
    pub async fn team(&self) -> ShepherdResult<Option<TeamRecord>> {
        read_json(&self.paths.team_file()).await
    }

    /// Current members. A missing `members.json` means none.
    pub async fn members(&self) -> ShepherdResult<Vec<Member>> {
        Ok(read_json::<MemberList>(&self.paths.members_file())
            .await?
            .unwrap_or_default()
            .members)
    }

    /// Add or replace the member named `member.name`.
    pub async fn register(&self, member: Member) -> ShepherdResult<()> {
        let _guard = acquire(&self.paths.members_lock(), LockInfo::new, self.lock_policy).await?;
        let mut list = read_json::<MemberList>(&self.paths.members_file())
            .await?
            .unwrap_or_default();
        list.members.retain(|m| m.name != member.name);
        info!(team = %self.paths.team(), worker = %member.name, "Member registered");
        list.members.push(member);
        write_json_atomic(&self.paths.members_file(), &list).await
    }

    /// Remove `name`. Returns whether it was registered.
    pub async fn unregister(&self, name: &str) -> ShepherdResult<bool> {
        let _guard = acquire(&self.paths.members_lock(), LockInfo::new, self.lock_policy).await?;
        let mut list = read_json::<MemberList>(&self.paths.members_file())
            .await?
            .unwrap_or_default();
        let before = list.members.len();
        list.members.retain(|m| m.name != name);
        let removed = list.members.len() != before;
        if removed {
            write_json_atomic(&self.paths.members_file(), &list).await?;
            info!(team = %self.paths.team(), worker = name, "Member unregistered");
        }
        Ok(removed)
    }

    /// Record the panes of a running session.
    pub async fn save_session(&self, state: &SessionState) -> ShepherdResult<()> {
        write_json_atomic(&self.paths.session_file(), state).await
    }

    /// The running session, if there is one.
    pub async fn session(&self) -> ShepherdResult<Option<SessionState>> {
        read_json(&self.paths.session_file()).await
    }

    /// Forget the session once its panes are gone.
    pub async fn remove_session(&self) -> ShepherdResult<()> {
        remove_if_exists(&self.paths.session_file()).await?;
        Ok(())
    }
}
