use crate::pane::PaneManager;
use async_trait::async_trait;
use shepherd_core::{ShepherdError, ShepherdResult};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// [`PaneManager`] backed by the `tmux` binary.
#[derive(Debug, Clone)]
pub struct TmuxPaneManager {
    program: String,
    /// Private server socket (`tmux -L`), so tests and parallel teams do not
    /// touch the user's default server.
    socket: Option<String>,
}

impl Default for TmuxPaneManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxPaneManager {
    /// Manager using `tmux` on the default server.
    pub fn new() -> Self {
        Self {
            program: "tmux".into(),
            socket: None,
        }
    }

    /// Use a separate tmux server (`-L <socket>`).
    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    fn base_args(&self) -> Vec<String> {
        match &self.socket {
            Some(socket) => vec!["-L".into(), socket.clone()],
            None => Vec::new(),
        }
    }

    async fn tmux(&self, args: &[&str]) -> ShepherdResult<String> {
        let mut full = self.base_args();
        full.extend(args.iter().map(|a| a.to_string()));
        debug!(args = ?full, "tmux");
        let output = Command::new(&self.program)
            .args(&full)
            .output()
            .await
            .map_err(|e| ShepherdError::Pane(format!("failed to run {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShepherdError::Pane(format!(
                "tmux {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parse_pane_id(stdout: &str) -> ShepherdResult<String> {
    let id = stdout.trim();
    if id.starts_with('%') && id.len() > 1 {
        Ok(id.to_string())
    } else {
        Err(ShepherdError::Pane(format!("unexpected pane id '{id}'")))
    }
}

#[async_trait]
impl PaneManager for TmuxPaneManager {
    async fn create_session(&self, name: &str, cwd: &Path) -> ShepherdResult<String> {
        let cwd = cwd.to_string_lossy();
        let out = self
            .tmux(&["new-session", "-d", "-s", name, "-c", &cwd, "-P", "-F", "#{pane_id}"])
            .await?;
        parse_pane_id(&out)
    }

    async fn split_pane(&self, target: &str, cwd: &Path) -> ShepherdResult<String> {
        let cwd = cwd.to_string_lossy();
        let out = self
            .tmux(&["split-window", "-t", target, "-c", &cwd, "-P", "-F", "#{pane_id}"])
            .await?;
        parse_pane_id(&out)
    }

    async fn launch(&self, pane: &str, command: &str) -> ShepherdResult<()> {
        self.tmux(&["respawn-pane", "-k", "-t", pane, command])
            .await
            .map(drop)
    }

    async fn send_keys(&self, pane: &str, text: &str) -> ShepherdResult<()> {
        self.tmux(&["send-keys", "-t", pane, "-l", text]).await?;
        self.send_enter(pane).await
    }

    async fn send_enter(&self, pane: &str) -> ShepherdResult<()> {
        self.tmux(&["send-keys", "-t", pane, "Enter"]).await.map(drop)
    }

    async fn capture_pane(&self, pane: &str) -> ShepherdResult<String> {
        self.tmux(&["capture-pane", "-p", "-t", pane]).await
    }

    async fn is_alive(&self, pane: &str) -> bool {
        match self
            .tmux(&["display-message", "-p", "-t", pane, "#{pane_dead}"])
            .await
        {
            Ok(out) => out.trim() == "0",
            Err(_) => false,
        }
    }

    async fn kill_pane(&self, pane: &str) -> ShepherdResult<()> {
        match self.tmux(&["kill-pane", "-t", pane]).await {
            Ok(_) => Ok(()),
            Err(ShepherdError::Pane(msg)) if msg.contains("can't find") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn equalize_layout(&self, target: &str) -> ShepherdResult<()> {
        self.tmux(&["select-layout", "-t", target, "tiled"])
            .await
            .map(drop)
    }
}

/// Quote `arg` for a POSIX shell command line.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Join program and arguments into one shell command line.
pub fn shell_join<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .map(|p| shell_quote(p.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
