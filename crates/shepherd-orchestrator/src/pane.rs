use async_trait::async_trait;
use shepherd_core::ShepherdResult;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Terminal panes hosting the leader and the workers.
#[async_trait]
pub trait PaneManager: Send + Sync {
    /// Start a detached session named `name`. Returns its first pane.
    async fn create_session(&self, name: &str, cwd: &Path) -> ShepherdResult<String>;

    /// Open a new pane next to `target`. Returns the new pane id.
    async fn split_pane(&self, target: &str, cwd: &Path) -> ShepherdResult<String>;

    /// Replace whatever runs in `pane` with `command`. The pane dies when it exits.
    async fn launch(&self, pane: &str, command: &str) -> ShepherdResult<()>;

    /// Type `text` into `pane` and press Enter.
    async fn send_keys(&self, pane: &str, text: &str) -> ShepherdResult<()>;

    /// Press Enter in `pane` without typing anything.
    async fn send_enter(&self, pane: &str) -> ShepherdResult<()>;

    /// Visible contents of `pane`.
    async fn capture_pane(&self, pane: &str) -> ShepherdResult<String>;

    async fn is_alive(&self, pane: &str) -> bool;

    /// Kill `pane`. Killing a pane that is already gone is not an error.
    async fn kill_pane(&self, pane: &str) -> ShepherdResult<()>;

    /// Resize every pane in `target`'s window evenly.
    async fn equalize_layout(&self, _target: &str) -> ShepherdResult<()> {
        Ok(())
    }
}

/// Type `text` into `pane`, retrying up to `attempts` times.
///
/// After each send, wait `grace` and look at the pane. If the last line of
/// `text` still sits at the bottom of the capture, the program has not
/// consumed it yet and Enter is pressed again. Terminal UIs redraw at their
/// own pace, so a `true` here means "probably delivered".
pub async fn deliver_keys(
    panes: &dyn PaneManager,
    pane: &str,
    text: &str,
    attempts: u32,
    grace: Duration,
) -> bool {
    let echo = echo_line(text);
    let mut sent = false;
    for attempt in 1..=attempts.max(1) {
        let result = if sent {
            panes.send_enter(pane).await
        } else {
            panes.send_keys(pane, text).await
        };
        if let Err(e) = result {
            warn!(pane, attempt, error = %e, "Sending keys failed");
            tokio::time::sleep(grace).await;
            continue;
        }
        sent = true;
        tokio::time::sleep(grace).await;

        let Some(echo) = echo.as_deref() else {
            return true;
        };
        match panes.capture_pane(pane).await {
            Ok(screen) if is_pending(&screen, echo) => {
                debug!(pane, attempt, "Input still visible, pressing Enter again");
            }
            Ok(_) => return true,
            Err(e) => {
                debug!(pane, error = %e, "Capture failed, assuming delivered");
                return true;
            }
        }
    }
    warn!(pane, attempts, "Input was not consumed");
    false
}

/// Last non-empty line of `text`, shortened so a wrapped line still matches.
fn echo_line(text: &str) -> Option<String> {
    let line = text.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    Some(line.chars().take(40).collect())
}

fn is_pending(screen: &str, echo: &str) -> bool {
    screen
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .is_some_and(|last| last.contains(echo))
}
