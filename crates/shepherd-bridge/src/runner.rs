use shepherd_security::truncate_chars;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How to launch one agent CLI invocation.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    /// Executable name or path.
    pub program: String,
    /// Arguments before the prompt.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment, added to the inherited one.
    pub env: Vec<(String, String)>,
}

impl AgentCommand {
    /// A command with no extra environment.
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    /// Add one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// How an agent run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    /// The process exited by itself with this code (`None` if killed by a signal).
    Exited(Option<i32>),
    /// Killed after running past the timeout.
    TimedOut,
    /// Killed because a shutdown was requested mid-run.
    Cancelled,
    /// The program could not be started.
    SpawnFailed(String),
}

/// Everything observed about one agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// How the process ended.
    pub exit: AgentExit,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock time of the run.
    pub duration: Duration,
}

impl AgentOutcome {
    /// Exit code 0, or a self-terminated process that printed something.
    pub fn is_success(&self) -> bool {
        match self.exit {
            AgentExit::Exited(Some(0)) => true,
            AgentExit::Exited(Some(_)) => !self.stdout.trim().is_empty(),
            _ => false,
        }
    }

    /// The run was stopped by a shutdown rather than by its own failure.
    pub fn was_cancelled(&self) -> bool {
        self.exit == AgentExit::Cancelled
    }

    /// Short human-readable reason for a failed run.
    pub fn failure_reason(&self) -> String {
        let detail = tail_line(&self.stderr);
        match &self.exit {
            AgentExit::Exited(Some(code)) if detail.is_empty() => {
                format!("agent exited with code {code} and no output")
            }
            AgentExit::Exited(Some(code)) => format!("agent exited with code {code}: {detail}"),
            AgentExit::Exited(None) => "agent was killed by a signal".to_string(),
            AgentExit::TimedOut => format!("agent timed out after {}s", self.duration.as_secs()),
            AgentExit::Cancelled => "agent cancelled by shutdown".to_string(),
            AgentExit::SpawnFailed(e) => format!("failed to start agent: {e}"),
        }
    }

    /// The agent's output, bounded for storage in the task record.
    pub fn summary(&self, max_chars: usize) -> String {
        let text = self.stdout.trim();
        if text.is_empty() {
            return "completed with no output".to_string();
        }
        truncate_chars(text, max_chars)
    }
}

fn tail_line(text: &str) -> String {
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim();
    truncate_chars(line, 300)
}

/// Runs an agent to completion, timeout or cancellation.
#[derive(Debug, Clone, Copy)]
pub struct AgentRunner {
    timeout: Duration,
    kill_grace: Duration,
}

impl AgentRunner {
    /// Runner that stops a run after `timeout`, allowing `kill_grace` between
    /// SIGTERM and SIGKILL.
    pub fn new(timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            timeout,
            kill_grace,
        }
    }

    /// Spawn `command`, feed `prompt` on stdin and wait.
    ///
    /// On timeout or when `cancel` flips to `true` the process group gets
    /// SIGTERM, then SIGKILL once the grace period passes.
    pub async fn run(
        &self,
        command: &AgentCommand,
        prompt: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> AgentOutcome {
        let started = Instant::now();
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %command.program, error = %e, "Agent spawn failed");
                return AgentOutcome {
                    exit: AgentExit::SpawnFailed(e.to_string()),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: started.elapsed(),
                };
            }
        };
        info!(program = %command.program, pid = child.id(), "Agent started");

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.as_bytes().to_vec();
            tokio::spawn(async move {
                // The agent may exit without reading everything.
                let _ = stdin.write_all(&prompt).await;
                let _ = stdin.shutdown().await;
            });
        }
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => AgentExit::Exited(status.code()),
                Err(e) => AgentExit::SpawnFailed(e.to_string()),
            },
            _ = tokio::time::sleep(self.timeout) => AgentExit::TimedOut,
            _ = cancelled(&mut cancel) => AgentExit::Cancelled,
        };
        if matches!(exit, AgentExit::TimedOut | AgentExit::Cancelled) {
            self.terminate(&mut child).await;
        }

        let stdout = collect(stdout, self.kill_grace).await;
        let stderr = collect(stderr, self.kill_grace).await;
        let duration = started.elapsed();
        debug!(exit = ?exit, duration_ms = duration.as_millis() as u64, "Agent finished");
        AgentOutcome {
            exit,
            stdout,
            stderr,
            duration,
        }
    }

    async fn terminate(&self, child: &mut Child) {
        signal_group(child, GroupSignal::Term);
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(_) => debug!("Agent exited after SIGTERM"),
            Err(_) => {
                warn!(grace_ms = self.kill_grace.as_millis() as u64, "Agent ignored SIGTERM, killing");
                signal_group(child, GroupSignal::Kill);
                let _ = child.kill().await;
            }
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone: nobody can cancel any more.
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    })
}

/// Join a pipe reader. Grandchildren can hold a pipe open after the agent
/// exits, so give up after `wait`.
async fn collect(handle: Option<JoinHandle<Vec<u8>>>, wait: Duration) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(wait, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => {
            abort.abort();
            String::new()
        }
    }
}

enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    let sig = match signal {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(pid), sig) {
        debug!(pid, error = %e, "Signalling agent process group failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: GroupSignal) {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sh(script: &str) -> AgentCommand {
        AgentCommand::new("sh", vec!["-c".into(), script.into()], std::env::temp_dir())
    }

    fn runner(timeout_ms: u64) -> AgentRunner {
        AgentRunner::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(500),
        )
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_prompt_is_fed_on_stdin() {
        let outcome = runner(5_000)
            .run(&sh("cat"), "hello agent", no_cancel())
            .await;
        assert_eq!(outcome.exit, AgentExit::Exited(Some(0)));
        assert!(outcome.is_success());
        assert_eq!(outcome.stdout, "hello agent");
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_output_fails() {
        let outcome = runner(5_000)
            .run(&sh("echo broken >&2; exit 3"), "", no_cancel())
            .await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.failure_reason(), "agent exited with code 3: broken");
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_output_counts_as_success() {
        let outcome = runner(5_000)
            .run(&sh("echo 'did the work'; exit 1"), "", no_cancel())
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.summary(100), "did the work");
    }

    #[tokio::test]
    async fn test_timeout_kills_agent() {
        let outcome = runner(200).run(&sh("sleep 30"), "", no_cancel()).await;
        assert_eq!(outcome.exit, AgentExit::TimedOut);
        assert!(!outcome.is_success());
        assert!(outcome.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_with_partial_output_is_failure() {
        let outcome = runner(300)
            .run(&sh("echo partial; sleep 30"), "", no_cancel())
            .await;
        assert_eq!(outcome.exit, AgentExit::TimedOut);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_cancel_stops_agent() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            runner(30_000).run(&sh("sleep 30"), "", rx).await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        let outcome = handle.await.unwrap();
        assert!(outcome.was_cancelled());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let cmd = AgentCommand::new("definitely-not-a-real-agent-cli", vec![], std::env::temp_dir());
        let outcome = runner(1_000).run(&cmd, "", no_cancel()).await;
        assert!(matches!(outcome.exit, AgentExit::SpawnFailed(_)));
        assert!(outcome.failure_reason().starts_with("failed to start agent"));
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let cmd = sh("printf %s \"$SHEPHERD_TASK_ID\"").with_env("SHEPHERD_TASK_ID", "7");
        let outcome = runner(5_000).run(&cmd, "", no_cancel()).await;
        assert_eq!(outcome.stdout, "7");
    }
}
