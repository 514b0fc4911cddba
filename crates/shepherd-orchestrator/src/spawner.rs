use crate::pane::{deliver_keys, PaneManager};
use crate::tmux::shell_join;
use async_trait::async_trait;
use shepherd_bridge::{Completion, PromptContext, PromptRenderer};
use shepherd_core::fsio::write_atomic;
use shepherd_core::{LaunchMode, ShepherdConfig, ShepherdError, ShepherdResult, Task, TaskId};
use shepherd_store::{ClaimChange, TeamStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// A worker that was started in a pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawned {
    /// Pane the worker runs in.
    pub pane_id: String,
    /// Task handed over at launch. Bridge workers claim their own and leave this empty.
    pub task: Option<TaskId>,
}

/// Starts workers in panes. The watchdog uses the same spawner for replacements.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start `worker` next to `leader_pane`. `Ok(None)` when it has nothing to work on.
    async fn spawn(
        &self,
        worker: &str,
        provider: &str,
        leader_pane: &str,
    ) -> ShepherdResult<Option<Spawned>>;
}

/// Spawns workers into real panes, in bridge or interactive mode per provider.
pub struct PaneSpawner {
    panes: Arc<dyn PaneManager>,
    store: TeamStore,
    config: ShepherdConfig,
    cwd: PathBuf,
    exe: PathBuf,
    config_path: Option<PathBuf>,
    renderer: PromptRenderer,
}

impl PaneSpawner {
    /// `exe` is the `shepherd` binary that panes run for `bridge` and `done`.
    pub fn new(
        panes: Arc<dyn PaneManager>,
        store: TeamStore,
        config: ShepherdConfig,
        cwd: impl Into<PathBuf>,
        exe: impl Into<PathBuf>,
    ) -> Self {
        let renderer = PromptRenderer::from_policy(&config.policy);
        Self {
            panes,
            store,
            config,
            cwd: cwd.into(),
            exe: exe.into(),
            config_path: None,
            renderer,
        }
    }

    /// Pass `--config <path>` to bridge daemons.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    fn shepherd_command(&self, args: &[&str]) -> String {
        let exe = self.exe.to_string_lossy();
        let data_root = self.config.data_root.to_string_lossy();
        let mut parts: Vec<&str> = vec![&*exe, "--data-root", &*data_root];
        let config_path = self.config_path.as_ref().map(|p| p.to_string_lossy());
        if let Some(path) = config_path.as_deref() {
            parts.extend(["--config", path]);
        }
        parts.extend_from_slice(args);
        shell_join(parts)
    }

    async fn spawn_bridge(
        &self,
        worker: &str,
        provider: &str,
        leader_pane: &str,
    ) -> ShepherdResult<Spawned> {
        let cwd = self.cwd.to_string_lossy();
        let command = self.shepherd_command(&[
            "bridge",
            "--team",
            self.store.paths.team(),
            "--worker",
            worker,
            "--provider",
            provider,
            "--cwd",
            &*cwd,
        ]);
        let pane_id = self.panes.split_pane(leader_pane, &self.cwd).await?;
        self.panes.launch(&pane_id, &command).await?;
        info!(worker, provider, pane = %pane_id, "Bridge worker spawned");
        Ok(Spawned {
            pane_id,
            task: None,
        })
    }

    async fn spawn_interactive(
        &self,
        worker: &str,
        provider: &str,
        leader_pane: &str,
    ) -> ShepherdResult<Option<Spawned>> {
        let Some(task) = self.store.tasks.find_next_task(worker).await? else {
            return Ok(None);
        };
        match self.start_interactive(worker, provider, leader_pane, &task).await {
            Ok(pane_id) => {
                info!(worker, provider, pane = %pane_id, task_id = %task.id, "Interactive worker spawned");
                Ok(Some(Spawned {
                    pane_id,
                    task: Some(task.id),
                }))
            }
            Err(e) => {
                let released = self
                    .store
                    .tasks
                    .update_claimed(task.id, worker, task.assigned_at, ClaimChange::Release)
                    .await;
                if let Err(release_err) = released {
                    warn!(worker, task_id = %task.id, error = %release_err, "Could not release claim");
                }
                Err(e)
            }
        }
    }

    async fn start_interactive(
        &self,
        worker: &str,
        provider: &str,
        leader_pane: &str,
        task: &Task,
    ) -> ShepherdResult<String> {
        let resolved = self.config.provider(provider);
        let cli = shell_join(std::iter::once(&resolved.command).chain(&resolved.args));
        let prompt_file = self.write_prompt(worker, task).await?;

        let pane_id = self.panes.split_pane(leader_pane, &self.cwd).await?;
        self.panes.launch(&pane_id, &cli).await?;
        // Give the CLI a moment to draw its input box.
        tokio::time::sleep(self.config.policy.send_keys_grace()).await;

        let instruction = format!(
            "Read {} and follow the instructions in it.",
            prompt_file.display()
        );
        let delivered = deliver_keys(
            self.panes.as_ref(),
            &pane_id,
            &instruction,
            self.config.policy.send_keys_attempts,
            self.config.policy.send_keys_grace(),
        )
        .await;
        if !delivered {
            if let Err(e) = self.panes.kill_pane(&pane_id).await {
                warn!(worker, pane = %pane_id, error = %e, "Could not kill pane after failed handshake");
            }
            return Err(ShepherdError::Pane(format!(
                "{worker} did not accept its prompt after {} attempts",
                self.config.policy.send_keys_attempts
            )));
        }
        Ok(pane_id)
    }

    async fn write_prompt(&self, worker: &str, task: &Task) -> ShepherdResult<PathBuf> {
        let overlay = match tokio::fs::read_to_string(self.store.paths.overlay_file(worker)).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let inbox = self.store.mailbox.read_inbox(worker).await?;
        let task_id = task.id.to_string();
        let done = self.shepherd_command(&[
            "done",
            "--team",
            self.store.paths.team(),
            "--worker",
            worker,
            "--task",
            &task_id,
        ]);
        let prompt = self.renderer.render(&PromptContext {
            worker,
            team: self.store.paths.team(),
            task,
            overlay: overlay.as_deref(),
            inbox: &inbox,
            completion: Completion::DoneCommand(done),
        });
        let path = self.store.paths.prompt_file(worker);
        write_atomic(&path, prompt.as_bytes()).await?;
        Ok(path)
    }
}

#[async_trait]
impl WorkerSpawner for PaneSpawner {
    async fn spawn(
        &self,
        worker: &str,
        provider: &str,
        leader_pane: &str,
    ) -> ShepherdResult<Option<Spawned>> {
        match self.config.provider(provider).mode {
            LaunchMode::Bridge => self.spawn_bridge(worker, provider, leader_pane).await.map(Some),
            LaunchMode::Interactive => self.spawn_interactive(worker, provider, leader_pane).await,
        }
    }
}
