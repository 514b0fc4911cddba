use crate::prompt::{Completion, PromptContext, PromptRenderer};
use crate::runner::{AgentCommand, AgentOutcome, AgentRunner};
use chrono::Utc;
use shepherd_core::fsio::write_atomic;
use shepherd_core::{
    Heartbeat, InboxMessage, OutboxMessage, PermissionConfig, PolicyConfig, ShepherdConfig,
    ShepherdError, ShepherdResult, Signal, Task, TaskId, WorkerStatus,
};
use shepherd_security::{PolicyVerdict, WritePolicy};
use shepherd_store::{ClaimChange, Decision, FailureClass, Observation, TeamStore};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Everything a bridge daemon needs besides the team store.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Name the daemon claims and reports under.
    pub worker: String,
    /// Provider key, recorded in the heartbeat.
    pub provider: String,
    /// Agent invocation, run once per task.
    pub command: AgentCommand,
    /// Timing and threshold settings.
    pub policy: PolicyConfig,
    /// Write checks applied after each successful run.
    pub permissions: PermissionConfig,
}

impl BridgeOptions {
    /// Resolve `provider` from `config` and run it in `cwd`.
    pub fn from_config(
        config: &ShepherdConfig,
        worker: impl Into<String>,
        provider: impl Into<String>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        let provider = provider.into();
        let resolved = config.provider(&provider);
        Self {
            worker: worker.into(),
            command: AgentCommand::new(resolved.command, resolved.args, cwd),
            provider,
            policy: config.policy.clone(),
            permissions: config.permissions.clone(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to claim.
    Idle,
    /// A task was claimed and its attempt resolved.
    Ran(TaskId),
    /// Claiming is suspended after repeated errors.
    Quarantined,
    /// The tick hit an I/O error; it was logged and counted. A claim taken
    /// during the tick was handed back to the retry policy.
    Error,
    /// The daemon acted on a shutdown or drain signal and must exit.
    Shutdown,
}

/// Per-worker loop: claim a task, run the agent on it, record the result.
pub struct BridgeDaemon {
    store: TeamStore,
    worker: String,
    command: AgentCommand,
    runner: AgentRunner,
    renderer: PromptRenderer,
    write_policy: WritePolicy,
    policy: PolicyConfig,
    heartbeat: Heartbeat,
    ready_reported: bool,
    idle_reported: bool,
    quarantined: bool,
    pending_inbox: Vec<InboxMessage>,
}

impl BridgeDaemon {
    /// Fails only on an invalid permission glob.
    pub fn new(store: TeamStore, options: BridgeOptions) -> ShepherdResult<Self> {
        let write_policy = WritePolicy::from_config(&options.permissions)?;
        let heartbeat = Heartbeat::new(&options.worker, store.paths.team(), &options.provider);
        Ok(Self {
            runner: AgentRunner::new(options.policy.agent_timeout(), options.policy.kill_grace()),
            renderer: PromptRenderer::from_policy(&options.policy),
            worker: options.worker,
            command: options.command,
            policy: options.policy,
            write_policy,
            heartbeat,
            store,
            ready_reported: false,
            idle_reported: false,
            quarantined: false,
            pending_inbox: Vec::new(),
        })
    }

    /// Worker name.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Failed ticks in a row. Reset by any tick that succeeds.
    pub fn consecutive_errors(&self) -> u32 {
        self.heartbeat.consecutive_errors
    }

    /// Tick until a shutdown or drain signal is handled.
    pub async fn run(mut self) -> ShepherdResult<()> {
        info!(
            worker = %self.worker,
            team = %self.store.paths.team(),
            backend = ?self.store.backend,
            "Bridge daemon started"
        );
        loop {
            if self.tick().await == TickOutcome::Shutdown {
                break;
            }
            tokio::time::sleep(self.policy.poll_interval()).await;
        }
        info!(worker = %self.worker, "Bridge daemon stopped");
        Ok(())
    }

    /// Run one poll cycle. Errors are logged and counted, never returned.
    pub async fn tick(&mut self) -> TickOutcome {
        match self.try_tick().await {
            Ok(outcome) => {
                if !matches!(outcome, TickOutcome::Quarantined) {
                    self.heartbeat.consecutive_errors = 0;
                }
                outcome
            }
            Err(e) => {
                self.heartbeat.consecutive_errors += 1;
                error!(
                    worker = %self.worker,
                    consecutive_errors = self.heartbeat.consecutive_errors,
                    error = %e,
                    "Bridge tick failed"
                );
                TickOutcome::Error
            }
        }
    }

    async fn try_tick(&mut self) -> ShepherdResult<TickOutcome> {
        // Work runs inside the tick, so nothing is executing at this point
        // and a drain can stop as promptly as a shutdown.
        if let Some((signal, kind)) = self.stop_signal().await? {
            self.shut_down(&signal, kind).await?;
            return Ok(TickOutcome::Shutdown);
        }

        if self.quarantined {
            return Ok(TickOutcome::Quarantined);
        }
        if self.heartbeat.consecutive_errors >= self.policy.quarantine_threshold {
            self.quarantine().await?;
            return Ok(TickOutcome::Quarantined);
        }

        self.beat(WorkerStatus::Polling, None).await?;
        if !self.ready_reported {
            self.report(OutboxMessage::ready(format!("{} is ready", self.worker)))
                .await?;
            self.ready_reported = true;
        }

        let inbox = self.store.mailbox.read_inbox(&self.worker).await?;
        if !inbox.is_empty() {
            debug!(worker = %self.worker, count = inbox.len(), "Inbox messages received");
            self.pending_inbox.extend(inbox);
        }

        let Some(task) = self.store.tasks.find_next_task(&self.worker).await? else {
            if !self.idle_reported {
                self.report(OutboxMessage::idle("no eligible tasks")).await?;
                self.idle_reported = true;
            }
            self.store.mailbox.prune(&self.worker).await?;
            return Ok(TickOutcome::Idle);
        };
        self.idle_reported = false;

        match self.work_on(task.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.abandon_claim(&task, &e).await;
                Err(e)
            }
        }
    }

    /// Everything between claiming `task` and resolving it. An error here
    /// leaves the claim for [`Self::abandon_claim`] to hand back.
    async fn work_on(&mut self, task: Task) -> ShepherdResult<TickOutcome> {
        // A shutdown or drain that landed between the claim and the spawn.
        if let Some((signal, kind)) = self.stop_signal().await? {
            self.release_claim(&task).await?;
            self.shut_down(&signal, kind).await?;
            return Ok(TickOutcome::Shutdown);
        }

        let outcome = self.execute(task).await?;
        if outcome != TickOutcome::Shutdown {
            self.store.mailbox.prune(&self.worker).await?;
            self.beat(WorkerStatus::Polling, None).await?;
        }
        Ok(outcome)
    }

    /// A pending shutdown wins over a pending drain.
    async fn stop_signal(&self) -> ShepherdResult<Option<(Signal, &'static str)>> {
        if let Some(signal) = self.store.signals.shutdown_signal(&self.worker).await? {
            return Ok(Some((signal, "shutdown")));
        }
        Ok(self
            .store
            .signals
            .drain_signal(&self.worker)
            .await?
            .map(|signal| (signal, "drain")))
    }

    /// Count a bridge-side error against the claimed task so it goes back to
    /// the pool instead of sitting in progress under a live worker. A no-op
    /// when the task was already resolved before the error.
    async fn abandon_claim(&self, task: &Task, cause: &ShepherdError) {
        let observation = Observation::new(task.id, &self.worker, task.assigned_at);
        let reason = format!("bridge error: {cause}");
        match self
            .store
            .retry
            .handle_failure(&observation, &reason, FailureClass::Transient)
            .await
        {
            Ok(Decision::Skipped { .. }) => {}
            Ok(decision) => warn!(
                worker = %self.worker,
                task_id = %task.id,
                decision = ?decision,
                "Claim handed back after a bridge error"
            ),
            Err(e) => error!(
                worker = %self.worker,
                task_id = %task.id,
                error = %e,
                "Could not hand back the claim"
            ),
        }
    }

    async fn execute(&mut self, task: Task) -> ShepherdResult<TickOutcome> {
        let id = task.id;
        info!(worker = %self.worker, task_id = %id, subject = %task.subject, "Task claimed");

        let overlay = self.read_overlay().await?;
        let inbox = std::mem::take(&mut self.pending_inbox);
        let prompt = self.renderer.render(&PromptContext {
            worker: &self.worker,
            team: self.store.paths.team(),
            task: &task,
            overlay: overlay.as_deref(),
            inbox: &inbox,
            completion: Completion::Exit,
        });
        write_atomic(&self.store.paths.prompt_file(&self.worker), prompt.as_bytes()).await?;

        let before = self.write_policy.snapshot(&self.command.cwd).await?;
        self.beat(WorkerStatus::Executing, Some(id)).await?;
        let outcome = self.run_agent(&task, &prompt).await;

        if outcome.was_cancelled() {
            self.release_claim(&task).await?;
            if let Some(signal) = self.store.signals.shutdown_signal(&self.worker).await? {
                self.shut_down(&signal, "shutdown").await?;
                return Ok(TickOutcome::Shutdown);
            }
            return Ok(TickOutcome::Ran(id));
        }

        let observation = Observation::new(id, &self.worker, task.assigned_at);
        if outcome.is_success() {
            let verdict = self
                .write_policy
                .evaluate(&self.command.cwd, before.as_ref(), &self.worker)
                .await?;
            if let PolicyVerdict::Violated(paths) = verdict {
                let error = format!("wrote outside the permitted paths: {}", paths.join(", "));
                let decision = self
                    .store
                    .retry
                    .handle_failure(&observation, &error, FailureClass::Permanent)
                    .await?;
                self.report_decision(id, &error, decision).await?;
                return Ok(TickOutcome::Ran(id));
            }

            let summary = outcome.summary(self.policy.prompt_max_field_chars);
            if self.complete_task(&task, &summary).await? {
                info!(
                    worker = %self.worker,
                    task_id = %id,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Task completed"
                );
                self.report(OutboxMessage::task_complete(id, summary)).await?;
            }
        } else {
            let error = outcome.failure_reason();
            warn!(worker = %self.worker, task_id = %id, error = %error, "Agent run failed");
            let decision = self
                .store
                .retry
                .handle_failure(&observation, &error, FailureClass::Transient)
                .await?;
            self.report_decision(id, &error, decision).await?;
        }
        Ok(TickOutcome::Ran(id))
    }

    /// Run the agent while refreshing the heartbeat and watching for shutdown.
    async fn run_agent(&mut self, task: &Task, prompt: &str) -> AgentOutcome {
        let command = self
            .command
            .clone()
            .with_env("SHEPHERD_TEAM", self.store.paths.team())
            .with_env("SHEPHERD_WORKER", self.worker.as_str())
            .with_env("SHEPHERD_TASK_ID", task.id.to_string());
        let runner = self.runner;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let agent = runner.run(&command, prompt, cancel_rx);
        tokio::pin!(agent);

        let mut refresh = tokio::time::interval(self.policy.poll_interval());
        refresh.tick().await;
        loop {
            tokio::select! {
                outcome = &mut agent => return outcome,
                _ = refresh.tick() => {
                    self.heartbeat.last_poll_at = Utc::now();
                    if let Err(e) = self.store.heartbeats.write(&self.heartbeat).await {
                        warn!(worker = %self.worker, error = %e, "Heartbeat refresh failed");
                    }
                    let already_cancelled = *cancel_tx.borrow();
                    match self.store.signals.shutdown_signal(&self.worker).await {
                        Ok(Some(_)) if !already_cancelled => {
                            info!(worker = %self.worker, task_id = %task.id, "Shutdown requested, stopping agent");
                            let _ = cancel_tx.send(true);
                        }
                        Ok(_) => {}
                        Err(e) => warn!(worker = %self.worker, error = %e, "Signal check failed"),
                    }
                }
            }
        }
    }

    async fn report_decision(&self, id: TaskId, error: &str, decision: Decision) -> ShepherdResult<()> {
        let message = match decision {
            Decision::Requeued { retry_count } => format!(
                "{error} (attempt {retry_count} of {}, will retry)",
                self.store.retry.max_retries()
            ),
            Decision::Failed { reason, .. } => format!("{reason}; no further attempts"),
            Decision::Skipped { reason } => {
                debug!(worker = %self.worker, task_id = %id, reason = %reason, "Failure already resolved");
                return Ok(());
            }
        };
        self.report(OutboxMessage::task_failed(id, message)).await
    }

    async fn complete_task(&self, claimed: &Task, summary: &str) -> ShepherdResult<bool> {
        let updated = self
            .store
            .tasks
            .update_claimed(
                claimed.id,
                &self.worker,
                claimed.assigned_at,
                ClaimChange::Complete(Some(summary.to_string())),
            )
            .await?;
        if updated.is_none() {
            warn!(
                worker = %self.worker,
                task_id = %claimed.id,
                "Task was resolved elsewhere while the agent ran; result discarded"
            );
        }
        Ok(updated.is_some())
    }

    /// Put a claimed task back to pending without counting a failure.
    async fn release_claim(&self, claimed: &Task) -> ShepherdResult<()> {
        let released = self
            .store
            .tasks
            .update_claimed(claimed.id, &self.worker, claimed.assigned_at, ClaimChange::Release)
            .await?;
        if released.is_some() {
            info!(worker = %self.worker, task_id = %claimed.id, "Claim released");
        }
        Ok(())
    }

    async fn shut_down(&mut self, signal: &Signal, kind: &str) -> ShepherdResult<()> {
        info!(worker = %self.worker, request_id = %signal.request_id, reason = %signal.reason, kind, "Shutting down");
        self.store
            .signals
            .acknowledge(&self.worker, &signal.request_id)
            .await?;
        self.report(OutboxMessage::shutdown_ack(&signal.request_id))
            .await?;
        self.store.registry.unregister(&self.worker).await?;
        self.store.signals.clear(&self.worker).await?;
        self.beat(WorkerStatus::Shutdown, None).await
    }

    async fn quarantine(&mut self) -> ShepherdResult<()> {
        warn!(
            worker = %self.worker,
            consecutive_errors = self.heartbeat.consecutive_errors,
            "Worker quarantined"
        );
        self.quarantined = true;
        self.beat(WorkerStatus::Quarantined, None).await?;
        self.report(OutboxMessage::error(format!(
            "quarantined after {} consecutive errors",
            self.heartbeat.consecutive_errors
        )))
        .await
    }

    async fn beat(&mut self, status: WorkerStatus, task: Option<TaskId>) -> ShepherdResult<()> {
        self.heartbeat.status = status;
        self.heartbeat.current_task_id = task;
        self.heartbeat.last_poll_at = Utc::now();
        self.store.heartbeats.write(&self.heartbeat).await
    }

    async fn report(&self, message: OutboxMessage) -> ShepherdResult<()> {
        self.store.mailbox.report(&self.worker, &message).await
    }

    async fn read_overlay(&self) -> ShepherdResult<Option<String>> {
        match tokio::fs::read_to_string(self.store.paths.overlay_file(&self.worker)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
