use crate::task::{Task, TaskId};
use crate::{ShepherdError, ShepherdResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level runtime configuration, read from `shepherd.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShepherdConfig {
    /// Parent of every team directory. Defaults to `.shepherd`.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// The `[policy]` table.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Agent CLIs by name. Built-in entries are merged in under any missing key.
    #[serde(default = "default_providers")]
    pub providers: HashMap<String, ProviderConfig>,
    /// The `[permissions]` table.
    #[serde(default)]
    pub permissions: PermissionConfig,
    /// The `[gate]` table.
    #[serde(default)]
    pub gate: GateConfig,
}

impl Default for ShepherdConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            policy: PolicyConfig::default(),
            providers: default_providers(),
            permissions: PermissionConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

impl ShepherdConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> ShepherdResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ShepherdError::Config(format!(
                "failed to read '{}': {e}",
                path.display()
            ))),
        }
    }

    /// Parse a config document. Built-in providers fill any name the document omits.
    pub fn from_toml_str(text: &str) -> ShepherdResult<Self> {
        let mut config: Self =
            toml::from_str(text).map_err(|e| ShepherdError::Config(e.to_string()))?;
        // Built-in providers stay available unless the file overrides them by name.
        for (name, provider) in default_providers() {
            config.providers.entry(name).or_insert(provider);
        }
        Ok(config)
    }

    /// Launch settings for `name`. Unknown providers run `name` itself with no extra args.
    pub fn provider(&self, name: &str) -> ProviderConfig {
        self.providers
            .get(name)
            .cloned()
            .unwrap_or_else(|| ProviderConfig {
                command: name.to_string(),
                args: Vec::new(),
                mode: LaunchMode::Bridge,
            })
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./.shepherd")
}

fn default_providers() -> HashMap<String, ProviderConfig> {
    let mut providers = HashMap::new();
    providers.insert(
        "claude".to_string(),
        ProviderConfig {
            command: "claude".into(),
            args: vec!["-p".into()],
            mode: LaunchMode::Bridge,
        },
    );
    providers.insert(
        "codex".to_string(),
        ProviderConfig {
            command: "codex".into(),
            args: vec!["exec".into(), "-".into()],
            mode: LaunchMode::Bridge,
        },
    );
    providers.insert(
        "gemini".to_string(),
        ProviderConfig {
            command: "gemini".into(),
            args: Vec::new(),
            mode: LaunchMode::Bridge,
        },
    );
    providers
}

/// Timing and threshold constants shared by the lead and the workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Age after which a lock is reclaimable regardless of its holder's liveness.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
    /// Tries per lock acquisition.
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,
    /// Pause between lock tries.
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
    /// Heartbeat age after which a worker counts as unresponsive.
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,
    /// Consecutive stale observations before a worker is treated as dead.
    #[serde(default = "default_kill_threshold")]
    pub kill_threshold: u32,
    /// Failed attempts allowed per task before it fails for good.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Watchdog sweep period.
    #[serde(default = "default_watchdog_tick_ms")]
    pub watchdog_tick_ms: u64,
    /// Consecutive failed sweeps before the watchdog gives up.
    #[serde(default = "default_watchdog_max_errors")]
    pub watchdog_max_errors: u32,
    /// Bridge daemon poll period.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Wall-clock limit for one agent run.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL for an agent subprocess.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// How long shutdown waits for bridge acknowledgements.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Consecutive failed ticks before a bridge quarantines itself.
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,
    /// Lead supervision period.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Legacy mailbox log size that triggers compaction.
    #[serde(default = "default_mailbox_max_bytes")]
    pub mailbox_max_bytes: u64,
    /// Legacy mailbox line count that triggers compaction.
    #[serde(default = "default_mailbox_max_lines")]
    pub mailbox_max_lines: usize,
    /// Cap on any single task field in a rendered prompt.
    #[serde(default = "default_prompt_max_field_chars")]
    pub prompt_max_field_chars: usize,
    /// Cap on a whole rendered prompt.
    #[serde(default = "default_prompt_max_chars")]
    pub prompt_max_chars: usize,
    /// Enter presses tried before typed input counts as undelivered.
    #[serde(default = "default_send_keys_attempts")]
    pub send_keys_attempts: u32,
    /// Wait after each key send before checking the pane.
    #[serde(default = "default_send_keys_grace_ms")]
    pub send_keys_grace_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            lock_stale_secs: default_lock_stale_secs(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            heartbeat_stale_secs: default_heartbeat_stale_secs(),
            kill_threshold: default_kill_threshold(),
            max_retries: default_max_retries(),
            watchdog_tick_ms: default_watchdog_tick_ms(),
            watchdog_max_errors: default_watchdog_max_errors(),
            poll_interval_ms: default_poll_interval_ms(),
            agent_timeout_secs: default_agent_timeout_secs(),
            kill_grace_ms: default_kill_grace_ms(),
            ack_timeout_secs: default_ack_timeout_secs(),
            quarantine_threshold: default_quarantine_threshold(),
            monitor_interval_ms: default_monitor_interval_ms(),
            mailbox_max_bytes: default_mailbox_max_bytes(),
            mailbox_max_lines: default_mailbox_max_lines(),
            prompt_max_field_chars: default_prompt_max_field_chars(),
            prompt_max_chars: default_prompt_max_chars(),
            send_keys_attempts: default_send_keys_attempts(),
            send_keys_grace_ms: default_send_keys_grace_ms(),
        }
    }
}

impl PolicyConfig {
    /// [`Self::lock_stale_secs`] as a duration.
    pub fn lock_stale_age(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    /// [`Self::lock_retry_delay_ms`] as a duration.
    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    /// [`Self::heartbeat_stale_secs`] as a duration.
    pub fn heartbeat_stale(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }

    /// [`Self::watchdog_tick_ms`] as a duration.
    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.watchdog_tick_ms)
    }

    /// [`Self::poll_interval_ms`] as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// [`Self::agent_timeout_secs`] as a duration.
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    /// [`Self::kill_grace_ms`] as a duration.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// [`Self::ack_timeout_secs`] as a duration.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    /// [`Self::monitor_interval_ms`] as a duration.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// [`Self::send_keys_grace_ms`] as a duration.
    pub fn send_keys_grace(&self) -> Duration {
        Duration::from_millis(self.send_keys_grace_ms)
    }
}

fn default_lock_stale_secs() -> u64 {
    30
}
fn default_lock_retry_attempts() -> u32 {
    40
}
fn default_lock_retry_delay_ms() -> u64 {
    50
}
fn default_heartbeat_stale_secs() -> u64 {
    60
}
fn default_kill_threshold() -> u32 {
    3
}
fn default_max_retries() -> u32 {
    5
}
fn default_watchdog_tick_ms() -> u64 {
    1_000
}
fn default_watchdog_max_errors() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_agent_timeout_secs() -> u64 {
    1_800
}
fn default_kill_grace_ms() -> u64 {
    5_000
}
fn default_ack_timeout_secs() -> u64 {
    15
}
fn default_quarantine_threshold() -> u32 {
    3
}
fn default_monitor_interval_ms() -> u64 {
    2_000
}
fn default_mailbox_max_bytes() -> u64 {
    256 * 1024
}
fn default_mailbox_max_lines() -> usize {
    2_000
}
fn default_prompt_max_field_chars() -> usize {
    8_000
}
fn default_prompt_max_chars() -> usize {
    32_000
}
fn default_send_keys_attempts() -> u32 {
    3
}
fn default_send_keys_grace_ms() -> u64 {
    800
}

/// How a provider's CLI is hosted inside a worker pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// The pane runs `shepherd bridge`, which invokes the CLI once per task.
    #[default]
    Bridge,
    /// The pane runs the CLI directly; the lead types the prompt into it.
    Interactive,
}

/// How to launch one agent CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Executable, looked up on `PATH`.
    pub command: String,
    /// Arguments placed before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    /// Whether panes run a bridge or the CLI itself.
    #[serde(default)]
    pub mode: LaunchMode,
}

/// Write-permission enforcement level applied after a successful agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// No checks.
    #[default]
    Off,
    /// Log violations, still complete the task.
    Audit,
    /// Fail the task permanently on a violation.
    Enforce,
}

/// Which paths a worker may write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Enforcement level.
    #[serde(default)]
    pub mode: PermissionMode,
    /// Glob patterns a worker may write. Empty means everything not denied.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Glob patterns a worker must never write. Deny wins over allow.
    #[serde(default)]
    pub deny: Vec<String>,
    /// Paths excluded from snapshots entirely.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            mode: PermissionMode::Off,
            allow: Vec::new(),
            deny: Vec::new(),
            ignore: default_ignore(),
        }
    }
}

fn default_ignore() -> Vec<String> {
    vec![".git/**".into(), "target/**".into(), "node_modules/**".into()]
}

/// Thresholds for the run-quality readiness gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Run the gate when all tasks complete.
    #[serde(default)]
    pub enabled: bool,
    /// JSONL quality log. The gate passes trivially without one.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Minimum share of passing records.
    #[serde(default = "default_min_pass_rate")]
    pub min_pass_rate: f64,
    /// Maximum share of timed-out records.
    #[serde(default = "default_max_timeout_rate")]
    pub max_timeout_rate: f64,
    /// Maximum share of warn or fail records.
    #[serde(default = "default_max_warn_fail_rate")]
    pub max_warn_fail_rate: f64,
    /// Minimum share of non-passing records that carry a reason.
    #[serde(default = "default_min_reason_coverage")]
    pub min_reason_coverage: f64,
    /// Records needed before the gate can decide.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// How long to wait for enough records.
    #[serde(default = "default_gate_timeout_secs")]
    pub timeout_secs: u64,
    /// Re-read period while waiting.
    #[serde(default = "default_gate_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: None,
            min_pass_rate: default_min_pass_rate(),
            max_timeout_rate: default_max_timeout_rate(),
            max_warn_fail_rate: default_max_warn_fail_rate(),
            min_reason_coverage: default_min_reason_coverage(),
            min_samples: default_min_samples(),
            timeout_secs: default_gate_timeout_secs(),
            poll_interval_ms: default_gate_poll_ms(),
        }
    }
}

fn default_min_pass_rate() -> f64 {
    0.8
}
fn default_max_timeout_rate() -> f64 {
    0.1
}
fn default_max_warn_fail_rate() -> f64 {
    0.2
}
fn default_min_reason_coverage() -> f64 {
    0.9
}
fn default_min_samples() -> usize {
    1
}
fn default_gate_timeout_secs() -> u64 {
    30
}
fn default_gate_poll_ms() -> u64 {
    1_000
}

/// Task store backend for a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Lock files beside JSON records.
    #[default]
    Legacy,
    /// Claim tokens and one-file-per-message mailboxes.
    Structured,
}

/// A team definition, read from `team.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamSpec {
    /// Team name. Also names the session and team directory.
    pub name: String,
    /// Number of worker panes.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Default provider for every worker.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Per-worker provider overrides by position; missing entries fall back to `provider`.
    #[serde(default)]
    pub worker_providers: Vec<String>,
    /// Task store backend for a new team.
    #[serde(default)]
    pub backend: Backend,
    /// Directory the workers run in.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// Extra instructions written into every worker's overlay.
    #[serde(default)]
    pub overlay: Option<String>,
    /// Tasks to seed, numbered from 1 in order.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// A task entry in a team definition. `blocked_by` holds 1-based task positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// One-line title.
    pub subject: String,
    /// Full instructions for the worker.
    #[serde(default)]
    pub description: String,
    /// Positions of the tasks this one waits for.
    #[serde(default)]
    pub blocked_by: Vec<u64>,
}

fn default_workers() -> usize {
    2
}
fn default_provider() -> String {
    "claude".to_string()
}
fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

impl TeamSpec {
    /// Read and validate a team file.
    pub async fn load(path: &Path) -> ShepherdResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ShepherdError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a team definition.
    pub fn from_toml_str(text: &str) -> ShepherdResult<Self> {
        let spec: Self = toml::from_str(text).map_err(|e| ShepherdError::Config(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Reject definitions that could never finish: no workers, bad references, cycles.
    pub fn validate(&self) -> ShepherdResult<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ShepherdError::Config(format!(
                "invalid team name '{}': use letters, digits, '-' or '_'",
                self.name
            )));
        }
        if self.workers == 0 {
            return Err(ShepherdError::Config("a team needs at least one worker".into()));
        }
        if self.tasks.is_empty() {
            return Err(ShepherdError::Config("a team needs at least one task".into()));
        }
        let count = self.tasks.len() as u64;
        for (index, task) in self.tasks.iter().enumerate() {
            let id = index as u64 + 1;
            if task.subject.trim().is_empty() {
                return Err(ShepherdError::Config(format!("task {id} has an empty subject")));
            }
            for &dep in &task.blocked_by {
                if dep == 0 || dep > count {
                    return Err(ShepherdError::Config(format!(
                        "task {id} is blocked by unknown task {dep}"
                    )));
                }
                if dep == id {
                    return Err(ShepherdError::Config(format!("task {id} blocks itself")));
                }
            }
        }
        if self.has_cycle() {
            return Err(ShepherdError::Config(
                "task dependencies contain a cycle".into(),
            ));
        }
        Ok(())
    }

    /// Detect dependency cycles with a three-colour DFS.
    pub fn has_cycle(&self) -> bool {
        let mut marks = vec![0u8; self.tasks.len()];
        (0..self.tasks.len()).any(|index| self.dfs_cycle(index, &mut marks))
    }

    fn dfs_cycle(&self, index: usize, marks: &mut [u8]) -> bool {
        match marks[index] {
            1 => return true,
            2 => return false,
            _ => {}
        }
        marks[index] = 1;
        for &dep in &self.tasks[index].blocked_by {
            let dep_index = dep.saturating_sub(1) as usize;
            if dep_index < self.tasks.len() && self.dfs_cycle(dep_index, marks) {
                return true;
            }
        }
        marks[index] = 2;
        false
    }

    /// Worker names in spawn order: `worker-1` .. `worker-N`.
    pub fn worker_names(&self) -> Vec<String> {
        (1..=self.workers).map(|i| format!("worker-{i}")).collect()
    }

    /// Provider name for the worker at zero-based `index`.
    pub fn provider_for(&self, index: usize) -> &str {
        self.worker_providers
            .get(index)
            .map(String::as_str)
            .unwrap_or(&self.provider)
    }

    /// Every distinct provider the team will launch.
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = (0..self.workers).map(|i| self.provider_for(i)).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Pending, unowned task records in id order.
    pub fn seed_tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                Task::new(
                    TaskId(index as u64 + 1),
                    spec.subject.clone(),
                    spec.description.clone(),
                )
                .with_blocked_by(spec.blocked_by.iter().copied().map(TaskId).collect())
            })
            .collect()
    }
}
