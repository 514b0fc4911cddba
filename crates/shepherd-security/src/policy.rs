use crate::snapshot::{build_globset, TreeDiff, TreeSnapshot};
use globset::GlobSet;
use shepherd_core::{PermissionConfig, PermissionMode, ShepherdResult};
use std::path::Path;
use tracing::{info, warn};

/// Result of checking one agent run against the write policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Enforcement is off; nothing was checked.
    Skipped,
    /// Every written path is allowed.
    Clean,
    /// Violations were found and logged; the task still completes.
    Audited(Vec<String>),
    /// Violations were found and the task must fail permanently.
    Violated(Vec<String>),
}

impl PolicyVerdict {
    /// True only for [`PolicyVerdict::Violated`].
    pub fn is_violation(&self) -> bool {
        matches!(self, PolicyVerdict::Violated(_))
    }
}

/// Which paths a worker may write, checked by diffing the working tree
/// before and after the agent runs.
pub struct WritePolicy {
    mode: PermissionMode,
    allow: Option<GlobSet>,
    deny: GlobSet,
    ignore: Vec<String>,
}

impl WritePolicy {
    /// Compile the globs in `config`. Fails on an invalid pattern.
    pub fn from_config(config: &PermissionConfig) -> ShepherdResult<Self> {
        let allow = if config.allow.is_empty() {
            None
        } else {
            Some(build_globset(&config.allow)?)
        };
        Ok(Self {
            mode: config.mode,
            allow,
            deny: build_globset(&config.deny)?,
            ignore: config.ignore.clone(),
        })
    }

    /// Enforcement level.
    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    /// False when the mode is `off`, so no snapshots are needed.
    pub fn is_enabled(&self) -> bool {
        self.mode != PermissionMode::Off
    }

    /// Whether writing `path` (relative, `/`-separated) is permitted.
    pub fn is_allowed(&self, path: &str) -> bool {
        if self.deny.is_match(path) {
            return false;
        }
        self.allow.as_ref().map_or(true, |allow| allow.is_match(path))
    }

    /// Paths in `diff` that the policy forbids.
    pub fn violations(&self, diff: &TreeDiff) -> Vec<String> {
        diff.touched()
            .filter(|path| !self.is_allowed(path))
            .map(str::to_string)
            .collect()
    }

    /// Snapshot `root` before a run. `None` when enforcement is off.
    pub async fn snapshot(&self, root: &Path) -> ShepherdResult<Option<TreeSnapshot>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        Ok(Some(TreeSnapshot::capture(root, &self.ignore).await?))
    }

    /// Compare `root` against the `before` snapshot and judge the difference.
    pub async fn evaluate(
        &self,
        root: &Path,
        before: Option<&TreeSnapshot>,
        worker: &str,
    ) -> ShepherdResult<PolicyVerdict> {
        let Some(before) = before.filter(|_| self.is_enabled()) else {
            return Ok(PolicyVerdict::Skipped);
        };
        let after = TreeSnapshot::capture(root, &self.ignore).await?;
        let violations = self.violations(&before.diff(&after));
        if violations.is_empty() {
            return Ok(PolicyVerdict::Clean);
        }
        match self.mode {
            PermissionMode::Audit => {
                warn!(worker, paths = ?violations, "Write policy violations (audit only)");
                Ok(PolicyVerdict::Audited(violations))
            }
            PermissionMode::Enforce => {
                info!(worker, paths = ?violations, "Write policy violated");
                Ok(PolicyVerdict::Violated(violations))
            }
            PermissionMode::Off => Ok(PolicyVerdict::Skipped),
        }
    }
}
