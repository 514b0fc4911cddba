//! Readiness gate run once a team reports every task completed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shepherd_core::{GateConfig, ShepherdError, ShepherdResult};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Aggregates over a run-quality log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    /// Log records considered.
    pub samples: usize,
    /// Share of passing records.
    pub pass_rate: f64,
    /// Share of timed-out records.
    pub timeout_rate: f64,
    /// Share of warn or fail records.
    pub warn_fail_rate: f64,
    /// Share of non-passing entries that carry a reason.
    pub reason_coverage: f64,
}

/// Verdict of a [`ReadinessGate`] check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    /// Whether the run may be reported as a success.
    pub passed: bool,
    /// Aggregates the verdict was based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<QualityMetrics>,
    /// One line per threshold that was missed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

impl GateReport {
    /// An unconditional pass with no metrics.
    pub fn pass() -> Self {
        Self {
            passed: true,
            metrics: None,
            violations: Vec::new(),
        }
    }

    /// One line suitable as a run failure reason.
    pub fn summary(&self) -> String {
        if self.passed {
            "readiness gate passed".to_string()
        } else {
            format!("readiness gate failed: {}", self.violations.join("; "))
        }
    }
}

/// Final check between "all tasks completed" and a successful run.
#[async_trait]
pub trait ReadinessGate: Send + Sync {
    async fn check(&self) -> ShepherdResult<GateReport>;
}

/// Always passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGate;

#[async_trait]
impl ReadinessGate for NoopGate {
    async fn check(&self) -> ShepherdResult<GateReport> {
        Ok(GateReport::pass())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryStatus {
    Pass,
    Warn,
    Fail,
    Timeout,
}

#[derive(Debug, Deserialize)]
struct QualityEntry {
    status: EntryStatus,
    #[serde(default)]
    reason: Option<String>,
}

/// Gate over a JSONL log of `{"status": "pass"|"warn"|"fail"|"timeout", "reason": ...}`.
///
/// The log is polled with exponential backoff until it holds `min_samples`
/// entries or `timeout_secs` elapse. Thresholds are then checked once.
#[derive(Debug, Clone)]
pub struct QualityLogGate {
    path: PathBuf,
    config: GateConfig,
}

impl QualityLogGate {
    /// Gate reading the log at `path` against `config`'s thresholds.
    pub fn new(path: impl Into<PathBuf>, config: GateConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    /// Gate configured by `[gate]`; [`NoopGate`] when disabled or without a log.
    pub fn from_config(config: &GateConfig) -> Box<dyn ReadinessGate> {
        match (&config.log_path, config.enabled) {
            (Some(path), true) => Box::new(Self::new(path, config.clone())),
            _ => Box::new(NoopGate),
        }
    }

    async fn read_entries(&self) -> ShepherdResult<Vec<QualityEntry>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ShepherdError::Gate(format!(
                    "failed to read '{}': {e}",
                    self.path.display()
                )))
            }
        };
        let mut entries = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<QualityEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed quality entry"),
            }
        }
        Ok(entries)
    }

    fn evaluate(&self, metrics: &QualityMetrics) -> Vec<String> {
        let mut violations = Vec::new();
        if metrics.pass_rate < self.config.min_pass_rate {
            violations.push(format!(
                "pass rate {:.2} below {:.2}",
                metrics.pass_rate, self.config.min_pass_rate
            ));
        }
        if metrics.timeout_rate > self.config.max_timeout_rate {
            violations.push(format!(
                "timeout rate {:.2} above {:.2}",
                metrics.timeout_rate, self.config.max_timeout_rate
            ));
        }
        if metrics.warn_fail_rate > self.config.max_warn_fail_rate {
            violations.push(format!(
                "warn/fail rate {:.2} above {:.2}",
                metrics.warn_fail_rate, self.config.max_warn_fail_rate
            ));
        }
        if metrics.reason_coverage < self.config.min_reason_coverage {
            violations.push(format!(
                "reason coverage {:.2} below {:.2}",
                metrics.reason_coverage, self.config.min_reason_coverage
            ));
        }
        violations
    }
}

#[async_trait]
impl ReadinessGate for QualityLogGate {
    async fn check(&self) -> ShepherdResult<GateReport> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_secs);
        let mut attempt = 0u32;
        let entries = loop {
            let entries = self.read_entries().await?;
            if entries.len() >= self.config.min_samples.max(1) {
                break entries;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(GateReport {
                    passed: false,
                    metrics: (!entries.is_empty()).then(|| compute_metrics(&entries)),
                    violations: vec![format!(
                        "only {} of {} required samples in '{}'",
                        entries.len(),
                        self.config.min_samples.max(1),
                        self.path.display()
                    )],
                });
            }
            let delay = backoff(self.config.poll_interval_ms, attempt).min(deadline - now);
            debug!(samples = entries.len(), delay_ms = delay.as_millis() as u64, "Waiting for quality samples");
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        let metrics = compute_metrics(&entries);
        let violations = self.evaluate(&metrics);
        let report = GateReport {
            passed: violations.is_empty(),
            metrics: Some(metrics),
            violations,
        };
        info!(passed = report.passed, samples = entries.len(), "Readiness gate evaluated");
        Ok(report)
    }
}

fn compute_metrics(entries: &[QualityEntry]) -> QualityMetrics {
    let samples = entries.len();
    let count = |pred: &dyn Fn(&QualityEntry) -> bool| entries.iter().filter(|e| pred(e)).count();
    let pass = count(&|e| e.status == EntryStatus::Pass);
    let timeout = count(&|e| e.status == EntryStatus::Timeout);
    let warn_fail = count(&|e| matches!(e.status, EntryStatus::Warn | EntryStatus::Fail));
    let non_pass = samples - pass;
    let explained = count(&|e| {
        e.status != EntryStatus::Pass && e.reason.as_deref().is_some_and(|r| !r.trim().is_empty())
    });
    let rate = |n: usize, of: usize| if of == 0 { 0.0 } else { n as f64 / of as f64 };
    QualityMetrics {
        samples,
        pass_rate: rate(pass, samples),
        timeout_rate: rate(timeout, samples),
        warn_fail_rate: rate(warn_fail, samples),
        reason_coverage: if non_pass == 0 {
            1.0
        } else {
            rate(explained, non_pass)
        },
    }
}

/// `base * 2^attempt`, capped at eight times the base.
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let delay = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(delay.min(base_ms.saturating_mul(8)))
}
