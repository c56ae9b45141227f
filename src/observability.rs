use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::progress::StepStatus;

#[cfg(feature = "status-server")]
pub mod server;

/// How one invocation of a step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed { cause: String },
}

impl StepOutcome {
    fn status(&self) -> StepStatus {
        match self {
            Self::Completed => StepStatus::Completed,
            Self::Failed { .. } => StepStatus::Failed,
        }
    }
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub steps: BTreeMap<String, StepMetrics>,
    pub run_duration_ms: f64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    /// Step that stopped the run, if any.
    pub failed_step: Option<String>,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StepMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Terminal status of the latest invocation.
    pub status: Option<StepStatus>,
    pub failure: Option<String>,
}

/// Per-run step accounting shared between the runner and observers.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_step(&self, step: &str, elapsed: Duration, outcome: StepOutcome) {
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        let mut snapshot = self.lock();
        match &outcome {
            StepOutcome::Completed => snapshot.steps_completed += 1,
            StepOutcome::Failed { .. } => {
                snapshot.steps_failed += 1;
                snapshot.failed_step = Some(step.to_string());
            }
        }
        let entry = snapshot.steps.entry(step.to_string()).or_default();
        entry.calls += 1;
        entry.total_duration_ms += elapsed_ms;
        entry.max_duration_ms = entry.max_duration_ms.max(elapsed_ms);
        entry.status = Some(outcome.status());
        entry.failure = match outcome {
            StepOutcome::Completed => None,
            StepOutcome::Failed { cause } => Some(cause),
        };
        debug!(step, elapsed_ms, "Step recorded");
    }

    pub fn record_run_duration(&self, duration: Duration) {
        self.lock().run_duration_ms = duration.as_secs_f64() * 1_000.0;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }

    pub fn reset(&self) {
        *self.lock() = MetricsSnapshot::default();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        run_duration_ms = snapshot.run_duration_ms,
        steps_completed = snapshot.steps_completed,
        steps_failed = snapshot.steps_failed,
        failed_step = snapshot.failed_step.as_deref().unwrap_or("-"),
        "Provisioning metrics summary"
    );
    for (step, metrics) in &snapshot.steps {
        match &metrics.failure {
            Some(cause) => warn!(
                step = step.as_str(),
                total_ms = metrics.total_duration_ms,
                cause = cause.as_str(),
                "Step failed"
            ),
            None => info!(
                step = step.as_str(),
                calls = metrics.calls,
                total_ms = metrics.total_duration_ms,
                max_ms = metrics.max_duration_ms,
                "Step metrics"
            ),
        }
    }
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

impl MetricsSnapshot {
    /// Prometheus text exposition of the run.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        header(&mut out, "provision_steps_completed_total", "counter", "Steps that completed");
        let _ = writeln!(out, "provision_steps_completed_total {}", self.steps_completed);
        header(&mut out, "provision_steps_failed_total", "counter", "Steps that failed");
        let _ = writeln!(out, "provision_steps_failed_total {}", self.steps_failed);

        header(&mut out, "provision_step_calls_total", "counter", "Step invocations");
        for (step, metrics) in &self.steps {
            let _ = writeln!(
                out,
                "provision_step_calls_total{{step=\"{}\"}} {}",
                escape_label(step),
                metrics.calls
            );
        }
        header(
            &mut out,
            "provision_step_duration_seconds_total",
            "counter",
            "Accumulated step duration in seconds",
        );
        for (step, metrics) in &self.steps {
            let _ = writeln!(
                out,
                "provision_step_duration_seconds_total{{step=\"{}\"}} {:.6}",
                escape_label(step),
                metrics.total_duration_ms / 1_000.0
            );
        }
        header(
            &mut out,
            "provision_step_duration_seconds_max",
            "gauge",
            "Longest single step invocation in seconds",
        );
        for (step, metrics) in &self.steps {
            let _ = writeln!(
                out,
                "provision_step_duration_seconds_max{{step=\"{}\"}} {:.6}",
                escape_label(step),
                metrics.max_duration_ms / 1_000.0
            );
        }
        header(
            &mut out,
            "provision_step_status",
            "gauge",
            "1 for the terminal status of the latest step invocation",
        );
        for (step, metrics) in &self.steps {
            if let Some(status) = metrics.status {
                let _ = writeln!(
                    out,
                    "provision_step_status{{step=\"{}\",status=\"{status}\"}} 1",
                    escape_label(step)
                );
            }
        }
        header(&mut out, "provision_run_duration_seconds", "gauge", "Duration of the run");
        let _ = writeln!(
            out,
            "provision_run_duration_seconds {:.6}",
            self.run_duration_ms / 1_000.0
        );
        out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
