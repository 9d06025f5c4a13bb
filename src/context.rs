// dbvault/src/context.rs
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    Warning,
    Failed,
    Skipped,
}

impl StepStatus {
    fn label(self) -> &'static str {
        match self {
            StepStatus::Ok => "ok",
            StepStatus::Warning => "warning",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: &'static str,
    pub status: StepStatus,
    pub detail: String,
    pub elapsed: Duration,
}

/// Per-invocation state threaded through a pipeline.
///
/// Every run owns its context; nothing here is shared between runs, so two
/// pipelines against different targets can execute side by side.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub warnings: Vec<String>,
    step_started: Instant,
}

impl RunContext {
    pub fn new(namespace: &str) -> Self {
        let started_at = Utc::now();
        let run_id = format!(
            "{}_{}_{}",
            namespace,
            started_at.format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        RunContext {
            run_id,
            namespace: namespace.to_string(),
            started_at,
            steps: Vec::new(),
            warnings: Vec::new(),
            step_started: Instant::now(),
        }
    }

    /// Marks the start of a step; the next `record` measures from here.
    pub fn begin(&mut self, step: &'static str) {
        tracing::debug!(run_id = %self.run_id, step, "step started");
        self.step_started = Instant::now();
    }

    pub fn record(&mut self, step: &'static str, status: StepStatus, detail: impl Into<String>) {
        let detail = detail.into();
        if status == StepStatus::Warning {
            self.warnings.push(format!("{}: {}", step, detail));
        }
        self.steps.push(StepRecord {
            step,
            status,
            detail,
            elapsed: self.step_started.elapsed(),
        });
    }

    pub fn warn(&mut self, step: &'static str, detail: impl Into<String>) {
        self.record(step, StepStatus::Warning, detail);
    }

    /// Plain-text run log, uploaded next to the artifacts.
    pub fn render_log(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "run_id: {}", self.run_id);
        let _ = writeln!(out, "namespace: {}", self.namespace);
        let _ = writeln!(out, "started_at: {}", self.started_at.to_rfc3339());
        for step in &self.steps {
            let _ = writeln!(
                out,
                "[{:>7}] {:<14} {:>8.2}s  {}",
                step.status.label(),
                step.step,
                step.elapsed.as_secs_f64(),
                step.detail
            );
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "warnings:");
            for w in &self.warnings {
                let _ = writeln!(out, "  - {}", w);
            }
        }
        out
    }
}
