use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::context::InstallContext;
use crate::detect::{DetectionPolicy, Detector};
use crate::observability::{MetricsCollector, StepOutcome};
use crate::progress::{ProgressError, ProgressStore, StepStatus};
use crate::shell::HostShell;

pub type StepParameters = Map<String, Value>;

pub trait Step: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, ctx: &mut InstallContext) -> Result<()>;
}

#[derive(Clone)]
pub struct StepServices {
    pub shell: Arc<dyn HostShell>,
    pub detector: Arc<dyn Detector>,
    pub policy: DetectionPolicy,
}

type StepConstructor =
    Arc<dyn Fn(&StepServices, StepParameters) -> Result<Box<dyn Step>> + Send + Sync>;

pub struct StepRegistry {
    factories: HashMap<String, StepConstructor>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, id: impl Into<String>, constructor: F)
    where
        F: Fn(&StepServices, StepParameters) -> Result<Box<dyn Step>> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(constructor));
    }

    pub fn create(
        &self,
        id: &str,
        services: &StepServices,
        params: StepParameters,
    ) -> Result<Box<dyn Step>> {
        let factory = self.factories.get(id).ok_or_else(|| {
            anyhow!(
                "Unknown step '{}'. Available steps: {}",
                id,
                self.known_steps().join(", ")
            )
        })?;
        factory(services, params)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn known_steps(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StepSpec {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StepParameters>,
}

impl StepSpec {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            params: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline contains a step with an empty name at position {0}")]
    EmptyStepName(usize),
    #[error("step name '{0}' appears more than once in the pipeline")]
    DuplicateStep(String),
    #[error("{step} failed: {source:#}")]
    StepFailed {
        step: String,
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error("pipeline worker thread panicked")]
    WorkerPanicked,
}

impl PipelineError {
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub duration: Duration,
}

pub struct PipelineRunner {
    steps: Vec<Box<dyn Step>>,
    metrics: MetricsCollector,
}

impl PipelineRunner {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        for (idx, step) in steps.iter().enumerate() {
            let name = step.name();
            if name.trim().is_empty() {
                return Err(PipelineError::EmptyStepName(idx));
            }
            if !seen.insert(name.to_string()) {
                return Err(PipelineError::DuplicateStep(name.to_string()));
            }
        }
        Ok(Self {
            steps,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// A fresh store with every step of this pipeline pending.
    pub fn progress_store(&self) -> ProgressStore {
        ProgressStore::new(self.step_names())
    }

    #[instrument(skip_all, fields(steps = self.steps.len()))]
    pub fn run(
        &self,
        ctx: &mut InstallContext,
        progress: &ProgressStore,
    ) -> Result<RunSummary, PipelineError> {
        self.metrics.reset();
        let started = Instant::now();
        ctx.attach_progress(progress.clone());
        let mut completed = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            let name = step.name();
            let span = tracing::span!(tracing::Level::INFO, "step", step = name, index);
            let _span_guard = span.enter();

            progress.set_status(name, StepStatus::Running)?;
            ctx.set_active_step(Some(name));
            ctx.log(format!("Starting step: {name}"));

            let step_started = Instant::now();
            let outcome = step.run(ctx);
            let elapsed = step_started.elapsed();

            match outcome {
                Ok(()) => {
                    ctx.log(format!("Completed step: {name}"));
                    ctx.set_active_step(None);
                    progress.set_status(name, StepStatus::Completed)?;
                    self.metrics.record_step(name, elapsed, StepOutcome::Completed);
                    info!(step = name, "Step completed");
                    completed.push(name.to_string());
                }
                Err(source) => {
                    ctx.log(format!("Step failed: {name}: {source:#}"));
                    ctx.set_active_step(None);
                    progress.set_status(name, StepStatus::Failed)?;
                    let cause = format!("{source:#}");
                    error!(step = name, error = %cause, "Step failed");
                    self.metrics.record_step(name, elapsed, StepOutcome::Failed { cause });
                    self.metrics.record_run_duration(started.elapsed());
                    return Err(PipelineError::StepFailed {
                        step: name.to_string(),
                        index,
                        source,
                    });
                }
            }
        }

        let duration = started.elapsed();
        self.metrics.record_run_duration(duration);
        Ok(RunSummary {
            completed,
            duration,
        })
    }

    /// Runs the pipeline on a dedicated worker thread. The returned handle's
    /// progress store is the only channel between the worker and callers.
    pub fn spawn(self, mut ctx: InstallContext) -> RunHandle {
        let progress = self.progress_store();
        let metrics = self.metrics();
        let worker_progress = progress.clone();
        let thread = thread::Builder::new()
            .name("provision-runner".to_string())
            .spawn(move || {
                let outcome = self.run(&mut ctx, &worker_progress);
                (ctx, outcome)
            });
        RunHandle {
            progress,
            metrics,
            thread: thread.map_err(|err| {
                error!(error = %err, "Failed to spawn pipeline worker");
            }),
        }
    }
}

type WorkerOutput = (InstallContext, Result<RunSummary, PipelineError>);

pub struct RunHandle {
    progress: ProgressStore,
    metrics: MetricsCollector,
    thread: std::result::Result<JoinHandle<WorkerOutput>, ()>,
}

impl RunHandle {
    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn is_finished(&self) -> bool {
        match &self.thread {
            Ok(handle) => handle.is_finished(),
            Err(()) => true,
        }
    }

    /// Blocks until the worker finishes. `None` context means the worker never
    /// started or panicked.
    pub fn join(self) -> (Option<InstallContext>, Result<RunSummary, PipelineError>) {
        match self.thread {
            Ok(handle) => match handle.join() {
                Ok((ctx, outcome)) => (Some(ctx), outcome),
                Err(_) => (None, Err(PipelineError::WorkerPanicked)),
            },
            Err(()) => (None, Err(PipelineError::WorkerPanicked)),
        }
    }
}

pub fn build_pipeline(
    registry: &StepRegistry,
    specs: &[StepSpec],
    services: &StepServices,
) -> Result<PipelineRunner> {
    let mut steps = Vec::with_capacity(specs.len());
    for spec in specs {
        let params = spec.params.clone().unwrap_or_default();
        let step = registry.create(&spec.step, services, params)?;
        steps.push(step);
    }
    Ok(PipelineRunner::new(steps)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Step for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn run(&self, _ctx: &mut InstallContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = PipelineRunner::new(vec![Box::new(Named("a")), Box::new(Named("a"))])
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "step name 'a' appears more than once in the pipeline");
    }

    #[test]
    fn empty_names_are_rejected() {
        let err = PipelineRunner::new(vec![Box::new(Named("a")), Box::new(Named(" "))])
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::EmptyStepName(1)));
    }

    #[test]
    fn step_failure_text_contains_name_and_cause_chain() {
        let err = PipelineError::StepFailed {
            step: "Install Runtime".into(),
            index: 2,
            source: anyhow!("disk full").context("copy runtime files"),
        };
        let text = err.to_string();
        assert!(text.contains("Install Runtime"));
        assert!(text.contains("copy runtime files"));
        assert!(text.contains("disk full"));
        assert_eq!(err.failed_step(), Some("Install Runtime"));
    }
}
