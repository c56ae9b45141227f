//! Run-scoped, thread-safe view of pipeline progress.
//!
//! The runner thread is the only writer. Any number of observers (the CLI
//! renderer, the status server, tests) may poll concurrently. A single
//! `RwLock` guards the whole store, so every status transition is observed
//! atomically.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Values an external observer may need from a run (a site URL, a resolved
/// install path, a digest). The set of kinds is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SharedValue {
    Text(String),
    Path(PathBuf),
    Url(String),
    Flag(bool),
    Count(u64),
}

impl SharedValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) | Self::Url(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<u64> {
        match self {
            Self::Count(count) => Some(*count),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("step '{0}' is not tracked by this progress store")]
    UnknownStep(String),
    #[error("step '{step}' cannot move from {from} to {to}")]
    InvalidTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub logs: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            logs: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub steps: Vec<StepRecord>,
    pub shared: BTreeMap<String, SharedValue>,
}

impl ProgressSnapshot {
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn current(&self) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Running)
    }

    pub fn is_finished(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
            || self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    order: Vec<String>,
    steps: HashMap<String, StepRecord>,
    shared: BTreeMap<String, SharedValue>,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressStore {
    inner: Arc<RwLock<ProgressState>>,
}

impl ProgressStore {
    pub fn new<I, S>(step_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = ProgressState::default();
        for name in step_names {
            let name = name.as_ref();
            if state.steps.contains_key(name) {
                continue;
            }
            state.order.push(name.to_string());
            state
                .steps
                .insert(name.to_string(), StepRecord::pending(name));
        }
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ProgressState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProgressState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, step: &str, status: StepStatus) -> Result<(), ProgressError> {
        let mut guard = self.write();
        let record = guard
            .steps
            .get_mut(step)
            .ok_or_else(|| ProgressError::UnknownStep(step.to_string()))?;
        if !record.status.can_transition_to(status) {
            return Err(ProgressError::InvalidTransition {
                step: step.to_string(),
                from: record.status,
                to: status,
            });
        }
        let now = Utc::now();
        if status == StepStatus::Running {
            record.started_at = Some(now);
        } else if status.is_terminal() {
            record.finished_at = Some(now);
        }
        record.status = status;
        Ok(())
    }

    pub fn append_log(&self, step: &str, line: impl Into<String>) -> Result<(), ProgressError> {
        let mut guard = self.write();
        let record = guard
            .steps
            .get_mut(step)
            .ok_or_else(|| ProgressError::UnknownStep(step.to_string()))?;
        record.logs.push(line.into());
        Ok(())
    }

    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.read().steps.get(step).map(|record| record.status)
    }

    pub fn logs(&self, step: &str) -> Vec<String> {
        self.read()
            .steps
            .get(step)
            .map(|record| record.logs.clone())
            .unwrap_or_default()
    }

    pub fn put(&self, key: impl Into<String>, value: SharedValue) {
        self.write().shared.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<SharedValue> {
        self.read().shared.get(key).cloned()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let guard = self.read();
        let steps = guard
            .order
            .iter()
            .filter_map(|name| guard.steps.get(name).cloned())
            .collect();
        ProgressSnapshot {
            steps,
            shared: guard.shared.clone(),
        }
    }
}
