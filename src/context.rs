use std::io::{self, Write};
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::profile::InstallSettings;
use crate::progress::{ProgressStore, SharedValue};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("required value '{field}' is not available; it is produced by step '{producer}'")]
    MissingFact {
        field: &'static str,
        producer: &'static str,
    },
}

/// Returns the fact or a configuration error naming the step that should
/// have published it.
pub fn require<'a, T>(
    value: &'a Option<T>,
    field: &'static str,
    producer: &'static str,
) -> Result<&'a T, ContextError> {
    value
        .as_ref()
        .ok_or(ContextError::MissingFact { field, producer })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archives {
    pub composer_installer: Option<PathBuf>,
    pub mariadb_installer: Option<PathBuf>,
    pub node_zip: Option<PathBuf>,
    pub php_nts_zip: Option<PathBuf>,
    pub php_ts_zip: Option<PathBuf>,
    pub admin_console_zip: Option<PathBuf>,
}

/// Facts published by earlier steps for later ones. Each is written once per
/// run; readers go through [`require`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedFacts {
    pub runtime_dir: Option<PathBuf>,
    pub prerequisites_dir: Option<PathBuf>,
    pub source_dir: Option<PathBuf>,
    pub downloads_dir: Option<PathBuf>,
    pub sql_dump: Option<PathBuf>,
    pub archives: Archives,
    pub php_dir: Option<PathBuf>,
    pub php_ini_path: Option<PathBuf>,
    pub php_exe_path: Option<PathBuf>,
    pub composer_path: Option<PathBuf>,
    pub node_dir: Option<PathBuf>,
    pub node_bin_dir: Option<PathBuf>,
    pub admin_console_dir: Option<PathBuf>,
    pub mariadb_bin_dir: Option<PathBuf>,
    pub site_url: Option<String>,
}

pub struct InstallContext {
    pub settings: InstallSettings,
    pub facts: DerivedFacts,
    transcript: Vec<String>,
    sink: Box<dyn Write + Send>,
    progress: Option<ProgressStore>,
    active_step: Option<String>,
}

impl InstallContext {
    pub fn new(settings: InstallSettings) -> Self {
        Self::with_sink(settings, Box::new(io::stdout()))
    }

    pub fn silent(settings: InstallSettings) -> Self {
        Self::with_sink(settings, Box::new(io::sink()))
    }

    pub fn with_sink(settings: InstallSettings, sink: Box<dyn Write + Send>) -> Self {
        Self {
            settings,
            facts: DerivedFacts::default(),
            transcript: Vec::new(),
            sink,
            progress: None,
            active_step: None,
        }
    }

    pub fn attach_progress(&mut self, store: ProgressStore) {
        self.progress = Some(store);
    }

    pub fn progress(&self) -> Option<&ProgressStore> {
        self.progress.as_ref()
    }

    pub(crate) fn set_active_step(&mut self, step: Option<&str>) {
        self.active_step = step.map(str::to_string);
    }

    pub fn active_step(&self) -> Option<&str> {
        self.active_step.as_deref()
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        let _ = writeln!(self.sink, "{message}");
        let _ = self.sink.flush();
        debug!(step = self.active_step.as_deref().unwrap_or("-"), "{message}");
        if let (Some(store), Some(step)) = (&self.progress, &self.active_step) {
            let _ = store.append_log(step, message.clone());
        }
        self.transcript.push(message);
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    /// Shares a value with observers of the attached progress store, if any.
    pub fn publish(&self, key: &str, value: SharedValue) {
        if let Some(store) = &self.progress {
            store.put(key, value);
        }
    }
}
