#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use stack_provisioner::detect::{DetectionPolicy, DetectionResult, DetectionStatus, Detector, Subject};
use stack_provisioner::pipeline::StepServices;
use stack_provisioner::profile::{
    AdminSettings, DatabaseSettings, InstallSettings, PathSettings, Secret, SiteSettings,
};
use stack_provisioner::shell::{ExitCode, HostShell, Invocation, ShellError, ShellOutput};

type Responder = dyn Fn(&Invocation) -> Result<ShellOutput, ShellError> + Send + Sync;

/// Records every invocation and answers with an optional responder
/// (empty success otherwise).
#[derive(Clone, Default)]
pub struct RecordingShell {
    calls: Arc<AtomicUsize>,
    invocations: Arc<Mutex<Vec<Invocation>>>,
    responder: Option<Arc<Responder>>,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&Invocation) -> Result<ShellOutput, ShellError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Arc::new(responder)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }
}

impl HostShell for RecordingShell {
    fn execute(&self, invocation: &Invocation) -> Result<ShellOutput, ShellError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invocations.lock().unwrap().push(invocation.clone());
        match &self.responder {
            Some(responder) => responder(invocation),
            None => Ok(ShellOutput::default()),
        }
    }
}

pub fn stdout(text: &str) -> Result<ShellOutput, ShellError> {
    Ok(ShellOutput {
        stdout: text.to_string(),
        stderr: String::new(),
    })
}

pub fn failure(program: &str, detail: &str) -> Result<ShellOutput, ShellError> {
    Err(ShellError::Failed {
        program: program.to_string(),
        status: ExitCode::Code(1),
        detail: detail.to_string(),
    })
}

pub fn program_name(invocation: &Invocation) -> Option<String> {
    match invocation {
        Invocation::Program { program, .. } => program
            .file_name()
            .map(|name| name.to_string_lossy().to_string()),
        Invocation::Script(_) => None,
    }
}

pub fn script_body(invocation: &Invocation) -> Option<&str> {
    match invocation {
        Invocation::Script(body) => Some(body),
        Invocation::Program { .. } => None,
    }
}

/// Answers every subject with the same status.
pub struct ScriptedDetector {
    status: DetectionStatus,
    probes: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(status: DetectionStatus) -> Self {
        Self {
            status,
            probes: AtomicUsize::new(0),
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Detector for ScriptedDetector {
    fn detect(&self, subject: Subject) -> DetectionResult {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match self.status {
            DetectionStatus::Satisfied => DetectionResult::satisfied(subject, "present"),
            DetectionStatus::Missing => DetectionResult::missing(subject, "absent"),
            DetectionStatus::Indeterminate => {
                DetectionResult::indeterminate(subject, "probe failed")
            }
        }
    }
}

pub fn services(
    shell: &RecordingShell,
    detector: Arc<ScriptedDetector>,
    strict: bool,
) -> StepServices {
    StepServices {
        shell: Arc::new(shell.clone()),
        detector,
        policy: DetectionPolicy { strict },
    }
}

pub fn settings(root: &Path) -> InstallSettings {
    InstallSettings {
        bundle_dir: root.join("bundle"),
        paths: PathSettings {
            runtime_dir: root.join("runtime"),
            prerequisites_dir: None,
            source_dir: None,
            downloads_dir: None,
            php_dir: root.join("php"),
            node_dir: root.join("node"),
            admin_console_dir: root.join("phpmyadmin"),
            sql_dump: root.join("bundle").join("seed.sql"),
        },
        database: DatabaseSettings {
            root_password: Secret::new("root-secret"),
            name: "appdb".into(),
            user: "app".into(),
            user_password: Secret::new("app secret#1"),
            host: "127.0.0.1".into(),
            port: 3306,
        },
        admin: AdminSettings {
            name: "Site Admin".into(),
            email: "admin@example.com".into(),
            password: Secret::new("correct horse"),
        },
        site: SiteSettings::default(),
    }
}

pub fn touch(path: &Path) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, b"fixture").unwrap();
    path.to_path_buf()
}
