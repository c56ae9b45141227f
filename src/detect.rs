use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use clap::ValueEnum;
use serde::Serialize;
use thiserror::Error;

use crate::context::InstallContext;
use crate::shell::{HostShell, Invocation, ShellError};

pub const REQUIRED_PHP_EXTENSIONS: [&str; 8] = [
    "curl", "fileinfo", "gd", "mbstring", "openssl", "pdo_mysql", "zip", "bcmath",
];

pub const FIREWALL_RULE_GROUP: &str = "Application Stack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Subject {
    WebServerRole,
    UrlRewrite,
    VcRuntime,
    PhpRuntime,
    PhpExtensions,
    Composer,
    NodeRuntime,
    Npm,
    DatabaseService,
    FirewallRules,
}

impl Subject {
    pub const ALL: [Subject; 10] = [
        Subject::WebServerRole,
        Subject::UrlRewrite,
        Subject::VcRuntime,
        Subject::PhpRuntime,
        Subject::PhpExtensions,
        Subject::Composer,
        Subject::NodeRuntime,
        Subject::Npm,
        Subject::DatabaseService,
        Subject::FirewallRules,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Self::WebServerRole => "web-server-role",
            Self::UrlRewrite => "url-rewrite",
            Self::VcRuntime => "vc-runtime",
            Self::PhpRuntime => "php-runtime",
            Self::PhpExtensions => "php-extensions",
            Self::Composer => "composer",
            Self::NodeRuntime => "node-runtime",
            Self::Npm => "npm",
            Self::DatabaseService => "database-service",
            Self::FirewallRules => "firewall-rules",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::WebServerRole => "IIS Web Server Role",
            Self::UrlRewrite => "IIS URL Rewrite Module",
            Self::VcRuntime => "Visual C++ Redistributable",
            Self::PhpRuntime => "PHP 8.x (NTS)",
            Self::PhpExtensions => "Required PHP Extensions",
            Self::Composer => "Composer",
            Self::NodeRuntime => "Node.js",
            Self::Npm => "npm",
            Self::DatabaseService => "MariaDB/MySQL Service",
            Self::FirewallRules => "Firewall Rules",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Subject {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('_', "-");
        Subject::ALL
            .into_iter()
            .find(|subject| subject.id() == normalized)
            .ok_or_else(|| anyhow!("Unknown detection subject '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Satisfied,
    Missing,
    Indeterminate,
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satisfied => write!(f, "satisfied"),
            Self::Missing => write!(f, "missing"),
            Self::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionResult {
    pub subject: Subject,
    pub label: String,
    pub status: DetectionStatus,
    pub detail: String,
}

impl DetectionResult {
    pub fn satisfied(subject: Subject, detail: impl Into<String>) -> Self {
        Self::with_status(subject, DetectionStatus::Satisfied, detail)
    }

    pub fn missing(subject: Subject, detail: impl Into<String>) -> Self {
        Self::with_status(subject, DetectionStatus::Missing, detail)
    }

    pub fn indeterminate(subject: Subject, detail: impl Into<String>) -> Self {
        Self::with_status(subject, DetectionStatus::Indeterminate, detail)
    }

    fn with_status(subject: Subject, status: DetectionStatus, detail: impl Into<String>) -> Self {
        Self {
            subject,
            label: subject.label().to_string(),
            status,
            detail: detail.into(),
        }
    }
}

pub trait Detector: Send + Sync {
    fn detect(&self, subject: Subject) -> DetectionResult;

    fn detect_all(&self) -> Vec<DetectionResult> {
        Subject::ALL.into_iter().map(|s| self.detect(s)).collect()
    }
}

#[derive(Debug, Error)]
#[error("{label} state could not be determined: {detail}")]
pub struct IndeterminateError {
    pub label: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionPolicy {
    pub strict: bool,
}

impl DetectionPolicy {
    /// Returns `true` when the mutating action guarded by `subject` must run.
    pub fn requires_action(
        &self,
        detector: &dyn Detector,
        subject: Subject,
        ctx: &mut InstallContext,
    ) -> Result<bool, IndeterminateError> {
        let result = detector.detect(subject);
        match result.status {
            DetectionStatus::Satisfied => {
                ctx.log(format!("{} already satisfied: {}", result.label, result.detail));
                Ok(false)
            }
            DetectionStatus::Missing => {
                ctx.log(format!("{} missing: {}", result.label, result.detail));
                Ok(true)
            }
            DetectionStatus::Indeterminate if self.strict => Err(IndeterminateError {
                label: result.label,
                detail: result.detail,
            }),
            DetectionStatus::Indeterminate => {
                ctx.log(format!(
                    "Warning: could not determine {} state ({}); proceeding with installation",
                    result.label, result.detail
                ));
                Ok(true)
            }
        }
    }
}

pub struct HostDetector {
    shell: Arc<dyn HostShell>,
}

impl HostDetector {
    pub fn new(shell: Arc<dyn HostShell>) -> Self {
        Self { shell }
    }

    fn script(&self, body: &str) -> Result<String, ShellError> {
        self.shell
            .execute(&Invocation::script(body))
            .map(|out| out.stdout)
    }

    fn program(&self, program: &std::path::Path, args: &[&str]) -> Result<String, ShellError> {
        self.shell
            .execute(&Invocation::program(program, args.iter().copied()))
            .map(|out| out.stdout)
    }

    fn tool_version(&self, subject: Subject, tool: &str, version_flag: &str) -> DetectionResult {
        let Ok(path) = which::which(tool) else {
            return DetectionResult::missing(subject, format!("{tool} not in PATH"));
        };
        match self.program(&path, &[version_flag]) {
            Ok(stdout) => DetectionResult::satisfied(subject, first_line(&stdout)),
            Err(err) => DetectionResult::indeterminate(subject, err.detail()),
        }
    }

    fn check_php(&self) -> DetectionResult {
        let subject = Subject::PhpRuntime;
        let Ok(path) = which::which("php") else {
            return DetectionResult::missing(subject, "php not in PATH");
        };
        match self.program(&path, &["-v"]) {
            Ok(stdout) if stdout.contains(" (NTS)") && stdout.contains("PHP 8.") => {
                DetectionResult::satisfied(subject, first_line(&stdout))
            }
            Ok(_) => DetectionResult::missing(subject, "Found php but not NTS 8.x"),
            Err(err) => DetectionResult::indeterminate(subject, err.detail()),
        }
    }

    fn check_php_extensions(&self) -> DetectionResult {
        let subject = Subject::PhpExtensions;
        let Ok(path) = which::which("php") else {
            return DetectionResult::indeterminate(subject, "php not in PATH");
        };
        match self.program(&path, &["-r", "echo implode(',', get_loaded_extensions());"]) {
            Ok(stdout) => {
                let missing = missing_extensions(&stdout);
                if missing.is_empty() {
                    DetectionResult::satisfied(subject, "All required extensions loaded")
                } else {
                    DetectionResult::missing(subject, format!("Missing: {}", missing.join(", ")))
                }
            }
            Err(err) => DetectionResult::indeterminate(subject, err.detail()),
        }
    }
}

impl Detector for HostDetector {
    fn detect(&self, subject: Subject) -> DetectionResult {
        match subject {
            Subject::WebServerRole => {
                match self.script("(Get-WindowsOptionalFeature -Online -FeatureName IIS-WebServerRole).State") {
                    Ok(out) if out.to_lowercase().contains("enabled") => {
                        DetectionResult::satisfied(subject, "IIS is enabled")
                    }
                    Ok(_) => DetectionResult::missing(subject, "IIS is not enabled"),
                    Err(err) => DetectionResult::indeterminate(subject, err.detail()),
                }
            }
            Subject::UrlRewrite => {
                match self.script(r#"[IO.File]::Exists("$env:SystemRoot\System32\inetsrv\rewrite.dll")"#) {
                    Ok(out) if out.eq_ignore_ascii_case("true") => {
                        DetectionResult::satisfied(subject, "rewrite.dll detected")
                    }
                    Ok(_) => DetectionResult::missing(subject, "rewrite.dll not found"),
                    Err(err) => DetectionResult::indeterminate(subject, err.detail()),
                }
            }
            Subject::VcRuntime => {
                match self.script(r#"Get-ChildItem "HKLM:\SOFTWARE\Microsoft\VisualStudio\14.0\VC\Runtimes\x64" -ErrorAction SilentlyContinue | Get-ItemProperty | Select-Object -ExpandProperty Installed"#) {
                    Ok(out) if out.trim() == "1" => {
                        DetectionResult::satisfied(subject, "x64 runtime installed")
                    }
                    Ok(_) => DetectionResult::missing(subject, "Runtime not detected"),
                    Err(err) => DetectionResult::indeterminate(subject, err.detail()),
                }
            }
            Subject::PhpRuntime => self.check_php(),
            Subject::PhpExtensions => self.check_php_extensions(),
            Subject::Composer => self.tool_version(subject, "composer", "--version"),
            Subject::NodeRuntime => self.tool_version(subject, "node", "--version"),
            Subject::Npm => self.tool_version(subject, "npm", "--version"),
            Subject::DatabaseService => {
                match self.script(r#"(Get-Service -Name "MariaDB*","MySQL*" -ErrorAction SilentlyContinue | Select-Object -First 1).Status"#) {
                    Ok(out) if out.trim().is_empty() => {
                        DetectionResult::missing(subject, "Database service not found")
                    }
                    Ok(out) => DetectionResult::satisfied(subject, format!("Service status: {out}")),
                    Err(err) => DetectionResult::indeterminate(subject, err.detail()),
                }
            }
            Subject::FirewallRules => {
                let script = format!(
                    "(Get-NetFirewallRule -Group '{FIREWALL_RULE_GROUP}' -ErrorAction SilentlyContinue | Measure-Object).Count"
                );
                match self.script(&script) {
                    Ok(out) => match out.trim().parse::<u32>() {
                        Ok(0) => DetectionResult::missing(subject, "No installer firewall rules found"),
                        Ok(count) => {
                            DetectionResult::satisfied(subject, format!("{count} rule(s) present"))
                        }
                        Err(_) => DetectionResult::indeterminate(
                            subject,
                            format!("Unexpected rule count output: {out}"),
                        ),
                    },
                    Err(err) => DetectionResult::indeterminate(subject, err.detail()),
                }
            }
        }
    }
}

pub fn missing_extensions(loaded: &str) -> Vec<&'static str> {
    let loaded: Vec<String> = loaded
        .split(',')
        .map(|ext| ext.trim().to_lowercase())
        .collect();
    REQUIRED_PHP_EXTENSIONS
        .into_iter()
        .filter(|required| !loaded.iter().any(|ext| ext == required))
        .collect()
}

fn first_line(value: &str) -> String {
    value.lines().next().unwrap_or("").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{ExitCode, ShellOutput};

    struct FixedShell(Result<String, String>);

    impl HostShell for FixedShell {
        fn execute(&self, _invocation: &Invocation) -> Result<ShellOutput, ShellError> {
            match &self.0 {
                Ok(stdout) => Ok(ShellOutput {
                    stdout: stdout.clone(),
                    stderr: String::new(),
                }),
                Err(detail) => Err(ShellError::Failed {
                    program: "script".into(),
                    status: ExitCode::Code(1),
                    detail: detail.clone(),
                }),
            }
        }
    }

    fn detector(result: Result<&str, &str>) -> HostDetector {
        HostDetector::new(Arc::new(FixedShell(
            result.map(str::to_string).map_err(str::to_string),
        )))
    }

    #[test]
    fn web_server_role_states() {
        let enabled = detector(Ok("Enabled")).detect(Subject::WebServerRole);
        assert_eq!(enabled.status, DetectionStatus::Satisfied);
        let disabled = detector(Ok("Disabled")).detect(Subject::WebServerRole);
        assert_eq!(disabled.status, DetectionStatus::Missing);
        let broken = detector(Err("Access denied")).detect(Subject::WebServerRole);
        assert_eq!(broken.status, DetectionStatus::Indeterminate);
        assert_eq!(broken.detail, "Access denied");
        assert_eq!(broken.label, "IIS Web Server Role");
    }

    #[test]
    fn firewall_rule_count_must_be_numeric() {
        let garbage = detector(Ok("n/a")).detect(Subject::FirewallRules);
        assert_eq!(garbage.status, DetectionStatus::Indeterminate);
        let present = detector(Ok("2")).detect(Subject::FirewallRules);
        assert_eq!(present.status, DetectionStatus::Satisfied);
        let absent = detector(Ok("0")).detect(Subject::FirewallRules);
        assert_eq!(absent.status, DetectionStatus::Missing);
    }

    #[test]
    fn extension_list_reports_missing_entries() {
        let missing = missing_extensions("Core, curl,GD,mbstring,openssl,pdo_mysql,zip");
        assert_eq!(missing, vec!["fileinfo", "bcmath"]);
    }

    #[test]
    fn subjects_parse_from_ids() {
        assert_eq!("php_runtime".parse::<Subject>().unwrap(), Subject::PhpRuntime);
        assert_eq!("Url-Rewrite".parse::<Subject>().unwrap(), Subject::UrlRewrite);
        assert!("kernel".parse::<Subject>().is_err());
    }
}
