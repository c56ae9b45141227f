use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::StepSpec;

pub const PROFILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct InstallProfile {
    pub version: u32,
    pub paths: PathSettings,
    pub database: DatabaseSettings,
    pub admin: AdminSettings,
    #[serde(default)]
    pub site: SiteSettings,
    #[serde(default)]
    pub detection: DetectionSettings,
    #[serde(default)]
    pub shell: ShellSettings,
    #[serde(default)]
    pub pipeline: Option<Vec<StepSpec>>,
}

impl InstallProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read install profile: {}", path.display()))?;
        let profile: InstallProfile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse install profile YAML: {}", path.display()))?;
        Ok(profile)
    }

    pub fn steps(&self) -> Vec<StepSpec> {
        self.pipeline
            .clone()
            .unwrap_or_else(crate::steps::standard_pipeline)
    }

    pub fn settings(&self, bundle_dir: &Path) -> InstallSettings {
        InstallSettings {
            bundle_dir: bundle_dir.to_path_buf(),
            paths: self.paths.clone(),
            database: self.database.clone(),
            admin: self.admin.clone(),
            site: self.site.clone(),
        }
    }
}

/// User-supplied values, fixed before a run starts.
#[derive(Debug, Clone)]
pub struct InstallSettings {
    pub bundle_dir: PathBuf,
    pub paths: PathSettings,
    pub database: DatabaseSettings,
    pub admin: AdminSettings,
    pub site: SiteSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathSettings {
    pub runtime_dir: PathBuf,
    #[serde(default)]
    pub prerequisites_dir: Option<PathBuf>,
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,
    #[serde(default = "default_php_dir")]
    pub php_dir: PathBuf,
    #[serde(default = "default_node_dir")]
    pub node_dir: PathBuf,
    #[serde(default = "default_admin_console_dir")]
    pub admin_console_dir: PathBuf,
    pub sql_dump: PathBuf,
}

fn default_php_dir() -> PathBuf {
    PathBuf::from(r"C:\PHP")
}

fn default_node_dir() -> PathBuf {
    PathBuf::from(r"C:\nodejs")
}

fn default_admin_console_dir() -> PathBuf {
    PathBuf::from(r"C:\inetpub\wwwroot\phpMyAdmin")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseSettings {
    pub root_password: Secret,
    pub name: String,
    pub user: String,
    pub user_password: Secret,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
}

fn default_db_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_port() -> u16 {
    3306
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminSettings {
    pub name: String,
    pub email: String,
    pub password: Secret,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteSettings {
    #[serde(default = "default_site_name")]
    pub name: String,
    #[serde(default = "default_site_name")]
    pub app_pool: String,
    #[serde(default = "default_site_port")]
    pub port: u16,
    #[serde(default = "default_app_url")]
    pub app_url: String,
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    #[serde(default = "default_stateful_domains")]
    pub stateful_domains: String,
    #[serde(default = "default_session_domain")]
    pub session_domain: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            name: default_site_name(),
            app_pool: default_site_name(),
            port: default_site_port(),
            app_url: default_app_url(),
            frontend_url: default_frontend_url(),
            stateful_domains: default_stateful_domains(),
            session_domain: default_session_domain(),
        }
    }
}

fn default_site_name() -> String {
    "AppStack".to_string()
}

fn default_site_port() -> u16 {
    80
}

fn default_app_url() -> String {
    "http://localhost".to_string()
}

fn default_frontend_url() -> String {
    "http://localhost/frontend".to_string()
}

fn default_stateful_domains() -> String {
    "localhost,127.0.0.1".to_string()
}

fn default_session_domain() -> String {
    "localhost".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DetectionSettings {
    /// Fail instead of proceeding when a probe cannot run.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShellSettings {
    #[serde(default = "default_shell_executable")]
    pub executable: PathBuf,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            executable: default_shell_executable(),
        }
    }
}

fn default_shell_executable() -> PathBuf {
    PathBuf::from("powershell.exe")
}

#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version: 1
paths:
  runtime_dir: 'C:\inetpub\app'
  sql_dump: 'C:\dumps\app.sql'
database:
  root_password: rootpw
  name: appdb
  user: app
  user_password: userpw
admin:
  name: Admin
  email: admin@example.com
  password: adminpw
"#;

    #[test]
    fn minimal_profile_fills_defaults() {
        let profile: InstallProfile = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(profile.paths.php_dir, PathBuf::from(r"C:\PHP"));
        assert_eq!(profile.database.port, 3306);
        assert_eq!(profile.site.app_url, "http://localhost");
        assert!(!profile.detection.strict);
        assert!(profile.pipeline.is_none());
        assert_eq!(profile.steps().len(), crate::steps::standard_pipeline().len());
    }

    #[test]
    fn secrets_never_print() {
        let profile: InstallProfile = serde_yaml::from_str(MINIMAL).unwrap();
        let debug = format!("{:?}", profile.database);
        assert!(!debug.contains("rootpw"));
        assert!(!debug.contains("userpw"));
        assert_eq!(profile.admin.password.to_string(), "***");
        assert_eq!(profile.admin.password.expose(), "adminpw");
    }
}
