use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use super::{fsutil, take_bool};
use crate::context::{InstallContext, require};
use crate::pipeline::{Step, StepParameters, StepServices};
use crate::progress::SharedValue;
use crate::shell::Invocation;

/// Runtime paths owned by the running application rather than the source
/// tree. They are carried across redeploys.
const ENV_FILE: [&str; 2] = ["backend", ".env"];
const STORAGE_DIR: [&str; 2] = ["backend", "storage"];

pub(crate) struct DeployApplication {
    preserve_env: bool,
    preserve_storage: bool,
}

impl DeployApplication {
    pub(crate) fn from_params(mut params: StepParameters) -> Result<Self> {
        let preserve_env = take_bool(&mut params, "preserve_env").unwrap_or(true);
        let preserve_storage = take_bool(&mut params, "preserve_storage").unwrap_or(true);
        Ok(Self {
            preserve_env,
            preserve_storage,
        })
    }

    fn preserved(&self) -> Vec<PathBuf> {
        let mut kept = Vec::new();
        if self.preserve_env {
            kept.push(ENV_FILE.iter().collect());
        }
        if self.preserve_storage {
            kept.push(STORAGE_DIR.iter().collect());
        }
        kept
    }
}

fn staging_dir(runtime: &Path) -> PathBuf {
    let mut name = runtime
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".preserved");
    runtime.with_file_name(name)
}

/// Moves the existing runtime paths listed in `relative` into `staging`.
/// Returns the ones that were present.
fn park(runtime: &Path, staging: &Path, relative: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut parked = Vec::new();
    for rel in relative {
        let current = runtime.join(&rel);
        if fs::symlink_metadata(&current).is_err() {
            continue;
        }
        let target = staging.join(&rel);
        if let Some(parent) = target.parent() {
            fsutil::ensure_dir(parent)?;
        }
        fs::rename(&current, &target).with_context(|| {
            format!("Failed to move {} aside", current.display())
        })?;
        parked.push(rel);
    }
    Ok(parked)
}

/// Copies parked paths back over the freshly deployed tree; parked files win.
fn restore(runtime: &Path, staging: &Path, parked: &[PathBuf]) -> Result<()> {
    for rel in parked {
        let source = staging.join(rel);
        let target = runtime.join(rel);
        if source.is_dir() {
            fsutil::copy_dir(&source, &target)?;
        } else {
            fsutil::copy_file(&source, &target)?;
        }
    }
    remove_path(staging)
}

impl Step for DeployApplication {
    fn name(&self) -> &str {
        "Deploy Application Files"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let source = require(&ctx.facts.source_dir, "source_dir", "Resolve Inputs")?.clone();
        let runtime = require(&ctx.facts.runtime_dir, "runtime_dir", "Resolve Inputs")?.clone();
        if !source.is_dir() {
            bail!("application source directory not found at {}", source.display());
        }

        let staging = staging_dir(&runtime);
        if fs::symlink_metadata(&staging).is_ok() {
            bail!(
                "found data left by an interrupted deployment at {}; restore or remove it first",
                staging.display()
            );
        }
        let parked = park(&runtime, &staging, self.preserved())?;

        ctx.log(format!(
            "Deploying application from {} to {}",
            source.display(),
            runtime.display()
        ));
        fsutil::remove_dir_if_exists(&runtime).context("Failed to clear runtime directory")?;
        fsutil::ensure_dir(&runtime)?;
        let copied = fsutil::copy_dir(&source, &runtime).context("Failed to copy application source")?;

        restore(&runtime, &staging, &parked)
            .with_context(|| format!("Failed to restore preserved files from {}", staging.display()))?;
        for rel in &parked {
            ctx.log(format!("Preserved existing {}", rel.display()));
        }

        let storage_src = runtime.join("backend").join("storage").join("app").join("public");
        let storage_dest = runtime.join("backend").join("public").join("storage");
        remove_path(&storage_dest).context("Failed to remove existing storage link")?;
        if storage_src.is_dir() {
            fsutil::copy_dir(&storage_src, &storage_dest)
                .context("Failed to copy public storage files")?;
        } else {
            fsutil::ensure_dir(&storage_dest)?;
        }

        remove_path(&runtime.join("httpdocs")).context("Failed to remove httpdocs directory")?;
        let node_modules = runtime.join("frontend").join("node_modules");
        if let Err(err) = remove_path(&node_modules) {
            warn!(path = %node_modules.display(), error = %err, "Could not remove node_modules");
        }

        ctx.log(format!(
            "Application files deployed to {} ({copied} file(s))",
            runtime.display()
        ));
        ctx.publish("application.files", SharedValue::Count(copied));
        Ok(())
    }
}

/// Removes a directory, file or dangling link; a missing path is not an error.
fn remove_path(path: &Path) -> Result<()> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("Failed to remove {}", path.display()))
}

/// `KEY=value` pairs in file order. Blank lines and `#` comments are
/// skipped; values are kept verbatim.
pub fn parse_env(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn quote_env_value(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\'));
    if needs_quotes {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Renders `.env` contents: keys keep the order of `example`, `overrides`
/// replace their values and unknown overrides are appended. Comments and
/// repeated keys are dropped.
pub fn render_env(example: &str, overrides: &[(String, String)]) -> String {
    let mut entries: Vec<(String, String)> = Vec::new();
    for (key, value) in parse_env(example) {
        match entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }
    for (key, value) in overrides {
        let value = quote_env_value(value);
        match entries.iter_mut().find(|(existing, _)| existing == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key.clone(), value)),
        }
    }

    let mut rendered = String::new();
    for (key, value) in entries {
        rendered.push_str(&key);
        rendered.push('=');
        rendered.push_str(&value);
        rendered.push('\n');
    }
    rendered
}

fn env_value<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .rev()
        .find(|(existing, _)| existing == key)
        .map(|(_, value)| unquote(value))
}

pub(crate) struct ConfigureEnv {
    services: StepServices,
    key_generate: bool,
}

impl ConfigureEnv {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        let key_generate = take_bool(&mut params, "key_generate").unwrap_or(true);
        Ok(Self {
            services,
            key_generate,
        })
    }
}

impl Step for ConfigureEnv {
    fn name(&self) -> &str {
        "Configure .env"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let runtime = require(&ctx.facts.runtime_dir, "runtime_dir", "Resolve Inputs")?.clone();
        let backend = runtime.join("backend");
        let example_path = backend.join(".env.example");
        let env_path = backend.join(".env");

        let example = fs::read_to_string(&example_path)
            .with_context(|| format!("Failed to read {}", example_path.display()))?;
        let existing_key = match fs::read_to_string(&env_path) {
            Ok(current) => env_value(&parse_env(&current), "APP_KEY")
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            Err(_) => None,
        };

        let site = &ctx.settings.site;
        let database = &ctx.settings.database;
        let mut overrides = vec![
            ("APP_URL".to_string(), site.app_url.clone()),
            ("FRONTEND_URL".to_string(), site.frontend_url.clone()),
            ("DB_HOST".to_string(), database.host.clone()),
            ("DB_PORT".to_string(), database.port.to_string()),
            ("DB_DATABASE".to_string(), database.name.clone()),
            ("DB_USERNAME".to_string(), database.user.clone()),
            (
                "DB_PASSWORD".to_string(),
                database.user_password.expose().to_string(),
            ),
            (
                "SANCTUM_STATEFUL_DOMAINS".to_string(),
                site.stateful_domains.clone(),
            ),
            ("SESSION_DOMAIN".to_string(), site.session_domain.clone()),
        ];
        if let Some(key) = &existing_key {
            overrides.push(("APP_KEY".to_string(), key.clone()));
        }

        let rendered = render_env(&example, &overrides);
        fs::write(&env_path, &rendered)
            .with_context(|| format!("Failed to write {}", env_path.display()))?;
        ctx.log(format!("Wrote {}", env_path.display()));

        let has_key = env_value(&parse_env(&rendered), "APP_KEY").is_some_and(|key| !key.is_empty());
        if has_key {
            ctx.log("Existing application key preserved");
        } else if self.key_generate {
            let php_exe = require(&ctx.facts.php_exe_path, "php_exe_path", "Install PHP")?.clone();
            let artisan = backend.join("artisan");
            let invocation = Invocation::program(
                php_exe,
                [
                    artisan.display().to_string(),
                    "key:generate".to_string(),
                    "--force".to_string(),
                ],
            );
            match self.services.shell.execute(&invocation) {
                Ok(_) => ctx.log("Application key generated"),
                Err(err) => {
                    warn!(error = %err, "artisan key:generate failed");
                    ctx.log(format!("Warning: artisan key:generate failed: {err}"));
                }
            }
        } else {
            ctx.log("APP_KEY is empty; key generation disabled");
        }

        info!(env = %env_path.display(), "Environment configured");
        Ok(())
    }
}
