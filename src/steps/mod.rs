use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

use crate::context::InstallContext;
use crate::pipeline::{StepParameters, StepRegistry, StepSpec};
use crate::shell::{HostShell, Invocation, ShellOutput, quote_single};

mod application;
mod database;
pub mod fsutil;
mod prerequisites;
mod runtimes;
pub mod templates;
mod web;

pub use application::{parse_env, render_env};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub summary: &'static str,
}

const CATALOGUE: [StepInfo; 15] = [
    StepInfo {
        id: "resolve-inputs",
        name: "Resolve Inputs",
        summary: "Absolutize configured paths and derive the install plan",
    },
    StepInfo {
        id: "check-prerequisites",
        name: "Validate Local Prerequisites",
        summary: "Locate bundled installers and record their digests",
    },
    StepInfo {
        id: "install-iis-features",
        name: "Install IIS Features",
        summary: "Enable the IIS role and install URL Rewrite",
    },
    StepInfo {
        id: "install-php",
        name: "Install PHP",
        summary: "Unpack PHP NTS, configure php.ini and PATH",
    },
    StepInfo {
        id: "install-composer",
        name: "Install Composer",
        summary: "Provide composer.phar and a composer.bat wrapper",
    },
    StepInfo {
        id: "install-mariadb",
        name: "Install MariaDB",
        summary: "Silent MSI install and service startup",
    },
    StepInfo {
        id: "configure-mariadb",
        name: "Configure MariaDB",
        summary: "Tune my.ini and create the application database and user",
    },
    StepInfo {
        id: "install-phpmyadmin",
        name: "Install phpMyAdmin",
        summary: "Deploy the admin console with cookie authentication",
    },
    StepInfo {
        id: "install-node",
        name: "Install Node.js",
        summary: "Unpack Node.js and add it to PATH",
    },
    StepInfo {
        id: "deploy-application",
        name: "Deploy Application Files",
        summary: "Copy the application tree into the runtime directory",
    },
    StepInfo {
        id: "configure-iis",
        name: "Configure IIS",
        summary: "App pool, site, FastCGI handler and web.config files",
    },
    StepInfo {
        id: "configure-env",
        name: "Configure .env",
        summary: "Write backend/.env and generate the application key",
    },
    StepInfo {
        id: "seed-database",
        name: "Seed Database",
        summary: "Import the SQL dump into an empty database",
    },
    StepInfo {
        id: "create-admin-user",
        name: "Create Admin User",
        summary: "Upsert the initial administrator account",
    },
    StepInfo {
        id: "configure-firewall",
        name: "Configure Firewall",
        summary: "Open inbound HTTP and HTTPS ports",
    },
];

pub fn catalogue() -> &'static [StepInfo] {
    &CATALOGUE
}

pub fn step_info(id: &str) -> Option<&'static StepInfo> {
    CATALOGUE.iter().find(|info| info.id == id)
}

pub(crate) fn display_name(id: &str) -> &'static str {
    step_info(id).map(|info| info.name).unwrap_or("unknown step")
}

/// Every built-in step in its canonical order, without parameters.
pub fn standard_pipeline() -> Vec<StepSpec> {
    CATALOGUE.iter().map(|info| StepSpec::new(info.id)).collect()
}

pub fn register_defaults(registry: &mut StepRegistry) {
    registry.register("resolve-inputs", |_, params| {
        Ok(Box::new(prerequisites::ResolveInputs::from_params(params)?))
    });
    registry.register("check-prerequisites", |_, params| {
        Ok(Box::new(prerequisites::CheckPrerequisites::from_params(params)?))
    });
    registry.register("install-iis-features", |services, params| {
        Ok(Box::new(web::InstallIisFeatures::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("install-php", |services, params| {
        Ok(Box::new(runtimes::InstallPhp::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("install-composer", |services, params| {
        Ok(Box::new(runtimes::InstallComposer::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("install-mariadb", |services, params| {
        Ok(Box::new(database::InstallMariaDb::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("configure-mariadb", |services, params| {
        Ok(Box::new(database::ConfigureMariaDb::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("install-phpmyadmin", |services, params| {
        Ok(Box::new(web::InstallAdminConsole::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("install-node", |services, params| {
        Ok(Box::new(runtimes::InstallNode::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("deploy-application", |_, params| {
        Ok(Box::new(application::DeployApplication::from_params(params)?))
    });
    registry.register("configure-iis", |services, params| {
        Ok(Box::new(web::ConfigureIis::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("configure-env", |services, params| {
        Ok(Box::new(application::ConfigureEnv::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("seed-database", |services, params| {
        Ok(Box::new(database::SeedDatabase::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("create-admin-user", |services, params| {
        Ok(Box::new(database::CreateAdminUser::from_params(
            services.clone(),
            params,
        )?))
    });
    registry.register("configure-firewall", |services, params| {
        Ok(Box::new(web::ConfigureFirewall::from_params(
            services.clone(),
            params,
        )?))
    });
}

pub fn default_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    register_defaults(&mut registry);
    registry
}

fn run_script(shell: &dyn HostShell, action: &str, script: impl Into<String>) -> Result<ShellOutput> {
    shell
        .execute(&Invocation::script(script))
        .with_context(|| format!("Failed to {action}"))
}

/// Runs a follow-up that should not fail the step; failures become warnings.
fn run_script_best_effort(
    shell: &dyn HostShell,
    ctx: &mut InstallContext,
    action: &str,
    script: impl Into<String>,
) -> bool {
    match shell.execute(&Invocation::script(script)) {
        Ok(_) => true,
        Err(err) => {
            warn!(action, error = %err, "Non-fatal host command failed");
            ctx.log(format!("Warning: failed to {action}: {err}"));
            false
        }
    }
}

/// Expands `archive` into a clean `staging` directory and returns the payload root.
fn unpack_archive(shell: &dyn HostShell, archive: &Path, staging: &Path) -> Result<PathBuf> {
    fsutil::remove_dir_if_exists(staging)?;
    fsutil::ensure_dir(staging)?;
    let script = format!(
        "$ProgressPreference = 'SilentlyContinue'; Expand-Archive -LiteralPath {} -DestinationPath {} -Force",
        quote_single(&archive.display().to_string()),
        quote_single(&staging.display().to_string())
    );
    run_script(
        shell,
        &format!("extract {}", archive.display()),
        script,
    )?;
    fsutil::single_root(staging)
}

fn download(shell: &dyn HostShell, url: &str, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fsutil::ensure_dir(parent)?;
    }
    let partial = destination.with_extension("partial");
    let script = format!(
        "$ProgressPreference = 'SilentlyContinue'; Invoke-WebRequest -Uri {} -OutFile {} -UseBasicParsing; Move-Item -Force -LiteralPath {} -Destination {}",
        quote_single(url),
        quote_single(&partial.display().to_string()),
        quote_single(&partial.display().to_string()),
        quote_single(&destination.display().to_string())
    );
    run_script(shell, &format!("download {url}"), script)?;
    Ok(())
}

fn machine_path_script(dir: &Path) -> String {
    let dir = quote_single(&dir.display().to_string());
    format!(
        "$path = [Environment]::GetEnvironmentVariable('Path','Machine'); \
         if (-not ($path.Split(';') -contains {dir})) {{ \
         [Environment]::SetEnvironmentVariable('Path', $path + ';' + {dir}, 'Machine') }}"
    )
}

fn take_string(params: &mut StepParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn take_u32(params: &mut StepParameters, key: &str) -> Option<u32> {
    params.remove(key).and_then(|value| match value {
        Value::Number(num) => num.as_u64().and_then(|n| n.try_into().ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn take_bool(params: &mut StepParameters, key: &str) -> Option<bool> {
    params.remove(key).as_ref().and_then(value_as_bool)
}

fn take_string_list(params: &mut StepParameters, key: &str) -> Option<Vec<String>> {
    params.remove(key).map(|value| match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    })
}

/// Starts from `defaults` and applies a `key: value` mapping found under
/// `param`, appending keys the defaults do not cover.
fn take_settings(
    params: &mut StepParameters,
    param: &str,
    defaults: &[(&str, &str)],
) -> Result<Vec<(String, String)>> {
    let mut settings: Vec<(String, String)> = defaults
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    let Some(overrides) = params.remove(param) else {
        return Ok(settings);
    };
    let Value::Object(overrides) = overrides else {
        anyhow::bail!("'{param}' parameter must be a mapping of setting names to values");
    };
    for (key, value) in overrides {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        match settings.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => settings.push((key, value)),
        }
    }
    Ok(settings)
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(num) => num.as_u64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn standard_pipeline_is_registered_in_order() {
        let registry = default_registry();
        let specs = standard_pipeline();
        assert_eq!(specs.len(), 15);
        assert_eq!(specs[0].step, "resolve-inputs");
        assert_eq!(specs[14].step, "configure-firewall");
        assert!(specs.iter().all(|spec| registry.contains(&spec.step)));
        assert_eq!(registry.known_steps().len(), catalogue().len());
    }

    #[test]
    fn parameter_helpers_accept_loose_values() {
        let mut params = StepParameters::new();
        params.insert("force".into(), json!("yes"));
        params.insert("ports".into(), json!("80, 443"));
        params.insert("limit".into(), json!("150"));
        assert_eq!(take_bool(&mut params, "force"), Some(true));
        assert_eq!(
            take_string_list(&mut params, "ports"),
            Some(vec!["80".to_string(), "443".to_string()])
        );
        assert_eq!(take_u32(&mut params, "limit"), Some(150));
        assert!(params.is_empty());
    }

    #[test]
    fn machine_path_script_quotes_directory() {
        let script = machine_path_script(Path::new(r"C:\Program Files\O'Node"));
        assert!(script.contains(r"'C:\Program Files\O''Node'"));
    }
}
