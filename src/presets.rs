use anyhow::{Context, Result};
use serde::Serialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::profile::{PROFILE_VERSION, Secret, SiteSettings};

pub const PRESETS: [&str; 3] = ["full", "runtimes", "database"];

#[derive(Debug, Clone, Serialize)]
struct PresetProfile {
    version: u32,
    paths: PathPreset,
    database: DatabasePreset,
    admin: AdminPreset,
    site: SiteSettings,
    detection: DetectionPreset,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipeline: Option<Vec<StepEntry>>,
}

#[derive(Debug, Clone, Serialize)]
struct PathPreset {
    runtime_dir: PathBuf,
    php_dir: PathBuf,
    node_dir: PathBuf,
    admin_console_dir: PathBuf,
    sql_dump: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
struct DatabasePreset {
    root_password: Secret,
    name: String,
    user: String,
    user_password: Secret,
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Serialize)]
struct AdminPreset {
    name: String,
    email: String,
    password: Secret,
}

#[derive(Debug, Clone, Serialize)]
struct DetectionPreset {
    strict: bool,
}

#[derive(Debug, Clone, Serialize)]
struct StepEntry {
    step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<BTreeMap<String, Value>>,
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = match name {
        "full" => full_preset(),
        "runtimes" => runtimes_preset(),
        "database" => database_preset(),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    };

    let rendered = serde_yaml::to_string(&preset)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write install profile: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn base_profile(pipeline: Option<Vec<StepEntry>>) -> PresetProfile {
    PresetProfile {
        version: PROFILE_VERSION,
        paths: PathPreset {
            runtime_dir: PathBuf::from(r"C:\inetpub\app"),
            php_dir: PathBuf::from(r"C:\PHP"),
            node_dir: PathBuf::from(r"C:\nodejs"),
            admin_console_dir: PathBuf::from(r"C:\inetpub\wwwroot\phpMyAdmin"),
            sql_dump: PathBuf::from("./database/seed.sql"),
        },
        database: DatabasePreset {
            root_password: Secret::new("change-me-root"),
            name: "app".into(),
            user: "app".into(),
            user_password: Secret::new("change-me-app"),
            host: "127.0.0.1".into(),
            port: 3306,
        },
        admin: AdminPreset {
            name: "Administrator".into(),
            email: "admin@example.com".into(),
            password: Secret::new("change-me-admin"),
        },
        site: SiteSettings::default(),
        detection: DetectionPreset { strict: false },
        pipeline,
    }
}

fn full_preset() -> PresetProfile {
    let mut pipeline: Vec<StepEntry> = crate::steps::standard_pipeline()
        .into_iter()
        .map(|spec| step(&spec.step, None))
        .collect();
    if let Some(seed) = pipeline.iter_mut().find(|entry| entry.step == "seed-database") {
        seed.params = Some(params(vec![("force", Value::Bool(false))]));
    }
    base_profile(Some(pipeline))
}

fn runtimes_preset() -> PresetProfile {
    base_profile(Some(vec![
        step("resolve-inputs", None),
        step("check-prerequisites", None),
        step("install-iis-features", None),
        step(
            "install-php",
            Some(params(vec![(
                "ini",
                mapping(vec![("memory_limit", val_str("512M"))]),
            )])),
        ),
        step("install-composer", None),
        step("install-node", None),
    ]))
}

fn database_preset() -> PresetProfile {
    base_profile(Some(vec![
        step("resolve-inputs", None),
        step("check-prerequisites", None),
        step("install-php", None),
        step("install-mariadb", None),
        step(
            "configure-mariadb",
            Some(params(vec![(
                "tuning",
                mapping(vec![("innodb_buffer_pool_size", val_str("512M"))]),
            )])),
        ),
        step("install-phpmyadmin", None),
        step("seed-database", None),
        step("create-admin-user", None),
    ]))
}

fn step(name: &str, params: Option<BTreeMap<String, Value>>) -> StepEntry {
    StepEntry {
        step: name.into(),
        params,
    }
}

fn params(entries: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

fn mapping(entries: Vec<(&str, Value)>) -> Value {
    Value::Mapping(
        entries
            .into_iter()
            .map(|(k, v)| (val_str(k), v))
            .collect(),
    )
}

fn val_str(value: &str) -> Value {
    Value::String(value.to_string())
}
