use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use glob::Pattern;
use tracing::info;

use super::{fsutil, take_bool};
use crate::context::{Archives, InstallContext, require};
use crate::digest::{compute_sha256, verify_sha256};
use crate::pipeline::{Step, StepParameters};
use crate::progress::SharedValue;

pub(crate) struct ResolveInputs;

impl ResolveInputs {
    pub(crate) fn from_params(_params: StepParameters) -> Result<Self> {
        Ok(Self)
    }
}

fn absolutize(path: &Path, what: &str) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        bail!("{what} path is empty");
    }
    std::path::absolute(path)
        .with_context(|| format!("Failed to resolve {what} path: {}", path.display()))
}

impl Step for ResolveInputs {
    fn name(&self) -> &str {
        "Resolve Inputs"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let paths = ctx.settings.paths.clone();
        let bundle = absolutize(&ctx.settings.bundle_dir, "bundle")?;

        let runtime_dir = absolutize(&paths.runtime_dir, "runtime directory")?;
        let prerequisites_dir = absolutize(
            &paths
                .prerequisites_dir
                .unwrap_or_else(|| bundle.join("Prerequisites")),
            "prerequisites directory",
        )?;
        let source_dir = absolutize(
            &paths.source_dir.unwrap_or_else(|| bundle.join("app_source")),
            "application source",
        )?;
        let downloads_dir = absolutize(
            &paths.downloads_dir.unwrap_or_else(|| bundle.join("downloads")),
            "downloads directory",
        )?;
        let php_dir = absolutize(&paths.php_dir, "PHP directory")?;
        let node_dir = absolutize(&paths.node_dir, "Node.js directory")?;
        let admin_console_dir = absolutize(&paths.admin_console_dir, "phpMyAdmin directory")?;
        let sql_dump = absolutize(&paths.sql_dump, "SQL dump")?;

        let facts = &mut ctx.facts;
        facts.runtime_dir = Some(runtime_dir.clone());
        facts.prerequisites_dir = Some(prerequisites_dir.clone());
        facts.source_dir = Some(source_dir.clone());
        facts.downloads_dir = Some(downloads_dir.clone());
        facts.php_dir = Some(php_dir.clone());
        facts.node_dir = Some(node_dir.clone());
        facts.admin_console_dir = Some(admin_console_dir.clone());
        facts.sql_dump = Some(sql_dump.clone());

        ctx.publish("paths.runtime_dir", SharedValue::Path(runtime_dir.clone()));
        ctx.publish("paths.source_dir", SharedValue::Path(source_dir.clone()));
        ctx.publish("paths.downloads_dir", SharedValue::Path(downloads_dir.clone()));

        let database = ctx.settings.database.clone();
        let admin = ctx.settings.admin.clone();
        ctx.log(format!("Runtime directory set to {}", runtime_dir.display()));
        ctx.log(format!("Prerequisites directory: {}", prerequisites_dir.display()));
        ctx.log(format!("Application source directory: {}", source_dir.display()));
        ctx.log(format!("Downloads directory: {}", downloads_dir.display()));
        ctx.log(format!("PHP will be installed to {}", php_dir.display()));
        ctx.log(format!("Node.js will be installed to {}", node_dir.display()));
        ctx.log(format!(
            "phpMyAdmin will be installed to {}",
            admin_console_dir.display()
        ));
        ctx.log(format!("SQL dump located at {}", sql_dump.display()));
        ctx.log(format!(
            "Database {} with user {} will be created",
            database.name, database.user
        ));
        ctx.log(format!(
            "Admin user {} <{}> will be provisioned",
            admin.name, admin.email
        ));
        Ok(())
    }
}

struct ArchiveKind {
    label: &'static str,
    pattern: &'static str,
    exclude: Option<&'static str>,
}

const ARCHIVES: [ArchiveKind; 6] = [
    ArchiveKind {
        label: "Composer installer",
        pattern: "Composer-Setup*.exe",
        exclude: None,
    },
    ArchiveKind {
        label: "MariaDB installer",
        pattern: "mariadb-*-winx64.msi",
        exclude: None,
    },
    ArchiveKind {
        label: "Node.js archive",
        pattern: "node-v*-win-x64.zip",
        exclude: None,
    },
    ArchiveKind {
        label: "PHP NTS archive",
        pattern: "php-*-nts-Win32-*-x64.zip",
        exclude: None,
    },
    ArchiveKind {
        label: "PHP TS archive",
        pattern: "php-*-Win32-*-x64.zip",
        exclude: Some("-nts-"),
    },
    ArchiveKind {
        label: "phpMyAdmin archive",
        pattern: "phpMyAdmin-*-all-languages.zip",
        exclude: None,
    },
];

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum NamePart {
    Number(u64),
    Text(String),
}

/// Splits a file name into digit runs and text so that `8.3.27` sorts after
/// `8.3.9`.
fn version_key(name: &str) -> Vec<NamePart> {
    let mut parts = Vec::new();
    let mut chars = name.chars().peekable();
    while let Some(&first) = chars.peek() {
        let digits = first.is_ascii_digit();
        let mut run = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() != digits {
                break;
            }
            run.push(c);
            chars.next();
        }
        parts.push(match run.parse::<u64>() {
            Ok(number) if digits => NamePart::Number(number),
            _ => NamePart::Text(run.to_ascii_lowercase()),
        });
    }
    parts
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Highest-versioned file in `dir` matching `kind`.
fn locate(dir: &Path, kind: &ArchiveKind) -> Option<PathBuf> {
    let pattern = PathBuf::from(Pattern::escape(&dir.to_string_lossy())).join(kind.pattern);
    glob::glob(&pattern.to_string_lossy())
        .ok()?
        .flatten()
        .filter(|path| path.is_file())
        .filter(|path| kind.exclude.is_none_or(|needle| !file_name(path).contains(needle)))
        .max_by_key(|path| version_key(&file_name(path)))
}

pub(crate) struct CheckPrerequisites {
    record_digests: bool,
    checksums: BTreeMap<String, String>,
}

impl CheckPrerequisites {
    pub(crate) fn from_params(mut params: StepParameters) -> Result<Self> {
        let record_digests = take_bool(&mut params, "digests").unwrap_or(true);
        let checksums = match params.remove("checksums") {
            None => BTreeMap::new(),
            Some(value) => serde_json::from_value(value).map_err(|err| {
                anyhow!("check-prerequisites 'checksums' must map file names to hex digests: {err}")
            })?,
        };
        Ok(Self {
            record_digests,
            checksums,
        })
    }

    fn record(&self, ctx: &mut InstallContext, kind: &ArchiveKind, path: &Path) -> Result<()> {
        let file_name = file_name(path);
        let digest = match self.checksums.get(&file_name) {
            Some(expected) => Some(verify_sha256(path, expected)?),
            None if self.record_digests => Some(compute_sha256(path)?),
            None => None,
        };
        match digest {
            Some(digest) => {
                ctx.log(format!("Located {}: {} (sha256 {digest})", kind.label, path.display()));
                ctx.publish(&format!("digest.{file_name}"), SharedValue::Text(digest));
            }
            None => ctx.log(format!("Located {}: {}", kind.label, path.display())),
        }
        Ok(())
    }
}

impl Step for CheckPrerequisites {
    fn name(&self) -> &str {
        "Validate Local Prerequisites"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let prerequisites_dir =
            require(&ctx.facts.prerequisites_dir, "prerequisites_dir", "Resolve Inputs")?.clone();
        let source_dir = require(&ctx.facts.source_dir, "source_dir", "Resolve Inputs")?.clone();
        let downloads_dir =
            require(&ctx.facts.downloads_dir, "downloads_dir", "Resolve Inputs")?.clone();

        if !prerequisites_dir.is_dir() {
            bail!(
                "prerequisites directory not found at {}",
                prerequisites_dir.display()
            );
        }
        ctx.log(format!(
            "Using prerequisites directory {}",
            prerequisites_dir.display()
        ));

        let mut found = Vec::with_capacity(ARCHIVES.len());
        let mut missing = Vec::new();
        for kind in &ARCHIVES {
            match locate(&prerequisites_dir, kind) {
                Some(path) => {
                    self.record(ctx, kind, &path)?;
                    found.push(path);
                }
                None => missing.push(format!("{} ({})", kind.label, kind.pattern)),
            }
        }
        if !missing.is_empty() {
            bail!("missing prerequisite files: {}", missing.join(", "));
        }

        let located: [PathBuf; 6] = found
            .try_into()
            .map_err(|_| anyhow!("prerequisite scan returned an unexpected number of files"))?;
        let [
            composer_installer,
            mariadb_installer,
            node_zip,
            php_nts_zip,
            php_ts_zip,
            admin_console_zip,
        ] = located;
        ctx.facts.archives = Archives {
            composer_installer: Some(composer_installer),
            mariadb_installer: Some(mariadb_installer),
            node_zip: Some(node_zip),
            php_nts_zip: Some(php_nts_zip),
            php_ts_zip: Some(php_ts_zip),
            admin_console_zip: Some(admin_console_zip),
        };

        if !source_dir.is_dir() {
            bail!(
                "application source directory not found at {}",
                source_dir.display()
            );
        }
        ctx.log(format!("Using application source directory {}", source_dir.display()));

        fsutil::ensure_dir(&downloads_dir).context("Failed to prepare downloads directory")?;
        ctx.log(format!(
            "Downloads directory available at {}",
            downloads_dir.display()
        ));
        info!(prerequisites = %prerequisites_dir.display(), "Prerequisites validated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_archive_pattern_skips_nts_build() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("php-8.3.27-nts-Win32-vs16-x64.zip"), "").unwrap();
        let ts = &ARCHIVES[4];
        assert_eq!(locate(tmp.path(), ts), None);

        std::fs::write(tmp.path().join("php-8.3.27-Win32-vs16-x64.zip"), "").unwrap();
        assert_eq!(
            locate(tmp.path(), ts),
            Some(tmp.path().join("php-8.3.27-Win32-vs16-x64.zip"))
        );
        assert_eq!(
            locate(tmp.path(), &ARCHIVES[3]),
            Some(tmp.path().join("php-8.3.27-nts-Win32-vs16-x64.zip"))
        );
    }

    #[test]
    fn newest_version_wins_over_string_order() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [
            "node-v20.9.0-win-x64.zip",
            "node-v20.11.0-win-x64.zip",
            "node-v18.19.1-win-x64.zip",
        ] {
            std::fs::write(tmp.path().join(name), "").unwrap();
        }
        assert_eq!(
            locate(tmp.path(), &ARCHIVES[2]),
            Some(tmp.path().join("node-v20.11.0-win-x64.zip"))
        );

        std::fs::write(tmp.path().join("php-8.3.9-nts-Win32-vs16-x64.zip"), "").unwrap();
        std::fs::write(tmp.path().join("php-8.3.27-nts-Win32-vs16-x64.zip"), "").unwrap();
        assert_eq!(
            locate(tmp.path(), &ARCHIVES[3]),
            Some(tmp.path().join("php-8.3.27-nts-Win32-vs16-x64.zip"))
        );
    }

    #[test]
    fn version_key_compares_digit_runs_numerically() {
        assert!(version_key("php-8.3.27") > version_key("php-8.3.9"));
        assert!(version_key("mariadb-11.4.2") > version_key("mariadb-10.11.8"));
        assert_eq!(version_key("Composer-Setup.exe"), version_key("composer-setup.exe"));
    }
}
