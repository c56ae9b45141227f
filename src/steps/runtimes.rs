use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use super::{
    download, fsutil, machine_path_script, run_script_best_effort, take_settings,
    take_string, take_string_list, templates, unpack_archive,
};
use crate::context::{InstallContext, require};
use crate::detect::{REQUIRED_PHP_EXTENSIONS, Subject};
use crate::pipeline::{Step, StepParameters, StepServices};
use crate::progress::SharedValue;
use crate::shell::Invocation;

const DEFAULT_PHP_INI: [(&str, &str); 5] = [
    ("memory_limit", "256M"),
    ("max_execution_time", "300"),
    ("upload_max_filesize", "20M"),
    ("post_max_size", "20M"),
    ("max_input_vars", "3000"),
];

const COMPOSER_URL: &str = "https://getcomposer.org/composer-stable.phar";

fn version_line(services: &StepServices, program: &Path) -> Option<String> {
    services
        .shell
        .execute(&Invocation::program(program, ["-v"]))
        .ok()
        .map(|out| out.first_line().to_string())
}

pub(crate) struct InstallPhp {
    services: StepServices,
    extensions: Vec<String>,
    ini_settings: Vec<(String, String)>,
}

impl InstallPhp {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        let extensions = take_string_list(&mut params, "extensions").unwrap_or_else(|| {
            REQUIRED_PHP_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect()
        });
        let ini_settings = take_settings(&mut params, "ini", &DEFAULT_PHP_INI)?;
        Ok(Self {
            services,
            extensions,
            ini_settings,
        })
    }

    fn unpack(&self, ctx: &mut InstallContext, php_dir: &Path, downloads: &Path) -> Result<()> {
        let archive = require(
            &ctx.facts.archives.php_nts_zip,
            "php_nts_zip",
            "Validate Local Prerequisites",
        )?
        .clone();
        ctx.log(format!("Installing PHP from {}", archive.display()));
        let root = unpack_archive(
            self.services.shell.as_ref(),
            &archive,
            &downloads.join("php-nts-extracted"),
        )?;
        fsutil::remove_dir_if_exists(php_dir).context("Failed to remove existing PHP directory")?;
        let copied = fsutil::copy_dir(&root, php_dir).context("Failed to copy PHP files")?;
        ctx.log(format!("Copied {copied} file(s) into {}", php_dir.display()));
        Ok(())
    }

    fn configure_ini(&self, ctx: &mut InstallContext, php_dir: &Path, php_ini: &Path) -> Result<()> {
        if !php_ini.is_file() {
            let production = php_dir.join("php.ini-production");
            let development = php_dir.join("php.ini-development");
            let template = if production.is_file() {
                production
            } else if development.is_file() {
                development
            } else {
                bail!("php.ini-production not found in {}", php_dir.display());
            };
            fsutil::copy_file(&template, php_ini).context("Failed to create php.ini")?;
        }

        let contents = fs::read_to_string(php_ini)
            .with_context(|| format!("Failed to read {}", php_ini.display()))?;
        let extensions: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
        let mut ini = fsutil::enable_extensions(&contents, &extensions);
        for (key, value) in &self.ini_settings {
            ini = fsutil::set_ini_value(&ini, key, value);
        }
        fs::write(php_ini, ini).with_context(|| format!("Failed to write {}", php_ini.display()))?;
        ctx.log(format!(
            "Configured {} with {} extension(s)",
            php_ini.display(),
            extensions.len()
        ));
        Ok(())
    }
}

impl Step for InstallPhp {
    fn name(&self) -> &str {
        "Install PHP"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let php_dir = require(&ctx.facts.php_dir, "php_dir", "Resolve Inputs")?.clone();
        let downloads = require(&ctx.facts.downloads_dir, "downloads_dir", "Resolve Inputs")?.clone();
        let php_exe = php_dir.join("php.exe");
        let php_ini = php_dir.join("php.ini");
        let policy = self.services.policy;
        let detector = self.services.detector.as_ref();

        let mut install_runtime = policy.requires_action(detector, Subject::PhpRuntime, ctx)?;
        if !install_runtime && !php_exe.is_file() {
            ctx.log(format!(
                "php.exe not found at {}; installing anyway",
                php_exe.display()
            ));
            install_runtime = true;
        }
        if install_runtime {
            self.unpack(ctx, &php_dir, &downloads)?;
        }

        if install_runtime
            || !php_ini.is_file()
            || policy.requires_action(detector, Subject::PhpExtensions, ctx)?
        {
            self.configure_ini(ctx, &php_dir, &php_ini)?;
        }

        run_script_best_effort(
            self.services.shell.as_ref(),
            ctx,
            "add PHP to the machine PATH",
            machine_path_script(&php_dir),
        );

        if !php_exe.is_file() {
            bail!("php.exe not found at {}", php_exe.display());
        }
        match version_line(&self.services, &php_exe) {
            Some(version) => ctx.log(format!("PHP available: {version}")),
            None => ctx.log("Warning: php.exe -v failed"),
        }

        ctx.facts.php_exe_path = Some(php_exe.clone());
        ctx.facts.php_ini_path = Some(php_ini);
        ctx.publish("php.exe", SharedValue::Path(php_exe));
        info!(php_dir = %php_dir.display(), "PHP ready");
        Ok(())
    }
}

pub(crate) struct InstallComposer {
    services: StepServices,
    url: String,
}

impl InstallComposer {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        let url = take_string(&mut params, "url").unwrap_or_else(|| COMPOSER_URL.to_string());
        Ok(Self { services, url })
    }
}

impl Step for InstallComposer {
    fn name(&self) -> &str {
        "Install Composer"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let php_dir = require(&ctx.facts.php_dir, "php_dir", "Resolve Inputs")?.clone();
        let php_exe = require(&ctx.facts.php_exe_path, "php_exe_path", "Install PHP")?.clone();

        let phar = php_dir.join("composer.phar");
        if phar.is_file() {
            ctx.log(format!("composer.phar already present at {}", phar.display()));
        } else {
            ctx.log("Downloading composer.phar...");
            download(self.services.shell.as_ref(), &self.url, &phar)
                .context("Failed to download composer.phar")?;
        }

        let wrapper = php_dir.join("composer.bat");
        fs::write(&wrapper, templates::composer_wrapper(&php_exe))
            .with_context(|| format!("Failed to write composer wrapper: {}", wrapper.display()))?;

        ctx.log(format!("Composer available via {}", wrapper.display()));
        ctx.facts.composer_path = Some(wrapper.clone());
        ctx.publish("composer.path", SharedValue::Path(wrapper));
        Ok(())
    }
}

pub(crate) struct InstallNode {
    services: StepServices,
}

impl InstallNode {
    pub(crate) fn from_params(services: StepServices, _params: StepParameters) -> Result<Self> {
        Ok(Self { services })
    }
}

impl Step for InstallNode {
    fn name(&self) -> &str {
        "Install Node.js"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let node_dir = require(&ctx.facts.node_dir, "node_dir", "Resolve Inputs")?.clone();
        let downloads = require(&ctx.facts.downloads_dir, "downloads_dir", "Resolve Inputs")?.clone();
        let node_exe = node_dir.join("node.exe");
        let npm_cmd = node_dir.join("npm.cmd");

        let mut install = self.services.policy.requires_action(
            self.services.detector.as_ref(),
            Subject::NodeRuntime,
            ctx,
        )?;
        if !install && !node_exe.is_file() {
            ctx.log(format!(
                "node.exe not found at {}; installing anyway",
                node_exe.display()
            ));
            install = true;
        }

        if install {
            let archive = require(
                &ctx.facts.archives.node_zip,
                "node_zip",
                "Validate Local Prerequisites",
            )?
            .clone();
            ctx.log(format!("Installing Node.js from {}", archive.display()));
            let root = unpack_archive(
                self.services.shell.as_ref(),
                &archive,
                &downloads.join("node-extracted"),
            )?;
            fsutil::remove_dir_if_exists(&node_dir)
                .context("Failed to remove existing Node.js directory")?;
            fsutil::copy_dir(&root, &node_dir).context("Failed to copy Node.js files")?;

            for required in [&node_exe, &npm_cmd] {
                if !required.is_file() {
                    return Err(anyhow!("{} not found after unpacking", required.display()));
                }
            }
            run_script_best_effort(
                self.services.shell.as_ref(),
                ctx,
                "add Node.js to the machine PATH",
                machine_path_script(&node_dir),
            );
        }

        if let Some(version) = version_line(&self.services, &node_exe) {
            ctx.log(format!("Node.js available: {version}"));
        }
        ctx.facts.node_bin_dir = Some(node_dir.clone());
        ctx.publish("node.bin_dir", SharedValue::Path(node_dir));
        Ok(())
    }
}
