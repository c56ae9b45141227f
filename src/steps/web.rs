use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::info;

use super::{
    download, fsutil, run_script, run_script_best_effort, take_string, take_string_list,
    templates, unpack_archive,
};
use crate::context::{InstallContext, require};
use crate::detect::{FIREWALL_RULE_GROUP, Subject};
use crate::pipeline::{Step, StepParameters, StepServices};
use crate::profile::SiteSettings;
use crate::progress::SharedValue;
use crate::shell::{Invocation, quote_single};

const IIS_FEATURES: [&str; 16] = [
    "IIS-WebServerRole",
    "IIS-WebServer",
    "IIS-CommonHttpFeatures",
    "IIS-HttpErrors",
    "IIS-ApplicationDevelopment",
    "IIS-NetFxExtensibility45",
    "IIS-HealthAndDiagnostics",
    "IIS-HttpLogging",
    "IIS-Security",
    "IIS-RequestFiltering",
    "IIS-Performance",
    "IIS-WebServerManagementTools",
    "IIS-ManagementConsole",
    "IIS-CGI",
    "IIS-ISAPIExtensions",
    "IIS-ISAPIFilter",
];

const REWRITE_URL: &str = "https://download.microsoft.com/download/1/2/7/12743496-1E04-4B0B-B9F4-651F5B8C0082/rewrite_amd64_en-US.msi";

pub fn enable_features_script(features: &[String]) -> String {
    let list = features
        .iter()
        .map(|feature| quote_single(feature))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "foreach ($feature in @({list})) {{\n\
         \x20   $state = (Get-WindowsOptionalFeature -Online -FeatureName $feature).State\n\
         \x20   if ($state -ne 'Enabled') {{ Enable-WindowsOptionalFeature -Online -FeatureName $feature -All -NoRestart | Out-Null }}\n\
         }}"
    )
}

fn msi_install_script(msi: &Path) -> String {
    format!(
        "$process = Start-Process msiexec.exe -ArgumentList @('/i', {}, '/quiet', '/norestart') -Wait -PassThru; \
         if ($process.ExitCode -ne 0 -and $process.ExitCode -ne 3010) {{ throw \"msiexec exited with $($process.ExitCode)\" }}",
        quote_single(&msi.display().to_string())
    )
}

pub(crate) struct InstallIisFeatures {
    services: StepServices,
    features: Vec<String>,
    rewrite_url: String,
}

impl InstallIisFeatures {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        let features = take_string_list(&mut params, "features")
            .unwrap_or_else(|| IIS_FEATURES.iter().map(|f| f.to_string()).collect());
        if features.is_empty() {
            bail!("install-iis-features 'features' must list at least one feature");
        }
        let rewrite_url =
            take_string(&mut params, "rewrite_url").unwrap_or_else(|| REWRITE_URL.to_string());
        Ok(Self {
            services,
            features,
            rewrite_url,
        })
    }
}

impl Step for InstallIisFeatures {
    fn name(&self) -> &str {
        "Install IIS Features"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let policy = self.services.policy;
        let detector = self.services.detector.as_ref();
        let shell = self.services.shell.as_ref();

        if policy.requires_action(detector, Subject::WebServerRole, ctx)? {
            run_script(shell, "enable IIS features", enable_features_script(&self.features))?;
            ctx.log(format!("IIS core features ensured ({})", self.features.len()));
        }

        if policy.requires_action(detector, Subject::UrlRewrite, ctx)? {
            let downloads =
                require(&ctx.facts.downloads_dir, "downloads_dir", "Resolve Inputs")?.clone();
            let msi = downloads.join("rewrite_amd64_en-US.msi");
            if msi.is_file() {
                ctx.log(format!("Using cached URL Rewrite installer {}", msi.display()));
            } else {
                ctx.log("Downloading IIS URL Rewrite installer...");
                download(shell, &self.rewrite_url, &msi)
                    .context("Failed to download URL Rewrite")?;
            }
            run_script(shell, "install URL Rewrite", msi_install_script(&msi))?;
            ctx.log("IIS URL Rewrite installed successfully");
        }
        Ok(())
    }
}

pub(crate) struct InstallAdminConsole {
    services: StepServices,
}

impl InstallAdminConsole {
    pub(crate) fn from_params(services: StepServices, _params: StepParameters) -> Result<Self> {
        Ok(Self { services })
    }
}

impl Step for InstallAdminConsole {
    fn name(&self) -> &str {
        "Install phpMyAdmin"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let target = require(
            &ctx.facts.admin_console_dir,
            "admin_console_dir",
            "Resolve Inputs",
        )?
        .clone();
        let config = target.join("config.inc.php");

        if config.is_file() {
            ctx.log(format!(
                "phpMyAdmin already configured at {}; skipping",
                config.display()
            ));
            ctx.publish("phpmyadmin.dir", SharedValue::Path(target));
            return Ok(());
        }

        let archive = require(
            &ctx.facts.archives.admin_console_zip,
            "admin_console_zip",
            "Validate Local Prerequisites",
        )?
        .clone();
        let downloads = require(&ctx.facts.downloads_dir, "downloads_dir", "Resolve Inputs")?.clone();

        ctx.log(format!("Installing phpMyAdmin to {}", target.display()));
        let root = unpack_archive(
            self.services.shell.as_ref(),
            &archive,
            &downloads.join("phpmyadmin-extracted"),
        )?;
        fsutil::remove_dir_if_exists(&target)
            .context("Failed to remove existing phpMyAdmin directory")?;
        fsutil::copy_dir(&root, &target).context("Failed to copy phpMyAdmin files")?;

        let sample = target.join("config.sample.inc.php");
        if !sample.is_file() {
            bail!("config.sample.inc.php not found in {}", target.display());
        }
        let sample_contents = fs::read_to_string(&sample)
            .with_context(|| format!("Failed to read {}", sample.display()))?;
        let secret_line = format!(
            "$cfg['blowfish_secret'] = '{}';",
            fsutil::random_secret(32)
        );
        let mut contents = fsutil::replace_first(
            &sample_contents,
            "$cfg['blowfish_secret'] = '';",
            &secret_line,
        )
        .unwrap_or_else(|| format!("{sample_contents}\n{secret_line}\n"));
        let database = &ctx.settings.database;
        contents.push_str(&templates::admin_console_servers(&database.host, database.port));
        fs::write(&config, contents)
            .with_context(|| format!("Failed to write {}", config.display()))?;

        ctx.log("phpMyAdmin deployed; accessible via IIS once the site is configured");
        ctx.publish("phpmyadmin.dir", SharedValue::Path(target));
        Ok(())
    }
}

pub fn site_url(site: &SiteSettings) -> String {
    if site.port == 80 {
        "http://localhost/".to_string()
    } else {
        format!("http://localhost:{}/", site.port)
    }
}

pub(crate) struct ConfigureIis {
    services: StepServices,
    virtual_dir: String,
}

impl ConfigureIis {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        let virtual_dir =
            take_string(&mut params, "virtual_dir").unwrap_or_else(|| "frontend".to_string());
        if virtual_dir.trim().is_empty() || virtual_dir.contains(['/', '\\']) {
            bail!("configure-iis 'virtual_dir' must be a single path segment");
        }
        Ok(Self {
            services,
            virtual_dir,
        })
    }

    fn site_script(
        &self,
        site: &SiteSettings,
        backend: &Path,
        frontend: &Path,
        php_cgi: &Path,
    ) -> String {
        let php_cgi = php_cgi.display().to_string();
        format!(
            r#"Import-Module WebAdministration
$pool = {pool}
if (-not (Test-Path "IIS:\AppPools\$pool")) {{ New-WebAppPool -Name $pool | Out-Null }}
Set-ItemProperty "IIS:\AppPools\$pool" managedRuntimeVersion ""
Set-ItemProperty "IIS:\AppPools\$pool" managedPipelineMode "Integrated"
Set-ItemProperty "IIS:\AppPools\$pool" enable32BitAppOnWin64 0
$site = {site}
$physical = {backend}
if (Get-Website -Name $site -ErrorAction SilentlyContinue) {{
    Set-ItemProperty "IIS:\Sites\$site" physicalPath $physical
    Set-ItemProperty "IIS:\Sites\$site" applicationPool $pool
}} else {{
    New-Website -Name $site -Port {port} -PhysicalPath $physical -ApplicationPool $pool | Out-Null
}}
$vdir = {vdir}
if (Get-WebVirtualDirectory -Site $site -Name $vdir -ErrorAction SilentlyContinue) {{
    Remove-WebVirtualDirectory -Site $site -Application '/' -Name $vdir
}}
New-WebVirtualDirectory -Site $site -Name $vdir -PhysicalPath {frontend} | Out-Null
$appcmd = Join-Path $env:windir 'system32\inetsrv\appcmd.exe'
& $appcmd set config -section:system.webServer/handlers /-"[name='PHP_via_FastCGI']" 2>$null
& $appcmd set config -section:system.webServer/fastCgi /-"[fullPath='{cgi}']" 2>$null
& $appcmd set config -section:system.webServer/fastCgi /+"[fullPath='{cgi}']" /commit:apphost | Out-Null
& $appcmd set config -section:system.webServer/handlers /+"[name='PHP_via_FastCGI',path='*.php',verb='GET,HEAD,POST,PUT,DELETE,PATCH,OPTIONS',modules='FastCgiModule',scriptProcessor='{cgi}',resourceType='Either',requireAccess='Script']" /commit:apphost | Out-Null"#,
            pool = quote_single(&site.app_pool),
            site = quote_single(&site.name),
            backend = quote_single(&backend.display().to_string()),
            port = site.port,
            vdir = quote_single(&self.virtual_dir),
            frontend = quote_single(&frontend.display().to_string()),
            cgi = php_cgi.replace('\'', "''"),
        )
    }
}

impl Step for ConfigureIis {
    fn name(&self) -> &str {
        "Configure IIS"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let runtime_dir = require(&ctx.facts.runtime_dir, "runtime_dir", "Resolve Inputs")?.clone();
        let php_dir = require(&ctx.facts.php_dir, "php_dir", "Resolve Inputs")?.clone();
        let backend = runtime_dir.join("backend").join("public");
        let frontend = runtime_dir.join("frontend").join("dist");
        if !backend.is_dir() {
            bail!("backend public directory not found at {}", backend.display());
        }
        if !frontend.is_dir() {
            bail!("frontend dist directory not found at {}", frontend.display());
        }
        let php_cgi = php_dir.join("php-cgi.exe");
        if !php_cgi.is_file() {
            bail!("php-cgi.exe not found at {}", php_cgi.display());
        }

        let site = ctx.settings.site.clone();
        let script = self.site_script(&site, &backend, &frontend, &php_cgi);
        run_script(self.services.shell.as_ref(), "configure IIS", script)?;
        ctx.log(format!(
            "IIS site {} bound to port {} with app pool {}",
            site.name, site.port, site.app_pool
        ));

        let backend_config = backend.join("web.config");
        fs::write(&backend_config, templates::backend_web_config(&php_cgi))
            .with_context(|| format!("Failed to write {}", backend_config.display()))?;
        let frontend_config = frontend.join("web.config");
        fs::write(&frontend_config, templates::frontend_web_config(&self.virtual_dir))
            .with_context(|| format!("Failed to write {}", frontend_config.display()))?;

        let writable = [
            runtime_dir.join("backend").join("storage"),
            runtime_dir.join("backend").join("bootstrap").join("cache"),
            runtime_dir.join("backend").join("storage").join("app").join("public"),
        ];
        for dir in writable.iter().filter(|dir| dir.is_dir()) {
            run_script_best_effort(
                self.services.shell.as_ref(),
                ctx,
                &format!("grant IIS write access on {}", dir.display()),
                format!(
                    "icacls {} /grant 'IIS_IUSRS:(OI)(CI)M' /T /Q | Out-Null",
                    quote_single(&dir.display().to_string())
                ),
            );
        }

        let url = site_url(&site);
        ctx.log(format!("IIS configured; site available at {url}"));
        ctx.facts.site_url = Some(url.clone());
        ctx.publish("site.url", SharedValue::Url(url));
        info!(site = site.name.as_str(), "IIS configured");
        Ok(())
    }
}

pub(crate) struct ConfigureFirewall {
    services: StepServices,
    ports: Option<Vec<u16>>,
}

impl ConfigureFirewall {
    pub(crate) fn from_params(services: StepServices, mut params: StepParameters) -> Result<Self> {
        let ports = match take_string_list(&mut params, "ports") {
            None => None,
            Some(raw) => {
                let mut ports = Vec::with_capacity(raw.len());
                for value in raw {
                    let port = value.trim().parse::<u16>().with_context(|| {
                        format!("configure-firewall port '{value}' is not a valid TCP port")
                    })?;
                    ports.push(port);
                }
                Some(ports)
            }
        };
        Ok(Self { services, ports })
    }

    fn ports(&self, site: &SiteSettings) -> Vec<u16> {
        let mut ports = self.ports.clone().unwrap_or_else(|| vec![site.port, 443]);
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

pub fn firewall_script(ports: &[u16]) -> String {
    let group = quote_single(FIREWALL_RULE_GROUP);
    let mut script = format!(
        "Get-NetFirewallRule -Group {group} -ErrorAction SilentlyContinue | Remove-NetFirewallRule\n"
    );
    for port in ports {
        let display = quote_single(&format!("{FIREWALL_RULE_GROUP} TCP {port}"));
        script.push_str(&format!(
            "New-NetFirewallRule -DisplayName {display} -Group {group} -Direction Inbound -Protocol TCP -LocalPort {port} -Action Allow | Out-Null\n"
        ));
    }
    script
}

/// Lists the local ports opened by the rules in the installer's group, one per line.
pub fn firewall_ports_query() -> String {
    format!(
        "Get-NetFirewallRule -Group {} -ErrorAction SilentlyContinue | Get-NetFirewallPortFilter | ForEach-Object {{ $_.LocalPort }}",
        quote_single(FIREWALL_RULE_GROUP)
    )
}

/// Sorted, deduplicated ports from [`firewall_ports_query`] output. `None`
/// when a rule opens anything other than a single port.
pub fn parse_open_ports(output: &str) -> Option<Vec<u16>> {
    let mut ports = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.parse::<u16>().ok())
        .collect::<Option<Vec<_>>>()?;
    ports.sort_unstable();
    ports.dedup();
    Some(ports)
}

fn list_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ConfigureFirewall {
    fn open_ports(&self) -> Option<Vec<u16>> {
        let output = self
            .services
            .shell
            .execute(&Invocation::script(firewall_ports_query()))
            .ok()?;
        parse_open_ports(&output.stdout)
    }
}

impl Step for ConfigureFirewall {
    fn name(&self) -> &str {
        "Configure Firewall"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let ports = self.ports(&ctx.settings.site);
        let rules_present = !self.services.policy.requires_action(
            self.services.detector.as_ref(),
            Subject::FirewallRules,
            ctx,
        )?;
        if rules_present {
            // The group belongs to the installer, so anything unexpected is replaced.
            match self.open_ports() {
                Some(open) if open == ports => {
                    ctx.log(format!("Firewall rules already open TCP {}", list_ports(&ports)));
                    return Ok(());
                }
                Some(open) => ctx.log(format!(
                    "Firewall rules open TCP {}; replacing them",
                    list_ports(&open)
                )),
                None => ctx.log("Could not read the ports of existing firewall rules; replacing them"),
            }
        }
        run_script(
            self.services.shell.as_ref(),
            "add firewall rules",
            firewall_script(&ports),
        )?;
        ctx.log(format!(
            "Inbound firewall rules added for TCP {}",
            list_ports(&ports)
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_script_lists_every_feature() {
        let script = enable_features_script(&["IIS-CGI".to_string(), "IIS-Security".to_string()]);
        assert!(script.contains("@('IIS-CGI', 'IIS-Security')"));
        assert!(script.contains("Enable-WindowsOptionalFeature"));
    }

    #[test]
    fn firewall_script_replaces_group_rules() {
        let script = firewall_script(&[80, 443]);
        assert!(script.starts_with("Get-NetFirewallRule -Group 'Application Stack'"));
        assert!(script.contains("-LocalPort 80 "));
        assert!(script.contains("-LocalPort 443 "));
    }

    #[test]
    fn open_ports_are_sorted_and_ranges_rejected() {
        assert_eq!(parse_open_ports("443\r\n80\n80\n"), Some(vec![80, 443]));
        assert_eq!(parse_open_ports(""), Some(vec![]));
        assert_eq!(parse_open_ports("80\n8000-8010\n"), None);
        assert_eq!(parse_open_ports("Any\n"), None);
    }

    #[test]
    fn site_url_omits_default_port() {
        let mut site = SiteSettings::default();
        assert_eq!(site_url(&site), "http://localhost/");
        site.port = 8080;
        assert_eq!(site_url(&site), "http://localhost:8080/");
    }
}
