use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, to_writer_pretty};
use stack_provisioner::context::InstallContext;
use stack_provisioner::detect::{DetectionPolicy, DetectionStatus, Detector, HostDetector, Subject};
use stack_provisioner::digest::{compute_sha256, write_sha256};
use stack_provisioner::observability::{MetricsSnapshot, log_snapshot};
#[cfg(feature = "status-server")]
use stack_provisioner::observability::server::StatusServer;
use stack_provisioner::pipeline::{PipelineError, StepServices, build_pipeline};
use stack_provisioner::presets::generate_preset;
use stack_provisioner::profile::InstallProfile;
use stack_provisioner::progress::{ProgressStore, StepStatus};
use stack_provisioner::shell::{HostShell, PowerShell};
use stack_provisioner::steps::{self, catalogue};
use stack_provisioner::validation::validate_profile;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "status-server")]
use std::net::SocketAddr;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run(args) => args.otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match cli.command {
        Commands::Run(args) => run_profile(args),
        Commands::ListSteps => {
            list_steps();
            Ok(())
        }
        Commands::Validate { profile } => validate_profile_cmd(profile),
        Commands::Detect {
            subjects,
            json,
            shell,
        } => detect_command(subjects, json, shell),
        Commands::Profile { action } => profile_command(action),
        Commands::Digest { path, output } => digest_command(&path, output.as_deref()),
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "stack-provisioner")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn host_services(executable: PathBuf, strict: bool) -> StepServices {
    let shell: Arc<dyn HostShell> = Arc::new(PowerShell::new(executable));
    StepServices {
        detector: Arc::new(HostDetector::new(shell.clone())),
        shell,
        policy: DetectionPolicy { strict },
    }
}

fn load_validated(profile_path: &Path) -> Result<InstallProfile> {
    let profile = InstallProfile::load(profile_path)?;
    let registry = steps::default_registry();
    let report = validate_profile(&profile, &registry);
    for warning in &report.warnings {
        warn!(file = %profile_path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %profile_path.display(), "{error_msg}");
        }
        bail!(
            "Install profile has {} validation error(s)",
            report.errors.len()
        );
    }
    Ok(profile)
}

fn run_profile(args: RunArgs) -> Result<()> {
    let RunArgs {
        profile: profile_path,
        dry_run,
        print_metrics,
        metrics_json,
        metrics_prometheus,
        report,
        status_listen,
        otlp_endpoint: _,
        bundle_dir,
    } = args;

    let profile = load_validated(&profile_path)?;
    let bundle_dir = match bundle_dir {
        Some(dir) => dir,
        None => profile_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let services = host_services(profile.shell.executable.clone(), profile.detection.strict);
    let registry = steps::default_registry();
    let runner = build_pipeline(&registry, &profile.steps(), &services)?;

    if dry_run {
        println!(
            "Install plan for {} ({} step(s), bundle {}):",
            profile_path.display(),
            runner.len(),
            bundle_dir.display()
        );
        for (idx, name) in runner.step_names().iter().enumerate() {
            println!("{:>3}. {name}", idx + 1);
        }
        return Ok(());
    }

    let ctx = InstallContext::new(profile.settings(&bundle_dir));
    let total = runner.len();
    let handle = runner.spawn(ctx);
    let progress = handle.progress().clone();
    let metrics = handle.metrics();

    #[cfg(feature = "status-server")]
    let status_server = if let Some(addr_str) = status_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid status listen address: {addr_str}"))?;
        let server = StatusServer::start(addr, progress.clone(), metrics.clone())?;
        info!(address = %server.address(), "Status server listening");
        Some(server)
    } else {
        None
    };

    #[cfg(not(feature = "status-server"))]
    if let Some(addr_str) = status_listen {
        warn!(
            "Status server feature not enabled; ignoring --status-listen={}.",
            addr_str
        );
    }

    let mut renderer = ProgressRenderer::new(total);
    while !handle.is_finished() {
        renderer.render(&progress);
        thread::sleep(POLL_INTERVAL);
    }
    renderer.render(&progress);

    let (_ctx, outcome) = handle.join();

    if let Some(path) = report {
        write_json(&path, &progress.snapshot(), "run report")?;
        info!(report = %path.display(), "Run report written");
    }

    let snapshot = metrics.snapshot();
    write_metrics(&snapshot, print_metrics, metrics_json, metrics_prometheus)?;

    #[cfg(feature = "status-server")]
    if let Some(mut server) = status_server {
        server.stop();
    }

    match outcome {
        Ok(summary) => {
            info!(
                steps = summary.completed.len(),
                duration_ms = summary.duration.as_millis() as u64,
                "Provisioning completed"
            );
            if let Some(url) = progress.get("site.url").and_then(|v| v.as_text().map(str::to_string)) {
                println!("Application available at {url}");
            }
            Ok(())
        }
        Err(PipelineError::StepFailed {
            step,
            index,
            source,
        }) => {
            error!(step = step.as_str(), position = index + 1, total, "Provisioning stopped");
            eprintln!(
                "Provisioning stopped at step {}/{total} ({step}); steps before it completed. Fix the cause and re-run the profile.",
                index + 1
            );
            Err(source.context(format!("{step} failed")))
        }
        Err(err) => Err(err.into()),
    }
}

/// Prints one line per observed status change.
struct ProgressRenderer {
    total: usize,
    seen: Vec<(String, StepStatus)>,
}

impl ProgressRenderer {
    fn new(total: usize) -> Self {
        Self {
            total,
            seen: Vec::new(),
        }
    }

    fn render(&mut self, progress: &ProgressStore) {
        let snapshot = progress.snapshot();
        for (idx, record) in snapshot.steps.iter().enumerate() {
            if record.status == StepStatus::Pending {
                continue;
            }
            let change = (record.name.clone(), record.status);
            if self.seen.contains(&change) {
                continue;
            }
            println!(
                "==> [{}/{}] {} ({})",
                idx + 1,
                self.total,
                record.name,
                record.status
            );
            self.seen.push(change);
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {what} directory: {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create {what} file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write {what} JSON: {}", path.display()))
}

fn write_metrics(
    snapshot: &MetricsSnapshot,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
) -> Result<()> {
    if print_metrics {
        log_snapshot(snapshot);
    }
    if let Some(path) = metrics_json {
        write_json(&path, snapshot, "metrics")?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metrics directory: {}", parent.display())
            })?;
        }
        fs::write(&path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn list_steps() {
    println!("Available steps (standard order):");
    for (idx, info) in catalogue().iter().enumerate() {
        println!("{:>3}. {:<22} {} - {}", idx + 1, info.id, info.name, info.summary);
    }
}

fn validate_profile_cmd(profile_path: PathBuf) -> Result<()> {
    let profile = InstallProfile::load(&profile_path)?;
    let registry = steps::default_registry();
    let report = validate_profile(&profile, &registry);

    for warning in &report.warnings {
        warn!(file = %profile_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %profile_path.display(), "Profile validation passed");
        println!("Profile is valid: {}", profile_path.display());
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %profile_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Profile validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn detect_command(subjects: Vec<Subject>, json: bool, shell: PathBuf) -> Result<()> {
    let shell: Arc<dyn HostShell> = Arc::new(PowerShell::new(shell));
    let detector = HostDetector::new(shell);
    let results = if subjects.is_empty() {
        detector.detect_all()
    } else {
        subjects
            .into_iter()
            .map(|subject| detector.detect(subject))
            .collect()
    };

    if json {
        let stdout = std::io::stdout();
        to_writer_pretty(stdout.lock(), &results).context("Failed to write detection JSON")?;
        println!();
        return Ok(());
    }

    for result in &results {
        let marker = match result.status {
            DetectionStatus::Satisfied => "ok",
            DetectionStatus::Missing => "missing",
            DetectionStatus::Indeterminate => "unknown",
        };
        println!("[{marker:^7}] {:<30} {}", result.label, result.detail);
    }
    Ok(())
}

fn profile_command(command: ProfileCommands) -> Result<()> {
    match command {
        ProfileCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("profiles/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset profile generated"
            );
            println!("Wrote {}", generated.display());
            Ok(())
        }
        ProfileCommands::Lint { profiles } => lint_profiles(&profiles),
        ProfileCommands::Diff { lhs, rhs } => diff_profiles(&lhs, &rhs),
    }
}

fn lint_profiles(profiles: &[PathBuf]) -> Result<()> {
    if profiles.is_empty() {
        bail!("No profile files supplied for linting");
    }

    let registry = steps::default_registry();
    let mut failures = 0usize;

    for profile_path in profiles {
        match InstallProfile::load(profile_path) {
            Ok(profile) => {
                let report = validate_profile(&profile, &registry);
                for warning in &report.warnings {
                    warn!(file = %profile_path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %profile_path.display(), "Lint passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %profile_path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %profile_path.display(), "Failed to load profile: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} profile(s)");
    }

    info!("All profile lint checks passed");
    Ok(())
}

/// Compares two serialized sections key by key. Secret values are never printed.
fn diff_section(section: &str, left: Value, right: Value, differences: &mut Vec<String>) {
    let (Value::Object(left), Value::Object(right)) = (left, right) else {
        return;
    };
    let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
    for key in keys {
        let l = left.get(key).unwrap_or(&Value::Null);
        let r = right.get(key).unwrap_or(&Value::Null);
        if l == r {
            continue;
        }
        if key.ends_with("password") {
            differences.push(format!("{section}.{key} differs"));
        } else {
            differences.push(format!("{section}.{key} differs: {l} vs {r}"));
        }
    }
}

fn diff_profiles(lhs: &Path, rhs: &Path) -> Result<()> {
    let left = InstallProfile::load(lhs)?;
    let right = InstallProfile::load(rhs)?;

    let mut differences = Vec::new();

    if left.version != right.version {
        differences.push(format!(
            "Version mismatch: {} vs {}",
            left.version, right.version
        ));
    }

    diff_section(
        "paths",
        serde_json::to_value(&left.paths)?,
        serde_json::to_value(&right.paths)?,
        &mut differences,
    );
    diff_section(
        "database",
        serde_json::to_value(&left.database)?,
        serde_json::to_value(&right.database)?,
        &mut differences,
    );
    diff_section(
        "admin",
        serde_json::to_value(&left.admin)?,
        serde_json::to_value(&right.admin)?,
        &mut differences,
    );
    diff_section(
        "site",
        serde_json::to_value(&left.site)?,
        serde_json::to_value(&right.site)?,
        &mut differences,
    );
    diff_section(
        "detection",
        serde_json::to_value(&left.detection)?,
        serde_json::to_value(&right.detection)?,
        &mut differences,
    );

    let left_steps = left.steps();
    let right_steps = right.steps();
    let min_len = left_steps.len().min(right_steps.len());
    if left_steps.len() != right_steps.len() {
        differences.push(format!(
            "Pipeline step count differs: {} vs {}",
            left_steps.len(),
            right_steps.len()
        ));
    }

    for (idx, (l_step, r_step)) in left_steps.iter().zip(right_steps.iter()).enumerate() {
        if l_step.step != r_step.step {
            differences.push(format!(
                "Step {} differs: '{}' vs '{}'",
                idx + 1,
                l_step.step,
                r_step.step
            ));
        }
        let l_params = l_step.params.clone().unwrap_or_default();
        let r_params = r_step.params.clone().unwrap_or_default();
        if l_params != r_params {
            differences.push(format!(
                "Step {} ('{}') parameters differ: {} vs {}",
                idx + 1,
                l_step.step,
                Value::Object(l_params),
                Value::Object(r_params)
            ));
        }
    }

    for (extra_idx, step) in left_steps[min_len..].iter().enumerate() {
        differences.push(format!(
            "Extra step in left profile at position {}: '{}'",
            min_len + extra_idx + 1,
            step.step
        ));
    }
    for (extra_idx, step) in right_steps[min_len..].iter().enumerate() {
        differences.push(format!(
            "Extra step in right profile at position {}: '{}'",
            min_len + extra_idx + 1,
            step.step
        ));
    }

    if differences.is_empty() {
        info!(
            left = %lhs.display(),
            right = %rhs.display(),
            "Profiles are equivalent"
        );
        println!("Profiles match: {} == {}", lhs.display(), rhs.display());
        Ok(())
    } else {
        println!(
            "Profile differences between '{}' and '{}':",
            lhs.display(),
            rhs.display()
        );
        for diff in &differences {
            println!("- {diff}");
        }
        bail!("Profiles differ ({} difference(s) found)", differences.len());
    }
}

fn digest_command(path: &Path, output: Option<&Path>) -> Result<()> {
    if let Some(out_path) = output {
        let digest = write_sha256(path, out_path)?;
        println!("{}  {}", digest, path.display());
        info!(
            file = %path.display(),
            digest_output = %out_path.display(),
            "SHA256 digest written"
        );
    } else {
        let digest = compute_sha256(path)?;
        println!("{}  {}", digest, path.display());
        info!(file = %path.display(), "SHA256 computed");
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "stack-provisioner",
    version,
    about = "Provision an IIS, PHP, MariaDB and Node.js application stack on one Windows host"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RunArgs {
    profile: PathBuf,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long = "status-listen")]
    status_listen: Option<String>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
    #[arg(long = "bundle-dir")]
    bundle_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunArgs),
    ListSteps,
    Validate {
        profile: PathBuf,
    },
    Detect {
        #[arg(value_enum)]
        subjects: Vec<Subject>,
        #[arg(long)]
        json: bool,
        #[arg(long, default_value = "powershell.exe")]
        shell: PathBuf,
    },
    Profile {
        #[command(subcommand)]
        action: ProfileCommands,
    },
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        profiles: Vec<PathBuf>,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
}
