mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use stack_provisioner::context::InstallContext;
use stack_provisioner::detect::DetectionStatus;
use stack_provisioner::pipeline::{PipelineError, PipelineRunner, Step, StepSpec, build_pipeline};
use stack_provisioner::progress::{SharedValue, StepStatus};
use stack_provisioner::steps::default_registry;
use tempfile::tempdir;

use support::{RecordingShell, ScriptedDetector, script_body, services, settings, stdout};

struct Tagged {
    name: &'static str,
    tag: &'static str,
    delay: Duration,
    runs: Arc<AtomicUsize>,
}

impl Tagged {
    fn new(name: &'static str, tag: &'static str, delay_ms: u64) -> Self {
        Self {
            name,
            tag,
            delay: Duration::from_millis(delay_ms),
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Step for Tagged {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        ctx.log(format!("tag:{}", self.tag));
        Ok(())
    }
}

struct Failing {
    name: &'static str,
    message: &'static str,
}

impl Step for Failing {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        ctx.log("about to fail");
        bail!("{}", self.message)
    }
}

fn boxed(step: impl Step + 'static) -> Box<dyn Step> {
    Box::new(step)
}

fn context() -> (tempfile::TempDir, InstallContext) {
    let temp = tempdir().unwrap();
    let ctx = InstallContext::silent(settings(temp.path()));
    (temp, ctx)
}

fn tags(ctx: &InstallContext) -> Vec<String> {
    ctx.transcript()
        .iter()
        .filter_map(|line| line.strip_prefix("tag:"))
        .map(str::to_string)
        .collect()
}

#[test]
fn steps_run_in_declared_order_regardless_of_duration() {
    let runner = PipelineRunner::new(vec![
        boxed(Tagged::new("A", "A", 40)),
        boxed(Tagged::new("B", "B", 0)),
        boxed(Tagged::new("C", "C", 15)),
    ])
    .unwrap();
    let (_temp, mut ctx) = context();
    let progress = runner.progress_store();

    let summary = runner.run(&mut ctx, &progress).unwrap();

    assert_eq!(tags(&ctx), vec!["A", "B", "C"]);
    assert_eq!(summary.completed, vec!["A", "B", "C"]);
    for name in ["A", "B", "C"] {
        assert_eq!(progress.status(name), Some(StepStatus::Completed));
    }
}

#[test]
fn failure_stops_the_pipeline_and_leaves_later_steps_pending() {
    let after = Tagged::new("After", "after", 0);
    let after_runs = after.runs.clone();
    let runner = PipelineRunner::new(vec![
        boxed(Tagged::new("Before", "before", 0)),
        boxed(Failing {
            name: "Broken",
            message: "boom",
        }),
        boxed(after),
    ])
    .unwrap();
    let (_temp, mut ctx) = context();
    let progress = runner.progress_store();

    let err = runner.run(&mut ctx, &progress).unwrap_err();

    assert_eq!(err.failed_step(), Some("Broken"));
    assert_eq!(after_runs.load(Ordering::SeqCst), 0);
    assert_eq!(progress.status("Before"), Some(StepStatus::Completed));
    assert_eq!(progress.status("Broken"), Some(StepStatus::Failed));
    assert_eq!(progress.status("After"), Some(StepStatus::Pending));
    assert_eq!(tags(&ctx), vec!["before"]);
    assert_eq!(progress.logs("Broken")[1], "about to fail");

    let metrics = runner.metrics().snapshot();
    assert_eq!(metrics.steps_completed, 1);
    assert_eq!(metrics.steps_failed, 1);
    assert!(!metrics.steps.contains_key("After"));
    assert_eq!(metrics.failed_step.as_deref(), Some("Broken"));
    assert_eq!(metrics.steps["Broken"].status, Some(StepStatus::Failed));
    assert_eq!(metrics.steps["Broken"].failure.as_deref(), Some("boom"));
    assert_eq!(metrics.steps["Before"].calls, 1);
}

#[test]
fn step_errors_are_wrapped_with_the_step_name() {
    let runner = PipelineRunner::new(vec![boxed(Failing {
        name: "Install Runtime",
        message: "disk full",
    })])
    .unwrap();
    let (_temp, mut ctx) = context();
    let progress = runner.progress_store();

    let err = runner.run(&mut ctx, &progress).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Install Runtime"), "{message}");
    assert!(message.contains("disk full"), "{message}");
    match err {
        PipelineError::StepFailed { step, index, source } => {
            assert_eq!(step, "Install Runtime");
            assert_eq!(index, 0);
            assert_eq!(source.to_string(), "disk full");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(
        ctx.transcript()
            .iter()
            .any(|line| line == "Step failed: Install Runtime: disk full")
    );
}

struct Producer;

impl Step for Producer {
    fn name(&self) -> &str {
        "Producer"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        ctx.facts.site_url = Some(String::new());
        ctx.facts.runtime_dir = Some("C:\\apps\\a=b;c|d".into());
        ctx.publish("empty", SharedValue::Text(String::new()));
        ctx.publish("separators", SharedValue::Text("k=v;x|y\n\tz,w".into()));
        Ok(())
    }
}

struct Consumer {
    seen: Arc<std::sync::Mutex<Vec<String>>>,
}

impl Step for Consumer {
    fn name(&self) -> &str {
        "Consumer"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let url = stack_provisioner::context::require(&ctx.facts.site_url, "site_url", "Producer")?;
        let runtime =
            stack_provisioner::context::require(&ctx.facts.runtime_dir, "runtime_dir", "Producer")?;
        let store = ctx.progress().expect("progress attached");
        let mut seen = self.seen.lock().unwrap();
        seen.push(url.clone());
        seen.push(runtime.display().to_string());
        seen.push(store.get("empty").and_then(|v| v.as_text().map(str::to_string)).unwrap());
        seen.push(
            store
                .get("separators")
                .and_then(|v| v.as_text().map(str::to_string))
                .unwrap(),
        );
        Ok(())
    }
}

#[test]
fn values_published_by_one_step_reach_later_steps_unchanged() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let runner = PipelineRunner::new(vec![
        boxed(Producer),
        boxed(Consumer { seen: seen.clone() }),
    ])
    .unwrap();
    let (_temp, mut ctx) = context();
    let progress = runner.progress_store();

    runner.run(&mut ctx, &progress).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            String::new(),
            "C:\\apps\\a=b;c|d".to_string(),
            String::new(),
            "k=v;x|y\n\tz,w".to_string(),
        ]
    );
}

#[test]
fn missing_fact_fails_with_producer_name() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let runner = PipelineRunner::new(vec![boxed(Consumer { seen })]).unwrap();
    let (_temp, mut ctx) = context();
    let progress = runner.progress_store();

    let err = runner.run(&mut ctx, &progress).unwrap_err();
    assert!(
        err.to_string()
            .contains("required value 'site_url' is not available; it is produced by step 'Producer'")
    );
}

#[test]
fn rerun_with_satisfied_host_issues_no_mutating_commands() {
    // Only the read-only listing of already opened firewall ports is answered.
    let shell = RecordingShell::responding(|invocation| {
        match script_body(invocation) {
            Some(body) if body.contains("Get-NetFirewallPortFilter") => stdout("443\n80\n"),
            _ => stdout(""),
        }
    });
    let detector = Arc::new(ScriptedDetector::new(DetectionStatus::Satisfied));
    let services = services(&shell, detector.clone(), true);
    let registry = default_registry();
    let specs = vec![
        StepSpec::new("install-iis-features"),
        StepSpec::new("configure-firewall"),
    ];

    for _ in 0..2 {
        let runner = build_pipeline(&registry, &specs, &services).unwrap();
        let (_temp, mut ctx) = context();
        let progress = runner.progress_store();
        runner.run(&mut ctx, &progress).unwrap();
        assert_eq!(progress.status("Configure Firewall"), Some(StepStatus::Completed));
    }

    let mutating = shell
        .invocations()
        .iter()
        .filter(|invocation| {
            !script_body(invocation).is_some_and(|body| body.contains("Get-NetFirewallPortFilter"))
        })
        .count();
    assert_eq!(mutating, 0);
    assert_eq!(shell.calls(), 2);
    assert_eq!(detector.probes(), 6);
}

#[test]
fn strict_policy_fails_on_indeterminate_probe() {
    let shell = RecordingShell::new();
    let detector = Arc::new(ScriptedDetector::new(DetectionStatus::Indeterminate));
    let registry = default_registry();
    let runner = build_pipeline(
        &registry,
        &[StepSpec::new("configure-firewall")],
        &services(&shell, detector, true),
    )
    .unwrap();
    let (_temp, mut ctx) = context();
    let progress = runner.progress_store();

    let err = runner.run(&mut ctx, &progress).unwrap_err();
    assert!(err.to_string().contains("could not be determined"), "{err}");
    assert_eq!(shell.calls(), 0);
}

#[test]
fn spawned_run_reports_through_its_progress_store() {
    let runner = PipelineRunner::new(vec![
        boxed(Tagged::new("A", "A", 20)),
        boxed(Tagged::new("B", "B", 20)),
    ])
    .unwrap();
    let (_temp, ctx) = context();

    let handle = runner.spawn(ctx);
    let progress = handle.progress().clone();
    while !handle.is_finished() {
        thread::sleep(Duration::from_millis(5));
    }
    let (ctx, outcome) = handle.join();

    assert_eq!(outcome.unwrap().completed, vec!["A", "B"]);
    assert_eq!(tags(&ctx.unwrap()), vec!["A", "B"]);
    let snapshot = progress.snapshot();
    assert!(snapshot.is_finished());
    assert_eq!(snapshot.count(StepStatus::Completed), 2);
    assert!(snapshot.steps.iter().all(|step| step.started_at.is_some()));
}

const OBSERVED: [&str; 5] = ["A", "B", "C", "D", "E"];

fn rank(status: StepStatus) -> u8 {
    match status {
        StepStatus::Pending => 0,
        StepStatus::Running => 1,
        StepStatus::Completed | StepStatus::Failed => 2,
    }
}

#[test]
fn observers_polling_a_failing_run_agree_with_its_outcome() {
    let runner = PipelineRunner::new(vec![
        boxed(Tagged::new("A", "A", 15)),
        boxed(Tagged::new("B", "B", 15)),
        boxed(Failing {
            name: "C",
            message: "disk full",
        }),
        boxed(Tagged::new("D", "D", 0)),
        boxed(Tagged::new("E", "E", 0)),
    ])
    .unwrap();
    let (_temp, ctx) = context();
    let handle = runner.spawn(ctx);
    let progress = handle.progress().clone();
    let done = Arc::new(AtomicBool::new(false));

    let observers: Vec<_> = (0..6)
        .map(|_| {
            let progress = progress.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut ranks = [0u8; OBSERVED.len()];
                let mut log_counts = [0usize; OBSERVED.len()];
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    for (idx, name) in OBSERVED.iter().enumerate() {
                        let status = progress.status(name).expect("step is registered");
                        assert!(rank(status) >= ranks[idx], "{name} went back to {status:?}");
                        ranks[idx] = rank(status);
                        let logs = progress.logs(name).len();
                        assert!(logs >= log_counts[idx], "{name} lost log lines");
                        log_counts[idx] = logs;
                    }
                    if finished {
                        break;
                    }
                    thread::yield_now();
                }
                OBSERVED
                    .iter()
                    .map(|name| progress.status(name).expect("step is registered"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let (_ctx, outcome) = handle.join();
    done.store(true, Ordering::SeqCst);

    let err = outcome.unwrap_err();
    assert_eq!(err.failed_step(), Some("C"));
    let expected = vec![
        StepStatus::Completed,
        StepStatus::Completed,
        StepStatus::Failed,
        StepStatus::Pending,
        StepStatus::Pending,
    ];
    for observer in observers {
        assert_eq!(observer.join().expect("observer panicked"), expected);
    }
    assert!(progress.logs("D").is_empty());
    assert!(progress.logs("E").is_empty());
}

#[test]
fn unknown_steps_are_rejected_when_building() {
    let shell = RecordingShell::new();
    let detector = Arc::new(ScriptedDetector::new(DetectionStatus::Missing));
    let err = build_pipeline(
        &default_registry(),
        &[StepSpec::new("install-everything")],
        &services(&shell, detector, false),
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("Unknown step 'install-everything'"));
}
