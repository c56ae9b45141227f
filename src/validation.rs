use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::detect::{DetectionPolicy, HostDetector};
use crate::pipeline::{StepRegistry, StepServices, StepSpec};
use crate::profile::{InstallProfile, PROFILE_VERSION};
use crate::shell::{HostShell, PowerShell};
use crate::steps::display_name;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Steps that must appear earlier in the pipeline when the keyed step is present.
const ORDERING: &[(&str, &[&str])] = &[
    ("install-php", &["check-prerequisites"]),
    ("install-composer", &["install-php"]),
    ("install-mariadb", &["check-prerequisites"]),
    ("configure-mariadb", &["install-mariadb"]),
    ("install-phpmyadmin", &["check-prerequisites"]),
    ("install-node", &["check-prerequisites"]),
    ("configure-iis", &["deploy-application", "install-php"]),
    ("configure-env", &["deploy-application"]),
    ("seed-database", &["install-mariadb", "configure-mariadb"]),
    ("create-admin-user", &["install-mariadb", "seed-database", "install-php"]),
];

pub fn validate_profile(profile: &InstallProfile, registry: &StepRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if profile.version != PROFILE_VERSION {
        report
            .errors
            .push(format!("Unsupported profile version: {}", profile.version));
    }

    report.merge(validate_fields(profile));

    let steps = profile.steps();
    if steps.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one step".into());
    }

    let shell: Arc<dyn HostShell> = Arc::new(PowerShell::new(profile.shell.executable.clone()));
    let services = StepServices {
        detector: Arc::new(HostDetector::new(shell.clone())),
        shell,
        policy: DetectionPolicy {
            strict: profile.detection.strict,
        },
    };

    let mut seen = HashSet::new();
    for (idx, spec) in steps.iter().enumerate() {
        if !seen.insert(spec.step.as_str()) {
            report.errors.push(format!(
                "Step '{}' appears more than once in the pipeline",
                spec.step
            ));
        }
        report.merge(validate_step_order(idx, spec, &steps));
        report.merge(validate_step(idx, spec, registry, &services));
    }

    if profile.pipeline.is_some() && !steps.iter().any(|spec| spec.step == "resolve-inputs") {
        report.warnings.push(
            "Pipeline does not include resolve-inputs; later steps will lack derived paths".into(),
        );
    }

    report
}

fn validate_fields(profile: &InstallProfile) -> ValidationReport {
    let mut report = ValidationReport::default();
    let required = [
        ("database.name", profile.database.name.as_str()),
        ("database.user", profile.database.user.as_str()),
        ("database.host", profile.database.host.as_str()),
        ("admin.name", profile.admin.name.as_str()),
        ("admin.email", profile.admin.email.as_str()),
        ("site.name", profile.site.name.as_str()),
        ("site.app_pool", profile.site.app_pool.as_str()),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            report.errors.push(format!("{field} cannot be empty"));
        }
    }

    if profile.paths.runtime_dir.as_os_str().is_empty() {
        report.errors.push("paths.runtime_dir cannot be empty".into());
    }
    if profile.paths.sql_dump.as_os_str().is_empty() {
        report.errors.push("paths.sql_dump cannot be empty".into());
    }

    if profile.database.root_password.is_empty() {
        report.errors.push("database.root_password cannot be empty".into());
    }
    if profile.database.user_password.is_empty() {
        report.errors.push("database.user_password cannot be empty".into());
    }
    if profile.admin.password.is_empty() {
        report.errors.push("admin.password cannot be empty".into());
    } else if profile.admin.password.expose().len() < 8 {
        report
            .warnings
            .push("admin.password is shorter than 8 characters".into());
    }

    if !profile.admin.email.trim().is_empty() && !looks_like_email(&profile.admin.email) {
        report.errors.push(format!(
            "admin.email '{}' is not a valid e-mail address",
            profile.admin.email
        ));
    }

    if profile.database.port == 0 {
        report.errors.push("database.port must be greater than 0".into());
    }
    if profile.site.port == 0 {
        report.errors.push("site.port must be greater than 0".into());
    }
    if profile.database.user.eq_ignore_ascii_case("root") {
        report
            .warnings
            .push("database.user is 'root'; the application will run with full privileges".into());
    }
    report
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.trim().split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        && !value.chars().any(char::is_whitespace)
}

fn validate_step(
    idx: usize,
    spec: &StepSpec,
    registry: &StepRegistry,
    services: &StepServices,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let params = spec.params.clone().unwrap_or_default();
    if let Err(err) = registry
        .create(&spec.step, services, params)
        .with_context(|| format!("Step {} ('{}')", idx + 1, spec.step))
    {
        report.errors.push(format!("{err:#}"));
    }
    report
}

fn validate_step_order(idx: usize, spec: &StepSpec, pipeline: &[StepSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some((_, requirements)) = ORDERING.iter().find(|(step, _)| *step == spec.step) else {
        return report;
    };
    for required in requirements.iter() {
        let earlier = pipeline[..idx].iter().any(|prev| prev.step == *required);
        if !earlier {
            report.errors.push(format!(
                "{} ({}) requires {} ({}) earlier in the pipeline",
                display_name(&spec.step),
                spec.step,
                display_name(required),
                required
            ));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape() {
        assert!(looks_like_email("admin@example.com"));
        assert!(!looks_like_email("admin.example.com"));
        assert!(!looks_like_email("admin@localhost"));
        assert!(!looks_like_email("a b@example.com"));
        assert!(!looks_like_email("@example.com"));
    }

    #[test]
    fn ordering_reports_missing_predecessors() {
        let pipeline = vec![StepSpec::new("seed-database"), StepSpec::new("configure-mariadb")];
        let report = validate_step_order(0, &pipeline[0], &pipeline);
        assert_eq!(
            report.errors,
            vec![
                "Seed Database (seed-database) requires Install MariaDB (install-mariadb) earlier in the pipeline".to_string(),
                "Seed Database (seed-database) requires Configure MariaDB (configure-mariadb) earlier in the pipeline".to_string(),
            ]
        );
        assert!(validate_step_order(1, &pipeline[1], &pipeline).errors.len() == 1);
    }
}
