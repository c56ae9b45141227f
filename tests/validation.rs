use std::path::Path;

use stack_provisioner::pipeline::StepSpec;
use stack_provisioner::profile::{InstallProfile, Secret};
use stack_provisioner::steps::default_registry;
use stack_provisioner::validation::validate_profile;

fn sample() -> InstallProfile {
    InstallProfile::load(Path::new("profiles/sample.yaml")).expect("sample profile should load")
}

#[test]
fn sample_profile_is_valid() {
    let report = validate_profile(&sample(), &default_registry());
    assert!(
        report.is_ok(),
        "sample profile should pass validation: {:?}",
        report.errors
    );
}

#[test]
fn empty_and_malformed_fields_are_reported() {
    let mut profile = sample();
    profile.version = 2;
    profile.database.name = "  ".into();
    profile.admin.email = "admin.example.com".into();
    profile.database.root_password = Secret::new("");

    let report = validate_profile(&profile, &default_registry());
    assert!(!report.is_ok());
    for expected in [
        "Unsupported profile version: 2",
        "database.name cannot be empty",
        "admin.email 'admin.example.com' is not a valid e-mail address",
        "database.root_password cannot be empty",
    ] {
        assert!(
            report.errors.iter().any(|err| err == expected),
            "missing '{expected}' in {:?}",
            report.errors
        );
    }
}

#[test]
fn pipeline_order_and_ids_are_checked() {
    let mut profile = sample();
    profile.pipeline = Some(vec![
        StepSpec::new("resolve-inputs"),
        StepSpec::new("seed-database"),
        StepSpec::new("install-mariadb"),
        StepSpec::new("configure-mariadb"),
        StepSpec::new("install-mariadb"),
        StepSpec::new("install-everything"),
    ]);

    let report = validate_profile(&profile, &default_registry());
    let errors = report.errors.join("\n");
    assert!(
        errors.contains("Seed Database (seed-database) requires Configure MariaDB (configure-mariadb) earlier in the pipeline"),
        "{errors}"
    );
    assert!(
        errors.contains("Step 'install-mariadb' appears more than once in the pipeline"),
        "{errors}"
    );
    assert!(errors.contains("Unknown step 'install-everything'"), "{errors}");
    assert!(!errors.contains("Configure MariaDB (configure-mariadb) requires"), "{errors}");
}

#[test]
fn invalid_step_parameters_are_reported() {
    let mut profile = sample();
    let mut params = serde_json::Map::new();
    params.insert("ports".into(), serde_json::json!(["http"]));
    profile.pipeline = Some(vec![StepSpec {
        step: "configure-firewall".into(),
        params: Some(params),
    }]);

    let report = validate_profile(&profile, &default_registry());
    let errors = report.errors.join("\n");
    assert!(errors.contains("Step 1 ('configure-firewall')"), "{errors}");
    assert!(errors.contains("port 'http' is not a valid TCP port"), "{errors}");
    assert!(
        report
            .warnings
            .iter()
            .any(|warning| warning.contains("does not include resolve-inputs"))
    );
}

#[test]
fn steps_reading_earlier_facts_must_follow_their_producers() {
    let mut profile = sample();
    profile.pipeline = Some(vec![
        StepSpec::new("resolve-inputs"),
        StepSpec::new("install-composer"),
        StepSpec::new("install-php"),
        StepSpec::new("configure-env"),
        StepSpec::new("deploy-application"),
        StepSpec::new("create-admin-user"),
        StepSpec::new("install-node"),
    ]);

    let report = validate_profile(&profile, &default_registry());
    let errors = report.errors.join("\n");
    for expected in [
        "Install Composer (install-composer) requires Install PHP (install-php) earlier in the pipeline",
        "Install PHP (install-php) requires Validate Local Prerequisites (check-prerequisites) earlier in the pipeline",
        "Configure .env (configure-env) requires Deploy Application Files (deploy-application) earlier in the pipeline",
        "Create Admin User (create-admin-user) requires Install MariaDB (install-mariadb) earlier in the pipeline",
        "Install Node.js (install-node) requires Validate Local Prerequisites (check-prerequisites) earlier in the pipeline",
    ] {
        assert!(errors.contains(expected), "missing '{expected}' in:\n{errors}");
    }
    assert!(!errors.contains("Create Admin User (create-admin-user) requires Install PHP"), "{errors}");
}

#[test]
fn producers_placed_first_satisfy_ordering() {
    let mut profile = sample();
    profile.pipeline = Some(vec![
        StepSpec::new("resolve-inputs"),
        StepSpec::new("check-prerequisites"),
        StepSpec::new("install-php"),
        StepSpec::new("install-composer"),
        StepSpec::new("deploy-application"),
        StepSpec::new("configure-env"),
    ]);

    let report = validate_profile(&profile, &default_registry());
    assert!(report.is_ok(), "{:?}", report.errors);
}
