use std::fs;

use stack_provisioner::presets::{PRESETS, generate_preset};
use stack_provisioner::profile::InstallProfile;
use stack_provisioner::steps::default_registry;
use stack_provisioner::validation::validate_profile;
use tempfile::tempdir;

#[test]
fn every_preset_loads_and_validates() {
    let temp = tempdir().unwrap();
    let registry = default_registry();
    for name in PRESETS {
        let path = temp.path().join("profiles").join(format!("{name}.yaml"));
        let generated = generate_preset(name, &path).expect("preset generation");
        assert!(generated.exists());

        let profile = InstallProfile::load(&generated).expect("preset should load");
        let report = validate_profile(&profile, &registry);
        assert!(report.is_ok(), "{name} preset errors: {:?}", report.errors);
    }
}

#[test]
fn full_preset_lists_the_standard_pipeline() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("full.yaml");
    generate_preset("full", &path).unwrap();
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("step: resolve-inputs"));
    assert!(contents.contains("step: configure-firewall"));
    assert!(contents.contains("force: false"));

    let profile = InstallProfile::load(&path).unwrap();
    assert_eq!(profile.steps().len(), 15);
}

#[test]
fn unknown_preset_is_rejected() {
    let temp = tempdir().unwrap();
    let err = generate_preset("everything", &temp.path().join("x.yaml")).unwrap_err();
    assert!(err.to_string().contains("Unknown preset 'everything'"));
}
