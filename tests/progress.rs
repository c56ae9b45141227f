use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use stack_provisioner::progress::{ProgressError, ProgressStore, SharedValue, StepStatus};

const STEPS: [&str; 6] = ["one", "two", "three", "four", "five", "six"];

#[test]
fn observers_always_see_a_consistent_prefix_of_progress() {
    let store = ProgressStore::new(STEPS);
    let done = Arc::new(AtomicBool::new(false));

    let observers: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut last_completed = 0usize;
                let mut observations = 0usize;
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let snapshot = store.snapshot();
                    assert_eq!(snapshot.steps.len(), STEPS.len());
                    assert!(snapshot.count(StepStatus::Running) <= 1);

                    let completed = snapshot.count(StepStatus::Completed);
                    assert!(completed >= last_completed, "completed count went backwards");
                    last_completed = completed;

                    let statuses: Vec<_> = snapshot.steps.iter().map(|s| s.status).collect();
                    let first_open = statuses
                        .iter()
                        .position(|status| *status != StepStatus::Completed)
                        .unwrap_or(statuses.len());
                    assert!(
                        statuses[first_open..]
                            .iter()
                            .skip(1)
                            .all(|status| *status == StepStatus::Pending),
                        "steps after the active one must still be pending: {statuses:?}"
                    );

                    if let Some(SharedValue::Count(value)) = snapshot.shared.get("counter") {
                        assert!(*value as usize <= completed);
                    }
                    observations += 1;
                    if finished {
                        break;
                    }
                }
                (observations, last_completed)
            })
        })
        .collect();

    for (idx, step) in STEPS.iter().enumerate() {
        store.set_status(step, StepStatus::Running).unwrap();
        store.append_log(step, format!("working on {step}")).unwrap();
        store.set_status(step, StepStatus::Completed).unwrap();
        store.put("counter", SharedValue::Count(idx as u64 + 1));
    }
    done.store(true, Ordering::SeqCst);

    for observer in observers {
        let (observations, completed) = observer.join().expect("observer panicked");
        assert!(observations > 0);
        assert_eq!(completed, STEPS.len());
    }
    assert!(store.snapshot().is_finished());
    assert_eq!(store.logs("three"), vec!["working on three".to_string()]);
}

#[test]
fn invalid_transitions_are_rejected() {
    let store = ProgressStore::new(["install"]);
    assert_eq!(
        store.set_status("install", StepStatus::Completed),
        Err(ProgressError::InvalidTransition {
            step: "install".into(),
            from: StepStatus::Pending,
            to: StepStatus::Completed,
        })
    );
    store.set_status("install", StepStatus::Running).unwrap();
    store.set_status("install", StepStatus::Failed).unwrap();
    assert!(store.set_status("install", StepStatus::Running).is_err());
    assert_eq!(
        store.set_status("missing", StepStatus::Running),
        Err(ProgressError::UnknownStep("missing".into()))
    );
}

#[test]
fn snapshot_keeps_declaration_order_and_shared_values() {
    let store = ProgressStore::new(["b", "a", "b", "c"]);
    assert_eq!(store.step_names(), vec!["b", "a", "c"]);

    store.put("site.url", SharedValue::Url("http://localhost/".into()));
    store.put("site.url", SharedValue::Url("http://localhost:8080/".into()));
    let snapshot = store.snapshot();
    let names: Vec<_> = snapshot.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a", "c"]);
    assert_eq!(
        snapshot.shared.get("site.url"),
        Some(&SharedValue::Url("http://localhost:8080/".into()))
    );
    assert!(snapshot.current().is_none());
    assert!(!snapshot.is_finished());
}
