//! End-to-end runs: failures get recorded, replayed, fixed, and regressed
//! through the real store file.

use std::path::Path;
use std::time::Duration;

use regress_rs::{
    testable_fn, ExplicitCase, FailureStore, RunConfig, RunSummary, Runner, TestableRegistry,
    SEED_ENV,
};

const TESTABLE: &str = "soak::widget_holds";

fn names() -> Vec<String> {
    vec!["placemark".to_string()]
}

fn store_at(dir: &Path) -> FailureStore {
    FailureStore::open(dir.join("widget_holds.broken"), &names(), 5).expect("open store")
}

/// One run against a private store directory, quiet, with a fixed seed so
/// every assertion in this file is deterministic.
fn summary_for(
    dir: &Path,
    random_cases: u64,
    registry: TestableRegistry,
    tweak: impl FnOnce(&mut RunConfig),
) -> RunSummary {
    let mut config = RunConfig::new(TESTABLE);
    config.random_cases = Some(random_cases);
    config.initial_seed = Some(0xA11CE);
    config.store_dir = Some(dir.to_path_buf());
    config.print_failures = false;
    tweak(&mut config);
    Runner::new(config, registry)
        .expect("configure runner")
        .run()
        .expect("run")
}

/// Fails every case at byte position 5: one u32 draw plus one placemark.
fn failing_at_five() -> TestableRegistry {
    let mut registry = TestableRegistry::new();
    registry.register(TESTABLE, || {
        testable_fn(|ctx| {
            ctx.next_u32();
            ctx.placemark()?;
            Err("planted defect".into())
        })
    });
    registry
}

/// Same name, different shape: fails at position 9 instead.
fn failing_at_nine() -> TestableRegistry {
    let mut registry = TestableRegistry::new();
    registry.register(TESTABLE, || {
        testable_fn(|ctx| {
            ctx.next_u64();
            ctx.placemark()?;
            Err("planted defect".into())
        })
    });
    registry
}

fn passing() -> TestableRegistry {
    let mut registry = TestableRegistry::new();
    registry.register(TESTABLE, || {
        testable_fn(|ctx| {
            ctx.next_u32();
            ctx.placemark()?;
            Ok(())
        })
    });
    registry
}

#[test]
fn fresh_failure_is_recorded_then_replayed_first() {
    let tmp = tempfile::tempdir().expect("create temp dir");

    let first = summary_for(tmp.path(), 50, failing_at_five(), |_| {});
    assert_eq!(first.cases, 1, "default max_failures=1 stops after one");
    assert_eq!(first.failures, 1);
    assert!(first
        .first_failure
        .as_deref()
        .unwrap()
        .contains("new failure"));

    let store = store_at(tmp.path());
    assert_eq!(store.len(), 1);
    let record = &store.records()[0];
    assert_eq!(record.position, 5);
    assert_eq!(record.placemarks.get("placemark"), Some(&5));
    assert!(!record.is_resolved());

    // The next run replays the remembered failure before any fresh case
    // and stops right there.
    let second = summary_for(tmp.path(), 50, failing_at_five(), |_| {});
    assert_eq!(second.cases, 1);
    assert_eq!(second.failures, 1);
    assert!(second
        .first_failure
        .as_deref()
        .unwrap()
        .contains("known failure reproduced"));
}

#[test]
fn fix_and_regression_lifecycle() {
    let tmp = tempfile::tempdir().expect("create temp dir");

    let broken = summary_for(tmp.path(), 1, failing_at_five(), |_| {});
    assert_eq!(broken.failures, 1);

    // The "bug" is fixed: the replay passes and the record is resolved.
    let fixed = summary_for(tmp.path(), 0, passing(), |_| {});
    assert_eq!(fixed.cases, 1);
    assert_eq!(fixed.passed, 1);
    assert_eq!(fixed.fixed, 1);
    assert_eq!(fixed.failures, 0);
    let store = store_at(tmp.path());
    assert_eq!(store.len(), 1);
    assert!(store.records()[0].is_resolved());

    // The bug comes back: the resolved record is revisited and flagged.
    let regressed = summary_for(tmp.path(), 0, failing_at_five(), |_| {});
    assert_eq!(regressed.regressed, 1);
    assert_eq!(regressed.failures, 1);
    assert!(regressed
        .first_failure
        .as_deref()
        .unwrap()
        .contains("regression"));
    let store = store_at(tmp.path());
    assert!(!store.records()[0].is_resolved());
}

#[test]
fn moved_failure_updates_the_record() {
    let tmp = tempfile::tempdir().expect("create temp dir");

    summary_for(tmp.path(), 1, failing_at_five(), |_| {});
    let moved = summary_for(tmp.path(), 0, failing_at_nine(), |_| {});
    assert_eq!(moved.failures, 1);
    assert!(moved
        .first_failure
        .as_deref()
        .unwrap()
        .contains("known failure moved"));

    let store = store_at(tmp.path());
    assert_eq!(store.len(), 1);
    assert_eq!(store.records()[0].position, 9);
    assert_eq!(store.records()[0].placemarks.get("placemark"), Some(&9));
    assert!(!store.records()[0].is_resolved());
}

#[test]
fn explicit_seed_failure_is_persisted() {
    let tmp = tempfile::tempdir().expect("create temp dir");

    let summary = summary_for(tmp.path(), 0, failing_at_five(), |config| {
        config.revisit_known_failures = false;
        config.explicit_cases = vec![ExplicitCase::new(0x5eed)];
    });
    assert_eq!(summary.cases, 1);
    assert_eq!(summary.failures, 1);
    let message = summary.first_failure.unwrap();
    assert!(message.contains("explicit case failed"), "{message}");
    assert!(message.contains("seed 5eed"), "{message}");

    let store = store_at(tmp.path());
    assert_eq!(store.len(), 1);
    assert_eq!(store.records()[0].seed, 0x5eed);
}

#[test]
fn case_timeout_is_captured_and_recorded() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let mut registry = TestableRegistry::new();
    registry.register(TESTABLE, || {
        testable_fn(|ctx| loop {
            std::thread::sleep(Duration::from_millis(5));
            ctx.placemark()?;
        })
    });

    let summary = summary_for(tmp.path(), 1, registry, |config| {
        config.budgets.max_case = Some(Duration::from_millis(100));
    });
    assert_eq!(summary.failures, 1);
    let message = summary.first_failure.unwrap();
    assert!(message.contains("case timed out"), "{message}");

    let store = store_at(tmp.path());
    assert_eq!(store.len(), 1);
    assert!(store.records()[0].position >= 1, "some placemarks landed");
}

#[test]
fn reproduction_reaches_identical_coordinates() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let seed_shaped = || {
        let mut registry = TestableRegistry::new();
        registry.register(TESTABLE, || {
            testable_fn(|ctx| {
                let steps = ctx.next_u32_bounded(12);
                for _ in 0..steps {
                    ctx.next_u32();
                    ctx.placemark()?;
                }
                Err("always breaks".into())
            })
        });
        registry
    };

    summary_for(tmp.path(), 1, seed_shaped(), |_| {});
    let recorded = store_at(tmp.path()).records()[0].clone();

    let replayed = summary_for(tmp.path(), 0, seed_shaped(), |_| {});
    assert!(replayed
        .first_failure
        .as_deref()
        .unwrap()
        .contains("known failure reproduced"));

    let after = store_at(tmp.path());
    assert_eq!(after.records()[0].seed, recorded.seed);
    assert_eq!(after.records()[0].position, recorded.position);
    assert_eq!(after.records()[0].placemarks, recorded.placemarks);
}

#[test]
fn max_failures_stops_the_run() {
    let tmp = tempfile::tempdir().expect("create temp dir");

    let summary = summary_for(tmp.path(), 50, failing_at_five(), |config| {
        config.max_failures = 3;
        config.revisit_known_failures = false;
        config.persist_failures = false;
    });
    assert_eq!(summary.failures, 3);
    assert_eq!(summary.cases, 3);
    assert!(
        !tmp.path().join("widget_holds.broken").exists(),
        "persistence was off"
    );
}

#[test]
fn run_budget_bounds_unlimited_cases() {
    let tmp = tempfile::tempdir().expect("create temp dir");

    let summary = summary_for(tmp.path(), 0, passing(), |config| {
        config.random_cases = None;
        config.budgets.max_run = Some(Duration::from_millis(150));
        config.revisit_known_failures = false;
        config.persist_failures = false;
    });
    // The case in flight when the budget expires is interrupted and
    // counted; every earlier case must have passed.
    assert!(summary.failures <= 1);
    assert!(summary.cases >= 1);
    assert!(summary.passed >= summary.cases - 1);
    assert!(summary.elapsed >= Duration::from_millis(150));
}

#[test]
fn equal_seeds_make_equal_runs() {
    let tmp_a = tempfile::tempdir().expect("create temp dir");
    let tmp_b = tempfile::tempdir().expect("create temp dir");
    let sometimes_failing = || {
        let mut registry = TestableRegistry::new();
        registry.register(TESTABLE, || {
            testable_fn(|ctx| {
                let v = ctx.next_u32();
                ctx.placemark()?;
                if v % 7 == 0 {
                    return Err("one in seven".into());
                }
                Ok(())
            })
        });
        registry
    };

    let a = summary_for(tmp_a.path(), 500, sometimes_failing(), |_| {});
    let b = summary_for(tmp_b.path(), 500, sometimes_failing(), |_| {});
    assert_eq!(a.cases, b.cases);
    assert_eq!(a.failures, b.failures);
    assert_eq!(a.first_failure, b.first_failure);
}

#[test]
fn seed_env_override_feeds_the_config() {
    std::env::set_var(SEED_ENV, "0x2a");
    let config = RunConfig::from_env_defaults("t");
    std::env::remove_var(SEED_ENV);
    assert_eq!(config.initial_seed, Some(0x2a));
}
