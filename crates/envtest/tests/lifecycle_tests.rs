//! Lifecycle ordering, failure isolation and cleanup guarantees.
//!
//! Every scenario runs against recording fixture funcs; nothing touches a
//! live environment.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use envtest::{
    Context, FeatureBuilder, Flags, Outcome, Phase, Registry, SkipReason, UnitKind,
};
use envtest_test_utils::{
    env_func, environment, hook, outcome, skip_reason, step, unit, Behavior, CallLog,
    RecordingHost,
};
use futures::FutureExt;

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_single_feature_passes_and_finish_runs_once() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .setup(env_func(&log, "S1", Behavior::Pass))
        .register_feature(
            FeatureBuilder::new("F1")
                .assess("a1", step(&log, "a1", Behavior::Pass))
                .assess("a2", step(&log, "a2", Behavior::Pass))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::Pass));

    let mut host = RecordingHost::new();
    let report = environment(Flags::default())
        .run(&registry, &mut host)
        .await;

    assert_eq!(report.outcome(), Outcome::Passed, "{report}");
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.phase, Phase::Done);
    assert_eq!(log.count("X1"), 1);
    assert_eq!(log.entries(), ["S1", "a1", "a2", "X1"]);
    assert_eq!(
        host.names(),
        [
            "setup:setup-1",
            "assess:a1",
            "assess:a2",
            "feature:F1",
            "finish:finish-1"
        ]
    );
}

#[tokio::test]
async fn test_host_receives_every_report_in_order() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry.register_feature(
        FeatureBuilder::new("F1")
            .assess("a1", step(&log, "a1", Behavior::fail("boom")))
            .feature(),
    );

    let mut host = RecordingHost::new();
    let report = environment(Flags::default())
        .run(&registry, &mut host)
        .await;

    assert_eq!(host.units, report.units);
}

// ============================================================================
// Global setup failure
// ============================================================================

#[tokio::test]
async fn test_setup_failure_skips_features_but_runs_finish() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .setup_named("S1", env_func(&log, "S1", Behavior::fail("cluster unreachable")))
        .setup_named("S2", env_func(&log, "S2", Behavior::Pass))
        .register_feature(
            FeatureBuilder::new("F1")
                .assess("a1", step(&log, "a1", Behavior::Pass))
                .feature(),
        )
        .finish_named("X1", env_func(&log, "X1", Behavior::Pass));

    let report = environment(Flags::default()).run(&registry, &mut ()).await;

    assert_eq!(report.outcome(), Outcome::Failed);
    assert_ne!(report.exit_code(), 0);
    assert_eq!(log.entries(), ["S1", "X1"]);

    let s1 = unit(&report, UnitKind::GlobalSetup, "S1");
    assert_eq!(s1.error.as_deref(), Some("cluster unreachable"));
    assert_eq!(
        skip_reason(&report, UnitKind::GlobalSetup, "S2"),
        Some(SkipReason::SetupFailed)
    );
    assert_eq!(
        skip_reason(&report, UnitKind::Feature, "F1"),
        Some(SkipReason::SetupFailed)
    );
    assert_eq!(outcome(&report, UnitKind::GlobalFinish, "X1"), Outcome::Passed);
    assert_eq!(report.phase, Phase::Done);
}

#[tokio::test]
async fn test_panicking_setup_is_reported_as_failure() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .setup_named("S1", env_func(&log, "S1", Behavior::Panic))
        .finish_named("X1", env_func(&log, "X1", Behavior::Pass));

    let report = environment(Flags::default()).run(&registry, &mut ()).await;

    let s1 = unit(&report, UnitKind::GlobalSetup, "S1");
    assert_eq!(s1.outcome, Outcome::Failed);
    assert_eq!(s1.error.as_deref(), Some("panic: S1 panicked"));
    assert_eq!(log.count("X1"), 1);
}

// ============================================================================
// Panic recovery and isolation
// ============================================================================

#[tokio::test]
async fn test_assessment_panic_still_runs_teardown_and_later_features() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .register_feature(
            FeatureBuilder::new("net")
                .setup(step(&log, "net-setup", Behavior::Pass))
                .assess("a1", step(&log, "a1", Behavior::Panic))
                .assess("a2", step(&log, "a2", Behavior::Pass))
                .teardown(step(&log, "net-teardown", Behavior::Pass))
                .feature(),
        )
        .register_feature(
            FeatureBuilder::new("dns")
                .assess("resolves", step(&log, "resolves", Behavior::Pass))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::Pass));

    let report = environment(Flags::default()).run(&registry, &mut ()).await;

    assert_eq!(report.outcome(), Outcome::Failed);
    assert_eq!(
        log.entries(),
        ["net-setup", "a1", "a2", "net-teardown", "resolves", "X1"]
    );

    let a1 = unit(&report, UnitKind::Assessment, "a1");
    assert_eq!(a1.outcome, Outcome::Failed);
    assert!(a1.error.as_deref().unwrap().starts_with("panic:"));
    assert_eq!(outcome(&report, UnitKind::Assessment, "a2"), Outcome::Passed);
    assert_eq!(outcome(&report, UnitKind::Feature, "net"), Outcome::Failed);
    assert_eq!(outcome(&report, UnitKind::Feature, "dns"), Outcome::Passed);
}

#[tokio::test]
async fn test_disabled_graceful_teardown_propagates_panic() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .register_feature(
            FeatureBuilder::new("net")
                .assess("a1", step(&log, "a1", Behavior::Panic))
                .teardown(step(&log, "net-teardown", Behavior::Pass))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::Pass));

    let env = environment(Flags {
        disable_graceful_teardown: true,
        ..Flags::default()
    });
    let result = AssertUnwindSafe(env.run(&registry, &mut ()))
        .catch_unwind()
        .await;

    assert!(result.is_err());
    assert_eq!(log.entries(), ["a1"]);
}

// ============================================================================
// Feature setup and hooks
// ============================================================================

#[tokio::test]
async fn test_feature_setup_failure_skips_assessments_not_teardown() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry.register_feature(
        FeatureBuilder::new("F1")
            .setup_named("create", step(&log, "create", Behavior::fail("quota")))
            .setup_named("seed", step(&log, "seed", Behavior::Pass))
            .assess("a1", step(&log, "a1", Behavior::Pass))
            .teardown(step(&log, "td", Behavior::Pass))
            .feature(),
    );

    let report = environment(Flags::default()).run(&registry, &mut ()).await;

    assert_eq!(log.entries(), ["create", "td"]);
    assert_eq!(
        skip_reason(&report, UnitKind::FeatureSetup, "seed"),
        Some(SkipReason::SetupFailed)
    );
    assert_eq!(
        skip_reason(&report, UnitKind::Assessment, "a1"),
        Some(SkipReason::SetupFailed)
    );
    assert_eq!(
        outcome(&report, UnitKind::FeatureTeardown, "teardown-1"),
        Outcome::Passed
    );
    assert_eq!(outcome(&report, UnitKind::Feature, "F1"), Outcome::Failed);
}

#[tokio::test]
async fn test_feature_hooks_wrap_each_feature() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .before_each_feature(hook(&log, "before", Behavior::Pass))
        .after_each_feature(hook(&log, "after", Behavior::Pass))
        .register_feature(
            FeatureBuilder::new("F1")
                .setup(step(&log, "F1-setup", Behavior::Pass))
                .assess("a1", step(&log, "a1", Behavior::Pass))
                .teardown(step(&log, "F1-teardown", Behavior::Pass))
                .feature(),
        )
        .register_feature(
            FeatureBuilder::new("F2")
                .assess("b1", step(&log, "b1", Behavior::Pass))
                .feature(),
        );

    let report = environment(Flags::default()).run(&registry, &mut ()).await;

    assert_eq!(report.outcome(), Outcome::Passed);
    assert_eq!(
        log.entries(),
        [
            "before:F1",
            "F1-setup",
            "a1",
            "F1-teardown",
            "after:F1",
            "before:F2",
            "b1",
            "after:F2"
        ]
    );
}

#[tokio::test]
async fn test_failing_before_hook_skips_feature_body_but_runs_cleanup() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .before_each_feature(hook(&log, "before", Behavior::fail("no quota")))
        .after_each_feature(hook(&log, "after", Behavior::Pass))
        .register_feature(
            FeatureBuilder::new("F1")
                .setup(step(&log, "F1-setup", Behavior::Pass))
                .assess("a1", step(&log, "a1", Behavior::Pass))
                .teardown(step(&log, "F1-teardown", Behavior::Pass))
                .feature(),
        );

    let report = environment(Flags::default()).run(&registry, &mut ()).await;

    assert_eq!(log.entries(), ["before:F1", "F1-teardown", "after:F1"]);
    assert_eq!(
        outcome(&report, UnitKind::BeforeFeature, "before-feature-1"),
        Outcome::Failed
    );
    assert_eq!(
        skip_reason(&report, UnitKind::Assessment, "a1"),
        Some(SkipReason::SetupFailed)
    );
}

// ============================================================================
// Cleanup is exhaustive
// ============================================================================

#[tokio::test]
async fn test_failing_teardown_and_finish_do_not_block_the_next() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .register_feature(
            FeatureBuilder::new("F1")
                .assess("a1", step(&log, "a1", Behavior::Pass))
                .teardown(step(&log, "td1", Behavior::fail("stuck finalizer")))
                .teardown(step(&log, "td2", Behavior::Panic))
                .teardown(step(&log, "td3", Behavior::Pass))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::fail("leak")))
        .finish(env_func(&log, "X2", Behavior::Panic))
        .finish(env_func(&log, "X3", Behavior::Pass));

    let report = environment(Flags::default()).run(&registry, &mut ()).await;

    assert_eq!(
        log.entries(),
        ["a1", "td1", "td2", "td3", "X1", "X2", "X3"]
    );
    assert_eq!(report.outcome(), Outcome::Failed);
    assert_eq!(
        outcome(&report, UnitKind::FeatureTeardown, "teardown-3"),
        Outcome::Passed
    );
    assert_eq!(outcome(&report, UnitKind::GlobalFinish, "finish-3"), Outcome::Passed);
}

#[tokio::test]
async fn test_finish_runs_exactly_once_whatever_features_do() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .register_feature(
            FeatureBuilder::new("fails")
                .assess("a", step(&log, "a", Behavior::fail("nope")))
                .feature(),
        )
        .register_feature(
            FeatureBuilder::new("panics")
                .assess("b", step(&log, "b", Behavior::Panic))
                .feature(),
        )
        .register_feature(
            FeatureBuilder::new("setup-fails")
                .setup(step(&log, "c-setup", Behavior::fail("nope")))
                .assess("c", step(&log, "c", Behavior::Pass))
                .feature(),
        )
        .register_feature(
            FeatureBuilder::new("filtered")
                .assess("d", step(&log, "d", Behavior::Pass))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::Pass));

    let env = environment(Flags {
        skip_features: Some("^filtered$".to_string()),
        ..Flags::default()
    });
    let report = env.run(&registry, &mut ()).await;

    assert_eq!(log.count("X1"), 1);
    assert_eq!(report.units_of(UnitKind::GlobalFinish).count(), 1);
    assert_eq!(
        skip_reason(&report, UnitKind::Feature, "filtered"),
        Some(SkipReason::Filtered)
    );
}

// ============================================================================
// Serial ordering and context threading
// ============================================================================

#[tokio::test]
async fn test_serial_assessments_follow_registration_order() {
    let log = CallLog::new();
    let mut builder = FeatureBuilder::new("ordered");
    for i in 0..8 {
        let name = format!("a{i}");
        builder.assess(name.clone(), step(&log, &name, Behavior::Pass));
    }
    let mut registry = Registry::new();
    registry.register_feature(builder.feature());

    environment(Flags::default()).run(&registry, &mut ()).await;

    let expected: Vec<String> = (0..8).map(|i| format!("a{i}")).collect();
    assert_eq!(log.entries(), expected);
}

#[tokio::test]
async fn test_context_threads_through_the_lineage() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .setup(env_func(&log, "S1", Behavior::SetValue("namespace", "e2e-abc")))
        .register_feature(
            FeatureBuilder::new("F1")
                .setup(step(&log, "setup", Behavior::Observe("namespace")))
                .assess("a1", step(&log, "a1", Behavior::SetValue("pod", "web-0")))
                .assess("a2", step(&log, "a2", Behavior::Observe("pod")))
                .teardown(step(&log, "td", Behavior::Observe("pod")))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::Observe("namespace")));

    environment(Flags::default()).run(&registry, &mut ()).await;

    let entries = log.entries();
    assert!(entries.contains(&"setup:namespace=e2e-abc".to_string()));
    assert!(entries.contains(&"a2:pod=web-0".to_string()));
    assert!(entries.contains(&"td:pod=web-0".to_string()));
    assert!(entries.contains(&"X1:namespace=e2e-abc".to_string()));
}

#[tokio::test]
async fn test_failed_step_does_not_advance_context() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry.register_feature(
        FeatureBuilder::new("F1")
            .assess("a1", step(&log, "a1", Behavior::SetValue("pod", "web-0")))
            .assess("a2", step(&log, "a2", Behavior::fail("crashloop")))
            .assess("a3", step(&log, "a3", Behavior::Observe("pod")))
            .feature(),
    );

    environment(Flags::default()).run(&registry, &mut ()).await;

    assert!(log.entries().contains(&"a3:pod=web-0".to_string()));
}

// ============================================================================
// Test handle
// ============================================================================

#[tokio::test]
async fn test_handle_fail_and_skip_map_to_outcomes() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry.register_feature(
        FeatureBuilder::new("F1")
            .assess("soft", step(&log, "soft", Behavior::SoftFail("2/3 ready".into())))
            .assess("skip", step(&log, "skip", Behavior::Skip("needs GPU".into())))
            .assess("after", step(&log, "after", Behavior::Pass))
            .feature(),
    );

    let report = environment(Flags::default()).run(&registry, &mut ()).await;

    let soft = unit(&report, UnitKind::Assessment, "soft");
    assert_eq!(soft.outcome, Outcome::Failed);
    assert_eq!(soft.error.as_deref(), Some("2/3 ready"));
    assert_eq!(
        skip_reason(&report, UnitKind::Assessment, "skip"),
        Some(SkipReason::Requested("needs GPU".to_string()))
    );
    assert_eq!(outcome(&report, UnitKind::Assessment, "after"), Outcome::Passed);
}

// ============================================================================
// Fail-fast
// ============================================================================

#[tokio::test]
async fn test_fail_fast_skips_later_work_but_keeps_cleanup() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .register_feature(
            FeatureBuilder::new("F1")
                .assess("a1", step(&log, "a1", Behavior::fail("wrong status")))
                .assess("a2", step(&log, "a2", Behavior::Pass))
                .teardown(step(&log, "F1-teardown", Behavior::Pass))
                .feature(),
        )
        .register_feature(
            FeatureBuilder::new("F2")
                .assess("b1", step(&log, "b1", Behavior::Pass))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::Pass))
        .finish(env_func(&log, "X2", Behavior::Pass));

    let env = environment(Flags {
        fail_fast: true,
        ..Flags::default()
    });
    let report = env.run(&registry, &mut ()).await;

    assert_eq!(log.entries(), ["a1", "F1-teardown", "X1", "X2"]);
    assert_eq!(
        skip_reason(&report, UnitKind::Assessment, "a2"),
        Some(SkipReason::FailFast)
    );
    assert_eq!(
        skip_reason(&report, UnitKind::Feature, "F2"),
        Some(SkipReason::FailFast)
    );
    assert_eq!(report.outcome(), Outcome::Failed);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancellation_fails_in_flight_and_skips_new_work() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .register_feature(
            FeatureBuilder::new("F1")
                .assess("hang", step(&log, "hang", Behavior::Hang))
                .assess("a2", step(&log, "a2", Behavior::Pass))
                .teardown(step(&log, "F1-teardown", Behavior::Pass))
                .feature(),
        )
        .after_each_feature(hook(&log, "after", Behavior::Pass))
        .register_feature(
            FeatureBuilder::new("F2")
                .assess("b1", step(&log, "b1", Behavior::Pass))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::Pass));

    let (ctx, token) = Context::background().with_cancel();
    let env = environment(Flags::default()).with_context(ctx);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let report = env.run(&registry, &mut ()).await;
    canceller.await.unwrap();

    let hang = unit(&report, UnitKind::Assessment, "hang");
    assert_eq!(hang.outcome, Outcome::Failed);
    assert_eq!(hang.error.as_deref(), Some("context cancelled"));
    assert_eq!(
        skip_reason(&report, UnitKind::Assessment, "a2"),
        Some(SkipReason::Cancelled)
    );
    assert_eq!(
        skip_reason(&report, UnitKind::Feature, "F2"),
        Some(SkipReason::Cancelled)
    );
    assert_eq!(log.entries(), ["hang", "F1-teardown", "after:F1", "X1"]);
}

#[tokio::test]
async fn test_root_deadline_times_out_hanging_setup() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .setup_named("S1", env_func(&log, "S1", Behavior::Hang))
        .finish_named("X1", env_func(&log, "X1", Behavior::Pass));

    let ctx = Context::background().with_timeout(Duration::from_millis(30));
    let report = environment(Flags::default())
        .with_context(ctx)
        .run(&registry, &mut ())
        .await;

    let s1 = unit(&report, UnitKind::GlobalSetup, "S1");
    assert_eq!(s1.outcome, Outcome::Failed);
    assert!(s1.error.as_deref().unwrap().starts_with("timed out"));
    assert_eq!(outcome(&report, UnitKind::GlobalFinish, "X1"), Outcome::Passed);
}

// ============================================================================
// Independent runs
// ============================================================================

#[tokio::test]
async fn test_same_registry_twice_gives_identical_outcomes() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .setup(env_func(&log, "S1", Behavior::Pass))
        .register_feature(
            FeatureBuilder::new("F1")
                .assess("a1", step(&log, "a1", Behavior::Pass))
                .assess("a2", step(&log, "a2", Behavior::fail("flaky")))
                .teardown(step(&log, "td", Behavior::Pass))
                .feature(),
        )
        .register_feature(
            FeatureBuilder::new("F2")
                .assess("b1", step(&log, "b1", Behavior::Panic))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::Pass));

    let env = environment(Flags::default());
    let first = env.run(&registry, &mut ()).await;
    let second = env.run(&registry, &mut ()).await;

    let shape = |report: &envtest::RunReport| {
        report
            .units
            .iter()
            .map(|u| {
                (
                    u.kind,
                    u.name.clone(),
                    u.outcome,
                    u.skip_reason.clone(),
                    u.error.clone(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(shape(&first), shape(&second));
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(log.count("X1"), 2);
}
