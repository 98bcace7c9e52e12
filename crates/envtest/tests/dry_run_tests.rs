//! Dry-run mode reports what would run and executes nothing.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use envtest::{FeatureBuilder, Flags, Outcome, Registry, SkipReason, UnitKind};
use envtest_test_utils::{env_func, environment, hook, skip_reason, step, Behavior, CallLog};

fn dry_run() -> Flags {
    Flags {
        dry_run: true,
        ..Flags::default()
    }
}

#[tokio::test]
async fn test_dry_run_reports_would_run_without_invoking() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .setup(env_func(&log, "S1", Behavior::Pass))
        .before_each_feature(hook(&log, "before", Behavior::Pass))
        .register_feature(
            FeatureBuilder::new("F1")
                .setup(step(&log, "F1-setup", Behavior::Pass))
                .assess("a1", step(&log, "a1", Behavior::Pass))
                .assess("a2", step(&log, "a2", Behavior::Pass))
                .assess("a3", step(&log, "a3", Behavior::Pass))
                .teardown(step(&log, "F1-teardown", Behavior::Pass))
                .feature(),
        )
        .finish(env_func(&log, "X1", Behavior::Pass));

    let report = environment(dry_run()).run(&registry, &mut ()).await;

    assert!(log.entries().is_empty(), "invoked: {:?}", log.entries());
    assert_eq!(report.would_run().count(), 3);
    assert_eq!(report.outcome(), Outcome::Passed);
    assert_eq!(report.exit_code(), 0);
    assert!(report.dry_run);
    assert!(report
        .units
        .iter()
        .all(|u| u.skip_reason == Some(SkipReason::DryRun)));
}

#[tokio::test]
async fn test_dry_run_marks_filtered_assessments() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .register_feature(
            FeatureBuilder::new("F1")
                .assess("fast check", step(&log, "fast", Behavior::Pass))
                .assess("slow check", step(&log, "slow", Behavior::Pass))
                .feature(),
        )
        .register_feature(
            FeatureBuilder::new("F2")
                .assess("fast check", step(&log, "other", Behavior::Pass))
                .feature(),
        );

    let env = environment(Flags {
        dry_run: true,
        feature: Some("^F1$".to_string()),
        skip_assessments: Some("slow".to_string()),
        ..Flags::default()
    });
    let report = env.run(&registry, &mut ()).await;

    let would_run: Vec<(&str, &str)> = report
        .would_run()
        .map(|u| (u.feature.as_deref().unwrap(), u.name.as_str()))
        .collect();
    assert_eq!(would_run, [("F1", "fast check")]);
    assert_eq!(
        skip_reason(&report, UnitKind::Feature, "F2"),
        Some(SkipReason::Filtered)
    );
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn test_dry_run_takes_precedence_over_fail_fast() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry
        .register_feature(
            FeatureBuilder::new("F1")
                .assess("a1", step(&log, "a1", Behavior::fail("would fail")))
                .feature(),
        )
        .register_feature(
            FeatureBuilder::new("F2")
                .assess("b1", step(&log, "b1", Behavior::Pass))
                .feature(),
        );

    let env = environment(Flags {
        dry_run: true,
        fail_fast: true,
        ..Flags::default()
    });
    let report = env.run(&registry, &mut ()).await;

    assert_eq!(report.would_run().count(), 2);
    assert_eq!(
        skip_reason(&report, UnitKind::Feature, "F2"),
        Some(SkipReason::DryRun)
    );
    assert_eq!(report.outcome(), Outcome::Passed);
}

#[tokio::test]
async fn test_dry_run_summary_and_json_shape() {
    let log = CallLog::new();
    let mut registry = Registry::new();
    registry.register_feature(
        FeatureBuilder::new("F1")
            .assess("a1", step(&log, "a1", Behavior::Pass))
            .feature(),
    );

    let report = environment(dry_run()).run(&registry, &mut ()).await;

    let summary = report.to_string();
    assert!(summary.contains("would run (dry-run)"), "{summary}");
    assert!(summary.ends_with("PASS: 0 passed, 0 failed, 2 skipped"), "{summary}");

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["dry_run"], true);
    assert_eq!(json["phase"], "done");
    assert_eq!(json["units"][0]["kind"], "assessment");
    assert_eq!(json["units"][0]["skip_reason"]["reason"], "dry_run");
}
