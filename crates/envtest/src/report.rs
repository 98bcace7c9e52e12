//! Outcome reporting.
//!
//! Every unit (global setup, feature hook, feature, feature step, global
//! finish) produces exactly one `UnitReport`. Reports are pushed to the
//! caller's `TestHost` as they are produced and collected into a `RunReport`.
//!
//! # Aggregation
//!
//! A run is `Failed` if any unit failed. Skipped units do not count, so a
//! run where everything was skipped aggregates to `Passed`.

use crate::env::Phase;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::process::ExitCode;
use std::time::Duration;
use uuid::Uuid;

/// Outcome of a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "PASS"),
            Outcome::Failed => write!(f, "FAIL"),
            Outcome::Skipped => write!(f, "SKIP"),
        }
    }
}

/// Why a unit was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Rejected by the selection filters.
    Filtered,
    /// Selected, but dry-run mode executes nothing.
    DryRun,
    /// An earlier unit failed with fail-fast enabled.
    FailFast,
    /// A global or feature setup failed.
    SetupFailed,
    /// The run context was cancelled before the unit started.
    Cancelled,
    /// The step asked to be skipped via `TestHandle::skip`.
    Requested(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Filtered => write!(f, "filtered"),
            SkipReason::DryRun => write!(f, "would run (dry-run)"),
            SkipReason::FailFast => write!(f, "fail-fast"),
            SkipReason::SetupFailed => write!(f, "setup failed"),
            SkipReason::Cancelled => write!(f, "cancelled"),
            SkipReason::Requested(reason) => write!(f, "{reason}"),
        }
    }
}

/// What kind of unit a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    GlobalSetup,
    BeforeFeature,
    Feature,
    FeatureSetup,
    Assessment,
    FeatureTeardown,
    AfterFeature,
    GlobalFinish,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitKind::GlobalSetup => "setup",
            UnitKind::BeforeFeature => "before",
            UnitKind::Feature => "feature",
            UnitKind::FeatureSetup => "feature-setup",
            UnitKind::Assessment => "assess",
            UnitKind::FeatureTeardown => "teardown",
            UnitKind::AfterFeature => "after",
            UnitKind::GlobalFinish => "finish",
        };
        f.write_str(label)
    }
}

/// Result of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub kind: UnitKind,
    pub name: String,
    /// Owning feature for feature-scoped units.
    pub feature: Option<String>,
    pub outcome: Outcome,
    pub skip_reason: Option<SkipReason>,
    /// Error or panic text for failed units.
    pub error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl UnitReport {
    #[must_use]
    pub fn passed(kind: UnitKind, name: &str, feature: Option<&str>, duration: Duration) -> Self {
        Self::new(kind, name, feature, Outcome::Passed, duration)
    }

    #[must_use]
    pub fn failed(
        kind: UnitKind,
        name: &str,
        feature: Option<&str>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let mut report = Self::new(kind, name, feature, Outcome::Failed, duration);
        report.error = Some(error.into());
        report
    }

    #[must_use]
    pub fn skipped(kind: UnitKind, name: &str, feature: Option<&str>, reason: SkipReason) -> Self {
        let mut report = Self::new(kind, name, feature, Outcome::Skipped, Duration::ZERO);
        report.skip_reason = Some(reason);
        report
    }

    fn new(
        kind: UnitKind,
        name: &str,
        feature: Option<&str>,
        outcome: Outcome,
        duration: Duration,
    ) -> Self {
        Self {
            kind,
            name: name.to_string(),
            feature: feature.map(str::to_string),
            outcome,
            skip_reason: None,
            error: None,
            duration,
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u128(duration.as_millis())
}

/// Number of units per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Last lifecycle phase reached; `Done` for every completed run.
    pub phase: Phase,
    pub dry_run: bool,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub units: Vec<UnitReport>,
}

impl RunReport {
    pub(crate) fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            phase: Phase::Created,
            dry_run,
            duration: Duration::ZERO,
            units: Vec::new(),
        }
    }

    /// Aggregate outcome: `Failed` if any unit failed, `Passed` otherwise.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if self.units.iter().any(UnitReport::is_failed) {
            Outcome::Failed
        } else {
            Outcome::Passed
        }
    }

    /// Process exit code: 0 only for a passed run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.outcome() {
            Outcome::Failed => 1,
            Outcome::Passed | Outcome::Skipped => 0,
        }
    }

    #[must_use]
    pub fn counts(&self) -> Counts {
        self.units
            .iter()
            .fold(Counts::default(), |mut counts, unit| {
                match unit.outcome {
                    Outcome::Passed => counts.passed += 1,
                    Outcome::Failed => counts.failed += 1,
                    Outcome::Skipped => counts.skipped += 1,
                }
                counts
            })
    }

    /// Failed units in report order.
    pub fn failures(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| u.is_failed())
    }

    /// Reports of one kind in report order.
    pub fn units_of(&self, kind: UnitKind) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(move |u| u.kind == kind)
    }

    /// Assessments reported as "would run" by a dry run.
    pub fn would_run(&self) -> impl Iterator<Item = &UnitReport> {
        self.units_of(UnitKind::Assessment)
            .filter(|u| u.skip_reason == Some(SkipReason::DryRun))
    }

    /// Find the report for a unit by kind and name.
    #[must_use]
    pub fn find(&self, kind: UnitKind, name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.kind == kind && u.name == name)
    }

    /// Serialize the report as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl From<&RunReport> for ExitCode {
    fn from(report: &RunReport) -> Self {
        match report.outcome() {
            Outcome::Failed => ExitCode::FAILURE,
            Outcome::Passed | Outcome::Skipped => ExitCode::SUCCESS,
        }
    }
}

/// Per-unit summary followed by the aggregate line.
impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for unit in &self.units {
            let scope = match &unit.feature {
                Some(feature) => format!("{feature}/{}", unit.name),
                None => unit.name.clone(),
            };
            write!(
                f,
                "{:<4} {:<13} {} ({}ms)",
                unit.outcome,
                unit.kind,
                scope,
                unit.duration.as_millis()
            )?;
            if let Some(reason) = &unit.skip_reason {
                write!(f, " [{reason}]")?;
            }
            if let Some(error) = &unit.error {
                write!(f, ": {error}")?;
            }
            writeln!(f)?;
        }
        let counts = self.counts();
        write!(
            f,
            "{}: {} passed, {} failed, {} skipped",
            self.outcome(),
            counts.passed,
            counts.failed,
            counts.skipped
        )
    }
}

/// The external test-runner surface that receives per-unit outcomes.
pub trait TestHost {
    /// Called once per unit, in execution order.
    fn report(&mut self, unit: &UnitReport);
}

/// Discards every report.
impl TestHost for () {
    fn report(&mut self, _unit: &UnitReport) {}
}

/// Logs each unit report through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHost;

impl TestHost for TracingHost {
    fn report(&mut self, unit: &UnitReport) {
        let feature = unit.feature.as_deref().unwrap_or("-");
        let duration_ms = u64::try_from(unit.duration.as_millis()).unwrap_or(u64::MAX);
        match unit.outcome {
            Outcome::Passed => tracing::info!(
                target: "envtest.report",
                kind = %unit.kind,
                feature = %feature,
                unit = %unit.name,
                duration_ms,
                "PASS"
            ),
            Outcome::Skipped => tracing::info!(
                target: "envtest.report",
                kind = %unit.kind,
                feature = %feature,
                unit = %unit.name,
                reason = %unit.skip_reason.as_ref().map(ToString::to_string).unwrap_or_default(),
                "SKIP"
            ),
            Outcome::Failed => tracing::error!(
                target: "envtest.report",
                kind = %unit.kind,
                feature = %feature,
                unit = %unit.name,
                duration_ms,
                error = %unit.error.as_deref().unwrap_or_default(),
                "FAIL"
            ),
        }
    }
}
