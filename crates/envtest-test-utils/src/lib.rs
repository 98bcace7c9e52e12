//! # Envtest Test Utilities
//!
//! Recording funcs, hosts and assertion helpers for testing the lifecycle
//! orchestrator without a live environment.
//!
//! Every fixture func appends a label to a shared [`CallLog`] when it runs,
//! then behaves as its [`Behavior`] says. Tests assert on the log for
//! ordering and on the [`RunReport`] for outcomes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use envtest_test_utils::*;
//!
//! let log = CallLog::new();
//! let mut registry = Registry::new();
//! registry
//!     .setup(env_func(&log, "S1", Behavior::Pass))
//!     .register_feature(
//!         FeatureBuilder::new("F")
//!             .assess("a1", step(&log, "a1", Behavior::Pass))
//!             .feature(),
//!     )
//!     .finish(env_func(&log, "X1", Behavior::Pass));
//!
//! let report = environment(Flags::default()).run(&registry, &mut ()).await;
//! assert_eq!(log.entries(), ["S1", "a1", "X1"]);
//! ```

use envtest::{
    Context, EnvConfig, EnvFunc, Environment, FeatureHook, FeatureInfo, Flags, FuncError,
    FuncResult, Outcome, RunReport, SkipReason, StepFunc, TestHandle, TestHost, UnitKind,
    UnitReport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared, ordered record of which fixture funcs ran.
///
/// Also tracks how many `Behavior::Sleep` funcs were in flight at once, so
/// parallel tests can assert real overlap.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    /// All entries in call order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Number of entries equal to `entry`.
    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    /// Assert `first` was logged before `second`.
    pub fn assert_before(&self, first: &str, second: &str) {
        let a = self
            .position(first)
            .unwrap_or_else(|| panic!("{first} not logged: {:?}", self.entries()));
        let b = self
            .position(second)
            .unwrap_or_else(|| panic!("{second} not logged: {:?}", self.entries()));
        assert!(a < b, "{first} should run before {second}: {:?}", self.entries());
    }

    /// Highest number of sleeping funcs observed at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a fixture func does after logging its label.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return the input context.
    Pass,
    /// Return `FuncError::Failed` with this message.
    Fail(String),
    /// Panic with `"<label> panicked"`.
    Panic,
    /// Call `t.fail` and return normally (steps only).
    SoftFail(String),
    /// Call `t.skip` and return normally (steps only).
    Skip(String),
    /// Sleep, counting towards `CallLog::peak_concurrency`, then log
    /// `<label>:done`.
    Sleep(Duration),
    /// Return the context with `key` set to `value`.
    SetValue(&'static str, &'static str),
    /// Log `<label>:<key>=<value>` (or `<none>`) and pass.
    Observe(&'static str),
    /// Try to write `key` to the config and log `<label>:written` or
    /// `<label>:frozen`.
    WriteConfig(&'static str),
    /// Never return on its own.
    Hang,
}

impl Behavior {
    pub fn fail(message: &str) -> Self {
        Behavior::Fail(message.to_string())
    }
}

/// A global setup or finish func.
pub fn env_func(log: &CallLog, label: &str, behavior: Behavior) -> impl EnvFunc {
    let log = log.clone();
    let label = label.to_string();
    move |ctx: Context, config: Arc<EnvConfig>| {
        act(
            log.clone(),
            label.clone(),
            behavior.clone(),
            ctx,
            None,
            config,
        )
    }
}

/// A feature setup, assessment or teardown step.
pub fn step(log: &CallLog, label: &str, behavior: Behavior) -> impl StepFunc {
    let log = log.clone();
    let label = label.to_string();
    move |ctx: Context, t: TestHandle, config: Arc<EnvConfig>| {
        act(
            log.clone(),
            label.clone(),
            behavior.clone(),
            ctx,
            Some(t),
            config,
        )
    }
}

/// A before/after-each-feature hook. Logs `<label>:<feature>`.
pub fn hook(log: &CallLog, label: &str, behavior: Behavior) -> impl FeatureHook {
    let log = log.clone();
    let label = label.to_string();
    move |ctx: Context, config: Arc<EnvConfig>, feature: FeatureInfo| {
        act(
            log.clone(),
            format!("{label}:{}", feature.name),
            behavior.clone(),
            ctx,
            None,
            config,
        )
    }
}

async fn act(
    log: CallLog,
    label: String,
    behavior: Behavior,
    ctx: Context,
    t: Option<TestHandle>,
    config: Arc<EnvConfig>,
) -> FuncResult {
    log.push(label.clone());
    match behavior {
        Behavior::Pass => Ok(ctx),
        Behavior::Fail(message) => Err(FuncError::Failed(message)),
        Behavior::Panic => panic!("{label} panicked"),
        Behavior::SoftFail(message) => {
            t.expect("SoftFail is only valid for steps").fail(message);
            Ok(ctx)
        }
        Behavior::Skip(reason) => {
            t.expect("Skip is only valid for steps").skip(reason);
            Ok(ctx)
        }
        Behavior::Sleep(duration) => {
            log.enter();
            tokio::time::sleep(duration).await;
            log.leave();
            log.push(format!("{label}:done"));
            Ok(ctx)
        }
        Behavior::SetValue(key, value) => Ok(ctx.with_value(key, value.to_string())),
        Behavior::Observe(key) => {
            let seen = ctx
                .value::<String>(key)
                .map_or_else(|| "<none>".to_string(), |v| v.as_ref().clone());
            log.push(format!("{label}:{key}={seen}"));
            Ok(ctx)
        }
        Behavior::WriteConfig(key) => {
            let state = match config.set_value(key, label.clone()) {
                Ok(()) => "written",
                Err(_) => "frozen",
            };
            log.push(format!("{label}:{state}"));
            Ok(ctx)
        }
        Behavior::Hang => {
            std::future::pending::<()>().await;
            Ok(ctx)
        }
    }
}

/// Host that keeps every unit report it receives.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub units: Vec<UnitReport>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<kind>:<name>` for each received report, in order.
    pub fn names(&self) -> Vec<String> {
        self.units
            .iter()
            .map(|u| format!("{}:{}", u.kind, u.name))
            .collect()
    }
}

impl TestHost for RecordingHost {
    fn report(&mut self, unit: &UnitReport) {
        self.units.push(unit.clone());
    }
}

/// Environment with an empty config and the given flags.
pub fn environment(flags: Flags) -> Environment {
    Environment::new(EnvConfig::new(), flags).expect("fixture flags should compile")
}

/// Outcome of the unit `name` of `kind`, panicking if it was not reported.
pub fn outcome(report: &RunReport, kind: UnitKind, name: &str) -> Outcome {
    unit(report, kind, name).outcome
}

/// Skip reason of the unit `name` of `kind`.
pub fn skip_reason(report: &RunReport, kind: UnitKind, name: &str) -> Option<SkipReason> {
    unit(report, kind, name).skip_reason.clone()
}

/// The report for the unit `name` of `kind`, panicking if it is missing.
pub fn unit<'r>(report: &'r RunReport, kind: UnitKind, name: &str) -> &'r UnitReport {
    report
        .find(kind, name)
        .unwrap_or_else(|| panic!("no {kind} unit named {name} in report:\n{report}"))
}
