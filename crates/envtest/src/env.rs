//! The environment orchestrator.
//!
//! `Environment::run` drives one run through the lifecycle:
//!
//! ```text
//! Created -> SettingUp -> Running -> FinishingUp -> Done
//!                 \________________________/
//!                  (setup failure skips Running)
//! ```
//!
//! # Guarantees
//!
//! - Global setups run in order and complete before any feature starts. The
//!   first failing setup aborts the rest and skips every feature.
//! - Features run one at a time, in registration order. Within a feature:
//!   before-feature hooks, setups, assessments (serial, or concurrent with
//!   `parallel`), teardowns, after-feature hooks.
//! - Teardowns and after-feature hooks run for every started feature, even if
//!   its setup or assessments failed or panicked.
//! - Global finishes run exactly once, whatever happened before, and a
//!   failing finish does not stop the next one.
//! - A panic inside a func becomes a `Failed` unit unless graceful teardown
//!   is disabled, in which case it propagates out of `run` immediately.
//! - Parallel assessment tasks never outlive `run`: dropping the run future,
//!   or a propagated panic, aborts the ones still in flight.
//!
//! # Context threading
//!
//! One context lineage runs through the whole run: each func receives the
//! context returned by the previous func. Parallel assessments each receive
//! a fork of the feature-setup output; their returned contexts are dropped,
//! so siblings never observe each other. Cleanup funcs receive a detached
//! context so an aborted run still releases what it acquired.

use crate::config::{EnvConfig, Flags};
use crate::context::Context;
use crate::errors::{EnvtestError, FuncError};
use crate::features::{Feature, Step};
use crate::funcs::{EnvFunc, FeatureHook, FuncFuture, FuncResult, StepFunc, TestHandle};
use crate::matcher::{Filters, Unit};
use crate::registry::Registry;
use crate::report::{Outcome, RunReport, SkipReason, TestHost, TracingHost, UnitKind, UnitReport};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    SettingUp,
    Running,
    FinishingUp,
    Done,
}

impl Phase {
    /// Whether the lifecycle may move from `self` to `next`.
    ///
    /// `FinishingUp` is reachable from every non-terminal phase.
    #[must_use]
    pub fn can_transition_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Created, Phase::SettingUp)
                | (Phase::SettingUp, Phase::Running)
                | (
                    Phase::Created | Phase::SettingUp | Phase::Running,
                    Phase::FinishingUp
                )
                | (Phase::FinishingUp, Phase::Done)
        )
    }
}

/// Orchestrates setup, feature execution and finish for a registry.
#[derive(Debug)]
pub struct Environment {
    config: Arc<EnvConfig>,
    flags: Flags,
    filters: Filters,
    root: Context,
}

impl Environment {
    /// Build an environment. Selection filters are compiled here, so a
    /// malformed filter fails before anything runs.
    pub fn new(config: EnvConfig, flags: Flags) -> Result<Self, EnvtestError> {
        let filters = Filters::compile(&flags)?;
        Ok(Self {
            config: Arc::new(config),
            flags,
            filters,
            root: Context::background(),
        })
    }

    /// Build an environment from `ENVTEST_*` and `KUBECONFIG` variables.
    pub fn from_env() -> Result<Self, EnvtestError> {
        let flags = Flags::from_env()?;
        Self::new(EnvConfig::from_env(), flags)
    }

    /// Use `ctx` as the root context; cancelling it aborts the run.
    #[must_use]
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.root = ctx;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Arc<EnvConfig> {
        &self.config
    }

    #[must_use]
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    #[must_use]
    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    /// Execute `registry`, reporting each unit to `host`.
    #[instrument(
        skip_all,
        name = "envtest.run",
        fields(
            features = registry.features().len(),
            parallel = self.flags.parallel,
            dry_run = self.flags.dry_run,
            fail_fast = self.flags.fail_fast
        )
    )]
    pub async fn run<H>(&self, registry: &Registry, host: &mut H) -> RunReport
    where
        H: TestHost + ?Sized,
    {
        let started = Instant::now();
        let mut run = Run::new(self, registry, host);

        run.transition(Phase::SettingUp);
        if run.setting_up().await {
            run.transition(Phase::Running);
            run.running().await;
        } else {
            run.skip_all_features(&SkipReason::SetupFailed);
        }

        run.transition(Phase::FinishingUp);
        run.finishing_up().await;
        run.transition(Phase::Done);

        let mut report = run.report;
        report.duration = started.elapsed();

        let counts = report.counts();
        info!(
            target: "envtest.env",
            run_id = %report.run_id,
            outcome = ?report.outcome(),
            passed = counts.passed,
            failed = counts.failed,
            skipped = counts.skipped,
            duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "Run complete"
        );
        report
    }

    /// Execute `registry`, logging each unit, and map the outcome to an exit code.
    pub async fn run_with_tracing(&self, registry: &Registry) -> ExitCode {
        let mut host = TracingHost;
        let report = self.run(registry, &mut host).await;
        info!(target: "envtest.env", "\n{}", report);
        ExitCode::from(&report)
    }
}

/// Index, duration and result of one parallel assessment task.
type BranchOutcome = (usize, Duration, std::thread::Result<FuncResult>);

/// How a single func invocation ended.
enum Invocation {
    Completed(Context),
    Errored(FuncError),
    Panicked(String),
}

/// State of one in-progress run.
struct Run<'a, H: ?Sized> {
    env: &'a Environment,
    registry: &'a Registry,
    host: &'a mut H,
    report: RunReport,
    ctx: Context,
    failed: bool,
    cancelled: bool,
}

impl<'a, H> Run<'a, H>
where
    H: TestHost + ?Sized,
{
    fn new(env: &'a Environment, registry: &'a Registry, host: &'a mut H) -> Self {
        Self {
            env,
            registry,
            host,
            report: RunReport::new(env.flags.dry_run),
            ctx: env.root.clone(),
            failed: false,
            cancelled: false,
        }
    }

    fn transition(&mut self, next: Phase) {
        let current = self.report.phase;
        if !current.can_transition_to(next) {
            error!(
                target: "envtest.env",
                from = ?current,
                to = ?next,
                "Unexpected lifecycle transition"
            );
        }
        debug!(target: "envtest.env", from = ?current, to = ?next, "Lifecycle transition");
        self.report.phase = next;
    }

    fn record(&mut self, unit: UnitReport) {
        if unit.outcome == Outcome::Failed {
            self.failed = true;
        }
        self.host.report(&unit);
        self.report.units.push(unit);
    }

    fn fail_fast_tripped(&self) -> bool {
        self.env.flags.fail_fast && self.failed
    }

    fn failure_count(&self) -> usize {
        self.report.failures().count()
    }

    fn observe(&mut self, invocation: &Invocation) {
        if let Invocation::Errored(err) = invocation {
            if err.is_cancellation() {
                self.cancelled = true;
            }
        }
    }

    /// Record and return true if work must not start because the run is
    /// cancelled. The first unit to hit cancellation fails; later ones skip.
    fn cancelled_before_start(
        &mut self,
        ctx: &Context,
        kind: UnitKind,
        name: &str,
        feature: Option<&str>,
    ) -> bool {
        let Some(err) = self.env.root.err().or_else(|| ctx.err()) else {
            return false;
        };
        if self.cancelled {
            self.record(UnitReport::skipped(kind, name, feature, SkipReason::Cancelled));
        } else {
            self.cancelled = true;
            warn!(target: "envtest.env", unit = %name, error = %err, "Run cancelled");
            self.record(UnitReport::failed(kind, name, feature, err.to_string(), Duration::ZERO));
        }
        true
    }

    async fn setting_up(&mut self) -> bool {
        let env = self.env;
        let registry = self.registry;
        let setups = registry.setups();

        for (index, setup) in setups.iter().enumerate() {
            if env.flags.dry_run {
                self.record(UnitReport::skipped(
                    UnitKind::GlobalSetup,
                    setup.name(),
                    None,
                    SkipReason::DryRun,
                ));
                continue;
            }

            let ctx = self.ctx.clone();
            let healthy =
                !self.cancelled_before_start(&ctx, UnitKind::GlobalSetup, setup.name(), None) && {
                    let started = Instant::now();
                    let func = Arc::clone(&setup.func);
                    let config = Arc::clone(&env.config);
                    let invocation = invoke(
                        &ctx,
                        || EnvFunc::call(func.as_ref(), ctx.clone(), config),
                        true,
                        env.flags.disable_graceful_teardown,
                    )
                    .await;
                    self.observe(&invocation);
                    self.settle_env_func(UnitKind::GlobalSetup, setup.name(), invocation, started)
                };

            if !healthy {
                error!(
                    target: "envtest.env",
                    setup = %setup.name(),
                    "Global setup failed, skipping all features"
                );
                for rest in setups.iter().skip(index + 1) {
                    self.record(UnitReport::skipped(
                        UnitKind::GlobalSetup,
                        rest.name(),
                        None,
                        SkipReason::SetupFailed,
                    ));
                }
                return false;
            }
        }
        true
    }

    /// Record the outcome of a global setup/finish; on success the returned
    /// context becomes the lineage. Returns true on success.
    fn settle_env_func(
        &mut self,
        kind: UnitKind,
        name: &str,
        invocation: Invocation,
        started: Instant,
    ) -> bool {
        let duration = started.elapsed();
        match invocation {
            Invocation::Completed(ctx) => {
                self.ctx = ctx;
                self.record(UnitReport::passed(kind, name, None, duration));
                true
            }
            Invocation::Errored(err) => {
                self.record(UnitReport::failed(kind, name, None, err.to_string(), duration));
                false
            }
            Invocation::Panicked(message) => {
                self.record(UnitReport::failed(
                    kind,
                    name,
                    None,
                    format!("panic: {message}"),
                    duration,
                ));
                false
            }
        }
    }

    fn skip_all_features(&mut self, reason: &SkipReason) {
        let registry = self.registry;
        for feature in registry.features() {
            self.record(UnitReport::skipped(
                UnitKind::Feature,
                feature.name(),
                None,
                reason.clone(),
            ));
        }
    }

    async fn running(&mut self) {
        let env = self.env;
        let registry = self.registry;

        for feature in registry.features() {
            let name = feature.name();

            if !env.filters.should_run(&Unit::feature(name, feature.labels())) {
                debug!(target: "envtest.matcher", feature = %name, "Feature filtered out");
                self.record(UnitReport::skipped(
                    UnitKind::Feature,
                    name,
                    None,
                    SkipReason::Filtered,
                ));
                continue;
            }

            if self.fail_fast_tripped() {
                self.record(UnitReport::skipped(
                    UnitKind::Feature,
                    name,
                    None,
                    SkipReason::FailFast,
                ));
                continue;
            }

            if env.flags.dry_run {
                self.dry_run_feature(feature);
                continue;
            }

            let ctx = self.ctx.clone();
            if self.cancelled_before_start(&ctx, UnitKind::Feature, name, None) {
                continue;
            }

            let span = info_span!("envtest.feature", feature = %name);
            self.run_feature(feature).instrument(span).await;
        }
    }

    fn dry_run_feature(&mut self, feature: &Feature) {
        let registry = self.registry;
        let name = feature.name();

        for hook in registry.before_feature_hooks() {
            self.record(UnitReport::skipped(
                UnitKind::BeforeFeature,
                hook.name(),
                Some(name),
                SkipReason::DryRun,
            ));
        }
        for step in feature.setups() {
            self.record(UnitReport::skipped(
                UnitKind::FeatureSetup,
                step.name(),
                Some(name),
                SkipReason::DryRun,
            ));
        }
        for step in feature.assessments() {
            let reason = if self.assessment_selected(feature, step) {
                info!(target: "envtest.env", feature = %name, assessment = %step.name(), "Would run");
                SkipReason::DryRun
            } else {
                SkipReason::Filtered
            };
            self.record(UnitReport::skipped(
                UnitKind::Assessment,
                step.name(),
                Some(name),
                reason,
            ));
        }
        for step in feature.teardowns() {
            self.record(UnitReport::skipped(
                UnitKind::FeatureTeardown,
                step.name(),
                Some(name),
                SkipReason::DryRun,
            ));
        }
        for hook in registry.after_feature_hooks() {
            self.record(UnitReport::skipped(
                UnitKind::AfterFeature,
                hook.name(),
                Some(name),
                SkipReason::DryRun,
            ));
        }
        self.record(UnitReport::skipped(
            UnitKind::Feature,
            name,
            None,
            SkipReason::DryRun,
        ));
    }

    fn assessment_selected(&self, feature: &Feature, step: &Step) -> bool {
        let labels = feature.effective_labels(step);
        self.env
            .filters
            .should_run(&Unit::assessment(step.name(), &labels))
    }

    async fn run_feature(&mut self, feature: &Feature) {
        let env = self.env;
        let registry = self.registry;
        let name = feature.name();
        let info = feature.info();
        let started = Instant::now();
        let failures_before = self.failure_count();

        info!(target: "envtest.env", feature = %name, "Feature started");

        let mut ctx = self.ctx.clone();
        let mut setup_ok = true;

        for hook in registry.before_feature_hooks() {
            if !setup_ok {
                self.record(UnitReport::skipped(
                    UnitKind::BeforeFeature,
                    hook.name(),
                    Some(name),
                    SkipReason::SetupFailed,
                ));
                continue;
            }
            if self.cancelled_before_start(&ctx, UnitKind::BeforeFeature, hook.name(), Some(name)) {
                setup_ok = false;
                continue;
            }
            let hook_started = Instant::now();
            let func = Arc::clone(&hook.hook);
            let config = Arc::clone(&env.config);
            let hook_info = info.clone();
            let invocation = invoke(
                &ctx,
                || FeatureHook::call(func.as_ref(), ctx.clone(), config, hook_info),
                true,
                env.flags.disable_graceful_teardown,
            )
            .await;
            self.observe(&invocation);
            let (unit, out) = hook_report(
                UnitKind::BeforeFeature,
                name,
                hook.name(),
                invocation,
                hook_started.elapsed(),
            );
            if unit.is_failed() {
                setup_ok = false;
            }
            if let Some(out) = out {
                ctx = out;
            }
            self.record(unit);
        }

        for step in feature.setups() {
            if !setup_ok {
                self.record(UnitReport::skipped(
                    UnitKind::FeatureSetup,
                    step.name(),
                    Some(name),
                    SkipReason::SetupFailed,
                ));
                continue;
            }
            if self.cancelled_before_start(&ctx, UnitKind::FeatureSetup, step.name(), Some(name)) {
                setup_ok = false;
                continue;
            }
            let (unit, out) = self
                .run_step(UnitKind::FeatureSetup, feature, step, ctx.clone(), true)
                .await;
            if unit.is_failed() {
                setup_ok = false;
            }
            if let Some(out) = out {
                ctx = out;
            }
            self.record(unit);
        }

        if setup_ok {
            ctx = if env.flags.parallel {
                self.run_assessments_parallel(feature, ctx).await
            } else {
                self.run_assessments_serial(feature, ctx).await
            };
        } else {
            warn!(target: "envtest.env", feature = %name, "Feature setup failed, skipping assessments");
            for step in feature.assessments() {
                self.record(UnitReport::skipped(
                    UnitKind::Assessment,
                    step.name(),
                    Some(name),
                    SkipReason::SetupFailed,
                ));
            }
        }

        // Cleanup: always runs for a started feature, on a detached context.
        for step in feature.teardowns() {
            let (unit, out) = self
                .run_step(UnitKind::FeatureTeardown, feature, step, ctx.detached(), false)
                .await;
            if let Some(out) = out {
                ctx = out.reattach(&ctx);
            }
            self.record(unit);
        }

        for hook in registry.after_feature_hooks() {
            let hook_started = Instant::now();
            let func = Arc::clone(&hook.hook);
            let config = Arc::clone(&env.config);
            let hook_info = info.clone();
            let detached = ctx.detached();
            let invocation = invoke(
                &detached,
                || FeatureHook::call(func.as_ref(), detached.clone(), config, hook_info),
                false,
                env.flags.disable_graceful_teardown,
            )
            .await;
            let (unit, out) = hook_report(
                UnitKind::AfterFeature,
                name,
                hook.name(),
                invocation,
                hook_started.elapsed(),
            );
            if let Some(out) = out {
                ctx = out.reattach(&ctx);
            }
            self.record(unit);
        }

        self.ctx = ctx;

        let failures = self.failure_count() - failures_before;
        let duration = started.elapsed();
        if failures == 0 {
            info!(target: "envtest.env", feature = %name, duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX), "Feature passed");
            self.record(UnitReport::passed(UnitKind::Feature, name, None, duration));
        } else {
            warn!(target: "envtest.env", feature = %name, failures, "Feature failed");
            self.record(UnitReport::failed(
                UnitKind::Feature,
                name,
                None,
                format!("{failures} unit(s) failed"),
                duration,
            ));
        }
    }

    async fn run_step(
        &mut self,
        kind: UnitKind,
        feature: &Feature,
        step: &Step,
        ctx: Context,
        cancellable: bool,
    ) -> (UnitReport, Option<Context>) {
        let handle = TestHandle::new(step.name());
        let func = step.func();
        let config = Arc::clone(&self.env.config);
        let started = Instant::now();
        let t = handle.clone();
        let invocation = invoke(
            &ctx,
            || StepFunc::call(func.as_ref(), ctx.clone(), t, config),
            cancellable,
            self.env.flags.disable_graceful_teardown,
        )
        .await;
        self.observe(&invocation);
        step_report(kind, feature.name(), step.name(), invocation, &handle, started.elapsed())
    }

    async fn run_assessments_serial(&mut self, feature: &Feature, mut ctx: Context) -> Context {
        let name = feature.name();

        for step in feature.assessments() {
            if !self.assessment_selected(feature, step) {
                self.record(UnitReport::skipped(
                    UnitKind::Assessment,
                    step.name(),
                    Some(name),
                    SkipReason::Filtered,
                ));
                continue;
            }
            if self.fail_fast_tripped() {
                self.record(UnitReport::skipped(
                    UnitKind::Assessment,
                    step.name(),
                    Some(name),
                    SkipReason::FailFast,
                ));
                continue;
            }
            if self.cancelled_before_start(&ctx, UnitKind::Assessment, step.name(), Some(name)) {
                continue;
            }
            let (unit, out) = self
                .run_step(UnitKind::Assessment, feature, step, ctx.clone(), true)
                .await;
            if let Some(out) = out {
                ctx = out;
            }
            self.record(unit);
        }
        ctx
    }

    /// Dispatch every selected assessment on its own task with a forked
    /// context. The config is frozen until all of them have returned.
    ///
    /// Tasks live in a `JoinSet`, so dropping the run (or re-raising a
    /// branch panic) aborts every sibling still in flight.
    async fn run_assessments_parallel(&mut self, feature: &Feature, ctx: Context) -> Context {
        let env = self.env;
        let name = feature.name();

        enum Slot<'s> {
            Filtered(&'s Step),
            Cancelled(&'s Step),
            Dispatched(&'s Step, TestHandle, usize),
        }

        if self.fail_fast_tripped() {
            for step in feature.assessments() {
                self.record(UnitReport::skipped(
                    UnitKind::Assessment,
                    step.name(),
                    Some(name),
                    SkipReason::FailFast,
                ));
            }
            return ctx;
        }

        let config = Arc::clone(&env.config);
        let freeze = config.freeze();

        let mut slots = Vec::new();
        let mut tasks: JoinSet<BranchOutcome> = JoinSet::new();
        let mut dispatched = 0;
        for step in feature.assessments() {
            if !self.assessment_selected(feature, step) {
                slots.push(Slot::Filtered(step));
                continue;
            }
            if env.root.is_cancelled() || ctx.is_cancelled() {
                slots.push(Slot::Cancelled(step));
                continue;
            }
            let index = dispatched;
            dispatched += 1;
            let branch = ctx.fork();
            let handle = TestHandle::new(step.name());
            let t = handle.clone();
            let func = step.func();
            let step_config = Arc::clone(&config);
            debug!(target: "envtest.env", feature = %name, assessment = %step.name(), "Dispatching assessment");
            tasks.spawn(
                async move {
                    let started = Instant::now();
                    let result = AssertUnwindSafe(async move {
                        tokio::select! {
                            biased;
                            err = branch.done() => Err(err),
                            result = StepFunc::call(func.as_ref(), branch.clone(), t, step_config) => result,
                        }
                    })
                    .catch_unwind()
                    .await;
                    (index, started.elapsed(), result)
                }
                .in_current_span(),
            );
            slots.push(Slot::Dispatched(step, handle, index));
        }

        let mut settled: Vec<Option<(Duration, Invocation)>> =
            std::iter::repeat_with(|| None).take(dispatched).collect();
        while let Some(joined) = tasks.join_next().await {
            // Branch panics are caught inside the task; a join error means
            // the runtime aborted it, reported as cancelled below.
            let Ok((index, duration, result)) = joined else {
                continue;
            };
            let invocation = match result {
                Ok(Ok(out)) => Invocation::Completed(out),
                Ok(Err(err)) => Invocation::Errored(err),
                Err(payload) => panicked(payload, env.flags.disable_graceful_teardown),
            };
            if let Some(slot) = settled.get_mut(index) {
                *slot = Some((duration, invocation));
            }
        }
        drop(freeze);

        for slot in slots {
            match slot {
                Slot::Filtered(step) => self.record(UnitReport::skipped(
                    UnitKind::Assessment,
                    step.name(),
                    Some(name),
                    SkipReason::Filtered,
                )),
                Slot::Cancelled(step) => {
                    self.cancelled_before_start(&ctx, UnitKind::Assessment, step.name(), Some(name));
                }
                Slot::Dispatched(step, handle, index) => {
                    let (duration, invocation) = settled
                        .get_mut(index)
                        .and_then(Option::take)
                        .unwrap_or((Duration::ZERO, Invocation::Errored(FuncError::Cancelled)));
                    self.observe(&invocation);
                    let (unit, _branch_ctx) = step_report(
                        UnitKind::Assessment,
                        name,
                        step.name(),
                        invocation,
                        &handle,
                        duration,
                    );
                    self.record(unit);
                }
            }
        }

        ctx
    }

    async fn finishing_up(&mut self) {
        let env = self.env;
        let registry = self.registry;

        for finish in registry.finishes() {
            if env.flags.dry_run {
                self.record(UnitReport::skipped(
                    UnitKind::GlobalFinish,
                    finish.name(),
                    None,
                    SkipReason::DryRun,
                ));
                continue;
            }

            let lineage = self.ctx.clone();
            let detached = lineage.detached();
            let started = Instant::now();
            let func = Arc::clone(&finish.func);
            let config = Arc::clone(&env.config);
            let invocation = invoke(
                &detached,
                || EnvFunc::call(func.as_ref(), detached.clone(), config),
                false,
                env.flags.disable_graceful_teardown,
            )
            .await;
            if !self.settle_env_func(UnitKind::GlobalFinish, finish.name(), invocation, started) {
                warn!(
                    target: "envtest.env",
                    finish = %finish.name(),
                    "Finish func failed, continuing with remaining finishes"
                );
            }
            self.ctx = self.ctx.reattach(&lineage);
        }
    }
}

/// Call a func, recovering panics and optionally racing it against
/// cancellation of `ctx`.
///
/// With `propagate_panics` set the panic payload is re-raised instead.
async fn invoke<M>(ctx: &Context, make: M, cancellable: bool, propagate_panics: bool) -> Invocation
where
    M: FnOnce() -> FuncFuture,
{
    let future = match panic::catch_unwind(AssertUnwindSafe(make)) {
        Ok(future) => future,
        Err(payload) => return panicked(payload, propagate_panics),
    };

    let guarded = AssertUnwindSafe(future).catch_unwind();
    let result = if cancellable {
        tokio::select! {
            biased;
            result = guarded => result,
            err = ctx.done() => return Invocation::Errored(err),
        }
    } else {
        guarded.await
    };

    match result {
        Ok(Ok(out)) => Invocation::Completed(out),
        Ok(Err(err)) => Invocation::Errored(err),
        Err(payload) => panicked(payload, propagate_panics),
    }
}

fn panicked(payload: Box<dyn Any + Send>, propagate: bool) -> Invocation {
    if propagate {
        panic::resume_unwind(payload);
    }
    Invocation::Panicked(panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Turn a feature step invocation into its report and, if the step
/// returned normally, its output context.
fn step_report(
    kind: UnitKind,
    feature: &str,
    step: &str,
    invocation: Invocation,
    handle: &TestHandle,
    duration: Duration,
) -> (UnitReport, Option<Context>) {
    let failures = handle.failures();
    match invocation {
        Invocation::Completed(out) => {
            let unit = if !failures.is_empty() {
                UnitReport::failed(kind, step, Some(feature), failures.join("; "), duration)
            } else if let Some(reason) = handle.skip_reason() {
                let mut unit =
                    UnitReport::skipped(kind, step, Some(feature), SkipReason::Requested(reason));
                unit.duration = duration;
                unit
            } else {
                UnitReport::passed(kind, step, Some(feature), duration)
            };
            (unit, Some(out))
        }
        Invocation::Errored(err) => {
            let mut message = err.to_string();
            if !failures.is_empty() {
                message = format!("{message} ({})", failures.join("; "));
            }
            (
                UnitReport::failed(kind, step, Some(feature), message, duration),
                None,
            )
        }
        Invocation::Panicked(message) => (
            UnitReport::failed(kind, step, Some(feature), format!("panic: {message}"), duration),
            None,
        ),
    }
}

fn hook_report(
    kind: UnitKind,
    feature: &str,
    hook: &str,
    invocation: Invocation,
    duration: Duration,
) -> (UnitReport, Option<Context>) {
    match invocation {
        Invocation::Completed(out) => (
            UnitReport::passed(kind, hook, Some(feature), duration),
            Some(out),
        ),
        Invocation::Errored(err) => (
            UnitReport::failed(kind, hook, Some(feature), err.to_string(), duration),
            None,
        ),
        Invocation::Panicked(message) => (
            UnitReport::failed(kind, hook, Some(feature), format!("panic: {message}"), duration),
            None,
        ),
    }
}
