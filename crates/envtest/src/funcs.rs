//! Func shapes accepted by the lifecycle.
//!
//! Every hook kind has the single capability "take a context (plus config),
//! return a context or an error". Each trait has a blanket impl for async
//! closures, so plain functions and closures can be registered directly:
//!
//! ```rust,ignore
//! registry.setup(|ctx: Context, cfg: Arc<EnvConfig>| async move {
//!     cfg.set_namespace("e2e-demo")?;
//!     Ok(ctx.with_value("ready", true))
//! });
//! ```

use crate::config::EnvConfig;
use crate::context::Context;
use crate::errors::FuncError;
use crate::features::FeatureInfo;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What every func resolves to.
pub type FuncResult = Result<Context, FuncError>;

/// Type-erased future returned by a func.
pub type FuncFuture = BoxFuture<'static, FuncResult>;

/// Global Setup and Finish funcs.
pub trait EnvFunc: Send + Sync {
    fn call(&self, ctx: Context, config: Arc<EnvConfig>) -> FuncFuture;
}

impl<F, Fut> EnvFunc for F
where
    F: Fn(Context, Arc<EnvConfig>) -> Fut + Send + Sync,
    Fut: Future<Output = FuncResult> + Send + 'static,
{
    fn call(&self, ctx: Context, config: Arc<EnvConfig>) -> FuncFuture {
        Box::pin(self(ctx, config))
    }
}

/// Feature Setup, Assess and Teardown steps.
pub trait StepFunc: Send + Sync {
    fn call(&self, ctx: Context, t: TestHandle, config: Arc<EnvConfig>) -> FuncFuture;
}

impl<F, Fut> StepFunc for F
where
    F: Fn(Context, TestHandle, Arc<EnvConfig>) -> Fut + Send + Sync,
    Fut: Future<Output = FuncResult> + Send + 'static,
{
    fn call(&self, ctx: Context, t: TestHandle, config: Arc<EnvConfig>) -> FuncFuture {
        Box::pin(self(ctx, t, config))
    }
}

/// Before-each-feature and after-each-feature hooks.
pub trait FeatureHook: Send + Sync {
    fn call(&self, ctx: Context, config: Arc<EnvConfig>, feature: FeatureInfo) -> FuncFuture;
}

impl<F, Fut> FeatureHook for F
where
    F: Fn(Context, Arc<EnvConfig>, FeatureInfo) -> Fut + Send + Sync,
    Fut: Future<Output = FuncResult> + Send + 'static,
{
    fn call(&self, ctx: Context, config: Arc<EnvConfig>, feature: FeatureInfo) -> FuncFuture {
        Box::pin(self(ctx, config, feature))
    }
}

#[derive(Debug, Default)]
struct HandleState {
    failures: Vec<String>,
    skipped: Option<String>,
    logs: Vec<String>,
}

/// Per-unit reporting handle passed to feature steps.
///
/// Cloning shares the same unit; a step may hand clones to helper tasks.
#[derive(Debug, Clone)]
pub struct TestHandle {
    name: Arc<str>,
    state: Arc<Mutex<HandleState>>,
}

impl TestHandle {
    /// Create a handle for the unit `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            state: Arc::new(Mutex::new(HandleState::default())),
        }
    }

    /// Name of the unit this handle reports for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a log line against the unit.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "envtest.step", unit = %self.name, "{}", message);
        self.lock().logs.push(message);
    }

    /// Mark the unit failed without aborting the step.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "envtest.step", unit = %self.name, "{}", message);
        self.lock().failures.push(message);
    }

    /// Mark the unit skipped. Has no effect on the outcome if it also failed.
    pub fn skip(&self, reason: impl Into<String>) {
        self.lock().skipped = Some(reason.into());
    }

    /// Returns true once `fail` was called.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        !self.lock().failures.is_empty()
    }

    /// Messages passed to `fail`, in order.
    #[must_use]
    pub fn failures(&self) -> Vec<String> {
        self.lock().failures.clone()
    }

    /// Reason passed to `skip`, if any.
    #[must_use]
    pub fn skip_reason(&self) -> Option<String> {
        self.lock().skipped.clone()
    }

    /// Lines passed to `log`, in order.
    #[must_use]
    pub fn logs(&self) -> Vec<String> {
        self.lock().logs.clone()
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
