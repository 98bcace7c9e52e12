//! Lifecycle orchestration for end-to-end suites that run against a shared,
//! live environment.
//!
//! A suite registers global setups, features (each with setup, assessment
//! and teardown steps), optional before/after-each-feature hooks and global
//! finishes on a [`Registry`], then hands it to an [`Environment`]:
//!
//! ```rust,ignore
//! use envtest::prelude::*;
//!
//! #[tokio::test]
//! async fn suite() {
//!     let mut registry = Registry::new();
//!     registry
//!         .setup(envfuncs::create_namespace(envfuncs::random_name("e2e", 6)))
//!         .register_feature(
//!             FeatureBuilder::new("deployment")
//!                 .assess("replicas ready", |ctx: Context, t: TestHandle, _cfg: Arc<EnvConfig>| async move {
//!                     t.log("checking replicas");
//!                     Ok(ctx)
//!                 })
//!                 .feature(),
//!         );
//!
//!     let env = Environment::from_env().unwrap();
//!     let report = env.run(&registry, &mut TracingHost).await;
//!     assert_eq!(report.outcome(), Outcome::Passed, "{report}");
//! }
//! ```

#![warn(clippy::pedantic)]

/// Run configuration, selection flags and `ENVTEST_*` variable parsing
pub mod config;

/// Immutable context threaded through every func
pub mod context;

/// The orchestrator driving setup, features and finish
pub mod env;

/// Ready-made global setup and finish funcs
pub mod envfuncs;

/// Error types
pub mod errors;

/// Features, steps and the feature builder
pub mod features;

/// Func traits and the per-unit test handle
pub mod funcs;

/// Name and label selection filters
pub mod matcher;

/// Tracing subscriber setup
pub mod observability;

/// The lifecycle registry
pub mod registry;

/// Per-unit results and the test host surface
pub mod report;

/// Polling helpers for assessments
pub mod wait;

pub use config::{EnvConfig, Flags};
pub use context::Context;
pub use env::{Environment, Phase};
pub use errors::{ConfigError, EnvtestError, FuncError, SelectionError};
pub use features::{Feature, FeatureBuilder, FeatureInfo, Labels, Level, Step};
pub use funcs::{EnvFunc, FeatureHook, FuncResult, StepFunc, TestHandle};
pub use registry::Registry;
pub use report::{Outcome, RunReport, SkipReason, TestHost, TracingHost, UnitKind, UnitReport};

/// Everything a suite file usually needs.
pub mod prelude {
    pub use crate::envfuncs;
    pub use crate::wait::{poll_until, Backoff};
    pub use crate::{
        Context, EnvConfig, Environment, FeatureBuilder, FeatureInfo, Flags, FuncError,
        FuncResult, Outcome, Registry, RunReport, TestHandle, TestHost, TracingHost,
    };
    pub use std::sync::Arc;
}
