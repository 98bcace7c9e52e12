//! Features, assessments and the feature builder.
//!
//! A `Feature` is a named, labeled, ordered group of steps at three levels:
//! Setup, Assess and Teardown. It is the unit the matcher selects or rejects
//! and the boundary of assessment parallelism.
//!
//! Features are assembled with `FeatureBuilder`, whose methods take
//! `&mut self` and hand the same builder back. `FeatureBuilder::feature`
//! snapshots the accumulated steps into an immutable `Feature`; later builder
//! calls never reach a snapshot that was already taken.
//!
//! ```rust,ignore
//! let feature = FeatureBuilder::new("networking")
//!     .with_label("tier", "core")
//!     .setup(create_service)
//!     .assess("service resolves", check_dns)
//!     .assess("traffic flows", check_traffic)
//!     .teardown(delete_service)
//!     .feature();
//! ```

use crate::funcs::StepFunc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Label map. Keys are unique; setting a key again replaces its value.
pub type Labels = BTreeMap<String, String>;

/// Position of a step within its feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Setup,
    Assess,
    Teardown,
}

/// One step of a feature.
#[derive(Clone)]
pub struct Step {
    name: String,
    level: Level,
    labels: Labels,
    func: Arc<dyn StepFunc>,
}

impl Step {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    /// Labels declared on the step itself.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub(crate) fn func(&self) -> Arc<dyn StepFunc> {
        Arc::clone(&self.func)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

/// An assessment is an `Assess`-level step.
pub type Assessment = Step;

/// Name and labels of a feature, handed to feature hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureInfo {
    pub name: String,
    pub labels: Labels,
}

/// An immutable feature.
///
/// Steps are shared behind an `Arc`; running the same feature twice sees the
/// same steps in the same order.
#[derive(Debug, Clone)]
pub struct Feature {
    name: String,
    labels: Labels,
    steps: Arc<[Step]>,
}

impl Feature {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// All steps in registration order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Steps of one level in registration order.
    pub fn steps_at(&self, level: Level) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |s| s.level == level)
    }

    /// Setup steps in registration order.
    pub fn setups(&self) -> impl Iterator<Item = &Step> {
        self.steps_at(Level::Setup)
    }

    /// Assessments in registration order.
    pub fn assessments(&self) -> impl Iterator<Item = &Assessment> {
        self.steps_at(Level::Assess)
    }

    /// Teardown steps in registration order.
    pub fn teardowns(&self) -> impl Iterator<Item = &Step> {
        self.steps_at(Level::Teardown)
    }

    /// Labels of `step` as seen by the matcher: the feature's labels
    /// overlaid with the step's own.
    #[must_use]
    pub fn effective_labels(&self, step: &Step) -> Labels {
        let mut labels = self.labels.clone();
        labels.extend(step.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels
    }

    #[must_use]
    pub fn info(&self) -> FeatureInfo {
        FeatureInfo {
            name: self.name.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Incremental, fluent construction of a `Feature`.
pub struct FeatureBuilder {
    name: String,
    labels: Labels,
    steps: Vec<Step>,
    setup_count: usize,
    teardown_count: usize,
}

impl FeatureBuilder {
    /// Start a feature called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
            steps: Vec::new(),
            setup_count: 0,
            teardown_count: 0,
        }
    }

    /// Attach a label. Setting an existing key replaces its value.
    pub fn with_label(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Append a setup step named `setup-N`.
    pub fn setup<F>(&mut self, func: F) -> &mut Self
    where
        F: StepFunc + 'static,
    {
        self.setup_count += 1;
        let name = format!("setup-{}", self.setup_count);
        self.push(name, Level::Setup, Labels::new(), func)
    }

    /// Append a named setup step.
    pub fn setup_named<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: StepFunc + 'static,
    {
        self.setup_count += 1;
        self.push(name.into(), Level::Setup, Labels::new(), func)
    }

    /// Append an assessment.
    pub fn assess<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: StepFunc + 'static,
    {
        self.push(name.into(), Level::Assess, Labels::new(), func)
    }

    /// Append an assessment carrying its own labels.
    pub fn assess_labeled<F, I, K, V>(&mut self, name: impl Into<String>, labels: I, func: F) -> &mut Self
    where
        F: StepFunc + 'static,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.push(name.into(), Level::Assess, labels, func)
    }

    /// Append a teardown step named `teardown-N`.
    pub fn teardown<F>(&mut self, func: F) -> &mut Self
    where
        F: StepFunc + 'static,
    {
        self.teardown_count += 1;
        let name = format!("teardown-{}", self.teardown_count);
        self.push(name, Level::Teardown, Labels::new(), func)
    }

    /// Append a named teardown step.
    pub fn teardown_named<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: StepFunc + 'static,
    {
        self.teardown_count += 1;
        self.push(name.into(), Level::Teardown, Labels::new(), func)
    }

    /// Snapshot the builder into an immutable feature.
    ///
    /// May be called repeatedly; every call returns an independent value.
    #[must_use]
    pub fn feature(&self) -> Feature {
        Feature {
            name: self.name.clone(),
            labels: self.labels.clone(),
            steps: Arc::from(self.steps.clone()),
        }
    }

    fn push<F>(&mut self, name: String, level: Level, labels: Labels, func: F) -> &mut Self
    where
        F: StepFunc + 'static,
    {
        self.steps.push(Step {
            name,
            level,
            labels,
            func: Arc::new(func),
        });
        self
    }
}
