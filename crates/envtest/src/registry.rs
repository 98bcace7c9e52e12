//! The lifecycle registry.
//!
//! Holds what one run executes: global setups, feature hooks, features and
//! global finishes. The registry is an ordinary value owned by the caller;
//! there is no process-wide list. It is append-only while being populated
//! and is only read by `Environment::run`, so the same registry can drive
//! several independent runs.

use crate::features::Feature;
use crate::funcs::{EnvFunc, FeatureHook};
use std::fmt;
use std::sync::Arc;

/// A global Setup or Finish func with its report name.
#[derive(Clone)]
pub struct NamedFunc {
    pub(crate) name: String,
    pub(crate) func: Arc<dyn EnvFunc>,
}

impl NamedFunc {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for NamedFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedFunc")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A before/after-each-feature hook with its report name.
#[derive(Clone)]
pub struct NamedHook {
    pub(crate) name: String,
    pub(crate) hook: Arc<dyn FeatureHook>,
}

impl NamedHook {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for NamedHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedHook")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered setups, hooks, features and finishes for one run.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    setups: Vec<NamedFunc>,
    before_feature: Vec<NamedHook>,
    features: Vec<Feature>,
    after_feature: Vec<NamedHook>,
    finishes: Vec<NamedFunc>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a global setup func named `setup-N`.
    pub fn setup<F>(&mut self, func: F) -> &mut Self
    where
        F: EnvFunc + 'static,
    {
        let name = format!("setup-{}", self.setups.len() + 1);
        self.setup_named(name, func)
    }

    /// Register a named global setup func.
    pub fn setup_named<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: EnvFunc + 'static,
    {
        self.setups.push(NamedFunc {
            name: name.into(),
            func: Arc::new(func),
        });
        self
    }

    /// Register a hook run before every selected feature.
    pub fn before_each_feature<H>(&mut self, hook: H) -> &mut Self
    where
        H: FeatureHook + 'static,
    {
        let name = format!("before-feature-{}", self.before_feature.len() + 1);
        self.before_feature.push(NamedHook {
            name,
            hook: Arc::new(hook),
        });
        self
    }

    /// Register a hook run after every started feature.
    pub fn after_each_feature<H>(&mut self, hook: H) -> &mut Self
    where
        H: FeatureHook + 'static,
    {
        let name = format!("after-feature-{}", self.after_feature.len() + 1);
        self.after_feature.push(NamedHook {
            name,
            hook: Arc::new(hook),
        });
        self
    }

    /// Register a feature.
    pub fn register_feature(&mut self, feature: Feature) -> &mut Self {
        self.features.push(feature);
        self
    }

    /// Register several features, in order.
    pub fn register_features(&mut self, features: impl IntoIterator<Item = Feature>) -> &mut Self {
        self.features.extend(features);
        self
    }

    /// Register a global finish func named `finish-N`.
    pub fn finish<F>(&mut self, func: F) -> &mut Self
    where
        F: EnvFunc + 'static,
    {
        let name = format!("finish-{}", self.finishes.len() + 1);
        self.finish_named(name, func)
    }

    /// Register a named global finish func.
    pub fn finish_named<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: EnvFunc + 'static,
    {
        self.finishes.push(NamedFunc {
            name: name.into(),
            func: Arc::new(func),
        });
        self
    }

    #[must_use]
    pub fn setups(&self) -> &[NamedFunc] {
        &self.setups
    }

    #[must_use]
    pub fn before_feature_hooks(&self) -> &[NamedHook] {
        &self.before_feature
    }

    #[must_use]
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    #[must_use]
    pub fn after_feature_hooks(&self) -> &[NamedHook] {
        &self.after_feature
    }

    #[must_use]
    pub fn finishes(&self) -> &[NamedFunc] {
        &self.finishes
    }
}
