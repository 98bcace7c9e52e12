//! Run configuration.
//!
//! Two pieces live here:
//! - `Flags`: parsed selection inputs and run switches, loaded from
//!   environment variables.
//! - `EnvConfig`: the shared environment configuration handed to every func.
//!   It is read-mostly; the orchestrator freezes it while parallel
//!   assessments are in flight so that concurrent writers are rejected
//!   instead of arbitrated.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Feature-name accept regex.
pub const ENV_FEATURE: &str = "ENVTEST_FEATURE";
/// Assessment-name accept regex.
pub const ENV_ASSESS: &str = "ENVTEST_ASSESS";
/// Label accept set (`k=v,k=v2`).
pub const ENV_LABELS: &str = "ENVTEST_LABELS";
/// Feature-name skip regex.
pub const ENV_SKIP_FEATURES: &str = "ENVTEST_SKIP_FEATURES";
/// Assessment-name skip regex.
pub const ENV_SKIP_ASSESSMENT: &str = "ENVTEST_SKIP_ASSESSMENT";
/// Label skip set.
pub const ENV_SKIP_LABELS: &str = "ENVTEST_SKIP_LABELS";
/// Run the assessments of a feature concurrently.
pub const ENV_PARALLEL: &str = "ENVTEST_PARALLEL";
/// Report what would run without executing anything.
pub const ENV_DRY_RUN: &str = "ENVTEST_DRY_RUN";
/// Stop at the first failure.
pub const ENV_FAIL_FAST: &str = "ENVTEST_FAIL_FAST";
/// Let panics escape instead of recovering them.
pub const ENV_DISABLE_GRACEFUL_TEARDOWN: &str = "ENVTEST_DISABLE_GRACEFUL_TEARDOWN";
/// Initial working namespace.
pub const ENV_NAMESPACE: &str = "ENVTEST_NAMESPACE";
/// Kubeconfig path.
pub const ENV_KUBECONFIG: &str = "KUBECONFIG";

/// Selection inputs and run switches.
///
/// Filters are kept as raw strings; `Filters::compile` turns them into
/// predicates and reports malformed expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub feature: Option<String>,
    pub assessment: Option<String>,
    pub labels: Option<String>,
    pub skip_features: Option<String>,
    pub skip_assessments: Option<String>,
    pub skip_labels: Option<String>,
    pub parallel: bool,
    pub dry_run: bool,
    pub fail_fast: bool,
    pub disable_graceful_teardown: bool,
}

impl Flags {
    /// Load flags from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load flags from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(Self {
            feature: non_empty(vars, ENV_FEATURE),
            assessment: non_empty(vars, ENV_ASSESS),
            labels: non_empty(vars, ENV_LABELS),
            skip_features: non_empty(vars, ENV_SKIP_FEATURES),
            skip_assessments: non_empty(vars, ENV_SKIP_ASSESSMENT),
            skip_labels: non_empty(vars, ENV_SKIP_LABELS),
            parallel: parse_bool(vars, ENV_PARALLEL)?,
            dry_run: parse_bool(vars, ENV_DRY_RUN)?,
            fail_fast: parse_bool(vars, ENV_FAIL_FAST)?,
            disable_graceful_teardown: parse_bool(vars, ENV_DISABLE_GRACEFUL_TEARDOWN)?,
        })
    }
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(vars: &HashMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    let Some(raw) = non_empty(vars, key) else {
        return Ok(false);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var: key.to_string(),
            value: raw,
        }),
    }
}

type Extension = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct MutableState {
    namespace: Option<String>,
    extensions: HashMap<String, Extension>,
}

/// Shared environment configuration for one run.
///
/// Handed to funcs as `Arc<EnvConfig>`. The client handle and kubeconfig
/// path are fixed at construction; the namespace and extension values may
/// be changed by serial steps.
pub struct EnvConfig {
    kubeconfig: Option<PathBuf>,
    client: Option<Extension>,
    state: RwLock<MutableState>,
    frozen: AtomicBool,
}

impl EnvConfig {
    /// Create an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kubeconfig: None,
            client: None,
            state: RwLock::new(MutableState::default()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Load kubeconfig path and namespace from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(&env::vars().collect())
    }

    /// Load kubeconfig path and namespace from a `HashMap` (for testing).
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let mut config = Self::new();
        if let Some(path) = non_empty(vars, ENV_KUBECONFIG) {
            config = config.with_kubeconfig(path);
        }
        if let Some(namespace) = non_empty(vars, ENV_NAMESPACE) {
            config = config.with_namespace(namespace);
        }
        config
    }

    /// Set the kubeconfig path.
    #[must_use]
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Set the initial namespace.
    #[must_use]
    pub fn with_namespace(self, namespace: impl Into<String>) -> Self {
        self.write_state().namespace = Some(namespace.into());
        self
    }

    /// Attach an already-constructed client for the environment.
    #[must_use]
    pub fn with_client<C>(mut self, client: C) -> Self
    where
        C: Any + Send + Sync,
    {
        self.client = Some(Arc::new(client));
        self
    }

    /// Kubeconfig path, if configured.
    #[must_use]
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    /// The client handle, if one of type `C` was attached.
    #[must_use]
    pub fn client<C>(&self) -> Option<Arc<C>>
    where
        C: Any + Send + Sync,
    {
        self.client.clone()?.downcast::<C>().ok()
    }

    /// Current working namespace.
    #[must_use]
    pub fn namespace(&self) -> Option<String> {
        self.read_state().namespace.clone()
    }

    /// Change the working namespace. Rejected while frozen.
    pub fn set_namespace(&self, namespace: impl Into<String>) -> Result<(), ConfigError> {
        self.ensure_writable("namespace")?;
        self.write_state().namespace = Some(namespace.into());
        Ok(())
    }

    /// Look up an extension value.
    #[must_use]
    pub fn value<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.read_state()
            .extensions
            .get(key)
            .cloned()?
            .downcast::<T>()
            .ok()
    }

    /// Store an extension value. Rejected while frozen.
    pub fn set_value<T>(&self, key: impl Into<String>, value: T) -> Result<(), ConfigError>
    where
        T: Any + Send + Sync,
    {
        let key = key.into();
        self.ensure_writable(&key)?;
        self.write_state().extensions.insert(key, Arc::new(value));
        Ok(())
    }

    /// Returns true while writes are rejected.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Reject writes until the returned guard is dropped.
    pub(crate) fn freeze(&self) -> FreezeGuard<'_> {
        self.frozen.store(true, Ordering::Release);
        FreezeGuard { config: self }
    }

    fn ensure_writable(&self, field: &str) -> Result<(), ConfigError> {
        if self.is_frozen() {
            tracing::warn!(
                target: "envtest.config",
                field = %field,
                "Rejected configuration write during parallel execution"
            );
            return Err(ConfigError::Frozen {
                field: field.to_string(),
            });
        }
        Ok(())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, MutableState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, MutableState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Custom Debug implementation that never prints the client handle.
impl fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        let mut keys: Vec<&String> = state.extensions.keys().collect();
        keys.sort();
        f.debug_struct("EnvConfig")
            .field("kubeconfig", &self.kubeconfig)
            .field("client", &self.client.as_ref().map(|_| "[CLIENT]"))
            .field("namespace", &state.namespace)
            .field("extensions", &keys)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

/// Lifts the freeze on drop, including during unwinding.
pub(crate) struct FreezeGuard<'a> {
    config: &'a EnvConfig,
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        self.config.frozen.store(false, Ordering::Release);
    }
}
