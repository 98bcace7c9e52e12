//! The context value threaded through every lifecycle step.
//!
//! A `Context` is an immutable handle: `with_value` and friends return a new
//! handle and leave the receiver untouched, so a step only ever sees what the
//! previous step in its lineage returned. Cloning is cheap (two `Arc`s and a
//! token), which is what makes forking one context per parallel branch free.
//!
//! Cancellation follows the usual token tree: a child created with
//! `with_cancel` is cancelled when its parent is, never the other way round.

use crate::errors::FuncError;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Value = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    after: Duration,
}

/// Caller-scoped values plus cancellation state.
#[derive(Clone)]
pub struct Context {
    values: Arc<HashMap<String, Value>>,
    cancel: CancellationToken,
    deadline: Option<Deadline>,
}

impl Context {
    /// Create an empty root context that is never cancelled on its own.
    #[must_use]
    pub fn background() -> Self {
        Self {
            values: Arc::new(HashMap::new()),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Return a context carrying `value` under `key`. Existing keys are shadowed.
    #[must_use]
    pub fn with_value<T>(&self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut values = HashMap::clone(&self.values);
        values.insert(key.into(), Arc::new(value));
        Self {
            values: Arc::new(values),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }

    /// Look up a value by key, returning `None` if absent or of another type.
    #[must_use]
    pub fn value<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.values.get(key).cloned()?.downcast::<T>().ok()
    }

    /// Returns true if a value of any type is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Branch this context for an independent line of execution.
    ///
    /// Values written on the branch are invisible to the parent and to
    /// sibling branches. Cancellation of the parent still reaches the branch.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Derive a cancellable child context.
    ///
    /// Cancelling the returned token cancels the child only.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = Self {
            values: Arc::clone(&self.values),
            cancel: token.clone(),
            deadline: self.deadline,
        };
        (ctx, token)
    }

    /// Derive a child context that expires after `timeout`.
    ///
    /// An earlier deadline inherited from the receiver is kept.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Deadline {
            at: Instant::now() + timeout,
            after: timeout,
        };
        let deadline = match self.deadline {
            Some(existing) if existing.at <= candidate.at => existing,
            _ => candidate,
        };
        Self {
            values: Arc::clone(&self.values),
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child context that expires at `at`.
    ///
    /// An earlier deadline inherited from the receiver is kept.
    #[must_use]
    pub fn with_deadline(&self, at: Instant) -> Self {
        self.with_timeout(at.saturating_duration_since(Instant::now()))
    }

    /// Keep the values but drop cancellation and deadline.
    ///
    /// Cleanup steps run on a detached context so an aborted run still
    /// releases what it acquired.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Values of `self` under the cancellation and deadline of `lineage`.
    pub(crate) fn reattach(&self, lineage: &Context) -> Self {
        Self {
            values: Arc::clone(&self.values),
            cancel: lineage.cancel.clone(),
            deadline: lineage.deadline,
        }
    }

    /// The deadline of this context, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|d| d.at)
    }

    /// Returns true once the context is cancelled or past its deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is done, or `None` while it is live.
    #[must_use]
    pub fn err(&self) -> Option<FuncError> {
        if self.cancel.is_cancelled() {
            return Some(FuncError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d.at => Some(FuncError::Timeout(d.after)),
            _ => None,
        }
    }

    /// `Ok(())` while live, the cancellation error otherwise.
    ///
    /// Funcs can call `ctx.check()?` between blocking operations.
    pub fn check(&self) -> Result<(), FuncError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> FuncError {
        match self.deadline {
            Some(d) => tokio::select! {
                () = self.cancel.cancelled() => FuncError::Cancelled,
                () = tokio::time::sleep_until(d.at) => FuncError::Timeout(d.after),
            },
            None => {
                self.cancel.cancelled().await;
                FuncError::Cancelled
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Context")
            .field("keys", &keys)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline.map(|d| d.after))
            .finish()
    }
}
