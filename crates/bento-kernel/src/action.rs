// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Named action handlers.
//!
//! A handler turns a payload into a [`Mutation`]: the closure that runs
//! against the transaction's [`Draft`]. Asynchronous handlers do their
//! awaiting first, with a snapshot of the committed tree in hand, and then
//! return the mutation. The dispatcher holds its pipeline across that await,
//! so the snapshot is still current when the mutation runs.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bento_core::{Draft, DraftError, Value};
use futures_util::future::{self, BoxFuture, FutureExt};
use thiserror::Error;

/// Failure raised by an action handler or its mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The payload did not have the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// A draft write was rejected.
    #[error(transparent)]
    Draft(#[from] DraftError),
    /// Handler-specific failure.
    #[error("{0}")]
    Failed(String),
    /// The handler or its mutation panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl ActionError {
    /// Handler-specific failure with `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(message.into())
    }

    fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        ActionError::Panicked(message)
    }
}

/// Body of one transaction.
pub type Mutation = Box<dyn FnOnce(&mut Draft) -> Result<(), ActionError> + Send>;

/// Future produced by an asynchronous handler.
pub type ActionFuture = BoxFuture<'static, Result<Mutation, ActionError>>;

type Handler = Arc<dyn Fn(Arc<Value>, Value) -> ActionFuture + Send + Sync>;

/// Name → handler table supplied at construction.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl ActionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronous handler that edits the draft directly.
    pub fn register<F>(&mut self, name: impl Into<String>, action: F) -> &mut Self
    where
        F: Fn(&mut Draft, Value) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        let action = Arc::new(action);
        let handler: Handler = Arc::new(move |_state: Arc<Value>, payload: Value| -> ActionFuture {
            let action = Arc::clone(&action);
            let mutation: Mutation = Box::new(move |draft: &mut Draft| action(draft, payload));
            future::ready(Ok(mutation)).boxed()
        });
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Registers an asynchronous handler. It receives the committed tree and
    /// the payload, may await, and returns the mutation to apply.
    pub fn register_async<F, Fut>(&mut self, name: impl Into<String>, action: F) -> &mut Self
    where
        F: Fn(Arc<Value>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Mutation, ActionError>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |state: Arc<Value>, payload: Value| -> ActionFuture { action(state, payload).boxed() });
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Builder form of [`ActionRegistry::register`].
    pub fn with<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&mut Draft, Value) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.register(name, action);
        self
    }

    /// Returns `true` if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Starts handler `name`. A panic anywhere in the handler, its future, or
    /// the mutation it returns comes back as [`ActionError::Panicked`].
    pub(crate) fn prepare(&self, name: &str, state: Arc<Value>, payload: Value) -> Option<ActionFuture> {
        let handler = self.handlers.get(name)?;
        let pending = match panic::catch_unwind(AssertUnwindSafe(|| handler(state, payload))) {
            Ok(pending) => pending,
            Err(caught) => return Some(future::ready(Err(ActionError::panicked(&*caught))).boxed()),
        };
        Some(
            AssertUnwindSafe(pending)
                .catch_unwind()
                .map(|outcome| match outcome {
                    Ok(result) => result.map(contain),
                    Err(caught) => Err(ActionError::panicked(&*caught)),
                })
                .boxed(),
        )
    }
}

fn contain(body: Mutation) -> Mutation {
    Box::new(move |draft: &mut Draft| {
        panic::catch_unwind(AssertUnwindSafe(|| body(draft)))
            .unwrap_or_else(|caught| Err(ActionError::panicked(&*caught)))
    })
}

/// Boxes a closure as a [`Mutation`].
pub fn mutation<F>(body: F) -> Mutation
where
    F: FnOnce(&mut Draft) -> Result<(), ActionError> + Send + 'static,
{
    Box::new(body)
}
