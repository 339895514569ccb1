// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Dispatcher error taxonomy.

use bento_core::EngineError;
use bento_log::LogError;
use thiserror::Error;

use crate::action::ActionError;

/// Errors returned by [`crate::Dispatcher`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler is registered under the name. Nothing changed.
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    /// The handler or its mutation failed; the batch was discarded.
    #[error("action {action:?} failed: {source}")]
    Transaction {
        /// Action name.
        action: String,
        /// Handler failure.
        source: ActionError,
    },
    /// A persisted batch could not be applied to the live tree. Only the
    /// offending patches were skipped.
    #[error("state corruption applying record {seq}: {source}")]
    StateCorruption {
        /// Record whose flush failed.
        seq: u64,
        /// Engine failure naming the path.
        source: EngineError,
    },
    /// The log rejected a write. The dispatcher is now failed.
    #[error("persistence failure: {0}")]
    Persistence(#[source] LogError),
    /// Startup replay could not rebuild the tree.
    #[error("replay inconsistency{}: {reason}", .seq.map(|s| format!(" at record {s}")).unwrap_or_default())]
    ReplayInconsistency {
        /// Record being replayed, if the failure is tied to one.
        seq: Option<u64>,
        /// What went wrong.
        reason: String,
    },
    /// The engine was in an unexpected transaction state.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// An earlier fatal error stopped the pipeline.
    #[error("dispatcher has failed and accepts no further work")]
    Failed,
}

impl DispatchError {
    /// Returns `true` for errors that stop the pipeline (or startup).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::Persistence(_)
                | DispatchError::ReplayInconsistency { .. }
                | DispatchError::Engine(_)
                | DispatchError::Failed
        )
    }
}
