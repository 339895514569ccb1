// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Transactional owner of the committed state tree.
//!
//! The committed tree only changes through [`StateEngine::flush`]. Action
//! bodies run against a [`Draft`] obtained from [`StateEngine::begin`] (or via
//! [`StateEngine::transact`]) and produce a [`Batch`]; callers decide when the
//! batch is durable enough to flush.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use crate::draft::Draft;
use crate::patch::{Batch, Patch};
use crate::path::Path;
use crate::tx::TxId;
use crate::value::{Value, WriteFault};

/// Errors reported by [`StateEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Operation not permitted in the current transaction state.
    #[error("invalid engine state: {0}")]
    InvalidState(&'static str),
    /// The supplied draft does not belong to the open transaction.
    #[error("transaction {0} not active")]
    UnknownTx(TxId),
    /// A patch could not be applied to the committed tree.
    #[error("state corruption at {path}: {reason}")]
    StateCorruption {
        /// Path of the offending patch.
        path: Path,
        /// What went wrong while walking to it.
        reason: String,
    },
}

/// Failure of [`StateEngine::transact`].
#[derive(Debug, Error)]
pub enum TransactError<E> {
    /// The engine refused to open or close the transaction.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The body failed; its batch was discarded.
    #[error("transaction body failed: {0}")]
    Body(E),
}

/// Owns the committed tree and the single open transaction slot.
#[derive(Debug)]
pub struct StateEngine {
    committed: Arc<Value>,
    open: Option<TxId>,
    last_tx: TxId,
}

impl Default for StateEngine {
    fn default() -> Self {
        Self::new(Value::mapping())
    }
}

impl StateEngine {
    /// Engine whose committed tree starts as `initial`.
    pub fn new(initial: Value) -> Self {
        Self {
            committed: Arc::new(initial),
            open: None,
            last_tx: TxId::from_raw(0),
        }
    }

    /// Opens a transaction and returns its draft.
    ///
    /// # Errors
    /// [`EngineError::InvalidState`] if a transaction is already open.
    pub fn begin(&mut self) -> Result<Draft, EngineError> {
        if self.open.is_some() {
            return Err(EngineError::InvalidState("a transaction is already open"));
        }
        let tx = self.last_tx.next();
        self.last_tx = tx;
        self.open = Some(tx);
        Ok(Draft::new(tx, Arc::clone(&self.committed)))
    }

    /// Closes the transaction and returns its batch. The committed tree is
    /// untouched until the batch is flushed.
    ///
    /// # Errors
    /// [`EngineError::UnknownTx`] if `draft` is not the open transaction.
    pub fn commit(&mut self, draft: Draft) -> Result<Batch, EngineError> {
        self.close(draft.tx())?;
        Ok(draft.into_batch())
    }

    /// Closes the transaction, discarding everything the draft recorded.
    ///
    /// # Errors
    /// [`EngineError::UnknownTx`] if `draft` is not the open transaction.
    pub fn abort(&mut self, draft: Draft) -> Result<(), EngineError> {
        self.close(draft.tx())
    }

    fn close(&mut self, tx: TxId) -> Result<(), EngineError> {
        if self.open == Some(tx) {
            self.open = None;
            Ok(())
        } else {
            Err(EngineError::UnknownTx(tx))
        }
    }

    /// Runs `body` inside a transaction. On success returns the body's output
    /// together with the recorded batch; on failure the batch is discarded and
    /// the engine is back to where it started.
    ///
    /// # Errors
    /// [`TransactError::Body`] carrying the body's error, or
    /// [`TransactError::Engine`] if a transaction is already open.
    ///
    /// # Panics
    /// A panic in `body` is resumed after the transaction is closed, so the
    /// engine stays usable if the caller catches it.
    pub fn transact<T, E, F>(&mut self, body: F) -> Result<(T, Batch), TransactError<E>>
    where
        F: FnOnce(&mut Draft) -> Result<T, E>,
    {
        let mut draft = self.begin()?;
        match panic::catch_unwind(AssertUnwindSafe(|| body(&mut draft))) {
            Ok(Ok(out)) => Ok((out, self.commit(draft)?)),
            Ok(Err(err)) => {
                self.abort(draft)?;
                Err(TransactError::Body(err))
            }
            Err(payload) => {
                // the draft is discarded with the batch it recorded
                self.open = None;
                panic::resume_unwind(payload)
            }
        }
    }

    /// Returns `true` while a draft is outstanding.
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Committed tree.
    ///
    /// # Errors
    /// [`EngineError::InvalidState`] while a transaction is open.
    pub fn snapshot(&self) -> Result<Arc<Value>, EngineError> {
        if self.open.is_some() {
            return Err(EngineError::InvalidState(
                "snapshot requested while a transaction is open",
            ));
        }
        Ok(Arc::clone(&self.committed))
    }

    /// Applies `batch` to the committed tree in order.
    ///
    /// Patches are applied independently: one that cannot be applied is
    /// skipped and the rest still land. The first failure is reported.
    ///
    /// # Errors
    /// [`EngineError::InvalidState`] while a transaction is open, or
    /// [`EngineError::StateCorruption`] for the first patch that failed.
    pub fn flush(&mut self, batch: &Batch) -> Result<(), EngineError> {
        if self.open.is_some() {
            return Err(EngineError::InvalidState(
                "flush requested while a transaction is open",
            ));
        }
        if batch.is_empty() {
            return Ok(());
        }
        let root = Arc::make_mut(&mut self.committed);
        let mut first_failure = None;
        for patch in batch {
            if let Err(err) = apply_patch(root, patch) {
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

/// Applies one patch to `root`, walking existing containers only.
///
/// # Errors
/// [`EngineError::StateCorruption`] naming the patch path.
pub fn apply_patch(root: &mut Value, patch: &Patch) -> Result<(), EngineError> {
    root.write_in(patch.path.segments(), patch.value.clone())
        .map_err(|fault| EngineError::StateCorruption {
            path: patch.path.clone(),
            reason: describe(fault, &patch.path),
        })
}

fn describe(fault: WriteFault, path: &Path) -> String {
    let prefix = |n: usize| -> Path { path.iter().take(n).cloned().collect() };
    match fault {
        WriteFault::NotAContainer { depth } => format!("{} is not a container", prefix(depth)),
        WriteFault::MissingParent { depth } => format!("{} does not exist", prefix(depth + 1)),
        WriteFault::BadIndex { depth } => format!(
            "{:?} is not a writable index into the sequence at {}",
            path.segments().get(depth).map_or("", |s| s.as_str()),
            prefix(depth)
        ),
        WriteFault::DeleteRoot => "the root cannot be deleted".to_owned(),
    }
}
