// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Serialized action pipeline.
//!
//! Every action runs the same pipeline while holding one async lock:
//!
//! 1. `Dispatching`: look up the handler and await it;
//! 2. `Applying`: run its mutation in a [`StateEngine`] transaction;
//! 3. `Persisting`: append the batch to the [`PatchLog`];
//! 4. `Broadcasting`: route the batch to subscribed peers, then flush it into
//!    the live tree.
//!
//! The lock is `tokio::sync::Mutex`, which is fair, so queued actions run in
//! arrival order and an asynchronous handler's await cannot interleave with
//! another action. Peer bookkeeping lives behind a separate short-lived lock
//! so connects and disconnects never wait on a slow handler, and routing sees
//! a consistent set of peers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bento_core::{merge_defaults, Batch, Patch, Path, StateEngine, TransactError, Value};
use bento_log::PatchLog;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::action::ActionRegistry;
use crate::error::DispatchError;
use crate::registry::{PeerId, SubscriptionRegistry};

/// Construction-time configuration.
#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    /// Default tree; also the source of additive defaults after replay.
    pub defaults: Value,
    /// Available actions.
    pub actions: ActionRegistry,
    /// Collapse the log after this many incremental records.
    pub collapse_every: Option<u64>,
}

impl KernelConfig {
    /// Configuration with `defaults` and no actions.
    pub fn new(defaults: impl Into<Value>) -> Self {
        Self {
            defaults: defaults.into(),
            ..Self::default()
        }
    }

    /// Sets the action table.
    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    /// Enables periodic collapse.
    pub fn collapse_every(mut self, records: u64) -> Self {
        self.collapse_every = Some(records).filter(|n| *n > 0);
        self
    }
}

/// Pipeline phase, observable through [`Dispatcher::watch_phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting for work.
    Idle,
    /// Resolving and awaiting the handler.
    Dispatching,
    /// Running the mutation against a draft.
    Applying,
    /// Writing the batch to the log.
    Persisting,
    /// Sending to peers and flushing into the live tree.
    Broadcasting,
    /// Stopped after a fatal error.
    Failed,
}

/// Patches delivered to one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Emit {
    /// Patches in application order.
    pub patches: Vec<Patch>,
}

/// Result of a successful [`Dispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Log sequence number, or `None` when the action changed nothing.
    pub seq: Option<u64>,
    /// Patches in the batch.
    pub patches: usize,
    /// Peers that received an emit.
    pub peers: usize,
}

/// A connected peer: its id and the stream of emits addressed to it. The
/// first emit is the initial view of its scopes.
#[derive(Debug)]
pub struct PeerHandle {
    /// Id to pass to [`Dispatcher::disconnect`].
    pub id: PeerId,
    /// Emits in delivery order.
    pub emits: mpsc::UnboundedReceiver<Emit>,
}

struct Pipeline {
    engine: StateEngine,
    log: PatchLog,
}

#[derive(Default)]
struct Peers {
    registry: SubscriptionRegistry,
    outboxes: HashMap<PeerId, mpsc::UnboundedSender<Emit>>,
    next_id: u64,
}

/// Returns the phase to `Idle` when a dispatch ends, including when the
/// caller drops its future mid-flight. `Failed` is left alone.
struct IdleOnExit<'a>(&'a Dispatcher);

impl Drop for IdleOnExit<'_> {
    fn drop(&mut self) {
        self.0.inner.phase.send_if_modified(|phase| match phase {
            Phase::Idle | Phase::Failed => false,
            _ => {
                *phase = Phase::Idle;
                true
            }
        });
    }
}

struct Inner {
    pipeline: tokio::sync::Mutex<Pipeline>,
    peers: Mutex<Peers>,
    actions: ActionRegistry,
    collapse_every: Option<u64>,
    phase: watch::Sender<Phase>,
}

/// Cloneable handle to the pipeline. Peers and server-side code (timers,
/// integrations) dispatch through the same handle.
///
/// Handlers must not call back into `dispatch` on the same dispatcher: the
/// nested call would wait for the pipeline the outer call holds.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("phase", &self.phase())
            .field("actions", &self.inner.actions)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Recovers state from `log` and returns a ready dispatcher.
    ///
    /// Replays every record into a fresh engine, collapses the log to a
    /// snapshot of the result, then fills fields missing from the recovered
    /// tree from `config.defaults` as one logged batch.
    ///
    /// # Errors
    /// [`DispatchError::ReplayInconsistency`] if the log cannot be replayed,
    /// [`DispatchError::Persistence`] if collapsing or logging defaults fails.
    pub fn start(config: KernelConfig, mut log: PatchLog) -> Result<Self, DispatchError> {
        let KernelConfig {
            defaults,
            actions,
            collapse_every,
        } = config;

        let records = log.replay().map_err(|err| DispatchError::ReplayInconsistency {
            seq: None,
            reason: err.to_string(),
        })?;
        let mut engine = StateEngine::new(defaults.clone());
        for record in &records {
            engine
                .flush(&record.batch)
                .map_err(|err| DispatchError::ReplayInconsistency {
                    seq: Some(record.seq),
                    reason: err.to_string(),
                })?;
        }
        if records.is_empty() {
            info!("empty patch log; starting from defaults");
        } else {
            info!(records = records.len(), "replayed patch log");
        }

        let snapshot = engine.snapshot()?;
        log.collapse(&snapshot).map_err(DispatchError::Persistence)?;

        let (filled, batch) = match engine.transact(|draft| merge_defaults(draft, &defaults)) {
            Ok(result) => result,
            Err(TransactError::Body(err)) => {
                return Err(DispatchError::ReplayInconsistency {
                    seq: None,
                    reason: format!("defaults do not fit recovered state: {err}"),
                })
            }
            Err(TransactError::Engine(err)) => return Err(err.into()),
        };
        if !batch.is_empty() {
            let seq = log.append(&batch).map_err(DispatchError::Persistence)?;
            engine
                .flush(&batch)
                .map_err(|source| DispatchError::StateCorruption { seq, source })?;
            info!(filled, seq, "merged new defaults into recovered state");
        }

        let (phase, _) = watch::channel(Phase::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                pipeline: tokio::sync::Mutex::new(Pipeline { engine, log }),
                peers: Mutex::new(Peers::default()),
                actions,
                collapse_every,
                phase,
            }),
        })
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    /// Receiver that observes every phase change.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.phase.send_replace(phase);
    }

    fn ensure_running(&self) -> Result<(), DispatchError> {
        if self.phase() == Phase::Failed {
            return Err(DispatchError::Failed);
        }
        Ok(())
    }

    fn fail(&self, err: DispatchError) -> DispatchError {
        error!(error = %err, "dispatcher entering failed state");
        self.set_phase(Phase::Failed);
        err
    }

    fn peers(&self) -> MutexGuard<'_, Peers> {
        self.inner
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registered action names.
    pub fn actions(&self) -> &ActionRegistry {
        &self.inner.actions
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers().registry.len()
    }

    /// Committed tree, once any in-flight action has finished.
    ///
    /// # Errors
    /// [`DispatchError::Failed`] after a fatal error.
    pub async fn snapshot(&self) -> Result<Arc<Value>, DispatchError> {
        let pipeline = self.inner.pipeline.lock().await;
        self.ensure_running()?;
        Ok(pipeline.engine.snapshot()?)
    }

    /// Registers a peer with `scopes` (the whole tree when empty) and queues
    /// its initial view as the first emit.
    ///
    /// # Errors
    /// [`DispatchError::Failed`] after a fatal error.
    #[instrument(skip(self))]
    pub async fn connect(&self, scopes: Vec<Path>) -> Result<PeerHandle, DispatchError> {
        // Waiting for the pipeline keeps the initial view and the first
        // routed batch from overlapping or leaving a gap.
        let pipeline = self.inner.pipeline.lock().await;
        self.ensure_running()?;
        let snapshot = pipeline.engine.snapshot()?;

        let (tx, emits) = mpsc::unbounded_channel();
        let mut peers = self.peers();
        let id = PeerId::from_raw(peers.next_id);
        peers.next_id += 1;
        peers.registry.register(id, scopes);
        let view = peers.registry.initial_view(id, &snapshot);
        // The receiver is still in hand, so this cannot fail.
        let _ = tx.send(Emit { patches: view });
        peers.outboxes.insert(id, tx);
        info!(peer = %id, "peer connected");
        Ok(PeerHandle { id, emits })
    }

    /// Forgets `peer`. Idempotent.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        let mut peers = self.peers();
        peers.outboxes.remove(&peer);
        let known = peers.registry.unregister(peer);
        if known {
            info!(peer = %peer, "peer disconnected");
        }
        known
    }

    /// Runs action `name` with `payload` through the full pipeline.
    ///
    /// # Errors
    /// - [`DispatchError::UnknownAction`] / [`DispatchError::Transaction`]:
    ///   nothing was logged, sent, or applied.
    /// - [`DispatchError::Persistence`]: nothing was sent or applied and the
    ///   dispatcher is now failed.
    /// - [`DispatchError::StateCorruption`]: the batch was logged and sent
    ///   but some of its patches did not apply.
    /// - [`DispatchError::Failed`]: an earlier fatal error.
    #[instrument(skip(self, name, payload), fields(action = %name))]
    pub async fn dispatch(&self, name: &str, payload: Value) -> Result<DispatchOutcome, DispatchError> {
        let mut pipeline = self.inner.pipeline.lock().await;
        self.ensure_running()?;
        let _idle = IdleOnExit(self);
        self.run(&mut pipeline, name, payload).await
    }

    async fn run(
        &self,
        pipeline: &mut Pipeline,
        name: &str,
        payload: Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.set_phase(Phase::Dispatching);
        let state = pipeline.engine.snapshot().map_err(|e| self.fail(e.into()))?;
        let Some(pending) = self.inner.actions.prepare(name, state, payload) else {
            warn!("unknown action");
            return Err(DispatchError::UnknownAction(name.to_owned()));
        };
        let mutation = pending.await.map_err(|source| {
            warn!(error = %source, "action handler failed");
            DispatchError::Transaction {
                action: name.to_owned(),
                source,
            }
        })?;

        self.set_phase(Phase::Applying);
        let batch = match pipeline.engine.transact(mutation) {
            Ok(((), batch)) => batch,
            Err(TransactError::Body(source)) => {
                warn!(error = %source, "action body failed; batch discarded");
                return Err(DispatchError::Transaction {
                    action: name.to_owned(),
                    source,
                });
            }
            Err(TransactError::Engine(err)) => return Err(self.fail(err.into())),
        };
        if batch.is_empty() {
            debug!("action produced no patches");
            return Ok(DispatchOutcome {
                seq: None,
                patches: 0,
                peers: 0,
            });
        }

        self.set_phase(Phase::Persisting);
        let seq = pipeline
            .log
            .append(&batch)
            .map_err(|err| self.fail(DispatchError::Persistence(err)))?;
        debug!(seq, patches = batch.len(), "batch persisted");

        self.set_phase(Phase::Broadcasting);
        let peers = self.broadcast(&batch);
        if let Err(source) = pipeline.engine.flush(&batch) {
            error!(seq, error = %source, "state corruption while applying batch");
            return Err(DispatchError::StateCorruption { seq, source });
        }
        debug!(seq, peers, "batch applied");

        if let Some(every) = self.inner.collapse_every {
            if pipeline.log.pending() >= every {
                self.collapse_locked(pipeline)?;
            }
        }

        Ok(DispatchOutcome {
            seq: Some(seq),
            patches: batch.len(),
            peers,
        })
    }

    fn broadcast(&self, batch: &Batch) -> usize {
        let peers = self.peers();
        let routed = peers.registry.route(batch);
        let mut delivered = 0;
        for (peer, patches) in routed {
            let Some(outbox) = peers.outboxes.get(&peer) else {
                continue;
            };
            if outbox.send(Emit { patches }).is_ok() {
                delivered += 1;
            } else {
                debug!(peer = %peer, "peer outbox closed; skipping");
            }
        }
        delivered
    }

    fn collapse_locked(&self, pipeline: &mut Pipeline) -> Result<(), DispatchError> {
        let snapshot = pipeline
            .engine
            .snapshot()
            .map_err(|e| self.fail(e.into()))?;
        pipeline
            .log
            .collapse(&snapshot)
            .map_err(|err| self.fail(DispatchError::Persistence(err)))
    }

    /// Collapses the log to a snapshot of the committed tree.
    ///
    /// # Errors
    /// [`DispatchError::Persistence`] (fatal) if the store rejects the
    /// rewrite; [`DispatchError::Failed`] after an earlier fatal error.
    #[instrument(skip(self))]
    pub async fn collapse(&self) -> Result<(), DispatchError> {
        let mut pipeline = self.inner.pipeline.lock().await;
        self.ensure_running()?;
        self.collapse_locked(&mut pipeline)
    }

    /// Sequence number the next logged batch will receive.
    pub async fn next_seq(&self) -> u64 {
        self.inner.pipeline.lock().await.log.next_seq()
    }
}
