// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bento_core::{Batch, Patch, Path, Value};
use bento_kernel::{
    mutation, ActionError, ActionRegistry, DispatchError, Dispatcher, Emit, KernelConfig, Phase,
};
use bento_log::{MemoryStore, OrderedStore, PatchLog, StoreError, StoreKey, WriteOp};
use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::watch;
use tokio::time::timeout;

fn counter_actions() -> ActionRegistry {
    let mut actions = ActionRegistry::new();
    actions
        .register("increment", |d, _payload| {
            let next = d.get(["count"]).and_then(|v| v.as_f64()).unwrap_or_default() + 1.0;
            d.set(["count"], next)?;
            Ok(())
        })
        .register("boom", |d, _payload| {
            d.set(["count"], 999)?;
            Err(ActionError::failed("boom"))
        })
        .register("noop", |_d, _payload| Ok(()))
        .register("rotate", |d, _payload| {
            d.shift(["scores"])?;
            d.push(["scores"], 4)?;
            Ok(())
        });
    actions
}

fn start(store: MemoryStore, defaults: serde_json::Value) -> Dispatcher {
    let config = KernelConfig::new(Value::from(defaults)).with_actions(counter_actions());
    Dispatcher::start(config, PatchLog::open(store).unwrap()).unwrap()
}

async fn next_emit(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Emit>) -> Emit {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .ok()
        .flatten()
        .expect("emit")
}

#[tokio::test]
async fn counter_scenario() {
    let store = MemoryStore::new();
    let hub = start(store.clone(), json!({"count": 0}));
    let mut peer = hub.connect(vec![Path::from(["count"])]).await.unwrap();

    let initial = next_emit(&mut peer.emits).await;
    assert_eq!(initial.patches, vec![Patch::set(["count"], 0)]);

    for expected in 1..=2 {
        let outcome = hub.dispatch("increment", Value::Null).await.unwrap();
        assert_eq!(outcome.seq, Some(expected));
        assert_eq!(outcome.peers, 1);
        let emit = next_emit(&mut peer.emits).await;
        assert_eq!(emit.patches, vec![Patch::set(["count"], i32::try_from(expected).unwrap())]);
    }

    assert_eq!(*hub.snapshot().await.unwrap(), Value::from(json!({"count": 2})));
    let seqs: Vec<u64> = store.range_from(0).unwrap().into_iter().map(|(s, _)| s).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert_eq!(hub.phase(), Phase::Idle);
}

#[tokio::test]
async fn throwing_action_changes_nothing() {
    let store = MemoryStore::new();
    let hub = start(store.clone(), json!({"count": 0}));
    let mut peer = hub.connect(Vec::new()).await.unwrap();
    let _initial = next_emit(&mut peer.emits).await;

    let err = hub.dispatch("boom", Value::Null).await.unwrap_err();
    assert!(matches!(err, DispatchError::Transaction { ref action, .. } if action == "boom"));
    assert!(!err.is_fatal());

    assert_eq!(*hub.snapshot().await.unwrap(), Value::from(json!({"count": 0})));
    assert_eq!(peer.emits.try_recv().unwrap_err(), TryRecvError::Empty);
    assert_eq!(store.last_seq().unwrap(), Some(0));
    assert_eq!(hub.phase(), Phase::Idle);
}

#[tokio::test]
async fn unknown_action_is_reported_and_ignored() {
    let store = MemoryStore::new();
    let hub = start(store.clone(), json!({"count": 0}));
    let err = hub.dispatch("nope", json!({"x": 1}).into()).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownAction(ref name) if name == "nope"));
    assert_eq!(store.last_seq().unwrap(), Some(0));
    assert_eq!(hub.next_seq().await, 1);
}

#[tokio::test]
async fn empty_batches_are_not_logged_or_sent() {
    let store = MemoryStore::new();
    let hub = start(store.clone(), json!({"count": 0}));
    let mut peer = hub.connect(Vec::new()).await.unwrap();
    let _initial = next_emit(&mut peer.emits).await;

    let outcome = hub.dispatch("noop", Value::Null).await.unwrap();
    assert_eq!(outcome.seq, None);
    assert_eq!(peer.emits.try_recv().unwrap_err(), TryRecvError::Empty);
    assert_eq!(store.last_seq().unwrap(), Some(0));
}

#[tokio::test]
async fn sequence_scenario_emits_one_whole_sequence_patch() {
    let hub = start(MemoryStore::new(), json!({"scores": [1, 2, 3]}));
    let mut peer = hub.connect(vec![Path::from(["scores"])]).await.unwrap();
    let _initial = next_emit(&mut peer.emits).await;

    hub.dispatch("rotate", Value::Null).await.unwrap();
    let emit = next_emit(&mut peer.emits).await;
    assert!(emit.patches.iter().all(|p| p.path == Path::from(["scores"])));
    assert_eq!(
        emit.patches.last(),
        Some(&Patch::set(["scores"], Value::from(json!([2, 3, 4]))))
    );
}

#[tokio::test]
async fn routing_respects_scopes() {
    let hub = start(MemoryStore::new(), json!({"count": 0, "timer": {"left": 5}}));
    let mut counting = hub.connect(vec![Path::from(["count"])]).await.unwrap();
    let mut timing = hub.connect(vec![Path::from(["timer", "left"])]).await.unwrap();
    let mut everything = hub.connect(Vec::new()).await.unwrap();

    assert_eq!(
        next_emit(&mut timing.emits).await.patches,
        vec![Patch::set(["timer", "left"], 5)]
    );
    assert_eq!(
        next_emit(&mut everything.emits).await.patches,
        vec![Patch::replace_root(Value::from(json!({"count": 0, "timer": {"left": 5}})))]
    );
    let _ = next_emit(&mut counting.emits).await;

    let outcome = hub.dispatch("increment", Value::Null).await.unwrap();
    assert_eq!(outcome.peers, 2);
    assert_eq!(next_emit(&mut counting.emits).await.patches.len(), 1);
    assert_eq!(next_emit(&mut everything.emits).await.patches.len(), 1);
    assert_eq!(timing.emits.try_recv().unwrap_err(), TryRecvError::Empty);

    assert!(hub.disconnect(counting.id));
    assert!(!hub.disconnect(counting.id));
    let outcome = hub.dispatch("increment", Value::Null).await.unwrap();
    assert_eq!(outcome.peers, 1);
    assert_eq!(hub.peer_count(), 2);
}

#[tokio::test]
async fn restart_replays_log_and_merges_new_defaults() {
    let store = MemoryStore::new();
    {
        let hub = start(store.clone(), json!({"count": 0}));
        for _ in 0..3 {
            hub.dispatch("increment", Value::Null).await.unwrap();
        }
    }

    let hub = start(store.clone(), json!({"count": 0, "title": "bento"}));
    assert_eq!(
        *hub.snapshot().await.unwrap(),
        Value::from(json!({"count": 3, "title": "bento"}))
    );
    // snapshot at 0 plus the defaults batch
    let seqs: Vec<u64> = store.range_from(0).unwrap().into_iter().map(|(s, _)| s).collect();
    assert_eq!(seqs, vec![0, 1]);

    drop(hub);
    let again = start(store.clone(), json!({"count": 0, "title": "bento"}));
    assert_eq!(
        *again.snapshot().await.unwrap(),
        Value::from(json!({"count": 3, "title": "bento"}))
    );
    assert_eq!(again.next_seq().await, 1);
}

#[tokio::test]
async fn periodic_collapse_keeps_state() {
    let store = MemoryStore::new();
    let config = KernelConfig::new(Value::from(json!({"count": 0})))
        .with_actions(counter_actions())
        .collapse_every(2);
    let hub = Dispatcher::start(config, PatchLog::open(store.clone()).unwrap()).unwrap();
    for _ in 0..5 {
        hub.dispatch("increment", Value::Null).await.unwrap();
    }
    // collapsed after records 2 and 4, leaving the snapshot plus record 1
    assert_eq!(store.last_seq().unwrap(), Some(1));
    drop(hub);

    let hub = start(store, json!({"count": 0}));
    assert_eq!(*hub.snapshot().await.unwrap(), Value::from(json!({"count": 5})));
}

#[derive(Clone, Default)]
struct FlakyStore {
    inner: MemoryStore,
    broken: Arc<AtomicBool>,
}

impl OrderedStore for FlakyStore {
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn range_from(&self, start: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.inner.range_from(start)
    }

    fn last_seq(&self) -> Result<Option<u64>, StoreError> {
        self.inner.last_seq()
    }

    fn commit(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk on fire".into()));
        }
        self.inner.commit(ops)
    }
}

#[tokio::test]
async fn persistence_failure_stops_the_pipeline() {
    let store = FlakyStore::default();
    let config = KernelConfig::new(Value::from(json!({"count": 0}))).with_actions(counter_actions());
    let hub = Dispatcher::start(config, PatchLog::open(store.clone()).unwrap()).unwrap();
    let mut peer = hub.connect(Vec::new()).await.unwrap();
    let _initial = next_emit(&mut peer.emits).await;

    store.broken.store(true, Ordering::SeqCst);
    let err = hub.dispatch("increment", Value::Null).await.unwrap_err();
    assert!(matches!(err, DispatchError::Persistence(_)));
    assert!(err.is_fatal());
    assert_eq!(hub.phase(), Phase::Failed);
    assert_eq!(peer.emits.try_recv().unwrap_err(), TryRecvError::Empty);

    store.broken.store(false, Ordering::SeqCst);
    assert!(matches!(
        hub.dispatch("increment", Value::Null).await,
        Err(DispatchError::Failed)
    ));
    assert!(matches!(hub.snapshot().await, Err(DispatchError::Failed)));
}

fn encode_batch(patches: Vec<Patch>) -> Vec<u8> {
    let mut out = Vec::new();
    ciborium::into_writer(&Batch::from(patches), &mut out).unwrap();
    out
}

#[tokio::test]
async fn corrupt_log_fails_startup() {
    let mut store = MemoryStore::new();
    drop(PatchLog::open(store.clone()).unwrap());
    store
        .commit(vec![
            WriteOp::put(
                StoreKey::Seq(0),
                encode_batch(vec![Patch::replace_root(Value::from(json!({"n": 1})))]),
            ),
            WriteOp::put(StoreKey::Seq(1), encode_batch(vec![Patch::set(["n", "deep"], 1)])),
        ])
        .unwrap();

    let err = Dispatcher::start(KernelConfig::new(Value::mapping()), PatchLog::open(store).unwrap())
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::ReplayInconsistency { seq: Some(1), .. }
    ));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn log_gap_fails_startup() {
    let mut store = MemoryStore::new();
    drop(PatchLog::open(store.clone()).unwrap());
    store
        .commit(vec![
            WriteOp::put(StoreKey::Seq(0), encode_batch(vec![Patch::replace_root(Value::mapping())])),
            WriteOp::put(StoreKey::Seq(2), encode_batch(vec![Patch::set(["a"], 1)])),
        ])
        .unwrap();

    let err = Dispatcher::start(KernelConfig::new(Value::mapping()), PatchLog::open(store).unwrap())
        .unwrap_err();
    assert!(matches!(err, DispatchError::ReplayInconsistency { seq: None, .. }));
}

#[tokio::test]
async fn async_handlers_are_serialized_across_their_await() {
    let mut actions = ActionRegistry::new();
    actions.register_async("slow_increment", |state, _payload| async move {
        let seen = state
            .at(&Path::from(["count"]))
            .and_then(Value::as_f64)
            .unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(mutation(move |d| {
            d.set(["count"], seen + 1.0)?;
            Ok(())
        }))
    });
    let config = KernelConfig::new(Value::from(json!({"count": 0}))).with_actions(actions);
    let hub = Dispatcher::start(config, PatchLog::open(MemoryStore::new()).unwrap()).unwrap();
    let mut peer = hub.connect(vec![Path::from(["count"])]).await.unwrap();
    let _initial = next_emit(&mut peer.emits).await;

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let hub = hub.clone();
            tokio::spawn(async move { hub.dispatch("slow_increment", Value::Null).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(*hub.snapshot().await.unwrap(), Value::from(json!({"count": 5})));
    for expected in 1..=5 {
        let emit = next_emit(&mut peer.emits).await;
        assert_eq!(emit.patches, vec![Patch::set(["count"], expected)]);
    }
}

#[tokio::test]
#[allow(clippy::panic)]
async fn panicking_handlers_leave_the_pipeline_usable() {
    let mut actions = counter_actions();
    actions
        .register("explode", |d, _payload| {
            d.set(["count"], 41)?;
            panic!("handler bug");
        })
        .register_async("explode_later", |_state, payload| async move {
            tokio::task::yield_now().await;
            if payload.is_null() {
                panic!("no payload");
            }
            Ok(mutation(|_d| Ok(())))
        });
    let store = MemoryStore::new();
    let config = KernelConfig::new(Value::from(json!({"count": 0}))).with_actions(actions);
    let hub = Dispatcher::start(config, PatchLog::open(store.clone()).unwrap()).unwrap();

    for name in ["explode", "explode_later"] {
        let err = hub.dispatch(name, Value::Null).await.unwrap_err();
        assert!(
            matches!(
                &err,
                DispatchError::Transaction { action, source: ActionError::Panicked(_) } if action == name
            ),
            "{name}: {err}"
        );
        assert!(!err.is_fatal());
        assert_eq!(hub.phase(), Phase::Idle);
    }

    let mut peer = hub.connect(vec![Path::from(["count"])]).await.unwrap();
    assert_eq!(next_emit(&mut peer.emits).await.patches, vec![Patch::set(["count"], 0)]);
    let outcome = hub.dispatch("increment", Value::Null).await.unwrap();
    assert_eq!(outcome.seq, Some(1));
    assert_eq!(next_emit(&mut peer.emits).await.patches, vec![Patch::set(["count"], 1)]);
    let seqs: Vec<u64> = store.range_from(0).unwrap().into_iter().map(|(s, _)| s).collect();
    assert_eq!(seqs, vec![0, 1]);
}

#[tokio::test]
async fn dropped_dispatch_returns_the_phase_to_idle() {
    let mut actions = counter_actions();
    actions.register_async("stall", |_state, _payload| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(mutation(|d| {
            d.set(["count"], 100)?;
            Ok(())
        }))
    });
    let config = KernelConfig::new(Value::from(json!({"count": 0}))).with_actions(actions);
    let hub = Dispatcher::start(config, PatchLog::open(MemoryStore::new()).unwrap()).unwrap();

    assert!(timeout(Duration::from_millis(20), hub.dispatch("stall", Value::Null))
        .await
        .is_err());
    assert_eq!(hub.phase(), Phase::Idle);

    let outcome = hub.dispatch("increment", Value::Null).await.unwrap();
    assert_eq!(outcome.seq, Some(1));
    assert_eq!(*hub.snapshot().await.unwrap(), Value::from(json!({"count": 1})));
}

#[tokio::test]
async fn collapse_on_demand_rewrites_the_log() {
    let store = MemoryStore::new();
    let hub = start(store.clone(), json!({"count": 0}));
    for _ in 0..3 {
        hub.dispatch("increment", Value::Null).await.unwrap();
    }
    assert_eq!(hub.next_seq().await, 4);

    hub.collapse().await.unwrap();
    let seqs: Vec<u64> = store.range_from(0).unwrap().into_iter().map(|(s, _)| s).collect();
    assert_eq!(seqs, vec![0]);
    assert_eq!(hub.next_seq().await, 1);
    assert_eq!(hub.phase(), Phase::Idle);

    let outcome = hub.dispatch("increment", Value::Null).await.unwrap();
    assert_eq!(outcome.seq, Some(1));
    drop(hub);

    let again = start(store, json!({"count": 0}));
    assert_eq!(*again.snapshot().await.unwrap(), Value::from(json!({"count": 4})));
}

/// Samples the dispatcher's phase from inside the pipeline.
#[derive(Clone, Default)]
struct PhaseTrace {
    rx: Arc<OnceLock<watch::Receiver<Phase>>>,
    seen: Arc<Mutex<Vec<Phase>>>,
}

impl PhaseTrace {
    fn record(&self) {
        if let Some(rx) = self.rx.get() {
            self.seen.lock().unwrap().push(*rx.borrow());
        }
    }
}

struct TracingStore {
    inner: MemoryStore,
    trace: PhaseTrace,
}

impl OrderedStore for TracingStore {
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn range_from(&self, start: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.inner.range_from(start)
    }

    fn last_seq(&self) -> Result<Option<u64>, StoreError> {
        self.inner.last_seq()
    }

    fn commit(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.trace.record();
        self.inner.commit(ops)
    }
}

#[tokio::test]
async fn watch_phase_follows_the_pipeline() {
    let trace = PhaseTrace::default();
    let mut actions = ActionRegistry::new();
    let in_handler = trace.clone();
    actions.register_async("traced", move |_state, _payload| {
        let trace = in_handler.clone();
        async move {
            trace.record();
            Ok(mutation(move |d| {
                trace.record();
                d.set(["count"], 1)?;
                Ok(())
            }))
        }
    });
    let store = TracingStore {
        inner: MemoryStore::new(),
        trace: trace.clone(),
    };
    // collapse after every record so the broadcasting stage also commits
    let config = KernelConfig::new(Value::from(json!({"count": 0})))
        .with_actions(actions)
        .collapse_every(1);
    let hub = Dispatcher::start(config, PatchLog::open(store).unwrap()).unwrap();

    let mut rx = hub.watch_phase();
    assert_eq!(*rx.borrow_and_update(), Phase::Idle);
    assert!(trace.rx.set(hub.watch_phase()).is_ok());

    hub.dispatch("traced", Value::Null).await.unwrap();

    let mut seen = trace.seen.lock().unwrap().clone();
    seen.dedup();
    assert_eq!(
        seen,
        vec![Phase::Dispatching, Phase::Applying, Phase::Persisting, Phase::Broadcasting]
    );
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), Phase::Idle);
}
