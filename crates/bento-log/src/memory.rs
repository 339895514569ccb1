// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-process [`OrderedStore`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::store::{OrderedStore, StoreError, StoreKey, WriteOp};

/// Materialized store contents, shared by the in-memory and file stores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Entries {
    seq: BTreeMap<u64, Vec<u8>>,
    meta: Option<Vec<u8>>,
}

impl Entries {
    pub(crate) fn apply(&mut self, ops: Vec<WriteOp>) {
        for op in ops {
            match op {
                WriteOp::Put(StoreKey::Seq(n), blob) => {
                    self.seq.insert(n, blob.0);
                }
                WriteOp::Put(StoreKey::Meta, blob) => self.meta = Some(blob.0),
                WriteOp::Clear => {
                    self.seq.clear();
                    self.meta = None;
                }
            }
        }
    }

    pub(crate) fn get(&self, key: StoreKey) -> Option<Vec<u8>> {
        match key {
            StoreKey::Seq(n) => self.seq.get(&n).cloned(),
            StoreKey::Meta => self.meta.clone(),
        }
    }

    pub(crate) fn range_from(&self, start: u64) -> Vec<(u64, Vec<u8>)> {
        self.seq
            .range(start..)
            .map(|(n, bytes)| (*n, bytes.clone()))
            .collect()
    }

    pub(crate) fn last_seq(&self) -> Option<u64> {
        self.seq.keys().next_back().copied()
    }

    /// Puts that rebuild these contents from nothing.
    pub(crate) fn image(&self) -> Vec<WriteOp> {
        self.meta
            .iter()
            .map(|bytes| WriteOp::put(StoreKey::Meta, bytes.clone()))
            .chain(
                self.seq
                    .iter()
                    .map(|(n, bytes)| WriteOp::put(StoreKey::Seq(*n), bytes.clone())),
            )
            .collect()
    }
}

/// Store kept entirely in memory. Clones share the same contents, so a clone
/// can stand in for "reopening" the store after a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Entries>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl OrderedStore for MemoryStore {
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.get(key))
    }

    fn range_from(&self, start: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        Ok(self.lock()?.range_from(start))
    }

    fn last_seq(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.lock()?.last_seq())
    }

    fn commit(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.lock()?.apply(ops);
        Ok(())
    }
}
