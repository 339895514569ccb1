// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sequence-numbered batch log over an [`OrderedStore`].
//!
//! Record `0` of a generation is always a snapshot batch (a single root
//! replacement); records `1..` are incremental batches in commit order.
//! Replaying every record from `0` rebuilds the tree. [`PatchLog::collapse`]
//! starts a new generation from a snapshot.

use bento_core::{Batch, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{OrderedStore, StoreError, StoreKey, StoreMeta, WriteOp};

/// One stored batch and its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Position in the current generation; `0` is the snapshot.
    pub seq: u64,
    /// Patches recorded at `seq`.
    pub batch: Batch,
}

/// Errors surfaced by [`PatchLog`].
#[derive(Debug, Error)]
pub enum LogError {
    /// The store rejected a read or write.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A record could not be encoded or decoded.
    #[error("record {seq}: {reason}")]
    Codec {
        /// Sequence number of the record.
        seq: u64,
        /// Codec failure description.
        reason: String,
    },
    /// The store's metadata entry is unreadable or describes another format.
    #[error("unsupported log format: {0}")]
    Format(String),
    /// Incremental records need a snapshot at `0` first.
    #[error("cannot append before a snapshot has been written")]
    MissingBase,
    /// Replay found a hole in the sequence.
    #[error("sequence gap: expected record {expected}, found {got}")]
    Gap {
        /// Next sequence number that should have been present.
        expected: u64,
        /// Sequence number actually found.
        got: u64,
    },
}

/// Append-only batch log with snapshot collapse.
pub struct PatchLog {
    store: Box<dyn OrderedStore>,
    next_seq: u64,
}

impl std::fmt::Debug for PatchLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchLog")
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(seq: u64, value: &T) -> Result<Vec<u8>, LogError> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| LogError::Codec {
        seq,
        reason: e.to_string(),
    })?;
    Ok(out)
}

fn decode<T: for<'de> Deserialize<'de>>(seq: u64, bytes: &[u8]) -> Result<T, LogError> {
    ciborium::from_reader(bytes).map_err(|e| LogError::Codec {
        seq,
        reason: e.to_string(),
    })
}

impl PatchLog {
    /// Opens a log over `store`, writing the metadata entry on first use.
    ///
    /// # Errors
    /// [`LogError::Format`] if the store belongs to another format or
    /// version; [`LogError::Store`] on storage failure.
    pub fn open(store: impl OrderedStore + 'static) -> Result<Self, LogError> {
        let mut store: Box<dyn OrderedStore> = Box::new(store);
        match store.get(StoreKey::Meta)? {
            Some(bytes) => {
                let meta: StoreMeta = ciborium::from_reader(bytes.as_slice())
                    .map_err(|e| LogError::Format(format!("unreadable metadata: {e}")))?;
                if !meta.is_compatible() {
                    return Err(LogError::Format(format!("{} v{}", meta.format, meta.version)));
                }
            }
            None => {
                let mut bytes = Vec::new();
                ciborium::into_writer(&StoreMeta::current(), &mut bytes)
                    .map_err(|e| LogError::Format(e.to_string()))?;
                store.commit(vec![WriteOp::put(StoreKey::Meta, bytes)])?;
                debug!("initialized patch log metadata");
            }
        }
        let next_seq = store.last_seq()?.map_or(0, |last| last + 1);
        Ok(Self { store, next_seq })
    }

    /// Sequence number the next append will receive (`0` when empty).
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Returns `true` if no record has been written in this generation.
    pub fn is_empty(&self) -> bool {
        self.next_seq == 0
    }

    /// Incremental records written since the last snapshot.
    pub fn pending(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Durably appends `batch` and returns its sequence number.
    ///
    /// # Errors
    /// [`LogError::MissingBase`] on an empty log; [`LogError::Store`] if the
    /// write was rejected (nothing was recorded).
    pub fn append(&mut self, batch: &Batch) -> Result<u64, LogError> {
        if self.next_seq == 0 {
            return Err(LogError::MissingBase);
        }
        let seq = self.next_seq;
        let bytes = encode(seq, batch)?;
        self.store.commit(vec![WriteOp::put(StoreKey::Seq(seq), bytes)])?;
        self.next_seq += 1;
        debug!(seq, patches = batch.len(), "appended batch");
        Ok(seq)
    }

    /// Every record of the current generation, ascending from `0`.
    ///
    /// # Errors
    /// [`LogError::Gap`] if a sequence number is missing;
    /// [`LogError::Codec`] for an undecodable record.
    pub fn replay(&self) -> Result<Vec<LogRecord>, LogError> {
        let mut records = Vec::new();
        for (expected, (seq, bytes)) in (0u64..).zip(self.store.range_from(0)?) {
            if seq != expected {
                return Err(LogError::Gap { expected, got: seq });
            }
            records.push(LogRecord {
                seq,
                batch: decode(seq, &bytes)?,
            });
        }
        Ok(records)
    }

    /// Replaces the whole log with a single snapshot record carrying
    /// `snapshot`, keeping the metadata entry byte-for-byte.
    ///
    /// # Errors
    /// [`LogError::Store`] if the commit was rejected; the previous
    /// generation is then still intact.
    pub fn collapse(&mut self, snapshot: &Value) -> Result<(), LogError> {
        let meta = self.store.get(StoreKey::Meta)?;
        let bytes = encode(0, &Batch::snapshot(snapshot.clone()))?;

        let mut ops = vec![WriteOp::Clear];
        if let Some(meta) = meta {
            ops.push(WriteOp::put(StoreKey::Meta, meta));
        }
        ops.push(WriteOp::put(StoreKey::Seq(0), bytes));
        self.store.commit(ops)?;

        let dropped = self.next_seq;
        self.next_seq = 1;
        info!(dropped, "collapsed patch log to snapshot");
        Ok(())
    }
}
