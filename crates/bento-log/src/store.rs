// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ordered key-value storage port.
//!
//! The log only needs a tiny slice of a real key-value engine: entries keyed
//! by an ascending `u64`, one reserved metadata entry that sorts outside the
//! sequence space, ordered range reads, and atomic multi-operation commits.
//! [`OrderedStore`] is that seam; [`crate::MemoryStore`] and
//! [`crate::FileStore`] implement it.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Key of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreKey {
    /// Sequence-numbered entry.
    Seq(u64),
    /// Reserved metadata entry. Never returned by range reads.
    Meta,
}

/// Opaque stored bytes (serialized as a CBOR byte string).
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Blob(pub Vec<u8>);

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct BlobVisitor;

impl<'de> Visitor<'de> for BlobVisitor {
    type Value = Blob;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte string")
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> Result<Blob, E> {
        Ok(Blob(bytes.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, bytes: Vec<u8>) -> Result<Blob, E> {
        Ok(Blob(bytes))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(BlobVisitor)
    }
}

/// One operation of an atomic commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Insert or overwrite `key`.
    Put(StoreKey, Blob),
    /// Remove every entry, including the metadata entry.
    Clear,
}

impl WriteOp {
    /// Convenience constructor for [`WriteOp::Put`].
    pub fn put(key: StoreKey, bytes: Vec<u8>) -> Self {
        WriteOp::Put(key, Blob(bytes))
    }
}

/// Metadata entry written once per store and carried across collapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Format tag; always [`StoreMeta::FORMAT`].
    pub format: String,
    /// Record encoding version.
    pub version: u32,
}

impl StoreMeta {
    /// Format tag for patch logs.
    pub const FORMAT: &'static str = "bento.patchlog";
    /// Current record encoding version.
    pub const VERSION: u32 = 1;

    /// Metadata describing the current encoding.
    pub fn current() -> Self {
        Self {
            format: Self::FORMAT.to_owned(),
            version: Self::VERSION,
        }
    }

    /// Returns `true` if records described by `self` can be read.
    pub fn is_compatible(&self) -> bool {
        self.format == Self::FORMAT && self.version == Self::VERSION
    }
}

/// Storage-level failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failed.
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes failed integrity checks away from the tail.
    #[error("store corrupt at byte {offset}: {reason}")]
    Corrupt {
        /// Byte offset of the bad frame.
        offset: u64,
        /// What failed.
        reason: String,
    },
    /// A commit could not be encoded.
    #[error("store encode: {0}")]
    Encode(String),
    /// The store refuses writes (e.g. it is read-only or was closed).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Ordered key-value storage used by [`crate::PatchLog`].
pub trait OrderedStore: Send {
    /// Reads one entry.
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Sequence entries with key `>= start`, ascending.
    fn range_from(&self, start: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError>;

    /// Highest sequence key present.
    fn last_seq(&self) -> Result<Option<u64>, StoreError>;

    /// Applies `ops` atomically and durably: either every op is visible after
    /// return, or (on error) none is.
    fn commit(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError>;
}

impl<T: OrderedStore + ?Sized> OrderedStore for Box<T> {
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn range_from(&self, start: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        (**self).range_from(start)
    }

    fn last_seq(&self) -> Result<Option<u64>, StoreError> {
        (**self).last_seq()
    }

    fn commit(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        (**self).commit(ops)
    }
}
