// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! bento-log: durable, append-only storage for patch batches.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod file;
mod memory;
mod patch_log;
mod store;

pub use file::{FileStore, MAGIC, VERSION};
pub use memory::MemoryStore;
pub use patch_log::{LogError, LogRecord, PatchLog};
pub use store::{Blob, OrderedStore, StoreError, StoreKey, StoreMeta, WriteOp};
