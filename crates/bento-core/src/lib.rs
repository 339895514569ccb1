// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! bento-core: the state tree, path-addressed patches, and the transactional
//! state engine.
//!
//! Every mutation of the authoritative tree is captured as an ordered list of
//! [`Patch`]es (a [`Batch`]) by running an action body against a [`Draft`].
//! The committed tree only moves when a batch is flushed into the
//! [`StateEngine`], which lets the caller persist and broadcast the batch
//! first.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::redundant_pub_crate,
    clippy::use_self
)]

mod draft;
mod engine;
mod merge;
mod patch;
mod path;
mod replica;
mod tx;
mod value;

pub use draft::{Draft, DraftError};
pub use engine::{apply_patch, EngineError, StateEngine, TransactError};
pub use merge::merge_defaults;
pub use patch::{Batch, Patch};
pub use path::{Path, Segment};
pub use replica::Replica;
pub use tx::TxId;
pub use value::{Map, Value};
