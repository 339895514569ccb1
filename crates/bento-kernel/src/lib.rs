// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! bento-kernel: the action pipeline.
//!
//! Ties a [`bento_core::StateEngine`], a [`bento_log::PatchLog`] and a
//! [`SubscriptionRegistry`] together behind the [`Dispatcher`], which runs one
//! action at a time: handler, transaction, durable append, routing to peers,
//! flush into the live tree.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod action;
mod dispatcher;
mod error;
mod registry;

pub use action::{mutation, ActionError, ActionFuture, ActionRegistry, Mutation};
pub use dispatcher::{DispatchOutcome, Dispatcher, Emit, KernelConfig, PeerHandle, Phase};
pub use error::DispatchError;
pub use registry::{PeerId, SubscriptionRegistry};
