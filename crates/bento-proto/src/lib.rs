// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session wire schema for the Bento hub.
//!
//! Peers announce their subscription scopes with [`Message::Init`], invoke
//! actions with [`Message::Action`], and receive patch batches as
//! [`Message::Emit`]. Frames are CBOR [`OpEnvelope`]s inside checksummed
//! packets (see [`wire`]).
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

use std::path::PathBuf;

use bento_core::{Patch, Path, Value};
use serde::{Deserialize, Serialize};

pub mod wire;

pub use wire::{decode_message, encode_message, packet_len, Packet, WireError};

/// Default Unix socket path for the hub.
///
/// Prefers a per-user runtime dir (`XDG_RUNTIME_DIR`) and falls back to `/tmp`
/// when unavailable.
pub fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    base.join("bento-hub.sock")
}

/// CBOR envelope carried as the payload of a packet.
///
/// * `op` – operation name (`init`, `action`, `emit`, `error`).
/// * `ts` – logical timestamp, authoritative on the hub side.
/// * `payload` – operation specific body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// Operation name.
    pub op: String,
    /// Logical timestamp (monotonic per hub).
    pub ts: u64,
    /// Operation-specific body.
    pub payload: P,
}

/// Body of an `init` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InitPayload {
    /// Paths the peer wants to observe. Empty means the whole tree.
    #[serde(default)]
    pub scopes: Vec<Path>,
}

/// Body of an `action` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionPayload {
    /// Registered action name.
    pub name: String,
    /// Action argument.
    #[serde(default)]
    pub payload: Value,
}

/// Body of an `emit` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmitPayload {
    /// Patches in application order.
    pub patches: Vec<Patch>,
}

/// Error payload sent to the peer whose request failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Numeric error code.
    pub code: u32,
    /// Stable identifier (e.g. `E_UNKNOWN_ACTION`).
    pub name: String,
    /// Human readable message.
    pub message: String,
}

impl ErrorPayload {
    /// The named action is not registered.
    pub const UNKNOWN_ACTION: (u32, &'static str) = (1, "E_UNKNOWN_ACTION");
    /// The action body failed; nothing was applied.
    pub const ACTION_FAILED: (u32, &'static str) = (2, "E_ACTION_FAILED");
    /// The peer sent a frame the hub could not decode or does not accept.
    pub const BAD_REQUEST: (u32, &'static str) = (3, "E_BAD_REQUEST");
    /// The hub pipeline has failed and no longer accepts actions.
    pub const UNAVAILABLE: (u32, &'static str) = (500, "E_UNAVAILABLE");

    /// Build a payload from one of the associated `(code, name)` pairs.
    pub fn new((code, name): (u32, &str), message: impl Into<String>) -> Self {
        Self {
            code,
            name: name.to_owned(),
            message: message.into(),
        }
    }
}

/// Messages exchanged between peers and the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Peer → hub: register (or re-register) subscription scopes.
    Init {
        /// Scopes to observe; empty means the root.
        scopes: Vec<Path>,
    },
    /// Peer → hub: invoke a registered action.
    Action {
        /// Action name.
        name: String,
        /// Action argument.
        payload: Value,
    },
    /// Hub → peer: patches the peer is subscribed to.
    Emit {
        /// Patches in application order.
        patches: Vec<Patch>,
    },
    /// Hub → peer: a request from this peer failed.
    Error(ErrorPayload),
}

impl Message {
    /// Operation name used in the envelope.
    pub fn op(&self) -> &'static str {
        match self {
            Message::Init { .. } => "init",
            Message::Action { .. } => "action",
            Message::Emit { .. } => "emit",
            Message::Error(_) => "error",
        }
    }
}
