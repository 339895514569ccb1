// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Peer subscriptions and batch routing.
//!
//! A scope sees a patch when the two paths agree on every segment present in
//! both: patches below the scope change part of what the peer watches, and
//! patches above it replace the whole of it.

use std::collections::BTreeMap;
use std::fmt;

use bento_core::{Batch, Patch, Path, Value};

/// Opaque handle of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Constructs a `PeerId` from a raw value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Underlying raw value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Peer → scopes table.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    peers: BTreeMap<PeerId, Vec<Path>>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) `peer`. No scopes means the whole tree.
    /// Duplicate scopes are dropped.
    pub fn register(&mut self, peer: PeerId, scopes: Vec<Path>) {
        let mut unique: Vec<Path> = Vec::with_capacity(scopes.len().max(1));
        for scope in scopes {
            if !unique.contains(&scope) {
                unique.push(scope);
            }
        }
        if unique.is_empty() {
            unique.push(Path::root());
        }
        self.peers.insert(peer, unique);
    }

    /// Removes `peer`; returns whether it was registered.
    pub fn unregister(&mut self, peer: PeerId) -> bool {
        self.peers.remove(&peer).is_some()
    }

    /// Scopes of `peer`.
    pub fn scopes(&self, peer: PeerId) -> Option<&[Path]> {
        self.peers.get(&peer).map(Vec::as_slice)
    }

    /// Returns `true` if `peer` is registered.
    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns `true` if no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Registered peers in ascending id order.
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    /// Patches of `batch` each peer may see, in batch order, each patch at
    /// most once per peer. Peers that see nothing are omitted.
    pub fn route(&self, batch: &Batch) -> BTreeMap<PeerId, Vec<Patch>> {
        self.peers
            .iter()
            .filter_map(|(peer, scopes)| {
                let visible: Vec<Patch> = batch
                    .iter()
                    .filter(|patch| scopes.iter().any(|scope| scope.overlaps(&patch.path)))
                    .cloned()
                    .collect();
                (!visible.is_empty()).then_some((*peer, visible))
            })
            .collect()
    }

    /// One patch per scope of `peer` carrying the value at that scope (a
    /// deletion when nothing is there). Empty for unknown peers.
    pub fn initial_view(&self, peer: PeerId, snapshot: &Value) -> Vec<Patch> {
        self.scopes(peer)
            .unwrap_or_default()
            .iter()
            .map(|scope| Patch {
                path: scope.clone(),
                value: snapshot.at(scope).cloned(),
            })
            .collect()
    }
}
