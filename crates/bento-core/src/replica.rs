// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Peer-side mirror of the subscribed part of the tree.
//!
//! Peers only ever see the patches their scopes admit, so the intermediate
//! containers above a scope may never have been sent. Unlike
//! [`crate::StateEngine::flush`], a replica therefore builds missing
//! containers on the way down instead of rejecting the write. Sequence slots
//! past the end are padded with `null`, up to `MAX_PADDING` slots; a patch
//! that would pad further is dropped.

use crate::patch::Patch;
use crate::path::Segment;
use crate::value::Value;

/// Most `null` slots a single sequence write may pad.
const MAX_PADDING: usize = 4096;

/// Locally held copy of emitted state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replica {
    state: Value,
}

impl Replica {
    /// Replica seeded with `initial`.
    pub fn new(initial: Value) -> Self {
        Self { state: initial }
    }

    /// Current mirrored tree.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Consumes the replica, returning its tree.
    pub fn into_state(self) -> Value {
        self.state
    }

    /// Applies emitted patches in order.
    pub fn apply<'a, I>(&mut self, patches: I)
    where
        I: IntoIterator<Item = &'a Patch>,
    {
        for patch in patches {
            self.apply_patch(patch);
        }
    }

    /// Applies a single patch.
    pub fn apply_patch(&mut self, patch: &Patch) {
        match &patch.value {
            Some(value) => set_in(&mut self.state, patch.path.segments(), value.clone()),
            None => unset_in(&mut self.state, patch.path.segments()),
        }
    }
}

fn set_in(node: &mut Value, segments: &[Segment], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if let Value::Sequence(items) = node {
        if let Some(index) = head.as_index() {
            if index >= items.len() {
                if index - items.len() > MAX_PADDING {
                    return;
                }
                items.resize(index + 1, Value::Null);
            }
            set_in(&mut items[index], rest, value);
            return;
        }
    }
    if !matches!(node, Value::Mapping(_)) {
        *node = Value::mapping();
    }
    if let Value::Mapping(map) = node {
        let child = map.entry(head.as_str().to_owned()).or_default();
        set_in(child, rest, value);
    }
}

fn unset_in(node: &mut Value, segments: &[Segment]) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut node = node;
    for segment in parents {
        match node.get_mut(segment) {
            Some(child) => node = child,
            None => return,
        }
    }
    match node {
        Value::Mapping(map) => {
            map.remove(last.as_str());
        }
        Value::Sequence(items) => {
            if let Some(slot) = last.as_index().and_then(|i| items.get_mut(i)) {
                *slot = Value::Null;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::path::Path;
    use serde_json::json;

    #[test]
    fn scoped_emits_build_missing_parents() {
        let mut replica = Replica::default();
        replica.apply(&[Patch::set(["obs", "scene"], "intro")]);
        assert_eq!(replica.state(), &Value::from(json!({"obs": {"scene": "intro"}})));
    }

    #[test]
    fn root_patch_replaces_and_delete_removes() {
        let mut replica = Replica::new(Value::from(json!({"stale": 1})));
        replica.apply(&[
            Patch::replace_root(Value::from(json!({"a": {"b": 1, "c": 2}}))),
            Patch::delete(["a", "b"]),
            Patch::delete(["zzz", "q"]),
        ]);
        assert_eq!(replica.into_state(), Value::from(json!({"a": {"c": 2}})));
    }

    #[test]
    fn sequence_slots_are_padded() {
        let mut replica = Replica::new(Value::from(json!({"s": [1]})));
        replica.apply(&[Patch::set(["s", "3"], 4)]);
        assert_eq!(replica.state(), &Value::from(json!({"s": [1, null, null, 4]})));
    }

    #[test]
    fn far_out_of_range_slots_are_dropped() {
        let initial = Value::from(json!({"s": [1]}));
        let mut replica = Replica::new(initial.clone());
        let huge = usize::MAX.to_string();
        let beyond = (1 + MAX_PADDING + 1).to_string();
        replica.apply(&[
            Patch::set(["s", huge.as_str()], 4),
            Patch::set(["s", beyond.as_str(), "x"], 5),
        ]);
        assert_eq!(replica.state(), &initial);

        let edge = (1 + MAX_PADDING).to_string();
        replica.apply(&[Patch::set(["s", edge.as_str()], 6)]);
        let Value::Sequence(items) = replica.state().at(&Path::from(["s"])).unwrap() else {
            unreachable!("still a sequence");
        };
        assert_eq!(items.len(), MAX_PADDING + 2);
    }
}
