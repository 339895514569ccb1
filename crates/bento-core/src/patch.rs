// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Path-addressed patches and batches.
//!
//! A [`Patch`] either sets the node at its path (`value: Some`) or deletes it
//! (`value: None`). A patch at the root path with a value replaces the whole
//! tree. A [`Batch`] is the ordered patch list produced by one action
//! invocation and is the unit of persistence and broadcast.

use serde::{Deserialize, Deserializer, Serialize};

use crate::path::Path;
use crate::value::Value;

/// Single path-addressed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Location written.
    pub path: Path,
    /// New value, or `None` for deletion. An explicit `null` on the wire is
    /// `Some(Value::Null)`; only an absent field means deletion.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub value: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Patch {
    /// Patch setting `path` to `value`.
    pub fn set(path: impl Into<Path>, value: impl Into<Value>) -> Self {
        Patch {
            path: path.into(),
            value: Some(value.into()),
        }
    }

    /// Patch deleting `path`.
    pub fn delete(path: impl Into<Path>) -> Self {
        Patch {
            path: path.into(),
            value: None,
        }
    }

    /// Full-tree replacement.
    pub fn replace_root(value: Value) -> Self {
        Patch {
            path: Path::root(),
            value: Some(value),
        }
    }

    /// Returns `true` if this patch deletes its path.
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// Ordered patches produced by exactly one action invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    patches: Vec<Patch>,
}

impl Batch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot batch: a single root replacement carrying `value`.
    pub fn snapshot(value: Value) -> Self {
        Batch {
            patches: vec![Patch::replace_root(value)],
        }
    }

    /// Appends a patch.
    pub fn push(&mut self, patch: Patch) {
        self.patches.push(patch);
    }

    /// Patches in application order.
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Consumes the batch, returning its patches.
    pub fn into_patches(self) -> Vec<Patch> {
        self.patches
    }

    /// Number of patches.
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Returns `true` if the batch carries no patches.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Iterator over patches in application order.
    pub fn iter(&self) -> std::slice::Iter<'_, Patch> {
        self.patches.iter()
    }
}

impl From<Vec<Patch>> for Batch {
    fn from(patches: Vec<Patch>) -> Self {
        Batch { patches }
    }
}

impl FromIterator<Patch> for Batch {
    fn from_iter<I: IntoIterator<Item = Patch>>(iter: I) -> Self {
        Batch {
            patches: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Batch {
    type Item = Patch;
    type IntoIter = std::vec::IntoIter<Patch>;

    fn into_iter(self) -> Self::IntoIter {
        self.patches.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Patch;
    type IntoIter = std::slice::Iter<'a, Patch>;

    fn into_iter(self) -> Self::IntoIter {
        self.patches.iter()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn explicit_null_is_not_a_delete() {
        let set_null: Patch = serde_json::from_str(r#"{"path":["a"],"value":null}"#).unwrap();
        assert_eq!(set_null, Patch::set(["a"], Value::Null));

        let delete: Patch = serde_json::from_str(r#"{"path":["a"]}"#).unwrap();
        assert!(delete.is_delete());
        assert_eq!(serde_json::to_string(&delete).unwrap(), r#"{"path":["a"]}"#);
    }
}
