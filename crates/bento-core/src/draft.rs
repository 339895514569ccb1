// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Write-capturing view over the committed tree.
//!
//! A [`Draft`] is handed to an action body for the duration of one
//! transaction. Writes never touch the committed tree; they append [`Patch`]es
//! to the draft's in-flight list. Reads resolve against that list first so the
//! body always observes its own earlier writes:
//!
//! 1. the most recent patch at `P` or at an ancestor of `P` provides the
//!    starting value (otherwise the committed tree does);
//! 2. every later patch strictly below `P` is folded into that value in order.
//!
//! Structural sequence operations (`push`, `shift`, `splice`, ...) record one
//! whole-sequence replacement at the sequence's own path instead of one patch
//! per shifted slot.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::patch::{Batch, Patch};
use crate::path::Path;
use crate::tx::TxId;
use crate::value::Value;

/// Rejected draft write. The draft is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DraftError {
    /// The parent of the written path is a scalar.
    #[error("cannot write {path}: parent is a {kind}, not a container")]
    NotAContainer {
        /// Path that was written.
        path: Path,
        /// Kind of the parent node.
        kind: &'static str,
    },
    /// The parent of the written path does not exist.
    #[error("cannot write {path}: parent does not exist")]
    MissingParent {
        /// Path that was written.
        path: Path,
    },
    /// A sequence slot was addressed with a non-decimal segment.
    #[error("cannot write {path}: last segment is not a sequence index")]
    InvalidIndex {
        /// Path that was written.
        path: Path,
    },
    /// A sequence slot past the end was set (other than `len`) or deleted.
    #[error("cannot write {path}: index out of range for sequence of length {len}")]
    IndexOutOfRange {
        /// Path that was written.
        path: Path,
        /// Current effective length of the sequence.
        len: usize,
    },
    /// The root cannot be deleted, only replaced.
    #[error("cannot delete the root")]
    DeleteRoot,
    /// A sequence operation targeted something that is not a sequence.
    #[error("{path} is {kind}, not a sequence")]
    NotASequence {
        /// Path of the target.
        path: Path,
        /// Kind of the target (`"missing"` when absent).
        kind: &'static str,
    },
}

/// In-flight transaction view handed to action bodies.
#[derive(Debug)]
pub struct Draft {
    tx: TxId,
    base: Arc<Value>,
    patches: Vec<Patch>,
}

impl Draft {
    pub(crate) fn new(tx: TxId, base: Arc<Value>) -> Self {
        Self {
            tx,
            base,
            patches: Vec::new(),
        }
    }

    /// Transaction this draft belongs to.
    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Patches recorded so far, in order.
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Returns `true` once any write has been recorded.
    pub fn is_dirty(&self) -> bool {
        !self.patches.is_empty()
    }

    pub(crate) fn into_batch(self) -> Batch {
        Batch::from(self.patches)
    }

    /// Effective value at `path`, borrowed from the committed tree when no
    /// in-flight patch touches it.
    pub fn read(&self, path: &Path) -> Option<Cow<'_, Value>> {
        self.resolve(path, self.patches.len())
    }

    /// Effective value at `path` as seen after the first `upto` patches.
    fn resolve(&self, path: &Path, upto: usize) -> Option<Cow<'_, Value>> {
        let patches = &self.patches[..upto];
        let anchor = patches
            .iter()
            .rposition(|p| p.path.is_ancestor_or_self_of(path));

        let (mut current, later) = match anchor {
            Some(i) => {
                let patch = &patches[i];
                let below = &path.segments()[patch.path.len()..];
                let start = match &patch.value {
                    Some(value) => value.get_in(below).map(Cow::Borrowed),
                    None if below.is_empty() => self.hole(path, i),
                    None => None,
                };
                (start, &patches[i + 1..])
            }
            None => (self.base.get_in(path.segments()).map(Cow::Borrowed), patches),
        };

        // Every patch in `later` sits strictly below `path` or off to the side.
        for patch in later {
            let Some(below) = patch.path.strip_prefix(path) else {
                continue;
            };
            if let Some(node) = current.as_mut() {
                // Recorded writes were validated against this same view.
                let _ = node.to_mut().write_in(below, patch.value.clone());
            }
        }
        current
    }

    /// Deleting a live sequence slot leaves `Null` behind rather than nothing.
    fn hole(&self, path: &Path, upto: usize) -> Option<Cow<'_, Value>> {
        let index = path.last()?.as_index()?;
        let parent = path.parent()?;
        match self.resolve(&parent, upto).as_deref() {
            Some(Value::Sequence(items)) if index < items.len() => Some(Cow::Owned(Value::Null)),
            _ => None,
        }
    }

    /// Owned effective value at `path`.
    pub fn get(&self, path: impl Into<Path>) -> Option<Value> {
        self.read(&path.into()).map(Cow::into_owned)
    }

    /// Returns `true` if `path` currently resolves to a value.
    pub fn contains(&self, path: impl Into<Path>) -> bool {
        self.read(&path.into()).is_some()
    }

    /// Records an assignment of `value` at `path`.
    pub fn set(&mut self, path: impl Into<Path>, value: impl Into<Value>) -> Result<(), DraftError> {
        let path = path.into();
        self.check_write(&path, false)?;
        self.patches.push(Patch {
            path,
            value: Some(value.into()),
        });
        Ok(())
    }

    /// Records a deletion at `path`.
    pub fn delete(&mut self, path: impl Into<Path>) -> Result<(), DraftError> {
        let path = path.into();
        self.check_write(&path, true)?;
        self.patches.push(Patch { path, value: None });
        Ok(())
    }

    /// Reads the effective value at `path`, maps it through `f`, and records
    /// the result.
    pub fn update<F>(&mut self, path: impl Into<Path>, f: F) -> Result<(), DraftError>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let path = path.into();
        let next = f(self.get(&path));
        self.set(path, next)
    }

    /// Runs `f` over a copy of the effective sequence at `path` and records
    /// the result as a single replacement patch.
    pub fn modify_seq<R, F>(&mut self, path: impl Into<Path>, f: F) -> Result<R, DraftError>
    where
        F: FnOnce(&mut Vec<Value>) -> R,
    {
        let path = path.into();
        let mut items = match self.read(&path).map(Cow::into_owned) {
            Some(Value::Sequence(items)) => items,
            Some(other) => {
                return Err(DraftError::NotASequence {
                    path,
                    kind: other.kind(),
                })
            }
            None => {
                return Err(DraftError::NotASequence {
                    path,
                    kind: "missing",
                })
            }
        };
        let out = f(&mut items);
        self.patches.push(Patch {
            path,
            value: Some(Value::Sequence(items)),
        });
        Ok(out)
    }

    /// Appends `value`; returns the new length.
    pub fn push(&mut self, path: impl Into<Path>, value: impl Into<Value>) -> Result<usize, DraftError> {
        let value = value.into();
        self.modify_seq(path, |items| {
            items.push(value);
            items.len()
        })
    }

    /// Removes and returns the last element.
    pub fn pop(&mut self, path: impl Into<Path>) -> Result<Option<Value>, DraftError> {
        self.modify_seq(path, Vec::pop)
    }

    /// Removes and returns the first element.
    pub fn shift(&mut self, path: impl Into<Path>) -> Result<Option<Value>, DraftError> {
        self.modify_seq(path, |items| {
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        })
    }

    /// Inserts `value` at the front; returns the new length.
    pub fn unshift(
        &mut self,
        path: impl Into<Path>,
        value: impl Into<Value>,
    ) -> Result<usize, DraftError> {
        let value = value.into();
        self.modify_seq(path, |items| {
            items.insert(0, value);
            items.len()
        })
    }

    /// Removes up to `delete_count` elements starting at `start` (clamped to
    /// the length), inserts `items` in their place, and returns the removed
    /// elements.
    pub fn splice<I>(
        &mut self,
        path: impl Into<Path>,
        start: usize,
        delete_count: usize,
        items: I,
    ) -> Result<Vec<Value>, DraftError>
    where
        I: IntoIterator<Item = Value>,
    {
        self.modify_seq(path, |seq| {
            let start = start.min(seq.len());
            let end = start.saturating_add(delete_count).min(seq.len());
            seq.splice(start..end, items).collect()
        })
    }

    /// Reverses the sequence in place.
    pub fn reverse(&mut self, path: impl Into<Path>) -> Result<(), DraftError> {
        self.modify_seq(path, |items| items.reverse())
    }

    /// Sorts by [`Value::total_cmp`].
    pub fn sort(&mut self, path: impl Into<Path>) -> Result<(), DraftError> {
        self.modify_seq(path, |items| items.sort_by(Value::total_cmp))
    }

    /// Sorts with a caller-provided comparator (stable).
    pub fn sort_by<F>(&mut self, path: impl Into<Path>, compare: F) -> Result<(), DraftError>
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        self.modify_seq(path, |items| items.sort_by(compare))
    }

    /// Rotates left by `n` (modulo the length).
    pub fn rotate_left(&mut self, path: impl Into<Path>, n: usize) -> Result<(), DraftError> {
        self.modify_seq(path, |items| {
            if !items.is_empty() {
                let n = n % items.len();
                items.rotate_left(n);
            }
        })
    }

    /// Rotates right by `n` (modulo the length).
    pub fn rotate_right(&mut self, path: impl Into<Path>, n: usize) -> Result<(), DraftError> {
        self.modify_seq(path, |items| {
            if !items.is_empty() {
                let n = n % items.len();
                items.rotate_right(n);
            }
        })
    }

    fn check_write(&self, path: &Path, deleting: bool) -> Result<(), DraftError> {
        let (Some(parent), Some(last)) = (path.parent(), path.last()) else {
            return if deleting {
                Err(DraftError::DeleteRoot)
            } else {
                Ok(())
            };
        };
        match self.read(&parent).as_deref() {
            None => Err(DraftError::MissingParent { path: path.clone() }),
            Some(Value::Mapping(_)) => Ok(()),
            Some(Value::Sequence(items)) => {
                let index = last
                    .as_index()
                    .ok_or_else(|| DraftError::InvalidIndex { path: path.clone() })?;
                // writes may append at `len`; deletes must name an existing slot
                let out_of_range = if deleting {
                    index >= items.len()
                } else {
                    index > items.len()
                };
                if out_of_range {
                    return Err(DraftError::IndexOutOfRange {
                        path: path.clone(),
                        len: items.len(),
                    });
                }
                Ok(())
            }
            Some(other) => Err(DraftError::NotAContainer {
                path: path.clone(),
                kind: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    fn draft(base: serde_json::Value) -> Draft {
        Draft::new(TxId::from_raw(1), Arc::new(Value::from(base)))
    }

    #[test]
    fn reads_fall_through_to_committed_tree() {
        let d = draft(json!({"a": {"b": 1}}));
        assert_eq!(d.get(["a", "b"]), Some(Value::from(1)));
        assert!(matches!(d.read(&Path::from(["a"])), Some(Cow::Borrowed(_))));
        assert_eq!(d.get(["zzz"]), None);
    }

    #[test]
    fn exact_path_write_wins() {
        let mut d = draft(json!({"count": 0}));
        d.set(["count"], 1).unwrap();
        d.set(["count"], 2).unwrap();
        assert_eq!(d.get(["count"]), Some(Value::from(2)));
    }

    #[test]
    fn ancestor_write_is_visible_below() {
        let mut d = draft(json!({"a": {"b": 1}}));
        d.set(["a"], Value::from(json!({"b": 7, "c": 8}))).unwrap();
        assert_eq!(d.get(["a", "b"]), Some(Value::from(7)));
        assert_eq!(d.get(["a", "c"]), Some(Value::from(8)));
    }

    #[test]
    fn descendant_write_is_visible_above() {
        let mut d = draft(json!({"a": {"b": 1}}));
        d.set(["a", "c"], 2).unwrap();
        d.delete(["a", "b"]).unwrap();
        assert_eq!(d.get(["a"]), Some(Value::from(json!({"c": 2}))));
        assert_eq!(d.get(Path::root()), Some(Value::from(json!({"a": {"c": 2}}))));
    }

    #[test]
    fn writes_under_fresh_containers_are_allowed() {
        let mut d = draft(json!({}));
        d.set(["obs"], Value::mapping()).unwrap();
        d.set(["obs", "scene"], "intro").unwrap();
        assert_eq!(d.get(["obs", "scene"]), Some(Value::from("intro")));
        assert_eq!(d.patches().len(), 2);
    }

    #[test]
    fn deleted_sequence_slot_reads_as_null() {
        let mut d = draft(json!({"s": [1, 2]}));
        d.delete(["s", "0"]).unwrap();
        assert_eq!(d.get(["s", "0"]), Some(Value::Null));
        assert_eq!(d.get(["s", "7"]), None);
        assert_eq!(d.get(["s"]), Some(Value::from(json!([null, 2]))));
    }

    #[test]
    fn deleting_past_the_end_is_rejected() {
        let mut d = draft(json!({"s": [1, 2]}));
        for index in ["2", "7"] {
            assert_eq!(
                d.delete(["s", index]),
                Err(DraftError::IndexOutOfRange {
                    path: Path::from(["s", index]),
                    len: 2,
                })
            );
        }
        assert!(d.patches().is_empty());
        d.delete(["s", "1"]).unwrap();
        assert_eq!(d.get(["s"]), Some(Value::from(json!([1, null]))));
    }

    #[test]
    fn invalid_writes_are_rejected_without_recording() {
        let mut d = draft(json!({"n": 1, "s": [1, 2]}));
        assert!(matches!(
            d.set(["n", "x"], 1),
            Err(DraftError::NotAContainer { kind: "number", .. })
        ));
        assert!(matches!(
            d.set(["m", "x"], 1),
            Err(DraftError::MissingParent { .. })
        ));
        assert!(matches!(
            d.set(["s", "5"], 1),
            Err(DraftError::IndexOutOfRange { len: 2, .. })
        ));
        assert!(matches!(d.set(["s", "k"], 1), Err(DraftError::InvalidIndex { .. })));
        assert_eq!(d.delete(Path::root()), Err(DraftError::DeleteRoot));
        assert!(!d.is_dirty());
    }

    #[test]
    fn sequence_ops_record_one_patch_at_sequence_path() {
        let mut d = draft(json!({"scores": [1, 2, 3]}));
        assert_eq!(d.shift(["scores"]).unwrap(), Some(Value::from(1)));
        assert_eq!(d.push(["scores"], 4).unwrap(), 3);
        assert_eq!(d.get(["scores"]), Some(Value::from(json!([2, 3, 4]))));

        let batch = d.into_batch();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|p| p.path == Path::from(["scores"])));
        assert_eq!(
            batch.patches().last().and_then(|p| p.value.clone()),
            Some(Value::from(json!([2, 3, 4])))
        );
    }

    #[test]
    fn sequence_ops_see_pending_slot_writes() {
        let mut d = draft(json!({"s": [1, 2, 3]}));
        d.set(["s", "0"], 10).unwrap();
        d.reverse(["s"]).unwrap();
        assert_eq!(d.get(["s"]), Some(Value::from(json!([3, 2, 10]))));
    }

    #[test]
    fn splice_and_rotate() {
        let mut d = draft(json!({"s": [1, 2, 3, 4, 5]}));
        let removed = d
            .splice(["s"], 1, 2, vec![Value::from("x")])
            .unwrap();
        assert_eq!(removed, vec![Value::from(2), Value::from(3)]);
        assert_eq!(d.get(["s"]), Some(Value::from(json!([1, "x", 4, 5]))));
        d.rotate_left(["s"], 5).unwrap();
        assert_eq!(d.get(["s"]), Some(Value::from(json!(["x", 4, 5, 1]))));
        d.rotate_right(["s"], 1).unwrap();
        assert_eq!(d.get(["s"]), Some(Value::from(json!([1, "x", 4, 5]))));
        d.sort(["s"]).unwrap();
        assert_eq!(d.get(["s"]), Some(Value::from(json!([1, 4, 5, "x"]))));
    }

    #[test]
    fn sequence_op_on_non_sequence_fails() {
        let mut d = draft(json!({"n": 1}));
        assert_eq!(
            d.push(["n"], 1),
            Err(DraftError::NotASequence {
                path: Path::from(["n"]),
                kind: "number"
            })
        );
        assert_eq!(
            d.pop(["missing"]),
            Err(DraftError::NotASequence {
                path: Path::from(["missing"]),
                kind: "missing"
            })
        );
    }

    #[test]
    fn update_applies_function_to_effective_value() {
        let mut d = draft(json!({"count": 1}));
        d.update(["count"], |v| {
            Value::from(v.and_then(|v| v.as_f64()).unwrap_or_default() + 1.0)
        })
        .unwrap();
        assert_eq!(d.get(["count"]), Some(Value::from(2)));
    }
}
