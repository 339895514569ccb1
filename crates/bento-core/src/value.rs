// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Closed JSON-like value type for the state tree.
//!
//! The state tree is exactly one [`Value`], rooted at the empty path. Mappings
//! are kept in a `BTreeMap` so iteration (and therefore serialization and
//! hashing of snapshots) is deterministic regardless of insertion order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::path::{Path, Segment};

/// Mapping payload of [`Value::Mapping`].
pub type Map = BTreeMap<String, Value>;

/// A node of the state tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent/empty value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// IEEE-754 double, matching the number model of the peers.
    Number(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence addressed by decimal index segments.
    Sequence(Vec<Value>),
    /// String-keyed mapping.
    Mapping(Map),
}

/// Reason a structural write could not be applied to a tree.
///
/// `depth` is the number of path segments that were successfully walked
/// before the fault was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteFault {
    /// An intermediate segment resolved to a scalar.
    NotAContainer { depth: usize },
    /// An intermediate segment did not resolve to anything.
    MissingParent { depth: usize },
    /// Sequence index was not a canonical decimal or lies past the end.
    BadIndex { depth: usize },
    /// Deletion of the root is not representable.
    DeleteRoot,
}

impl Value {
    /// Empty mapping.
    pub fn mapping() -> Self {
        Value::Mapping(Map::new())
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
        }
    }

    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns `true` for sequences and mappings.
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Sequence(_) | Value::Mapping(_))
    }

    /// Boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric payload, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Sequence payload, if any.
    pub fn as_sequence(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Mutable sequence payload, if any.
    pub fn as_sequence_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Mapping payload, if any.
    pub fn as_mapping(&self) -> Option<&Map> {
        match self {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Mutable mapping payload, if any.
    pub fn as_mapping_mut(&mut self) -> Option<&mut Map> {
        match self {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Child addressed by a single segment.
    ///
    /// Sequences are indexed by canonical decimal segments only; any other
    /// segment on a sequence, or any segment on a scalar, yields `None`.
    pub fn get(&self, segment: &Segment) -> Option<&Value> {
        match self {
            Value::Mapping(map) => map.get(segment.as_str()),
            Value::Sequence(items) => segment.as_index().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    /// Mutable child addressed by a single segment.
    pub fn get_mut(&mut self, segment: &Segment) -> Option<&mut Value> {
        match self {
            Value::Mapping(map) => map.get_mut(segment.as_str()),
            Value::Sequence(items) => segment.as_index().and_then(|i| items.get_mut(i)),
            _ => None,
        }
    }

    /// Descendant addressed by a run of segments (empty = `self`).
    pub fn get_in(&self, segments: &[Segment]) -> Option<&Value> {
        segments
            .iter()
            .try_fold(self, |node, segment| node.get(segment))
    }

    /// Descendant addressed by `path`.
    pub fn at(&self, path: &Path) -> Option<&Value> {
        self.get_in(path.segments())
    }

    /// Total order over values: `null < bool < number < string < sequence <
    /// mapping`, then natural order within a variant. Used by draft sorting.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Number(_) => 2,
                Value::String(_) => 3,
                Value::Sequence(_) => 4,
                Value::Mapping(_) => 5,
            }
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Sequence(a), Value::Sequence(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Mapping(a), Value::Mapping(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b) {
                    let ord = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => rank(self).cmp(&rank(other)),
        }
    }

    /// Sets (`Some`) or deletes (`None`) the node at `path`, walking existing
    /// containers only. Deleting a sequence slot leaves a `Null` hole so that
    /// sibling indices stay stable.
    pub(crate) fn write_in(
        &mut self,
        path: &[Segment],
        value: Option<Value>,
    ) -> Result<(), WriteFault> {
        let Some((last, parents)) = path.split_last() else {
            return match value {
                Some(v) => {
                    *self = v;
                    Ok(())
                }
                None => Err(WriteFault::DeleteRoot),
            };
        };

        let mut node = self;
        for (depth, segment) in parents.iter().enumerate() {
            if !node.is_container() {
                return Err(WriteFault::NotAContainer { depth });
            }
            node = node
                .get_mut(segment)
                .ok_or(WriteFault::MissingParent { depth })?;
        }

        let depth = parents.len();
        match node {
            Value::Mapping(map) => {
                match value {
                    Some(v) => {
                        map.insert(last.as_str().to_owned(), v);
                    }
                    None => {
                        map.remove(last.as_str());
                    }
                }
                Ok(())
            }
            Value::Sequence(items) => {
                let index = last.as_index().ok_or(WriteFault::BadIndex { depth })?;
                match value {
                    Some(v) if index < items.len() => items[index] = v,
                    Some(v) if index == items.len() => items.push(v),
                    Some(_) => return Err(WriteFault::BadIndex { depth }),
                    None => {
                        if let Some(slot) = items.get_mut(index) {
                            *slot = Value::Null;
                        }
                    }
                }
                Ok(())
            }
            _ => Err(WriteFault::NotAContainer { depth }),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    #[allow(clippy::cast_precision_loss)]
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Sequence(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Mapping(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Mapping(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => match integral(n) {
                Some(i) => serde_json::Value::from(i),
                None => serde_json::Number::from_f64(n)
                    .map_or(serde_json::Value::Null, serde_json::Value::Number),
            },
            Value::String(s) => serde_json::Value::String(s),
            Value::Sequence(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Mapping(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json: serde_json::Value = self.clone().into();
        write!(f, "{json}")
    }
}

// Integral doubles inside the exactly-representable range travel as integers
// so CBOR/JSON encodings stay compact and round-trip bit-for-bit.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
fn integral(n: f64) -> Option<i64> {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE && !(n == 0.0 && n.is_sign_negative())
    {
        Some(n as i64)
    } else {
        None
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => match integral(*n) {
                Some(i) => serializer.serialize_i64(i),
                None => serializer.serialize_f64(*n),
            },
            Value::String(s) => serializer.serialize_str(s),
            Value::Sequence(items) => serializer.collect_seq(items),
            Value::Mapping(map) => serializer.collect_map(map),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON-like value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_i64<E: de::Error>(self, n: i64) -> Result<Value, E> {
        Ok(Value::Number(n as f64))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, n: u64) -> Result<Value, E> {
        Ok(Value::Number(n as f64))
    }

    fn visit_f64<E: de::Error>(self, n: f64) -> Result<Value, E> {
        Ok(Value::Number(n))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        Ok(Value::String(s.to_owned()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        Ok(Value::String(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Sequence(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = Map::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            map.insert(key, value);
        }
        Ok(Value::Mapping(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion_preserves_shape() {
        let v = Value::from(json!({"a": [1, 2.5, null], "b": {"c": "x"}, "d": true}));
        assert_eq!(
            v.at(&Path::from(["a", "1"])),
            Some(&Value::Number(2.5))
        );
        let back: serde_json::Value = v.into();
        assert_eq!(back, json!({"a": [1, 2.5, null], "b": {"c": "x"}, "d": true}));
    }

    #[test]
    fn cbor_keeps_null_distinct_and_integers_compact() {
        let v = Value::from(json!({"n": null, "i": 3, "f": 0.5}));
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&v, &mut bytes).unwrap();
        let back: Value = ciborium::de::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn sequence_index_must_be_canonical() {
        let v = Value::from(json!([10, 20]));
        assert_eq!(v.get(&Segment::from("1")), Some(&Value::Number(20.0)));
        assert_eq!(v.get(&Segment::from("01")), None);
        assert_eq!(v.get(&Segment::from("x")), None);
    }

    #[test]
    fn write_in_rejects_scalar_parents_and_gaps() {
        let mut v = Value::from(json!({"a": 1, "s": [1]}));
        assert_eq!(
            v.write_in(Path::from(["a", "b"]).segments(), Some(Value::Null)),
            Err(WriteFault::NotAContainer { depth: 1 })
        );
        assert_eq!(
            v.write_in(Path::from(["s", "3"]).segments(), Some(Value::Null)),
            Err(WriteFault::BadIndex { depth: 1 })
        );
        assert_eq!(
            v.write_in(Path::from(["m", "x"]).segments(), Some(Value::Null)),
            Err(WriteFault::MissingParent { depth: 0 })
        );
        v.write_in(Path::from(["s", "1"]).segments(), Some(Value::from(2)))
            .unwrap();
        assert_eq!(v, Value::from(json!({"a": 1, "s": [1, 2]})));
    }

    #[test]
    fn deleting_sequence_slot_leaves_hole() {
        let mut v = Value::from(json!([1, 2, 3]));
        v.write_in(Path::from(["1"]).segments(), None).unwrap();
        assert_eq!(v, Value::from(json!([1, null, 3])));
    }

    #[test]
    fn total_order_ranks_variants() {
        let mut items = vec![
            Value::from("b"),
            Value::from(2),
            Value::Null,
            Value::from(true),
            Value::from("a"),
            Value::from(1),
        ];
        items.sort_by(Value::total_cmp);
        assert_eq!(
            items,
            vec![
                Value::Null,
                Value::from(true),
                Value::from(1),
                Value::from(2),
                Value::from("a"),
                Value::from("b"),
            ]
        );
    }
}
