// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Path addressing for the state tree.
//!
//! A [`Path`] is an ordered run of [`Segment`]s. Segments are strings; a
//! segment addresses a sequence slot when it is a canonical decimal (`"0"`,
//! `"12"`, never `"01"` or `"+1"`). Paths compare segment-wise, which is all
//! the subscription layer needs: two paths *overlap* when they agree on every
//! segment present in both.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One step of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment(String);

impl Segment {
    /// Segment addressing a mapping key (or a sequence slot if `key` is a
    /// canonical decimal).
    pub fn new(key: impl Into<String>) -> Self {
        Segment(key.into())
    }

    /// Segment addressing sequence slot `index`.
    pub fn index(index: usize) -> Self {
        Segment(index.to_string())
    }

    /// Raw segment text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sequence index, if this segment is a canonical decimal.
    pub fn as_index(&self) -> Option<usize> {
        let s = self.0.as_str();
        let canonical = !s.is_empty()
            && s.bytes().all(|b| b.is_ascii_digit())
            && (s == "0" || !s.starts_with('0'));
        if canonical {
            s.parse().ok()
        } else {
            None
        }
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Segment(s.to_owned())
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Segment(s)
    }
}

impl From<&String> for Segment {
    fn from(s: &String) -> Self {
        Segment(s.clone())
    }
}

impl From<usize> for Segment {
    fn from(index: usize) -> Self {
        Segment::index(index)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

struct SegmentVisitor;

impl Visitor<'_> for SegmentVisitor {
    type Value = Segment;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string key or an unsigned index")
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Segment, E> {
        Ok(Segment::from(s))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Segment, E> {
        Ok(Segment(s))
    }

    fn visit_u64<E: de::Error>(self, n: u64) -> Result<Segment, E> {
        Ok(Segment(n.to_string()))
    }

    fn visit_i64<E: de::Error>(self, n: i64) -> Result<Segment, E> {
        if n < 0 {
            return Err(E::custom(format!("negative path index {n}")));
        }
        Ok(Segment(n.to_string()))
    }
}

impl<'de> Deserialize<'de> for Segment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SegmentVisitor)
    }
}

/// Location in the state tree. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<Segment>);

impl Path {
    /// The root path.
    pub fn root() -> Self {
        Path(Vec::new())
    }

    /// Path from a list of segments.
    pub fn new(segments: Vec<Segment>) -> Self {
        Path(segments)
    }

    /// Segments in order.
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` for the root path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// New path with `segment` appended.
    pub fn child(&self, segment: impl Into<Segment>) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Path(segments)
    }

    /// Appends `segment` in place.
    pub fn push(&mut self, segment: impl Into<Segment>) {
        self.0.push(segment.into());
    }

    /// Parent path; `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        self.0
            .split_last()
            .map(|(_, parent)| Path(parent.to_vec()))
    }

    /// Final segment; `None` for the root.
    pub fn last(&self) -> Option<&Segment> {
        self.0.last()
    }

    /// `self` is an ancestor of, or equal to, `other`.
    pub fn is_ancestor_or_self_of(&self, other: &Path) -> bool {
        other.0.starts_with(&self.0)
    }

    /// The two paths agree on every segment present in both, i.e. one is an
    /// ancestor-or-self of the other.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }

    /// Segments of `self` below `ancestor`, if `ancestor` is an
    /// ancestor-or-self of `self`.
    pub fn strip_prefix(&self, ancestor: &Path) -> Option<&[Segment]> {
        self.0.strip_prefix(ancestor.0.as_slice())
    }

    /// Iterator over segments.
    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.0.iter()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl<S: Into<Segment>, const N: usize> From<[S; N]> for Path {
    fn from(segments: [S; N]) -> Self {
        Path(segments.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<Segment>> From<Vec<S>> for Path {
    fn from(segments: Vec<S>) -> Self {
        Path(segments.into_iter().map(Into::into).collect())
    }
}

impl From<&Path> for Path {
    fn from(path: &Path) -> Self {
        path.clone()
    }
}

impl<S: Into<Segment>> FromIterator<S> for Path {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Path(iter.into_iter().map(Into::into).collect())
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
