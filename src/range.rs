//! Backend-agnostic translation of op modifiers into row predicates.
//!
//! [`KeyRange`] is the one place that decides which keys an op touches. The
//! memory backend consumes it as ordered byte bounds, the SQL backend as a
//! `WHERE` fragment with bind values. Both always add `job_id = ?` on top.

use std::ops::Bound;

/// The set of keys a get or delete targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    /// Exactly one key.
    Exact(Vec<u8>),
    /// Half-open `[start, end)`.
    Range { start: Vec<u8>, end: Vec<u8> },
    /// All keys starting with the prefix.
    Prefix(Vec<u8>),
    /// All keys `>= key`.
    FromKey(Vec<u8>),
}

/// A SQL `WHERE` fragment over the key column plus its bind values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub clause: &'static str,
    pub args: Vec<Vec<u8>>,
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Returns `None` when no such key exists (empty prefix or all `0xff`),
/// in which case a prefix scan has no upper bound.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

impl KeyRange {
    /// Whether this is a point lookup.
    pub fn is_exact(&self) -> bool {
        matches!(self, KeyRange::Exact(_))
    }

    /// Inclusive lower bound shared by every shape.
    pub fn start(&self) -> &[u8] {
        match self {
            KeyRange::Exact(key)
            | KeyRange::Prefix(key)
            | KeyRange::FromKey(key)
            | KeyRange::Range { start: key, .. } => key,
        }
    }

    /// Upper bound of the targeted keys.
    pub fn end_bound(&self) -> Bound<Vec<u8>> {
        match self {
            KeyRange::Exact(key) => Bound::Included(key.clone()),
            KeyRange::Range { end, .. } => Bound::Excluded(end.clone()),
            KeyRange::Prefix(prefix) => match prefix_end(prefix) {
                Some(end) => Bound::Excluded(end),
                None => Bound::Unbounded,
            },
            KeyRange::FromKey(_) => Bound::Unbounded,
        }
    }

    /// Whether `key` is at or below the upper bound.
    pub fn below_end(&self, key: &[u8]) -> bool {
        match self.end_bound() {
            Bound::Included(end) => key <= end.as_slice(),
            Bound::Excluded(end) => key < end.as_slice(),
            Bound::Unbounded => true,
        }
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start() && self.below_end(key)
    }

    /// SQL predicate over the `meta_key` column.
    pub fn predicate(&self) -> Predicate {
        let start = self.start().to_vec();
        match self.end_bound() {
            Bound::Included(_) => Predicate {
                clause: "meta_key = ?",
                args: vec![start],
            },
            Bound::Excluded(end) => Predicate {
                clause: "meta_key >= ? AND meta_key < ?",
                args: vec![start, end],
            },
            Bound::Unbounded => Predicate {
                clause: "meta_key >= ?",
                args: vec![start],
            },
        }
    }
}
