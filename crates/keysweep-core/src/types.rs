use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Controller-assigned identity of one connected node session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("range start {start} exceeds end {end}")]
    StartAfterEnd { start: i64, end: i64 },
    #[error("range start {0} is negative")]
    NegativeStart(i64),
}

/// Inclusive interval `[start, end]` over the enumeration index space.
///
/// The unit of work assignment. Invariant: `start <= end`, `start >= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: i64,
    pub end: i64,
}

impl IndexRange {
    pub fn new(start: i64, end: i64) -> Result<Self, RangeError> {
        if start < 0 {
            return Err(RangeError::NegativeStart(start));
        }
        if start > end {
            return Err(RangeError::StartAfterEnd { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> i64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, index: i64) -> bool {
        self.start <= index && index <= self.end
    }

    /// Splits into `parts` contiguous sub-ranges of equal size, the last one
    /// absorbing the remainder. A range shorter than `parts` yields one
    /// single-index sub-range per index.
    pub fn split(&self, parts: usize) -> Vec<IndexRange> {
        let parts = (parts.max(1) as i64).min(self.len());
        let chunk = self.len() / parts;
        let mut out = Vec::with_capacity(parts as usize);
        let mut start = self.start;
        for i in 0..parts {
            let end = if i == parts - 1 {
                self.end
            } else {
                start + chunk - 1
            };
            out.push(IndexRange { start, end });
            start = end + 1;
        }
        out
    }
}

impl std::fmt::Display for IndexRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// The index a node reported as matching, plus who reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub node: NodeId,
    pub index: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_even() {
        let r = IndexRange { start: 0, end: 99 };
        let parts = r.split(4);
        assert_eq!(
            parts,
            vec![
                IndexRange { start: 0, end: 24 },
                IndexRange { start: 25, end: 49 },
                IndexRange { start: 50, end: 74 },
                IndexRange { start: 75, end: 99 },
            ]
        );
    }

    #[test]
    fn split_last_absorbs_remainder() {
        let r = IndexRange { start: 10, end: 20 };
        let parts = r.split(3);
        assert_eq!(
            parts,
            vec![
                IndexRange { start: 10, end: 12 },
                IndexRange { start: 13, end: 15 },
                IndexRange { start: 16, end: 20 },
            ]
        );
        assert_eq!(parts.iter().map(IndexRange::len).sum::<i64>(), r.len());
    }

    #[test]
    fn split_more_parts_than_indexes() {
        let r = IndexRange { start: 5, end: 6 };
        let parts = r.split(8);
        assert_eq!(
            parts,
            vec![
                IndexRange { start: 5, end: 5 },
                IndexRange { start: 6, end: 6 },
            ]
        );
    }

    #[test]
    fn new_rejects_inverted_bounds() {
        assert_eq!(
            IndexRange::new(7, 3),
            Err(RangeError::StartAfterEnd { start: 7, end: 3 })
        );
        assert_eq!(IndexRange::new(-1, 3), Err(RangeError::NegativeStart(-1)));
    }
}
