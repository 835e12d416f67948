//! Half-open index ranges used to address shards of flat buffers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A half-open interval `[start, end)` of element indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    pub start: usize,
    pub end: usize,
}

impl Range {
    /// # Panics
    /// Panics if `start > end`.
    #[must_use]
    pub fn new(start: usize, end: usize) -> Self {
        assert!(start <= end, "invalid range: start {start} > end {end}");
        Self { start, end }
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Same size, shifted to begin at `start`.
    #[must_use]
    pub fn normalize(&self, start: usize) -> Self {
        Self::new(start, start + self.size())
    }

    /// Intersection with `other`, or `None` when they don't overlap.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (end > start).then(|| Self::new(start, end))
    }

    #[must_use]
    pub fn as_std(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{} [{}]", self.start, self.end, self.size())
    }
}
