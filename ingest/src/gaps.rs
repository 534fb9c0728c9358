//! Gap detection over half-open index ranges.
//!
//! [missing] is the pure form: given a range `(start, end]` and the indices observed so far, it
//! returns every index of the range that has not been observed. [Tracker] maintains the same
//! answer incrementally so a block does not need to rescan its whole range on every insertion.

use std::collections::BTreeSet;

/// Return every index in `(range_start, range_end]` that is not present in `observed`.
///
/// `observed` is treated as a set: duplicates collapse and order is irrelevant. Indices outside of
/// the range are ignored. If `range_start >= range_end`, the range is empty and so is the result.
///
/// Callers deriving `range_start` from a subtraction should clamp it at zero (i.e. use
/// [u64::saturating_sub]).
pub fn missing<'a, I>(range_start: u64, range_end: u64, observed: I) -> BTreeSet<u64>
where
    I: IntoIterator<Item = &'a u64>,
{
    if range_start >= range_end {
        return BTreeSet::new();
    }
    let mut gaps: BTreeSet<u64> = (range_start + 1..=range_end).collect();
    for index in observed {
        gaps.remove(index);
    }
    gaps
}

/// Incrementally tracks the unobserved indices of a range.
#[derive(Clone, Debug)]
pub struct Tracker {
    outstanding: BTreeSet<u64>,
}

impl Tracker {
    /// Track the range `(range_start, range_end]`, ignoring any index in `excluded`.
    pub fn new<'a, I>(range_start: u64, range_end: u64, excluded: I) -> Self
    where
        I: IntoIterator<Item = &'a u64>,
    {
        Self {
            outstanding: missing(range_start, range_end, excluded),
        }
    }

    /// Mark `index` as observed.
    ///
    /// Returns `true` if the index was outstanding (and is not anymore).
    pub fn observe(&mut self, index: u64) -> bool {
        self.outstanding.remove(&index)
    }

    /// Indices of the range that have not been observed (or excluded).
    pub fn missing(&self) -> &BTreeSet<u64> {
        &self.outstanding
    }

    /// Whether every index in the range has been observed (or excluded).
    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }
}
