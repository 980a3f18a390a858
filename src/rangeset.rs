//! Canonical sets of non-negative integers stored as sorted runs.
//!
//! A [`RangeSet`] is a list of `(start, length)` pairs, strictly increasing
//! by `start`, each `length >= 1`, with no two pairs overlapping or touching.
//! Every operation leaves the list in that form, so two sets with the same
//! members always compare equal. No run extends past `u64::MAX`, so
//! `u64::MAX` itself is never a member.
//!
//! The same type describes a file's block membership, the set of blocks to
//! wipe, and the blocks past the allocation frontier.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A canonical set of `u64` values stored as merged runs.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<(u64, u64)>", into = "Vec<(u64, u64)>")]
pub struct RangeSet {
    pairs: Vec<(u64, u64)>,
}

impl RangeSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// A single run of `len` values starting at `start`. Empty when `len == 0`.
    pub fn from_pair(start: u64, len: u64) -> Self {
        let mut set = Self::new();
        set.add_range(start, len);
        set
    }

    /// Build from a list of pairs, rejecting anything non-canonical.
    pub fn from_pairs(pairs: Vec<(u64, u64)>) -> Result<Self> {
        let mut prev_end: Option<u64> = None;
        for &(start, len) in &pairs {
            if len == 0 {
                return Err(Error::InvalidRangeSet(format!("empty run at {}", start)));
            }
            let end = start
                .checked_add(len)
                .ok_or_else(|| Error::InvalidRangeSet(format!("run at {} overflows", start)))?;
            if let Some(prev) = prev_end {
                if start <= prev {
                    return Err(Error::InvalidRangeSet(format!(
                        "run at {} overlaps or touches the previous run",
                        start
                    )));
                }
            }
            prev_end = Some(end);
        }
        Ok(Self { pairs })
    }

    /// Add a single value.
    pub fn add(&mut self, value: u64) {
        self.add_range(value, 1);
    }

    /// Add `len` consecutive values starting at `start`, clipped so the run
    /// ends at or before `u64::MAX`.
    pub fn add_range(&mut self, start: u64, len: u64) {
        let len = len.min(u64::MAX - start);
        if len == 0 {
            return;
        }
        // Appending at or past the tail is the allocator's common case.
        if self.pairs.last().map_or(true, |&(s, _)| s <= start) {
            push_merged(&mut self.pairs, start, len);
            return;
        }
        *self = self.union(&Self::from_pair(start, len));
    }

    /// Whether `value` is a member.
    pub fn contains(&self, value: u64) -> bool {
        let idx = self.pairs.partition_point(|&(start, _)| start <= value);
        if idx == 0 {
            return false;
        }
        let (start, len) = self.pairs[idx - 1];
        value - start < len
    }

    /// Number of members.
    pub fn size(&self) -> u64 {
        self.pairs.iter().map(|&(_, len)| len).sum()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// One past the largest member, or `None` when empty.
    pub fn end(&self) -> Option<u64> {
        self.pairs.last().map(|&(start, len)| start + len)
    }

    /// Smallest member.
    pub fn first(&self) -> Option<u64> {
        self.pairs.first().map(|&(start, _)| start)
    }

    /// Number of runs.
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Iterate `(start, length)` runs in ascending order.
    pub fn pairs(&self) -> Pairs<'_> {
        Pairs {
            inner: self.pairs.iter(),
        }
    }

    /// Iterate individual members in ascending order.
    pub fn values(&self) -> Values<'_> {
        Values {
            pairs: self.pairs.iter(),
            current: 0..0,
        }
    }

    /// Members of either set.
    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::with_capacity(self.pairs.len() + other.pairs.len());
        let mut a = self.pairs.iter().peekable();
        let mut b = other.pairs.iter().peekable();

        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(x), Some(y)) => {
                    if x.0 <= y.0 {
                        a.next()
                    } else {
                        b.next()
                    }
                }
                (Some(_), None) => a.next(),
                (None, Some(_)) => b.next(),
                (None, None) => break,
            };
            if let Some(&(start, len)) = next {
                push_merged(&mut out, start, len);
            }
        }

        RangeSet { pairs: out }
    }

    /// Members of `self` that are not in `other`.
    pub fn subtract(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::with_capacity(self.pairs.len());
        let theirs = &other.pairs;
        let mut j = 0;

        for &(start, len) in &self.pairs {
            let end = start + len;
            let mut cur = start;

            while j < theirs.len() && theirs[j].0 + theirs[j].1 <= cur {
                j += 1;
            }

            let mut k = j;
            while cur < end {
                match theirs.get(k) {
                    Some(&(os, ol)) if os < end => {
                        if os > cur {
                            push_merged(&mut out, cur, os - cur);
                        }
                        cur = cur.max(os + ol);
                        k += 1;
                    }
                    _ => {
                        push_merged(&mut out, cur, end - cur);
                        cur = end;
                    }
                }
            }
        }

        RangeSet { pairs: out }
    }

    /// Members present in both sets.
    pub fn intersection(&self, other: &RangeSet) -> RangeSet {
        self.subtract(&self.subtract(other))
    }

    /// Whether the two sets share no member.
    pub fn is_disjoint(&self, other: &RangeSet) -> bool {
        self.intersection(other).is_empty()
    }
}

/// Append a run, merging it into the last run when they overlap or touch.
///
/// Runs must arrive in non-decreasing `start` order.
fn push_merged(out: &mut Vec<(u64, u64)>, start: u64, len: u64) {
    if let Some(last) = out.last_mut() {
        let last_end = last.0 + last.1;
        if start <= last_end {
            let end = last_end.max(start + len);
            last.1 = end - last.0;
            return;
        }
    }
    out.push((start, len));
}

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.pairs.iter().map(|&(start, len)| start..start + len))
            .finish()
    }
}

impl TryFrom<Vec<(u64, u64)>> for RangeSet {
    type Error = Error;

    fn try_from(pairs: Vec<(u64, u64)>) -> Result<Self> {
        Self::from_pairs(pairs)
    }
}

impl From<RangeSet> for Vec<(u64, u64)> {
    fn from(set: RangeSet) -> Self {
        set.pairs
    }
}

impl FromIterator<u64> for RangeSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<u64> for RangeSet {
    fn extend<I: IntoIterator<Item = u64>>(&mut self, iter: I) {
        for value in iter {
            self.add(value);
        }
    }
}

/// Iterator over `(start, length)` runs.
#[derive(Clone)]
pub struct Pairs<'a> {
    inner: std::slice::Iter<'a, (u64, u64)>,
}

impl Iterator for Pairs<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().copied()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Pairs<'_> {}

/// Iterator over individual members.
#[derive(Clone)]
pub struct Values<'a> {
    pairs: std::slice::Iter<'a, (u64, u64)>,
    current: std::ops::Range<u64>,
}

impl Iterator for Values<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            if let Some(value) = self.current.next() {
                return Some(value);
            }
            let &(start, len) = self.pairs.next()?;
            self.current = start..start + len;
        }
    }
}
