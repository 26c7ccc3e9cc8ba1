/*
 * SPDX-FileCopyrightText: 2022-2025 The otakit developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid block range: {0:?}")]
    InvalidRange(String),
}

type Result<T> = std::result::Result<T, Error>;

/// A set of block numbers stored as sorted, disjoint, half-open ranges.
///
/// Two textual forms exist. The human-readable form uses inclusive ranges
/// separated by spaces (`"10-19 30"`). The raw form used inside block image
/// transfer lists is a comma-separated list where the first value is the
/// number of boundary values that follow (`"4,10,20,30,31"`).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary half-open pairs. Overlapping and adjacent pairs
    /// are merged.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut ranges: Vec<(u64, u64)> = pairs.into_iter().filter(|(s, e)| e > s).collect();
        ranges.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some((_, prev_end)) if start <= *prev_end => {
                    *prev_end = (*prev_end).max(end);
                }
                _ => merged.push((start, end)),
            }
        }

        Self { ranges: merged }
    }

    /// Parse the human-readable form, e.g. `"10-19 30"`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut pairs = vec![];

        for token in text.split_whitespace() {
            let (start, end) = if let Some((a, b)) = token.split_once('-') {
                let a: u64 = a
                    .parse()
                    .map_err(|_| Error::InvalidRange(token.to_owned()))?;
                let b: u64 = b
                    .parse()
                    .map_err(|_| Error::InvalidRange(token.to_owned()))?;
                if b < a {
                    return Err(Error::InvalidRange(token.to_owned()));
                }
                (a, b + 1)
            } else {
                let a: u64 = token
                    .parse()
                    .map_err(|_| Error::InvalidRange(token.to_owned()))?;
                (a, a + 1)
            };

            pairs.push((start, end));
        }

        Ok(Self::from_pairs(pairs))
    }

    /// Parse the raw transfer list form, e.g. `"4,10,20,30,31"`.
    pub fn parse_raw(text: &str) -> Result<Self> {
        let mut values = vec![];

        for token in text.split(',') {
            let v: u64 = token
                .parse()
                .map_err(|_| Error::InvalidRange(text.to_owned()))?;
            values.push(v);
        }

        let Some((&count, boundaries)) = values.split_first() else {
            return Err(Error::InvalidRange(text.to_owned()));
        };

        if count as usize != boundaries.len() || count % 2 != 0 {
            return Err(Error::InvalidRange(text.to_owned()));
        }

        Ok(Self::from_pairs(
            boundaries.chunks_exact(2).map(|c| (c[0], c[1])),
        ))
    }

    /// Serialize to the raw transfer list form.
    pub fn to_string_raw(&self) -> String {
        let mut out = (self.ranges.len() * 2).to_string();

        for (start, end) in &self.ranges {
            out.push(',');
            out.push_str(&start.to_string());
            out.push(',');
            out.push_str(&end.to_string());
        }

        out
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of blocks in the set.
    pub fn blocks(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    pub fn iter_pairs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn union(&self, other: &Self) -> Self {
        Self::from_pairs(self.iter_pairs().chain(other.iter_pairs()))
    }

    pub fn subtract(&self, other: &Self) -> Self {
        let mut result = vec![];

        for (mut start, end) in self.iter_pairs() {
            for (o_start, o_end) in other.iter_pairs() {
                if o_end <= start || o_start >= end {
                    continue;
                }
                if o_start > start {
                    result.push((start, o_start));
                }
                start = start.max(o_end);
                if start >= end {
                    break;
                }
            }

            if start < end {
                result.push((start, end));
            }
        }

        Self::from_pairs(result)
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut result = vec![];

        for (start, end) in self.iter_pairs() {
            for (o_start, o_end) in other.iter_pairs() {
                let s = start.max(o_start);
                let e = end.min(o_end);
                if s < e {
                    result.push((s, e));
                }
            }
        }

        Self::from_pairs(result)
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        !self.intersect(other).is_empty()
    }

    /// The first `n` blocks of the set (or the whole set if smaller).
    pub fn first(&self, n: u64) -> Self {
        let mut remaining = n;
        let mut pairs = vec![];

        for (start, end) in self.iter_pairs() {
            if remaining == 0 {
                break;
            }

            let take = remaining.min(end - start);
            pairs.push((start, start + take));
            remaining -= take;
        }

        Self::from_pairs(pairs)
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (start, end)) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            if *end == start + 1 {
                write!(f, "{start}")?;
            } else {
                write!(f, "{}-{}", start, end - 1)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_and_format() {
        let rs = RangeSet::parse("10-19 30").unwrap();
        assert_eq!(rs.to_string(), "10-19 30");
        assert_eq!(rs.to_string_raw(), "4,10,20,30,31");
        assert_eq!(rs.blocks(), 11);

        let raw = RangeSet::parse_raw("4,10,20,30,31").unwrap();
        assert_eq!(raw, rs);

        assert_matches!(RangeSet::parse("20-10"), Err(Error::InvalidRange(_)));
        assert_matches!(RangeSet::parse_raw("3,1,2,3"), Err(Error::InvalidRange(_)));
    }

    #[test]
    fn merging() {
        let rs = RangeSet::from_pairs([(10, 20), (20, 30), (5, 12)]);
        assert_eq!(rs.to_string(), "5-29");

        let rs = RangeSet::from_pairs([(0, 1), (2, 3)]);
        assert_eq!(rs.to_string(), "0 2");
    }

    #[test]
    fn set_algebra() {
        let a = RangeSet::parse("0-9 20-29").unwrap();
        let b = RangeSet::parse("5-24").unwrap();

        assert_eq!(a.union(&b).to_string(), "0-29");
        assert_eq!(a.subtract(&b).to_string(), "0-4 25-29");
        assert_eq!(a.intersect(&b).to_string(), "5-9 20-24");
        assert!(a.overlaps(&b));
        assert!(!a.subtract(&b).overlaps(&b));
    }

    #[test]
    fn first_blocks() {
        let rs = RangeSet::parse("0-3 10-19").unwrap();

        assert_eq!(rs.first(2).to_string(), "0-1");
        assert_eq!(rs.first(6).to_string(), "0-3 10-11");
        assert_eq!(rs.first(100), rs);
    }
}
