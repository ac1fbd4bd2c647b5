// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! 16-bit sequence number arithmetic.
//!
//! XRCE sequence numbers live in a modulo-2^16 space. Wrapping is a normal
//! event: `0xFFFF` is followed by `0x0000`. Ordering uses the half-range
//! rule: `a` precedes `b` when the forward distance from `a` to `b` is
//! non-zero and strictly less than half of the space.
//!
//! The single ambiguous case, a forward distance of exactly `0x8000`, is
//! broken by comparing the raw values so that the relation stays
//! antisymmetric (`a.precedes(b)` and `b.precedes(a)` are never both true).

use std::cmp::Ordering;
use std::fmt;

/// Size of the sequence number space.
const SEQ_SPACE: u32 = 1 << 16;

/// Half of the sequence number space.
const SEQ_HALF: u32 = SEQ_SPACE / 2;

/// A sequence number in the modulo-2^16 space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeqNum(u16);

impl SeqNum {
    /// Sequence number zero, the initial value of every stream.
    pub const ZERO: SeqNum = SeqNum(0);

    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// `self + n` modulo 2^16.
    #[inline]
    #[must_use]
    pub fn add(self, n: u16) -> Self {
        Self(((u32::from(self.0) + u32::from(n)) % SEQ_SPACE) as u16)
    }

    /// `self - n` modulo 2^16.
    #[inline]
    #[must_use]
    pub fn sub(self, n: u16) -> Self {
        Self(((u32::from(self.0) + SEQ_SPACE - u32::from(n)) % SEQ_SPACE) as u16)
    }

    /// Successor of `self`.
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        self.add(1)
    }

    /// Predecessor of `self`.
    #[inline]
    #[must_use]
    pub fn prev(self) -> Self {
        self.sub(1)
    }

    /// Forward distance from `self` to `other`, i.e. how many increments
    /// take `self` to `other`.
    #[inline]
    pub fn distance_to(self, other: SeqNum) -> u16 {
        ((u32::from(other.0) + SEQ_SPACE - u32::from(self.0)) % SEQ_SPACE) as u16
    }

    /// True if `self` comes strictly before `other`.
    pub fn precedes(self, other: SeqNum) -> bool {
        let forward = u32::from(self.distance_to(other));
        match forward.cmp(&SEQ_HALF) {
            Ordering::Less => forward != 0,
            Ordering::Equal => self.0 < other.0,
            Ordering::Greater => false,
        }
    }

    /// True if `self` comes strictly after `other`.
    #[inline]
    pub fn follows(self, other: SeqNum) -> bool {
        other.precedes(self)
    }

    /// Three-way comparison under the half-range rule.
    ///
    /// Not a total order over the whole space, which is why [`SeqNum`]
    /// deliberately does not implement [`Ord`].
    pub fn compare(self, other: SeqNum) -> Ordering {
        if self == other {
            Ordering::Equal
        } else if self.precedes(other) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// True if `self` lies in the inclusive range `[first, last]` walking
    /// forward from `first`.
    pub fn within(self, first: SeqNum, last: SeqNum) -> bool {
        first.distance_to(self) <= first.distance_to(last)
    }
}

impl From<u16> for SeqNum {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl From<SeqNum> for u16 {
    fn from(seq: SeqNum) -> Self {
        seq.0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
