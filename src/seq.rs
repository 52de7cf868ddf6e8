// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP sequence-space arithmetic.
//!
//! Sequence numbers live in a 32-bit modular space: advancing past
//! `u32::MAX` wraps to zero, and ordering is only meaningful between values
//! less than half the space apart. [`SeqNum`] keeps that arithmetic distinct
//! from plain integers so segment lengths and sequence values cannot be
//! mixed by accident.

use core::fmt;

/// A value in the 32-bit TCP sequence space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNum(u32);

impl SeqNum {
    #[inline]
    pub const fn new(value: u32) -> Self {
        SeqNum(value)
    }

    /// A sequence number drawn from a non-deterministically seeded RNG,
    /// suitable as a connection's initial sequence number.
    #[inline]
    pub fn random() -> Self {
        SeqNum(rand::random())
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Advances the value forward by `size` bytes, wrapping mod 2^32.
    #[inline]
    pub fn update_forward(&mut self, size: usize) {
        self.0 = self.0.wrapping_add(size as u32);
    }

    /// Returns the value `size` bytes forward of `self`, wrapping mod 2^32.
    #[inline]
    #[must_use]
    pub fn forward(self, size: usize) -> Self {
        SeqNum(self.0.wrapping_add(size as u32))
    }

    /// Wrap-safe ordering: true iff `self` comes strictly before `other` in
    /// the sequence space, i.e. `other` is less than half the space ahead.
    #[inline]
    pub fn precedes(self, other: SeqNum) -> bool {
        (other.0.wrapping_sub(self.0) as i32) > 0
    }

    /// Wrap-safe ordering: true iff `self` comes strictly after `other`.
    #[inline]
    pub fn follows(self, other: SeqNum) -> bool {
        other.precedes(self)
    }
}

impl From<u32> for SeqNum {
    #[inline]
    fn from(value: u32) -> Self {
        SeqNum(value)
    }
}

impl From<SeqNum> for u32 {
    #[inline]
    fn from(value: SeqNum) -> Self {
        value.0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNum({})", self.0)
    }
}
