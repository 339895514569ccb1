// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Transaction identifier types.

/// Identifier of one [`crate::StateEngine`] transaction.
///
/// # Invariants
/// - Identifiers increase monotonically and wrap at `u64::MAX`; after a wrap
///   the engine resumes at `1`.
/// - Zero is reserved as invalid. [`crate::StateEngine::begin`] never issues it.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TxId(u64);

impl TxId {
    /// Constructs a `TxId` from a raw `u64`.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Identifier following `self`, skipping zero on wrap.
    #[must_use]
    pub(crate) const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }
}

impl core::fmt::Display for TxId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_skips_zero_on_wrap() {
        assert_eq!(TxId::from_raw(u64::MAX).next(), TxId::from_raw(1));
        assert_eq!(TxId::from_raw(0).next(), TxId::from_raw(1));
        assert_eq!(TxId::from_raw(41).next().value(), 42);
    }
}
