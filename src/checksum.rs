// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use xxhash_rust::xxh3::xxh3_64;

/// A 64-bit node checksum
///
/// A zero checksum means "not computed yet": the deferred checksum policies
/// blank the field on modification and restore it later (on msync or on
/// compaction).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Checksum(u64);

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Checksum {
    /// Wraps a checksum value.
    #[must_use]
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw 64-bit integer.
    #[must_use]
    pub fn into_u64(self) -> u64 {
        self.0
    }

    /// Whether the checksum has been blanked by a deferred policy.
    #[must_use]
    pub fn is_deferred(self) -> bool {
        self.0 == 0
    }

    /// Hashes a byte region.
    #[must_use]
    pub fn compute(bytes: &[u8]) -> Self {
        Self(xxh3_64(bytes))
    }

    pub(crate) fn check(self, expected: Self) -> crate::Result<()> {
        if self.0 == expected.0 {
            Ok(())
        } else {
            Err(crate::Error::ChecksumMismatch {
                got: self,
                expected,
            })
        }
    }
}
