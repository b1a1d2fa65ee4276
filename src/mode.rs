//! Access modes and mapping flags accepted at the allocator boundary.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// How storage for a sequence is obtained and protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    /// Ordinary heap memory; no file involved.
    #[default]
    DefaultHeap,
    /// Shared read-only mapping.
    ReadOnly,
    /// Shared read-write mapping. Writes reach the file.
    ReadWrite,
    /// Private copy-on-write mapping. Writes stay in this process; the file is unchanged.
    CopyOnWrite,
}

impl AccessMode {
    /// Whether this mode is backed by a file mapping.
    #[must_use]
    pub fn is_mapped(self) -> bool {
        self != Self::DefaultHeap
    }

    /// Whether memory obtained in this mode may be written through.
    #[must_use]
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Bitmask of mapping options.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MappingFlags(u8);

impl MappingFlags {
    /// No options.
    pub const NONE: Self = Self(0);
    /// Map the entire file regardless of the requested length, so later sub-range
    /// requests can reuse the mapping.
    pub const MAP_WHOLE_FILE: Self = Self(1);
    /// Reserved. Accepted but has no effect; mapped regions never grow.
    pub const ALLOW_REMAP: Self = Self(1 << 1);
    /// Force a private mapping that never enters the shared pool.
    pub const BYPASS_POOL: Self = Self(1 << 2);

    const ALL: u8 = 0b111;

    /// Build flags from raw bits, dropping unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bits are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MappingFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MappingFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for MappingFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::MAP_WHOLE_FILE, "MAP_WHOLE_FILE"),
            (Self::ALLOW_REMAP, "ALLOW_REMAP"),
            (Self::BYPASS_POOL, "BYPASS_POOL"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("MappingFlags(NONE)")
        } else {
            write!(f, "MappingFlags({})", set.join(" | "))
        }
    }
}
