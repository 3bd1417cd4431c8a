//! Discovery status bit set.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// What is currently known about a server. Every bit is independent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscoveryStatus(u32);

impl DiscoveryStatus {
    pub const NONE: Self = Self(0);
    pub const NEW: Self = Self(1 << 0);
    pub const MASTER: Self = Self(1 << 1);
    pub const INFO: Self = Self(1 << 2);
    pub const DETAILS: Self = Self(1 << 3);
    pub const DETAILS_RETRY: Self = Self(1 << 4);
    pub const NO_DETAILS: Self = Self(1 << 5);
    pub const PORT: Self = Self(1 << 6);
    pub const PORT_RETRY: Self = Self(1 << 7);
    pub const NO_PORT: Self = Self(1 << 8);

    /// Every named flag, in bit order.
    pub const FLAGS: [(Self, &'static str); 9] = [
        (Self::NEW, "new"),
        (Self::MASTER, "master"),
        (Self::INFO, "info"),
        (Self::DETAILS, "details"),
        (Self::DETAILS_RETRY, "details_retry"),
        (Self::NO_DETAILS, "no_details"),
        (Self::PORT, "port"),
        (Self::PORT_RETRY, "port_retry"),
        (Self::NO_PORT, "no_port"),
    ];

    const KNOWN: u32 = (1 << 9) - 1;

    /// Unknown bits are dropped.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::KNOWN)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Has all bits of `other`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Has at least one bit of `other`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Has none of the bits of `other`.
    pub const fn is_disjoint(self, other: Self) -> bool {
        !self.intersects(other)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Single-bit flags set in `self`.
    pub fn iter(self) -> impl Iterator<Item = Self> {
        Self::FLAGS
            .into_iter()
            .map(|(flag, _)| flag)
            .filter(move |flag| self.contains(*flag))
    }

    /// Name of a single-bit flag.
    pub fn name(self) -> Option<&'static str> {
        Self::FLAGS
            .iter()
            .find(|(flag, _)| *flag == self)
            .map(|(_, name)| *name)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::FLAGS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }
}

impl BitOr for DiscoveryStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DiscoveryStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DiscoveryStatus {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for flag in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(flag.name().unwrap_or("?"))?;
        }
        Ok(())
    }
}

impl fmt::Debug for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryStatus({self})")
    }
}
