use crate::{PAGE_SIZE, align_down};
use core::fmt;
use core::ops::Add;

/// Physical memory address.
///
/// Page-table entries and page descriptors store **page-aligned** physical
/// bases; use [`page_base`](Self::page_base) / [`is_page_aligned`](Self::is_page_aligned)
/// to reason about base vs. offset explicitly.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The 4 KiB page base containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_base_masks_low_bits() {
        let pa = PhysicalAddress::new(0x0030_1234);
        assert_eq!(pa.page_base().as_u64(), 0x0030_1000);
        assert!(pa.page_base().is_page_aligned());
        assert!(!pa.is_page_aligned());
    }

    #[test]
    fn debug_format_carries_kind() {
        let pa = PhysicalAddress::new(0x1000);
        assert_eq!(format!("{pa:?}"), "PA(0x0000000000001000)");
    }
}
