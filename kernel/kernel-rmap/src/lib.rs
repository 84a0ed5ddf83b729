//! Physical-to-virtual reverse mapping for anonymous pages.
//!
//! Page replacement picks *physical* pages, but evicting one means finding
//! and clearing every page-table entry that maps it. This crate maintains
//! that reverse index: each [`PageDescriptor`] carries a store that is either
//! a single inline [`PteLocator`] (the overwhelmingly common case, one
//! mapping, zero extra allocation) or a linked chain of cache-line-sized
//! nodes holding [`CHAIN_SLOTS`] locators each:
//!
//! ```text
//! direct:            chain:
//! page ── locator    page ── [head: _ _ _ L L L L] ── [full: L L L L L L L] ── ...
//! ```
//!
//! Non-head nodes are always full, and the head packs its locators at the
//! high-index end, so a scan never probes empty slots past the head's first
//! hole. The four entry points are [`page_add_rmap`], [`page_remove_rmap`],
//! [`page_referenced`] and [`try_to_unmap`].
//!
//! Locators are opaque here: resolving one to a page-table entry, an owning
//! mm context, or the swap layer goes through [`RmapHost`] and [`MmContext`],
//! which the embedding kernel implements.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod chain;
mod host;
mod page;
mod rmap;

pub use chain::{CHAIN_SLOTS, ChainPool, PteChain};
pub use host::{
    ClearedEntry, MmContext, Owner, PageStats, RmapHost, SwapSlot, VmCounters, VmaFlags,
};
pub use page::{PageDescriptor, PageFlags, RmapGuard};
pub use rmap::{UnmapError, page_add_rmap, page_referenced, page_remove_rmap, try_to_unmap};

use core::fmt;
use core::num::NonZeroU64;

/// Opaque, nonzero token naming one page-table entry slot.
///
/// The reverse map stores and compares locators but never dereferences them;
/// [`RmapHost`] gives them meaning. Zero is reserved so that
/// `Option<PteLocator>` — an empty slot — is still a single word.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PteLocator(NonZeroU64);

impl PteLocator {
    /// Wrap a raw locator value; `None` if it is zero.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_nonzero(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for PteLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PteLocator(0x{:X})", self.0.get())
    }
}
