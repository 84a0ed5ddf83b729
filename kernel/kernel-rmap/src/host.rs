//! Seams to the rest of the kernel.
//!
//! The reverse map stores opaque locators; everything that gives them
//! meaning — page tables, address spaces, the swap layer, global accounting —
//! is reached through the traits here. The embedding kernel implements them
//! once; tests implement them over in-memory fakes.

use crate::PteLocator;
use crate::page::PageDescriptor;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_addresses::VirtualAddress;

bitflags! {
    /// Per-VMA policy bits the reverse map consults.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct VmaFlags: u64 {
        /// Locked in memory (mlock); eviction is forbidden.
        const LOCKED = 1 << 0;
    }
}

/// Location of a page's slot in the swap backing store.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SwapSlot(u64);

impl SwapSlot {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot(0x{:X})", self.0)
    }
}

/// Where a locator's page-table entry lives: its owning mm context and the
/// virtual address it maps.
pub struct Owner<'a, Mm> {
    pub mm: &'a Mm,
    pub address: VirtualAddress,
}

/// Snapshot of a page-table entry taken as it was cleared.
#[derive(Copy, Clone, Debug)]
pub struct ClearedEntry {
    /// Hardware dirty bit of the entry at the moment it was cleared.
    pub dirty: bool,
}

/// One address space's mm context.
///
/// `vma_at` and `rss_dec` are only meaningful while the page-table lock is
/// held; callers invoke them from inside the `try_with_page_table` closure.
pub trait MmContext {
    /// Non-blocking try-acquire of this context's page-table lock; runs `f`
    /// under the lock. `None` means the lock was contended — by the nesting
    /// rules this call must never block, since our callers already hold the
    /// page and replacement-list locks that the fault path acquires *after*
    /// this one.
    fn try_with_page_table<R>(&self, f: impl FnOnce() -> R) -> Option<R>;

    /// Policy flags of the VMA covering `address`, or `None` when the
    /// address space no longer has one (teardown raced with the scan).
    fn vma_at(&self, address: VirtualAddress) -> Option<VmaFlags>;

    /// Drop this context's resident-page count by one.
    fn rss_dec(&self);
}

/// The kernel services a reverse-map walk consumes.
///
/// Locator resolution must succeed for every locator currently stored: the
/// store lock orders insertions and removals against scans, so a stale
/// locator can only mean corrupted bookkeeping, and implementations should
/// treat it as fatal rather than report it.
pub trait RmapHost {
    type Mm: MmContext;

    /// Resolve a locator to its owning mm context and mapped address.
    fn owner(&self, loc: PteLocator) -> Owner<'_, Self::Mm>;

    /// Atomically test and clear the hardware accessed bit of the entry at
    /// `loc`.
    fn test_and_clear_accessed(&self, loc: PteLocator) -> bool;

    /// Atomically clear the entry at `loc` and flush the translation and
    /// data caches for the one page it mapped. Caller holds the owning
    /// context's page-table lock.
    fn clear_entry(&self, loc: PteLocator) -> ClearedEntry;

    /// Install a swap marker into the (just cleared) entry at `loc`, so a
    /// later fault can restore the mapping from `slot`.
    fn install_swap_marker(&self, loc: PteLocator, slot: SwapSlot);

    /// The page's slot in the swap cache, if it is a member.
    fn swap_slot(&self, page: &PageDescriptor) -> Option<SwapSlot>;

    /// Register one more reference to `slot`. `false` signals a bogus or
    /// exhausted slot — an unexpected condition the walk aborts on.
    #[must_use]
    fn swap_duplicate(&self, slot: SwapSlot) -> bool;

    /// Release the structural reference a (now removed) mapping held on the
    /// page.
    fn release_page(&self, page: &PageDescriptor);
}

/// Global page-state accounting.
pub trait PageStats {
    /// A page went from zero mappings to one.
    fn mapped_inc(&self);
    /// A page went from one mapping to zero.
    fn mapped_dec(&self);
    /// One locator was added to some page's store.
    fn reverse_maps_inc(&self);
    /// One locator was removed from some page's store.
    fn reverse_maps_dec(&self);
}

/// Relaxed-atomic [`PageStats`] suitable as a kernel-wide static.
#[derive(Debug, Default)]
pub struct VmCounters {
    nr_mapped: AtomicUsize,
    nr_reverse_maps: AtomicUsize,
}

impl VmCounters {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nr_mapped: AtomicUsize::new(0),
            nr_reverse_maps: AtomicUsize::new(0),
        }
    }

    /// Pages with at least one mapping.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.nr_mapped.load(Ordering::Relaxed)
    }

    /// Locators across all stores.
    #[must_use]
    pub fn reverse_maps(&self) -> usize {
        self.nr_reverse_maps.load(Ordering::Relaxed)
    }
}

impl PageStats for VmCounters {
    fn mapped_inc(&self) {
        self.nr_mapped.fetch_add(1, Ordering::Relaxed);
    }

    fn mapped_dec(&self) {
        self.nr_mapped.fetch_sub(1, Ordering::Relaxed);
    }

    fn reverse_maps_inc(&self) {
        self.nr_reverse_maps.fetch_add(1, Ordering::Relaxed);
    }

    fn reverse_maps_dec(&self) {
        self.nr_reverse_maps.fetch_sub(1, Ordering::Relaxed);
    }
}
