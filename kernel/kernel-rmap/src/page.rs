//! Page descriptors and the per-page reverse-map store.
//!
//! The store lives inside the descriptor and is guarded by a lock **bit** in
//! the descriptor's flag word ([`PageFlags::RMAP_LOCK`]), so an unmapped page
//! costs one word of flags, one map count, and one store word — no separate
//! lock field. [`PageDescriptor::lock_rmap`] hands out the RAII guard through
//! which all store access flows.

use crate::PteLocator;
use crate::chain::PteChain;
use alloc::boxed::Box;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_addresses::PhysicalAddress;
use kernel_sync::BitSpin;

bitflags! {
    /// Software flags in a page descriptor's atomic flag word.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Reserved/unmanaged page; the reverse map ignores it entirely.
        const RESERVED = 1 << 0;
        /// The page lock, held by reclaim before calling into batch unmap.
        /// Acquired and released by the owning layers, never here.
        const LOCKED = 1 << 1;
        /// Software referenced mark, set by fault and I/O paths and consumed
        /// (test-and-clear) by the reference scan.
        const REFERENCED = 1 << 2;
        /// Page content diverges from its backing store.
        const DIRTY = 1 << 3;
        /// Lock bit guarding the reverse-map store. Internal; taken via
        /// [`PageDescriptor::lock_rmap`] only.
        const RMAP_LOCK = 1 << 4;
    }
}

/// A page's reverse-map store.
///
/// One mapping is stored inline (`Direct`); more than one spills into a list
/// of chain nodes. The tag replaces the C-style "direct" flag bit: a page is
/// in direct mode exactly when the store is `Direct`, and a page with no
/// mappings is `Empty`.
///
/// A `Chain` head always holds at least one locator; removal pops a drained
/// head immediately (promoting its successor or reverting to `Empty`).
pub(crate) enum RmapStore {
    Empty,
    Direct(PteLocator),
    Chain(Box<PteChain>),
}

impl RmapStore {
    pub(crate) fn node(&self, n: usize) -> Option<&PteChain> {
        let Self::Chain(head) = self else {
            return None;
        };
        let mut node = &**head;
        for _ in 0..n {
            node = node.next.as_deref()?;
        }
        Some(node)
    }

    pub(crate) fn node_mut(&mut self, n: usize) -> Option<&mut PteChain> {
        let Self::Chain(head) = self else {
            return None;
        };
        let mut node = &mut **head;
        for _ in 0..n {
            node = node.next.as_deref_mut()?;
        }
        Some(node)
    }

    /// Unlink and return the head node, promoting its successor (or leaving
    /// the store `Empty`). Must only be called in chain mode.
    pub(crate) fn pop_head(&mut self) -> Box<PteChain> {
        match mem::replace(self, Self::Empty) {
            Self::Chain(mut head) => {
                if let Some(next) = head.next.take() {
                    *self = Self::Chain(next);
                }
                head
            }
            _ => unreachable!("pop_head on a store without a chain"),
        }
    }
}

/// Descriptor for one physical page, as seen by the reverse map.
///
/// The wider kernel's page descriptor carries more (LRU linkage, cache
/// index, reference count); this subsystem owns the flag word, the map
/// count, and the store.
pub struct PageDescriptor {
    frame: PhysicalAddress,
    flags: AtomicU64,
    mapcount: AtomicUsize,
    store: UnsafeCell<RmapStore>,
}

// Safety: `store` is only reached through `RmapGuard`, whose existence means
// the RMAP_LOCK bit is held; everything else is atomic.
unsafe impl Sync for PageDescriptor {}

impl PageDescriptor {
    /// A fresh, unmapped, managed page. The store starts `Empty`, matching
    /// the allocator's zero-initialized hand-off.
    #[must_use]
    pub const fn new(frame: PhysicalAddress) -> Self {
        Self {
            frame,
            flags: AtomicU64::new(0),
            mapcount: AtomicUsize::new(0),
            store: UnsafeCell::new(RmapStore::Empty),
        }
    }

    /// A reserved/unmanaged page; rmap operations treat it as a no-op target.
    #[must_use]
    pub const fn new_reserved(frame: PhysicalAddress) -> Self {
        Self {
            frame,
            flags: AtomicU64::new(PageFlags::RESERVED.bits()),
            mapcount: AtomicUsize::new(0),
            store: UnsafeCell::new(RmapStore::Empty),
        }
    }

    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    #[must_use]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Set the given flag bits. The store lock bit is not settable this way.
    pub fn set_flags(&self, f: PageFlags) {
        debug_assert!(!f.contains(PageFlags::RMAP_LOCK));
        self.flags.fetch_or(f.bits(), Ordering::Relaxed);
    }

    /// Clear the given flag bits. The store lock bit is not clearable this way.
    pub fn clear_flags(&self, f: PageFlags) {
        debug_assert!(!f.contains(PageFlags::RMAP_LOCK));
        self.flags.fetch_and(!f.bits(), Ordering::Relaxed);
    }

    /// Atomically clear `f` and report whether any of its bits were set.
    pub fn test_and_clear_flags(&self, f: PageFlags) -> bool {
        debug_assert!(!f.contains(PageFlags::RMAP_LOCK));
        self.flags.fetch_and(!f.bits(), Ordering::Relaxed) & f.bits() != 0
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.flags().contains(PageFlags::RESERVED)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.flags().contains(PageFlags::LOCKED)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    pub fn set_dirty(&self) {
        self.set_flags(PageFlags::DIRTY);
    }

    pub fn set_referenced(&self) {
        self.set_flags(PageFlags::REFERENCED);
    }

    pub fn test_and_clear_referenced(&self) -> bool {
        self.test_and_clear_flags(PageFlags::REFERENCED)
    }

    /// Number of page-table entries currently mapping this page.
    ///
    /// Maintained under the store lock; the relaxed read is a snapshot for
    /// callers peeking from outside.
    #[must_use]
    pub fn map_count(&self) -> usize {
        self.mapcount.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.map_count() != 0
    }

    pub(crate) fn map_count_inc(&self) {
        self.mapcount.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn map_count_dec(&self) {
        let prev = self.mapcount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev != 0, "map count underflow");
    }

    /// Acquire the reverse-map store lock (lock (3) in the nesting order)
    /// and return the guard through which the store is reached.
    #[must_use]
    pub fn lock_rmap(&self) -> RmapGuard<'_> {
        BitSpin::lock(&self.flags, PageFlags::RMAP_LOCK.bits());
        RmapGuard { page: self }
    }
}

/// RAII witness that a page's reverse-map store lock is held.
///
/// Mutation stays crate-internal; the public surface is read-only
/// introspection used by callers making reclaim decisions and by tests
/// checking packing.
pub struct RmapGuard<'a> {
    page: &'a PageDescriptor,
}

impl<'a> RmapGuard<'a> {
    #[must_use]
    pub fn page(&self) -> &'a PageDescriptor {
        self.page
    }

    pub(crate) fn store(&self) -> &RmapStore {
        // Safety: the guard holds RMAP_LOCK for `page`.
        unsafe { &*self.page.store.get() }
    }

    pub(crate) fn store_mut(&mut self) -> &mut RmapStore {
        // Safety: the guard holds RMAP_LOCK for `page`.
        unsafe { &mut *self.page.store.get() }
    }

    /// No mappings recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.store(), RmapStore::Empty)
    }

    /// Exactly one mapping, stored inline.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self.store(), RmapStore::Direct(_))
    }

    /// The inline locator, when in direct mode.
    #[must_use]
    pub fn direct_locator(&self) -> Option<PteLocator> {
        match self.store() {
            RmapStore::Direct(loc) => Some(*loc),
            _ => None,
        }
    }

    /// Borrow the `n`-th chain node (0 = head), if the store has one.
    #[must_use]
    pub fn node(&self, n: usize) -> Option<&PteChain> {
        self.store().node(n)
    }

    /// Number of chain nodes (0 unless in chain mode).
    #[must_use]
    pub fn node_count(&self) -> usize {
        let mut n = 0;
        while self.node(n).is_some() {
            n += 1;
        }
        n
    }

    /// All locators currently stored, in scan order.
    pub fn locators(&self) -> impl Iterator<Item = PteLocator> + '_ {
        let (direct, node) = match self.store() {
            RmapStore::Empty => (None, None),
            RmapStore::Direct(loc) => (Some(*loc), None),
            RmapStore::Chain(head) => (None, Some(&**head)),
        };
        LocatorIter {
            direct,
            node,
            slot: 0,
        }
    }
}

impl Drop for RmapGuard<'_> {
    fn drop(&mut self) {
        // Safety: this guard acquired the bit in `lock_rmap`.
        unsafe { BitSpin::unlock(&self.page.flags, PageFlags::RMAP_LOCK.bits()) };
    }
}

struct LocatorIter<'a> {
    direct: Option<PteLocator>,
    node: Option<&'a PteChain>,
    slot: usize,
}

impl Iterator for LocatorIter<'_> {
    type Item = PteLocator;

    fn next(&mut self) -> Option<PteLocator> {
        if let Some(loc) = self.direct.take() {
            return Some(loc);
        }
        while let Some(node) = self.node {
            while self.slot < node.slots.len() {
                let slot = node.slots[self.slot];
                self.slot += 1;
                if slot.is_some() {
                    return slot;
                }
            }
            self.node = node.next.as_deref();
            self.slot = 0;
        }
        None
    }
}
