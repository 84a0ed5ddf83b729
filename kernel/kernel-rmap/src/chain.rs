//! Chain nodes and their slab-style pool.
//!
//! A [`PteChain`] packs as many locator slots as fit in one cache line next
//! to the `next` pointer, so walking a page's mappings touches the minimum
//! number of lines. Nodes are recycled through [`ChainPool`] rather than
//! round-tripping the global allocator on every fork/exit storm.

use crate::PteLocator;
use alloc::boxed::Box;
use kernel_sync::SpinLock;

/// Assumed cache-line size for node packing.
const CACHE_LINE: usize = 64;

/// Locator slots per chain node: one cache line minus the `next` pointer,
/// in 8-byte slots.
pub const CHAIN_SLOTS: usize = (CACHE_LINE - size_of::<usize>()) / size_of::<u64>();

/// Free nodes kept cached in the pool; beyond this they go back to the heap.
const POOL_HIGH_WATER: usize = 64;

/// One node of a page's reverse-map chain.
///
/// Slot packing invariants (restored by every public rmap operation):
/// - every node except the list head is completely full;
/// - in the head, occupied slots are contiguous at the **high**-index end,
///   free slots at the low end.
///
/// Entries therefore fill from `CHAIN_SLOTS - 1` downwards, and the head is
/// full exactly when `slots[0]` is occupied.
pub struct PteChain {
    pub(crate) next: Option<Box<PteChain>>,
    pub(crate) slots: [Option<PteLocator>; CHAIN_SLOTS],
}

#[cfg(target_pointer_width = "64")]
const _: () = assert!(size_of::<PteChain>() == CACHE_LINE);

impl PteChain {
    pub(crate) const fn empty() -> Self {
        Self {
            next: None,
            slots: [None; CHAIN_SLOTS],
        }
    }

    /// Index of the lowest occupied slot, if any.
    pub(crate) fn lowest_occupied(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_some)
    }

    /// A full node has no free slot left at the low end.
    pub(crate) fn is_full(&self) -> bool {
        self.slots[0].is_some()
    }

    /// Clear all slots and unlink from any list.
    pub(crate) fn reset(&mut self) {
        self.next = None;
        self.slots = [None; CHAIN_SLOTS];
    }

    #[must_use]
    pub fn slots(&self) -> &[Option<PteLocator>; CHAIN_SLOTS] {
        &self.slots
    }

    #[must_use]
    pub fn next(&self) -> Option<&Self> {
        self.next.as_deref()
    }
}

/// Fixed-size recycler for [`PteChain`] nodes.
///
/// Freed nodes are cached on an intrusive free list (linked through their own
/// `next` field) up to a watermark. Allocation never fails: when the cache is
/// empty the node comes from the global allocator, whose memory-pressure
/// handling lives above this layer.
///
/// The pool's own lock is the only lock taken here, so both operations may be
/// called while holding a page's reverse-map lock.
pub struct ChainPool {
    free: SpinLock<FreeList>,
}

struct FreeList {
    head: Option<Box<PteChain>>,
    len: usize,
}

impl ChainPool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free: SpinLock::new(FreeList { head: None, len: 0 }),
        }
    }

    /// Produce a node with all slots empty and no successor.
    #[must_use]
    pub fn alloc(&self) -> Box<PteChain> {
        let cached = self.free.with_lock(|fl| {
            fl.head.take().map(|mut node| {
                fl.head = node.next.take();
                fl.len -= 1;
                node
            })
        });
        cached.unwrap_or_else(|| Box::new(PteChain::empty()))
    }

    /// Return a node to the pool.
    pub fn free(&self, mut node: Box<PteChain>) {
        node.reset();
        let overflow = self.free.with_lock(|fl| {
            if fl.len < POOL_HIGH_WATER {
                node.next = fl.head.take();
                fl.head = Some(node);
                fl.len += 1;
                None
            } else {
                Some(node)
            }
        });
        drop(overflow);
    }

    /// Number of nodes currently cached.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.free.with_lock(|fl| fl.len)
    }
}

impl Default for ChainPool {
    fn default() -> Self {
        Self::new()
    }
}
