//! The reverse-map operations: insert, remove, reference scan, batch unmap.
//!
//! ## Locking order
//!
//! 1. page-replacement list lock (caller)
//! 2. page lock (caller)
//! 3. the page's reverse-map store lock (taken here)
//! 4. owning mm context's page-table lock (**try only**, batch unmap)
//!
//! The fault path nests the other way around — it holds (4) first — which is
//! why (4) is never acquired blocking from here: a contended mapping is
//! skipped and reported as [`UnmapError::Again`] instead.

use crate::PteLocator;
use crate::chain::{CHAIN_SLOTS, ChainPool};
use crate::host::{MmContext, Owner, PageStats, RmapHost, VmaFlags};
use crate::page::{PageDescriptor, RmapGuard, RmapStore};

/// Why [`try_to_unmap`] could not remove every mapping of a page.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnmapError {
    /// At least one mapping was skipped because its page-table lock was
    /// contended. The store keeps those locators; the caller retries the
    /// whole page later.
    #[error("page-table lock contended, retry the page later")]
    Again,
    /// A mapping refuses eviction: its VMA is locked in memory, or the
    /// owning address space vanished mid-scan. The reclaim loop must pick a
    /// different page.
    #[error("page is pinned by one of its mappings")]
    Pinned,
    /// Swap-slot duplication failed — an unexpected condition; the affected
    /// mapping is left fully intact.
    #[error("swap slot duplication failed")]
    SwapSlot,
}

/// Record that a just-installed page-table entry maps `page`.
///
/// Reserved/unmanaged pages are ignored. The caller holds whatever protects
/// the entry itself; the store lock is taken here.
pub fn page_add_rmap(
    page: &PageDescriptor,
    loc: PteLocator,
    pool: &ChainPool,
    stats: &impl PageStats,
) {
    if page.is_reserved() {
        return;
    }
    let mut rmap = page.lock_rmap();
    let store = rmap.store_mut();
    match store {
        RmapStore::Empty => {
            *store = RmapStore::Direct(loc);
            stats.mapped_inc();
        }
        RmapStore::Direct(existing) => {
            // Second mapping: spill the inline locator into a fresh node.
            // Entries pack from the high end.
            let existing = *existing;
            let mut node = pool.alloc();
            node.slots[CHAIN_SLOTS - 1] = Some(existing);
            node.slots[CHAIN_SLOTS - 2] = Some(loc);
            *store = RmapStore::Chain(node);
            log::trace!("rmap: page {} spills direct -> chain", page.frame());
        }
        RmapStore::Chain(head) => {
            if head.is_full() {
                // New head; the old head, now second, is already full.
                let mut node = pool.alloc();
                node.slots[CHAIN_SLOTS - 1] = Some(loc);
                let old_head = core::mem::replace(head, node);
                head.next = Some(old_head);
            } else {
                let k = head
                    .lowest_occupied()
                    .expect("chain head must hold at least one locator");
                head.slots[k - 1] = Some(loc);
            }
        }
    }
    page.map_count_inc();
    stats.reverse_maps_inc();
}

/// Forget the mapping `loc` of `page`, before the entry's storage is reused.
///
/// Removing a locator that was never inserted is a caller bookkeeping bug
/// and trips a debug assertion; the store is left untouched in that case.
pub fn page_remove_rmap(
    page: &PageDescriptor,
    loc: PteLocator,
    pool: &ChainPool,
    stats: &impl PageStats,
) {
    if page.is_reserved() {
        return;
    }
    let mut rmap = page.lock_rmap();
    let removed = remove_locator(rmap.store_mut(), loc, pool);
    debug_assert!(removed, "rmap: {loc:?} not present in page {:?}", page.frame());
    if removed {
        page.map_count_dec();
        stats.reverse_maps_dec();
        if !page.is_mapped() {
            stats.mapped_dec();
        }
    }
}

/// Remove `target` from a store, keeping the packing invariants.
///
/// Chain mode compacts by pulling the head's lowest occupied slot (the
/// victim) into the hole; a drained head is popped on the spot.
fn remove_locator(store: &mut RmapStore, target: PteLocator, pool: &ChainPool) -> bool {
    match store {
        RmapStore::Empty => return false,
        RmapStore::Direct(cur) => {
            if *cur != target {
                return false;
            }
            *store = RmapStore::Empty;
            return true;
        }
        RmapStore::Chain(_) => {}
    }

    let mut hit = None;
    let mut n = 0;
    while let Some(node) = store.node(n) {
        if let Some(i) = node.slots().iter().position(|s| *s == Some(target)) {
            hit = Some((n, i));
            break;
        }
        n += 1;
    }
    let Some((n, i)) = hit else {
        return false;
    };

    let head = store.node(0).expect("chain store lost its head");
    let victim = head
        .lowest_occupied()
        .expect("chain head must hold at least one locator");
    let victim_loc = head.slots()[victim];

    store
        .node_mut(n)
        .expect("matched chain node vanished")
        .slots[i] = victim_loc;
    store
        .node_mut(0)
        .expect("chain store lost its head")
        .slots[victim] = None;

    if victim == CHAIN_SLOTS - 1 {
        // The victim was the head's only occupant; pop the drained head.
        let drained = store.pop_head();
        debug_assert!(drained.slots().iter().all(Option::is_none));
        pool.free(drained);
    }
    true
}

/// Count and clear the referenced state of every mapping of a page.
///
/// The caller holds the store lock and proves it by passing the guard. The
/// page's software referenced mark counts as one; each stored locator whose
/// hardware accessed bit test-and-clears to set counts as one more. A chain
/// that turns out to hold a single locator is collapsed back to direct mode
/// on the way through, so single-mapping pages stay cheap to re-scan.
pub fn page_referenced<H: RmapHost>(
    rmap: &mut RmapGuard<'_>,
    host: &H,
    pool: &ChainPool,
) -> usize {
    let mut referenced = usize::from(rmap.page().test_and_clear_referenced());

    if rmap.is_empty() {
        return referenced;
    }
    if let Some(loc) = rmap.direct_locator() {
        if host.test_and_clear_accessed(loc) {
            referenced += 1;
        }
        return referenced;
    }

    let mut visited = 0usize;
    let mut last = None;
    let mut n = 0;
    while let Some(node) = rmap.node(n) {
        // Occupied slots sit contiguously at the high end; stop at the
        // first hole.
        for slot in node.slots().iter().rev() {
            let Some(loc) = *slot else { break };
            if host.test_and_clear_accessed(loc) {
                referenced += 1;
            }
            visited += 1;
            last = Some(loc);
        }
        n += 1;
    }

    if visited == 1 {
        let sole = last.expect("visited one locator but recorded none");
        let head = rmap.store_mut().pop_head();
        pool.free(head);
        *rmap.store_mut() = RmapStore::Direct(sole);
        log::trace!(
            "rmap: page {} collapses chain -> direct",
            rmap.page().frame()
        );
    }
    referenced
}

/// Tear down every mapping of `page`, replacing swap-cache mappings with
/// swap markers.
///
/// The caller holds the replacement-list lock and the page lock. Mappings
/// whose page-table lock is contended are skipped and kept ([`UnmapError::Again`]);
/// a pinned mapping or a swap bookkeeping failure aborts the walk
/// immediately, leaving the not-yet-visited mappings in place. The store is
/// consistent on every exit path.
pub fn try_to_unmap<H: RmapHost>(
    page: &PageDescriptor,
    host: &H,
    pool: &ChainPool,
    stats: &impl PageStats,
) -> Result<(), UnmapError> {
    debug_assert!(!page.is_reserved(), "reserved pages never reach reclaim");
    debug_assert!(page.is_locked(), "caller must hold the page lock");

    let mut rmap = page.lock_rmap();
    debug_assert!(!rmap.is_empty(), "unmap of a page with no mappings");

    let mut contended = false;

    if let Some(loc) = rmap.direct_locator() {
        match try_to_unmap_one(page, host, loc) {
            Ok(()) => {
                *rmap.store_mut() = RmapStore::Empty;
                page.map_count_dec();
                stats.reverse_maps_dec();
            }
            Err(UnmapError::Again) => contended = true,
            Err(err) => return Err(err),
        }
    } else {
        // Chain walk, front to back. Successful slots are compacted out by
        // pulling the head's victim slot into the hole, so non-head nodes
        // stay full and only the head ever drains and pops. `victim` always
        // names the head's lowest occupied slot.
        let mut n = 0;
        let mut i = 0;
        let mut victim = rmap
            .node(0)
            .expect("chain store lost its head")
            .lowest_occupied()
            .expect("chain head must hold at least one locator");
        loop {
            let Some(node) = rmap.node(n) else { break };
            if let Some(loc) = node.slots()[i] {
                match try_to_unmap_one(page, host, loc) {
                    Ok(()) => {
                        let victim_loc =
                            rmap.node(0).expect("chain store lost its head").slots()[victim];
                        let store = rmap.store_mut();
                        store
                            .node_mut(n)
                            .expect("scanned chain node vanished")
                            .slots[i] = victim_loc;
                        store
                            .node_mut(0)
                            .expect("chain store lost its head")
                            .slots[victim] = None;
                        page.map_count_dec();
                        stats.reverse_maps_dec();

                        victim += 1;
                        if victim == CHAIN_SLOTS {
                            // Head fully drained: pop it and rescan from the
                            // promoted node, which is full by construction.
                            pool.free(rmap.store_mut().pop_head());
                            victim = 0;
                            if n == 0 {
                                if rmap.is_empty() {
                                    break;
                                }
                                i = 0;
                                continue;
                            }
                            n -= 1;
                        }
                    }
                    Err(UnmapError::Again) => contended = true,
                    Err(err) => return Err(err),
                }
            }
            i += 1;
            if i == CHAIN_SLOTS {
                i = 0;
                n += 1;
            }
        }
    }

    if rmap.is_empty() {
        stats.mapped_dec();
    }
    if contended {
        log::trace!("rmap: page {} unmap contended, retry later", page.frame());
        return Err(UnmapError::Again);
    }
    Ok(())
}

/// Tear down a single mapping under its owning context's page-table lock.
fn try_to_unmap_one<H: RmapHost>(
    page: &PageDescriptor,
    host: &H,
    loc: PteLocator,
) -> Result<(), UnmapError> {
    let Owner { mm, address } = host.owner(loc);
    let attempt = mm.try_with_page_table(|| {
        let Some(vma) = mm.vma_at(address) else {
            // Address-space teardown raced the scan.
            return Err(UnmapError::Pinned);
        };
        if vma.contains(VmaFlags::LOCKED) {
            return Err(UnmapError::Pinned);
        }

        // Register the extra swap reference before touching the entry, so a
        // bad slot leaves the mapping intact.
        let swap = host.swap_slot(page);
        if let Some(slot) = swap {
            if !host.swap_duplicate(slot) {
                return Err(UnmapError::SwapSlot);
            }
        }

        let cleared = host.clear_entry(loc);
        if let Some(slot) = swap {
            // Leave a breadcrumb so a later fault can restore the mapping
            // before the page is written out.
            host.install_swap_marker(loc, slot);
        }
        if cleared.dirty {
            page.set_dirty();
        }
        mm.rss_dec();
        host.release_page(page);
        Ok(())
    });
    attempt.unwrap_or(Err(UnmapError::Again))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PageStats;
    use core::num::NonZeroU64;
    use kernel_addresses::PhysicalAddress;

    struct NullStats;

    impl PageStats for NullStats {
        fn mapped_inc(&self) {}
        fn mapped_dec(&self) {}
        fn reverse_maps_inc(&self) {}
        fn reverse_maps_dec(&self) {}
    }

    fn loc(v: u64) -> PteLocator {
        PteLocator::from_nonzero(NonZeroU64::new(v).unwrap())
    }

    fn page() -> PageDescriptor {
        PageDescriptor::new(PhysicalAddress::new(0x4_2000))
    }

    #[test]
    fn first_mapping_goes_direct() {
        let page = page();
        let pool = ChainPool::new();
        page_add_rmap(&page, loc(0x10), &pool, &NullStats);

        let guard = page.lock_rmap();
        assert!(guard.is_direct());
        assert_eq!(guard.direct_locator(), Some(loc(0x10)));
        assert_eq!(page.map_count(), 1);
    }

    #[test]
    fn second_mapping_spills_to_chain() {
        let page = page();
        let pool = ChainPool::new();
        page_add_rmap(&page, loc(0x10), &pool, &NullStats);
        page_add_rmap(&page, loc(0x20), &pool, &NullStats);

        let guard = page.lock_rmap();
        assert!(!guard.is_direct());
        assert_eq!(guard.node_count(), 1);
        let slots = guard.node(0).unwrap().slots();
        assert_eq!(slots[CHAIN_SLOTS - 1], Some(loc(0x10)));
        assert_eq!(slots[CHAIN_SLOTS - 2], Some(loc(0x20)));
        assert!(slots[..CHAIN_SLOTS - 2].iter().all(Option::is_none));
    }

    #[test]
    fn eighth_mapping_grows_a_second_node() {
        // Scenario: CHAIN_SLOTS + 1 inserts -> two nodes, the non-head node
        // full, the head holding exactly one locator at the top index.
        let page = page();
        let pool = ChainPool::new();
        for v in 1..=(CHAIN_SLOTS as u64 + 1) {
            page_add_rmap(&page, loc(v), &pool, &NullStats);
        }

        let guard = page.lock_rmap();
        assert_eq!(guard.node_count(), 2);
        let head = guard.node(0).unwrap();
        assert_eq!(head.slots()[CHAIN_SLOTS - 1], Some(loc(CHAIN_SLOTS as u64 + 1)));
        assert!(head.slots()[..CHAIN_SLOTS - 1].iter().all(Option::is_none));
        assert!(guard.node(1).unwrap().slots().iter().all(Option::is_some));
        assert_eq!(page.map_count(), CHAIN_SLOTS + 1);
    }

    #[test]
    fn reserved_pages_are_ignored() {
        let page = PageDescriptor::new_reserved(PhysicalAddress::new(0x1000));
        let pool = ChainPool::new();
        page_add_rmap(&page, loc(0x10), &pool, &NullStats);
        assert_eq!(page.map_count(), 0);
        assert!(page.lock_rmap().is_empty());
    }

    #[test]
    fn direct_removal_empties_the_store() {
        let page = page();
        let pool = ChainPool::new();
        page_add_rmap(&page, loc(0x10), &pool, &NullStats);
        page_remove_rmap(&page, loc(0x10), &pool, &NullStats);

        assert!(page.lock_rmap().is_empty());
        assert_eq!(page.map_count(), 0);
    }

    #[test]
    fn chain_removal_compacts_from_the_head() {
        let page = page();
        let pool = ChainPool::new();
        for v in 1..=3 {
            page_add_rmap(&page, loc(v), &pool, &NullStats);
        }
        // slots: [.., 3, 2, 1]; remove the deepest entry and expect the
        // head victim (3) to take its place.
        page_remove_rmap(&page, loc(1), &pool, &NullStats);

        let guard = page.lock_rmap();
        let slots = guard.node(0).unwrap().slots();
        assert_eq!(slots[CHAIN_SLOTS - 1], Some(loc(3)));
        assert_eq!(slots[CHAIN_SLOTS - 2], Some(loc(2)));
        assert!(slots[..CHAIN_SLOTS - 2].iter().all(Option::is_none));
        assert_eq!(page.map_count(), 2);
    }

    #[test]
    fn draining_a_head_node_pops_it() {
        let page = page();
        let pool = ChainPool::new();
        for v in 1..=(CHAIN_SLOTS as u64 + 1) {
            page_add_rmap(&page, loc(v), &pool, &NullStats);
        }
        // The head holds only the newest locator; removing it must free the
        // head and promote the full node.
        page_remove_rmap(&page, loc(CHAIN_SLOTS as u64 + 1), &pool, &NullStats);

        let guard = page.lock_rmap();
        assert_eq!(guard.node_count(), 1);
        assert!(guard.node(0).unwrap().slots().iter().all(Option::is_some));
        assert_eq!(page.map_count(), CHAIN_SLOTS);
    }

    #[test]
    fn removing_the_last_chain_entry_empties_the_store() {
        let page = page();
        let pool = ChainPool::new();
        page_add_rmap(&page, loc(1), &pool, &NullStats);
        page_add_rmap(&page, loc(2), &pool, &NullStats);
        page_remove_rmap(&page, loc(1), &pool, &NullStats);
        page_remove_rmap(&page, loc(2), &pool, &NullStats);

        assert!(page.lock_rmap().is_empty());
        assert_eq!(page.map_count(), 0);
    }

    #[test]
    fn insert_then_remove_restores_prior_state() {
        let page = page();
        let pool = ChainPool::new();
        for v in 1..=4 {
            page_add_rmap(&page, loc(v), &pool, &NullStats);
        }
        let before: Vec<_> = {
            let guard = page.lock_rmap();
            guard.node(0).unwrap().slots().to_vec()
        };

        page_add_rmap(&page, loc(99), &pool, &NullStats);
        page_remove_rmap(&page, loc(99), &pool, &NullStats);

        let guard = page.lock_rmap();
        assert_eq!(guard.node(0).unwrap().slots().to_vec(), before);
    }
}
