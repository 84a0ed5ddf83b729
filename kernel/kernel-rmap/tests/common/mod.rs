//! In-memory fake kernel for exercising the reverse map end to end.
//!
//! Locators encode an index into a flat page-table-entry array (offset by
//! one, since locators are nonzero). Each entry belongs to one of a fixed
//! set of fake mm contexts, each with its own real spin lock standing in for
//! the page-table lock, so lock contention can be staged from tests.

// Each test binary compiles its own copy and uses a different subset.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kernel_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_rmap::{
    ClearedEntry, MmContext, Owner, PageDescriptor, PteLocator, RmapHost, SwapSlot, VmaFlags,
};
use kernel_sync::SpinLock;

#[derive(Clone, Default)]
pub struct FakePte {
    pub present: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub swap_marker: Option<SwapSlot>,
}

pub struct FakeMm {
    page_table: SpinLock<()>,
    rss: AtomicUsize,
    vma: Mutex<Option<VmaFlags>>,
}

impl FakeMm {
    fn new() -> Self {
        Self {
            page_table: SpinLock::new(()),
            rss: AtomicUsize::new(0),
            vma: Mutex::new(Some(VmaFlags::empty())),
        }
    }

    pub fn rss(&self) -> usize {
        self.rss.load(Ordering::Relaxed)
    }

    /// Replace the flags of the single VMA covering all fake addresses.
    pub fn set_vma(&self, flags: Option<VmaFlags>) {
        *self.vma.lock().unwrap() = flags;
    }

    /// Hold the page-table lock for the returned guard's lifetime.
    pub fn hold_page_table(&self) -> impl Drop + '_ {
        self.page_table.lock()
    }
}

impl MmContext for FakeMm {
    fn try_with_page_table<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let guard = self.page_table.try_lock()?;
        let r = f();
        drop(guard);
        Some(r)
    }

    fn vma_at(&self, _address: VirtualAddress) -> Option<VmaFlags> {
        *self.vma.lock().unwrap()
    }

    fn rss_dec(&self) {
        self.rss.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct FakeHost {
    pub mms: Vec<FakeMm>,
    ptes: Mutex<Vec<(usize, FakePte)>>,
    swap_cache: Mutex<HashMap<u64, SwapSlot>>,
    swap_refs: Mutex<HashMap<u64, usize>>,
    pub fail_swap_duplicate: AtomicBool,
    released: AtomicUsize,
}

impl FakeHost {
    pub fn new(mm_count: usize) -> Self {
        Self {
            mms: (0..mm_count).map(|_| FakeMm::new()).collect(),
            ptes: Mutex::new(Vec::new()),
            swap_cache: Mutex::new(HashMap::new()),
            swap_refs: Mutex::new(HashMap::new()),
            fail_swap_duplicate: AtomicBool::new(false),
            released: AtomicUsize::new(0),
        }
    }

    /// Create a present entry in mm `mm_index` and hand back its locator.
    pub fn insert_pte(&self, mm_index: usize) -> PteLocator {
        assert!(mm_index < self.mms.len());
        let mut ptes = self.ptes.lock().unwrap();
        self.mms[mm_index].rss.fetch_add(1, Ordering::Relaxed);
        ptes.push((
            mm_index,
            FakePte {
                present: true,
                ..FakePte::default()
            },
        ));
        PteLocator::new(ptes.len() as u64).unwrap()
    }

    pub fn pte(&self, loc: PteLocator) -> FakePte {
        self.ptes.lock().unwrap()[Self::index(loc)].1.clone()
    }

    pub fn set_accessed(&self, loc: PteLocator) {
        self.ptes.lock().unwrap()[Self::index(loc)].1.accessed = true;
    }

    pub fn set_dirty(&self, loc: PteLocator) {
        self.ptes.lock().unwrap()[Self::index(loc)].1.dirty = true;
    }

    /// Enter the page into the fake swap cache at `slot`.
    pub fn add_to_swap(&self, page: &PageDescriptor, slot: SwapSlot) {
        self.swap_cache
            .lock()
            .unwrap()
            .insert(page.frame().as_u64(), slot);
    }

    pub fn swap_refs(&self, slot: SwapSlot) -> usize {
        self.swap_refs
            .lock()
            .unwrap()
            .get(&slot.as_u64())
            .copied()
            .unwrap_or(0)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    fn index(loc: PteLocator) -> usize {
        loc.as_u64() as usize - 1
    }
}

impl RmapHost for FakeHost {
    type Mm = FakeMm;

    fn owner(&self, loc: PteLocator) -> Owner<'_, FakeMm> {
        let mm_index = self.ptes.lock().unwrap()[Self::index(loc)].0;
        Owner {
            mm: &self.mms[mm_index],
            address: VirtualAddress::new(0x4000_0000 + loc.as_u64() * PAGE_SIZE),
        }
    }

    fn test_and_clear_accessed(&self, loc: PteLocator) -> bool {
        let mut ptes = self.ptes.lock().unwrap();
        std::mem::take(&mut ptes[Self::index(loc)].1.accessed)
    }

    fn clear_entry(&self, loc: PteLocator) -> ClearedEntry {
        let mut ptes = self.ptes.lock().unwrap();
        let pte = &mut ptes[Self::index(loc)].1;
        assert!(pte.present, "cleared an entry that was not present");
        pte.present = false;
        ClearedEntry { dirty: pte.dirty }
    }

    fn install_swap_marker(&self, loc: PteLocator, slot: SwapSlot) {
        let mut ptes = self.ptes.lock().unwrap();
        let pte = &mut ptes[Self::index(loc)].1;
        assert!(!pte.present, "swap marker over a present entry");
        pte.swap_marker = Some(slot);
    }

    fn swap_slot(&self, page: &PageDescriptor) -> Option<SwapSlot> {
        self.swap_cache
            .lock()
            .unwrap()
            .get(&page.frame().as_u64())
            .copied()
    }

    fn swap_duplicate(&self, slot: SwapSlot) -> bool {
        if self.fail_swap_duplicate.load(Ordering::Relaxed) {
            return false;
        }
        *self
            .swap_refs
            .lock()
            .unwrap()
            .entry(slot.as_u64())
            .or_insert(0) += 1;
        true
    }

    fn release_page(&self, _page: &PageDescriptor) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}
