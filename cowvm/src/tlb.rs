//! Software translation cache.
//!
//! Holds recently used leaf entries per virtual page. Anything that rewrites
//! a leaf entry must call [`Tlb::flush_page`] for that page, otherwise the
//! emulated user accesses keep seeing the stale translation.

use crate::address::VirtPageNum;
use crate::page_table::PageTableEntry;
use alloc::collections::BTreeMap;

/// Entries kept before the oldest-by-address entry is evicted
const TLB_CAPACITY: usize = 64;

/// Per-address-space translation cache
#[derive(Default)]
pub struct Tlb {
    entries: BTreeMap<VirtPageNum, PageTableEntry>,
    flushes: usize,
}

impl Tlb {
    /// An empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached leaf entry for `vpn`
    pub fn lookup(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.entries.get(&vpn).copied()
    }

    /// Remember the leaf entry for `vpn`
    pub fn fill(&mut self, vpn: VirtPageNum, pte: PageTableEntry) {
        if self.entries.len() >= TLB_CAPACITY && !self.entries.contains_key(&vpn) {
            self.entries.pop_first();
        }
        self.entries.insert(vpn, pte);
    }

    /// Forget the translation of one page (`invlpg`)
    pub fn flush_page(&mut self, vpn: VirtPageNum) {
        self.entries.remove(&vpn);
        self.flushes += 1;
    }

    /// Number of single-page invalidations so far
    pub fn flush_count(&self) -> usize {
        self.flushes
    }
}
