//! Address-space duplication with copy-on-write sharing.

use crate::address::{VPNRange, VirtPageNum};
use crate::config::PT_LEVELS;
use crate::error::VmError;
use crate::memory_set::MemorySet;
use crate::page_table::{PageTableEntry, PteSlot};
use alloc::{sync::Arc, vec::Vec};
use log::{info, trace};

impl MemorySet {
    /// Duplicate this address space for a child process.
    ///
    /// Every mapped page of the fixed segments and the regions ends up
    /// read-only in both address spaces, pointing at the same frame with one
    /// more reference. Page-table levels are copied, never shared. On
    /// failure the partial child is dropped and gives back what it took.
    pub fn fork(&mut self) -> Result<MemorySet, VmError> {
        let frames = Arc::clone(self.frames());
        let mut child = MemorySet::new_bare(&frames, self.segments)?;
        child.areas = self.areas.clone();

        let ranges: Vec<VPNRange> = self
            .segments
            .iter()
            .map(|seg| seg.populated_range())
            .chain(
                self.areas
                    .iter()
                    .filter(|area| !area.is_reserved())
                    .map(|area| area.vpn_range()),
            )
            .collect();

        let mut shared = 0;
        for range in ranges {
            for vpn in range {
                if self.share_page(&mut child, vpn)? {
                    shared += 1;
                }
            }
        }

        info!(
            "fork: {} regions, {shared} pages shared, child uses {} table frames",
            child.areas.len(),
            child.page_table.table_frame_count()
        );
        Ok(child)
    }

    /// Copy the table path of `vpn` into `child` and share its leaf frame.
    /// Returns whether a present leaf was found.
    fn share_page(&mut self, child: &mut MemorySet, vpn: VirtPageNum) -> Result<bool, VmError> {
        let idxs = vpn.indexes();
        let mut parent_table = self.page_table.root_ppn();
        let mut child_table = child.page_table.root_ppn();

        for &idx in &idxs[..PT_LEVELS - 1] {
            let parent_pte = self.page_table.read(PteSlot {
                table: parent_table,
                index: idx,
            });
            if !parent_pte.is_present() {
                return Ok(false);
            }
            let child_slot = PteSlot {
                table: child_table,
                index: idx,
            };
            let mut child_pte = child.page_table.read(child_slot);
            if !child_pte.is_present() {
                let table = child.page_table.alloc_table()?;
                child_pte = PageTableEntry::new(table, parent_pte.flags());
                child.page_table.write(child_slot, child_pte);
            }
            parent_table = parent_pte.ppn();
            child_table = child_pte.ppn();
        }

        let index = idxs[PT_LEVELS - 1];
        let parent_slot = PteSlot {
            table: parent_table,
            index,
        };
        let pte = self.page_table.read(parent_slot);
        if !pte.is_present() {
            return Ok(false);
        }

        let shared = pte.with_writable(false);
        self.frames().get(pte.ppn());
        self.page_table.write(parent_slot, shared);
        child.page_table.write(
            PteSlot {
                table: child_table,
                index,
            },
            shared,
        );
        if pte.is_writable() {
            self.tlb.flush_page(vpn);
        }
        trace!("share {vpn:?} -> {:?}", pte.ppn());
        Ok(true)
    }
}
