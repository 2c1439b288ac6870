//! Implementation of [`PageTableEntry`] and the four-level [`PageTable`] walker.

use crate::address::{PhysPageNum, VirtPageNum};
use crate::config::{PAGE_SIZE_BITS, PPN_WIDTH, PT_ENTRIES, PT_INDEX_BITS, PT_LEVELS};
use crate::error::VmError;
use crate::frame_allocator::{FrameTable, FrameTracker};
use alloc::{sync::Arc, vec, vec::Vec};
use bitflags::bitflags;
use core::fmt::{self, Debug, Formatter};

bitflags! {
    /// [`PageTableEntry`] flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PTEFlags: u64 {
        /// Present
        const P = 1 << 0;
        /// Writable
        const W = 1 << 3;
        /// User accessible
        const U = 1 << 4;
    }
}

const PPN_MASK: u64 = ((1 << PPN_WIDTH) - 1) << PAGE_SIZE_BITS;

/// Page Table Entry
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PageTableEntry {
    bits: u64,
}

impl PageTableEntry {
    /// Entry pointing at `ppn` with `flags`
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        Self {
            bits: (((ppn.0 as u64) << PAGE_SIZE_BITS) & PPN_MASK) | flags.bits(),
        }
    }

    /// The all-zero (absent) entry
    pub fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Raw 64-bit value
    pub fn bits(self) -> u64 {
        self.bits
    }

    /// Reinterpret a raw 64-bit value
    pub fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    /// Frame this entry points at
    pub fn ppn(self) -> PhysPageNum {
        PhysPageNum(((self.bits & PPN_MASK) >> PAGE_SIZE_BITS) as usize)
    }

    /// Permission bits, unknown bits dropped
    pub fn flags(self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits)
    }

    /// Whether the present bit is set
    pub fn is_present(self) -> bool {
        self.flags().contains(PTEFlags::P)
    }

    /// Whether the writable bit is set
    pub fn is_writable(self) -> bool {
        self.flags().contains(PTEFlags::W)
    }

    /// Whether the user bit is set
    pub fn is_user(self) -> bool {
        self.flags().contains(PTEFlags::U)
    }

    /// Same entry with the writable bit set or cleared
    #[must_use]
    pub fn with_writable(self, writable: bool) -> Self {
        if writable {
            Self::from_bits(self.bits | PTEFlags::W.bits())
        } else {
            Self::from_bits(self.bits & !PTEFlags::W.bits())
        }
    }

    /// Same flags, different frame
    #[must_use]
    pub fn with_ppn(self, ppn: PhysPageNum) -> Self {
        Self::new(ppn, self.flags())
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PTE:{:#x}({:?})", self.bits, self.flags()))
    }
}

/// Location of an entry: the table frame holding it and its index.
///
/// Callers both read and write leaf entries, so the walker hands out the
/// location rather than a copy of the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteSlot {
    /// Table frame holding the entry
    pub table: PhysPageNum,
    /// Index of the entry inside the table
    pub index: usize,
}

/// Page Table
/// - `root_ppn`: The physical page number of the top-level table
/// - `metadata_frames`: Physical frames for the page table itself and its directory entries
pub struct PageTable {
    root_ppn: PhysPageNum,
    metadata_frames: Vec<FrameTracker>,
    frames: Arc<FrameTable>,
}

impl PageTable {
    /// Allocate an empty top-level table
    pub fn new(frames: &Arc<FrameTable>) -> Result<Self, VmError> {
        let frame = FrameTracker::new(frames).ok_or(VmError::OutOfMemory)?;
        Ok(PageTable {
            root_ppn: frame.ppn,
            metadata_frames: vec![frame],
            frames: Arc::clone(frames),
        })
    }

    /// Top-level table frame
    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    /// Frame table backing this page table
    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    /// Number of frames holding this table's levels
    pub fn table_frame_count(&self) -> usize {
        self.metadata_frames.len()
    }

    /// Read the entry at `slot`
    pub fn read(&self, slot: PteSlot) -> PageTableEntry {
        PageTableEntry::from_bits(self.frames.read_word(slot.table, slot.index))
    }

    /// Overwrite the entry at `slot`
    pub fn write(&self, slot: PteSlot, pte: PageTableEntry) {
        self.frames.write_word(slot.table, slot.index, pte.bits());
    }

    /// Allocate a zeroed table frame owned by this page table
    pub fn alloc_table(&mut self) -> Result<PhysPageNum, VmError> {
        let frame = FrameTracker::new(&self.frames).ok_or(VmError::OutOfMemory)?;
        let ppn = frame.ppn;
        self.metadata_frames.push(frame);
        Ok(ppn)
    }

    /// Walk the four levels down to the leaf slot of `vpn`.
    ///
    /// With `allocate` set, missing intermediate tables are allocated and
    /// installed present, writable and user-accessible. Without it an absent
    /// intermediate entry fails with [`VmError::NotPresent`]. The leaf entry
    /// itself may still be absent.
    pub fn walk(&mut self, vpn: VirtPageNum, allocate: bool) -> Result<PteSlot, VmError> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;

        for &idx in &idxs[..PT_LEVELS - 1] {
            let slot = PteSlot { table: ppn, index: idx };
            let mut pte = self.read(slot);
            if !pte.is_present() {
                if !allocate {
                    return Err(VmError::NotPresent);
                }
                let table = self.alloc_table()?;
                pte = PageTableEntry::new(table, PTEFlags::P | PTEFlags::W | PTEFlags::U);
                self.write(slot, pte);
            }
            ppn = pte.ppn();
        }

        Ok(PteSlot {
            table: ppn,
            index: idxs[PT_LEVELS - 1],
        })
    }

    /// Walk without allocating
    pub fn find_pte(&self, vpn: VirtPageNum) -> Option<PteSlot> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;

        for &idx in &idxs[..PT_LEVELS - 1] {
            let pte = self.read(PteSlot { table: ppn, index: idx });
            if !pte.is_present() {
                return None;
            }
            ppn = pte.ppn();
        }

        Some(PteSlot {
            table: ppn,
            index: idxs[PT_LEVELS - 1],
        })
    }

    /// Translates a [`VirtPageNum`] to its leaf [`PageTableEntry`] if it is present.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(vpn)
            .map(|slot| self.read(slot))
            .filter(|pte| pte.is_present())
    }

    /// Every present leaf entry, in address order
    pub fn leaves(&self) -> Vec<(VirtPageNum, PteSlot, PageTableEntry)> {
        let mut found = Vec::new();
        // (table, level, vpn prefix)
        let mut stack = vec![(self.root_ppn, 0usize, 0usize)];

        while let Some((table, level, prefix)) = stack.pop() {
            for index in (0..PT_ENTRIES).rev() {
                let slot = PteSlot { table, index };
                let pte = self.read(slot);
                if !pte.is_present() {
                    continue;
                }
                let vpn = (prefix << PT_INDEX_BITS) | index;
                if level == PT_LEVELS - 1 {
                    found.push((VirtPageNum(vpn), slot, pte));
                } else {
                    stack.push((pte.ppn(), level + 1, vpn));
                }
            }
        }

        found.sort_by_key(|(vpn, _, _)| *vpn);
        found
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::VirtAddr;
    use crate::frame_allocator::Pool;

    #[test]
    fn entry_bit_layout() {
        let pte = PageTableEntry::new(PhysPageNum(0x12345), PTEFlags::P | PTEFlags::W | PTEFlags::U);
        assert_eq!(pte.bits(), 0x1234_5000 | 0x1 | 0x8 | 0x10);
        assert!(pte.is_present() && pte.is_writable() && pte.is_user());
        assert_eq!(pte.ppn(), PhysPageNum(0x12345));

        let ro = pte.with_writable(false);
        assert_eq!(ro.bits(), 0x1234_5000 | 0x11);
        assert_eq!(ro.with_ppn(PhysPageNum(7)).bits(), 0x7000 | 0x11);
    }

    #[test]
    fn walk_allocates_intermediate_levels_once() {
        let frames = FrameTable::new(8, 0);
        let mut pt = PageTable::new(&frames).unwrap();
        let vpn = VirtAddr(0x1_8000_0000).to_vpn_by_floor();

        assert_eq!(pt.walk(vpn, false), Err(VmError::NotPresent));
        assert!(pt.find_pte(vpn).is_none());

        let slot = pt.walk(vpn, true).unwrap();
        assert_eq!(pt.table_frame_count(), PT_LEVELS);
        assert_eq!(pt.walk(VirtPageNum(vpn.0 + 1), true).unwrap().table, slot.table);
        assert_eq!(pt.table_frame_count(), PT_LEVELS);
        assert_eq!(pt.find_pte(vpn), Some(slot));
        assert!(pt.translate(vpn).is_none());
    }

    #[test]
    fn walk_reports_exhausted_pool() {
        let frames = FrameTable::new(2, 0);
        let mut pt = PageTable::new(&frames).unwrap();
        assert_eq!(pt.walk(VirtPageNum(0), true), Err(VmError::OutOfMemory));
    }

    #[test]
    fn translate_and_scan_leaves() {
        let frames = FrameTable::new(8, 2);
        let mut pt = PageTable::new(&frames).unwrap();
        let user = frames.alloc(Pool::User).unwrap();
        let va = VirtAddr(0x7ff_0000_1000);
        let slot = pt.walk(va.to_vpn_by_floor(), true).unwrap();
        pt.write(slot, PageTableEntry::new(user, PTEFlags::P | PTEFlags::U));

        let pte = pt.translate(VirtAddr(va.0 + 0x42).to_vpn_by_floor()).unwrap();
        assert_eq!(pte.ppn(), user);
        assert!(pt.translate(VirtPageNum(va.to_vpn_by_floor().0 + 1)).is_none());

        let leaves = pt.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].0, va.to_vpn_by_floor());
        assert_eq!(leaves[0].2.ppn(), user);
    }

    #[test]
    fn dropping_table_frees_levels() {
        let frames = FrameTable::new(8, 0);
        {
            let mut pt = PageTable::new(&frames).unwrap();
            pt.walk(VirtPageNum(0x1234), true).unwrap();
            assert_eq!(frames.stats().table_frames, PT_LEVELS);
        }
        assert_eq!(frames.stats().table_frames, 0);
    }
}
