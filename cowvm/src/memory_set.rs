//! Implementation of [`Segment`] and [`MemorySet`].

use crate::address::{page_round_up, PhysAddr, PhysPageNum, VPNRange, VirtAddr, VirtPageNum};
use crate::config::{
    CODE_END, CODE_START, DATA_END, DATA_START, HEAP_END, HEAP_START, MAX_MAP_LENGTH,
    MAX_MM_SEGS, MMAP_AREA_END, MMAP_AREA_START, PAGE_SIZE, STACK_END, STACK_SIZE, VA_WIDTH,
};
use crate::error::{FatalFault, VmError};
use crate::fault::FaultCode;
use crate::frame_allocator::{FrameStats, FrameTable};
use crate::map_area::{MapArea, MapPermission, RegionMap};
use crate::page_table::{PageTable, PageTableEntry};
use crate::tlb::Tlb;
use alloc::sync::Arc;
use log::{debug, trace};

/// Faults taken by one emulated user access before giving up
const MAX_FAULTS_PER_ACCESS: usize = 3;

/// Fixed segments every process carries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    /// Program text
    Code = 0,
    /// Initialised data
    Data = 1,
    /// brk-managed heap
    Heap = 2,
    /// User stack
    Stack = 3,
}

/// A fixed segment outside the region map
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    kind: SegmentKind,
    start: VirtAddr,
    next_free: VirtAddr,
    end: VirtAddr,
    perm: MapPermission,
}

impl Segment {
    fn new(kind: SegmentKind, start: usize, end: usize, perm: MapPermission) -> Self {
        Self {
            kind,
            start: VirtAddr(start),
            next_free: VirtAddr(start),
            end: VirtAddr(end),
            perm,
        }
    }

    /// Which segment this is
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// First byte of the segment
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Current growth boundary
    pub fn next_free(&self) -> VirtAddr {
        self.next_free
    }

    /// Growth limit
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Access mask
    pub fn perm(&self) -> MapPermission {
        self.perm
    }

    /// Pages that may hold mappings: up to `next_free`, or the whole stack
    pub fn populated_range(&self) -> VPNRange {
        match self.kind {
            SegmentKind::Stack => VPNRange::from_va(self.start, self.end),
            _ => VPNRange::from_va(self.start, self.next_free),
        }
    }

    /// Whether `va` lies inside the populated range
    pub fn contains(&self, va: VirtAddr) -> bool {
        let range = self.populated_range();
        range.start() <= va.to_vpn_by_floor() && va.to_vpn_by_floor() < range.end()
    }
}

/// Snapshot of an address space's resource usage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Areas in the region map, the reserved one included
    pub regions: usize,
    /// Present leaf entries
    pub resident_pages: usize,
    /// Frames holding this address space's page tables
    pub table_frames: usize,
    /// Single-page translation invalidations so far
    pub tlb_flushes: usize,
    /// Frames in use across every address space
    pub frames: FrameStats,
}

/// The address space of one process: page table, fixed segments and the
/// map of variable regions.
pub struct MemorySet {
    pub(crate) page_table: PageTable,
    pub(crate) areas: RegionMap,
    pub(crate) segments: [Segment; MAX_MM_SEGS],
    pub(crate) tlb: Tlb,
}

impl MemorySet {
    pub(crate) fn new_bare(
        frames: &Arc<FrameTable>,
        segments: [Segment; MAX_MM_SEGS],
    ) -> Result<Self, VmError> {
        Ok(Self {
            page_table: PageTable::new(frames)?,
            areas: RegionMap::new(),
            segments,
            tlb: Tlb::new(),
        })
    }

    /// Create an empty address space with the default segment layout.
    ///
    /// Code, data and heap start with nothing populated; the stack spans
    /// `STACK_SIZE` bytes below `STACK_END`.
    pub fn new_user(frames: &Arc<FrameTable>) -> Result<Self, VmError> {
        let rw = MapPermission::R | MapPermission::W;
        let segments = [
            Segment::new(SegmentKind::Code, CODE_START, CODE_END, MapPermission::R),
            Segment::new(SegmentKind::Data, DATA_START, DATA_END, rw),
            Segment::new(SegmentKind::Heap, HEAP_START, HEAP_END, rw),
            Segment::new(SegmentKind::Stack, STACK_END - STACK_SIZE, STACK_END, rw),
        ];
        Self::new_bare(frames, segments)
    }

    /// Physical page number of the top-level table
    pub fn root_ppn(&self) -> PhysPageNum {
        self.page_table.root_ppn()
    }

    /// Frame table backing this address space
    pub fn frames(&self) -> &Arc<FrameTable> {
        self.page_table.frames()
    }

    /// The region map
    pub fn areas(&self) -> &RegionMap {
        &self.areas
    }

    /// One fixed segment
    pub fn segment(&self, kind: SegmentKind) -> &Segment {
        &self.segments[kind as usize]
    }

    /// Present leaf entry mapping `va`, bypassing the translation cache
    pub fn leaf(&self, va: VirtAddr) -> Option<PageTableEntry> {
        self.page_table.translate(va.to_vpn_by_floor())
    }

    /// Resource usage of this address space
    pub fn stats(&self) -> Stats {
        Stats {
            regions: self.areas.len(),
            resident_pages: self.page_table.leaves().len(),
            table_frames: self.page_table.table_frame_count(),
            tlb_flushes: self.tlb.flush_count(),
            frames: self.frames().stats(),
        }
    }

    /// Move the growth boundary of a code, data or heap segment.
    ///
    /// Pages above a lowered boundary are released.
    pub fn set_segment_limit(
        &mut self,
        kind: SegmentKind,
        next_free: VirtAddr,
    ) -> Result<(), VmError> {
        let seg = self.segments[kind as usize];
        let next_free = VirtAddr(page_round_up(next_free.0));
        if kind == SegmentKind::Stack || next_free < seg.start || next_free > seg.end {
            return Err(VmError::InvalidArgument);
        }
        if next_free < seg.next_free {
            self.release_range(VPNRange::from_va(next_free, seg.next_free));
        }
        debug!("{kind:?} segment boundary {:?} -> {next_free:?}", seg.next_free);
        self.segments[kind as usize].next_free = next_free;
        Ok(())
    }

    fn check_length(len: usize) -> Result<usize, VmError> {
        if len == 0 || len > MAX_MAP_LENGTH {
            return Err(VmError::InvalidArgument);
        }
        Ok(page_round_up(len))
    }

    fn check_range_start(addr: VirtAddr) -> Result<(), VmError> {
        if addr.0 == 0 || !addr.is_aligned() {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }

    /// Validate a user range and return its page-rounded end.
    /// The end may not wrap nor leave the virtual address space.
    fn check_range(addr: VirtAddr, len: usize) -> Result<VirtAddr, VmError> {
        Self::check_range_start(addr)?;
        let len = Self::check_length(len)?;
        match addr.0.checked_add(len) {
            Some(end) if end <= 1 << VA_WIDTH => Ok(VirtAddr(end)),
            _ => Err(VmError::InvalidArgument),
        }
    }

    fn ensure_sentinel(&mut self) {
        if self.areas.is_empty() {
            self.areas
                .insert_and_merge(MapArea::reserved(VirtAddr(MMAP_AREA_START)));
        }
    }

    fn fits_at(&self, addr: VirtAddr, len: usize) -> bool {
        addr.is_aligned()
            && addr.0 >= MMAP_AREA_START
            && addr.0 + len <= MMAP_AREA_END
            && !self.areas.overlaps(addr, VirtAddr(addr.0 + len))
    }

    /// Create a region of `len` bytes with mask `perm`.
    ///
    /// With `fixed` the region is placed exactly at `hint`. Otherwise a
    /// non-zero `hint` is tried first and the first gap large enough is used
    /// when it does not fit. No frame is allocated here.
    ///
    /// # Returns
    /// The start of the new region
    pub fn mmap(
        &mut self,
        hint: VirtAddr,
        len: usize,
        perm: MapPermission,
        fixed: bool,
    ) -> Result<VirtAddr, VmError> {
        let len = Self::check_length(len)?;
        if !perm.is_user_mask() {
            return Err(VmError::InvalidArgument);
        }
        if hint.0 != 0 && !(MMAP_AREA_START..MMAP_AREA_END).contains(&hint.0) {
            return Err(VmError::InvalidArgument);
        }
        if fixed {
            Self::check_range_start(hint)?;
        }

        self.ensure_sentinel();

        let start = if hint.0 != 0 && self.fits_at(hint, len) {
            hint
        } else if fixed {
            return Err(VmError::InvalidArgument);
        } else {
            self.areas
                .first_fit(len, VirtAddr(MMAP_AREA_END))
                .ok_or(VmError::InvalidArgument)?
        };

        let start = self
            .areas
            .insert_and_merge(MapArea::new(start, VirtAddr(start.0 + len), perm));
        debug!("mmap {len:#x} bytes {perm:?} at {start:?}");
        Ok(start)
    }

    /// Remove `[addr, addr + len)` from every region it touches and release
    /// the pages mapped there.
    pub fn munmap(&mut self, addr: VirtAddr, len: usize) -> Result<(), VmError> {
        let end = Self::check_range(addr, len)?;

        for range in self.areas.remove_range(addr, end) {
            self.release_range(range);
        }
        Ok(())
    }

    /// Give `[addr, addr + len)` the mask `perm` and update the writable bit
    /// of every populated page whose mask changed.
    pub fn mprotect(
        &mut self,
        addr: VirtAddr,
        len: usize,
        perm: MapPermission,
    ) -> Result<(), VmError> {
        let end = Self::check_range(addr, len)?;
        if !perm.is_user_mask() {
            return Err(VmError::InvalidArgument);
        }

        for range in self.areas.protect_range(addr, end, perm) {
            self.modify_range(range, perm);
        }
        Ok(())
    }

    /// Clear every present leaf in `range`, dropping one reference per frame
    fn release_range(&mut self, range: VPNRange) {
        let frames = Arc::clone(self.frames());
        for vpn in range {
            let Some(slot) = self.page_table.find_pte(vpn) else {
                continue;
            };
            let pte = self.page_table.read(slot);
            if !pte.is_present() {
                continue;
            }
            let remaining = frames.put(pte.ppn());
            self.page_table.write(slot, PageTableEntry::empty());
            self.tlb.flush_page(vpn);
            trace!("release {vpn:?} -> {:?}, {remaining} refs left", pte.ppn());
        }
    }

    /// Apply `perm` to every present leaf in `range`.
    ///
    /// A shared frame never becomes writable here; the next write to it takes
    /// the copy-on-write path.
    fn modify_range(&mut self, range: VPNRange, perm: MapPermission) {
        let frames = Arc::clone(self.frames());
        for vpn in range {
            let Some(slot) = self.page_table.find_pte(vpn) else {
                continue;
            };
            let pte = self.page_table.read(slot);
            if !pte.is_present() {
                continue;
            }
            let writable = perm.contains(MapPermission::W) && frames.refcount(pte.ppn()) == 1;
            self.page_table.write(slot, pte.with_writable(writable));
            self.tlb.flush_page(vpn);
            trace!("protect {vpn:?} writable={writable}");
        }
    }

    fn cached_translation(&mut self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        if let Some(pte) = self.tlb.lookup(vpn) {
            return Some(pte);
        }
        let pte = self.page_table.translate(vpn)?;
        self.tlb.fill(vpn, pte);
        Some(pte)
    }

    /// Translate `va` as a user access would, through the translation cache.
    /// Does not fault.
    pub fn translate(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        let pte = self.cached_translation(va.to_vpn_by_floor())?;
        let aligned_pa: PhysAddr = pte.ppn().into();
        Some(PhysAddr(aligned_pa.0 + va.page_offset()))
    }

    /// Resolve the frame behind `va` for a user read or write, taking page
    /// faults until the access is permitted.
    fn user_frame(
        &mut self,
        va: VirtAddr,
        write: bool,
    ) -> Result<PhysPageNum, VmError> {
        let vpn = va.to_vpn_by_floor();
        for _ in 0..MAX_FAULTS_PER_ACCESS {
            let mut code = FaultCode::USER;
            if write {
                code |= FaultCode::WRITE;
            }
            match self.cached_translation(vpn) {
                Some(pte) if pte.is_user() && (!write || pte.is_writable()) => {
                    return Ok(pte.ppn());
                }
                Some(_) => code |= FaultCode::PRESENT,
                None => {}
            }
            self.handle_page_fault(va, code)?;
        }
        Err(FatalFault::Unserviceable.into())
    }

    /// Store `data` at `va` as user code would
    pub fn copy_to_user(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let cur = VirtAddr(va.0 + done);
            let chunk = (PAGE_SIZE - cur.page_offset()).min(data.len() - done);
            let ppn = self.user_frame(cur, true)?;
            self.frames()
                .write_bytes(ppn, cur.page_offset(), &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Load `buf.len()` bytes at `va` as user code would
    pub fn copy_from_user(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = VirtAddr(va.0 + done);
            let chunk = (PAGE_SIZE - cur.page_offset()).min(buf.len() - done);
            let ppn = self.user_frame(cur, false)?;
            self.frames()
                .read_bytes(ppn, cur.page_offset(), &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }
}

impl Drop for MemorySet {
    fn drop(&mut self) {
        let frames = Arc::clone(self.frames());
        for (_, _, pte) in self.page_table.leaves() {
            frames.put(pte.ppn());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const RW: MapPermission = MapPermission::R.union(MapPermission::W);
    const RO: MapPermission = MapPermission::R;

    fn space() -> MemorySet {
        MemorySet::new_user(&FrameTable::new(64, 64)).unwrap()
    }

    #[test]
    fn first_map_installs_reserved_area() {
        let mut ms = space();
        let base = ms.mmap(VirtAddr(0), PAGE_SIZE, RW, false).unwrap();
        assert_eq!(base, VirtAddr(MMAP_AREA_START + PAGE_SIZE));
        assert_eq!(ms.areas().len(), 2);
        assert!(ms.areas().iter().next().unwrap().is_reserved());
    }

    #[test]
    fn map_rejects_bad_arguments() {
        let mut ms = space();
        assert_eq!(ms.mmap(VirtAddr(0), 0, RW, false), Err(VmError::InvalidArgument));
        assert_eq!(
            ms.mmap(VirtAddr(0), MAX_MAP_LENGTH + 1, RW, false),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            ms.mmap(VirtAddr(0), PAGE_SIZE, MapPermission::W, false),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            ms.mmap(VirtAddr(0x1000), PAGE_SIZE, RW, false),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(ms.mmap(VirtAddr(0), PAGE_SIZE, RW, true), Err(VmError::InvalidArgument));
        assert_eq!(
            ms.mmap(VirtAddr(MMAP_AREA_START + 0x10), PAGE_SIZE, RW, true),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn fixed_map_refuses_overlap_but_hint_falls_back() {
        let mut ms = space();
        let hint = VirtAddr(MMAP_AREA_START + 0x10_0000);
        assert_eq!(ms.mmap(hint, 2 * PAGE_SIZE, RO, true), Ok(hint));
        assert_eq!(
            ms.mmap(hint, PAGE_SIZE, RW, true),
            Err(VmError::InvalidArgument)
        );
        // the sentinel itself is occupied
        assert_eq!(
            ms.mmap(VirtAddr(MMAP_AREA_START), PAGE_SIZE, RW, true),
            Err(VmError::InvalidArgument)
        );
        let moved = ms.mmap(hint, PAGE_SIZE, RW, false).unwrap();
        assert_eq!(moved, VirtAddr(MMAP_AREA_START + PAGE_SIZE));
    }

    #[test]
    fn fixed_map_must_end_inside_window() {
        let mut ms = space();
        let last = VirtAddr(MMAP_AREA_END - PAGE_SIZE);
        assert_eq!(
            ms.mmap(last, 2 * PAGE_SIZE, RW, true),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(ms.mmap(last, PAGE_SIZE, RW, true), Ok(last));
    }

    #[test]
    fn unmap_validates_and_tolerates_holes() {
        let mut ms = space();
        assert_eq!(ms.munmap(VirtAddr(0), PAGE_SIZE), Err(VmError::InvalidArgument));
        assert_eq!(
            ms.munmap(VirtAddr(MMAP_AREA_START + 1), PAGE_SIZE),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            ms.munmap(VirtAddr(MMAP_AREA_START), 0),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(ms.munmap(VirtAddr(MMAP_AREA_START + 0x8000), PAGE_SIZE), Ok(()));
    }

    #[test]
    fn ranges_past_address_space_are_rejected() {
        let mut ms = space();
        ms.mmap(VirtAddr(0), PAGE_SIZE, RW, false).unwrap();
        let before: Vec<MapArea> = ms.areas().iter().copied().collect();

        let top = VirtAddr(usize::MAX & !(PAGE_SIZE - 1));
        assert_eq!(ms.munmap(top, PAGE_SIZE), Err(VmError::InvalidArgument));
        assert_eq!(ms.mprotect(top, PAGE_SIZE, RO), Err(VmError::InvalidArgument));

        let last = VirtAddr((1 << VA_WIDTH) - PAGE_SIZE);
        assert_eq!(ms.munmap(last, PAGE_SIZE), Ok(()));
        assert_eq!(ms.munmap(last, 2 * PAGE_SIZE), Err(VmError::InvalidArgument));

        let after: Vec<MapArea> = ms.areas().iter().copied().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn unmap_releases_frames() {
        let mut ms = space();
        let base = ms.mmap(VirtAddr(0), 2 * PAGE_SIZE, RW, false).unwrap();
        ms.copy_to_user(base, &[1; 2 * PAGE_SIZE]).unwrap();
        assert_eq!(ms.stats().frames.user_frames, 2);

        ms.munmap(base, 2 * PAGE_SIZE).unwrap();
        assert_eq!(ms.stats().frames.user_frames, 0);
        assert!(ms.leaf(base).is_none());
        assert!(ms.translate(base).is_none());
    }

    #[test]
    fn user_copies_fault_in_pages() {
        let mut ms = space();
        let base = ms.mmap(VirtAddr(0), 3 * PAGE_SIZE, RW, false).unwrap();
        let at = VirtAddr(base.0 + PAGE_SIZE - 2);
        ms.copy_to_user(at, b"straddle").unwrap();

        let mut buf = [0u8; 8];
        ms.copy_from_user(at, &mut buf).unwrap();
        assert_eq!(&buf, b"straddle");
        assert_eq!(ms.stats().resident_pages, 2);
        assert!(ms.translate(at).is_some());
    }

    #[test]
    fn read_only_region_refuses_writes() {
        let mut ms = space();
        let base = ms.mmap(VirtAddr(0), PAGE_SIZE, RO, false).unwrap();
        let mut buf = [0xaa; 4];
        ms.copy_from_user(base, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
        assert_eq!(
            ms.copy_to_user(base, b"nope"),
            Err(VmError::Fatal(FatalFault::WriteToReadOnly))
        );
    }

    #[test]
    fn segment_limit_moves_within_bounds() {
        let mut ms = space();
        let heap = *ms.segment(SegmentKind::Heap);
        let brk = VirtAddr(heap.start().0 + 2 * PAGE_SIZE);
        ms.set_segment_limit(SegmentKind::Heap, brk).unwrap();
        ms.copy_to_user(VirtAddr(brk.0 - PAGE_SIZE), b"heap").unwrap();
        assert_eq!(ms.stats().frames.user_frames, 1);

        ms.set_segment_limit(SegmentKind::Heap, heap.start()).unwrap();
        assert_eq!(ms.stats().frames.user_frames, 0);

        assert_eq!(
            ms.set_segment_limit(SegmentKind::Heap, VirtAddr(heap.end().0 + PAGE_SIZE)),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            ms.set_segment_limit(SegmentKind::Stack, VirtAddr(STACK_END)),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn stack_is_populated_from_the_start() {
        let mut ms = space();
        let top = VirtAddr(STACK_END - 8);
        ms.copy_to_user(top, &42u64.to_le_bytes()).unwrap();
        assert!(ms.segment(SegmentKind::Stack).contains(top));
        assert!(!ms.segment(SegmentKind::Code).contains(VirtAddr(CODE_START)));
    }

    #[test]
    fn drop_returns_every_frame() {
        let frames = FrameTable::new(64, 64);
        {
            let mut ms = MemorySet::new_user(&frames).unwrap();
            let base = ms.mmap(VirtAddr(0), 4 * PAGE_SIZE, RW, false).unwrap();
            ms.copy_to_user(base, &[7; 4 * PAGE_SIZE]).unwrap();
            ms.copy_to_user(VirtAddr(STACK_END - PAGE_SIZE), &[1]).unwrap();
        }
        assert_eq!(frames.stats(), FrameStats::default());
    }
}
