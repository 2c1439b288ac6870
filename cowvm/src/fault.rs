//! Page-fault handling: lazy allocation and copy-on-write.

use crate::address::{VirtAddr, VirtPageNum};
use crate::error::{FatalFault, VmError};
use crate::frame_allocator::Pool;
use crate::map_area::MapPermission;
use crate::memory_set::MemorySet;
use crate::page_table::{PTEFlags, PageTableEntry};
use alloc::sync::Arc;
use bitflags::bitflags;
use log::{trace, warn};

bitflags! {
    /// Hardware fault code pushed on a page fault
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// The leaf entry was present (protection violation)
        const PRESENT = 1 << 0;
        /// The access was a write
        const WRITE = 1 << 1;
        /// The access came from user mode
        const USER = 1 << 2;
    }
}

/// How a serviced fault was resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// A shared or read-only frame was made private and writable
    CopiedOnWrite,
    /// A fresh frame was installed
    Mapped,
}

impl MemorySet {
    /// Mask of the segment or region covering `va`.
    /// Segments take precedence over regions.
    fn classify(&self, va: VirtAddr) -> Result<MapPermission, FatalFault> {
        if va.0 == 0 {
            return Err(FatalFault::NoMapping);
        }
        if let Some(seg) = self.segments.iter().find(|seg| seg.contains(va)) {
            return Ok(seg.perm());
        }
        match self.areas.find(va) {
            Some(area) if area.is_reserved() => Err(FatalFault::ReservedArea),
            Some(area) => Ok(area.perm()),
            None => Err(FatalFault::NoMapping),
        }
    }

    /// Service a page fault at `va`.
    ///
    /// # Returns
    /// [`FaultResolution::Mapped`] when a not-present page got its frame,
    /// [`FaultResolution::CopiedOnWrite`] when a present page became writable.
    pub fn handle_page_fault(
        &mut self,
        va: VirtAddr,
        code: FaultCode,
    ) -> Result<FaultResolution, VmError> {
        trace!("page fault at {va:?} code {code:?}");
        let result = self.resolve_fault(va, code);
        if let Err(err) = result {
            warn!("unresolved page fault at {va:?} ({code:?}): {err}");
        }
        result
    }

    fn resolve_fault(
        &mut self,
        va: VirtAddr,
        code: FaultCode,
    ) -> Result<FaultResolution, VmError> {
        let perm = self.classify(va)?;
        let write = code.contains(FaultCode::WRITE);
        if write && !perm.contains(MapPermission::W) {
            return Err(FatalFault::WriteToReadOnly.into());
        }

        let vpn = va.to_vpn_by_floor();
        if !code.contains(FaultCode::PRESENT) {
            self.map_lazily(vpn, perm, write)?;
            return Ok(FaultResolution::Mapped);
        }
        if write && perm == MapPermission::R | MapPermission::W {
            self.fix_cow(vpn, perm)?;
            return Ok(FaultResolution::CopiedOnWrite);
        }
        Err(FatalFault::Unserviceable.into())
    }

    /// Back `vpn` with a zeroed user frame, writable only when the first
    /// touch is a write.
    fn map_lazily(
        &mut self,
        vpn: VirtPageNum,
        perm: MapPermission,
        write: bool,
    ) -> Result<(), VmError> {
        let slot = self.page_table.walk(vpn, true)?;
        if self.page_table.read(slot).is_present() {
            // raced with another fault on the same page
            return Ok(());
        }
        let ppn = self
            .frames()
            .alloc(Pool::User)
            .ok_or(VmError::OutOfMemory)?;
        let mut flags = PTEFlags::P | PTEFlags::U;
        if write && perm.contains(MapPermission::W) {
            flags |= PTEFlags::W;
        }
        self.page_table.write(slot, PageTableEntry::new(ppn, flags));
        self.tlb.flush_page(vpn);
        trace!("lazily mapped {vpn:?} -> {ppn:?} {flags:?}");
        Ok(())
    }

    /// Make the page at `vpn` private, then writable if `perm` allows.
    ///
    /// A frame with more than one reference is copied into a fresh frame and
    /// the old one loses a reference. A frame with a single reference is
    /// reused as is.
    pub(crate) fn fix_cow(&mut self, vpn: VirtPageNum, perm: MapPermission) -> Result<(), VmError> {
        let slot = self.page_table.find_pte(vpn).ok_or(VmError::NotPresent)?;
        let mut pte = self.page_table.read(slot);
        if !pte.is_present() {
            return Err(VmError::NotPresent);
        }

        let frames = Arc::clone(self.frames());
        let old = pte.ppn();
        if frames.refcount(old) > 1 {
            let new = frames.alloc(Pool::User).ok_or(VmError::OutOfMemory)?;
            frames.copy(old, new);
            let remaining = frames.put(old);
            pte = pte.with_ppn(new);
            trace!("cow {vpn:?}: {old:?} -> {new:?}, {remaining} refs left on old");
        }

        pte = pte.with_writable(perm.contains(MapPermission::W));
        self.page_table.write(slot, pte);
        self.tlb.flush_page(vpn);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{MMAP_AREA_START, PAGE_SIZE};
    use crate::frame_allocator::FrameTable;

    const RW: MapPermission = MapPermission::R.union(MapPermission::W);
    const WRITE: FaultCode = FaultCode::WRITE.union(FaultCode::USER);
    const READ: FaultCode = FaultCode::USER;

    fn space() -> MemorySet {
        MemorySet::new_user(&FrameTable::new(64, 64)).unwrap()
    }

    #[test]
    fn null_and_unmapped_are_fatal() {
        let mut ms = space();
        assert_eq!(
            ms.handle_page_fault(VirtAddr(0), WRITE),
            Err(VmError::Fatal(FatalFault::NoMapping))
        );
        assert_eq!(
            ms.handle_page_fault(VirtAddr(MMAP_AREA_START + 0x5000), READ),
            Err(VmError::Fatal(FatalFault::NoMapping))
        );
    }

    #[test]
    fn reserved_area_is_fatal() {
        let mut ms = space();
        ms.mmap(VirtAddr(0), PAGE_SIZE, RW, false).unwrap();
        assert_eq!(
            ms.handle_page_fault(VirtAddr(MMAP_AREA_START), READ),
            Err(VmError::Fatal(FatalFault::ReservedArea))
        );
    }

    #[test]
    fn lazy_map_follows_access_kind() {
        let mut ms = space();
        let base = ms.mmap(VirtAddr(0), 2 * PAGE_SIZE, RW, false).unwrap();
        let second = VirtAddr(base.0 + PAGE_SIZE);

        assert_eq!(ms.handle_page_fault(base, WRITE), Ok(FaultResolution::Mapped));
        assert!(ms.leaf(base).unwrap().is_writable());

        assert_eq!(ms.handle_page_fault(second, READ), Ok(FaultResolution::Mapped));
        let pte = ms.leaf(second).unwrap();
        assert!(pte.is_user() && !pte.is_writable());

        // first write to a page faulted in by a read
        assert_eq!(
            ms.handle_page_fault(second, WRITE | FaultCode::PRESENT),
            Ok(FaultResolution::CopiedOnWrite)
        );
        assert_eq!(ms.leaf(second).unwrap().ppn(), pte.ppn());
        assert!(ms.leaf(second).unwrap().is_writable());
    }

    #[test]
    fn write_to_read_only_is_fatal() {
        let mut ms = space();
        let base = ms.mmap(VirtAddr(0), PAGE_SIZE, MapPermission::R, false).unwrap();
        assert_eq!(
            ms.handle_page_fault(base, WRITE),
            Err(VmError::Fatal(FatalFault::WriteToReadOnly))
        );
        assert_eq!(ms.handle_page_fault(base, READ), Ok(FaultResolution::Mapped));
        assert_eq!(
            ms.handle_page_fault(base, READ | FaultCode::PRESENT),
            Err(VmError::Fatal(FatalFault::Unserviceable))
        );
    }

    #[test]
    fn cow_on_absent_leaf_is_not_present() {
        let mut ms = space();
        let base = ms.mmap(VirtAddr(0), PAGE_SIZE, RW, false).unwrap();
        assert_eq!(
            ms.handle_page_fault(base, WRITE | FaultCode::PRESENT),
            Err(VmError::NotPresent)
        );
    }

    #[test]
    fn exhausted_user_pool_is_out_of_memory() {
        let mut ms = MemorySet::new_user(&FrameTable::new(16, 1)).unwrap();
        let base = ms.mmap(VirtAddr(0), 2 * PAGE_SIZE, RW, false).unwrap();
        ms.handle_page_fault(base, WRITE).unwrap();
        assert_eq!(
            ms.handle_page_fault(VirtAddr(base.0 + PAGE_SIZE), WRITE),
            Err(VmError::OutOfMemory)
        );
    }

    #[test]
    fn parent_and_child_break_sharing_concurrently() {
        use crate::frame_allocator::FrameStats;
        use std::thread;

        for _ in 0..50 {
            let frames = FrameTable::new(64, 64);
            let mut parent = MemorySet::new_user(&frames).unwrap();
            let base = parent.mmap(VirtAddr(0), PAGE_SIZE, RW, false).unwrap();
            parent.copy_to_user(base, b"shared").unwrap();
            let child = parent.fork().unwrap();
            let old = parent.leaf(base).unwrap().ppn();
            assert_eq!(frames.refcount(old), 2);

            let handles: Vec<_> = [parent, child]
                .into_iter()
                .map(|mut ms| {
                    thread::spawn(move || {
                        let res = ms.handle_page_fault(base, WRITE | FaultCode::PRESENT);
                        (ms, res)
                    })
                })
                .collect();
            let mut spaces = Vec::new();
            for handle in handles {
                let (ms, res) = handle.join().unwrap();
                assert_eq!(res, Ok(FaultResolution::CopiedOnWrite));
                spaces.push(ms);
            }

            let (a, b) = (spaces[0].leaf(base).unwrap(), spaces[1].leaf(base).unwrap());
            assert!(a.is_writable() && b.is_writable());
            assert_ne!(a.ppn(), b.ppn());
            assert_eq!(frames.refcount(a.ppn()), 1);
            assert_eq!(frames.refcount(b.ppn()), 1);
            assert_eq!(frames.stats().user_frames, 2);
            for ms in &mut spaces {
                let mut buf = [0u8; 6];
                ms.copy_from_user(base, &mut buf).unwrap();
                assert_eq!(&buf, b"shared");
            }

            drop(spaces);
            assert_eq!(frames.stats(), FrameStats::default());
        }
    }
}
