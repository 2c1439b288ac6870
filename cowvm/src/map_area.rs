//! Implementation of [`MapArea`] and the coalescing [`RegionMap`].

use crate::address::{VPNRange, VirtAddr, VirtPageNum};
use crate::config::PAGE_SIZE;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt::{self, Debug, Formatter};
use log::debug;

bitflags! {
    /// Access mask of a region or segment
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct MapPermission: u8 {
        /// Readable
        const R = 1 << 0;
        /// Writable
        const W = 1 << 1;
    }
}

impl MapPermission {
    /// The two masks a user may request: read-only and read-write
    pub fn is_user_mask(self) -> bool {
        self == MapPermission::R || self == MapPermission::R | MapPermission::W
    }
}

/// Map area structure, controls a contiguous piece of virtual memory
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MapArea {
    vpn_range: VPNRange,
    map_perm: MapPermission,
}

impl MapArea {
    /// Area covering `[start_va, end_va)`, widened to whole pages
    pub fn new(start_va: VirtAddr, end_va: VirtAddr, map_perm: MapPermission) -> Self {
        Self {
            vpn_range: VPNRange::from_va(start_va, end_va),
            map_perm,
        }
    }

    /// Area covering the pages `[start, end)`
    pub fn from_vpns(start: VirtPageNum, end: VirtPageNum, map_perm: MapPermission) -> Self {
        Self {
            vpn_range: VPNRange::new(start, end),
            map_perm,
        }
    }

    /// The zero-access page at the base of the mappable window
    pub fn reserved(start_va: VirtAddr) -> Self {
        Self::new(start_va, VirtAddr(start_va.0 + PAGE_SIZE), MapPermission::empty())
    }

    /// First byte of the area
    pub fn start(&self) -> VirtAddr {
        self.vpn_range.start().into()
    }

    /// One past the last byte of the area
    pub fn end(&self) -> VirtAddr {
        self.vpn_range.end().into()
    }

    /// Pages of the area
    pub fn vpn_range(&self) -> VPNRange {
        self.vpn_range
    }

    /// Access mask of the area
    pub fn perm(&self) -> MapPermission {
        self.map_perm
    }

    /// Whether this is the zero-access sentinel
    pub fn is_reserved(&self) -> bool {
        self.map_perm.is_empty()
    }

    /// Whether `va` lies inside the area
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.start() <= va && va < self.end()
    }

    /// Whether the area shares at least one byte with `[start, end)`
    pub fn intersects(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start() < end && start < self.end()
    }

    fn set_end(&mut self, end: VirtPageNum) {
        self.vpn_range = VPNRange::new(self.vpn_range.start(), end);
    }
}

impl Debug for MapArea {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "[{:#x}, {:#x}) {:?}",
            self.start().0,
            self.end().0,
            self.map_perm
        ))
    }
}

/// Ordered, non-overlapping, coalesced list of areas
#[derive(Clone, Default)]
pub struct RegionMap {
    areas: Vec<MapArea>,
}

impl RegionMap {
    /// An empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of areas
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Whether the map holds no area
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Areas in address order
    pub fn iter(&self) -> impl Iterator<Item = &MapArea> + '_ {
        self.areas.iter()
    }

    /// Area covering `va`
    pub fn find(&self, va: VirtAddr) -> Option<&MapArea> {
        self.areas.iter().find(|area| area.contains(va))
    }

    /// Whether any area intersects `[start, end)`
    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.areas.iter().any(|area| area.intersects(start, end))
    }

    /// Start of the first gap of at least `len` bytes, searching after each
    /// area's end and before the next area or `window_end`.
    pub fn first_fit(&self, len: usize, window_end: VirtAddr) -> Option<VirtAddr> {
        for (i, area) in self.areas.iter().enumerate() {
            let gap_end = self.areas.get(i + 1).map_or(window_end, MapArea::start);
            if gap_end.0 >= area.end().0 && gap_end.0 - area.end().0 >= len {
                return Some(area.end());
            }
        }
        None
    }

    /// Splice `new_area` in front of the first area starting at or after it,
    /// then merge it with its left and right neighbours when they touch and
    /// carry the same mask. Returns the start of the inserted range.
    ///
    /// The caller guarantees `new_area` overlaps nothing.
    pub fn insert_and_merge(&mut self, new_area: MapArea) -> VirtAddr {
        let ret_addr = new_area.start();
        debug_assert!(!self.overlaps(new_area.start(), new_area.end()));
        debug!("insert and merge {new_area:?}");

        let idx = self
            .areas
            .partition_point(|area| area.start() < new_area.start());
        self.areas.insert(idx, new_area);

        let mut cur = idx;
        if idx > 0 {
            let left = self.areas[idx - 1];
            if left.end() == new_area.start() && left.map_perm == new_area.map_perm {
                self.areas[idx - 1].set_end(new_area.vpn_range.end());
                self.areas.remove(idx);
                cur = idx - 1;
            }
        }

        if cur + 1 < self.areas.len() {
            let (this, right) = (self.areas[cur], self.areas[cur + 1]);
            if this.end() == right.start() && this.map_perm == right.map_perm {
                self.areas[cur].set_end(right.vpn_range.end());
                self.areas.remove(cur + 1);
            }
        }

        ret_addr
    }

    fn take(&mut self, area: &MapArea) -> Option<MapArea> {
        let idx = self.areas.iter().position(|a| a == area)?;
        Some(self.areas.remove(idx))
    }

    /// Remove `[start, end)` from every non-reserved area it touches.
    /// Returns the removed page ranges.
    pub fn remove_range(&mut self, start: VirtAddr, end: VirtAddr) -> Vec<VPNRange> {
        let targets: Vec<MapArea> = self
            .areas
            .iter()
            .filter(|area| !area.is_reserved() && area.intersects(start, end))
            .copied()
            .collect();

        let mut removed = Vec::with_capacity(targets.len());
        for area in targets {
            let Some(area) = self.take(&area) else {
                continue;
            };
            let cut_start = area.start().max(start);
            let cut_end = area.end().min(end);
            debug!("unmap [{:#x}, {:#x}) from {area:?}", cut_start.0, cut_end.0);

            if area.start() < cut_start {
                self.insert_and_merge(MapArea::new(area.start(), cut_start, area.map_perm));
            }
            if cut_end < area.end() {
                self.insert_and_merge(MapArea::new(cut_end, area.end(), area.map_perm));
            }
            removed.push(VPNRange::from_va(cut_start, cut_end));
        }
        removed
    }

    /// Give `[start, end)` the mask `perm` inside every non-reserved area
    /// whose mask differs, carving the range out and re-merging neighbours.
    /// Returns the page ranges whose mask changed.
    pub fn protect_range(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        perm: MapPermission,
    ) -> Vec<VPNRange> {
        let targets: Vec<MapArea> = self
            .areas
            .iter()
            .filter(|area| {
                !area.is_reserved() && area.map_perm != perm && area.intersects(start, end)
            })
            .copied()
            .collect();

        let mut changed = Vec::with_capacity(targets.len());
        for area in targets {
            let Some(area) = self.take(&area) else {
                continue;
            };
            let cut_start = area.start().max(start);
            let cut_end = area.end().min(end);
            debug!(
                "protect [{:#x}, {:#x}) of {area:?} to {perm:?}",
                cut_start.0, cut_end.0
            );

            if area.start() < cut_start {
                self.insert_and_merge(MapArea::new(area.start(), cut_start, area.map_perm));
            }
            self.insert_and_merge(MapArea::new(cut_start, cut_end, perm));
            if cut_end < area.end() {
                self.insert_and_merge(MapArea::new(cut_end, area.end(), area.map_perm));
            }
            changed.push(VPNRange::from_va(cut_start, cut_end));
        }
        changed
    }

    /// Check ordering, non-overlap and coalescing.
    /// Returns the index of the first offending area.
    pub fn check_invariants(&self) -> Result<(), usize> {
        for (i, pair) in self.areas.windows(2).enumerate() {
            let (left, right) = (pair[0], pair[1]);
            if left.end() > right.start() {
                return Err(i + 1);
            }
            if left.end() == right.start() && left.map_perm == right.map_perm {
                return Err(i + 1);
            }
        }
        match self.areas.iter().position(|area| area.start() >= area.end()) {
            Some(i) => Err(i),
            None => Ok(()),
        }
    }
}

impl Debug for RegionMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.areas.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const RW: MapPermission = MapPermission::R.union(MapPermission::W);
    const RO: MapPermission = MapPermission::R;
    const BASE: usize = 0x1_8000_0000;

    fn page(n: usize) -> VirtAddr {
        VirtAddr(BASE + n * PAGE_SIZE)
    }

    fn area(start: usize, end: usize, perm: MapPermission) -> MapArea {
        MapArea::new(page(start), page(end), perm)
    }

    fn map_with_sentinel() -> RegionMap {
        let mut map = RegionMap::new();
        map.insert_and_merge(MapArea::reserved(page(0)));
        map
    }

    fn ranges(map: &RegionMap) -> Vec<(usize, usize, MapPermission)> {
        map.iter()
            .map(|a| {
                (
                    (a.start().0 - BASE) / PAGE_SIZE,
                    (a.end().0 - BASE) / PAGE_SIZE,
                    a.perm(),
                )
            })
            .collect()
    }

    #[test]
    fn merges_left_and_right() {
        let mut map = map_with_sentinel();
        map.insert_and_merge(area(1, 3, RW));
        map.insert_and_merge(area(5, 7, RW));
        assert_eq!(map.len(), 3);

        assert_eq!(map.insert_and_merge(area(3, 5, RW)), page(3));
        assert_eq!(
            ranges(&map),
            [(0, 1, MapPermission::empty()), (1, 7, RW)]
        );
        assert!(map.check_invariants().is_ok());
    }

    #[test]
    fn different_masks_do_not_merge() {
        let mut map = map_with_sentinel();
        map.insert_and_merge(area(1, 2, RW));
        map.insert_and_merge(area(2, 3, RO));
        map.insert_and_merge(area(3, 4, RW));
        assert_eq!(map.len(), 4);
        assert!(map.check_invariants().is_ok());
    }

    #[test]
    fn sentinel_never_merges() {
        let mut map = map_with_sentinel();
        map.insert_and_merge(area(1, 2, RO));
        assert_eq!(map.len(), 2);
        assert!(map.iter().next().unwrap().is_reserved());
    }

    #[test]
    fn first_fit_finds_gap_or_tail() {
        let mut map = map_with_sentinel();
        map.insert_and_merge(area(1, 2, RW));
        map.insert_and_merge(area(4, 5, RO));
        assert_eq!(map.first_fit(PAGE_SIZE, page(100)), Some(page(2)));
        assert_eq!(map.first_fit(2 * PAGE_SIZE, page(100)), Some(page(2)));
        assert_eq!(map.first_fit(3 * PAGE_SIZE, page(100)), Some(page(5)));
        assert_eq!(map.first_fit(96 * PAGE_SIZE, page(100)), None);
    }

    #[test]
    fn remove_splits_straddling_area() {
        let mut map = map_with_sentinel();
        map.insert_and_merge(area(1, 4, RW));
        let removed = map.remove_range(page(2), page(3));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].start(), page(2).to_vpn_by_floor());
        assert_eq!(
            ranges(&map),
            [(0, 1, MapPermission::empty()), (1, 2, RW), (3, 4, RW)]
        );
    }

    #[test]
    fn remove_trims_and_drops() {
        let mut map = map_with_sentinel();
        map.insert_and_merge(area(1, 3, RW));
        map.insert_and_merge(area(3, 5, RO));
        map.insert_and_merge(area(6, 8, RW));
        map.remove_range(page(0), page(7));
        assert_eq!(
            ranges(&map),
            [(0, 1, MapPermission::empty()), (7, 8, RW)]
        );
    }

    #[test]
    fn protect_carves_and_remerges() {
        let mut map = map_with_sentinel();
        map.insert_and_merge(area(1, 6, RW));

        let changed = map.protect_range(page(2), page(4), RO);
        assert_eq!(changed.len(), 1);
        assert_eq!(
            ranges(&map),
            [(0, 1, MapPermission::empty()), (1, 2, RW), (2, 4, RO), (4, 6, RW)]
        );

        map.protect_range(page(2), page(4), RW);
        assert_eq!(
            ranges(&map),
            [(0, 1, MapPermission::empty()), (1, 6, RW)]
        );
        assert!(map.check_invariants().is_ok());
    }

    #[test]
    fn protect_spanning_several_areas() {
        let mut map = map_with_sentinel();
        map.insert_and_merge(area(1, 3, RO));
        map.insert_and_merge(area(3, 5, RW));
        map.insert_and_merge(area(5, 7, RO));

        map.protect_range(page(2), page(6), RO);
        assert_eq!(
            ranges(&map),
            [(0, 1, MapPermission::empty()), (1, 7, RO)]
        );
    }

    #[test]
    fn protect_skips_sentinel_and_same_mask() {
        let mut map = map_with_sentinel();
        map.insert_and_merge(area(1, 3, RW));
        assert!(map.protect_range(page(0), page(3), RW).is_empty());
        assert!(map.iter().next().unwrap().is_reserved());
    }
}
