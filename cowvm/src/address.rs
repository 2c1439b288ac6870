//! Implementation of physical and virtual address and page number.

use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS, PPN_WIDTH, PT_INDEX_BITS, PT_LEVELS, VA_WIDTH};
use core::fmt::{self, Debug, Formatter};

//                        Virtual Address (48 bits)
// 47        39 38        30 29        21 20        12 11           0
// +-----------+------------+------------+------------+-------------+
// |  level 0  |  level 1   |  level 2   |  level 3   | Page Offset |
// +-----------+------------+------------+------------+-------------+
//
//                        Page Table Entry (64 bits)
// 63      52 51                                  12 11    5 4 3 2 1 0
// +---------+--------------------------------------+-------+-+-+---+-+
// |    0    |          Physical Frame Number       |   0   |U|W| 0 |P|
// +---------+--------------------------------------+-------+-+-+---+-+

/// physical address
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct PhysAddr(pub usize);

/// virtual address
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct VirtAddr(pub usize);

/// physical page number
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PhysPageNum(pub usize);

/// virtual page number
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct VirtPageNum(pub usize);

/*
* Debugging
*/
impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VA:{:#x}", self.0))
    }
}
impl Debug for VirtPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VPN:{:#x}", self.0))
    }
}
impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PA:{:#x}", self.0))
    }
}
impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PPN:{:#x}", self.0))
    }
}

/*
* From usize To PhysAddr, PhysPageNum, VirtAddr, VirtPageNum
*/
impl From<usize> for PhysAddr {
    fn from(value: usize) -> Self {
        Self(value & ((1 << (PPN_WIDTH + PAGE_SIZE_BITS)) - 1))
    }
}

impl From<usize> for PhysPageNum {
    fn from(value: usize) -> Self {
        Self(value & ((1 << PPN_WIDTH) - 1))
    }
}

impl From<usize> for VirtAddr {
    fn from(value: usize) -> Self {
        Self(value & ((1 << VA_WIDTH) - 1))
    }
}

impl From<usize> for VirtPageNum {
    fn from(value: usize) -> Self {
        Self(value & ((1 << (VA_WIDTH - PAGE_SIZE_BITS)) - 1))
    }
}

/*
* From PhysAddr, PhysPageNum, VirtAddr, VirtPageNum To usize
*/
impl From<PhysAddr> for usize {
    fn from(value: PhysAddr) -> Self {
        value.0
    }
}

impl From<PhysPageNum> for usize {
    fn from(value: PhysPageNum) -> Self {
        value.0
    }
}

impl From<VirtAddr> for usize {
    fn from(value: VirtAddr) -> Self {
        value.0
    }
}

impl From<VirtPageNum> for usize {
    fn from(value: VirtPageNum) -> Self {
        value.0
    }
}

/*
* Conversion between PhysAddr and PhysPageNum
*/
impl PhysAddr {
    /// Get the page offset
    pub fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the address is page-aligned.
    pub fn is_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl From<PhysPageNum> for PhysAddr {
    fn from(value: PhysPageNum) -> Self {
        Self(value.0 << PAGE_SIZE_BITS)
    }
}

/*
* Conversion between VirtAddr and VirtPageNum
*/
impl VirtAddr {
    /// Get the page offset
    pub fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the address is page-aligned.
    pub fn is_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Page containing this address
    pub fn to_vpn_by_floor(self) -> VirtPageNum {
        VirtPageNum(self.0 / PAGE_SIZE)
    }

    /// First page starting at or after this address
    pub fn to_vpn_by_ceil(self) -> VirtPageNum {
        VirtPageNum(self.0.div_ceil(PAGE_SIZE))
    }
}

impl From<VirtPageNum> for VirtAddr {
    fn from(value: VirtPageNum) -> Self {
        Self(value.0 << PAGE_SIZE_BITS)
    }
}

/*
* VirtPageNum
*/
impl VirtPageNum {
    /// - `id[0]`: VA[47..=39]
    /// - `id[1]`: VA[38..=30]
    /// - `id[2]`: VA[29..=21]
    /// - `id[3]`: VA[20..=12]
    pub fn indexes(self) -> [usize; PT_LEVELS] {
        let mask = (1 << PT_INDEX_BITS) - 1;
        let mut idxs = [0; PT_LEVELS];
        for (level, idx) in idxs.iter_mut().enumerate() {
            let shift = (PT_LEVELS - 1 - level) * PT_INDEX_BITS;
            *idx = (self.0 >> shift) & mask;
        }
        idxs
    }
}

/// Round a byte length up to whole pages
pub fn page_round_up(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// StepByOne
pub trait StepByOne {
    /// Advance to the next item
    fn step(&mut self);
}

impl StepByOne for VirtPageNum {
    fn step(&mut self) {
        self.0 += 1;
    }
}

/// a simple range structure for type T
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SimpleRange<T>
where
    T: Copy + PartialEq + PartialOrd + Debug,
{
    start: T,
    end: T,
}

impl<T> SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    /// Create a half-open range `[start, end)`
    pub fn new(start: T, end: T) -> Self {
        assert!(start <= end, "start {start:?} > end {end:?}!");
        Self { start, end }
    }

    /// First item of the range
    pub fn start(&self) -> T {
        self.start
    }

    /// One past the last item of the range
    pub fn end(&self) -> T {
        self.end
    }
}

impl<T> IntoIterator for SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    type IntoIter = SimpleRangeIterator<T>;
    fn into_iter(self) -> Self::IntoIter {
        SimpleRangeIterator::new(self.start, self.end)
    }
}

/// iterator for the simple range structure
pub struct SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    current: T,
    end: T,
}

impl<T> SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    /// Iterate over `[start, end)`
    pub fn new(start: T, end: T) -> Self {
        Self {
            current: start,
            end,
        }
    }
}

impl<T> Iterator for SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    fn next(&mut self) -> Option<Self::Item> {
        if self.current == self.end {
            None
        } else {
            let t = self.current;
            self.current.step();
            Some(t)
        }
    }
}

/// a simple range structure for virtual page number
pub type VPNRange = SimpleRange<VirtPageNum>;

impl VPNRange {
    /// Pages covering the byte range `[start, end)`
    pub fn from_va(start: VirtAddr, end: VirtAddr) -> Self {
        Self::new(start.to_vpn_by_floor(), end.to_vpn_by_ceil())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn indexes_follow_nine_bit_slices() {
        let va = VirtAddr((3 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0x123);
        assert_eq!(va.to_vpn_by_floor().indexes(), [3, 5, 7, 9]);
        assert_eq!(va.page_offset(), 0x123);
    }

    #[test]
    fn round_up_to_pages() {
        assert_eq!(page_round_up(1), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn vpn_range_covers_partial_pages() {
        let range = VPNRange::from_va(VirtAddr(0x1800), VirtAddr(0x3001));
        assert_eq!(range.into_iter().count(), 3);
        assert_eq!(range.start(), VirtPageNum(1));
    }
}
