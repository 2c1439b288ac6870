//! Implementation of [`FrameAllocator`] and the shared [`FrameTable`].
//!
//! The frame table stands in for physical memory: every frame number indexes
//! a 4 KiB slot with its own reference count. Page-table frames and user
//! frames come from two separate pools.

use crate::address::PhysPageNum;
use crate::config::PAGE_SIZE;
use alloc::{sync::Arc, vec::Vec};
use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::{AtomicU32, Ordering};
use log::{trace, warn};
use spin::Mutex;

/// Frame pools with separate allocators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pool {
    /// Frames holding intermediate and top-level page tables
    PageTable,
    /// Frames backing user pages
    User,
}

trait FrameAllocator {
    fn new() -> Self;
    fn alloc(&mut self) -> Option<PhysPageNum>;
    fn dealloc(&mut self, ppn: PhysPageNum);
    fn in_use(&self) -> usize;
}

/// An implementation for frame allocator
pub struct StackFrameAllocator {
    start: usize,
    current: usize,
    end: usize,
    recycled: Vec<usize>,
}

impl StackFrameAllocator {
    /// Hand out frames from `[l, r)`
    pub fn init(&mut self, l: PhysPageNum, r: PhysPageNum) {
        self.start = l.0;
        self.current = l.0;
        self.end = r.0;
    }

    fn owns(&self, ppn: PhysPageNum) -> bool {
        (self.start..self.end).contains(&ppn.0)
    }
}

impl FrameAllocator for StackFrameAllocator {
    fn new() -> Self {
        Self {
            start: 0,
            current: 0,
            end: 0,
            recycled: Vec::new(),
        }
    }

    fn alloc(&mut self) -> Option<PhysPageNum> {
        match self.recycled.pop() {
            Some(ppn) => Some(ppn.into()),
            None if self.current == self.end => None,
            None => {
                self.current += 1;
                Some((self.current - 1).into())
            }
        }
    }

    fn dealloc(&mut self, ppn: PhysPageNum) {
        let ppn = ppn.0;
        // validity check
        assert!(
            !(ppn >= self.current || self.recycled.iter().any(|&v| v == ppn)),
            "Frame ppn={ppn:#x} has not been allocated!"
        );
        // recycle
        self.recycled.push(ppn);
    }

    fn in_use(&self) -> usize {
        self.current - self.start - self.recycled.len()
    }
}

type FrameAllocatorImpl = StackFrameAllocator;

/// One emulated physical frame
struct Frame {
    refcount: AtomicU32,
    data: Mutex<[u8; PAGE_SIZE]>,
}

impl Frame {
    fn new() -> Self {
        Self {
            refcount: AtomicU32::new(0),
            data: Mutex::new([0; PAGE_SIZE]),
        }
    }
}

/// Frames currently handed out by each pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Page-table frames in use
    pub table_frames: usize,
    /// User frames in use
    pub user_frames: usize,
}

/// Physical frames shared by every address space.
///
/// Reference counts are atomic so that two address spaces sharing a frame
/// after fork may fault on it concurrently. Installing a leaf entry takes a
/// reference with [`FrameTable::get`]; clearing one gives it back with
/// [`FrameTable::put`].
pub struct FrameTable {
    frames: Vec<Frame>,
    table_pool: Mutex<FrameAllocatorImpl>,
    user_pool: Mutex<FrameAllocatorImpl>,
}

impl FrameTable {
    /// Create a table with `table_frames` page-table frames and
    /// `user_frames` user frames. Frame 0 is never handed out.
    pub fn new(table_frames: usize, user_frames: usize) -> Arc<Self> {
        let total = 1 + table_frames + user_frames;
        let frames = (0..total).map(|_| Frame::new()).collect();

        let mut table_pool = FrameAllocatorImpl::new();
        table_pool.init(PhysPageNum(1), PhysPageNum(1 + table_frames));
        let mut user_pool = FrameAllocatorImpl::new();
        user_pool.init(PhysPageNum(1 + table_frames), PhysPageNum(total));

        Arc::new(Self {
            frames,
            table_pool: Mutex::new(table_pool),
            user_pool: Mutex::new(user_pool),
        })
    }

    fn pool(&self, pool: Pool) -> &Mutex<FrameAllocatorImpl> {
        match pool {
            Pool::PageTable => &self.table_pool,
            Pool::User => &self.user_pool,
        }
    }

    fn frame(&self, ppn: PhysPageNum) -> &Frame {
        &self.frames[ppn.0]
    }

    /// Pool a frame belongs to
    pub fn pool_of(&self, ppn: PhysPageNum) -> Pool {
        if self.table_pool.lock().owns(ppn) {
            Pool::PageTable
        } else {
            Pool::User
        }
    }

    /// Allocate a zeroed frame holding one reference
    pub fn alloc(&self, pool: Pool) -> Option<PhysPageNum> {
        let Some(ppn) = self.pool(pool).lock().alloc() else {
            warn!("{pool:?} pool exhausted");
            return None;
        };
        let frame = self.frame(ppn);
        frame.data.lock().fill(0);
        frame.refcount.store(1, Ordering::Release);
        trace!("alloc {ppn:?} from {pool:?} pool");
        Some(ppn)
    }

    /// Return a frame to its pool regardless of its reference count
    pub fn free(&self, pool: Pool, ppn: PhysPageNum) {
        debug_assert_eq!(self.pool_of(ppn), pool);
        self.frame(ppn).refcount.store(0, Ordering::Release);
        self.pool(pool).lock().dealloc(ppn);
        trace!("free {ppn:?} to {pool:?} pool");
    }

    /// Current reference count of a frame
    pub fn refcount(&self, ppn: PhysPageNum) -> u32 {
        self.frame(ppn).refcount.load(Ordering::Acquire)
    }

    /// Take one more reference to a frame
    pub fn get(&self, ppn: PhysPageNum) {
        let prev = self.frame(ppn).refcount.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "get on free frame {ppn:?}");
    }

    /// Drop one reference and free the frame once nothing refers to it.
    /// Returns the remaining count.
    pub fn put(&self, ppn: PhysPageNum) -> u32 {
        let prev = self.frame(ppn).refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "put on free frame {ppn:?}");
        if prev == 1 {
            let pool = self.pool_of(ppn);
            self.pool(pool).lock().dealloc(ppn);
            trace!("last reference to {ppn:?} dropped");
        }
        prev - 1
    }

    /// Read the 64-bit word at `index` of a frame
    pub fn read_word(&self, ppn: PhysPageNum, index: usize) -> u64 {
        let data = self.frame(ppn).data.lock();
        let offset = index * 8;
        let mut word = [0u8; 8];
        word.copy_from_slice(&data[offset..offset + 8]);
        u64::from_le_bytes(word)
    }

    /// Overwrite the 64-bit word at `index` of a frame
    pub fn write_word(&self, ppn: PhysPageNum, index: usize, value: u64) {
        let mut data = self.frame(ppn).data.lock();
        let offset = index * 8;
        data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Copy bytes out of a frame starting at `offset`
    pub fn read_bytes(&self, ppn: PhysPageNum, offset: usize, buf: &mut [u8]) {
        let data = self.frame(ppn).data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy bytes into a frame starting at `offset`
    pub fn write_bytes(&self, ppn: PhysPageNum, offset: usize, src: &[u8]) {
        let mut data = self.frame(ppn).data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Copy the whole contents of `src` into `dst`
    pub fn copy(&self, src: PhysPageNum, dst: PhysPageNum) {
        let snapshot = *self.frame(src).data.lock();
        *self.frame(dst).data.lock() = snapshot;
    }

    /// Frames currently in use in each pool
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            table_frames: self.table_pool.lock().in_use(),
            user_frames: self.user_pool.lock().in_use(),
        }
    }
}

/// Manage a page-table frame which has the same lifecycle as the tracker
pub struct FrameTracker {
    /// Frame held by this tracker
    pub ppn: PhysPageNum,
    frames: Arc<FrameTable>,
}

impl FrameTracker {
    /// Allocate a zeroed page-table frame
    pub fn new(frames: &Arc<FrameTable>) -> Option<Self> {
        frames.alloc(Pool::PageTable).map(|ppn| Self {
            ppn,
            frames: Arc::clone(frames),
        })
    }
}

impl Debug for FrameTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("FrameTracker:PPN={:#x}", self.ppn.0))
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        self.frames.free(Pool::PageTable, self.ppn);
    }
}
