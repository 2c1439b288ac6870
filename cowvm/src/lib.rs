//! # Virtual memory with lazy allocation and copy-on-write
//!
//! Per-process address spaces over four-level page tables, everything about
//! them, like:
//! - [`frame_allocator`]: emulated physical frames with reference counts
//! - [`page_table`]: the walker
//! - [`map_area::RegionMap`]: the coalescing map of `mmap` regions
//! - [`memory_set::MemorySet`]: map, unmap, protect and user access
//! - [`fault`]: lazy allocation and copy-on-write
//! - [`fork`]: address-space duplication
//! - [`syscall`]: integer-returning entry points
//!
//! Every process has a [`MemorySet`]; all of them share one [`FrameTable`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address;
pub mod config;
mod error;
pub mod fault;
pub mod fork;
pub mod frame_allocator;
pub mod map_area;
pub mod memory_set;
pub mod page_table;
pub mod syscall;
mod tlb;

pub use address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
pub use error::{FatalFault, VmError};
pub use fault::{FaultCode, FaultResolution};
pub use frame_allocator::{FrameStats, FrameTable, Pool};
pub use map_area::{MapArea, MapPermission, RegionMap};
pub use memory_set::{MemorySet, Segment, SegmentKind, Stats};
pub use page_table::{PTEFlags, PageTableEntry};
pub use tlb::Tlb;
