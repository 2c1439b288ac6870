//! Constants used in the virtual-memory manager

/// Use a page size of 4 KiB
pub const PAGE_SIZE: usize = 0x1000;
/// Number of offset bits inside a page
pub const PAGE_SIZE_BITS: usize = 12;

/// Number of page-table levels
pub const PT_LEVELS: usize = 4;
/// Number of index bits consumed by each level
pub const PT_INDEX_BITS: usize = 9;
/// Number of entries in one page-table frame
pub const PT_ENTRIES: usize = 1 << PT_INDEX_BITS;

/// Width of a virtual address
pub const VA_WIDTH: usize = PAGE_SIZE_BITS + PT_LEVELS * PT_INDEX_BITS;
/// Width of a physical frame number inside a page-table entry (bits 12..=51)
pub const PPN_WIDTH: usize = 40;

/// First byte of the mappable window
pub const MMAP_AREA_START: usize = 0x1_8000_0000;
/// One past the last byte of the mappable window
pub const MMAP_AREA_END: usize = 0x2_0000_0000;
/// Upper bound for a single map/unmap/protect request
pub const MAX_MAP_LENGTH: usize = 2 << 20;

/// Number of fixed segments per process
pub const MAX_MM_SEGS: usize = 4;

/// Start of the code segment
pub const CODE_START: usize = 0x1_0000_0000;
/// Growth limit of the code segment
pub const CODE_END: usize = 0x1_2000_0000;
/// Start of the data segment
pub const DATA_START: usize = 0x1_2000_0000;
/// Growth limit of the data segment
pub const DATA_END: usize = 0x1_4000_0000;
/// Start of the heap segment
pub const HEAP_START: usize = 0x1_4000_0000;
/// Growth limit of the heap segment
pub const HEAP_END: usize = 0x1_8000_0000;
/// Top of the user stack
pub const STACK_END: usize = 0x7ff_0000_0000;
/// Size of the user stack segment
pub const STACK_SIZE: usize = 64 * PAGE_SIZE;

/// Frames reserved for page tables when no size is given
pub const DEFAULT_TABLE_FRAMES: usize = 256;
/// Frames reserved for user pages when no size is given
pub const DEFAULT_USER_FRAMES: usize = 1024;

/// Invalid argument
pub const EINVAL: isize = 22;
