//! Syscall entry points with the kernel's integer return conventions.
//!
//! Each function validates raw user arguments, calls into [`MemorySet`] and
//! folds the typed result into an `isize`.

use crate::address::VirtAddr;
use crate::config::EINVAL;
use crate::error::VmError;
use crate::fault::{FaultCode, FaultResolution};
use crate::map_area::MapPermission;
use crate::memory_set::MemorySet;
use alloc::vec::Vec;

/// Pages may be read
pub const PROT_READ: i32 = 0x1;
/// Pages may be written
pub const PROT_WRITE: i32 = 0x2;
/// Place the mapping exactly at the hint
pub const MAP_FIXED: i32 = 0x10;

fn prot_to_perm(prot: i32) -> Result<MapPermission, VmError> {
    match prot {
        PROT_READ => Ok(MapPermission::R),
        p if p == PROT_READ | PROT_WRITE => Ok(MapPermission::R | MapPermission::W),
        _ => Err(VmError::InvalidArgument),
    }
}

fn length(length: i32) -> Result<usize, VmError> {
    usize::try_from(length).map_err(|_| VmError::InvalidArgument)
}

fn to_ret(result: Result<usize, VmError>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(_) => -EINVAL,
    }
}

fn do_mmap(
    ms: &mut MemorySet,
    addr: usize,
    length: i32,
    prot: i32,
    flags: i32,
) -> Result<usize, VmError> {
    let len = self::length(length)?;
    let perm = prot_to_perm(prot)?;
    let fixed = match flags {
        0 => false,
        MAP_FIXED => true,
        _ => return Err(VmError::InvalidArgument),
    };
    ms.mmap(VirtAddr(addr), len, perm, fixed).map(usize::from)
}

fn do_mprotect(ms: &mut MemorySet, addr: usize, length: i32, prot: i32) -> Result<usize, VmError> {
    let len = self::length(length)?;
    let perm = prot_to_perm(prot)?;
    ms.mprotect(VirtAddr(addr), len, perm)?;
    Ok(0)
}

fn do_munmap(ms: &mut MemorySet, addr: usize, length: i32) -> Result<usize, VmError> {
    ms.munmap(VirtAddr(addr), self::length(length)?)?;
    Ok(0)
}

/// Map `length` bytes with protection `prot`.
///
/// # Returns
/// The start address of the region, or `-EINVAL`
pub fn sys_mmap(ms: &mut MemorySet, addr: usize, length: i32, prot: i32, flags: i32) -> isize {
    to_ret(do_mmap(ms, addr, length, prot, flags))
}

/// Unmap `[addr, addr + length)`.
///
/// # Returns
/// `0` on success, or `-EINVAL`
pub fn sys_munmap(ms: &mut MemorySet, addr: usize, length: i32) -> isize {
    to_ret(do_munmap(ms, addr, length))
}

/// Change the protection of `[addr, addr + length)`.
///
/// # Returns
/// `0` on success, or `-EINVAL`
pub fn sys_mprotect(ms: &mut MemorySet, addr: usize, length: i32, prot: i32) -> isize {
    to_ret(do_mprotect(ms, addr, length, prot))
}

/// Page-fault entry point.
///
/// # Returns
/// - `0` if copy-on-write made the page writable
/// - `1` if a new mapping was installed
/// - `-1` if the fault is fatal for the process
pub fn handle_page_fault(ms: &mut MemorySet, addr: usize, error_code: u32) -> isize {
    match ms.handle_page_fault(VirtAddr(addr), FaultCode::from_bits_truncate(error_code)) {
        Ok(FaultResolution::CopiedOnWrite) => 0,
        Ok(FaultResolution::Mapped) => 1,
        Err(_) => -1,
    }
}

/// Fork the address space at index `parent` of `spaces` and push the child.
///
/// # Returns
/// The index of the child, or `-1`
pub fn sys_cfork(spaces: &mut Vec<MemorySet>, parent: usize) -> isize {
    let Some(parent) = spaces.get_mut(parent) else {
        return -1;
    };
    match parent.fork() {
        Ok(child) => {
            spaces.push(child);
            (spaces.len() - 1) as isize
        }
        Err(_) => -1,
    }
}
