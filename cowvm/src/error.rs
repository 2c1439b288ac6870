//! Errors reported by the virtual-memory manager

use core::fmt::{self, Display, Formatter};

/// Reason a page fault could not be serviced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalFault {
    /// No segment or region covers the address.
    NoMapping,
    /// The address falls in the reserved zero-access area.
    ReservedArea,
    /// Write to an area that does not permit writing.
    WriteToReadOnly,
    /// Present fault that neither lazy allocation nor copy-on-write resolves.
    Unserviceable,
}

/// Errors reported while manipulating an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// Arguments supplied by the caller were invalid.
    InvalidArgument,
    /// A frame pool ran dry.
    OutOfMemory,
    /// The page-table walk hit an absent entry.
    NotPresent,
    /// The fault is terminal for the faulting process.
    Fatal(FatalFault),
}

impl From<FatalFault> for VmError {
    fn from(value: FatalFault) -> Self {
        Self::Fatal(value)
    }
}

impl Display for FatalFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FatalFault::NoMapping => write!(f, "no mapping covers the address"),
            FatalFault::ReservedArea => write!(f, "access to the reserved area"),
            FatalFault::WriteToReadOnly => write!(f, "write to a read-only area"),
            FatalFault::Unserviceable => write!(f, "fault cannot be serviced"),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidArgument => write!(f, "invalid argument"),
            VmError::OutOfMemory => write!(f, "out of physical frames"),
            VmError::NotPresent => write!(f, "page-table entry not present"),
            VmError::Fatal(fault) => write!(f, "fatal fault: {fault}"),
        }
    }
}
