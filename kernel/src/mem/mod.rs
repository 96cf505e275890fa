//! Demand paging for user processes.

pub mod frame_allocator;
pub mod frame_table;
pub mod page;
pub mod page_table;
pub mod user;
pub mod vma;

use log::{trace, warn};
use page_table::SupplementalPageTable;
use thiserror::Error;

pub type Pid = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// Access to an address the process has no right to, or a write to a
    /// read-only page.
    #[error("segmentation fault at {0:#x}")]
    SegmentationFault(usize),
    /// The contents of the page could not be read or mapped.
    #[error("could not load page at {0:#x}")]
    LoadFailure(usize),
    #[error("out of memory: no frame could be reclaimed")]
    OutOfMemory,
    #[error("out of swap space")]
    OutOfSwapSpace,
    #[error("page {0:#x} is already mapped")]
    DuplicateMapping(usize),
    /// An evicted page could not be written to its file or to swap.
    #[error("could not write back page at {0:#x}")]
    WriteBackFailure(usize),
    #[error("invalid memory mapping")]
    InvalidMapping,
}

impl VmError {
    /// Whether the error leaves the kernel unable to continue, as opposed to
    /// only killing the faulting process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::OutOfSwapSpace | Self::WriteBackFailure(_)
        )
    }
}

/// What the trap handler knows about a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address.
    pub addr: usize,
    /// Whether the access was a write.
    pub write: bool,
    /// User stack pointer at the time of the fault.
    pub esp: usize,
}

impl PageFault {
    /// A fault raised on behalf of a system call touching user memory. There
    /// is no user stack pointer to compare against, so it never grows the stack.
    pub fn syscall(addr: usize, write: bool) -> Self {
        Self {
            addr,
            write,
            esp: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is mapped; the faulting instruction can be restarted.
    Resolved,
    /// The process has to be terminated.
    Kill { addr: usize, error: VmError },
}

/// Entry point for the page fault handler.
///
/// # Panics
///
/// Panics if the fault could only be resolved by reclaiming memory that the
/// system cannot reclaim.
pub fn handle_page_fault(spt: &SupplementalPageTable, fault: PageFault) -> FaultOutcome {
    match spt.resolve_fault(fault) {
        Ok(page) => {
            trace!(
                "pid {}: resolved fault at {:#x} (page {:#x})",
                spt.pid(),
                fault.addr,
                page.vaddr()
            );
            FaultOutcome::Resolved
        }
        Err(error) if error.is_fatal() => {
            panic!("pid {}: page fault at {:#x}: {}", spt.pid(), fault.addr, error)
        }
        Err(error) => {
            warn!("pid {}: {}", spt.pid(), error);
            FaultOutcome::Kill {
                addr: fault.addr,
                error,
            }
        }
    }
}
