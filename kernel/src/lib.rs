//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! Each process owns a [`SupplementalPageTable`](mem::page_table::SupplementalPageTable)
//! describing what every one of its virtual pages should contain. Physical
//! frames are handed out by the shared [`FrameTable`](mem::frame_table::FrameTable);
//! when it runs dry, a two-handed clock picks a victim whose contents are
//! pushed to its backing store (its file, or the swap partition) so the frame
//! can be reused.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod vfs;

pub use mem::{handle_page_fault, FaultOutcome, PageFault, VmError};
pub use system::{vm_init, vm_system, VmConfig, VmSystem};
