use crate::block::{Block, BlockManager, BlockType};
use crate::mem::frame_table::FrameTable;
use crate::swapping::SwapSpace;
use alloc::{boxed::Box, sync::Arc};
use kidneyos_vm_shared::mem::{HAND_SPREAD, STACK_SLACK, USER_STACK_SIZE};
use once_cell::race::OnceBox;
use thiserror::Error;

/// Tunables of the virtual memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames available to user pages.
    pub user_frames: usize,
    /// Size of the region below the top of user space reserved for the stack.
    pub max_stack_size: usize,
    /// How far below the stack pointer a fault still grows the stack.
    pub stack_slack: usize,
    /// Divisor of the frame count giving the distance between the clock hands.
    pub hand_spread: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: 1024,
            max_stack_size: USER_STACK_SIZE,
            stack_slack: STACK_SLACK,
            hand_spread: HAND_SPREAD,
        }
    }
}

/// The state shared by every process: user frames and swap.
pub struct VmSystem {
    config: VmConfig,
    frames: FrameTable,
    swap: Arc<SwapSpace>,
}

impl VmSystem {
    pub fn new(config: VmConfig, swap_block: Arc<Block>) -> Self {
        let swap = Arc::new(SwapSpace::new(swap_block));
        Self {
            config,
            frames: FrameTable::new(config.user_frames, config.hand_spread, swap.clone()),
            swap,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("no swap device is registered")]
    NoSwapDevice,
    #[error("virtual memory is already initialized")]
    AlreadyInitialized,
}

static VM_SYSTEM: OnceBox<Arc<VmSystem>> = OnceBox::new();

/// Sets up the kernel-wide virtual memory system on the swap device registered
/// in `blocks`. Can succeed only once.
pub fn vm_init(
    config: VmConfig,
    blocks: &BlockManager,
) -> Result<&'static Arc<VmSystem>, InitError> {
    let swap_block = blocks
        .by_role(BlockType::Swap)
        .ok_or(InitError::NoSwapDevice)?;
    VM_SYSTEM
        .set(Box::new(Arc::new(VmSystem::new(config, swap_block))))
        .map_err(|_| InitError::AlreadyInitialized)?;
    vm_system().ok_or(InitError::AlreadyInitialized)
}

/// The system set up by [`vm_init`], if it has run.
pub fn vm_system() -> Option<&'static Arc<VmSystem>> {
    VM_SYSTEM.get()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{VmConfig, VmSystem};
    use crate::block::{Block, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::mem::page_table::SupplementalPageTable;
    use crate::mem::Pid;
    use crate::paging::PageDirectory;
    use alloc::sync::Arc;
    use kidneyos_vm_shared::mem::SECTORS_PER_PAGE;

    /// A system with `user_frames` frames and room for `swap_slots` pages of swap.
    pub fn system(user_frames: usize, swap_slots: u32) -> Arc<VmSystem> {
        let sectors = swap_slots * SECTORS_PER_PAGE;
        let block = Block::new(BlockType::Swap, "swap", sectors, RamDisk::new(sectors));
        let config = VmConfig {
            user_frames,
            ..VmConfig::default()
        };
        Arc::new(VmSystem::new(config, Arc::new(block)))
    }

    pub fn process(system: &Arc<VmSystem>, pid: Pid) -> (SupplementalPageTable, Arc<PageDirectory>) {
        let pagedir = Arc::new(PageDirectory::new());
        let spt = SupplementalPageTable::new(pid, system.clone(), pagedir.clone());
        (spt, pagedir)
    }
}
