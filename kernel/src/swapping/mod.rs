//! The swap partition: page-sized slots holding anonymous page contents
//! while they are not resident.

pub mod page_replacement;
pub mod swap_bitmap;

use crate::block::{Block, BlockError, BlockSector, BLOCK_SECTOR_SIZE};
use crate::mem::frame_table::Frame;
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_vm_shared::mem::SECTORS_PER_PAGE;
use log::{info, trace};
use swap_bitmap::SwapBitmap;
use thiserror::Error;

/// Index of a page-sized run of sectors on the swap partition.
pub type SwapSlot = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SwapError {
    #[error("no free swap slot")]
    Full,
    #[error("swap I/O failed: {0}")]
    Io(#[from] BlockError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapStats {
    pub total_slots: u32,
    pub used_slots: u32,
    pub pages_in: usize,
    pub pages_out: usize,
}

pub struct SwapSpace {
    block: Arc<Block>,
    bitmap: Mutex<SwapBitmap>,
    pages_in: AtomicUsize,
    pages_out: AtomicUsize,
}

impl SwapSpace {
    /// Uses all of `block` for swap. A trailing partial page worth of sectors is ignored.
    pub fn new(block: Arc<Block>) -> Self {
        let slots = block.get_size() / SECTORS_PER_PAGE;
        info!(
            "swap: using \"{}\" ({} sectors) as {} page slots",
            block.get_name(),
            block.get_size(),
            slots
        );
        Self {
            block,
            bitmap: Mutex::new(SwapBitmap::new(slots)),
            pages_in: AtomicUsize::new(0),
            pages_out: AtomicUsize::new(0),
        }
    }

    /// Sector holding the `index`th sector-sized chunk of `slot`.
    // `index` is below SECTORS_PER_PAGE.
    #[allow(clippy::cast_possible_truncation)]
    fn sector(slot: SwapSlot, index: usize) -> BlockSector {
        slot * SECTORS_PER_PAGE + index as BlockSector
    }

    /// Reads the page stored in `slot` into `frame`.
    ///
    /// The slot stays occupied; the caller frees it once the page is mapped
    /// again, so a failure part way through leaves the data recoverable.
    pub fn swap_in(&self, slot: SwapSlot, frame: &mut Frame) -> Result<(), SwapError> {
        debug_assert!(self.bitmap.lock().is_used(slot), "swap_in from free slot {}", slot);
        for (i, chunk) in frame.data_mut().chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            self.block.read(Self::sector(slot, i), chunk)?;
        }
        self.pages_in.fetch_add(1, Ordering::Relaxed);
        trace!("swap: read slot {} into kpage {}", slot, frame.kpage());
        Ok(())
    }

    /// Writes `frame` to a newly allocated slot and returns the slot.
    ///
    /// Fails with [`SwapError::Full`] without touching the device when every
    /// slot is occupied.
    pub fn swap_out(&self, frame: &Frame) -> Result<SwapSlot, SwapError> {
        let slot = self.bitmap.lock().scan_and_flip().ok_or(SwapError::Full)?;
        for (i, chunk) in frame.data().chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            if let Err(err) = self.block.write(Self::sector(slot, i), chunk) {
                self.free(slot);
                return Err(err.into());
            }
        }
        self.pages_out.fetch_add(1, Ordering::Relaxed);
        trace!("swap: wrote kpage {} to slot {}", frame.kpage(), slot);
        Ok(slot)
    }

    /// Releases `slot`, whose contents are no longer needed.
    pub fn free(&self, slot: SwapSlot) {
        self.bitmap.lock().free(slot);
    }

    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().is_used(slot)
    }

    pub fn stats(&self) -> SwapStats {
        let bitmap = self.bitmap.lock();
        SwapStats {
            total_slots: bitmap.len(),
            used_slots: bitmap.used(),
            pages_in: self.pages_in.load(Ordering::Relaxed),
            pages_out: self.pages_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use crate::drivers::ram_disk::RamDisk;
    use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;

    fn swap_with_slots(slots: u32) -> (SwapSpace, Arc<RamDisk>) {
        let disk = Arc::new(RamDisk::new(slots * SECTORS_PER_PAGE));
        let block = Block::new(BlockType::Swap, "swap", slots * SECTORS_PER_PAGE, disk.clone());
        (SwapSpace::new(Arc::new(block)), disk)
    }

    fn patterned_frame(kpage: usize, seed: u8) -> Frame {
        let mut frame = Frame::new(kpage);
        for (i, byte) in frame.data_mut().iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        frame
    }

    #[test]
    fn test_round_trip() {
        let (swap, _) = swap_with_slots(4);
        let first = patterned_frame(0, 1);
        let second = patterned_frame(1, 99);
        let a = swap.swap_out(&first).unwrap();
        let b = swap.swap_out(&second).unwrap();
        assert_ne!(a, b);

        let mut target = Frame::new(2);
        swap.swap_in(b, &mut target).unwrap();
        assert_eq!(target.data()[..], second.data()[..]);
        swap.swap_in(a, &mut target).unwrap();
        assert_eq!(target.data()[..], first.data()[..]);

        let stats = swap.stats();
        assert_eq!(stats.used_slots, 2);
        assert_eq!(stats.pages_out, 2);
        assert_eq!(stats.pages_in, 2);
    }

    #[test]
    fn test_full_swap_is_an_error() {
        let (swap, _) = swap_with_slots(2);
        let frame = patterned_frame(0, 7);
        swap.swap_out(&frame).unwrap();
        swap.swap_out(&frame).unwrap();
        assert_eq!(swap.swap_out(&frame), Err(SwapError::Full));
        assert_eq!(swap.stats().used_slots, 2);

        swap.free(0);
        assert_eq!(swap.swap_out(&frame), Ok(0));
    }

    #[test]
    fn test_partial_page_of_sectors_is_unused() {
        let disk = RamDisk::new(SECTORS_PER_PAGE * 2 + 3);
        let block = Block::new(BlockType::Swap, "swap", SECTORS_PER_PAGE * 2 + 3, disk);
        let swap = SwapSpace::new(Arc::new(block));
        assert_eq!(swap.stats().total_slots, 2);
        assert_eq!(PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE, SECTORS_PER_PAGE as usize);
    }

    #[test]
    fn test_write_error_releases_slot() {
        let (swap, disk) = swap_with_slots(2);
        disk.set_fail_writes(true);
        let frame = patterned_frame(0, 3);
        assert!(matches!(swap.swap_out(&frame), Err(SwapError::Io(BlockError::WriteError))));
        assert_eq!(swap.stats().used_slots, 0);
    }
}
