use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::mutex::Mutex;
use alloc::{vec, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

/// A block device driver backed by kernel memory.
///
/// Used as the swap partition when no disk is attached, and by tests. Writes
/// can be made to fail to exercise I/O error paths.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
}

impl RamDisk {
    /// Creates a zeroed disk of `sectors` sectors.
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: Mutex::new(vec![0; sectors as usize * BLOCK_SECTOR_SIZE]),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail with [`BlockError::WriteError`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn range(sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let data = self.data.lock();
        let src = data.get(Self::range(sector)).ok_or(BlockError::ReadError)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(BlockError::WriteError);
        }
        let mut data = self.data.lock();
        let dst = data
            .get_mut(Self::range(sector))
            .ok_or(BlockError::WriteError)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}
