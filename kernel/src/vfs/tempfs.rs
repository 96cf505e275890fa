use crate::sync::mutex::Mutex;
use crate::vfs::{Error, File, Result};
use alloc::{sync::Arc, vec::Vec};
use core::cmp::min;
use log::trace;

struct TempINode {
    data: Mutex<Vec<u8>>,
}

/// A handle to an in-memory file.
///
/// Every handle returned by [`File::reopen`] shares the same contents.
pub struct TempFile {
    inode: Arc<TempINode>,
}

impl TempFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inode: Arc::new(TempINode {
                data: Mutex::new(data),
            }),
        }
    }

    /// Number of handles currently open on this file, including this one.
    pub fn open_handles(&self) -> usize {
        Arc::strong_count(&self.inode)
    }

    /// A copy of the whole file.
    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }
}

impl File for TempFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        trace!("tempfs: read @ offset {} length {}", offset, buf.len());
        let data = self.inode.data.lock();
        if offset >= data.len() as u64 {
            // can't read any data
            return Ok(0);
        }
        let offset = usize::try_from(offset).map_err(|_| Error::Io)?;
        let read_len = min(buf.len(), data.len() - offset);
        buf[..read_len].copy_from_slice(&data[offset..offset + read_len]);
        Ok(read_len)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        trace!("tempfs: write @ offset {} length {}", offset, buf.len());
        if offset > (isize::MAX as u64).saturating_sub(buf.len() as u64) {
            // file data would exceed isize::MAX bytes
            return Err(Error::NoSpace);
        }
        let offset = usize::try_from(offset).map_err(|_| Error::NoSpace)?;
        let mut data = self.inode.data.lock();
        let end = offset + buf.len();
        if end > data.len() {
            // return no space error if allocation failed
            let extra = end - data.len();
            data.try_reserve(extra).map_err(|_| Error::NoSpace)?;
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn reopen(&self) -> Result<Arc<dyn File>> {
        Ok(Arc::new(TempFile {
            inode: self.inode.clone(),
        }))
    }

    fn length(&self) -> u64 {
        self.inode.data.lock().len() as u64
    }
}
