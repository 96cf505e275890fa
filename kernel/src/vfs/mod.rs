//! The slice of the file system the VM subsystem depends on: positioned
//! reads and writes on an open file.

pub mod tempfs;

use alloc::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// no space left on device
    #[error("no space left on device")]
    NoSpace,
    /// low-level I/O error from the underlying device
    #[error("I/O error")]
    Io,
    /// the file cannot be reopened (e.g. it was removed)
    #[error("file is no longer available")]
    Stale,
}

pub type Result<T> = core::result::Result<T, Error>;

/// An open file.
///
/// Offsets are explicit; an open file has no cursor the VM code relies on.
pub trait File: Send + Sync {
    /// Read from the file into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    /// Write `buf` into the file starting at `offset`.
    ///
    /// Returns the number of bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    /// Open a new handle to the same file, with an independent lifetime.
    ///
    /// Memory mappings keep their own handle so that the mapping survives the
    /// process closing the descriptor it was created from.
    fn reopen(&self) -> Result<Arc<dyn File>>;
    /// Size of the file in bytes.
    fn length(&self) -> u64;
}
