use crate::mem::frame_allocator::Kpage;
use crate::swapping::SwapSlot;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::vfs::File;
use alloc::sync::Arc;
use bitbybit::bitfield;
use core::fmt;

#[bitfield(u8, default = 0)]
#[derive(Debug)]
pub struct PageFlags {
    #[bit(0, rw)]
    accessed: bool,
    #[bit(1, rw)]
    dirty: bool,
}

/// A run of file content backing one page.
#[derive(Clone)]
pub struct FileSource {
    pub file: Arc<dyn File>,
    pub offset: u64,
    /// Bytes of the page that come from the file; the rest of the page is zero.
    pub read_bytes: usize,
    /// Pages of a memory mapping are written back to `file` instead of swap.
    pub mapped: bool,
}

impl FileSource {
    /// Fills the start of `page` from the file. Fails on a short read.
    pub(crate) fn read_into(&self, page: &mut [u8]) -> bool {
        let buf = &mut page[..self.read_bytes];
        matches!(self.file.read_at(buf, self.offset), Ok(n) if n == buf.len())
    }

    /// Writes the file's part of `page` back. Fails on a short write.
    pub(crate) fn write_from(&self, page: &[u8]) -> bool {
        let buf = &page[..self.read_bytes];
        matches!(self.file.write_at(buf, self.offset), Ok(n) if n == buf.len())
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("mapped", &self.mapped)
            .finish_non_exhaustive()
    }
}

/// Where the contents of a page come from the next time it is loaded.
#[derive(Debug, Clone)]
pub enum PageKind {
    /// Fresh page of zeroes.
    Zero,
    /// Executable segment or memory-mapped file content.
    File(FileSource),
    /// Evicted to the swap partition.
    Swap(SwapSlot),
    /// The only copy of the contents is the frame the page is resident in.
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Resident(Kpage),
    Swapped(SwapSlot),
    NotLoaded,
}

/// The mutable part of a page entry.
///
/// Lock order: a page's state may be locked while its frame is held, never
/// the other way around.
#[derive(Debug)]
pub struct PageState {
    pub(crate) frame: Option<Kpage>,
    pub(crate) kind: PageKind,
    pub(crate) flags: PageFlags,
}

impl PageState {
    pub fn residency(&self) -> Residency {
        match (self.frame, &self.kind) {
            (Some(kpage), _) => Residency::Resident(kpage),
            (None, PageKind::Swap(slot)) => Residency::Swapped(*slot),
            (None, _) => Residency::NotLoaded,
        }
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub(crate) fn touch(&mut self, write: bool) {
        self.flags = self.flags.with_accessed(true);
        if write {
            self.flags = self.flags.with_dirty(true);
        }
    }

    /// Whether evicting the page needs its contents to be saved somewhere.
    pub(crate) fn must_save(&self) -> bool {
        self.flags.dirty() || matches!(self.kind, PageKind::Anonymous)
    }

    /// The file backing the page, if it belongs to a memory mapping.
    pub(crate) fn mapped_file(&self) -> Option<&FileSource> {
        match &self.kind {
            PageKind::File(source) if source.mapped => Some(source),
            _ => None,
        }
    }
}

/// A virtual page known to a process.
#[derive(Debug)]
pub struct Page {
    vaddr: usize,
    writable: bool,
    state: Mutex<PageState>,
}

impl Page {
    pub(crate) fn new(vaddr: usize, writable: bool, kind: PageKind) -> Self {
        Self {
            vaddr,
            writable,
            state: Mutex::new(PageState {
                frame: None,
                kind,
                flags: PageFlags::DEFAULT,
            }),
        }
    }

    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, PageState>> {
        self.state.try_lock()
    }

    pub fn residency(&self) -> Residency {
        self.lock().residency()
    }

    pub fn is_accessed(&self) -> bool {
        self.lock().flags.accessed()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().flags.dirty()
    }
}
