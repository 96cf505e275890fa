use crate::mem::frame_table::{Frame, FrameBinding};
use crate::mem::page::{FileSource, Page, PageKind, PageState};
use crate::mem::vma::MappingList;
use crate::mem::{PageFault, Pid, VmError};
use crate::paging::AddressSpace;
use crate::sync::mutex::Mutex;
use crate::system::VmSystem;
use crate::vfs::File;
use alloc::{collections::btree_map::Entry, collections::BTreeMap, sync::Arc};
use kidneyos_vm_shared::mem::{
    is_page_aligned, is_stack_vaddr, is_user_vaddr, pg_round_down, OFFSET, PAGE_FRAME_SIZE,
};
use log::debug;

/// Everything a process's virtual pages should contain, resident or not.
///
/// Only the owning process faults pages in, but its resident pages can be
/// evicted by any thread at any time.
pub struct SupplementalPageTable {
    pid: Pid,
    system: Arc<VmSystem>,
    pagedir: Arc<dyn AddressSpace>,
    pub(super) pages: Mutex<BTreeMap<usize, Arc<Page>>>,
    pub(super) mappings: Mutex<MappingList>,
}

impl SupplementalPageTable {
    pub fn new(pid: Pid, system: Arc<VmSystem>, pagedir: Arc<dyn AddressSpace>) -> Self {
        Self {
            pid,
            system,
            pagedir,
            pages: Mutex::new(BTreeMap::new()),
            mappings: Mutex::new(MappingList::default()),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn system(&self) -> &Arc<VmSystem> {
        &self.system
    }

    pub fn pagedir(&self) -> &Arc<dyn AddressSpace> {
        &self.pagedir
    }

    /// The page containing `vaddr`.
    pub fn page(&self, vaddr: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&pg_round_down(vaddr)).cloned()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(super) fn insert(&self, page: Page) -> Result<Arc<Page>, VmError> {
        let vaddr = page.vaddr();
        if !is_user_vaddr(vaddr) || !is_page_aligned(vaddr) {
            return Err(VmError::SegmentationFault(vaddr));
        }
        match self.pages.lock().entry(vaddr) {
            Entry::Occupied(_) => Err(VmError::DuplicateMapping(vaddr)),
            Entry::Vacant(entry) => Ok(entry.insert(Arc::new(page)).clone()),
        }
    }

    /// Registers a zero-filled page at `vaddr`, to be loaded on first access.
    pub fn allocate(&self, vaddr: usize, writable: bool) -> Result<Arc<Page>, VmError> {
        self.insert(Page::new(vaddr, writable, PageKind::Zero))
    }

    /// Registers the pages of an executable segment starting at `upage`.
    ///
    /// The first `read_bytes` bytes come from `file` starting at `offset`; the
    /// following `zero_bytes` bytes are zero. Nothing is read until the pages
    /// are faulted in. Either every page of the segment is registered or none
    /// is: a range that overflows or reaches kernel space is a
    /// [`VmError::LoadFailure`], one that overlaps existing pages a
    /// [`VmError::DuplicateMapping`].
    pub fn load_segment(
        &self,
        file: &Arc<dyn File>,
        mut offset: u64,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        let end = read_bytes
            .checked_add(zero_bytes)
            .filter(|total| is_page_aligned(*total))
            .and_then(|total| upage.checked_add(total))
            .filter(|end| *end <= OFFSET)
            .ok_or(VmError::LoadFailure(upage))?;
        if !is_page_aligned(upage) || !is_user_vaddr(upage) {
            return Err(VmError::LoadFailure(upage));
        }

        let mut pages = self.pages.lock();
        if let Some((&taken, _)) = pages.range(upage..end).next() {
            return Err(VmError::DuplicateMapping(taken));
        }
        let mut remaining = read_bytes;
        for vaddr in (upage..end).step_by(PAGE_FRAME_SIZE) {
            let page_read = remaining.min(PAGE_FRAME_SIZE);
            let kind = if page_read == 0 {
                PageKind::Zero
            } else {
                PageKind::File(FileSource {
                    file: file.clone(),
                    offset,
                    read_bytes: page_read,
                    mapped: false,
                })
            };
            pages.insert(vaddr, Arc::new(Page::new(vaddr, writable, kind)));
            remaining -= page_read;
            offset += page_read as u64;
        }
        Ok(())
    }

    fn is_stack_access(&self, fault: &PageFault) -> bool {
        let config = self.system.config();
        is_stack_vaddr(pg_round_down(fault.addr), config.max_stack_size)
            && fault.addr >= fault.esp.saturating_sub(config.stack_slack)
    }

    /// Makes the page containing `fault.addr` resident and mapped.
    ///
    /// A missing page is created only for an access close enough below the
    /// stack pointer to be stack growth. Errors are
    /// [`VmError::SegmentationFault`] for illegal accesses,
    /// [`VmError::LoadFailure`] when the contents cannot be read or mapped
    /// (the frame goes back to the pool), or a fatal error from evicting
    /// another page to make room.
    pub fn resolve_fault(&self, fault: PageFault) -> Result<Arc<Page>, VmError> {
        if !is_user_vaddr(fault.addr) {
            return Err(VmError::SegmentationFault(fault.addr));
        }
        let upage = pg_round_down(fault.addr);
        let page = match self.page(upage) {
            Some(page) => page,
            None if self.is_stack_access(&fault) => self
                .pages
                .lock()
                .entry(upage)
                .or_insert_with(|| Arc::new(Page::new(upage, true, PageKind::Zero)))
                .clone(),
            None => return Err(VmError::SegmentationFault(fault.addr)),
        };
        if fault.write && !page.writable() {
            return Err(VmError::SegmentationFault(fault.addr));
        }
        self.make_resident(&page, fault.write)?;
        Ok(page)
    }

    fn make_resident(&self, page: &Arc<Page>, write: bool) -> Result<(), VmError> {
        let frames = self.system.frames();
        loop {
            let resident = page.lock().frame;
            if let Some(kpage) = resident {
                let frame = frames.lock(kpage);
                if frame.is_bound_to(page) {
                    page.lock().touch(write);
                    return Ok(());
                }
                // Evicted while we waited for the frame.
                continue;
            }

            let mut frame = frames.allocate()?;
            let mut state = page.lock();
            if state.frame.is_some() {
                drop(state);
                frames.release(frame);
                continue;
            }

            let loaded = self.fill(&mut frame, page.vaddr(), &state).and_then(|()| {
                if self
                    .pagedir
                    .install_translation(page.vaddr(), frame.kpage(), page.writable())
                {
                    Ok(())
                } else {
                    Err(VmError::LoadFailure(page.vaddr()))
                }
            });
            if let Err(error) = loaded {
                drop(state);
                frames.release(frame);
                return Err(error);
            }

            if let PageKind::Swap(slot) = state.kind {
                self.system.swap().free(slot);
                state.kind = PageKind::Anonymous;
            }
            state.frame = Some(frame.kpage());
            state.touch(write);
            drop(state);
            frame.bind(FrameBinding {
                pid: self.pid,
                page: page.clone(),
                pagedir: self.pagedir.clone(),
            });
            return Ok(());
        }
    }

    /// Loads the contents of a non-resident page into a zeroed frame.
    fn fill(&self, frame: &mut Frame, vaddr: usize, state: &PageState) -> Result<(), VmError> {
        let loaded = match &state.kind {
            PageKind::Zero => true,
            PageKind::File(source) => source.read_into(frame.data_mut()),
            PageKind::Swap(slot) => self.system.swap().swap_in(*slot, frame).is_ok(),
            // Anonymous pages are never without a frame.
            PageKind::Anonymous => false,
        };
        if loaded {
            Ok(())
        } else {
            Err(VmError::LoadFailure(vaddr))
        }
    }

    /// Forgets the page at `vaddr`, releasing its frame and swap slot.
    pub fn free(&self, vaddr: usize) -> Result<(), VmError> {
        let page = self
            .pages
            .lock()
            .remove(&pg_round_down(vaddr))
            .ok_or(VmError::SegmentationFault(vaddr))?;
        self.release_page(&page, false)
    }

    /// Detaches `page` from its frame and backing store. With `write_back`, a
    /// dirty memory-mapped page is written to its file first.
    pub(super) fn release_page(&self, page: &Arc<Page>, write_back: bool) -> Result<(), VmError> {
        let frames = self.system.frames();
        loop {
            let resident = {
                let mut state = page.lock();
                match state.frame {
                    Some(kpage) => kpage,
                    None => {
                        if let PageKind::Swap(slot) = state.kind {
                            self.system.swap().free(slot);
                            state.kind = PageKind::Zero;
                        }
                        return Ok(());
                    }
                }
            };

            let frame = frames.lock(resident);
            if !frame.is_bound_to(page) {
                continue;
            }
            let mut state = page.lock();
            if self.pagedir.clear_translation(page.vaddr()) {
                state.flags = state.flags.with_dirty(true);
            }
            let mut result = Ok(());
            if write_back && state.flags.dirty() {
                if let Some(source) = state.mapped_file() {
                    if !source.write_from(frame.data()) {
                        result = Err(VmError::WriteBackFailure(page.vaddr()));
                    }
                }
            }
            state.frame = None;
            drop(state);
            frames.release(frame);
            return result;
        }
    }

    /// Releases every page and mapping of the process. Dirty mapped pages are
    /// written back to their files.
    pub fn destroy(&self) {
        self.unmap_all();
        let pages = core::mem::take(&mut *self.pages.lock());
        let count = pages.len();
        for page in pages.into_values() {
            // Without write-back, releasing cannot fail.
            let _ = self.release_page(&page, false);
        }
        debug!("pid {}: released {} pages", self.pid, count);
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.destroy();
    }
}
