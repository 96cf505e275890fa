use crate::mem::page::{FileSource, Page, PageKind};
use crate::mem::page_table::SupplementalPageTable;
use crate::mem::VmError;
use crate::vfs::File;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use kidneyos_vm_shared::mem::{is_page_aligned, is_user_vaddr, pg_round_up, OFFSET, PAGE_FRAME_SIZE};
use log::{debug, warn};

/// Identifies a memory mapping within its process.
pub type MapId = usize;

/// A file mapped into consecutive pages.
pub struct Mapping {
    file: Arc<dyn File>,
    base: usize,
    page_count: usize,
}

impl Mapping {
    /// The mapping's own handle on the file.
    pub fn file(&self) -> &Arc<dyn File> {
        &self.file
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    fn pages(&self) -> impl Iterator<Item = usize> {
        (self.base..self.base + self.page_count * PAGE_FRAME_SIZE).step_by(PAGE_FRAME_SIZE)
    }
}

/// The memory mappings of one process.
#[derive(Default)]
pub struct MappingList {
    next_id: MapId,
    mappings: BTreeMap<MapId, Mapping>,
}

impl MappingList {
    fn add(&mut self, mapping: Mapping) -> MapId {
        let id = self.next_id;
        self.next_id += 1;
        self.mappings.insert(id, mapping);
        id
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl SupplementalPageTable {
    /// Maps `file` at `addr`, one lazily loaded page per page of the file.
    ///
    /// The mapping keeps its own handle on the file. Fails with
    /// [`VmError::InvalidMapping`] if `addr` is null or unaligned, the file is
    /// empty, or any page of the range is already in use.
    pub fn mmap(&self, file: &dyn File, addr: usize) -> Result<MapId, VmError> {
        let length = usize::try_from(file.length()).map_err(|_| VmError::InvalidMapping)?;
        if addr == 0 || !is_page_aligned(addr) || length == 0 {
            return Err(VmError::InvalidMapping);
        }
        let size = pg_round_up(length);
        let end = addr.checked_add(size).ok_or(VmError::InvalidMapping)?;
        if !is_user_vaddr(addr) || end > OFFSET {
            return Err(VmError::InvalidMapping);
        }
        let file = file.reopen().map_err(|_| VmError::InvalidMapping)?;

        {
            let mut pages = self.pages.lock();
            if pages.range(addr..end).next().is_some() {
                return Err(VmError::InvalidMapping);
            }
            for vaddr in (addr..end).step_by(PAGE_FRAME_SIZE) {
                let offset = vaddr - addr;
                let source = FileSource {
                    file: file.clone(),
                    offset: offset as u64,
                    read_bytes: (length - offset).min(PAGE_FRAME_SIZE),
                    mapped: true,
                };
                pages.insert(vaddr, Arc::new(Page::new(vaddr, true, PageKind::File(source))));
            }
        }

        let page_count = size / PAGE_FRAME_SIZE;
        let id = self.mappings.lock().add(Mapping {
            file,
            base: addr,
            page_count,
        });
        debug!(
            "pid {}: mmap {} at {:#x} ({} bytes, {} pages)",
            self.pid(),
            id,
            addr,
            length,
            page_count
        );
        Ok(id)
    }

    /// Removes mapping `id`, writing its dirty pages back to the file.
    ///
    /// Every page is released even if a write-back fails; the first failure is
    /// returned.
    pub fn munmap(&self, id: MapId) -> Result<(), VmError> {
        let mapping = self
            .mappings
            .lock()
            .mappings
            .remove(&id)
            .ok_or(VmError::InvalidMapping)?;

        let mut result = Ok(());
        for vaddr in mapping.pages() {
            let removed = self.pages.lock().remove(&vaddr);
            if let Some(page) = removed {
                let released = self.release_page(&page, true);
                if result.is_ok() {
                    result = released;
                }
            }
        }
        debug!(
            "pid {}: munmap {} at {:#x} ({} pages)",
            self.pid(),
            id,
            mapping.base,
            mapping.page_count
        );
        result
    }

    pub(super) fn unmap_all(&self) {
        let ids: Vec<MapId> = self.mappings.lock().mappings.keys().copied().collect();
        for id in ids {
            if let Err(error) = self.munmap(id) {
                warn!("pid {}: munmap {} on exit: {}", self.pid(), id, error);
            }
        }
    }

    /// The mapping `id`, if it exists.
    pub fn mapping<R>(&self, id: MapId, f: impl FnOnce(&Mapping) -> R) -> Option<R> {
        self.mappings.lock().mappings.get(&id).map(f)
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }
}
