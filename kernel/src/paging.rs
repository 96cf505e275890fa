//! The kernel's view of a process's hardware address translations.
//!
//! The VM core never touches page tables directly; it asks the owning
//! process's [`AddressSpace`] to map or unmap single user pages.

use crate::mem::frame_allocator::Kpage;
use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use arbitrary_int::u20;
use kidneyos_vm_shared::{
    mem::{is_page_aligned, pg_round_down},
    paging::{PageTableEntry, VirtualAddress},
};

/// Installs and removes user page translations for one process.
pub trait AddressSpace: Send + Sync {
    /// Maps user page `upage` to physical frame `kpage`.
    ///
    /// Returns `false` if `upage` is already mapped or the translation
    /// structures could not be allocated.
    fn install_translation(&self, upage: usize, kpage: Kpage, writable: bool) -> bool;
    /// Removes the translation for `upage`, so that the next access faults.
    ///
    /// Returns whether the page was written through the translation.
    fn clear_translation(&self, upage: usize) -> bool;
    /// The frame `upage` currently translates to.
    fn translate(&self, upage: usize) -> Option<Kpage>;
    /// Whether the page was written through its translation.
    fn is_dirty(&self, upage: usize) -> bool;
    /// Whether the page was read or written through its translation since the
    /// accessed bit was last cleared.
    fn is_accessed(&self, upage: usize) -> bool;
    fn set_accessed(&self, upage: usize, accessed: bool);
}

/// A software page directory: user page number to [`PageTableEntry`].
///
/// This is what the kernel uses for processes on the host, and the fixture
/// tests inspect to check that frames and mappings agree.
#[derive(Default)]
pub struct PageDirectory {
    entries: Mutex<BTreeMap<u32, PageTableEntry>>,
    /// Maximum number of present entries, standing in for running out of
    /// memory for page tables.
    limit: Option<usize>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directory that refuses to hold more than `limit` translations.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            limit: Some(limit),
        }
    }

    fn page_number(upage: usize) -> Option<u32> {
        let va = VirtualAddress::from_usize(upage)?;
        if !va.is_user() || !is_page_aligned(upage) {
            return None;
        }
        Some(va.page_number().value())
    }

    /// The raw entry for `upage`, if one is present.
    pub fn entry(&self, upage: usize) -> Option<PageTableEntry> {
        let number = Self::page_number(upage)?;
        self.entries.lock().get(&number).copied()
    }

    /// Performs a user access to `addr` the way the MMU does: sets the
    /// accessed bit, and the dirty bit for a write. Returns the frame the
    /// access reaches, or `None` if it would fault.
    pub fn access(&self, addr: usize, write: bool) -> Option<Kpage> {
        let number = Self::page_number(pg_round_down(addr))?;
        let mut entries = self.entries.lock();
        let pte = entries.get_mut(&number).filter(|pte| pte.present())?;
        if write && !pte.read_write() {
            return None;
        }
        *pte = pte.with_accessed(true).with_dirty(pte.dirty() || write);
        Some(pte.page_frame_address().value() as Kpage)
    }

    fn update(&self, upage: usize, f: impl FnOnce(&mut PageTableEntry)) {
        if let Some(number) = Self::page_number(upage) {
            if let Some(pte) = self.entries.lock().get_mut(&number) {
                f(pte);
            }
        }
    }

    /// Number of present translations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AddressSpace for PageDirectory {
    fn install_translation(&self, upage: usize, kpage: Kpage, writable: bool) -> bool {
        let Some(number) = Self::page_number(upage) else {
            return false;
        };
        let Some(frame) = u32::try_from(kpage)
            .ok()
            .filter(|k| *k < 1 << 20)
            .map(u20::new)
        else {
            return false;
        };
        let mut entries = self.entries.lock();
        if entries.contains_key(&number) || self.limit.is_some_and(|l| entries.len() >= l) {
            return false;
        }
        entries.insert(number, PageTableEntry::user(frame, writable));
        true
    }

    fn clear_translation(&self, upage: usize) -> bool {
        Self::page_number(upage)
            .and_then(|number| self.entries.lock().remove(&number))
            .is_some_and(|pte| pte.dirty())
    }

    fn translate(&self, upage: usize) -> Option<Kpage> {
        self.entry(upage)
            .filter(|pte| pte.present())
            .map(|pte| pte.page_frame_address().value() as Kpage)
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|pte| pte.dirty())
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|pte| pte.accessed())
    }

    fn set_accessed(&self, upage: usize, accessed: bool) {
        self.update(upage, |pte| *pte = pte.with_accessed(accessed));
    }
}
