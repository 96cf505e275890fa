//! The system-wide inventory of user frames and the eviction path that
//! reclaims them.
//!
//! Locks are taken in this order: the table lock, then a frame lock, then the
//! state lock of the page bound to that frame. While holding the table lock
//! the clock only ever *tries* frame and page locks, so a thread that holds a
//! frame may still wait for the table.

use crate::mem::frame_allocator::{Kpage, UserPool};
use crate::mem::page::{Page, PageKind, PageState};
use crate::mem::{Pid, VmError};
use crate::paging::AddressSpace;
use crate::swapping::page_replacement::{ClockFace, PageReplacementPolicy, TwoHandedClock};
use crate::swapping::{SwapError, SwapSpace};
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::{boxed::Box, collections::BTreeSet, sync::Arc, vec};
use core::ops::{Deref, DerefMut};
use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, info};

/// Clock sweeps that may come up empty before allocation gives up.
const EVICTION_ATTEMPTS: usize = 1024;

/// Lets the holders of busy frames make progress before the next sweep.
fn backoff() {
    #[cfg(not(target_os = "none"))]
    std::thread::yield_now();
    #[cfg(target_os = "none")]
    core::hint::spin_loop();
}

/// Who a resident frame belongs to.
pub struct FrameBinding {
    pub pid: Pid,
    pub page: Arc<Page>,
    pub pagedir: Arc<dyn AddressSpace>,
}

/// One physical user frame and the page resident in it.
pub struct Frame {
    kpage: Kpage,
    data: Box<[u8]>,
    binding: Option<FrameBinding>,
}

impl Frame {
    pub(crate) fn new(kpage: Kpage) -> Self {
        Self {
            kpage,
            data: vec![0; PAGE_FRAME_SIZE].into_boxed_slice(),
            binding: None,
        }
    }

    pub fn kpage(&self) -> Kpage {
        self.kpage
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn binding(&self) -> Option<&FrameBinding> {
        self.binding.as_ref()
    }

    /// Whether `page` is the page resident in this frame.
    pub fn is_bound_to(&self, page: &Arc<Page>) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| Arc::ptr_eq(&binding.page, page))
    }

    pub(crate) fn bind(&mut self, binding: FrameBinding) {
        assert!(
            self.binding.is_none(),
            "frame {} is already bound",
            self.kpage
        );
        self.binding = Some(binding);
    }

    pub(crate) fn unbind(&mut self) -> Option<FrameBinding> {
        self.binding.take()
    }
}

/// Exclusive access to a frame. Dropping the guard unlocks the frame; it
/// stays allocated until passed to [`FrameTable::release`].
pub struct FrameGuard<'a> {
    inner: MutexGuard<'a, Frame>,
}

impl Deref for FrameGuard<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.inner
    }
}

impl DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut Frame {
        &mut self.inner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub evictions: usize,
}

struct TableInner {
    pool: UserPool,
    clock: TwoHandedClock,
    evictions: usize,
}

pub struct FrameTable {
    frames: Box<[Mutex<Frame>]>,
    inner: Mutex<TableInner>,
    swap: Arc<SwapSpace>,
}

/// The clock's view of the frames while the table lock is held.
///
/// Busy frames and pages are skipped rather than waited for. The frame lock of
/// a claimed victim is kept so nobody can touch it before it is reclaimed.
struct Sweep<'a> {
    frames: &'a [Mutex<Frame>],
    victim: Option<MutexGuard<'a, Frame>>,
}

impl ClockFace for Sweep<'_> {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn age(&mut self, index: usize) {
        let frames = self.frames;
        let Some(frame) = frames[index].try_lock() else {
            return;
        };
        if let Some(binding) = frame.binding() {
            if let Some(mut state) = binding.page.try_lock() {
                state.flags = state.flags.with_accessed(false);
                binding.pagedir.set_accessed(binding.page.vaddr(), false);
            }
        }
    }

    fn try_claim(&mut self, index: usize) -> bool {
        let frames = self.frames;
        let Some(frame) = frames[index].try_lock() else {
            return false;
        };
        let idle = frame.binding().is_some_and(|binding| {
            binding.page.try_lock().is_some_and(|state| {
                !state.flags.accessed() && !binding.pagedir.is_accessed(binding.page.vaddr())
            })
        });
        if idle {
            self.victim = Some(frame);
        }
        idle
    }
}

impl FrameTable {
    pub fn new(total_frames: usize, hand_spread: usize, swap: Arc<SwapSpace>) -> Self {
        info!(
            "frame table: {} user frames ({} KiB)",
            total_frames,
            total_frames * PAGE_FRAME_SIZE / 1024
        );
        Self {
            frames: (0..total_frames).map(|kpage| Mutex::new(Frame::new(kpage))).collect(),
            inner: Mutex::new(TableInner {
                pool: UserPool::new(total_frames),
                clock: TwoHandedClock::new(hand_spread),
                evictions: 0,
            }),
            swap,
        }
    }

    /// Hands out a zeroed, unbound, locked frame.
    ///
    /// Takes a free frame if there is one, otherwise evicts a resident page and
    /// hands its frame straight to the caller. Fails with
    /// [`VmError::OutOfMemory`] when every frame stays busy or recently used
    /// for [`EVICTION_ATTEMPTS`] sweeps, or with the eviction's write-back error.
    pub fn allocate(&self) -> Result<FrameGuard<'_>, VmError> {
        for _ in 0..EVICTION_ATTEMPTS {
            let mut inner = self.inner.lock();
            if let Some(kpage) = inner.pool.alloc() {
                drop(inner);
                let mut frame = self.lock(kpage);
                debug_assert!(frame.binding.is_none());
                frame.data.fill(0);
                return Ok(frame);
            }

            let mut sweep = Sweep {
                frames: &self.frames,
                victim: None,
            };
            let claimed = inner.clock.evict_page(&mut sweep);
            if claimed.is_some() {
                inner.evictions += 1;
            }
            drop(inner);

            if let Some(victim) = sweep.victim {
                let mut frame = FrameGuard { inner: victim };
                self.reclaim(&mut frame)?;
                frame.data.fill(0);
                return Ok(frame);
            }
            backoff();
        }
        Err(VmError::OutOfMemory)
    }

    /// Moves the page resident in `frame` out to its backing store and unbinds it.
    fn reclaim(&self, frame: &mut FrameGuard<'_>) -> Result<(), VmError> {
        let Some(binding) = frame.binding.as_ref() else {
            return Ok(());
        };
        let page = binding.page.clone();
        let pagedir = binding.pagedir.clone();
        let mut state = page.lock();
        debug_assert_eq!(state.frame, Some(frame.kpage));

        if pagedir.clear_translation(page.vaddr()) {
            state.flags = state.flags.with_dirty(true);
        }
        let saved = self.write_back(&**frame, &page, &mut state);
        if let Err(error) = saved {
            // Leave the page where it was; the caller is going down anyway.
            pagedir.install_translation(page.vaddr(), frame.kpage, page.writable());
            return Err(error);
        }

        debug!(
            "evicted vaddr {:#x} of pid {} from kpage {} ({:?})",
            page.vaddr(),
            binding_pid(frame),
            frame.kpage,
            state.kind
        );
        state.frame = None;
        drop(state);
        frame.unbind();
        Ok(())
    }

    /// Saves the contents of `frame` wherever `page` will find them next.
    fn write_back(
        &self,
        frame: &Frame,
        page: &Page,
        state: &mut PageState,
    ) -> Result<(), VmError> {
        if let Some(source) = state.mapped_file() {
            if state.flags.dirty() && !source.write_from(&frame.data) {
                return Err(VmError::WriteBackFailure(page.vaddr()));
            }
        } else if state.must_save() {
            let slot = self.swap.swap_out(frame).map_err(|err| match err {
                SwapError::Full => VmError::OutOfSwapSpace,
                SwapError::Io(_) => VmError::WriteBackFailure(page.vaddr()),
            })?;
            state.kind = PageKind::Swap(slot);
        }
        state.flags = state.flags.with_dirty(false).with_accessed(false);
        Ok(())
    }

    /// Returns `frame` to the free pool. Any page still bound to it is detached
    /// without saving its contents.
    pub fn release(&self, mut frame: FrameGuard<'_>) {
        frame.unbind();
        self.inner.lock().pool.dealloc(frame.kpage);
    }

    /// Waits for and locks frame `kpage`.
    pub fn lock(&self, kpage: Kpage) -> FrameGuard<'_> {
        FrameGuard {
            inner: self.frames[kpage].lock(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock();
        FrameStats {
            total: inner.pool.total(),
            used: inner.pool.allocated(),
            free: inner.pool.free(),
            evictions: inner.evictions,
        }
    }

    /// Number of frames holding pages of process `pid`.
    pub fn frames_owned_by(&self, pid: Pid) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame.lock().binding().is_some_and(|b| b.pid == pid))
            .count()
    }

    /// Checks that frames, pages and translations agree with each other.
    ///
    /// Panics if a bound frame's page does not point back at it, if the
    /// owner's address space translates the page elsewhere, if a page is bound
    /// to two frames, or if a bound frame is not allocated from the pool.
    pub fn assert_consistent(&self) {
        let mut pages = BTreeSet::new();
        for slot in self.frames.iter() {
            let frame = slot.lock();
            let Some(binding) = frame.binding() else {
                continue;
            };
            let vaddr = binding.page.vaddr();
            assert_eq!(
                binding.page.lock().frame,
                Some(frame.kpage),
                "page {:#x} does not point back at kpage {}",
                vaddr,
                frame.kpage
            );
            assert_eq!(
                binding.pagedir.translate(vaddr),
                Some(frame.kpage),
                "translation of {:#x} disagrees with kpage {}",
                vaddr,
                frame.kpage
            );
            assert!(
                pages.insert(Arc::as_ptr(&binding.page) as usize),
                "page {:#x} is bound to two frames",
                vaddr
            );
            // A frame is unbound before it goes back to the pool, under its lock.
            assert!(
                self.inner.lock().pool.is_allocated(frame.kpage),
                "bound kpage {} is in the free pool",
                frame.kpage
            );
        }

        let inner = self.inner.lock();
        assert_eq!(inner.pool.allocated() + inner.pool.free(), inner.pool.total());
    }
}

fn binding_pid(frame: &Frame) -> Pid {
    frame.binding.as_ref().map_or(0, |b| b.pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::paging::PageDirectory;
    use alloc::vec::Vec;
    use kidneyos_vm_shared::mem::SECTORS_PER_PAGE;

    fn swap(slots: u32) -> Arc<SwapSpace> {
        let sectors = slots * SECTORS_PER_PAGE;
        let block = Block::new(BlockType::Swap, "swap", sectors, RamDisk::new(sectors));
        Arc::new(SwapSpace::new(Arc::new(block)))
    }

    /// Allocates a frame and makes `vaddr` resident in it as an anonymous page.
    fn make_resident(
        table: &FrameTable,
        pagedir: &Arc<PageDirectory>,
        vaddr: usize,
        fill: u8,
    ) -> Arc<Page> {
        let page = Arc::new(Page::new(vaddr, true, PageKind::Anonymous));
        let mut frame = table.allocate().unwrap();
        frame.data_mut().fill(fill);
        assert!(pagedir.install_translation(vaddr, frame.kpage(), true));
        {
            let mut state = page.lock();
            state.frame = Some(frame.kpage());
            state.touch(true);
        }
        frame.bind(FrameBinding {
            pid: 1,
            page: page.clone(),
            pagedir: pagedir.clone(),
        });
        page
    }

    #[test]
    fn test_allocate_from_pool() {
        let table = FrameTable::new(3, 4, swap(4));
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        assert_ne!(a.kpage(), b.kpage());
        assert!(a.data().iter().all(|&byte| byte == 0));
        assert_eq!(table.stats().used, 2);

        table.release(a);
        let stats = table.stats();
        assert_eq!(stats.used, 1);
        assert_eq!(stats.used + stats.free, stats.total);
        drop(b);
        table.assert_consistent();
    }

    #[test]
    fn test_released_frame_is_reused() {
        let table = FrameTable::new(1, 4, swap(1));
        let frame = table.allocate().unwrap();
        let kpage = frame.kpage();
        table.release(frame);
        assert_eq!(table.allocate().unwrap().kpage(), kpage);
        assert_eq!(table.stats().evictions, 0);
    }

    #[test]
    fn test_eviction_swaps_out_anonymous_page() {
        let table = FrameTable::new(2, 4, swap(4));
        let pagedir = Arc::new(PageDirectory::new());
        let first = make_resident(&table, &pagedir, 0x1000, 0xAA);
        let second = make_resident(&table, &pagedir, 0x2000, 0xBB);
        table.assert_consistent();

        let frame = table.allocate().unwrap();
        assert!(frame.binding().is_none());
        assert!(frame.data().iter().all(|&byte| byte == 0));
        drop(frame);

        // Exactly one of the two pages went to swap.
        let swapped: Vec<_> = [&first, &second]
            .iter()
            .filter(|page| page.lock().frame.is_none())
            .map(|page| page.vaddr())
            .collect();
        assert_eq!(swapped.len(), 1);
        assert_eq!(pagedir.translate(swapped[0]), None);
        assert_eq!(table.stats().evictions, 1);
        assert_eq!(table.swap.stats().used_slots, 1);
        table.assert_consistent();
    }

    #[test]
    fn test_clean_zero_page_is_discarded() {
        let table = FrameTable::new(1, 4, swap(1));
        let pagedir = Arc::new(PageDirectory::new());
        let page = Arc::new(Page::new(0x1000, true, PageKind::Zero));
        let mut frame = table.allocate().unwrap();
        pagedir.install_translation(0x1000, frame.kpage(), true);
        page.lock().frame = Some(frame.kpage());
        frame.bind(FrameBinding {
            pid: 1,
            page: page.clone(),
            pagedir: pagedir.clone(),
        });
        drop(frame);

        drop(table.allocate().unwrap());
        let state = page.lock();
        assert!(matches!(state.kind, PageKind::Zero));
        assert_eq!(state.frame, None);
        assert_eq!(table.swap.stats().used_slots, 0);
    }

    #[test]
    fn test_busy_frames_are_not_evicted() {
        let table = FrameTable::new(1, 4, swap(1));
        let pagedir = Arc::new(PageDirectory::new());
        let page = make_resident(&table, &pagedir, 0x1000, 1);
        let kpage = page.lock().frame.unwrap();

        let held = table.lock(kpage);
        assert_eq!(table.allocate().err(), Some(VmError::OutOfMemory));
        drop(held);
        assert_eq!(table.allocate().unwrap().kpage(), kpage);
    }

    #[test]
    fn test_swap_exhaustion_leaves_page_resident() {
        let table = FrameTable::new(1, 4, swap(0));
        let pagedir = Arc::new(PageDirectory::new());
        let page = make_resident(&table, &pagedir, 0x1000, 1);
        let kpage = page.lock().frame.unwrap();

        assert_eq!(table.allocate().err(), Some(VmError::OutOfSwapSpace));
        assert_eq!(page.lock().frame, Some(kpage));
        assert_eq!(pagedir.translate(0x1000), Some(kpage));
        table.assert_consistent();
    }

    #[test]
    fn test_frames_owned_by() {
        let table = FrameTable::new(4, 4, swap(4));
        let pagedir = Arc::new(PageDirectory::new());
        let _a = make_resident(&table, &pagedir, 0x1000, 1);
        let _b = make_resident(&table, &pagedir, 0x2000, 2);
        assert_eq!(table.frames_owned_by(1), 2);
        assert_eq!(table.frames_owned_by(2), 0);
    }

    #[test]
    fn test_store_through_translation_is_saved() {
        let table = FrameTable::new(1, 4, swap(1));
        let pagedir = Arc::new(PageDirectory::new());
        let page = Arc::new(Page::new(0x1000, true, PageKind::Zero));
        let mut frame = table.allocate().unwrap();
        pagedir.install_translation(0x1000, frame.kpage(), true);
        page.lock().frame = Some(frame.kpage());
        frame.bind(FrameBinding {
            pid: 1,
            page: page.clone(),
            pagedir: pagedir.clone(),
        });
        drop(frame);

        // The process writes without faulting; only the hardware dirty bit knows.
        let kpage = pagedir.access(0x1000, true).unwrap();
        table.lock(kpage).data_mut()[0] = 0x5A;
        assert!(!page.is_dirty());

        drop(table.allocate().unwrap());
        let state = page.lock();
        assert_eq!(state.frame, None);
        assert!(matches!(state.kind, PageKind::Swap(_)));
        assert_eq!(table.swap.stats().used_slots, 1);
    }

    #[test]
    fn test_hardware_accessed_bit_protects_page() {
        let table = FrameTable::new(2, 4, swap(4));
        let pagedir = Arc::new(PageDirectory::new());
        let first = make_resident(&table, &pagedir, 0x1000, 1);
        let second = make_resident(&table, &pagedir, 0x2000, 2);
        for page in [&first, &second] {
            let mut state = page.lock();
            state.flags = state.flags.with_accessed(false);
        }
        let (hot, cold) = if first.lock().frame == Some(0) {
            (first, second)
        } else {
            (second, first)
        };
        pagedir.access(hot.vaddr(), false).unwrap();

        drop(table.allocate().unwrap());
        assert!(hot.lock().frame.is_some());
        assert_eq!(cold.lock().frame, None);
        // The lead hand cleared the hardware bit on its way past.
        assert!(!pagedir.is_accessed(hot.vaddr()));
    }

    #[test]
    fn test_consistency_check_during_release() {
        let table = FrameTable::new(4, 4, swap(4));
        let pagedir = Arc::new(PageDirectory::new());
        std::thread::scope(|s| {
            s.spawn(|| {
                for round in 0..200 {
                    let vaddr = 0x1000 * (round % 4 + 1);
                    let page = make_resident(&table, &pagedir, vaddr, 1);
                    let kpage = page.lock().frame.unwrap();
                    let frame = table.lock(kpage);
                    pagedir.clear_translation(vaddr);
                    page.lock().frame = None;
                    table.release(frame);
                }
            });
            for _ in 0..200 {
                table.assert_consistent();
            }
        });
        assert_eq!(table.stats().used, 0);
    }
}
