mod placement_algorithms;

pub use placement_algorithms::{NextFit, PlacementAlgorithm};

use alloc::{boxed::Box, vec};
use bitbybit::bitfield;

/// Physical frame number of a user frame, counted from the start of the user pool.
pub type Kpage = usize;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// The pool of physical frames available to user pages.
///
/// The pool only tracks which frames are taken; what a frame holds and who
/// owns it is the [`FrameTable`](super::frame_table::FrameTable)'s business.
pub struct UserPool<P: PlacementAlgorithm = NextFit> {
    core_map: Box<[CoreMapEntry]>,
    placement: P,
    frames_allocated: usize,
}

impl<P: PlacementAlgorithm> UserPool<P> {
    pub fn new(total_frames: usize) -> Self {
        Self {
            core_map: vec![CoreMapEntry::DEFAULT; total_frames].into_boxed_slice(),
            placement: P::default(),
            frames_allocated: 0,
        }
    }

    /// Takes a free frame out of the pool, or `None` if every frame is in use.
    pub fn alloc(&mut self) -> Option<Kpage> {
        if self.frames_allocated == self.core_map.len() {
            return None;
        }

        let kpage = self.placement.place(&self.core_map)?;
        assert!(!self.core_map[kpage].allocated());
        self.core_map[kpage] = self.core_map[kpage].with_allocated(true);
        self.frames_allocated += 1;
        Some(kpage)
    }

    /// Returns `kpage` to the pool.
    pub fn dealloc(&mut self, kpage: Kpage) {
        assert!(
            self.core_map[kpage].allocated(),
            "double free of user frame {}",
            kpage
        );
        self.core_map[kpage] = self.core_map[kpage].with_allocated(false);
        self.frames_allocated -= 1;
    }

    pub fn is_allocated(&self, kpage: Kpage) -> bool {
        self.core_map.get(kpage).is_some_and(|e| e.allocated())
    }

    pub fn total(&self) -> usize {
        self.core_map.len()
    }

    pub fn allocated(&self) -> usize {
        self.frames_allocated
    }

    pub fn free(&self) -> usize {
        self.total() - self.frames_allocated
    }
}
