//! Where to take the next free user frame from.

use super::{CoreMapEntry, Kpage};

/// A placement algorithm for allocating frames.
pub trait PlacementAlgorithm: Default {
    /// Returns the number of a free frame in `core_map`, or `None` if there is none.
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<Kpage>;
}

/// Resumes the search where the previous one stopped, spreading allocations
/// across the pool.
#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<Kpage> {
        let total_frames = core_map.len();
        let found = (0..total_frames)
            .map(|i| (self.position + i) % total_frames)
            .find(|&kpage| !core_map[kpage].allocated())?;
        self.position = (found + 1) % total_frames;
        Some(found)
    }
}
