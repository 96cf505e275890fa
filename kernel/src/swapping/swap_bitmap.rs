use alloc::{vec, vec::Vec};

/// Slot to sector-run bookkeeping for the swap partition: one bit per slot, set when occupied.
///
/// Fast operations are:
///   - Find a free slot, and mark it as occupied
///   - Mark a (previously-occupied) slot as free.
///
/// Bits past the last real slot are kept set so they are never handed out.
#[derive(Debug, Clone)]
pub struct SwapBitmap {
    bitmap: Vec<u64>,
    slots: u32,
    used: u32,
    /// No group before this one has a clear bit.
    first_free_group: usize,
}

impl SwapBitmap {
    /// Create a new bitmap of `slots` slots, all free.
    pub fn new(slots: u32) -> Self {
        let group_count = slots.div_ceil(64) as usize;
        let mut bitmap = vec![0; group_count];
        let tail = slots % 64;
        if tail != 0 {
            if let Some(last) = bitmap.last_mut() {
                *last = !0 << tail;
            }
        }
        Self {
            bitmap,
            slots,
            used: 0,
            first_free_group: 0,
        }
    }

    /// Find the lowest free slot and mark it occupied.
    ///
    /// Returns `None` if every slot is occupied; the bitmap is left untouched.
    pub fn scan_and_flip(&mut self) -> Option<u32> {
        let (group_index, group) = self
            .bitmap
            .iter_mut()
            .enumerate()
            .skip(self.first_free_group)
            .find(|(_, group)| **group != !0)?;
        let index_in_group = (!*group).trailing_zeros();
        // set bit
        *group |= 1 << index_in_group;
        self.first_free_group = group_index;
        self.used += 1;
        let slot = u32::try_from(group_index * 64).ok()? + index_in_group;
        debug_assert!(slot < self.slots, "SwapBitmap consistency error");
        Some(slot)
    }

    /// Free a slot.
    ///
    /// Panics if the slot is out of range or was already free: either means a
    /// page and the bitmap disagree about who owns the slot.
    pub fn free(&mut self, slot: u32) {
        assert!(slot < self.slots, "swap slot {} out of range", slot);
        let group_index = (slot / 64) as usize;
        let bit = 1 << (slot % 64);
        let group = &mut self.bitmap[group_index];
        assert!(*group & bit != 0, "swap slot {} freed twice", slot);
        // clear bit
        *group &= !bit;
        self.used -= 1;
        self.first_free_group = self.first_free_group.min(group_index);
    }

    pub fn is_used(&self, slot: u32) -> bool {
        slot < self.slots && self.bitmap[(slot / 64) as usize] & (1 << (slot % 64)) != 0
    }

    pub fn len(&self) -> u32 {
        self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hands_out_lowest_free_slot() {
        let mut bitmap = SwapBitmap::new(130);
        for expected in 0..70 {
            assert_eq!(bitmap.scan_and_flip(), Some(expected));
        }
        bitmap.free(3);
        bitmap.free(65);
        assert_eq!(bitmap.scan_and_flip(), Some(3));
        assert_eq!(bitmap.scan_and_flip(), Some(65));
        assert_eq!(bitmap.scan_and_flip(), Some(70));
        assert_eq!(bitmap.used(), 71);
    }

    #[test]
    fn test_exhaustion_leaves_bitmap_intact() {
        let mut bitmap = SwapBitmap::new(5);
        for _ in 0..5 {
            assert!(bitmap.scan_and_flip().is_some());
        }
        let before = bitmap.clone();
        assert_eq!(bitmap.scan_and_flip(), None);
        assert_eq!(bitmap.bitmap, before.bitmap);
        assert_eq!(bitmap.used(), 5);
        assert!(!bitmap.is_used(5));
    }

    #[test]
    fn test_empty_bitmap() {
        let mut bitmap = SwapBitmap::new(0);
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.scan_and_flip(), None);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_panics() {
        let mut bitmap = SwapBitmap::new(8);
        let slot = bitmap.scan_and_flip().unwrap();
        bitmap.free(slot);
        bitmap.free(slot);
    }
}
