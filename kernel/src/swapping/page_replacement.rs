//! Victim selection for page eviction.

use kidneyos_vm_shared::mem::HAND_SPREAD;

/// The frames a replacement policy sweeps over, in a fixed circular order.
///
/// Indices are positions in that order, `0..len()`. Not every position is a
/// candidate: free frames, and frames some other thread is currently working
/// on, are neither aged nor claimed.
pub trait ClockFace {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Clears the accessed bit of the page held at `index`, if any.
    fn age(&mut self, index: usize);
    /// Claims the frame at `index` as the victim if it holds a page that has
    /// not been accessed since it was last aged.
    fn try_claim(&mut self, index: usize) -> bool;
}

pub trait PageReplacementPolicy {
    /// Sweeps `frames` and returns the position of the claimed victim, or
    /// `None` if a full sweep found nothing claimable.
    fn evict_page(&mut self, frames: &mut dyn ClockFace) -> Option<usize>;
}

/// Two-handed clock approximation of LRU.
///
/// The lead hand clears accessed bits; the lag hand, `spread` positions
/// behind it, takes the first frame whose bit is still clear. A page survives
/// only if it is touched in the window between the two hands passing it.
#[derive(Debug, Clone)]
pub struct TwoHandedClock {
    /// Position of the lag hand.
    lag: usize,
    /// The lead hand sits `len / hand_spread` positions ahead of the lag hand.
    hand_spread: usize,
}

impl Default for TwoHandedClock {
    fn default() -> Self {
        Self::new(HAND_SPREAD)
    }
}

impl TwoHandedClock {
    pub fn new(hand_spread: usize) -> Self {
        Self {
            lag: 0,
            hand_spread: hand_spread.max(1),
        }
    }

    /// Distance between the hands on a face of `len` positions.
    ///
    /// At least one whenever there are two or more frames, so that the lag
    /// hand never looks at the frame the lead hand has just aged.
    pub fn spread(&self, len: usize) -> usize {
        if len <= 1 {
            0
        } else {
            (len / self.hand_spread).clamp(1, len - 1)
        }
    }

    pub fn lag_hand(&self) -> usize {
        self.lag
    }
}

impl PageReplacementPolicy for TwoHandedClock {
    fn evict_page(&mut self, frames: &mut dyn ClockFace) -> Option<usize> {
        if frames.is_empty() {
            return None;
        }
        let len = frames.len();
        let spread = self.spread(len);
        let mut lag = self.lag % len;

        // Once the lead hand has gone all the way round, every candidate's bit
        // has been cleared and the lag hand must find one within `spread`
        // more steps; anything left after that is busy.
        for _ in 0..len + spread + 1 {
            let lead = (lag + spread) % len;
            frames.age(lead);
            let claimed = frames.try_claim(lag);
            let victim = lag;
            lag = (lag + 1) % len;
            if claimed {
                self.lag = lag;
                return Some(victim);
            }
        }

        self.lag = lag;
        None
    }
}
