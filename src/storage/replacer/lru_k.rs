use super::{FrameId, Replacer};
use std::collections::VecDeque;

/// LRU-K replacement.
///
/// Tracks, per frame, the timestamps of its last up to K accesses. The
/// victim is the evictable frame with the largest backward K-distance
/// (now minus the Kth most recent access); frames with fewer than K
/// recorded accesses count as infinitely distant, and ties go to the frame
/// with the earliest recorded access. Compared to plain LRU this resists
/// scans: a frame touched once long ago loses to a frame in steady use even
/// if the latter was touched less recently.
#[derive(Debug)]
pub struct LruKReplacer {
    /// Per-frame access history, oldest first, at most K entries.
    history: Vec<VecDeque<u64>>,
    evictable: Vec<bool>,
    current_timestamp: u64,
    k: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1);
        Self {
            history: vec![VecDeque::new(); num_frames],
            evictable: vec![false; num_frames],
            current_timestamp: 0,
            k,
        }
    }

    /// Backward K-distance plus the tie-breaking timestamp.
    fn distance(&self, frame_id: FrameId) -> (u64, u64) {
        let history = &self.history[frame_id as usize];
        let oldest = *history.front().unwrap();
        if history.len() < self.k {
            (u64::MAX, oldest)
        } else {
            (self.current_timestamp - oldest, oldest)
        }
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&mut self, frame_id: FrameId) {
        debug_assert!((frame_id as usize) < self.history.len());
        let history = &mut self.history[frame_id as usize];
        history.push_back(self.current_timestamp);
        self.current_timestamp += 1;
        if history.len() > self.k {
            history.pop_front();
        }
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        debug_assert!((frame_id as usize) < self.evictable.len());
        self.evictable[frame_id as usize] = evictable;
    }

    fn evict(&mut self) -> Option<FrameId> {
        let mut victim: Option<(u64, u64, FrameId)> = None;

        for frame_id in 0..self.history.len() as FrameId {
            if self.history[frame_id as usize].is_empty() || !self.evictable[frame_id as usize] {
                continue;
            }

            let (diff, timestamp) = self.distance(frame_id);
            let better = match victim {
                None => true,
                Some((best_diff, best_timestamp, _)) => {
                    diff > best_diff || (diff == best_diff && timestamp < best_timestamp)
                }
            };
            if better {
                victim = Some((diff, timestamp, frame_id));
            }
        }

        let (_, _, frame_id) = victim?;
        self.history[frame_id as usize].clear();
        log::debug!("evict frame {}", frame_id);
        Some(frame_id)
    }

    fn remove(&mut self, frame_id: FrameId) {
        debug_assert!((frame_id as usize) < self.history.len());
        if self.history[frame_id as usize].is_empty() {
            return;
        }
        debug_assert!(
            self.evictable[frame_id as usize],
            "removing a non-evictable frame"
        );
        self.history[frame_id as usize].clear();
    }

    fn size(&self) -> usize {
        (0..self.history.len())
            .filter(|&i| !self.history[i].is_empty() && self.evictable[i])
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_replacer() {
        let mut replacer = LruKReplacer::new(4, 2);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_fewer_than_k_accesses_evicted_first() {
        let mut replacer = LruKReplacer::new(4, 2);

        // frame 0 accessed twice, frame 1 only once
        replacer.record_access(0);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);

        // frame 1 has infinite K-distance
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_k_distance_ordering() {
        let mut replacer = LruKReplacer::new(4, 2);

        // timestamps: f0 @ 0, 2; f1 @ 1, 3
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);

        // K-distance of f0 (now - 0) beats f1 (now - 1)
        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_infinite_distance_tie_breaks_by_earliest_access() {
        let mut replacer = LruKReplacer::new(4, 3);

        replacer.record_access(2);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);

        // both below K accesses; frame 2's first access is earliest
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_non_evictable_frames_skipped() {
        let mut replacer = LruKReplacer::new(4, 2);

        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, false);
        replacer.set_evictable(1, true);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(0, true);
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_eviction_clears_history() {
        let mut replacer = LruKReplacer::new(4, 2);

        replacer.record_access(0);
        replacer.record_access(0);
        replacer.set_evictable(0, true);
        assert_eq!(replacer.evict(), Some(0));

        // evicted frame no longer counts until accessed again
        assert_eq!(replacer.size(), 0);
        replacer.record_access(0);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_remove() {
        let mut replacer = LruKReplacer::new(4, 2);

        replacer.record_access(0);
        replacer.set_evictable(0, true);
        replacer.remove(0);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        // removing a frame with no history is a no-op
        replacer.remove(3);
    }

    #[test]
    fn test_k_equal_one_degenerates_to_lru() {
        let mut replacer = LruKReplacer::new(4, 1);

        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(0);
        for i in 0..3 {
            replacer.set_evictable(i, true);
        }

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(0));
    }
}
