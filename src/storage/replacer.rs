pub mod lru_k;

use std::fmt::Debug;

pub type FrameId = u32;

/// Replacement policy for buffer pool frames. The pool serializes calls
/// under its own latch, so implementations hold plain state.
pub trait Replacer: Send + Sync + Debug {
    /// Note an access to the frame, for recency bookkeeping.
    fn record_access(&mut self, frame_id: FrameId);

    /// Mark whether the frame may be chosen as a victim.
    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool);

    /// Select a victim frame and forget its history. Returns None if no
    /// frame can be evicted.
    fn evict(&mut self) -> Option<FrameId>;

    /// Forget a frame entirely (the page in it was deleted). The frame must
    /// be evictable.
    fn remove(&mut self, frame_id: FrameId);

    /// Number of frames currently eligible for eviction.
    fn size(&self) -> usize;
}

pub use lru_k::LruKReplacer;
