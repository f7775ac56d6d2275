//! Latch plumbing for the crabbing protocol.
//!
//! A write descent stores every exclusive latch it still holds in the
//! transaction's page set, root-first, so ancestors can be released the
//! moment a child proves safe and the remainder released (and only then
//! unpinned) when the operation finishes.

use crate::storage::buffer::{PageRef, PageWriteGuard};
use crate::storage::page::PageId;
use parking_lot::RawRwLock;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};

/// What the tree latch protects: the root's identity and the tree height.
#[derive(Debug, Clone, Copy)]
pub struct TreeRoot {
    pub page_id: PageId,
    pub height: u32,
}

pub type TreeRootReadGuard = ArcRwLockReadGuard<RawRwLock, TreeRoot>;
pub type TreeRootWriteGuard = ArcRwLockWriteGuard<RawRwLock, TreeRoot>;

/// An exclusively latched, pinned page. Field order matters: the latch
/// guard drops before the pin, so no one can observe the page unpinned but
/// still latched.
pub struct PageWriteLatch {
    pub guard: PageWriteGuard,
    pub page: PageRef,
}

/// One entry of a write descent's latch deque.
pub enum LatchedPage {
    /// Sentinel marking that the tree latch itself is held; releasing it
    /// re-admits root changes by other writers.
    TreeLatch(TreeRootWriteGuard),
    Page(PageWriteLatch),
}
