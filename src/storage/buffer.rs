pub mod parallel;

use crate::container::ExtendibleHashTable;
use crate::storage::disk::DiskManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{INVALID_PAGE_ID, PageData, PageId};
use crate::storage::replacer::{FrameId, Replacer};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Owned shared latch on a page's bytes.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, PageData>;
/// Owned exclusive latch on a page's bytes.
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageData>;

const PAGE_TABLE_BUCKET_SIZE: usize = 8;

struct Frame {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
    data: Arc<RwLock<PageData>>,
}

impl Frame {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
            data: Arc::new(RwLock::new([0u8; crate::storage::PAGE_SIZE])),
        }
    }
}

struct PoolState {
    frames: Vec<Frame>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: Box<dyn Replacer>,
    free_list: VecDeque<FrameId>,
    disk: DiskManager,
}

/// Fixed-capacity cache of disk pages with pin-based reference counting.
///
/// One latch serializes all pool operations; page contents are guarded
/// separately by per-frame reader/writer latches so pinned pages can be
/// read and written without holding the pool latch.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    pool: Mutex<PoolState>,
    pool_size: usize,
}

impl BufferPoolManager {
    pub fn new(disk: DiskManager, replacer: Box<dyn Replacer>, pool_size: usize) -> Self {
        let frames = (0..pool_size).map(|_| Frame::new()).collect();
        let free_list = (0..pool_size as FrameId).collect();
        Self {
            inner: Arc::new(BufferPoolInner {
                pool: Mutex::new(PoolState {
                    frames,
                    page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
                    replacer,
                    free_list,
                    disk,
                }),
                pool_size,
            }),
        }
    }

    pub fn get_pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Allocate a fresh page pinned into a frame, zeroed and materialized on
    /// disk. Fails with `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> StorageResult<PageRef> {
        let mut state = self.inner.pool.lock();
        let frame_id = Self::available_frame(&mut state)?;

        let page_id = state.disk.allocate_page();
        let write_result = {
            let PoolState { frames, disk, .. } = &mut *state;
            let frame = &mut frames[frame_id as usize];
            let mut data = frame.data.write();
            data.fill(0);
            match disk.write_page(page_id, data.as_ref()) {
                Ok(()) => {
                    frame.page_id = page_id;
                    frame.pin_count = 1;
                    frame.is_dirty = false;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = write_result {
            // hand the frame back rather than leaking it
            state.free_list.push_back(frame_id);
            return Err(err.into());
        }

        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);

        Ok(self.page_ref(&state, frame_id))
    }

    /// Pin a page, reading it from disk on a miss.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageRef> {
        let mut state = self.inner.pool.lock();

        if let Some(frame_id) = state.page_table.find(&page_id) {
            state.frames[frame_id as usize].pin_count += 1;
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            return Ok(self.page_ref(&state, frame_id));
        }

        let frame_id = Self::available_frame(&mut state)?;
        let read_result = {
            let PoolState { frames, disk, .. } = &mut *state;
            let frame = &mut frames[frame_id as usize];
            let mut data = frame.data.write();
            match disk.read_page(page_id, data.as_mut()) {
                Ok(()) => {
                    frame.page_id = page_id;
                    frame.pin_count = 1;
                    frame.is_dirty = false;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = read_result {
            // hand the frame back rather than leaking it
            state.free_list.push_back(frame_id);
            return Err(err.into());
        }

        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);

        Ok(self.page_ref(&state, frame_id))
    }

    /// Drop one pin, folding `is_dirty` into the frame's dirty flag. False
    /// if the page is not resident or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.inner.pool.lock();

        let Some(frame_id) = state.page_table.find(&page_id) else {
            return false;
        };

        let frame = &mut state.frames[frame_id as usize];
        if frame.pin_count == 0 {
            return false;
        }

        frame.is_dirty |= is_dirty;
        frame.pin_count -= 1;
        if frame.pin_count == 0 {
            state.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Write the page to disk and clear its dirty flag, pinned or not.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.pool.lock();

        let Some(frame_id) = state.page_table.find(&page_id) else {
            return Ok(false);
        };

        let PoolState { frames, disk, .. } = &mut *state;
        let frame = &mut frames[frame_id as usize];
        let data = frame.data.read();
        disk.write_page(page_id, data.as_ref())?;
        drop(data);
        frame.is_dirty = false;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let mut state = self.inner.pool.lock();
        let PoolState { frames, disk, .. } = &mut *state;
        for frame in frames.iter_mut() {
            if frame.page_id != INVALID_PAGE_ID {
                let data = frame.data.read();
                disk.write_page(frame.page_id, data.as_ref())?;
                drop(data);
                frame.is_dirty = false;
            }
        }
        Ok(())
    }

    /// Evict and deallocate a page. True if the page is gone afterwards;
    /// false if it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.pool.lock();

        let Some(frame_id) = state.page_table.find(&page_id) else {
            state.disk.deallocate_page(page_id);
            return Ok(true);
        };

        if state.frames[frame_id as usize].pin_count > 0 {
            return Ok(false);
        }

        state.page_table.remove(&page_id);
        state.replacer.remove(frame_id);

        let frame = &mut state.frames[frame_id as usize];
        frame.data.write().fill(0);
        frame.page_id = INVALID_PAGE_ID;
        frame.is_dirty = false;

        state.disk.deallocate_page(page_id);
        state.free_list.push_back(frame_id);
        Ok(true)
    }

    fn page_ref(&self, state: &PoolState, frame_id: FrameId) -> PageRef {
        let frame = &state.frames[frame_id as usize];
        PageRef {
            page_id: frame.page_id,
            data: Arc::clone(&frame.data),
            pool: self.clone(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Pick a frame for reuse: free list first, then the replacer. A dirty
    /// victim is written back before its mapping is dropped.
    fn available_frame(state: &mut PoolState) -> StorageResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = state.replacer.evict().ok_or(StorageError::BufferPoolFull)?;

        let PoolState {
            frames,
            disk,
            page_table,
            ..
        } = state;
        let frame = &mut frames[frame_id as usize];
        debug_assert_eq!(frame.pin_count, 0);
        if frame.is_dirty {
            let data = frame.data.read();
            disk.write_page(frame.page_id, data.as_ref())?;
            drop(data);
            frame.is_dirty = false;
        }
        page_table.remove(&frame.page_id);
        frame.page_id = INVALID_PAGE_ID;
        Ok(frame_id)
    }
}

/// A pinned page.
///
/// Holding a `PageRef` keeps the page resident; dropping it unpins with
/// whatever dirty state was recorded via [`PageRef::mark_dirty`]. Latches on
/// the page's bytes are taken through [`PageRef::read`] and
/// [`PageRef::write`] and are owned guards, so they can outlive the borrow
/// of the `PageRef` itself (the crabbing protocol stores them in a deque).
pub struct PageRef {
    page_id: PageId,
    data: Arc<RwLock<PageData>>,
    pool: BufferPoolManager,
    dirty: AtomicBool,
}

impl PageRef {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> PageReadGuard {
        self.data.read_arc()
    }

    pub fn write(&self) -> PageWriteGuard {
        self.data.write_arc()
    }

    /// Record that the holder mutated the page; consumed by the unpin on
    /// drop.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.pool
            .unpin_page(self.page_id, self.dirty.load(Ordering::Relaxed));
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("page_id", &self.page_id)
            .finish()
    }
}
