pub mod iterator;
pub mod key;
pub mod latch;

use self::iterator::BTreeIterator;
use self::key::KeyComparator;
use self::latch::{LatchedPage, PageWriteLatch, TreeRoot};
use crate::common::RecordId;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard, PageRef, PageWriteGuard};
use crate::storage::error::StorageResult;
use crate::storage::page::btree_page::{self, is_leaf_page};
use crate::storage::page::{
    BTreeInternalPage, BTreeLeafPage, HeaderPage, INVALID_PAGE_ID, PageId,
};
use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

const HEADER_PAGE_ID: PageId = PageId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Remove,
}

/// A concurrent B+-tree of unique fixed-width keys over buffer-pool pages.
///
/// Readers crab down with shared latches, always latching the child before
/// releasing the parent. Writers first try an optimistic pass that latches
/// only the leaf exclusively; if the leaf might split or underflow they
/// restart pessimistically, taking the tree latch plus exclusive latches
/// down the path and releasing ancestors as soon as a child is safe. The
/// latches still held live in the transaction's page set so they can be
/// unwound on any exit path.
///
/// The tree object itself holds only configuration and the root metadata;
/// every node lives in exactly one page and is re-read through the buffer
/// pool on each access.
pub struct BPlusTree<C: KeyComparator> {
    name: String,
    buffer_pool: BufferPoolManager,
    comparator: C,
    key_size: usize,
    leaf_max_size: usize,
    internal_max_size: usize,
    root: Arc<RwLock<TreeRoot>>,
}

impl<C: KeyComparator> BPlusTree<C> {
    /// Create a tree on a pool whose page 0 serves as the header directory
    /// (allocating it if the pool is fresh).
    pub fn new(
        name: impl Into<String>,
        buffer_pool: BufferPoolManager,
        comparator: C,
        key_size: usize,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> StorageResult<Self> {
        assert!(key_size > 0);
        assert!(leaf_max_size >= 3, "leaf pages need at least three entries");
        assert!(
            internal_max_size >= 3,
            "internal pages need at least three children"
        );
        Self::ensure_header_page(&buffer_pool)?;
        Ok(Self {
            name: name.into(),
            buffer_pool,
            comparator,
            key_size,
            leaf_max_size,
            internal_max_size,
            root: Arc::new(RwLock::new(TreeRoot {
                page_id: INVALID_PAGE_ID,
                height: 0,
            })),
        })
    }

    /// Reopen a tree whose root is registered in the header page.
    pub fn open(
        name: impl Into<String>,
        buffer_pool: BufferPoolManager,
        comparator: C,
        key_size: usize,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> StorageResult<Self> {
        let name = name.into();
        Self::ensure_header_page(&buffer_pool)?;

        let root_page_id = {
            let page = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
            let guard = page.read();
            let header = HeaderPage::from_data(&*guard);
            header.get_record(&name).unwrap_or(INVALID_PAGE_ID)
        };

        let height = if root_page_id.is_valid() {
            Self::measure_height(&buffer_pool, root_page_id, key_size)?
        } else {
            0
        };

        Ok(Self {
            name,
            buffer_pool,
            comparator,
            key_size,
            leaf_max_size,
            internal_max_size,
            root: Arc::new(RwLock::new(TreeRoot {
                page_id: root_page_id,
                height,
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        !self.root.read().page_id.is_valid()
    }

    pub fn root_page_id(&self) -> PageId {
        self.root.read().page_id
    }

    pub fn height(&self) -> u32 {
        self.root.read().height
    }

    /// Point lookup.
    pub fn get_value(&self, key: &[u8]) -> StorageResult<Option<RecordId>> {
        debug_assert_eq!(key.len(), self.key_size);
        let Some((_page, guard)) = self.find_leaf_for_read(key)? else {
            return Ok(None);
        };
        let leaf = BTreeLeafPage::from_data(&*guard, self.key_size);
        let index = leaf.lower_bound(key, &self.comparator);
        if index < leaf.size()
            && self.comparator.compare(leaf.key_at(index), key) == Ordering::Equal
        {
            Ok(Some(leaf.value_at(index)))
        } else {
            Ok(None)
        }
    }

    /// Insert a unique key. Returns false if the key is already present.
    pub fn insert(&self, key: &[u8], value: RecordId, txn: &Transaction) -> StorageResult<bool> {
        debug_assert_eq!(key.len(), self.key_size);

        if let Some((page, mut guard)) = self.find_leaf_optimistic(key)? {
            let safe = {
                let leaf = BTreeLeafPage::from_data(&*guard, self.key_size);
                leaf.size() + 1 < leaf.max_size()
            };
            if safe {
                let inserted = {
                    let mut leaf = BTreeLeafPage::from_data(&mut *guard, self.key_size);
                    leaf.insert(key, value, &self.comparator)
                };
                if inserted {
                    page.mark_dirty();
                }
                return Ok(inserted);
            }
            drop(guard);
            drop(page);
        }

        self.insert_pessimistic(key, value, txn)
    }

    /// Remove a key; absent keys are a silent no-op (the bool reports
    /// whether anything was removed).
    pub fn remove(&self, key: &[u8], txn: &Transaction) -> StorageResult<bool> {
        debug_assert_eq!(key.len(), self.key_size);

        let Some((page, mut guard)) = self.find_leaf_optimistic(key)? else {
            return Ok(false);
        };
        let safe = {
            let leaf = BTreeLeafPage::from_data(&*guard, self.key_size);
            if leaf.is_root() {
                leaf.size() > 1
            } else {
                leaf.size() > leaf.min_size()
            }
        };
        if safe {
            let removed = {
                let mut leaf = BTreeLeafPage::from_data(&mut *guard, self.key_size);
                let index = leaf.lower_bound(key, &self.comparator);
                if index < leaf.size()
                    && self.comparator.compare(leaf.key_at(index), key) == Ordering::Equal
                {
                    leaf.remove_entry_at(index);
                    true
                } else {
                    false
                }
            };
            if removed {
                page.mark_dirty();
            }
            return Ok(removed);
        }
        drop(guard);
        drop(page);

        self.remove_pessimistic(key, txn)
    }

    /// Iterator over the whole tree, leftmost leaf first.
    pub fn iter(&self) -> StorageResult<BTreeIterator> {
        let root_guard = self.root.read();
        if !root_guard.page_id.is_valid() {
            return Ok(BTreeIterator::new(
                self.buffer_pool.clone(),
                self.key_size,
                None,
                0,
            ));
        }

        let mut page = self.buffer_pool.fetch_page(root_guard.page_id)?;
        let mut guard = page.read();
        drop(root_guard);

        loop {
            if is_leaf_page(&guard) {
                return Ok(BTreeIterator::new(
                    self.buffer_pool.clone(),
                    self.key_size,
                    Some((page, guard)),
                    0,
                ));
            }
            let child_id = {
                let internal = BTreeInternalPage::from_data(&*guard, self.key_size);
                internal.child_at(0)
            };
            let child = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child.read();
            drop(guard);
            drop(page);
            page = child;
            guard = child_guard;
        }
    }

    /// Iterator starting at the first key >= `key`.
    pub fn iter_from(&self, key: &[u8]) -> StorageResult<BTreeIterator> {
        debug_assert_eq!(key.len(), self.key_size);
        match self.find_leaf_for_read(key)? {
            None => Ok(BTreeIterator::new(
                self.buffer_pool.clone(),
                self.key_size,
                None,
                0,
            )),
            Some((page, guard)) => {
                let index = {
                    let leaf = BTreeLeafPage::from_data(&*guard, self.key_size);
                    leaf.lower_bound(key, &self.comparator)
                };
                Ok(BTreeIterator::new(
                    self.buffer_pool.clone(),
                    self.key_size,
                    Some((page, guard)),
                    index,
                ))
            }
        }
    }

    fn ensure_header_page(buffer_pool: &BufferPoolManager) -> StorageResult<()> {
        match buffer_pool.fetch_page(HEADER_PAGE_ID) {
            Ok(_) => Ok(()),
            Err(_) => {
                let page = buffer_pool.new_page()?;
                assert_eq!(
                    page.page_id(),
                    HEADER_PAGE_ID,
                    "header page must be the first allocation"
                );
                Ok(())
            }
        }
    }

    fn measure_height(
        buffer_pool: &BufferPoolManager,
        root_page_id: PageId,
        key_size: usize,
    ) -> StorageResult<u32> {
        let mut height = 1;
        let mut page_id = root_page_id;
        loop {
            let page = buffer_pool.fetch_page(page_id)?;
            let guard = page.read();
            if is_leaf_page(&guard) {
                return Ok(height);
            }
            let internal = BTreeInternalPage::from_data(&*guard, key_size);
            page_id = internal.child_at(0);
            height += 1;
        }
    }

    /// Mirror a root change into the header page. Callers hold the tree
    /// latch exclusively.
    fn update_root_record(&self, root_page_id: PageId) -> StorageResult<()> {
        let page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = page.write();
            let mut header = HeaderPage::from_data(&mut *guard);
            if !header.update_record(&self.name, root_page_id) {
                header.insert_record(&self.name, root_page_id);
            }
        }
        page.mark_dirty();
        log::debug!("tree {}: root is now {}", self.name, root_page_id);
        Ok(())
    }

    /// Shared-latch descent to the leaf covering `key`.
    fn find_leaf_for_read(
        &self,
        key: &[u8],
    ) -> StorageResult<Option<(PageRef, PageReadGuard)>> {
        let root_guard = self.root.read();
        if !root_guard.page_id.is_valid() {
            return Ok(None);
        }
        let mut page = self.buffer_pool.fetch_page(root_guard.page_id)?;
        let mut guard = page.read();
        drop(root_guard);

        loop {
            if is_leaf_page(&guard) {
                return Ok(Some((page, guard)));
            }
            let child_id = {
                let internal = BTreeInternalPage::from_data(&*guard, self.key_size);
                internal.child_at(internal.child_index_for(key, &self.comparator))
            };
            // child latch before parent release
            let child = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child.read();
            drop(guard);
            drop(page);
            page = child;
            guard = child_guard;
        }
    }

    /// Optimistic write descent: shared latches down, exclusive only on the
    /// leaf. The height recorded in the root metadata tells us when the next
    /// child is the leaf, so the leaf is never latched shared first.
    fn find_leaf_optimistic(
        &self,
        key: &[u8],
    ) -> StorageResult<Option<(PageRef, PageWriteGuard)>> {
        let root_guard = self.root.read();
        if !root_guard.page_id.is_valid() {
            return Ok(None);
        }
        let mut depth = root_guard.height;
        let page = self.buffer_pool.fetch_page(root_guard.page_id)?;

        if depth == 1 {
            let guard = page.write();
            drop(root_guard);
            return Ok(Some((page, guard)));
        }

        let mut page = page;
        let mut guard = page.read();
        drop(root_guard);

        loop {
            let child_id = {
                let internal = BTreeInternalPage::from_data(&*guard, self.key_size);
                internal.child_at(internal.child_index_for(key, &self.comparator))
            };
            depth -= 1;
            let child = self.buffer_pool.fetch_page(child_id)?;
            if depth == 1 {
                let child_guard = child.write();
                drop(guard);
                drop(page);
                return Ok(Some((child, child_guard)));
            }
            let child_guard = child.read();
            drop(guard);
            drop(page);
            page = child;
            guard = child_guard;
        }
    }

    fn is_safe_for(guard: &PageWriteGuard, op: WriteOp, key_size: usize) -> bool {
        if is_leaf_page(guard) {
            let leaf = BTreeLeafPage::from_data(&**guard, key_size);
            match op {
                WriteOp::Insert => leaf.size() + 1 < leaf.max_size(),
                WriteOp::Remove => leaf.size() > leaf.min_size(),
            }
        } else {
            let internal = BTreeInternalPage::from_data(&**guard, key_size);
            match op {
                WriteOp::Insert => internal.size() < internal.max_size(),
                WriteOp::Remove => internal.size() > internal.min_size(),
            }
        }
    }

    /// Exclusive-latch descent. Every latched page is pushed onto the
    /// transaction's page set; whenever a freshly latched child is safe, all
    /// held ancestors (and the tree-latch sentinel) are released.
    fn descend_for_write(
        &self,
        root_page_id: PageId,
        key: &[u8],
        op: WriteOp,
        pages: &mut VecDeque<LatchedPage>,
    ) -> StorageResult<()> {
        let mut current = self.buffer_pool.fetch_page(root_page_id)?;
        let mut guard = current.write();

        loop {
            if is_leaf_page(&guard) {
                pages.push_back(LatchedPage::Page(PageWriteLatch {
                    guard,
                    page: current,
                }));
                return Ok(());
            }

            let child_id = {
                let internal = BTreeInternalPage::from_data(&*guard, self.key_size);
                internal.child_at(internal.child_index_for(key, &self.comparator))
            };
            pages.push_back(LatchedPage::Page(PageWriteLatch {
                guard,
                page: current,
            }));

            let child = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child.write();
            if Self::is_safe_for(&child_guard, op, self.key_size) {
                // at most one subtree stays locked
                pages.clear();
            }
            current = child;
            guard = child_guard;
        }
    }

    fn insert_pessimistic(
        &self,
        key: &[u8],
        value: RecordId,
        txn: &Transaction,
    ) -> StorageResult<bool> {
        let mut root_guard = self.root.write_arc();

        if !root_guard.page_id.is_valid() {
            // start a new tree with a single root leaf
            let page = self.buffer_pool.new_page()?;
            let page_id = page.page_id();
            {
                let mut guard = page.write();
                let mut leaf = BTreeLeafPage::init(
                    &mut *guard,
                    page_id,
                    INVALID_PAGE_ID,
                    self.leaf_max_size,
                    self.key_size,
                );
                leaf.insert(key, value, &self.comparator);
            }
            page.mark_dirty();
            drop(page);

            root_guard.page_id = page_id;
            root_guard.height = 1;
            self.update_root_record(page_id)?;
            return Ok(true);
        }

        let root_page_id = root_guard.page_id;
        let mut pages = txn.page_set();
        debug_assert!(pages.is_empty());
        pages.push_back(LatchedPage::TreeLatch(root_guard));

        let result = (|| {
            self.descend_for_write(root_page_id, key, WriteOp::Insert, &mut pages)?;
            self.apply_leaf_insert(key, value, txn, &mut pages)
        })();

        pages.clear();
        drop(pages);
        self.drain_deleted_pages(txn)?;
        result
    }

    fn apply_leaf_insert(
        &self,
        key: &[u8],
        value: RecordId,
        txn: &Transaction,
        pages: &mut VecDeque<LatchedPage>,
    ) -> StorageResult<bool> {
        let leaf_index = pages.len() - 1;
        let mut split = None;
        let inserted;
        {
            let LatchedPage::Page(entry) = &mut pages[leaf_index] else {
                unreachable!("descent ends on a page")
            };
            let mut leaf = BTreeLeafPage::from_data(&mut *entry.guard, self.key_size);
            inserted = leaf.insert(key, value, &self.comparator);
            if inserted {
                entry.page.mark_dirty();
            }

            if inserted && leaf.size() == leaf.max_size() {
                let right_page = self.buffer_pool.new_page()?;
                let right_id = right_page.page_id();
                let mut right_guard = right_page.write();
                let promoted = {
                    let mut right = BTreeLeafPage::init(
                        &mut *right_guard,
                        right_id,
                        leaf.parent_page_id(),
                        self.leaf_max_size,
                        self.key_size,
                    );
                    leaf.move_half_to(&mut right);
                    right.set_next_page_id(leaf.next_page_id());
                    right.key_at(0).to_vec()
                };
                leaf.set_next_page_id(right_id);
                right_page.mark_dirty();
                split = Some((promoted, right_page, right_guard));
            }
        }

        if let Some((promoted, right_page, right_guard)) = split {
            self.insert_into_parent(leaf_index, promoted, right_page, right_guard, txn, pages)?;
        }
        Ok(inserted)
    }

    /// Push a split's (promoted key, new right sibling) into the parent,
    /// splitting upward as long as parents are full; a root split installs a
    /// fresh root and bumps the height.
    fn insert_into_parent(
        &self,
        mut child_index: usize,
        mut key: Vec<u8>,
        mut right_page: PageRef,
        mut right_guard: PageWriteGuard,
        _txn: &Transaction,
        pages: &mut VecDeque<LatchedPage>,
    ) -> StorageResult<()> {
        loop {
            let (child_id, child_is_root) = {
                let LatchedPage::Page(entry) = &pages[child_index] else {
                    unreachable!("split node is a page")
                };
                (
                    btree_page::tree_page_id(&entry.guard),
                    btree_page::tree_page_parent(&entry.guard) == INVALID_PAGE_ID,
                )
            };

            if child_is_root {
                let root_page = self.buffer_pool.new_page()?;
                let root_id = root_page.page_id();
                {
                    let mut root_wguard = root_page.write();
                    let mut new_root = BTreeInternalPage::init(
                        &mut *root_wguard,
                        root_id,
                        INVALID_PAGE_ID,
                        self.internal_max_size,
                        self.key_size,
                    );
                    new_root.init_root_entries(child_id, &key, right_page.page_id());
                }
                root_page.mark_dirty();

                {
                    let LatchedPage::Page(entry) = &mut pages[child_index] else {
                        unreachable!()
                    };
                    btree_page::set_tree_page_parent(&mut entry.guard, root_id);
                    entry.page.mark_dirty();
                }
                btree_page::set_tree_page_parent(&mut right_guard, root_id);
                right_page.mark_dirty();

                {
                    let LatchedPage::TreeLatch(meta) = &mut pages[0] else {
                        unreachable!("root split requires the tree latch")
                    };
                    meta.page_id = root_id;
                    meta.height += 1;
                }
                drop(right_guard);
                drop(right_page);
                self.update_root_record(root_id)?;
                return Ok(());
            }

            let parent_index = child_index - 1;
            let fits = {
                let LatchedPage::Page(parent_entry) = &pages[parent_index] else {
                    unreachable!("unsafe child keeps its parent latched")
                };
                let parent = BTreeInternalPage::from_data(&*parent_entry.guard, self.key_size);
                parent.size() < parent.max_size()
            };

            if fits {
                let LatchedPage::Page(parent_entry) = &mut pages[parent_index] else {
                    unreachable!()
                };
                let mut parent =
                    BTreeInternalPage::from_data(&mut *parent_entry.guard, self.key_size);
                parent.insert(&key, right_page.page_id(), &self.comparator);
                parent_entry.page.mark_dirty();
                drop(right_guard);
                drop(right_page);
                return Ok(());
            }

            // parent splits too; carry the promotion one level up
            let new_page = self.buffer_pool.new_page()?;
            let new_id = new_page.page_id();
            let mut new_guard = new_page.write();
            let promoted = {
                let LatchedPage::Page(parent_entry) = &mut pages[parent_index] else {
                    unreachable!()
                };
                let mut parent =
                    BTreeInternalPage::from_data(&mut *parent_entry.guard, self.key_size);
                let mut new_internal = BTreeInternalPage::init(
                    &mut *new_guard,
                    new_id,
                    parent.parent_page_id(),
                    self.internal_max_size,
                    self.key_size,
                );
                let promoted = parent.move_half_and_insert(
                    &mut new_internal,
                    &key,
                    right_page.page_id(),
                    &self.comparator,
                );
                parent_entry.page.mark_dirty();
                promoted
            };
            new_page.mark_dirty();

            // children that moved under the new internal need their parent
            // pointers rewritten
            let moved_children: Vec<PageId> = {
                let new_internal = BTreeInternalPage::from_data(&*new_guard, self.key_size);
                (0..new_internal.size())
                    .map(|i| new_internal.child_at(i))
                    .collect()
            };
            for moved in moved_children {
                if moved == right_page.page_id() {
                    btree_page::set_tree_page_parent(&mut right_guard, new_id);
                    right_page.mark_dirty();
                } else if moved == child_id {
                    let LatchedPage::Page(entry) = &mut pages[child_index] else {
                        unreachable!()
                    };
                    btree_page::set_tree_page_parent(&mut entry.guard, new_id);
                    entry.page.mark_dirty();
                } else {
                    self.reparent(moved, new_id)?;
                }
            }

            drop(right_guard);
            drop(right_page);
            key = promoted;
            right_page = new_page;
            right_guard = new_guard;
            child_index = parent_index;
        }
    }

    /// Rewrite the parent pointer of a page not latched by this descent.
    fn reparent(&self, page_id: PageId, parent_id: PageId) -> StorageResult<()> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        {
            let mut guard = page.write();
            btree_page::set_tree_page_parent(&mut guard, parent_id);
        }
        page.mark_dirty();
        Ok(())
    }

    fn remove_pessimistic(&self, key: &[u8], txn: &Transaction) -> StorageResult<bool> {
        let root_guard = self.root.write_arc();
        if !root_guard.page_id.is_valid() {
            return Ok(false);
        }

        let root_page_id = root_guard.page_id;
        let mut pages = txn.page_set();
        debug_assert!(pages.is_empty());
        pages.push_back(LatchedPage::TreeLatch(root_guard));

        let result = (|| {
            self.descend_for_write(root_page_id, key, WriteOp::Remove, &mut pages)?;
            self.apply_leaf_remove(key, txn, &mut pages)
        })();

        pages.clear();
        drop(pages);
        self.drain_deleted_pages(txn)?;
        result
    }

    fn apply_leaf_remove(
        &self,
        key: &[u8],
        txn: &Transaction,
        pages: &mut VecDeque<LatchedPage>,
    ) -> StorageResult<bool> {
        enum Outcome {
            NotFound,
            Done,
            RootEmptied(PageId),
            Underflow(Vec<u8>),
        }

        let leaf_index = pages.len() - 1;
        let outcome = {
            let LatchedPage::Page(entry) = &mut pages[leaf_index] else {
                unreachable!("descent ends on a page")
            };
            let mut leaf = BTreeLeafPage::from_data(&mut *entry.guard, self.key_size);
            let index = leaf.lower_bound(key, &self.comparator);
            if index >= leaf.size()
                || self.comparator.compare(leaf.key_at(index), key) != Ordering::Equal
            {
                Outcome::NotFound
            } else {
                // locator for finding this leaf in its parent, captured
                // before the shift can move it
                let locator = leaf.key_at(0).to_vec();
                leaf.remove_entry_at(index);
                entry.page.mark_dirty();
                if leaf.is_root() {
                    if leaf.size() == 0 {
                        Outcome::RootEmptied(leaf.page_id())
                    } else {
                        Outcome::Done
                    }
                } else if leaf.size() < leaf.min_size() {
                    Outcome::Underflow(locator)
                } else {
                    Outcome::Done
                }
            }
        };

        match outcome {
            Outcome::NotFound => Ok(false),
            Outcome::Done => Ok(true),
            Outcome::RootEmptied(root_page) => {
                txn.add_deleted_page(root_page);
                let LatchedPage::TreeLatch(meta) = &mut pages[0] else {
                    unreachable!("emptying the root requires the tree latch")
                };
                meta.page_id = INVALID_PAGE_ID;
                meta.height = 0;
                self.update_root_record(INVALID_PAGE_ID)?;
                Ok(true)
            }
            Outcome::Underflow(locator) => {
                self.rebalance_leaf(leaf_index, &locator, txn, pages)?;
                Ok(true)
            }
        }
    }

    /// Restore a deficient leaf: borrow from the left sibling, borrow from
    /// the right sibling, merge into the left, or merge the right into it,
    /// in that order.
    fn rebalance_leaf(
        &self,
        leaf_index: usize,
        locator: &[u8],
        txn: &Transaction,
        pages: &mut VecDeque<LatchedPage>,
    ) -> StorageResult<()> {
        let parent_index = leaf_index - 1;
        let (child_pos, left_id, right_id) = {
            let LatchedPage::Page(parent_entry) = &pages[parent_index] else {
                unreachable!("deficient leaf keeps its parent latched")
            };
            let parent = BTreeInternalPage::from_data(&*parent_entry.guard, self.key_size);
            let pos = parent.child_index_for(locator, &self.comparator);
            let left = (pos > 0).then(|| parent.child_at(pos - 1));
            let right = (pos + 1 < parent.size()).then(|| parent.child_at(pos + 1));
            (pos, left, right)
        };

        // borrow the left sibling's last entry
        if let Some(left_id) = left_id {
            let left_page = self.buffer_pool.fetch_page(left_id)?;
            let mut left_guard = left_page.write();
            let can_borrow = {
                let left = BTreeLeafPage::from_data(&*left_guard, self.key_size);
                left.size() > left.min_size()
            };
            if can_borrow {
                let (borrowed_key, borrowed_value) = {
                    let mut left = BTreeLeafPage::from_data(&mut *left_guard, self.key_size);
                    let last = left.size() - 1;
                    let borrowed = (left.key_at(last).to_vec(), left.value_at(last));
                    left.remove_entry_at(last);
                    borrowed
                };
                left_page.mark_dirty();
                {
                    let LatchedPage::Page(entry) = &mut pages[leaf_index] else {
                        unreachable!()
                    };
                    let mut leaf = BTreeLeafPage::from_data(&mut *entry.guard, self.key_size);
                    leaf.insert_entry_at(0, &borrowed_key, borrowed_value);
                }
                {
                    let LatchedPage::Page(parent_entry) = &mut pages[parent_index] else {
                        unreachable!()
                    };
                    let mut parent =
                        BTreeInternalPage::from_data(&mut *parent_entry.guard, self.key_size);
                    parent.set_key_at(child_pos, &borrowed_key);
                    parent_entry.page.mark_dirty();
                }
                return Ok(());
            }
        }

        // borrow the right sibling's first entry
        if let Some(right_id) = right_id {
            let right_page = self.buffer_pool.fetch_page(right_id)?;
            let mut right_guard = right_page.write();
            let can_borrow = {
                let right = BTreeLeafPage::from_data(&*right_guard, self.key_size);
                right.size() > right.min_size()
            };
            if can_borrow {
                let (borrowed_key, borrowed_value, new_separator) = {
                    let mut right = BTreeLeafPage::from_data(&mut *right_guard, self.key_size);
                    let borrowed = (right.key_at(0).to_vec(), right.value_at(0));
                    right.remove_entry_at(0);
                    (borrowed.0, borrowed.1, right.key_at(0).to_vec())
                };
                right_page.mark_dirty();
                {
                    let LatchedPage::Page(entry) = &mut pages[leaf_index] else {
                        unreachable!()
                    };
                    let mut leaf = BTreeLeafPage::from_data(&mut *entry.guard, self.key_size);
                    let size = leaf.size();
                    leaf.insert_entry_at(size, &borrowed_key, borrowed_value);
                }
                {
                    let LatchedPage::Page(parent_entry) = &mut pages[parent_index] else {
                        unreachable!()
                    };
                    let mut parent =
                        BTreeInternalPage::from_data(&mut *parent_entry.guard, self.key_size);
                    parent.set_key_at(child_pos + 1, &new_separator);
                    parent_entry.page.mark_dirty();
                }
                return Ok(());
            }
        }

        // merge this leaf into the left sibling
        if let Some(left_id) = left_id {
            let left_page = self.buffer_pool.fetch_page(left_id)?;
            let mut left_guard = left_page.write();
            let leaf_id = {
                let LatchedPage::Page(entry) = &mut pages[leaf_index] else {
                    unreachable!()
                };
                let mut leaf = BTreeLeafPage::from_data(&mut *entry.guard, self.key_size);
                let mut left = BTreeLeafPage::from_data(&mut *left_guard, self.key_size);
                let next = leaf.next_page_id();
                left.append_all_from(&mut leaf);
                left.set_next_page_id(next);
                leaf.page_id()
            };
            left_page.mark_dirty();
            txn.add_deleted_page(leaf_id);
            // release the sibling before the upward pass; it may need to be
            // re-latched if the parent itself merges
            drop(left_guard);
            drop(left_page);
            return self.remove_internal_entry(parent_index, child_pos, txn, pages);
        }

        // merge the right sibling into this leaf
        let right_id = right_id.expect("a non-root leaf has at least one sibling");
        let right_page = self.buffer_pool.fetch_page(right_id)?;
        let mut right_guard = right_page.write();
        {
            let LatchedPage::Page(entry) = &mut pages[leaf_index] else {
                unreachable!()
            };
            let mut leaf = BTreeLeafPage::from_data(&mut *entry.guard, self.key_size);
            let mut right = BTreeLeafPage::from_data(&mut *right_guard, self.key_size);
            let next = right.next_page_id();
            leaf.append_all_from(&mut right);
            leaf.set_next_page_id(next);
        }
        right_page.mark_dirty();
        txn.add_deleted_page(right_id);
        drop(right_guard);
        drop(right_page);
        self.remove_internal_entry(parent_index, child_pos + 1, txn, pages)
    }

    /// Remove a separator entry from an internal node and rebalance upward
    /// as long as nodes fall below half capacity. Collapsing the root hands
    /// its only child the root role.
    fn remove_internal_entry(
        &self,
        mut node_index: usize,
        mut entry_index: usize,
        txn: &Transaction,
        pages: &mut VecDeque<LatchedPage>,
    ) -> StorageResult<()> {
        enum Step {
            Done,
            RootCollapse { old_root: PageId, child: PageId },
            Underflow(Vec<u8>),
        }

        loop {
            let step = {
                let LatchedPage::Page(entry) = &mut pages[node_index] else {
                    unreachable!("separator removal targets a latched page")
                };
                let mut node = BTreeInternalPage::from_data(&mut *entry.guard, self.key_size);
                debug_assert!(node.size() > 1);
                let locator = node.key_at(1).to_vec();
                node.remove_entry_at(entry_index);
                entry.page.mark_dirty();
                if node.is_root() {
                    if node.size() == 1 {
                        Step::RootCollapse {
                            old_root: node.page_id(),
                            child: node.child_at(0),
                        }
                    } else {
                        Step::Done
                    }
                } else if node.size() < node.min_size() {
                    Step::Underflow(locator)
                } else {
                    Step::Done
                }
            };

            match step {
                Step::Done => return Ok(()),
                Step::RootCollapse { old_root, child } => {
                    // the surviving child may be the next page on our
                    // latched path; otherwise it is reachable only through
                    // the old root we hold, so a short exclusive latch works
                    let mut reparented = false;
                    if node_index + 1 < pages.len() {
                        if let LatchedPage::Page(child_entry) = &mut pages[node_index + 1] {
                            if btree_page::tree_page_id(&child_entry.guard) == child {
                                btree_page::set_tree_page_parent(
                                    &mut child_entry.guard,
                                    INVALID_PAGE_ID,
                                );
                                child_entry.page.mark_dirty();
                                reparented = true;
                            }
                        }
                    }
                    if !reparented {
                        self.reparent(child, INVALID_PAGE_ID)?;
                    }

                    txn.add_deleted_page(old_root);
                    {
                        let LatchedPage::TreeLatch(meta) = &mut pages[0] else {
                            unreachable!("root collapse requires the tree latch")
                        };
                        meta.page_id = child;
                        meta.height -= 1;
                    }
                    self.update_root_record(child)?;
                    log::debug!("tree {}: root collapsed into {}", self.name, child);
                    return Ok(());
                }
                Step::Underflow(locator) => {
                    match self.rebalance_internal(node_index, &locator, txn, pages)? {
                        Some((parent_index, parent_entry_index)) => {
                            node_index = parent_index;
                            entry_index = parent_entry_index;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Borrow or merge for a deficient internal node. Returns the next
    /// separator removal (parent deque index, entry index) when two nodes
    /// merged, None when borrowing settled the deficit.
    fn rebalance_internal(
        &self,
        node_index: usize,
        locator: &[u8],
        txn: &Transaction,
        pages: &mut VecDeque<LatchedPage>,
    ) -> StorageResult<Option<(usize, usize)>> {
        let parent_index = node_index - 1;
        let (child_pos, left_id, right_id) = {
            let LatchedPage::Page(parent_entry) = &pages[parent_index] else {
                unreachable!("deficient node keeps its parent latched")
            };
            let parent = BTreeInternalPage::from_data(&*parent_entry.guard, self.key_size);
            let pos = parent.child_index_for(locator, &self.comparator);
            let left = (pos > 0).then(|| parent.child_at(pos - 1));
            let right = (pos + 1 < parent.size()).then(|| parent.child_at(pos + 1));
            (pos, left, right)
        };
        let node_id = {
            let LatchedPage::Page(entry) = &pages[node_index] else {
                unreachable!()
            };
            btree_page::tree_page_id(&entry.guard)
        };

        // borrow the left sibling's last child
        if let Some(left_id) = left_id {
            let left_page = self.buffer_pool.fetch_page(left_id)?;
            let mut left_guard = left_page.write();
            let can_borrow = {
                let left = BTreeInternalPage::from_data(&*left_guard, self.key_size);
                left.size() > left.min_size()
            };
            if can_borrow {
                let separator = {
                    let LatchedPage::Page(parent_entry) = &pages[parent_index] else {
                        unreachable!()
                    };
                    let parent = BTreeInternalPage::from_data(&*parent_entry.guard, self.key_size);
                    parent.key_at(child_pos).to_vec()
                };
                let (moved_child, left_last_key) = {
                    let mut left = BTreeInternalPage::from_data(&mut *left_guard, self.key_size);
                    let last = left.size() - 1;
                    let moved = (left.child_at(last), left.key_at(last).to_vec());
                    left.remove_entry_at(last);
                    moved
                };
                left_page.mark_dirty();
                {
                    let LatchedPage::Page(entry) = &mut pages[node_index] else {
                        unreachable!()
                    };
                    let mut node = BTreeInternalPage::from_data(&mut *entry.guard, self.key_size);
                    node.insert_front(&separator, moved_child);
                }
                {
                    let LatchedPage::Page(parent_entry) = &mut pages[parent_index] else {
                        unreachable!()
                    };
                    let mut parent =
                        BTreeInternalPage::from_data(&mut *parent_entry.guard, self.key_size);
                    parent.set_key_at(child_pos, &left_last_key);
                    parent_entry.page.mark_dirty();
                }
                self.reparent(moved_child, node_id)?;
                return Ok(None);
            }
        }

        // borrow the right sibling's first child
        if let Some(right_id) = right_id {
            let right_page = self.buffer_pool.fetch_page(right_id)?;
            let mut right_guard = right_page.write();
            let can_borrow = {
                let right = BTreeInternalPage::from_data(&*right_guard, self.key_size);
                right.size() > right.min_size()
            };
            if can_borrow {
                let separator = {
                    let LatchedPage::Page(parent_entry) = &pages[parent_index] else {
                        unreachable!()
                    };
                    let parent = BTreeInternalPage::from_data(&*parent_entry.guard, self.key_size);
                    parent.key_at(child_pos + 1).to_vec()
                };
                let (moved_child, new_separator) = {
                    let mut right = BTreeInternalPage::from_data(&mut *right_guard, self.key_size);
                    let moved = (right.child_at(0), right.key_at(1).to_vec());
                    right.remove_entry_at(0);
                    moved
                };
                right_page.mark_dirty();
                {
                    let LatchedPage::Page(entry) = &mut pages[node_index] else {
                        unreachable!()
                    };
                    let mut node = BTreeInternalPage::from_data(&mut *entry.guard, self.key_size);
                    node.push_back_entry(&separator, moved_child);
                }
                {
                    let LatchedPage::Page(parent_entry) = &mut pages[parent_index] else {
                        unreachable!()
                    };
                    let mut parent =
                        BTreeInternalPage::from_data(&mut *parent_entry.guard, self.key_size);
                    parent.set_key_at(child_pos + 1, &new_separator);
                    parent_entry.page.mark_dirty();
                }
                self.reparent(moved_child, node_id)?;
                return Ok(None);
            }
        }

        // merge this node into the left sibling
        if let Some(left_id) = left_id {
            let left_page = self.buffer_pool.fetch_page(left_id)?;
            let mut left_guard = left_page.write();
            let separator = {
                let LatchedPage::Page(parent_entry) = &pages[parent_index] else {
                    unreachable!()
                };
                let parent = BTreeInternalPage::from_data(&*parent_entry.guard, self.key_size);
                parent.key_at(child_pos).to_vec()
            };
            let moved_children: Vec<PageId> = {
                let LatchedPage::Page(entry) = &pages[node_index] else {
                    unreachable!()
                };
                let node = BTreeInternalPage::from_data(&*entry.guard, self.key_size);
                let mut left = BTreeInternalPage::from_data(&mut *left_guard, self.key_size);
                left.push_back_entry(&separator, node.child_at(0));
                for i in 1..node.size() {
                    left.push_back_entry(node.key_at(i), node.child_at(i));
                }
                (0..node.size()).map(|i| node.child_at(i)).collect()
            };
            left_page.mark_dirty();
            self.reparent_moved_children(&moved_children, left_id, node_index, pages)?;
            txn.add_deleted_page(node_id);
            return Ok(Some((parent_index, child_pos)));
        }

        // merge the right sibling into this node
        let right_id = right_id.expect("a non-root internal node has at least one sibling");
        let right_page = self.buffer_pool.fetch_page(right_id)?;
        let mut right_guard = right_page.write();
        let separator = {
            let LatchedPage::Page(parent_entry) = &pages[parent_index] else {
                unreachable!()
            };
            let parent = BTreeInternalPage::from_data(&*parent_entry.guard, self.key_size);
            parent.key_at(child_pos + 1).to_vec()
        };
        let moved_children: Vec<PageId> = {
            let LatchedPage::Page(entry) = &mut pages[node_index] else {
                unreachable!()
            };
            let mut node = BTreeInternalPage::from_data(&mut *entry.guard, self.key_size);
            let right = BTreeInternalPage::from_data(&*right_guard, self.key_size);
            node.push_back_entry(&separator, right.child_at(0));
            for i in 1..right.size() {
                node.push_back_entry(right.key_at(i), right.child_at(i));
            }
            entry.page.mark_dirty();
            (0..right.size()).map(|i| right.child_at(i)).collect()
        };
        drop(right_guard);
        drop(right_page);
        for moved in moved_children {
            self.reparent(moved, node_id)?;
        }
        txn.add_deleted_page(right_id);
        Ok(Some((parent_index, child_pos + 1)))
    }

    /// After merging into the left sibling, every moved child points at the
    /// sibling now; the one on our latched path is rewritten through its
    /// held guard, the rest through short fetches.
    fn reparent_moved_children(
        &self,
        moved_children: &[PageId],
        new_parent: PageId,
        merged_node_index: usize,
        pages: &mut VecDeque<LatchedPage>,
    ) -> StorageResult<()> {
        let path_child_id = if merged_node_index + 1 < pages.len() {
            let LatchedPage::Page(entry) = &pages[merged_node_index + 1] else {
                unreachable!()
            };
            Some(btree_page::tree_page_id(&entry.guard))
        } else {
            None
        };

        for &moved in moved_children {
            if Some(moved) == path_child_id {
                let LatchedPage::Page(entry) = &mut pages[merged_node_index + 1] else {
                    unreachable!()
                };
                btree_page::set_tree_page_parent(&mut entry.guard, new_parent);
                entry.page.mark_dirty();
            } else {
                self.reparent(moved, new_parent)?;
            }
        }
        Ok(())
    }

    /// Physically delete pages merged away by this operation. Runs after
    /// every latch is released, so the pages are unpinned.
    fn drain_deleted_pages(&self, txn: &Transaction) -> StorageResult<()> {
        for page_id in txn.take_deleted_pages() {
            if !self.buffer_pool.delete_page(page_id)? {
                log::warn!("deferred delete of {} skipped: still pinned", page_id);
            }
        }
        Ok(())
    }
}
