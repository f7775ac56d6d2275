pub mod id;
pub mod manager;
pub mod state;

use crate::common::{RecordId, TableOid};
use crate::concurrency::lock_manager::LockMode;
use crate::index::btree::latch::LatchedPage;
use crate::storage::page::PageId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

pub use id::{TransactionId, TransactionIdGenerator};
pub use manager::TransactionManager;
pub use state::{IsolationLevel, TransactionState};

#[derive(Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

impl LockSets {
    fn table_set(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }

    fn table_mode(&self, oid: TableOid) -> Option<LockMode> {
        if self.shared_tables.contains(&oid) {
            Some(LockMode::Shared)
        } else if self.exclusive_tables.contains(&oid) {
            Some(LockMode::Exclusive)
        } else if self.intention_shared_tables.contains(&oid) {
            Some(LockMode::IntentionShared)
        } else if self.intention_exclusive_tables.contains(&oid) {
            Some(LockMode::IntentionExclusive)
        } else if self.shared_intention_exclusive_tables.contains(&oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else {
            None
        }
    }

    fn row_mode(&self, oid: TableOid, rid: RecordId) -> Option<LockMode> {
        if self
            .shared_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Shared)
        } else if self
            .exclusive_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Exclusive)
        } else {
            None
        }
    }
}

struct TransactionInner {
    state: TransactionState,
    locks: LockSets,
}

/// Per-transaction context shared between the execution layer, the lock
/// manager, the deadlock detector, and the B+-tree.
///
/// The internal mutex guards the 2PL state and the held lock sets. The
/// crabbing latch deque and the deleted-page set are only touched by the one
/// thread running the transaction's tree operation, so they sit behind their
/// own locks and are never held across waits.
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    inner: Mutex<TransactionInner>,
    page_set: parking_lot::Mutex<VecDeque<LatchedPage>>,
    deleted_page_set: parking_lot::Mutex<HashSet<PageId>>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Growing,
                locks: LockSets::default(),
            }),
            page_set: parking_lot::Mutex::new(VecDeque::new()),
            deleted_page_set: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().unwrap().state
    }

    pub fn set_state(&self, state: TransactionState) {
        self.inner.lock().unwrap().state = state;
    }

    /// Lock modes currently held, queried by the lock manager under its
    /// queue latch.
    pub fn table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        self.inner.lock().unwrap().locks.table_mode(oid)
    }

    pub fn row_lock_mode(&self, oid: TableOid, rid: RecordId) -> Option<LockMode> {
        self.inner.lock().unwrap().locks.row_mode(oid, rid)
    }

    pub fn has_row_locks_on(&self, oid: TableOid) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .locks
            .shared_rows
            .get(&oid)
            .is_some_and(|rows| !rows.is_empty())
            || inner
                .locks
                .exclusive_rows
                .get(&oid)
                .is_some_and(|rows| !rows.is_empty())
    }

    pub(crate) fn insert_table_lock(&self, oid: TableOid, mode: LockMode) {
        self.inner.lock().unwrap().locks.table_set(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, oid: TableOid, mode: LockMode) {
        self.inner.lock().unwrap().locks.table_set(mode).remove(&oid);
    }

    pub(crate) fn insert_row_lock(&self, oid: TableOid, rid: RecordId, mode: LockMode) {
        let mut inner = self.inner.lock().unwrap();
        let rows = match mode {
            LockMode::Shared => &mut inner.locks.shared_rows,
            LockMode::Exclusive => &mut inner.locks.exclusive_rows,
            _ => unreachable!("row locks are only S or X"),
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, oid: TableOid, rid: RecordId, mode: LockMode) {
        let mut inner = self.inner.lock().unwrap();
        let rows = match mode {
            LockMode::Shared => &mut inner.locks.shared_rows,
            LockMode::Exclusive => &mut inner.locks.exclusive_rows,
            _ => unreachable!("row locks are only S or X"),
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
        }
    }

    /// The page latches held by an in-flight tree write, root-first. The
    /// front may be the tree-latch sentinel.
    pub fn page_set(&self) -> parking_lot::MutexGuard<'_, VecDeque<LatchedPage>> {
        self.page_set.lock()
    }

    /// Pages merged away by an in-flight tree write; physically deleted once
    /// all latches are released.
    pub fn add_deleted_page(&self, page_id: PageId) {
        self.deleted_page_set.lock().insert(page_id);
    }

    pub fn take_deleted_pages(&self) -> HashSet<PageId> {
        std::mem::take(&mut *self.deleted_page_set.lock())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let txn = Transaction::new(TransactionId::new(1), IsolationLevel::RepeatableRead);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
        assert_eq!(txn.table_lock_mode(TableOid(1)), None);
    }

    #[test]
    fn test_table_lock_bookkeeping() {
        let txn = Transaction::new(TransactionId::new(1), IsolationLevel::RepeatableRead);
        let oid = TableOid(3);

        txn.insert_table_lock(oid, LockMode::IntentionExclusive);
        assert_eq!(txn.table_lock_mode(oid), Some(LockMode::IntentionExclusive));

        txn.remove_table_lock(oid, LockMode::IntentionExclusive);
        assert_eq!(txn.table_lock_mode(oid), None);
    }

    #[test]
    fn test_row_lock_bookkeeping() {
        let txn = Transaction::new(TransactionId::new(1), IsolationLevel::RepeatableRead);
        let oid = TableOid(3);
        let rid = RecordId::new(PageId(1), 4);

        assert!(!txn.has_row_locks_on(oid));
        txn.insert_row_lock(oid, rid, LockMode::Shared);
        assert_eq!(txn.row_lock_mode(oid, rid), Some(LockMode::Shared));
        assert!(txn.has_row_locks_on(oid));

        txn.remove_row_lock(oid, rid, LockMode::Shared);
        assert_eq!(txn.row_lock_mode(oid, rid), None);
        assert!(!txn.has_row_locks_on(oid));
    }

    #[test]
    fn test_deleted_page_set_drains() {
        let txn = Transaction::new(TransactionId::new(1), IsolationLevel::RepeatableRead);
        txn.add_deleted_page(PageId(5));
        txn.add_deleted_page(PageId(6));

        let drained = txn.take_deleted_pages();
        assert_eq!(drained.len(), 2);
        assert!(txn.take_deleted_pages().is_empty());
    }
}
