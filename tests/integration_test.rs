use crabdb::common::{RecordId, TableOid};
use crabdb::concurrency::{LockManager, LockMode};
use crabdb::container::ExtendibleHashTable;
use crabdb::index::BPlusTree;
use crabdb::index::btree::key::{LexicographicComparator, U64_KEY_SIZE, u64_from_key, u64_key};
use crabdb::storage::buffer::BufferPoolManager;
use crabdb::storage::disk::{DiskManager, PAGE_SIZE};
use crabdb::storage::error::StorageError;
use crabdb::storage::page::{INVALID_PAGE_ID, PageId};
use crabdb::storage::replacer::{LruKReplacer, Replacer};
use crabdb::transaction::{IsolationLevel, TransactionManager, TransactionState};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn rid(v: u64) -> RecordId {
    RecordId::new(PageId(v as u32), v as u32)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_hash_directory_growth() {
    let table = ExtendibleHashTable::new(2);

    for key in [1u64, 2, 3, 4] {
        table.insert(key, key * 10);
    }

    assert_eq!(table.find(&3), Some(30));
    assert!(table.remove(&2));
    assert_eq!(table.find(&2), None);
    assert_eq!(table.find(&1), Some(10));
    assert_eq!(table.find(&4), Some(40));

    // four keys in buckets of two force at least one split, and every
    // bucket's depth stays bounded by the directory's
    assert!(table.num_buckets() > 1);
    let global = table.global_depth();
    assert!(global >= 1);
    for i in 0..(1usize << global) {
        assert!(table.local_depth(i) <= global);
    }
}

#[test]
fn test_buffer_pool_eviction_chain() {
    let dir = tempdir().unwrap();
    let file_path = dir.path().join("test.db");

    // seed the disk with recognizable pages 10, 20, 30, 40
    let mut disk = DiskManager::create(&file_path).unwrap();
    for id in [10u32, 20, 30, 40] {
        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = id as u8;
        disk.write_page(PageId(id), &data).unwrap();
    }

    let replacer = Box::new(LruKReplacer::new(3, 2));
    let pool = BufferPoolManager::new(disk, replacer, 3);

    let p10 = pool.fetch_page(PageId(10)).unwrap();
    let p20 = pool.fetch_page(PageId(20)).unwrap();
    let p30 = pool.fetch_page(PageId(30)).unwrap();
    assert_eq!(p10.read()[0], 10);

    // pool is full and everything is pinned
    assert!(matches!(
        pool.fetch_page(PageId(40)),
        Err(StorageError::BufferPoolFull)
    ));

    // unpinning 10 makes exactly one frame evictable
    drop(p10);
    let p40 = pool.fetch_page(PageId(40)).unwrap();
    assert_eq!(p40.read()[0], 40);

    // 10 is gone from the pool; getting it back needs another eviction
    assert!(matches!(
        pool.fetch_page(PageId(10)),
        Err(StorageError::BufferPoolFull)
    ));
    drop(p20);
    let p10 = pool.fetch_page(PageId(10)).unwrap();
    assert_eq!(p10.read()[0], 10);

    drop(p30);
    drop(p40);
    drop(p10);
}

#[test]
fn test_btree_insert_remove_stress() {
    init_logging();
    let dir = tempdir().unwrap();
    let disk = DiskManager::create(&dir.path().join("test.db")).unwrap();
    let replacer = Box::new(LruKReplacer::new(64, 2));
    let pool = BufferPoolManager::new(disk, replacer, 64);
    let tree = BPlusTree::new(
        "stress_index",
        pool,
        LexicographicComparator,
        U64_KEY_SIZE,
        4,
        4,
    )
    .unwrap();

    let txn_manager = TransactionManager::new();
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    for v in 1..=100u64 {
        assert!(tree.insert(&u64_key(v), rid(v), &txn).unwrap(), "insert {}", v);
    }

    let collected: Vec<u64> = tree.iter().unwrap().map(|(k, _)| u64_from_key(&k)).collect();
    assert_eq!(collected, (1..=100).collect::<Vec<_>>());

    for v in (1..=100u64).rev() {
        assert!(tree.remove(&u64_key(v), &txn).unwrap(), "remove {}", v);
        for kept in 1..v {
            assert_eq!(
                tree.get_value(&u64_key(kept)).unwrap(),
                Some(rid(kept)),
                "{} lost after removing {}",
                kept,
                v
            );
        }
        assert_eq!(tree.get_value(&u64_key(v)).unwrap(), None);
    }

    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);
}

#[test]
fn test_lru_k_distance_tie() {
    let mut replacer = LruKReplacer::new(8, 2);

    // frame 1 at t0, frame 2 at t1, frame 1 at t2, frame 2 at t3
    replacer.record_access(1);
    replacer.record_access(2);
    replacer.record_access(1);
    replacer.record_access(2);
    replacer.set_evictable(1, true);
    replacer.set_evictable(2, true);

    // frame 1's second-most-recent access is older
    assert_eq!(replacer.evict(), Some(1));
    assert_eq!(replacer.evict(), Some(2));
    assert_eq!(replacer.evict(), None);
}

#[test]
fn test_lock_fifo_with_compatibility() {
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = Arc::new(LockManager::new(Arc::clone(&txn_manager)));
    let table = TableOid(1);

    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t3 = txn_manager.begin(IsolationLevel::RepeatableRead);

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    assert!(lock_manager.lock_table(&t1, LockMode::Shared, table).unwrap());

    // t2 asks for X and must wait behind t1's S
    let t2_handle = {
        let lock_manager = Arc::clone(&lock_manager);
        let t2 = Arc::clone(&t2);
        let events = Arc::clone(&events);
        thread::spawn(move || {
            assert!(lock_manager.lock_table(&t2, LockMode::Exclusive, table).unwrap());
            events.lock().unwrap().push("t2_granted");
            thread::sleep(Duration::from_millis(50));
            events.lock().unwrap().push("t2_unlocked");
            assert!(lock_manager.unlock_table(&t2, table).unwrap());
        })
    };

    thread::sleep(Duration::from_millis(50));

    // t3's S is compatible with t1's S but FIFO keeps it behind t2's X
    let t3_handle = {
        let lock_manager = Arc::clone(&lock_manager);
        let t3 = Arc::clone(&t3);
        let events = Arc::clone(&events);
        thread::spawn(move || {
            assert!(lock_manager.lock_table(&t3, LockMode::Shared, table).unwrap());
            events.lock().unwrap().push("t3_granted");
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(t2.table_lock_mode(table), None, "t2 must still be waiting");
    assert_eq!(t3.table_lock_mode(table), None, "t3 must wait behind t2");

    assert!(lock_manager.unlock_table(&t1, table).unwrap());
    t2_handle.join().unwrap();
    t3_handle.join().unwrap();

    let log = events.lock().unwrap();
    assert_eq!(*log, vec!["t2_granted", "t2_unlocked", "t3_granted"]);
}

#[test]
fn test_deadlock_victim_is_newest() {
    init_logging();
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = Arc::new(LockManager::with_interval(
        Arc::clone(&txn_manager),
        Duration::from_millis(20),
    ));
    let a = TableOid(1);
    let b = TableOid(2);

    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::Exclusive, a).unwrap());
    assert!(lock_manager.lock_table(&t2, LockMode::Exclusive, b).unwrap());

    // t2 waits for A while holding B
    let t2_handle = {
        let lock_manager = Arc::clone(&lock_manager);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || {
            let granted = lock_manager.lock_table(&t2, LockMode::Exclusive, a).unwrap();
            if !granted {
                lock_manager.unlock_table(&t2, b).unwrap();
            }
            granted
        })
    };

    thread::sleep(Duration::from_millis(30));

    // t1 closes the cycle by waiting for B; the detector must pick t2, the
    // larger id, and t1's wait then succeeds
    assert!(lock_manager.lock_table(&t1, LockMode::Exclusive, b).unwrap());
    assert!(!t2_handle.join().unwrap());
    assert_eq!(t2.state(), TransactionState::Aborted);

    // with the victim gone nobody waits on anybody
    assert!(lock_manager.unlock_table(&t1, a).unwrap());
    assert!(lock_manager.unlock_table(&t1, b).unwrap());
    thread::sleep(Duration::from_millis(60));
    assert!(lock_manager.get_edge_list().is_empty());
}

#[test]
fn test_executor_style_flow() {
    // a transaction locking its way down to rows, updating the index, then
    // unwinding, the way an executor drives the core
    let dir = tempdir().unwrap();
    let disk = DiskManager::create(&dir.path().join("test.db")).unwrap();
    let replacer = Box::new(LruKReplacer::new(32, 2));
    let pool = BufferPoolManager::new(disk, replacer, 32);
    let tree = BPlusTree::new(
        "orders_pk",
        pool,
        LexicographicComparator,
        U64_KEY_SIZE,
        8,
        8,
    )
    .unwrap();

    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = LockManager::new(Arc::clone(&txn_manager));
    let orders = TableOid(7);

    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert!(lock_manager
        .lock_table(&txn, LockMode::IntentionExclusive, orders)
        .unwrap());

    for v in 1..=20u64 {
        let row = rid(v);
        assert!(lock_manager
            .lock_row(&txn, LockMode::Exclusive, orders, row)
            .unwrap());
        assert!(tree.insert(&u64_key(v), row, &txn).unwrap());
    }

    for v in 1..=20u64 {
        assert_eq!(tree.get_value(&u64_key(v)).unwrap(), Some(rid(v)));
        assert!(lock_manager.unlock_row(&txn, orders, rid(v)).unwrap());
    }
    assert!(lock_manager.unlock_table(&txn, orders).unwrap());
    txn_manager.commit(&txn);
    assert_eq!(txn.state(), TransactionState::Committed);
}

#[test]
fn test_read_uncommitted_write_path() {
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = LockManager::new(Arc::clone(&txn_manager));
    let table = TableOid(3);

    let txn = txn_manager.begin(IsolationLevel::ReadUncommitted);
    assert!(lock_manager
        .lock_table(&txn, LockMode::IntentionExclusive, table)
        .unwrap());
    assert!(lock_manager
        .lock_row(&txn, LockMode::Exclusive, table, rid(1))
        .unwrap());

    assert!(lock_manager.unlock_row(&txn, table, rid(1)).unwrap());
    // releasing X starts shrinking even at the weakest level
    assert_eq!(txn.state(), TransactionState::Shrinking);
}
