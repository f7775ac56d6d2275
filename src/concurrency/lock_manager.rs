//! Hierarchical two-phase locking over tables and rows.
//!
//! Each resource (one table oid or one row id) owns a FIFO request queue.
//! A request is granted when it is the first ungranted entry and compatible
//! with everything granted ahead of it, so a compatible prefix ends up
//! granted together. Upgrades jump ahead of ordinary waiters, one upgrader
//! per resource at a time. A background thread rebuilds the waits-for graph
//! at a fixed interval and aborts the youngest transaction on each cycle.

use crate::common::{RecordId, TableOid};
use crate::concurrency::error::{AbortReason, TransactionAbort};
use crate::transaction::{
    IsolationLevel, Transaction, TransactionId, TransactionManager, TransactionState,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    /// Multi-granularity compatibility (symmetric).
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// The upgrade lattice: IS -> {S, X, IX, SIX}, S -> {X, SIX},
    /// IX -> {X, SIX}, SIX -> {X}.
    pub fn can_upgrade_to(self, to: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, to),
            (IntentionShared, Shared)
                | (IntentionShared, Exclusive)
                | (IntentionShared, IntentionExclusive)
                | (IntentionShared, SharedIntentionExclusive)
                | (Shared, Exclusive)
                | (Shared, SharedIntentionExclusive)
                | (IntentionExclusive, Exclusive)
                | (IntentionExclusive, SharedIntentionExclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Shared => "S",
            Self::Exclusive => "X",
            Self::IntentionShared => "IS",
            Self::IntentionExclusive => "IX",
            Self::SharedIntentionExclusive => "SIX",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

#[derive(Default)]
struct QueueState {
    requests: Vec<LockRequest>,
    upgrading: Option<TransactionId>,
}

struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }
}

enum GrantOutcome {
    Granted,
    Aborted,
    Wait,
}

struct LockManagerInner {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
    /// Waits-for graph as of the last detection pass: waiter -> blockers.
    waits_for: Mutex<BTreeMap<TransactionId, Vec<TransactionId>>>,
    txn_manager: Arc<TransactionManager>,
    cycle_detection_enabled: AtomicBool,
    shutdown: AtomicBool,
    detection_interval: Duration,
}

pub struct LockManager {
    inner: Arc<LockManagerInner>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(txn_manager: Arc<TransactionManager>) -> Self {
        Self::with_interval(txn_manager, DEFAULT_DETECTION_INTERVAL)
    }

    pub fn with_interval(txn_manager: Arc<TransactionManager>, interval: Duration) -> Self {
        let inner = Arc::new(LockManagerInner {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(BTreeMap::new()),
            txn_manager,
            cycle_detection_enabled: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            detection_interval: interval,
        });

        let thread_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("cycle-detection".to_string())
            .spawn(move || Self::run_cycle_detection(&thread_inner))
            .expect("failed to spawn cycle detection thread");

        Self {
            inner,
            detector: Mutex::new(Some(handle)),
        }
    }

    pub fn set_cycle_detection(&self, enabled: bool) {
        self.inner
            .cycle_detection_enabled
            .store(enabled, Ordering::SeqCst);
    }

    /// Acquire (or upgrade to) `mode` on a table. Blocks until granted.
    /// Returns Ok(false) if the transaction was aborted while waiting.
    pub fn lock_table(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionAbort> {
        let queue = self.table_queue(oid);
        let mut state = queue.state.lock().unwrap();

        self.lock_pre_check(txn, mode, None)?;

        let held = txn.table_lock_mode(oid);
        let upgrading = match held {
            Some(held_mode) if held_mode == mode => return Ok(true),
            Some(held_mode) => {
                if !held_mode.can_upgrade_to(mode) {
                    return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
                }
                if state.upgrading.is_some() {
                    return Err(self.abort(txn, AbortReason::UpgradeConflict));
                }
                state.upgrading = Some(txn.id());
                // drop the held lock in place: no wakeup, no 2PL transition
                txn.remove_table_lock(oid, held_mode);
                state.requests.retain(|r| r.txn_id != txn.id());
                true
            }
            None => false,
        };

        Self::enqueue(&mut state, txn.id(), mode, upgrading);

        loop {
            match Self::try_grant(&mut state, txn, mode) {
                GrantOutcome::Granted => {
                    txn.insert_table_lock(oid, mode);
                    queue.cv.notify_all();
                    return Ok(true);
                }
                GrantOutcome::Aborted => {
                    queue.cv.notify_all();
                    return Ok(false);
                }
                GrantOutcome::Wait => state = queue.cv.wait(state).unwrap(),
            }
        }
    }

    /// Release a table lock, applying the isolation-dependent transition to
    /// SHRINKING. Aborts if no lock is held or row locks remain.
    pub fn unlock_table(&self, txn: &Transaction, oid: TableOid) -> Result<bool, TransactionAbort> {
        let queue = self.table_queue(oid);
        let mut state = queue.state.lock().unwrap();

        let Some(held) = txn.table_lock_mode(oid) else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if txn.has_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        Self::apply_shrink_transition(txn, held);
        txn.remove_table_lock(oid, held);
        state.requests.retain(|r| r.txn_id != txn.id());
        queue.cv.notify_all();
        Ok(true)
    }

    /// Acquire (or upgrade to) `mode` on a row. Only S and X are legal.
    pub fn lock_row(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> Result<bool, TransactionAbort> {
        let queue = self.row_queue(rid);
        let mut state = queue.state.lock().unwrap();

        self.lock_pre_check(txn, mode, Some(oid))?;

        let held = txn.row_lock_mode(oid, rid);
        let upgrading = match held {
            Some(held_mode) if held_mode == mode => return Ok(true),
            Some(held_mode) => {
                if !held_mode.can_upgrade_to(mode) {
                    return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
                }
                if state.upgrading.is_some() {
                    return Err(self.abort(txn, AbortReason::UpgradeConflict));
                }
                state.upgrading = Some(txn.id());
                txn.remove_row_lock(oid, rid, held_mode);
                state.requests.retain(|r| r.txn_id != txn.id());
                true
            }
            None => false,
        };

        Self::enqueue(&mut state, txn.id(), mode, upgrading);

        loop {
            match Self::try_grant(&mut state, txn, mode) {
                GrantOutcome::Granted => {
                    txn.insert_row_lock(oid, rid, mode);
                    queue.cv.notify_all();
                    return Ok(true);
                }
                GrantOutcome::Aborted => {
                    queue.cv.notify_all();
                    return Ok(false);
                }
                GrantOutcome::Wait => state = queue.cv.wait(state).unwrap(),
            }
        }
    }

    pub fn unlock_row(
        &self,
        txn: &Transaction,
        oid: TableOid,
        rid: RecordId,
    ) -> Result<bool, TransactionAbort> {
        let queue = self.row_queue(rid);
        let mut state = queue.state.lock().unwrap();

        let Some(held) = txn.row_lock_mode(oid, rid) else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        Self::apply_shrink_transition(txn, held);
        txn.remove_row_lock(oid, rid, held);
        state.requests.retain(|r| r.txn_id != txn.id());
        queue.cv.notify_all();
        Ok(true)
    }

    /// Edges of the waits-for graph as of the last detection pass.
    pub fn get_edge_list(&self) -> Vec<(TransactionId, TransactionId)> {
        let graph = self.inner.waits_for.lock().unwrap();
        graph
            .iter()
            .flat_map(|(&waiter, blockers)| blockers.iter().map(move |&b| (waiter, b)))
            .collect()
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.inner.table_lock_map.lock().unwrap();
        Arc::clone(
            map.entry(oid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new())),
        )
    }

    fn row_queue(&self, rid: RecordId) -> Arc<LockRequestQueue> {
        let mut map = self.inner.row_lock_map.lock().unwrap();
        Arc::clone(
            map.entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new())),
        )
    }

    fn abort(&self, txn: &Transaction, reason: AbortReason) -> TransactionAbort {
        txn.set_state(TransactionState::Aborted);
        TransactionAbort::new(txn.id(), reason)
    }

    /// Admission rules: legal modes for rows, isolation-level restrictions,
    /// and the table lock a row lock must sit under.
    fn lock_pre_check(
        &self,
        txn: &Transaction,
        mode: LockMode,
        row_on_table: Option<TableOid>,
    ) -> Result<(), TransactionAbort> {
        use LockMode::*;

        if row_on_table.is_some() && !matches!(mode, Shared | Exclusive) {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }

        let state = txn.state();
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if state == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking
                    && matches!(mode, Exclusive | IntentionExclusive | SharedIntentionExclusive)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }

        if let Some(oid) = row_on_table {
            let table_mode = txn.table_lock_mode(oid);
            let suitable = if mode == Exclusive {
                matches!(
                    table_mode,
                    Some(Exclusive) | Some(IntentionExclusive) | Some(SharedIntentionExclusive)
                )
            } else {
                table_mode.is_some()
            };
            if !suitable {
                return Err(self.abort(txn, AbortReason::TableLockNotPresent));
            }
        }

        Ok(())
    }

    fn enqueue(state: &mut QueueState, txn_id: TransactionId, mode: LockMode, upgrading: bool) {
        let request = LockRequest {
            txn_id,
            mode,
            granted: false,
        };
        if upgrading {
            // upgrades go ahead of every still-ungranted request
            let pos = state
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(pos, request);
        } else {
            state.requests.push(request);
        }
    }

    /// Grant check run under the queue latch, re-run on every wakeup: the
    /// waiter may have been aborted by the deadlock detector in between.
    fn try_grant(state: &mut MutexGuard<'_, QueueState>, txn: &Transaction, mode: LockMode) -> GrantOutcome {
        if txn.state() == TransactionState::Aborted {
            if state.upgrading == Some(txn.id()) {
                state.upgrading = None;
            }
            state.requests.retain(|r| r.txn_id != txn.id());
            return GrantOutcome::Aborted;
        }

        let Some(first_ungranted) = state.requests.iter().position(|r| !r.granted) else {
            return GrantOutcome::Wait;
        };
        if state.requests[first_ungranted].txn_id != txn.id() {
            return GrantOutcome::Wait;
        }

        let compatible = state
            .requests
            .iter()
            .filter(|r| r.granted)
            .all(|r| r.mode.is_compatible_with(mode));
        if !compatible {
            return GrantOutcome::Wait;
        }

        state.requests[first_ungranted].granted = true;
        if state.upgrading == Some(txn.id()) {
            state.upgrading = None;
        }
        GrantOutcome::Granted
    }

    /// Unlocking S or X may end the growing phase, depending on isolation.
    fn apply_shrink_transition(txn: &Transaction, released: LockMode) {
        if txn.state().is_finished() {
            return;
        }
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(released, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                released == LockMode::Exclusive
            }
        };
        if shrink {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn run_cycle_detection(inner: &LockManagerInner) {
        while !inner.shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(inner.detection_interval);
            if inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if inner.cycle_detection_enabled.load(Ordering::SeqCst) {
                Self::run_detection_pass(inner);
            }
        }
    }

    fn run_detection_pass(inner: &LockManagerInner) {
        // Build the graph from scratch, holding each map latch only while
        // scanning its queues (one queue latch at a time).
        let mut graph: BTreeMap<TransactionId, Vec<TransactionId>> = BTreeMap::new();
        {
            let table_map = inner.table_lock_map.lock().unwrap();
            for queue in table_map.values() {
                Self::collect_edges(queue, &mut graph);
            }
        }
        {
            let row_map = inner.row_lock_map.lock().unwrap();
            for queue in row_map.values() {
                Self::collect_edges(queue, &mut graph);
            }
        }
        for blockers in graph.values_mut() {
            blockers.sort_unstable();
            blockers.dedup();
        }

        let mut aborted_any = false;
        while let Some(victim) = Self::find_cycle_victim(&graph) {
            log::info!("deadlock detected, aborting youngest victim {}", victim);
            graph.remove(&victim);
            for blockers in graph.values_mut() {
                blockers.retain(|&t| t != victim);
            }
            if let Some(txn) = inner.txn_manager.get(victim) {
                txn.set_state(TransactionState::Aborted);
            }
            aborted_any = true;
        }

        *inner.waits_for.lock().unwrap() = graph;

        if aborted_any {
            Self::notify_all_queues(inner);
        }
    }

    fn collect_edges(
        queue: &LockRequestQueue,
        graph: &mut BTreeMap<TransactionId, Vec<TransactionId>>,
    ) {
        let state = queue.state.lock().unwrap();
        let granted: Vec<TransactionId> = state
            .requests
            .iter()
            .filter(|r| r.granted)
            .map(|r| r.txn_id)
            .collect();
        for request in state.requests.iter().filter(|r| !r.granted) {
            for &holder in &granted {
                if holder != request.txn_id {
                    graph.entry(request.txn_id).or_default().push(holder);
                }
            }
        }
    }

    /// Find any cycle by DFS with three-color marking (vertices visited in
    /// ascending id order, so the first cycle found is deterministic) and
    /// return the largest transaction id on it.
    fn find_cycle_victim(
        graph: &BTreeMap<TransactionId, Vec<TransactionId>>,
    ) -> Option<TransactionId> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        fn dfs(
            u: TransactionId,
            graph: &BTreeMap<TransactionId, Vec<TransactionId>>,
            colors: &mut HashMap<TransactionId, u8>,
            path: &mut Vec<TransactionId>,
        ) -> Option<TransactionId> {
            colors.insert(u, GRAY);
            path.push(u);

            if let Some(blockers) = graph.get(&u) {
                for &v in blockers {
                    match colors.get(&v).copied().unwrap_or(WHITE) {
                        GRAY => {
                            let start = path.iter().rposition(|&t| t == v).expect("on path");
                            return path[start..].iter().copied().max();
                        }
                        WHITE => {
                            if let Some(victim) = dfs(v, graph, colors, path) {
                                return Some(victim);
                            }
                        }
                        _ => {}
                    }
                }
            }

            colors.insert(u, BLACK);
            path.pop();
            None
        }

        let mut colors = HashMap::new();
        for &vertex in graph.keys() {
            if colors.get(&vertex).copied().unwrap_or(WHITE) == WHITE {
                let mut path = Vec::new();
                if let Some(victim) = dfs(vertex, graph, &mut colors, &mut path) {
                    return Some(victim);
                }
            }
        }
        None
    }

    fn notify_all_queues(inner: &LockManagerInner) {
        let queues: Vec<Arc<LockRequestQueue>> = {
            let table_map = inner.table_lock_map.lock().unwrap();
            table_map.values().cloned().collect()
        };
        for queue in queues {
            let _state = queue.state.lock().unwrap();
            queue.cv.notify_all();
        }

        let queues: Vec<Arc<LockRequestQueue>> = {
            let row_map = inner.row_lock_map.lock().unwrap();
            row_map.values().cloned().collect()
        };
        for queue in queues {
            let _state = queue.state.lock().unwrap();
            queue.cv.notify_all();
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
