//! Transaction creation and registry.

use super::id::{TransactionId, TransactionIdGenerator};
use super::state::{IsolationLevel, TransactionState};
use super::Transaction;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Hands out transactions and keeps them addressable by id so the deadlock
/// detector can abort a victim it only knows by number.
///
/// Committing or aborting only flips the transaction's state; releasing the
/// locks it still holds stays the caller's responsibility, mirroring how the
/// execution layer unwinds on its normal exit paths.
pub struct TransactionManager {
    id_generator: TransactionIdGenerator,
    transactions: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            id_generator: TransactionIdGenerator::new(),
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.id_generator.next();
        let txn = Arc::new(Transaction::new(id, isolation_level));
        self.transactions.lock().unwrap().insert(id, Arc::clone(&txn));
        txn
    }

    pub fn get(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.transactions.lock().unwrap().get(&id).cloned()
    }

    pub fn commit(&self, txn: &Transaction) {
        txn.set_state(TransactionState::Committed);
    }

    pub fn abort(&self, txn: &Transaction) {
        txn.set_state(TransactionState::Aborted);
    }

    /// Forget a finished transaction.
    pub fn remove(&self, id: TransactionId) {
        self.transactions.lock().unwrap().remove(&id);
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_registers() {
        let manager = TransactionManager::new();
        let txn = manager.begin(IsolationLevel::ReadCommitted);

        let found = manager.get(txn.id()).expect("registered");
        assert_eq!(found.id(), txn.id());
        assert_eq!(found.isolation_level(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_commit_and_abort_set_state() {
        let manager = TransactionManager::new();

        let t1 = manager.begin(IsolationLevel::RepeatableRead);
        manager.commit(&t1);
        assert_eq!(t1.state(), TransactionState::Committed);

        let t2 = manager.begin(IsolationLevel::RepeatableRead);
        manager.abort(&t2);
        assert_eq!(t2.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_remove() {
        let manager = TransactionManager::new();
        let txn = manager.begin(IsolationLevel::ReadCommitted);
        manager.remove(txn.id());
        assert!(manager.get(txn.id()).is_none());
    }

    #[test]
    fn test_ids_increase() {
        let manager = TransactionManager::new();
        let a = manager.begin(IsolationLevel::ReadCommitted);
        let b = manager.begin(IsolationLevel::ReadCommitted);
        assert!(a.id() < b.id());
    }
}
