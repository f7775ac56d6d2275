//! Transaction-visible abort errors raised by the lock manager.

use crate::transaction::TransactionId;
use thiserror::Error;

/// Why a lock or unlock call aborted its transaction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested while shrinking")]
    LockOnShrinking,

    #[error("shared lock requested under read-uncommitted")]
    LockSharedOnReadUncommitted,

    #[error("intention lock requested on a row")]
    AttemptedIntentionLockOnRow,

    #[error("unlock requested but no lock held")]
    AttemptedUnlockButNoLockHeld,

    #[error("table unlocked before its row locks")]
    TableUnlockedBeforeUnlockingRows,

    #[error("row lock requested without a suitable table lock")]
    TableLockNotPresent,

    #[error("incompatible lock upgrade")]
    IncompatibleUpgrade,

    #[error("another transaction is already upgrading")]
    UpgradeConflict,
}

/// Raised after the offending transaction has been moved to the ABORTED
/// state; the caller is expected to unwind.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{txn_id} aborted: {reason}")]
pub struct TransactionAbort {
    pub txn_id: TransactionId,
    pub reason: AbortReason,
}

impl TransactionAbort {
    pub fn new(txn_id: TransactionId, reason: AbortReason) -> Self {
        Self { txn_id, reason }
    }
}
