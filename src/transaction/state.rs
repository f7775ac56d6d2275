//! Transaction lifecycle states and isolation levels.

/// Two-phase locking state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The transaction may still acquire locks.
    Growing,
    /// The transaction has released a lock and may only release from now on.
    Shrinking,
    /// The transaction has committed.
    Committed,
    /// The transaction has been rolled back (by itself or by the deadlock
    /// detector).
    Aborted,
}

impl TransactionState {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// True once the transaction can no longer take locks at all.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Growing => write!(f, "Growing"),
            Self::Shrinking => write!(f, "Shrinking"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadUncommitted => write!(f, "ReadUncommitted"),
            Self::ReadCommitted => write!(f, "ReadCommitted"),
            Self::RepeatableRead => write!(f, "RepeatableRead"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!TransactionState::Growing.is_finished());
        assert!(!TransactionState::Shrinking.is_finished());
        assert!(TransactionState::Committed.is_finished());
        assert!(TransactionState::Aborted.is_finished());
        assert!(TransactionState::Aborted.is_aborted());
        assert!(!TransactionState::Committed.is_aborted());
    }
}
