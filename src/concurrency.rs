pub mod error;
pub mod lock_manager;

pub use error::{AbortReason, TransactionAbort};
pub use lock_manager::{LockManager, LockMode};
