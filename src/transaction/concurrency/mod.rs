// Transaction concurrency module exports

pub mod advisory;
pub mod deadlock;
pub mod lock_mode;
pub mod lock_table;
pub mod transaction;
pub mod transaction_manager;

// Public exports
pub use advisory::{AdvisoryError, AdvisoryLockGuard, AdvisoryLocks, AdvisoryMode};
pub use deadlock::{DeadlockDetection, DeadlockMonitor, WaitForGraph};
pub use lock_mode::{Granularity, LockMode, ParseLockModeError};
pub use lock_table::{LockError, LockRequest, LockTable, LockTableConfig, WaitPolicy};
pub use transaction::{Transaction, TransactionError, TransactionState, WriteKind};
pub use transaction_manager::{ReadMode, TransactionHandle, TransactionManager, TransactionManagerConfig};
