// LockDB Transaction Management Module

pub mod concurrency;

// Public exports
pub use concurrency::{
    AdvisoryError, AdvisoryLockGuard, AdvisoryLocks, DeadlockDetection, LockError, LockMode,
    LockTable, LockTableConfig, ReadMode, TransactionError, TransactionHandle, TransactionManager,
    TransactionManagerConfig, TransactionState, WaitPolicy,
};
