// LockDB concurrency-control kernel

pub mod common;
pub mod scenario;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::{Resource, RowKey, TxnId, Value};
pub use storage::VersionedStore;
pub use transaction::{
    AdvisoryError, AdvisoryLockGuard, DeadlockDetection, LockError, LockMode, LockTable,
    LockTableConfig, ReadMode, TransactionError, TransactionHandle, TransactionManager,
    TransactionManagerConfig, TransactionState, WaitPolicy,
};
pub use scenario::{Scenario, ScenarioReport};
