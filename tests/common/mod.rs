#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use anyhow::{bail, Result};

use lockdb::common::{RowKey, TxnId};
use lockdb::transaction::concurrency::{
    DeadlockDetection, LockTableConfig, TransactionManager, TransactionManagerConfig,
};

// Manager with the default configuration (immediate detection, no lock timeout)
pub fn create_manager() -> Arc<TransactionManager> {
    Arc::new(TransactionManager::with_defaults())
}

// Manager sweeping for deadlocks every `interval_ms` instead of on every wait
pub fn create_periodic_manager(interval_ms: u64) -> Result<Arc<TransactionManager>> {
    let config = TransactionManagerConfig {
        lock_table: LockTableConfig {
            lock_timeout_ms: None,
            deadlock_detection: DeadlockDetection::Periodic { interval_ms },
        },
    };
    Ok(Arc::new(TransactionManager::new(config)?))
}

pub fn create_manager_with_timeout(lock_timeout_ms: u64) -> Result<Arc<TransactionManager>> {
    let config = TransactionManagerConfig {
        lock_table: LockTableConfig {
            lock_timeout_ms: Some(lock_timeout_ms),
            ..Default::default()
        },
    };
    Ok(Arc::new(TransactionManager::new(config)?))
}

pub fn account(name: &str) -> RowKey {
    RowKey::new("accounts", name)
}

// Block until `txn_id` is queued in the lock table
pub fn wait_until_waiting(tm: &TransactionManager, txn_id: TxnId) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !tm.lock_manager().is_waiting(txn_id) {
        if Instant::now() >= deadline {
            bail!("txn {} never started waiting", txn_id);
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}
