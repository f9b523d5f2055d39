use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::types::{Resource, RowKey, TxnId, Version};
use crate::common::value::Value;
use crate::storage::versioned::VersionedStore;
use crate::transaction::concurrency::advisory::{AdvisoryLockGuard, AdvisoryLocks};
use crate::transaction::concurrency::deadlock::{DeadlockDetection, DeadlockMonitor};
use crate::transaction::concurrency::lock_mode::LockMode;
use crate::transaction::concurrency::lock_table::{LockError, LockTable, LockTableConfig, WaitPolicy};
use crate::transaction::concurrency::transaction::{
    Result, Transaction, TransactionError, TransactionState, WriteKind,
};

/// Configuration for the transaction manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionManagerConfig {
    pub lock_table: LockTableConfig,
}

/// How a read treats the row it reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Plain SELECT: last committed value, no locks
    #[default]
    Snapshot,
    ForKeyShare,
    ForShare,
    ForNoKeyUpdate,
    ForUpdate,
}

impl ReadMode {
    /// Row lock taken before reading, if any
    pub fn row_lock(self) -> Option<LockMode> {
        match self {
            ReadMode::Snapshot => None,
            ReadMode::ForKeyShare => Some(LockMode::ForKeyShare),
            ReadMode::ForShare => Some(LockMode::ForShare),
            ReadMode::ForNoKeyUpdate => Some(LockMode::ForNoKeyUpdate),
            ReadMode::ForUpdate => Some(LockMode::ForUpdate),
        }
    }
}

/// Caller-side reference to a transaction. Cheap to clone and safe to move
/// to another thread.
#[derive(Clone)]
pub struct TransactionHandle {
    id: TxnId,
    inner: Arc<Mutex<Transaction>>,
}

impl TransactionHandle {
    fn new(id: TxnId) -> Self {
        Self {
            id,
            inner: Arc::new(Mutex::new(Transaction::new(id))),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state()
    }

    pub fn held_locks(&self) -> Vec<(Resource, LockMode)> {
        self.inner.lock().held_locks()
    }

    pub fn write_keys(&self) -> Vec<(RowKey, WriteKind)> {
        self.inner.lock().write_keys()
    }

    pub fn read_keys(&self) -> Vec<RowKey> {
        self.inner.lock().read_keys()
    }

    pub fn advisory_lock_names(&self) -> Vec<String> {
        self.inner.lock().advisory_lock_names()
    }

    fn ensure_active(&self) -> Result<()> {
        self.inner.lock().ensure_active()
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Transaction manager - responsible for creating and tracking transactions
/// and for routing their reads and writes through the lock table
pub struct TransactionManager {
    /// Next transaction ID to assign
    next_txn_id: AtomicU32,

    lock_table: Arc<LockTable>,

    store: Arc<VersionedStore>,

    advisory: Arc<AdvisoryLocks>,

    /// Active transactions map (txn_id -> handle)
    active_transactions: Mutex<HashMap<TxnId, TransactionHandle>>,

    /// Present only with periodic deadlock detection
    monitor: Option<DeadlockMonitor>,
}

impl TransactionManager {
    /// Create a new transaction manager. Starts the deadlock monitor thread
    /// when periodic detection is configured.
    pub fn new(config: TransactionManagerConfig) -> Result<Self> {
        let lock_table = Arc::new(LockTable::new(config.lock_table.clone()));

        let monitor = match config.lock_table.deadlock_detection {
            DeadlockDetection::Immediate => None,
            DeadlockDetection::Periodic { interval_ms } => {
                let interval = Duration::from_millis(interval_ms.max(1));
                let monitor = DeadlockMonitor::spawn(Arc::clone(&lock_table), interval).map_err(|e| {
                    TransactionError::Internal(format!("failed to start deadlock monitor: {}", e))
                })?;
                Some(monitor)
            }
        };

        Ok(Self::with_lock_table(lock_table, monitor))
    }

    /// Manager with default configuration (immediate deadlock detection, no lock timeout)
    pub fn with_defaults() -> Self {
        Self::with_lock_table(Arc::new(LockTable::default()), None)
    }

    fn with_lock_table(lock_table: Arc<LockTable>, monitor: Option<DeadlockMonitor>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1), // Start from 1
            lock_table,
            store: Arc::new(VersionedStore::new()),
            advisory: Arc::new(AdvisoryLocks::new()),
            active_transactions: Mutex::new(HashMap::new()),
            monitor,
        }
    }

    /// Begin a new transaction
    pub fn begin(&self) -> TransactionHandle {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let handle = TransactionHandle::new(txn_id);

        self.active_transactions.lock().insert(txn_id, handle.clone());
        debug!("txn {} started", txn_id);
        handle
    }

    /// Read `key`. Snapshot reads see the last committed value (or the
    /// transaction's own pending write) without locking; locking reads first
    /// take ROW SHARE on the table and the matching row lock.
    pub fn read(&self, handle: &TransactionHandle, key: &RowKey, mode: ReadMode) -> Result<Option<Value>> {
        handle.ensure_active()?;

        if let Some(row_mode) = mode.row_lock() {
            self.acquire(handle, Resource::table(key.table.clone()), LockMode::RowShare, WaitPolicy::Block)?;
            self.acquire(handle, Resource::from(key), row_mode, WaitPolicy::Block)?;
        }

        let value = self.store.get_for(handle.id, key);
        handle.inner.lock().record_read(key);
        Ok(value)
    }

    /// Stage `value` for `key`, taking ROW EXCLUSIVE on the table and
    /// FOR UPDATE on the row first
    pub fn write(&self, handle: &TransactionHandle, key: RowKey, value: Value) -> Result<()> {
        self.acquire_write_locks(handle, &key)?;
        self.store.stage(handle.id, key.clone(), value)?;
        handle.inner.lock().record_write(&key, WriteKind::Put);
        Ok(())
    }

    /// Stage a delete of `key`, with the same locks as `write`
    pub fn delete(&self, handle: &TransactionHandle, key: RowKey) -> Result<()> {
        self.acquire_write_locks(handle, &key)?;
        self.store.stage_delete(handle.id, key.clone())?;
        handle.inner.lock().record_write(&key, WriteKind::Delete);
        Ok(())
    }

    /// Conditional write. Under the row's write lock, `predicate` sees the last
    /// committed value of `key`; `value` is staged only if it holds. A pending
    /// write of this transaction is not consulted, the same rule
    /// `update_if_version` applies to the committed version.
    ///
    /// `Ok(false)` is the optimistic-conflict outcome: another transaction
    /// changed the row so the check no longer holds. Nothing is staged and the
    /// transaction stays active, so the caller can re-read and retry the check
    /// or roll back. Failures to lock or stage are errors as usual.
    pub fn compare_and_swap<P>(
        &self,
        handle: &TransactionHandle,
        key: RowKey,
        predicate: P,
        value: Value,
    ) -> Result<bool>
    where
        P: FnOnce(Option<&Value>) -> bool,
    {
        self.acquire_write_locks(handle, &key)?;

        let current = self.store.get_committed(&key);
        handle.inner.lock().record_read(&key);
        if !predicate(current.as_ref()) {
            debug!("txn {} compare-and-swap on {} did not match", handle.id, key);
            return Ok(false);
        }

        self.store.stage(handle.id, key.clone(), value)?;
        handle.inner.lock().record_write(&key, WriteKind::Put);
        Ok(true)
    }

    /// Version-column optimistic locking: write only if the committed version
    /// of `key` is still `expected_version`. Like `compare_and_swap`, the check
    /// ignores this transaction's own pending write and `Ok(false)` is the
    /// optimistic-conflict outcome.
    pub fn update_if_version(
        &self,
        handle: &TransactionHandle,
        key: RowKey,
        expected_version: Version,
        value: Value,
    ) -> Result<bool> {
        self.acquire_write_locks(handle, &key)?;

        let version = self.store.committed_version(&key);
        handle.inner.lock().record_read(&key);
        if version != expected_version {
            debug!(
                "txn {} expected {} at version {}, found {}",
                handle.id, key, expected_version, version
            );
            return Ok(false);
        }

        self.store.stage(handle.id, key.clone(), value)?;
        handle.inner.lock().record_write(&key, WriteKind::Put);
        Ok(true)
    }

    /// LOCK TABLE `table` IN `mode` MODE
    pub fn lock_table(&self, handle: &TransactionHandle, table: &str, mode: LockMode) -> Result<()> {
        self.lock_table_with(handle, table, mode, WaitPolicy::Block)
    }

    pub fn lock_table_with(
        &self,
        handle: &TransactionHandle,
        table: &str,
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<()> {
        self.acquire(handle, Resource::table(table), mode, policy)
    }

    /// Lock a single row without reading it (SELECT ... FOR `mode` [NOWAIT])
    pub fn lock_row(
        &self,
        handle: &TransactionHandle,
        key: &RowKey,
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<()> {
        self.acquire(handle, Resource::table(key.table.clone()), LockMode::RowShare, policy)?;
        self.acquire(handle, Resource::from(key), mode, policy)
    }

    /// Take advisory lock `name` for the rest of the transaction.
    /// It is released by commit or rollback, never explicitly.
    pub fn advisory_xact_lock(
        &self,
        handle: &TransactionHandle,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        handle.ensure_active()?;
        let guard = self.advisory.acquire(name, timeout)?;

        let mut txn = handle.inner.lock();
        // Guard drops here if the transaction ended while we waited
        txn.ensure_active()?;
        txn.add_advisory_guard(guard);
        Ok(())
    }

    /// Session-level advisory lock, held until the guard is dropped
    pub fn acquire_advisory(&self, name: &str, timeout: Option<Duration>) -> Result<AdvisoryLockGuard> {
        Ok(self.advisory.acquire(name, timeout)?)
    }

    pub fn acquire_advisory_shared(&self, name: &str, timeout: Option<Duration>) -> Result<AdvisoryLockGuard> {
        Ok(self.advisory.acquire_shared(name, timeout)?)
    }

    /// Commit: publish every staged write in one step, then release all locks
    pub fn commit(&self, handle: &TransactionHandle) -> Result<()> {
        let mut txn = handle.inner.lock();
        txn.mark_committing()?;

        let published = self.store.publish(handle.id);
        let released = self.lock_table.release_all(handle.id);
        txn.mark_committed()?;
        let elapsed = txn.elapsed();
        drop(txn);

        self.active_transactions.lock().remove(&handle.id);
        info!(
            "txn {} committed: {} writes published, {} locks released, {:?}",
            handle.id, published, released, elapsed
        );
        Ok(())
    }

    /// Roll back: discard staged writes and release all locks. Rolling back a
    /// transaction that is already aborted does nothing.
    pub fn rollback(&self, handle: &TransactionHandle) -> Result<()> {
        let mut txn = handle.inner.lock();
        match txn.state() {
            TransactionState::Aborted => return Ok(()),
            TransactionState::Committed => {
                return Err(TransactionError::InvalidState {
                    txn_id: handle.id,
                    state: TransactionState::Committed,
                });
            }
            TransactionState::Active | TransactionState::Committing => {}
        }

        let discarded = self.store.discard(handle.id);
        let released = self.lock_table.release_all(handle.id);
        txn.mark_aborted()?;
        drop(txn);

        self.active_transactions.lock().remove(&handle.id);
        info!(
            "txn {} rolled back: {} writes discarded, {} locks released",
            handle.id, discarded, released
        );
        Ok(())
    }

    /// Last committed value of `key`
    pub fn committed_value(&self, key: &RowKey) -> Option<Value> {
        self.store.get_committed(key)
    }

    pub fn committed_version(&self, key: &RowKey) -> Version {
        self.store.committed_version(key)
    }

    /// Every committed value, ordered by key
    pub fn snapshot(&self) -> BTreeMap<RowKey, Value> {
        self.store.snapshot()
    }

    /// Check if a transaction exists
    pub fn transaction_exists(&self, txn_id: TxnId) -> bool {
        self.active_transactions.lock().contains_key(&txn_id)
    }

    /// Get all active transaction IDs, sorted
    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.active_transactions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn lock_manager(&self) -> &Arc<LockTable> {
        &self.lock_table
    }

    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }

    pub fn advisory_locks(&self) -> &Arc<AdvisoryLocks> {
        &self.advisory
    }

    pub fn has_deadlock_monitor(&self) -> bool {
        self.monitor.is_some()
    }

    fn acquire_write_locks(&self, handle: &TransactionHandle, key: &RowKey) -> Result<()> {
        self.acquire(
            handle,
            Resource::table(key.table.clone()),
            LockMode::RowExclusive,
            WaitPolicy::Block,
        )?;
        self.acquire(handle, Resource::from(key), LockMode::ForUpdate, WaitPolicy::Block)
    }

    /// Acquire through the lock table and record the grant on the transaction.
    /// A deadlock or timeout rolls the transaction back before the error is returned.
    fn acquire(
        &self,
        handle: &TransactionHandle,
        resource: Resource,
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<()> {
        handle.ensure_active()?;

        // The transaction mutex is not held while blocked in the lock table
        match self.lock_table.acquire_with(handle.id, &resource, mode, policy) {
            Ok(granted) => {
                let mut txn = handle.inner.lock();
                if let Err(err) = txn.ensure_active() {
                    // Rolled back from another thread while we were waiting
                    drop(txn);
                    self.lock_table.release_all(handle.id);
                    return Err(err);
                }
                // A covering mode already held means nothing new was granted
                if granted {
                    txn.record_lock(resource, mode);
                }
                Ok(())
            }
            Err(err @ (LockError::Deadlock { .. } | LockError::Timeout { .. })) => {
                warn!("txn {} aborted: {}", handle.id, err);
                self.rollback(handle)?;
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}
