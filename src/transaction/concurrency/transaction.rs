// LockDB Transaction implementation
// Per-transaction bookkeeping: state, read/write sets and held locks

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};
use linked_hash_map::LinkedHashMap;
use thiserror::Error;

use crate::common::types::{Resource, RowKey, TxnId};
use crate::storage::versioned::StoreError;
use crate::transaction::concurrency::advisory::{AdvisoryError, AdvisoryLockGuard};
use crate::transaction::concurrency::lock_mode::LockMode;
use crate::transaction::concurrency::lock_table::LockError;

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// Kind of change staged for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Put,
    Delete,
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction {txn_id} lost a write conflict on {key}")]
    Conflict { txn_id: TxnId, key: RowKey },

    #[error("Transaction {txn_id} was aborted to break a deadlock")]
    Deadlock { txn_id: TxnId },

    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("Transaction {txn_id} could not obtain {mode} on {resource} without waiting")]
    LockNotAvailable {
        txn_id: TxnId,
        resource: Resource,
        mode: LockMode,
    },

    #[error("Transaction {txn_id} is {state:?}")]
    InvalidState {
        txn_id: TxnId,
        state: TransactionState,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal transaction error: {0}")]
    Internal(String),
}

impl From<LockError> for TransactionError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Deadlock { txn_id, .. } => TransactionError::Deadlock { txn_id },
            LockError::Timeout {
                resource,
                mode,
                waited,
                ..
            } => TransactionError::Timeout {
                what: format!("{} on {}", mode, resource),
                waited,
            },
            LockError::NotAvailable {
                txn_id,
                resource,
                mode,
            } => TransactionError::LockNotAvailable {
                txn_id,
                resource,
                mode,
            },
            err @ LockError::InvalidMode { .. } => TransactionError::InvalidRequest(err.to_string()),
        }
    }
}

impl From<AdvisoryError> for TransactionError {
    fn from(err: AdvisoryError) -> Self {
        match err {
            AdvisoryError::Timeout { name, waited } => TransactionError::Timeout {
                what: format!("advisory lock '{}'", name),
                waited,
            },
        }
    }
}

impl From<StoreError> for TransactionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { txn_id, key, .. } => TransactionError::Conflict { txn_id, key },
        }
    }
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Transaction - bookkeeping for one unit of work
#[derive(Debug)]
pub struct Transaction {
    /// Transaction ID
    id: TxnId,

    /// Current transaction state
    state: TransactionState,

    started_at: Instant,

    /// Keys read, with or without a lock
    read_set: HashSet<RowKey>,

    /// Keys written, in first-write order
    write_set: LinkedHashMap<RowKey, WriteKind>,

    /// Every (resource, mode) granted so far
    held_locks: BTreeSet<(Resource, LockMode)>,

    /// Transaction-scoped advisory locks, dropped at commit or rollback
    advisory_guards: Vec<AdvisoryLockGuard>,
}

impl Transaction {
    /// Create a new active transaction with the given ID
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            started_at: Instant::now(),
            read_set: HashSet::new(),
            write_set: LinkedHashMap::new(),
            held_locks: BTreeSet::new(),
            advisory_guards: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Fail with `InvalidState` unless the transaction is still active
    pub fn ensure_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(TransactionError::InvalidState {
                txn_id: self.id,
                state: self.state,
            });
        }
        Ok(())
    }

    pub fn record_read(&mut self, key: &RowKey) {
        self.read_set.insert(key.clone());
    }

    /// Remember a staged write. A later write to the same key keeps the
    /// key's original position.
    pub fn record_write(&mut self, key: &RowKey, kind: WriteKind) {
        if let Some(existing) = self.write_set.get_mut(key) {
            *existing = kind;
        } else {
            self.write_set.insert(key.clone(), kind);
        }
    }

    pub fn record_lock(&mut self, resource: Resource, mode: LockMode) {
        self.held_locks.insert((resource, mode));
    }

    pub fn add_advisory_guard(&mut self, guard: AdvisoryLockGuard) {
        self.advisory_guards.push(guard);
    }

    pub fn has_read(&self, key: &RowKey) -> bool {
        self.read_set.contains(key)
    }

    pub fn read_keys(&self) -> Vec<RowKey> {
        let mut keys: Vec<RowKey> = self.read_set.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Written keys in first-write order
    pub fn write_keys(&self) -> Vec<(RowKey, WriteKind)> {
        self.write_set.iter().map(|(k, kind)| (k.clone(), *kind)).collect()
    }

    pub fn held_locks(&self) -> Vec<(Resource, LockMode)> {
        self.held_locks.iter().cloned().collect()
    }

    pub fn advisory_lock_names(&self) -> Vec<String> {
        self.advisory_guards.iter().map(|g| g.name().to_string()).collect()
    }

    pub fn mark_committing(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = TransactionState::Committing;
        Ok(())
    }

    /// Final step of commit, after writes are published and locks released
    pub fn mark_committed(&mut self) -> Result<()> {
        if self.state != TransactionState::Committing {
            return Err(TransactionError::InvalidState {
                txn_id: self.id,
                state: self.state,
            });
        }
        self.state = TransactionState::Committed;
        self.finish();
        Ok(())
    }

    /// Move to `Aborted` from any non-terminal state
    pub fn mark_aborted(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(TransactionError::InvalidState {
                txn_id: self.id,
                state: self.state,
            });
        }
        self.state = TransactionState::Aborted;
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        self.held_locks.clear();
        // Dropping the guards releases the advisory locks
        self.advisory_guards.clear();
    }
}
