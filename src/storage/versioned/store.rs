use std::collections::{BTreeMap, HashMap};
use log::trace;
use parking_lot::RwLock;

use crate::common::types::{RowKey, TxnId, Version};
use crate::common::value::Value;
use super::error::{Result, StoreError};

/// An uncommitted write owned by a single transaction.
/// `value == None` stages a delete.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub txn_id: TxnId,
    pub value: Option<Value>,
}

/// Committed state of one key plus at most one in-flight write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionedEntry {
    /// Last committed value, `None` if the key was never written or was deleted
    pub committed: Option<Value>,

    /// Commit number that produced `committed`
    pub version: Version,

    /// Staged but not yet published write
    pub pending: Option<PendingWrite>,
}

impl VersionedEntry {
    fn is_vacant(&self) -> bool {
        self.committed.is_none() && self.pending.is_none() && self.version == 0
    }
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<RowKey, VersionedEntry>,

    /// Keys staged by each transaction, in staging order
    staged: HashMap<TxnId, Vec<RowKey>>,

    /// Number of publishes so far; doubles as the version stamped on published keys
    commit_counter: Version,
}

/// Key/value store holding committed values and per-transaction pending writes.
///
/// Publishing a transaction is the only way pending values become visible, and
/// it happens under a single write lock so readers observe either none or all
/// of a transaction's writes.
#[derive(Debug, Default)]
pub struct VersionedStore {
    state: RwLock<StoreState>,
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last committed value for `key`
    pub fn get_committed(&self, key: &RowKey) -> Option<Value> {
        self.state
            .read()
            .entries
            .get(key)
            .and_then(|entry| entry.committed.clone())
    }

    /// Commit version of `key`, 0 if it was never committed
    pub fn committed_version(&self, key: &RowKey) -> Version {
        self.state
            .read()
            .entries
            .get(key)
            .map(|entry| entry.version)
            .unwrap_or(0)
    }

    /// The value `txn_id` should see: its own pending write if it has one,
    /// otherwise the committed value
    pub fn get_for(&self, txn_id: TxnId, key: &RowKey) -> Option<Value> {
        let state = self.state.read();
        let entry = state.entries.get(key)?;
        match &entry.pending {
            Some(pending) if pending.txn_id == txn_id => pending.value.clone(),
            _ => entry.committed.clone(),
        }
    }

    pub fn entry(&self, key: &RowKey) -> Option<VersionedEntry> {
        self.state.read().entries.get(key).cloned()
    }

    /// Transaction currently holding a pending write on `key`
    pub fn pending_owner(&self, key: &RowKey) -> Option<TxnId> {
        self.state
            .read()
            .entries
            .get(key)
            .and_then(|entry| entry.pending.as_ref())
            .map(|pending| pending.txn_id)
    }

    /// Stage `value` as `txn_id`'s pending write for `key`
    pub fn stage(&self, txn_id: TxnId, key: RowKey, value: Value) -> Result<()> {
        self.stage_write(txn_id, key, Some(value))
    }

    /// Stage a delete of `key`
    pub fn stage_delete(&self, txn_id: TxnId, key: RowKey) -> Result<()> {
        self.stage_write(txn_id, key, None)
    }

    fn stage_write(&self, txn_id: TxnId, key: RowKey, value: Option<Value>) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let entry = state.entries.entry(key.clone()).or_default();

        match &mut entry.pending {
            Some(pending) if pending.txn_id != txn_id => {
                return Err(StoreError::Conflict {
                    txn_id,
                    key,
                    owner: pending.txn_id,
                });
            }
            Some(pending) => {
                // Overwriting our own pending value
                pending.value = value;
            }
            None => {
                entry.pending = Some(PendingWrite { txn_id, value });
                state.staged.entry(txn_id).or_default().push(key.clone());
            }
        }

        trace!("txn {} staged write to {}", txn_id, key);
        Ok(())
    }

    /// Make every pending write of `txn_id` the committed value, in one step.
    /// Returns the number of keys published.
    pub fn publish(&self, txn_id: TxnId) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(keys) = state.staged.remove(&txn_id) else {
            return 0;
        };

        state.commit_counter += 1;
        let version = state.commit_counter;
        let mut published = 0;

        for key in keys {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            match entry.pending.take() {
                Some(pending) if pending.txn_id == txn_id => {
                    entry.committed = pending.value;
                    entry.version = version;
                    published += 1;
                }
                other => entry.pending = other,
            }
        }

        trace!("txn {} published {} keys at version {}", txn_id, published, version);
        published
    }

    /// Drop every pending write of `txn_id`. Returns the number discarded.
    pub fn discard(&self, txn_id: TxnId) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(keys) = state.staged.remove(&txn_id) else {
            return 0;
        };

        let mut discarded = 0;
        for key in keys {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            if entry.pending.as_ref().is_some_and(|p| p.txn_id == txn_id) {
                entry.pending = None;
                discarded += 1;
            }
            if entry.is_vacant() {
                state.entries.remove(&key);
            }
        }

        discarded
    }

    /// Keys `txn_id` has staged, in staging order
    pub fn staged_keys(&self, txn_id: TxnId) -> Vec<RowKey> {
        self.state
            .read()
            .staged
            .get(&txn_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Ordered copy of every committed, non-deleted value
    pub fn snapshot(&self) -> BTreeMap<RowKey, Value> {
        self.state
            .read()
            .entries
            .iter()
            .filter_map(|(key, entry)| entry.committed.clone().map(|v| (key.clone(), v)))
            .collect()
    }

    /// Number of keys with a committed value
    pub fn len(&self) -> usize {
        self.state
            .read()
            .entries
            .values()
            .filter(|entry| entry.committed.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
