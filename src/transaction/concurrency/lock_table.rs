// Lock table
//
// Tracks granted and queued lock requests per resource. All state lives behind
// one mutex; blocked callers sleep on a condition variable with the mutex
// released and are woken after every grant pass, victim selection or release.
// Queued requests are granted by the thread that frees the resource, in FIFO
// order, so a woken waiter only has to look at its own status.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::types::{RequestSeq, Resource, TxnId};
use crate::transaction::concurrency::deadlock::{self, DeadlockDetection, WaitForGraph};
use crate::transaction::concurrency::lock_mode::{Granularity, LockMode};

/// Errors returned by lock acquisition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Transaction {txn_id} was chosen as deadlock victim while waiting for {mode} on {resource}")]
    Deadlock {
        txn_id: TxnId,
        resource: Resource,
        mode: LockMode,
    },

    #[error("Transaction {txn_id} timed out after {waited:?} waiting for {mode} on {resource}")]
    Timeout {
        txn_id: TxnId,
        resource: Resource,
        mode: LockMode,
        waited: Duration,
    },

    #[error("Could not obtain {mode} on {resource} for transaction {txn_id} without waiting")]
    NotAvailable {
        txn_id: TxnId,
        resource: Resource,
        mode: LockMode,
    },

    #[error("{mode} cannot be requested on {resource}")]
    InvalidMode { resource: Resource, mode: LockMode },
}

/// Result type for lock table operations
pub type Result<T> = std::result::Result<T, LockError>;

/// Configuration for the lock table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockTableConfig {
    /// How long a blocked request may wait before failing with a timeout.
    /// `None` waits until granted or chosen as a deadlock victim.
    pub lock_timeout_ms: Option<u64>,

    /// When to look for deadlocks
    pub deadlock_detection: DeadlockDetection,
}

impl LockTableConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

/// What to do when a request cannot be granted immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Wait, bounded by the configured lock timeout
    #[default]
    Block,

    /// Fail with `NotAvailable` instead of queueing
    NoWait,

    /// Wait at most this long, overriding the configured timeout
    Timeout(Duration),
}

/// A granted or queued lock request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub txn_id: TxnId,
    pub resource: Resource,
    pub mode: LockMode,
    pub granted: bool,

    /// Arrival order in the lock table
    pub seq: RequestSeq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitStatus {
    Waiting,
    Granted,
    Victim,
}

#[derive(Debug)]
struct PendingWait {
    resource: Resource,
    seq: RequestSeq,
    status: WaitStatus,
}

/// Granted and queued requests on one resource
#[derive(Debug, Default)]
pub(crate) struct ResourceEntry {
    pub(crate) granted: Vec<LockRequest>,
    pub(crate) waiting: VecDeque<LockRequest>,
}

impl ResourceEntry {
    pub(crate) fn holds(&self, txn_id: TxnId) -> bool {
        self.granted.iter().any(|r| r.txn_id == txn_id)
    }

    fn conflicts_with_holders(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.granted
            .iter()
            .any(|r| r.txn_id != txn_id && r.mode.conflicts_with(mode))
    }

    fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockTableState {
    resources: HashMap<Resource, ResourceEntry>,

    /// Resources each transaction holds at least one mode on
    held: HashMap<TxnId, HashSet<Resource>>,

    /// The single request each blocked transaction is waiting on
    pending: HashMap<TxnId, PendingWait>,

    next_seq: RequestSeq,
}

impl LockTableState {
    fn next_seq(&mut self) -> RequestSeq {
        self.next_seq += 1;
        self.next_seq
    }

    /// Grant queued requests on `resource` in arrival order. A request is granted
    /// when it is compatible with every holder and, unless it is an upgrade by a
    /// current holder, with every request still queued ahead of it.
    fn grant_waiters(&mut self, resource: &Resource) -> usize {
        let Some(entry) = self.resources.get_mut(resource) else {
            return 0;
        };

        let mut queue = std::mem::take(&mut entry.waiting);
        let mut still_waiting: VecDeque<LockRequest> = VecDeque::with_capacity(queue.len());
        let mut granted = 0;

        while let Some(mut request) = queue.pop_front() {
            let upgrading = entry.holds(request.txn_id);
            let blocked = entry.conflicts_with_holders(request.txn_id, request.mode)
                || (!upgrading
                    && still_waiting
                        .iter()
                        .any(|w| w.txn_id != request.txn_id && w.mode.conflicts_with(request.mode)));

            if blocked {
                still_waiting.push_back(request);
                continue;
            }

            debug!(
                "granting queued {} on {} to txn {}",
                request.mode, resource, request.txn_id
            );
            request.granted = true;
            self.held
                .entry(request.txn_id)
                .or_default()
                .insert(resource.clone());
            if let Some(wait) = self.pending.get_mut(&request.txn_id) {
                wait.status = WaitStatus::Granted;
            }
            entry.granted.push(request);
            granted += 1;
        }

        entry.waiting = still_waiting;
        if entry.is_empty() {
            self.resources.remove(resource);
        }
        granted
    }

    /// Take `txn_id`'s request out of its queue and re-run the grant pass,
    /// since requests behind it may now be grantable
    fn withdraw_request(&mut self, txn_id: TxnId, resource: &Resource) {
        if let Some(entry) = self.resources.get_mut(resource) {
            entry.waiting.retain(|r| r.txn_id != txn_id);
        }
        self.grant_waiters(resource);
    }

    /// Break every cycle in the wait-for graph, one victim per cycle
    fn resolve_deadlocks(&mut self) -> Vec<TxnId> {
        let mut victims = Vec::new();

        loop {
            let graph = WaitForGraph::build(self.resources.values());
            let Some(cycle) = graph.find_cycle() else {
                break;
            };
            let Some(victim) =
                deadlock::choose_victim(&cycle, |txn_id| self.pending.get(&txn_id).map(|w| w.seq))
            else {
                break;
            };
            let Some(wait) = self.pending.get_mut(&victim) else {
                break;
            };

            warn!("deadlock detected among transactions {:?}; aborting txn {}", cycle, victim);
            wait.status = WaitStatus::Victim;
            let resource = wait.resource.clone();
            self.withdraw_request(victim, &resource);
            victims.push(victim);
        }

        trace!("deadlock pass finished with {} victims", victims.len());
        victims
    }

    fn release_all(&mut self, txn_id: TxnId) -> usize {
        let mut touched: Vec<Resource> = self
            .held
            .remove(&txn_id)
            .map(|resources| resources.into_iter().collect())
            .unwrap_or_default();

        // A request left in a queue (the owner gave up) goes too
        if let Some(wait) = self.pending.remove(&txn_id) {
            if let Some(entry) = self.resources.get_mut(&wait.resource) {
                entry.waiting.retain(|r| r.txn_id != txn_id);
            }
            touched.push(wait.resource);
        }

        let mut released = 0;
        for resource in &touched {
            if let Some(entry) = self.resources.get_mut(resource) {
                let before = entry.granted.len();
                entry.granted.retain(|r| r.txn_id != txn_id);
                released += before - entry.granted.len();
            }
        }

        // Grant in a stable order so wake-ups are reproducible
        touched.sort();
        touched.dedup();
        for resource in &touched {
            self.grant_waiters(resource);
        }

        released
    }
}

/// Lock table shared by every transaction of a transaction manager
#[derive(Debug, Default)]
pub struct LockTable {
    config: LockTableConfig,
    state: Mutex<LockTableState>,
    wakeup: Condvar,
}

impl LockTable {
    pub fn new(config: LockTableConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LockTableState::default()),
            wakeup: Condvar::new(),
        }
    }

    pub fn config(&self) -> &LockTableConfig {
        &self.config
    }

    /// Acquire `mode` on `resource` for `txn_id`, waiting as long as the
    /// configured timeout allows
    pub fn acquire(&self, txn_id: TxnId, resource: &Resource, mode: LockMode) -> Result<bool> {
        self.acquire_with(txn_id, resource, mode, WaitPolicy::Block)
    }

    /// Acquire `mode` on `resource`, treating a busy resource as `policy` says.
    ///
    /// Returns `true` when a new grant was recorded and `false` when a mode the
    /// transaction already holds covers `mode`. A transaction that holds some
    /// mode on the resource upgrades in place and only has to be compatible
    /// with the other holders; everyone else also queues behind conflicting
    /// requests that arrived first.
    pub fn acquire_with(
        &self,
        txn_id: TxnId,
        resource: &Resource,
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<bool> {
        let expected = if resource.is_table() { Granularity::Table } else { Granularity::Row };
        if mode.granularity() != expected {
            return Err(LockError::InvalidMode {
                resource: resource.clone(),
                mode,
            });
        }

        let mut state = self.state.lock();
        let seq = state.next_seq();
        let entry = state.resources.entry(resource.clone()).or_default();

        if entry
            .granted
            .iter()
            .any(|r| r.txn_id == txn_id && r.mode.covers(mode))
        {
            return Ok(false);
        }

        let upgrading = entry.holds(txn_id);
        let blocked = entry.conflicts_with_holders(txn_id, mode)
            || (!upgrading
                && entry
                    .waiting
                    .iter()
                    .any(|w| w.txn_id != txn_id && w.mode.conflicts_with(mode)));

        let request = LockRequest {
            txn_id,
            resource: resource.clone(),
            mode,
            granted: !blocked,
            seq,
        };

        if !blocked {
            entry.granted.push(request);
            state.held.entry(txn_id).or_default().insert(resource.clone());
            debug!("txn {} acquired {} on {}", txn_id, mode, resource);
            return Ok(true);
        }

        let timeout = match policy {
            WaitPolicy::NoWait => {
                if entry.is_empty() {
                    state.resources.remove(resource);
                }
                return Err(LockError::NotAvailable {
                    txn_id,
                    resource: resource.clone(),
                    mode,
                });
            }
            WaitPolicy::Block => self.config.lock_timeout(),
            WaitPolicy::Timeout(timeout) => Some(timeout),
        };

        entry.waiting.push_back(request);
        state.pending.insert(
            txn_id,
            PendingWait {
                resource: resource.clone(),
                seq,
                status: WaitStatus::Waiting,
            },
        );
        debug!("txn {} waiting for {} on {}", txn_id, mode, resource);

        if self.config.deadlock_detection == DeadlockDetection::Immediate {
            let victims = state.resolve_deadlocks();
            if !victims.is_empty() {
                self.wakeup.notify_all();
            }
        }

        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);

        loop {
            let status = state
                .pending
                .get(&txn_id)
                .map(|wait| wait.status)
                .unwrap_or(WaitStatus::Victim);

            match status {
                WaitStatus::Granted => {
                    state.pending.remove(&txn_id);
                    debug!(
                        "txn {} acquired {} on {} after {:?}",
                        txn_id,
                        mode,
                        resource,
                        started.elapsed()
                    );
                    return Ok(true);
                }
                WaitStatus::Victim => {
                    state.pending.remove(&txn_id);
                    return Err(LockError::Deadlock {
                        txn_id,
                        resource: resource.clone(),
                        mode,
                    });
                }
                WaitStatus::Waiting => {}
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    state.pending.remove(&txn_id);
                    state.withdraw_request(txn_id, resource);
                    self.wakeup.notify_all();
                    let waited = started.elapsed();
                    warn!(
                        "txn {} timed out after {:?} waiting for {} on {}",
                        txn_id, waited, mode, resource
                    );
                    return Err(LockError::Timeout {
                        txn_id,
                        resource: resource.clone(),
                        mode,
                        waited,
                    });
                }
                Some(deadline) => {
                    self.wakeup.wait_until(&mut state, deadline);
                }
                None => {
                    self.wakeup.wait(&mut state);
                }
            }
        }
    }

    /// Release every lock held by `txn_id` in one step and hand freed resources
    /// to queued requests. Returns the number of granted entries removed.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let mut state = self.state.lock();
        let released = state.release_all(txn_id);
        drop(state);

        self.wakeup.notify_all();
        debug!("txn {} released {} locks", txn_id, released);
        released
    }

    /// Run one detection pass now; returns the victims chosen
    pub fn detect_deadlocks(&self) -> Vec<TxnId> {
        let mut state = self.state.lock();
        let victims = state.resolve_deadlocks();
        drop(state);

        if !victims.is_empty() {
            self.wakeup.notify_all();
        }
        victims
    }

    /// Granted requests on `resource`, in grant order
    pub fn holders(&self, resource: &Resource) -> Vec<LockRequest> {
        self.state
            .lock()
            .resources
            .get(resource)
            .map(|entry| entry.granted.clone())
            .unwrap_or_default()
    }

    /// Queued requests on `resource`, in FIFO order
    pub fn waiters(&self, resource: &Resource) -> Vec<LockRequest> {
        self.state
            .lock()
            .resources
            .get(resource)
            .map(|entry| entry.waiting.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every (resource, mode) pair `txn_id` holds, sorted
    pub fn locks_held(&self, txn_id: TxnId) -> Vec<(Resource, LockMode)> {
        let state = self.state.lock();
        let mut held: Vec<(Resource, LockMode)> = state
            .held
            .get(&txn_id)
            .into_iter()
            .flatten()
            .filter_map(|resource| state.resources.get(resource))
            .flat_map(|entry| entry.granted.iter())
            .filter(|request| request.txn_id == txn_id)
            .map(|request| (request.resource.clone(), request.mode))
            .collect();
        held.sort();
        held
    }

    /// Whether `txn_id` holds `mode`, or a mode covering it, on `resource`
    pub fn holds(&self, txn_id: TxnId, resource: &Resource, mode: LockMode) -> bool {
        self.state
            .lock()
            .resources
            .get(resource)
            .is_some_and(|entry| {
                entry
                    .granted
                    .iter()
                    .any(|r| r.txn_id == txn_id && r.mode.covers(mode))
            })
    }

    /// Whether `txn_id` is currently blocked in `acquire`
    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.state
            .lock()
            .pending
            .get(&txn_id)
            .is_some_and(|wait| wait.status == WaitStatus::Waiting)
    }

    /// Current wait-for edges as (waiter, blocker) pairs
    pub fn wait_for_edges(&self) -> Vec<(TxnId, TxnId)> {
        WaitForGraph::build(self.state.lock().resources.values()).edges()
    }

    /// Pairs of distinct transactions holding conflicting modes on the same
    /// resource. Always empty unless the table is broken.
    pub fn conflicting_grants(&self) -> Vec<(Resource, TxnId, TxnId)> {
        let state = self.state.lock();
        let mut conflicts = Vec::new();

        for (resource, entry) in &state.resources {
            for (i, a) in entry.granted.iter().enumerate() {
                for b in entry.granted.iter().skip(i + 1) {
                    if a.txn_id != b.txn_id && a.mode.conflicts_with(b.mode) {
                        conflicts.push((resource.clone(), a.txn_id, b.txn_id));
                    }
                }
            }
        }

        conflicts
    }

    /// Number of resources with at least one granted or queued request
    pub fn resource_count(&self) -> usize {
        self.state.lock().resources.len()
    }
}
