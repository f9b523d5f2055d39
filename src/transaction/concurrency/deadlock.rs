// Deadlock detection
//
// The wait-for graph is derived from the lock table on demand and never stored.
// An edge A -> B means transaction A has a queued request that cannot be
// granted because of B: either B holds a conflicting mode on the resource, or
// B is queued ahead of A in a conflicting mode and FIFO order keeps A behind it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam::channel::{self, Sender};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::common::types::{RequestSeq, TxnId};
use crate::transaction::concurrency::lock_table::{LockTable, ResourceEntry};

/// When deadlock detection runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeadlockDetection {
    /// Check for a cycle every time a request has to wait, before the caller sleeps
    #[default]
    Immediate,

    /// Leave blocked requests alone and sweep the whole table on a timer
    Periodic { interval_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    Visiting,
    Visited,
}

/// Wait-for graph over transactions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from the lock table's per-resource entries
    pub(crate) fn build<'a>(entries: impl IntoIterator<Item = &'a ResourceEntry>) -> Self {
        let mut graph = Self::new();

        for entry in entries {
            for (position, waiter) in entry.waiting.iter().enumerate() {
                for holder in &entry.granted {
                    if holder.txn_id != waiter.txn_id && holder.mode.conflicts_with(waiter.mode) {
                        graph.add_edge(waiter.txn_id, holder.txn_id);
                    }
                }

                // Upgrades by a current holder skip the queue, so they only wait on holders
                if entry.holds(waiter.txn_id) {
                    continue;
                }
                for ahead in entry.waiting.iter().take(position) {
                    if ahead.txn_id != waiter.txn_id && ahead.mode.conflicts_with(waiter.mode) {
                        graph.add_edge(waiter.txn_id, ahead.txn_id);
                    }
                }
            }
        }

        graph
    }

    pub fn add_edge(&mut self, waiter: TxnId, blocker: TxnId) {
        self.edges.entry(waiter).or_default().insert(blocker);
    }

    pub fn waits_for(&self, waiter: TxnId, blocker: TxnId) -> bool {
        self.edges
            .get(&waiter)
            .is_some_and(|blockers| blockers.contains(&blocker))
    }

    /// All edges in (waiter, blocker) order
    pub fn edges(&self) -> Vec<(TxnId, TxnId)> {
        self.edges
            .iter()
            .flat_map(|(&waiter, blockers)| blockers.iter().map(move |&blocker| (waiter, blocker)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Find one cycle, returned as the transactions along it in edge order.
    /// Search order follows transaction ids so the result is deterministic.
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut colours = HashMap::new();
        let mut path = Vec::new();

        for &start in self.edges.keys() {
            if colours.contains_key(&start) {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut colours, &mut path) {
                return Some(cycle);
            }
        }

        None
    }

    fn visit(
        &self,
        node: TxnId,
        colours: &mut HashMap<TxnId, Colour>,
        path: &mut Vec<TxnId>,
    ) -> Option<Vec<TxnId>> {
        colours.insert(node, Colour::Visiting);
        path.push(node);

        if let Some(blockers) = self.edges.get(&node) {
            for &next in blockers {
                match colours.get(&next) {
                    Some(Colour::Visiting) => {
                        let start = path.iter().position(|&t| t == next)?;
                        return Some(path[start..].to_vec());
                    }
                    Some(Colour::Visited) => {}
                    None => {
                        if let Some(cycle) = self.visit(next, colours, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        path.pop();
        colours.insert(node, Colour::Visited);
        None
    }
}

/// Pick the transaction to abort from a cycle: the one whose waiting request
/// arrived last, ties going to the higher transaction id.
pub fn choose_victim(
    cycle: &[TxnId],
    request_seq: impl Fn(TxnId) -> Option<RequestSeq>,
) -> Option<TxnId> {
    cycle
        .iter()
        .copied()
        .max_by_key(|&txn_id| (request_seq(txn_id).unwrap_or(0), txn_id))
}

/// Background thread sweeping a lock table for deadlocks on a fixed period.
/// Stops when dropped.
pub struct DeadlockMonitor {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockMonitor {
    pub fn spawn(lock_table: Arc<LockTable>, interval: Duration) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(interval);

        let handle = thread::Builder::new()
            .name("deadlock-monitor".to_string())
            .spawn(move || {
                debug!("deadlock monitor started, sweeping every {:?}", interval);
                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => {
                            let victims = lock_table.detect_deadlocks();
                            if !victims.is_empty() {
                                debug!("deadlock sweep aborted {:?}", victims);
                            } else {
                                trace!("deadlock sweep found no cycles");
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                debug!("deadlock monitor stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for DeadlockMonitor {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the select
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
