// Advisory (named) locks
//
// Application-defined locks identified by name and unrelated to any table,
// row or transaction. They live in their own registry so holding one never
// shows up in the lock table or its wait-for graph.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvisoryError {
    #[error("Timed out after {waited:?} waiting for advisory lock '{name}'")]
    Timeout { name: String, waited: Duration },
}

/// Result type for advisory lock operations
pub type Result<T> = std::result::Result<T, AdvisoryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisoryMode {
    Exclusive,
    Shared,
}

impl AdvisoryMode {
    fn conflicts_with(self, other: AdvisoryMode) -> bool {
        !(self == AdvisoryMode::Shared && other == AdvisoryMode::Shared)
    }
}

type Ticket = u64;

#[derive(Debug, Default)]
struct NamedLock {
    holders: Vec<(Ticket, AdvisoryMode)>,
    queue: VecDeque<(Ticket, AdvisoryMode)>,
}

impl NamedLock {
    fn admits(&self, mode: AdvisoryMode) -> bool {
        self.holders.iter().all(|&(_, held)| !held.conflicts_with(mode))
    }

    fn is_held_by(&self, ticket: Ticket) -> bool {
        self.holders.iter().any(|&(t, _)| t == ticket)
    }

    /// Move requests from the front of the queue to the holders while they fit
    fn promote(&mut self) {
        while let Some(&(ticket, mode)) = self.queue.front() {
            if !self.admits(mode) {
                break;
            }
            self.queue.pop_front();
            self.holders.push((ticket, mode));
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

#[derive(Debug, Default)]
struct Registry {
    locks: HashMap<String, NamedLock>,
    next_ticket: Ticket,
}

/// Registry of named locks
#[derive(Debug, Default)]
pub struct AdvisoryLocks {
    registry: Mutex<Registry>,
    released: Condvar,
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `name` exclusively. `timeout == None` waits indefinitely,
    /// `Some(Duration::ZERO)` only succeeds if the lock is free right now.
    pub fn acquire(self: &Arc<Self>, name: &str, timeout: Option<Duration>) -> Result<AdvisoryLockGuard> {
        self.acquire_mode(name, AdvisoryMode::Exclusive, timeout)
    }

    /// Take `name` in shared mode; any number of shared holders may coexist
    pub fn acquire_shared(self: &Arc<Self>, name: &str, timeout: Option<Duration>) -> Result<AdvisoryLockGuard> {
        self.acquire_mode(name, AdvisoryMode::Shared, timeout)
    }

    fn acquire_mode(
        self: &Arc<Self>,
        name: &str,
        mode: AdvisoryMode,
        timeout: Option<Duration>,
    ) -> Result<AdvisoryLockGuard> {
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);

        let mut registry = self.registry.lock();
        registry.next_ticket += 1;
        let ticket = registry.next_ticket;

        let lock = registry.locks.entry(name.to_string()).or_default();
        if lock.queue.is_empty() && lock.admits(mode) {
            lock.holders.push((ticket, mode));
            debug!("advisory lock '{}' acquired ({:?})", name, mode);
            return Ok(AdvisoryLockGuard::new(Arc::clone(self), name, ticket, mode));
        }
        lock.queue.push_back((ticket, mode));
        debug!("waiting for advisory lock '{}' ({:?})", name, mode);

        loop {
            let granted = registry
                .locks
                .get(name)
                .is_some_and(|lock| lock.is_held_by(ticket));
            if granted {
                debug!("advisory lock '{}' acquired after {:?}", name, started.elapsed());
                return Ok(AdvisoryLockGuard::new(Arc::clone(self), name, ticket, mode));
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    if let Some(lock) = registry.locks.get_mut(name) {
                        lock.queue.retain(|&(t, _)| t != ticket);
                        lock.promote();
                        if lock.is_idle() {
                            registry.locks.remove(name);
                        }
                    }
                    drop(registry);
                    self.released.notify_all();

                    let waited = started.elapsed();
                    warn!("timed out after {:?} waiting for advisory lock '{}'", waited, name);
                    return Err(AdvisoryError::Timeout {
                        name: name.to_string(),
                        waited,
                    });
                }
                Some(deadline) => {
                    self.released.wait_until(&mut registry, deadline);
                }
                None => {
                    self.released.wait(&mut registry);
                }
            }
        }
    }

    fn release(&self, name: &str, ticket: Ticket) {
        let mut registry = self.registry.lock();
        if let Some(lock) = registry.locks.get_mut(name) {
            lock.holders.retain(|&(t, _)| t != ticket);
            lock.promote();
            if lock.is_idle() {
                registry.locks.remove(name);
            }
        }
        drop(registry);

        self.released.notify_all();
        debug!("advisory lock '{}' released", name);
    }

    /// Whether nobody holds or waits for `name`
    pub fn is_free(&self, name: &str) -> bool {
        !self.registry.lock().locks.contains_key(name)
    }

    /// Number of current holders of `name`
    pub fn holder_count(&self, name: &str) -> usize {
        self.registry
            .lock()
            .locks
            .get(name)
            .map(|lock| lock.holders.len())
            .unwrap_or(0)
    }

    /// Number of requests queued on `name`
    pub fn waiter_count(&self, name: &str) -> usize {
        self.registry
            .lock()
            .locks
            .get(name)
            .map(|lock| lock.queue.len())
            .unwrap_or(0)
    }
}

/// Holds an advisory lock until dropped or explicitly released
pub struct AdvisoryLockGuard {
    registry: Arc<AdvisoryLocks>,
    name: String,
    ticket: Ticket,
    mode: AdvisoryMode,
    released: bool,
}

impl AdvisoryLockGuard {
    fn new(registry: Arc<AdvisoryLocks>, name: &str, ticket: Ticket, mode: AdvisoryMode) -> Self {
        Self {
            registry,
            name: name.to_string(),
            ticket,
            mode,
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> AdvisoryMode {
        self.mode
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.name, self.ticket);
        }
    }
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for AdvisoryLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvisoryLockGuard")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}
