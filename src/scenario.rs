// Runnable reproductions of classic concurrency hazards
//
// Each scenario builds its own transaction manager, drives a few threads
// through it and reports what happened. The CLI prints the reports; the
// integration tests assert on the structured outcomes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use crossbeam::channel;
use crossbeam::sync::WaitGroup;
use log::debug;

use crate::common::types::{RowKey, TxnId};
use crate::common::value::Value;
use crate::transaction::concurrency::lock_mode::LockMode;
use crate::transaction::concurrency::transaction::{Result, TransactionError};
use crate::transaction::concurrency::transaction_manager::{
    ReadMode, TransactionHandle, TransactionManager, TransactionManagerConfig,
};

pub const ACCOUNTS: &str = "accounts";
pub const PURCHASES: &str = "purchases";
pub const STARTING_BALANCE: i64 = 100;
pub const ITEM_COST: i64 = 65;
pub const ADVISORY_LOCK_NAME: &str = "nightly-report";

/// How long scenario coordination waits for a thread to block before giving up
const COORDINATION_LIMIT: Duration = Duration::from_secs(10);

pub fn balance_key() -> RowKey {
    RowKey::new(ACCOUNTS, "alice")
}

fn purchase_key(txn_id: TxnId) -> RowKey {
    RowKey::new(PURCHASES, txn_id.to_string())
}

/// What happened to one purchasing transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseAttempt {
    Committed(TxnId),
    Conflict(TxnId),
    InsufficientFunds(TxnId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostUpdateOutcome {
    pub final_balance: Option<i64>,
    pub purchases: usize,
    pub attempts: Vec<PurchaseAttempt>,
}

impl LostUpdateOutcome {
    pub fn committed(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| matches!(a, PurchaseAttempt::Committed(_)))
            .count()
    }

    pub fn conflicts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| matches!(a, PurchaseAttempt::Conflict(_)))
            .count()
    }

    /// Money was spent twice but only deducted once
    pub fn lost_update(&self) -> bool {
        let charged = STARTING_BALANCE - self.final_balance.unwrap_or(STARTING_BALANCE);
        self.purchases as i64 * ITEM_COST > charged
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadlockOutcome {
    pub victims: Vec<TxnId>,
    pub survivors: Vec<TxnId>,
    pub first_value: Option<Value>,
    pub second_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryOutcome {
    pub contender_timed_out: bool,
    pub contender_acquired_after_release: bool,
    pub contender_waited: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLockOutcome {
    /// Events in the order they happened
    pub events: Vec<String>,
    pub final_balance: Option<i64>,
}

/// Commit a starting balance for alice
pub fn seed_accounts(tm: &TransactionManager) -> Result<()> {
    let txn = tm.begin();
    tm.write(&txn, balance_key(), Value::Integer(STARTING_BALANCE))?;
    tm.commit(&txn)
}

fn current_balance(tm: &TransactionManager) -> Option<i64> {
    tm.committed_value(&balance_key()).and_then(|v| v.as_integer())
}

fn purchase_count(tm: &TransactionManager) -> usize {
    tm.snapshot().keys().filter(|key| key.table == PURCHASES).count()
}

/// Poll until `txn_id` is queued in the lock table
fn wait_until_blocked(tm: &TransactionManager, txn_id: TxnId) -> Result<()> {
    let deadline = Instant::now() + COORDINATION_LIMIT;
    while !tm.lock_manager().is_waiting(txn_id) {
        if Instant::now() >= deadline {
            return Err(TransactionError::Internal(format!(
                "txn {} never blocked on a lock",
                txn_id
            )));
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn join_worker<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| TransactionError::Internal("scenario worker panicked".to_string()))?
}

/// Two buyers read alice's balance with plain snapshot reads, both decide
/// they can afford the item, and both write back `balance - cost`.
///
/// Without `optimistic` the second write silently overwrites the first:
/// two purchases are recorded but the balance drops only once. With
/// `optimistic` each buyer writes through `compare_and_swap(balance >= cost)`
/// and the loser sees a conflict instead.
pub fn lost_update(tm: &Arc<TransactionManager>, optimistic: bool) -> Result<LostUpdateOutcome> {
    seed_accounts(tm)?;

    let both_read = WaitGroup::new();
    let mut workers = Vec::new();

    for _ in 0..2 {
        let tm = Arc::clone(tm);
        let both_read = both_read.clone();
        workers.push(thread::spawn(move || buy(&tm, both_read, optimistic)));
    }
    drop(both_read);

    let mut attempts = Vec::new();
    for worker in workers {
        attempts.push(join_worker(worker)?);
    }

    Ok(LostUpdateOutcome {
        final_balance: current_balance(tm),
        purchases: purchase_count(tm),
        attempts,
    })
}

fn buy(tm: &TransactionManager, both_read: WaitGroup, optimistic: bool) -> Result<PurchaseAttempt> {
    let txn = tm.begin();
    let balance = tm
        .read(&txn, &balance_key(), ReadMode::Snapshot)?
        .and_then(|v| v.as_integer())
        .unwrap_or(0);
    debug!("txn {} sees balance {}", txn.id(), balance);

    // Nobody writes until both buyers have read
    both_read.wait();

    if balance < ITEM_COST {
        tm.rollback(&txn)?;
        return Ok(PurchaseAttempt::InsufficientFunds(txn.id()));
    }

    let new_balance = Value::Integer(balance - ITEM_COST);
    if optimistic {
        let swapped = tm.compare_and_swap(
            &txn,
            balance_key(),
            |current| current.and_then(Value::as_integer).is_some_and(|b| b >= ITEM_COST),
            new_balance,
        )?;
        if !swapped {
            tm.rollback(&txn)?;
            return Ok(PurchaseAttempt::Conflict(txn.id()));
        }
    } else {
        tm.write(&txn, balance_key(), new_balance)?;
    }

    tm.write(&txn, purchase_key(txn.id()), Value::Integer(ITEM_COST))?;
    tm.commit(&txn)?;
    Ok(PurchaseAttempt::Committed(txn.id()))
}

/// tx1 writes A then B, tx2 writes B then A. The detector aborts one of them
/// and the other commits.
pub fn deadlock(tm: &Arc<TransactionManager>) -> Result<DeadlockOutcome> {
    let first_key = RowKey::new(ACCOUNTS, "a");
    let second_key = RowKey::new(ACCOUNTS, "b");

    let tx1 = tm.begin();
    let tx2 = tm.begin();
    tm.write(&tx1, first_key.clone(), Value::Text(format!("tx{}", tx1.id())))?;
    tm.write(&tx2, second_key.clone(), Value::Text(format!("tx{}", tx2.id())))?;

    let first = spawn_crossing_write(tm, &tx1, second_key.clone());
    wait_until_blocked(tm, tx1.id())?;
    let second = spawn_crossing_write(tm, &tx2, first_key.clone());

    let mut victims = Vec::new();
    let mut survivors = Vec::new();
    for (txn_id, worker) in [(tx1.id(), first), (tx2.id(), second)] {
        if join_worker(worker)? {
            survivors.push(txn_id);
        } else {
            victims.push(txn_id);
        }
    }

    Ok(DeadlockOutcome {
        victims,
        survivors,
        first_value: tm.committed_value(&first_key),
        second_value: tm.committed_value(&second_key),
    })
}

/// Returns Ok(true) if the transaction committed, Ok(false) if it was the victim
fn spawn_crossing_write(
    tm: &Arc<TransactionManager>,
    txn: &TransactionHandle,
    key: RowKey,
) -> thread::JoinHandle<Result<bool>> {
    let tm = Arc::clone(tm);
    let txn = txn.clone();
    thread::spawn(move || -> Result<bool> {
        match tm.write(&txn, key, Value::Text(format!("tx{}", txn.id()))) {
            Ok(()) => {
                tm.commit(&txn)?;
                Ok(true)
            }
            Err(TransactionError::Deadlock { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    })
}

/// One session holds a named lock; a second session first gives up after a
/// short timeout, then waits without a timeout and gets the lock once the
/// first releases it.
pub fn advisory(tm: &Arc<TransactionManager>, contender_timeout: Duration) -> Result<AdvisoryOutcome> {
    let holder = tm.acquire_advisory(ADVISORY_LOCK_NAME, None)?;
    let (timed_out_tx, timed_out_rx) = channel::bounded::<bool>(1);

    let contender = {
        let tm = Arc::clone(tm);
        thread::spawn(move || -> Result<(bool, Duration)> {
            let timed_out = matches!(
                tm.acquire_advisory(ADVISORY_LOCK_NAME, Some(contender_timeout)),
                Err(TransactionError::Timeout { .. })
            );
            let _ = timed_out_tx.send(timed_out);

            let started = Instant::now();
            let guard = tm.acquire_advisory(ADVISORY_LOCK_NAME, None)?;
            let waited = started.elapsed();
            guard.release();
            Ok((true, waited))
        })
    };

    let contender_timed_out = timed_out_rx
        .recv()
        .map_err(|_| TransactionError::Internal("advisory contender exited early".to_string()))?;

    let deadline = Instant::now() + COORDINATION_LIMIT;
    while tm.advisory_locks().waiter_count(ADVISORY_LOCK_NAME) == 0 {
        if Instant::now() >= deadline {
            return Err(TransactionError::Internal("advisory contender never queued".to_string()));
        }
        thread::sleep(Duration::from_millis(1));
    }
    holder.release();

    let (contender_acquired_after_release, contender_waited) = join_worker(contender)?;
    Ok(AdvisoryOutcome {
        contender_timed_out,
        contender_acquired_after_release,
        contender_waited,
    })
}

/// A reader takes `LOCK TABLE accounts IN SHARE MODE`; a writer trying to
/// update a row in that table is held back until the reader commits.
pub fn table_lock(tm: &Arc<TransactionManager>) -> Result<TableLockOutcome> {
    seed_accounts(tm)?;
    let (event_tx, event_rx) = channel::unbounded::<String>();

    let reader = tm.begin();
    tm.lock_table(&reader, ACCOUNTS, LockMode::Share)?;
    let _ = event_tx.send(format!("tx{} locked {} IN SHARE MODE", reader.id(), ACCOUNTS));

    let writer = tm.begin();
    let writer_id = writer.id();
    let worker = {
        let tm = Arc::clone(tm);
        let event_tx = event_tx.clone();
        thread::spawn(move || -> Result<()> {
            tm.write(&writer, balance_key(), Value::Integer(STARTING_BALANCE + 50))?;
            let _ = event_tx.send(format!("tx{} wrote {}", writer.id(), balance_key()));
            tm.commit(&writer)?;
            let _ = event_tx.send(format!("tx{} committed", writer.id()));
            Ok(())
        })
    };

    wait_until_blocked(tm, writer_id)?;
    let _ = event_tx.send(format!("tx{} blocked waiting for ROW EXCLUSIVE", writer_id));

    let seen = tm.read(&reader, &balance_key(), ReadMode::Snapshot)?;
    let _ = event_tx.send(format!(
        "tx{} read {} = {}",
        reader.id(),
        balance_key(),
        seen.map(|v| v.to_string()).unwrap_or_else(|| "NULL".to_string())
    ));
    let _ = event_tx.send(format!("tx{} committing", reader.id()));
    tm.commit(&reader)?;

    join_worker(worker)?;
    drop(event_tx);

    Ok(TableLockOutcome {
        events: event_rx.iter().collect(),
        final_balance: current_balance(tm),
    })
}

/// Scenarios runnable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    LostUpdate,
    OptimisticFix,
    Deadlock,
    Advisory,
    TableLock,
}

impl Scenario {
    pub const ALL: [Scenario; 5] = [
        Scenario::LostUpdate,
        Scenario::OptimisticFix,
        Scenario::Deadlock,
        Scenario::Advisory,
        Scenario::TableLock,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::LostUpdate => "lost-update",
            Scenario::OptimisticFix => "optimistic-fix",
            Scenario::Deadlock => "deadlock",
            Scenario::Advisory => "advisory",
            Scenario::TableLock => "table-lock",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Scenario::LostUpdate => "two buyers read-then-write the same balance without locking",
            Scenario::OptimisticFix => "the same race with a conditional update",
            Scenario::Deadlock => "two transactions lock rows in opposite order",
            Scenario::Advisory => "two sessions contend for one named lock",
            Scenario::TableLock => "a SHARE table lock holds back a row writer",
        }
    }

    /// Run against a fresh transaction manager built from `config`
    pub fn run(self, config: &TransactionManagerConfig) -> Result<ScenarioReport> {
        let tm = Arc::new(TransactionManager::new(config.clone())?);
        let mut report = ScenarioReport::new(format!("{}: {}", self.name(), self.description()));

        match self {
            Scenario::LostUpdate | Scenario::OptimisticFix => {
                let outcome = lost_update(&tm, self == Scenario::OptimisticFix)?;
                for attempt in &outcome.attempts {
                    report.push(match attempt {
                        PurchaseAttempt::Committed(id) => format!("tx{} bought the item and committed", id),
                        PurchaseAttempt::Conflict(id) => format!("tx{} lost the conditional update and rolled back", id),
                        PurchaseAttempt::InsufficientFunds(id) => format!("tx{} saw insufficient funds", id),
                    });
                }
                report.push(format!(
                    "final balance {}, {} purchases recorded",
                    outcome
                        .final_balance
                        .map(|b| b.to_string())
                        .unwrap_or_else(|| "NULL".to_string()),
                    outcome.purchases
                ));
                report.push(if outcome.lost_update() {
                    "lost update: an item was paid for only once".to_string()
                } else {
                    "no update was lost".to_string()
                });
            }
            Scenario::Deadlock => {
                let outcome = deadlock(&tm)?;
                for id in &outcome.victims {
                    report.push(format!("tx{} was chosen as deadlock victim and rolled back", id));
                }
                for id in &outcome.survivors {
                    report.push(format!("tx{} committed", id));
                }
                report.push(format!(
                    "a = {}, b = {}",
                    display_value(outcome.first_value.as_ref()),
                    display_value(outcome.second_value.as_ref())
                ));
            }
            Scenario::Advisory => {
                let outcome = advisory(&tm, Duration::from_millis(50))?;
                report.push(format!("session 1 holds '{}'", ADVISORY_LOCK_NAME));
                report.push(if outcome.contender_timed_out {
                    "session 2 timed out on its first attempt".to_string()
                } else {
                    "session 2 unexpectedly got the lock on its first attempt".to_string()
                });
                report.push(format!(
                    "session 2 acquired the lock after waiting {:?} for session 1 to release it",
                    outcome.contender_waited
                ));
            }
            Scenario::TableLock => {
                let outcome = table_lock(&tm)?;
                for event in outcome.events {
                    report.push(event);
                }
            }
        }

        Ok(report)
    }
}

fn display_value(value: Option<&Value>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "NULL".to_string())
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = TransactionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Scenario::ALL
            .iter()
            .copied()
            .find(|scenario| scenario.name() == normalized)
            .ok_or_else(|| TransactionError::InvalidRequest(format!("unknown scenario '{}'", s)))
    }
}

/// Human-readable result of a scenario run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub title: String,
    pub lines: Vec<String>,
}

impl ScenarioReport {
    fn new(title: String) -> Self {
        Self {
            title,
            lines: Vec::new(),
        }
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        for line in &self.lines {
            writeln!(f, "  {}", line)?;
        }
        Ok(())
    }
}
