// Lock table invariants under a randomized concurrent workload

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lockdb::common::{Resource, RowKey, Value};
use lockdb::transaction::concurrency::{
    Granularity, LockMode, LockTable, TransactionError, TransactionManager, WaitPolicy,
};

#[path = "../common/mod.rs"]
mod common;

const THREADS: u64 = 6;
const TXNS_PER_THREAD: usize = 40;

fn modes(granularity: Granularity) -> Vec<LockMode> {
    LockMode::ALL
        .iter()
        .copied()
        .filter(|m| m.granularity() == granularity)
        .collect()
}

fn run_random_transaction(tm: &TransactionManager, rng: &mut StdRng) -> Result<(), TransactionError> {
    let table_modes = modes(Granularity::Table);
    let row_modes = modes(Granularity::Row);
    let txn = tm.begin();
    let policy = WaitPolicy::Timeout(Duration::from_millis(50));

    for _ in 0..rng.gen_range(1..=4) {
        let table = format!("t{}", rng.gen_range(0..2));
        let key = RowKey::new(table.clone(), rng.gen_range(0..4).to_string());

        let result = match rng.gen_range(0..3) {
            0 => {
                let mode = table_modes[rng.gen_range(0..table_modes.len())];
                tm.lock_table_with(&txn, &table, mode, policy)
            }
            1 => {
                let mode = row_modes[rng.gen_range(0..row_modes.len())];
                tm.lock_row(&txn, &key, mode, policy)
            }
            _ => tm.write(&txn, key, Value::Integer(txn.id() as i64)),
        };

        match result {
            Ok(()) => {}
            // The manager already rolled the transaction back
            Err(TransactionError::Deadlock { .. }) | Err(TransactionError::Timeout { .. }) => return Ok(()),
            Err(err) => return Err(err),
        }
    }

    if rng.gen_bool(0.7) {
        tm.commit(&txn)
    } else {
        tm.rollback(&txn)
    }
}

fn assert_no_conflicting_grants(table: &LockTable) {
    let conflicts = table.conflicting_grants();
    assert!(conflicts.is_empty(), "conflicting grants: {:?}", conflicts);
}

#[test]
fn test_no_conflicting_grants_under_stress() -> Result<()> {
    let tm = common::create_manager_with_timeout(200)?;
    let done = Arc::new(AtomicBool::new(false));
    let checks = Arc::new(AtomicUsize::new(0));

    let checker = {
        let tm = Arc::clone(&tm);
        let done = Arc::clone(&done);
        let checks = Arc::clone(&checks);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                assert_no_conflicting_grants(tm.lock_manager());
                checks.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let workers: Vec<_> = (0..THREADS)
        .map(|seed| {
            let tm = Arc::clone(&tm);
            thread::spawn(move || -> Result<(), TransactionError> {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..TXNS_PER_THREAD {
                    run_random_transaction(&tm, &mut rng)?;
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap()?;
    }
    done.store(true, Ordering::SeqCst);
    checker.join().unwrap();

    assert!(checks.load(Ordering::SeqCst) > 0);
    assert_no_conflicting_grants(tm.lock_manager());
    // Every transaction ended, so nothing may still be held or queued
    assert!(tm.active_transaction_ids().is_empty());
    assert_eq!(tm.lock_manager().resource_count(), 0);
    assert!(tm.lock_manager().wait_for_edges().is_empty());
    Ok(())
}

#[test]
fn test_release_is_atomic_for_observers() -> Result<()> {
    let tm = common::create_manager();
    let txn = tm.begin();
    let keys: Vec<RowKey> = (0..20).map(|i| common::account(&i.to_string())).collect();
    for key in &keys {
        tm.write(&txn, key.clone(), Value::Integer(1))?;
    }
    assert_eq!(tm.lock_manager().locks_held(txn.id()).len(), 21);

    // An observer sees either every lock or none of them
    let observer = {
        let tm = Arc::clone(&tm);
        let id = txn.id();
        thread::spawn(move || {
            for _ in 0..1000 {
                let held = tm.lock_manager().locks_held(id).len();
                assert!(held == 21 || held == 0, "saw {} locks", held);
                if held == 0 {
                    break;
                }
            }
        })
    };

    tm.commit(&txn)?;
    observer.join().unwrap();
    assert!(!tm.lock_manager().holds(txn.id(), &Resource::table("accounts"), LockMode::RowExclusive));
    Ok(())
}

#[test]
fn test_commit_publishes_all_or_nothing() -> Result<()> {
    let tm = common::create_manager();
    let txn = tm.begin();
    for name in ["a", "b", "c"] {
        tm.write(&txn, common::account(name), Value::Integer(7))?;
    }

    let observer = {
        let tm = Arc::clone(&tm);
        thread::spawn(move || {
            loop {
                let visible = tm.snapshot().len();
                assert!(visible == 0 || visible == 3, "partial commit visible: {}", visible);
                if visible == 3 {
                    break;
                }
                thread::yield_now();
            }
        })
    };

    tm.commit(&txn)?;
    observer.join().unwrap();
    Ok(())
}
