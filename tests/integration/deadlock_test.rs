// Deadlock detection integration tests

use anyhow::Result;
use std::sync::Arc;
use std::thread;

use lockdb::common::{Resource, Value};
use lockdb::scenario;
use lockdb::transaction::concurrency::{LockMode, TransactionError, TransactionState};

#[path = "../common/mod.rs"]
mod common;

#[test]
fn test_crossing_writers_lose_exactly_one() -> Result<()> {
    let tm = common::create_manager();
    let outcome = scenario::deadlock(&tm)?;

    assert_eq!(outcome.victims.len(), 1);
    assert_eq!(outcome.survivors.len(), 1);
    // The request that closed the cycle is the youngest
    assert_eq!(outcome.victims, vec![2]);

    let winner = Value::Text(format!("tx{}", outcome.survivors[0]));
    assert_eq!(outcome.first_value, Some(winner.clone()));
    assert_eq!(outcome.second_value, Some(winner));
    assert!(tm.lock_manager().conflicting_grants().is_empty());
    assert_eq!(tm.lock_manager().resource_count(), 0);
    Ok(())
}

#[test]
fn test_periodic_sweep_breaks_deadlock() -> Result<()> {
    let tm = common::create_periodic_manager(10)?;
    let outcome = scenario::deadlock(&tm)?;
    assert_eq!(outcome.victims.len(), 1);
    assert_eq!(outcome.survivors.len(), 1);
    assert!(tm.active_transaction_ids().is_empty());
    Ok(())
}

#[test]
fn test_three_way_cycle() -> Result<()> {
    let tm = common::create_manager();
    let txns: Vec<_> = (0..3).map(|_| tm.begin()).collect();
    let keys = ["a", "b", "c"];

    for (txn, key) in txns.iter().zip(keys) {
        tm.lock_row(txn, &common::account(key), LockMode::ForUpdate, Default::default())?;
    }

    // txn i waits for the row held by txn i+1; the last request closes the cycle
    let mut workers = Vec::new();
    for i in 0..2 {
        let worker_tm = Arc::clone(&tm);
        let txn = txns[i].clone();
        let next = keys[i + 1];
        workers.push(thread::spawn(move || {
            worker_tm.lock_row(&txn, &common::account(next), LockMode::ForUpdate, Default::default())
        }));
        common::wait_until_waiting(&tm, txns[i].id())?;
    }

    let err = tm
        .lock_row(&txns[2], &common::account("a"), LockMode::ForUpdate, Default::default())
        .unwrap_err();
    assert_eq!(err, TransactionError::Deadlock { txn_id: txns[2].id() });
    assert_eq!(txns[2].state(), TransactionState::Aborted);

    // txn 2 gets c, then commits and hands b to txn 1
    let second = workers.pop().unwrap();
    second.join().unwrap()?;
    tm.commit(&txns[1])?;
    workers.pop().unwrap().join().unwrap()?;
    tm.commit(&txns[0])?;

    assert!(tm.lock_manager().wait_for_edges().is_empty());
    assert_eq!(tm.lock_manager().resource_count(), 0);
    Ok(())
}

#[test]
fn test_table_lock_upgrade_deadlock() -> Result<()> {
    // Two SHARE holders both asking for EXCLUSIVE is the textbook upgrade deadlock
    let tm = common::create_manager();
    let t1 = tm.begin();
    let t2 = tm.begin();
    tm.lock_table(&t1, "accounts", LockMode::Share)?;
    tm.lock_table(&t2, "accounts", LockMode::Share)?;

    let first = {
        let tm = Arc::clone(&tm);
        let t1 = t1.clone();
        thread::spawn(move || tm.lock_table(&t1, "accounts", LockMode::Exclusive))
    };
    common::wait_until_waiting(&tm, t1.id())?;

    let err = tm.lock_table(&t2, "accounts", LockMode::Exclusive).unwrap_err();
    assert!(matches!(err, TransactionError::Deadlock { .. }));

    first.join().unwrap()?;
    assert!(tm.lock_manager().holds(t1.id(), &Resource::table("accounts"), LockMode::Exclusive));
    tm.commit(&t1)?;
    Ok(())
}

#[test]
fn test_victim_cannot_continue() -> Result<()> {
    let tm = common::create_manager();
    let outcome = scenario::deadlock(&tm)?;
    let victim = outcome.victims[0];
    assert!(!tm.transaction_exists(victim));
    assert!(tm.lock_manager().locks_held(victim).is_empty());
    Ok(())
}
