// Lost update integration tests

use anyhow::Result;
use std::sync::Arc;
use std::thread;

use lockdb::common::Value;
use lockdb::scenario::{self, PurchaseAttempt, ITEM_COST, STARTING_BALANCE};
use lockdb::transaction::concurrency::{ReadMode, TransactionError, TransactionState};

#[path = "../common/mod.rs"]
mod common;

#[test]
fn test_plain_read_then_write_loses_an_update() -> Result<()> {
    let tm = common::create_manager();
    let outcome = scenario::lost_update(&tm, false)?;

    // Both buyers saw 100 and both wrote 35 back
    assert_eq!(outcome.final_balance, Some(STARTING_BALANCE - ITEM_COST));
    assert_eq!(outcome.purchases, 2);
    assert_eq!(outcome.committed(), 2);
    assert!(outcome.lost_update());
    Ok(())
}

#[test]
fn test_conditional_update_prevents_lost_update() -> Result<()> {
    let tm = common::create_manager();
    let outcome = scenario::lost_update(&tm, true)?;

    assert_eq!(outcome.final_balance, Some(35));
    assert_eq!(outcome.purchases, 1);
    assert_eq!(outcome.committed(), 1);
    assert_eq!(outcome.conflicts(), 1);
    assert!(!outcome.lost_update());
    assert!(
        outcome
            .attempts
            .iter()
            .any(|a| matches!(a, PurchaseAttempt::Conflict(_)))
    );
    Ok(())
}

#[test]
fn test_conditional_update_with_periodic_detection() -> Result<()> {
    let tm = common::create_periodic_manager(10)?;
    let outcome = scenario::lost_update(&tm, true)?;
    assert_eq!(outcome.final_balance, Some(35));
    assert_eq!(outcome.purchases, 1);
    Ok(())
}

#[test]
fn test_select_for_update_serializes_buyers() -> Result<()> {
    let tm = common::create_manager();
    scenario::seed_accounts(&tm)?;

    let mut workers = Vec::new();
    for _ in 0..2 {
        let tm = Arc::clone(&tm);
        workers.push(thread::spawn(move || -> Result<bool, TransactionError> {
            let txn = tm.begin();
            let balance = tm
                .read(&txn, &scenario::balance_key(), ReadMode::ForUpdate)?
                .and_then(|v| v.as_integer())
                .unwrap_or(0);
            if balance < ITEM_COST {
                tm.rollback(&txn)?;
                return Ok(false);
            }
            tm.write(&txn, scenario::balance_key(), Value::Integer(balance - ITEM_COST))?;
            tm.commit(&txn)?;
            Ok(true)
        }));
    }

    let bought: Vec<bool> = workers
        .into_iter()
        .map(|w| w.join().unwrap())
        .collect::<Result<_, _>>()?;
    assert_eq!(bought.iter().filter(|b| **b).count(), 1);
    assert_eq!(
        tm.committed_value(&scenario::balance_key()),
        Some(Value::Integer(35))
    );
    Ok(())
}

#[test]
fn test_committed_value_round_trip() -> Result<()> {
    let tm = common::create_manager();
    let txn = tm.begin();
    tm.write(&txn, common::account("bob"), Value::Text("first".to_string()))?;
    tm.write(&txn, common::account("bob"), Value::Text("second".to_string()))?;
    tm.commit(&txn)?;
    assert_eq!(txn.state(), TransactionState::Committed);

    let reader = tm.begin();
    assert_eq!(
        tm.read(&reader, &common::account("bob"), ReadMode::ForShare)?,
        Some(Value::Text("second".to_string()))
    );
    tm.commit(&reader)?;
    assert!(tm.lock_manager().locks_held(reader.id()).is_empty());
    Ok(())
}
