// Table and row lock mode integration tests

use anyhow::Result;

use lockdb::common::Resource;
use lockdb::scenario;
use lockdb::transaction::concurrency::{Granularity, LockMode, TransactionError, WaitPolicy};

#[path = "../common/mod.rs"]
mod common;

#[test]
fn test_share_lock_holds_back_writer() -> Result<()> {
    let tm = common::create_manager();
    let outcome = scenario::table_lock(&tm)?;

    let position = |needle: &str| {
        outcome
            .events
            .iter()
            .position(|e| e.contains(needle))
            .unwrap_or_else(|| panic!("no event containing '{}' in {:?}", needle, outcome.events))
    };

    assert!(position("IN SHARE MODE") < position("blocked"));
    assert!(position("committing") < position("wrote"));
    assert!(position("wrote") < position("tx3 committed"));
    // The reader saw the balance from before the writer ran
    assert!(outcome.events.iter().any(|e| e.contains("= 100")));
    assert_eq!(outcome.final_balance, Some(150));
    Ok(())
}

#[test]
fn test_table_modes_block_per_conflict_matrix() -> Result<()> {
    let table_modes: Vec<LockMode> = LockMode::ALL
        .iter()
        .copied()
        .filter(|m| m.granularity() == Granularity::Table)
        .collect();

    for held in &table_modes {
        for requested in &table_modes {
            let tm = common::create_manager();
            let holder = tm.begin();
            let other = tm.begin();
            tm.lock_table(&holder, "accounts", *held)?;

            let result = tm.lock_table_with(&other, "accounts", *requested, WaitPolicy::NoWait);
            if held.conflicts_with(*requested) {
                assert!(
                    matches!(result, Err(TransactionError::LockNotAvailable { .. })),
                    "{} should block {}",
                    held,
                    requested
                );
            } else {
                assert!(result.is_ok(), "{} should not block {}", held, requested);
            }

            tm.commit(&holder)?;
            tm.commit(&other)?;
        }
    }
    Ok(())
}

#[test]
fn test_row_share_and_key_share_coexist_with_no_key_update() -> Result<()> {
    let tm = common::create_manager();
    let updater = tm.begin();
    let checker = tm.begin();
    let key = common::account("alice");

    tm.lock_row(&updater, &key, LockMode::ForNoKeyUpdate, WaitPolicy::NoWait)?;
    // A foreign-key check only needs FOR KEY SHARE
    tm.lock_row(&checker, &key, LockMode::ForKeyShare, WaitPolicy::NoWait)?;

    let err = tm
        .lock_row(&checker, &key, LockMode::ForShare, WaitPolicy::NoWait)
        .unwrap_err();
    assert!(matches!(err, TransactionError::LockNotAvailable { .. }));

    let row = Resource::from(&key);
    assert_eq!(tm.lock_manager().holders(&row).len(), 2);
    tm.commit(&updater)?;
    tm.commit(&checker)?;
    Ok(())
}

#[test]
fn test_access_exclusive_only_blocks_locking_reads() -> Result<()> {
    let tm = common::create_manager();
    let ddl = tm.begin();
    tm.lock_table(&ddl, "accounts", LockMode::AccessExclusive)?;

    let reader = tm.begin();
    // Plain reads take no lock at all here
    tm.read(&reader, &common::account("alice"), Default::default())?;

    let err = tm
        .lock_row(&reader, &common::account("alice"), LockMode::ForShare, WaitPolicy::NoWait)
        .unwrap_err();
    assert!(matches!(err, TransactionError::LockNotAvailable { .. }));

    tm.rollback(&ddl)?;
    tm.lock_row(&reader, &common::account("alice"), LockMode::ForShare, WaitPolicy::NoWait)?;
    tm.commit(&reader)?;
    Ok(())
}
