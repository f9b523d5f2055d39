// Advisory lock integration tests

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lockdb::scenario;
use lockdb::transaction::concurrency::TransactionError;

#[path = "../common/mod.rs"]
mod common;

#[test]
fn test_contender_times_out_then_acquires() -> Result<()> {
    let tm = common::create_manager();
    let outcome = scenario::advisory(&tm, Duration::from_millis(30))?;

    assert!(outcome.contender_timed_out);
    assert!(outcome.contender_acquired_after_release);
    assert!(tm.advisory_locks().is_free(scenario::ADVISORY_LOCK_NAME));
    Ok(())
}

#[test]
fn test_advisory_lock_is_mutually_exclusive() -> Result<()> {
    let tm = common::create_manager();
    let inside = Arc::new(AtomicBool::new(false));
    let entries = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let tm = Arc::clone(&tm);
            let inside = Arc::clone(&inside);
            let entries = Arc::clone(&entries);
            thread::spawn(move || -> Result<(), TransactionError> {
                for _ in 0..25 {
                    let guard = tm.acquire_advisory("counter", None)?;
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    entries.fetch_add(1, Ordering::SeqCst);
                    inside.store(false, Ordering::SeqCst);
                    drop(guard);
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap()?;
    }
    assert_eq!(entries.load(Ordering::SeqCst), 100);
    assert!(tm.advisory_locks().is_free("counter"));
    Ok(())
}

#[test]
fn test_advisory_locks_ignore_the_lock_table() -> Result<()> {
    let tm = common::create_manager();
    let txn = tm.begin();
    tm.advisory_xact_lock(&txn, "accounts", None)?;

    // Same name as a table, but a different namespace
    assert!(tm.lock_manager().locks_held(txn.id()).is_empty());
    let other = tm.begin();
    tm.lock_table(&other, "accounts", lockdb::LockMode::AccessExclusive)?;

    tm.rollback(&txn)?;
    tm.commit(&other)?;
    assert!(tm.advisory_locks().is_free("accounts"));
    Ok(())
}

#[test]
fn test_try_lock_and_shared_holders() -> Result<()> {
    let tm = common::create_manager();
    let reader_a = tm.acquire_advisory_shared("config", Some(Duration::ZERO))?;
    let reader_b = tm.acquire_advisory_shared("config", Some(Duration::ZERO))?;
    assert_eq!(tm.advisory_locks().holder_count("config"), 2);

    let err = tm.acquire_advisory("config", Some(Duration::ZERO)).unwrap_err();
    assert!(matches!(err, TransactionError::Timeout { .. }));

    drop(reader_a);
    reader_b.release();
    let writer = tm.acquire_advisory("config", Some(Duration::ZERO))?;
    assert_eq!(writer.name(), "config");
    Ok(())
}
