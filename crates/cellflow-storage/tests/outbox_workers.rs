//! Outbox behavior across connections sharing one database file.

use std::collections::HashSet;
use std::time::Duration;

use cellflow_core::{FieldId, RecordId, TableId};
use cellflow_storage::{OutboxStore, SqliteStore, StorageError, TaskStatus};

fn table_id() -> TableId {
    TableId::parse("tblOrders0000000000").unwrap()
}

fn record(i: usize) -> RecordId {
    RecordId::parse(format!("rec{i:0>16}")).unwrap()
}

fn field() -> FieldId {
    FieldId::parse("fldAmount0000000000").unwrap()
}

fn open(dir: &tempfile::TempDir) -> SqliteStore {
    let path = dir.path().join("cellflow.db");
    SqliteStore::new(path.to_str().unwrap()).unwrap()
}

#[test]
fn two_workers_never_claim_the_same_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut producer = open(&dir);
    for i in 0..10 {
        producer.enqueue(&table_id(), &record(i), &[field()]).unwrap();
    }

    let mut a = open(&dir);
    let mut b = open(&dir);
    let first = a.claim_batch("worker-a", 4).unwrap();
    let second = b.claim_batch("worker-b", 4).unwrap();
    let third = a.claim_batch("worker-a", 4).unwrap();

    assert_eq!(first.len(), 4);
    assert_eq!(second.len(), 4);
    assert_eq!(third.len(), 2);

    let mut seen = HashSet::new();
    for task in first.iter().chain(&second).chain(&third) {
        assert!(seen.insert(task.id), "task {} claimed twice", task.id);
        assert_eq!(task.status, TaskStatus::Claimed);
    }
    assert!(second.iter().all(|t| t.claimed_by.as_deref() == Some("worker-b")));
    assert_eq!(producer.pending_count().unwrap(), 0);
}

#[test]
fn claims_come_back_in_enqueue_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(&dir);
    let ids: Vec<i64> = (0..3)
        .map(|i| store.enqueue(&table_id(), &record(i), &[field()]).unwrap())
        .collect();

    let claimed = store.claim_batch("w", 10).unwrap();
    let claimed_ids: Vec<i64> = claimed.iter().map(|t| t.id).collect();
    assert_eq!(claimed_ids, ids);
    assert_eq!(claimed[1].record_id, record(1));
}

#[test]
fn completed_tasks_leave_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(&dir);
    let done = store.enqueue(&table_id(), &record(0), &[field()]).unwrap();
    let stale = store.enqueue(&table_id(), &record(1), &[field()]).unwrap();
    store.claim_batch("w", 10).unwrap();
    store.complete(done).unwrap();

    // Every claim is at least zero seconds old.
    assert_eq!(store.reclaim_stale(Duration::ZERO).unwrap(), 1);
    assert_eq!(store.pending_count().unwrap(), 1);
    assert_eq!(store.task(stale).unwrap().unwrap().status, TaskStatus::Pending);
    assert!(store.task(done).unwrap().is_none());
    assert!(store.complete(done).is_err());
}

#[test]
fn fresh_claims_survive_a_long_stale_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(&dir);
    store.enqueue(&table_id(), &record(0), &[field()]).unwrap();
    store.claim_batch("w", 1).unwrap();
    assert_eq!(store.reclaim_stale(Duration::from_secs(3600)).unwrap(), 0);
}

#[test]
fn unknown_tasks_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(&dir);
    assert!(store.complete(42).is_err());
    assert!(store.fail(42, "nope", 3).is_err());
    assert!(store.task(42).unwrap().is_none());
}

#[test]
fn released_tasks_keep_their_attempt_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(&dir);
    let id = store.enqueue(&table_id(), &record(0), &[field()]).unwrap();
    store.claim_batch("w", 1).unwrap();
    store.release(id).unwrap();

    let task = store.task(id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
    assert!(task.claimed_by.is_none());
    // Only claimed tasks can be released.
    assert!(store.release(id).is_err());
}

#[test]
fn concurrent_read_then_write_sections_do_not_fail_to_lock() {
    let dir = tempfile::tempdir().unwrap();
    drop(open(&dir));

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let path = dir.path().join("cellflow.db");
            std::thread::spawn(move || {
                let mut store = SqliteStore::new(path.to_str().unwrap()).unwrap();
                for i in 0..50 {
                    store
                        .atomically(|s| -> Result<(), StorageError> {
                            s.pending_count()?;
                            s.enqueue(&table_id(), &record(w * 100 + i), &[field()])?;
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(open(&dir).pending_count().unwrap(), 100);
}

#[test]
fn nested_sections_roll_back_independently() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(&dir);
    store
        .atomically(|s| -> Result<(), StorageError> {
            s.enqueue(&table_id(), &record(0), &[field()])?;
            let inner = s.atomically(|s| -> Result<(), StorageError> {
                s.enqueue(&table_id(), &record(1), &[field()])?;
                Err(StorageError::TaskNotFound(1))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();

    assert!(store.connection().is_autocommit());
    assert_eq!(open(&dir).pending_count().unwrap(), 1);
}
