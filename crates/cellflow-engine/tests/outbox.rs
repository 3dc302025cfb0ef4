//! Deferred propagation: outbox mode, workers and the background runner.

use std::time::Duration;

use cellflow_core::{CellValue, Field, FieldId, Relationship, TableId};
use cellflow_engine::{Engine, EngineConfig, OutboxRunner, OutboxWorker, PropagationMode};
use cellflow_storage::OutboxStore;

fn outbox_config() -> EngineConfig {
    EngineConfig {
        propagation_mode: PropagationMode::Outbox,
        outbox_poll_interval: Duration::from_millis(10),
        ..EngineConfig::in_memory()
    }
}

/// A number field A and B = A * 10.
fn items(engine: &mut Engine) -> (TableId, FieldId, FieldId) {
    let table = engine.create_table("Items").unwrap();
    let a = Field::number("A");
    let a_id = a.id.clone();
    engine.create_field(&table, a).unwrap();
    let b = Field::formula("B", format!("{{{a_id}}} * 10"));
    let b_id = b.id.clone();
    engine.create_field(&table, b).unwrap();
    (table, a_id, b_id)
}

#[test]
fn empty_queue_processes_nothing() {
    let engine = Engine::open(outbox_config()).unwrap();
    let mut worker = OutboxWorker::new(engine);
    assert_eq!(worker.run_once("w1", 10).unwrap(), 0);
}

#[test]
fn writes_are_queued_until_a_worker_runs() {
    let mut engine = Engine::open(outbox_config()).unwrap();
    let (table, a, b) = items(&mut engine);

    let mut records = Vec::new();
    for i in 0..5 {
        let (record, changes) = engine
            .create_record(&table, vec![(a.clone(), (i as f64).into())])
            .unwrap();
        assert!(changes.is_empty());
        records.push(record);
    }
    assert_eq!(engine.store().pending_count().unwrap(), 5);
    assert_eq!(engine.value(&table, &records[3], &b).unwrap(), CellValue::Null);

    let mut worker = OutboxWorker::new(engine);
    assert_eq!(worker.run_once("w1", 10).unwrap(), 5);
    assert_eq!(worker.run_once("w1", 10).unwrap(), 0);

    let engine = worker.into_engine();
    assert_eq!(engine.store().pending_count().unwrap(), 0);
    assert_eq!(engine.value(&table, &records[3], &b).unwrap(), CellValue::Number(30.0));
}

#[test]
fn batches_respect_the_limit() {
    let mut engine = Engine::open(outbox_config()).unwrap();
    let (table, a, _) = items(&mut engine);
    for i in 0..3 {
        engine
            .create_record(&table, vec![(a.clone(), (i as f64).into())])
            .unwrap();
    }
    let mut worker = OutboxWorker::new(engine);
    assert_eq!(worker.run_once("w1", 2).unwrap(), 2);
    assert_eq!(worker.run_once("w1", 2).unwrap(), 1);
}

#[test]
fn drain_empties_the_queue() {
    let mut engine = Engine::open(EngineConfig {
        outbox_batch_size: 2,
        ..outbox_config()
    })
    .unwrap();
    let (table, a, b) = items(&mut engine);
    let (record, _) = engine.create_record(&table, vec![(a.clone(), 1.0.into())]).unwrap();
    engine.update_record(&table, &record, vec![(a.clone(), 2.0.into())]).unwrap();
    engine.update_record(&table, &record, vec![(a.clone(), 3.0.into())]).unwrap();

    assert_eq!(engine.drain_outbox().unwrap(), 3);
    assert_eq!(engine.store().pending_count().unwrap(), 0);
    assert_eq!(engine.value(&table, &record, &b).unwrap(), CellValue::Number(30.0));
}

#[test]
fn link_changes_queue_both_sides() {
    let mut engine = Engine::open(outbox_config()).unwrap();
    let customers = engine.create_table("Customers").unwrap();
    let orders = engine.create_table("Orders").unwrap();
    let title = engine
        .schema()
        .table(&orders)
        .and_then(|t| t.primary_field())
        .map(|f| f.id.clone())
        .unwrap();
    let link = Field::link("Orders", Relationship::ManyMany, orders.clone(), title);
    let link_id = link.id.clone();
    engine.create_field(&customers, link).unwrap();

    let (customer, _) = engine.create_record(&customers, vec![]).unwrap();
    let (first, _) = engine.create_record(&orders, vec![]).unwrap();
    let (second, _) = engine.create_record(&orders, vec![]).unwrap();
    engine.drain_outbox().unwrap();

    engine
        .set_link(&customers, &customer, &link_id, vec![first, second])
        .unwrap();
    assert_eq!(engine.store().pending_count().unwrap(), 3);
    assert_eq!(engine.value(&customers, &customer, &link_id).unwrap(), CellValue::Null);

    engine.drain_outbox().unwrap();
    let value = engine.value(&customers, &customer, &link_id).unwrap();
    assert_eq!(value.link_ids().len(), 2);
}

#[tokio::test]
async fn runner_processes_writes_from_another_connection() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        db_path: dir.path().join("cellflow.db").to_string_lossy().into_owned(),
        ..outbox_config()
    };
    let mut writer = Engine::open(config.clone()).unwrap();
    let (table, a, b) = items(&mut writer);

    let worker = OutboxWorker::new(Engine::open(config).unwrap());
    let runner = OutboxRunner::spawn(worker, Some("bg".to_string()));

    let (record, _) = writer.create_record(&table, vec![(a.clone(), 4.0.into())]).unwrap();
    let mut computed = CellValue::Null;
    for _ in 0..200 {
        computed = writer.value(&table, &record, &b).unwrap();
        if !computed.is_null() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(computed, CellValue::Number(40.0));

    let worker = runner.shutdown().await.unwrap();
    assert_eq!(worker.engine().store().pending_count().unwrap(), 0);
}
