// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests.
//!
//! Requires TEST_DATABASE_URL pointing at a disposable database; skipped otherwise.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use tidepool_core::cache::{
    CheckpointCommand, CheckpointWorker, CheckpointWorkerConfig, Partitioner, Table,
};
use tidepool_core::store::{CheckpointStore, PostgresStore};

async fn connect() -> Arc<PostgresStore> {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL not set");
    Arc::new(
        PostgresStore::connect(&url, Duration::from_secs(10), "tidepool-test")
            .await
            .expect("Failed to connect to test database"),
    )
}

/// Table name unique to one test run, so runs against a shared database do not collide.
fn unique_table(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_checkpoint_round_trip() {
    skip_if_no_db!();
    init_tracing();

    let store = connect().await;
    assert!(store.health_check().await.unwrap());

    let name = unique_table("Values");
    let engine = reopen(store.clone(), 4).await;
    let table: Table<String, i64> = engine.register_table(&name, Partitioner::Hashed).unwrap();
    let worker = CheckpointWorker::new(engine.clone(), CheckpointWorkerConfig::default());

    let mut tx = engine.start_transaction(None);
    tx.create(&table, "a".to_string(), 1).unwrap();
    tx.create(&table, "b".to_string(), 2).unwrap();
    tx.commit().unwrap();
    let first = worker.checkpoint_once().await.unwrap().unwrap();

    let mut tx = engine.start_transaction(None);
    tx.delete(&table, "a".to_string()).unwrap();
    tx.update(&table, "b".to_string(), 20).unwrap();
    tx.commit().unwrap();
    let second = worker.checkpoint_once().await.unwrap().unwrap();
    assert_eq!(second.0, first.0 + 1);

    let rows = store.scan_table(&name).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, "\"b\"");
    assert_eq!(rows[0].value, json!(20));

    let recovered = store.recover().await.unwrap();
    assert!(recovered.last_checkpoint_id >= Some(second));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_rewriting_a_checkpoint_is_idempotent() {
    skip_if_no_db!();

    let store = connect().await;
    let name = unique_table("Notes");
    let engine = reopen(store.clone(), 2).await;
    let table: Table<String, String> = engine
        .register_table(&name, Partitioner::Single(1))
        .unwrap();

    let mut tx = engine.start_transaction(None);
    tx.create(&table, "k".to_string(), "v".to_string()).unwrap();
    tx.commit().unwrap();

    let mut command = CheckpointCommand::new();
    engine.collect_next_checkpoint(&mut command).unwrap();
    store.write_checkpoint(&command).await.unwrap();
    store.write_checkpoint(&command).await.unwrap();

    let rows = store.scan_table(&name).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].partition, 1);
    assert_eq!(
        store.load_row(&name, 1, "\"k\"").await.unwrap(),
        Some(json!("v"))
    );
}
