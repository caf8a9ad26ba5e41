// Crash-recovery scenarios across the persistence stack: full round trips,
// WAL replay after a simulated crash, and checkpoint truncation.

use std::path::Path;
use tierdb::common::{ColumnDef, DataType, Value};
use tierdb::storage::wal::WAL_ENTRY_HEADER_SIZE;
use tierdb::{CachedStore, DbError, PersistenceMode, StoreConfig};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn store_at(dir: &Path, mode: PersistenceMode) -> CachedStore {
    init_logging();
    CachedStore::new(StoreConfig {
        data_dir: dir.to_path_buf(),
        persistence_mode: mode,
        auto_tune_enabled: false,
        ..StoreConfig::default()
    })
    .unwrap()
}

fn users_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("id", DataType::Int).primary_key(),
        ColumnDef::new("name", DataType::Varchar).max_length(64),
    ]
}

#[test]
fn full_mode_round_trip_preserves_rows_in_order() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_at(dir.path(), PersistenceMode::Full);
        store.open().unwrap();
        store.create_table("users", users_columns()).unwrap();
        store
            .insert_row("users", vec![Value::Int(1), Value::Varchar("Alice".into())])
            .unwrap();
        store
            .insert_row("users", vec![Value::Int(2), Value::Varchar("Bob".into())])
            .unwrap();
        store.close().unwrap();
    }

    let store = store_at(dir.path(), PersistenceMode::Full);
    store.open().unwrap();
    assert_eq!(store.table_names(), vec!["users".to_string()]);
    let rows = store.select_rows("users", &[], None).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0].values,
        vec![Value::Int(1), Value::Varchar("Alice".into())]
    );
    assert_eq!(
        rows[1].values,
        vec![Value::Int(2), Value::Varchar("Bob".into())]
    );
    store.close().unwrap();
}

#[test]
fn wal_replay_recovers_unsaved_rows_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let seq_before;
    {
        let store = store_at(dir.path(), PersistenceMode::Full);
        store.open().unwrap();
        store.create_table("events", users_columns()).unwrap();
        seq_before = store.wal_sequence();
        for n in 0..10 {
            store
                .insert_row(
                    "events",
                    vec![Value::Int(n), Value::Varchar(format!("event-{}", n))],
                )
                .unwrap();
        }
        // Dropped without close(): nothing was saved, only WAL-logged.
        drop(store);
    }

    let store = store_at(dir.path(), PersistenceMode::Full);
    assert!(store.wal_sequence() > seq_before);
    store.open().unwrap();
    assert_eq!(store.row_count("events").unwrap(), 10);
    assert_eq!(store.persistence_stats().replayed_entries, 11); // create + 10 inserts
    let rows = store.select_rows("events", &[], None).unwrap();
    assert_eq!(rows[9].values[1], Value::Varchar("event-9".into()));
    store.close().unwrap();
}

#[test]
fn checkpoint_truncates_wal_and_skips_replay() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_at(dir.path(), PersistenceMode::Full);
        store.open().unwrap();
        store.create_table("items", users_columns()).unwrap();
        for n in 0..100 {
            store
                .insert_row(
                    "items",
                    vec![Value::Int(n), Value::Varchar(format!("item-{}", n))],
                )
                .unwrap();
        }
        store.checkpoint().unwrap();

        // Only the fresh checkpoint marker remains.
        assert_eq!(store.wal_logical_size(), WAL_ENTRY_HEADER_SIZE);
        assert_eq!(store.wal_sequence(), 2);
        assert_eq!(store.engine_stats().checkpoints, 1);
        store.close().unwrap();
    }

    let store = store_at(dir.path(), PersistenceMode::Full);
    store.open().unwrap();
    assert_eq!(store.persistence_stats().replayed_entries, 0);
    assert_eq!(store.row_count("items").unwrap(), 100);
    store.close().unwrap();
}

#[test]
fn checkpoint_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(dir.path(), PersistenceMode::Full);
    store.open().unwrap();
    store.create_table("t", users_columns()).unwrap();
    store
        .insert_row("t", vec![Value::Int(1), Value::Varchar("x".into())])
        .unwrap();

    store.checkpoint().unwrap();
    let size_after_first = store.wal_logical_size();
    store.checkpoint().unwrap();
    assert_eq!(store.wal_logical_size(), size_after_first);
    assert_eq!(store.row_count("t").unwrap(), 1);
    store.close().unwrap();
}

#[test]
fn memory_only_mode_loses_state_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_at(dir.path(), PersistenceMode::MemoryOnly);
        store.open().unwrap();
        store.create_table("t", users_columns()).unwrap();
        store
            .insert_row("t", vec![Value::Int(1), Value::Varchar("x".into())])
            .unwrap();
        store.close().unwrap();
    }
    let store = store_at(dir.path(), PersistenceMode::MemoryOnly);
    store.open().unwrap();
    assert!(store.table_names().is_empty());
    store.close().unwrap();
}

#[test]
fn wal_only_mode_recovers_from_log_alone() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_at(dir.path(), PersistenceMode::WalOnly);
        store.open().unwrap();
        store.create_table("t", users_columns()).unwrap();
        store
            .insert_row("t", vec![Value::Int(1), Value::Varchar("logged".into())])
            .unwrap();
        drop(store); // crash before any save
    }
    let store = store_at(dir.path(), PersistenceMode::WalOnly);
    store.open().unwrap();
    assert_eq!(store.row_count("t").unwrap(), 1);
    store.close().unwrap();
}

#[test]
fn deleted_and_updated_rows_survive_recovery() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_at(dir.path(), PersistenceMode::Full);
        store.open().unwrap();
        store.create_table("t", users_columns()).unwrap();
        for n in 0..5 {
            store
                .insert_row("t", vec![Value::Int(n), Value::Varchar(format!("v{}", n))])
                .unwrap();
        }
        store
            .update_rows(
                "t",
                &[("name".to_string(), Value::Varchar("renamed".into()))],
                Some(&tierdb::Condition::eq("id", Value::Int(2))),
            )
            .unwrap();
        store
            .delete_rows("t", Some(&tierdb::Condition::eq("id", Value::Int(4))))
            .unwrap();
        drop(store); // crash; recovery must replay insert/update/delete
    }

    let store = store_at(dir.path(), PersistenceMode::Full);
    store.open().unwrap();
    assert_eq!(store.row_count("t").unwrap(), 4);
    let renamed = store
        .select_rows("t", &[], Some(&tierdb::Condition::eq("id", Value::Int(2))))
        .unwrap();
    assert_eq!(renamed[0].values[1], Value::Varchar("renamed".into()));
    let gone = store
        .select_rows("t", &[], Some(&tierdb::Condition::eq("id", Value::Int(4))))
        .unwrap();
    assert!(gone.is_empty());
    store.close().unwrap();
}

#[test]
fn corrupted_data_file_header_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_at(dir.path(), PersistenceMode::Full);
        store.open().unwrap();
        store.create_table("t", users_columns()).unwrap();
        store.close().unwrap();
    }
    let path = dir.path().join("database.rdb");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[30] ^= 0xA5;
    std::fs::write(&path, &bytes).unwrap();

    let err = CachedStore::new(StoreConfig {
        data_dir: dir.path().to_path_buf(),
        auto_tune_enabled: false,
        ..StoreConfig::default()
    })
    .unwrap_err();
    assert!(matches!(err, DbError::Corruption(_)));
}
