//! End-to-end dumps against a scripted server
//!
//! Each test wires a `Dumper` out of the mock provider, an in-memory store
//! and a recording writer, then asserts on the produced task stream and the
//! statements the engine sent.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    row, rs, FakeCoordinator, MemoryStorage, MockProvider, MockScript, RecordingWriter,
    WriterEvent,
};
use quarry::config::{Config, Consistency};
use quarry::dump::Dumper;
use quarry::safepoint::Coordinator;

/// Script the boilerplate of a one-table MySQL server `d.t(a INT PK)` with
/// three rows.
fn mysql_single_table_script() -> Arc<MockScript> {
    let script = MockScript::new();
    script
        .on("SELECT version()", rs(&[("version()", "varchar")], &[&row(&["8.0.32"])]))
        .on(
            "SHOW MASTER STATUS",
            rs(
                &[("File", "varchar"), ("Position", "bigint")],
                &[&row(&["binlog.000002", "68737"])],
            ),
        )
        .on(
            "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE FROM information_schema.tables",
            rs(
                &[("TABLE_SCHEMA", "varchar"), ("TABLE_NAME", "varchar"), ("TABLE_TYPE", "varchar")],
                &[&row(&["d", "t", "BASE TABLE"])],
            ),
        )
        .on(
            "SHOW CREATE DATABASE IF NOT EXISTS `d`",
            rs(
                &[("Database", "varchar"), ("Create Database", "varchar")],
                &[&row(&["d", "CREATE DATABASE `d`"])],
            ),
        )
        .on(
            "SELECT COLUMN_NAME, DATA_TYPE, EXTRA FROM information_schema.columns WHERE TABLE_SCHEMA = 'd' AND TABLE_NAME = 't'",
            rs(
                &[("COLUMN_NAME", "varchar"), ("DATA_TYPE", "varchar"), ("EXTRA", "varchar")],
                &[&row(&["a", "int", ""])],
            ),
        )
        .on(
            "SHOW CREATE TABLE `d`.`t`",
            rs(
                &[("Table", "varchar"), ("Create Table", "varchar")],
                &[&row(&["t", "CREATE TABLE `t` (`a` int NOT NULL, PRIMARY KEY (`a`))"])],
            ),
        )
        .on(
            "SELECT * FROM `d`.`t`",
            rs(&[("a", "int")], &[&row(&["1"]), &row(&["2"]), &row(&["3"])]),
        );
    script
}

fn single_table_config() -> Config {
    Config {
        databases: vec!["d".to_string()],
        threads: 1,
        consistency: Consistency::Flush,
        ..Default::default()
    }
}

async fn build_dumper(
    script: &Arc<MockScript>,
    config: Config,
    storage: &Arc<MemoryStorage>,
    writer: &Arc<RecordingWriter>,
    coordinator: Option<Arc<dyn Coordinator>>,
) -> Dumper {
    Dumper::with_components(
        config,
        MockProvider::new(script.clone()),
        storage.clone(),
        writer.clone(),
        coordinator,
    )
    .await
    .expect("dumper init")
}

#[tokio::test]
async fn test_small_table_flush_dump() {
    let script = mysql_single_table_script();
    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    let mut dumper =
        build_dumper(&script, single_table_config(), &storage, &writer, None).await;

    dumper.dump().await.expect("dump");
    dumper.close().await.unwrap();

    // Schema tasks precede the single data chunk
    assert_eq!(
        writer.events(),
        vec![
            WriterEvent::Database("d".to_string()),
            WriterEvent::Table("d".to_string(), "t".to_string()),
            WriterEvent::Data {
                database: "d".to_string(),
                table: "t".to_string(),
                chunk_index: 0,
                total_chunks: 1,
                row_count: 3,
            },
        ]
    );

    // The global read lock was taken and released exactly once, even though
    // teardown runs both early (transactional consistency) and on exit
    assert_eq!(script.count_statements("FLUSH TABLES WITH READ LOCK"), 1);
    assert_eq!(script.count_statements("UNLOCK TABLES"), 1);

    // Worker connections started consistent-snapshot transactions
    assert!(script.count_statements("START TRANSACTION") >= 1);

    // Metadata artifact written on success
    let metadata = storage.object("metadata").expect("metadata artifact");
    assert!(metadata.contains("Log: binlog.000002"));
    assert!(metadata.contains("Pos: 68737"));
    assert!(metadata.contains("Finished dump at:"));
}

#[tokio::test]
async fn test_multi_table_ordering_and_chunk_totals() {
    let script = mysql_single_table_script();
    // Add a second, chunkable table t2 with an integer primary key
    script
        .on(
            "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE FROM information_schema.tables",
            rs(
                &[("TABLE_SCHEMA", "varchar"), ("TABLE_NAME", "varchar"), ("TABLE_TYPE", "varchar")],
                &[&row(&["d", "t", "BASE TABLE"]), &row(&["d", "t2", "BASE TABLE"])],
            ),
        )
        .on(
            "SELECT COLUMN_NAME, DATA_TYPE, EXTRA FROM information_schema.columns WHERE TABLE_SCHEMA = 'd' AND TABLE_NAME = 't2'",
            rs(
                &[("COLUMN_NAME", "varchar"), ("DATA_TYPE", "varchar"), ("EXTRA", "varchar")],
                &[&row(&["id", "int", ""])],
            ),
        )
        .on(
            "SELECT COLUMN_NAME, DATA_TYPE, COLUMN_KEY FROM information_schema.columns WHERE TABLE_SCHEMA = 'd' AND TABLE_NAME = 't2'",
            rs(
                &[("COLUMN_NAME", "varchar"), ("DATA_TYPE", "varchar"), ("COLUMN_KEY", "varchar")],
                &[&row(&["id", "int", "PRI"])],
            ),
        )
        .on(
            "SELECT COLUMN_NAME, DATA_TYPE, COLUMN_KEY FROM information_schema.columns WHERE TABLE_SCHEMA = 'd' AND TABLE_NAME = 't'",
            rs(
                &[("COLUMN_NAME", "varchar"), ("DATA_TYPE", "varchar"), ("COLUMN_KEY", "varchar")],
                &[&row(&["a", "int", "PRI"])],
            ),
        )
        .on(
            "SHOW CREATE TABLE `d`.`t2`",
            rs(
                &[("Table", "varchar"), ("Create Table", "varchar")],
                &[&row(&["t2", "CREATE TABLE `t2` (`id` int NOT NULL, PRIMARY KEY (`id`))"])],
            ),
        )
        .on(
            "SELECT MIN(`id`), MAX(`id`) FROM `d`.`t2`",
            rs(&[("MIN(`id`)", "int"), ("MAX(`id`)", "int")], &[&row(&["1", "500"])]),
        )
        .on(
            "EXPLAIN SELECT * FROM `d`.`t2`",
            rs(&[("rows", "bigint")], &[&row(&["500"])]),
        )
        .on(
            "SELECT MIN(`a`), MAX(`a`) FROM `d`.`t`",
            rs(&[("MIN(`a`)", "int"), ("MAX(`a`)", "int")], &[&row(&["1", "3"])]),
        )
        .on(
            "EXPLAIN SELECT * FROM `d`.`t`",
            rs(&[("rows", "bigint")], &[&row(&["3"])]),
        )
        .on("SELECT * FROM `d`.`t2`", rs(&[("id", "int")], &[&row(&["1"])]));

    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    let config = Config {
        rows: Some(100),
        ..single_table_config()
    };
    let mut dumper = build_dumper(&script, config, &storage, &writer, None).await;
    dumper.dump().await.expect("dump");
    dumper.close().await.unwrap();

    let events = writer.events();

    // Database meta precedes every task of the database
    assert_eq!(events[0], WriterEvent::Database("d".to_string()));

    // Per table: the meta task precedes all of its data tasks, and every
    // data task of a table reports the same total
    for table in ["t", "t2"] {
        let meta_at = events
            .iter()
            .position(|e| *e == WriterEvent::Table("d".to_string(), table.to_string()))
            .expect("table meta event");
        let data_positions: Vec<usize> = events
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                WriterEvent::Data { table: t, .. } if t == table => Some(i),
                _ => None,
            })
            .collect();
        assert!(!data_positions.is_empty());
        assert!(data_positions.iter().all(|i| *i > meta_at));
    }

    // t2 split into 5 chunks, each reporting the emitted total
    let t2_chunks: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            WriterEvent::Data {
                table,
                chunk_index,
                total_chunks,
                ..
            } if table == "t2" => Some((*chunk_index, *total_chunks)),
            _ => None,
        })
        .collect();
    assert_eq!(t2_chunks.len(), 5);
    assert!(t2_chunks.iter().all(|(_, total)| *total == 5));
    let mut indices: Vec<usize> = t2_chunks.iter().map(|(i, _)| *i).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_raw_sql_mode_skips_enumeration() {
    let script = MockScript::new();
    script
        .on("SELECT version()", rs(&[("version()", "varchar")], &[&row(&["8.0.32"])]))
        .on("SELECT 1", rs(&[("1", "bigint")], &[&row(&["1"])]));

    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    let config = Config {
        sql: "SELECT 1".to_string(),
        consistency: Consistency::None,
        threads: 1,
        ..Default::default()
    };
    let mut dumper = build_dumper(&script, config, &storage, &writer, None).await;
    dumper.dump().await.expect("dump");
    dumper.close().await.unwrap();

    assert_eq!(
        writer.events(),
        vec![WriterEvent::Data {
            database: String::new(),
            table: "result".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            row_count: 1,
        }]
    );
    assert_eq!(script.count_statements("SHOW DATABASES"), 0);
    assert_eq!(
        script.count_statements("SELECT TABLE_SCHEMA"),
        0,
        "raw SQL mode must not enumerate the catalog"
    );
}

#[tokio::test]
async fn test_teardown_runs_on_chunker_failure() {
    let script = mysql_single_table_script();
    // Schema capture fails persistently: the dump must abort
    script.on_failing("SHOW CREATE TABLE `d`.`t`", 1000, rs(&[], &[]));

    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    let config = Config {
        // Keep the lock until the end so the exit path must release it
        transactional_consistency: false,
        ..single_table_config()
    };
    let mut dumper = build_dumper(&script, config, &storage, &writer, None).await;
    let result = dumper.dump().await;
    dumper.close().await.unwrap();

    assert!(result.is_err());
    assert_eq!(
        script.count_statements("UNLOCK TABLES"),
        1,
        "teardown must run on the error path"
    );
    // No metadata artifact after a failed dump
    assert!(storage.object("metadata").is_none());
}

#[tokio::test]
async fn test_worker_rebuilds_connection_when_permitted() {
    let script = mysql_single_table_script();
    // First data query breaks the connection, the retry succeeds
    script.on_failing(
        "SELECT * FROM `d`.`t`",
        1,
        rs(&[("a", "int")], &[&row(&["1"]), &row(&["2"]), &row(&["3"])]),
    );

    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    let config = Config {
        consistency: Consistency::None,
        ..single_table_config()
    };
    let mut dumper = build_dumper(&script, config, &storage, &writer, None).await;
    let opened_before = script.connections_opened();
    dumper.dump().await.expect("dump should survive one broken data connection");
    dumper.close().await.unwrap();

    // The chunk was written exactly once despite the retry
    let data_events = writer
        .events()
        .into_iter()
        .filter(|e| matches!(e, WriterEvent::Data { .. }))
        .count();
    assert_eq!(data_events, 1);

    // metadata conn + producer conn + worker conn + one rebuilt conn
    assert_eq!(script.connections_opened() - opened_before, 4);
}

#[tokio::test]
async fn test_worker_failure_fatal_under_transactional_flush() {
    let script = mysql_single_table_script();
    script.on_failing("SELECT * FROM `d`.`t`", 1, rs(&[("a", "int")], &[&row(&["1"])]));

    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    // flush + transactional consistency: a rebuilt connection would not
    // rejoin the released lock's snapshot, so the dump must fail
    let mut dumper =
        build_dumper(&script, single_table_config(), &storage, &writer, None).await;
    let result = dumper.dump().await;
    dumper.close().await.unwrap();

    let err = result.expect_err("broken connection must fail the dump");
    assert!(err.to_string().contains("injected connection failure"));
    assert!(storage.object("metadata").is_none());
}

#[tokio::test]
async fn test_tidb_init_acquires_snapshot_and_keeps_safepoint() {
    let script = MockScript::new();
    script
        .on(
            "SELECT version()",
            rs(&[("version()", "varchar")], &[&row(&["5.7.25-TiDB-v4.0.0"])]),
        )
        .on(
            "SELECT COUNT(1) FROM mysql.tidb",
            rs(&[("COUNT(1)", "bigint")], &[&row(&["1"])]),
        )
        .on(
            "SHOW MASTER STATUS",
            rs(
                &[("File", "varchar"), ("Position", "bigint")],
                &[&row(&["tidb-binlog", "424046456334851"])],
            ),
        );

    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    let coordinator = FakeCoordinator::new();
    let config = Config {
        databases: vec!["d".to_string()],
        threads: 1,
        ..Default::default()
    };
    let mut dumper = build_dumper(
        &script,
        config,
        &storage,
        &writer,
        Some(coordinator.clone()),
    )
    .await;

    // auto on TiDB resolves to snapshot, acquired from the server position
    assert_eq!(dumper.consistency_mode(), Consistency::Snapshot);
    assert_eq!(dumper.snapshot(), Some("424046456334851"));

    // The keeper heartbeats immediately on startup
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = coordinator.calls();
    assert!(!calls.is_empty(), "keeper should heartbeat at startup");
    let (service_id, ttl, safe_point) = &calls[0];
    assert!(service_id.starts_with("quarry_"));
    assert_eq!(*ttl, 300);
    assert_eq!(*safe_point, 424046456334851);

    dumper.close().await.unwrap();
}

#[tokio::test]
async fn test_lock_consistency_enumerates_before_locking() {
    let script = mysql_single_table_script();
    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    let config = Config {
        consistency: Consistency::Lock,
        ..single_table_config()
    };
    let mut dumper = build_dumper(&script, config, &storage, &writer, None).await;
    dumper.dump().await.expect("dump");
    dumper.close().await.unwrap();

    assert_eq!(script.count_statements("LOCK TABLES `d`.`t` READ"), 1);
    assert_eq!(script.count_statements("UNLOCK TABLES"), 1);
    // The pre-lock pass already enumerated; the regular pass must not redo it
    assert_eq!(script.count_statements("SELECT TABLE_SCHEMA"), 1);

    let statements = script.statements();
    let enumerate_at = statements
        .iter()
        .position(|s| s.starts_with("SELECT TABLE_SCHEMA"))
        .unwrap();
    let lock_at = statements
        .iter()
        .position(|s| s.starts_with("LOCK TABLES"))
        .unwrap();
    assert!(
        enumerate_at < lock_at,
        "lock consistency needs the table list before the lock statement"
    );
}

#[tokio::test]
async fn test_no_schemas_emits_data_only() {
    let script = mysql_single_table_script();
    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    let config = Config {
        no_schemas: true,
        ..single_table_config()
    };
    let mut dumper = build_dumper(&script, config, &storage, &writer, None).await;
    dumper.dump().await.expect("dump");
    dumper.close().await.unwrap();

    assert_eq!(
        writer.events(),
        vec![WriterEvent::Data {
            database: "d".to_string(),
            table: "t".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            row_count: 3,
        }]
    );
    assert_eq!(script.count_statements("SHOW CREATE"), 0);
}

#[tokio::test]
async fn test_no_data_emits_schema_only() {
    let script = mysql_single_table_script();
    let storage = MemoryStorage::new();
    let writer = RecordingWriter::new();
    let config = Config {
        no_data: true,
        ..single_table_config()
    };
    let mut dumper = build_dumper(&script, config, &storage, &writer, None).await;
    dumper.dump().await.expect("dump");
    dumper.close().await.unwrap();

    assert_eq!(
        writer.events(),
        vec![
            WriterEvent::Database("d".to_string()),
            WriterEvent::Table("d".to_string(), "t".to_string()),
        ]
    );
    assert_eq!(script.count_statements("SELECT * FROM"), 0);
}
