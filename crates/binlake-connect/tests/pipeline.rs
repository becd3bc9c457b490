//! End-to-end pipeline tests: snapshot → binlog → loader → memory warehouse.
//!
//! Run with: cargo test -p binlake-connect --test pipeline

mod common;

use binlake_cdc::testing::{BinlogBuilder, BinlogColumn, BinlogValue};
use binlake_cdc::{CdcError, CheckpointBackend, LogPosition, SnapshotPhase, TableCheckpoint};
use binlake_connect::destination::DestinationOp;
use binlake_connect::{BatchConfig, LoadStatus, TableStatus};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

fn loads_of(ops: &[DestinationOp], table: &binlake_connect::DestinationTable) -> Vec<(String, usize, LoadStatus)> {
    ops.iter()
        .filter_map(|op| match op {
            DestinationOp::Load {
                table: t,
                label,
                rows,
                status,
            } if t == table => Some((label.clone(), *rows, *status)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_snapshot_then_updates_and_delete() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let watermark = b.position(b.offset());
    let txn = b.begin_txn(7, &orders(), &columns());
    b.update_rows(
        7,
        &columns(),
        &[
            (row(1, "r1"), row(1, "u1")),
            (row(2, "r2"), row(2, "u2")),
            (row(3, "r3"), row(3, "u3")),
        ],
    );
    b.xid(1);
    let txn2 = b.begin_txn(7, &orders(), &columns());
    b.delete_rows(7, &columns(), &[row(10, "r10")]);
    b.xid(2);

    let h = Harness::new(watermark.clone());
    h.binlog.add(&b);
    h.snapshot.add_table(
        schema(orders()),
        (1..=10).map(|i| json_row(i, &format!("r{}", i))).collect(),
    );

    let report = h.run(config(&[orders()])).await;
    assert!(!report.needs_attention(), "{:?}", report);
    assert_eq!(report.snapshot_rows, 10);
    assert_eq!(report.snapshot_phase, Some(SnapshotPhase::Streaming));

    let rows = h.rows_by_id(&orders());
    assert_eq!(rows.len(), 9);
    assert_eq!(rows[&1]["note"], json!("u1"));
    assert_eq!(rows[&2]["note"], json!("u2"));
    assert_eq!(rows[&3]["note"], json!("u3"));
    assert_eq!(rows[&9]["note"], json!("r9"));
    assert!(!rows.contains_key(&10));

    let table = report.table(&orders()).unwrap();
    assert_eq!(table.status, TableStatus::Streaming);
    assert!(table.checkpoint.is_streaming());
    assert_eq!(table.checkpoint.watermark, Some(watermark));
    assert_eq!(table.checkpoint.committed, Some(LogPosition::at(FILE, txn2, 3, 0)));
    assert!(table.checkpoint.committed > Some(LogPosition::at(FILE, txn, 3, 2)));
    assert_eq!(table.stats.events, 14);
}

#[tokio::test]
async fn test_added_column_is_altered_before_rows_load() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let watermark = b.position(b.offset());
    b.gtid(1);
    b.query("shop", "ALTER TABLE orders ADD COLUMN c INT NULL");
    let mut wide = columns();
    wide.push(BinlogColumn::long());
    let txn = b.begin_txn(7, &orders(), &wide);
    b.write_rows(
        7,
        &wide,
        &[vec![BinlogValue::Int(3), BinlogValue::text("new"), BinlogValue::Int(9)]],
    );
    b.xid(1);

    let h = Harness::new(watermark);
    h.binlog.add(&b);
    h.snapshot
        .add_table(schema(orders()), vec![json_row(1, "a"), json_row(2, "b")]);
    h.destination.create_table(dest(&orders()), ["id", "note"]);

    let report = h.run(config(&[orders()])).await;
    assert!(!report.needs_attention(), "{:?}", report);

    let ops = h.destination.operations();
    let alter = ops
        .iter()
        .position(|op| matches!(op, DestinationOp::Alter { .. }))
        .expect("alter issued");
    let last_load = ops
        .iter()
        .rposition(|op| matches!(op, DestinationOp::Load { .. }))
        .unwrap();
    assert!(alter < last_load);
    assert!(matches!(&ops[alter], DestinationOp::Alter { changes, .. } if changes.len() == 1));

    let rows = h.rows_by_id(&orders());
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[&3]["c"], json!(9));
    assert!(h.destination.columns(&dest(&orders())).unwrap().contains("c"));

    let table = report.table(&orders()).unwrap();
    assert_eq!(table.stats.alters, 1);
    assert_eq!(table.checkpoint.committed, Some(LogPosition::at(FILE, txn, 3, 0)));
    let stored = table.checkpoint.schema.as_ref().unwrap();
    assert_eq!(stored.version, 2);
    assert!(stored.column("c").is_some());
}

#[tokio::test]
async fn test_dropped_column_pauses_only_that_table() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let watermark = b.position(b.offset());
    let ddl = b.gtid(1);
    b.query("shop", "ALTER TABLE orders DROP COLUMN note");
    let narrow = vec![BinlogColumn::long()];
    b.insert_txn(7, &orders(), &narrow, &[vec![BinlogValue::Int(5)]]);
    b.insert_txn(8, &customers(), &columns(), &[row(100, "alice")]);

    let h = Harness::new(watermark);
    h.binlog.add(&b);
    h.snapshot.add_table(schema(orders()), vec![json_row(1, "a")]);
    h.snapshot.add_table(schema(customers()), vec![json_row(1, "bob")]);

    let report = h.run(config(&[orders(), customers()])).await;
    assert!(report.needs_attention());

    let paused = report.table(&orders()).unwrap();
    assert!(matches!(paused.status, TableStatus::Paused { .. }));
    match &paused.schema_error {
        Some(CdcError::UnsupportedSchemaChange { table, position, .. }) => {
            assert_eq!(table, &orders());
            assert_eq!(position, &LogPosition::at(FILE, ddl, 1, 0));
        }
        other => panic!("expected an unsupported schema change, got {:?}", other),
    }
    assert_eq!(h.rows_by_id(&orders()).len(), 1);

    let stored = h.checkpoints.load_table(&orders()).await.unwrap().unwrap();
    assert_eq!(
        stored.paused.map(|p| p.position),
        Some(LogPosition::at(FILE, ddl, 1, 0))
    );

    let running = report.table(&customers()).unwrap();
    assert_eq!(running.status, TableStatus::Streaming);
    assert_eq!(h.rows_by_id(&customers()).len(), 2);
}

#[tokio::test]
async fn test_recreated_table_pauses_without_stopping_the_others() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let watermark = b.position(b.offset());
    let drop = b.gtid(1);
    b.query("shop", "DROP TABLE orders");
    b.gtid(2);
    b.query("shop", "CREATE TABLE orders LIKE template");
    let narrow = vec![BinlogColumn::long()];
    b.insert_txn(7, &orders(), &narrow, &[vec![BinlogValue::Int(5)]]);
    b.insert_txn(8, &customers(), &columns(), &[row(100, "alice")]);

    let h = Harness::new(watermark);
    h.binlog.add(&b);
    h.snapshot.add_table(schema(orders()), vec![json_row(1, "a")]);
    h.snapshot.add_table(schema(customers()), vec![json_row(1, "bob")]);

    let report = h.run(config(&[orders(), customers()])).await;
    assert!(report.source_error.is_none(), "{:?}", report.source_error);

    let paused = report.table(&orders()).unwrap();
    assert!(matches!(paused.status, TableStatus::Paused { .. }), "{:?}", paused.status);
    let stored = h.checkpoints.load_table(&orders()).await.unwrap().unwrap();
    assert_eq!(
        stored.paused.map(|p| p.position),
        Some(LogPosition::at(FILE, drop, 1, 0))
    );
    assert_eq!(h.rows_by_id(&orders()).len(), 1);

    let running = report.table(&customers()).unwrap();
    assert_eq!(running.status, TableStatus::Streaming);
    assert_eq!(h.rows_by_id(&customers()).len(), 2);
}

#[tokio::test]
async fn test_table_level_ddl_pauses_only_that_table() {
    for ddl in [
        "TRUNCATE TABLE orders",
        "RENAME TABLE orders TO orders_old, orders_new TO orders",
        "ALTER TABLE orders ADD COLUMN c varchar(10",
    ] {
        let mut b = BinlogBuilder::new(FILE);
        b.format_description();
        let watermark = b.position(b.offset());
        b.gtid(1);
        b.query("shop", ddl);
        b.insert_txn(7, &orders(), &columns(), &[row(5, "after")]);
        b.insert_txn(8, &customers(), &columns(), &[row(100, "alice")]);

        let h = Harness::new(watermark);
        h.binlog.add(&b);
        h.snapshot.add_table(schema(orders()), vec![json_row(1, "a")]);
        h.snapshot.add_table(schema(customers()), vec![json_row(1, "bob")]);

        let report = h.run(config(&[orders(), customers()])).await;
        assert!(report.source_error.is_none(), "{}: {:?}", ddl, report.source_error);
        assert!(
            matches!(report.table(&orders()).unwrap().status, TableStatus::Paused { .. }),
            "{}: {:?}",
            ddl,
            report.table(&orders()).unwrap().status
        );
        assert_eq!(h.rows_by_id(&orders()).len(), 1, "{}", ddl);
        assert_eq!(report.table(&customers()).unwrap().status, TableStatus::Streaming, "{}", ddl);
        assert_eq!(h.rows_by_id(&customers()).len(), 2, "{}", ddl);
    }
}

#[tokio::test]
async fn test_rows_that_no_longer_fit_fail_only_their_table() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let watermark = b.position(b.offset());
    // the layout changed without a DDL event the tracker could follow
    let narrow = vec![BinlogColumn::long()];
    b.insert_txn(7, &orders(), &narrow, &[vec![BinlogValue::Int(5)]]);
    b.insert_txn(8, &customers(), &columns(), &[row(100, "alice")]);

    let h = Harness::new(watermark);
    h.binlog.add(&b);
    h.snapshot.add_table(schema(orders()), vec![json_row(1, "a")]);
    h.snapshot.add_table(schema(customers()), vec![json_row(1, "bob")]);

    let report = h.run(config(&[orders(), customers()])).await;
    assert!(report.source_error.is_none(), "{:?}", report.source_error);
    match &report.table(&orders()).unwrap().status {
        TableStatus::Failed { reason } => assert!(reason.contains("columns"), "{}", reason),
        other => panic!("expected orders to fail, got {:?}", other),
    }
    assert_eq!(h.rows_by_id(&orders()).len(), 1);
    assert_eq!(report.table(&customers()).unwrap().status, TableStatus::Streaming);
    assert_eq!(h.rows_by_id(&customers()).len(), 2);
}

#[tokio::test]
async fn test_paused_table_resumes_after_resolution() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let watermark = b.position(b.offset());
    let ddl = b.gtid(1);
    b.query("shop", "ALTER TABLE orders DROP COLUMN note");
    let narrow = vec![BinlogColumn::long()];
    b.insert_txn(7, &orders(), &narrow, &[vec![BinlogValue::Int(5)]]);

    let h = Harness::new(watermark);
    h.binlog.add(&b);
    h.snapshot.add_table(schema(orders()), vec![json_row(1, "a")]);

    let first = h.run(config(&[orders()])).await;
    assert!(matches!(
        first.table(&orders()).unwrap().status,
        TableStatus::Paused { .. }
    ));

    // a second run without resolution leaves the table alone
    let again = h.run(config(&[orders()])).await;
    assert!(matches!(
        again.table(&orders()).unwrap().status,
        TableStatus::Paused { .. }
    ));
    assert_eq!(h.rows_by_id(&orders()).len(), 1);

    let mut cp = h.checkpoints.load_table(&orders()).await.unwrap().unwrap();
    cp.resolve(LogPosition::at(FILE, ddl, 1, 0));
    h.checkpoints.save_table(&cp).await.unwrap();

    let resumed = h.run(config(&[orders()])).await;
    let table = resumed.table(&orders()).unwrap();
    assert_eq!(table.status, TableStatus::Streaming, "{:?}", resumed);
    assert!(table.checkpoint.paused.is_none());
    assert_eq!(h.rows_by_id(&orders())[&5]["id"], json!(5));
    assert_eq!(h.destination.rows(&dest(&orders())).len(), 2);
    assert_eq!(h.snapshot.begins(), 1);
}

#[tokio::test]
async fn test_handoff_has_no_duplicates_or_gaps() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    // committed to the snapshot already
    b.insert_txn(7, &orders(), &columns(), &[row(1, "a")]);
    b.insert_txn(8, &customers(), &columns(), &[row(100, "early")]);
    let watermark = b.position(b.offset());
    b.insert_txn(7, &orders(), &columns(), &[row(11, "k")]);
    let txn = b.begin_txn(7, &orders(), &columns());
    b.update_rows(7, &columns(), &[(row(1, "a"), row(1, "z"))]);
    b.xid(3);
    b.insert_txn(8, &customers(), &columns(), &[row(101, "late")]);

    let h = Harness::new(watermark.clone());
    h.binlog.add(&b);
    h.snapshot.add_table(
        schema(orders()),
        (1..=10).map(|i| json_row(i, if i == 1 { "a" } else { "s" })).collect(),
    );
    h.snapshot.add_table(schema(customers()), vec![]);
    // customers streams from the start of the log, orders is snapshotted
    h.checkpoints
        .save_table(&TableCheckpoint::streaming_from(customers(), LogPosition::new(FILE, 4)))
        .await
        .unwrap();

    let report = h.run(config(&[orders(), customers()])).await;
    assert!(!report.needs_attention(), "{:?}", report);
    assert_eq!(h.binlog.opens()[0], LogPosition::new(FILE, 4));

    let orders_report = report.table(&orders()).unwrap();
    // 10 snapshot rows, one insert and one update past the watermark
    assert_eq!(orders_report.stats.events, 12);
    assert_eq!(orders_report.checkpoint.watermark, Some(watermark));
    assert_eq!(orders_report.checkpoint.committed, Some(LogPosition::at(FILE, txn, 3, 0)));

    let rows = h.rows_by_id(&orders());
    assert_eq!(rows.len(), 11);
    assert_eq!(rows[&1]["note"], json!("z"));
    assert_eq!(rows[&11]["note"], json!("k"));

    let customers_rows = h.rows_by_id(&customers());
    assert_eq!(customers_rows.keys().copied().collect::<Vec<_>>(), vec![100, 101]);
    assert_eq!(report.table(&customers()).unwrap().stats.events, 2);
}

#[tokio::test]
async fn test_restart_with_pending_batch_reuses_its_label() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let start = b.position(b.offset());
    let txn = b.insert_txn(7, &orders(), &columns(), &[row(1, "a"), row(2, "b")]);

    let h = Harness::new(start.clone());
    h.binlog.add(&b);
    h.snapshot.add_table(schema(orders()), vec![]);

    let first_run = config(&[orders()])
        .with_startup(streaming(&start))
        .with_batch(BatchConfig::builder().label_prefix("run1").build());
    let report = h.run(first_run).await;
    assert!(!report.needs_attention(), "{:?}", report);
    let ops = h.destination.operations();
    let loads = loads_of(&ops, &dest(&orders()));
    assert_eq!(loads.len(), 1);
    let (label, rows, _) = loads[0].clone();
    assert_eq!(rows, 2);

    // crash between the load and the checkpoint update
    let mut cp = TableCheckpoint::streaming_from(orders(), start.clone());
    cp.schema = Some(schema(orders()));
    cp.begin_batch(binlake_cdc::common::PendingBatch {
        label: label.clone(),
        first: LogPosition::at(FILE, txn.offset, 3, 0),
        last: LogPosition::at(FILE, txn.offset, 3, 1),
        events: 2,
    });
    h.checkpoints.save_table(&cp).await.unwrap();

    let second_run = config(&[orders()])
        .with_startup(streaming(&start))
        .with_batch(BatchConfig::builder().label_prefix("run2").build());
    let report = h.run(second_run).await;
    let table = report.table(&orders()).unwrap();
    assert_eq!(table.stats.already_applied, 1);
    assert!(table.checkpoint.pending.is_none());
    assert_eq!(table.checkpoint.committed, Some(LogPosition::at(FILE, txn.offset, 3, 1)));

    let ops = h.destination.operations();
    let loads = loads_of(&ops, &dest(&orders()));
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[1], (label, 0, LoadStatus::AlreadyApplied));
    assert_eq!(h.rows_by_id(&orders()).len(), 2);
}

#[tokio::test]
async fn test_connection_drop_mid_stream_loses_nothing() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let start = b.position(b.offset());
    b.begin_txn(7, &orders(), &columns());
    b.write_rows(7, &columns(), &[row(1, "a")]);
    let second = b.write_rows(7, &columns(), &[row(2, "b")]);
    b.xid(1);
    b.insert_txn(7, &orders(), &columns(), &[row(3, "c")]);

    let h = Harness::new(start.clone());
    h.binlog.add(&b);
    h.binlog.disconnect_before(FILE, second);
    h.snapshot.add_table(schema(orders()), vec![]);

    let report = h
        .run(
            config(&[orders()])
                .with_startup(streaming(&start))
                .with_batch(BatchConfig::builder().max_events(1).build()),
        )
        .await;
    assert!(!report.needs_attention(), "{:?}", report);
    assert_eq!(report.stream.as_ref().unwrap().reconnects, 1);
    assert_eq!(h.binlog.opens().len(), 2);

    let ids: Vec<i64> = h.rows_by_id(&orders()).keys().copied().collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(report.table(&orders()).unwrap().stats.events, 3);
}

#[tokio::test]
async fn test_retry_budget_spent_reports_label() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let start = b.position(b.offset());
    b.insert_txn(7, &orders(), &columns(), &[row(1, "a")]);

    let h = Harness::new(start.clone());
    h.binlog.add(&b);
    h.snapshot.add_table(schema(orders()), vec![]);
    h.destination.fail_next_loads(100);

    let report = h
        .run(
            config(&[orders()])
                .with_startup(streaming(&start))
                .with_batch(BatchConfig::builder().retry(fast_retry(2)).build()),
        )
        .await;
    assert!(report.needs_attention());

    let table = report.table(&orders()).unwrap();
    assert!(matches!(table.status, TableStatus::Failed { .. }));
    let err = table.load_error.as_ref().expect("load error");
    assert_eq!(err.attempts, 3);
    assert_eq!(h.destination.load_attempts(), 3);

    let stored = h.checkpoints.load_table(&orders()).await.unwrap().unwrap();
    assert_eq!(stored.pending.as_ref().map(|p| p.label.clone()), Some(err.label.clone()));
    assert_eq!(stored.resume_position(), Some(&start));
}

#[tokio::test]
async fn test_shutdown_stops_without_flushing() {
    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let start = b.position(b.offset());
    b.insert_txn(7, &orders(), &columns(), &[row(1, "a")]);

    let h = Harness::new(start.clone());
    h.binlog.add(&b);
    h.snapshot.add_table(schema(orders()), vec![]);

    let shutdown = tokio_util::sync::CancellationToken::new();
    shutdown.cancel();
    let report = h
        .pipeline(
            config(&[orders()])
                .with_startup(streaming(&start))
                .with_batch(BatchConfig::builder().max_delay(Duration::from_secs(60)).build()),
        )
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(report.table(&orders()).unwrap().status, TableStatus::Stopped);
    assert_eq!(h.destination.row_count(&dest(&orders())), 0);
    let stored = h.checkpoints.load_table(&orders()).await.unwrap().unwrap();
    assert_eq!(stored.resume_position(), Some(&start));
}
