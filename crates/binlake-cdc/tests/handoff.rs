//! Snapshot, checkpoint and change stream working together the way a
//! loader drives them across restarts.

mod common;

use async_trait::async_trait;
use binlake_cdc::common::SnapshotSink;
use binlake_cdc::testing::{BinlogBuilder, MemoryBinlog, MemorySnapshotSource};
use binlake_cdc::{
    CdcEvent, CdcOp, ChangeStream, CheckpointBackend, CheckpointStore, HandoffFilter, LogPosition,
    Result, SchemaTracker, SnapshotConfig, SnapshotCoordinator, StreamConfig, TableCheckpoint,
    TableId,
};
use common::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Collect {
    events: Mutex<Vec<CdcEvent>>,
    completed: Mutex<Vec<(TableId, LogPosition)>>,
}

#[async_trait]
impl SnapshotSink for Collect {
    async fn emit(&self, event: CdcEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn completed(&self, table: &TableId, watermark: &LogPosition) -> Result<()> {
        self.completed
            .lock()
            .unwrap()
            .push((table.clone(), watermark.clone()));
        Ok(())
    }
}

fn stream(binlog: &MemoryBinlog, tracker: Arc<SchemaTracker>, filter: HandoffFilter) -> ChangeStream {
    let start = filter
        .lower_bound()
        .map(LogPosition::transaction_start)
        .unwrap_or_else(|| LogPosition::new(FILE, 4));
    ChangeStream::new(
        Arc::new(binlog.clone()),
        tracker,
        StreamConfig::new(vec![orders()]).with_retry(fast_retry()),
        start,
    )
    .with_filters(HashMap::from([(orders(), filter)]))
}

async fn drain(stream: &mut ChangeStream) -> Vec<CdcEvent> {
    let mut out = Vec::new();
    while let Some(event) = stream.next().await.unwrap() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_snapshot_then_stream_then_restart() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();

    let mut b = BinlogBuilder::new(FILE);
    b.format_description();
    let before = b.insert_txn(7, &orders(), &columns(), &[row(1, "old")]);
    let watermark = b.position(b.offset());
    let first = b.insert_txn(7, &orders(), &columns(), &[row(3, "c")]);
    let second = b.begin_txn(7, &orders(), &columns());
    b.update_rows(7, &columns(), &[(row(1, "a"), row(1, "z"))]);
    b.xid(2);
    let binlog = MemoryBinlog::new();
    binlog.add(&b);

    // Snapshot sees rows 1 and 2 as of the watermark.
    let source = MemorySnapshotSource::new(watermark.clone());
    source.add_table(
        orders_schema(),
        vec![json!({"id": 1, "note": "a"}), json!({"id": 2, "note": "b"})],
    );
    let tracker = Arc::new(SchemaTracker::new());
    let coordinator = SnapshotCoordinator::new(
        SnapshotConfig::builder().batch_size(1).retry(fast_retry()).build(),
        Arc::new(source.clone()),
        tracker.clone(),
    );
    let sink = Collect::default();
    let outcome = coordinator.run(&[orders()], &sink).await.unwrap();
    assert_eq!(outcome.watermark.as_ref(), Some(&watermark));
    assert_eq!(outcome.completed, vec![orders()]);
    assert!(!source.is_open());
    {
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.snapshot && e.position == watermark));
    }
    assert_eq!(sink.completed.lock().unwrap().len(), 1);

    let store = CheckpointStore::new(dir.path()).await.unwrap();
    let mut checkpoint = TableCheckpoint::new(orders());
    checkpoint.start_snapshot(watermark.clone());
    checkpoint.finish_snapshot();
    store.save_table(&checkpoint).await.unwrap();

    // The insert before the watermark is covered by the snapshot.
    let mut s = stream(&binlog, tracker.clone(), HandoffFilter::new(Some(watermark.clone()), None));
    let events = drain(&mut s).await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.position.offset != before.offset));
    assert_eq!(events[0].position, LogPosition::at(FILE, first.offset, 3, 0));
    assert_eq!(events[1].op, CdcOp::Update);

    // Only the first transaction is committed before a restart.
    checkpoint.commit(events[0].position.clone());
    store.save_table(&checkpoint).await.unwrap();
    drop(store);

    let store = CheckpointStore::new(dir.path()).await.unwrap();
    let restored = store.load_table(&orders()).await.unwrap().unwrap();
    assert_eq!(restored.resume_position(), Some(&events[0].position));

    let mut s = stream(
        &binlog,
        tracker,
        HandoffFilter::new(restored.watermark.clone(), restored.committed.clone()),
    );
    let replayed = drain(&mut s).await;
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].position.offset, second);
    assert_eq!(replayed[0].after, Some(json!({"id": 1, "note": "z"})));
}

#[tokio::test]
async fn test_failed_table_does_not_block_the_others() {
    init_test_logging();
    let watermark = LogPosition::new(FILE, 4);
    let source = MemorySnapshotSource::new(watermark);
    source.add_table(orders_schema(), vec![json!({"id": 1, "note": "a"})]);
    let missing = TableId::new("shop", "missing");

    let coordinator = SnapshotCoordinator::new(
        SnapshotConfig::builder().retry(fast_retry()).build(),
        Arc::new(source.clone()),
        Arc::new(SchemaTracker::new()),
    );
    let sink = Collect::default();
    let outcome = coordinator
        .run(&[missing.clone(), orders()], &sink)
        .await
        .unwrap();

    assert_eq!(outcome.completed, vec![orders()]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, missing);
    assert_eq!(sink.events.lock().unwrap().len(), 1);
    assert!(!source.is_open());
}
