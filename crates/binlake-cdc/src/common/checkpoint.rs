//! # CDC Checkpointing
//!
//! Durable per-table progress for resumable loads.
//!
//! ## Features
//!
//! - **Durable Storage**: one JSON file per table
//! - **Atomic Updates**: temp file, fsync, rename
//! - **Write-ahead batches**: the batch being submitted is recorded before
//!   the destination sees it, so a restart re-submits the same label
//! - **Operator resolutions**: accepted schema changes survive restarts
//!
//! ## Usage
//!
//! ```ignore
//! let store = CheckpointStore::new("/var/lib/binlake/checkpoints").await?;
//!
//! let mut cp = store.load("shop.orders").await?.unwrap_or_else(|| TableCheckpoint::new(table));
//! cp.begin_batch(pending);
//! store.save(&cp.table.key(), cp.clone()).await?;
//! ```

use crate::common::{CdcError, LogPosition, Result, SchemaVersion, TableId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Lifecycle of a table's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    /// Snapshot not finished; a restart snapshots the table again
    #[default]
    Snapshotting,
    /// Snapshot loaded; a restart resumes from the log
    Streaming,
}

/// Batch recorded before submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub label: String,
    pub first: LogPosition,
    pub last: LogPosition,
    /// Number of events in the batch
    pub events: usize,
}

/// Why a table stopped applying changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseRecord {
    pub position: LogPosition,
    pub detail: String,
}

/// Persistent progress of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    pub table: TableId,
    #[serde(default)]
    pub phase: CheckpointPhase,
    /// Log position the snapshot is consistent with
    #[serde(default)]
    pub watermark: Option<LogPosition>,
    /// Last position the destination acknowledged
    #[serde(default)]
    pub committed: Option<LogPosition>,
    #[serde(default)]
    pub pending: Option<PendingBatch>,
    /// DDL positions accepted by an operator
    #[serde(default)]
    pub resolved: Vec<LogPosition>,
    /// Column layout in effect at `committed`
    #[serde(default)]
    pub schema: Option<SchemaVersion>,
    #[serde(default)]
    pub paused: Option<PauseRecord>,
    pub updated_at: DateTime<Utc>,
}

impl TableCheckpoint {
    pub fn new(table: TableId) -> Self {
        Self {
            table,
            phase: CheckpointPhase::Snapshotting,
            watermark: None,
            committed: None,
            pending: None,
            resolved: Vec::new(),
            schema: None,
            paused: None,
            updated_at: Utc::now(),
        }
    }

    /// Checkpoint of a table that skips the snapshot and streams from `position`.
    pub fn streaming_from(table: TableId, position: LogPosition) -> Self {
        Self {
            phase: CheckpointPhase::Streaming,
            watermark: Some(position),
            ..Self::new(table)
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == CheckpointPhase::Streaming
    }

    /// Where streaming resumes: after `committed`, else at `watermark`.
    pub fn resume_position(&self) -> Option<&LogPosition> {
        if !self.is_streaming() {
            return None;
        }
        self.committed.as_ref().or(self.watermark.as_ref())
    }

    /// Start a fresh snapshot at `watermark`, dropping any prior progress.
    pub fn start_snapshot(&mut self, watermark: LogPosition) {
        self.phase = CheckpointPhase::Snapshotting;
        self.watermark = Some(watermark);
        self.committed = None;
        self.pending = None;
        self.paused = None;
        self.touch();
    }

    /// Snapshot fully loaded; streaming continues after the watermark.
    pub fn finish_snapshot(&mut self) {
        self.phase = CheckpointPhase::Streaming;
        self.committed = self.watermark.clone();
        self.pending = None;
        self.touch();
    }

    pub fn begin_batch(&mut self, pending: PendingBatch) {
        self.pending = Some(pending);
        self.touch();
    }

    /// Record an acknowledged load ending at `last`.
    pub fn commit(&mut self, last: LogPosition) {
        if self.committed.as_ref().map_or(true, |c| *c < last) {
            self.committed = Some(last);
        }
        self.pending = None;
        self.paused = None;
        self.touch();
    }

    pub fn pause(&mut self, position: LogPosition, detail: impl Into<String>) {
        self.paused = Some(PauseRecord {
            position,
            detail: detail.into(),
        });
        self.touch();
    }

    pub fn resolve(&mut self, position: LogPosition) {
        if !self.resolved.contains(&position) {
            self.resolved.push(position);
            self.resolved.sort();
        }
        self.touch();
    }

    pub fn is_resolved(&self, position: &LogPosition) -> bool {
        self.resolved.contains(position)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
        return Err(CdcError::config(format!("Invalid checkpoint key '{}'", key)));
    }
    Ok(())
}

/// Persistent checkpoint storage.
///
/// Stores checkpoints as JSON files with atomic writes.
pub struct CheckpointStore {
    /// Base directory for checkpoint files
    base_dir: PathBuf,
    /// In-memory cache
    cache: RwLock<HashMap<String, TableCheckpoint>>,
    /// Whether to fsync after writes
    fsync: bool,
}

impl CheckpointStore {
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Create checkpoint store with custom options.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn save(&self, key: &str, checkpoint: TableCheckpoint) -> Result<()> {
        validate_key(key)?;

        let file_path = self.file_path(key);
        let temp_path = self.base_dir.join(format!("{}.json.tmp", key));
        let json = serde_json::to_string_pretty(&checkpoint)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &file_path).await?;

        let committed = checkpoint
            .committed
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".into());
        {
            let mut cache = self.cache.write().await;
            cache.insert(key.to_string(), checkpoint);
        }

        debug!(key, committed = %committed, "Saved checkpoint");
        Ok(())
    }

    pub async fn load(&self, key: &str) -> Result<Option<TableCheckpoint>> {
        validate_key(key)?;
        {
            let cache = self.cache.read().await;
            if let Some(cp) = cache.get(key) {
                return Ok(Some(cp.clone()));
            }
        }

        let file_path = self.file_path(key);
        if !fs::try_exists(&file_path).await? {
            return Ok(None);
        }

        let mut file = File::open(&file_path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        let checkpoint: TableCheckpoint = serde_json::from_str(&contents)?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(key.to_string(), checkpoint.clone());
        }
        Ok(Some(checkpoint))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let file_path = self.file_path(key);
        if fs::try_exists(&file_path).await? {
            fs::remove_file(&file_path).await?;
        }
        {
            let mut cache = self.cache.write().await;
            cache.remove(key);
        }
        info!(key, "Deleted checkpoint");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let cache = self.cache.read().await;
        let mut keys: Vec<String> = cache.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Load all checkpoints from disk.
    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    match self.load(stem).await {
                        Ok(Some(_)) => loaded += 1,
                        Ok(None) => {}
                        Err(e) => warn!(key = stem, error = %e, "Failed to load checkpoint"),
                    }
                }
            }
        }
        if loaded > 0 {
            info!("Loaded {} checkpoints from {}", loaded, self.base_dir.display());
        }
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", key))
    }
}

/// In-memory checkpoint tracker (for testing or dry runs).
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, TableCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save(&self, key: &str, checkpoint: TableCheckpoint) -> Result<()> {
        validate_key(key)?;
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(key.to_string(), checkpoint);
        Ok(())
    }

    pub async fn load(&self, key: &str) -> Result<Option<TableCheckpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(key).cloned())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.remove(key);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let checkpoints = self.checkpoints.read().await;
        let mut keys: Vec<String> = checkpoints.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Where table checkpoints live.
#[async_trait::async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn save(&self, key: &str, checkpoint: TableCheckpoint) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Option<TableCheckpoint>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;

    /// Load the checkpoint of `table`, if any.
    async fn load_table(&self, table: &TableId) -> Result<Option<TableCheckpoint>> {
        self.load(&table.key()).await
    }

    /// Persist a table checkpoint under its table key.
    async fn save_table(&self, checkpoint: &TableCheckpoint) -> Result<()> {
        self.save(&checkpoint.table.key(), checkpoint.clone()).await
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for CheckpointStore {
    async fn save(&self, key: &str, checkpoint: TableCheckpoint) -> Result<()> {
        CheckpointStore::save(self, key, checkpoint).await
    }

    async fn load(&self, key: &str) -> Result<Option<TableCheckpoint>> {
        CheckpointStore::load(self, key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        CheckpointStore::delete(self, key).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        CheckpointStore::list(self).await
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for MemoryCheckpointStore {
    async fn save(&self, key: &str, checkpoint: TableCheckpoint) -> Result<()> {
        MemoryCheckpointStore::save(self, key, checkpoint).await
    }

    async fn load(&self, key: &str) -> Result<Option<TableCheckpoint>> {
        MemoryCheckpointStore::load(self, key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        MemoryCheckpointStore::delete(self, key).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        MemoryCheckpointStore::list(self).await
    }
}

pub type SharedCheckpointBackend = Arc<dyn CheckpointBackend>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    fn pos(offset: u64) -> LogPosition {
        LogPosition::new("mysql-bin.000001", offset)
    }

    #[test]
    fn test_resume_position() {
        let mut cp = TableCheckpoint::new(orders());
        assert!(cp.resume_position().is_none());

        cp.start_snapshot(pos(100));
        assert!(cp.resume_position().is_none());

        cp.finish_snapshot();
        assert_eq!(cp.resume_position(), Some(&pos(100)));

        cp.commit(pos(400));
        assert_eq!(cp.resume_position(), Some(&pos(400)));

        // committed never moves backwards
        cp.commit(pos(300));
        assert_eq!(cp.committed, Some(pos(400)));
    }

    #[test]
    fn test_pending_cleared_on_commit() {
        let mut cp = TableCheckpoint::streaming_from(orders(), pos(4));
        cp.begin_batch(PendingBatch {
            label: "l1".into(),
            first: pos(10),
            last: pos(20),
            events: 2,
        });
        assert!(cp.pending.is_some());
        cp.commit(pos(20));
        assert!(cp.pending.is_none());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut cp = TableCheckpoint::new(orders());
        cp.resolve(pos(900));
        cp.resolve(pos(900));
        cp.resolve(pos(100));
        assert_eq!(cp.resolved, vec![pos(100), pos(900)]);
        assert!(cp.is_resolved(&pos(900)));
    }

    #[tokio::test]
    async fn test_memory_checkpoint_store() {
        let store = MemoryCheckpointStore::new();
        let cp = TableCheckpoint::new(orders());
        store.save("shop.orders", cp.clone()).await.unwrap();

        assert_eq!(store.load("shop.orders").await.unwrap(), Some(cp));
        assert_eq!(store.list().await.unwrap(), vec!["shop.orders"]);

        store.delete("shop.orders").await.unwrap();
        assert_eq!(store.load("shop.orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persistent_checkpoint_store() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).await.unwrap();

        let mut cp = TableCheckpoint::streaming_from(orders(), pos(4));
        cp.commit(LogPosition::at("mysql-bin.000001", 120, 2, 1));
        store.save_table(&cp).await.unwrap();

        // reopen
        let store2 = CheckpointStore::new(dir.path()).await.unwrap();
        assert_eq!(store2.list().await.unwrap(), vec!["shop.orders"]);
        let loaded = store2.load_table(&orders()).await.unwrap();
        assert_eq!(loaded, Some(cp));
        assert!(!dir.path().join("shop.orders.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_checkpoint_store_invalid_key() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).await.unwrap();
        let cp = TableCheckpoint::new(orders());

        assert!(store.save("", cp.clone()).await.is_err());
        assert!(store.save("foo/bar", cp.clone()).await.is_err());
        assert!(store.save("foo\\bar", cp.clone()).await.is_err());
        assert!(store.save("..", cp).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_backend_trait() {
        let store: SharedCheckpointBackend = Arc::new(MemoryCheckpointStore::new());
        let cp = TableCheckpoint::new(orders());
        store.save_table(&cp).await.unwrap();
        assert_eq!(store.load_table(&orders()).await.unwrap(), Some(cp));
    }
}
