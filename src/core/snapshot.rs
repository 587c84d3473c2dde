//! Durable snapshots of orchestrator, pipeline and signature state.
//!
//! A snapshot is one JSON document:
//! `{takenAt, tasks, uploadRecords, signatureRequests, multiSignatureRequests, flaggedArtifacts}`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::clock::SharedClock;
use crate::domain::{MultiSignatureRequest, SignatureRequest, Task, UploadRecord};
use crate::signatures::SignatureStateMachine;
use crate::storage::pipeline::FlaggedArtifact;
use crate::storage::StoragePipeline;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,

    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub upload_records: Vec<UploadRecord>,

    #[serde(default)]
    pub signature_requests: Vec<SignatureRequest>,

    #[serde(default)]
    pub multi_signature_requests: Vec<MultiSignatureRequest>,

    #[serde(default)]
    pub flagged_artifacts: Vec<FlaggedArtifact>,
}

impl Snapshot {
    pub fn empty(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            tasks: Vec::new(),
            upload_records: Vec::new(),
            signature_requests: Vec::new(),
            multi_signature_requests: Vec::new(),
            flagged_artifacts: Vec::new(),
        }
    }
}

/// Persistence for snapshots
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short description for logs (e.g. "sqlite:/path/state.db")
    fn describe(&self) -> String;

    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    async fn load_latest(&self) -> Result<Option<Snapshot>>;
}

/// In-process store (tests, dry runs)
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    latest: tokio::sync::Mutex<Option<Snapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.latest.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.latest.lock().await.clone())
    }
}

/// Single JSON file, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot).context("Failed to serialize snapshot")?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = path.parent().context("Snapshot path has no parent directory")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create snapshot directory: {}", dir.display()))?;

            let mut tmp = tempfile::NamedTempFile::new_in(dir).context("Failed to create temp snapshot")?;
            std::io::Write::write_all(&mut tmp, &json).context("Failed to write snapshot")?;
            tmp.as_file().sync_all().context("Failed to sync snapshot")?;
            tmp.persist(&path)
                .with_context(|| format!("Failed to persist snapshot: {}", path.display()))?;
            Ok(())
        })
        .await
        .context("Snapshot write task failed")?
    }

    async fn load_latest(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read snapshot: {}", self.path.display()))?;

        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", self.path.display()))?;
        Ok(Some(snapshot))
    }
}

/// SQLite table of snapshots, newest kept
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
    label: String,
    keep: usize,
}

impl SqliteStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open state database: {}", path.display()))?;
        Self::init(conn, format!("sqlite:{}", path.display()))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, "sqlite::memory:".to_string())
    }

    fn init(conn: Connection, label: String) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                taken_at TEXT NOT NULL,
                body TEXT NOT NULL
            );",
        )
        .context("Failed to create snapshots table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            label,
            keep: 10,
        })
    }

    /// Number of snapshots retained
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub async fn count(&self) -> Result<usize> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))
                .context("Failed to count snapshots")?;
            Ok(count as usize)
        })
        .await
        .context("Snapshot count task failed")?
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let body = serde_json::to_string(snapshot).context("Failed to serialize snapshot")?;
        let taken_at = snapshot.taken_at.to_rfc3339();
        let keep = self.keep as i64;
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "INSERT INTO snapshots (taken_at, body) VALUES (?1, ?2)",
                params![taken_at, body],
            )
            .context("Failed to insert snapshot")?;
            conn.execute(
                "DELETE FROM snapshots WHERE id NOT IN
                    (SELECT id FROM snapshots ORDER BY id DESC LIMIT ?1)",
                params![keep],
            )
            .context("Failed to prune snapshots")?;
            Ok(())
        })
        .await
        .context("Snapshot write task failed")?
    }

    async fn load_latest(&self) -> Result<Option<Snapshot>> {
        let conn = self.conn.clone();

        let body: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row(
                "SELECT body FROM snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load snapshot")
        })
        .await
        .context("Snapshot read task failed")??;

        body.map(|b| serde_json::from_str(&b).context("Failed to parse stored snapshot"))
            .transpose()
    }
}

/// Captures state from every component and saves it
#[derive(Clone)]
pub struct SnapshotWriter {
    store: Arc<dyn StateStore>,
    pipeline: Arc<StoragePipeline>,
    signatures: Arc<SignatureStateMachine>,
    clock: SharedClock,
}

impl SnapshotWriter {
    pub fn new(
        store: Arc<dyn StateStore>,
        pipeline: Arc<StoragePipeline>,
        signatures: Arc<SignatureStateMachine>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            pipeline,
            signatures,
            clock,
        }
    }

    pub async fn capture(&self, tasks: Vec<Task>) -> Snapshot {
        Snapshot {
            taken_at: self.clock.now(),
            tasks,
            upload_records: self.pipeline.records().await,
            signature_requests: self.signatures.all_requests().await,
            multi_signature_requests: self.signatures.all_multis().await,
            flagged_artifacts: self.pipeline.flagged().await,
        }
    }

    pub async fn load_latest(&self) -> Result<Option<Snapshot>> {
        let snapshot = self.store.load_latest().await?;
        if let Some(ref s) = snapshot {
            debug!(store = %self.store.describe(), taken_at = %s.taken_at, "Snapshot loaded");
        }
        Ok(snapshot)
    }

    pub async fn write(&self, tasks: Vec<Task>) -> Result<()> {
        let snapshot = self.capture(tasks).await;
        self.store.save(&snapshot).await?;
        debug!(store = %self.store.describe(), tasks = snapshot.tasks.len(), "Snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use serde_json::json;
    use tempfile::TempDir;

    fn snapshot_with_task() -> Snapshot {
        let mut snapshot = Snapshot::empty(Utc::now());
        snapshot
            .tasks
            .push(Task::new("evt-1", TaskType::Upload, 5, json!({"artifact": "a"}), Utc::now()));
        snapshot
    }

    #[test]
    fn test_snapshot_keys() {
        let json = serde_json::to_value(Snapshot::empty(Utc::now())).unwrap();
        for key in ["tasks", "uploadRecords", "signatureRequests", "multiSignatureRequests", "takenAt"] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn test_minimal_snapshot_parses() {
        let json = r#"{"takenAt":"2026-01-01T00:00:00Z","tasks":[],"uploadRecords":[],"signatureRequests":[]}"#;
        let snapshot: Snapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.multi_signature_requests.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("state/snapshot.json"));

        assert!(store.load_latest().await.unwrap().is_none());

        let snapshot = snapshot_with_task();
        store.save(&snapshot).await.unwrap();
        assert_eq!(store.load_latest().await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_sqlite_store_keeps_latest() {
        let store = SqliteStateStore::open_in_memory().unwrap().with_keep(2);

        let first = Snapshot::empty(Utc::now());
        let second = snapshot_with_task();
        let third = snapshot_with_task();

        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();
        store.save(&third).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.load_latest().await.unwrap(), Some(third));
    }
}
