//! Snapshot Persistence Integration Tests
//!
//! Component state written through one writer must come back intact through a
//! fresh set of components reading the same store.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use ritual::core::clock::{SharedClock, SystemClock};
use ritual::core::snapshot::{FileStateStore, SqliteStateStore};
use ritual::core::{SnapshotWriter, StateStore};
use ritual::domain::{SignatureState, Task, TaskType};
use ritual::signatures::{ShapeVerifier, SignaturePolicy, SignatureStateMachine};
use ritual::storage::{Artifact, LocalStorageProvider, StoragePipeline};

struct Components {
    pipeline: Arc<StoragePipeline>,
    signatures: Arc<SignatureStateMachine>,
    writer: SnapshotWriter,
}

fn components(objects: &Path, store: Arc<dyn StateStore>) -> Components {
    let clock: SharedClock = Arc::new(SystemClock);
    let pipeline = Arc::new(StoragePipeline::new(
        Arc::new(LocalStorageProvider::new("local", objects)),
        None,
        clock.clone(),
    ));
    let signatures = Arc::new(SignatureStateMachine::new(
        SignaturePolicy::default(),
        clock.clone(),
        Arc::new(ShapeVerifier),
    ));
    let writer = SnapshotWriter::new(store, pipeline.clone(), signatures.clone(), clock);
    Components {
        pipeline,
        signatures,
        writer,
    }
}

async fn round_trip(objects: &Path, first: Arc<dyn StateStore>, second: Arc<dyn StateStore>) {
    let before = components(objects, first);
    let record = before
        .pipeline
        .upload(Uuid::new_v4(), &Artifact::new("notes.txt", b"hello".to_vec()))
        .await
        .unwrap();
    let request = before.signatures.create("evt-7", "approve notes", None).await.unwrap();
    let task = Task::new("evt-7", TaskType::Upload, 5, json!({"artifact": "notes.txt"}), Utc::now());
    before.writer.write(vec![task.clone()]).await.unwrap();

    let after = components(objects, second);
    let snapshot = after.writer.load_latest().await.unwrap().expect("snapshot saved");
    assert_eq!(snapshot.tasks, vec![task]);

    after
        .pipeline
        .restore(snapshot.upload_records, snapshot.flagged_artifacts)
        .await;
    after
        .signatures
        .restore(snapshot.signature_requests, snapshot.multi_signature_requests)
        .await;

    assert_eq!(after.pipeline.records().await, vec![record]);
    let pending = after.signatures.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, request.id);
    assert_eq!(pending[0].state, SignatureState::Pending);

    // The restored claim still blocks a duplicate request for the event
    assert!(after.signatures.create("evt-7", "again", None).await.is_err());
}

#[tokio::test]
async fn test_file_store_restores_components() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("state/state.json");
    round_trip(
        &temp.path().join("objects"),
        Arc::new(FileStateStore::new(&path)),
        Arc::new(FileStateStore::new(&path)),
    )
    .await;
}

#[tokio::test]
async fn test_sqlite_store_restores_components() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("state/state.db");
    round_trip(
        &temp.path().join("objects"),
        Arc::new(SqliteStateStore::open(&path).unwrap()),
        Arc::new(SqliteStateStore::open(&path).unwrap()),
    )
    .await;
}

#[tokio::test]
async fn test_empty_store_has_no_snapshot() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileStateStore::new(temp.path().join("missing.json")));
    let fresh = components(&temp.path().join("objects"), store);
    assert!(fresh.writer.load_latest().await.unwrap().is_none());
}
