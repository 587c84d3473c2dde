//! ritual - Event-driven task orchestrator
//!
//! Turns trigger events (new artifacts, signature requests, scheduled
//! rituals) into prioritized tasks, runs them on a bounded worker pool and
//! reports completions to a registry.
//!
//! # Architecture
//!
//! ```text
//! watcher / scheduler / CLI
//!          │
//!          ▼
//!     EventAdapter ──► events.jsonl
//!          │
//!          ▼
//!     Orchestrator ──► executors ──► StoragePipeline (primary → secondary)
//!          │                    └──► SignatureStateMachine
//!          ▼
//!     RegistrySink
//! ```
//!
//! # Modules
//!
//! - `core`: Adapter, orchestrator, event log, snapshots, runtime wiring
//! - `domain`: Data structures (Event, Task, SignatureRequest, UploadRecord)
//! - `executors`: Task executors (upload, signature request, notify, maintenance)
//! - `storage`: Storage providers and the fallback pipeline
//! - `signatures`: Signature request lifecycle
//! - `sink`: Completion notification targets
//! - `ingest`: Artifact watcher and ritual scheduler
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit an artifact and run the resulting tasks
//! ritual submit-event --type artifact_created --meta artifact=build.tar
//!
//! # Inspect the queue
//! ritual queue-status
//!
//! # Run as a service
//! ritual serve
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod executors;
pub mod ingest;
pub mod signatures;
pub mod sink;
pub mod storage;

// Re-export main types at crate root for convenience
pub use core::{EventAdapter, EventSubmission, Orchestrator, Runtime};
pub use domain::{Event, EventType, Task, TaskState, TaskType};
pub use signatures::SignatureStateMachine;
pub use storage::StoragePipeline;
