//! Core orchestration logic.
//!
//! This module contains:
//! - Adapter: validation and intake of trigger events
//! - EventLog: append-only event journal with archival
//! - Orchestrator: priority queue and bounded dispatch
//! - Planner: event to task mapping
//! - Snapshot: durable state for restarts
//! - Runtime: wiring of all of the above from config

pub mod adapter;
pub mod clock;
pub mod error;
pub mod event_store;
pub mod orchestrator;
pub mod planner;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod snapshot;

// Re-export commonly used types
pub use adapter::{Acceptance, EventAdapter, EventSubmission};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ExecutionError, OrchestratorError, ValidationError};
pub use event_store::{EventJournal, EventLog};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorHandle, QueueStatus};
pub use retry::RetryPolicy;
pub use runtime::Runtime;
pub use snapshot::{Snapshot, SnapshotWriter, StateStore};
