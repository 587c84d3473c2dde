//! Domain types for the ritual orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of things that happened
//! - Tasks: Work derived from events
//! - Upload records and signature requests
//! - Notifications published when work finishes

pub mod events;
pub mod notification;
pub mod signature;
pub mod task;
pub mod upload;

// Re-export commonly used types
pub use events::{Event, EventStatus, EventType, Metadata, RitualKind};
pub use notification::{CompletionNotification, CompletionResult, Notification};
pub use signature::{
    MultiSignatureRequest, SignatureRequest, SignatureState, SignatureSubmission, SubmissionReceipt,
};
pub use task::{Task, TaskId, TaskOutput, TaskState, TaskTransitionError, TaskType};
pub use upload::{ProviderRole, UploadRecord};
