//! Trigger sources that feed the event adapter.
//!
//! ```text
//! artifacts dir ──► ArtifactWatcher ──┐
//!                                     ├──► EventAdapter ──► events.jsonl
//! interval ──────► RitualScheduler ───┘         │
//!                                               ▼
//!                                         Orchestrator
//! ```

pub mod schedule;
pub mod watcher;

pub use schedule::{trigger_ritual, RitualScheduler, ScheduleHandle};
pub use watcher::{compute_file_hash, ArtifactWatcher, ScanResult, WatchHandle, WatcherConfig, WatcherError};
