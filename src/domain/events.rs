//! Event types for the orchestrator.
//!
//! Events are immutable records of something that happened outside the core
//! (an artifact landed, a signature was requested, a ritual ticked). They are
//! appended to the event log and converted into tasks by the orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured event metadata (validated per event type at ingestion)
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A single event in the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identifier (time-ordered when server-generated)
    pub id: String,

    /// Type tag; the only part of the event the core interprets
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Status reported by the trigger
    #[serde(default)]
    pub status: EventStatus,

    /// When the event happened (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Human-readable description (never parsed)
    #[serde(default)]
    pub details: String,

    /// Event this one follows up on, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_event_id: Option<String>,

    /// Structured payload
    #[serde(default)]
    pub metadata: Metadata,
}

impl Event {
    /// Create a new event with a generated id
    pub fn new(event_type: EventType, details: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            status: EventStatus::default(),
            timestamp,
            details: details.into(),
            related_event_id: None,
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata field
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Link this event to an earlier one
    pub fn with_related(mut self, event_id: impl Into<String>) -> Self {
        self.related_event_id = Some(event_id.into());
        self
    }

    /// Override the status
    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    /// Read a string metadata field
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Generate a time-ordered event id.
///
/// UUIDv7 embeds a millisecond timestamp, so ids allocated by several adapter
/// instances still sort in allocation order.
pub fn generate_event_id() -> String {
    format!("evt-{}", Uuid::now_v7())
}

/// Types of events the core understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new artifact is ready for upload
    ArtifactCreated,

    /// An existing artifact changed on disk
    ArtifactChanged,

    /// Someone asked for a signature over a message
    SignatureRequested,

    /// A scheduled (or manually triggered) maintenance ritual
    RitualTick,

    /// A task finished successfully (audit only)
    TaskCompleted,

    /// A task failed terminally (audit only)
    TaskFailed,

    /// Informational event with no derived work
    Notice,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        Self::ArtifactCreated,
        Self::ArtifactChanged,
        Self::SignatureRequested,
        Self::RitualTick,
        Self::TaskCompleted,
        Self::TaskFailed,
        Self::Notice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArtifactCreated => "artifact_created",
            Self::ArtifactChanged => "artifact_changed",
            Self::SignatureRequested => "signature_requested",
            Self::RitualTick => "ritual_tick",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::Notice => "notice",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    /// Accepts `snake_case`, `kebab-case` and any letter case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| s.to_string())
    }
}

/// Status reported by the trigger that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Pending,
    Success,
    Failure,
    Info,
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "success" | "ok" => Ok(Self::Success),
            "failure" | "failed" | "error" => Ok(Self::Failure),
            "info" => Ok(Self::Info),
            other => Err(other.to_string()),
        }
    }
}

/// Maintenance rituals that can be scheduled or triggered by hand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RitualKind {
    /// Re-check reachability of unverified uploads
    Reconcile,

    /// Pin verified uploads that are not pinned yet
    Pin,

    /// Expire stale signature requests
    ExpireSignatures,

    /// Move old events from the hot log to the archive
    ArchiveEvents,
}

impl RitualKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reconcile => "reconcile",
            Self::Pin => "pin",
            Self::ExpireSignatures => "expire-signatures",
            Self::ArchiveEvents => "archive-events",
        }
    }
}

impl fmt::Display for RitualKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RitualKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "reconcile" => Ok(Self::Reconcile),
            "pin" => Ok(Self::Pin),
            "expire-signatures" => Ok(Self::ExpireSignatures),
            "archive-events" => Ok(Self::ArchiveEvents),
            other => Err(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_uses_type_key() {
        let event = Event::new(EventType::ArtifactCreated, "new build", Utc::now())
            .with_metadata("artifact", "build/out.tar");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "artifact_created");
        assert_eq!(json["metadata"]["artifact"], "build/out.tar");
        assert!(json.get("relatedEventId").is_none());

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_type_parsing_is_lenient_on_case() {
        assert_eq!("ritual-tick".parse::<EventType>(), Ok(EventType::RitualTick));
        assert_eq!("SIGNATURE_REQUESTED".parse::<EventType>(), Ok(EventType::SignatureRequested));
        assert!("deploy".parse::<EventType>().is_err());
    }

    #[test]
    fn test_generated_ids_are_time_ordered() {
        let first = generate_event_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generate_event_id();
        assert!(first < second);
        assert!(first.starts_with("evt-"));
    }

    #[test]
    fn test_ritual_kind_round_trip() {
        for kind in [
            RitualKind::Reconcile,
            RitualKind::Pin,
            RitualKind::ExpireSignatures,
            RitualKind::ArchiveEvents,
        ] {
            assert_eq!(kind.as_str().parse::<RitualKind>(), Ok(kind));
        }
        assert_eq!("expire_signatures".parse::<RitualKind>(), Ok(RitualKind::ExpireSignatures));
    }
}
