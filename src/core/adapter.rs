//! Event adapter: the single entry point for triggers.
//!
//! Webhook-style JSON submissions, file-watch notifications and ritual ticks
//! all arrive as [`EventSubmission`]s. The adapter validates and normalizes
//! them into [`Event`]s, appends them to the event log and forwards them to
//! the orchestrator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use super::clock::SharedClock;
use super::error::{OrchestratorError, ValidationError};
use super::event_store::EventJournal;
use super::orchestrator::OrchestratorHandle;
use crate::domain::events::generate_event_id;
use crate::domain::{Event, EventStatus, EventType, Metadata, Notification, RitualKind};
use crate::signatures::shape::{is_valid_address, normalize_address};

/// Raw event as submitted by a trigger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubmission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// RFC 3339; defaults to the time of submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default)]
    pub details: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_event_id: Option<String>,
}

impl EventSubmission {
    pub fn new(event_type: EventType, details: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.as_str().to_string()),
            details: details.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON submission body
    pub fn from_json(body: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(body).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Ritual tick submission
    pub fn ritual(kind: RitualKind) -> Self {
        Self::new(EventType::RitualTick, format!("ritual {kind}"))
            .with_metadata("ritual", kind.as_str())
            .with_status(EventStatus::Info)
    }

    /// Artifact submission for a path
    pub fn artifact(event_type: EventType, path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(event_type, format!("artifact {path}")).with_metadata("artifact", path)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        let status = serde_json::to_value(status)
            .ok()
            .and_then(|v| v.as_str().map(String::from));
        self.status = status;
        self
    }

    /// Validate and convert into an event
    pub fn normalize(self, now: DateTime<Utc>) -> Result<Event, ValidationError> {
        let raw_type = self
            .event_type
            .filter(|t| !t.trim().is_empty())
            .ok_or(ValidationError::MissingType)?;
        let event_type: EventType = raw_type.parse().map_err(ValidationError::UnknownType)?;

        let timestamp = match self.timestamp {
            Some(value) => DateTime::parse_from_rfc3339(value.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| ValidationError::BadTimestamp {
                    value: value.clone(),
                    reason: e.to_string(),
                })?,
            None => now,
        };

        let status = match self.status {
            Some(value) => value
                .parse()
                .map_err(|s| ValidationError::Malformed(format!("unknown status: {s}")))?,
            None => EventStatus::default(),
        };

        let metadata = self.metadata.unwrap_or_default();
        validate_metadata(event_type, &metadata)?;

        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_event_id);

        Ok(Event {
            id,
            event_type,
            status,
            timestamp,
            details: self.details,
            related_event_id: self.related_event_id,
            metadata,
        })
    }
}

fn required_str<'a>(event_type: EventType, metadata: &'a Metadata, field: &str) -> Result<&'a str, ValidationError> {
    match metadata.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(_) => Err(ValidationError::InvalidMetadata {
            field: field.to_string(),
            reason: "expected a non-empty string".to_string(),
        }),
        None => Err(ValidationError::MissingMetadata {
            event_type: event_type.to_string(),
            field: field.to_string(),
        }),
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidMetadata {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Check the structured fields each event type needs
pub fn validate_metadata(event_type: EventType, metadata: &Metadata) -> Result<(), ValidationError> {
    if let Some(priority) = metadata.get("priority") {
        if priority.as_i64().and_then(|p| i32::try_from(p).ok()).is_none() {
            return Err(invalid("priority", "expected an integer"));
        }
    }

    match event_type {
        EventType::ArtifactCreated | EventType::ArtifactChanged => {
            required_str(event_type, metadata, "artifact")?;
        }
        EventType::SignatureRequested => {
            required_str(event_type, metadata, "message")?;

            if let Some(signer) = metadata.get("requiredSigner") {
                match signer.as_str() {
                    Some(s) if is_valid_address(s) => {}
                    _ => return Err(invalid("requiredSigner", "expected a 0x-prefixed 20-byte hex address")),
                }
            }

            let signer_count = match metadata.get("signers") {
                Some(Value::Array(signers)) if !signers.is_empty() => {
                    let mut seen = HashSet::with_capacity(signers.len());
                    for signer in signers {
                        let Some(address) = signer.as_str().filter(|s| is_valid_address(s)) else {
                            return Err(invalid("signers", "every signer must be a 0x-prefixed 20-byte hex address"));
                        };
                        if !seen.insert(normalize_address(address)) {
                            return Err(invalid("signers", format!("duplicate signer: {address}")));
                        }
                    }
                    Some(seen.len())
                }
                Some(_) => return Err(invalid("signers", "expected a non-empty array of addresses")),
                None => None,
            };

            if let Some(threshold) = metadata.get("threshold") {
                let Some(count) = signer_count else {
                    return Err(invalid("threshold", "threshold requires signers"));
                };
                match threshold.as_u64() {
                    Some(t) if t >= 1 && t as usize <= count => {}
                    _ => return Err(invalid("threshold", format!("expected an integer between 1 and {count}"))),
                }
            }
        }
        EventType::RitualTick => {
            let ritual = required_str(event_type, metadata, "ritual")?;
            ritual
                .parse::<RitualKind>()
                .map_err(|r| invalid("ritual", format!("unknown ritual: {r}")))?;
        }
        EventType::TaskCompleted | EventType::TaskFailed | EventType::Notice => {}
    }

    Ok(())
}

/// Event log retry behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Attempts to write each event to the log
    pub log_attempts: u32,

    /// Pause between log write attempts
    pub log_retry_delay: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            log_attempts: 3,
            log_retry_delay: Duration::from_millis(100),
        }
    }
}

/// An accepted event
#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub event: Event,

    /// Whether the event reached the event log
    pub logged: bool,
}

pub struct EventAdapter {
    journal: Arc<dyn EventJournal>,
    forward: OrchestratorHandle,
    notifications: broadcast::Sender<Notification>,
    clock: SharedClock,
    config: AdapterConfig,
}

impl EventAdapter {
    pub fn new(
        journal: Arc<dyn EventJournal>,
        forward: OrchestratorHandle,
        notifications: broadcast::Sender<Notification>,
        clock: SharedClock,
    ) -> Self {
        Self {
            journal,
            forward,
            notifications,
            clock,
            config: AdapterConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AdapterConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate, log and forward a submission.
    ///
    /// A failing event log does not reject the event: it is forwarded anyway
    /// and a `logging-degraded` notification is published.
    #[instrument(skip(self, submission), fields(event_type = ?submission.event_type))]
    pub async fn submit(&self, submission: EventSubmission) -> Result<Acceptance, OrchestratorError> {
        let event = submission.normalize(self.clock.now()).map_err(|e| {
            debug!(error = %e, "Submission rejected");
            e
        })?;

        let logged = match self.append_with_retry(&event).await {
            Ok(()) => {
                let _ = self.notifications.send(Notification::EventLogged {
                    event_id: event.id.clone(),
                });
                true
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Event log unavailable, forwarding unlogged event");
                let _ = self.notifications.send(Notification::LoggingDegraded {
                    event_id: event.id.clone(),
                    error: e.to_string(),
                });
                false
            }
        };

        self.forward.submit_event(event.clone()).await?;
        debug!(event_id = %event.id, logged, "Event forwarded");

        Ok(Acceptance { event, logged })
    }

    /// Parse and submit a JSON body
    pub async fn submit_json(&self, body: &str) -> Result<Acceptance, OrchestratorError> {
        let submission = EventSubmission::from_json(body)?;
        self.submit(submission).await
    }

    async fn append_with_retry(&self, event: &Event) -> anyhow::Result<()> {
        let attempts = self.config.log_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.journal.append(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(event_id = %event.id, attempt, error = %e, "Event log write failed, retrying");
                    tokio::time::sleep(self.config.log_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
