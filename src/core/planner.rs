//! Event → task planning.
//!
//! | event                 | tasks                               |
//! |-----------------------|-------------------------------------|
//! | `artifact_created`    | `upload` (5)                        |
//! | `artifact_changed`    | `upload` (4)                        |
//! | `signature_requested` | `signature_request` (7)             |
//! | `ritual_tick`         | `reconcile` / `pin` / `signature_sweep` / `archive_events` |
//! | audit events          | none                                |
//!
//! A numeric `metadata.priority` overrides the default priority.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::domain::{CompletionNotification, Event, EventType, RitualKind, Task, TaskType};
use crate::executors::FollowUp;

/// Derive the tasks for an accepted event
pub fn plan_tasks(event: &Event, now: DateTime<Utc>) -> Vec<Task> {
    let planned = match event.event_type {
        EventType::ArtifactCreated => Some((TaskType::Upload, TaskType::Upload.default_priority())),
        EventType::ArtifactChanged => Some((TaskType::Upload, TaskType::Upload.default_priority() - 1)),
        EventType::SignatureRequested => {
            Some((TaskType::SignatureRequest, TaskType::SignatureRequest.default_priority()))
        }
        EventType::RitualTick => match event.metadata_str("ritual").map(str::parse::<RitualKind>) {
            Some(Ok(kind)) => {
                let task_type = ritual_task_type(kind);
                Some((task_type, task_type.default_priority()))
            }
            _ => {
                warn!(event_id = %event.id, "ritual_tick without a known ritual, nothing planned");
                None
            }
        },
        EventType::TaskCompleted | EventType::TaskFailed | EventType::Notice => None,
    };

    let Some((task_type, default_priority)) = planned else {
        return Vec::new();
    };

    let priority = priority_override(event).unwrap_or(default_priority);
    let payload = Value::Object(event.metadata.clone().into_iter().collect());

    vec![Task::new(event.id.clone(), task_type, priority, payload, now)]
}

/// Task type that carries out a ritual
pub fn ritual_task_type(kind: RitualKind) -> TaskType {
    match kind {
        RitualKind::Reconcile => TaskType::Reconcile,
        RitualKind::Pin => TaskType::Pin,
        RitualKind::ExpireSignatures => TaskType::SignatureSweep,
        RitualKind::ArchiveEvents => TaskType::ArchiveEvents,
    }
}

/// Task for a follow-up requested by an executor
pub fn plan_follow_up(parent: &Task, follow_up: &FollowUp, now: DateTime<Utc>) -> Task {
    let priority = follow_up.priority.unwrap_or_else(|| follow_up.task_type.default_priority());
    Task::new(parent.event_ref.clone(), follow_up.task_type, priority, follow_up.payload.clone(), now)
}

/// `registry_notify` task for a finished task.
///
/// Returns `None` for notify tasks themselves and for tasks that have not
/// finished.
pub fn plan_notification(finished: &Task, now: DateTime<Utc>) -> Option<Task> {
    if finished.task_type == TaskType::RegistryNotify {
        return None;
    }
    let notification = CompletionNotification::from_task(finished)?;
    let payload = serde_json::to_value(&notification).ok()?;

    Some(Task::new(
        finished.event_ref.clone(),
        TaskType::RegistryNotify,
        TaskType::RegistryNotify.default_priority(),
        payload,
        now,
    ))
}

fn priority_override(event: &Event) -> Option<i32> {
    event
        .metadata
        .get("priority")
        .and_then(Value::as_i64)
        .and_then(|p| i32::try_from(p).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: EventType) -> Event {
        Event::new(event_type, "test", Utc::now())
    }

    #[test]
    fn test_artifact_events_plan_uploads() {
        let now = Utc::now();
        let created = plan_tasks(&event(EventType::ArtifactCreated).with_metadata("artifact", "a.bin"), now);
        let changed = plan_tasks(&event(EventType::ArtifactChanged).with_metadata("artifact", "a.bin"), now);

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].task_type, TaskType::Upload);
        assert_eq!(created[0].priority, 5);
        assert_eq!(created[0].payload_str("artifact"), Some("a.bin"));
        assert_eq!(changed[0].priority, 4);
    }

    #[test]
    fn test_ritual_tick_plans_by_kind() {
        let now = Utc::now();
        let cases = [
            ("reconcile", TaskType::Reconcile, 1),
            ("pin", TaskType::Pin, 2),
            ("expire-signatures", TaskType::SignatureSweep, 2),
            ("archive-events", TaskType::ArchiveEvents, 1),
        ];
        for (ritual, task_type, priority) in cases {
            let tasks = plan_tasks(&event(EventType::RitualTick).with_metadata("ritual", ritual), now);
            assert_eq!(tasks[0].task_type, task_type);
            assert_eq!(tasks[0].priority, priority);
        }
    }

    #[test]
    fn test_audit_events_plan_nothing() {
        let now = Utc::now();
        for event_type in [EventType::TaskCompleted, EventType::TaskFailed, EventType::Notice] {
            assert!(plan_tasks(&event(event_type), now).is_empty());
        }
    }

    #[test]
    fn test_priority_override() {
        let event = event(EventType::ArtifactCreated)
            .with_metadata("artifact", "a.bin")
            .with_metadata("priority", 9);
        assert_eq!(plan_tasks(&event, Utc::now())[0].priority, 9);
    }

    #[test]
    fn test_notification_task_for_finished_task() {
        let now = Utc::now();
        let mut task = Task::new("evt-1", TaskType::Upload, 5, json!({"artifact": "a.bin"}), now);
        assert!(plan_notification(&task, now).is_none());

        task.fail(now, "gone").unwrap();
        let notify = plan_notification(&task, now).unwrap();
        assert_eq!(notify.task_type, TaskType::RegistryNotify);
        assert_eq!(notify.priority, 3);
        assert_eq!(notify.event_ref, "evt-1");
        assert_eq!(notify.payload["result"], "failed");

        let mut notify_task = notify.clone();
        notify_task.fail(now, "sink down").unwrap();
        assert!(plan_notification(&notify_task, now).is_none());
    }
}
