//! Interval scheduler for maintenance rituals.
//!
//! Each configured ritual ticks on its own interval and is submitted through
//! the event adapter as a `ritual_tick` event, exactly like a manual trigger.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::RitualSchedule;
use crate::core::adapter::{Acceptance, EventAdapter, EventSubmission};
use crate::core::error::OrchestratorError;
use crate::domain::RitualKind;

/// Submit one ritual tick
pub async fn trigger_ritual(adapter: &EventAdapter, kind: RitualKind) -> Result<Acceptance, OrchestratorError> {
    adapter.submit(EventSubmission::ritual(kind)).await
}

pub struct RitualScheduler {
    schedules: Vec<RitualSchedule>,
}

impl RitualScheduler {
    /// Schedules with a zero interval are ignored
    pub fn new(schedules: Vec<RitualSchedule>) -> Self {
        let schedules = schedules.into_iter().filter(|s| s.every_secs > 0).collect();
        Self { schedules }
    }

    pub fn schedules(&self) -> &[RitualSchedule] {
        &self.schedules
    }

    /// Start one ticking task per schedule
    pub fn spawn(&self, adapter: Arc<EventAdapter>) -> ScheduleHandle {
        let tasks = self
            .schedules
            .iter()
            .map(|schedule| {
                let adapter = adapter.clone();
                let schedule = *schedule;
                tokio::spawn(async move { tick_forever(adapter, schedule).await })
            })
            .collect();

        info!(rituals = self.schedules.len(), "Ritual scheduler started");
        ScheduleHandle { tasks }
    }
}

async fn tick_forever(adapter: Arc<EventAdapter>, schedule: RitualSchedule) {
    let period = Duration::from_secs(schedule.every_secs);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        match trigger_ritual(&adapter, schedule.ritual).await {
            Ok(accepted) => debug!(ritual = %schedule.ritual, event_id = %accepted.event.id, "Ritual tick"),
            Err(OrchestratorError::ShutDown) => break,
            Err(e) => warn!(ritual = %schedule.ritual, error = %e, "Ritual tick rejected"),
        }
    }
}

/// Handle to stop the scheduler
pub struct ScheduleHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ScheduleHandle {
    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::{broadcast, mpsc, Mutex};

    use crate::core::clock::SystemClock;
    use crate::core::event_store::EventJournal;
    use crate::core::orchestrator::{OrchestratorCommand, OrchestratorHandle};
    use crate::domain::{Event, EventType};

    #[derive(Default)]
    struct MemoryJournal {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventJournal for MemoryJournal {
        async fn append(&self, event: &Event) -> anyhow::Result<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    fn adapter() -> (Arc<EventAdapter>, mpsc::Receiver<OrchestratorCommand>) {
        let (handle, rx) = OrchestratorHandle::channel(32);
        let (notifications, _) = broadcast::channel(16);
        let adapter = EventAdapter::new(
            Arc::new(MemoryJournal::default()),
            handle,
            notifications,
            Arc::new(SystemClock),
        );
        (Arc::new(adapter), rx)
    }

    fn ticks(rx: &mut mpsc::Receiver<OrchestratorCommand>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(OrchestratorCommand::Event(event)) = rx.try_recv() {
            assert_eq!(event.event_type, EventType::RitualTick);
            out.push(event.metadata_str("ritual").unwrap_or_default().to_string());
        }
        out
    }

    #[tokio::test]
    async fn test_trigger_ritual_submits_tick() {
        let (adapter, mut rx) = adapter();
        trigger_ritual(&adapter, RitualKind::Pin).await.unwrap();
        assert_eq!(ticks(&mut rx), vec!["pin"]);
    }

    #[test]
    fn test_zero_interval_ignored() {
        let scheduler = RitualScheduler::new(vec![
            RitualSchedule { ritual: RitualKind::Pin, every_secs: 0 },
            RitualSchedule { ritual: RitualKind::Reconcile, every_secs: 30 },
        ]);
        assert_eq!(scheduler.schedules().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_on_interval() {
        let (adapter, mut rx) = adapter();
        let scheduler = RitualScheduler::new(vec![RitualSchedule {
            ritual: RitualKind::ExpireSignatures,
            every_secs: 60,
        }]);

        let handle = scheduler.spawn(adapter);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(ticks(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(91)).await;
        handle.stop();

        assert_eq!(ticks(&mut rx), vec!["expire-signatures", "expire-signatures"]);
    }
}
