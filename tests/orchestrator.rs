//! Orchestrator Integration Tests
//!
//! Dispatch order, retries, deadlines, cancellation and recovery.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use ritual::core::clock::{Clock, ManualClock, SystemClock};
use ritual::core::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorHandle};
use ritual::core::retry::RetryPolicy;
use ritual::core::OrchestratorError;
use ritual::domain::{
    CompletionNotification, CompletionResult, Event, EventType, Notification, Task, TaskOutput, TaskState, TaskType,
};
use ritual::executors::{ExecutionOutcome, Executor, ExecutorRegistry};

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    AlwaysRetryable,
    /// Retryable failure for the first n calls
    FailTimes(u32),
    Terminal,
    Sleep(Duration),
    Panic,
}

/// Executor that records the payload label of every task it runs
struct Recorder {
    task_type: TaskType,
    behavior: Behavior,
    deadline: Duration,
    calls: AtomicU32,
    running: AtomicUsize,
    max_running: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl Recorder {
    fn new(task_type: TaskType, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            task_type,
            behavior,
            deadline: Duration::from_secs(5),
            calls: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    fn with_deadline(task_type: TaskType, behavior: Behavior, deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            task_type,
            behavior,
            deadline,
            calls: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for Recorder {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn deadline(&self) -> Duration {
        self.deadline
    }

    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let label = task.payload_str("label").unwrap_or_default().to_string();
        self.log.lock().unwrap().push(label);

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let outcome = match self.behavior {
            Behavior::Succeed => ExecutionOutcome::completed(TaskOutput::summary("ok")),
            Behavior::AlwaysRetryable => ExecutionOutcome::Retryable("provider returned 503".into()),
            Behavior::FailTimes(n) if call <= n => ExecutionOutcome::Retryable(format!("failure {call}")),
            Behavior::FailTimes(_) => ExecutionOutcome::completed(TaskOutput::summary("ok")),
            Behavior::Terminal => ExecutionOutcome::Terminal("bad input".into()),
            Behavior::Sleep(d) => {
                tokio::time::sleep(d).await;
                ExecutionOutcome::completed(TaskOutput::summary("slept"))
            }
            Behavior::Panic => panic!("executor bug"),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

fn config(max_in_flight: usize, retry: RetryPolicy) -> OrchestratorConfig {
    OrchestratorConfig {
        max_in_flight,
        retry,
        ..OrchestratorConfig::default()
    }
}

fn orchestrator(config: OrchestratorConfig, executors: Vec<Arc<Recorder>>) -> Orchestrator {
    let mut registry = ExecutorRegistry::new();
    for executor in executors {
        registry.register(executor);
    }
    Orchestrator::new(config, Arc::new(registry), Arc::new(SystemClock))
}

fn labelled(task_type: TaskType, priority: i32, label: &str) -> Task {
    Task::new("evt-test", task_type, priority, json!({ "label": label }), Utc::now())
}

#[tokio::test]
async fn test_higher_priority_dispatched_first() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Succeed);
    let mut orch = orchestrator(config(1, RetryPolicy::immediate(1)), vec![upload.clone()]);

    for priority in [3, 9, 1] {
        orch.enqueue(labelled(TaskType::Upload, priority, &priority.to_string()))
            .unwrap();
    }

    let report = orch.drain().await;
    assert_eq!(upload.log(), vec!["9", "3", "1"]);
    assert_eq!(report.completed, 3);
}

#[tokio::test]
async fn test_equal_priority_is_fifo() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Succeed);
    let mut orch = orchestrator(config(1, RetryPolicy::immediate(1)), vec![upload.clone()]);

    let now = Utc::now();
    for label in ["a", "b", "c", "d"] {
        orch.enqueue(Task::new("evt-test", TaskType::Upload, 5, json!({ "label": label }), now))
            .unwrap();
    }

    orch.drain().await;
    assert_eq!(upload.log(), vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_missing_executor_fails_without_attempt() {
    let mut orch = orchestrator(config(2, RetryPolicy::immediate(1)), vec![]);
    let id = orch.enqueue(labelled(TaskType::Pin, 2, "pin")).unwrap();

    let task = orch.task(id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.error.as_deref(), Some("No executor registered for task type pin"));
    assert!(orch.is_idle());
}

#[tokio::test]
async fn test_retry_cap_and_priority_decay() {
    let upload = Recorder::new(TaskType::Upload, Behavior::AlwaysRetryable);
    let mut orch = orchestrator(config(1, RetryPolicy::immediate(3)), vec![upload.clone()]);

    let id = orch.enqueue(labelled(TaskType::Upload, 5, "flaky")).unwrap();
    orch.drain().await;

    let task = orch.task(id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.priority, 3);
    assert!(task.error.as_deref().unwrap().starts_with("Retries exhausted after 3 attempts"));
    assert_eq!(upload.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_backoff_delays_next_attempt() {
    let upload = Recorder::new(TaskType::Upload, Behavior::FailTimes(1));
    let retry = RetryPolicy {
        max_attempts: 2,
        initial_delay_ms: 100,
        max_delay_ms: 100,
        backoff_multiplier: 1.0,
    };
    let mut orch = orchestrator(config(1, retry), vec![upload.clone()]);

    let id = orch.enqueue(labelled(TaskType::Upload, 5, "x")).unwrap();
    let started = std::time::Instant::now();
    orch.drain().await;

    assert!(started.elapsed() >= Duration::from_millis(100));
    let task = orch.task(id).unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 2);
}

#[tokio::test]
async fn test_terminal_failure_is_not_retried() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Terminal);
    let mut orch = orchestrator(config(1, RetryPolicy::immediate(3)), vec![upload.clone()]);

    let id = orch.enqueue(labelled(TaskType::Upload, 5, "bad")).unwrap();
    orch.drain().await;

    let task = orch.task(id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.error.as_deref(), Some("Terminal failure: bad input"));
}

#[tokio::test]
async fn test_in_flight_never_exceeds_limit() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Sleep(Duration::from_millis(30)));
    let mut orch = orchestrator(config(3, RetryPolicy::immediate(1)), vec![upload.clone()]);

    for i in 0..10 {
        orch.enqueue(labelled(TaskType::Upload, 5, &i.to_string())).unwrap();
    }

    let report = orch.drain().await;
    assert_eq!(report.completed, 10);
    let max = upload.max_running.load(Ordering::SeqCst);
    assert!(max <= 3, "max in flight was {max}");
    assert!(max > 1);
}

#[tokio::test]
async fn test_deadline_exceeded_fails_task() {
    let upload = Recorder::with_deadline(
        TaskType::Upload,
        Behavior::Sleep(Duration::from_secs(10)),
        Duration::from_millis(50),
    );
    let mut orch = orchestrator(config(1, RetryPolicy::immediate(1)), vec![upload]);

    let id = orch.enqueue(labelled(TaskType::Upload, 5, "slow")).unwrap();
    let started = std::time::Instant::now();
    orch.drain().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    let task = orch.task(id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.error.as_deref().unwrap().contains("Deadline exceeded"));
}

#[tokio::test]
async fn test_executor_panic_is_contained() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Panic);
    let sig = Recorder::new(TaskType::SignatureRequest, Behavior::Succeed);
    let mut orch = orchestrator(config(2, RetryPolicy::immediate(3)), vec![upload, sig.clone()]);

    let bad = orch.enqueue(labelled(TaskType::Upload, 5, "boom")).unwrap();
    let good = orch.enqueue(labelled(TaskType::SignatureRequest, 7, "fine")).unwrap();
    orch.drain().await;

    let bad = orch.task(bad).unwrap();
    assert_eq!(bad.state, TaskState::Failed);
    assert_eq!(bad.attempts, 1);
    assert!(bad.error.as_deref().unwrap().contains("panicked"));
    assert_eq!(orch.task(good).unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn test_cancel_only_while_queued() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Sleep(Duration::from_millis(200)));
    let mut orch = orchestrator(config(1, RetryPolicy::immediate(1)), vec![upload]);

    let running = orch.enqueue(labelled(TaskType::Upload, 9, "first")).unwrap();
    let waiting = orch.enqueue(labelled(TaskType::Upload, 1, "second")).unwrap();

    assert_eq!(orch.dispatch_ready(), 1);
    assert!(matches!(
        orch.cancel(running),
        Err(OrchestratorError::NotCancellable { state: TaskState::Dispatched, .. })
    ));

    let cancelled = orch.cancel(waiting).unwrap();
    assert_eq!(cancelled.id, waiting);
    assert!(orch.task(waiting).is_none());
    assert_eq!(orch.cancel(waiting), Err(OrchestratorError::TaskNotFound(waiting)));

    orch.drain().await;
    assert_eq!(orch.task(running).unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn test_maintenance_removes_old_tasks() {
    let clock = Arc::new(ManualClock::default());
    let mut orch = Orchestrator::new(
        config(1, RetryPolicy::immediate(1)),
        Arc::new(ExecutorRegistry::new().with(Recorder::new(TaskType::Upload, Behavior::Succeed))),
        clock.clone(),
    );

    let old = orch
        .enqueue(Task::new("evt-old", TaskType::Upload, 5, json!({}), clock.now()))
        .unwrap();
    clock.advance(chrono::Duration::hours(25));
    let fresh = orch
        .enqueue(Task::new("evt-new", TaskType::Upload, 5, json!({}), clock.now()))
        .unwrap();

    assert_eq!(orch.maintain(), 1);
    assert!(orch.task(old).is_none());
    assert!(orch.task(fresh).is_some());
    assert_eq!(orch.status().queued.len(), 1);
}

#[tokio::test]
async fn test_finished_task_queues_registry_notification() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Succeed);
    let notify = Recorder::new(TaskType::RegistryNotify, Behavior::Succeed);
    let mut orch = orchestrator(config(2, RetryPolicy::immediate(1)), vec![upload, notify.clone()]);
    let mut bus = orch.subscribe();

    let event = Event::new(EventType::ArtifactCreated, "build", Utc::now()).with_metadata("artifact", "out.tar");
    let ids = orch.accept_event(&event);
    assert_eq!(ids.len(), 1);

    orch.drain().await;
    assert_eq!(notify.calls.load(Ordering::SeqCst), 1);

    let notify_task = orch
        .tasks()
        .into_iter()
        .find(|t| t.task_type == TaskType::RegistryNotify)
        .unwrap();
    let payload: CompletionNotification = serde_json::from_value(notify_task.payload).unwrap();
    assert_eq!(payload.task_id, ids[0]);
    assert_eq!(payload.event_id, event.id);
    assert_eq!(payload.result, CompletionResult::Completed);
    assert_eq!(payload.artifact_ref.as_deref(), Some("out.tar"));

    match bus.try_recv().unwrap() {
        Notification::TaskCompleted(n) => assert_eq!(n.task_id, ids[0]),
        other => panic!("unexpected notification: {other:?}"),
    }
}

#[tokio::test]
async fn test_restore_requeues_interrupted_tasks() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Succeed);
    let mut orch = orchestrator(config(1, RetryPolicy::immediate(3)), vec![upload]);

    let mut interrupted = labelled(TaskType::Upload, 5, "interrupted");
    interrupted.mark_dispatched(Utc::now()).unwrap();
    let mut done = labelled(TaskType::Upload, 5, "done");
    done.mark_dispatched(Utc::now()).unwrap();
    done.complete(Utc::now(), TaskOutput::summary("ok")).unwrap();

    let requeued = orch.restore(vec![interrupted.clone(), done.clone()]);
    assert_eq!(requeued, 1);

    let restored = orch.task(interrupted.id).unwrap();
    assert_eq!(restored.state, TaskState::Queued);
    assert_eq!(restored.attempts, 1);
    assert_eq!(orch.task(done.id).unwrap().state, TaskState::Completed);

    orch.drain().await;
    let finished = orch.task(interrupted.id).unwrap();
    assert_eq!(finished.state, TaskState::Completed);
    assert_eq!(finished.attempts, 2);
}

#[tokio::test]
async fn test_service_loop_over_handle() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Succeed);
    let mut orch = orchestrator(config(2, RetryPolicy::immediate(1)), vec![upload.clone()]);
    let (handle, commands) = OrchestratorHandle::channel(16);

    let service = tokio::spawn(async move {
        orch.run(commands, None).await;
        orch
    });

    handle
        .submit_event(Event::new(EventType::ArtifactCreated, "a", Utc::now()).with_metadata("artifact", "a.tar"))
        .await
        .unwrap();
    let queued = handle.enqueue(labelled(TaskType::Upload, 1, "direct")).await.unwrap();

    let mut status = handle.status().await.unwrap();
    for _ in 0..100 {
        if status.completed >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = handle.status().await.unwrap();
    }
    assert!(status.completed >= 2);

    handle.shutdown().await.unwrap();
    let orch = tokio::time::timeout(Duration::from_secs(5), service).await.unwrap().unwrap();
    assert_eq!(orch.task(queued).unwrap().state, TaskState::Completed);
    assert_eq!(handle.status().await, Err(OrchestratorError::ShutDown));
}

#[tokio::test]
async fn test_priority_decay_saturates_at_minimum() {
    let pin = Recorder::new(TaskType::Pin, Behavior::AlwaysRetryable);
    let mut orch = orchestrator(config(1, RetryPolicy::immediate(3)), vec![pin.clone()]);

    let id = orch.enqueue(labelled(TaskType::Pin, i32::MIN, "floor")).unwrap();
    let report = orch.drain().await;

    assert_eq!(report.failed, 1);
    assert_eq!(pin.calls.load(Ordering::SeqCst), 3);
    let task = orch.task(id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.priority, i32::MIN);
    assert!(task.error.as_deref().unwrap().starts_with("Retries exhausted after 3 attempts"));
}

#[tokio::test]
async fn test_restore_fails_task_that_used_its_last_attempt() {
    let upload = Recorder::new(TaskType::Upload, Behavior::Succeed);
    let mut orch = orchestrator(config(1, RetryPolicy::immediate(3)), vec![upload.clone()]);

    let now = Utc::now();
    let mut spent = labelled(TaskType::Upload, 5, "spent");
    spent.mark_dispatched(now).unwrap();
    spent.requeue(4, now, "Retryable failure: 503").unwrap();
    spent.mark_dispatched(now).unwrap();
    spent.requeue(3, now, "Retryable failure: 503").unwrap();
    spent.mark_dispatched(now).unwrap();
    assert_eq!(spent.attempts, 3);

    assert_eq!(orch.restore(vec![spent.clone()]), 0);

    let restored = orch.task(spent.id).unwrap();
    assert_eq!(restored.state, TaskState::Failed);
    assert_eq!(restored.attempts, 3);
    assert!(restored
        .error
        .as_deref()
        .unwrap()
        .starts_with("Retries exhausted after 3 attempts"));

    orch.drain().await;
    assert_eq!(upload.calls.load(Ordering::SeqCst), 0);
}
