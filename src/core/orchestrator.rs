//! Task orchestrator.
//!
//! Converts events into tasks, keeps them in a priority queue and dispatches
//! them to executors with a bounded number in flight.
//!
//! The dispatch loop owns all task state (`&mut self`). Executors run on
//! spawned tokio tasks and report back over an unbounded channel; the loop
//! never awaits executor work directly. Each execution runs inside a nested
//! spawn (panic isolation) under its executor's deadline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use super::clock::SharedClock;
use super::error::{ExecutionError, OrchestratorError, ValidationError};
use super::planner::{plan_follow_up, plan_notification, plan_tasks};
use super::queue::TaskQueue;
use super::retry::RetryPolicy;
use super::snapshot::SnapshotWriter;
use crate::domain::{CompletionNotification, Event, Notification, Task, TaskId, TaskState, TaskType};
use crate::executors::{Completion, ExecutionOutcome, ExecutorRegistry};

/// Capacity of the broadcast notification bus
pub const NOTIFICATION_CAPACITY: usize = 256;

/// Longest the service loop sleeps with nothing to do
const IDLE_TICK: Duration = Duration::from_secs(5);

/// Orchestrator limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum concurrently dispatched tasks
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Attempts per task and backoff between them
    #[serde(default = "default_task_retry")]
    pub retry: RetryPolicy,

    /// Priority lost on every retry
    #[serde(default = "default_priority_decay")]
    pub priority_decay: i32,

    /// Age after which maintenance removes a task
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    /// How often the service loop runs maintenance
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

fn default_max_in_flight() -> usize {
    4
}
fn default_task_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1000,
        max_delay_ms: 16000,
        backoff_multiplier: 2.0,
    }
}
fn default_priority_decay() -> i32 {
    1
}
fn default_retention_hours() -> i64 {
    24
}
fn default_maintenance_interval() -> u64 {
    600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            retry: default_task_retry(),
            priority_decay: default_priority_decay(),
            retention_hours: default_retention_hours(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

/// Result of one execution, sent from a worker back to the loop
#[derive(Debug)]
struct ExecutionReport {
    task_id: TaskId,
    result: Result<Completion, ExecutionError>,
}

/// What a call to [`Orchestrator::drain`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
}

/// One line of queue status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub event_ref: String,
    pub priority: i32,
    pub state: TaskState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type,
            event_ref: task.event_ref.clone(),
            priority: task.priority,
            state: task.state,
            attempts: task.attempts,
            not_before: task.not_before,
            error: task.error.clone(),
        }
    }
}

/// Snapshot of queue contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Queued tasks in dispatch order
    pub queued: Vec<TaskSummary>,
    pub in_flight: Vec<TaskSummary>,
    pub completed: usize,
    pub failed: usize,
    /// Failed tasks, most recent first
    pub failures: Vec<TaskSummary>,
}

/// Commands accepted by the service loop
#[derive(Debug)]
pub enum OrchestratorCommand {
    Event(Event),
    Enqueue {
        task: Task,
        reply: oneshot::Sender<Result<TaskId, OrchestratorError>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<Result<Task, OrchestratorError>>,
    },
    Status {
        reply: oneshot::Sender<QueueStatus>,
    },
    Shutdown,
}

/// Cloneable sender side of the command channel
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorCommand>,
}

impl OrchestratorHandle {
    /// Create a handle and the receiver to pass to [`Orchestrator::run`]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OrchestratorCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn send(&self, command: OrchestratorCommand) -> Result<(), OrchestratorError> {
        self.tx.send(command).await.map_err(|_| OrchestratorError::ShutDown)
    }

    pub async fn submit_event(&self, event: Event) -> Result<(), OrchestratorError> {
        self.send(OrchestratorCommand::Event(event)).await
    }

    pub async fn enqueue(&self, task: Task) -> Result<TaskId, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCommand::Enqueue { task, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::ShutDown)?
    }

    pub async fn cancel(&self, id: TaskId) -> Result<Task, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCommand::Cancel { id, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::ShutDown)?
    }

    pub async fn status(&self) -> Result<QueueStatus, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(OrchestratorCommand::Status { reply }).await?;
        rx.await.map_err(|_| OrchestratorError::ShutDown)
    }

    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        self.send(OrchestratorCommand::Shutdown).await
    }
}

/// Main task orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    executors: Arc<ExecutorRegistry>,
    clock: SharedClock,
    tasks: HashMap<TaskId, Task>,
    queue: TaskQueue,
    in_flight: HashSet<TaskId>,
    results_tx: mpsc::UnboundedSender<ExecutionReport>,
    results_rx: mpsc::UnboundedReceiver<ExecutionReport>,
    notifications: broadcast::Sender<Notification>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(mut config: OrchestratorConfig, executors: Arc<ExecutorRegistry>, clock: SharedClock) -> Self {
        config.max_in_flight = config.max_in_flight.max(1);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Self {
            config,
            executors,
            clock,
            tasks: HashMap::new(),
            queue: TaskQueue::new(),
            in_flight: HashSet::new(),
            results_tx,
            results_rx,
            notifications,
        }
    }

    /// Publish on an existing notification bus
    pub fn with_notifications(mut self, notifications: broadcast::Sender<Notification>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn notifications(&self) -> broadcast::Sender<Notification> {
        self.notifications.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Add a queued task.
    ///
    /// A task with no registered executor is failed immediately without an
    /// attempt.
    pub fn enqueue(&mut self, task: Task) -> Result<TaskId, OrchestratorError> {
        if task.state != TaskState::Queued {
            return Err(ValidationError::InvalidTask(format!("task {} is not queued ({:?})", task.id, task.state)).into());
        }
        if self.tasks.contains_key(&task.id) {
            return Err(OrchestratorError::DuplicateTask(task.id));
        }

        let id = task.id;
        let task_type = task.task_type;
        let priority = task.priority;
        let created_at = task.created_at;
        self.tasks.insert(id, task);

        if !self.executors.contains(task_type) {
            let err = ExecutionError::NoExecutor(task_type);
            warn!(task_id = %id, task_type = %task_type, "No executor registered, failing task");
            self.fail_task(id, err.to_string());
            return Ok(id);
        }

        self.queue.push(id, priority, created_at);
        debug!(task_id = %id, task_type = %task_type, priority, "Task queued");
        Ok(id)
    }

    /// Plan and enqueue the tasks for an accepted event
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub fn accept_event(&mut self, event: &Event) -> Vec<TaskId> {
        let now = self.clock.now();
        let mut ids = Vec::new();

        for task in plan_tasks(event, now) {
            match self.enqueue(task) {
                Ok(id) => ids.push(id),
                Err(e) => error!(error = %e, "Failed to enqueue planned task"),
            }
        }

        info!(tasks = ids.len(), "Event accepted");
        ids
    }

    /// Cancel a queued task, removing it from the orchestrator
    pub fn cancel(&mut self, id: TaskId) -> Result<Task, OrchestratorError> {
        let task = self.tasks.get(&id).ok_or(OrchestratorError::TaskNotFound(id))?;
        if task.state != TaskState::Queued {
            return Err(OrchestratorError::NotCancellable { id, state: task.state });
        }

        self.queue.remove(id);
        let task = self.tasks.remove(&id).ok_or(OrchestratorError::TaskNotFound(id))?;
        info!(task_id = %id, "Task cancelled");
        Ok(task)
    }

    /// Dispatch ready tasks while a slot is free; returns how many were dispatched
    pub fn dispatch_ready(&mut self) -> usize {
        let mut dispatched = 0;

        while self.in_flight.len() < self.config.max_in_flight {
            let now = self.clock.now();
            let tasks = &self.tasks;
            let Some(id) = self
                .queue
                .pop_ready(|id| tasks.get(&id).map_or(false, |t| t.is_ready(now)))
            else {
                break;
            };

            if self.spawn(id, now) {
                dispatched += 1;
            }
        }

        dispatched
    }

    fn spawn(&mut self, id: TaskId, now: DateTime<Utc>) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        let Some(executor) = self.executors.get(task.task_type) else {
            let err = ExecutionError::NoExecutor(task.task_type);
            self.fail_task(id, err.to_string());
            return false;
        };
        if let Err(e) = task.mark_dispatched(now) {
            error!(error = %e, "Refusing to dispatch task");
            return false;
        }

        info!(
            task_id = %id,
            task_type = %task.task_type,
            priority = task.priority,
            attempt = task.attempts,
            "Dispatching task"
        );

        self.in_flight.insert(id);
        let snapshot = task.clone();
        let deadline = executor.deadline();
        let results = self.results_tx.clone();

        tokio::spawn(async move {
            let mut work = tokio::spawn(async move { executor.execute(&snapshot).await });

            let result = match tokio::time::timeout(deadline, &mut work).await {
                Ok(Ok(ExecutionOutcome::Completed(completion))) => Ok(completion),
                Ok(Ok(ExecutionOutcome::Retryable(reason))) => Err(ExecutionError::Retryable(reason)),
                Ok(Ok(ExecutionOutcome::Terminal(reason))) => Err(ExecutionError::Terminal(reason)),
                Ok(Err(join_err)) => Err(ExecutionError::Terminal(format!("executor panicked: {join_err}"))),
                Err(_) => {
                    work.abort();
                    Err(ExecutionError::DeadlineExceeded {
                        seconds: deadline.as_secs(),
                    })
                }
            };

            // Receiver only goes away when the orchestrator is dropped
            let _ = results.send(ExecutionReport { task_id: id, result });
        });

        true
    }

    /// Apply an execution report; returns the terminal state if one was reached
    fn apply_report(&mut self, report: ExecutionReport) -> Option<TaskState> {
        self.in_flight.remove(&report.task_id);
        let now = self.clock.now();
        let id = report.task_id;

        let Some(task) = self.tasks.get_mut(&id) else {
            warn!(task_id = %id, "Result for unknown task dropped");
            return None;
        };

        match report.result {
            Ok(completion) => {
                if let Err(e) = task.complete(now, completion.output) {
                    error!(error = %e, "Could not complete task");
                    return None;
                }
                info!(task_id = %id, task_type = %task.task_type, attempts = task.attempts, "Task completed");

                let parent = task.clone();
                for follow_up in &completion.follow_ups {
                    let next = plan_follow_up(&parent, follow_up, now);
                    if let Err(e) = self.enqueue(next) {
                        error!(error = %e, "Failed to enqueue follow-up");
                    }
                }

                self.finish(id);
                Some(TaskState::Completed)
            }
            Err(err) if err.is_retryable() && self.config.retry.should_retry(task.attempts) => {
                let delay = self.config.retry.delay_for_attempt(task.attempts);
                let not_before = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let priority = task.priority.saturating_sub(self.config.priority_decay);

                if let Err(e) = task.requeue(priority, not_before, err.to_string()) {
                    error!(error = %e, "Could not requeue task");
                    return None;
                }

                warn!(
                    task_id = %id,
                    attempt = task.attempts,
                    priority,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Task failed, retrying"
                );
                let created_at = task.created_at;
                self.queue.push(id, priority, created_at);
                None
            }
            Err(err) => {
                let message = if err.is_retryable() {
                    ExecutionError::RetriesExhausted {
                        attempts: task.attempts,
                        last_error: err.to_string(),
                    }
                    .to_string()
                } else {
                    err.to_string()
                };
                self.fail_task(id, message);
                Some(TaskState::Failed)
            }
        }
    }

    fn fail_task(&mut self, id: TaskId, error: String) {
        let now = self.clock.now();
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if let Err(e) = task.fail(now, error.clone()) {
            error!(error = %e, "Could not fail task");
            return;
        }
        warn!(task_id = %id, task_type = %task.task_type, attempts = task.attempts, error = %error, "Task failed");
        self.finish(id);
    }

    /// Publish the completion and queue its registry delivery
    fn finish(&mut self, id: TaskId) {
        let now = self.clock.now();
        let Some(task) = self.tasks.get(&id) else {
            return;
        };

        if let Some(notification) = CompletionNotification::from_task(task) {
            // No subscribers is fine
            let _ = self.notifications.send(Notification::TaskCompleted(notification));
        }

        if let Some(notify) = plan_notification(task, now) {
            if let Err(e) = self.enqueue(notify) {
                error!(error = %e, "Failed to enqueue registry notification");
            }
        }
    }

    /// Time until the next backed-off task becomes ready
    fn next_retry_in(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Queued && !self.in_flight.contains(&t.id))
            .filter_map(|t| t.not_before)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO).max(Duration::from_millis(1)))
    }

    /// Run until the queue and the in-flight set are both empty
    #[instrument(skip(self))]
    pub async fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();

        loop {
            report.dispatched += self.dispatch_ready();

            if self.in_flight.is_empty() && self.queue.is_empty() {
                break;
            }

            let wait = self.next_retry_in().unwrap_or(IDLE_TICK);
            let received = if self.in_flight.is_empty() {
                tokio::time::sleep(wait).await;
                None
            } else {
                tokio::select! {
                    result = self.results_rx.recv() => result,
                    _ = tokio::time::sleep(wait) => None,
                }
            };

            if let Some(result) = received {
                match self.apply_report(result) {
                    Some(TaskState::Completed) => report.completed += 1,
                    Some(TaskState::Failed) => report.failed += 1,
                    _ => {}
                }
            }
        }

        info!(
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed,
            "Queue drained"
        );
        report
    }

    /// Remove tasks older than the retention window (except those in flight)
    #[instrument(skip(self))]
    pub fn maintain(&mut self) -> usize {
        let cutoff = self.clock.now() - chrono::Duration::hours(self.config.retention_hours);

        let expired: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.created_at < cutoff && !self.in_flight.contains(&t.id))
            .map(|t| t.id)
            .collect();

        for id in &expired {
            self.queue.remove(*id);
            self.tasks.remove(id);
        }

        if !expired.is_empty() {
            info!(removed = expired.len(), "Removed tasks past retention");
        }
        expired.len()
    }

    pub fn status(&self) -> QueueStatus {
        let queued = self
            .queue
            .ordered_ids()
            .into_iter()
            .filter_map(|id| self.tasks.get(&id))
            .map(TaskSummary::from)
            .collect();

        let mut in_flight: Vec<&Task> = self.in_flight.iter().filter_map(|id| self.tasks.get(id)).collect();
        in_flight.sort_by_key(|t| t.started_at);

        let mut failures: Vec<&Task> = self.tasks.values().filter(|t| t.state == TaskState::Failed).collect();
        failures.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

        QueueStatus {
            queued,
            in_flight: in_flight.into_iter().map(TaskSummary::from).collect(),
            completed: self.tasks.values().filter(|t| t.state == TaskState::Completed).count(),
            failed: failures.len(),
            failures: failures.into_iter().map(TaskSummary::from).collect(),
        }
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks, oldest first
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.queue.is_empty()
    }

    /// Replace state with tasks from a snapshot.
    ///
    /// Tasks that were dispatched when the snapshot was taken go back to the
    /// queue; their attempt stays counted. One that already used its last
    /// attempt is failed instead.
    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    pub fn restore(&mut self, tasks: Vec<Task>) -> usize {
        self.tasks.clear();
        self.queue = TaskQueue::new();
        let mut requeued = 0;
        let mut exhausted = Vec::new();

        let mut tasks = tasks;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        for mut task in tasks {
            if task.state == TaskState::Dispatched {
                if self.config.retry.should_retry(task.attempts) {
                    if task.recover().is_ok() {
                        requeued += 1;
                    }
                } else {
                    exhausted.push((task.id, task.attempts, task.error.clone()));
                }
            }
            if task.state == TaskState::Queued {
                self.queue.push(task.id, task.priority, task.created_at);
            }
            self.tasks.insert(task.id, task);
        }

        for (id, attempts, last_error) in exhausted {
            let err = ExecutionError::RetriesExhausted {
                attempts,
                last_error: last_error.unwrap_or_else(|| "interrupted while dispatched".to_string()),
            };
            self.fail_task(id, err.to_string());
        }

        info!(tasks = self.tasks.len(), requeued, "Orchestrator state restored");
        requeued
    }

    /// Apply one command; returns `false` on shutdown
    pub fn handle_command(&mut self, command: OrchestratorCommand) -> bool {
        match command {
            OrchestratorCommand::Event(event) => {
                self.accept_event(&event);
            }
            OrchestratorCommand::Enqueue { task, reply } => {
                let _ = reply.send(self.enqueue(task));
            }
            OrchestratorCommand::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            OrchestratorCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            OrchestratorCommand::Shutdown => return false,
        }
        true
    }

    /// Apply every command already waiting on the channel
    pub fn pump(&mut self, commands: &mut mpsc::Receiver<OrchestratorCommand>) -> usize {
        let mut handled = 0;
        while let Ok(command) = commands.try_recv() {
            handled += 1;
            if !self.handle_command(command) {
                break;
            }
        }
        handled
    }

    /// Service loop: handle commands and results until shutdown.
    ///
    /// In-flight tasks are allowed to finish after `Shutdown`; nothing new is
    /// dispatched.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<OrchestratorCommand>,
        snapshots: Option<SnapshotWriter>,
    ) {
        enum Wake {
            Command(Option<OrchestratorCommand>),
            Report(ExecutionReport),
            Tick,
        }

        let maintenance_every = Duration::from_secs(self.config.maintenance_interval_secs);
        let mut last_maintenance = Instant::now();
        info!(max_in_flight = self.config.max_in_flight, "Orchestrator running");

        loop {
            self.dispatch_ready();
            let wait = self.next_retry_in().unwrap_or(IDLE_TICK);

            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some(report) = self.results_rx.recv() => Wake::Report(report),
                _ = tokio::time::sleep(wait) => Wake::Tick,
            };

            let changed = match wake {
                Wake::Command(Some(command)) => {
                    let is_query = matches!(command, OrchestratorCommand::Status { .. });
                    if !self.handle_command(command) {
                        break;
                    }
                    !is_query
                }
                Wake::Command(None) => break,
                Wake::Report(report) => {
                    self.apply_report(report);
                    true
                }
                Wake::Tick => false,
            };

            if last_maintenance.elapsed() >= maintenance_every {
                self.maintain();
                last_maintenance = Instant::now();
            }

            if changed {
                self.write_snapshot(snapshots.as_ref()).await;
            }
        }

        info!(in_flight = self.in_flight.len(), "Shutting down, waiting for in-flight tasks");
        while !self.in_flight.is_empty() {
            match self.results_rx.recv().await {
                Some(report) => {
                    self.apply_report(report);
                }
                None => break,
            }
        }

        self.write_snapshot(snapshots.as_ref()).await;
        info!("Orchestrator stopped");
    }

    async fn write_snapshot(&self, snapshots: Option<&SnapshotWriter>) {
        if let Some(writer) = snapshots {
            if let Err(e) = writer.write(self.tasks()).await {
                error!(error = %e, "Failed to write snapshot");
            }
        }
    }
}
