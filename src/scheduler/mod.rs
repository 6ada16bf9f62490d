//! Recurring task scheduler.
//!
//! Every enabled task owns one timer task. A timer fires once immediately
//! when the task is enabled and then on every interval boundary. A fire only
//! starts a run if the previous run finished and at least 90% of the interval
//! has passed since the previous start. Runs never propagate errors: the
//! outcome is recorded on the task and announced with
//! [`QuestEvent::TaskUpdated`].

pub mod executor;
pub mod store;
pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use executor::RuntimeTaskExecutor;
pub use store::TaskSnapshot;
pub use types::{ScheduledTask, TaskKind, TaskRunOutcome, TaskSpec, TaskStatus};

use crate::events::{EventBus, QuestEvent};
use crate::util::tail_chars;

/// Share of the interval that must pass between two starts.
const REENTRY_GUARD: f64 = 0.9;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduled task not found: {0}")]
    NotFound(String),

    #[error("Interval must be at least one minute")]
    InvalidInterval,

    #[error("Task snapshot failed: {0}")]
    Snapshot(String),
}

/// Runs one task. Implementations turn every failure into an error outcome.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &ScheduledTask) -> TaskRunOutcome;
}

struct TaskEntry {
    task: ScheduledTask,
    timer: Option<CancellationToken>,
    running: bool,
    last_started: Option<Instant>,
}

impl TaskEntry {
    fn new(task: ScheduledTask) -> Self {
        Self {
            task,
            timer: None,
            running: false,
            last_started: None,
        }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

struct Inner {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    executor: Arc<dyn TaskExecutor>,
    events: EventBus,
    snapshot: Option<TaskSnapshot>,
    save_lock: Mutex<()>,
    output_chars: usize,
    active: AtomicBool,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        events: EventBus,
        output_chars: usize,
        snapshot: Option<TaskSnapshot>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                executor,
                events,
                snapshot,
                save_lock: Mutex::new(()),
                output_chars,
                active: AtomicBool::new(false),
            }),
        }
    }

    /// Load tasks from the snapshot, if one is configured. Timers are not
    /// armed until [`Scheduler::start`].
    pub async fn load(&self) -> Result<usize, SchedulerError> {
        let Some(snapshot) = &self.inner.snapshot else {
            return Ok(0);
        };
        let loaded = snapshot.load().await?;
        let mut count = 0;
        let mut tasks = self.inner.tasks.lock().await;
        for task in loaded {
            if task.interval_minutes == 0 {
                warn!(task_id = %task.id, "Skipping snapshot task with zero interval");
                continue;
            }
            tasks.insert(task.id.clone(), TaskEntry::new(task));
            count += 1;
        }
        info!(count, path = %snapshot.path().display(), "Loaded scheduled tasks");
        Ok(count)
    }

    /// Arm timers for every enabled task.
    ///
    /// A task whose last run is less than one interval ago waits for the rest
    /// of that interval; anything else fires immediately.
    pub async fn start(&self) {
        self.inner.active.store(true, Ordering::SeqCst);
        let mut tasks = self.inner.tasks.lock().await;
        for entry in tasks.values_mut() {
            if entry.task.enabled && entry.timer.is_none() {
                let delay = remaining_interval(&entry.task, Utc::now());
                self.arm(entry, delay);
            }
        }
        info!(tasks = tasks.len(), "Scheduler started");
    }

    /// Cancel every timer. In-flight runs finish and are still recorded.
    pub async fn stop(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        let mut tasks = self.inner.tasks.lock().await;
        for entry in tasks.values_mut() {
            entry.disarm();
        }
        info!("Scheduler stopped");
    }

    fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub async fn list(&self) -> Vec<ScheduledTask> {
        let tasks = self.inner.tasks.lock().await;
        let mut list: Vec<_> = tasks.values().map(|e| e.task.clone()).collect();
        list.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub async fn get(&self, id: &str) -> Result<ScheduledTask, SchedulerError> {
        let tasks = self.inner.tasks.lock().await;
        tasks
            .get(id)
            .map(|e| e.task.clone())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    pub async fn create(&self, spec: TaskSpec) -> Result<ScheduledTask, SchedulerError> {
        validate(&spec)?;
        let task = ScheduledTask::new(Uuid::new_v4().to_string(), spec);
        {
            let mut tasks = self.inner.tasks.lock().await;
            let mut entry = TaskEntry::new(task.clone());
            if task.enabled && self.is_active() {
                self.arm(&mut entry, Duration::ZERO);
            }
            tasks.insert(task.id.clone(), entry);
        }
        info!(task_id = %task.id, name = %task.name, "Created scheduled task");
        self.persist().await;
        Ok(task)
    }

    /// Replace a task's editable fields.
    ///
    /// Only a change to the interval or the enabled flag touches the timer;
    /// other tasks keep their phase.
    pub async fn update(&self, id: &str, spec: TaskSpec) -> Result<ScheduledTask, SchedulerError> {
        validate(&spec)?;
        let task = {
            let mut tasks = self.inner.tasks.lock().await;
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            let was_enabled = entry.task.enabled;
            let reschedule =
                was_enabled != spec.enabled || entry.task.interval_minutes != spec.interval_minutes;
            entry.task.apply(spec);
            if reschedule {
                entry.disarm();
                if entry.task.enabled && self.is_active() {
                    let delay = if was_enabled {
                        entry.task.interval()
                    } else {
                        Duration::ZERO
                    };
                    self.arm(entry, delay);
                }
            }
            entry.task.clone()
        };
        info!(task_id = %id, "Updated scheduled task");
        self.persist().await;
        Ok(task)
    }

    /// Remove a task. Its timer is cancelled before the removal becomes
    /// visible; a run in flight finishes but is not recorded.
    pub async fn delete(&self, id: &str) -> Result<(), SchedulerError> {
        {
            let mut tasks = self.inner.tasks.lock().await;
            let mut entry = tasks
                .remove(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            entry.disarm();
        }
        info!(task_id = %id, "Deleted scheduled task");
        self.persist().await;
        Ok(())
    }

    pub async fn enable(&self, id: &str) -> Result<ScheduledTask, SchedulerError> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: &str) -> Result<ScheduledTask, SchedulerError> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledTask, SchedulerError> {
        let task = {
            let mut tasks = self.inner.tasks.lock().await;
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            if entry.task.enabled != enabled {
                entry.task.enabled = enabled;
                entry.disarm();
                if enabled && self.is_active() {
                    self.arm(entry, Duration::ZERO);
                }
            }
            entry.task.clone()
        };
        info!(task_id = %id, enabled, "Scheduled task toggled");
        self.persist().await;
        Ok(task)
    }

    /// Clear the unseen-output flag.
    pub async fn mark_seen(&self, id: &str) -> Result<ScheduledTask, SchedulerError> {
        let (task, changed) = {
            let mut tasks = self.inner.tasks.lock().await;
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            let changed = entry.task.has_unseen_output;
            entry.task.has_unseen_output = false;
            (entry.task.clone(), changed)
        };
        if changed {
            if let Some(status) = task.last_status {
                self.inner.events.publish(QuestEvent::TaskUpdated {
                    task_id: task.id.clone(),
                    status,
                    has_unseen_output: false,
                });
            }
            self.persist().await;
        }
        Ok(task)
    }

    /// Start a run outside the timer, subject to the same re-entry guard.
    /// Returns whether a run was started.
    pub async fn run_now(&self, id: &str) -> Result<bool, SchedulerError> {
        self.try_start(id, None).await
    }

    fn arm(&self, entry: &mut TaskEntry, first_delay: Duration) {
        let timer = CancellationToken::new();
        entry.timer = Some(timer.clone());

        let id = entry.task.id.clone();
        let period = entry.task.interval();
        let scheduler = self.clone();
        debug!(task_id = %id, ?first_delay, ?period, "Arming task timer");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(SchedulerError::NotFound(_)) =
                            scheduler.try_start(&id, Some(&timer)).await
                        {
                            break;
                        }
                    }
                }
            }
            debug!(task_id = %id, "Task timer stopped");
        });
    }

    async fn try_start(
        &self,
        id: &str,
        timer: Option<&CancellationToken>,
    ) -> Result<bool, SchedulerError> {
        let task = {
            let mut tasks = self.inner.tasks.lock().await;
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            // Disable/delete cancel the timer under this lock.
            if timer.is_some_and(|t| t.is_cancelled()) {
                return Ok(false);
            }
            if entry.running {
                debug!(task_id = %id, "Skipping fire: previous run still in progress");
                return Ok(false);
            }
            let guard = entry.task.interval().mul_f64(REENTRY_GUARD);
            if let Some(prev) = entry.last_started {
                if prev.elapsed() < guard {
                    debug!(task_id = %id, since_last = ?prev.elapsed(), "Skipping fire: too soon after previous start");
                    return Ok(false);
                }
            }
            entry.running = true;
            entry.last_started = Some(Instant::now());
            entry.task.clone()
        };

        info!(task_id = %task.id, name = %task.name, "Running scheduled task");
        let scheduler = self.clone();
        tokio::spawn(async move {
            let started_at = Utc::now();
            let executor = Arc::clone(&scheduler.inner.executor);
            let run_task = task.clone();
            let outcome = tokio::spawn(async move { executor.execute(&run_task).await })
                .await
                .unwrap_or_else(|e| TaskRunOutcome::error(format!("Task run aborted: {}", e)));
            scheduler.record(&task.id, started_at, outcome).await;
        });
        Ok(true)
    }

    async fn record(&self, id: &str, started_at: DateTime<Utc>, outcome: TaskRunOutcome) {
        let event = {
            let mut tasks = self.inner.tasks.lock().await;
            let Some(entry) = tasks.get_mut(id) else {
                debug!(task_id = %id, "Task deleted during run; dropping result");
                return;
            };
            entry.running = false;
            let task = &mut entry.task;
            task.last_run = Some(started_at);
            task.last_output = Some(tail_chars(&outcome.output, self.inner.output_chars));
            task.last_status = Some(outcome.status);
            task.has_unseen_output = true;
            QuestEvent::TaskUpdated {
                task_id: task.id.clone(),
                status: outcome.status,
                has_unseen_output: true,
            }
        };
        match outcome.status {
            TaskStatus::Success => info!(task_id = %id, "Scheduled task succeeded"),
            TaskStatus::Error => warn!(task_id = %id, "Scheduled task failed"),
        }
        self.inner.events.publish(event);
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(snapshot) = &self.inner.snapshot else {
            return;
        };
        let _guard = self.inner.save_lock.lock().await;
        let tasks = self.list().await;
        if let Err(e) = snapshot.save(&tasks).await {
            warn!("Failed to save scheduled tasks: {}", e);
        }
    }
}

fn validate(spec: &TaskSpec) -> Result<(), SchedulerError> {
    if spec.interval_minutes == 0 {
        return Err(SchedulerError::InvalidInterval);
    }
    Ok(())
}

/// Time left until `task` is due, judged by its last recorded run.
fn remaining_interval(task: &ScheduledTask, now: DateTime<Utc>) -> Duration {
    let Some(last) = task.last_run else {
        return Duration::ZERO;
    };
    let due = last + chrono::Duration::minutes(i64::from(task.interval_minutes));
    (due - now).to_std().unwrap_or(Duration::ZERO)
}
