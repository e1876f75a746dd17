//! Scheduler engine — the polling loop that picks due tasks and runs them.
//!
//! On every heartbeat the engine takes enabled, pending, due tasks from the
//! store in creation order, up to the free concurrency budget, marks them
//! `running`, and spawns one execution each. A finished execution is
//! recorded back into the store and published on the [`NotifyHub`].
//!
//! The in-flight registry (task id → cancellation token) is both the
//! concurrency counter and the per-task lock: a task id present in it is
//! never dispatched again until its previous execution has been recorded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use qqbot_core::config::SchedulerConfig;
use qqbot_core::error::Result;
use qqbot_core::traits::CommandExecutor;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::notify::{NotifyHub, TaskNotification};
use crate::runner::TaskRunner;
use crate::store::TaskStore;
use crate::tasks::{Task, TaskResult, TaskSchedule, TaskStatus, TaskUpdate, now_millis};

/// Recorded when an executor panics mid-run.
pub const EXECUTOR_PANIC_ERROR: &str = "Task executor panicked";

/// The scheduler engine — owns the loop, shares the store.
pub struct SchedulerEngine {
    store: Arc<Mutex<TaskStore>>,
    runner: Arc<TaskRunner>,
    notify: NotifyHub,
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
    max_concurrent: usize,
    heartbeat: Duration,
    shutdown: CancellationToken,
}

impl SchedulerEngine {
    /// Create an engine over an already-initialized store.
    pub fn new(store: TaskStore, runner: TaskRunner, config: &SchedulerConfig) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            runner: Arc::new(runner),
            notify: NotifyHub::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            max_concurrent: config.max_concurrent_tasks(),
            heartbeat: config.heartbeat_interval(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Open the configured store and wire a runner around `executor`.
    pub fn from_config(config: &SchedulerConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let store = TaskStore::open(config.storage_path()).with_max_history(config.max_history_size());
        let runner = TaskRunner::new(executor)
            .with_timeout(config.task_timeout())
            .with_result_dir(config.result_dir());
        Self::new(store, runner, config)
    }

    /// Shared handle for task CRUD from the command layer.
    pub fn store(&self) -> Arc<Mutex<TaskStore>> {
        Arc::clone(&self.store)
    }

    pub fn notifications(&self) -> &NotifyHub {
        &self.notify
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.notify.subscribe()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Executions currently in flight.
    pub async fn running_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.in_flight.lock().await.contains_key(id)
    }

    /// Dispatch every task that is due now, within the concurrency budget.
    /// Returns one handle per spawned execution; each resolves after the
    /// result has been recorded and published.
    pub async fn tick(&self) -> Vec<JoinHandle<()>> {
        let mut in_flight = self.in_flight.lock().await;
        let budget = self.max_concurrent.saturating_sub(in_flight.len());
        if budget == 0 {
            tracing::debug!("⏳ Concurrency limit reached ({} running)", in_flight.len());
            return Vec::new();
        }

        let now = now_millis();
        let selected: Vec<Task> = {
            let mut store = self.store.lock().await;
            let picked: Vec<Task> = store
                .due_tasks(now)
                .into_iter()
                .filter(|t| !in_flight.contains_key(&t.id))
                .take(budget)
                .cloned()
                .collect();
            for task in &picked {
                if let Err(e) = store.update_task_status(&task.id, TaskStatus::Running) {
                    tracing::warn!("⚠️ Task '{}' marked running in memory only: {e}", task.name);
                }
            }
            picked
        };

        let mut handles = Vec::with_capacity(selected.len());
        for task in selected {
            let token = CancellationToken::new();
            in_flight.insert(task.id.clone(), token.clone());
            handles.push(self.spawn_execution(task, token));
        }
        handles
    }

    fn spawn_execution(&self, task: Task, token: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let runner = Arc::clone(&self.runner);
        let in_flight = Arc::clone(&self.in_flight);
        let notify = self.notify.clone();

        tokio::spawn(async move {
            tracing::info!(
                "🔔 Task triggered: '{}' ({}) via {}",
                task.name,
                task.id,
                runner.executor_name()
            );
            // A panicking executor still records a result and frees the slot.
            let start_time = now_millis();
            let execution = {
                let runner = Arc::clone(&runner);
                let task = task.clone();
                tokio::spawn(async move { runner.run(&task, token).await })
            };
            let result = match execution.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("💥 Execution of '{}' aborted: {e}", task.name);
                    let message = if e.is_panic() {
                        EXECUTOR_PANIC_ERROR
                    } else {
                        "Task execution aborted"
                    };
                    aborted_result(&task.id, start_time, message)
                }
            };

            {
                let mut store = store.lock().await;
                match store.add_execution_history(&task.id, result.clone()) {
                    Ok(true) => {}
                    Ok(false) => tracing::info!("Task '{}' was deleted while running", task.name),
                    Err(e) => tracing::warn!("⚠️ Result of '{}' recorded in memory only: {e}", task.name),
                }
            }
            in_flight.lock().await.remove(&task.id);

            notify.publish(TaskNotification::new(&task, result)).await;
        })
    }

    /// Run the polling loop until [`SchedulerEngine::stop`]. Executions
    /// already in flight finish on their own.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                "⏰ Scheduler started (heartbeat {}ms, max {} concurrent)",
                self.heartbeat.as_millis(),
                self.max_concurrent
            );
            let mut interval = tokio::time::interval(self.heartbeat);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let dispatched = self.tick().await;
                        if !dispatched.is_empty() {
                            tracing::debug!("Dispatched {} task(s)", dispatched.len());
                        }
                    }
                }
            }
            tracing::info!("⏹️ Scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Enable or disable a task. Disabling never recomputes its timing, so
    /// a re-enabled overdue task runs on the next tick.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let mut store = self.store.lock().await;
        Ok(store.update_task(id, TaskUpdate::enabled(enabled))?.is_some())
    }

    pub async fn pause_task(&self, id: &str) -> Result<bool> {
        self.store.lock().await.update_task_status(id, TaskStatus::Paused)
    }

    /// Move a paused, cancelled or failed task back to pending. A task with
    /// no next execution time gets one: one interval from now (periodic) or
    /// its fixed time (scheduled). Returns `false` when the task is unknown
    /// or not in a resumable state.
    pub async fn resume_task(&self, id: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        let Some(task) = store.get_task(id) else {
            return Ok(false);
        };
        if !matches!(
            task.status,
            TaskStatus::Paused | TaskStatus::Cancelled | TaskStatus::Failed
        ) {
            return Ok(false);
        }

        let next_execution_time = task.next_execution_time.or_else(|| match &task.schedule {
            TaskSchedule::Periodic { periodic_config } => {
                Some(now_millis().saturating_add(periodic_config.interval_millis()))
            }
            TaskSchedule::Scheduled { scheduled_config } => Some(scheduled_config.scheduled_time),
        });
        let update = TaskUpdate {
            status: Some(TaskStatus::Pending),
            next_execution_time,
            ..TaskUpdate::default()
        };
        Ok(store.update_task(id, update)?.is_some())
    }

    /// Mark a task cancelled and abort its in-flight execution, if any.
    pub async fn cancel_task(&self, id: &str) -> Result<bool> {
        let found = self.store.lock().await.update_task_status(id, TaskStatus::Cancelled)?;
        if let Some(token) = self.in_flight.lock().await.get(id) {
            tracing::info!("🛑 Cancelling in-flight execution of {id}");
            token.cancel();
        }
        Ok(found)
    }

    /// Make a pending task due immediately. Returns `false` for unknown or
    /// non-pending tasks.
    pub async fn trigger_now(&self, id: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        if store.get_task(id).is_none_or(|t| t.status != TaskStatus::Pending) {
            return Ok(false);
        }
        let update = TaskUpdate {
            next_execution_time: Some(now_millis()),
            ..TaskUpdate::default()
        };
        Ok(store.update_task(id, update)?.is_some())
    }
}

fn aborted_result(task_id: &str, start_time: i64, message: &str) -> TaskResult {
    let end_time = now_millis();
    TaskResult {
        task_id: task_id.to_string(),
        start_time,
        end_time,
        success: false,
        output: None,
        error: Some(message.to_string()),
        duration: end_time.saturating_sub(start_time).max(0) as u64,
        result_file_path: None,
    }
}
