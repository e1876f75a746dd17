//! File-based task store — the only component that mutates tasks.
//!
//! All tasks live in memory and are written out as one versioned JSON
//! document on every mutation:
//!
//! ```text
//! { "version": 1, "savedAt": <epoch ms>, "tasks": [ ... ] }
//! ```
//!
//! Before the primary file is overwritten it is copied to a sibling backup
//! (`tasks.json` → `tasks.backup.json`). Loading falls back to the backup
//! when the primary cannot be parsed, and to an empty store when both fail.

use std::path::{Path, PathBuf};

use qqbot_core::config::QqBotConfig;
use qqbot_core::error::{QqBotError, Result};
use serde::{Deserialize, Serialize};

use crate::tasks::{
    CreateTaskParams, Task, TaskResult, TaskSchedule, TaskStatistics, TaskStatus, TaskType,
    TaskUpdate, now_millis,
};

/// Version written into every saved document.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Default number of results kept per task.
pub const DEFAULT_MAX_HISTORY_SIZE: usize = 100;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreDocument {
    version: u32,
    saved_at: i64,
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Durable task CRUD over a JSON file.
pub struct TaskStore {
    path: PathBuf,
    backup_path: PathBuf,
    /// Creation order is preserved; the scheduler relies on it for fairness.
    tasks: Vec<Task>,
    max_history_size: usize,
}

impl TaskStore {
    /// Create an empty store backed by `path`. Nothing is read until
    /// [`TaskStore::initialize`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_path = backup_path_for(&path);
        Self {
            path,
            backup_path,
            tasks: Vec::new(),
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
        }
    }

    /// Create a store and load whatever is on disk.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(path);
        store.initialize();
        store
    }

    /// Cap on `execution_history` per task (minimum 1).
    pub fn with_max_history(mut self, max_history_size: usize) -> Self {
        self.max_history_size = max_history_size.max(1);
        for task in self.tasks.iter_mut() {
            trim_history(task, self.max_history_size);
        }
        self
    }

    /// Default store path (~/.qqbot/scheduler/tasks.json).
    pub fn default_path() -> PathBuf {
        QqBotConfig::home_dir().join("scheduler").join("tasks.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }

    /// Load tasks from disk, replacing the in-memory set. Never fails:
    /// a broken primary falls back to the backup, and two broken files
    /// yield an empty store. Returns the number of tasks loaded.
    pub fn initialize(&mut self) -> usize {
        let document = match load_document(&self.path) {
            Ok(Some(doc)) => Some(doc),
            Ok(None) => {
                tracing::debug!("No task file at {}", self.path.display());
                self.load_backup()
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ Failed to load {}: {e}; trying backup",
                    self.path.display()
                );
                self.load_backup()
            }
        };

        let mut tasks = document.map(|doc| doc.tasks).unwrap_or_default();
        for task in tasks.iter_mut() {
            // A task persisted mid-run belongs to a process that no longer exists.
            if task.status == TaskStatus::Running {
                tracing::info!("♻️ Task '{}' was running at shutdown, resetting to pending", task.name);
                task.status = TaskStatus::Pending;
            }
            trim_history(task, self.max_history_size);
        }
        self.tasks = tasks;
        tracing::info!("📂 Loaded {} tasks from {}", self.tasks.len(), self.path.display());
        self.tasks.len()
    }

    fn load_backup(&self) -> Option<StoreDocument> {
        match load_document(&self.backup_path) {
            Ok(Some(doc)) => {
                tracing::info!("🛟 Recovered {} tasks from {}", doc.tasks.len(), self.backup_path.display());
                Some(doc)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    "⚠️ Backup {} is unusable too ({e}); starting with no tasks",
                    self.backup_path.display()
                );
                None
            }
        }
    }

    /// Write all tasks to disk, copying the previous file to the backup
    /// path first.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| QqBotError::Persistence(format!("create {}: {e}", parent.display())))?;
        }

        let document = StoreDocument {
            version: STORE_FORMAT_VERSION,
            saved_at: now_millis(),
            tasks: self.tasks.clone(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        if self.path.exists()
            && let Err(e) = std::fs::copy(&self.path, &self.backup_path)
        {
            tracing::warn!("⚠️ Failed to back up {}: {e}", self.path.display());
        }

        std::fs::write(&self.path, json)
            .map_err(|e| QqBotError::Persistence(format!("write {}: {e}", self.path.display())))?;
        tracing::debug!("💾 Saved {} tasks to {}", self.tasks.len(), self.path.display());
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.save().inspect_err(|e| {
            tracing::error!("❌ Failed to save tasks (in-memory state kept): {e}");
        })
    }

    /// Validate `params`, create the task, and persist it. On a save error
    /// the task is dropped again so an `Err` always means "not created".
    pub fn create_task(&mut self, params: CreateTaskParams) -> Result<Task> {
        let schedule = params.validate()?;
        let now = now_millis();
        let next_execution_time = schedule.initial_execution_time(now);

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: params.name,
            description: params.description,
            schedule,
            status: TaskStatus::Pending,
            command: params.command,
            created_at: now,
            updated_at: now,
            created_by: params.created_by,
            enabled: params.enabled,
            notify_qq: params.notify_qq,
            notify_target: params.notify_target,
            save_result: params.save_result,
            result_dir: params.result_dir,
            timeout_ms: params.timeout_ms,
            execution_history: Vec::new(),
            next_execution_time: Some(next_execution_time),
            last_execution_time: None,
            execution_count: 0,
            failure_count: 0,
        };

        self.tasks.push(task.clone());
        if let Err(e) = self.persist() {
            self.tasks.retain(|t| t.id != task.id);
            return Err(e);
        }
        tracing::info!("📅 Task created: '{}' ({}, {})", task.name, task.task_type(), task.id);
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// All tasks in creation order.
    pub fn all_tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn tasks_by_type(&self, task_type: TaskType) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.task_type() == task_type).collect()
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.status == status).collect()
    }

    pub fn enabled_tasks(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.enabled).collect()
    }

    /// Tasks due at `now`, in creation order.
    pub fn due_tasks(&self, now: i64) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.is_due(now)).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Merge the set fields of `update` into the task. Returns `Ok(None)`
    /// for an unknown id. A config that doesn't match the task's type is
    /// rejected without touching the task.
    pub fn update_task(&mut self, id: &str, update: TaskUpdate) -> Result<Option<Task>> {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };

        let schedule = match (&task.schedule, update.periodic_config, update.scheduled_config) {
            (_, None, None) => None,
            (TaskSchedule::Periodic { .. }, Some(periodic_config), None) => {
                periodic_config.validate()?;
                Some(TaskSchedule::Periodic { periodic_config })
            }
            (TaskSchedule::Scheduled { .. }, None, Some(scheduled_config)) => {
                Some(TaskSchedule::Scheduled { scheduled_config })
            }
            _ => {
                return Err(QqBotError::InvalidTask(format!(
                    "task type '{}' cannot be changed",
                    task.task_type()
                )));
            }
        };

        if let Some(name) = update.name {
            task.name = name;
        }
        if let Some(description) = update.description {
            task.description = description;
        }
        if let Some(command) = update.command {
            task.command = command;
        }
        if let Some(enabled) = update.enabled {
            task.enabled = enabled;
        }
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(notify_qq) = update.notify_qq {
            task.notify_qq = notify_qq;
        }
        if let Some(target) = update.notify_target {
            task.notify_target = Some(target);
        }
        if let Some(save_result) = update.save_result {
            task.save_result = save_result;
        }
        if let Some(dir) = update.result_dir {
            task.result_dir = Some(dir);
        }
        if let Some(timeout_ms) = update.timeout_ms {
            task.timeout_ms = Some(timeout_ms);
        }
        if let Some(schedule) = schedule {
            // A new fixed time for a one-shot task is its next execution.
            if let TaskSchedule::Scheduled { scheduled_config } = &schedule {
                task.next_execution_time = Some(scheduled_config.scheduled_time);
            }
            task.schedule = schedule;
        }
        if let Some(next) = update.next_execution_time {
            task.next_execution_time = Some(next);
        }
        task.updated_at = now_millis();

        let updated = task.clone();
        self.persist()?;
        Ok(Some(updated))
    }

    /// Hard-delete a task. Returns whether it existed.
    pub fn delete_task(&mut self, id: &str) -> Result<bool> {
        let len = self.tasks.len();
        self.tasks.retain(|t| t.id != id);
        if self.tasks.len() == len {
            return Ok(false);
        }
        self.persist()?;
        tracing::info!("🗑️ Task deleted: {id}");
        Ok(true)
    }

    /// Set a task's status. Returns whether the task exists.
    pub fn update_task_status(&mut self, id: &str, status: TaskStatus) -> Result<bool> {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(false);
        };
        task.status = status;
        task.updated_at = now_millis();
        self.persist()?;
        Ok(true)
    }

    /// Record a finished execution: append to history (trimming the oldest
    /// entries), bump counters, and move the task to its next state.
    ///
    /// - periodic: back to `pending` at `now + interval`; `completed` once
    ///   `max_runs` is reached; `failed` after an error when
    ///   `continue_on_error` is off.
    /// - scheduled: `completed` or `failed`, never rescheduled.
    /// - paused/cancelled tasks keep their status and are not rescheduled.
    pub fn add_execution_history(&mut self, id: &str, result: TaskResult) -> Result<bool> {
        let max_history_size = self.max_history_size;
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(false);
        };

        let now = now_millis();
        let success = result.success;
        task.last_execution_time = Some(result.start_time);
        task.execution_count = task.execution_count.saturating_add(1);
        if !success {
            task.failure_count = task.failure_count.saturating_add(1);
        }
        task.execution_history.push(result);
        trim_history(task, max_history_size);

        if task.status.is_held() {
            task.next_execution_time = None;
        } else {
            match &task.schedule {
                TaskSchedule::Periodic { periodic_config } => {
                    let exhausted = periodic_config
                        .max_runs
                        .is_some_and(|max| task.execution_count >= max);
                    if exhausted {
                        task.status = TaskStatus::Completed;
                        task.next_execution_time = None;
                        tracing::info!("🏁 Task '{}' reached maxRuns, completed", task.name);
                    } else if !success && !periodic_config.continue_on_error {
                        task.status = TaskStatus::Failed;
                        task.next_execution_time = None;
                        tracing::warn!("⛔ Task '{}' failed and stops rescheduling", task.name);
                    } else {
                        task.status = TaskStatus::Pending;
                        task.next_execution_time =
                            Some(now.saturating_add(periodic_config.interval_millis()));
                    }
                }
                TaskSchedule::Scheduled { .. } => {
                    task.status = if success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    task.next_execution_time = None;
                }
            }
        }
        task.updated_at = now;

        self.persist()?;
        Ok(true)
    }

    /// Task counts plus execution totals across all histories. "Today"
    /// starts at local midnight.
    pub fn statistics(&self) -> TaskStatistics {
        let midnight = local_midnight_millis();
        let mut stats = TaskStatistics {
            total_tasks: self.tasks.len(),
            ..TaskStatistics::default()
        };

        for task in &self.tasks {
            match task.task_type() {
                TaskType::Periodic => stats.periodic_tasks += 1,
                TaskType::Scheduled => stats.scheduled_tasks += 1,
            }
            if task.enabled {
                stats.enabled_tasks += 1;
            }
            match task.status {
                TaskStatus::Running => stats.running_tasks += 1,
                TaskStatus::Pending => stats.pending_tasks += 1,
                _ => {}
            }
            for result in &task.execution_history {
                stats.total_executions += 1;
                if result.success {
                    stats.success_executions += 1;
                } else {
                    stats.failed_executions += 1;
                }
                if result.end_time >= midnight {
                    stats.today_executions += 1;
                }
            }
        }
        stats
    }
}

fn trim_history(task: &mut Task, max: usize) {
    if task.execution_history.len() > max {
        let drop_count = task.execution_history.len() - max;
        task.execution_history.drain(0..drop_count);
    }
}

/// `Ok(None)` when the file does not exist.
fn load_document(path: &Path) -> Result<Option<StoreDocument>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let document: StoreDocument = serde_json::from_slice(&bytes)?;
    if document.version > STORE_FORMAT_VERSION {
        tracing::warn!(
            "⚠️ {} has format version {} (newer than {}), reading anyway",
            path.display(),
            document.version,
            STORE_FORMAT_VERSION
        );
    }
    Ok(Some(document))
}

/// `dir/tasks.json` → `dir/tasks.backup.json`.
pub fn backup_path_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tasks".into());
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}.backup.{}", ext.to_string_lossy()),
        None => format!("{stem}.backup"),
    };
    path.with_file_name(file_name)
}

/// Epoch millis of today's local midnight.
pub fn local_midnight_millis() -> i64 {
    let now = chrono::Local::now();
    let midnight = now.date_naive().and_time(chrono::NaiveTime::MIN);
    midnight
        .and_local_timezone(chrono::Local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| midnight.and_utc().timestamp_millis())
}
