//! Task definitions — the core data model for scheduled work.
//!
//! Timestamps are epoch milliseconds throughout, matching the persisted
//! JSON format. Field names serialize in camelCase.

use std::time::Duration;

use qqbot_core::error::{QqBotError, Result};
use serde::{Deserialize, Serialize};

/// Prefix of the `error` message recorded for executions that hit their
/// timeout.
pub const TIMEOUT_ERROR_PREFIX: &str = "Task execution timed out";

/// Prefix of the `error` message recorded for cancelled executions.
pub const CANCELLED_ERROR_PREFIX: &str = "Task execution cancelled";

/// Task variant discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Repeats every `interval` milliseconds.
    Periodic,
    /// Runs once at a fixed point in time.
    Scheduled,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Periodic => write!(f, "periodic"),
            TaskType::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    /// Paused and cancelled are only entered and left through explicit
    /// commands; the scheduler loop never moves a task out of them.
    pub fn is_held(&self) -> bool {
        matches!(self, TaskStatus::Paused | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

fn bool_true() -> bool {
    true
}

/// Timing for a periodic task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicConfig {
    /// Milliseconds between the end of one run and the start of the next.
    pub interval: u64,
    /// First run at creation time instead of one interval later.
    #[serde(default)]
    pub run_immediately: bool,
    /// Stop after this many executions.
    #[serde(default)]
    pub max_runs: Option<u32>,
    /// Keep rescheduling after a failed run. Absent means `true`.
    #[serde(default = "bool_true")]
    pub continue_on_error: bool,
}

impl PeriodicConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            run_immediately: false,
            max_runs: None,
            continue_on_error: true,
        }
    }

    /// Interval as a signed offset for epoch-millis arithmetic.
    pub fn interval_millis(&self) -> i64 {
        i64::try_from(self.interval).unwrap_or(i64::MAX)
    }

    /// Reject timings the scheduler cannot honor. Shared by create and update.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(QqBotError::InvalidTask(
                "periodic interval must be greater than zero".into(),
            ));
        }
        if i64::try_from(self.interval).is_err() {
            return Err(QqBotError::InvalidTask(format!(
                "periodic interval must be at most {}ms",
                i64::MAX
            )));
        }
        if self.max_runs == Some(0) {
            return Err(QqBotError::InvalidTask(
                "maxRuns must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}

/// Timing for a one-shot task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledConfig {
    pub scheduled_time: i64,
}

/// Variant-specific part of a task, tagged by `type` in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskSchedule {
    Periodic {
        #[serde(rename = "periodicConfig")]
        periodic_config: PeriodicConfig,
    },
    Scheduled {
        #[serde(rename = "scheduledConfig")]
        scheduled_config: ScheduledConfig,
    },
}

impl TaskSchedule {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskSchedule::Periodic { .. } => TaskType::Periodic,
            TaskSchedule::Scheduled { .. } => TaskType::Scheduled,
        }
    }

    /// First execution time for a task created at `now`.
    pub fn initial_execution_time(&self, now: i64) -> i64 {
        match self {
            TaskSchedule::Periodic { periodic_config } => {
                if periodic_config.run_immediately {
                    now
                } else {
                    now.saturating_add(periodic_config.interval_millis())
                }
            }
            TaskSchedule::Scheduled { scheduled_config } => scheduled_config.scheduled_time,
        }
    }
}

/// Record of one execution attempt. Appended to history, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds.
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file_path: Option<String>,
}

impl TaskResult {
    pub fn is_timeout(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| e.starts_with(TIMEOUT_ERROR_PREFIX))
    }

    pub fn is_cancelled(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| e.starts_with(CANCELLED_ERROR_PREFIX))
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task ID, assigned at creation.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `type` plus its matching config. Immutable after creation.
    #[serde(flatten)]
    pub schedule: TaskSchedule,
    pub status: TaskStatus,
    /// Forwarded verbatim to the command executor.
    pub command: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub created_by: String,
    pub enabled: bool,
    #[serde(rename = "notifyQQ", default)]
    pub notify_qq: bool,
    /// QQ user/group the completion notice goes to.
    #[serde(default)]
    pub notify_target: Option<String>,
    #[serde(default)]
    pub save_result: bool,
    #[serde(default)]
    pub result_dir: Option<String>,
    /// Overrides the scheduler-wide execution timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub execution_history: Vec<TaskResult>,
    #[serde(default)]
    pub next_execution_time: Option<i64>,
    #[serde(default)]
    pub last_execution_time: Option<i64>,
    #[serde(default)]
    pub execution_count: u32,
    #[serde(default)]
    pub failure_count: u32,
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        self.schedule.task_type()
    }

    pub fn periodic_config(&self) -> Option<&PeriodicConfig> {
        match &self.schedule {
            TaskSchedule::Periodic { periodic_config } => Some(periodic_config),
            TaskSchedule::Scheduled { .. } => None,
        }
    }

    pub fn scheduled_config(&self) -> Option<&ScheduledConfig> {
        match &self.schedule {
            TaskSchedule::Scheduled { scheduled_config } => Some(scheduled_config),
            TaskSchedule::Periodic { .. } => None,
        }
    }

    /// Enabled, pending, and `next_execution_time <= now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.enabled
            && self.status == TaskStatus::Pending
            && self.next_execution_time.is_some_and(|next| next <= now)
    }

    /// Per-task timeout if set, else `default`.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    pub fn last_result(&self) -> Option<&TaskResult> {
        self.execution_history.last()
    }
}

/// Input for [`crate::TaskStore::create_task`].
///
/// Exactly one of `periodic_config`/`scheduled_config` must be set, matching
/// `task_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskParams {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub command: String,
    pub created_by: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(rename = "notifyQQ", default)]
    pub notify_qq: bool,
    #[serde(default)]
    pub notify_target: Option<String>,
    #[serde(default)]
    pub save_result: bool,
    #[serde(default)]
    pub result_dir: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub periodic_config: Option<PeriodicConfig>,
    #[serde(default)]
    pub scheduled_config: Option<ScheduledConfig>,
}

impl CreateTaskParams {
    fn base(name: &str, task_type: TaskType, command: &str, created_by: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            task_type,
            command: command.to_string(),
            created_by: created_by.to_string(),
            enabled: true,
            notify_qq: false,
            notify_target: None,
            save_result: false,
            result_dir: None,
            timeout_ms: None,
            periodic_config: None,
            scheduled_config: None,
        }
    }

    /// Parameters for a repeating task.
    pub fn periodic(name: &str, command: &str, created_by: &str, config: PeriodicConfig) -> Self {
        let mut params = Self::base(name, TaskType::Periodic, command, created_by);
        params.periodic_config = Some(config);
        params
    }

    /// Parameters for a one-shot task at `scheduled_time` (epoch millis).
    pub fn scheduled(name: &str, command: &str, created_by: &str, scheduled_time: i64) -> Self {
        let mut params = Self::base(name, TaskType::Scheduled, command, created_by);
        params.scheduled_config = Some(ScheduledConfig { scheduled_time });
        params
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Deliver a completion notice to `target` over QQ.
    pub fn with_notify(mut self, target: &str) -> Self {
        self.notify_qq = true;
        self.notify_target = Some(target.to_string());
        self
    }

    /// Persist execution output; `dir` overrides the scheduler's result dir.
    pub fn with_save_result(mut self, dir: Option<&str>) -> Self {
        self.save_result = true;
        self.result_dir = dir.map(str::to_string);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Check required fields and build the schedule for `task_type`.
    pub fn validate(&self) -> Result<TaskSchedule> {
        if self.name.trim().is_empty() {
            return Err(QqBotError::InvalidTask("name must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(QqBotError::InvalidTask("command must not be empty".into()));
        }
        match (self.task_type, &self.periodic_config, &self.scheduled_config) {
            (TaskType::Periodic, Some(config), None) => {
                config.validate()?;
                Ok(TaskSchedule::Periodic {
                    periodic_config: config.clone(),
                })
            }
            (TaskType::Scheduled, None, Some(config)) => Ok(TaskSchedule::Scheduled {
                scheduled_config: config.clone(),
            }),
            (task_type, _, _) => Err(QqBotError::InvalidTask(format!(
                "type '{task_type}' requires exactly its own config (periodicConfig for periodic, scheduledConfig for scheduled)"
            ))),
        }
    }
}

/// Partial update for [`crate::TaskStore::update_task`]. `None` fields are
/// left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub command: Option<String>,
    pub enabled: Option<bool>,
    pub status: Option<TaskStatus>,
    #[serde(rename = "notifyQQ")]
    pub notify_qq: Option<bool>,
    pub notify_target: Option<String>,
    pub save_result: Option<bool>,
    pub result_dir: Option<String>,
    pub timeout_ms: Option<u64>,
    pub periodic_config: Option<PeriodicConfig>,
    pub scheduled_config: Option<ScheduledConfig>,
    pub next_execution_time: Option<i64>,
}

impl TaskUpdate {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }
}

/// Aggregate counters over every task in a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatistics {
    pub total_tasks: usize,
    pub periodic_tasks: usize,
    pub scheduled_tasks: usize,
    pub enabled_tasks: usize,
    pub running_tasks: usize,
    pub pending_tasks: usize,
    /// Executions that ended since local midnight.
    pub today_executions: usize,
    pub total_executions: usize,
    pub success_executions: usize,
    pub failed_executions: usize,
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(schedule: TaskSchedule) -> Task {
        Task {
            id: "t1".into(),
            name: "Daily news".into(),
            description: String::new(),
            schedule,
            status: TaskStatus::Pending,
            command: "summarize tech news".into(),
            created_at: 1_000,
            updated_at: 1_000,
            created_by: "user-1".into(),
            enabled: true,
            notify_qq: true,
            notify_target: Some("group-42".into()),
            save_result: false,
            result_dir: None,
            timeout_ms: None,
            execution_history: Vec::new(),
            next_execution_time: Some(5_000),
            last_execution_time: None,
            execution_count: 0,
            failure_count: 0,
        }
    }

    #[test]
    fn test_serialized_shape() {
        let task = sample_task(TaskSchedule::Periodic {
            periodic_config: PeriodicConfig::every(Duration::from_secs(60)),
        });
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "periodic");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["periodicConfig"]["interval"], 60_000);
        assert_eq!(json["notifyQQ"], true);
        assert_eq!(json["nextExecutionTime"], 5_000);
        assert!(json.get("scheduledConfig").is_none());
    }

    #[test]
    fn test_scheduled_task_roundtrip() {
        let task = sample_task(TaskSchedule::Scheduled {
            scheduled_config: ScheduledConfig {
                scheduled_time: 5_000,
            },
        });
        let json = serde_json::to_string(&task).unwrap();
        let restored: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, task);
        assert_eq!(restored.task_type(), TaskType::Scheduled);
    }

    #[test]
    fn test_continue_on_error_defaults_true() {
        let config: PeriodicConfig = serde_json::from_str(r#"{"interval": 1000}"#).unwrap();
        assert!(config.continue_on_error);
        assert!(!config.run_immediately);
        assert!(config.max_runs.is_none());
    }

    #[test]
    fn test_initial_execution_time() {
        let mut config = PeriodicConfig::every(Duration::from_millis(500));
        let schedule = TaskSchedule::Periodic {
            periodic_config: config.clone(),
        };
        assert_eq!(schedule.initial_execution_time(1_000), 1_500);

        config.run_immediately = true;
        let schedule = TaskSchedule::Periodic {
            periodic_config: config,
        };
        assert_eq!(schedule.initial_execution_time(1_000), 1_000);

        let schedule = TaskSchedule::Scheduled {
            scheduled_config: ScheduledConfig {
                scheduled_time: 42,
            },
        };
        assert_eq!(schedule.initial_execution_time(1_000), 42);
    }

    #[test]
    fn test_is_due() {
        let mut task = sample_task(TaskSchedule::Periodic {
            periodic_config: PeriodicConfig::every(Duration::from_secs(1)),
        });
        assert!(!task.is_due(4_999));
        assert!(task.is_due(5_000));

        task.enabled = false;
        assert!(!task.is_due(10_000));

        task.enabled = true;
        task.status = TaskStatus::Running;
        assert!(!task.is_due(10_000));

        task.status = TaskStatus::Pending;
        task.next_execution_time = None;
        assert!(!task.is_due(10_000));
    }

    #[test]
    fn test_effective_timeout() {
        let mut task = sample_task(TaskSchedule::Periodic {
            periodic_config: PeriodicConfig::every(Duration::from_secs(1)),
        });
        let default = Duration::from_secs(1800);
        assert_eq!(task.effective_timeout(default), default);
        task.timeout_ms = Some(250);
        assert_eq!(task.effective_timeout(default), Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_mismatched_config() {
        let mut params = CreateTaskParams::scheduled("once", "echo hi", "u", 1_000);
        params.task_type = TaskType::Periodic;
        let err = params.validate().unwrap_err();
        assert!(matches!(err, QqBotError::InvalidTask(_)));

        let mut params = CreateTaskParams::periodic(
            "loop",
            "echo hi",
            "u",
            PeriodicConfig::every(Duration::from_secs(1)),
        );
        params.scheduled_config = Some(ScheduledConfig { scheduled_time: 1 });
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let params = CreateTaskParams::scheduled("  ", "echo hi", "u", 1_000);
        assert!(params.validate().is_err());
        let params = CreateTaskParams::scheduled("name", "", "u", 1_000);
        assert!(params.validate().is_err());
        let params = CreateTaskParams::periodic("p", "cmd", "u", PeriodicConfig::every(Duration::ZERO));
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_interval_beyond_epoch_range() {
        let huge = PeriodicConfig {
            interval: u64::MAX,
            ..PeriodicConfig::every(Duration::from_secs(1))
        };
        assert!(matches!(huge.validate(), Err(QqBotError::InvalidTask(_))));
        let params = CreateTaskParams::periodic("p", "cmd", "u", huge);
        assert!(params.validate().is_err());

        let largest = PeriodicConfig {
            interval: i64::MAX as u64,
            ..PeriodicConfig::every(Duration::from_secs(1))
        };
        assert!(largest.validate().is_ok());
        let schedule = TaskSchedule::Periodic { periodic_config: largest };
        assert_eq!(schedule.initial_execution_time(1_000), i64::MAX);
    }

    #[test]
    fn test_every_saturates_instead_of_truncating() {
        let config = PeriodicConfig::every(Duration::MAX);
        assert_eq!(config.interval, u64::MAX);
        assert!(config.validate().is_err());

        let params = CreateTaskParams::scheduled("s", "cmd", "u", 1).with_timeout(Duration::MAX);
        assert_eq!(params.timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn test_validate_rejects_zero_max_runs() {
        let config = PeriodicConfig {
            max_runs: Some(0),
            ..PeriodicConfig::every(Duration::from_secs(1))
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_result_error_kinds() {
        let result = TaskResult {
            task_id: "t".into(),
            start_time: 0,
            end_time: 10,
            success: false,
            output: None,
            error: Some(format!("{TIMEOUT_ERROR_PREFIX} after 10ms")),
            duration: 10,
            result_file_path: None,
        };
        assert!(result.is_timeout());
        assert!(!result.is_cancelled());
    }
}
