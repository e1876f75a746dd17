//! Task runner — executes one task's command and produces a [`TaskResult`].
//!
//! Ordinary failures (executor errors, timeouts, cancellation) never escape
//! `run`; they come back as `success: false` with an `error` message.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qqbot_core::config::expand_path;
use qqbot_core::error::QqBotError;
use qqbot_core::traits::{CommandExecutor, CommandOutput};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::tasks::{CANCELLED_ERROR_PREFIX, TIMEOUT_ERROR_PREFIX, Task, TaskResult, now_millis};

/// Default wall-clock limit per execution (30 minutes).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Suffixed names tried when a result file for the same instant exists.
const MAX_RESULT_FILE_ATTEMPTS: usize = 100;

pub struct TaskRunner {
    executor: Arc<dyn CommandExecutor>,
    default_timeout: Duration,
    /// Used for `save_result` tasks without their own `result_dir`.
    result_dir: Option<PathBuf>,
}

impl TaskRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            default_timeout: DEFAULT_TASK_TIMEOUT,
            result_dir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.result_dir = Some(dir.into());
        self
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Execute `task.command`, bounded by the task's effective timeout and
    /// by `cancel`.
    pub async fn run(&self, task: &Task, cancel: CancellationToken) -> TaskResult {
        let start_time = now_millis();
        let started = Instant::now();
        let timeout = task.effective_timeout(self.default_timeout);
        let exec_token = cancel.child_token();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                CommandOutput::failed(format!("{CANCELLED_ERROR_PREFIX} by request"))
            }
            res = tokio::time::timeout(
                timeout,
                self.executor.execute(&task.command, timeout, exec_token.clone()),
            ) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(QqBotError::Timeout(_))) | Err(_) => {
                    CommandOutput::failed(timeout_message(timeout))
                }
                Ok(Err(e)) => CommandOutput::failed(e.to_string()),
            },
        };
        // Tell the executor to drop whatever it still has running.
        exec_token.cancel();

        let duration = started.elapsed().as_millis() as u64;
        let end_time = now_millis();
        let error = match (outcome.success, outcome.error) {
            (false, None) => Some("Command failed without an error message".to_string()),
            (_, error) => error,
        };

        let mut result = TaskResult {
            task_id: task.id.clone(),
            start_time,
            end_time,
            success: outcome.success,
            output: outcome.output,
            error,
            duration,
            result_file_path: None,
        };

        if result.success {
            tracing::info!("✅ Task '{}' finished in {}ms", task.name, duration);
        } else {
            tracing::warn!(
                "⚠️ Task '{}' failed after {}ms: {}",
                task.name,
                duration,
                result.error.as_deref().unwrap_or_default()
            );
        }

        if task.save_result
            && let Some(output) = result.output.as_deref()
        {
            result.result_file_path = self.save_output(task, start_time, output).await;
        }
        result
    }

    /// Write `output` to the task's result dir. Failures are logged and
    /// leave the result without a file path.
    async fn save_output(&self, task: &Task, start_time: i64, output: &str) -> Option<String> {
        let dir = match (&task.result_dir, &self.result_dir) {
            (Some(dir), _) => expand_path(dir),
            (None, Some(dir)) => dir.clone(),
            (None, None) => {
                tracing::warn!("⚠️ Task '{}' wants its result saved but no result dir is set", task.name);
                return None;
            }
        };

        let started = chrono::DateTime::from_timestamp_millis(start_time)
            .unwrap_or_else(chrono::Utc::now)
            .with_timezone(&chrono::Local);
        let stamp = started.format("%Y%m%d_%H%M%S_%3f").to_string();
        let body = format!(
            "# {}\n\n- Task ID: {}\n- Command: {}\n- Started: {}\n\n---\n\n{}\n",
            task.name,
            task.id,
            task.command,
            started.format("%Y-%m-%d %H:%M:%S%.3f"),
            output
        );

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!("⚠️ Failed to create result dir {}: {e}", dir.display());
            return None;
        }

        // Never overwrite an earlier run's file, even within one millisecond.
        for attempt in 0..MAX_RESULT_FILE_ATTEMPTS {
            let file_name = match attempt {
                0 => format!("{}_{stamp}.md", task.id),
                n => format!("{}_{stamp}_{n}.md", task.id),
            };
            let path = dir.join(file_name);
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            let mut file = match file {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    tracing::warn!("⚠️ Failed to create result file {}: {e}", path.display());
                    return None;
                }
            };
            let written = match file.write_all(body.as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            return match written {
                Ok(()) => {
                    tracing::debug!("💾 Saved result of '{}' to {}", task.name, path.display());
                    Some(path.to_string_lossy().into_owned())
                }
                Err(e) => {
                    tracing::warn!("⚠️ Failed to write result file {}: {e}", path.display());
                    None
                }
            };
        }
        tracing::warn!("⚠️ No free result file name for '{}' at {stamp}", task.name);
        None
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("{TIMEOUT_ERROR_PREFIX} after {}ms", timeout.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{CreateTaskParams, PeriodicConfig, TaskSchedule, TaskStatus};
    use async_trait::async_trait;
    use qqbot_core::error::Result;

    struct EchoExecutor;

    #[async_trait]
    impl CommandExecutor for EchoExecutor {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, command: &str, _: Duration, _: CancellationToken) -> Result<CommandOutput> {
            Ok(CommandOutput::ok(format!("ran: {command}")))
        }
    }

    struct BrokenExecutor;

    #[async_trait]
    impl CommandExecutor for BrokenExecutor {
        fn name(&self) -> &str {
            "broken"
        }

        async fn execute(&self, _: &str, _: Duration, _: CancellationToken) -> Result<CommandOutput> {
            Err(QqBotError::Executor("agent backend unreachable".into()))
        }
    }

    struct SilentFailure;

    #[async_trait]
    impl CommandExecutor for SilentFailure {
        fn name(&self) -> &str {
            "silent"
        }

        async fn execute(&self, _: &str, _: Duration, _: CancellationToken) -> Result<CommandOutput> {
            Ok(CommandOutput::default())
        }
    }

    /// Sleeps far longer than any test timeout.
    struct StuckExecutor;

    #[async_trait]
    impl CommandExecutor for StuckExecutor {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn execute(&self, _: &str, _: Duration, _: CancellationToken) -> Result<CommandOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(CommandOutput::ok("late"))
        }
    }

    fn task(command: &str) -> Task {
        let params = CreateTaskParams::periodic(
            "runner-test",
            command,
            "tester",
            PeriodicConfig::every(Duration::from_secs(60)),
        );
        let schedule: TaskSchedule = params.validate().unwrap();
        Task {
            id: "task-1".into(),
            name: params.name,
            description: String::new(),
            schedule,
            status: TaskStatus::Running,
            command: params.command,
            created_at: 0,
            updated_at: 0,
            created_by: params.created_by,
            enabled: true,
            notify_qq: false,
            notify_target: None,
            save_result: false,
            result_dir: None,
            timeout_ms: None,
            execution_history: Vec::new(),
            next_execution_time: Some(0),
            last_execution_time: None,
            execution_count: 0,
            failure_count: 0,
        }
    }

    #[tokio::test]
    async fn test_success_result() {
        let runner = TaskRunner::new(Arc::new(EchoExecutor));
        let result = runner.run(&task("hello"), CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.task_id, "task-1");
        assert_eq!(result.output.as_deref(), Some("ran: hello"));
        assert!(result.error.is_none());
        assert!(result.end_time >= result.start_time);
    }

    #[tokio::test]
    async fn test_executor_error_is_captured() {
        let runner = TaskRunner::new(Arc::new(BrokenExecutor));
        let result = runner.run(&task("x"), CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_failure_without_message_gets_one() {
        let runner = TaskRunner::new(Arc::new(SilentFailure));
        let result = runner.run(&task("x"), CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_timeout_is_distinguishable() {
        let runner = TaskRunner::new(Arc::new(StuckExecutor)).with_timeout(Duration::from_millis(50));
        let result = runner.run(&task("x"), CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.is_timeout());
        assert!(result.duration >= 50);
    }

    #[tokio::test]
    async fn test_task_timeout_overrides_default() {
        let runner = TaskRunner::new(Arc::new(StuckExecutor));
        let mut t = task("x");
        t.timeout_ms = Some(30);
        let result = runner.run(&t, CancellationToken::new()).await;
        assert!(result.is_timeout());
        assert!(result.error.unwrap().contains("30ms"));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let runner = TaskRunner::new(Arc::new(StuckExecutor));
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = runner.run(&task("x"), token).await;
        assert!(!result.success);
        assert!(result.is_cancelled());
        assert!(!result.is_timeout());
    }

    #[tokio::test]
    async fn test_save_result_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new(Arc::new(EchoExecutor)).with_result_dir(dir.path());
        let mut t = task("report");
        t.save_result = true;

        let result = runner.run(&t, CancellationToken::new()).await;
        let path = result.result_file_path.expect("result file path");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("ran: report"));
        assert!(path.starts_with(dir.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_back_to_back_runs_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new(Arc::new(EchoExecutor)).with_result_dir(dir.path());
        let mut t = task("report");
        t.save_result = true;

        let first = runner.run(&t, CancellationToken::new()).await;
        let second = runner.run(&t, CancellationToken::new()).await;
        let first_path = first.result_file_path.unwrap();
        let second_path = second.result_file_path.unwrap();
        assert_ne!(first_path, second_path);
        assert!(std::path::Path::new(&first_path).exists());
        assert!(std::path::Path::new(&second_path).exists());
        assert!(first_path.ends_with(".md"));
    }

    #[tokio::test]
    async fn test_task_result_dir_wins() {
        let default_dir = tempfile::tempdir().unwrap();
        let task_dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new(Arc::new(EchoExecutor)).with_result_dir(default_dir.path());
        let mut t = task("report");
        t.save_result = true;
        t.result_dir = Some(task_dir.path().to_string_lossy().into_owned());

        let result = runner.run(&t, CancellationToken::new()).await;
        let path = result.result_file_path.unwrap();
        assert!(path.starts_with(task_dir.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_no_result_dir_skips_file() {
        let runner = TaskRunner::new(Arc::new(EchoExecutor));
        let mut t = task("report");
        t.save_result = true;
        let result = runner.run(&t, CancellationToken::new()).await;
        assert!(result.success);
        assert!(result.result_file_path.is_none());
    }
}
