//! Shell command executor — runs a task command through `sh -c`.
//!
//! Stands in for the agent backend when the daemon runs standalone. The
//! child process is killed when the timeout elapses or the token fires.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use qqbot_core::error::{QqBotError, Result};
use qqbot_core::traits::{CommandExecutor, CommandOutput};
use tokio_util::sync::CancellationToken;

use crate::notify::truncate_chars;

const MAX_STDOUT_CHARS: usize = 5000;
const MAX_STDERR_CHARS: usize = 2000;

pub struct ShellExecutor {
    shell: String,
    working_dir: Option<std::path::PathBuf>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".into(),
            working_dir: None,
        }
    }

    pub fn with_shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c").arg(command).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(CommandOutput::failed("Command cancelled"));
            }
            res = tokio::time::timeout(timeout, cmd.output()) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(QqBotError::Executor(format!("Failed to spawn {}: {e}", self.shell)));
                }
                Err(_) => {
                    return Err(QqBotError::Timeout(format!(
                        "command exceeded {}ms",
                        timeout.as_millis()
                    )));
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(
            "🐚 `{}` exited with {:?} in {:.1}s",
            truncate_chars(command, 80),
            output.status.code(),
            start.elapsed().as_secs_f64()
        );

        if output.status.success() {
            Ok(CommandOutput::ok(truncate_chars(stdout.trim_end(), MAX_STDOUT_CHARS)))
        } else {
            let mut message = format!("Exit code {}", output.status.code().unwrap_or(-1));
            if !stderr.trim().is_empty() {
                message.push_str(": ");
                message.push_str(&truncate_chars(stderr.trim_end(), MAX_STDERR_CHARS));
            }
            Ok(CommandOutput {
                success: false,
                output: (!stdout.trim().is_empty())
                    .then(|| truncate_chars(stdout.trim_end(), MAX_STDOUT_CHARS)),
                error: Some(message),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let out = ShellExecutor::new()
            .execute("echo hello", Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let out = ShellExecutor::new()
            .execute("echo oops >&2; exit 3", Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        assert!(!out.success);
        let error = out.error.unwrap();
        assert!(error.starts_with("Exit code 3"));
        assert!(error.contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = ShellExecutor::new()
            .execute("sleep 5", Duration::from_millis(100), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QqBotError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let out = ShellExecutor::new()
            .execute("sleep 5", Duration::from_secs(10), token)
            .await
            .unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = ShellExecutor::new()
            .with_working_dir(dir.path())
            .execute("ls", Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        assert!(out.output.unwrap().contains("marker.txt"));
    }
}
