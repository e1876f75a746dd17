//! Collaborator traits implemented outside the scheduler core.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Outcome reported by a [`CommandExecutor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Runs an opaque task command (an agent prompt, a shell line, ...).
///
/// The scheduler never interprets `command`. Implementations should stop
/// their work when `cancel` fires or `timeout` elapses; the caller enforces
/// the timeout on its side as well, so an executor that ignores it only
/// leaks its own background work.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<CommandOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_constructors() {
        let ok = CommandOutput::ok("done");
        assert!(ok.success);
        assert_eq!(ok.output.as_deref(), Some("done"));
        assert!(ok.error.is_none());

        let failed = CommandOutput::failed("boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_output_skips_empty_fields() {
        let json = serde_json::to_string(&CommandOutput::ok("x")).unwrap();
        assert_eq!(json, r#"{"success":true,"output":"x"}"#);
    }
}
