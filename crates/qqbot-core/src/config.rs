//! QQBot configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{QqBotError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QqBotConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl QqBotConfig {
    /// Load config from the default path (~/.qqbot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| QqBotError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| QqBotError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| QqBotError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the QQBot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".qqbot")
    }
}

/// Task scheduler options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Primary task file; the backup lives next to it as `<stem>.backup.<ext>`.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    /// Where execution output is written for tasks with `saveResult`.
    #[serde(default = "default_result_dir")]
    pub result_dir: String,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Wall-clock limit per execution, in milliseconds.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Polling period of the scheduler loop, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Execution results kept per task.
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
}

fn bool_true() -> bool { true }
fn default_storage_path() -> String { "~/.qqbot/scheduler/tasks.json".into() }
fn default_result_dir() -> String { "~/.qqbot/scheduler/results".into() }
fn default_max_concurrent_tasks() -> usize { 3 }
fn default_task_timeout_ms() -> u64 { 30 * 60 * 1000 }
fn default_heartbeat_interval_ms() -> u64 { 10_000 }
fn default_max_history_size() -> usize { 100 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_path: default_storage_path(),
            result_dir: default_result_dir(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_ms: default_task_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_history_size: default_max_history_size(),
        }
    }
}

impl SchedulerConfig {
    /// Storage path with `~` and env vars expanded.
    pub fn storage_path(&self) -> PathBuf {
        expand_path(&self.storage_path)
    }

    /// Result directory with `~` and env vars expanded.
    pub fn result_dir(&self) -> PathBuf {
        expand_path(&self.result_dir)
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.max_concurrent_tasks.max(1)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size.max(1)
    }
}

/// Logging output configuration (consumed by the binary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Expand `~` and `$VARS` in a configured path. Falls back to the raw string
/// when a variable is undefined.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QqBotConfig::default();
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.max_concurrent_tasks, 3);
        assert_eq!(config.scheduler.task_timeout(), Duration::from_secs(1800));
        assert_eq!(config.scheduler.max_history_size, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [scheduler]
            storage_path = "/var/lib/qqbot/tasks.json"
            max_concurrent_tasks = 5
            heartbeat_interval_ms = 500

            [logging]
            level = "debug"
            json = true
        "#;

        let config: QqBotConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.scheduler.storage_path(),
            PathBuf::from("/var/lib/qqbot/tasks.json")
        );
        assert_eq!(config.scheduler.max_concurrent_tasks(), 5);
        assert_eq!(config.scheduler.heartbeat_interval(), Duration::from_millis(500));
        // Untouched fields keep their defaults.
        assert_eq!(config.scheduler.max_history_size, 100);
        assert!(config.logging.json);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: QqBotConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.heartbeat_interval_ms, 10_000);
        assert!(config.scheduler.storage_path.ends_with("tasks.json"));
    }

    #[test]
    fn test_zero_limits_are_clamped() {
        let config = SchedulerConfig {
            max_concurrent_tasks: 0,
            heartbeat_interval_ms: 0,
            max_history_size: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.max_concurrent_tasks(), 1);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(1));
        assert_eq!(config.max_history_size(), 1);
    }

    #[test]
    fn test_tilde_expansion() {
        let config = SchedulerConfig::default();
        let path = config.storage_path();
        assert!(!path.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = QqBotConfig::default();
        config.scheduler.max_concurrent_tasks = 7;
        config.save_to(&path).unwrap();

        let loaded = QqBotConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.max_concurrent_tasks, 7);
    }

    #[test]
    fn test_load_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "scheduler = [").unwrap();
        let err = QqBotConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, QqBotError::Config(_)));
    }
}
