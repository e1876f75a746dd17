//! # QQBot Core
//!
//! Shared building blocks for the QQBot gateway crates: the error type,
//! TOML configuration, and the traits external collaborators implement.

pub mod config;
pub mod error;
pub mod traits;

pub use config::{LoggingConfig, QqBotConfig, SchedulerConfig};
pub use error::{QqBotError, Result};
pub use traits::{CommandExecutor, CommandOutput};
