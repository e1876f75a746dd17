//! # QQBot Scheduler
//!
//! Background task scheduler for the QQ chat-bot gateway: periodic and
//! one-shot tasks whose commands are handed to an agent (or shell) executor.
//!
//! ## Design Principles
//! - Single process, flat JSON file — no database
//! - Backup-before-overwrite persistence, never crash on a corrupt file
//! - Tokio timers only — zero overhead when idle
//! - Bounded concurrency, at most one execution per task at a time
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval, heartbeat)
//!   ├── TaskStore: due + enabled + pending tasks, creation order
//!   ├── in-flight registry: concurrency budget + per-task lock
//!   ├── TaskRunner → CommandExecutor (timeout, cancellation)
//!   │     └── result file (saveResult)
//!   └── on finish → TaskStore.add_execution_history → NotifyHub
//!                      ├── PeriodicTask: pending again at now + interval
//!                      └── ScheduledTask: completed | failed
//! ```

pub mod engine;
pub mod executor;
pub mod notify;
pub mod runner;
pub mod store;
pub mod tasks;

pub use engine::SchedulerEngine;
pub use executor::ShellExecutor;
pub use notify::{NotifyHub, TaskNotification};
pub use runner::TaskRunner;
pub use store::TaskStore;
pub use tasks::{
    CreateTaskParams, PeriodicConfig, ScheduledConfig, Task, TaskResult, TaskSchedule,
    TaskStatistics, TaskStatus, TaskType, TaskUpdate,
};
