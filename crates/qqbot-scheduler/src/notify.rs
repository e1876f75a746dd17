//! Completion notifications — hands finished results to whoever reports
//! them back to the user (the QQ message layer, a dashboard, logs).
//! Lightweight: a broadcast channel plus a small in-memory history.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

use crate::tasks::{Task, TaskResult};

/// Notifications kept in memory.
const HISTORY_LIMIT: usize = 100;

/// Buffered notifications per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Output shown in a chat summary before truncation.
const SUMMARY_OUTPUT_CHARS: usize = 500;

/// One finished execution, with the delivery hints copied from its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNotification {
    pub task_id: String,
    pub task_name: String,
    #[serde(rename = "notifyQQ")]
    pub notify_qq: bool,
    pub notify_target: Option<String>,
    pub result: TaskResult,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TaskNotification {
    pub fn new(task: &Task, result: TaskResult) -> Self {
        Self {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            notify_qq: task.notify_qq,
            notify_target: task.notify_target.clone(),
            result,
            timestamp: chrono::Utc::now(),
        }
    }

    /// The task asked for a QQ message and says where to send it.
    pub fn should_deliver(&self) -> bool {
        self.notify_qq && self.notify_target.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Chat-ready text describing the outcome.
    pub fn summary(&self) -> String {
        let secs = self.result.duration as f64 / 1000.0;
        let mut text = if self.result.success {
            format!("✅ Task '{}' completed in {secs:.1}s", self.task_name)
        } else if self.result.is_timeout() {
            format!("⏱️ Task '{}' timed out after {secs:.1}s", self.task_name)
        } else {
            format!(
                "❌ Task '{}' failed after {secs:.1}s: {}",
                self.task_name,
                self.result.error.as_deref().unwrap_or("unknown error")
            )
        };
        if let Some(output) = self.result.output.as_deref().filter(|o| !o.trim().is_empty()) {
            text.push_str("\n\n");
            text.push_str(&truncate_chars(output.trim(), SUMMARY_OUTPUT_CHARS));
        }
        if let Some(path) = &self.result.result_file_path {
            text.push_str(&format!("\n\n📄 Saved to {path}"));
        }
        text
    }
}

/// Fan-out point for task notifications. Cheap to clone.
#[derive(Clone)]
pub struct NotifyHub {
    sender: broadcast::Sender<TaskNotification>,
    history: Arc<Mutex<VecDeque<TaskNotification>>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Arc::new(Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT))),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.sender.subscribe()
    }

    /// Record and broadcast. Having no subscribers is fine.
    pub async fn publish(&self, notification: TaskNotification) {
        {
            let mut history = self.history.lock().await;
            if history.len() >= HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(notification.clone());
        }
        if self.sender.send(notification).is_err() {
            tracing::debug!("No notification subscribers");
        }
    }

    /// Most recent notifications, oldest first.
    pub async fn history(&self) -> Vec<TaskNotification> {
        self.history.lock().await.iter().cloned().collect()
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Cut `s` to at most `max` characters, marking the cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
