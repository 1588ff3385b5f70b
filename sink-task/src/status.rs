use std::fmt;

use serde::Serialize;
use tracing::{error, info};

use crate::error::TaskFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Unassigned,
    Running,
    Paused,
    Failed,
    Destroyed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Unassigned => "unassigned",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Failed => "failed",
            TaskStatus::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state the owner wants the task in. Toggled through the task handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetState {
    #[default]
    Started,
    Paused,
}

/// Receives task lifecycle transitions.
pub trait TaskStatusListener: Send + Sync {
    fn on_startup(&self, task: &str);
    fn on_pause(&self, task: &str);
    fn on_resume(&self, task: &str);
    fn on_failure(&self, task: &str, failure: &TaskFailure);
    fn on_shutdown(&self, task: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStatusListener;

impl TaskStatusListener for LoggingStatusListener {
    fn on_startup(&self, task: &str) {
        info!(task = task, "Task started");
    }

    fn on_pause(&self, task: &str) {
        info!(task = task, "Task paused");
    }

    fn on_resume(&self, task: &str) {
        info!(task = task, "Task resumed");
    }

    fn on_failure(&self, task: &str, failure: &TaskFailure) {
        error!(task = task, error = ?failure, "Task failed");
    }

    fn on_shutdown(&self, task: &str) {
        info!(task = task, "Task shut down");
    }
}
