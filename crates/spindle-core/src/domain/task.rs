//! Task row - 永続化される 1 タスク分の行と部分更新 (`TaskUpdate`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{TaskId, TaskStatus};

/// Caller-chosen identity grouping tasks that share the same underlying
/// operation (and therefore the same callable and cached arguments).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionKey(String);

impl FunctionKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for FunctionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for FunctionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One persisted task row.
///
/// Only the *variable* part of the call is stored here; cached arguments stay
/// in process memory and are merged back in by the enqueue loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    pub function_key: FunctionKey,
    /// JSON array of variable positional arguments.
    pub args_json: String,
    /// JSON object of variable keyword arguments.
    pub kwargs_json: String,
    pub result_json: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// A freshly submitted row.
    pub fn pending(
        id: TaskId,
        function_key: FunctionKey,
        args_json: String,
        kwargs_json: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            function_key,
            args_json,
            kwargs_json,
            result_json: None,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a partial update in place (shared by the store implementations).
    pub fn apply(&mut self, update: &TaskUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(result_json) = &update.result_json {
            self.result_json = Some(result_json.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
    }
}

/// Partial update of a task row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub result_json: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn enqueued() -> Self {
        Self {
            status: Some(TaskStatus::Enqueued),
            ..Self::default()
        }
    }

    pub fn in_progress(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::InProgress),
            started_at: Some(at),
            ..Self::default()
        }
    }

    pub fn completed(result_json: String, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            result_json: Some(result_json),
            completed_at: Some(at),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(error.into()),
            completed_at: Some(at),
            ..Self::default()
        }
    }

    pub fn cancelled(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Cancelled),
            error: Some(reason.into()),
            completed_at: Some(at),
            ..Self::default()
        }
    }
}
