//! Errors - エラー型と分類
//!
//! - `TaskError`: 1 タスク分の失敗。completion handle 経由で呼び出し元に届き、
//!   同時に行の `error` カラムにも記録される
//! - `StoreError`: 永続化レイヤーの失敗。status 書き込み中ならログのみ
//! - `ArgumentError`: 引数の split/merge/deferred の不整合
//! - `SchedulerError`: 構築・submit・start の失敗（呼び出し元へ同期的に返す）

use std::time::Duration;

use thiserror::Error;

use super::TaskId;

/// Per-task failure delivered through the completion handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Function key or renderer not registered when the task was scheduled.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task exceeded cutoff of {0:?}")]
    Timeout(Duration),

    #[error("task cancelled: {0}")]
    Cancelled(String),

    /// The callable (or a deferred renderer) returned an error or panicked.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Persisted arguments could not be decoded or merged.
    #[error("malformed task payload: {0}")]
    Serialization(String),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }
}

/// Failure of the persistent task store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend was locked/busy; callers may retry.
    #[error("store busy: {0}")]
    Busy(String),

    #[error("store backend error: {0}")]
    Backend(String),

    /// A persisted row could not be converted back into a `TaskRecord`.
    #[error("corrupt row {row}: {reason}")]
    Codec { row: String, reason: String },

    #[error("task {0} not found")]
    NotFound(TaskId),
}

impl StoreError {
    /// Should the operation be retried after a backoff?
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

/// Inconsistency between a cache spec, cached values and variable values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("positional slot {0} has neither a cached nor a variable value")]
    Gap(usize),

    #[error("deferred argument '{0}' must be a cached keyword")]
    DeferredNotCached(String),

    #[error("deferred positional argument at index {0} is not supported")]
    DeferredPositional(usize),

    #[error("at most one deferred keyword is allowed per function key, got {0}")]
    MultipleDeferred(usize),
}

/// Invalid scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid config `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

/// Errors surfaced synchronously to the scheduler's caller.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error("unknown renderer '{0}'")]
    UnknownRenderer(String),

    #[error("renderer '{0}' registered twice")]
    DuplicateRenderer(String),

    #[error("could not encode arguments: {0}")]
    Encode(#[from] serde_json::Error),

    /// The background context could not be started.
    #[error("scheduler failed to start: {0}")]
    Startup(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_busy_is_transient() {
        assert!(StoreError::Busy("database is locked".into()).is_transient());
        assert!(!StoreError::Backend("disk I/O".into()).is_transient());
    }

    #[test]
    fn timeout_message_names_cutoff() {
        let err = TaskError::Timeout(Duration::from_secs(3));
        assert_eq!(err.to_string(), "task exceeded cutoff of 3s");
    }

    #[test]
    fn scheduler_error_wraps_store_error() {
        let err: SchedulerError = StoreError::Backend("gone".into()).into();
        assert!(matches!(err, SchedulerError::Store(StoreError::Backend(_))));
        assert_eq!(err.to_string(), "store backend error: gone");
    }
}
