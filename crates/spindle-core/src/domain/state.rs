//! Task status - 永続化される行の状態
//!
//! # 状態遷移
//! - pending -> enqueued -> in-progress -> completed
//! - pending -> enqueued -> in-progress -> failed | cancelled
//! - pending | enqueued -> cancelled（cascade / 明示的な cancel）
//! - pending | enqueued | in-progress -> failed（recovery loader, 再起動時）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a persisted task row.
///
/// Serialized with the exact strings the store keeps (`in-progress` has a dash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Persisted by `submit`, waiting for the enqueue loop.
    Pending,

    /// Moved into the in-memory queue.
    Enqueued,

    /// Claimed by a worker; the callable is executing.
    InProgress,

    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Enqueued,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Statuses a crash can leave behind.
    pub const NON_TERMINAL: [TaskStatus; 3] = [
        TaskStatus::Pending,
        TaskStatus::Enqueued,
        TaskStatus::InProgress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Enqueued => "enqueued",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskStatus::Pending, "pending")]
    #[case(TaskStatus::Enqueued, "enqueued")]
    #[case(TaskStatus::InProgress, "in-progress")]
    #[case(TaskStatus::Completed, "completed")]
    #[case(TaskStatus::Failed, "failed")]
    #[case(TaskStatus::Cancelled, "cancelled")]
    fn store_strings_match(#[case] status: TaskStatus, #[case] text: &str) {
        assert_eq!(status.as_str(), text);
        assert_eq!(text.parse::<TaskStatus>().unwrap(), status);
        assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{text}\""));
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert_eq!(
            "running".parse::<TaskStatus>(),
            Err(UnknownStatus("running".to_string()))
        );
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::NON_TERMINAL.iter().all(|s| !s.is_terminal()));
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }
}
