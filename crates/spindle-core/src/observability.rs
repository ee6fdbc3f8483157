use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

/// Row counts per persisted status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub enqueued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn set(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Pending => self.pending = n,
            TaskStatus::Enqueued => self.enqueued = n,
            TaskStatus::InProgress => self.in_progress = n,
            TaskStatus::Completed => self.completed = n,
            TaskStatus::Failed => self.failed = n,
            TaskStatus::Cancelled => self.cancelled = n,
        }
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Enqueued => self.enqueued,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    /// Rows a restart would have to reconcile.
    pub fn unfinished(&self) -> usize {
        self.pending + self.enqueued + self.in_progress
    }
}

/// Point-in-time view of a running (or stopped) scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub running: bool,
    pub workers: usize,
    pub busy_workers: usize,
    pub queue_len: usize,
    /// Completion handles not yet resolved.
    pub outstanding: usize,
    pub cached_functions: usize,
    pub rows: StatusCounts,
}
