//! TaskStore port - 再起動をまたぐ正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスク行（status, function key, 可変引数, result/error, timestamps）
//! - キャッシュ引数のスナップショット（観測用、実行には使わない）
//!
//! # 実装
//! - `impls::SqliteTaskStore`: 本番用（WAL, busy retry）
//! - `impls::InMemoryTaskStore`: テスト・開発用

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FunctionKey, StoreError, TaskId, TaskRecord, TaskStatus, TaskUpdate};

/// Row selection for `find` / `count`.
///
/// An empty `statuses` list matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub statuses: Vec<TaskStatus>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            statuses: vec![status],
            limit: None,
        }
    }

    pub fn statuses(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            limit: None,
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, status: TaskStatus) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&status)
    }
}

/// JSON view of a function key's cached arguments, written once when the key
/// is first seeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentSnapshot {
    pub function_key: FunctionKey,
    pub snapshot_json: String,
    pub created_at: DateTime<Utc>,
}

/// TaskStore は行の正本
///
/// # 設計原則
/// - `find` は created_at → 挿入順で返す（enqueue loop の FIFO を保証）
/// - 書き込みは行単位で atomic
/// - 一時的な busy/lock は実装側で retry し、最後まで失敗したら
///   `StoreError::Busy` を返す
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Apply a partial update. Unknown ids are `StoreError::NotFound`.
    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    async fn find(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError>;

    async fn count(&self, filter: &TaskFilter) -> Result<usize, StoreError>;

    /// Record a cached-argument snapshot. Stores without a place for it may
    /// ignore the call.
    async fn save_argument_snapshot(&self, _snapshot: &ArgumentSnapshot) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        let filter = TaskFilter::all();
        assert!(TaskStatus::ALL.iter().all(|s| filter.matches(*s)));
    }

    #[test]
    fn status_filter_is_exact() {
        let filter = TaskFilter::statuses(TaskStatus::NON_TERMINAL).limit(5);
        assert!(filter.matches(TaskStatus::InProgress));
        assert!(!filter.matches(TaskStatus::Completed));
        assert_eq!(filter.limit, Some(5));
    }
}
