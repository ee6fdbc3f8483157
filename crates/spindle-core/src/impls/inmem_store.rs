//! InMemoryTaskStore - テスト・開発用の TaskStore
//!
//! # 学習ポイント
//! - tokio::sync::Mutex で async コンテキストから安全に共有
//! - Vec に挿入順で保持し、`find` は created_at → 挿入順で並べる
//! - プロセスが落ちれば消えるので、再起動テストでは同じ Arc を使い回す

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{StoreError, TaskId, TaskRecord, TaskUpdate};
use crate::ports::{ArgumentSnapshot, TaskFilter, TaskStore};

#[derive(Default)]
struct Inner {
    /// 挿入順
    rows: Vec<TaskRecord>,
    snapshots: Vec<ArgumentSnapshot>,
}

/// InMemoryTaskStore はプロセス内だけで生きる TaskStore
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 記録済みのキャッシュ引数スナップショット（記録順）
    pub async fn argument_snapshots(&self) -> Vec<ArgumentSnapshot> {
        self.inner.lock().await.snapshots.clone()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.rows.iter().any(|row| row.id == record.id) {
            return Err(StoreError::Backend(format!(
                "duplicate task id {}",
                record.id
            )));
        }
        inner.rows.push(record.clone());
        Ok(())
    }

    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::NotFound(id))?;
        row.apply(&update);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.iter().find(|row| row.id == id).cloned())
    }

    async fn find(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<TaskRecord> = inner
            .rows
            .iter()
            .filter(|row| filter.matches(row.status))
            .cloned()
            .collect();
        // stable sort なので同時刻は挿入順のまま
        rows.sort_by_key(|row| row.created_at);
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn count(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        let n = inner
            .rows
            .iter()
            .filter(|row| filter.matches(row.status))
            .count();
        Ok(filter.limit.map_or(n, |limit| n.min(limit)))
    }

    async fn save_argument_snapshot(&self, snapshot: &ArgumentSnapshot) -> Result<(), StoreError> {
        self.inner.lock().await.snapshots.push(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FunctionKey, TaskStatus};
    use chrono::{Duration, TimeZone, Utc};
    use ulid::Ulid;

    fn row(offset_secs: i64) -> TaskRecord {
        TaskRecord::pending(
            TaskId::from_ulid(Ulid::new()),
            FunctionKey::new("summarize"),
            "[]".to_string(),
            "{}".to_string(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn find_orders_by_created_at_then_insertion() {
        let store = InMemoryTaskStore::new();
        let late = row(10);
        let early_a = row(0);
        let early_b = row(0);
        store.insert(&late).await.unwrap();
        store.insert(&early_a).await.unwrap();
        store.insert(&early_b).await.unwrap();

        let ids: Vec<TaskId> = store
            .find(&TaskFilter::status(TaskStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![early_a.id, early_b.id, late.id]);
    }

    #[tokio::test]
    async fn update_applies_partial_changes() {
        let store = InMemoryTaskStore::new();
        let r = row(0);
        store.insert(&r).await.unwrap();
        store.update(r.id, TaskUpdate::enqueued()).await.unwrap();

        let got = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Enqueued);
        assert_eq!(
            store.count(&TaskFilter::status(TaskStatus::Pending)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = TaskId::from_ulid(Ulid::new());
        let err = store.update(id, TaskUpdate::enqueued()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryTaskStore::new();
        let r = row(0);
        store.insert(&r).await.unwrap();
        assert!(store.insert(&r).await.is_err());
    }

    #[tokio::test]
    async fn limit_caps_find() {
        let store = InMemoryTaskStore::new();
        for i in 0..5 {
            store.insert(&row(i)).await.unwrap();
        }
        let rows = store.find(&TaskFilter::all().limit(2)).await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
