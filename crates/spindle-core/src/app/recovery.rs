//! Recovery - 再起動時に残っていた未完了行の回収
//!
//! # フロー
//! 1. TaskStore::find() で pending / enqueued / in-progress の行を取得
//! 2. 構築直後の function cache は空なので、すべて failed にする
//!
//! 読み出しの失敗は構築エラー（scheduler を返さない）。
//! 個々の更新の失敗はログに残して続行する。

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{StoreError, TaskStatus, TaskUpdate};
use crate::ports::{Clock, TaskFilter, TaskStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Non-terminal rows found.
    pub scanned: usize,
    /// Rows marked failed.
    pub failed: usize,
    /// Rows whose update did not go through.
    pub errors: usize,
}

pub async fn recover(store: &dyn TaskStore, clock: &dyn Clock) -> Result<RecoveryReport, StoreError> {
    let rows = store
        .find(&TaskFilter::statuses(TaskStatus::NON_TERMINAL))
        .await?;

    let mut report = RecoveryReport {
        scanned: rows.len(),
        ..RecoveryReport::default()
    };
    for row in rows {
        let message = format!("function {} not registered after restart", row.function_key);
        match store
            .update(row.id, TaskUpdate::failed(message, clock.now()))
            .await
        {
            Ok(()) => report.failed += 1,
            Err(err) => {
                warn!(task_id = %row.id, error = %err, "could not fail unfinished task");
                report.errors += 1;
            }
        }
    }

    if report.scanned > 0 {
        info!(
            scanned = report.scanned,
            failed = report.failed,
            errors = report.errors,
            "recovered unfinished tasks"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FunctionKey, TaskId, TaskRecord};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    #[tokio::test]
    async fn fails_every_unfinished_row() {
        let store = InMemoryTaskStore::new();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let clock = FixedClock::new(at);

        let mut ids = Vec::new();
        for status in TaskStatus::ALL {
            let id = TaskId::from_ulid(Ulid::new());
            let mut row = TaskRecord::pending(id, FunctionKey::new("code"), "[]".into(), "{}".into(), at);
            row.status = status;
            store.insert(&row).await.unwrap();
            ids.push((id, status));
        }

        let report = recover(&store, &clock).await.unwrap();
        assert_eq!(report, RecoveryReport { scanned: 3, failed: 3, errors: 0 });

        for (id, before) in ids {
            let row = store.get(id).await.unwrap().unwrap();
            if before.is_terminal() {
                assert_eq!(row.status, before);
            } else {
                assert_eq!(row.status, TaskStatus::Failed);
                assert_eq!(row.error.as_deref(), Some("function code not registered after restart"));
                assert_eq!(row.completed_at, Some(at));
            }
        }
    }

    #[tokio::test]
    async fn empty_store_is_a_noop() {
        let store = InMemoryTaskStore::new();
        let report = recover(&store, &crate::ports::SystemClock).await.unwrap();
        assert_eq!(report, RecoveryReport::default());
    }
}
