//! SQLite-backed TaskStore - 再起動をまたぐ正本
//!
//! - 接続は 1 本を `std::sync::Mutex` で共有し、操作は `spawn_blocking` で実行
//! - WAL / synchronous=NORMAL / temp_store=MEMORY で書き込み待ちを短くする
//! - "database is locked" / busy は `StoreRetryPolicy` に従って再試行
//! - タイムスタンプは固定幅の RFC3339（マイクロ秒, `Z`）なので文字列順 = 時刻順

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, params_from_iter};
use tracing::{debug, warn};

use super::retry::StoreRetryPolicy;
use crate::domain::{FunctionKey, StoreError, TaskId, TaskRecord, TaskStatus, TaskUpdate};
use crate::ports::{ArgumentSnapshot, TaskFilter, TaskStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scheduled_tasks (
    task_id      TEXT PRIMARY KEY,
    status       TEXT NOT NULL,
    function_key TEXT NOT NULL,
    args_json    TEXT NOT NULL,
    kwargs_json  TEXT NOT NULL,
    result_json  TEXT,
    error        TEXT,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_status_created
    ON scheduled_tasks (status, created_at);

CREATE TABLE IF NOT EXISTS argument_snapshots (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    function_key  TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
";

const SELECT_COLUMNS: &str = "task_id, status, function_key, args_json, kwargs_json, \
     result_json, error, created_at, started_at, completed_at";

/// SqliteTaskStore は単一ファイルの SQLite に行を保存する
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    retry: StoreRetryPolicy,
}

impl SqliteTaskStore {
    /// Open (or create) the database file and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(classify)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Self::from_connection(conn)
    }

    pub fn with_retry_policy(mut self, retry: StoreRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(classify)?;
        // journal_mode は結果行を返すので query_row で読む
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(classify)?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA temp_store = MEMORY;")
            .map_err(classify)?;
        conn.execute_batch(SCHEMA).map_err(classify)?;
        debug!(journal_mode = %mode, "sqlite task store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: StoreRetryPolicy::default(),
        })
    }

    /// All snapshots recorded for `key`, oldest first.
    pub async fn argument_snapshots(
        &self,
        key: &FunctionKey,
    ) -> Result<Vec<ArgumentSnapshot>, StoreError> {
        let key = key.as_str().to_string();
        let raw: Vec<(String, String, String)> = self
            .run("argument_snapshots", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT function_key, snapshot_json, created_at FROM argument_snapshots
                     WHERE function_key = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map([&key], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                rows.collect()
            })
            .await?;

        raw.into_iter()
            .map(|(function_key, snapshot_json, created_at)| {
                Ok(ArgumentSnapshot {
                    created_at: parse_time(&function_key, &created_at)?,
                    function_key: FunctionKey::new(function_key),
                    snapshot_json,
                })
            })
            .collect()
    }

    /// Run `op` on the blocking pool, retrying busy/locked failures.
    async fn run<T, F>(&self, what: &'static str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut attempt = 0;
        loop {
            let conn = Arc::clone(&self.conn);
            let op = Arc::clone(&op);
            let result = tokio::task::spawn_blocking(move || {
                let guard = conn
                    .lock()
                    .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".into()))?;
                op(&guard).map_err(classify)
            })
            .await
            .map_err(|e| StoreError::Backend(format!("{what} join failed: {e}")))?;

            match result {
                Err(err) if err.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.next_delay(attempt);
                    warn!(op = what, attempt, ?delay, error = %err, "store busy, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let row = RawRow::from_record(record);
        self.run("insert", move |conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                 (task_id, status, function_key, args_json, kwargs_json,
                  result_json, error, created_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.task_id,
                    row.status,
                    row.function_key,
                    row.args_json,
                    row.kwargs_json,
                    row.result_json,
                    row.error,
                    row.created_at,
                    row.started_at,
                    row.completed_at,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<(), StoreError> {
        let task_id = id.to_string();
        let changed = self
            .run("update", move |conn| {
                conn.execute(
                    "UPDATE scheduled_tasks SET
                        status       = COALESCE(?2, status),
                        result_json  = COALESCE(?3, result_json),
                        error        = COALESCE(?4, error),
                        started_at   = COALESCE(?5, started_at),
                        completed_at = COALESCE(?6, completed_at)
                     WHERE task_id = ?1",
                    params![
                        task_id,
                        update.status.map(TaskStatus::as_str),
                        update.result_json,
                        update.error,
                        update.started_at.map(format_time),
                        update.completed_at.map(format_time),
                    ],
                )
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let task_id = id.to_string();
        let raw = self
            .run("get", move |conn| {
                conn.query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM scheduled_tasks WHERE task_id = ?1"),
                    [&task_id],
                    RawRow::from_sql,
                )
                .optional()
            })
            .await?;
        raw.map(RawRow::into_record).transpose()
    }

    async fn find(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let (clause, statuses) = status_clause(filter);
        let limit = filter.limit.map_or(-1, |n| n as i64);
        let raw: Vec<RawRow> = self
            .run("find", move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM scheduled_tasks {clause}
                     ORDER BY created_at, rowid LIMIT {limit}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(statuses.iter()), RawRow::from_sql)?;
                rows.collect()
            })
            .await?;
        raw.into_iter().map(RawRow::into_record).collect()
    }

    async fn count(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
        let (clause, statuses) = status_clause(filter);
        let n: i64 = self
            .run("count", move |conn| {
                conn.query_row(
                    &format!("SELECT COUNT(*) FROM scheduled_tasks {clause}"),
                    params_from_iter(statuses.iter()),
                    |row| row.get(0),
                )
            })
            .await?;
        let n = n.max(0) as usize;
        Ok(filter.limit.map_or(n, |limit| n.min(limit)))
    }

    async fn save_argument_snapshot(&self, snapshot: &ArgumentSnapshot) -> Result<(), StoreError> {
        let function_key = snapshot.function_key.as_str().to_string();
        let snapshot_json = snapshot.snapshot_json.clone();
        let created_at = format_time(snapshot.created_at);
        self.run("save_argument_snapshot", move |conn| {
            conn.execute(
                "INSERT INTO argument_snapshots (function_key, snapshot_json, created_at)
                 VALUES (?1, ?2, ?3)",
                params![function_key, snapshot_json, created_at],
            )
            .map(|_| ())
        })
        .await
    }
}

/// `WHERE status IN (?, ...)` と束縛値。空フィルタは全件。
fn status_clause(filter: &TaskFilter) -> (String, Vec<&'static str>) {
    if filter.statuses.is_empty() {
        return (String::new(), Vec::new());
    }
    let marks = vec!["?"; filter.statuses.len()].join(", ");
    let values = filter.statuses.iter().map(|s| s.as_str()).collect();
    (format!("WHERE status IN ({marks})"), values)
}

fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Busy(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(row: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Codec {
            row: row.to_string(),
            reason: format!("bad timestamp '{value}': {e}"),
        })
}

/// Column values exactly as stored.
struct RawRow {
    task_id: String,
    status: String,
    function_key: String,
    args_json: String,
    kwargs_json: String,
    result_json: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RawRow {
    fn from_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id.to_string(),
            status: record.status.as_str().to_string(),
            function_key: record.function_key.as_str().to_string(),
            args_json: record.args_json.clone(),
            kwargs_json: record.kwargs_json.clone(),
            result_json: record.result_json.clone(),
            error: record.error.clone(),
            created_at: format_time(record.created_at),
            started_at: record.started_at.map(format_time),
            completed_at: record.completed_at.map(format_time),
        }
    }

    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            status: row.get(1)?,
            function_key: row.get(2)?,
            args_json: row.get(3)?,
            kwargs_json: row.get(4)?,
            result_json: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        let codec = |reason: String| StoreError::Codec {
            row: self.task_id.clone(),
            reason,
        };
        let id: TaskId = self.task_id.parse().map_err(|e| codec(format!("{e}")))?;
        let status: TaskStatus = self.status.parse().map_err(|e| codec(format!("{e}")))?;
        let time = |v: &str| parse_time(&self.task_id, v);
        let optional_time = |v: &Option<String>| v.as_deref().map(time).transpose();

        Ok(TaskRecord {
            id,
            status,
            function_key: FunctionKey::new(self.function_key.clone()),
            args_json: self.args_json.clone(),
            kwargs_json: self.kwargs_json.clone(),
            result_json: self.result_json.clone(),
            error: self.error.clone(),
            created_at: time(&self.created_at)?,
            started_at: optional_time(&self.started_at)?,
            completed_at: optional_time(&self.completed_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn row(key: &str, offset_secs: i64) -> TaskRecord {
        TaskRecord::pending(
            TaskId::from_ulid(Ulid::new()),
            FunctionKey::new(key),
            r#"["post-1"]"#.to_string(),
            r#"{"temperature":0.2}"#.to_string(),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
                + chrono::Duration::milliseconds(offset_secs * 1000),
        )
    }

    #[tokio::test]
    async fn insert_then_get_preserves_every_column() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut r = row("code", 0);
        store.insert(&r).await.unwrap();

        let started = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 1).unwrap();
        store.update(r.id, TaskUpdate::in_progress(started)).await.unwrap();
        r.apply(&TaskUpdate::in_progress(started));

        assert_eq!(store.get(r.id).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let r = row("code", 0);
        {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.insert(&r).await.unwrap();
        }
        let store = SqliteTaskStore::open(&path).unwrap();
        let got = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Pending);
        assert_eq!(got.kwargs_json, r#"{"temperature":0.2}"#);
    }

    #[tokio::test]
    async fn find_filters_by_status_in_creation_order() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let second = row("code", 5);
        let first = row("code", 1);
        let done = row("code", 0);
        for r in [&second, &first, &done] {
            store.insert(r).await.unwrap();
        }
        store
            .update(done.id, TaskUpdate::completed("1".into(), Utc::now()))
            .await
            .unwrap();

        let pending = store
            .find(&TaskFilter::status(TaskStatus::Pending))
            .await
            .unwrap();
        let ids: Vec<TaskId> = pending.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);

        let limited = store
            .find(&TaskFilter::status(TaskStatus::Pending).limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        assert_eq!(store.count(&TaskFilter::all()).await.unwrap(), 3);
        assert_eq!(
            store
                .count(&TaskFilter::statuses(TaskStatus::NON_TERMINAL))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn update_keeps_columns_it_does_not_set() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let r = row("code", 0);
        store.insert(&r).await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 2).unwrap();
        store.update(r.id, TaskUpdate::in_progress(at)).await.unwrap();
        store
            .update(r.id, TaskUpdate::failed("boom", at))
            .await
            .unwrap();

        let got = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Failed);
        assert_eq!(got.started_at, Some(at));
        assert_eq!(got.error.as_deref(), Some("boom"));
        assert_eq!(got.result_json, None);
    }

    #[tokio::test]
    async fn update_of_missing_row_is_not_found() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let id = TaskId::from_ulid(Ulid::new());
        let err = store.update(id, TaskUpdate::enqueued()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn argument_snapshots_are_appended() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let key = FunctionKey::new("code");
        let snap = ArgumentSnapshot {
            function_key: key.clone(),
            snapshot_json: r#"{"args":{"0":"codebook"},"kwargs":{}}"#.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        };
        store.save_argument_snapshot(&snap).await.unwrap();

        assert_eq!(store.argument_snapshots(&key).await.unwrap(), vec![snap]);
        assert!(store
            .argument_snapshots(&FunctionKey::new("other"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn corrupt_status_is_a_codec_error() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let r = row("code", 0);
        store.insert(&r).await.unwrap();
        let task_id = r.id.to_string();
        store
            .run("corrupt", move |conn| {
                conn.execute(
                    "UPDATE scheduled_tasks SET status = 'running' WHERE task_id = ?1",
                    [&task_id],
                )
                .map(|_| ())
            })
            .await
            .unwrap();

        let err = store.get(r.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Codec { .. }));
    }

    #[test]
    fn busy_codes_are_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(classify(busy).is_transient());

        let other = rusqlite::Error::QueryReturnedNoRows;
        assert!(!classify(other).is_transient());
    }

    #[test]
    fn stored_timestamps_sort_lexically() {
        let a = format_time(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
        let b = format_time(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::microseconds(5),
        );
        assert!(a < b);
        assert_eq!(a.len(), b.len());
    }
}
