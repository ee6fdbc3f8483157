//! EnqueueLoop - pending 行を JobQueue へ移す
//!
//! # フロー
//! 1. JobQueue の空き容量を計算（0 なら空きを待つ）
//! 2. TaskStore::find() で pending 行を created_at 順に取得
//! 3. キャッシュ引数と行の可変引数を merge、deferred があれば render
//! 4. enqueued を永続化してから JobQueue::push()
//!
//! 壊れた行は失敗として記録し、handle も型付きエラーで解決する
//! （呼び出し側を待たせたままにしない）。

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::job_queue::QueuedJob;
use super::scheduler::{SchedulerInner, Unclaimed};
use crate::domain::{
    CachedArguments, CallArgs, TaskError, TaskId, TaskRecord, TaskStatus, TaskUpdate, args,
};
use crate::ports::TaskFilter;

pub(crate) async fn enqueue_loop(inner: Arc<SchedulerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let poll = inner.config.enqueue_poll_interval;
    debug!("enqueue loop started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let available = inner.queue.available().await;
        if available == 0 {
            tokio::select! {
                changed = shutdown_rx.changed() => if changed.is_err() { break },
                _ = inner.queue.space_available() => {}
                _ = tokio::time::sleep(poll) => {}
            }
            continue;
        }

        let pushed = enqueue_batch(&inner, available).await;
        if pushed == 0 {
            tokio::select! {
                changed = shutdown_rx.changed() => if changed.is_err() { break },
                _ = inner.enqueue_wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
    debug!("enqueue loop stopped");
}

/// Move up to `available` pending rows into the queue. Returns how many moved.
async fn enqueue_batch(inner: &SchedulerInner, available: usize) -> usize {
    // rows we are going to skip must not eat the fetch budget
    let skipped = {
        let st = inner.state.lock().await;
        st.queued.len() + st.running.len() + st.cancelled.len()
    };
    let filter = TaskFilter::status(TaskStatus::Pending).limit(available + skipped);
    let rows = match inner.store.find(&filter).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "could not fetch pending tasks");
            return 0;
        }
    };

    let mut pushed = 0;
    for row in rows {
        if pushed == available {
            break;
        }
        if enqueue_row(inner, row).await {
            pushed += 1;
        }
    }
    pushed
}

enum Plan {
    Skip,
    Orphaned,
    HandleDropped(Unclaimed),
    Enqueue(Option<CachedArguments>),
}

async fn enqueue_row(inner: &SchedulerInner, row: TaskRecord) -> bool {
    let id = row.id;
    let plan = {
        let mut st = inner.state.lock().await;
        if st.cancelled.contains(&id) || st.queued.contains(&id) || st.running.contains_key(&id) {
            Plan::Skip
        } else {
            match st.handles.get(&id).map(|tx| tx.is_closed()) {
                None => Plan::Orphaned,
                Some(true) => match st.handles.remove(&id) {
                    Some(tx) => {
                        st.cancelled.insert(id);
                        Plan::HandleDropped(Unclaimed {
                            id,
                            tx,
                            queued: false,
                        })
                    }
                    None => Plan::Skip,
                },
                Some(false) => {
                    st.queued.insert(id);
                    Plan::Enqueue(st.arguments.get(&row.function_key).cloned())
                }
            }
        }
    };

    let cached = match plan {
        Plan::Skip => return false,
        Plan::Orphaned => {
            // a concurrent cancel may have written the row after our fetch
            match inner.store.get(id).await {
                Ok(Some(current)) if current.status == TaskStatus::Pending => {}
                Ok(_) => return false,
                Err(err) => {
                    warn!(task_id = %id, error = %err, "could not re-read orphaned task");
                    return false;
                }
            }
            warn!(task_id = %id, function_key = %row.function_key, "no local handle to resolve task");
            inner
                .persist(id, TaskUpdate::failed("no local handle to resolve task", inner.clock.now()))
                .await;
            inner.state.lock().await.retire(id);
            return false;
        }
        Plan::HandleDropped(task) => {
            inner
                .cancel_unclaimed(vec![task], "handle dropped before execution")
                .await;
            inner.note_cancellation(&row.function_key, id).await;
            return false;
        }
        Plan::Enqueue(cached) => cached.unwrap_or_default(),
    };

    let call = match build_call(inner, &row, &cached).await {
        Ok(call) => call,
        Err(err) => {
            warn!(task_id = %id, function_key = %row.function_key, error = %err, "skipping malformed task");
            fail_unclaimed(inner, id, err).await;
            return false;
        }
    };

    inner.persist(id, TaskUpdate::enqueued()).await;
    inner
        .queue
        .push(QueuedJob {
            id,
            function_key: row.function_key,
            args: call,
        })
        .await;
    debug!(task_id = %id, "task enqueued");
    true
}

/// Rebuild the full call for a row: cached + variable, then render.
async fn build_call(
    inner: &SchedulerInner,
    row: &TaskRecord,
    cached: &CachedArguments,
) -> Result<CallArgs, TaskError> {
    let variable = CallArgs::from_json(&row.args_json, &row.kwargs_json)
        .map_err(|e| TaskError::Serialization(format!("variable arguments: {e}")))?;
    let merged = args::merge(cached, variable).map_err(|e| TaskError::Serialization(e.to_string()))?;

    let Some(name) = merged.renderer else {
        return Ok(merged.call);
    };
    let render = inner
        .renderers
        .get(&name)
        .ok_or_else(|| TaskError::Validation(format!("renderer '{name}' not registered")))?;

    let call = merged.call;
    let rendered = inner
        .runtime
        .spawn_blocking(move || render(&call))
        .await
        .map_err(|e| TaskError::Execution(format!("renderer '{name}' panicked: {e}")))?
        .map_err(|e| TaskError::Execution(format!("renderer '{name}' failed: {e}")))?;

    Ok(CallArgs::new(vec![rendered], Default::default()))
}

/// Fail a task the enqueue loop had claimed but could not queue.
async fn fail_unclaimed(inner: &SchedulerInner, id: TaskId, err: TaskError) {
    let tx = {
        let mut st = inner.state.lock().await;
        st.queued.remove(&id);
        st.cancelled.remove(&id);
        let tx = st.handles.remove(&id);
        st.retire(id);
        tx
    };
    // cancelled concurrently: that path already wrote the row
    let Some(tx) = tx else {
        return;
    };
    inner
        .persist(id, TaskUpdate::failed(err.to_string(), inner.clock.now()))
        .await;
    let _ = tx.send(Err(err));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::app::builder::SchedulerBuilder;
    use crate::app::scheduler::{Scheduler, Submission};
    use crate::config::SchedulerConfig;
    use crate::domain::{CacheSpec, StoreError};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{ArgumentSnapshot, TaskStore};

    use super::*;

    /// Writes every row with an undecodable `args_json`.
    #[derive(Default)]
    struct GarbledArgs(InMemoryTaskStore);

    #[async_trait]
    impl TaskStore for GarbledArgs {
        async fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
            let mut record = record.clone();
            record.args_json = "not json".to_string();
            self.0.insert(&record).await
        }
        async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<(), StoreError> {
            self.0.update(id, update).await
        }
        async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
            self.0.get(id).await
        }
        async fn find(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
            self.0.find(filter).await
        }
        async fn count(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
            self.0.count(filter).await
        }
        async fn save_argument_snapshot(&self, snapshot: &ArgumentSnapshot) -> Result<(), StoreError> {
            self.0.save_argument_snapshot(snapshot).await
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            num_workers: 1,
            enable_status_check: false,
            enqueue_poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        }
    }

    fn echo(args: CallArgs) -> Result<Value, String> {
        Ok(args.arg(0).cloned().unwrap_or(Value::Null))
    }

    async fn failed_row(scheduler: &Scheduler, id: TaskId) -> TaskRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(row) = scheduler.task(id).await.unwrap()
                    && row.status == TaskStatus::Failed
                {
                    return row;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    fn rendered(key: &str) -> Submission<fn(CallArgs) -> Result<Value, String>> {
        Submission::new(key, echo as fn(CallArgs) -> Result<Value, String>)
            .arg("codebook")
            .deferred_kwarg("prompt", "prompt")
            .cache(CacheSpec::positions([0]).with_keyword("prompt"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_arguments_fail_the_row_and_the_handle() {
        let scheduler = SchedulerBuilder::new()
            .config(config())
            .store(GarbledArgs::default())
            .build()
            .await
            .unwrap();
        let (id, handle) = scheduler
            .submit(Submission::new("echo", echo).arg(json!("hi")))
            .await
            .unwrap();

        let err = handle.await.unwrap_err();
        assert!(matches!(err, TaskError::Serialization(_)), "{err:?}");
        let row = failed_row(&scheduler, id).await;
        assert_eq!(row.error, Some(err.to_string()));
        assert_eq!(row.started_at, None);
        scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_renderer_error_fails_with_execution() {
        let scheduler = SchedulerBuilder::new()
            .config(config())
            .renderer("prompt", |_: &CallArgs| -> Result<Value, String> {
                Err("no template".to_string())
            })
            .build()
            .await
            .unwrap();
        let (id, handle) = scheduler.submit(rendered("code")).await.unwrap();

        assert_eq!(
            handle.await,
            Err(TaskError::Execution("renderer 'prompt' failed: no template".to_string()))
        );
        failed_row(&scheduler, id).await;
        scheduler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_renderer_panic_fails_with_execution() {
        let scheduler = SchedulerBuilder::new()
            .config(config())
            .renderer("prompt", |_: &CallArgs| -> Result<Value, String> {
                panic!("template exploded")
            })
            .build()
            .await
            .unwrap();
        let (id, handle) = scheduler.submit(rendered("code")).await.unwrap();

        match handle.await {
            Err(TaskError::Execution(msg)) => {
                assert!(msg.starts_with("renderer 'prompt' panicked"), "{msg}")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        failed_row(&scheduler, id).await;

        // ワーカーもループも生きている
        let (_, handle) = scheduler
            .submit(Submission::new("echo", echo).arg(json!("after")))
            .await
            .unwrap();
        assert_eq!(handle.await, Ok(json!("after")));
        scheduler.stop().await;
    }
}
