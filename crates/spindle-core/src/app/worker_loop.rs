//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. JobQueue::pop() で job 取得（shutdown と競合させる）
//! 2. completion handle を claim（running に登録）
//! 3. function key から callable を解決
//! 4. rate limiter を待つ（キャンセルと競合させる）
//! 5. 開始直前にもう一度キャンセルを確認し、in-progress を永続化して
//!    blocking pool で cutoff 付き実行（呼び出し側のキャンセルと競合させる）
//! 6. 結果を永続化してから handle を解決
//! 7. retire（参照カウント -1、bookkeeping の削除）

use std::any::Any;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::job_queue::QueuedJob;
use super::scheduler::SchedulerInner;
use super::state::Interrupt;
use crate::domain::{TaskError, TaskStatus, TaskUpdate};
use crate::typed::handle::CompletionSender;
use crate::typed::{Completion, DynCallable};

const CANCELLED_BY_CALLER: &str = "cancelled by caller";
const DROPPED_BEFORE_EXECUTION: &str = "handle dropped before execution";

pub(crate) async fn worker_loop(
    worker_id: usize,
    inner: Arc<SchedulerInner>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let job = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            job = inner.queue.pop() => job,
        };

        set_busy(&inner, worker_id, true).await;
        run_job(&inner, worker_id, job).await;
        set_busy(&inner, worker_id, false).await;
    }
    debug!(worker_id, "worker stopped");
}

async fn set_busy(inner: &SchedulerInner, worker_id: usize, busy: bool) {
    inner
        .state
        .lock()
        .await
        .set_worker(worker_id, busy, tokio::time::Instant::now());
}

enum Claim {
    Run {
        tx: CompletionSender,
        interrupt: Arc<Interrupt>,
        callable: Option<Arc<dyn DynCallable>>,
    },
    /// Cancelled while waiting in the queue.
    Cancelled,
    /// Nobody is waiting for this task.
    Orphaned,
}

enum Finish {
    Done(Completion),
    Failed(TaskError),
    Cancelled(String),
}

async fn run_job(inner: &SchedulerInner, worker_id: usize, job: QueuedJob) {
    let QueuedJob {
        id,
        function_key,
        args,
    } = job;

    let claim = {
        let mut st = inner.state.lock().await;
        st.queued.remove(&id);
        match st.handles.remove(&id) {
            Some(tx) => {
                let interrupt = Arc::new(Interrupt::default());
                st.running.insert(id, Arc::clone(&interrupt));
                let callable = st.functions.get(&function_key);
                Claim::Run {
                    tx,
                    interrupt,
                    callable,
                }
            }
            None if st.cancelled.remove(&id) => Claim::Cancelled,
            None => Claim::Orphaned,
        }
    };

    let (mut tx, interrupt, callable) = match claim {
        Claim::Run {
            tx,
            interrupt,
            callable,
        } => (tx, interrupt, callable),
        Claim::Cancelled => {
            // 並行した enqueued の書き込みに上書きされていても cancelled に戻す
            let update = TaskUpdate {
                status: Some(TaskStatus::Cancelled),
                ..TaskUpdate::default()
            };
            inner.persist(id, update).await;
            inner.state.lock().await.retire(id);
            return;
        }
        Claim::Orphaned => {
            warn!(task_id = %id, worker_id, "no local handle to resolve task");
            inner
                .persist(id, TaskUpdate::failed("no local handle to resolve task", inner.clock.now()))
                .await;
            inner.state.lock().await.retire(id);
            return;
        }
    };

    let finish = if tx.is_closed() {
        Finish::Cancelled(DROPPED_BEFORE_EXECUTION.to_string())
    } else if let Some(callable) = callable {
        let gated = tokio::select! {
            biased;
            _ = interrupt.wait() => Some(CANCELLED_BY_CALLER),
            _ = tx.closed() => Some(DROPPED_BEFORE_EXECUTION),
            _ = inner.limiter.acquire() => None,
        };
        // a cancel can land between the limiter and the start
        let gated = gated.or_else(|| {
            if interrupt.is_fired() {
                Some(CANCELLED_BY_CALLER)
            } else if tx.is_closed() {
                Some(DROPPED_BEFORE_EXECUTION)
            } else {
                None
            }
        });
        if let Some(reason) = gated {
            Finish::Cancelled(reason.to_string())
        } else {
            inner
                .persist(id, TaskUpdate::in_progress(inner.clock.now()))
                .await;
            debug!(task_id = %id, function_key = %function_key, worker_id, "task started");

            let cutoff = inner.config.cutoff;
            let call = inner.runtime.spawn_blocking(move || callable.call(args));
            tokio::select! {
                result = tokio::time::timeout(cutoff, call) => match result {
                    Err(_) => Finish::Failed(TaskError::Timeout(cutoff)),
                    Ok(Err(join)) if join.is_panic() => {
                        Finish::Failed(TaskError::Execution(panic_message(join.into_panic())))
                    }
                    Ok(Err(join)) => Finish::Failed(TaskError::Execution(join.to_string())),
                    Ok(Ok(Err(msg))) => Finish::Failed(TaskError::Execution(msg)),
                    Ok(Ok(Ok(done))) => Finish::Done(done),
                },
                _ = tx.closed() => Finish::Cancelled("handle dropped during execution".to_string()),
                _ = interrupt.wait() => Finish::Cancelled(CANCELLED_BY_CALLER.to_string()),
            }
        }
    } else {
        Finish::Failed(TaskError::Validation(format!(
            "function {function_key} not registered"
        )))
    };

    let now = inner.clock.now();
    match finish {
        Finish::Done(done) => {
            inner
                .persist(id, TaskUpdate::completed(done.result_json, now))
                .await;
            let _ = tx.send(Ok(done.value));
            debug!(task_id = %id, worker_id, "task completed");
        }
        Finish::Failed(err) => {
            let message = match &err {
                TaskError::Timeout(cutoff) => format!("timed out after {cutoff:?}"),
                other => other.to_string(),
            };
            inner.persist(id, TaskUpdate::failed(message, now)).await;
            warn!(task_id = %id, worker_id, error = %err, "task failed");
            let _ = tx.send(Err(err));
        }
        Finish::Cancelled(reason) => {
            inner
                .persist(id, TaskUpdate::cancelled(reason.clone(), now))
                .await;
            info!(task_id = %id, worker_id, %reason, "task cancelled");
            let _ = tx.send(Err(TaskError::Cancelled(reason)));
            inner.note_cancellation(&function_key, id).await;
        }
    }

    let mut st = inner.state.lock().await;
    st.running.remove(&id);
    if !st.retire(id) {
        error!(task_id = %id, worker_id, "claimed task was already retired");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => format!("callable panicked: {msg}"),
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => format!("callable panicked: {msg}"),
            Err(_) => "callable panicked".to_string(),
        },
    }
}
