//! Scheduler - submit / start / stop と全体の所有者
//!
//! # 構成
//! - enqueue loop 1 本: pending 行 → JobQueue
//! - worker N 本: JobQueue → callable 実行 → 行の更新 → handle の解決
//! - status loop（任意）: idle watchdog と診断ログ
//!
//! # ロック
//! - `lifecycle`: start/stop を直列化。submit も登録が終わるまで保持する
//!   （watchdog の停止と競合しないように）
//! - `state`: プロセス内の状態すべて。store I/O 中は保持しない

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::enqueue_loop::enqueue_loop;
use super::job_queue::JobQueue;
use super::rate_limiter::RateLimiter;
use super::recovery::RecoveryReport;
use super::state::{Interrupt, SchedulerState};
use super::status_loop::status_loop;
use super::worker_loop::worker_loop;
use crate::config::SchedulerConfig;
use crate::domain::{
    Argument, CacheSpec, CallArgs, FunctionKey, SchedulerError, TaskError, TaskId, TaskRecord,
    TaskStatus, TaskUpdate, args,
};
use crate::observability::{SchedulerSnapshot, StatusCounts};
use crate::ports::{ArgumentSnapshot, Clock, IdGenerator, TaskFilter, TaskStore};
use crate::typed::handle::CompletionSender;
use crate::typed::{RendererRegistry, TaskHandle, TypedCallable};

/// One call to schedule.
///
/// ```ignore
/// let submission = Submission::new("code-posts", code_post)
///     .arg(json!(codebook))
///     .arg(json!(post))
///     .deferred_kwarg("prompt", "coding-prompt")
///     .cache(CacheSpec::positions([0]).with_keyword("prompt"));
/// let (id, handle) = scheduler.submit(submission).await?;
/// ```
pub struct Submission<F> {
    function_key: FunctionKey,
    callable: F,
    args: Vec<Argument>,
    kwargs: BTreeMap<String, Argument>,
    cache: Option<CacheSpec>,
}

impl<F> Submission<F> {
    pub fn new(function_key: impl Into<FunctionKey>, callable: F) -> Self {
        Self {
            function_key: function_key.into(),
            callable,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            cache: None,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(Argument::Value(value.into()));
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args
            .extend(values.into_iter().map(|v| Argument::Value(v.into())));
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs
            .insert(name.into(), Argument::Value(value.into()));
        self
    }

    /// Keyword argument produced by a registered renderer at enqueue time.
    /// Must also be listed as a cached keyword.
    pub fn deferred_kwarg(mut self, name: impl Into<String>, renderer: impl Into<String>) -> Self {
        self.kwargs
            .insert(name.into(), Argument::deferred(renderer));
        self
    }

    pub fn cache(mut self, spec: CacheSpec) -> Self {
        self.cache = Some(spec);
        self
    }
}

/// Why the scheduler is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Requested,
    /// Issued from the status loop itself.
    Idle,
}

#[derive(Default)]
pub(crate) struct Lifecycle {
    running: bool,
    generation: u64,
    shutdown_tx: Option<watch::Sender<bool>>,
    joins: Vec<JoinHandle<()>>,
    status_join: Option<JoinHandle<()>>,
    workers: usize,
}

impl Lifecycle {
    /// Still the run that `generation` was handed out for.
    pub(crate) fn is_generation(&self, generation: u64) -> bool {
        self.running && self.generation == generation
    }
}

pub(crate) struct SchedulerInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) renderers: RendererRegistry,
    pub(crate) runtime: Handle,
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) queue: JobQueue,
    pub(crate) limiter: RateLimiter,
    /// Signals the enqueue loop that new rows may be pending.
    pub(crate) enqueue_wake: Notify,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) recovery: RecoveryReport,
}

/// A task sitting in the store or the queue whose sender is being taken back.
pub(crate) struct Unclaimed {
    pub id: TaskId,
    pub tx: CompletionSender,
    pub queued: bool,
}

/// Cheaply cloneable handle to the scheduling subsystem.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub(crate) fn from_inner(inner: SchedulerInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Result of the recovery pass run at construction.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    /// Persist a task and return its completion handle.
    ///
    /// Starts the scheduler if it is not running. Only the variable part of
    /// the arguments is written to the store; the cached part is kept in
    /// memory under the function key (seeded by the first submission that
    /// carries a [`CacheSpec`]).
    pub async fn submit<F, R, E>(
        &self,
        submission: Submission<F>,
    ) -> Result<(TaskId, TaskHandle<R>), SchedulerError>
    where
        F: Fn(CallArgs) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize + Send + 'static,
        E: Display + 'static,
    {
        let inner = &self.inner;
        let Submission {
            function_key,
            callable,
            args: call_args,
            kwargs,
            cache,
        } = submission;

        let spec = cache.unwrap_or_default();
        let (cached, variable) = args::split(call_args, kwargs, &spec)?;
        if let Some(renderer) = cached.deferred_renderer()
            && !inner.renderers.contains(renderer)
        {
            return Err(SchedulerError::UnknownRenderer(renderer.to_string()));
        }

        let now = inner.clock.now();
        let id = inner.ids.generate_task_id();
        let record = TaskRecord::pending(
            id,
            function_key.clone(),
            variable.args_json()?,
            variable.kwargs_json()?,
            now,
        );
        let (tx, handle) = TaskHandle::<R>::channel(id);

        let seeded = {
            let mut lifecycle = inner.lifecycle.lock().await;
            if !lifecycle.running {
                Self::start_locked(inner, &mut lifecycle).await?;
            }

            let mut st = inner.state.lock().await;
            st.functions
                .register(function_key.clone(), TypedCallable::erased(callable));
            let seeded = !cached.is_empty() && !st.arguments.contains_key(&function_key);
            if seeded {
                st.arguments.insert(function_key.clone(), cached.clone());
            }
            st.handles.insert(id, tx);
            st.track(id, function_key.clone());
            seeded
        };

        if let Err(err) = inner.store.insert(&record).await {
            let mut st = inner.state.lock().await;
            st.handles.remove(&id);
            st.retire(id);
            if seeded {
                st.arguments.remove(&function_key);
            }
            return Err(err.into());
        }

        if seeded {
            let snapshot = ArgumentSnapshot {
                function_key: function_key.clone(),
                snapshot_json: cached.snapshot().to_string(),
                created_at: now,
            };
            if let Err(err) = inner.store.save_argument_snapshot(&snapshot).await {
                warn!(function_key = %function_key, error = %err, "could not save argument snapshot");
            }
        }

        debug!(task_id = %id, function_key = %function_key, "task submitted");
        inner.enqueue_wake.notify_one();
        Ok((id, handle))
    }

    /// Launch the enqueue loop, the status loop and the workers. Idempotent.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        Self::start_locked(&self.inner, &mut lifecycle).await
    }

    /// Stop every loop, drop in-memory state and resolve outstanding handles
    /// as cancelled. Persisted rows are left as they are. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        stop_locked(&self.inner, &mut lifecycle, StopReason::Requested).await;
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.running
    }

    /// Cancel a task by id. Returns `false` if it is unknown or already done.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, SchedulerError> {
        self.inner.cancel(id).await
    }

    /// Persisted row of a task.
    pub async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, SchedulerError> {
        Ok(self.inner.store.get(id).await?)
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        let (running, workers) = {
            let lifecycle = self.inner.lifecycle.lock().await;
            (lifecycle.running, lifecycle.workers)
        };
        let (busy_workers, outstanding, cached_functions) = {
            let st = self.inner.state.lock().await;
            (st.busy_workers(), st.handles.len() + st.running.len(), st.functions.len())
        };
        let queue_len = self.inner.queue.len().await;
        let rows = status_counts(self.inner.store.as_ref()).await?;

        Ok(SchedulerSnapshot {
            running,
            workers,
            busy_workers,
            queue_len,
            outstanding,
            cached_functions,
            rows,
        })
    }

    async fn start_locked(
        inner: &Arc<SchedulerInner>,
        lifecycle: &mut Lifecycle,
    ) -> Result<(), SchedulerError> {
        if lifecycle.running {
            return Ok(());
        }
        let n = inner.config.num_workers;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        lifecycle.generation += 1;
        let generation = lifecycle.generation;

        inner
            .state
            .lock()
            .await
            .reset_workers(n, tokio::time::Instant::now());

        let mut joins = Vec::with_capacity(n + 1);
        joins.push(
            inner
                .runtime
                .spawn(enqueue_loop(Arc::clone(inner), shutdown_rx.clone())),
        );
        for worker_id in 0..n {
            joins.push(inner.runtime.spawn(worker_loop(
                worker_id,
                Arc::clone(inner),
                shutdown_rx.clone(),
            )));
        }
        lifecycle.status_join = inner.config.enable_status_check.then(|| {
            inner
                .runtime
                .spawn(status_loop(Arc::clone(inner), generation, shutdown_rx))
        });

        lifecycle.shutdown_tx = Some(shutdown_tx);
        lifecycle.joins = joins;
        lifecycle.workers = n;
        lifecycle.running = true;
        info!(
            workers = n,
            queue_size = inner.config.max_queue_size,
            rate_limit_per_minute = ?inner.config.rate_limit_per_minute,
            "scheduler started"
        );
        Ok(())
    }
}

pub(crate) async fn stop_locked(inner: &SchedulerInner, lifecycle: &mut Lifecycle, reason: StopReason) {
    if !lifecycle.running {
        return;
    }
    if let Some(tx) = lifecycle.shutdown_tx.take() {
        let _ = tx.send(true);
    }
    let joins = std::mem::take(&mut lifecycle.joins);
    for join in &joins {
        join.abort();
    }
    for join in joins {
        let _ = join.await;
    }
    if let Some(join) = lifecycle.status_join.take() {
        // the status loop cannot wait for itself
        if reason == StopReason::Requested {
            join.abort();
            let _ = join.await;
        }
    }

    let dropped = inner.queue.drain().await.len();
    let senders = inner.state.lock().await.clear();
    let outstanding = senders.len();
    for tx in senders {
        let _ = tx.send(Err(TaskError::Cancelled("scheduler stopped".to_string())));
    }

    lifecycle.running = false;
    lifecycle.workers = 0;
    info!(?reason, dropped_jobs = dropped, outstanding, "scheduler stopped");
}

pub(crate) async fn status_counts(store: &dyn TaskStore) -> Result<StatusCounts, SchedulerError> {
    let mut counts = StatusCounts::default();
    for status in TaskStatus::ALL {
        counts.set(status, store.count(&TaskFilter::status(status)).await?);
    }
    Ok(counts)
}

impl SchedulerInner {
    /// Write a status change; failures are logged and never propagate.
    pub(crate) async fn persist(&self, id: TaskId, update: TaskUpdate) {
        let status = update.status;
        if let Err(err) = self.store.update(id, update).await {
            warn!(task_id = %id, ?status, error = %err, "could not persist task status");
        }
    }

    async fn cancel(&self, id: TaskId) -> Result<bool, SchedulerError> {
        enum Found {
            Running(Arc<Interrupt>),
            Unclaimed(Unclaimed, Option<FunctionKey>),
            Nothing,
        }

        let found = {
            let mut st = self.state.lock().await;
            if let Some(interrupt) = st.running.get(&id) {
                Found::Running(Arc::clone(interrupt))
            } else if let Some(tx) = st.handles.remove(&id) {
                st.cancelled.insert(id);
                let queued = st.queued.contains(&id);
                Found::Unclaimed(Unclaimed { id, tx, queued }, st.live.get(&id).cloned())
            } else {
                Found::Nothing
            }
        };

        match found {
            Found::Running(interrupt) => {
                // the worker persists, resolves and counts the cancellation
                interrupt.fire();
                Ok(true)
            }
            Found::Unclaimed(task, key) => {
                self.cancel_unclaimed(vec![task], "cancelled by caller").await;
                if let Some(key) = key {
                    self.note_cancellation(&key, id).await;
                }
                Ok(true)
            }
            Found::Nothing => Ok(false),
        }
    }

    /// Persist + resolve tasks whose senders were taken out of `handles`.
    ///
    /// Tasks still in the store (not queued) or removed from the queue here
    /// are retired now; queued ones a worker already popped are retired by
    /// that worker.
    pub(crate) async fn cancel_unclaimed(&self, tasks: Vec<Unclaimed>, reason: &str) {
        if tasks.is_empty() {
            return;
        }
        let queued: HashSet<TaskId> = tasks.iter().filter(|t| t.queued).map(|t| t.id).collect();
        let removed: HashSet<TaskId> = if queued.is_empty() {
            HashSet::new()
        } else {
            self.queue
                .remove_where(|job| queued.contains(&job.id))
                .await
                .into_iter()
                .collect()
        };

        let mut retire = Vec::with_capacity(tasks.len());
        for task in tasks {
            self.persist(task.id, TaskUpdate::cancelled(reason, self.clock.now()))
                .await;
            let _ = task.tx.send(Err(TaskError::Cancelled(reason.to_string())));
            if !task.queued || removed.contains(&task.id) {
                retire.push(task.id);
            }
        }

        let mut st = self.state.lock().await;
        for id in retire {
            // the row is no longer pending, so nothing will look for the marker
            st.queued.remove(&id);
            st.cancelled.remove(&id);
            st.retire(id);
        }
    }

    /// Count one cancellation under `key`; at the threshold, cancel every
    /// other unclaimed task under the same key.
    pub(crate) async fn note_cancellation(&self, key: &FunctionKey, origin: TaskId) {
        let fire = self
            .state
            .lock()
            .await
            .count_cancellation(key, self.config.cancel_threshold);
        if fire {
            self.cascade(key, origin).await;
        }
    }

    async fn cascade(&self, key: &FunctionKey, origin: TaskId) {
        let victims: Vec<Unclaimed> = {
            let mut st = self.state.lock().await;
            let ids = st.function_jobs.get(key).cloned().unwrap_or_default();
            let mut victims = Vec::new();
            for id in ids.into_iter().filter(|id| *id != origin) {
                // running tasks no longer have an entry in `handles`
                if let Some(tx) = st.handles.remove(&id) {
                    st.cancelled.insert(id);
                    let queued = st.queued.contains(&id);
                    victims.push(Unclaimed { id, tx, queued });
                }
            }
            victims
        };
        if victims.is_empty() {
            return;
        }
        info!(function_key = %key, origin = %origin, cancelled = victims.len(), "cascading cancellation");
        let reason = format!("cascade: a task under '{key}' was cancelled");
        self.cancel_unclaimed(victims, &reason).await;
    }
}
