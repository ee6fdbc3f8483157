//! SchedulerState - 1 つの Mutex で守るプロセス内の状態
//!
//! read-modify-write はすべてこのロックの中で行い、ロック中に store I/O は
//! しない。ロック順は `lifecycle` → `state`。
//!
//! タスクは submit で「live」になり、`retire` でちょうど 1 回だけ抜ける。
//! retire すると function cache の参照カウントが 1 減る。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio::time::Instant;

use super::function_cache::FunctionCache;
use crate::domain::{CachedArguments, FunctionKey, TaskId};
use crate::typed::handle::CompletionSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSlot {
    pub busy: bool,
    /// Last transition between idle and busy.
    pub since: Instant,
}

/// Caller-side cancellation of a claimed task.
///
/// フラグと Notify の両方を持つので、worker はどの時点でも確認できる
/// （待っている間は `wait`、実行前は `is_fired`）。
#[derive(Debug, Default)]
pub struct Interrupt {
    fired: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.is_fired() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Default)]
pub struct SchedulerState {
    pub functions: FunctionCache,
    /// Seeded once per key, kept until `stop`.
    pub arguments: HashMap<FunctionKey, CachedArguments>,
    /// Completion senders not yet claimed by a worker.
    pub handles: HashMap<TaskId, CompletionSender>,
    /// Submitted and not yet retired.
    pub live: HashMap<TaskId, FunctionKey>,
    /// Live task ids per key, in submission order.
    pub function_jobs: HashMap<FunctionKey, Vec<TaskId>>,
    pub cancel_counts: HashMap<FunctionKey, u32>,
    /// Claimed by the enqueue loop (possibly not pushed yet).
    pub queued: HashSet<TaskId>,
    /// Claimed by a worker (waiting on the limiter or executing).
    pub running: HashMap<TaskId, Arc<Interrupt>>,
    /// Cancelled before a worker claimed them.
    pub cancelled: HashSet<TaskId>,
    pub workers: Vec<WorkerSlot>,
}

impl SchedulerState {
    pub fn track(&mut self, id: TaskId, key: FunctionKey) {
        self.function_jobs.entry(key.clone()).or_default().push(id);
        self.live.insert(id, key);
    }

    /// Drop a task's bookkeeping. Idempotent; returns `false` if already retired.
    pub fn retire(&mut self, id: TaskId) -> bool {
        let Some(key) = self.live.remove(&id) else {
            return false;
        };
        if let Some(ids) = self.function_jobs.get_mut(&key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.function_jobs.remove(&key);
            }
        }
        self.functions.release(&key);
        true
    }

    /// Bump the cancellation counter of `key`. Returns `true` (and resets the
    /// counter) once it reaches `threshold`.
    pub fn count_cancellation(&mut self, key: &FunctionKey, threshold: u32) -> bool {
        let count = self.cancel_counts.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count >= threshold {
            *count = 0;
            return true;
        }
        false
    }

    pub fn reset_workers(&mut self, n: usize, now: Instant) {
        self.workers = vec![WorkerSlot { busy: false, since: now }; n];
    }

    pub fn set_worker(&mut self, worker_id: usize, busy: bool, now: Instant) {
        if let Some(slot) = self.workers.get_mut(worker_id) {
            *slot = WorkerSlot { busy, since: now };
        }
    }

    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.busy).count()
    }

    /// Every worker idle for at least `threshold`.
    pub fn all_idle_for(&self, threshold: std::time::Duration, now: Instant) -> bool {
        self.workers
            .iter()
            .all(|w| !w.busy && now.duration_since(w.since) >= threshold)
    }

    /// Forget everything; returns the senders that still need an answer.
    pub fn clear(&mut self) -> Vec<CompletionSender> {
        let senders = self.handles.drain().map(|(_, tx)| tx).collect();
        *self = Self::default();
        senders
    }
}
