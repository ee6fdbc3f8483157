//! JobQueue - enqueue loop と worker の間の有界キュー
//!
//! # 学習ポイント
//! - tokio::sync::Mutex + Notify による待機付き pop
//! - 空き容量の通知（space）で enqueue loop を起こす
//! - ロック内では await しない（notify はロック解放後）

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::domain::{CallArgs, FunctionKey, TaskId};

/// One task ready for a worker: id, key and fully materialized arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: TaskId,
    pub function_key: FunctionKey,
    pub args: CallArgs,
}

pub struct JobQueue {
    items: Mutex<VecDeque<QueuedJob>>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Free slots right now.
    pub async fn available(&self) -> usize {
        self.capacity.saturating_sub(self.len().await)
    }

    /// Push without waiting; a full queue hands the job back.
    pub async fn try_push(&self, job: QueuedJob) -> Result<(), QueuedJob> {
        {
            let mut items = self.items.lock().await;
            if items.len() >= self.capacity {
                return Err(job);
            }
            items.push_back(job);
        }
        self.item_ready.notify_one();
        Ok(())
    }

    /// Push, waiting for a free slot if necessary.
    pub async fn push(&self, mut job: QueuedJob) {
        loop {
            match self.try_push(job).await {
                Ok(()) => return,
                Err(back) => {
                    job = back;
                    self.space_ready.notified().await;
                }
            }
        }
    }

    /// Wait for the next job.
    pub async fn pop(&self) -> QueuedJob {
        loop {
            let popped = self.items.lock().await.pop_front();
            if let Some(job) = popped {
                self.space_ready.notify_one();
                return job;
            }
            self.item_ready.notified().await;
        }
    }

    /// Resolves once a slot has been freed (by `pop`, `remove_where` or `drain`).
    pub async fn space_available(&self) {
        self.space_ready.notified().await;
    }

    /// Remove every queued job matching `pred`, returning their ids.
    pub async fn remove_where<P>(&self, pred: P) -> Vec<TaskId>
    where
        P: Fn(&QueuedJob) -> bool,
    {
        let removed: Vec<TaskId> = {
            let mut items = self.items.lock().await;
            let mut removed = Vec::new();
            items.retain(|job| {
                if pred(job) {
                    removed.push(job.id);
                    false
                } else {
                    true
                }
            });
            removed
        };
        if !removed.is_empty() {
            self.space_ready.notify_one();
        }
        removed
    }

    pub async fn drain(&self) -> Vec<QueuedJob> {
        let drained: Vec<QueuedJob> = self.items.lock().await.drain(..).collect();
        if !drained.is_empty() {
            self.space_ready.notify_one();
        }
        drained
    }
}
