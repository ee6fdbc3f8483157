//! StatusLoop - idle watchdog と診断ログ
//!
//! `status_check_interval` ごとに:
//! - worker 全員が `idle_threshold` 以上 idle、キューが空、未解決の handle が
//!   なく、store の pending も 0 → scheduler を止める
//! - それ以外 → 状況をログに出す
//!
//! 停止は lifecycle ロックの下で再確認するので、同時に来た submit が勝つ。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::scheduler::{SchedulerInner, StopReason, stop_locked};
use crate::domain::TaskStatus;
use crate::ports::TaskFilter;

pub(crate) async fn status_loop(
    inner: Arc<SchedulerInner>,
    generation: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = inner.config.status_check_interval;
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match idle(&inner).await {
            Some(true) => {
                if stop_if_idle(&inner, generation).await {
                    break;
                }
            }
            Some(false) => log_status(&inner).await,
            None => {}
        }
    }
    debug!("status loop stopped");
}

/// `None` when the store could not be asked.
async fn idle(inner: &SchedulerInner) -> Option<bool> {
    let quiet = {
        let st = inner.state.lock().await;
        st.handles.is_empty()
            && st.running.is_empty()
            && st.all_idle_for(inner.config.idle_threshold, Instant::now())
    };
    if !quiet || !inner.queue.is_empty().await {
        return Some(false);
    }
    match inner.store.count(&TaskFilter::status(TaskStatus::Pending)).await {
        Ok(pending) => Some(pending == 0),
        Err(err) => {
            warn!(error = %err, "could not count pending tasks");
            None
        }
    }
}

async fn stop_if_idle(inner: &SchedulerInner, generation: u64) -> bool {
    let mut lifecycle = inner.lifecycle.lock().await;
    if !lifecycle.is_generation(generation) {
        return true;
    }
    // a submit may have slipped in while we were checking
    if idle(inner).await != Some(true) {
        return false;
    }
    info!(
        idle_threshold = ?inner.config.idle_threshold,
        "scheduler idle, stopping"
    );
    stop_locked(inner, &mut lifecycle, StopReason::Idle).await;
    true
}

async fn log_status(inner: &SchedulerInner) {
    let (outstanding, running, cached_functions) = {
        let st = inner.state.lock().await;
        (st.handles.len(), st.running.len(), st.functions.len())
    };
    let queue_len = inner.queue.len().await;
    let pending = inner
        .store
        .count(&TaskFilter::status(TaskStatus::Pending))
        .await
        .ok();
    info!(
        outstanding,
        running,
        queue_len,
        pending_rows = ?pending,
        cached_functions,
        cutoff = ?inner.config.cutoff,
        "scheduler status"
    );
}
