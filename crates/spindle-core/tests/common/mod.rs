//! 結合テスト用のヘルパー

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use spindle_core::{Scheduler, SchedulerConfig, TaskId, TaskRecord, TaskStatus};

/// Short timings so loops react quickly under real time.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        num_workers: 2,
        status_check_interval: Duration::from_millis(50),
        enqueue_poll_interval: Duration::from_millis(20),
        cutoff: Duration::from_secs(5),
        ..SchedulerConfig::default()
    }
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out waiting for the scheduler")
}

pub async fn wait_for_status(scheduler: &Scheduler, id: TaskId, status: TaskStatus) -> TaskRecord {
    within(async {
        loop {
            if let Some(row) = scheduler.task(id).await.unwrap()
                && row.status == status
            {
                return row;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

pub fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}
