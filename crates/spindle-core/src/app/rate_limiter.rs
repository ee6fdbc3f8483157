//! RateLimiter - ジョブ開始の最小間隔を守る
//!
//! 開始時刻だけを直列化する（実行そのものは並列）。
//! 待っている間もロックを保持するので、後続の worker は順番に並ぶ。

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    interval: Option<Duration>,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `None` disables limiting.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            last_start: Mutex::new(None),
        }
    }

    /// Wait until a job may start, then record the start.
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let mut last_start = self.last_start.lock().await;
        if let Some(prev) = *last_start {
            let next = prev + interval;
            if next > Instant::now() {
                tokio::time::sleep_until(next).await;
            }
        }
        *last_start = Some(Instant::now());
    }
}
