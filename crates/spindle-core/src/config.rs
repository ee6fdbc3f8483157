//! SchedulerConfig - スケジューラの設定
//!
//! 優先順位（後勝ち）:
//! 1. `Default`
//! 2. TOML ファイル（CLI の `--config`）
//! 3. 環境変数（`SPINDLE_` プレフィックス）
//!
//! Duration はすべて「秒（小数可）」で表現する。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;

pub const ENV_PREFIX: &str = "SPINDLE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Capacity of the in-memory job queue.
    pub max_queue_size: usize,
    pub num_workers: usize,
    /// Job starts per minute; `None` disables rate limiting.
    pub rate_limit_per_minute: Option<u32>,
    #[serde(with = "secs")]
    pub rate_limit_padding: Duration,
    #[serde(with = "secs")]
    pub status_check_interval: Duration,
    pub enable_status_check: bool,
    /// Cancellations under one function key that trigger a cascade.
    pub cancel_threshold: u32,
    /// Quiet period after which the idle watchdog stops the scheduler.
    #[serde(with = "secs")]
    pub idle_threshold: Duration,
    /// Per-task execution timeout.
    #[serde(with = "secs")]
    pub cutoff: Duration,
    pub auto_start: bool,
    /// Fallback wake-up of the enqueue loop when nobody signals it.
    #[serde(with = "secs")]
    pub enqueue_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10,
            num_workers: 3,
            rate_limit_per_minute: None,
            rate_limit_padding: Duration::from_millis(100),
            status_check_interval: Duration::from_secs(5),
            enable_status_check: true,
            cancel_threshold: 1,
            idle_threshold: Duration::from_secs(60),
            cutoff: Duration::from_secs(300),
            auto_start: true,
            enqueue_poll_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `SPINDLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().merge_lookup(lookup)
    }

    /// Override fields of `self` from `lookup` (`SPINDLE_NUM_WORKERS`, ...).
    pub fn merge_lookup<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |field: &'static str| {
            lookup(&format!("{ENV_PREFIX}{}", field.to_ascii_uppercase()))
                .map(|raw| (field, raw.trim().to_string()))
        };

        if let Some((f, v)) = get("max_queue_size") {
            self.max_queue_size = parse(f, &v)?;
        }
        if let Some((f, v)) = get("num_workers") {
            self.num_workers = parse(f, &v)?;
        }
        if let Some((f, v)) = get("rate_limit_per_minute") {
            self.rate_limit_per_minute = match v.as_str() {
                "" | "none" | "off" => None,
                _ => Some(parse(f, &v)?),
            };
        }
        if let Some((f, v)) = get("rate_limit_padding") {
            self.rate_limit_padding = parse_secs(f, &v)?;
        }
        if let Some((f, v)) = get("status_check_interval") {
            self.status_check_interval = parse_secs(f, &v)?;
        }
        if let Some((f, v)) = get("enable_status_check") {
            self.enable_status_check = parse_bool(f, &v)?;
        }
        if let Some((f, v)) = get("cancel_threshold") {
            self.cancel_threshold = parse(f, &v)?;
        }
        if let Some((f, v)) = get("idle_threshold") {
            self.idle_threshold = parse_secs(f, &v)?;
        }
        if let Some((f, v)) = get("cutoff") {
            self.cutoff = parse_secs(f, &v)?;
        }
        if let Some((f, v)) = get("auto_start") {
            self.auto_start = parse_bool(f, &v)?;
        }
        if let Some((f, v)) = get("enqueue_poll_interval") {
            self.enqueue_poll_interval = parse_secs(f, &v)?;
        }
        Ok(self)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError {
                field,
                reason: reason.to_string(),
            })
        };
        if self.num_workers == 0 {
            return invalid("num_workers", "must be at least 1");
        }
        if self.max_queue_size == 0 {
            return invalid("max_queue_size", "must be at least 1");
        }
        if self.cancel_threshold == 0 {
            return invalid("cancel_threshold", "must be at least 1");
        }
        if self.cutoff.is_zero() {
            return invalid("cutoff", "must be positive");
        }
        if self.rate_limit_per_minute == Some(0) {
            return invalid("rate_limit_per_minute", "must be positive when set");
        }
        if self.enable_status_check && self.status_check_interval.is_zero() {
            return invalid("status_check_interval", "must be positive");
        }
        if self.enqueue_poll_interval.is_zero() {
            return invalid("enqueue_poll_interval", "must be positive");
        }
        Ok(())
    }

    /// Minimum gap between two job starts, if rate limiting is on.
    pub fn min_start_interval(&self) -> Option<Duration> {
        self.rate_limit_per_minute
            .filter(|rate| *rate > 0)
            .map(|rate| Duration::from_secs_f64(60.0 / f64::from(rate)) + self.rate_limit_padding)
    }
}

fn parse<T>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError {
        field,
        reason: format!("'{raw}': {e}"),
    })
}

fn parse_secs(field: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse(field, raw)?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError {
        field,
        reason: format!("'{raw}': {e}"),
    })
}

fn parse_bool(field: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError {
            field,
            reason: format!("'{raw}' is not a boolean"),
        }),
    }
}

/// Duration <-> fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
