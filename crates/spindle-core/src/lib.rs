//! spindle-core
//!
//! Persistent, rate-limited job scheduler for slow external calls
//! (LLM requests and the like).
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status, task row, arguments, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator）
//! - **app**: スケジューラ本体（builder, scheduler, enqueue/worker/status loop, recovery）
//! - **typed**: 型付き API（callable の型消去, TaskHandle, renderer registry）
//! - **impls**: 実装（SQLite store, インメモリ store, retry policy）
//! - **config**: 設定（デフォルト → TOML → 環境変数）
//! - **observability**: status 集計とスナップショット

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use app::{RecoveryReport, Scheduler, SchedulerBuilder, Submission};
pub use config::SchedulerConfig;
pub use domain::{
    Argument, CacheSpec, CallArgs, FunctionKey, SchedulerError, TaskError, TaskId, TaskRecord,
    TaskStatus,
};
pub use impls::{InMemoryTaskStore, SqliteTaskStore};
pub use typed::TaskHandle;
