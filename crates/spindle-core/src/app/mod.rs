//! App - アプリケーション層
//!
//! ports を組み合わせてスケジューラ本体を実装する。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: 構築とワイヤリング（recovery を含む）
//! - **Scheduler**: submit / start / stop / cancel の表面
//! - **EnqueueLoop**: pending 行 → JobQueue（引数の merge と render）
//! - **WorkerLoop**: JobQueue → 実行 → 永続化 → handle の解決
//! - **StatusLoop**: idle watchdog と診断ログ
//! - **FunctionCache / RateLimiter / JobQueue**: ループが共有する部品

pub mod builder;
mod enqueue_loop;
mod function_cache;
mod job_queue;
mod rate_limiter;
pub mod recovery;
pub mod scheduler;
mod state;
mod status_loop;
mod worker_loop;

pub use self::builder::SchedulerBuilder;
pub use self::recovery::{RecoveryReport, recover};
pub use self::scheduler::{Scheduler, Submission};
