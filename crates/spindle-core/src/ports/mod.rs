//! Ports - 抽象化レイヤー
//!
//! スケジューラが外部（永続ストア、時刻、ID 生成）に依存する箇所を trait に
//! して、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - store がクラッシュをまたぐ正本。メモリ上の状態はすべて捨てられる前提
//! - 時刻と ID はテストで固定できるように注入する

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{ArgumentSnapshot, TaskFilter, TaskStore};
