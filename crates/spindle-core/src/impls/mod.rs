//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SqliteTaskStore**: 本番用の正本（単一ファイル、WAL）
//! - **InMemoryTaskStore**: テスト・開発用
//! - **StoreRetryPolicy**: busy/locked の再試行間隔

pub mod inmem_store;
pub mod retry;
pub mod sqlite_store;

pub use self::inmem_store::InMemoryTaskStore;
pub use self::retry::StoreRetryPolicy;
pub use self::sqlite_store::SqliteTaskStore;
