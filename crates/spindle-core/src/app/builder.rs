//! SchedulerBuilder - スケジューラの構築とワイヤリング
//!
//! # build() でやること
//! 1. 設定の検証（Fail-fast）
//! 2. 重複した renderer 名の検出
//! 3. tokio runtime の取得（明示指定 or 現在の runtime）
//! 4. recovery loader（未完了行を failed に）
//! 5. `auto_start` なら起動
//!
//! store / clock / id generator は省略するとインメモリ・システム時計・ULID。

use std::fmt::Display;
use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, Notify};

use super::job_queue::JobQueue;
use super::rate_limiter::RateLimiter;
use super::recovery::recover;
use super::scheduler::{Lifecycle, Scheduler, SchedulerInner};
use super::state::SchedulerState;
use crate::config::SchedulerConfig;
use crate::domain::{CallArgs, SchedulerError};
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{RegistryError, RendererRegistry};

/// Builds a [`Scheduler`].
///
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .config(config)
///     .store(SqliteTaskStore::open("tasks.db")?)
///     .renderer("coding-prompt", render_prompt)
///     .build()
///     .await?;
/// ```
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    renderers: RendererRegistry,
    duplicate_renderers: Vec<String>,
    runtime: Option<Handle>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            store: None,
            clock: None,
            ids: None,
            renderers: RendererRegistry::new(),
            duplicate_renderers: Vec::new(),
            runtime: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(self, store: impl TaskStore + 'static) -> Self {
        self.store_arc(Arc::new(store))
    }

    /// Share a store that the caller keeps using (e.g. for inspection).
    pub fn store_arc(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    /// Register a renderer for deferred keyword arguments.
    ///
    /// A name registered twice makes [`build`](Self::build) fail.
    pub fn renderer<F, E>(mut self, name: impl Into<String>, render: F) -> Self
    where
        F: Fn(&CallArgs) -> Result<Value, E> + Send + Sync + 'static,
        E: Display + 'static,
    {
        if let Err(RegistryError::AlreadyRegistered(name)) = self.renderers.register(name, render) {
            self.duplicate_renderers.push(name);
        }
        self
    }

    /// Runtime the loops are spawned on. Defaults to the current one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub async fn build(self) -> Result<Scheduler, SchedulerError> {
        self.config.validate()?;
        if let Some(name) = self.duplicate_renderers.into_iter().next() {
            return Err(SchedulerError::DuplicateRenderer(name));
        }
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| SchedulerError::Startup(e.to_string()))?,
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let recovery = recover(store.as_ref(), clock.as_ref()).await?;

        let config = self.config;
        let inner = SchedulerInner {
            queue: JobQueue::new(config.max_queue_size),
            limiter: RateLimiter::new(config.min_start_interval()),
            config,
            store,
            clock,
            ids,
            renderers: self.renderers,
            runtime,
            state: Mutex::new(SchedulerState::default()),
            enqueue_wake: Notify::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            recovery,
        };
        let scheduler = Scheduler::from_inner(inner);
        if scheduler.config().auto_start {
            scheduler.start().await?;
        }
        Ok(scheduler)
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
