//! RendererRegistry - deferred 引数を解決する renderer の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去されたクロージャの管理
//! - Arc による共有所有権（enqueue loop から spawn_blocking に渡す）

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use serde_json::Value;

use crate::domain::CallArgs;

/// Renders the final single argument of a task from its merged arguments.
pub type RenderFn = Arc<dyn Fn(&CallArgs) -> Result<Value, String> + Send + Sync>;

/// RendererRegistry は名前付き renderer を保持
///
/// # 使用例
/// ```ignore
/// let mut registry = RendererRegistry::new();
/// registry.register("coding-prompt", |args: &CallArgs| {
///     Ok::<_, String>(json!(format!("Code this: {}", args.args[1])))
/// })?;
/// ```
#[derive(Clone, Default)]
pub struct RendererRegistry {
    renderers: HashMap<String, RenderFn>,
}

/// RegistryError は RendererRegistry の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("renderer '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, E>(&mut self, name: impl Into<String>, render: F) -> Result<(), RegistryError>
    where
        F: Fn(&CallArgs) -> Result<Value, E> + Send + Sync + 'static,
        E: Display + 'static,
    {
        let name = name.into();
        if self.renderers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        let erased: RenderFn = Arc::new(move |args: &CallArgs| render(args).map_err(|e| e.to_string()));
        self.renderers.insert(name, erased);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<RenderFn> {
        self.renderers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.renderers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.renderers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererRegistry")
            .field("renderers", &self.names())
            .finish()
    }
}
