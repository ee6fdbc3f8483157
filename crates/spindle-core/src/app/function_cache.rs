//! FunctionCache - function key → callable + 参照カウント
//!
//! - submit ごとに +1、タスクが retire するたびに -1
//! - 0 になったら evict（次の submit で新しい callable が入る）
//! - 同じ key で別の callable が来たら新しい方で置き換える

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::FunctionKey;
use crate::typed::DynCallable;

struct Entry {
    callable: Arc<dyn DynCallable>,
    refs: usize,
}

#[derive(Default)]
pub struct FunctionCache {
    entries: HashMap<FunctionKey, Entry>,
}

impl FunctionCache {
    /// Register one more task under `key`, keeping the newest callable.
    pub fn register(&mut self, key: FunctionKey, callable: Arc<dyn DynCallable>) {
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            callable: Arc::clone(&callable),
            refs: 0,
        });
        entry.callable = callable;
        entry.refs += 1;
    }

    pub fn get(&self, key: &FunctionKey) -> Option<Arc<dyn DynCallable>> {
        self.entries.get(key).map(|e| Arc::clone(&e.callable))
    }

    /// Drop one reference. Returns `true` when the entry was evicted.
    pub fn release(&mut self, key: &FunctionKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            self.entries.remove(key);
            return true;
        }
        false
    }

    #[cfg(test)]
    pub fn refs(&self, key: &FunctionKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
