//! Callable - 型付きの呼び出し可能オブジェクトと型消去
//!
//! # 二層構造
//! - **表層**: `Fn(CallArgs) -> Result<R, E>`（R は Serialize）
//! - **内部**: `DynCallable`（object-safe）。結果は `Box<dyn Any + Send>` と
//!   永続化用の JSON 文字列の両方で返す
//!
//! worker は `DynCallable` を blocking pool 上で呼ぶので、同期関数であること。

use std::any::{Any, type_name};
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use crate::domain::CallArgs;

/// Successful call: the typed value for the handle plus its persisted form.
pub struct Completion {
    pub value: Box<dyn Any + Send>,
    pub result_json: String,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("result_json", &self.result_json)
            .finish_non_exhaustive()
    }
}

/// DynCallable は object-safe な callable
///
/// `HashMap<FunctionKey, Arc<dyn DynCallable>>` に格納するための抽象化。
pub trait DynCallable: Send + Sync {
    fn call(&self, args: CallArgs) -> Result<Completion, String>;
}

pub struct TypedCallable<F, R, E> {
    f: F,
    _marker: PhantomData<fn() -> (R, E)>,
}

impl<F, R, E> TypedCallable<F, R, E>
where
    F: Fn(CallArgs) -> Result<R, E> + Send + Sync + 'static,
    R: Serialize + Send + 'static,
    E: Display + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }

    pub fn erased(f: F) -> Arc<dyn DynCallable> {
        Arc::new(Self::new(f))
    }
}

impl<F, R, E> DynCallable for TypedCallable<F, R, E>
where
    F: Fn(CallArgs) -> Result<R, E> + Send + Sync + 'static,
    R: Serialize + Send + 'static,
    E: Display + 'static,
{
    fn call(&self, args: CallArgs) -> Result<Completion, String> {
        let value = (self.f)(args).map_err(|e| e.to_string())?;
        let result_json = encode_result(&value);
        Ok(Completion {
            value: Box::new(value),
            result_json,
        })
    }
}

/// Serialize a result for the row, degrading to a type-tagged placeholder.
pub fn encode_result<R: Serialize>(value: &R) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| {
        serde_json::json!({
            "note": "result was not serializable",
            "type": type_name::<R>(),
        })
        .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Opaque;

    impl Serialize for Opaque {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("opaque"))
        }
    }

    #[test]
    fn call_returns_value_and_json() {
        let callable = TypedCallable::erased(|args: CallArgs| {
            let n = args.arg(0).and_then(|v| v.as_i64()).ok_or("missing n")?;
            Ok::<_, &str>(n * 2)
        });
        let done = callable
            .call(CallArgs::new(vec![json!(21)], BTreeMap::new()))
            .unwrap();
        assert_eq!(done.result_json, "42");
        assert_eq!(*done.value.downcast::<i64>().unwrap(), 42);
    }

    #[test]
    fn error_is_stringified() {
        let callable = TypedCallable::erased(|_: CallArgs| Err::<(), _>("model unavailable"));
        let err = callable.call(CallArgs::default()).unwrap_err();
        assert_eq!(err, "model unavailable");
    }

    #[test]
    fn unserializable_result_gets_placeholder() {
        let json: serde_json::Value = serde_json::from_str(&encode_result(&Opaque)).unwrap();
        assert_eq!(json["note"], "result was not serializable");
        assert!(json["type"].as_str().unwrap().ends_with("Opaque"));
    }
}
