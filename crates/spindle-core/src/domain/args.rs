//! Call arguments and the cached/variable split.
//!
//! A submission's arguments are divided by a [`CacheSpec`] into
//!
//! - **cached** values: captured once per function key and kept in process
//!   memory (large invariant inputs such as a codebook or a system prompt),
//! - **variable** values: serialized into the task row.
//!
//! [`split`] and [`merge`] are pure; the scheduler owns where each half lives.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ArgumentError;

/// One submitted argument.
///
/// `Deferred` names a renderer registered on the scheduler. It is resolved by
/// the enqueue loop right before the task is queued, so expensive rendering
/// (e.g. building a prompt from the merged arguments) never happens at submit
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Argument {
    Value(Value),
    Deferred(String),
}

impl Argument {
    pub fn deferred(renderer: impl Into<String>) -> Self {
        Argument::Deferred(renderer.into())
    }

    fn as_value(&self) -> Option<&Value> {
        match self {
            Argument::Value(v) => Some(v),
            Argument::Deferred(_) => None,
        }
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Value(value)
    }
}

/// Fully materialized arguments handed to a callable or renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    pub fn args_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.args)
    }

    pub fn kwargs_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.kwargs)
    }

    /// Decode the variable part stored in a task row.
    pub fn from_json(args_json: &str, kwargs_json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            args: serde_json::from_str(args_json)?,
            kwargs: serde_json::from_str(kwargs_json)?,
        })
    }
}

/// Which positions/keywords of a submission are cacheable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    #[serde(default)]
    pub positions: BTreeSet<usize>,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
}

impl CacheSpec {
    pub fn positions(positions: impl IntoIterator<Item = usize>) -> Self {
        Self {
            positions: positions.into_iter().collect(),
            keywords: BTreeSet::new(),
        }
    }

    pub fn keywords<S: Into<String>>(keywords: impl IntoIterator<Item = S>) -> Self {
        Self {
            positions: BTreeSet::new(),
            keywords: keywords.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_position(mut self, index: usize) -> Self {
        self.positions.insert(index);
        self
    }

    pub fn with_keyword(mut self, name: impl Into<String>) -> Self {
        self.keywords.insert(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.keywords.is_empty()
    }
}

/// Cached half of a call, keyed by original position / keyword name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedArguments {
    pub positional: BTreeMap<usize, Argument>,
    pub keywords: BTreeMap<String, Argument>,
}

impl CachedArguments {
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    /// Renderer key of the (single) deferred keyword, if any.
    pub fn deferred_renderer(&self) -> Option<&str> {
        self.keywords.values().find_map(|arg| match arg {
            Argument::Deferred(key) => Some(key.as_str()),
            Argument::Value(_) => None,
        })
    }

    /// JSON view of the plain cached values. Deferred entries are elided.
    pub fn snapshot(&self) -> Value {
        let args: serde_json::Map<String, Value> = self
            .positional
            .iter()
            .filter_map(|(i, arg)| arg.as_value().map(|v| (i.to_string(), v.clone())))
            .collect();
        let kwargs: serde_json::Map<String, Value> = self
            .keywords
            .iter()
            .filter_map(|(k, arg)| arg.as_value().map(|v| (k.clone(), v.clone())))
            .collect();
        serde_json::json!({ "args": args, "kwargs": kwargs })
    }
}

/// Result of [`merge`]: the reconstructed call plus the renderer still to run.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedArguments {
    pub call: CallArgs,
    pub renderer: Option<String>,
}

/// Split submitted arguments into cached and variable halves.
///
/// Positions or keywords named by `spec` but not present in the call are
/// ignored. Deferred arguments are only accepted as cached keywords, and at
/// most one of them.
pub fn split(
    args: Vec<Argument>,
    kwargs: BTreeMap<String, Argument>,
    spec: &CacheSpec,
) -> Result<(CachedArguments, CallArgs), ArgumentError> {
    let mut cached = CachedArguments::default();
    let mut variable = CallArgs::default();

    for (index, arg) in args.into_iter().enumerate() {
        match arg {
            Argument::Deferred(_) => return Err(ArgumentError::DeferredPositional(index)),
            arg if spec.positions.contains(&index) => {
                cached.positional.insert(index, arg);
            }
            Argument::Value(v) => variable.args.push(v),
        }
    }

    for (name, arg) in kwargs {
        if spec.keywords.contains(&name) {
            cached.keywords.insert(name, arg);
            continue;
        }
        match arg {
            Argument::Value(v) => {
                variable.kwargs.insert(name, v);
            }
            Argument::Deferred(_) => return Err(ArgumentError::DeferredNotCached(name)),
        }
    }

    let deferred = cached
        .keywords
        .values()
        .filter(|arg| matches!(arg, Argument::Deferred(_)))
        .count();
    if deferred > 1 {
        return Err(ArgumentError::MultipleDeferred(deferred));
    }

    Ok((cached, variable))
}

/// Rebuild the full call from cached values and a row's variable values.
///
/// Cached positionals occupy their original index; variable positionals fill
/// the remaining slots in order. Variable keywords win over cached ones with
/// the same name. A slot that neither half can fill is an error.
pub fn merge(
    cached: &CachedArguments,
    variable: CallArgs,
) -> Result<MergedArguments, ArgumentError> {
    let total = cached.positional.len() + variable.args.len();
    let mut args = Vec::with_capacity(total);
    let mut rest = variable.args.into_iter();

    for index in 0..total {
        match cached.positional.get(&index) {
            Some(Argument::Value(v)) => args.push(v.clone()),
            Some(Argument::Deferred(_)) => return Err(ArgumentError::DeferredPositional(index)),
            None => match rest.next() {
                Some(v) => args.push(v),
                None => return Err(ArgumentError::Gap(index)),
            },
        }
    }

    let mut kwargs: BTreeMap<String, Value> = cached
        .keywords
        .iter()
        .filter_map(|(k, arg)| arg.as_value().map(|v| (k.clone(), v.clone())))
        .collect();
    kwargs.extend(variable.kwargs);

    Ok(MergedArguments {
        call: CallArgs::new(args, kwargs),
        renderer: cached.deferred_renderer().map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn values(vs: &[Value]) -> Vec<Argument> {
        vs.iter().cloned().map(Argument::Value).collect()
    }

    #[test]
    fn split_moves_cached_positions_out_of_the_row() {
        let (cached, variable) = split(
            values(&[json!("codebook"), json!("post-1"), json!(3)]),
            BTreeMap::new(),
            &CacheSpec::positions([0]),
        )
        .unwrap();

        assert_eq!(cached.positional.len(), 1);
        assert_eq!(cached.positional[&0], Argument::Value(json!("codebook")));
        assert_eq!(variable.args, vec![json!("post-1"), json!(3)]);
    }

    #[test]
    fn split_ignores_positions_past_the_end() {
        let (cached, variable) =
            split(values(&[json!(1)]), BTreeMap::new(), &CacheSpec::positions([4])).unwrap();
        assert!(cached.is_empty());
        assert_eq!(variable.args, vec![json!(1)]);
    }

    #[test]
    fn split_and_merge_restore_call_order() {
        let kwargs = BTreeMap::from([
            ("model".to_string(), Argument::Value(json!("llama3"))),
            ("temperature".to_string(), Argument::Value(json!(0.2))),
        ]);
        let spec = CacheSpec::positions([0, 2]).with_keyword("model");
        let original = values(&[json!("a"), json!("b"), json!("c"), json!("d")]);

        let (cached, variable) = split(original, kwargs, &spec).unwrap();
        assert_eq!(variable.args, vec![json!("b"), json!("d")]);
        assert_eq!(variable.kwargs.len(), 1);

        let merged = merge(&cached, variable).unwrap();
        assert_eq!(
            merged.call.args,
            vec![json!("a"), json!("b"), json!("c"), json!("d")]
        );
        assert_eq!(merged.call.kwarg("model"), Some(&json!("llama3")));
        assert_eq!(merged.call.kwarg("temperature"), Some(&json!(0.2)));
        assert_eq!(merged.renderer, None);
    }

    #[test]
    fn later_variable_values_fill_after_cached_slots() {
        let cached = CachedArguments {
            positional: BTreeMap::from([(0, Argument::Value(json!("big")))]),
            keywords: BTreeMap::new(),
        };
        let merged = merge(&cached, CallArgs::new(vec![json!("x"), json!("y")], BTreeMap::new()))
            .unwrap();
        assert_eq!(merged.call.args, vec![json!("big"), json!("x"), json!("y")]);
    }

    #[test]
    fn variable_keyword_wins_over_cached() {
        let cached = CachedArguments {
            positional: BTreeMap::new(),
            keywords: BTreeMap::from([("model".to_string(), Argument::Value(json!("a")))]),
        };
        let variable = CallArgs::new(vec![], BTreeMap::from([("model".to_string(), json!("b"))]));
        let merged = merge(&cached, variable).unwrap();
        assert_eq!(merged.call.kwarg("model"), Some(&json!("b")));
    }

    #[rstest]
    #[case(vec![3], 0, 0)]
    #[case(vec![0, 5], 1, 2)]
    fn merge_reports_gaps(#[case] cached_at: Vec<usize>, #[case] n_variable: usize, #[case] gap: usize) {
        let cached = CachedArguments {
            positional: cached_at
                .into_iter()
                .map(|i| (i, Argument::Value(json!(i))))
                .collect(),
            keywords: BTreeMap::new(),
        };
        let variable = CallArgs::new(vec![json!("v"); n_variable], BTreeMap::new());
        assert_eq!(merge(&cached, variable), Err(ArgumentError::Gap(gap)));
    }

    #[test]
    fn deferred_keyword_is_reported_and_left_out_of_the_call() {
        let kwargs = BTreeMap::from([
            ("prompt".to_string(), Argument::deferred("coding-prompt")),
            ("topic".to_string(), Argument::Value(json!("housing"))),
        ]);
        let (cached, variable) = split(vec![], kwargs, &CacheSpec::keywords(["prompt"])).unwrap();
        assert_eq!(cached.deferred_renderer(), Some("coding-prompt"));

        let merged = merge(&cached, variable).unwrap();
        assert_eq!(merged.renderer.as_deref(), Some("coding-prompt"));
        assert!(merged.call.kwarg("prompt").is_none());
        assert_eq!(merged.call.kwarg("topic"), Some(&json!("housing")));
    }

    #[rstest]
    #[case::variable_keyword(
        vec![],
        vec![("prompt", Argument::deferred("r"))],
        CacheSpec::default(),
        ArgumentError::DeferredNotCached("prompt".to_string()),
    )]
    #[case::positional(
        vec![Argument::deferred("r")],
        vec![],
        CacheSpec::positions([0]),
        ArgumentError::DeferredPositional(0),
    )]
    #[case::two_deferred(
        vec![],
        vec![("a", Argument::deferred("r1")), ("b", Argument::deferred("r2"))],
        CacheSpec::keywords(["a", "b"]),
        ArgumentError::MultipleDeferred(2),
    )]
    fn split_rejects_misplaced_deferred(
        #[case] args: Vec<Argument>,
        #[case] kwargs: Vec<(&str, Argument)>,
        #[case] spec: CacheSpec,
        #[case] expected: ArgumentError,
    ) {
        let kwargs = kwargs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(split(args, kwargs, &spec), Err(expected));
    }

    #[test]
    fn snapshot_elides_deferred_entries() {
        let cached = CachedArguments {
            positional: BTreeMap::from([(0, Argument::Value(json!("codebook")))]),
            keywords: BTreeMap::from([
                ("prompt".to_string(), Argument::deferred("r")),
                ("model".to_string(), Argument::Value(json!("m"))),
            ]),
        };
        assert_eq!(
            cached.snapshot(),
            json!({ "args": { "0": "codebook" }, "kwargs": { "model": "m" } })
        );
    }

    #[test]
    fn row_payload_roundtrip() {
        let call = CallArgs::new(
            vec![json!(1), json!("two")],
            BTreeMap::from([("k".to_string(), json!(null))]),
        );
        let back = CallArgs::from_json(&call.args_json().unwrap(), &call.kwargs_json().unwrap())
            .unwrap();
        assert_eq!(back, call);
    }
}
