//! Domain model (ids, task rows, statuses, arguments, errors).

pub mod args;
pub mod errors;
pub mod ids;
pub mod state;
pub mod task;

pub use args::{Argument, CacheSpec, CachedArguments, CallArgs, MergedArguments};
pub use errors::{ArgumentError, ConfigError, SchedulerError, StoreError, TaskError};
pub use ids::{Id, IdMarker, ParseIdError, TaskId};
pub use state::{TaskStatus, UnknownStatus};
pub use task::{FunctionKey, TaskRecord, TaskUpdate};
