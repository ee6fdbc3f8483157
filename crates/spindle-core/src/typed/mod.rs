//! Typed - 型付きの callable / handle / renderer
//!
//! # 二層構造
//! - **表層（Typed）**: `Fn(CallArgs) -> Result<R, E>`, `TaskHandle<R>`
//! - **内部（Dyn）**: `DynCallable`, `Box<dyn Any + Send>` - type erasure
//!
//! scheduler の内部はすべて Dyn 側で扱い、型は submit と await の両端でだけ
//! 復元される。

pub mod callable;
pub mod handle;
pub mod renderer;

pub use self::callable::{Completion, DynCallable, TypedCallable, encode_result};
pub use self::handle::TaskHandle;
pub use self::renderer::{RegistryError, RenderFn, RendererRegistry};
