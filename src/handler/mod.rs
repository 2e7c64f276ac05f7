//! Handler module - server-side method dispatch.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps full method names to handlers
//! - [`ServerCallContext`] / [`PipeCallContext`] - what a handler sees of its call
//!
//! Handlers return `Err(PipeRpcError::Rpc(..))` to fail a call with a chosen
//! status; any other error, or a panic, is reported to the client as
//! `Unknown` without its message.
//!
//! # Example
//!
//! ```ignore
//! use pipe_rpc::handler::HandlerRegistry;
//! use pipe_rpc::{Method, MethodType};
//!
//! let sum = Method::<Value, Value>::msgpack(MethodType::ClientStreaming, "Test", "Sum");
//! let mut registry = HandlerRegistry::new();
//! registry.add_client_streaming(&sum, |requests, _ctx| async move {
//!     let mut total = 0;
//!     while let Some(v) = requests.next().await? {
//!         total += v.value;
//!     }
//!     Ok(Value { value: total })
//! });
//! ```

mod context;
mod registry;

pub use context::{PipeCallContext, ServerCallContext};
pub(crate) use registry::Handler;
pub use registry::{BoxFuture, HandlerRegistry};
