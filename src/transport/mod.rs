//! Transport module - platform-specific pipe/socket handling.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)
//!
//! Both are used in byte mode; packet boundaries come from the length
//! prefix in [`crate::protocol`].

mod pipe;

pub use pipe::{connect, generate_pipe_path, is_transient, PipeListener, PipeStream};
