//! Client module - calling methods on a pipe server.
//!
//! A [`Channel`] names the server's pipe path. Every call opens its own
//! connection, sends `RequestInit` with the request headers, and reads the
//! response through the call object it returns:
//!
//! | Method shape | Channel method | Call object |
//! |---|---|---|
//! | unary | [`Channel::unary`], [`Channel::async_unary`] | [`UnaryCall`] |
//! | server streaming | [`Channel::server_streaming`] | [`ServerStreamingCall`] |
//! | client streaming | [`Channel::client_streaming`] | [`ClientStreamingCall`] |
//! | duplex streaming | [`Channel::duplex_streaming`] | [`DuplexStreamingCall`] |

mod call;
mod channel;
mod connection;

pub use call::{ClientStreamingCall, DuplexStreamingCall, ServerStreamingCall, UnaryCall};
pub use channel::{CallOptions, Channel, ChannelOptions};
pub(crate) use connection::ClientConnection;
