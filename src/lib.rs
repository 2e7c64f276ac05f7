//! # pipe-rpc
//!
//! RPC over local named pipes (Windows) and Unix domain sockets.
//!
//! Unary, client-streaming, server-streaming and duplex-streaming calls with
//! request/response headers, trailers, status codes, deadlines and
//! cancellation. Each call uses its own connection; there is no
//! multiplexing and no network transport.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): length-prefixed packets of tagged messages;
//!   large payloads follow the packet body as raw trailing blocks
//! - **Write path** ([`writer`]): per-connection FIFO queue that merges
//!   pending transactions into one vectored write
//! - **Read path** ([`payload_queue`], [`stream`]): protocol events feed a
//!   single-consumer payload queue read through typed message readers
//! - **Calls** ([`client`], [`server`], [`handler`]): per-call state machines
//!   on both ends, plus the server's accept pool
//!
//! ## Example
//!
//! ```ignore
//! use pipe_rpc::{CallOptions, Channel, Method, MethodType, Server};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Value { value: i32 }
//!
//! #[tokio::main]
//! async fn main() -> pipe_rpc::Result<()> {
//!     let echo = Method::<Value, Value>::msgpack(MethodType::Unary, "Test", "Echo");
//!     let path = pipe_rpc::transport::generate_pipe_path();
//!
//!     let server = Server::builder(path.clone())
//!         .add_unary(&echo, |request: Value, _ctx| async move { Ok(request) })
//!         .build();
//!     server.start()?;
//!
//!     let channel = Channel::new(path);
//!     let response = channel.unary(&echo, &Value { value: 10 }, CallOptions::new()).await?;
//!     assert_eq!(response.value, 10);
//!
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod cancel;
pub mod client;
pub mod codec;
pub mod deadline;
pub mod error;
pub mod handler;
pub mod logger;
pub mod metadata;
pub mod method;
pub mod payload_queue;
pub mod protocol;
pub mod server;
pub mod status;
pub mod stream;
pub mod transport;
pub mod writer;

mod connection;

pub use cancel::CancellationToken;
pub use client::{
    CallOptions, Channel, ChannelOptions, ClientStreamingCall, DuplexStreamingCall, ServerStreamingCall,
    UnaryCall,
};
pub use codec::{Marshaller, MsgPackCodec, RawCodec};
pub use error::{PipeRpcError, Result};
pub use handler::{PipeCallContext, ServerCallContext};
pub use metadata::{Metadata, MetadataEntry, MetadataValue};
pub use method::{Method, MethodType};
pub use server::{Server, ServerBuilder, ServerOptions};
pub use status::{RpcError, Status, StatusCode};
pub use stream::{MessageReader, RequestStreamWriter, ResponseStreamWriter};
