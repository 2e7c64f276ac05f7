//! Call objects returned by [`Channel`](super::Channel).
//!
//! Dropping a call that has not finished sends a best-effort `Cancel` to the
//! server and releases the connection.

use std::fmt;
use std::sync::Arc;

use super::connection::ClientConnection;
use crate::codec::Marshaller;
use crate::error::Result;
use crate::metadata::Metadata;
use crate::status::Status;
use crate::stream::{MessageReader, RequestStreamWriter};

struct CallHandle {
    connection: Arc<ClientConnection>,
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.connection.dispose();
    }
}

macro_rules! call_accessors {
    () => {
        /// Headers sent by the server; empty if it finished without any.
        pub async fn response_headers(&self) -> Result<Metadata> {
            self.handle.connection.response_headers().await
        }

        /// Final status. Fails until the server's trailers have arrived.
        pub fn status(&self) -> Result<Status> {
            self.handle.connection.status()
        }

        /// Trailing metadata. Fails until the server's trailers have arrived.
        pub fn trailers(&self) -> Result<Metadata> {
            self.handle.connection.trailers()
        }

        /// Cancel the call. Pending reads fail with `Cancelled`.
        pub fn cancel(&self) {
            self.handle.connection.cancellation().cancel();
        }
    };
}

/// An in-flight unary call.
pub struct UnaryCall<Resp> {
    handle: CallHandle,
    reader: MessageReader<Resp>,
}

impl<Resp> UnaryCall<Resp> {
    pub(crate) fn new(connection: Arc<ClientConnection>, marshaller: Arc<dyn Marshaller<Resp>>) -> Self {
        let reader = connection.response_reader(marshaller);
        Self {
            handle: CallHandle { connection },
            reader,
        }
    }

    /// Wait for the response.
    pub async fn response(&self) -> Result<Resp> {
        self.reader.read_next_message().await
    }

    call_accessors!();
}

/// An in-flight server-streaming call.
pub struct ServerStreamingCall<Resp> {
    handle: CallHandle,
    responses: MessageReader<Resp>,
}

impl<Resp> ServerStreamingCall<Resp> {
    pub(crate) fn new(connection: Arc<ClientConnection>, marshaller: Arc<dyn Marshaller<Resp>>) -> Self {
        let responses = connection.response_reader(marshaller);
        Self {
            handle: CallHandle { connection },
            responses,
        }
    }

    pub fn response_stream(&self) -> &MessageReader<Resp> {
        &self.responses
    }

    call_accessors!();
}

/// An in-flight client-streaming call.
pub struct ClientStreamingCall<Req, Resp> {
    handle: CallHandle,
    requests: RequestStreamWriter<Req>,
    reader: MessageReader<Resp>,
}

impl<Req, Resp> ClientStreamingCall<Req, Resp> {
    pub(crate) fn new(
        connection: Arc<ClientConnection>,
        request_marshaller: Arc<dyn Marshaller<Req>>,
        response_marshaller: Arc<dyn Marshaller<Resp>>,
    ) -> Self {
        let reader = connection.response_reader(response_marshaller);
        let requests = RequestStreamWriter::new(Arc::clone(&connection), request_marshaller);
        Self {
            handle: CallHandle { connection },
            requests,
            reader,
        }
    }

    pub fn request_stream(&self) -> &RequestStreamWriter<Req> {
        &self.requests
    }

    /// Wait for the response; normally after completing the request stream.
    pub async fn response(&self) -> Result<Resp> {
        self.reader.read_next_message().await
    }

    call_accessors!();
}

/// An in-flight duplex-streaming call.
pub struct DuplexStreamingCall<Req, Resp> {
    handle: CallHandle,
    requests: RequestStreamWriter<Req>,
    responses: MessageReader<Resp>,
}

impl<Req, Resp> DuplexStreamingCall<Req, Resp> {
    pub(crate) fn new(
        connection: Arc<ClientConnection>,
        request_marshaller: Arc<dyn Marshaller<Req>>,
        response_marshaller: Arc<dyn Marshaller<Resp>>,
    ) -> Self {
        let responses = connection.response_reader(response_marshaller);
        let requests = RequestStreamWriter::new(Arc::clone(&connection), request_marshaller);
        Self {
            handle: CallHandle { connection },
            requests,
            responses,
        }
    }

    pub fn request_stream(&self) -> &RequestStreamWriter<Req> {
        &self.requests
    }

    pub fn response_stream(&self) -> &MessageReader<Resp> {
        &self.responses
    }

    call_accessors!();
}

macro_rules! impl_debug {
    ($name:ident < $($param:ident),+ >) => {
        impl<$($param),+> fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("completed", &self.handle.connection.is_completed())
                    .finish_non_exhaustive()
            }
        }
    };
}

impl_debug!(UnaryCall<Resp>);
impl_debug!(ServerStreamingCall<Resp>);
impl_debug!(ClientStreamingCall<Req, Resp>);
impl_debug!(DuplexStreamingCall<Req, Resp>);
