//! Call context passed to server handlers.
//!
//! # Example
//!
//! ```ignore
//! async fn echo(request: Request, ctx: PipeCallContext) -> Result<Response> {
//!     let mut headers = Metadata::new();
//!     headers.add("served-by", "echo");
//!     ctx.write_response_headers(headers)?;
//!     ctx.add_response_trailer(MetadataEntry::text("took-ms", "0"));
//!     Ok(Response { value: request.value })
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::metadata::{Metadata, MetadataEntry};
use crate::server::ServerConnection;
use crate::status::Status;

/// What a handler can see and change about the call it is serving.
pub trait ServerCallContext {
    /// Full method name, `/{service}/{method}`.
    fn method(&self) -> String;

    /// Deadline sent by the client, if any.
    fn deadline(&self) -> Option<SystemTime>;

    /// Fires when the client cancels, the deadline passes, or the
    /// connection is lost.
    fn cancellation_token(&self) -> CancellationToken;

    fn request_headers(&self) -> Metadata;

    /// Send response headers ahead of the first response. At most once.
    fn write_response_headers(&self, headers: Metadata) -> Result<()>;

    /// Trailers that will be sent with the final status.
    fn response_trailers(&self) -> Metadata;

    fn add_response_trailer(&self, entry: MetadataEntry);

    fn status(&self) -> Status;

    /// Override the final status. A non-OK status replaces the handler's
    /// response.
    fn set_status(&self, status: Status);

    /// `net.pipe://localhost/pid/<pid>` where the OS reports the client pid.
    fn peer(&self) -> Option<String>;
}

/// [`ServerCallContext`] of a call served over a pipe.
#[derive(Clone)]
pub struct PipeCallContext {
    connection: Arc<ServerConnection>,
}

impl PipeCallContext {
    pub(crate) fn new(connection: Arc<ServerConnection>) -> Self {
        Self { connection }
    }

    pub(crate) fn connection(&self) -> &Arc<ServerConnection> {
        &self.connection
    }
}

impl ServerCallContext for PipeCallContext {
    fn method(&self) -> String {
        self.connection.method()
    }

    fn deadline(&self) -> Option<SystemTime> {
        self.connection.deadline()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.connection.cancellation().clone()
    }

    fn request_headers(&self) -> Metadata {
        self.connection.request_headers()
    }

    fn write_response_headers(&self, headers: Metadata) -> Result<()> {
        self.connection.write_response_headers(&headers)
    }

    fn response_trailers(&self) -> Metadata {
        self.connection.response_trailers()
    }

    fn add_response_trailer(&self, entry: MetadataEntry) {
        self.connection.add_response_trailer(entry);
    }

    fn status(&self) -> Status {
        self.connection.status()
    }

    fn set_status(&self, status: Status) {
        self.connection.set_status(status);
    }

    fn peer(&self) -> Option<String> {
        self.connection.peer().map(str::to_string)
    }
}

impl fmt::Debug for PipeCallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeCallContext")
            .field("method", &self.connection.method())
            .field("peer", &self.connection.peer())
            .finish()
    }
}
