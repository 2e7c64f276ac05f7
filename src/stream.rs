//! Typed message streams on top of a call's payload queue and write queue.
//!
//! - [`MessageReader`] pulls incoming messages for either side of a call.
//! - [`RequestStreamWriter`] sends client requests on streaming calls.
//! - [`ResponseStreamWriter`] sends server responses on streaming methods.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cancel::{first_cancelled, CancellationToken};
use crate::client::ClientConnection;
use crate::codec::Marshaller;
use crate::deadline::Deadline;
use crate::error::{PipeRpcError, Result};
use crate::payload_queue::PayloadQueue;
use crate::server::ServerConnection;
use crate::status::RpcError;

/// Reads the messages of one direction of a call, in order.
///
/// Reads stop when the call is cancelled or its deadline passes; the
/// resulting error is `DeadlineExceeded` if the deadline had expired and
/// `Cancelled` otherwise.
pub struct MessageReader<T> {
    queue: Arc<PayloadQueue>,
    marshaller: Arc<dyn Marshaller<T>>,
    cancellation: CancellationToken,
    deadline: Arc<Deadline>,
}

impl<T> MessageReader<T> {
    pub(crate) fn new(
        queue: Arc<PayloadQueue>,
        marshaller: Arc<dyn Marshaller<T>>,
        cancellation: CancellationToken,
        deadline: Arc<Deadline>,
    ) -> Self {
        Self {
            queue,
            marshaller,
            cancellation,
            deadline,
        }
    }

    /// Next message, or `None` once the stream has ended cleanly.
    pub async fn next(&self) -> Result<Option<T>> {
        self.read(None).await
    }

    /// Like [`next`](Self::next), additionally stopping when `token` fires.
    pub async fn next_with(&self, token: &CancellationToken) -> Result<Option<T>> {
        self.read(Some(token)).await
    }

    /// Read exactly one message; the stream ending first is an error.
    pub async fn read_next_message(&self) -> Result<T> {
        self.next()
            .await?
            .ok_or_else(|| PipeRpcError::invalid_operation("Expected payload"))
    }

    /// Drain the stream into a vector.
    pub async fn collect(&self) -> Result<Vec<T>> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await? {
            messages.push(message);
        }
        Ok(messages)
    }

    async fn read(&self, token: Option<&CancellationToken>) -> Result<Option<T>> {
        let mut tokens = vec![&self.cancellation, self.deadline.token()];
        tokens.extend(token);

        match self.queue.next(first_cancelled(&tokens)).await {
            Ok(Some(payload)) => self.marshaller.deserialize(&payload).map(Some),
            Ok(None) => Ok(None),
            Err(PipeRpcError::Cancelled) => {
                if self.deadline.is_expired() {
                    Err(RpcError::deadline_exceeded().into())
                } else {
                    Err(RpcError::cancelled().into())
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl<T> fmt::Debug for MessageReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReader").finish_non_exhaustive()
    }
}

/// Client side of a streaming request.
pub struct RequestStreamWriter<T> {
    connection: Arc<ClientConnection>,
    marshaller: Arc<dyn Marshaller<T>>,
    completed: AtomicBool,
}

impl<T> RequestStreamWriter<T> {
    pub(crate) fn new(connection: Arc<ClientConnection>, marshaller: Arc<dyn Marshaller<T>>) -> Self {
        Self {
            connection,
            marshaller,
            completed: AtomicBool::new(false),
        }
    }

    /// Send one request message.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` after [`complete`](Self::complete)
    /// - `Cancelled` if the call has been cancelled
    /// - the call's failure status if it never connected or the
    ///   connection is gone
    pub async fn write(&self, message: &T) -> Result<()> {
        if self.completed.load(Ordering::Acquire) {
            return Err(PipeRpcError::invalid_operation(
                "Request stream has already been completed.",
            ));
        }
        self.connection.cancellation().check()?;

        let payload = self.marshaller.serialize(message)?;
        let writes = self.connection.request_writes()?;
        writes.transaction().payload(payload).commit()?;
        writes.flush().await;
        Ok(())
    }

    /// Signal that no more requests will be sent.
    pub async fn complete(&self) -> Result<()> {
        self.connection.cancellation().check()?;
        if self.completed.swap(true, Ordering::AcqRel) {
            return Err(PipeRpcError::invalid_operation(
                "Request stream has already been completed.",
            ));
        }

        let writes = self.connection.request_writes()?;
        writes.transaction().stream_end().commit()?;
        writes.flush().await;
        Ok(())
    }
}

impl<T> fmt::Debug for RequestStreamWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStreamWriter")
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Server side of a streaming response.
///
/// Writes are rejected once the call has finished (the handler returned,
/// or the call failed).
pub struct ResponseStreamWriter<T> {
    connection: Arc<ServerConnection>,
    marshaller: Arc<dyn Marshaller<T>>,
}

impl<T> ResponseStreamWriter<T> {
    pub(crate) fn new(connection: Arc<ServerConnection>, marshaller: Arc<dyn Marshaller<T>>) -> Self {
        Self {
            connection,
            marshaller,
        }
    }

    /// Send one response message.
    pub async fn write(&self, message: &T) -> Result<()> {
        if self.connection.is_completed() {
            return Err(PipeRpcError::invalid_operation(
                "Response stream has already been completed.",
            ));
        }
        self.connection.cancellation().check()?;

        let payload = self.marshaller.serialize(message)?;
        let writes = self.connection.writes();
        writes.transaction().payload(payload).commit()?;
        writes.flush().await;
        Ok(())
    }
}

impl<T> Clone for ResponseStreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            marshaller: Arc::clone(&self.marshaller),
        }
    }
}

impl<T> fmt::Debug for ResponseStreamWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStreamWriter").finish_non_exhaustive()
    }
}
