//! Client side of one call: connect, send the request, track the response.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::channel::{connect_with_retry, ChannelOptions};
use crate::cancel::CancellationToken;
use crate::codec::Marshaller;
use crate::connection::read_loop;
use crate::deadline::Deadline;
use crate::error::{PipeRpcError, Result};
use crate::logger::ConnectionLogger;
use crate::metadata::Metadata;
use crate::method::MethodType;
use crate::payload_queue::PayloadQueue;
use crate::protocol::{Frame, FrameHandler, PacketReader};
use crate::status::{RpcError, Status, StatusCode};
use crate::stream::MessageReader;
use crate::writer::WriteQueue;

type HeadersState = Option<std::result::Result<Metadata, RpcError>>;

#[derive(Default)]
struct ResponseState {
    /// Single response held back until trailers arrive.
    pending_payload: Option<Bytes>,
    status: Option<Status>,
    trailers: Option<Metadata>,
}

/// Connection and protocol state of one client call.
pub(crate) struct ClientConnection {
    method_full_name: String,
    method_type: MethodType,
    logger: Arc<ConnectionLogger>,
    deadline: Arc<Deadline>,
    cancellation: CancellationToken,
    payload_queue: Arc<PayloadQueue>,
    writes: OnceLock<Arc<WriteQueue>>,
    failure: OnceLock<RpcError>,
    state: Mutex<ResponseState>,
    headers: watch::Sender<HeadersState>,
    closed: CancellationToken,
}

impl ClientConnection {
    pub(crate) fn new(
        method_full_name: &str,
        method_type: MethodType,
        logger: ConnectionLogger,
        deadline: Deadline,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        let (headers, _) = watch::channel(None);
        Arc::new(Self {
            method_full_name: method_full_name.to_string(),
            method_type,
            logger: Arc::new(logger),
            deadline: Arc::new(deadline),
            cancellation,
            payload_queue: Arc::new(PayloadQueue::new()),
            writes: OnceLock::new(),
            failure: OnceLock::new(),
            state: Mutex::new(ResponseState::default()),
            headers,
            closed: CancellationToken::new(),
        })
    }

    /// Connect and send `RequestInit`, the request headers and, for calls
    /// with a single request, the request itself, all in one packet.
    ///
    /// Failures are recorded on the call rather than returned, so every
    /// later operation on it reports the same status.
    pub(crate) async fn start(
        self: &Arc<Self>,
        path: &str,
        options: &ChannelOptions,
        headers: &Metadata,
        request: Option<Bytes>,
    ) {
        if self.cancellation.is_cancelled() {
            return self.fail(RpcError::cancelled());
        }
        if self.deadline.is_expired() {
            return self.fail(RpcError::deadline_exceeded());
        }

        let connected = tokio::select! {
            connected = connect_with_retry(path, options) => connected,
            _ = self.cancellation.cancelled() => return self.fail(RpcError::cancelled()),
            _ = self.deadline.token().cancelled() => return self.fail(RpcError::deadline_exceeded()),
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                self.logger.log(format_args!("Connect to '{}' failed: {}", path, e));
                return self.fail(RpcError::unavailable());
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let writes = WriteQueue::new(write_half, Arc::clone(&self.logger));

        let mut transaction = writes
            .transaction()
            .request_init(&self.method_full_name, self.deadline.value())
            .headers(headers);
        if let Some(request) = request {
            transaction = transaction.payload(request);
        }
        if let Err(e) = transaction.commit() {
            return self.fail(match e {
                PipeRpcError::Rpc(e) => e,
                PipeRpcError::Protocol(detail) => RpcError::new(StatusCode::Internal, detail),
                _ => RpcError::unavailable(),
            });
        }
        let _ = self.writes.set(Arc::clone(&writes));

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = PacketReader::new(read_half);
            if let Err(e) = read_loop(&mut reader, &*conn, &conn.closed).await {
                conn.logger.log(format_args!("Read loop failed: {}", e));
            }
            conn.on_disconnected(&writes).await;
        });

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = conn.cancellation.cancelled() => conn.send_cancel(),
                _ = conn.deadline.token().cancelled() => conn.send_cancel(),
                _ = conn.closed.cancelled() => {}
            }
        });
    }

    fn fail(&self, error: RpcError) {
        self.logger
            .log(format_args!("Call failed before connecting: {}", error));
        let _ = self.failure.set(error.clone());
        let _ = self.payload_queue.set_error(error.clone());
        self.set_headers(Err(error));
        self.closed.cancel();
    }

    async fn on_disconnected(&self, writes: &WriteQueue) {
        writes.mark_disconnected();
        self.payload_queue.dispose();
        self.set_headers(Err(RpcError::unavailable()));
        self.closed.cancel();
        writes.shutdown().await;
    }

    fn set_headers(&self, headers: std::result::Result<Metadata, RpcError>) {
        self.headers.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(headers);
            true
        });
    }

    fn send_cancel(&self) {
        if self.is_completed() {
            return;
        }
        if let Some(writes) = self.writes.get() {
            // Best effort: the connection may already be gone.
            let _ = writes.transaction().cancel().commit();
        }
    }

    fn on_trailers(&self, status: Status, metadata: Metadata) {
        let pending = {
            let mut state = self.state.lock();
            state.status = Some(status.clone());
            state.trailers = Some(metadata.clone());
            state.pending_payload.take()
        };

        self.set_headers(Ok(Metadata::new()));

        if let Some(payload) = pending {
            let _ = self.payload_queue.append(payload);
        }
        let _ = if status.is_ok() {
            self.payload_queue.set_completed()
        } else {
            self.payload_queue
                .set_error(RpcError::with_trailers(status, metadata))
        };
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Write queue for request messages, or the reason there is none.
    pub(crate) fn request_writes(&self) -> Result<Arc<WriteQueue>> {
        if let Some(writes) = self.writes.get() {
            return Ok(Arc::clone(writes));
        }
        Err(self
            .failure
            .get()
            .cloned()
            .unwrap_or_else(RpcError::unavailable)
            .into())
    }

    pub(crate) fn response_reader<T>(&self, marshaller: Arc<dyn Marshaller<T>>) -> MessageReader<T> {
        MessageReader::new(
            Arc::clone(&self.payload_queue),
            marshaller,
            self.cancellation.clone(),
            Arc::clone(&self.deadline),
        )
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state.lock().status.is_some()
    }

    /// Response headers; resolves with empty metadata if the server sent
    /// trailers without headers.
    pub(crate) async fn response_headers(&self) -> Result<Metadata> {
        let mut rx = self.headers.subscribe();
        let waited = tokio::select! {
            waited = rx.wait_for(Option::is_some) => waited.map(|headers| headers.clone()),
            _ = self.cancellation.cancelled() => return Err(RpcError::cancelled().into()),
            _ = self.deadline.token().cancelled() => return Err(RpcError::deadline_exceeded().into()),
        };
        match waited {
            Ok(Some(Ok(headers))) => Ok(headers),
            Ok(Some(Err(e))) => Err(e.into()),
            _ => Err(RpcError::unavailable().into()),
        }
    }

    pub(crate) fn status(&self) -> Result<Status> {
        self.state.lock().status.clone().ok_or_else(|| {
            PipeRpcError::invalid_operation("Status can only be accessed once the call has finished.")
        })
    }

    pub(crate) fn trailers(&self) -> Result<Metadata> {
        self.state.lock().trailers.clone().ok_or_else(|| {
            PipeRpcError::invalid_operation("Trailers can only be accessed once the call has finished.")
        })
    }

    /// Tear the call down; an unfinished call sends `Cancel` first.
    pub(crate) fn dispose(&self) {
        self.send_cancel();
        self.closed.cancel();
    }
}

impl FrameHandler for ClientConnection {
    fn handle_frame(&self, frame: Frame) {
        self.logger.log(format_args!("Received <{}>", frame.kind()));
        match frame {
            Frame::Headers(metadata) => self.set_headers(Ok(metadata)),
            Frame::Payload(payload) => {
                self.set_headers(Ok(Metadata::new()));
                if self.method_type.is_response_streaming() {
                    if let Err(e) = self.payload_queue.append(payload) {
                        tracing::warn!("Dropping response payload: {}", e);
                    }
                } else {
                    self.state.lock().pending_payload = Some(payload);
                }
            }
            Frame::Trailers { status, metadata } => self.on_trailers(status, metadata),
            other => tracing::warn!("Unexpected <{}> on client connection", other.kind()),
        }
    }
}
