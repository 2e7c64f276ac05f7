//! Server side of one call.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use super::pool::TaskTracker;
use crate::cancel::CancellationToken;
use crate::codec::Marshaller;
use crate::connection::read_loop;
use crate::deadline::Deadline;
use crate::error::{PipeRpcError, Result};
use crate::handler::{Handler, HandlerRegistry, PipeCallContext};
use crate::logger::ConnectionLogger;
use crate::metadata::{Metadata, MetadataEntry};
use crate::payload_queue::PayloadQueue;
use crate::protocol::{payload_size, Frame, FrameHandler, PacketReader, RequestControl};
use crate::status::{Status, StatusCode, HANDLER_EXCEPTION};
use crate::stream::MessageReader;
use crate::writer::WriteQueue;

#[derive(Default)]
struct CallState {
    method: String,
    request_headers: Metadata,
    response_headers_sent: bool,
    response_trailers: Metadata,
    status: Status,
    completed: bool,
    /// Handler resolved from `RequestInit`, started once its packet is done.
    pending: Option<Arc<dyn Handler>>,
}

/// Connection and protocol state of one server call.
pub(crate) struct ServerConnection {
    this: Weak<ServerConnection>,
    registry: Arc<HandlerRegistry>,
    tracker: TaskTracker,
    logger: Arc<ConnectionLogger>,
    writes: Arc<WriteQueue>,
    payload_queue: Arc<PayloadQueue>,
    cancellation: CancellationToken,
    closed: CancellationToken,
    initialized: CancellationToken,
    deadline: OnceLock<Arc<Deadline>>,
    peer: Option<String>,
    state: Mutex<CallState>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
}

/// Serve one accepted connection until its call is finished and the handler
/// has returned.
pub(crate) async fn serve_connection<S>(
    stream: S,
    peer: Option<String>,
    registry: Arc<HandlerRegistry>,
    logger: ConnectionLogger,
    request_init_timeout: Duration,
    tracker: TaskTracker,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let logger = Arc::new(logger);
    let (read_half, write_half) = tokio::io::split(stream);
    let writes = WriteQueue::new(write_half, Arc::clone(&logger));

    let conn = Arc::new_cyclic(|this| ServerConnection {
        this: this.clone(),
        registry,
        tracker,
        logger,
        writes,
        payload_queue: Arc::new(PayloadQueue::new()),
        cancellation: CancellationToken::new(),
        closed: CancellationToken::new(),
        initialized: CancellationToken::new(),
        deadline: OnceLock::new(),
        peer,
        state: Mutex::new(CallState::default()),
        handler_task: Mutex::new(None),
    });

    let guard = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(request_init_timeout) => {
                    conn.logger.log(format_args!("Timed out waiting for RequestInit"));
                    conn.closed.cancel();
                }
                _ = conn.initialized.cancelled() => {}
                _ = conn.closed.cancelled() => {}
            }
        })
    };

    let mut reader = PacketReader::new(read_half);
    let result = read_loop(&mut reader, &*conn, &conn.closed).await;
    if let Err(e) = &result {
        conn.logger.log(format_args!("Read loop failed: {}", e));
    }

    guard.abort();
    conn.dispose().await;
    result
}

impl ServerConnection {
    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub(crate) fn writes(&self) -> &Arc<WriteQueue> {
        &self.writes
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub(crate) fn method(&self) -> String {
        self.state.lock().method.clone()
    }

    pub(crate) fn deadline(&self) -> Option<SystemTime> {
        self.deadline.get().and_then(|d| d.value())
    }

    pub(crate) fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub(crate) fn request_headers(&self) -> Metadata {
        self.state.lock().request_headers.clone()
    }

    pub(crate) fn response_trailers(&self) -> Metadata {
        self.state.lock().response_trailers.clone()
    }

    pub(crate) fn add_response_trailer(&self, entry: MetadataEntry) {
        self.state.lock().response_trailers.push(entry);
    }

    pub(crate) fn status(&self) -> Status {
        self.state.lock().status.clone()
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.state.lock().status = status;
    }

    pub(crate) fn write_response_headers(&self, headers: &Metadata) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.completed {
                return Err(PipeRpcError::invalid_operation(
                    "Response headers cannot be written after the call has completed.",
                ));
            }
            if state.response_headers_sent {
                return Err(PipeRpcError::invalid_operation(
                    "Response headers can only be sent once per call.",
                ));
            }
            state.response_headers_sent = true;
        }
        self.writes.transaction().headers(headers).commit()
    }

    /// Reader over the client's request messages.
    pub(crate) fn request_reader<T>(&self, marshaller: Arc<dyn Marshaller<T>>) -> MessageReader<T> {
        let deadline = self
            .deadline
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(Deadline::none()));
        MessageReader::new(
            Arc::clone(&self.payload_queue),
            marshaller,
            self.cancellation.clone(),
            deadline,
        )
    }

    fn on_request_init(&self, method_full_name: String, deadline: Option<SystemTime>, connection_id: u32) {
        self.logger.set_id(connection_id);
        self.logger
            .log(format_args!("Received <RequestInit> for '{}'", method_full_name));
        self.initialized.cancel();

        let mut state = self.state.lock();
        if !state.method.is_empty() {
            tracing::warn!("Ignoring repeated RequestInit for '{}'", method_full_name);
            return;
        }
        state.method = method_full_name;

        let Some(handler) = self.registry.get(&state.method) else {
            self.logger.log(format_args!("Unsupported method"));
            state.completed = true;
            drop(state);
            let status = Status::new(StatusCode::Unimplemented, "");
            if let Err(e) = self.writes.transaction().trailers(&status, &Metadata::new()).commit() {
                self.logger.log(format_args!("Failed to send trailers: {}", e));
            }
            self.closed.cancel();
            return;
        };

        let deadline = Arc::new(Deadline::track(deadline));
        if deadline.value().is_some() {
            let deadline = Arc::clone(&deadline);
            let cancellation = self.cancellation.clone();
            let closed = self.closed.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = deadline.token().cancelled() => cancellation.cancel(),
                    _ = closed.cancelled() => {}
                }
            });
        }
        let _ = self.deadline.set(deadline);
        state.pending = Some(handler);
    }

    fn dispatch(&self, handler: Arc<dyn Handler>) {
        let Some(conn) = self.this.upgrade() else {
            return;
        };
        let ctx = PipeCallContext::new(Arc::clone(&conn));

        let task = self.tracker.spawn(async move {
            let outcome = AssertUnwindSafe(async move { handler.call(ctx).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(response)) => conn.success(response),
                Ok(Err(e)) => conn.error(Some(e)),
                Err(_) => {
                    tracing::error!("Handler for '{}' panicked", conn.method());
                    conn.error(None);
                }
            }
        });
        *self.handler_task.lock() = Some(task);
    }

    /// Finish the call after the handler returned normally.
    ///
    /// A non-OK status set by the handler wins over its response.
    fn success(&self, response: Option<Bytes>) {
        self.logger.log(format_args!("RPC successful"));
        let status = self.status();
        if let Some(Err(e)) = response.as_ref().map(|r| payload_size(r.len())) {
            return self.error(Some(e));
        }
        if status.is_ok() {
            self.finish(&status, response, None);
        } else {
            self.finish(&status, None, None);
        }
    }

    /// Finish the call after the handler failed (`None` for a panic).
    fn error(&self, error: Option<PipeRpcError>) {
        self.logger.log(format_args!("RPC error"));
        let expired = self.deadline.get().is_some_and(|d| d.is_expired());

        if expired {
            self.finish(&Status::new(StatusCode::DeadlineExceeded, ""), None, None);
        } else if self.cancellation.is_cancelled() {
            self.finish(&Status::new(StatusCode::Cancelled, ""), None, None);
        } else {
            match error {
                Some(PipeRpcError::Rpc(e)) => self.finish(e.status(), None, Some(e.trailers())),
                other => {
                    if let Some(e) = other {
                        tracing::error!("Handler for '{}' failed: {}", self.method(), e);
                    }
                    self.finish(&Status::new(StatusCode::Unknown, HANDLER_EXCEPTION), None, None);
                }
            }
        }
    }

    fn finish(&self, status: &Status, response: Option<Bytes>, extra_trailers: Option<&Metadata>) {
        let trailers = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            let mut trailers = state.response_trailers.clone();
            if let Some(extra) = extra_trailers {
                trailers.extend(extra);
            }
            trailers
        };

        let mut transaction = self.writes.transaction();
        if let Some(response) = response {
            transaction = transaction.payload(response);
        }
        if let Err(e) = transaction.trailers(status, &trailers).commit() {
            self.logger.log(format_args!("Failed to send trailers: {}", e));
        }
        self.closed.cancel();
    }

    async fn dispose(&self) {
        self.logger.log(format_args!("Disposing server context"));
        if !self.is_completed() {
            self.cancellation.cancel();
        }
        self.payload_queue.dispose();
        self.closed.cancel();

        let task = self.handler_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.writes.mark_disconnected();
        self.writes.shutdown().await;
    }
}

impl FrameHandler for ServerConnection {
    fn handle_frame(&self, frame: Frame) {
        if !matches!(frame, Frame::RequestInit { .. }) {
            self.logger.log(format_args!("Received <{}>", frame.kind()));
        }
        match frame {
            Frame::RequestInit {
                method_full_name,
                deadline,
                connection_id,
            } => self.on_request_init(method_full_name, deadline, connection_id),
            Frame::Headers(metadata) => self.state.lock().request_headers = metadata,
            Frame::Payload(payload) => {
                if let Err(e) = self.payload_queue.append(payload) {
                    tracing::warn!("Dropping request payload: {}", e);
                }
            }
            Frame::Control(RequestControl::Cancel) => self.cancellation.cancel(),
            Frame::Control(RequestControl::StreamEnd) => {
                if let Err(e) = self.payload_queue.set_completed() {
                    tracing::warn!("Ignoring StreamEnd: {}", e);
                }
            }
            Frame::Trailers { .. } => tracing::warn!("Unexpected <Trailers> on server connection"),
        }
    }

    fn end_of_packet(&self) {
        let pending = self.state.lock().pending.take();
        if let Some(handler) = pending {
            self.dispatch(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LoggerFactory;
    use crate::method::{Method, MethodType};
    use crate::protocol::{Packet, TransportMessage};
    use crate::writer::write_packet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{duplex, DuplexStream};

    fn echo() -> Method<i32, i32> {
        Method::msgpack(MethodType::Unary, "Test", "Echo")
    }

    fn spawn_server(registry: HandlerRegistry, server: DuplexStream) -> JoinHandle<Result<()>> {
        tokio::spawn(serve_connection(
            server,
            None,
            Arc::new(registry),
            LoggerFactory::new().server(),
            Duration::from_millis(200),
            TaskTracker::default(),
        ))
    }

    fn request_init(name: &str, deadline: Option<SystemTime>) -> TransportMessage {
        TransportMessage::RequestInit {
            method_full_name: name.to_string(),
            deadline,
            connection_id: 7,
        }
    }

    /// Read every frame the server sends until it closes the stream.
    async fn read_all(client: DuplexStream) -> Vec<Frame> {
        let handler = crate::protocol::testing::RecordingHandler::default();
        let mut reader = PacketReader::new(client);
        let _ = read_loop(&mut reader, &handler, &CancellationToken::new()).await;
        handler.frames.into_inner()
    }

    #[tokio::test]
    async fn test_unknown_method_unimplemented() {
        let called = Arc::new(AtomicBool::new(false));
        let mut registry = HandlerRegistry::new();
        let flag = Arc::clone(&called);
        registry.add_unary(&echo(), move |v: i32, _ctx| {
            flag.store(true, Ordering::SeqCst);
            async move { Ok(v) }
        });

        let (mut client, server) = duplex(64 * 1024);
        let task = spawn_server(registry, server);

        let mut packet = Packet::new();
        packet.push(&request_init("/Test/Missing", None));
        write_packet(&mut client, &packet).await.unwrap();

        let frames = read_all(client).await;
        task.await.unwrap().unwrap();
        assert_eq!(
            frames,
            vec![Frame::Trailers {
                status: Status::new(StatusCode::Unimplemented, ""),
                metadata: Metadata::new(),
            }]
        );
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unary_echo_in_one_packet() {
        let mut registry = HandlerRegistry::new();
        registry.add_unary(&echo(), |v: i32, _ctx| async move { Ok(v * 2) });

        let (mut client, server) = duplex(64 * 1024);
        let task = spawn_server(registry, server);

        let mut packet = Packet::new();
        packet.push(&request_init("/Test/Echo", None));
        packet.push(&TransportMessage::Headers(Metadata::new()));
        packet.push_payload(echo().request_marshaller().serialize(&21).unwrap()).unwrap();
        write_packet(&mut client, &packet).await.unwrap();

        let frames = read_all(client).await;
        task.await.unwrap().unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::Payload(echo().response_marshaller().serialize(&42).unwrap()),
                Frame::Trailers {
                    status: Status::ok(),
                    metadata: Metadata::new(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_handler_error_keeps_trailers_hides_message() {
        let mut registry = HandlerRegistry::new();
        registry.add_unary(&echo(), |_: i32, ctx: PipeCallContext| async move {
            use crate::handler::ServerCallContext;
            ctx.add_response_trailer(MetadataEntry::text("test_key", "test_value"));
            Err::<i32, _>(PipeRpcError::Protocol("secret".into()))
        });

        let (mut client, server) = duplex(64 * 1024);
        let task = spawn_server(registry, server);

        let mut packet = Packet::new();
        packet.push(&request_init("/Test/Echo", None));
        packet.push_payload(echo().request_marshaller().serialize(&1).unwrap()).unwrap();
        write_packet(&mut client, &packet).await.unwrap();

        let frames = read_all(client).await;
        task.await.unwrap().unwrap();
        let mut trailers = Metadata::new();
        trailers.add("test_key", "test_value");
        assert_eq!(
            frames,
            vec![Frame::Trailers {
                status: Status::new(StatusCode::Unknown, HANDLER_EXCEPTION),
                metadata: trailers,
            }]
        );
    }

    #[tokio::test]
    async fn test_handler_panic_is_unknown() {
        let mut registry = HandlerRegistry::new();
        registry.add_unary(&echo(), |v: i32, _ctx| async move {
            if v > 0 {
                panic!("boom");
            }
            Ok(v)
        });

        let (mut client, server) = duplex(64 * 1024);
        let task = spawn_server(registry, server);

        let mut packet = Packet::new();
        packet.push(&request_init("/Test/Echo", None));
        packet.push_payload(echo().request_marshaller().serialize(&1).unwrap()).unwrap();
        write_packet(&mut client, &packet).await.unwrap();

        let frames = read_all(client).await;
        task.await.unwrap().unwrap();
        assert!(matches!(
            frames.as_slice(),
            [Frame::Trailers { status, .. }] if status.code() == StatusCode::Unknown
        ));
    }

    #[tokio::test]
    async fn test_request_init_timeout_closes() {
        let (client, server) = duplex(1024);
        let task = spawn_server(HandlerRegistry::new(), server);

        let frames = tokio::time::timeout(Duration::from_secs(2), read_all(client))
            .await
            .unwrap();
        task.await.unwrap().unwrap();
        assert!(frames.is_empty());
    }
}
