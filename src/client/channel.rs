//! Client entry point: one `Channel` per server path, one connection per call.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use super::call::{ClientStreamingCall, DuplexStreamingCall, ServerStreamingCall, UnaryCall};
use super::connection::ClientConnection;
use crate::backoff::Backoff;
use crate::cancel::CancellationToken;
use crate::deadline::Deadline;
use crate::error::{PipeRpcError, Result};
use crate::logger::LoggerFactory;
use crate::metadata::Metadata;
use crate::method::{Method, MethodType};
use crate::transport::{connect, is_transient, PipeStream};

/// Connection settings shared by every call on a [`Channel`].
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Total time allowed for connecting, retries included. `None` retries
    /// until the call is cancelled or its deadline passes.
    pub connection_timeout: Option<Duration>,
    pub connect_backoff_initial: Duration,
    pub connect_backoff_max: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connection_timeout: Some(Duration::from_secs(30)),
            connect_backoff_initial: Duration::from_millis(100),
            connect_backoff_max: Duration::from_millis(1000),
        }
    }
}

impl ChannelOptions {
    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn connect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.connect_backoff_initial = initial;
        self.connect_backoff_max = max;
        self
    }
}

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub headers: Metadata,
    pub deadline: Option<SystemTime>,
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers(mut self, headers: Metadata) -> Self {
        self.headers = headers;
        self
    }

    pub fn deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(SystemTime::now() + timeout)
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

struct ChannelInner {
    path: String,
    options: ChannelOptions,
    loggers: Arc<LoggerFactory>,
}

/// Handle for making calls to the server listening at a pipe path.
///
/// Cheap to clone; clones share the connection-id counter used in logs.
///
/// # Example
///
/// ```ignore
/// use pipe_rpc::{CallOptions, Channel, Method, MethodType};
///
/// let echo = Method::<Request, Response>::msgpack(MethodType::Unary, "Test", "Echo");
/// let channel = Channel::new("/tmp/my-service.sock");
/// let response = channel.unary(&echo, &Request { value: 10 }, CallOptions::new()).await?;
/// ```
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_options(path, ChannelOptions::default())
    }

    pub fn with_options(path: impl Into<String>, options: ChannelOptions) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                path: path.into(),
                options,
                loggers: LoggerFactory::new(),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Make a unary call and wait for its response.
    pub async fn unary<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp> {
        self.async_unary(method, request, options).await?.response().await
    }

    /// Start a unary call, keeping access to headers, status and trailers.
    pub async fn async_unary<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        request: &Req,
        options: CallOptions,
    ) -> Result<UnaryCall<Resp>> {
        expect_type(method, MethodType::Unary)?;
        let request = method.request_marshaller().serialize(request)?;
        let connection = self.start_call(method, options, Some(request)).await;
        Ok(UnaryCall::new(connection, Arc::clone(method.response_marshaller())))
    }

    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        request: &Req,
        options: CallOptions,
    ) -> Result<ServerStreamingCall<Resp>> {
        expect_type(method, MethodType::ServerStreaming)?;
        let request = method.request_marshaller().serialize(request)?;
        let connection = self.start_call(method, options, Some(request)).await;
        Ok(ServerStreamingCall::new(
            connection,
            Arc::clone(method.response_marshaller()),
        ))
    }

    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        options: CallOptions,
    ) -> Result<ClientStreamingCall<Req, Resp>> {
        expect_type(method, MethodType::ClientStreaming)?;
        let connection = self.start_call(method, options, None).await;
        Ok(ClientStreamingCall::new(
            connection,
            Arc::clone(method.request_marshaller()),
            Arc::clone(method.response_marshaller()),
        ))
    }

    pub async fn duplex_streaming<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        options: CallOptions,
    ) -> Result<DuplexStreamingCall<Req, Resp>> {
        expect_type(method, MethodType::DuplexStreaming)?;
        let connection = self.start_call(method, options, None).await;
        Ok(DuplexStreamingCall::new(
            connection,
            Arc::clone(method.request_marshaller()),
            Arc::clone(method.response_marshaller()),
        ))
    }

    async fn start_call<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        options: CallOptions,
        request: Option<bytes::Bytes>,
    ) -> Arc<ClientConnection> {
        let connection = ClientConnection::new(
            method.full_name(),
            method.method_type(),
            self.inner.loggers.client(),
            Deadline::track(options.deadline),
            options.cancellation.unwrap_or_default(),
        );
        connection
            .start(&self.inner.path, &self.inner.options, &options.headers, request)
            .await;
        connection
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("path", &self.inner.path)
            .field("options", &self.inner.options)
            .finish()
    }
}

fn expect_type<Req, Resp>(method: &Method<Req, Resp>, expected: MethodType) -> Result<()> {
    if method.method_type() != expected {
        return Err(PipeRpcError::invalid_operation(format!(
            "Method '{}' is {:?}, not {:?}",
            method.full_name(),
            method.method_type(),
            expected
        )));
    }
    Ok(())
}

/// Connect, retrying transient failures with exponential backoff until the
/// connection timeout is used up.
pub(crate) async fn connect_with_retry(path: &str, options: &ChannelOptions) -> io::Result<PipeStream> {
    let started = Instant::now();
    let mut backoff = Backoff::new(options.connect_backoff_initial, options.connect_backoff_max);

    loop {
        let remaining = options
            .connection_timeout
            .map(|budget| budget.saturating_sub(started.elapsed()));

        let attempt = match remaining {
            Some(remaining) => match tokio::time::timeout(remaining, connect(path)).await {
                Ok(attempt) => attempt,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            },
            None => connect(path).await,
        };

        let err = match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) if is_transient(&e) => e,
            Err(e) => return Err(e),
        };

        let delay = backoff.next_delay();
        match options.connection_timeout {
            Some(budget) => {
                let left = budget.saturating_sub(started.elapsed());
                if left.is_zero() {
                    return Err(err);
                }
                tokio::time::sleep(delay.min(left)).await;
            }
            None => tokio::time::sleep(delay).await,
        }
        tracing::trace!("Retrying connect to '{}' after: {}", path, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{generate_pipe_path, PipeListener};

    #[test]
    fn test_default_options() {
        let options = ChannelOptions::default();
        assert_eq!(options.connection_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.connect_backoff_initial, Duration::from_millis(100));
        assert_eq!(options.connect_backoff_max, Duration::from_millis(1000));
    }

    #[test]
    fn test_call_options_builder() {
        let mut headers = Metadata::new();
        headers.add("a", "1");
        let deadline = SystemTime::now() + Duration::from_secs(5);
        let options = CallOptions::new().headers(headers.clone()).deadline(deadline);
        assert_eq!(options.headers, headers);
        assert_eq!(options.deadline, Some(deadline));
        assert!(options.cancellation.is_none());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_timeout() {
        let options = ChannelOptions::default().connection_timeout(Some(Duration::from_millis(250)));
        let started = Instant::now();
        let result = connect_with_retry(&generate_pipe_path(), &options).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_retries_until_listener_appears() {
        let path = generate_pipe_path();
        let options = ChannelOptions::default()
            .connection_timeout(Some(Duration::from_secs(5)))
            .connect_backoff(Duration::from_millis(20), Duration::from_millis(50));

        let bind_path = path.clone();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = PipeListener::bind(&bind_path, false).unwrap();
            let _stream = listener.accept().await.unwrap();
        });

        connect_with_retry(&path, &options).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_method_type_rejected() {
        let channel = Channel::new(generate_pipe_path());
        let method = Method::<i32, i32>::msgpack(MethodType::ServerStreaming, "Test", "Stream");
        match channel.async_unary(&method, &1, CallOptions::new()).await {
            Err(PipeRpcError::InvalidOperation(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
