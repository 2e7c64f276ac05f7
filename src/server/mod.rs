//! Server builder and accept pool lifecycle.
//!
//! The [`ServerBuilder`] registers method handlers and options; the
//! [`Server`] it builds owns the listener and the accept loops:
//! 1. Bind the pipe path
//! 2. Run `pool_size` accept loops
//! 3. Serve each accepted connection (one call) on its own task
//!
//! # Example
//!
//! ```ignore
//! use pipe_rpc::{Method, MethodType, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let echo = Method::<Request, Response>::msgpack(MethodType::Unary, "Test", "Echo");
//!     let server = Server::builder("/tmp/my-service.sock")
//!         .add_unary(&echo, |request: Request, _ctx| async move {
//!             Ok(Response { value: request.value })
//!         })
//!         .on_error(|e| eprintln!("server error: {e}"))
//!         .build();
//!
//!     server.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

mod connection;
mod pool;

pub(crate) use connection::ServerConnection;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cancel::CancellationToken;
use crate::error::{PipeRpcError, Result};
use crate::handler::{HandlerRegistry, PipeCallContext};
use crate::logger::LoggerFactory;
use crate::method::Method;
use crate::stream::{MessageReader, ResponseStreamWriter};
use crate::transport::PipeListener;
use pool::{accept_loop, TaskTracker};

/// Default number of concurrent accept loops.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Observer for accept and connection errors.
pub type ErrorSink = Arc<dyn Fn(&PipeRpcError) + Send + Sync>;

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Accept loops kept waiting for clients.
    pub pool_size: usize,
    /// A connection that sends no `RequestInit` within this time is dropped.
    pub request_init_timeout: Duration,
    pub accept_backoff_initial: Duration,
    pub accept_backoff_max: Duration,
    /// Restrict the socket to the owning user.
    pub current_user_only: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            request_init_timeout: Duration::from_secs(10),
            accept_backoff_initial: Duration::from_millis(100),
            accept_backoff_max: Duration::from_secs(10),
            current_user_only: false,
        }
    }
}

/// State shared by the accept loops and the connections they serve.
pub(crate) struct ServerShared {
    registry: Arc<HandlerRegistry>,
    options: ServerOptions,
    loggers: Arc<LoggerFactory>,
    tracker: TaskTracker,
    on_error: Option<ErrorSink>,
}

impl ServerShared {
    fn report(&self, error: &PipeRpcError) {
        match &self.on_error {
            Some(sink) => sink(error),
            None => tracing::error!("Server error: {}", error),
        }
    }
}

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    path: String,
    registry: HandlerRegistry,
    options: ServerOptions,
    on_error: Option<ErrorSink>,
}

impl ServerBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            registry: HandlerRegistry::new(),
            options: ServerOptions::default(),
            on_error: None,
        }
    }

    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.options.pool_size = size.max(1);
        self
    }

    pub fn request_init_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_init_timeout = timeout;
        self
    }

    pub fn current_user_only(mut self, enabled: bool) -> Self {
        self.options.current_user_only = enabled;
        self
    }

    /// Receive accept and connection errors instead of having them logged.
    pub fn on_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&PipeRpcError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(sink));
        self
    }

    pub fn add_unary<Req, Resp, F, Fut>(mut self, method: &Method<Req, Resp>, handler: F) -> Self
    where
        F: Fn(Req, PipeCallContext) -> Fut + Send + Sync + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.registry.add_unary(method, handler);
        self
    }

    pub fn add_client_streaming<Req, Resp, F, Fut>(mut self, method: &Method<Req, Resp>, handler: F) -> Self
    where
        F: Fn(MessageReader<Req>, PipeCallContext) -> Fut + Send + Sync + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.registry.add_client_streaming(method, handler);
        self
    }

    pub fn add_server_streaming<Req, Resp, F, Fut>(mut self, method: &Method<Req, Resp>, handler: F) -> Self
    where
        F: Fn(Req, ResponseStreamWriter<Resp>, PipeCallContext) -> Fut + Send + Sync + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.add_server_streaming(method, handler);
        self
    }

    pub fn add_duplex_streaming<Req, Resp, F, Fut>(mut self, method: &Method<Req, Resp>, handler: F) -> Self
    where
        F: Fn(MessageReader<Req>, ResponseStreamWriter<Resp>, PipeCallContext) -> Fut
            + Send
            + Sync
            + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.add_duplex_streaming(method, handler);
        self
    }

    pub fn build(self) -> Server {
        Server {
            path: self.path,
            shared: Arc::new(ServerShared {
                registry: Arc::new(self.registry),
                options: self.options,
                loggers: LoggerFactory::new(),
                tracker: TaskTracker::default(),
                on_error: self.on_error,
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            stop: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    started: bool,
    killed: bool,
}

/// A pipe server. Dropping it stops accepting new connections.
pub struct Server {
    path: String,
    shared: Arc<ServerShared>,
    lifecycle: Mutex<Lifecycle>,
    stop: CancellationToken,
}

impl Server {
    pub fn builder(path: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(path)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Bind the path and start the accept loops. Starting twice is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if the server has been killed
    /// - `Io` if the path cannot be bound
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.killed {
            return Err(PipeRpcError::invalid_operation(
                "The server has been killed and can't be restarted. Create a new server if needed.",
            ));
        }
        if lifecycle.started {
            return Ok(());
        }

        let pool_size = self.shared.options.pool_size.max(1);
        let listener = Arc::new(PipeListener::bind(
            &self.path,
            self.shared.options.current_user_only,
        )?);
        for _ in 0..pool_size {
            self.shared.tracker.spawn(accept_loop(
                Arc::clone(&listener),
                Arc::clone(&self.shared),
                self.stop.clone(),
            ));
        }
        lifecycle.started = true;
        tracing::debug!(
            "Server listening on '{}' with {} accept loops",
            self.path,
            pool_size
        );
        Ok(())
    }

    /// Stop accepting connections. Calls in flight run to completion.
    pub fn kill(&self) {
        self.lifecycle.lock().killed = true;
        self.stop.cancel();
    }

    /// Kill, then wait for every accept loop, connection and handler task.
    pub async fn shutdown(&self) {
        self.kill();
        self.shared.tracker.wait().await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.kill();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("path", &self.path)
            .field("options", &self.shared.options)
            .field("lifecycle", &*self.lifecycle.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::generate_pipe_path;

    #[test]
    fn test_default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.pool_size, 4);
        assert_eq!(options.request_init_timeout, Duration::from_secs(10));
        assert_eq!(options.accept_backoff_initial, Duration::from_millis(100));
        assert_eq!(options.accept_backoff_max, Duration::from_secs(10));
        assert!(!options.current_user_only);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_kill_is_final() {
        let server = Server::builder(generate_pipe_path()).pool_size(2).build();
        server.start().unwrap();
        server.start().unwrap();

        server.shutdown().await;
        match server.start() {
            Err(PipeRpcError::InvalidOperation(msg)) => assert!(msg.contains("can't be restarted")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_releases_socket_file() {
        let path = generate_pipe_path();
        let server = Server::builder(path.clone()).build();
        server.start().unwrap();
        assert!(std::path::Path::new(&path).exists());

        server.shutdown().await;
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn test_kill_before_start() {
        let server = Server::builder(generate_pipe_path()).build();
        server.kill();
        assert!(matches!(server.start(), Err(PipeRpcError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_zero_pool_size_still_accepts() {
        let server = Server::builder(generate_pipe_path())
            .options(ServerOptions {
                pool_size: 0,
                ..ServerOptions::default()
            })
            .build();
        server.start().unwrap();
        assert_eq!(server.shared.tracker.active(), 1);
        server.shutdown().await;
    }
}
