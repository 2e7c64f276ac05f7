//! Platform-specific pipe/socket implementation.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! # Example
//!
//! ```ignore
//! use pipe_rpc::transport::{connect, generate_pipe_path, PipeListener};
//!
//! let path = generate_pipe_path();
//! let listener = PipeListener::bind(&path, false)?;
//! let client = connect(&path).await?;
//! let server_side = listener.accept().await?;
//! ```

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Result;

/// Generate a unique pipe path for this process.
///
/// Format:
/// - Unix: `/tmp/pipe-rpc-{pid}-{random}.sock`
/// - Windows: `\\.\pipe\pipe-rpc-{pid}-{random}`
pub fn generate_pipe_path() -> String {
    let pid = std::process::id();
    let rand: u64 = rand_u64();

    #[cfg(unix)]
    {
        format!("/tmp/pipe-rpc-{}-{:x}.sock", pid, rand)
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\pipe-rpc-{}-{:x}", pid, rand)
    }
}

/// Random-enough u64 from the clock, the pid and a process-local counter.
fn rand_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() as u64;
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ seq.rotate_left(32)
}

/// Whether a failed connect attempt is worth retrying.
///
/// A missing or busy endpoint usually means the server has not started
/// listening yet; permission and argument errors will not go away.
pub fn is_transient(err: &io::Error) -> bool {
    #[cfg(windows)]
    {
        // ERROR_PIPE_BUSY: all server instances are in use.
        if err.raw_os_error() == Some(231) {
            return true;
        }
    }
    !matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported
    )
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix Domain Socket listener; removes its socket file on drop.
    #[derive(Debug)]
    pub struct PipeListener {
        listener: UnixListener,
        path: String,
    }

    /// A connected Unix Domain Socket.
    #[derive(Debug)]
    pub struct PipeStream {
        stream: UnixStream,
    }

    impl PipeListener {
        /// Bind to a Unix socket path.
        ///
        /// Removes any existing socket file at the path before binding. With
        /// `current_user_only` the socket file is made accessible to the
        /// owning user only.
        pub fn bind(path: &str, current_user_only: bool) -> Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            if current_user_only {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }

            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        /// Wait for the next client.
        pub async fn accept(&self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(PipeStream { stream })
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    impl PipeStream {
        pub(super) fn get_pin(self: Pin<&mut Self>) -> Pin<&mut UnixStream> {
            Pin::new(&mut self.get_mut().stream)
        }

        /// Process id of the connected peer, where the OS reports it.
        pub fn peer_pid(&self) -> Option<u32> {
            self.stream
                .peer_cred()
                .ok()
                .and_then(|cred| cred.pid())
                .and_then(|pid| u32::try_from(pid).ok())
        }
    }

    /// Connect to a listening socket.
    pub async fn connect(path: &str) -> io::Result<PipeStream> {
        let stream = UnixStream::connect(path).await?;
        Ok(PipeStream { stream })
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

    /// Windows Named Pipe listener. Each accept creates a fresh pipe instance.
    #[derive(Debug)]
    pub struct PipeListener {
        path: String,
    }

    #[derive(Debug)]
    enum Pipe {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    /// A connected Named Pipe, either end.
    #[derive(Debug)]
    pub struct PipeStream {
        pipe: Pipe,
    }

    impl PipeListener {
        /// Check the pipe name can be created.
        ///
        /// `current_user_only` is accepted for parity with Unix; the default
        /// pipe security already limits access to the creating user's session.
        pub fn bind(path: &str, _current_user_only: bool) -> Result<Self> {
            let _ = ServerOptions::new().first_pipe_instance(true).create(path)?;

            Ok(Self {
                path: path.to_string(),
            })
        }

        /// Create a new server instance and wait for a client on it.
        pub async fn accept(&self) -> Result<PipeStream> {
            let server = ServerOptions::new()
                .first_pipe_instance(false)
                .create(&self.path)?;

            server.connect().await?;

            Ok(PipeStream {
                pipe: Pipe::Server(server),
            })
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl PipeStream {
        /// Process id of the connected peer. Not tracked for named pipes.
        pub fn peer_pid(&self) -> Option<u32> {
            None
        }
    }

    /// Open the client end of a named pipe.
    pub async fn connect(path: &str) -> io::Result<PipeStream> {
        let client = ClientOptions::new().open(path)?;
        Ok(PipeStream {
            pipe: Pipe::Client(client),
        })
    }

    macro_rules! with_pipe {
        ($self:ident, $p:ident => $e:expr) => {
            match &mut $self.get_mut().pipe {
                Pipe::Server($p) => {
                    let $p = Pin::new($p);
                    $e
                }
                Pipe::Client($p) => {
                    let $p = Pin::new($p);
                    $e
                }
            }
        };
    }

    impl AsyncRead for PipeStream {
        fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            with_pipe!(self, p => p.poll_read(cx, buf))
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            with_pipe!(self, p => p.poll_write(cx, buf))
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            with_pipe!(self, p => p.poll_flush(cx))
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            with_pipe!(self, p => p.poll_shutdown(cx))
        }
    }
}

#[cfg(unix)]
impl AsyncRead for PipeStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_pin().poll_read(cx, buf)
    }
}

#[cfg(unix)]
impl AsyncWrite for PipeStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_pin().poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.get_pin().poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        true
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_pin().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_pin().poll_shutdown(cx)
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{connect, PipeListener, PipeStream};

#[cfg(windows)]
pub use windows_impl::{connect, PipeListener, PipeStream};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_pipe_path_format() {
        let path = generate_pipe_path();

        #[cfg(unix)]
        {
            assert!(path.starts_with("/tmp/pipe-rpc-"));
            assert!(path.ends_with(".sock"));
        }

        #[cfg(windows)]
        {
            assert!(path.starts_with(r"\\.\pipe\pipe-rpc-"));
        }

        assert!(path.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_generate_pipe_path_uniqueness() {
        let paths: std::collections::HashSet<String> = (0..100).map(|_| generate_pipe_path()).collect();
        assert_eq!(paths.len(), 100);
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_accept_and_cleanup() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let path = generate_pipe_path();
        let listener = PipeListener::bind(&path, true).unwrap();

        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let (client, server) = tokio::join!(connect(&path), listener.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();
        assert_eq!(server.peer_pid(), Some(std::process::id()));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(listener);
        assert!(!std::path::Path::new(&path).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_without_listener_is_transient() {
        let err = connect(&generate_pipe_path()).await.unwrap_err();
        assert!(is_transient(&err));
    }
}
