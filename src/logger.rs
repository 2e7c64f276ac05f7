//! Per-connection tracing.
//!
//! Every connection gets a logger tagged with its side and a process-unique
//! id, so interleaved client and server events can be told apart:
//!
//! ```text
//! [SERVER][3] Received <RequestInit> for '/Test/Echo'
//! [CLIENT][3] Sending <Trailers>
//! ```
//!
//! The client id is sent to the server in `RequestInit`, so both ends of a
//! call log with the same number.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Side::Client => "CLIENT",
            Side::Server => "SERVER",
        }
    }
}

/// Logger bound to a single connection.
#[derive(Debug)]
pub struct ConnectionLogger {
    side: Side,
    id: AtomicU32,
}

impl ConnectionLogger {
    fn new(side: Side, id: u32) -> Self {
        Self {
            side,
            id: AtomicU32::new(id),
        }
    }

    /// Logger for a connection whose id is not known (yet).
    pub fn server_unassigned() -> Self {
        Self::new(Side::Server, 0)
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    /// Adopt the id the client announced.
    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    /// Emit a debug event tagged with this connection.
    pub fn log(&self, args: fmt::Arguments<'_>) {
        tracing::debug!(
            target: "pipe_rpc::connection",
            "[{}][{}] {}",
            self.side.as_str(),
            self.id(),
            args
        );
    }
}

/// Source of connection loggers with a shared id counter.
#[derive(Debug, Default)]
pub struct LoggerFactory {
    next_id: AtomicU32,
}

impl LoggerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Logger for a new client connection with a fresh id.
    pub fn client(&self) -> ConnectionLogger {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionLogger::new(Side::Client, id)
    }

    /// Logger for a server connection; the id is assigned on `RequestInit`.
    pub fn server(&self) -> ConnectionLogger {
        ConnectionLogger::server_unassigned()
    }
}
