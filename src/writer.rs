//! Serialized, merging write path for one connection.
//!
//! Every outgoing group of messages is a [`WriteTransaction`]. Committed
//! transactions go into the connection's [`WriteQueue`]; a flush task drains
//! the queue, merges everything that is pending into a single packet and
//! writes it with one vectored write.
//!
//! # Architecture
//!
//! ```text
//! Call writes   ─┐
//! Cancel frames ─┼─► WriteQueue (pending packets) ─► Flush task ─► Stream
//! Trailers      ─┘
//! ```
//!
//! The flush task is started lazily by the first commit that finds the queue
//! idle, and exits as soon as the queue is empty again. Write errors are
//! logged and dropped here; the connection's read loop is what notices that
//! the peer has gone away.

use std::fmt;
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::error::{PipeRpcError, Result};
use crate::logger::ConnectionLogger;
use crate::metadata::Metadata;
use crate::protocol::{Packet, RequestControl, TransportMessage};
use crate::status::{RpcError, Status, StatusCode};

/// Detail reported when writing to a connection that is known to be gone.
pub const CONNECTION_TERMINATED: &str = "connection was unexpectedly terminated";

/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct QueueState {
    pending: Vec<Packet>,
    flushing: bool,
}

/// FIFO write queue owned by one connection.
pub struct WriteQueue {
    state: Mutex<QueueState>,
    writer: AsyncMutex<BoxedWriter>,
    connected: AtomicBool,
    idle: Notify,
    runtime: Handle,
    logger: Arc<ConnectionLogger>,
}

impl WriteQueue {
    /// Create a queue over the write half of a connection.
    ///
    /// Must be called from within a tokio runtime; flush tasks are spawned on it.
    pub fn new<W>(writer: W, logger: Arc<ConnectionLogger>) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            writer: AsyncMutex::new(Box::new(writer)),
            connected: AtomicBool::new(true),
            idle: Notify::new(),
            runtime: Handle::current(),
            logger,
        })
    }

    /// Start a new transaction on this queue.
    pub fn transaction(self: &Arc<Self>) -> WriteTransaction {
        WriteTransaction {
            queue: Arc::clone(self),
            packet: Packet::new(),
            error: None,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Refuse all further commits.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn enqueue(self: &Arc<Self>, packet: Packet) -> Result<()> {
        if !self.is_connected() {
            return Err(RpcError::new(StatusCode::Unavailable, CONNECTION_TERMINATED).into());
        }

        let mut state = self.state.lock();
        state.pending.push(packet);
        if !state.flushing {
            state.flushing = true;
            self.runtime.spawn(Arc::clone(self).flush_loop());
        }
        Ok(())
    }

    async fn flush_loop(self: Arc<Self>) {
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    state.flushing = false;
                    self.idle.notify_waiters();
                    return;
                }
                std::mem::take(&mut state.pending)
            };

            let mut batch = batch.into_iter();
            let mut merged = match batch.next() {
                Some(first) => first,
                None => continue,
            };
            for packet in batch {
                merged.append(packet);
            }

            let mut writer = self.writer.lock().await;
            if let Err(e) = write_packet(&mut *writer, &merged).await {
                self.logger.log(format_args!("Write failed: {}", e));
            }
        }
    }

    /// Wait until every committed transaction has been written (or failed).
    pub async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.state.lock().flushing {
                return;
            }
            notified.await;
        }
    }

    /// Flush, then shut down the write half of the stream.
    pub async fn shutdown(&self) {
        self.flush().await;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WriteQueue")
            .field("connected", &self.connected.load(Ordering::Acquire))
            .field("pending", &state.pending.len())
            .field("flushing", &state.flushing)
            .finish()
    }
}

/// A group of messages written to the stream as one unit.
#[must_use = "a transaction does nothing until committed"]
pub struct WriteTransaction {
    queue: Arc<WriteQueue>,
    packet: Packet,
    error: Option<PipeRpcError>,
}

impl WriteTransaction {
    fn push(mut self, message: TransportMessage) -> Self {
        self.queue.logger.log(format_args!("Sending <{}>", message.kind()));
        self.packet.push(&message);
        self
    }

    pub fn request_init(self, method_full_name: &str, deadline: Option<SystemTime>) -> Self {
        let connection_id = self.queue.logger.id();
        self.push(TransportMessage::RequestInit {
            method_full_name: method_full_name.to_string(),
            deadline,
            connection_id,
        })
    }

    pub fn headers(self, metadata: &Metadata) -> Self {
        self.push(TransportMessage::Headers(metadata.clone()))
    }

    pub fn payload(mut self, payload: Bytes) -> Self {
        self.queue
            .logger
            .log(format_args!("Sending <Payload> with {} bytes", payload.len()));
        if self.error.is_none() {
            self.error = self.packet.push_payload(payload).err();
        }
        self
    }

    pub fn cancel(self) -> Self {
        self.push(TransportMessage::RequestControl(RequestControl::Cancel))
    }

    pub fn stream_end(self) -> Self {
        self.push(TransportMessage::RequestControl(RequestControl::StreamEnd))
    }

    pub fn trailers(self, status: &Status, metadata: &Metadata) -> Self {
        self.push(TransportMessage::Trailers {
            status: status.clone(),
            metadata: metadata.clone(),
        })
    }

    /// Hand the transaction to the queue.
    ///
    /// # Errors
    ///
    /// - `Protocol` if a payload exceeds the maximum size; nothing is sent
    /// - `Unavailable` if the connection is already known to be disconnected
    pub fn commit(self) -> Result<()> {
        let WriteTransaction { queue, packet, error } = self;
        if let Some(e) = error {
            return Err(e);
        }
        if packet.is_empty() {
            return Ok(());
        }
        queue.enqueue(packet)
    }
}

/// Write a whole packet (prefix, body, trailing blocks) with vectored writes.
pub(crate) async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let prefix = packet.prefix();
    let mut chunks: Vec<&[u8]> = Vec::with_capacity(2 + packet.trailing().len());
    chunks.push(&prefix);
    if !packet.body().is_empty() {
        chunks.push(packet.body());
    }
    chunks.extend(packet.trailing().iter().map(|b| &b[..]).filter(|b| !b.is_empty()));

    let total_size = packet.wire_len();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(&chunks, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(PipeRpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` have been written.
fn build_remaining_slices<'a>(chunks: &[&'a [u8]], skip_bytes: usize) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(chunks.len());
    let mut skipped = 0;

    for chunk in chunks {
        let start = skipped;
        let end = skipped + chunk.len();
        if skip_bytes < end {
            let start_in_chunk = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&chunk[start_in_chunk..]));
        }
        skipped = end;
    }

    slices
}
