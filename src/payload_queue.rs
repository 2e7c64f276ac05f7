//! Hand-off queue between a connection's read loop and the single consumer
//! of its incoming messages.
//!
//! The read loop pushes payloads and a terminal outcome; the consumer pulls
//! them in order with [`PayloadQueue::next`]. Only one `next` may be pending
//! at a time.

use std::collections::VecDeque;
use std::future::Future;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{PipeRpcError, Result};
use crate::status::RpcError;

/// Terminal state of a queue.
#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Errored(RpcError),
}

/// What a waiting consumer is woken with.
#[derive(Debug)]
enum Delivery {
    Item(Bytes),
    Done(Terminal),
}

#[derive(Default)]
struct State {
    items: VecDeque<Bytes>,
    waiter: Option<(u64, oneshot::Sender<Delivery>)>,
    terminal: Option<Terminal>,
    next_waiter_id: u64,
}

/// Ordered payload buffer with a completed / errored terminal state.
#[derive(Default)]
pub struct PayloadQueue {
    state: Mutex<State>,
}

fn already_completed() -> PipeRpcError {
    PipeRpcError::invalid_operation("stream already completed")
}

impl PayloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a payload, handing it straight to a waiting consumer if there is one.
    pub fn append(&self, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return Err(already_completed());
        }
        let payload = match state.waiter.take() {
            Some((_, tx)) => match tx.send(Delivery::Item(payload)) {
                Ok(()) => return Ok(()),
                Err(Delivery::Item(payload)) => payload,
                Err(Delivery::Done(_)) => return Ok(()),
            },
            None => payload,
        };
        state.items.push_back(payload);
        Ok(())
    }

    /// Mark the stream as cleanly finished.
    pub fn set_completed(&self) -> Result<()> {
        self.finish(Terminal::Completed)
    }

    /// Mark the stream as failed; every later `next` past the buffered
    /// items returns this error.
    pub fn set_error(&self, error: RpcError) -> Result<()> {
        self.finish(Terminal::Errored(error))
    }

    fn finish(&self, terminal: Terminal) -> Result<()> {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return Err(already_completed());
        }
        state.terminal = Some(terminal.clone());
        // A waiter only exists while the buffer is empty.
        if let Some((_, tx)) = state.waiter.take() {
            let _ = tx.send(Delivery::Done(terminal));
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// Error the queue with `Unavailable` unless it already finished.
    ///
    /// Used when a connection is torn down before its stream ended.
    pub fn dispose(&self) {
        let _ = self.set_error(RpcError::unavailable());
    }

    /// Next payload, `Ok(None)` at a clean end, or the terminal error.
    ///
    /// Returns `Err(Cancelled)` if `cancelled` resolves first; the queue is
    /// left as it was and a later `next` can still read everything.
    pub async fn next<C>(&self, cancelled: C) -> Result<Option<Bytes>>
    where
        C: Future<Output = ()>,
    {
        let mut cancelled = std::pin::pin!(cancelled);
        if (&mut cancelled).now_or_never().is_some() {
            return Err(PipeRpcError::Cancelled);
        }

        let (id, rx) = {
            let mut state = self.state.lock();
            if state.waiter.is_some() {
                return Err(PipeRpcError::invalid_operation("Overlapping next calls"));
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            match &state.terminal {
                Some(Terminal::Completed) => return Ok(None),
                Some(Terminal::Errored(e)) => return Err(e.clone().into()),
                None => {}
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiter = Some((id, tx));
            (id, rx)
        };

        let mut guard = WaiterGuard {
            queue: self,
            id,
            rx: Some(rx),
        };

        let delivery = {
            let rx = match guard.rx.as_mut() {
                Some(rx) => rx,
                None => return Err(PipeRpcError::Cancelled),
            };
            tokio::select! {
                biased;
                delivery = rx => delivery,
                _ = &mut cancelled => return Err(PipeRpcError::Cancelled),
            }
        };
        guard.rx = None;

        match delivery {
            Ok(Delivery::Item(item)) => Ok(Some(item)),
            Ok(Delivery::Done(Terminal::Completed)) => Ok(None),
            Ok(Delivery::Done(Terminal::Errored(e))) => Err(e.into()),
            // Sender dropped without a delivery: only happens if the queue
            // itself went away.
            Err(_) => Err(RpcError::unavailable().into()),
        }
    }
}

/// Unregisters an abandoned waiter and salvages anything already handed to it.
struct WaiterGuard<'a> {
    queue: &'a PayloadQueue,
    id: u64,
    rx: Option<oneshot::Receiver<Delivery>>,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut state = self.queue.state.lock();
        if matches!(state.waiter, Some((id, _)) if id == self.id) {
            state.waiter = None;
        }
        rx.close();
        // An item delivered just before cancellation goes back to the front.
        if let Ok(Delivery::Item(item)) = rx.try_recv() {
            state.items.push_front(item);
        }
    }
}
