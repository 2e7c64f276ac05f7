//! Cooperative cancellation token.
//!
//! Tokens are cheap to clone; all clones observe the same state. Once a
//! token is cancelled it stays cancelled.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{PipeRpcError, Result};

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A shareable cancellation flag that async code can wait on.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipeRpcError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Resolves as soon as any of `tokens` is cancelled; never resolves for an
/// empty list.
pub async fn first_cancelled(tokens: &[&CancellationToken]) {
    if tokens.is_empty() {
        return std::future::pending().await;
    }
    let waits = tokens.iter().map(|t| Box::pin(t.cancelled()));
    futures::future::select_all(waits).await;
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
