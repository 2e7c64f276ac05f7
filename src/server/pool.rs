//! Accept pool: N concurrent accept loops feeding call contexts.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::connection::serve_connection;
use super::ServerShared;
use crate::backoff::Backoff;
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::transport::{PipeListener, PipeStream};

#[derive(Default)]
struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

/// Counts spawned tasks so shutdown can wait for all of them.
#[derive(Clone, Default)]
pub(crate) struct TaskTracker {
    inner: Arc<TrackerInner>,
}

struct TaskGuard(TaskTracker);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.0.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.inner.idle.notify_waiters();
        }
    }
}

impl TaskTracker {
    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let guard = TaskGuard(self.clone());
        tokio::spawn(async move {
            let _guard = guard;
            task.await
        })
    }

    pub(crate) fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Wait until no tracked task is running.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Source of incoming connections for [`accept_loop`].
pub(crate) trait Acceptor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    fn accept(&self) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Peer description handed to call contexts.
    fn peer(stream: &Self::Stream) -> Option<String>;

    fn path(&self) -> &str;
}

impl Acceptor for PipeListener {
    type Stream = PipeStream;

    fn accept(&self) -> impl Future<Output = Result<PipeStream>> + Send {
        PipeListener::accept(self)
    }

    fn peer(stream: &PipeStream) -> Option<String> {
        stream
            .peer_pid()
            .map(|pid| format!("net.pipe://localhost/pid/{}", pid))
    }

    fn path(&self) -> &str {
        PipeListener::path(self)
    }
}

/// Accept connections until `stop` fires.
///
/// Accept errors go to the error sink and are retried after an exponential
/// backoff, which resets on the next successful accept.
pub(crate) async fn accept_loop<A: Acceptor>(listener: Arc<A>, shared: Arc<ServerShared>, stop: CancellationToken) {
    let options = &shared.options;
    let mut backoff = Backoff::new(options.accept_backoff_initial, options.accept_backoff_max);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(stream) => {
                backoff.reset();
                let peer = A::peer(&stream);
                let logger = shared.loggers.server();
                let tracker = shared.tracker.clone();
                let shared = Arc::clone(&shared);
                tracker.spawn(async move {
                    let served = serve_connection(
                        stream,
                        peer,
                        Arc::clone(&shared.registry),
                        logger,
                        shared.options.request_init_timeout,
                        shared.tracker.clone(),
                    )
                    .await;
                    if let Err(e) = served {
                        shared.report(&e);
                    }
                });
            }
            Err(e) => {
                if stop.is_cancelled() {
                    break;
                }
                tracing::error!("Accept on '{}' failed: {}", listener.path(), e);
                shared.report(&e);
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    tracing::debug!("Accept loop on '{}' stopped", listener.path());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tracker_waits_for_tasks() {
        let tracker = TaskTracker::default();
        tracker.wait().await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tracker.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(tracker.active(), 1);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_tracker_counts_panicked_task_done() {
        let tracker = TaskTracker::default();
        let handle = tracker.spawn(async { panic!("boom") });
        assert!(handle.await.is_err());
        assert_eq!(tracker.active(), 0);
    }

    use crate::error::PipeRpcError;
    use crate::handler::HandlerRegistry;
    use crate::logger::LoggerFactory;
    use crate::server::ServerOptions;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    /// Fails or succeeds per a script, then waits forever.
    struct ScriptedAcceptor {
        script: Mutex<VecDeque<bool>>,
        attempts: Mutex<Vec<Instant>>,
        // Client ends of accepted streams, kept open.
        clients: Mutex<Vec<DuplexStream>>,
        exhausted: Notify,
    }

    impl ScriptedAcceptor {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                attempts: Mutex::new(Vec::new()),
                clients: Mutex::new(Vec::new()),
                exhausted: Notify::new(),
            })
        }
    }

    impl Acceptor for ScriptedAcceptor {
        type Stream = DuplexStream;

        fn accept(&self) -> impl Future<Output = Result<DuplexStream>> + Send {
            self.attempts.lock().push(Instant::now());
            let next = self.script.lock().pop_front();
            if next.is_none() {
                self.exhausted.notify_one();
            }
            let accepted = next.map(|succeed| {
                if succeed {
                    let (client, server) = tokio::io::duplex(1024);
                    self.clients.lock().push(client);
                    Ok(server)
                } else {
                    Err(PipeRpcError::Io(std::io::Error::other("accept failed")))
                }
            });
            async move {
                match accepted {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            }
        }

        fn peer(_stream: &DuplexStream) -> Option<String> {
            None
        }

        fn path(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_reported_with_backoff_reset_on_success() {
        let acceptor = ScriptedAcceptor::new(&[false, false, false, true, false]);
        let reported = Arc::new(Mutex::new(0usize));
        let sink = {
            let reported = Arc::clone(&reported);
            Arc::new(move |_: &PipeRpcError| *reported.lock() += 1) as crate::server::ErrorSink
        };
        let shared = Arc::new(ServerShared {
            registry: Arc::new(HandlerRegistry::new()),
            options: ServerOptions {
                request_init_timeout: Duration::from_secs(3600),
                ..ServerOptions::default()
            },
            loggers: LoggerFactory::new(),
            tracker: TaskTracker::default(),
            on_error: Some(sink),
        });
        let stop = CancellationToken::new();

        let exhausted = acceptor.exhausted.notified();
        let task = tokio::spawn(accept_loop(Arc::clone(&acceptor), Arc::clone(&shared), stop.clone()));
        exhausted.await;

        assert_eq!(*reported.lock(), 4);
        let attempts = acceptor.attempts.lock().clone();
        let gaps: Vec<u128> = attempts.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        // Three failures back off 100, 200, 400; the success is followed by an
        // immediate accept, and the next failure starts from 100 again.
        assert_eq!(gaps.len(), 5);
        for (gap, expected) in gaps.iter().zip([100u128, 200, 400, 0, 100]) {
            assert!((expected..=expected + 5).contains(gap), "gaps {gaps:?}");
        }

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
