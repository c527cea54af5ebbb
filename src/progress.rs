//! Progress reporting, kept off the data path
//!
//! Stages push [`ProgressEvent`]s into a bounded queue. A dispatcher task
//! drains it and awaits the caller's notifier one event at a time, so a
//! notifier may do async work without ever holding the byte channel.
//! Pushing never waits: when the notifier has fallen a full queue behind,
//! new events are dropped and counted.
//!
//! Notifier failures are logged and dropped.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Default depth of the progress queue
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// How long a finished run waits for queued events to be delivered
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Error a notifier may return; it never fails the run
pub type NotifyError = Box<dyn std::error::Error + Send + Sync>;

/// One observable step of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Sources were scanned; totals for the whole run
    Started { total_files: u64, total_bytes: u64 },
    /// An entry was fully written to, or extracted from, the archive
    Entry { name: String, size: u64 },
    /// An entry was left out, e.g. a special file or an unsafe path
    Skipped { name: String, reason: String },
    /// A part file was completed
    ChunkWritten { index: u32, size: u64 },
    /// A part file was read back (and verified, when enabled)
    ChunkVerified { index: u32, size: u64 },
}

/// Receiver of progress events
pub trait ProgressNotifier: Send + Sync {
    fn notify(&self, event: ProgressEvent) -> BoxFuture<'_, Result<(), NotifyError>>;
}

impl<F, Fut> ProgressNotifier for F
where
    F: Fn(ProgressEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), NotifyError>> + Send + 'static,
{
    fn notify(&self, event: ProgressEvent) -> BoxFuture<'_, Result<(), NotifyError>> {
        Box::pin(self(event))
    }
}

/// Sending side of the progress queue; a no-op when no notifier is installed
#[derive(Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    dropped: Arc<AtomicU64>,
}

impl ProgressSender {
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue `event` without waiting; usable from async and blocking stages
    pub fn emit(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    tracing::warn!("progress notifier is falling behind, dropping events");
                }
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("progress dispatcher gone, event dropped");
            }
        }
    }
}

/// Task delivering queued events to the notifier
pub struct ProgressDispatcher {
    handle: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl ProgressDispatcher {
    /// Start the dispatcher; without a notifier nothing is spawned
    pub fn spawn(
        notifier: Option<Arc<dyn ProgressNotifier>>,
        depth: usize,
    ) -> (ProgressSender, ProgressDispatcher) {
        let Some(notifier) = notifier else {
            let sender = ProgressSender::disabled();
            let dropped = sender.dropped.clone();
            return (sender, ProgressDispatcher { handle: None, dropped });
        };

        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(depth.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = notifier.notify(event).await {
                    tracing::warn!(error = %e, "progress notifier failed");
                }
            }
        });

        let dropped = Arc::new(AtomicU64::new(0));
        (
            ProgressSender {
                tx: Some(tx),
                dropped: dropped.clone(),
            },
            ProgressDispatcher {
                handle: Some(handle),
                dropped,
            },
        )
    }

    /// Events that did not fit in the queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deliver what is still queued, waiting at most `timeout`
    ///
    /// All senders must be dropped first, otherwise this waits the full
    /// timeout. A notifier that is still busy afterwards is cancelled.
    pub async fn finish(mut self, timeout: Duration) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "progress dispatcher panicked"),
            Err(_) => {
                tracing::warn!(?timeout, "progress notifier did not finish, abandoning queued events");
                handle.abort();
            }
        }
        let dropped = self.dropped();
        if dropped > 0 {
            tracing::debug!(dropped, "progress events dropped during the run");
        }
    }
}

impl Drop for ProgressDispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
