//! Run-log sink implementations
//!
//! [`ChannelRunLogSink`] is the production sink: `enqueue_log` does a
//! non-blocking `try_send` and a background drain task hands batches to a
//! [`RunLogStore`]. [`ChannelRunLogSink::shutdown`] stops the drain and
//! flushes whatever is still queued.

use async_trait::async_trait;
use parking_lot::Mutex;
use ragline_kernel::error::PipelineResult;
use ragline_kernel::run::{RunLogEntry, RunLogSink};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Maximum entries handed to the store in one write.
const DRAIN_BATCH: usize = 64;

/// Destination of drained run-log entries.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    async fn write(&self, entries: Vec<RunLogEntry>) -> PipelineResult<()>;
}

// ============================================================================
// Stores
// ============================================================================

/// Emits every entry as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunLogStore;

#[async_trait]
impl RunLogStore for TracingRunLogStore {
    async fn write(&self, entries: Vec<RunLogEntry>) -> PipelineResult<()> {
        for entry in entries {
            tracing::info!(
                target: "ragline::run_log",
                run_id = %entry.run_id,
                key = %entry.key,
                value = %entry.value,
                timestamp = %entry.timestamp,
            );
        }
        Ok(())
    }
}

/// Keeps entries in memory, in arrival order.
#[derive(Debug, Default)]
pub struct InMemoryRunLogStore {
    entries: Mutex<Vec<RunLogEntry>>,
}

impl InMemoryRunLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RunLogEntry> {
        self.entries.lock().clone()
    }

    pub fn entries_for(&self, run_id: Uuid) -> Vec<RunLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Keys logged for `run_id`, in arrival order.
    pub fn keys_for(&self, run_id: Uuid) -> Vec<String> {
        self.entries_for(run_id).into_iter().map(|e| e.key).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl RunLogStore for InMemoryRunLogStore {
    async fn write(&self, entries: Vec<RunLogEntry>) -> PipelineResult<()> {
        self.entries.lock().extend(entries);
        Ok(())
    }
}

// ============================================================================
// ChannelRunLogSink
// ============================================================================

/// Bounded, non-blocking run-log sink with a background drain.
///
/// Entries that do not fit in the channel are dropped and counted; a stage
/// never waits on logging.
pub struct ChannelRunLogSink {
    tx: mpsc::Sender<RunLogEntry>,
    stop: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl ChannelRunLogSink {
    /// Create the sink and spawn its drain task on the current runtime.
    pub fn spawn(store: Arc<dyn RunLogStore>, buffer: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let stop = CancellationToken::new();
        let drain = tokio::spawn(drain(rx, store, stop.clone()));
        Arc::new(Self {
            tx,
            stop,
            drain: Mutex::new(Some(drain)),
            dropped: AtomicU64::new(0),
        })
    }

    /// Number of entries dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the drain task after flushing every queued entry.
    ///
    /// Entries enqueued afterwards are dropped. Calling it twice is a no-op.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = self.drain.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("run-log drain task failed: {e}");
            }
        }
    }
}

impl RunLogSink for ChannelRunLogSink {
    fn enqueue_log(&self, entry: RunLogEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(run_id = %entry.run_id, key = %entry.key, "run-log buffer full, entry dropped");
            }
            Err(TrySendError::Closed(entry)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(run_id = %entry.run_id, key = %entry.key, "run-log sink closed, entry dropped");
            }
        }
    }
}

impl Drop for ChannelRunLogSink {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn drain(
    mut rx: mpsc::Receiver<RunLogEntry>,
    store: Arc<dyn RunLogStore>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            entry = rx.recv() => match entry {
                Some(entry) => {
                    let mut batch = vec![entry];
                    while batch.len() < DRAIN_BATCH {
                        match rx.try_recv() {
                            Ok(entry) => batch.push(entry),
                            Err(_) => break,
                        }
                    }
                    write(store.as_ref(), batch).await;
                }
                None => break,
            },
            _ = stop.cancelled() => {
                rx.close();
                let mut rest = Vec::new();
                while let Ok(entry) = rx.try_recv() {
                    rest.push(entry);
                }
                if !rest.is_empty() {
                    write(store.as_ref(), rest).await;
                }
                break;
            }
        }
    }
    debug!("run-log drain stopped");
}

async fn write(store: &dyn RunLogStore, batch: Vec<RunLogEntry>) {
    let count = batch.len();
    if let Err(e) = store.write(batch).await {
        warn!(count, "failed to write run-log entries: {e}");
    }
}
