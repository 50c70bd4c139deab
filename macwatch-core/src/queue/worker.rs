//! The single consumer draining the work queue.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{BoundedWorkQueue, ProcessOutcome, QueueEntry, QueueStats};
use crate::error::Result;

/// Per-file processing collaborator driven by [`SequentialWorker`].
///
/// Implementations own everything that happens to a capture file once it is
/// claimed, including moving it out of the watch root so it is not seen
/// again.
#[async_trait]
pub trait FileProcessor: Send + Sync {
    /// Handle one capture file. Errors are counted, never fatal.
    async fn process(&self, path: &Path) -> Result<()>;

    /// Whether `path` was already handled in an earlier run. The watcher
    /// skips such files.
    async fn is_processed(&self, _path: &Path) -> bool {
        false
    }
}

/// Single consumer that drains the queue strictly one file at a time.
pub struct SequentialWorker {
    queue: Arc<BoundedWorkQueue>,
    processor: Arc<dyn FileProcessor>,
    summary_every: u64,
}

impl fmt::Debug for SequentialWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialWorker")
            .field("queue", &self.queue)
            .field("summary_every", &self.summary_every)
            .finish()
    }
}

impl SequentialWorker {
    /// Worker draining `queue` into `processor`, logging a summary every
    /// `summary_every` files.
    pub fn new(
        queue: Arc<BoundedWorkQueue>,
        processor: Arc<dyn FileProcessor>,
        summary_every: u64,
    ) -> Self {
        Self {
            queue,
            processor,
            summary_every: summary_every.max(1),
        }
    }

    /// Run until `shutdown` fires. A file already being processed is always
    /// finished before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) -> QueueStats {
        info!(target: "macwatch::worker", "worker started");
        let mut completed: u64 = 0;

        while let Some(entry) = self.queue.dequeue_blocking(&shutdown).await {
            let outcome = self.process_entry(&entry).await;
            self.queue.mark_done(&entry, outcome).await;

            completed += 1;
            if completed % self.summary_every == 0 {
                self.log_summary().await;
            }
        }

        let stats = self.queue.snapshot().await;
        info!(
            target: "macwatch::worker",
            processed = stats.processed,
            errors = stats.errored,
            "worker stopped"
        );
        stats
    }

    /// Invoke the processor for one entry. Errors and panics are both
    /// classified as a failed file.
    async fn process_entry(&self, entry: &QueueEntry) -> ProcessOutcome {
        let file = entry.file_name();
        info!(target: "macwatch::worker", file = %file, "processing file");
        let started = Instant::now();

        let processor = Arc::clone(&self.processor);
        let path = entry.path.clone();
        let handle =
            tokio::spawn(async move { processor.process(&path).await });

        match handle.await {
            Ok(Ok(())) => {
                info!(
                    target: "macwatch::worker",
                    file = %file,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "file processed"
                );
                ProcessOutcome::Processed
            }
            Ok(Err(err)) => {
                error!(
                    target: "macwatch::worker",
                    file = %file,
                    error = %err,
                    "processing failed"
                );
                ProcessOutcome::Failed(err.to_string())
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    "processor panicked".to_string()
                } else {
                    join_err.to_string()
                };
                error!(
                    target: "macwatch::worker",
                    file = %file,
                    error = %message,
                    "processing aborted"
                );
                ProcessOutcome::Failed(message)
            }
        }
    }

    async fn log_summary(&self) {
        let stats = self.queue.snapshot().await;
        if !stats.has_room() {
            warn!(
                target: "macwatch::worker",
                size = stats.size,
                capacity = stats.capacity,
                "queue saturated"
            );
        }
        info!(
            target: "macwatch::worker",
            size = stats.size,
            capacity = stats.capacity,
            in_flight = stats.in_flight.as_deref().unwrap_or("none"),
            processed = stats.processed,
            errors = stats.errored,
            success_rate = format_args!("{:.1}%", stats.success_rate()),
            "processing summary"
        );
    }
}
