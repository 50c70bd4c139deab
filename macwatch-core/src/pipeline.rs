//! Supervisor wiring the watcher, queue and worker together.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::queue::worker::{FileProcessor, SequentialWorker};
use crate::queue::{BoundedWorkQueue, QueueStats};
use crate::watch::{
    DirectoryWatcher, FileProbe, FsProbe, StabilityMonitor, WatchEvent,
    validate_root,
};

/// How long `shutdown` waits for the watcher loop to stop.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Running watcher and worker pair sharing one queue.
pub struct IngestPipeline {
    queue: Arc<BoundedWorkQueue>,
    events: mpsc::Sender<WatchEvent>,
    shutdown: CancellationToken,
    watcher_task: JoinHandle<Result<()>>,
    worker_task: JoinHandle<QueueStats>,
    worker_grace: Duration,
    #[cfg(feature = "fs-watch")]
    native: Option<notify::RecommendedWatcher>,
}

impl fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("queue", &self.queue)
            .field("cancelled", &self.shutdown.is_cancelled())
            .field("watcher_finished", &self.watcher_task.is_finished())
            .field("worker_finished", &self.worker_task.is_finished())
            .finish()
    }
}

impl IngestPipeline {
    /// Validate the watch root and spawn the watcher and worker tasks.
    ///
    /// Fails only when the watch root is unusable.
    pub async fn start(
        config: &PipelineConfig,
        processor: Arc<dyn FileProcessor>,
    ) -> Result<Self> {
        let monitor = StabilityMonitor::<FsProbe>::default();
        Self::start_with_monitor(config, processor, monitor).await
    }

    /// Like [`IngestPipeline::start`] with a custom stability monitor.
    pub async fn start_with_monitor<P: FileProbe + 'static>(
        config: &PipelineConfig,
        processor: Arc<dyn FileProcessor>,
        monitor: StabilityMonitor<P>,
    ) -> Result<Self> {
        validate_root(&config.watch.root)?;
        let mut watch = config.watch.clone();
        watch.root = tokio::fs::canonicalize(&watch.root).await.map_err(
            |err| IngestError::WatchRoot {
                path: config.watch.root.clone(),
                reason: err.to_string(),
            },
        )?;

        let queue = Arc::new(BoundedWorkQueue::from_config(&config.queue));
        let shutdown = CancellationToken::new();
        let (events, rx) =
            mpsc::channel(config.watch.event_channel_capacity.max(1));

        #[cfg(feature = "fs-watch")]
        let native = match crate::watch::subscribe(&watch.root, events.clone())
        {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(
                    target: "macwatch::watch",
                    root = %watch.root.display(),
                    error = %err,
                    "native notifications unavailable, relying on rescans"
                );
                None
            }
        };

        let root = watch.root.clone();
        let watcher = DirectoryWatcher::with_monitor(
            watch,
            config.stability,
            monitor,
            Arc::clone(&queue),
            Arc::clone(&processor),
        );
        let watcher_task = tokio::spawn(watcher.run(rx, shutdown.clone()));

        let worker = SequentialWorker::new(
            Arc::clone(&queue),
            processor,
            config.queue.summary_every,
        );
        let worker_task = tokio::spawn(worker.run(shutdown.clone()));

        info!(
            root = %root.display(),
            capacity = queue.capacity(),
            "ingest pipeline started"
        );

        Ok(Self {
            queue,
            events,
            shutdown,
            watcher_task,
            worker_task,
            worker_grace: config.queue.shutdown_grace(),
            #[cfg(feature = "fs-watch")]
            native,
        })
    }

    /// Shared work queue.
    pub fn queue(&self) -> &Arc<BoundedWorkQueue> {
        &self.queue
    }

    /// Sender for injecting events into the watcher loop.
    pub fn events(&self) -> mpsc::Sender<WatchEvent> {
        self.events.clone()
    }

    /// Token cancelled when the pipeline stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queue counters.
    pub async fn stats(&self) -> QueueStats {
        self.queue.snapshot().await
    }

    /// Wait until nothing is pending or processing.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout).await
    }

    /// Stop watching, let the worker finish its current file and return the
    /// final statistics.
    pub async fn shutdown(self) -> Result<QueueStats> {
        info!("shutting down ingest pipeline");
        self.shutdown.cancel();
        #[cfg(feature = "fs-watch")]
        drop(self.native);

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.watcher_task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(err)) => {
                warn!(error = %err, "watcher task ended abnormally");
            }
            Err(_) => warn!("watcher did not stop in time"),
        }

        let stats = match tokio::time::timeout(
            self.worker_grace,
            self.worker_task,
        )
        .await
        {
            Ok(Ok(stats)) => stats,
            Ok(Err(err)) => {
                return Err(IngestError::Internal(format!(
                    "worker task ended abnormally: {err}"
                )));
            }
            Err(_) => {
                warn!(
                    grace_secs = self.worker_grace.as_secs(),
                    "worker did not finish its current file in time"
                );
                self.queue.snapshot().await
            }
        };

        info!("processing summary\n{}", stats.summary());
        Ok(stats)
    }
}
