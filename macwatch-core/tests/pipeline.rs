use async_trait::async_trait;
use macwatch_core::{
    FileProcessor, IngestPipeline, PipelineConfig, QueueConfig, Result,
    StabilityConfig, WatchConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Mutex, Notify, Semaphore};

/// Holds every file until a permit is released, then deletes it the way the
/// real processor moves captures out of the root.
struct GatedProcessor {
    gate: Semaphore,
    done: Mutex<Vec<PathBuf>>,
}

impl GatedProcessor {
    fn closed() -> Self {
        Self {
            gate: Semaphore::new(0),
            done: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FileProcessor for GatedProcessor {
    async fn process(&self, path: &Path) -> Result<()> {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        tokio::fs::remove_file(path).await?;
        self.done.lock().await.push(path.to_path_buf());
        Ok(())
    }
}

fn config(root: &Path, capacity: usize) -> PipelineConfig {
    PipelineConfig {
        watch: WatchConfig {
            root: root.to_path_buf(),
            rescan_interval_ms: 100,
            ..Default::default()
        },
        stability: StabilityConfig {
            sample_interval_ms: 20,
            required_stable_samples: 3,
            max_wait_ms: 5_000,
            accessibility_timeout_ms: 1_000,
        },
        queue: QueueConfig {
            max_size: capacity,
            summary_every: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn wait_for<F>(pipeline: &IngestPipeline, mut done: F) -> bool
where
    F: FnMut(&macwatch_core::QueueStats) -> bool,
{
    for _ in 0..250 {
        if done(&pipeline.stats().await) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn dropped_capture_flows_through_queue() {
    let dir = TempDir::new().unwrap();
    let processor = Arc::new(GatedProcessor::closed());
    let pipeline =
        IngestPipeline::start(&config(dir.path(), 5), processor.clone())
            .await
            .unwrap();
    assert_eq!(pipeline.stats().await.size, 0);

    std::fs::write(dir.path().join("drive.kismet"), b"SQLite format 3\0")
        .unwrap();

    assert!(wait_for(&pipeline, |stats| stats.size == 1).await);
    assert_eq!(
        pipeline.stats().await.in_flight.as_deref(),
        Some("drive.kismet")
    );

    processor.gate.add_permits(1);
    assert!(
        wait_for(&pipeline, |stats| stats.size == 0 && stats.processed == 1)
            .await
    );

    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.errored, 0);
    assert_eq!(processor.done.lock().await.len(), 1);
}

#[tokio::test]
async fn overflow_delays_but_never_loses_files() {
    let dir = TempDir::new().unwrap();
    let processor = Arc::new(GatedProcessor::closed());
    let pipeline =
        IngestPipeline::start(&config(dir.path(), 2), processor.clone())
            .await
            .unwrap();

    for name in ["1.kismet", "2.kismet", "3.kismet"] {
        std::fs::write(dir.path().join(name), b"SQLite format 3\0").unwrap();
    }

    assert!(
        wait_for(&pipeline, |stats| stats.size == 2 && stats.moved_back == 1)
            .await
    );
    let held = std::fs::read_dir(dir.path().join(".overflow"))
        .unwrap()
        .count();
    assert_eq!(held, 1);

    processor.gate.add_permits(3);
    assert!(wait_for(&pipeline, |stats| stats.processed == 3).await);

    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.moved_back, 1);
    assert_eq!(processor.done.lock().await.len(), 3);
}

#[tokio::test]
async fn missing_root_is_fatal() {
    let dir = TempDir::new().unwrap();
    let processor = Arc::new(GatedProcessor::closed());
    let err = IngestPipeline::start(
        &config(&dir.path().join("absent"), 5),
        processor,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, macwatch_core::IngestError::WatchRoot { .. }));
}

#[tokio::test]
async fn shutdown_with_idle_queue_is_prompt() {
    let dir = TempDir::new().unwrap();
    let processor = Arc::new(GatedProcessor::closed());
    let pipeline = IngestPipeline::start(&config(dir.path(), 5), processor)
        .await
        .unwrap();

    assert!(pipeline.wait_idle(Duration::from_millis(50)).await);
    let stats = tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.processed, 0);
}

/// Takes a minute per file.
struct SlowProcessor {
    started: Notify,
    finished: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl FileProcessor for SlowProcessor {
    async fn process(&self, path: &Path) -> Result<()> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(60)).await;
        self.finished.lock().await.push(path.to_path_buf());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_a_slow_file() {
    let dir = TempDir::new().unwrap();
    let processor = Arc::new(SlowProcessor {
        started: Notify::new(),
        finished: Mutex::new(Vec::new()),
    });
    let pipeline =
        IngestPipeline::start(&config(dir.path(), 5), processor.clone())
            .await
            .unwrap();

    let capture = dir.path().join("long.kismet");
    assert!(matches!(
        pipeline.queue().try_enqueue(capture.clone()).await,
        macwatch_core::EnqueueOutcome::Enqueued { .. }
    ));
    processor.started.notified().await;

    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(*processor.finished.lock().await, vec![capture]);
}
