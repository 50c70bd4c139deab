//! Bounded, duplicate-suppressing work queue shared by the watcher (producer)
//! and the sequential worker (single consumer).
//!
//! All mutation goes through one mutex. Overflow never drops a file: the
//! caller is told to park it and the `moved_back` counter records the event.

pub mod worker;

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{QUEUE_SIZE_CEILING, QueueConfig};

/// Lifecycle of a queued capture file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for the worker.
    Pending,
    /// Claimed by the worker.
    Processing,
    /// Processed successfully.
    Done,
    /// Processing failed.
    Error,
}

/// A capture file admitted to the queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Time-ordered identifier.
    pub id: Uuid,
    /// Path of the capture file.
    pub path: PathBuf,
    /// When the entry was admitted.
    pub enqueued_at: DateTime<Utc>,
    /// Where the entry is in its lifecycle.
    pub status: EntryStatus,
}

impl QueueEntry {
    fn new(path: PathBuf) -> Self {
        Self {
            id: Uuid::now_v7(),
            path,
            enqueued_at: Utc::now(),
            status: EntryStatus::Pending,
        }
    }

    /// File name for log output.
    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }
}

/// Why `try_enqueue` refused a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Path is already pending or being processed.
    Duplicate,
    /// Queue is at capacity; the caller must park the file for later.
    Overflow { capacity: usize },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Duplicate => f.write_str("already queued"),
            RejectReason::Overflow { capacity } => {
                write!(f, "queue full ({capacity} files)")
            }
        }
    }
}

/// Result of [`BoundedWorkQueue::try_enqueue`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Admitted; `size` is the queue size afterwards.
    Enqueued { id: Uuid, size: usize },
    /// Refused.
    Rejected(RejectReason),
}

impl EnqueueOutcome {
    /// Whether the path was admitted.
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued { .. })
    }
}

/// Result reported by the worker once the callback returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The processor returned success.
    Processed,
    /// The processor failed or panicked.
    Failed(String),
}

/// Point-in-time view of the queue for status reporting.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending plus processing entries.
    pub size: usize,
    /// Effective capacity.
    pub capacity: usize,
    /// Files processed successfully.
    pub processed: u64,
    /// Files whose processing failed.
    pub errored: u64,
    /// Files parked because the queue was full.
    pub moved_back: u64,
    /// Name of the file being processed.
    pub in_flight: Option<String>,
}

impl QueueStats {
    /// Share of finished files that succeeded, in percent.
    pub fn success_rate(&self) -> f64 {
        let finished = self.processed + self.errored;
        if finished == 0 {
            return 100.0;
        }
        self.processed as f64 * 100.0 / finished as f64
    }

    /// Fill level in percent.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.size as f64 * 100.0 / self.capacity as f64
    }

    /// Whether another file would be admitted.
    pub fn has_room(&self) -> bool {
        self.size < self.capacity
    }

    /// Multi-line summary emitted on shutdown.
    pub fn summary(&self) -> String {
        let in_flight = self.in_flight.as_deref().unwrap_or("none");
        [
            format!("files processed: {}", self.processed),
            format!("processing errors: {}", self.errored),
            format!(
                "queue size: {}/{} ({:.1}%)",
                self.size,
                self.capacity,
                self.utilization()
            ),
            format!("files moved back: {}", self.moved_back),
            format!("currently processing: {in_flight}"),
        ]
        .join("\n")
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    processed: u64,
    errored: u64,
    moved_back: u64,
}

impl QueueState {
    fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|entry| entry.path == path)
    }

    fn in_flight(&self) -> Option<&QueueEntry> {
        self.entries
            .iter()
            .find(|entry| entry.status == EntryStatus::Processing)
    }
}

/// Capacity-bounded FIFO of capture paths awaiting processing.
pub struct BoundedWorkQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    available: Notify,
    idle: Notify,
}

impl fmt::Debug for BoundedWorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("BoundedWorkQueue");
        debug.field("capacity", &self.capacity);
        match self.state.try_lock() {
            Ok(state) => {
                debug.field("size", &state.entries.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl BoundedWorkQueue {
    /// Build a queue holding at most `max_size` entries, clamped to
    /// `[1, QUEUE_SIZE_CEILING]`.
    pub fn new(max_size: usize) -> Self {
        let capacity = max_size.clamp(1, QUEUE_SIZE_CEILING);
        if capacity != max_size {
            warn!(
                target: "macwatch::queue",
                requested = max_size,
                capacity,
                "queue size clamped"
            );
        }
        if capacity == QUEUE_SIZE_CEILING {
            info!(
                target: "macwatch::queue",
                capacity,
                "queue at maximum capacity, excess files will be moved back"
            );
        }

        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            idle: Notify::new(),
        }
    }

    /// Queue sized from the queue settings.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_size)
    }

    /// Effective capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit `path` unless it is already queued or the queue is full. Entries
    /// in `processing` count toward capacity.
    pub async fn try_enqueue(&self, path: impl Into<PathBuf>) -> EnqueueOutcome {
        let path = path.into();
        let mut state = self.state.lock().await;

        if state.contains(&path) {
            debug!(
                target: "macwatch::queue",
                path = %path.display(),
                "duplicate enqueue suppressed"
            );
            return EnqueueOutcome::Rejected(RejectReason::Duplicate);
        }

        if state.entries.len() >= self.capacity {
            warn!(
                target: "macwatch::queue",
                file = %display_name(&path),
                capacity = self.capacity,
                "queue full"
            );
            return EnqueueOutcome::Rejected(RejectReason::Overflow {
                capacity: self.capacity,
            });
        }

        let entry = QueueEntry::new(path);
        let id = entry.id;
        info!(
            target: "macwatch::queue",
            file = %entry.file_name(),
            size = state.entries.len() + 1,
            "added file to queue"
        );
        state.entries.push_back(entry);
        let size = state.entries.len();
        drop(state);

        self.available.notify_one();
        EnqueueOutcome::Enqueued { id, size }
    }

    /// Wait for the next pending entry and mark it `processing`.
    ///
    /// Only one entry can be in `processing` at a time: while one is
    /// outstanding this call keeps waiting. Returns `None` once `shutdown`
    /// fires.
    pub async fn dequeue_blocking(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<QueueEntry> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            {
                let mut state = self.state.lock().await;
                if state.in_flight().is_none()
                    && let Some(entry) = state
                        .entries
                        .iter_mut()
                        .find(|entry| entry.status == EntryStatus::Pending)
                {
                    entry.status = EntryStatus::Processing;
                    return Some(entry.clone());
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = self.available.notified() => {}
            }
        }
    }

    /// Record the outcome for `entry` and remove it from the queue.
    pub async fn mark_done(&self, entry: &QueueEntry, outcome: ProcessOutcome) {
        let mut state = self.state.lock().await;
        let Some(index) =
            state.entries.iter().position(|queued| queued.id == entry.id)
        else {
            warn!(
                target: "macwatch::queue",
                file = %entry.file_name(),
                "mark_done for an entry that is not queued"
            );
            return;
        };

        if let Some(mut finished) = state.entries.remove(index) {
            match outcome {
                ProcessOutcome::Processed => {
                    finished.status = EntryStatus::Done;
                    state.processed += 1;
                }
                ProcessOutcome::Failed(_) => {
                    finished.status = EntryStatus::Error;
                    state.errored += 1;
                }
            }
        }
        let empty = state.entries.is_empty();
        drop(state);

        // A pending entry may have been waiting behind the finished one.
        self.available.notify_one();
        if empty {
            self.idle.notify_waiters();
        }
    }

    /// Count a file relocated to the holding area because of overflow.
    pub async fn record_moved_back(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.moved_back += 1;
        state.moved_back
    }

    /// Consistent view of size and counters.
    pub async fn snapshot(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            size: state.entries.len(),
            capacity: self.capacity,
            processed: state.processed,
            errored: state.errored,
            moved_back: state.moved_back,
            in_flight: state.in_flight().map(QueueEntry::file_name),
        }
    }

    /// Whether `path` is pending or processing.
    pub async fn contains(&self, path: &Path) -> bool {
        self.state.lock().await.contains(path)
    }

    /// Wait until the queue has drained, up to `timeout`. Returns whether it
    /// is empty.
    pub async fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        let wait = async {
            loop {
                let idle = self.idle.notified();
                if self.state.lock().await.entries.is_empty() {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn duplicate_paths_are_suppressed() {
        let queue = BoundedWorkQueue::new(5);

        assert!(queue.try_enqueue("/captures/a.kismet").await.is_enqueued());
        assert_eq!(
            queue.try_enqueue("/captures/a.kismet").await,
            EnqueueOutcome::Rejected(RejectReason::Duplicate)
        );
        assert_eq!(queue.snapshot().await.size, 1);
    }

    #[tokio::test]
    async fn processing_entry_still_counts_as_duplicate() {
        let queue = BoundedWorkQueue::new(5);
        let token = CancellationToken::new();
        queue.try_enqueue("/captures/a.kismet").await;

        let entry = queue.dequeue_blocking(&token).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Processing);
        assert_eq!(
            queue.try_enqueue("/captures/a.kismet").await,
            EnqueueOutcome::Rejected(RejectReason::Duplicate)
        );

        queue.mark_done(&entry, ProcessOutcome::Processed).await;
        assert!(queue.try_enqueue("/captures/a.kismet").await.is_enqueued());
    }

    #[tokio::test]
    async fn third_file_overflows_when_capacity_is_two() {
        let queue = BoundedWorkQueue::new(2);

        assert!(queue.try_enqueue("/captures/1.kismet").await.is_enqueued());
        assert!(queue.try_enqueue("/captures/2.kismet").await.is_enqueued());
        assert_eq!(
            queue.try_enqueue("/captures/3.kismet").await,
            EnqueueOutcome::Rejected(RejectReason::Overflow { capacity: 2 })
        );
        assert_eq!(queue.snapshot().await.size, 2);
    }

    #[tokio::test]
    async fn capacity_is_clamped() {
        assert_eq!(BoundedWorkQueue::new(1_000).capacity(), QUEUE_SIZE_CEILING);
        assert_eq!(BoundedWorkQueue::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn only_one_entry_is_processing_at_a_time() {
        let queue = Arc::new(BoundedWorkQueue::new(3));
        let token = CancellationToken::new();
        queue.try_enqueue("/captures/1.kismet").await;
        queue.try_enqueue("/captures/2.kismet").await;

        let first = queue.dequeue_blocking(&token).await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue_blocking(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second dequeue must wait");

        queue
            .mark_done(&first, ProcessOutcome::Failed("boom".into()))
            .await;
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.path, PathBuf::from("/captures/2.kismet"));

        let stats = queue.snapshot().await;
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.in_flight.as_deref(), Some("2.kismet"));
    }

    #[tokio::test]
    async fn dequeue_returns_none_on_shutdown() {
        let queue = Arc::new(BoundedWorkQueue::new(3));
        let token = CancellationToken::new();

        let waiter = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue_blocking(&token).await })
        };
        token.cancel();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = Arc::new(BoundedWorkQueue::new(3));
        let token = CancellationToken::new();

        let waiter = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue_blocking(&token).await })
        };
        tokio::task::yield_now().await;
        queue.try_enqueue("/captures/late.kismet").await;

        let entry = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.file_name(), "late.kismet");
    }

    #[tokio::test]
    async fn stats_track_outcomes_and_moves() {
        let queue = BoundedWorkQueue::new(4);
        let token = CancellationToken::new();
        queue.try_enqueue("/captures/ok.kismet").await;
        queue.try_enqueue("/captures/bad.kismet").await;

        let ok = queue.dequeue_blocking(&token).await.unwrap();
        queue.mark_done(&ok, ProcessOutcome::Processed).await;
        let bad = queue.dequeue_blocking(&token).await.unwrap();
        queue
            .mark_done(&bad, ProcessOutcome::Failed("corrupt".into()))
            .await;
        queue.record_moved_back().await;

        let stats = queue.snapshot().await;
        assert_eq!(stats.size, 0);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.moved_back, 1);
        assert!(stats.in_flight.is_none());
        assert!((stats.success_rate() - 50.0).abs() < f64::EPSILON);
        assert!(queue.wait_idle(Duration::from_millis(10)).await);
    }
}
