//! File completeness detection.
//!
//! Capture tools write their output incrementally, so a creation event only
//! tells us a file exists. [`StabilityMonitor`] samples size and modification
//! time until they stop moving for a configured streak, and
//! [`StabilityMonitor::is_accessible`] confirms the file can actually be
//! opened before it is handed to the queue.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Pause between open attempts in [`StabilityMonitor::is_accessible`].
const ACCESS_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A single observation of a file's size and modification time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileSample {
    /// Size in bytes.
    pub len: u64,
    /// Modification time, when the platform reports one.
    pub modified: Option<SystemTime>,
}

/// Source of file observations. The filesystem implementation is the default;
/// tests substitute scripted probes.
pub trait FileProbe: Send + Sync {
    /// Current size and modification time of `path`.
    fn sample(&self, path: &Path) -> io::Result<FileSample>;

    /// Open the file for reading and pull at least one byte through it.
    fn open_for_read(&self, path: &Path) -> io::Result<()>;
}

/// Probe backed by `std::fs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsProbe;

impl FileProbe for FsProbe {
    fn sample(&self, path: &Path) -> io::Result<FileSample> {
        let meta = std::fs::metadata(path)?;
        Ok(FileSample {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    fn open_for_read(&self, path: &Path) -> io::Result<()> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; 1];
        let _read = file.read(&mut buf)?;
        Ok(())
    }
}

/// Decides whether a freshly observed file has finished being written.
pub struct StabilityMonitor<P: FileProbe = FsProbe> {
    probe: Arc<P>,
}

impl<P: FileProbe> Clone for StabilityMonitor<P> {
    fn clone(&self) -> Self {
        Self {
            probe: Arc::clone(&self.probe),
        }
    }
}

impl<P: FileProbe> fmt::Debug for StabilityMonitor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StabilityMonitor")
            .field("probe_type", &std::any::type_name::<P>())
            .finish()
    }
}

impl Default for StabilityMonitor<FsProbe> {
    fn default() -> Self {
        Self::new(FsProbe)
    }
}

impl<P: FileProbe> StabilityMonitor<P> {
    /// Monitor observing files through `probe`.
    pub fn new(probe: P) -> Self {
        Self {
            probe: Arc::new(probe),
        }
    }

    /// Sample `path` every `sample_interval` until size and modification time
    /// have been unchanged for `required_stable_samples` consecutive samples.
    ///
    /// Returns `false` as soon as the file disappears, or once `max_wait` has
    /// elapsed without completing the streak. Other stat errors count as an
    /// unstable sample and are retried until the deadline.
    pub async fn wait_for_stability(
        &self,
        path: &Path,
        sample_interval: Duration,
        required_stable_samples: u32,
        max_wait: Duration,
    ) -> bool {
        let required = required_stable_samples.max(1);
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut previous: Option<FileSample> = None;
        let mut streak = 0u32;

        debug!(
            target: "macwatch::watch",
            path = %path.display(),
            required,
            interval_ms = sample_interval.as_millis() as u64,
            "starting stability check"
        );

        loop {
            match self.probe.sample(path) {
                Ok(sample) if previous == Some(sample) => {
                    streak += 1;
                    debug!(
                        target: "macwatch::watch",
                        path = %path.display(),
                        streak,
                        required,
                        len = sample.len,
                        "stable sample"
                    );
                }
                Ok(sample) => {
                    streak = 0;
                    previous = Some(sample);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!(
                        target: "macwatch::watch",
                        path = %path.display(),
                        "file disappeared during stability check"
                    );
                    return false;
                }
                Err(err) => {
                    debug!(
                        target: "macwatch::watch",
                        path = %path.display(),
                        error = %err,
                        "stat failed, treating sample as unstable"
                    );
                    streak = 0;
                    previous = None;
                }
            }

            if streak >= required {
                info!(
                    target: "macwatch::watch",
                    path = %path.display(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "file is stable"
                );
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    target: "macwatch::watch",
                    path = %path.display(),
                    max_wait_ms = max_wait.as_millis() as u64,
                    "stability check timed out"
                );
                return false;
            }

            sleep_until((now + sample_interval).min(deadline)).await;
        }
    }

    /// Try to open `path` for reading until it succeeds or `timeout` passes.
    pub async fn is_accessible(&self, path: &Path, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            match self.probe.open_for_read(path) {
                Ok(()) => return true,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(
                        target: "macwatch::watch",
                        path = %path.display(),
                        "file vanished before it became accessible"
                    );
                    return false;
                }
                Err(err) => {
                    debug!(
                        target: "macwatch::watch",
                        path = %path.display(),
                        error = %err,
                        "file not accessible yet"
                    );
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    target: "macwatch::watch",
                    path = %path.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "file did not become accessible in time"
                );
                return false;
            }

            sleep_until((now + ACCESS_RETRY_INTERVAL).min(deadline)).await;
        }
    }
}
