//! Pipeline settings. Every section defaults so partial files load.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Absolute upper bound on queued capture files, regardless of configuration.
pub const QUEUE_SIZE_CEILING: usize = 30;

/// Longest negative-cache lifetime honoured, in days.
pub const NEGATIVE_TTL_MAX_DAYS: u64 = 3_650;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Global knobs for the ingestion pipeline.
///
/// All fields carry defaults so a deployment only needs to supply the values
/// it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Watch root, extension filter and rescan cadence.
    pub watch: WatchConfig,
    /// File completeness detection.
    pub stability: StabilityConfig,
    /// Work queue sizing and worker reporting.
    pub queue: QueueConfig,
    /// Vendor lookup pacing, retry and circuit breaker policy.
    pub lookup: LookupConfig,
    /// Where processed captures and reports end up.
    pub output: OutputConfig,
}

/// Where and how often to look for capture files.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directory monitored (non-recursively) for new capture files.
    pub root: PathBuf,
    /// Extension (without the dot) a file must carry to be considered.
    pub extension: String,
    /// Cadence of the periodic rescan of the root and the holding area.
    pub rescan_interval_ms: u64,
    /// Overflowed files are parked here until the queue has room again.
    /// Defaults to `<root>/.overflow`.
    pub holding_dir: Option<PathBuf>,
    /// Capacity of the channel between the notify callback and the watcher.
    pub event_channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            extension: "kismet".to_string(),
            rescan_interval_ms: 300_000,
            holding_dir: None,
            event_channel_capacity: 1024,
        }
    }
}

impl WatchConfig {
    /// Never zero.
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms.max(1))
    }

    /// Configured holding directory, or `<root>/.overflow`.
    pub fn holding_dir(&self) -> PathBuf {
        self.holding_dir
            .clone()
            .unwrap_or_else(|| self.root.join(".overflow"))
    }

    /// Case-insensitive extension match.
    pub fn matches_extension(&self, path: &std::path::Path) -> bool {
        let wanted = self.extension.trim_start_matches('.');
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
    }
}

/// Sampling policy used to decide a file is fully written.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Gap between size/mtime samples.
    pub sample_interval_ms: u64,
    /// Consecutive unchanged samples needed before a file counts as complete.
    pub required_stable_samples: u32,
    /// Give up on a file that has not settled after this long.
    pub max_wait_ms: u64,
    /// How long to keep retrying the open-for-read check.
    pub accessibility_timeout_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            required_stable_samples: 5,
            max_wait_ms: 300_000,
            accessibility_timeout_ms: 30_000,
        }
    }
}

impl StabilityConfig {
    /// Never zero.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    /// Stability deadline.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Open-for-read retry budget.
    pub fn accessibility_timeout(&self) -> Duration {
        Duration::from_millis(self.accessibility_timeout_ms)
    }
}

/// Work queue sizing and worker reporting.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Requested capacity; clamped to `[1, QUEUE_SIZE_CEILING]`.
    pub max_size: usize,
    /// Log a processing summary every N completed files.
    pub summary_every: u64,
    /// How long shutdown waits for the worker to finish the file it is on.
    pub shutdown_grace_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 20,
            summary_every: 5,
            shutdown_grace_ms: 600_000,
        }
    }
}

impl QueueConfig {
    /// Capacity actually used by the queue.
    pub fn effective_capacity(&self) -> usize {
        self.max_size.clamp(1, QUEUE_SIZE_CEILING)
    }

    /// Worker join timeout on shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Vendor lookup pacing, retry and circuit breaker policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Base URL of the vendor lookup service.
    pub base_url: String,
    /// Bearer token. When present the JSON `v1/lookup` endpoint is used.
    pub api_key: Option<String>,
    /// Floor for the spacing between requests.
    pub min_interval_ms: u64,
    /// Ceiling the spacing may grow to under rate limiting.
    pub max_interval_ms: u64,
    /// Multiplier applied to the interval after a successful call.
    pub decrease_factor: f64,
    /// Per-request timeout; expiry counts as a network failure.
    pub request_timeout_ms: u64,
    /// Immediate attempts for transient (5xx / network) failures.
    pub transient_max_attempts: u32,
    /// First transient retry delay, doubled per attempt.
    pub backoff_base_ms: u64,
    /// Cap on the transient retry delay.
    pub backoff_max_ms: u64,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit stays open.
    pub cooldown_ms: u64,
    /// Lifetime of a not-found result.
    pub negative_ttl_days: u64,
    /// Rate-limited keys kept for a later replay.
    pub retry_queue_capacity: usize,
    /// Deferred replays per key before it is given up for this run.
    pub retry_max_attempts: u32,
    /// Keys resolved per batch.
    pub batch_size: usize,
    /// Concurrent requests within a batch.
    pub batch_parallelism: usize,
    /// Deadline for a whole batch.
    pub batch_timeout_ms: u64,
    /// Known-good key used to calibrate the starting interval.
    pub probe_key: Option<String>,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.macvendors.com".to_string(),
            api_key: None,
            min_interval_ms: 3_000,
            max_interval_ms: 60_000,
            decrease_factor: 0.8,
            request_timeout_ms: 20_000,
            transient_max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
            failure_threshold: 10,
            cooldown_ms: 300_000,
            negative_ttl_days: 180,
            retry_queue_capacity: 50,
            retry_max_attempts: 3,
            batch_size: 32,
            batch_parallelism: 4,
            batch_timeout_ms: 120_000,
            probe_key: None,
        }
    }
}

impl LookupConfig {
    /// Request spacing floor.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Never below the minimum.
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.min_interval_ms))
    }

    /// Per-request timeout, never zero.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    /// First transient retry delay.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Transient retry delay cap.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Open-circuit duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Capped at [`NEGATIVE_TTL_MAX_DAYS`].
    pub fn negative_ttl(&self) -> Duration {
        let days = self.negative_ttl_days.min(NEGATIVE_TTL_MAX_DAYS);
        Duration::from_secs(days.saturating_mul(SECS_PER_DAY))
    }

    /// Batch deadline, never zero.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms.max(1))
    }

    /// Parallelism never exceeds the number of CPUs.
    pub fn effective_parallelism(&self) -> usize {
        self.batch_parallelism.clamp(1, num_cpus::get().max(1))
    }
}

/// Destinations for reports and finished captures.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// Captures that were enriched successfully are moved here.
    pub processed_dir: Option<PathBuf>,
    /// Captures whose processing failed are moved here.
    pub failed_dir: Option<PathBuf>,
    /// Vendor reports are written here. Defaults to the watch root.
    pub report_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn queue_capacity_is_clamped_to_ceiling() {
        let cfg = QueueConfig {
            max_size: 500,
            ..Default::default()
        };
        assert_eq!(cfg.effective_capacity(), QUEUE_SIZE_CEILING);

        let cfg = QueueConfig {
            max_size: 0,
            ..Default::default()
        };
        assert_eq!(cfg.effective_capacity(), 1);
    }

    #[test]
    fn extension_match_ignores_case_and_leading_dot() {
        let cfg = WatchConfig {
            extension: ".Kismet".to_string(),
            ..Default::default()
        };
        assert!(cfg.matches_extension(Path::new("/tmp/a.KISMET")));
        assert!(cfg.matches_extension(Path::new("b.kismet")));
        assert!(!cfg.matches_extension(Path::new("b.kismet-journal")));
        assert!(!cfg.matches_extension(Path::new("kismet")));
    }

    #[test]
    fn partial_payload_keeps_defaults() {
        let raw = r#"{"queue": {"max_size": 4}, "lookup": {"failure_threshold": 2}}"#;
        let cfg: PipelineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.queue.max_size, 4);
        assert_eq!(cfg.queue.summary_every, 5);
        assert_eq!(cfg.lookup.failure_threshold, 2);
        assert_eq!(cfg.lookup.min_interval_ms, 3_000);
        assert_eq!(cfg.watch.extension, "kismet");
    }

    #[test]
    fn huge_negative_ttl_is_capped() {
        let cfg = LookupConfig {
            negative_ttl_days: u64::MAX / 1000,
            ..Default::default()
        };
        assert_eq!(
            cfg.negative_ttl(),
            Duration::from_secs(NEGATIVE_TTL_MAX_DAYS * SECS_PER_DAY)
        );
        assert_eq!(
            LookupConfig::default().negative_ttl(),
            Duration::from_secs(180 * SECS_PER_DAY)
        );
    }
}
