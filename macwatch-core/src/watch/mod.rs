//! Capture directory watcher.
//!
//! Native notifications (when the `fs-watch` feature is on) and periodic
//! rescans both feed one receive loop. Every candidate goes through the
//! stability and accessibility checks before it is offered to the queue;
//! overflowed files are parked in the holding directory and renamed back
//! into the root once the queue has room.

pub mod stability;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{StabilityConfig, WatchConfig};
use crate::error::{IngestError, Result};
use crate::queue::worker::FileProcessor;
use crate::queue::{BoundedWorkQueue, EnqueueOutcome, RejectReason, display_name};

pub use stability::{FileProbe, FileSample, FsProbe, StabilityMonitor};

/// Input to the watcher loop. Native notifications are translated into these,
/// and tests or other producers can inject them directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file appeared in the root (created or renamed into it).
    Created(PathBuf),
    /// The notification backend reported a problem; triggers a rescan.
    Error(String),
}

#[derive(Debug)]
enum Verdict {
    Ready(Option<SystemTime>),
    Unstable,
    Inaccessible,
}

#[derive(Debug)]
struct CheckResult {
    path: PathBuf,
    verdict: Verdict,
}

/// Turns creation events and rescans into queued, fully written captures.
pub struct DirectoryWatcher<P: FileProbe + 'static = FsProbe> {
    watch: WatchConfig,
    stability: StabilityConfig,
    monitor: StabilityMonitor<P>,
    queue: Arc<BoundedWorkQueue>,
    processor: Arc<dyn FileProcessor>,
    /// Paths handed to the queue this run, with the mtime they had then.
    handed_off: HashMap<PathBuf, Option<SystemTime>>,
    checking: HashSet<PathBuf>,
}

impl<P: FileProbe + 'static> fmt::Debug for DirectoryWatcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("root", &self.watch.root)
            .field("extension", &self.watch.extension)
            .field("handed_off", &self.handed_off.len())
            .field("checking", &self.checking.len())
            .finish()
    }
}

impl DirectoryWatcher<FsProbe> {
    /// Watcher sampling files through the real filesystem.
    pub fn new(
        watch: WatchConfig,
        stability: StabilityConfig,
        queue: Arc<BoundedWorkQueue>,
        processor: Arc<dyn FileProcessor>,
    ) -> Self {
        Self::with_monitor(
            watch,
            stability,
            StabilityMonitor::default(),
            queue,
            processor,
        )
    }
}

impl<P: FileProbe + 'static> DirectoryWatcher<P> {
    /// Watcher with a custom stability monitor.
    pub fn with_monitor(
        watch: WatchConfig,
        stability: StabilityConfig,
        monitor: StabilityMonitor<P>,
        queue: Arc<BoundedWorkQueue>,
        processor: Arc<dyn FileProcessor>,
    ) -> Self {
        Self {
            watch,
            stability,
            monitor,
            queue,
            processor,
            handed_off: HashMap::new(),
            checking: HashSet::new(),
        }
    }

    /// Drive the watcher until `shutdown` fires. The first rescan tick runs
    /// immediately, so files already present at startup are picked up.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<WatchEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut checks: JoinSet<CheckResult> = JoinSet::new();
        let mut rescan = tokio::time::interval(self.watch.rescan_interval());
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        info!(
            target: "macwatch::watch",
            root = %self.watch.root.display(),
            extension = %self.watch.extension,
            rescan_secs = self.watch.rescan_interval().as_secs(),
            "watching for capture files"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Some(WatchEvent::Created(path)) => {
                        self.on_candidate(path, &mut checks).await;
                    }
                    Some(WatchEvent::Error(message)) => {
                        warn!(
                            target: "macwatch::watch",
                            error = %message,
                            "watch backend error, rescanning"
                        );
                        self.rescan(&mut checks).await;
                    }
                    None => {
                        debug!(
                            target: "macwatch::watch",
                            "event channel closed, continuing on rescans"
                        );
                        events_open = false;
                    }
                },
                Some(joined) = checks.join_next(), if !checks.is_empty() => {
                    self.on_check_finished(joined).await;
                }
                _ = rescan.tick() => self.rescan(&mut checks).await,
            }
        }

        let abandoned = checks.len();
        checks.shutdown().await;
        info!(
            target: "macwatch::watch",
            abandoned_checks = abandoned,
            handed_off = self.handed_off.len(),
            "watcher stopped"
        );
        Ok(())
    }

    async fn on_candidate(
        &mut self,
        path: PathBuf,
        checks: &mut JoinSet<CheckResult>,
    ) {
        if !self.is_candidate(&path) {
            return;
        }
        if self.checking.contains(&path) {
            debug!(
                target: "macwatch::watch",
                path = %path.display(),
                "stability check already running"
            );
            return;
        }

        let modified = modified_time(&path);
        if let Some(previous) = self.handed_off.get(&path)
            && *previous == modified
        {
            debug!(
                target: "macwatch::watch",
                path = %path.display(),
                "already handed off, ignoring repeat event"
            );
            return;
        }
        if self.queue.contains(&path).await {
            return;
        }
        if self.processor.is_processed(&path).await {
            debug!(
                target: "macwatch::watch",
                path = %path.display(),
                "already processed, skipping"
            );
            return;
        }

        info!(
            target: "macwatch::watch",
            file = %display_name(&path),
            "detected capture file"
        );
        self.checking.insert(path.clone());

        let monitor = self.monitor.clone();
        let stability = self.stability;
        checks.spawn(async move {
            let stable = monitor
                .wait_for_stability(
                    &path,
                    stability.sample_interval(),
                    stability.required_stable_samples,
                    stability.max_wait(),
                )
                .await;
            let verdict = if !stable {
                Verdict::Unstable
            } else if !monitor
                .is_accessible(&path, stability.accessibility_timeout())
                .await
            {
                Verdict::Inaccessible
            } else {
                Verdict::Ready(modified_time(&path))
            };
            CheckResult { path, verdict }
        });
    }

    fn is_candidate(&self, path: &Path) -> bool {
        if !self.watch.matches_extension(path) {
            return false;
        }
        // Non-recursive: only direct children of the root.
        if path.parent() != Some(self.watch.root.as_path()) {
            return false;
        }
        !path.is_dir()
    }

    async fn on_check_finished(
        &mut self,
        joined: std::result::Result<CheckResult, JoinError>,
    ) {
        let result = match joined {
            Ok(result) => result,
            Err(err) => {
                if !err.is_cancelled() {
                    error!(
                        target: "macwatch::watch",
                        error = %err,
                        "stability check task failed"
                    );
                }
                return;
            }
        };

        self.checking.remove(&result.path);
        match result.verdict {
            Verdict::Ready(modified) => self.hand_off(result.path, modified).await,
            Verdict::Unstable => {
                warn!(
                    target: "macwatch::watch",
                    file = %display_name(&result.path),
                    "file never became stable, skipping"
                );
            }
            Verdict::Inaccessible => {
                warn!(
                    target: "macwatch::watch",
                    file = %display_name(&result.path),
                    "file not accessible, skipping"
                );
            }
        }
    }

    async fn hand_off(&mut self, path: PathBuf, modified: Option<SystemTime>) {
        match self.queue.try_enqueue(path.clone()).await {
            EnqueueOutcome::Enqueued { size, .. } => {
                info!(
                    target: "macwatch::watch",
                    file = %display_name(&path),
                    queue_size = size,
                    "handed off to queue"
                );
                self.handed_off.insert(path, modified);
            }
            EnqueueOutcome::Rejected(RejectReason::Duplicate) => {}
            EnqueueOutcome::Rejected(RejectReason::Overflow { capacity }) => {
                self.park(&path, capacity).await;
            }
        }
    }

    /// Move an overflowed file into the holding directory.
    async fn park(&self, path: &Path, capacity: usize) {
        let holding = self.watch.holding_dir();
        match relocate(path, &holding).await {
            Ok(parked) => {
                let moved_back = self.queue.record_moved_back().await;
                warn!(
                    target: "macwatch::watch",
                    file = %display_name(path),
                    capacity,
                    moved_back,
                    holding = %parked.display(),
                    "queue full, file moved back for later"
                );
            }
            Err(err) => {
                // Left in the root, so the next rescan offers it again.
                error!(
                    target: "macwatch::watch",
                    file = %display_name(path),
                    error = %err,
                    "failed to move overflowed file"
                );
            }
        }
    }

    async fn rescan(&mut self, checks: &mut JoinSet<CheckResult>) {
        self.handed_off.retain(|path, _| path.exists());
        self.restore_held().await;

        let candidates = match list_matching(&self.watch.root, &self.watch) {
            Ok(paths) => paths,
            Err(err) => {
                error!(
                    target: "macwatch::watch",
                    root = %self.watch.root.display(),
                    error = %err,
                    "rescan failed"
                );
                return;
            }
        };

        debug!(
            target: "macwatch::watch",
            candidates = candidates.len(),
            "rescanning watch root"
        );
        for path in candidates {
            self.on_candidate(path, checks).await;
        }
    }

    /// Rename held files back into the root while the queue has room. The
    /// rename shows up as a fresh creation event.
    async fn restore_held(&self) {
        let holding = self.watch.holding_dir();
        if !holding.is_dir() {
            return;
        }

        let stats = self.queue.snapshot().await;
        let mut room = stats
            .capacity
            .saturating_sub(stats.size + self.checking.len());
        if room == 0 {
            return;
        }

        let held = match list_matching(&holding, &self.watch) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(
                    target: "macwatch::watch",
                    holding = %holding.display(),
                    error = %err,
                    "could not list holding directory"
                );
                return;
            }
        };

        for path in held {
            if room == 0 {
                break;
            }
            match relocate(&path, &self.watch.root).await {
                Ok(restored) => {
                    room -= 1;
                    info!(
                        target: "macwatch::watch",
                        file = %display_name(&restored),
                        "restored held file to watch root"
                    );
                }
                Err(err) => {
                    warn!(
                        target: "macwatch::watch",
                        file = %display_name(&path),
                        error = %err,
                        "failed to restore held file"
                    );
                }
            }
        }
    }
}

/// Fail fast when the watch root is missing, not a directory or unreadable.
pub fn validate_root(root: &Path) -> Result<()> {
    let invalid = |reason: String| IngestError::WatchRoot {
        path: root.to_path_buf(),
        reason,
    };

    let meta = std::fs::metadata(root).map_err(|err| invalid(err.to_string()))?;
    if !meta.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    std::fs::read_dir(root).map_err(|err| invalid(err.to_string()))?;
    Ok(())
}

/// Move `path` into `dir`, creating the directory if needed. A name already
/// taken in `dir` gets a timestamp suffix. Falls back to copy and delete when
/// the rename crosses filesystems.
pub async fn relocate(path: &Path, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path.file_name().ok_or_else(|| {
        IngestError::processing(path, "path has no file name")
    })?;
    let mut target = dir.join(file_name);
    if tokio::fs::try_exists(&target).await? {
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let renamed = match path.extension() {
            Some(ext) => {
                format!("{stem}-{suffix}.{}", ext.to_string_lossy())
            }
            None => format!("{stem}-{suffix}"),
        };
        target = dir.join(renamed);
    }

    match tokio::fs::rename(path, &target).await {
        Ok(()) => Ok(target),
        Err(err) if err.kind() == std::io::ErrorKind::CrossesDevices => {
            tokio::fs::copy(path, &target).await?;
            tokio::fs::remove_file(path).await?;
            Ok(target)
        }
        Err(err) => Err(err.into()),
    }
}

fn list_matching(dir: &Path, watch: &WatchConfig) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && watch.matches_extension(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Subscribe to native creation events under `root` (non-recursive) and
/// forward them into `tx`. The returned watcher must be kept alive; dropping
/// it ends the subscription.
#[cfg(feature = "fs-watch")]
pub fn subscribe(
    root: &Path,
    tx: mpsc::Sender<WatchEvent>,
) -> Result<notify::RecommendedWatcher> {
    use notify::event::{EventKind, ModifyKind, RenameMode};
    use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

    let root_display = root.display().to_string();
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                let paths: Vec<PathBuf> = match event.kind {
                    EventKind::Create(_) => event.paths,
                    EventKind::Modify(ModifyKind::Name(
                        RenameMode::To | RenameMode::Any,
                    )) => event.paths,
                    EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                        event.paths.into_iter().last().into_iter().collect()
                    }
                    _ => return,
                };
                for path in paths {
                    if let Err(err) = tx.blocking_send(WatchEvent::Created(path))
                    {
                        warn!(
                            target: "macwatch::watch",
                            root = %root_display,
                            error = %err,
                            "watch channel send failed"
                        );
                    }
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchEvent::Error(err.to_string()));
            }
        },
        Config::default(),
    )?;

    watcher.watch(root, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
