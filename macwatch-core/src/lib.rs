//! # macwatch core
//!
//! Resilient ingestion pipeline for wardriving capture files.
//!
//! - [`watch`]: directory watching with completeness detection and an
//!   overflow holding area
//! - [`queue`]: bounded, duplicate-suppressing work queue and the sequential
//!   worker draining it
//! - [`lookup`]: rate-limited, circuit-broken vendor lookup client with
//!   negative caching, deferred retries and batch execution
//! - [`enrich`]: the per-file processor that turns a capture into a vendor
//!   report
//! - [`pipeline`]: the supervisor that runs the watcher and worker
//!
//! ## Feature Flags
//!
//! - `fs-watch` (default): native filesystem notifications through `notify`.
//!   Without it the watcher runs on rescans and injected events only.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod enrich;
pub mod error;
pub mod lookup;
pub mod pipeline;
pub mod queue;
pub mod watch;

pub use config::{
    LookupConfig, OutputConfig, PipelineConfig, QUEUE_SIZE_CEILING,
    QueueConfig, StabilityConfig, WatchConfig,
};
pub use enrich::{DeviceSource, EnrichmentProcessor, OutputLayout, VendorReport};
pub use error::{IngestError, Result};
pub use lookup::{LookupOutcome, RateLimitedClient, VendorKey, VendorService};
pub use pipeline::IngestPipeline;
pub use queue::worker::{FileProcessor, SequentialWorker};
pub use queue::{BoundedWorkQueue, EnqueueOutcome, QueueEntry, QueueStats};
pub use watch::{DirectoryWatcher, StabilityMonitor, WatchEvent};
