//! Rate-limited, circuit-broken client for the vendor lookup service.
//!
//! Responses are classified before any policy is applied:
//!
//! - not found: cached negatively for the configured TTL, no effect on pacing
//!   or the breaker
//! - rate limited: interval doubles, key goes onto the bounded retry queue
//! - server or network failure: retried with capped exponential backoff, then
//!   counted against the breaker
//! - success: resets the breaker streak and relaxes the interval
//!
//! While the breaker is open lookups return [`LookupOutcome::Skipped`] without
//! touching the service.

pub mod cache;
pub mod circuit;
pub mod key;
pub mod provider;
pub mod rate;
pub mod retry;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LookupConfig;

pub use cache::NegativeCache;
pub use circuit::{CircuitBreaker, CircuitPhase};
pub use key::VendorKey;
pub use provider::{MacVendorsProvider, ProviderError, VendorService};
pub use rate::RateState;
pub use retry::{RetryEntry, RetryQueue};

/// What a lookup produced for one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum LookupOutcome {
    /// Vendor name.
    Found(String),
    /// No vendor registered; cached negatively.
    NotFound,
    /// Circuit open; the service was not contacted.
    Skipped,
    /// Rate limited; the key waits on the retry queue.
    Deferred,
    /// Abandoned at the batch deadline.
    TimedOut,
    /// Transient failures exhausted their retries.
    Failed(String),
}

impl LookupOutcome {
    /// Vendor name when found.
    pub fn vendor(&self) -> Option<&str> {
        match self {
            LookupOutcome::Found(name) => Some(name),
            _ => None,
        }
    }
}

/// Snapshot of the client state for reporting.
#[derive(Clone, Debug, Serialize)]
pub struct LookupStats {
    /// Current request spacing.
    pub interval_ms: u64,
    /// Breaker phase.
    pub circuit: CircuitPhase,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// How often the breaker opened.
    pub times_opened: u64,
    /// Vendors memoised this run.
    pub cached: usize,
    /// Keys cached as not found.
    pub negative_cached: usize,
    /// Keys waiting on the retry queue.
    pub retry_pending: usize,
}

/// Paced, circuit-broken front for a [`VendorService`].
///
/// State is split across independent locks so batch lookups can run in
/// parallel while still sharing one pacing schedule.
pub struct RateLimitedClient<S = MacVendorsProvider> {
    service: S,
    config: LookupConfig,
    rate: Mutex<RateState>,
    circuit: Mutex<CircuitBreaker>,
    negative: Mutex<NegativeCache>,
    found: Mutex<HashMap<VendorKey, String>>,
    retry: Mutex<RetryQueue>,
}

impl<S> fmt::Debug for RateLimitedClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("base_url", &self.config.base_url)
            .field("failure_threshold", &self.config.failure_threshold)
            .field("batch_size", &self.config.batch_size)
            .finish()
    }
}

impl RateLimitedClient<MacVendorsProvider> {
    /// Client backed by the HTTP provider described by `config`.
    pub fn from_config(config: &LookupConfig) -> Result<Self, ProviderError> {
        Ok(Self::new(MacVendorsProvider::from_config(config)?, config))
    }
}

impl<S: VendorService> RateLimitedClient<S> {
    /// Client over `service` with the policy in `config`.
    pub fn new(service: S, config: &LookupConfig) -> Self {
        Self {
            service,
            rate: Mutex::new(RateState::new(
                config.min_interval(),
                config.max_interval(),
                config.decrease_factor,
            )),
            circuit: Mutex::new(CircuitBreaker::new(
                config.failure_threshold,
                config.cooldown(),
            )),
            negative: Mutex::new(NegativeCache::new(config.negative_ttl())),
            found: Mutex::new(HashMap::new()),
            retry: Mutex::new(RetryQueue::new(config.retry_queue_capacity)),
            config: config.clone(),
        }
    }

    /// Underlying service.
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Resolve a single key, applying caching, pacing, retry and the breaker.
    pub async fn lookup(&self, key: &VendorKey) -> LookupOutcome {
        self.resolve(key, 0).await
    }

    /// Resolve many keys under bounded parallelism. Keys are de-duplicated,
    /// split into batches of `batch_size`, and any lookup still running at a
    /// batch's deadline is dropped and reported as [`LookupOutcome::TimedOut`].
    pub async fn lookup_batch(
        &self,
        keys: &[VendorKey],
    ) -> Vec<(VendorKey, LookupOutcome)> {
        let mut seen = HashSet::new();
        let unique: Vec<VendorKey> = keys
            .iter()
            .filter(|key| seen.insert(*key))
            .cloned()
            .collect();

        let batch_size = self.config.batch_size.max(1);
        let parallelism = self.config.effective_parallelism();
        let batch_timeout = self.config.batch_timeout();
        let mut results = Vec::with_capacity(unique.len());

        for (index, chunk) in unique.chunks(batch_size).enumerate() {
            let deadline = Instant::now() + batch_timeout;
            let mut pending: HashSet<VendorKey> =
                chunk.iter().cloned().collect();

            let mut lookups = stream::iter(chunk.iter().cloned())
                .map(|key| self.lookup_owned(key))
                .buffer_unordered(parallelism);

            loop {
                match tokio::time::timeout_at(deadline, lookups.next()).await {
                    Ok(Some((key, outcome))) => {
                        pending.remove(&key);
                        results.push((key, outcome));
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            target: "macwatch::lookup",
                            batch = index,
                            abandoned = pending.len(),
                            timeout_secs = batch_timeout.as_secs(),
                            "batch deadline reached, abandoning lookups"
                        );
                        break;
                    }
                }
            }
            drop(lookups);

            for key in chunk {
                if pending.contains(key) {
                    results.push((key.clone(), LookupOutcome::TimedOut));
                }
            }

            self.negative.lock().await.prune(Instant::now());
            debug!(
                target: "macwatch::lookup",
                batch = index,
                keys = chunk.len(),
                "batch complete"
            );
        }

        results
    }

    /// Replay every key parked on the retry queue at the current pace. A key
    /// that is rate limited again is re-queued until its budget runs out.
    pub async fn retry_deferred(&self) -> Vec<(VendorKey, LookupOutcome)> {
        let entries = self.retry.lock().await.drain();
        if entries.is_empty() {
            return Vec::new();
        }

        info!(
            target: "macwatch::lookup",
            keys = entries.len(),
            "replaying deferred lookups"
        );

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let outcome = self.resolve(&entry.key, entry.attempts).await;
            results.push((entry.key, outcome));
        }
        results
    }

    /// Issue one lookup for a known-good key and seed the interval from its
    /// response time. Returns the resulting interval, or `None` when the
    /// probe could not run or failed.
    pub async fn probe_capacity(&self, key: &VendorKey) -> Option<Duration> {
        if !self.circuit.lock().await.allow(Instant::now()) {
            return None;
        }

        self.pace().await;
        let started = Instant::now();
        let result = self.request(key).await;
        let elapsed = started.elapsed();

        let mut rate = self.rate.lock().await;
        match result {
            Ok(name) => {
                self.circuit.lock().await.record_success();
                self.found.lock().await.insert(key.clone(), name);
                rate.calibrate(elapsed);
            }
            Err(ProviderError::NotFound) => {
                rate.calibrate(elapsed);
            }
            Err(ProviderError::RateLimited) => {
                rate.increase();
            }
            Err(err) => {
                warn!(
                    target: "macwatch::lookup",
                    key = %key,
                    error = %err,
                    "capacity probe failed"
                );
                return None;
            }
        }

        info!(
            target: "macwatch::lookup",
            response_ms = elapsed.as_millis() as u64,
            interval_ms = rate.current().as_millis() as u64,
            "capacity probe complete"
        );
        Some(rate.current())
    }

    /// Current counters and breaker state.
    pub async fn stats(&self) -> LookupStats {
        let interval = self.rate.lock().await.current();
        let (circuit, consecutive_failures, times_opened) = {
            let breaker = self.circuit.lock().await;
            (
                breaker.phase(),
                breaker.consecutive_failures(),
                breaker.times_opened(),
            )
        };
        LookupStats {
            interval_ms: interval.as_millis() as u64,
            circuit,
            consecutive_failures,
            times_opened,
            cached: self.found.lock().await.len(),
            negative_cached: self.negative.lock().await.len(),
            retry_pending: self.retry.lock().await.len(),
        }
    }

    fn lookup_owned(
        &self,
        key: VendorKey,
    ) -> BoxFuture<'_, (VendorKey, LookupOutcome)> {
        Box::pin(async move {
            let outcome = self.resolve(&key, 0).await;
            (key, outcome)
        })
    }

    /// `deferred` counts replays already granted to this key.
    async fn resolve(&self, key: &VendorKey, deferred: u32) -> LookupOutcome {
        if let Some(name) = self.found.lock().await.get(key) {
            return LookupOutcome::Found(name.clone());
        }
        if self.negative.lock().await.contains(key, Instant::now()) {
            return LookupOutcome::NotFound;
        }
        if !self.circuit.lock().await.allow(Instant::now()) {
            debug!(target: "macwatch::lookup", key = %key, "circuit open, skipped");
            return LookupOutcome::Skipped;
        }

        let max_attempts = self.config.transient_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.pace().await;

            match self.request(key).await {
                Ok(name) => {
                    self.circuit.lock().await.record_success();
                    self.rate.lock().await.decrease();
                    self.found.lock().await.insert(key.clone(), name.clone());
                    return LookupOutcome::Found(name);
                }
                Err(ProviderError::NotFound) => {
                    debug!(target: "macwatch::lookup", key = %key, "vendor not found");
                    self.negative.lock().await.insert(key.clone(), Instant::now());
                    return LookupOutcome::NotFound;
                }
                Err(ProviderError::RateLimited) => {
                    warn!(target: "macwatch::lookup", key = %key, "rate limited");
                    self.rate.lock().await.increase();
                    return self.defer(key, deferred).await;
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    debug!(
                        target: "macwatch::lookup",
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        target: "macwatch::lookup",
                        key = %key,
                        attempts = attempt,
                        error = %err,
                        "lookup failed"
                    );
                    self.circuit.lock().await.record_failure(Instant::now());
                    return LookupOutcome::Failed(err.to_string());
                }
            }
        }
    }

    async fn defer(&self, key: &VendorKey, deferred: u32) -> LookupOutcome {
        if deferred >= self.config.retry_max_attempts {
            warn!(
                target: "macwatch::lookup",
                key = %key,
                replays = deferred,
                "rate limited, giving up on key for this run"
            );
            return LookupOutcome::Failed("rate limited".to_string());
        }
        self.retry.lock().await.push(key.clone(), deferred + 1);
        LookupOutcome::Deferred
    }

    /// Wait for this request's slot in the paced schedule.
    async fn pace(&self) {
        let wait = self.rate.lock().await.reserve_slot(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn request(&self, key: &VendorKey) -> Result<String, ProviderError> {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, self.service.lookup(key.as_str()))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Network(format!(
                "request timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.config
            .backoff_base()
            .saturating_mul(1 << exponent)
            .min(self.config.backoff_max())
    }
}
