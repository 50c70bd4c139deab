//! Environment overrides using the operational variable names.

use std::path::PathBuf;
use std::str::FromStr;

use macwatch_core::config::PipelineConfig;

use crate::util::{millis, parse_duration};
use crate::validation::{ConfigWarning, ConfigWarnings};

/// Watch root.
pub const WATCH_DIRECTORY: &str = "WATCH_DIRECTORY";
/// Rescan cadence in seconds (human forms accepted).
pub const CHECK_INTERVAL: &str = "CHECK_INTERVAL";
/// Queue capacity.
pub const FILE_QUEUE_MAX_SIZE: &str = "FILE_QUEUE_MAX_SIZE";
/// Minimum lookup interval in (fractional) seconds.
pub const MACVENDOR_API_INTERVAL: &str = "MACVENDOR_API_INTERVAL";
/// Per-request timeout in seconds.
pub const MACVENDOR_API_TIMEOUT: &str = "MACVENDOR_API_TIMEOUT";
/// Vendor service API key.
pub const API_KEY_MACVENDOR: &str = "API_KEY_MACVENDOR";
/// Report directory.
pub const OUT_DIRECTORY: &str = "OUT_DIRECTORY";
/// Lookup parallelism within a batch.
pub const NUM_WORKERS: &str = "NUM_WORKERS";
/// Capture file extension.
pub const MACWATCH_EXTENSION: &str = "MACWATCH_EXTENSION";
/// Config file path.
pub const MACWATCH_CONFIG_PATH: &str = "MACWATCH_CONFIG_PATH";

/// Apply every recognised variable found through `lookup`. Values that do
/// not parse are reported and leave the current setting alone.
pub fn apply_overrides<F>(
    config: &mut PipelineConfig,
    lookup: F,
    warnings: &mut ConfigWarnings,
) where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| {
        lookup(name)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };
    let mut invalid = |name: &str, value: String| {
        warnings.push(ConfigWarning::InvalidEnvValue {
            name: name.to_string(),
            value,
        });
    };

    if let Some(dir) = get(WATCH_DIRECTORY) {
        config.watch.root = PathBuf::from(dir);
    }
    if let Some(ext) = get(MACWATCH_EXTENSION) {
        config.watch.extension = ext;
    }
    if let Some(raw) = get(CHECK_INTERVAL) {
        match parse_duration(&raw) {
            Some(every) if !every.is_zero() => {
                config.watch.rescan_interval_ms = millis(every);
            }
            _ => invalid(CHECK_INTERVAL, raw),
        }
    }
    if let Some(raw) = get(FILE_QUEUE_MAX_SIZE) {
        match parse_number::<usize>(&raw) {
            Some(size) => config.queue.max_size = size,
            None => invalid(FILE_QUEUE_MAX_SIZE, raw),
        }
    }
    if let Some(raw) = get(MACVENDOR_API_INTERVAL) {
        match parse_duration(&raw) {
            Some(interval) => config.lookup.min_interval_ms = millis(interval),
            None => invalid(MACVENDOR_API_INTERVAL, raw),
        }
    }
    if let Some(raw) = get(MACVENDOR_API_TIMEOUT) {
        match parse_duration(&raw) {
            Some(timeout) if !timeout.is_zero() => {
                config.lookup.request_timeout_ms = millis(timeout);
            }
            _ => invalid(MACVENDOR_API_TIMEOUT, raw),
        }
    }
    if let Some(key) = get(API_KEY_MACVENDOR) {
        config.lookup.api_key = Some(key);
    }
    if let Some(dir) = get(OUT_DIRECTORY) {
        config.output.report_dir = Some(PathBuf::from(dir));
    }
    if let Some(raw) = get(NUM_WORKERS) {
        match parse_number::<usize>(&raw) {
            Some(workers) if workers > 0 => {
                config.lookup.batch_parallelism = workers;
            }
            _ => invalid(NUM_WORKERS, raw),
        }
    }
}

fn parse_number<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}
