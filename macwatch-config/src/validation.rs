//! Guard rails applied after all configuration layers are merged.

use std::fmt;

use macwatch_core::config::{NEGATIVE_TTL_MAX_DAYS, PipelineConfig};

/// Non-fatal configuration problem. The loader keeps going and the binary
/// logs each one at `warn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `queue.max_size` outside `[1, QUEUE_SIZE_CEILING]`.
    QueueSizeClamped { requested: usize, effective: usize },
    /// Minimum lookup interval above the maximum.
    IntervalBoundsInverted { min_ms: u64, max_ms: u64 },
    /// No capture extension configured.
    EmptyExtension,
    /// Breaker threshold of zero.
    ZeroFailureThreshold,
    /// Stability streak of zero.
    ZeroStableSamples,
    /// The streak can never complete within `max_wait_ms`.
    StabilityWindowExceedsMaxWait { window_ms: u64, max_wait_ms: u64 },
    /// Negative-cache lifetime beyond the supported maximum.
    NegativeTtlClamped { requested_days: u64, effective_days: u64 },
    /// Shutdown would cut off a file mid-batch.
    ShutdownGraceBelowBatchTimeout { grace_ms: u64, batch_timeout_ms: u64 },
    /// An environment variable did not parse.
    InvalidEnvValue { name: String, value: String },
    /// Anything else worth surfacing.
    Other(String),
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::QueueSizeClamped {
                requested,
                effective,
            } => write!(
                f,
                "queue.max_size {requested} out of range, using {effective}"
            ),
            ConfigWarning::IntervalBoundsInverted { min_ms, max_ms } => write!(
                f,
                "lookup.min_interval_ms ({min_ms}) exceeds max_interval_ms \
                 ({max_ms}); max raised to min"
            ),
            ConfigWarning::EmptyExtension => {
                f.write_str("watch.extension is empty, defaulting to kismet")
            }
            ConfigWarning::ZeroFailureThreshold => f.write_str(
                "lookup.failure_threshold is 0; the circuit opens on the first failure",
            ),
            ConfigWarning::ZeroStableSamples => f.write_str(
                "stability.required_stable_samples is 0; treated as 1",
            ),
            ConfigWarning::StabilityWindowExceedsMaxWait {
                window_ms,
                max_wait_ms,
            } => write!(
                f,
                "stability streak needs {window_ms}ms but max_wait_ms is \
                 {max_wait_ms}; no file can ever settle"
            ),
            ConfigWarning::NegativeTtlClamped {
                requested_days,
                effective_days,
            } => write!(
                f,
                "lookup.negative_ttl_days {requested_days} out of range, \
                 using {effective_days}"
            ),
            ConfigWarning::ShutdownGraceBelowBatchTimeout {
                grace_ms,
                batch_timeout_ms,
            } => write!(
                f,
                "queue.shutdown_grace_ms ({grace_ms}) is shorter than one \
                 lookup batch ({batch_timeout_ms}); raised to match"
            ),
            ConfigWarning::InvalidEnvValue { name, value } => {
                write!(f, "ignoring invalid {name}={value:?}, keeping default")
            }
            ConfigWarning::Other(message) => f.write_str(message),
        }
    }
}

/// Warnings collected during a load, in the order found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigWarnings {
    items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    /// Record a warning.
    pub fn push(&mut self, warning: ConfigWarning) {
        self.items.push(warning);
    }

    /// Whether the load was clean.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of warnings.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Warnings in order.
    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }

    /// Whether `warning` was raised.
    pub fn contains(&self, warning: &ConfigWarning) -> bool {
        self.items.contains(warning)
    }
}

impl IntoIterator for ConfigWarnings {
    type Item = ConfigWarning;
    type IntoIter = std::vec::IntoIter<ConfigWarning>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Check guard rails and repair what can be repaired in place.
pub fn validate(config: &mut PipelineConfig, warnings: &mut ConfigWarnings) {
    let requested = config.queue.max_size;
    let effective = config.queue.effective_capacity();
    if requested != effective {
        warnings.push(ConfigWarning::QueueSizeClamped {
            requested,
            effective,
        });
        config.queue.max_size = effective;
    }

    let lookup = &mut config.lookup;
    if lookup.min_interval_ms > lookup.max_interval_ms {
        warnings.push(ConfigWarning::IntervalBoundsInverted {
            min_ms: lookup.min_interval_ms,
            max_ms: lookup.max_interval_ms,
        });
        lookup.max_interval_ms = lookup.min_interval_ms;
    }
    if lookup.negative_ttl_days > NEGATIVE_TTL_MAX_DAYS {
        warnings.push(ConfigWarning::NegativeTtlClamped {
            requested_days: lookup.negative_ttl_days,
            effective_days: NEGATIVE_TTL_MAX_DAYS,
        });
        lookup.negative_ttl_days = NEGATIVE_TTL_MAX_DAYS;
    }
    if lookup.failure_threshold == 0 {
        warnings.push(ConfigWarning::ZeroFailureThreshold);
        lookup.failure_threshold = 1;
    }

    if config.queue.shutdown_grace_ms < config.lookup.batch_timeout_ms {
        warnings.push(ConfigWarning::ShutdownGraceBelowBatchTimeout {
            grace_ms: config.queue.shutdown_grace_ms,
            batch_timeout_ms: config.lookup.batch_timeout_ms,
        });
        config.queue.shutdown_grace_ms = config.lookup.batch_timeout_ms;
    }

    let extension = config.watch.extension.trim().trim_start_matches('.');
    if extension.is_empty() {
        warnings.push(ConfigWarning::EmptyExtension);
        config.watch.extension = "kismet".to_string();
    }

    let stability = &mut config.stability;
    if stability.required_stable_samples == 0 {
        warnings.push(ConfigWarning::ZeroStableSamples);
        stability.required_stable_samples = 1;
    }
    let window_ms = stability
        .sample_interval_ms
        .saturating_mul(u64::from(stability.required_stable_samples));
    if window_ms > stability.max_wait_ms {
        warnings.push(ConfigWarning::StabilityWindowExceedsMaxWait {
            window_ms,
            max_wait_ms: stability.max_wait_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use macwatch_core::config::QUEUE_SIZE_CEILING;

    #[test]
    fn defaults_are_clean() {
        let mut config = PipelineConfig::default();
        let mut warnings = ConfigWarnings::default();
        validate(&mut config, &mut warnings);
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn repairs_out_of_range_values() {
        let mut config = PipelineConfig::default();
        config.queue.max_size = 100;
        config.lookup.min_interval_ms = 90_000;
        config.lookup.failure_threshold = 0;
        config.watch.extension = ".".to_string();
        config.stability.required_stable_samples = 0;

        let mut warnings = ConfigWarnings::default();
        validate(&mut config, &mut warnings);

        assert_eq!(config.queue.max_size, QUEUE_SIZE_CEILING);
        assert_eq!(config.lookup.max_interval_ms, 90_000);
        assert_eq!(config.lookup.failure_threshold, 1);
        assert_eq!(config.watch.extension, "kismet");
        assert_eq!(config.stability.required_stable_samples, 1);
        assert!(warnings.contains(&ConfigWarning::QueueSizeClamped {
            requested: 100,
            effective: QUEUE_SIZE_CEILING,
        }));
        assert_eq!(warnings.len(), 5);
    }

    #[test]
    fn caps_negative_ttl_and_raises_shutdown_grace() {
        let mut config = PipelineConfig::default();
        config.lookup.negative_ttl_days = u64::MAX / 1000;
        config.queue.shutdown_grace_ms = 5_000;

        let mut warnings = ConfigWarnings::default();
        validate(&mut config, &mut warnings);

        assert_eq!(config.lookup.negative_ttl_days, NEGATIVE_TTL_MAX_DAYS);
        assert_eq!(config.queue.shutdown_grace_ms, config.lookup.batch_timeout_ms);
        assert!(warnings.contains(&ConfigWarning::NegativeTtlClamped {
            requested_days: u64::MAX / 1000,
            effective_days: NEGATIVE_TTL_MAX_DAYS,
        }));
        assert!(warnings.contains(&ConfigWarning::ShutdownGraceBelowBatchTimeout {
            grace_ms: 5_000,
            batch_timeout_ms: 120_000,
        }));
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn flags_unreachable_stability_window() {
        let mut config = PipelineConfig::default();
        config.stability.sample_interval_ms = 10_000;
        config.stability.required_stable_samples = 10;
        config.stability.max_wait_ms = 60_000;

        let mut warnings = ConfigWarnings::default();
        validate(&mut config, &mut warnings);
        assert!(matches!(
            warnings.iter().next(),
            Some(ConfigWarning::StabilityWindowExceedsMaxWait { .. })
        ));
    }
}
