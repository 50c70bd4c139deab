//! Time-limited memory of keys the vendor service does not know.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::key::VendorKey;

const FALLBACK_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Keys confirmed absent from the vendor service, with their expiry.
#[derive(Debug, Clone)]
pub struct NegativeCache {
    ttl: Duration,
    entries: HashMap<VendorKey, Instant>,
}

impl NegativeCache {
    /// Cache whose entries live for `ttl` after insertion.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record `key` as absent from `now`. A TTL reaching past what the
    /// clock can represent falls back to one year.
    pub fn insert(&mut self, key: VendorKey, now: Instant) {
        let expires_at = now
            .checked_add(self.ttl)
            .or_else(|| now.checked_add(FALLBACK_TTL))
            .unwrap_or(now);
        self.entries.insert(key, expires_at);
    }

    /// Whether `key` is still known-absent at `now`. An entry is honoured up
    /// to and including its expiry instant and removed once past it.
    pub fn contains(&mut self, key: &VendorKey, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(expires_at) if now <= *expires_at => true,
            Some(_) => {
                self.entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| now <= *expires_at);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(
                target: "macwatch::lookup",
                removed,
                remaining = self.entries.len(),
                "pruned negative cache"
            );
        }
        removed
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> VendorKey {
        VendorKey::parse(raw).unwrap()
    }

    #[test]
    fn honoured_until_expiry_and_eligible_strictly_after() {
        let ttl = Duration::from_secs(180 * 24 * 60 * 60);
        let mut cache = NegativeCache::new(ttl);
        let start = Instant::now();
        cache.insert(key("00:11:22"), start);

        assert!(cache.contains(&key("00:11:22"), start));
        assert!(cache.contains(&key("00:11:22"), start + ttl));
        assert!(!cache.contains(&key("00:11:22"), start + ttl + Duration::from_nanos(1)));
        assert!(cache.is_empty(), "expired entry removed lazily");
    }

    #[test]
    fn prune_removes_only_expired() {
        let ttl = Duration::from_secs(60);
        let mut cache = NegativeCache::new(ttl);
        let start = Instant::now();
        cache.insert(key("00:11:22"), start);
        cache.insert(key("33:44:55"), start + Duration::from_secs(30));

        assert_eq!(cache.prune(start + Duration::from_secs(61)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key("33:44:55"), start + Duration::from_secs(61)));
    }

    #[test]
    fn unrepresentable_ttl_does_not_overflow() {
        let mut cache = NegativeCache::new(Duration::MAX);
        let start = Instant::now();
        cache.insert(key("00:11:22"), start);

        assert!(cache.contains(&key("00:11:22"), start + Duration::from_secs(86_400)));
    }
}
