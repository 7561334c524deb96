//! Per-maintainer open-proposal caps, plus per-host exponential back-off for
//! forges returning transient errors.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Pluggable cap strategy on the number of open merge proposals per maintainer.
pub trait RateLimiter: Send + Sync {
    /// Whether a new proposal may be opened for `maintainer`.
    fn allowed(&self, maintainer: &str) -> bool;

    /// Record that a new proposal was opened for `maintainer`.
    fn inc(&self, maintainer: &str);

    /// Overwrite the tracked open-proposal counts from a forge-observed snapshot,
    /// correcting for drift (manual merges/closes, a prior restart).
    fn set_open_mps_per_maintainer(&self, counts: HashMap<String, usize>);
}

/// Always allows: used when no cap is configured.
#[derive(Default)]
pub struct NoRateLimiter;

impl RateLimiter for NoRateLimiter {
    fn allowed(&self, _maintainer: &str) -> bool {
        true
    }
    fn inc(&self, _maintainer: &str) {}
    fn set_open_mps_per_maintainer(&self, _counts: HashMap<String, usize>) {}
}

/// Caps each maintainer at `max_open` simultaneously open proposals.
pub struct MaintainerCapRateLimiter {
    max_open: usize,
    open_mps_per_maintainer: RwLock<HashMap<String, usize>>,
}

impl MaintainerCapRateLimiter {
    pub fn new(max_open: usize) -> Self {
        Self {
            max_open,
            open_mps_per_maintainer: RwLock::new(HashMap::new()),
        }
    }
}

impl RateLimiter for MaintainerCapRateLimiter {
    fn allowed(&self, maintainer: &str) -> bool {
        let counts = self.open_mps_per_maintainer.read().unwrap();
        counts.get(maintainer).copied().unwrap_or(0) < self.max_open
    }

    fn inc(&self, maintainer: &str) {
        let mut counts = self.open_mps_per_maintainer.write().unwrap();
        *counts.entry(maintainer.to_string()).or_insert(0) += 1;
    }

    fn set_open_mps_per_maintainer(&self, counts: HashMap<String, usize>) {
        *self.open_mps_per_maintainer.write().unwrap() = counts;
    }
}

/// Per-host exponential back-off applied after a forge returns `too-many-requests`.
/// Independent of the per-maintainer cap above: this tracks host availability, not
/// proposal counts.
#[derive(Default)]
pub struct HostBackoff {
    rate_limited_until: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl HostBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `host` is currently within a back-off window.
    pub fn is_limited(&self, host: &str) -> bool {
        self.rate_limited_until
            .read()
            .unwrap()
            .get(host)
            .is_some_and(|until| *until > Utc::now())
    }

    /// Mark `host` as rate-limited until `until`.
    pub fn mark_limited(&self, host: &str, until: DateTime<Utc>) {
        self.rate_limited_until
            .write()
            .unwrap()
            .insert(host.to_string(), until);
    }

    /// Currently back-off'd hosts, for exclusion from `Queue::next_item`.
    pub fn limited_hosts(&self) -> std::collections::HashSet<String> {
        let now = Utc::now();
        self.rate_limited_until
            .read()
            .unwrap()
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(host, _)| host.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_rate_limiter_always_allows() {
        let limiter = NoRateLimiter;
        for _ in 0..100 {
            limiter.inc("alice@example.org");
        }
        assert!(limiter.allowed("alice@example.org"));
    }

    #[test]
    fn maintainer_cap_blocks_once_reached() {
        // S4: cap k=5, maintainer has 5 open proposals -> not allowed.
        let limiter = MaintainerCapRateLimiter::new(5);
        for _ in 0..5 {
            limiter.inc("alice@example.org");
        }
        assert!(!limiter.allowed("alice@example.org"));
        assert!(limiter.allowed("bob@example.org"));
    }

    #[test]
    fn maintainer_cap_allows_below_threshold() {
        let limiter = MaintainerCapRateLimiter::new(5);
        for _ in 0..4 {
            limiter.inc("alice@example.org");
        }
        assert!(limiter.allowed("alice@example.org"));
    }

    #[test]
    fn set_open_mps_corrects_drift() {
        let limiter = MaintainerCapRateLimiter::new(2);
        limiter.inc("alice@example.org");
        limiter.inc("alice@example.org");
        assert!(!limiter.allowed("alice@example.org"));

        let mut observed = HashMap::new();
        observed.insert("alice@example.org".to_string(), 0usize);
        limiter.set_open_mps_per_maintainer(observed);
        assert!(limiter.allowed("alice@example.org"));
    }

    #[test]
    fn host_backoff_expires() {
        let backoff = HostBackoff::new();
        backoff.mark_limited("forge.example.org", Utc::now() + chrono::Duration::seconds(60));
        assert!(backoff.is_limited("forge.example.org"));
        assert!(backoff.limited_hosts().contains("forge.example.org"));

        backoff.mark_limited("forge.example.org", Utc::now() - chrono::Duration::seconds(1));
        assert!(!backoff.is_limited("forge.example.org"));
        assert!(backoff.limited_hosts().is_empty());
    }
}
