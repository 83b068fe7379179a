//! Configuration surface: the refresher timing table and system-wide tunables.
//!
//! Every duration is data here rather than hard-coded, with `Default` giving the documented
//! values so most callers need not set anything.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The interval/cooldown/timeout triple for one refresher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefresherTiming {
    /// Milliseconds between automatic fires. `None` means "metrics cadence" (supplied at
    /// construction from [`RefreshSystemConfig::metrics_cadence`]).
    pub interval: Option<Duration>,
    /// Cooldown after each run.
    pub cooldown: Duration,
    /// Per-subscriber timeout.
    pub timeout: Duration,
}

impl RefresherTiming {
    /// Resolve this timing's interval, substituting the metrics cadence for `None`.
    pub fn resolve_interval(&self, metrics_cadence: Duration) -> Duration {
        self.interval.unwrap_or(metrics_cadence)
    }
}

const fn fixed(interval_ms: u64, cooldown_ms: u64, timeout_s: u64) -> RefresherTiming {
    RefresherTiming {
        interval: Some(Duration::from_millis(interval_ms)),
        cooldown: Duration::from_millis(cooldown_ms),
        timeout: Duration::from_secs(timeout_s),
    }
}

const fn metrics_paced(cooldown_ms: u64, timeout_s: u64) -> RefresherTiming {
    RefresherTiming {
        interval: None,
        cooldown: Duration::from_millis(cooldown_ms),
        timeout: Duration::from_secs(timeout_s),
    }
}

/// The timing table, keyed by refresher name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefresherTimingTable {
    entries: HashMap<String, RefresherTiming>,
}

impl Default for RefresherTimingTable {
    fn default() -> Self {
        let mut entries = HashMap::new();
        let mut set = |name: &str, timing: RefresherTiming| {
            entries.insert(name.to_string(), timing);
        };

        // namespace
        set("namespace-workloads", metrics_paced(500, 10));
        set("namespace-config", fixed(5000, 1000, 10));
        set("namespace-network", fixed(5000, 1000, 10));
        set("namespace-storage", fixed(5000, 1000, 10));
        set("namespace-rbac", fixed(5000, 1000, 10));
        set("namespace-quotas", fixed(5000, 1000, 10));
        set("namespace-helm", fixed(10000, 1000, 60));
        set("namespace-custom", fixed(10000, 1000, 60));
        set("namespace-events", fixed(3000, 1000, 10));

        // cluster
        set("nodes", metrics_paced(1000, 10));
        set("cluster-rbac", fixed(10000, 1000, 10));
        set("cluster-storage", fixed(10000, 1000, 10));
        set("cluster-config", fixed(10000, 1000, 10));
        set("cluster-crds", fixed(15000, 1000, 60));
        set("cluster-custom", fixed(15000, 1000, 60));
        set("cluster-events", fixed(3000, 1000, 10));
        set("cluster-browse", fixed(15000, 1500, 30));
        set("cluster-catalog-diff", fixed(15000, 1500, 30));

        // system
        set("namespaces", fixed(2000, 1000, 10));
        set("cluster-overview", fixed(10000, 1000, 10));
        set("unified-pods", metrics_paced(1000, 30));
        set("object-details", fixed(2000, 1000, 10));
        set("object-events", fixed(3000, 1000, 10));
        set("object-logs", fixed(2000, 1000, 10));
        set("object-yaml", fixed(5000, 1000, 10));
        set("object-helm", fixed(5000, 1000, 10));

        Self { entries }
    }
}

impl RefresherTimingTable {
    /// Look up the timing for `name`, if it is a known refresher.
    pub fn get(&self, name: &str) -> Option<RefresherTiming> {
        self.entries.get(name).copied()
    }

    /// Insert or override the timing for `name`; lets callers extend the table with
    /// domain-specific refreshers (e.g. `object-<kind>`) not named in the default table verbatim.
    pub fn set(&mut self, name: impl Into<String>, timing: RefresherTiming) {
        self.entries.insert(name.into(), timing);
    }
}

/// The backend base-URL readiness retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReadinessRetryPolicy {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Backoff cap per attempt.
    pub max_backoff: Duration,
}

impl Default for ReadinessRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl ReadinessRetryPolicy {
    /// The backoff delay before attempt number `attempt` (0-indexed), doubling from
    /// `initial_backoff` and capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let scaled = self
            .initial_backoff
            .as_millis()
            .saturating_mul(factor as u128)
            .min(self.max_backoff.as_millis());
        Duration::from_millis(scaled as u64)
    }
}

/// System-wide tunables that are not specific to any one refresher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefreshSystemConfig {
    /// Interval used for refreshers whose timing is "pref" (metrics cadence) in §4.4.
    pub metrics_cadence: Duration,
    /// Duration of the network-error suppression window opened by kubeconfig transitions.
    pub suppression_window: Duration,
    /// Minimum spacing between successive metrics-only overlay applications for one
    /// `(domain, scope)` (§4.2 Metrics cadence guard).
    pub metrics_cadence_guard: Duration,
    /// Backend base-URL readiness retry policy.
    pub readiness_retry: ReadinessRetryPolicy,
}

impl Default for RefreshSystemConfig {
    fn default() -> Self {
        Self {
            metrics_cadence: Duration::from_millis(5000),
            suppression_window: Duration::from_secs(6),
            metrics_cadence_guard: Duration::from_millis(10_000),
            readiness_retry: ReadinessRetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_backoff_doubles_and_caps() {
        let policy = ReadinessRetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn timing_table_resolves_metrics_cadence() {
        let table = RefresherTimingTable::default();
        let timing = table.get("nodes").unwrap();
        assert_eq!(timing.interval, None);
        assert_eq!(timing.resolve_interval(Duration::from_millis(5000)), Duration::from_millis(5000));
    }
}
