//! Refresher configuration and state-machine types owned by the Refresh Manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The lifecycle state of a single refresher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefresherStatus {
    /// Enabled, not currently running, waiting for the next tick or manual trigger.
    Idle,
    /// A run is currently in progress.
    Refreshing,
    /// A run just finished; automatic ticks are gated until the cooldown elapses.
    Cooldown,
    /// The last run failed and no retry has been scheduled yet (transient display state; the
    /// refresher immediately moves on to `Cooldown`, see §4.1).
    Error,
    /// Paused, globally or individually; no timers are armed.
    Paused,
    /// Disabled; no timers are armed and manual triggers are rejected.
    Disabled,
}

/// Configuration for a single refresher, as passed to `RefreshManager::register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefresherConfig {
    /// Globally unique identifier.
    pub name: String,
    /// Milliseconds between automatic fires.
    pub interval: Duration,
    /// Milliseconds after each run before the next automatic fire is eligible.
    pub cooldown: Duration,
    /// Per-subscriber invocation timeout.
    pub timeout: Duration,
    /// Whether the refresher starts enabled. Defaults to `true`.
    pub enabled: bool,
}

impl RefresherConfig {
    /// Construct a config with the given timing, enabled by default.
    pub fn new(name: impl Into<String>, interval: Duration, cooldown: Duration, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            cooldown,
            timeout,
            enabled: true,
        }
    }

    /// Builder method: start disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// The observable state of a single refresher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefresherState {
    /// Current lifecycle status.
    pub status: RefresherStatus,
    /// Timestamp of the last completed run (success or failure), if any.
    pub last_refresh_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Timestamp the next automatic run is expected to fire, if known.
    pub next_refresh_time: Option<chrono::DateTime<chrono::Utc>>,
    /// The most recent error message, if the last run failed.
    pub error: Option<String>,
    /// Number of consecutive failed runs, reset to zero on success.
    pub consecutive_errors: u32,
}

impl Default for RefresherState {
    fn default() -> Self {
        Self {
            status: RefresherStatus::Disabled,
            last_refresh_time: None,
            next_refresh_time: None,
            error: None,
            consecutive_errors: 0,
        }
    }
}

/// Compute the cooldown duration for a run that just completed with `consecutive_errors`
/// recorded failures (0 after a success). See invariant 8: `base` on success or a single
/// failure, doubling per additional consecutive failure, capped at 60s.
pub fn cooldown_duration(base: Duration, consecutive_errors: u32) -> Duration {
    const CAP: Duration = Duration::from_millis(60_000);
    if consecutive_errors <= 1 {
        return base;
    }
    let exponent = consecutive_errors - 1;
    let factor = 2u64.saturating_pow(exponent);
    let scaled = base
        .as_millis()
        .saturating_mul(factor as u128)
        .min(CAP.as_millis());
    Duration::from_millis(scaled as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_is_base_for_zero_or_one_errors() {
        let base = Duration::from_millis(1000);
        assert_eq!(cooldown_duration(base, 0), base);
        assert_eq!(cooldown_duration(base, 1), base);
    }

    #[test]
    fn cooldown_doubles_and_caps_at_sixty_seconds() {
        let base = Duration::from_millis(1000);
        assert_eq!(cooldown_duration(base, 2), Duration::from_millis(2000));
        assert_eq!(cooldown_duration(base, 3), Duration::from_millis(4000));
        assert_eq!(cooldown_duration(base, 20), Duration::from_millis(60_000));
    }
}
