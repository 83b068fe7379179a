//! Error deduplication and suppression policy (§7 Error Handling Design).
//!
//! The orchestrator hands every fetch failure through here before deciding whether to move a
//! domain's state to `error` and whether to call the single external error handler. Dedup and
//! the suppression window are the two pieces of state that make this stateful rather than a pure
//! classifier.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use refresh_core::{ErrorCategory, RefreshError};

/// `"<domain>::<scope|__global__>"` key used by [`ErrorPolicy::lastNotifiedErrors`].
pub fn notification_key(domain: &str, scope: Option<&str>) -> String {
    format!("{domain}::{}", scope.unwrap_or("__global__"))
}

/// What the caller should do with a fetch failure, after dedup/suppression filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Not an error at all: don't touch state, don't notify.
    Ignore,
    /// Record on domain state, but never call the external handler (hydration-pending,
    /// object-not-found, or suppressed network-transient).
    RecordSilently,
    /// Record on domain state and call the external handler with this message.
    Notify(String),
}

/// Tracks the per-key last-notified message and the kubeconfig-transition suppression window.
pub struct ErrorPolicy {
    suppression_window: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    last_notified: HashMap<String, String>,
    suppressed_until: Option<Instant>,
}

impl ErrorPolicy {
    /// Construct a policy with the given suppression window duration (§3a `RefreshSystemConfig`).
    pub fn new(suppression_window: Duration) -> Self {
        Self {
            suppression_window,
            state: Mutex::new(State::default()),
        }
    }

    /// Open (or re-open) the suppression window starting now, called on `kubeconfig:changed` and
    /// `kubeconfig:selection-changed`.
    pub fn open_suppression_window(&self) {
        let mut state = self.state.lock();
        state.suppressed_until = Some(Instant::now() + self.suppression_window);
    }

    /// `true` while a suppression window is open.
    pub fn is_suppressed(&self) -> bool {
        self.state
            .lock()
            .suppressed_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Clear the `(domain, scope)` notification memory, called on success or `304`.
    pub fn clear(&self, domain: &str, scope: Option<&str>) {
        self.state
            .lock()
            .last_notified
            .remove(&notification_key(domain, scope));
    }

    /// Classify `error` for `(domain, scope)` is_object_details applies only to the
    /// `object-details` domain (§7 item 5).
    pub fn classify(
        &self,
        domain: &str,
        scope: Option<&str>,
        error: &RefreshError,
        is_object_details_domain: bool,
    ) -> ErrorDisposition {
        if matches!(error.category(), ErrorCategory::Abort) {
            return ErrorDisposition::Ignore;
        }

        let message = error.to_string();

        if RefreshError::is_hydration_pending_message(&message) {
            return ErrorDisposition::RecordSilently;
        }
        if is_object_details_domain && RefreshError::is_object_not_found_message(&message) {
            return ErrorDisposition::RecordSilently;
        }

        if matches!(error.category(), ErrorCategory::NetworkTransient) && self.is_suppressed() {
            return ErrorDisposition::RecordSilently;
        }

        let formatted = match error {
            RefreshError::Backend(payload) if payload.is_permission_denied() => {
                payload.format_permission_denied()
            }
            other => other.to_string(),
        };

        let key = notification_key(domain, scope);
        let mut state = self.state.lock();
        let already_notified = state.last_notified.get(&key) == Some(&formatted);
        state.last_notified.insert(key, formatted.clone());
        drop(state);

        if already_notified {
            ErrorDisposition::RecordSilently
        } else {
            ErrorDisposition::Notify(formatted)
        }
    }

    /// Clear suspended/blocked bookkeeping that a global reset or kubeconfig transition demands.
    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        state.last_notified.clear();
        state.suppressed_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refresh_core::StatusPayload;

    #[test]
    fn duplicate_message_is_not_renotified() {
        let policy = ErrorPolicy::new(Duration::from_secs(6));
        let error = RefreshError::RequestFailed("boom".into());
        let first = policy.classify("pods", None, &error, false);
        let second = policy.classify("pods", None, &error, false);
        assert_eq!(
            first,
            ErrorDisposition::Notify("snapshot request failed: boom".into())
        );
        assert_eq!(second, ErrorDisposition::RecordSilently);
    }

    #[test]
    fn clearing_allows_renotification() {
        let policy = ErrorPolicy::new(Duration::from_secs(6));
        let error = RefreshError::RequestFailed("boom".into());
        policy.classify("pods", None, &error, false);
        policy.clear("pods", None);
        let third = policy.classify("pods", None, &error, false);
        assert_eq!(
            third,
            ErrorDisposition::Notify("snapshot request failed: boom".into())
        );
    }

    #[test]
    fn network_transient_suppressed_inside_window() {
        let policy = ErrorPolicy::new(Duration::from_secs(6));
        policy.open_suppression_window();
        let error = RefreshError::NetworkTransient("failed to fetch".into());
        let disposition = policy.classify("pods", None, &error, false);
        assert_eq!(disposition, ErrorDisposition::RecordSilently);
    }

    #[test]
    fn permission_denied_uses_formatted_message() {
        let policy = ErrorPolicy::new(Duration::from_secs(6));
        let payload = StatusPayload {
            kind: "Status".into(),
            reason: "Forbidden".into(),
            code: 403,
            message: "pods is forbidden".into(),
            details: None,
        };
        let error = RefreshError::Backend(payload);
        let disposition = policy.classify("pods", None, &error, false);
        assert_eq!(disposition, ErrorDisposition::Notify("pods is forbidden".into()));
    }

    #[test]
    fn object_details_not_found_is_silent() {
        let policy = ErrorPolicy::new(Duration::from_secs(6));
        let error = RefreshError::RequestFailed("could not find object".into());
        let disposition = policy.classify("object-details", None, &error, true);
        assert_eq!(disposition, ErrorDisposition::RecordSilently);
    }
}
