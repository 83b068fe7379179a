//! Error handling for the refresh core.
//!
//! [`RefreshError`] is the single error currency of the workspace. Most of it is never seen by a
//! caller directly: subscriber and fetch failures are captured as outcomes and mirrored onto
//! refresher/domain state instead of propagating, per the error taxonomy in the design
//! document. The variants here exist so that code which *does* need to inspect the failure
//! (the orchestrator's error policy, tests) has something typed to match on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured error payload returned by the backend, mirroring a Kubernetes-style `Status`
/// object closely enough to reuse the same permission-denied shape.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message} ({code}: {reason})")]
pub struct StatusPayload {
    /// Always `"Status"` for a well-formed payload; kept as a plain string since the core does
    /// not otherwise care about it.
    #[serde(default)]
    pub kind: String,
    /// Machine-readable reason, e.g. `"Forbidden"`.
    #[serde(default)]
    pub reason: String,
    /// HTTP-style numeric code, e.g. `403`.
    #[serde(default)]
    pub code: u16,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Optional breadcrumbs identifying what was denied.
    #[serde(default)]
    pub details: Option<StatusDetails>,
}

/// Breadcrumbs attached to a [`StatusPayload`] identifying the object a request was denied for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    /// The domain the request was scoped to, if any.
    pub domain: Option<String>,
    /// The Kubernetes resource type, if any.
    pub resource: Option<String>,
    /// The object kind, if any.
    pub kind: Option<String>,
    /// The object name, if any.
    pub name: Option<String>,
}

impl StatusPayload {
    /// `true` when this payload represents a permission-denied response (`403 Forbidden`).
    pub fn is_permission_denied(&self) -> bool {
        self.reason == "Forbidden" && self.code == 403
    }

    /// Format this payload into a single human-readable message, centralizing the
    /// detail-formatting logic that the original implementation duplicated between the
    /// snapshot client and the orchestrator (see design notes, open question (c)).
    pub fn format_permission_denied(&self) -> String {
        let mut breadcrumbs = Vec::new();
        if let Some(details) = &self.details {
            if let Some(domain) = &details.domain {
                breadcrumbs.push(format!("domain={domain}"));
            }
            if let Some(resource) = &details.resource {
                breadcrumbs.push(format!("resource={resource}"));
            }
            if let Some(kind) = &details.kind {
                breadcrumbs.push(format!("kind={kind}"));
            }
            if let Some(name) = &details.name {
                breadcrumbs.push(format!("name={name}"));
            }
        }
        let already_mentions_breadcrumbs =
            breadcrumbs.iter().all(|crumb| self.message.contains(crumb));
        if breadcrumbs.is_empty() || already_mentions_breadcrumbs {
            self.message.clone()
        } else {
            format!("{} ({})", self.message, breadcrumbs.join(", "))
        }
    }
}

/// The error currency of the refresh core.
#[derive(Error, Debug)]
pub enum RefreshError {
    /// The operation was cancelled (caller abort, context reset, disable/unregister). Never
    /// treated as a failure: does not increment `consecutive_errors` and is never surfaced to
    /// the user-facing error handler.
    #[error("refresh aborted")]
    Aborted,

    /// A transport-level failure whose message matches the suppression pattern
    /// (`failed to fetch`, `load failed`, `could not connect to the server`, `snapshot request
    /// failed`). Whether this is swallowed depends on the suppression window; see
    /// `refresh::orchestrator::errors`.
    #[error("network error: {0}")]
    NetworkTransient(String),

    /// A structured error response from the backend.
    #[error("backend error: {0}")]
    Backend(#[from] StatusPayload),

    /// A non-structured backend failure, e.g. a non-OK status with an unparseable body.
    #[error("snapshot request failed: {0}")]
    RequestFailed(String),

    /// The backend's refresh subsystem has not published a base URL yet.
    #[error("refresh subsystem not initialised")]
    NotReady,

    /// A named refresher or domain does not exist.
    #[error("unknown refresher or domain: {0}")]
    Unknown(String),

    /// A scoped domain was fetched with an empty (or missing) scope body.
    #[error("scoped domain {0:?} requires a non-empty scope")]
    EmptyScope(String),

    /// Failed to (de)serialize a snapshot payload.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RefreshError {
    /// Classify this error as it would be seen by the orchestrator's error policy (§7).
    pub fn category(&self) -> ErrorCategory {
        match self {
            RefreshError::Aborted => ErrorCategory::Abort,
            RefreshError::NetworkTransient(_) => ErrorCategory::NetworkTransient,
            RefreshError::Backend(status) if status.is_permission_denied() => {
                ErrorCategory::PermissionDenied
            }
            RefreshError::Backend(_) | RefreshError::RequestFailed(_) => ErrorCategory::Backend,
            RefreshError::NotReady => ErrorCategory::NetworkTransient,
            RefreshError::Unknown(_) | RefreshError::EmptyScope(_) | RefreshError::Serde(_) => {
                ErrorCategory::Fatal
            }
        }
    }

    /// `true` for messages matching the network-transient suppression pattern from §7.
    pub fn is_network_transient_message(message: &str) -> bool {
        const PATTERNS: &[&str] = &[
            "failed to fetch",
            "load failed",
            "could not connect to the server",
            "snapshot request failed",
        ];
        let lower = message.to_ascii_lowercase();
        PATTERNS.iter().any(|pattern| lower.contains(pattern))
    }

    /// `true` for messages indicating "catalog hydration incomplete" (tracked, never surfaced).
    pub fn is_hydration_pending_message(message: &str) -> bool {
        message.contains("catalog hydration incomplete")
    }

    /// `true` for messages indicating a stale object-details panel (tracked, never surfaced).
    pub fn is_object_not_found_message(message: &str) -> bool {
        let lower = message.to_ascii_lowercase();
        lower.contains("not found") || lower.contains("could not find")
    }
}

/// The error category used by the orchestrator's deduplication/suppression policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller- or system-driven cancellation; never surfaced.
    Abort,
    /// Transient network failure; surfaced only outside a suppression window.
    NetworkTransient,
    /// A structured 403/Forbidden payload.
    PermissionDenied,
    /// Any other backend-reported failure.
    Backend,
    /// All other errors; always surfaced (subject to hydration-pending/not-found filtering done
    /// by the caller for specific domains).
    Fatal,
}

/// Result type alias used throughout the workspace.
pub type Result<T, E = RefreshError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_formatting_avoids_duplicating_message_details() {
        let status = StatusPayload {
            kind: "Status".into(),
            reason: "Forbidden".into(),
            code: 403,
            message: "pods is forbidden".into(),
            details: Some(StatusDetails {
                domain: Some("pods".into()),
                resource: Some("pods".into()),
                kind: None,
                name: None,
            }),
        };
        assert!(status.is_permission_denied());
        let formatted = status.format_permission_denied();
        assert!(formatted.starts_with("pods is forbidden"));
        assert!(formatted.contains("resource=pods"));
    }

    #[test]
    fn network_transient_detection_is_case_insensitive() {
        assert!(RefreshError::is_network_transient_message(
            "Failed to Fetch: connection reset"
        ));
        assert!(!RefreshError::is_network_transient_message("boom"));
    }
}
