//! The Snapshot Client: backend base-URL readiness, conditional snapshot GETs, and
//! permission-denied formatting.
//!
//! Retry/backoff is built on `backon` rather than hand-rolled loops: the policy is
//! [`refresh_core::ReadinessRetryPolicy`] and the transport itself is a small trait object so the
//! client can be tested without a real HTTP stack.

use std::sync::Arc;
use std::time::Duration;

use backon::{Backoff, BackoffBuilder, ExponentialBuilder};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use refresh_core::{RefreshError, RefreshSystemConfig, Result, Snapshot, StatusDetails, StatusPayload};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A single HTTP-ish response as seen by the snapshot client: enough to interpret 200/304/other
/// without tying the client to a concrete HTTP crate.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The response status code.
    pub status: http::StatusCode,
    /// The `ETag` response header, if present (only meaningful on 200).
    pub etag: Option<String>,
    /// The raw response body.
    pub body: bytes::Bytes,
}

/// The backend transport the snapshot client drives. Implemented by the host application; the
/// core only ever sees this narrow surface, mirroring how the distilled spec treats the backend
/// HTTP server as an external collaborator.
pub trait RefreshBackend: Send + Sync + 'static {
    /// Resolve the current backend base URL. May fail with a message matching
    /// `"refresh subsystem not initialised"` while the backend is still starting up.
    fn get_base_url(&self) -> BoxFuture<'static, std::result::Result<String, String>>;

    /// Perform a conditional `GET` against `path`, carrying `If-None-Match` when supplied.
    fn get(
        &self,
        path: String,
        if_none_match: Option<String>,
    ) -> BoxFuture<'static, std::result::Result<RawResponse, String>>;

    /// Perform a `POST` of a JSON body against `path`.
    fn post_json(
        &self,
        path: String,
        body: Value,
    ) -> BoxFuture<'static, std::result::Result<RawResponse, String>>;
}

/// The outcome of a snapshot fetch once the client has interpreted the response status.
#[derive(Debug, Clone)]
pub enum SnapshotResponse {
    /// `304 Not Modified`: the caller should keep its existing data.
    NotModified,
    /// `200`: a fresh snapshot, with the `ETag` captured for the next conditional GET.
    Fetched {
        /// The parsed snapshot body.
        snapshot: Snapshot,
        /// The `ETag` to store for the next request, if the backend supplied one.
        etag: Option<String>,
    },
}

/// Parameters for one snapshot fetch.
#[derive(Debug, Clone, Default)]
pub struct SnapshotRequest {
    /// The scope to request, if the domain is scoped.
    pub scope: Option<String>,
    /// The `If-None-Match` value to send, if the caller has a cached ETag.
    pub if_none_match: Option<String>,
}

/// The snapshot client: resolves the backend base URL with readiness retry, performs conditional
/// GETs with transient retry, and formats permission-denied payloads.
pub struct SnapshotClient {
    backend: Arc<dyn RefreshBackend>,
    config: RefreshSystemConfig,
    base_url: Mutex<Option<String>>,
}

impl SnapshotClient {
    /// Construct a client over `backend`, using `config`'s readiness retry policy.
    pub fn new(backend: Arc<dyn RefreshBackend>, config: RefreshSystemConfig) -> Self {
        Self {
            backend,
            config,
            base_url: Mutex::new(None),
        }
    }

    /// Drop any cached base URL, forcing the next call to re-resolve it.
    pub fn invalidate_refresh_base_url(&self) {
        *self.base_url.lock() = None;
    }

    /// Resolve (and cache) the backend base URL, retrying while the backend reports it has not
    /// initialised yet.
    pub async fn ensure_refresh_base_url(&self) -> Result<String> {
        if let Some(cached) = self.base_url.lock().clone() {
            return Ok(cached);
        }

        let policy = self.config.readiness_retry;
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(policy.initial_backoff)
            .with_max_delay(policy.max_backoff)
            .with_factor(2.0)
            .with_max_times(policy.max_attempts as usize)
            .build();

        let resolved = loop {
            match self.backend.get_base_url().await {
                Ok(url) => break url,
                Err(message) if is_not_initialised_message(&message) => match backoff.next() {
                    Some(delay) => {
                        trace!(error = %message, delay = ?delay, "refresh base url not ready, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(RefreshError::NotReady),
                },
                Err(message) => return Err(RefreshError::RequestFailed(message)),
            }
        };

        debug!(base_url = %resolved, "resolved refresh base url");
        *self.base_url.lock() = Some(resolved.clone());
        Ok(resolved)
    }

    /// Fetch a snapshot for `domain`, honoring `token` for cancellation and retrying transient
    /// transport failures up to twice.
    pub async fn fetch_snapshot(
        &self,
        domain: &str,
        request: SnapshotRequest,
        token: CancellationToken,
    ) -> Result<SnapshotResponse> {
        self.ensure_refresh_base_url().await?;
        let path = snapshot_path(domain, request.scope.as_deref());

        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_factor(2.0)
            .with_max_times(2)
            .build();

        let raw = loop {
            if token.is_cancelled() {
                return Err(RefreshError::Aborted);
            }
            let attempt = tokio::select! {
                biased;
                () = token.cancelled() => Err(TransportOutcome::Aborted),
                result = self.backend.get(path.clone(), request.if_none_match.clone()) => {
                    result.map_err(TransportOutcome::Message)
                }
            };
            match attempt {
                Ok(raw) => break raw,
                Err(TransportOutcome::Aborted) => return Err(RefreshError::Aborted),
                Err(TransportOutcome::Message(message))
                    if RefreshError::is_network_transient_message(&message) =>
                {
                    match backoff.next() {
                        Some(delay) => {
                            trace!(delay = ?delay, "retrying transient snapshot fetch failure");
                            self.invalidate_refresh_base_url();
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(RefreshError::NetworkTransient(message)),
                    }
                }
                Err(TransportOutcome::Message(message)) => {
                    return Err(RefreshError::RequestFailed(message));
                }
            }
        };

        interpret_snapshot_response(raw)
    }

    /// Fetch the telemetry summary payload.
    pub async fn fetch_telemetry_summary(&self) -> Result<Value> {
        self.ensure_refresh_base_url().await?;
        let raw = self
            .backend
            .get("/api/v2/telemetry/summary".to_string(), None)
            .await
            .map_err(RefreshError::RequestFailed)?;
        if raw.status.is_success() {
            serde_json::from_slice(&raw.body).map_err(RefreshError::from)
        } else {
            Err(parse_error_body(raw.status, &raw.body))
        }
    }

    /// Toggle backend metrics collection.
    pub async fn set_metrics_active(&self, active: bool) -> Result<()> {
        self.ensure_refresh_base_url().await?;
        let raw = self
            .backend
            .post_json(
                "/api/v2/metrics/active".to_string(),
                serde_json::json!({ "active": active }),
            )
            .await
            .map_err(RefreshError::RequestFailed)?;
        if raw.status.is_success() {
            Ok(())
        } else {
            Err(parse_error_body(raw.status, &raw.body))
        }
    }
}

#[derive(Debug, Clone)]
enum TransportOutcome {
    Aborted,
    Message(String),
}

fn snapshot_path(domain: &str, scope: Option<&str>) -> String {
    match scope {
        Some(scope) if !scope.is_empty() => {
            format!("/api/v2/snapshots/{domain}?scope={scope}")
        }
        _ => format!("/api/v2/snapshots/{domain}"),
    }
}

fn is_not_initialised_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("refresh subsystem not initialised")
}

fn interpret_snapshot_response(raw: RawResponse) -> Result<SnapshotResponse> {
    match raw.status {
        status if status == http::StatusCode::NOT_MODIFIED => Ok(SnapshotResponse::NotModified),
        status if status.is_success() => {
            let snapshot: Snapshot = serde_json::from_slice(&raw.body)?;
            Ok(SnapshotResponse::Fetched {
                snapshot,
                etag: raw.etag,
            })
        }
        status => {
            warn!(status = status.as_u16(), "snapshot request failed");
            Err(parse_error_body(status, &raw.body))
        }
    }
}

fn parse_error_body(status: http::StatusCode, body: &[u8]) -> RefreshError {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return RefreshError::RequestFailed(fallback_message(status));
    };

    if value.get("kind").and_then(Value::as_str) == Some("Status") {
        if let Ok(payload) = serde_json::from_value::<StatusPayload>(value.clone()) {
            if payload.is_permission_denied() {
                return RefreshError::Backend(payload);
            }
            if !payload.message.is_empty() {
                return RefreshError::RequestFailed(payload.message);
            }
        }
    }

    if let Some(message) = value.get("message").and_then(Value::as_str) {
        return RefreshError::RequestFailed(message.to_string());
    }

    RefreshError::RequestFailed(fallback_message(status))
}

fn fallback_message(status: http::StatusCode) -> String {
    format!(
        "Snapshot request failed: {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}

/// Format a backend status payload's breadcrumbs, used by callers that need the plain detail
/// struct rather than the payload's own [`StatusPayload::format_permission_denied`].
pub fn format_details(details: &StatusDetails) -> Vec<String> {
    let mut parts = Vec::new();
    if let Some(domain) = &details.domain {
        parts.push(format!("domain={domain}"));
    }
    if let Some(resource) = &details.resource {
        parts.push(format!("resource={resource}"));
    }
    if let Some(kind) = &details.kind {
        parts.push(format!("kind={kind}"));
    }
    if let Some(name) = &details.name {
        parts.push(format!("name={name}"));
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyBackend {
        base_url_calls: AtomicUsize,
        get_calls: AtomicUsize,
    }

    impl RefreshBackend for FlakyBackend {
        fn get_base_url(&self) -> BoxFuture<'static, std::result::Result<String, String>> {
            let attempt = self.base_url_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if attempt == 0 {
                    Err("refresh subsystem not initialised".to_string())
                } else {
                    Ok("http://backend.local".to_string())
                }
            })
        }

        fn get(
            &self,
            _path: String,
            _if_none_match: Option<String>,
        ) -> BoxFuture<'static, std::result::Result<RawResponse, String>> {
            let attempt = self.get_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if attempt == 0 {
                    Err("failed to fetch".to_string())
                } else {
                    Ok(RawResponse {
                        status: http::StatusCode::OK,
                        etag: Some("v2".to_string()),
                        body: bytes::Bytes::from(
                            serde_json::json!({
                                "domain": "pods",
                                "scope": null,
                                "version": 2,
                                "checksum": null,
                                "generatedAt": "2024-01-01T00:00:00Z",
                                "sequence": 1,
                                "payload": {},
                                "stats": {}
                            })
                            .to_string(),
                        ),
                    })
                }
            })
        }

        fn post_json(
            &self,
            _path: String,
            _body: Value,
        ) -> BoxFuture<'static, std::result::Result<RawResponse, String>> {
            Box::pin(async move {
                Ok(RawResponse {
                    status: http::StatusCode::OK,
                    etag: None,
                    body: bytes::Bytes::new(),
                })
            })
        }
    }

    #[tokio::test]
    async fn readiness_retries_then_resolves() {
        let backend = Arc::new(FlakyBackend {
            base_url_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        });
        let client = SnapshotClient::new(backend, RefreshSystemConfig::default());
        let url = client.ensure_refresh_base_url().await.unwrap();
        assert_eq!(url, "http://backend.local");
    }

    #[tokio::test]
    async fn transient_get_failure_is_retried() {
        let backend = Arc::new(FlakyBackend {
            base_url_calls: AtomicUsize::new(1),
            get_calls: AtomicUsize::new(0),
        });
        let client = SnapshotClient::new(backend, RefreshSystemConfig::default());
        let result = client
            .fetch_snapshot("pods", SnapshotRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        match result {
            SnapshotResponse::Fetched { snapshot, etag } => {
                assert_eq!(snapshot.version, 2);
                assert_eq!(etag.as_deref(), Some("v2"));
            }
            SnapshotResponse::NotModified => panic!("expected a fetched snapshot"),
        }
    }

    #[test]
    fn permission_denied_body_parses_to_backend_error() {
        let body = serde_json::json!({
            "kind": "Status",
            "reason": "Forbidden",
            "code": 403,
            "message": "pods is forbidden",
            "details": { "domain": "pods" }
        })
        .to_string();
        let error = parse_error_body(http::StatusCode::FORBIDDEN, body.as_bytes());
        match error {
            RefreshError::Backend(payload) => assert!(payload.is_permission_denied()),
            other => panic!("expected Backend error, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_body_falls_back_to_status_text() {
        let error = parse_error_body(http::StatusCode::INTERNAL_SERVER_ERROR, b"not json");
        match error {
            RefreshError::RequestFailed(message) => {
                assert!(message.contains("500"));
            }
            other => panic!("expected RequestFailed, got {other:?}"),
        }
    }
}
