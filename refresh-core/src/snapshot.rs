//! Snapshot and domain-state types shared by the snapshot client, the orchestrator, and the
//! reactive store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The lifecycle status of one domain (or domain, scope) snapshot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    /// Never fetched.
    Idle,
    /// First fetch in progress, no data yet.
    Loading,
    /// A hybrid/streaming domain priming its initial state.
    Initialising,
    /// A subsequent fetch in progress; stale data is still available.
    Updating,
    /// Data is present and current.
    Ready,
    /// The last fetch failed.
    Error,
}

/// A snapshot returned by a successful `200` fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The domain this snapshot belongs to.
    pub domain: String,
    /// The scope this snapshot was fetched for, if the domain is scoped.
    pub scope: Option<String>,
    /// A monotonically increasing version assigned by the backend.
    pub version: u64,
    /// An opaque checksum of the payload, if the backend supplies one.
    pub checksum: Option<String>,
    /// When the backend computed this snapshot.
    pub generated_at: chrono::DateTime<chrono::Utc>,
    /// A monotonically increasing per-domain sequence number.
    pub sequence: u64,
    /// The domain-specific payload.
    pub payload: Value,
    /// Backend-reported stats about the payload (row counts etc).
    pub stats: Value,
}

/// The per-(domain, scope) snapshot state held by the reactive store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSnapshotState {
    /// Current lifecycle status.
    pub status: SnapshotStatus,
    /// The last-applied payload, if any.
    pub data: Option<Value>,
    /// The last-applied stats, if any.
    pub stats: Option<Value>,
    /// The version of the last-applied snapshot.
    pub version: Option<u64>,
    /// The checksum of the last-applied snapshot.
    pub checksum: Option<String>,
    /// The ETag captured from the last `200` response, used for the next conditional GET.
    pub etag: Option<String>,
    /// When data was last applied (200 or 304 with existing data).
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
    /// When a manual fetch last completed.
    pub last_manual_refresh: Option<chrono::DateTime<chrono::Utc>>,
    /// When an automatic fetch last completed.
    pub last_auto_refresh: Option<chrono::DateTime<chrono::Utc>>,
    /// The last error message, if `status == Error`.
    pub error: Option<String>,
    /// Whether the fetch that produced the current state was manual.
    pub is_manual: Option<bool>,
    /// Count of automatic refreshes dropped because one was already in flight, or suppressed by
    /// the metrics cadence guard.
    pub dropped_auto_refreshes: u64,
    /// The scope this state is for, if the domain is scoped.
    pub scope: Option<String>,
}

impl Default for DomainSnapshotState {
    fn default() -> Self {
        Self {
            status: SnapshotStatus::Idle,
            data: None,
            stats: None,
            version: None,
            checksum: None,
            etag: None,
            last_updated: None,
            last_manual_refresh: None,
            last_auto_refresh: None,
            error: None,
            is_manual: None,
            dropped_auto_refreshes: 0,
            scope: None,
        }
    }
}

impl DomainSnapshotState {
    /// Build the in-flight/store key `"<domain>::<scope-or-*>"` for a (domain, scope) pair.
    pub fn key(domain: &str, scope: Option<&str>) -> String {
        format!("{domain}::{}", scope.unwrap_or("*"))
    }
}
