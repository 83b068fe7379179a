//! Domain configuration types owned by the Refresh Orchestrator.

use serde::{Deserialize, Serialize};

/// The category a domain belongs to, used to gate namespace-only domains on context and to
/// compute context-driven manual refresh targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainCategory {
    /// A process-wide domain with no cluster/namespace binding (e.g. `namespaces`, `catalog`).
    System,
    /// A domain scoped to a single cluster (e.g. `nodes`, `cluster-events`).
    Cluster,
    /// A domain scoped to a single namespace; only enabled while the namespace context is
    /// active.
    Namespace,
}

/// Streaming-related flags and capabilities attached to a domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingFlags {
    /// When the stream is active and healthy, automatic snapshot ticks only update usage fields
    /// on matching rows rather than replacing the payload (§4.2 Metrics-only overlay).
    pub metrics_only: bool,
    /// Disable the underlying refresher's timer while a stream for this domain is active.
    pub pause_refresher_when_streaming: bool,
}

/// Static configuration for a data domain, as passed to `RefreshOrchestrator::register_domain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// The domain's own identifier, also used as the default refresher name.
    pub name: String,
    /// The underlying refresher's name (usually equal to `name`).
    pub refresher: String,
    /// The domain's category.
    pub category: DomainCategory,
    /// Whether this domain stores one state per scope string (`true`) or a single global state
    /// (`false`).
    pub scoped: bool,
    /// Whether this domain has a streaming provider at all.
    pub streaming: Option<StreamingFlags>,
    /// Start the underlying refresher/stream immediately on registration.
    pub auto_start: bool,
    /// A fixed scope body this domain always uses, overriding resolver/user-set scopes (the
    /// §4.2 scope-pinning rules: `nodes`/cluster resources -> empty, `cluster-events` ->
    /// `"cluster"`, `cluster-overview` -> empty/single-cluster).
    pub pinned_body: Option<String>,
}

impl DomainConfig {
    /// Construct a non-scoped, non-streaming domain.
    pub fn new(name: impl Into<String>, category: DomainCategory) -> Self {
        let name = name.into();
        Self {
            refresher: name.clone(),
            name,
            category,
            scoped: false,
            streaming: None,
            auto_start: false,
            pinned_body: None,
        }
    }

    /// Builder method: mark this domain as scoped (one state per scope string).
    #[must_use]
    pub fn scoped(mut self) -> Self {
        self.scoped = true;
        self
    }

    /// Builder method: attach streaming flags.
    #[must_use]
    pub fn with_streaming(mut self, flags: StreamingFlags) -> Self {
        self.streaming = Some(flags);
        self
    }

    /// Builder method: set `auto_start`.
    #[must_use]
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Builder method: pin this domain's scope body.
    #[must_use]
    pub fn with_pinned_body(mut self, body: impl Into<String>) -> Self {
        self.pinned_body = Some(body.into());
        self
    }

    /// Builder method: use a different underlying refresher name than `name`.
    #[must_use]
    pub fn with_refresher(mut self, refresher: impl Into<String>) -> Self {
        self.refresher = refresher.into();
        self
    }

    /// `true` if this domain declares `streaming.metrics_only`.
    pub fn is_metrics_only(&self) -> bool {
        self.streaming.is_some_and(|s| s.metrics_only)
    }

    /// `true` if this domain has a streaming provider at all.
    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }
}
