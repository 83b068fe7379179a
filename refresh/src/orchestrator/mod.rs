//! The Refresh Orchestrator: domain registration, scope resolution, the snapshot fetch lifecycle,
//! streaming lifecycle, and the metrics-only overlay.
//!
//! Built on top of the Refresh Manager rather than reimplementing timers itself: the orchestrator
//! registers one manager refresher per domain and supplies the subscriber callback that actually
//! talks to the snapshot client. State lives behind a single `parking_lot::Mutex`, mirroring
//! `RefreshManager`'s single-writer discipline.

pub mod errors;
pub mod metrics_overlay;
pub mod scope_normalize;
pub mod streaming;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use refresh_core::{
    ContextUpdate, DomainCategory, DomainConfig, DomainSnapshotState, RefreshContext, RefreshError,
    RefresherConfig, RefresherTiming, RefreshSystemConfig, Result, Snapshot, SnapshotStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::client::{SnapshotClient, SnapshotRequest, SnapshotResponse};
use crate::event_bus::{EventBus, InboundEvent, OutboundEvent};
use crate::manager::{RefreshManager, SubscriberFuture, SubscriberResult};
use crate::store;

use errors::ErrorPolicy;
use metrics_overlay::MetricsDomain;
use streaming::{StreamingCleanup, StreamingTable};

/// Providers a host application registers to actually start a resource watch for a streaming
/// domain. The orchestrator only tracks lifecycle; it never knows how a stream is implemented.
pub trait StreamingProvider: Send + Sync + 'static {
    /// Start streaming `scope` for `domain`, returning a cleanup handle invoked on stop.
    fn start(&self, domain: String, scope: String) -> BoxFuture<'static, StreamingCleanup>;

    /// Ask an already-running stream to push a fresh read, instead of tearing it down. `None`
    /// (the default) tells the orchestrator no such hook exists, so it falls back to a
    /// stop-then-start cycle.
    fn refresh_once(&self, _domain: String, _scope: String) -> Option<BoxFuture<'static, ()>> {
        None
    }
}

/// Parameters for one snapshot fetch via [`RefreshOrchestrator::fetch_scoped_domain`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Whether this fetch is user-initiated (preempts any in-flight automatic fetch for the same
    /// key rather than being dropped by it).
    pub is_manual: bool,
    /// Cancellation token honored by the snapshot client's transport race.
    pub token: CancellationToken,
}

impl FetchOptions {
    /// A manual fetch with a fresh, unlinked cancellation token.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            is_manual: true,
            token: CancellationToken::new(),
        }
    }

    /// An automatic fetch driven by `token` (normally the refresher's run token).
    #[must_use]
    pub fn automatic(token: CancellationToken) -> Self {
        Self {
            is_manual: false,
            token,
        }
    }
}

struct DomainEntry {
    config: DomainConfig,
    enabled: bool,
    scoped_enabled: HashMap<String, bool>,
    scope_override: Option<String>,
    provider: Option<Arc<dyn StreamingProvider>>,
    /// The scope a non-scoped streaming domain is currently streaming, if any; compared against
    /// the freshly-normalized scope on every `update_context` to decide whether to restart it.
    active_stream_scope: Option<String>,
}

/// What a domain's enablement looked like just before `kubeconfig:changing` suspended it, so the
/// suspension can be reasoned about (and, if a future caller wants it, restored) rather than
/// silently lost.
struct SuspendedDomain {
    enabled: bool,
    scoped_enabled: HashMap<String, bool>,
}

struct InFlight {
    token: CancellationToken,
    request_id: u64,
}

struct State {
    domains: HashMap<String, DomainEntry>,
    context_version: u64,
    metrics_cadence_last: HashMap<String, Instant>,
    suspended_domains: HashMap<String, SuspendedDomain>,
}

struct Inner {
    state: Mutex<State>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    manager: RefreshManager,
    store: store::Writer,
    client: Arc<SnapshotClient>,
    events: Arc<EventBus>,
    error_policy: ErrorPolicy,
    streaming: StreamingTable,
    config: RefreshSystemConfig,
    timing: refresh_core::RefresherTimingTable,
    request_counter: AtomicU64,
}

/// The Refresh Orchestrator: a cheaply-`Clone`able handle to the shared domain registry.
#[derive(Clone)]
pub struct RefreshOrchestrator(Arc<Inner>);

impl RefreshOrchestrator {
    /// Construct a new orchestrator wired onto an existing manager, store, snapshot client, and
    /// event bus. Spawns the inbound event reaction loop.
    pub fn new(
        manager: RefreshManager,
        store: store::Writer,
        client: Arc<SnapshotClient>,
        events: Arc<EventBus>,
        config: RefreshSystemConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                domains: HashMap::new(),
                context_version: 0,
                metrics_cadence_last: HashMap::new(),
                suspended_domains: HashMap::new(),
            }),
            in_flight: Mutex::new(HashMap::new()),
            manager,
            store,
            client,
            events,
            error_policy: ErrorPolicy::new(config.suppression_window),
            streaming: StreamingTable::default(),
            config,
            request_counter: AtomicU64::new(0),
        });
        let orchestrator = Self(inner);
        orchestrator.spawn_event_loop();
        orchestrator
    }

    fn spawn_event_loop(&self) {
        let orchestrator = self.clone();
        let mut rx = self.0.events.subscribe_inbound();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                orchestrator.handle_inbound_event(event).await;
            }
        });
    }

    async fn handle_inbound_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::ViewReset => self.handle_view_reset().await,
            InboundEvent::KubeconfigChanging => self.handle_kubeconfig_changing().await,
            InboundEvent::KubeconfigChanged => self.handle_kubeconfig_changed().await,
            InboundEvent::KubeconfigSelectionChanged => self.handle_kubeconfig_selection_changed().await,
            InboundEvent::ResourceStreamDrift { domain, scope, reason } => {
                self.handle_resource_stream_drift(&domain, &scope, &reason).await;
            }
        }
    }

    /// The common teardown both `view:reset` and `kubeconfig:changing` perform: cancel every
    /// in-progress refresh, tear down every stream, clear dedup/suppression memory, invalidate
    /// the cached base URL, and bump the generation counter so any in-flight fetch's result gets
    /// discarded on arrival.
    async fn reset_core(&self) {
        self.0.manager.cancel_all_refreshes();
        self.0.store.reset_all_scoped_domain_states();
        self.0.streaming.reset_all().await;
        self.0.error_policy.clear_all();
        self.0.client.invalidate_refresh_base_url();
        let mut state = self.0.state.lock();
        state.context_version += 1;
        state.metrics_cadence_last.clear();
    }

    async fn handle_view_reset(&self) {
        debug!("orchestrator.view-reset");
        self.reset_core().await;
        let mut state = self.0.state.lock();
        for entry in state.domains.values_mut() {
            entry.scope_override = None;
            entry.active_stream_scope = None;
        }
    }

    async fn handle_kubeconfig_changing(&self) {
        debug!("orchestrator.kubeconfig-changing");
        self.reset_core().await;
        self.0.manager.pause(None);
        let mut state = self.0.state.lock();
        let State { domains, suspended_domains, .. } = &mut *state;
        suspended_domains.clear();
        for (name, entry) in domains.iter_mut() {
            suspended_domains.insert(
                name.clone(),
                SuspendedDomain {
                    enabled: entry.enabled,
                    scoped_enabled: entry.scoped_enabled.clone(),
                },
            );
            entry.scoped_enabled.clear();
            entry.scope_override = None;
            entry.active_stream_scope = None;
        }
    }

    async fn handle_kubeconfig_changed(&self) {
        debug!("orchestrator.kubeconfig-changed");
        self.0.client.invalidate_refresh_base_url();
        {
            let mut state = self.0.state.lock();
            state.context_version += 1;
            state.suspended_domains.clear();
        }
        self.0.error_policy.open_suppression_window();
        self.0.streaming.clear_blocked().await;
        self.0.manager.resume(None);
        self.0.manager.trigger_manual_refresh_for_context(None).await;
    }

    async fn handle_kubeconfig_selection_changed(&self) {
        debug!("orchestrator.kubeconfig-selection-changed");
        self.0.client.invalidate_refresh_base_url();
        {
            let mut state = self.0.state.lock();
            state.context_version += 1;
            state.metrics_cadence_last.clear();
        }
        self.0.error_policy.open_suppression_window();
        self.0.streaming.clear_blocked().await;
        self.0.manager.trigger_manual_refresh_for_context(None).await;
    }

    async fn handle_resource_stream_drift(&self, domain: &str, scope: &str, reason: &str) {
        warn!(domain, scope, reason, "orchestrator.resource-stream-drift");
        let key = StreamingTable::key(domain, scope);
        self.0.streaming.block(&key).await;
        self.0.streaming.stop_active(&key).await;
    }

    /// Register a domain with no streaming provider.
    pub fn register_domain(&self, config: DomainConfig) {
        self.register_domain_with_provider(config, None);
    }

    /// Register a domain, optionally attaching the streaming provider a host application
    /// implements to actually start a resource watch.
    pub fn register_domain_with_provider(
        &self,
        config: DomainConfig,
        provider: Option<Arc<dyn StreamingProvider>>,
    ) {
        let refresher_name = config.refresher.clone();
        let domain_name = config.name.clone();
        let initial_enabled = if config.scoped { false } else { config.auto_start };

        {
            let mut state = self.0.state.lock();
            state.domains.insert(
                domain_name.clone(),
                DomainEntry {
                    config: config.clone(),
                    enabled: initial_enabled,
                    scoped_enabled: HashMap::new(),
                    scope_override: None,
                    provider,
                    active_stream_scope: None,
                },
            );
        }

        let timing = self.timing_for(&refresher_name);
        let interval = timing.resolve_interval(self.0.config.metrics_cadence);
        let mut refresher_config =
            RefresherConfig::new(refresher_name.clone(), interval, timing.cooldown, timing.timeout);
        if !initial_enabled {
            refresher_config = refresher_config.disabled();
        }
        self.0.manager.register(refresher_config);

        let orchestrator = self.clone();
        let callback_domain = domain_name.clone();
        self.0.manager.subscribe(
            &refresher_name,
            Arc::new(move |is_manual, token| -> SubscriberFuture {
                let orchestrator = orchestrator.clone();
                let domain_name = callback_domain.clone();
                Box::pin(async move { orchestrator.run_domain_refresh(&domain_name, is_manual, token).await })
            }),
        );

        if config.auto_start && config.is_streaming() {
            let orchestrator = self.clone();
            let domain_name = domain_name.clone();
            tokio::spawn(async move {
                let _ = orchestrator.start_streaming_domain(&domain_name, None).await;
            });
        }
    }

    fn timing_for(&self, refresher_name: &str) -> RefresherTiming {
        // Dynamically registered per-kind object domains (`object-Pod`, `object-Pod-events`, ...)
        // have no static entry; fall back to the `object-details`/`object-events` timing by
        // stripping the kind, or a conservative default if that also doesn't match.
        const FALLBACK: RefresherTiming = RefresherTiming {
            interval: Some(Duration::from_millis(5000)),
            cooldown: Duration::from_millis(1000),
            timeout: Duration::from_secs(10),
        };
        self.0
            .config
            .readiness_retry
            .max_attempts
            .checked_sub(0); // keep `config` borrow shape stable for future per-domain overrides
        refresh_core::RefresherTimingTable::default()
            .get(refresher_name)
            .or_else(|| {
                if refresher_name.starts_with("object-") && refresher_name.ends_with("-events") {
                    refresh_core::RefresherTimingTable::default().get("object-events")
                } else if refresher_name.starts_with("object-") {
                    refresh_core::RefresherTimingTable::default().get("object-details")
                } else {
                    None
                }
            })
            .unwrap_or(FALLBACK)
    }

    /// `true` if the currently active UI view actually corresponds to `domain` — the same
    /// namespace-view/cluster-view correspondence the manager's own context-targeting uses to
    /// pick refresh targets (see `RefreshManager`'s `context_targets`). A domain that the user
    /// isn't currently looking at has no business opening a live stream.
    fn active_view_matches_domain(domain: &DomainConfig, context: &RefreshContext) -> bool {
        match domain.category {
            DomainCategory::System => true,
            DomainCategory::Cluster => {
                context.current_view == Some(refresh_core::View::Cluster)
                    && context.active_cluster_view.as_deref() == Some(domain.name.as_str())
            }
            DomainCategory::Namespace => {
                context.current_view == Some(refresh_core::View::Namespace)
                    && context.active_namespace_view.as_deref() == Some(domain.name.as_str())
            }
        }
    }

    fn domain_snapshot(&self, name: &str) -> Option<DomainConfig> {
        self.0.state.lock().domains.get(name).map(|e| e.config.clone())
    }

    fn metrics_domain_for(config: &DomainConfig) -> Option<MetricsDomain> {
        if !config.is_metrics_only() {
            return None;
        }
        if config.name.contains("workload") {
            Some(MetricsDomain::Workloads)
        } else if config.name.contains("node") {
            Some(MetricsDomain::Nodes)
        } else {
            Some(MetricsDomain::Pods)
        }
    }

    /// Merge a context update (lowercasing the object panel's kind first) and forward it to the
    /// manager, reconciling namespace-category domain enablement on namespace deactivation.
    pub async fn update_context(&self, mut update: ContextUpdate) -> refresh_core::ContextTransition {
        if let Some(panel) = update.object_panel.as_mut() {
            if let Some(kind) = panel.object_kind.as_mut() {
                *kind = kind.to_lowercase();
            }
        }

        let transition = self.0.manager.update_context(update).await;

        if transition.namespace_changed {
            self.0.state.lock().context_version += 1;
            let context = self.0.manager.current_context();
            let active = context.selected_namespace.is_some();
            let namespace_domains: Vec<String> = self
                .0
                .state
                .lock()
                .domains
                .iter()
                .filter(|(_, e)| e.config.category == DomainCategory::Namespace)
                .map(|(name, _)| name.clone())
                .collect();
            for name in namespace_domains {
                if active {
                    self.set_domain_enabled(&name, true);
                } else {
                    self.set_domain_enabled(&name, false);
                }
            }
        }

        self.restart_non_scoped_streams_on_context_change().await;

        transition
    }

    /// Recompute the normalized scope of every non-scoped streaming domain and restart any whose
    /// scope changed (e.g. the selected cluster moved).
    async fn restart_non_scoped_streams_on_context_change(&self) {
        let context = self.0.manager.current_context();
        let candidates: Vec<(String, DomainConfig, String, Option<String>)> = {
            let state = self.0.state.lock();
            state
                .domains
                .iter()
                .filter(|(_, e)| !e.config.scoped && e.config.is_streaming())
                .filter_map(|(name, e)| {
                    let new_scope = scope_normalize::normalize(&e.config, &context, None).ok()?;
                    Some((name.clone(), e.config.clone(), new_scope, e.active_stream_scope.clone()))
                })
                .collect()
        };

        for (name, config, new_scope, old_scope) in candidates {
            if old_scope.as_deref() == Some(new_scope.as_str()) {
                continue;
            }

            let was_streaming = match &old_scope {
                Some(old) => self.0.streaming.is_tracked(&StreamingTable::key(&name, old)).await,
                None => false,
            };

            if let Some(entry) = self.0.state.lock().domains.get_mut(&name) {
                entry.active_stream_scope = Some(new_scope.clone());
            }

            if was_streaming {
                if let Some(old) = &old_scope {
                    self.stop_streaming_domain_at(&name, &config, old).await;
                }
                let _ = self.start_streaming_domain(&name, Some(&new_scope)).await;
            }
        }
    }

    /// The context as most recently merged.
    pub fn current_context(&self) -> RefreshContext {
        self.0.manager.current_context()
    }

    /// The foreground cluster id, per the current context.
    pub fn get_selected_cluster_id(&self) -> Option<String> {
        self.current_context().selected_cluster_id
    }

    /// The selected namespace, per the current context.
    pub fn get_selected_namespace(&self) -> Option<String> {
        self.current_context().selected_namespace
    }

    /// `true` if `name` names a domain with a streaming provider.
    pub fn is_streaming_domain(&self, name: &str) -> bool {
        self.0
            .state
            .lock()
            .domains
            .get(name)
            .is_some_and(|e| e.config.is_streaming())
    }

    /// Enable or disable a non-scoped domain's underlying refresher.
    pub fn set_domain_enabled(&self, name: &str, enabled: bool) {
        let refresher = {
            let mut state = self.0.state.lock();
            let Some(entry) = state.domains.get_mut(name) else {
                return;
            };
            entry.enabled = enabled;
            entry.config.refresher.clone()
        };
        if enabled {
            self.0.manager.enable(&refresher);
        } else {
            self.0.manager.disable(&refresher);
        }
    }

    /// Enable or disable one scope of a scoped domain. The underlying refresher is enabled as
    /// long as at least one scope is enabled, and disabled once none are.
    pub fn set_scoped_domain_enabled(&self, name: &str, scope: &str, enabled: bool) {
        let (refresher, any_enabled) = {
            let mut state = self.0.state.lock();
            let Some(entry) = state.domains.get_mut(name) else {
                return;
            };
            entry.scoped_enabled.insert(scope.to_string(), enabled);
            let any_enabled = entry.scoped_enabled.values().any(|v| *v);
            (entry.config.refresher.clone(), any_enabled)
        };
        if any_enabled {
            self.0.manager.enable(&refresher);
        } else {
            self.0.manager.disable(&refresher);
        }
    }

    /// Pin a scope override for `name`, used as the default body when no explicit scope is
    /// passed to a fetch.
    pub fn set_domain_scope(&self, name: &str, scope: impl Into<String>) {
        if let Some(entry) = self.0.state.lock().domains.get_mut(name) {
            entry.scope_override = Some(scope.into());
        }
    }

    /// Clear a previously pinned scope override.
    pub fn clear_domain_scope(&self, name: &str) {
        if let Some(entry) = self.0.state.lock().domains.get_mut(name) {
            entry.scope_override = None;
        }
    }

    /// Read a domain's pinned scope override, if any.
    pub fn get_domain_scope(&self, name: &str) -> Option<String> {
        self.0
            .state
            .lock()
            .domains
            .get(name)
            .and_then(|e| e.scope_override.clone())
    }

    fn enabled_scopes(&self, name: &str) -> Vec<String> {
        self.0
            .state
            .lock()
            .domains
            .get(name)
            .map(|e| {
                e.scoped_enabled
                    .iter()
                    .filter(|(_, enabled)| **enabled)
                    .map(|(scope, _)| scope.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Trigger a single domain's refresher as a manual refresh.
    pub async fn trigger_manual_refresh(&self, name: &str) {
        self.0.manager.trigger_manual_refresh(name).await;
    }

    /// Trigger the full current-view refresher set as manual refreshes: the manager's
    /// namespace-view/cluster-view/object-panel targets, plus `namespaces` if enabled, plus the
    /// selected namespace's `pods` scope if the pods view is active.
    pub async fn trigger_manual_refresh_for_context(&self) {
        self.0.manager.trigger_manual_refresh_for_context(None).await;

        if self.is_domain_enabled("namespaces") {
            self.trigger_manual_refresh("namespaces").await;
        }

        let context = self.current_context();
        let pods_view_active = context.current_view == Some(refresh_core::View::Namespace)
            && context.active_namespace_view.as_deref() == Some("pods");
        if pods_view_active {
            if let Some(namespace) = context.selected_namespace.clone() {
                let cluster_id = context
                    .selected_namespace_cluster_id
                    .clone()
                    .or_else(|| context.selected_cluster_id.clone());
                let scope = refresh_core::scope::build_cluster_scope(
                    cluster_id.as_deref(),
                    &refresh_core::scope::namespace_body(&namespace),
                );
                let _ = self.fetch_scoped_domain("pods", Some(&scope), FetchOptions::manual()).await;
            }
        }
    }

    fn is_domain_enabled(&self, name: &str) -> bool {
        self.0.state.lock().domains.get(name).is_some_and(|e| e.enabled)
    }

    async fn run_domain_refresh(&self, domain_name: &str, is_manual: bool, token: CancellationToken) -> SubscriberResult {
        let Some(domain) = self.domain_snapshot(domain_name) else {
            return Err(format!("unknown domain: {domain_name}"));
        };

        if domain.scoped {
            let scopes = self.enabled_scopes(domain_name);
            if scopes.is_empty() {
                return Ok(());
            }
            let mut any_ok = false;
            let mut last_error = None;
            for scope in scopes {
                let options = FetchOptions {
                    is_manual,
                    token: token.clone(),
                };
                match self.fetch_scoped_domain(domain_name, Some(&scope), options).await {
                    Ok(()) => any_ok = true,
                    Err(RefreshError::Aborted) => any_ok = true,
                    Err(err) => last_error = Some(err.to_string()),
                }
            }
            if any_ok || last_error.is_none() {
                Ok(())
            } else {
                Err(last_error.unwrap())
            }
        } else {
            let options = FetchOptions { is_manual, token };
            match self.fetch_scoped_domain(domain_name, None, options).await {
                Ok(()) | Err(RefreshError::Aborted) => Ok(()),
                Err(err) => Err(err.to_string()),
            }
        }
    }

    /// Fetch one snapshot for `(domain, requested_scope)`. Implements the full fetch protocol:
    /// scope normalization, in-flight preemption/dropping, the metrics cadence guard, store
    /// status transitions, the metrics-only overlay, and error classification.
    pub async fn fetch_scoped_domain(
        &self,
        domain_name: &str,
        requested_scope: Option<&str>,
        options: FetchOptions,
    ) -> Result<()> {
        let domain = self
            .domain_snapshot(domain_name)
            .ok_or_else(|| RefreshError::Unknown(domain_name.to_string()))?;

        let override_scope = self.get_domain_scope(domain_name);
        let requested = requested_scope.or(override_scope.as_deref());
        let context = self.current_context();
        let normalized = scope_normalize::normalize(&domain, &context, requested)
            .map_err(|err| RefreshError::EmptyScope(err.0))?;

        // Step 1 of the fetch protocol: a scoped domain only ever fetches a scope it currently
        // has enabled. A disabled scope resets its stored state instead of round-tripping.
        if domain.scoped {
            let enabled = self
                .0
                .state
                .lock()
                .domains
                .get(domain_name)
                .is_some_and(|e| e.scoped_enabled.get(&normalized).copied().unwrap_or(false));
            if !enabled {
                self.reset_scoped_domain(domain_name, &normalized);
                return Ok(());
            }
        }

        if domain.is_metrics_only() {
            let parsed = refresh_core::scope::parse_cluster_scope(&normalized);
            if parsed.is_multi_cluster() {
                return self.fetch_metrics_fanout(&domain, &normalized, &parsed, options).await;
            }
        }

        // A healthy, non-metrics-only stream already owns this data; a snapshot fetch would
        // just race it, so delegate to the stream's own refresh hook instead.
        if domain.is_streaming() && !domain.is_metrics_only() {
            let streaming_key = StreamingTable::key(domain_name, &normalized);
            if self.0.streaming.is_active(&streaming_key).await {
                return self.refresh_streaming_domain_once(domain_name, Some(&normalized)).await;
            }
        }

        let store_key = if domain.scoped { Some(normalized.clone()) } else { None };
        let in_flight_key = DomainSnapshotState::key(domain_name, store_key.as_deref());
        let request_id = self.0.request_counter.fetch_add(1, Ordering::Relaxed);

        {
            let mut in_flight = self.0.in_flight.lock();
            if let Some(existing) = in_flight.get(&in_flight_key) {
                if options.is_manual {
                    existing.token.cancel();
                } else {
                    self.record_dropped_auto_refresh(domain_name, store_key.as_deref());
                    return Ok(());
                }
            }
            in_flight.insert(
                in_flight_key.clone(),
                InFlight {
                    token: options.token.clone(),
                    request_id,
                },
            );
        }

        let streaming_key = StreamingTable::key(domain_name, &normalized);
        if !options.is_manual && domain.is_metrics_only() && self.0.streaming.is_active(&streaming_key).await {
            let guarded = {
                let mut state = self.0.state.lock();
                let last = state.metrics_cadence_last.get(&in_flight_key).copied();
                let guard = self.0.config.metrics_cadence_guard;
                let guarded = last.is_some_and(|at| at.elapsed() < guard);
                if !guarded {
                    state.metrics_cadence_last.insert(in_flight_key.clone(), Instant::now());
                }
                guarded
            };
            if guarded {
                self.clear_in_flight(&in_flight_key, request_id);
                self.record_dropped_auto_refresh(domain_name, store_key.as_deref());
                return Ok(());
            }
        }

        self.0.store.mark_pending_request(1);
        self.set_loading_status(domain_name, store_key.as_deref(), options.is_manual);

        let if_none_match = self.prior_etag(domain_name, store_key.as_deref());
        let request = SnapshotRequest {
            scope: Some(normalized.clone()),
            if_none_match,
        };

        let fetch_span = info_span!("refresh.fetch", domain = %domain_name, scope = %normalized);
        let outcome = self
            .0
            .client
            .fetch_snapshot(domain_name, request, options.token.clone())
            .instrument(fetch_span)
            .await;

        self.0.store.mark_pending_request(-1);
        let still_current = self.clear_in_flight(&in_flight_key, request_id);

        match outcome {
            Err(RefreshError::Aborted) => Err(RefreshError::Aborted),
            Err(err) => {
                if still_current {
                    self.record_error(
                        domain_name,
                        store_key.as_deref(),
                        &err,
                        domain.name.contains("object-details"),
                    );
                }
                Err(err)
            }
            Ok(SnapshotResponse::NotModified) => {
                if still_current {
                    self.0.error_policy.clear(domain_name, store_key.as_deref());
                    self.apply_not_modified(domain_name, store_key.as_deref(), options.is_manual);
                }
                Ok(())
            }
            Ok(SnapshotResponse::Fetched { snapshot, etag }) => {
                if still_current {
                    self.0.error_policy.clear(domain_name, store_key.as_deref());
                    self.apply_fetched(&domain, store_key.as_deref(), snapshot, etag, options.is_manual);
                }
                Ok(())
            }
        }
    }

    /// A multi-cluster `metricsOnly` scope fans out to one single-cluster fetch per cluster,
    /// run concurrently, merging each result's usage fields into the shared report-scope state.
    async fn fetch_metrics_fanout(
        &self,
        domain: &DomainConfig,
        report_scope: &str,
        parsed: &refresh_core::scope::ParsedScope,
        options: FetchOptions,
    ) -> Result<()> {
        let refresh_core::scope::ClusterToken::Multi(cluster_ids) = &parsed.token else {
            return Ok(());
        };
        let Some(metrics_domain) = Self::metrics_domain_for(domain) else {
            return Ok(());
        };

        self.0.store.mark_pending_request(1);
        self.set_loading_status(&domain.name, Some(report_scope), options.is_manual);

        let fetches = cluster_ids.iter().map(|cluster_id| {
            let client = self.0.client.clone();
            let domain_name = domain.name.clone();
            let scope = refresh_core::scope::build_cluster_scope(Some(cluster_id), &parsed.body);
            let token = options.token.clone();
            let span = info_span!("refresh.fetch", domain = %domain_name, scope = %scope);
            async move {
                let request = SnapshotRequest {
                    scope: Some(scope),
                    if_none_match: None,
                };
                client.fetch_snapshot(&domain_name, request, token).await
            }
            .instrument(span)
        });
        let results = futures::future::join_all(fetches).await;
        self.0.store.mark_pending_request(-1);

        let mut merged: Vec<serde_json::Value> = Vec::new();
        let mut last_error = None;
        for result in results {
            match result {
                Ok(SnapshotResponse::Fetched { snapshot, .. }) => {
                    let incoming = snapshot.payload.as_array().cloned().unwrap_or_default();
                    merged = metrics_overlay::merge_usage_fields(metrics_domain, &merged, &incoming);
                }
                Ok(SnapshotResponse::NotModified) => {}
                Err(RefreshError::Aborted) => return Err(RefreshError::Aborted),
                Err(err) => last_error = Some(err),
            }
        }

        if let Some(err) = last_error {
            self.record_error(&domain.name, Some(report_scope), &err, false);
            return Err(err);
        }

        self.0.error_policy.clear(&domain.name, Some(report_scope));
        let is_manual = options.is_manual;
        let update = move |prev: &DomainSnapshotState| {
            let mut next = prev.clone();
            next.data = Some(serde_json::Value::Array(merged.clone()));
            next.status = SnapshotStatus::Ready;
            next.error = None;
            let now = chrono::Utc::now();
            next.last_updated = Some(now);
            if is_manual {
                next.last_manual_refresh = Some(now);
            } else {
                next.last_auto_refresh = Some(now);
            }
            next.is_manual = Some(is_manual);
            next.scope = Some(report_scope.to_string());
            next
        };
        self.0.store.set_scoped_domain_state(&domain.name, report_scope, update);
        Ok(())
    }

    fn clear_in_flight(&self, key: &str, request_id: u64) -> bool {
        let mut in_flight = self.0.in_flight.lock();
        match in_flight.get(key) {
            Some(entry) if entry.request_id == request_id => {
                in_flight.remove(key);
                true
            }
            _ => false,
        }
    }

    fn record_dropped_auto_refresh(&self, domain_name: &str, scope: Option<&str>) {
        match scope {
            Some(scope) => self.0.store.increment_scoped_dropped_auto_refresh(domain_name, scope),
            None => self.0.store.increment_dropped_auto_refresh(domain_name),
        }
    }

    fn prior_etag(&self, domain_name: &str, scope: Option<&str>) -> Option<String> {
        match scope {
            Some(scope) => self.0.store.get_scoped_domain_state(domain_name, scope).etag.clone(),
            None => self.0.store.get_domain_state(domain_name).etag.clone(),
        }
    }

    fn set_loading_status(&self, domain_name: &str, scope: Option<&str>, is_manual: bool) {
        let update = |prev: &DomainSnapshotState| {
            let mut next = prev.clone();
            next.status = if store::is_idle(prev.status) {
                SnapshotStatus::Loading
            } else {
                SnapshotStatus::Updating
            };
            next.is_manual = Some(is_manual);
            next
        };
        match scope {
            Some(scope) => self.0.store.set_scoped_domain_state(domain_name, scope, update),
            None => self.0.store.set_domain_state(domain_name, update),
        }
    }

    fn apply_not_modified(&self, domain_name: &str, scope: Option<&str>, is_manual: bool) {
        let update = |prev: &DomainSnapshotState| {
            let mut next = prev.clone();
            next.status = SnapshotStatus::Ready;
            next.error = None;
            let now = chrono::Utc::now();
            next.last_updated = Some(now);
            if is_manual {
                next.last_manual_refresh = Some(now);
            } else {
                next.last_auto_refresh = Some(now);
            }
            next
        };
        match scope {
            Some(scope) => self.0.store.set_scoped_domain_state(domain_name, scope, update),
            None => self.0.store.set_domain_state(domain_name, update),
        }
    }

    fn apply_fetched(
        &self,
        domain: &DomainConfig,
        scope: Option<&str>,
        snapshot: Snapshot,
        etag: Option<String>,
        is_manual: bool,
    ) {
        let metrics_domain = Self::metrics_domain_for(domain);
        let update = move |prev: &DomainSnapshotState| {
            let mut next = prev.clone();
            let incoming = snapshot.payload.as_array().cloned().unwrap_or_default();
            next.data = Some(match (metrics_domain, prev.data.as_ref().and_then(|d| d.as_array())) {
                (Some(kind), Some(existing)) => {
                    serde_json::Value::Array(metrics_overlay::merge_usage_fields(kind, existing, &incoming))
                }
                _ => snapshot.payload.clone(),
            });
            next.stats = Some(snapshot.stats.clone());
            next.version = Some(snapshot.version);
            next.checksum = snapshot.checksum.clone();
            next.etag = etag.clone();
            next.status = SnapshotStatus::Ready;
            next.error = None;
            let now = chrono::Utc::now();
            next.last_updated = Some(now);
            if is_manual {
                next.last_manual_refresh = Some(now);
            } else {
                next.last_auto_refresh = Some(now);
            }
            next.is_manual = Some(is_manual);
            next.scope = scope.map(str::to_string);
            next
        };
        match scope {
            Some(scope) => self.0.store.set_scoped_domain_state(&domain.name, scope, update),
            None => self.0.store.set_domain_state(&domain.name, update),
        }
    }

    fn record_error(&self, domain_name: &str, scope: Option<&str>, error: &RefreshError, is_object_details_domain: bool) {
        let disposition = self.0.error_policy.classify(domain_name, scope, error, is_object_details_domain);

        // Only a `Notify` disposition is allowed to flip status/data. Suppressed
        // network-transient errors and other silenced noise must leave the domain's existing
        // state exactly as it was (§7 step 8).
        let errors::ErrorDisposition::Notify(message) = disposition else {
            return;
        };

        let stored_message = message.clone();
        let update = |prev: &DomainSnapshotState| {
            let mut next = prev.clone();
            next.status = SnapshotStatus::Error;
            next.error = Some(stored_message.clone());
            next
        };
        match scope {
            Some(scope) => self.0.store.set_scoped_domain_state(domain_name, scope, update),
            None => self.0.store.set_domain_state(domain_name, update),
        }

        self.0.events.publish_outbound(OutboundEvent::DomainError {
            domain: domain_name.to_string(),
            scope: scope.map(str::to_string),
            message,
        });
    }

    /// Reset a non-scoped domain's stored state and cancel any in-flight fetch for it.
    pub fn reset_domain(&self, name: &str) {
        self.abort_in_flight(&DomainSnapshotState::key(name, None));
        self.0.store.reset_domain_state(name);
        self.0.error_policy.clear(name, None);
    }

    /// Reset one scope of a scoped domain and cancel any in-flight fetch for it.
    pub fn reset_scoped_domain(&self, name: &str, scope: &str) {
        self.abort_in_flight(&DomainSnapshotState::key(name, Some(scope)));
        self.0.store.reset_scoped_domain_state(name, scope);
        self.0.error_policy.clear(name, Some(scope));
    }

    fn abort_in_flight(&self, key: &str) {
        if let Some(entry) = self.0.in_flight.lock().remove(key) {
            entry.token.cancel();
        }
    }

    /// Ask a running stream to push a fresh read. Delegates to the streaming provider's own
    /// `refresh_once` hook if it has one; otherwise falls back to a stop-then-start cycle.
    pub async fn refresh_streaming_domain_once(&self, domain_name: &str, scope: Option<&str>) -> Result<()> {
        let domain = self
            .domain_snapshot(domain_name)
            .ok_or_else(|| RefreshError::Unknown(domain_name.to_string()))?;
        let context = self.current_context();
        let normalized = scope_normalize::normalize(&domain, &context, scope)
            .map_err(|err| RefreshError::EmptyScope(err.0))?;

        if let Some(provider) = self.provider_for(domain_name) {
            if let Some(future) = provider.refresh_once(domain_name.to_string(), normalized.clone()) {
                future.await;
                return Ok(());
            }
        }
        self.restart_streaming_domain(domain_name, Some(&normalized)).await
    }

    /// Start a stream for `(domain, scope)`, priming it with one fetch first.
    pub async fn start_streaming_domain(&self, domain_name: &str, scope: Option<&str>) -> Result<()> {
        let domain = self
            .domain_snapshot(domain_name)
            .ok_or_else(|| RefreshError::Unknown(domain_name.to_string()))?;
        let Some(provider) = self.provider_for(domain_name) else {
            return Err(RefreshError::Unknown(domain_name.to_string()));
        };

        let context = self.current_context();
        let normalized = scope_normalize::normalize(&domain, &context, scope)
            .map_err(|err| RefreshError::EmptyScope(err.0))?;
        let key = StreamingTable::key(domain_name, &normalized);

        if self.0.streaming.is_blocked(&key).await || self.0.streaming.is_active(&key).await {
            return Ok(());
        }
        if !Self::active_view_matches_domain(&domain, &context) {
            return Ok(());
        }
        if refresh_core::scope::parse_cluster_scope(&normalized).is_multi_cluster() {
            return Ok(());
        }

        self.fetch_scoped_domain(domain_name, scope, FetchOptions::manual()).await?;

        let pause_refresher = domain
            .streaming
            .is_some_and(|flags| flags.pause_refresher_when_streaming)
            && !domain.scoped;
        if pause_refresher {
            self.0.manager.pause(Some(&domain.refresher));
        }

        if !domain.scoped {
            if let Some(entry) = self.0.state.lock().domains.get_mut(domain_name) {
                entry.active_stream_scope = Some(normalized.clone());
            }
        }

        let domain_owned = domain_name.to_string();
        let scope_owned = normalized.clone();
        let start_future = streaming::share_start_future(async move { provider.start(domain_owned, scope_owned).await });
        self.0.streaming.begin_start(&key, start_future.clone()).await;

        let orchestrator = self.clone();
        tokio::spawn(async move {
            let cleanup = start_future.await;
            orchestrator.0.streaming.finish_start(&key, cleanup).await;
        });

        Ok(())
    }

    /// Stop a stream for `(domain, scope)`, whether it is pending or already active.
    pub async fn stop_streaming_domain(&self, domain_name: &str, scope: Option<&str>) {
        let Some(domain) = self.domain_snapshot(domain_name) else {
            return;
        };
        let context = self.current_context();
        let normalized = match scope_normalize::normalize(&domain, &context, scope) {
            Ok(s) => s,
            Err(_) => return,
        };
        self.stop_streaming_domain_at(domain_name, &domain, &normalized).await;
    }

    /// Stop a stream at an already-normalized scope, bypassing `scope_normalize::normalize`.
    /// Needed by `updateContext`'s non-scoped stream restart: by the time the context has already
    /// moved on, re-normalizing would recompute the NEW scope rather than target the stream that
    /// is actually running under the OLD one.
    async fn stop_streaming_domain_at(&self, domain_name: &str, domain: &DomainConfig, normalized_scope: &str) {
        let key = StreamingTable::key(domain_name, normalized_scope);

        if !self.0.streaming.await_pending_and_stop(&key).await {
            self.0.streaming.stop_active(&key).await;
        }

        let pause_refresher = domain
            .streaming
            .is_some_and(|flags| flags.pause_refresher_when_streaming)
            && !domain.scoped;
        if pause_refresher {
            self.0.manager.resume(Some(&domain.refresher));
        }

        if !domain.scoped {
            if let Some(entry) = self.0.state.lock().domains.get_mut(domain_name) {
                entry.active_stream_scope = None;
            }
        }
    }

    /// Stop and immediately restart a stream, e.g. after a context change invalidates it.
    pub async fn restart_streaming_domain(&self, domain_name: &str, scope: Option<&str>) -> Result<()> {
        self.stop_streaming_domain(domain_name, scope).await;
        self.start_streaming_domain(domain_name, scope).await
    }

    fn provider_for(&self, name: &str) -> Option<Arc<dyn StreamingProvider>> {
        self.0.state.lock().domains.get(name).and_then(|e| e.provider.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RawResponse, RefreshBackend};
    use refresh_core::DomainCategory;
    use std::sync::atomic::AtomicUsize;

    struct StaticBackend {
        version: AtomicU64,
    }

    impl RefreshBackend for StaticBackend {
        fn get_base_url(&self) -> BoxFuture<'static, std::result::Result<String, String>> {
            Box::pin(async { Ok("http://backend.local".to_string()) })
        }

        fn get(
            &self,
            _path: String,
            _if_none_match: Option<String>,
        ) -> BoxFuture<'static, std::result::Result<RawResponse, String>> {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                Ok(RawResponse {
                    status: http::StatusCode::OK,
                    etag: Some(format!("v{version}")),
                    body: bytes::Bytes::from(
                        serde_json::json!({
                            "domain": "nodes",
                            "scope": null,
                            "version": version,
                            "checksum": null,
                            "generatedAt": "2024-01-01T00:00:00Z",
                            "sequence": version,
                            "payload": [],
                            "stats": {}
                        })
                        .to_string(),
                    ),
                })
            })
        }

        fn post_json(
            &self,
            _path: String,
            _body: serde_json::Value,
        ) -> BoxFuture<'static, std::result::Result<RawResponse, String>> {
            Box::pin(async { Ok(RawResponse { status: http::StatusCode::OK, etag: None, body: bytes::Bytes::new() }) })
        }
    }

    fn orchestrator() -> RefreshOrchestrator {
        let events = Arc::new(EventBus::new());
        let manager = RefreshManager::new(events.clone());
        let store = store::Writer::new();
        let backend = Arc::new(StaticBackend { version: AtomicU64::new(0) });
        let client = Arc::new(SnapshotClient::new(backend, RefreshSystemConfig::default()));
        RefreshOrchestrator::new(manager, store, client, events, RefreshSystemConfig::default())
    }

    #[tokio::test]
    async fn fetch_scoped_domain_populates_store() {
        let orch = orchestrator();
        orch.register_domain(DomainConfig::new("nodes", DomainCategory::Cluster).with_pinned_body(""));
        let result = orch.fetch_scoped_domain("nodes", None, FetchOptions::manual()).await;
        assert!(result.is_ok());
        let state = orch.0.store.get_domain_state("nodes");
        assert_eq!(state.status, SnapshotStatus::Ready);
        assert_eq!(state.version, Some(1));
    }

    #[tokio::test]
    async fn unknown_domain_is_an_error() {
        let orch = orchestrator();
        let result = orch.fetch_scoped_domain("ghost", None, FetchOptions::manual()).await;
        assert!(matches!(result, Err(RefreshError::Unknown(_))));
    }

    #[tokio::test]
    async fn automatic_fetch_dropped_while_one_is_in_flight() {
        let orch = orchestrator();
        orch.register_domain(DomainConfig::new("nodes", DomainCategory::Cluster).with_pinned_body(""));
        let key = DomainSnapshotState::key("nodes", None);
        orch.0.in_flight.lock().insert(
            key,
            InFlight {
                token: CancellationToken::new(),
                request_id: 999,
            },
        );
        let result = orch
            .fetch_scoped_domain("nodes", None, FetchOptions::automatic(CancellationToken::new()))
            .await;
        assert!(result.is_ok());
        let state = orch.0.store.get_domain_state("nodes");
        assert_eq!(state.dropped_auto_refreshes, 1);
    }

    #[tokio::test]
    async fn scoped_domain_enablement_gates_refresher() {
        let orch = orchestrator();
        orch.register_domain(DomainConfig::new("namespace-config", DomainCategory::Namespace).scoped());
        assert_eq!(
            orch.0.manager.get_state("namespace-config").unwrap().status,
            refresh_core::RefresherStatus::Disabled
        );
        orch.set_scoped_domain_enabled("namespace-config", "cluster-a|namespace:team", true);
        assert_ne!(
            orch.0.manager.get_state("namespace-config").unwrap().status,
            refresh_core::RefresherStatus::Disabled
        );
        orch.set_scoped_domain_enabled("namespace-config", "cluster-a|namespace:team", false);
        assert_eq!(
            orch.0.manager.get_state("namespace-config").unwrap().status,
            refresh_core::RefresherStatus::Disabled
        );
    }

    #[tokio::test]
    async fn view_reset_clears_store_and_streaming() {
        let orch = orchestrator();
        orch.register_domain(DomainConfig::new("nodes", DomainCategory::Cluster).with_pinned_body(""));
        orch.fetch_scoped_domain("nodes", None, FetchOptions::manual()).await.unwrap();
        orch.0.events.publish_inbound(InboundEvent::ViewReset);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let state = orch.0.store.get_domain_state("nodes");
        assert_eq!(state.status, SnapshotStatus::Idle);
    }

    struct RecordingProvider {
        starts: Arc<AtomicUsize>,
    }

    impl StreamingProvider for RecordingProvider {
        fn start(&self, _domain: String, _scope: String) -> BoxFuture<'static, StreamingCleanup> {
            let starts = self.starts.clone();
            Box::pin(async move {
                starts.fetch_add(1, Ordering::SeqCst);
                Arc::new(|| {}) as StreamingCleanup
            })
        }
    }

    #[tokio::test]
    async fn start_and_stop_streaming_domain() {
        let orch = orchestrator();
        let starts = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(RecordingProvider { starts: starts.clone() });
        orch.register_domain_with_provider(
            DomainConfig::new("nodes", DomainCategory::Cluster)
                .with_pinned_body("")
                .with_streaming(refresh_core::StreamingFlags {
                    metrics_only: true,
                    pause_refresher_when_streaming: false,
                }),
            Some(provider),
        );
        orch.update_context(ContextUpdate {
            current_view: Some(refresh_core::View::Cluster),
            active_cluster_view: Some(Some("nodes".to_string())),
            ..Default::default()
        })
        .await;
        orch.start_streaming_domain("nodes", None).await.unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        let key = StreamingTable::key("nodes", "cluster-a|");
        // The pinned body means the normalized scope has no cluster prefix when the context is
        // empty; exercise stop regardless of the exact key shape.
        let _ = key;
        orch.stop_streaming_domain("nodes", None).await;
    }
}
