//! The Refresh Manager: periodic schedulers for a fixed set of "refreshers".
//!
//! Each refresher is a named timer-backed state machine with per-subscriber fan-out. The
//! implementation keeps exactly one `CancellationToken` armed per timer role (interval,
//! cooldown) per refresher, re-arming clears the prior token, mirroring the invariant that at
//! most one handle per role exists at a time (§5 Concurrency & Resource Model, invariant 1).
//! All mutable state lives behind a single `parking_lot::Mutex`, so although timers are driven
//! by spawned tokio tasks, no two mutations of refresher state ever race: the single-threaded
//! cooperative model from the design document is preserved even though `tokio` itself is
//! multi-threaded-capable.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use refresh_core::{cooldown_duration, RefresherConfig, RefresherState, RefresherStatus};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::event_bus::{EventBus, OutboundEvent};

/// The outcome of one subscriber invocation.
pub type SubscriberResult = Result<(), String>;

/// A boxed future returned by a subscriber callback.
pub type SubscriberFuture = Pin<Box<dyn Future<Output = SubscriberResult> + Send>>;

/// A subscriber callback: receives `(is_manual, cancellation_token)`.
pub type Subscriber = Arc<dyn Fn(bool, CancellationToken) -> SubscriberFuture + Send + Sync>;

/// Handle returned by [`RefreshManager::subscribe`]; dropping or calling [`Unsubscribe::detach`]
/// removes the callback.
pub struct Unsubscribe {
    manager: RefreshManager,
    name: String,
    id: u64,
    detached: bool,
}

impl Unsubscribe {
    /// Detach the subscriber. Idempotent.
    pub fn detach(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.manager.remove_subscriber(&self.name, self.id);
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.run_detach();
    }
}

struct RefresherEntry {
    config: RefresherConfig,
    state: RefresherState,
    subscribers: Vec<(u64, Subscriber)>,
    next_subscriber_id: u64,
    interval_token: Option<CancellationToken>,
    cooldown_token: Option<CancellationToken>,
    /// The token for the currently-running refresh, if any; used to let a manual trigger
    /// preempt an in-progress automatic (or prior manual) run.
    run_token: Option<CancellationToken>,
    /// Bumped every time this refresher finishes registering, so a manual-origin cooldown exit
    /// knows whether to re-arm the interval timer (see §4.1 state table: "restarts interval
    /// timer if manual-origin").
    last_run_was_manual: bool,
    /// `true` once this refresher has completed at least one run.
    has_completed_once: bool,
}

impl RefresherEntry {
    fn new(config: RefresherConfig) -> Self {
        let status = if config.enabled {
            RefresherStatus::Idle
        } else {
            RefresherStatus::Disabled
        };
        Self {
            config,
            state: RefresherState {
                status,
                ..Default::default()
            },
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            interval_token: None,
            cooldown_token: None,
            run_token: None,
            last_run_was_manual: false,
            has_completed_once: false,
        }
    }

    fn clear_interval_timer(&mut self) {
        if let Some(token) = self.interval_token.take() {
            token.cancel();
        }
    }

    fn clear_cooldown_timer(&mut self) {
        if let Some(token) = self.cooldown_token.take() {
            token.cancel();
        }
    }

    fn clear_all_timers(&mut self) {
        self.clear_interval_timer();
        self.clear_cooldown_timer();
    }
}

struct ManagerState {
    refreshers: HashMap<String, RefresherEntry>,
    global_paused: bool,
    context: refresh_core::RefreshContext,
}

struct Inner {
    state: Mutex<ManagerState>,
    events: Arc<EventBus>,
    run_id: AtomicU64,
    /// Notified whenever any refresher's state changes; mainly useful for tests that want to
    /// await a settle point without guessing at sleep durations.
    settled: Notify,
}

/// The Refresh Manager: a cheaply-`Clone`able handle to the shared refresher registry.
#[derive(Clone)]
pub struct RefreshManager {
    inner: Arc<Inner>,
}

impl RefreshManager {
    /// Construct a new manager publishing onto `events`.
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ManagerState {
                    refreshers: HashMap::new(),
                    global_paused: false,
                    context: refresh_core::RefreshContext::default(),
                }),
                events,
                run_id: AtomicU64::new(0),
                settled: Notify::new(),
            }),
        }
    }

    fn emit(&self, event: OutboundEvent) {
        self.inner.events.publish_outbound(event);
    }

    fn set_status(&self, state: &mut ManagerState, name: &str, status: RefresherStatus) {
        if let Some(entry) = state.refreshers.get_mut(name) {
            if entry.state.status == status {
                return;
            }
            entry.state.status = status;
        } else {
            return;
        }
        self.emit(OutboundEvent::RefreshStateChange {
            name: name.to_string(),
            state: status,
        });
        debug!(refresher = name, ?status, "refresh.state-change");
        self.inner.settled.notify_waiters();
    }

    /// Register a refresher. If one with the same name already exists, its subscriber set is
    /// preserved and a warning is emitted (§4.1).
    pub fn register(&self, config: RefresherConfig) {
        let name = config.name.clone();
        let mut state = self.inner.state.lock();
        let enabled = config.enabled;
        let global_paused = state.global_paused;
        let first_run_needed;
        if state.refreshers.contains_key(&name) {
            warn!(refresher = %name, "refresh.registered: refresher already exists, preserving subscribers");
            if let Some(existing) = state.refreshers.get_mut(&name) {
                existing.clear_all_timers();
                existing.config = config;
            }
            let target = if enabled {
                if global_paused {
                    RefresherStatus::Paused
                } else {
                    RefresherStatus::Idle
                }
            } else {
                RefresherStatus::Disabled
            };
            self.set_status(&mut state, &name, target);
            first_run_needed = enabled
                && !global_paused
                && !state
                    .refreshers
                    .get(&name)
                    .is_some_and(|e| e.has_completed_once);
        } else {
            let mut entry = RefresherEntry::new(config);
            if enabled && global_paused {
                entry.state.status = RefresherStatus::Paused;
            }
            first_run_needed = enabled && !global_paused;
            state.refreshers.insert(name.clone(), entry);
        }
        self.emit(OutboundEvent::RefreshRegistered { name: name.clone() });
        debug!(refresher = %name, "refresh.registered");

        if enabled && !state.global_paused {
            self.arm_interval_timer_locked(&mut state, &name);
        }
        drop(state);

        if first_run_needed {
            self.trigger(&name, false);
        }
    }

    /// Remove a refresher entirely: cancels timers, drops subscribers, removes state.
    pub fn unregister(&self, name: &str) {
        let mut state = self.inner.state.lock();
        if let Some(mut entry) = state.refreshers.remove(name) {
            entry.clear_all_timers();
            if let Some(token) = entry.run_token.take() {
                token.cancel();
            }
        }
    }

    /// Enable a refresher. Idempotent. While globally paused, transitions to `Paused` rather
    /// than `Idle`.
    pub fn enable(&self, name: &str) {
        let mut state = self.inner.state.lock();
        let global_paused = state.global_paused;
        let Some(entry) = state.refreshers.get_mut(name) else {
            return;
        };
        if entry.config.enabled && entry.state.status != RefresherStatus::Disabled {
            return;
        }
        entry.config.enabled = true;
        let target = if global_paused {
            RefresherStatus::Paused
        } else {
            RefresherStatus::Idle
        };
        self.set_status(&mut state, name, target);
        if !global_paused {
            self.arm_interval_timer_locked(&mut state, name);
        }
        let needs_first_run = !global_paused
            && state
                .refreshers
                .get(name)
                .is_some_and(|e| !e.has_completed_once);
        drop(state);
        if needs_first_run {
            self.trigger(name, false);
        }
    }

    /// Disable a refresher: cancels any running refresh, clears timers, transitions to
    /// `Disabled`.
    pub fn disable(&self, name: &str) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.refreshers.get_mut(name) else {
            return;
        };
        entry.config.enabled = false;
        entry.clear_all_timers();
        if let Some(token) = entry.run_token.take() {
            token.cancel();
        }
        self.set_status(&mut state, name, RefresherStatus::Disabled);
    }

    /// Subscribe a callback to a refresher's runs, returning a detach handle.
    pub fn subscribe(&self, name: &str, callback: Subscriber) -> Unsubscribe {
        let mut state = self.inner.state.lock();
        let id = if let Some(entry) = state.refreshers.get_mut(name) {
            let id = entry.next_subscriber_id;
            entry.next_subscriber_id += 1;
            entry.subscribers.push((id, callback));
            id
        } else {
            0
        };
        Unsubscribe {
            manager: self.clone(),
            name: name.to_string(),
            id,
            detached: false,
        }
    }

    fn remove_subscriber(&self, name: &str, id: u64) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.refreshers.get_mut(name) {
            entry.subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Merge a context update and trigger the refreshers that transition implies.
    pub async fn update_context(
        &self,
        update: refresh_core::ContextUpdate,
    ) -> refresh_core::ContextTransition {
        let transition = {
            let mut state = self.inner.state.lock();
            state.context.merge(update)
        };

        if transition.namespace_changed {
            for target in &transition.targets {
                self.abort_refresh(target);
            }
        } else if transition.view_changed {
            for target in &transition.targets {
                if target.starts_with("namespace") {
                    self.abort_refresh(target);
                }
            }
        }

        self.trigger_manual_refresh_many(transition.targets.clone()).await;
        transition
    }

    /// The context as most recently merged by [`Self::update_context`].
    pub fn current_context(&self) -> refresh_core::RefreshContext {
        self.inner.state.lock().context.clone()
    }

    fn abort_refresh(&self, name: &str) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.refreshers.get_mut(name) {
            if let Some(token) = entry.run_token.take() {
                token.cancel();
            }
        }
    }

    /// Trigger a single refresher as a manual refresh. Never rejects.
    pub async fn trigger_manual_refresh(&self, name: &str) {
        self.trigger(name, true).settle().await;
    }

    /// Trigger a set of refreshers as manual refreshes, deduplicated, awaiting all of them.
    pub async fn trigger_manual_refresh_many(&self, names: Vec<String>) {
        let mut seen = std::collections::HashSet::new();
        let mut handles = Vec::new();
        for name in names {
            if seen.insert(name.clone()) {
                handles.push(self.trigger(&name, true).settle());
            }
        }
        futures::future::join_all(handles).await;
    }

    /// Compute the full current-view refresher set from `context` (or the stored context) and
    /// trigger it as manual.
    pub async fn trigger_manual_refresh_for_context(&self, context: Option<&refresh_core::RefreshContext>) {
        let owned;
        let ctx = match context {
            Some(ctx) => ctx,
            None => {
                owned = self.inner.state.lock().context.clone();
                &owned
            }
        };
        let targets = context_targets(ctx);
        self.trigger_manual_refresh_many(targets).await;
    }

    /// Pause a single refresher, or (with `None`) pause globally.
    pub fn pause(&self, name: Option<&str>) {
        let mut state = self.inner.state.lock();
        match name {
            Some(name) => {
                if let Some(entry) = state.refreshers.get_mut(name) {
                    entry.clear_all_timers();
                }
                self.set_status(&mut state, name, RefresherStatus::Paused);
            }
            None => {
                state.global_paused = true;
                let names: Vec<String> = state
                    .refreshers
                    .iter()
                    .filter(|(_, e)| e.config.enabled)
                    .map(|(n, _)| n.clone())
                    .collect();
                for n in names {
                    if let Some(entry) = state.refreshers.get_mut(&n) {
                        entry.clear_all_timers();
                    }
                    self.set_status(&mut state, &n, RefresherStatus::Paused);
                }
            }
        }
    }

    /// Resume a single refresher, or (with `None`) resume globally.
    pub fn resume(&self, name: Option<&str>) {
        let mut state = self.inner.state.lock();
        match name {
            Some(name) => {
                if state.refreshers.get(name).is_some_and(|e| e.config.enabled) {
                    self.set_status(&mut state, name, RefresherStatus::Idle);
                    self.arm_interval_timer_locked(&mut state, name);
                }
            }
            None => {
                state.global_paused = false;
                let names: Vec<String> = state
                    .refreshers
                    .iter()
                    .filter(|(_, e)| e.config.enabled)
                    .map(|(n, _)| n.clone())
                    .collect();
                for n in names {
                    self.set_status(&mut state, &n, RefresherStatus::Idle);
                    self.arm_interval_timer_locked(&mut state, &n);
                }
            }
        }
    }

    /// Abort all in-flight work, clear every timer, reset every refresher's status to `Idle` or
    /// `Disabled` per its enabled flag.
    pub fn cancel_all_refreshes(&self) {
        let mut state = self.inner.state.lock();
        let names: Vec<String> = state.refreshers.keys().cloned().collect();
        for name in names {
            if let Some(entry) = state.refreshers.get_mut(&name) {
                entry.clear_all_timers();
                if let Some(token) = entry.run_token.take() {
                    token.cancel();
                }
            }
            let target = if state.refreshers.get(&name).is_some_and(|e| e.config.enabled) {
                RefresherStatus::Idle
            } else {
                RefresherStatus::Disabled
            };
            self.set_status(&mut state, &name, target);
        }
    }

    /// Read a refresher's current state.
    pub fn get_state(&self, name: &str) -> Option<RefresherState> {
        self.inner
            .state
            .lock()
            .refreshers
            .get(name)
            .map(|e| e.state.clone())
    }

    /// Read a refresher's configured interval.
    pub fn get_refresher_interval(&self, name: &str) -> Option<Duration> {
        self.inner
            .state
            .lock()
            .refreshers
            .get(name)
            .map(|e| e.config.interval)
    }

    fn arm_interval_timer_locked(&self, state: &mut ManagerState, name: &str) {
        let Some(entry) = state.refreshers.get_mut(name) else {
            return;
        };
        entry.clear_interval_timer();
        if entry.state.status == RefresherStatus::Refreshing {
            // The currently-running refresh will re-arm on settle.
            return;
        }
        let token = CancellationToken::new();
        entry.interval_token = Some(token.clone());
        let interval = entry.config.interval;
        let manager = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    manager.on_interval_tick(&name);
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn on_interval_tick(&self, name: &str) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.refreshers.get_mut(name) else {
            return;
        };
        if entry.state.status != RefresherStatus::Idle {
            trace!(refresher = name, status = ?entry.state.status, "refresh.tick: skipped, not idle");
            // Another tick or run subsumes this one; nothing to re-arm here, the run in
            // progress owns re-arming on settle.
            return;
        }
        drop(state);
        self.trigger(name, false).forget();
    }

    /// Trigger a run. Returns a `Trigger` that can be `.await`ed to block until the run settles,
    /// or dropped/`.forget()`-ed to fire-and-forget (used by the interval timer).
    fn trigger(&self, name: &str, is_manual: bool) -> Trigger {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.refreshers.get_mut(name) else {
            return Trigger::noop();
        };
        if !entry.config.enabled || matches!(entry.state.status, RefresherStatus::Disabled | RefresherStatus::Paused) {
            return Trigger::noop();
        }
        if entry.state.status == RefresherStatus::Cooldown && !is_manual {
            trace!(refresher = name, "refresh.tick: skipped, in cooldown");
            return Trigger::noop();
        }
        if entry.state.status == RefresherStatus::Refreshing {
            if !is_manual {
                // Automatic ticks never subsume a running refresh.
                return Trigger::noop();
            }
            // Manual preempts: cancel the running refresh; its settle handler will notice the
            // preemption and simply stop without re-entering cooldown twice.
            if let Some(token) = entry.run_token.take() {
                token.cancel();
            }
        }

        entry.clear_interval_timer();
        entry.clear_cooldown_timer();
        let run_token = CancellationToken::new();
        entry.run_token = Some(run_token.clone());
        let subscribers = entry.subscribers.clone();
        let timeout = entry.config.timeout;
        let cooldown = entry.config.cooldown;
        self.set_status(&mut state, name, RefresherStatus::Refreshing);
        drop(state);

        self.emit(OutboundEvent::RefreshStart {
            name: name.to_string(),
            is_manual,
        });

        let manager = self.clone();
        let name_owned = name.to_string();
        let run_id = self.inner.run_id.fetch_add(1, Ordering::Relaxed);
        let tick_span = info_span!("refresh.tick", refresher = %name, is_manual);
        let handle = tokio::spawn(
            async move {
                let outcome = run_subscribers(subscribers, is_manual, run_token.clone(), timeout).await;
                manager.on_run_settled(&name_owned, is_manual, cooldown, run_id, outcome);
            }
            .instrument(tick_span),
        );
        Trigger::spawned(handle)
    }

    fn on_run_settled(
        &self,
        name: &str,
        is_manual: bool,
        cooldown: Duration,
        _run_id: u64,
        outcome: RunOutcome,
    ) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.refreshers.get_mut(name) else {
            return;
        };
        // A newer run already took over `run_token`; this settle is for a preempted run.
        if entry.state.status != RefresherStatus::Refreshing {
            return;
        }

        match outcome {
            RunOutcome::Aborted => {
                self.set_status(&mut state, name, RefresherStatus::Idle);
                self.arm_interval_timer_locked(&mut state, name);
                drop(state);
                self.emit(OutboundEvent::RefreshComplete {
                    name: name.to_string(),
                    is_manual,
                    success: false,
                    error: None,
                });
                return;
            }
            RunOutcome::Success => {
                entry.state.consecutive_errors = 0;
                entry.state.error = None;
                entry.has_completed_once = true;
            }
            RunOutcome::Failure(message) => {
                entry.state.consecutive_errors += 1;
                entry.state.error = Some(message);
                entry.has_completed_once = true;
            }
        }
        entry.last_run_was_manual = is_manual;
        entry.state.last_refresh_time = Some(chrono::Utc::now());
        let failed = matches!(outcome, RunOutcome::Failure(_));
        let consecutive_errors = entry.state.consecutive_errors;
        let wait = cooldown_duration(cooldown, consecutive_errors);
        entry.state.next_refresh_time = Some(chrono::Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default());
        self.set_status(&mut state, name, RefresherStatus::Cooldown);

        let error_message = entry.state.error.clone();
        drop(state);

        self.emit(OutboundEvent::RefreshComplete {
            name: name.to_string(),
            is_manual,
            success: !failed,
            error: error_message,
        });

        self.arm_cooldown_timer(name, wait, failed);
    }

    fn arm_cooldown_timer(&self, name: &str, wait: Duration, retry_on_exit: bool) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.refreshers.get_mut(name) else {
            return;
        };
        entry.clear_cooldown_timer();
        let token = CancellationToken::new();
        entry.cooldown_token = Some(token.clone());
        drop(state);

        let manager = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    manager.on_cooldown_elapsed(&name, retry_on_exit);
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn on_cooldown_elapsed(&self, name: &str, retry_on_exit: bool) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.refreshers.get_mut(name) else {
            return;
        };
        if entry.state.status != RefresherStatus::Cooldown {
            return;
        }
        let manual_origin = entry.last_run_was_manual;
        self.set_status(&mut state, name, RefresherStatus::Idle);
        self.arm_interval_timer_locked(&mut state, name);
        drop(state);

        // "On exit from cooldown after a failing automatic run, immediately schedule one retry"
        if retry_on_exit && !manual_origin {
            self.trigger(name, false).forget();
        }
    }
}

/// A handle to a just-triggered run: `.await` it to block until settled, or call `.forget()` to
/// detach and let it run in the background (used for automatic ticks).
struct Trigger {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Trigger {
    fn noop() -> Self {
        Self { handle: None }
    }

    fn spawned(handle: tokio::task::JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn forget(self) {}

    async fn settle(self) {
        if let Some(handle) = self.handle {
            let _ = handle.await;
        }
    }
}

enum RunOutcome {
    Success,
    Failure(String),
    Aborted,
}

async fn run_subscribers(
    subscribers: Vec<(u64, Subscriber)>,
    is_manual: bool,
    token: CancellationToken,
    timeout: Duration,
) -> RunOutcome {
    if subscribers.is_empty() {
        return RunOutcome::Success;
    }
    if token.is_cancelled() {
        return RunOutcome::Aborted;
    }

    let futures: Vec<_> = subscribers
        .into_iter()
        .map(|(_, sub)| {
            let token = token.clone();
            async move {
                tokio::select! {
                    result = tokio::time::timeout(timeout, sub(is_manual, token.clone())) => {
                        match result {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(message)) => Err(message),
                            Err(_) => Err("subscriber timed out".to_string()),
                        }
                    }
                    _ = token.cancelled() => Err("aborted".to_string()),
                }
            }
        })
        .collect();

    if token.is_cancelled() {
        return RunOutcome::Aborted;
    }

    let results = futures::future::join_all(futures).await;
    if token.is_cancelled() {
        return RunOutcome::Aborted;
    }

    let mut first_error = None;
    let mut any_success = false;
    for result in results {
        match result {
            Ok(()) => any_success = true,
            Err(message) => {
                if first_error.is_none() {
                    first_error = Some(message);
                }
            }
        }
    }

    if any_success {
        RunOutcome::Success
    } else {
        RunOutcome::Failure(first_error.unwrap_or_else(|| "all subscribers failed".to_string()))
    }
}

/// Compute the full (not just diff) current-view refresher target set from a context, used by
/// `trigger_manual_refresh_for_context`.
fn context_targets(ctx: &refresh_core::RefreshContext) -> Vec<String> {
    let mut targets = Vec::new();
    if ctx.current_view == Some(refresh_core::View::Namespace) {
        if let Some(view) = &ctx.active_namespace_view {
            targets.push(view.clone());
        }
    }
    if ctx.current_view == Some(refresh_core::View::Cluster) {
        if let Some(view) = &ctx.active_cluster_view {
            targets.push(view.clone());
        }
    }
    if ctx.object_panel.is_open {
        if let Some(kind) = &ctx.object_panel.object_kind {
            targets.push(format!("object-{kind}"));
            targets.push(format!("object-{kind}-events"));
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> RefreshManager {
        RefreshManager::new(Arc::new(EventBus::new()))
    }

    fn ok_subscriber() -> Subscriber {
        Arc::new(|_is_manual: bool, _token: CancellationToken| -> SubscriberFuture {
            Box::pin(async { Ok(()) })
        })
    }

    fn counting_subscriber(counter: Arc<AtomicUsize>) -> Subscriber {
        Arc::new(move |_is_manual: bool, _token: CancellationToken| -> SubscriberFuture {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn throwing_subscriber() -> Subscriber {
        Arc::new(|_is_manual: bool, _token: CancellationToken| -> SubscriberFuture {
            Box::pin(async { Err("boom".to_string()) })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn s1_manual_then_auto_tick_cycle() {
        let m = manager();
        m.register(
            RefresherConfig::new(
                "r",
                Duration::from_millis(1000),
                Duration::from_millis(300),
                Duration::from_secs(2),
            )
            .disabled(),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        let _sub = m.subscribe("r", counting_subscriber(counter.clone()));
        m.enable("r");
        tokio::task::yield_now().await;

        // First-run-on-enable fires immediately.
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(m.get_state("r").unwrap().status, RefresherStatus::Cooldown);

        tokio::time::advance(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;
        assert_eq!(m.get_state("r").unwrap().status, RefresherStatus::Idle);

        tokio::time::advance(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn s2_failing_subscriber_enters_cooldown_and_retries() {
        let m = manager();
        m.register(RefresherConfig::new(
            "r",
            Duration::from_millis(1000),
            Duration::from_millis(300),
            Duration::from_secs(2),
        ));
        let _sub = m.subscribe("r", throwing_subscriber());
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(m.get_state("r").unwrap().consecutive_errors, 1);
        assert_eq!(m.get_state("r").unwrap().status, RefresherStatus::Cooldown);

        tokio::time::advance(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;
        assert_eq!(m.get_state("r").unwrap().status, RefresherStatus::Refreshing);
    }

    #[tokio::test(start_paused = true)]
    async fn s3_global_pause_and_resume() {
        let m = manager();
        m.register(
            RefresherConfig::new(
                "a",
                Duration::from_millis(1000),
                Duration::from_millis(100),
                Duration::from_secs(1),
            )
            .disabled(),
        );
        m.register(
            RefresherConfig::new(
                "b",
                Duration::from_millis(1000),
                Duration::from_millis(100),
                Duration::from_secs(1),
            )
            .disabled(),
        );
        m.enable("a");
        m.enable("b");
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(101)).await;
        tokio::task::yield_now().await;

        m.pause(None);
        assert_eq!(m.get_state("a").unwrap().status, RefresherStatus::Paused);
        assert_eq!(m.get_state("b").unwrap().status, RefresherStatus::Paused);

        m.register(RefresherConfig::new(
            "c",
            Duration::from_millis(1000),
            Duration::from_millis(100),
            Duration::from_secs(1),
        ));
        tokio::task::yield_now().await;
        assert_eq!(m.get_state("c").unwrap().status, RefresherStatus::Paused);

        m.resume(None);
        assert_eq!(m.get_state("a").unwrap().status, RefresherStatus::Idle);
        assert_eq!(m.get_state("b").unwrap().status, RefresherStatus::Idle);
        assert_eq!(m.get_state("c").unwrap().status, RefresherStatus::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn re_registering_preserves_subscribers() {
        let m = manager();
        m.register(RefresherConfig::new(
            "r",
            Duration::from_millis(1000),
            Duration::from_millis(100),
            Duration::from_secs(1),
        ));
        let counter = Arc::new(AtomicUsize::new(0));
        let _sub = m.subscribe("r", counting_subscriber(counter.clone()));
        m.register(RefresherConfig::new(
            "r",
            Duration::from_millis(2000),
            Duration::from_millis(100),
            Duration::from_secs(1),
        ));
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_prunes_bucket() {
        let m = manager();
        m.register(
            RefresherConfig::new(
                "r",
                Duration::from_millis(1000),
                Duration::from_millis(100),
                Duration::from_secs(1),
            )
            .disabled(),
        );
        let handle = m.subscribe("r", ok_subscriber());
        handle.detach();
        let state = m.inner.state.lock();
        assert!(state.refreshers.get("r").unwrap().subscribers.is_empty());
    }
}
