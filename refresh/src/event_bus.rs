//! The process-wide event bus.
//!
//! Modeled as a broadcast channel rather than a callback registry: any number of listeners can
//! subscribe, and a slow listener cannot block the orchestrator.

use refresh_core::RefresherStatus;

/// Events the orchestrator listens for, published by the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// The UI navigated away entirely (e.g. logged out, or switched workspaces).
    ViewReset,
    /// A kubeconfig change is about to happen.
    KubeconfigChanging,
    /// A kubeconfig change has completed.
    KubeconfigChanged,
    /// The selected kubeconfig context changed without a full reload.
    KubeconfigSelectionChanged,
    /// A resource stream for `(domain, scope)` has drifted (missed updates, transport died) and
    /// should be treated as unreliable until the next global reset.
    ResourceStreamDrift {
        /// The affected domain.
        domain: String,
        /// The affected scope.
        scope: String,
        /// A human-readable reason, for logging.
        reason: String,
    },
}

/// Events the core publishes for UI/telemetry consumption.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// A refresher's status changed.
    RefreshStateChange {
        /// The refresher's name.
        name: String,
        /// Its new status.
        state: RefresherStatus,
    },
    /// A refresher run started.
    RefreshStart {
        /// The refresher's name.
        name: String,
        /// Whether this run was manually triggered.
        is_manual: bool,
    },
    /// A refresher run completed.
    RefreshComplete {
        /// The refresher's name.
        name: String,
        /// Whether this run was manually triggered.
        is_manual: bool,
        /// Whether at least one subscriber succeeded.
        success: bool,
        /// The recorded error, if the run failed.
        error: Option<String>,
    },
    /// A refresher was registered (first time, or re-registered).
    RefreshRegistered {
        /// The refresher's name.
        name: String,
    },
    /// A domain fetch failed with a disposition the orchestrator's error policy decided to
    /// surface.
    DomainError {
        /// The domain the failure belongs to.
        domain: String,
        /// The scope the failure belongs to, if the domain is scoped.
        scope: Option<String>,
        /// The formatted, de-duplicated error message.
        message: String,
    },
}

/// Capacity for the broadcast channels backing the event bus. Generous enough that a burst of
/// ticks across every refresher never blocks the publisher; a channel this small existing at
/// all is about back-pressure sanity, not steady-state load.
const CHANNEL_CAPACITY: usize = 256;

/// The process-wide event bus: one broadcast channel for inbound events, one for outbound.
pub struct EventBus {
    inbound_tx: async_broadcast::Sender<InboundEvent>,
    inbound_rx: async_broadcast::InactiveReceiver<InboundEvent>,
    outbound_tx: async_broadcast::Sender<OutboundEvent>,
    outbound_rx: async_broadcast::InactiveReceiver<OutboundEvent>,
}

impl EventBus {
    /// Construct a fresh bus with no subscribers yet.
    pub fn new() -> Self {
        let (mut inbound_tx, inbound_rx) = async_broadcast::broadcast(CHANNEL_CAPACITY);
        inbound_tx.set_overflow(true);
        let (mut outbound_tx, outbound_rx) = async_broadcast::broadcast(CHANNEL_CAPACITY);
        outbound_tx.set_overflow(true);
        Self {
            inbound_tx,
            inbound_rx: inbound_rx.deactivate(),
            outbound_tx,
            outbound_rx: outbound_rx.deactivate(),
        }
    }

    /// Publish an inbound event (normally called by the host application).
    pub fn publish_inbound(&self, event: InboundEvent) {
        let _ = self.inbound_tx.try_broadcast(event);
    }

    /// Publish an outbound event (called by the manager/orchestrator).
    pub fn publish_outbound(&self, event: OutboundEvent) {
        let _ = self.outbound_tx.try_broadcast(event);
    }

    /// Subscribe to inbound events (used internally by the orchestrator).
    pub fn subscribe_inbound(&self) -> async_broadcast::Receiver<InboundEvent> {
        self.inbound_rx.activate_cloned()
    }

    /// Subscribe to outbound events (used by the UI/telemetry layer).
    pub fn subscribe_outbound(&self) -> async_broadcast::Receiver<OutboundEvent> {
        self.outbound_rx.activate_cloned()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_outbound();
        bus.publish_outbound(OutboundEvent::RefreshRegistered {
            name: "pods".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            OutboundEvent::RefreshRegistered {
                name: "pods".into()
            }
        );
    }

    #[tokio::test]
    async fn inbound_events_reach_multiple_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_inbound();
        let mut b = bus.subscribe_inbound();
        bus.publish_inbound(InboundEvent::ViewReset);
        assert_eq!(a.recv().await.unwrap(), InboundEvent::ViewReset);
        assert_eq!(b.recv().await.unwrap(), InboundEvent::ViewReset);
    }
}
