//! [`RefreshSystem`]: the single construction site a host process uses to stand up the whole
//! refresh coordination core.

use std::sync::Arc;

use refresh_core::RefreshSystemConfig;

use crate::client::SnapshotClient;
use crate::event_bus::EventBus;
use crate::manager::RefreshManager;
use crate::orchestrator::RefreshOrchestrator;
use crate::store::{self, Store};

/// Owns one [`RefreshManager`], one [`RefreshOrchestrator`], one reactive store, one
/// [`SnapshotClient`], and an [`EventBus`] handle, wired together exactly as
/// `RefreshOrchestrator::new` expects. A host application constructs exactly one of these and
/// hands domain registration / context updates / UI subscriptions off to its fields from there.
#[derive(Clone)]
pub struct RefreshSystem {
    orchestrator: RefreshOrchestrator,
    store: Store,
    events: Arc<EventBus>,
}

impl RefreshSystem {
    /// Build the core: a fresh event bus, manager, store, and orchestrator, wired to `client`.
    pub fn new(config: RefreshSystemConfig, client: SnapshotClient) -> Self {
        let events = Arc::new(EventBus::new());
        let manager = RefreshManager::new(events.clone());
        let writer = store::Writer::new();
        let store = writer.as_reader();
        let orchestrator = RefreshOrchestrator::new(manager, writer, Arc::new(client), events.clone(), config);
        Self {
            orchestrator,
            store,
            events,
        }
    }

    /// The domain-registration / scope / streaming / fetch API.
    pub fn orchestrator(&self) -> &RefreshOrchestrator {
        &self.orchestrator
    }

    /// The read-only handle a UI layer subscribes against.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The outbound event stream (`refresh:state-change`, `refresh:error`, ...).
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RawResponse, RefreshBackend};
    use futures::future::BoxFuture;

    struct NullBackend;

    impl RefreshBackend for NullBackend {
        fn get_base_url(&self) -> BoxFuture<'static, Result<String, String>> {
            Box::pin(async { Ok("http://backend.local".to_string()) })
        }

        fn get(
            &self,
            _path: String,
            _if_none_match: Option<String>,
        ) -> BoxFuture<'static, Result<RawResponse, String>> {
            Box::pin(async {
                Ok(RawResponse {
                    status: http::StatusCode::NOT_MODIFIED,
                    etag: None,
                    body: bytes::Bytes::new(),
                })
            })
        }

        fn post_json(
            &self,
            _path: String,
            _body: serde_json::Value,
        ) -> BoxFuture<'static, Result<RawResponse, String>> {
            Box::pin(async {
                Ok(RawResponse {
                    status: http::StatusCode::OK,
                    etag: None,
                    body: bytes::Bytes::new(),
                })
            })
        }
    }

    #[tokio::test]
    async fn new_wires_orchestrator_store_and_events_together() {
        let client = SnapshotClient::new(Arc::new(NullBackend), RefreshSystemConfig::default());
        let system = RefreshSystem::new(RefreshSystemConfig::default(), client);

        system.orchestrator().register_domain(refresh_core::DomainConfig::new(
            "catalog",
            refresh_core::DomainCategory::System,
        ));
        assert_eq!(system.store().get_domain_state("catalog").status, refresh_core::SnapshotStatus::Idle);

        let mut outbound = system.events().subscribe_outbound();
        system.orchestrator().trigger_manual_refresh("catalog").await;
        let event = outbound.recv().await.unwrap();
        assert!(matches!(event, crate::event_bus::OutboundEvent::RefreshStateChange { .. }));
    }
}
