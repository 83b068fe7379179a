//! Streaming lifecycle bookkeeping for scoped and non-scoped streaming domains (§4.2).
//!
//! Three maps, keyed by `"<domain>::<scope>"`, track the lifecycle exactly as the distilled spec
//! names them: an active cleanup handle, a start future still in flight, and a set of keys whose
//! pending start must be torn down the moment it resolves.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

use futures::future::Shared;
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;

/// A cleanup handle returned by a streaming provider's `start`.
pub type StreamingCleanup = Arc<dyn Fn() + Send + Sync>;

/// A streaming start future shared between the pending-lookup table and its eventual resolution.
pub type PendingFuture = Shared<Pin<Box<dyn std::future::Future<Output = StreamingCleanup> + Send>>>;

/// Tracks in-flight and active streams across all scoped/non-scoped streaming domains.
#[derive(Default)]
pub struct StreamingTable {
    inner: AsyncMutex<Inner>,
}

#[derive(Default)]
struct Inner {
    cleanup: HashMap<String, StreamingCleanup>,
    pending: HashMap<String, PendingFuture>,
    cancelled: HashSet<String>,
    blocked: HashSet<String>,
}

impl StreamingTable {
    /// Build the tracking key for a (domain, scope) pair.
    pub fn key(domain: &str, scope: &str) -> String {
        format!("{domain}::{scope}")
    }

    /// `true` if a stream is currently active (fully started) for `key`.
    pub async fn is_active(&self, key: &str) -> bool {
        self.inner.lock().await.cleanup.contains_key(key)
    }

    /// `true` if `key` has been blocked by a resource-stream-drift event.
    pub async fn is_blocked(&self, key: &str) -> bool {
        self.inner.lock().await.blocked.contains(key)
    }

    /// Mark `key` as blocked (drift) until the next global reset.
    pub async fn block(&self, key: &str) {
        self.inner.lock().await.blocked.insert(key.to_string());
    }

    /// Register a pending start future for `key`. Overwrites any prior pending entry for the same
    /// key (callers are expected to have checked `is_active`/pending state first).
    pub async fn begin_start(&self, key: &str, future: PendingFuture) {
        self.inner.lock().await.pending.insert(key.to_string(), future);
    }

    /// Resolve a pending start: install the cleanup handle unless the key was cancelled while
    /// starting, in which case the cleanup is invoked immediately and nothing is installed.
    pub async fn finish_start(&self, key: &str, cleanup: StreamingCleanup) {
        let mut inner = self.inner.lock().await;
        inner.pending.remove(key);
        if inner.cancelled.remove(key) {
            cleanup();
        } else {
            inner.cleanup.insert(key.to_string(), cleanup);
        }
    }

    /// Await and remove any pending start for `key`, invoking its cleanup once resolved. Returns
    /// `true` if a pending start was found (the caller should not also look at `cleanup`).
    pub async fn await_pending_and_stop(&self, key: &str) -> bool {
        let pending = {
            let mut inner = self.inner.lock().await;
            inner.cancelled.insert(key.to_string());
            inner.pending.get(key).cloned()
        };
        match pending {
            Some(future) => {
                let cleanup = future.await;
                let mut inner = self.inner.lock().await;
                if inner.pending.remove(key).is_some() {
                    cleanup();
                }
                true
            }
            None => false,
        }
    }

    /// `true` if `key` is either actively streaming or has a start in flight.
    pub async fn is_tracked(&self, key: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.cleanup.contains_key(key) || inner.pending.contains_key(key)
    }

    /// Remove and invoke the active cleanup for `key`, if one exists.
    pub async fn stop_active(&self, key: &str) {
        let cleanup = self.inner.lock().await.cleanup.remove(key);
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    /// Remove a key from the blocked set (used on global reset).
    pub async fn unblock(&self, key: &str) {
        self.inner.lock().await.blocked.remove(key);
    }

    /// Clear every blocked key, used by `kubeconfig:changed`/`kubeconfig:selection-changed`
    /// (the backend may have rebuilt its streams, so prior drift blocks no longer apply).
    pub async fn clear_blocked(&self) {
        self.inner.lock().await.blocked.clear();
    }

    /// Tear down every tracked stream: invokes every active cleanup, marks every pending start as
    /// cancelled, and clears the blocked set. Used on `view:reset`.
    pub async fn reset_all(&self) {
        let mut inner = self.inner.lock().await;
        for (_, cleanup) in inner.cleanup.drain() {
            cleanup();
        }
        for key in inner.pending.keys() {
            inner.cancelled.insert(key.clone());
        }
        inner.blocked.clear();
    }

    /// `true` if no stream is active and none is pending, for any key (§8 invariant 6).
    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.cleanup.is_empty() && inner.pending.is_empty()
    }
}

/// Wrap a plain async start future so it can be shared between a pending lookup and its
/// eventual resolution.
pub fn share_start_future<F>(future: F) -> PendingFuture
where
    F: std::future::Future<Output = StreamingCleanup> + Send + 'static,
{
    (Box::pin(future) as Pin<Box<dyn std::future::Future<Output = StreamingCleanup> + Send>>)
        .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn finish_start_installs_cleanup_when_not_cancelled() {
        let table = StreamingTable::default();
        let key = StreamingTable::key("pods", "cluster-a|ns:team");
        table
            .finish_start(&key, Arc::new(|| {}))
            .await;
        assert!(table.is_active(&key).await);
    }

    #[tokio::test]
    async fn cancelled_pending_start_invokes_cleanup_immediately() {
        let table = StreamingTable::default();
        let key = StreamingTable::key("pods", "cluster-a|ns:team");
        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked2 = invoked.clone();

        table
            .begin_start(&key, share_start_future(async move { Arc::new(|| {}) as StreamingCleanup }))
            .await;
        table.inner.lock().await.cancelled.insert(key.clone());
        table
            .finish_start(
                &key,
                Arc::new(move || {
                    invoked2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert!(!table.is_active(&key).await);
    }

    #[tokio::test]
    async fn reset_all_invokes_every_active_cleanup() {
        let table = StreamingTable::default();
        let invoked = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let invoked = invoked.clone();
            let key = StreamingTable::key("pods", &format!("cluster-{i}|"));
            table
                .finish_start(
                    &key,
                    Arc::new(move || {
                        invoked.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .await;
        }
        table.reset_all().await;
        assert_eq!(invoked.load(Ordering::SeqCst), 3);
        assert!(table.is_empty().await);
    }
}
