//! Registry of live endpoints keyed by node address.

use crate::endpoint::Endpoint;
use gate_wire::NodeAddress;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Thread-safe map from [`NodeAddress`] to [`Endpoint`]
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<NodeAddress, Arc<dyn Endpoint>>>,
}

impl EndpointRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the endpoint previously stored under `node`
    pub fn insert(&self, node: NodeAddress, endpoint: Arc<dyn Endpoint>) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.write().insert(node, endpoint)
    }

    /// Insert only if `node` is free. Returns whether the endpoint was stored.
    pub fn insert_if_absent(&self, node: NodeAddress, endpoint: Arc<dyn Endpoint>) -> bool {
        match self.endpoints.write().entry(node) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(endpoint);
                true
            }
        }
    }

    /// Remove and return the endpoint under `node`
    pub fn remove(&self, node: NodeAddress) -> Option<Arc<dyn Endpoint>> {
        let removed = self.endpoints.write().remove(&node);
        if removed.is_some() {
            debug!(%node, "endpoint unregistered");
        }
        removed
    }

    /// Endpoint under `node`
    pub fn get(&self, node: NodeAddress) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.read().get(&node).cloned()
    }

    /// Snapshot of every registered address
    pub fn keys(&self) -> Vec<NodeAddress> {
        self.endpoints.read().keys().copied().collect()
    }

    /// Visit every entry under the read lock.
    ///
    /// `f` must not call back into this registry's mutating methods: the
    /// read lock is held for the whole walk and a write from inside
    /// deadlocks.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(NodeAddress, &Arc<dyn Endpoint>),
    {
        for (node, endpoint) in self.endpoints.read().iter() {
            f(*node, endpoint);
        }
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    /// Gracefully close and unregister every endpoint
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.endpoints.write().drain().collect();
        info!(count = drained.len(), "closing all endpoints");
        for (_, endpoint) in drained {
            endpoint.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{SendMode, UserData};
    use crate::error::SessionError;
    use crate::message::Message;
    use crate::stream::{SessionFault, SessionState};
    use async_trait::async_trait;
    use gate_wire::CipherHooks;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Default)]
    struct StubEndpoint {
        node: AtomicU64,
        closed: AtomicBool,
    }

    impl StubEndpoint {
        fn at(node: NodeAddress) -> Arc<Self> {
            let stub = Arc::new(Self::default());
            stub.set_node(node);
            stub
        }
    }

    #[async_trait]
    impl Endpoint for StubEndpoint {
        fn node(&self) -> NodeAddress {
            NodeAddress::from_raw(self.node.load(Ordering::SeqCst))
        }
        fn set_node(&self, node: NodeAddress) {
            self.node.store(node.raw(), Ordering::SeqCst);
        }
        fn remote_addr(&self) -> &str {
            "stub"
        }
        fn user_data(&self) -> Option<UserData> {
            None
        }
        fn set_user_data(&self, _data: UserData) {}
        fn set_cipher(&self, _hooks: CipherHooks) {}
        fn set_send_queue(&self, _capacity: usize) -> Result<(), SessionError> {
            Ok(())
        }
        fn set_recv_queue(&self, _tx: mpsc::Sender<Message>) {}
        fn set_error_queue(&self, _tx: mpsc::Sender<SessionFault>) {}
        fn start(self: Arc<Self>, _ctx: CancellationToken) -> Result<(), SessionError> {
            Ok(())
        }
        async fn send_message(&self, _msg: Message, _mode: SendMode) -> Result<(), SessionError> {
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn force_close(&self, _reason: SessionError) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn state(&self) -> SessionState {
            if self.closed.load(Ordering::SeqCst) {
                SessionState::Closed
            } else {
                SessionState::Running
            }
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = EndpointRegistry::new();
        let node = NodeAddress::gateway_session(1, 1);
        assert!(registry.is_empty());

        assert!(registry.insert(node, StubEndpoint::at(node)).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(node).unwrap().node(), node);

        assert!(registry.insert(node, StubEndpoint::at(node)).is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(node).is_some());
        assert!(registry.remove(node).is_none());
        assert!(registry.get(node).is_none());
    }

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let registry = EndpointRegistry::new();
        let node = NodeAddress::backend(3, 9);
        let first = StubEndpoint::at(node);
        let second = StubEndpoint::at(NodeAddress::backend(3, 10));

        assert!(registry.insert_if_absent(node, first));
        assert!(!registry.insert_if_absent(node, second));
        assert_eq!(registry.get(node).unwrap().node(), node);
    }

    #[test]
    fn test_keys_and_for_each() {
        let registry = EndpointRegistry::new();
        for id in 0..5 {
            let node = NodeAddress::gateway_session(2, id);
            registry.insert(node, StubEndpoint::at(node));
        }

        let mut keys = registry.keys();
        keys.sort();
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0], NodeAddress::gateway_session(2, 0));

        let mut visited = 0;
        registry.for_each(|node, endpoint| {
            assert_eq!(node, endpoint.node());
            visited += 1;
        });
        assert_eq!(visited, 5);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = EndpointRegistry::new();
        let stubs: Vec<_> = (0..3)
            .map(|id| {
                let node = NodeAddress::gateway_session(1, id);
                let stub = StubEndpoint::at(node);
                registry.insert(node, stub.clone());
                stub
            })
            .collect();

        registry.close_all().await;

        assert!(registry.is_empty());
        assert!(stubs.iter().all(|s| s.state() == SessionState::Closed));
    }
}
