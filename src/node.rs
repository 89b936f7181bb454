//! Node facade: wires discovery, transport, and the event bus together and
//! holds the uid→metadata registry observed by outer collaborators. Pushes
//! uid/addr/ports into its collaborators before starting them.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use serde_json::Value;

use crate::discovery::{DiscoveryIntervals, DiscoveryService};
use crate::error::NetError;
use crate::event_bus::{EventBus, NodeDiscovered, NodeLost};
use crate::transport::TransportService;

/// Configuration inputs accepted from the outer collaborator (§6): a stable
/// uid, the local address and its broadcast address, and two ports.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub uid: String,
    pub addr: String,
    pub broadcast_addr: String,
    pub discovery_port: u16,
    pub transport_port: u16,
}

impl NodeConfig {
    pub const DEFAULT_DISCOVERY_PORT: u16 = 50000;
    pub const DEFAULT_TRANSPORT_PORT: u16 = 50001;

    pub fn new(uid: impl Into<String>, addr: impl Into<String>, broadcast_addr: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            addr: addr.into(),
            broadcast_addr: broadcast_addr.into(),
            discovery_port: Self::DEFAULT_DISCOVERY_PORT,
            transport_port: Self::DEFAULT_TRANSPORT_PORT,
        }
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn with_transport_port(mut self, port: u16) -> Self {
        self.transport_port = port;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Configured,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    pub ip: String,
}

/// A single running instance of the networking core. `Created →
/// Configured → Running → Stopped`; transitions are one-way — restart
/// requires a new `Node`.
pub struct Node {
    uid: String,
    event_bus: Arc<EventBus>,
    discovery: Arc<DiscoveryService>,
    transport: Arc<TransportService>,
    nodes: Arc<Mutex<HashMap<String, NodeMetadata>>>,
    state: Mutex<NodeState>,
}

impl Node {
    /// Validates `config.addr` as an IPv4 address (§7: "invalid local
    /// address/mask" is fatal at facade startup), then wires the event bus,
    /// discovery, and transport together and pushes uid/addr/ports into
    /// them — the set-once configuration propagation described in §4.6.
    /// After this call the node is in the `Configured` state.
    pub fn new(config: NodeConfig) -> Result<Self, NetError> {
        Self::with_discovery_intervals(config, DiscoveryIntervals::default())
    }

    /// As [`Node::new`], but with non-default discovery timings — for
    /// tests that would otherwise wait out the real 10s/30s constants.
    pub fn with_discovery_intervals(config: NodeConfig, intervals: DiscoveryIntervals) -> Result<Self, NetError> {
        config.addr.parse::<std::net::Ipv4Addr>()?;

        let uid = config.uid.to_lowercase();
        let event_bus = Arc::new(EventBus::new());

        let discovery = Arc::new(DiscoveryService::with_intervals(
            uid.clone(),
            config.addr.clone(),
            config.discovery_port,
            config.broadcast_addr.clone(),
            event_bus.clone(),
            intervals,
        ));
        let transport = TransportService::new(uid.clone(), config.addr.clone(), config.transport_port, event_bus.clone());
        let nodes = Arc::new(Mutex::new(HashMap::new()));

        let node = Self {
            uid,
            event_bus,
            discovery,
            transport,
            nodes,
            state: Mutex::new(NodeState::Created),
        };
        node.wire_registry_handlers();
        *node.state.lock() = NodeState::Configured;
        Ok(node)
    }

    fn wire_registry_handlers(&self) {
        let nodes = self.nodes.clone();
        self.event_bus
            .subscribe_node_discovered(Arc::new(move |event: NodeDiscovered| {
                let nodes = nodes.clone();
                async move {
                    nodes.lock().insert(event.uid, NodeMetadata { ip: event.ip });
                    Ok(())
                }
            }));

        let nodes = self.nodes.clone();
        self.event_bus.subscribe_node_lost(Arc::new(move |event: NodeLost| {
            let nodes = nodes.clone();
            async move {
                nodes.lock().remove(&event.uid);
                Ok(())
            }
        }));
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// The event bus external collaborators subscribe to for
    /// `NodeDiscovered`/`NodeLost`/`MessageReceived`.
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// Snapshot of `{uid → metadata}` for discovered (and still live) peers.
    pub fn discovered_nodes(&self) -> HashMap<String, NodeMetadata> {
        self.nodes.lock().clone()
    }

    /// Starts transport, then awaits discovery startup. Both components
    /// bind their sockets before this call returns.
    pub async fn start_network(&self) -> Result<(), NetError> {
        {
            let state = self.state.lock();
            if *state != NodeState::Configured {
                return Err(NetError::InvalidState);
            }
        }

        self.transport.start().await?;
        info!("[Node] transport started");

        self.discovery.start().await?;
        info!("[Node] discovery started");

        *self.state.lock() = NodeState::Running;
        Ok(())
    }

    /// Strict shutdown: stops transport then discovery, in reverse
    /// startup order, and awaits both to quiescence before returning.
    pub async fn stop_network(&self) -> Result<(), NetError> {
        {
            let state = self.state.lock();
            if *state != NodeState::Running {
                return Err(NetError::InvalidState);
            }
        }

        self.transport.stop().await;
        self.discovery.stop().await;

        *self.state.lock() = NodeState::Stopped;
        Ok(())
    }

    /// Wraps `payload` as a `user` message and hands it to the transport.
    /// A no-op (logged, not an error) if there is no channel for `uid`.
    pub async fn send(&self, uid: &str, payload: Value) {
        self.transport.send(uid, payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(uid: &str, port_offset: u16) -> NodeConfig {
        NodeConfig::new(uid, "127.0.0.1", "127.0.0.1")
            .with_discovery_port(41000 + port_offset)
            .with_transport_port(42000 + port_offset)
    }

    #[test]
    fn new_node_is_configured_and_uid_is_canonicalized() {
        let node = Node::new(test_config("ABCD-1234", 0)).unwrap();
        assert_eq!(node.state(), NodeState::Configured);
        assert_eq!(node.uid(), "abcd-1234");
    }

    #[test]
    fn invalid_addr_is_rejected_at_construction() {
        let config = NodeConfig::new("node-bad", "not-an-ip", "127.0.0.1");
        let err = Node::new(config).unwrap_err();
        assert!(matches!(err, NetError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn start_network_requires_configured_state() {
        let node = Node::new(test_config("node-a", 1)).unwrap();
        node.start_network().await.unwrap();
        assert_eq!(node.state(), NodeState::Running);

        // Starting again from Running is rejected.
        let err = node.start_network().await.unwrap_err();
        assert!(matches!(err, NetError::InvalidState));

        node.stop_network().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn stop_network_requires_running_state() {
        let node = Node::new(test_config("node-b", 2)).unwrap();
        let err = node.stop_network().await.unwrap_err();
        assert!(matches!(err, NetError::InvalidState));
    }

    #[tokio::test]
    async fn send_before_start_is_not_reachable_but_does_not_panic() {
        let node = Node::new(test_config("node-c", 3)).unwrap();
        node.start_network().await.unwrap();
        node.send("nobody", serde_json::json!(1)).await;
        node.stop_network().await.unwrap();
    }
}
