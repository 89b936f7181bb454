//! UDP broadcast discovery: periodic hello/bye beacons and liveness tracking.
//!
//! `hello`/`bye` JSON datagrams, interval constants
//! (`BROADCAST_INTERVAL`/`CLEANUP_INTERVAL`/`NODE_TIMEOUT` = 10s/10s/30s),
//! a `socket2`-based reusable UDP bind, and cancellation-token-scoped tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::NetError;
use crate::event_bus::{EventBus, NodeDiscovered, NodeLost};

pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(10);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
pub const NODE_TIMEOUT: Duration = Duration::from_secs(30);
const GOODBYE_REPEATS: u32 = 3;
const GOODBYE_SPACING: Duration = Duration::from_millis(300);

const ACTION_HELLO: &str = "hello";
const ACTION_BYE: &str = "bye";

#[derive(Debug, Clone)]
pub struct DiscoveredNode {
    pub ip: String,
    pub last_seen: Instant,
}

#[derive(Debug, Serialize, Deserialize)]
struct Beacon {
    action: String,
    id: Option<String>,
    ip: Option<String>,
}

/// Tunable intervals, split out so tests can run the service on
/// millisecond-scale timers instead of the production 10s/30s values.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryIntervals {
    pub broadcast: Duration,
    pub cleanup: Duration,
    pub node_timeout: Duration,
}

impl Default for DiscoveryIntervals {
    fn default() -> Self {
        Self {
            broadcast: BROADCAST_INTERVAL,
            cleanup: CLEANUP_INTERVAL,
            node_timeout: NODE_TIMEOUT,
        }
    }
}

/// UDP broadcast discovery, one instance per node.
pub struct DiscoveryService {
    uid: String,
    addr: String,
    port: u16,
    broadcast_addr: String,
    event_bus: Arc<EventBus>,
    intervals: DiscoveryIntervals,
    discovered: Arc<Mutex<HashMap<String, DiscoveredNode>>>,
    socket: AsyncMutex<Option<Arc<UdpSocket>>>,
    cancel: CancellationToken,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(
        uid: String,
        addr: String,
        port: u16,
        broadcast_addr: String,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self::with_intervals(uid, addr, port, broadcast_addr, event_bus, DiscoveryIntervals::default())
    }

    pub fn with_intervals(
        uid: String,
        addr: String,
        port: u16,
        broadcast_addr: String,
        event_bus: Arc<EventBus>,
        intervals: DiscoveryIntervals,
    ) -> Self {
        Self {
            uid,
            addr,
            port,
            broadcast_addr,
            event_bus,
            intervals,
            discovered: Arc::new(Mutex::new(HashMap::new())),
            socket: AsyncMutex::new(None),
            cancel: CancellationToken::new(),
            tasks: AsyncMutex::new(Vec::new()),
        }
    }

    /// Snapshot of the discovered-node map, for the node facade's registry.
    pub fn discovered_nodes(&self) -> HashMap<String, DiscoveredNode> {
        self.discovered.lock().clone()
    }

    pub async fn start(&self) -> Result<(), NetError> {
        let socket = bind_reusable_udp(self.port)?;
        *self.socket.lock().await = Some(socket.clone());

        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(run_beacon_task(
            socket.clone(),
            self.uid.clone(),
            self.addr.clone(),
            self.broadcast_addr.clone(),
            self.port,
            self.intervals.broadcast,
            self.cancel.clone(),
        )));

        tasks.push(tokio::spawn(run_cleanup_task(
            self.discovered.clone(),
            self.event_bus.clone(),
            self.intervals.cleanup,
            self.intervals.node_timeout,
            self.cancel.clone(),
        )));

        tasks.push(tokio::spawn(run_listener_task(
            socket,
            self.uid.clone(),
            self.discovered.clone(),
            self.event_bus.clone(),
            self.cancel.clone(),
        )));

        info!(
            "[Discovery] started on 0.0.0.0:{} (broadcast {})",
            self.port, self.broadcast_addr
        );
        Ok(())
    }

    pub async fn stop(&self) {
        let socket_guard = self.socket.lock().await;
        if let Some(socket) = socket_guard.as_ref() {
            say_goodbye(socket, &self.uid, &self.addr, &self.broadcast_addr, self.port).await;
        }
        drop(socket_guard);

        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        *self.socket.lock().await = None;
        info!("[Discovery] stopped");
    }
}

fn bind_reusable_udp(port: u16) -> Result<Arc<UdpSocket>, NetError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
        NetError::DiscoveryBind { port, source: e }
    })?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetError::DiscoveryBind { port, source: e })?;
    #[cfg(not(target_os = "windows"))]
    socket
        .set_reuse_port(true)
        .map_err(|e| NetError::DiscoveryBind { port, source: e })?;
    socket
        .set_broadcast(true)
        .map_err(|e| NetError::DiscoveryBind { port, source: e })?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetError::DiscoveryBind { port, source: e })?;

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket
        .bind(&addr.into())
        .map_err(|e| NetError::DiscoveryBind { port, source: e })?;

    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket =
        UdpSocket::from_std(std_socket).map_err(|e| NetError::DiscoveryBind { port, source: e })?;
    Ok(Arc::new(tokio_socket))
}

async fn run_beacon_task(
    socket: Arc<UdpSocket>,
    uid: String,
    addr: String,
    broadcast_addr: String,
    port: u16,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let beacon = Beacon {
            action: ACTION_HELLO.to_string(),
            id: Some(uid.clone()),
            ip: Some(addr.clone()),
        };
        send_beacon(&socket, &beacon, &broadcast_addr, port).await;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
    debug!("[Discovery] beacon task stopped");
}

async fn run_cleanup_task(
    discovered: Arc<Mutex<HashMap<String, DiscoveredNode>>>,
    event_bus: Arc<EventBus>,
    interval: Duration,
    node_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let now = Instant::now();
        let expired: Vec<String> = {
            let map = discovered.lock();
            map.iter()
                .filter(|(_, data)| now.duration_since(data.last_seen) > node_timeout)
                .map(|(uid, _)| uid.clone())
                .collect()
        };

        for uid in expired {
            let removed = discovered.lock().remove(&uid).is_some();
            if removed {
                info!("[Discovery] node {uid} timed out, removing");
                event_bus.publish_node_lost(NodeLost { uid }).await;
            }
        }
    }
    debug!("[Discovery] cleanup task stopped");
}

async fn run_listener_task(
    socket: Arc<UdpSocket>,
    self_uid: String,
    discovered: Arc<Mutex<HashMap<String, DiscoveredNode>>>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let recv = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => res,
        };

        let (len, peer_addr) = match recv {
            Ok(v) => v,
            Err(e) => {
                warn!("[Discovery] recv error: {e}");
                continue;
            }
        };

        handle_datagram(&buf[..len], peer_addr, &self_uid, &discovered, &event_bus).await;
    }
    debug!("[Discovery] listener task stopped");
}

async fn handle_datagram(
    data: &[u8],
    peer_addr: SocketAddr,
    self_uid: &str,
    discovered: &Arc<Mutex<HashMap<String, DiscoveredNode>>>,
    event_bus: &Arc<EventBus>,
) {
    let beacon: Beacon = match serde_json::from_slice(data) {
        Ok(b) => b,
        Err(_) => {
            warn!("[Discovery] incorrect JSON in message from {peer_addr}");
            return;
        }
    };

    let (Some(uid), Some(ip)) = (beacon.id, beacon.ip) else {
        warn!("[Discovery] expected field missing in message from {peer_addr}");
        return;
    };

    if uid == self_uid {
        return;
    }

    match beacon.action.as_str() {
        ACTION_HELLO => {
            let is_new = {
                let mut map = discovered.lock();
                let is_new = !map.contains_key(&uid);
                map.insert(
                    uid.clone(),
                    DiscoveredNode {
                        ip: ip.clone(),
                        last_seen: Instant::now(),
                    },
                );
                is_new
            };
            if is_new {
                info!("[Discovery] discovered new node {uid}");
                event_bus
                    .publish_node_discovered(NodeDiscovered { uid, ip })
                    .await;
            }
        }
        ACTION_BYE => {
            let existed = discovered.lock().remove(&uid).is_some();
            if existed {
                info!("[Discovery] received farewell from {uid}");
                event_bus.publish_node_lost(NodeLost { uid }).await;
            } else {
                warn!("[Discovery] attempt to delete non-existent node: {uid}");
            }
        }
        other => {
            debug!("[Discovery] ignoring unknown action {other:?} from {peer_addr}");
        }
    }
}

async fn send_beacon(socket: &UdpSocket, beacon: &Beacon, broadcast_addr: &str, port: u16) {
    let json = match serde_json::to_vec(beacon) {
        Ok(j) => j,
        Err(e) => {
            warn!("[Discovery] failed to encode beacon: {e}");
            return;
        }
    };
    if let Err(e) = socket.send_to(&json, (broadcast_addr, port)).await {
        warn!("[Discovery] unexpected error sending beacon: {e}");
    }
}

async fn say_goodbye(socket: &UdpSocket, uid: &str, addr: &str, broadcast_addr: &str, port: u16) {
    let beacon = Beacon {
        action: ACTION_BYE.to_string(),
        id: Some(uid.to_string()),
        ip: Some(addr.to_string()),
    };
    for _ in 0..GOODBYE_REPEATS {
        send_beacon(socket, &beacon, broadcast_addr, port).await;
        sleep(GOODBYE_SPACING).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn self_originated_beacon_is_ignored() {
        let discovered = Arc::new(Mutex::new(HashMap::new()));
        let event_bus = Arc::new(EventBus::new());
        let data = serde_json::to_vec(&Beacon {
            action: ACTION_HELLO.to_string(),
            id: Some("self-uid".to_string()),
            ip: Some("10.0.0.5".to_string()),
        })
        .unwrap();

        handle_datagram(
            &data,
            "10.0.0.5:50000".parse().unwrap(),
            "self-uid",
            &discovered,
            &event_bus,
        )
        .await;

        assert!(discovered.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_ignored() {
        let discovered = Arc::new(Mutex::new(HashMap::new()));
        let event_bus = Arc::new(EventBus::new());

        handle_datagram(
            b"hello\n",
            "10.0.0.5:50000".parse().unwrap(),
            "self-uid",
            &discovered,
            &event_bus,
        )
        .await;

        assert!(discovered.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_id_field_is_ignored() {
        let discovered = Arc::new(Mutex::new(HashMap::new()));
        let event_bus = Arc::new(EventBus::new());
        let data = br#"{"action":"hello"}"#;

        handle_datagram(
            data,
            "10.0.0.5:50000".parse().unwrap(),
            "self-uid",
            &discovered,
            &event_bus,
        )
        .await;

        assert!(discovered.lock().is_empty());
    }

    #[tokio::test]
    async fn duplicate_hello_only_publishes_once() {
        let discovered = Arc::new(Mutex::new(HashMap::new()));
        let event_bus = Arc::new(EventBus::new());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        event_bus.subscribe_node_discovered(Arc::new(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }));

        let data = serde_json::to_vec(&Beacon {
            action: ACTION_HELLO.to_string(),
            id: Some("peer-1".to_string()),
            ip: Some("10.0.0.9".to_string()),
        })
        .unwrap();

        for _ in 0..2 {
            handle_datagram(
                &data,
                "10.0.0.9:50000".parse().unwrap(),
                "self-uid",
                &discovered,
                &event_bus,
            )
            .await;
        }

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(discovered.lock().len(), 1);
    }

    #[tokio::test]
    async fn bye_for_unknown_node_publishes_nothing() {
        let discovered = Arc::new(Mutex::new(HashMap::new()));
        let event_bus = Arc::new(EventBus::new());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        event_bus.subscribe_node_lost(Arc::new(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }));

        let data = serde_json::to_vec(&Beacon {
            action: ACTION_BYE.to_string(),
            id: Some("ghost".to_string()),
            ip: Some("10.0.0.9".to_string()),
        })
        .unwrap();

        handle_datagram(
            &data,
            "10.0.0.9:50000".parse().unwrap(),
            "self-uid",
            &discovered,
            &event_bus,
        )
        .await;

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
