//! TCP listen, outbound dial on discovery, peer-channel registry, reconnect,
//! and `send`.
//!
//! Inbound handshake validation, tie-break dial rule, and a
//! reconnect-with-back-off loop follow the "higher id connects, lower id
//! accepts" rule, built on cancellation-token-scoped background tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::NetError;
use crate::event_bus::{EventBus, MessageReceived, NodeDiscovered, NodeLost};
use crate::message::{Message, SystemBody};
use crate::peer_channel::{BoxFuture, ChannelEvents, PeerChannel};

const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_SPACING: Duration = Duration::from_millis(500);

enum DialError {
    ConnectionRefused,
    Other(std::io::Error),
}

/// TCP peer-channel registry and dial/reconnect policy, one instance per
/// node.
///
/// Holds a [`Weak`] reference to itself so that event-bus subscriptions and
/// channel callbacks — both of which need a `'static` handle back to this
/// service — don't require the service's owner (the node facade) to hand
/// out a strong `Arc` that would otherwise never be dropped (§9, cyclic
/// reference resolution).
pub struct TransportService {
    self_weak: Weak<TransportService>,
    uid: String,
    addr: String,
    port: u16,
    event_bus: Arc<EventBus>,
    peer_connections: Mutex<HashMap<String, Arc<PeerChannel>>>,
    listener_task: AsyncMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TransportService {
    pub fn new(uid: String, addr: String, port: u16, event_bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            uid,
            addr,
            port,
            event_bus,
            peer_connections: Mutex::new(HashMap::new()),
            listener_task: AsyncMutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("TransportService outlives its own event subscriptions and channels")
    }

    /// Snapshot of connected peer uids, for the node facade's registry.
    pub fn connected_uids(&self) -> Vec<String> {
        self.peer_connections.lock().keys().cloned().collect()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), NetError> {
        let svc = self.clone();
        self.event_bus
            .subscribe_node_discovered(Arc::new(move |event: NodeDiscovered| {
                let svc = svc.clone();
                async move {
                    svc.handle_node_discovered(event).await;
                    Ok(())
                }
            }));

        let svc = self.clone();
        self.event_bus
            .subscribe_node_lost(Arc::new(move |event: NodeLost| {
                let svc = svc.clone();
                async move {
                    svc.handle_node_lost(event).await;
                    Ok(())
                }
            }));

        let listener = TcpListener::bind((self.addr.as_str(), self.port))
            .await
            .map_err(|e| NetError::TransportBind {
                addr: self.addr.clone(),
                port: self.port,
                source: e,
            })?;

        let svc = self.clone();
        let handle = tokio::spawn(async move { svc.accept_loop(listener).await });
        *self.listener_task.lock().await = Some(handle);

        info!("[Transport] listening on {}:{}", self.addr, self.port);
        Ok(())
    }

    /// Closes the listening socket, then schedules (without awaiting) a
    /// close for every currently-registered channel.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.listener_task.lock().await.take() {
            let _ = task.await;
        }

        let channels: Vec<Arc<PeerChannel>> = {
            let mut map = self.peer_connections.lock();
            let uids: Vec<String> = map.keys().cloned().collect();
            uids.into_iter().filter_map(|uid| map.remove(&uid)).collect()
        };
        for channel in channels {
            tokio::spawn(async move { channel.close().await });
        }

        info!("[Transport] stopped");
    }

    /// Look the channel up under the registry lock, release it, then send.
    /// A missing channel is a dropped send with a log line, not an error.
    pub async fn send(&self, uid: &str, payload: Value) {
        let channel = self.peer_connections.lock().get(uid).cloned();
        match channel {
            Some(channel) => {
                if let Err(e) = channel.send(&Message::User(payload)).await {
                    warn!("[Transport] [{uid}]: error sending message: {e}");
                }
            }
            None => info!("[Transport] no connection to {uid}"),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let svc = self.clone();
                    tokio::spawn(async move { svc.handle_inbound(stream, peer_addr).await });
                }
                Err(e) => warn!("[Transport] accept error: {e}"),
            }
        }
        debug!("[Transport] accept loop stopped");
    }

    async fn handle_inbound(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        match read_handshake(&mut stream).await {
            Ok(Some(body)) => {
                info!("[Transport] new connection from {}", body.ip);
                self.create_peer_channel(body.id.clone(), body.ip, stream);
                info!("[Transport] peer channel created for [{}]", body.id);
            }
            Ok(None) => {
                let _ = stream.shutdown().await;
            }
            Err(e) => {
                warn!("[Transport] handshake error from {peer_addr}: {e}");
                let _ = stream.shutdown().await;
            }
        }
    }

    async fn handle_node_discovered(&self, event: NodeDiscovered) {
        let NodeDiscovered { uid, ip } = event;

        if self.peer_connections.lock().contains_key(&uid) {
            return;
        }

        // Tie-break: only the side with the lexicographically greater uid
        // dials; the other waits to accept.
        if uid <= self.uid {
            return;
        }

        info!("[Transport] connecting to node {uid} at {ip} via TCP");
        match self.dial(&uid, &ip).await {
            Ok(()) => {}
            Err(DialError::ConnectionRefused) => {
                info!("[Transport] unable to connect to {uid}: connection refused");
            }
            Err(DialError::Other(e)) => {
                warn!("[Transport] unexpected error dialing {uid}: {e}");
            }
        }
    }

    async fn handle_node_lost(&self, event: NodeLost) {
        let channel = self.peer_connections.lock().remove(&event.uid);
        if let Some(channel) = channel {
            channel.close().await;
            info!("[Transport] peer channel closed for {}", event.uid);
        }
    }

    async fn dial(&self, uid: &str, ip: &str) -> Result<(), DialError> {
        let mut stream = TcpStream::connect((ip, self.port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                DialError::ConnectionRefused
            } else {
                DialError::Other(e)
            }
        })?;

        let handshake = Message::System(SystemBody {
            id: self.uid.clone(),
            ip: self.addr.clone(),
        });
        let frame = handshake.encode_frame();
        stream.write_all(&frame).await.map_err(DialError::Other)?;
        stream.flush().await.map_err(DialError::Other)?;

        self.create_peer_channel(uid.to_string(), ip.to_string(), stream);
        info!("[Transport] connected and sent system message to [{uid}]");
        Ok(())
    }

    /// Create a channel and register it, closing (without blocking on) any
    /// stale entry already present for the same uid so the registry never
    /// holds more than one channel per uid even across a racing
    /// accept/dial.
    fn create_peer_channel(&self, uid: String, ip: String, stream: TcpStream) -> Arc<PeerChannel> {
        let events: Arc<dyn ChannelEvents> = self.arc();
        let channel = PeerChannel::spawn(uid.clone(), ip, stream, events);

        let previous = self.peer_connections.lock().insert(uid.clone(), channel.clone());
        if let Some(previous) = previous {
            tokio::spawn(async move {
                previous.close().await;
                debug!("[Transport] replaced stale channel for {uid}");
            });
        }
        channel
    }

    /// Re-enters the outbound protocol (§4.5) on every attempt rather than
    /// dialing raw: the existence check from step 1 is repeated before each
    /// dial, since a peer that re-establishes an inbound connection between
    /// attempts must not be clobbered. Only the tie-break (step 2) is
    /// skipped, per step 4 — the remote already has a relationship with us.
    async fn reconnect(self: Arc<Self>, uid: String, ip: String) {
        let existing = self.peer_connections.lock().remove(&uid);
        if let Some(channel) = existing {
            channel.close().await;
        }

        for attempt in 1..=RECONNECT_ATTEMPTS {
            if self.peer_connections.lock().contains_key(&uid) {
                info!("[Transport] [{uid}]: reconnect aborted, peer already reconnected");
                return;
            }

            match self.dial(&uid, &ip).await {
                Ok(()) => return,
                Err(DialError::ConnectionRefused) => {
                    info!("[Transport] [{uid}]: reconnection attempt {attempt} failed (connection refused)");
                }
                Err(DialError::Other(e)) => {
                    warn!("[Transport] unexpected error: {e}");
                    return;
                }
            }
            if attempt < RECONNECT_ATTEMPTS {
                sleep(RECONNECT_SPACING).await;
            }
        }
    }
}

impl ChannelEvents for TransportService {
    fn on_message(&self, uid: String, message: Message) -> BoxFuture<'static, ()> {
        let event_bus = self.event_bus.clone();
        Box::pin(async move {
            event_bus.publish_message_received(MessageReceived { uid, message }).await;
        })
    }

    /// Must not await `reconnect` inline: `reconnect` closes the existing
    /// channel, and `close()` awaits this very channel's receive/keepalive
    /// task — the task this callback is running on when connection loss is
    /// reported. Awaiting here would be a self-join deadlock, so the
    /// reconnect is spawned as a detached task instead (mirroring the
    /// original's `asyncio.create_task(self._try_reconnect(id, ip))`).
    fn on_connection_lost(&self, uid: String, ip: String) -> BoxFuture<'static, ()> {
        let svc = self.arc();
        tokio::spawn(async move { svc.reconnect(uid, ip).await });
        Box::pin(async {})
    }
}

/// Read exactly one frame from a not-yet-split stream and require it to be
/// a `system` handshake. Any deviation (EOF, bad frame, wrong type) yields
/// `Ok(None)`; the caller closes the socket silently.
async fn read_handshake(stream: &mut TcpStream) -> std::io::Result<Option<SystemBody>> {
    use tokio::io::AsyncReadExt;

    const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Ok(None);
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    let Ok(payload) = std::str::from_utf8(&buf) else {
        return Ok(None);
    };

    match Message::parse(payload) {
        Ok(Some(Message::System(body))) => Ok(Some(body)),
        _ => Ok(None),
    }
}
