//! One TCP connection to one remote peer: framed I/O, keepalive, graceful
//! close.
//!
//! Length-prefixed send/receive, a reserved `__keepalive__` filler, and an
//! idempotent `close()`, built on split read/write halves and a
//! cancellation-token-scoped receive/keepalive task pair. Keepalive
//! filtering and codec parsing both happen inside the channel; it surfaces
//! only typed messages to its caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::message::{Message, KEEPALIVE};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Callbacks a peer channel reports to its owner (the transport service).
///
/// **Contract:** implementations must not `.await` a `close()` on the
/// reporting channel *inline* inside either callback — doing so would
/// deadlock against the channel's own task awaiting its own completion in
/// `close()`. Schedule follow-up work with `tokio::spawn` instead.
pub trait ChannelEvents: Send + Sync {
    fn on_message(&self, uid: String, message: Message) -> BoxFuture<'static, ()>;
    fn on_connection_lost(&self, uid: String, ip: String) -> BoxFuture<'static, ()>;
}

pub struct PeerChannel {
    pub uid: String,
    pub ip: String,
    state: Mutex<ChannelState>,
    closing: AtomicBool,
    writer: AsyncMutex<OwnedWriteHalf>,
    cancel: CancellationToken,
    listen_task: AsyncMutex<Option<JoinHandle<()>>>,
    keepalive_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl PeerChannel {
    /// Wrap an already-connected (post-handshake) stream, and start the
    /// receive and keepalive tasks. Entering `Open` happens here.
    pub fn spawn(uid: String, ip: String, stream: TcpStream, events: Arc<dyn ChannelEvents>) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();

        let channel = Arc::new(Self {
            uid,
            ip,
            state: Mutex::new(ChannelState::Open),
            closing: AtomicBool::new(false),
            writer: AsyncMutex::new(write_half),
            cancel,
            listen_task: AsyncMutex::new(None),
            keepalive_task: AsyncMutex::new(None),
        });

        let listen_handle = tokio::spawn(receive_loop(
            channel.clone(),
            read_half,
            events.clone(),
            channel.cancel.clone(),
        ));
        let keepalive_handle = tokio::spawn(keepalive_loop(
            channel.clone(),
            events,
            channel.cancel.clone(),
        ));

        // These locks never contend: nothing else can reach the task slots
        // before `spawn` returns the Arc.
        *channel.listen_task.try_lock().expect("fresh channel") = Some(listen_handle);
        *channel.keepalive_task.try_lock().expect("fresh channel") = Some(keepalive_handle);

        channel
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn mark_closing(&self) {
        *self.state.lock() = ChannelState::Closing;
    }

    /// Send a codec-typed message as one frame.
    pub async fn send(&self, message: &Message) -> std::io::Result<()> {
        self.send_frame(&message.encode_frame()).await
    }

    /// Send the raw keepalive filler frame.
    async fn send_keepalive(&self) -> std::io::Result<()> {
        self.send_frame(&crate::message::frame_bytes(KEEPALIVE.as_bytes()))
            .await
    }

    async fn send_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    /// Idempotent: sets the closing flag, shuts the writer down, cancels
    /// both tasks, and awaits their termination.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mark_closing();
        self.cancel.cancel();

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        if let Some(task) = self.listen_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.keepalive_task.lock().await.take() {
            let _ = task.await;
        }

        *self.state.lock() = ChannelState::Closed;
        info!("[PeerChannel] [{}]: connection closed", self.uid);
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds maximum of {MAX_FRAME_SIZE}"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn receive_loop(
    channel: Arc<PeerChannel>,
    mut reader: OwnedReadHalf,
    events: Arc<dyn ChannelEvents>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(bytes)) => {
                let payload = match std::str::from_utf8(&bytes) {
                    Ok(s) => s,
                    Err(_) => {
                        warn!("[PeerChannel] [{}]: non-UTF8 payload dropped", channel.uid);
                        continue;
                    }
                };

                if payload == KEEPALIVE {
                    continue;
                }

                match Message::parse(payload) {
                    Ok(Some(message)) => {
                        events.on_message(channel.uid.clone(), message).await;
                    }
                    Ok(None) => {
                        debug!("[PeerChannel] [{}]: dropped unparseable payload", channel.uid);
                    }
                    Err(e) => {
                        warn!("[PeerChannel] [{}]: {e}", channel.uid);
                    }
                }
            }
            Ok(None) => {
                info!("[PeerChannel] [{}]: connection lost (EOF)", channel.uid);
                channel.mark_closing();
                events
                    .on_connection_lost(channel.uid.clone(), channel.ip.clone())
                    .await;
                break;
            }
            Err(e) => {
                info!("[PeerChannel] [{}]: connection lost ({e})", channel.uid);
                channel.mark_closing();
                events
                    .on_connection_lost(channel.uid.clone(), channel.ip.clone())
                    .await;
                break;
            }
        }
    }
    debug!("[PeerChannel] [{}]: receive task stopped", channel.uid);
}

async fn keepalive_loop(channel: Arc<PeerChannel>, events: Arc<dyn ChannelEvents>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(KEEPALIVE_INTERVAL) => {}
        }

        if channel.is_closing() {
            break;
        }

        if let Err(e) = channel.send_keepalive().await {
            warn!("[PeerChannel] [{}]: failed to send keepalive: {e}", channel.uid);
            channel.mark_closing();
            events
                .on_connection_lost(channel.uid.clone(), channel.ip.clone())
                .await;
            break;
        }
    }
    debug!("[PeerChannel] [{}]: keepalive task stopped", channel.uid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    struct RecordingEvents {
        messages: Mutex<Vec<(String, Message)>>,
        lost: AtomicUsize,
    }

    impl RecordingEvents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                lost: AtomicUsize::new(0),
            })
        }
    }

    impl ChannelEvents for RecordingEvents {
        fn on_message(&self, uid: String, message: Message) -> BoxFuture<'static, ()> {
            self.messages.lock().push((uid, message));
            Box::pin(async {})
        }

        fn on_connection_lost(&self, _uid: String, _ip: String) -> BoxFuture<'static, ()> {
            self.lost.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (server_res, client_res) = tokio::join!(listener.accept(), connect);
        (server_res.unwrap().0, client_res.unwrap())
    }

    #[tokio::test]
    async fn delivers_user_message_in_order() {
        let (server_stream, client_stream) = connected_pair().await;
        let events = RecordingEvents::new();
        let server = PeerChannel::spawn("peer-a".into(), "10.0.0.2".into(), server_stream, events.clone());
        let client = PeerChannel::spawn("peer-b".into(), "10.0.0.3".into(), client_stream, RecordingEvents::new());

        client.send(&Message::User(json!(1))).await.unwrap();
        client.send(&Message::User(json!(2))).await.unwrap();

        // Give the server's receive task a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let received = events.messages.lock().clone();
        assert_eq!(
            received,
            vec![
                ("peer-a".to_string(), Message::User(json!(1))),
                ("peer-a".to_string(), Message::User(json!(2))),
            ]
        );

        server.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn keepalive_literal_is_not_surfaced_as_a_message() {
        let (server_stream, client_stream) = connected_pair().await;
        let events = RecordingEvents::new();
        let server = PeerChannel::spawn("peer-a".into(), "10.0.0.2".into(), server_stream, events.clone());
        let client = PeerChannel::spawn("peer-b".into(), "10.0.0.3".into(), client_stream, RecordingEvents::new());

        client.send(&Message::User(json!("after"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let received = events.messages.lock().clone();
        assert_eq!(received, vec![("peer-a".to_string(), Message::User(json!("after")))]);

        server.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (server_stream, _client_stream) = connected_pair().await;
        let events = RecordingEvents::new();
        let server = PeerChannel::spawn("peer-a".into(), "10.0.0.2".into(), server_stream, events);

        server.close().await;
        server.close().await;
        assert_eq!(server.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn eof_reports_connection_lost() {
        let (server_stream, client_stream) = connected_pair().await;
        let events = RecordingEvents::new();
        let server = PeerChannel::spawn("peer-a".into(), "10.0.0.2".into(), server_stream, events.clone());

        drop(client_stream);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(events.lost.load(Ordering::SeqCst), 1);
        server.close().await;
    }
}
