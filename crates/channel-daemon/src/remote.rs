//! Overlay client that forwards every operation to a relay hub.
//!
//! Requests are tagged with an ID and matched to responses by a single read
//! task. Subscriptions are registered by that same task when it sees the
//! `Subscribed` reply, so no delivery can arrive for an unknown subscription.
//! Connection protection is tracked locally: the connection manager belongs
//! to the node, not the hub.

use crate::message::{
    Frame, HandshakeMessage, MAX_FRAME_SIZE, Reply, Request, WireError, is_likely_handshake,
};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use channel_core::overlay;
use channel_core::{
    Delivery, Overlay, OverlayError, PeerId, PeerInfo, Reachability, Readiness, Subscription,
    Topic,
};
use futures::stream::{self, BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ReplySender = oneshot::Sender<Result<Reply, WireError>>;

struct Shared {
    local_id: PeerId,
    write: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, ReplySender>>,
    /// Live subscriptions, fed by the read task
    subscriptions: Mutex<HashMap<u64, mpsc::UnboundedSender<Delivery>>>,
    /// Receivers of freshly confirmed subscriptions, awaiting pickup
    parked: Mutex<HashMap<u64, mpsc::UnboundedReceiver<Delivery>>>,
    /// peer -> protection tags
    protections: Mutex<HashMap<PeerId, HashSet<String>>>,
    /// Fires when the hub connection is gone
    closed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn hub_gone() -> OverlayError {
    OverlayError::Unavailable("hub connection closed".to_string())
}

/// Overlay handle backed by a relay hub connection. Cheap to clone.
#[derive(Clone)]
pub struct RemoteOverlay {
    shared: Arc<Shared>,
}

impl RemoteOverlay {
    /// Connect to the hub at `url` and register as `local_id`.
    pub async fn connect(url: &str, local_id: PeerId) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let handshake = HandshakeMessage::new(&local_id.to_string(), "node");
        write
            .send(Message::Binary(handshake.to_binary().into()))
            .await?;

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, expect_handshake(&mut read)).await {
            Ok(Ok(hub)) => debug!("Hub handshake received (role: {})", hub.role),
            Ok(Err(e)) => return Err(e),
            Err(_) => bail!("No handshake from hub at {} within {:?}", url, HANDSHAKE_TIMEOUT),
        }

        let shared = Arc::new(Shared {
            local_id,
            write: tokio::sync::Mutex::new(write),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
            protections: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });
        tokio::spawn(read_loop(Arc::clone(&shared), read));

        info!("Connected to hub at {} as {}", url, local_id);
        Ok(Self { shared })
    }

    /// Token that fires once the hub connection is lost or closed.
    pub fn closed(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Close the hub connection. Outstanding requests fail with `Unavailable`.
    pub async fn close(&self) {
        let _ = self
            .shared
            .write
            .lock()
            .await
            .send(Message::Close(None))
            .await;
        self.shared.closed.cancel();
    }

    async fn call(&self, op: Request) -> overlay::Result<Reply> {
        let shared = &self.shared;
        if shared.closed.is_cancelled() {
            return Err(hub_gone());
        }

        let id = shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        let data = Frame::Request { id, op }
            .encode()
            .map_err(|e| OverlayError::Other(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        lock(&shared.pending).insert(id, tx);

        let sent = shared
            .write
            .lock()
            .await
            .send(Message::Binary(data.into()))
            .await;
        if let Err(e) = sent {
            lock(&shared.pending).remove(&id);
            return Err(OverlayError::Unavailable(e.to_string()));
        }

        let result = tokio::select! {
            reply = rx => reply.map_err(|_| hub_gone())?,
            _ = shared.closed.cancelled() => {
                lock(&shared.pending).remove(&id);
                return Err(hub_gone());
            }
        };
        result.map_err(OverlayError::from)
    }

    async fn call_done(&self, op: Request) -> overlay::Result<()> {
        match self.call(op).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn call_count(&self, op: Request) -> overlay::Result<usize> {
        match self.call(op).await? {
            Reply::Count(n) => Ok(n as usize),
            other => Err(unexpected(other)),
        }
    }

    async fn call_peers(&self, op: Request) -> overlay::Result<Vec<PeerId>> {
        match self.call(op).await? {
            Reply::Peers(peers) => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    /// Tell the hub to drop a subscription. Fire and forget.
    fn release_subscription(&self, sub_id: u64) {
        lock(&self.shared.subscriptions).remove(&sub_id);
        lock(&self.shared.parked).remove(&sub_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let overlay = self.clone();
        runtime.spawn(async move {
            if let Err(e) = overlay
                .call_done(Request::CancelSubscription { sub_id })
                .await
            {
                debug!("Cancelling subscription {}: {}", sub_id, e);
            }
        });
    }
}

fn unexpected(reply: Reply) -> OverlayError {
    OverlayError::Other(format!("unexpected reply from hub: {reply:?}"))
}

async fn expect_handshake(read: &mut SplitStream<WsStream>) -> Result<HandshakeMessage> {
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Binary(data) => {
                return HandshakeMessage::from_binary(&data)
                    .ok_or_else(|| anyhow!("Expected handshake from hub"));
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    bail!("Hub closed the connection during handshake")
}

/// Route frames from the hub to waiting requests and subscriptions.
async fn read_loop(shared: Arc<Shared>, mut read: SplitStream<WsStream>) {
    loop {
        let msg = tokio::select! {
            _ = shared.closed.cancelled() => break,
            msg = read.next() => msg,
        };
        let data = match msg {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Close(_))) => {
                debug!("Received close frame from hub");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                debug!("Hub connection closed");
                break;
            }
            Some(Err(e)) => {
                error!("WebSocket error on hub connection: {}", e);
                break;
            }
        };

        if data.len() > MAX_FRAME_SIZE {
            warn!(
                "Frame from hub exceeds max size ({} > {}), dropping",
                data.len(),
                MAX_FRAME_SIZE
            );
            continue;
        }
        if is_likely_handshake(&data) {
            continue;
        }

        match Frame::decode(&data) {
            Ok(Frame::Response { id, result }) => {
                if let Ok(Reply::Subscribed { sub_id }) = &result {
                    let (tx, rx) = mpsc::unbounded_channel();
                    lock(&shared.subscriptions).insert(*sub_id, tx);
                    lock(&shared.parked).insert(*sub_id, rx);
                }
                match lock(&shared.pending).remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => debug!("Response to abandoned request {}", id),
                }
            }
            Ok(Frame::Deliver { sub_id, from, data }) => {
                if let Some(tx) = lock(&shared.subscriptions).get(&sub_id) {
                    let _ = tx.send(Delivery { from, data });
                }
            }
            Ok(Frame::SubscriptionClosed { sub_id }) => {
                lock(&shared.subscriptions).remove(&sub_id);
            }
            Ok(Frame::Request { .. }) => debug!("Ignoring request frame from hub"),
            Err(e) => warn!("Undecodable frame from hub: {}", e),
        }
    }

    shared.closed.cancel();
    // Dropping the senders fails every waiter and ends every subscription
    lock(&shared.pending).clear();
    lock(&shared.subscriptions).clear();
    info!("Disconnected from hub");
}

#[async_trait]
impl Overlay for RemoteOverlay {
    fn local_id(&self) -> PeerId {
        self.shared.local_id
    }

    async fn join_topic(&self, topic: &str) -> overlay::Result<Arc<dyn Topic>> {
        self.call_done(Request::JoinTopic {
            topic: topic.to_string(),
        })
        .await?;
        Ok(Arc::new(RemoteTopic {
            name: topic.to_string(),
            overlay: self.clone(),
        }))
    }

    async fn advertise(&self, topic: &str, ttl: Duration) -> overlay::Result<()> {
        self.call_done(Request::Advertise {
            topic: topic.to_string(),
            ttl_ms: ttl.as_millis() as u64,
        })
        .await
    }

    async fn find_peers(
        &self,
        topic: &str,
        limit: usize,
    ) -> overlay::Result<BoxStream<'static, PeerInfo>> {
        let op = Request::FindPeers {
            topic: topic.to_string(),
            limit,
        };
        match self.call(op).await? {
            Reply::Found(peers) => Ok(stream::iter(peers).boxed()),
            other => Err(unexpected(other)),
        }
    }

    async fn connect(&self, peer: &PeerInfo) -> overlay::Result<()> {
        self.call_done(Request::Connect { peer: peer.clone() })
            .await
    }

    fn protect(&self, peer: PeerId, tag: &str) {
        lock(&self.shared.protections)
            .entry(peer)
            .or_default()
            .insert(tag.to_string());
    }

    fn unprotect(&self, peer: PeerId, tag: &str) -> bool {
        let mut protections = lock(&self.shared.protections);
        let Some(tags) = protections.get_mut(&peer) else {
            return false;
        };
        tags.remove(tag);
        if tags.is_empty() {
            protections.remove(&peer);
            false
        } else {
            true
        }
    }

    async fn conns_to_peer(&self, peer: PeerId) -> overlay::Result<usize> {
        self.call_count(Request::ConnsToPeer { peer }).await
    }

    async fn peers(&self) -> overlay::Result<Vec<PeerId>> {
        self.call_peers(Request::Peers).await
    }

    async fn known_peer_count(&self) -> overlay::Result<usize> {
        self.call_count(Request::KnownPeerCount).await
    }

    async fn topic_count(&self) -> overlay::Result<usize> {
        self.call_count(Request::TopicCount).await
    }

    async fn reachability(&self) -> overlay::Result<Reachability> {
        match self.call(Request::Reachability).await? {
            Reply::Reachability(reachability) => Ok(reachability),
            other => Err(unexpected(other)),
        }
    }

    async fn ping(&self, peer: PeerId) -> overlay::Result<Duration> {
        let started = Instant::now();
        self.call_done(Request::Ping { peer }).await?;
        Ok(started.elapsed())
    }
}

struct RemoteTopic {
    name: String,
    overlay: RemoteOverlay,
}

#[async_trait]
impl Topic for RemoteTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> overlay::Result<Arc<dyn Subscription>> {
        let op = Request::Subscribe {
            topic: self.name.clone(),
        };
        let sub_id = match self.overlay.call(op).await? {
            Reply::Subscribed { sub_id } => sub_id,
            other => return Err(unexpected(other)),
        };
        let rx = lock(&self.overlay.shared.parked)
            .remove(&sub_id)
            .ok_or_else(hub_gone)?;

        Ok(Arc::new(RemoteSubscription {
            sub_id,
            topic: self.name.clone(),
            overlay: self.overlay.clone(),
            rx: tokio::sync::Mutex::new(rx),
            cancelled: CancellationToken::new(),
        }))
    }

    async fn publish(&self, data: &[u8], readiness: Readiness) -> overlay::Result<()> {
        self.overlay
            .call_done(Request::Publish {
                topic: self.name.clone(),
                data: data.to_vec(),
                min_topic_size: readiness.min_topic_size,
            })
            .await
    }

    async fn list_peers(&self) -> overlay::Result<Vec<PeerId>> {
        self.overlay
            .call_peers(Request::ListPeers {
                topic: self.name.clone(),
            })
            .await
    }

    async fn close(&self) -> overlay::Result<()> {
        self.overlay
            .call_done(Request::CloseTopic {
                topic: self.name.clone(),
            })
            .await
    }
}

struct RemoteSubscription {
    sub_id: u64,
    topic: String,
    overlay: RemoteOverlay,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    cancelled: CancellationToken,
}

#[async_trait]
impl Subscription for RemoteSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next(&self) -> overlay::Result<Delivery> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => Err(OverlayError::SubscriptionCancelled),
            delivery = rx.recv() => delivery.ok_or(OverlayError::SubscriptionCancelled),
        }
    }

    fn cancel(&self) {
        if self.cancelled.is_cancelled() {
            return;
        }
        self.cancelled.cancel();
        self.overlay.release_subscription(self.sub_id);
    }
}
