//! Relay hub: serves one in-process overlay per connected node.
//!
//! The hub owns a [`MemoryNetwork`]. Each WebSocket client completes a
//! handshake carrying its [`PeerId`] and is registered as a node of that
//! network; its requests are executed against its own `MemoryOverlay`.
//! Deliveries on its subscriptions are pushed back as `Deliver` frames.
//! A disconnect removes the node with all its links and advertisements.

use crate::message::{
    Frame, HandshakeMessage, MAX_FRAME_SIZE, Reply, Request, WireError, is_likely_handshake,
};
use anyhow::Result;
use channel_core::{
    MemoryNetwork, MemoryOverlay, Overlay, OverlayError, PeerId, Readiness, Subscription, Topic,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long a client has to send its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsWrite = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRead = SplitStream<WebSocketStream<TcpStream>>;

/// WebSocket relay hosting a shared [`MemoryNetwork`].
pub struct Hub {
    listener: TcpListener,
    network: Arc<MemoryNetwork>,
    /// Peer IDs with a live session
    connected: Arc<Mutex<HashSet<PeerId>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Hub {
    pub async fn bind(listen_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Hub listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            network: MemoryNetwork::new(),
            connected: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept clients until the shutdown token fires.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let network = Arc::clone(&self.network);
                        let connected = Arc::clone(&self.connected);
                        let cancel = self.cancel.child_token();
                        let tasks = self.tasks.clone();
                        self.tasks.spawn(async move {
                            serve_client(network, connected, stream, addr, cancel, tasks).await;
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }

        info!("Hub shutting down");
        self.tasks.close();
        self.tasks.wait().await;
        Ok(())
    }
}

async fn serve_client(
    network: Arc<MemoryNetwork>,
    connected: Arc<Mutex<HashSet<PeerId>>>,
    stream: TcpStream,
    addr: SocketAddr,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // Health checks connect and close without a WebSocket handshake
            debug!("WebSocket upgrade failed for {}: {}", addr, e);
            return;
        }
    };
    let (write, mut read) = ws_stream.split();
    let writer = FrameWriter::new(write);

    if let Err(e) = writer
        .send_raw(HandshakeMessage::new("hub", "hub").to_binary())
        .await
    {
        warn!("Failed to send handshake to {}: {}", addr, e);
        return;
    }

    let peer_id = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut read)).await {
        Ok(Some(peer_id)) => peer_id,
        Ok(None) => {
            debug!("Connection from {} closed before handshake", addr);
            return;
        }
        Err(_) => {
            warn!("No handshake from {} within {:?}", addr, HANDSHAKE_TIMEOUT);
            writer.close().await;
            return;
        }
    };

    if !connected
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(peer_id)
    {
        warn!("Rejecting {}: node {} is already connected", addr, peer_id);
        writer.close().await;
        return;
    }

    info!("Node connected: {} from {}", peer_id, addr);
    let session = Arc::new(Session {
        peer_id,
        overlay: network.add_node(peer_id),
        writer,
        topics: Mutex::new(HashMap::new()),
        subscriptions: Mutex::new(HashMap::new()),
        next_sub_id: AtomicU64::new(1),
        cancel,
        tasks,
    });

    session.read_loop(read).await;

    session.teardown();
    network.remove_node(peer_id);
    connected
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&peer_id);
    info!("Node disconnected: {}", peer_id);
}

/// Wait for the client's handshake and parse its peer ID.
async fn read_handshake(read: &mut WsRead) -> Option<PeerId> {
    while let Some(msg) = read.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        if !is_likely_handshake(&data) {
            debug!("Ignoring frame received before handshake");
            continue;
        }
        let handshake = HandshakeMessage::from_binary(&data)?;
        match handshake.peer_id.parse::<PeerId>() {
            Ok(peer_id) => return Some(peer_id),
            Err(e) => {
                warn!("Invalid peer ID in handshake {:?}: {}", handshake.peer_id, e);
                return None;
            }
        }
    }
    None
}

/// Write half of a client connection, shared by the request handlers.
struct FrameWriter {
    write: tokio::sync::Mutex<WsWrite>,
}

impl FrameWriter {
    fn new(write: WsWrite) -> Self {
        Self {
            write: tokio::sync::Mutex::new(write),
        }
    }

    async fn send_raw(&self, data: Vec<u8>) -> Result<(), WsError> {
        self.write.lock().await.send(Message::Binary(data.into())).await
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        let data = frame.encode()?;
        self.send_raw(data).await?;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.write.lock().await.send(Message::Close(None)).await;
    }
}

/// Per-client state: the client's overlay and the handles it has opened.
struct Session {
    peer_id: PeerId,
    overlay: Arc<MemoryOverlay>,
    writer: FrameWriter,
    /// Joined topics by name
    topics: Mutex<HashMap<String, Arc<dyn Topic>>>,
    subscriptions: Mutex<HashMap<u64, Arc<dyn Subscription>>>,
    next_sub_id: AtomicU64,
    cancel: CancellationToken,
    /// Request handlers and forwarders join the hub's shutdown
    tasks: TaskTracker,
}

impl Session {
    async fn read_loop(self: &Arc<Self>, mut read: WsRead) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = read.next() => msg,
            };
            let data = match msg {
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    debug!("Ignoring text frame from {}", self.peer_id);
                    continue;
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", self.peer_id);
                    break;
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("Connection to {} closed", self.peer_id);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", self.peer_id, e);
                    break;
                }
            };

            if data.len() > MAX_FRAME_SIZE {
                warn!(
                    "Frame from {} exceeds max size ({} > {}), dropping",
                    self.peer_id,
                    data.len(),
                    MAX_FRAME_SIZE
                );
                continue;
            }

            match Frame::decode(&data) {
                Ok(Frame::Request { id, op }) => {
                    let session = Arc::clone(self);
                    self.tasks.spawn(async move { session.dispatch(id, op).await });
                }
                Ok(other) => debug!("Unexpected frame from {}: {:?}", self.peer_id, other),
                Err(e) => warn!("Undecodable frame from {}: {}", self.peer_id, e),
            }
        }
        self.cancel.cancel();
    }

    async fn dispatch(self: Arc<Self>, id: u64, op: Request) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.execute(op) => result,
        };
        let subscribed = match &result {
            Ok(Reply::Subscribed { sub_id }) => Some(*sub_id),
            _ => None,
        };

        if let Err(e) = self.writer.send(&Frame::Response { id, result }).await {
            debug!("Failed to answer {} request {}: {}", self.peer_id, id, e);
            return;
        }
        // Deliveries may only start once the node has seen the subscription ID
        if let Some(sub_id) = subscribed {
            self.tasks.spawn(Arc::clone(&self).forward(sub_id));
        }
    }

    fn topic(&self, name: &str) -> Result<Arc<dyn Topic>, WireError> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| WireError::TopicClosed(name.to_string()))
    }

    async fn execute(&self, op: Request) -> Result<Reply, WireError> {
        let overlay = &self.overlay;
        let reply = match op {
            Request::JoinTopic { topic } => {
                let handle = overlay.join_topic(&topic).await?;
                self.topics
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(topic, handle);
                Reply::Done
            }
            Request::Subscribe { topic } => {
                let subscription = self.topic(&topic)?.subscribe().await?;
                let sub_id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
                self.subscriptions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(sub_id, subscription);
                Reply::Subscribed { sub_id }
            }
            Request::CancelSubscription { sub_id } => {
                let subscription = self
                    .subscriptions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&sub_id);
                if let Some(subscription) = subscription {
                    subscription.cancel();
                }
                Reply::Done
            }
            Request::Publish {
                topic,
                data,
                min_topic_size,
            } => {
                self.topic(&topic)?
                    .publish(&data, Readiness { min_topic_size })
                    .await?;
                Reply::Done
            }
            Request::ListPeers { topic } => Reply::Peers(self.topic(&topic)?.list_peers().await?),
            Request::CloseTopic { topic } => {
                let handle = self
                    .topics
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&topic)
                    .ok_or(WireError::TopicClosed(topic))?;
                handle.close().await?;
                Reply::Done
            }
            Request::Advertise { topic, ttl_ms } => {
                overlay
                    .advertise(&topic, Duration::from_millis(ttl_ms))
                    .await?;
                Reply::Done
            }
            Request::FindPeers { topic, limit } => {
                let found = overlay.find_peers(&topic, limit).await?;
                Reply::Found(found.collect().await)
            }
            Request::Connect { peer } => {
                overlay.connect(&peer).await?;
                Reply::Done
            }
            Request::ConnsToPeer { peer } => {
                Reply::Count(overlay.conns_to_peer(peer).await? as u64)
            }
            Request::Peers => Reply::Peers(overlay.peers().await?),
            Request::KnownPeerCount => Reply::Count(overlay.known_peer_count().await? as u64),
            Request::TopicCount => Reply::Count(overlay.topic_count().await? as u64),
            Request::Reachability => Reply::Reachability(overlay.reachability().await?),
            Request::Ping { peer } => {
                overlay.ping(peer).await?;
                Reply::Done
            }
        };
        Ok(reply)
    }

    /// Push deliveries of one subscription to the node until it is cancelled.
    async fn forward(self: Arc<Self>, sub_id: u64) {
        let subscription = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&sub_id)
            .cloned();
        let Some(subscription) = subscription else {
            return;
        };

        loop {
            let delivery = tokio::select! {
                _ = self.cancel.cancelled() => return,
                delivery = subscription.next() => delivery,
            };
            let frame = match delivery {
                Ok(delivery) => Frame::Deliver {
                    sub_id,
                    from: delivery.from,
                    data: delivery.data,
                },
                Err(OverlayError::SubscriptionCancelled) => break,
                Err(e) => {
                    warn!("Subscription {} of {} failed: {}", sub_id, self.peer_id, e);
                    break;
                }
            };
            if self.writer.send(&frame).await.is_err() {
                return;
            }
        }

        if let Err(e) = self.writer.send(&Frame::SubscriptionClosed { sub_id }).await {
            debug!("Failed to close subscription {} of {}: {}", sub_id, self.peer_id, e);
        }
    }

    /// Cancel every subscription so forwarders and readiness waits end.
    fn teardown(&self) {
        self.cancel.cancel();
        let subscriptions: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        for subscription in subscriptions {
            subscription.cancel();
        }
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
