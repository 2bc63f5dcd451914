//! Overlay traits for the gossip, discovery and connection-management collaborator.
//!
//! Implementations:
//! - `MemoryOverlay` (this crate): in-process network for tests and the relay hub
//! - `RemoteOverlay` (channel-daemon): talks to a relay hub over WebSocket

use crate::PeerId;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Topic already joined: {0}")]
    TopicExists(String),

    #[error("Topic closed: {0}")]
    TopicClosed(String),

    #[error("Subscription cancelled")]
    SubscriptionCancelled,

    #[error("Connection to {0} failed: {1}")]
    ConnectionFailed(PeerId, String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Overlay unavailable: {0}")]
    Unavailable(String),

    #[error("Overlay error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, OverlayError>;

/// A peer returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Transport addresses (may be empty when the overlay routes by ID)
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            addrs: Vec::new(),
        }
    }
}

/// One message read from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: PeerId,
    pub data: Vec<u8>,
}

/// Publish-time condition that delays publication until the mesh is viable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    /// Minimum number of topic peers required before publishing
    pub min_topic_size: usize,
}

/// NAT reachability classification as reported by the overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    #[default]
    Unknown,
    Public,
    /// Behind a NAT or firewall
    Private,
}

/// Handle to a subscription on a joined topic.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn topic(&self) -> &str;

    /// Wait for the next message. Resolves to `SubscriptionCancelled` once
    /// `cancel` has been called.
    async fn next(&self) -> Result<Delivery>;

    fn cancel(&self);
}

/// Handle to a joined gossip topic.
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    async fn subscribe(&self) -> Result<Arc<dyn Subscription>>;

    /// Publish to the topic, waiting until `readiness` is satisfied.
    async fn publish(&self, data: &[u8], readiness: Readiness) -> Result<()>;

    /// Peers in our mesh for this topic.
    async fn list_peers(&self) -> Result<Vec<PeerId>>;

    async fn close(&self) -> Result<()>;
}

/// The overlay service: gossip transport, DHT discovery and connection manager.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Our own identity
    fn local_id(&self) -> PeerId;

    async fn join_topic(&self, topic: &str) -> Result<Arc<dyn Topic>>;

    /// Advertise membership in `topic` for `ttl`.
    async fn advertise(&self, topic: &str, ttl: Duration) -> Result<()>;

    /// Find up to `limit` peers advertising `topic`.
    async fn find_peers(&self, topic: &str, limit: usize) -> Result<BoxStream<'static, PeerInfo>>;

    async fn connect(&self, peer: &PeerInfo) -> Result<()>;

    /// Tag a connection so the connection manager never evicts it.
    fn protect(&self, peer: PeerId, tag: &str);

    /// Remove one protection tag. Returns whether the peer is still protected
    /// by any other tag.
    fn unprotect(&self, peer: PeerId, tag: &str) -> bool;

    /// Number of open connections to `peer`.
    async fn conns_to_peer(&self, peer: PeerId) -> Result<usize>;

    /// Currently connected peers.
    async fn peers(&self) -> Result<Vec<PeerId>>;

    /// Number of peers in the peer store (connected or not).
    async fn known_peer_count(&self) -> Result<usize>;

    /// Number of topics currently joined.
    async fn topic_count(&self) -> Result<usize>;

    async fn reachability(&self) -> Result<Reachability>;

    /// Measure the round-trip time to a connected peer.
    async fn ping(&self, peer: PeerId) -> Result<Duration>;
}
