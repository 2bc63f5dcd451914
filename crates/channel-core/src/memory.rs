//! In-process overlay network.
//!
//! `MemoryNetwork` simulates the gossip, discovery and connection-manager
//! collaborator for any number of nodes living in one process. Each node gets
//! a `MemoryOverlay` handle implementing [`Overlay`].
//!
//! Used by the test suites and by the daemon's relay hub, which serves one
//! `MemoryOverlay` per connected node.

use crate::PeerId;
use crate::overlay::{
    Delivery, Overlay, OverlayError, PeerInfo, Reachability, Readiness, Result, Subscription,
    Topic,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, NodeEntry>,
    /// Undirected links, stored with the smaller ID first
    links: HashSet<(PeerId, PeerId)>,
    subscriptions: HashMap<u64, SubscriptionEntry>,
    /// topic -> advertiser -> expiry
    adverts: HashMap<String, HashMap<PeerId, Instant>>,
    next_subscription_id: u64,
}

struct NodeEntry {
    reachable: bool,
    reachability: Reachability,
    fail_joins: bool,
    topics: HashSet<String>,
    known: HashSet<PeerId>,
    /// peer -> protection tags
    protections: HashMap<PeerId, HashSet<String>>,
    calls: Arc<AtomicUsize>,
}

impl NodeEntry {
    fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            reachable: true,
            reachability: Reachability::Unknown,
            fail_joins: false,
            topics: HashSet::new(),
            known: HashSet::new(),
            protections: HashMap::new(),
            calls,
        }
    }
}

struct SubscriptionEntry {
    topic: String,
    owner: PeerId,
    tx: mpsc::UnboundedSender<Delivery>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl NetworkState {
    fn linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.contains(&link_key(a, b))
    }

    fn linked_peers(&self, id: PeerId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter_map(|&(a, b)| {
                if a == id {
                    Some(b)
                } else if b == id {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        peers.sort();
        peers
    }

    /// Subscribers of `topic` other than `owner` that `owner` is linked to.
    fn mesh_peers(&self, owner: PeerId, topic: &str) -> Vec<PeerId> {
        let peers: BTreeSet<PeerId> = self
            .subscriptions
            .values()
            .filter(|s| s.topic == topic && s.owner != owner && self.linked(owner, s.owner))
            .map(|s| s.owner)
            .collect();
        peers.into_iter().collect()
    }
}

/// Shared state of a simulated overlay network.
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
    /// Woken whenever links or subscriptions change (publish readiness waits on it)
    changed: Notify,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState::default()),
            changed: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a node and return its overlay handle.
    ///
    /// Registering an ID that already exists replaces the previous node.
    pub fn add_node(self: &Arc<Self>, id: PeerId) -> Arc<MemoryOverlay> {
        self.remove_node(id);
        let calls = Arc::new(AtomicUsize::new(0));
        self.lock().nodes.insert(id, NodeEntry::new(calls.clone()));
        debug!("Memory network: added node {}", id);
        Arc::new(MemoryOverlay {
            id,
            network: Arc::clone(self),
            calls,
        })
    }

    /// Remove a node with all its links, subscriptions and advertisements.
    pub fn remove_node(&self, id: PeerId) {
        {
            let mut state = self.lock();
            if state.nodes.remove(&id).is_none() {
                return;
            }
            state.links.retain(|&(a, b)| a != id && b != id);
            state.subscriptions.retain(|_, s| s.owner != id);
            for advertisers in state.adverts.values_mut() {
                advertisers.remove(&id);
            }
        }
        debug!("Memory network: removed node {}", id);
        self.changed.notify_waiters();
    }

    pub fn contains_node(&self, id: PeerId) -> bool {
        self.lock().nodes.contains_key(&id)
    }

    /// Make `connect` to this node fail (or succeed again).
    pub fn set_reachable(&self, id: PeerId, reachable: bool) {
        if let Some(node) = self.lock().nodes.get_mut(&id) {
            node.reachable = reachable;
        }
    }

    pub fn set_reachability(&self, id: PeerId, reachability: Reachability) {
        if let Some(node) = self.lock().nodes.get_mut(&id) {
            node.reachability = reachability;
        }
    }

    /// Make every `join_topic` of this node fail.
    pub fn set_join_failure(&self, id: PeerId, fail: bool) {
        if let Some(node) = self.lock().nodes.get_mut(&id) {
            node.fail_joins = fail;
        }
    }

    /// Link two nodes directly, bypassing discovery.
    pub fn link(&self, a: PeerId, b: PeerId) {
        {
            let mut state = self.lock();
            if a == b || !state.nodes.contains_key(&a) || !state.nodes.contains_key(&b) {
                return;
            }
            state.links.insert(link_key(a, b));
        }
        self.changed.notify_waiters();
    }

    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.lock().linked(a, b)
    }

    /// Number of overlay calls made by a node so far.
    pub fn call_count(&self, id: PeerId) -> usize {
        self.lock()
            .nodes
            .get(&id)
            .map(|n| n.calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Peers `owner` currently protects with `tag`, sorted.
    pub fn protected_peers(&self, owner: PeerId, tag: &str) -> Vec<PeerId> {
        let state = self.lock();
        let Some(node) = state.nodes.get(&owner) else {
            return Vec::new();
        };
        let mut peers: Vec<PeerId> = node
            .protections
            .iter()
            .filter(|(_, tags)| tags.contains(tag))
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    /// Whether `owner` protects `peer` under any tag.
    pub fn is_protected(&self, owner: PeerId, peer: PeerId) -> bool {
        self.lock()
            .nodes
            .get(&owner)
            .map(|n| n.protections.contains_key(&peer))
            .unwrap_or(false)
    }

    /// Live subscriptions `owner` holds on `topic`.
    pub fn subscription_count(&self, owner: PeerId, topic: &str) -> usize {
        self.lock()
            .subscriptions
            .values()
            .filter(|s| s.owner == owner && s.topic == topic)
            .count()
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryOverlay {
    id: PeerId,
    network: Arc<MemoryNetwork>,
    calls: Arc<AtomicUsize>,
}

impl MemoryOverlay {
    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn local_id(&self) -> PeerId {
        self.id
    }

    async fn join_topic(&self, topic: &str) -> Result<Arc<dyn Topic>> {
        self.record_call();
        let mut state = self.network.lock();
        let node = state
            .nodes
            .get_mut(&self.id)
            .ok_or_else(|| {
                OverlayError::Unavailable(format!("node {} left the network", self.id))
            })?;
        if node.fail_joins {
            return Err(OverlayError::Other(format!("join of {topic} rejected")));
        }
        if !node.topics.insert(topic.to_string()) {
            return Err(OverlayError::TopicExists(topic.to_string()));
        }

        Ok(Arc::new(MemoryTopic {
            name: topic.to_string(),
            owner: self.id,
            network: Arc::clone(&self.network),
            calls: Arc::clone(&self.calls),
            closed: AtomicBool::new(false),
        }))
    }

    async fn advertise(&self, topic: &str, ttl: Duration) -> Result<()> {
        self.record_call();
        let mut state = self.network.lock();
        if !state.nodes.contains_key(&self.id) {
            return Err(OverlayError::Unavailable(format!("node {} left the network", self.id)));
        }
        state
            .adverts
            .entry(topic.to_string())
            .or_default()
            .insert(self.id, Instant::now() + ttl);
        Ok(())
    }

    async fn find_peers(&self, topic: &str, limit: usize) -> Result<BoxStream<'static, PeerInfo>> {
        self.record_call();
        let now = Instant::now();
        let mut state = self.network.lock();

        let mut found: Vec<PeerId> = state
            .adverts
            .get(topic)
            .map(|advertisers| {
                advertisers
                    .iter()
                    .filter(|(_, expiry)| **expiry > now)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        found.sort();
        found.truncate(limit);

        if let Some(node) = state.nodes.get_mut(&self.id) {
            node.known.extend(found.iter().copied().filter(|p| *p != self.id));
        }

        let infos: Vec<PeerInfo> = found
            .into_iter()
            .map(|id| PeerInfo {
                id,
                addrs: vec![format!("/memory/{id}")],
            })
            .collect();
        Ok(stream::iter(infos).boxed())
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<()> {
        self.record_call();
        if peer.id == self.id {
            return Ok(());
        }
        {
            let mut state = self.network.lock();
            match state.nodes.get(&peer.id) {
                None => {
                    return Err(OverlayError::ConnectionFailed(peer.id, "unknown peer".into()));
                }
                Some(target) if !target.reachable => {
                    return Err(OverlayError::ConnectionFailed(peer.id, "unreachable".into()));
                }
                Some(_) => {}
            }
            if !state.nodes.contains_key(&self.id) {
                return Err(OverlayError::Unavailable(format!("node {} left the network", self.id)));
            }
            state.links.insert(link_key(self.id, peer.id));
            if let Some(node) = state.nodes.get_mut(&self.id) {
                node.known.insert(peer.id);
            }
            if let Some(node) = state.nodes.get_mut(&peer.id) {
                node.known.insert(self.id);
            }
        }
        self.network.changed.notify_waiters();
        Ok(())
    }

    fn protect(&self, peer: PeerId, tag: &str) {
        self.record_call();
        if let Some(node) = self.network.lock().nodes.get_mut(&self.id) {
            node.protections
                .entry(peer)
                .or_default()
                .insert(tag.to_string());
        }
    }

    fn unprotect(&self, peer: PeerId, tag: &str) -> bool {
        self.record_call();
        let mut state = self.network.lock();
        let Some(node) = state.nodes.get_mut(&self.id) else {
            return false;
        };
        let Some(tags) = node.protections.get_mut(&peer) else {
            return false;
        };
        tags.remove(tag);
        if tags.is_empty() {
            node.protections.remove(&peer);
            false
        } else {
            true
        }
    }

    async fn conns_to_peer(&self, peer: PeerId) -> Result<usize> {
        self.record_call();
        Ok(usize::from(self.network.lock().linked(self.id, peer)))
    }

    async fn peers(&self) -> Result<Vec<PeerId>> {
        self.record_call();
        Ok(self.network.lock().linked_peers(self.id))
    }

    async fn known_peer_count(&self) -> Result<usize> {
        self.record_call();
        Ok(self
            .network
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| n.known.len())
            .unwrap_or(0))
    }

    async fn topic_count(&self) -> Result<usize> {
        self.record_call();
        Ok(self
            .network
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| n.topics.len())
            .unwrap_or(0))
    }

    async fn reachability(&self) -> Result<Reachability> {
        self.record_call();
        Ok(self
            .network
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| n.reachability)
            .unwrap_or_default())
    }

    async fn ping(&self, peer: PeerId) -> Result<Duration> {
        self.record_call();
        let started = Instant::now();
        if !self.network.lock().linked(self.id, peer) {
            return Err(OverlayError::ConnectionFailed(peer, "not connected".into()));
        }
        Ok(started.elapsed())
    }
}

struct MemoryTopic {
    name: String,
    owner: PeerId,
    network: Arc<MemoryNetwork>,
    calls: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MemoryTopic {
    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::TopicClosed(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<Arc<dyn Subscription>> {
        self.record_call();
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.network.lock();
            let id = state.next_subscription_id;
            state.next_subscription_id += 1;
            state.subscriptions.insert(
                id,
                SubscriptionEntry {
                    topic: self.name.clone(),
                    owner: self.owner,
                    tx,
                },
            );
            id
        };
        self.network.changed.notify_waiters();

        Ok(Arc::new(MemorySubscription {
            id,
            topic: self.name.clone(),
            network: Arc::clone(&self.network),
            calls: Arc::clone(&self.calls),
            rx: tokio::sync::Mutex::new(rx),
            cancelled: CancellationToken::new(),
        }))
    }

    async fn publish(&self, data: &[u8], readiness: Readiness) -> Result<()> {
        self.record_call();
        loop {
            // Created before the check so a concurrent change can't be missed
            let changed = self.network.changed.notified();
            self.ensure_open()?;
            let mesh = self.network.lock().mesh_peers(self.owner, &self.name).len();
            if mesh >= readiness.min_topic_size {
                break;
            }
            changed.await;
        }

        let state = self.network.lock();
        for sub in state.subscriptions.values() {
            if sub.topic != self.name {
                continue;
            }
            // Own subscriptions get the echo, like a real gossip router
            if sub.owner == self.owner || state.linked(self.owner, sub.owner) {
                let _ = sub.tx.send(Delivery {
                    from: self.owner,
                    data: data.to_vec(),
                });
            }
        }
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerId>> {
        self.record_call();
        Ok(self.network.lock().mesh_peers(self.owner, &self.name))
    }

    async fn close(&self) -> Result<()> {
        self.record_call();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(OverlayError::TopicClosed(self.name.clone()));
        }
        if let Some(node) = self.network.lock().nodes.get_mut(&self.owner) {
            node.topics.remove(&self.name);
        }
        self.network.changed.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    id: u64,
    topic: String,
    network: Arc<MemoryNetwork>,
    calls: Arc<AtomicUsize>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    cancelled: CancellationToken,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next(&self) -> Result<Delivery> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => Err(OverlayError::SubscriptionCancelled),
            delivery = rx.recv() => delivery.ok_or(OverlayError::SubscriptionCancelled),
        }
    }

    fn cancel(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cancelled.cancel();
        self.network.lock().subscriptions.remove(&self.id);
        self.network.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const TOPIC: &str = "/infinitychat/v0.1/channel/test";

    fn ready(n: usize) -> Readiness {
        Readiness { min_topic_size: n }
    }

    #[tokio::test]
    async fn test_publish_reaches_linked_subscribers_and_echoes() {
        let network = MemoryNetwork::new();
        let a = network.add_node(PeerId::from(1));
        let b = network.add_node(PeerId::from(2));
        let c = network.add_node(PeerId::from(3));

        let ta = a.join_topic(TOPIC).await.unwrap();
        let tb = b.join_topic(TOPIC).await.unwrap();
        let tc = c.join_topic(TOPIC).await.unwrap();
        let sa = ta.subscribe().await.unwrap();
        let sb = tb.subscribe().await.unwrap();
        let sc = tc.subscribe().await.unwrap();

        a.connect(&PeerInfo::new(b.local_id())).await.unwrap();
        ta.publish(b"hi", ready(1)).await.unwrap();

        let echo = sa.next().await.unwrap();
        assert_eq!(echo.from, a.local_id());
        let got = sb.next().await.unwrap();
        assert_eq!(got.data, b"hi");

        // c is not linked to a
        assert!(timeout(Duration::from_millis(50), sc.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_waits_for_readiness() {
        let network = MemoryNetwork::new();
        let a = network.add_node(PeerId::from(1));
        let b = network.add_node(PeerId::from(2));
        let ta = a.join_topic(TOPIC).await.unwrap();
        let tb = b.join_topic(TOPIC).await.unwrap();
        let sb = tb.subscribe().await.unwrap();

        let publish = tokio::spawn(async move { ta.publish(b"late", ready(1)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publish.is_finished());

        network.link(a.local_id(), b.local_id());
        timeout(Duration::from_secs(1), publish)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sb.next().await.unwrap().data, b"late");
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops() {
        let network = MemoryNetwork::new();
        let a = network.add_node(PeerId::from(1));
        let sub = a.join_topic(TOPIC).await.unwrap().subscribe().await.unwrap();
        assert_eq!(network.subscription_count(a.local_id(), TOPIC), 1);

        sub.cancel();
        assert!(matches!(
            sub.next().await,
            Err(OverlayError::SubscriptionCancelled)
        ));
        assert_eq!(network.subscription_count(a.local_id(), TOPIC), 0);
    }

    #[tokio::test]
    async fn test_find_peers_honours_limit_and_ttl() {
        let network = MemoryNetwork::new();
        let a = network.add_node(PeerId::from(1));
        for i in 2..7 {
            let node = network.add_node(PeerId::from(i));
            node.advertise(TOPIC, Duration::from_secs(60)).await.unwrap();
        }
        let expired = network.add_node(PeerId::from(99));
        expired.advertise(TOPIC, Duration::ZERO).await.unwrap();

        let found: Vec<PeerInfo> = a.find_peers(TOPIC, 3).await.unwrap().collect().await;
        assert_eq!(found.len(), 3);

        let all: Vec<PeerInfo> = a.find_peers(TOPIC, 100).await.unwrap().collect().await;
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|p| p.id != expired.local_id()));
    }

    #[tokio::test]
    async fn test_protection_tags_are_additive() {
        let network = MemoryNetwork::new();
        let a = network.add_node(PeerId::from(1));
        let peer = PeerId::from(2);

        a.protect(peer, "one");
        a.protect(peer, "two");
        assert!(a.unprotect(peer, "one"));
        assert!(network.is_protected(a.local_id(), peer));
        assert!(!a.unprotect(peer, "two"));
        assert!(!network.is_protected(a.local_id(), peer));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_fails() {
        let network = MemoryNetwork::new();
        let a = network.add_node(PeerId::from(1));
        let b = network.add_node(PeerId::from(2));
        network.set_reachable(b.local_id(), false);

        assert!(a.connect(&PeerInfo::new(b.local_id())).await.is_err());
        assert!(a.connect(&PeerInfo::new(PeerId::from(42))).await.is_err());
        assert_eq!(a.conns_to_peer(b.local_id()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ping_requires_a_link() {
        let network = MemoryNetwork::new();
        let a = network.add_node(PeerId::from(1));
        let b = network.add_node(PeerId::from(2));

        assert!(matches!(
            a.ping(b.local_id()).await,
            Err(OverlayError::ConnectionFailed(peer, _)) if peer == b.local_id()
        ));
        network.link(a.local_id(), b.local_id());
        assert!(a.ping(b.local_id()).await.unwrap() < Duration::from_secs(1));
        assert!(b.ping(a.local_id()).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_node_drops_links_and_subscriptions() {
        let network = MemoryNetwork::new();
        let a = network.add_node(PeerId::from(1));
        let b = network.add_node(PeerId::from(2));
        let sb = b.join_topic(TOPIC).await.unwrap().subscribe().await.unwrap();
        network.link(a.local_id(), b.local_id());

        network.remove_node(b.local_id());
        assert!(!network.is_linked(a.local_id(), b.local_id()));
        assert!(a.peers().await.unwrap().is_empty());
        assert!(sb.next().await.is_err());
    }
}
