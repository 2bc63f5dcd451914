//! The channel node: joins, leaves and posts to channels over an [`Overlay`].
//!
//! Periodic rejoin and announcement live in [`crate::scheduler`]; this module
//! owns the node handle, its lifecycle and the on-demand operations.

use crate::PeerId;
use crate::config::NodeConfig;
use crate::descriptor::Descriptor;
use crate::error::{ChannelError, Result};
use crate::membership::{MembershipRecord, MembershipState};
use crate::overlay::{
    Overlay, OverlayError, PeerInfo, Reachability, Readiness, Subscription, Topic,
};
use crate::pump::{self, Message};
use crate::status::{ChannelInfo, NetworkState, NodeStatus};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub(crate) struct NodeInner {
    pub(crate) overlay: Arc<dyn Overlay>,
    pub(crate) config: NodeConfig,
    pub(crate) state: MembershipState,
    /// Taken on shutdown so the message stream ends once the pumps are gone
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    inbound: Mutex<Option<mpsc::Receiver<Message>>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: TaskTracker,
    started: AtomicBool,
}

/// Handle to a running channel node. Cheap to clone.
#[derive(Clone)]
pub struct ChannelNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl ChannelNode {
    pub fn new(overlay: Arc<dyn Overlay>, config: NodeConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.message_buffer.max(1));
        Self {
            inner: Arc::new(NodeInner {
                overlay,
                config,
                state: MembershipState::new(),
                outbound: Mutex::new(Some(tx)),
                inbound: Mutex::new(Some(rx)),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.overlay.local_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Take the stream of messages received on joined channels.
    ///
    /// Returns `None` after the first call. The stream ends after shutdown.
    pub fn messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(ChannelError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Run `future` unless the node shuts down first.
    ///
    /// Shutdown wins when both are ready, so nothing that completes after the
    /// node token fires is acted upon.
    pub(crate) async fn until_shutdown<F: Future>(&self, future: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(ChannelError::Shutdown),
            output = future => Ok(output),
        }
    }

    /// Dial the bootstrap peers and start the rejoin and announce tickers.
    ///
    /// Only the first call has an effect.
    pub fn start(&self) {
        if self.is_shut_down() || self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting channel node {}", self.local_id());

        let node = self.clone();
        self.inner.tasks.spawn(async move {
            node.bootstrap().await;
        });
        self.spawn_tickers();
    }

    /// Join a channel. Joining a channel twice is a no-op.
    pub async fn join_channel(&self, descriptor: &Descriptor) -> Result<()> {
        require_channel(descriptor)?;
        // Shutdown waits for this token before tearing down records
        let _busy = self.inner.tasks.token();
        self.ensure_running()?;

        let transition = self
            .until_shutdown(self.inner.state.transition(descriptor))
            .await?;
        if self.inner.state.is_joined(descriptor) {
            debug!("Already on {}", descriptor);
            return Ok(());
        }

        let join_failed = |source| ChannelError::JoinFailed {
            descriptor: descriptor.to_string(),
            source,
        };
        let topic = self
            .until_shutdown(self.inner.overlay.join_topic(descriptor.as_str()))
            .await?
            .map_err(join_failed)?;
        let subscribed = self.until_shutdown(topic.subscribe()).await;
        let subscription = match subscribed {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(source)) => {
                if let Err(e) = topic.close().await {
                    debug!("Closing {} after failed subscribe: {}", descriptor, e);
                }
                return Err(join_failed(source));
            }
            Err(shutdown) => {
                if let Err(e) = topic.close().await {
                    debug!("Closing {} during shutdown: {}", descriptor, e);
                }
                return Err(shutdown);
            }
        };

        let cancel = self.inner.cancel.child_token();
        let record = MembershipRecord::new(
            descriptor.clone(),
            Arc::clone(&topic),
            Arc::clone(&subscription),
            cancel.clone(),
        );
        if self.inner.state.insert_unless(record, &self.inner.cancel).is_err() {
            subscription.cancel();
            if let Err(e) = topic.close().await {
                debug!("Closing {} during shutdown: {}", descriptor, e);
            }
            return Err(ChannelError::Shutdown);
        }
        self.spawn_pump(descriptor, subscription, cancel);
        drop(transition);

        info!("Joined {}", descriptor);
        self.spawn_membership_refresh(descriptor.clone());
        Ok(())
    }

    fn spawn_pump(
        &self,
        descriptor: &Descriptor,
        subscription: Arc<dyn Subscription>,
        cancel: CancellationToken,
    ) {
        let outbound = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(outbound) = outbound else {
            return;
        };

        let handle = self.inner.tasks.spawn(pump::run(
            descriptor.clone(),
            subscription,
            self.local_id(),
            outbound,
            cancel,
        ));
        if let Some(orphan) = self.inner.state.set_pump(descriptor, handle) {
            orphan.abort();
        }
    }

    /// Announce and rejoin a freshly joined channel in the background.
    fn spawn_membership_refresh(&self, descriptor: Descriptor) {
        let node = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = node.announce_channel(&descriptor).await {
                if !e.is_shutdown() {
                    warn!("{}", e);
                }
            }
            match node.rejoin_channel(&descriptor).await {
                Ok(_) => {}
                Err(ChannelError::RejoinFailed(_)) => {
                    info!("No peers found for {} yet, will keep looking", descriptor);
                }
                Err(e) if e.is_shutdown() => {}
                Err(e) => warn!("{}", e),
            }
        });
    }

    /// Leave a channel, releasing its protected connections.
    pub async fn leave_channel(&self, descriptor: &Descriptor) -> Result<()> {
        require_channel(descriptor)?;
        let _busy = self.inner.tasks.token();
        self.ensure_running()?;

        let _transition = self
            .until_shutdown(self.inner.state.transition(descriptor))
            .await?;
        let mut record = self
            .inner
            .state
            .remove(descriptor)
            .ok_or_else(|| ChannelError::NotJoined(descriptor.to_string()))?;

        let mut peers: BTreeSet<PeerId> = record.protected.iter().copied().collect();
        match record.topic.list_peers().await {
            Ok(mesh) => peers.extend(mesh),
            Err(e) => warn!("Could not list peers of {}: {}", descriptor, e),
        }
        for peer in peers {
            self.inner.overlay.unprotect(peer, descriptor.as_str());
        }

        record.cancel.cancel();
        record.subscription.cancel();
        if let Some(pump) = record.pump.take() {
            if let Err(e) = pump.await {
                warn!("Message pump for {} ended abnormally: {}", descriptor, e);
            }
        }

        let closed = record
            .topic
            .close()
            .await
            .map_err(|source| ChannelError::LeaveFailed {
                descriptor: descriptor.to_string(),
                source,
            });
        info!("Left {}", descriptor);
        closed
    }

    /// Post a message in the background. Returns once the post is queued.
    ///
    /// Publication waits until the channel has at least
    /// [`NodeConfig::min_topic_size`] peers; failures are logged.
    pub fn post(&self, descriptor: &Descriptor, text: &str) -> Result<()> {
        self.ensure_running()?;
        let topic = self.channel_topic(descriptor)?;

        let node = self.clone();
        let descriptor = descriptor.clone();
        let payload = text.as_bytes().to_vec();
        self.inner.tasks.spawn(async move {
            if let Err(e) = node.publish_to(&descriptor, topic, &payload).await {
                if !e.is_shutdown() {
                    warn!("{}", e);
                }
            }
        });
        Ok(())
    }

    /// Publish a message and wait until the overlay accepted it.
    pub async fn publish(&self, descriptor: &Descriptor, text: &str) -> Result<()> {
        self.ensure_running()?;
        let topic = self.channel_topic(descriptor)?;
        self.publish_to(descriptor, topic, text.as_bytes()).await
    }

    async fn publish_to(
        &self,
        descriptor: &Descriptor,
        topic: Arc<dyn Topic>,
        payload: &[u8],
    ) -> Result<()> {
        match topic.list_peers().await {
            Ok(peers) if peers.is_empty() => warn!(
                "No peers on {} yet, message will be sent once one connects",
                descriptor
            ),
            Ok(_) => {}
            Err(e) => debug!("Could not list peers of {}: {}", descriptor, e),
        }

        let readiness = Readiness {
            min_topic_size: self.inner.config.min_topic_size,
        };
        self.until_shutdown(topic.publish(payload, readiness))
            .await?
            .map_err(|source| ChannelError::PublishFailed {
                descriptor: descriptor.to_string(),
                source,
            })
    }

    fn channel_topic(&self, descriptor: &Descriptor) -> Result<Arc<dyn Topic>> {
        require_channel(descriptor)?;
        self.inner
            .state
            .topic(descriptor)
            .ok_or_else(|| ChannelError::NotJoined(descriptor.to_string()))
    }

    pub fn is_joined(&self, descriptor: &Descriptor) -> bool {
        self.inner.state.is_joined(descriptor)
    }

    /// Joined channels, sorted.
    pub fn joined_channels(&self) -> Vec<Descriptor> {
        self.inner.state.descriptors()
    }

    /// Peers protected for `descriptor` by rejoin cycles.
    pub fn protected_members(&self, descriptor: &Descriptor) -> Vec<PeerId> {
        self.inner.state.protected_peers(descriptor)
    }

    /// Mesh peers of a joined channel that we hold a live connection to.
    pub async fn connected_members(&self, descriptor: &Descriptor) -> Vec<PeerId> {
        if self.is_shut_down() {
            return Vec::new();
        }
        let Some(topic) = self.inner.state.topic(descriptor) else {
            return Vec::new();
        };
        let peers = match topic.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                debug!("Could not list peers of {}: {}", descriptor, e);
                return Vec::new();
            }
        };

        let mut connected = Vec::with_capacity(peers.len());
        for peer in peers {
            if self.is_connected(peer).await {
                connected.push(peer);
            }
        }
        connected
    }

    /// Everything known about one channel, joined or not.
    pub async fn channel_info(&self, descriptor: &Descriptor) -> Result<ChannelInfo> {
        require_channel(descriptor)?;
        self.ensure_running()?;

        let mut info = ChannelInfo::new(descriptor);
        info.joined = self.is_joined(descriptor);
        if info.joined {
            info.connected_members = self.connected_members(descriptor).await;
            info.protected_members = self.protected_members(descriptor);
        }
        Ok(info)
    }

    /// Connected peers with the number of open connections to each.
    pub async fn peer_connections(&self) -> Result<Vec<(PeerId, usize)>> {
        self.ensure_running()?;
        let peers = self.until_shutdown(self.inner.overlay.peers()).await??;

        let mut connections = Vec::with_capacity(peers.len());
        for peer in peers {
            let conns = self
                .until_shutdown(self.inner.overlay.conns_to_peer(peer))
                .await?
                .unwrap_or(0);
            connections.push((peer, conns));
        }
        Ok(connections)
    }

    /// Round-trip time to a connected peer, bounded by the dial timeout.
    pub async fn ping(&self, peer: PeerId) -> Result<Duration> {
        self.ensure_running()?;
        let ping = tokio::time::timeout(
            self.inner.config.dial_timeout,
            self.inner.overlay.ping(peer),
        );
        let source = match self.until_shutdown(ping).await? {
            Ok(Ok(rtt)) => return Ok(rtt),
            Ok(Err(source)) => source,
            Err(_) => OverlayError::Timeout,
        };
        Err(ChannelError::PingFailed { peer, source })
    }

    /// Snapshot of the node's network health.
    pub async fn status(&self) -> Result<NodeStatus> {
        self.ensure_running()?;
        let overlay = &self.inner.overlay;

        let connected_peers = overlay.peers().await?.len();
        let known_peers = overlay.known_peer_count().await?;
        let subscription_count = overlay.topic_count().await?;
        let nat_restricted = overlay.reachability().await? == Reachability::Private;

        Ok(NodeStatus {
            state: NetworkState::classify(
                connected_peers,
                self.inner.config.bootstrap.len(),
                self.inner.config.conns_low,
            ),
            connected_peers,
            known_peers,
            subscription_count,
            nat_restricted,
        })
    }

    /// Dial every configured bootstrap peer. Returns how many connected.
    pub async fn bootstrap(&self) -> usize {
        let bootstrap = &self.inner.config.bootstrap;
        if bootstrap.is_empty() {
            info!("No bootstrap peers configured, waiting for inbound connections");
            return 0;
        }

        let mut connected = 0;
        for peer in bootstrap {
            match self.connect_peer(peer).await {
                Ok(()) => connected += 1,
                Err(ChannelError::Shutdown) => return connected,
                Err(e) => warn!("Bootstrap peer unavailable: {}", e),
            }
        }
        info!(
            "Connected to {} of {} bootstrap peers",
            connected,
            bootstrap.len()
        );
        connected
    }

    /// Dial one peer, bounded by the dial timeout.
    pub async fn connect_peer(&self, peer: &PeerInfo) -> Result<()> {
        self.ensure_running()?;
        self.dial(peer).await
    }

    pub(crate) async fn dial(&self, peer: &PeerInfo) -> Result<()> {
        let dial = tokio::time::timeout(
            self.inner.config.dial_timeout,
            self.inner.overlay.connect(peer),
        );
        let source = match self.until_shutdown(dial).await? {
            Ok(Ok(())) => {
                debug!("Connected to {}", peer.id);
                return Ok(());
            }
            Ok(Err(source)) => source,
            Err(_) => OverlayError::Timeout,
        };
        Err(ChannelError::ConnectFailed {
            peer: peer.id,
            source,
        })
    }

    /// Whether we hold at least one open connection to `peer`.
    pub async fn is_connected(&self, peer: PeerId) -> bool {
        if self.is_shut_down() {
            return false;
        }
        matches!(self.inner.overlay.conns_to_peer(peer).await, Ok(n) if n > 0)
    }

    /// Stop all background work and release every channel.
    ///
    /// Afterwards every operation fails with [`ChannelError::Shutdown`] and
    /// the message stream ends. Calling it again does nothing.
    pub async fn shutdown(&self) {
        if self.is_shut_down() {
            return;
        }
        info!("Shutting down channel node {}", self.local_id());
        self.inner.cancel.cancel();

        self.inner.tasks.close();
        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!("Background tasks still running after {:?}", timeout);
        }

        for mut record in self.inner.state.drain() {
            record.cancel.cancel();
            record.subscription.cancel();
            if let Some(pump) = record.pump.take() {
                pump.abort();
            }
            if let Err(e) = record.topic.close().await {
                debug!("Closing {} during shutdown: {}", record.descriptor, e);
            }
        }

        drop(
            self.inner
                .outbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        info!("Channel node stopped");
    }
}

fn require_channel(descriptor: &Descriptor) -> Result<()> {
    match descriptor {
        Descriptor::Channel(_) => Ok(()),
        Descriptor::Direct(_) => Err(ChannelError::NotImplemented("Direct messages")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn node(network: &Arc<MemoryNetwork>, id: u64) -> ChannelNode {
        ChannelNode::new(network.add_node(PeerId::from(id)), NodeConfig::for_testing())
    }

    #[tokio::test]
    async fn test_join_blocked_on_transition_stops_at_shutdown() {
        let network = MemoryNetwork::new();
        let node = node(&network, 1);
        let general = Descriptor::channel("general").unwrap();

        let held = node.inner.state.transition(&general).await;
        let join = {
            let node = node.clone();
            let general = general.clone();
            tokio::spawn(async move { node.join_channel(&general).await })
        };
        sleep(Duration::from_millis(20)).await;

        timeout(Duration::from_secs(1), node.shutdown())
            .await
            .expect("shutdown should not wait for the blocked join");
        let calls = network.call_count(PeerId::from(1));
        drop(held);

        let result = timeout(Duration::from_secs(1), join).await.unwrap().unwrap();
        assert!(matches!(result, Err(ChannelError::Shutdown)));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(network.call_count(PeerId::from(1)), calls);
        assert_eq!(calls, 0);
        assert!(!node.is_joined(&general));
    }

    #[tokio::test]
    async fn test_leave_blocked_on_transition_stops_at_shutdown() {
        let network = MemoryNetwork::new();
        let node = node(&network, 1);
        let general = Descriptor::channel("general").unwrap();
        node.join_channel(&general).await.unwrap();

        let held = node.inner.state.transition(&general).await;
        let leave = {
            let node = node.clone();
            let general = general.clone();
            tokio::spawn(async move { node.leave_channel(&general).await })
        };
        sleep(Duration::from_millis(20)).await;

        timeout(Duration::from_secs(1), node.shutdown())
            .await
            .expect("shutdown should not wait for the blocked leave");
        let calls = network.call_count(PeerId::from(1));
        drop(held);

        let result = timeout(Duration::from_secs(1), leave).await.unwrap().unwrap();
        assert!(matches!(result, Err(ChannelError::Shutdown)));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(network.call_count(PeerId::from(1)), calls);
        assert_eq!(node.inner.state.pending_transitions(), 0);
    }

    #[tokio::test]
    async fn test_transition_locks_do_not_accumulate() {
        let network = MemoryNetwork::new();
        let node = node(&network, 1);

        for name in ["a", "b", "c"] {
            let channel = Descriptor::channel(name).unwrap();
            node.join_channel(&channel).await.unwrap();
            node.leave_channel(&channel).await.unwrap();
        }
        let unjoined = Descriptor::channel("elsewhere").unwrap();
        assert!(node.rejoin_channel(&unjoined).await.is_err());

        assert_eq!(node.inner.state.pending_transitions(), 0);
        node.shutdown().await;
    }
}
