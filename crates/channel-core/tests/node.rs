//! Integration tests for ChannelNode over the in-process MemoryNetwork.
//!
//! Covers join/leave bookkeeping, rejoin protection, status reporting,
//! message delivery between nodes and shutdown.

use std::sync::Arc;
use std::time::Duration;

use channel_core::{
    ChannelError, ChannelNode, Descriptor, MemoryNetwork, NetworkState, NodeConfig, Overlay,
    PeerId, PeerInfo, Reachability,
};
use tokio::time::{sleep, timeout};

fn channel(name: &str) -> Descriptor {
    Descriptor::channel(name).unwrap()
}

fn node_on(network: &Arc<MemoryNetwork>, id: u64, config: NodeConfig) -> ChannelNode {
    ChannelNode::new(network.add_node(PeerId::from(id)), config)
}

/// Poll `condition` until it holds or two seconds pass.
async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Add `count` nodes starting at `first_id` that advertise `descriptor`.
async fn advertisers(
    network: &Arc<MemoryNetwork>,
    descriptor: &Descriptor,
    first_id: u64,
    count: u64,
) -> Vec<PeerId> {
    let mut ids = Vec::new();
    for id in first_id..first_id + count {
        let overlay = network.add_node(PeerId::from(id));
        overlay
            .advertise(descriptor.as_str(), Duration::from_secs(60))
            .await
            .unwrap();
        ids.push(PeerId::from(id));
    }
    ids
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");

    node.join_channel(&general).await.unwrap();
    node.join_channel(&general).await.unwrap();

    assert!(node.is_joined(&general));
    assert_eq!(node.joined_channels(), vec![general.clone()]);
    assert_eq!(
        network.subscription_count(PeerId::from(1), general.as_str()),
        1
    );
    node.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_joins_subscribe_once() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");

    let joins: Vec<_> = (0..8)
        .map(|_| {
            let node = node.clone();
            let general = general.clone();
            tokio::spawn(async move { node.join_channel(&general).await })
        })
        .collect();
    for join in joins {
        join.await.unwrap().unwrap();
    }

    assert_eq!(
        network.subscription_count(PeerId::from(1), general.as_str()),
        1
    );
    node.shutdown().await;
}

#[tokio::test]
async fn test_operations_on_unjoined_channel() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");

    assert!(matches!(
        node.leave_channel(&general).await,
        Err(ChannelError::NotJoined(_))
    ));
    assert!(matches!(
        node.post(&general, "hi"),
        Err(ChannelError::NotJoined(_))
    ));
    assert!(node.connected_members(&general).await.is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn test_direct_messages_not_implemented() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let alice = Descriptor::parse("@alice").unwrap();

    assert!(matches!(
        node.join_channel(&alice).await,
        Err(ChannelError::NotImplemented(_))
    ));
    assert!(matches!(
        node.leave_channel(&alice).await,
        Err(ChannelError::NotImplemented(_))
    ));
    assert!(matches!(
        node.post(&alice, "hi"),
        Err(ChannelError::NotImplemented(_))
    ));
    assert!(matches!(
        Descriptor::parse("general"),
        Err(ChannelError::InvalidDescriptor(_))
    ));
    node.shutdown().await;
}

#[tokio::test]
async fn test_join_failure_leaves_no_record() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");

    network.set_join_failure(PeerId::from(1), true);
    let err = node.join_channel(&general).await.unwrap_err();
    assert!(matches!(err, ChannelError::JoinFailed { .. }));
    assert!(!node.is_joined(&general));

    network.set_join_failure(PeerId::from(1), false);
    node.join_channel(&general).await.unwrap();
    assert!(node.is_joined(&general));
    node.shutdown().await;
}

#[tokio::test]
async fn test_rejoin_protects_at_most_cap_peers() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");
    advertisers(&network, &general, 2, 15).await;

    node.join_channel(&general).await.unwrap();
    let connected = node.rejoin_channel(&general).await.unwrap();

    assert_eq!(connected, 15);
    assert_eq!(
        network
            .protected_peers(PeerId::from(1), general.as_str())
            .len(),
        10
    );
    assert_eq!(node.protected_members(&general).len(), 10);

    // A second cycle never grows past the cap
    node.rejoin_channel(&general).await.unwrap();
    assert_eq!(
        network
            .protected_peers(PeerId::from(1), general.as_str())
            .len(),
        10
    );
    node.shutdown().await;
}

#[tokio::test]
async fn test_rejoin_without_peers_fails() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");

    node.join_channel(&general).await.unwrap();
    let err = node.rejoin_channel(&general).await.unwrap_err();

    assert!(matches!(err, ChannelError::RejoinFailed(_)));
    assert!(network
        .protected_peers(PeerId::from(1), general.as_str())
        .is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn test_rejoin_skips_unreachable_peers() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");
    let peers = advertisers(&network, &general, 2, 3).await;
    network.set_reachable(peers[0], false);

    node.join_channel(&general).await.unwrap();
    assert_eq!(node.rejoin_channel(&general).await.unwrap(), 2);

    let protected = network.protected_peers(PeerId::from(1), general.as_str());
    assert_eq!(protected, vec![peers[1], peers[2]]);
    node.shutdown().await;
}

#[tokio::test]
async fn test_leave_releases_protection() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");
    let rust = channel("rust");
    // Peer 2 is a member of both channels
    let both = network.add_node(PeerId::from(2));
    both.advertise(general.as_str(), Duration::from_secs(60))
        .await
        .unwrap();
    both.advertise(rust.as_str(), Duration::from_secs(60))
        .await
        .unwrap();
    let general_only = advertisers(&network, &general, 3, 2).await;

    node.join_channel(&general).await.unwrap();
    node.join_channel(&rust).await.unwrap();
    node.rejoin_channel(&general).await.unwrap();
    node.rejoin_channel(&rust).await.unwrap();
    assert_eq!(
        network
            .protected_peers(PeerId::from(1), general.as_str())
            .len(),
        3
    );

    node.leave_channel(&general).await.unwrap();

    assert!(!node.is_joined(&general));
    assert!(network
        .protected_peers(PeerId::from(1), general.as_str())
        .is_empty());
    assert_eq!(
        network.subscription_count(PeerId::from(1), general.as_str()),
        0
    );
    assert!(network.is_protected(PeerId::from(1), both.local_id()));
    assert!(!network.is_protected(PeerId::from(1), general_only[0]));
    node.shutdown().await;
}

#[tokio::test]
async fn test_status_states() {
    let network = MemoryNetwork::new();
    network.add_node(PeerId::from(2));
    network.add_node(PeerId::from(3));

    let isolated = node_on(&network, 1, NodeConfig::for_testing());
    let status = isolated.status().await.unwrap();
    assert_eq!(status.state, NetworkState::Isolated);
    assert_eq!(status.connected_peers, 0);
    assert!(!status.nat_restricted);
    isolated.shutdown().await;

    let config = NodeConfig {
        bootstrap: vec![PeerInfo::new(PeerId::from(2))],
        ..NodeConfig::for_testing()
    };
    let bootstrapping = node_on(&network, 4, config);
    assert_eq!(bootstrapping.bootstrap().await, 1);
    let status = bootstrapping.status().await.unwrap();
    assert_eq!(status.state, NetworkState::Bootstrapping);
    assert_eq!(status.connected_peers, 1);
    bootstrapping.shutdown().await;

    let config = NodeConfig {
        conns_low: 2,
        ..NodeConfig::for_testing()
    };
    let ready = node_on(&network, 5, config);
    network.link(PeerId::from(5), PeerId::from(2));
    assert_eq!(
        ready.status().await.unwrap().state,
        NetworkState::Active
    );
    network.link(PeerId::from(5), PeerId::from(3));
    network.set_reachability(PeerId::from(5), Reachability::Private);
    let status = ready.status().await.unwrap();
    assert_eq!(status.state, NetworkState::Ready);
    assert!(status.nat_restricted);
    ready.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_counts_only_successful_dials() {
    let network = MemoryNetwork::new();
    network.add_node(PeerId::from(2));
    network.add_node(PeerId::from(3));
    network.set_reachable(PeerId::from(3), false);

    let config = NodeConfig {
        bootstrap: vec![
            PeerInfo::new(PeerId::from(2)),
            PeerInfo::new(PeerId::from(3)),
            PeerInfo::new(PeerId::from(99)),
        ],
        ..NodeConfig::for_testing()
    };
    let node = node_on(&network, 1, config);

    assert_eq!(node.bootstrap().await, 1);
    assert!(node.is_connected(PeerId::from(2)).await);
    assert!(!node.is_connected(PeerId::from(3)).await);
    assert!(matches!(
        node.connect_peer(&PeerInfo::new(PeerId::from(3))).await,
        Err(ChannelError::ConnectFailed { .. })
    ));
    node.shutdown().await;
}

#[tokio::test]
async fn test_message_delivery_without_self_echo() {
    let network = MemoryNetwork::new();
    let a = node_on(&network, 1, NodeConfig::for_testing());
    let b = node_on(&network, 2, NodeConfig::for_testing());
    let general = channel("general");
    let mut a_messages = a.messages().unwrap();
    let mut b_messages = b.messages().unwrap();
    assert!(a.messages().is_none());

    a.join_channel(&general).await.unwrap();
    b.join_channel(&general).await.unwrap();
    a.connect_peer(&PeerInfo::new(b.local_id())).await.unwrap();

    a.publish(&general, "hello").await.unwrap();

    let message = timeout(Duration::from_secs(2), b_messages.recv())
        .await
        .expect("B should receive the message")
        .unwrap();
    assert_eq!(message.sender, a.local_id());
    assert_eq!(message.channel, general);
    assert_eq!(message.text, "hello");

    assert!(
        timeout(Duration::from_millis(200), a_messages.recv())
            .await
            .is_err(),
        "A must not see its own message"
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_started_nodes_find_each_other() {
    let network = MemoryNetwork::new();
    let a = node_on(&network, 1, NodeConfig::for_testing());
    let b = node_on(&network, 2, NodeConfig::for_testing());
    let general = channel("general");
    let mut b_messages = b.messages().unwrap();

    a.start();
    b.start();
    a.join_channel(&general).await.unwrap();
    b.join_channel(&general).await.unwrap();

    assert!(
        wait_until(|| network.is_linked(PeerId::from(1), PeerId::from(2))).await,
        "rejoin should connect the two members"
    );
    assert_eq!(a.connected_members(&general).await, vec![b.local_id()]);

    a.post(&general, "hi from a").unwrap();
    let message = timeout(Duration::from_secs(2), b_messages.recv())
        .await
        .expect("B should receive the post")
        .unwrap();
    assert_eq!(message.text, "hi from a");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_publish_waits_for_peers() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");
    node.join_channel(&general).await.unwrap();

    assert!(node.post(&general, "queued").is_ok());
    assert!(
        timeout(Duration::from_millis(100), node.publish(&general, "waiting"))
            .await
            .is_err(),
        "publish should wait until the channel has a peer"
    );
    node.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let general = channel("general");
    let mut messages = node.messages().unwrap();

    node.start();
    node.join_channel(&general).await.unwrap();
    node.shutdown().await;

    let end = timeout(Duration::from_secs(1), messages.recv())
        .await
        .expect("message stream should end");
    assert!(end.is_none());

    let calls = network.call_count(PeerId::from(1));
    sleep(Duration::from_millis(300)).await;
    assert_eq!(network.call_count(PeerId::from(1)), calls);

    assert!(matches!(
        node.join_channel(&general).await,
        Err(ChannelError::Shutdown)
    ));
    assert!(matches!(node.status().await, Err(ChannelError::Shutdown)));
    assert!(matches!(
        node.rejoin_channel(&general).await,
        Err(ChannelError::Shutdown)
    ));
    assert_eq!(network.call_count(PeerId::from(1)), calls);

    // Idempotent
    node.shutdown().await;
}

#[tokio::test]
async fn test_channel_info_reports_membership() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    let peer = node_on(&network, 2, NodeConfig::for_testing());
    let general = channel("general");

    peer.join_channel(&general).await.unwrap();
    peer.announce_channel(&general).await.unwrap();
    node.join_channel(&general).await.unwrap();
    assert_eq!(node.rejoin_channel(&general).await.unwrap(), 1);

    let info = node.channel_info(&general).await.unwrap();
    assert_eq!(info.name, "#general");
    assert_eq!(info.descriptor, "/infinitychat/v0.1/channel/general");
    assert!(info.joined);
    assert_eq!(info.connected_members, vec![PeerId::from(2)]);
    assert_eq!(info.protected_members, vec![PeerId::from(2)]);

    let other = node.channel_info(&channel("other")).await.unwrap();
    assert!(!other.joined);
    assert!(other.connected_members.is_empty());

    let dm = Descriptor::parse("@alice").unwrap();
    assert!(matches!(
        node.channel_info(&dm).await,
        Err(ChannelError::NotImplemented(_))
    ));

    node.shutdown().await;
    assert!(matches!(
        node.channel_info(&general).await,
        Err(ChannelError::Shutdown)
    ));
    peer.shutdown().await;
}

#[tokio::test]
async fn test_peer_connections_and_ping() {
    let network = MemoryNetwork::new();
    let node = node_on(&network, 1, NodeConfig::for_testing());
    network.add_node(PeerId::from(2));
    network.add_node(PeerId::from(3));

    assert!(node.peer_connections().await.unwrap().is_empty());
    assert!(matches!(
        node.ping(PeerId::from(2)).await,
        Err(ChannelError::PingFailed { .. })
    ));

    node.connect_peer(&PeerInfo::new(PeerId::from(2))).await.unwrap();
    node.connect_peer(&PeerInfo::new(PeerId::from(3))).await.unwrap();
    assert_eq!(
        node.peer_connections().await.unwrap(),
        vec![(PeerId::from(2), 1), (PeerId::from(3), 1)]
    );
    assert!(node.ping(PeerId::from(3)).await.is_ok());

    node.shutdown().await;
    assert!(matches!(
        node.ping(PeerId::from(3)).await,
        Err(ChannelError::Shutdown)
    ));
}
