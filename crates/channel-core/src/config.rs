//! Node configuration.

use crate::overlay::PeerInfo;
use std::time::Duration;

/// Tunables for membership maintenance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Peers dialed at startup
    pub bootstrap: Vec<PeerInfo>,
    /// Connection count at which the node reports itself ready
    pub conns_low: usize,
    /// Interval between rejoin cycles over all joined channels
    pub rejoin_interval: Duration,
    /// Interval between membership announcements
    pub announce_interval: Duration,
    /// Lifetime of a membership advertisement
    pub advertise_ttl: Duration,
    /// Maximum peers requested from discovery per rejoin
    pub discovery_limit: usize,
    /// Maximum peers protected from eviction per channel
    pub max_protected_peers: usize,
    /// Upper bound for the discovery and dial phase of one rejoin
    pub rejoin_timeout: Duration,
    pub dial_timeout: Duration,
    /// Topic peers required before a post is published
    pub min_topic_size: usize,
    /// Capacity of the inbound message queue
    pub message_buffer: usize,
    /// How long shutdown waits for background tasks
    pub shutdown_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            conns_low: 100,
            rejoin_interval: Duration::from_secs(15),
            announce_interval: Duration::from_secs(5 * 60),
            advertise_ttl: Duration::from_secs(10 * 60),
            discovery_limit: 100,
            max_protected_peers: 10,
            rejoin_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(15),
            min_topic_size: 1,
            message_buffer: 64,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    /// Short intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            rejoin_interval: Duration::from_millis(100),
            announce_interval: Duration::from_millis(200),
            advertise_ttl: Duration::from_secs(30),
            rejoin_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }
}
