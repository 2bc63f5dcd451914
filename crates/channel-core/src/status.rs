//! Coarse network health reporting.

use crate::PeerId;
use crate::descriptor::Descriptor;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Health label derived from connection counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkState {
    /// No connections at all
    Isolated,
    /// Only (at most) the bootstrap peers are connected
    Bootstrapping,
    /// Connected, but below the low-water mark
    Active,
    Ready,
}

impl NetworkState {
    /// Derive the state from the connected peer count.
    ///
    /// Checked in order: zero connections, bootstrap-only, low-water mark.
    pub fn classify(connected: usize, bootstrap_peers: usize, low_water_mark: usize) -> Self {
        if connected == 0 {
            NetworkState::Isolated
        } else if bootstrap_peers != 0 && connected <= bootstrap_peers {
            NetworkState::Bootstrapping
        } else if connected < low_water_mark {
            NetworkState::Active
        } else {
            NetworkState::Ready
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NetworkState::Isolated => "isolated",
            NetworkState::Bootstrapping => "bootstrapping",
            NetworkState::Active => "active",
            NetworkState::Ready => "ready",
        }
    }
}

impl Display for NetworkState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time snapshot of the node's network health. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub state: NetworkState,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub subscription_count: usize,
    /// Whether the overlay classified us as behind a NAT
    pub nat_restricted: bool,
}

/// What this node knows about one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    /// Short form (`#name`)
    pub name: String,
    /// Wire form used on the overlay
    pub descriptor: String,
    pub joined: bool,
    /// Mesh peers we hold a live connection to
    pub connected_members: Vec<PeerId>,
    /// Peers protected for this channel by rejoin cycles
    pub protected_members: Vec<PeerId>,
}

impl ChannelInfo {
    pub(crate) fn new(descriptor: &Descriptor) -> Self {
        Self {
            name: descriptor.to_string(),
            descriptor: descriptor.as_str().to_string(),
            joined: false,
            connected_members: Vec::new(),
            protected_members: Vec::new(),
        }
    }
}
