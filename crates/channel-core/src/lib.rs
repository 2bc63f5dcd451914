//! channel-core: Channel mesh membership for a gossip-based P2P chat overlay.
//!
//! This crate provides:
//! - Descriptor expansion between short (`#general`) and protocol forms
//! - Joining, leaving and posting to channels through an `Overlay`
//! - Periodic rejoin and announcement that keep each channel's mesh connected
//! - Network health reporting
//! - An in-process `MemoryNetwork` overlay for tests and the relay hub

pub mod config;
pub mod descriptor;
pub mod error;
pub mod membership;
pub mod memory;
pub mod node;
pub mod overlay;
pub mod peer_id;
pub mod pump;
pub mod scheduler;
pub mod status;

pub use config::NodeConfig;
pub use descriptor::Descriptor;
pub use error::{ChannelError, Result};
pub use memory::{MemoryNetwork, MemoryOverlay};
pub use node::ChannelNode;
pub use overlay::{
    Delivery, Overlay, OverlayError, PeerInfo, Reachability, Readiness, Subscription, Topic,
};
pub use peer_id::{PeerId, PeerIdError};
pub use pump::Message;
pub use status::{ChannelInfo, NetworkState, NodeStatus};
