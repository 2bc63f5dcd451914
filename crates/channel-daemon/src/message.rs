//! Wire protocol between nodes and the relay hub.
//!
//! A connection starts with a JSON handshake sent as a binary WebSocket frame.
//! Every frame after that is a bincode-encoded [`Frame`].

use channel_core::{OverlayError, PeerId, PeerInfo, Reachability};
use serde::{Deserialize, Serialize};

/// Frames larger than this (1 MiB) are dropped.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Handshake message exchanged when a node connects to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Always "handshake"
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(rename = "peerId")]
    pub peer_id: String,

    /// "hub" or "node"
    pub role: String,
}

impl HandshakeMessage {
    pub fn new(peer_id: &str, role: &str) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            peer_id: peer_id.to_string(),
            role: role.to_string(),
        }
    }

    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> Vec<u8> {
        // Only plain strings, so this cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Try to parse a handshake from binary data.
    ///
    /// Returns None if the data is not UTF-8 JSON or not a handshake message.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let msg: Self = serde_json::from_str(text).ok()?;
        (msg.msg_type == "handshake").then_some(msg)
    }
}

/// Quick check if data looks like a JSON handshake (starts with '{').
///
/// Bincode frames start with a little-endian variant index, never '{'.
pub fn is_likely_handshake(data: &[u8]) -> bool {
    data.first() == Some(&b'{')
}

/// One overlay operation a node asks the hub to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    JoinTopic { topic: String },
    Subscribe { topic: String },
    CancelSubscription { sub_id: u64 },
    Publish {
        topic: String,
        data: Vec<u8>,
        min_topic_size: usize,
    },
    ListPeers { topic: String },
    CloseTopic { topic: String },
    Advertise { topic: String, ttl_ms: u64 },
    FindPeers { topic: String, limit: usize },
    Connect { peer: PeerInfo },
    ConnsToPeer { peer: PeerId },
    Peers,
    KnownPeerCount,
    TopicCount,
    Reachability,
    /// Answered after the hub checks the link to `peer`
    Ping { peer: PeerId },
}

/// Successful result of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Done,
    Subscribed { sub_id: u64 },
    Peers(Vec<PeerId>),
    Found(Vec<PeerInfo>),
    Count(u64),
    Reachability(Reachability),
}

/// [`OverlayError`] in a form that crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    TopicExists(String),
    TopicClosed(String),
    SubscriptionCancelled,
    ConnectionFailed(PeerId, String),
    Timeout,
    Unavailable(String),
    Other(String),
}

impl From<OverlayError> for WireError {
    fn from(e: OverlayError) -> Self {
        match e {
            OverlayError::TopicExists(t) => WireError::TopicExists(t),
            OverlayError::TopicClosed(t) => WireError::TopicClosed(t),
            OverlayError::SubscriptionCancelled => WireError::SubscriptionCancelled,
            OverlayError::ConnectionFailed(peer, reason) => {
                WireError::ConnectionFailed(peer, reason)
            }
            OverlayError::Timeout => WireError::Timeout,
            OverlayError::Unavailable(reason) => WireError::Unavailable(reason),
            OverlayError::Other(reason) => WireError::Other(reason),
        }
    }
}

impl From<WireError> for OverlayError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::TopicExists(t) => OverlayError::TopicExists(t),
            WireError::TopicClosed(t) => OverlayError::TopicClosed(t),
            WireError::SubscriptionCancelled => OverlayError::SubscriptionCancelled,
            WireError::ConnectionFailed(peer, reason) => {
                OverlayError::ConnectionFailed(peer, reason)
            }
            WireError::Timeout => OverlayError::Timeout,
            WireError::Unavailable(reason) => OverlayError::Unavailable(reason),
            WireError::Other(reason) => OverlayError::Other(reason),
        }
    }
}

/// Everything sent after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Node -> hub
    Request { id: u64, op: Request },
    /// Hub -> node, answers the request with the same `id`
    Response {
        id: u64,
        result: Result<Reply, WireError>,
    },
    /// Hub -> node, a message on subscription `sub_id`
    Deliver {
        sub_id: u64,
        from: PeerId,
        data: Vec<u8>,
    },
    /// Hub -> node, no more deliveries for `sub_id`
    SubscriptionClosed { sub_id: u64 },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let msg = HandshakeMessage::new("a1b2c3d4e5f67890", "node");
        let parsed = HandshakeMessage::from_binary(&msg.to_binary()).unwrap();

        assert_eq!(parsed.msg_type, "handshake");
        assert_eq!(parsed.peer_id, "a1b2c3d4e5f67890");
        assert_eq!(parsed.role, "node");
    }

    #[test]
    fn test_handshake_uses_camel_case_peer_id() {
        let json = String::from_utf8(HandshakeMessage::new("x", "hub").to_binary()).unwrap();
        assert!(json.contains("\"peerId\":\"x\""));
        assert!(json.contains("\"type\":\"handshake\""));
    }

    #[test]
    fn test_frames_are_not_mistaken_for_handshakes() {
        let frame = Frame::Request {
            id: 7,
            op: Request::Peers,
        };
        assert!(!is_likely_handshake(&frame.encode().unwrap()));
        assert!(is_likely_handshake(
            &HandshakeMessage::new("peer", "node").to_binary()
        ));
    }

    #[test]
    fn test_non_handshake_json_returns_none() {
        assert!(HandshakeMessage::from_binary(b"not json at all").is_none());
        assert!(HandshakeMessage::from_binary(b"{\"type\": \"other\", \"peerId\": \"x\", \"role\": \"node\"}").is_none());
    }

    #[test]
    fn test_error_response_decodes() {
        let frame = Frame::Response {
            id: 3,
            result: Err(WireError::ConnectionFailed(
                PeerId::from(9),
                "unreachable".into(),
            )),
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        let Frame::Response { result: Err(e), .. } = decoded else {
            panic!("expected error response");
        };
        assert!(matches!(
            OverlayError::from(e),
            OverlayError::ConnectionFailed(peer, _) if peer == PeerId::from(9)
        ));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(Frame::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
