//! PeerId: Identifier for a node in the chat overlay.
//!
//! Wraps a u64 internally but displays as a 16-character hex string,
//! which is also the form used on the wire and in configuration files.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Invalid peer ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A unique identifier for a node in the overlay.
///
/// # Examples
/// ```
/// use channel_core::PeerId;
///
/// let peer_id = PeerId::generate();
/// println!("{}", peer_id);  // "a1b2c3d4e5f67890"
///
/// let parsed: PeerId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Generate a new random peer ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Abbreviated form for console output (first 8 hex chars).
    pub fn short(&self) -> String {
        let full = self.to_string();
        full[..8].to_string()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PeerIdError::InvalidFormat);
        }
        let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
        Ok(Self(id))
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<PeerId> for u64 {
    fn from(peer_id: PeerId) -> u64 {
        peer_id.0
    }
}

// Serialize as hex string for consistency in logs, handshakes and wire frames
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        let peer_id = PeerId(0xff);
        assert_eq!(peer_id.to_string(), "00000000000000ff");
        assert_eq!(peer_id.short(), "00000000");
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let peer_id: PeerId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(peer_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let peer_id: PeerId = "a1b2c3d4e5f67890\n".parse().unwrap();
        assert_eq!(peer_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_invalid_format() {
        assert!("too_short".parse::<PeerId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<PeerId>().is_err());
        assert!("a1b2c3d4e5f6789".parse::<PeerId>().is_err()); // 15 chars
        assert!("".parse::<PeerId>().is_err());
        // UUIDs are not peer IDs here
        assert!("550e8400-e29b-41d4-a716-446655440000"
            .parse::<PeerId>()
            .is_err());
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(PeerId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_serde_uses_hex_string() {
        let original = PeerId(0xa1b2c3d4e5f67890);
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, "\"a1b2c3d4e5f67890\"");
        let parsed: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
