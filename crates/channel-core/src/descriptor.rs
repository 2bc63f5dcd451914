//! Channel and direct-message descriptors.
//!
//! Users type short references (`#general`, `@alice`); the overlay works with
//! fully-qualified protocol descriptors. `expand` and `for_display` convert
//! between the two, and `Descriptor` classifies a descriptor once so the rest
//! of the crate can match on the namespace instead of string prefixes.

use crate::error::{ChannelError, Result};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Every fully-qualified descriptor starts with this marker.
pub const ROOT_MARKER: char = '/';
pub const CHANNEL_MARKER: char = '#';
pub const DIRECT_MARKER: char = '@';

pub const CHANNEL_PREFIX: &str = "/infinitychat/v0.1/channel/";
pub const DIRECT_PREFIX: &str = "/infinity/v0.1/dm/";

/// Convert a short descriptor into the full form used in protocol communication.
///
/// Idempotent: input that is already fully-qualified is returned unchanged.
///
/// ```
/// use channel_core::descriptor::expand;
///
/// let full = expand("#general").unwrap();
/// assert_eq!(full, "/infinitychat/v0.1/channel/general");
/// assert_eq!(expand(&full).unwrap(), full);
/// ```
pub fn expand(short_or_full: &str) -> Result<String> {
    if short_or_full.starts_with(ROOT_MARKER) {
        return Ok(short_or_full.to_string());
    }

    let (prefix, name) = if let Some(name) = short_or_full.strip_prefix(CHANNEL_MARKER) {
        (CHANNEL_PREFIX, name)
    } else if let Some(name) = short_or_full.strip_prefix(DIRECT_MARKER) {
        (DIRECT_PREFIX, name)
    } else {
        return Err(ChannelError::InvalidDescriptor(short_or_full.to_string()));
    };

    if name.is_empty() {
        return Err(ChannelError::InvalidDescriptor(short_or_full.to_string()));
    }

    Ok(format!("{prefix}{name}"))
}

/// Convert a full descriptor back to its short form. Never fails: anything
/// unrecognized is returned unchanged.
pub fn for_display(full: &str) -> String {
    if full.starts_with(CHANNEL_MARKER) || full.starts_with(DIRECT_MARKER) {
        return full.to_string();
    }
    if let Some(name) = full.strip_prefix(CHANNEL_PREFIX) {
        return format!("{CHANNEL_MARKER}{name}");
    }
    if let Some(name) = full.strip_prefix(DIRECT_PREFIX) {
        return format!("{DIRECT_MARKER}{name}");
    }
    full.to_string()
}

/// A validated, fully-qualified descriptor tagged with its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Descriptor {
    /// A gossip channel (`#name`).
    Channel(String),
    /// A direct-message target (`@name`).
    Direct(String),
}

impl Descriptor {
    /// Expand and classify a short or full descriptor.
    pub fn parse(input: &str) -> Result<Self> {
        let full = expand(input.trim())?;
        Self::classify(full)
    }

    /// Shorthand for a channel descriptor from a bare name (`general`).
    pub fn channel(name: &str) -> Result<Self> {
        Self::parse(&format!("{CHANNEL_MARKER}{name}"))
    }

    fn classify(full: String) -> Result<Self> {
        if full.len() > CHANNEL_PREFIX.len() && full.starts_with(CHANNEL_PREFIX) {
            Ok(Descriptor::Channel(full))
        } else if full.len() > DIRECT_PREFIX.len() && full.starts_with(DIRECT_PREFIX) {
            Ok(Descriptor::Direct(full))
        } else {
            Err(ChannelError::InvalidDescriptor(full))
        }
    }

    /// The fully-qualified wire form. Also used as topic name and protection tag.
    pub fn as_str(&self) -> &str {
        match self {
            Descriptor::Channel(full) | Descriptor::Direct(full) => full,
        }
    }

    /// The name without namespace or marker.
    pub fn name(&self) -> &str {
        match self {
            Descriptor::Channel(full) => &full[CHANNEL_PREFIX.len()..],
            Descriptor::Direct(full) => &full[DIRECT_PREFIX.len()..],
        }
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, Descriptor::Channel(_))
    }
}

impl Display for Descriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&for_display(self.as_str()))
    }
}

impl FromStr for Descriptor {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_channel_and_direct() {
        assert_eq!(
            expand("#general").unwrap(),
            "/infinitychat/v0.1/channel/general"
        );
        assert_eq!(expand("@alice").unwrap(), "/infinity/v0.1/dm/alice");
    }

    #[test]
    fn test_expand_is_idempotent() {
        for short in ["#general", "@alice", "#a/b", "/custom/root"] {
            let once = expand(short).unwrap();
            assert_eq!(expand(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_display_inverts_expand() {
        for short in ["#general", "@alice", "#rust-lang"] {
            assert_eq!(for_display(&expand(short).unwrap()), short);
        }
    }

    #[test]
    fn test_expand_rejects_unknown_marker() {
        assert!(matches!(
            expand("general"),
            Err(ChannelError::InvalidDescriptor(_))
        ));
        assert!(expand("").is_err());
        assert!(expand("#").is_err());
        assert!(expand("@").is_err());
    }

    #[test]
    fn test_for_display_passes_through_unknown() {
        assert_eq!(for_display("#general"), "#general");
        assert_eq!(for_display("/other/proto/x"), "/other/proto/x");
        assert_eq!(for_display("plain"), "plain");
    }

    #[test]
    fn test_parse_classifies_namespace() {
        let chan = Descriptor::parse("#general").unwrap();
        assert!(chan.is_channel());
        assert_eq!(chan.name(), "general");
        assert_eq!(chan.to_string(), "#general");

        let dm = Descriptor::parse("/infinity/v0.1/dm/alice").unwrap();
        assert_eq!(dm, Descriptor::Direct("/infinity/v0.1/dm/alice".into()));
        assert_eq!(dm.to_string(), "@alice");
    }

    #[test]
    fn test_parse_short_and_full_are_equal() {
        let short = Descriptor::parse("#general").unwrap();
        let full = Descriptor::parse("/infinitychat/v0.1/channel/general").unwrap();
        assert_eq!(short, full);
        assert_eq!(Descriptor::channel("general").unwrap(), short);
    }

    #[test]
    fn test_parse_rejects_unknown_namespace() {
        assert!(matches!(
            Descriptor::parse("/ipfs/kad/1.0.0"),
            Err(ChannelError::InvalidDescriptor(_))
        ));
        assert!(Descriptor::parse(CHANNEL_PREFIX).is_err());
        assert!("nope".parse::<Descriptor>().is_err());
    }
}
