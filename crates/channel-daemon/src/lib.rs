//! channel-daemon library: relay hub, remote overlay client and console.
//!
//! Exposed as a library so integration tests can run a hub and nodes in-process.

pub mod config;
pub mod console;
pub mod hub;
pub mod identity;
pub mod message;
pub mod remote;

pub use config::{ConfigError, DaemonConfig};
pub use console::{Command, Console, Output};
pub use hub::Hub;
pub use message::{Frame, HandshakeMessage, MAX_FRAME_SIZE};
pub use remote::RemoteOverlay;
