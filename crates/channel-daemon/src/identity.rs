//! Persistent node identity.
//!
//! The peer ID is stored as 16 hex characters in a small file and generated
//! the first time the node starts.

use anyhow::{Context, Result};
use channel_core::PeerId;
use std::fs;
use std::path::Path;
use tracing::info;

/// Load the peer ID stored at `path`, generating and saving one if missing.
pub fn load_or_generate(path: &Path) -> Result<PeerId> {
    if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity file {}", path.display()))?;
        let peer_id = contents
            .parse()
            .with_context(|| format!("Invalid identity file {}", path.display()))?;
        return Ok(peer_id);
    }

    let peer_id = PeerId::generate();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, format!("{peer_id}\n"))
        .with_context(|| format!("Failed to write identity file {}", path.display()))?;
    info!("Generated new identity {} at {}", peer_id, path.display());
    Ok(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generates_then_reuses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reads_existing_hex() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, "00000000000000ff\n").unwrap();

        assert_eq!(load_or_generate(&path).unwrap(), PeerId::from(0xff));
    }

    #[test]
    fn test_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, "not a peer id").unwrap();

        assert!(load_or_generate(&path).is_err());
    }
}
