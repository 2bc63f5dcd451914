//! Periodic membership maintenance.
//!
//! Two tickers run for the lifetime of a started node:
//! - rejoin: rediscover channel members, dial them and protect the connections
//! - announce: refresh our own membership advertisement before it expires

use crate::PeerId;
use crate::descriptor::Descriptor;
use crate::error::{ChannelError, Result};
use crate::membership::ProtectOutcome;
use crate::node::ChannelNode;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

impl ChannelNode {
    /// Advertise our membership in `descriptor` for the configured TTL.
    pub async fn announce_channel(&self, descriptor: &Descriptor) -> Result<()> {
        let _busy = self.inner.tasks.token();
        self.ensure_running()?;
        let ttl = self.inner.config.advertise_ttl;

        self.until_shutdown(self.inner.overlay.advertise(descriptor.as_str(), ttl))
            .await?
            .map_err(|source| ChannelError::AnnounceFailed {
                descriptor: descriptor.to_string(),
                source,
            })?;

        debug!("Announced {} for {:?}", descriptor, ttl);
        Ok(())
    }

    /// Find members of `descriptor`, dial them and protect the connections.
    ///
    /// Discovery and dialing together are bounded by the rejoin timeout;
    /// connections made before the deadline are kept. Returns how many
    /// members were connected this cycle, or `RejoinFailed` if none were.
    pub async fn rejoin_channel(&self, descriptor: &Descriptor) -> Result<usize> {
        let _busy = self.inner.tasks.token();
        self.ensure_running()?;
        let config = &self.inner.config;
        let local_id = self.local_id();
        let mut connected: Vec<PeerId> = Vec::new();

        let discovery = async {
            let mut found = self
                .inner
                .overlay
                .find_peers(descriptor.as_str(), config.discovery_limit)
                .await
                .map_err(|source| ChannelError::DiscoveryFailed {
                    descriptor: descriptor.to_string(),
                    source,
                })?;

            while let Some(peer) = found.next().await {
                if peer.id == local_id {
                    continue;
                }
                match self.dial(&peer).await {
                    Ok(()) => {
                        connected.push(peer.id);
                        self.protect_member(descriptor, peer.id).await;
                    }
                    Err(ChannelError::Shutdown) => return Err(ChannelError::Shutdown),
                    Err(e) => debug!("Rejoin of {}: {}", descriptor, e),
                }
            }
            Ok::<(), ChannelError>(())
        };

        let discovery = tokio::time::timeout(config.rejoin_timeout, discovery);
        match self.until_shutdown(discovery).await? {
            Ok(result) => result?,
            Err(_) => debug!(
                "Rejoin of {} timed out after {:?}",
                descriptor, config.rejoin_timeout
            ),
        }

        if connected.is_empty() {
            return Err(ChannelError::RejoinFailed(descriptor.to_string()));
        }

        if self.is_joined(descriptor) {
            let members = self.connected_members(descriptor).await.len();
            if self.inner.state.update_member_count(descriptor, members) {
                info!("Connected to {} peers on {}", members, descriptor);
            } else {
                debug!("Still connected to {} peers on {}", members, descriptor);
            }
        }
        Ok(connected.len())
    }

    /// Tag `peer` as a protected member of `descriptor`, within the per-channel cap.
    async fn protect_member(&self, descriptor: &Descriptor, peer: PeerId) {
        // Serialized with leave, which removes the tags of the same record
        let transition = self.until_shutdown(self.inner.state.transition(descriptor));
        let Ok(_transition) = transition.await else {
            return;
        };
        let cap = self.inner.config.max_protected_peers;
        match self.inner.state.protect(descriptor, peer, cap) {
            ProtectOutcome::Added => {
                self.inner.overlay.protect(peer, descriptor.as_str());
                debug!("Protected {} for {}", peer, descriptor);
            }
            ProtectOutcome::CapReached => {
                debug!("{} already protects {} peers", descriptor, cap);
            }
            ProtectOutcome::AlreadyProtected | ProtectOutcome::NotJoined => {}
        }
    }

    /// Rejoin every joined channel, logging failures.
    pub async fn rejoin_all(&self) {
        for descriptor in self.joined_channels() {
            match self.rejoin_channel(&descriptor).await {
                Ok(_) => {}
                Err(ChannelError::Shutdown) => return,
                Err(e) => warn!("{}", e),
            }
        }
    }

    /// Announce every joined channel, logging failures.
    pub async fn announce_all(&self) {
        for descriptor in self.joined_channels() {
            match self.announce_channel(&descriptor).await {
                Ok(()) => {}
                Err(ChannelError::Shutdown) => return,
                Err(e) => warn!("{}", e),
            }
        }
    }

    pub(crate) fn spawn_tickers(&self) {
        let rejoin = self.clone();
        self.inner.tasks.spawn(async move {
            let interval = rejoin.inner.config.rejoin_interval;
            rejoin.run_ticker("rejoin", interval, Tick::Rejoin).await;
        });

        let announce = self.clone();
        self.inner.tasks.spawn(async move {
            let interval = announce.inner.config.announce_interval;
            announce.run_ticker("announce", interval, Tick::Announce).await;
        });
    }

    async fn run_ticker(&self, name: &str, period: Duration, tick: Tick) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; joins already refresh on their own
        ticker.tick().await;
        debug!("Started {} ticker every {:?}", name, period);

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => match tick {
                    Tick::Rejoin => self.rejoin_all().await,
                    Tick::Announce => self.announce_all().await,
                },
            }
        }
        debug!("Stopped {} ticker", name);
    }
}

#[derive(Debug, Clone, Copy)]
enum Tick {
    Rejoin,
    Announce,
}
