//! Message pump: drains one subscription into the node's message stream.

use crate::PeerId;
use crate::descriptor::Descriptor;
use crate::overlay::{OverlayError, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pause after a failed read before pulling again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A chat message received on a joined channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: PeerId,
    pub channel: Descriptor,
    pub text: String,
}

/// Pull messages from `subscription` until it is cancelled.
///
/// Messages keep the overlay's delivery order. A full `outbound` queue blocks
/// the pump rather than dropping messages.
pub(crate) async fn run(
    channel: Descriptor,
    subscription: Arc<dyn Subscription>,
    local_id: PeerId,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    debug!("Message pump for {} started", channel);

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = subscription.next() => result,
        };

        let delivery = match result {
            Ok(delivery) => delivery,
            Err(OverlayError::SubscriptionCancelled) => break,
            Err(e) => {
                warn!("Pull for {} failed: {}", channel, e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                }
            }
        };

        // Gossip delivers our own publications back to us
        if delivery.from == local_id {
            continue;
        }

        let message = Message {
            sender: delivery.from,
            channel: channel.clone(),
            text: String::from_utf8_lossy(&delivery.data).into_owned(),
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = outbound.send(message) => {
                if sent.is_err() {
                    debug!("Message stream closed, stopping pump for {}", channel);
                    break;
                }
            }
        }
    }

    debug!("Message pump for {} stopped", channel);
}
