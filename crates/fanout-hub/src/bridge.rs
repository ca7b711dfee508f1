use crate::hub::Hub;
use fanout_bus::{Bus, BusSubscription};
use fanout_protocol::Envelope;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A Hub's cluster-mode state: which bus and channel it publishes to and
/// reads from. Presence of this (vs. `None`) is what distinguishes local
/// mode from cluster mode — see `Hub::enable_cluster`.
pub(crate) struct BridgeState {
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) channel: String,
}

/// Handle to a Hub's cluster-mode subscription, returned by
/// `Hub::enable_cluster`. Its only use is `shutdown`, which cancels the
/// subscriber task — equivalent to cancelling the `CancellationToken` passed
/// into `enable_cluster` directly, kept here for callers who'd rather hold
/// the handle than their own token.
pub struct ClusterBridge {
    channel: String,
    cancel: CancellationToken,
}

impl ClusterBridge {
    pub(crate) fn new(channel: String, cancel: CancellationToken) -> Self {
        Self { channel, cancel }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Cancel the subscriber task. The Hub stays in cluster mode (its
    /// `publish` calls still go to the bus) but stops receiving deliveries
    /// from it.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Runs until `cancel` fires or the subscription stream ends. For each
/// message: parse as an Envelope, on parse failure log and continue, on
/// success call `hub.deliver_local` — the same call path a purely local
/// `Hub::broadcast`/`send_to_recipient` would take, so cluster-delivered
/// envelopes are indistinguishable from locally-originated ones once they
/// reach a Session.
pub(crate) async fn run_subscriber(
    mut subscription: BusSubscription,
    hub: Hub,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("cluster bridge subscriber shutting down");
                return;
            }
            message = subscription.next() => {
                match message {
                    Some(bytes) => handle_published(&hub, &bytes).await,
                    None => {
                        warn!("cluster bridge subscription closed unexpectedly");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_published(hub: &Hub, bytes: &[u8]) {
    match Envelope::parse(bytes) {
        Ok(envelope) => {
            hub.deliver_local(&envelope).await;
        }
        Err(err) => {
            error!(error = %err, "dropping malformed envelope from bus");
        }
    }
}
