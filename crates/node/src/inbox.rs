//! Dispatch of incoming peer messages.
//!
//! Location claims (`AppRunning`, `AppInstalling`, `AppRemoved`) are only
//! taken from the node they describe: the claimed host must equal the
//! sender's host, and no peer speaks for this node's own host.

use std::sync::Arc;

use tracing::{debug, warn};

use skyfleet_proto::{host_of, PeerMessage};

use crate::error::Result;
use crate::registry::{ReceiveOutcome, Registry, RegistryError};
use crate::transport::{PeerTransport, TransportError};

/// Hashes answered per `AppRequest`.
pub const MAX_REQUESTED_HASHES: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    Accepted(ReceiveOutcome),
    Rejected(String),
    Locations { stored: usize },
    Removed(bool),
    Answered { count: usize },
}

pub struct PeerInbox {
    registry: Arc<Registry>,
    transport: Arc<dyn PeerTransport>,
    node_host: String,
}

impl PeerInbox {
    pub fn new(registry: Arc<Registry>, transport: Arc<dyn PeerTransport>, node_ip: &str) -> Self {
        Self { registry, transport, node_host: host_of(node_ip).to_string() }
    }

    /// Why `from` may not speak for the node at `ip`, if it may not.
    fn foreign_claim(&self, from: &str, ip: &str) -> Option<String> {
        let claimed = host_of(ip);
        if claimed == self.node_host {
            return Some(format!("peer {} may not speak for this node", from));
        }
        if claimed != host_of(from) {
            return Some(format!("location of {} sent by {}", claimed, host_of(from)));
        }
        None
    }

    fn reject_claim(&self, from: &str, kind: &str, reason: String) -> Result<InboxOutcome> {
        warn!(peer = from, kind, reason = %reason, "location claim rejected");
        Ok(InboxOutcome::Rejected(reason))
    }

    pub async fn handle(&self, from: &str, message: PeerMessage, now_ms: u64) -> Result<InboxOutcome> {
        debug!(peer = from, kind = message.kind(), "peer message");
        match message {
            PeerMessage::AppMessage(msg) => match self.registry.receive_message(msg.clone(), now_ms).await {
                Ok(outcome) => {
                    if outcome.should_regossip() {
                        self.gossip(&PeerMessage::AppMessage(msg)).await;
                    }
                    Ok(InboxOutcome::Accepted(outcome))
                }
                Err(e @ RegistryError::Store(_)) => Err(e.into()),
                Err(e) => {
                    warn!(peer = from, hash = %msg.hash, error = %e, "app message rejected");
                    Ok(InboxOutcome::Rejected(e.to_string()))
                }
            },
            PeerMessage::AppRunning(locations) => {
                if let Some(reason) = locations.iter().find_map(|l| self.foreign_claim(from, &l.ip)) {
                    return self.reject_claim(from, "app_running", reason);
                }
                let mut stored = 0;
                for location in locations {
                    if self.registry.store_location(location, now_ms).await? {
                        stored += 1;
                    }
                }
                Ok(InboxOutcome::Locations { stored })
            }
            PeerMessage::AppInstalling(marker) => {
                if let Some(reason) = self.foreign_claim(from, &marker.ip) {
                    return self.reject_claim(from, "app_installing", reason);
                }
                let stored = self.registry.store_installing(marker, now_ms).await?;
                Ok(InboxOutcome::Locations { stored: usize::from(stored) })
            }
            PeerMessage::AppRemoved { name, ip } => {
                if let Some(reason) = self.foreign_claim(from, &ip) {
                    return self.reject_claim(from, "app_removed", reason);
                }
                Ok(InboxOutcome::Removed(self.registry.remove_location(&name, &ip).await?))
            }
            PeerMessage::AppRequest { mut hashes } => {
                hashes.truncate(MAX_REQUESTED_HASHES);
                let messages = self.registry.messages_for(&hashes).await?;
                let mut count = 0;
                for msg in messages {
                    match self.transport.send_to(from, &PeerMessage::AppMessage(msg)).await {
                        Ok(()) => count += 1,
                        Err(e) => {
                            warn!(peer = from, error = %e, "answering hash request failed");
                            break;
                        }
                    }
                }
                Ok(InboxOutcome::Answered { count })
            }
        }
    }

    async fn gossip(&self, message: &PeerMessage) {
        match self.transport.broadcast(message).await {
            Ok(_) | Err(TransportError::NoPeers) => {}
            Err(e) => warn!(error = %e, "re-gossip failed"),
        }
    }
}
