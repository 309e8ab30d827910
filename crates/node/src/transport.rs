//! Peer transport.
//!
//! Two peer sets are kept: outgoing peers this node picked from the
//! ledger node list, and incoming peers that connected to us. A broadcast
//! goes to both, fire-and-forget: every send runs in its own task and a
//! failing peer never holds up the others.
//!
//! ## Wire
//!
//! ```text
//! POST http://{peer}/peer/message      body: PeerMessage (JSON)
//!      x-skyfleet-peer: {our endpoint}
//! GET  http://{peer}/syncthing/deviceid → ApiEnvelope{data.message = id}
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info, warn};

use skyfleet_proto::{ApiEnvelope, PeerMessage};

use crate::ledger::LedgerDaemon;
use crate::worker::CommandWorker;

/// Header carrying the sender's endpoint.
pub const PEER_HEADER: &str = "x-skyfleet-peer";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request to {peer} failed: {reason}")]
    Request { peer: String, reason: String },

    #[error("{peer} answered {status}")]
    Status { peer: String, status: u16 },

    #[error("no connected peers")]
    NoPeers,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Queue `message` to every connected peer. Returns the number of peers
    /// it was handed to.
    async fn broadcast(&self, message: &PeerMessage) -> Result<usize, TransportError>;

    async fn send_to(&self, peer: &str, message: &PeerMessage) -> Result<(), TransportError>;

    fn connected_peers(&self) -> usize;

    /// Union of both peer sets, sorted.
    fn peers(&self) -> Vec<String>;

    /// Storage daemon device id advertised by `peer`.
    async fn storage_device_id(&self, peer: &str) -> Result<Option<String>, TransportError>;

    /// A peer reached us; transports that track incoming peers record it.
    fn note_incoming(&self, _peer: &str) {}
}

// ════════════════════════════════════════════════════════════════════════════
// HTTP TRANSPORT
// ════════════════════════════════════════════════════════════════════════════

pub struct HttpPeerTransport {
    client: reqwest::Client,
    self_endpoint: String,
    max_outgoing: usize,
    outgoing: RwLock<BTreeSet<String>>,
    incoming: RwLock<BTreeSet<String>>,
}

impl HttpPeerTransport {
    pub fn new(self_endpoint: impl Into<String>, max_outgoing: usize, timeout: Duration) -> Result<Self, TransportError> {
        let self_endpoint = self_endpoint.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request { peer: self_endpoint.clone(), reason: e.to_string() })?;
        Ok(Self {
            client,
            self_endpoint,
            max_outgoing,
            outgoing: RwLock::new(BTreeSet::new()),
            incoming: RwLock::new(BTreeSet::new()),
        })
    }

    pub fn set_outgoing(&self, peers: impl IntoIterator<Item = String>) {
        let mut out = self.outgoing.write();
        out.clear();
        out.extend(peers.into_iter().filter(|p| *p != self.self_endpoint).take(self.max_outgoing));
    }

    pub fn register_incoming(&self, peer: &str) {
        if peer != self.self_endpoint && self.incoming.write().insert(peer.to_string()) {
            debug!(peer, "incoming peer registered");
        }
    }

    pub fn drop_incoming(&self, peer: &str) -> bool {
        self.incoming.write().remove(peer)
    }

    /// Re-pick outgoing peers from the ledger node list.
    pub async fn refresh_peers(&self, ledger: &dyn LedgerDaemon, worker: &CommandWorker) -> Result<usize, crate::error::OrchestratorError> {
        let nodes = ledger.node_list().await?;
        let index = worker.index_nodes(nodes).await?;
        let mut endpoints: Vec<String> = index.by_endpoint.into_keys().filter(|e| *e != self.self_endpoint).collect();
        endpoints.shuffle(&mut rand::thread_rng());
        self.set_outgoing(endpoints);
        let count = self.outgoing.read().len();
        info!(outgoing = count, "peer set refreshed");
        Ok(count)
    }

    async fn post(client: reqwest::Client, from: String, peer: String, message: PeerMessage) -> Result<(), TransportError> {
        let url = format!("http://{}/peer/message", peer);
        let resp = client
            .post(url)
            .header(PEER_HEADER, from)
            .json(&message)
            .send()
            .await
            .map_err(|e| TransportError::Request { peer: peer.clone(), reason: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(TransportError::Status { peer, status: resp.status().as_u16() });
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn broadcast(&self, message: &PeerMessage) -> Result<usize, TransportError> {
        let peers = self.peers();
        if peers.is_empty() {
            return Err(TransportError::NoPeers);
        }
        for peer in &peers {
            let client = self.client.clone();
            let from = self.self_endpoint.clone();
            let peer = peer.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::post(client, from, peer, message).await {
                    debug!(error = %e, "broadcast send failed");
                }
            });
        }
        debug!(kind = message.kind(), peers = peers.len(), "broadcast queued");
        Ok(peers.len())
    }

    async fn send_to(&self, peer: &str, message: &PeerMessage) -> Result<(), TransportError> {
        Self::post(self.client.clone(), self.self_endpoint.clone(), peer.to_string(), message.clone()).await
    }

    fn connected_peers(&self) -> usize {
        self.peers().len()
    }

    fn peers(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self.outgoing.read().clone();
        all.extend(self.incoming.read().iter().cloned());
        all.into_iter().collect()
    }

    async fn storage_device_id(&self, peer: &str) -> Result<Option<String>, TransportError> {
        let url = format!("http://{}/syncthing/deviceid", peer);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Request { peer: peer.to_string(), reason: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(TransportError::Status { peer: peer.to_string(), status: resp.status().as_u16() });
        }
        let envelope: ApiEnvelope = resp
            .json()
            .await
            .map_err(|e| TransportError::Request { peer: peer.to_string(), reason: e.to_string() })?;
        if !envelope.is_success() || envelope.data.message.is_empty() {
            warn!(peer, "peer has no storage device id");
            return Ok(None);
        }
        Ok(Some(envelope.data.message))
    }

    fn note_incoming(&self, peer: &str) {
        self.register_incoming(peer);
    }
}
