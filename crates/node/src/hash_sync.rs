//! Hash-sync: fetch messages behind paid hashes we have no message for.
//!
//! ## Pass
//!
//! ```text
//! synced? ── no ──▶ Skipped(NotSynced)
//! peers >= min? ── no ──▶ Skipped(NotEnoughPeers)
//! missing / total >= threshold ──▶ Deferred   (node is still rebuilding)
//! attempts >= max ──▶ message_not_found
//! rest ──▶ batches ──▶ AppRequest to peers, round robin, one pending
//!                      request per peer origin
//! ```
//!
//! Answers come back as ordinary `AppMessage` gossip and resolve the hash
//! through [`Registry::receive_message`](crate::registry::Registry::receive_message).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use skyfleet_common::config::HashSyncSection;
use skyfleet_proto::{LedgerHashRecord, PeerMessage};

use crate::error::Result;
use crate::outbound::OutboundRequests;
use crate::state::OrchestratorState;
use crate::store::AppDatabase;
use crate::transport::PeerTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotSynced,
    NotEnoughPeers { connected: usize, required: usize },
    /// Every peer already has a request pending.
    PeersBackingOff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashSyncOutcome {
    Skipped(SkipReason),
    Deferred { missing: usize, total: usize },
    Requested { count: usize, batches: usize, given_up: usize },
    Nothing,
}

pub struct HashSync {
    db: Arc<dyn AppDatabase>,
    state: Arc<OrchestratorState>,
    transport: Arc<dyn PeerTransport>,
    outbound: Arc<OutboundRequests>,
    config: HashSyncSection,
    cursor: AtomicUsize,
}

impl HashSync {
    pub fn new(
        db: Arc<dyn AppDatabase>,
        state: Arc<OrchestratorState>,
        transport: Arc<dyn PeerTransport>,
        outbound: Arc<OutboundRequests>,
        config: HashSyncSection,
    ) -> Self {
        Self { db, state, transport, outbound, config, cursor: AtomicUsize::new(0) }
    }

    /// Operator-triggered pass. Same gates as the timer.
    pub async fn trigger(&self) -> Result<HashSyncOutcome> {
        info!("manual hash sync requested");
        self.run_once().await
    }

    pub async fn run_once(&self) -> Result<HashSyncOutcome> {
        if !self.state.status().synced {
            debug!("ledger not synced, hash sync skipped");
            return Ok(HashSyncOutcome::Skipped(SkipReason::NotSynced));
        }
        let connected = self.transport.connected_peers();
        if connected < self.config.min_peers {
            debug!(connected, required = self.config.min_peers, "not enough peers for hash sync");
            return Ok(HashSyncOutcome::Skipped(SkipReason::NotEnoughPeers {
                connected,
                required: self.config.min_peers,
            }));
        }

        let records = self.db.hash_records().await?;
        let total = records.len();
        let missing: Vec<LedgerHashRecord> = records.into_iter().filter(|r| r.is_missing()).collect();
        if missing.is_empty() {
            return Ok(HashSyncOutcome::Nothing);
        }
        let ratio = missing.len() as f64 / total as f64;
        if ratio >= self.config.missing_ratio_threshold {
            info!(missing = missing.len(), total, ratio, "most hashes missing, deferring to full resync");
            return Ok(HashSyncOutcome::Deferred { missing: missing.len(), total });
        }

        let mut given_up = 0;
        let mut requestable = Vec::with_capacity(missing.len());
        for mut record in missing {
            if record.request_attempts >= self.config.max_attempts {
                warn!(hash = %record.hash, attempts = record.request_attempts, "no peer has the message, giving up");
                record.message_not_found = true;
                self.db.upsert_hash(record).await?;
                given_up += 1;
            } else {
                requestable.push(record);
            }
        }

        let peers = self.transport.peers();
        let mut count = 0;
        let mut batches = 0;
        for batch in requestable.chunks(self.config.batch_size.max(1)) {
            let Some(peer) = self.next_peer(&peers) else {
                debug!("every peer has a pending request");
                break;
            };
            let hashes: Vec<String> = batch.iter().map(|r| r.hash.clone()).collect();
            if let Err(e) = self.transport.send_to(&peer, &PeerMessage::AppRequest { hashes }).await {
                warn!(peer = %peer, error = %e, "hash request failed");
                continue;
            }
            for record in batch {
                let mut record = record.clone();
                record.request_attempts += 1;
                self.db.upsert_hash(record).await?;
            }
            count += batch.len();
            batches += 1;
        }

        if count == 0 && given_up == 0 {
            return Ok(HashSyncOutcome::Skipped(SkipReason::PeersBackingOff));
        }
        info!(count, batches, given_up, "missing hashes requested");
        Ok(HashSyncOutcome::Requested { count, batches, given_up })
    }

    /// Next peer in rotation without a pending request.
    fn next_peer(&self, peers: &[String]) -> Option<String> {
        if peers.is_empty() {
            return None;
        }
        for _ in 0..peers.len() {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % peers.len();
            let peer = &peers[idx];
            match self.outbound.record(peer) {
                Ok(true) => return Some(peer.clone()),
                Ok(false) => continue,
                Err(e) => debug!(peer = %peer, error = %e, "peer address unusable"),
            }
        }
        None
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use skyfleet_common::config::DosSection;
    use skyfleet_proto::Tier;

    use crate::mock::MockTransport;
    use crate::state::NodeStatus;
    use crate::store::MemoryDatabase;

    struct Fixture {
        db: Arc<MemoryDatabase>,
        state: Arc<OrchestratorState>,
        transport: Arc<MockTransport>,
        sync: HashSync,
    }

    fn fixture(peers: usize, config: HashSyncSection) -> Fixture {
        let db = Arc::new(MemoryDatabase::new());
        let state = Arc::new(OrchestratorState::new("10.0.0.1", Tier::Cumulus, DosSection::default()));
        state.set_status(NodeStatus { synced: true, confirmed: true, height: 1_000, ..NodeStatus::default() });
        let transport = Arc::new(MockTransport::with_peers(peers));
        let outbound = Arc::new(OutboundRequests::new(Duration::from_secs(60)));
        let sync = HashSync::new(db.clone(), state.clone(), transport.clone(), outbound, config);
        Fixture { db, state, transport, sync }
    }

    fn config(min_peers: usize, batch_size: usize) -> HashSyncSection {
        HashSyncSection { min_peers, batch_size, max_attempts: 3, ..HashSyncSection::default() }
    }

    async fn seed(db: &MemoryDatabase, resolved: usize, missing: usize) {
        for i in 0..resolved {
            let mut r = LedgerHashRecord::new(format!("r{}", i), "tx", i as u64, 1.0);
            r.message = true;
            db.upsert_hash(r).await.expect("seed");
        }
        for i in 0..missing {
            db.upsert_hash(LedgerHashRecord::new(format!("m{}", i), "tx", 100 + i as u64, 1.0)).await.expect("seed");
        }
    }

    // ════════════════════════════════════════════════════════════════════════
    // GATES
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_skips_when_not_synced_or_few_peers() {
        let f = fixture(2, config(3, 10));
        assert_eq!(
            f.sync.run_once().await.expect("run"),
            HashSyncOutcome::Skipped(SkipReason::NotEnoughPeers { connected: 2, required: 3 })
        );
        f.state.set_status(NodeStatus::default());
        assert_eq!(f.sync.trigger().await.expect("run"), HashSyncOutcome::Skipped(SkipReason::NotSynced));
    }

    #[tokio::test]
    async fn test_defers_when_almost_everything_missing() {
        let f = fixture(3, config(1, 10));
        seed(&f.db, 1, 19).await;
        assert_eq!(f.sync.run_once().await.expect("run"), HashSyncOutcome::Deferred { missing: 19, total: 20 });
        assert!(f.transport.direct().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_missing() {
        let f = fixture(3, config(1, 10));
        seed(&f.db, 5, 0).await;
        assert_eq!(f.sync.run_once().await.expect("run"), HashSyncOutcome::Nothing);
    }

    // ════════════════════════════════════════════════════════════════════════
    // REQUESTS
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_requests_in_batches_round_robin() {
        let f = fixture(2, config(1, 2));
        seed(&f.db, 10, 3).await;
        let outcome = f.sync.run_once().await.expect("run");
        assert_eq!(outcome, HashSyncOutcome::Requested { count: 3, batches: 2, given_up: 0 });

        let sent = f.transport.direct();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].0, sent[1].0);
        let attempts = f.db.hash_record("m0").await.expect("q").expect("record").request_attempts;
        assert_eq!(attempts, 1);

        // Both peers still have a pending request
        assert_eq!(f.sync.run_once().await.expect("run"), HashSyncOutcome::Skipped(SkipReason::PeersBackingOff));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let f = fixture(1, config(1, 10));
        seed(&f.db, 10, 1).await;
        let mut r = f.db.hash_record("m0").await.expect("q").expect("record");
        r.request_attempts = 3;
        f.db.upsert_hash(r).await.expect("upsert");

        let outcome = f.sync.run_once().await.expect("run");
        assert_eq!(outcome, HashSyncOutcome::Requested { count: 0, batches: 0, given_up: 1 });
        assert!(f.db.hash_record("m0").await.expect("q").expect("record").message_not_found);
    }
}
