//! Global application registry.
//!
//! ## Message Flow
//!
//! ```text
//! gossip ──▶ receive_message ──verify──▶ appsTemporaryMessages (TTL)
//!                                              │
//! ledger ──▶ confirm_hash(record) ─price/owner─┤
//!                                              ▼
//!                         appsMessages + global appsInformation
//! ```
//!
//! Register messages claim a free (or expired) name and pay the full
//! price. Update messages come from the registered owner, never lower the
//! schema version and pay the price minus the unexpired share of the
//! previous payment. Either way `registration_height` becomes the height
//! of the paying transaction, so an update renews the validity window.
//!
//! The location book lives here too: which node hosts which app, and
//! which node is installing which app.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use skyfleet_common::config::{LocationSection, RegistrySection};
use skyfleet_common::{CryptoError, MessageVerifier, PriceError};
use skyfleet_proto::{
    host_of, ApplicationLocation, ApplicationMessage, ApplicationSpecification, InstallingLocation,
    LedgerHashRecord, MessageKind, TemporaryMessage, LATEST_SPEC_VERSION,
};

use crate::store::{AppDatabase, StoreError};

/// Paid values are compared with this slack.
const PRICE_EPSILON: f64 = 1e-8;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("message verification failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("price lookup failed: {0}")]
    Price(#[from] PriceError),

    #[error("underpaid: required {required}, paid {paid}")]
    Underpaid { required: f64, paid: f64 },

    #[error("{signer} is not the owner of {name}")]
    NotOwner { name: String, signer: String },

    #[error("version downgrade from {current} to {proposed}")]
    VersionDowngrade { current: u32, proposed: u32 },

    #[error("application name {0} is already registered")]
    NameTaken(String),

    #[error("application {0} is not registered")]
    UnknownApp(String),

    #[error("malformed message: {0}")]
    Structure(String),
}

impl RegistryError {
    /// Everything except storage failures is a property of the message.
    pub fn is_validation(&self) -> bool {
        !matches!(self, RegistryError::Store(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Registered,
    Updated,
    AlreadyKnown,
    /// Paid hash without a local message yet; hash-sync will ask peers.
    MessageMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Duplicate,
    Temporary,
    Confirmed(ConfirmOutcome),
}

impl ReceiveOutcome {
    /// Only fresh temporary messages travel on.
    pub fn should_regossip(&self) -> bool {
        matches!(self, ReceiveOutcome::Temporary)
    }
}

pub struct Registry {
    db: Arc<dyn AppDatabase>,
    verifier: MessageVerifier,
    config: RegistrySection,
    location_ttl_ms: u64,
    installing_ttl_ms: u64,
}

impl Registry {
    pub fn new(db: Arc<dyn AppDatabase>, config: RegistrySection, locations: &LocationSection, installing_ttl_ms: u64) -> Self {
        Self {
            db,
            verifier: MessageVerifier::new(),
            config,
            location_ttl_ms: locations.ttl_ms,
            installing_ttl_ms,
        }
    }

    pub fn blocks_lasting(&self) -> u64 {
        self.config.blocks_lasting
    }

    pub fn database(&self) -> &Arc<dyn AppDatabase> {
        &self.db
    }

    // ════════════════════════════════════════════════════════════════════════
    // MESSAGES
    // ════════════════════════════════════════════════════════════════════════

    fn check_structure(message: &ApplicationMessage) -> Result<(), RegistryError> {
        let spec = &message.specification;
        if spec.name.is_empty() {
            return Err(RegistryError::Structure("empty application name".into()));
        }
        if message.version != spec.version {
            return Err(RegistryError::Structure(format!(
                "message version {} differs from specification version {}",
                message.version, spec.version
            )));
        }
        if spec.version == 0 || spec.version > LATEST_SPEC_VERSION {
            return Err(RegistryError::Structure(format!("unsupported version {}", spec.version)));
        }
        if message.kind == MessageKind::Register && !spec.owner.eq_ignore_ascii_case(&message.owner_address) {
            return Err(RegistryError::NotOwner { name: spec.name.clone(), signer: message.owner_address.clone() });
        }
        Ok(())
    }

    /// Accept a gossiped or locally submitted message.
    pub async fn receive_message(&self, message: ApplicationMessage, now_ms: u64) -> Result<ReceiveOutcome, RegistryError> {
        let hash = message.hash.to_ascii_lowercase();
        if self.db.message(&hash).await?.is_some() || self.db.temporary(&hash).await?.is_some() {
            return Ok(ReceiveOutcome::Duplicate);
        }
        self.verifier.verify(&message)?;
        Self::check_structure(&message)?;

        let mut message = message;
        message.hash = hash.clone();
        let name = message.specification.name.clone();
        let temporary = TemporaryMessage {
            message,
            received_at: now_ms,
            expire_at: now_ms.saturating_add(self.config.temporary_message_ttl_ms),
        };
        if !self.db.insert_temporary(temporary).await? {
            return Ok(ReceiveOutcome::Duplicate);
        }
        debug!(app = %name, %hash, "temporary message stored");

        // The payment may already be on the ledger (hash-sync answers)
        if let Some(record) = self.db.hash_record(&hash).await? {
            if record.is_missing() {
                let outcome = self.confirm_hash(&record, now_ms).await?;
                return Ok(ReceiveOutcome::Confirmed(outcome));
            }
        }
        Ok(ReceiveOutcome::Temporary)
    }

    async fn required_price(&self, message: &ApplicationMessage, height: u64) -> Result<f64, RegistryError> {
        let spec = &message.specification;
        let existing = self.db.global_app(&spec.name).await?;
        match message.kind {
            MessageKind::Register => {
                if let Some(existing) = existing {
                    if !self.is_expired(&existing, height) {
                        return Err(RegistryError::NameTaken(existing.name));
                    }
                }
                Ok(self.config.prices.app_price(spec, height, self.config.blocks_lasting)?)
            }
            MessageKind::Update => {
                let existing = match existing {
                    Some(e) if !self.is_expired(&e, height) => e,
                    _ => return Err(RegistryError::UnknownApp(spec.name.clone())),
                };
                let owner_matches = existing.owner.eq_ignore_ascii_case(&message.owner_address)
                    && existing.owner.eq_ignore_ascii_case(&spec.owner);
                if !owner_matches {
                    return Err(RegistryError::NotOwner { name: existing.name, signer: message.owner_address.clone() });
                }
                if spec.version < existing.version {
                    return Err(RegistryError::VersionDowngrade { current: existing.version, proposed: spec.version });
                }
                let previous_paid = self
                    .db
                    .app_messages(&spec.name)
                    .await?
                    .last()
                    .and_then(|m| m.value_paid)
                    .unwrap_or(0.0);
                Ok(self.config.prices.update_price(
                    spec,
                    height,
                    self.config.blocks_lasting,
                    previous_paid,
                    existing.expire_blocks(self.config.blocks_lasting),
                    height.saturating_sub(existing.registration_height),
                )?)
            }
        }
    }

    /// Resolve a paid hash reported by the ledger.
    pub async fn confirm_hash(&self, record: &LedgerHashRecord, now_ms: u64) -> Result<ConfirmOutcome, RegistryError> {
        let mut record = record.clone();
        if self.db.message(&record.hash).await?.is_some() {
            if !record.message {
                record.message = true;
                self.db.upsert_hash(record).await?;
            }
            return Ok(ConfirmOutcome::AlreadyKnown);
        }
        let temporary = match self.db.temporary(&record.hash).await? {
            Some(t) if !t.is_expired(now_ms) => t,
            _ => return Ok(ConfirmOutcome::MessageMissing),
        };
        let mut message = temporary.message;

        let checked = match self.required_price(&message, record.height).await {
            Ok(required) if record.value + PRICE_EPSILON < required => {
                Err(RegistryError::Underpaid { required, paid: record.value })
            }
            other => other,
        };
        if let Err(e) = checked {
            if e.is_validation() {
                warn!(app = %message.name(), hash = %record.hash, error = %e, "paid message rejected");
                record.message_not_found = true;
                self.db.upsert_hash(record).await?;
                self.db.remove_temporary(&message.hash).await?;
            }
            return Err(e);
        }

        message.height = Some(record.height);
        message.value_paid = Some(record.value);
        let mut spec = message.specification.clone();
        spec.registration_height = record.height;
        let outcome = match message.kind {
            MessageKind::Register => ConfirmOutcome::Registered,
            MessageKind::Update => ConfirmOutcome::Updated,
        };
        let hash = message.hash.clone();

        self.db.insert_message(message).await?;
        self.db.upsert_global_app(spec.clone()).await?;
        self.db.remove_temporary(&hash).await?;
        record.message = true;
        self.db.upsert_hash(record.clone()).await?;
        info!(app = %spec.name, %hash, height = record.height, ?outcome, "application message confirmed");
        Ok(outcome)
    }

    /// Messages behind `hashes` that this node can hand out, permanent or
    /// temporary.
    pub async fn messages_for(&self, hashes: &[String]) -> Result<Vec<ApplicationMessage>, RegistryError> {
        let mut out = Vec::new();
        for hash in hashes {
            let hash = hash.to_ascii_lowercase();
            if let Some(m) = self.db.message(&hash).await? {
                out.push(m);
            } else if let Some(t) = self.db.temporary(&hash).await? {
                out.push(t.message);
            }
        }
        Ok(out)
    }

    pub async fn latest_message(&self, name: &str) -> Result<Option<ApplicationMessage>, RegistryError> {
        Ok(self.db.app_messages(name).await?.pop())
    }

    pub async fn purge_temporary(&self, now_ms: u64) -> Result<usize, RegistryError> {
        Ok(self.db.purge_temporary(now_ms).await?)
    }

    // ════════════════════════════════════════════════════════════════════════
    // APPLICATIONS
    // ════════════════════════════════════════════════════════════════════════

    pub async fn application(&self, name: &str) -> Result<Option<ApplicationSpecification>, RegistryError> {
        Ok(self.db.global_app(name).await?)
    }

    pub async fn applications(&self) -> Result<Vec<ApplicationSpecification>, RegistryError> {
        Ok(self.db.global_apps().await?)
    }

    pub fn is_expired(&self, spec: &ApplicationSpecification, height: u64) -> bool {
        height.saturating_sub(spec.registration_height) > spec.expire_blocks(self.config.blocks_lasting)
    }

    pub async fn expired(&self, height: u64) -> Result<Vec<ApplicationSpecification>, RegistryError> {
        Ok(self.applications().await?.into_iter().filter(|s| self.is_expired(s, height)).collect())
    }

    // ════════════════════════════════════════════════════════════════════════
    // LOCATION BOOK
    // ════════════════════════════════════════════════════════════════════════

    pub fn new_location(&self, name: &str, hash: &str, ip: &str, now_ms: u64, running_since: Option<u64>) -> ApplicationLocation {
        ApplicationLocation {
            name: name.to_string(),
            hash: hash.to_string(),
            ip: ip.to_string(),
            broadcasted_at: now_ms,
            running_since,
            expire_at: now_ms.saturating_add(self.location_ttl_ms),
        }
    }

    pub fn new_installing(&self, name: &str, ip: &str, now_ms: u64) -> InstallingLocation {
        InstallingLocation {
            name: name.to_string(),
            ip: ip.to_string(),
            broadcasted_at: now_ms,
            expire_at: now_ms.saturating_add(self.installing_ttl_ms),
        }
    }

    /// Store a location heartbeat. Stale ones are dropped; a running
    /// location supersedes the node's installing marker.
    pub async fn store_location(&self, location: ApplicationLocation, now_ms: u64) -> Result<bool, RegistryError> {
        if !location.is_alive(now_ms) {
            return Ok(false);
        }
        self.db.remove_installing(&location.name, &location.ip).await?;
        self.db.upsert_location(location).await?;
        Ok(true)
    }

    pub async fn store_installing(&self, marker: InstallingLocation, now_ms: u64) -> Result<bool, RegistryError> {
        if !marker.is_alive(now_ms) {
            return Ok(false);
        }
        self.db.upsert_installing(marker).await?;
        Ok(true)
    }

    /// Forget `(name, ip)` in both books.
    pub async fn remove_location(&self, name: &str, ip: &str) -> Result<bool, RegistryError> {
        let location = self.db.remove_location(name, ip).await?;
        let installing = self.db.remove_installing(name, ip).await?;
        Ok(location || installing)
    }

    pub async fn remove_installing(&self, name: &str, ip: &str) -> Result<bool, RegistryError> {
        Ok(self.db.remove_installing(name, ip).await?)
    }

    /// Unexpired locations of `name`.
    pub async fn locations(&self, name: &str, now_ms: u64) -> Result<Vec<ApplicationLocation>, RegistryError> {
        Ok(self.db.locations(name).await?.into_iter().filter(|l| l.is_alive(now_ms)).collect())
    }

    pub async fn installing(&self, name: &str, now_ms: u64) -> Result<Vec<InstallingLocation>, RegistryError> {
        Ok(self.db.installing(name).await?.into_iter().filter(|l| l.is_alive(now_ms)).collect())
    }

    pub async fn location_on_node(&self, name: &str, ip: &str, now_ms: u64) -> Result<Option<ApplicationLocation>, RegistryError> {
        let host = host_of(ip);
        Ok(self.locations(name, now_ms).await?.into_iter().find(|l| l.host() == host))
    }

    pub async fn purge_expired_locations(&self, now_ms: u64) -> Result<usize, RegistryError> {
        let locations = self.db.purge_locations(now_ms).await?;
        let installing = self.db.purge_installing(now_ms).await?;
        Ok(locations + installing)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{sample_spec, signed_message, OTHER_SECRET, OWNER_SECRET};
    use crate::store::MemoryDatabase;
    use skyfleet_common::crypto::ethereum_address;

    fn registry() -> (Arc<MemoryDatabase>, Registry) {
        let db = Arc::new(MemoryDatabase::new());
        let registry = Registry::new(db.clone(), RegistrySection::default(), &LocationSection::default(), 600_000);
        (db, registry)
    }

    fn owner() -> String {
        ethereum_address(&OWNER_SECRET).expect("address")
    }

    // ════════════════════════════════════════════════════════════════════════
    // RECEIVE
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_receive_stores_temporary_once() {
        let (db, r) = registry();
        let msg = signed_message(&OWNER_SECRET, sample_spec("Shop", &owner()), MessageKind::Register, 1_000);
        let outcome = r.receive_message(msg.clone(), 5_000).await.expect("receive");
        assert_eq!(outcome, ReceiveOutcome::Temporary);
        assert!(outcome.should_regossip());
        assert!(db.temporary(&msg.hash).await.expect("q").is_some());

        let again = r.receive_message(msg, 6_000).await.expect("receive");
        assert_eq!(again, ReceiveOutcome::Duplicate);
        assert!(!again.should_regossip());
    }

    #[tokio::test]
    async fn test_receive_rejects_tampered_and_foreign_signer() {
        let (_, r) = registry();
        let mut msg = signed_message(&OWNER_SECRET, sample_spec("Shop", &owner()), MessageKind::Register, 1_000);
        msg.specification.instances = 50;
        let err = r.receive_message(msg, 5_000).await.expect_err("tampered");
        assert!(matches!(err, RegistryError::Crypto(CryptoError::HashMismatch { .. })));

        // Signed by another key while claiming the owner address
        let mut foreign = signed_message(&OTHER_SECRET, sample_spec("Shop", &owner()), MessageKind::Register, 1_000);
        foreign.owner_address = owner();
        foreign.hash = skyfleet_common::content_hash(&foreign).expect("hash");
        let err = r.receive_message(foreign, 5_000).await.expect_err("foreign");
        assert!(err.is_validation());
    }

    // ════════════════════════════════════════════════════════════════════════
    // CONFIRM
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_confirm_registers_when_paid() {
        let (db, r) = registry();
        let msg = signed_message(&OWNER_SECRET, sample_spec("Shop", &owner()), MessageKind::Register, 1_000);
        r.receive_message(msg.clone(), 5_000).await.expect("receive");

        // 0.5 cpu, 500 ram, 5 hdd at the first price entry: 2.25
        let record = LedgerHashRecord::new(msg.hash.clone(), "tx", 100, 2.25);
        assert_eq!(r.confirm_hash(&record, 6_000).await.expect("confirm"), ConfirmOutcome::Registered);

        let spec = r.application("shop").await.expect("q").expect("registered");
        assert_eq!(spec.registration_height, 100);
        assert!(db.temporary(&msg.hash).await.expect("q").is_none());
        assert!(db.hash_record(&msg.hash).await.expect("q").expect("record").message);
        assert_eq!(r.latest_message("Shop").await.expect("q").expect("msg").value_paid, Some(2.25));
        assert_eq!(r.confirm_hash(&record, 7_000).await.expect("again"), ConfirmOutcome::AlreadyKnown);
    }

    #[tokio::test]
    async fn test_confirm_underpaid_marks_not_found() {
        let (db, r) = registry();
        let msg = signed_message(&OWNER_SECRET, sample_spec("Shop", &owner()), MessageKind::Register, 1_000);
        r.receive_message(msg.clone(), 5_000).await.expect("receive");
        let record = LedgerHashRecord::new(msg.hash.clone(), "tx", 100, 1.0);
        db.upsert_hash(record.clone()).await.expect("upsert");

        let err = r.confirm_hash(&record, 6_000).await.expect_err("underpaid");
        assert!(matches!(err, RegistryError::Underpaid { .. }));
        assert!(db.hash_record(&msg.hash).await.expect("q").expect("record").message_not_found);
        assert!(r.application("Shop").await.expect("q").is_none());
    }

    #[tokio::test]
    async fn test_confirm_without_message_is_missing() {
        let (_, r) = registry();
        let record = LedgerHashRecord::new("ab".repeat(32), "tx", 100, 5.0);
        assert_eq!(r.confirm_hash(&record, 0).await.expect("confirm"), ConfirmOutcome::MessageMissing);
    }

    #[tokio::test]
    async fn test_late_message_confirms_paid_hash() {
        let (db, r) = registry();
        let msg = signed_message(&OWNER_SECRET, sample_spec("Shop", &owner()), MessageKind::Register, 1_000);
        db.upsert_hash(LedgerHashRecord::new(msg.hash.clone(), "tx", 100, 3.0)).await.expect("upsert");
        let outcome = r.receive_message(msg, 5_000).await.expect("receive");
        assert_eq!(outcome, ReceiveOutcome::Confirmed(ConfirmOutcome::Registered));
    }

    #[tokio::test]
    async fn test_update_rules() {
        let (_, r) = registry();
        let reg = signed_message(&OWNER_SECRET, sample_spec("Shop", &owner()), MessageKind::Register, 1_000);
        r.receive_message(reg.clone(), 5_000).await.expect("receive");
        r.confirm_hash(&LedgerHashRecord::new(reg.hash.clone(), "tx1", 100, 2.25), 5_000).await.expect("reg");

        // Not the owner
        let other = ethereum_address(&OTHER_SECRET).expect("address");
        let hijack = signed_message(&OTHER_SECRET, sample_spec("Shop", &other), MessageKind::Update, 2_000);
        r.receive_message(hijack.clone(), 6_000).await.expect("receive");
        let err = r.confirm_hash(&LedgerHashRecord::new(hijack.hash.clone(), "tx2", 200, 10.0), 6_000).await;
        assert!(matches!(err, Err(RegistryError::NotOwner { .. })));

        // Downgrade
        let mut older = sample_spec("Shop", &owner());
        older.version = 3;
        let downgrade = signed_message(&OWNER_SECRET, older, MessageKind::Update, 3_000);
        r.receive_message(downgrade.clone(), 7_000).await.expect("receive");
        let err = r.confirm_hash(&LedgerHashRecord::new(downgrade.hash.clone(), "tx3", 200, 10.0), 7_000).await;
        assert!(matches!(err, Err(RegistryError::VersionDowngrade { current: 4, proposed: 3 })));

        // Proper update renews the registration height
        let mut bigger = sample_spec("Shop", &owner());
        bigger.instances = 5;
        let update = signed_message(&OWNER_SECRET, bigger, MessageKind::Update, 4_000);
        r.receive_message(update.clone(), 8_000).await.expect("receive");
        let outcome = r.confirm_hash(&LedgerHashRecord::new(update.hash.clone(), "tx4", 300, 10.0), 8_000).await;
        assert_eq!(outcome.expect("update"), ConfirmOutcome::Updated);
        let spec = r.application("Shop").await.expect("q").expect("app");
        assert_eq!(spec.instances, 5);
        assert_eq!(spec.registration_height, 300);
    }

    #[tokio::test]
    async fn test_name_taken_until_expired() {
        let (_, r) = registry();
        let reg = signed_message(&OWNER_SECRET, sample_spec("Shop", &owner()), MessageKind::Register, 1_000);
        r.receive_message(reg.clone(), 0).await.expect("receive");
        r.confirm_hash(&LedgerHashRecord::new(reg.hash.clone(), "tx1", 100, 2.25), 0).await.expect("reg");

        let other = ethereum_address(&OTHER_SECRET).expect("address");
        let squat = signed_message(&OTHER_SECRET, sample_spec("shop", &other), MessageKind::Register, 2_000);
        r.receive_message(squat.clone(), 0).await.expect("receive");
        let err = r.confirm_hash(&LedgerHashRecord::new(squat.hash.clone(), "tx2", 200, 10.0), 0).await;
        assert!(matches!(err, Err(RegistryError::NameTaken(_))));

        let spec = r.application("shop").await.expect("q").expect("app");
        assert!(!r.is_expired(&spec, 100 + 22_000));
        assert!(r.is_expired(&spec, 100 + 22_001));
        assert_eq!(r.expired(100 + 22_001).await.expect("q").len(), 1);
    }

    // ════════════════════════════════════════════════════════════════════════
    // LOCATION BOOK
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_location_book() {
        let (_, r) = registry();
        assert!(r.store_installing(r.new_installing("Shop", "1.1.1.1", 0), 0).await.expect("installing"));
        assert_eq!(r.installing("shop", 1).await.expect("q").len(), 1);

        let loc = r.new_location("Shop", "h", "1.1.1.1:16127", 10, None);
        assert!(r.store_location(loc.clone(), 10).await.expect("store"));
        // Running supersedes installing
        assert!(r.installing("shop", 11).await.expect("q").is_empty());
        assert!(r.location_on_node("shop", "1.1.1.1", 11).await.expect("q").is_some());

        let stale = r.new_location("Shop", "h", "2.2.2.2", 0, None);
        assert!(!r.store_location(stale, stale_now()).await.expect("store"));

        assert!(r.locations("shop", loc.expire_at).await.expect("q").is_empty());
        assert_eq!(r.purge_expired_locations(loc.expire_at).await.expect("purge"), 1);
        assert!(!r.remove_location("shop", "1.1.1.1").await.expect("rm"));
    }

    fn stale_now() -> u64 {
        LocationSection::default().ttl_ms + 1
    }
}
