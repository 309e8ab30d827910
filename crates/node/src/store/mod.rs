//! Node collections behind the [`AppDatabase`] trait.
//!
//! [`MemoryDatabase`] holds them in process. [`FileDatabase`] wraps it and
//! rewrites a JSON snapshot after every change, so a restarted node sees
//! what it ran before.
//!
//! Collection names follow the on-disk layout used across the fleet:
//!
//! | Database      | Collection                 | Content                         |
//! |---------------|----------------------------|---------------------------------|
//! | ledger mirror | `scannedHeight`            | last scanned ledger height      |
//! | ledger mirror | `appsHashes`               | [`LedgerHashRecord`]            |
//! | local apps    | `appsInformation`          | specs installed on this node    |
//! | global apps   | `appsMessages`             | permanent [`ApplicationMessage`]|
//! | global apps   | `appsInformation`          | current spec per app            |
//! | global apps   | `appsTemporaryMessages`    | unconfirmed messages            |
//! | global apps   | `appsLocations`            | [`ApplicationLocation`]         |
//! | global apps   | `appsInstallingLocations`  | [`InstallingLocation`]          |
//!
//! App names are keyed case-insensitively, locations by `(name, host)`.
//! Every error is transient: callers retry on their next tick.

mod file;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use skyfleet_proto::{
    host_of, ApplicationLocation, ApplicationMessage, ApplicationSpecification, InstallingLocation,
    LedgerHashRecord, TemporaryMessage,
};

pub const SCANNED_HEIGHT: &str = "scannedHeight";
pub const APPS_HASHES: &str = "appsHashes";
pub const APPS_INFORMATION: &str = "appsInformation";
pub const APPS_MESSAGES: &str = "appsMessages";
pub const APPS_TEMPORARY_MESSAGES: &str = "appsTemporaryMessages";
pub const APPS_LOCATIONS: &str = "appsLocations";
pub const APPS_INSTALLING_LOCATIONS: &str = "appsInstallingLocations";

pub use file::FileDatabase;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("query on {collection} failed: {reason}")]
    Query { collection: &'static str, reason: String },

    #[error("snapshot {path}: {reason}")]
    Persist { path: String, reason: String },
}

/// Storage seam for every component that reads or writes app state.
#[async_trait]
pub trait AppDatabase: Send + Sync {
    // ── ledger mirror ──
    async fn scanned_height(&self) -> Result<u64, StoreError>;
    async fn set_scanned_height(&self, height: u64) -> Result<(), StoreError>;
    async fn upsert_hash(&self, record: LedgerHashRecord) -> Result<(), StoreError>;
    async fn hash_record(&self, hash: &str) -> Result<Option<LedgerHashRecord>, StoreError>;
    async fn hash_records(&self) -> Result<Vec<LedgerHashRecord>, StoreError>;

    // ── local apps ──
    async fn local_apps(&self) -> Result<Vec<ApplicationSpecification>, StoreError>;
    async fn local_app(&self, name: &str) -> Result<Option<ApplicationSpecification>, StoreError>;
    async fn upsert_local_app(&self, spec: ApplicationSpecification) -> Result<(), StoreError>;
    async fn remove_local_app(&self, name: &str) -> Result<bool, StoreError>;

    // ── global apps ──
    async fn insert_message(&self, message: ApplicationMessage) -> Result<(), StoreError>;
    async fn message(&self, hash: &str) -> Result<Option<ApplicationMessage>, StoreError>;
    /// Permanent messages of `name`, oldest height first.
    async fn app_messages(&self, name: &str) -> Result<Vec<ApplicationMessage>, StoreError>;
    async fn global_app(&self, name: &str) -> Result<Option<ApplicationSpecification>, StoreError>;
    async fn global_apps(&self) -> Result<Vec<ApplicationSpecification>, StoreError>;
    async fn upsert_global_app(&self, spec: ApplicationSpecification) -> Result<(), StoreError>;
    async fn remove_global_app(&self, name: &str) -> Result<bool, StoreError>;

    /// Returns `false` when the hash is already held.
    async fn insert_temporary(&self, message: TemporaryMessage) -> Result<bool, StoreError>;
    async fn temporary(&self, hash: &str) -> Result<Option<TemporaryMessage>, StoreError>;
    async fn remove_temporary(&self, hash: &str) -> Result<bool, StoreError>;
    async fn purge_temporary(&self, now_ms: u64) -> Result<usize, StoreError>;

    async fn upsert_location(&self, location: ApplicationLocation) -> Result<(), StoreError>;
    async fn locations(&self, name: &str) -> Result<Vec<ApplicationLocation>, StoreError>;
    /// `expire_at` of every record for `(name, ip)`.
    async fn location_expiries(&self, name: &str, ip: &str) -> Result<Vec<u64>, StoreError>;
    async fn remove_location(&self, name: &str, ip: &str) -> Result<bool, StoreError>;
    async fn purge_locations(&self, now_ms: u64) -> Result<usize, StoreError>;

    async fn upsert_installing(&self, location: InstallingLocation) -> Result<(), StoreError>;
    async fn installing(&self, name: &str) -> Result<Vec<InstallingLocation>, StoreError>;
    async fn remove_installing(&self, name: &str, ip: &str) -> Result<bool, StoreError>;
    async fn purge_installing(&self, now_ms: u64) -> Result<usize, StoreError>;
}

// ════════════════════════════════════════════════════════════════════════════
// MEMORY DATABASE
// ════════════════════════════════════════════════════════════════════════════

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn location_key(name: &str, ip: &str) -> (String, String) {
    (key(name), host_of(ip).to_string())
}

#[derive(Default)]
struct Collections {
    scanned_height: u64,
    hashes: HashMap<String, LedgerHashRecord>,
    local_apps: HashMap<String, ApplicationSpecification>,
    messages: HashMap<String, ApplicationMessage>,
    global_apps: HashMap<String, ApplicationSpecification>,
    temporary: HashMap<String, TemporaryMessage>,
    locations: HashMap<(String, String), ApplicationLocation>,
    installing: HashMap<(String, String), InstallingLocation>,
}

/// On-disk shape of [`Collections`]. Maps are flattened to lists and
/// re-keyed on load.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Snapshot {
    #[serde(rename = "scannedHeight")]
    scanned_height: u64,
    #[serde(rename = "appsHashes")]
    hashes: Vec<LedgerHashRecord>,
    #[serde(rename = "localAppsInformation")]
    local_apps: Vec<ApplicationSpecification>,
    #[serde(rename = "appsMessages")]
    messages: Vec<ApplicationMessage>,
    #[serde(rename = "globalAppsInformation")]
    global_apps: Vec<ApplicationSpecification>,
    #[serde(rename = "appsTemporaryMessages")]
    temporary: Vec<TemporaryMessage>,
    #[serde(rename = "appsLocations")]
    locations: Vec<ApplicationLocation>,
    #[serde(rename = "appsInstallingLocations")]
    installing: Vec<InstallingLocation>,
}

impl Collections {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            scanned_height: self.scanned_height,
            hashes: self.hashes.values().cloned().collect(),
            local_apps: self.local_apps.values().cloned().collect(),
            messages: self.messages.values().cloned().collect(),
            global_apps: self.global_apps.values().cloned().collect(),
            temporary: self.temporary.values().cloned().collect(),
            locations: self.locations.values().cloned().collect(),
            installing: self.installing.values().cloned().collect(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            scanned_height: snapshot.scanned_height,
            hashes: snapshot.hashes.into_iter().map(|r| (r.hash.clone(), r)).collect(),
            local_apps: snapshot.local_apps.into_iter().map(|s| (s.key(), s)).collect(),
            messages: snapshot.messages.into_iter().map(|m| (m.hash.clone(), m)).collect(),
            global_apps: snapshot.global_apps.into_iter().map(|s| (s.key(), s)).collect(),
            temporary: snapshot
                .temporary
                .into_iter()
                .map(|t| (t.message.hash.clone(), t))
                .collect(),
            locations: snapshot
                .locations
                .into_iter()
                .map(|l| (location_key(&l.name, &l.ip), l))
                .collect(),
            installing: snapshot
                .installing
                .into_iter()
                .map(|l| (location_key(&l.name, &l.ip), l))
                .collect(),
        }
    }
}

/// In-process implementation of [`AppDatabase`].
///
/// `set_unavailable(true)` makes every call fail, which is how callers'
/// transient-error paths are exercised.
#[derive(Default)]
pub struct MemoryDatabase {
    inner: RwLock<Collections>,
    unavailable: AtomicBool,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: RwLock::new(Collections::from_snapshot(snapshot)),
            unavailable: AtomicBool::new(false),
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.inner.read().snapshot()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory database switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AppDatabase for MemoryDatabase {
    async fn scanned_height(&self) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.inner.read().scanned_height)
    }

    async fn set_scanned_height(&self, height: u64) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write().scanned_height = height;
        Ok(())
    }

    async fn upsert_hash(&self, record: LedgerHashRecord) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write().hashes.insert(record.hash.clone(), record);
        Ok(())
    }

    async fn hash_record(&self, hash: &str) -> Result<Option<LedgerHashRecord>, StoreError> {
        self.check()?;
        Ok(self.inner.read().hashes.get(hash).cloned())
    }

    async fn hash_records(&self) -> Result<Vec<LedgerHashRecord>, StoreError> {
        self.check()?;
        let mut out: Vec<_> = self.inner.read().hashes.values().cloned().collect();
        out.sort_by(|a, b| a.height.cmp(&b.height).then_with(|| a.hash.cmp(&b.hash)));
        Ok(out)
    }

    async fn local_apps(&self) -> Result<Vec<ApplicationSpecification>, StoreError> {
        self.check()?;
        let mut out: Vec<_> = self.inner.read().local_apps.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn local_app(&self, name: &str) -> Result<Option<ApplicationSpecification>, StoreError> {
        self.check()?;
        Ok(self.inner.read().local_apps.get(&key(name)).cloned())
    }

    async fn upsert_local_app(&self, spec: ApplicationSpecification) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write().local_apps.insert(spec.key(), spec);
        Ok(())
    }

    async fn remove_local_app(&self, name: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.inner.write().local_apps.remove(&key(name)).is_some())
    }

    async fn insert_message(&self, message: ApplicationMessage) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write().messages.insert(message.hash.clone(), message);
        Ok(())
    }

    async fn message(&self, hash: &str) -> Result<Option<ApplicationMessage>, StoreError> {
        self.check()?;
        Ok(self.inner.read().messages.get(hash).cloned())
    }

    async fn app_messages(&self, name: &str) -> Result<Vec<ApplicationMessage>, StoreError> {
        self.check()?;
        let name = key(name);
        let mut out: Vec<_> = self
            .inner
            .read()
            .messages
            .values()
            .filter(|m| m.specification.key() == name)
            .cloned()
            .collect();
        out.sort_by_key(|m| (m.height.unwrap_or(0), m.timestamp));
        Ok(out)
    }

    async fn global_app(&self, name: &str) -> Result<Option<ApplicationSpecification>, StoreError> {
        self.check()?;
        Ok(self.inner.read().global_apps.get(&key(name)).cloned())
    }

    async fn global_apps(&self) -> Result<Vec<ApplicationSpecification>, StoreError> {
        self.check()?;
        let mut out: Vec<_> = self.inner.read().global_apps.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn upsert_global_app(&self, spec: ApplicationSpecification) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write().global_apps.insert(spec.key(), spec);
        Ok(())
    }

    async fn remove_global_app(&self, name: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.inner.write().global_apps.remove(&key(name)).is_some())
    }

    async fn insert_temporary(&self, message: TemporaryMessage) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.inner.write();
        if inner.temporary.contains_key(&message.message.hash) {
            return Ok(false);
        }
        inner.temporary.insert(message.message.hash.clone(), message);
        Ok(true)
    }

    async fn temporary(&self, hash: &str) -> Result<Option<TemporaryMessage>, StoreError> {
        self.check()?;
        Ok(self.inner.read().temporary.get(hash).cloned())
    }

    async fn remove_temporary(&self, hash: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.inner.write().temporary.remove(hash).is_some())
    }

    async fn purge_temporary(&self, now_ms: u64) -> Result<usize, StoreError> {
        self.check()?;
        let mut inner = self.inner.write();
        let before = inner.temporary.len();
        inner.temporary.retain(|_, t| !t.is_expired(now_ms));
        Ok(before - inner.temporary.len())
    }

    async fn upsert_location(&self, location: ApplicationLocation) -> Result<(), StoreError> {
        self.check()?;
        let k = location_key(&location.name, &location.ip);
        self.inner.write().locations.insert(k, location);
        Ok(())
    }

    async fn locations(&self, name: &str) -> Result<Vec<ApplicationLocation>, StoreError> {
        self.check()?;
        let name = key(name);
        let mut out: Vec<_> = self
            .inner
            .read()
            .locations
            .iter()
            .filter(|((n, _), _)| *n == name)
            .map(|(_, l)| l.clone())
            .collect();
        out.sort_by(|a, b| a.ip.cmp(&b.ip));
        Ok(out)
    }

    async fn location_expiries(&self, name: &str, ip: &str) -> Result<Vec<u64>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .locations
            .get(&location_key(name, ip))
            .map(|l| vec![l.expire_at])
            .unwrap_or_default())
    }

    async fn remove_location(&self, name: &str, ip: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.inner.write().locations.remove(&location_key(name, ip)).is_some())
    }

    async fn purge_locations(&self, now_ms: u64) -> Result<usize, StoreError> {
        self.check()?;
        let mut inner = self.inner.write();
        let before = inner.locations.len();
        inner.locations.retain(|_, l| l.is_alive(now_ms));
        Ok(before - inner.locations.len())
    }

    async fn upsert_installing(&self, location: InstallingLocation) -> Result<(), StoreError> {
        self.check()?;
        let k = location_key(&location.name, &location.ip);
        self.inner.write().installing.insert(k, location);
        Ok(())
    }

    async fn installing(&self, name: &str) -> Result<Vec<InstallingLocation>, StoreError> {
        self.check()?;
        let name = key(name);
        Ok(self
            .inner
            .read()
            .installing
            .iter()
            .filter(|((n, _), _)| *n == name)
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn remove_installing(&self, name: &str, ip: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.inner.write().installing.remove(&location_key(name, ip)).is_some())
    }

    async fn purge_installing(&self, now_ms: u64) -> Result<usize, StoreError> {
        self.check()?;
        let mut inner = self.inner.write();
        let before = inner.installing.len();
        inner.installing.retain(|_, l| l.is_alive(now_ms));
        Ok(before - inner.installing.len())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn location(name: &str, ip: &str, expire_at: u64) -> ApplicationLocation {
        ApplicationLocation {
            name: name.to_string(),
            hash: "h".to_string(),
            ip: ip.to_string(),
            broadcasted_at: 0,
            running_since: None,
            expire_at,
        }
    }

    #[tokio::test]
    async fn test_locations_keyed_by_name_and_host() {
        let db = MemoryDatabase::new();
        db.upsert_location(location("Web", "1.1.1.1:16127", 10)).await.expect("upsert");
        // Same host, different port and name case: replaces
        db.upsert_location(location("web", "1.1.1.1", 20)).await.expect("upsert");
        db.upsert_location(location("web", "2.2.2.2", 30)).await.expect("upsert");

        assert_eq!(db.locations("WEB").await.expect("q").len(), 2);
        assert_eq!(db.location_expiries("web", "1.1.1.1").await.expect("q"), vec![20]);
        assert!(db.location_expiries("web", "3.3.3.3").await.expect("q").is_empty());

        assert_eq!(db.purge_locations(25).await.expect("purge"), 1);
        assert!(db.remove_location("web", "2.2.2.2:16127").await.expect("rm"));
        assert!(db.locations("web").await.expect("q").is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_switch() {
        let db = MemoryDatabase::new();
        db.set_unavailable(true);
        assert!(matches!(db.scanned_height().await, Err(StoreError::Unavailable(_))));
        db.set_unavailable(false);
        assert_eq!(db.scanned_height().await.expect("ok"), 0);
    }

    #[tokio::test]
    async fn test_hash_records_sorted_by_height() {
        let db = MemoryDatabase::new();
        db.upsert_hash(LedgerHashRecord::new("b", "tx2", 20, 1.0)).await.expect("upsert");
        db.upsert_hash(LedgerHashRecord::new("a", "tx1", 10, 1.0)).await.expect("upsert");
        let records = db.hash_records().await.expect("q");
        assert_eq!(records[0].hash, "a");
        assert_eq!(records[1].hash, "b");
    }
}
