//! Snapshot-file persistence for [`MemoryDatabase`].
//!
//! Every mutating call updates memory first, then rewrites the whole
//! snapshot. It lands in `<path>.tmp` and is renamed over `<path>` once
//! synced, so a crash mid-write leaves the previous snapshot in place.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use skyfleet_proto::{
    ApplicationLocation, ApplicationMessage, ApplicationSpecification, InstallingLocation, LedgerHashRecord,
    TemporaryMessage,
};

use super::{AppDatabase, MemoryDatabase, Snapshot, StoreError};

fn persist_error(path: &Path, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Persist { path: path.display().to_string(), reason: reason.to_string() }
}

/// Durable [`AppDatabase`] backed by a JSON snapshot file.
pub struct FileDatabase {
    memory: MemoryDatabase,
    path: PathBuf,
    write: Mutex<()>,
}

impl FileDatabase {
    /// Load the snapshot at `path`. A missing file is an empty database;
    /// an unreadable one is an error rather than a silent reset.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes).map_err(|e| persist_error(&path, e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(persist_error(&path, e)),
        };
        debug!(path = %path.display(), "collections loaded");
        Ok(Self { memory: MemoryDatabase::from_snapshot(snapshot), path, write: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.write.lock();
        let bytes = serde_json::to_vec(&self.memory.snapshot()).map_err(|e| persist_error(&self.path, e))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| persist_error(&self.path, e))?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp_path).map_err(|e| persist_error(&temp_path, e))?;
            file.write_all(&bytes).map_err(|e| persist_error(&temp_path, e))?;
            file.sync_all().map_err(|e| persist_error(&temp_path, e))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| persist_error(&self.path, e))
    }

    fn persist_if(&self, changed: bool) -> Result<(), StoreError> {
        if changed {
            self.persist()?;
        }
        Ok(())
    }
}

#[async_trait]
impl AppDatabase for FileDatabase {
    async fn scanned_height(&self) -> Result<u64, StoreError> {
        self.memory.scanned_height().await
    }

    async fn set_scanned_height(&self, height: u64) -> Result<(), StoreError> {
        self.memory.set_scanned_height(height).await?;
        self.persist()
    }

    async fn upsert_hash(&self, record: LedgerHashRecord) -> Result<(), StoreError> {
        self.memory.upsert_hash(record).await?;
        self.persist()
    }

    async fn hash_record(&self, hash: &str) -> Result<Option<LedgerHashRecord>, StoreError> {
        self.memory.hash_record(hash).await
    }

    async fn hash_records(&self) -> Result<Vec<LedgerHashRecord>, StoreError> {
        self.memory.hash_records().await
    }

    async fn local_apps(&self) -> Result<Vec<ApplicationSpecification>, StoreError> {
        self.memory.local_apps().await
    }

    async fn local_app(&self, name: &str) -> Result<Option<ApplicationSpecification>, StoreError> {
        self.memory.local_app(name).await
    }

    async fn upsert_local_app(&self, spec: ApplicationSpecification) -> Result<(), StoreError> {
        self.memory.upsert_local_app(spec).await?;
        self.persist()
    }

    async fn remove_local_app(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self.memory.remove_local_app(name).await?;
        self.persist_if(removed)?;
        Ok(removed)
    }

    async fn insert_message(&self, message: ApplicationMessage) -> Result<(), StoreError> {
        self.memory.insert_message(message).await?;
        self.persist()
    }

    async fn message(&self, hash: &str) -> Result<Option<ApplicationMessage>, StoreError> {
        self.memory.message(hash).await
    }

    async fn app_messages(&self, name: &str) -> Result<Vec<ApplicationMessage>, StoreError> {
        self.memory.app_messages(name).await
    }

    async fn global_app(&self, name: &str) -> Result<Option<ApplicationSpecification>, StoreError> {
        self.memory.global_app(name).await
    }

    async fn global_apps(&self) -> Result<Vec<ApplicationSpecification>, StoreError> {
        self.memory.global_apps().await
    }

    async fn upsert_global_app(&self, spec: ApplicationSpecification) -> Result<(), StoreError> {
        self.memory.upsert_global_app(spec).await?;
        self.persist()
    }

    async fn remove_global_app(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self.memory.remove_global_app(name).await?;
        self.persist_if(removed)?;
        Ok(removed)
    }

    async fn insert_temporary(&self, message: TemporaryMessage) -> Result<bool, StoreError> {
        let inserted = self.memory.insert_temporary(message).await?;
        self.persist_if(inserted)?;
        Ok(inserted)
    }

    async fn temporary(&self, hash: &str) -> Result<Option<TemporaryMessage>, StoreError> {
        self.memory.temporary(hash).await
    }

    async fn remove_temporary(&self, hash: &str) -> Result<bool, StoreError> {
        let removed = self.memory.remove_temporary(hash).await?;
        self.persist_if(removed)?;
        Ok(removed)
    }

    async fn purge_temporary(&self, now_ms: u64) -> Result<usize, StoreError> {
        let purged = self.memory.purge_temporary(now_ms).await?;
        self.persist_if(purged > 0)?;
        Ok(purged)
    }

    async fn upsert_location(&self, location: ApplicationLocation) -> Result<(), StoreError> {
        self.memory.upsert_location(location).await?;
        self.persist()
    }

    async fn locations(&self, name: &str) -> Result<Vec<ApplicationLocation>, StoreError> {
        self.memory.locations(name).await
    }

    async fn location_expiries(&self, name: &str, ip: &str) -> Result<Vec<u64>, StoreError> {
        self.memory.location_expiries(name, ip).await
    }

    async fn remove_location(&self, name: &str, ip: &str) -> Result<bool, StoreError> {
        let removed = self.memory.remove_location(name, ip).await?;
        self.persist_if(removed)?;
        Ok(removed)
    }

    async fn purge_locations(&self, now_ms: u64) -> Result<usize, StoreError> {
        let purged = self.memory.purge_locations(now_ms).await?;
        self.persist_if(purged > 0)?;
        Ok(purged)
    }

    async fn upsert_installing(&self, location: InstallingLocation) -> Result<(), StoreError> {
        self.memory.upsert_installing(location).await?;
        self.persist()
    }

    async fn installing(&self, name: &str) -> Result<Vec<InstallingLocation>, StoreError> {
        self.memory.installing(name).await
    }

    async fn remove_installing(&self, name: &str, ip: &str) -> Result<bool, StoreError> {
        let removed = self.memory.remove_installing(name, ip).await?;
        self.persist_if(removed)?;
        Ok(removed)
    }

    async fn purge_installing(&self, now_ms: u64) -> Result<usize, StoreError> {
        let purged = self.memory.purge_installing(now_ms).await?;
        self.persist_if(purged > 0)?;
        Ok(purged)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::sample_spec;

    fn location(name: &str, ip: &str) -> ApplicationLocation {
        ApplicationLocation {
            name: name.to_string(),
            hash: "h".to_string(),
            ip: ip.to_string(),
            broadcasted_at: 1_000,
            running_since: Some(1_000),
            expire_at: u64::MAX,
        }
    }

    #[tokio::test]
    async fn test_reopen_keeps_collections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("collections.json");

        {
            let db = FileDatabase::open(&path).expect("open");
            db.set_scanned_height(1_234).await.expect("height");
            db.upsert_hash(LedgerHashRecord::new("abc", "tx", 1_200, 2.5)).await.expect("hash");
            db.upsert_local_app(sample_spec("AppA", "o")).await.expect("local");
            db.upsert_global_app(sample_spec("AppA", "o")).await.expect("global");
            db.upsert_location(location("AppA", "10.0.0.1:16127")).await.expect("location");
        }
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let db = FileDatabase::open(&path).expect("reopen");
        assert_eq!(db.scanned_height().await.expect("q"), 1_234);
        assert_eq!(db.hash_record("abc").await.expect("q").map(|r| r.height), Some(1_200));
        assert_eq!(db.local_app("appa").await.expect("q").map(|s| s.name), Some("AppA".to_string()));
        assert!(db.global_app("AppA").await.expect("q").is_some());
        // Re-keyed by host on load
        assert_eq!(db.location_expiries("AppA", "10.0.0.1").await.expect("q"), vec![u64::MAX]);
    }

    #[tokio::test]
    async fn test_removals_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("collections.json");

        let db = FileDatabase::open(&path).expect("open");
        db.upsert_local_app(sample_spec("AppA", "o")).await.expect("local");
        db.upsert_local_app(sample_spec("AppB", "o")).await.expect("local");
        assert!(db.remove_local_app("AppB").await.expect("rm"));
        drop(db);

        let db = FileDatabase::open(&path).expect("reopen");
        let names: Vec<String> = db.local_apps().await.expect("q").into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["AppA".to_string()]);
    }

    #[test]
    fn test_missing_file_opens_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = FileDatabase::open(dir.path().join("absent.json")).expect("open");
        assert_eq!(db.memory.snapshot().scanned_height, 0);
        assert!(!db.path().exists());
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("collections.json");
        fs::write(&path, b"{ not json").expect("write");
        assert!(matches!(FileDatabase::open(&path), Err(StoreError::Persist { .. })));
    }
}
