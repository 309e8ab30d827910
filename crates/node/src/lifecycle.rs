//! Install and uninstall of whole applications.
//!
//! [`ContainerLifecycle`] is the only writer of local `appsInformation`.
//! Callers hold the matching lifecycle flag; this module does not take
//! flags itself.
//!
//! ## Install
//!
//! ```text
//! create every component ──▶ start non-replicated components
//!        │ failure: stop + remove what was created
//!        ▼
//! appsInformation ──▶ own location ──▶ AppRunning broadcast
//! ```
//!
//! Replicated components are created stopped; the replication monitor
//! starts them once their folder state allows it.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use skyfleet_proto::{ApplicationSpecification, PeerMessage, Tier};

use crate::error::{OrchestratorError, Result};
use crate::now_ms;
use crate::registry::Registry;
use crate::replication::syncthing::StorageDaemon;
use crate::runtime_service::{ContainerConfig, ContainerRuntime, RuntimeError};
use crate::state::OrchestratorState;
use crate::store::AppDatabase;
use crate::transport::{PeerTransport, TransportError};

#[async_trait]
pub trait AppLifecycle: Send + Sync {
    async fn install(&self, spec: &ApplicationSpecification) -> Result<()>;
    async fn uninstall(&self, name: &str, reason: &str) -> Result<()>;
}

pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<dyn AppDatabase>,
    registry: Arc<Registry>,
    transport: Arc<dyn PeerTransport>,
    state: Arc<OrchestratorState>,
    storage: Option<Arc<dyn StorageDaemon>>,
    data_root: PathBuf,
}

/// `Ok` for a missing container; removal is idempotent.
fn tolerate_missing(result: std::result::Result<(), RuntimeError>) -> std::result::Result<(), RuntimeError> {
    match result {
        Err(RuntimeError::NotFound(_)) => Ok(()),
        other => other,
    }
}

impl ContainerLifecycle {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<dyn AppDatabase>,
        registry: Arc<Registry>,
        transport: Arc<dyn PeerTransport>,
        state: Arc<OrchestratorState>,
        data_root: impl Into<PathBuf>,
    ) -> Self {
        Self { runtime, db, registry, transport, state, storage: None, data_root: data_root.into() }
    }

    /// Drop sync folders of removed apps from the storage daemon as well.
    pub fn with_storage(mut self, storage: Arc<dyn StorageDaemon>) -> Self {
        self.storage = Some(storage);
        self
    }

    fn tier(&self) -> Tier {
        self.state.tier
    }

    async fn rollback(&self, created: &[String]) {
        for name in created.iter().rev() {
            let _ = self.runtime.stop(name).await;
            if let Err(e) = tolerate_missing(self.runtime.remove(name).await) {
                warn!(container = %name, error = %e, "rollback could not remove container");
            }
        }
    }

    async fn broadcast(&self, message: PeerMessage) {
        match self.transport.broadcast(&message).await {
            Ok(_) | Err(TransportError::NoPeers) => {}
            Err(e) => warn!(kind = message.kind(), error = %e, "broadcast failed"),
        }
    }

    fn report_mount_failure(&self, spec: &ApplicationSpecification, detail: &str) {
        warn!(app = %spec.name, detail, "container mount failed");
        self.state.with_dos(|dos| dos.report_mount_failure(&spec.name, detail));
    }

    async fn create_and_start(&self, spec: &ApplicationSpecification, created: &mut Vec<String>) -> Result<()> {
        for component in &spec.components {
            let config = ContainerConfig::for_component(spec, component, self.tier(), &self.data_root);
            if let Err(e) = tokio::fs::create_dir_all(&config.volume.0).await {
                self.report_mount_failure(spec, &format!("volume {}: {}", config.volume.0, e));
                return Err(e.into());
            }
            if let Err(e) = self.runtime.create(&config).await {
                if !matches!(e, RuntimeError::Unreachable(_)) {
                    self.report_mount_failure(spec, &e.to_string());
                }
                return Err(e.into());
            }
            created.push(config.name.clone());
            if !component.container_data.is_replicated() {
                self.runtime.start(&config.name).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AppLifecycle for ContainerLifecycle {
    async fn install(&self, spec: &ApplicationSpecification) -> Result<()> {
        let mut created = Vec::with_capacity(spec.components.len());
        if let Err(e) = self.create_and_start(spec, &mut created).await {
            warn!(app = %spec.name, error = %e, "install failed, rolling back");
            self.rollback(&created).await;
            return Err(e);
        }
        self.db.upsert_local_app(spec.clone()).await?;
        self.state.with_dos(|dos| dos.clear_mount_failures());

        let now = now_ms();
        let hash = self.registry.latest_message(&spec.name).await?.map(|m| m.hash).unwrap_or_default();
        let running_since = if spec.has_replicated_storage() { None } else { Some(now) };
        let location = self.registry.new_location(&spec.name, &hash, &self.state.node_ip, now, running_since);
        self.registry.store_location(location.clone(), now).await?;
        self.broadcast(PeerMessage::AppRunning(vec![location])).await;
        info!(app = %spec.name, components = spec.components.len(), "application installed");
        Ok(())
    }

    async fn uninstall(&self, name: &str, reason: &str) -> Result<()> {
        let spec = self
            .db
            .local_app(name)
            .await?
            .ok_or_else(|| OrchestratorError::NotInstalled(name.to_string()))?;

        for component in &spec.components {
            let container = spec.container_name(component);
            tolerate_missing(self.runtime.stop(&container).await)?;
            tolerate_missing(self.runtime.remove(&container).await)?;

            if component.container_data.is_replicated() {
                self.state.sync_folders.remove(&container);
                if let Some(storage) = &self.storage {
                    if let Err(e) = storage.remove_folder(&container).await {
                        warn!(folder = %container, error = %e, "sync folder left for diagnose");
                    }
                }
            }
            match tokio::fs::remove_dir_all(self.data_root.join(&container)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.db.remove_local_app(&spec.name).await?;
        self.registry.remove_location(&spec.name, &self.state.node_ip).await?;
        self.broadcast(PeerMessage::AppRemoved { name: spec.name.clone(), ip: self.state.node_ip.clone() }).await;
        info!(app = %spec.name, reason, "application removed");
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use skyfleet_common::config::{DosSection, LocationSection, RegistrySection};

    use crate::mock::{replicated_spec, sample_component, sample_spec, MockRuntime, MockTransport};
    use crate::replication::folder_state::SyncFolderState;
    use crate::runtime_service::ContainerState;
    use crate::store::MemoryDatabase;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<MemoryDatabase>,
        runtime: Arc<MockRuntime>,
        transport: Arc<MockTransport>,
        state: Arc<OrchestratorState>,
        registry: Arc<Registry>,
        lifecycle: ContainerLifecycle,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(MemoryDatabase::new());
        let runtime = Arc::new(MockRuntime::new());
        let transport = Arc::new(MockTransport::with_peers(1));
        let state = Arc::new(OrchestratorState::new("10.0.0.1", Tier::Cumulus, DosSection::default()));
        let registry = Arc::new(Registry::new(db.clone(), RegistrySection::default(), &LocationSection::default(), 600_000));
        let lifecycle = ContainerLifecycle::new(
            runtime.clone(),
            db.clone(),
            registry.clone(),
            transport.clone(),
            state.clone(),
            dir.path(),
        );
        Fixture { _dir: dir, db, runtime, transport, state, registry, lifecycle }
    }

    #[tokio::test]
    async fn test_install_records_and_broadcasts() {
        let f = fixture();
        let spec = sample_spec("Shop", "owner");
        f.lifecycle.install(&spec).await.expect("install");

        assert_eq!(f.runtime.state("fluxweb_Shop"), Some(ContainerState::Running));
        assert!(f.db.local_app("Shop").await.expect("q").is_some());
        let loc = f.registry.location_on_node("Shop", "10.0.0.1", now_ms()).await.expect("q").expect("location");
        assert!(loc.running_since.is_some());
        assert!(matches!(f.transport.broadcasts().as_slice(), [PeerMessage::AppRunning(_)]));
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_every_component() {
        let f = fixture();
        let mut spec = sample_spec("Shop", "owner");
        spec.components.push(sample_component("db", 31001));
        f.runtime.fail_start("fluxdb_Shop");

        let err = f.lifecycle.install(&spec).await.expect_err("start fails");
        assert!(matches!(err, OrchestratorError::Runtime(RuntimeError::CommandFailed { .. })));
        assert!(f.runtime.names().is_empty());
        assert!(f.db.local_app("Shop").await.expect("q").is_none());
        assert!(f.transport.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_replicated_component_created_stopped() {
        let f = fixture();
        let spec = replicated_spec("Vault", "owner");
        f.lifecycle.install(&spec).await.expect("install");
        assert_eq!(f.runtime.state("fluxweb_Vault"), Some(ContainerState::Created));
        let loc = f.registry.location_on_node("Vault", "10.0.0.1", now_ms()).await.expect("q").expect("location");
        assert!(loc.running_since.is_none());
    }

    #[tokio::test]
    async fn test_uninstall_cleans_everything() {
        let f = fixture();
        let spec = replicated_spec("Vault", "owner");
        f.lifecycle.install(&spec).await.expect("install");
        f.state.sync_folders.set("fluxweb_Vault", SyncFolderState::ReceiveOnly { executions: 1 });

        f.lifecycle.uninstall("vault", "expired").await.expect("uninstall");
        assert!(f.runtime.names().is_empty());
        assert!(f.db.local_app("Vault").await.expect("q").is_none());
        assert!(f.state.sync_folders.get("fluxweb_Vault").is_none());
        assert!(f.registry.location_on_node("Vault", "10.0.0.1", now_ms()).await.expect("q").is_none());
        assert!(matches!(f.transport.broadcasts().last(), Some(PeerMessage::AppRemoved { .. })));
    }

    #[tokio::test]
    async fn test_uninstall_unknown_app() {
        let f = fixture();
        let err = f.lifecycle.uninstall("ghost", "operator").await.expect_err("not installed");
        assert!(matches!(err, OrchestratorError::NotInstalled(_)));
    }

    // ════════════════════════════════════════════════════════════════════════
    // MOUNT FAILURES
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_unusable_volume_root_raises_mount_failure() {
        let f = fixture();
        // A regular file where the volume directory should go
        let blocked = f._dir.path().join("blocked");
        std::fs::write(&blocked, b"x").expect("write");
        let lifecycle =
            ContainerLifecycle::new(f.runtime.clone(), f.db.clone(), f.registry.clone(), f.transport.clone(), f.state.clone(), &blocked);

        assert!(lifecycle.install(&sample_spec("Shop", "owner")).await.is_err());
        let dos = f.state.dos_snapshot();
        assert!(dos.dos_state >= DosSection::default().threshold);
        assert!(dos.dos_mount_message.expect("mount message").contains("Mount of Shop failed"));
        assert!(f.runtime.names().is_empty());

        // The next good install clears it
        f.lifecycle.install(&sample_spec("Web", "owner")).await.expect("install");
        let dos = f.state.dos_snapshot();
        assert_eq!(dos.dos_state, 0);
        assert!(dos.dos_mount_message.is_none());
    }

    #[tokio::test]
    async fn test_runtime_create_failure_raises_mount_failure() {
        let f = fixture();
        f.runtime.fail_create("fluxweb_Shop");
        let err = f.lifecycle.install(&sample_spec("Shop", "owner")).await.expect_err("create fails");
        assert!(matches!(err, OrchestratorError::Runtime(RuntimeError::CommandFailed { .. })));
        assert!(f.state.dos_snapshot().dos_mount_message.expect("mount message").contains("no such device"));
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_not_a_mount_failure() {
        let f = fixture();
        f.runtime.set_unreachable(true);
        assert!(f.lifecycle.install(&sample_spec("Shop", "owner")).await.is_err());
        assert_eq!(f.state.dos_snapshot().dos_state, 0);
    }
}
