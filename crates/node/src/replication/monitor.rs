//! Periodic replication pass.
//!
//! For every replicated component installed here:
//!
//! ```text
//! locations of the app ──▶ peer device ids ──▶ devices configured
//!        │
//!        ▼
//! FolderSyncMachine step ──▶ FolderAction applied to daemon + container
//! ```
//!
//! After the folders, `diagnose` drops folders and devices nothing refers
//! to any more and restarts the daemon when its config asks for it.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use skyfleet_proto::worker::normalize_endpoint;
use skyfleet_proto::{host_of, parse_container_name, ApplicationLocation};

use super::folder_state::{FolderAction, FolderContext, FolderSyncMachine};
use super::syncthing::{DeviceConfig, FolderConfig, FolderDevice, FolderType, StorageDaemon};
use crate::error::{OrchestratorError, Result};
use crate::registry::Registry;
use crate::runtime_service::{ContainerRuntime, ContainerState, RuntimeError};
use crate::state::OrchestratorState;
use crate::store::AppDatabase;
use crate::transport::PeerTransport;

/// Devices this node manages carry this name prefix.
pub const DEVICE_NAME_PREFIX: &str = "skyfleet-";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnoseReport {
    pub removed_folders: Vec<String>,
    pub removed_devices: Vec<String>,
    pub restarted: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
    pub folders: usize,
    pub actions: Vec<(String, FolderAction)>,
    pub failed: Vec<(String, String)>,
    pub skipped: Option<&'static str>,
    pub diagnose: DiagnoseReport,
}

pub struct ReplicationMonitor {
    state: Arc<OrchestratorState>,
    db: Arc<dyn AppDatabase>,
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    daemon: Arc<dyn StorageDaemon>,
    transport: Arc<dyn PeerTransport>,
    machine: FolderSyncMachine,
    data_root: PathBuf,
}

/// One replicated component as seen by a single pass.
struct Folder {
    id: String,
    path: String,
    peers: Vec<ApplicationLocation>,
}

fn folder_config(id: &str, path: &str, folder_type: FolderType, devices: &BTreeSet<String>) -> FolderConfig {
    FolderConfig {
        id: id.to_string(),
        label: id.to_string(),
        path: path.to_string(),
        folder_type,
        devices: devices.iter().map(|d| FolderDevice { device_id: d.clone() }).collect(),
        paused: false,
    }
}

impl ReplicationMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<OrchestratorState>,
        db: Arc<dyn AppDatabase>,
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        daemon: Arc<dyn StorageDaemon>,
        transport: Arc<dyn PeerTransport>,
        machine: FolderSyncMachine,
        data_root: impl Into<PathBuf>,
    ) -> Self {
        Self { state, db, registry, runtime, daemon, transport, machine, data_root: data_root.into() }
    }

    pub async fn run_once(&self, now_ms: u64) -> Result<MonitorReport> {
        if self.state.lifecycle_busy() {
            return Ok(MonitorReport { skipped: Some("lifecycle in progress"), ..MonitorReport::default() });
        }

        let own_device = self.daemon.device_id().await?;
        let configured: BTreeMap<String, FolderConfig> =
            self.daemon.folders().await?.into_iter().map(|f| (f.id.clone(), f)).collect();
        let known_devices: BTreeSet<String> = self.daemon.devices().await?.into_iter().map(|d| d.device_id).collect();

        let mut report = MonitorReport::default();
        let mut expected_folders = BTreeSet::new();
        let mut expected_devices = BTreeSet::new();

        for folder in self.replicated_folders(now_ms).await? {
            expected_folders.insert(folder.id.clone());
            report.folders += 1;

            let mut devices = BTreeSet::from([own_device.clone()]);
            for (host, device_id) in self.peer_devices(&folder.peers).await {
                if !known_devices.contains(&device_id) {
                    let device = DeviceConfig {
                        device_id: device_id.clone(),
                        name: format!("{}{}", DEVICE_NAME_PREFIX, host),
                        addresses: vec!["dynamic".to_string()],
                        auto_accept_folders: false,
                    };
                    if let Err(e) = self.daemon.put_device(&device).await {
                        warn!(device = %device_id, error = %e, "could not add peer device");
                        continue;
                    }
                    info!(device = %device_id, peer = %host, "peer device added");
                }
                expected_devices.insert(device_id.clone());
                devices.insert(device_id);
            }

            match self.step(&folder, configured.get(&folder.id), &devices).await {
                Ok(action) => report.actions.push((folder.id, action)),
                Err(e) => {
                    warn!(folder = %folder.id, error = %e, "replication step failed");
                    report.failed.push((folder.id, e.to_string()));
                }
            }
        }

        report.diagnose = self.diagnose(&expected_folders, &expected_devices, &own_device).await?;
        Ok(report)
    }

    async fn replicated_folders(&self, now_ms: u64) -> Result<Vec<Folder>> {
        let mut folders = Vec::new();
        for spec in self.db.local_apps().await? {
            if !spec.has_replicated_storage() {
                continue;
            }
            let peers = self.registry.locations(&spec.name, now_ms).await?;
            for component in spec.replicated_components() {
                let id = spec.container_name(component);
                let path = self.data_root.join(&id).to_string_lossy().into_owned();
                folders.push(Folder { id, path, peers: peers.clone() });
            }
        }
        Ok(folders)
    }

    /// `(host, device id)` of every peer replica that exposes one.
    async fn peer_devices(&self, peers: &[ApplicationLocation]) -> Vec<(String, String)> {
        let self_host = host_of(&self.state.node_ip);
        let mut out = Vec::new();
        for peer in peers.iter().filter(|p| p.host() != self_host) {
            match self.transport.storage_device_id(&normalize_endpoint(&peer.ip)).await {
                Ok(Some(id)) => out.push((peer.host().to_string(), id)),
                Ok(None) => debug!(peer = %peer.ip, "peer has no storage device id yet"),
                Err(e) => debug!(peer = %peer.ip, error = %e, "device id lookup failed"),
            }
        }
        out
    }

    async fn container_running(&self, name: &str) -> Result<bool> {
        Ok(matches!(self.runtime.inspect(name).await?, Some(c) if c.state == ContainerState::Running))
    }

    async fn step(&self, folder: &Folder, current: Option<&FolderConfig>, devices: &BTreeSet<String>) -> Result<FolderAction> {
        let ctx = FolderContext {
            folder_id: &folder.id,
            configured: current.map(|f| f.folder_type),
            container_running: self.container_running(&folder.id).await?,
            peers: &folder.peers,
            self_ip: &self.state.node_ip,
        };
        let action = self.machine.manage_folder_sync_state(&self.state.sync_folders, self.daemon.as_ref(), &ctx).await;

        match &action {
            FolderAction::ResetAndReceive => {
                self.stop_container(&folder.id).await?;
                self.wipe(&folder.path).await?;
                self.daemon.put_folder(&folder_config(&folder.id, &folder.path, FolderType::ReceiveOnly, devices)).await?;
            }
            FolderAction::Promote(_) => {
                self.daemon.put_folder(&folder_config(&folder.id, &folder.path, FolderType::SendReceive, devices)).await?;
                self.stop_container(&folder.id).await?;
                self.runtime.start(&folder.id).await?;
            }
            FolderAction::StartContainer => {
                self.runtime.start(&folder.id).await?;
            }
            FolderAction::Wait { .. } | FolderAction::AlreadySyncing | FolderAction::SkipFirstTick => {
                if let Some(existing) = current {
                    let wanted: Vec<&str> = devices.iter().map(String::as_str).collect();
                    if existing.device_ids() != wanted {
                        let updated = folder_config(&folder.id, &folder.path, existing.folder_type, devices);
                        self.daemon.put_folder(&updated).await?;
                        debug!(folder = %folder.id, devices = devices.len(), "folder devices updated");
                    }
                }
            }
        }
        Ok(action)
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        match self.runtime.stop(name).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Empty the folder so the replica starts from the peers' copy.
    async fn wipe(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(OrchestratorError::Io(e)),
        }
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    /// Remove managed folders and devices outside the expected sets, then
    /// restart the daemon if its configuration requires it.
    pub async fn diagnose(
        &self,
        expected_folders: &BTreeSet<String>,
        expected_devices: &BTreeSet<String>,
        own_device: &str,
    ) -> Result<DiagnoseReport> {
        let mut report = DiagnoseReport::default();
        for folder in self.daemon.folders().await? {
            if parse_container_name(&folder.id).is_some() && !expected_folders.contains(&folder.id) {
                self.daemon.remove_folder(&folder.id).await?;
                self.state.sync_folders.remove(&folder.id);
                info!(folder = %folder.id, "stale sync folder removed");
                report.removed_folders.push(folder.id);
            }
        }
        for device in self.daemon.devices().await? {
            let managed = device.name.starts_with(DEVICE_NAME_PREFIX);
            if managed && device.device_id != own_device && !expected_devices.contains(&device.device_id) {
                self.daemon.remove_device(&device.device_id).await?;
                info!(device = %device.device_id, "stale peer device removed");
                report.removed_devices.push(device.device_id);
            }
        }
        if self.daemon.restart_required().await? {
            info!("storage daemon requires restart");
            self.daemon.restart().await?;
            report.restarted = true;
        }
        Ok(report)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
