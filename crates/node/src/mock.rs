//! In-memory stand-ins for every external seam of the orchestrator.
//!
//! Used by unit tests and the `tests/` suite to drive whole passes
//! (spawn, maintenance, recovery, replication) without a container
//! runtime, a ledger daemon, peers or a storage daemon.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use skyfleet_common::content_hash;
use skyfleet_common::crypto::{ethereum_address, sign_ethereum_message};
use skyfleet_proto::{
    ApplicationMessage, ApplicationSpecification, ComponentSpecification, ContainerData, LedgerHashRecord,
    MessageKind, NodeRecord, PeerMessage,
};

use crate::images::{ImageError, ImageManifest, ImageRegistry};
use crate::ledger::{LedgerDaemon, LedgerError, LedgerStatus};
use crate::replication::syncthing::{DaemonError, DeviceConfig, FolderCompletion, FolderConfig, StorageDaemon};
use crate::runtime_service::{ContainerConfig, ContainerRuntime, ContainerState, ContainerSummary, RuntimeError};
use crate::transport::{PeerTransport, TransportError};

/// Secret key of the owner used by the fixtures.
pub const OWNER_SECRET: [u8; 32] = [7u8; 32];
/// A second, unrelated key.
pub const OTHER_SECRET: [u8; 32] = [9u8; 32];

// ════════════════════════════════════════════════════════════════════════════
// FIXTURES
// ════════════════════════════════════════════════════════════════════════════

pub fn sample_component(name: &str, port: u16) -> ComponentSpecification {
    ComponentSpecification {
        name: name.to_string(),
        description: format!("{} component", name),
        repotag: "runonflux/website:latest".to_string(),
        ports: vec![port],
        container_ports: vec![80],
        environment: vec![],
        commands: vec![],
        container_data: ContainerData::local("/appdata"),
        cpu: 0.5,
        ram: 500.0,
        hdd: 5.0,
        tiered_resources: None,
    }
}

/// Version 4 app with one `web` component on port 31000.
pub fn sample_spec(name: &str, owner: &str) -> ApplicationSpecification {
    ApplicationSpecification {
        version: 4,
        name: name.to_string(),
        description: format!("{} application", name),
        owner: owner.to_string(),
        instances: 3,
        expire: None,
        registration_height: 0,
        enterprise: false,
        geolocation: vec![],
        nodes: vec![],
        tiered: false,
        components: vec![sample_component("web", 31000)],
    }
}

/// Same as [`sample_spec`] with the component volume replicated.
pub fn replicated_spec(name: &str, owner: &str) -> ApplicationSpecification {
    let mut spec = sample_spec(name, owner);
    spec.components[0].container_data = ContainerData::replicated("/appdata");
    spec
}

/// Message signed with `secret` and hashed. Fields that fail to encode
/// are left empty so verification rejects the message.
pub fn signed_message(
    secret: &[u8],
    specification: ApplicationSpecification,
    kind: MessageKind,
    timestamp: u64,
) -> ApplicationMessage {
    let mut message = ApplicationMessage {
        hash: String::new(),
        kind,
        version: specification.version,
        specification,
        owner_address: ethereum_address(secret).unwrap_or_default(),
        signature: String::new(),
        timestamp,
        height: None,
        value_paid: None,
    };
    if let Ok(payload) = message.signing_payload() {
        message.signature = sign_ethereum_message(secret, payload.as_bytes()).unwrap_or_default();
    }
    message.hash = content_hash(&message).unwrap_or_default();
    message
}

// ════════════════════════════════════════════════════════════════════════════
// IMAGE REGISTRY
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MockImageRegistry {
    manifests: HashMap<String, ImageManifest>,
    unavailable: AtomicBool,
}

impl MockImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, repotag: &str, architectures: &[&str], size_bytes: u64) -> Self {
        self.manifests.insert(
            repotag.to_string(),
            ImageManifest {
                repotag: repotag.to_string(),
                architectures: architectures.iter().map(|a| a.to_string()).collect::<BTreeSet<_>>(),
                size_bytes,
            },
        );
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageRegistry for MockImageRegistry {
    async fn manifest(&self, repotag: &str) -> Result<ImageManifest, ImageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ImageError::Unavailable("mock registry offline".into()));
        }
        self.manifests.get(repotag).cloned().ok_or_else(|| ImageError::NotFound(repotag.to_string()))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CONTAINER RUNTIME
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MockRuntime {
    containers: Mutex<BTreeMap<String, ContainerSummary>>,
    fail_start: Mutex<HashSet<String>>,
    fail_create: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(self, name: &str, state: ContainerState) -> Self {
        self.add_container(name, state);
        self
    }

    pub fn add_container(&self, name: &str, state: ContainerState) {
        self.containers.lock().insert(
            name.to_string(),
            ContainerSummary { name: name.to_string(), state, image: "runonflux/website:latest".into() },
        );
    }

    /// Make every `start` of `name` fail.
    pub fn fail_start(&self, name: &str) {
        self.fail_start.lock().insert(name.to_string());
    }

    pub fn fail_create(&self, name: &str) {
        self.fail_create.lock().insert(name.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn state(&self, name: &str) -> Option<ContainerState> {
        self.containers.lock().get(name).map(|c| c.state)
    }

    pub fn names(&self) -> Vec<String> {
        self.containers.lock().keys().cloned().collect()
    }

    /// `op name` of every call in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, op: &str, name: &str) -> Result<(), RuntimeError> {
        self.calls.lock().push(format!("{} {}", op, name));
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unreachable("mock runtime down".into()));
        }
        Ok(())
    }

    fn set_state(&self, name: &str, state: ContainerState) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock();
        let container = containers.get_mut(name).ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        container.state = state;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.record("list", "*")?;
        Ok(self.containers.lock().values().cloned().collect())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError> {
        self.record("inspect", name)?;
        Ok(self.containers.lock().get(name).cloned())
    }

    async fn create(&self, config: &ContainerConfig) -> Result<(), RuntimeError> {
        self.record("create", &config.name)?;
        if self.fail_create.lock().contains(&config.name) {
            return Err(RuntimeError::CommandFailed {
                command: format!("create {}", config.name),
                stderr: "error while mounting volume: no such device".into(),
            });
        }
        self.containers.lock().insert(
            config.name.clone(),
            ContainerSummary { name: config.name.clone(), state: ContainerState::Created, image: config.image.clone() },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("start", name)?;
        if self.fail_start.lock().contains(name) {
            return Err(RuntimeError::CommandFailed { command: format!("start {}", name), stderr: "mock failure".into() });
        }
        self.set_state(name, ContainerState::Running)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("stop", name)?;
        self.set_state(name, ContainerState::Exited)
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("remove", name)?;
        self.containers
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PEER TRANSPORT
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MockTransport {
    peers: RwLock<Vec<String>>,
    broadcasts: Mutex<Vec<PeerMessage>>,
    direct: Mutex<Vec<(String, PeerMessage)>>,
    device_ids: Mutex<HashMap<String, String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` peers named `10.1.0.{i}:16127`.
    pub fn with_peers(count: usize) -> Self {
        let t = Self::default();
        t.set_peers((1..=count).map(|i| format!("10.1.0.{}:16127", i)).collect());
        t
    }

    pub fn set_peers(&self, peers: Vec<String>) {
        *self.peers.write() = peers;
    }

    pub fn set_device_id(&self, peer_ip: &str, device_id: &str) {
        self.device_ids.lock().insert(peer_ip.to_string(), device_id.to_string());
    }

    pub fn broadcasts(&self) -> Vec<PeerMessage> {
        self.broadcasts.lock().clone()
    }

    pub fn direct(&self) -> Vec<(String, PeerMessage)> {
        self.direct.lock().clone()
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn broadcast(&self, message: &PeerMessage) -> Result<usize, TransportError> {
        let count = self.peers.read().len();
        if count == 0 {
            return Err(TransportError::NoPeers);
        }
        self.broadcasts.lock().push(message.clone());
        Ok(count)
    }

    async fn send_to(&self, peer: &str, message: &PeerMessage) -> Result<(), TransportError> {
        self.direct.lock().push((peer.to_string(), message.clone()));
        Ok(())
    }

    fn connected_peers(&self) -> usize {
        self.peers.read().len()
    }

    fn peers(&self) -> Vec<String> {
        self.peers.read().clone()
    }

    async fn storage_device_id(&self, peer: &str) -> Result<Option<String>, TransportError> {
        let host = skyfleet_proto::host_of(peer);
        Ok(self.device_ids.lock().get(host).cloned())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// LEDGER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MockLedger {
    status: Mutex<LedgerStatus>,
    hashes: Mutex<Vec<LedgerHashRecord>>,
    nodes: Mutex<Vec<NodeRecord>>,
    offline: AtomicBool,
}

impl MockLedger {
    /// Synced and confirmed at `height`.
    pub fn synced(height: u64) -> Self {
        let ledger = Self::default();
        ledger.set_status(LedgerStatus { synced: true, height, confirmed: true });
        ledger
    }

    pub fn set_status(&self, status: LedgerStatus) {
        *self.status.lock() = status;
    }

    pub fn push_hash(&self, record: LedgerHashRecord) {
        self.hashes.lock().push(record);
    }

    pub fn set_nodes(&self, nodes: Vec<NodeRecord>) {
        *self.nodes.lock() = nodes;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::Request("mock ledger offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerDaemon for MockLedger {
    async fn status(&self) -> Result<LedgerStatus, LedgerError> {
        self.check()?;
        Ok(*self.status.lock())
    }

    async fn app_hashes(&self, from: u64, to: u64) -> Result<Vec<LedgerHashRecord>, LedgerError> {
        self.check()?;
        let mut found: Vec<LedgerHashRecord> =
            self.hashes.lock().iter().filter(|r| r.height >= from && r.height <= to).cloned().collect();
        found.sort_by_key(|r| r.height);
        Ok(found)
    }

    async fn node_list(&self) -> Result<Vec<NodeRecord>, LedgerError> {
        self.check()?;
        Ok(self.nodes.lock().clone())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// STORAGE DAEMON
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct MockStorageDaemon {
    device_id: String,
    folders: Mutex<BTreeMap<String, FolderConfig>>,
    devices: Mutex<BTreeMap<String, DeviceConfig>>,
    completions: Mutex<HashMap<String, FolderCompletion>>,
    restart_required: AtomicBool,
    restarts: AtomicU64,
    offline: AtomicBool,
}

impl MockStorageDaemon {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            folders: Mutex::new(BTreeMap::new()),
            devices: Mutex::new(BTreeMap::new()),
            completions: Mutex::new(HashMap::new()),
            restart_required: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_completion(&self, folder: &str, global_bytes: u64, need_bytes: u64) {
        self.completions
            .lock()
            .insert(folder.to_string(), FolderCompletion { completion: 0.0, global_bytes, need_bytes });
    }

    pub fn set_restart_required(&self, required: bool) {
        self.restart_required.store(required, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn insert_folder(&self, folder: FolderConfig) {
        self.folders.lock().insert(folder.id.clone(), folder);
    }

    pub fn folder(&self, id: &str) -> Option<FolderConfig> {
        self.folders.lock().get(id).cloned()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.lock().keys().cloned().collect()
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), DaemonError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DaemonError::Request("mock daemon offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDaemon for MockStorageDaemon {
    async fn completion(&self, folder: &str) -> Result<FolderCompletion, DaemonError> {
        self.check()?;
        self.completions
            .lock()
            .get(folder)
            .copied()
            .ok_or_else(|| DaemonError::Status { status: 404, body: format!("no such folder {}", folder) })
    }

    async fn folders(&self) -> Result<Vec<FolderConfig>, DaemonError> {
        self.check()?;
        Ok(self.folders.lock().values().cloned().collect())
    }

    async fn put_folder(&self, folder: &FolderConfig) -> Result<(), DaemonError> {
        self.check()?;
        self.folders.lock().insert(folder.id.clone(), folder.clone());
        Ok(())
    }

    async fn remove_folder(&self, folder: &str) -> Result<(), DaemonError> {
        self.check()?;
        self.folders.lock().remove(folder);
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<DeviceConfig>, DaemonError> {
        self.check()?;
        Ok(self.devices.lock().values().cloned().collect())
    }

    async fn put_device(&self, device: &DeviceConfig) -> Result<(), DaemonError> {
        self.check()?;
        self.devices.lock().insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn remove_device(&self, device_id: &str) -> Result<(), DaemonError> {
        self.check()?;
        self.devices.lock().remove(device_id);
        Ok(())
    }

    async fn device_id(&self) -> Result<String, DaemonError> {
        self.check()?;
        Ok(self.device_id.clone())
    }

    async fn restart(&self) -> Result<(), DaemonError> {
        self.check()?;
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.restart_required.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn restart_required(&self) -> Result<bool, DaemonError> {
        self.check()?;
        Ok(self.restart_required.load(Ordering::SeqCst))
    }
}
