//! Orchestrator state shared by every component.
//!
//! One `OrchestratorState` is created by the node and handed out as
//! `Arc<OrchestratorState>`. It holds the two lifecycle flags, the last
//! node status, the DOS scoreboard, the install-error cache, the port
//! reservations of in-flight installs and the sync-folder table.
//!
//! The lifecycle flags approximate a single writer: a component that
//! mutates local app state takes a [`FlagGuard`] first and gives up the
//! pass when the flag is already held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use skyfleet_common::config::DosSection;
use skyfleet_proto::Tier;

use crate::dos::{DosSnapshot, DosState};
use crate::replication::folder_state::SyncFolderTable;

/// Ledger and network view of this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub synced: bool,
    pub confirmed: bool,
    pub height: u64,
    pub connected_peers: usize,
    pub updated_at: u64,
}

/// RAII guard that clears its flag on drop.
#[derive(Debug)]
pub struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

fn try_acquire(flag: &AtomicBool) -> Option<FlagGuard<'_>> {
    flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .ok()
        .map(|_| FlagGuard { flag })
}

/// Ports held by an install between reservation and completion.
#[derive(Debug)]
pub struct PortReservation<'a> {
    owner: &'a Mutex<HashMap<u16, String>>,
    ports: Vec<u16>,
}

impl Drop for PortReservation<'_> {
    fn drop(&mut self) {
        let mut reserved = self.owner.lock();
        for port in &self.ports {
            reserved.remove(port);
        }
    }
}

#[derive(Debug, Clone)]
struct InstallError {
    reason: String,
    expire_at: u64,
}

pub struct OrchestratorState {
    pub node_ip: String,
    pub tier: Tier,
    installation_in_progress: AtomicBool,
    removal_in_progress: AtomicBool,
    status: RwLock<NodeStatus>,
    dos: RwLock<DosState>,
    install_errors: Mutex<HashMap<String, InstallError>>,
    reserved_ports: Mutex<HashMap<u16, String>>,
    pub sync_folders: SyncFolderTable,
}

impl OrchestratorState {
    pub fn new(node_ip: impl Into<String>, tier: Tier, dos: DosSection) -> Self {
        Self {
            node_ip: node_ip.into(),
            tier,
            installation_in_progress: AtomicBool::new(false),
            removal_in_progress: AtomicBool::new(false),
            status: RwLock::new(NodeStatus::default()),
            dos: RwLock::new(DosState::new(dos)),
            install_errors: Mutex::new(HashMap::new()),
            reserved_ports: Mutex::new(HashMap::new()),
            sync_folders: SyncFolderTable::new(),
        }
    }

    // ── lifecycle flags ──

    pub fn installation_in_progress(&self) -> bool {
        self.installation_in_progress.load(Ordering::SeqCst)
    }

    pub fn removal_in_progress(&self) -> bool {
        self.removal_in_progress.load(Ordering::SeqCst)
    }

    pub fn try_begin_installation(&self) -> Option<FlagGuard<'_>> {
        try_acquire(&self.installation_in_progress)
    }

    pub fn try_begin_removal(&self) -> Option<FlagGuard<'_>> {
        try_acquire(&self.removal_in_progress)
    }

    /// Either flag held.
    pub fn lifecycle_busy(&self) -> bool {
        self.installation_in_progress() || self.removal_in_progress()
    }

    // ── node status ──

    pub fn status(&self) -> NodeStatus {
        self.status.read().clone()
    }

    pub fn set_status(&self, status: NodeStatus) {
        *self.status.write() = status;
    }

    // ── DOS ──

    pub fn with_dos<R>(&self, f: impl FnOnce(&mut DosState) -> R) -> R {
        f(&mut self.dos.write())
    }

    pub fn is_dos(&self) -> bool {
        self.dos.read().is_dos()
    }

    pub fn dos_snapshot(&self) -> DosSnapshot {
        self.dos.read().snapshot()
    }

    // ── install error cache ──

    pub fn record_install_error(&self, app: &str, reason: impl Into<String>, now_ms: u64, ttl_ms: u64) {
        self.install_errors.lock().insert(
            app.to_ascii_lowercase(),
            InstallError { reason: reason.into(), expire_at: now_ms.saturating_add(ttl_ms) },
        );
    }

    /// Reason of an install failure of `app` that has not yet expired.
    pub fn recent_install_error(&self, app: &str, now_ms: u64) -> Option<String> {
        self.install_errors
            .lock()
            .get(&app.to_ascii_lowercase())
            .filter(|e| e.expire_at > now_ms)
            .map(|e| e.reason.clone())
    }

    pub fn purge_install_errors(&self, now_ms: u64) -> usize {
        let mut errors = self.install_errors.lock();
        let before = errors.len();
        errors.retain(|_, e| e.expire_at > now_ms);
        before - errors.len()
    }

    // ── port reservations ──

    /// Reserve `ports` for `app`. Fails with the first port held by another app.
    pub fn reserve_ports(&self, app: &str, ports: &[u16]) -> Result<PortReservation<'_>, (u16, String)> {
        let mut reserved = self.reserved_ports.lock();
        for port in ports {
            if let Some(holder) = reserved.get(port) {
                if !holder.eq_ignore_ascii_case(app) {
                    return Err((*port, holder.clone()));
                }
            }
        }
        let mut taken = Vec::with_capacity(ports.len());
        for port in ports {
            if !reserved.contains_key(port) {
                reserved.insert(*port, app.to_string());
                taken.push(*port);
            }
        }
        Ok(PortReservation { owner: &self.reserved_ports, ports: taken })
    }

    pub fn reserved_port_count(&self) -> usize {
        self.reserved_ports.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> OrchestratorState {
        OrchestratorState::new("10.0.0.1", Tier::Cumulus, DosSection::default())
    }

    #[test]
    fn test_flag_guard_exclusive_and_released() {
        let s = state();
        let guard = s.try_begin_installation().expect("first");
        assert!(s.installation_in_progress());
        assert!(s.try_begin_installation().is_none());
        assert!(s.lifecycle_busy());
        drop(guard);
        assert!(!s.installation_in_progress());
        assert!(s.try_begin_removal().is_some());
    }

    #[test]
    fn test_install_error_cache_expiry() {
        let s = state();
        s.record_install_error("Web", "no capacity", 1_000, 500);
        assert_eq!(s.recent_install_error("web", 1_200).as_deref(), Some("no capacity"));
        assert!(s.recent_install_error("web", 1_500).is_none());
        assert_eq!(s.purge_install_errors(1_500), 1);
    }

    #[test]
    fn test_port_reservation_released_on_drop() {
        let s = state();
        let r = s.reserve_ports("a", &[31000, 31001]).expect("reserve");
        assert_eq!(s.reserve_ports("b", &[31001]).err(), Some((31001, "a".to_string())));
        drop(r);
        assert_eq!(s.reserved_port_count(), 0);
        assert!(s.reserve_ports("b", &[31001]).is_ok());
    }

    #[test]
    fn test_dos_access() {
        let s = state();
        s.with_dos(|d| d.raise(100, "mount"));
        assert!(s.is_dos());
        assert_eq!(s.dos_snapshot().dos_state, 100);
    }
}
