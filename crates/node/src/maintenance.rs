//! Periodic maintenance passes over locally installed applications.
//!
//! | Pass                       | Flag taken | Effect                                  |
//! |----------------------------|------------|-----------------------------------------|
//! | `remove_expired_apps`      | removal    | uninstall expired or unregistered apps  |
//! | `remove_over_provisioned`  | removal    | newest excess replicas remove themselves|
//! | `broadcast_running`        | none       | location heartbeat                      |
//! | `check_node_status`        | none       | refresh `NodeStatus` from the ledger    |
//! | `check_duplicate_apps`     | none       | DOS duplicate detector                  |
//!
//! A failure on one app is recorded in the report and the pass moves on.

use std::sync::Arc;

use tracing::{debug, info, warn};

use skyfleet_common::crypto::sha256_hex;
use skyfleet_proto::{parse_container_name, ApplicationLocation, ApplicationSpecification, PeerMessage};

use crate::dos::InstalledApp;
use crate::error::{OrchestratorError, Result};
use crate::ledger::LedgerDaemon;
use crate::lifecycle::AppLifecycle;
use crate::registry::Registry;
use crate::runtime_service::{ContainerRuntime, ContainerState};
use crate::state::{NodeStatus, OrchestratorState};
use crate::store::AppDatabase;
use crate::transport::{PeerTransport, TransportError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Apps the pass acted on.
    pub processed: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Set when a guard stopped the pass.
    pub skipped: Option<&'static str>,
}

impl MaintenanceReport {
    fn skipped(reason: &'static str) -> Self {
        Self { skipped: Some(reason), ..Self::default() }
    }

    fn fail(&mut self, app: &str, error: &OrchestratorError) {
        warn!(app, error = %error, "maintenance step failed");
        self.failed.push((app.to_string(), error.to_string()));
    }
}

pub struct Maintenance {
    state: Arc<OrchestratorState>,
    db: Arc<dyn AppDatabase>,
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    transport: Arc<dyn PeerTransport>,
    ledger: Arc<dyn LedgerDaemon>,
    lifecycle: Arc<dyn AppLifecycle>,
    instances_slack: u32,
}

/// Oldest replicas first; everything past `instances` is excess.
fn replica_order(a: &ApplicationLocation, b: &ApplicationLocation) -> std::cmp::Ordering {
    let started = |l: &ApplicationLocation| l.running_since.unwrap_or(u64::MAX);
    started(a)
        .cmp(&started(b))
        .then(a.broadcasted_at.cmp(&b.broadcasted_at))
        .then_with(|| a.host().cmp(b.host()))
}

impl Maintenance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<OrchestratorState>,
        db: Arc<dyn AppDatabase>,
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        transport: Arc<dyn PeerTransport>,
        ledger: Arc<dyn LedgerDaemon>,
        lifecycle: Arc<dyn AppLifecycle>,
        instances_slack: u32,
    ) -> Self {
        Self { state, db, registry, runtime, transport, ledger, lifecycle, instances_slack }
    }

    // ════════════════════════════════════════════════════════════════════════
    // REMOVAL PASSES
    // ════════════════════════════════════════════════════════════════════════

    pub async fn remove_expired_apps(&self) -> Result<MaintenanceReport> {
        if !self.state.status().synced {
            return Ok(MaintenanceReport::skipped("ledger not synced"));
        }
        if self.state.installation_in_progress() {
            return Ok(MaintenanceReport::skipped("installation in progress"));
        }
        let Some(_guard) = self.state.try_begin_removal() else {
            return Ok(MaintenanceReport::skipped("removal in progress"));
        };

        let height = self.state.status().height;
        let mut report = MaintenanceReport::default();
        for local in self.db.local_apps().await? {
            let reason = match self.registry.application(&local.name).await {
                Ok(None) => "no longer registered",
                Ok(Some(global)) if self.registry.is_expired(&global, height) => "expired",
                Ok(Some(_)) => continue,
                Err(e) => {
                    report.fail(&local.name, &OrchestratorError::from(e));
                    continue;
                }
            };
            match self.lifecycle.uninstall(&local.name, reason).await {
                Ok(()) => report.processed.push(local.name),
                Err(e) => report.fail(&local.name, &e),
            }
        }
        Ok(report)
    }

    /// Keep `instances` replicas once the fleet runs more than
    /// `instances + slack`; this node removes its own copy when it is
    /// among the newest.
    pub async fn remove_over_provisioned(&self, now_ms: u64) -> Result<MaintenanceReport> {
        if self.state.installation_in_progress() {
            return Ok(MaintenanceReport::skipped("installation in progress"));
        }
        let Some(_guard) = self.state.try_begin_removal() else {
            return Ok(MaintenanceReport::skipped("removal in progress"));
        };

        let mut report = MaintenanceReport::default();
        let self_host = skyfleet_proto::host_of(&self.state.node_ip);
        for local in self.db.local_apps().await? {
            let mut locations = match self.registry.locations(&local.name, now_ms).await {
                Ok(l) => l,
                Err(e) => {
                    report.fail(&local.name, &OrchestratorError::from(e));
                    continue;
                }
            };
            let limit = local.instances as usize + self.instances_slack as usize;
            if locations.len() <= limit {
                continue;
            }
            locations.sort_by(replica_order);
            let excess = locations.iter().skip(local.instances as usize).any(|l| l.host() == self_host);
            if !excess {
                continue;
            }
            info!(app = %local.name, running = locations.len(), wanted = local.instances, "over-provisioned, removing local replica");
            match self.lifecycle.uninstall(&local.name, "over-provisioned").await {
                Ok(()) => report.processed.push(local.name),
                Err(e) => report.fail(&local.name, &e),
            }
        }
        Ok(report)
    }

    // ════════════════════════════════════════════════════════════════════════
    // HEARTBEAT / STATUS
    // ════════════════════════════════════════════════════════════════════════

    async fn is_running(&self, spec: &ApplicationSpecification) -> Result<bool> {
        for name in spec.container_names() {
            if let Some(c) = self.runtime.inspect(&name).await? {
                if c.state == ContainerState::Running {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Refresh and broadcast locations of every local app with a running
    /// container. `running_since` survives across heartbeats.
    pub async fn broadcast_running(&self, now_ms: u64) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let mut locations = Vec::new();
        for local in self.db.local_apps().await? {
            let running = match self.is_running(&local).await {
                Ok(r) => r,
                Err(e) => {
                    report.fail(&local.name, &e);
                    continue;
                }
            };
            let previous = self.registry.location_on_node(&local.name, &self.state.node_ip, now_ms).await?;
            if !running && !local.has_replicated_storage() {
                debug!(app = %local.name, "not running, no heartbeat");
                continue;
            }
            let running_since = if running {
                previous.as_ref().and_then(|p| p.running_since).or(Some(now_ms))
            } else {
                None
            };
            let hash = self.registry.latest_message(&local.name).await?.map(|m| m.hash).unwrap_or_default();
            let location = self.registry.new_location(&local.name, &hash, &self.state.node_ip, now_ms, running_since);
            self.registry.store_location(location.clone(), now_ms).await?;
            report.processed.push(local.name);
            locations.push(location);
        }
        if !locations.is_empty() {
            match self.transport.broadcast(&PeerMessage::AppRunning(locations)).await {
                Ok(_) | Err(TransportError::NoPeers) => {}
                Err(e) => warn!(error = %e, "location heartbeat broadcast failed"),
            }
        }
        Ok(report)
    }

    pub async fn check_node_status(&self, now_ms: u64) -> Result<NodeStatus> {
        let connected_peers = self.transport.connected_peers();
        match self.ledger.status().await {
            Ok(ledger) => {
                let status = NodeStatus {
                    synced: ledger.synced,
                    confirmed: ledger.confirmed,
                    height: ledger.height,
                    connected_peers,
                    updated_at: now_ms,
                };
                self.state.set_status(status.clone());
                Ok(status)
            }
            Err(e) => {
                // Stale status must not let the spawner act
                let mut status = self.state.status();
                status.synced = false;
                status.connected_peers = connected_peers;
                self.state.set_status(status);
                Err(e.into())
            }
        }
    }

    /// Containers of one app name under different casings or specs.
    pub async fn check_duplicate_apps(&self) -> Result<Vec<String>> {
        let mut installed = Vec::new();
        for container in self.runtime.list().await? {
            let Some(identity) = parse_container_name(&container.name) else { continue };
            let hash = match self.db.local_app(&identity.app).await? {
                Some(spec) if spec.name == identity.app => {
                    spec.canonical_json().map(|j| sha256_hex(j.as_bytes())).unwrap_or_default()
                }
                _ => String::new(),
            };
            installed.push(InstalledApp { name: identity.app, hash });
        }
        installed.dedup();
        Ok(self.state.with_dos(|dos| dos.check_duplicate_local_apps(&installed)))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use skyfleet_common::config::{DosSection, LocationSection, RegistrySection};
    use skyfleet_proto::Tier;

    use crate::ledger::LedgerStatus;
    use crate::lifecycle::ContainerLifecycle;
    use crate::mock::{sample_spec, MockLedger, MockRuntime, MockTransport};
    use crate::now_ms;
    use crate::store::MemoryDatabase;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<MemoryDatabase>,
        state: Arc<OrchestratorState>,
        registry: Arc<Registry>,
        runtime: Arc<MockRuntime>,
        ledger: Arc<MockLedger>,
        lifecycle: Arc<ContainerLifecycle>,
        maintenance: Maintenance,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(MemoryDatabase::new());
        let state = Arc::new(OrchestratorState::new("10.0.0.1", Tier::Cumulus, DosSection::default()));
        state.set_status(NodeStatus { synced: true, confirmed: true, height: 1_000, ..NodeStatus::default() });
        let registry = Arc::new(Registry::new(db.clone(), RegistrySection::default(), &LocationSection::default(), 600_000));
        let runtime = Arc::new(MockRuntime::new());
        let transport = Arc::new(MockTransport::with_peers(2));
        let ledger = Arc::new(MockLedger::synced(1_000));
        let lifecycle = Arc::new(ContainerLifecycle::new(
            runtime.clone(),
            db.clone(),
            registry.clone(),
            transport.clone(),
            state.clone(),
            dir.path(),
        ));
        let maintenance = Maintenance::new(
            state.clone(),
            db.clone(),
            registry.clone(),
            runtime.clone(),
            transport,
            ledger.clone(),
            lifecycle.clone(),
            1,
        );
        Fixture { _dir: dir, db, state, registry, runtime, ledger, lifecycle, maintenance }
    }

    async fn install(f: &Fixture, spec: ApplicationSpecification) {
        f.db.upsert_global_app(spec.clone()).await.expect("global");
        f.lifecycle.install(&spec).await.expect("install");
    }

    // ════════════════════════════════════════════════════════════════════════
    // EXPIRY
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_expired_and_unregistered_removed() {
        let f = fixture();
        let mut old = sample_spec("Old", "o");
        old.components[0].ports = vec![31001];
        install(&f, old).await;
        install(&f, sample_spec("Fresh", "o")).await;
        f.db.remove_global_app("Fresh").await.expect("remove");

        let mut live = sample_spec("Live", "o");
        live.components[0].ports = vec![31002];
        live.registration_height = 29_000;
        install(&f, live).await;

        // "Old" registered at 0 with 22000 blocks lasting
        f.state.set_status(NodeStatus { synced: true, confirmed: true, height: 30_000, ..NodeStatus::default() });
        let mut report = f.maintenance.remove_expired_apps().await.expect("pass");
        report.processed.sort();
        assert_eq!(report.processed, vec!["Fresh".to_string(), "Old".to_string()]);

        assert!(!f.state.removal_in_progress());
    }

    #[tokio::test]
    async fn test_expiry_pass_respects_flags() {
        let f = fixture();
        let _guard = f.state.try_begin_installation().expect("flag");
        let report = f.maintenance.remove_expired_apps().await.expect("pass");
        assert_eq!(report.skipped, Some("installation in progress"));
    }

    // ════════════════════════════════════════════════════════════════════════
    // OVER-PROVISION
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_newest_replica_removes_itself() {
        let f = fixture();
        let mut spec = sample_spec("Shop", "o");
        spec.instances = 1;
        install(&f, spec).await;
        let now = now_ms();
        // Local replica is the newest of three (slack 1, so 3 > 2)
        for (ip, since) in [("10.0.0.5", 10), ("10.0.0.6", 20)] {
            let loc = f.registry.new_location("Shop", "h", ip, now, Some(since));
            f.registry.store_location(loc, now).await.expect("store");
        }
        let report = f.maintenance.remove_over_provisioned(now).await.expect("pass");
        assert_eq!(report.processed, vec!["Shop".to_string()]);
        assert!(f.db.local_app("Shop").await.expect("q").is_none());
    }

    #[tokio::test]
    async fn test_oldest_replica_stays() {
        let f = fixture();
        let mut spec = sample_spec("Shop", "o");
        spec.instances = 1;
        install(&f, spec).await;
        let now = now_ms();
        let own = f.registry.new_location("Shop", "h", "10.0.0.1", now, Some(1));
        f.registry.store_location(own, now).await.expect("store");
        for (ip, since) in [("10.0.0.5", 10), ("10.0.0.6", 20)] {
            let loc = f.registry.new_location("Shop", "h", ip, now, Some(since));
            f.registry.store_location(loc, now).await.expect("store");
        }
        let report = f.maintenance.remove_over_provisioned(now).await.expect("pass");
        assert!(report.processed.is_empty());
    }

    // ════════════════════════════════════════════════════════════════════════
    // HEARTBEAT / STATUS / DUPLICATES
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_heartbeat_keeps_running_since() {
        let f = fixture();
        install(&f, sample_spec("Shop", "o")).await;
        let first = f.registry.location_on_node("Shop", "10.0.0.1", now_ms()).await.expect("q").expect("loc");

        let later = now_ms() + 60_000;
        let report = f.maintenance.broadcast_running(later).await.expect("pass");
        assert_eq!(report.processed, vec!["Shop".to_string()]);
        let loc = f.registry.location_on_node("Shop", "10.0.0.1", later).await.expect("q").expect("loc");
        assert_eq!(loc.running_since, first.running_since);
        assert_eq!(loc.broadcasted_at, later);
    }

    #[tokio::test]
    async fn test_stopped_app_gets_no_heartbeat() {
        let f = fixture();
        install(&f, sample_spec("Shop", "o")).await;
        f.runtime.stop("fluxweb_Shop").await.expect("stop");
        let report = f.maintenance.broadcast_running(now_ms()).await.expect("pass");
        assert!(report.processed.is_empty());
    }

    #[tokio::test]
    async fn test_node_status_refresh_and_failure() {
        let f = fixture();
        f.ledger.set_status(LedgerStatus { synced: true, height: 1_234, confirmed: false });
        let status = f.maintenance.check_node_status(5).await.expect("status");
        assert_eq!(status.height, 1_234);
        assert!(!f.state.status().confirmed);
        assert_eq!(f.state.status().connected_peers, 2);

        f.ledger.set_offline(true);
        assert!(f.maintenance.check_node_status(6).await.is_err());
        assert!(!f.state.status().synced);
    }

    #[tokio::test]
    async fn test_duplicate_casing_raises_dos() {
        let f = fixture();
        install(&f, sample_spec("web", "o")).await;
        f.runtime.add_container("fluxweb_Web", ContainerState::Running);
        let dups = f.maintenance.check_duplicate_apps().await.expect("check");
        assert_eq!(dups, vec!["web".to_string()]);
        assert!(f.state.is_dos());
    }
}
