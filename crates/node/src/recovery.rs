//! Reconcile stopped local containers with the location book.
//!
//! ```text
//! stopped container ──▶ local app? ── no ──▶ ignored
//!                            │
//!                       replicated? ── yes ──▶ left to the replication monitor
//!                            │
//!            unexpired own location? ── yes / lookup failed ──▶ start
//!                            │ no
//!                            ▼
//!                        uninstall
//! ```
//!
//! The location lookup fails open: ambiguous data restarts a container,
//! it never destroys one.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use skyfleet_proto::parse_container_name;

use crate::error::{OrchestratorError, Result};
use crate::lifecycle::AppLifecycle;
use crate::runtime_service::ContainerRuntime;
use crate::state::OrchestratorState;
use crate::store::AppDatabase;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub started: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// True when `ip` holds an unexpired location of `name`; true on lookup error.
///
/// Only `expire_at` of the records is read.
pub async fn app_has_valid_location_on_node(db: &dyn AppDatabase, name: &str, ip: &str, now_ms: u64) -> bool {
    match db.location_expiries(name, ip).await {
        Ok(expiries) => expiries.iter().any(|&expire_at| expire_at > now_ms),
        Err(e) => {
            warn!(app = name, error = %e, "location lookup failed, assuming valid");
            true
        }
    }
}

pub struct RecoveryReconciler {
    state: Arc<OrchestratorState>,
    db: Arc<dyn AppDatabase>,
    runtime: Arc<dyn ContainerRuntime>,
    lifecycle: Arc<dyn AppLifecycle>,
}

impl RecoveryReconciler {
    pub fn new(
        state: Arc<OrchestratorState>,
        db: Arc<dyn AppDatabase>,
        runtime: Arc<dyn ContainerRuntime>,
        lifecycle: Arc<dyn AppLifecycle>,
    ) -> Self {
        Self { state, db, runtime, lifecycle }
    }

    pub async fn recover_stopped_apps(&self, now_ms: u64) -> Result<RecoveryReport> {
        if self.state.installation_in_progress() {
            return Err(OrchestratorError::Busy("installation in progress"));
        }
        let Some(_guard) = self.state.try_begin_removal() else {
            return Err(OrchestratorError::Busy("removal in progress"));
        };

        // app name -> stopped containers
        let mut stopped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for container in self.runtime.list().await? {
            if !container.state.is_stopped() {
                continue;
            }
            if let Some(identity) = parse_container_name(&container.name) {
                stopped.entry(identity.app).or_default().push(container.name);
            }
        }

        let mut report = RecoveryReport::default();
        for (app, containers) in stopped {
            let spec = match self.db.local_app(&app).await {
                Ok(Some(spec)) => spec,
                Ok(None) => continue,
                Err(e) => {
                    warn!(app = %app, error = %e, "local app lookup failed");
                    report.failed.push(app);
                    continue;
                }
            };
            if spec.has_replicated_storage() {
                continue;
            }

            if app_has_valid_location_on_node(self.db.as_ref(), &spec.name, &self.state.node_ip, now_ms).await {
                match self.start_all(&containers).await {
                    Ok(()) => report.started.push(spec.name),
                    Err(e) => {
                        warn!(app = %spec.name, error = %e, "restart failed");
                        report.failed.push(spec.name);
                    }
                }
            } else {
                match self.lifecycle.uninstall(&spec.name, "no live location").await {
                    Ok(()) => report.removed.push(spec.name),
                    Err(e) => {
                        warn!(app = %spec.name, error = %e, "removal failed");
                        report.failed.push(spec.name);
                    }
                }
            }
        }

        report.started.sort();
        report.removed.sort();
        report.failed.sort();
        info!(
            started = report.started.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "recovery pass finished"
        );
        Ok(report)
    }

    async fn start_all(&self, containers: &[String]) -> Result<()> {
        for name in containers {
            self.runtime.start(name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyfleet_common::config::{DosSection, LocationSection, RegistrySection};
    use skyfleet_proto::Tier;

    use crate::lifecycle::ContainerLifecycle;
    use crate::mock::{replicated_spec, sample_spec, MockRuntime, MockTransport};
    use crate::registry::Registry;
    use crate::runtime_service::ContainerState;
    use crate::store::MemoryDatabase;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<MemoryDatabase>,
        registry: Arc<Registry>,
        runtime: Arc<MockRuntime>,
        state: Arc<OrchestratorState>,
        reconciler: RecoveryReconciler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(MemoryDatabase::new());
        let registry = Arc::new(Registry::new(db.clone(), RegistrySection::default(), &LocationSection::default(), 600_000));
        let runtime = Arc::new(MockRuntime::new());
        let state = Arc::new(OrchestratorState::new("10.0.0.1", Tier::Cumulus, DosSection::default()));
        let lifecycle = Arc::new(ContainerLifecycle::new(
            runtime.clone(),
            db.clone(),
            registry.clone(),
            Arc::new(MockTransport::new()),
            state.clone(),
            dir.path(),
        ));
        let reconciler = RecoveryReconciler::new(state.clone(), db.clone(), runtime.clone(), lifecycle);
        Fixture { _dir: dir, db, registry, runtime, state, reconciler }
    }

    #[tokio::test]
    async fn test_lookup_failure_is_valid() {
        let f = fixture();
        assert!(!app_has_valid_location_on_node(f.db.as_ref(), "Shop", "10.0.0.1", 1_000).await);
        f.db.set_unavailable(true);
        assert!(app_has_valid_location_on_node(f.db.as_ref(), "Shop", "10.0.0.1", 1_000).await);
    }

    #[tokio::test]
    async fn test_replicated_and_unknown_skipped() {
        let f = fixture();
        f.db.upsert_local_app(replicated_spec("Vault", "o")).await.expect("local");
        f.runtime.add_container("fluxweb_Vault", ContainerState::Exited);
        f.runtime.add_container("fluxweb_Stranger", ContainerState::Exited);
        f.runtime.add_container("nginx", ContainerState::Exited);

        let report = f.reconciler.recover_stopped_apps(1_000).await.expect("pass");
        assert_eq!(report, RecoveryReport::default());
        assert_eq!(f.runtime.state("fluxweb_Vault"), Some(ContainerState::Exited));
    }

    #[tokio::test]
    async fn test_busy_while_removal_held() {
        let f = fixture();
        let _guard = f.state.try_begin_removal().expect("flag");
        let err = f.reconciler.recover_stopped_apps(1_000).await.expect_err("busy");
        assert!(matches!(err, OrchestratorError::Busy(_)));
    }

    #[tokio::test]
    async fn test_restart_failure_isolated() {
        let f = fixture();
        let now = 1_000;
        for name in ["AppA", "AppB"] {
            f.db.upsert_local_app(sample_spec(name, "o")).await.expect("local");
            f.runtime.add_container(&format!("fluxweb_{}", name), ContainerState::Exited);
            let loc = f.registry.new_location(name, "h", "10.0.0.1", now, Some(now));
            f.registry.store_location(loc, now).await.expect("store");
        }
        f.runtime.fail_start("fluxweb_AppA");

        let report = f.reconciler.recover_stopped_apps(now).await.expect("pass");
        assert_eq!(report.started, vec!["AppB".to_string()]);
        assert_eq!(report.failed, vec!["AppA".to_string()]);
    }
}
