//! Spawner: pick one under-provisioned application and install it here.
//!
//! ## Pass
//!
//! ```text
//! guards ─▶ candidates ─▶ probability ─▶ jitter sleep ─▶ guards again
//!                                                            │
//!   install ◀─ installing marker ◀─ image/arch ◀─ reserve ports ◀─ capacity ◀─ structure
//! ```
//!
//! Random probability and jitter spread installs over the fleet so that
//! fewer nodes pick the same app in the same window. Any failure after a
//! candidate is chosen is cached per app for `error_ttl_ms`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use skyfleet_common::config::SpawnerSection;
use skyfleet_proto::{ApplicationSpecification, PeerMessage};

use crate::admission::{Admission, ValidationError};
use crate::error::{OrchestratorError, Result};
use crate::images::ImageRegistry;
use crate::lifecycle::AppLifecycle;
use crate::now_ms;
use crate::registry::Registry;
use crate::state::OrchestratorState;
use crate::store::AppDatabase;
use crate::transport::{PeerTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnSkip {
    InstallInProgress,
    RemovalInProgress,
    NotSynced,
    NotConfirmed,
    NotEnoughPeers,
    Dos,
    NoCandidate,
    Probability,
    /// The candidate stopped needing an instance during the jitter delay.
    Raced,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpawnOutcome {
    Skipped(SpawnSkip),
    Installed { name: String },
    Failed { name: String, reason: String },
}

pub struct Spawner {
    state: Arc<OrchestratorState>,
    registry: Arc<Registry>,
    db: Arc<dyn AppDatabase>,
    admission: Arc<Admission>,
    images: Arc<dyn ImageRegistry>,
    transport: Arc<dyn PeerTransport>,
    lifecycle: Arc<dyn AppLifecycle>,
    config: SpawnerSection,
    min_peers: usize,
    geolocation: Option<String>,
}

/// Allow-list check of `entries` against the node region. Entries are
/// region prefixes; a leading `!` excludes.
fn geolocation_allows(entries: &[String], node: Option<&str>) -> bool {
    if entries.is_empty() {
        return true;
    }
    let region = node.unwrap_or_default();
    let (excluded, included): (Vec<&String>, Vec<&String>) = entries.iter().partition(|e| e.starts_with('!'));
    if excluded.iter().any(|e| !region.is_empty() && region.starts_with(&e[1..])) {
        return false;
    }
    included.is_empty() || included.iter().any(|e| !region.is_empty() && region.starts_with(e.as_str()))
}

impl Spawner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<OrchestratorState>,
        registry: Arc<Registry>,
        db: Arc<dyn AppDatabase>,
        admission: Arc<Admission>,
        images: Arc<dyn ImageRegistry>,
        transport: Arc<dyn PeerTransport>,
        lifecycle: Arc<dyn AppLifecycle>,
        config: SpawnerSection,
        min_peers: usize,
        geolocation: Option<String>,
    ) -> Self {
        Self { state, registry, db, admission, images, transport, lifecycle, config, min_peers, geolocation }
    }

    fn guards(&self) -> Option<SpawnSkip> {
        if self.state.installation_in_progress() {
            return Some(SpawnSkip::InstallInProgress);
        }
        if self.state.removal_in_progress() {
            return Some(SpawnSkip::RemovalInProgress);
        }
        let status = self.state.status();
        if !status.synced {
            return Some(SpawnSkip::NotSynced);
        }
        if !status.confirmed {
            return Some(SpawnSkip::NotConfirmed);
        }
        if self.transport.connected_peers() < self.min_peers {
            return Some(SpawnSkip::NotEnoughPeers);
        }
        if self.state.is_dos() {
            return Some(SpawnSkip::Dos);
        }
        None
    }

    fn allowed_here(&self, spec: &ApplicationSpecification) -> bool {
        if spec.enterprise && !self.config.enterprise_allowed {
            return false;
        }
        let node_host = skyfleet_proto::host_of(&self.state.node_ip);
        if !spec.nodes.is_empty() && !spec.nodes.iter().any(|n| skyfleet_proto::host_of(n) == node_host) {
            return false;
        }
        geolocation_allows(&spec.geolocation, self.geolocation.as_deref())
    }

    async fn needs_instance(&self, spec: &ApplicationSpecification, now: u64) -> Result<bool> {
        let running = self.registry.locations(&spec.name, now).await?.len();
        let installing = self.registry.installing(&spec.name, now).await?.len();
        Ok(running + installing < spec.instances as usize)
    }

    /// Registered apps this node could host right now.
    pub async fn candidates(&self, now: u64) -> Result<Vec<ApplicationSpecification>> {
        let height = self.state.status().height;
        let installed: HashSet<String> = self.db.local_apps().await?.iter().map(|s| s.key()).collect();
        let mut out = Vec::new();
        for spec in self.registry.applications().await? {
            if installed.contains(&spec.key())
                || self.registry.is_expired(&spec, height)
                || self.state.recent_install_error(&spec.name, now).is_some()
                || !self.allowed_here(&spec)
            {
                continue;
            }
            if self.needs_instance(&spec, now).await? {
                out.push(spec);
            }
        }
        Ok(out)
    }

    pub async fn try_spawn_once(&self) -> Result<SpawnOutcome> {
        if let Some(skip) = self.guards() {
            debug!(?skip, "spawn pass skipped");
            return Ok(SpawnOutcome::Skipped(skip));
        }
        let candidates = self.candidates(now_ms()).await?;
        let (spec, roll, jitter_ms) = {
            let mut rng = rand::thread_rng();
            let Some(spec) = candidates.choose(&mut rng).cloned() else {
                return Ok(SpawnOutcome::Skipped(SpawnSkip::NoCandidate));
            };
            let jitter = if self.config.max_jitter_ms == 0 { 0 } else { rng.gen_range(0..=self.config.max_jitter_ms) };
            (spec, rng.gen::<f64>(), jitter)
        };
        if roll >= self.config.install_probability {
            debug!(app = %spec.name, "install probability not met");
            return Ok(SpawnOutcome::Skipped(SpawnSkip::Probability));
        }
        if jitter_ms > 0 {
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }

        if let Some(skip) = self.guards() {
            return Ok(SpawnOutcome::Skipped(skip));
        }
        let now = now_ms();
        if !self.needs_instance(&spec, now).await? || self.db.local_app(&spec.name).await?.is_some() {
            info!(app = %spec.name, "candidate satisfied during delay");
            return Ok(SpawnOutcome::Skipped(SpawnSkip::Raced));
        }

        let Some(_guard) = self.state.try_begin_installation() else {
            return Ok(SpawnOutcome::Skipped(SpawnSkip::InstallInProgress));
        };
        match self.install(&spec, now).await {
            Ok(()) => Ok(SpawnOutcome::Installed { name: spec.name }),
            // Database trouble is not the app's fault
            Err(e @ OrchestratorError::Store(_)) => Err(e),
            Err(e) => {
                warn!(app = %spec.name, error = %e, kind = ?e.kind(), "install attempt failed");
                self.state.record_install_error(&spec.name, e.to_string(), now_ms(), self.config.error_ttl_ms);
                if let Err(cleanup) = self.registry.remove_installing(&spec.name, &self.state.node_ip).await {
                    debug!(error = %cleanup, "installing marker left to expire");
                }
                Ok(SpawnOutcome::Failed { name: spec.name, reason: e.to_string() })
            }
        }
    }

    async fn install(&self, spec: &ApplicationSpecification, now: u64) -> Result<()> {
        let status = self.state.status();
        self.admission.verify_structure(spec, status.height, self.config.enterprise_allowed)?;

        let installed = self.db.local_apps().await?;
        self.admission.check_capacity(spec, self.state.tier, &installed)?;
        self.admission.verify_ports_available(spec, &installed)?;
        let _ports = self
            .state
            .reserve_ports(&spec.name, &spec.all_ports())
            .map_err(|(port, app)| ValidationError::PortConflict { port, app })?;

        let manifests = self.admission.verify_image_compliance(spec, self.images.as_ref()).await?;
        self.admission.verify_common_architecture(spec, &manifests)?;

        let marker = self.registry.new_installing(&spec.name, &self.state.node_ip, now);
        self.registry.store_installing(marker.clone(), now).await?;
        match self.transport.broadcast(&PeerMessage::AppInstalling(marker)).await {
            Ok(_) | Err(TransportError::NoPeers) => {}
            Err(e) => warn!(app = %spec.name, error = %e, "installing broadcast failed"),
        }

        info!(app = %spec.name, "installing application");
        self.lifecycle.install(spec).await
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
