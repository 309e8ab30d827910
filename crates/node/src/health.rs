//! Node health report.
//!
//! ```text
//! NodeStatus ───┐
//! DosState ─────┼──▶ NodeHealth::check() ──▶ NodeHealth
//! flags, apps ──┘
//! ```
//!
//! A node is healthy when the ledger is synced and confirmed, enough
//! peers are connected, the status is fresh and the DOS score is below
//! its threshold. Busy lifecycle flags are reported but never unhealthy.

use serde::{Deserialize, Serialize};

use crate::dos::DosSnapshot;
use crate::now_ms;
use crate::state::OrchestratorState;

/// Status older than this no longer describes the node.
pub const STATUS_STALE_MS: u64 = 15 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node_ip: String,
    pub tier: String,
    pub synced: bool,
    pub confirmed: bool,
    pub height: u64,
    pub connected_peers: usize,
    pub min_peers: usize,
    /// Milliseconds since the status was refreshed.
    pub status_age_ms: u64,
    pub dos: DosSnapshot,
    pub dos_threshold: u32,
    pub installation_in_progress: bool,
    pub removal_in_progress: bool,
    pub installed_apps: usize,
    pub last_check: u64,
}

impl NodeHealth {
    pub fn check(state: &OrchestratorState, installed_apps: usize, min_peers: usize) -> Self {
        let status = state.status();
        let now = now_ms();
        let (dos, dos_threshold) = state.with_dos(|d| (d.snapshot(), d.threshold()));
        Self {
            node_ip: state.node_ip.clone(),
            tier: state.tier.to_string(),
            synced: status.synced,
            confirmed: status.confirmed,
            height: status.height,
            connected_peers: status.connected_peers,
            min_peers,
            status_age_ms: now.saturating_sub(status.updated_at),
            dos,
            dos_threshold,
            installation_in_progress: state.installation_in_progress(),
            removal_in_progress: state.removal_in_progress(),
            installed_apps,
            last_check: now,
        }
    }

    pub fn is_dos(&self) -> bool {
        self.dos.dos_state >= self.dos_threshold
    }

    pub fn is_healthy(&self) -> bool {
        self.health_issues().is_empty()
    }

    pub fn health_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.synced {
            issues.push("ledger daemon not synced".to_string());
        }
        if !self.confirmed {
            issues.push("node not confirmed on the ledger".to_string());
        }
        if self.connected_peers < self.min_peers {
            issues.push(format!("{} peers connected, {} required", self.connected_peers, self.min_peers));
        }
        if self.status_age_ms >= STATUS_STALE_MS {
            issues.push(format!("node status is {} s old", self.status_age_ms / 1000));
        }
        if self.is_dos() {
            let reason = self
                .dos
                .dos_duplicate_app_message
                .as_deref()
                .or(self.dos.dos_mount_message.as_deref())
                .or(self.dos.dos_message.as_deref())
                .unwrap_or("unknown");
            issues.push(format!("DOS state {} (threshold {}): {}", self.dos.dos_state, self.dos_threshold, reason));
        }
        issues
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use skyfleet_common::config::DosSection;
    use skyfleet_proto::Tier;

    use crate::state::NodeStatus;

    fn healthy_state() -> OrchestratorState {
        let state = OrchestratorState::new("10.0.0.1", Tier::Nimbus, DosSection::default());
        state.set_status(NodeStatus {
            synced: true,
            confirmed: true,
            height: 1_000,
            connected_peers: 10,
            updated_at: now_ms(),
        });
        state
    }

    #[test]
    fn test_healthy_node() {
        let health = NodeHealth::check(&healthy_state(), 2, 8);
        assert!(health.is_healthy(), "{:?}", health.health_issues());
        assert_eq!(health.installed_apps, 2);
    }

    #[test]
    fn test_fresh_node_reports_every_gate() {
        let state = OrchestratorState::new("10.0.0.1", Tier::Cumulus, DosSection::default());
        let health = NodeHealth::check(&state, 0, 8);
        assert!(!health.is_healthy());
        let issues = health.health_issues();
        assert_eq!(issues.len(), 4);
        assert!(issues[2].contains("0 peers connected"));
    }

    #[test]
    fn test_dos_reason_in_issues() {
        let state = healthy_state();
        state.with_dos(|d| d.report_mount_failure("Shop", "permission denied"));
        let health = NodeHealth::check(&state, 1, 8);
        assert!(health.is_dos());
        let issues = health.health_issues();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("Mount of Shop failed"));
    }

    #[test]
    fn test_busy_flags_are_not_unhealthy() {
        let state = healthy_state();
        let _guard = state.try_begin_removal().expect("flag");
        let health = NodeHealth::check(&state, 1, 8);
        assert!(health.removal_in_progress);
        assert!(health.is_healthy());
    }
}
