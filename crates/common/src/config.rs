//! Node configuration loaded once from TOML.
//!
//! Every section has a `Default`, so a partial file (or none at all) is a
//! valid configuration. Values are never hot-reloaded.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use skyfleet_proto::Tier;

use crate::price::PriceTable;
use crate::tier::TierCaps;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ════════════════════════════════════════════════════════════════════════════
// SECTIONS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Public IP of this node as peers see it.
    pub ip: String,
    pub tier: Tier,
    pub api_bind: String,
    /// Token expected in the operator header for privileged routes.
    pub operator_token: Option<String>,
    pub log_level: String,
    /// Interval of the node status refresh.
    pub status_interval_secs: u64,
    /// Minimum connected peers before the node takes part in the fleet.
    pub min_peers: usize,
    /// Region code such as `EU_DE`, matched against app geolocation lists.
    pub geolocation: Option<String>,
    /// Peers dialled before the ledger node list is available.
    pub bootstrap_peers: Vec<String>,
    pub max_outgoing_peers: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            tier: Tier::Cumulus,
            api_bind: "0.0.0.0:16127".to_string(),
            operator_token: None,
            log_level: "info".to_string(),
            status_interval_secs: 120,
            min_peers: 8,
            geolocation: None,
            bootstrap_peers: vec![],
            max_outgoing_peers: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Default validity window in blocks.
    pub blocks_lasting: u64,
    pub temporary_message_ttl_ms: u64,
    pub prices: PriceTable,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            blocks_lasting: 22_000,
            temporary_message_ttl_ms: 60 * 60 * 1000,
            prices: PriceTable::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    /// Addresses receiving application registration payments.
    pub payment_addresses: Vec<String>,
    pub scan_interval_secs: u64,
    /// Blocks scanned per pass.
    pub scan_batch: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:16124".to_string(),
            rpc_user: None,
            rpc_password: None,
            payment_addresses: vec![],
            scan_interval_secs: 60,
            scan_batch: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashSyncSection {
    pub interval_secs: u64,
    pub min_peers: usize,
    /// At or above this share of missing hashes the pass defers.
    pub missing_ratio_threshold: f64,
    pub batch_size: usize,
    pub max_attempts: u32,
}

impl Default for HashSyncSection {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            min_peers: 12,
            missing_ratio_threshold: 0.95,
            batch_size: 500,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerSection {
    pub interval_secs: u64,
    /// Chance that a tick attempts an install at all.
    pub install_probability: f64,
    pub max_jitter_ms: u64,
    pub error_ttl_ms: u64,
    /// Extra instances tolerated before over-provision removal.
    pub instances_slack: u32,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Whether this node accepts enterprise applications.
    pub enterprise_allowed: bool,
    pub installing_ttl_ms: u64,
}

impl Default for SpawnerSection {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            install_probability: 0.25,
            max_jitter_ms: 5 * 60 * 1000,
            error_ttl_ms: 60 * 60 * 1000,
            instances_slack: 3,
            min_instances: 3,
            max_instances: 100,
            enterprise_allowed: false,
            installing_ttl_ms: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSection {
    pub min: u16,
    pub max: u16,
    pub banned: Vec<u16>,
}

impl Default for PortSection {
    fn default() -> Self {
        Self { min: 31_000, max: 39_999, banned: vec![] }
    }
}

impl PortSection {
    pub fn allows(&self, port: u16) -> bool {
        port >= self.min && port <= self.max && !self.banned.contains(&port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSection {
    /// Allowed `namespace` or `namespace/repository` prefixes. Empty allows all.
    pub whitelisted_repositories: Vec<String>,
    pub max_image_size_bytes: u64,
    pub baseline_architecture: String,
}

impl Default for ImageSection {
    fn default() -> Self {
        Self {
            whitelisted_repositories: vec![],
            max_image_size_bytes: 2_000_000_000,
            baseline_architecture: "amd64".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    pub syncthing_url: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    /// Receive-only ticks before a replica is promoted regardless of sync.
    pub max_sync_wait_ticks: u32,
    pub leader_tie_tolerance_ms: u64,
    pub monitor_interval_secs: u64,
    /// Host directory holding application volumes.
    pub data_root: String,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            syncthing_url: "http://127.0.0.1:8384".to_string(),
            api_key: None,
            request_timeout_ms: 5_000,
            max_sync_wait_ticks: 30,
            leader_tie_tolerance_ms: 5_000,
            monitor_interval_secs: 60,
            data_root: "/var/lib/skyfleet/appvolumes".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Snapshot file of the node's collections. Rewritten atomically on
    /// every change.
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self { path: "/var/lib/skyfleet/state/collections.json".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub interval_secs: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self { interval_secs: 30 * 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DosSection {
    pub threshold: u32,
    pub mount_failure_increment: u32,
    pub duplicate_app_increment: u32,
}

impl Default for DosSection {
    fn default() -> Self {
        Self { threshold: 100, mount_failure_increment: 100, duplicate_app_increment: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationSection {
    pub broadcast_interval_secs: u64,
    pub ttl_ms: u64,
}

impl Default for LocationSection {
    fn default() -> Self {
        Self { broadcast_interval_secs: 60 * 60, ttl_ms: 125 * 60 * 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundSection {
    /// Lifetime of a pending request to one peer origin; no new request
    /// goes to that origin before it expires.
    pub max_age_ms: u64,
}

impl Default for OutboundSection {
    fn default() -> Self {
        Self { max_age_ms: 60_000 }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// NODE CONFIG
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub ledger: LedgerSection,
    pub registry: RegistrySection,
    pub hardware: TierCaps,
    pub hash_sync: HashSyncSection,
    pub spawner: SpawnerSection,
    pub ports: PortSection,
    pub images: ImageSection,
    pub replication: ReplicationSection,
    pub store: StoreSection,
    pub recovery: RecoverySection,
    pub dos: DosSection,
    pub locations: LocationSection,
    pub outbound: OutboundSection,
}

impl NodeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: NodeConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |m: &str| Err(ConfigError::Invalid(m.to_string()));
        if self.ports.min > self.ports.max {
            return invalid("ports.min is above ports.max");
        }
        if !(0.0..=1.0).contains(&self.spawner.install_probability) {
            return invalid("spawner.install_probability must lie in [0, 1]");
        }
        let ratio = self.hash_sync.missing_ratio_threshold;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return invalid("hash_sync.missing_ratio_threshold must lie in (0, 1]");
        }
        if self.hash_sync.batch_size == 0 {
            return invalid("hash_sync.batch_size must be positive");
        }
        if self.spawner.min_instances > self.spawner.max_instances {
            return invalid("spawner.min_instances is above spawner.max_instances");
        }
        if self.registry.blocks_lasting == 0 {
            return invalid("registry.blocks_lasting must be positive");
        }
        if self.ledger.scan_batch == 0 {
            return invalid("ledger.scan_batch must be positive");
        }
        if self.registry.prices.entries.is_empty() {
            return invalid("registry.prices needs at least one entry");
        }
        if self.store.path.trim().is_empty() {
            return invalid("store.path must not be empty");
        }
        Ok(())
    }
}

/// Load and validate config from a TOML file path.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<NodeConfig, ConfigError> {
    let raw = fs::read_to_string(path.as_ref())?;
    NodeConfig::from_toml_str(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let def = NodeConfig::default();
        assert!(def.validate().is_ok());
        assert_eq!(def.replication.max_sync_wait_ticks, 30);
        assert!((def.hash_sync.missing_ratio_threshold - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_from_file_partial_sections() {
        use std::io::Write;
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let toml = r#"
            [node]
            ip = "10.1.2.3"
            tier = "nimbus"
            operator_token = "secret"

            [ports]
            min = 32000
            max = 32010
            banned = [32005]

            [[registry.prices.entries]]
            height = 0
            cpu = 0.2
            ram = 0.1
            hdd = 0.01
            min_price = 0.75
        "#;
        let mut f = tmp.reopen().expect("reopen");
        write!(f, "{}", toml).expect("write");
        let cfg = load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.node.ip, "10.1.2.3");
        assert_eq!(cfg.node.tier, Tier::Nimbus);
        assert_eq!(cfg.node.operator_token.as_deref(), Some("secret"));
        assert!(cfg.ports.allows(32000));
        assert!(!cfg.ports.allows(32005));
        assert!(!cfg.ports.allows(32011));
        assert_eq!(cfg.registry.prices.entries.len(), 1);
        // Untouched sections keep their defaults
        assert_eq!(cfg.spawner, SpawnerSection::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = NodeConfig::from_toml_str("[ports]\nmin = 5\nmax = 1\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = NodeConfig::from_toml_str("[hash_sync]\nmissing_ratio_threshold = 0.0\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        assert!(matches!(NodeConfig::from_toml_str("node = 5"), Err(ConfigError::Parse(_))));

        let err = NodeConfig::from_toml_str("[store]\npath = \" \"\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(load_from_file("/nonexistent/skyfleet.toml"), Err(ConfigError::Io(_))));
    }
}
