//! Application Specification Types
//!
//! Module ini mendefinisikan descriptor aplikasi yang di-register oleh owner
//! dan direplikasi ke seluruh fleet melalui gossip.
//!
//! ## Schema Generations
//!
//! | Version | Adds                                             |
//! |---------|--------------------------------------------------|
//! | 1–3     | Single component only                            |
//! | 4       | Multi-component (compose)                        |
//! | 5       | `geolocation` allow-list                         |
//! | 6       | `expire` (custom validity window)                |
//! | 7       | `nodes` allow-list                               |
//! | 8       | `enterprise`, strict baseline architecture rule  |
//!
//! Which fields are *legal* for a given version is enforced by the node's
//! admission engine, not here. This module only carries the data.
//!
//! ## Storage Mode
//!
//! Container data paths may carry a marker prefix (`r:` or `g:`) that
//! flags the mount as replicated across all instances. The marker is
//! parsed once into [`StorageMode`] at deserialization time and written
//! back canonically as `r:` when serialized.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtoError;

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Highest schema generation understood by this node.
pub const LATEST_SPEC_VERSION: u32 = 8;

/// First schema generation allowing more than one component.
pub const COMPOSE_SPEC_VERSION: u32 = 4;

/// Schema generation enforcing the strict enterprise architecture rule.
pub const STRICT_ENTERPRISE_VERSION: u32 = 8;

/// Maximum number of components in one application.
pub const MAX_COMPONENTS: usize = 10;

/// Container name prefix for hosted applications.
pub const CONTAINER_PREFIX: &str = "flux";

/// Legacy container name prefix, still recognised when parsing.
pub const LEGACY_CONTAINER_PREFIX: &str = "zel";

// ════════════════════════════════════════════════════════════════════════════
// TIER
// ════════════════════════════════════════════════════════════════════════════

/// Node capacity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cumulus,
    Nimbus,
    Stratus,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Cumulus, Tier::Nimbus, Tier::Stratus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Cumulus => "cumulus",
            Tier::Nimbus => "nimbus",
            Tier::Stratus => "stratus",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cumulus" => Ok(Tier::Cumulus),
            "nimbus" => Ok(Tier::Nimbus),
            "stratus" => Ok(Tier::Stratus),
            other => Err(ProtoError::InvalidValue(format!("unknown tier: {}", other))),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// RESOURCES
// ════════════════════════════════════════════════════════════════════════════

/// Resource request or budget.
///
/// - `cpu`: cores (steps of 0.1)
/// - `ram`: megabytes (steps of 100)
/// - `hdd`: gigabytes (whole numbers)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub ram: f64,
    pub hdd: f64,
}

impl Resources {
    pub const ZERO: Resources = Resources { cpu: 0.0, ram: 0.0, hdd: 0.0 };

    pub fn new(cpu: f64, ram: f64, hdd: f64) -> Self {
        Self { cpu, ram, hdd }
    }

    /// Element-wise sum.
    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu + other.cpu,
            ram: self.ram + other.ram,
            hdd: self.hdd + other.hdd,
        }
    }

    /// Element-wise difference, floored at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: (self.cpu - other.cpu).max(0.0),
            ram: (self.ram - other.ram).max(0.0),
            hdd: (self.hdd - other.hdd).max(0.0),
        }
    }

    /// True when every dimension of `self` is within `budget`.
    ///
    /// A tiny epsilon absorbs accumulated float error from summing
    /// 0.1-step cpu values.
    pub fn fits_within(&self, budget: &Resources) -> bool {
        const EPS: f64 = 1e-9;
        self.cpu <= budget.cpu + EPS && self.ram <= budget.ram + EPS && self.hdd <= budget.hdd + EPS
    }
}

/// Per-tier overrides for a component's resource request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TieredResources {
    pub cumulus: Resources,
    pub nimbus: Resources,
    pub stratus: Resources,
}

impl TieredResources {
    pub fn for_tier(&self, tier: Tier) -> Resources {
        match tier {
            Tier::Cumulus => self.cumulus,
            Tier::Nimbus => self.nimbus,
            Tier::Stratus => self.stratus,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// STORAGE MODE / CONTAINER DATA
// ════════════════════════════════════════════════════════════════════════════

/// How a component's data mount is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Plain local volume, never synchronised.
    Local,
    /// Volume replicated between every instance of the application.
    Replicated,
}

/// Container data mount, e.g. `/appdata` or `r:/appdata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerData {
    pub mode: StorageMode,
    pub path: String,
}

impl ContainerData {
    pub fn local(path: impl Into<String>) -> Self {
        Self { mode: StorageMode::Local, path: path.into() }
    }

    pub fn replicated(path: impl Into<String>) -> Self {
        Self { mode: StorageMode::Replicated, path: path.into() }
    }

    /// Parse the string form. Markers are letters before the first `:`.
    pub fn parse(raw: &str) -> Self {
        if let Some((flags, path)) = raw.split_once(':') {
            if !flags.is_empty() && flags.chars().all(|c| c.is_ascii_alphabetic()) {
                let replicated = flags.contains('r') || flags.contains('g');
                let mode = if replicated { StorageMode::Replicated } else { StorageMode::Local };
                return Self { mode, path: path.to_string() };
            }
        }
        Self::local(raw)
    }

    pub fn is_replicated(&self) -> bool {
        self.mode == StorageMode::Replicated
    }
}

impl fmt::Display for ContainerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            StorageMode::Local => f.write_str(&self.path),
            StorageMode::Replicated => write!(f, "r:{}", self.path),
        }
    }
}

impl Serialize for ContainerData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContainerData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ContainerData::parse(&raw))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// COMPONENT SPECIFICATION
// ════════════════════════════════════════════════════════════════════════════

/// One container of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpecification {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Image reference, `namespace/repository:tag`.
    pub repotag: String,
    /// Host ports exposed by this component.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Container-side ports, paired index-wise with `ports`.
    #[serde(default)]
    pub container_ports: Vec<u16>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    pub container_data: ContainerData,
    pub cpu: f64,
    pub ram: f64,
    pub hdd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiered_resources: Option<TieredResources>,
}

impl ComponentSpecification {
    /// Base resource request.
    pub fn resources(&self) -> Resources {
        Resources::new(self.cpu, self.ram, self.hdd)
    }

    /// Resource request on `tier`, honoring overrides when the application
    /// is tiered and this component carries them.
    pub fn resources_on(&self, tier: Tier, app_tiered: bool) -> Resources {
        match (app_tiered, &self.tiered_resources) {
            (true, Some(t)) => t.for_tier(tier),
            _ => self.resources(),
        }
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.container_data.mode
    }
}

// ════════════════════════════════════════════════════════════════════════════
// APPLICATION SPECIFICATION
// ════════════════════════════════════════════════════════════════════════════

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Versioned descriptor of a deployable application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpecification {
    pub version: u32,
    /// Unique key across the fleet (compared case-insensitively).
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Owner address (Ethereum `0x…` or Base58 P2PKH).
    pub owner: String,
    /// Desired replica count.
    pub instances: u32,
    /// Validity window in blocks (v6+).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<u64>,
    /// Height of the registration message. Filled by the registry, never
    /// part of the signed content.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub registration_height: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enterprise: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geolocation: Vec<String>,
    /// Node IP allow-list (v7+). Empty means any node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    /// When true, per-tier overrides replace the base resource fields.
    #[serde(default, skip_serializing_if = "is_false")]
    pub tiered: bool,
    pub components: Vec<ComponentSpecification>,
}

impl ApplicationSpecification {
    /// Deterministic JSON used for signing and hashing.
    ///
    /// `registration_height` is cleared first so the registry can stamp
    /// the height without invalidating the owner's signature.
    pub fn canonical_json(&self) -> Result<String, ProtoError> {
        let mut unsigned = self.clone();
        unsigned.registration_height = 0;
        serde_json::to_string(&unsigned).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Lowercased name, the registry key.
    pub fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    /// Effective validity window in blocks.
    pub fn expire_blocks(&self, default_blocks: u64) -> u64 {
        self.expire.unwrap_or(default_blocks)
    }

    pub fn is_multi_component(&self) -> bool {
        self.version >= COMPOSE_SPEC_VERSION
    }

    pub fn component(&self, name: &str) -> Option<&ComponentSpecification> {
        self.components.iter().find(|c| c.name == name)
    }

    /// True if any component uses replicated storage.
    pub fn has_replicated_storage(&self) -> bool {
        self.components.iter().any(|c| c.container_data.is_replicated())
    }

    pub fn replicated_components(&self) -> impl Iterator<Item = &ComponentSpecification> {
        self.components.iter().filter(|c| c.container_data.is_replicated())
    }

    /// All host ports across components, in declaration order.
    pub fn all_ports(&self) -> Vec<u16> {
        self.components.iter().flat_map(|c| c.ports.iter().copied()).collect()
    }

    /// Container name of `component`.
    pub fn container_name(&self, component: &ComponentSpecification) -> String {
        if self.is_multi_component() {
            container_name(&self.name, Some(&component.name))
        } else {
            container_name(&self.name, None)
        }
    }

    /// Container names of every component.
    pub fn container_names(&self) -> Vec<String> {
        self.components.iter().map(|c| self.container_name(c)).collect()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CONTAINER NAMING
// ════════════════════════════════════════════════════════════════════════════

/// `flux{component}_{app}` for compose apps, `flux{app}` otherwise.
pub fn container_name(app: &str, component: Option<&str>) -> String {
    match component {
        Some(c) => format!("{}{}_{}", CONTAINER_PREFIX, c, app),
        None => format!("{}{}", CONTAINER_PREFIX, app),
    }
}

/// Identity recovered from a container name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub app: String,
    pub component: Option<String>,
}

/// Inverse of [`container_name`]. Returns `None` for containers not
/// managed by the node.
pub fn parse_container_name(raw: &str) -> Option<ContainerIdentity> {
    let name = raw.trim_start_matches('/');
    let body = name
        .strip_prefix(CONTAINER_PREFIX)
        .or_else(|| name.strip_prefix(LEGACY_CONTAINER_PREFIX))?;
    if body.is_empty() {
        return None;
    }
    match body.split_once('_') {
        Some((component, app)) if !component.is_empty() && !app.is_empty() => Some(ContainerIdentity {
            app: app.to_string(),
            component: Some(component.to_string()),
        }),
        Some(_) => None,
        None => Some(ContainerIdentity { app: body.to_string(), component: None }),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
