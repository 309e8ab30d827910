//! Admission engine: may this node host this application?
//!
//! Every check here is pure (or read-only against the image registry) and
//! fails closed. Nothing is reserved or written until all of them pass.
//!
//! ## Check Order
//!
//! ```text
//! verify_structure ──▶ check_capacity ──▶ verify_ports_available
//!                                                │
//!        verify_common_architecture ◀── verify_image_compliance
//! ```
//!
//! ## Version Gates
//!
//! | Field         | From version |
//! |---------------|--------------|
//! | components>1  | 4            |
//! | `geolocation` | 5            |
//! | `expire`      | 6            |
//! | `nodes`       | 7            |
//! | `enterprise`  | 8            |

use std::collections::{BTreeSet, HashSet};

use thiserror::Error;

use skyfleet_common::config::{ImageSection, PortSection, SpawnerSection};
use skyfleet_common::TierCaps;
use skyfleet_proto::{
    ApplicationSpecification, Resources, Tier, COMPOSE_SPEC_VERSION, LATEST_SPEC_VERSION, MAX_COMPONENTS,
    STRICT_ENTERPRISE_VERSION,
};

use crate::error::Result;
use crate::images::{ImageManifest, ImageRef, ImageRegistry};

pub const MAX_NAME_LEN: usize = 32;
pub const MIN_NAME_LEN: usize = 2;
pub const MAX_DESCRIPTION_LEN: usize = 256;
pub const MIN_EXPIRE_BLOCKS: u64 = 5_000;
pub const MAX_EXPIRE_BLOCKS: u64 = 264_000;
pub const MAX_ENV_ENTRIES: usize = 64;
pub const MAX_COMMAND_ENTRIES: usize = 64;
pub const MAX_ENTRY_LEN: usize = 1024;
const RESERVED_PREFIXES: [&str; 2] = ["flux", "zel"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid name {0:?}: alphanumeric, {MIN_NAME_LEN} to {MAX_NAME_LEN} characters")]
    InvalidName(String),

    #[error("name {0:?} uses a reserved prefix")]
    ReservedName(String),

    #[error("description longer than {MAX_DESCRIPTION_LEN} characters")]
    DescriptionTooLong,

    #[error("instances {got} outside [{min}, {max}]")]
    InstancesOutOfRange { got: u32, min: u32, max: u32 },

    #[error("unsupported specification version {0}")]
    UnsupportedVersion(u32),

    #[error("field {field} is not allowed in version {version}")]
    FieldNotAllowed { field: &'static str, version: u32 },

    #[error("version {version} does not allow {count} components")]
    ComponentCount { version: u32, count: usize },

    #[error("duplicate component {0}")]
    DuplicateComponent(String),

    #[error("expire {0} outside [{MIN_EXPIRE_BLOCKS}, {MAX_EXPIRE_BLOCKS}]")]
    InvalidExpire(u64),

    #[error("invalid {field} of component {component}: {reason}")]
    InvalidResource { component: String, field: &'static str, reason: String },

    #[error("port {0} outside the application range or banned")]
    InvalidPort(u16),

    #[error("port {0} used twice")]
    DuplicatePort(u16),

    #[error("component {0} declares more container ports than ports")]
    PortMismatch(String),

    #[error("port {port} already used by {app}")]
    PortConflict { port: u16, app: String },

    #[error("invalid image reference {0}")]
    InvalidRepotag(String),

    #[error("image {0} is not whitelisted")]
    ImageNotWhitelisted(String),

    #[error("image {repotag} is {size} bytes, limit {max}")]
    ImageTooLarge { repotag: String, size: u64, max: u64 },

    #[error("no common architecture across components")]
    NoCommonArchitecture,

    #[error("image {repotag} lacks required architecture {required}")]
    MissingArchitecture { repotag: String, required: String },

    #[error("insufficient {resource}: required {required}, available {available}")]
    InsufficientCapacity { resource: &'static str, required: f64, available: f64 },

    #[error("enterprise applications are not allowed on this node")]
    EnterpriseNotAllowed,

    #[error("invalid environment/commands of component {component}: {reason}")]
    InvalidEnvironment { component: String, reason: String },

    #[error("registration height {height} is above current height {current}")]
    FutureRegistration { height: u64, current: u64 },
}

fn is_step(value: f64, step: f64) -> bool {
    let scaled = value / step;
    (scaled - scaled.round()).abs() < 1e-9
}

fn valid_name(name: &str, min: usize) -> bool {
    (min..=MAX_NAME_LEN).contains(&name.len()) && name.chars().all(|c| c.is_ascii_alphanumeric())
}

fn check_resources(component: &str, r: &Resources, cap: &Resources) -> std::result::Result<(), ValidationError> {
    let invalid = |field, reason: String| ValidationError::InvalidResource { component: component.to_string(), field, reason };
    if r.cpu < 0.1 || r.cpu > cap.cpu || !is_step(r.cpu, 0.1) {
        return Err(invalid("cpu", format!("{} not a 0.1 step in [0.1, {}]", r.cpu, cap.cpu)));
    }
    if r.ram < 100.0 || r.ram > cap.ram || !is_step(r.ram, 100.0) {
        return Err(invalid("ram", format!("{} not a 100 step in [100, {}]", r.ram, cap.ram)));
    }
    if r.hdd < 1.0 || r.hdd > cap.hdd || !is_step(r.hdd, 1.0) {
        return Err(invalid("hdd", format!("{} not a whole number in [1, {}]", r.hdd, cap.hdd)));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Admission {
    caps: TierCaps,
    ports: PortSection,
    images: ImageSection,
    min_instances: u32,
    max_instances: u32,
}

impl Admission {
    pub fn new(caps: TierCaps, ports: PortSection, images: ImageSection, spawner: &SpawnerSection) -> Self {
        Self { caps, ports, images, min_instances: spawner.min_instances, max_instances: spawner.max_instances }
    }

    pub fn caps(&self) -> &TierCaps {
        &self.caps
    }

    // ════════════════════════════════════════════════════════════════════════
    // STRUCTURE
    // ════════════════════════════════════════════════════════════════════════

    pub fn verify_structure(
        &self,
        spec: &ApplicationSpecification,
        current_height: u64,
        enterprise_allowed: bool,
    ) -> std::result::Result<(), ValidationError> {
        if !valid_name(&spec.name, MIN_NAME_LEN) {
            return Err(ValidationError::InvalidName(spec.name.clone()));
        }
        let lower = spec.key();
        if RESERVED_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return Err(ValidationError::ReservedName(spec.name.clone()));
        }
        if spec.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(ValidationError::DescriptionTooLong);
        }
        if spec.instances < self.min_instances || spec.instances > self.max_instances {
            return Err(ValidationError::InstancesOutOfRange {
                got: spec.instances,
                min: self.min_instances,
                max: self.max_instances,
            });
        }
        if spec.registration_height > current_height {
            return Err(ValidationError::FutureRegistration { height: spec.registration_height, current: current_height });
        }
        self.verify_version_fields(spec)?;
        if spec.enterprise && !enterprise_allowed {
            return Err(ValidationError::EnterpriseNotAllowed);
        }
        if let Some(expire) = spec.expire {
            if !(MIN_EXPIRE_BLOCKS..=MAX_EXPIRE_BLOCKS).contains(&expire) {
                return Err(ValidationError::InvalidExpire(expire));
            }
        }
        self.verify_components(spec)
    }

    fn verify_version_fields(&self, spec: &ApplicationSpecification) -> std::result::Result<(), ValidationError> {
        let version = spec.version;
        if version == 0 || version > LATEST_SPEC_VERSION {
            return Err(ValidationError::UnsupportedVersion(version));
        }
        let count = spec.components.len();
        let allowed = if version < COMPOSE_SPEC_VERSION { count == 1 } else { (1..=MAX_COMPONENTS).contains(&count) };
        if !allowed {
            return Err(ValidationError::ComponentCount { version, count });
        }
        let gates: [(&'static str, bool, u32); 4] = [
            ("geolocation", !spec.geolocation.is_empty(), 5),
            ("expire", spec.expire.is_some(), 6),
            ("nodes", !spec.nodes.is_empty(), 7),
            ("enterprise", spec.enterprise, STRICT_ENTERPRISE_VERSION),
        ];
        for (field, present, from) in gates {
            if present && version < from {
                return Err(ValidationError::FieldNotAllowed { field, version });
            }
        }
        Ok(())
    }

    fn verify_components(&self, spec: &ApplicationSpecification) -> std::result::Result<(), ValidationError> {
        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        let max = self.caps.node_capacity(Tier::Stratus);
        for c in &spec.components {
            if spec.is_multi_component() && !valid_name(&c.name, 1) {
                return Err(ValidationError::InvalidName(c.name.clone()));
            }
            if !names.insert(c.name.to_ascii_lowercase()) {
                return Err(ValidationError::DuplicateComponent(c.name.clone()));
            }
            if ImageRef::parse(&c.repotag).is_none() {
                return Err(ValidationError::InvalidRepotag(c.repotag.clone()));
            }

            if spec.tiered {
                let tiered = c.tiered_resources.as_ref().ok_or_else(|| ValidationError::InvalidResource {
                    component: c.name.clone(),
                    field: "tiered_resources",
                    reason: "missing on a tiered application".into(),
                })?;
                for tier in Tier::ALL {
                    check_resources(&c.name, &tiered.for_tier(tier), &self.caps.node_capacity(tier))?;
                }
            } else {
                check_resources(&c.name, &c.resources(), &max)?;
            }

            for port in &c.ports {
                if !self.ports.allows(*port) {
                    return Err(ValidationError::InvalidPort(*port));
                }
                if !ports.insert(*port) {
                    return Err(ValidationError::DuplicatePort(*port));
                }
            }
            if c.container_ports.len() > c.ports.len() {
                return Err(ValidationError::PortMismatch(c.name.clone()));
            }

            let invalid_env = |reason: String| ValidationError::InvalidEnvironment { component: c.name.clone(), reason };
            if c.environment.len() > MAX_ENV_ENTRIES || c.commands.len() > MAX_COMMAND_ENTRIES {
                return Err(invalid_env("too many entries".into()));
            }
            for env in &c.environment {
                match env.split_once('=') {
                    Some((key, _)) if !key.is_empty() && env.len() <= MAX_ENTRY_LEN => {}
                    _ => return Err(invalid_env(format!("{:?} is not KEY=value", env))),
                }
            }
            if c.commands.iter().any(|cmd| cmd.len() > MAX_ENTRY_LEN) {
                return Err(invalid_env("command entry too long".into()));
            }
        }
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════
    // IMAGES
    // ════════════════════════════════════════════════════════════════════════

    /// Full validation: structure, image compliance and the common
    /// architecture rule. Returns the manifests read.
    pub async fn verify_specifications(
        &self,
        spec: &ApplicationSpecification,
        current_height: u64,
        enterprise_allowed: bool,
        registry: &dyn ImageRegistry,
    ) -> Result<Vec<ImageManifest>> {
        self.verify_structure(spec, current_height, enterprise_allowed)?;
        let manifests = self.verify_image_compliance(spec, registry).await?;
        self.verify_common_architecture(spec, &manifests)?;
        Ok(manifests)
    }

    /// Whitelist, repotag format and size of every component image.
    pub async fn verify_image_compliance(
        &self,
        spec: &ApplicationSpecification,
        registry: &dyn ImageRegistry,
    ) -> Result<Vec<ImageManifest>> {
        let mut manifests = Vec::with_capacity(spec.components.len());
        for c in &spec.components {
            let image = ImageRef::parse(&c.repotag).ok_or_else(|| ValidationError::InvalidRepotag(c.repotag.clone()))?;
            if !image.is_whitelisted(&self.images.whitelisted_repositories) {
                return Err(ValidationError::ImageNotWhitelisted(c.repotag.clone()).into());
            }
            let manifest = registry.manifest(&c.repotag).await?;
            if manifest.size_bytes > self.images.max_image_size_bytes {
                return Err(ValidationError::ImageTooLarge {
                    repotag: c.repotag.clone(),
                    size: manifest.size_bytes,
                    max: self.images.max_image_size_bytes,
                }
                .into());
            }
            manifests.push(manifest);
        }
        Ok(manifests)
    }

    /// Strict versions need the baseline architecture on every image;
    /// older ones need at least one architecture shared by all images.
    pub fn verify_common_architecture(
        &self,
        spec: &ApplicationSpecification,
        manifests: &[ImageManifest],
    ) -> std::result::Result<(), ValidationError> {
        if manifests.is_empty() {
            return Err(ValidationError::NoCommonArchitecture);
        }
        if spec.version >= STRICT_ENTERPRISE_VERSION {
            let required = &self.images.baseline_architecture;
            return match manifests.iter().find(|m| !m.architectures.contains(required)) {
                Some(m) => Err(ValidationError::MissingArchitecture { repotag: m.repotag.clone(), required: required.clone() }),
                None => Ok(()),
            };
        }
        let mut common: BTreeSet<String> = manifests[0].architectures.clone();
        for m in &manifests[1..] {
            common = common.intersection(&m.architectures).cloned().collect();
        }
        if common.is_empty() {
            return Err(ValidationError::NoCommonArchitecture);
        }
        Ok(())
    }

    // ════════════════════════════════════════════════════════════════════════
    // LOCAL FIT
    // ════════════════════════════════════════════════════════════════════════

    /// Host ports of `spec` against every other locally installed app.
    pub fn verify_ports_available(
        &self,
        spec: &ApplicationSpecification,
        installed: &[ApplicationSpecification],
    ) -> std::result::Result<(), ValidationError> {
        for other in installed.iter().filter(|o| !o.name.eq_ignore_ascii_case(&spec.name)) {
            let taken = other.all_ports();
            if let Some(port) = spec.all_ports().into_iter().find(|p| taken.contains(p)) {
                return Err(ValidationError::PortConflict { port, app: other.name.clone() });
            }
        }
        Ok(())
    }

    /// Sum of component requests on `tier`, honoring tiered overrides.
    pub fn total_hardware_requirements(spec: &ApplicationSpecification, tier: Tier) -> Resources {
        spec.components
            .iter()
            .fold(Resources::ZERO, |acc, c| acc.add(&c.resources_on(tier, spec.tiered)))
    }

    /// Does `spec` fit into what the other installed apps leave free?
    pub fn check_capacity(
        &self,
        spec: &ApplicationSpecification,
        tier: Tier,
        installed: &[ApplicationSpecification],
    ) -> std::result::Result<(), ValidationError> {
        let used = installed
            .iter()
            .filter(|o| !o.name.eq_ignore_ascii_case(&spec.name))
            .fold(Resources::ZERO, |acc, o| acc.add(&Self::total_hardware_requirements(o, tier)));
        let available = self.caps.node_capacity(tier).saturating_sub(&used);
        let required = Self::total_hardware_requirements(spec, tier);
        if required.fits_within(&available) {
            return Ok(());
        }
        let (resource, required, available) = if required.cpu > available.cpu + 1e-9 {
            ("cpu", required.cpu, available.cpu)
        } else if required.ram > available.ram + 1e-9 {
            ("ram", required.ram, available.ram)
        } else {
            ("hdd", required.hdd, available.hdd)
        };
        Err(ValidationError::InsufficientCapacity { resource, required, available })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{sample_component, sample_spec, MockImageRegistry};
    use skyfleet_proto::TieredResources;

    fn admission() -> Admission {
        Admission::new(TierCaps::default(), PortSection::default(), ImageSection::default(), &SpawnerSection::default())
    }

    fn spec() -> ApplicationSpecification {
        sample_spec("Shop", "0x0000000000000000000000000000000000000001")
    }

    fn check(s: &ApplicationSpecification) -> std::result::Result<(), ValidationError> {
        admission().verify_structure(s, 1_000, false)
    }

    // ════════════════════════════════════════════════════════════════════════
    // STRUCTURE
    // ════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_valid_spec_passes() {
        assert_eq!(check(&spec()), Ok(()));
    }

    #[test]
    fn test_name_rules() {
        let mut s = spec();
        s.name = "a".into();
        assert!(matches!(check(&s), Err(ValidationError::InvalidName(_))));
        s.name = "shop-1".into();
        assert!(matches!(check(&s), Err(ValidationError::InvalidName(_))));
        s.name = "FluxShop".into();
        assert!(matches!(check(&s), Err(ValidationError::ReservedName(_))));
    }

    #[test]
    fn test_decimal_steps_name_the_field() {
        let mut s = spec();
        s.components[0].cpu = 0.25;
        match check(&s) {
            Err(ValidationError::InvalidResource { field, .. }) => assert_eq!(field, "cpu"),
            other => panic!("unexpected {:?}", other),
        }
        let mut s = spec();
        s.components[0].ram = 550.0;
        assert!(check(&s).expect_err("ram").to_string().contains("ram"));
        let mut s = spec();
        s.components[0].hdd = 2.5;
        assert!(check(&s).expect_err("hdd").to_string().contains("hdd"));
        let mut s = spec();
        s.components[0].cpu = 0.3;
        assert_eq!(check(&s), Ok(()));
    }

    #[test]
    fn test_version_field_gates() {
        let mut s = spec();
        s.expire = Some(10_000);
        assert_eq!(check(&s), Err(ValidationError::FieldNotAllowed { field: "expire", version: 4 }));
        s.version = 6;
        assert_eq!(check(&s), Ok(()));
        s.expire = Some(100);
        assert_eq!(check(&s), Err(ValidationError::InvalidExpire(100)));

        let mut s = spec();
        s.version = 3;
        s.components.push(sample_component("db", 31001));
        assert!(matches!(check(&s), Err(ValidationError::ComponentCount { version: 3, count: 2 })));

        let mut s = spec();
        s.version = 8;
        s.enterprise = true;
        assert_eq!(check(&s), Err(ValidationError::EnterpriseNotAllowed));
        assert_eq!(admission().verify_structure(&s, 1_000, true), Ok(()));
    }

    #[test]
    fn test_ports_in_range_and_unique() {
        let mut s = spec();
        s.components[0].ports = vec![80];
        s.components[0].container_ports = vec![];
        assert_eq!(check(&s), Err(ValidationError::InvalidPort(80)));

        let mut s = spec();
        s.components.push(sample_component("db", 31000));
        assert_eq!(check(&s), Err(ValidationError::DuplicatePort(31000)));
    }

    #[test]
    fn test_tiered_overrides_validated() {
        let mut s = spec();
        s.tiered = true;
        assert!(matches!(check(&s), Err(ValidationError::InvalidResource { field: "tiered_resources", .. })));
        s.components[0].tiered_resources = Some(TieredResources {
            cumulus: Resources::new(0.5, 500.0, 5.0),
            nimbus: Resources::new(1.0, 1000.0, 10.0),
            stratus: Resources::new(2.0, 2000.0, 20.0),
        });
        assert_eq!(check(&s), Ok(()));
        // Cumulus leaves 3 cores after the locked share
        if let Some(t) = s.components[0].tiered_resources.as_mut() {
            t.cumulus.cpu = 3.5;
        }
        assert!(matches!(check(&s), Err(ValidationError::InvalidResource { field: "cpu", .. })));
    }

    #[test]
    fn test_environment_shape() {
        let mut s = spec();
        s.components[0].environment = vec!["NOEQUALS".into()];
        assert!(matches!(check(&s), Err(ValidationError::InvalidEnvironment { .. })));
    }

    // ════════════════════════════════════════════════════════════════════════
    // IMAGES / ARCHITECTURE
    // ════════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_no_common_architecture_rejected() {
        let mut s = spec();
        s.components.push(sample_component("db", 31001));
        s.components[1].repotag = "runonflux/db:1".into();
        let images = MockImageRegistry::new()
            .with("runonflux/website:latest", &["amd64"], 1_000)
            .with("runonflux/db:1", &["arm64"], 1_000);
        let err = admission().verify_specifications(&s, 1_000, false, &images).await.expect_err("reject");
        assert!(err.is_validation());
        assert!(err.to_string().contains("architecture"));

        let images = MockImageRegistry::new()
            .with("runonflux/website:latest", &["amd64", "arm64"], 1_000)
            .with("runonflux/db:1", &["arm64"], 1_000);
        assert_eq!(admission().verify_specifications(&s, 1_000, false, &images).await.expect("accept").len(), 2);
    }

    #[tokio::test]
    async fn test_strict_version_requires_baseline() {
        let mut s = spec();
        s.version = 8;
        let images = MockImageRegistry::new().with("runonflux/website:latest", &["arm64"], 1_000);
        let err = admission().verify_specifications(&s, 1_000, false, &images).await.expect_err("reject");
        assert!(err.to_string().contains("amd64"));
    }

    #[tokio::test]
    async fn test_image_whitelist_and_size() {
        let a = Admission::new(
            TierCaps::default(),
            PortSection::default(),
            ImageSection {
                whitelisted_repositories: vec!["trusted".into()],
                max_image_size_bytes: 500,
                baseline_architecture: "amd64".into(),
            },
            &SpawnerSection::default(),
        );
        let images = MockImageRegistry::new().with("runonflux/website:latest", &["amd64"], 1_000);
        let err = a.verify_image_compliance(&spec(), &images).await.expect_err("not listed");
        assert!(err.to_string().contains("whitelisted"));

        let mut s = spec();
        s.components[0].repotag = "trusted/website:latest".into();
        let images = MockImageRegistry::new().with("trusted/website:latest", &["amd64"], 1_000);
        let err = a.verify_image_compliance(&s, &images).await.expect_err("too large");
        assert!(matches!(
            err,
            crate::error::OrchestratorError::Validation(ValidationError::ImageTooLarge { size: 1_000, .. })
        ));
    }

    // ════════════════════════════════════════════════════════════════════════
    // LOCAL FIT
    // ════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_total_hardware_single_and_sum() {
        let mut s = spec();
        assert_eq!(Admission::total_hardware_requirements(&s, Tier::Cumulus), Resources::new(0.5, 500.0, 5.0));
        s.components.push(sample_component("db", 31001));
        let total = Admission::total_hardware_requirements(&s, Tier::Cumulus);
        assert!((total.cpu - 1.0).abs() < 1e-9);
        assert_eq!(total.ram, 1000.0);
        assert_eq!(total.hdd, 10.0);
    }

    #[test]
    fn test_port_conflict_with_installed() {
        let other = sample_spec("Blog", "0x0000000000000000000000000000000000000002");
        let err = admission().verify_ports_available(&spec(), &[other]).expect_err("conflict");
        assert_eq!(err, ValidationError::PortConflict { port: 31000, app: "Blog".into() });
        // Same app reinstalling is not a conflict
        assert_eq!(admission().verify_ports_available(&spec(), &[spec()]), Ok(()));
    }

    #[test]
    fn test_capacity_against_installed() {
        let a = admission();
        let mut big = sample_spec("Big", "0x0000000000000000000000000000000000000002");
        big.components[0].cpu = 2.6;
        big.components[0].ports = vec![32000];
        assert_eq!(a.check_capacity(&spec(), Tier::Cumulus, &[]), Ok(()));
        match a.check_capacity(&spec(), Tier::Cumulus, &[big]) {
            Err(ValidationError::InsufficientCapacity { resource, .. }) => assert_eq!(resource, "cpu"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
