//! Per-tier hardware caps and the locked system reservation.
//!
//! `NodeCapacity(tier) = caps(tier) − locked_system_resources`

use serde::{Deserialize, Serialize};

use skyfleet_proto::{Resources, Tier};

/// Hardware available on each tier and the share the system keeps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCaps {
    pub cumulus: Resources,
    pub nimbus: Resources,
    pub stratus: Resources,
    pub locked_system_resources: Resources,
}

impl Default for TierCaps {
    fn default() -> Self {
        Self {
            cumulus: Resources::new(4.0, 8_000.0, 220.0),
            nimbus: Resources::new(8.0, 32_000.0, 440.0),
            stratus: Resources::new(16.0, 64_000.0, 880.0),
            locked_system_resources: Resources::new(1.0, 2_000.0, 60.0),
        }
    }
}

impl TierCaps {
    pub fn caps(&self, tier: Tier) -> Resources {
        match tier {
            Tier::Cumulus => self.cumulus,
            Tier::Nimbus => self.nimbus,
            Tier::Stratus => self.stratus,
        }
    }

    /// Budget left for hosted applications on `tier`.
    pub fn node_capacity(&self, tier: Tier) -> Resources {
        self.caps(tier).saturating_sub(&self.locked_system_resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_capacity_subtracts_locked() {
        let caps = TierCaps::default();
        assert_eq!(caps.node_capacity(Tier::Cumulus), Resources::new(3.0, 6_000.0, 160.0));
        assert_eq!(caps.node_capacity(Tier::Stratus), Resources::new(15.0, 62_000.0, 820.0));
    }

    #[test]
    fn test_node_capacity_never_negative() {
        let caps = TierCaps {
            locked_system_resources: Resources::new(100.0, 1e9, 1e9),
            ..TierCaps::default()
        };
        assert_eq!(caps.node_capacity(Tier::Nimbus), Resources::ZERO);
    }
}
