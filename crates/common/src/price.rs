//! Height-gated application price table.
//!
//! ```text
//! component = cpu * cpu_price * 10 + ram * ram_price / 100 + hdd * hdd_price
//! total     = Σ component
//!           × instances / 3            (when instances > 3)
//!           × expire / default_expire
//! price     = ceil2(max(total, min_price))
//! ```
//!
//! Updates pay the new price minus the unexpired share of the previous
//! payment, never less than `min_price`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use skyfleet_proto::{ApplicationSpecification, Tier};

/// Instances included in the base price.
pub const BASE_INSTANCES: u32 = 3;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PriceError {
    #[error("no price entry applies at height {0}")]
    NoEntry(u64),

    #[error("invalid default expire: {0}")]
    InvalidExpire(u64),
}

/// Prices valid from `height` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub height: u64,
    /// Per core, scaled by 10.
    pub cpu: f64,
    /// Per 100 MB.
    pub ram: f64,
    /// Per GB.
    pub hdd: f64,
    pub min_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    pub entries: Vec<PriceEntry>,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            entries: vec![
                PriceEntry { height: 0, cpu: 0.3, ram: 0.1, hdd: 0.05, min_price: 1.0 },
                PriceEntry { height: 1_004_000, cpu: 0.15, ram: 0.05, hdd: 0.02, min_price: 0.5 },
            ],
        }
    }
}

fn ceil2(v: f64) -> f64 {
    // Trim float noise before rounding up so 1.10000000001 stays 1.10
    let scaled = (v * 100.0 * 1e6).round() / 1e6;
    scaled.ceil() / 100.0
}

impl PriceTable {
    pub fn new(mut entries: Vec<PriceEntry>) -> Self {
        entries.sort_by_key(|e| e.height);
        Self { entries }
    }

    /// Entry in force at `height`: the last one whose height is not above it.
    pub fn at_height(&self, height: u64) -> Result<&PriceEntry, PriceError> {
        self.entries
            .iter()
            .filter(|e| e.height <= height)
            .max_by_key(|e| e.height)
            .ok_or(PriceError::NoEntry(height))
    }

    /// Price of registering `spec` at `height`.
    ///
    /// Tiered applications are priced on their largest tier.
    pub fn app_price(
        &self,
        spec: &ApplicationSpecification,
        height: u64,
        default_expire: u64,
    ) -> Result<f64, PriceError> {
        if default_expire == 0 {
            return Err(PriceError::InvalidExpire(default_expire));
        }
        let entry = self.at_height(height)?;
        let mut total = 0.0;
        for component in &spec.components {
            let r = component.resources_on(Tier::Stratus, spec.tiered);
            total += r.cpu * entry.cpu * 10.0 + r.ram * entry.ram / 100.0 + r.hdd * entry.hdd;
        }
        if spec.instances > BASE_INSTANCES {
            total *= spec.instances as f64 / BASE_INSTANCES as f64;
        }
        let expire = spec.expire_blocks(default_expire);
        total *= expire as f64 / default_expire as f64;
        Ok(ceil2(total.max(entry.min_price)))
    }

    /// Price of an update replacing a registration that paid `previous_paid`
    /// for `previous_expire` blocks, `elapsed` blocks ago.
    pub fn update_price(
        &self,
        spec: &ApplicationSpecification,
        height: u64,
        default_expire: u64,
        previous_paid: f64,
        previous_expire: u64,
        elapsed: u64,
    ) -> Result<f64, PriceError> {
        let full = self.app_price(spec, height, default_expire)?;
        let min_price = self.at_height(height)?.min_price;
        if previous_expire == 0 {
            return Ok(full);
        }
        let remaining = previous_expire.saturating_sub(elapsed) as f64 / previous_expire as f64;
        let credit = previous_paid * remaining;
        Ok(ceil2((full - credit).max(min_price)))
    }
}
