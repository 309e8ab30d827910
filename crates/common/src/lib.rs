//! # SkyFleet Common Crate
//!
//! Utilitas bersama untuk node SkyFleet.
//!
//! ## Modules
//! - `crypto`: Content hashes and owner signature verification
//! - `price`: Height-gated price table
//! - `tier`: Per-tier hardware caps and node capacity
//! - `config`: TOML configuration management
//!
//! ## Verification Flow
//! ```text
//! ApplicationMessage
//!        │
//!        ├──▶ verify_hash       sha256(payload ‖ signature) == hash
//!        ├──▶ verify_signature  ETH (EIP-191) or BTC message signature
//!        └──▶ PriceTable        paid value >= price at height
//! ```

pub mod config;
pub mod crypto;
pub mod price;
pub mod tier;

pub use config::{load_from_file, ConfigError, NodeConfig};
pub use crypto::{content_hash, verify_hash, verify_signature, CryptoError, MessageVerifier};
pub use price::{PriceEntry, PriceError, PriceTable};
pub use tier::TierCaps;
