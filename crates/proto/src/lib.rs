//! # SkyFleet Proto Crate
//!
//! Proto crate adalah kontrak data antara node-node SkyFleet: descriptor
//! aplikasi, signed registry messages, location claims, worker IPC, dan
//! envelope HTTP.
//!
//! ## Modules
//!
//! - [`app`]: `ApplicationSpecification`, components, resources, tiers, storage mode
//! - [`message`]: `ApplicationMessage`, `ApplicationLocation`, ledger hash records, `PeerMessage`
//! - [`worker`]: Worker request/response types and the bulk node index
//! - [`envelope`]: Uniform `{status, data}` HTTP envelope
//!
//! ## Data Flow
//!
//! ```text
//!  owner ──▶ ApplicationMessage ──▶ PeerMessage::AppMessage ──▶ peers
//!                                                               │
//!  node  ◀── PeerMessage::AppRunning(ApplicationLocation) ◀─────┘
//! ```
//!
//! All types derive `Serialize`/`Deserialize`; serialization of
//! [`app::ApplicationSpecification`] through `canonical_json` is the
//! deterministic form covered by signatures and content hashes.

pub mod app;
pub mod envelope;
pub mod message;
pub mod worker;

use thiserror::Error;

pub use app::{
    container_name, parse_container_name, ApplicationSpecification, ComponentSpecification,
    ContainerData, ContainerIdentity, Resources, StorageMode, Tier, TieredResources,
    COMPOSE_SPEC_VERSION, LATEST_SPEC_VERSION, MAX_COMPONENTS, STRICT_ENTERPRISE_VERSION,
};
pub use envelope::{ApiEnvelope, ApiMessage, ApiStatus};
pub use message::{
    host_of, ApplicationLocation, ApplicationMessage, InstallingLocation, LedgerHashRecord,
    MessageKind, PeerMessage, TemporaryMessage,
};
pub use worker::{
    CommandOptions, CommandResult, NodeIndexRequest, NodeIndexResponse, NodeRecord, WorkerRequest,
    WorkerResponse,
};

/// Errors from encoding or parsing proto types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}
