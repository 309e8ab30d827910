//! # Skyfleet Node Crate
//!
//! Orchestrator daemon for a node of the Skyfleet compute fleet. Every node
//! keeps its own copy of the global application registry, decides on its
//! own whether to host an application, and reports what it runs to its
//! peers. There is no central scheduler.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                                Node                                  │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  peers ──▶ PeerInbox ──▶ Registry ◀── LedgerScanner ◀── ledger daemon│
//! │                │            ▲  │                                     │
//! │                ▼            │  ▼                                     │
//! │            re-gossip    HashSync   Spawner ──▶ Admission             │
//! │                                      │                               │
//! │                                      ▼                               │
//! │                     ContainerLifecycle ──▶ ContainerRuntime          │
//! │                          ▲        ▲                                  │
//! │            Maintenance ──┘        └── RecoveryReconciler             │
//! │                                                                      │
//! │  ReplicationMonitor ──▶ FolderSyncMachine ──▶ StorageDaemon          │
//! │                                                                      │
//! │  OrchestratorState: flags, NodeStatus, DosState, ports, sync folders │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Invariants
//!
//! 1. **Flags**: every pass that installs or removes applications holds
//!    `installation_in_progress` or `removal_in_progress`, never both.
//!
//! 2. **Fail closed / fail open**: validation rejects on any doubt; liveness
//!    checks (recovery) assume valid on lookup errors.
//!
//! 3. **Isolation**: a failing app is reported and the pass continues.
//!
//! 4. **No panics**: production paths propagate errors, tidak ada unwrap.

pub mod admission;
pub mod dos;
pub mod error;
pub mod handlers;
pub mod hash_sync;
pub mod health;
pub mod images;
pub mod inbox;
pub mod ledger;
pub mod lifecycle;
pub mod maintenance;
pub mod mock;
pub mod outbound;
pub mod recovery;
pub mod registry;
pub mod replication;
pub mod runtime_service;
pub mod spawner;
pub mod state;
pub mod store;
pub mod timer;
pub mod transport;
pub mod worker;

use std::time::{SystemTime, UNIX_EPOCH};

pub use admission::{Admission, ValidationError};
pub use dos::{DosSnapshot, DosState, InstalledApp};
pub use error::{ErrorKind, OrchestratorError, Result};
pub use hash_sync::{HashSync, HashSyncOutcome, SkipReason};
pub use health::NodeHealth;
pub use images::{DockerManifestRegistry, ImageManifest, ImageRegistry};
pub use inbox::{InboxOutcome, PeerInbox};
pub use ledger::{LedgerDaemon, LedgerScanner, LedgerStatus, RpcLedgerDaemon};
pub use lifecycle::{AppLifecycle, ContainerLifecycle};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use outbound::OutboundRequests;
pub use recovery::{app_has_valid_location_on_node, RecoveryReconciler, RecoveryReport};
pub use registry::{ReceiveOutcome, Registry, RegistryError};
pub use replication::{FolderSyncMachine, ReplicationMonitor, StorageDaemon, SyncthingClient};
pub use runtime_service::{ContainerRuntime, DockerCliRuntime};
pub use spawner::{SpawnOutcome, Spawner};
pub use state::{NodeStatus, OrchestratorState};
pub use store::{AppDatabase, FileDatabase, MemoryDatabase};
pub use timer::{PeriodicTask, TaskHandle};
pub use transport::{HttpPeerTransport, PeerTransport};
pub use worker::CommandWorker;

// HTTP API handlers (Axum)
pub use handlers::{build_router, NodeAppState, RoleVerifier, TokenRoleVerifier};

/// Current unix timestamp in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
