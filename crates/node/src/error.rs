//! Orchestrator error type and its three kinds.
//!
//! | Kind         | Meaning                                   | Handling                         |
//! |--------------|-------------------------------------------|----------------------------------|
//! | `Validation` | Spec malformed or non-compliant           | Rejected before any mutation     |
//! | `Transient`  | Peer, database or daemon unavailable      | Retried on the next tick         |
//! | `FatalLocal` | Container runtime unreachable, disk full  | App marked failed, batch goes on |

use thiserror::Error;

use crate::admission::ValidationError;
use crate::images::ImageError;
use crate::ledger::LedgerError;
use crate::registry::RegistryError;
use crate::replication::syncthing::DaemonError;
use crate::runtime_service::RuntimeError;
use crate::store::StoreError;
use crate::transport::TransportError;
use crate::worker::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    FatalLocal,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("container runtime: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("image registry: {0}")]
    Image(#[from] ImageError),

    #[error("peer transport: {0}")]
    Transport(#[from] TransportError),

    #[error("storage daemon: {0}")]
    Daemon(#[from] DaemonError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("worker: {0}")]
    Worker(#[from] WorkerError),

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("application {0} is not installed")]
    NotInstalled(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_) => ErrorKind::Validation,
            OrchestratorError::Registry(e) if e.is_validation() => ErrorKind::Validation,
            OrchestratorError::Registry(_) => ErrorKind::Transient,
            OrchestratorError::Image(ImageError::Unavailable(_)) => ErrorKind::Transient,
            OrchestratorError::Image(_) => ErrorKind::Validation,
            OrchestratorError::Runtime(RuntimeError::Unreachable(_)) => ErrorKind::FatalLocal,
            OrchestratorError::Runtime(_) => ErrorKind::Transient,
            OrchestratorError::Io(_) => ErrorKind::FatalLocal,
            OrchestratorError::NotInstalled(_) => ErrorKind::Validation,
            OrchestratorError::Store(_)
            | OrchestratorError::Transport(_)
            | OrchestratorError::Daemon(_)
            | OrchestratorError::Ledger(_)
            | OrchestratorError::Worker(_)
            | OrchestratorError::Busy(_) => ErrorKind::Transient,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
