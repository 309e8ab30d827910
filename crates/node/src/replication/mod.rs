//! # Replicated storage
//!
//! Components declaring replicated storage keep their volume in a
//! Syncthing folder shared with every other replica of the application.
//!
//! ## Modules
//!
//! - **leader**: deterministic choice of the authoritative replica.
//! - **syncthing**: [`StorageDaemon`] trait and its REST client.
//! - **folder_state**: per-folder state machine, one step per tick.
//! - **monitor**: [`ReplicationMonitor`], the periodic pass that resolves
//!   peers, configures the daemon and applies the state machine's actions.

pub mod folder_state;
pub mod leader;
pub mod monitor;
pub mod syncthing;

pub use folder_state::{FolderAction, FolderSyncMachine, SyncFolderState, SyncFolderTable};
pub use leader::{designated_leader, is_designated_leader};
pub use monitor::{MonitorReport, ReplicationMonitor};
pub use syncthing::{get_folder_sync_completion, StorageDaemon, SyncCompletion, SyncthingClient};
