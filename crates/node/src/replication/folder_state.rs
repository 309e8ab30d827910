//! Per-folder sync state machine.
//!
//! ```text
//!            new install                    restart, folder exists
//!                │                                   │
//!                ▼                                   ▼
//!   ResetAndReceive ──▶ ReceiveOnly ◀──────── SeenAfterRestart
//!                          │   ▲                     │
//!          leader / synced │   │ wait (ticks += 1)   │ folder is sendreceive
//!          / wait expired  ▼   │                     ▼
//!                        SendReceive ◀───────────────┘
//! ```
//!
//! The table is in-memory only. After a process restart it is rebuilt
//! from scratch; the first tick over a pre-existing folder is skipped so
//! nothing acts on stale state.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use skyfleet_proto::ApplicationLocation;

use super::leader::is_designated_leader;
use super::syncthing::{get_folder_sync_completion, FolderType, StorageDaemon, SyncCompletion};

/// State of one replicated folder (keyed by its folder id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFolderState {
    /// Folder pre-dated this process; seen once, acted on from the next tick.
    SeenAfterRestart,
    ReceiveOnly { executions: u32 },
    SendReceive { restarted: bool },
}

impl SyncFolderState {
    pub fn is_send_receive(&self) -> bool {
        matches!(self, SyncFolderState::SendReceive { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteReason {
    Leader,
    Synced,
    WaitExpired,
}

/// What the monitor must do for a folder after a state machine step.
#[derive(Debug, Clone, PartialEq)]
pub enum FolderAction {
    /// Stop the container, wipe its data, configure the folder receive-only.
    ResetAndReceive,
    SkipFirstTick,
    /// Keep receiving; `percentage` is `None` when completion is unknown.
    Wait { executions: u32, percentage: Option<f64> },
    /// Switch to send-receive and restart the container.
    Promote(PromoteReason),
    /// Send-receive, container stopped: start it.
    StartContainer,
    AlreadySyncing,
}

/// Table of folder states, owned by the orchestrator state.
#[derive(Debug, Default)]
pub struct SyncFolderTable {
    inner: Mutex<HashMap<String, SyncFolderState>>,
}

impl SyncFolderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, folder_id: &str) -> Option<SyncFolderState> {
        self.inner.lock().get(folder_id).copied()
    }

    pub fn set(&self, folder_id: &str, state: SyncFolderState) {
        self.inner.lock().insert(folder_id.to_string(), state);
    }

    pub fn remove(&self, folder_id: &str) -> Option<SyncFolderState> {
        self.inner.lock().remove(folder_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Observed facts about one folder for a single step.
#[derive(Debug, Clone)]
pub struct FolderContext<'a> {
    pub folder_id: &'a str,
    /// Folder type in the daemon config, `None` when not configured.
    pub configured: Option<FolderType>,
    pub container_running: bool,
    pub peers: &'a [ApplicationLocation],
    pub self_ip: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct FolderSyncMachine {
    pub leader_tolerance_ms: u64,
    pub max_wait_ticks: u32,
}

impl FolderSyncMachine {
    pub fn new(leader_tolerance_ms: u64, max_wait_ticks: u32) -> Self {
        Self { leader_tolerance_ms, max_wait_ticks }
    }

    /// Advance the state of `ctx.folder_id` by one tick.
    pub async fn manage_folder_sync_state(
        &self,
        table: &SyncFolderTable,
        daemon: &dyn StorageDaemon,
        ctx: &FolderContext<'_>,
    ) -> FolderAction {
        let id = ctx.folder_id;
        let current = match table.get(id) {
            None if ctx.configured.is_none() => {
                info!(folder = id, "new replicated folder, resetting to receive-only");
                table.set(id, SyncFolderState::ReceiveOnly { executions: 1 });
                return FolderAction::ResetAndReceive;
            }
            None => {
                debug!(folder = id, "pre-existing folder after restart, skipping one tick");
                table.set(id, SyncFolderState::SeenAfterRestart);
                return FolderAction::SkipFirstTick;
            }
            Some(SyncFolderState::SeenAfterRestart) => match ctx.configured {
                Some(FolderType::SendReceive) => SyncFolderState::SendReceive { restarted: true },
                _ => SyncFolderState::ReceiveOnly { executions: 1 },
            },
            Some(state) => state,
        };

        match current {
            SyncFolderState::ReceiveOnly { executions } => self.step_receive_only(table, daemon, ctx, executions).await,
            SyncFolderState::SendReceive { .. } => {
                table.set(id, SyncFolderState::SendReceive { restarted: true });
                if ctx.container_running {
                    FolderAction::AlreadySyncing
                } else {
                    FolderAction::StartContainer
                }
            }
            // Resolved above
            SyncFolderState::SeenAfterRestart => FolderAction::SkipFirstTick,
        }
    }

    async fn step_receive_only(
        &self,
        table: &SyncFolderTable,
        daemon: &dyn StorageDaemon,
        ctx: &FolderContext<'_>,
        executions: u32,
    ) -> FolderAction {
        let id = ctx.folder_id;
        let promote = |reason| {
            info!(folder = id, ?reason, "promoting folder to send-receive");
            table.set(id, SyncFolderState::SendReceive { restarted: true });
            FolderAction::Promote(reason)
        };

        if is_designated_leader(ctx.peers, ctx.self_ip, self.leader_tolerance_ms) {
            return promote(PromoteReason::Leader);
        }
        let completion = get_folder_sync_completion(daemon, id).await;
        if completion.is_synced() {
            return promote(PromoteReason::Synced);
        }
        if executions >= self.max_wait_ticks {
            return promote(PromoteReason::WaitExpired);
        }
        let executions = executions + 1;
        table.set(id, SyncFolderState::ReceiveOnly { executions });
        let percentage = match completion {
            SyncCompletion::Known { percentage, .. } => Some(percentage),
            SyncCompletion::Unknown => None,
        };
        debug!(folder = id, executions, ?percentage, "still receiving");
        FolderAction::Wait { executions, percentage }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
