//! # Skyfleet Node Entry Point
//!
//! ```text
//! skyfleet-node --config /etc/skyfleet/node.toml
//! ```
//!
//! ## Initialization Flow
//! 1. Parse arguments, load and validate configuration
//! 2. Start the command worker
//! 3. Build ledger, transport, runtime, storage daemon and registry
//! 4. Refresh node status and peers, run boot recovery
//! 5. Spawn every periodic task
//! 6. Serve HTTP until Ctrl+C, then stop the tasks

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn, Level};

use skyfleet_common::config::{load_from_file, NodeConfig};
use skyfleet_proto::worker::normalize_endpoint;

use skyfleet_node::hash_sync::HashSync;
use skyfleet_node::replication::folder_state::FolderSyncMachine;
use skyfleet_node::{
    build_router, now_ms, Admission, AppDatabase, ContainerLifecycle, ContainerRuntime, DockerCliRuntime,
    DockerManifestRegistry, FileDatabase, HttpPeerTransport, ImageRegistry, LedgerDaemon, LedgerScanner, Maintenance,
    NodeAppState, OrchestratorState, OutboundRequests, PeerInbox, PeerTransport,
    PeriodicTask, RecoveryReconciler, Registry, ReplicationMonitor, RpcLedgerDaemon, Spawner, StorageDaemon,
    SyncthingClient, TaskHandle, TokenRoleVerifier,
};

const WORKER_QUEUE: usize = 64;
const DOCKER_TIMEOUT_MS: u64 = 5 * 60 * 1000;
const LEDGER_TIMEOUT: Duration = Duration::from_secs(15);
const PEER_TIMEOUT: Duration = Duration::from_secs(10);
const PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Parser)]
#[command(name = "skyfleet-node", version, about = "Skyfleet compute node orchestrator")]
struct Args {
    /// Node configuration file (TOML).
    #[arg(long, env = "SKYFLEET_CONFIG")]
    config: Option<PathBuf>,
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s.max(1))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };

    let level = config.node.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    info!("═══════════════════════════════════════════════════════════════");
    info!("                     Skyfleet Node                              ");
    info!("═══════════════════════════════════════════════════════════════");
    info!(ip = %config.node.ip, tier = %config.node.tier, "node identity");

    let shutdown = Arc::new(Notify::new());
    let (worker, worker_handle) = skyfleet_node::CommandWorker::start(WORKER_QUEUE, shutdown.clone());

    // ── collaborators ───────────────────────────────────────────────────────
    let store = FileDatabase::open(&config.store.path).with_context(|| format!("opening {}", config.store.path))?;
    info!(path = %store.path().display(), "collections opened");
    let db: Arc<dyn AppDatabase> = Arc::new(store);
    let state = Arc::new(OrchestratorState::new(config.node.ip.clone(), config.node.tier, config.dos.clone()));
    let registry = Arc::new(Registry::new(
        db.clone(),
        config.registry.clone(),
        &config.locations,
        config.spawner.installing_ttl_ms,
    ));
    let ledger: Arc<dyn LedgerDaemon> = Arc::new(RpcLedgerDaemon::new(
        config.ledger.rpc_url.clone(),
        config.ledger.rpc_user.clone(),
        config.ledger.rpc_password.clone(),
        config.ledger.payment_addresses.clone(),
        LEDGER_TIMEOUT,
    )?);
    let http_transport = Arc::new(HttpPeerTransport::new(
        normalize_endpoint(&config.node.ip),
        config.node.max_outgoing_peers,
        PEER_TIMEOUT,
    )?);
    http_transport.set_outgoing(config.node.bootstrap_peers.iter().map(|p| normalize_endpoint(p)));
    let transport: Arc<dyn PeerTransport> = http_transport.clone();
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCliRuntime::new(worker.clone(), DOCKER_TIMEOUT_MS));
    let images: Arc<dyn ImageRegistry> = Arc::new(DockerManifestRegistry::new(worker.clone(), DOCKER_TIMEOUT_MS));
    let daemon: Arc<dyn StorageDaemon> = Arc::new(SyncthingClient::new(
        config.replication.syncthing_url.clone(),
        config.replication.api_key.clone(),
        Duration::from_millis(config.replication.request_timeout_ms),
    )?);
    let outbound = Arc::new(OutboundRequests::new(Duration::from_millis(config.outbound.max_age_ms)));

    let lifecycle = Arc::new(
        ContainerLifecycle::new(
            runtime.clone(),
            db.clone(),
            registry.clone(),
            transport.clone(),
            state.clone(),
            &config.replication.data_root,
        )
        .with_storage(daemon.clone()),
    );
    let admission = Arc::new(Admission::new(
        config.hardware.clone(),
        config.ports.clone(),
        config.images.clone(),
        &config.spawner,
    ));
    let spawner = Arc::new(Spawner::new(
        state.clone(),
        registry.clone(),
        db.clone(),
        admission,
        images,
        transport.clone(),
        lifecycle.clone(),
        config.spawner.clone(),
        config.node.min_peers,
        config.node.geolocation.clone(),
    ));
    let hash_sync = Arc::new(HashSync::new(
        db.clone(),
        state.clone(),
        transport.clone(),
        outbound.clone(),
        config.hash_sync.clone(),
    ));
    let scanner = Arc::new(LedgerScanner::new(ledger.clone(), db.clone(), registry.clone(), config.ledger.scan_batch));
    let maintenance = Arc::new(Maintenance::new(
        state.clone(),
        db.clone(),
        registry.clone(),
        runtime.clone(),
        transport.clone(),
        ledger.clone(),
        lifecycle.clone(),
        config.spawner.instances_slack,
    ));
    let recovery = Arc::new(RecoveryReconciler::new(state.clone(), db.clone(), runtime.clone(), lifecycle.clone()));
    let monitor = Arc::new(ReplicationMonitor::new(
        state.clone(),
        db.clone(),
        registry.clone(),
        runtime.clone(),
        daemon.clone(),
        transport.clone(),
        FolderSyncMachine::new(config.replication.leader_tie_tolerance_ms, config.replication.max_sync_wait_ticks),
        &config.replication.data_root,
    ));
    let inbox = Arc::new(PeerInbox::new(registry.clone(), transport.clone(), &config.node.ip));

    // ── boot ────────────────────────────────────────────────────────────────
    if let Err(e) = maintenance.check_node_status(now_ms()).await {
        warn!(error = %e, "ledger daemon not reachable at boot");
    }
    match http_transport.refresh_peers(ledger.as_ref(), &worker).await {
        Ok(count) => info!(peers = count, "peer list loaded"),
        Err(e) => warn!(error = %e, "peer list unavailable at boot"),
    }
    match recovery.recover_stopped_apps(now_ms()).await {
        Ok(report) => info!(started = ?report.started, removed = ?report.removed, failed = ?report.failed, "boot recovery"),
        Err(e) => error!(error = %e, "boot recovery failed"),
    }

    // ── periodic tasks ──────────────────────────────────────────────────────
    let mut tasks: Vec<TaskHandle> = Vec::new();
    {
        let maintenance = maintenance.clone();
        let transport = http_transport.clone();
        let ledger = ledger.clone();
        let worker = worker.clone();
        tasks.push(PeriodicTask::new("node-status", secs(config.node.status_interval_secs)).spawn(move || {
            let maintenance = maintenance.clone();
            let transport = transport.clone();
            let ledger = ledger.clone();
            let worker = worker.clone();
            async move {
                if let Err(e) = transport.refresh_peers(ledger.as_ref(), &worker).await {
                    debug!(error = %e, "peer refresh failed");
                }
                if let Err(e) = maintenance.check_node_status(now_ms()).await {
                    warn!(error = %e, "node status check failed");
                }
                match maintenance.check_duplicate_apps().await {
                    Ok(dups) if !dups.is_empty() => warn!(apps = ?dups, "duplicate applications installed"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "duplicate check failed"),
                }
            }
        }));
    }
    {
        let scanner = scanner.clone();
        tasks.push(PeriodicTask::new("ledger-scan", secs(config.ledger.scan_interval_secs)).spawn(move || {
            let scanner = scanner.clone();
            async move {
                match scanner.scan_once(now_ms()).await {
                    Ok(Some(report)) => debug!(?report, "ledger scanned"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "ledger scan failed"),
                }
            }
        }));
    }
    {
        let hash_sync = hash_sync.clone();
        tasks.push(
            PeriodicTask::new("hash-sync", secs(config.hash_sync.interval_secs))
                .with_initial_delay(Duration::from_secs(60))
                .spawn(move || {
                    let hash_sync = hash_sync.clone();
                    async move {
                        if let Err(e) = hash_sync.run_once().await {
                            warn!(error = %e, "hash sync failed");
                        }
                    }
                }),
        );
    }
    {
        let spawner = spawner.clone();
        tasks.push(
            PeriodicTask::new("spawner", secs(config.spawner.interval_secs))
                .with_initial_delay(secs(config.spawner.interval_secs))
                .spawn(move || {
                    let spawner = spawner.clone();
                    async move {
                        match spawner.try_spawn_once().await {
                            Ok(outcome) => debug!(?outcome, "spawn pass"),
                            Err(e) => warn!(error = %e, "spawn pass failed"),
                        }
                    }
                }),
        );
    }
    {
        let maintenance = maintenance.clone();
        tasks.push(PeriodicTask::new("maintenance", secs(config.spawner.interval_secs)).spawn(move || {
            let maintenance = maintenance.clone();
            async move {
                match maintenance.remove_expired_apps().await {
                    Ok(report) if !report.processed.is_empty() => info!(apps = ?report.processed, "expired apps removed"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "expiry pass failed"),
                }
                match maintenance.remove_over_provisioned(now_ms()).await {
                    Ok(report) if !report.processed.is_empty() => info!(apps = ?report.processed, "over-provisioned apps removed"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "over-provision pass failed"),
                }
            }
        }));
    }
    {
        let maintenance = maintenance.clone();
        tasks.push(PeriodicTask::new("locations", secs(config.locations.broadcast_interval_secs)).spawn(move || {
            let maintenance = maintenance.clone();
            async move {
                if let Err(e) = maintenance.broadcast_running(now_ms()).await {
                    warn!(error = %e, "location heartbeat failed");
                }
            }
        }));
    }
    {
        let monitor = monitor.clone();
        tasks.push(PeriodicTask::new("replication", secs(config.replication.monitor_interval_secs)).spawn(move || {
            let monitor = monitor.clone();
            async move {
                match monitor.run_once(now_ms()).await {
                    Ok(report) if !report.failed.is_empty() => warn!(failed = ?report.failed, "replication pass had failures"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "replication pass failed"),
                }
            }
        }));
    }
    {
        let recovery = recovery.clone();
        tasks.push(
            PeriodicTask::new("recovery", secs(config.recovery.interval_secs))
                .with_initial_delay(secs(config.recovery.interval_secs))
                .spawn(move || {
                    let recovery = recovery.clone();
                    async move {
                        if let Err(e) = recovery.recover_stopped_apps(now_ms()).await {
                            debug!(error = %e, "recovery pass not run");
                        }
                    }
                }),
        );
    }
    {
        let registry = registry.clone();
        let state = state.clone();
        tasks.push(PeriodicTask::new("purge", PURGE_INTERVAL).spawn(move || {
            let registry = registry.clone();
            let state = state.clone();
            async move {
                let now = now_ms();
                let temporary = registry.purge_temporary(now).await.unwrap_or_else(|e| {
                    warn!(error = %e, "temporary message purge failed");
                    0
                });
                let locations = registry.purge_expired_locations(now).await.unwrap_or_else(|e| {
                    warn!(error = %e, "location purge failed");
                    0
                });
                let errors = state.purge_install_errors(now);
                debug!(temporary, locations, errors, "purged expired records");
            }
        }));
    }

    // ── HTTP ────────────────────────────────────────────────────────────────
    let app = Arc::new(NodeAppState {
        state: state.clone(),
        db: db.clone(),
        inbox,
        hash_sync,
        lifecycle,
        transport,
        daemon: Some(daemon),
        verifier: Arc::new(TokenRoleVerifier::new(config.node.operator_token.clone())),
        min_peers: config.node.min_peers,
    });
    let listener = tokio::net::TcpListener::bind(&config.node.api_bind)
        .await
        .with_context(|| format!("binding {}", config.node.api_bind))?;
    info!("API available at http://{}", config.node.api_bind);

    let server = axum::serve(listener, build_router(app)).with_graceful_shutdown(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server stopped");
    }

    for task in tasks {
        task.shutdown().await;
    }
    outbound.clear();
    shutdown.notify_waiters();
    let _ = worker_handle.await;

    info!("═══════════════════════════════════════════════════════════════");
    info!("                    Node stopped cleanly                       ");
    info!("═══════════════════════════════════════════════════════════════");
    Ok(())
}
