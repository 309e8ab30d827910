//! Off-loop worker for shell commands and bulk node indexing.
//!
//! Callers hand a typed job to the worker task over an `mpsc` channel;
//! every job carries its own `oneshot` reply, so a response can only ever
//! reach the caller that asked for it. The correlation id is still set on
//! both sides so logs line up.
//!
//! ```text
//! caller ──Job{request, reply}──▶ worker task ──spawn──▶ sh -c <command>
//!    ▲                                                        │
//!    └──────────────── WorkerResponse{id, result} ◀───────────┘
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use skyfleet_proto::worker::index_nodes;
use skyfleet_proto::{CommandOptions, CommandResult, NodeIndexRequest, NodeIndexResponse, NodeRecord, WorkerRequest, WorkerResponse};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker stopped")]
    Closed,

    #[error("worker dropped the reply for {0}")]
    Canceled(String),
}

enum Job {
    Command { request: WorkerRequest, reply: oneshot::Sender<WorkerResponse> },
    Index { request: NodeIndexRequest, reply: oneshot::Sender<NodeIndexResponse> },
}

/// Handle to the worker task. Cheap to clone.
#[derive(Clone)]
pub struct CommandWorker {
    tx: mpsc::Sender<Job>,
}

impl CommandWorker {
    /// Start the worker task. It stops when `shutdown` is notified or every
    /// handle is dropped.
    pub fn start(queue: usize, shutdown: Arc<Notify>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue.max(1));
        let handle = tokio::spawn(async move {
            info!("command worker started");
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("command worker shutting down");
                        break;
                    }
                    job = rx.recv() => match job {
                        Some(job) => {
                            tokio::spawn(handle_job(job));
                        }
                        None => break,
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    pub async fn run_command(&self, command: impl Into<String>, options: CommandOptions) -> Result<WorkerResponse, WorkerError> {
        let request = WorkerRequest { id: Uuid::new_v4().to_string(), command: command.into(), options };
        let id = request.id.clone();
        let (reply, rx) = oneshot::channel();
        self.tx.send(Job::Command { request, reply }).await.map_err(|_| WorkerError::Closed)?;
        rx.await.map_err(|_| WorkerError::Canceled(id))
    }

    /// Build identity and endpoint maps for a node list off the async loop.
    pub async fn index_nodes(&self, nodes: Vec<NodeRecord>) -> Result<NodeIndexResponse, WorkerError> {
        let request = NodeIndexRequest { id: Uuid::new_v4().to_string(), nodes };
        let id = request.id.clone();
        let (reply, rx) = oneshot::channel();
        self.tx.send(Job::Index { request, reply }).await.map_err(|_| WorkerError::Closed)?;
        rx.await.map_err(|_| WorkerError::Canceled(id))
    }
}

async fn handle_job(job: Job) {
    match job {
        Job::Command { request, reply } => {
            let id = request.id.clone();
            let result = execute(&request).await;
            debug!(id = %id, success = result.is_success(), "command finished");
            if reply.send(WorkerResponse { id, result }).is_err() {
                debug!("command caller went away");
            }
        }
        Job::Index { request, reply } => {
            let NodeIndexRequest { id, nodes } = request;
            let count = nodes.len();
            let fallback_id = id.clone();
            let response = tokio::task::spawn_blocking(move || index_nodes(id, nodes)).await.unwrap_or_else(|e| {
                warn!(error = %e, "node indexing panicked");
                NodeIndexResponse { id: fallback_id, ..NodeIndexResponse::default() }
            });
            debug!(count, "node index built");
            let _ = reply.send(response);
        }
    }
}

async fn execute(request: &WorkerRequest) -> CommandResult {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&request.command)
        .envs(&request.options.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &request.options.cwd {
        cmd.current_dir(cwd);
    }

    let output = match request.options.timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), cmd.output()).await {
            Ok(out) => out,
            Err(_) => return CommandResult::failed(format!("timed out after {}ms", ms)),
        },
        None => cmd.output().await,
    };

    match output {
        Ok(out) => {
            let exit_code = out.status.code();
            let error = if out.status.success() {
                None
            } else {
                Some(format!("exited with {}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())))
            };
            CommandResult {
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                error,
                exit_code,
            }
        }
        Err(e) => CommandResult::failed(format!("spawn failed: {}", e)),
    }
}

/// Quote `raw` for `sh`.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "'\\''"))
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> CommandWorker {
        CommandWorker::start(8, Arc::new(Notify::new())).0
    }

    #[tokio::test]
    async fn test_run_command_success() {
        let w = worker();
        let resp = w.run_command("echo hello", CommandOptions::default()).await.expect("resp");
        assert!(resp.result.is_success());
        assert_eq!(resp.result.stdout.trim(), "hello");
        assert!(!resp.id.is_empty());
    }

    #[tokio::test]
    async fn test_run_command_failure_and_env() {
        let w = worker();
        let mut options = CommandOptions::default();
        options.env.insert("SKYFLEET_TEST".into(), "v1".into());
        let resp = w.run_command("echo $SKYFLEET_TEST; exit 3", options).await.expect("resp");
        assert_eq!(resp.result.exit_code, Some(3));
        assert_eq!(resp.result.stdout.trim(), "v1");
        assert!(resp.result.error.is_some());
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let w = worker();
        let options = CommandOptions { timeout_ms: Some(50), ..CommandOptions::default() };
        let resp = w.run_command("sleep 5", options).await.expect("resp");
        assert!(resp.result.error.expect("error").contains("timed out"));
    }

    #[tokio::test]
    async fn test_index_nodes_bulk() {
        let w = worker();
        let nodes = vec![NodeRecord {
            collateral: "tx:0".into(),
            pubkey: "pk".into(),
            endpoint: "1.2.3.4".into(),
            tier: None,
        }];
        let resp = w.index_nodes(nodes).await.expect("resp");
        assert!(resp.by_endpoint.contains_key("1.2.3.4:16127"));
        assert!(resp.by_identity.contains_key("tx:0"));
    }

    #[tokio::test]
    async fn test_stopped_worker_reports_closed() {
        let shutdown = Arc::new(Notify::new());
        let (w, handle) = CommandWorker::start(1, shutdown.clone());
        shutdown.notify_one();
        handle.await.expect("join");
        assert_eq!(w.run_command("true", CommandOptions::default()).await, Err(WorkerError::Closed));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
