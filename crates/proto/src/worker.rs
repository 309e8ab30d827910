//! Worker IPC Protocol
//!
//! Shell commands and bulk node indexing run off the main loop. Every
//! request carries a correlation `id` that the matching response echoes.
//!
//! ```text
//! WorkerRequest   { id, command, options }
//!       │
//!       ▼
//! WorkerResponse  { id, result: { stdout, stderr, error, exit_code } }
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::app::Tier;

/// Options for a shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOptions {
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Kill the command after this many milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub options: CommandOptions,
}

/// Outcome of a command. `error` is set when the command could not be
/// spawned, timed out, or exited non-zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { error: Some(error.into()), ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,
    pub result: CommandResult,
}

// ════════════════════════════════════════════════════════════════════════════
// BULK NODE INDEX
// ════════════════════════════════════════════════════════════════════════════

/// One fleet node as published by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Long-lived identity (collateral outpoint `txid:index`).
    pub collateral: String,
    pub pubkey: String,
    /// Current network endpoint, normalised `ip:port`.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIndexRequest {
    pub id: String,
    pub nodes: Vec<NodeRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIndexResponse {
    pub id: String,
    pub by_identity: HashMap<String, NodeRecord>,
    pub by_endpoint: HashMap<String, NodeRecord>,
}

/// Default endpoint port when a record omits one.
pub const DEFAULT_NODE_PORT: u16 = 16127;

/// Normalise an endpoint to `ip:port`.
pub fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => trimmed.to_string(),
        _ => format!("{}:{}", trimmed, DEFAULT_NODE_PORT),
    }
}

/// Build both lookup maps. Later records win on duplicate keys.
pub fn index_nodes(id: String, nodes: Vec<NodeRecord>) -> NodeIndexResponse {
    let mut by_identity = HashMap::with_capacity(nodes.len());
    let mut by_endpoint = HashMap::with_capacity(nodes.len());
    for mut node in nodes {
        node.endpoint = normalize_endpoint(&node.endpoint);
        by_endpoint.insert(node.endpoint.clone(), node.clone());
        by_identity.insert(node.collateral.clone(), node);
    }
    NodeIndexResponse { id, by_identity, by_endpoint }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(collateral: &str, endpoint: &str) -> NodeRecord {
        NodeRecord {
            collateral: collateral.to_string(),
            pubkey: format!("pk-{}", collateral),
            endpoint: endpoint.to_string(),
            tier: Some(Tier::Cumulus),
        }
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("1.2.3.4"), "1.2.3.4:16127");
        assert_eq!(normalize_endpoint(" 1.2.3.4:16137 "), "1.2.3.4:16137");
    }

    #[test]
    fn test_index_nodes_both_maps() {
        let resp = index_nodes(
            "req-1".into(),
            vec![record("tx1:0", "1.1.1.1"), record("tx2:1", "2.2.2.2:16137")],
        );
        assert_eq!(resp.id, "req-1");
        assert_eq!(resp.by_identity.len(), 2);
        assert_eq!(resp.by_endpoint["1.1.1.1:16127"].collateral, "tx1:0");
        assert_eq!(resp.by_identity["tx2:1"].endpoint, "2.2.2.2:16137");
    }

    #[test]
    fn test_command_result_success() {
        let ok = CommandResult { exit_code: Some(0), ..CommandResult::default() };
        assert!(ok.is_success());
        assert!(!CommandResult::failed("spawn").is_success());
    }
}
