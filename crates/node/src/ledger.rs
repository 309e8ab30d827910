//! Ledger daemon access and the app-hash scanner.
//!
//! The ledger is authoritative for three things: whether this node is
//! synced and confirmed, which application hashes were paid for at which
//! height, and the current fleet node list. [`RpcLedgerDaemon`] reads them
//! over the daemon's JSON-RPC interface.
//!
//! ## Scan Pass
//!
//! ```text
//! scannedHeight+1 ──▶ min(tip, from+batch-1)
//!        │
//!        ├─ new paid hash ─▶ appsHashes ─▶ Registry::confirm_hash
//!        └─ range done    ─▶ scannedHeight = to
//! ```
//!
//! A transient failure leaves `scannedHeight` untouched so the range is
//! scanned again on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use skyfleet_proto::{LedgerHashRecord, NodeRecord, Tier};

use crate::error::{OrchestratorError, Result};
use crate::registry::{ConfirmOutcome, Registry};
use crate::store::AppDatabase;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Request(String),

    #[error("ledger rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected ledger response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            LedgerError::Decode(e.to_string())
        } else {
            LedgerError::Request(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStatus {
    pub synced: bool,
    pub height: u64,
    /// This node's own fleet entry is confirmed on the ledger.
    pub confirmed: bool,
}

#[async_trait]
pub trait LedgerDaemon: Send + Sync {
    async fn status(&self) -> std::result::Result<LedgerStatus, LedgerError>;

    /// Paid app hashes in `[from, to]`, ordered by height.
    async fn app_hashes(&self, from: u64, to: u64) -> std::result::Result<Vec<LedgerHashRecord>, LedgerError>;

    async fn node_list(&self) -> std::result::Result<Vec<NodeRecord>, LedgerError>;
}

// ════════════════════════════════════════════════════════════════════════════
// JSON-RPC DAEMON
// ════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

pub struct RpcLedgerDaemon {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    payment_addresses: Vec<String>,
}

impl RpcLedgerDaemon {
    pub fn new(
        url: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
        payment_addresses: Vec<String>,
        timeout: Duration,
    ) -> std::result::Result<Self, LedgerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into(), user, password, payment_addresses })
    }

    async fn call(&self, method: &str, params: Value) -> std::result::Result<Value, LedgerError> {
        debug!(method, "ledger rpc");
        let body = json!({ "jsonrpc": "1.0", "id": "skyfleet", "method": method, "params": params });
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.as_deref());
        }
        // The daemon answers RPC errors with a non-2xx status and a JSON body
        let resp: RpcResponse = req.send().await?.json().await?;
        if let Some(e) = resp.error {
            return Err(LedgerError::Rpc { code: e.code, message: e.message });
        }
        Ok(resp.result)
    }
}

fn as_u64(v: &Value, field: &str) -> std::result::Result<u64, LedgerError> {
    v.get(field).and_then(Value::as_u64).ok_or_else(|| LedgerError::Decode(format!("missing {}", field)))
}

/// Hash carried by an `OP_RETURN` script: 64 ASCII hex chars or 32 raw bytes.
fn op_return_hash(script_hex: &str) -> Option<String> {
    let rest = script_hex.strip_prefix("6a")?;
    let len = usize::from_str_radix(rest.get(..2)?, 16).ok()?;
    let bytes = hex_decode(rest.get(2..)?)?;
    if bytes.len() != len {
        return None;
    }
    match len {
        64 => {
            let text = String::from_utf8(bytes).ok()?;
            text.chars().all(|c| c.is_ascii_hexdigit()).then(|| text.to_ascii_lowercase())
        }
        32 => Some(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
        _ => None,
    }
}

fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len()).step_by(2).map(|i| u8::from_str_radix(raw.get(i..i + 2)?, 16).ok()).collect()
}

fn output_addresses(vout: &Value) -> Vec<&str> {
    let spk = match vout.get("scriptPubKey") {
        Some(s) => s,
        None => return Vec::new(),
    };
    let mut out: Vec<&str> = spk
        .get("addresses")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if let Some(addr) = spk.get("address").and_then(Value::as_str) {
        out.push(addr);
    }
    out
}

/// App hashes paid in one verbose block (`getblock <hash> 2`).
///
/// A transaction qualifies when it pays at least one payment address and
/// carries the hash in an `OP_RETURN` output. The value is the sum paid
/// to payment addresses.
pub fn extract_app_hashes(block: &Value, height: u64, payment_addresses: &[String]) -> Vec<LedgerHashRecord> {
    let txs = match block.get("tx").and_then(Value::as_array) {
        Some(txs) => txs,
        None => return Vec::new(),
    };
    let mut out = Vec::new();
    for tx in txs {
        let txid = tx.get("txid").and_then(Value::as_str).unwrap_or_default();
        let vouts = match tx.get("vout").and_then(Value::as_array) {
            Some(v) => v,
            None => continue,
        };
        let mut paid = 0.0;
        let mut hash = None;
        for vout in vouts {
            if output_addresses(vout).iter().any(|a| payment_addresses.iter().any(|p| p == a)) {
                paid += vout.get("value").and_then(Value::as_f64).unwrap_or(0.0);
            }
            let script = vout.get("scriptPubKey").and_then(|s| s.get("hex")).and_then(Value::as_str);
            if let Some(h) = script.and_then(op_return_hash) {
                hash = Some(h);
            }
        }
        if let (Some(hash), true) = (hash, paid > 0.0) {
            out.push(LedgerHashRecord::new(hash, txid, height, paid));
        }
    }
    out
}

fn parse_node(entry: &Value) -> Option<NodeRecord> {
    let txhash = entry.get("txhash").and_then(Value::as_str)?;
    let outidx = match entry.get("outidx") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return None,
    };
    let endpoint = entry.get("ip").and_then(Value::as_str).filter(|ip| !ip.is_empty())?;
    Some(NodeRecord {
        collateral: format!("{}:{}", txhash, outidx),
        pubkey: entry.get("pubkey").and_then(Value::as_str).unwrap_or_default().to_string(),
        endpoint: endpoint.to_string(),
        tier: entry.get("tier").and_then(Value::as_str).and_then(|t| t.parse::<Tier>().ok()),
    })
}

#[async_trait]
impl LedgerDaemon for RpcLedgerDaemon {
    async fn status(&self) -> std::result::Result<LedgerStatus, LedgerError> {
        let info = self.call("getblockchaininfo", json!([])).await?;
        let height = as_u64(&info, "blocks")?;
        let headers = as_u64(&info, "headers")?;
        let node = self.call("getzelnodestatus", json!([])).await?;
        let confirmed = node.get("status").and_then(Value::as_str) == Some("CONFIRMED");
        Ok(LedgerStatus { synced: height >= headers, height, confirmed })
    }

    async fn app_hashes(&self, from: u64, to: u64) -> std::result::Result<Vec<LedgerHashRecord>, LedgerError> {
        let mut out = Vec::new();
        for height in from..=to {
            let hash = self.call("getblockhash", json!([height])).await?;
            let hash = hash.as_str().ok_or_else(|| LedgerError::Decode("block hash".into()))?.to_string();
            let block = self.call("getblock", json!([hash, 2])).await?;
            out.extend(extract_app_hashes(&block, height, &self.payment_addresses));
        }
        Ok(out)
    }

    async fn node_list(&self) -> std::result::Result<Vec<NodeRecord>, LedgerError> {
        let list = self.call("listzelnodes", json!([])).await?;
        let entries = list.as_array().ok_or_else(|| LedgerError::Decode("node list".into()))?;
        Ok(entries.iter().filter_map(parse_node).collect())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SCANNER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub from: u64,
    pub to: u64,
    pub new_hashes: usize,
    pub confirmed: usize,
    /// Hashes whose message failed confirmation checks.
    pub failed: usize,
}

pub struct LedgerScanner {
    daemon: Arc<dyn LedgerDaemon>,
    db: Arc<dyn AppDatabase>,
    registry: Arc<Registry>,
    batch: u64,
}

impl LedgerScanner {
    pub fn new(daemon: Arc<dyn LedgerDaemon>, db: Arc<dyn AppDatabase>, registry: Arc<Registry>, batch: u64) -> Self {
        Self { daemon, db, registry, batch: batch.max(1) }
    }

    /// Scan the next range. `None` when the ledger is not synced or there
    /// is nothing new.
    pub async fn scan_once(&self, now_ms: u64) -> Result<Option<ScanReport>> {
        let status = self.daemon.status().await?;
        if !status.synced {
            debug!(height = status.height, "ledger not synced, scan deferred");
            return Ok(None);
        }
        let from = self.db.scanned_height().await? + 1;
        if from > status.height {
            return Ok(None);
        }
        let to = status.height.min(from + self.batch - 1);
        let records = self.daemon.app_hashes(from, to).await?;

        let mut report = ScanReport { from, to, ..ScanReport::default() };
        for record in records {
            let record = match self.db.hash_record(&record.hash).await? {
                Some(existing) if !existing.is_missing() => continue,
                Some(existing) => existing,
                None => {
                    self.db.upsert_hash(record.clone()).await?;
                    report.new_hashes += 1;
                    record
                }
            };
            match self.registry.confirm_hash(&record, now_ms).await {
                Ok(ConfirmOutcome::Registered) | Ok(ConfirmOutcome::Updated) => report.confirmed += 1,
                Ok(_) => {}
                Err(e) if e.is_validation() => {
                    warn!(hash = %record.hash, error = %e, "paid message rejected");
                    report.failed += 1;
                }
                Err(e) => return Err(OrchestratorError::from(e)),
            }
        }
        self.db.set_scanned_height(to).await?;
        if report.new_hashes > 0 {
            info!(from, to, new = report.new_hashes, confirmed = report.confirmed, "ledger range scanned");
        }
        Ok(Some(report))
    }
}
