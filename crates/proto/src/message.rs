//! Registry Messages, Locations and Peer Gossip Types
//!
//! ## Message Lifecycle
//!
//! ```text
//! owner ──ApplicationMessage──▶ peers ──▶ temporary store (TTL)
//!                                              │
//!                       ledger reports paid hash (LedgerHashRecord)
//!                                              ▼
//!                                   permanent message + app info
//! ```
//!
//! An [`ApplicationLocation`] is a node's self-renewed claim to host an
//! application. It is alive only while `expire_at` lies in the future.

use serde::{Deserialize, Serialize};

use crate::app::ApplicationSpecification;
use crate::ProtoError;

// ════════════════════════════════════════════════════════════════════════════
// APPLICATION MESSAGE
// ════════════════════════════════════════════════════════════════════════════

/// Kind of registry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Register,
    Update,
}

impl MessageKind {
    /// Tag prepended to the signing payload.
    pub fn tag(&self) -> &'static str {
        match self {
            MessageKind::Register => "fluxappregister",
            MessageKind::Update => "fluxappupdate",
        }
    }
}

/// Signed envelope carrying an [`ApplicationSpecification`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    /// Declared content hash (lowercase hex SHA-256).
    pub hash: String,
    pub kind: MessageKind,
    pub version: u32,
    pub specification: ApplicationSpecification,
    pub owner_address: String,
    pub signature: String,
    /// Owner-side creation time (unix ms).
    pub timestamp: u64,
    /// Ledger height at which the paying transaction was seen. `None`
    /// while the message is still temporary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    /// Amount paid for this message, once confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_paid: Option<f64>,
}

impl ApplicationMessage {
    /// Bytes covered by the owner's signature.
    pub fn signing_payload(&self) -> Result<String, ProtoError> {
        Ok(format!(
            "{}{}{}{}",
            self.kind.tag(),
            self.version,
            self.specification.canonical_json()?,
            self.timestamp
        ))
    }

    /// Bytes covered by the content hash: payload plus signature.
    pub fn hash_payload(&self) -> Result<String, ProtoError> {
        Ok(format!("{}{}", self.signing_payload()?, self.signature))
    }

    pub fn name(&self) -> &str {
        &self.specification.name
    }
}

/// A message held until its paying transaction shows up on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporaryMessage {
    pub message: ApplicationMessage,
    /// Local receive time (unix ms).
    pub received_at: u64,
    /// Local expiry (unix ms).
    pub expire_at: u64,
}

impl TemporaryMessage {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expire_at <= now_ms
    }
}

// ════════════════════════════════════════════════════════════════════════════
// LEDGER HASH RECORD
// ════════════════════════════════════════════════════════════════════════════

/// Mirror of a paid application hash observed on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerHashRecord {
    pub hash: String,
    pub txid: String,
    pub height: u64,
    /// Value paid by the transaction.
    pub value: f64,
    /// True once the full message is known locally.
    #[serde(default)]
    pub message: bool,
    /// True once peers repeatedly failed to provide the message.
    #[serde(default)]
    pub message_not_found: bool,
    /// Number of peer requests issued so far.
    #[serde(default)]
    pub request_attempts: u32,
}

impl LedgerHashRecord {
    pub fn new(hash: impl Into<String>, txid: impl Into<String>, height: u64, value: f64) -> Self {
        Self {
            hash: hash.into(),
            txid: txid.into(),
            height,
            value,
            message: false,
            message_not_found: false,
            request_attempts: 0,
        }
    }

    /// Unresolved and still worth asking peers about.
    pub fn is_missing(&self) -> bool {
        !self.message && !self.message_not_found
    }
}

// ════════════════════════════════════════════════════════════════════════════
// LOCATIONS
// ════════════════════════════════════════════════════════════════════════════

/// A node's time-bounded claim to be hosting `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationLocation {
    pub name: String,
    pub hash: String,
    /// Node endpoint, `ip` or `ip:port`.
    pub ip: String,
    pub broadcasted_at: u64,
    /// Set once the replica is up and serving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_since: Option<u64>,
    pub expire_at: u64,
}

impl ApplicationLocation {
    pub fn is_alive(&self, now_ms: u64) -> bool {
        self.expire_at > now_ms
    }

    /// IP without the port suffix.
    pub fn host(&self) -> &str {
        host_of(&self.ip)
    }
}

/// In-flight install marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallingLocation {
    pub name: String,
    pub ip: String,
    pub broadcasted_at: u64,
    pub expire_at: u64,
}

impl InstallingLocation {
    pub fn is_alive(&self, now_ms: u64) -> bool {
        self.expire_at > now_ms
    }
}

/// Strip a `:port` suffix from an endpoint.
pub fn host_of(endpoint: &str) -> &str {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => endpoint,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PEER MESSAGES
// ════════════════════════════════════════════════════════════════════════════

/// Gossip payloads exchanged with peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A register/update message for the registry.
    AppMessage(ApplicationMessage),
    /// Location heartbeat for one or more apps on one node.
    AppRunning(Vec<ApplicationLocation>),
    /// A node started installing an app.
    AppInstalling(InstallingLocation),
    /// A node stopped hosting an app.
    AppRemoved { name: String, ip: String },
    /// Ask peers for full messages behind these hashes.
    AppRequest { hashes: Vec<String> },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::AppMessage(_) => "app_message",
            PeerMessage::AppRunning(_) => "app_running",
            PeerMessage::AppInstalling(_) => "app_installing",
            PeerMessage::AppRemoved { .. } => "app_removed",
            PeerMessage::AppRequest { .. } => "app_request",
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_alive_boundary() {
        let loc = ApplicationLocation {
            name: "a".into(),
            hash: "h".into(),
            ip: "10.0.0.1:16127".into(),
            broadcasted_at: 0,
            running_since: None,
            expire_at: 1_000,
        };
        assert!(loc.is_alive(999));
        assert!(!loc.is_alive(1_000));
        assert_eq!(loc.host(), "10.0.0.1");
    }

    #[test]
    fn test_host_of_variants() {
        assert_eq!(host_of("1.2.3.4"), "1.2.3.4");
        assert_eq!(host_of("1.2.3.4:16127"), "1.2.3.4");
        // Bare IPv6 is left alone
        assert_eq!(host_of("::1"), "::1");
    }

    #[test]
    fn test_peer_message_tagging() {
        let msg = PeerMessage::AppRemoved { name: "web".into(), ip: "1.2.3.4".into() };
        let json = serde_json::to_value(&msg).expect("ser");
        assert_eq!(json["type"], "app_removed");
        assert_eq!(json["data"]["name"], "web");
        let back: PeerMessage = serde_json::from_value(json).expect("de");
        assert_eq!(back.kind(), "app_removed");
    }

    #[test]
    fn test_hash_record_missing() {
        let mut r = LedgerHashRecord::new("h", "tx", 10, 1.0);
        assert!(r.is_missing());
        r.message_not_found = true;
        assert!(!r.is_missing());
    }
}
