//! Outbound request bookkeeping.
//!
//! Requests sent to peers are remembered per origin for `max_age` so the
//! same peer is not asked again while an answer may still arrive. Every
//! entry owns a timer task that removes it; [`OutboundRequests::clear`]
//! aborts all of them at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Url;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboundError {
    #[error("invalid request target: {0}")]
    InvalidTarget(String),
}

struct Entry {
    generation: u64,
    expiry: JoinHandle<()>,
}

pub struct OutboundRequests {
    max_age: Duration,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    generation: AtomicU64,
    expired: Arc<AtomicU64>,
}

/// `scheme://host:port` of `target`. Bare `host[:port]` is read as http.
pub fn origin_key(target: &str) -> Result<String, OutboundError> {
    let raw = target.trim();
    let url = if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("http://{}", raw))
    }
    .map_err(|e| OutboundError::InvalidTarget(format!("{}: {}", target, e)))?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(OutboundError::InvalidTarget(target.to_string()));
    }
    Ok(origin.ascii_serialization())
}

impl OutboundRequests {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            expired: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a request to `target`. Returns `false` when one is already
    /// pending for the same origin; the entry's timer is not reset.
    ///
    /// Must be called inside a tokio runtime.
    pub fn record(&self, target: &str) -> Result<bool, OutboundError> {
        let key = origin_key(target)?;
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Ok(false);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.entries);
        let expired = Arc::clone(&self.expired);
        let max_age = self.max_age;
        let task_key = key.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(max_age).await;
            let mut entries = shared.lock();
            if entries.get(&task_key).map(|e| e.generation) == Some(generation) {
                entries.remove(&task_key);
                expired.fetch_add(1, Ordering::SeqCst);
                debug!(origin = %task_key, "outbound request expired");
            }
        });
        entries.insert(key, Entry { generation, expiry });
        Ok(true)
    }

    pub fn contains(&self, target: &str) -> bool {
        origin_key(target).map(|k| self.entries.lock().contains_key(&k)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries removed by their own timer so far.
    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::SeqCst)
    }

    /// Drop every entry and abort every pending timer.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            entry.expiry.abort();
        }
    }
}

impl Drop for OutboundRequests {
    fn drop(&mut self) {
        self.clear();
    }
}
