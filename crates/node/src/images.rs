//! Image references and the image registry seam.
//!
//! A repotag is `[registry/]namespace/repository:tag`. Admission checks the
//! format, the whitelist and the size, then reads the supported
//! architectures off the manifest for the common-architecture rule.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use skyfleet_proto::CommandOptions;

use crate::worker::{shell_quote, CommandWorker};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image registry unavailable: {0}")]
    Unavailable(String),

    #[error("image {0} not found")]
    NotFound(String),

    #[error("malformed manifest for {repotag}: {reason}")]
    Malformed { repotag: String, reason: String },
}

/// Parsed repotag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub namespace: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.len() > 200 || raw.chars().any(|c| c.is_whitespace()) {
            return None;
        }
        let (path, tag) = raw.rsplit_once(':')?;
        if tag.is_empty() || tag.contains('/') {
            return None;
        }
        let mut parts: Vec<&str> = path.split('/').collect();
        if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        let registry = if parts.len() > 2 && (parts[0].contains('.') || parts[0].contains(':')) {
            Some(parts.remove(0).to_string())
        } else {
            None
        };
        let repository = parts.pop()?.to_string();
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return None;
        }
        Some(Self { registry, namespace: parts.join("/"), repository, tag: tag.to_string() })
    }

    /// `registry/namespace/repository` without the tag.
    pub fn path(&self) -> String {
        match &self.registry {
            Some(r) => format!("{}/{}/{}", r, self.namespace, self.repository),
            None => format!("{}/{}", self.namespace, self.repository),
        }
    }

    /// Whitelisted when the list is empty or an entry equals the path or
    /// one of its parent segments.
    pub fn is_whitelisted(&self, whitelist: &[String]) -> bool {
        if whitelist.is_empty() {
            return true;
        }
        let path = self.path();
        whitelist.iter().any(|entry| {
            let entry = entry.trim_end_matches('/');
            path == entry || path.starts_with(&format!("{}/", entry))
        })
    }
}

/// What admission needs to know about an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    pub repotag: String,
    pub architectures: BTreeSet<String>,
    /// Largest platform image, compressed.
    pub size_bytes: u64,
}

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn manifest(&self, repotag: &str) -> Result<ImageManifest, ImageError>;
}

// ════════════════════════════════════════════════════════════════════════════
// DOCKER MANIFEST REGISTRY
// ════════════════════════════════════════════════════════════════════════════

/// Reads manifests with `docker manifest inspect --verbose`.
pub struct DockerManifestRegistry {
    worker: CommandWorker,
    timeout_ms: u64,
}

impl DockerManifestRegistry {
    pub fn new(worker: CommandWorker, timeout_ms: u64) -> Self {
        Self { worker, timeout_ms }
    }
}

fn layer_bytes(manifest: &Value) -> u64 {
    let layers = manifest
        .get("SchemaV2Manifest")
        .or_else(|| manifest.get("OCIManifest"))
        .and_then(|m| m.get("layers"))
        .and_then(Value::as_array);
    layers
        .map(|ls| ls.iter().filter_map(|l| l.get("size").and_then(Value::as_u64)).sum())
        .unwrap_or(0)
}

/// Parse verbose manifest output: one object for single-platform images,
/// an array for manifest lists.
pub fn parse_verbose_manifest(repotag: &str, raw: &str) -> Result<ImageManifest, ImageError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ImageError::Malformed { repotag: repotag.to_string(), reason: e.to_string() })?;
    let entries = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => {
            return Err(ImageError::Malformed { repotag: repotag.to_string(), reason: "not an object".into() })
        }
    };

    let mut architectures = BTreeSet::new();
    let mut size_bytes = 0;
    for entry in &entries {
        let arch = entry
            .get("Descriptor")
            .and_then(|d| d.get("platform"))
            .and_then(|p| p.get("architecture"))
            .and_then(Value::as_str);
        if let Some(arch) = arch {
            if arch != "unknown" {
                architectures.insert(arch.to_string());
            }
        }
        size_bytes = size_bytes.max(layer_bytes(entry));
    }
    if architectures.is_empty() {
        return Err(ImageError::Malformed { repotag: repotag.to_string(), reason: "no platform".into() });
    }
    Ok(ImageManifest { repotag: repotag.to_string(), architectures, size_bytes })
}

#[async_trait]
impl ImageRegistry for DockerManifestRegistry {
    async fn manifest(&self, repotag: &str) -> Result<ImageManifest, ImageError> {
        let options = CommandOptions { timeout_ms: Some(self.timeout_ms), ..CommandOptions::default() };
        let resp = self
            .worker
            .run_command(format!("docker manifest inspect --verbose {}", shell_quote(repotag)), options)
            .await
            .map_err(|e| ImageError::Unavailable(e.to_string()))?;
        if !resp.result.is_success() {
            let stderr = resp.result.stderr.to_ascii_lowercase();
            if stderr.contains("no such manifest") || stderr.contains("not found") {
                return Err(ImageError::NotFound(repotag.to_string()));
            }
            return Err(ImageError::Unavailable(resp.result.error.unwrap_or(stderr)));
        }
        parse_verbose_manifest(repotag, &resp.result.stdout)
    }
}
