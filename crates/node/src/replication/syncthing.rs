//! Replicated-storage daemon control surface.
//!
//! The [`StorageDaemon`] trait covers what the replication monitor needs
//! from the local Syncthing instance; [`SyncthingClient`] implements it on
//! the daemon's REST API:
//!
//! | Operation          | Endpoint                              |
//! |--------------------|---------------------------------------|
//! | completion         | `GET /rest/db/completion?folder=`     |
//! | folders            | `GET/PUT/DELETE /rest/config/folders` |
//! | devices            | `GET/PUT/DELETE /rest/config/devices` |
//! | device id          | `GET /rest/system/status` (`myID`)    |
//! | restart            | `POST /rest/system/restart`           |
//! | restart required   | `GET /rest/config/restart-required`   |

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DaemonError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("daemon answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for DaemonError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            DaemonError::Decode(e.to_string())
        } else {
            DaemonError::Request(e.to_string())
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DAEMON TYPES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderType {
    SendReceive,
    SendOnly,
    ReceiveOnly,
    ReceiveEncrypted,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderDevice {
    #[serde(rename = "deviceID")]
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderConfig {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub path: String,
    #[serde(rename = "type")]
    pub folder_type: FolderType,
    #[serde(default)]
    pub devices: Vec<FolderDevice>,
    #[serde(default)]
    pub paused: bool,
}

impl FolderConfig {
    pub fn device_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.devices.iter().map(|d| d.device_id.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub auto_accept_folders: bool,
}

/// Raw completion figures as the daemon reports them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderCompletion {
    #[serde(default)]
    pub completion: f64,
    pub global_bytes: u64,
    pub need_bytes: u64,
}

#[async_trait]
pub trait StorageDaemon: Send + Sync {
    async fn completion(&self, folder: &str) -> Result<FolderCompletion, DaemonError>;
    async fn folders(&self) -> Result<Vec<FolderConfig>, DaemonError>;
    async fn put_folder(&self, folder: &FolderConfig) -> Result<(), DaemonError>;
    async fn remove_folder(&self, folder: &str) -> Result<(), DaemonError>;
    async fn devices(&self) -> Result<Vec<DeviceConfig>, DaemonError>;
    async fn put_device(&self, device: &DeviceConfig) -> Result<(), DaemonError>;
    async fn remove_device(&self, device_id: &str) -> Result<(), DaemonError>;
    async fn device_id(&self) -> Result<String, DaemonError>;
    async fn restart(&self) -> Result<(), DaemonError>;
    async fn restart_required(&self) -> Result<bool, DaemonError>;
}

// ════════════════════════════════════════════════════════════════════════════
// SYNC COMPLETION
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncCompletion {
    Known {
        percentage: f64,
        synced: bool,
        global_bytes: u64,
        in_sync_bytes: u64,
    },
    /// The daemon could not be asked; callers fall back to wait ticks.
    Unknown,
}

impl SyncCompletion {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncCompletion::Known { synced: true, .. })
    }

    pub fn percentage(&self) -> Option<f64> {
        match self {
            SyncCompletion::Known { percentage, .. } => Some(*percentage),
            SyncCompletion::Unknown => None,
        }
    }
}

/// Sync progress of `folder`. An empty folder counts as fully synced;
/// transport failures yield [`SyncCompletion::Unknown`].
pub async fn get_folder_sync_completion(daemon: &dyn StorageDaemon, folder: &str) -> SyncCompletion {
    match daemon.completion(folder).await {
        Ok(raw) => {
            let in_sync_bytes = raw.global_bytes.saturating_sub(raw.need_bytes);
            if raw.global_bytes == 0 {
                return SyncCompletion::Known { percentage: 100.0, synced: true, global_bytes: 0, in_sync_bytes };
            }
            let percentage = in_sync_bytes as f64 / raw.global_bytes as f64 * 100.0;
            SyncCompletion::Known {
                percentage,
                synced: in_sync_bytes == raw.global_bytes,
                global_bytes: raw.global_bytes,
                in_sync_bytes,
            }
        }
        Err(e) => {
            warn!(folder, error = %e, "sync completion unavailable");
            SyncCompletion::Unknown
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SYNCTHING CLIENT
// ════════════════════════════════════════════════════════════════════════════

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Deserialize)]
struct SystemStatus {
    #[serde(rename = "myID")]
    my_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartRequired {
    requires_restart: bool,
}

/// REST client for a local Syncthing daemon.
#[derive(Debug, Clone)]
pub struct SyncthingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl SyncthingClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, DaemonError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), api_key })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "syncthing request");
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, DaemonError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DaemonError::Status { status: status.as_u16(), body });
        }
        Ok(resp)
    }
}

#[async_trait]
impl StorageDaemon for SyncthingClient {
    async fn completion(&self, folder: &str) -> Result<FolderCompletion, DaemonError> {
        let req = self.request(reqwest::Method::GET, "/rest/db/completion").query(&[("folder", folder)]);
        Ok(self.send(req).await?.json().await?)
    }

    async fn folders(&self) -> Result<Vec<FolderConfig>, DaemonError> {
        let req = self.request(reqwest::Method::GET, "/rest/config/folders");
        Ok(self.send(req).await?.json().await?)
    }

    async fn put_folder(&self, folder: &FolderConfig) -> Result<(), DaemonError> {
        let req = self
            .request(reqwest::Method::PUT, &format!("/rest/config/folders/{}", folder.id))
            .json(folder);
        self.send(req).await.map(|_| ())
    }

    async fn remove_folder(&self, folder: &str) -> Result<(), DaemonError> {
        let req = self.request(reqwest::Method::DELETE, &format!("/rest/config/folders/{}", folder));
        self.send(req).await.map(|_| ())
    }

    async fn devices(&self) -> Result<Vec<DeviceConfig>, DaemonError> {
        let req = self.request(reqwest::Method::GET, "/rest/config/devices");
        Ok(self.send(req).await?.json().await?)
    }

    async fn put_device(&self, device: &DeviceConfig) -> Result<(), DaemonError> {
        let req = self
            .request(reqwest::Method::PUT, &format!("/rest/config/devices/{}", device.device_id))
            .json(device);
        self.send(req).await.map(|_| ())
    }

    async fn remove_device(&self, device_id: &str) -> Result<(), DaemonError> {
        let req = self.request(reqwest::Method::DELETE, &format!("/rest/config/devices/{}", device_id));
        self.send(req).await.map(|_| ())
    }

    async fn device_id(&self) -> Result<String, DaemonError> {
        let req = self.request(reqwest::Method::GET, "/rest/system/status");
        let status: SystemStatus = self.send(req).await?.json().await?;
        Ok(status.my_id)
    }

    async fn restart(&self) -> Result<(), DaemonError> {
        let req = self.request(reqwest::Method::POST, "/rest/system/restart");
        self.send(req).await.map(|_| ())
    }

    async fn restart_required(&self) -> Result<bool, DaemonError> {
        let req = self.request(reqwest::Method::GET, "/rest/config/restart-required");
        let body: RestartRequired = self.send(req).await?.json().await?;
        Ok(body.requires_restart)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> SyncthingClient {
        SyncthingClient::new(server.uri(), Some("k".into()), Duration::from_secs(2)).expect("client")
    }

    #[tokio::test]
    async fn test_completion_percentage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/db/completion"))
            .and(query_param("folder", "fluxdb_app"))
            .and(header("X-API-Key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "completion": 75.0, "globalBytes": 400, "needBytes": 100
            })))
            .mount(&server)
            .await;

        let c = client(&server);
        match get_folder_sync_completion(&c, "fluxdb_app").await {
            SyncCompletion::Known { percentage, synced, in_sync_bytes, .. } => {
                assert!((percentage - 75.0).abs() < 1e-9);
                assert!(!synced);
                assert_eq!(in_sync_bytes, 300);
            }
            SyncCompletion::Unknown => panic!("expected known completion"),
        }
    }

    #[tokio::test]
    async fn test_empty_folder_is_synced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/db/completion"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "globalBytes": 0, "needBytes": 0
            })))
            .mount(&server)
            .await;
        let result = get_folder_sync_completion(&client(&server), "f").await;
        assert!(result.is_synced());
        assert_eq!(result.percentage(), Some(100.0));
    }

    #[tokio::test]
    async fn test_backend_failure_is_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/db/completion"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        assert_eq!(get_folder_sync_completion(&client(&server), "f").await, SyncCompletion::Unknown);
    }

    #[tokio::test]
    async fn test_device_id_and_restart_required() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/system/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"myID": "DEV-1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/config/restart-required"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"requiresRestart": true})))
            .mount(&server)
            .await;
        let c = client(&server);
        assert_eq!(c.device_id().await.expect("id"), "DEV-1");
        assert!(c.restart_required().await.expect("flag"));
    }

    #[test]
    fn test_folder_config_wire_names() {
        let folder = FolderConfig {
            id: "fluxdb_app".into(),
            label: "fluxdb_app".into(),
            path: "/data/fluxdb_app".into(),
            folder_type: FolderType::ReceiveOnly,
            devices: vec![FolderDevice { device_id: "D1".into() }],
            paused: false,
        };
        let v = serde_json::to_value(&folder).expect("ser");
        assert_eq!(v["type"], "receiveonly");
        assert_eq!(v["devices"][0]["deviceID"], "D1");
    }
}
