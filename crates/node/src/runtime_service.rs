//! Container runtime seam.
//!
//! The orchestrator only needs create/start/stop/remove/inspect on named
//! containers. [`DockerCliRuntime`] drives the `docker` CLI through the
//! [`CommandWorker`], so no runtime call blocks the async loop.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use skyfleet_proto::{ApplicationSpecification, CommandOptions, ComponentSpecification, Tier};

use crate::worker::{shell_quote, CommandWorker};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("runtime unreachable: {0}")]
    Unreachable(String),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    /// Exited, created-but-never-started or dead.
    pub fn is_stopped(&self) -> bool {
        matches!(self, ContainerState::Exited | ContainerState::Created | ContainerState::Dead)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub state: ContainerState,
    pub image: String,
}

/// Everything needed to create one component container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    /// `(host, container)` port pairs.
    pub ports: Vec<(u16, u16)>,
    pub environment: Vec<String>,
    pub commands: Vec<String>,
    /// `(host path, container path)`.
    pub volume: (String, String),
    pub cpu: f64,
    pub ram_mb: u64,
}

impl ContainerConfig {
    pub fn for_component(
        spec: &ApplicationSpecification,
        component: &ComponentSpecification,
        tier: Tier,
        data_root: &Path,
    ) -> Self {
        let name = spec.container_name(component);
        let resources = component.resources_on(tier, spec.tiered);
        let ports = component
            .ports
            .iter()
            .zip(component.container_ports.iter().chain(std::iter::repeat(&0)))
            .map(|(host, container)| (*host, if *container == 0 { *host } else { *container }))
            .collect();
        let host_path = data_root.join(&name).to_string_lossy().into_owned();
        Self {
            image: component.repotag.clone(),
            ports,
            environment: component.environment.clone(),
            commands: component.commands.clone(),
            volume: (host_path, component.container_data.path.clone()),
            cpu: resources.cpu,
            ram_mb: resources.ram as u64,
            name,
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;
    async fn inspect(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError>;
    async fn create(&self, config: &ContainerConfig) -> Result<(), RuntimeError>;
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;
}

// ════════════════════════════════════════════════════════════════════════════
// DOCKER CLI RUNTIME
// ════════════════════════════════════════════════════════════════════════════

pub struct DockerCliRuntime {
    worker: CommandWorker,
    timeout_ms: u64,
}

impl DockerCliRuntime {
    pub fn new(worker: CommandWorker, timeout_ms: u64) -> Self {
        Self { worker, timeout_ms }
    }

    async fn docker(&self, args: String) -> Result<String, RuntimeError> {
        let command = format!("docker {}", args);
        debug!(%command, "docker");
        let options = CommandOptions { timeout_ms: Some(self.timeout_ms), ..CommandOptions::default() };
        let resp = self
            .worker
            .run_command(command.clone(), options)
            .await
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;
        if resp.result.is_success() {
            return Ok(resp.result.stdout);
        }
        let stderr = resp.result.stderr.trim().to_string();
        if stderr.contains("No such container") {
            return Err(RuntimeError::NotFound(args));
        }
        if stderr.contains("Cannot connect to the Docker daemon") || resp.result.exit_code.is_none() {
            return Err(RuntimeError::Unreachable(resp.result.error.unwrap_or(stderr)));
        }
        Err(RuntimeError::CommandFailed { command, stderr })
    }
}

/// Parse `docker ps --format '{{.Names}}\t{{.State}}\t{{.Image}}'` output.
pub fn parse_ps_output(raw: &str) -> Vec<ContainerSummary> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let state = ContainerState::parse(parts.next().unwrap_or_default());
            let image = parts.next().unwrap_or_default().trim().to_string();
            Some(ContainerSummary { name: name.to_string(), state, image })
        })
        .collect()
}

/// Argument string for `docker create`.
pub fn create_args(config: &ContainerConfig) -> String {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        shell_quote(&config.name),
        "--restart".to_string(),
        "unless-stopped".to_string(),
        format!("--cpus={}", config.cpu),
        format!("--memory={}m", config.ram_mb),
    ];
    for (host, container) in &config.ports {
        args.push(format!("-p {}:{}", host, container));
    }
    for env in &config.environment {
        args.push(format!("-e {}", shell_quote(env)));
    }
    args.push(format!("-v {}", shell_quote(&format!("{}:{}", config.volume.0, config.volume.1))));
    args.push(shell_quote(&config.image));
    args.extend(config.commands.iter().map(|c| shell_quote(c)));
    args.join(" ")
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let out = self.docker("ps -a --format '{{.Names}}\\t{{.State}}\\t{{.Image}}'".to_string()).await?;
        Ok(parse_ps_output(&out))
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError> {
        Ok(self.list().await?.into_iter().find(|c| c.name == name))
    }

    async fn create(&self, config: &ContainerConfig) -> Result<(), RuntimeError> {
        info!(container = %config.name, image = %config.image, "creating container");
        self.docker(create_args(config)).await.map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker(format!("start {}", shell_quote(name))).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker(format!("stop {}", shell_quote(name))).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker(format!("rm -f {}", shell_quote(name))).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyfleet_proto::ContainerData;
    use std::path::PathBuf;

    #[test]
    fn test_parse_ps_output() {
        let out = "fluxweb_app\trunning\trunonflux/web:1\nfluxdb_app\texited\tpostgres:16\n\n";
        let list = parse_ps_output(out);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].state, ContainerState::Running);
        assert!(list[1].state.is_stopped());
        assert_eq!(list[1].image, "postgres:16");
    }

    #[test]
    fn test_config_for_component_and_args() {
        let component = ComponentSpecification {
            name: "web".into(),
            description: String::new(),
            repotag: "runonflux/web:1".into(),
            ports: vec![31000, 31001],
            container_ports: vec![80],
            environment: vec!["MODE=it's".into()],
            commands: vec!["--serve".into()],
            container_data: ContainerData::local("/data"),
            cpu: 0.5,
            ram: 500.0,
            hdd: 5.0,
            tiered_resources: None,
        };
        let spec = ApplicationSpecification {
            version: 4,
            name: "shop".into(),
            description: String::new(),
            owner: "o".into(),
            instances: 3,
            expire: None,
            registration_height: 0,
            enterprise: false,
            geolocation: vec![],
            nodes: vec![],
            tiered: false,
            components: vec![component.clone()],
        };
        let cfg = ContainerConfig::for_component(&spec, &component, Tier::Cumulus, &PathBuf::from("/vol"));
        assert_eq!(cfg.name, "fluxweb_shop");
        assert_eq!(cfg.ports, vec![(31000, 80), (31001, 31001)]);
        assert_eq!(cfg.volume, ("/vol/fluxweb_shop".to_string(), "/data".to_string()));

        let args = create_args(&cfg);
        assert!(args.starts_with("create --name 'fluxweb_shop'"));
        assert!(args.contains("-p 31000:80"));
        assert!(args.contains("--memory=500m"));
        assert!(args.contains("-e 'MODE=it'\\''s'"));
        assert!(args.ends_with("'runonflux/web:1' '--serve'"));
    }
}
