//! Observed runtime state

use crate::spec::Protocol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Compose project label set by the engine on managed containers
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Compose service label set by the engine on managed containers
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Container lifecycle status as reported by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    #[default]
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
            ContainerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ContainerStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        })
    }
}

/// Container health as reported by its healthcheck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A host port published by a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    pub host_port: u16,
    pub protocol: Protocol,
}

/// A container visible to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveContainer {
    pub name: String,
    pub image: String,
    /// Compose project label, if any
    #[serde(default)]
    pub project: Option<String>,
    /// Compose service label, if any
    #[serde(default)]
    pub service: Option<String>,
    pub status: ContainerStatus,
    #[serde(default)]
    pub health: Option<HealthStatus>,
    #[serde(default)]
    pub ports: Vec<PublishedPort>,
    /// Resident memory in bytes, when sampled
    #[serde(default)]
    pub memory_usage: Option<u64>,
}

impl LiveContainer {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            project: None,
            service: None,
            status: ContainerStatus::Running,
            health: None,
            ports: Vec::new(),
            memory_usage: None,
        }
    }

    pub fn project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    pub fn service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn status(mut self, status: ContainerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn health(mut self, health: HealthStatus) -> Self {
        self.health = Some(health);
        self
    }

    pub fn publish(mut self, host_port: u16, protocol: Protocol) -> Self {
        self.ports.push(PublishedPort {
            host_port,
            protocol,
        });
        self
    }

    pub fn memory_usage(mut self, bytes: u64) -> Self {
        self.memory_usage = Some(bytes);
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// A host port held by something other than a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPortBinding {
    pub port: u16,
    pub protocol: Protocol,
    /// Description of the owning process
    pub process: String,
}

/// Host resource figures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostResources {
    pub total_memory: u64,
    pub available_memory: u64,
    pub cpus: usize,
}

/// Read-only snapshot of the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub containers: Vec<LiveContainer>,
    #[serde(default)]
    pub host_ports: Vec<HostPortBinding>,
    #[serde(default)]
    pub resources: Option<HostResources>,
}

impl Default for LiveState {
    fn default() -> Self {
        Self {
            observed_at: Utc::now(),
            containers: Vec::new(),
            host_ports: Vec::new(),
            resources: None,
        }
    }
}

impl LiveState {
    pub fn container(&self, name: &str) -> Option<&LiveContainer> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// The container running `service` for `project`
    pub fn service_container(&self, project: &str, service: &str) -> Option<&LiveContainer> {
        self.containers.iter().find(|c| {
            c.project.as_deref() == Some(project) && c.service.as_deref() == Some(service)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!("Running".parse::<ContainerStatus>().unwrap(), ContainerStatus::Running);
        assert_eq!("exited".parse::<ContainerStatus>().unwrap(), ContainerStatus::Exited);
        assert_eq!("weird".parse::<ContainerStatus>().unwrap(), ContainerStatus::Unknown);
    }

    #[test]
    fn test_service_container_lookup() {
        let live = LiveState {
            containers: vec![
                LiveContainer::new("a-web-1", "nginx").project("a").service("web"),
                LiveContainer::new("b-web-1", "nginx").project("b").service("web"),
            ],
            ..Default::default()
        };
        assert_eq!(live.service_container("b", "web").unwrap().name, "b-web-1");
        assert!(live.service_container("c", "web").is_none());
    }
}
