//! Container engine capability interfaces
//!
//! The lifecycle core talks to the engine only through these traits:
//! one read-only observer, one applier that is the sole mutator, and a
//! prober for post-deployment checks. Engine calls are unreliable and are
//! wrapped in bounded retries by [`retry`].

pub mod docker;
pub mod live;
#[cfg(test)]
pub mod mock;
pub mod retry;

pub use docker::DockerCompose;
pub use live::{
    ContainerStatus, HealthStatus, HostPortBinding, HostResources, LiveContainer, LiveState,
    PublishedPort, PROJECT_LABEL, SERVICE_LABEL,
};
pub use retry::{run_with_retry, RetryPolicy};

use crate::error::EngineError;
use crate::spec::{Protocol, Spec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Container a probe runs against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub service: String,
    pub container: String,
}

/// What a probe checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeKind {
    /// A published host port accepts connections
    PortReachable {
        host_ip: Option<String>,
        host_port: u16,
        protocol: Protocol,
    },
    /// A mount target exists inside the container, and is writable if asked
    VolumeMount { target: String, writable: bool },
    /// Declared environment variables are set inside the container
    Environment { keys: Vec<String> },
    /// The container can reach another service over the network, on `port`
    /// when the service exposes one
    NetworkReachable {
        to_service: String,
        port: Option<u16>,
    },
    /// CPU and memory usage sit under the given percentages
    ResourceBaseline {
        max_cpu_percent: u32,
        max_memory_percent: u32,
    },
    /// Recent log lines from the container
    Logs { window_lines: usize },
}

/// Outcome of a single probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub evidence: String,
    /// Captured output lines, for log probes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<String>,
}

impl ProbeResult {
    pub fn pass(evidence: impl Into<String>) -> Self {
        Self {
            ok: true,
            evidence: evidence.into(),
            lines: Vec::new(),
        }
    }

    pub fn fail(evidence: impl Into<String>) -> Self {
        Self {
            ok: false,
            evidence: evidence.into(),
            lines: Vec::new(),
        }
    }

    pub fn with_lines(mut self, lines: Vec<String>) -> Self {
        self.lines = lines;
        self
    }
}

/// Read-only view of the runtime
#[async_trait]
pub trait RuntimeObserver: Send + Sync {
    async fn observe(&self) -> Result<LiveState, EngineError>;
}

/// The only interface allowed to mutate the runtime
#[async_trait]
pub trait RuntimeApplier: Send + Sync {
    /// Converge the runtime onto `spec`
    async fn apply(&self, spec: &Spec) -> Result<(), EngineError>;

    /// Remove everything `spec` created
    async fn teardown(&self, spec: &Spec) -> Result<(), EngineError>;
}

/// Post-deployment probes
#[async_trait]
pub trait RuntimeProber: Send + Sync {
    async fn probe(
        &self,
        target: &ProbeTarget,
        kind: &ProbeKind,
    ) -> Result<ProbeResult, EngineError>;
}

/// Everything the lifecycle controller needs from an engine
pub trait ContainerRuntime: RuntimeObserver + RuntimeApplier + RuntimeProber {}

impl<T> ContainerRuntime for T where T: RuntimeObserver + RuntimeApplier + RuntimeProber {}
