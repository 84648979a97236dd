//! Desired-state deployment specification

use super::port::PortSpec;
use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Network every service is attached to unless it declares otherwise
pub const DEFAULT_NETWORK: &str = "default";

/// Declarative desired state for a multi-service deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    /// Project name declared in the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services, in declaration order
    #[serde(default)]
    pub services: Vec<ServiceDef>,
    /// Networks, in declaration order
    #[serde(default)]
    pub networks: Vec<NetworkDef>,
    /// Named volumes, in declaration order
    #[serde(default)]
    pub volumes: Vec<VolumeDef>,
}

impl Spec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new spec with the service appended
    pub fn with_service(mut self, service: ServiceDef) -> Self {
        self.services.push(service);
        self
    }

    /// Return a new spec with the network appended
    pub fn with_network(mut self, network: NetworkDef) -> Self {
        self.networks.push(network);
        self
    }

    /// Return a new spec with the volume appended
    pub fn with_volume(mut self, volume: VolumeDef) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDef> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkDef> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn volume(&self, name: &str) -> Option<&VolumeDef> {
        self.volumes.iter().find(|v| v.name == name)
    }

    /// Every reference a service makes that has no definition in this spec
    pub fn unresolved_references(&self) -> Vec<UnresolvedRef> {
        let services: HashSet<&str> = self.services.iter().map(|s| s.name.as_str()).collect();
        let networks: HashSet<&str> = self.networks.iter().map(|n| n.name.as_str()).collect();
        let volumes: HashSet<&str> = self.volumes.iter().map(|v| v.name.as_str()).collect();

        let mut missing = Vec::new();
        for service in &self.services {
            for dep in &service.depends_on {
                if !services.contains(dep.as_str()) {
                    missing.push(UnresolvedRef::new(&service.name, RefKind::Service, dep));
                }
            }
            for net in &service.networks {
                if net != DEFAULT_NETWORK && !networks.contains(net.as_str()) {
                    missing.push(UnresolvedRef::new(&service.name, RefKind::Network, net));
                }
            }
            for mount in &service.volumes {
                if let MountSource::Named(ref vol) = mount.source {
                    if !volumes.contains(vol.as_str()) {
                        missing.push(UnresolvedRef::new(&service.name, RefKind::Volume, vol));
                    }
                }
            }
        }
        missing
    }

    /// Fail when any dependency, network or volume reference dangles
    pub fn validate_references(&self) -> Result<()> {
        let missing = self.unresolved_references();
        if missing.is_empty() {
            return Ok(());
        }
        Err(KeelError::Reference {
            missing: missing.iter().map(|r| r.to_string()).collect(),
        })
    }

    /// Structural equality that ignores declaration order of entities
    pub fn equals(&self, other: &Spec) -> bool {
        fn same_set<T: PartialEq>(a: &[T], b: &[T], key: impl Fn(&T) -> &str) -> bool {
            let count = |items: &[T], x: &T| {
                items.iter().filter(|y| key(x) == key(*y) && x == *y).count()
            };
            a.len() == b.len() && a.iter().all(|x| count(a, x) == count(b, x))
        }

        self.name == other.name
            && same_set(&self.services, &other.services, |s| s.name.as_str())
            && same_set(&self.networks, &other.networks, |n| n.name.as_str())
            && same_set(&self.volumes, &other.volumes, |v| v.name.as_str())
    }
}

/// The kind of definition a reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Service,
    Network,
    Volume,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Service => write!(f, "service"),
            RefKind::Network => write!(f, "network"),
            RefKind::Volume => write!(f, "volume"),
        }
    }
}

/// A dangling reference from a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedRef {
    /// Service making the reference
    pub from: String,
    pub kind: RefKind,
    /// Name that failed to resolve
    pub name: String,
}

impl UnresolvedRef {
    fn new(from: &str, kind: RefKind, name: &str) -> Self {
        Self {
            from: from.to_string(),
            kind,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for UnresolvedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} '{}'", self.from, self.kind, self.name)
    }
}

/// A single service definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDef {
    pub name: String,
    /// Normalized image reference
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartPolicy>,
    #[serde(default, skip_serializing_if = "ResourceLimits::is_empty")]
    pub resources: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

impl ServiceDef {
    /// Create a new service running the given image
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: normalize_image(image),
            ..Default::default()
        }
    }

    /// Add a port binding in compose short syntax
    pub fn port(mut self, raw: &str) -> Self {
        self.ports.extend(PortSpec::parse(raw));
        self
    }

    /// Add a volume mount in compose short syntax
    pub fn mount(mut self, raw: &str) -> Self {
        if let Ok(mount) = raw.parse() {
            self.volumes.push(mount);
        }
        self
    }

    /// Add a dependency on another service
    pub fn depends_on(mut self, service: &str) -> Self {
        self.depends_on.push(service.to_string());
        self
    }

    /// Attach to a network
    pub fn network(mut self, network: &str) -> Self {
        self.networks.push(network.to_string());
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Set a label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the restart policy
    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = Some(policy);
        self
    }

    /// Set the memory limit in bytes
    pub fn memory(mut self, bytes: i64) -> Self {
        self.resources.memory_bytes = Some(bytes);
        self
    }

    /// Container name the engine will use for the first replica
    pub fn effective_container_name(&self, project: &str) -> String {
        self.container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-1", project, self.name))
    }
}

/// Normalize an image reference so equivalent spellings compare equal.
///
/// `nginx`, `nginx:latest`, `library/nginx` and `docker.io/library/nginx:latest`
/// all normalize to `nginx:latest`.
pub fn normalize_image(image: &str) -> String {
    let image = image.trim();
    let image = image.strip_prefix("docker.io/").unwrap_or(image);
    let image = image.strip_prefix("library/").unwrap_or(image);

    if image.is_empty() || image.contains('@') {
        return image.to_string();
    }

    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Container restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure(Option<u32>),
    UnlessStopped,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure(None) => write!(f, "on-failure"),
            RestartPolicy::OnFailure(Some(n)) => write!(f, "on-failure:{}", n),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "no" | "" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure(None)),
            other => match other.strip_prefix("on-failure:") {
                Some(n) => n
                    .parse()
                    .map(|n| RestartPolicy::OnFailure(Some(n)))
                    .map_err(|_| format!("invalid retry count in restart policy '{}'", other)),
                None => Err(format!("unknown restart policy '{}'", other)),
            },
        }
    }
}

impl TryFrom<String> for RestartPolicy {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RestartPolicy> for String {
    fn from(policy: RestartPolicy) -> Self {
        policy.to_string()
    }
}

/// Resource limits for a service. Values are kept signed so that the
/// validator, not the parser, rejects negative figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<i64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_bytes.is_none() && self.cpus.is_none() && self.pids.is_none()
    }
}

/// Parse a compose memory figure such as `512M`, `1g`, `256mb` or `1048576`
pub fn parse_memory(raw: &str) -> std::result::Result<i64, String> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1024_i64),
        Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory figure '{}'", raw))?;
    Ok((value * multiplier as f64).round() as i64)
}

/// Container healthcheck
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
}

/// Where a mount's data comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "source", rename_all = "lowercase")]
pub enum MountSource {
    /// Named volume declared in the spec
    Named(String),
    /// Host path
    Bind(String),
    /// Anonymous volume
    Anonymous,
}

/// A volume mount inside a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: MountSource,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            MountSource::Named(src) | MountSource::Bind(src) => write!(f, "{}:", src)?,
            MountSource::Anonymous => {}
        }
        write!(f, "{}", self.target)?;
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

impl FromStr for VolumeMount {
    type Err = String;

    /// Parse short syntax: `target`, `source:target` or `source:target:mode`
    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => return Err(format!("cannot interpret volume mount '{}'", raw)),
        };

        let read_only = match mode {
            None => false,
            Some(mode) => mode.split(',').any(|m| m == "ro"),
        };

        Ok(VolumeMount {
            source: classify_source(source),
            target: target.to_string(),
            read_only,
        })
    }
}

/// Host paths start with `/`, `.` or `~`; anything else names a volume
pub fn classify_source(source: Option<&str>) -> MountSource {
    match source {
        None | Some("") => MountSource::Anonymous,
        Some(s) if s.starts_with('/') || s.starts_with('.') || s.starts_with('~') => {
            MountSource::Bind(s.to_string())
        }
        Some(s) => MountSource::Named(s.to_string()),
    }
}

/// Classify the source of a long-syntax mount with an explicit type
pub fn classify_source_for(kind: &str, source: Option<&str>) -> MountSource {
    match (kind, source) {
        (_, None) | (_, Some("")) => MountSource::Anonymous,
        ("bind", Some(s)) => MountSource::Bind(s.to_string()),
        (_, Some(s)) => MountSource::Named(s.to_string()),
    }
}

/// Network definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl NetworkDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn driver(mut self, driver: &str) -> Self {
        self.driver = Some(driver.to_string());
        self
    }
}

/// Named volume definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub external: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl VolumeDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}
