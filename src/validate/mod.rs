//! Spec validation
//!
//! Structural and semantic checks run on every spec before it can reach
//! the container engine. Checks run in a fixed order and only structural
//! errors short-circuit the rest, so one pass reports as much as possible.

pub mod graph;

pub use graph::DependencyGraph;

use crate::error::KeelError;
use crate::spec::{PortSpec, Spec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// What kind of operation the spec is validated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// The spec will be deployed
    Deploy,
    /// The spec only describes a teardown; an empty spec is allowed
    TeardownOnly,
}

/// Stable identifier of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    EmptySpec,
    EmptyName,
    EmptyImage,
    DuplicateName,
    EmptyMountTarget,
    UnresolvedReference,
    MalformedPort,
    InvalidPort,
    DuplicateHostPort,
    DependencyCycle,
    NegativeResource,
    ResourceAboveCeiling,
    UnpinnedImage,
    NoRestartPolicy,
    NoResourceLimits,
}

impl IssueCode {
    /// Structural issues stop validation before the semantic checks
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            IssueCode::EmptySpec
                | IssueCode::EmptyName
                | IssueCode::EmptyImage
                | IssueCode::DuplicateName
                | IssueCode::EmptyMountTarget
        )
    }
}

/// A single validation finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub code: IssueCode,
    /// Entity the finding concerns, e.g. `service 'web'`
    pub entity: String,
    pub message: String,
    /// Cycle members, for dependency cycles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl Issue {
    fn new(code: IssueCode, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            entity: entity.into(),
            message: message.into(),
            members: Vec::new(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

/// Result of validating a spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
    /// Dependency-respecting start order, when the graph is acyclic
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start_order: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Collapse the errors into the most specific crate error
    pub fn to_error(&self) -> Option<KeelError> {
        if self.errors.is_empty() {
            return None;
        }

        if let Some(cycle) = self
            .errors
            .iter()
            .find(|i| i.code == IssueCode::DependencyCycle)
        {
            return Some(KeelError::Cycle {
                members: cycle.members.clone(),
            });
        }

        if self.errors.iter().all(|i| i.code == IssueCode::UnresolvedReference) {
            return Some(KeelError::Reference {
                missing: self.errors.iter().map(|i| i.message.clone()).collect(),
            });
        }

        Some(KeelError::Validation(self.errors.len()))
    }
}

/// Per-service resource ceiling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCeiling {
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub cpus: Option<f64>,
}

/// Spec validator
#[derive(Debug, Clone, Default)]
pub struct Validator {
    ceiling: ResourceCeiling,
}

impl Validator {
    pub fn new(ceiling: ResourceCeiling) -> Self {
        Self { ceiling }
    }

    /// Validate a spec. Identical input always yields an identical report.
    pub fn validate(&self, spec: &Spec, mode: ValidationMode) -> ValidationReport {
        let mut report = ValidationReport::default();

        check_structure(spec, mode, &mut report.errors);
        if report.errors.iter().any(|i| i.code.is_structural()) {
            return report;
        }

        for missing in spec.unresolved_references() {
            report.errors.push(Issue::new(
                IssueCode::UnresolvedReference,
                format!("service '{}'", missing.from),
                missing.to_string(),
            ));
        }

        check_ports(spec, &mut report.errors);

        let graph = DependencyGraph::new(spec);
        let cycles = graph.cycles();
        for members in &cycles {
            let mut issue = Issue::new(
                IssueCode::DependencyCycle,
                format!("services {}", members.join(", ")),
                format!("dependency cycle: {} -> {}", members.join(" -> "), members[0]),
            );
            issue.members = members.clone();
            report.errors.push(issue);
        }
        if cycles.is_empty() {
            report.start_order = graph.start_order().unwrap_or_default();
        }

        self.check_resources(spec, &mut report.errors);
        check_warnings(spec, &mut report.warnings);

        tracing::debug!(
            "Validated spec: {} error(s), {} warning(s)",
            report.errors.len(),
            report.warnings.len()
        );
        report
    }

    fn check_resources(&self, spec: &Spec, errors: &mut Vec<Issue>) {
        for service in &spec.services {
            let entity = format!("service '{}'", service.name);
            let limits = &service.resources;

            if limits.memory_bytes.is_some_and(|m| m < 0) {
                errors.push(Issue::new(
                    IssueCode::NegativeResource,
                    &entity,
                    "memory limit is negative",
                ));
            }
            if limits.cpus.is_some_and(|c| c < 0.0 || c.is_nan()) {
                errors.push(Issue::new(
                    IssueCode::NegativeResource,
                    &entity,
                    "cpu limit is negative",
                ));
            }
            if limits.pids.is_some_and(|p| p < 0) {
                errors.push(Issue::new(
                    IssueCode::NegativeResource,
                    &entity,
                    "pids limit is negative",
                ));
            }

            if let (Some(memory), Some(max)) = (limits.memory_bytes, self.ceiling.memory_bytes) {
                if memory > max {
                    errors.push(Issue::new(
                        IssueCode::ResourceAboveCeiling,
                        &entity,
                        format!("memory limit {} bytes exceeds ceiling of {} bytes", memory, max),
                    ));
                }
            }
            if let (Some(cpus), Some(max)) = (limits.cpus, self.ceiling.cpus) {
                if cpus > max {
                    errors.push(Issue::new(
                        IssueCode::ResourceAboveCeiling,
                        &entity,
                        format!("cpu limit {} exceeds ceiling of {}", cpus, max),
                    ));
                }
            }
        }
    }
}

fn check_structure(spec: &Spec, mode: ValidationMode, errors: &mut Vec<Issue>) {
    if spec.is_empty() && mode == ValidationMode::Deploy {
        errors.push(Issue::new(
            IssueCode::EmptySpec,
            "spec",
            "spec declares no services",
        ));
    }

    let classes = [
        ("service", spec.services.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()),
        ("network", spec.networks.iter().map(|n| n.name.as_str()).collect()),
        ("volume", spec.volumes.iter().map(|v| v.name.as_str()).collect()),
    ];
    for (kind, names) in &classes {
        let mut seen = HashSet::new();
        for name in names {
            if name.trim().is_empty() {
                errors.push(Issue::new(
                    IssueCode::EmptyName,
                    *kind,
                    format!("{} name is empty", kind),
                ));
            } else if !seen.insert(*name) {
                errors.push(Issue::new(
                    IssueCode::DuplicateName,
                    format!("{} '{}'", kind, name),
                    format!("{} '{}' is declared more than once", kind, name),
                ));
            }
        }
    }

    for service in &spec.services {
        let entity = format!("service '{}'", service.name);
        if service.image.trim().is_empty() {
            errors.push(Issue::new(IssueCode::EmptyImage, &entity, "image is empty"));
        }
        for mount in &service.volumes {
            if mount.target.trim().is_empty() {
                errors.push(Issue::new(
                    IssueCode::EmptyMountTarget,
                    &entity,
                    format!("mount '{}' has no target path", mount),
                ));
            }
        }
    }
}

fn check_ports(spec: &Spec, errors: &mut Vec<Issue>) {
    // (service, host ip, host port, protocol) of every published binding
    let mut published: Vec<(&str, Option<&str>, u16, String)> = Vec::new();

    for service in &spec.services {
        let entity = format!("service '{}'", service.name);
        for port in &service.ports {
            let binding = match port {
                PortSpec::Malformed(raw) => {
                    errors.push(Issue::new(
                        IssueCode::MalformedPort,
                        &entity,
                        format!("cannot parse port binding '{}'", raw),
                    ));
                    continue;
                }
                PortSpec::Bound(binding) => binding,
            };

            if binding.container_port == 0 || binding.host_port == Some(0) {
                errors.push(Issue::new(
                    IssueCode::InvalidPort,
                    &entity,
                    format!("port binding '{}' uses port 0", binding),
                ));
                continue;
            }

            let Some(host_port) = binding.host_port else {
                continue;
            };
            let ip = binding.host_ip.as_deref().filter(|ip| !is_wildcard(ip));
            let protocol = binding.protocol.to_string();

            let clash = published.iter().find(|(_, other_ip, other_port, other_proto)| {
                *other_port == host_port
                    && *other_proto == protocol
                    && (ip.is_none() || other_ip.is_none() || *other_ip == ip)
            });
            if let Some((owner, _, _, _)) = clash {
                errors.push(Issue::new(
                    IssueCode::DuplicateHostPort,
                    &entity,
                    format!(
                        "host port {}/{} is already published by service '{}'",
                        host_port, protocol, owner
                    ),
                ));
            }
            published.push((service.name.as_str(), ip, host_port, protocol));
        }
    }
}

fn is_wildcard(ip: &str) -> bool {
    matches!(ip, "0.0.0.0" | "::" | "")
}

fn check_warnings(spec: &Spec, warnings: &mut Vec<Issue>) {
    for service in &spec.services {
        let entity = format!("service '{}'", service.name);

        if !service.image.contains('@') && service.image.ends_with(":latest") {
            warnings.push(Issue::new(
                IssueCode::UnpinnedImage,
                &entity,
                format!("image '{}' is not pinned to a version", service.image),
            ));
        }
        if service.restart.is_none() {
            warnings.push(Issue::new(
                IssueCode::NoRestartPolicy,
                &entity,
                "no restart policy; the container will not come back after a crash",
            ));
        }
        if service.resources.memory_bytes.is_none() && service.resources.cpus.is_none() {
            warnings.push(Issue::new(
                IssueCode::NoResourceLimits,
                &entity,
                "no memory or cpu limit",
            ));
        }
    }
}
