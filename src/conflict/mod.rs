//! Conflict prediction against live host state
//!
//! Detection is best-effort: the live state is a snapshot taken before the
//! apply and can go stale in the window between detection and apply.

use crate::error::KeelError;
use crate::runtime::{LiveContainer, LiveState};
use crate::spec::{Protocol, Spec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// What kind of conflict was predicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    PortInUse,
    ResourceExhaustion,
    NameCollision,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::PortInUse => write!(f, "port in use"),
            ConflictKind::ResourceExhaustion => write!(f, "resource exhaustion"),
            ConflictKind::NameCollision => write!(f, "name collision"),
        }
    }
}

/// Blocking conflicts stop an apply; advisory ones are only reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocking,
    Advisory,
}

/// A single predicted conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: Severity,
    /// Service the conflict is attributed to
    pub entity: String,
    pub detail: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Blocking => "blocking",
            Severity::Advisory => "advisory",
        };
        write!(f, "[{}] {} for {}: {}", severity, self.kind, self.entity, self.detail)
    }
}

/// Conflicts predicted for one apply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub conflicts: Vec<Conflict>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn has_blocking(&self) -> bool {
        self.blocking().next().is_some()
    }

    pub fn has_advisory(&self) -> bool {
        self.conflicts.iter().any(|c| c.severity == Severity::Advisory)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.severity == Severity::Blocking)
    }

    /// The error that halts an apply, if any conflict is blocking
    pub fn to_error(&self) -> Option<KeelError> {
        let blocking: Vec<String> = self.blocking().map(|c| c.to_string()).collect();
        if blocking.is_empty() {
            None
        } else {
            Some(KeelError::Conflict(blocking.join("; ")))
        }
    }
}

/// Memory pressure ratios, as requested memory over observed headroom
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConflictThresholds {
    /// Above this ratio a resource conflict is reported as advisory
    #[serde(default = "default_advisory_ratio")]
    pub advisory_ratio: f64,
    /// At or above this ratio it becomes blocking; unset means never
    #[serde(default)]
    pub blocking_ratio: Option<f64>,
}

fn default_advisory_ratio() -> f64 {
    1.0
}

impl Default for ConflictThresholds {
    fn default() -> Self {
        Self {
            advisory_ratio: default_advisory_ratio(),
            blocking_ratio: None,
        }
    }
}

/// Predicts what an apply would collide with
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    project: String,
    thresholds: ConflictThresholds,
}

impl ConflictDetector {
    pub fn new(project: &str, thresholds: ConflictThresholds) -> Self {
        Self {
            project: project.to_string(),
            thresholds,
        }
    }

    /// Compare `spec` against `live`.
    ///
    /// `replacing` is the currently-applied spec; containers it created are
    /// about to be replaced and never conflict.
    pub fn detect(
        &self,
        spec: &Spec,
        live: &LiveState,
        replacing: Option<&Spec>,
    ) -> ConflictReport {
        let replaced: HashSet<String> = replacing
            .map(|s| {
                s.services
                    .iter()
                    .map(|svc| svc.effective_container_name(&self.project))
                    .collect()
            })
            .unwrap_or_default();
        let owned = |c: &LiveContainer| {
            c.project.as_deref() == Some(self.project.as_str()) || replaced.contains(&c.name)
        };

        let mut conflicts = Vec::new();
        for service in &spec.services {
            let name = service.effective_container_name(&self.project);
            if let Some(other) = live.container(&name).filter(|c| !owned(*c)) {
                conflicts.push(Conflict {
                    kind: ConflictKind::NameCollision,
                    severity: Severity::Blocking,
                    entity: service.name.clone(),
                    detail: format!(
                        "container name {} is taken by a container outside project {} ({})",
                        name, self.project, other.image
                    ),
                });
            }

            let mut seen: HashSet<(u16, Protocol)> = HashSet::new();
            for binding in service.ports.iter().filter_map(|p| p.binding()) {
                let Some(port) = binding.host_port else {
                    continue;
                };
                if !seen.insert((port, binding.protocol)) {
                    continue;
                }
                if let Some(holder) = self.port_holder(live, port, binding.protocol, &owned) {
                    conflicts.push(Conflict {
                        kind: ConflictKind::PortInUse,
                        severity: Severity::Blocking,
                        entity: service.name.clone(),
                        detail: format!(
                            "host port {}/{} is bound by {}",
                            port, binding.protocol, holder
                        ),
                    });
                }
            }
        }

        conflicts.extend(self.memory_conflicts(spec, live, &owned));
        conflicts.extend(self.cpu_conflicts(spec, live));

        for conflict in &conflicts {
            match conflict.severity {
                Severity::Blocking => tracing::warn!("Conflict: {}", conflict),
                Severity::Advisory => tracing::info!("Conflict: {}", conflict),
            }
        }
        ConflictReport { conflicts }
    }

    fn port_holder(
        &self,
        live: &LiveState,
        port: u16,
        protocol: Protocol,
        owned: &impl Fn(&LiveContainer) -> bool,
    ) -> Option<String> {
        if let Some(binding) = live
            .host_ports
            .iter()
            .find(|b| b.port == port && b.protocol == protocol)
        {
            return Some(binding.process.clone());
        }
        live.containers
            .iter()
            .filter(|c| !owned(*c))
            .find(|c| {
                c.ports
                    .iter()
                    .any(|p| p.host_port == port && p.protocol == protocol)
            })
            .map(|c| format!("container {}", c.name))
    }

    fn memory_conflicts(
        &self,
        spec: &Spec,
        live: &LiveState,
        owned: &impl Fn(&LiveContainer) -> bool,
    ) -> Vec<Conflict> {
        let Some(resources) = live.resources else {
            return Vec::new();
        };

        let reclaimed: u64 = live
            .containers
            .iter()
            .filter(|c| owned(*c))
            .filter_map(|c| c.memory_usage)
            .sum();
        let headroom = resources.available_memory.saturating_add(reclaimed);

        let mut conflicts = Vec::new();
        let mut requested: u64 = 0;
        for service in &spec.services {
            let Some(memory) = service.resources.memory_bytes.filter(|m| *m > 0) else {
                continue;
            };
            requested = requested.saturating_add(memory as u64);
            let ratio = if headroom == 0 {
                f64::INFINITY
            } else {
                requested as f64 / headroom as f64
            };
            if ratio <= self.thresholds.advisory_ratio {
                continue;
            }

            let severity = match self.thresholds.blocking_ratio {
                Some(limit) if ratio >= limit => Severity::Blocking,
                _ => Severity::Advisory,
            };
            conflicts.push(Conflict {
                kind: ConflictKind::ResourceExhaustion,
                severity,
                entity: service.name.clone(),
                detail: format!(
                    "memory limits total {} bytes against {} bytes of headroom",
                    requested, headroom
                ),
            });
        }
        conflicts
    }

    fn cpu_conflicts(&self, spec: &Spec, live: &LiveState) -> Vec<Conflict> {
        let Some(resources) = live.resources else {
            return Vec::new();
        };

        let mut conflicts = Vec::new();
        let mut requested = 0.0;
        for service in &spec.services {
            let Some(cpus) = service.resources.cpus.filter(|c| *c > 0.0) else {
                continue;
            };
            requested += cpus;
            if requested > resources.cpus as f64 {
                conflicts.push(Conflict {
                    kind: ConflictKind::ResourceExhaustion,
                    severity: Severity::Advisory,
                    entity: service.name.clone(),
                    detail: format!(
                        "cpu limits total {} against {} host cpu(s)",
                        requested, resources.cpus
                    ),
                });
            }
        }
        conflicts
    }
}
