//! Structured diffs between deployment specs
//!
//! Entities are matched by name within their class. Matched entities are
//! flattened into canonical `field -> value` pairs so representation-only
//! differences (port spellings, image aliases, map ordering) disappear
//! before comparison.

use crate::runtime::{ContainerStatus, LiveState};
use crate::spec::{NetworkDef, ServiceDef, Spec, VolumeDef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Class of a compared entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Service,
    Network,
    Volume,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Service => write!(f, "service"),
            EntityKind::Network => write!(f, "network"),
            EntityKind::Volume => write!(f, "volume"),
        }
    }
}

/// How an entity changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    Unchanged,
}

impl ChangeKind {
    fn marker(self) -> char {
        match self {
            ChangeKind::Added => '+',
            ChangeKind::Removed => '-',
            ChangeKind::Modified => '~',
            ChangeKind::Unchanged => ' ',
        }
    }
}

/// One field of a modified entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Change to a single named entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChange {
    pub kind: EntityKind,
    pub name: String,
    pub change: ChangeKind,
    /// Field-level delta; only populated for `Modified`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldChange>,
}

/// Ordered entity changes: services, then networks, then volumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub changes: Vec<EntityChange>,
}

impl DiffResult {
    pub fn count(&self, change: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.change == change).count()
    }

    pub fn added(&self) -> usize {
        self.count(ChangeKind::Added)
    }

    pub fn removed(&self) -> usize {
        self.count(ChangeKind::Removed)
    }

    pub fn modified(&self) -> usize {
        self.count(ChangeKind::Modified)
    }

    /// No entity was added, removed or modified
    pub fn is_noop(&self) -> bool {
        self.changes.iter().all(|c| c.change == ChangeKind::Unchanged)
    }

    pub fn get(&self, kind: EntityKind, name: &str) -> Option<&EntityChange> {
        self.changes.iter().find(|c| c.kind == kind && c.name == name)
    }

    /// One-line summary such as `1 added, 0 removed, 2 modified`
    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} modified, {} unchanged",
            self.added(),
            self.removed(),
            self.modified(),
            self.count(ChangeKind::Unchanged)
        )
    }
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in &self.changes {
            writeln!(f, "{} {} {}", change.change.marker(), change.kind, change.name)?;
            for field in &change.fields {
                let old = field.old.as_deref().unwrap_or("(unset)");
                let new = field.new.as_deref().unwrap_or("(unset)");
                writeln!(f, "    {}: {} -> {}", field.field, old, new)?;
            }
        }
        Ok(())
    }
}

/// Canonical fields keyed by (schema rank, field name)
type Fields = BTreeMap<(u8, String), String>;

fn put(fields: &mut Fields, rank: u8, name: &str, value: impl Into<String>) {
    fields.insert((rank, name.to_string()), value.into());
}

fn put_map(fields: &mut Fields, rank: u8, prefix: &str, map: &BTreeMap<String, String>) {
    for (k, v) in map {
        fields.insert((rank, format!("{}.{}", prefix, k)), v.clone());
    }
}

/// Argument vectors keep element boundaries: `["sh", "-c", "echo hi"]`
fn argv(args: &[String]) -> String {
    format!("{:?}", args)
}

fn service_fields(service: &ServiceDef) -> Fields {
    let mut fields = Fields::new();
    put(&mut fields, 0, "image", service.image.clone());
    if let Some(ref name) = service.container_name {
        put(&mut fields, 1, "container_name", name.clone());
    }
    if !service.command.is_empty() {
        put(&mut fields, 2, "command", argv(&service.command));
    }
    if !service.ports.is_empty() {
        let ports: Vec<String> = service.ports.iter().map(|p| p.to_string()).collect();
        put(&mut fields, 3, "ports", ports.join(", "));
    }
    for mount in &service.volumes {
        let key = format!("volumes.{}", mount.target);
        fields.insert((4, key), mount.to_string());
    }
    put_map(&mut fields, 5, "environment", &service.environment);
    if !service.depends_on.is_empty() {
        let mut deps = service.depends_on.clone();
        deps.sort();
        deps.dedup();
        put(&mut fields, 6, "depends_on", deps.join(", "));
    }
    if !service.networks.is_empty() {
        let mut networks = service.networks.clone();
        networks.sort();
        networks.dedup();
        put(&mut fields, 7, "networks", networks.join(", "));
    }
    if let Some(restart) = service.restart {
        put(&mut fields, 8, "restart", restart.to_string());
    }
    if let Some(memory) = service.resources.memory_bytes {
        put(&mut fields, 9, "resources.memory", memory.to_string());
    }
    if let Some(cpus) = service.resources.cpus {
        put(&mut fields, 9, "resources.cpus", cpus.to_string());
    }
    if let Some(pids) = service.resources.pids {
        put(&mut fields, 9, "resources.pids", pids.to_string());
    }
    if let Some(ref hc) = service.healthcheck {
        put(&mut fields, 10, "healthcheck.test", argv(&hc.test));
        let optional = [
            ("healthcheck.interval", hc.interval.clone()),
            ("healthcheck.timeout", hc.timeout.clone()),
            ("healthcheck.retries", hc.retries.map(|r| r.to_string())),
            ("healthcheck.start_period", hc.start_period.clone()),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                put(&mut fields, 10, name, value);
            }
        }
    }
    put_map(&mut fields, 11, "labels", &service.labels);
    fields
}

fn network_fields(network: &NetworkDef) -> Fields {
    let mut fields = Fields::new();
    if let Some(ref driver) = network.driver {
        put(&mut fields, 0, "driver", driver.clone());
    }
    put(&mut fields, 1, "external", network.external.to_string());
    put(&mut fields, 2, "internal", network.internal.to_string());
    put_map(&mut fields, 3, "labels", &network.labels);
    fields
}

fn volume_fields(volume: &VolumeDef) -> Fields {
    let mut fields = Fields::new();
    if let Some(ref driver) = volume.driver {
        put(&mut fields, 0, "driver", driver.clone());
    }
    put(&mut fields, 1, "external", volume.external.to_string());
    put_map(&mut fields, 2, "labels", &volume.labels);
    fields
}

fn compare_fields(old: &Fields, new: &Fields) -> Vec<FieldChange> {
    let mut keys: Vec<&(u8, String)> = old.keys().chain(new.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter_map(|key| {
            let before = old.get(key);
            let after = new.get(key);
            (before != after).then(|| FieldChange {
                field: key.1.clone(),
                old: before.cloned(),
                new: after.cloned(),
            })
        })
        .collect()
}

/// Diff one entity class. Entities appear in `new` order, then entities
/// only present in `old`, in `old` order.
fn diff_class<T>(
    kind: EntityKind,
    old: &[T],
    new: &[T],
    name: impl Fn(&T) -> &str,
    flatten: impl Fn(&T) -> Fields,
    out: &mut Vec<EntityChange>,
) {
    let mut seen = HashSet::new();

    for entity in new {
        let entity_name = name(entity);
        if !seen.insert(entity_name) {
            continue;
        }
        let change = match old.iter().find(|o| name(*o) == entity_name) {
            None => EntityChange {
                kind,
                name: entity_name.to_string(),
                change: ChangeKind::Added,
                fields: Vec::new(),
            },
            Some(previous) => {
                let fields = compare_fields(&flatten(previous), &flatten(entity));
                EntityChange {
                    kind,
                    name: entity_name.to_string(),
                    change: if fields.is_empty() {
                        ChangeKind::Unchanged
                    } else {
                        ChangeKind::Modified
                    },
                    fields,
                }
            }
        };
        out.push(change);
    }

    for entity in old {
        let entity_name = name(entity);
        if seen.insert(entity_name) {
            out.push(EntityChange {
                kind,
                name: entity_name.to_string(),
                change: ChangeKind::Removed,
                fields: Vec::new(),
            });
        }
    }
}

/// Structured delta from `old` to `new`
pub fn diff(old: &Spec, new: &Spec) -> DiffResult {
    let mut changes = Vec::new();
    diff_class(
        EntityKind::Service,
        &old.services,
        &new.services,
        |s| s.name.as_str(),
        service_fields,
        &mut changes,
    );
    diff_class(
        EntityKind::Network,
        &old.networks,
        &new.networks,
        |n| n.name.as_str(),
        network_fields,
        &mut changes,
    );
    diff_class(
        EntityKind::Volume,
        &old.volumes,
        &new.volumes,
        |v| v.name.as_str(),
        volume_fields,
        &mut changes,
    );
    DiffResult { changes }
}

/// Service-level delta from the observed runtime to `spec`.
///
/// Only containers labelled with `project` are considered. Images are
/// compared normalized; a container that is not running counts as a
/// modification towards `running`.
pub fn diff_live(spec: &Spec, live: &LiveState, project: &str) -> DiffResult {
    let owned: Vec<_> = live
        .containers
        .iter()
        .filter(|c| c.project.as_deref() == Some(project))
        .collect();

    let mut changes = Vec::new();
    let mut seen = HashSet::new();

    for service in &spec.services {
        if !seen.insert(service.name.as_str()) {
            continue;
        }
        let container = owned
            .iter()
            .find(|c| c.service.as_deref() == Some(service.name.as_str()));

        let change = match container {
            None => EntityChange {
                kind: EntityKind::Service,
                name: service.name.clone(),
                change: ChangeKind::Added,
                fields: Vec::new(),
            },
            Some(container) => {
                let mut fields = Vec::new();
                let image = crate::spec::normalize_image(&container.image);
                if image != service.image {
                    fields.push(FieldChange {
                        field: "image".to_string(),
                        old: Some(image),
                        new: Some(service.image.clone()),
                    });
                }
                if container.status != ContainerStatus::Running {
                    fields.push(FieldChange {
                        field: "status".to_string(),
                        old: Some(container.status.to_string()),
                        new: Some(ContainerStatus::Running.to_string()),
                    });
                }
                EntityChange {
                    kind: EntityKind::Service,
                    name: service.name.clone(),
                    change: if fields.is_empty() {
                        ChangeKind::Unchanged
                    } else {
                        ChangeKind::Modified
                    },
                    fields,
                }
            }
        };
        changes.push(change);
    }

    for container in owned {
        let Some(ref service) = container.service else {
            continue;
        };
        if seen.insert(service.as_str()) {
            changes.push(EntityChange {
                kind: EntityKind::Service,
                name: service.clone(),
                change: ChangeKind::Removed,
                fields: Vec::new(),
            });
        }
    }

    DiffResult { changes }
}
