//! Render a Spec back into a compose document

use crate::error::Result;
use crate::spec::{Healthcheck, MountSource, NetworkDef, ServiceDef, Spec, VolumeDef};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Render a spec as compose YAML.
///
/// The output parses back into a spec equal to the input.
pub fn to_yaml(spec: &Spec) -> Result<String> {
    let document = to_document(spec);
    Ok(serde_yaml::to_string(&document)?)
}

/// Build the compose document tree for a spec
pub fn to_document(spec: &Spec) -> Value {
    let mut root = Mapping::new();

    if let Some(ref name) = spec.name {
        root.insert(key("name"), Value::String(name.clone()));
    }

    let mut services = Mapping::new();
    for service in &spec.services {
        services.insert(key(&service.name), render_service(service));
    }
    root.insert(key("services"), Value::Mapping(services));

    if !spec.networks.is_empty() {
        let mut networks = Mapping::new();
        for network in &spec.networks {
            networks.insert(key(&network.name), render_network(network));
        }
        root.insert(key("networks"), Value::Mapping(networks));
    }

    if !spec.volumes.is_empty() {
        let mut volumes = Mapping::new();
        for volume in &spec.volumes {
            volumes.insert(key(&volume.name), render_volume(volume));
        }
        root.insert(key("volumes"), Value::Mapping(volumes));
    }

    Value::Mapping(root)
}

fn key(s: &str) -> Value {
    Value::String(s.to_string())
}

fn strings<'a>(items: impl IntoIterator<Item = &'a String>) -> Value {
    Value::Sequence(items.into_iter().map(|s| Value::String(s.clone())).collect())
}

fn string_map(map: &BTreeMap<String, String>) -> Value {
    let mut out = Mapping::new();
    for (k, v) in map {
        out.insert(key(k), Value::String(v.clone()));
    }
    Value::Mapping(out)
}

fn render_service(service: &ServiceDef) -> Value {
    let mut out = Mapping::new();

    out.insert(key("image"), Value::String(service.image.clone()));

    if let Some(ref name) = service.container_name {
        out.insert(key("container_name"), Value::String(name.clone()));
    }
    if !service.command.is_empty() {
        out.insert(key("command"), strings(&service.command));
    }
    if let Some(restart) = service.restart {
        out.insert(key("restart"), Value::String(restart.to_string()));
    }
    if !service.ports.is_empty() {
        let ports: Vec<String> = service.ports.iter().map(|p| p.to_string()).collect();
        out.insert(key("ports"), strings(&ports));
    }
    if !service.volumes.is_empty() {
        let mounts = service
            .volumes
            .iter()
            .map(|mount| {
                let mut long = Mapping::new();
                let (kind, source) = match &mount.source {
                    MountSource::Named(name) => ("volume", Some(name)),
                    MountSource::Bind(path) => ("bind", Some(path)),
                    MountSource::Anonymous => ("volume", None),
                };
                long.insert(key("type"), key(kind));
                if let Some(source) = source {
                    long.insert(key("source"), Value::String(source.clone()));
                }
                long.insert(key("target"), Value::String(mount.target.clone()));
                if mount.read_only {
                    long.insert(key("read_only"), Value::Bool(true));
                }
                Value::Mapping(long)
            })
            .collect();
        out.insert(key("volumes"), Value::Sequence(mounts));
    }
    if !service.environment.is_empty() {
        out.insert(key("environment"), string_map(&service.environment));
    }
    if !service.depends_on.is_empty() {
        out.insert(key("depends_on"), strings(&service.depends_on));
    }
    if !service.networks.is_empty() {
        out.insert(key("networks"), strings(&service.networks));
    }
    if let Some(ref healthcheck) = service.healthcheck {
        out.insert(key("healthcheck"), render_healthcheck(healthcheck));
    }
    if !service.resources.is_empty() {
        let mut limits = Mapping::new();
        if let Some(memory) = service.resources.memory_bytes {
            limits.insert(key("memory"), Value::Number(memory.into()));
        }
        if let Some(cpus) = service.resources.cpus {
            limits.insert(key("cpus"), Value::String(cpus.to_string()));
        }
        if let Some(pids) = service.resources.pids {
            limits.insert(key("pids"), Value::Number(pids.into()));
        }
        let mut resources = Mapping::new();
        resources.insert(key("limits"), Value::Mapping(limits));
        let mut deploy = Mapping::new();
        deploy.insert(key("resources"), Value::Mapping(resources));
        out.insert(key("deploy"), Value::Mapping(deploy));
    }
    if !service.labels.is_empty() {
        out.insert(key("labels"), string_map(&service.labels));
    }

    Value::Mapping(out)
}

fn render_healthcheck(healthcheck: &Healthcheck) -> Value {
    let mut out = Mapping::new();
    out.insert(key("test"), strings(&healthcheck.test));
    let durations = [
        ("interval", &healthcheck.interval),
        ("timeout", &healthcheck.timeout),
        ("start_period", &healthcheck.start_period),
    ];
    for (name, value) in durations {
        if let Some(value) = value {
            out.insert(key(name), Value::String(value.clone()));
        }
    }
    if let Some(retries) = healthcheck.retries {
        out.insert(key("retries"), Value::Number(retries.into()));
    }
    Value::Mapping(out)
}

fn render_network(network: &NetworkDef) -> Value {
    let mut out = Mapping::new();
    if let Some(ref driver) = network.driver {
        out.insert(key("driver"), Value::String(driver.clone()));
    }
    if network.external {
        out.insert(key("external"), Value::Bool(true));
    }
    if network.internal {
        out.insert(key("internal"), Value::Bool(true));
    }
    if !network.labels.is_empty() {
        out.insert(key("labels"), string_map(&network.labels));
    }
    if out.is_empty() {
        Value::Null
    } else {
        Value::Mapping(out)
    }
}

fn render_volume(volume: &VolumeDef) -> Value {
    let mut out = Mapping::new();
    if let Some(ref driver) = volume.driver {
        out.insert(key("driver"), Value::String(driver.clone()));
    }
    if volume.external {
        out.insert(key("external"), Value::Bool(true));
    }
    if !volume.labels.is_empty() {
        out.insert(key("labels"), string_map(&volume.labels));
    }
    if out.is_empty() {
        Value::Null
    } else {
        Value::Mapping(out)
    }
}
