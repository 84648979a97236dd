//! Raw compose document shapes
//!
//! These accept the loose forms compose allows (lists or maps, strings or
//! numbers) and are lowered by the parser into the normalized
//! [`crate::spec::Spec`].

use serde::Deserialize;
use serde_yaml::Mapping;
use std::collections::BTreeMap;
use std::fmt;

/// Top level of a compose file. Entity sections stay as mappings so
/// declaration order survives.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComposeDocument {
    pub version: Option<String>,
    pub name: Option<String>,
    pub services: Mapping,
    pub networks: Mapping,
    pub volumes: Mapping,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawService {
    pub image: Option<String>,
    /// Only checked for presence
    pub build: Option<serde_yaml::Value>,
    pub command: Option<StringOrList>,
    pub container_name: Option<String>,
    pub environment: Option<KeyValues>,
    pub ports: Option<Vec<RawPort>>,
    pub volumes: Option<Vec<RawMount>>,
    pub networks: Option<NameList>,
    pub depends_on: Option<NameList>,
    pub deploy: Option<RawDeploy>,
    pub mem_limit: Option<Scalar>,
    pub cpus: Option<Scalar>,
    pub pids_limit: Option<i64>,
    pub healthcheck: Option<RawHealthcheck>,
    pub labels: Option<KeyValues>,
    pub restart: Option<String>,
}

impl RawService {
    /// Limits from `deploy.resources.limits`, falling back to the legacy
    /// top-level keys
    pub fn limits(&mut self) -> RawLimits {
        let deployed = self
            .deploy
            .take()
            .and_then(|d| d.resources)
            .and_then(|r| r.limits)
            .unwrap_or_default();
        RawLimits {
            cpus: deployed.cpus.or(self.cpus.take()),
            memory: deployed.memory.or(self.mem_limit.take()),
            pids: deployed.pids.or(self.pids_limit.take()),
        }
    }
}

/// A YAML scalar accepted where compose expects text
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => write!(f, "{}", s),
        }
    }
}

/// `command: "a b"` or `command: [a, b]`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    List(Vec<String>),
}

/// `KEY=value` list or `KEY: value` map, used by environment and labels
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeyValues {
    List(Vec<String>),
    Map(BTreeMap<String, Option<Scalar>>),
}

impl KeyValues {
    pub fn into_map(self) -> BTreeMap<String, String> {
        match self {
            KeyValues::List(items) => items
                .into_iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item, String::new()),
                })
                .collect(),
            KeyValues::Map(map) => map
                .into_iter()
                .map(|(k, v)| (k, v.map(|v| v.to_string()).unwrap_or_default()))
                .collect(),
        }
    }
}

/// A list of names, or a map keyed by name whose values are ignored
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NameList {
    List(Vec<String>),
    Map(Mapping),
}

impl NameList {
    /// Names in declaration order, or the first non-string key
    pub fn into_names(self) -> Result<Vec<String>, serde_yaml::Value> {
        match self {
            NameList::List(names) => Ok(names),
            NameList::Map(map) => map
                .into_iter()
                .map(|(key, _)| match key {
                    serde_yaml::Value::String(name) => Ok(name),
                    other => Err(other),
                })
                .collect(),
        }
    }
}

/// `80`, `"8080:80/udp"` or the long form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPort {
    Number(u64),
    Short(String),
    Long(LongPort),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LongPort {
    pub target: u16,
    #[serde(default)]
    pub published: Option<Scalar>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

impl RawPort {
    /// Rewrite as short syntax so every form goes through one port parser
    pub fn short_syntax(self) -> String {
        let long = match self {
            RawPort::Number(n) => return n.to_string(),
            RawPort::Short(s) => return s,
            RawPort::Long(long) => long,
        };

        let mut raw = String::new();
        if let Some(ip) = long.host_ip.filter(|ip| !ip.is_empty()) {
            if ip.contains(':') {
                raw.push_str(&format!("[{}]:", ip));
            } else {
                raw.push_str(&format!("{}:", ip));
            }
        }
        match long.published {
            Some(published) => raw.push_str(&format!("{}:", published)),
            None if !raw.is_empty() => raw.push(':'),
            None => {}
        }
        raw.push_str(&long.target.to_string());
        if let Some(proto) = long.protocol {
            raw.push_str(&format!("/{}", proto));
        }
        raw
    }
}

/// `"src:dst:ro"` or the long form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawMount {
    Short(String),
    Long(LongMount),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LongMount {
    /// `volume`, `bind` or `tmpfs`
    #[serde(rename = "type", default)]
    pub mount_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDeploy {
    pub resources: Option<RawResources>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawResources {
    pub limits: Option<RawLimits>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawLimits {
    pub cpus: Option<Scalar>,
    pub memory: Option<Scalar>,
    pub pids: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawHealthcheck {
    pub test: Option<StringOrList>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<u32>,
    pub start_period: Option<String>,
    pub disable: Option<bool>,
}

/// Top-level network or volume declaration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawResource {
    pub driver: Option<String>,
    pub external: Option<External>,
    /// Networks only
    pub internal: Option<bool>,
    pub labels: Option<KeyValues>,
}

/// `external: true` or `external: { name: ... }`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum External {
    Flag(bool),
    Named { name: String },
}

impl External {
    pub fn is_external(&self) -> bool {
        match self {
            External::Flag(b) => *b,
            External::Named { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_values_forms_agree() {
        let list: KeyValues = serde_yaml::from_str("[A=1, B]").unwrap();
        let map: KeyValues = serde_yaml::from_str("{A: 1, B: null}").unwrap();
        assert_eq!(list.into_map(), map.into_map());
    }

    #[test]
    fn test_long_port_short_syntax() {
        let port: RawPort =
            serde_yaml::from_str("{target: 53, published: 5353, host_ip: '::1', protocol: udp}")
                .unwrap();
        assert_eq!(port.short_syntax(), "[::1]:5353:53/udp");
    }

    #[test]
    fn test_legacy_limits_fallback() {
        let mut service: RawService =
            serde_yaml::from_str("{mem_limit: 512m, deploy: {resources: {limits: {cpus: '0.5'}}}}")
                .unwrap();
        let limits = service.limits();
        assert_eq!(limits.memory, Some(Scalar::Str("512m".to_string())));
        assert_eq!(limits.cpus, Some(Scalar::Str("0.5".to_string())));
    }
}
