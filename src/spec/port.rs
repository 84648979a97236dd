//! Port bindings and their normalized form

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol of a port binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// A single normalized port binding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortBinding {
    /// Host interface to bind to
    pub host_ip: Option<String>,
    /// Published host port; `None` lets the engine pick one
    pub host_port: Option<u16>,
    /// Port inside the container
    pub container_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

impl PortBinding {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: None,
            host_port: Some(host_port),
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    /// Parse compose short syntax, expanding equal-length port ranges.
    ///
    /// Accepts `80`, `8080:80`, `127.0.0.1:8080:80`, `127.0.0.1::80`,
    /// `[::1]:8080:80`, `8000-8001:8000-8001` and an optional `/proto` suffix.
    pub fn parse_many(raw: &str) -> std::result::Result<Vec<PortBinding>, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty port binding".to_string());
        }

        let (body, protocol) = match raw.rsplit_once('/') {
            Some((body, proto)) => (body, proto.parse::<Protocol>()?),
            None => (raw, Protocol::Tcp),
        };

        let (host_ip, rest) = split_host_ip(body)?;
        let parts: Vec<&str> = rest.split(':').collect();

        let (host_ip, host_part, container_part) = match (host_ip, parts.as_slice()) {
            (None, [container]) => (None, None, *container),
            (None, [host, container]) => (None, Some(*host), *container),
            (None, [ip, host, container]) => (Some(ip.to_string()), Some(*host), *container),
            (Some(ip), [host, container]) => (Some(ip), Some(*host), *container),
            _ => return Err(format!("cannot interpret port binding '{}'", raw)),
        };

        let host_part = host_part.filter(|h| !h.is_empty());
        let container_ports = parse_range(container_part)?;
        let host_ports = match host_part {
            Some(h) => Some(parse_range(h)?),
            None => None,
        };

        if let Some(ref hosts) = host_ports {
            if hosts.len() != container_ports.len() {
                return Err(format!(
                    "host range and container range differ in length in '{}'",
                    raw
                ));
            }
        }

        let bindings = container_ports
            .iter()
            .enumerate()
            .map(|(i, container_port)| {
                let host_port = host_ports.as_ref().map(|hosts| hosts[i]);
                PortBinding {
                    host_ip: host_ip.clone(),
                    host_port,
                    container_port: *container_port,
                    protocol,
                }
            })
            .collect();

        Ok(bindings)
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref ip) = self.host_ip {
            if ip.contains(':') {
                write!(f, "[{}]:", ip)?;
            } else {
                write!(f, "{}:", ip)?;
            }
        }
        match self.host_port {
            Some(port) => write!(f, "{}:", port)?,
            None if self.host_ip.is_some() => write!(f, ":")?,
            None => {}
        }
        write!(f, "{}/{}", self.container_port, self.protocol)
    }
}

fn split_host_ip(body: &str) -> std::result::Result<(Option<String>, &str), String> {
    if let Some(stripped) = body.strip_prefix('[') {
        let (ip, rest) = stripped
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 address in '{}'", body))?;
        let rest = rest
            .strip_prefix(':')
            .ok_or_else(|| format!("missing port after IPv6 address in '{}'", body))?;
        return Ok((Some(ip.to_string()), rest));
    }
    Ok((None, body))
}

fn parse_range(s: &str) -> std::result::Result<Vec<u16>, String> {
    let parse_one = |p: &str| {
        p.trim()
            .parse::<u16>()
            .map_err(|_| format!("'{}' is not a valid port number", p))
    };

    match s.split_once('-') {
        Some((start, end)) => {
            let start = parse_one(start)?;
            let end = parse_one(end)?;
            if end < start {
                return Err(format!("port range '{}' is reversed", s));
            }
            Ok((start..=end).collect())
        }
        None => Ok(vec![parse_one(s)?]),
    }
}

/// A port entry as declared in a spec.
///
/// Entries that cannot be normalized are retained verbatim so the validator
/// can report them alongside every other issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PortSpec {
    Bound(PortBinding),
    Malformed(String),
}

impl PortSpec {
    pub fn binding(&self) -> Option<&PortBinding> {
        match self {
            PortSpec::Bound(binding) => Some(binding),
            PortSpec::Malformed(_) => None,
        }
    }

    /// Parse one declared entry, which may expand to several bindings
    pub fn parse(raw: &str) -> Vec<PortSpec> {
        match PortBinding::parse_many(raw) {
            Ok(bindings) => bindings.into_iter().map(PortSpec::Bound).collect(),
            Err(_) => vec![PortSpec::Malformed(raw.to_string())],
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Bound(binding) => binding.fmt(f),
            PortSpec::Malformed(raw) => write!(f, "{}", raw),
        }
    }
}

impl From<String> for PortSpec {
    fn from(raw: String) -> Self {
        match PortBinding::parse_many(&raw) {
            Ok(mut bindings) if bindings.len() == 1 => PortSpec::Bound(bindings.remove(0)),
            _ => PortSpec::Malformed(raw),
        }
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

impl From<PortBinding> for PortSpec {
    fn from(binding: PortBinding) -> Self {
        PortSpec::Bound(binding)
    }
}
