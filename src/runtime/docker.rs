//! `docker compose` CLI adapter

use super::live::{
    ContainerStatus, HealthStatus, HostPortBinding, HostResources, LiveContainer, LiveState,
    PublishedPort, PROJECT_LABEL, SERVICE_LABEL,
};
use super::{ProbeKind, ProbeResult, ProbeTarget, RuntimeApplier, RuntimeObserver, RuntimeProber};
use crate::compose::{to_yaml, ComposeParser};
use crate::error::{EngineError, Result};
use crate::spec::{Protocol, Spec};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Engine messages that will not go away by retrying
const PERMANENT_MARKERS: &[&str] = &[
    "invalid reference format",
    "pull access denied",
    "manifest unknown",
    "no such image",
    "repository does not exist",
    "yaml:",
    "is invalid",
    "additional property",
    "unsupported",
];

/// Exit status of `sh` when a command is not installed
const COMMAND_NOT_FOUND: i32 = 127;

/// Drives a compose project through the docker CLI
pub struct DockerCompose {
    project: String,
    compose_dir: PathBuf,
    docker: String,
    connect_timeout: Duration,
}

impl DockerCompose {
    pub fn new(project: &str, compose_dir: PathBuf) -> Self {
        Self {
            project: project.to_string(),
            compose_dir,
            docker: "docker".to_string(),
            connect_timeout: Duration::from_secs(3),
        }
    }

    /// Use a different docker executable
    pub fn binary(mut self, docker: &str) -> Self {
        self.docker = docker.to_string();
        self
    }

    /// Compose file the adapter hands to the engine
    pub fn compose_file(&self) -> PathBuf {
        self.compose_dir.join(format!("{}.yaml", self.project))
    }

    /// The spec most recently applied through this adapter, if any
    pub fn current_spec(&self) -> Result<Option<Spec>> {
        let path = self.compose_file();
        if !path.exists() {
            return Ok(None);
        }
        let spec = ComposeParser::parse_file(&path, &HashMap::new())?;
        Ok(Some(spec))
    }

    async fn write_compose_file(&self, spec: &Spec) -> std::result::Result<PathBuf, EngineError> {
        let yaml = to_yaml(spec).map_err(|e| EngineError::permanent(e.to_string()))?;
        let path = self.compose_file();
        tokio::fs::create_dir_all(&self.compose_dir)
            .await
            .map_err(|e| {
                EngineError::permanent(format!("create {}: {}", self.compose_dir.display(), e))
            })?;
        tokio::fs::write(&path, yaml)
            .await
            .map_err(|e| EngineError::permanent(format!("write {}: {}", path.display(), e)))?;
        Ok(path)
    }

    async fn docker(&self, args: &[&str]) -> std::result::Result<Output, EngineError> {
        tracing::debug!("Executing: {} {}", self.docker, args.join(" "));
        Command::new(&self.docker)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::permanent(format!("failed to run {}: {}", self.docker, e)))
    }

    async fn compose(&self, file: &Path, args: &[&str]) -> std::result::Result<(), EngineError> {
        let file = file.to_string_lossy();
        let mut full = vec!["compose", "-p", self.project.as_str(), "-f", file.as_ref()];
        full.extend_from_slice(args);

        let output = self.docker(&full).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(&stderr))
    }

    async fn list_containers(&self) -> std::result::Result<Vec<LiveContainer>, EngineError> {
        let output = self.docker(&["ps", "-a", "--no-trunc", "--format", "{{json .}}"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut containers = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<PsRow>(line) {
                Ok(row) => containers.push(row.into_container()),
                Err(e) => tracing::warn!("Skipping unreadable docker ps row: {}", e),
            }
        }
        Ok(containers)
    }

    /// Best-effort memory sampling; failures leave usage unset
    async fn sample_memory(&self, containers: &mut [LiveContainer]) {
        let output = match self
            .docker(&["stats", "--no-stream", "--format", "{{json .}}"])
            .await
        {
            Ok(output) if output.status.success() => output,
            Ok(_) | Err(_) => {
                tracing::debug!("docker stats unavailable, skipping memory sampling");
                return;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let Ok(row) = serde_json::from_str::<StatsRow>(line) else {
                continue;
            };
            let usage = row.mem_usage.split('/').next().and_then(parse_size);
            if let Some(container) = containers.iter_mut().find(|c| c.name == row.name) {
                container.memory_usage = usage;
            }
        }
    }

    /// Run `script` under `sh -c` in the container with `args` as `$1..`
    async fn exec(
        &self,
        container: &str,
        script: &str,
        args: &[&str],
    ) -> std::result::Result<Output, EngineError> {
        let mut argv = vec!["exec", container, "sh", "-c", script, "sh"];
        argv.extend_from_slice(args);
        self.docker(&argv).await
    }
}

fn classify_failure(stderr: &str) -> EngineError {
    let lower = stderr.to_ascii_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        EngineError::permanent(stderr)
    } else {
        EngineError::transient(stderr)
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }
    text
}

#[async_trait]
impl RuntimeObserver for DockerCompose {
    async fn observe(&self) -> std::result::Result<LiveState, EngineError> {
        let mut containers = self.list_containers().await?;
        self.sample_memory(&mut containers).await;

        let published: HashSet<(u16, Protocol)> = containers
            .iter()
            .filter(|c| c.is_running())
            .flat_map(|c| c.ports.iter().map(|p| (p.host_port, p.protocol)))
            .collect();

        let host_ports = listening_ports()
            .into_iter()
            .filter(|(port, protocol)| !published.contains(&(*port, *protocol)))
            .map(|(port, protocol)| HostPortBinding {
                port,
                protocol,
                process: "host process".to_string(),
            })
            .collect();

        Ok(LiveState {
            observed_at: Utc::now(),
            containers,
            host_ports,
            resources: host_resources(),
        })
    }
}

#[async_trait]
impl RuntimeApplier for DockerCompose {
    async fn apply(&self, spec: &Spec) -> std::result::Result<(), EngineError> {
        let file = self.write_compose_file(spec).await?;
        tracing::info!("Bringing up compose project {}", self.project);
        self.compose(&file, &["up", "-d", "--remove-orphans"]).await
    }

    async fn teardown(&self, spec: &Spec) -> std::result::Result<(), EngineError> {
        let file = self.write_compose_file(spec).await?;
        tracing::info!("Tearing down compose project {}", self.project);
        self.compose(&file, &["down", "--remove-orphans"]).await
    }
}

#[async_trait]
impl RuntimeProber for DockerCompose {
    async fn probe(
        &self,
        target: &ProbeTarget,
        kind: &ProbeKind,
    ) -> std::result::Result<ProbeResult, EngineError> {
        match kind {
            ProbeKind::PortReachable {
                host_ip,
                host_port,
                protocol,
            } => {
                if *protocol != Protocol::Tcp {
                    return Ok(ProbeResult::pass(format!(
                        "{}/{} is published; datagram reachability is not probed",
                        host_port, protocol
                    )));
                }
                let ip = host_ip
                    .as_deref()
                    .filter(|ip| !matches!(*ip, "0.0.0.0" | "::" | ""))
                    .unwrap_or("127.0.0.1");
                let addr = format!("{}:{}", ip, host_port);
                let connect = tokio::net::TcpStream::connect(addr.as_str());
                Ok(match tokio::time::timeout(self.connect_timeout, connect).await {
                    Ok(Ok(_)) => ProbeResult::pass(format!("connected to {}", addr)),
                    Ok(Err(e)) => ProbeResult::fail(format!("connect to {} failed: {}", addr, e)),
                    Err(_) => ProbeResult::fail(format!("connect to {} timed out", addr)),
                })
            }
            ProbeKind::VolumeMount { target: path, writable } => {
                let script = if *writable {
                    r#"test -d "$1" && touch "$1/.keel-probe" && rm -f "$1/.keel-probe""#
                } else {
                    r#"test -e "$1""#
                };
                let output = self.exec(&target.container, script, &[path.as_str()]).await?;
                let what = if *writable { "writable" } else { "present" };
                Ok(if output.status.success() {
                    ProbeResult::pass(format!("{} is {}", path, what))
                } else {
                    ProbeResult::fail(format!(
                        "{} is not {}: {}",
                        path,
                        what,
                        combined_output(&output)
                    ))
                })
            }
            ProbeKind::Environment { keys } => {
                let output = self.docker(&["exec", target.container.as_str(), "env"]).await?;
                if !output.status.success() {
                    return Ok(ProbeResult::fail(combined_output(&output)));
                }
                let env = String::from_utf8_lossy(&output.stdout);
                let missing = missing_env(&env, keys);
                Ok(if missing.is_empty() {
                    ProbeResult::pass(format!("{} variable(s) set", keys.len()))
                } else {
                    ProbeResult::fail(format!("not set: {}", missing.join(", ")))
                })
            }
            ProbeKind::NetworkReachable { to_service, port } => {
                if let Some(port) = port {
                    let port_arg = port.to_string();
                    let output = self
                        .exec(
                            &target.container,
                            r#"nc -z -w 3 "$1" "$2""#,
                            &[to_service.as_str(), port_arg.as_str()],
                        )
                        .await?;
                    if output.status.code() != Some(COMMAND_NOT_FOUND) {
                        return Ok(edge_verdict(
                            &target.service,
                            to_service,
                            Some(*port),
                            output.status.success(),
                            &combined_output(&output),
                        ));
                    }
                    tracing::debug!(
                        "nc is not installed in {}, checking name resolution only",
                        target.container
                    );
                }
                let output = self
                    .exec(&target.container, r#"getent hosts "$1""#, &[to_service.as_str()])
                    .await?;
                Ok(edge_verdict(
                    &target.service,
                    to_service,
                    None,
                    output.status.success(),
                    &combined_output(&output),
                ))
            }
            ProbeKind::ResourceBaseline {
                max_cpu_percent,
                max_memory_percent,
            } => {
                let output = self
                    .docker(&[
                        "stats",
                        "--no-stream",
                        "--format",
                        "{{json .}}",
                        target.container.as_str(),
                    ])
                    .await?;
                if !output.status.success() {
                    return Ok(ProbeResult::fail(combined_output(&output)));
                }
                let stdout = String::from_utf8_lossy(&output.stdout);
                let row = stdout
                    .lines()
                    .find_map(|line| serde_json::from_str::<StatsRow>(line).ok());
                Ok(match row {
                    Some(row) => baseline_verdict(&row, *max_cpu_percent, *max_memory_percent),
                    None => ProbeResult::fail("docker stats returned no usage"),
                })
            }
            ProbeKind::Logs { window_lines } => {
                let tail = window_lines.to_string();
                let output = self
                    .docker(&["logs", "--tail", tail.as_str(), target.container.as_str()])
                    .await?;
                if !output.status.success() {
                    return Ok(ProbeResult::fail(combined_output(&output)));
                }
                let lines: Vec<String> = combined_output(&output)
                    .lines()
                    .map(str::to_string)
                    .collect();
                Ok(ProbeResult::pass(format!("read {} log line(s)", lines.len())).with_lines(lines))
            }
        }
    }
}

/// One row of `docker ps --format '{{json .}}'`
#[derive(Debug, Deserialize)]
struct PsRow {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "Ports", default)]
    ports: String,
}

impl PsRow {
    fn into_container(self) -> LiveContainer {
        let labels: HashMap<&str, &str> = self
            .labels
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();

        let health = if self.status.contains("(healthy)") {
            Some(HealthStatus::Healthy)
        } else if self.status.contains("(unhealthy)") {
            Some(HealthStatus::Unhealthy)
        } else if self.status.contains("(health: starting)") {
            Some(HealthStatus::Starting)
        } else {
            None
        };

        let name = self.names.split(',').next().unwrap_or_default().to_string();
        LiveContainer {
            name,
            image: self.image.clone(),
            project: labels.get(PROJECT_LABEL).map(|s| s.to_string()),
            service: labels.get(SERVICE_LABEL).map(|s| s.to_string()),
            status: self.state.parse().unwrap_or(ContainerStatus::Unknown),
            health,
            ports: parse_ps_ports(&self.ports),
            memory_usage: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatsRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
}

/// Declared keys with no entry in `env` output
fn missing_env<'a>(env: &str, keys: &'a [String]) -> Vec<&'a str> {
    let set: HashSet<&str> = env
        .lines()
        .filter_map(|line| line.split_once('=').map(|(key, _)| key))
        .collect();
    keys.iter()
        .map(String::as_str)
        .filter(|key| !set.contains(key))
        .collect()
}

/// A connect check when `port` is known, name resolution otherwise
fn edge_verdict(
    from: &str,
    to: &str,
    port: Option<u16>,
    success: bool,
    detail: &str,
) -> ProbeResult {
    match (port, success) {
        (Some(port), true) => ProbeResult::pass(format!("{} connected to {}:{}", from, to, port)),
        (Some(port), false) => {
            ProbeResult::fail(format!("{} cannot connect to {}:{}: {}", from, to, port, detail))
        }
        (None, true) => ProbeResult::pass(format!(
            "{} resolves {} (name resolution only): {}",
            from, to, detail
        )),
        (None, false) => ProbeResult::fail(format!("{} cannot resolve {}: {}", from, to, detail)),
    }
}

/// `12.5%` as a number
fn parse_percent(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').trim().parse().ok()
}

fn baseline_verdict(row: &StatsRow, max_cpu: u32, max_memory: u32) -> ProbeResult {
    let (Some(cpu), Some(memory)) = (parse_percent(&row.cpu_perc), parse_percent(&row.mem_perc))
    else {
        return ProbeResult::fail(format!(
            "unreadable usage: cpu '{}', memory '{}'",
            row.cpu_perc, row.mem_perc
        ));
    };
    let mut over = Vec::new();
    if cpu > f64::from(max_cpu) {
        over.push(format!("cpu {:.1}% over {}%", cpu, max_cpu));
    }
    if memory > f64::from(max_memory) {
        over.push(format!("memory {:.1}% over {}%", memory, max_memory));
    }
    if over.is_empty() {
        ProbeResult::pass(format!("cpu {:.1}%, memory {:.1}%", cpu, memory))
    } else {
        ProbeResult::fail(over.join(", "))
    }
}

/// Published host ports from a `docker ps` Ports column such as
/// `0.0.0.0:8080->80/tcp, :::8080->80/tcp, 5432/tcp`
fn parse_ps_ports(raw: &str) -> Vec<PublishedPort> {
    let mut ports: Vec<PublishedPort> = Vec::new();
    for entry in raw.split(',').map(str::trim) {
        let Some((host, container)) = entry.split_once("->") else {
            continue;
        };
        let protocol = container
            .rsplit_once('/')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or_default();
        let Some((_, host_ports)) = host.rsplit_once(':') else {
            continue;
        };
        let range = match host_ports.split_once('-') {
            Some((start, end)) => match (start.parse::<u16>(), end.parse::<u16>()) {
                (Ok(start), Ok(end)) if start <= end => (start..=end).collect(),
                _ => Vec::new(),
            },
            None => host_ports.parse::<u16>().map(|p| vec![p]).unwrap_or_default(),
        };
        for host_port in range {
            let port = PublishedPort {
                host_port,
                protocol,
            };
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    ports
}

/// Parse sizes such as `12.5MiB`, `1.2GB` or `512kB` into bytes
fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kib" => 1024.0,
        "kb" => 1000.0,
        "mib" => 1024.0 * 1024.0,
        "mb" => 1000.0 * 1000.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        "gb" => 1000.0 * 1000.0 * 1000.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

/// Ports held by listening sockets on this host, from procfs
fn listening_ports() -> Vec<(u16, Protocol)> {
    let tables = [
        ("/proc/net/tcp", Protocol::Tcp, "0A"),
        ("/proc/net/tcp6", Protocol::Tcp, "0A"),
        ("/proc/net/udp", Protocol::Udp, "07"),
        ("/proc/net/udp6", Protocol::Udp, "07"),
    ];

    let mut ports = Vec::new();
    for (path, protocol, listen_state) in tables {
        let Ok(table) = std::fs::read_to_string(path) else {
            continue;
        };
        for (port, _) in parse_proc_net(&table, listen_state) {
            if !ports.contains(&(port, protocol)) {
                ports.push((port, protocol));
            }
        }
    }
    ports
}

/// (local port, state) of every socket row in a `/proc/net/*` table
/// whose state equals `state`
fn parse_proc_net(table: &str, state: &str) -> Vec<(u16, String)> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let st = fields.nth(1)?;
            if st != state {
                return None;
            }
            let (_, port_hex) = local.rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            Some((port, st.to_string()))
        })
        .collect()
}

fn host_resources() -> Option<HostResources> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let (total, available) = parse_meminfo(&meminfo)?;
    Some(HostResources {
        total_memory: total,
        available_memory: available,
        cpus: num_cpus::get(),
    })
}

/// (MemTotal, MemAvailable) in bytes
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        let line = meminfo.lines().find(|l| l.starts_with(name))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    };
    Some((field("MemTotal:")?, field("MemAvailable:")?))
}
