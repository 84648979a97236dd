//! Post-deployment verification
//!
//! Every deployment gets a fixed checklist derived from its topology. Each
//! check is timed on its own and reported as Pass, Warn, Fail or Skipped. A
//! check is Skipped when the container it depends on never reached Running.
//! Resource baselines are advisory and only ever Warn.

use crate::runtime::{
    HealthStatus, LiveContainer, LiveState, ProbeKind, ProbeResult, ProbeTarget, RuntimeProber,
};
use crate::spec::{Protocol, ServiceDef, Spec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Log markers treated as fatal unless configured otherwise
pub const DEFAULT_FATAL_PATTERNS: &[&str] =
    &["panic", "fatal", "segmentation fault", "out of memory", "killed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Fail => write!(f, "FAIL"),
            CheckStatus::Skipped => write!(f, "SKIP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckCategory {
    Running,
    Health,
    Port,
    Volume,
    Environment,
    Network,
    Resources,
    Logs,
}

/// Result of one checklist entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub category: CheckCategory,
    pub service: String,
    pub status: CheckStatus,
    pub evidence: String,
    pub duration: Duration,
}

/// Overall verdict of a verification run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Pass,
    PassWithWarnings,
    PassWithSkips,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub started_at: DateTime<Utc>,
    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn outcome(&self) -> VerificationOutcome {
        if self.failed().next().is_some() {
            VerificationOutcome::Fail
        } else if self.skipped().next().is_some() {
            VerificationOutcome::PassWithSkips
        } else if self.warned().next().is_some() {
            VerificationOutcome::PassWithWarnings
        } else {
            VerificationOutcome::Pass
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }

    pub fn warned(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Warn)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Skipped)
    }

    pub fn get(&self, id: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.id == id)
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            writeln!(
                f,
                "{} {} ({:?}): {}",
                check.status, check.id, check.duration, check.evidence
            )?;
        }
        Ok(())
    }
}

/// A checklist entry before it runs
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCheck {
    pub id: String,
    pub category: CheckCategory,
    pub service: String,
    step: Step,
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Running,
    Health,
    Probe(ProbeKind),
    /// Failures are reported as warnings
    Advisory(ProbeKind),
    Edge { to: String, port: Option<u16> },
    Logs,
}

/// Builds and runs verification checklists
#[derive(Debug, Clone)]
pub struct VerificationSuite {
    project: String,
    probe_timeout: Duration,
    log_window_lines: usize,
    fatal_patterns: Vec<String>,
    max_cpu_percent: u32,
    max_memory_percent: u32,
}

impl VerificationSuite {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            probe_timeout: Duration::from_secs(10),
            log_window_lines: 200,
            fatal_patterns: DEFAULT_FATAL_PATTERNS.iter().map(|p| p.to_string()).collect(),
            max_cpu_percent: 50,
            max_memory_percent: 70,
        }
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn log_window(mut self, lines: usize) -> Self {
        self.log_window_lines = lines;
        self
    }

    pub fn fatal_patterns(mut self, patterns: Vec<String>) -> Self {
        self.fatal_patterns = patterns.into_iter().map(|p| p.to_lowercase()).collect();
        self
    }

    /// Usage ceilings for the resource baseline, in percent
    pub fn baseline(mut self, cpu_percent: u32, memory_percent: u32) -> Self {
        self.max_cpu_percent = cpu_percent;
        self.max_memory_percent = memory_percent;
        self
    }

    /// The fixed checklist for `spec`, in execution order
    pub fn checklist(&self, spec: &Spec) -> Vec<PlannedCheck> {
        let mut checks = Vec::new();
        for service in &spec.services {
            let svc = service.name.as_str();
            let plan = |id: String, category, step| PlannedCheck {
                id,
                category,
                service: svc.to_string(),
                step,
            };

            checks.push(plan(format!("running:{}", svc), CheckCategory::Running, Step::Running));
            if service.healthcheck.is_some() {
                checks.push(plan(format!("health:{}", svc), CheckCategory::Health, Step::Health));
            }

            let mut ports: Vec<(String, ProbeKind)> = Vec::new();
            for binding in service.ports.iter().filter_map(|p| p.binding()) {
                let Some(host_port) = binding.host_port else {
                    continue;
                };
                let id = format!("port:{}:{}/{}", svc, host_port, binding.protocol);
                if ports.iter().any(|(existing, _)| *existing == id) {
                    continue;
                }
                let kind = ProbeKind::PortReachable {
                    host_ip: binding.host_ip.clone(),
                    host_port,
                    protocol: binding.protocol,
                };
                ports.push((id, kind));
            }
            for (id, kind) in ports {
                checks.push(plan(id, CheckCategory::Port, Step::Probe(kind)));
            }

            let mut volumes: Vec<&str> = Vec::new();
            for mount in &service.volumes {
                if volumes.contains(&mount.target.as_str()) {
                    continue;
                }
                volumes.push(mount.target.as_str());
                let kind = ProbeKind::VolumeMount {
                    target: mount.target.clone(),
                    writable: !mount.read_only,
                };
                let id = format!("volume:{}:{}", svc, mount.target);
                checks.push(plan(id, CheckCategory::Volume, Step::Probe(kind)));
            }

            if !service.environment.is_empty() {
                let kind = ProbeKind::Environment {
                    keys: service.environment.keys().cloned().collect(),
                };
                let id = format!("env:{}", svc);
                checks.push(plan(id, CheckCategory::Environment, Step::Probe(kind)));
            }

            let mut edges: Vec<&str> = Vec::new();
            for dep in &service.depends_on {
                if !edges.contains(&dep.as_str()) {
                    edges.push(dep.as_str());
                }
            }
            for dep in edges {
                let port = spec.service(dep).and_then(first_tcp_port);
                let id = format!("network:{}->{}", svc, dep);
                let step = Step::Edge {
                    to: dep.to_string(),
                    port,
                };
                checks.push(plan(id, CheckCategory::Network, step));
            }

            let kind = ProbeKind::ResourceBaseline {
                max_cpu_percent: self.max_cpu_percent,
                max_memory_percent: self.max_memory_percent,
            };
            let id = format!("resources:{}", svc);
            checks.push(plan(id, CheckCategory::Resources, Step::Advisory(kind)));

            checks.push(plan(format!("logs:{}", svc), CheckCategory::Logs, Step::Logs));
        }
        checks
    }

    /// Services with a healthcheck whose running container still reports
    /// `starting`
    pub fn health_pending(&self, spec: &Spec, live: &LiveState) -> Vec<String> {
        spec.services
            .iter()
            .filter(|s| s.healthcheck.is_some())
            .filter(|s| {
                self.container(live, s)
                    .filter(|c| c.is_running())
                    .is_some_and(|c| c.health == Some(HealthStatus::Starting))
            })
            .map(|s| s.name.clone())
            .collect()
    }

    /// Run the checklist for `spec` against the observed `live` state
    pub async fn verify<P>(&self, spec: &Spec, live: &LiveState, prober: &P) -> VerificationReport
    where
        P: RuntimeProber + ?Sized,
    {
        let started_at = Utc::now();
        let mut checks = Vec::new();

        for planned in self.checklist(spec) {
            let started = Instant::now();
            let (status, evidence) = match spec.service(&planned.service) {
                Some(service) => self.run(&planned, service, spec, live, prober).await,
                None => (CheckStatus::Skipped, "service is not part of the spec".to_string()),
            };

            let duration = started.elapsed();
            match status {
                CheckStatus::Pass => tracing::debug!("{} passed: {}", planned.id, evidence),
                CheckStatus::Warn => tracing::warn!("{} over baseline: {}", planned.id, evidence),
                CheckStatus::Fail => tracing::warn!("{} failed: {}", planned.id, evidence),
                CheckStatus::Skipped => tracing::info!("{} skipped: {}", planned.id, evidence),
            }
            checks.push(CheckResult {
                id: planned.id,
                category: planned.category,
                service: planned.service,
                status,
                evidence,
                duration,
            });
        }

        VerificationReport { started_at, checks }
    }

    fn container<'a>(
        &self,
        live: &'a LiveState,
        service: &ServiceDef,
    ) -> Option<&'a LiveContainer> {
        live.service_container(&self.project, &service.name)
            .or_else(|| live.container(&service.effective_container_name(&self.project)))
    }

    async fn run<P>(
        &self,
        planned: &PlannedCheck,
        service: &ServiceDef,
        spec: &Spec,
        live: &LiveState,
        prober: &P,
    ) -> (CheckStatus, String)
    where
        P: RuntimeProber + ?Sized,
    {
        let container = self.container(live, service);
        let Some(running) = container.filter(|c| c.is_running()) else {
            return match (&planned.step, container) {
                (Step::Running, Some(c)) => {
                    (CheckStatus::Fail, format!("{} is {}", c.name, c.status))
                }
                (Step::Running, None) => (
                    CheckStatus::Fail,
                    format!("no container found for service {}", service.name),
                ),
                _ => (
                    CheckStatus::Skipped,
                    format!("service {} never reached running", service.name),
                ),
            };
        };
        let target = ProbeTarget {
            service: service.name.clone(),
            container: running.name.clone(),
        };

        match &planned.step {
            Step::Running => (CheckStatus::Pass, format!("{} is running", running.name)),
            Step::Health => match running.health {
                Some(HealthStatus::Healthy) => (CheckStatus::Pass, "healthy".to_string()),
                Some(HealthStatus::Unhealthy) => (CheckStatus::Fail, "unhealthy".to_string()),
                Some(HealthStatus::Starting) => {
                    (CheckStatus::Fail, "healthcheck still starting".to_string())
                }
                None => (CheckStatus::Fail, "no health status reported".to_string()),
            },
            Step::Probe(kind) => self.probe(prober, &target, kind).await,
            Step::Advisory(kind) => match self.probe(prober, &target, kind).await {
                (CheckStatus::Fail, evidence) => (CheckStatus::Warn, evidence),
                other => other,
            },
            Step::Edge { to, port } => {
                let reachable = spec
                    .service(to)
                    .and_then(|d| self.container(live, d))
                    .filter(|c| c.is_running());
                if reachable.is_none() {
                    return (
                        CheckStatus::Skipped,
                        format!("dependency {} never reached running", to),
                    );
                }
                let kind = ProbeKind::NetworkReachable {
                    to_service: to.clone(),
                    port: *port,
                };
                self.probe(prober, &target, &kind).await
            }
            Step::Logs => {
                let kind = ProbeKind::Logs {
                    window_lines: self.log_window_lines,
                };
                let fetched = self.timed_probe(prober, &target, &kind).await;
                let (status, evidence, lines) = match fetched {
                    Ok(result) if result.ok => (CheckStatus::Pass, result.evidence, result.lines),
                    Ok(result) => (CheckStatus::Fail, result.evidence, Vec::new()),
                    Err(evidence) => (CheckStatus::Fail, evidence, Vec::new()),
                };
                if status != CheckStatus::Pass {
                    return (status, evidence);
                }
                match self.first_fatal_line(&lines) {
                    Some(line) => (CheckStatus::Fail, format!("fatal log line: {}", line)),
                    None => (
                        CheckStatus::Pass,
                        format!(
                            "no fatal markers in the last {} line(s)",
                            self.log_window_lines
                        ),
                    ),
                }
            }
        }
    }

    async fn probe<P>(
        &self,
        prober: &P,
        target: &ProbeTarget,
        kind: &ProbeKind,
    ) -> (CheckStatus, String)
    where
        P: RuntimeProber + ?Sized,
    {
        match self.timed_probe(prober, target, kind).await {
            Ok(result) if result.ok => (CheckStatus::Pass, result.evidence),
            Ok(result) => (CheckStatus::Fail, result.evidence),
            Err(evidence) => (CheckStatus::Fail, evidence),
        }
    }

    async fn timed_probe<P>(
        &self,
        prober: &P,
        target: &ProbeTarget,
        kind: &ProbeKind,
    ) -> Result<ProbeResult, String>
    where
        P: RuntimeProber + ?Sized,
    {
        match tokio::time::timeout(self.probe_timeout, prober.probe(target, kind)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("probe timed out after {:?}", self.probe_timeout)),
        }
    }

    fn first_fatal_line<'a>(&self, lines: &'a [String]) -> Option<&'a str> {
        lines
            .iter()
            .find(|line| {
                let lower = line.to_lowercase();
                self.fatal_patterns.iter().any(|p| lower.contains(p.as_str()))
            })
            .map(String::as_str)
    }
}

/// The first TCP port a service listens on inside its container
fn first_tcp_port(service: &ServiceDef) -> Option<u16> {
    service
        .ports
        .iter()
        .filter_map(|p| p.binding())
        .find(|b| b.protocol == Protocol::Tcp)
        .map(|b| b.container_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use crate::runtime::{ContainerStatus, RuntimeApplier};
    use crate::spec::Healthcheck;

    fn topology() -> Spec {
        let mut db = ServiceDef::new("db", "postgres:16")
            .port("5432")
            .mount("pgdata:/var/lib/postgresql/data");
        db.healthcheck = Some(Healthcheck {
            test: vec!["CMD".to_string(), "pg_isready".to_string()],
            ..Default::default()
        });
        Spec::new()
            .with_service(
                ServiceDef::new("web", "nginx:1.25")
                    .port("8080:80")
                    .port("8443:443")
                    .mount("./site:/usr/share/nginx/html:ro")
                    .env("UPSTREAM", "db:5432")
                    .depends_on("db"),
            )
            .with_service(db)
            .with_volume(crate::spec::VolumeDef::new("pgdata"))
    }

    async fn deployed(spec: &Spec) -> MockRuntime {
        let runtime = MockRuntime::new("shop");
        runtime.apply(spec).await.unwrap();
        runtime
    }

    #[test]
    fn test_checklist_shape_and_order() {
        let ids: Vec<String> = VerificationSuite::new("shop")
            .checklist(&topology())
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                "running:web",
                "port:web:8080/tcp",
                "port:web:8443/tcp",
                "volume:web:/usr/share/nginx/html",
                "env:web",
                "network:web->db",
                "resources:web",
                "logs:web",
                "running:db",
                "health:db",
                "volume:db:/var/lib/postgresql/data",
                "resources:db",
                "logs:db",
            ]
        );
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let spec = topology();
        let runtime = deployed(&spec).await;
        let report = VerificationSuite::new("shop")
            .verify(&spec, &runtime.live(), &runtime)
            .await;

        assert_eq!(report.checks.len(), 13);
        assert_eq!(report.outcome(), VerificationOutcome::Pass);
    }

    #[tokio::test]
    async fn test_unreachable_dependency_fails_suite() {
        let spec = topology();
        let runtime = deployed(&spec).await;
        runtime.script_probe("network:web->db", ProbeResult::fail("getent: db not found"));

        let report = VerificationSuite::new("shop")
            .verify(&spec, &runtime.live(), &runtime)
            .await;
        assert_eq!(report.get("network:web->db").unwrap().status, CheckStatus::Fail);
        assert_eq!(report.failed().count(), 1);
        assert_eq!(report.outcome(), VerificationOutcome::Fail);
    }

    #[tokio::test]
    async fn test_stopped_service_skips_dependent_checks() {
        let spec = topology();
        let runtime = deployed(&spec).await;
        let mut live = runtime.live();
        for container in &mut live.containers {
            if container.service.as_deref() == Some("db") {
                container.status = ContainerStatus::Exited;
            }
        }

        let report = VerificationSuite::new("shop").verify(&spec, &live, &runtime).await;
        assert_eq!(report.checks.len(), 13);
        assert_eq!(report.get("running:db").unwrap().status, CheckStatus::Fail);
        assert_eq!(report.get("resources:db").unwrap().status, CheckStatus::Skipped);
        assert_eq!(report.get("health:db").unwrap().status, CheckStatus::Skipped);
        assert_eq!(report.get("logs:db").unwrap().status, CheckStatus::Skipped);
        assert_eq!(report.get("network:web->db").unwrap().status, CheckStatus::Skipped);
        assert_eq!(report.get("logs:web").unwrap().status, CheckStatus::Pass);
    }

    #[test]
    fn test_outcome() {
        let check = |id: &str, status| CheckResult {
            id: id.to_string(),
            category: CheckCategory::Port,
            service: "web".to_string(),
            status,
            evidence: String::new(),
            duration: Duration::ZERO,
        };
        let mut report = VerificationReport {
            started_at: Utc::now(),
            checks: vec![check("port:web:80/tcp", CheckStatus::Pass)],
        };
        assert_eq!(report.outcome(), VerificationOutcome::Pass);

        report.checks.push(check("resources:web", CheckStatus::Warn));
        assert_eq!(report.outcome(), VerificationOutcome::PassWithWarnings);

        report.checks.push(check("port:web:81/tcp", CheckStatus::Skipped));
        assert_eq!(report.outcome(), VerificationOutcome::PassWithSkips);

        report.checks.push(check("port:web:82/tcp", CheckStatus::Fail));
        assert_eq!(report.outcome(), VerificationOutcome::Fail);
    }

    #[test]
    fn test_repeated_mount_target_is_checked_once() {
        let spec = Spec::new().with_service(
            ServiceDef::new("web", "nginx:1.25")
                .mount("./site:/srv")
                .mount("site-data:/srv"),
        );
        let ids: Vec<String> = VerificationSuite::new("shop")
            .checklist(&spec)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids.iter().filter(|id| *id == "volume:web:/srv").count(), 1);
    }

    #[test]
    fn test_dependency_edge_carries_first_tcp_port() {
        let spec = Spec::new()
            .with_service(ServiceDef::new("web", "nginx:1.25").depends_on("dns").depends_on("db"))
            .with_service(ServiceDef::new("dns", "coredns:1.11").port("53/udp"))
            .with_service(ServiceDef::new("db", "postgres:16").port("5432").port("9187"));

        let edges: Vec<Step> = VerificationSuite::new("shop")
            .checklist(&spec)
            .into_iter()
            .filter(|c| c.category == CheckCategory::Network)
            .map(|c| c.step)
            .collect();
        assert_eq!(
            edges,
            vec![
                Step::Edge {
                    to: "dns".to_string(),
                    port: None
                },
                Step::Edge {
                    to: "db".to_string(),
                    port: Some(5432)
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_environment_fails() {
        let spec = topology();
        let runtime = deployed(&spec).await;
        runtime.script_probe("env:web", ProbeResult::fail("not set: UPSTREAM"));

        let report = VerificationSuite::new("shop")
            .verify(&spec, &runtime.live(), &runtime)
            .await;
        let env = report.get("env:web").unwrap();
        assert_eq!(env.category, CheckCategory::Environment);
        assert_eq!(env.status, CheckStatus::Fail);
        assert_eq!(report.outcome(), VerificationOutcome::Fail);
    }

    #[tokio::test]
    async fn test_resource_baseline_only_warns() {
        let spec = topology();
        let runtime = deployed(&spec).await;
        runtime.script_probe("resources:db", ProbeResult::fail("memory 91.0% over 70%"));

        let report = VerificationSuite::new("shop")
            .baseline(50, 70)
            .verify(&spec, &runtime.live(), &runtime)
            .await;
        let resources = report.get("resources:db").unwrap();
        assert_eq!(resources.status, CheckStatus::Warn);
        assert_eq!(resources.evidence, "memory 91.0% over 70%");
        assert_eq!(report.failed().count(), 0);
        assert_eq!(report.outcome(), VerificationOutcome::PassWithWarnings);
    }

    #[tokio::test]
    async fn test_health_pending_lists_starting_services() {
        let spec = topology();
        let runtime = deployed(&spec).await;
        let suite = VerificationSuite::new("shop");
        assert!(suite.health_pending(&spec, &runtime.live()).is_empty());

        let mut live = runtime.live();
        for container in &mut live.containers {
            container.health = container.health.map(|_| HealthStatus::Starting);
        }
        assert_eq!(suite.health_pending(&spec, &live), vec!["db".to_string()]);
    }

    #[tokio::test]
    async fn test_fatal_log_lines_fail() {
        let spec = Spec::new().with_service(ServiceDef::new("api", "ghcr.io/acme/api:2"));
        let runtime = deployed(&spec).await;
        runtime.script_probe(
            "logs:api",
            ProbeResult::pass("read 2 lines").with_lines(vec![
                "listening on :3000".to_string(),
                "thread 'main' PANICKED at src/main.rs:10".to_string(),
            ]),
        );

        let report = VerificationSuite::new("shop")
            .verify(&spec, &runtime.live(), &runtime)
            .await;
        let logs = report.get("logs:api").unwrap();
        assert_eq!(logs.status, CheckStatus::Fail);
        assert!(logs.evidence.contains("PANICKED"));

        let relaxed = VerificationSuite::new("shop").fatal_patterns(vec!["oom".to_string()]);
        let report = relaxed.verify(&spec, &runtime.live(), &runtime).await;
        assert_eq!(report.outcome(), VerificationOutcome::Pass);
    }

    #[tokio::test]
    async fn test_check_timeout_is_a_failure() {
        let spec = Spec::new().with_service(ServiceDef::new("web", "nginx:1.25").port("8080:80"));
        let runtime = deployed(&spec).await;
        runtime.slow_probe("port:web:8080/tcp", Duration::from_secs(5));

        let report = VerificationSuite::new("shop")
            .probe_timeout(Duration::from_millis(20))
            .verify(&spec, &runtime.live(), &runtime)
            .await;
        let port = report.get("port:web:8080/tcp").unwrap();
        assert_eq!(port.status, CheckStatus::Fail);
        assert!(port.evidence.starts_with("probe timed out after"));
    }

    #[tokio::test]
    async fn test_unhealthy_container_fails_health() {
        let spec = topology();
        let runtime = deployed(&spec).await;
        let mut live = runtime.live();
        for container in &mut live.containers {
            if container.service.as_deref() == Some("db") {
                container.health = Some(HealthStatus::Unhealthy);
            }
        }
        let report = VerificationSuite::new("shop").verify(&spec, &live, &runtime).await;
        assert_eq!(report.get("health:db").unwrap().status, CheckStatus::Fail);
    }
}
