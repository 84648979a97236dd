//! Production-shaped compose generation
//!
//! Turns a short list of service requests into a full spec: per-image
//! healthchecks and persistence volumes, restart policy, resource limits,
//! a shared bridge network, traceability labels and role-based startup
//! ordering.

use crate::error::{KeelError, Result};
use crate::spec::{
    parse_memory, Healthcheck, MountSource, NetworkDef, PortSpec, ResourceLimits, RestartPolicy,
    ServiceDef, Spec, VolumeDef, VolumeMount,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Network every generated service joins
pub const APP_NETWORK: &str = "app_network";

const DEFAULT_MEMORY_LIMIT: &str = "512M";
const DEFAULT_CPU_LIMIT: f64 = 0.5;

/// One requested service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub name: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    /// Explicit dependencies; replaces the role-based ones when present
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

fn default_image() -> String {
    "alpine:latest".to_string()
}

/// Startup role inferred from the image name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Database,
    Cache,
    Queue,
    Backend,
    Proxy,
    Unknown,
}

impl ServiceRole {
    /// Startup stage; lower stages start first
    pub fn stage(self) -> u8 {
        match self {
            ServiceRole::Database | ServiceRole::Cache | ServiceRole::Queue => 1,
            ServiceRole::Backend | ServiceRole::Unknown => 2,
            ServiceRole::Proxy => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRole::Database => "database",
            ServiceRole::Cache => "cache",
            ServiceRole::Queue => "queue",
            ServiceRole::Backend => "backend",
            ServiceRole::Proxy => "proxy",
            ServiceRole::Unknown => "unknown",
        }
    }
}

/// Defaults for a well-known image family
struct ImageProfile {
    family: &'static str,
    role: ServiceRole,
    test: &'static [&'static str],
    interval: &'static str,
    timeout: &'static str,
    retries: u32,
    start_period: &'static str,
    /// (volume suffix, mount target)
    volumes: &'static [(&'static str, &'static str)],
}

const PROFILES: &[ImageProfile] = &[
    ImageProfile {
        family: "nginx",
        role: ServiceRole::Proxy,
        test: &["CMD", "curl", "-f", "http://localhost/"],
        interval: "15s",
        timeout: "5s",
        retries: 3,
        start_period: "10s",
        volumes: &[
            ("nginx_config", "/etc/nginx/conf.d"),
            ("nginx_html", "/usr/share/nginx/html"),
        ],
    },
    ImageProfile {
        family: "redis",
        role: ServiceRole::Cache,
        test: &["CMD", "redis-cli", "ping"],
        interval: "15s",
        timeout: "5s",
        retries: 3,
        start_period: "10s",
        volumes: &[("redis_data", "/data")],
    },
    ImageProfile {
        family: "postgres",
        role: ServiceRole::Database,
        test: &["CMD-SHELL", "pg_isready -U ${POSTGRES_USER:-postgres}"],
        interval: "15s",
        timeout: "5s",
        retries: 5,
        start_period: "30s",
        volumes: &[("postgres_data", "/var/lib/postgresql/data")],
    },
    ImageProfile {
        family: "mysql",
        role: ServiceRole::Database,
        test: &["CMD", "mysqladmin", "ping", "-h", "localhost"],
        interval: "15s",
        timeout: "5s",
        retries: 5,
        start_period: "30s",
        volumes: &[("mysql_data", "/var/lib/mysql")],
    },
    ImageProfile {
        family: "mariadb",
        role: ServiceRole::Database,
        test: &["CMD", "healthcheck.sh", "--connect", "--innodb_initialized"],
        interval: "15s",
        timeout: "5s",
        retries: 5,
        start_period: "30s",
        volumes: &[("mariadb_data", "/var/lib/mysql")],
    },
    ImageProfile {
        family: "mongo",
        role: ServiceRole::Database,
        test: &["CMD", "mongosh", "--eval", "db.adminCommand('ping')"],
        interval: "15s",
        timeout: "5s",
        retries: 5,
        start_period: "30s",
        volumes: &[("mongo_data", "/data/db")],
    },
    ImageProfile {
        family: "elasticsearch",
        role: ServiceRole::Database,
        test: &["CMD-SHELL", "curl -f http://localhost:9200/_cluster/health || exit 1"],
        interval: "30s",
        timeout: "10s",
        retries: 5,
        start_period: "60s",
        volumes: &[("es_data", "/usr/share/elasticsearch/data")],
    },
    ImageProfile {
        family: "rabbitmq",
        role: ServiceRole::Queue,
        test: &["CMD", "rabbitmq-diagnostics", "-q", "ping"],
        interval: "30s",
        timeout: "10s",
        retries: 3,
        start_period: "30s",
        volumes: &[("rabbitmq_data", "/var/lib/rabbitmq")],
    },
];

const BACKEND_PATTERNS: &[&str] = &[
    "python", "node", "golang", "java", "ruby", "php", "flask", "django", "express", "fastapi",
    "spring", "api", "backend", "app", "server", "web",
];

/// Repository name without registry, namespace or tag, lowercased
fn image_basename(image: &str) -> String {
    let repository = image.rsplit('/').next().unwrap_or(image);
    repository
        .split([':', '@'])
        .next()
        .unwrap_or(repository)
        .to_ascii_lowercase()
}

fn profile_for(image: &str) -> Option<&'static ImageProfile> {
    let base = image_basename(image);
    PROFILES.iter().find(|p| base.contains(p.family))
}

/// Classify the startup role of an image
pub fn detect_role(image: &str) -> ServiceRole {
    if let Some(profile) = profile_for(image) {
        return profile.role;
    }
    let base = image_basename(image);
    if BACKEND_PATTERNS.iter().any(|p| base.contains(p)) {
        ServiceRole::Backend
    } else {
        ServiceRole::Unknown
    }
}

fn healthcheck_for(profile: Option<&ImageProfile>) -> Healthcheck {
    let owned = |s: &str| Some(s.to_string());
    match profile {
        Some(p) => Healthcheck {
            test: p.test.iter().map(|s| s.to_string()).collect(),
            interval: owned(p.interval),
            timeout: owned(p.timeout),
            retries: Some(p.retries),
            start_period: owned(p.start_period),
        },
        None => Healthcheck {
            test: vec!["CMD-SHELL".to_string(), "exit 0".to_string()],
            interval: owned("30s"),
            timeout: owned("10s"),
            retries: Some(3),
            start_period: owned("10s"),
        },
    }
}

/// Stage 2 depends on every stage 1 service; stage 3 on stage 2, or on
/// stage 1 when stage 2 is empty.
fn role_dependencies(roles: &[(String, ServiceRole)]) -> BTreeMap<String, Vec<String>> {
    let in_stage = |stage: u8| -> Vec<String> {
        roles
            .iter()
            .filter(|(_, role)| role.stage() == stage)
            .map(|(name, _)| name.clone())
            .collect()
    };
    let (first, second, third) = (in_stage(1), in_stage(2), in_stage(3));

    let mut deps = BTreeMap::new();
    if !first.is_empty() {
        for name in &second {
            deps.insert(name.clone(), first.clone());
        }
    }
    let upstream = if second.is_empty() { &first } else { &second };
    if !upstream.is_empty() {
        for name in &third {
            deps.insert(name.clone(), upstream.clone());
        }
    }
    deps
}

/// Compose generator
pub struct Generator {
    created_at: DateTime<Utc>,
    environment: String,
}

impl Generator {
    pub fn new() -> Self {
        Self {
            created_at: Utc::now(),
            environment: "development".to_string(),
        }
    }

    /// Fix the creation timestamp stamped into labels
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Set the `environment` label value
    pub fn environment(mut self, environment: &str) -> Self {
        self.environment = environment.to_string();
        self
    }

    /// Parse a JSON array of service requests and generate a spec
    pub fn generate_json(&self, raw: &str) -> Result<Spec> {
        let requests: Vec<ServiceRequest> = serde_json::from_str(raw)
            .map_err(|e| KeelError::Parse(format!("invalid service requests: {}", e)))?;
        self.generate(&requests)
    }

    /// Generate a spec from service requests
    pub fn generate(&self, requests: &[ServiceRequest]) -> Result<Spec> {
        let roles: Vec<(String, ServiceRole)> = requests
            .iter()
            .map(|r| (r.name.clone(), detect_role(&r.image)))
            .collect();
        let auto_deps = role_dependencies(&roles);
        if !auto_deps.is_empty() {
            tracing::info!("Auto-detected dependencies: {:?}", auto_deps);
        }

        let mut spec = Spec::new().with_network(NetworkDef::new(APP_NETWORK).driver("bridge"));
        let mut declared_volumes: HashSet<String> = HashSet::new();
        let created_at = self.created_at.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        for (request, (_, role)) in requests.iter().zip(&roles) {
            let profile = profile_for(&request.image);

            let memory_raw = request.memory_limit.as_deref().unwrap_or(DEFAULT_MEMORY_LIMIT);
            let memory = parse_memory(memory_raw).map_err(|e| KeelError::Schema {
                entity: format!("service '{}'", request.name),
                message: e,
            })?;

            let mut service = ServiceDef::new(&request.name, &request.image)
                .restart(RestartPolicy::UnlessStopped)
                .network(APP_NETWORK)
                .label("managed-by", "keel")
                .label("created-at", &created_at)
                .label("environment", &self.environment)
                .label("stage", &format!("{}-{}", role.stage(), role.as_str()));
            service.healthcheck = Some(healthcheck_for(profile));
            service.resources = ResourceLimits {
                memory_bytes: Some(memory),
                cpus: Some(request.cpu_limit.unwrap_or(DEFAULT_CPU_LIMIT)),
                pids: None,
            };
            service.environment = request.environment.clone();
            if let Some(ref command) = request.command {
                service.command = command.split_whitespace().map(str::to_string).collect();
            }
            for port in &request.ports {
                service.ports.extend(PortSpec::parse(port));
            }

            service.depends_on = if !request.depends_on.is_empty() {
                request.depends_on.clone()
            } else {
                auto_deps.get(&request.name).cloned().unwrap_or_default()
            };

            let mut mounted: HashSet<String> = HashSet::new();
            for raw in &request.volumes {
                let mount: VolumeMount = raw.parse().map_err(|e| KeelError::Schema {
                    entity: format!("service '{}'", request.name),
                    message: e,
                })?;
                if let MountSource::Named(ref name) = mount.source {
                    declare_volume(&mut spec, &mut declared_volumes, name);
                }
                mounted.insert(mount.target.clone());
                service.volumes.push(mount);
            }

            for (suffix, target) in profile.map(|p| p.volumes).unwrap_or_default() {
                if mounted.contains(*target) {
                    continue;
                }
                let name = if suffix.starts_with(request.name.as_str()) {
                    suffix.to_string()
                } else {
                    format!("{}_{}", request.name, suffix)
                };
                tracing::info!(
                    "Auto-added volume '{}' for {} data persistence",
                    name,
                    request.name
                );
                declare_volume(&mut spec, &mut declared_volumes, &name);
                service.volumes.push(VolumeMount {
                    source: MountSource::Named(name),
                    target: target.to_string(),
                    read_only: false,
                });
            }

            spec.services.push(service);
        }

        Ok(spec)
    }
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}

fn declare_volume(spec: &mut Spec, declared: &mut HashSet<String>, name: &str) {
    if declared.insert(name.to_string()) {
        let mut volume = VolumeDef::new(name);
        volume.driver = Some("local".to_string());
        spec.volumes.push(volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{ValidationMode, Validator};

    fn request(name: &str, image: &str) -> ServiceRequest {
        ServiceRequest {
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_detect_role() {
        assert_eq!(detect_role("postgres:15"), ServiceRole::Database);
        assert_eq!(detect_role("docker.io/library/redis"), ServiceRole::Cache);
        assert_eq!(detect_role("nginx:alpine"), ServiceRole::Proxy);
        assert_eq!(detect_role("ghcr.io/acme/api-server:1"), ServiceRole::Backend);
        assert_eq!(detect_role("busybox"), ServiceRole::Unknown);
    }

    #[test]
    fn test_role_based_dependencies() {
        let spec = Generator::new()
            .generate(&[
                request("proxy", "nginx:1.25"),
                request("api", "node:20"),
                request("db", "postgres:15"),
                request("cache", "redis:7"),
            ])
            .unwrap();

        assert_eq!(spec.service("api").unwrap().depends_on, vec!["db", "cache"]);
        assert_eq!(spec.service("proxy").unwrap().depends_on, vec!["api"]);
        assert!(spec.service("db").unwrap().depends_on.is_empty());
        assert_eq!(spec.service("db").unwrap().labels["stage"], "1-database");
    }

    #[test]
    fn test_proxy_falls_back_to_stage_one() {
        let spec = Generator::new()
            .generate(&[request("db", "mysql:8"), request("edge", "nginx")])
            .unwrap();
        assert_eq!(spec.service("edge").unwrap().depends_on, vec!["db"]);
    }

    #[test]
    fn test_explicit_dependencies_win() {
        let mut api = request("api", "python:3.12");
        api.depends_on = vec!["cache".to_string()];
        let spec = Generator::new()
            .generate(&[request("db", "postgres"), request("cache", "redis"), api])
            .unwrap();
        assert_eq!(spec.service("api").unwrap().depends_on, vec!["cache"]);
    }

    #[test]
    fn test_persistence_volumes() {
        let mut db = request("db", "postgres:15");
        db.volumes = vec!["custom:/var/lib/postgresql/data".to_string()];
        let spec = Generator::new()
            .generate(&[db, request("cache", "redis:7")])
            .unwrap();

        let db = spec.service("db").unwrap();
        assert_eq!(db.volumes.len(), 1);
        assert_eq!(db.volumes[0].source, MountSource::Named("custom".to_string()));

        let cache = spec.service("cache").unwrap();
        assert_eq!(
            cache.volumes[0].source,
            MountSource::Named("cache_redis_data".to_string())
        );
        assert!(spec.volume("custom").is_some());
        assert!(spec.volume("cache_redis_data").is_some());
    }

    #[test]
    fn test_generated_spec_validates_cleanly() {
        let spec = Generator::new()
            .generate_json(
                r#"[{"name": "web", "image": "nginx:1.25", "ports": ["8080:80"]},
                    {"name": "db", "image": "postgres:15",
                     "environment": {"POSTGRES_PASSWORD": "${DB_PASSWORD}"}}]"#,
            )
            .unwrap();

        let web = spec.service("web").unwrap();
        assert_eq!(web.restart, Some(RestartPolicy::UnlessStopped));
        assert_eq!(web.resources.memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(web.networks, vec![APP_NETWORK]);

        let report = Validator::default().validate(&spec, ValidationMode::Deploy);
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        assert!(matches!(
            Generator::new().generate_json("{not json"),
            Err(KeelError::Parse(_))
        ));
    }
}
