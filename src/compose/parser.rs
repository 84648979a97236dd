//! Docker Compose file parser

use super::document::{
    ComposeDocument, KeyValues, NameList, RawHealthcheck, RawMount, RawResource, RawService,
    Scalar, StringOrList,
};
use crate::error::{KeelError, Result};
use crate::spec::{
    classify_source, classify_source_for, normalize_image, parse_memory, Healthcheck,
    MountSource, NetworkDef, PortSpec, ResourceLimits, RestartPolicy, ServiceDef, Spec,
    VolumeDef, VolumeMount,
};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

const INTERPOLATION_PATTERN: &str =
    r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)";

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse compose file from path, interpolating variables from `env`
    pub fn parse_file(path: &Path, env: &HashMap<String, String>) -> Result<Spec> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KeelError::Parse(format!("Failed to read {}: {}", path.display(), e)))?;

        let content = Self::interpolate(&content, env)?;
        Self::parse_str(&content)
    }

    /// Parse compose document from string
    pub fn parse_str(content: &str) -> Result<Spec> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| KeelError::Parse(format!("Failed to parse YAML: {}", e)))?;

        if value.is_null() {
            return Ok(Spec::default());
        }
        if !value.is_mapping() {
            return Err(KeelError::Parse(
                "top-level compose document must be a mapping".to_string(),
            ));
        }

        let config: ComposeDocument = serde_yaml::from_value(value).map_err(|e| KeelError::Schema {
            entity: "document".to_string(),
            message: e.to_string(),
        })?;

        Self::lower(config)
    }

    /// Substitute `${VAR}`, `${VAR:-default}`, `${VAR-default}` and `$VAR`.
    ///
    /// `$$` escapes a literal dollar sign. Unset variables without a default
    /// become empty strings, as compose does.
    pub fn interpolate(content: &str, env: &HashMap<String, String>) -> Result<String> {
        let re = Regex::new(INTERPOLATION_PATTERN)
            .map_err(|e| KeelError::Parse(format!("interpolation pattern: {}", e)))?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            if &caps[0] == "$$" {
                return "$".to_string();
            }

            let name = caps
                .get(1)
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let value = env.get(name);

            match (caps.get(2).map(|m| m.as_str()), caps.get(3)) {
                (Some(":-"), Some(default)) => value
                    .filter(|v| !v.is_empty())
                    .cloned()
                    .unwrap_or_else(|| default.as_str().to_string()),
                (Some("-"), Some(default)) => value
                    .cloned()
                    .unwrap_or_else(|| default.as_str().to_string()),
                _ => value.cloned().unwrap_or_else(|| {
                    tracing::warn!("Variable {} is not set, substituting an empty string", name);
                    String::new()
                }),
            }
        });

        Ok(result.into_owned())
    }

    fn lower(config: ComposeDocument) -> Result<Spec> {
        let mut spec = Spec {
            name: config.name,
            ..Default::default()
        };

        for (key, value) in config.services {
            let name = mapping_key(&key, "service")?;
            let service: RawService = from_entry(value, &format!("service '{}'", name))?;
            spec.services.push(lower_service(&name, service)?);
        }

        for (key, value) in config.networks {
            let name = mapping_key(&key, "network")?;
            let network: RawResource = from_entry(value, &format!("network '{}'", name))?;
            spec.networks.push(NetworkDef {
                name,
                driver: network.driver,
                external: network.external.map(|e| e.is_external()).unwrap_or(false),
                internal: network.internal.unwrap_or(false),
                labels: network.labels.map(KeyValues::into_map).unwrap_or_default(),
            });
        }

        for (key, value) in config.volumes {
            let name = mapping_key(&key, "volume")?;
            let volume: RawResource = from_entry(value, &format!("volume '{}'", name))?;
            spec.volumes.push(VolumeDef {
                name,
                driver: volume.driver,
                external: volume.external.map(|e| e.is_external()).unwrap_or(false),
                labels: volume.labels.map(KeyValues::into_map).unwrap_or_default(),
            });
        }

        Ok(spec)
    }
}

fn mapping_key(key: &serde_yaml::Value, kind: &str) -> Result<String> {
    key.as_str().map(str::to_string).ok_or_else(|| KeelError::Schema {
        entity: kind.to_string(),
        message: format!("{} names must be strings, found {:?}", kind, key),
    })
}

fn from_entry<T>(value: serde_yaml::Value, entity: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(value).map_err(|e| KeelError::Schema {
        entity: entity.to_string(),
        message: e.to_string(),
    })
}

fn schema_error(service: &str, message: impl Into<String>) -> KeelError {
    KeelError::Schema {
        entity: format!("service '{}'", service),
        message: message.into(),
    }
}

fn lower_service(name: &str, mut service: RawService) -> Result<ServiceDef> {
    if service.build.is_some() && service.image.is_none() {
        tracing::warn!("Service {} declares a build but no image; builds are not performed", name);
    }

    let command = match service.command.take() {
        Some(StringOrList::Single(s)) => shlex::split(&s)
            .ok_or_else(|| schema_error(name, format!("unbalanced quoting in command '{}'", s)))?,
        Some(StringOrList::List(args)) => args,
        None => Vec::new(),
    };

    let environment = service
        .environment
        .take()
        .map(KeyValues::into_map)
        .unwrap_or_default();

    let mut ports = Vec::new();
    for port in service.ports.take().unwrap_or_default() {
        ports.extend(PortSpec::parse(&port.short_syntax()));
    }

    let mut volumes = Vec::new();
    for mount in service.volumes.take().unwrap_or_default() {
        let mount = match mount {
            RawMount::Short(raw) => raw
                .parse::<VolumeMount>()
                .map_err(|e| schema_error(name, e))?,
            RawMount::Long(long) => {
                let source = match long.mount_type.as_deref() {
                    Some("tmpfs") => MountSource::Anonymous,
                    Some(kind) => classify_source_for(kind, long.source.as_deref()),
                    None => classify_source(long.source.as_deref()),
                };
                VolumeMount {
                    source,
                    target: long.target,
                    read_only: long.read_only.unwrap_or(false),
                }
            }
        };
        volumes.push(mount);
    }

    let networks = names(name, "network", service.networks.take())?;
    let depends_on = names(name, "service", service.depends_on.take())?;

    let limits = service.limits();
    let resources = ResourceLimits {
        memory_bytes: match limits.memory {
            Some(Scalar::Int(bytes)) => Some(bytes),
            Some(other) => {
                Some(parse_memory(&other.to_string()).map_err(|e| schema_error(name, e))?)
            }
            None => None,
        },
        cpus: match limits.cpus {
            Some(value) => Some(
                value
                    .to_string()
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| schema_error(name, format!("invalid cpus value '{}'", value)))?,
            ),
            None => None,
        },
        pids: limits.pids,
    };

    let restart = match service.restart {
        Some(raw) => Some(raw.parse::<RestartPolicy>().map_err(|e| schema_error(name, e))?),
        None => None,
    };

    Ok(ServiceDef {
        name: name.to_string(),
        image: service.image.map(|i| normalize_image(&i)).unwrap_or_default(),
        command,
        ports,
        volumes,
        environment,
        labels: service.labels.map(KeyValues::into_map).unwrap_or_default(),
        depends_on,
        networks,
        restart,
        resources,
        healthcheck: service.healthcheck.and_then(lower_healthcheck),
        container_name: service.container_name,
    })
}

fn names(service: &str, kind: &str, list: Option<NameList>) -> Result<Vec<String>> {
    match list {
        Some(list) => list.into_names().map_err(|key| {
            schema_error(service, format!("{} names must be strings, found {:?}", kind, key))
        }),
        None => Ok(Vec::new()),
    }
}

fn lower_healthcheck(config: RawHealthcheck) -> Option<Healthcheck> {
    if config.disable == Some(true) {
        return None;
    }

    let test = match config.test? {
        StringOrList::Single(cmd) => vec!["CMD-SHELL".to_string(), cmd],
        StringOrList::List(args) => args,
    };
    if test.first().map(String::as_str) == Some("NONE") {
        return None;
    }

    Some(Healthcheck {
        test,
        interval: config.interval,
        timeout: config.timeout,
        retries: config.retries,
        start_period: config.start_period,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{PortBinding, Protocol};

    #[test]
    fn test_find_compose_file_prefers_compose_yaml() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ComposeParser::find_compose_file(dir.path()).is_none());

        std::fs::write(dir.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        assert_eq!(
            ComposeParser::find_compose_file(dir.path()),
            Some(dir.path().join("docker-compose.yml"))
        );

        std::fs::write(dir.path().join("compose.yaml"), "services: {}\n").unwrap();
        let found = ComposeParser::find_compose_file(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("compose.yaml"));
        let spec = ComposeParser::parse_file(&found, &HashMap::new()).unwrap();
        assert!(spec.services.is_empty());
    }

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
version: "3.8"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
    depends_on:
      - db
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
      POSTGRES_PORT: 5432
    volumes:
      - pgdata:/var/lib/postgresql/data
volumes:
  pgdata:
"#;

        let spec = ComposeParser::parse_str(yaml).unwrap();
        assert_eq!(spec.services.len(), 2);
        assert_eq!(spec.services[0].name, "web");
        assert_eq!(spec.services[1].name, "db");
        assert_eq!(spec.services[1].environment["POSTGRES_PORT"], "5432");
        assert_eq!(spec.volumes[0].name, "pgdata");
        assert!(spec.validate_references().is_ok());
    }

    #[test]
    fn test_long_port_syntax_normalizes() {
        let yaml = r#"
services:
  web:
    image: nginx
    ports:
      - target: 80
        published: 8080
      - target: 53
        published: "5353"
        protocol: udp
      - 9000
"#;

        let spec = ComposeParser::parse_str(yaml).unwrap();
        let ports = &spec.services[0].ports;
        assert_eq!(ports[0], PortSpec::Bound(PortBinding::new(8080, 80)));
        assert_eq!(ports[1].binding().map(|b| b.protocol), Some(Protocol::Udp));
        assert_eq!(ports[2].binding().and_then(|b| b.host_port), None);
    }

    #[test]
    fn test_missing_image_is_left_to_validator() {
        let yaml = r#"
services:
  web:
    ports:
      - "80:80"
"#;

        let spec = ComposeParser::parse_str(yaml).unwrap();
        assert!(spec.services[0].image.is_empty());
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        assert!(matches!(
            ComposeParser::parse_str("services: [unclosed"),
            Err(KeelError::Parse(_))
        ));
        assert!(matches!(
            ComposeParser::parse_str("- just\n- a list\n"),
            Err(KeelError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_restart_is_schema_error() {
        let yaml = "services:\n  web:\n    image: nginx\n    restart: sometimes\n";
        assert!(matches!(
            ComposeParser::parse_str(yaml),
            Err(KeelError::Schema { .. })
        ));
    }

    #[test]
    fn test_resource_limits() {
        let yaml = r#"
services:
  api:
    image: app:1.0
    deploy:
      resources:
        limits:
          memory: 512M
          cpus: "0.5"
  worker:
    image: app:1.0
    mem_limit: 1g
    cpus: 2
"#;

        let spec = ComposeParser::parse_str(yaml).unwrap();
        assert_eq!(spec.services[0].resources.memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(spec.services[0].resources.cpus, Some(0.5));
        assert_eq!(spec.services[1].resources.memory_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(spec.services[1].resources.cpus, Some(2.0));
    }

    #[test]
    fn test_interpolate() {
        let mut env = HashMap::new();
        env.insert("TAG".to_string(), "1.0.0".to_string());
        env.insert("EMPTY".to_string(), String::new());

        let out = ComposeParser::interpolate("nginx:${TAG}", &env).unwrap();
        assert_eq!(out, "nginx:1.0.0");

        let out = ComposeParser::interpolate("${EMPTY:-fallback} ${EMPTY-kept}", &env).unwrap();
        assert_eq!(out, "fallback ");

        let out = ComposeParser::interpolate("$TAG $$HOME ${MISSING}", &env).unwrap();
        assert_eq!(out, "1.0.0 $HOME ");
    }

    #[test]
    fn test_string_command_keeps_quoted_words() {
        let yaml = r#"
services:
  job:
    image: alpine
    command: sh -c 'echo "a b"'
"#;
        let spec = ComposeParser::parse_str(yaml).unwrap();
        assert_eq!(spec.services[0].command, vec!["sh", "-c", r#"echo "a b""#]);

        let broken = "services:\n  job:\n    image: alpine\n    command: echo \"a b\n";
        assert!(matches!(
            ComposeParser::parse_str(broken),
            Err(KeelError::Schema { .. })
        ));
    }

    #[test]
    fn test_healthcheck_forms() {
        let yaml = r#"
services:
  db:
    image: postgres
    healthcheck:
      test: pg_isready
  cache:
    image: redis
    healthcheck:
      disable: true
"#;

        let spec = ComposeParser::parse_str(yaml).unwrap();
        let hc = spec.services[0].healthcheck.as_ref().unwrap();
        assert_eq!(hc.test, vec!["CMD-SHELL", "pg_isready"]);
        assert!(spec.services[1].healthcheck.is_none());
    }
}
