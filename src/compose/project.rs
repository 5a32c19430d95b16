//! Validated project model
//!
//! A [`Project`] is the immutable, validated form of a compose definition:
//! every service has an image, every dependency names a defined service and
//! the dependency graph is acyclic.

use super::config::{ComposeConfig, EnvironmentConfig, PortConfig, ServiceConfig};
use super::parser::ComposeParser;
use super::plan::OperationPlan;
use crate::error::{Result, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Project name used when neither the caller nor the definition names one
pub const DEFAULT_PROJECT_NAME: &str = "meshery";

/// Caller-supplied settings resolved once when a project is loaded
#[derive(Debug, Clone, Default)]
pub struct ProjectOptions {
    /// Explicit project name; wins over the definition's `name:`
    pub name: Option<String>,
    /// Explicit working directory
    pub working_dir: Option<PathBuf>,
}

impl ProjectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Resolve the project name: explicit option, then definition, then default
    fn resolve_name(&self, definition: &ComposeConfig) -> String {
        [self.name.as_deref(), definition.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|n| !n.is_empty())
            .unwrap_or(DEFAULT_PROJECT_NAME)
            .to_string()
    }
}

/// Container restart policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let policy = s.trim();
        match policy {
            "no" | "never" | "" => Ok(RestartPolicy::Never),
            "always" | "unless-stopped" => Ok(RestartPolicy::Always),
            _ if policy == "on-failure" || policy.starts_with("on-failure:") => {
                Ok(RestartPolicy::OnFailure)
            }
            other => Err(format!("unknown restart policy '{}'", other)),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A host:container port binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    /// `None` publishes on an ephemeral host port
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl FromStr for PortBinding {
    type Err = String;

    /// Parse `[ip:][host:]container[/protocol]`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (ports, protocol) = match s.rsplit_once('/') {
            Some((ports, proto)) => (ports, proto.parse::<Protocol>()?),
            None => (s, Protocol::Tcp),
        };

        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{}' in '{}'", p, s))
        };

        let parts: Vec<&str> = ports.rsplitn(3, ':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            &[container] => (None, None, parse_port(container)?),
            &[container, host] => (None, Some(parse_port(host)?), parse_port(container)?),
            &[container, host, ip] => {
                let host_port = if host.is_empty() {
                    None
                } else {
                    Some(parse_port(host)?)
                };
                (Some(ip.to_string()), host_port, parse_port(container)?)
            }
            _ => return Err(format!("invalid port mapping '{}'", s)),
        };

        Ok(PortBinding {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }
}

impl fmt::Display for PortBinding {
    /// Rendered the way container listings show published ports
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_port {
            Some(host_port) => write!(
                f,
                "{}:{}->{}/{}",
                self.host_ip.as_deref().unwrap_or("0.0.0.0"),
                host_port,
                self.container_port,
                self.protocol
            ),
            None => write!(f, "{}/{}", self.container_port, self.protocol),
        }
    }
}

impl TryFrom<&PortConfig> for PortBinding {
    type Error = String;

    fn try_from(port: &PortConfig) -> std::result::Result<Self, Self::Error> {
        match port {
            PortConfig::Short(s) => s.parse(),
            PortConfig::Long(long) => {
                let host_port = long
                    .published
                    .as_deref()
                    .map(|p| {
                        p.parse::<u16>()
                            .map_err(|_| format!("invalid published port '{}'", p))
                    })
                    .transpose()?;
                let protocol = long
                    .protocol
                    .as_deref()
                    .map(str::parse::<Protocol>)
                    .transpose()?
                    .unwrap_or_default();
                Ok(PortBinding {
                    host_ip: long.host_ip.clone(),
                    host_port,
                    container_port: long.target,
                    protocol,
                })
            }
        }
    }
}

/// Parse a compose duration such as `10s`, `1m30s`, `500ms` or `1h`.
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration '{}'", s));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration '{}'", s))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            other => return Err(format!("unknown duration unit '{}' in '{}'", other, s)),
        };
        total = unit
            .and_then(|unit| total.checked_add(unit))
            .ok_or_else(|| "duration out of range".to_string())?;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

/// Directory holding a compose file; `.` for a bare file name
fn file_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// A validated service definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub depends_on: BTreeSet<String>,
    pub ports: Vec<PortBinding>,
    pub restart: RestartPolicy,
    pub environment: BTreeMap<String, String>,
    pub replicas: u32,
    /// Overrides the orchestrator's default stop timeout
    pub stop_grace_period: Option<Duration>,
}

impl ServiceSpec {
    fn from_config(name: &str, service: &ServiceConfig) -> std::result::Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidService {
            service: name.to_string(),
            reason,
        };

        let image = service
            .image
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .ok_or_else(|| invalid("no image specified".to_string()))?
            .to_string();

        let ports = service
            .ports
            .iter()
            .flatten()
            .map(PortBinding::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(invalid)?;

        let restart = service
            .restart
            .as_deref()
            .map(str::parse::<RestartPolicy>)
            .transpose()
            .map_err(invalid)?
            .unwrap_or_default();

        let stop_grace_period = service
            .stop_grace_period
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map_err(invalid)?;

        let replicas = service
            .deploy
            .as_ref()
            .and_then(|d| d.replicas)
            .unwrap_or(1);
        if replicas == 0 {
            return Err(invalid("replicas must be at least 1".to_string()));
        }

        let mut environment = BTreeMap::new();
        match &service.environment {
            Some(EnvironmentConfig::Array(arr)) => {
                for item in arr {
                    let (key, value) = item.split_once('=').unwrap_or((item.as_str(), ""));
                    environment.insert(key.to_string(), value.to_string());
                }
            }
            Some(EnvironmentConfig::Map(map)) => {
                for (key, value) in map {
                    environment.insert(key.clone(), value.clone().unwrap_or_default());
                }
            }
            None => {}
        }

        Ok(ServiceSpec {
            name: name.to_string(),
            image,
            command: service
                .command
                .as_ref()
                .map(|c| c.to_argv())
                .unwrap_or_default(),
            depends_on: service.dependency_names().into_iter().collect(),
            ports,
            restart,
            environment,
            replicas,
            stop_grace_period,
        })
    }

    /// Name of the container for the given replica (1-based)
    pub fn container_name(&self, project: &str, replica: u32) -> String {
        format!("{}-{}-{}", project, self.name, replica)
    }
}

/// A validated multi-service project
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    name: String,
    working_dir: PathBuf,
    services: BTreeMap<String, ServiceSpec>,
    #[serde(skip)]
    plan: OperationPlan,
}

impl Project {
    /// Validate a definition into a project.
    ///
    /// Checks, in order: at least one service, unique names, per-service
    /// fields, known dependencies, and an acyclic dependency graph.
    pub fn load(
        definition: &ComposeConfig,
        options: &ProjectOptions,
    ) -> std::result::Result<Self, ValidationError> {
        if definition.services.is_empty() {
            return Err(ValidationError::EmptyProject);
        }

        let mut seen = HashSet::new();
        for (name, _) in &definition.services {
            if !seen.insert(name.as_str()) {
                return Err(ValidationError::DuplicateName(name.clone()));
            }
        }

        let mut services = BTreeMap::new();
        for (name, service) in &definition.services {
            services.insert(name.clone(), ServiceSpec::from_config(name, service)?);
        }

        for spec in services.values() {
            if let Some(dep) = spec.depends_on.iter().find(|d| !services.contains_key(*d)) {
                return Err(ValidationError::UnknownDependency {
                    service: spec.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        // Cycle detection is a side effect of layering
        let graph = services
            .values()
            .map(|s| (s.name.clone(), s.depends_on.clone()))
            .collect();
        let plan = OperationPlan::from_dependencies(&graph)?;

        let project = Project {
            name: options.resolve_name(definition),
            working_dir: options
                .working_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
            services,
            plan,
        };

        tracing::debug!(
            project = %project.name,
            services = project.services.len(),
            "Loaded project"
        );
        Ok(project)
    }

    /// Parse, interpolate from the process environment and validate a compose
    /// file. The working directory defaults to the file's directory.
    pub fn from_file(path: &Path, options: &ProjectOptions) -> Result<Self> {
        let mut config = ComposeParser::parse_file(path)?;
        let env: std::collections::HashMap<String, String> = std::env::vars().collect();
        ComposeParser::interpolate(&mut config, &env);

        let mut options = options.clone();
        if options.working_dir.is_none() {
            options.working_dir = Some(file_dir(path));
        }

        Ok(Self::load(&config, &options)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// Services ordered by name
    pub fn services(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.values()
    }

    /// Start order, computed once at load time
    pub fn plan(&self) -> &OperationPlan {
        &self.plan
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::ServiceConfig;

    fn definition(services: &[(&str, &[&str])]) -> ComposeConfig {
        services.iter().fold(ComposeConfig::default(), |config, (name, deps)| {
            config.with_service(name, ServiceConfig::new("busybox").depends_on(deps))
        })
    }

    #[test]
    fn test_load_valid_project() {
        let project = Project::load(
            &definition(&[("web", &["db"]), ("db", &[])]),
            &ProjectOptions::new().name("shop"),
        )
        .unwrap();

        assert_eq!(project.name(), "shop");
        assert_eq!(project.len(), 2);
        assert!(project.service("web").unwrap().depends_on.contains("db"));
        assert_eq!(project.plan().len(), 2);
    }

    #[test]
    fn test_default_project_name() {
        let project = Project::load(&definition(&[("app", &[])]), &ProjectOptions::new()).unwrap();
        assert_eq!(project.name(), DEFAULT_PROJECT_NAME);

        let mut named = definition(&[("app", &[])]);
        named.name = Some("fromfile".to_string());
        let project = Project::load(&named, &ProjectOptions::new()).unwrap();
        assert_eq!(project.name(), "fromfile");

        let project = Project::load(&named, &ProjectOptions::new().name("explicit")).unwrap();
        assert_eq!(project.name(), "explicit");
    }

    #[test]
    fn test_empty_project() {
        let err = Project::load(&ComposeConfig::default(), &ProjectOptions::new()).unwrap_err();
        assert_eq!(err, ValidationError::EmptyProject);
    }

    #[test]
    fn test_duplicate_name() {
        let err = Project::load(
            &definition(&[("web", &[]), ("web", &[])]),
            &ProjectOptions::new(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateName("web".to_string()));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = Project::load(&definition(&[("web", &["cache"])]), &ProjectOptions::new())
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                service: "web".to_string(),
                dependency: "cache".to_string(),
            }
        );
    }

    #[test]
    fn test_cycle_rejected_at_load() {
        let err = Project::load(
            &definition(&[("a", &["b"]), ("b", &["a"])]),
            &ProjectOptions::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::CycleDetected { .. }));
    }

    #[test]
    fn test_missing_image() {
        let config = ComposeConfig::default().with_service("web", ServiceConfig::default());
        let err = Project::load(&config, &ProjectOptions::new()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidService { ref service, .. } if service == "web"));
    }

    #[test]
    fn test_service_fields() {
        let yaml = r#"
services:
  web:
    image: nginx
    command: nginx -g 'daemon off;'
    restart: unless-stopped
    stop_grace_period: 1m30s
    deploy:
      replicas: 2
    environment:
      - MODE=prod
      - DEBUG
    ports:
      - "8080:80"
      - "127.0.0.1:9000:9000/udp"
      - target: 443
        published: "8443"
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();
        let project = Project::load(&config, &ProjectOptions::new()).unwrap();
        let web = project.service("web").unwrap();

        assert_eq!(web.restart, RestartPolicy::Always);
        assert_eq!(web.replicas, 2);
        assert_eq!(web.stop_grace_period, Some(Duration::from_secs(90)));
        assert_eq!(web.command[0], "/bin/sh");
        assert_eq!(web.environment.get("MODE").map(String::as_str), Some("prod"));
        assert_eq!(web.environment.get("DEBUG").map(String::as_str), Some(""));
        assert_eq!(web.ports.len(), 3);
        assert_eq!(web.ports[1].protocol, Protocol::Udp);
        assert_eq!(web.ports[2].to_string(), "0.0.0.0:8443->443/tcp");
        assert_eq!(web.container_name("shop", 2), "shop-web-2");
    }

    #[test]
    fn test_port_binding_parse() {
        let p: PortBinding = "80".parse().unwrap();
        assert_eq!(p.host_port, None);
        assert_eq!(p.to_string(), "80/tcp");

        let p: PortBinding = "127.0.0.1:8080:80".parse().unwrap();
        assert_eq!(p.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(p.to_string(), "127.0.0.1:8080->80/tcp");

        assert!("http:80".parse::<PortBinding>().is_err());
        assert!("80/sctp".parse::<PortBinding>().is_err());
    }

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::Never);
        assert_eq!("on-failure:3".parse::<RestartPolicy>().unwrap(), RestartPolicy::OnFailure);
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h2m3s").unwrap(), Duration::from_secs(3723));
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert_eq!(
            parse_duration("307445734561825861m").unwrap_err(),
            "duration out of range"
        );
        assert!(parse_duration("5124095576030432h").is_err());
        assert!(parse_duration("18446744073709551615s1s").is_err());
    }

    #[test]
    fn test_overflowing_grace_period_is_invalid_service() {
        let yaml = "services:\n  db:\n    image: postgres\n    stop_grace_period: 307445734561825861m\n";
        let config = crate::compose::ComposeParser::parse_str(yaml).unwrap();
        let err = Project::load(&config, &ProjectOptions::new()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidService { .. }));
    }

    #[test]
    fn test_file_dir_of_bare_name() {
        assert_eq!(file_dir(Path::new("compose.yaml")), PathBuf::from("."));
        assert_eq!(file_dir(Path::new("deploy/compose.yaml")), PathBuf::from("deploy"));
        assert_eq!(file_dir(Path::new("/srv/app/compose.yaml")), PathBuf::from("/srv/app"));
    }

    #[test]
    fn test_from_file_uses_file_directory() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("compose.yaml");
        std::fs::write(&path, "services:\n  app:\n    image: busybox\n").unwrap();

        let project = Project::from_file(&path, &ProjectOptions::new()).unwrap();
        assert_eq!(project.working_dir(), temp.path());
        assert_eq!(project.name(), DEFAULT_PROJECT_NAME);
    }
}
