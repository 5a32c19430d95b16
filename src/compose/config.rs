//! Compose file configuration types

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Top-level compose document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version (informational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services in file order. Duplicate keys are kept so validation can
    /// report them.
    #[serde(
        default,
        deserialize_with = "deserialize_services",
        serialize_with = "serialize_services"
    )]
    pub services: Vec<(String, ServiceConfig)>,
}

impl ComposeConfig {
    /// Look up a service by name (first definition wins)
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    /// Mutable lookup of a service by name
    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceConfig> {
        self.services
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    /// Add a service definition, builder style
    pub fn with_service(mut self, name: &str, service: ServiceConfig) -> Self {
        self.services.push((name.to_string(), service));
        self
    }
}

/// One entry under `services:`, as written
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Option<CommandConfig>,
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
    /// `no`, `always`, `on-failure[:N]` or `unless-stopped`
    #[serde(default)]
    pub restart: Option<String>,
    /// Stop grace period, e.g. "10s" or "1m30s"
    #[serde(default)]
    pub stop_grace_period: Option<String>,
}

impl ServiceConfig {
    /// Create a service running the given image
    pub fn new(image: &str) -> Self {
        Self {
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    /// Set dependencies
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = Some(DependsOnConfig::Array(
            deps.iter().map(|d| d.to_string()).collect(),
        ));
        self
    }

    /// Set exec-form command
    pub fn command(mut self, argv: &[&str]) -> Self {
        self.command = Some(CommandConfig::Exec(
            argv.iter().map(|a| a.to_string()).collect(),
        ));
        self
    }

    /// Add a short-syntax port mapping
    pub fn port(mut self, mapping: &str) -> Self {
        self.ports
            .get_or_insert_with(Vec::new)
            .push(PortConfig::Short(mapping.to_string()));
        self
    }

    /// Set restart policy
    pub fn restart(mut self, policy: &str) -> Self {
        self.restart = Some(policy.to_string());
        self
    }

    /// Declared dependency names, whichever syntax was used
    pub fn dependency_names(&self) -> Vec<String> {
        match &self.depends_on {
            Some(DependsOnConfig::Array(arr)) => arr.clone(),
            Some(DependsOnConfig::Map(map)) => map.keys().cloned().collect(),
            None => Vec::new(),
        }
    }
}

/// `command:` as a shell string or an argv list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandConfig {
    /// Convert to an argv vector
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandConfig::Shell(s) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()]
            }
            CommandConfig::Exec(arr) => arr.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// `KEY=value` items; a bare `KEY` means empty
    Array(Vec<String>),
    Map(BTreeMap<String, Option<String>>),
}

/// `ports:` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// `[ip:][host:]container[/proto]`
    Short(String),
    Long(PortConfigLong),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    pub target: u16,
    /// Host port, quoted in YAML
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// `depends_on:` as a list or a map of conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, DependsOnCondition>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Recorded but not enforced: dependents wait for `running`
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub replicas: Option<u32>,
}

fn deserialize_services<'de, D>(deserializer: D) -> Result<Vec<(String, ServiceConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ServicesVisitor;

    impl<'de> Visitor<'de> for ServicesVisitor {
        type Value = Vec<(String, ServiceConfig)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of service names to service definitions")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut services = Vec::new();
            while let Some((name, service)) = map.next_entry::<String, Option<ServiceConfig>>()? {
                services.push((name, service.unwrap_or_default()));
            }
            Ok(services)
        }
    }

    deserializer.deserialize_any(ServicesVisitor)
}

fn serialize_services<S>(services: &[(String, ServiceConfig)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(services.len()))?;
    for (name, service) in services {
        map.serialize_entry(name, service)?;
    }
    map.end()
}
