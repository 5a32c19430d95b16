//! Compose file parser

use super::config::{CommandConfig, ComposeConfig, EnvironmentConfig, PortConfig};
use crate::error::{Result, StevedoreError};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default compose file names, in lookup order
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Reads compose documents into [`ComposeConfig`]
pub struct ComposeParser;

impl ComposeParser {
    /// First of [`DEFAULT_COMPOSE_FILES`] present in `dir`
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StevedoreError::ComposeParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        tracing::debug!(path = %path.display(), "Parsing compose file");
        Self::parse_str(&content)
    }

    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| StevedoreError::ComposeParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Parse multiple compose files; later files overlay earlier ones
    pub fn parse_files(paths: &[&Path]) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            let file_config = Self::parse_file(path)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Overlay `overlay` onto `base` service by service. Scalars are
    /// replaced, ports accumulate, environment maps merge.
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            let Some(existing) = result.service_mut(&name) else {
                result.services.push((name, service));
                continue;
            };

            if service.image.is_some() {
                existing.image = service.image;
            }
            if service.command.is_some() {
                existing.command = service.command;
            }
            if service.depends_on.is_some() {
                existing.depends_on = service.depends_on;
            }
            if service.deploy.is_some() {
                existing.deploy = service.deploy;
            }
            if service.restart.is_some() {
                existing.restart = service.restart;
            }
            if service.stop_grace_period.is_some() {
                existing.stop_grace_period = service.stop_grace_period;
            }
            // Ports accumulate across files
            if let Some(ports) = service.ports {
                existing.ports.get_or_insert_with(Vec::new).extend(ports);
            }
            if let Some(env) = service.environment {
                existing.environment = Some(match existing.environment.take() {
                    Some(EnvironmentConfig::Map(mut base_env)) => match env {
                        EnvironmentConfig::Map(overlay_env) => {
                            base_env.extend(overlay_env);
                            EnvironmentConfig::Map(base_env)
                        }
                        other => other,
                    },
                    _ => env,
                });
            }
        }

        result
    }

    /// Interpolate `$VAR`, `${VAR}`, `${VAR:-default}` and `${VAR-default}`
    /// in image, command, environment and port strings. `$$` is a literal `$`.
    pub fn interpolate(config: &mut ComposeConfig, env: &HashMap<String, String>) {
        for (_, service) in config.services.iter_mut() {
            if let Some(ref mut image) = service.image {
                *image = interpolate_string(image, env);
            }

            match service.command {
                Some(CommandConfig::Shell(ref mut s)) => *s = interpolate_string(s, env),
                Some(CommandConfig::Exec(ref mut argv)) => {
                    for arg in argv.iter_mut() {
                        *arg = interpolate_string(arg, env);
                    }
                }
                None => {}
            }

            match service.environment {
                Some(EnvironmentConfig::Map(ref mut map)) => {
                    for value in map.values_mut().flatten() {
                        *value = interpolate_string(value, env);
                    }
                }
                Some(EnvironmentConfig::Array(ref mut arr)) => {
                    for item in arr.iter_mut() {
                        *item = interpolate_string(item, env);
                    }
                }
                None => {}
            }

            if let Some(ref mut ports) = service.ports {
                for port in ports.iter_mut() {
                    if let PortConfig::Short(ref mut s) = port {
                        *s = interpolate_string(s, env);
                    }
                }
            }
        }
    }
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?)-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("variable pattern is a valid regex")
    })
}

fn interpolate_string(s: &str, env: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(s, |caps: &Captures| {
            if &caps[0] == "$$" {
                return "$".to_string();
            }

            let var = caps
                .get(1)
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let value = env.get(var);

            match caps.get(3) {
                Some(default) => {
                    let empty_counts_as_unset = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
                    match value {
                        Some(v) if !(empty_counts_as_unset && v.is_empty()) => v.clone(),
                        _ => default.as_str().to_string(),
                    }
                }
                None => value.cloned().unwrap_or_else(|| {
                    tracing::warn!(variable = var, "Variable is not set, substituting empty string");
                    String::new()
                }),
            }
        })
        .into_owned()
}
