//! Topology file parser

use super::config::{ComposeConfig, ServiceConfig};
use super::topology::Topology;
use crate::error::{BerthError, Result};
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default topology file names, in lookup order
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "berth.yaml",
    "berth.yml",
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Topology file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find a topology file in a directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Parse a topology file, interpolating variables from the process environment
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BerthError::ComposeParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let env: HashMap<String, String> = std::env::vars().collect();
        Self::parse_str_with_env(&content, &env)
    }

    /// Parse a document without interpolation
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        Self::from_value(Self::parse_value(content)?)
    }

    /// Parse a document, replacing `${VAR}`, `${VAR:-default}` and `$VAR`
    /// in every string value
    pub fn parse_str_with_env(content: &str, env: &HashMap<String, String>) -> Result<ComposeConfig> {
        let mut value = Self::parse_value(content)?;
        interpolate_value(&mut value, env);
        Self::from_value(value)
    }

    // Going through `Value` rejects duplicate mapping keys
    fn parse_value(content: &str) -> Result<Value> {
        serde_yaml::from_str(content)
            .map_err(|e| BerthError::ComposeParse(format!("Failed to parse YAML: {}", e)))
    }

    fn from_value(value: Value) -> Result<ComposeConfig> {
        serde_yaml::from_value(value)
            .map_err(|e| BerthError::ComposeParse(format!("Invalid topology document: {}", e)))
    }

    /// Parse and merge several files; later files win
    pub fn parse_files(paths: &[PathBuf]) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            let file_config = Self::parse_file(path)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Parse, merge and validate files into a topology
    pub fn load_files(paths: &[PathBuf]) -> Result<Topology> {
        Topology::load(&Self::parse_files(paths)?)
    }

    /// Merge two configurations
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }

        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.get_mut(&name) {
                Some(existing) => merge_service(existing, service),
                None => {
                    result.services.insert(name, service);
                }
            }
        }

        result.volumes.extend(overlay.volumes);
        result.secrets.extend(overlay.secrets);

        result
    }

    /// Serialize a configuration back to YAML
    pub fn to_yaml(config: &ComposeConfig) -> Result<String> {
        serde_yaml::to_string(config).map_err(|e| BerthError::Yaml(e.to_string()))
    }
}

/// Overlay fields that are set replace the base ones
fn merge_service(base: &mut ServiceConfig, overlay: ServiceConfig) {
    macro_rules! overlay {
        ($($field:ident),*) => {
            $(
                if overlay.$field.is_some() {
                    base.$field = overlay.$field;
                }
            )*
        };
    }

    overlay!(
        image,
        build,
        command,
        environment,
        working_dir,
        ports,
        volumes,
        secrets,
        depends_on,
        healthcheck,
        restart,
        deploy,
        stop_grace_period
    );
}

fn interpolate_value(value: &mut Value, env: &HashMap<String, String>) {
    match value {
        Value::String(s) => *s = interpolate_string(s, env),
        Value::Sequence(items) => {
            for item in items {
                interpolate_value(item, env);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item, env);
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env),
        _ => {}
    }
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::?-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("variable pattern is valid")
    })
}

/// Interpolate environment variables in a string
fn interpolate_string(s: &str, env: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(s, |caps: &Captures| {
            if &caps[0] == "$$" {
                return "$".to_string();
            }
            if let Some(var) = caps.get(1) {
                return match env.get(var.as_str()).filter(|v| !v.is_empty()) {
                    Some(value) => value.clone(),
                    None => caps
                        .get(2)
                        .map(|d| d.as_str().to_string())
                        .or_else(|| env.get(var.as_str()).cloned())
                        .unwrap_or_default(),
                };
            }
            caps.get(3)
                .and_then(|var| env.get(var.as_str()).cloned())
                .unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
version: "3.8"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
"#;

        let config = ComposeParser::parse_str(yaml).unwrap();
        assert_eq!(config.services.len(), 2);
        assert!(config.services.contains_key("web"));
        assert!(config.services.contains_key("db"));
    }

    #[test]
    fn test_duplicate_service_names_are_rejected() {
        let yaml = r#"
services:
  web:
    image: nginx
  web:
    image: httpd
"#;

        let err = ComposeParser::parse_str(yaml).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_interpolate() {
        let mut env = HashMap::new();
        env.insert("TAG".to_string(), "1.0.0".to_string());

        assert_eq!(interpolate_string("nginx:${TAG}", &env), "nginx:1.0.0");
        assert_eq!(interpolate_string("nginx:$TAG", &env), "nginx:1.0.0");
        assert_eq!(interpolate_string("${MISSING:-fallback}", &env), "fallback");
        assert_eq!(interpolate_string("${MISSING}", &env), "");
        assert_eq!(interpolate_string("cost: $$5", &env), "cost: $5");
    }

    #[test]
    fn test_interpolation_reaches_nested_values() {
        let yaml = r#"
services:
  influxdb:
    image: "influxdb:${INFLUX_TAG:-1.8}"
    ports:
      - "${INFLUX_PORT}:8086"
"#;
        let mut env = HashMap::new();
        env.insert("INFLUX_PORT".to_string(), "18086".to_string());

        let config = ComposeParser::parse_str_with_env(yaml, &env).unwrap();
        let topology = Topology::load(&config).unwrap();
        let influx = topology.find("influxdb").unwrap();
        assert_eq!(influx.image.as_deref(), Some("influxdb:1.8"));
        assert_eq!(influx.ports[0].published, Some(18086));
    }

    #[test]
    fn test_merge_overlay_wins() {
        let base = ComposeParser::parse_str(
            r#"
services:
  web:
    image: nginx:1
    ports: ["80:80"]
"#,
        )
        .unwrap();
        let overlay = ComposeParser::parse_str(
            r#"
name: prod
services:
  web:
    image: nginx:2
  worker:
    image: busybox
"#,
        )
        .unwrap();

        let merged = ComposeParser::merge_configs(base, overlay);
        assert_eq!(merged.name.as_deref(), Some("prod"));
        let web = &merged.services["web"];
        assert_eq!(web.image.as_deref(), Some("nginx:2"));
        assert!(web.ports.is_some());
        assert!(merged.services.contains_key("worker"));
    }

    #[test]
    fn test_find_compose_file() {
        let temp = tempdir().unwrap();
        assert!(ComposeParser::find_compose_file(temp.path()).is_none());

        std::fs::write(temp.path().join("compose.yml"), "services: {}\n").unwrap();
        std::fs::write(temp.path().join("berth.yaml"), "services: {}\n").unwrap();

        let found = ComposeParser::find_compose_file(temp.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "berth.yaml");
    }
}
