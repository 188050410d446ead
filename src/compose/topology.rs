//! Validated service topology
//!
//! [`Topology::load`] turns a parsed [`ComposeConfig`] into an immutable graph.
//! Services are stored in an arena sorted by name and addressed by
//! [`ServiceId`]; dependency edges are index lists, never back-references.

use super::config::{
    format_duration, parse_duration, BuildConfig, BuildConfigFull, CommandConfig, ComposeConfig,
    DependsOnConfig, DeployConfig, EnvironmentConfig, ExternalConfig, HealthcheckConfig,
    HealthcheckTest, PortConfig, PortConfigLong, PublishedPort, RestartPolicyConfig, SecretConfig,
    SecretRef, SecretRefLong, ServiceConfig, VolumeConfig, VolumeMount, VolumeMountLong,
};
use super::resolver::DependencyGraph;
use crate::error::{BerthError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Project name used when the document does not carry one
pub const DEFAULT_PROJECT_NAME: &str = "default";

/// Restart attempts for `on-failure` without an explicit count
pub const DEFAULT_RESTART_ATTEMPTS: u32 = 3;

/// Restart attempts for `always` and `unless-stopped`
pub const UNBOUNDED_RESTART_ATTEMPTS: u32 = 5;

const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_RESTART_MAX_DELAY: Duration = Duration::from_secs(30);

/// Index of a service inside its topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub usize);

impl ServiceId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Command to run for a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Shell form, run through `/bin/sh -c`
    Shell(String),
    /// Exec form
    Exec(Vec<String>),
}

impl Command {
    /// Argument vector for the command
    pub fn argv(&self) -> Vec<String> {
        match self {
            Command::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            Command::Exec(args) => args.clone(),
        }
    }
}

/// Build-from-source reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub context: String,
    pub dockerfile: Option<String>,
}

/// Mount of a named volume or a host path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Named volume declared at the top level
    Volume {
        volume: String,
        target: String,
        read_only: bool,
    },
    /// Host path
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
}

impl Mount {
    pub fn target(&self) -> &str {
        match self {
            Mount::Volume { target, .. } | Mount::Bind { target, .. } => target,
        }
    }

    /// Volume name when the mount refers to a named volume
    pub fn volume(&self) -> Option<&str> {
        match self {
            Mount::Volume { volume, .. } => Some(volume.as_str()),
            Mount::Bind { .. } => None,
        }
    }
}

/// Secret exposed to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMount {
    pub secret: String,
    pub target: String,
}

/// Port protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    /// Host side; `None` when only the container port is declared
    pub published: Option<u16>,
    pub target: u16,
    pub protocol: Protocol,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            if ip.contains(':') {
                write!(f, "[{}]:", ip)?;
            } else {
                write!(f, "{}:", ip)?;
            }
        }
        match self.published {
            Some(published) => write!(f, "{}:{}", published, self.target)?,
            None if self.host_ip.is_some() => write!(f, ":{}", self.target)?,
            None => write!(f, "{}", self.target)?,
        }
        if self.protocol != Protocol::Tcp {
            write!(f, "/{}", self.protocol)?;
        }
        Ok(())
    }
}

/// Health test command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthTest {
    /// `["CMD", ...]`
    Exec(Vec<String>),
    /// `["CMD-SHELL", "..."]` or a plain string
    Shell(String),
}

impl HealthTest {
    pub fn argv(&self) -> Vec<String> {
        match self {
            HealthTest::Exec(args) => args.clone(),
            HealthTest::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
        }
    }
}

/// Healthcheck settings of a service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Healthcheck {
    pub test: Option<HealthTest>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub start_period: Option<Duration>,
}

/// Bounded restart policy with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: DEFAULT_RESTART_DELAY,
            max_delay: DEFAULT_RESTART_MAX_DELAY,
        }
    }

    /// Delay before restart number `attempt` (zero based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A validated service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub image: Option<String>,
    pub build: Option<BuildSpec>,
    pub command: Option<Command>,
    /// Values left as `None` are taken from the environment at launch
    pub environment: BTreeMap<String, Option<String>>,
    pub working_dir: Option<String>,
    pub depends_on: Vec<String>,
    pub dependencies: Vec<ServiceId>,
    pub mounts: Vec<Mount>,
    pub secrets: Vec<SecretMount>,
    pub ports: Vec<PortMapping>,
    pub healthcheck: Option<Healthcheck>,
    pub restart: Option<RestartPolicy>,
    pub stop_grace_period: Option<Duration>,
}

impl Service {
    /// Opaque image/command reference handed to the runtime
    pub fn reference(&self) -> String {
        if let Some(image) = &self.image {
            image.clone()
        } else if let Some(build) = &self.build {
            format!("build:{}", build.context)
        } else if let Some(command) = &self.command {
            command.argv().join(" ")
        } else {
            String::new()
        }
    }

    /// Named volumes used by the service, deduplicated, in mount order
    pub fn volume_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.mounts
            .iter()
            .filter_map(|m| m.volume())
            .filter(|v| seen.insert(*v))
            .collect()
    }

    /// Secrets used by the service, deduplicated, in declaration order
    pub fn secret_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.secrets
            .iter()
            .map(|s| s.secret.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }
}

/// Named volume declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub external: bool,
    /// Name of the volume on the host
    pub host_name: Option<String>,
    /// Default mount target
    pub target: Option<String>,
}

impl VolumeSpec {
    pub fn host_name(&self) -> &str {
        self.host_name.as_deref().unwrap_or(&self.name)
    }
}

/// Where a secret comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Internal,
    External,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Internal => write!(f, "internal"),
            Provenance::External => write!(f, "external"),
        }
    }
}

/// Source of an internal secret's value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Resolved by the secret provider under this name
    Provider(String),
    /// Read from a file
    File(String),
    /// Read from an environment variable
    Environment(String),
    /// Stored by berth, created empty and filled out-of-band
    Managed,
}

/// Secret declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub name: String,
    pub provenance: Provenance,
    pub source: SecretSource,
}

/// Validated, immutable service graph
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    name: String,
    services: Vec<Service>,
    index: HashMap<String, ServiceId>,
    volumes: BTreeMap<String, VolumeSpec>,
    secrets: BTreeMap<String, SecretSpec>,
    graph: DependencyGraph,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("name pattern is valid"))
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(BerthError::Config(format!("invalid {} name '{}'", kind, name)))
    }
}

impl Topology {
    /// Validate a parsed document and build the topology
    pub fn load(config: &ComposeConfig) -> Result<Self> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string());
        validate_name("project", &name)?;

        if config.services.is_empty() {
            return Err(BerthError::Config("no services defined".to_string()));
        }

        let mut volumes = BTreeMap::new();
        for (volume_name, volume) in &config.volumes {
            validate_name("volume", volume_name)?;
            let volume = volume.clone().unwrap_or_default();
            let external = volume.external.as_ref().map(|e| e.is_external()).unwrap_or(false);
            let host_name = volume
                .external
                .as_ref()
                .and_then(|e| e.name().map(str::to_string))
                .or(volume.name);
            volumes.insert(
                volume_name.clone(),
                VolumeSpec {
                    name: volume_name.clone(),
                    external,
                    host_name,
                    target: volume.target,
                },
            );
        }

        let mut secrets = BTreeMap::new();
        for (secret_name, secret) in &config.secrets {
            validate_name("secret", secret_name)?;
            secrets.insert(secret_name.clone(), load_secret(secret_name, secret)?);
        }

        // BTreeMap iteration gives the arena its name order
        let index: HashMap<String, ServiceId> = config
            .services
            .keys()
            .enumerate()
            .map(|(i, name)| (name.clone(), ServiceId(i)))
            .collect();

        let mut services = Vec::with_capacity(config.services.len());
        for (i, (service_name, service)) in config.services.iter().enumerate() {
            validate_name("service", service_name)?;
            services.push(load_service(
                ServiceId(i),
                service_name,
                service,
                &index,
                &volumes,
                &secrets,
            )?);
        }

        check_port_conflicts(&services)?;

        let graph = DependencyGraph::new(
            services
                .iter()
                .map(|s| s.dependencies.clone())
                .collect(),
        );

        Ok(Self {
            name,
            services,
            index,
            volumes,
            secrets,
            graph,
        })
    }

    /// Replace the project name
    pub fn with_project_name(mut self, name: &str) -> Result<Self> {
        validate_name("project", name)?;
        self.name = name.to_string();
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, id: ServiceId) -> &Service {
        &self.services[id.0]
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Look up a service by name
    pub fn find(&self, name: &str) -> Result<&Service> {
        self.index
            .get(name)
            .map(|id| &self.services[id.0])
            .ok_or_else(|| BerthError::ServiceNotFound(name.to_string()))
    }

    pub fn volumes(&self) -> &BTreeMap<String, VolumeSpec> {
        &self.volumes
    }

    pub fn secrets(&self) -> &BTreeMap<String, SecretSpec> {
        &self.secrets
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Convert back to document form
    pub fn to_config(&self) -> ComposeConfig {
        let services = self
            .services
            .iter()
            .map(|s| (s.name.clone(), service_to_config(s)))
            .collect();

        let volumes = self
            .volumes
            .values()
            .map(|v| {
                let config = VolumeConfig {
                    driver: None,
                    external: v.external.then(|| match &v.host_name {
                        Some(name) => ExternalConfig::Named { name: name.clone() },
                        None => ExternalConfig::Bool(true),
                    }),
                    name: if v.external { None } else { v.host_name.clone() },
                    target: v.target.clone(),
                };
                let config = (config != VolumeConfig::default()).then_some(config);
                (v.name.clone(), config)
            })
            .collect();

        let secrets = self
            .secrets
            .values()
            .map(|s| {
                let mut config = SecretConfig::default();
                match &s.source {
                    SecretSource::Provider(name) => {
                        config.external = Some(if name == &s.name {
                            ExternalConfig::Bool(true)
                        } else {
                            ExternalConfig::Named { name: name.clone() }
                        });
                    }
                    SecretSource::File(path) => config.file = Some(path.clone()),
                    SecretSource::Environment(var) => config.environment = Some(var.clone()),
                    SecretSource::Managed => {}
                }
                (s.name.clone(), config)
            })
            .collect();

        ComposeConfig {
            version: None,
            name: Some(self.name.clone()),
            services,
            volumes,
            secrets,
        }
    }
}

fn load_secret(name: &str, secret: &SecretConfig) -> Result<SecretSpec> {
    let external = secret.external.as_ref().map(|e| e.is_external()).unwrap_or(false);

    if external {
        if secret.file.is_some() || secret.environment.is_some() {
            return Err(BerthError::Config(format!(
                "external secret '{}' cannot also declare 'file' or 'environment'",
                name
            )));
        }
        let provider_name = secret
            .external
            .as_ref()
            .and_then(|e| e.name().map(str::to_string))
            .or_else(|| secret.name.clone())
            .unwrap_or_else(|| name.to_string());
        return Ok(SecretSpec {
            name: name.to_string(),
            provenance: Provenance::External,
            source: SecretSource::Provider(provider_name),
        });
    }

    let source = match (&secret.file, &secret.environment) {
        (Some(_), Some(_)) => {
            return Err(BerthError::Config(format!(
                "secret '{}' declares both 'file' and 'environment'",
                name
            )))
        }
        (Some(file), None) => SecretSource::File(file.clone()),
        (None, Some(var)) => SecretSource::Environment(var.clone()),
        (None, None) => SecretSource::Managed,
    };

    Ok(SecretSpec {
        name: name.to_string(),
        provenance: Provenance::Internal,
        source,
    })
}

fn load_service(
    id: ServiceId,
    name: &str,
    config: &ServiceConfig,
    index: &HashMap<String, ServiceId>,
    volumes: &BTreeMap<String, VolumeSpec>,
    secrets: &BTreeMap<String, SecretSpec>,
) -> Result<Service> {
    let build = config.build.as_ref().map(|b| match b {
        BuildConfig::Simple(context) => BuildSpec {
            context: context.clone(),
            dockerfile: None,
        },
        BuildConfig::Full(full) => BuildSpec {
            context: full.context.clone().unwrap_or_else(|| ".".to_string()),
            dockerfile: full.dockerfile.clone(),
        },
    });

    let command = config.command.as_ref().map(|c| match c {
        CommandConfig::Shell(s) => Command::Shell(s.clone()),
        CommandConfig::Exec(args) => Command::Exec(args.clone()),
    });

    if config.image.is_none() && build.is_none() && command.is_none() {
        return Err(BerthError::Config(format!(
            "service '{}' must specify 'image', 'build' or 'command'",
            name
        )));
    }
    if let Some(Command::Exec(args)) = &command {
        if args.is_empty() {
            return Err(BerthError::Config(format!(
                "service '{}' has an empty command",
                name
            )));
        }
    }

    let environment = match &config.environment {
        None => BTreeMap::new(),
        Some(EnvironmentConfig::Map(map)) => map.clone(),
        Some(EnvironmentConfig::Array(items)) => items
            .iter()
            .map(|item| match item.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.to_string())),
                None => (item.clone(), None),
            })
            .collect(),
    };

    let mut depends_on = Vec::new();
    let mut dependencies = Vec::new();
    for dep in config.depends_on.as_ref().map(DependsOnConfig::names).unwrap_or_default() {
        let dep_id = index.get(&dep).ok_or_else(|| {
            BerthError::Config(format!(
                "service '{}' depends on unknown service '{}'",
                name, dep
            ))
        })?;
        if !dependencies.contains(dep_id) {
            dependencies.push(*dep_id);
            depends_on.push(dep);
        }
    }

    let mut mounts = Vec::new();
    for mount in config.volumes.iter().flatten() {
        mounts.push(load_mount(name, mount, volumes)?);
    }

    let mut service_secrets = Vec::new();
    for secret in config.secrets.iter().flatten() {
        let (source, target) = match secret {
            SecretRef::Short(source) => (source.clone(), source.clone()),
            SecretRef::Long(long) => (
                long.source.clone(),
                long.target.clone().unwrap_or_else(|| long.source.clone()),
            ),
        };
        if !secrets.contains_key(&source) {
            return Err(BerthError::Config(format!(
                "service '{}' references undefined secret '{}'",
                name, source
            )));
        }
        service_secrets.push(SecretMount {
            secret: source,
            target,
        });
    }

    let mut ports = Vec::new();
    for port in config.ports.iter().flatten() {
        ports.extend(load_port(name, port)?);
    }

    let healthcheck = config
        .healthcheck
        .as_ref()
        .map(|h| load_healthcheck(name, h))
        .transpose()?
        .flatten();

    let restart = load_restart(name, config.restart.as_deref(), config.deploy.as_ref())?;

    let stop_grace_period = config
        .stop_grace_period
        .as_deref()
        .map(parse_duration)
        .transpose()?;

    Ok(Service {
        id,
        name: name.to_string(),
        image: config.image.clone(),
        build,
        command,
        environment,
        working_dir: config.working_dir.clone(),
        depends_on,
        dependencies,
        mounts,
        secrets: service_secrets,
        ports,
        healthcheck,
        restart,
        stop_grace_period,
    })
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

fn load_mount(
    service: &str,
    mount: &VolumeMount,
    volumes: &BTreeMap<String, VolumeSpec>,
) -> Result<Mount> {
    let (source, target, read_only, bind) = match mount {
        VolumeMount::Short(spec) => {
            let parts: Vec<&str> = spec.split(':').collect();
            let (source, target, mode) = match parts.as_slice() {
                [source] => (source.to_string(), None, None),
                [source, target] => (source.to_string(), Some(target.to_string()), None),
                [source, target, mode] => {
                    (source.to_string(), Some(target.to_string()), Some(*mode))
                }
                _ => {
                    return Err(BerthError::Config(format!(
                        "service '{}' has an invalid volume mount '{}'",
                        service, spec
                    )))
                }
            };
            let read_only = match mode {
                None | Some("rw") => false,
                Some("ro") => true,
                Some(other) => {
                    return Err(BerthError::Config(format!(
                        "service '{}' has an unknown mount mode '{}'",
                        service, other
                    )))
                }
            };
            let bind = is_host_path(&source);
            (Some(source), target, read_only, bind)
        }
        VolumeMount::Long(long) => {
            let bind = match long.mount_type.as_deref() {
                None => long.source.as_deref().map(is_host_path).unwrap_or(false),
                Some("bind") => true,
                Some("volume") => false,
                Some(other) => {
                    return Err(BerthError::Config(format!(
                        "service '{}' uses unsupported mount type '{}'",
                        service, other
                    )))
                }
            };
            (
                long.source.clone(),
                Some(long.target.clone()),
                long.read_only.unwrap_or(false),
                bind,
            )
        }
    };

    let source = source.ok_or_else(|| {
        BerthError::Config(format!(
            "service '{}' declares a mount without a source; anonymous volumes are not supported",
            service
        ))
    })?;

    if bind {
        let target = target.ok_or_else(|| {
            BerthError::Config(format!(
                "service '{}' has a bind mount '{}' without a target",
                service, source
            ))
        })?;
        return Ok(Mount::Bind {
            source,
            target,
            read_only,
        });
    }

    let volume = volumes.get(&source).ok_or_else(|| {
        BerthError::Config(format!(
            "service '{}' references undefined volume '{}'",
            service, source
        ))
    })?;
    let target = target.or_else(|| volume.target.clone()).ok_or_else(|| {
        BerthError::Config(format!(
            "service '{}' mounts volume '{}' without a target path",
            service, source
        ))
    })?;

    Ok(Mount::Volume {
        volume: source,
        target,
        read_only,
    })
}

fn parse_protocol(service: &str, protocol: Option<&str>) -> Result<Protocol> {
    match protocol {
        None | Some("tcp") => Ok(Protocol::Tcp),
        Some("udp") => Ok(Protocol::Udp),
        Some(other) => Err(BerthError::Config(format!(
            "service '{}' uses unsupported protocol '{}'",
            service, other
        ))),
    }
}

fn parse_port_range(service: &str, spec: &str) -> Result<Vec<u16>> {
    let invalid = || BerthError::Config(format!("service '{}' has an invalid port '{}'", service, spec));
    match spec.split_once('-') {
        Some((start, end)) => {
            let start: u16 = start.parse().map_err(|_| invalid())?;
            let end: u16 = end.parse().map_err(|_| invalid())?;
            if start > end {
                return Err(invalid());
            }
            Ok((start..=end).collect())
        }
        None => Ok(vec![spec.parse().map_err(|_| invalid())?]),
    }
}

fn load_port(service: &str, port: &PortConfig) -> Result<Vec<PortMapping>> {
    match port {
        PortConfig::Number(target) => Ok(vec![PortMapping {
            host_ip: None,
            published: None,
            target: *target,
            protocol: Protocol::Tcp,
        }]),
        PortConfig::Long(PortConfigLong {
            target,
            published,
            host_ip,
            protocol,
        }) => {
            let published = match published {
                None => None,
                Some(PublishedPort::Number(p)) => Some(*p),
                Some(PublishedPort::Text(text)) if text.is_empty() => None,
                Some(PublishedPort::Text(text)) => Some(text.parse().map_err(|_| {
                    BerthError::Config(format!(
                        "service '{}' has an invalid published port '{}'",
                        service, text
                    ))
                })?),
            };
            Ok(vec![PortMapping {
                host_ip: host_ip.clone(),
                published,
                target: *target,
                protocol: parse_protocol(service, protocol.as_deref())?,
            }])
        }
        PortConfig::Short(spec) => {
            let (mapping, protocol) = match spec.split_once('/') {
                Some((mapping, protocol)) => (mapping, Some(protocol)),
                None => (spec.as_str(), None),
            };
            let protocol = parse_protocol(service, protocol)?;

            let parts: Vec<&str> = mapping.rsplitn(3, ':').collect();
            let (host_ip, published, target) = match parts.as_slice() {
                [target] => (None, None, *target),
                [target, published] => (None, Some(*published), *target),
                [target, published, ip] => {
                    let ip = ip.trim_start_matches('[').trim_end_matches(']');
                    (Some(ip.to_string()), Some(*published), *target)
                }
                _ => unreachable!(),
            };

            let targets = parse_port_range(service, target)?;
            let published = match published {
                Some(p) if !p.is_empty() => Some(parse_port_range(service, p)?),
                _ => None,
            };

            match published {
                None => Ok(targets
                    .into_iter()
                    .map(|target| PortMapping {
                        host_ip: host_ip.clone(),
                        published: None,
                        target,
                        protocol,
                    })
                    .collect()),
                Some(published) if published.len() == targets.len() => Ok(published
                    .into_iter()
                    .zip(targets)
                    .map(|(published, target)| PortMapping {
                        host_ip: host_ip.clone(),
                        published: Some(published),
                        target,
                        protocol,
                    })
                    .collect()),
                Some(_) => Err(BerthError::Config(format!(
                    "service '{}' has mismatched port ranges in '{}'",
                    service, spec
                ))),
            }
        }
    }
}

fn check_port_conflicts(services: &[Service]) -> Result<()> {
    let mut claimed: HashMap<(u16, Protocol), &str> = HashMap::new();
    for service in services {
        for port in &service.ports {
            let Some(published) = port.published else {
                continue;
            };
            if let Some(owner) = claimed.insert((published, port.protocol), &service.name) {
                return Err(BerthError::Config(format!(
                    "host port {}/{} is published by both '{}' and '{}'",
                    published, port.protocol, owner, service.name
                )));
            }
        }
    }
    Ok(())
}

fn load_healthcheck(service: &str, config: &HealthcheckConfig) -> Result<Option<Healthcheck>> {
    if config.disable == Some(true) {
        return Ok(None);
    }

    let test = match &config.test {
        None => None,
        Some(HealthcheckTest::Command(cmd)) => Some(HealthTest::Shell(cmd.clone())),
        Some(HealthcheckTest::Array(items)) => match items.split_first() {
            Some((kind, _)) if kind == "NONE" => return Ok(None),
            Some((kind, rest)) if kind == "CMD" && !rest.is_empty() => {
                Some(HealthTest::Exec(rest.to_vec()))
            }
            Some((kind, rest)) if kind == "CMD-SHELL" && rest.len() == 1 => {
                Some(HealthTest::Shell(rest[0].clone()))
            }
            _ => {
                return Err(BerthError::Config(format!(
                    "service '{}' has an invalid healthcheck test",
                    service
                )))
            }
        },
    };

    let duration = |value: &Option<String>| value.as_deref().map(parse_duration).transpose();

    Ok(Some(Healthcheck {
        test,
        interval: duration(&config.interval)?,
        timeout: duration(&config.timeout)?,
        retries: config.retries,
        start_period: duration(&config.start_period)?,
    }))
}

fn load_restart(
    service: &str,
    restart: Option<&str>,
    deploy: Option<&DeployConfig>,
) -> Result<Option<RestartPolicy>> {
    if let Some(policy) = deploy.and_then(|d| d.restart_policy.as_ref()) {
        let condition = policy.condition.as_deref().unwrap_or("on-failure");
        if condition == "none" {
            return Ok(None);
        }
        if condition != "on-failure" && condition != "any" {
            return Err(BerthError::Config(format!(
                "service '{}' has an unknown restart condition '{}'",
                service, condition
            )));
        }
        let default_attempts = if condition == "any" {
            UNBOUNDED_RESTART_ATTEMPTS
        } else {
            DEFAULT_RESTART_ATTEMPTS
        };
        let mut result = RestartPolicy::new(policy.max_attempts.unwrap_or(default_attempts));
        if let Some(delay) = &policy.delay {
            result.delay = parse_duration(delay)?;
        }
        if let Some(max_delay) = &policy.max_delay {
            result.max_delay = parse_duration(max_delay)?;
        }
        return Ok((result.max_attempts > 0).then_some(result));
    }

    let Some(restart) = restart else {
        return Ok(None);
    };

    match restart.split_once(':') {
        None if restart == "no" => Ok(None),
        None if restart == "on-failure" => Ok(Some(RestartPolicy::new(DEFAULT_RESTART_ATTEMPTS))),
        None if restart == "always" || restart == "unless-stopped" => {
            Ok(Some(RestartPolicy::new(UNBOUNDED_RESTART_ATTEMPTS)))
        }
        Some(("on-failure", count)) => {
            let attempts: u32 = count.parse().map_err(|_| {
                BerthError::Config(format!(
                    "service '{}' has an invalid restart count '{}'",
                    service, count
                ))
            })?;
            Ok((attempts > 0).then(|| RestartPolicy::new(attempts)))
        }
        _ => Err(BerthError::Config(format!(
            "service '{}' has an unknown restart policy '{}'",
            service, restart
        ))),
    }
}

fn service_to_config(service: &Service) -> ServiceConfig {
    let build = service.build.as_ref().map(|b| match &b.dockerfile {
        None => BuildConfig::Simple(b.context.clone()),
        Some(dockerfile) => BuildConfig::Full(BuildConfigFull {
            context: Some(b.context.clone()),
            dockerfile: Some(dockerfile.clone()),
        }),
    });

    let command = service.command.as_ref().map(|c| match c {
        Command::Shell(s) => CommandConfig::Shell(s.clone()),
        Command::Exec(args) => CommandConfig::Exec(args.clone()),
    });

    let environment = (!service.environment.is_empty())
        .then(|| EnvironmentConfig::Map(service.environment.clone()));

    let ports = (!service.ports.is_empty()).then(|| {
        service
            .ports
            .iter()
            .map(|p| PortConfig::Short(p.to_string()))
            .collect()
    });

    let volumes = (!service.mounts.is_empty()).then(|| {
        service
            .mounts
            .iter()
            .map(|m| {
                let (mount_type, source, target, read_only) = match m {
                    Mount::Volume {
                        volume,
                        target,
                        read_only,
                    } => ("volume", volume, target, *read_only),
                    Mount::Bind {
                        source,
                        target,
                        read_only,
                    } => ("bind", source, target, *read_only),
                };
                VolumeMount::Long(VolumeMountLong {
                    mount_type: Some(mount_type.to_string()),
                    source: Some(source.clone()),
                    target: target.clone(),
                    read_only: read_only.then_some(true),
                })
            })
            .collect()
    });

    let secrets = (!service.secrets.is_empty()).then(|| {
        service
            .secrets
            .iter()
            .map(|s| {
                if s.secret == s.target {
                    SecretRef::Short(s.secret.clone())
                } else {
                    SecretRef::Long(SecretRefLong {
                        source: s.secret.clone(),
                        target: Some(s.target.clone()),
                    })
                }
            })
            .collect()
    });

    let depends_on =
        (!service.depends_on.is_empty()).then(|| DependsOnConfig::Array(service.depends_on.clone()));

    let healthcheck = service.healthcheck.as_ref().map(|h| HealthcheckConfig {
        test: h.test.as_ref().map(|t| match t {
            HealthTest::Exec(args) => {
                let mut items = vec!["CMD".to_string()];
                items.extend(args.iter().cloned());
                HealthcheckTest::Array(items)
            }
            HealthTest::Shell(cmd) => {
                HealthcheckTest::Array(vec!["CMD-SHELL".to_string(), cmd.clone()])
            }
        }),
        interval: h.interval.map(format_duration),
        timeout: h.timeout.map(format_duration),
        retries: h.retries,
        start_period: h.start_period.map(format_duration),
        disable: None,
    });

    let deploy = service.restart.map(|r| DeployConfig {
        restart_policy: Some(RestartPolicyConfig {
            condition: Some("on-failure".to_string()),
            delay: Some(format_duration(r.delay)),
            max_delay: Some(format_duration(r.max_delay)),
            max_attempts: Some(r.max_attempts),
        }),
    });

    ServiceConfig {
        image: service.image.clone(),
        build,
        command,
        environment,
        working_dir: service.working_dir.clone(),
        ports,
        volumes,
        secrets,
        depends_on,
        healthcheck,
        restart: None,
        deploy,
        stop_grace_period: service.stop_grace_period.map(format_duration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::ComposeParser;

    fn load(yaml: &str) -> Result<Topology> {
        Topology::load(&ComposeParser::parse_str(yaml)?)
    }

    const MONITORING: &str = r#"
name: monitoring
services:
  grafana:
    image: grafana/grafana:9.0.0
    ports:
      - "3000:3000"
    volumes:
      - grafana-data:/var/lib/grafana
    depends_on:
      - influxdb
  influxdb:
    image: influxdb:1.8
    ports:
      - "8086:8086"
    volumes:
      - influxdb-data
    secrets:
      - influxdb_password
    healthcheck:
      test: ["CMD", "curl", "-f", "http://localhost:8086/ping"]
      interval: 5s
      retries: 3
  jenkins:
    build: ./jenkins
    ports:
      - "8080:8080"
      - "127.0.0.1:50000:50000"
    restart: on-failure:2
    secrets:
      - source: jenkins_admin
        target: admin_password
volumes:
  grafana-data:
  influxdb-data:
    target: /var/lib/influxdb
secrets:
  influxdb_password:
    external: true
  jenkins_admin:
    environment: JENKINS_ADMIN_PASSWORD
"#;

    #[test]
    fn test_load_monitoring_stack() {
        let topology = load(MONITORING).unwrap();
        assert_eq!(topology.name(), "monitoring");
        assert_eq!(topology.len(), 3);

        // arena is sorted by name
        let names: Vec<&str> = topology.services().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["grafana", "influxdb", "jenkins"]);

        let grafana = topology.find("grafana").unwrap();
        assert_eq!(grafana.dependencies, vec![topology.find("influxdb").unwrap().id]);

        let influx = topology.find("influxdb").unwrap();
        assert_eq!(influx.mounts[0].target(), "/var/lib/influxdb");
        assert_eq!(
            topology.secrets()["influxdb_password"].provenance,
            Provenance::External
        );

        let jenkins = topology.find("jenkins").unwrap();
        assert_eq!(jenkins.restart.unwrap().max_attempts, 2);
        assert_eq!(jenkins.ports[1].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(jenkins.secrets[0].target, "admin_password");
    }

    #[test]
    fn test_duplicate_host_port_is_rejected() {
        let yaml = r#"
services:
  a:
    image: nginx
    ports: ["8080:80"]
  b:
    image: nginx
    ports: ["8080:8080"]
"#;
        let err = load(yaml).unwrap_err();
        assert!(matches!(err, BerthError::Config(_)));
        assert!(err.to_string().contains("8080"));
    }

    #[test]
    fn test_same_port_different_protocol_is_allowed() {
        let yaml = r#"
services:
  a:
    image: dns
    ports: ["53:53"]
  b:
    image: dns
    ports: ["53:53/udp"]
"#;
        assert!(load(yaml).is_ok());
    }

    #[test]
    fn test_unknown_references_are_rejected() {
        let missing_dep = r#"
services:
  a:
    image: nginx
    depends_on: [ghost]
"#;
        assert!(matches!(load(missing_dep), Err(BerthError::Config(_))));

        let missing_volume = r#"
services:
  a:
    image: nginx
    volumes: ["data:/data"]
"#;
        assert!(matches!(load(missing_volume), Err(BerthError::Config(_))));

        let missing_secret = r#"
services:
  a:
    image: nginx
    secrets: [token]
"#;
        assert!(matches!(load(missing_secret), Err(BerthError::Config(_))));
    }

    #[test]
    fn test_bind_mounts_do_not_need_declarations() {
        let yaml = r#"
services:
  a:
    image: nginx
    volumes: ["./html:/usr/share/nginx/html:ro"]
"#;
        let topology = load(yaml).unwrap();
        let mount = &topology.services()[0].mounts[0];
        assert!(matches!(mount, Mount::Bind { read_only: true, .. }));
    }

    #[test]
    fn test_service_needs_a_reference() {
        let yaml = r#"
services:
  a:
    ports: ["80:80"]
"#;
        assert!(matches!(load(yaml), Err(BerthError::Config(_))));
    }

    #[test]
    fn test_port_ranges_expand() {
        let yaml = r#"
services:
  a:
    image: nginx
    ports: ["9000-9002:8000-8002"]
"#;
        let topology = load(yaml).unwrap();
        let ports = &topology.services()[0].ports;
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[2].published, Some(9002));
        assert_eq!(ports[2].target, 8002);
    }

    #[test]
    fn test_restart_policies() {
        let yaml = r#"
services:
  a:
    image: x
    restart: "no"
  b:
    image: x
    restart: always
  c:
    image: x
    deploy:
      restart_policy:
        condition: on-failure
        delay: 200ms
        max_attempts: 4
"#;
        let topology = load(yaml).unwrap();
        assert!(topology.find("a").unwrap().restart.is_none());
        assert_eq!(
            topology.find("b").unwrap().restart.unwrap().max_attempts,
            UNBOUNDED_RESTART_ATTEMPTS
        );
        let c = topology.find("c").unwrap().restart.unwrap();
        assert_eq!(c.max_attempts, 4);
        assert_eq!(c.delay, Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RestartPolicy {
            max_attempts: 10,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_round_trip_preserves_semantics() {
        let topology = load(MONITORING).unwrap();
        let yaml = ComposeParser::to_yaml(&topology.to_config()).unwrap();
        let reloaded = load(&yaml).unwrap();
        assert_eq!(topology, reloaded);
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let yaml = r#"
services:
  "bad name":
    image: x
"#;
        assert!(matches!(load(yaml), Err(BerthError::Config(_))));
    }
}
