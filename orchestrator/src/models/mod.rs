//! Data models for the HistomicsTK stack
//!
//! This module defines the service descriptors, the per-run options supplied by
//! the caller, and the container/image/network shapes exchanged with the
//! container runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Service Models
// ============================================================================

/// The four services of the stack, declared in dependency order.
///
/// The serialized form is the short key used as container hostname and
/// network alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceKey {
    #[serde(rename = "rmq")]
    Queue,
    #[serde(rename = "mongodb")]
    Database,
    #[serde(rename = "worker")]
    Worker,
    #[serde(rename = "histomicstk")]
    Application,
}

impl ServiceKey {
    /// All services in start order. Teardown walks this in reverse.
    pub const ALL: [ServiceKey; 4] = [
        ServiceKey::Queue,
        ServiceKey::Database,
        ServiceKey::Worker,
        ServiceKey::Application,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKey::Queue => "rmq",
            ServiceKey::Database => "mongodb",
            ServiceKey::Worker => "worker",
            ServiceKey::Application => "histomicstk",
        }
    }

    /// Position in [`ServiceKey::ALL`]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKey {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ParseModeError::UnknownService(s.to_string()))
    }
}

/// Static description of one deployable component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service identity
    pub key: ServiceKey,

    /// Image reference, e.g. `mongo:latest`
    pub image: String,

    /// Name given to the service's container
    pub container_name: String,

    /// Build file (relative to the build context) when the image is built locally
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Whether the image comes from a registry. Images that are not pulled
    /// fall back to a local build when the pull fails.
    #[serde(default)]
    pub pull: bool,
}

impl ServiceDescriptor {
    pub fn is_buildable(&self) -> bool {
        self.dockerfile.is_some()
    }

    /// A failed pull may be recovered by building the image locally
    pub fn builds_on_pull_failure(&self) -> bool {
        !self.pull && self.is_buildable()
    }
}

// ============================================================================
// Run Options
// ============================================================================

/// Where a dependency (queue or database) comes from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DependencyMode {
    /// Run as a managed container on the stack network
    #[default]
    Embedded,
    /// Already running on the docker host
    Host,
    /// Reachable at the given address
    External(String),
}

impl DependencyMode {
    /// Value handed to dependent containers instead of a network alias.
    /// `None` when the dependency runs embedded.
    pub fn host_indicator(&self) -> Option<String> {
        match self {
            DependencyMode::Embedded => None,
            DependencyMode::Host => Some("true".to_string()),
            DependencyMode::External(address) => Some(address.clone()),
        }
    }
}

impl FromStr for DependencyMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(ParseModeError::Empty),
            "docker" => Ok(DependencyMode::Embedded),
            "host" => Ok(DependencyMode::Host),
            address => Ok(DependencyMode::External(address.to_string())),
        }
    }
}

impl fmt::Display for DependencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyMode::Embedded => f.write_str("docker"),
            DependencyMode::Host => f.write_str("host"),
            DependencyMode::External(address) => f.write_str(address),
        }
    }
}

/// Storage for the database container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseStorage {
    /// Let the runtime keep the data inside the container
    Managed,
    /// Bind the given host directory at `/data/db`
    HostPath(PathBuf),
}

impl FromStr for DatabaseStorage {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(ParseModeError::Empty),
            "docker" => Ok(DatabaseStorage::Managed),
            path => Ok(DatabaseStorage::HostPath(PathBuf::from(path))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseModeError {
    #[error("value cannot be empty")]
    Empty,

    #[error("unknown service: {0}")]
    UnknownService(String),
}

/// Caller-supplied parameters for `start`
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Host port published for the application
    pub port: u16,

    /// Message queue source
    pub rmq: DependencyMode,

    /// Database source
    pub mongo: DependencyMode,

    /// Database storage when the database runs embedded
    pub db: DatabaseStorage,

    /// Host directory for logs
    pub logs: PathBuf,

    /// Host directory for the assetstore
    pub assetstore: PathBuf,

    /// Re-run provisioning even if the application container already exists
    pub provision: bool,

    /// Retry builds and provisioning until they succeed
    pub retry: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            rmq: DependencyMode::Embedded,
            mongo: DependencyMode::Embedded,
            db: DatabaseStorage::HostPath(PathBuf::from("~/.histomicstk/db")),
            logs: PathBuf::from("~/.histomicstk/logs"),
            assetstore: PathBuf::from("~/.histomicstk/assetstore"),
            provision: false,
            retry: false,
        }
    }
}

/// Caller-supplied parameters for `stop`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Delete containers and the network after stopping
    pub remove: bool,
}

// ============================================================================
// Runtime Models
// ============================================================================

/// Container state as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    /// Nothing to stop
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            ContainerState::Created | ContainerState::Exited | ContainerState::Dead
        )
    }
}

/// A container observed on the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub state: ContainerState,
}

impl ContainerSummary {
    /// Docker reports names with a leading slash
    pub fn has_name(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|n| n.trim_matches('/') == name.trim_matches('/'))
    }
}

/// A network observed on the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
}

/// Host path mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub source: String,
    pub target: String,
    pub mode: Option<String>,
}

impl Bind {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode: None,
        }
    }

    pub fn read_write(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            mode: Some("rw".to_string()),
            ..Self::new(source, target)
        }
    }
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            Some(mode) => write!(f, "{}:{}:{}", self.source, self.target, mode),
            None => write!(f, "{}:{}", self.source, self.target),
        }
    }
}

/// Legacy container link, rendered `container:alias`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub container: String,
    pub alias: String,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.alias)
    }
}

/// Everything needed to create one service container
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub env: BTreeMap<String, String>,
    pub binds: Vec<Bind>,
    /// Container port -> host port
    pub port_bindings: BTreeMap<u16, u16>,
    pub privileged: bool,
    pub restart_policy: RestartPolicy,
    pub links: Vec<Link>,
    /// Network joined at creation
    pub network: String,
    /// Aliases on that network
    pub aliases: Vec<String>,
}

/// Image build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    /// Tag applied to the built image
    pub tag: String,
    /// Build file name inside the context
    pub dockerfile: String,
    /// Directory sent as the build context
    pub context: PathBuf,
}

// ============================================================================
// Reports
// ============================================================================

/// What `start` did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    /// Services whose container was created during this run
    pub created: Vec<ServiceKey>,
    /// Services whose container was started during this run
    pub started: Vec<ServiceKey>,
    /// Provisioning attempts, `None` when provisioning did not run
    pub provision_attempts: Option<u32>,
}

/// Result of building one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub service: ServiceKey,
    pub attempts: u32,
}

/// Observed state of one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: ServiceKey,
    pub image: String,
    pub image_present: bool,
    pub container_name: String,
    pub container: Option<ContainerSummary>,
}

/// Observed state of the whole stack
#[derive(Debug, Clone, Serialize)]
pub struct StackStatus {
    pub network: String,
    pub network_present: bool,
    pub services: Vec<ServiceStatus>,
}
