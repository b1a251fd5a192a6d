//! Plugin descriptors and lifecycle data types

pub mod capability;
pub mod handle;
pub mod metrics;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};
use self::capability::Capability;

/// Static specification of a plugin deployment
///
/// Immutable once a load begins; the manager keeps the descriptor it was
/// given and reuses it verbatim for restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin identifier (e.g. "omni.echo-util")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Semver version string
    pub version: String,
    /// Short description
    #[serde(default)]
    pub description: Option<String>,
    /// How the plugin is executed
    pub deployment: DeploymentSpec,
    /// Environment variables passed to the plugin
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Resource limits applied at start
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Search tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Capabilities the plugin claims to provide (verified at handshake)
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Optional HTTP health endpoint for network-addressable plugins
    ///
    /// When set, the health checker issues `GET` requests here and treats
    /// any 2xx as healthy instead of using a raw TCP probe.
    #[serde(default)]
    pub health_url: Option<String>,
}

impl PluginDescriptor {
    /// Validate the descriptor before a load begins
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("descriptor id must not be empty".to_string()));
        }
        if self.id.contains(char::is_whitespace) {
            return Err(Error::Config(format!(
                "descriptor id '{}' must not contain whitespace",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "descriptor '{}' is missing a name",
                self.id
            )));
        }
        if self.version.trim().is_empty() {
            return Err(Error::Config(format!(
                "descriptor '{}' is missing a version",
                self.id
            )));
        }

        match &self.deployment {
            DeploymentSpec::Binary { path } => {
                if path.as_os_str().is_empty() {
                    return Err(Error::Config(format!(
                        "binary descriptor '{}' has an empty path",
                        self.id
                    )));
                }
            }
            DeploymentSpec::Container { image, .. } => {
                if image.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "container descriptor '{}' has an empty image",
                        self.id
                    )));
                }
            }
            DeploymentSpec::Remote { endpoint } => {
                if !endpoint.contains(':') {
                    return Err(Error::Config(format!(
                        "remote descriptor '{}' endpoint '{}' is not host:port",
                        self.id, endpoint
                    )));
                }
            }
        }

        Ok(())
    }

    /// The deployment kind of this descriptor
    #[must_use]
    pub const fn kind(&self) -> DeploymentKind {
        self.deployment.kind()
    }
}

/// How a plugin is executed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeploymentSpec {
    /// Local subprocess spawned from an executable
    Binary {
        /// Path to the plugin executable
        path: PathBuf,
    },
    /// Container started from an image
    Container {
        /// Image reference (e.g. "ghcr.io/omni/whisper-plugin:1.2")
        image: String,
        /// Port the plugin listens on inside the container
        #[serde(default = "default_container_port")]
        container_port: u16,
        /// Volume mounts in engine `src:dst[:opts]` syntax
        #[serde(default)]
        volumes: Vec<String>,
        /// Engine restart policy (e.g. "on-failure")
        #[serde(default)]
        restart_policy: Option<String>,
        /// Run as this user
        #[serde(default)]
        user: Option<String>,
        /// Working directory inside the container
        #[serde(default)]
        workdir: Option<String>,
        /// Run privileged
        #[serde(default)]
        privileged: bool,
    },
    /// Already-running service reached over the network
    Remote {
        /// `host:port` address of the running plugin
        endpoint: String,
    },
}

const fn default_container_port() -> u16 {
    7601
}

impl DeploymentSpec {
    /// The kind discriminant, used to pick a runtime strategy
    #[must_use]
    pub const fn kind(&self) -> DeploymentKind {
        match self {
            Self::Binary { .. } => DeploymentKind::Binary,
            Self::Container { .. } => DeploymentKind::Container,
            Self::Remote { .. } => DeploymentKind::Remote,
        }
    }
}

/// Deployment kind discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    /// Local subprocess
    Binary,
    /// Container
    Container,
    /// Remote network service
    Remote,
}

impl std::fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Container => write!(f, "container"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Resource limits applied when a plugin starts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes (container deployments)
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// CPU limit (container deployments)
    #[serde(default)]
    pub cpus: Option<f64>,
    /// How long the plugin may take to accept the handshake
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
}

/// Externally visible lifecycle state of a plugin id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Unknown to the manager
    NotLoaded,
    /// Load in progress; the id is claimed but not yet usable
    Loading,
    /// Started, handshaken, and initialized
    Running,
    /// Failure threshold reached; terminal until unload/restart
    Error,
    /// Unload in progress
    Stopping,
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLoaded => write!(f, "not loaded"),
            Self::Loading => write!(f, "loading"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Health of a single plugin as reported by the prober or an RPC check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the plugin answered its last probe
    pub healthy: bool,
    /// Textual status ("healthy", "unhealthy", "unknown", ...)
    pub status: String,
    /// Probe-specific details
    #[serde(default)]
    pub details: HashMap<String, String>,
    /// When the probe ran
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    /// A passing result
    #[must_use]
    pub fn healthy(status: impl Into<String>) -> Self {
        Self {
            healthy: true,
            status: status.into(),
            details: HashMap::new(),
            checked_at: Utc::now(),
        }
    }

    /// A failing result
    #[must_use]
    pub fn unhealthy(status: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status: status.into(),
            details: HashMap::new(),
            checked_at: Utc::now(),
        }
    }

    /// The result for a plugin that cannot be probed yet (no address)
    ///
    /// Distinguishes "not started" from "broken": unknown results never
    /// advance the failure-escalation counter.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            healthy: false,
            status: "unknown".to_string(),
            details: HashMap::new(),
            checked_at: Utc::now(),
        }
    }

    /// Attach a probe detail
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Whether this is the "cannot probe yet" result
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.status == "unknown"
    }
}

/// Metadata a plugin publishes about itself
///
/// Stored in the registry and returned by the plugin's `get_info` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Unique plugin identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Semver version string
    pub version: String,
    /// Short description
    #[serde(default)]
    pub description: Option<String>,
    /// Deployment kind
    pub kind: DeploymentKind,
    /// Search tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Capabilities the plugin provides
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl PluginInfo {
    /// Build registry metadata from a descriptor
    #[must_use]
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            description: descriptor.description.clone(),
            kind: descriptor.kind(),
            tags: descriptor.tags.clone(),
            capabilities: descriptor.capabilities.clone(),
        }
    }
}

/// Read-only view of a loaded plugin, handed out by the manager
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    /// Plugin id
    pub id: String,
    /// Lifecycle state
    pub status: PluginStatus,
    /// Process pid, container id, or connection id
    pub instance_id: Option<String>,
    /// The descriptor the plugin was loaded from
    pub descriptor: PluginDescriptor,
    /// Latest health result, if any probe has run
    pub health: Option<HealthStatus>,
    /// Consecutive failed probes since the last healthy one
    pub consecutive_failures: u32,
    /// When the last probe result was applied
    pub last_health_check: Option<DateTime<Utc>>,
}
