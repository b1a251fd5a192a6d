//! Host configuration
//!
//! Assembled in three layers: built-in defaults, an optional TOML file
//! (partial overlay), then `PYLON_*` environment variables. The result is a
//! set of plain config structs handed to the collaborators at construction
//! time — nothing reads configuration from process-wide state afterwards.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::manager::ManagerConfig;
use crate::rpc::HandshakeConfig;
use crate::runtime::{ContainerRuntimeConfig, ProcessRuntimeConfig, RemoteRuntimeConfig};
use crate::{Error, Result};
use self::file::PylonConfigFile;

/// Default port range handed to spawned plugins
const DEFAULT_PORT_START: u16 = 7600;
const DEFAULT_PORT_END: u16 = 7699;

/// Default registry TTL; 0 would disable expiry
const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(3600);

/// Port allocator range
#[derive(Debug, Clone, Copy)]
pub struct PortsConfig {
    /// First port of the range
    pub start: u16,
    /// Last port of the range (inclusive)
    pub end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_START,
            end: DEFAULT_PORT_END,
        }
    }
}

/// Fully assembled host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Descriptor directories the discovery source scans
    pub plugin_dirs: Vec<PathBuf>,
    /// Handshake compatibility material
    pub handshake: HandshakeConfig,
    /// Manager and background-loop tunables
    pub manager: ManagerConfig,
    /// Registry entry TTL (zero = never expires)
    pub registry_ttl: Duration,
    /// Port allocator range
    pub ports: PortsConfig,
    /// Local process runtime tunables
    pub process: ProcessRuntimeConfig,
    /// Container runtime tunables
    pub container: ContainerRuntimeConfig,
    /// Remote runtime tunables
    pub remote: RemoteRuntimeConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: crate::discovery::default_plugin_dirs(),
            handshake: HandshakeConfig::default(),
            manager: ManagerConfig::default(),
            registry_ttl: DEFAULT_REGISTRY_TTL,
            ports: PortsConfig::default(),
            process: ProcessRuntimeConfig::default(),
            container: ContainerRuntimeConfig::default(),
            remote: RemoteRuntimeConfig::default(),
        }
    }
}

impl HostConfig {
    /// Build the configuration: defaults → file overlay → env overrides
    ///
    /// `config_path` falls back to `~/.config/pylon/config.toml`.
    ///
    /// # Errors
    ///
    /// Returns file parse errors and [`Error::Config`] for invalid values
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self> {
        let parsed = match config_path {
            Some(path) => PylonConfigFile::load(path)?,
            None => file::default_config_path()
                .map(|path| PylonConfigFile::load(&path))
                .transpose()?
                .unwrap_or_default(),
        };

        let mut config = Self::default();
        config.apply_file(parsed);
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, parsed: PylonConfigFile) {
        if let Some(version) = parsed.handshake.protocol_version {
            self.handshake.protocol_version = version;
        }
        if let Some(key) = parsed.handshake.cookie_key {
            self.handshake.cookie_key = key;
        }
        if let Some(value) = parsed.handshake.cookie_value {
            self.handshake.cookie_value = value;
        }

        if let Some(ttl) = parsed.registry.ttl_secs {
            self.registry_ttl = Duration::from_secs(ttl);
        }

        if let Some(start) = parsed.ports.start {
            self.ports.start = start;
        }
        if let Some(end) = parsed.ports.end {
            self.ports.end = end;
        }

        let manager = parsed.manager;
        if let Some(threshold) = manager.failure_threshold {
            self.manager.failure_threshold = threshold;
        }
        if let Some(secs) = manager.health_interval_secs {
            self.manager.health_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = manager.escalation_interval_secs {
            self.manager.escalation_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = manager.discovery_interval_secs {
            self.manager.discovery_interval = Duration::from_secs(secs);
        }
        if let Some(auto_load) = manager.auto_load {
            self.manager.auto_load = auto_load;
        }
        if let Some(ms) = manager.settle_delay_ms {
            self.manager.settle_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = manager.probe_timeout_ms {
            self.manager.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = manager.unload_timeout_secs {
            self.manager.unload_timeout = Duration::from_secs(secs);
        }

        if let Some(dirs) = parsed.plugins.dirs {
            self.plugin_dirs = dirs;
        }

        if let Some(secs) = parsed.process.startup_timeout_secs {
            self.process.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed.process.stop_grace_secs {
            self.process.stop_grace = Duration::from_secs(secs);
        }

        if let Some(engine) = parsed.container.engine {
            self.container.engine = Some(engine);
        }
        if let Some(secs) = parsed.container.stop_grace_secs {
            self.container.stop_grace_secs = secs;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("PYLON_COOKIE_VALUE") {
            self.handshake.cookie_value = value;
        }
        if let Some(version) = std::env::var("PYLON_PROTOCOL_VERSION")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.handshake.protocol_version = version;
        }
        if let Ok(dir) = std::env::var("PYLON_PLUGIN_DIR") {
            self.plugin_dirs.push(PathBuf::from(dir));
        }
        if let Ok(value) = std::env::var("PYLON_AUTO_LOAD") {
            self.manager.auto_load = value == "1" || value.eq_ignore_ascii_case("true");
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ports.start == 0 || self.ports.end < self.ports.start {
            return Err(Error::Config(format!(
                "invalid port range {}..={}",
                self.ports.start, self.ports.end
            )));
        }
        if self.manager.failure_threshold == 0 {
            return Err(Error::Config(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.handshake.cookie_key.trim().is_empty() {
            return Err(Error::Config("cookie_key must not be empty".to_string()));
        }
        Ok(())
    }
}
