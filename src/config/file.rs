//! TOML configuration file loading
//!
//! Supports `~/.config/pylon/config.toml` as a persistent config source.
//! All fields are optional — the file is a partial overlay on top of
//! defaults.

use std::path::PathBuf;

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct PylonConfigFile {
    /// Handshake compatibility material
    #[serde(default)]
    pub handshake: HandshakeFileConfig,

    /// Registry behavior
    #[serde(default)]
    pub registry: RegistryFileConfig,

    /// Port allocator range
    #[serde(default)]
    pub ports: PortsFileConfig,

    /// Manager and background-loop tunables
    #[serde(default)]
    pub manager: ManagerFileConfig,

    /// Plugin discovery
    #[serde(default)]
    pub plugins: PluginsFileConfig,

    /// Local process runtime
    #[serde(default)]
    pub process: ProcessFileConfig,

    /// Container runtime
    #[serde(default)]
    pub container: ContainerFileConfig,
}

/// Handshake overrides
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeFileConfig {
    /// Protocol version both sides must speak
    pub protocol_version: Option<u32>,

    /// Cookie variable name
    pub cookie_key: Option<String>,

    /// Cookie value
    pub cookie_value: Option<String>,
}

/// Registry overrides
#[derive(Debug, Default, Deserialize)]
pub struct RegistryFileConfig {
    /// Entry TTL in seconds; 0 disables expiry
    pub ttl_secs: Option<u64>,
}

/// Port range overrides
#[derive(Debug, Default, Deserialize)]
pub struct PortsFileConfig {
    /// First port of the range
    pub start: Option<u16>,

    /// Last port of the range (inclusive)
    pub end: Option<u16>,
}

/// Manager overrides
#[derive(Debug, Default, Deserialize)]
pub struct ManagerFileConfig {
    /// Consecutive unhealthy probes before Error
    pub failure_threshold: Option<u32>,

    /// Reachability probe period in seconds
    pub health_interval_secs: Option<u64>,

    /// Escalation evaluation period in seconds
    pub escalation_interval_secs: Option<u64>,

    /// Discovery poll period in seconds
    pub discovery_interval_secs: Option<u64>,

    /// Load newly discovered plugins automatically
    pub auto_load: Option<bool>,

    /// Restart settle delay in milliseconds
    pub settle_delay_ms: Option<u64>,

    /// Per-probe timeout in milliseconds
    pub probe_timeout_ms: Option<u64>,

    /// Per-plugin teardown bound in seconds
    pub unload_timeout_secs: Option<u64>,
}

/// Plugin discovery overrides
#[derive(Debug, Default, Deserialize)]
pub struct PluginsFileConfig {
    /// Descriptor directories to scan
    pub dirs: Option<Vec<PathBuf>>,
}

/// Local process runtime overrides
#[derive(Debug, Default, Deserialize)]
pub struct ProcessFileConfig {
    /// Handshake window after spawn, in seconds
    pub startup_timeout_secs: Option<u64>,

    /// Grace period before force-kill, in seconds
    pub stop_grace_secs: Option<u64>,
}

/// Container runtime overrides
#[derive(Debug, Default, Deserialize)]
pub struct ContainerFileConfig {
    /// Engine binary (docker, podman, or a path)
    pub engine: Option<PathBuf>,

    /// Seconds the engine waits for a graceful stop
    pub stop_grace_secs: Option<u64>,
}

impl PylonConfigFile {
    /// Load a config file, returning defaults if it does not exist
    ///
    /// # Errors
    ///
    /// Returns [`Error::Toml`] for a file that exists but does not parse,
    /// [`Error::Io`] for one that exists but cannot be read
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(Error::Io)?;
        let parsed = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(parsed)
    }
}

/// Default config file location (`~/.config/pylon/config.toml`)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("pylon").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let parsed = PylonConfigFile::load(std::path::Path::new("/nonexistent/config.toml"))
            .unwrap();
        assert!(parsed.handshake.cookie_value.is_none());
        assert!(parsed.ports.start.is_none());
    }

    #[test]
    fn partial_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[handshake]
cookie_value = "prod-cookie"

[ports]
start = 7600
end = 7699

[manager]
failure_threshold = 5
auto_load = true
"#,
        )
        .unwrap();

        let parsed = PylonConfigFile::load(&path).unwrap();
        assert_eq!(parsed.handshake.cookie_value.as_deref(), Some("prod-cookie"));
        assert_eq!(parsed.handshake.protocol_version, None);
        assert_eq!(parsed.ports.start, Some(7600));
        assert_eq!(parsed.manager.failure_threshold, Some(5));
        assert_eq!(parsed.manager.auto_load, Some(true));
        assert!(parsed.registry.ttl_secs.is_none());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        assert!(PylonConfigFile::load(&path).is_err());
    }
}
