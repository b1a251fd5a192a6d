//! Plugin discovery - descriptor sources the manager can poll
//!
//! The manager only depends on the [`Discovery`] trait; the shipped
//! implementation scans directories for `*.plugin.json` descriptor files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::Result;
use crate::plugin::PluginDescriptor;

/// Descriptor file suffix the directory scanner looks for
pub const DESCRIPTOR_SUFFIX: &str = ".plugin.json";

/// A source of plugin descriptors, polled by the manager's discovery loop
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Return every descriptor currently visible to this source
    async fn discover(&self) -> Result<Vec<PluginDescriptor>>;
}

/// Scans directories for `*.plugin.json` descriptor files
#[derive(Debug, Clone)]
pub struct DirectoryDiscovery {
    dirs: Vec<PathBuf>,
}

impl DirectoryDiscovery {
    /// Create a scanner over the given directories
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

#[async_trait]
impl Discovery for DirectoryDiscovery {
    async fn discover(&self) -> Result<Vec<PluginDescriptor>> {
        Ok(scan_descriptor_dirs(&self.dirs))
    }
}

/// Scan directories for descriptor files
///
/// Unreadable directories and malformed or invalid descriptors are logged
/// and skipped; one bad file never hides the rest.
#[must_use]
pub fn scan_descriptor_dirs(dirs: &[PathBuf]) -> Vec<PluginDescriptor> {
    let mut results = Vec::new();

    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "descriptor directory does not exist, skipping");
            continue;
        }

        let Ok(entries) = std::fs::read_dir(dir) else {
            tracing::warn!(path = %dir.display(), "failed to read descriptor directory");
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(DESCRIPTOR_SUFFIX))
            {
                continue;
            }

            if let Some(descriptor) = load_descriptor(&path) {
                tracing::debug!(
                    id = %descriptor.id,
                    path = %path.display(),
                    "discovered plugin descriptor"
                );
                results.push(descriptor);
            }
        }
    }

    results
}

/// Load and validate a single descriptor file
fn load_descriptor(path: &Path) -> Option<PluginDescriptor> {
    let content = std::fs::read_to_string(path).ok()?;
    let descriptor = match serde_json::from_str::<PluginDescriptor>(&content) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse plugin descriptor"
            );
            return None;
        }
    };

    if let Err(e) = descriptor.validate() {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "discovered descriptor is invalid, skipping"
        );
        return None;
    }

    Some(descriptor)
}

/// Default descriptor search directories
#[must_use]
pub fn default_plugin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        dirs.push(config_dir.join("pylon").join("plugins"));
    }

    if let Some(data_dir) = directories::BaseDirs::new().map(|d| d.data_dir().to_path_buf()) {
        dirs.push(data_dir.join("pylon").join("plugins"));
    }

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "id": "omni.echo",
        "name": "Echo",
        "version": "1.0.0",
        "deployment": { "kind": "binary", "path": "/usr/local/bin/echo-util" }
    }"#;

    #[tokio::test]
    async fn discover_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = DirectoryDiscovery::new(vec![dir.path().to_path_buf()]);
        assert!(discovery.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discover_valid_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.plugin.json"), VALID).unwrap();

        let discovery = DirectoryDiscovery::new(vec![dir.path().to_path_buf()]);
        let found = discovery.discover().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "omni.echo");
    }

    #[test]
    fn skip_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.plugin.json"), "not valid json").unwrap();
        assert!(scan_descriptor_dirs(&[dir.path().to_path_buf()]).is_empty());
    }

    #[test]
    fn skip_invalid_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        // Parses but fails validation: remote endpoint without a port
        let invalid = r#"{
            "id": "omni.bad",
            "name": "Bad",
            "version": "1.0.0",
            "deployment": { "kind": "remote", "endpoint": "no-port" }
        }"#;
        std::fs::write(dir.path().join("bad.plugin.json"), invalid).unwrap();
        assert!(scan_descriptor_dirs(&[dir.path().to_path_buf()]).is_empty());
    }

    #[test]
    fn skip_files_without_the_descriptor_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.md"), "hello").unwrap();
        std::fs::write(dir.path().join("echo.plugin.json"), VALID).unwrap();

        let found = scan_descriptor_dirs(&[dir.path().to_path_buf()]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn skip_nonexistent_dir() {
        assert!(scan_descriptor_dirs(&[PathBuf::from("/nonexistent/path")]).is_empty());
    }

    #[test]
    fn default_dirs_not_empty() {
        assert!(!default_plugin_dirs().is_empty());
    }
}
