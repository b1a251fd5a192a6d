//! Local subprocess runtime
//!
//! Spawns plugin executables, hands each one a freshly allocated loopback
//! address plus the handshake material via environment variables, then
//! dials until the plugin accepts the handshake. Stop is graceful first
//! (SIGTERM via the system `kill`, the same shell-out idiom used for other
//! platform services), forced after a grace period.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::time::timeout;

use super::{ProbeTarget, Runtime, StartedPlugin};
use crate::ports::PortAllocator;
use crate::rpc::{HandshakeConfig, RpcPluginHandle};
use crate::plugin::handle::PluginHandle;
use crate::plugin::{DeploymentKind, DeploymentSpec, PluginDescriptor};
use crate::{Error, Result};

/// Env var carrying the address the plugin must listen on
pub const ADDR_ENV: &str = "PYLON_PLUGIN_ADDR";
/// Env var carrying the protocol version the host speaks
pub const PROTOCOL_ENV: &str = "PYLON_PROTOCOL_VERSION";

/// Delay between dial attempts while the plugin is starting up
const DIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables for the local process runtime
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Window for the plugin to accept the handshake after spawn
    /// (overridable per descriptor via `resources.startup_timeout_secs`)
    pub startup_timeout: Duration,
    /// Per-dial connect timeout
    pub connect_timeout: Duration,
    /// Default timeout for RPC calls on the resulting client
    pub call_timeout: Duration,
    /// How long a terminated process may take to exit before force-kill
    pub stop_grace: Duration,
    /// Port allocation attempts
    pub allocate_retries: u32,
    /// Base delay for port allocation backoff
    pub allocate_base_delay: Duration,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            allocate_retries: 3,
            allocate_base_delay: Duration::from_millis(100),
        }
    }
}

struct SpawnedChild {
    child: Child,
    port: u16,
}

/// Runtime for `binary` deployments
pub struct LocalProcessRuntime {
    handshake: HandshakeConfig,
    ports: Arc<PortAllocator>,
    config: ProcessRuntimeConfig,
    children: RwLock<HashMap<String, SpawnedChild>>,
}

impl std::fmt::Debug for LocalProcessRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LocalProcessRuntime {
    /// Create the runtime with a shared port allocator
    #[must_use]
    pub fn new(
        handshake: HandshakeConfig,
        ports: Arc<PortAllocator>,
        config: ProcessRuntimeConfig,
    ) -> Self {
        Self {
            handshake,
            ports,
            config,
            children: RwLock::new(HashMap::new()),
        }
    }

    fn verify_executable(path: &Path) -> Result<()> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            Error::Config(format!("plugin binary {} is not readable: {e}", path.display()))
        })?;

        if !metadata.is_file() {
            return Err(Error::Config(format!(
                "plugin binary {} is not a regular file",
                path.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(Error::Config(format!(
                    "plugin binary {} is not executable",
                    path.display()
                )));
            }
        }

        Ok(())
    }

    /// Dial the spawned plugin until it answers the handshake or the
    /// deadline passes; handshake rejections abort immediately
    async fn dial(&self, id: &str, addr: &str, deadline: Duration) -> Result<RpcPluginHandle> {
        let started = tokio::time::Instant::now();
        loop {
            match RpcPluginHandle::connect(
                addr,
                &self.handshake,
                self.config.connect_timeout,
                self.config.call_timeout,
            )
            .await
            {
                Ok(handle) => return Ok(handle),
                // A rejected or mismatched handshake will not fix itself
                Err(e @ Error::Handshake(_)) => return Err(e),
                Err(e) => {
                    if started.elapsed() >= deadline {
                        return Err(Error::Process(format!(
                            "plugin '{id}' did not accept the handshake within {deadline:?}: {e}"
                        )));
                    }
                    tokio::time::sleep(DIAL_INTERVAL).await;
                }
            }
        }
    }

    async fn kill_and_release(&self, id: &str, mut child: Child, port: u16) {
        if let Err(e) = child.kill().await {
            tracing::warn!(id, error = %e, "failed to kill plugin process");
        }
        if let Err(e) = self.ports.release_port(port).await {
            tracing::warn!(id, port, error = %e, "failed to release plugin port");
        }
    }
}

#[async_trait]
impl Runtime for LocalProcessRuntime {
    async fn start(&self, descriptor: &PluginDescriptor) -> Result<StartedPlugin> {
        let DeploymentSpec::Binary { path } = &descriptor.deployment else {
            return Err(Error::Config(format!(
                "descriptor '{}' is not a binary deployment",
                descriptor.id
            )));
        };

        Self::verify_executable(path)?;

        if self.children.read().await.contains_key(&descriptor.id) {
            return Err(Error::Process(format!(
                "a process for '{}' is already running",
                descriptor.id
            )));
        }

        let port = self
            .ports
            .allocate_with_retry(
                &descriptor.id,
                self.config.allocate_retries,
                self.config.allocate_base_delay,
            )
            .await?;
        let addr = format!("127.0.0.1:{port}");

        let mut child = match Command::new(path)
            .envs(&descriptor.env)
            .env(ADDR_ENV, &addr)
            .env(PROTOCOL_ENV, self.handshake.protocol_version.to_string())
            .env(&self.handshake.cookie_key, &self.handshake.cookie_value)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let _ = self.ports.release_port(port).await;
                return Err(Error::Process(format!(
                    "failed to spawn plugin '{}' from {}: {e}",
                    descriptor.id,
                    path.display()
                )));
            }
        };

        let pid = child.id();
        tracing::info!(
            id = %descriptor.id,
            pid,
            addr = %addr,
            "spawned plugin process"
        );

        // Forward plugin stderr into the host log
        if let Some(stderr) = child.stderr.take() {
            let id = descriptor.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin = %id, line = %line, "plugin stderr");
                }
            });
        }

        let deadline = descriptor
            .resources
            .startup_timeout_secs
            .map_or(self.config.startup_timeout, Duration::from_secs);

        let handle = match self.dial(&descriptor.id, &addr, deadline).await {
            Ok(handle) => handle,
            Err(e) => {
                self.kill_and_release(&descriptor.id, child, port).await;
                return Err(e);
            }
        };

        // Fail fast on a client that connected but cannot answer
        if let Err(e) = handle.ping().await {
            handle.close().await;
            self.kill_and_release(&descriptor.id, child, port).await;
            return Err(Error::Communication(format!(
                "plugin '{}' accepted the handshake but failed the liveness ping: {e}",
                descriptor.id
            )));
        }

        let instance_id = pid.map_or_else(|| format!("pid-unknown:{port}"), |p| p.to_string());

        self.children
            .write()
            .await
            .insert(descriptor.id.clone(), SpawnedChild { child, port });

        let probe = descriptor
            .health_url
            .clone()
            .map_or(ProbeTarget::Tcp(addr), ProbeTarget::Http);

        Ok(StartedPlugin {
            handle: Arc::new(handle),
            instance_id,
            probe,
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let Some(mut spawned) = self.children.write().await.remove(id) else {
            return Err(Error::NotFound(format!(
                "no process is tracked for plugin '{id}'"
            )));
        };

        // Graceful terminate first, force-kill after the grace period
        #[cfg(unix)]
        if let Some(pid) = spawned.child.id() {
            let output = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .output()
                .await;
            if let Err(e) = output {
                tracing::warn!(id, pid, error = %e, "failed to send SIGTERM");
            }
        }

        match timeout(self.config.stop_grace, spawned.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(id, %status, "plugin process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(id, error = %e, "failed waiting for plugin process");
            }
            Err(_) => {
                tracing::warn!(id, "plugin process ignored SIGTERM, force-killing");
                spawned
                    .child
                    .kill()
                    .await
                    .map_err(|e| Error::Process(format!("failed to kill plugin '{id}': {e}")))?;
            }
        }

        if let Err(e) = self.ports.release_port(spawned.port).await {
            tracing::warn!(id, port = spawned.port, error = %e, "failed to release plugin port");
        }

        Ok(())
    }

    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Binary
    }

    async fn health_check(&self) -> Result<()> {
        // Spawning needs nothing beyond the host itself
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let children: Vec<(String, SpawnedChild)> =
            self.children.write().await.drain().collect();

        for (id, mut spawned) in children {
            tracing::info!(id = %id, "stopping plugin process on shutdown");
            if let Err(e) = spawned.child.kill().await {
                tracing::warn!(id = %id, error = %e, "failed to kill plugin process");
            }
            if let Err(e) = self.ports.release_port(spawned.port).await {
                tracing::warn!(id = %id, error = %e, "failed to release plugin port");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;

    use crate::plugin::ResourceLimits;

    fn runtime(config: ProcessRuntimeConfig) -> LocalProcessRuntime {
        let ports = Arc::new(PortAllocator::new(47300, 47320).unwrap());
        LocalProcessRuntime::new(HandshakeConfig::default(), ports, config)
    }

    fn descriptor(id: &str, path: &str) -> PluginDescriptor {
        PluginDescriptor {
            id: id.to_string(),
            name: "Echo".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            deployment: DeploymentSpec::Binary {
                path: PathBuf::from(path),
            },
            env: StdHashMap::new(),
            resources: ResourceLimits::default(),
            tags: vec![],
            capabilities: vec![],
            health_url: None,
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_config_error() {
        let runtime = runtime(ProcessRuntimeConfig::default());
        let desc = descriptor("omni.echo", "/nonexistent/echo-util");

        let err = runtime.start(&desc).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_executable_file_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let runtime = runtime(ProcessRuntimeConfig::default());
        let desc = descriptor("omni.echo", path.to_str().unwrap());

        let err = runtime.start(&desc).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_binary_is_killed_and_its_port_released() {
        // `sleep` never answers the handshake; the runtime must reap it
        let config = ProcessRuntimeConfig {
            startup_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(200),
            ..ProcessRuntimeConfig::default()
        };
        let ports = Arc::new(PortAllocator::new(47330, 47340).unwrap());
        let runtime = LocalProcessRuntime::new(
            HandshakeConfig::default(),
            Arc::clone(&ports),
            config,
        );

        let mut desc = descriptor("omni.sleeper", "/bin/sleep");
        desc.resources.startup_timeout_secs = None;
        // sleep needs an argument; spawning without one exits immediately,
        // which is equally a failed handshake
        let err = runtime.start(&desc).await.unwrap_err();
        assert!(matches!(err, Error::Process(_)), "got {err}");

        // Nothing tracked, nothing allocated
        assert!(runtime.children.read().await.is_empty());
        assert_eq!(ports.stats().await.allocated, 0);
    }

    #[tokio::test]
    async fn stop_unknown_id_is_not_found() {
        let runtime = runtime(ProcessRuntimeConfig::default());
        let err = runtime.stop("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn wrong_deployment_kind_is_rejected() {
        let runtime = runtime(ProcessRuntimeConfig::default());
        let mut desc = descriptor("omni.remote", "/bin/true");
        desc.deployment = DeploymentSpec::Remote {
            endpoint: "127.0.0.1:9".to_string(),
        };

        let err = runtime.start(&desc).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err}");
    }
}
