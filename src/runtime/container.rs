//! Container runtime
//!
//! Drives a container engine (docker or podman) through its CLI. Engine
//! reachability is verified on every call, never cached — a daemon that
//! died between calls surfaces as the failing operation, not as a stale
//! success.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::timeout;

use super::process::{ADDR_ENV, PROTOCOL_ENV};
use super::{ProbeTarget, Runtime, StartedPlugin};
use crate::plugin::handle::PluginHandle;
use crate::plugin::{DeploymentKind, DeploymentSpec, PluginDescriptor};
use crate::ports::PortAllocator;
use crate::rpc::{HandshakeConfig, RpcPluginHandle};
use crate::{Error, Result};

/// Label applied to every container this runtime starts
const ID_LABEL: &str = "pylon.plugin.id";

/// Delay between dial attempts while the container is starting up
const DIAL_INTERVAL: Duration = Duration::from_millis(250);

/// Tunables for the container runtime
#[derive(Debug, Clone)]
pub struct ContainerRuntimeConfig {
    /// Engine binary; auto-detected (docker, then podman) when `None`
    pub engine: Option<PathBuf>,
    /// Timeout for each engine CLI invocation
    pub op_timeout: Duration,
    /// Seconds the engine waits for a graceful stop before killing
    pub stop_grace_secs: u64,
    /// Window for the plugin to accept the handshake after `run`
    pub startup_timeout: Duration,
    /// Per-dial connect timeout
    pub connect_timeout: Duration,
    /// Default timeout for RPC calls on the resulting client
    pub call_timeout: Duration,
    /// Port allocation attempts
    pub allocate_retries: u32,
    /// Base delay for port allocation backoff
    pub allocate_base_delay: Duration,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            engine: None,
            op_timeout: Duration::from_secs(30),
            stop_grace_secs: 10,
            startup_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            allocate_retries: 3,
            allocate_base_delay: Duration::from_millis(100),
        }
    }
}

/// Runtime for `container` deployments
pub struct ContainerRuntime {
    engine: PathBuf,
    handshake: HandshakeConfig,
    ports: Arc<PortAllocator>,
    config: ContainerRuntimeConfig,
    /// plugin id → (container id, host port)
    containers: RwLock<HashMap<String, (String, u16)>>,
}

impl std::fmt::Debug for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRuntime")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl ContainerRuntime {
    /// Create the runtime, resolving the engine binary
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no engine binary can be found
    pub fn new(
        handshake: HandshakeConfig,
        ports: Arc<PortAllocator>,
        config: ContainerRuntimeConfig,
    ) -> Result<Self> {
        let engine = match &config.engine {
            Some(path) => which::which(path)
                .map_err(|e| Error::Config(format!("container engine {}: {e}", path.display())))?,
            None => which::which("docker")
                .or_else(|_| which::which("podman"))
                .map_err(|_| {
                    Error::Config("no container engine found (tried docker, podman)".to_string())
                })?,
        };

        Ok(Self {
            engine,
            handshake,
            ports,
            config,
            containers: RwLock::new(HashMap::new()),
        })
    }

    /// Run one engine CLI command, returning trimmed stdout
    async fn run_engine(&self, args: &[String]) -> Result<String> {
        let output = timeout(
            self.config.op_timeout,
            Command::new(&self.engine).args(args).output(),
        )
        .await
        .map_err(|_| {
            Error::Process(format!(
                "{} {} timed out after {:?}",
                self.engine.display(),
                args.join(" "),
                self.config.op_timeout
            ))
        })?
        .map_err(|e| Error::Process(format!("failed to run {}: {e}", self.engine.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Process(format!(
                "{} {} failed: {}",
                self.engine.display(),
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Verify the engine daemon answers; called before every operation
    async fn engine_check(&self) -> Result<()> {
        self.run_engine(&["version".to_string()]).await.map(|_| ())
    }

    /// Make the image available locally, pulling it if needed
    async fn resolve_image(&self, image: &str) -> Result<()> {
        let inspect = vec![
            "image".to_string(),
            "inspect".to_string(),
            image.to_string(),
        ];
        if self.run_engine(&inspect).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image, "image not present locally, pulling");
        self.run_engine(&["pull".to_string(), image.to_string()])
            .await
            .map(|_| ())
    }

    /// Ask the engine whether a container is currently running
    async fn container_running(&self, container_id: &str) -> Result<bool> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            container_id.to_string(),
        ];
        let state = self.run_engine(&args).await?;
        Ok(state == "true")
    }

    async fn remove_container(&self, container_id: &str) {
        let args = vec![
            "rm".to_string(),
            "-f".to_string(),
            container_id.to_string(),
        ];
        if let Err(e) = self.run_engine(&args).await {
            tracing::warn!(container = container_id, error = %e, "failed to remove container");
        }
    }

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
                Err(e @ Error::Handshake(_)) => return Err(e),
                Err(e) => {
                    if started.elapsed() >= deadline {
                        return Err(Error::Process(format!(
                            "container plugin '{id}' did not accept the handshake within {deadline:?}: {e}"
                        )));
                    }
                    tokio::time::sleep(DIAL_INTERVAL).await;
                }
            }
        }
    }
}

/// Build the `run` argument vector for a container deployment
///
/// Split out of the runtime so the mapping from descriptor fields to engine
/// flags is testable without an engine.
fn run_args(
    descriptor: &PluginDescriptor,
    handshake: &HandshakeConfig,
    host_port: u16,
) -> Result<Vec<String>> {
    let DeploymentSpec::Container {
        image,
        container_port,
        volumes,
        restart_policy,
        user,
        workdir,
        privileged,
    } = &descriptor.deployment
    else {
        return Err(Error::Config(format!(
            "descriptor '{}' is not a container deployment",
            descriptor.id
        )));
    };

    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--label".to_string(),
        format!("{ID_LABEL}={}", descriptor.id),
        "-p".to_string(),
        format!("127.0.0.1:{host_port}:{container_port}"),
    ];

    for volume in volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    if let Some(policy) = restart_policy {
        args.push("--restart".to_string());
        args.push(policy.clone());
    }
    if let Some(user) = user {
        args.push("--user".to_string());
        args.push(user.clone());
    }
    if let Some(workdir) = workdir {
        args.push("--workdir".to_string());
        args.push(workdir.clone());
    }
    if *privileged {
        args.push("--privileged".to_string());
    }
    if let Some(memory_mb) = descriptor.resources.memory_mb {
        args.push("--memory".to_string());
        args.push(format!("{memory_mb}m"));
    }
    if let Some(cpus) = descriptor.resources.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }

    // The plugin inside the container binds its own port; the handshake
    // material arrives the same way as for local processes
    for (key, value) in &descriptor.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("-e".to_string());
    args.push(format!("{ADDR_ENV}=0.0.0.0:{container_port}"));
    args.push("-e".to_string());
    args.push(format!("{PROTOCOL_ENV}={}", handshake.protocol_version));
    args.push("-e".to_string());
    args.push(format!("{}={}", handshake.cookie_key, handshake.cookie_value));

    args.push(image.clone());
    Ok(args)
}

#[async_trait]
impl Runtime for ContainerRuntime {
    async fn start(&self, descriptor: &PluginDescriptor) -> Result<StartedPlugin> {
        let DeploymentSpec::Container { image, .. } = &descriptor.deployment else {
            return Err(Error::Config(format!(
                "descriptor '{}' is not a container deployment",
                descriptor.id
            )));
        };

        self.engine_check().await?;

        if self.containers.read().await.contains_key(&descriptor.id) {
            return Err(Error::Process(format!(
                "a container for '{}' is already running",
                descriptor.id
            )));
        }

        self.resolve_image(image).await?;

        let host_port = self
            .ports
            .allocate_with_retry(
                &descriptor.id,
                self.config.allocate_retries,
                self.config.allocate_base_delay,
            )
            .await?;
        let addr = format!("127.0.0.1:{host_port}");

        let args = run_args(descriptor, &self.handshake, host_port)?;
        let container_id = match self.run_engine(&args).await {
            Ok(id) => id,
            Err(e) => {
                let _ = self.ports.release_port(host_port).await;
                return Err(e);
            }
        };

        tracing::info!(
            id = %descriptor.id,
            container = %container_id,
            addr = %addr,
            "started plugin container"
        );

        let deadline = descriptor
            .resources
            .startup_timeout_secs
            .map_or(self.config.startup_timeout, Duration::from_secs);

        let handle = match self.dial(&descriptor.id, &addr, deadline).await {
            Ok(handle) => handle,
            Err(e) => {
                self.remove_container(&container_id).await;
                let _ = self.ports.release_port(host_port).await;
                return Err(e);
            }
        };

        if let Err(e) = handle.ping().await {
            handle.close().await;
            self.remove_container(&container_id).await;
            let _ = self.ports.release_port(host_port).await;
            return Err(Error::Communication(format!(
                "container plugin '{}' accepted the handshake but failed the liveness ping: {e}",
                descriptor.id
            )));
        }

        let instance_id = container_id.chars().take(12).collect::<String>();
        self.containers
            .write()
            .await
            .insert(descriptor.id.clone(), (container_id, host_port));

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
        self.engine_check().await?;

        let Some((container_id, host_port)) = self.containers.write().await.remove(id) else {
            return Err(Error::NotFound(format!(
                "no container is tracked for plugin '{id}'"
            )));
        };

        // Graceful stop, then forced removal either way
        let stop_args = vec![
            "stop".to_string(),
            "-t".to_string(),
            self.config.stop_grace_secs.to_string(),
            container_id.clone(),
        ];
        if let Err(e) = self.run_engine(&stop_args).await {
            tracing::warn!(id, container = %container_id, error = %e, "graceful stop failed");
        }
        self.remove_container(&container_id).await;

        if let Err(e) = self.ports.release_port(host_port).await {
            tracing::warn!(id, port = host_port, error = %e, "failed to release plugin port");
        }

        Ok(())
    }

    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Container
    }

    async fn health_check(&self) -> Result<()> {
        self.engine_check().await?;

        // Every tracked container must still be running per the engine
        let tracked: Vec<(String, String)> = {
            let containers = self.containers.read().await;
            containers
                .iter()
                .map(|(id, (container_id, _))| (id.clone(), container_id.clone()))
                .collect()
        };
        for (id, container_id) in tracked {
            if !self.container_running(&container_id).await? {
                return Err(Error::Process(format!(
                    "container for plugin '{id}' is no longer running"
                )));
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let containers: Vec<(String, (String, u16))> =
            self.containers.write().await.drain().collect();

        for (id, (container_id, host_port)) in containers {
            tracing::info!(id = %id, container = %container_id, "removing plugin container on shutdown");
            self.remove_container(&container_id).await;
            if let Err(e) = self.ports.release_port(host_port).await {
                tracing::warn!(id = %id, error = %e, "failed to release plugin port");
            }
        }
        Ok(())
    }
}
