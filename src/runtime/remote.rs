//! Remote service runtime
//!
//! Connects to plugins that are already running somewhere else — the same
//! handshake, the same client contract, but no process management at all.
//! Stop only disconnects; the remote operator owns the lifetime.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ProbeTarget, Runtime, StartedPlugin};
use crate::plugin::handle::PluginHandle;
use crate::plugin::{DeploymentKind, DeploymentSpec, PluginDescriptor};
use crate::rpc::{HandshakeConfig, RpcPluginHandle};
use crate::{Error, Result};

/// Tunables for the remote service runtime
#[derive(Debug, Clone)]
pub struct RemoteRuntimeConfig {
    /// Connect timeout for the initial dial
    pub connect_timeout: Duration,
    /// Default timeout for RPC calls on the resulting client
    pub call_timeout: Duration,
}

impl Default for RemoteRuntimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Runtime for `remote` deployments
pub struct RemoteServiceRuntime {
    handshake: HandshakeConfig,
    config: RemoteRuntimeConfig,
    /// plugin id → endpoint, for bookkeeping and logs only
    sessions: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for RemoteServiceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServiceRuntime").finish_non_exhaustive()
    }
}

impl RemoteServiceRuntime {
    /// Create the runtime
    #[must_use]
    pub fn new(handshake: HandshakeConfig, config: RemoteRuntimeConfig) -> Self {
        Self {
            handshake,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Runtime for RemoteServiceRuntime {
    async fn start(&self, descriptor: &PluginDescriptor) -> Result<StartedPlugin> {
        let DeploymentSpec::Remote { endpoint } = &descriptor.deployment else {
            return Err(Error::Config(format!(
                "descriptor '{}' is not a remote deployment",
                descriptor.id
            )));
        };

        if self.sessions.read().await.contains_key(&descriptor.id) {
            return Err(Error::Process(format!(
                "a connection for '{}' is already open",
                descriptor.id
            )));
        }

        let handle = RpcPluginHandle::connect(
            endpoint,
            &self.handshake,
            self.config.connect_timeout,
            self.config.call_timeout,
        )
        .await?;

        if let Err(e) = handle.ping().await {
            handle.close().await;
            return Err(Error::Communication(format!(
                "remote plugin '{}' accepted the handshake but failed the liveness ping: {e}",
                descriptor.id
            )));
        }

        tracing::info!(id = %descriptor.id, endpoint = %endpoint, "connected to remote plugin");

        // A fresh connection id per start, so restarts are observable
        let instance_id = format!("{endpoint}#{}", uuid::Uuid::new_v4());

        self.sessions
            .write()
            .await
            .insert(descriptor.id.clone(), endpoint.clone());

        let probe = descriptor
            .health_url
            .clone()
            .map_or_else(|| ProbeTarget::Tcp(endpoint.clone()), ProbeTarget::Http);

        Ok(StartedPlugin {
            handle: std::sync::Arc::new(handle),
            instance_id,
            probe,
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let Some(endpoint) = self.sessions.write().await.remove(id) else {
            return Err(Error::NotFound(format!(
                "no connection is tracked for plugin '{id}'"
            )));
        };

        // Disconnect only; the remote process is not ours to manage
        tracing::info!(id, endpoint = %endpoint, "disconnected from remote plugin");
        Ok(())
    }

    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Remote
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.sessions.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;

    use crate::plugin::ResourceLimits;

    fn remote_descriptor(endpoint: &str) -> PluginDescriptor {
        PluginDescriptor {
            id: "omni.claude".to_string(),
            name: "Claude Router".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            deployment: DeploymentSpec::Remote {
                endpoint: endpoint.to_string(),
            },
            env: StdHashMap::new(),
            resources: ResourceLimits::default(),
            tags: vec![],
            capabilities: vec![],
            health_url: None,
        }
    }

    #[tokio::test]
    async fn wrong_deployment_kind_is_rejected() {
        let runtime =
            RemoteServiceRuntime::new(HandshakeConfig::default(), RemoteRuntimeConfig::default());

        let mut desc = remote_descriptor("127.0.0.1:9");
        desc.deployment = DeploymentSpec::Binary {
            path: PathBuf::from("/bin/true"),
        };

        let err = runtime.start(&desc).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_the_start() {
        let config = RemoteRuntimeConfig {
            connect_timeout: Duration::from_millis(200),
            ..RemoteRuntimeConfig::default()
        };
        let runtime = RemoteServiceRuntime::new(HandshakeConfig::default(), config);

        // TCP port 9 (discard) is almost certainly closed
        let err = runtime
            .start(&remote_descriptor("127.0.0.1:9"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Communication(_)), "got {err}");
    }

    #[tokio::test]
    async fn stop_unknown_id_is_not_found() {
        let runtime =
            RemoteServiceRuntime::new(HandshakeConfig::default(), RemoteRuntimeConfig::default());
        let err = runtime.stop("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
