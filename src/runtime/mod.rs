//! Runtime strategies: one narrow contract per deployment kind
//!
//! A runtime turns a deployment descriptor into a live, handshaken client.
//! The manager picks a runtime by deployment kind exactly once, at load
//! time; afterwards every plugin looks the same behind
//! [`PluginHandle`](crate::plugin::handle::PluginHandle). New deployment
//! kinds are added by implementing [`Runtime`], without touching the
//! manager.

pub mod container;
pub mod process;
pub mod remote;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::plugin::handle::PluginHandle;
use crate::plugin::{DeploymentKind, PluginDescriptor};

pub use self::container::{ContainerRuntime, ContainerRuntimeConfig};
pub use self::process::{LocalProcessRuntime, ProcessRuntimeConfig};
pub use self::remote::{RemoteRuntimeConfig, RemoteServiceRuntime};

/// How the health checker reaches a started plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Short-timeout TCP connect against `host:port`
    Tcp(String),
    /// `GET` against this URL, expecting 2xx
    Http(String),
    /// No address yet; probes report unknown
    None,
}

/// The product of a successful start: a usable client plus identity
pub struct StartedPlugin {
    /// The connected, pinged plugin client
    pub handle: Arc<dyn PluginHandle>,
    /// Process pid, container id, or connection id; changes on restart
    pub instance_id: String,
    /// Where reachability probes should aim
    pub probe: ProbeTarget,
}

impl fmt::Debug for StartedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartedPlugin")
            .field("instance_id", &self.instance_id)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}

/// Strategy contract for one deployment kind
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start (or connect to) the plugin and perform the handshake
    ///
    /// On any failure the runtime tears down whatever it already created —
    /// a failed start never leaks a process, container, or port.
    async fn start(&self, descriptor: &PluginDescriptor) -> Result<StartedPlugin>;

    /// Stop the plugin instance this runtime started for `id`
    async fn stop(&self, id: &str) -> Result<()>;

    /// The deployment kind this runtime serves
    fn kind(&self) -> DeploymentKind;

    /// Whether the runtime's own machinery is usable (e.g. engine reachable)
    async fn health_check(&self) -> Result<()>;

    /// Stop everything this runtime still owns, best-effort
    async fn shutdown(&self) -> Result<()>;
}
