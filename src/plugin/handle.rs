//! The client contract every runtime strategy converges on
//!
//! After `Runtime::start` succeeds, the manager only ever talks to an
//! `Arc<dyn PluginHandle>` — it never branches on deployment kind again.

use async_trait::async_trait;
use serde_json::Value;

use super::capability::{
    AudioCapability, CapabilitySet, DeviceCapability, LlmCapability, UtilityCapability,
};
use super::metrics::MetricsReport;
use super::{HealthStatus, PluginInfo};
use crate::Result;

/// The base surface every connected plugin exposes
///
/// Capability extensions are probed with the `as_*` accessors
/// (optional-interface pattern); a handle returns `Some` only for surfaces
/// the plugin advertised at handshake time.
#[async_trait]
pub trait PluginHandle: Send + Sync {
    /// Pass configuration to the plugin; called exactly once after start
    async fn initialize(&self, config: Value) -> Result<()>;

    /// Ask the plugin to shut down gracefully
    async fn shutdown(&self) -> Result<()>;

    /// RPC-level health check
    async fn health_check(&self) -> Result<HealthStatus>;

    /// Fetch the plugin's metrics report
    async fn get_metrics(&self) -> Result<MetricsReport>;

    /// Fetch the plugin's self-reported metadata
    async fn get_info(&self) -> Result<PluginInfo>;

    /// Liveness ping; must succeed before the handle is considered usable
    async fn ping(&self) -> Result<()>;

    /// Capabilities advertised during the handshake
    fn capabilities(&self) -> CapabilitySet;

    /// Tear down the client connection without any RPC
    ///
    /// Used during unload after the shutdown RPC (which may have failed);
    /// must not error.
    async fn close(&self);

    /// Probe for the generic tool surface
    fn as_utility(&self) -> Option<&dyn UtilityCapability> {
        None
    }

    /// Probe for the text generation surface
    fn as_llm(&self) -> Option<&dyn LlmCapability> {
        None
    }

    /// Probe for the speech surface
    fn as_audio(&self) -> Option<&dyn AudioCapability> {
        None
    }

    /// Probe for the device surface
    fn as_device(&self) -> Option<&dyn DeviceCapability> {
        None
    }
}
