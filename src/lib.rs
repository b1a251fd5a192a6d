//! Pylon - plugin lifecycle orchestrator for AI assistant capabilities
//!
//! This library lets a host process dynamically run, supervise, and retire
//! capability plugins (LLM access, speech recognition/synthesis, device
//! control, generic tools) without embedding their code in the host binary:
//! - Runtime strategies for local subprocesses, containers, and remote
//!   services, all converging on one client contract
//! - A protocol-version + cookie handshake gating every connection
//! - A TTL-keyed metadata registry and a bind-tested port allocator
//! - Reachability probing with failure-threshold escalation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Plugin Manager                      │
//! │  Load / Unload / Restart │ Discovery │ Escalation   │
//! └──────┬──────────────┬──────────────┬────────────────┘
//!        │              │              │
//! ┌──────▼─────┐ ┌──────▼─────┐ ┌──────▼─────┐
//! │  Runtimes  │ │  Registry  │ │   Health   │
//! │ process    │ │  (TTL)     │ │  Checker   │
//! │ container  │ └────────────┘ └────────────┘
//! │ remote     │ ┌────────────┐
//! └──────┬─────┘ │   Ports    │
//!        │       └────────────┘
//! ┌──────▼──────────────────────────────────────────────┐
//! │        Handshake + RPC client boundary               │
//! │  base surface │ utility │ llm │ audio │ device      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod manager;
pub mod plugin;
pub mod ports;
pub mod registry;
pub mod rpc;
pub mod runtime;

pub use config::{HostConfig, PortsConfig};
pub use discovery::{DirectoryDiscovery, Discovery};
pub use error::{Error, Result};
pub use health::HealthChecker;
pub use manager::{ManagerConfig, PluginManager};
pub use plugin::capability::{
    AudioCapability, AudioPayload, Capability, CapabilitySet, DeviceCapability, GenerateRequest,
    GenerateResponse, LlmCapability, SynthesisRequest, ToolDef, Transcription, UtilityCapability,
};
pub use plugin::handle::PluginHandle;
pub use plugin::metrics::{Histogram, MetricsReport};
pub use plugin::{
    DeploymentKind, DeploymentSpec, HealthStatus, PluginDescriptor, PluginInfo, PluginSnapshot,
    PluginStatus, ResourceLimits,
};
pub use ports::{AllocationStatus, PortAllocation, PortAllocator, PortStats};
pub use registry::PluginRegistry;
pub use rpc::{Frame, HandshakeConfig, RpcClient, RpcPluginHandle};
pub use runtime::{
    ContainerRuntime, ContainerRuntimeConfig, LocalProcessRuntime, ProbeTarget,
    ProcessRuntimeConfig, RemoteRuntimeConfig, RemoteServiceRuntime, Runtime, StartedPlugin,
};
