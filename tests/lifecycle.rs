//! End-to-end lifecycle tests against a real TCP plugin
//!
//! The test plugin from `common` is supervised through the remote runtime,
//! exercising the full path: handshake, initialize, registration, probing,
//! failure escalation, and best-effort teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pylon_host::{
    Capability, DeploymentSpec, HandshakeConfig, ManagerConfig, PluginDescriptor, PluginManager,
    PluginRegistry, PluginStatus, PortAllocator, RemoteRuntimeConfig, RemoteServiceRuntime,
    ResourceLimits,
};

mod common;
use common::TestPlugin;

fn remote_descriptor(id: &str, endpoint: &str) -> PluginDescriptor {
    PluginDescriptor {
        id: id.to_string(),
        name: "Echo Utility".to_string(),
        version: "1.0.0".to_string(),
        description: Some("test plugin".to_string()),
        deployment: DeploymentSpec::Remote {
            endpoint: endpoint.to_string(),
        },
        env: HashMap::new(),
        resources: ResourceLimits::default(),
        tags: vec!["testing".to_string()],
        capabilities: vec![],
        health_url: None,
    }
}

fn build_manager(handshake: HandshakeConfig, port_base: u16) -> Arc<PluginManager> {
    let runtimes: Vec<Arc<dyn pylon_host::Runtime>> = vec![Arc::new(RemoteServiceRuntime::new(
        handshake,
        RemoteRuntimeConfig {
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(2),
        },
    ))];
    let registry = Arc::new(PluginRegistry::new(Duration::ZERO));
    let ports = Arc::new(PortAllocator::new(port_base, port_base + 20).unwrap());

    Arc::new(PluginManager::new(
        ManagerConfig {
            settle_delay: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(500),
            rpc_health_timeout: Duration::from_millis(500),
            unload_timeout: Duration::from_secs(2),
            ..ManagerConfig::default()
        },
        registry,
        runtimes,
        ports,
        None,
    ))
}

#[tokio::test]
async fn load_probes_escalates_and_still_unloads() {
    let handshake = HandshakeConfig::default();
    let plugin = TestPlugin::spawn(handshake.clone(), vec![Capability::Utility]).await;
    let manager = build_manager(handshake, 48100);

    // Load: connect, handshake, ping, initialize, register
    manager
        .load(remote_descriptor("omni.echo-util", &plugin.addr))
        .await
        .unwrap();
    assert_eq!(manager.status("omni.echo-util").await, PluginStatus::Running);
    assert_eq!(plugin.init_count(), 1);
    assert!(manager.registry().get("omni.echo-util").await.is_some());

    // A live plugin answers RPC health checks
    let results = manager.health_check_all().await;
    assert!(results["omni.echo-util"].healthy);
    manager.evaluate_failures().await;
    assert_eq!(manager.status("omni.echo-util").await, PluginStatus::Running);

    // Kill the plugin externally; every following check is unhealthy
    plugin.kill();
    for _ in 0..3 {
        let results = manager.health_check_all().await;
        assert!(!results["omni.echo-util"].healthy);
        manager.evaluate_failures().await;
    }
    assert_eq!(manager.status("omni.echo-util").await, PluginStatus::Error);

    // Unload still succeeds even though the process is already gone
    manager.unload("omni.echo-util").await.unwrap();
    assert_eq!(
        manager.status("omni.echo-util").await,
        PluginStatus::NotLoaded
    );
    assert!(manager.registry().get("omni.echo-util").await.is_none());
}

#[tokio::test]
async fn duplicate_load_does_not_open_a_second_connection() {
    let handshake = HandshakeConfig::default();
    let plugin = TestPlugin::spawn(handshake.clone(), vec![]).await;
    let manager = build_manager(handshake, 48130);

    manager
        .load(remote_descriptor("omni.echo-util", &plugin.addr))
        .await
        .unwrap();
    assert_eq!(plugin.connection_count(), 1);

    let err = manager
        .load(remote_descriptor("omni.echo-util", &plugin.addr))
        .await
        .unwrap_err();
    assert!(err.is_already_exists(), "got {err}");
    assert_eq!(plugin.connection_count(), 1);
}

#[tokio::test]
async fn restart_reconnects_with_a_new_instance_identity() {
    let handshake = HandshakeConfig::default();
    let plugin = TestPlugin::spawn(handshake.clone(), vec![]).await;
    let manager = build_manager(handshake, 48160);

    manager
        .load(remote_descriptor("omni.echo-util", &plugin.addr))
        .await
        .unwrap();
    let first = manager.get("omni.echo-util").await.unwrap();

    manager.restart("omni.echo-util").await.unwrap();
    let second = manager.get("omni.echo-util").await.unwrap();

    assert_eq!(second.status, PluginStatus::Running);
    assert_ne!(first.instance_id, second.instance_id);
    assert_eq!(first.descriptor.id, second.descriptor.id);
    assert_eq!(plugin.connection_count(), 2);
    assert_eq!(plugin.init_count(), 2);
}

#[tokio::test]
async fn cookie_mismatch_aborts_the_load() {
    let server_handshake = HandshakeConfig {
        cookie_value: "server-only".to_string(),
        ..HandshakeConfig::default()
    };
    let plugin = TestPlugin::spawn(server_handshake, vec![]).await;

    let manager = build_manager(HandshakeConfig::default(), 48190);
    let err = manager
        .load(remote_descriptor("omni.echo-util", &plugin.addr))
        .await
        .unwrap_err();

    assert!(
        matches!(err, pylon_host::Error::Handshake(_)),
        "got {err}"
    );
    assert_eq!(
        manager.status("omni.echo-util").await,
        PluginStatus::NotLoaded
    );
}

#[tokio::test]
async fn capability_surfaces_dispatch_over_the_wire() {
    let handshake = HandshakeConfig::default();
    let plugin = TestPlugin::spawn(
        handshake.clone(),
        vec![Capability::Utility, Capability::Llm],
    )
    .await;
    let manager = build_manager(handshake, 48220);

    manager
        .load(remote_descriptor("omni.echo-util", &plugin.addr))
        .await
        .unwrap();
    let handle = manager.handle("omni.echo-util").await.unwrap();

    // Utility surface: list and invoke
    let utility = handle.as_utility().expect("utility advertised");
    let tools = utility.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let reply = utility
        .call_tool("echo", serde_json::json!({ "text": "hi" }))
        .await
        .unwrap();
    assert_eq!(reply["text"], "hi");

    // LLM surface
    let llm = handle.as_llm().expect("llm advertised");
    let generated = llm
        .generate(pylon_host::GenerateRequest {
            prompt: "say hello".to_string(),
            system: None,
            max_tokens: None,
            temperature: None,
        })
        .await
        .unwrap();
    assert_eq!(generated.text, "hello from the model");

    // Surfaces that were not advertised stay unreachable
    assert!(handle.as_audio().is_none());
    assert!(handle.as_device().is_none());

    // Base surface: metrics and info
    let metrics = handle.get_metrics().await.unwrap();
    assert_eq!(metrics.counters["requests_total"], 3);

    let info = handle.get_info().await.unwrap();
    assert_eq!(info.id, "omni.echo-util");

    // Registry capabilities come from the handshake, not the descriptor
    let registered = manager.registry().get("omni.echo-util").await.unwrap();
    assert!(registered.capabilities.contains(&Capability::Utility));
    assert!(registered.capabilities.contains(&Capability::Llm));
}

#[tokio::test]
async fn background_loops_escalate_a_killed_plugin() {
    let handshake = HandshakeConfig::default();
    let plugin = TestPlugin::spawn(handshake.clone(), vec![]).await;

    let runtimes: Vec<Arc<dyn pylon_host::Runtime>> = vec![Arc::new(RemoteServiceRuntime::new(
        handshake,
        RemoteRuntimeConfig {
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(2),
        },
    ))];
    let registry = Arc::new(PluginRegistry::new(Duration::ZERO));
    let ports = Arc::new(PortAllocator::new(48250, 48270).unwrap());
    let manager = Arc::new(PluginManager::new(
        ManagerConfig {
            health_interval: Duration::from_millis(50),
            escalation_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(200),
            rpc_health_timeout: Duration::from_millis(500),
            unload_timeout: Duration::from_secs(2),
            ..ManagerConfig::default()
        },
        registry,
        runtimes,
        ports,
        None,
    ));
    PluginManager::start(&manager);

    manager
        .load(remote_descriptor("omni.echo-util", &plugin.addr))
        .await
        .unwrap();

    // Healthy while the plugin lives
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.status("omni.echo-util").await, PluginStatus::Running);

    // Kill it; the probe and escalation loops flip it to Error on their own
    plugin.kill();
    let mut status = PluginStatus::Running;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        status = manager.status("omni.echo-util").await;
        if status == PluginStatus::Error {
            break;
        }
    }
    assert_eq!(status, PluginStatus::Error);

    // Shutdown stops the loops and tears the plugin down
    manager.shutdown().await;
    assert!(manager.list().await.is_empty());
}
