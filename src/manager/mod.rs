//! The plugin lifecycle orchestrator
//!
//! Owns the plugin map and drives every lifecycle transition:
//! load → runtime start → handshake → initialize → registered → supervised.
//! Background loops (discovery, reachability probing, failure escalation,
//! port-record cleanup) run as independent tasks that read a snapshot under
//! the map lock and apply results under the lock; none of them ever holds
//! the write lock across a call into a plugin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::discovery::Discovery;
use crate::health::HealthChecker;
use crate::plugin::handle::PluginHandle;
use crate::plugin::{
    DeploymentKind, HealthStatus, PluginDescriptor, PluginInfo, PluginSnapshot, PluginStatus,
};
use crate::ports::PortAllocator;
use crate::registry::PluginRegistry;
use crate::runtime::{ProbeTarget, Runtime};
use crate::{Error, Result};

/// Tunables for the manager and its background loops
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Consecutive unhealthy probes before a plugin escalates to Error
    pub failure_threshold: u32,
    /// Pause between unload and reload during a restart, so ports and
    /// container names have time to be released
    pub settle_delay: Duration,
    /// Reachability probe period
    pub health_interval: Duration,
    /// Per-probe timeout
    pub probe_timeout: Duration,
    /// Failure-escalation evaluation period
    pub escalation_interval: Duration,
    /// Per-plugin timeout for RPC health checks in `health_check_all`
    pub rpc_health_timeout: Duration,
    /// Discovery poll period
    pub discovery_interval: Duration,
    /// Load newly discovered plugins automatically
    pub auto_load: bool,
    /// Per-plugin bound for teardown steps during unload and shutdown
    pub unload_timeout: Duration,
    /// Port-record cleanup period
    pub port_cleanup_interval: Duration,
    /// Released port records older than this are purged
    pub port_record_max_age: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            settle_delay: Duration::from_millis(500),
            health_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            escalation_interval: Duration::from_secs(10),
            rpc_health_timeout: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(30),
            auto_load: false,
            unload_timeout: Duration::from_secs(10),
            port_cleanup_interval: Duration::from_secs(300),
            port_record_max_age: Duration::from_secs(3600),
        }
    }
}

/// The live half of a plugin entry; absent while loading or stopping
struct LivePlugin {
    handle: Arc<dyn PluginHandle>,
    instance_id: String,
    probe: ProbeTarget,
}

/// One tracked plugin id
struct PluginEntry {
    descriptor: PluginDescriptor,
    status: PluginStatus,
    live: Option<LivePlugin>,
    health: Option<HealthStatus>,
    consecutive_failures: u32,
    last_health_check: Option<DateTime<Utc>>,
    /// Bumped by every applied probe result
    health_seq: u64,
    /// Last sequence the escalation pass has seen; results are counted
    /// once, regardless of loop timing
    evaluated_seq: u64,
}

impl PluginEntry {
    fn snapshot(&self, id: &str) -> PluginSnapshot {
        PluginSnapshot {
            id: id.to_string(),
            status: self.status,
            instance_id: self.live.as_ref().map(|l| l.instance_id.clone()),
            descriptor: self.descriptor.clone(),
            health: self.health.clone(),
            consecutive_failures: self.consecutive_failures,
            last_health_check: self.last_health_check,
        }
    }
}

/// The plugin lifecycle orchestrator
pub struct PluginManager {
    config: ManagerConfig,
    registry: Arc<PluginRegistry>,
    runtimes: HashMap<DeploymentKind, Arc<dyn Runtime>>,
    ports: Arc<PortAllocator>,
    checker: HealthChecker,
    discovery: Option<Arc<dyn Discovery>>,
    plugins: RwLock<HashMap<String, PluginEntry>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Create a manager from fully constructed collaborators
    ///
    /// Runtimes are keyed by their deployment kind; supplying two runtimes
    /// for one kind keeps the last.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        registry: Arc<PluginRegistry>,
        runtimes: Vec<Arc<dyn Runtime>>,
        ports: Arc<PortAllocator>,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> Self {
        let checker = HealthChecker::new(config.probe_timeout);
        let runtimes = runtimes
            .into_iter()
            .map(|runtime| (runtime.kind(), runtime))
            .collect();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            registry,
            runtimes,
            ports,
            checker,
            discovery,
            plugins: RwLock::new(HashMap::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The shared port allocator
    #[must_use]
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// The metadata registry
    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Load a plugin from its descriptor
    ///
    /// Claims the id first so concurrent loads cannot race, then starts the
    /// runtime, handshakes, initializes, and registers. Any failure tears
    /// down whatever was already started — a failed load never leaves an
    /// orphaned process or a claimed id behind.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if the id is already loaded; otherwise the
    /// error of the failing stage
    pub async fn load(&self, descriptor: PluginDescriptor) -> Result<()> {
        descriptor.validate()?;
        let id = descriptor.id.clone();

        // Claim the id before any slow work
        {
            let mut plugins = self.plugins.write().await;
            if plugins.contains_key(&id) {
                return Err(Error::AlreadyExists(format!(
                    "plugin '{id}' is already loaded"
                )));
            }
            plugins.insert(
                id.clone(),
                PluginEntry {
                    descriptor: descriptor.clone(),
                    status: PluginStatus::Loading,
                    live: None,
                    health: None,
                    consecutive_failures: 0,
                    last_health_check: None,
                    health_seq: 0,
                    evaluated_seq: 0,
                },
            );
        }

        match self.start_plugin(&descriptor).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.plugins.write().await.remove(&id);
                Err(e)
            }
        }
    }

    /// The slow part of load; the caller removes the claimed id on error
    async fn start_plugin(&self, descriptor: &PluginDescriptor) -> Result<()> {
        let id = &descriptor.id;
        let kind = descriptor.kind();

        let runtime = self.runtimes.get(&kind).ok_or_else(|| {
            Error::Config(format!("no runtime is configured for {kind} deployments"))
        })?;

        let started = runtime.start(descriptor).await?;

        tracing::info!(
            id = %id,
            kind = %kind,
            instance = %started.instance_id,
            "plugin started, initializing"
        );

        let init_config = serde_json::json!({
            "id": descriptor.id,
            "name": descriptor.name,
            "version": descriptor.version,
            "env": descriptor.env,
        });
        if let Err(e) = started.handle.initialize(init_config).await {
            started.handle.close().await;
            if let Err(stop_err) = runtime.stop(id).await {
                tracing::warn!(id = %id, error = %stop_err, "teardown after failed initialize");
            }
            return Err(Error::Communication(format!(
                "plugin '{id}' failed to initialize: {e}"
            )));
        }

        // Registry metadata: the handshake's capability set is authoritative
        let mut info = PluginInfo::from_descriptor(descriptor);
        info.capabilities = started.handle.capabilities().to_vec();
        self.registry.register(info).await;

        let mut plugins = self.plugins.write().await;
        let Some(entry) = plugins.get_mut(id) else {
            // Unloaded while we were starting; give everything back
            drop(plugins);
            started.handle.close().await;
            if let Err(e) = runtime.stop(id).await {
                tracing::warn!(id = %id, error = %e, "teardown after mid-load unload");
            }
            if let Err(e) = self.registry.unregister(id).await {
                tracing::debug!(id = %id, error = %e, "unregister after mid-load unload");
            }
            return Err(Error::NotFound(format!(
                "plugin '{id}' was unloaded while loading"
            )));
        };

        entry.status = PluginStatus::Running;
        entry.live = Some(LivePlugin {
            handle: started.handle,
            instance_id: started.instance_id,
            probe: started.probe,
        });

        tracing::info!(id = %id, "plugin loaded");
        Ok(())
    }

    /// Unload a plugin, best-effort and in fixed order
    ///
    /// Shutdown RPC → close client → runtime stop → unregister → remove.
    /// Every step proceeds even if an earlier one failed, so a partially
    /// broken plugin is always removable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id; teardown failures are
    /// logged, never returned
    pub async fn unload(&self, id: &str) -> Result<()> {
        let (live, kind) = {
            let mut plugins = self.plugins.write().await;
            let entry = plugins
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("plugin '{id}' is not loaded")))?;
            entry.status = PluginStatus::Stopping;
            (entry.live.take(), entry.descriptor.kind())
        };

        if let Some(live) = live {
            match timeout(self.config.unload_timeout, live.handle.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(id, error = %e, "plugin shutdown RPC failed"),
                Err(_) => tracing::warn!(id, "plugin shutdown RPC timed out"),
            }
            live.handle.close().await;
        }

        if let Some(runtime) = self.runtimes.get(&kind) {
            if let Err(e) = runtime.stop(id).await {
                tracing::warn!(id, error = %e, "runtime stop failed during unload");
            }
        }

        if let Err(e) = self.registry.unregister(id).await {
            tracing::debug!(id, error = %e, "unregister failed during unload");
        }

        self.plugins.write().await.remove(id);
        tracing::info!(id, "plugin unloaded");
        Ok(())
    }

    /// Restart a plugin from its stored descriptor
    ///
    /// Unload, a short settle delay, then load. The new instance has a new
    /// process/container identity bound to the same descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id, or the reload error
    pub async fn restart(&self, id: &str) -> Result<()> {
        let descriptor = {
            let plugins = self.plugins.read().await;
            plugins
                .get(id)
                .map(|entry| entry.descriptor.clone())
                .ok_or_else(|| Error::NotFound(format!("plugin '{id}' is not loaded")))?
        };

        self.unload(id).await?;

        // Ports and container names release asynchronously
        tokio::time::sleep(self.config.settle_delay).await;

        self.load(descriptor).await
    }

    /// The lifecycle state of an id; `NotLoaded` for unknown ids
    pub async fn status(&self, id: &str) -> PluginStatus {
        self.plugins
            .read()
            .await
            .get(id)
            .map_or(PluginStatus::NotLoaded, |entry| entry.status)
    }

    /// A read-only view of one plugin
    pub async fn get(&self, id: &str) -> Option<PluginSnapshot> {
        self.plugins
            .read()
            .await
            .get(id)
            .map(|entry| entry.snapshot(id))
    }

    /// Read-only views of every tracked plugin, sorted by id
    pub async fn list(&self) -> Vec<PluginSnapshot> {
        let plugins = self.plugins.read().await;
        let mut snapshots: Vec<PluginSnapshot> = plugins
            .iter()
            .map(|(id, entry)| entry.snapshot(id))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// The live client for an id, for capability dispatch
    pub async fn handle(&self, id: &str) -> Option<Arc<dyn PluginHandle>> {
        self.plugins
            .read()
            .await
            .get(id)
            .and_then(|entry| entry.live.as_ref())
            .map(|live| Arc::clone(&live.handle))
    }

    /// RPC health check against every live plugin
    ///
    /// The map is snapshotted under a read lock; the calls run outside it,
    /// each bounded by its own timeout, so a hung plugin cannot block
    /// load/unload. Individual failures synthesize `healthy=false` —
    /// this method itself never fails.
    pub async fn health_check_all(&self) -> HashMap<String, HealthStatus> {
        let targets: Vec<(String, Arc<dyn PluginHandle>)> = {
            let plugins = self.plugins.read().await;
            plugins
                .iter()
                .filter_map(|(id, entry)| {
                    entry
                        .live
                        .as_ref()
                        .map(|live| (id.clone(), Arc::clone(&live.handle)))
                })
                .collect()
        };

        let checks = targets.into_iter().map(|(id, handle)| async move {
            let status = match timeout(self.config.rpc_health_timeout, handle.health_check()).await
            {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => HealthStatus::unhealthy(format!("health check failed: {e}")),
                Err(_) => HealthStatus::unhealthy(format!(
                    "health check timed out after {:?}",
                    self.config.rpc_health_timeout
                )),
            };
            (id, status)
        });

        let results: HashMap<String, HealthStatus> = join_all(checks).await.into_iter().collect();

        for (id, status) in &results {
            self.record_health(id, status.clone()).await;
        }

        results
    }

    /// Apply one probe result to a plugin's health fields
    ///
    /// Returns `false` if the plugin vanished between the probe and the
    /// write — a result for an unloaded plugin is discarded, not an error.
    pub async fn record_health(&self, id: &str, status: HealthStatus) -> bool {
        let mut plugins = self.plugins.write().await;
        let Some(entry) = plugins.get_mut(id) else {
            tracing::trace!(id, "discarding health result for unloaded plugin");
            return false;
        };

        entry.last_health_check = Some(status.checked_at);
        entry.health = Some(status);
        entry.health_seq += 1;
        true
    }

    /// One failure-escalation pass; returns ids that flipped to Error
    ///
    /// Consumes each probe result exactly once: a healthy result resets the
    /// consecutive-failure counter, an unhealthy one increments it, and an
    /// unknown one leaves it alone. The Error transition is logged once, on
    /// the flip.
    pub async fn evaluate_failures(&self) -> Vec<String> {
        let mut flipped = Vec::new();
        let mut plugins = self.plugins.write().await;

        for (id, entry) in plugins.iter_mut() {
            if entry.health_seq == entry.evaluated_seq {
                continue;
            }
            entry.evaluated_seq = entry.health_seq;

            let Some(health) = &entry.health else {
                continue;
            };

            if health.is_unknown() {
                continue;
            }

            if health.healthy {
                entry.consecutive_failures = 0;
                continue;
            }

            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= self.config.failure_threshold
                && entry.status == PluginStatus::Running
            {
                entry.status = PluginStatus::Error;
                tracing::error!(
                    id = %id,
                    failures = entry.consecutive_failures,
                    "plugin reached the failure threshold, escalating to error state"
                );
                flipped.push(id.clone());
            }
        }

        flipped
    }

    /// Start the background loops (probing, escalation, discovery, port
    /// cleanup, registry sweep)
    pub fn start(manager: &Arc<Self>) {
        manager.registry.start_sweeper();

        let mut tasks = vec![
            Self::spawn_health_loop(Arc::clone(manager)),
            Self::spawn_escalation_loop(Arc::clone(manager)),
            Self::spawn_port_cleanup_loop(Arc::clone(manager)),
        ];
        if manager.discovery.is_some() {
            tasks.push(Self::spawn_discovery_loop(Arc::clone(manager)));
        }

        if let Ok(mut slot) = manager.tasks.lock() {
            slot.extend(tasks);
        }
    }

    fn spawn_health_loop(manager: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown_rx = manager.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.health_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.probe_running_plugins().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Probe every Running plugin's address and apply the results
    async fn probe_running_plugins(&self) {
        let targets: Vec<(String, ProbeTarget)> = {
            let plugins = self.plugins.read().await;
            plugins
                .iter()
                .filter(|(_, entry)| entry.status == PluginStatus::Running)
                .map(|(id, entry)| {
                    let probe = entry
                        .live
                        .as_ref()
                        .map_or(ProbeTarget::None, |live| live.probe.clone());
                    (id.clone(), probe)
                })
                .collect()
        };

        let probes = targets.into_iter().map(|(id, target)| async move {
            let status = self.checker.probe(&target).await;
            (id, status)
        });

        for (id, status) in join_all(probes).await {
            self.record_health(&id, status).await;
        }
    }

    fn spawn_escalation_loop(manager: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown_rx = manager.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.escalation_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.evaluate_failures().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    fn spawn_port_cleanup_loop(manager: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown_rx = manager.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.port_cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager
                            .ports
                            .cleanup_expired_records(manager.config.port_record_max_age)
                            .await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    fn spawn_discovery_loop(manager: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown_rx = manager.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.discovery_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.poll_discovery().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// One discovery pass: log new descriptors, optionally load them
    ///
    /// A plugin that disappeared from discovery is never auto-unloaded;
    /// operator-managed plugins must not be torn down as a side effect.
    async fn poll_discovery(&self) {
        let Some(discovery) = &self.discovery else {
            return;
        };

        let descriptors = match discovery.discover().await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                tracing::warn!(error = %e, "discovery poll failed");
                return;
            }
        };

        for descriptor in descriptors {
            let known = self.plugins.read().await.contains_key(&descriptor.id);
            if known {
                continue;
            }

            tracing::info!(
                id = %descriptor.id,
                name = %descriptor.name,
                kind = %descriptor.kind(),
                "discovered new plugin"
            );

            if self.config.auto_load {
                if let Err(e) = self.load(descriptor).await {
                    tracing::warn!(error = %e, "auto-load of discovered plugin failed");
                }
            }
        }
    }

    /// Full shutdown: stop every loop first, then tear down every plugin
    ///
    /// Loops are stopped before teardown so no cleanup task fires against a
    /// half-destroyed manager. Plugin teardowns fan out concurrently, each
    /// bounded by the unload timeout.
    pub async fn shutdown(&self) {
        tracing::info!("plugin manager shutting down");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map_or_else(|_| Vec::new(), |mut slot| slot.drain(..).collect());
        for task in tasks {
            let _ = task.await;
        }

        self.registry.shutdown().await;

        let ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        let unloads = ids.into_iter().map(|id| async move {
            match timeout(self.config.unload_timeout, self.unload(&id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(id = %id, error = %e, "unload failed during shutdown"),
                Err(_) => tracing::warn!(id = %id, "unload timed out during shutdown"),
            }
        });
        join_all(unloads).await;

        for runtime in self.runtimes.values() {
            if let Err(e) = runtime.shutdown().await {
                tracing::warn!(kind = %runtime.kind(), error = %e, "runtime shutdown failed");
            }
        }
    }
}
