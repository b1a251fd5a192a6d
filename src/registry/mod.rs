//! TTL-keyed plugin metadata directory
//!
//! The registry is a directory only: it never tracks process liveness, and
//! its entries outlive (or predate) any running instance. Each entry's
//! expiry is computed at registration from the configured TTL; expired
//! entries become logically invisible to every read before the background
//! sweep physically purges them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

use crate::plugin::{DeploymentKind, PluginInfo};
use crate::{Error, Result};

/// Minimum sweep period regardless of TTL
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One registered plugin with its computed expiry
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// The registered metadata
    pub info: PluginInfo,
    /// When the entry was registered
    pub registered_at: DateTime<Utc>,
    /// When the entry expires; `None` means never (TTL = 0)
    pub expires_at: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory plugin metadata directory with expiring entries
pub struct PluginRegistry {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<String, RegistryEntry>>>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Create a registry whose entries expire after `ttl` (zero = never)
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// The sweep period for a given TTL: TTL/4, floored at one minute
    #[must_use]
    pub fn sweep_interval(ttl: Duration) -> Duration {
        (ttl / 4).max(MIN_SWEEP_INTERVAL)
    }

    /// Start the background sweep that physically purges expired entries
    ///
    /// A no-op for TTL = 0 (nothing ever expires) or if already started.
    pub fn start_sweeper(&self) {
        if self.ttl.is_zero() {
            return;
        }

        let Ok(mut slot) = self.sweeper.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let entries = Arc::clone(&self.entries);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Self::sweep_interval(self.ttl);

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        let mut map = entries.write().await;
                        let before = map.len();
                        map.retain(|_, entry| !entry.is_expired(now));
                        let purged = before - map.len();
                        if purged > 0 {
                            tracing::debug!(purged, "registry sweep purged expired entries");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    /// Register (or re-register) plugin metadata
    ///
    /// Re-registration refreshes the expiry.
    pub async fn register(&self, info: PluginInfo) {
        let now = Utc::now();
        let expires_at = if self.ttl.is_zero() {
            None
        } else {
            Some(now + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX))
        };

        tracing::debug!(id = %info.id, name = %info.name, "registering plugin metadata");
        self.entries.write().await.insert(
            info.id.clone(),
            RegistryEntry {
                info,
                registered_at: now,
                expires_at,
            },
        );
    }

    /// Remove an entry
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the id has no entry (expired entries
    /// can still be unregistered until the sweep runs)
    pub async fn unregister(&self, id: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("plugin '{id}' is not registered")))
    }

    /// Look up one entry, excluding expired ones
    pub async fn get(&self, id: &str) -> Option<PluginInfo> {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .get(id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.info.clone())
    }

    /// All live entries
    pub async fn list(&self) -> Vec<PluginInfo> {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Live entries of one deployment kind
    pub async fn list_by_type(&self, kind: DeploymentKind) -> Vec<PluginInfo> {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| !entry.is_expired(now) && entry.info.kind == kind)
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Case-insensitive substring search over name, description, tags, and
    /// capabilities
    pub async fn search(&self, query: &str) -> Vec<PluginInfo> {
        let needle = query.to_lowercase();
        let now = Utc::now();

        self.entries
            .read()
            .await
            .values()
            .filter(|entry| !entry.is_expired(now))
            .filter(|entry| {
                let info = &entry.info;
                info.name.to_lowercase().contains(&needle)
                    || info
                        .description
                        .as_ref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
                    || info.tags.iter().any(|t| t.to_lowercase().contains(&needle))
                    || info
                        .capabilities
                        .iter()
                        .any(|c| c.to_string().contains(&needle))
            })
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Physically purge expired entries; returns how many were removed
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Stop the background sweep
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweeper.lock().map_or(None, |mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
