//! Port allocation for spawned plugins
//!
//! Hands out unique loopback ports from a configured range. Bookkeeping
//! alone is not trusted: every candidate passes an OS-level bind test before
//! it is committed, guarding against drift between the table and real socket
//! state. Released records are retained for audit until a cleanup pass
//! purges them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{Error, Result};

/// State of one port record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    /// Handed out to an owner
    Allocated,
    /// Pinned by an operator, not available for allocation
    Reserved,
    /// Returned; retained for audit until cleanup
    Released,
}

/// One port record
#[derive(Debug, Clone, Serialize)]
pub struct PortAllocation {
    /// The port number
    pub port: u16,
    /// Plugin id that owns (or owned) the port
    pub owner: String,
    /// Dialable address for the port
    pub address: String,
    /// When the port was allocated or reserved
    pub allocated_at: DateTime<Utc>,
    /// When the port was released, if it was
    pub released_at: Option<DateTime<Utc>>,
    /// Record state
    pub status: AllocationStatus,
}

/// Aggregate capacity view derived from the live table
#[derive(Debug, Clone, Serialize)]
pub struct PortStats {
    /// Size of the configured range
    pub total: usize,
    /// Active allocations
    pub allocated: usize,
    /// Reserved ports
    pub reserved: usize,
    /// Released records awaiting cleanup
    pub released: usize,
    /// Ports that could still be handed out
    pub available: usize,
    /// (allocated + reserved) / total, as a percentage
    pub usage_percent: f64,
}

/// Allocator over a fixed `[start, end]` port range
#[derive(Debug)]
pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    table: RwLock<HashMap<u16, PortAllocation>>,
}

impl PortAllocator {
    /// Create an allocator over `[start, end]` (inclusive)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the range is empty
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || end < start {
            return Err(Error::Config(format!(
                "invalid port range {start}..={end}"
            )));
        }
        Ok(Self {
            range_start: start,
            range_end: end,
            table: RwLock::new(HashMap::new()),
        })
    }

    /// Find and commit the first available port for `owner`
    ///
    /// Skips ports marked allocated or reserved, then verifies the candidate
    /// with a bind test before committing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] when the range is exhausted
    pub async fn find_available_port(&self, owner: &str) -> Result<u16> {
        let mut table = self.table.write().await;

        for port in self.range_start..=self.range_end {
            if let Some(record) = table.get(&port) {
                if record.status != AllocationStatus::Released {
                    continue;
                }
            }

            // Bookkeeping says free; confirm against the OS before committing
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_err() {
                tracing::debug!(port, "port free in table but not bindable, skipping");
                continue;
            }

            let address = format!("127.0.0.1:{port}");
            table.insert(
                port,
                PortAllocation {
                    port,
                    owner: owner.to_string(),
                    address: address.clone(),
                    allocated_at: Utc::now(),
                    released_at: None,
                    status: AllocationStatus::Allocated,
                },
            );
            tracing::debug!(port, owner, "port allocated");
            return Ok(port);
        }

        Err(Error::Capacity(format!(
            "no available port in {}..={} for '{owner}'",
            self.range_start, self.range_end
        )))
    }

    /// Allocate with retry and linearly increasing backoff
    ///
    /// Attempt `n` (1-based) sleeps `n * base_delay` before the next try.
    ///
    /// # Errors
    ///
    /// Surfaces the final underlying error once `max_retries` attempts are
    /// exhausted
    pub async fn allocate_with_retry(
        &self,
        owner: &str,
        max_retries: u32,
        base_delay: std::time::Duration,
    ) -> Result<u16> {
        let mut last_err = Error::Capacity(format!("no allocation attempts for '{owner}'"));

        for attempt in 1..=max_retries {
            match self.find_available_port(owner).await {
                Ok(port) => return Ok(port),
                Err(e) => {
                    tracing::debug!(owner, attempt, error = %e, "port allocation attempt failed");
                    last_err = e;
                    if attempt < max_retries {
                        tokio::time::sleep(base_delay * attempt).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Pin a specific port so allocation never hands it out
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the port is outside the range,
    /// [`Error::Capacity`] if it is already active
    pub async fn reserve_port(&self, port: u16, owner: &str) -> Result<()> {
        if port < self.range_start || port > self.range_end {
            return Err(Error::Config(format!(
                "port {port} is outside the range {}..={}",
                self.range_start, self.range_end
            )));
        }

        let mut table = self.table.write().await;
        if let Some(record) = table.get(&port) {
            if record.status != AllocationStatus::Released {
                return Err(Error::Capacity(format!(
                    "port {port} is already {} by '{}'",
                    match record.status {
                        AllocationStatus::Allocated => "allocated",
                        AllocationStatus::Reserved => "reserved",
                        AllocationStatus::Released => "released",
                    },
                    record.owner
                )));
            }
        }

        table.insert(
            port,
            PortAllocation {
                port,
                owner: owner.to_string(),
                address: format!("127.0.0.1:{port}"),
                allocated_at: Utc::now(),
                released_at: None,
                status: AllocationStatus::Reserved,
            },
        );
        Ok(())
    }

    /// Mark a port released; the record is retained for audit
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for a port with no record
    pub async fn release_port(&self, port: u16) -> Result<()> {
        let mut table = self.table.write().await;
        let record = table
            .get_mut(&port)
            .ok_or_else(|| Error::NotFound(format!("port {port} has no allocation record")))?;

        record.status = AllocationStatus::Released;
        record.released_at = Some(Utc::now());
        tracing::debug!(port, owner = %record.owner, "port released");
        Ok(())
    }

    /// Purge released records older than `max_age`; returns how many
    pub async fn cleanup_expired_records(&self, max_age: std::time::Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());

        let mut table = self.table.write().await;
        let before = table.len();
        table.retain(|_, record| {
            record.status != AllocationStatus::Released
                || record.released_at.is_none_or(|at| at > cutoff)
        });
        let purged = before - table.len();
        if purged > 0 {
            tracing::debug!(purged, "purged expired port records");
        }
        purged
    }

    /// The dialable address for an active allocation
    pub async fn address_of(&self, port: u16) -> Option<String> {
        let table = self.table.read().await;
        table
            .get(&port)
            .filter(|r| r.status == AllocationStatus::Allocated)
            .map(|r| r.address.clone())
    }

    /// All records, for inspection
    pub async fn records(&self) -> Vec<PortAllocation> {
        self.table.read().await.values().cloned().collect()
    }

    /// Capacity stats derived from the live table
    pub async fn stats(&self) -> PortStats {
        let table = self.table.read().await;
        let total = usize::from(self.range_end) - usize::from(self.range_start) + 1;

        let mut allocated = 0;
        let mut reserved = 0;
        let mut released = 0;
        for record in table.values() {
            match record.status {
                AllocationStatus::Allocated => allocated += 1,
                AllocationStatus::Reserved => reserved += 1,
                AllocationStatus::Released => released += 1,
            }
        }

        let in_use = allocated + reserved;
        #[allow(clippy::cast_precision_loss)]
        let usage_percent = if total == 0 {
            0.0
        } else {
            (in_use as f64 / total as f64) * 100.0
        };

        PortStats {
            total,
            allocated,
            reserved,
            released,
            available: total - in_use,
            usage_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn allocations_never_share_a_port() {
        let allocator = PortAllocator::new(47100, 47110).unwrap();

        let a = allocator.find_available_port("plugin-a").await.unwrap();
        let b = allocator.find_available_port("plugin-b").await.unwrap();
        let c = allocator.find_available_port("plugin-c").await.unwrap();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn released_port_can_be_reallocated() {
        let allocator = PortAllocator::new(47120, 47121).unwrap();

        let a = allocator.find_available_port("plugin-a").await.unwrap();
        let b = allocator.find_available_port("plugin-b").await.unwrap();

        // Range exhausted
        assert!(allocator.find_available_port("plugin-c").await.is_err());

        allocator.release_port(a).await.unwrap();
        let c = allocator.find_available_port("plugin-c").await.unwrap();
        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[tokio::test]
    async fn release_keeps_the_record_for_audit() {
        let allocator = PortAllocator::new(47130, 47135).unwrap();
        let port = allocator.find_available_port("plugin-a").await.unwrap();
        allocator.release_port(port).await.unwrap();

        let records = allocator.records().await;
        let record = records.iter().find(|r| r.port == port).unwrap();
        assert_eq!(record.status, AllocationStatus::Released);
        assert!(record.released_at.is_some());
        assert_eq!(record.owner, "plugin-a");
    }

    #[tokio::test]
    async fn release_unknown_port_is_not_found() {
        let allocator = PortAllocator::new(47140, 47145).unwrap();
        let err = allocator.release_port(47141).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn retry_exhaustion_surfaces_the_last_error() {
        // One-port range, pre-allocated, so every attempt fails
        let allocator = PortAllocator::new(47150, 47150).unwrap();
        allocator.find_available_port("holder").await.unwrap();

        let base = Duration::from_millis(20);
        let started = tokio::time::Instant::now();
        let err = allocator
            .allocate_with_retry("plugin-a", 3, base)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Capacity(_)), "got {err}");
        // Linear backoff slept after attempts 1 and 2: 1*base + 2*base
        assert!(started.elapsed() >= base * 3);
    }

    #[tokio::test]
    async fn reserved_port_is_skipped_by_allocation() {
        let allocator = PortAllocator::new(47160, 47161).unwrap();
        allocator.reserve_port(47160, "operator").await.unwrap();

        let port = allocator.find_available_port("plugin-a").await.unwrap();
        assert_eq!(port, 47161);

        // Reserving an active port fails
        assert!(allocator.reserve_port(47161, "operator").await.is_err());
    }

    #[tokio::test]
    async fn cleanup_purges_only_old_released_records() {
        let allocator = PortAllocator::new(47170, 47175).unwrap();

        let kept = allocator.find_available_port("plugin-a").await.unwrap();
        let released = allocator.find_available_port("plugin-b").await.unwrap();
        allocator.release_port(released).await.unwrap();

        // max_age of zero makes every released record expired
        let purged = allocator.cleanup_expired_records(Duration::ZERO).await;
        assert_eq!(purged, 1);

        let records = allocator.records().await;
        assert!(records.iter().any(|r| r.port == kept));
        assert!(!records.iter().any(|r| r.port == released));
    }

    #[tokio::test]
    async fn stats_reflect_the_live_table() {
        let allocator = PortAllocator::new(47180, 47189).unwrap();
        allocator.find_available_port("plugin-a").await.unwrap();
        allocator.reserve_port(47185, "operator").await.unwrap();

        let stats = allocator.stats().await;
        assert_eq!(stats.total, 10);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.available, 8);
        assert!((stats.usage_percent - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_range_is_rejected() {
        assert!(PortAllocator::new(5000, 4999).is_err());
        assert!(PortAllocator::new(0, 10).is_err());
    }
}
