//! Plugin reachability probing
//!
//! The checker only observes: it probes an address and reports. Starting,
//! stopping, and failure escalation live in the manager, keeping probe
//! mechanics and policy independently testable.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::plugin::HealthStatus;
use crate::runtime::ProbeTarget;

/// Probes plugin addresses with a short per-probe timeout
#[derive(Debug, Clone)]
pub struct HealthChecker {
    probe_timeout: Duration,
    http: reqwest::Client,
}

impl HealthChecker {
    /// Create a checker whose probes give up after `probe_timeout`
    #[must_use]
    pub fn new(probe_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_default();
        Self {
            probe_timeout,
            http,
        }
    }

    /// Probe one target
    ///
    /// - [`ProbeTarget::Tcp`]: a connect attempt within the timeout
    /// - [`ProbeTarget::Http`]: `GET`, any 2xx is healthy
    /// - [`ProbeTarget::None`]: unknown — "not started" is not "broken"
    pub async fn probe(&self, target: &ProbeTarget) -> HealthStatus {
        match target {
            ProbeTarget::None => HealthStatus::unknown(),
            ProbeTarget::Tcp(addr) => self.probe_tcp(addr).await,
            ProbeTarget::Http(url) => self.probe_http(url).await,
        }
    }

    async fn probe_tcp(&self, addr: &str) -> HealthStatus {
        match timeout(self.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => HealthStatus::healthy("reachable").with_detail("address", addr),
            Ok(Err(e)) => HealthStatus::unhealthy(format!("connect failed: {e}"))
                .with_detail("address", addr),
            Err(_) => {
                HealthStatus::unhealthy(format!("connect timed out after {:?}", self.probe_timeout))
                    .with_detail("address", addr)
            }
        }
    }

    async fn probe_http(&self, url: &str) -> HealthStatus {
        match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                HealthStatus::healthy("ok").with_detail("http_status", response.status().as_str())
            }
            Ok(response) => HealthStatus::unhealthy(format!(
                "health endpoint answered {}",
                response.status()
            ))
            .with_detail("http_status", response.status().as_str()),
            Err(e) => HealthStatus::unhealthy(format!("health request failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn checker() -> HealthChecker {
        HealthChecker::new(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn no_address_reports_unknown() {
        let status = checker().probe(&ProbeTarget::None).await;
        assert!(status.is_unknown());
        assert!(!status.healthy);
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let status = checker().probe(&ProbeTarget::Tcp(addr)).await;
        assert!(status.healthy);
        assert!(!status.is_unknown());
    }

    #[tokio::test]
    async fn tcp_probe_fails_against_a_closed_port() {
        // Bind then drop to obtain a port that is closed right now
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let status = checker().probe(&ProbeTarget::Tcp(addr)).await;
        assert!(!status.healthy);
        assert!(!status.is_unknown());
    }

    async fn spawn_http_server(response_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0_u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = format!("{response_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = stream.write_all(body.as_bytes()).await;
            }
        });

        format!("http://{addr}/health")
    }

    #[tokio::test]
    async fn http_probe_accepts_2xx() {
        let url = spawn_http_server("HTTP/1.1 200 OK").await;
        let status = checker().probe(&ProbeTarget::Http(url)).await;
        assert!(status.healthy);
        assert_eq!(status.details.get("http_status").unwrap(), "200");
    }

    #[tokio::test]
    async fn http_probe_rejects_5xx() {
        let url = spawn_http_server("HTTP/1.1 503 Service Unavailable").await;
        let status = checker().probe(&ProbeTarget::Http(url)).await;
        assert!(!status.healthy);
    }
}
