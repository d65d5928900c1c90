//! # Probes
//!
//! The two inputs of the quality sampler: a round-trip probe against the
//! health endpoint, and a check whether any network interface is up at all.
//! Both sit behind traits so the sampler can be driven by scripted inputs.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use local_ip_address::local_ip;
use tracing::debug;

use crate::core::errors::{TransportError, TransportResult};

/// Measures round-trip latency to the health endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// One probe. `Err` covers timeouts, transport errors and non-2xx replies.
    async fn probe(&self) -> TransportResult<Duration>;
}

/// Reports whether the host has any usable network interface.
pub trait LinkMonitor: Send + Sync {
    /// `false` when no interface is active.
    fn has_active_interface(&self) -> bool;
}

/// # HTTP Health Probe
///
/// Issues `HEAD` against a fixed URL with a bounded timeout and times the
/// response headers.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Builds a probe with its own connection pool.
    pub fn new(url: impl Into<String>, timeout: Duration, user_agent: &str) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> TransportResult<Duration> {
        let started = Instant::now();
        let response = tokio::time::timeout(self.timeout, self.client.head(&self.url).send())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;
        let elapsed = started.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: format!("health probe returned {status}"),
            });
        }
        Ok(elapsed)
    }
}

/// Interface check backed by the OS routing table: an interface is considered
/// active when a local address for outbound traffic can be resolved.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLink;

impl LinkMonitor for SystemLink {
    fn has_active_interface(&self) -> bool {
        match local_ip() {
            Ok(ip) => !ip.is_loopback(),
            Err(e) => {
                debug!(error = %e, "No local address resolvable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn one_shot_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0_u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/api/v2/ping.php")
    }

    #[tokio::test]
    async fn head_probe_measures_success() {
        let url = one_shot_server("HTTP/1.1 200 OK").await;
        let probe = HttpHealthProbe::new(url, Duration::from_secs(2), "test").unwrap();
        let rtt = probe.probe().await.unwrap();
        assert!(rtt < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn non_2xx_is_a_failed_probe() {
        let url = one_shot_server("HTTP/1.1 503 Service Unavailable").await;
        let probe = HttpHealthProbe::new(url, Duration::from_secs(2), "test").unwrap();
        let err = probe.probe().await.unwrap_err();
        assert!(matches!(err, TransportError::Api { status: 503, .. }));
    }
}
