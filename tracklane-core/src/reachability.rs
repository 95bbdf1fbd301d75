//! Connectivity checks consulted before every flush

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Answers whether the tracking API can currently be reached.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Connectivity state pushed in by the host application.
#[derive(Debug)]
pub struct StaticReachability {
    connected: AtomicBool,
}

impl StaticReachability {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for StaticReachability {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl Reachability for StaticReachability {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Probes the API host with a TCP connect.
#[derive(Debug, Clone)]
pub struct HostReachability {
    host: String,
    port: u16,
    timeout: Duration,
}

impl HostReachability {
    /// Probe the host and port of `base_url`
    pub fn from_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid base_url {:?}: {}", base_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("base_url {:?} has no host", base_url)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Config(format!("base_url {:?} has no port", base_url)))?;
        Ok(Self {
            host,
            port,
            timeout,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Reachability for HostReachability {
    async fn is_connected(&self) -> bool {
        let address = self.address();
        let connect = tokio::net::TcpStream::connect(address.as_str());
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(address = %address, error = %e, "Host unreachable");
                false
            }
            Err(_) => {
                tracing::debug!(address = %address, "Reachability probe timed out");
                false
            }
        }
    }
}
