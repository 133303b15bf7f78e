//! TCP port probing
//!
//! A port counts as active when a TCP connection to it succeeds within the
//! timeout. Services may bind only one loopback family, so `localhost` is tried
//! as IPv4 first and then IPv6.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default per-port connect timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Probes single ports for listening TCP servers
#[derive(Debug, Clone)]
pub struct PortProber {
    host: String,
    timeout: Duration,
}

impl Default for PortProber {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PROBE_TIMEOUT)
    }
}

impl PortProber {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }

    /// Returns true if something accepts connections on `port`.
    ///
    /// Never fails: refused connections, resolution errors and timeouts all
    /// resolve to "inactive".
    pub async fn is_active(&self, port: u16) -> bool {
        probe_port(&self.host, port, self.timeout).await
    }
}

/// Check whether `host:port` accepts TCP connections within `timeout`.
///
/// Each candidate address gets its own `timeout`.
pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> bool {
    for addr in candidate_addrs(host, port).await {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => {
                debug!(port, %addr, "Port is active");
                return true;
            }
            Ok(Err(e)) => {
                debug!(port, %addr, error = %e, "Port probe refused");
            }
            Err(_) => {
                debug!(port, %addr, "Port probe timed out");
            }
        }
    }
    false
}

async fn candidate_addrs(host: &str, port: u16) -> Vec<SocketAddr> {
    if host.eq_ignore_ascii_case("localhost") {
        return vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
        ];
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![SocketAddr::new(ip, port)];
    }

    match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => {
            let mut addrs: Vec<SocketAddr> = addrs.collect();
            // Same preference order as for localhost
            addrs.sort_by_key(|a| a.is_ipv6());
            addrs
        }
        Err(e) => {
            debug!(host, port, error = %e, "Failed to resolve probe host");
            Vec::new()
        }
    }
}
