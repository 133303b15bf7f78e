//! Health probes against service `/api/health` endpoints

use crate::routes::route_path;
use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Outcome of one health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResult {
    pub port: u16,
    pub url: String,
    pub healthy: bool,
    /// HTTP status, if a response arrived
    pub status: Option<u16>,
    /// Reported status or the failure reason
    pub detail: String,
}

/// Issues health probes, directly or through the proxy
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
    path: String,
    /// When set, probes go through `http://localhost:<proxy_port>/localhost_<port>`
    proxy_port: Option<u16>,
}

impl HealthChecker {
    pub fn new(path: &str, timeout: Duration, proxy_port: Option<u16>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Ok(Self { client, path, proxy_port })
    }

    pub fn url_for(&self, port: u16) -> String {
        match self.proxy_port {
            Some(proxy_port) => format!("http://localhost:{}{}{}", proxy_port, route_path(port), self.path),
            None => format!("http://localhost:{}{}", port, self.path),
        }
    }

    /// Probe one port; healthy means 2xx with a JSON `status` of "ok"
    pub async fn check(&self, port: u16) -> HealthResult {
        let url = self.url_for(port);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(port, url, error = %e, "Health probe failed");
                return HealthResult {
                    port,
                    url,
                    healthy: false,
                    status: None,
                    detail: if e.is_timeout() { "timed out".to_string() } else { "unreachable".to_string() },
                };
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let reported = reported_status(&body);

        let healthy = status.is_success() && reported.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("ok"));
        let detail = match (&reported, status.is_success()) {
            (Some(s), true) => format!("status \"{}\"", s),
            (Some(s), false) => format!("HTTP {}, status \"{}\"", status.as_u16(), s),
            (None, true) => "response has no status field".to_string(),
            (None, false) => format!("HTTP {}", status.as_u16()),
        };

        debug!(port, url, http_status = status.as_u16(), healthy, "Health probe");
        HealthResult {
            port,
            url,
            healthy,
            status: Some(status.as_u16()),
            detail,
        }
    }

    /// Probe all ports concurrently; results keep the input order
    pub async fn check_all(&self, ports: &[u16]) -> Vec<HealthResult> {
        join_all(ports.iter().map(|port| self.check(*port))).await
    }
}

fn reported_status(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("status")?.as_str().map(str::to_string)
}
