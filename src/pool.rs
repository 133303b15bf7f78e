//! Connection pool for upstream HTTP connections
//!
//! Every route targets `localhost:<port>`, so one pooled client serves all of
//! them; idle connections are kept per port.

use crate::config::ServerConfig;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests forwarded through the pool
    pub total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per upstream port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: server.pool_idle_timeout(),
        }
    }
}

/// A pooled HTTP client that forwards requests to local ports
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to `localhost:<port>`, keeping its path and query.
    ///
    /// The `Host` header is rewritten to the target; every other header and
    /// the body pass through untouched.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let (mut parts, body) = req.into_parts();

        parts.uri = upstream_uri(port, &parts.uri)?;
        let host = HeaderValue::from_str(&format!("localhost:{}", port))
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        parts.headers.insert(HOST, host);
        // The upstream leg is always HTTP/1.1, whatever the client spoke
        parts.version = hyper::Version::HTTP_11;

        self.stats.record_request();

        let response = match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// `http://localhost:<port>` plus the request path and query
pub fn upstream_uri(port: u16, original: &Uri) -> Result<Uri, PoolError> {
    let path = original.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://localhost:{}{}", port, path)
        .parse::<Uri>()
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_config_from_server() {
        let server = ServerConfig {
            pool_max_idle_per_host: 3,
            pool_idle_timeout_secs: 12,
            ..ServerConfig::default()
        };
        let config = PoolConfig::from(&server);
        assert_eq!(config.max_idle_per_host, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[test]
    fn test_upstream_uri_keeps_path_and_query() {
        let original: Uri = "/localhost_10001/api/items?page=2".parse().unwrap();
        let uri = upstream_uri(10001, &original).unwrap();
        assert_eq!(uri.to_string(), "http://localhost:10001/localhost_10001/api/items?page=2");

        let absolute: Uri = "http://example.com/localhost_10000".parse().unwrap();
        assert_eq!(
            upstream_uri(10000, &absolute).unwrap().to_string(),
            "http://localhost:10000/localhost_10000"
        );
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.stats().get_total_requests(), 0);
    }
}
