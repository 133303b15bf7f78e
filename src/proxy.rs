//! The single-port reverse proxy
//!
//! One listener accepts every connection. Requests are matched against the
//! current route table by longest path prefix and forwarded to
//! `localhost:<port>` without path rewriting. WebSocket upgrades are spliced
//! through a raw HTTP/1.1 handshake with the target.

use crate::config::Config;
use crate::error::{json_error_response, LaunchError, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::ports::{PortRanges, RunMode};
use crate::probe::PortProber;
use crate::publish::Publisher;
use crate::routes::{build_route_table, local_base_url, ProxyOrigin, RouteTable, Router};
use crate::scanner::ServiceScanner;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest upstream response head accepted during an upgrade handshake
const MAX_RESPONSE_HEAD: usize = 16 * 1024;
/// Largest body relayed when an upstream refuses an upgrade
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Errors that make the proxy drop a connection instead of answering.
///
/// Only upgrade requests produce these: once a client asked to switch
/// protocols there is no useful HTTP error to send back.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no route for upgrade request to {0}")]
    NoRoute(String),
    #[error("upgrade to port {port} failed: {reason}")]
    UpgradeFailed { port: u16, reason: String },
}

/// A route table together with its compiled router
#[derive(Debug)]
pub struct RouteSnapshot {
    pub table: RouteTable,
    pub router: Router,
}

/// The route table currently used for dispatch, swapped atomically on refresh
#[derive(Debug, Clone)]
pub struct SharedRoutes {
    inner: Arc<RwLock<Arc<RouteSnapshot>>>,
}

impl SharedRoutes {
    pub fn new(table: RouteTable) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot(table)))),
        }
    }

    /// The current table; callers hold it for one request at most
    pub fn load(&self) -> Arc<RouteSnapshot> {
        Arc::clone(&self.inner.read())
    }

    pub fn store(&self, table: RouteTable) {
        *self.inner.write() = Arc::new(snapshot(table));
    }

    /// Resolve a request path to its target port
    pub fn resolve(&self, path: &str) -> Option<u16> {
        self.inner.read().router.resolve(path).map(|r| r.local_port)
    }
}

fn snapshot(table: RouteTable) -> RouteSnapshot {
    let router = Router::from_table(&table);
    RouteSnapshot { table, router }
}

struct ProxyContext {
    routes: SharedRoutes,
    pool: ConnectionPool,
    request_timeout: Duration,
}

/// The reverse proxy server
pub struct ProxyServer {
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        routes: SharedRoutes,
        pool_config: PoolConfig,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            context: Arc::new(ProxyContext {
                routes,
                pool: ConnectionPool::new(pool_config),
                request_timeout,
            }),
            shutdown_rx,
        }
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) {
        let local_addr = listener.local_addr().ok();
        info!(addr = ?local_addr, "Proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        let stats = self.context.pool.stats();
        info!(
            forwarded = stats.get_total_requests(),
            failed = stats.get_failed_requests(),
            "Proxy stopped"
        );
    }
}

/// Bind the proxy listener; failure is fatal to the caller
pub async fn bind_listener(bind: &str, port: u16) -> Result<TcpListener, LaunchError> {
    let ip: IpAddr = bind
        .parse()
        .map_err(|e| LaunchError::Configuration(format!("invalid bind address '{}': {}", bind, e)))?;
    let addr = SocketAddr::new(ip, port);

    TcpListener::bind(addr).await.map_err(|source| {
        error!(%addr, error = %source, "Proxy failed to bind");
        LaunchError::ProxyBind {
            addr: addr.to_string(),
            source,
        }
    })
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    set_forwarding_headers(&mut req, &request_id, client_addr);

    let path = req.uri().path().to_string();
    debug!(method = %req.method(), path, request_id, "Incoming request");

    let Some(port) = context.routes.resolve(&path) else {
        if is_upgrade_request(&req) {
            debug!(path, request_id, "Dropping upgrade with no route");
            return Err(ProxyError::NoRoute(path));
        }
        return Ok(json_error_response(
            ProxyErrorCode::UnknownRoute,
            format!("No route for {}", path),
        ));
    };

    if is_upgrade_request(&req) {
        return handle_upgrade(req, port, request_id, context.request_timeout).await;
    }

    let request_timeout = context.request_timeout;
    match tokio::time::timeout(request_timeout, context.pool.forward(req, port)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            warn!(port, path, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to localhost:{}", port),
            ))
        }
        Err(_) => {
            warn!(port, path, timeout_secs = request_timeout.as_secs(), "Request timed out");
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

/// Overwrite the forwarding headers; the proxy is the first trusted hop
fn set_forwarding_headers(req: &mut Request<Incoming>, request_id: &str, client_addr: SocketAddr) {
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request to send to the target
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: localhost:{}\r\n\r\n", port));
    request.into_bytes()
}

/// Read until the end of the response head.
///
/// Returns the head and whatever followed it in the same reads; those bytes
/// already belong to the upgraded stream (or the rejection body).
async fn read_response_head<S>(stream: &mut S) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response head too large"));
        }
    }
}

/// Parse the status line and headers of a raw HTTP response head
fn parse_response_head(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Connect to the target and perform the upgrade handshake
async fn upstream_handshake(
    raw_request: &[u8],
    port: u16,
) -> io::Result<(TcpStream, StatusCode, Vec<(String, String)>, Vec<u8>)> {
    let mut stream = TcpStream::connect(("localhost", port)).await?;
    stream.write_all(raw_request).await?;

    let (head, rest) = read_response_head(&mut stream).await?;
    let (status, headers) = parse_response_head(&head)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid upgrade response"))?;
    Ok((stream, status, headers, rest))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    port: u16,
    request_id: String,
    handshake_timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(port, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, port);

    let (mut upstream, status, response_headers, rest) =
        match tokio::time::timeout(handshake_timeout, upstream_handshake(&raw_request, port)).await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                warn!(port, request_id, error = %e, "Upgrade handshake failed");
                return Err(ProxyError::UpgradeFailed { port, reason: e.to_string() });
            }
            Err(_) => {
                warn!(port, request_id, "Upgrade handshake timed out");
                return Err(ProxyError::UpgradeFailed { port, reason: "handshake timed out".to_string() });
            }
        };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(port, status = %status, "Target declined upgrade, relaying its response");
        let body = read_rejection_body(&mut upstream, &response_headers, rest).await;
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if name.eq_ignore_ascii_case("transfer-encoding") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return response
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .map_err(|e| ProxyError::UpgradeFailed { port, reason: e.to_string() });
    }

    info!(port, request_id, upgrade_type, "Upgrade accepted");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .map_err(|e| ProxyError::UpgradeFailed { port, reason: e.to_string() })?;

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => splice(upgraded, upstream, rest, port, &request_id).await,
            Err(e) => warn!(port, request_id, error = %e, "Client upgrade failed"),
        }
    });

    Ok(response)
}

/// Body of a refused upgrade, bounded by Content-Length and a hard cap
async fn read_rejection_body(
    upstream: &mut TcpStream,
    headers: &[(String, String)],
    mut body: Vec<u8>,
) -> Vec<u8> {
    let Some(length) = header_value(headers, "content-length").and_then(|v| v.parse::<usize>().ok()) else {
        return body;
    };
    let length = length.min(MAX_REJECTION_BODY);

    let mut chunk = [0u8; 4096];
    while body.len() < length {
        match upstream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
        }
    }
    body.truncate(length);
    body
}

/// Copy bytes both ways between the upgraded client and the target
async fn splice(client: Upgraded, mut upstream: TcpStream, pending: Vec<u8>, port: u16, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !pending.is_empty() {
        if let Err(e) = client_io.write_all(&pending).await {
            debug!(port, request_id, error = %e, "Failed to relay buffered upgrade bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                port,
                request_id,
                client_to_upstream,
                upstream_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(port, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Rescans the port ranges and republishes the table when routes change
pub struct RouteRefresher {
    scanner: ServiceScanner,
    origin: Option<ProxyOrigin>,
    publisher: Publisher,
    routes: SharedRoutes,
    interval: Duration,
}

impl RouteRefresher {
    pub fn new(
        scanner: ServiceScanner,
        origin: Option<ProxyOrigin>,
        publisher: Publisher,
        routes: SharedRoutes,
        interval: Duration,
    ) -> Self {
        Self {
            scanner,
            origin,
            publisher,
            routes,
            interval,
        }
    }

    /// Scan once; publish if the routes changed or the file disappeared.
    ///
    /// Returns whether a new table was published.
    pub async fn refresh(&self) -> io::Result<bool> {
        let snapshot = self.scanner.scan().await;
        let table = build_route_table(self.scanner.ranges(), &snapshot, self.origin.as_ref());

        let current = self.routes.load();
        let unchanged = current.table.same_routes(&table) && self.publisher.routing_path().exists();
        if unchanged {
            return Ok(false);
        }

        self.publisher.publish(&table)?;
        info!(routes = table.len(), ports = ?table.ports(), "Route table updated");
        self.routes.store(table);
        Ok(true)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Failed to publish route table");
                    }
                }
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Options of the `proxy` subcommand
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub port: u16,
    /// Public origin; defaults to `http://localhost:<port>`
    pub base_url: Option<String>,
    pub mode: RunMode,
}

/// Run the proxy until `shutdown_rx` fires, then remove the published files
pub async fn run_proxy(
    config: &Config,
    options: ProxyOptions,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), LaunchError> {
    let base_url = options
        .base_url
        .clone()
        .unwrap_or_else(|| local_base_url(options.port));
    let origin = ProxyOrigin::new(options.port, base_url);
    let ranges: PortRanges = config.port_ranges().for_mode(options.mode);
    let publisher = config.server.publisher();

    // Nothing is published unless the port is ours
    let listener = bind_listener(&config.server.bind, options.port).await?;

    let routes = SharedRoutes::new(RouteTable::empty(Some(&origin)));
    let scanner = ServiceScanner::new(
        ranges,
        PortProber::new("localhost", config.defaults.probe_timeout()),
    );
    let refresher = RouteRefresher::new(
        scanner,
        Some(origin.clone()),
        publisher.clone(),
        routes.clone(),
        config.server.refresh_interval(),
    );

    info!(
        port = options.port,
        base_url = %origin.base_url,
        mode = %options.mode,
        routing_file = %publisher.routing_path().display(),
        "Starting proxy"
    );

    let refresh_task = tokio::spawn(refresher.run(shutdown_rx.clone()));

    let server = ProxyServer::new(
        routes,
        PoolConfig::from(&config.server),
        config.server.request_timeout(),
        shutdown_rx,
    );
    server.serve(listener).await;

    if let Err(e) = refresh_task.await {
        warn!(error = %e, "Route refresh task ended abnormally");
    }
    publisher.cleanup();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{RangeName, RouteMode, ServiceType};
    use crate::routes::RouteEntry;
    use crate::scanner::ServiceSnapshot;

    fn table_with(ports: &[u16]) -> RouteTable {
        let snapshot = ServiceSnapshot::from_ports(vec![(RangeName::Dev, ports.to_vec())]);
        build_route_table(&PortRanges::default(), &snapshot, Some(&ProxyOrigin::local(9999)))
    }

    #[test]
    fn test_shared_routes_swap() {
        let routes = SharedRoutes::new(table_with(&[10001]));
        assert_eq!(routes.resolve("/localhost_10001/api"), Some(10001));
        assert_eq!(routes.resolve("/localhost_10002/api"), None);

        let held = routes.load();
        routes.store(table_with(&[10002]));

        assert_eq!(routes.resolve("/localhost_10002/api"), Some(10002));
        assert_eq!(routes.resolve("/localhost_10001/api"), None);
        // A reader keeps the snapshot it loaded
        assert_eq!(held.router.resolve("/localhost_10001").unwrap().local_port, 10001);
    }

    #[test]
    fn test_direct_routes_are_not_served() {
        let mut table = table_with(&[10001]);
        table.routes.insert(
            "/localhost_10002".to_string(),
            RouteEntry {
                path: "/localhost_10002".to_string(),
                local_port: 10002,
                public_url: "http://localhost:10002".to_string(),
                mode: RouteMode::Direct,
                service_type: ServiceType::Backend,
            },
        );
        let routes = SharedRoutes::new(table);
        assert_eq!(routes.resolve("/localhost_10002"), None);
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .uri("/localhost_10001/ws")
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder()
            .uri("/localhost_10001/ws")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_upgrade_request_rewrites_host() {
        let req = Request::builder()
            .method("GET")
            .uri("/localhost_10001/ws?room=1")
            .header("Host", "abc.tunnel.example")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .body(())
            .unwrap();

        let raw = String::from_utf8(build_upgrade_request(&req, 10001)).unwrap();
        assert!(raw.starts_with("GET /localhost_10001/ws?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("Host: localhost:10001\r\n"));
        assert!(!raw.contains("abc.tunnel.example"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_response_head() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: abc=\r\n\r\n";
        let (status, headers) = parse_response_head(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(header_value(&headers, "sec-websocket-accept"), Some("abc="));

        assert!(parse_response_head(b"garbage\r\n\r\n").is_none());
    }

    #[tokio::test]
    async fn test_read_response_head_keeps_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"HTTP/1.1 101 Switching Protocols\r\n").await.unwrap();
            server.write_all(b"Upgrade: websocket\r\n\r\n\x81\x02hi").await.unwrap();
        });

        let (head, rest) = read_response_head(&mut client).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, b"\x81\x02hi");
    }

    #[tokio::test]
    async fn test_read_response_head_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);

        let err = read_response_head(&mut client).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_refresher_publishes_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let ranges = PortRanges::new(vec![crate::ports::PortRange::contiguous(
            RangeName::Dev,
            port..=port,
            ServiceType::Backend,
            RouteMode::Proxy,
        )]);
        let publisher = Publisher::new(dir.path().join("proxy-info.json"), dir.path().join("proxy-info.txt"));
        let origin = ProxyOrigin::local(9999);
        let routes = SharedRoutes::new(RouteTable::empty(Some(&origin)));
        let refresher = RouteRefresher::new(
            ServiceScanner::new(ranges, PortProber::new("localhost", Duration::from_millis(300))),
            Some(origin),
            publisher.clone(),
            routes.clone(),
            Duration::from_millis(50),
        );

        assert!(refresher.refresh().await.unwrap());
        assert_eq!(routes.resolve(&format!("/localhost_{}/", port)), Some(port));
        assert!(!refresher.refresh().await.unwrap());

        drop(listener);
        assert!(refresher.refresh().await.unwrap());
        assert!(publisher.read().unwrap().unwrap().is_empty());
    }
}
