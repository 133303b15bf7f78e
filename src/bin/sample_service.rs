//! Reference service for the portgate launch contract
//!
//! Environment variables:
//! - PORT: port to listen on (required)
//! - TRUE_URL: public URL of this service, echoed back on `/`
//! - SERVICE_NAME: name reported by `/api/health` (default: sample)
//! - PROXY_ENABLED / PROXY_INFO_PATH / PROXY_GRACE_PERIOD_SECS: when the proxy is
//!   enabled, wait for the routing file before serving
//! - HEALTH_STATUS: HTTP status for `/api/health` (default: 200)
//! - STARTUP_DELAY_MS: delay before binding (default: 0)

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use portgate::publish::read_route_table;
use portgate::routes::route_path;
use serde_json::json;
use std::convert::Infallible;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Debug)]
struct ServiceInfo {
    name: String,
    port: u16,
    true_url: Option<String>,
    health_status: StatusCode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("sample_service=info".parse()?))
        .init();

    let port: u16 = env::var("PORT")
        .map_err(|_| anyhow::anyhow!("PORT environment variable required"))?
        .parse()
        .map_err(|e| anyhow::anyhow!("PORT must be a valid port number: {}", e))?;

    let health_status = env::var("HEALTH_STATUS")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let info = Arc::new(ServiceInfo {
        name: env::var("SERVICE_NAME").unwrap_or_else(|_| "sample".to_string()),
        port,
        true_url: env::var("TRUE_URL").ok(),
        health_status,
    });

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if startup_delay > 0 {
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    if env::var("PROXY_ENABLED").map(|v| v == "true").unwrap_or(false) {
        let path = env::var("PROXY_INFO_PATH")
            .map(PathBuf::from)
            .map_err(|_| anyhow::anyhow!("PROXY_INFO_PATH required when PROXY_ENABLED=true"))?;
        let grace = env::var("PROXY_GRACE_PERIOD_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        wait_for_routing_file(&path, port, Duration::from_secs(grace)).await?;
    }

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, name = %info.name, true_url = ?info.true_url, "Listening");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        let info = Arc::clone(&info);
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(Arc::clone(&info), req));
            if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                error!(error = %e, "Connection error");
            }
        });
    }
}

/// Block until the proxy published the routing file; fatal after `grace`
async fn wait_for_routing_file(path: &Path, port: u16, grace: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + grace;
    loop {
        match read_route_table(path) {
            Ok(Some(table)) => {
                let public_url = table
                    .routes
                    .get(&route_path(port))
                    .map(|r| r.public_url.clone());
                info!(path = %path.display(), public_url = ?public_url, "Routing file found");
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Routing file unreadable"),
        }
        if Instant::now() >= deadline {
            anyhow::bail!("routing file {} did not appear within {}s", path.display(), grace.as_secs());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn handle(info: Arc<ServiceInfo>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let prefix = route_path(info.port);
    let full_path = req.uri().path();
    let path = match full_path.strip_prefix(&prefix) {
        Some("") => "/",
        Some(rest) => rest,
        None => full_path,
    };

    let (status, body) = match path {
        "/api/health" => (
            info.health_status,
            json!({
                "status": if info.health_status.is_success() { "ok" } else { "error" },
                "service": info.name,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        ),
        _ => (
            StatusCode::OK,
            json!({
                "service": info.name,
                "port": info.port,
                "true_url": info.true_url,
                "path": path,
            }),
        ),
    };

    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    Ok(response)
}
