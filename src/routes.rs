//! Routing table construction and path-prefix resolution

use crate::ports::{PortRanges, RouteMode, ServiceType};
use crate::scanner::ServiceSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Prefix every route path starts with, followed by the local port
pub const ROUTE_PREFIX: &str = "/localhost_";

/// Path prefix under which a local port is exposed
pub fn route_path(port: u16) -> String {
    format!("{}{}", ROUTE_PREFIX, port)
}

/// Base URL of the proxy when it is reached on this machine
pub fn local_base_url(proxy_port: u16) -> String {
    format!("http://localhost:{}", proxy_port)
}

/// One path-prefix to local-port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub path: String,
    pub local_port: u16,
    pub public_url: String,
    pub mode: RouteMode,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
}

/// The published routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTable {
    pub proxy_port: Option<u16>,
    pub base_url: Option<String>,
    pub mode: RouteMode,
    pub created_at: DateTime<Utc>,
    pub created_by_pid: u32,
    pub routes: BTreeMap<String, RouteEntry>,
}

impl RouteTable {
    /// An empty table, used before the first scan completes
    pub fn empty(proxy: Option<&ProxyOrigin>) -> Self {
        Self {
            proxy_port: proxy.map(|p| p.port),
            base_url: proxy.map(|p| p.base_url.clone()),
            mode: if proxy.is_some() { RouteMode::Proxy } else { RouteMode::Direct },
            created_at: Utc::now(),
            created_by_pid: std::process::id(),
            routes: BTreeMap::new(),
        }
    }

    /// Whether two tables route identically (metadata ignored)
    pub fn same_routes(&self, other: &RouteTable) -> bool {
        self.routes == other.routes && self.base_url == other.base_url && self.mode == other.mode
    }

    /// Local ports present in the table, ascending
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.routes.values().map(|r| r.local_port).collect();
        ports.sort_unstable();
        ports
    }

    pub fn backend_routes(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes
            .values()
            .filter(|r| r.service_type == ServiceType::Backend)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Where the proxy is reachable from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOrigin {
    pub port: u16,
    /// Public origin, e.g. `http://localhost:9999` or a tunnel URL
    pub base_url: String,
}

impl ProxyOrigin {
    pub fn new(port: u16, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            port,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn local(port: u16) -> Self {
        Self::new(port, local_base_url(port))
    }
}

/// Public URL of a local port given the table's origin and the port's mode
pub fn public_url(port: u16, mode: RouteMode, proxy: Option<&ProxyOrigin>) -> String {
    match (mode, proxy) {
        (RouteMode::Proxy, Some(origin)) => format!("{}{}", origin.base_url, route_path(port)),
        _ => format!("http://localhost:{}", port),
    }
}

/// Build a routing table from a scan.
///
/// Pure apart from `created_at` / `created_by_pid`: the same snapshot and origin
/// always produce the same routes. Ranges marked `direct` (or every range, when
/// there is no proxy) get direct routes.
pub fn build_route_table(
    ranges: &PortRanges,
    snapshot: &ServiceSnapshot,
    proxy: Option<&ProxyOrigin>,
) -> RouteTable {
    let mut table = RouteTable::empty(proxy);

    for (_, port) in snapshot.iter() {
        let Some(class) = ranges.classify(port) else {
            debug!(port, "Skipping active port outside every range");
            continue;
        };

        let mode = match proxy {
            Some(_) => class.mode,
            None => RouteMode::Direct,
        };
        let path = route_path(port);
        table.routes.insert(
            path.clone(),
            RouteEntry {
                path,
                local_port: port,
                public_url: public_url(port, mode, proxy),
                mode,
                service_type: class.service_type,
            },
        );
    }

    table
}

/// Longest-prefix path matcher over the proxied routes of a table
#[derive(Debug, Clone, Default)]
pub struct Router {
    /// Sorted by descending path length
    entries: Vec<RouteEntry>,
}

impl Router {
    pub fn new(mut entries: Vec<RouteEntry>) -> Self {
        // Length first; ties broken by path so resolution is deterministic
        entries.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then_with(|| a.path.cmp(&b.path)));
        Self { entries }
    }

    /// Router over the routes a proxy should serve
    pub fn from_table(table: &RouteTable) -> Self {
        Self::new(
            table
                .routes
                .values()
                .filter(|r| r.mode == RouteMode::Proxy)
                .cloned()
                .collect(),
        )
    }

    /// Resolve a request path.
    ///
    /// `/` only matches exactly; any other route matches by plain prefix, and
    /// the longest route wins.
    pub fn resolve(&self, request_path: &str) -> Option<&RouteEntry> {
        self.entries.iter().find(|entry| {
            if entry.path == "/" {
                request_path == "/"
            } else {
                request_path.starts_with(entry.path.as_str())
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
