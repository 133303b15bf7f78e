//! Publishing the routing table to disk
//!
//! The routing file is written to a temporary file in the same directory and
//! renamed over the canonical path, so readers only ever see complete JSON.
//! A plain-text report with the same content is written next to it.

use crate::routes::RouteTable;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error reading a published routing file
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to read routing file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("routing file {path} is not a valid route table: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Writes and removes the routing file and its report
#[derive(Debug, Clone)]
pub struct Publisher {
    routing_path: PathBuf,
    report_path: PathBuf,
}

impl Publisher {
    pub fn new(routing_path: impl Into<PathBuf>, report_path: impl Into<PathBuf>) -> Self {
        Self {
            routing_path: routing_path.into(),
            report_path: report_path.into(),
        }
    }

    pub fn routing_path(&self) -> &Path {
        &self.routing_path
    }

    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    /// Atomically replace the routing file and the report
    pub fn publish(&self, table: &RouteTable) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(table).map_err(io::Error::other)?;
        write_atomic(&self.routing_path, &json)?;
        write_atomic(&self.report_path, render_report(table).as_bytes())?;

        debug!(
            path = %self.routing_path.display(),
            routes = table.len(),
            "Routing table published"
        );
        Ok(())
    }

    /// Read the published table; a missing file is `Ok(None)`
    pub fn read(&self) -> Result<Option<RouteTable>, PublishError> {
        read_route_table(&self.routing_path)
    }

    /// Remove the routing file, the report and any leftover temp files.
    ///
    /// Missing files are not an error; other failures are logged.
    pub fn cleanup(&self) {
        for path in [&self.routing_path, &self.report_path] {
            match fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "Removed published file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove published file"),
            }
            remove_temp_files(path);
        }
    }
}

/// Read a routing file; a missing file is `Ok(None)`
pub fn read_route_table(path: &Path) -> Result<Option<RouteTable>, PublishError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PublishError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| PublishError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn temp_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(".{}.", name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&temp_prefix(path))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn remove_temp_files(path: &Path) {
    let prefix = temp_prefix(path);
    let Ok(entries) = fs::read_dir(parent_dir(path)) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".tmp") {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "Failed to remove stale temp file");
            }
        }
    }
}

/// Human-readable mirror of a routing table
pub fn render_report(table: &RouteTable) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Routing table ({} mode)", table.mode);
    let _ = writeln!(
        out,
        "Proxy port: {}",
        table.proxy_port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
    );
    let _ = writeln!(out, "Base URL:   {}", table.base_url.as_deref().unwrap_or("-"));
    let _ = writeln!(
        out,
        "Created:    {} by pid {}",
        table.created_at.to_rfc3339(),
        table.created_by_pid
    );
    let _ = writeln!(out);

    if table.routes.is_empty() {
        let _ = writeln!(out, "No active services.");
        return out;
    }

    let _ = writeln!(out, "{:<20} {:>6}  {:<9} {:<7} PUBLIC URL", "PATH", "PORT", "TYPE", "MODE");
    for route in table.routes.values() {
        let _ = writeln!(
            out,
            "{:<20} {:>6}  {:<9} {:<7} {}",
            route.path, route.local_port, route.service_type.to_string(), route.mode.to_string(), route.public_url
        );
    }
    out
}
