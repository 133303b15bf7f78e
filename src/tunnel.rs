//! Public URLs from an external tunnel provider
//!
//! The provider is an external command (localtunnel's `lt` by default) that
//! prints its public URL once the tunnel is up. Its output goes to a log file
//! which is scanned for the URL, so the provider keeps running after the
//! launcher exits.

use crate::config::TunnelConfig;
#[cfg(unix)]
use crate::process::kill_group;
use crate::process::platform_process_group;
use futures::future::BoxFuture;
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How often the provider log is checked for the URL
const URL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a closing provider gets before it is killed
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Why no tunnel could be opened
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel provider '{0}' is not installed")]
    NotInstalled(String),
    #[error("tunnel provider gave no URL within {0:?}")]
    Timeout(Duration),
    #[error("tunnel provider failed: {0}")]
    Provider(String),
}

impl TunnelError {
    /// Stable classification code
    pub fn code(&self) -> &'static str {
        match self {
            TunnelError::NotInstalled(_) => "ERR_NOT_INSTALLED",
            TunnelError::Timeout(_) => "ERR_TIMEOUT",
            TunnelError::Provider(_) => "ERR_PROVIDER",
        }
    }
}

/// An open tunnel; the provider is stopped on drop unless detached
#[derive(Debug)]
pub struct Tunnel {
    /// Public origin, without trailing slash
    pub url: String,
    /// Whether the best-effort HEAD probe got any response
    pub probe_ok: bool,
    /// Credential visitors need, for providers that use one
    pub credential: Option<String>,
    pub pid: Option<u32>,
    child: Option<Child>,
}

impl Tunnel {
    /// A tunnel managed outside this process
    pub fn external(url: impl Into<String>, credential: Option<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            probe_ok: false,
            credential,
            pid: None,
            child: None,
        }
    }

    /// Leave the provider running after this handle is gone
    pub fn detach(mut self) -> Option<u32> {
        self.child.take();
        self.pid
    }

    /// Stop the provider and everything it started
    pub async fn close(mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Some(pid) = self.pid {
            let group = platform_process_group();
            match tokio::task::spawn_blocking(move || group.terminate(pid, CLOSE_GRACE_PERIOD)).await {
                Ok(Ok(termination)) => debug!(pid, signalled = ?termination.signalled, "Tunnel provider stopped"),
                Ok(Err(e)) => warn!(pid, error = %e, "Failed to stop tunnel provider"),
                Err(e) => warn!(pid, error = %e, "Tunnel stop task failed"),
            }
        }
        let _ = child.kill().await;
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            #[cfg(unix)]
            if let Some(pid) = self.pid {
                kill_group(pid);
            }
            let _ = child.start_kill();
        }
    }
}

/// A way to expose a local port under a public origin
pub trait TunnelProvider: Send + Sync {
    fn open(&self, port: u16, timeout: Duration) -> BoxFuture<'_, Result<Tunnel, TunnelError>>;
}

/// Tunnel provider driven by an external command
#[derive(Debug, Clone)]
pub struct CommandTunnel {
    command: String,
    args: Vec<String>,
    url_pattern: Regex,
    password_url: Option<String>,
    log_path: PathBuf,
    probe_timeout: Duration,
}

impl CommandTunnel {
    pub fn new(config: &TunnelConfig, log_dir: &Path) -> Result<Self, TunnelError> {
        let url_pattern = Regex::new(&config.url_pattern)
            .map_err(|e| TunnelError::Provider(format!("invalid url_pattern: {}", e)))?;
        Ok(Self {
            command: config.command.clone(),
            args: config.args.clone(),
            url_pattern,
            password_url: config.password_url.clone(),
            log_path: log_dir.join("tunnel.log"),
            probe_timeout: Duration::from_secs(10),
        })
    }

    /// Set the timeout of the HEAD probe and credential fetch (builder pattern)
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn spawn(&self, port: u16) -> Result<(Child, u64), TunnelError> {
        if let Some(dir) = self.log_path.parent() {
            fs::create_dir_all(dir).map_err(|e| TunnelError::Provider(e.to_string()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| TunnelError::Provider(e.to_string()))?;
        // Only output written by this run is scanned
        let offset = log.metadata().map(|m| m.len()).unwrap_or(0);
        let log_err = log.try_clone().map_err(|e| TunnelError::Provider(e.to_string()))?;

        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{port}", &port.to_string()))
            .collect();

        let mut cmd = Command::new(&self.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TunnelError::NotInstalled(self.command.clone()),
            _ => TunnelError::Provider(e.to_string()),
        })?;

        info!(command = %self.command, args = ?args, pid = ?child.id(), "Tunnel provider started");
        Ok((child, offset))
    }

    fn find_url(&self, offset: u64) -> Option<String> {
        let content = fs::read(&self.log_path).ok()?;
        let start = (offset as usize).min(content.len());
        let text = String::from_utf8_lossy(&content[start..]);
        self.url_pattern
            .find(&text)
            .map(|m| m.as_str().trim_end_matches('/').to_string())
    }

    async fn wait_for_url(&self, child: &mut Child, offset: u64, timeout: Duration) -> Result<String, TunnelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(url) = self.find_url(offset) {
                return Ok(url);
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(TunnelError::Provider(format!(
                        "exited with {} before printing a URL (see {})",
                        status,
                        self.log_path.display()
                    )))
                }
                Ok(None) => {}
                Err(e) => return Err(TunnelError::Provider(e.to_string())),
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::Timeout(timeout));
            }
            tokio::time::sleep(URL_POLL_INTERVAL).await;
        }
    }

    async fn open_inner(&self, port: u16, timeout: Duration) -> Result<Tunnel, TunnelError> {
        let (mut child, offset) = self.spawn(port)?;
        let pid = child.id();

        let url = match self.wait_for_url(&mut child, offset, timeout).await {
            Ok(url) => url,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };
        info!(port, url, "Tunnel established");

        let client = reqwest::Client::builder()
            .timeout(self.probe_timeout)
            .build()
            .map_err(|e| TunnelError::Provider(e.to_string()))?;

        // The wrapped port may not be serving yet; a failed probe keeps the URL
        let probe_ok = match client.head(&url).send().await {
            Ok(response) => {
                debug!(url, status = response.status().as_u16(), "Tunnel probe answered");
                true
            }
            Err(e) => {
                warn!(url, error = %e, "Tunnel probe failed");
                false
            }
        };

        let credential = match self.password_url {
            Some(ref password_url) => fetch_credential(&client, password_url).await,
            None => None,
        };

        Ok(Tunnel {
            url,
            probe_ok,
            credential,
            pid,
            child: Some(child),
        })
    }
}

impl TunnelProvider for CommandTunnel {
    fn open(&self, port: u16, timeout: Duration) -> BoxFuture<'_, Result<Tunnel, TunnelError>> {
        Box::pin(self.open_inner(port, timeout))
    }
}

async fn fetch_credential(client: &reqwest::Client, url: &str) -> Option<String> {
    let result = async { client.get(url).send().await?.error_for_status()?.text().await }.await;
    match result {
        Ok(body) if !body.trim().is_empty() => Some(body.trim().to_string()),
        Ok(_) => None,
        Err(e) => {
            warn!(url, error = %e, "Failed to fetch tunnel credential");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn tunnel(dir: &Path, command: &str, script: &str, pattern: &str) -> CommandTunnel {
        let config = TunnelConfig {
            command: command.to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            url_pattern: pattern.to_string(),
            password_url: None,
        };
        CommandTunnel::new(&config, dir)
            .unwrap()
            .with_probe_timeout(Duration::from_millis(500))
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TunnelError::NotInstalled("lt".into()).code(), "ERR_NOT_INSTALLED");
        assert_eq!(TunnelError::Timeout(Duration::from_secs(30)).code(), "ERR_TIMEOUT");
        assert_eq!(TunnelError::Provider("boom".into()).code(), "ERR_PROVIDER");
    }

    #[tokio::test]
    async fn test_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let provider = tunnel(dir.path(), "no-such-tunnel-binary", "", "https://x");

        let err = provider.open(9999, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.code(), "ERR_NOT_INSTALLED");
    }

    #[tokio::test]
    async fn test_timeout_without_url() {
        let dir = tempfile::tempdir().unwrap();
        let provider = tunnel(dir.path(), "sh", "echo connecting; sleep 10", r"https://[a-z.]+");

        let start = Instant::now();
        let err = provider.open(9999, Duration::from_millis(500)).await.unwrap_err();
        assert_eq!(err.code(), "ERR_TIMEOUT");
        assert_eq!(err.to_string(), "tunnel provider gave no URL within 500ms");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_early_exit_is_provider_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = tunnel(dir.path(), "sh", "echo failed >&2; exit 3", r"https://[a-z.]+");

        let err = provider.open(9999, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.code(), "ERR_PROVIDER");
    }

    #[tokio::test]
    async fn test_url_from_output_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let script = format!("echo \"your url is: http://127.0.0.1:{}/\"; sleep 10", port);
        let provider = tunnel(dir.path(), "sh", &script, r"http://127\.0\.0\.1:[0-9]+/?");

        let tunnel = provider.open(port, Duration::from_secs(5)).await.unwrap();
        assert_eq!(tunnel.url, format!("http://127.0.0.1:{}", port));
        assert!(tunnel.probe_ok);
        assert!(tunnel.credential.is_none());
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_port_placeholder_is_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let provider = tunnel(dir.path(), "sh", "echo https://port{port}.example; sleep 10", r"https://port[0-9]+\.example");

        let tunnel = provider.open(4321, Duration::from_secs(5)).await.unwrap();
        assert_eq!(tunnel.url, "https://port4321.example");
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_wrapped_provider() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("inner.pid");
        let script = format!(
            "sleep 30 & echo $! > {}; echo https://wrapped.example; wait",
            pid_file.display()
        );
        let provider = tunnel(dir.path(), "sh", &script, r"https://wrapped\.example");

        let tunnel = provider.open(4321, Duration::from_secs(5)).await.unwrap();
        let inner: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(crate::process::is_alive(inner));

        tunnel.close().await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while crate::process::is_alive(inner) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!crate::process::is_alive(inner));
    }
}
