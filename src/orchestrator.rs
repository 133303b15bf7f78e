//! The launch control loop
//!
//! A launch takes the run lock, clears every known port, spawns the requested
//! services plus the hub, optionally starts the proxy, then polls the published
//! route table and the services' health endpoints until everything converged
//! or the launch timeout expired.

use crate::config::{CommandConfig, Config, ServiceConfig, HUB_SERVICE};
use crate::error::LaunchError;
use crate::health::{HealthChecker, HealthResult};
use crate::lock::{self, RunLock};
use crate::ports::{PortRanges, RouteMode, RunMode, ServiceType};
use crate::probe::PortProber;
use crate::process::{
    self, platform_process_group, reclaim_ports, ProcessGroup, ProcessRole, ReclaimReport,
    ServiceDescriptor, SpawnedProcess,
};
use crate::publish::Publisher;
use crate::routes::{build_route_table, local_base_url, public_url, route_path, ProxyOrigin, RouteTable};
use crate::scanner::ServiceScanner;
use crate::tunnel::{CommandTunnel, Tunnel, TunnelProvider};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// File in the state directory holding the pid of a detached tunnel provider
const TUNNEL_PID_FILE: &str = "tunnel.pid";

/// Where the public URL comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeployTarget {
    /// `http://localhost:<proxy port>`
    #[default]
    Local,
    /// An external tunnel provider wrapping the proxy port
    Tunnel,
    /// A URL forwarded to the proxy port by something else (`--public-url`)
    PortForward,
}

/// What to launch and how
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Services to launch besides the hub
    pub services: Vec<String>,
    pub mode: RunMode,
    /// Route everything through the proxy port
    pub proxy: bool,
    pub target: DeployTarget,
    pub public_url: Option<String>,
    /// Overrides `launch_timeout_secs`
    pub timeout: Option<Duration>,
    /// Stay in the foreground and stop everything on SIGINT/SIGTERM
    pub attach: bool,
}

/// Steps of a launch, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    AcquireLock,
    ReclaimPorts,
    PurgeState,
    ResolveUrl,
    SpawnServices,
    StartProxy,
    PollConvergence,
    Success,
    FailedTimeout,
    FailedError,
}

impl fmt::Display for LaunchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LaunchPhase::AcquireLock => "acquire-lock",
            LaunchPhase::ReclaimPorts => "reclaim-ports",
            LaunchPhase::PurgeState => "purge-state",
            LaunchPhase::ResolveUrl => "resolve-url",
            LaunchPhase::SpawnServices => "spawn-services",
            LaunchPhase::StartProxy => "start-proxy",
            LaunchPhase::PollConvergence => "poll-convergence",
            LaunchPhase::Success => "success",
            LaunchPhase::FailedTimeout => "failed-timeout",
            LaunchPhase::FailedError => "failed-error",
        };
        f.write_str(name)
    }
}

/// A service left out of the launch and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedService {
    pub service: String,
    pub reason: String,
}

/// Diagnostic for a launch that did not converge
#[derive(Debug, Clone, Default)]
pub struct ConvergenceReport {
    pub mode: Option<RunMode>,
    pub elapsed: Duration,
    /// Ports the launched services should bind
    pub expected_ports: Vec<u16>,
    /// Ports present in the last route table seen
    pub published_ports: Vec<u16>,
    /// Expected ports absent from that table
    pub missing_ports: Vec<u16>,
    /// Last health result per backend route
    pub health: Vec<HealthResult>,
    pub skipped: Vec<SkippedService>,
}

impl ConvergenceReport {
    pub fn unhealthy(&self) -> impl Iterator<Item = &HealthResult> {
        self.health.iter().filter(|h| !h.healthy)
    }
}

impl fmt::Display for ConvergenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "expected {} ports, {} published after {}s{}",
            self.expected_ports.len(),
            self.published_ports.len(),
            self.elapsed.as_secs(),
            self.mode.map(|m| format!(" ({} mode)", m)).unwrap_or_default()
        )?;
        writeln!(f, "  expected:  {}", join_ports(&self.expected_ports))?;
        writeln!(f, "  published: {}", join_ports(&self.published_ports))?;
        if !self.missing_ports.is_empty() {
            writeln!(f, "  missing:   {}", join_ports(&self.missing_ports))?;
        }
        for skipped in &self.skipped {
            writeln!(f, "  skipped:   {} ({})", skipped.service, skipped.reason)?;
        }
        if self.health.is_empty() {
            writeln!(f, "  health:    no backend route was checked")?;
        } else {
            writeln!(f, "  health:")?;
            for h in &self.health {
                writeln!(
                    f,
                    "    {:>6}  {:<9}  {}  {}",
                    h.port,
                    if h.healthy { "healthy" } else { "UNHEALTHY" },
                    h.detail,
                    h.url
                )?;
            }
        }
        Ok(())
    }
}

fn join_ports(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
}

/// Result of a successful launch
#[derive(Debug)]
pub struct LaunchOutcome {
    /// Where the hub is reachable
    pub public_url: String,
    pub credential: Option<String>,
    pub routes: RouteTable,
    pub log_dir: PathBuf,
    pub skipped: Vec<SkippedService>,
    pub processes: Vec<(String, u32)>,
}

impl fmt::Display for LaunchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hub: {}", self.public_url)?;
        if let Some(ref credential) = self.credential {
            writeln!(f, "Tunnel password: {}", credential)?;
        }
        for route in self.routes.routes.values() {
            writeln!(f, "  {:<20} {:<9} {}", route.path, route.service_type.to_string(), route.public_url)?;
        }
        for skipped in &self.skipped {
            writeln!(f, "  skipped {}: {}", skipped.service, skipped.reason)?;
        }
        write!(f, "Logs: {}", self.log_dir.display())
    }
}

/// A service resolved from the config for this launch
#[derive(Debug, Clone)]
struct PlannedService {
    name: String,
    config: ServiceConfig,
}

/// Runs launches and teardowns for one config
pub struct Launcher {
    config: Config,
    config_path: Option<PathBuf>,
    group: Arc<dyn ProcessGroup>,
    tunnel: Option<Box<dyn TunnelProvider>>,
}

impl Launcher {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
            group: platform_process_group(),
            tunnel: None,
        }
    }

    /// Use a specific tunnel provider instead of the configured command
    pub fn with_tunnel_provider(mut self, provider: Box<dyn TunnelProvider>) -> Self {
        self.tunnel = Some(provider);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn publisher(&self) -> Publisher {
        self.config.server.publisher()
    }

    fn enter(&self, phase: LaunchPhase) {
        debug!(%phase, "Launch phase");
    }

    /// Every port a launch may have left behind, plus the proxy port
    fn known_ports(&self) -> BTreeSet<u16> {
        let mut ports: BTreeSet<u16> = self.config.port_ranges().all_ports().into_iter().collect();
        ports.insert(self.config.server.proxy_port);
        ports
    }

    /// Launch the hub and `options.services` and wait for convergence
    pub async fn launch(
        &self,
        options: &LaunchOptions,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<LaunchOutcome, LaunchError> {
        self.enter(LaunchPhase::AcquireLock);
        let run_lock = RunLock::acquire(self.config.server.lock_path())?;

        // Fail on bad arguments before anything is killed
        let planned = self.plan(options)?;
        self.check_target(options)?;

        self.enter(LaunchPhase::ReclaimPorts);
        self.reclaim().await;

        self.enter(LaunchPhase::PurgeState);
        let publisher = self.publisher();
        publisher.cleanup();

        self.enter(LaunchPhase::ResolveUrl);
        let (origin, tunnel) = self.resolve_origin(options).await?;

        let mut run = LaunchRun {
            launcher: self,
            options,
            origin,
            tunnel,
            spawned: Vec::new(),
            proxy: None,
            skipped: Vec::new(),
            expected: BTreeSet::new(),
            publisher,
        };

        let result = run.execute(planned, shutdown_rx.clone()).await;
        match result {
            Ok(outcome) => {
                info!(public_url = %outcome.public_url, routes = outcome.routes.len(), "Launch converged");
                if options.attach {
                    run.attach(shutdown_rx).await;
                } else {
                    run.detach();
                }
                run_lock.release();
                Ok(outcome)
            }
            Err(e) => {
                let phase = if matches!(e, LaunchError::ConvergenceTimeout(_)) {
                    LaunchPhase::FailedTimeout
                } else {
                    LaunchPhase::FailedError
                };
                error!(%phase, error = %e, "Launch failed");
                run.fail(&e).await;
                run_lock.release();
                Err(e)
            }
        }
    }

    /// Stop everything on the known ports and remove published state
    pub async fn down(&self) -> Result<ReclaimReport, LaunchError> {
        let lock_path = self.config.server.lock_path();
        if lock::clear_stale(&lock_path) {
            info!(path = %lock_path.display(), "Removed stale run lock");
        }
        let _lock = RunLock::acquire(&lock_path)?;

        let report = self.reclaim().await;
        self.publisher().cleanup();
        Ok(report)
    }

    async fn reclaim(&self) -> ReclaimReport {
        let grace = self.config.defaults.shutdown_grace_period();
        self.stop_detached_tunnel(grace).await;

        let report = reclaim_ports(self.known_ports(), Arc::clone(&self.group), grace).await;
        if !report.terminated.is_empty() {
            info!(terminated = report.terminated.len(), "Reclaimed ports");
        }
        report
    }

    async fn stop_detached_tunnel(&self, grace: Duration) {
        let path = self.config.server.state_dir.join(TUNNEL_PID_FILE);
        let Some(pid) = lock::read_holder(&path).and_then(|p| p.parse::<u32>().ok()) else {
            return;
        };
        if process::is_alive(pid) {
            let group = Arc::clone(&self.group);
            match tokio::task::spawn_blocking(move || group.terminate(pid, grace)).await {
                Ok(Ok(_)) => info!(pid, "Stopped previous tunnel provider"),
                Ok(Err(e)) => warn!(pid, error = %e, "Failed to stop previous tunnel provider"),
                Err(e) => warn!(pid, error = %e, "Tunnel termination task panicked"),
            }
        }
        let _ = std::fs::remove_file(&path);
    }

    /// The hub plus the requested services, validated for `options.mode`
    fn plan(&self, options: &LaunchOptions) -> Result<Vec<PlannedService>, LaunchError> {
        let mut names: Vec<String> = Vec::new();
        if self.config.hub.is_some() {
            names.push(HUB_SERVICE.to_string());
        } else {
            warn!("No [hub] section configured; launching without a hub");
        }
        for name in &options.services {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        if names.is_empty() {
            return Err(LaunchError::Configuration("nothing to launch".to_string()));
        }

        let mut planned = Vec::new();
        for name in names {
            let service = self.config.service(&name).ok_or_else(|| {
                LaunchError::Configuration(format!("unknown service '{}'", name))
            })?;
            service
                .check_launchable(&name, options.mode)
                .map_err(LaunchError::Configuration)?;
            planned.push(PlannedService { name, config: service });
        }
        Ok(planned)
    }

    fn check_target(&self, options: &LaunchOptions) -> Result<(), LaunchError> {
        if !options.proxy && options.target != DeployTarget::Local {
            return Err(LaunchError::Configuration(
                "tunnel and port-forward targets need the proxy".to_string(),
            ));
        }
        if options.target == DeployTarget::PortForward && options.public_url.is_none() {
            return Err(LaunchError::Configuration(
                "--public-url is required for port-forward".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_origin(
        &self,
        options: &LaunchOptions,
    ) -> Result<(Option<ProxyOrigin>, Option<Tunnel>), LaunchError> {
        self.check_target(options)?;
        let proxy_port = self.config.server.proxy_port;

        if !options.proxy {
            return Ok((None, None));
        }

        match options.target {
            DeployTarget::Local => Ok((Some(ProxyOrigin::local(proxy_port)), None)),
            DeployTarget::PortForward => {
                let url = options.public_url.clone().ok_or_else(|| {
                    LaunchError::Configuration("--public-url is required for port-forward".to_string())
                })?;
                Ok((Some(ProxyOrigin::new(proxy_port, url)), None))
            }
            DeployTarget::Tunnel => {
                let timeout = self.config.defaults.tunnel_timeout();
                let tunnel = match self.tunnel {
                    Some(ref provider) => provider.open(proxy_port, timeout).await?,
                    None => {
                        let provider = CommandTunnel::new(&self.config.tunnel, &self.config.server.log_path())?;
                        provider.open(proxy_port, timeout).await?
                    }
                };
                Ok((Some(ProxyOrigin::new(proxy_port, tunnel.url.clone())), Some(tunnel)))
            }
        }
    }

    /// Environment and command of every process of one service
    fn descriptors(
        &self,
        service: &PlannedService,
        options: &LaunchOptions,
        ranges: &PortRanges,
        origin: Option<&ProxyOrigin>,
    ) -> Result<Vec<ServiceDescriptor>, LaunchError> {
        let mode = options.mode;
        let cfg = &service.config;
        let backend_port = cfg.backend_port(mode).ok_or_else(|| {
            LaunchError::Configuration(format!("service '{}' has no port for {} mode", service.name, mode))
        })?;

        let url_of = |port: u16| {
            let route_mode = ranges.classify(port).map(|c| c.mode).unwrap_or(RouteMode::Direct);
            public_url(port, route_mode, origin)
        };

        let mut common = BTreeMap::new();
        common.insert("RUN_MODE".to_string(), mode.as_str().to_string());
        if origin.is_some() {
            common.insert("PROXY_ENABLED".to_string(), "true".to_string());
            common.insert(
                "PROXY_INFO_PATH".to_string(),
                absolute(&self.config.server.routing_path()).display().to_string(),
            );
            common.insert(
                "PROXY_GRACE_PERIOD_SECS".to_string(),
                self.config.defaults.proxy_grace_period().as_secs().to_string(),
            );
        }

        let backend_url = url_of(backend_port);
        let mut descriptors = Vec::new();

        let mut env = common.clone();
        env.insert("PORT".to_string(), backend_port.to_string());
        env.insert("TRUE_URL".to_string(), backend_url.clone());
        descriptors.push(self.descriptor(service, ProcessRole::Backend, &cfg.backend, env)?);

        if let (Some(frontend), Some(vite_port)) = (cfg.frontend.as_ref(), cfg.frontend_port(mode)) {
            let mut env = common;
            env.insert("PORT".to_string(), vite_port.to_string());
            env.insert("BACKEND_URL".to_string(), backend_url);
            if origin.is_some() {
                env.insert("VITE_BASE_PATH".to_string(), format!("{}/", route_path(vite_port)));
            }
            descriptors.push(self.descriptor(service, ProcessRole::Frontend, frontend, env)?);
        }

        Ok(descriptors)
    }

    fn descriptor(
        &self,
        service: &PlannedService,
        role: ProcessRole,
        command: &CommandConfig,
        contract: BTreeMap<String, String>,
    ) -> Result<ServiceDescriptor, LaunchError> {
        let (program, args) = command.argv().map_err(LaunchError::Configuration)?;

        // Configured values first, the contract wins on conflicts
        let mut environment = command.env.clone();
        environment.extend(contract);
        for name in &service.config.required_env {
            if !environment.contains_key(name) {
                if let Ok(value) = std::env::var(name) {
                    environment.insert(name.clone(), value);
                }
            }
        }

        let working_directory = match (&service.config.working_dir, &command.working_dir) {
            (Some(base), Some(sub)) => Some(base.join(sub)),
            (Some(base), None) => Some(base.clone()),
            (None, Some(sub)) => Some(sub.clone()),
            (None, None) => None,
        };

        let suffix = match role {
            ProcessRole::Backend => "backend",
            ProcessRole::Frontend => "frontend",
            ProcessRole::Proxy => "proxy",
        };

        Ok(ServiceDescriptor {
            label: format!("{}-{}", service.name, suffix),
            service: service.name.clone(),
            role,
            command: program,
            args,
            working_directory,
            environment,
        })
    }

    fn proxy_descriptor(&self, origin: &ProxyOrigin, mode: RunMode) -> Result<ServiceDescriptor, LaunchError> {
        let command = match self.config.server.proxy_command {
            Some(ref command) => command.clone(),
            None => std::env::current_exe()?,
        };

        let mut args = vec![
            "proxy".to_string(),
            "--port".to_string(),
            origin.port.to_string(),
            "--base-url".to_string(),
            origin.base_url.clone(),
            "--mode".to_string(),
            mode.as_str().to_string(),
        ];
        if let Some(ref path) = self.config_path {
            args.insert(0, absolute(path).display().to_string());
            args.insert(0, "--config".to_string());
        }

        Ok(ServiceDescriptor {
            label: "proxy".to_string(),
            service: "proxy".to_string(),
            role: ProcessRole::Proxy,
            command: command.display().to_string(),
            args,
            working_directory: None,
            environment: BTreeMap::new(),
        })
    }

    /// Public URL of the hub (its frontend in dev-vite mode)
    fn hub_url(&self, planned: &[PlannedService], mode: RunMode, ranges: &PortRanges, origin: Option<&ProxyOrigin>) -> String {
        let hub = planned.iter().find(|s| s.name == HUB_SERVICE);
        let port = hub.and_then(|h| h.config.frontend_port(mode).or(h.config.backend_port(mode)));
        match port {
            Some(port) => {
                let route_mode = ranges.classify(port).map(|c| c.mode).unwrap_or(RouteMode::Direct);
                public_url(port, route_mode, origin)
            }
            None => origin
                .map(|o| o.base_url.clone())
                .unwrap_or_else(|| local_base_url(self.config.server.proxy_port)),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// State of one launch after the URL is known
struct LaunchRun<'a> {
    launcher: &'a Launcher,
    options: &'a LaunchOptions,
    origin: Option<ProxyOrigin>,
    tunnel: Option<Tunnel>,
    spawned: Vec<SpawnedProcess>,
    proxy: Option<SpawnedProcess>,
    skipped: Vec<SkippedService>,
    expected: BTreeSet<u16>,
    publisher: Publisher,
}

impl LaunchRun<'_> {
    async fn execute(
        &mut self,
        planned: Vec<PlannedService>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<LaunchOutcome, LaunchError> {
        let launcher = self.launcher;
        let config = &launcher.config;
        let mode = self.options.mode;
        let ranges = config.port_ranges();
        let log_dir = config.server.log_path();

        launcher.enter(LaunchPhase::SpawnServices);
        for service in &planned {
            match self.spawn_service(service, &ranges, &log_dir).await {
                Ok(ports) => self.expected.extend(ports),
                Err(e) => {
                    error!(service = %service.name, error = %e, "Service not launched");
                    self.skipped.push(SkippedService {
                        service: service.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if self.expected.is_empty() {
            return Err(LaunchError::Configuration("no service could be launched".to_string()));
        }

        if let Some(origin) = self.origin.clone() {
            launcher.enter(LaunchPhase::StartProxy);
            let descriptor = launcher.proxy_descriptor(&origin, mode)?;
            self.proxy = Some(process::spawn(&descriptor, &log_dir)?);
        }

        launcher.enter(LaunchPhase::PollConvergence);
        let routes = self.poll(&ranges, shutdown_rx).await?;

        launcher.enter(LaunchPhase::Success);
        let mut processes: Vec<(String, u32)> = self.spawned.iter().map(|p| (p.label.clone(), p.pid)).collect();
        if let Some(ref proxy) = self.proxy {
            processes.push((proxy.label.clone(), proxy.pid));
        }

        Ok(LaunchOutcome {
            public_url: launcher.hub_url(&planned, mode, &ranges, self.origin.as_ref()),
            credential: self.tunnel.as_ref().and_then(|t| t.credential.clone()),
            routes,
            log_dir,
            skipped: self.skipped.clone(),
            processes,
        })
    }

    /// Spawn every process of one service; returns the ports it will bind.
    ///
    /// A contract violation or spawn failure in any of its descriptors skips
    /// the whole service; processes it already started are stopped again.
    async fn spawn_service(
        &mut self,
        service: &PlannedService,
        ranges: &PortRanges,
        log_dir: &Path,
    ) -> Result<Vec<u16>, LaunchError> {
        let descriptors = self
            .launcher
            .descriptors(service, self.options, ranges, self.origin.as_ref())?;
        for descriptor in &descriptors {
            descriptor.validate(&service.config.required_env)?;
        }

        let first = self.spawned.len();
        let mut ports = Vec::new();
        for descriptor in &descriptors {
            match process::spawn(descriptor, log_dir) {
                Ok(spawned) => self.spawned.push(spawned),
                Err(e) => {
                    for started in self.spawned.split_off(first) {
                        self.stop_process(started).await;
                    }
                    return Err(e);
                }
            }
            ports.extend(descriptor.port());
        }
        Ok(ports)
    }

    async fn poll(
        &mut self,
        ranges: &PortRanges,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<RouteTable, LaunchError> {
        let launcher = self.launcher;
        let defaults = &launcher.config.defaults;
        let timeout = self.options.timeout.unwrap_or_else(|| defaults.launch_timeout());
        let expected: Vec<u16> = self.expected.iter().copied().collect();
        let expected_count = expected.len();

        let checker = HealthChecker::new(
            &defaults.health_path,
            defaults.health_timeout(),
            self.origin.as_ref().map(|o| o.port),
        )
        .map_err(|e| LaunchError::Io(io::Error::other(e)))?;

        // Without a proxy nobody else publishes, so the launcher scans itself
        let direct_scanner = match self.origin {
            Some(_) => None,
            None => Some(ServiceScanner::new(
                ranges.for_mode(self.options.mode),
                PortProber::new("localhost", defaults.probe_timeout()),
            )),
        };

        let start = Instant::now();
        let deadline = start + timeout;
        let mut last_table: Option<RouteTable> = None;
        let mut last_health: Vec<HealthResult> = Vec::new();
        let mut ticker = tokio::time::interval(defaults.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(expected = ?expected, timeout_secs = timeout.as_secs(), "Waiting for services");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Ok(()) = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                return Err(LaunchError::Io(io::Error::new(io::ErrorKind::Interrupted, "launch interrupted")));
            }

            if let Some(ref mut proxy) = self.proxy {
                if let Some(status) = proxy.try_exit() {
                    return Err(LaunchError::ProxyExited(format!(
                        "{} (see {})",
                        status,
                        proxy.log_path.display()
                    )));
                }
            }

            let table = match direct_scanner {
                Some(ref scanner) => {
                    let snapshot = scanner.scan().await;
                    let table = build_route_table(scanner.ranges(), &snapshot, None);
                    let changed = last_table.as_ref().map(|t| !t.same_routes(&table)).unwrap_or(true);
                    if changed {
                        self.publisher.publish(&table)?;
                    }
                    Some(table)
                }
                None => match self.publisher.read() {
                    Ok(table) => table,
                    Err(e) => {
                        debug!(error = %e, "Routing file not readable yet");
                        None
                    }
                },
            };

            if let Some(table) = table {
                let published = table.ports();
                let missing: Vec<u16> = expected.iter().copied().filter(|p| !published.contains(p)).collect();
                debug!(published = published.len(), expected = expected_count, "Poll");

                if published.len() >= expected_count && missing.is_empty() {
                    last_health = checker.check_all(&self.backend_ports(&table)).await;
                    if last_health.iter().all(|h| h.healthy) {
                        return Ok(table);
                    }
                    for h in last_health.iter().filter(|h| !h.healthy) {
                        debug!(port = h.port, detail = %h.detail, "Backend not healthy yet");
                    }
                } else {
                    last_health.clear();
                }
                last_table = Some(table);
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        // Missing routes and failing health checks share one report
        let published = last_table.as_ref().map(RouteTable::ports).unwrap_or_default();
        if last_health.is_empty() {
            if let Some(ref table) = last_table {
                last_health = checker.check_all(&self.backend_ports(table)).await;
            }
        }
        let report = ConvergenceReport {
            mode: Some(self.options.mode),
            elapsed: start.elapsed(),
            missing_ports: expected.iter().copied().filter(|p| !published.contains(p)).collect(),
            expected_ports: expected,
            published_ports: published,
            health: last_health,
            skipped: self.skipped.clone(),
        };
        Err(LaunchError::ConvergenceTimeout(Box::new(report)))
    }

    /// Backend routes of the table that belong to this launch
    fn backend_ports(&self, table: &RouteTable) -> Vec<u16> {
        table
            .routes
            .values()
            .filter(|r| r.service_type == ServiceType::Backend && self.expected.contains(&r.local_port))
            .map(|r| r.local_port)
            .collect()
    }

    /// Leave everything running after a successful launch
    fn detach(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            if let Some(pid) = tunnel.detach() {
                let path = self.launcher.config.server.state_dir.join(TUNNEL_PID_FILE);
                if let Err(e) = std::fs::write(&path, format!("{}\n", pid)) {
                    warn!(path = %path.display(), error = %e, "Failed to record tunnel pid");
                }
            }
        }
        // In direct mode the table would go stale once nobody refreshes it
        if self.origin.is_none() {
            self.publisher.cleanup();
        }
    }

    /// Wait for a shutdown signal, then stop everything this run started
    async fn attach(&mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Attached; press Ctrl+C to stop all services");
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        self.stop_all().await;
    }

    /// After a failure, services stay up for diagnosis; an interrupt stops them
    async fn fail(&mut self, error: &LaunchError) {
        let interrupted = matches!(error, LaunchError::Io(e) if e.kind() == io::ErrorKind::Interrupted);
        if interrupted {
            self.stop_all().await;
            return;
        }
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
        if self.origin.is_none() {
            self.publisher.cleanup();
        }
    }

    async fn stop_process(&self, mut p: SpawnedProcess) {
        let grace = self.launcher.config.defaults.shutdown_grace_period();
        let group = Arc::clone(&self.launcher.group);
        let pid = p.pid;
        info!(label = %p.label, pid, "Stopping");
        match tokio::task::spawn_blocking(move || group.terminate(pid, grace)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(label = %p.label, pid, error = %e, "Failed to stop process"),
            Err(e) => warn!(label = %p.label, pid, error = %e, "Stop task panicked"),
        }
        p.reap(Duration::from_secs(1)).await;
    }

    async fn stop_all(&mut self) {
        let mut processes: Vec<SpawnedProcess> = self.proxy.take().into_iter().collect();
        processes.append(&mut self.spawned);

        for p in processes {
            self.stop_process(p).await;
        }

        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
        self.publisher.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelError;

    const CONFIG: &str = r#"
[hub]
backend = { command = "node server.js", env = { HUB = "1" } }
frontend = { command = "npx vite" }

[services.chess]
working_dir = "/tmp"
production_port = 8001
dev_port = 10001
vite_port = 11001
backend = { command = "node", args = ["server.js"], working_dir = "server" }
frontend = { command = "npx vite" }
required_env = ["CHESS_SECRET"]
"#;

    fn launcher() -> Launcher {
        Launcher::new(Config::parse(CONFIG).unwrap(), None)
    }

    fn planned(l: &Launcher, name: &str) -> PlannedService {
        PlannedService {
            name: name.to_string(),
            config: l.config().service(name).unwrap(),
        }
    }

    #[test]
    fn test_plan_always_includes_hub() {
        let l = launcher();
        let options = LaunchOptions {
            services: vec!["chess".to_string(), "chess".to_string()],
            mode: RunMode::Dev,
            ..LaunchOptions::default()
        };
        let plan = l.plan(&options).unwrap();
        let names: Vec<&str> = plan.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["hub", "chess"]);
    }

    #[test]
    fn test_plan_rejects_unknown_service() {
        let l = launcher();
        let options = LaunchOptions {
            services: vec!["checkers".to_string()],
            ..LaunchOptions::default()
        };
        let err = l.plan(&options).unwrap_err();
        assert!(matches!(err, LaunchError::Configuration(_)));
        assert!(err.to_string().contains("checkers"));
    }

    #[test]
    fn test_proxy_mode_descriptors() {
        let l = launcher();
        let options = LaunchOptions {
            mode: RunMode::DevVite,
            proxy: true,
            ..LaunchOptions::default()
        };
        let origin = ProxyOrigin::new(9999, "https://abc.tunnel.example");
        let ranges = l.config().port_ranges();

        let descriptors = l.descriptors(&planned(&l, "chess"), &options, &ranges, Some(&origin)).unwrap();
        assert_eq!(descriptors.len(), 2);

        let backend = &descriptors[0];
        assert_eq!(backend.label, "chess-backend");
        assert_eq!(backend.role, ProcessRole::Backend);
        assert_eq!(backend.environment["PORT"], "10001");
        assert_eq!(backend.environment["TRUE_URL"], "https://abc.tunnel.example/localhost_10001");
        assert_eq!(backend.environment["PROXY_ENABLED"], "true");
        assert_eq!(backend.environment["RUN_MODE"], "dev-vite");
        assert!(backend.environment["PROXY_INFO_PATH"].ends_with("proxy-info.json"));
        assert_eq!(
            backend.environment["PROXY_GRACE_PERIOD_SECS"],
            l.config().defaults.proxy_grace_period().as_secs().to_string()
        );
        assert_eq!(backend.working_directory, Some(PathBuf::from("/tmp/server")));
        assert_eq!(backend.command, "node");

        let frontend = &descriptors[1];
        assert_eq!(frontend.role, ProcessRole::Frontend);
        assert_eq!(frontend.environment["PORT"], "11001");
        assert_eq!(frontend.environment["VITE_BASE_PATH"], "/localhost_11001/");
        assert!(!frontend.environment.contains_key("TRUE_URL"));
        assert_eq!(frontend.command, "npx");
        assert_eq!(frontend.args, vec!["vite"]);
    }

    #[test]
    fn test_direct_mode_descriptors() {
        let l = launcher();
        let options = LaunchOptions {
            mode: RunMode::Prod,
            ..LaunchOptions::default()
        };
        let ranges = l.config().port_ranges();

        let descriptors = l.descriptors(&planned(&l, "hub"), &options, &ranges, None).unwrap();
        assert_eq!(descriptors.len(), 1);
        let hub = &descriptors[0];
        assert_eq!(hub.environment["PORT"], "9000");
        assert_eq!(hub.environment["TRUE_URL"], "http://localhost:9000");
        assert_eq!(hub.environment["HUB"], "1");
        assert!(!hub.environment.contains_key("PROXY_ENABLED"));
        assert!(!hub.environment.contains_key("VITE_BASE_PATH"));
    }

    #[test]
    fn test_missing_required_env_fails_contract() {
        std::env::remove_var("CHESS_SECRET");
        let l = launcher();
        let options = LaunchOptions {
            mode: RunMode::Dev,
            ..LaunchOptions::default()
        };
        let ranges = l.config().port_ranges();
        let service = planned(&l, "chess");

        let descriptors = l.descriptors(&service, &options, &ranges, None).unwrap();
        let err = descriptors[0].validate(&service.config.required_env).unwrap_err();
        match err {
            LaunchError::EnvironmentContract { service, variable } => {
                assert_eq!(service, "chess-backend");
                assert_eq!(variable, "CHESS_SECRET");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_proxy_descriptor_passes_config() {
        let mut config = Config::parse(CONFIG).unwrap();
        config.server.proxy_command = Some(PathBuf::from("/usr/local/bin/portgate"));
        let l = Launcher::new(config, Some(PathBuf::from("/etc/portgate.toml")));

        let d = l.proxy_descriptor(&ProxyOrigin::local(9999), RunMode::Dev).unwrap();
        assert_eq!(d.command, "/usr/local/bin/portgate");
        assert_eq!(
            d.args,
            vec![
                "--config", "/etc/portgate.toml", "proxy", "--port", "9999", "--base-url",
                "http://localhost:9999", "--mode", "dev"
            ]
        );
        assert!(d.validate(&[]).is_ok());
    }

    #[test]
    fn test_hub_url_prefers_frontend_in_dev_vite() {
        let l = launcher();
        let ranges = l.config().port_ranges();
        let plan = vec![planned(&l, "hub")];
        let origin = ProxyOrigin::local(9999);

        assert_eq!(
            l.hub_url(&plan, RunMode::DevVite, &ranges, Some(&origin)),
            "http://localhost:9999/localhost_11000"
        );
        assert_eq!(
            l.hub_url(&plan, RunMode::Dev, &ranges, Some(&origin)),
            "http://localhost:9999/localhost_10000"
        );
        assert_eq!(l.hub_url(&plan, RunMode::Prod, &ranges, None), "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_tunnel_requires_proxy() {
        let l = launcher();
        let options = LaunchOptions {
            target: DeployTarget::Tunnel,
            proxy: false,
            ..LaunchOptions::default()
        };
        assert!(matches!(l.resolve_origin(&options).await, Err(LaunchError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_port_forward_needs_public_url() {
        let l = launcher();
        let options = LaunchOptions {
            target: DeployTarget::PortForward,
            proxy: true,
            ..LaunchOptions::default()
        };
        assert!(l.resolve_origin(&options).await.is_err());

        let options = LaunchOptions {
            public_url: Some("https://games.example.com/".to_string()),
            ..options
        };
        let (origin, tunnel) = l.resolve_origin(&options).await.unwrap();
        assert_eq!(origin.unwrap().base_url, "https://games.example.com");
        assert!(tunnel.is_none());
    }

    struct FixedTunnel;

    impl TunnelProvider for FixedTunnel {
        fn open(&self, port: u16, _timeout: Duration) -> futures::future::BoxFuture<'_, Result<Tunnel, TunnelError>> {
            Box::pin(async move {
                Ok(Tunnel::external(format!("https://p{}.tunnel.example/", port), Some("203.0.113.7".to_string())))
            })
        }
    }

    #[tokio::test]
    async fn test_tunnel_target_uses_provider_url() {
        let l = launcher().with_tunnel_provider(Box::new(FixedTunnel));
        let options = LaunchOptions {
            target: DeployTarget::Tunnel,
            proxy: true,
            ..LaunchOptions::default()
        };
        let (origin, tunnel) = l.resolve_origin(&options).await.unwrap();
        let origin = origin.unwrap();
        assert_eq!(origin.port, 9999);
        assert_eq!(origin.base_url, "https://p9999.tunnel.example");
        assert_eq!(tunnel.unwrap().credential.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_report_lists_unhealthy_port() {
        let report = ConvergenceReport {
            mode: Some(RunMode::DevVite),
            elapsed: Duration::from_secs(60),
            expected_ports: vec![10000, 10001, 11000, 11001],
            published_ports: vec![10000, 10001, 11000, 11001],
            missing_ports: vec![],
            health: vec![
                HealthResult {
                    port: 10000,
                    url: "http://localhost:9999/localhost_10000/api/health".to_string(),
                    healthy: true,
                    status: Some(200),
                    detail: "status \"ok\"".to_string(),
                },
                HealthResult {
                    port: 10001,
                    url: "http://localhost:9999/localhost_10001/api/health".to_string(),
                    healthy: false,
                    status: Some(500),
                    detail: "HTTP 500".to_string(),
                },
            ],
            skipped: vec![],
        };

        assert_eq!(report.unhealthy().map(|h| h.port).collect::<Vec<_>>(), vec![10001]);
        let text = report.to_string();
        assert!(text.contains("expected 4 ports, 4 published"));
        assert!(text.contains("10001  UNHEALTHY"));
        assert!(!text.contains("missing:"));
    }

    #[test]
    fn test_report_lists_missing_ports() {
        let report = ConvergenceReport {
            expected_ports: vec![10000, 10001],
            published_ports: vec![10000],
            missing_ports: vec![10001],
            ..ConvergenceReport::default()
        };
        let text = report.to_string();
        assert!(text.contains("missing:   10001"));
        assert!(text.contains("no backend route was checked"));
    }
}
