use crate::error::LaunchError;
use crate::ports::{
    PortRange, PortRanges, PortSlot, RangeName, RouteMode, RunMode, ServiceType, HUB_DEV_PORT,
    HUB_PRODUCTION_PORT, HUB_VITE_PORT,
};
use crate::publish::Publisher;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name under which the implicit hub service is launched
pub const HUB_SERVICE: &str = "hub";

/// Global configuration for the launcher and the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Proxy and state file settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Timeouts and polling settings
    #[serde(default)]
    pub defaults: LaunchDefaults,

    /// Port range overrides
    #[serde(default)]
    pub ranges: RangesConfig,

    /// The hub service, always launched
    pub hub: Option<ServiceConfig>,

    /// Launchable services keyed by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    /// External tunnel provider
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port of the single proxy listener (default: 9999)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Bind address of the proxy (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Directory holding the routing file, report, lock and logs
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Routing file name, relative to `state_dir` unless absolute
    #[serde(default = "default_routing_file")]
    pub routing_file: PathBuf,

    /// Plain-text report file name
    #[serde(default = "default_report_file")]
    pub report_file: PathBuf,

    /// Run lock file name
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Directory for spawned process output
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Executable started as the proxy (default: the running executable)
    pub proxy_command: Option<PathBuf>,

    /// Max time to wait for an upstream response in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How often the proxy rescans and republishes in milliseconds (default: 2000)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,

    /// Maximum idle connections per upstream port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            bind: default_bind_address(),
            state_dir: default_state_dir(),
            routing_file: default_routing_file(),
            report_file: default_report_file(),
            lock_file: default_lock_file(),
            log_dir: default_log_dir(),
            proxy_command: None,
            request_timeout_secs: default_request_timeout(),
            refresh_interval_ms: default_refresh_interval(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn routing_path(&self) -> PathBuf {
        self.state_dir.join(&self.routing_file)
    }

    pub fn report_path(&self) -> PathBuf {
        self.state_dir.join(&self.report_file)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(&self.lock_file)
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join(&self.log_dir)
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.routing_path(), self.report_path())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LaunchDefaults {
    /// Per-port connect timeout during scans in milliseconds (default: 1000)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Total time to wait for convergence in seconds (default: 60)
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,

    /// Interval between convergence polls in milliseconds (default: 1000)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Health endpoint path, relative to the service base (default: /api/health)
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Timeout of a single health request in milliseconds (default: 3000)
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,

    /// Time allowed for a tunnel provider to hand out a URL in seconds (default: 30)
    #[serde(default = "default_tunnel_timeout")]
    pub tunnel_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL in seconds (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// How long a service in proxy mode waits for the routing file in seconds (default: 30)
    #[serde(default = "default_proxy_grace_period")]
    pub proxy_grace_period_secs: u64,
}

impl Default for LaunchDefaults {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout(),
            launch_timeout_secs: default_launch_timeout(),
            poll_interval_ms: default_poll_interval(),
            health_path: default_health_path(),
            health_timeout_ms: default_health_timeout(),
            tunnel_timeout_secs: default_tunnel_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            proxy_grace_period_secs: default_proxy_grace_period(),
        }
    }
}

impl LaunchDefaults {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn proxy_grace_period(&self) -> Duration {
        Duration::from_secs(self.proxy_grace_period_secs)
    }
}

/// A contiguous range override
#[derive(Debug, Deserialize, Clone)]
pub struct RangeConfig {
    pub start: u16,
    pub end: u16,
    #[serde(rename = "type")]
    pub service_type: Option<ServiceType>,
    pub mode: Option<RouteMode>,
}

/// One explicitly classified hub port
#[derive(Debug, Deserialize, Clone)]
pub struct HubPortConfig {
    pub port: u16,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubRangeConfig {
    pub ports: Vec<HubPortConfig>,
    pub mode: Option<RouteMode>,
}

/// Overrides for the built-in port ranges
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RangesConfig {
    pub hub: Option<HubRangeConfig>,
    pub production: Option<RangeConfig>,
    pub dev: Option<RangeConfig>,
    #[serde(rename = "devVite", alias = "dev_vite")]
    pub dev_vite: Option<RangeConfig>,
}

impl RangesConfig {
    /// Merge the overrides into the built-in ranges
    pub fn resolve(&self) -> PortRanges {
        let defaults = PortRanges::default();
        let ranges = RangeName::ALL
            .iter()
            .filter_map(|name| {
                let fallback = defaults.get(*name).cloned();
                let resolved = match name {
                    RangeName::Hub => self.hub.as_ref().map(|hub| {
                        PortRange::explicit(
                            RangeName::Hub,
                            hub.mode.unwrap_or(RouteMode::Proxy),
                            hub.ports
                                .iter()
                                .map(|p| PortSlot { port: p.port, service_type: p.service_type })
                                .collect(),
                        )
                    }),
                    RangeName::Production => self.production.as_ref().map(|r| contiguous(*name, r, ServiceType::Backend)),
                    RangeName::Dev => self.dev.as_ref().map(|r| contiguous(*name, r, ServiceType::Backend)),
                    RangeName::DevVite => self.dev_vite.as_ref().map(|r| contiguous(*name, r, ServiceType::Frontend)),
                };
                resolved.or(fallback)
            })
            .collect();
        PortRanges::new(ranges)
    }
}

fn contiguous(name: RangeName, config: &RangeConfig, default_type: ServiceType) -> PortRange {
    PortRange::contiguous(
        name,
        config.start..=config.end,
        config.service_type.unwrap_or(default_type),
        config.mode.unwrap_or(RouteMode::Proxy),
    )
}

/// How to start one process of a service
#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    /// Executable, or a full command line when `args` is empty
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, relative to the service's `working_dir`
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandConfig {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Program and arguments; a bare command line is split shell-style
    pub fn argv(&self) -> Result<(String, Vec<String>), String> {
        if !self.args.is_empty() {
            return Ok((self.command.clone(), self.args.clone()));
        }

        let mut words = shell_words::split(&self.command)
            .map_err(|e| format!("cannot parse command '{}': {}", self.command, e))?;
        if words.is_empty() {
            return Err("command is empty".to_string());
        }
        let program = words.remove(0);
        Ok((program, words))
    }
}

/// A launchable backend/frontend pair
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Directory the service lives in
    pub working_dir: Option<PathBuf>,

    /// Backend port in prod mode (production range)
    pub production_port: Option<u16>,

    /// Backend port in dev and dev-vite modes (dev range)
    pub dev_port: Option<u16>,

    /// Vite frontend port in dev-vite mode (devVite range)
    pub vite_port: Option<u16>,

    /// Backend process
    pub backend: CommandConfig,

    /// Frontend dev server, started only in dev-vite mode
    pub frontend: Option<CommandConfig>,

    /// Variables that must resolve before the service may start
    #[serde(default)]
    pub required_env: Vec<String>,
}

impl ServiceConfig {
    pub fn backend_port(&self, mode: RunMode) -> Option<u16> {
        match mode {
            RunMode::Prod => self.production_port,
            RunMode::Dev | RunMode::DevVite => self.dev_port,
        }
    }

    pub fn frontend_port(&self, mode: RunMode) -> Option<u16> {
        match mode {
            RunMode::DevVite => self.vite_port,
            RunMode::Prod | RunMode::Dev => None,
        }
    }

    /// Ports this service binds in `mode`
    pub fn ports(&self, mode: RunMode) -> Vec<u16> {
        self.backend_port(mode)
            .into_iter()
            .chain(self.frontend_port(mode))
            .collect()
    }

    /// Fill in the well-known hub ports where the section leaves them out
    fn with_hub_defaults(mut self) -> Self {
        self.production_port.get_or_insert(HUB_PRODUCTION_PORT);
        self.dev_port.get_or_insert(HUB_DEV_PORT);
        self.vite_port.get_or_insert(HUB_VITE_PORT);
        self
    }

    /// Check everything needed to launch in `mode` is present
    pub fn check_launchable(&self, name: &str, mode: RunMode) -> Result<(), String> {
        if self.backend_port(mode).is_none() {
            return Err(format!("service '{}' has no backend port for {} mode", name, mode));
        }
        if mode == RunMode::DevVite {
            if self.vite_port.is_none() {
                return Err(format!("service '{}' has no vite_port for dev-vite mode", name));
            }
            if self.frontend.is_none() {
                return Err(format!("service '{}' has no [frontend] command for dev-vite mode", name));
            }
        }
        if let Some(ref dir) = self.working_dir {
            if !dir.is_dir() {
                return Err(format!(
                    "service '{}': working directory '{}' does not exist",
                    name,
                    dir.display()
                ));
            }
        }
        Ok(())
    }

    fn validate(&self, name: &str, ranges: &PortRanges, is_hub: bool, errors: &mut Vec<String>) {
        for (label, cmd) in std::iter::once(("backend", Some(&self.backend))).chain(std::iter::once(("frontend", self.frontend.as_ref()))) {
            if let Some(cmd) = cmd {
                if let Err(e) = cmd.argv() {
                    errors.push(format!("service '{}' {}: {}", name, label, e));
                }
            }
        }

        let checks = [
            ("production_port", self.production_port, RangeName::Production, ServiceType::Backend),
            ("dev_port", self.dev_port, RangeName::Dev, ServiceType::Backend),
            ("vite_port", self.vite_port, RangeName::DevVite, ServiceType::Frontend),
        ];

        for (field, port, expected_range, expected_type) in checks {
            let Some(port) = port else { continue };
            let expected_range = if is_hub { RangeName::Hub } else { expected_range };
            match ranges.classify(port) {
                None => errors.push(format!(
                    "service '{}': {} {} is not in any port range",
                    name, field, port
                )),
                Some(class) if class.range != expected_range => errors.push(format!(
                    "service '{}': {} {} is in the '{}' range, expected '{}'",
                    name, field, port, class.range, expected_range
                )),
                Some(class) if class.service_type != expected_type => errors.push(format!(
                    "service '{}': {} {} is a {} port, expected {}",
                    name, field, port, class.service_type, expected_type
                )),
                Some(_) => {}
            }
        }
    }
}

/// External tunnel provider settings
#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Provider executable (default: lt, the localtunnel client)
    #[serde(default = "default_tunnel_command")]
    pub command: String,

    /// Arguments; `{port}` is replaced by the local port
    #[serde(default = "default_tunnel_args")]
    pub args: Vec<String>,

    /// Pattern matching the public URL in the provider's output
    #[serde(default = "default_tunnel_url_pattern")]
    pub url_pattern: String,

    /// URL whose body is the tunnel credential, if the provider uses one
    pub password_url: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            command: default_tunnel_command(),
            args: default_tunnel_args(),
            url_pattern: default_tunnel_url_pattern(),
            password_url: None,
        }
    }
}

// Default value functions
fn default_proxy_port() -> u16 {
    9999
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".portgate")
}

fn default_routing_file() -> PathBuf {
    PathBuf::from("proxy-info.json")
}

fn default_report_file() -> PathBuf {
    PathBuf::from("proxy-info.txt")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("launch.lock")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_refresh_interval() -> u64 {
    2000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_launch_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

fn default_health_timeout() -> u64 {
    3000
}

fn default_tunnel_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_proxy_grace_period() -> u64 {
    30
}

fn default_tunnel_command() -> String {
    "lt".to_string()
}

fn default_tunnel_args() -> Vec<String> {
    vec!["--port".to_string(), "{port}".to_string()]
}

fn default_tunnel_url_pattern() -> String {
    r"https://[A-Za-z0-9.-]+".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LaunchError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LaunchError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, LaunchError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| LaunchError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn port_ranges(&self) -> PortRanges {
        self.ranges.resolve()
    }

    /// The hub service with its default ports filled in
    pub fn hub_service(&self) -> Option<ServiceConfig> {
        self.hub.clone().map(ServiceConfig::with_hub_defaults)
    }

    /// Look up a launchable service; `hub` resolves to the hub section
    pub fn service(&self, name: &str) -> Option<ServiceConfig> {
        if name == HUB_SERVICE {
            return self.hub_service();
        }
        self.services.get(name).cloned()
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), LaunchError> {
        let mut errors = Vec::new();
        let ranges = self.port_ranges();

        if let Err(e) = ranges.validate() {
            errors.push(e);
        }

        if let Some(class) = ranges.classify(self.server.proxy_port) {
            errors.push(format!(
                "proxy_port {} lies inside the '{}' range",
                self.server.proxy_port, class.range
            ));
        }

        if self.services.contains_key(HUB_SERVICE) {
            errors.push("'hub' is reserved; configure it in the [hub] section".to_string());
        }

        if let Some(hub) = self.hub_service() {
            hub.validate(HUB_SERVICE, &ranges, true, &mut errors);
        }

        for (name, service) in &self.services {
            service.validate(name, &ranges, false, &mut errors);
        }

        // No two services may claim the same port
        let mut owners: BTreeMap<u16, &str> = BTreeMap::new();
        let hub = self.hub_service();
        let all = hub
            .iter()
            .map(|h| (HUB_SERVICE, h))
            .chain(self.services.iter().map(|(n, s)| (n.as_str(), s)));
        for (name, service) in all {
            for port in [service.production_port, service.dev_port, service.vite_port]
                .into_iter()
                .flatten()
                .collect::<std::collections::BTreeSet<_>>()
            {
                if let Some(other) = owners.insert(port, name) {
                    errors.push(format!(
                        "port {} is used by both '{}' and '{}'",
                        port, other, name
                    ));
                }
            }
        }

        if let Err(e) = regex::Regex::new(&self.tunnel.url_pattern) {
            errors.push(format!("tunnel url_pattern is not a valid regex: {}", e));
        }

        if !errors.is_empty() {
            return Err(LaunchError::Configuration(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
proxy_port = 8080
state_dir = "/tmp/portgate-test"

[defaults]
launch_timeout_secs = 90
poll_interval_ms = 500

[hub]
backend = { command = "node server.js" }
frontend = { command = "npm", args = ["run", "dev"] }

[services.chess]
production_port = 8001
dev_port = 10001
vite_port = 11001
backend = { command = "node", args = ["server.js"], env = { GAME = "chess" } }
frontend = { command = "npx vite" }
required_env = ["FIREBASE_KEY"]

[services.go]
production_port = 8002
dev_port = 10002
backend = { command = "cargo run" }
"#;

    #[test]
    fn test_parse_config() {
        let config = Config::parse(SAMPLE).unwrap();

        assert_eq!(config.server.proxy_port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.routing_path(), PathBuf::from("/tmp/portgate-test/proxy-info.json"));
        assert_eq!(config.defaults.launch_timeout(), Duration::from_secs(90));
        assert_eq!(config.defaults.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.defaults.health_path, "/api/health");

        let chess = config.service("chess").unwrap();
        assert_eq!(chess.ports(RunMode::Prod), vec![8001]);
        assert_eq!(chess.ports(RunMode::DevVite), vec![10001, 11001]);
        assert_eq!(chess.backend.env.get("GAME"), Some(&"chess".to_string()));
        assert_eq!(chess.required_env, vec!["FIREBASE_KEY".to_string()]);
    }

    #[test]
    fn test_hub_defaults() {
        let config = Config::parse(SAMPLE).unwrap();
        let hub = config.service(HUB_SERVICE).unwrap();

        assert_eq!(hub.backend_port(RunMode::Prod), Some(HUB_PRODUCTION_PORT));
        assert_eq!(hub.backend_port(RunMode::Dev), Some(HUB_DEV_PORT));
        assert_eq!(hub.frontend_port(RunMode::DevVite), Some(HUB_VITE_PORT));
    }

    #[test]
    fn test_empty_config() {
        let config = Config::parse("").unwrap();

        assert!(config.hub.is_none());
        assert!(config.services.is_empty());
        assert_eq!(config.server.proxy_port, 9999);
        assert_eq!(config.defaults.probe_timeout(), Duration::from_secs(1));
        assert_eq!(config.tunnel.command, "lt");
    }

    #[test]
    fn test_command_line_is_split() {
        let cmd = CommandConfig::new("npm run dev -- --host 127.0.0.1");
        let (program, args) = cmd.argv().unwrap();
        assert_eq!(program, "npm");
        assert_eq!(args, vec!["run", "dev", "--", "--host", "127.0.0.1"]);

        let cmd = CommandConfig::new("node").with_args(vec!["a b.js".to_string()]);
        assert_eq!(cmd.argv().unwrap(), ("node".to_string(), vec!["a b.js".to_string()]));

        assert!(CommandConfig::new("   ").argv().is_err());
    }

    #[test]
    fn test_port_outside_range_rejected() {
        let toml = r#"
[services.bad]
production_port = 7000
dev_port = 10001
backend = { command = "node" }
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("7000 is not in any port range"));
    }

    #[test]
    fn test_port_in_wrong_range_rejected() {
        let toml = r#"
[services.bad]
production_port = 10005
backend = { command = "node" }
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("in the 'dev' range, expected 'production'"));
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let toml = r#"
[services.a]
dev_port = 10001
backend = { command = "node" }

[services.b]
dev_port = 10001
backend = { command = "node" }
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("port 10001 is used by both 'a' and 'b'"));
    }

    #[test]
    fn test_proxy_port_inside_range_rejected() {
        let toml = r#"
[server]
proxy_port = 10050
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("proxy_port 10050 lies inside the 'dev' range"));
    }

    #[test]
    fn test_range_overrides() {
        let toml = r#"
[server]
proxy_port = 45999

[ranges.hub]
ports = [{ port = 45000, type = "backend" }, { port = 45100, type = "frontend" }]

[ranges.dev]
start = 45001
end = 45010

[ranges.devVite]
start = 45101
end = 45110
mode = "direct"
"#;
        let config = Config::parse(toml).unwrap();
        let ranges = config.port_ranges();

        assert_eq!(ranges.get(RangeName::Hub).unwrap().len(), 2);
        assert_eq!(ranges.classify(45100).unwrap().service_type, ServiceType::Frontend);
        assert_eq!(ranges.classify(45005).unwrap().range, RangeName::Dev);
        assert_eq!(ranges.classify(45105).unwrap().mode, RouteMode::Direct);
        // Untouched range keeps its default
        assert_eq!(ranges.classify(8001).unwrap().range, RangeName::Production);
    }

    #[test]
    fn test_overlapping_override_rejected() {
        let toml = r#"
[ranges.production]
start = 10001
end = 10010
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("overlap"));
    }

    #[test]
    fn test_check_launchable() {
        let config = Config::parse(SAMPLE).unwrap();

        let go = config.service("go").unwrap();
        assert!(go.check_launchable("go", RunMode::Dev).is_ok());
        let err = go.check_launchable("go", RunMode::DevVite).unwrap_err();
        assert!(err.contains("vite_port"));

        let mut chess = config.service("chess").unwrap();
        chess.working_dir = Some(PathBuf::from("/definitely/not/here"));
        let err = chess.check_launchable("chess", RunMode::Prod).unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[test]
    fn test_reserved_hub_name() {
        let toml = r#"
[services.hub]
dev_port = 10001
backend = { command = "node" }
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("reserved"));
    }
}
