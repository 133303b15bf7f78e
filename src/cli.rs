//! Command-line interface
//!
//! Usage:
//!   portgate launch [SERVICE...]     Start the hub and services, wait until they are up
//!   portgate proxy --port 9999       Run the reverse proxy in the foreground
//!   portgate scan                    Print the services currently listening
//!   portgate down                    Stop everything on the known ports

use crate::config::Config;
use crate::error::LaunchError;
use crate::orchestrator::{DeployTarget, LaunchOptions, Launcher};
use crate::ports::RunMode;
use crate::probe::PortProber;
use crate::proxy::{run_proxy, ProxyOptions};
use crate::publish::render_report;
use crate::routes::build_route_table;
use crate::scanner::ServiceScanner;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Default config file, looked up in the working directory
pub const DEFAULT_CONFIG: &str = "portgate.toml";

#[derive(Debug, Parser)]
#[command(name = "portgate", version, about = "Single-port proxy and launcher for local services")]
pub struct Cli {
    /// Config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging for portgate
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the hub and the given services and wait until all are healthy
    Launch {
        /// Services to launch besides the hub
        services: Vec<String>,

        /// Route services directly instead of through the proxy
        #[arg(long)]
        no_proxy: bool,

        /// Where the public URL comes from
        #[arg(long, value_enum, default_value_t = DeployTarget::Local)]
        target: DeployTarget,

        /// Public URL for the port-forward target
        #[arg(long)]
        public_url: Option<String>,

        #[arg(long, value_enum, default_value_t = RunMode::Dev)]
        mode: RunMode,

        /// Seconds to wait for convergence (overrides launch_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,

        /// Stay in the foreground and stop everything on Ctrl+C
        #[arg(long)]
        attach: bool,
    },

    /// Run the reverse proxy until SIGINT/SIGTERM
    Proxy {
        /// Listen port (defaults to server.proxy_port)
        #[arg(long)]
        port: Option<u16>,

        /// Public origin used in published URLs
        #[arg(long)]
        base_url: Option<String>,

        #[arg(long, value_enum, default_value_t = RunMode::Dev)]
        mode: RunMode,
    },

    /// Scan the port ranges once and print the routes
    Scan {
        /// Only scan the ranges of this mode
        #[arg(long, value_enum)]
        mode: Option<RunMode>,

        /// Also write the routing file and report
        #[arg(long)]
        publish: bool,
    },

    /// Stop everything listening on the known ports and remove published state
    Down,
}

impl Cli {
    /// Load the config; a missing default file means built-in defaults
    pub fn load_config(&self) -> Result<Config, LaunchError> {
        match self.config {
            Some(ref path) => Config::load(path),
            None => {
                let path = PathBuf::from(DEFAULT_CONFIG);
                if path.exists() {
                    Config::load(&path)
                } else {
                    info!(path = %path.display(), "No config file, using defaults");
                    Ok(Config::default())
                }
            }
        }
    }

    /// Config path handed to child processes, if a file is in use
    pub fn config_path(&self) -> Option<PathBuf> {
        match self.config {
            Some(ref path) => Some(path.clone()),
            None => Some(PathBuf::from(DEFAULT_CONFIG)).filter(|p| p.exists()),
        }
    }
}

/// Run one subcommand to completion
pub async fn run(cli: Cli, config: Config, shutdown_rx: watch::Receiver<bool>) -> Result<(), LaunchError> {
    match cli.command {
        Command::Launch {
            ref services,
            no_proxy,
            target,
            ref public_url,
            mode,
            timeout,
            attach,
        } => {
            let options = LaunchOptions {
                services: services.clone(),
                mode,
                proxy: !no_proxy,
                target,
                public_url: public_url.clone(),
                timeout: timeout.map(Duration::from_secs),
                attach,
            };
            let launcher = Launcher::new(config, cli.config_path());
            match launcher.launch(&options, shutdown_rx).await {
                Ok(outcome) => {
                    println!("{}", outcome);
                    Ok(())
                }
                Err(LaunchError::ConvergenceTimeout(report)) => {
                    println!("Launch failed: services did not converge");
                    print!("{}", report);
                    Err(LaunchError::ConvergenceTimeout(report))
                }
                Err(e) => Err(e),
            }
        }

        Command::Proxy { port, ref base_url, mode } => {
            let options = ProxyOptions {
                port: port.unwrap_or(config.server.proxy_port),
                base_url: base_url.clone(),
                mode,
            };
            run_proxy(&config, options, shutdown_rx).await
        }

        Command::Scan { mode, publish } => {
            let ranges = config.port_ranges();
            let ranges = match mode {
                Some(mode) => ranges.for_mode(mode),
                None => ranges,
            };
            let scanner = ServiceScanner::new(ranges, PortProber::new("localhost", config.defaults.probe_timeout()));
            let snapshot = scanner.scan().await;
            let table = build_route_table(scanner.ranges(), &snapshot, None);

            if publish {
                config.server.publisher().publish(&table)?;
            }
            print!("{}", render_report(&table));
            Ok(())
        }

        Command::Down => {
            let launcher = Launcher::new(config, None);
            let report = launcher.down().await?;
            for (pid, ports) in &report.terminated {
                println!("stopped pid {} (ports {:?})", pid, ports);
            }
            for (pid, reason) in &report.failed {
                println!("failed to stop pid {}: {}", pid, reason);
            }
            if report.terminated.is_empty() && report.failed.is_empty() {
                println!("nothing was running");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_launch() {
        let cli = Cli::parse_from([
            "portgate", "launch", "--mode", "dev-vite", "--target", "port-forward", "--public-url",
            "https://x.example", "--timeout", "90", "chess", "go",
        ]);
        match cli.command {
            Command::Launch { services, no_proxy, target, public_url, mode, timeout, attach } => {
                assert_eq!(services, vec!["chess", "go"]);
                assert!(!no_proxy);
                assert_eq!(target, DeployTarget::PortForward);
                assert_eq!(public_url.as_deref(), Some("https://x.example"));
                assert_eq!(mode, RunMode::DevVite);
                assert_eq!(timeout, Some(90));
                assert!(!attach);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_proxy_with_global_config() {
        let cli = Cli::parse_from(["portgate", "--config", "/etc/pg.toml", "proxy", "--port", "9999", "--mode", "prod"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/pg.toml")));
        match cli.command {
            Command::Proxy { port, base_url, mode } => {
                assert_eq!(port, Some(9999));
                assert!(base_url.is_none());
                assert_eq!(mode, RunMode::Prod);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_launch_defaults() {
        let cli = Cli::parse_from(["portgate", "launch"]);
        match cli.command {
            Command::Launch { services, target, mode, .. } => {
                assert!(services.is_empty());
                assert_eq!(target, DeployTarget::Local);
                assert_eq!(mode, RunMode::Dev);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let cli = Cli::parse_from(["portgate", "--config", "/nonexistent/portgate.toml", "down"]);
        assert!(matches!(cli.load_config(), Err(LaunchError::Configuration(_))));
    }
}
