//! Portgate - a single-port reverse proxy and launcher for local services
//!
//! This library provides:
//! - Discovery of services listening in well-known port ranges
//! - An atomically published routing table mapping `/localhost_<port>` paths
//!   to local ports, with public URLs for a local, tunnelled or forwarded origin
//! - A longest-prefix reverse proxy with WebSocket upgrade support
//! - A launcher that reclaims ports, spawns services with their environment
//!   contract and waits until every route is published and healthy

pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod lock;
pub mod orchestrator;
pub mod pool;
pub mod ports;
pub mod probe;
pub mod process;
pub mod proxy;
pub mod publish;
pub mod routes;
pub mod scanner;
pub mod tunnel;
