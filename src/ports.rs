//! Port range descriptors
//!
//! Every service port belongs to exactly one named range. The range carries the
//! classification metadata (service type and route mode) for each of its ports,
//! so classifying a port is a table lookup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Default port of the hub backend when launched in production mode
pub const HUB_PRODUCTION_PORT: u16 = 9000;
/// Default port of the hub backend in dev and dev-vite modes
pub const HUB_DEV_PORT: u16 = 10000;
/// Default port of the hub Vite frontend in dev-vite mode
pub const HUB_VITE_PORT: u16 = 11000;

/// Name of a port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RangeName {
    #[serde(rename = "hub")]
    Hub,
    #[serde(rename = "production")]
    Production,
    #[serde(rename = "dev")]
    Dev,
    #[serde(rename = "devVite", alias = "dev_vite")]
    DevVite,
}

impl RangeName {
    pub const ALL: [RangeName; 4] = [
        RangeName::Hub,
        RangeName::Production,
        RangeName::Dev,
        RangeName::DevVite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeName::Hub => "hub",
            RangeName::Production => "production",
            RangeName::Dev => "dev",
            RangeName::DevVite => "devVite",
        }
    }
}

impl fmt::Display for RangeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of the process listening on a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Backend,
    Frontend,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceType::Backend => f.write_str("backend"),
            ServiceType::Frontend => f.write_str("frontend"),
        }
    }
}

/// How a route is reached from the outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Through the single proxy port under a path prefix
    Proxy,
    /// On the service's own port
    Direct,
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMode::Proxy => f.write_str("proxy"),
            RouteMode::Direct => f.write_str("direct"),
        }
    }
}

/// Which set of ports a launch uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RunMode {
    /// Production builds, one backend port per service
    #[default]
    Prod,
    /// Dev servers, one backend port per service
    Dev,
    /// Dev backend plus a Vite dev server per service
    DevVite,
}

impl RunMode {
    /// Number of ports every launched service binds in this mode
    pub fn ports_per_service(&self) -> usize {
        match self {
            RunMode::Prod | RunMode::Dev => 1,
            RunMode::DevVite => 2,
        }
    }

    /// Range that holds the backend ports for this mode
    pub fn backend_range(&self) -> RangeName {
        match self {
            RunMode::Prod => RangeName::Production,
            RunMode::Dev | RunMode::DevVite => RangeName::Dev,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Prod => "prod",
            RunMode::Dev => "dev",
            RunMode::DevVite => "dev-vite",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single well-known port and its role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSlot {
    pub port: u16,
    pub service_type: ServiceType,
}

/// A named set of ports with their classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    pub name: RangeName,
    pub mode: RouteMode,
    slots: Vec<PortSlot>,
}

impl PortRange {
    /// A contiguous range where every port has the same role
    pub fn contiguous(
        name: RangeName,
        ports: RangeInclusive<u16>,
        service_type: ServiceType,
        mode: RouteMode,
    ) -> Self {
        let slots = ports.map(|port| PortSlot { port, service_type }).collect();
        Self::explicit(name, mode, slots)
    }

    /// A range made of individually classified ports (the hub)
    pub fn explicit(name: RangeName, mode: RouteMode, mut slots: Vec<PortSlot>) -> Self {
        slots.sort_by_key(|s| s.port);
        slots.dedup_by_key(|s| s.port);
        Self { name, mode, slots }
    }

    pub fn slots(&self) -> &[PortSlot] {
        &self.slots
    }

    /// Ports of this range in ascending order
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.slots.iter().map(|s| s.port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.slot(port).is_some()
    }

    pub fn slot(&self, port: u16) -> Option<&PortSlot> {
        self.slots
            .binary_search_by_key(&port, |s| s.port)
            .ok()
            .map(|i| &self.slots[i])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Result of looking a port up in the range table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub range: RangeName,
    pub service_type: ServiceType,
    pub mode: RouteMode,
}

/// The complete, ordered set of port ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRanges {
    ranges: Vec<PortRange>,
}

impl Default for PortRanges {
    fn default() -> Self {
        Self::new(vec![
            PortRange::explicit(
                RangeName::Hub,
                RouteMode::Proxy,
                vec![
                    PortSlot { port: HUB_PRODUCTION_PORT, service_type: ServiceType::Backend },
                    PortSlot { port: HUB_DEV_PORT, service_type: ServiceType::Backend },
                    PortSlot { port: HUB_VITE_PORT, service_type: ServiceType::Frontend },
                ],
            ),
            PortRange::contiguous(
                RangeName::Production,
                8001..=8099,
                ServiceType::Backend,
                RouteMode::Proxy,
            ),
            PortRange::contiguous(
                RangeName::Dev,
                10001..=10099,
                ServiceType::Backend,
                RouteMode::Proxy,
            ),
            PortRange::contiguous(
                RangeName::DevVite,
                11001..=11099,
                ServiceType::Frontend,
                RouteMode::Proxy,
            ),
        ])
    }
}

impl PortRanges {
    /// Build a range table; ranges are kept in `RangeName` order
    pub fn new(mut ranges: Vec<PortRange>) -> Self {
        ranges.sort_by_key(|r| r.name);
        Self { ranges }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortRange> {
        self.ranges.iter()
    }

    pub fn get(&self, name: RangeName) -> Option<&PortRange> {
        self.ranges.iter().find(|r| r.name == name)
    }

    /// Look up which range a port belongs to and how it is classified
    pub fn classify(&self, port: u16) -> Option<Classification> {
        self.ranges.iter().find_map(|range| {
            range.slot(port).map(|slot| Classification {
                range: range.name,
                service_type: slot.service_type,
                mode: range.mode,
            })
        })
    }

    /// The hub plus the ranges a launch in `mode` binds
    pub fn for_mode(&self, mode: RunMode) -> PortRanges {
        let wanted: &[RangeName] = match mode {
            RunMode::Prod => &[RangeName::Hub, RangeName::Production],
            RunMode::Dev => &[RangeName::Hub, RangeName::Dev],
            RunMode::DevVite => &[RangeName::Hub, RangeName::Dev, RangeName::DevVite],
        };
        PortRanges::new(
            self.ranges
                .iter()
                .filter(|r| wanted.contains(&r.name))
                .cloned()
                .collect(),
        )
    }

    /// Every port in every range, in range order
    pub fn all_ports(&self) -> Vec<u16> {
        self.ranges.iter().flat_map(|r| r.ports()).collect()
    }

    /// Check that no port appears in two ranges and no range name repeats
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        for (i, a) in self.ranges.iter().enumerate() {
            for b in &self.ranges[i + 1..] {
                if a.name == b.name {
                    errors.push(format!("range '{}' is defined twice", a.name));
                    continue;
                }
                let overlap: Vec<u16> = a.ports().filter(|p| b.contains(*p)).collect();
                if let Some(first) = overlap.first() {
                    errors.push(format!(
                        "ranges '{}' and '{}' overlap ({} shared ports, first {})",
                        a.name,
                        b.name,
                        overlap.len(),
                        first
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ranges_are_disjoint() {
        let ranges = PortRanges::default();
        assert!(ranges.validate().is_ok());
        assert_eq!(ranges.get(RangeName::Hub).unwrap().len(), 3);
        assert_eq!(ranges.get(RangeName::Dev).unwrap().len(), 99);
    }

    #[test]
    fn test_hub_classification_is_per_port() {
        let ranges = PortRanges::default();

        let backend = ranges.classify(10000).unwrap();
        assert_eq!(backend.range, RangeName::Hub);
        assert_eq!(backend.service_type, ServiceType::Backend);

        let frontend = ranges.classify(11000).unwrap();
        assert_eq!(frontend.range, RangeName::Hub);
        assert_eq!(frontend.service_type, ServiceType::Frontend);
    }

    #[test]
    fn test_range_classification() {
        let ranges = PortRanges::default();

        assert_eq!(ranges.classify(8001).unwrap().range, RangeName::Production);
        assert_eq!(ranges.classify(10001).unwrap().service_type, ServiceType::Backend);
        assert_eq!(ranges.classify(11042).unwrap().range, RangeName::DevVite);
        assert_eq!(ranges.classify(11042).unwrap().service_type, ServiceType::Frontend);
        assert!(ranges.classify(12345).is_none());
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let ranges = PortRanges::new(vec![
            PortRange::contiguous(RangeName::Dev, 10001..=10010, ServiceType::Backend, RouteMode::Proxy),
            PortRange::contiguous(RangeName::DevVite, 10005..=10020, ServiceType::Frontend, RouteMode::Proxy),
        ]);

        let err = ranges.validate().unwrap_err();
        assert!(err.contains("overlap"));
        assert!(err.contains("10005"));
    }

    #[test]
    fn test_explicit_range_sorts_slots() {
        let range = PortRange::explicit(
            RangeName::Hub,
            RouteMode::Proxy,
            vec![
                PortSlot { port: 11000, service_type: ServiceType::Frontend },
                PortSlot { port: 9000, service_type: ServiceType::Backend },
            ],
        );
        assert_eq!(range.ports().collect::<Vec<_>>(), vec![9000, 11000]);
    }

    #[test]
    fn test_run_mode_ports_per_service() {
        assert_eq!(RunMode::Prod.ports_per_service(), 1);
        assert_eq!(RunMode::Dev.ports_per_service(), 1);
        assert_eq!(RunMode::DevVite.ports_per_service(), 2);
        assert_eq!(RunMode::Prod.backend_range(), RangeName::Production);
        assert_eq!(RunMode::DevVite.backend_range(), RangeName::Dev);
    }

    #[test]
    fn test_ranges_for_mode() {
        let ranges = PortRanges::default();

        let prod = ranges.for_mode(RunMode::Prod);
        assert!(prod.classify(8001).is_some());
        assert!(prod.classify(10001).is_none());
        assert!(prod.classify(9000).is_some());

        let vite = ranges.for_mode(RunMode::DevVite);
        assert!(vite.classify(10001).is_some());
        assert!(vite.classify(11001).is_some());
        assert!(vite.classify(8001).is_none());
    }

    #[test]
    fn test_range_name_serde() {
        assert_eq!(serde_json::to_string(&RangeName::DevVite).unwrap(), "\"devVite\"");
        let parsed: RangeName = serde_json::from_str("\"hub\"").unwrap();
        assert_eq!(parsed, RangeName::Hub);
    }
}
