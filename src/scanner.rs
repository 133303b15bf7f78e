//! Service discovery across the configured port ranges

use crate::ports::{PortRanges, RangeName};
use crate::probe::PortProber;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

/// Upper bound on probes in flight at once
const MAX_CONCURRENT_PROBES: usize = 64;

/// Active ports per range, as observed by one scan.
///
/// Only ranges with at least one active port are present. Ports are kept in
/// ascending order within each range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    #[serde(flatten)]
    active: BTreeMap<RangeName, Vec<u16>>,
}

impl ServiceSnapshot {
    pub fn from_ports(active: impl IntoIterator<Item = (RangeName, Vec<u16>)>) -> Self {
        let active = active
            .into_iter()
            .filter(|(_, ports)| !ports.is_empty())
            .map(|(name, mut ports)| {
                ports.sort_unstable();
                ports.dedup();
                (name, ports)
            })
            .collect();
        Self { active }
    }

    /// Active ports in a range (empty if none)
    pub fn ports(&self, range: RangeName) -> &[u16] {
        self.active.get(&range).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All (range, port) pairs in range order
    pub fn iter(&self) -> impl Iterator<Item = (RangeName, u16)> + '_ {
        self.active
            .iter()
            .flat_map(|(name, ports)| ports.iter().map(move |p| (*name, *p)))
    }

    pub fn total(&self) -> usize {
        self.active.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Scans every port of every range with a [`PortProber`]
#[derive(Debug, Clone)]
pub struct ServiceScanner {
    ranges: PortRanges,
    prober: PortProber,
}

impl ServiceScanner {
    pub fn new(ranges: PortRanges, prober: PortProber) -> Self {
        Self { ranges, prober }
    }

    pub fn ranges(&self) -> &PortRanges {
        &self.ranges
    }

    /// Probe all ports and return a fresh snapshot.
    ///
    /// Probes run concurrently but results keep port order, and every active
    /// port is recorded (the hub can have a backend and a frontend up at once).
    pub async fn scan(&self) -> ServiceSnapshot {
        let start = Instant::now();

        let targets: Vec<(RangeName, u16)> = self
            .ranges
            .iter()
            .flat_map(|range| range.ports().map(move |port| (range.name, port)))
            .collect();
        let probed = targets.len();

        let results: Vec<(RangeName, u16, bool)> = stream::iter(targets)
            .map(|(name, port)| async move { (name, port, self.prober.is_active(port).await) })
            .buffered(MAX_CONCURRENT_PROBES)
            .collect()
            .await;

        let mut active: BTreeMap<RangeName, Vec<u16>> = BTreeMap::new();
        for (name, port, is_active) in results {
            if is_active {
                active.entry(name).or_default().push(port);
            }
        }

        let snapshot = ServiceSnapshot::from_ports(active);
        debug!(
            probed,
            active = snapshot.total(),
            elapsed_ms = start.elapsed().as_millis(),
            "Port scan complete"
        );
        snapshot
    }
}
