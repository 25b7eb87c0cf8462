//! NUMA affinity map over all compute devices of one host.
//!
//! Conceptually an undirected complete graph whose edge weight is the NUMA
//! distance (absolute difference of NUMA node ids, with missing nodes read
//! as node 0). The graph is small, O(devices per host), and only three
//! query shapes exist, so no adjacency is materialized; weights are
//! computed on the fly.

use crate::device::ComputeDevice;
use gridmesh_common::DeviceName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Topology policy applied when no prior devices constrain placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AffinityPolicy {
    /// Chain NUMA clusters back-to-back so one node fills first.
    PreferSingleNode,
    /// Interleave clusters round-robin so load spreads across nodes.
    Interleaved,
}

/// Previously chosen devices plus the policy guiding the next allocation.
#[derive(Debug, Clone)]
pub struct AffinityHint {
    pub devices: Vec<ComputeDevice>,
    pub map: Arc<AffinityMap>,
    pub policy: AffinityPolicy,
}

impl AffinityHint {
    pub fn new(map: Arc<AffinityMap>, policy: AffinityPolicy) -> Self {
        Self {
            devices: Vec::new(),
            map,
            policy,
        }
    }
}

/// NUMA distance matrix over the host's devices.
#[derive(Debug, Clone, Default)]
pub struct AffinityMap {
    devices: Vec<ComputeDevice>,
}

impl AffinityMap {
    /// Build from the device enumeration. Done once per agent.
    pub fn build(devices: Vec<ComputeDevice>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[ComputeDevice] {
        &self.devices
    }

    fn distance(a: &ComputeDevice, b: &ComputeDevice) -> u32 {
        a.numa_node_or_default().abs_diff(b.numa_node_or_default())
    }

    fn devices_of<'a>(&'a self, device_name: &'a DeviceName) -> impl Iterator<Item = &'a ComputeDevice> {
        self.devices
            .iter()
            .filter(move |d| &d.device_name == device_name)
    }

    /// Among devices of `device_name`, the largest group sharing the lowest
    /// distance from `src`, with that distance. `src` itself is excluded.
    ///
    /// Ties between equal-distance groups cannot occur (grouping is by
    /// distance), so ordering is (distance asc, size desc) with the size
    /// criterion kept for parity with cluster queries.
    pub fn largest_nearest_cluster(
        &self,
        device_name: &DeviceName,
        src: &ComputeDevice,
    ) -> Vec<(ComputeDevice, u32)> {
        let mut by_distance: BTreeMap<u32, Vec<&ComputeDevice>> = BTreeMap::new();
        for device in self.devices_of(device_name) {
            if device == src {
                continue;
            }
            by_distance
                .entry(Self::distance(src, device))
                .or_default()
                .push(device);
        }
        let mut groups: Vec<(u32, Vec<&ComputeDevice>)> = by_distance.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())));
        match groups.into_iter().next() {
            Some((distance, members)) => members
                .into_iter()
                .map(|d| (d.clone(), distance))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Zero-distance (NUMA-colocated) clusters of `device_name` devices,
    /// largest first. Within a cluster, devices keep enumeration order.
    pub fn colocated_clusters(&self, device_name: &DeviceName) -> Vec<Vec<ComputeDevice>> {
        let mut by_node: BTreeMap<u32, Vec<ComputeDevice>> = BTreeMap::new();
        for device in self.devices_of(device_name) {
            by_node
                .entry(device.numa_node_or_default())
                .or_default()
                .push(device.clone());
        }
        let mut clusters: Vec<Vec<ComputeDevice>> = by_node.into_values().collect();
        // Largest first; equal sizes keep NUMA-node order for determinism.
        clusters.sort_by(|a, b| b.len().cmp(&a.len()));
        clusters
    }

    /// For each NUMA-colocated group of `src_devices`, the nearest cluster
    /// of `device_name` devices (the primary sets), plus everything else of
    /// that class as the secondary set.
    ///
    /// With `(gpu0@node0, gpu1@node1)` already assigned and `cpu` requested
    /// on a dual-socket host, the primaries are `(cpu@node0, cpu@node1)`;
    /// with both GPUs on node 0, the single primary is `cpu@node0` and the
    /// node-1 CPUs form the secondary set.
    pub fn distance_ordered_neighbors(
        &self,
        src_devices: &[ComputeDevice],
        device_name: &DeviceName,
    ) -> (Vec<Vec<ComputeDevice>>, Vec<ComputeDevice>) {
        let mut src_by_node: BTreeMap<u32, &ComputeDevice> = BTreeMap::new();
        for device in src_devices {
            // One representative per colocated group is enough: all members
            // share the same distances to every other device.
            src_by_node
                .entry(device.numa_node_or_default())
                .or_insert(device);
        }
        let mut primary_sets = Vec::with_capacity(src_by_node.len());
        for representative in src_by_node.values() {
            let cluster: Vec<ComputeDevice> = self
                .largest_nearest_cluster(device_name, representative)
                .into_iter()
                .map(|(device, _)| device)
                .collect();
            primary_sets.push(cluster);
        }
        let secondary: Vec<ComputeDevice> = self
            .devices_of(device_name)
            .filter(|d| !primary_sets.iter().any(|set| set.contains(d)))
            .cloned()
            .collect();
        (primary_sets, secondary)
    }
}
