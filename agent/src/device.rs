//! Abstract compute devices.

use gridmesh_common::{DeviceId, DeviceName};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// One schedulable compute unit on an agent host.
///
/// Identity is `(device_name, device_id)`; all other fields are
/// descriptive. A CPU core, a memory root node, and a GPU are all devices
/// of their respective classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeDevice {
    /// Device class, e.g. `cpu`, `mem`, `cuda`.
    pub device_name: DeviceName,
    /// Identifier within the class, e.g. `0` or `gpu-1`.
    pub device_id: DeviceId,
    /// PCI bus id or an arbitrary location string.
    pub hw_location: String,
    /// Per-device memory in bytes.
    pub memory_size: u64,
    /// Number of processing sub-units (cores, SMs).
    pub processing_units: u32,
    /// NUMA node the device is attached to, if known.
    pub numa_node: Option<u32>,
}

impl ComputeDevice {
    /// NUMA node with the missing value collapsed to node 0, as used by
    /// distance computations.
    pub fn numa_node_or_default(&self) -> u32 {
        self.numa_node.unwrap_or(0)
    }
}

impl PartialEq for ComputeDevice {
    fn eq(&self, other: &Self) -> bool {
        self.device_name == other.device_name && self.device_id == other.device_id
    }
}

impl Eq for ComputeDevice {}

impl Hash for ComputeDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.device_name.hash(state);
        self.device_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, id: &str, numa: Option<u32>) -> ComputeDevice {
        ComputeDevice {
            device_name: DeviceName::new(name),
            device_id: DeviceId::new(id),
            hw_location: String::new(),
            memory_size: 0,
            processing_units: 1,
            numa_node: numa,
        }
    }

    #[test]
    fn identity_ignores_descriptive_fields() {
        let a = device("cuda", "gpu-0", Some(0));
        let mut b = device("cuda", "gpu-0", Some(1));
        b.memory_size = 1 << 30;
        assert_eq!(a, b);
        assert_ne!(a, device("cuda", "gpu-1", Some(0)));
        assert_ne!(a, device("rocm", "gpu-0", Some(0)));
    }
}
