//! Heartbeat payloads sent by agents to the manager.

use crate::alloc::DeviceSlotInfo;
use crate::device::ComputeDevice;
use crate::spec::KernelResourceSpec;
use gridmesh_common::{AgentId, DeviceId, DeviceName, KernelId, ResourceSlot, SlotName, SlotTypes};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One live container as reported by an agent, with the resource spec read
/// back from its config volume. The manager replays these specs to rebuild
/// per-agent allocation maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerReport {
    pub kernel_id: KernelId,
    pub container_id: String,
    pub resource_spec: KernelResourceSpec,
}

/// Periodic agent announcement. The first heartbeat creates the agent row;
/// subsequent ones refresh capacity, liveness, and the slot-type registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: AgentId,
    pub addr: String,
    pub architecture: String,
    pub resource_group: String,
    pub version: String,
    /// Advertised slot capacities.
    pub available_slots: ResourceSlot,
    /// Types of every advertised slot, merged into the manager's registry.
    pub slot_types: BTreeMap<SlotName, SlotTypes>,
    /// Compute plugin versions by device class.
    pub compute_plugins: BTreeMap<DeviceName, String>,
    /// Device enumeration with NUMA placement, for affinity maps.
    pub devices: Vec<ComputeDevice>,
    /// Per-device slot capacities, for allocation map reconstruction.
    pub device_slots: BTreeMap<DeviceId, DeviceSlotInfo>,
    /// Live containers and their persisted resource specs.
    pub containers: Vec<ContainerReport>,
}
