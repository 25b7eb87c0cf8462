//! Agent-side resource model: compute devices, the NUMA affinity map, the
//! per-device allocation maps, and the kernel resource spec codec.
//!
//! An allocation map turns an abstract slot request (`{cuda.shares: 1.50}`)
//! into a concrete per-device assignment under capacity, exclusivity, NUMA
//! affinity, and quantum constraints. The maps never suspend; ownership is
//! serialized by the scheduler's per-resource-group lock.

pub mod affinity;
pub mod alloc;
pub mod device;
pub mod error;
pub mod heartbeat;
pub mod spec;

pub use affinity::{AffinityHint, AffinityMap, AffinityPolicy};
pub use alloc::{
    AllocMap, AllocationStrategy, DeviceAllocation, DeviceSlotInfo, DiscreteAllocMap,
    FractionAllocMap,
};
pub use device::ComputeDevice;
pub use error::{ResourceError, Result};
pub use heartbeat::{AgentHeartbeat, ContainerReport};
pub use spec::{KernelResourceSpec, Mount, MountPerm};
