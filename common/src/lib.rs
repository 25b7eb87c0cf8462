//! Shared vocabulary types for the GridMesh scheduling core.
//!
//! Everything that both the agent-side allocation code and the manager-side
//! scheduler need to agree on lives here: identifiers, the `ResourceSlot`
//! algebra, the slot-type registry, and binary-size parsing.

pub mod bytes;
pub mod error;
pub mod registry;
pub mod slot;
pub mod types;

pub use bytes::BinarySize;
pub use error::{CommonError, Result};
pub use registry::SlotTypeRegistry;
pub use slot::{DefaultForUnspecified, ResourceSlot, SlotTypes};
pub use types::{
    AccessKey, AgentId, AgentSelectionStrategy, ClusterMode, ClusterRole, DeviceId, DeviceName,
    KernelId, RoundRobinState, SessionId, SessionType, SlotName,
};
