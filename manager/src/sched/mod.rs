//! Scheduling: queueing policies, agent selection, admission predicates,
//! and the dispatcher that drives them.

pub mod dispatcher;
pub mod policy;
pub mod predicates;
pub mod selector;

pub use dispatcher::{
    AgentClient, EchoAgentClient, KernelCreationResult, SchedulerDispatcher,
};
pub use policy::{load_scheduler, prioritize, Scheduler};
pub use predicates::PredicateResult;
pub use selector::{build_selector, AgentSelector};

use gridmesh_common::{AgentId, KernelId, SlotName, SlotTypes};
use std::collections::BTreeMap;

/// Context shared by one scheduling decision: a snapshot of the slot-type
/// registry and the configured resource priority order.
#[derive(Debug, Clone, Default)]
pub struct SchedulingContext {
    pub known_slot_types: BTreeMap<SlotName, SlotTypes>,
    pub agent_selection_resource_priority: Vec<String>,
}

/// The agent a reservation was committed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentAllocationContext {
    pub agent_id: AgentId,
    pub agent_addr: String,
    pub resource_group: String,
}

/// One kernel bound to its reserved agent.
#[derive(Debug, Clone)]
pub struct KernelAgentBinding {
    pub kernel_id: KernelId,
    pub agent: AgentAllocationContext,
}
