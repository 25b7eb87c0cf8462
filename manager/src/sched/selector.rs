//! Agent selection strategies: which compatible agent hosts a session (or
//! one kernel of a multi-node session).
//!
//! Agents are compared on a key built from the configured resource
//! priority order (e.g. `["cuda.device", "cuda.shares", "cpu", "mem"]`).
//! A requested slot missing from an agent contributes a +/-infinity
//! sentinel so such agents sort to the losing end. `num_extras` counts slot
//! types an agent offers that the request does not use, steering requests
//! away from specialized hardware they would waste.

use crate::error::{Result, SchedulingError};
use crate::models::{AgentRow, KernelRow, SessionRow};
use crate::sched::SchedulingContext;
use crate::statestore::StateStore;
use async_trait::async_trait;
use gridmesh_common::{
    AgentId, AgentSelectionStrategy, ResourceSlot, RoundRobinState, SlotName,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait AgentSelector: Send + Sync {
    /// Choose one agent able to host the whole session (single-node mode).
    async fn assign_for_session(
        &self,
        agents: &[AgentRow],
        session: &SessionRow,
        kernels: &[KernelRow],
    ) -> Result<Option<AgentId>>;

    /// Choose one agent for a single kernel (multi-node mode).
    async fn assign_for_kernel(
        &self,
        agents: &[AgentRow],
        kernel: &KernelRow,
    ) -> Result<Option<AgentId>>;
}

/// All kernels of a single-node session must share one architecture.
pub fn requested_architecture(kernels: &[KernelRow]) -> Result<String> {
    let mut architectures: Vec<&str> =
        kernels.iter().map(|k| k.architecture.as_str()).collect();
    architectures.sort_unstable();
    architectures.dedup();
    match architectures.as_slice() {
        [single] => Ok((*single).to_owned()),
        [] => Err(SchedulingError::bad_request("session has no kernels")),
        _ => Err(SchedulingError::bad_request(
            "cannot assign kernels with different architectures to a single-node session",
        )),
    }
}

fn filter_capable<'a>(agents: &'a [AgentRow], requested: &ResourceSlot) -> Vec<&'a AgentRow> {
    agents
        .iter()
        .filter(|agent| agent.remaining_slots().covers(requested))
        .collect()
}

/// Slot types the request leaves at zero but the agent offers anyway.
fn num_extras(agent: &AgentRow, requested: &ResourceSlot) -> i64 {
    let unused: Vec<&SlotName> = requested
        .iter()
        .filter(|(_, v)| **v == Decimal::ZERO)
        .map(|(k, _)| k)
        .collect();
    agent
        .available_slots
        .iter()
        .filter(|(k, v)| unused.contains(k) && **v > Decimal::ZERO)
        .count() as i64
}

/// Order the requested slot names by the configured priority list. A slot
/// whose exact name is absent but whose device prefix is present slots in
/// right after its prefix, so `cuda.shares` follows `cuda`.
pub fn sort_requested_slots_by_priority(
    requested: &ResourceSlot,
    resource_priority: &[String],
) -> Vec<SlotName> {
    let mut priority: Vec<String> = resource_priority.to_vec();
    let mut names: Vec<SlotName> = requested.keys().cloned().collect();
    names.sort_by(|a, b| b.cmp(a));
    for name in &names {
        let device = name.device_name();
        if !priority.contains(&name.to_string()) {
            if let Some(pos) = priority.iter().position(|p| p == device.as_str()) {
                priority.insert(pos + 1, name.to_string());
            }
        }
    }
    let index_of = |name: &SlotName| {
        priority
            .iter()
            .position(|p| p == name.as_str())
            .unwrap_or(usize::MAX)
    };
    let mut ordered: Vec<SlotName> = requested.keys().cloned().collect();
    ordered.sort_by_key(index_of);
    ordered
}

enum RankedBy {
    /// Maximize advertised capacity (historical behavior).
    Available,
    /// Maximize remaining capacity.
    RemainingDesc,
    /// Minimize remaining capacity, optionally penalizing agents already
    /// hosting replicas of the same endpoint.
    RemainingAsc,
}

struct RankedSelector {
    ranked_by: RankedBy,
    resource_priority: Vec<String>,
    endpoint_kernel_counts: Option<BTreeMap<AgentId, usize>>,
}

impl RankedSelector {
    fn choose(&self, agents: &[AgentRow], requested: &ResourceSlot) -> Option<AgentId> {
        let capable = filter_capable(agents, requested);
        if capable.is_empty() {
            return None;
        }
        let priorities = sort_requested_slots_by_priority(requested, &self.resource_priority);
        let key = |agent: &AgentRow| -> (i64, i64, Vec<Decimal>) {
            let replica_penalty = self
                .endpoint_kernel_counts
                .as_ref()
                .and_then(|counts| counts.get(&agent.id).copied())
                .unwrap_or(0) as i64;
            let extras = num_extras(agent, requested);
            let remaining = agent.remaining_slots();
            match self.ranked_by {
                RankedBy::Available => (
                    -replica_penalty,
                    -extras,
                    priorities
                        .iter()
                        .map(|slot| agent.available_slots.get_or(slot, Decimal::MIN))
                        .collect(),
                ),
                RankedBy::RemainingDesc => (
                    -replica_penalty,
                    -extras,
                    priorities
                        .iter()
                        .map(|slot| remaining.get_or(slot, Decimal::MIN))
                        .collect(),
                ),
                RankedBy::RemainingAsc => (
                    -replica_penalty,
                    -extras,
                    priorities
                        .iter()
                        // Negated so the common "maximize the key" shape
                        // picks the least-remaining agent.
                        .map(|slot| -remaining.get_or(slot, Decimal::MAX))
                        .collect(),
                ),
            }
        };
        let chosen = capable
            .into_iter()
            .max_by(|a, b| key(a).cmp(&key(b)))
            .expect("capable list is non-empty");
        Some(chosen.id.clone())
    }
}

#[async_trait]
impl AgentSelector for RankedSelector {
    async fn assign_for_session(
        &self,
        agents: &[AgentRow],
        session: &SessionRow,
        _kernels: &[KernelRow],
    ) -> Result<Option<AgentId>> {
        Ok(self.choose(agents, &session.requested_slots))
    }

    async fn assign_for_kernel(
        &self,
        agents: &[AgentRow],
        kernel: &KernelRow,
    ) -> Result<Option<AgentId>> {
        Ok(self.choose(agents, &kernel.requested_slots))
    }
}

/// Rotates through the compatible agents with an index persisted per
/// (resource group, architecture). The rotation does not check capacity;
/// an over-committed pick fails at reservation time. Multi-node kernels
/// fall back to the dispersed ranking because rotation has no meaning
/// across heterogeneous per-kernel placements.
struct RoundRobinSelector {
    resource_group: String,
    state: Arc<StateStore>,
    fallback: RankedSelector,
}

#[async_trait]
impl AgentSelector for RoundRobinSelector {
    async fn assign_for_session(
        &self,
        agents: &[AgentRow],
        _session: &SessionRow,
        kernels: &[KernelRow],
    ) -> Result<Option<AgentId>> {
        let architecture = requested_architecture(kernels)?;
        if agents.is_empty() {
            return Ok(None);
        }
        // No capacity filter: the rotation covers every compatible agent,
        // and an over-committed pick surfaces at reservation time. The
        // agent list may also have changed since the index was stored; the
        // modulo keeps the pick valid at the cost of an arbitrary rotation
        // restart.
        let index = self
            .state
            .get_roundrobin(&self.resource_group, &architecture)
            .map(|s| s.next_index)
            .unwrap_or(0)
            % agents.len();
        let chosen = agents[index].id.clone();
        self.state.put_roundrobin(
            &self.resource_group,
            &architecture,
            RoundRobinState {
                next_index: (index + 1) % agents.len(),
            },
        );
        debug!(agent = %chosen, index, "round-robin pick");
        Ok(Some(chosen))
    }

    async fn assign_for_kernel(
        &self,
        agents: &[AgentRow],
        kernel: &KernelRow,
    ) -> Result<Option<AgentId>> {
        self.fallback.assign_for_kernel(agents, kernel).await
    }
}

/// Tagged-variant registry of the built-in selectors.
pub fn build_selector(
    strategy: AgentSelectionStrategy,
    ctx: &SchedulingContext,
    resource_group: &str,
    state: Arc<StateStore>,
    endpoint_kernel_counts: Option<BTreeMap<AgentId, usize>>,
) -> Arc<dyn AgentSelector> {
    let ranked = |ranked_by| RankedSelector {
        ranked_by,
        resource_priority: ctx.agent_selection_resource_priority.clone(),
        endpoint_kernel_counts: endpoint_kernel_counts.clone(),
    };
    match strategy {
        AgentSelectionStrategy::Legacy => Arc::new(ranked(RankedBy::Available)),
        AgentSelectionStrategy::Dispersed => Arc::new(ranked(RankedBy::RemainingDesc)),
        AgentSelectionStrategy::Concentrated => Arc::new(ranked(RankedBy::RemainingAsc)),
        AgentSelectionStrategy::RoundRobin => Arc::new(RoundRobinSelector {
            resource_group: resource_group.to_owned(),
            state,
            fallback: ranked(RankedBy::RemainingDesc),
        }),
    }
}
