//! Resource accounting: heartbeat intake, liveness, occupancy queries,
//! settlement, and the drift-repairing recalculation.

use crate::error::Result;
use crate::events::EventProducer;
use crate::models::{AgentRow, AgentStatus};
use crate::repository::ScheduleRepository;
use crate::sched::KernelAgentBinding;
use crate::statestore::{keypair_concurrency_key, StateStore};
use chrono::Utc;
use gridmesh_agent::{
    AgentHeartbeat, AllocMap, AllocationStrategy, DeviceAllocation, DiscreteAllocMap,
    KernelResourceSpec,
};
use gridmesh_common::{
    AccessKey, AgentId, KernelId, ResourceSlot, SlotTypeRegistry,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One agent's rebuilt allocation map plus the kernels already reflected
/// in it, so replays stay idempotent between heartbeat rebuilds.
struct AllocMapState {
    map: AllocMap,
    replayed_kernels: BTreeSet<KernelId>,
}

/// The manager-side view of the agent fleet and the accounting that keeps
/// `occupied_slots` and `concurrency_used` consistent with the kernel
/// table.
pub struct AgentRegistry {
    repository: Arc<ScheduleRepository>,
    state: Arc<StateStore>,
    events: EventProducer,
    slot_types: Arc<SlotTypeRegistry>,
    alloc_maps: RwLock<BTreeMap<AgentId, AllocMapState>>,
}

impl AgentRegistry {
    pub fn new(
        repository: Arc<ScheduleRepository>,
        state: Arc<StateStore>,
        events: EventProducer,
        slot_types: Arc<SlotTypeRegistry>,
    ) -> Self {
        Self {
            repository,
            state,
            events,
            slot_types,
            alloc_maps: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<ScheduleRepository> {
        &self.repository
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn events(&self) -> &EventProducer {
        &self.events
    }

    pub fn slot_types(&self) -> &Arc<SlotTypeRegistry> {
        &self.slot_types
    }

    /// Front door for new session requests: persist the rows PENDING and
    /// announce the arrival.
    pub async fn enqueue_session(
        &self,
        session: crate::models::SessionRow,
        kernels: Vec<crate::models::KernelRow>,
    ) -> Result<gridmesh_common::SessionId> {
        let session_id = self.repository.enqueue_session(session, kernels).await?;
        self.events
            .produce(crate::events::SchedulingEvent::SessionEnqueued { session_id });
        Ok(session_id)
    }

    // ----- heartbeats and liveness -----------------------------------------

    /// Upsert the agent row from a heartbeat. The first heartbeat creates
    /// the row ALIVE with empty occupancy; later ones refresh capacity and
    /// liveness and may revive a LOST agent.
    pub async fn handle_heartbeat(&self, heartbeat: &AgentHeartbeat) -> Result<()> {
        for (slot_name, slot_type) in &heartbeat.slot_types {
            if let Err(error) = self.slot_types.add(slot_name.clone(), *slot_type) {
                warn!(%error, "ignoring conflicting slot type from heartbeat");
            }
        }
        let now = Utc::now();
        match self.repository.get_agent(&heartbeat.agent_id).await {
            Ok(mut agent) => {
                if agent.status == AgentStatus::Lost {
                    info!(agent = %agent.id, "agent revived by heartbeat");
                }
                agent.addr = heartbeat.addr.clone();
                agent.architecture = heartbeat.architecture.clone();
                agent.resource_group = heartbeat.resource_group.clone();
                agent.status = AgentStatus::Alive;
                agent.available_slots = heartbeat.available_slots.clone();
                agent.version = heartbeat.version.clone();
                agent.compute_plugins = heartbeat.compute_plugins.clone();
                agent.last_heartbeat = now;
                self.repository.upsert_agent(agent).await;
            }
            Err(_) => {
                info!(agent = %heartbeat.agent_id, "agent joined");
                self.repository
                    .upsert_agent(AgentRow {
                        id: heartbeat.agent_id.clone(),
                        addr: heartbeat.addr.clone(),
                        architecture: heartbeat.architecture.clone(),
                        resource_group: heartbeat.resource_group.clone(),
                        status: AgentStatus::Alive,
                        available_slots: heartbeat.available_slots.clone(),
                        occupied_slots: ResourceSlot::new(),
                        version: heartbeat.version.clone(),
                        compute_plugins: heartbeat.compute_plugins.clone(),
                        first_contact: now,
                        last_heartbeat: now,
                    })
                    .await;
            }
        }
        if !heartbeat.device_slots.is_empty() {
            self.rebuild_alloc_map(heartbeat).await?;
        }
        Ok(())
    }

    /// Rebuild the agent's allocation map from the heartbeat: replay the
    /// resource specs of its live containers, then the persisted specs of
    /// occupying kernels the heartbeat did not report (allocated before an
    /// agent restart, or mid-preparation without a container yet). The map
    /// is replaced wholesale, so repeated heartbeats converge rather than
    /// accumulate.
    async fn rebuild_alloc_map(&self, heartbeat: &AgentHeartbeat) -> Result<()> {
        let mut state = AllocMapState {
            map: rehydrate_alloc_map(heartbeat)?,
            replayed_kernels: heartbeat
                .containers
                .iter()
                .map(|c| c.kernel_id)
                .collect(),
        };
        for kernel in self.repository.kernels_snapshot().await {
            if kernel.agent.as_ref() != Some(&heartbeat.agent_id)
                || !kernel.status.occupies_agent_resources()
                || state.replayed_kernels.contains(&kernel.id)
            {
                continue;
            }
            if let Some(spec) = &kernel.resource_spec {
                apply_spec_to_map(&mut state.map, spec)?;
                state.replayed_kernels.insert(kernel.id);
            }
        }
        debug!(
            agent = %heartbeat.agent_id,
            kernels = state.replayed_kernels.len(),
            "rebuilt allocation map from heartbeat"
        );
        self.alloc_maps
            .write()
            .await
            .insert(heartbeat.agent_id.clone(), state);
        Ok(())
    }

    /// Replay one kernel's persisted allocation into its agent's map, used
    /// when a session found mid-preparation after a restart is re-driven.
    /// Kernels already reflected in the map are skipped; an agent without a
    /// map yet is picked up by its next heartbeat rebuild.
    pub async fn replay_kernel_allocation(
        &self,
        agent_id: &AgentId,
        kernel_id: KernelId,
        spec: &KernelResourceSpec,
    ) -> Result<()> {
        let mut maps = self.alloc_maps.write().await;
        let Some(state) = maps.get_mut(agent_id) else {
            debug!(agent = %agent_id, kernel = %kernel_id, "no allocation map yet, deferring replay");
            return Ok(());
        };
        if !state.replayed_kernels.insert(kernel_id) {
            return Ok(());
        }
        if let Err(err) = apply_spec_to_map(&mut state.map, spec) {
            state.replayed_kernels.remove(&kernel_id);
            return Err(err.into());
        }
        Ok(())
    }

    /// The rebuilt per-device commitments of one agent, if it has
    /// heartbeated with a device inventory.
    pub async fn agent_device_allocations(&self, agent_id: &AgentId) -> Option<DeviceAllocation> {
        self.alloc_maps
            .read()
            .await
            .get(agent_id)
            .map(|state| state.map.allocations().clone())
    }

    /// Mark agents whose heartbeat has been silent beyond `timeout` LOST
    /// and reconcile occupancy afterwards.
    pub async fn sweep_lost_agents(&self, timeout: Duration) -> Result<Vec<AgentId>> {
        let now = Utc::now();
        let mut lost = Vec::new();
        for agent in self.repository.agents_snapshot().await {
            if agent.status != AgentStatus::Alive {
                continue;
            }
            let silent = (now - agent.last_heartbeat).to_std().unwrap_or_default();
            if silent > timeout {
                warn!(agent = %agent.id, ?silent, "marking agent LOST");
                self.repository
                    .set_agent_status(&agent.id, AgentStatus::Lost)
                    .await?;
                lost.push(agent.id);
            }
        }
        if !lost.is_empty() {
            self.recalc_resource_usage(true).await?;
        }
        Ok(lost)
    }

    // ----- occupancy queries -----------------------------------------------

    async fn occupancy_where(
        &self,
        mut predicate: impl FnMut(&crate::models::SessionRow) -> bool,
    ) -> ResourceSlot {
        let mut total = ResourceSlot::new();
        for session in self.repository.sessions_snapshot().await {
            if session.status.occupies_user_concurrency() && predicate(&session) {
                total += session.occupying_slots.clone();
            }
        }
        total
    }

    pub async fn keypair_occupancy(&self, access_key: &AccessKey) -> ResourceSlot {
        self.occupancy_where(|s| &s.access_key == access_key).await
    }

    pub async fn user_occupancy(&self, user_id: &str) -> ResourceSlot {
        self.occupancy_where(|s| s.user_id == user_id).await
    }

    pub async fn group_occupancy(&self, group_id: &str) -> ResourceSlot {
        self.occupancy_where(|s| s.group_id == group_id).await
    }

    pub async fn domain_occupancy(&self, domain_name: &str) -> ResourceSlot {
        self.occupancy_where(|s| s.domain_name == domain_name).await
    }

    // ----- reconciliation --------------------------------------------------

    /// Re-derive `agent.occupied_slots` and `concurrency_used` from the
    /// kernel and session tables.
    ///
    /// The delta branch (`do_fullscan == false`) rewrites only agents that
    /// currently host occupying kernels and counters of keys with occupying
    /// sessions. The fullscan branch also zeroes every other agent row and
    /// every other keypair counter, repairing drift from crashes or lost
    /// agents. Both branches are idempotent.
    pub async fn recalc_resource_usage(&self, do_fullscan: bool) -> Result<()> {
        let mut occupied_per_agent: BTreeMap<AgentId, ResourceSlot> = BTreeMap::new();
        for kernel in self.repository.kernels_snapshot().await {
            if let Some(agent) = &kernel.agent {
                if kernel.status.occupies_agent_resources() {
                    let entry = occupied_per_agent
                        .entry(agent.clone())
                        .or_insert_with(ResourceSlot::new);
                    *entry += kernel.occupied_slots.clone();
                }
            }
        }
        let mut concurrency_per_key: BTreeMap<AccessKey, i64> = BTreeMap::new();
        for session in self.repository.sessions_snapshot().await {
            if session.status.occupies_user_concurrency() {
                *concurrency_per_key.entry(session.access_key.clone()).or_insert(0) += 1;
            }
        }

        for (agent_id, slots) in &occupied_per_agent {
            self.repository
                .set_agent_occupied(agent_id, slots.clone())
                .await?;
        }
        for (access_key, count) in &concurrency_per_key {
            self.state
                .set_counter(&keypair_concurrency_key(access_key), *count);
        }
        if do_fullscan {
            for agent in self.repository.agents_snapshot().await {
                if !occupied_per_agent.contains_key(&agent.id) {
                    self.repository
                        .set_agent_occupied(&agent.id, ResourceSlot::new())
                        .await?;
                }
            }
            for keypair in self.repository.keypairs_snapshot().await {
                if !concurrency_per_key.contains_key(&keypair.access_key) {
                    self.state
                        .set_counter(&keypair_concurrency_key(&keypair.access_key), 0);
                }
            }
        }
        debug!(
            agents = occupied_per_agent.len(),
            keys = concurrency_per_key.len(),
            do_fullscan,
            "recalculated resource usage"
        );
        Ok(())
    }

    /// Reset one keypair's concurrency counter from the session table,
    /// used to roll back the concurrency predicate's increment.
    pub async fn recalc_concurrency_used(&self, access_key: &AccessKey) -> Result<()> {
        let mut count = 0i64;
        for session in self.repository.sessions_snapshot().await {
            if &session.access_key == access_key
                && session.status.occupies_user_concurrency()
            {
                count += 1;
            }
        }
        self.state
            .set_counter(&keypair_concurrency_key(access_key), count);
        Ok(())
    }

    /// Settle requested vs actually-created allocations per agent. Agents
    /// may round allocations by up to a quantum during container creation;
    /// the delta is absorbed into `occupied_slots` exactly once.
    pub async fn settle_agent_alloc(
        &self,
        bindings: &[KernelAgentBinding],
        requested: &BTreeMap<KernelId, ResourceSlot>,
        actual: &BTreeMap<KernelId, ResourceSlot>,
    ) -> Result<()> {
        let mut per_agent: BTreeMap<AgentId, (ResourceSlot, ResourceSlot)> = BTreeMap::new();
        for binding in bindings {
            let (requested_sum, actual_sum) = per_agent
                .entry(binding.agent.agent_id.clone())
                .or_insert_with(|| (ResourceSlot::new(), ResourceSlot::new()));
            let kernel_requested = requested
                .get(&binding.kernel_id)
                .cloned()
                .unwrap_or_default();
            // Missing actuals fall back to the requested value so nothing
            // is double-counted.
            let kernel_actual = actual
                .get(&binding.kernel_id)
                .cloned()
                .unwrap_or_else(|| kernel_requested.clone());
            *requested_sum += kernel_requested;
            *actual_sum += kernel_actual;
        }
        for (agent_id, (requested_sum, actual_sum)) in per_agent {
            if requested_sum == actual_sum {
                continue;
            }
            debug!(agent = %agent_id, "calibrating settled resource usage");
            let (_, occupied) = self.repository.agent_slots(&agent_id).await?;
            let delta_adjusted = occupied + actual_sum - requested_sum;
            self.repository
                .set_agent_occupied(&agent_id, delta_adjusted)
                .await?;
        }
        Ok(())
    }
}

/// Rebuild an agent's discrete allocation map from the resource specs of
/// its live containers, as reported by heartbeat. Every heartbeat intake
/// runs this so in-memory allocation state matches reality before any new
/// scheduling, including on manager start.
pub fn rehydrate_alloc_map(heartbeat: &AgentHeartbeat) -> Result<AllocMap> {
    let mut map = AllocMap::Discrete(DiscreteAllocMap::new(
        heartbeat.device_slots.clone(),
        AllocationStrategy::Fill,
        [],
        [],
    )?);
    for container in &heartbeat.containers {
        apply_spec_to_map(&mut map, &container.resource_spec)?;
    }
    Ok(map)
}

/// Replay one persisted spec into a map, restricted to the slots the map
/// actually hosts devices for. Exceeding capacity is fatal (corrupted
/// persistent state).
fn apply_spec_to_map(
    map: &mut AllocMap,
    spec: &KernelResourceSpec,
) -> gridmesh_agent::Result<()> {
    let mut flat = spec.flattened_allocations();
    let hosted: BTreeSet<_> = map
        .device_slots()
        .values()
        .map(|info| info.slot_name.clone())
        .collect();
    flat.retain(|slot_name, _| hosted.contains(slot_name));
    map.apply_allocation(&flat)
}
