//! The schedule repository: every row read and write of the scheduling
//! core goes through this boundary.
//!
//! The in-process implementation keeps rows behind one async `RwLock`d
//! store; a relational backend can replace it without touching the
//! dispatcher, since callers only see the method surface. Mutations that
//! the original design would bundle into one database transaction are
//! exposed as compensating pairs (`reserve_agent`/`unreserve_agent`) so
//! partial multi-kernel schedules can be rolled back explicitly.

use crate::error::{Result, SchedulingError};
use crate::models::{
    record_status_history, AgentRow, AgentStatus, DomainRow, GroupRow, KernelRow, KernelStatus,
    KeyPairResourcePolicy, KeyPairRow, ResourceGroupRow, SessionRow, SessionStatus, UserRow,
};
use crate::sched::{AgentAllocationContext, KernelAgentBinding};
use chrono::{DateTime, Utc};
use gridmesh_common::{AccessKey, AgentId, KernelId, ResourceSlot, SessionId};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Store {
    agents: BTreeMap<AgentId, AgentRow>,
    sessions: BTreeMap<SessionId, SessionRow>,
    kernels: BTreeMap<KernelId, KernelRow>,
    keypairs: BTreeMap<AccessKey, KeyPairRow>,
    policies: BTreeMap<String, KeyPairResourcePolicy>,
    users: BTreeMap<String, UserRow>,
    groups: BTreeMap<String, GroupRow>,
    domains: BTreeMap<String, DomainRow>,
    resource_groups: BTreeMap<String, ResourceGroupRow>,
}

impl Store {
    fn session_mut(&mut self, id: SessionId) -> Result<&mut SessionRow> {
        self.sessions
            .get_mut(&id)
            .ok_or(SchedulingError::SessionNotFound { id })
    }

    fn agent_mut(&mut self, id: &AgentId) -> Result<&mut AgentRow> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| SchedulingError::AgentNotFound { id: id.clone() })
    }

    fn kernels_of(&self, session_id: SessionId) -> Vec<KernelRow> {
        let mut kernels: Vec<KernelRow> = self
            .kernels
            .values()
            .filter(|k| k.session_id == session_id)
            .cloned()
            .collect();
        kernels.sort_by_key(|k| k.cluster_idx);
        kernels
    }

    /// Re-derive the session status from its kernels and stamp history on
    /// change.
    fn sync_session_status(&mut self, session_id: SessionId, now: DateTime<Utc>) {
        let derived = SessionStatus::derive_from_kernels(
            self.kernels
                .values()
                .filter(|k| k.session_id == session_id)
                .map(|k| k.status),
        );
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.status != derived && !session.status.is_terminal() {
                session.status = derived;
                record_status_history(&mut session.status_history, &derived.to_string(), now);
                if derived.is_terminal() {
                    session.terminated_at = Some(now);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ScheduleRepository {
    store: RwLock<Store>,
}

impl ScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    // ----- catalog upserts -------------------------------------------------

    pub async fn upsert_agent(&self, agent: AgentRow) {
        self.store.write().await.agents.insert(agent.id.clone(), agent);
    }

    pub async fn upsert_resource_group(&self, group: ResourceGroupRow) {
        self.store
            .write()
            .await
            .resource_groups
            .insert(group.name.clone(), group);
    }

    pub async fn upsert_keypair(&self, keypair: KeyPairRow) {
        self.store
            .write()
            .await
            .keypairs
            .insert(keypair.access_key.clone(), keypair);
    }

    pub async fn upsert_policy(&self, policy: KeyPairResourcePolicy) {
        self.store
            .write()
            .await
            .policies
            .insert(policy.name.clone(), policy);
    }

    pub async fn upsert_user(&self, user: UserRow) {
        self.store.write().await.users.insert(user.user_id.clone(), user);
    }

    pub async fn upsert_group(&self, group: GroupRow) {
        self.store.write().await.groups.insert(group.id.clone(), group);
    }

    pub async fn upsert_domain(&self, domain: DomainRow) {
        self.store.write().await.domains.insert(domain.name.clone(), domain);
    }

    // ----- reads -----------------------------------------------------------

    pub async fn get_agent(&self, id: &AgentId) -> Result<AgentRow> {
        self.store
            .read()
            .await
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulingError::AgentNotFound { id: id.clone() })
    }

    pub async fn get_session(&self, id: SessionId) -> Result<SessionRow> {
        self.store
            .read()
            .await
            .sessions
            .get(&id)
            .cloned()
            .ok_or(SchedulingError::SessionNotFound { id })
    }

    pub async fn kernels_of_session(&self, id: SessionId) -> Vec<KernelRow> {
        self.store.read().await.kernels_of(id)
    }

    pub async fn get_resource_group(&self, name: &str) -> Result<ResourceGroupRow> {
        self.store
            .read()
            .await
            .resource_groups
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulingError::ResourceGroupNotFound {
                name: name.to_owned(),
            })
    }

    pub async fn keypair(&self, access_key: &AccessKey) -> Result<KeyPairRow> {
        self.store
            .read()
            .await
            .keypairs
            .get(access_key)
            .cloned()
            .ok_or_else(|| SchedulingError::KeyPairNotFound {
                access_key: access_key.to_string(),
            })
    }

    pub async fn keypair_policy(&self, access_key: &AccessKey) -> Result<KeyPairResourcePolicy> {
        let store = self.store.read().await;
        let keypair = store.keypairs.get(access_key).ok_or_else(|| {
            SchedulingError::KeyPairNotFound {
                access_key: access_key.to_string(),
            }
        })?;
        Ok(store
            .policies
            .get(&keypair.resource_policy)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn get_user(&self, user_id: &str) -> Option<UserRow> {
        self.store.read().await.users.get(user_id).cloned()
    }

    pub async fn get_group(&self, group_id: &str) -> Option<GroupRow> {
        self.store.read().await.groups.get(group_id).cloned()
    }

    pub async fn get_domain(&self, name: &str) -> Option<DomainRow> {
        self.store.read().await.domains.get(name).cloned()
    }

    /// Resource groups that currently have at least one ALIVE agent.
    pub async fn schedulable_resource_groups(&self) -> Vec<String> {
        let store = self.store.read().await;
        let mut names: Vec<String> = store
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Alive)
            .map(|a| a.resource_group.clone())
            .collect();
        names.sort();
        names.dedup();
        names.retain(|name| store.resource_groups.contains_key(name));
        names
    }

    /// ALIVE agents of a resource group in stable (id) order.
    pub async fn schedulable_agents(&self, resource_group: &str) -> Vec<AgentRow> {
        self.store
            .read()
            .await
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Alive && a.resource_group == resource_group)
            .cloned()
            .collect()
    }

    pub async fn agent_slots(&self, id: &AgentId) -> Result<(ResourceSlot, ResourceSlot)> {
        let agent = self.get_agent(id).await?;
        Ok((agent.available_slots, agent.occupied_slots))
    }

    /// Partition a resource group's live sessions for one scheduling pass:
    /// non-PENDING ones are `existing`, PENDING ones split into still-valid
    /// `candidates` and `cancelled` whose queue residency exceeded the
    /// group's pending timeout (0 disables the timeout).
    pub async fn list_managed_sessions(
        &self,
        resource_group: &str,
        pending_timeout: Duration,
    ) -> (Vec<SessionRow>, Vec<SessionRow>, Vec<SessionRow>) {
        let store = self.store.read().await;
        let now = Utc::now();
        let mut existing = Vec::new();
        let mut candidates = Vec::new();
        let mut cancelled = Vec::new();
        let mut managed: Vec<&SessionRow> = store
            .sessions
            .values()
            .filter(|s| s.resource_group == resource_group && !s.status.is_terminal())
            .collect();
        managed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        for session in managed {
            if session.status != SessionStatus::Pending {
                existing.push(session.clone());
                continue;
            }
            let waited = (now - session.created_at).to_std().unwrap_or_default();
            if !pending_timeout.is_zero() && waited >= pending_timeout {
                cancelled.push(session.clone());
            } else {
                candidates.push(session.clone());
            }
        }
        (existing, candidates, cancelled)
    }

    /// Kernels in agent-occupying statuses per agent, for the container
    /// hard-limit filter.
    pub async fn container_counts(&self) -> BTreeMap<AgentId, usize> {
        let store = self.store.read().await;
        let mut counts: BTreeMap<AgentId, usize> = BTreeMap::new();
        for kernel in store.kernels.values() {
            if let Some(agent) = &kernel.agent {
                if kernel.status.occupies_agent_resources() {
                    *counts.entry(agent.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Kernels per agent serving replicas of one inference endpoint.
    pub async fn kernel_counts_at_endpoint(&self, endpoint_id: &str) -> BTreeMap<AgentId, usize> {
        let store = self.store.read().await;
        let endpoint_sessions: Vec<SessionId> = store
            .sessions
            .values()
            .filter(|s| s.endpoint_id.as_deref() == Some(endpoint_id))
            .map(|s| s.id)
            .collect();
        let mut counts: BTreeMap<AgentId, usize> = BTreeMap::new();
        for kernel in store.kernels.values() {
            if endpoint_sessions.contains(&kernel.session_id)
                && kernel.status.occupies_agent_resources()
            {
                if let Some(agent) = &kernel.agent {
                    *counts.entry(agent.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    pub async fn agents_snapshot(&self) -> Vec<AgentRow> {
        self.store.read().await.agents.values().cloned().collect()
    }

    pub async fn sessions_snapshot(&self) -> Vec<SessionRow> {
        self.store.read().await.sessions.values().cloned().collect()
    }

    pub async fn kernels_snapshot(&self) -> Vec<KernelRow> {
        self.store.read().await.kernels.values().cloned().collect()
    }

    pub async fn keypairs_snapshot(&self) -> Vec<KeyPairRow> {
        self.store.read().await.keypairs.values().cloned().collect()
    }

    // ----- enqueue ---------------------------------------------------------

    pub async fn enqueue_session(
        &self,
        mut session: SessionRow,
        kernels: Vec<KernelRow>,
    ) -> Result<SessionId> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        session.status = SessionStatus::Pending;
        record_status_history(&mut session.status_history, "PENDING", now);
        let session_id = session.id;
        for mut kernel in kernels {
            kernel.session_id = session_id;
            kernel.status = KernelStatus::Pending;
            record_status_history(&mut kernel.status_history, "PENDING", now);
            store.kernels.insert(kernel.id, kernel);
        }
        store.sessions.insert(session_id, session);
        debug!(session = %session_id, "enqueued session");
        Ok(session_id)
    }

    // ----- reservation and finalization ------------------------------------

    /// Add `requested_slots` to the agent's occupancy and return the
    /// context the kernels will be bound to. The caller must compensate
    /// with `unreserve_agent` if the surrounding schedule fails.
    pub async fn reserve_agent(
        &self,
        resource_group: &str,
        agent_id: &AgentId,
        requested_slots: &ResourceSlot,
    ) -> Result<AgentAllocationContext> {
        let mut store = self.store.write().await;
        let agent = store.agent_mut(agent_id)?;
        let mut occupied = agent.occupied_slots.clone();
        occupied.sync_keys(requested_slots);
        agent.occupied_slots = occupied + requested_slots.clone();
        Ok(AgentAllocationContext {
            agent_id: agent_id.clone(),
            agent_addr: agent.addr.clone(),
            resource_group: resource_group.to_owned(),
        })
    }

    /// Compensation for `reserve_agent`.
    pub async fn unreserve_agent(
        &self,
        agent_id: &AgentId,
        requested_slots: &ResourceSlot,
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let agent = store.agent_mut(agent_id)?;
        agent.occupied_slots = agent.occupied_slots.clone() - requested_slots.clone();
        Ok(())
    }

    pub async fn set_agent_occupied(&self, agent_id: &AgentId, slots: ResourceSlot) -> Result<()> {
        let mut store = self.store.write().await;
        store.agent_mut(agent_id)?.occupied_slots = slots;
        Ok(())
    }

    pub async fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()> {
        let mut store = self.store.write().await;
        store.agent_mut(agent_id)?.status = status;
        Ok(())
    }

    /// Bind every kernel of a single-node session to one agent and move the
    /// session to SCHEDULED, in one write.
    pub async fn finalize_single_node_session(
        &self,
        session_id: SessionId,
        alloc: &AgentAllocationContext,
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let kernel_ids: Vec<KernelId> = store
            .kernels
            .values()
            .filter(|k| k.session_id == session_id)
            .map(|k| k.id)
            .collect();
        for kernel_id in kernel_ids {
            if let Some(kernel) = store.kernels.get_mut(&kernel_id) {
                kernel.agent = Some(alloc.agent_id.clone());
                kernel.agent_addr = Some(alloc.agent_addr.clone());
                kernel.resource_group = alloc.resource_group.clone();
                kernel.status = KernelStatus::Scheduled;
                kernel.occupied_slots = kernel.requested_slots.clone();
                record_status_history(&mut kernel.status_history, "SCHEDULED", now);
            }
        }
        let session = store.session_mut(session_id)?;
        session.status = SessionStatus::Scheduled;
        session.occupying_slots = session.requested_slots.clone();
        session.agent_ids = vec![alloc.agent_id.clone()];
        record_status_history(&mut session.status_history, "SCHEDULED", now);
        info!(session = %session_id, agent = %alloc.agent_id, "session scheduled");
        Ok(())
    }

    /// Bind each kernel of a multi-node session to its chosen agent and
    /// move the session to SCHEDULED, in one write. All bindings must be
    /// present; partial schedules are rolled back by the dispatcher before
    /// this is reached.
    pub async fn finalize_multi_node_session(
        &self,
        session_id: SessionId,
        bindings: &[KernelAgentBinding],
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let mut agent_ids = Vec::new();
        for binding in bindings {
            let kernel = store.kernels.get_mut(&binding.kernel_id).ok_or_else(|| {
                SchedulingError::internal(format!(
                    "binding references unknown kernel {}",
                    binding.kernel_id
                ))
            })?;
            kernel.agent = Some(binding.agent.agent_id.clone());
            kernel.agent_addr = Some(binding.agent.agent_addr.clone());
            kernel.resource_group = binding.agent.resource_group.clone();
            kernel.status = KernelStatus::Scheduled;
            kernel.occupied_slots = kernel.requested_slots.clone();
            record_status_history(&mut kernel.status_history, "SCHEDULED", now);
            if !agent_ids.contains(&binding.agent.agent_id) {
                agent_ids.push(binding.agent.agent_id.clone());
            }
        }
        let session = store.session_mut(session_id)?;
        session.status = SessionStatus::Scheduled;
        session.occupying_slots = session.requested_slots.clone();
        session.agent_ids = agent_ids;
        record_status_history(&mut session.status_history, "SCHEDULED", now);
        info!(session = %session_id, agents = session.agent_ids.len(), "session scheduled");
        Ok(())
    }

    // ----- scheduling failure bookkeeping ----------------------------------

    /// Record a predicate-check failure: bumps the retry counter and stores
    /// the per-predicate pass/fail lists under `status_data.scheduler`.
    pub async fn update_session_predicate_failure(
        &self,
        session_id: SessionId,
        failed: serde_json::Value,
        passed: serde_json::Value,
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let session = store.session_mut(session_id)?;
        let retries = session.scheduler_retries() + 1;
        merge_scheduler_data(
            &mut session.status_data,
            json!({
                "retries": retries,
                "last_try": Utc::now().to_rfc3339(),
                "failed_predicates": failed,
                "passed_predicates": passed,
            }),
        );
        session.status_info = Some(crate::events::reasons::PREDICATE_CHECKS_FAILED.to_owned());
        Ok(())
    }

    /// Record a clean predicate pass (no retry bump).
    pub async fn update_session_status_data(
        &self,
        session_id: SessionId,
        passed: serde_json::Value,
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let session = store.session_mut(session_id)?;
        merge_scheduler_data(
            &mut session.status_data,
            json!({
                "last_try": Utc::now().to_rfc3339(),
                "failed_predicates": [],
                "passed_predicates": passed,
            }),
        );
        Ok(())
    }

    /// No compatible agent this tick: keep the session PENDING and note why.
    pub async fn update_session_scheduling_failure(
        &self,
        session_id: SessionId,
        message: &str,
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let session = store.session_mut(session_id)?;
        let retries = session.scheduler_retries() + 1;
        merge_scheduler_data(
            &mut session.status_data,
            json!({
                "retries": retries,
                "last_try": Utc::now().to_rfc3339(),
                "msg": message,
            }),
        );
        session.status_info = Some(crate::events::reasons::NO_AVAILABLE_INSTANCES.to_owned());
        Ok(())
    }

    pub async fn update_kernel_scheduling_failure(
        &self,
        session_id: SessionId,
        kernel_id: KernelId,
        message: &str,
    ) -> Result<()> {
        {
            let mut store = self.store.write().await;
            if let Some(kernel) = store.kernels.get_mut(&kernel_id) {
                kernel.status_data = json!({"scheduler": {"msg": message}});
                kernel.status_info =
                    Some(crate::events::reasons::NO_AVAILABLE_INSTANCES.to_owned());
            }
        }
        self.update_session_scheduling_failure(session_id, message)
            .await
    }

    /// Unexpected error during scheduling: store the `{src, name, repr}`
    /// record.
    pub async fn update_session_generic_failure(
        &self,
        session_id: SessionId,
        error_data: serde_json::Value,
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let session = store.session_mut(session_id)?;
        merge_json(&mut session.status_data, error_data);
        session.status_info = Some(crate::events::reasons::SCHEDULER_ERROR.to_owned());
        Ok(())
    }

    // ----- cancellation ----------------------------------------------------

    /// Move whole sessions (and their kernels) to CANCELLED.
    pub async fn apply_cancellation(&self, session_ids: &[SessionId], reason: &str) {
        let mut store = self.store.write().await;
        let now = Utc::now();
        for kernel in store.kernels.values_mut() {
            if session_ids.contains(&kernel.session_id) && !kernel.status.is_terminal() {
                kernel.status = KernelStatus::Cancelled;
                kernel.status_info = Some(reason.to_owned());
                kernel.terminated_at = Some(now);
                record_status_history(&mut kernel.status_history, "CANCELLED", now);
            }
        }
        for session_id in session_ids {
            if let Some(session) = store.sessions.get_mut(session_id) {
                session.status = SessionStatus::Cancelled;
                session.status_info = Some(reason.to_owned());
                session.terminated_at = Some(now);
                record_status_history(&mut session.status_history, "CANCELLED", now);
            }
        }
    }

    pub async fn mark_session_cancelled(
        &self,
        session_id: SessionId,
        status_data: serde_json::Value,
        reason: &str,
    ) -> Result<()> {
        {
            let mut store = self.store.write().await;
            let session = store.session_mut(session_id)?;
            merge_json(&mut session.status_data, status_data);
        }
        self.apply_cancellation(&[session_id], reason).await;
        Ok(())
    }

    // ----- stage transitions -----------------------------------------------

    /// SCHEDULED sessions move to PREPARING; returns them with kernels for
    /// the image-pull stage.
    pub async fn transit_scheduled_to_preparing(&self) -> Vec<(SessionRow, Vec<KernelRow>)> {
        self.transit_stage(
            SessionStatus::Scheduled,
            SessionStatus::Preparing,
            KernelStatus::Preparing,
        )
        .await
    }

    /// PREPARED sessions move to CREATING; returns them with kernels for
    /// the container-create stage.
    pub async fn mark_sessions_and_kernels_creating(&self) -> Vec<(SessionRow, Vec<KernelRow>)> {
        self.transit_stage(
            SessionStatus::Prepared,
            SessionStatus::Creating,
            KernelStatus::Creating,
        )
        .await
    }

    async fn transit_stage(
        &self,
        from: SessionStatus,
        to: SessionStatus,
        kernel_to: KernelStatus,
    ) -> Vec<(SessionRow, Vec<KernelRow>)> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let session_ids: Vec<SessionId> = store
            .sessions
            .values()
            .filter(|s| s.status == from)
            .map(|s| s.id)
            .collect();
        let mut out = Vec::with_capacity(session_ids.len());
        for session_id in session_ids {
            for kernel in store.kernels.values_mut() {
                if kernel.session_id == session_id && !kernel.status.is_terminal() {
                    kernel.status = kernel_to;
                    record_status_history(&mut kernel.status_history, &kernel_to.to_string(), now);
                }
            }
            if let Some(session) = store.sessions.get_mut(&session_id) {
                session.status = to;
                record_status_history(&mut session.status_history, &to.to_string(), now);
            }
            let kernels = store.kernels_of(session_id);
            if let Some(session) = store.sessions.get(&session_id) {
                out.push((session.clone(), kernels));
            }
        }
        out
    }

    /// Per-kernel status transition with validation; the owning session's
    /// status is re-derived afterwards.
    pub async fn transit_kernel_status(
        &self,
        kernel_id: KernelId,
        to: KernelStatus,
        status_info: Option<&str>,
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let session_id = {
            let kernel = store.kernels.get_mut(&kernel_id).ok_or_else(|| {
                SchedulingError::internal(format!("unknown kernel {kernel_id}"))
            })?;
            if !kernel.status.can_transit(to) {
                warn!(
                    kernel = %kernel_id,
                    from = %kernel.status,
                    to = %to,
                    "rejected kernel status transition"
                );
                return Err(SchedulingError::internal(format!(
                    "kernel {kernel_id} cannot move {} -> {to}",
                    kernel.status
                )));
            }
            kernel.status = to;
            if let Some(info) = status_info {
                kernel.status_info = Some(info.to_owned());
            }
            if to.is_terminal() {
                kernel.terminated_at = Some(now);
            }
            record_status_history(&mut kernel.status_history, &to.to_string(), now);
            kernel.session_id
        };
        store.sync_session_status(session_id, now);
        Ok(())
    }

    /// Container creation finished: record the container id, the settled
    /// occupancy, and the persisted resource spec, and move the kernel to
    /// RUNNING.
    pub async fn kernel_started(
        &self,
        kernel_id: KernelId,
        container_id: &str,
        occupied_slots: ResourceSlot,
        resource_spec: Option<gridmesh_agent::KernelResourceSpec>,
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let session_id = {
            let kernel = store.kernels.get_mut(&kernel_id).ok_or_else(|| {
                SchedulingError::internal(format!("unknown kernel {kernel_id}"))
            })?;
            kernel.container_id = Some(container_id.to_owned());
            kernel.occupied_slots = occupied_slots;
            kernel.resource_spec = resource_spec;
            kernel.status = KernelStatus::Running;
            record_status_history(&mut kernel.status_history, "RUNNING", now);
            kernel.session_id
        };
        store.sync_session_status(session_id, now);
        Ok(())
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target.as_object_mut(), update.as_object()) {
        (Some(target_map), Some(update_map)) => {
            for (key, value) in update_map {
                target_map.insert(key.clone(), value.clone());
            }
        }
        _ => *target = update,
    }
}

fn merge_scheduler_data(status_data: &mut serde_json::Value, update: serde_json::Value) {
    if !status_data.is_object() {
        *status_data = json!({});
    }
    let map = status_data.as_object_mut().expect("just normalized");
    let scheduler = map
        .entry("scheduler")
        .or_insert_with(|| json!({}));
    merge_json(scheduler, update);
}
