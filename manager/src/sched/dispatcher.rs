//! The scheduler dispatcher: the periodic, globally-locked loop that moves
//! sessions PENDING -> SCHEDULED and drives the preparation and start
//! stages.
//!
//! Each tick re-reads authoritative rows under the stage lock, so stale
//! in-memory state can never commit a wrong decision; each session is
//! committed atomically (all kernels reserved or none), and every partial
//! reservation is compensated before an error propagates.

use crate::config::ManagerConfig;
use crate::error::{Result, SchedulingError};
use crate::events::{reasons, SchedulingEvent};
use crate::lock::{LockFactory, LockId};
use crate::models::{AgentRow, KernelRow, SessionRow};
use crate::registry::AgentRegistry;
use crate::sched::predicates::{self, PredicateResult};
use crate::sched::selector::requested_architecture;
use crate::sched::{
    build_selector, load_scheduler, prioritize, AgentAllocationContext, AgentSelector,
    KernelAgentBinding, SchedulingContext,
};
use async_trait::async_trait;
use chrono::Utc;
use gridmesh_common::{
    AgentId, AgentSelectionStrategy, KernelId, ResourceSlot, SessionId, SessionType,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one kernel's container creation, as reported by the agent.
/// `actual_allocations` may differ from the request by agent-side rounding;
/// the settlement step absorbs the difference.
#[derive(Debug, Clone)]
pub struct KernelCreationResult {
    pub kernel_id: KernelId,
    pub container_id: String,
    pub actual_allocations: ResourceSlot,
}

/// Outbound RPC surface of an agent. The scheduling core only consumes
/// this interface; transports live outside it.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn check_and_pull_image(
        &self,
        agent: &AgentAllocationContext,
        image: &str,
        architecture: &str,
    ) -> Result<()>;

    async fn create_kernels(
        &self,
        agent: &AgentAllocationContext,
        session_id: SessionId,
        kernels: &[KernelRow],
    ) -> Result<Vec<KernelCreationResult>>;

    async fn destroy_kernel(
        &self,
        agent: &AgentAllocationContext,
        kernel_id: KernelId,
        reason: &str,
    ) -> Result<()>;
}

/// Test and bring-up client: every RPC succeeds and containers receive
/// exactly the requested allocation.
pub struct EchoAgentClient;

#[async_trait]
impl AgentClient for EchoAgentClient {
    async fn check_and_pull_image(
        &self,
        _agent: &AgentAllocationContext,
        _image: &str,
        _architecture: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn create_kernels(
        &self,
        _agent: &AgentAllocationContext,
        _session_id: SessionId,
        kernels: &[KernelRow],
    ) -> Result<Vec<KernelCreationResult>> {
        Ok(kernels
            .iter()
            .map(|kernel| KernelCreationResult {
                kernel_id: kernel.id,
                container_id: format!("container-{}", kernel.id),
                actual_allocations: kernel.requested_slots.clone(),
            })
            .collect())
    }

    async fn destroy_kernel(
        &self,
        _agent: &AgentAllocationContext,
        _kernel_id: KernelId,
        _reason: &str,
    ) -> Result<()> {
        Ok(())
    }
}

pub struct SchedulerDispatcher {
    registry: Arc<AgentRegistry>,
    lock_factory: Arc<dyn LockFactory>,
    agent_client: Arc<dyn AgentClient>,
    config: ManagerConfig,
}

impl SchedulerDispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        lock_factory: Arc<dyn LockFactory>,
        agent_client: Arc<dyn AgentClient>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            lock_factory,
            agent_client,
            config,
        }
    }

    fn scheduling_context(&self) -> SchedulingContext {
        SchedulingContext {
            known_slot_types: self.registry.slot_types().snapshot(),
            agent_selection_resource_priority: self
                .config
                .agent_selection_resource_priority
                .clone(),
        }
    }

    fn mark_stage_start(&self, stage: &str, event_name: &str) {
        let key = format!("manager.{}.{stage}", self.config.id);
        self.registry.state().replace_mark(
            &key,
            [
                ("trigger_event".to_owned(), event_name.to_owned()),
                ("execution_time".to_owned(), Utc::now().to_rfc3339()),
            ]
            .into_iter()
            .collect(),
            None,
        );
    }

    fn mark_stage(&self, stage: &str, field: &str, value: String) {
        let key = format!("manager.{}.{stage}", self.config.id);
        self.registry
            .state()
            .merge_mark(&key, [(field.to_owned(), value)].into_iter().collect());
    }

    // ----- PENDING -> SCHEDULED --------------------------------------------

    /// One scheduling tick over all resource groups. Lock contention means
    /// a peer manager is already scanning; the tick is silently abandoned.
    pub async fn schedule(&self, event_name: &str) -> Result<()> {
        debug!(event_name, "schedule(): triggered");
        self.mark_stage_start("schedule", event_name);
        let ctx = self.scheduling_context();
        let Some(_guard) = self
            .lock_factory
            .try_acquire(LockId::Schedule, self.config.schedule_lock_lifetime())
            .await
        else {
            debug!("schedule(): lock contended, skipping this tick");
            return Ok(());
        };
        for group_name in self.registry.repository().schedulable_resource_groups().await {
            if let Err(err) = self.schedule_resource_group(&ctx, &group_name).await {
                error!(resource_group = %group_name, %err, "scheduling error");
            }
            self.mark_stage("schedule", "resource_group", group_name);
        }
        self.mark_stage("schedule", "finish_time", Utc::now().to_rfc3339());
        Ok(())
    }

    async fn schedule_resource_group(
        &self,
        ctx: &SchedulingContext,
        group_name: &str,
    ) -> Result<()> {
        let repository = self.registry.repository().clone();
        let group = repository.get_resource_group(group_name).await?;
        let mut scheduler = load_scheduler(&group.scheduler, &group.opts.config)?;
        let (existing, pending, timed_out) = repository
            .list_managed_sessions(
                group_name,
                Duration::from_secs(group.opts.pending_timeout_secs),
            )
            .await;
        self.flush_cancelled_sessions(&timed_out).await;
        let (current_priority, mut pending) = prioritize(pending);
        debug!(
            resource_group = group_name,
            pending = pending.len(),
            priority = current_priority,
            existing = existing.len(),
            cancelled = timed_out.len(),
            "running scheduler"
        );

        let mut num_scheduled = 0usize;
        while !pending.is_empty() {
            let candidate_agents = repository.schedulable_agents(group_name).await;
            let total_capacity =
                ResourceSlot::sum(candidate_agents.iter().map(|a| &a.available_slots));
            let Some(picked) =
                scheduler.pick_session(&total_capacity, &pending, &existing)
            else {
                break;
            };
            let Some(index) = pending.iter().position(|s| s.id == picked) else {
                return Err(SchedulingError::internal(format!(
                    "scheduler picked session {picked} which is not pending"
                )));
            };
            let session = pending.remove(index);
            let kernels = repository.kernels_of_session(session.id).await;
            debug!(
                session = %session.id,
                session_type = %session.session_type,
                cluster_mode = ?session.cluster_mode,
                access_key = %session.access_key,
                "try-scheduling"
            );

            if !self.interpret_predicates(ctx, &session).await? {
                continue;
            }

            let selector = self.build_group_selector(ctx, &group, &session).await;
            let outcome = match session.cluster_mode {
                gridmesh_common::ClusterMode::SingleNode => {
                    self.schedule_single_node_session(
                        group_name,
                        selector.as_ref(),
                        &candidate_agents,
                        &session,
                        &kernels,
                    )
                    .await
                }
                gridmesh_common::ClusterMode::MultiNode => {
                    self.schedule_multi_node_session(
                        group_name,
                        selector.as_ref(),
                        candidate_agents,
                        &session,
                        &kernels,
                    )
                    .await
                }
            };
            match outcome {
                Ok(()) => {
                    scheduler.update_allocation(&session);
                    num_scheduled += 1;
                }
                Err(SchedulingError::InstanceNotAvailable { reason }) => {
                    debug!(session = %session.id, reason, "no available instances");
                    continue;
                }
                Err(SchedulingError::BadRequest { message }) => {
                    debug!(session = %session.id, message, "bad request");
                    continue;
                }
                Err(err) => {
                    warn!(session = %session.id, %err, "unexpected scheduling failure");
                    continue;
                }
            }
        }
        if num_scheduled > 0 {
            self.registry
                .events()
                .produce(SchedulingEvent::DoCheckPrecond);
        }
        Ok(())
    }

    async fn build_group_selector(
        &self,
        ctx: &SchedulingContext,
        group: &crate::models::ResourceGroupRow,
        session: &SessionRow,
    ) -> Arc<dyn AgentSelector> {
        // Inference replicas of one endpoint are spread even under the
        // concentrated strategy when the group opts into it.
        let endpoint_kernel_counts = match (&session.endpoint_id, session.session_type) {
            (Some(endpoint_id), SessionType::Inference)
                if group.opts.enforce_spreading_endpoint_replica
                    && group.opts.agent_selection_strategy
                        == AgentSelectionStrategy::Concentrated =>
            {
                Some(
                    self.registry
                        .repository()
                        .kernel_counts_at_endpoint(endpoint_id)
                        .await,
                )
            }
            _ => None,
        };
        build_selector(
            group.opts.agent_selection_strategy,
            ctx,
            &group.name,
            self.registry.state().clone(),
            endpoint_kernel_counts,
        )
    }

    /// Run all predicates, record results, and decide whether to go on to
    /// agent assignment. Returns `Ok(true)` when every predicate passed.
    async fn interpret_predicates(
        &self,
        ctx: &SchedulingContext,
        session: &SessionRow,
    ) -> Result<bool> {
        let check_results = self.check_predicates(ctx, session).await;
        let mut failed = Vec::new();
        let mut passed = Vec::new();
        let mut any_permanent = false;
        for (name, result) in check_results {
            match result {
                Ok(outcome) if outcome.passed => passed.push(json!({"name": name})),
                Ok(outcome) => {
                    any_permanent |= outcome.permanent;
                    failed.push(json!({
                        "name": name,
                        "msg": outcome.message.unwrap_or_default(),
                    }));
                }
                Err(err) => {
                    // A predicate error counts as a failed predicate; it
                    // must not abort the tick.
                    warn!(session = %session.id, predicate = name, %err, "predicate error");
                    failed.push(json!({"name": name, "msg": err.to_string()}));
                }
            }
        }
        let repository = self.registry.repository();
        if failed.is_empty() {
            repository
                .update_session_status_data(session.id, json!(passed))
                .await?;
            return Ok(true);
        }
        // The concurrency predicate has already incremented the shared
        // counter; re-derive it so a failed attempt leaves no residue.
        self.registry
            .recalc_concurrency_used(&session.access_key)
            .await?;
        if any_permanent {
            info!(session = %session.id, "predicate failure is permanent, cancelling");
            repository
                .update_session_predicate_failure(session.id, json!(failed), json!(passed))
                .await?;
            repository
                .apply_cancellation(&[session.id], reasons::PREDICATE_CHECKS_FAILED)
                .await;
            self.registry
                .events()
                .produce(SchedulingEvent::SessionCancelled {
                    session_id: session.id,
                    creation_id: session.creation_id.clone(),
                    reason: reasons::PREDICATE_CHECKS_FAILED.to_owned(),
                });
        } else {
            debug!(session = %session.id, "predicate checks failed (temporary)");
            repository
                .update_session_predicate_failure(session.id, json!(failed), json!(passed))
                .await?;
        }
        Ok(false)
    }

    /// Evaluate every predicate in order without short-circuiting, so the
    /// recorded status data lists all failing reasons at once.
    async fn check_predicates(
        &self,
        ctx: &SchedulingContext,
        session: &SessionRow,
    ) -> Vec<(&'static str, Result<PredicateResult>)> {
        let registry = self.registry.as_ref();
        vec![
            (
                "reserved_time",
                predicates::check_reserved_batch_session(registry, ctx, session).await,
            ),
            (
                "dependencies",
                predicates::check_dependencies(registry, ctx, session).await,
            ),
            (
                "concurrency",
                predicates::check_concurrency(registry, ctx, session).await,
            ),
            (
                "pending_session_resource_limit",
                predicates::check_pending_session_resource_limit(registry, ctx, session).await,
            ),
            (
                "pending_session_count_limit",
                predicates::check_pending_session_count_limit(registry, ctx, session).await,
            ),
            (
                "keypair_resource_limit",
                predicates::check_keypair_resource_limit(registry, ctx, session).await,
            ),
            (
                "user_resource_limit",
                predicates::check_user_resource_limit(registry, ctx, session).await,
            ),
            (
                "user_group_resource_limit",
                predicates::check_group_resource_limit(registry, ctx, session).await,
            ),
            (
                "domain_resource_limit",
                predicates::check_domain_resource_limit(registry, ctx, session).await,
            ),
            (
                "scaling_group",
                predicates::check_resource_group(registry, ctx, session).await,
            ),
        ]
    }

    fn filter_compatible<'a>(
        candidate_agents: &'a [AgentRow],
        architecture: &str,
        container_counts: &BTreeMap<AgentId, usize>,
        max_container_count: Option<u32>,
    ) -> Result<Vec<AgentRow>> {
        if candidate_agents.is_empty() {
            return Err(SchedulingError::instance_not_available(
                "no agents are available for scheduling",
            ));
        }
        let compatible: Vec<&'a AgentRow> = candidate_agents
            .iter()
            .filter(|a| a.architecture == architecture)
            .collect();
        if compatible.is_empty() {
            return Err(SchedulingError::instance_not_available(format!(
                "no agents found to be compatible with the image architecture ({architecture})"
            )));
        }
        let available: Vec<AgentRow> = match max_container_count {
            Some(limit) => compatible
                .into_iter()
                .filter(|a| {
                    container_counts.get(&a.id).copied().unwrap_or(0) < limit as usize
                })
                .cloned()
                .collect(),
            None => compatible.into_iter().cloned().collect(),
        };
        if available.is_empty() {
            return Err(SchedulingError::instance_not_available(
                "all agents have reached the hard limit of the number of containers",
            ));
        }
        Ok(available)
    }

    /// Single-node: one agent hosts the whole session; sub-kernels slice
    /// its reservation.
    async fn schedule_single_node_session(
        &self,
        group_name: &str,
        selector: &dyn AgentSelector,
        candidate_agents: &[AgentRow],
        session: &SessionRow,
        kernels: &[KernelRow],
    ) -> Result<()> {
        let repository = self.registry.repository().clone();
        let attempt = async {
            let architecture = requested_architecture(kernels)?;
            let container_counts = repository.container_counts().await;
            let available = Self::filter_compatible(
                candidate_agents,
                &architecture,
                &container_counts,
                self.config.max_container_count,
            )?;
            let agent_id = match &session.designated_agent {
                Some(designated) => {
                    // Manual assignment by an admin: only verify capacity.
                    let (available_slots, occupied_slots) =
                        repository.agent_slots(designated).await?;
                    let remaining = available_slots - occupied_slots;
                    if !remaining.covers(&session.requested_slots) {
                        return Err(SchedulingError::instance_not_available(format!(
                            "the designated agent ({designated}) does not have enough \
                             remaining capacity"
                        )));
                    }
                    designated.clone()
                }
                None => selector
                    .assign_for_session(&available, session, kernels)
                    .await?
                    .ok_or_else(|| {
                        SchedulingError::instance_not_available(format!(
                            "could not find a contiguous resource region in any agent big \
                             enough to host the session (id: {}, resource group: {group_name})",
                            session.id
                        ))
                    })?,
            };
            repository
                .reserve_agent(group_name, &agent_id, &session.requested_slots)
                .await
        };
        let alloc = match attempt.await {
            Ok(alloc) => alloc,
            Err(err) => {
                self.record_assignment_failure(session, None, &err).await;
                return Err(err);
            }
        };
        repository
            .finalize_single_node_session(session.id, &alloc)
            .await?;
        self.registry
            .events()
            .produce(SchedulingEvent::SessionScheduled {
                session_id: session.id,
                creation_id: session.creation_id.clone(),
            });
        Ok(())
    }

    /// Multi-node: place each kernel independently, reloading agent
    /// capacities between picks. Any kernel without a home rolls back every
    /// reservation already made for this session.
    async fn schedule_multi_node_session(
        &self,
        group_name: &str,
        selector: &dyn AgentSelector,
        mut candidate_agents: Vec<AgentRow>,
        session: &SessionRow,
        kernels: &[KernelRow],
    ) -> Result<()> {
        let repository = self.registry.repository().clone();
        let mut bindings: Vec<KernelAgentBinding> = Vec::with_capacity(kernels.len());
        let mut reserved: Vec<(AgentId, ResourceSlot)> = Vec::new();
        for kernel in kernels {
            let attempt = async {
                let container_counts = repository.container_counts().await;
                let available = Self::filter_compatible(
                    &candidate_agents,
                    &kernel.architecture,
                    &container_counts,
                    self.config.max_container_count,
                )?;
                let agent_id = match &kernel.agent {
                    Some(pinned) => {
                        let (available_slots, occupied_slots) =
                            repository.agent_slots(pinned).await?;
                        let remaining = available_slots - occupied_slots;
                        if !remaining.covers(&kernel.requested_slots) {
                            return Err(SchedulingError::instance_not_available(format!(
                                "the designated agent ({pinned}) does not have enough \
                                 remaining capacity"
                            )));
                        }
                        pinned.clone()
                    }
                    None => selector
                        .assign_for_kernel(&available, kernel)
                        .await?
                        .ok_or_else(|| {
                            SchedulingError::instance_not_available(format!(
                                "could not find a contiguous resource region in any agent \
                                 big enough to host a kernel of the session (id: {}, \
                                 resource group: {group_name})",
                                session.id
                            ))
                        })?,
                };
                repository
                    .reserve_agent(group_name, &agent_id, &kernel.requested_slots)
                    .await
            };
            match attempt.await {
                Ok(alloc) => {
                    reserved.push((alloc.agent_id.clone(), kernel.requested_slots.clone()));
                    bindings.push(KernelAgentBinding {
                        kernel_id: kernel.id,
                        agent: alloc,
                    });
                    // Reload capacities so the next kernel sees this
                    // reservation.
                    candidate_agents = repository.schedulable_agents(group_name).await;
                }
                Err(err) => {
                    for (agent_id, slots) in reserved.iter().rev() {
                        if let Err(rollback_err) =
                            repository.unreserve_agent(agent_id, slots).await
                        {
                            error!(
                                agent = %agent_id,
                                %rollback_err,
                                "failed to roll back reservation"
                            );
                        }
                    }
                    self.record_assignment_failure(session, Some(kernel.id), &err)
                        .await;
                    return Err(err);
                }
            }
        }
        repository
            .finalize_multi_node_session(session.id, &bindings)
            .await?;
        self.registry
            .events()
            .produce(SchedulingEvent::SessionScheduled {
                session_id: session.id,
                creation_id: session.creation_id.clone(),
            });
        Ok(())
    }

    /// Book-keeping shared by both cluster modes when agent assignment
    /// fails: the session stays PENDING with the reason recorded, and the
    /// concurrency counter increment from the predicate phase is undone.
    async fn record_assignment_failure(
        &self,
        session: &SessionRow,
        kernel_id: Option<KernelId>,
        err: &SchedulingError,
    ) {
        let repository = self.registry.repository();
        let update = match err {
            SchedulingError::InstanceNotAvailable { reason } => match kernel_id {
                Some(kernel_id) => {
                    repository
                        .update_kernel_scheduling_failure(session.id, kernel_id, reason)
                        .await
                }
                None => {
                    repository
                        .update_session_scheduling_failure(session.id, reason)
                        .await
                }
            },
            other => {
                repository
                    .update_session_generic_failure(session.id, other.to_status_data())
                    .await
            }
        };
        if let Err(update_err) = update {
            error!(session = %session.id, %update_err, "failed to record scheduling failure");
        }
        if let Err(recalc_err) = self
            .registry
            .recalc_concurrency_used(&session.access_key)
            .await
        {
            error!(session = %session.id, %recalc_err, "failed to roll back concurrency");
        }
    }

    async fn flush_cancelled_sessions(&self, timed_out: &[SessionRow]) {
        if timed_out.is_empty() {
            return;
        }
        let session_ids: Vec<SessionId> = timed_out.iter().map(|s| s.id).collect();
        self.registry
            .repository()
            .apply_cancellation(&session_ids, reasons::PENDING_TIMEOUT)
            .await;
        for session in timed_out {
            info!(session = %session.id, "cancelled by pending timeout");
            self.registry
                .events()
                .produce(SchedulingEvent::SessionCancelled {
                    session_id: session.id,
                    creation_id: session.creation_id.clone(),
                    reason: reasons::PENDING_TIMEOUT.to_owned(),
                });
        }
    }

    // ----- SCHEDULED -> PREPARING ------------------------------------------

    /// Move SCHEDULED sessions to PREPARING and kick image checks on their
    /// agents. Pull-progress events drive the PREPARING -> PREPARED leg
    /// externally.
    pub async fn check_precond(&self, event_name: &str) -> Result<()> {
        self.mark_stage_start("check_precondition", event_name);
        let Some(_guard) = self
            .lock_factory
            .try_acquire(
                LockId::CheckPrecond,
                self.config.check_precond_lock_lifetime(),
            )
            .await
        else {
            debug!("check_precond(): lock contended, skipping");
            return Ok(());
        };
        let sessions = self
            .registry
            .repository()
            .transit_scheduled_to_preparing()
            .await;
        debug!(count = sessions.len(), "checking preconditions");
        for (session, kernels) in sessions {
            self.registry
                .events()
                .produce(SchedulingEvent::SessionPreparing {
                    session_id: session.id,
                    creation_id: session.creation_id.clone(),
                });
            for kernel in kernels {
                let Some(agent) = binding_of(&kernel) else {
                    continue;
                };
                // A kernel that already carries a persisted allocation is
                // being re-driven after a restart; replay it into the
                // agent's rebuilt map before touching the agent again.
                if let Some(spec) = &kernel.resource_spec {
                    if let Err(err) = self
                        .registry
                        .replay_kernel_allocation(&agent.agent_id, kernel.id, spec)
                        .await
                    {
                        error!(kernel = %kernel.id, %err, "failed to replay persisted allocation");
                        continue;
                    }
                }
                if let Err(err) = self
                    .agent_client
                    .check_and_pull_image(&agent, &kernel.image, &kernel.architecture)
                    .await
                {
                    warn!(kernel = %kernel.id, %err, "image check failed");
                }
            }
        }
        self.mark_stage("check_precondition", "finish_time", Utc::now().to_rfc3339());
        Ok(())
    }

    // ----- PREPARED -> CREATING -> RUNNING ---------------------------------

    /// Move PREPARED sessions to CREATING and issue container creation.
    pub async fn start(&self, event_name: &str) -> Result<()> {
        self.mark_stage_start("start", event_name);
        let Some(_guard) = self
            .lock_factory
            .try_acquire(LockId::Start, self.config.start_lock_lifetime())
            .await
        else {
            debug!("start(): lock contended, skipping");
            return Ok(());
        };
        let sessions = self
            .registry
            .repository()
            .mark_sessions_and_kernels_creating()
            .await;
        debug!(count = sessions.len(), "starting sessions");
        for (session, kernels) in sessions {
            let started = tokio::time::timeout(
                self.config.start_session_timeout(),
                self.start_session(&session, &kernels),
            )
            .await;
            match started {
                Ok(Ok(())) => {
                    info!(session = %session.id, "session started");
                }
                Ok(Err(err)) => {
                    warn!(session = %session.id, %err, "failed to start session");
                    self.cleanup_start_failure(&session, &kernels, &err).await;
                }
                Err(_elapsed) => {
                    warn!(session = %session.id, "timeout while starting session");
                    let err = SchedulingError::agent("session start timed out");
                    self.cleanup_start_failure(&session, &kernels, &err).await;
                }
            }
        }
        self.mark_stage("start", "finish_time", Utc::now().to_rfc3339());
        Ok(())
    }

    async fn start_session(&self, session: &SessionRow, kernels: &[KernelRow]) -> Result<()> {
        let repository = self.registry.repository().clone();
        let mut bindings = Vec::with_capacity(kernels.len());
        let mut requested: BTreeMap<KernelId, ResourceSlot> = BTreeMap::new();
        let mut actual: BTreeMap<KernelId, ResourceSlot> = BTreeMap::new();

        // Group creation calls per agent so one RPC creates all kernels
        // landing there.
        let mut per_agent: BTreeMap<AgentId, (AgentAllocationContext, Vec<KernelRow>)> =
            BTreeMap::new();
        for kernel in kernels {
            let agent = binding_of(kernel).ok_or_else(|| {
                SchedulingError::internal(format!("kernel {} has no agent binding", kernel.id))
            })?;
            requested.insert(kernel.id, kernel.requested_slots.clone());
            bindings.push(KernelAgentBinding {
                kernel_id: kernel.id,
                agent: agent.clone(),
            });
            per_agent
                .entry(agent.agent_id.clone())
                .or_insert_with(|| (agent, Vec::new()))
                .1
                .push(kernel.clone());
        }
        for (agent_id, (agent, agent_kernels)) in per_agent {
            debug!(agent = %agent_id, kernels = agent_kernels.len(), "creating kernels");
            let results = self
                .agent_client
                .create_kernels(&agent, session.id, &agent_kernels)
                .await?;
            for result in results {
                actual.insert(result.kernel_id, result.actual_allocations.clone());
                repository
                    .kernel_started(
                        result.kernel_id,
                        &result.container_id,
                        result.actual_allocations,
                        None,
                    )
                    .await?;
            }
        }
        self.registry
            .settle_agent_alloc(&bindings, &requested, &actual)
            .await?;
        self.registry
            .events()
            .produce(SchedulingEvent::SessionStarted {
                session_id: session.id,
                creation_id: session.creation_id.clone(),
            });
        Ok(())
    }

    /// Creation failed: cancel all session kernels, destroy whatever was
    /// created, and repair occupancy with a full scan.
    async fn cleanup_start_failure(
        &self,
        session: &SessionRow,
        kernels: &[KernelRow],
        err: &SchedulingError,
    ) {
        let repository = self.registry.repository();
        if let Err(mark_err) = repository
            .mark_session_cancelled(session.id, err.to_status_data(), reasons::FAILED_TO_START)
            .await
        {
            error!(session = %session.id, %mark_err, "failed to mark session cancelled");
        }
        self.registry
            .events()
            .produce(SchedulingEvent::SessionCancelled {
                session_id: session.id,
                creation_id: session.creation_id.clone(),
                reason: reasons::FAILED_TO_START.to_owned(),
            });
        for kernel in kernels {
            if let Some(agent) = binding_of(kernel) {
                if let Err(destroy_err) = self
                    .agent_client
                    .destroy_kernel(&agent, kernel.id, reasons::FAILED_TO_START)
                    .await
                {
                    warn!(kernel = %kernel.id, %destroy_err, "failed to destroy kernel");
                }
            }
        }
        if let Err(recalc_err) = self.registry.recalc_resource_usage(true).await {
            error!(%recalc_err, "failed to recalculate after start failure");
        }
    }

    // ----- cancellation ----------------------------------------------------

    /// Cancel a session in any pre-RUNNING state. Kernels already bound to
    /// agents get destroy RPCs, and occupancy is re-derived so their
    /// reservations are released.
    pub async fn cancel_session(&self, session_id: SessionId, reason: &str) -> Result<()> {
        let repository = self.registry.repository().clone();
        let session = repository.get_session(session_id).await?;
        if session.status == crate::models::SessionStatus::Running
            || session.status.is_terminal()
        {
            return Err(SchedulingError::bad_request(format!(
                "session {session_id} is {} and cannot be cancelled here",
                session.status
            )));
        }
        let kernels = repository.kernels_of_session(session_id).await;
        repository.apply_cancellation(&[session_id], reason).await;
        for kernel in &kernels {
            if let Some(agent) = binding_of(kernel) {
                if let Err(err) = self
                    .agent_client
                    .destroy_kernel(&agent, kernel.id, reason)
                    .await
                {
                    warn!(kernel = %kernel.id, %err, "failed to destroy kernel");
                }
                self.registry
                    .events()
                    .produce(SchedulingEvent::KernelCancelled {
                        kernel_id: kernel.id,
                        reason: reason.to_owned(),
                    });
            }
        }
        self.registry.recalc_resource_usage(true).await?;
        self.registry
            .events()
            .produce(SchedulingEvent::SessionCancelled {
                session_id,
                creation_id: session.creation_id.clone(),
                reason: reason.to_owned(),
            });
        Ok(())
    }

    // ----- timers ----------------------------------------------------------

    /// Periodic driver: runs the stage pipeline on the schedule interval
    /// and reacts to `Do*` events produced by the stages themselves.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.schedule_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events = self.registry.events().subscribe();
        info!(
            interval_secs = self.config.schedule_interval_secs,
            "scheduler dispatcher running"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler dispatcher shutting down");
                    return;
                }
                _ = tick.tick() => {
                    if let Err(err) = self.schedule("schedule-timer").await {
                        error!(%err, "schedule tick failed");
                    }
                    if let Err(err) = self.check_precond("precond-timer").await {
                        error!(%err, "check-precond tick failed");
                    }
                    if let Err(err) = self.start("start-timer").await {
                        error!(%err, "start tick failed");
                    }
                    if let Err(err) = self
                        .registry
                        .sweep_lost_agents(self.config.heartbeat_timeout())
                        .await
                    {
                        error!(%err, "liveness sweep failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(SchedulingEvent::DoSchedule) => {
                        if let Err(err) = self.schedule("do-schedule").await {
                            error!(%err, "schedule failed");
                        }
                    }
                    Ok(SchedulingEvent::DoCheckPrecond) => {
                        if let Err(err) = self.check_precond("do-check-precond").await {
                            error!(%err, "check-precond failed");
                        }
                        if let Err(err) = self.start("do-start-session").await {
                            error!(%err, "start failed");
                        }
                    }
                    Ok(SchedulingEvent::DoStartSession) => {
                        if let Err(err) = self.start("do-start-session").await {
                            error!(%err, "start failed");
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {}
                },
            }
        }
    }
}

fn binding_of(kernel: &KernelRow) -> Option<AgentAllocationContext> {
    Some(AgentAllocationContext {
        agent_id: kernel.agent.clone()?,
        agent_addr: kernel.agent_addr.clone().unwrap_or_default(),
        resource_group: kernel.resource_group.clone(),
    })
}
