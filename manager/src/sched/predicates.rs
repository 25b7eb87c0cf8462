//! Admission predicates evaluated before agent assignment.
//!
//! Every predicate runs even after one fails, so `status_data` carries the
//! complete pass/fail picture for the user. A failed non-permanent
//! predicate keeps the session PENDING for a later tick; a permanent one
//! cancels it. The concurrency predicate mutates the shared counter
//! atomically; the dispatcher compensates when a later predicate fails.

use crate::error::Result;
use crate::models::{SessionRow, SessionStatus};
use crate::registry::AgentRegistry;
use crate::sched::SchedulingContext;
use chrono::Utc;
use gridmesh_common::{
    DefaultForUnspecified, ResourceSlot, SessionType, SlotName, SlotTypes,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateResult {
    pub passed: bool,
    pub message: Option<String>,
    /// Permanent failures cancel the session instead of retrying it.
    pub permanent: bool,
}

impl PredicateResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: None,
            permanent: false,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
            permanent: false,
        }
    }

    pub fn fail_permanent(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
            permanent: true,
        }
    }
}

/// Batch sessions may carry a reserved start time; they wait until then.
pub async fn check_reserved_batch_session(
    _registry: &AgentRegistry,
    _ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    if session.session_type == SessionType::Batch {
        if let Some(starts_at) = session.starts_at {
            if Utc::now() < starts_at {
                return Ok(PredicateResult::fail("before start time"));
            }
        }
    }
    Ok(PredicateResult::pass())
}

/// All predecessor sessions must have finished successfully.
pub async fn check_dependencies(
    registry: &AgentRegistry,
    _ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    let mut waiting = Vec::new();
    for dep_id in &session.dependencies {
        match registry.repository().get_session(*dep_id).await {
            Ok(dep) if dep.status == SessionStatus::Terminated => {}
            Ok(dep) => waiting.push(format!("{} ({})", dep.name, dep.id)),
            Err(_) => waiting.push(dep_id.to_string()),
        }
    }
    if waiting.is_empty() {
        Ok(PredicateResult::pass())
    } else {
        Ok(PredicateResult::fail(format!(
            "waiting for dependency sessions to finish as success ({})",
            waiting.join(", ")
        )))
    }
}

/// Atomic compare-and-increment against the keypair's concurrency cap.
pub async fn check_concurrency(
    registry: &AgentRegistry,
    _ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    let policy = registry
        .repository()
        .keypair_policy(&session.access_key)
        .await?;
    let key = crate::statestore::keypair_concurrency_key(&session.access_key);
    let (allowed, used) = registry
        .state()
        .check_and_increment(&key, i64::from(policy.max_concurrent_sessions));
    debug!(
        access_key = %session.access_key,
        used,
        limit = policy.max_concurrent_sessions,
        "concurrency check"
    );
    if !allowed {
        return Ok(PredicateResult::fail(format!(
            "you cannot run more than {} concurrent sessions",
            policy.max_concurrent_sessions
        )));
    }
    Ok(PredicateResult::pass())
}

fn limit_from(
    limits: &BTreeMap<SlotName, Decimal>,
    known_slot_types: &BTreeMap<SlotName, SlotTypes>,
    default_for_unspecified: DefaultForUnspecified,
) -> ResourceSlot {
    ResourceSlot::from_policy(limits, known_slot_types, default_for_unspecified)
}

fn check_quota(
    scope: &str,
    occupied: ResourceSlot,
    requested: &ResourceSlot,
    allowed: &ResourceSlot,
    known_slot_types: &BTreeMap<SlotName, SlotTypes>,
) -> PredicateResult {
    if allowed.covers(&(occupied + requested.clone())) {
        PredicateResult::pass()
    } else {
        PredicateResult::fail(format!(
            "your {scope} resource quota is exceeded ({})",
            allowed.humanize(known_slot_types)
        ))
    }
}

pub async fn check_keypair_resource_limit(
    registry: &AgentRegistry,
    ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    let policy = registry
        .repository()
        .keypair_policy(&session.access_key)
        .await?;
    let allowed = limit_from(
        &policy.total_resource_slots,
        &ctx.known_slot_types,
        policy.default_for_unspecified,
    );
    let occupied = registry.keypair_occupancy(&session.access_key).await;
    Ok(check_quota(
        "keypair",
        occupied,
        &session.requested_slots,
        &allowed,
        &ctx.known_slot_types,
    ))
}

pub async fn check_user_resource_limit(
    registry: &AgentRegistry,
    ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    let Some(user) = registry.repository().get_user(&session.user_id).await else {
        return Ok(PredicateResult::pass());
    };
    let Some(limits) = user.total_resource_slots else {
        return Ok(PredicateResult::pass());
    };
    let allowed = limit_from(
        &limits,
        &ctx.known_slot_types,
        DefaultForUnspecified::Unlimited,
    );
    let occupied = registry.user_occupancy(&session.user_id).await;
    Ok(check_quota(
        "user",
        occupied,
        &session.requested_slots,
        &allowed,
        &ctx.known_slot_types,
    ))
}

pub async fn check_group_resource_limit(
    registry: &AgentRegistry,
    ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    let Some(group) = registry.repository().get_group(&session.group_id).await else {
        return Ok(PredicateResult::pass());
    };
    let Some(limits) = group.total_resource_slots else {
        return Ok(PredicateResult::pass());
    };
    let allowed = limit_from(
        &limits,
        &ctx.known_slot_types,
        DefaultForUnspecified::Unlimited,
    );
    let occupied = registry.group_occupancy(&session.group_id).await;
    Ok(check_quota(
        "group",
        occupied,
        &session.requested_slots,
        &allowed,
        &ctx.known_slot_types,
    ))
}

pub async fn check_domain_resource_limit(
    registry: &AgentRegistry,
    ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    let Some(domain) = registry.repository().get_domain(&session.domain_name).await else {
        return Ok(PredicateResult::pass());
    };
    let Some(limits) = domain.total_resource_slots else {
        return Ok(PredicateResult::pass());
    };
    let allowed = limit_from(
        &limits,
        &ctx.known_slot_types,
        DefaultForUnspecified::Unlimited,
    );
    let occupied = registry.domain_occupancy(&session.domain_name).await;
    Ok(check_quota(
        "domain",
        occupied,
        &session.requested_slots,
        &allowed,
        &ctx.known_slot_types,
    ))
}

/// The keypair's PENDING backlog (including this session) must stay below
/// the configured count cap.
pub async fn check_pending_session_count_limit(
    registry: &AgentRegistry,
    _ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    let policy = registry
        .repository()
        .keypair_policy(&session.access_key)
        .await?;
    let Some(max_count) = policy.max_pending_session_count else {
        return Ok(PredicateResult::pass());
    };
    let pending = registry
        .repository()
        .sessions_snapshot()
        .await
        .into_iter()
        .filter(|s| s.access_key == session.access_key && s.status == SessionStatus::Pending)
        .count();
    if pending as u64 <= u64::from(max_count) {
        Ok(PredicateResult::pass())
    } else {
        Ok(PredicateResult::fail(format!(
            "you cannot have more than {max_count} pending sessions"
        )))
    }
}

/// The summed slot request of the keypair's PENDING backlog must stay
/// within the configured resource cap.
pub async fn check_pending_session_resource_limit(
    registry: &AgentRegistry,
    ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    let policy = registry
        .repository()
        .keypair_policy(&session.access_key)
        .await?;
    let Some(limit) = policy.max_pending_session_resource_slots else {
        return Ok(PredicateResult::pass());
    };
    let mut pending_total = ResourceSlot::new();
    for s in registry.repository().sessions_snapshot().await {
        if s.access_key == session.access_key && s.status == SessionStatus::Pending {
            pending_total += s.requested_slots.clone();
        }
    }
    if limit.covers(&pending_total) {
        Ok(PredicateResult::pass())
    } else {
        Ok(PredicateResult::fail(format!(
            "your pending session resource quota is exceeded ({})",
            limit.humanize(&ctx.known_slot_types)
        )))
    }
}

/// The session's resource group must be in the keypair's allowed list (an
/// empty list allows all) and must accept the session's type. Failures
/// here are permanent: retrying cannot fix them.
pub async fn check_resource_group(
    registry: &AgentRegistry,
    _ctx: &SchedulingContext,
    session: &SessionRow,
) -> Result<PredicateResult> {
    let policy = registry
        .repository()
        .keypair_policy(&session.access_key)
        .await?;
    if !policy.allowed_resource_groups.is_empty()
        && !policy
            .allowed_resource_groups
            .contains(&session.resource_group)
    {
        return Ok(PredicateResult::fail_permanent(format!(
            "you do not have access to the resource group '{}'",
            session.resource_group
        )));
    }
    let group = registry
        .repository()
        .get_resource_group(&session.resource_group)
        .await?;
    if !group.opts.allowed_session_types.contains(&session.session_type) {
        return Ok(PredicateResult::fail_permanent(format!(
            "the resource group '{}' does not accept the session type '{}'",
            session.resource_group, session.session_type
        )));
    }
    Ok(PredicateResult::pass())
}
