//! Queueing policies: which pending session gets the next scheduling
//! attempt.

use crate::error::{Result, SchedulingError};
use crate::models::SessionRow;
use gridmesh_common::{AccessKey, ResourceSlot, SessionId};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

/// A queueing policy. `pick_session` is consulted repeatedly within one
/// scheduling pass; stateful policies update their bookkeeping through
/// `update_allocation` after each successful schedule.
pub trait Scheduler: Send {
    fn pick_session(
        &mut self,
        total_capacity: &ResourceSlot,
        pending_sessions: &[SessionRow],
        existing_sessions: &[SessionRow],
    ) -> Option<SessionId>;

    /// Called after a session it picked was successfully scheduled.
    fn update_allocation(&mut self, _scheduled_session: &SessionRow) {}
}

/// Narrow the pending set to its highest priority band. Policies then order
/// within the band.
pub fn prioritize(pending_sessions: Vec<SessionRow>) -> (i32, Vec<SessionRow>) {
    let top = pending_sessions.iter().map(|s| s.priority).max().unwrap_or(0);
    let band = pending_sessions
        .into_iter()
        .filter(|s| s.priority == top)
        .collect();
    (top, band)
}

/// Tagged-variant registry of the built-in policies.
pub fn load_scheduler(name: &str, config: &serde_json::Value) -> Result<Box<dyn Scheduler>> {
    match name {
        "fifo" => {
            let num_retries_to_skip = config
                .get("num_retries_to_skip")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Ok(Box::new(FifoScheduler {
                num_retries_to_skip,
            }))
        }
        "lifo" => Ok(Box::new(LifoScheduler)),
        "drf" => Ok(Box::new(DrfScheduler::default())),
        "mof" => Ok(Box::new(MofScheduler)),
        "priority" => Ok(Box::new(PriorityScheduler)),
        other => Err(SchedulingError::UnknownScheduler {
            name: other.to_owned(),
        }),
    }
}

/// Oldest first. Sessions that have failed scheduling too many times are
/// skipped so one stuck session cannot head-of-line block the queue, unless
/// every candidate would be skipped.
pub struct FifoScheduler {
    num_retries_to_skip: u64,
}

impl Scheduler for FifoScheduler {
    fn pick_session(
        &mut self,
        _total_capacity: &ResourceSlot,
        pending_sessions: &[SessionRow],
        _existing_sessions: &[SessionRow],
    ) -> Option<SessionId> {
        let mut skipped = Vec::new();
        for session in pending_sessions {
            if self.num_retries_to_skip > 0
                && session.scheduler_retries() >= self.num_retries_to_skip
            {
                skipped.push(session.id);
                continue;
            }
            return Some(session.id);
        }
        skipped.first().copied()
    }
}

/// Newest first.
pub struct LifoScheduler;

impl Scheduler for LifoScheduler {
    fn pick_session(
        &mut self,
        _total_capacity: &ResourceSlot,
        pending_sessions: &[SessionRow],
        _existing_sessions: &[SessionRow],
    ) -> Option<SessionId> {
        pending_sessions.last().map(|s| s.id)
    }
}

/// Dominant Resource Fairness: pick the first pending session of the user
/// whose dominant share (max over slots of occupied/capacity) is lowest.
#[derive(Default)]
pub struct DrfScheduler {
    per_user_dominant_share: BTreeMap<AccessKey, Decimal>,
    total_capacity: ResourceSlot,
}

impl DrfScheduler {
    fn dominant_share(total_capacity: &ResourceSlot, slots: &ResourceSlot) -> Decimal {
        let mut dominant = Decimal::ZERO;
        for (slot, value) in slots.iter() {
            let capacity = total_capacity.get(slot);
            if capacity == Decimal::ZERO {
                continue;
            }
            let share = *value / capacity;
            if share > dominant {
                dominant = share;
            }
        }
        dominant
    }
}

impl Scheduler for DrfScheduler {
    fn pick_session(
        &mut self,
        total_capacity: &ResourceSlot,
        pending_sessions: &[SessionRow],
        existing_sessions: &[SessionRow],
    ) -> Option<SessionId> {
        self.total_capacity = total_capacity.clone();
        for existing in existing_sessions {
            let share = Self::dominant_share(total_capacity, &existing.occupying_slots);
            let entry = self
                .per_user_dominant_share
                .entry(existing.access_key.clone())
                .or_insert(Decimal::ZERO);
            if *entry < share {
                *entry = share;
            }
        }
        debug!(shares = ?self.per_user_dominant_share, "per-user dominant shares");

        let mut users: Vec<AccessKey> = pending_sessions
            .iter()
            .map(|s| s.access_key.clone())
            .collect();
        users.sort();
        users.dedup();
        let least_user = users.into_iter().min_by_key(|ak| {
            self.per_user_dominant_share
                .get(ak)
                .copied()
                .unwrap_or(Decimal::ZERO)
        })?;
        pending_sessions
            .iter()
            .find(|s| s.access_key == least_user)
            .map(|s| s.id)
    }

    fn update_allocation(&mut self, scheduled_session: &SessionRow) {
        let share =
            Self::dominant_share(&self.total_capacity, &scheduled_session.requested_slots);
        let entry = self
            .per_user_dominant_share
            .entry(scheduled_session.access_key.clone())
            .or_insert(Decimal::ZERO);
        if *entry < share {
            *entry = share;
        }
    }
}

/// Minimum-occupancy-first packs the agent side; queueing is plain FIFO.
pub struct MofScheduler;

impl Scheduler for MofScheduler {
    fn pick_session(
        &mut self,
        _total_capacity: &ResourceSlot,
        pending_sessions: &[SessionRow],
        _existing_sessions: &[SessionRow],
    ) -> Option<SessionId> {
        pending_sessions.first().map(|s| s.id)
    }
}

/// Highest priority first, oldest within a priority.
pub struct PriorityScheduler;

impl Scheduler for PriorityScheduler {
    fn pick_session(
        &mut self,
        _total_capacity: &ResourceSlot,
        pending_sessions: &[SessionRow],
        _existing_sessions: &[SessionRow],
    ) -> Option<SessionId> {
        pending_sessions
            .iter()
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|s| s.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;
    use chrono::{Duration, Utc};
    use gridmesh_common::{ClusterMode, SessionType, SlotName};

    fn session(access_key: &str, cpu: &str, age_secs: i64, priority: i32) -> SessionRow {
        let slots: ResourceSlot = [(SlotName::new("cpu"), cpu.parse().unwrap())]
            .into_iter()
            .collect();
        SessionRow {
            id: gridmesh_common::SessionId::generate(),
            creation_id: String::new(),
            name: format!("sess-{access_key}"),
            session_type: SessionType::Interactive,
            cluster_mode: ClusterMode::SingleNode,
            cluster_size: 1,
            priority,
            access_key: AccessKey::new(access_key),
            user_id: access_key.to_owned(),
            domain_name: "default".to_owned(),
            group_id: "default".to_owned(),
            resource_group: "default".to_owned(),
            requested_slots: slots.clone(),
            occupying_slots: slots,
            vfolder_mounts: Vec::new(),
            environ: Default::default(),
            status: SessionStatus::Pending,
            status_info: None,
            status_data: serde_json::json!({}),
            status_history: serde_json::json!({}),
            starts_at: None,
            created_at: Utc::now() - Duration::seconds(age_secs),
            terminated_at: None,
            dependencies: Vec::new(),
            designated_agent: None,
            agent_ids: Vec::new(),
            endpoint_id: None,
        }
    }

    fn capacity(cpu: &str) -> ResourceSlot {
        [(SlotName::new("cpu"), cpu.parse().unwrap())]
            .into_iter()
            .collect()
    }

    #[test]
    fn fifo_skips_repeatedly_failing_sessions() {
        let mut scheduler = FifoScheduler {
            num_retries_to_skip: 3,
        };
        let mut stuck = session("a", "1", 30, 0);
        stuck.status_data = serde_json::json!({"scheduler": {"retries": 5}});
        let fresh = session("b", "1", 20, 0);
        let picked = scheduler
            .pick_session(&capacity("10"), &[stuck.clone(), fresh.clone()], &[])
            .unwrap();
        assert_eq!(picked, fresh.id);

        // All skipped: fall back to the first.
        let picked = scheduler
            .pick_session(&capacity("10"), &[stuck.clone()], &[])
            .unwrap();
        assert_eq!(picked, stuck.id);
    }

    #[test]
    fn lifo_picks_the_newest() {
        let mut scheduler = LifoScheduler;
        let older = session("a", "1", 60, 0);
        let newer = session("b", "1", 10, 0);
        let picked = scheduler
            .pick_session(&capacity("10"), &[older, newer.clone()], &[])
            .unwrap();
        assert_eq!(picked, newer.id);
    }

    #[test]
    fn drf_prefers_the_least_dominant_user() {
        let mut scheduler = DrfScheduler::default();
        let existing_a = session("user-a", "5", 120, 0);
        let existing_b = session("user-b", "1", 120, 0);
        let pending_a = session("user-a", "1", 60, 0);
        let pending_b = session("user-b", "1", 50, 0);
        let picked = scheduler
            .pick_session(
                &capacity("10"),
                &[pending_a, pending_b.clone()],
                &[existing_a, existing_b],
            )
            .unwrap();
        assert_eq!(picked, pending_b.id);
    }

    #[test]
    fn drf_update_allocation_raises_the_share() {
        let mut scheduler = DrfScheduler::default();
        let pending = session("user-a", "6", 60, 0);
        scheduler.pick_session(&capacity("10"), &[pending.clone()], &[]);
        scheduler.update_allocation(&pending);
        assert_eq!(
            scheduler.per_user_dominant_share[&AccessKey::new("user-a")],
            "0.6".parse().unwrap()
        );
    }

    #[test]
    fn priority_orders_by_priority_then_age() {
        let mut scheduler = PriorityScheduler;
        let low_old = session("a", "1", 120, 0);
        let high_new = session("b", "1", 10, 10);
        let picked = scheduler
            .pick_session(&capacity("10"), &[low_old, high_new.clone()], &[])
            .unwrap();
        assert_eq!(picked, high_new.id);
    }

    #[test]
    fn prioritize_narrows_to_the_top_band() {
        let (top, band) = prioritize(vec![
            session("a", "1", 10, 0),
            session("b", "1", 10, 5),
            session("c", "1", 10, 5),
        ]);
        assert_eq!(top, 5);
        assert_eq!(band.len(), 2);
    }
}
