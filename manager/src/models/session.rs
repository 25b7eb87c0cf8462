//! Session rows, the session status join, and scheduling metadata helpers.

use super::kernel::KernelStatus;
use chrono::{DateTime, Utc};
use gridmesh_agent::Mount;
use gridmesh_common::{AccessKey, AgentId, ClusterMode, ResourceSlot, SessionId, SessionType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Scheduled,
    Preparing,
    Pulling,
    Prepared,
    Creating,
    Running,
    Restarting,
    Terminating,
    Terminated,
    Cancelled,
    Error,
}

impl SessionStatus {
    /// Statuses in which a session counts toward its keypair's concurrency
    /// limit.
    pub const USER_RESOURCE_OCCUPYING: &'static [SessionStatus] = &[
        SessionStatus::Scheduled,
        SessionStatus::Preparing,
        SessionStatus::Pulling,
        SessionStatus::Prepared,
        SessionStatus::Creating,
        SessionStatus::Running,
        SessionStatus::Restarting,
        SessionStatus::Terminating,
    ];

    pub fn occupies_user_concurrency(self) -> bool {
        Self::USER_RESOURCE_OCCUPYING.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Terminated | SessionStatus::Cancelled | SessionStatus::Error
        )
    }

    fn from_kernel(status: KernelStatus) -> SessionStatus {
        match status {
            KernelStatus::Pending => SessionStatus::Pending,
            KernelStatus::Scheduled => SessionStatus::Scheduled,
            KernelStatus::Preparing => SessionStatus::Preparing,
            KernelStatus::Pulling => SessionStatus::Pulling,
            KernelStatus::Prepared => SessionStatus::Prepared,
            KernelStatus::Creating => SessionStatus::Creating,
            KernelStatus::Running => SessionStatus::Running,
            KernelStatus::Restarting => SessionStatus::Restarting,
            KernelStatus::Terminating => SessionStatus::Terminating,
            KernelStatus::Terminated => SessionStatus::Terminated,
            KernelStatus::Cancelled => SessionStatus::Cancelled,
            KernelStatus::Error => SessionStatus::Error,
        }
    }

    /// The session status is the join of its kernel statuses: RUNNING iff
    /// all kernels run, TERMINATED iff every kernel ended (terminated or
    /// cancelled), otherwise the earliest non-terminal kernel status wins.
    pub fn derive_from_kernels(statuses: impl IntoIterator<Item = KernelStatus>) -> SessionStatus {
        let statuses: Vec<KernelStatus> = statuses.into_iter().collect();
        if statuses.is_empty() {
            return SessionStatus::Pending;
        }
        if statuses.iter().all(|s| *s == KernelStatus::Running) {
            return SessionStatus::Running;
        }
        if statuses
            .iter()
            .all(|s| matches!(s, KernelStatus::Terminated | KernelStatus::Cancelled))
        {
            return SessionStatus::Terminated;
        }
        let earliest = statuses
            .iter()
            .filter(|s| !s.is_terminal())
            .min_by_key(|s| s.pipeline_index())
            .copied()
            .unwrap_or(KernelStatus::Error);
        SessionStatus::from_kernel(earliest)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Scheduled => "SCHEDULED",
            SessionStatus::Preparing => "PREPARING",
            SessionStatus::Pulling => "PULLING",
            SessionStatus::Prepared => "PREPARED",
            SessionStatus::Creating => "CREATING",
            SessionStatus::Running => "RUNNING",
            SessionStatus::Restarting => "RESTARTING",
            SessionStatus::Terminating => "TERMINATING",
            SessionStatus::Terminated => "TERMINATED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Error => "ERROR",
        };
        f.write_str(text)
    }
}

/// A logical group of kernels scheduled atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    /// Client-supplied creation id, echoed in lifecycle events.
    pub creation_id: String,
    pub name: String,
    pub session_type: SessionType,
    pub cluster_mode: ClusterMode,
    pub cluster_size: u32,
    /// Larger schedules first; ties resolved by the queueing policy.
    pub priority: i32,
    pub access_key: AccessKey,
    pub user_id: String,
    pub domain_name: String,
    pub group_id: String,
    pub resource_group: String,
    /// Total over all kernels.
    pub requested_slots: ResourceSlot,
    /// Sum of committed kernel reservations.
    pub occupying_slots: ResourceSlot,
    pub vfolder_mounts: Vec<Mount>,
    pub environ: BTreeMap<String, String>,
    pub status: SessionStatus,
    pub status_info: Option<String>,
    pub status_data: serde_json::Value,
    pub status_history: serde_json::Value,
    /// Batch sessions may not start before this time.
    pub starts_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    /// Predecessor sessions that must finish successfully first.
    pub dependencies: Vec<SessionId>,
    /// Superadmin-pinned agent; skips agent selection when set.
    pub designated_agent: Option<AgentId>,
    /// Agents hosting this session, filled on SCHEDULED.
    pub agent_ids: Vec<AgentId>,
    /// Inference endpoint this session serves a replica of, if any.
    pub endpoint_id: Option<String>,
}

impl SessionRow {
    /// Retry counter maintained by the dispatcher under
    /// `status_data.scheduler.retries`.
    pub fn scheduler_retries(&self) -> u64 {
        self.status_data
            .pointer("/scheduler/retries")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_running_joins_to_running() {
        let status = SessionStatus::derive_from_kernels([
            KernelStatus::Running,
            KernelStatus::Running,
        ]);
        assert_eq!(status, SessionStatus::Running);
    }

    #[test]
    fn all_ended_joins_to_terminated() {
        let status = SessionStatus::derive_from_kernels([
            KernelStatus::Terminated,
            KernelStatus::Cancelled,
        ]);
        assert_eq!(status, SessionStatus::Terminated);
    }

    #[test]
    fn earliest_non_terminal_wins() {
        let status = SessionStatus::derive_from_kernels([
            KernelStatus::Running,
            KernelStatus::Preparing,
            KernelStatus::Terminated,
        ]);
        assert_eq!(status, SessionStatus::Preparing);
    }

    #[test]
    fn concurrency_set_matches_lifecycle() {
        assert!(!SessionStatus::Pending.occupies_user_concurrency());
        assert!(SessionStatus::Scheduled.occupies_user_concurrency());
        assert!(!SessionStatus::Cancelled.occupies_user_concurrency());
    }
}
