//! Kernel rows and their lifecycle state machine.

use chrono::{DateTime, Utc};
use gridmesh_agent::KernelResourceSpec;
use gridmesh_common::{
    AccessKey, AgentId, ClusterRole, KernelId, ResourceSlot, SessionId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kernel lifecycle:
/// `PENDING -> SCHEDULED -> PREPARING -> PULLING -> PREPARED -> CREATING ->
/// RUNNING -> {TERMINATING -> TERMINATED | CANCELLED | ERROR}`; RESTARTING
/// loops back into RUNNING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KernelStatus {
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

impl KernelStatus {
    /// Statuses that hold agent resources. Entering or leaving this set
    /// triggers an occupancy recalculation for the kernel's agent.
    pub const AGENT_RESOURCE_OCCUPYING: &'static [KernelStatus] = &[
        KernelStatus::Scheduled,
        KernelStatus::Preparing,
        KernelStatus::Pulling,
        KernelStatus::Prepared,
        KernelStatus::Creating,
        KernelStatus::Running,
        KernelStatus::Restarting,
        KernelStatus::Terminating,
    ];

    pub fn occupies_agent_resources(self) -> bool {
        Self::AGENT_RESOURCE_OCCUPYING.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            KernelStatus::Terminated | KernelStatus::Cancelled | KernelStatus::Error
        )
    }

    /// Position in the creation pipeline, used to derive the session status
    /// as the earliest non-terminal kernel status.
    pub fn pipeline_index(self) -> u8 {
        match self {
            KernelStatus::Pending => 0,
            KernelStatus::Scheduled => 1,
            KernelStatus::Preparing => 2,
            KernelStatus::Pulling => 3,
            KernelStatus::Prepared => 4,
            KernelStatus::Creating => 5,
            KernelStatus::Restarting => 6,
            KernelStatus::Running => 7,
            KernelStatus::Terminating => 8,
            KernelStatus::Terminated => 9,
            KernelStatus::Cancelled => 10,
            KernelStatus::Error => 11,
        }
    }

    pub fn can_transit(self, to: KernelStatus) -> bool {
        use KernelStatus::*;
        matches!(
            (self, to),
            (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Scheduled, Preparing)
                | (Scheduled, Cancelled)
                | (Preparing, Pulling)
                | (Preparing, Prepared)
                | (Preparing, Cancelled)
                | (Preparing, Error)
                | (Pulling, Prepared)
                | (Pulling, Cancelled)
                | (Pulling, Error)
                | (Prepared, Creating)
                | (Prepared, Cancelled)
                | (Creating, Running)
                | (Creating, Cancelled)
                | (Creating, Error)
                | (Running, Restarting)
                | (Running, Terminating)
                | (Running, Error)
                | (Restarting, Running)
                | (Restarting, Error)
                | (Terminating, Terminated)
        )
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            KernelStatus::Pending => "PENDING",
            KernelStatus::Scheduled => "SCHEDULED",
            KernelStatus::Preparing => "PREPARING",
            KernelStatus::Pulling => "PULLING",
            KernelStatus::Prepared => "PREPARED",
            KernelStatus::Creating => "CREATING",
            KernelStatus::Running => "RUNNING",
            KernelStatus::Restarting => "RESTARTING",
            KernelStatus::Terminating => "TERMINATING",
            KernelStatus::Terminated => "TERMINATED",
            KernelStatus::Cancelled => "CANCELLED",
            KernelStatus::Error => "ERROR",
        };
        f.write_str(text)
    }
}

/// One container within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelRow {
    pub id: KernelId,
    pub session_id: SessionId,
    pub access_key: AccessKey,
    pub cluster_role: ClusterRole,
    pub cluster_idx: u32,
    pub architecture: String,
    pub image: String,
    pub requested_slots: ResourceSlot,
    /// Set when the reservation is committed; empty until then.
    pub occupied_slots: ResourceSlot,
    /// Assigned agent, set on SCHEDULED.
    pub agent: Option<AgentId>,
    pub agent_addr: Option<String>,
    pub resource_group: String,
    /// Container id, set after creation.
    pub container_id: Option<String>,
    pub status: KernelStatus,
    pub status_info: Option<String>,
    pub status_data: serde_json::Value,
    pub status_history: serde_json::Value,
    /// Per-device allocation record, persisted to the container's config
    /// volume and replayed on restart.
    pub resource_spec: Option<KernelResourceSpec>,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl KernelRow {
    pub fn new(
        session_id: SessionId,
        access_key: AccessKey,
        cluster_role: ClusterRole,
        cluster_idx: u32,
        architecture: impl Into<String>,
        image: impl Into<String>,
        requested_slots: ResourceSlot,
        resource_group: impl Into<String>,
    ) -> Self {
        Self {
            id: KernelId::generate(),
            session_id,
            access_key,
            cluster_role,
            cluster_idx,
            architecture: architecture.into(),
            image: image.into(),
            requested_slots,
            occupied_slots: ResourceSlot::new(),
            agent: None,
            agent_addr: None,
            resource_group: resource_group.into(),
            container_id: None,
            status: KernelStatus::Pending,
            status_info: None,
            status_data: serde_json::json!({}),
            status_history: serde_json::json!({}),
            resource_spec: None,
            created_at: Utc::now(),
            terminated_at: None,
        }
    }
}
