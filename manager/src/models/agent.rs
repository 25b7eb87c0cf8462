//! Agent rows.

use chrono::{DateTime, Utc};
use gridmesh_common::{AgentId, DeviceName, ResourceSlot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Heartbeating and schedulable.
    Alive,
    /// Heartbeat silent beyond the liveness threshold.
    Lost,
    /// Explicitly decommissioned.
    Terminated,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Alive => f.write_str("ALIVE"),
            AgentStatus::Lost => f.write_str("LOST"),
            AgentStatus::Terminated => f.write_str("TERMINATED"),
        }
    }
}

/// One agent node. Created by its first heartbeat; `occupied_slots` is the
/// single-writer invariant of the scheduler and the lifecycle reconciler.
///
/// At steady state `occupied_slots <= available_slots` componentwise; a
/// transient violation is permitted only between an in-progress allocation
/// and its settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRow {
    pub id: AgentId,
    pub addr: String,
    pub architecture: String,
    pub resource_group: String,
    pub status: AgentStatus,
    /// Advertised capacity from the latest heartbeat.
    pub available_slots: ResourceSlot,
    /// Sum of the committed reservations of kernels placed here.
    pub occupied_slots: ResourceSlot,
    pub version: String,
    pub compute_plugins: BTreeMap<DeviceName, String>,
    pub first_contact: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRow {
    pub fn remaining_slots(&self) -> ResourceSlot {
        self.available_slots.clone() - self.occupied_slots.clone()
    }
}
