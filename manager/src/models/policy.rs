//! Resource policies and the resource-group (scaling-group) catalog.

use gridmesh_common::{
    AccessKey, AgentSelectionStrategy, DefaultForUnspecified, ResourceSlot, SessionType, SlotName,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keypair-scoped admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairResourcePolicy {
    pub name: String,
    /// Slot limits; unmentioned slots follow `default_for_unspecified`.
    pub total_resource_slots: BTreeMap<SlotName, Decimal>,
    pub default_for_unspecified: DefaultForUnspecified,
    /// 0 means unlimited.
    pub max_concurrent_sessions: u32,
    pub max_pending_session_count: Option<u32>,
    pub max_pending_session_resource_slots: Option<ResourceSlot>,
    pub allowed_resource_groups: Vec<String>,
}

impl Default for KeyPairResourcePolicy {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            total_resource_slots: BTreeMap::new(),
            default_for_unspecified: DefaultForUnspecified::Unlimited,
            max_concurrent_sessions: 0,
            max_pending_session_count: None,
            max_pending_session_resource_slots: None,
            allowed_resource_groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairRow {
    pub access_key: AccessKey,
    pub user_id: String,
    pub resource_policy: String,
}

/// Per-user slot limits; `None` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: String,
    pub total_resource_slots: Option<BTreeMap<SlotName, Decimal>>,
}

/// Per-group slot limits; `None` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRow {
    pub id: String,
    pub total_resource_slots: Option<BTreeMap<SlotName, Decimal>>,
}

/// Per-domain slot limits; `None` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRow {
    pub name: String,
    pub total_resource_slots: Option<BTreeMap<SlotName, Decimal>>,
}

/// Scheduling options of one resource group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceGroupOpts {
    pub allowed_session_types: Vec<SessionType>,
    /// Queue residency limit in seconds; 0 disables the timeout.
    pub pending_timeout_secs: u64,
    pub agent_selection_strategy: AgentSelectionStrategy,
    /// Spread inference replicas of one endpoint across agents even under
    /// the concentrated selector.
    pub enforce_spreading_endpoint_replica: bool,
    /// Scheduler-specific configuration (e.g. `num_retries_to_skip`).
    pub config: serde_json::Value,
    pub agent_selector_config: serde_json::Value,
}

impl Default for ResourceGroupOpts {
    fn default() -> Self {
        Self {
            allowed_session_types: vec![
                SessionType::Interactive,
                SessionType::Batch,
                SessionType::Inference,
            ],
            pending_timeout_secs: 0,
            agent_selection_strategy: AgentSelectionStrategy::Dispersed,
            enforce_spreading_endpoint_replica: false,
            config: serde_json::json!({}),
            agent_selector_config: serde_json::json!({}),
        }
    }
}

/// A named pool of agents sharing one queueing policy and one selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceGroupRow {
    pub name: String,
    /// Queueing policy name: `fifo`, `lifo`, `drf`, `mof`, or `priority`.
    pub scheduler: String,
    pub opts: ResourceGroupOpts,
}

impl ResourceGroupRow {
    pub fn new(name: impl Into<String>, scheduler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheduler: scheduler.into(),
            opts: ResourceGroupOpts::default(),
        }
    }
}
