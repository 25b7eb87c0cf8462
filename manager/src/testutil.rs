//! Row builders shared by unit tests.

use crate::models::{SessionRow, SessionStatus};
use chrono::Utc;
use gridmesh_common::{AccessKey, ClusterMode, ResourceSlot, SessionId, SessionType};

pub(crate) fn minimal_session() -> SessionRow {
    SessionRow {
        id: SessionId::generate(),
        creation_id: "creation-0".to_owned(),
        name: "test-session".to_owned(),
        session_type: SessionType::Interactive,
        cluster_mode: ClusterMode::SingleNode,
        cluster_size: 1,
        priority: 0,
        access_key: AccessKey::new("ak-test"),
        user_id: "user-test".to_owned(),
        domain_name: "default".to_owned(),
        group_id: "default".to_owned(),
        resource_group: "default".to_owned(),
        requested_slots: ResourceSlot::new(),
        occupying_slots: ResourceSlot::new(),
        vfolder_mounts: Vec::new(),
        environ: Default::default(),
        status: SessionStatus::Pending,
        status_info: None,
        status_data: serde_json::json!({}),
        status_history: serde_json::json!({}),
        starts_at: None,
        created_at: Utc::now(),
        terminated_at: None,
        dependencies: Vec::new(),
        designated_agent: None,
        agent_ids: Vec::new(),
        endpoint_id: None,
    }
}
