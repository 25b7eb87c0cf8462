//! Data rows and lifecycle state machines.

pub mod agent;
pub mod kernel;
pub mod policy;
pub mod session;

pub use agent::{AgentRow, AgentStatus};
pub use kernel::{KernelRow, KernelStatus};
pub use policy::{
    DomainRow, GroupRow, KeyPairResourcePolicy, KeyPairRow, ResourceGroupOpts, ResourceGroupRow,
    UserRow,
};
pub use session::{SessionRow, SessionStatus};

use chrono::{DateTime, Utc};

/// Append a `status -> timestamp` entry to a row's status history value.
pub(crate) fn record_status_history(
    history: &mut serde_json::Value,
    status: &str,
    at: DateTime<Utc>,
) {
    if !history.is_object() {
        *history = serde_json::json!({});
    }
    if let Some(map) = history.as_object_mut() {
        map.insert(status.to_owned(), serde_json::json!(at.to_rfc3339()));
    }
}
