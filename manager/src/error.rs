//! Scheduler-side error types.

use gridmesh_common::{AgentId, SessionId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulingError>;

#[derive(Debug, Error)]
pub enum SchedulingError {
    /// No compatible agent with enough capacity this tick. Transient: the
    /// session stays PENDING and is retried on a later tick.
    #[error("no available instances: {reason}")]
    InstanceNotAvailable { reason: String },

    #[error("resource group not found: {name}")]
    ResourceGroupNotFound { name: String },

    #[error("session not found: {id}")]
    SessionNotFound { id: SessionId },

    #[error("agent not found: {id}")]
    AgentNotFound { id: AgentId },

    #[error("keypair not found: {access_key}")]
    KeyPairNotFound { access_key: String },

    #[error("unknown scheduler: {name}")]
    UnknownScheduler { name: String },

    /// A malformed session, e.g. mixed architectures in single-node mode.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Plugin-level veto of a scheduling decision.
    #[error("rejected by hook {hook}: {reason}")]
    RejectedByHook {
        hook: String,
        reason: String,
        permanent: bool,
    },

    /// Agent RPC or agent-side failure; the affected kernels are rolled
    /// back and cancelled.
    #[error("agent error: {message}")]
    Agent { message: String },

    #[error(transparent)]
    Resource(#[from] gridmesh_agent::ResourceError),

    #[error(transparent)]
    Common(#[from] gridmesh_common::CommonError),

    /// Internal invariant violation. Fatal for the current tick; never
    /// masked.
    #[error("scheduler invariant violated: {message}")]
    Internal { message: String },
}

impl SchedulingError {
    pub fn instance_not_available(reason: impl Into<String>) -> Self {
        Self::InstanceNotAvailable {
            reason: reason.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Status-data error record `{src, name, repr}` for unexpected errors.
    pub fn to_status_data(&self) -> serde_json::Value {
        let name = match self {
            Self::InstanceNotAvailable { .. } => "InstanceNotAvailable",
            Self::ResourceGroupNotFound { .. } => "ResourceGroupNotFound",
            Self::SessionNotFound { .. } => "SessionNotFound",
            Self::AgentNotFound { .. } => "AgentNotFound",
            Self::KeyPairNotFound { .. } => "KeyPairNotFound",
            Self::UnknownScheduler { .. } => "UnknownScheduler",
            Self::BadRequest { .. } => "BadRequest",
            Self::RejectedByHook { .. } => "RejectedByHook",
            Self::Agent { .. } => "AgentError",
            Self::Resource(_) => "ResourceError",
            Self::Common(_) => "CommonError",
            Self::Internal { .. } => "SchedulerError",
        };
        serde_json::json!({
            "error": {
                "src": "scheduler",
                "name": name,
                "repr": self.to_string(),
            }
        })
    }
}
