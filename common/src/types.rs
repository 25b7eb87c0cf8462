//! Identifier newtypes and scheduling enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

string_id! {
    /// Identifier of an agent node (stable across restarts).
    AgentId
}
string_id! {
    /// API access key owning a session.
    AccessKey
}
string_id! {
    /// Name of a resource slot dimension, e.g. `cpu`, `mem`, `cuda.shares`.
    SlotName
}
string_id! {
    /// Name of a device class, e.g. `cpu`, `mem`, `cuda`.
    DeviceName
}
string_id! {
    /// Identifier of a single device within its class, e.g. `gpu-0`.
    DeviceId
}

uuid_id! {
    /// Identifier of a session (a group of kernels scheduled atomically).
    SessionId
}
uuid_id! {
    /// Identifier of a kernel (one container).
    KernelId
}

impl SlotName {
    /// The device-class prefix of this slot name (`cuda.shares` -> `cuda`).
    pub fn device_name(&self) -> DeviceName {
        match self.0.split_once('.') {
            Some((prefix, _)) => DeviceName::new(prefix),
            None => DeviceName::new(self.0.as_str()),
        }
    }
}

/// Workload type of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    Interactive,
    Batch,
    Inference,
    System,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Interactive => f.write_str("interactive"),
            SessionType::Batch => f.write_str("batch"),
            SessionType::Inference => f.write_str("inference"),
            SessionType::System => f.write_str("system"),
        }
    }
}

/// How the kernels of a session are spread over agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    /// All kernels share one agent; sub-kernels slice the same reservation.
    SingleNode,
    /// Each kernel is placed independently, possibly on different agents.
    MultiNode,
}

/// Role of a kernel within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    Main,
    Sub,
}

/// Built-in agent selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSelectionStrategy {
    /// Prefer agents with the largest advertised capacity (historical).
    Legacy,
    /// Pack kernels onto as few agents as possible.
    Concentrated,
    /// Spread kernels across agents.
    Dispersed,
    /// Rotate through agents with a persistent per-group index.
    RoundRobin,
}

impl fmt::Display for AgentSelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentSelectionStrategy::Legacy => f.write_str("legacy"),
            AgentSelectionStrategy::Concentrated => f.write_str("concentrated"),
            AgentSelectionStrategy::Dispersed => f.write_str("dispersed"),
            AgentSelectionStrategy::RoundRobin => f.write_str("roundrobin"),
        }
    }
}

/// Persistent cursor for the round-robin agent selector, stored per
/// (resource group, architecture) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoundRobinState {
    pub next_index: usize,
}
