//! Resource allocation error types.

use gridmesh_common::{DeviceId, SlotName};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResourceError>;

/// Errors raised by the allocation maps and the resource spec codec.
///
/// `InsufficientResource` is the only variant the scheduler recovers from
/// locally (it tries the next agent or the next session); the others are
/// permanent for the requesting session.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Not enough free capacity across the candidate devices.
    #[error(
        "insufficient allocatable amount for {slot_name} \
         (requested: {requested}, allocatable: {total_allocatable})"
    )]
    InsufficientResource {
        slot_name: SlotName,
        requested: Decimal,
        total_allocatable: Decimal,
        /// Per-slot allocation computed before the failing slot, for
        /// diagnostics. Never committed to the map.
        partial_allocation: BTreeMap<SlotName, BTreeMap<DeviceId, Decimal>>,
    },

    /// Two mutually exclusive slots were requested together.
    #[error("slots {a} and {b} cannot be allocated at the same time")]
    InvalidResourceCombination { a: SlotName, b: SlotName },

    /// A malformed request, e.g. a unique-type slot with quantity != 1.
    #[error("invalid resource request: {message}")]
    InvalidResourceArgument { message: String },

    /// A positive fractional request rounded down to zero at the quantum.
    #[error(
        "requested amount {requested} for {slot_name} is smaller than \
         the device quantum and rounds to zero"
    )]
    NotMultipleOfQuantum {
        slot_name: SlotName,
        requested: Decimal,
    },

    /// A malformed kernel resource spec file.
    #[error("invalid kernel resource spec: {message}")]
    SpecFormat { message: String },

    /// Invariant violation inside the allocator, or corrupted persistent
    /// state during replay. Not recoverable.
    #[error("allocation invariant violated: {message}")]
    Internal { message: String },
}

impl ResourceError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn spec_format(message: impl Into<String>) -> Self {
        Self::SpecFormat {
            message: message.into(),
        }
    }

    /// Whether the scheduler may retry the session on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResourceError::InsufficientResource { .. })
    }
}
