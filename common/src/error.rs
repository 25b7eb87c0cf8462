//! Error types shared across the workspace.

use crate::types::SlotName;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Debug, Error)]
pub enum CommonError {
    /// A slot name not present in the slot-type registry was used.
    #[error("unknown resource slot: {name}")]
    UnknownSlotName { name: SlotName },

    /// A quantity could not be parsed or is out of range.
    #[error("invalid quantity for slot {name}: {value}")]
    InvalidQuantity { name: SlotName, value: String },

    /// A binary size string could not be parsed.
    #[error("invalid binary size: {input}")]
    InvalidBinarySize { input: String },

    /// A slot type was re-registered with a conflicting type.
    #[error("slot {name} already registered as {existing}, refusing {requested}")]
    ConflictingSlotType {
        name: SlotName,
        existing: String,
        requested: String,
    },
}
