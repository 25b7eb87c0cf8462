//! Process-wide registry of known slot types.
//!
//! Agents advertise their slot types through heartbeats; the scheduling
//! context owns one registry instance and passes snapshots to everything
//! that needs to classify a slot. Writes are add-only between reloads so a
//! slot never silently changes type under a running scheduler.

use crate::error::{CommonError, Result};
use crate::slot::SlotTypes;
use crate::types::SlotName;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SlotTypeRegistry {
    inner: RwLock<BTreeMap<SlotName, SlotTypes>>,
}

impl SlotTypeRegistry {
    /// An empty registry; call `init` with the intrinsic slots afterwards.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-seeded with the intrinsic `cpu` and `mem` slots.
    pub fn with_intrinsic() -> Self {
        let registry = Self::new();
        registry.init([
            (SlotName::new("cpu"), SlotTypes::Count),
            (SlotName::new("mem"), SlotTypes::Bytes),
        ]);
        registry
    }

    /// Replace the whole table. Used at startup and on config reload.
    pub fn init(&self, entries: impl IntoIterator<Item = (SlotName, SlotTypes)>) {
        let mut inner = self.inner.write();
        inner.clear();
        inner.extend(entries);
    }

    /// Register one slot type. Re-registering with the same type is a
    /// no-op; a conflicting type is an error.
    pub fn add(&self, name: SlotName, slot_type: SlotTypes) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.get(&name) {
            Some(existing) if *existing != slot_type => Err(CommonError::ConflictingSlotType {
                name,
                existing: existing.to_string(),
                requested: slot_type.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                debug!(slot = %name, slot_type = %slot_type, "registered slot type");
                inner.insert(name, slot_type);
                Ok(())
            }
        }
    }

    /// A point-in-time copy of the table.
    pub fn snapshot(&self) -> BTreeMap<SlotName, SlotTypes> {
        self.inner.read().clone()
    }

    pub fn get(&self, name: &SlotName) -> Option<SlotTypes> {
        self.inner.read().get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_but_rejects_conflicts() {
        let registry = SlotTypeRegistry::with_intrinsic();
        registry
            .add(SlotName::new("cuda.shares"), SlotTypes::Count)
            .unwrap();
        registry
            .add(SlotName::new("cuda.shares"), SlotTypes::Count)
            .unwrap();
        assert!(registry
            .add(SlotName::new("cuda.shares"), SlotTypes::Bytes)
            .is_err());
    }

    #[test]
    fn snapshot_is_detached() {
        let registry = SlotTypeRegistry::with_intrinsic();
        let snapshot = registry.snapshot();
        registry
            .add(SlotName::new("cuda.device"), SlotTypes::Unique)
            .unwrap();
        assert!(!snapshot.contains_key(&SlotName::new("cuda.device")));
        assert!(registry.get(&SlotName::new("cuda.device")).is_some());
    }
}
