//! Allocation map for integer unit counts (cpu cores, whole devices).

use super::{
    distribute, to_int, AllocationStrategy, DeviceAllocation, DeviceSlotInfo, PoolState,
};
use crate::affinity::AffinityHint;
use crate::error::{ResourceError, Result};
use gridmesh_common::{DeviceId, ResourceSlot, SlotName};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::trace;

/// Passes of the EVENLY redistribution loop before giving up. Exceeding
/// this indicates a logic error, not a capacity problem.
const MAX_EVENLY_PASSES: u32 = 100;

#[derive(Debug)]
pub struct DiscreteAllocMap {
    pool: PoolState,
    strategy: AllocationStrategy,
}

impl DiscreteAllocMap {
    pub fn new(
        device_slots: BTreeMap<DeviceId, DeviceSlotInfo>,
        strategy: AllocationStrategy,
        device_mask: impl IntoIterator<Item = DeviceId>,
        exclusive_slot_types: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        Ok(Self {
            pool: PoolState::new(device_slots, device_mask, exclusive_slot_types)?,
            strategy,
        })
    }

    pub(crate) fn pool(&self) -> &PoolState {
        &self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut PoolState {
        &mut self.pool
    }

    /// Current per-slot, per-device commitments.
    pub fn allocations(&self) -> &DeviceAllocation {
        &self.pool.allocations
    }

    /// Replay a persisted allocation; exceeding capacity is fatal.
    pub fn apply_allocation(&mut self, existing: &DeviceAllocation) -> Result<()> {
        self.pool.apply_allocation(existing)
    }

    /// Release a previously committed allocation.
    pub fn free(&mut self, existing: &DeviceAllocation) -> Result<()> {
        self.pool.free(existing)
    }

    pub fn allocate(
        &mut self,
        slots: &ResourceSlot,
        affinity_hint: Option<&AffinityHint>,
        context_tag: Option<&str>,
    ) -> Result<DeviceAllocation> {
        let requested = self.pool.validate_request(slots)?;
        let mut allocation = DeviceAllocation::new();
        for (slot_name, amount) in requested {
            trace!(
                tag = context_tag.unwrap_or(""),
                slot = %slot_name,
                %amount,
                strategy = ?self.strategy,
                "allocating discrete slot"
            );
            let slot_allocation = match self.strategy {
                AllocationStrategy::Fill => {
                    self.compute_fill(&slot_name, amount, affinity_hint, &allocation)?
                }
                AllocationStrategy::Evenly => {
                    self.compute_evenly(&slot_name, amount, affinity_hint, &allocation)?
                }
            };
            allocation.insert(slot_name, slot_allocation);
        }
        self.pool.commit(&allocation);
        Ok(allocation)
    }

    /// Fill up the most-free devices first.
    fn compute_fill(
        &self,
        slot_name: &SlotName,
        amount: Decimal,
        hint: Option<&AffinityHint>,
        partial: &DeviceAllocation,
    ) -> Result<BTreeMap<DeviceId, Decimal>> {
        let sorted = self.pool.sorted_candidates(hint, slot_name);
        let total_allocatable: i64 = sorted
            .iter()
            .map(|(dev, current)| to_int(self.pool.capacity(dev) - *current))
            .sum();
        let mut remaining = to_int(amount);
        if total_allocatable < remaining {
            return Err(ResourceError::InsufficientResource {
                slot_name: slot_name.clone(),
                requested: amount,
                total_allocatable: Decimal::from(total_allocatable),
                partial_allocation: partial.clone(),
            });
        }
        let mut slot_allocation = BTreeMap::new();
        for (device_id, current) in sorted {
            let allocatable = to_int(self.pool.capacity(&device_id) - current);
            if allocatable > 0 {
                let taken = remaining.min(allocatable);
                slot_allocation.insert(device_id, Decimal::from(taken));
                remaining -= taken;
            }
            if remaining == 0 {
                break;
            }
        }
        Ok(slot_allocation)
    }

    /// Spread the request evenly, redistributing clamped leftovers in
    /// bounded passes.
    fn compute_evenly(
        &self,
        slot_name: &SlotName,
        amount: Decimal,
        hint: Option<&AffinityHint>,
        partial: &DeviceAllocation,
    ) -> Result<BTreeMap<DeviceId, Decimal>> {
        let mut new_alloc: BTreeMap<DeviceId, i64> = BTreeMap::new();
        let mut remaining = to_int(amount);
        let mut passes = 0u32;
        while remaining > 0 {
            if passes >= MAX_EVENLY_PASSES {
                return Err(ResourceError::internal(
                    "too many redistribution passes until allocation",
                ));
            }
            let sorted = self.pool.sorted_candidates(hint, slot_name);
            let room = |new_alloc: &BTreeMap<DeviceId, i64>, dev: &DeviceId, current: Decimal| {
                to_int(self.pool.capacity(dev) - current)
                    - new_alloc.get(dev).copied().unwrap_or(0)
            };
            let total_allocatable: i64 = sorted
                .iter()
                .map(|(dev, current)| room(&new_alloc, dev, *current))
                .sum();
            let nonzero: Vec<DeviceId> = sorted
                .iter()
                .filter(|(dev, current)| room(&new_alloc, dev, *current) > 0)
                .map(|(dev, _)| dev.clone())
                .collect();
            if total_allocatable < remaining || nonzero.is_empty() {
                return Err(ResourceError::InsufficientResource {
                    slot_name: slot_name.clone(),
                    requested: amount,
                    total_allocatable: Decimal::from(total_allocatable),
                    partial_allocation: partial.clone(),
                });
            }
            let shares = distribute(remaining, &nonzero);
            for (device_id, current) in &sorted {
                let share = shares.get(device_id).copied().unwrap_or(0);
                let taken = share.min(room(&new_alloc, device_id, *current));
                if taken > 0 {
                    *new_alloc.entry(device_id.clone()).or_insert(0) += taken;
                    remaining -= taken;
                }
                if remaining == 0 {
                    break;
                }
            }
            passes += 1;
        }
        Ok(new_alloc
            .into_iter()
            .filter(|(_, v)| *v > 0)
            .map(|(dev, v)| (dev, Decimal::from(v)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{device_slots, request};
    use super::*;
    use gridmesh_common::SlotTypes;

    fn fill_map(capacities: &[(&str, &str)]) -> DiscreteAllocMap {
        DiscreteAllocMap::new(
            device_slots("cpu", SlotTypes::Count, capacities),
            AllocationStrategy::Fill,
            [],
            [],
        )
        .unwrap()
    }

    fn evenly_map(capacities: &[(&str, &str)]) -> DiscreteAllocMap {
        DiscreteAllocMap::new(
            device_slots("cpu", SlotTypes::Count, capacities),
            AllocationStrategy::Evenly,
            [],
            [],
        )
        .unwrap()
    }

    fn amounts(alloc: &BTreeMap<DeviceId, Decimal>) -> Vec<(&str, i64)> {
        alloc
            .iter()
            .map(|(dev, v)| (dev.as_str(), to_int(*v)))
            .collect()
    }

    #[test]
    fn fill_spills_over_to_the_next_device() {
        let mut map = fill_map(&[("d0", "4"), ("d1", "4")]);
        let result = map.allocate(&request(&[("cpu", "5")]), None, None).unwrap();
        assert_eq!(amounts(&result[&SlotName::new("cpu")]), vec![("d0", 4), ("d1", 1)]);
    }

    #[test]
    fn evenly_balances_with_remainder_first() {
        let mut map = evenly_map(&[("d0", "4"), ("d1", "4"), ("d2", "4")]);
        let result = map.allocate(&request(&[("cpu", "7")]), None, None).unwrap();
        assert_eq!(
            amounts(&result[&SlotName::new("cpu")]),
            vec![("d0", 3), ("d1", 2), ("d2", 2)]
        );
    }

    #[test]
    fn evenly_redistributes_clamped_leftover() {
        // d1 can only take 1, so the second pass moves its share to d0.
        let mut map = evenly_map(&[("d0", "6"), ("d1", "1")]);
        let result = map.allocate(&request(&[("cpu", "5")]), None, None).unwrap();
        assert_eq!(amounts(&result[&SlotName::new("cpu")]), vec![("d0", 4), ("d1", 1)]);
    }

    #[test]
    fn insufficient_leaves_the_map_untouched() {
        let mut map = fill_map(&[("d0", "2"), ("d1", "2")]);
        let err = map
            .allocate(&request(&[("cpu", "5")]), None, None)
            .unwrap_err();
        match err {
            ResourceError::InsufficientResource {
                requested,
                total_allocatable,
                partial_allocation,
                ..
            } => {
                assert_eq!(requested, Decimal::from(5));
                assert_eq!(total_allocatable, Decimal::from(4));
                assert!(partial_allocation.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        for cell in map.pool().allocations[&SlotName::new("cpu")].values() {
            assert_eq!(*cell, Decimal::ZERO);
        }
    }

    #[test]
    fn free_restores_the_prior_state() {
        let mut map = fill_map(&[("d0", "4"), ("d1", "4")]);
        let before = map.pool().allocations.clone();
        let result = map.allocate(&request(&[("cpu", "6")]), None, None).unwrap();
        map.pool_mut().free(&result).unwrap();
        assert_eq!(map.pool().allocations, before);
    }

    #[test]
    fn unique_slot_must_request_exactly_one() {
        let mut map = DiscreteAllocMap::new(
            device_slots("cuda.device", SlotTypes::Unique, &[("gpu-0", "1"), ("gpu-1", "1")]),
            AllocationStrategy::Fill,
            [],
            [],
        )
        .unwrap();
        let err = map
            .allocate(&request(&[("cuda.device", "2")]), None, None)
            .unwrap_err();
        assert!(matches!(err, ResourceError::InvalidResourceArgument { .. }));
    }

    #[test]
    fn exclusive_patterns_reject_combined_requests() {
        let mut slots = device_slots("cuda.shares", SlotTypes::Count, &[("gpu-0", "4")]);
        slots.extend(device_slots("rocm.shares", SlotTypes::Count, &[("r-0", "4")]));
        let mut map = DiscreteAllocMap::new(
            slots,
            AllocationStrategy::Fill,
            [],
            ["cuda.*".to_owned(), "rocm.*".to_owned()],
        )
        .unwrap();
        let err = map
            .allocate(
                &request(&[("cuda.shares", "1"), ("rocm.shares", "1")]),
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ResourceError::InvalidResourceCombination { .. }));
    }

    #[test]
    fn masked_devices_never_receive_allocations() {
        let mut map = DiscreteAllocMap::new(
            device_slots("cpu", SlotTypes::Count, &[("d0", "4"), ("d1", "4")]),
            AllocationStrategy::Fill,
            [DeviceId::new("d1")],
            [],
        )
        .unwrap();
        let result = map.allocate(&request(&[("cpu", "4")]), None, None).unwrap();
        assert_eq!(amounts(&result[&SlotName::new("cpu")]), vec![("d0", 4)]);
        assert!(map
            .allocate(&request(&[("cpu", "1")]), None, None)
            .is_err());
    }
}
