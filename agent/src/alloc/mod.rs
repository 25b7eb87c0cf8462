//! Per-device allocation maps.
//!
//! Given a requested `ResourceSlot` and an optional `AffinityHint`, an
//! allocation map produces a concrete per-device assignment, mutates its
//! bookkeeping, and supports replay (`apply_allocation`) and release
//! (`free`). Two kinds exist: `DiscreteAllocMap` for integer unit counts
//! and `FractionAllocMap` for quantum-aligned fractional shares. Both share
//! request validation, exclusivity checking, and affinity-aware candidate
//! ordering through `PoolState`.
//!
//! Allocation is compute-then-commit: nothing is written to the map until
//! every requested slot has a full assignment, so a failure on the third
//! slot of a request leaves the map exactly as it was.

mod discrete;
mod fraction;

pub use discrete::DiscreteAllocMap;
pub use fraction::FractionAllocMap;

use crate::affinity::{AffinityHint, AffinityPolicy};
use crate::error::{ResourceError, Result};
use glob::Pattern;
use gridmesh_common::{DeviceId, ResourceSlot, SlotName, SlotTypes};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-slot, per-device allocation amounts, as returned by `allocate` and
/// persisted in kernel resource specs.
pub type DeviceAllocation = BTreeMap<SlotName, BTreeMap<DeviceId, Decimal>>;

/// How an allocation map spreads a request over its devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Fill the most-free device first, spilling over only when full.
    Fill,
    /// Distribute the request as evenly as the devices allow.
    Evenly,
}

/// Capacity record of one device within an allocation map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSlotInfo {
    pub slot_type: SlotTypes,
    pub slot_name: SlotName,
    pub capacity: Decimal,
}

/// State and validation shared by both allocation map kinds.
#[derive(Debug)]
pub(crate) struct PoolState {
    device_slots: BTreeMap<DeviceId, DeviceSlotInfo>,
    slot_types: BTreeMap<SlotName, SlotTypes>,
    device_mask: BTreeSet<DeviceId>,
    exclusive_patterns: Vec<Pattern>,
    /// `allocations[slot][device]`, every known device preinitialized to 0.
    pub(crate) allocations: DeviceAllocation,
}

impl PoolState {
    pub(crate) fn new(
        device_slots: BTreeMap<DeviceId, DeviceSlotInfo>,
        device_mask: impl IntoIterator<Item = DeviceId>,
        exclusive_slot_types: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        let mut exclusive_patterns = Vec::new();
        for raw in exclusive_slot_types {
            let pattern = Pattern::new(&raw).map_err(|e| {
                ResourceError::internal(format!("bad exclusive slot pattern {raw:?}: {e}"))
            })?;
            exclusive_patterns.push(pattern);
        }
        let slot_types = device_slots
            .values()
            .map(|info| (info.slot_name.clone(), info.slot_type))
            .collect();
        let mut allocations = DeviceAllocation::new();
        for (device_id, info) in &device_slots {
            allocations
                .entry(info.slot_name.clone())
                .or_default()
                .insert(device_id.clone(), Decimal::ZERO);
        }
        Ok(Self {
            device_slots,
            slot_types,
            device_mask: device_mask.into_iter().collect(),
            exclusive_patterns,
            allocations,
        })
    }

    pub(crate) fn device_slots(&self) -> &BTreeMap<DeviceId, DeviceSlotInfo> {
        &self.device_slots
    }

    /// Masked devices count as zero-capacity.
    pub(crate) fn capacity(&self, device_id: &DeviceId) -> Decimal {
        if self.device_mask.contains(device_id) {
            return Decimal::ZERO;
        }
        self.device_slots
            .get(device_id)
            .map(|info| info.capacity)
            .unwrap_or(Decimal::ZERO)
    }

    pub(crate) fn current(&self, slot_name: &SlotName, device_id: &DeviceId) -> Decimal {
        self.allocations
            .get(slot_name)
            .and_then(|m| m.get(device_id))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub(crate) fn clear(&mut self) {
        for per_device in self.allocations.values_mut() {
            for value in per_device.values_mut() {
                *value = Decimal::ZERO;
            }
        }
    }

    /// Two slot names conflict when they are distinct and each matches at
    /// least one exclusive pattern (any-match OR semantics).
    pub(crate) fn check_exclusive(&self, a: &SlotName, b: &SlotName) -> bool {
        if self.exclusive_patterns.is_empty() || a == b {
            return false;
        }
        let matches = |name: &SlotName| {
            self.exclusive_patterns
                .iter()
                .any(|p| p.matches(name.as_str()))
        };
        matches(a) && matches(b)
    }

    /// Prune zero-quantity slots and reject exclusive combinations and
    /// malformed unique-slot requests. Returns the effective request in
    /// deterministic (name) order.
    pub(crate) fn validate_request(
        &self,
        slots: &ResourceSlot,
    ) -> Result<Vec<(SlotName, Decimal)>> {
        let requested: Vec<(SlotName, Decimal)> = slots
            .iter()
            .filter(|(_, v)| **v > Decimal::ZERO)
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (a, _) in &requested {
            for (b, _) in &requested {
                if self.check_exclusive(a, b) {
                    return Err(ResourceError::InvalidResourceCombination {
                        a: a.clone(),
                        b: b.clone(),
                    });
                }
            }
        }
        for (name, amount) in &requested {
            if self.slot_types.get(name) == Some(&SlotTypes::Unique) && *amount != Decimal::ONE {
                return Err(ResourceError::InvalidResourceArgument {
                    message: format!("only 1 may be allocated for the unique-type slot {name}"),
                });
            }
        }
        Ok(requested)
    }

    /// The ordered `(device, current_allocation)` candidates the allocators
    /// iterate over for one slot.
    ///
    /// Without a hint (or with an empty hint device set and no map), this
    /// is plain most-free-first. With a hint carrying prior devices, the
    /// NUMA-primary clusters come first (interleaved across hint groups),
    /// then the secondary remainder. On the first kernel of a session the
    /// policy decides whether colocated clusters are chained or
    /// interleaved.
    pub(crate) fn sorted_candidates(
        &self,
        hint: Option<&AffinityHint>,
        slot_name: &SlotName,
    ) -> Vec<(DeviceId, Decimal)> {
        let per_device = match self.allocations.get(slot_name) {
            Some(m) => m,
            None => return Vec::new(),
        };
        let sort_most_free_first = |mut items: Vec<(DeviceId, Decimal)>| {
            items.sort_by(|a, b| {
                let free_a = self.capacity(&a.0) - a.1;
                let free_b = self.capacity(&b.0) - b.1;
                free_b.cmp(&free_a).then_with(|| a.0.cmp(&b.0))
            });
            items
        };
        let hint = match hint {
            Some(h) => h,
            None => {
                return sort_most_free_first(
                    per_device.iter().map(|(d, v)| (d.clone(), *v)).collect(),
                );
            }
        };
        let device_name = slot_name.device_name();
        let restrict = |cluster: &[crate::device::ComputeDevice]| {
            sort_most_free_first(
                cluster
                    .iter()
                    .filter_map(|d| {
                        per_device
                            .get(&d.device_id)
                            .map(|v| (d.device_id.clone(), *v))
                    })
                    .collect(),
            )
        };
        if hint.devices.is_empty() {
            let clusters = hint.map.colocated_clusters(&device_name);
            let lists: Vec<Vec<(DeviceId, Decimal)>> =
                clusters.iter().map(|c| restrict(c)).collect();
            match hint.policy {
                AffinityPolicy::PreferSingleNode => lists.into_iter().flatten().collect(),
                AffinityPolicy::Interleaved => interleave(lists),
            }
        } else {
            let (primaries, secondary) = hint
                .map
                .distance_ordered_neighbors(&hint.devices, &device_name);
            let primary_lists: Vec<Vec<(DeviceId, Decimal)>> =
                primaries.iter().map(|c| restrict(c)).collect();
            let mut ordered = interleave(primary_lists);
            ordered.extend(restrict(&secondary));
            ordered
        }
    }

    pub(crate) fn commit(&mut self, allocation: &DeviceAllocation) {
        for (slot_name, per_device) in allocation {
            let cells = self.allocations.entry(slot_name.clone()).or_default();
            for (device_id, value) in per_device {
                *cells.entry(device_id.clone()).or_insert(Decimal::ZERO) += *value;
            }
        }
    }

    /// Replay a persisted allocation. Exceeding device capacity means the
    /// persistent state is corrupted; that is fatal, and the map is left
    /// untouched.
    pub(crate) fn apply_allocation(&mut self, existing: &DeviceAllocation) -> Result<()> {
        for (slot_name, per_device) in existing {
            for (device_id, value) in per_device {
                let info = self.device_slots.get(device_id).ok_or_else(|| {
                    ResourceError::internal(format!(
                        "replayed allocation references unknown device {device_id}"
                    ))
                })?;
                if &info.slot_name != slot_name {
                    return Err(ResourceError::internal(format!(
                        "replayed allocation assigns {slot_name} to device {device_id} \
                         which serves {}",
                        info.slot_name
                    )));
                }
                if self.current(slot_name, device_id) + *value > info.capacity {
                    return Err(ResourceError::internal(format!(
                        "replayed allocation exceeds capacity of device {device_id} \
                         ({slot_name}: {} + {value} > {})",
                        self.current(slot_name, device_id),
                        info.capacity,
                    )));
                }
            }
        }
        self.commit(existing);
        Ok(())
    }

    /// Release a previously returned allocation. Driving any cell below
    /// zero means double-free or accounting corruption; the map is left
    /// untouched in that case.
    pub(crate) fn free(&mut self, existing: &DeviceAllocation) -> Result<()> {
        for (slot_name, per_device) in existing {
            for (device_id, value) in per_device {
                if self.current(slot_name, device_id) < *value {
                    return Err(ResourceError::internal(format!(
                        "freeing {value} of {slot_name} on device {device_id} would \
                         drive the allocation below zero"
                    )));
                }
            }
        }
        for (slot_name, per_device) in existing {
            let cells = self.allocations.entry(slot_name.clone()).or_default();
            for (device_id, value) in per_device {
                *cells.entry(device_id.clone()).or_insert(Decimal::ZERO) -= *value;
            }
        }
        Ok(())
    }
}

/// Round-robin interleave of several ordered lists, longest-tail preserved.
fn interleave<T>(groups: Vec<Vec<T>>) -> Vec<T> {
    let mut iters: Vec<std::vec::IntoIter<T>> =
        groups.into_iter().map(|g| g.into_iter()).collect();
    let mut out = Vec::new();
    loop {
        let mut exhausted = true;
        for iter in &mut iters {
            if let Some(item) = iter.next() {
                out.push(item);
                exhausted = false;
            }
        }
        if exhausted {
            return out;
        }
    }
}

/// Split `num` units over `groups`: the first `num % len` groups receive
/// one extra unit on top of the even base.
pub(crate) fn distribute(num: i64, groups: &[DeviceId]) -> BTreeMap<DeviceId, i64> {
    let len = groups.len() as i64;
    let (base, extra) = (num / len, num % len);
    groups
        .iter()
        .enumerate()
        .map(|(i, g)| (g.clone(), base + i64::from((i as i64) < extra)))
        .collect()
}

/// Largest multiple of `quantum` not exceeding `value`.
pub(crate) fn round_down(value: Decimal, quantum: Decimal) -> Decimal {
    if quantum <= Decimal::ZERO {
        return value;
    }
    let mut remainder = value % quantum;
    if remainder < Decimal::ZERO {
        remainder += quantum;
    }
    value - remainder
}

pub(crate) fn to_int(value: Decimal) -> i64 {
    value.trunc().to_i64().unwrap_or(0)
}

/// An agent-side allocation map: one per device class, discrete for unit
/// counts and fractional for quantum-aligned shares.
#[derive(Debug)]
pub enum AllocMap {
    Discrete(DiscreteAllocMap),
    Fraction(FractionAllocMap),
}

impl AllocMap {
    /// Compute and commit a per-device assignment for `slots`.
    pub fn allocate(
        &mut self,
        slots: &ResourceSlot,
        affinity_hint: Option<&AffinityHint>,
        context_tag: Option<&str>,
    ) -> Result<DeviceAllocation> {
        match self {
            AllocMap::Discrete(map) => map.allocate(slots, affinity_hint, context_tag),
            AllocMap::Fraction(map) => map.allocate(slots, affinity_hint, context_tag),
        }
    }

    /// Replay a persisted allocation (agent restart, PREPARING recovery).
    pub fn apply_allocation(&mut self, existing: &DeviceAllocation) -> Result<()> {
        match self {
            AllocMap::Discrete(map) => map.pool_mut().apply_allocation(existing),
            AllocMap::Fraction(map) => map.pool_mut().apply_allocation(existing),
        }
    }

    /// Release a previously committed allocation.
    pub fn free(&mut self, existing: &DeviceAllocation) -> Result<()> {
        match self {
            AllocMap::Discrete(map) => map.pool_mut().free(existing),
            AllocMap::Fraction(map) => map.pool_mut().free(existing),
        }
    }

    pub fn allocations(&self) -> &DeviceAllocation {
        match self {
            AllocMap::Discrete(map) => &map.pool().allocations,
            AllocMap::Fraction(map) => &map.pool().allocations,
        }
    }

    pub fn device_slots(&self) -> &BTreeMap<DeviceId, DeviceSlotInfo> {
        match self {
            AllocMap::Discrete(map) => map.pool().device_slots(),
            AllocMap::Fraction(map) => map.pool().device_slots(),
        }
    }

    pub fn clear(&mut self) {
        match self {
            AllocMap::Discrete(map) => map.pool_mut().clear(),
            AllocMap::Fraction(map) => map.pool_mut().clear(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribute_spreads_the_remainder_forward() {
        let devs: Vec<DeviceId> = ["d0", "d1", "d2"].iter().map(|d| DeviceId::new(*d)).collect();
        let shares = distribute(7, &devs);
        assert_eq!(shares[&DeviceId::new("d0")], 3);
        assert_eq!(shares[&DeviceId::new("d1")], 2);
        assert_eq!(shares[&DeviceId::new("d2")], 2);
    }

    #[test]
    fn round_down_snaps_to_the_quantum() {
        let q: Decimal = "0.01".parse().unwrap();
        assert_eq!(round_down("0.756".parse().unwrap(), q), "0.75".parse().unwrap());
        assert_eq!(round_down("0.75".parse().unwrap(), q), "0.75".parse().unwrap());
        assert_eq!(round_down("0.009".parse().unwrap(), q), Decimal::ZERO);
    }

    #[test]
    fn interleave_round_robins_unequal_groups() {
        let merged = interleave(vec![vec![1, 2, 3], vec![10], vec![20, 21]]);
        assert_eq!(merged, vec![1, 10, 20, 2, 21, 3]);
    }
}
