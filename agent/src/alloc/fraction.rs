//! Allocation map for quantum-aligned fractional shares (e.g. GPU
//! fractions).
//!
//! Quantities are decimals rounded down to the map's quantum. The EVENLY
//! strategy searches windows of most-free devices and scores each candidate
//! by `(evenness, -device_count, -fragmentation)`, where evenness is the
//! negated sum of absolute differences between adjacent sorted per-device
//! amounts and fragmentation counts devices whose final remainder is too
//! small to be useful (strictly between the quantum and `min_memory`).

use super::{round_down, AllocationStrategy, DeviceAllocation, DeviceSlotInfo, PoolState};
use crate::affinity::AffinityHint;
use crate::error::{ResourceError, Result};
use gridmesh_common::{DeviceId, ResourceSlot, SlotName};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;
use tracing::trace;

/// Granularity of the even-share computation (two decimal places).
const SHARE_SCALE: u32 = 2;

#[derive(Debug)]
pub struct FractionAllocMap {
    pool: PoolState,
    strategy: AllocationStrategy,
    quantum_size: Decimal,
    min_memory: Decimal,
}

struct Candidate {
    alloc: BTreeMap<DeviceId, Decimal>,
    score: (Decimal, i64, i64),
}

impl FractionAllocMap {
    pub fn new(
        device_slots: BTreeMap<DeviceId, DeviceSlotInfo>,
        strategy: AllocationStrategy,
        quantum_size: Decimal,
        device_mask: impl IntoIterator<Item = DeviceId>,
        exclusive_slot_types: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        Ok(Self {
            pool: PoolState::new(device_slots, device_mask, exclusive_slot_types)?,
            strategy,
            quantum_size,
            min_memory: Decimal::new(1, SHARE_SCALE),
        })
    }

    /// Per-device floor below which remaining capacity is unusable.
    pub fn with_min_memory(mut self, min_memory: Decimal) -> Self {
        self.min_memory = min_memory;
        self
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
        let mut raw = DeviceAllocation::new();
        for (slot_name, amount) in &requested {
            trace!(
                tag = context_tag.unwrap_or(""),
                slot = %slot_name,
                %amount,
                strategy = ?self.strategy,
                "allocating fractional slot"
            );
            let slot_allocation = match self.strategy {
                AllocationStrategy::Fill => {
                    self.compute_fill(slot_name, *amount, affinity_hint, &raw)?
                }
                AllocationStrategy::Evenly => {
                    self.compute_evenly(slot_name, *amount, affinity_hint, &raw)?
                }
            };
            raw.insert(slot_name.clone(), slot_allocation);
        }

        // Quantize toward zero. A positive request that vanishes entirely
        // at the quantum is an error, and nothing is committed.
        let mut actual = DeviceAllocation::new();
        for (slot_name, amount) in &requested {
            let mut quantized = BTreeMap::new();
            let mut total = Decimal::ZERO;
            if let Some(per_device) = raw.get(slot_name) {
                for (device_id, value) in per_device {
                    let aligned = round_down(*value, self.quantum_size);
                    if aligned > Decimal::ZERO {
                        total += aligned;
                        quantized.insert(device_id.clone(), aligned);
                    }
                }
            }
            if total == Decimal::ZERO && *amount > Decimal::ZERO {
                return Err(ResourceError::NotMultipleOfQuantum {
                    slot_name: slot_name.clone(),
                    requested: *amount,
                });
            }
            actual.insert(slot_name.clone(), quantized);
        }
        self.pool.commit(&actual);
        Ok(actual)
    }

    fn compute_fill(
        &self,
        slot_name: &SlotName,
        amount: Decimal,
        hint: Option<&AffinityHint>,
        partial: &DeviceAllocation,
    ) -> Result<BTreeMap<DeviceId, Decimal>> {
        let sorted = self.pool.sorted_candidates(hint, slot_name);
        let total_allocatable: Decimal = sorted
            .iter()
            .map(|(dev, current)| self.pool.capacity(dev) - *current)
            .sum();
        if total_allocatable < amount {
            return Err(ResourceError::InsufficientResource {
                slot_name: slot_name.clone(),
                requested: amount,
                total_allocatable,
                partial_allocation: partial.clone(),
            });
        }
        let mut slot_allocation = BTreeMap::new();
        let mut remaining = amount;
        for (device_id, current) in sorted {
            let allocatable = self.pool.capacity(&device_id) - current;
            if allocatable > Decimal::ZERO {
                let taken = remaining.min(allocatable);
                slot_allocation.insert(device_id, taken);
                remaining -= taken;
            }
            if remaining <= Decimal::ZERO {
                break;
            }
        }
        Ok(slot_allocation)
    }

    fn compute_evenly(
        &self,
        slot_name: &SlotName,
        amount: Decimal,
        hint: Option<&AffinityHint>,
        partial: &DeviceAllocation,
    ) -> Result<BTreeMap<DeviceId, Decimal>> {
        let min_memory = quantize(self.min_memory);
        let remaining = amount.normalize();

        // Devices whose remainder is below the usable floor are not
        // candidates at all.
        let sorted: Vec<(DeviceId, Decimal)> = self
            .pool
            .sorted_candidates(hint, slot_name)
            .into_iter()
            .filter(|(dev, current)| self.pool.capacity(dev) - *current >= min_memory)
            .collect();
        let free = |entry: &(DeviceId, Decimal)| self.pool.capacity(&entry.0) - entry.1;

        let total_allocatable: Decimal = sorted.iter().map(|e| free(e)).sum();
        if sorted.is_empty() || quantize(total_allocatable) < quantize(remaining) {
            return Err(ResourceError::InsufficientResource {
                slot_name: slot_name.clone(),
                requested: amount,
                total_allocatable,
                partial_allocation: partial.clone(),
            });
        }

        if remaining <= free(&sorted[0]) {
            // Fits on one device: take the smallest sufficient one, ties
            // broken by device id for determinism.
            let mut by_free = sorted.clone();
            by_free.sort_by(|a, b| free(a).cmp(&free(b)).then_with(|| a.0.cmp(&b.0)));
            let chosen = by_free
                .iter()
                .find(|entry| free(entry) >= remaining)
                .expect("a sufficient device exists when the largest one fits");
            let mut slot_allocation = BTreeMap::new();
            slot_allocation.insert(chosen.0.clone(), quantize(remaining));
            return Ok(slot_allocation);
        }

        // Smallest number of most-free devices whose combined free capacity
        // covers the request.
        let mut n_min = 0usize;
        let mut covered = Decimal::ZERO;
        for entry in &sorted {
            n_min += 1;
            covered += free(entry);
            if quantize(covered) >= quantize(remaining) {
                break;
            }
        }

        // Evenness never improves as the window slides toward less-free
        // devices, so each window size contributes its best candidate and
        // the search stops early once a window is perfectly even.
        let mut best_per_size: Vec<Candidate> = Vec::new();
        for n in n_min..=sorted.len() {
            let mut allocatable: Decimal = sorted[..n].iter().map(|e| free(e)).sum();
            let first = self.allocate_across(&sorted[..n], remaining);
            let max_evenness = measure_evenness(&first);
            let mut window_best = vec![self.candidate(slot_name, first, max_evenness, min_memory)];
            for idx in 1..=(sorted.len() - n) {
                allocatable -= free(&sorted[idx - 1]);
                allocatable += free(&sorted[idx + n - 1]);
                if quantize(allocatable) < quantize(remaining) {
                    break;
                }
                let alloc = self.allocate_across(&sorted[idx..idx + n], remaining);
                let evenness = measure_evenness(&alloc);
                if evenness < max_evenness {
                    break;
                }
                window_best.push(self.candidate(slot_name, alloc, evenness, min_memory));
            }
            let best = window_best
                .into_iter()
                .max_by(|a, b| a.score.cmp(&b.score))
                .expect("window candidate list is never empty");
            let short_circuit = max_evenness == Decimal::ZERO;
            best_per_size.push(best);
            if short_circuit {
                let winner = best_per_size.pop().expect("just pushed");
                return Ok(winner.alloc);
            }
        }
        let winner = best_per_size
            .into_iter()
            .max_by(|a, b| a.score.cmp(&b.score))
            .expect("n_min <= candidate count guarantees at least one window");
        Ok(winner.alloc)
    }

    /// Allocate `remaining` across exactly the given devices: devices too
    /// small for an even share are pinned at their full remainder, the rest
    /// split the residue evenly.
    fn allocate_across(
        &self,
        dev_allocs: &[(DeviceId, Decimal)],
        remaining: Decimal,
    ) -> BTreeMap<DeviceId, Decimal> {
        let mut slot_allocation = BTreeMap::new();
        let mut n = dev_allocs.len();
        let mut remaining = remaining;
        while n > 0 {
            // The tail of the window is the least-free device.
            let (device_id, current) = &dev_allocs[n - 1];
            let allocatable = self.pool.capacity(device_id) - *current;
            if allocatable >= remaining / Decimal::from(n as u64) {
                break;
            }
            slot_allocation.insert(device_id.clone(), quantize(allocatable));
            remaining -= allocatable;
            n -= 1;
        }
        if n > 0 {
            distribute_evenly(&dev_allocs[..n], remaining, &mut slot_allocation);
        }
        slot_allocation
    }

    fn candidate(
        &self,
        slot_name: &SlotName,
        alloc: BTreeMap<DeviceId, Decimal>,
        evenness: Decimal,
        min_memory: Decimal,
    ) -> Candidate {
        let fragmentation = alloc
            .iter()
            .filter(|&(device_id, value)| {
                let remainder = quantize(
                    self.pool.capacity(device_id) - self.pool.current(slot_name, device_id)
                        - *value,
                );
                self.quantum_size < remainder && remainder < min_memory
            })
            .count() as i64;
        let score = (evenness, -(alloc.len() as i64), -fragmentation);
        Candidate { alloc, score }
    }
}

fn quantize(value: Decimal) -> Decimal {
    value.round_dp(SHARE_SCALE)
}

/// Negated sum of absolute differences between adjacent sorted per-device
/// amounts; 0 is perfectly even.
fn measure_evenness(alloc: &BTreeMap<DeviceId, Decimal>) -> Decimal {
    let mut values: Vec<Decimal> = alloc.values().copied().collect();
    values.sort();
    let mut score = Decimal::ZERO;
    for pair in values.windows(2) {
        score += (pair[1] - pair[0]).abs();
    }
    -score
}

/// Give every device an equal quantized share and hand the sub-share
/// remainder out one step at a time, starting from the most-free device.
fn distribute_evenly(
    dev_allocs: &[(DeviceId, Decimal)],
    remaining: Decimal,
    slot_allocation: &mut BTreeMap<DeviceId, Decimal>,
) {
    let n = Decimal::from(dev_allocs.len() as u64);
    let step = Decimal::new(1, SHARE_SCALE);
    let share = (remaining / n).round_dp_with_strategy(SHARE_SCALE, RoundingStrategy::ToZero);
    for (device_id, _) in dev_allocs {
        slot_allocation.insert(device_id.clone(), share);
    }
    let leftover_steps = ((remaining - share * n) / step)
        .round()
        .to_i64()
        .unwrap_or(0);
    for (device_id, _) in dev_allocs.iter().take(leftover_steps.max(0) as usize) {
        if let Some(value) = slot_allocation.get_mut(device_id) {
            *value += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{device_slots, request};
    use super::*;
    use gridmesh_common::SlotTypes;

    fn gpu_map(capacities: &[(&str, &str)], strategy: AllocationStrategy) -> FractionAllocMap {
        FractionAllocMap::new(
            device_slots("cuda.shares", SlotTypes::Count, capacities),
            strategy,
            "0.01".parse().unwrap(),
            [],
            [],
        )
        .unwrap()
        .with_min_memory("0.10".parse().unwrap())
    }

    fn shares(alloc: &DeviceAllocation) -> Vec<(&str, Decimal)> {
        alloc[&SlotName::new("cuda.shares")]
            .iter()
            .map(|(dev, v)| (dev.as_str(), *v))
            .collect()
    }

    #[test]
    fn evenly_splits_across_two_gpus() {
        let mut map = gpu_map(&[("g0", "1.00"), ("g1", "1.00")], AllocationStrategy::Evenly);
        let result = map
            .allocate(&request(&[("cuda.shares", "1.50")]), None, None)
            .unwrap();
        assert_eq!(
            shares(&result),
            vec![("g0", "0.75".parse().unwrap()), ("g1", "0.75".parse().unwrap())]
        );
    }

    #[test]
    fn evenly_prefers_a_single_sufficient_device() {
        let mut map = gpu_map(&[("g0", "1.00"), ("g1", "1.00")], AllocationStrategy::Evenly);
        let result = map
            .allocate(&request(&[("cuda.shares", "0.80")]), None, None)
            .unwrap();
        assert_eq!(shares(&result), vec![("g0", "0.80".parse().unwrap())]);
    }

    #[test]
    fn evenly_picks_the_smallest_device_that_fits() {
        let mut map = gpu_map(&[("g0", "1.00"), ("g1", "0.50")], AllocationStrategy::Evenly);
        let result = map
            .allocate(&request(&[("cuda.shares", "0.40")]), None, None)
            .unwrap();
        assert_eq!(shares(&result), vec![("g1", "0.40".parse().unwrap())]);
    }

    #[test]
    fn evenly_pins_small_devices_and_splits_the_rest() {
        let mut map = gpu_map(
            &[("g0", "1.00"), ("g1", "1.00"), ("g2", "0.20")],
            AllocationStrategy::Evenly,
        );
        let result = map
            .allocate(&request(&[("cuda.shares", "2.10")]), None, None)
            .unwrap();
        assert_eq!(
            shares(&result),
            vec![
                ("g0", "0.95".parse().unwrap()),
                ("g1", "0.95".parse().unwrap()),
                ("g2", "0.20".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn evenly_skips_devices_below_the_memory_floor() {
        let mut map = gpu_map(&[("g0", "1.00"), ("g1", "0.05")], AllocationStrategy::Evenly);
        let err = map
            .allocate(&request(&[("cuda.shares", "1.02")]), None, None)
            .unwrap_err();
        assert!(matches!(err, ResourceError::InsufficientResource { .. }));
    }

    #[test]
    fn fill_concentrates_on_the_most_free_device() {
        let mut map = gpu_map(&[("g0", "1.00"), ("g1", "1.00")], AllocationStrategy::Fill);
        let result = map
            .allocate(&request(&[("cuda.shares", "1.50")]), None, None)
            .unwrap();
        assert_eq!(
            shares(&result),
            vec![("g0", "1.00".parse().unwrap()), ("g1", "0.50".parse().unwrap())]
        );
    }

    #[test]
    fn sub_quantum_requests_are_rejected_without_committing() {
        let mut map = gpu_map(&[("g0", "1.00")], AllocationStrategy::Fill);
        let err = map
            .allocate(&request(&[("cuda.shares", "0.005")]), None, None)
            .unwrap_err();
        assert!(matches!(err, ResourceError::NotMultipleOfQuantum { .. }));
        assert_eq!(
            map.pool().allocations[&SlotName::new("cuda.shares")][&DeviceId::new("g0")],
            Decimal::ZERO
        );
    }

    #[test]
    fn free_restores_the_prior_state() {
        let mut map = gpu_map(&[("g0", "1.00"), ("g1", "1.00")], AllocationStrategy::Evenly);
        let before = map.pool().allocations.clone();
        let result = map
            .allocate(&request(&[("cuda.shares", "1.50")]), None, None)
            .unwrap();
        map.pool_mut().free(&result).unwrap();
        assert_eq!(map.pool().allocations, before);
    }

    #[test]
    fn replay_beyond_capacity_is_fatal() {
        let mut map = gpu_map(&[("g0", "1.00")], AllocationStrategy::Fill);
        let mut existing = DeviceAllocation::new();
        existing
            .entry(SlotName::new("cuda.shares"))
            .or_default()
            .insert(DeviceId::new("g0"), "1.50".parse().unwrap());
        let err = map.pool_mut().apply_allocation(&existing).unwrap_err();
        assert!(matches!(err, ResourceError::Internal { .. }));
        assert_eq!(
            map.pool().allocations[&SlotName::new("cuda.shares")][&DeviceId::new("g0")],
            Decimal::ZERO
        );
    }
}
