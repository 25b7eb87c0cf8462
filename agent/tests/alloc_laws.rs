//! Property tests for the allocation maps: freeing a successful allocation
//! restores the exact prior state, and successful allocations never exceed
//! device capacity.

use gridmesh_agent::{
    AllocationStrategy, DeviceSlotInfo, DiscreteAllocMap, FractionAllocMap,
};
use gridmesh_common::{DeviceId, ResourceSlot, SlotName, SlotTypes};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

fn cpu_slots(capacities: &[u32]) -> BTreeMap<DeviceId, DeviceSlotInfo> {
    capacities
        .iter()
        .enumerate()
        .map(|(idx, cap)| {
            (
                DeviceId::new(format!("d{idx}")),
                DeviceSlotInfo {
                    slot_type: SlotTypes::Count,
                    slot_name: SlotName::new("cpu"),
                    capacity: Decimal::from(*cap),
                },
            )
        })
        .collect()
}

fn gpu_slots(capacities_centi: &[u32]) -> BTreeMap<DeviceId, DeviceSlotInfo> {
    capacities_centi
        .iter()
        .enumerate()
        .map(|(idx, cap)| {
            (
                DeviceId::new(format!("g{idx}")),
                DeviceSlotInfo {
                    slot_type: SlotTypes::Count,
                    slot_name: SlotName::new("cuda.shares"),
                    capacity: Decimal::new(i64::from(*cap), 2),
                },
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn discrete_free_cancels_allocate(
        capacities in proptest::collection::vec(1u32..16, 1..6),
        request in 1u32..64,
        evenly in any::<bool>(),
    ) {
        let strategy = if evenly {
            AllocationStrategy::Evenly
        } else {
            AllocationStrategy::Fill
        };
        let mut map = DiscreteAllocMap::new(cpu_slots(&capacities), strategy, [], []).unwrap();
        let slots: ResourceSlot =
            [(SlotName::new("cpu"), Decimal::from(request))].into_iter().collect();
        let before = map.allocations().clone();
        if let Ok(result) = map.allocate(&slots, None, None) {
            // Committed exactly what was requested, within capacity.
            let granted: Decimal = result[&SlotName::new("cpu")].values().copied().sum();
            prop_assert_eq!(granted, Decimal::from(request));
            for (dev, value) in map.allocations()[&SlotName::new("cpu")].iter() {
                let cap = Decimal::from(capacities[dev.as_str()[1..].parse::<usize>().unwrap()]);
                prop_assert!(*value <= cap);
            }
            map.free(&result).unwrap();
        }
        prop_assert_eq!(map.allocations(), &before);
    }

    #[test]
    fn fractional_free_cancels_allocate(
        capacities in proptest::collection::vec(10u32..200, 1..5),
        request_centi in 1u32..600,
        evenly in any::<bool>(),
    ) {
        let strategy = if evenly {
            AllocationStrategy::Evenly
        } else {
            AllocationStrategy::Fill
        };
        let mut map = FractionAllocMap::new(
            gpu_slots(&capacities),
            strategy,
            Decimal::new(1, 2),
            [],
            [],
        )
        .unwrap()
        .with_min_memory(Decimal::new(10, 2));
        let slots: ResourceSlot = [(
            SlotName::new("cuda.shares"),
            Decimal::new(i64::from(request_centi), 2),
        )]
        .into_iter()
        .collect();
        let before = map.allocations().clone();
        if let Ok(result) = map.allocate(&slots, None, None) {
            for (dev, value) in map.allocations()[&SlotName::new("cuda.shares")].iter() {
                let idx: usize = dev.as_str()[1..].parse().unwrap();
                prop_assert!(*value <= Decimal::new(i64::from(capacities[idx]), 2));
            }
            map.free(&result).unwrap();
        }
        prop_assert_eq!(map.allocations(), &before);
    }
}
