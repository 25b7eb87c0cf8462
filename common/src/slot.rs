//! The `ResourceSlot` algebra.
//!
//! A `ResourceSlot` maps slot names (`cpu`, `mem`, `cuda.shares`, ...) to
//! non-negative decimal quantities. It supports componentwise addition and
//! subtraction and the partial order used everywhere in scheduling: `a`
//! covers `b` iff for every key appearing in either map, `a[k] >= b[k]`
//! with missing keys read as zero.

use crate::bytes::BinarySize;
use crate::error::{CommonError, Result};
use crate::types::SlotName;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Classification of a slot dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotTypes {
    /// Integer-like unit counts (cpu cores, whole devices).
    Count,
    /// Byte quantities (memory, disk), rendered with binary suffixes.
    Bytes,
    /// Exactly one unit per allocation (exclusive whole-device slots).
    Unique,
}

impl fmt::Display for SlotTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotTypes::Count => f.write_str("count"),
            SlotTypes::Bytes => f.write_str("bytes"),
            SlotTypes::Unique => f.write_str("unique"),
        }
    }
}

/// How a resource policy treats slots it does not mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DefaultForUnspecified {
    #[default]
    Unlimited,
    Limited,
}

/// An ordered slot-name -> quantity mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ResourceSlot(BTreeMap<SlotName, Decimal>);

impl ResourceSlot {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// The quantity for `name`, zero when absent.
    pub fn get(&self, name: &SlotName) -> Decimal {
        self.0.get(name).copied().unwrap_or(Decimal::ZERO)
    }

    /// The quantity for `name`, or `default` when absent. Used by agent
    /// selectors to substitute the +/-infinity sentinels.
    pub fn get_or(&self, name: &SlotName, default: Decimal) -> Decimal {
        self.0.get(name).copied().unwrap_or(default)
    }

    pub fn insert(&mut self, name: SlotName, value: Decimal) {
        self.0.insert(name, value);
    }

    pub fn contains(&self, name: &SlotName) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SlotName, &Decimal)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SlotName> {
        self.0.keys()
    }

    /// Ensure every key of `other` exists in `self` (inserted as zero).
    pub fn sync_keys(&mut self, other: &ResourceSlot) {
        for key in other.0.keys() {
            self.0.entry(key.clone()).or_insert(Decimal::ZERO);
        }
    }

    /// Componentwise partial order: `self` covers `other` iff every key in
    /// either map satisfies `self[k] >= other[k]`.
    pub fn covers(&self, other: &ResourceSlot) -> bool {
        self.0
            .keys()
            .chain(other.0.keys())
            .all(|key| self.get(key) >= other.get(key))
    }

    /// Sum of many slot maps, used to compute fleet-wide capacity.
    pub fn sum<'a>(items: impl IntoIterator<Item = &'a ResourceSlot>) -> ResourceSlot {
        let mut total = ResourceSlot::new();
        for item in items {
            total += item.clone();
        }
        total
    }

    /// Expand a resource policy's limit map over all known slots. Slots the
    /// policy does not mention default to unlimited or zero depending on
    /// `default_for_unspecified`.
    pub fn from_policy(
        limits: &BTreeMap<SlotName, Decimal>,
        known_slot_types: &BTreeMap<SlotName, SlotTypes>,
        default_for_unspecified: DefaultForUnspecified,
    ) -> ResourceSlot {
        let mut slots = ResourceSlot::new();
        for name in known_slot_types.keys() {
            let value = match limits.get(name) {
                Some(v) => *v,
                None => match default_for_unspecified {
                    DefaultForUnspecified::Unlimited => Decimal::MAX,
                    DefaultForUnspecified::Limited => Decimal::ZERO,
                },
            };
            slots.insert(name.clone(), value);
        }
        slots
    }

    /// Reject slot names not present in the registry snapshot.
    pub fn validate(&self, known_slot_types: &BTreeMap<SlotName, SlotTypes>) -> Result<()> {
        for name in self.0.keys() {
            if !known_slot_types.contains_key(name) {
                return Err(CommonError::UnknownSlotName { name: name.clone() });
            }
        }
        Ok(())
    }

    /// Render for log and error messages, with bytes-typed slots shown in
    /// binary units.
    pub fn humanize(&self, known_slot_types: &BTreeMap<SlotName, SlotTypes>) -> String {
        let mut parts = Vec::with_capacity(self.0.len());
        for (name, value) in &self.0 {
            match known_slot_types.get(name) {
                Some(SlotTypes::Bytes) => {
                    let raw = value.to_u64().unwrap_or(u64::MAX);
                    parts.push(format!("{}={}", name, BinarySize(raw)));
                }
                _ => parts.push(format!("{}={}", name, value)),
            }
        }
        parts.join(" ")
    }
}

impl FromIterator<(SlotName, Decimal)> for ResourceSlot {
    fn from_iter<I: IntoIterator<Item = (SlotName, Decimal)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl AddAssign for ResourceSlot {
    fn add_assign(&mut self, rhs: ResourceSlot) {
        for (key, value) in rhs.0 {
            *self.0.entry(key).or_insert(Decimal::ZERO) += value;
        }
    }
}

impl Add for ResourceSlot {
    type Output = ResourceSlot;

    fn add(mut self, rhs: ResourceSlot) -> ResourceSlot {
        self += rhs;
        self
    }
}

impl SubAssign for ResourceSlot {
    fn sub_assign(&mut self, rhs: ResourceSlot) {
        for (key, value) in rhs.0 {
            *self.0.entry(key).or_insert(Decimal::ZERO) -= value;
        }
    }
}

impl Sub for ResourceSlot {
    type Output = ResourceSlot;

    fn sub(mut self, rhs: ResourceSlot) -> ResourceSlot {
        self -= rhs;
        self
    }
}

impl fmt::Display for ResourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", name, value)?;
            first = false;
        }
        Ok(())
    }
}
