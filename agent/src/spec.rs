//! The persistent per-kernel allocation record.
//!
//! A `KernelResourceSpec` is written to the container's config volume as a
//! line-oriented `resource.txt` and read back on manager or agent restart
//! to replay allocations, so containers survive orchestrator restarts with
//! their device assignments intact.
//!
//! ```text
//! SCRATCH_SIZE=1024m
//! MOUNTS=/data/model:/home/work/model:ro
//! SLOTS={"cpu":"4","cuda.shares":"1.50","mem":"8589934592"}
//! UNIFIED_DEVICES=[["cuda","cuda.shares"]]
//! CPU_SHARES=0:2,1:2
//! CUDA.SHARES_SHARES=gpu-0:1.00,gpu-1:0.50
//! MEM_SHARES=root:8g
//! ```
//!
//! Parsing tolerates blank lines, trailing whitespace, arbitrary key
//! ordering, and `*_SHARES` lines for slots this process does not know;
//! unknown share lines are kept verbatim so a newer agent's record is not
//! destroyed by an older manager.

use crate::alloc::DeviceAllocation;
use crate::error::{ResourceError, Result};
use gridmesh_common::{BinarySize, DeviceId, DeviceName, ResourceSlot, SlotName, SlotTypes};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountPerm {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for MountPerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountPerm::ReadOnly => f.write_str("ro"),
            MountPerm::ReadWrite => f.write_str("rw"),
        }
    }
}

/// One vfolder mount, serialized as `source:target:perm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub perm: MountPerm,
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.target, self.perm)
    }
}

impl FromStr for Mount {
    type Err = ResourceError;

    fn from_str(raw: &str) -> Result<Self> {
        let mut parts = raw.rsplitn(2, ':');
        let perm_raw = parts
            .next()
            .ok_or_else(|| ResourceError::spec_format(format!("bad mount entry: {raw:?}")))?;
        let rest = parts
            .next()
            .ok_or_else(|| ResourceError::spec_format(format!("bad mount entry: {raw:?}")))?;
        let (source, target) = rest
            .split_once(':')
            .ok_or_else(|| ResourceError::spec_format(format!("bad mount entry: {raw:?}")))?;
        let perm = match perm_raw {
            "ro" => MountPerm::ReadOnly,
            "rw" => MountPerm::ReadWrite,
            other => {
                return Err(ResourceError::spec_format(format!(
                    "bad mount permission {other:?} in {raw:?}"
                )))
            }
        };
        Ok(Mount {
            source: source.to_owned(),
            target: target.to_owned(),
            perm,
        })
    }
}

/// The round-trippable per-kernel allocation artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KernelResourceSpec {
    /// The original user-requested slot totals.
    pub slots: ResourceSlot,
    /// Concrete per-device allocations grouped by device class.
    pub allocations: BTreeMap<DeviceName, DeviceAllocation>,
    /// Scratch disk size in bytes.
    pub scratch_disk_size: u64,
    /// Mounted vfolders.
    pub mounts: Vec<Mount>,
    /// Devices mounted as a unified view, `(device_name, slot_name)` pairs.
    pub unified_devices: Vec<(DeviceName, SlotName)>,
}

impl KernelResourceSpec {
    /// Serialize to the `resource.txt` format. Bytes-typed slots render
    /// with binary suffixes, everything else as plain decimals.
    pub fn write_to_string(
        &self,
        known_slot_types: &BTreeMap<SlotName, SlotTypes>,
    ) -> Result<String> {
        let mut out = String::new();
        out.push_str(&format!("SCRATCH_SIZE={}\n", BinarySize(self.scratch_disk_size)));
        let mounts: Vec<String> = self.mounts.iter().map(|m| m.to_string()).collect();
        out.push_str(&format!("MOUNTS={}\n", mounts.join(",")));
        let slot_strings: BTreeMap<String, String> = self
            .slots
            .iter()
            .map(|(k, v)| (k.to_string(), v.normalize().to_string()))
            .collect();
        out.push_str(&format!(
            "SLOTS={}\n",
            serde_json::to_string(&slot_strings)
                .map_err(|e| ResourceError::spec_format(e.to_string()))?
        ));
        out.push_str(&format!(
            "UNIFIED_DEVICES={}\n",
            serde_json::to_string(&self.unified_devices)
                .map_err(|e| ResourceError::spec_format(e.to_string()))?
        ));
        for (device_name, slots) in &self.allocations {
            for (slot_name, per_device_alloc) in slots {
                if !(slot_name.as_str() == device_name.as_str()
                    || slot_name
                        .as_str()
                        .starts_with(&format!("{device_name}.")))
                {
                    return Err(ResourceError::spec_format(format!(
                        "device name {device_name} is not a prefix of slot name {slot_name}"
                    )));
                }
                let mut pieces = Vec::with_capacity(per_device_alloc.len());
                for (device_id, alloc) in per_device_alloc {
                    match known_slot_types.get(slot_name) {
                        Some(SlotTypes::Bytes) => {
                            let bytes = alloc.to_u64().ok_or_else(|| {
                                ResourceError::spec_format(format!(
                                    "bytes-typed allocation {alloc} for {slot_name} is not a \
                                     whole byte count"
                                ))
                            })?;
                            pieces.push(format!("{device_id}:{}", BinarySize(bytes)));
                        }
                        _ => pieces.push(format!("{device_id}:{}", alloc.normalize())),
                    }
                }
                out.push_str(&format!(
                    "{}_SHARES={}\n",
                    slot_name.as_str().to_uppercase(),
                    pieces.join(",")
                ));
            }
        }
        Ok(out)
    }

    /// Parse the `resource.txt` format.
    pub fn read_from_string(
        text: &str,
        known_slot_types: &BTreeMap<SlotName, SlotTypes>,
    ) -> Result<KernelResourceSpec> {
        let mut kvpairs: BTreeMap<String, String> = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            kvpairs.insert(key.to_owned(), value.to_owned());
        }
        let required = |key: &str| {
            kvpairs
                .get(key)
                .cloned()
                .ok_or_else(|| ResourceError::spec_format(format!("missing {key} line")))
        };

        let mut allocations: BTreeMap<DeviceName, DeviceAllocation> = BTreeMap::new();
        for (key, value) in &kvpairs {
            let Some(upper_slot) = key.strip_suffix("_SHARES") else {
                continue;
            };
            let slot_name = SlotName::new(upper_slot.to_lowercase());
            let device_name = slot_name.device_name();
            let mut per_device_alloc: BTreeMap<DeviceId, Decimal> = BTreeMap::new();
            for entry in value.split(',') {
                let Some((raw_dev_id, raw_alloc)) = entry.split_once(':') else {
                    continue;
                };
                if raw_dev_id.is_empty() || raw_alloc.is_empty() {
                    continue;
                }
                let alloc = match known_slot_types.get(&slot_name) {
                    Some(SlotTypes::Bytes) => {
                        let size: BinarySize = raw_alloc.parse().map_err(|_| {
                            ResourceError::spec_format(format!(
                                "bad bytes amount {raw_alloc:?} for {slot_name}"
                            ))
                        })?;
                        Decimal::from(size.as_u64())
                    }
                    Some(_) => raw_alloc.parse::<Decimal>().map_err(|_| {
                        ResourceError::spec_format(format!(
                            "bad amount {raw_alloc:?} for {slot_name}"
                        ))
                    })?,
                    None => {
                        // A record written by a newer agent may carry slot
                        // types this process has never seen.
                        warn!(slot = %slot_name, "unknown slot type in resource spec, keeping raw");
                        match raw_alloc.parse::<Decimal>() {
                            Ok(v) => v,
                            Err(_) => continue,
                        }
                    }
                };
                per_device_alloc.insert(DeviceId::new(raw_dev_id), alloc);
            }
            allocations
                .entry(device_name)
                .or_default()
                .insert(slot_name, per_device_alloc);
        }

        let mut mounts = Vec::new();
        for entry in required("MOUNTS")?.split(',') {
            if entry.is_empty() {
                continue;
            }
            mounts.push(entry.parse()?);
        }
        let slot_strings: BTreeMap<String, String> =
            serde_json::from_str(&required("SLOTS")?)
                .map_err(|e| ResourceError::spec_format(format!("bad SLOTS json: {e}")))?;
        let mut slots = ResourceSlot::new();
        for (name, value) in slot_strings {
            let parsed = value.parse::<Decimal>().map_err(|_| {
                ResourceError::spec_format(format!("bad slot amount {value:?} for {name}"))
            })?;
            slots.insert(SlotName::new(name), parsed);
        }
        let unified_devices: Vec<(DeviceName, SlotName)> = match kvpairs.get("UNIFIED_DEVICES") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .map_err(|e| ResourceError::spec_format(format!("bad UNIFIED_DEVICES json: {e}")))?,
            _ => Vec::new(),
        };
        let scratch_disk_size = required("SCRATCH_SIZE")?
            .parse::<BinarySize>()
            .map_err(|_| ResourceError::spec_format("bad SCRATCH_SIZE value"))?
            .as_u64();
        Ok(KernelResourceSpec {
            slots,
            allocations,
            scratch_disk_size,
            mounts,
            unified_devices,
        })
    }

    /// All per-slot allocations flattened to the shape `apply_allocation`
    /// consumes.
    pub fn flattened_allocations(&self) -> DeviceAllocation {
        let mut flat = DeviceAllocation::new();
        for per_slot in self.allocations.values() {
            for (slot_name, per_device) in per_slot {
                let cells = flat.entry(slot_name.clone()).or_default();
                for (device_id, value) in per_device {
                    *cells.entry(device_id.clone()).or_insert(Decimal::ZERO) += *value;
                }
            }
        }
        flat
    }

    /// JSON view with humanized byte values, for status surfaces.
    pub fn to_json(
        &self,
        known_slot_types: &BTreeMap<SlotName, SlotTypes>,
    ) -> Result<serde_json::Value> {
        let humanize = |slot_name: &SlotName, value: &Decimal| -> String {
            match known_slot_types.get(slot_name) {
                Some(SlotTypes::Bytes) => match value.to_u64() {
                    Some(bytes) => BinarySize(bytes).to_string(),
                    None => value.normalize().to_string(),
                },
                _ => value.normalize().to_string(),
            }
        };
        let slots: BTreeMap<String, String> = self
            .slots
            .iter()
            .map(|(k, v)| (k.to_string(), humanize(k, v)))
            .collect();
        let mut allocations = serde_json::Map::new();
        for (device_name, per_slot) in &self.allocations {
            let mut slot_map = serde_json::Map::new();
            for (slot_name, per_device) in per_slot {
                let device_map: serde_json::Map<String, serde_json::Value> = per_device
                    .iter()
                    .map(|(dev, v)| (dev.to_string(), humanize(slot_name, v).into()))
                    .collect();
                slot_map.insert(slot_name.to_string(), device_map.into());
            }
            allocations.insert(device_name.to_string(), slot_map.into());
        }
        Ok(serde_json::json!({
            "slots": slots,
            "allocations": allocations,
            "scratch_disk_size": BinarySize(self.scratch_disk_size).to_string(),
            "mounts": self.mounts.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
            "unified_devices": self.unified_devices,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> BTreeMap<SlotName, SlotTypes> {
        [
            (SlotName::new("cpu"), SlotTypes::Count),
            (SlotName::new("mem"), SlotTypes::Bytes),
            (SlotName::new("cuda.shares"), SlotTypes::Count),
        ]
        .into_iter()
        .collect()
    }

    fn sample_spec() -> KernelResourceSpec {
        let mut cpu_alloc = BTreeMap::new();
        cpu_alloc.insert(DeviceId::new("0"), Decimal::from(2));
        cpu_alloc.insert(DeviceId::new("1"), Decimal::from(2));
        let mut mem_alloc = BTreeMap::new();
        mem_alloc.insert(DeviceId::new("root"), Decimal::from(8u64 << 30));
        let mut cuda_alloc = BTreeMap::new();
        cuda_alloc.insert(DeviceId::new("gpu-0"), "1.00".parse().unwrap());
        cuda_alloc.insert(DeviceId::new("gpu-1"), "0.50".parse().unwrap());

        let mut allocations: BTreeMap<DeviceName, DeviceAllocation> = BTreeMap::new();
        allocations
            .entry(DeviceName::new("cpu"))
            .or_default()
            .insert(SlotName::new("cpu"), cpu_alloc);
        allocations
            .entry(DeviceName::new("mem"))
            .or_default()
            .insert(SlotName::new("mem"), mem_alloc);
        allocations
            .entry(DeviceName::new("cuda"))
            .or_default()
            .insert(SlotName::new("cuda.shares"), cuda_alloc);

        let mut slots = ResourceSlot::new();
        slots.insert(SlotName::new("cpu"), Decimal::from(4));
        slots.insert(SlotName::new("mem"), Decimal::from(8u64 << 30));
        slots.insert(SlotName::new("cuda.shares"), "1.50".parse().unwrap());

        KernelResourceSpec {
            slots,
            allocations,
            scratch_disk_size: 1 << 30,
            mounts: vec![Mount {
                source: "/data/model".into(),
                target: "/home/work/model".into(),
                perm: MountPerm::ReadOnly,
            }],
            unified_devices: vec![(DeviceName::new("cuda"), SlotName::new("cuda.shares"))],
        }
    }

    #[test]
    fn round_trips_through_the_text_format() {
        let spec = sample_spec();
        let text = spec.write_to_string(&known()).unwrap();
        let parsed = KernelResourceSpec::read_from_string(&text, &known()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn bytes_slots_render_with_binary_suffixes() {
        let text = sample_spec().write_to_string(&known()).unwrap();
        assert!(text.contains("MEM_SHARES=root:8g"));
        assert!(text.contains("SCRATCH_SIZE=1g"));
    }

    #[test]
    fn parsing_tolerates_noise_and_ordering() {
        let text = "\n\nSLOTS={\"cpu\":\"2\"}\n# not a kv line\nMOUNTS=\n  \nCPU_SHARES=0:2  \nSCRATCH_SIZE=512m\n";
        let parsed = KernelResourceSpec::read_from_string(text, &known()).unwrap();
        assert_eq!(parsed.scratch_disk_size, 512 << 20);
        assert!(parsed.mounts.is_empty());
        assert_eq!(
            parsed.allocations[&DeviceName::new("cpu")][&SlotName::new("cpu")]
                [&DeviceId::new("0")],
            Decimal::from(2)
        );
    }

    #[test]
    fn unknown_share_lines_are_kept() {
        let text =
            "SCRATCH_SIZE=0\nMOUNTS=\nSLOTS={}\nWARP.SHARES_SHARES=w-0:3.50\n";
        let parsed = KernelResourceSpec::read_from_string(text, &known()).unwrap();
        assert_eq!(
            parsed.allocations[&DeviceName::new("warp")][&SlotName::new("warp.shares")]
                [&DeviceId::new("w-0")],
            "3.50".parse().unwrap()
        );
    }

    #[test]
    fn missing_required_lines_fail() {
        let err = KernelResourceSpec::read_from_string("MOUNTS=\n", &known()).unwrap_err();
        assert!(matches!(err, ResourceError::SpecFormat { .. }));
    }

    #[test]
    fn mount_round_trip() {
        let mount: Mount = "/a/b:/c:rw".parse().unwrap();
        assert_eq!(mount.to_string(), "/a/b:/c:rw");
        assert!("noperm".parse::<Mount>().is_err());
    }
}
