//! Partitions and their tagged-union payload encoding.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Payload, BIOS_BOOT_PARTITION_GUID, PREP_PARTITION_GUID};

/// A single partition in a partition table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    /// Start of the partition in bytes, assigned by layout.
    pub start: u64,
    /// Size of the partition in bytes.
    pub size: u64,
    /// Partition type: an MBR byte code (`83`) or a GPT type GUID.
    pub part_type: String,
    /// `Legacy BIOS bootable` (GPT) or `active` (DOS) flag.
    pub bootable: bool,
    /// Partition identifier. DOS tables use short ids, so this is a string.
    pub uuid: String,
    pub payload: Option<Payload>,
}

impl Partition {
    /// Grow the partition to at least `size`. Returns whether it changed.
    pub fn ensure_size(&mut self, size: u64) -> bool {
        if size > self.size {
            self.size = size;
            return true;
        }
        false
    }

    pub fn is_bios_boot(&self) -> bool {
        self.part_type == BIOS_BOOT_PARTITION_GUID
    }

    pub fn is_prep(&self) -> bool {
        self.part_type == "41" || self.part_type == PREP_PARTITION_GUID
    }
}

#[derive(Serialize, Deserialize, Default)]
struct PartitionWire {
    #[serde(default, with = "crate::datasizes::bytes")]
    start: u64,
    #[serde(default, with = "crate::datasizes::bytes")]
    size: u64,
    #[serde(default, rename = "type")]
    part_type: String,
    #[serde(default)]
    bootable: bool,
    #[serde(default)]
    uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

impl Serialize for Partition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = PartitionWire {
            start: self.start,
            size: self.size,
            part_type: self.part_type.clone(),
            bootable: self.bootable,
            uuid: self.uuid.clone(),
            payload_type: self.payload.as_ref().map(|p| p.payload_type().to_string()),
            payload: self.payload.as_ref().map(|p| p.to_wire_value()),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Partition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = PartitionWire::deserialize(deserializer)?;
        let tag = wire.payload_type.unwrap_or_default();
        let payload = Payload::from_wire(&tag, wire.payload.unwrap_or(serde_json::Value::Null))
            .map_err(D::Error::custom)?;
        Ok(Partition {
            start: wire.start,
            size: wire.size,
            part_type: wire.part_type,
            bootable: wire.bootable,
            uuid: wire.uuid,
            payload,
        })
    }
}
