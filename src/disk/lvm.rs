//! LVM volume groups and logical volumes.

use anyhow::{bail, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{align_to, Filesystem, FilesystemType, Payload};
use crate::datasizes::MIB;

/// Default physical extent size: logical volumes are aligned to this.
pub const LVM_EXTENT_SIZE: u64 = 4 * MIB;

/// Round a size up to the LVM physical extent.
pub fn align_extent(size: u64) -> u64 {
    align_to(size, LVM_EXTENT_SIZE)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LvmVolumeGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub logical_volumes: Vec<LvmLogicalVolume>,
}

impl LvmVolumeGroup {
    /// Space reserved for LVM2 metadata. The defaults put the start of the
    /// first physical extent at 1 MiB.
    pub fn metadata_size(&self) -> u64 {
        MIB
    }

    /// Minimum bytes needed to hold all logical volumes plus metadata,
    /// aligned to the physical extent.
    pub fn min_size(&self) -> u64 {
        let volumes: u64 = self.logical_volumes.iter().map(|lv| lv.size).sum();
        align_extent(volumes + self.metadata_size())
    }

    /// Create a logical volume. An empty `name` derives one from the
    /// payload's mountpoint, disambiguated against existing volumes.
    pub fn create_logical_volume(
        &mut self,
        name: &str,
        size: u64,
        payload: Payload,
    ) -> Result<&mut LvmLogicalVolume> {
        let name = if name.is_empty() {
            let base = match &payload {
                Payload::Filesystem(fs) if !fs.mountpoint.is_empty() => fs.mountpoint.clone(),
                Payload::Swap(_) => "swap".to_string(),
                other => bail!(
                    "cannot create logical volume: no name provided and payload {:?} has no mountpoint",
                    other.payload_type()
                ),
            };
            self.gen_lv_name(&base)?
        } else {
            name.to_string()
        };

        self.logical_volumes.push(LvmLogicalVolume {
            name,
            size: align_extent(size),
            payload: Some(payload),
        });
        Ok(self.logical_volumes.last_mut().expect("just pushed"))
    }

    /// Create a logical volume carrying a filesystem for `mountpoint`.
    pub fn create_mountpoint(
        &mut self,
        mountpoint: &str,
        size: u64,
        fs_type: FilesystemType,
    ) -> Result<&mut LvmLogicalVolume> {
        let filesystem = Filesystem {
            fs_type,
            mountpoint: mountpoint.to_string(),
            fstab_options: "defaults".to_string(),
            ..Filesystem::default()
        };
        self.create_logical_volume("", size, Payload::Filesystem(filesystem))
    }

    fn gen_lv_name(&self, base: &str) -> Result<String> {
        let base = lvname(base);
        let taken: Vec<&str> = self
            .logical_volumes
            .iter()
            .map(|lv| lv.name.as_str())
            .collect();

        if !taken.contains(&base.as_str()) {
            return Ok(base);
        }
        // e.g. '/home/test' and '/home_test' collide after sanitizing
        for counter in 0..100 {
            let candidate = format!("{base}{counter:02}");
            if !taken.contains(&candidate.as_str()) {
                return Ok(candidate);
            }
        }
        bail!("name collision: exhausted all possible names for logical volume {base}");
    }
}

/// A name for a logical volume based on its mountpoint.
fn lvname(path: &str) -> String {
    if path == "/" {
        return "rootlv".to_string();
    }
    format!("{}lv", path.trim_start_matches('/').replace('/', "_"))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LvmLogicalVolume {
    pub name: String,
    pub size: u64,
    pub payload: Option<Payload>,
}

impl LvmLogicalVolume {
    /// Grow the volume to hold at least `size` bytes, aligned up to the
    /// physical extent. Returns whether it changed.
    pub fn ensure_size(&mut self, size: u64) -> bool {
        if size > self.size {
            self.size = align_extent(size);
            return true;
        }
        false
    }
}

#[derive(Serialize, Deserialize, Default)]
struct LogicalVolumeWire {
    #[serde(default)]
    name: String,
    #[serde(default, with = "crate::datasizes::bytes")]
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

impl Serialize for LvmLogicalVolume {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = LogicalVolumeWire {
            name: self.name.clone(),
            size: self.size,
            payload_type: self.payload.as_ref().map(|p| p.payload_type().to_string()),
            payload: self.payload.as_ref().map(|p| p.to_wire_value()),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LvmLogicalVolume {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = LogicalVolumeWire::deserialize(deserializer)?;
        let tag = wire.payload_type.unwrap_or_default();
        let payload = Payload::from_wire(&tag, wire.payload.unwrap_or(serde_json::Value::Null))
            .map_err(D::Error::custom)?;
        Ok(LvmLogicalVolume {
            name: wire.name,
            size: wire.size,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasizes::GIB;

    #[test]
    fn test_lvname() {
        assert_eq!(lvname("/"), "rootlv");
        assert_eq!(lvname("/var"), "varlv");
        assert_eq!(lvname("/var/log"), "var_loglv");
    }

    #[test]
    fn test_extent_alignment() {
        assert_eq!(align_extent(0), 0);
        assert_eq!(align_extent(1), LVM_EXTENT_SIZE);
        assert_eq!(align_extent(GIB), GIB);
        assert_eq!(align_extent(GIB + 1), GIB + LVM_EXTENT_SIZE);

        let mut lv = LvmLogicalVolume::default();
        assert!(lv.ensure_size(GIB + 1));
        assert_eq!(lv.size, GIB + LVM_EXTENT_SIZE);
    }

    #[test]
    fn test_lv_name_generation() {
        let mut vg = LvmVolumeGroup::default();
        let lv = vg
            .create_mountpoint("/", GIB, FilesystemType::Xfs)
            .unwrap();
        assert_eq!(lv.name, "rootlv");
        let lv = vg
            .create_mountpoint("/var/log", GIB, FilesystemType::Xfs)
            .unwrap();
        assert_eq!(lv.name, "var_loglv");
    }

    #[test]
    fn test_lv_name_collision_counter() {
        let mut vg = LvmVolumeGroup::default();
        vg.create_mountpoint("/home/test", GIB, FilesystemType::Xfs)
            .unwrap();
        // '/home_test' sanitizes to the same base as '/home/test'
        let lv = vg
            .create_mountpoint("/home_test", GIB, FilesystemType::Xfs)
            .unwrap();
        assert_eq!(lv.name, "home_testlv00");
    }

    #[test]
    fn test_lv_name_collision_exhaustion() {
        let mut vg = LvmVolumeGroup::default();
        vg.create_logical_volume("datalv", GIB, Payload::Filesystem(Filesystem::default()))
            .unwrap();
        for counter in 0..100 {
            vg.create_logical_volume(
                &format!("datalv{counter:02}"),
                GIB,
                Payload::Filesystem(Filesystem::default()),
            )
            .unwrap();
        }
        let err = vg
            .create_mountpoint("/data", GIB, FilesystemType::Xfs)
            .unwrap_err();
        assert!(err.to_string().contains("name collision"), "{err}");
    }

    #[test]
    fn test_vg_min_size() {
        let mut vg = LvmVolumeGroup::default();
        vg.create_mountpoint("/", GIB, FilesystemType::Xfs).unwrap();
        // 1 GiB volume + 1 MiB metadata, aligned to the 4 MiB extent
        assert_eq!(vg.min_size(), GIB + LVM_EXTENT_SIZE);
    }

    #[test]
    fn test_vg_round_trip() {
        let mut vg = LvmVolumeGroup {
            name: "rootvg".to_string(),
            ..LvmVolumeGroup::default()
        };
        vg.create_mountpoint("/", GIB, FilesystemType::Xfs).unwrap();
        let json = serde_json::to_string(&vg).unwrap();
        let parsed: LvmVolumeGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, vg);
    }
}
