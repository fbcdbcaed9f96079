//! The disk entity tree.
//!
//! A partition table is a rooted tree of entities: partitions at the top,
//! with filesystems, swap areas, LUKS containers, LVM volume groups, and
//! btrfs volumes nested below them. The tree is pure data. It is built from
//! a template plus user customizations (see [`PartitionTable::plan`]),
//! cloned freely, serialized to JSON/YAML and back, and finally walked by
//! the manifest layer to emit mkfs/mount/device stages.
//!
//! Payloads form one closed sum ([`Payload`]); capabilities of the old
//! interface-heavy model (sizeable, mountable, fstab entity) are expressed
//! as methods and pattern matches. Traversal passes the ancestor chain to a
//! closure so callers can reconstruct device stacks without back-pointers.

mod btrfs;
mod custom;
mod luks;
mod lvm;
mod partition;
mod partition_table;
pub(crate) mod templates;

pub use btrfs::{Btrfs, BtrfsSubvolume};
pub use custom::custom_partition_table;
pub use luks::{Argon2id, ClevisBind, LuksContainer};
pub use lvm::{LvmLogicalVolume, LvmVolumeGroup, LVM_EXTENT_SIZE};
pub use partition::Partition;
pub use partition_table::{PartitionTable, PartitionTableType, PartitioningMode, TableFeatures};
pub use templates::{template, TemplateKind};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::datasizes::MIB;

/// Layout grain: partition starts and sizes are aligned up to this.
pub const DEFAULT_GRAIN: u64 = MIB;

/// Sector size assumed when a table does not specify one.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

// Well-known GPT partition type GUIDs.
pub const BIOS_BOOT_PARTITION_GUID: &str = "21686148-6449-6E6F-744E-656564454649";
pub const EFI_SYSTEM_PARTITION_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
pub const FILESYSTEM_DATA_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
pub const LVM_PARTITION_GUID: &str = "E6D6D379-F507-44C2-A23C-238F2A3DF928";
pub const PREP_PARTITION_GUID: &str = "9E1A2D38-C612-4316-AA26-8B49521E5A8B";
pub const SWAP_PARTITION_GUID: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";

// Fixed partition/filesystem identifiers used by the shipped templates.
pub const BIOS_BOOT_PARTITION_UUID: &str = "FAC7F1FB-3E8D-4137-A512-961DE09A5549";
pub const EFI_SYSTEM_PARTITION_UUID: &str = "68B2905B-DF3E-4FB3-80FA-49D1E773AA33";
pub const FILESYSTEM_DATA_UUID: &str = "CB07C243-BC44-4717-853E-28852021225B";
pub const ROOT_PARTITION_UUID: &str = "6264D520-3FB9-423F-8AB8-7A0A8E3D3562";
pub const EFI_FILESYSTEM_UUID: &str = "7B77-95E7";

/// Round `size` up to a multiple of `grain`. Zero stays zero.
pub(crate) fn align_to(size: u64, grain: u64) -> u64 {
    if size % grain != 0 {
        size + grain - size % grain
    } else {
        size
    }
}

/// Round `size` up to the default layout grain (1 MiB).
pub fn align_up(size: u64) -> u64 {
    align_to(size, DEFAULT_GRAIN)
}

/// The closed set of filesystems the compiler can place on an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Vfat,
    Ext4,
    Xfs,
    Btrfs,
    #[default]
    None,
}

impl FilesystemType {
    pub fn as_str(self) -> &'static str {
        match self {
            FilesystemType::Vfat => "vfat",
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Xfs => "xfs",
            FilesystemType::Btrfs => "btrfs",
            FilesystemType::None => "none",
        }
    }
}

impl std::str::FromStr for FilesystemType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vfat" => Ok(FilesystemType::Vfat),
            "ext4" => Ok(FilesystemType::Ext4),
            "xfs" => Ok(FilesystemType::Xfs),
            "btrfs" => Ok(FilesystemType::Btrfs),
            "none" | "" => Ok(FilesystemType::None),
            other => bail!("unsupported filesystem type: {other}"),
        }
    }
}

/// A plain filesystem on a partition, LUKS container, or logical volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filesystem {
    #[serde(rename = "type")]
    pub fs_type: FilesystemType,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub mountpoint: String,
    #[serde(default)]
    pub fstab_options: String,
    #[serde(default)]
    pub fstab_freq: u64,
    #[serde(default)]
    pub fstab_passno: u64,
}

impl Filesystem {
    pub fn fstab_row(&self) -> FstabRow {
        FstabRow {
            fs_spec: format!("UUID={}", self.uuid),
            fs_file: self.mountpoint.clone(),
            fs_vfstype: self.fs_type.as_str().to_string(),
            fs_mntops: self.fstab_options.clone(),
            fs_freq: self.fstab_freq,
            fs_passno: self.fstab_passno,
        }
    }
}

/// A swap area. Its fstab `fs_file` is the literal string `none`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub fstab_options: String,
}

impl Swap {
    pub fn fstab_row(&self) -> FstabRow {
        FstabRow {
            fs_spec: format!("UUID={}", self.uuid),
            fs_file: "none".to_string(),
            fs_vfstype: "swap".to_string(),
            fs_mntops: self.fstab_options.clone(),
            fs_freq: 0,
            fs_passno: 0,
        }
    }
}

/// Raw content copied verbatim from another pipeline's artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub source_pipeline: String,
    pub source_path: String,
}

/// One row of /etc/fstab (or the equivalent systemd mount unit input).
#[derive(Debug, Clone, PartialEq)]
pub struct FstabRow {
    pub fs_spec: String,
    pub fs_file: String,
    pub fs_vfstype: String,
    pub fs_mntops: String,
    pub fs_freq: u64,
    pub fs_passno: u64,
}

/// Payload of a partition, LUKS container, or logical volume.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Filesystem(Filesystem),
    Swap(Swap),
    Luks(Box<LuksContainer>),
    Lvm(LvmVolumeGroup),
    Btrfs(Btrfs),
    Raw(RawPayload),
}

impl Payload {
    /// The tag used for the serialized tagged-union encoding.
    pub fn payload_type(&self) -> &'static str {
        match self {
            Payload::Filesystem(_) => "filesystem",
            Payload::Swap(_) => "swap",
            Payload::Luks(_) => "luks",
            Payload::Lvm(_) => "lvm",
            Payload::Btrfs(_) => "btrfs",
            Payload::Raw(_) => "raw",
        }
    }

    pub(crate) fn to_wire_value(&self) -> serde_json::Value {
        let result = match self {
            Payload::Filesystem(fs) => serde_json::to_value(fs),
            Payload::Swap(swap) => serde_json::to_value(swap),
            Payload::Luks(luks) => serde_json::to_value(luks),
            Payload::Lvm(vg) => serde_json::to_value(vg),
            Payload::Btrfs(btrfs) => serde_json::to_value(btrfs),
            Payload::Raw(raw) => serde_json::to_value(raw),
        };
        result.expect("payload serialization cannot fail")
    }

    /// Decode a tagged payload. `no-payload` and an empty tag mean "absent".
    /// Unknown tags are configuration errors.
    pub(crate) fn from_wire(tag: &str, value: serde_json::Value) -> Result<Option<Payload>> {
        let payload = match tag {
            "" | "no-payload" => return Ok(None),
            "filesystem" => Payload::Filesystem(serde_json::from_value(value)?),
            "swap" => Payload::Swap(serde_json::from_value(value)?),
            "luks" => Payload::Luks(Box::new(serde_json::from_value(value)?)),
            "lvm" => Payload::Lvm(serde_json::from_value(value)?),
            "btrfs" => Payload::Btrfs(serde_json::from_value(value)?),
            "raw" => Payload::Raw(serde_json::from_value(value)?),
            other => bail!("unknown payload type: {other}"),
        };
        Ok(Some(payload))
    }

    /// Minimum number of bytes required to hold this payload and all of its
    /// sizeable descendants, including container metadata.
    pub fn min_size(&self) -> u64 {
        match self {
            Payload::Filesystem(_) | Payload::Swap(_) | Payload::Raw(_) => 0,
            Payload::Luks(luks) => {
                let inner = luks.payload.as_ref().map(|p| p.min_size()).unwrap_or(0);
                luks.metadata_size() + inner
            }
            Payload::Lvm(vg) => vg.min_size(),
            Payload::Btrfs(btrfs) => btrfs.subvolumes.iter().map(|sv| sv.size).sum(),
        }
    }

    pub(crate) fn visit<'a>(
        &'a self,
        ancestors: &mut Vec<Ancestor<'a>>,
        visit: &mut dyn FnMut(EntityRef<'a>, &[Ancestor<'a>]),
    ) {
        match self {
            Payload::Filesystem(fs) => visit(EntityRef::Filesystem(fs), ancestors),
            Payload::Swap(swap) => visit(EntityRef::Swap(swap), ancestors),
            Payload::Raw(raw) => visit(EntityRef::Raw(raw), ancestors),
            Payload::Luks(luks) => {
                visit(EntityRef::Luks(luks), ancestors);
                if let Some(inner) = &luks.payload {
                    ancestors.push(Ancestor::Luks(luks));
                    inner.visit(ancestors, visit);
                    ancestors.pop();
                }
            }
            Payload::Lvm(vg) => {
                visit(EntityRef::VolumeGroup(vg), ancestors);
                ancestors.push(Ancestor::VolumeGroup(vg));
                for lv in &vg.logical_volumes {
                    visit(EntityRef::LogicalVolume(lv), ancestors);
                    if let Some(inner) = &lv.payload {
                        ancestors.push(Ancestor::LogicalVolume { group: vg, volume: lv });
                        inner.visit(ancestors, visit);
                        ancestors.pop();
                    }
                }
                ancestors.pop();
            }
            Payload::Btrfs(btrfs) => {
                visit(EntityRef::BtrfsVolume(btrfs), ancestors);
                for subvolume in &btrfs.subvolumes {
                    ancestors.push(Ancestor::BtrfsVolume(btrfs));
                    visit(EntityRef::Subvolume { volume: btrfs, subvolume }, ancestors);
                    ancestors.pop();
                }
            }
        }
    }
}

/// Borrowed view of one entity during traversal.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef<'a> {
    Partition(&'a Partition),
    Filesystem(&'a Filesystem),
    Swap(&'a Swap),
    Luks(&'a LuksContainer),
    VolumeGroup(&'a LvmVolumeGroup),
    LogicalVolume(&'a LvmLogicalVolume),
    BtrfsVolume(&'a Btrfs),
    Subvolume {
        volume: &'a Btrfs,
        subvolume: &'a BtrfsSubvolume,
    },
    Raw(&'a RawPayload),
}

impl<'a> EntityRef<'a> {
    /// The mountable view of this entity, if it has one.
    pub fn as_mountable(&self) -> Option<Mountable<'a>> {
        match *self {
            EntityRef::Filesystem(fs) if !fs.mountpoint.is_empty() => {
                Some(Mountable::Filesystem(fs))
            }
            EntityRef::Subvolume { volume, subvolume } if !subvolume.mountpoint.is_empty() => {
                Some(Mountable::Subvolume { volume, subvolume })
            }
            _ => None,
        }
    }
}

/// Ancestor breadcrumb handed to traversal closures, innermost last.
#[derive(Debug, Clone, Copy)]
pub enum Ancestor<'a> {
    Partition {
        index: usize,
        partition: &'a Partition,
    },
    Luks(&'a LuksContainer),
    VolumeGroup(&'a LvmVolumeGroup),
    LogicalVolume {
        group: &'a LvmVolumeGroup,
        volume: &'a LvmLogicalVolume,
    },
    BtrfsVolume(&'a Btrfs),
}

/// An entity that carries a mountpoint.
#[derive(Debug, Clone, Copy)]
pub enum Mountable<'a> {
    Filesystem(&'a Filesystem),
    Subvolume {
        volume: &'a Btrfs,
        subvolume: &'a BtrfsSubvolume,
    },
}

impl<'a> Mountable<'a> {
    pub fn mountpoint(&self) -> &'a str {
        match *self {
            Mountable::Filesystem(fs) => &fs.mountpoint,
            Mountable::Subvolume { subvolume, .. } => &subvolume.mountpoint,
        }
    }

    pub fn fs_type(&self) -> FilesystemType {
        match self {
            Mountable::Filesystem(fs) => fs.fs_type,
            Mountable::Subvolume { .. } => FilesystemType::Btrfs,
        }
    }

    /// Filesystem UUID; subvolumes report their volume's UUID.
    pub fn uuid(&self) -> &'a str {
        match *self {
            Mountable::Filesystem(fs) => &fs.uuid,
            Mountable::Subvolume { volume, .. } => &volume.uuid,
        }
    }

    pub fn label(&self) -> &'a str {
        match *self {
            Mountable::Filesystem(fs) => &fs.label,
            Mountable::Subvolume { volume, .. } => &volume.label,
        }
    }

    pub fn fstab_row(&self) -> Result<FstabRow> {
        match self {
            Mountable::Filesystem(fs) => Ok(fs.fstab_row()),
            Mountable::Subvolume { volume, subvolume } => {
                let options = subvolume.mount_options()?;
                Ok(FstabRow {
                    fs_spec: format!("UUID={}", volume.uuid),
                    fs_file: subvolume.mountpoint.clone(),
                    fs_vfstype: "btrfs".to_string(),
                    fs_mntops: options,
                    fs_freq: 0,
                    fs_passno: 0,
                })
            }
        }
    }
}

/// An entity that contributes a row to fstab (or a mount/swap unit).
#[derive(Debug, Clone, Copy)]
pub enum FstabEntity<'a> {
    Mountable(Mountable<'a>),
    Swap(&'a Swap),
}

impl<'a> FstabEntity<'a> {
    pub fn fstab_row(&self) -> Result<FstabRow> {
        match self {
            FstabEntity::Mountable(mountable) => mountable.fstab_row(),
            FstabEntity::Swap(swap) => Ok(swap.fstab_row()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up_boundaries() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), DEFAULT_GRAIN);
        assert_eq!(align_up(DEFAULT_GRAIN - 1), DEFAULT_GRAIN);
        assert_eq!(align_up(DEFAULT_GRAIN), DEFAULT_GRAIN);
        assert_eq!(align_up(DEFAULT_GRAIN / 2), DEFAULT_GRAIN);
        assert_eq!(align_up(DEFAULT_GRAIN + 1), 2 * DEFAULT_GRAIN);
    }

    #[test]
    fn test_payload_tags() {
        let fs = Payload::Filesystem(Filesystem::default());
        assert_eq!(fs.payload_type(), "filesystem");
        assert!(Payload::from_wire("no-payload", serde_json::Value::Null)
            .unwrap()
            .is_none());
        assert!(Payload::from_wire("", serde_json::Value::Null)
            .unwrap()
            .is_none());
        assert!(Payload::from_wire("mystery", serde_json::Value::Null).is_err());
    }

    #[test]
    fn test_swap_fstab_row() {
        let swap = Swap {
            uuid: "some-uuid".to_string(),
            label: String::new(),
            fstab_options: "defaults".to_string(),
        };
        let row = swap.fstab_row();
        assert_eq!(row.fs_file, "none");
        assert_eq!(row.fs_vfstype, "swap");
        assert_eq!(row.fs_spec, "UUID=some-uuid");
    }

    #[test]
    fn test_filesystem_type_parse() {
        assert_eq!("xfs".parse::<FilesystemType>().unwrap(), FilesystemType::Xfs);
        assert_eq!("".parse::<FilesystemType>().unwrap(), FilesystemType::None);
        assert!("zfs".parse::<FilesystemType>().is_err());
    }
}
