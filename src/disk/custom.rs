//! Partition tables built from explicit blueprint disk customizations,
//! instead of from a named template.

use anyhow::{bail, Context, Result};
use rand::RngCore;

use super::{
    Btrfs, BtrfsSubvolume, Filesystem, FilesystemType, LvmVolumeGroup, Partition, PartitionTable,
    PartitionTableType, FILESYSTEM_DATA_GUID, LVM_PARTITION_GUID,
};
use crate::blueprint::{DiskCustomization, PartitionCustomization, PartitionKind};
use crate::datasizes::GIB;

fn parse_fs_type(fs_type: &Option<String>, default: FilesystemType) -> Result<FilesystemType> {
    match fs_type {
        None => Ok(default),
        Some(name) => name
            .parse()
            .with_context(|| format!("invalid filesystem type {name:?} in disk customization")),
    }
}

fn plain_partition(custom: &PartitionCustomization) -> Result<Partition> {
    let Some(mountpoint) = &custom.mountpoint else {
        bail!("plain partition customizations require a mountpoint");
    };
    let fs_type = parse_fs_type(&custom.fs_type, FilesystemType::Xfs)?;
    Ok(Partition {
        size: custom.minsize.map(|size| size.bytes()).unwrap_or(GIB),
        part_type: custom
            .part_type
            .clone()
            .unwrap_or_else(|| FILESYSTEM_DATA_GUID.to_string()),
        uuid: custom.part_uuid.clone().unwrap_or_default(),
        payload: Some(super::Payload::Filesystem(Filesystem {
            fs_type,
            label: custom.label.clone().unwrap_or_default(),
            mountpoint: mountpoint.clone(),
            fstab_options: "defaults".to_string(),
            ..Filesystem::default()
        })),
        ..Partition::default()
    })
}

fn lvm_partition(custom: &PartitionCustomization) -> Result<Partition> {
    let mut group = LvmVolumeGroup {
        name: custom.name.clone().unwrap_or_default(),
        ..LvmVolumeGroup::default()
    };
    if custom.logical_volumes.is_empty() {
        bail!("lvm partition customizations require at least one logical volume");
    }
    for volume in &custom.logical_volumes {
        let fs_type = parse_fs_type(&volume.fs_type, FilesystemType::Xfs)?;
        let filesystem = Filesystem {
            fs_type,
            label: volume.label.clone().unwrap_or_default(),
            mountpoint: volume.mountpoint.clone(),
            fstab_options: "defaults".to_string(),
            ..Filesystem::default()
        };
        let size = volume.minsize.map(|size| size.bytes()).unwrap_or(GIB);
        group.create_logical_volume(
            volume.name.as_deref().unwrap_or(""),
            size,
            super::Payload::Filesystem(filesystem),
        )?;
    }
    Ok(Partition {
        size: custom.minsize.map(|size| size.bytes()).unwrap_or(0),
        part_type: custom
            .part_type
            .clone()
            .unwrap_or_else(|| LVM_PARTITION_GUID.to_string()),
        uuid: custom.part_uuid.clone().unwrap_or_default(),
        payload: Some(super::Payload::Lvm(group)),
        ..Partition::default()
    })
}

fn btrfs_partition(custom: &PartitionCustomization) -> Result<Partition> {
    if custom.subvolumes.is_empty() {
        bail!("btrfs partition customizations require at least one subvolume");
    }
    let mut volume = Btrfs {
        label: custom.label.clone().unwrap_or_default(),
        ..Btrfs::default()
    };
    for subvolume in &custom.subvolumes {
        if subvolume.name.is_empty() {
            bail!("btrfs subvolume for {:?} has no name", subvolume.mountpoint);
        }
        volume.subvolumes.push(BtrfsSubvolume {
            name: subvolume.name.clone(),
            mountpoint: subvolume.mountpoint.clone(),
            ..BtrfsSubvolume::default()
        });
    }
    Ok(Partition {
        size: custom.minsize.map(|size| size.bytes()).unwrap_or(0),
        part_type: custom
            .part_type
            .clone()
            .unwrap_or_else(|| FILESYSTEM_DATA_GUID.to_string()),
        uuid: custom.part_uuid.clone().unwrap_or_default(),
        payload: Some(super::Payload::Btrfs(volume)),
        ..Partition::default()
    })
}

/// Build a partition table from an explicit blueprint layout. The result
/// still goes through the usual sizing, alignment, and identifier passes,
/// and must contain a root mountpoint somewhere.
pub fn custom_partition_table(
    custom: &DiskCustomization,
    boot_partitions: &[Partition],
    image_size: u64,
    rng: &mut dyn RngCore,
) -> Result<PartitionTable> {
    let table_type = match custom.table_type.as_deref() {
        None | Some("gpt") => PartitionTableType::Gpt,
        Some("dos") => PartitionTableType::Dos,
        Some(other) => bail!("unknown partition table type {other:?}"),
    };

    let mut table = PartitionTable {
        table_type,
        partitions: boot_partitions.to_vec(),
        ..PartitionTable::default()
    };
    for partition in &custom.partitions {
        let built = match partition.part_kind {
            PartitionKind::Plain => plain_partition(partition)?,
            PartitionKind::Lvm => lvm_partition(partition)?,
            PartitionKind::Btrfs => btrfs_partition(partition)?,
        };
        table.partitions.push(built);
    }

    if !table.contains_mountpoint("/") {
        bail!("disk customizations must place a root mountpoint");
    }
    let mountpoints = table.mountpoints();
    for (index, mountpoint) in mountpoints.iter().enumerate() {
        if mountpoints[..index].contains(mountpoint) {
            bail!("duplicate mountpoint {mountpoint:?} in disk customizations");
        }
    }

    let size = custom
        .minsize
        .map(|size| size.bytes())
        .unwrap_or(0)
        .max(image_size);
    table.relayout(size);
    table.generate_uuids(rng);
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::Blueprint;
    use crate::disk::templates;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn customization(toml: &str) -> DiskCustomization {
        Blueprint::from_toml(toml)
            .unwrap()
            .customizations()
            .disk
            .unwrap()
    }

    fn boot_partitions() -> Vec<Partition> {
        let template = templates::template(templates::TemplateKind::Plain);
        template.partitions[..3].to_vec()
    }

    #[test]
    fn test_custom_plain_layout() {
        let custom = customization(
            r#"
            [customizations.disk]
            minsize = "20 GiB"

            [[customizations.disk.partitions]]
            mountpoint = "/"
            fs_type = "ext4"
            minsize = "4 GiB"

            [[customizations.disk.partitions]]
            mountpoint = "/data"
            fs_type = "xfs"
            minsize = "2 GiB"
            label = "data"
            "#,
        );
        let mut rng = StdRng::seed_from_u64(13);
        let pt = custom_partition_table(&custom, &boot_partitions(), 0, &mut rng).unwrap();
        assert!(pt.size >= 20 * GIB);
        let data = pt.find_mountable("/data").unwrap();
        assert_eq!(data.label(), "data");
        assert_eq!(pt.find_mountable("/").unwrap().fs_type(), FilesystemType::Ext4);
    }

    #[test]
    fn test_custom_lvm_layout() {
        let custom = customization(
            r#"
            [[customizations.disk.partitions]]
            type = "lvm"
            name = "mainvg"

            [[customizations.disk.partitions.logical_volumes]]
            mountpoint = "/"
            minsize = "4 GiB"

            [[customizations.disk.partitions.logical_volumes]]
            mountpoint = "/var/log"
            minsize = "2 GiB"
            "#,
        );
        let mut rng = StdRng::seed_from_u64(13);
        let pt = custom_partition_table(&custom, &boot_partitions(), 8 * GIB, &mut rng).unwrap();
        assert!(pt.features().lvm);
        let mut lv_names = Vec::new();
        pt.for_each_entity(|entity, _| {
            if let crate::disk::EntityRef::LogicalVolume(lv) = entity {
                lv_names.push(lv.name.clone());
            }
        });
        assert_eq!(lv_names, vec!["rootlv".to_string(), "var_loglv".to_string()]);
    }

    #[test]
    fn test_custom_layout_requires_root() {
        let custom = customization(
            r#"
            [[customizations.disk.partitions]]
            mountpoint = "/data"
            "#,
        );
        let mut rng = StdRng::seed_from_u64(13);
        let err = custom_partition_table(&custom, &[], 0, &mut rng).unwrap_err();
        assert!(err.to_string().contains("root mountpoint"), "{err}");
    }

    #[test]
    fn test_custom_btrfs_layout() {
        let custom = customization(
            r#"
            [[customizations.disk.partitions]]
            type = "btrfs"

            [[customizations.disk.partitions.subvolumes]]
            name = "root"
            mountpoint = "/"

            [[customizations.disk.partitions.subvolumes]]
            name = "home"
            mountpoint = "/home"
            "#,
        );
        let mut rng = StdRng::seed_from_u64(13);
        let pt = custom_partition_table(&custom, &boot_partitions(), 5 * GIB, &mut rng).unwrap();
        assert!(pt.features().btrfs);
        assert!(pt.find_mountable("/home").is_some());
    }
}
