//! Base partition-table templates.
//!
//! These are the layouts the planner starts from. They mirror the stock
//! RPM-distro layouts: a BIOS boot stub, an EFI system partition, a /boot
//! partition, and a root entity whose shape gives the template its name.
//! Partition identifiers are fixed so that bootloader configuration can
//! refer to them; filesystem UUIDs are left empty and drawn from the
//! caller's rng during planning.

use super::{
    Btrfs, BtrfsSubvolume, Filesystem, FilesystemType, LuksContainer, LvmLogicalVolume,
    LvmVolumeGroup, Partition, PartitionTable, PartitionTableType, Payload,
    BIOS_BOOT_PARTITION_GUID, BIOS_BOOT_PARTITION_UUID, EFI_FILESYSTEM_UUID,
    EFI_SYSTEM_PARTITION_GUID, EFI_SYSTEM_PARTITION_UUID, FILESYSTEM_DATA_GUID,
    FILESYSTEM_DATA_UUID, LVM_PARTITION_GUID, ROOT_PARTITION_UUID,
};
use crate::datasizes::{GIB, MIB};

/// The named base layouts shipped with the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Plain,
    PlainNoBoot,
    Luks,
    LuksLvm,
    Btrfs,
    AutoLvm,
}

fn bios_boot_partition() -> Partition {
    Partition {
        size: MIB,
        bootable: true,
        part_type: BIOS_BOOT_PARTITION_GUID.to_string(),
        uuid: BIOS_BOOT_PARTITION_UUID.to_string(),
        ..Partition::default()
    }
}

fn efi_partition() -> Partition {
    Partition {
        size: 200 * MIB,
        part_type: EFI_SYSTEM_PARTITION_GUID.to_string(),
        uuid: EFI_SYSTEM_PARTITION_UUID.to_string(),
        payload: Some(Payload::Filesystem(Filesystem {
            fs_type: FilesystemType::Vfat,
            uuid: EFI_FILESYSTEM_UUID.to_string(),
            label: "EFI-SYSTEM".to_string(),
            mountpoint: "/boot/efi".to_string(),
            fstab_options: "defaults,uid=0,gid=0,umask=077,shortname=winnt".to_string(),
            fstab_freq: 0,
            fstab_passno: 2,
        })),
        ..Partition::default()
    }
}

fn boot_partition() -> Partition {
    Partition {
        size: 500 * MIB,
        part_type: FILESYSTEM_DATA_GUID.to_string(),
        uuid: FILESYSTEM_DATA_UUID.to_string(),
        payload: Some(Payload::Filesystem(Filesystem {
            fs_type: FilesystemType::Xfs,
            label: "boot".to_string(),
            mountpoint: "/boot".to_string(),
            fstab_options: "defaults".to_string(),
            ..Filesystem::default()
        })),
        ..Partition::default()
    }
}

fn root_filesystem() -> Filesystem {
    Filesystem {
        fs_type: FilesystemType::Xfs,
        label: "root".to_string(),
        mountpoint: "/".to_string(),
        fstab_options: "defaults".to_string(),
        ..Filesystem::default()
    }
}

/// Build the base table for one of the named layouts.
pub fn template(kind: TemplateKind) -> PartitionTable {
    let root = match kind {
        TemplateKind::Plain | TemplateKind::PlainNoBoot => Partition {
            size: 2 * GIB,
            part_type: FILESYSTEM_DATA_GUID.to_string(),
            uuid: ROOT_PARTITION_UUID.to_string(),
            payload: Some(Payload::Filesystem(root_filesystem())),
            ..Partition::default()
        },
        TemplateKind::Luks => Partition {
            size: 2 * GIB,
            part_type: FILESYSTEM_DATA_GUID.to_string(),
            uuid: ROOT_PARTITION_UUID.to_string(),
            payload: Some(Payload::Luks(Box::new(LuksContainer {
                label: "crypt_root".to_string(),
                payload: Some(Box::new(Payload::Filesystem(root_filesystem()))),
                ..LuksContainer::default()
            }))),
            ..Partition::default()
        },
        TemplateKind::LuksLvm => Partition {
            size: 5 * GIB,
            part_type: FILESYSTEM_DATA_GUID.to_string(),
            uuid: ROOT_PARTITION_UUID.to_string(),
            payload: Some(Payload::Luks(Box::new(LuksContainer {
                label: "crypt_root".to_string(),
                payload: Some(Box::new(Payload::Lvm(LvmVolumeGroup {
                    name: "rootvg".to_string(),
                    description: String::new(),
                    logical_volumes: vec![
                        LvmLogicalVolume {
                            name: "rootlv".to_string(),
                            size: 2 * GIB,
                            payload: Some(Payload::Filesystem(root_filesystem())),
                        },
                        LvmLogicalVolume {
                            name: "homelv".to_string(),
                            size: 2 * GIB,
                            payload: Some(Payload::Filesystem(Filesystem {
                                fs_type: FilesystemType::Xfs,
                                label: "home".to_string(),
                                mountpoint: "/home".to_string(),
                                fstab_options: "defaults".to_string(),
                                ..Filesystem::default()
                            })),
                        },
                    ],
                }))),
                ..LuksContainer::default()
            }))),
            ..Partition::default()
        },
        TemplateKind::Btrfs => Partition {
            size: 10 * GIB,
            part_type: FILESYSTEM_DATA_GUID.to_string(),
            uuid: ROOT_PARTITION_UUID.to_string(),
            payload: Some(Payload::Btrfs(Btrfs {
                subvolumes: vec![
                    BtrfsSubvolume {
                        name: "root".to_string(),
                        mountpoint: "/".to_string(),
                        ..BtrfsSubvolume::default()
                    },
                    BtrfsSubvolume {
                        name: "var".to_string(),
                        mountpoint: "/var".to_string(),
                        size: 5 * GIB,
                        ..BtrfsSubvolume::default()
                    },
                ],
                ..Btrfs::default()
            })),
            ..Partition::default()
        },
        TemplateKind::AutoLvm => Partition {
            size: 2 * GIB,
            part_type: LVM_PARTITION_GUID.to_string(),
            uuid: ROOT_PARTITION_UUID.to_string(),
            payload: Some(Payload::Lvm(LvmVolumeGroup {
                name: "rootvg".to_string(),
                description: String::new(),
                logical_volumes: vec![LvmLogicalVolume {
                    name: "rootlv".to_string(),
                    size: 2 * GIB,
                    payload: Some(Payload::Filesystem(root_filesystem())),
                }],
            })),
            ..Partition::default()
        },
    };

    let mut partitions = vec![bios_boot_partition(), efi_partition()];
    if kind != TemplateKind::PlainNoBoot {
        partitions.push(boot_partition());
    }
    partitions.push(root);

    PartitionTable {
        table_type: PartitionTableType::Gpt,
        partitions,
        ..PartitionTable::default()
    }
}
