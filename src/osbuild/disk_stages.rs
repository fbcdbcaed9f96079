//! Stage, device, and mount generation from a partition table.
//!
//! These walk the disk entity tree and emit the declarative plumbing the
//! executor needs to create, format, and populate a partitioned image file
//! inside the build chroot.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::Serialize;

use super::{
    new_fstab_stage, new_loopback_device, new_luks_device, new_lvm_lv_device,
    new_systemd_unit_create_stage, new_truncate_stage, Device, Devices, FstabEntryOptions,
    FstabStageOptions, Grub2Core, Grub2InstStageOptions, Grub2Prefix, Mount, Stage,
    SystemdUnitCreateStageOptions,
};
use crate::disk::{
    Ancestor, EntityRef, FilesystemType, Mountable, PartitionTable, PartitionTableType,
};
use crate::fsnode::FileNode;

/// A loopback device covering the whole image file.
fn new_loopback_device_whole(filename: &str) -> Device {
    Device {
        device_type: "org.osbuild.loopback".to_string(),
        parent: None,
        options: serde_json::json!({ "filename": filename, "lock": true }),
    }
}

/// Sanitize a mountpoint into a device/mount name: `/` becomes `root`,
/// inner slashes become dashes.
fn path_name(mountpoint: &str) -> String {
    if mountpoint == "/" {
        return "root".to_string();
    }
    mountpoint.trim_start_matches('/').replace('/', "-")
}

/// The mount type string for a filesystem: `org.osbuild.<fs>`, with vfat
/// mapped to `fat`.
fn mount_fs_name(fs_type: FilesystemType) -> &'static str {
    match fs_type {
        FilesystemType::Vfat => "fat",
        FilesystemType::Ext4 => "ext4",
        FilesystemType::Xfs => "xfs",
        FilesystemType::Btrfs => "btrfs",
        FilesystemType::None => "none",
    }
}

/// Build the device chain for an entity from its ancestors. Returns the
/// devices map and the name of the innermost device, which carries the
/// entity itself.
fn entity_device_chain(
    filename: &str,
    pt: &PartitionTable,
    ancestors: &[Ancestor<'_>],
    base: &str,
) -> (Devices, String) {
    let mut devices = Devices::new();

    let Some(Ancestor::Partition { index, partition }) = ancestors.first() else {
        panic!("entity without a partition ancestor; this is a programming error");
    };
    let start = pt.bytes_to_sectors(partition.start);
    let size = pt.bytes_to_sectors(partition.size);

    let mut luks = None;
    let mut logical_volume = None;
    for ancestor in &ancestors[1..] {
        match ancestor {
            Ancestor::Luks(container) => luks = Some(*container),
            Ancestor::LogicalVolume { volume, .. } => logical_volume = Some(*volume),
            _ => {}
        }
    }

    // intermediate devices are keyed by partition index so that entities
    // sharing a partition share the device entries
    let loopback_name = if luks.is_some() || logical_volume.is_some() {
        format!("disk-{index}")
    } else {
        base.to_string()
    };
    devices.insert(
        loopback_name.clone(),
        new_loopback_device(filename, start, size),
    );

    let mut innermost = loopback_name;
    if let Some(container) = luks {
        let name = if logical_volume.is_some() {
            format!("luks-{index}")
        } else {
            base.to_string()
        };
        devices.insert(name.clone(), new_luks_device(&innermost, &container.passphrase));
        innermost = name;
    }
    if let Some(volume) = logical_volume {
        devices.insert(
            base.to_string(),
            new_lvm_lv_device(&innermost, &volume.name),
        );
        innermost = base.to_string();
    }
    (devices, innermost)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SfdiskStageOptions {
    pub label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    pub partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SfdiskPartition {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub bootable: bool,
    pub start: u64,
    pub size: u64,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub part_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
}

fn sfdisk_options(pt: &PartitionTable) -> SfdiskStageOptions {
    let label = match pt.table_type {
        PartitionTableType::Gpt => "gpt",
        _ => "dos",
    };
    SfdiskStageOptions {
        label: label.to_string(),
        uuid: pt.uuid.clone(),
        partitions: pt
            .partitions
            .iter()
            .map(|partition| SfdiskPartition {
                bootable: partition.bootable,
                start: pt.bytes_to_sectors(partition.start),
                size: pt.bytes_to_sectors(partition.size),
                part_type: partition.part_type.clone(),
                uuid: partition.uuid.clone(),
            })
            .collect(),
    }
}

/// Stages that create the image file, write the partition table, and
/// format every entity: truncate, sfdisk, then one format stage per
/// formatted entity in tree order.
pub fn gen_image_prepare_stages(pt: &PartitionTable, filename: &str) -> Vec<Stage> {
    let mut stages = Vec::new();

    stages.push(new_truncate_stage(filename, pt.size));

    let sfdisk_devices: Devices = BTreeMap::from([(
        "device".to_string(),
        new_loopback_device_whole(filename),
    )]);
    stages.push(
        Stage::new("org.osbuild.sfdisk", sfdisk_options(pt)).with_devices(sfdisk_devices),
    );

    stages.extend(gen_mkfs_stages(pt, filename));
    stages
}

/// Per-entity format stages: mkfs.*, mkswap, luks2.format, lvm2.create.
pub fn gen_mkfs_stages(pt: &PartitionTable, filename: &str) -> Vec<Stage> {
    let mut stages = Vec::new();
    pt.for_each_entity(|entity, ancestors| {
        let stage = match entity {
            EntityRef::Filesystem(fs) => {
                if fs.fs_type == FilesystemType::None {
                    return;
                }
                let (devices, _) = entity_device_chain(filename, pt, ancestors, "device");
                let options = match fs.fs_type {
                    FilesystemType::Vfat => serde_json::json!({
                        "volid": fs.uuid.replace('-', ""),
                        "label": fs.label,
                    }),
                    _ => {
                        let mut options = serde_json::Map::new();
                        options.insert("uuid".to_string(), serde_json::json!(fs.uuid));
                        if !fs.label.is_empty() {
                            options.insert("label".to_string(), serde_json::json!(fs.label));
                        }
                        serde_json::Value::Object(options)
                    }
                };
                let stage_type = match fs.fs_type {
                    FilesystemType::Vfat => "org.osbuild.mkfs.fat",
                    FilesystemType::Ext4 => "org.osbuild.mkfs.ext4",
                    FilesystemType::Xfs => "org.osbuild.mkfs.xfs",
                    FilesystemType::Btrfs => "org.osbuild.mkfs.btrfs",
                    FilesystemType::None => unreachable!(),
                };
                Some(Stage::new(stage_type, options).with_devices(devices))
            }
            EntityRef::Swap(swap) => {
                let (devices, _) = entity_device_chain(filename, pt, ancestors, "device");
                let mut options = serde_json::Map::new();
                options.insert("uuid".to_string(), serde_json::json!(swap.uuid));
                if !swap.label.is_empty() {
                    options.insert("label".to_string(), serde_json::json!(swap.label));
                }
                Some(
                    Stage::new("org.osbuild.mkswap", serde_json::Value::Object(options))
                        .with_devices(devices),
                )
            }
            EntityRef::Luks(container) => {
                let (devices, _) = entity_device_chain(filename, pt, ancestors, "device");
                let mut options = serde_json::Map::new();
                options.insert(
                    "passphrase".to_string(),
                    serde_json::json!(container.passphrase),
                );
                options.insert("uuid".to_string(), serde_json::json!(container.uuid));
                if !container.label.is_empty() {
                    options.insert("label".to_string(), serde_json::json!(container.label));
                }
                if !container.cipher.is_empty() {
                    options.insert("cipher".to_string(), serde_json::json!(container.cipher));
                }
                options.insert(
                    "pbkdf".to_string(),
                    serde_json::json!({
                        "method": "argon2id",
                        "iterations": container.pbkdf.iterations,
                        "memory": container.pbkdf.memory,
                        "parallelism": container.pbkdf.parallelism,
                    }),
                );
                Some(
                    Stage::new("org.osbuild.luks2.format", serde_json::Value::Object(options))
                        .with_devices(devices),
                )
            }
            EntityRef::VolumeGroup(group) => {
                let (devices, _) = entity_device_chain(filename, pt, ancestors, "device");
                let volumes: Vec<serde_json::Value> = group
                    .logical_volumes
                    .iter()
                    .map(|lv| {
                        serde_json::json!({
                            "name": lv.name,
                            "size": format!("{}B", lv.size),
                        })
                    })
                    .collect();
                Some(
                    Stage::new(
                        "org.osbuild.lvm2.create",
                        serde_json::json!({ "volumes": volumes }),
                    )
                    .with_devices(devices),
                )
            }
            EntityRef::BtrfsVolume(volume) => {
                let (devices, _) = entity_device_chain(filename, pt, ancestors, "device");
                let subvolumes: Vec<serde_json::Value> = volume
                    .subvolumes
                    .iter()
                    .map(|sv| serde_json::json!({ "name": sv.name }))
                    .collect();
                let mut options = serde_json::Map::new();
                options.insert("uuid".to_string(), serde_json::json!(volume.uuid));
                if !volume.label.is_empty() {
                    options.insert("label".to_string(), serde_json::json!(volume.label));
                }
                options.insert("subvolumes".to_string(), serde_json::json!(subvolumes));
                Some(
                    Stage::new("org.osbuild.mkfs.btrfs", serde_json::Value::Object(options))
                        .with_devices(devices),
                )
            }
            _ => None,
        };
        if let Some(stage) = stage {
            stages.push(stage);
        }
    });
    stages
}

/// Devices and mounts covering every mountable in the table, root first.
/// These are attached to stages that operate on the assembled image.
pub fn gen_fs_devices_mounts(pt: &PartitionTable, filename: &str) -> (Devices, Vec<Mount>) {
    let mut devices = Devices::new();
    let mut mounts: Vec<(String, Mount)> = Vec::new();

    pt.for_each_mountable(|mountable, ancestors| {
        let mountpoint = mountable.mountpoint().to_string();
        let base = path_name(&mountpoint);
        let (chain, innermost) = entity_device_chain(filename, pt, ancestors, &base);
        devices.extend(chain);
        let mount = match mountable {
            Mountable::Filesystem(fs) => super::new_fs_mount(
                mount_fs_name(fs.fs_type),
                &base,
                &innermost,
                &mountpoint,
            ),
            Mountable::Subvolume { subvolume, .. } => {
                super::new_btrfs_mount(&base, &innermost, &mountpoint, &subvolume.name)
            }
        };
        mounts.push((mountpoint, mount));
    });

    // parents must be mounted before children
    mounts.sort_by(|a, b| a.0.cmp(&b.0));
    (devices, mounts.into_iter().map(|(_, mount)| mount).collect())
}

/// Devices and mounts for bootupd-style stages. The partition table must
/// carry `/boot` and `/boot/efi`; bootupd writes into both.
pub fn gen_bootupd_devices_mounts(
    pt: &PartitionTable,
    filename: &str,
) -> Result<(Devices, Vec<Mount>)> {
    for required in ["/boot", "/boot/efi"] {
        if !pt.contains_mountpoint(required) {
            bail!("bootupd requires a mounted {required} partition in the partition table");
        }
    }
    Ok(gen_fs_devices_mounts(pt, filename))
}

/// Finishing stages run after the tree is copied in: deterministic LVM
/// metadata for tables with volume groups.
pub fn gen_image_finish_stages(pt: &PartitionTable, filename: &str) -> Vec<Stage> {
    let mut stages = Vec::new();
    pt.for_each_entity(|entity, ancestors| {
        if let EntityRef::VolumeGroup(group) = entity {
            let (devices, _) = entity_device_chain(filename, pt, ancestors, "device");
            stages.push(
                Stage::new(
                    "org.osbuild.lvm2.metadata",
                    serde_json::json!({
                        "vg_name": group.name,
                        "creation_host": "osbuild",
                        "description": "Built with osbuild",
                    }),
                )
                .with_devices(devices),
            );
        }
    });
    stages
}

/// The grub2 core install stage for BIOS-bootable disk images.
pub fn gen_grub2_inst_stage(pt: &PartitionTable, filename: &str, platform: &str) -> Result<Stage> {
    let bios_boot = pt
        .partitions
        .iter()
        .find(|partition| partition.is_bios_boot());
    let Some(bios_boot) = bios_boot else {
        bail!("grub2 core installation requires a BIOS boot partition");
    };

    // prefix partition: /boot when present, the root partition otherwise
    let (prefix_path, prefix_mountpoint) = if pt.contains_mountpoint("/boot") {
        ("/grub2", "/boot")
    } else {
        ("/boot/grub2", "/")
    };
    let mut prefix_number = None;
    let mut core_filesystem = FilesystemType::None;
    pt.for_each_mountable(|mountable, ancestors| {
        if mountable.mountpoint() == prefix_mountpoint {
            if let Some(Ancestor::Partition { index, .. }) = ancestors.first() {
                prefix_number = Some(*index as u64);
                core_filesystem = mountable.fs_type();
            }
        }
    });
    let Some(number) = prefix_number else {
        bail!("grub2 core installation requires a {prefix_mountpoint} partition");
    };

    let label = match pt.table_type {
        PartitionTableType::Gpt => "gpt",
        _ => "dos",
    };
    Ok(super::new_grub2_inst_stage(&Grub2InstStageOptions {
        filename: filename.to_string(),
        platform: platform.to_string(),
        location: pt.bytes_to_sectors(bios_boot.start),
        core: Grub2Core {
            core_type: "mkimage".to_string(),
            partlabel: label.to_string(),
            filesystem: mount_fs_name(core_filesystem).to_string(),
        },
        prefix: Grub2Prefix {
            prefix_type: "partition".to_string(),
            partlabel: label.to_string(),
            number,
            path: prefix_path.to_string(),
        },
    }))
}

/// The fstab stage for the table.
pub fn gen_fstab_stage(pt: &PartitionTable) -> Result<Stage> {
    let mut entries = Vec::new();
    let mut failure = None;
    pt.for_each_fstab_entity(|entity, _| {
        match entity.fstab_row() {
            Ok(row) => entries.push(FstabEntryOptions {
                uuid: row.fs_spec.trim_start_matches("UUID=").to_string(),
                vfs_type: row.fs_vfstype,
                path: row.fs_file,
                options: row.fs_mntops,
                freq: row.fs_freq,
                pass_no: row.fs_passno,
            }),
            Err(err) => failure = Some(err),
        };
    });
    if let Some(err) = failure {
        return Err(err);
    }
    // root first, then by path; swap rows ("none") sort last
    entries.sort_by(|a, b| {
        (a.path != "/", a.path.clone()).cmp(&(b.path != "/", b.path.clone()))
    });
    Ok(new_fstab_stage(&FstabStageOptions {
        filesystems: entries,
    }))
}

/// Escape a path the way systemd unit names do.
fn systemd_escape_path(path: &str) -> String {
    if path == "/" {
        return "-".to_string();
    }
    path.trim_matches('/')
        .split('/')
        .map(|part| part.replace('-', "\\x2d"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Mount and swap units instead of fstab; returns the unit-create stages
/// plus a systemd stage enabling them.
pub fn gen_systemd_mount_stages(pt: &PartitionTable) -> Result<Vec<Stage>> {
    let mut stages = Vec::new();
    let mut unit_names = Vec::new();
    let mut failure = None;

    let mut rows = Vec::new();
    pt.for_each_fstab_entity(|entity, _| match entity.fstab_row() {
        Ok(row) => rows.push(row),
        Err(err) => failure = Some(err),
    });
    if let Some(err) = failure {
        return Err(err);
    }
    rows.sort_by(|a, b| (a.fs_file != "/", a.fs_file.clone()).cmp(&(b.fs_file != "/", b.fs_file.clone())));

    for row in rows {
        let what = format!(
            "/dev/disk/by-uuid/{}",
            row.fs_spec.trim_start_matches("UUID=")
        );
        if row.fs_vfstype == "swap" {
            let filename = format!("{}.swap", systemd_escape_path(&what));
            stages.push(new_systemd_unit_create_stage(&SystemdUnitCreateStageOptions {
                filename: filename.clone(),
                unit_type: "system".to_string(),
                unit_path: "usr".to_string(),
                config: serde_json::json!({
                    "Unit": { "Description": "swap" },
                    "Swap": { "What": what, "Options": row.fs_mntops },
                    "Install": { "WantedBy": ["swap.target"] },
                }),
            }));
            unit_names.push(filename);
            continue;
        }
        let filename = format!("{}.mount", systemd_escape_path(&row.fs_file));
        stages.push(new_systemd_unit_create_stage(&SystemdUnitCreateStageOptions {
            filename: filename.clone(),
            unit_type: "system".to_string(),
            unit_path: "usr".to_string(),
            config: serde_json::json!({
                "Unit": { "Description": format!("mount {}", row.fs_file) },
                "Mount": {
                    "What": what,
                    "Where": row.fs_file,
                    "Type": row.fs_vfstype,
                    "Options": row.fs_mntops,
                },
                "Install": { "WantedBy": ["local-fs.target"] },
            }),
        }));
        unit_names.push(filename);
    }

    stages.push(Stage::new(
        "org.osbuild.systemd",
        serde_json::json!({ "enabled_services": unit_names }),
    ));
    Ok(stages)
}

/// Kernel command-line fragments derived from the partition table: the root
/// filesystem UUID plus filesystem-specific options.
pub fn gen_image_kernel_options(pt: &PartitionTable) -> Result<(String, Vec<String>)> {
    let mut root_uuid = String::new();
    let mut options = Vec::new();

    pt.for_each_mountable(|mountable, ancestors| {
        if mountable.mountpoint() != "/" {
            return;
        }
        root_uuid = mountable.uuid().to_string();
        for ancestor in ancestors {
            if let Ancestor::Luks(container) = ancestor {
                options.push(format!("luks.uuid={}", container.uuid));
            }
        }
        if let Mountable::Subvolume { subvolume, .. } = mountable {
            options.push(format!("rootflags=subvol={}", subvolume.name));
        }
    });

    if root_uuid.is_empty() {
        bail!("root filesystem not found in the partition table");
    }
    Ok((root_uuid, options))
}

/// Kernel options for FIPS mode.
pub fn gen_fips_kernel_options(pt: &PartitionTable) -> Vec<String> {
    let mut options = vec!["fips=1".to_string()];
    if let Some(boot) = pt.find_mountable("/boot") {
        options.push(format!("boot=UUID={}", boot.uuid()));
    }
    options
}

/// Files dropped into the tree to mark FIPS mode as enabled.
pub fn gen_fips_files() -> Vec<FileNode> {
    vec![FileNode::new(
        "/etc/system-fips",
        b"# FIPS module installation complete\n".to_vec(),
    )
    .expect("static path is valid")]
}

/// Configuration stages for FIPS mode.
pub fn gen_fips_stages() -> Vec<Stage> {
    vec![super::new_dracut_conf_stage(&super::DracutConfStageOptions {
        filename: "40-fips.conf".to_string(),
        config: super::DracutConfigFile {
            add_modules: vec!["fips".to_string()],
            ..super::DracutConfigFile::default()
        },
    })]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasizes::GIB;
    use crate::disk::{template, PartitioningMode, TemplateKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn planned(kind: TemplateKind, mode: PartitioningMode) -> PartitionTable {
        let mut rng = StdRng::seed_from_u64(13);
        PartitionTable::plan(&template(kind), &[], 5 * GIB, mode, None, &mut rng).unwrap()
    }

    #[test]
    fn test_prepare_stages_order() {
        let pt = planned(TemplateKind::Plain, PartitioningMode::Raw);
        let stages = gen_image_prepare_stages(&pt, "disk.img");
        assert_eq!(stages[0].stage_type, "org.osbuild.truncate");
        assert_eq!(stages[1].stage_type, "org.osbuild.sfdisk");
        let types: Vec<&str> = stages.iter().map(|s| s.stage_type.as_str()).collect();
        assert!(types.contains(&"org.osbuild.mkfs.fat"));
        assert!(types.contains(&"org.osbuild.mkfs.xfs"));
    }

    #[test]
    fn test_luks_format_before_inner_mkfs() {
        let pt = planned(TemplateKind::Luks, PartitioningMode::Raw);
        let stages = gen_mkfs_stages(&pt, "disk.img");
        let types: Vec<&str> = stages.iter().map(|s| s.stage_type.as_str()).collect();
        let luks_pos = types
            .iter()
            .position(|t| *t == "org.osbuild.luks2.format")
            .unwrap();
        let root_mkfs_pos = types
            .iter()
            .rposition(|t| *t == "org.osbuild.mkfs.xfs")
            .unwrap();
        assert!(luks_pos < root_mkfs_pos);
    }

    #[test]
    fn test_fs_devices_mounts_root_first() {
        let pt = planned(TemplateKind::Plain, PartitioningMode::Raw);
        let (devices, mounts) = gen_fs_devices_mounts(&pt, "disk.img");
        assert_eq!(mounts[0].target.as_deref(), Some("/"));
        assert_eq!(mounts[0].mount_type, "org.osbuild.xfs");
        let last = mounts.last().unwrap();
        assert_eq!(last.target.as_deref(), Some("/boot/efi"));
        assert_eq!(last.mount_type, "org.osbuild.fat");
        assert!(devices.contains_key("root"));
        assert!(devices.contains_key("boot-efi"));
    }

    #[test]
    fn test_lvm_device_chain() {
        let mut rng = StdRng::seed_from_u64(13);
        let custom = vec![("/var".to_string(), 2 * GIB)];
        let pt = PartitionTable::plan(
            &template(TemplateKind::Plain),
            &custom,
            5 * GIB,
            PartitioningMode::AutoLvm,
            None,
            &mut rng,
        )
        .unwrap();
        let (devices, mounts) = gen_fs_devices_mounts(&pt, "disk.img");
        // the logical volume device sits on the shared loopback
        assert_eq!(
            devices["var"].device_type, "org.osbuild.lvm2.lv",
        );
        let parent = devices["var"].parent.as_deref().unwrap();
        assert_eq!(devices[parent].device_type, "org.osbuild.loopback");
        assert!(mounts.iter().any(|m| m.target.as_deref() == Some("/var")));
    }

    #[test]
    fn test_bootupd_devices_require_boot_mounts() {
        let pt = planned(TemplateKind::Plain, PartitioningMode::Raw);
        assert!(gen_bootupd_devices_mounts(&pt, "disk.img").is_ok());

        let noboot = planned(TemplateKind::PlainNoBoot, PartitioningMode::Raw);
        let err = gen_bootupd_devices_mounts(&noboot, "disk.img").unwrap_err();
        assert!(err.to_string().contains("/boot"), "{err}");
    }

    #[test]
    fn test_fstab_stage_rows() {
        let pt = planned(TemplateKind::Plain, PartitioningMode::Raw);
        let stage = gen_fstab_stage(&pt).unwrap();
        let value = serde_json::to_value(&stage).unwrap();
        let filesystems = value["options"]["filesystems"].as_array().unwrap();
        assert_eq!(filesystems[0]["path"], "/");
        assert_eq!(filesystems[1]["path"], "/boot");
        assert_eq!(filesystems[2]["path"], "/boot/efi");
        assert_eq!(filesystems[2]["passno"], 2);
    }

    #[test]
    fn test_systemd_mount_units() {
        let pt = planned(TemplateKind::Plain, PartitioningMode::Raw);
        let stages = gen_systemd_mount_stages(&pt).unwrap();
        let first = serde_json::to_value(&stages[0]).unwrap();
        assert_eq!(first["type"], "org.osbuild.systemd.unit.create");
        assert_eq!(first["options"]["filename"], "-.mount");
        let last = serde_json::to_value(stages.last().unwrap()).unwrap();
        assert_eq!(last["type"], "org.osbuild.systemd");
        assert!(last["options"]["enabled_services"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "boot-efi.mount"));
    }

    #[test]
    fn test_kernel_options_for_luks_root() {
        let pt = planned(TemplateKind::Luks, PartitioningMode::Raw);
        let (root_uuid, options) = gen_image_kernel_options(&pt).unwrap();
        assert!(!root_uuid.is_empty());
        assert!(options.iter().any(|o| o.starts_with("luks.uuid=")));
    }

    #[test]
    fn test_kernel_options_for_btrfs_root() {
        let pt = planned(TemplateKind::Btrfs, PartitioningMode::Raw);
        let (_, options) = gen_image_kernel_options(&pt).unwrap();
        assert!(options.contains(&"rootflags=subvol=root".to_string()));
    }

    #[test]
    fn test_grub2_inst_stage() {
        let pt = planned(TemplateKind::Plain, PartitioningMode::Raw);
        let stage = gen_grub2_inst_stage(&pt, "disk.img", "i386-pc").unwrap();
        let value = serde_json::to_value(&stage).unwrap();
        assert_eq!(value["type"], "org.osbuild.grub2.inst");
        assert_eq!(value["options"]["prefix"]["path"], "/grub2");
        assert_eq!(value["options"]["core"]["type"], "mkimage");
        // bios boot partition starts at 1 MiB = sector 2048
        assert_eq!(value["options"]["location"], 2048);
    }

    #[test]
    fn test_fips_helpers() {
        let pt = planned(TemplateKind::Plain, PartitioningMode::Raw);
        let options = gen_fips_kernel_options(&pt);
        assert_eq!(options[0], "fips=1");
        assert!(options[1].starts_with("boot=UUID="));
        assert_eq!(gen_fips_files()[0].path().to_str().unwrap(), "/etc/system-fips");
    }
}
