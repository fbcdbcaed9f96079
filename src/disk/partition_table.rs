//! Partition tables: layout, sizing, and the planning algorithm that turns
//! a template plus customizations into a concrete table.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{
    align_to, Ancestor, Btrfs, EntityRef, Filesystem, FilesystemType, FstabEntity,
    LvmVolumeGroup, Mountable, Partition, Payload, DEFAULT_GRAIN, DEFAULT_SECTOR_SIZE,
    FILESYSTEM_DATA_GUID, LVM_PARTITION_GUID,
};
use crate::datasizes::{GIB, MIB};

/// How the planner places new mountpoints that are not in the template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitioningMode {
    /// Each mountpoint gets its own partition.
    Raw,
    /// Force everything except /boot onto LVM.
    Lvm,
    /// Use LVM only when the customizations require new volumes.
    #[default]
    AutoLvm,
    /// Place mountpoints on btrfs subvolumes.
    Btrfs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableType {
    None,
    Dos,
    Gpt,
}

impl Default for PartitionTableType {
    fn default() -> Self {
        PartitionTableType::Gpt
    }
}

/// Which container technologies a table uses somewhere in its tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableFeatures {
    pub luks: bool,
    pub lvm: bool,
    pub btrfs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionTable {
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "type")]
    pub table_type: PartitionTableType,
    #[serde(default, with = "crate::datasizes::bytes")]
    pub size: u64,
    #[serde(default = "default_sector_size")]
    pub sector_size: u64,
    /// Space reserved beyond the last partition.
    #[serde(default, with = "crate::datasizes::bytes")]
    pub extra_padding: u64,
    /// Minimum start of the first partition.
    #[serde(default, with = "crate::datasizes::bytes")]
    pub start_offset: u64,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

fn default_sector_size() -> u64 {
    DEFAULT_SECTOR_SIZE
}

impl Default for PartitionTable {
    fn default() -> Self {
        PartitionTable {
            uuid: String::new(),
            table_type: PartitionTableType::default(),
            size: 0,
            sector_size: DEFAULT_SECTOR_SIZE,
            extra_padding: 0,
            start_offset: 0,
            partitions: Vec::new(),
        }
    }
}

/// Default directory size floors applied when the caller supplies none.
fn default_required_sizes() -> BTreeMap<String, u64> {
    BTreeMap::from([("/".to_string(), GIB), ("/usr".to_string(), 2 * GIB)])
}

/// Mountpoint sizes below 1 GiB are bumped; tiny filesystems break package
/// installation in surprising ways.
fn clamp_fs_size(size: u64) -> u64 {
    size.max(GIB)
}

impl PartitionTable {
    /// Round up to the layout grain.
    pub fn align_up(&self, size: u64) -> u64 {
        align_to(size, DEFAULT_GRAIN)
    }

    /// Size of the on-disk header: one sector, plus the partition entry
    /// array on GPT.
    pub fn header_size(&self) -> u64 {
        let mut header = self.sector_size;
        if self.table_type == PartitionTableType::Gpt {
            header += 128 * 128;
        }
        header
    }

    pub fn sectors_to_bytes(&self, sectors: u64) -> u64 {
        sectors * self.sector_size
    }

    pub fn bytes_to_sectors(&self, bytes: u64) -> u64 {
        bytes / self.sector_size
    }

    /// Depth-first traversal over every entity, with the ancestor chain
    /// accumulated from the root.
    pub fn for_each_entity<'a>(&'a self, mut visit: impl FnMut(EntityRef<'a>, &[Ancestor<'a>])) {
        let mut ancestors: Vec<Ancestor<'a>> = Vec::new();
        for (index, partition) in self.partitions.iter().enumerate() {
            visit(EntityRef::Partition(partition), &ancestors);
            if let Some(payload) = &partition.payload {
                ancestors.push(Ancestor::Partition { index, partition });
                payload.visit(&mut ancestors, &mut visit);
                ancestors.pop();
            }
        }
    }

    /// Visit every entity with a mountpoint.
    pub fn for_each_mountable<'a>(&'a self, mut visit: impl FnMut(Mountable<'a>, &[Ancestor<'a>])) {
        self.for_each_entity(|entity, ancestors| {
            if let Some(mountable) = entity.as_mountable() {
                visit(mountable, ancestors);
            }
        });
    }

    /// Visit every entity that contributes an fstab row.
    pub fn for_each_fstab_entity<'a>(
        &'a self,
        mut visit: impl FnMut(FstabEntity<'a>, &[Ancestor<'a>]),
    ) {
        self.for_each_entity(|entity, ancestors| match entity {
            EntityRef::Swap(swap) => visit(FstabEntity::Swap(swap), ancestors),
            other => {
                if let Some(mountable) = other.as_mountable() {
                    visit(FstabEntity::Mountable(mountable), ancestors);
                }
            }
        });
    }

    /// The entity mounted exactly at `path`, if any.
    pub fn find_mountable<'a>(&'a self, path: &str) -> Option<Mountable<'a>> {
        let mut found = None;
        self.for_each_mountable(|mountable, _| {
            if found.is_none() && mountable.mountpoint() == path {
                found = Some(mountable);
            }
        });
        found
    }

    /// The mountable whose mountpoint is the longest prefix of `dir`.
    pub fn find_directory_entity<'a>(&'a self, dir: &str) -> Option<Mountable<'a>> {
        let mut best: Option<Mountable<'a>> = None;
        self.for_each_mountable(|mountable, _| {
            let mountpoint = mountable.mountpoint();
            let is_prefix = mountpoint == "/"
                || dir == mountpoint
                || dir.starts_with(&format!("{mountpoint}/"));
            if is_prefix {
                let better = match &best {
                    None => true,
                    Some(current) => mountpoint.len() > current.mountpoint().len(),
                };
                if better {
                    best = Some(mountable);
                }
            }
        });
        best
    }

    pub fn contains_mountpoint(&self, path: &str) -> bool {
        self.find_mountable(path).is_some()
    }

    /// All mountpoints in the table, in traversal order.
    pub fn mountpoints(&self) -> Vec<String> {
        let mut result = Vec::new();
        self.for_each_mountable(|mountable, _| result.push(mountable.mountpoint().to_string()));
        result
    }

    /// Which container technologies appear in the tree.
    pub fn features(&self) -> TableFeatures {
        let mut features = TableFeatures::default();
        self.for_each_entity(|entity, _| match entity {
            EntityRef::Luks(_) => features.luks = true,
            EntityRef::VolumeGroup(_) => features.lvm = true,
            EntityRef::BtrfsVolume(_) => features.btrfs = true,
            _ => {}
        });
        features
    }

    /// The filesystem type used for the root mountpoint; xfs if the table
    /// has no root yet.
    fn default_fs_type(&self) -> FilesystemType {
        self.find_mountable("/")
            .map(|mountable| mountable.fs_type())
            .filter(|fs_type| *fs_type != FilesystemType::None)
            .unwrap_or(FilesystemType::Xfs)
    }

    /// Append a new partition carrying a plain filesystem for `mountpoint`.
    pub fn create_mountpoint(&mut self, mountpoint: &str, size: u64) -> Result<()> {
        let fs_type = self.default_fs_type();
        let (part_type, max_partitions) = match self.table_type {
            PartitionTableType::Gpt => (FILESYSTEM_DATA_GUID.to_string(), 128),
            _ => ("83".to_string(), 4),
        };
        if self.partitions.len() >= max_partitions {
            bail!("maximum number of partitions reached ({max_partitions})");
        }
        self.partitions.push(Partition {
            size,
            part_type,
            payload: Some(Payload::Filesystem(Filesystem {
                fs_type,
                mountpoint: mountpoint.to_string(),
                fstab_options: "defaults".to_string(),
                ..Filesystem::default()
            })),
            ..Partition::default()
        });
        Ok(())
    }

    /// Make sure the root filesystem lives on an LVM logical volume,
    /// converting the root partition if necessary. A separate /boot
    /// partition is created when missing; LVM roots cannot be read by the
    /// bootloader directly.
    pub fn ensure_lvm(&mut self) -> Result<()> {
        if !self.contains_mountpoint("/") {
            bail!("cannot set up LVM: the base layout has no root mountpoint");
        }
        if !self.contains_mountpoint("/boot") {
            self.create_mountpoint("/boot", 512 * MIB)?;
        }

        let lvm_part_type = match self.table_type {
            PartitionTableType::Gpt => LVM_PARTITION_GUID.to_string(),
            _ => "8e".to_string(),
        };

        for partition in &mut self.partitions {
            let Some(payload) = &mut partition.payload else {
                continue;
            };
            match payload {
                Payload::Lvm(_) => return Ok(()),
                Payload::Filesystem(fs) if fs.mountpoint == "/" => {
                    let root_fs = fs.clone();
                    let mut group = LvmVolumeGroup {
                        name: "rootvg".to_string(),
                        description: "created via lvm2 and osbuild".to_string(),
                        logical_volumes: Vec::new(),
                    };
                    group.create_logical_volume(
                        "rootlv",
                        partition.size,
                        Payload::Filesystem(root_fs),
                    )?;
                    partition.payload = Some(Payload::Lvm(group));
                    // the volume group partition is grown back during layout
                    partition.size = 0;
                    partition.part_type = lvm_part_type;
                    return Ok(());
                }
                Payload::Luks(luks) => match luks.payload.as_deref() {
                    Some(Payload::Lvm(_)) => return Ok(()),
                    Some(Payload::Filesystem(fs)) if fs.mountpoint == "/" => {
                        let root_fs = fs.clone();
                        let mut group = LvmVolumeGroup {
                            name: "rootvg".to_string(),
                            description: "created via lvm2 and osbuild".to_string(),
                            logical_volumes: Vec::new(),
                        };
                        group.create_logical_volume(
                            "rootlv",
                            partition.size,
                            Payload::Filesystem(root_fs),
                        )?;
                        luks.payload = Some(Box::new(Payload::Lvm(group)));
                        return Ok(());
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        bail!("cannot set up LVM: the root filesystem is not in a convertible location");
    }

    /// Make sure the root filesystem is a btrfs subvolume, converting the
    /// root partition if necessary.
    pub fn ensure_btrfs(&mut self) -> Result<()> {
        if !self.contains_mountpoint("/") {
            bail!("cannot set up btrfs: the base layout has no root mountpoint");
        }
        if !self.contains_mountpoint("/boot") {
            self.create_mountpoint("/boot", 512 * MIB)?;
        }

        for partition in &mut self.partitions {
            let Some(payload) = &mut partition.payload else {
                continue;
            };
            match payload {
                Payload::Btrfs(_) => return Ok(()),
                Payload::Filesystem(fs) if fs.mountpoint == "/" => {
                    let label = fs.label.clone();
                    let mut volume = Btrfs {
                        label,
                        ..Btrfs::default()
                    };
                    volume.create_mountpoint("/", 0)?;
                    partition.payload = Some(Payload::Btrfs(volume));
                    return Ok(());
                }
                _ => {}
            }
        }
        bail!("cannot set up btrfs: the root filesystem is not in a convertible location");
    }

    /// Grow whatever holds `mountpoint` so it fits at least `size` bytes.
    /// Returns false if the mountpoint is not in the tree.
    pub fn grow_mountpoint(&mut self, mountpoint: &str, size: u64) -> bool {
        for partition in &mut self.partitions {
            if let Some(payload) = &mut partition.payload {
                if let Some(needed) = grow_payload(payload, mountpoint, size) {
                    partition.ensure_size(needed);
                    return true;
                }
            }
        }
        false
    }

    /// Apply per-directory size floors. Every directory is attributed to the
    /// mountable with the longest matching mountpoint prefix; sizes mapped
    /// to the same mountable are summed.
    ///
    /// Panics on non-canonical keys or directories that resolve to no
    /// mountable; both are programming errors in the caller.
    pub fn ensure_directory_sizes(&mut self, directory_sizes: &BTreeMap<String, u64>) {
        let mut per_mountpoint: BTreeMap<String, u64> = BTreeMap::new();
        for (dir, size) in directory_sizes {
            if !dir.starts_with('/') {
                panic!("invalid directory path {dir:?}: must be absolute");
            }
            if dir != "/" && dir.ends_with('/') {
                panic!("invalid directory path {dir:?}: must not end with a slash");
            }
            let mountable = self
                .find_directory_entity(dir)
                .unwrap_or_else(|| panic!("no mountable found for directory {dir:?}"));
            *per_mountpoint
                .entry(mountable.mountpoint().to_string())
                .or_default() += size;
        }
        for (mountpoint, total) in per_mountpoint {
            self.grow_mountpoint(&mountpoint, total);
        }
    }

    /// Index of the partition holding the root mountpoint; falls back to
    /// the last partition for tables without one.
    fn root_partition_index(&self) -> usize {
        let mut root_index = None;
        self.for_each_mountable(|mountable, ancestors| {
            if mountable.mountpoint() == "/" && root_index.is_none() {
                if let Some(Ancestor::Partition { index, .. }) = ancestors.first() {
                    root_index = Some(*index);
                }
            }
        });
        root_index.unwrap_or(self.partitions.len().saturating_sub(1))
    }

    /// Lay out partition starts and recompute the table size.
    ///
    /// Partitions keep their declared order, but the root partition is
    /// placed physically last so it can grow into any remaining space. The
    /// final size is at least `size`, rounded up to the layout grain, with
    /// the GPT secondary header accounted for.
    pub fn relayout(&mut self, size: u64) -> u64 {
        let header = self.header_size();
        let mut footer = 0;
        if self.table_type == PartitionTableType::Gpt {
            // the GPT header is mirrored at the end of the disk
            footer = header;
        }
        footer += self.extra_padding;

        // every partition must hold its payload
        for partition in &mut self.partitions {
            if let Some(payload) = &partition.payload {
                let min = payload.min_size();
                if min > partition.size {
                    partition.size = min;
                }
            }
        }

        let root_index = self.root_partition_index();
        let mut position = self.align_up(header.max(self.start_offset));
        let size = self.align_up(size);

        for (index, partition) in self.partitions.iter_mut().enumerate() {
            if index == root_index {
                continue;
            }
            partition.start = position;
            partition.size = align_to(partition.size, DEFAULT_GRAIN);
            position += partition.size;
        }

        if self.partitions.is_empty() {
            self.size = size;
            return size;
        }

        let root_desired = self.partitions[root_index].size;
        let needed = position + root_desired + footer;
        let total = self.align_up(size.max(needed));
        let root = &mut self.partitions[root_index];
        root.start = position;
        root.size = total - position - footer;
        self.size = total;
        total
    }

    /// Fill in missing identifiers from the given random source. Existing
    /// identifiers are kept; DOS partitions get none.
    pub fn generate_uuids(&mut self, rng: &mut dyn RngCore) {
        if self.uuid.is_empty() {
            self.uuid = gen_uuid(rng);
        }
        let skip_partition_uuids = self.table_type == PartitionTableType::Dos;
        for partition in &mut self.partitions {
            if !skip_partition_uuids && partition.uuid.is_empty() {
                partition.uuid = gen_uuid(rng);
            }
            if let Some(payload) = &mut partition.payload {
                generate_payload_uuids(payload, rng);
            }
        }
    }

    /// Clone the table, assigning fresh identifiers to every unique entity.
    pub fn clone_with_new_uuids(&self, rng: &mut dyn RngCore) -> PartitionTable {
        let mut clone = self.clone();
        clone.uuid = String::new();
        for partition in &mut clone.partitions {
            partition.uuid = String::new();
            if let Some(payload) = &mut partition.payload {
                clear_payload_uuids(payload);
            }
        }
        clone.generate_uuids(rng);
        clone
    }

    /// Build a concrete partition table from a base template.
    ///
    /// Every requested mountpoint ends up as a mountable somewhere in the
    /// tree, sized to at least its requested minimum. `required_sizes`
    /// applies per-directory floors afterwards (a built-in default covers
    /// `/` and `/usr`), and the whole table is laid out to fill at least
    /// `image_size` bytes.
    pub fn plan(
        base: &PartitionTable,
        mountpoints: &[(String, u64)],
        image_size: u64,
        mode: PartitioningMode,
        required_sizes: Option<&BTreeMap<String, u64>>,
        rng: &mut dyn RngCore,
    ) -> Result<PartitionTable> {
        let mut table = base.clone();
        let features = table.features();

        match mode {
            PartitioningMode::Raw => {}
            PartitioningMode::Lvm => {
                if features.btrfs {
                    bail!("lvm partitioning mode is not supported for a base layout with btrfs");
                }
                if features.luks && !features.lvm {
                    bail!("lvm partitioning mode is not supported for a base layout with LUKS");
                }
            }
            PartitioningMode::AutoLvm => {
                if features.btrfs {
                    bail!("auto-lvm partitioning mode is not supported for a base layout with btrfs");
                }
            }
            PartitioningMode::Btrfs => {
                if features.luks {
                    bail!("btrfs partitioning mode is not supported for a base layout with LUKS");
                }
                if features.lvm {
                    bail!("btrfs partitioning mode is not supported for a base layout with LVM");
                }
            }
        }

        for (index, (mountpoint, _)) in mountpoints.iter().enumerate() {
            if !mountpoint.starts_with('/') {
                bail!("invalid mountpoint {mountpoint:?}: must be absolute");
            }
            if mountpoints[..index].iter().any(|(m, _)| m == mountpoint) {
                bail!("duplicate mountpoint {mountpoint:?} in customizations");
            }
        }

        let mut new_mountpoints: Vec<(String, u64)> = Vec::new();
        for (mountpoint, min_size) in mountpoints {
            let size = clamp_fs_size(*min_size);
            if table.contains_mountpoint(mountpoint) {
                table.grow_mountpoint(mountpoint, size);
            } else {
                new_mountpoints.push((mountpoint.clone(), size));
            }
        }

        let creates_volumes = new_mountpoints.iter().any(|(m, _)| m != "/boot");
        match mode {
            PartitioningMode::Lvm => table.ensure_lvm()?,
            PartitioningMode::AutoLvm if creates_volumes => table.ensure_lvm()?,
            PartitioningMode::Btrfs => table.ensure_btrfs()?,
            _ => {}
        }

        for (mountpoint, size) in new_mountpoints {
            if mountpoint == "/boot" {
                table.create_mountpoint(&mountpoint, size)?;
                continue;
            }
            match mode {
                PartitioningMode::Raw => table.create_mountpoint(&mountpoint, size)?,
                PartitioningMode::Lvm | PartitioningMode::AutoLvm => {
                    let fs_type = table.default_fs_type();
                    let group = table
                        .find_volume_group_mut()
                        .expect("ensure_lvm guarantees a volume group");
                    group.create_mountpoint(&mountpoint, size, fs_type)?;
                }
                PartitioningMode::Btrfs => {
                    let volume = table
                        .find_btrfs_mut()
                        .expect("ensure_btrfs guarantees a btrfs volume");
                    volume.create_mountpoint(&mountpoint, size)?;
                }
            }
        }

        match required_sizes {
            Some(sizes) => table.ensure_directory_sizes(sizes),
            None => table.ensure_directory_sizes(&default_required_sizes()),
        }

        table.relayout(image_size);
        table.generate_uuids(rng);
        Ok(table)
    }

    fn find_volume_group_mut(&mut self) -> Option<&mut LvmVolumeGroup> {
        for partition in &mut self.partitions {
            match &mut partition.payload {
                Some(Payload::Lvm(group)) => return Some(group),
                Some(Payload::Luks(luks)) => {
                    if let Some(Payload::Lvm(group)) = luks.payload.as_deref_mut() {
                        return Some(group);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn find_btrfs_mut(&mut self) -> Option<&mut Btrfs> {
        for partition in &mut self.partitions {
            if let Some(Payload::Btrfs(volume)) = &mut partition.payload {
                return Some(volume);
            }
        }
        None
    }
}

/// Grow the entity holding `mountpoint` inside `payload`. Returns the size
/// the payload's owner must provide, or None if the mountpoint is not here.
fn grow_payload(payload: &mut Payload, mountpoint: &str, size: u64) -> Option<u64> {
    match payload {
        Payload::Filesystem(fs) => (fs.mountpoint == mountpoint).then_some(size),
        Payload::Swap(_) | Payload::Raw(_) => None,
        Payload::Btrfs(volume) => {
            let subvolume = volume
                .subvolumes
                .iter_mut()
                .find(|sv| sv.mountpoint == mountpoint)?;
            subvolume.ensure_size(size);
            let total: u64 = volume.subvolumes.iter().map(|sv| sv.size).sum();
            Some(total.max(size))
        }
        Payload::Lvm(group) => {
            let mut found = false;
            for volume in &mut group.logical_volumes {
                if let Some(inner) = &mut volume.payload {
                    if let Some(needed) = grow_payload(inner, mountpoint, size) {
                        volume.ensure_size(needed);
                        found = true;
                        break;
                    }
                }
            }
            found.then(|| group.min_size().max(size))
        }
        Payload::Luks(luks) => {
            let inner = luks.payload.as_deref_mut()?;
            let needed = grow_payload(inner, mountpoint, size)?;
            Some(needed + luks.metadata_size())
        }
    }
}

fn generate_payload_uuids(payload: &mut Payload, rng: &mut dyn RngCore) {
    match payload {
        Payload::Filesystem(fs) => {
            if fs.uuid.is_empty() {
                fs.uuid = match fs.fs_type {
                    // vfat volume ids are 32 bits
                    FilesystemType::Vfat => gen_vol_id(rng),
                    _ => gen_uuid(rng),
                };
            }
        }
        Payload::Swap(swap) => {
            if swap.uuid.is_empty() {
                swap.uuid = gen_uuid(rng);
            }
        }
        Payload::Luks(luks) => {
            if luks.uuid.is_empty() {
                luks.uuid = gen_uuid(rng);
            }
            if let Some(inner) = luks.payload.as_deref_mut() {
                generate_payload_uuids(inner, rng);
            }
        }
        Payload::Lvm(group) => {
            for volume in &mut group.logical_volumes {
                if let Some(inner) = &mut volume.payload {
                    generate_payload_uuids(inner, rng);
                }
            }
        }
        Payload::Btrfs(volume) => {
            if volume.uuid.is_empty() {
                volume.uuid = gen_uuid(rng);
            }
            for subvolume in &mut volume.subvolumes {
                subvolume.uuid = volume.uuid.clone();
            }
        }
        Payload::Raw(_) => {}
    }
}

fn clear_payload_uuids(payload: &mut Payload) {
    match payload {
        Payload::Filesystem(fs) => fs.uuid = String::new(),
        Payload::Swap(swap) => swap.uuid = String::new(),
        Payload::Luks(luks) => {
            luks.uuid = String::new();
            if let Some(inner) = luks.payload.as_deref_mut() {
                clear_payload_uuids(inner);
            }
        }
        Payload::Lvm(group) => {
            for volume in &mut group.logical_volumes {
                if let Some(inner) = &mut volume.payload {
                    clear_payload_uuids(inner);
                }
            }
        }
        Payload::Btrfs(volume) => {
            volume.uuid = String::new();
            for subvolume in &mut volume.subvolumes {
                subvolume.uuid = String::new();
            }
        }
        Payload::Raw(_) => {}
    }
}

fn gen_uuid(rng: &mut dyn RngCore) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}

/// A FAT volume id: four random bytes in `XXXX-XXXX` form.
fn gen_vol_id(rng: &mut dyn RngCore) -> String {
    let mut bytes = [0u8; 4];
    rng.fill_bytes(&mut bytes);
    format!(
        "{:02X}{:02X}-{:02X}{:02X}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::template;
    use crate::disk::TemplateKind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(13)
    }

    fn gpt_header_footer() -> u64 {
        DEFAULT_SECTOR_SIZE + 128 * 128
    }

    #[test]
    fn test_relayout_simple_dos() {
        let mut pt = PartitionTable {
            table_type: PartitionTableType::Dos,
            size: 100 * MIB,
            partitions: vec![
                Partition {
                    size: 10 * MIB,
                    ..Partition::default()
                },
                Partition {
                    size: 20 * MIB,
                    payload: Some(Payload::Filesystem(Filesystem {
                        mountpoint: "/".to_string(),
                        ..Filesystem::default()
                    })),
                    ..Partition::default()
                },
            ],
            ..PartitionTable::default()
        };
        pt.relayout(100 * MIB);
        assert_eq!(pt.partitions[0].start, MIB);
        assert_eq!(pt.partitions[0].size, 10 * MIB);
        assert_eq!(pt.partitions[1].start, 11 * MIB);
        // dos has no footer; root fills the rest
        assert_eq!(pt.partitions[1].size, 89 * MIB);
        assert_eq!(pt.size, 100 * MIB);
    }

    #[test]
    fn test_relayout_simple_gpt() {
        let mut pt = PartitionTable {
            table_type: PartitionTableType::Gpt,
            size: 100 * MIB,
            partitions: vec![
                Partition {
                    size: 10 * MIB,
                    ..Partition::default()
                },
                Partition {
                    size: 20 * MIB,
                    payload: Some(Payload::Filesystem(Filesystem {
                        mountpoint: "/".to_string(),
                        ..Filesystem::default()
                    })),
                    ..Partition::default()
                },
            ],
            ..PartitionTable::default()
        };
        pt.relayout(100 * MIB);
        assert_eq!(pt.partitions[1].start, 11 * MIB);
        // the gpt footer mirrors the header at the end of the disk
        assert_eq!(pt.partitions[1].size, 89 * MIB - gpt_header_footer());
    }

    #[test]
    fn test_relayout_root_moves_last() {
        let mut pt = PartitionTable {
            table_type: PartitionTableType::Gpt,
            size: 100 * MIB,
            partitions: vec![
                Partition {
                    size: 10 * MIB,
                    payload: Some(Payload::Filesystem(Filesystem {
                        mountpoint: "/".to_string(),
                        ..Filesystem::default()
                    })),
                    ..Partition::default()
                },
                Partition {
                    size: 20 * MIB,
                    ..Partition::default()
                },
                Partition {
                    size: 30 * MIB,
                    ..Partition::default()
                },
            ],
            ..PartitionTable::default()
        };
        pt.relayout(100 * MIB);
        assert_eq!(pt.partitions[1].start, MIB);
        assert_eq!(pt.partitions[2].start, 21 * MIB);
        // root is placed physically last and grows to fill
        assert_eq!(pt.partitions[0].start, 51 * MIB);
        assert_eq!(pt.partitions[0].size, 49 * MIB - gpt_header_footer());
    }

    #[test]
    fn test_relayout_grows_for_large_root() {
        let mut pt = PartitionTable {
            table_type: PartitionTableType::Gpt,
            size: 100 * MIB,
            partitions: vec![
                Partition {
                    size: 10 * MIB,
                    ..Partition::default()
                },
                Partition {
                    size: 500 * MIB,
                    payload: Some(Payload::Filesystem(Filesystem {
                        mountpoint: "/".to_string(),
                        ..Filesystem::default()
                    })),
                    ..Partition::default()
                },
            ],
            ..PartitionTable::default()
        };
        pt.relayout(100 * MIB);
        // grows to fit partitions, header, and footer
        assert_eq!(pt.size, 512 * MIB);
        assert_eq!(pt.partitions[1].size, 501 * MIB - gpt_header_footer());
    }

    #[test]
    fn test_plan_plain_raw() {
        let base = template(TemplateKind::Plain);
        let pt =
            PartitionTable::plan(&base, &[], 3 * GIB, PartitioningMode::Raw, None, &mut rng())
                .unwrap();

        for mountpoint in ["/", "/boot", "/boot/efi"] {
            let mountable = pt.find_mountable(mountpoint).unwrap();
            assert_eq!(mountable.mountpoint(), mountpoint);
            let expected = if mountpoint == "/boot/efi" {
                FilesystemType::Vfat
            } else {
                FilesystemType::Xfs
            };
            assert_eq!(mountable.fs_type(), expected, "{mountpoint}");
        }
        assert!(pt.size >= 3 * GIB);
        assert!(!pt.uuid.is_empty());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let base = template(TemplateKind::Plain);
        let a = PartitionTable::plan(&base, &[], 3 * GIB, PartitioningMode::Raw, None, &mut rng())
            .unwrap();
        let b = PartitionTable::plan(&base, &[], 3 * GIB, PartitioningMode::Raw, None, &mut rng())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_plan_lvm_extent_alignment() {
        let base = template(TemplateKind::Plain);
        let custom = vec![
            ("/".to_string(), 32_000_000_000),
            ("/var".to_string(), 4_096_000_000),
            ("/var/log".to_string(), 4_096_000_000),
        ];
        let pt = PartitionTable::plan(
            &base,
            &custom,
            3 * GIB,
            PartitioningMode::AutoLvm,
            None,
            &mut rng(),
        )
        .unwrap();

        let group = pt
            .partitions
            .iter()
            .find_map(|p| match &p.payload {
                Some(Payload::Lvm(group)) => Some(group),
                _ => None,
            })
            .expect("no volume group after auto-lvm planning");

        let sizes: BTreeMap<&str, u64> = group
            .logical_volumes
            .iter()
            .map(|lv| {
                let mountpoint = match &lv.payload {
                    Some(Payload::Filesystem(fs)) => fs.mountpoint.as_str(),
                    _ => "",
                };
                (mountpoint, lv.size)
            })
            .collect();
        assert_eq!(sizes["/"], 32_002_539_520);
        assert_eq!(sizes["/var"], 3908 * MIB);
        assert_eq!(sizes["/var/log"], 3908 * MIB);
    }

    #[test]
    fn test_plan_lvm_single_byte_over() {
        let base = template(TemplateKind::Plain);
        let custom = vec![("/var".to_string(), GIB + 1)];
        let pt = PartitionTable::plan(
            &base,
            &custom,
            3 * GIB,
            PartitioningMode::AutoLvm,
            None,
            &mut rng(),
        )
        .unwrap();
        let mut var_size = 0;
        pt.for_each_entity(|entity, _| {
            if let EntityRef::LogicalVolume(lv) = entity {
                if let Some(Payload::Filesystem(fs)) = &lv.payload {
                    if fs.mountpoint == "/var" {
                        var_size = lv.size;
                    }
                }
            }
        });
        assert_eq!(var_size, GIB + crate::disk::LVM_EXTENT_SIZE);
    }

    #[test]
    fn test_plan_mode_template_compatibility() {
        let cases: &[(TemplateKind, PartitioningMode, bool)] = &[
            (TemplateKind::Plain, PartitioningMode::Raw, true),
            (TemplateKind::Plain, PartitioningMode::AutoLvm, true),
            (TemplateKind::Plain, PartitioningMode::Lvm, true),
            (TemplateKind::Plain, PartitioningMode::Btrfs, true),
            (TemplateKind::Btrfs, PartitioningMode::Raw, true),
            (TemplateKind::Btrfs, PartitioningMode::AutoLvm, false),
            (TemplateKind::Btrfs, PartitioningMode::Lvm, false),
            (TemplateKind::Btrfs, PartitioningMode::Btrfs, true),
            (TemplateKind::Luks, PartitioningMode::Raw, true),
            (TemplateKind::Luks, PartitioningMode::AutoLvm, true),
            (TemplateKind::Luks, PartitioningMode::Lvm, false),
            (TemplateKind::Luks, PartitioningMode::Btrfs, false),
            (TemplateKind::LuksLvm, PartitioningMode::Raw, true),
            (TemplateKind::LuksLvm, PartitioningMode::AutoLvm, true),
            (TemplateKind::LuksLvm, PartitioningMode::Lvm, true),
            (TemplateKind::LuksLvm, PartitioningMode::Btrfs, false),
            (TemplateKind::AutoLvm, PartitioningMode::Raw, true),
            (TemplateKind::AutoLvm, PartitioningMode::AutoLvm, true),
            (TemplateKind::AutoLvm, PartitioningMode::Lvm, true),
            (TemplateKind::AutoLvm, PartitioningMode::Btrfs, false),
        ];
        for (kind, mode, expected_ok) in cases {
            let base = template(*kind);
            let result =
                PartitionTable::plan(&base, &[], 3 * GIB, *mode, None, &mut rng());
            assert_eq!(
                result.is_ok(),
                *expected_ok,
                "template {kind:?} with mode {mode:?}: {result:?}"
            );
        }
    }

    #[test]
    fn test_plan_duplicate_mountpoints_rejected() {
        let base = template(TemplateKind::Plain);
        let custom = vec![("/var".to_string(), GIB), ("/var".to_string(), 2 * GIB)];
        let err = PartitionTable::plan(
            &base,
            &custom,
            3 * GIB,
            PartitioningMode::Raw,
            None,
            &mut rng(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate mountpoint"), "{err}");
    }

    #[test]
    fn test_plan_new_boot_stays_raw_partition() {
        let base = template(TemplateKind::PlainNoBoot);
        let custom = vec![("/boot".to_string(), 700 * MIB)];
        let pt = PartitionTable::plan(
            &base,
            &custom,
            3 * GIB,
            PartitioningMode::AutoLvm,
            None,
            &mut rng(),
        )
        .unwrap();
        let mut boot_on_partition = false;
        pt.for_each_mountable(|mountable, ancestors| {
            if mountable.mountpoint() == "/boot" {
                boot_on_partition = ancestors.len() == 1
                    && matches!(ancestors[0], Ancestor::Partition { .. });
            }
        });
        assert!(boot_on_partition);
    }

    #[test]
    fn test_required_directory_sizes_accumulate() {
        let base = template(TemplateKind::Plain);
        // no /usr mountpoint: the root gets the sum of both floors
        let pt =
            PartitionTable::plan(&base, &[], 0, PartitioningMode::Raw, None, &mut rng()).unwrap();
        let mut root_size = 0;
        pt.for_each_mountable(|mountable, ancestors| {
            if mountable.mountpoint() == "/" {
                if let Ancestor::Partition { partition, .. } = ancestors[0] {
                    root_size = partition.size;
                }
            }
        });
        assert!(root_size >= 3 * GIB, "root size {root_size}");
    }

    #[test]
    fn test_ensure_directory_sizes_panics_on_bad_path() {
        let mut pt = template(TemplateKind::Plain);
        let sizes = BTreeMap::from([("var/log".to_string(), GIB)]);
        let result = std::panic::catch_unwind(move || pt.ensure_directory_sizes(&sizes));
        assert!(result.is_err());
    }

    #[test]
    fn test_size_containment_invariant() {
        let base = template(TemplateKind::LuksLvm);
        let custom = vec![("/var".to_string(), 5 * GIB)];
        let pt = PartitionTable::plan(
            &base,
            &custom,
            10 * GIB,
            PartitioningMode::AutoLvm,
            None,
            &mut rng(),
        )
        .unwrap();

        let mut partition_total = 0;
        for partition in &pt.partitions {
            if let Some(payload) = &partition.payload {
                assert!(
                    partition.size >= payload.min_size(),
                    "partition smaller than payload minimum"
                );
            }
            partition_total += partition.size;
        }
        assert!(pt.size >= partition_total);
    }

    #[test]
    fn test_clone_disjointness() {
        let base = template(TemplateKind::LuksLvm);
        let mut clone = base.clone();
        clone.partitions[3].size += MIB;
        if let Some(Payload::Luks(luks)) = &mut clone.partitions[3].payload {
            luks.label = "changed".to_string();
        }
        // the original is untouched
        let original = template(TemplateKind::LuksLvm);
        assert_eq!(base, original);
        assert_ne!(clone, original);
    }

    #[test]
    fn test_clone_with_new_uuids() {
        let base = template(TemplateKind::Plain);
        let planned =
            PartitionTable::plan(&base, &[], 3 * GIB, PartitioningMode::Raw, None, &mut rng())
                .unwrap();
        let clone = planned.clone_with_new_uuids(&mut StdRng::seed_from_u64(42));
        assert_ne!(clone.uuid, planned.uuid);
        // layout is untouched
        assert_eq!(clone.size, planned.size);
        assert_eq!(clone.partitions.len(), planned.partitions.len());
    }

    #[test]
    fn test_round_trip_all_templates() {
        for kind in [
            TemplateKind::Plain,
            TemplateKind::PlainNoBoot,
            TemplateKind::Luks,
            TemplateKind::LuksLvm,
            TemplateKind::Btrfs,
            TemplateKind::AutoLvm,
        ] {
            let pt = template(kind);

            let json = serde_json::to_string(&pt).unwrap();
            let from_json: PartitionTable = serde_json::from_str(&json).unwrap();
            assert_eq!(from_json, pt, "json round trip for {kind:?}");

            let yaml = serde_yaml::to_string(&pt).unwrap();
            let from_yaml: PartitionTable = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(from_yaml, pt, "yaml round trip for {kind:?}");
        }
    }

    #[test]
    fn test_dos_partition_limit() {
        let mut pt = PartitionTable {
            table_type: PartitionTableType::Dos,
            ..PartitionTable::default()
        };
        for index in 0..4 {
            pt.create_mountpoint(&format!("/data{index}"), GIB).unwrap();
        }
        let err = pt.create_mountpoint("/overflow", GIB).unwrap_err();
        assert!(err.to_string().contains("maximum number"), "{err}");
    }
}
