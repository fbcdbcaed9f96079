//! Btrfs volumes and subvolumes.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// A btrfs volume holding an ordered set of subvolumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Btrfs {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub label: String,
    /// Mountpoint of the top-level volume; usually empty, the subvolumes
    /// carry the real mountpoints.
    #[serde(default)]
    pub mountpoint: String,
    #[serde(default)]
    pub subvolumes: Vec<BtrfsSubvolume>,
}

impl Btrfs {
    /// Create a subvolume carrying `mountpoint`. The subvolume name is
    /// derived from the mountpoint; the root mountpoint becomes `root`.
    pub fn create_mountpoint(&mut self, mountpoint: &str, size: u64) -> Result<&mut BtrfsSubvolume> {
        let name = if mountpoint == "/" {
            "root".to_string()
        } else {
            mountpoint.trim_start_matches('/').to_string()
        };
        if name.is_empty() {
            bail!("cannot create btrfs subvolume with empty name for mountpoint {mountpoint:?}");
        }
        if self.subvolumes.iter().any(|sv| sv.name == name) {
            bail!("btrfs subvolume {name:?} already exists");
        }
        self.subvolumes.push(BtrfsSubvolume {
            name,
            size,
            mountpoint: mountpoint.to_string(),
            ..BtrfsSubvolume::default()
        });
        Ok(self.subvolumes.last_mut().expect("just pushed"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BtrfsSubvolume {
    #[serde(default)]
    pub name: String,
    #[serde(default, with = "crate::datasizes::bytes")]
    pub size: u64,
    #[serde(default)]
    pub mountpoint: String,
    #[serde(default)]
    pub group_id: u64,
    #[serde(default)]
    pub compress: String,
    #[serde(default)]
    pub read_only: bool,
    /// UUID of the parent volume, for mount descriptors.
    #[serde(default)]
    pub uuid: String,
}

impl BtrfsSubvolume {
    /// Grow the subvolume to at least `size`. Returns whether it changed.
    pub fn ensure_size(&mut self, size: u64) -> bool {
        if size > self.size {
            self.size = size;
            return true;
        }
        false
    }

    /// Mount options selecting this subvolume.
    pub fn mount_options(&self) -> Result<String> {
        if self.name.is_empty() {
            bail!("btrfs subvolume has no name");
        }
        let mut options = format!("subvol={}", self.name);
        if !self.compress.is_empty() {
            options.push_str(&format!(",compress={}", self.compress));
        }
        if self.read_only {
            options.push_str(",ro");
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mountpoint_names() {
        let mut btrfs = Btrfs::default();
        assert_eq!(btrfs.create_mountpoint("/", 0).unwrap().name, "root");
        assert_eq!(btrfs.create_mountpoint("/var", 0).unwrap().name, "var");
        assert_eq!(
            btrfs.create_mountpoint("/var/log", 0).unwrap().name,
            "var/log"
        );
        assert!(btrfs.create_mountpoint("/var", 0).is_err());
    }

    #[test]
    fn test_mount_options() {
        let subvolume = BtrfsSubvolume {
            name: "var".to_string(),
            compress: "zstd:1".to_string(),
            read_only: true,
            ..BtrfsSubvolume::default()
        };
        assert_eq!(
            subvolume.mount_options().unwrap(),
            "subvol=var,compress=zstd:1,ro"
        );

        let nameless = BtrfsSubvolume::default();
        assert!(nameless.mount_options().is_err());
    }

    #[test]
    fn test_btrfs_round_trip() {
        let mut btrfs = Btrfs {
            label: "fedora".to_string(),
            ..Btrfs::default()
        };
        btrfs.create_mountpoint("/", 0).unwrap();
        btrfs.create_mountpoint("/home", 0).unwrap();
        let json = serde_json::to_string(&btrfs).unwrap();
        let parsed: Btrfs = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, btrfs);
    }
}
