//! The user-facing customization document.
//!
//! A blueprint is a TOML (or JSON) document selecting packages and
//! customizations for an image. Parsing is strict: unknown keys are
//! configuration errors, and every size field accepts an integer byte count
//! or a unit string (see [`crate::datasizes`]).

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::datasizes::Size;
use crate::disk::PartitioningMode;
use crate::fsnode::{DirectoryNode, FileNode, NodeOwner};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Blueprint {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizations: Option<Customizations>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSelection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Customizations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user: Vec<UserCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group: Vec<GroupCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filesystem: Vec<FilesystemCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitioning_mode: Option<PartitioningMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<DirectoryCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<ServicesCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer: Option<InstallerCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<TimezoneCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<LocaleCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<FirewallCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fips: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserCustomization {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupCustomization {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Extra kernel command-line tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemCustomization {
    pub mountpoint: String,
    pub minsize: Size,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minsize: Option<Size>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub table_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<PartitionCustomization>,
}

/// One requested partition. `part_kind` selects which of the nested
/// descriptors applies: a plain filesystem, an LVM volume group, or a btrfs
/// volume with subvolumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionCustomization {
    #[serde(default = "default_part_kind", rename = "type")]
    pub part_kind: PartitionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minsize: Option<Size>,
    /// Partition type: an MBR byte code or GPT type GUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_label: Option<String>,
    // plain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    // lvm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logical_volumes: Vec<LogicalVolumeCustomization>,
    // btrfs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subvolumes: Vec<BtrfsSubvolumeCustomization>,
}

fn default_part_kind() -> PartitionKind {
    PartitionKind::Plain
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Plain,
    Lvm,
    Btrfs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogicalVolumeCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub mountpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minsize: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BtrfsSubvolumeCustomization {
    pub name: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryCustomization {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<NodeOwner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<NodeOwner>,
    #[serde(default)]
    pub ensure_parents: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileCustomization {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<NodeOwner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<NodeOwner>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicesCustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallerCustomization {
    #[serde(default)]
    pub unattended: bool,
    #[serde(default, rename = "sudo-nopasswd", skip_serializing_if = "Vec::is_empty")]
    pub sudo_nopasswd: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kickstart: Option<KickstartCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<AnacondaModulesCustomization>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KickstartCustomization {
    /// Verbatim kickstart content appended via %include.
    pub contents: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnacondaModulesCustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disable: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimezoneCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ntpservers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocaleCustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallCustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<FirewallServicesCustomization>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallServicesCustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<String>,
}

impl Blueprint {
    /// Parse a blueprint from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("cannot parse blueprint TOML")
    }

    /// Parse a blueprint from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("cannot parse blueprint JSON")
    }

    /// Load a blueprint from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read blueprint '{}'", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&text),
            Some("json") => Self::from_json(&text),
            _ => bail!("blueprint '{}' must be .toml or .json", path.display()),
        }
    }

    pub fn customizations(&self) -> Customizations {
        self.customizations.clone().unwrap_or_default()
    }

    /// Names from the blueprint-level package list.
    pub fn package_names(&self) -> Vec<String> {
        self.packages
            .iter()
            .map(|selection| match &selection.version {
                Some(version) if !version.is_empty() && version != "*" => {
                    format!("{}-{}", selection.name, version)
                }
                _ => selection.name.clone(),
            })
            .collect()
    }
}

fn parse_mode(mode: &Option<String>) -> Result<Option<u32>> {
    match mode {
        None => Ok(None),
        Some(text) => {
            let mode = u32::from_str_radix(text, 8)
                .with_context(|| format!("invalid mode '{text}': must be octal"))?;
            Ok(Some(mode))
        }
    }
}

impl Customizations {
    /// Kernel command-line tokens appended by the user.
    pub fn kernel_append(&self) -> Vec<String> {
        self.kernel
            .as_ref()
            .and_then(|kernel| kernel.append.as_deref())
            .map(|append| append.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }

    /// Convert the file customizations to validated file nodes.
    pub fn file_nodes(&self) -> Result<Vec<FileNode>> {
        self.files
            .iter()
            .map(|file| {
                let mut node = FileNode::new(
                    file.path.clone(),
                    file.data.clone().unwrap_or_default().into_bytes(),
                )?;
                node.mode = parse_mode(&file.mode)?;
                node.user = file.user.clone();
                node.group = file.group.clone();
                Ok(node)
            })
            .collect()
    }

    /// Convert the directory customizations to validated directory nodes.
    pub fn directory_nodes(&self) -> Result<Vec<DirectoryNode>> {
        self.directories
            .iter()
            .map(|dir| {
                let mut node = DirectoryNode::new(dir.path.clone())?;
                node.mode = parse_mode(&dir.mode)?;
                node.user = dir.user.clone();
                node.group = dir.group.clone();
                node.ensure_parent_dirs = dir.ensure_parents;
                Ok(node)
            })
            .collect()
    }

    /// Mountpoint/minsize pairs from the filesystem customizations.
    pub fn filesystem_requests(&self) -> Vec<(String, u64)> {
        self.filesystem
            .iter()
            .map(|fs| (fs.mountpoint.clone(), fs.minsize.bytes()))
            .collect()
    }

    pub fn fips_enabled(&self) -> bool {
        self.fips.unwrap_or(false)
    }
}
