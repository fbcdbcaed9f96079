//! Target platform: architecture plus firmware and output format details.

use serde::{Deserialize, Serialize};

use crate::arch::Arch;

/// Output format of a disk image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Unset,
    Raw,
    Qcow2,
    Vhd,
    Vmdk,
    Ova,
    Gce,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Unset => "unset",
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhd => "vhd",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Ova => "ova",
            ImageFormat::Gce => "gce",
        }
    }
}

/// What a pipeline graph is being built for: the architecture, the firmware
/// interfaces the image must boot from, and the output format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Platform {
    pub arch: Arch,
    pub image_format: ImageFormat,
    /// qcow2 compat level, e.g. `1.1`.
    pub qcow2_compat: String,
    /// grub2 platform id when the image boots from BIOS, e.g. `i386-pc`;
    /// empty for UEFI-only images.
    pub bios_platform: String,
    /// EFI vendor directory, e.g. `fedora`; empty disables UEFI support.
    pub uefi_vendor: String,
    /// Extra packages the buildroot needs to assemble images for this
    /// platform (e.g. grub2 tools, e2fsprogs).
    pub build_packages: Vec<String>,
}

impl Platform {
    pub fn supports_bios(&self) -> bool {
        !self.bios_platform.is_empty()
    }

    pub fn supports_uefi(&self) -> bool {
        !self.uefi_vendor.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_firmware_flags() {
        let platform = Platform {
            bios_platform: "i386-pc".to_string(),
            uefi_vendor: "fedora".to_string(),
            ..Platform::default()
        };
        assert!(platform.supports_bios());
        assert!(platform.supports_uefi());
        assert!(!Platform::default().supports_bios());
    }
}
