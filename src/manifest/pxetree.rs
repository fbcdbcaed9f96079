//! A PXE boot tree: kernel, initrd, EFI binaries, and a compressed root
//! filesystem with an example grub configuration.

use anyhow::Result;
use std::collections::BTreeMap;

use super::PipelineBase;
use crate::fsnode::FileNode;
use crate::osbuild;

/// Compression container for the PXE root filesystem image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PxeRootfsType {
    #[default]
    Squashfs,
    Erofs,
}

const GRUB_TEMPLATE: &str = "set timeout=60
menuentry 'http-rootfs' {
    linux /vmlinuz root=live:http://HTTP-SERVER/rootfs.img rd.live.image @CMDLINE@
    initrd /initrd.img
}
menuentry 'combined-rootfs' {
    linux /vmlinuz root=live:/rootfs.img rd.live.image @CMDLINE@
    initrd /combined.img
}
";

const README: &str = "\
# About this archive

This archive contains files suitable for use with PXE booting or UEFI HTTP
booting. It includes the following:

* EFI/ directory tree of shim and Grub2 bootloader files
* vmlinuz - kernel
* initrd.img - initial ramdisk
* rootfs.img - compressed root filesystem
* grub.cfg - a grub2 template

Make sure that the system has enough RAM to hold the kernel, initrd, and
rootfs in memory. 2GiB is usually enough for a small image.

The grub.cfg file is a template. The first entry serves the rootfs over
http; replace 'HTTP-SERVER' with the url of your server. The second entry
expects a combined image:

    echo rootfs.img | cpio -c --quiet -L -o > rootfs.cpio
    cat initrd.img rootfs.cpio > combined.img
";

#[derive(Debug, Clone)]
pub struct PxeTreePipeline {
    pub base: PipelineBase,
    /// The OS pipeline providing the root tree, kernel, and EFI files.
    pub os_pipeline: String,
    pub kernel_version: String,
    pub kernel_options_append: Vec<String>,
    pub rootfs_type: PxeRootfsType,
    pub rootfs_compression: String,
    /// BCJ filter for xz-compressed squashfs, from the target architecture.
    pub arch_bcj: String,
}

impl PxeTreePipeline {
    pub fn new(name: &str, build: &str, os_pipeline: &str, kernel_version: &str) -> Self {
        PxeTreePipeline {
            base: PipelineBase::new(name, Some(build)),
            os_pipeline: os_pipeline.to_string(),
            kernel_version: kernel_version.to_string(),
            kernel_options_append: Vec::new(),
            rootfs_type: PxeRootfsType::Squashfs,
            rootfs_compression: "xz".to_string(),
            arch_bcj: String::new(),
        }
    }

    pub fn build_packages(&self) -> Vec<String> {
        match self.rootfs_type {
            PxeRootfsType::Erofs => vec!["erofs-utils".to_string()],
            PxeRootfsType::Squashfs => vec!["squashfs-tools".to_string()],
        }
    }

    fn grub_config(&self) -> FileNode {
        let config = GRUB_TEMPLATE.replace("@CMDLINE@", &self.kernel_options_append.join(" "));
        FileNode::new("/grub.cfg", config.into_bytes()).expect("static path is valid")
    }

    fn readme(&self) -> FileNode {
        FileNode::new("/README", README.as_bytes().to_vec()).expect("static path is valid")
    }

    pub fn inline_data(&self) -> Vec<String> {
        vec![
            String::from_utf8_lossy(self.grub_config().data()).into_owned(),
            String::from_utf8_lossy(self.readme().data()).into_owned(),
        ]
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);

        let inputs = osbuild::new_pipeline_tree_inputs("tree", &self.os_pipeline);
        pipeline.add_stage(osbuild::new_copy_stage_simple(
            &[
                osbuild::CopyStagePath {
                    from: format!("input://tree/boot/vmlinuz-{}", self.kernel_version),
                    to: "tree:///vmlinuz".to_string(),
                },
                osbuild::CopyStagePath {
                    from: format!("input://tree/boot/initramfs-{}.img", self.kernel_version),
                    to: "tree:///initrd.img".to_string(),
                },
                osbuild::CopyStagePath {
                    from: "input://tree/boot/efi/EFI".to_string(),
                    to: "tree:///EFI".to_string(),
                },
            ],
            inputs,
        ));

        // the compressed root tree; must not use deployment or bind mounts
        match self.rootfs_type {
            PxeRootfsType::Erofs => {
                let method = if self.rootfs_compression.is_empty() {
                    "zstd".to_string()
                } else {
                    self.rootfs_compression.clone()
                };
                pipeline.add_stage(osbuild::new_erofs_stage(
                    &osbuild::ErofsStageOptions {
                        filename: "rootfs.img".to_string(),
                        compression: Some(osbuild::ErofsCompression {
                            method,
                            level: Some(8),
                        }),
                        extended_options: vec![
                            "all-fragments".to_string(),
                            "dedupe".to_string(),
                        ],
                        cluster_size: Some(131072),
                        exclude_paths: installer_boot_exclude_paths(),
                    },
                    &self.os_pipeline,
                ));
            }
            PxeRootfsType::Squashfs => {
                let options = (self.rootfs_compression == "xz" && !self.arch_bcj.is_empty())
                    .then(|| osbuild::FsCompressionOptions {
                        bcj: self.arch_bcj.clone(),
                    });
                pipeline.add_stage(osbuild::new_squashfs_stage(
                    &osbuild::SquashfsStageOptions {
                        filename: "rootfs.img".to_string(),
                        compression: osbuild::FsCompression {
                            method: "xz".to_string(),
                            options,
                        },
                        exclude_paths: installer_boot_exclude_paths(),
                    },
                    &self.os_pipeline,
                ));
            }
        }

        pipeline.add_stages(osbuild::gen_file_nodes_stages(&[
            self.grub_config(),
            self.readme(),
        ]));

        // everything in the tree must be readable by the tftp/http server
        let items = BTreeMap::from([
            (
                "/EFI".to_string(),
                osbuild::ChmodStagePathOptions {
                    mode: "ugo+Xr".to_string(),
                    recursive: true,
                },
            ),
            (
                "/vmlinuz".to_string(),
                osbuild::ChmodStagePathOptions {
                    mode: "0755".to_string(),
                    recursive: false,
                },
            ),
            (
                "/initrd.img".to_string(),
                osbuild::ChmodStagePathOptions {
                    mode: "0644".to_string(),
                    recursive: false,
                },
            ),
            (
                "/rootfs.img".to_string(),
                osbuild::ChmodStagePathOptions {
                    mode: "0644".to_string(),
                    recursive: false,
                },
            ),
            (
                "/grub.cfg".to_string(),
                osbuild::ChmodStagePathOptions {
                    mode: "0644".to_string(),
                    recursive: false,
                },
            ),
            (
                "/README".to_string(),
                osbuild::ChmodStagePathOptions {
                    mode: "0644".to_string(),
                    recursive: false,
                },
            ),
        ]);
        pipeline.add_stage(osbuild::new_chmod_stage(&items));

        Ok(pipeline)
    }
}

/// Boot content is stripped from compressed installer/PXE root images to
/// save space; the kernel and initrd travel separately.
pub(crate) fn installer_boot_exclude_paths() -> Vec<String> {
    vec!["boot/".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pxe() -> PxeTreePipeline {
        let mut pxe = PxeTreePipeline::new("pxe-tree", "build", "os", "6.8.0-100.fc40.x86_64");
        pxe.kernel_options_append = vec!["console=ttyS0".to_string(), "quiet".to_string()];
        pxe
    }

    #[test]
    fn test_pxe_tree_artifacts() {
        let pipeline = pxe().serialize().unwrap();
        let types: Vec<&str> = pipeline.stages.iter().map(|s| s.stage_type.as_str()).collect();
        assert_eq!(types[0], "org.osbuild.copy");
        assert!(types.contains(&"org.osbuild.squashfs"));
        assert_eq!(*types.last().unwrap(), "org.osbuild.chmod");

        let chmod = serde_json::to_value(pipeline.stages.last().unwrap()).unwrap();
        let items = chmod["options"]["items"].as_object().unwrap();
        let mut paths: Vec<&str> = items.keys().map(String::as_str).collect();
        paths.sort_unstable();
        assert_eq!(
            paths,
            vec!["/EFI", "/README", "/grub.cfg", "/initrd.img", "/rootfs.img", "/vmlinuz"]
        );
    }

    #[test]
    fn test_grub_config_embeds_kernel_append() {
        let pxe = pxe();
        let data = pxe.inline_data();
        assert!(data[0].contains("rd.live.image console=ttyS0 quiet"));
    }

    #[test]
    fn test_erofs_variant() {
        let mut pxe = pxe();
        pxe.rootfs_type = PxeRootfsType::Erofs;
        pxe.rootfs_compression = "zstd".to_string();
        let pipeline = pxe.serialize().unwrap();
        let erofs = pipeline
            .stages
            .iter()
            .find(|s| s.stage_type == "org.osbuild.erofs")
            .unwrap();
        let value = serde_json::to_value(erofs).unwrap();
        assert_eq!(value["options"]["compression"]["method"], "zstd");
        assert_eq!(value["options"]["compression"]["level"], 8);
        assert_eq!(value["options"]["options"][0], "all-fragments");
        assert!(pipeline.stages.iter().all(|s| s.mounts.is_none()));
    }

    #[test]
    fn test_build_packages_by_rootfs_type() {
        assert_eq!(pxe().build_packages(), vec!["squashfs-tools".to_string()]);
        let mut erofs = pxe();
        erofs.rootfs_type = PxeRootfsType::Erofs;
        assert_eq!(erofs.build_packages(), vec!["erofs-utils".to_string()]);
    }
}
