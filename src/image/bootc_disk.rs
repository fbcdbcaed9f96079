//! Bootable disks installed from a bootc container image.

use anyhow::{bail, Result};
use rand::RngCore;

use super::{
    export_artifact, make_compression_pipeline, make_image_pipeline, Artifact, ImagePipelineOpts,
};
use crate::blueprint::{Customizations, UserCustomization};
use crate::content::ContainerSourceSpec;
use crate::disk::PartitionTable;
use crate::manifest::{BuildPipeline, Manifest, Pipeline, RawBootcPipeline};
use crate::pathpolicy;
use crate::platform::{ImageFormat, Platform};

#[derive(Debug, Clone, Default)]
pub struct BootcDiskImage {
    pub platform: Platform,
    pub container: ContainerSourceSpec,
    pub partition_table: Option<PartitionTable>,
    pub users: Vec<UserCustomization>,
    pub kernel_options_append: Vec<String>,
    pub selinux: String,
    pub filename: String,
    pub compression: String,
}

/// Check customization paths against the ostree-image policies; bootc
/// images are ostree-based and most of the tree is immutable.
pub fn check_bootc_customizations(customizations: &Customizations) -> Result<()> {
    let files_policy = pathpolicy::ostree_custom_files_policies();
    let denied: Vec<String> = customizations
        .files
        .iter()
        .filter(|file| files_policy.check(std::path::Path::new(&file.path)).is_err())
        .map(|file| file.path.clone())
        .collect();
    if !denied.is_empty() {
        bail!("the following custom files are not allowed: {denied:?}");
    }

    let dirs_policy = pathpolicy::ostree_custom_directories_policies();
    let denied: Vec<String> = customizations
        .directories
        .iter()
        .filter(|dir| dirs_policy.check(std::path::Path::new(&dir.path)).is_err())
        .map(|dir| dir.path.clone())
        .collect();
    if !denied.is_empty() {
        bail!("the following custom directories are not allowed: {denied:?}");
    }
    Ok(())
}

impl BootcDiskImage {
    pub fn instantiate(
        &self,
        manifest: &mut Manifest,
        _rng: &mut dyn RngCore,
    ) -> Result<Artifact> {
        let format = match self.platform.image_format {
            ImageFormat::Unset => ImageFormat::Raw,
            format => format,
        };
        if format != ImageFormat::Raw && !self.compression.is_empty() {
            panic!(
                "no compression is allowed with {:?} format for bootc disk images",
                format
            );
        }

        let partition_table = self
            .partition_table
            .clone()
            .expect("bootc disk images require a partition table; this is a programming error");
        // bootupd owns the bootloader installation and needs both mounted
        for required in ["/boot", "/boot/efi"] {
            if !partition_table.contains_mountpoint(required) {
                bail!("bootc disk images require a {required} partition in the partition table");
            }
        }

        // the buildroot is bootstrapped from the container being installed
        let mut build =
            BuildPipeline::from_container("build", "org.osbuild.linux", self.container.clone());
        build.base.checkpoint = true;
        manifest.add(Pipeline::Build(build));

        let mut raw = RawBootcPipeline::new(
            "image",
            "build",
            self.container.clone(),
            self.platform.clone(),
        );
        raw.partition_table = Some(partition_table);
        raw.users = self.users.clone();
        raw.kernel_options_append = self.kernel_options_append.clone();
        raw.selinux = self.selinux.clone();
        let raw_filename = raw.filename.clone();
        manifest.add(Pipeline::RawBootc(raw));

        let opts = ImagePipelineOpts {
            qcow2_compat: self.platform.qcow2_compat.clone(),
            force_size: None,
            filename: self.filename.clone(),
        };
        let (image_pipeline, image_filename) = make_image_pipeline(
            manifest,
            self.platform.image_format,
            "build",
            "image",
            &raw_filename,
            &opts,
        );
        let (final_pipeline, _) = make_compression_pipeline(
            manifest,
            &self.compression,
            "build",
            &image_pipeline,
            &image_filename,
        );
        Ok(export_artifact(manifest, &final_pipeline, &self.filename, None))
    }
}
