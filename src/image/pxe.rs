//! A PXE boot tree built from an OSTree-enabled OS tree, delivered as a
//! tar archive.

use anyhow::Result;
use rand::RngCore;

use super::{export_artifact, Artifact};
use crate::content::RepoConfig;
use crate::manifest::{
    BuildPipeline, CompressFormat, CompressPipeline, Manifest, OsCustomizations, OsPipeline,
    Pipeline, PxeRootfsType, PxeTreePipeline, TarPipeline,
};
use crate::platform::Platform;

#[derive(Debug, Clone, Default)]
pub struct PxeTreeImage {
    pub platform: Platform,
    pub customizations: OsCustomizations,
    pub packages: Vec<String>,
    pub repos: Vec<RepoConfig>,
    pub runner: String,
    pub build_packages: Vec<String>,
    pub os_tree_ref: String,
    pub rootfs_type: PxeRootfsType,
    pub filename: String,
    /// `xz` or empty.
    pub compression: String,
}

impl PxeTreeImage {
    pub fn instantiate(
        &self,
        manifest: &mut Manifest,
        _rng: &mut dyn RngCore,
    ) -> Result<Artifact> {
        let mut os = OsPipeline::new("os", "build", self.platform.clone(), self.repos.clone());
        os.packages = self.packages.clone();
        os.customizations = self.customizations.clone();
        os.os_tree_ref = self.os_tree_ref.clone();

        let mut pxe = PxeTreePipeline::new("pxe-tree", "build", "os", "");
        pxe.kernel_options_append = self.customizations.kernel_options_append.clone();
        pxe.rootfs_type = self.rootfs_type;
        pxe.arch_bcj = match self.platform.arch {
            crate::arch::Arch::X86_64 => "x86".to_string(),
            crate::arch::Arch::Aarch64 => "arm".to_string(),
            _ => String::new(),
        };

        let mut build = BuildPipeline::new(
            "build",
            &self.runner,
            self.repos.clone(),
            self.build_packages.clone(),
        );
        build.add_packages(&os.build_packages());
        build.add_packages(&pxe.build_packages());
        build.add_packages(&["tar".to_string()]);
        build.base.checkpoint = true;

        manifest.add(Pipeline::Build(build));
        manifest.add(Pipeline::Os(Box::new(os)));
        manifest.add(Pipeline::PxeTree(pxe));

        let mut tar = TarPipeline::new("archive", "build", "pxe-tree");
        tar.filename = self.filename.clone();
        let tar_filename = tar.filename.clone();
        manifest.add(Pipeline::Tar(tar));

        match self.compression.as_str() {
            "" => Ok(export_artifact(manifest, "archive", &self.filename, None)),
            "xz" => {
                let mut compress = CompressPipeline::new(
                    "xz",
                    "build",
                    CompressFormat::Xz,
                    "archive",
                    &tar_filename,
                );
                compress.filename = self.filename.clone();
                manifest.add(Pipeline::Compress(compress));
                Ok(export_artifact(manifest, "xz", &self.filename, None))
            }
            other => panic!("unsupported compression type {other:?}"),
        }
    }

}
