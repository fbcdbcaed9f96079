//! The classic partitioned disk image built from RPMs.

use anyhow::Result;
use rand::RngCore;

use super::{
    export_artifact, make_compression_pipeline, make_image_pipeline, Artifact, ImagePipelineOpts,
};
use crate::content::RepoConfig;
use crate::disk::PartitionTable;
use crate::manifest::{
    BuildPipeline, Manifest, OsCustomizations, OsPipeline, Pipeline, RawImagePipeline,
    WorkloadConfig,
};
use crate::platform::Platform;

#[derive(Debug, Clone, Default)]
pub struct DiskImage {
    pub platform: Platform,
    pub partition_table: Option<PartitionTable>,
    pub customizations: OsCustomizations,
    pub workload: Option<WorkloadConfig>,
    /// The platform link of the OS package-set chain.
    pub packages: Vec<String>,
    pub exclude_packages: Vec<String>,
    pub install_weak_deps: bool,
    pub repos: Vec<RepoConfig>,
    /// Runner and base packages of the buildroot, from the distro.
    pub runner: String,
    pub build_packages: Vec<String>,
    pub filename: String,
    pub compression: String,
    pub os_product: String,
    pub os_version: String,
    pub os_nick: String,
}

impl DiskImage {
    /// Declare the pipeline graph for this image into `manifest`.
    pub fn instantiate(
        &self,
        manifest: &mut Manifest,
        _rng: &mut dyn RngCore,
    ) -> Result<Artifact> {
        let partition_table = self
            .partition_table
            .clone()
            .expect("disk images require a partition table; this is a programming error");

        let mut os = OsPipeline::new("os", "build", self.platform.clone(), self.repos.clone());
        os.packages = self.packages.clone();
        os.exclude_packages = self.exclude_packages.clone();
        os.install_weak_deps = self.install_weak_deps;
        os.customizations = self.customizations.clone();
        os.workload = self.workload.clone();
        os.partition_table = Some(partition_table.clone());
        os.os_product = self.os_product.clone();
        os.os_version = self.os_version.clone();
        os.os_nick = self.os_nick.clone();

        let raw = RawImagePipeline::new(
            "image",
            "build",
            "os",
            partition_table,
            self.platform.clone(),
        );

        // the experimental bootstrap buildroot replaces the depsolved one
        let mut build = match manifest.config.bootstrap_container.clone() {
            Some(container) => BuildPipeline::from_container("build", &self.runner, container),
            None => BuildPipeline::new(
                "build",
                &self.runner,
                self.repos.clone(),
                self.build_packages.clone(),
            ),
        };
        build.add_packages(&os.build_packages());
        build.add_packages(&raw.build_packages());
        build.base.checkpoint = true;

        let raw_filename = raw.filename.clone();
        manifest.add(Pipeline::Build(build));
        manifest.add(Pipeline::Os(Box::new(os)));
        manifest.add(Pipeline::RawImage(raw));

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
