//! A raw disk image deployed from an OSTree commit.

use anyhow::Result;
use rand::RngCore;

use super::{
    export_artifact, make_compression_pipeline, make_image_pipeline, Artifact, ImagePipelineOpts,
};
use crate::content::{OstreeSourceSpec, RepoConfig};
use crate::disk::PartitionTable;
use crate::manifest::{
    BuildPipeline, Manifest, OstreeDeploymentPipeline, Pipeline, RawImagePipeline,
};
use crate::platform::Platform;

#[derive(Debug, Clone, Default)]
pub struct OstreeRawImage {
    pub platform: Platform,
    pub commit: OstreeSourceSpec,
    pub os_name: String,
    pub remote_url: String,
    pub partition_table: Option<PartitionTable>,
    pub kernel_options_append: Vec<String>,
    pub sysroot_readonly: bool,
    pub repos: Vec<RepoConfig>,
    pub runner: String,
    pub build_packages: Vec<String>,
    pub filename: String,
    pub compression: String,
}

impl OstreeRawImage {
    pub fn instantiate(
        &self,
        manifest: &mut Manifest,
        _rng: &mut dyn RngCore,
    ) -> Result<Artifact> {
        let partition_table = self
            .partition_table
            .clone()
            .expect("ostree raw images require a partition table; this is a programming error");

        let mut deployment = OstreeDeploymentPipeline::new(
            "ostree-deployment",
            "build",
            self.commit.clone(),
            &self.os_name,
            self.platform.clone(),
        );
        deployment.partition_table = Some(partition_table.clone());
        deployment.kernel_options_append = self.kernel_options_append.clone();
        deployment.sysroot_readonly = self.sysroot_readonly;
        deployment.remote_url = self.remote_url.clone();

        let raw = RawImagePipeline::new(
            "image",
            "build",
            "ostree-deployment",
            partition_table,
            self.platform.clone(),
        );

        let mut build = BuildPipeline::new(
            "build",
            &self.runner,
            self.repos.clone(),
            self.build_packages.clone(),
        );
        build.add_packages(&deployment.build_packages());
        build.add_packages(&raw.build_packages());
        build.base.checkpoint = true;

        let raw_filename = raw.filename.clone();
        manifest.add(Pipeline::Build(build));
        manifest.add(Pipeline::OstreeDeployment(Box::new(deployment)));
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
