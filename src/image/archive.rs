//! A plain tar archive of an OS tree, optionally compressed.

use anyhow::Result;
use rand::RngCore;

use super::{export_artifact, Artifact};
use crate::content::RepoConfig;
use crate::manifest::{
    BuildPipeline, CompressFormat, CompressPipeline, Manifest, OsCustomizations, OsPipeline,
    Pipeline, TarPipeline, WorkloadConfig,
};
use crate::platform::Platform;

#[derive(Debug, Clone, Default)]
pub struct ArchiveImage {
    pub platform: Platform,
    pub customizations: OsCustomizations,
    pub workload: Option<WorkloadConfig>,
    pub packages: Vec<String>,
    pub repos: Vec<RepoConfig>,
    pub runner: String,
    pub build_packages: Vec<String>,
    pub filename: String,
    /// `xz`, `zstd`, `gzip`, or empty for no compression.
    pub compression: String,
    pub os_version: String,
}

impl ArchiveImage {
    pub fn instantiate(
        &self,
        manifest: &mut Manifest,
        _rng: &mut dyn RngCore,
    ) -> Result<Artifact> {
        let mut os = OsPipeline::new("os", "build", self.platform.clone(), self.repos.clone());
        os.packages = self.packages.clone();
        os.customizations = self.customizations.clone();
        os.workload = self.workload.clone();
        os.os_version = self.os_version.clone();

        let mut build = BuildPipeline::new(
            "build",
            &self.runner,
            self.repos.clone(),
            self.build_packages.clone(),
        );
        build.add_packages(&os.build_packages());
        build.add_packages(&["tar".to_string()]);
        build.base.checkpoint = true;

        manifest.add(Pipeline::Build(build));
        manifest.add(Pipeline::Os(Box::new(os)));

        let mut tar = TarPipeline::new("archive", "build", "os");
        tar.filename = self.filename.clone();
        let tar_filename = tar.filename.clone();
        manifest.add(Pipeline::Tar(tar));

        let format = match self.compression.as_str() {
            "" => {
                return Ok(export_artifact(manifest, "archive", &self.filename, None));
            }
            "xz" => CompressFormat::Xz,
            "zstd" => CompressFormat::Zstd,
            "gzip" => CompressFormat::Gzip,
            other => panic!("unsupported compression type {other:?}"),
        };
        let mut compress =
            CompressPipeline::new("compressed", "build", format, "archive", &tar_filename);
        compress.filename = self.filename.clone();
        manifest.add(Pipeline::Compress(compress));
        Ok(export_artifact(manifest, "compressed", &self.filename, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn image(compression: &str) -> ArchiveImage {
        ArchiveImage {
            packages: vec!["@core".to_string()],
            runner: "org.osbuild.fedora40".to_string(),
            filename: "root.tar.xz".to_string(),
            compression: compression.to_string(),
            ..ArchiveImage::default()
        }
    }

    #[test]
    fn test_archive_pipelines() {
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        let artifact = image("xz").instantiate(&mut manifest, &mut rng).unwrap();
        let names: Vec<&str> = manifest.pipelines().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["build", "os", "archive", "compressed"]);
        assert_eq!(artifact.filename, "root.tar.xz");
    }

    #[test]
    fn test_uncompressed_archive() {
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        let artifact = image("").instantiate(&mut manifest, &mut rng).unwrap();
        assert_eq!(artifact.pipeline, "archive");
        assert_eq!(manifest.pipelines().len(), 3);
    }

    #[test]
    #[should_panic(expected = "unsupported compression")]
    fn test_unknown_compression() {
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        let _ = image("brotli").instantiate(&mut manifest, &mut rng);
    }
}
