//! Image-kind composers: assemble well-typed pipeline graphs for each kind
//! of output artifact.
//!
//! A composer declares pipelines into a [`Manifest`](crate::manifest::Manifest)
//! and returns the [`Artifact`] the caller should export. Content resolution
//! happens afterwards, through the manifest's content queries.

mod archive;
mod bootc_disk;
mod disk;
mod installer;
mod ostree_raw;
mod pxe;

pub use archive::ArchiveImage;
pub use bootc_disk::{check_bootc_customizations, BootcDiskImage};
pub use disk::DiskImage;
pub use installer::AnacondaInstallerIso;
pub use ostree_raw::OstreeRawImage;
pub use pxe::PxeTreeImage;

use tracing::warn;

use crate::manifest::{
    CompressFormat, CompressPipeline, ConvertFormat, ConvertPipeline, Manifest, OvfPipeline,
    Pipeline, TarPipeline,
};
use crate::osbuild;
use crate::platform::ImageFormat;

/// The exported artifact of a composed manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Name of the exported pipeline.
    pub pipeline: String,
    pub filename: String,
    pub mime_type: Option<String>,
}

pub(crate) struct ImagePipelineOpts {
    pub qcow2_compat: String,
    pub force_size: Option<bool>,
    pub filename: String,
}

/// Wrap the raw image pipeline in the format conversion the platform wants.
/// Returns the name and artifact filename of the outermost pipeline.
pub(crate) fn make_image_pipeline(
    manifest: &mut Manifest,
    format: ImageFormat,
    build: &str,
    raw_pipeline: &str,
    raw_filename: &str,
    opts: &ImagePipelineOpts,
) -> (String, String) {
    match format {
        ImageFormat::Unset => {
            // ostree image definitions do not always set a format
            warn!("image format unset, treating as raw");
            (raw_pipeline.to_string(), raw_filename.to_string())
        }
        ImageFormat::Raw => (raw_pipeline.to_string(), raw_filename.to_string()),
        ImageFormat::Qcow2 => {
            let convert = ConvertPipeline::new(
                "qcow2",
                build,
                raw_pipeline,
                raw_filename,
                ConvertFormat::Qcow2 {
                    compat: opts.qcow2_compat.clone(),
                },
            );
            let filename = convert.filename.clone();
            manifest.add(Pipeline::Convert(convert));
            ("qcow2".to_string(), filename)
        }
        ImageFormat::Vhd => {
            let convert = ConvertPipeline::new(
                "vpc",
                build,
                raw_pipeline,
                raw_filename,
                ConvertFormat::Vpc {
                    force_size: opts.force_size,
                },
            );
            let filename = convert.filename.clone();
            manifest.add(Pipeline::Convert(convert));
            ("vpc".to_string(), filename)
        }
        ImageFormat::Vmdk => {
            let convert =
                ConvertPipeline::new("vmdk", build, raw_pipeline, raw_filename, ConvertFormat::Vmdk);
            let filename = convert.filename.clone();
            manifest.add(Pipeline::Convert(convert));
            ("vmdk".to_string(), filename)
        }
        ImageFormat::Ova => {
            let vmdk =
                ConvertPipeline::new("vmdk", build, raw_pipeline, raw_filename, ConvertFormat::Vmdk);
            let vmdk_filename = vmdk.filename.clone();
            manifest.add(Pipeline::Convert(vmdk));
            manifest.add(Pipeline::Ovf(OvfPipeline::new(
                "ovf",
                build,
                "vmdk",
                &vmdk_filename,
            )));

            let mut tar = TarPipeline::new("archive", build, "ovf");
            tar.format = osbuild::TAR_FORMAT_USTAR.to_string();
            tar.filename = opts.filename.clone();
            // the descriptor must be the first member of the archive
            let stem = opts
                .filename
                .rsplit_once('.')
                .map(|(stem, _)| stem.to_string())
                .unwrap_or_else(|| opts.filename.clone());
            tar.paths = vec![
                format!("{stem}.ovf"),
                format!("{stem}.mf"),
                format!("{stem}.vmdk"),
            ];
            manifest.add(Pipeline::Tar(tar));
            ("archive".to_string(), opts.filename.clone())
        }
        ImageFormat::Gce => {
            // gcp expects the archive member to be named disk.raw
            if let Some(raw) = manifest.get_mut(raw_pipeline) {
                raw.set_filename("disk.raw");
            }
            let mut tar = TarPipeline::new("archive", build, raw_pipeline);
            tar.format = osbuild::TAR_FORMAT_OLDGNU.to_string();
            tar.root_node = osbuild::TAR_ROOT_NODE_OMIT.to_string();
            // gcp image import chokes on these
            tar.acls = Some(false);
            tar.selinux = Some(false);
            tar.xattrs = Some(false);
            tar.filename = opts.filename.clone();
            manifest.add(Pipeline::Tar(tar));
            ("archive".to_string(), opts.filename.clone())
        }
    }
}

/// Wrap the image pipeline in a compression pipeline. Only xz is supported
/// for disk images; unknown strings are a programming error in the image
/// definition.
pub(crate) fn make_compression_pipeline(
    manifest: &mut Manifest,
    compression: &str,
    build: &str,
    image_pipeline: &str,
    image_filename: &str,
) -> (String, String) {
    match compression {
        "" => (image_pipeline.to_string(), image_filename.to_string()),
        "xz" => {
            let compress = CompressPipeline::new(
                "xz",
                build,
                CompressFormat::Xz,
                image_pipeline,
                image_filename,
            );
            let filename = compress.filename.clone();
            manifest.add(Pipeline::Compress(compress));
            ("xz".to_string(), filename)
        }
        other => panic!("unsupported compression type {other:?}"),
    }
}

/// Mark a pipeline as the export and return its artifact description.
pub(crate) fn export_artifact(
    manifest: &mut Manifest,
    pipeline: &str,
    filename: &str,
    mime_type: Option<&str>,
) -> Artifact {
    let exported = manifest
        .get_mut(pipeline)
        .unwrap_or_else(|| panic!("export of unknown pipeline {pipeline:?}"));
    exported.base_mut().export = true;
    exported.set_filename(filename);
    Artifact {
        pipeline: pipeline.to_string(),
        filename: filename.to_string(),
        mime_type: mime_type.map(String::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{BuildPipeline, RawImagePipeline};
    use crate::platform::Platform;

    fn manifest_with_raw() -> Manifest {
        let mut manifest = Manifest::default();
        manifest.add(Pipeline::Build(BuildPipeline::new(
            "build",
            "org.osbuild.fedora40",
            vec![],
            vec![],
        )));
        manifest.add(Pipeline::RawImage(RawImagePipeline::new(
            "image",
            "build",
            "os",
            crate::disk::template(crate::disk::TemplateKind::Plain),
            Platform::default(),
        )));
        manifest
    }

    fn opts(filename: &str) -> ImagePipelineOpts {
        ImagePipelineOpts {
            qcow2_compat: "1.1".to_string(),
            force_size: None,
            filename: filename.to_string(),
        }
    }

    #[test]
    fn test_qcow2_wrapping() {
        let mut manifest = manifest_with_raw();
        let (pipeline, filename) = make_image_pipeline(
            &mut manifest,
            ImageFormat::Qcow2,
            "build",
            "image",
            "disk.img",
            &opts("disk.qcow2"),
        );
        assert_eq!(pipeline, "qcow2");
        assert_eq!(filename, "disk.qcow2");
    }

    #[test]
    fn test_ova_archive_member_order() {
        let mut manifest = manifest_with_raw();
        let (pipeline, _) = make_image_pipeline(
            &mut manifest,
            ImageFormat::Ova,
            "build",
            "image",
            "disk.img",
            &opts("appliance.ova"),
        );
        assert_eq!(pipeline, "archive");
        let tar = manifest
            .pipelines()
            .iter()
            .find_map(|p| match p {
                Pipeline::Tar(tar) => Some(tar),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            tar.paths,
            vec![
                "appliance.ovf".to_string(),
                "appliance.mf".to_string(),
                "appliance.vmdk".to_string()
            ]
        );
        assert_eq!(tar.format, "ustar");
    }

    #[test]
    fn test_gce_tar_settings() {
        let mut manifest = manifest_with_raw();
        make_image_pipeline(
            &mut manifest,
            ImageFormat::Gce,
            "build",
            "image",
            "disk.raw",
            &opts("image.tar.gz"),
        );
        let tar = manifest
            .pipelines()
            .iter()
            .find_map(|p| match p {
                Pipeline::Tar(tar) => Some(tar),
                _ => None,
            })
            .unwrap();
        assert_eq!(tar.format, "oldgnu");
        assert_eq!(tar.root_node, "omit");
        assert_eq!(tar.acls, Some(false));
        assert_eq!(tar.selinux, Some(false));
        assert_eq!(tar.xattrs, Some(false));
    }

    #[test]
    #[should_panic(expected = "unsupported compression")]
    fn test_unknown_compression_panics() {
        let mut manifest = manifest_with_raw();
        make_compression_pipeline(&mut manifest, "lz4", "build", "image", "disk.img");
    }
}
