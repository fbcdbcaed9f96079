//! File pipelines that convert or wrap another pipeline's artifact:
//! qemu-img format conversion, OVF descriptors, tar archives, and
//! compression wrappers.

use anyhow::Result;

use super::PipelineBase;
use crate::osbuild;

/// Formats produced via `qemu-img convert`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvertFormat {
    Qcow2 { compat: String },
    Vpc { force_size: Option<bool> },
    Vmdk,
}

#[derive(Debug, Clone)]
pub struct ConvertPipeline {
    pub base: PipelineBase,
    pub input_pipeline: String,
    pub input_filename: String,
    pub filename: String,
    pub format: ConvertFormat,
}

impl ConvertPipeline {
    pub fn new(
        name: &str,
        build: &str,
        input_pipeline: &str,
        input_filename: &str,
        format: ConvertFormat,
    ) -> Self {
        let filename = match &format {
            ConvertFormat::Qcow2 { .. } => "disk.qcow2",
            ConvertFormat::Vpc { .. } => "disk.vhd",
            ConvertFormat::Vmdk => "disk.vmdk",
        };
        ConvertPipeline {
            base: PipelineBase::new(name, Some(build)),
            input_pipeline: input_pipeline.to_string(),
            input_filename: input_filename.to_string(),
            filename: filename.to_string(),
            format,
        }
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        let format = match &self.format {
            ConvertFormat::Qcow2 { compat } => osbuild::QemuFormatOptions {
                format_type: "qcow2".to_string(),
                compat: compat.clone(),
                ..osbuild::QemuFormatOptions::default()
            },
            ConvertFormat::Vpc { force_size } => osbuild::QemuFormatOptions {
                format_type: "vpc".to_string(),
                force_size: *force_size,
                ..osbuild::QemuFormatOptions::default()
            },
            ConvertFormat::Vmdk => osbuild::QemuFormatOptions {
                format_type: "vmdk".to_string(),
                subformat: "streamOptimized".to_string(),
                ..osbuild::QemuFormatOptions::default()
            },
        };
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);
        pipeline.add_stage(osbuild::new_qemu_stage(
            &osbuild::QemuStageOptions {
                filename: self.filename.clone(),
                format,
            },
            &self.input_pipeline,
            &self.input_filename,
        ));
        Ok(pipeline)
    }
}

/// Generates the OVF descriptor and manifest next to a VMDK.
#[derive(Debug, Clone)]
pub struct OvfPipeline {
    pub base: PipelineBase,
    pub vmdk_pipeline: String,
    pub vmdk_filename: String,
}

impl OvfPipeline {
    pub fn new(name: &str, build: &str, vmdk_pipeline: &str, vmdk_filename: &str) -> Self {
        OvfPipeline {
            base: PipelineBase::new(name, Some(build)),
            vmdk_pipeline: vmdk_pipeline.to_string(),
            vmdk_filename: vmdk_filename.to_string(),
        }
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);
        // the descriptor is generated alongside a copy of the disk
        let inputs = std::collections::BTreeMap::from([(
            "vmdk".to_string(),
            osbuild::new_file_input_for_pipeline(&self.vmdk_pipeline, &self.vmdk_filename),
        )]);
        pipeline.add_stage(osbuild::new_copy_stage_simple(
            &[osbuild::CopyStagePath {
                from: format!(
                    "input://vmdk/{}",
                    self.vmdk_filename.trim_start_matches('/')
                ),
                to: format!("tree:///{}", self.vmdk_filename.trim_start_matches('/')),
            }],
            inputs,
        ));
        pipeline.add_stage(osbuild::new_ovf_stage(
            &self.vmdk_pipeline,
            &self.vmdk_filename,
        ));
        Ok(pipeline)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TarPipeline {
    pub base: PipelineBase,
    pub input_pipeline: String,
    pub filename: String,
    /// Archive format; empty lets the stage default apply.
    pub format: String,
    pub root_node: String,
    pub acls: Option<bool>,
    pub selinux: Option<bool>,
    pub xattrs: Option<bool>,
    /// Explicit member ordering, for formats where it matters.
    pub paths: Vec<String>,
}

impl TarPipeline {
    pub fn new(name: &str, build: &str, input_pipeline: &str) -> Self {
        TarPipeline {
            base: PipelineBase::new(name, Some(build)),
            input_pipeline: input_pipeline.to_string(),
            filename: "tree.tar".to_string(),
            ..TarPipeline::default()
        }
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);
        pipeline.add_stage(osbuild::new_tar_stage(
            &osbuild::TarStageOptions {
                filename: self.filename.clone(),
                format: self.format.clone(),
                root_node: self.root_node.clone(),
                acls: self.acls,
                selinux: self.selinux,
                xattrs: self.xattrs,
                paths: self.paths.clone(),
            },
            &self.input_pipeline,
        ));
        Ok(pipeline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressFormat {
    Xz,
    Zstd,
    Gzip,
}

#[derive(Debug, Clone)]
pub struct CompressPipeline {
    pub base: PipelineBase,
    pub format: CompressFormat,
    pub input_pipeline: String,
    pub input_filename: String,
    pub filename: String,
}

impl CompressPipeline {
    pub fn new(
        name: &str,
        build: &str,
        format: CompressFormat,
        input_pipeline: &str,
        input_filename: &str,
    ) -> Self {
        CompressPipeline {
            base: PipelineBase::new(name, Some(build)),
            format,
            input_pipeline: input_pipeline.to_string(),
            input_filename: input_filename.to_string(),
            filename: format!("{input_filename}.xz"),
        }
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);
        let stage = match self.format {
            CompressFormat::Xz => osbuild::new_xz_stage(
                &self.filename,
                &self.input_pipeline,
                &self.input_filename,
            ),
            CompressFormat::Zstd => osbuild::new_zstd_stage(
                &self.filename,
                &self.input_pipeline,
                &self.input_filename,
            ),
            CompressFormat::Gzip => osbuild::new_gzip_stage(
                &self.filename,
                &self.input_pipeline,
                &self.input_filename,
            ),
        };
        pipeline.add_stage(stage);
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qcow2_compat() {
        let convert = ConvertPipeline::new(
            "qcow2",
            "build",
            "image",
            "disk.img",
            ConvertFormat::Qcow2 {
                compat: "1.1".to_string(),
            },
        );
        let pipeline = convert.serialize().unwrap();
        let value = serde_json::to_value(&pipeline.stages[0]).unwrap();
        assert_eq!(value["type"], "org.osbuild.qemu");
        assert_eq!(value["options"]["format"]["type"], "qcow2");
        assert_eq!(value["options"]["format"]["compat"], "1.1");
    }

    #[test]
    fn test_vmdk_subformat() {
        let convert =
            ConvertPipeline::new("vmdk", "build", "image", "disk.img", ConvertFormat::Vmdk);
        let pipeline = convert.serialize().unwrap();
        let value = serde_json::to_value(&pipeline.stages[0]).unwrap();
        assert_eq!(value["options"]["format"]["subformat"], "streamOptimized");
    }

    #[test]
    fn test_compress_stage_types() {
        for (format, stage_type) in [
            (CompressFormat::Xz, "org.osbuild.xz"),
            (CompressFormat::Zstd, "org.osbuild.zstd"),
            (CompressFormat::Gzip, "org.osbuild.gzip"),
        ] {
            let compress = CompressPipeline::new("compress", "build", format, "archive", "x.tar");
            let pipeline = compress.serialize().unwrap();
            assert_eq!(pipeline.stages[0].stage_type, stage_type);
        }
    }
}
