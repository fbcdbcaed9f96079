//! The raw partitioned disk image assembled from an OS tree.

use anyhow::Result;

use super::PipelineBase;
use crate::disk::PartitionTable;
use crate::osbuild;
use crate::platform::Platform;

#[derive(Debug, Clone)]
pub struct RawImagePipeline {
    pub base: PipelineBase,
    /// Pipeline whose tree is copied into the image.
    pub tree_pipeline: String,
    pub filename: String,
    pub partition_table: PartitionTable,
    pub platform: Platform,
}

impl RawImagePipeline {
    pub fn new(
        name: &str,
        build: &str,
        tree_pipeline: &str,
        partition_table: PartitionTable,
        platform: Platform,
    ) -> Self {
        RawImagePipeline {
            base: PipelineBase::new(name, Some(build)),
            tree_pipeline: tree_pipeline.to_string(),
            filename: "disk.img".to_string(),
            partition_table,
            platform,
        }
    }

    /// Packages the buildroot needs to assemble this image.
    pub fn build_packages(&self) -> Vec<String> {
        let mut packages = vec!["util-linux".to_string(), "sfdisk".to_string()];
        let features = self.partition_table.features();
        if features.lvm {
            packages.push("lvm2".to_string());
        }
        if features.luks {
            packages.push("cryptsetup".to_string());
        }
        if features.btrfs {
            packages.push("btrfs-progs".to_string());
        }
        if self.platform.supports_bios() {
            packages.push("grub2-pc".to_string());
        }
        packages
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        let pt = &self.partition_table;
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);

        pipeline.add_stages(osbuild::gen_image_prepare_stages(pt, &self.filename));

        let (devices, mounts) = osbuild::gen_fs_devices_mounts(pt, &self.filename);
        let inputs = osbuild::new_pipeline_tree_inputs("tree", &self.tree_pipeline);
        pipeline.add_stage(osbuild::new_copy_stage_mounted(
            &[osbuild::CopyStagePath {
                from: "input://tree/".to_string(),
                to: "mount://root/".to_string(),
            }],
            inputs,
            devices,
            mounts,
        ));

        pipeline.add_stages(osbuild::gen_image_finish_stages(pt, &self.filename));

        if self.platform.supports_bios() {
            pipeline.add_stage(osbuild::gen_grub2_inst_stage(
                pt,
                &self.filename,
                &self.platform.bios_platform,
            )?);
        }

        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasizes::GIB;
    use crate::disk::{template, PartitioningMode, TemplateKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn planned() -> PartitionTable {
        let mut rng = StdRng::seed_from_u64(13);
        PartitionTable::plan(
            &template(TemplateKind::Plain),
            &[],
            3 * GIB,
            PartitioningMode::Raw,
            None,
            &mut rng,
        )
        .unwrap()
    }

    #[test]
    fn test_raw_image_stage_sequence() {
        let platform = Platform {
            bios_platform: "i386-pc".to_string(),
            ..Platform::default()
        };
        let raw = RawImagePipeline::new("image", "build", "os", planned(), platform);
        let pipeline = raw.serialize().unwrap();
        let types: Vec<&str> = pipeline.stages.iter().map(|s| s.stage_type.as_str()).collect();
        assert_eq!(types[0], "org.osbuild.truncate");
        assert_eq!(types[1], "org.osbuild.sfdisk");
        assert!(types.contains(&"org.osbuild.copy"));
        assert_eq!(*types.last().unwrap(), "org.osbuild.grub2.inst");

        // the copy stage mounts the tree input at the image root
        let copy = pipeline
            .stages
            .iter()
            .find(|s| s.stage_type == "org.osbuild.copy")
            .unwrap();
        let value = serde_json::to_value(copy).unwrap();
        assert_eq!(value["options"]["paths"][0]["to"], "mount://root/");
        assert_eq!(value["inputs"]["tree"]["references"][0], "name:os");
    }

    #[test]
    fn test_build_packages_follow_features() {
        let mut rng = StdRng::seed_from_u64(13);
        let pt = PartitionTable::plan(
            &template(TemplateKind::LuksLvm),
            &[],
            10 * GIB,
            PartitioningMode::Raw,
            None,
            &mut rng,
        )
        .unwrap();
        let raw = RawImagePipeline::new("image", "build", "os", pt, Platform::default());
        let packages = raw.build_packages();
        assert!(packages.contains(&"lvm2".to_string()));
        assert!(packages.contains(&"cryptsetup".to_string()));
        assert!(!packages.contains(&"grub2-pc".to_string()));
    }
}
