//! An OSTree commit deployed as a bootable tree.

use anyhow::Result;

use super::{PipelineBase, PipelineInputs};
use crate::content::{OstreeCommitSpec, OstreeSourceSpec};
use crate::disk::PartitionTable;
use crate::osbuild;
use crate::platform::Platform;

#[derive(Debug, Clone, Default)]
pub struct OstreeDeploymentPipeline {
    pub base: PipelineBase,
    pub platform: Platform,
    pub commit_source: Option<OstreeSourceSpec>,
    pub os_name: String,
    pub partition_table: Option<PartitionTable>,
    pub kernel_options_append: Vec<String>,
    pub sysroot_readonly: bool,
    /// Remote URL configured in the deployed repo, for updates.
    pub remote_url: String,

    commit_resolved: Option<OstreeCommitSpec>,
    started: bool,
}

impl OstreeDeploymentPipeline {
    pub fn new(
        name: &str,
        build: &str,
        commit: OstreeSourceSpec,
        os_name: &str,
        platform: Platform,
    ) -> Self {
        OstreeDeploymentPipeline {
            base: PipelineBase::new(name, Some(build)),
            platform,
            commit_source: Some(commit),
            os_name: os_name.to_string(),
            ..OstreeDeploymentPipeline::default()
        }
    }

    pub fn build_packages(&self) -> Vec<String> {
        vec!["ostree".to_string(), "rpm-ostree".to_string()]
    }

    pub fn declared_commits(&self) -> Vec<OstreeSourceSpec> {
        self.commit_source.clone().into_iter().collect()
    }

    pub fn serialize_start(&mut self, inputs: PipelineInputs) {
        if self.started {
            panic!("double call to serialize_start()");
        }
        self.started = true;
        if inputs.commits.len() != 1 {
            panic!(
                "ostree deployment expects exactly one resolved commit, got {}",
                inputs.commits.len()
            );
        }
        self.commit_resolved = inputs.commits.into_iter().next();
    }

    pub fn serialize_end(&mut self) {
        if !self.started {
            panic!("serialize_end() call when serialization not in progress");
        }
        self.started = false;
        self.commit_resolved = None;
    }

    pub fn resolved_commits(&self) -> Vec<OstreeCommitSpec> {
        self.commit_resolved.clone().into_iter().collect()
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        if !self.started {
            panic!("serialization not started");
        }
        let commit = self
            .commit_resolved
            .as_ref()
            .expect("commit resolved during serialize_start");
        let Some(pt) = &self.partition_table else {
            panic!("no partition table in the ostree deployment; this is a programming error");
        };

        let mut pipeline = osbuild::Pipeline::new(&self.base.name);

        pipeline.add_stage(osbuild::Stage::new(
            "org.osbuild.ostree.init-fs",
            serde_json::json!({}),
        ));
        pipeline.add_stage(osbuild::new_ostree_pull_stage("/ostree/repo", commit));
        pipeline.add_stage(osbuild::Stage::new(
            "org.osbuild.ostree.os-init",
            serde_json::json!({ "osname": self.os_name }),
        ));
        if !self.remote_url.is_empty() {
            pipeline.add_stage(osbuild::Stage::new(
                "org.osbuild.ostree.remotes",
                serde_json::json!({
                    "repo": "/ostree/repo",
                    "remotes": [{ "name": self.os_name, "url": self.remote_url }],
                }),
            ));
        }
        pipeline.add_stage(osbuild::Stage::new(
            "org.osbuild.ostree.config",
            serde_json::json!({
                "repo": "/ostree/repo",
                "config": { "sysroot": { "readonly": self.sysroot_readonly } },
            }),
        ));

        let (root_uuid, mut kernel_options) = osbuild::gen_image_kernel_options(pt)?;
        kernel_options.extend(self.kernel_options_append.clone());
        pipeline.add_stage(osbuild::new_ostree_deploy_stage(
            &osbuild::OstreeDeployStageOptions {
                os_name: self.os_name.clone(),
                reference: commit.reference.clone(),
                mounts: vec!["/boot".to_string(), "/boot/efi".to_string()],
                rootfs: osbuild::OstreeDeployRootfs {
                    label: String::new(),
                },
                kernel_opts: kernel_options.clone(),
            },
        ));
        pipeline.add_stage(osbuild::Stage::new(
            "org.osbuild.ostree.fillvar",
            serde_json::json!({
                "deployment": { "osname": self.os_name, "ref": commit.reference },
            }),
        ));

        pipeline.add_stage(osbuild::gen_fstab_stage(pt)?);

        if self.platform.supports_uefi() || self.platform.supports_bios() {
            pipeline.add_stage(osbuild::new_grub2_stage(&osbuild::Grub2StageOptions {
                root_fs_uuid: root_uuid,
                boot_fs_uuid: pt.find_mountable("/boot").map(|m| m.uuid().to_string()),
                kernel_opts: Some(kernel_options.join(" ")),
                uefi: self.platform.supports_uefi().then(|| osbuild::Grub2UefiOptions {
                    vendor: self.platform.uefi_vendor.clone(),
                    unified: true,
                }),
                ..osbuild::Grub2StageOptions::default()
            }));
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

    fn deployment() -> OstreeDeploymentPipeline {
        let mut rng = StdRng::seed_from_u64(13);
        let pt = PartitionTable::plan(
            &template(TemplateKind::Plain),
            &[],
            4 * GIB,
            PartitioningMode::Raw,
            None,
            &mut rng,
        )
        .unwrap();
        let mut deployment = OstreeDeploymentPipeline::new(
            "ostree-deployment",
            "build",
            OstreeSourceSpec {
                url: "https://example.com/repo".to_string(),
                reference: "fedora/x86_64/iot".to_string(),
            },
            "fedora-iot",
            Platform {
                uefi_vendor: "fedora".to_string(),
                ..Platform::default()
            },
        );
        deployment.partition_table = Some(pt);
        deployment
    }

    fn resolved_commit() -> OstreeCommitSpec {
        OstreeCommitSpec {
            url: "https://example.com/repo".to_string(),
            reference: "fedora/x86_64/iot".to_string(),
            checksum: "abcd".repeat(16),
            ..OstreeCommitSpec::default()
        }
    }

    #[test]
    fn test_deployment_stage_sequence() {
        let mut deployment = deployment();
        deployment.serialize_start(PipelineInputs {
            commits: vec![resolved_commit()],
            ..PipelineInputs::default()
        });
        let pipeline = deployment.serialize().unwrap();
        let types: Vec<&str> = pipeline.stages.iter().map(|s| s.stage_type.as_str()).collect();
        assert_eq!(types[0], "org.osbuild.ostree.init-fs");
        assert!(types.contains(&"org.osbuild.ostree.pull"));
        assert!(types.contains(&"org.osbuild.ostree.deploy"));
        assert!(types.contains(&"org.osbuild.fstab"));
        assert!(types.contains(&"org.osbuild.grub2"));
        deployment.serialize_end();
    }

    #[test]
    #[should_panic(expected = "exactly one resolved commit")]
    fn test_missing_commit_panics() {
        let mut deployment = deployment();
        deployment.serialize_start(PipelineInputs::default());
    }
}
