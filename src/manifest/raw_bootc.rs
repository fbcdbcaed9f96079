//! The raw bootc image: a bootable disk installed directly from a
//! container image with `bootc install to-filesystem`.

use anyhow::Result;

use super::{PipelineBase, PipelineInputs};
use crate::blueprint::UserCustomization;
use crate::content::{ContainerSourceSpec, ContainerSpec};
use crate::disk::PartitionTable;
use crate::osbuild;
use crate::platform::Platform;

#[derive(Debug, Clone, Default)]
pub struct RawBootcPipeline {
    pub base: PipelineBase,
    pub filename: String,
    pub platform: Platform,
    pub container: Option<ContainerSourceSpec>,
    /// Customizations apply to the image directly; there is no intermediate
    /// tree with bootc installs.
    pub partition_table: Option<PartitionTable>,
    pub kernel_options_append: Vec<String>,
    /// Users to create in the installed image. /etc/passwd becomes
    /// unmanaged state as far as bootc is concerned.
    pub users: Vec<UserCustomization>,
    pub selinux: String,

    containers_resolved: Vec<ContainerSpec>,
    started: bool,
}

impl RawBootcPipeline {
    pub fn new(name: &str, build: &str, container: ContainerSourceSpec, platform: Platform) -> Self {
        RawBootcPipeline {
            base: PipelineBase::new(name, Some(build)),
            filename: "disk.img".to_string(),
            platform,
            container: Some(container),
            ..RawBootcPipeline::default()
        }
    }

    pub fn declared_containers(&self) -> Vec<ContainerSourceSpec> {
        self.container.clone().into_iter().collect()
    }

    pub fn serialize_start(&mut self, inputs: PipelineInputs) {
        if self.started {
            panic!("double call to serialize_start()");
        }
        self.started = true;
        self.containers_resolved = inputs.containers;
    }

    pub fn serialize_end(&mut self) {
        if !self.started {
            panic!("serialize_end() call when serialization not in progress");
        }
        self.started = false;
        self.containers_resolved.clear();
    }

    pub fn resolved_containers(&self) -> Vec<ContainerSpec> {
        self.containers_resolved.clone()
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        if !self.started {
            panic!("serialization not started");
        }
        let Some(pt) = &self.partition_table else {
            panic!("no partition table in the bootc image; this is a programming error");
        };
        if self.containers_resolved.len() != 1 {
            panic!(
                "expected a single container input, got {}",
                self.containers_resolved.len()
            );
        }
        let container = &self.containers_resolved[0];

        let mut pipeline = osbuild::Pipeline::new(&self.base.name);
        pipeline.add_stages(osbuild::gen_image_prepare_stages(pt, &self.filename));

        let (devices, mounts) = osbuild::gen_bootupd_devices_mounts(pt, &self.filename)?;
        pipeline.add_stage(osbuild::new_bootc_install_to_filesystem_stage(
            &osbuild::BootcInstallToFilesystemOptions {
                kernel_args: self.kernel_options_append.clone(),
            },
            container,
            devices,
            mounts,
        ));

        pipeline.add_stages(osbuild::gen_image_finish_stages(pt, &self.filename));

        if !self.users.is_empty() {
            let (devices, mut mounts) = osbuild::gen_bootupd_devices_mounts(pt, &self.filename)?;
            mounts.push(osbuild::new_ostree_deployment_mount_default("ostree.deployment"));
            mounts.push(osbuild::new_bind_mount(
                "bind-ostree-deployment-to-tree",
                "mount://",
                "tree://",
            ));

            // /var/home must exist before useradd runs against the deployment
            let mkdir = osbuild::Stage::new(
                "org.osbuild.mkdir",
                serde_json::json!({
                    "paths": [{ "path": "/var/home", "mode": "755", "exist_ok": true }],
                }),
            )
            .with_devices(devices.clone())
            .with_mounts(mounts.clone());
            pipeline.add_stage(mkdir);

            let mut users_stage = osbuild::new_users_stage(&self.users, false);
            users_stage.devices = Some(devices.clone());
            users_stage.mounts = Some(mounts.clone());
            pipeline.add_stage(users_stage);

            if !self.selinux.is_empty() {
                let mut selinux_stage = osbuild::new_selinux_stage(
                    &format!("etc/selinux/{}/contexts/files/file_contexts", self.selinux),
                    &["/sysroot".to_string()],
                );
                selinux_stage.devices = Some(devices);
                selinux_stage.mounts = Some(mounts);
                pipeline.add_stage(selinux_stage);
            }
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

    fn container_source() -> ContainerSourceSpec {
        ContainerSourceSpec {
            source: "localhost/fake-cnt".to_string(),
            ..ContainerSourceSpec::default()
        }
    }

    fn container_spec() -> ContainerSpec {
        ContainerSpec {
            source: "localhost/fake-cnt".to_string(),
            digest: "sha256:dd".to_string(),
            image_id: "sha256:ii".to_string(),
            local_name: "localhost/fake-cnt".to_string(),
            ..ContainerSpec::default()
        }
    }

    fn pipeline_under_test() -> RawBootcPipeline {
        let mut rng = StdRng::seed_from_u64(13);
        let pt = PartitionTable::plan(
            &template(TemplateKind::Plain),
            &[],
            10 * GIB,
            PartitioningMode::Raw,
            None,
            &mut rng,
        )
        .unwrap();
        let mut raw = RawBootcPipeline::new("image", "build", container_source(), Platform::default());
        raw.partition_table = Some(pt);
        raw
    }

    #[test]
    fn test_bootc_install_stage() {
        let mut raw = pipeline_under_test();
        raw.serialize_start(PipelineInputs {
            containers: vec![container_spec()],
            ..PipelineInputs::default()
        });
        let pipeline = raw.serialize().unwrap();
        let types: Vec<&str> = pipeline.stages.iter().map(|s| s.stage_type.as_str()).collect();
        assert!(types.contains(&"org.osbuild.bootc.install-to-filesystem"));
        raw.serialize_end();
    }

    #[test]
    #[should_panic(expected = "single container input")]
    fn test_wrong_container_count_panics() {
        let mut raw = pipeline_under_test();
        raw.serialize_start(PipelineInputs::default());
        let _ = raw.serialize();
    }

    #[test]
    fn test_users_add_deployment_mounts() {
        let mut raw = pipeline_under_test();
        raw.users = vec![UserCustomization {
            name: "core".to_string(),
            ..UserCustomization::default()
        }];
        raw.selinux = "targeted".to_string();
        raw.serialize_start(PipelineInputs {
            containers: vec![container_spec()],
            ..PipelineInputs::default()
        });
        let pipeline = raw.serialize().unwrap();
        let users = pipeline
            .stages
            .iter()
            .find(|s| s.stage_type == "org.osbuild.users")
            .unwrap();
        let mounts = users.mounts.as_ref().unwrap();
        assert!(mounts
            .iter()
            .any(|m| m.mount_type == "org.osbuild.ostree.deployment"));
        assert_eq!(
            pipeline.stages.last().unwrap().stage_type,
            "org.osbuild.selinux"
        );
    }
}
