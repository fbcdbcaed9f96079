//! Build pipelines: the chroot the other pipelines run inside.

use anyhow::Result;

use super::{PipelineBase, PipelineInputs};
use crate::content::{ContainerSourceSpec, ContainerSpec, PackageSet, PackageSpec, RepoConfig};
use crate::osbuild;

/// Where the buildroot content comes from.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BuildSource {
    /// Depsolved RPMs installed with the rpm stage.
    #[default]
    Packages,
    /// A resolved container deployed as the buildroot (bootstrap mode).
    Container(ContainerSourceSpec),
}

#[derive(Debug, Clone, Default)]
pub struct BuildPipeline {
    pub base: PipelineBase,
    /// Runner binary for this buildroot, e.g. `org.osbuild.fedora40`.
    pub runner: String,
    pub repos: Vec<RepoConfig>,
    /// Package names to install; dependent pipelines contribute theirs at
    /// declare time.
    pub packages: Vec<String>,
    pub source: BuildSource,
    /// SELinux policy used to label the buildroot; empty disables labeling.
    pub selinux_policy: String,

    packages_resolved: Vec<PackageSpec>,
    containers_resolved: Vec<ContainerSpec>,
    started: bool,
}

impl BuildPipeline {
    /// A buildroot from depsolved packages.
    pub fn new(name: &str, runner: &str, repos: Vec<RepoConfig>, packages: Vec<String>) -> Self {
        BuildPipeline {
            base: PipelineBase::new(name, None),
            runner: runner.to_string(),
            repos,
            packages,
            source: BuildSource::Packages,
            selinux_policy: "targeted".to_string(),
            ..BuildPipeline::default()
        }
    }

    /// A bootstrap buildroot deployed from a container image.
    pub fn from_container(name: &str, runner: &str, container: ContainerSourceSpec) -> Self {
        BuildPipeline {
            base: PipelineBase::new(name, None),
            runner: runner.to_string(),
            source: BuildSource::Container(container),
            ..BuildPipeline::default()
        }
    }

    /// Add build requirements contributed by a dependent pipeline.
    pub fn add_packages(&mut self, packages: &[String]) {
        for package in packages {
            if !self.packages.contains(package) {
                self.packages.push(package.clone());
            }
        }
    }

    pub fn declared_packages(&self) -> Vec<PackageSet> {
        match self.source {
            BuildSource::Packages => {
                let mut include = self.packages.clone();
                include.sort();
                include.dedup();
                vec![PackageSet {
                    include,
                    repositories: self.repos.clone(),
                    ..PackageSet::default()
                }]
            }
            BuildSource::Container(_) => Vec::new(),
        }
    }

    pub fn declared_containers(&self) -> Vec<ContainerSourceSpec> {
        match &self.source {
            BuildSource::Packages => Vec::new(),
            BuildSource::Container(container) => vec![container.clone()],
        }
    }

    pub fn serialize_start(&mut self, inputs: PipelineInputs) {
        if self.started {
            panic!("double call to serialize_start()");
        }
        self.started = true;
        self.packages_resolved = inputs.packages;
        self.containers_resolved = inputs.containers;
    }

    pub fn serialize_end(&mut self) {
        if !self.started {
            panic!("serialize_end() call when serialization not in progress");
        }
        self.started = false;
        self.packages_resolved.clear();
        self.containers_resolved.clear();
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        if !self.started {
            panic!("serialization not started");
        }
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);

        match &self.source {
            BuildSource::Packages => {
                let options = osbuild::RpmStageOptions::new(&self.repos);
                pipeline.add_stage(osbuild::new_rpm_stage(&options, &self.packages_resolved));
            }
            BuildSource::Container(_) => {
                if self.containers_resolved.len() != 1 {
                    panic!(
                        "expected exactly one resolved container for the bootstrap buildroot, got {}",
                        self.containers_resolved.len()
                    );
                }
                pipeline.add_stage(osbuild::new_container_deploy_stage(
                    &self.containers_resolved[0],
                ));
            }
        }

        if !self.selinux_policy.is_empty() {
            let labels = std::collections::BTreeMap::from([
                (
                    "/usr/bin/cp".to_string(),
                    "system_u:object_r:install_exec_t:s0".to_string(),
                ),
                (
                    "/usr/bin/tar".to_string(),
                    "system_u:object_r:install_exec_t:s0".to_string(),
                ),
            ]);
            pipeline.add_stage(osbuild::new_selinux_stage_with_labels(
                &format!(
                    "etc/selinux/{}/contexts/files/file_contexts",
                    self.selinux_policy
                ),
                &labels,
            ));
        }

        Ok(pipeline)
    }

    pub fn resolved_packages(&self) -> Vec<PackageSpec> {
        self.packages_resolved.clone()
    }

    pub fn resolved_containers(&self) -> Vec<ContainerSpec> {
        self.containers_resolved.clone()
    }
}
