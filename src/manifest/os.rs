//! The OS pipeline: a fully configured root filesystem from RPMs.

use anyhow::Result;
use tracing::debug;

use super::{PipelineBase, PipelineInputs};
use crate::arch::Arch;
use crate::blueprint::{
    FirewallCustomization, GroupCustomization, ServicesCustomization, UserCustomization,
};
use crate::content::{
    ContainerSourceSpec, ContainerSpec, OstreeCommitSpec, OstreeSourceSpec, PackageSet,
    PackageSpec, RepoConfig,
};
use crate::disk::PartitionTable;
use crate::fsnode::{DirectoryNode, FileNode};
use crate::osbuild;
use crate::platform::Platform;

/// OpenSCAP remediation settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OscapConfig {
    pub datastream: String,
    pub profile_id: String,
    pub tailoring: Option<OscapTailoring>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OscapTailoring {
    pub filepath: String,
    pub new_profile: String,
    pub selected: Vec<String>,
    pub unselected: Vec<String>,
}

/// Subscription-manager registration executed on first boot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionConfig {
    pub organization: String,
    pub activation_key: String,
    pub server_url: String,
    pub insights: bool,
}

/// The workload link of the package-set chain plus the services it needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadConfig {
    pub packages: Vec<String>,
    pub repos: Vec<RepoConfig>,
    pub enabled_services: Vec<String>,
    pub disabled_services: Vec<String>,
}

/// Everything the user and image definition can configure about the OS
/// tree, normalized from the blueprint.
#[derive(Debug, Clone, Default)]
pub struct OsCustomizations {
    pub language: String,
    pub keyboard: Option<String>,
    pub hostname: String,
    pub timezone: String,
    pub ntp_servers: Vec<String>,
    pub users: Vec<UserCustomization>,
    pub groups: Vec<GroupCustomization>,
    pub firewall: Option<FirewallCustomization>,
    pub services: ServicesCustomization,
    pub default_target: Option<String>,
    /// Kernel package name; empty builds a kernel-less tree.
    pub kernel_name: String,
    pub kernel_options_append: Vec<String>,
    /// Write kernel options into the bootloader config instead of
    /// /etc/kernel/cmdline.
    pub kernel_options_bootloader: bool,
    /// SELinux policy profile; empty disables relabeling.
    pub selinux: String,
    pub fips: bool,
    pub exclude_docs: bool,
    /// Use grub2.legacy menu entries instead of BLS.
    pub no_bls: bool,
    /// Emit systemd mount units instead of /etc/fstab.
    pub mount_units: bool,
    pub files: Vec<FileNode>,
    pub directories: Vec<DirectoryNode>,
    /// PEM bundles installed into the CA trust anchors.
    pub ca_certs: Vec<String>,
    pub oscap: Option<OscapConfig>,
    pub subscription: Option<SubscriptionConfig>,
    /// The customization link of the package-set chain.
    pub extra_packages: Vec<String>,
    pub extra_repos: Vec<RepoConfig>,
    pub machine_id_uninitialized: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OsPipeline {
    pub base: PipelineBase,
    pub platform: Platform,
    pub repos: Vec<RepoConfig>,
    /// The platform link of the package-set chain.
    pub packages: Vec<String>,
    pub exclude_packages: Vec<String>,
    pub install_weak_deps: bool,
    pub workload: Option<WorkloadConfig>,
    pub customizations: OsCustomizations,
    pub partition_table: Option<PartitionTable>,
    /// Non-empty marks this tree as an OSTree parent commit source.
    pub os_tree_ref: String,
    pub os_tree_parent: Option<OstreeSourceSpec>,
    /// Product identity for grub2.legacy menu entries.
    pub os_product: String,
    pub os_version: String,
    pub os_nick: String,
    /// Generate bootupd metadata; only valid for OSTree trees.
    pub bootupd: bool,

    packages_resolved: Vec<PackageSpec>,
    repos_resolved: Vec<RepoConfig>,
    commit_parent_resolved: Option<OstreeCommitSpec>,
    kernel_version: String,
    started: bool,
}

impl OsPipeline {
    pub fn new(name: &str, build: &str, platform: Platform, repos: Vec<RepoConfig>) -> Self {
        OsPipeline {
            base: PipelineBase::new(name, Some(build)),
            platform,
            repos,
            install_weak_deps: true,
            ..OsPipeline::default()
        }
    }

    /// Version-release.arch of the resolved kernel; empty outside of
    /// serialization or for kernel-less trees.
    pub fn kernel_version(&self) -> &str {
        &self.kernel_version
    }

    /// Packages the buildroot needs to assemble this tree.
    pub fn build_packages(&self) -> Vec<String> {
        let mut packages = self.platform.build_packages.clone();
        packages.push("rpm".to_string());
        if !self.os_tree_ref.is_empty() {
            packages.push("rpm-ostree".to_string());
        }
        if !self.customizations.selinux.is_empty() {
            packages.push("policycoreutils".to_string());
            packages.push(format!("selinux-policy-{}", self.customizations.selinux));
        }
        if self
            .customizations
            .oscap
            .as_ref()
            .is_some_and(|oscap| oscap.tailoring.is_some())
        {
            packages.push("openscap-utils".to_string());
        }
        packages
    }

    /// The package-set chain: platform, then workload, then customization.
    /// Later links may depend on the resolutions of earlier ones, so the
    /// order is part of the solver contract.
    pub fn declared_packages(&self) -> Vec<PackageSet> {
        let mut platform_include = self.packages.clone();
        platform_include.push("rpm".to_string());
        if !self.os_tree_ref.is_empty() {
            platform_include.push("rpm-ostree".to_string());
        }
        if !self.customizations.selinux.is_empty() {
            platform_include.push(format!("selinux-policy-{}", self.customizations.selinux));
        }
        if !self.customizations.kernel_name.is_empty() {
            platform_include.push(self.customizations.kernel_name.clone());
        }
        if self.customizations.fips {
            platform_include.push("crypto-policies-scripts".to_string());
        }
        platform_include.sort();
        platform_include.dedup();

        let mut chain = vec![PackageSet {
            include: platform_include,
            exclude: self.exclude_packages.clone(),
            repositories: self.repos.clone(),
            install_weak_deps: self.install_weak_deps,
        }];

        if let Some(workload) = &self.workload {
            if !workload.packages.is_empty() {
                let mut repositories = self.repos.clone();
                repositories.extend(workload.repos.clone());
                chain.push(PackageSet {
                    include: workload.packages.clone(),
                    repositories,
                    install_weak_deps: true,
                    ..PackageSet::default()
                });
            }
        }

        if !self.customizations.extra_packages.is_empty() {
            let mut repositories = self.repos.clone();
            repositories.extend(self.customizations.extra_repos.clone());
            chain.push(PackageSet {
                include: self.customizations.extra_packages.clone(),
                repositories,
                install_weak_deps: true,
                ..PackageSet::default()
            });
        }

        chain
    }

    pub fn declared_containers(&self) -> Vec<ContainerSourceSpec> {
        Vec::new()
    }

    pub fn declared_commits(&self) -> Vec<OstreeSourceSpec> {
        self.os_tree_parent.clone().into_iter().collect()
    }

    pub fn serialize_start(&mut self, inputs: PipelineInputs) {
        if self.started {
            panic!("double call to serialize_start()");
        }
        self.started = true;
        self.packages_resolved = inputs.packages;
        self.repos_resolved = inputs.repos;
        if inputs.commits.len() > 1 {
            panic!("the os pipeline supports at most one ostree parent commit");
        }
        self.commit_parent_resolved = inputs.commits.into_iter().next();

        if !self.customizations.kernel_name.is_empty() {
            self.kernel_version = kernel_version_of(
                &self.packages_resolved,
                &self.customizations.kernel_name,
            );
        }
    }

    pub fn serialize_end(&mut self) {
        if !self.started {
            panic!("serialize_end() call when serialization not in progress");
        }
        self.started = false;
        self.packages_resolved.clear();
        self.repos_resolved.clear();
        self.commit_parent_resolved = None;
        self.kernel_version.clear();
    }

    /// Kernel command line: root= options derived from the partition table,
    /// filesystem-specific fragments, user append tokens, FIPS options.
    fn kernel_options(&self) -> Result<(String, Vec<String>)> {
        let Some(pt) = &self.partition_table else {
            return Ok((String::new(), self.customizations.kernel_options_append.clone()));
        };
        let (root_uuid, mut options) = osbuild::gen_image_kernel_options(pt)?;
        options.extend(self.customizations.kernel_options_append.clone());
        if self.customizations.fips {
            options.extend(osbuild::gen_fips_kernel_options(pt));
        }
        Ok((root_uuid, options))
    }

    /// Files generated by configuration (not user content) that become
    /// inline sources: FIPS markers, CA anchors, the subscription script.
    fn generated_files(&self) -> Vec<FileNode> {
        let mut files = Vec::new();
        if self.customizations.fips {
            files.extend(osbuild::gen_fips_files());
        }
        for pem in &self.customizations.ca_certs {
            let name = osbuild::content_hash(pem.as_bytes());
            let path = format!("/etc/pki/ca-trust/source/anchors/{}.pem", &name[..40]);
            files.push(
                FileNode::new(path, pem.clone().into_bytes()).expect("anchor path is valid"),
            );
        }
        if let Some(subscription) = &self.customizations.subscription {
            files.push(subscription_script(subscription));
        }
        files
    }

    pub fn inline_data(&self) -> Vec<String> {
        let mut data: Vec<String> = Vec::new();
        for file in &self.customizations.files {
            data.push(String::from_utf8_lossy(file.data()).into_owned());
        }
        for file in self.generated_files() {
            data.push(String::from_utf8_lossy(file.data()).into_owned());
        }
        data
    }

    pub fn resolved_packages(&self) -> Vec<PackageSpec> {
        self.packages_resolved.clone()
    }

    pub fn resolved_containers(&self) -> Vec<ContainerSpec> {
        Vec::new()
    }

    pub fn resolved_commits(&self) -> Vec<OstreeCommitSpec> {
        self.commit_parent_resolved.clone().into_iter().collect()
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        if !self.started {
            panic!("serialization not started");
        }
        let custom = &self.customizations;
        let ostree = !self.os_tree_ref.is_empty();

        let mut pipeline = osbuild::Pipeline::new(&self.base.name);

        if let Some(parent) = &self.commit_parent_resolved {
            pipeline.add_stage(osbuild::new_ostree_passwd_stage(parent));
        }

        let mut all_repos = self.repos_resolved.clone();
        all_repos.extend(self.repos.clone());
        let mut rpm_options = osbuild::RpmStageOptions::new(&all_repos);
        if custom.exclude_docs {
            rpm_options.exclude = Some(osbuild::RpmExclude { docs: true });
        }
        if ostree {
            rpm_options.ostree_booted = Some(true);
            rpm_options.db_path = Some("/usr/share/rpm".to_string());
            // rpm-ostree composes its own initramfs and tolerates exactly
            // one kernel in the tree
            rpm_options.disable_dracut = true;
        }
        pipeline.add_stage(osbuild::new_rpm_stage(&rpm_options, &self.packages_resolved));

        if !custom.no_bls {
            // with /boot on a separate partition the BLS prefix must be ""
            let prefix = match &self.partition_table {
                Some(pt) if pt.contains_mountpoint("/boot") => Some(String::new()),
                _ => None,
            };
            pipeline.add_stage(osbuild::new_fix_bls_stage(&osbuild::FixBlsStageOptions {
                prefix,
            }));
        }

        if !custom.language.is_empty() {
            pipeline.add_stage(osbuild::new_locale_stage(&custom.language));
        }
        if let Some(keyboard) = &custom.keyboard {
            pipeline.add_stage(osbuild::new_keymap_stage(keyboard));
        }
        if !custom.hostname.is_empty() {
            pipeline.add_stage(osbuild::new_hostname_stage(&custom.hostname));
        }
        if !custom.timezone.is_empty() {
            pipeline.add_stage(osbuild::new_timezone_stage(&custom.timezone));
        }
        if !custom.ntp_servers.is_empty() {
            pipeline.add_stage(osbuild::new_chrony_stage(&custom.ntp_servers));
        }

        if !custom.groups.is_empty() {
            pipeline.add_stage(osbuild::new_groups_stage(&custom.groups));
        }
        if !custom.users.is_empty() {
            if ostree {
                // writing keys during user creation is redundant on ostree
                // and home is under /var; write them on first boot instead
                pipeline.add_stage(osbuild::new_users_stage(&custom.users, true));
                pipeline.add_stage(osbuild::new_first_boot_stage(
                    &osbuild::users_first_boot_options(&custom.users),
                ));
            } else {
                pipeline.add_stage(osbuild::new_users_stage(&custom.users, false));
            }
        }

        if let Some(firewall) = &custom.firewall {
            pipeline.add_stage(osbuild::new_firewall_stage(firewall));
        }

        if let Some(subscription) = &custom.subscription {
            pipeline.add_stages(subscription_stages(subscription));
        }

        if !custom.directories.is_empty() {
            pipeline.add_stages(osbuild::gen_directory_nodes_stages(&custom.directories));
        }
        if !custom.files.is_empty() {
            pipeline.add_stages(osbuild::gen_file_nodes_stages(&custom.files));
        }

        let mut root_uuid = String::new();
        if let Some(pt) = &self.partition_table {
            let (uuid, kernel_options) = self.kernel_options()?;
            root_uuid = uuid;

            if custom.fips {
                pipeline.add_stages(osbuild::gen_fips_stages());
                pipeline.add_stages(osbuild::gen_file_nodes_stages(&osbuild::gen_fips_files()));
                if !self.kernel_version.is_empty() {
                    pipeline.add_stage(osbuild::new_dracut_stage(&osbuild::DracutStageOptions {
                        kernel: vec![self.kernel_version.clone()],
                        add_modules: vec!["fips".to_string()],
                        ..osbuild::DracutStageOptions::default()
                    }));
                }
            }

            // fstab and mount units are mutually exclusive
            if custom.mount_units {
                pipeline.add_stages(osbuild::gen_systemd_mount_stages(pt)?);
            } else {
                pipeline.add_stage(osbuild::gen_fstab_stage(pt)?);
            }

            let bootloader = match self.platform.arch {
                Arch::S390x => osbuild::new_zipl_stage(),
                _ => {
                    let uefi = if self.platform.supports_uefi() {
                        Some(osbuild::Grub2UefiOptions {
                            vendor: self.platform.uefi_vendor.clone(),
                            unified: !custom.kernel_options_bootloader,
                        })
                    } else {
                        None
                    };
                    osbuild::new_grub2_stage(&osbuild::Grub2StageOptions {
                        root_fs_uuid: root_uuid.clone(),
                        boot_fs_uuid: pt.find_mountable("/boot").map(|m| m.uuid().to_string()),
                        kernel_opts: Some(kernel_options.join(" ")),
                        legacy: custom.no_bls,
                        uefi,
                        write_cmdline: custom.kernel_options_bootloader,
                        greenboot: None,
                    })
                }
            };
            pipeline.add_stage(bootloader);

            if !custom.kernel_options_bootloader || self.platform.arch == Arch::S390x {
                // the cmdline fragment must exist before anything else runs
                let kernel_stage =
                    osbuild::new_kernel_cmdline_stage(&root_uuid, &kernel_options.join(" "));
                pipeline.stages.insert(0, kernel_stage);
            }
        } else {
            debug!(pipeline = %self.base.name, "no partition table, skipping bootloader stages");
        }

        if ostree {
            pipeline.add_stage(osbuild::new_systemd_journald_stage(
                "10-persistent.conf",
                "persistent",
            ));
            if self.bootupd {
                pipeline.add_stage(osbuild::Stage::without_options(
                    "org.osbuild.bootupd.gen-metadata",
                ));
            }
        } else if self.bootupd {
            panic!("bootupd is only compatible with ostree-based trees; this is a programming error");
        }

        if let Some(oscap) = &custom.oscap {
            if let Some(tailoring) = &oscap.tailoring {
                pipeline.add_stage(osbuild::new_oscap_autotailor_stage(
                    &osbuild::OscapAutotailorStageOptions {
                        filepath: tailoring.filepath.clone(),
                        config: osbuild::OscapAutotailorConfig {
                            new_profile: tailoring.new_profile.clone(),
                            datastream: oscap.datastream.clone(),
                            profile_id: oscap.profile_id.clone(),
                            selected: tailoring.selected.clone(),
                            unselected: tailoring.unselected.clone(),
                        },
                    },
                ));
            }
            pipeline.add_stage(osbuild::new_oscap_remediation_stage(
                &osbuild::OscapRemediationStageOptions {
                    data_dir: "/var/tmp/osbuild-oscap".to_string(),
                    config: osbuild::OscapConfig {
                        datastream: oscap.datastream.clone(),
                        profile_id: oscap.profile_id.clone(),
                    },
                },
            ));
        }

        if !custom.ca_certs.is_empty() {
            let anchors: Vec<FileNode> = self
                .generated_files()
                .into_iter()
                .filter(|file| file.path().starts_with("/etc/pki/ca-trust"))
                .collect();
            pipeline.add_stages(osbuild::gen_file_nodes_stages(&anchors));
            pipeline.add_stage(osbuild::new_update_ca_trust_stage());
        }

        if !custom.services.enabled.is_empty()
            || !custom.services.disabled.is_empty()
            || !custom.services.masked.is_empty()
            || custom.default_target.is_some()
        {
            pipeline.add_stage(osbuild::new_systemd_stage(
                &custom.services,
                custom.default_target.as_deref(),
            ));
        }
        if let Some(workload) = &self.workload {
            if !workload.enabled_services.is_empty() || !workload.disabled_services.is_empty() {
                let services = ServicesCustomization {
                    enabled: workload.enabled_services.clone(),
                    disabled: workload.disabled_services.clone(),
                    masked: Vec::new(),
                };
                pipeline.add_stage(osbuild::new_systemd_stage(&services, None));
            }
        }

        if custom.machine_id_uninitialized {
            pipeline.add_stage(osbuild::new_machine_id_stage("yes"));
        }

        if !custom.selinux.is_empty() {
            pipeline.add_stage(osbuild::new_selinux_stage(
                &format!(
                    "etc/selinux/{}/contexts/files/file_contexts",
                    custom.selinux
                ),
                &[],
            ));
        }

        Ok(pipeline)
    }
}

/// Version-release.arch string of a package, panicking when it is missing:
/// a kernel that did not resolve is unrecoverable.
fn kernel_version_of(packages: &[PackageSpec], kernel_name: &str) -> String {
    for package in packages {
        if package.name == kernel_name {
            return format!("{}-{}.{}", package.version, package.release, package.arch);
        }
    }
    panic!("kernel package {kernel_name:?} not found in the resolved package list");
}

const SUBSCRIPTION_SCRIPT_PATH: &str = "/usr/local/sbin/osbuild-subscription-register";

fn subscription_script(subscription: &SubscriptionConfig) -> FileNode {
    let mut script = format!(
        "#!/usr/bin/bash\nsubscription-manager register --activationkey={} --org={}",
        subscription.activation_key, subscription.organization
    );
    if !subscription.server_url.is_empty() {
        script.push_str(&format!(" --serverurl {}", subscription.server_url));
    }
    script.push('\n');
    if subscription.insights {
        script.push_str("insights-client --register\n");
    }
    let mut node = FileNode::new(SUBSCRIPTION_SCRIPT_PATH, script.into_bytes())
        .expect("static path is valid");
    node.mode = Some(0o755);
    node
}

/// The registration script, its unit, and the enablement for the
/// subscription-manager firstboot service.
fn subscription_stages(subscription: &SubscriptionConfig) -> Vec<osbuild::Stage> {
    let mut stages = osbuild::gen_file_nodes_stages(&[subscription_script(subscription)]);
    stages.push(osbuild::new_systemd_unit_create_stage(
        &osbuild::SystemdUnitCreateStageOptions {
            filename: "osbuild-subscription-register.service".to_string(),
            unit_type: "system".to_string(),
            unit_path: "usr".to_string(),
            config: serde_json::json!({
                "Unit": {
                    "Description": "First-boot service for registering with Red Hat subscription manager",
                    "ConditionPathExists": ["/etc/osbuild-subscription-register.done"],
                    "Wants": ["network-online.target"],
                    "After": ["network-online.target"],
                },
                "Service": {
                    "Type": "oneshot",
                    "ExecStart": [SUBSCRIPTION_SCRIPT_PATH],
                    "ExecStartPost": ["/usr/bin/touch /etc/osbuild-subscription-register.done"],
                },
                "Install": { "WantedBy": ["default.target"] },
            }),
        },
    ));
    let services = ServicesCustomization {
        enabled: vec!["osbuild-subscription-register.service".to_string()],
        ..ServicesCustomization::default()
    };
    stages.push(osbuild::new_systemd_stage(&services, None));
    stages
}
