//! Installer ISO pipelines: the Anaconda runtime tree, the compressed
//! rootfs image, the EFI boot tree, the ISO content tree, and the final
//! ISO 9660 image.

use std::collections::BTreeMap;

use anyhow::Result;

use super::pxetree::installer_boot_exclude_paths;
use super::{PipelineBase, PipelineInputs};
use crate::arch::Arch;
use crate::blueprint::{GroupCustomization, UserCustomization};
use crate::content::{
    ContainerSourceSpec, ContainerSpec, OstreeCommitSpec, OstreeSourceSpec, PackageSet,
    PackageSpec, RepoConfig,
};
use crate::disk::{FilesystemType, PartitionTable};
use crate::osbuild;
use crate::platform::Platform;

/// Default Anaconda modules activated in the installer runtime.
const ANACONDA_DEFAULT_MODULES: &[&str] = &[
    "org.fedoraproject.Anaconda.Modules.Network",
    "org.fedoraproject.Anaconda.Modules.Payloads",
    "org.fedoraproject.Anaconda.Modules.Storage",
];

/// The Anaconda installer runtime tree.
#[derive(Debug, Clone, Default)]
pub struct AnacondaTreePipeline {
    pub base: PipelineBase,
    pub platform: Platform,
    pub repos: Vec<RepoConfig>,
    pub packages: Vec<String>,
    pub kernel_name: String,
    pub product: String,
    pub version: String,
    pub locale: String,
    pub enabled_modules: Vec<String>,
    pub disabled_modules: Vec<String>,

    packages_resolved: Vec<PackageSpec>,
    kernel_version: String,
    started: bool,
}

impl AnacondaTreePipeline {
    pub fn new(name: &str, build: &str, platform: Platform, repos: Vec<RepoConfig>) -> Self {
        AnacondaTreePipeline {
            base: PipelineBase::new(name, Some(build)),
            platform,
            repos,
            kernel_name: "kernel".to_string(),
            locale: "en_US.UTF-8".to_string(),
            ..AnacondaTreePipeline::default()
        }
    }

    pub fn kernel_version(&self) -> &str {
        &self.kernel_version
    }

    pub fn declared_packages(&self) -> Vec<PackageSet> {
        let mut include = self.packages.clone();
        include.extend([
            "anaconda".to_string(),
            "anaconda-dracut".to_string(),
            "dracut-config-generic".to_string(),
            self.kernel_name.clone(),
        ]);
        include.sort();
        include.dedup();
        vec![PackageSet {
            include,
            repositories: self.repos.clone(),
            install_weak_deps: true,
            ..PackageSet::default()
        }]
    }

    pub fn serialize_start(&mut self, inputs: PipelineInputs) {
        if self.started {
            panic!("double call to serialize_start()");
        }
        self.started = true;
        self.packages_resolved = inputs.packages;
        for package in &self.packages_resolved {
            if package.name == self.kernel_name {
                self.kernel_version =
                    format!("{}-{}.{}", package.version, package.release, package.arch);
            }
        }
    }

    pub fn serialize_end(&mut self) {
        if !self.started {
            panic!("serialize_end() call when serialization not in progress");
        }
        self.started = false;
        self.packages_resolved.clear();
        self.kernel_version.clear();
    }

    pub fn resolved_packages(&self) -> Vec<PackageSpec> {
        self.packages_resolved.clone()
    }

    fn active_modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = ANACONDA_DEFAULT_MODULES
            .iter()
            .map(|module| module.to_string())
            .collect();
        for module in &self.enabled_modules {
            if !modules.contains(module) {
                modules.push(module.clone());
            }
        }
        modules.retain(|module| !self.disabled_modules.contains(module));
        modules
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        if !self.started {
            panic!("serialization not started");
        }
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);

        let rpm_options = osbuild::RpmStageOptions::new(&self.repos);
        pipeline.add_stage(osbuild::new_rpm_stage(&rpm_options, &self.packages_resolved));
        pipeline.add_stage(osbuild::new_locale_stage(&self.locale));
        pipeline.add_stage(osbuild::new_anaconda_stage(&osbuild::AnacondaStageOptions {
            kickstart_modules: Vec::new(),
            activatable_modules: self.active_modules(),
        }));
        pipeline.add_stage(osbuild::new_lorax_script_stage(
            &osbuild::LoraxScriptStageOptions {
                path: "99-generic/runtime-postinstall.tmpl".to_string(),
                base_arch: self.platform.arch.to_string(),
                product: self.product.clone(),
                version: self.version.clone(),
            },
        ));
        pipeline.add_stage(osbuild::new_dracut_stage(&osbuild::DracutStageOptions {
            kernel: vec![self.kernel_version.clone()],
            modules: Vec::new(),
            add_modules: vec![
                "anaconda".to_string(),
                "convertfs".to_string(),
                "dmsquash-live".to_string(),
                "livenet".to_string(),
                "pollcdrom".to_string(),
                "qemu".to_string(),
                "qemu-net".to_string(),
            ],
            install: Vec::new(),
        }));

        Ok(pipeline)
    }
}

/// An ext4 filesystem image holding the installer runtime, wrapped in
/// squashfs by the ISO tree when the squashfs-ext4 rootfs type is used.
#[derive(Debug, Clone)]
pub struct IsoRootfsImagePipeline {
    pub base: PipelineBase,
    pub anaconda_pipeline: String,
    pub size: u64,
}

impl IsoRootfsImagePipeline {
    pub fn new(name: &str, build: &str, anaconda_pipeline: &str, size: u64) -> Self {
        IsoRootfsImagePipeline {
            base: PipelineBase::new(name, Some(build)),
            anaconda_pipeline: anaconda_pipeline.to_string(),
            size,
        }
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        let filename = "LiveOS/rootfs.img";
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);
        pipeline.add_stage(osbuild::new_truncate_stage(filename, self.size));

        let devices: osbuild::Devices = BTreeMap::from([(
            "device".to_string(),
            osbuild::Device {
                device_type: "org.osbuild.loopback".to_string(),
                parent: None,
                options: serde_json::json!({ "filename": filename, "lock": true }),
            },
        )]);
        pipeline.add_stage(
            osbuild::Stage::new("org.osbuild.mkfs.ext4", serde_json::json!({ "uuid": "" }))
                .with_devices(devices.clone()),
        );

        let mounts = vec![osbuild::new_fs_mount("ext4", "root", "device", "/")];
        pipeline.add_stage(osbuild::new_copy_stage_mounted(
            &[osbuild::CopyStagePath {
                from: "input://tree/".to_string(),
                to: "mount://root/".to_string(),
            }],
            osbuild::new_pipeline_tree_inputs("tree", &self.anaconda_pipeline),
            devices,
            mounts,
        ));
        Ok(pipeline)
    }
}

/// The EFI boot tree: grub configuration for booting the ISO over UEFI.
#[derive(Debug, Clone, Default)]
pub struct EfiBootTreePipeline {
    pub base: PipelineBase,
    pub platform: Platform,
    pub product: String,
    pub version: String,
    pub iso_label: String,
    pub kernel_opts: Vec<String>,
    pub fips: bool,
}

impl EfiBootTreePipeline {
    pub fn new(name: &str, build: &str, platform: Platform, product: &str, version: &str) -> Self {
        EfiBootTreePipeline {
            base: PipelineBase::new(name, Some(build)),
            platform,
            product: product.to_string(),
            version: version.to_string(),
            ..EfiBootTreePipeline::default()
        }
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);
        pipeline.add_stage(osbuild::new_grub2_iso_stage(&osbuild::GrubIsoStageOptions {
            product: osbuild::IsolinuxProduct {
                name: self.product.clone(),
                version: self.version.clone(),
            },
            kernel: osbuild::GrubIsoKernel {
                dir: "/images/pxeboot".to_string(),
                opts: self.kernel_opts.clone(),
            },
            iso_label: self.iso_label.clone(),
            architectures: vec![self.platform.arch.to_string().to_uppercase()],
            vendor: self.platform.uefi_vendor.clone(),
            fips: self.fips,
        }));
        Ok(pipeline)
    }
}

/// How the ISO's boot chain is laid out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsoBootType {
    /// UEFI only.
    #[default]
    Grub2Uefi,
    /// Legacy BIOS boot via isolinux, hybrid MBR.
    Syslinux,
    /// Legacy BIOS boot via grub2, grub2 MBR.
    Grub2,
}

/// Compression container for the installer root filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsoRootfsType {
    /// An ext4 image wrapped in squashfs (the traditional LiveOS layout).
    SquashfsExt4,
    #[default]
    Squashfs,
    Erofs,
}

/// What the installer installs.
#[derive(Debug, Clone)]
pub enum PayloadSource {
    /// A tarball of an OS tree built in this manifest.
    OsTar { os_pipeline: String },
    /// An OSTree commit pulled into the ISO.
    OstreeCommit {
        source: OstreeSourceSpec,
        os_name: String,
    },
    /// A container image embedded in the ISO.
    Container { source: ContainerSourceSpec },
}

impl Default for PayloadSource {
    fn default() -> Self {
        PayloadSource::OsTar {
            os_pipeline: "os".to_string(),
        }
    }
}

/// Kickstart generation settings.
#[derive(Debug, Clone, Default)]
pub struct KickstartOptions {
    /// Where the kickstart is placed on the ISO.
    pub path: String,
    pub unattended: bool,
    pub sudo_nopasswd: Vec<String>,
    /// Verbatim user-provided kickstart content.
    pub user_file: Option<String>,
    pub users: Vec<UserCustomization>,
    pub groups: Vec<GroupCustomization>,
    pub language: String,
    pub keyboard: String,
    pub timezone: String,
}

/// Map a filesystem type to the kickstart autopart settings.
fn autopart_options(fs: FilesystemType) -> osbuild::KickstartAutoPartOptions {
    match fs {
        FilesystemType::Btrfs => osbuild::KickstartAutoPartOptions {
            part_type: "btrfs".to_string(),
            no_home: true,
            ..osbuild::KickstartAutoPartOptions::default()
        },
        other => {
            let fs_type = match other {
                FilesystemType::None => "ext4".to_string(),
                named => named.as_str().to_string(),
            };
            osbuild::KickstartAutoPartOptions {
                part_type: "plain".to_string(),
                fs_type,
                no_home: true,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IsoTreePipeline {
    pub base: PipelineBase,
    pub anaconda_pipeline: String,
    /// Tree that the squashfs/erofs stage wraps: the rootfs-image pipeline
    /// for squashfs-ext4, the anaconda tree otherwise.
    pub rootfs_pipeline: Option<String>,
    /// EFI boot tree; absent for images without UEFI media boot.
    pub efiboot_pipeline: Option<String>,
    pub payload: PayloadSource,
    pub kickstart: KickstartOptions,
    pub platform: Platform,
    pub kernel_version: String,
    pub kernel_opts: Vec<String>,
    pub product: String,
    pub version: String,
    pub release: String,
    pub iso_label: String,
    pub rootfs_type: IsoRootfsType,
    pub boot_type: IsoBootType,
    /// Filesystem used by the generated autopart directive.
    pub install_rootfs_type: FilesystemType,
    /// Layout of efiboot.img; a single-partition vfat table.
    pub efiboot_table: Option<PartitionTable>,

    commits_resolved: Vec<OstreeCommitSpec>,
    containers_resolved: Vec<ContainerSpec>,
    started: bool,
}

impl IsoTreePipeline {
    pub fn new(
        name: &str,
        build: &str,
        anaconda_pipeline: &str,
        payload: PayloadSource,
        platform: Platform,
    ) -> Self {
        IsoTreePipeline {
            base: PipelineBase::new(name, Some(build)),
            anaconda_pipeline: anaconda_pipeline.to_string(),
            rootfs_pipeline: None,
            efiboot_pipeline: None,
            payload,
            kickstart: KickstartOptions {
                path: "/osbuild.ks".to_string(),
                ..KickstartOptions::default()
            },
            platform,
            kernel_version: String::new(),
            kernel_opts: Vec::new(),
            product: String::new(),
            version: String::new(),
            release: String::new(),
            iso_label: String::new(),
            rootfs_type: IsoRootfsType::default(),
            boot_type: IsoBootType::default(),
            install_rootfs_type: FilesystemType::Ext4,
            efiboot_table: None,
            commits_resolved: Vec::new(),
            containers_resolved: Vec::new(),
            started: false,
        }
    }

    pub fn build_packages(&self) -> Vec<String> {
        let mut packages = match self.rootfs_type {
            IsoRootfsType::Erofs => vec!["erofs-utils".to_string()],
            _ => vec!["squashfs-tools".to_string()],
        };
        if matches!(self.payload, PayloadSource::Container { .. }) {
            packages.push("skopeo".to_string());
        }
        if matches!(self.payload, PayloadSource::OstreeCommit { .. }) {
            packages.push("ostree".to_string());
        }
        packages
    }

    pub fn declared_containers(&self) -> Vec<ContainerSourceSpec> {
        match &self.payload {
            PayloadSource::Container { source } => vec![source.clone()],
            _ => Vec::new(),
        }
    }

    pub fn declared_commits(&self) -> Vec<OstreeSourceSpec> {
        match &self.payload {
            PayloadSource::OstreeCommit { source, .. } => vec![source.clone()],
            _ => Vec::new(),
        }
    }

    pub fn serialize_start(&mut self, inputs: PipelineInputs) {
        if self.started {
            panic!("double call to serialize_start()");
        }
        self.started = true;
        if inputs.commits.len() > 1 {
            panic!(
                "the installer tree supports at most one ostree commit, got {}",
                inputs.commits.len()
            );
        }
        if inputs.containers.len() > 1 {
            panic!(
                "the installer tree supports at most one container, got {}",
                inputs.containers.len()
            );
        }
        self.commits_resolved = inputs.commits;
        self.containers_resolved = inputs.containers;
    }

    pub fn serialize_end(&mut self) {
        if !self.started {
            panic!("serialize_end() call when serialization not in progress");
        }
        self.started = false;
        self.commits_resolved.clear();
        self.containers_resolved.clear();
    }

    pub fn resolved_commits(&self) -> Vec<OstreeCommitSpec> {
        self.commits_resolved.clone()
    }

    pub fn resolved_containers(&self) -> Vec<ContainerSpec> {
        self.containers_resolved.clone()
    }

    /// Base path variant of the kickstart path: `/osbuild.ks` becomes
    /// `/osbuild-base.ks`. Used when raw content shadows the generated one.
    fn base_ks_path(&self) -> String {
        match self.kickstart.path.strip_suffix(".ks") {
            Some(stem) => format!("{stem}-base.ks"),
            None => format!("{}-base", self.kickstart.path),
        }
    }

    /// The raw kickstart body, when one is needed: a user-supplied file, a
    /// sudoers drop-in block, or the bootc switch for container payloads.
    fn raw_kickstart_body(&self) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();
        if !self.kickstart.sudo_nopasswd.is_empty() {
            let mut body = String::from("\n%post\n");
            for name in &self.kickstart.sudo_nopasswd {
                body.push_str(&format!(
                    "echo -e \"{name}\\tALL=(ALL)\\tNOPASSWD: ALL\" > \"/etc/sudoers.d/{name}\"\n"
                ));
                body.push_str(&format!("chmod 0440 /etc/sudoers.d/{name}\n"));
            }
            body.push_str("restorecon -rvF /etc/sudoers.d\n%end\n");
            parts.push(body);
        }
        if let Some(user_file) = &self.kickstart.user_file {
            // user content replaces every other generated raw fragment
            parts = vec![user_file.clone()];
        }
        if matches!(self.payload, PayloadSource::Container { .. }) && parts.is_empty() {
            parts.push(String::new());
        }
        if parts.is_empty() {
            return None;
        }
        let include_path = format!(
            "/run/install/repo{}",
            self.base_ks_path()
        );
        let mut body = format!("%include {include_path}\n");
        for part in parts {
            body.push_str(&part);
        }
        Some(body)
    }

    pub fn inline_data(&self) -> Vec<String> {
        self.raw_kickstart_body().into_iter().collect()
    }

    fn kickstart_stage_options(&self) -> osbuild::KickstartStageOptions {
        let raw = self.raw_kickstart_body();
        let path = if raw.is_some() {
            self.base_ks_path()
        } else {
            self.kickstart.path.clone()
        };

        let mut options = osbuild::KickstartStageOptions {
            path,
            ..osbuild::KickstartStageOptions::default()
        };

        for user in &self.kickstart.users {
            let mut entry = serde_json::Map::new();
            if let Some(key) = &user.key {
                entry.insert("key".to_string(), serde_json::json!(key));
            }
            if let Some(password) = &user.password {
                entry.insert("password".to_string(), serde_json::json!(password));
            }
            if !user.groups.is_empty() {
                entry.insert("groups".to_string(), serde_json::json!(user.groups));
            }
            options
                .users
                .insert(user.name.clone(), serde_json::Value::Object(entry));
        }
        for group in &self.kickstart.groups {
            let mut entry = serde_json::Map::new();
            if let Some(gid) = group.gid {
                entry.insert("gid".to_string(), serde_json::json!(gid));
            }
            options
                .groups
                .insert(group.name.clone(), serde_json::Value::Object(entry));
        }

        match &self.payload {
            PayloadSource::OsTar { .. } => {
                options.live_img = Some(osbuild::KickstartLiveImgOptions {
                    url: "file:///run/install/repo/liveimg.tar.gz".to_string(),
                });
            }
            PayloadSource::OstreeCommit { source, os_name } => {
                options.ostree = Some(osbuild::KickstartOstreeCommitOptions {
                    os_name: os_name.clone(),
                    remote: String::new(),
                    url: "file:///run/install/repo/ostree/repo".to_string(),
                    reference: source.reference.clone(),
                    gpg: false,
                });
            }
            PayloadSource::Container { .. } => {
                options.ostree_container = Some(osbuild::KickstartOstreeContainerOptions {
                    state_root: "default".to_string(),
                    url: "/run/install/repo/container".to_string(),
                    transport: "oci".to_string(),
                    remote: String::new(),
                    signature_verification: false,
                });
            }
        }

        if self.kickstart.unattended {
            options.lang = if self.kickstart.language.is_empty() {
                "en_US.UTF-8".to_string()
            } else {
                self.kickstart.language.clone()
            };
            options.keyboard = if self.kickstart.keyboard.is_empty() {
                "us".to_string()
            } else {
                self.kickstart.keyboard.clone()
            };
            options.timezone = if self.kickstart.timezone.is_empty() {
                "UTC".to_string()
            } else {
                self.kickstart.timezone.clone()
            };
            options.display_mode = "text".to_string();
            options.reboot = Some(osbuild::KickstartRebootOptions { eject: true });
            options.root_password = Some(osbuild::KickstartRootPasswordOptions { lock: true });
            options.zero_mbr = true;
            options.clear_part = Some(osbuild::KickstartClearPartOptions {
                all: true,
                init_label: true,
            });
            options.auto_part = Some(autopart_options(self.install_rootfs_type));
            options.network = vec![osbuild::KickstartNetworkOptions {
                activate: Some(true),
                boot_proto: "dhcp".to_string(),
                device: "link".to_string(),
                on_boot: "on".to_string(),
            }];
        }

        options
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        if !self.started {
            panic!("serialization not started");
        }
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);

        pipeline.add_stage(osbuild::Stage::new(
            "org.osbuild.mkdir",
            serde_json::json!({
                "paths": [
                    { "path": "/images", "exist_ok": true },
                    { "path": "/images/pxeboot", "exist_ok": true },
                ],
            }),
        ));

        pipeline.add_stage(osbuild::new_copy_stage_simple(
            &[
                osbuild::CopyStagePath {
                    from: format!(
                        "input://tree/boot/vmlinuz-{}",
                        self.kernel_version
                    ),
                    to: "tree:///images/pxeboot/vmlinuz".to_string(),
                },
                osbuild::CopyStagePath {
                    from: format!(
                        "input://tree/boot/initramfs-{}.img",
                        self.kernel_version
                    ),
                    to: "tree:///images/pxeboot/initrd.img".to_string(),
                },
            ],
            osbuild::new_pipeline_tree_inputs("tree", &self.anaconda_pipeline),
        ));

        // the compressed installer runtime
        let squash_source = self
            .rootfs_pipeline
            .clone()
            .unwrap_or_else(|| self.anaconda_pipeline.clone());
        match self.rootfs_type {
            IsoRootfsType::Erofs => {
                pipeline.add_stage(osbuild::new_erofs_stage(
                    &osbuild::ErofsStageOptions {
                        filename: "images/install.img".to_string(),
                        compression: Some(osbuild::ErofsCompression {
                            method: "zstd".to_string(),
                            level: Some(8),
                        }),
                        extended_options: vec![
                            "all-fragments".to_string(),
                            "dedupe".to_string(),
                        ],
                        cluster_size: Some(131072),
                        exclude_paths: installer_boot_exclude_paths(),
                    },
                    &squash_source,
                ));
            }
            IsoRootfsType::Squashfs | IsoRootfsType::SquashfsExt4 => {
                pipeline.add_stage(osbuild::new_squashfs_stage(
                    &osbuild::SquashfsStageOptions {
                        filename: "images/install.img".to_string(),
                        compression: osbuild::FsCompression {
                            method: "xz".to_string(),
                            options: Some(osbuild::FsCompressionOptions {
                                bcj: bcj_option(self.platform.arch),
                            }),
                        },
                        exclude_paths: if self.rootfs_type == IsoRootfsType::Squashfs {
                            installer_boot_exclude_paths()
                        } else {
                            Vec::new()
                        },
                    },
                    &squash_source,
                ));
            }
        }

        match &self.payload {
            PayloadSource::OsTar { os_pipeline } => {
                pipeline.add_stage(osbuild::new_tar_stage(
                    &osbuild::TarStageOptions {
                        filename: "/liveimg.tar.gz".to_string(),
                        ..osbuild::TarStageOptions::default()
                    },
                    os_pipeline,
                ));
            }
            PayloadSource::OstreeCommit { .. } => {
                if self.commits_resolved.len() != 1 {
                    panic!(
                        "expected exactly one resolved commit for the ostree payload, got {}",
                        self.commits_resolved.len()
                    );
                }
                let commit = &self.commits_resolved[0];
                pipeline.add_stage(osbuild::new_ostree_init_stage("/ostree/repo"));
                pipeline.add_stage(osbuild::new_ostree_pull_stage("/ostree/repo", commit));
            }
            PayloadSource::Container { .. } => {
                if self.containers_resolved.len() != 1 {
                    panic!(
                        "expected exactly one resolved container for the container payload, got {}",
                        self.containers_resolved.len()
                    );
                }
                pipeline.add_stage(osbuild::new_skopeo_stage(
                    &self.containers_resolved[0],
                    "/container",
                ));
            }
        }

        if let Some(raw) = self.raw_kickstart_body() {
            let hash = osbuild::content_hash(raw.as_bytes());
            let input_name = format!("file-{hash}");
            let inputs: osbuild::Inputs = BTreeMap::from([(
                input_name.clone(),
                osbuild::new_files_input_for_inline(&hash),
            )]);
            pipeline.add_stage(osbuild::new_copy_stage_simple(
                &[osbuild::CopyStagePath {
                    from: format!("input://{input_name}/sha256:{hash}"),
                    to: format!("tree://{}", self.kickstart.path),
                }],
                inputs,
            ));
        }
        pipeline.add_stage(osbuild::new_kickstart_stage(&self.kickstart_stage_options()));

        // efiboot.img plus a copy of the EFI tree for mounted installs
        if let (Some(efiboot_pipeline), Some(efiboot_table)) =
            (&self.efiboot_pipeline, &self.efiboot_table)
        {
            let filename = "images/efiboot.img";
            pipeline.add_stage(osbuild::new_truncate_stage(filename, efiboot_table.size));
            pipeline.add_stages(osbuild::gen_mkfs_stages(efiboot_table, filename));

            let (devices, mounts) = osbuild::gen_fs_devices_mounts(efiboot_table, filename);
            pipeline.add_stage(osbuild::new_copy_stage_mounted(
                &[osbuild::CopyStagePath {
                    from: "input://tree/EFI".to_string(),
                    to: "mount://root/".to_string(),
                }],
                osbuild::new_pipeline_tree_inputs("tree", efiboot_pipeline),
                devices,
                mounts,
            ));
            pipeline.add_stage(osbuild::new_copy_stage_simple(
                &[osbuild::CopyStagePath {
                    from: "input://tree/EFI".to_string(),
                    to: "tree:///".to_string(),
                }],
                osbuild::new_pipeline_tree_inputs("tree", efiboot_pipeline),
            ));
        }

        match self.boot_type {
            IsoBootType::Grub2Uefi => {}
            IsoBootType::Syslinux => {
                pipeline.add_stage(osbuild::new_isolinux_stage(
                    &osbuild::IsolinuxStageOptions {
                        product: osbuild::IsolinuxProduct {
                            name: self.product.clone(),
                            version: self.version.clone(),
                        },
                        kernel: osbuild::IsolinuxKernel {
                            dir: "/images/pxeboot".to_string(),
                            opts: self.kernel_opts.clone(),
                        },
                    },
                    &self.anaconda_pipeline,
                ));
            }
            IsoBootType::Grub2 => {
                pipeline.add_stage(osbuild::new_grub2_iso_legacy_stage(
                    &osbuild::GrubIsoStageOptions {
                        product: osbuild::IsolinuxProduct {
                            name: self.product.clone(),
                            version: self.version.clone(),
                        },
                        kernel: osbuild::GrubIsoKernel {
                            dir: "/images/pxeboot".to_string(),
                            opts: self.kernel_opts.clone(),
                        },
                        iso_label: self.iso_label.clone(),
                        ..osbuild::GrubIsoStageOptions::default()
                    },
                ));
            }
        }

        pipeline.add_stage(osbuild::new_discinfo_stage(&osbuild::DiscinfoStageOptions {
            base_arch: self.platform.arch.to_string(),
            release: self.release.clone(),
        }));
        pipeline.add_stage(osbuild::new_treeinfo_stage(&osbuild::TreeinfoStageOptions {
            product: self.product.clone(),
            version: self.version.clone(),
            base_arch: self.platform.arch.to_string(),
            release: self.release.clone(),
        }));

        Ok(pipeline)
    }
}

/// xz BCJ filter matching the target architecture.
fn bcj_option(arch: Arch) -> String {
    match arch {
        Arch::X86_64 => "x86".to_string(),
        Arch::Aarch64 => "arm".to_string(),
        Arch::Ppc64le => "powerpc".to_string(),
        Arch::S390x | Arch::Riscv64 => String::new(),
    }
}

/// The final ISO 9660 image.
#[derive(Debug, Clone)]
pub struct IsoPipeline {
    pub base: PipelineBase,
    pub tree_pipeline: String,
    pub filename: String,
    pub iso_label: String,
    pub boot_type: IsoBootType,
}

impl IsoPipeline {
    pub fn new(name: &str, build: &str, tree_pipeline: &str, iso_label: &str) -> Self {
        IsoPipeline {
            base: PipelineBase::new(name, Some(build)),
            tree_pipeline: tree_pipeline.to_string(),
            filename: "installer.iso".to_string(),
            iso_label: iso_label.to_string(),
            boot_type: IsoBootType::default(),
        }
    }

    pub fn build_packages(&self) -> Vec<String> {
        let mut packages = vec!["xorriso".to_string(), "isomd5sum".to_string()];
        if self.boot_type == IsoBootType::Syslinux {
            packages.push("syslinux".to_string());
        }
        packages
    }

    pub fn serialize(&self) -> Result<osbuild::Pipeline> {
        let mut options = osbuild::XorrisofsStageOptions {
            filename: self.filename.clone(),
            vol_id: self.iso_label.clone(),
            sys_id: "LINUX".to_string(),
            efi: "images/efiboot.img".to_string(),
            iso_level: Some(3),
            ..osbuild::XorrisofsStageOptions::default()
        };
        match self.boot_type {
            IsoBootType::Grub2Uefi => {}
            IsoBootType::Syslinux => {
                options.boot = Some(osbuild::XorrisofsBoot {
                    image: "isolinux/isolinux.bin".to_string(),
                    catalog: "isolinux/boot.cat".to_string(),
                });
                options.iso_hybrid_mbr = "/usr/share/syslinux/isohdpfx.bin".to_string();
            }
            IsoBootType::Grub2 => {
                options.boot = Some(osbuild::XorrisofsBoot {
                    image: "images/eltorito.img".to_string(),
                    catalog: "boot.cat".to_string(),
                });
                options.grub2_mbr = "/usr/lib/grub/i386-pc/boot_hybrid.img".to_string();
            }
        }
        let mut pipeline = osbuild::Pipeline::new(&self.base.name);
        pipeline.add_stage(osbuild::new_xorrisofs_stage(&options, &self.tree_pipeline));
        pipeline.add_stage(osbuild::new_implantisomd5_stage(&self.filename));
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasizes::MIB;
    use crate::disk::{Filesystem, Partition, Payload};

    fn efiboot_table() -> PartitionTable {
        PartitionTable {
            size: 20 * MIB,
            partitions: vec![Partition {
                start: 0,
                size: 20 * MIB,
                payload: Some(Payload::Filesystem(Filesystem {
                    fs_type: FilesystemType::Vfat,
                    uuid: "7B77-95E7".to_string(),
                    mountpoint: "/".to_string(),
                    ..Filesystem::default()
                })),
                ..Partition::default()
            }],
            ..PartitionTable::default()
        }
    }

    fn container_tree() -> IsoTreePipeline {
        let mut tree = IsoTreePipeline::new(
            "bootiso-tree",
            "build",
            "anaconda-tree",
            PayloadSource::Container {
                source: ContainerSourceSpec {
                    source: "registry.example.org/org/image".to_string(),
                    ..ContainerSourceSpec::default()
                },
            },
            Platform::default(),
        );
        tree.kernel_version = "6.8.0-100.fc40.x86_64".to_string();
        tree.kickstart.path = "/osbuild.ks".to_string();
        tree
    }

    fn start(tree: &mut IsoTreePipeline) {
        let containers = match &tree.payload {
            PayloadSource::Container { .. } => vec![ContainerSpec {
                source: "registry.example.org/org/image".to_string(),
                digest: "sha256:dd".to_string(),
                image_id: "sha256:ii".to_string(),
                local_name: "registry.example.org/org/image".to_string(),
                ..ContainerSpec::default()
            }],
            _ => Vec::new(),
        };
        tree.serialize_start(PipelineInputs {
            containers,
            ..PipelineInputs::default()
        });
    }

    #[test]
    fn test_container_payload_tree() {
        let mut tree = container_tree();
        tree.kickstart.user_file = Some("%post\necho hi\n%end\n".to_string());
        start(&mut tree);
        let pipeline = tree.serialize().unwrap();
        let types: Vec<&str> = pipeline.stages.iter().map(|s| s.stage_type.as_str()).collect();

        assert!(types.contains(&"org.osbuild.skopeo"));
        assert!(!types.contains(&"org.osbuild.tar"));
        assert!(!types.contains(&"org.osbuild.ostree.pull"));

        let copies = types.iter().filter(|t| **t == "org.osbuild.copy").count();
        assert_eq!(copies, 2);

        // the generated kickstart moves to the base path, the raw body is
        // written to the user-visible path
        let ks = pipeline
            .stages
            .iter()
            .find(|s| s.stage_type == "org.osbuild.kickstart")
            .unwrap();
        let value = serde_json::to_value(ks).unwrap();
        assert_eq!(value["options"]["path"], "/osbuild-base.ks");

        let raw = tree.raw_kickstart_body().unwrap();
        assert!(raw.starts_with("%include /run/install/repo/osbuild-base.ks\n"));
        assert!(raw.contains("echo hi"));
        tree.serialize_end();
    }

    #[test]
    fn test_inline_kickstart_content_addressing() {
        let mut tree = container_tree();
        start(&mut tree);
        let pipeline = tree.serialize().unwrap();
        let raw = tree.raw_kickstart_body().unwrap();
        let hash = osbuild::content_hash(raw.as_bytes());
        let copy = pipeline
            .stages
            .iter()
            .find(|s| {
                s.stage_type == "org.osbuild.copy"
                    && serde_json::to_value(s).unwrap()["options"]["paths"][0]["to"]
                        == "tree:///osbuild.ks"
            })
            .unwrap();
        let value = serde_json::to_value(copy).unwrap();
        assert_eq!(
            value["options"]["paths"][0]["from"],
            format!("input://file-{hash}/sha256:{hash}")
        );
        tree.serialize_end();
    }

    #[test]
    fn test_ostar_payload_without_raw_kickstart() {
        let mut tree = IsoTreePipeline::new(
            "bootiso-tree",
            "build",
            "anaconda-tree",
            PayloadSource::OsTar {
                os_pipeline: "os".to_string(),
            },
            Platform::default(),
        );
        tree.kernel_version = "6.8.0".to_string();
        tree.serialize_start(PipelineInputs::default());
        let pipeline = tree.serialize().unwrap();
        let types: Vec<&str> = pipeline.stages.iter().map(|s| s.stage_type.as_str()).collect();
        assert!(types.contains(&"org.osbuild.tar"));

        let ks = pipeline
            .stages
            .iter()
            .find(|s| s.stage_type == "org.osbuild.kickstart")
            .unwrap();
        let value = serde_json::to_value(ks).unwrap();
        assert_eq!(value["options"]["path"], "/osbuild.ks");
        assert_eq!(
            value["options"]["liveimg"]["url"],
            "file:///run/install/repo/liveimg.tar.gz"
        );
        tree.serialize_end();
    }

    #[test]
    fn test_unattended_kickstart_options() {
        let mut tree = IsoTreePipeline::new(
            "bootiso-tree",
            "build",
            "anaconda-tree",
            PayloadSource::OsTar {
                os_pipeline: "os".to_string(),
            },
            Platform::default(),
        );
        tree.kickstart.unattended = true;
        tree.install_rootfs_type = FilesystemType::Btrfs;
        tree.serialize_start(PipelineInputs::default());
        let pipeline = tree.serialize().unwrap();
        let ks = pipeline
            .stages
            .iter()
            .find(|s| s.stage_type == "org.osbuild.kickstart")
            .unwrap();
        let value = serde_json::to_value(ks).unwrap();
        assert_eq!(value["options"]["autopart"]["type"], "btrfs");
        assert_eq!(value["options"]["autopart"]["nohome"], true);
        assert_eq!(value["options"]["zerombr"], true);
        assert_eq!(value["options"]["clearpart"]["all"], true);
        tree.serialize_end();
    }

    #[test]
    fn test_autopart_fs_mapping() {
        let plain = autopart_options(FilesystemType::Xfs);
        assert_eq!(plain.part_type, "plain");
        assert_eq!(plain.fs_type, "xfs");
        // no explicit filesystem falls back to ext4
        let fallback = autopart_options(FilesystemType::None);
        assert_eq!(fallback.fs_type, "ext4");
        let btrfs = autopart_options(FilesystemType::Btrfs);
        assert_eq!(btrfs.part_type, "btrfs");
        assert_eq!(btrfs.fs_type, "");
    }

    #[test]
    fn test_efiboot_chain_and_boot_variants() {
        let mut tree = container_tree();
        tree.efiboot_pipeline = Some("efiboot-tree".to_string());
        tree.efiboot_table = Some(efiboot_table());
        tree.boot_type = IsoBootType::Syslinux;
        start(&mut tree);
        let pipeline = tree.serialize().unwrap();
        let types: Vec<&str> = pipeline.stages.iter().map(|s| s.stage_type.as_str()).collect();
        assert!(types.contains(&"org.osbuild.truncate"));
        assert!(types.contains(&"org.osbuild.mkfs.fat"));
        assert!(types.contains(&"org.osbuild.isolinux"));
        tree.serialize_end();
    }

    #[test]
    fn test_iso_pipeline_boot_variants() {
        let grub2_uefi = IsoPipeline::new("bootiso", "build", "bootiso-tree", "TEST-ISO");
        let pipeline = grub2_uefi.serialize().unwrap();
        let value = serde_json::to_value(&pipeline.stages[0]).unwrap();
        assert_eq!(value["options"]["volid"], "TEST-ISO");
        assert!(value["options"]["boot"].is_null());
        assert_eq!(pipeline.stages[1].stage_type, "org.osbuild.implantisomd5");

        let mut syslinux = IsoPipeline::new("bootiso", "build", "bootiso-tree", "TEST-ISO");
        syslinux.boot_type = IsoBootType::Syslinux;
        let pipeline = syslinux.serialize().unwrap();
        let value = serde_json::to_value(&pipeline.stages[0]).unwrap();
        assert_eq!(value["options"]["boot"]["image"], "isolinux/isolinux.bin");
        assert!(value["options"]["isohybridmbr"]
            .as_str()
            .unwrap()
            .contains("isohdpfx"));
    }
}
