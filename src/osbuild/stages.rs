//! Constructors for the individual stage types.
//!
//! Each constructor takes typed options and produces a [`Stage`] whose
//! serialized form matches the downstream executor's schema. Option structs
//! are the wire contract: field names and omission rules are pinned to the
//! executor, not to taste.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{
    content_hash, new_containers_input, new_files_input_for_inline, new_ostree_commit_input,
    new_pipeline_tree_inputs, new_rpms_input, Inputs, Stage,
};
use crate::blueprint::{
    FirewallCustomization, GroupCustomization, ServicesCustomization, UserCustomization,
};
use crate::content::{ContainerSpec, OstreeCommitSpec, PackageSpec, RepoConfig};
use crate::fsnode::{DirectoryNode, FileNode, NodeOwner};

fn owner_value(owner: &Option<NodeOwner>) -> Option<serde_json::Value> {
    owner.as_ref().map(|owner| match owner {
        NodeOwner::Name(name) => serde_json::json!(name),
        NodeOwner::Id(id) => serde_json::json!(id),
    })
}

// ── RPM ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RpmStageOptions {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gpgkeys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<RpmExclude>,
    #[serde(rename = "ostree_booted", skip_serializing_if = "Option::is_none")]
    pub ostree_booted: Option<bool>,
    #[serde(rename = "dbpath", skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(rename = "disable_dracut", skip_serializing_if = "std::ops::Not::not")]
    pub disable_dracut: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RpmExclude {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub docs: bool,
}

impl RpmStageOptions {
    pub fn new(repos: &[RepoConfig]) -> Self {
        let gpgkeys = repos
            .iter()
            .flat_map(|repo| repo.gpg_keys.iter().cloned())
            .collect();
        RpmStageOptions {
            gpgkeys,
            ..RpmStageOptions::default()
        }
    }
}

pub fn new_rpm_stage(options: &RpmStageOptions, packages: &[PackageSpec]) -> Stage {
    let inputs = BTreeMap::from([("packages".to_string(), new_rpms_input(packages))]);
    Stage::new("org.osbuild.rpm", options).with_inputs(inputs)
}

// ── OSTree ──────────────────────────────────────────────────────────────────

/// Import /etc/passwd and /etc/group from a parent commit so uids/gids stay
/// stable across upgrades.
pub fn new_ostree_passwd_stage(commit: &OstreeCommitSpec) -> Stage {
    let inputs = BTreeMap::from([("commits".to_string(), new_ostree_commit_input(commit))]);
    Stage::without_options("org.osbuild.ostree.passwd").with_inputs(inputs)
}

pub fn new_ostree_init_stage(path: &str) -> Stage {
    Stage::new("org.osbuild.ostree.init", serde_json::json!({ "path": path }))
}

pub fn new_ostree_pull_stage(repo_path: &str, commit: &OstreeCommitSpec) -> Stage {
    let inputs = BTreeMap::from([("commits".to_string(), new_ostree_commit_input(commit))]);
    Stage::new(
        "org.osbuild.ostree.pull",
        serde_json::json!({ "repo": repo_path }),
    )
    .with_inputs(inputs)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OstreeDeployStageOptions {
    #[serde(rename = "osname")]
    pub os_name: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub mounts: Vec<String>,
    pub rootfs: OstreeDeployRootfs,
    #[serde(rename = "kernel_opts", skip_serializing_if = "Vec::is_empty")]
    pub kernel_opts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OstreeDeployRootfs {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label: String,
}

pub fn new_ostree_deploy_stage(options: &OstreeDeployStageOptions) -> Stage {
    Stage::new("org.osbuild.ostree.deploy", options)
}

// ── Bootloader ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FixBlsStageOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Rewrite the Boot Loader Specification entries to match the image layout.
pub fn new_fix_bls_stage(options: &FixBlsStageOptions) -> Stage {
    Stage::new("org.osbuild.fix-bls", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Grub2StageOptions {
    #[serde(rename = "root_fs_uuid")]
    pub root_fs_uuid: String,
    #[serde(rename = "boot_fs_uuid", skip_serializing_if = "Option::is_none")]
    pub boot_fs_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_opts: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub legacy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uefi: Option<Grub2UefiOptions>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub write_cmdline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greenboot: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Grub2UefiOptions {
    pub vendor: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unified: bool,
}

pub fn new_grub2_stage(options: &Grub2StageOptions) -> Stage {
    Stage::new("org.osbuild.grub2", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Grub2InstStageOptions {
    pub filename: String,
    pub platform: String,
    pub location: u64,
    #[serde(rename = "core")]
    pub core: Grub2Core,
    #[serde(rename = "prefix")]
    pub prefix: Grub2Prefix,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Grub2Core {
    #[serde(rename = "type")]
    pub core_type: String,
    pub partlabel: String,
    pub filesystem: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Grub2Prefix {
    #[serde(rename = "type")]
    pub prefix_type: String,
    pub partlabel: String,
    pub number: u64,
    pub path: String,
}

/// Install the grub2 core image into the BIOS boot gap.
pub fn new_grub2_inst_stage(options: &Grub2InstStageOptions) -> Stage {
    Stage::new("org.osbuild.grub2.inst", options)
}

pub fn new_zipl_stage() -> Stage {
    Stage::new("org.osbuild.zipl", serde_json::json!({}))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KernelCmdlineStageOptions {
    #[serde(rename = "root_fs_uuid", skip_serializing_if = "String::is_empty")]
    pub root_fs_uuid: String,
    #[serde(rename = "kernel_opts", skip_serializing_if = "String::is_empty")]
    pub kernel_opts: String,
}

pub fn new_kernel_cmdline_stage(root_fs_uuid: &str, kernel_opts: &str) -> Stage {
    Stage::new(
        "org.osbuild.kernel-cmdline",
        KernelCmdlineStageOptions {
            root_fs_uuid: root_fs_uuid.to_string(),
            kernel_opts: kernel_opts.to_string(),
        },
    )
}

// ── Locale, time, identity ──────────────────────────────────────────────────

pub fn new_locale_stage(language: &str) -> Stage {
    Stage::new(
        "org.osbuild.locale",
        serde_json::json!({ "language": language }),
    )
}

pub fn new_keymap_stage(keymap: &str) -> Stage {
    Stage::new("org.osbuild.keymap", serde_json::json!({ "keymap": keymap }))
}

pub fn new_hostname_stage(hostname: &str) -> Stage {
    Stage::new(
        "org.osbuild.hostname",
        serde_json::json!({ "hostname": hostname }),
    )
}

pub fn new_timezone_stage(zone: &str) -> Stage {
    Stage::new("org.osbuild.timezone", serde_json::json!({ "zone": zone }))
}

pub fn new_chrony_stage(servers: &[String]) -> Stage {
    let servers: Vec<serde_json::Value> = servers
        .iter()
        .map(|hostname| serde_json::json!({ "hostname": hostname }))
        .collect();
    Stage::new("org.osbuild.chrony", serde_json::json!({ "servers": servers }))
}

pub fn new_machine_id_stage(first_boot: &str) -> Stage {
    Stage::new(
        "org.osbuild.machine-id",
        serde_json::json!({ "first-boot": first_boot }),
    )
}

// ── Users and groups ────────────────────────────────────────────────────────

pub fn new_groups_stage(groups: &[GroupCustomization]) -> Stage {
    let mut entries: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for group in groups {
        let mut options = serde_json::Map::new();
        if let Some(gid) = group.gid {
            options.insert("gid".to_string(), serde_json::json!(gid));
        }
        entries.insert(group.name.clone(), serde_json::Value::Object(options));
    }
    Stage::new("org.osbuild.groups", serde_json::json!({ "groups": entries }))
}

/// Create users. With `omit_keys` the SSH keys are left out; OSTree images
/// write them on first boot instead.
pub fn new_users_stage(users: &[UserCustomization], omit_keys: bool) -> Stage {
    let mut entries: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for user in users {
        let mut options = serde_json::Map::new();
        if let Some(uid) = user.uid {
            options.insert("uid".to_string(), serde_json::json!(uid));
        }
        if let Some(gid) = user.gid {
            options.insert("gid".to_string(), serde_json::json!(gid));
        }
        if !user.groups.is_empty() {
            options.insert("groups".to_string(), serde_json::json!(user.groups));
        }
        if let Some(description) = &user.description {
            options.insert("description".to_string(), serde_json::json!(description));
        }
        if let Some(home) = &user.home {
            options.insert("home".to_string(), serde_json::json!(home));
        }
        if let Some(shell) = &user.shell {
            options.insert("shell".to_string(), serde_json::json!(shell));
        }
        if let Some(password) = &user.password {
            options.insert("password".to_string(), serde_json::json!(password));
        }
        if !omit_keys {
            if let Some(key) = &user.key {
                options.insert("key".to_string(), serde_json::json!(key));
            }
        }
        entries.insert(user.name.clone(), serde_json::Value::Object(options));
    }
    Stage::new("org.osbuild.users", serde_json::json!({ "users": entries }))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FirstBootStageOptions {
    pub commands: Vec<String>,
    #[serde(rename = "wait_for_network")]
    pub wait_for_network: bool,
}

pub fn new_first_boot_stage(options: &FirstBootStageOptions) -> Stage {
    Stage::new("org.osbuild.first-boot", options)
}

/// First-boot commands that write authorized SSH keys into /var-backed home
/// directories; used on OSTree systems where home lives under /var.
pub fn users_first_boot_options(users: &[UserCustomization]) -> FirstBootStageOptions {
    let var_home = "/var/home";
    let root_home = "/var/roothome";
    let mut commands = Vec::with_capacity(3 * users.len() + 2);
    for user in users {
        let Some(key) = &user.key else { continue };
        let home = if user.name == "root" {
            root_home.to_string()
        } else {
            format!("{var_home}/{}", user.name)
        };
        let ssh_dir = format!("{home}/.ssh");
        commands.push(format!("mkdir -p {ssh_dir}"));
        commands.push(format!(
            "sh -c 'echo \"{key}\" >> \"{ssh_dir}/authorized_keys\"'"
        ));
        commands.push(format!("chown {0}:{0} -Rc {ssh_dir}", user.name));
    }
    commands.push(format!("restorecon -rvF {var_home}"));
    commands.push(format!("restorecon -rvF {root_home}"));
    FirstBootStageOptions {
        commands,
        wait_for_network: false,
    }
}

// ── System configuration ────────────────────────────────────────────────────

pub fn new_firewall_stage(firewall: &FirewallCustomization) -> Stage {
    let mut options = serde_json::Map::new();
    if !firewall.ports.is_empty() {
        options.insert("ports".to_string(), serde_json::json!(firewall.ports));
    }
    if let Some(services) = &firewall.services {
        if !services.enabled.is_empty() {
            options.insert(
                "enabled_services".to_string(),
                serde_json::json!(services.enabled),
            );
        }
        if !services.disabled.is_empty() {
            options.insert(
                "disabled_services".to_string(),
                serde_json::json!(services.disabled),
            );
        }
    }
    Stage::new("org.osbuild.firewall", serde_json::Value::Object(options))
}

pub fn new_systemd_stage(services: &ServicesCustomization, default_target: Option<&str>) -> Stage {
    let mut options = serde_json::Map::new();
    if !services.enabled.is_empty() {
        options.insert(
            "enabled_services".to_string(),
            serde_json::json!(services.enabled),
        );
    }
    if !services.disabled.is_empty() {
        options.insert(
            "disabled_services".to_string(),
            serde_json::json!(services.disabled),
        );
    }
    if !services.masked.is_empty() {
        options.insert(
            "masked_services".to_string(),
            serde_json::json!(services.masked),
        );
    }
    if let Some(target) = default_target {
        options.insert("default_target".to_string(), serde_json::json!(target));
    }
    Stage::new("org.osbuild.systemd", serde_json::Value::Object(options))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemdUnitCreateStageOptions {
    pub filename: String,
    #[serde(rename = "unit-type")]
    pub unit_type: String,
    #[serde(rename = "unit-path")]
    pub unit_path: String,
    pub config: serde_json::Value,
}

pub fn new_systemd_unit_create_stage(options: &SystemdUnitCreateStageOptions) -> Stage {
    Stage::new("org.osbuild.systemd.unit.create", options)
}

/// SELinux labeling with explicit per-file labels, used on buildroots.
pub fn new_selinux_stage_with_labels(
    file_contexts: &str,
    labels: &BTreeMap<String, String>,
) -> Stage {
    Stage::new(
        "org.osbuild.selinux",
        serde_json::json!({
            "file_contexts": file_contexts,
            "labels": labels,
        }),
    )
}

pub fn new_selinux_stage(file_contexts: &str, exclude_paths: &[String]) -> Stage {
    let mut options = serde_json::Map::new();
    options.insert(
        "file_contexts".to_string(),
        serde_json::json!(file_contexts),
    );
    if !exclude_paths.is_empty() {
        options.insert(
            "exclude_paths".to_string(),
            serde_json::json!(exclude_paths),
        );
    }
    Stage::new("org.osbuild.selinux", serde_json::Value::Object(options))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FstabStageOptions {
    pub filesystems: Vec<FstabEntryOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FstabEntryOptions {
    pub uuid: String,
    pub vfs_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub options: String,
    pub freq: u64,
    #[serde(rename = "passno")]
    pub pass_no: u64,
}

pub fn new_fstab_stage(options: &FstabStageOptions) -> Stage {
    Stage::new("org.osbuild.fstab", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DracutStageOptions {
    pub kernel: Vec<String>,
    #[serde(rename = "add_modules", skip_serializing_if = "Vec::is_empty")]
    pub add_modules: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<String>,
}

pub fn new_dracut_stage(options: &DracutStageOptions) -> Stage {
    Stage::new("org.osbuild.dracut", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DracutConfStageOptions {
    pub filename: String,
    pub config: DracutConfigFile,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DracutConfigFile {
    #[serde(rename = "early_microcode", skip_serializing_if = "Option::is_none")]
    pub early_microcode: Option<bool>,
    #[serde(rename = "add_dracutmodules", skip_serializing_if = "Vec::is_empty")]
    pub add_modules: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub compress: String,
}

pub fn new_dracut_conf_stage(options: &DracutConfStageOptions) -> Stage {
    Stage::new("org.osbuild.dracut.conf", options)
}

/// Journald persistence drop-in; OSTree images default to volatile logs
/// otherwise.
pub fn new_systemd_journald_stage(filename: &str, storage: &str) -> Stage {
    Stage::new(
        "org.osbuild.systemd-journald",
        serde_json::json!({
            "filename": filename,
            "config": { "Journal": { "Storage": storage } },
        }),
    )
}

// ── Security ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OscapRemediationStageOptions {
    #[serde(rename = "data_dir")]
    pub data_dir: String,
    pub config: OscapConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OscapConfig {
    pub datastream: String,
    #[serde(rename = "profile_id")]
    pub profile_id: String,
}

pub fn new_oscap_remediation_stage(options: &OscapRemediationStageOptions) -> Stage {
    Stage::new("org.osbuild.oscap.remediation", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OscapAutotailorStageOptions {
    pub filepath: String,
    pub config: OscapAutotailorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OscapAutotailorConfig {
    #[serde(rename = "new_profile")]
    pub new_profile: String,
    pub datastream: String,
    #[serde(rename = "profile_id")]
    pub profile_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selected: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unselected: Vec<String>,
}

pub fn new_oscap_autotailor_stage(options: &OscapAutotailorStageOptions) -> Stage {
    Stage::new("org.osbuild.oscap.autotailor", options)
}

pub fn new_update_ca_trust_stage() -> Stage {
    Stage::without_options("org.osbuild.update-ca-trust")
}

// ── Filesystem nodes ────────────────────────────────────────────────────────

/// Stages that create custom files: a copy from the inline source for each
/// file, plus chmod/chown when requested.
pub fn gen_file_nodes_stages(files: &[FileNode]) -> Vec<Stage> {
    let mut stages = Vec::new();
    for file in files {
        let hash = content_hash(file.data());
        let input_name = format!("file-{hash}");
        let inputs: Inputs =
            BTreeMap::from([(input_name.clone(), new_files_input_for_inline(&hash))]);
        let copy = Stage::new(
            "org.osbuild.copy",
            serde_json::json!({
                "paths": [{
                    "from": format!("input://{input_name}/sha256:{hash}"),
                    "to": format!("tree://{}", file.path().display()),
                }],
            }),
        )
        .with_inputs(inputs);
        stages.push(copy);

        if let Some(mode) = file.mode {
            stages.push(Stage::new(
                "org.osbuild.chmod",
                serde_json::json!({
                    "items": {
                        file.path().display().to_string(): { "mode": format!("{mode:o}") },
                    },
                }),
            ));
        }
        if file.user.is_some() || file.group.is_some() {
            let mut item = serde_json::Map::new();
            if let Some(user) = owner_value(&file.user) {
                item.insert("user".to_string(), user);
            }
            if let Some(group) = owner_value(&file.group) {
                item.insert("group".to_string(), group);
            }
            stages.push(Stage::new(
                "org.osbuild.chown",
                serde_json::json!({
                    "items": { file.path().display().to_string(): item },
                }),
            ));
        }
    }
    stages
}

/// Stages that create custom directories.
pub fn gen_directory_nodes_stages(directories: &[DirectoryNode]) -> Vec<Stage> {
    if directories.is_empty() {
        return Vec::new();
    }
    let paths: Vec<serde_json::Value> = directories
        .iter()
        .map(|dir| {
            let mut path = serde_json::Map::new();
            path.insert(
                "path".to_string(),
                serde_json::json!(dir.path().display().to_string()),
            );
            if let Some(mode) = dir.mode {
                path.insert("mode".to_string(), serde_json::json!(format!("{mode:o}")));
            }
            if dir.ensure_parent_dirs {
                path.insert("parents".to_string(), serde_json::json!(true));
            }
            path.insert("exist_ok".to_string(), serde_json::json!(true));
            serde_json::Value::Object(path)
        })
        .collect();
    let mut stages = vec![Stage::new(
        "org.osbuild.mkdir",
        serde_json::json!({ "paths": paths }),
    )];
    for dir in directories {
        if dir.user.is_some() || dir.group.is_some() {
            let mut item = serde_json::Map::new();
            if let Some(user) = owner_value(&dir.user) {
                item.insert("user".to_string(), user);
            }
            if let Some(group) = owner_value(&dir.group) {
                item.insert("group".to_string(), group);
            }
            stages.push(Stage::new(
                "org.osbuild.chown",
                serde_json::json!({
                    "items": { dir.path().display().to_string(): item },
                }),
            ));
        }
    }
    stages
}

// ── Archives and conversion ─────────────────────────────────────────────────

pub const TAR_FORMAT_USTAR: &str = "ustar";
pub const TAR_FORMAT_OLDGNU: &str = "oldgnu";
pub const TAR_ROOT_NODE_OMIT: &str = "omit";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TarStageOptions {
    pub filename: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(rename = "root-node", skip_serializing_if = "String::is_empty")]
    pub root_node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selinux: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xattrs: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

pub fn new_tar_stage(options: &TarStageOptions, input_pipeline: &str) -> Stage {
    Stage::new("org.osbuild.tar", options)
        .with_inputs(new_pipeline_tree_inputs("tree", input_pipeline))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QemuStageOptions {
    pub filename: String,
    pub format: QemuFormatOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QemuFormatOptions {
    #[serde(rename = "type")]
    pub format_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub compat: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_size: Option<bool>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub compression: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subformat: String,
}

/// Convert a raw image into qcow2/vpc/vmdk via qemu-img.
pub fn new_qemu_stage(
    options: &QemuStageOptions,
    input_pipeline: &str,
    input_file: &str,
) -> Stage {
    let inputs: Inputs = BTreeMap::from([(
        "image".to_string(),
        super::new_file_input_for_pipeline(input_pipeline, input_file),
    )]);
    Stage::new("org.osbuild.qemu", options).with_inputs(inputs)
}

pub fn new_xz_stage(filename: &str, input_pipeline: &str, input_file: &str) -> Stage {
    let inputs: Inputs = BTreeMap::from([(
        "file".to_string(),
        super::new_file_input_for_pipeline(input_pipeline, input_file),
    )]);
    Stage::new("org.osbuild.xz", serde_json::json!({ "filename": filename })).with_inputs(inputs)
}

pub fn new_zstd_stage(filename: &str, input_pipeline: &str, input_file: &str) -> Stage {
    let inputs: Inputs = BTreeMap::from([(
        "file".to_string(),
        super::new_file_input_for_pipeline(input_pipeline, input_file),
    )]);
    Stage::new("org.osbuild.zstd", serde_json::json!({ "filename": filename })).with_inputs(inputs)
}

pub fn new_gzip_stage(filename: &str, input_pipeline: &str, input_file: &str) -> Stage {
    let inputs: Inputs = BTreeMap::from([(
        "file".to_string(),
        super::new_file_input_for_pipeline(input_pipeline, input_file),
    )]);
    Stage::new("org.osbuild.gzip", serde_json::json!({ "filename": filename })).with_inputs(inputs)
}

pub fn new_ovf_stage(input_pipeline: &str, vmdk_file: &str) -> Stage {
    let inputs: Inputs = BTreeMap::from([(
        "vmdk".to_string(),
        super::new_file_input_for_pipeline(input_pipeline, vmdk_file),
    )]);
    Stage::new(
        "org.osbuild.ovf",
        serde_json::json!({ "vmdk": vmdk_file }),
    )
    .with_inputs(inputs)
}

// ── Filesystem images ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SquashfsStageOptions {
    pub filename: String,
    pub compression: FsCompression,
    #[serde(rename = "exclude_paths", skip_serializing_if = "Vec::is_empty")]
    pub exclude_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FsCompression {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<FsCompressionOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FsCompressionOptions {
    pub bcj: String,
}

pub fn new_squashfs_stage(options: &SquashfsStageOptions, input_pipeline: &str) -> Stage {
    Stage::new("org.osbuild.squashfs", options)
        .with_inputs(new_pipeline_tree_inputs("tree", input_pipeline))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErofsStageOptions {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<ErofsCompression>,
    #[serde(rename = "options", skip_serializing_if = "Vec::is_empty")]
    pub extended_options: Vec<String>,
    #[serde(rename = "cluster-size", skip_serializing_if = "Option::is_none")]
    pub cluster_size: Option<u64>,
    #[serde(rename = "exclude_paths", skip_serializing_if = "Vec::is_empty")]
    pub exclude_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErofsCompression {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
}

pub fn new_erofs_stage(options: &ErofsStageOptions, input_pipeline: &str) -> Stage {
    Stage::new("org.osbuild.erofs", options)
        .with_inputs(new_pipeline_tree_inputs("tree", input_pipeline))
}

// ── Generic tree operations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CopyStagePath {
    pub from: String,
    pub to: String,
}

pub fn new_copy_stage_simple(paths: &[CopyStagePath], inputs: Inputs) -> Stage {
    Stage::new("org.osbuild.copy", serde_json::json!({ "paths": paths })).with_inputs(inputs)
}

/// Copy paths between mounted devices, used when writing a tree into a
/// partitioned disk image.
pub fn new_copy_stage_mounted(
    paths: &[CopyStagePath],
    inputs: Inputs,
    devices: super::Devices,
    mounts: Vec<super::Mount>,
) -> Stage {
    Stage::new("org.osbuild.copy", serde_json::json!({ "paths": paths }))
        .with_inputs(inputs)
        .with_devices(devices)
        .with_mounts(mounts)
}

pub fn new_truncate_stage(filename: &str, size: u64) -> Stage {
    Stage::new(
        "org.osbuild.truncate",
        serde_json::json!({ "filename": filename, "size": size.to_string() }),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChmodStagePathOptions {
    pub mode: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub recursive: bool,
}

pub fn new_chmod_stage(items: &BTreeMap<String, ChmodStagePathOptions>) -> Stage {
    Stage::new("org.osbuild.chmod", serde_json::json!({ "items": items }))
}

// ── Containers ──────────────────────────────────────────────────────────────

/// Deploy a container image into the tree; used for bootstrap buildroots.
pub fn new_container_deploy_stage(container: &ContainerSpec) -> Stage {
    let inputs: Inputs =
        BTreeMap::from([("images".to_string(), new_containers_input(container))]);
    Stage::without_options("org.osbuild.container-deploy").with_inputs(inputs)
}

/// Copy a container image into containers-storage inside the tree.
pub fn new_skopeo_stage(container: &ContainerSpec, destination_path: &str) -> Stage {
    let inputs: Inputs =
        BTreeMap::from([("images".to_string(), new_containers_input(container))]);
    Stage::new(
        "org.osbuild.skopeo",
        serde_json::json!({
            "destination": {
                "type": "containers-storage",
                "storage-path": destination_path,
            },
        }),
    )
    .with_inputs(inputs)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BootcInstallToFilesystemOptions {
    #[serde(rename = "kernel-args", skip_serializing_if = "Vec::is_empty")]
    pub kernel_args: Vec<String>,
}

pub fn new_bootc_install_to_filesystem_stage(
    options: &BootcInstallToFilesystemOptions,
    container: &ContainerSpec,
    devices: super::Devices,
    mounts: Vec<super::Mount>,
) -> Stage {
    let inputs: Inputs =
        BTreeMap::from([("images".to_string(), new_containers_input(container))]);
    Stage::new("org.osbuild.bootc.install-to-filesystem", options)
        .with_inputs(inputs)
        .with_devices(devices)
        .with_mounts(mounts)
}

pub fn new_bootupd_stage(devices: super::Devices, mounts: Vec<super::Mount>) -> Stage {
    Stage::new(
        "org.osbuild.bootupd",
        serde_json::json!({ "static-configs": true }),
    )
    .with_devices(devices)
    .with_mounts(mounts)
}

// ── Installer media ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnacondaStageOptions {
    #[serde(rename = "kickstart-modules", skip_serializing_if = "Vec::is_empty")]
    pub kickstart_modules: Vec<String>,
    #[serde(rename = "activatable-modules", skip_serializing_if = "Vec::is_empty")]
    pub activatable_modules: Vec<String>,
}

pub fn new_anaconda_stage(options: &AnacondaStageOptions) -> Stage {
    Stage::new("org.osbuild.anaconda", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoraxScriptStageOptions {
    pub path: String,
    #[serde(rename = "basearch")]
    pub base_arch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub product: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

pub fn new_lorax_script_stage(options: &LoraxScriptStageOptions) -> Stage {
    Stage::new("org.osbuild.lorax-script", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KickstartStageOptions {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ostree: Option<KickstartOstreeCommitOptions>,
    #[serde(rename = "ostreecontainer", skip_serializing_if = "Option::is_none")]
    pub ostree_container: Option<KickstartOstreeContainerOptions>,
    #[serde(rename = "liveimg", skip_serializing_if = "Option::is_none")]
    pub live_img: Option<KickstartLiveImgOptions>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub lang: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub keyboard: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timezone: String,
    #[serde(rename = "display_mode", skip_serializing_if = "String::is_empty")]
    pub display_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reboot: Option<KickstartRebootOptions>,
    #[serde(rename = "rootpw", skip_serializing_if = "Option::is_none")]
    pub root_password: Option<KickstartRootPasswordOptions>,
    #[serde(rename = "zerombr", skip_serializing_if = "std::ops::Not::not")]
    pub zero_mbr: bool,
    #[serde(rename = "clearpart", skip_serializing_if = "Option::is_none")]
    pub clear_part: Option<KickstartClearPartOptions>,
    #[serde(rename = "autopart", skip_serializing_if = "Option::is_none")]
    pub auto_part: Option<KickstartAutoPartOptions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<KickstartNetworkOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KickstartOstreeCommitOptions {
    #[serde(rename = "osname")]
    pub os_name: String,
    pub remote: String,
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub gpg: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KickstartOstreeContainerOptions {
    #[serde(rename = "stateroot")]
    pub state_root: String,
    pub url: String,
    pub transport: String,
    pub remote: String,
    #[serde(rename = "signatureverification")]
    pub signature_verification: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KickstartLiveImgOptions {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KickstartRebootOptions {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub eject: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KickstartRootPasswordOptions {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub lock: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KickstartClearPartOptions {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub all: bool,
    #[serde(rename = "initlabel", skip_serializing_if = "std::ops::Not::not")]
    pub init_label: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KickstartAutoPartOptions {
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub part_type: String,
    #[serde(rename = "fstype", skip_serializing_if = "String::is_empty")]
    pub fs_type: String,
    #[serde(rename = "nohome", skip_serializing_if = "std::ops::Not::not")]
    pub no_home: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KickstartNetworkOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activate: Option<bool>,
    #[serde(rename = "bootproto", skip_serializing_if = "String::is_empty")]
    pub boot_proto: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(rename = "onboot", skip_serializing_if = "String::is_empty")]
    pub on_boot: String,
}

pub fn new_kickstart_stage(options: &KickstartStageOptions) -> Stage {
    Stage::new("org.osbuild.kickstart", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct XorrisofsStageOptions {
    pub filename: String,
    #[serde(rename = "volid")]
    pub vol_id: String,
    #[serde(rename = "sysid", skip_serializing_if = "String::is_empty")]
    pub sys_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<XorrisofsBoot>,
    #[serde(rename = "efi", skip_serializing_if = "String::is_empty")]
    pub efi: String,
    #[serde(rename = "isohybridmbr", skip_serializing_if = "String::is_empty")]
    pub iso_hybrid_mbr: String,
    #[serde(rename = "grub2mbr", skip_serializing_if = "String::is_empty")]
    pub grub2_mbr: String,
    #[serde(rename = "isolevel", skip_serializing_if = "Option::is_none")]
    pub iso_level: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct XorrisofsBoot {
    pub image: String,
    pub catalog: String,
}

pub fn new_xorrisofs_stage(options: &XorrisofsStageOptions, input_pipeline: &str) -> Stage {
    Stage::new("org.osbuild.xorrisofs", options)
        .with_inputs(new_pipeline_tree_inputs("tree", input_pipeline))
}

pub fn new_implantisomd5_stage(filename: &str) -> Stage {
    Stage::new(
        "org.osbuild.implantisomd5",
        serde_json::json!({ "filename": filename }),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IsolinuxStageOptions {
    pub product: IsolinuxProduct,
    pub kernel: IsolinuxKernel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IsolinuxProduct {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IsolinuxKernel {
    pub dir: String,
    pub opts: Vec<String>,
}

pub fn new_isolinux_stage(options: &IsolinuxStageOptions, input_pipeline: &str) -> Stage {
    Stage::new("org.osbuild.isolinux", options)
        .with_inputs(new_pipeline_tree_inputs("data", input_pipeline))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GrubIsoStageOptions {
    pub product: IsolinuxProduct,
    pub kernel: GrubIsoKernel,
    #[serde(rename = "isolabel")]
    pub iso_label: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vendor: String,
    #[serde(rename = "fips", skip_serializing_if = "std::ops::Not::not")]
    pub fips: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GrubIsoKernel {
    pub dir: String,
    pub opts: Vec<String>,
}

pub fn new_grub2_iso_stage(options: &GrubIsoStageOptions) -> Stage {
    Stage::new("org.osbuild.grub2.iso", options)
}

pub fn new_grub2_iso_legacy_stage(options: &GrubIsoStageOptions) -> Stage {
    Stage::new("org.osbuild.grub2.iso.legacy", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscinfoStageOptions {
    #[serde(rename = "basearch")]
    pub base_arch: String,
    pub release: String,
}

pub fn new_discinfo_stage(options: &DiscinfoStageOptions) -> Stage {
    Stage::new("org.osbuild.discinfo", options)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TreeinfoStageOptions {
    pub product: String,
    pub version: String,
    #[serde(rename = "basearch")]
    pub base_arch: String,
    pub release: String,
}

pub fn new_treeinfo_stage(options: &TreeinfoStageOptions) -> Stage {
    Stage::new("org.osbuild.treeinfo", options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_stage_inputs() {
        let packages = vec![PackageSpec {
            name: "rpm".to_string(),
            checksum: "sha256:aabb".to_string(),
            remote_location: "https://example.com/rpm.rpm".to_string(),
            check_gpg: true,
            ..PackageSpec::default()
        }];
        let stage = new_rpm_stage(&RpmStageOptions::default(), &packages);
        assert_eq!(stage.stage_type, "org.osbuild.rpm");
        let inputs = stage.inputs.unwrap();
        let refs = &inputs["packages"].references;
        assert_eq!(refs[0]["id"], "sha256:aabb");
        assert_eq!(refs[0]["options"]["metadata"]["rpm.check_gpg"], true);
    }

    #[test]
    fn test_users_stage_omits_keys_for_ostree() {
        let users = vec![UserCustomization {
            name: "admin".to_string(),
            key: Some("ssh-ed25519 AAAA".to_string()),
            ..UserCustomization::default()
        }];
        let with_keys = new_users_stage(&users, false);
        let value = serde_json::to_value(&with_keys).unwrap();
        assert_eq!(value["options"]["users"]["admin"]["key"], "ssh-ed25519 AAAA");

        let sans_keys = new_users_stage(&users, true);
        let value = serde_json::to_value(&sans_keys).unwrap();
        assert!(value["options"]["users"]["admin"]["key"].is_null());
    }

    #[test]
    fn test_first_boot_commands_for_keys() {
        let users = vec![UserCustomization {
            name: "root".to_string(),
            key: Some("ssh-ed25519 AAAA".to_string()),
            ..UserCustomization::default()
        }];
        let options = users_first_boot_options(&users);
        assert!(options.commands[0].contains("/var/roothome/.ssh"));
        assert!(options
            .commands
            .iter()
            .any(|c| c.starts_with("restorecon -rvF /var/home")));
    }

    #[test]
    fn test_file_nodes_stages_address_by_hash() {
        let file = FileNode::new("/etc/motd", b"hi".to_vec()).unwrap();
        let stages = gen_file_nodes_stages(&[file]);
        assert_eq!(stages.len(), 1);
        let value = serde_json::to_value(&stages[0]).unwrap();
        let hash = content_hash(b"hi");
        assert_eq!(
            value["options"]["paths"][0]["from"],
            format!("input://file-{hash}/sha256:{hash}")
        );
        assert_eq!(value["options"]["paths"][0]["to"], "tree:///etc/motd");
    }

    #[test]
    fn test_truncate_stage_size_is_string() {
        let stage = new_truncate_stage("disk.img", 1024);
        let value = serde_json::to_value(&stage).unwrap();
        assert_eq!(value["options"]["size"], "1024");
    }

    #[test]
    fn test_tar_stage_shape() {
        let options = TarStageOptions {
            filename: "archive.tar".to_string(),
            format: TAR_FORMAT_OLDGNU.to_string(),
            root_node: TAR_ROOT_NODE_OMIT.to_string(),
            acls: Some(false),
            ..TarStageOptions::default()
        };
        let stage = new_tar_stage(&options, "image");
        let value = serde_json::to_value(&stage).unwrap();
        assert_eq!(value["type"], "org.osbuild.tar");
        assert_eq!(value["options"]["root-node"], "omit");
        assert_eq!(value["inputs"]["tree"]["references"][0], "name:image");
    }
}
