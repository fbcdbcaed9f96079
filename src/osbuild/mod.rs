//! Wire types for the emitted manifest document.
//!
//! Everything in this module serializes to the exact JSON the downstream
//! stage executor consumes: stage type strings are a bit-exact contract
//! (`org.osbuild.<name>`), and stage options are passed through verbatim.
//! Objects serialize in struct-declaration order; content-addressed maps
//! (sources, inputs, devices) use sorted keys. That combination is the
//! stable output order.

mod disk_stages;
mod stages;

pub use disk_stages::*;
pub use stages::*;

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::content::{ContainerSpec, OstreeCommitSpec, PackageSpec};

/// The top-level manifest document (format version 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub version: String,
    pub pipelines: Vec<Pipeline>,
    pub sources: Sources,
}

/// One pipeline in the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    /// Reference to the build pipeline, in `name:<pipeline>` form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    /// Runner binary, build pipelines only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
    #[serde(default, rename = "source-epoch", skip_serializing_if = "Option::is_none")]
    pub source_epoch: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(name: &str) -> Self {
        Pipeline {
            name: name.to_string(),
            ..Pipeline::default()
        }
    }

    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn add_stages(&mut self, stages: Vec<Stage>) {
        self.stages.extend(stages);
    }
}

/// A single declarative action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(rename = "type")]
    pub stage_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Devices>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<Mount>>,
}

impl Stage {
    /// Build a stage from typed options. The options are serialized
    /// immediately; the resulting value is the wire contract.
    pub fn new(stage_type: &str, options: impl Serialize) -> Stage {
        let value = serde_json::to_value(options).expect("stage options serialization cannot fail");
        let options = match &value {
            serde_json::Value::Null => None,
            serde_json::Value::Object(map) if map.is_empty() => None,
            _ => Some(value),
        };
        Stage {
            stage_type: stage_type.to_string(),
            inputs: None,
            options,
            devices: None,
            mounts: None,
        }
    }

    pub fn without_options(stage_type: &str) -> Stage {
        Stage {
            stage_type: stage_type.to_string(),
            inputs: None,
            options: None,
            devices: None,
            mounts: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Inputs) -> Stage {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_devices(mut self, devices: Devices) -> Stage {
        self.devices = Some(devices);
        self
    }

    pub fn with_mounts(mut self, mounts: Vec<Mount>) -> Stage {
        self.mounts = Some(mounts);
        self
    }
}

// ── Inputs ──────────────────────────────────────────────────────────────────

pub type Inputs = BTreeMap<String, Input>;

/// A named stage input: a reference to sources or other pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(rename = "type")]
    pub input_type: String,
    pub origin: String,
    pub references: serde_json::Value,
}

pub const INPUT_TYPE_TREE: &str = "org.osbuild.tree";
pub const INPUT_TYPE_FILES: &str = "org.osbuild.files";
pub const INPUT_TYPE_CONTAINERS: &str = "org.osbuild.containers";
pub const INPUT_TYPE_OSTREE: &str = "org.osbuild.ostree";

pub const INPUT_ORIGIN_PIPELINE: &str = "org.osbuild.pipeline";
pub const INPUT_ORIGIN_SOURCE: &str = "org.osbuild.source";

/// A tree input referencing another pipeline by name.
pub fn new_tree_input(pipeline: &str) -> Input {
    Input {
        input_type: INPUT_TYPE_TREE.to_string(),
        origin: INPUT_ORIGIN_PIPELINE.to_string(),
        references: serde_json::json!([format!("name:{pipeline}")]),
    }
}

/// The conventional single `tree` input map.
pub fn new_pipeline_tree_inputs(name: &str, pipeline: &str) -> Inputs {
    BTreeMap::from([(name.to_string(), new_tree_input(pipeline))])
}

/// A file input referencing one artifact of a file pipeline.
pub fn new_file_input_for_pipeline(pipeline: &str, file: &str) -> Input {
    Input {
        input_type: INPUT_TYPE_FILES.to_string(),
        origin: INPUT_ORIGIN_PIPELINE.to_string(),
        references: serde_json::json!({
            format!("name:{pipeline}"): { "file": file }
        }),
    }
}

/// A files input referencing resolved packages by content address.
pub fn new_rpms_input(packages: &[PackageSpec]) -> Input {
    let references: Vec<serde_json::Value> = packages
        .iter()
        .map(|package| {
            let mut options = serde_json::Map::new();
            if package.check_gpg {
                options.insert(
                    "metadata".to_string(),
                    serde_json::json!({"rpm.check_gpg": true}),
                );
            }
            if options.is_empty() {
                serde_json::json!({"id": package.checksum})
            } else {
                serde_json::json!({"id": package.checksum, "options": options})
            }
        })
        .collect();
    Input {
        input_type: INPUT_TYPE_FILES.to_string(),
        origin: INPUT_ORIGIN_SOURCE.to_string(),
        references: serde_json::Value::Array(references),
    }
}

/// A files input referencing one inline blob by content address.
pub fn new_files_input_for_inline(content_address: &str) -> Input {
    Input {
        input_type: INPUT_TYPE_FILES.to_string(),
        origin: INPUT_ORIGIN_SOURCE.to_string(),
        references: serde_json::json!({ format!("sha256:{content_address}"): {} }),
    }
}

/// A containers input for a single resolved container image.
pub fn new_containers_input(container: &ContainerSpec) -> Input {
    if container.local_storage {
        Input {
            input_type: "org.osbuild.containers-storage".to_string(),
            origin: INPUT_ORIGIN_SOURCE.to_string(),
            references: serde_json::json!({
                container.image_id.clone(): { "name": container.local_name }
            }),
        }
    } else {
        Input {
            input_type: INPUT_TYPE_CONTAINERS.to_string(),
            origin: INPUT_ORIGIN_SOURCE.to_string(),
            references: serde_json::json!({
                container.image_id.clone(): { "name": container.local_name }
            }),
        }
    }
}

/// An ostree input referencing a resolved commit.
pub fn new_ostree_commit_input(commit: &OstreeCommitSpec) -> Input {
    Input {
        input_type: INPUT_TYPE_OSTREE.to_string(),
        origin: INPUT_ORIGIN_SOURCE.to_string(),
        references: serde_json::json!({
            commit.checksum.clone(): { "ref": commit.reference }
        }),
    }
}

// ── Devices ─────────────────────────────────────────────────────────────────

pub type Devices = BTreeMap<String, Device>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub options: serde_json::Value,
}

/// A loopback device over a byte range of an image file.
pub fn new_loopback_device(filename: &str, start: u64, size: u64) -> Device {
    Device {
        device_type: "org.osbuild.loopback".to_string(),
        parent: None,
        options: serde_json::json!({
            "filename": filename,
            "start": start,
            "size": size,
            "lock": true,
        }),
    }
}

/// An opened LUKS container on a parent device.
pub fn new_luks_device(parent: &str, passphrase: &str) -> Device {
    Device {
        device_type: "org.osbuild.luks2".to_string(),
        parent: Some(parent.to_string()),
        options: serde_json::json!({ "passphrase": passphrase }),
    }
}

/// An activated logical volume on a parent device.
pub fn new_lvm_lv_device(parent: &str, volume: &str) -> Device {
    Device {
        device_type: "org.osbuild.lvm2.lv".to_string(),
        parent: Some(parent.to_string()),
        options: serde_json::json!({ "volume": volume }),
    }
}

// ── Mounts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// A filesystem mount of a device.
pub fn new_fs_mount(fs_type: &str, name: &str, source: &str, target: &str) -> Mount {
    Mount {
        name: name.to_string(),
        mount_type: format!("org.osbuild.{fs_type}"),
        source: Some(source.to_string()),
        target: Some(target.to_string()),
        options: None,
    }
}

/// A btrfs subvolume mount.
pub fn new_btrfs_mount(name: &str, source: &str, target: &str, subvol: &str) -> Mount {
    Mount {
        name: name.to_string(),
        mount_type: "org.osbuild.btrfs".to_string(),
        source: Some(source.to_string()),
        target: Some(target.to_string()),
        options: Some(serde_json::json!({ "subvol": subvol })),
    }
}

/// The deployed ostree root inside an already-mounted tree.
pub fn new_ostree_deployment_mount_default(name: &str) -> Mount {
    Mount {
        name: name.to_string(),
        mount_type: "org.osbuild.ostree.deployment".to_string(),
        source: None,
        target: None,
        options: Some(serde_json::json!({
            "source": "mount",
            "deployment": { "default": true },
        })),
    }
}

/// Bind one mount tree onto another.
pub fn new_bind_mount(name: &str, source: &str, target: &str) -> Mount {
    Mount {
        name: name.to_string(),
        mount_type: "org.osbuild.bind".to_string(),
        source: None,
        target: Some(target.to_string()),
        options: Some(serde_json::json!({ "source": source })),
    }
}

// ── Sources ─────────────────────────────────────────────────────────────────

/// The sources section, keyed by source type.
pub type Sources = BTreeMap<String, serde_json::Value>;

/// Hex sha256 of a blob; the content address used for inline data.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Standard base64 with padding; the encoding used by inline sources.
fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Assemble the sources section from all resolved content and inline data.
pub fn gen_sources(
    packages: &[PackageSpec],
    commits: &[OstreeCommitSpec],
    inline_data: &[String],
    containers: &[ContainerSpec],
) -> Result<Sources> {
    let mut sources = Sources::new();

    if !packages.is_empty() {
        let mut items: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for package in packages {
            items.insert(
                package.checksum.clone(),
                serde_json::json!({ "url": package.remote_location }),
            );
        }
        sources.insert(
            "org.osbuild.curl".to_string(),
            serde_json::json!({ "items": items }),
        );
    }

    if !commits.is_empty() {
        let mut items: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for commit in commits {
            items.insert(
                commit.checksum.clone(),
                serde_json::json!({ "remote": { "url": commit.url } }),
            );
        }
        sources.insert(
            "org.osbuild.ostree".to_string(),
            serde_json::json!({ "items": items }),
        );
    }

    if !inline_data.is_empty() {
        let mut items: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for data in inline_data {
            let address = format!("sha256:{}", content_hash(data.as_bytes()));
            items.insert(
                address,
                serde_json::json!({
                    "encoding": "base64",
                    "data": base64_encode(data.as_bytes()),
                }),
            );
        }
        sources.insert(
            "org.osbuild.inline".to_string(),
            serde_json::json!({ "items": items }),
        );
    }

    if !containers.is_empty() {
        let mut skopeo: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut skopeo_index: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut local: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for container in containers {
            if container.local_storage {
                local.insert(container.image_id.clone(), serde_json::json!({}));
                continue;
            }
            let mut image = serde_json::Map::new();
            image.insert("name".to_string(), serde_json::json!(container.source));
            image.insert("digest".to_string(), serde_json::json!(container.digest));
            if let Some(tls_verify) = container.tls_verify {
                image.insert("tls-verify".to_string(), serde_json::json!(tls_verify));
            }
            skopeo.insert(
                container.image_id.clone(),
                serde_json::json!({ "image": image }),
            );
            if let Some(list_digest) = &container.list_digest {
                skopeo_index.insert(
                    container.source.clone(),
                    serde_json::json!({ "image": { "digest": list_digest } }),
                );
            }
        }
        if !skopeo.is_empty() {
            sources.insert(
                "org.osbuild.skopeo".to_string(),
                serde_json::json!({ "items": skopeo }),
            );
        }
        if !skopeo_index.is_empty() {
            sources.insert(
                "org.osbuild.skopeo-index".to_string(),
                serde_json::json!({ "items": skopeo_index }),
            );
        }
        if !local.is_empty() {
            sources.insert(
                "org.osbuild.containers-storage".to_string(),
                serde_json::json!({ "items": local }),
            );
        }
    }

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wire_shape() {
        let stage = Stage::new(
            "org.osbuild.squashfs",
            serde_json::json!({"filename": "disk.img", "compression": {"method": "xz"}}),
        )
        .with_inputs(new_pipeline_tree_inputs("tree", "input-pipeline"));
        let value = serde_json::to_value(&stage).unwrap();
        assert_eq!(value["type"], "org.osbuild.squashfs");
        assert_eq!(
            value["inputs"]["tree"]["references"][0],
            "name:input-pipeline"
        );
        assert_eq!(value["options"]["filename"], "disk.img");
    }

    #[test]
    fn test_empty_options_are_omitted() {
        let stage = Stage::new("org.osbuild.selinux", serde_json::json!({}));
        assert!(stage.options.is_none());
        let json = serde_json::to_string(&stage).unwrap();
        assert!(!json.contains("options"));
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_base64_encode() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg==");
        assert_eq!(base64_encode(b"fo"), "Zm8=");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        assert_eq!(base64_encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn test_gen_sources_inline_addressing() {
        let data = vec!["hello".to_string()];
        let sources = gen_sources(&[], &[], &data, &[]).unwrap();
        let inline = &sources["org.osbuild.inline"];
        let expected_key = format!("sha256:{}", content_hash(b"hello"));
        assert!(inline["items"][&expected_key].is_object());
    }

    #[test]
    fn test_gen_sources_skopeo() {
        let container = ContainerSpec {
            source: "quay.io/fake/fake".to_string(),
            digest: "sha256:aaaa".to_string(),
            image_id: "sha256:bbbb".to_string(),
            local_name: "quay.io/fake/fake".to_string(),
            ..ContainerSpec::default()
        };
        let sources = gen_sources(&[], &[], &[], &[container]).unwrap();
        assert!(sources.contains_key("org.osbuild.skopeo"));
        assert!(!sources.contains_key("org.osbuild.containers-storage"));
    }
}
