//! A manifest compiler for RPM-based distribution image builds.
//!
//! This crate turns a distribution definition, a target platform, and a
//! user blueprint into a declarative build plan: an ordered graph of named
//! pipelines containing stages, inputs, mounts, devices, and sources,
//! ready for execution by an external stage executor. It never executes
//! builds or fetches content itself.
//!
//! # Architecture
//!
//! ```text
//! distro registry ──▶ image-type composer (image::*)
//!                        │ declares
//!                        ▼
//!                     manifest::Manifest ── content_queries() ──▶ caller
//!                        │                                         │
//!                        │ ◀── ResolvedContent (solver results) ───┘
//!                        ▼
//!                     serialize() ──▶ osbuild::Document (version 2)
//! ```
//!
//! The three load-bearing subsystems:
//!
//! - [`disk`] - the typed partition-table tree and its planning algorithm
//! - [`manifest`] - the pipeline graph and its three-phase lifecycle
//! - [`image`] - composers assembling the graph per image kind
//!
//! All randomness (UUIDs, volume ids) is drawn from a caller-supplied rng;
//! for a fixed seed and fixed inputs the emitted manifest is byte-stable.

pub mod arch;
pub mod blueprint;
pub mod content;
pub mod datasizes;
pub mod disk;
pub mod distro;
pub mod fsnode;
pub mod image;
pub mod manifest;
pub mod osbuild;
pub mod pathpolicy;
pub mod platform;

pub use arch::Arch;
pub use blueprint::Blueprint;
pub use datasizes::Size;
pub use manifest::{ContentQueries, Manifest, ManifestConfig, ResolvedContent};

#[cfg(test)]
mod tests {
    use super::*;
    use content::ContainerSpec;
    use distro::{DistroRegistry, ImageOptions};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn bootc_resolved(manifest: &Manifest) -> ResolvedContent {
        let spec = ContainerSpec {
            source: "localhost/fake-cnt".to_string(),
            digest: "sha256:".to_string() + &"d".repeat(64),
            image_id: "sha256:".to_string() + &"i".repeat(64),
            local_name: "localhost/fake-cnt".to_string(),
            ..ContainerSpec::default()
        };
        let queries = manifest.content_queries();
        let mut containers = BTreeMap::new();
        for name in queries.containers.keys() {
            containers.insert(name.clone(), vec![spec.clone()]);
        }
        ResolvedContent {
            containers,
            ..ResolvedContent::default()
        }
    }

    fn bootc_qcow2_document() -> osbuild::Document {
        let registry = DistroRegistry::with_defaults();
        let distro = registry.lookup("bootc:localhost/fake-cnt").unwrap();
        let image_type = distro.image_type(Arch::X86_64, "qcow2").unwrap();
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        image_type
            .instantiate(
                &mut manifest,
                &Blueprint::default(),
                &ImageOptions::default(),
                &mut rng,
            )
            .unwrap();
        let resolved = bootc_resolved(&manifest);
        manifest.serialize(&resolved).unwrap()
    }

    #[test]
    fn test_bootc_disk_end_to_end() {
        let document = bootc_qcow2_document();
        assert_eq!(document.version, "2");
        let names: Vec<&str> = document.pipelines.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["build", "image", "qcow2"]);

        let stage_types = |name: &str| -> Vec<String> {
            document
                .pipelines
                .iter()
                .find(|p| p.name == name)
                .unwrap()
                .stages
                .iter()
                .map(|s| s.stage_type.clone())
                .collect()
        };
        let build_stages = stage_types("build");
        assert!(build_stages.contains(&"org.osbuild.container-deploy".to_string()));
        assert!(!build_stages.contains(&"org.osbuild.rpm".to_string()));
        let image_stages = stage_types("image");
        assert!(image_stages.contains(&"org.osbuild.bootc.install-to-filesystem".to_string()));
    }

    #[test]
    fn test_manifest_serialization_is_deterministic() {
        let first = serde_json::to_vec(&bootc_qcow2_document()).unwrap();
        let second = serde_json::to_vec(&bootc_qcow2_document()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_pipeline_name_references_resolve() {
        let document = bootc_qcow2_document();
        let names: Vec<String> = document
            .pipelines
            .iter()
            .map(|p| p.name.clone())
            .collect();

        // every name: reference in any input or build link must point to a
        // pipeline in the same manifest
        fn collect_name_refs(value: &serde_json::Value, refs: &mut Vec<String>) {
            match value {
                serde_json::Value::String(text) => {
                    if let Some(name) = text.strip_prefix("name:") {
                        refs.push(name.to_string());
                    }
                }
                serde_json::Value::Array(items) => {
                    for item in items {
                        collect_name_refs(item, refs);
                    }
                }
                serde_json::Value::Object(map) => {
                    for (key, item) in map {
                        if let Some(name) = key.strip_prefix("name:") {
                            refs.push(name.to_string());
                        }
                        collect_name_refs(item, refs);
                    }
                }
                _ => {}
            }
        }

        let mut refs = Vec::new();
        for pipeline in &document.pipelines {
            if let Some(build) = &pipeline.build {
                refs.push(build.trim_start_matches("name:").to_string());
            }
            for stage in &pipeline.stages {
                if let Some(inputs) = &stage.inputs {
                    let value = serde_json::to_value(inputs).unwrap();
                    collect_name_refs(&value, &mut refs);
                }
            }
        }
        assert!(!refs.is_empty());
        for reference in refs {
            assert!(names.contains(&reference), "dangling reference {reference:?}");
        }
    }

    #[test]
    fn test_bootc_disallowed_file_exact_message() {
        let registry = DistroRegistry::with_defaults();
        let distro = registry.lookup("bootc:localhost/fake-cnt").unwrap();
        let image_type = distro.image_type(Arch::X86_64, "qcow2").unwrap();
        let blueprint = Blueprint::from_toml(
            r#"
            [[customizations.files]]
            path = "/not/allowed"
            "#,
        )
        .unwrap();
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        let err = image_type
            .instantiate(&mut manifest, &blueprint, &ImageOptions::default(), &mut rng)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "the following custom files are not allowed: [\"/not/allowed\"]"
        );
    }

    #[test]
    fn test_inline_sources_are_content_addressed() {
        // a pxe tree carries inline files (grub.cfg, README); the source
        // ids referenced by its stages must be the sha256 of the content
        let image = image::PxeTreeImage {
            packages: vec!["@core".to_string()],
            runner: "org.osbuild.fedora40".to_string(),
            os_tree_ref: "fedora/x86_64/iot".to_string(),
            filename: "pxe.tar".to_string(),
            customizations: manifest::OsCustomizations {
                kernel_name: "kernel".to_string(),
                kernel_options_append: vec!["console=ttyS0".to_string()],
                ..manifest::OsCustomizations::default()
            },
            ..image::PxeTreeImage::default()
        };
        let mut manifest_graph = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        image.instantiate(&mut manifest_graph, &mut rng).unwrap();

        let kernel = content::PackageSpec {
            name: "kernel".to_string(),
            version: "6.8.0".to_string(),
            release: "100.fc40".to_string(),
            arch: "x86_64".to_string(),
            remote_location: "https://example.com/kernel.rpm".to_string(),
            checksum: format!("sha256:{}", "k".repeat(64)),
            ..content::PackageSpec::default()
        };
        let queries = manifest_graph.content_queries();
        let mut packages = BTreeMap::new();
        for name in queries.packages.keys() {
            packages.insert(name.clone(), vec![kernel.clone()]);
        }
        let resolved = ResolvedContent {
            packages,
            ..ResolvedContent::default()
        };
        let document = manifest_graph.serialize(&resolved).unwrap();

        // the depsolved kernel version propagated into the pxe copy paths
        let pxe = document
            .pipelines
            .iter()
            .find(|p| p.name == "pxe-tree")
            .unwrap();
        let copy = serde_json::to_value(&pxe.stages[0]).unwrap();
        assert!(copy["options"]["paths"][0]["from"]
            .as_str()
            .unwrap()
            .ends_with("vmlinuz-6.8.0-100.fc40.x86_64"));

        let inline = &document.sources["org.osbuild.inline"]["items"];
        let items = inline.as_object().unwrap();
        assert!(!items.is_empty());
        for key in items.keys() {
            assert!(key.starts_with("sha256:"));
            assert_eq!(key.len(), "sha256:".len() + 64);
        }

        // every inline source is referenced by some stage
        let document_value = serde_json::to_value(&document).unwrap();
        let text = document_value.to_string();
        for key in items.keys() {
            assert!(text.match_indices(key.as_str()).count() >= 2, "{key} unreferenced");
        }
    }

    #[test]
    fn test_serialize_releases_inputs_for_reuse() {
        // serialize must release resolved content on all exit paths, so a
        // second serialization of the same manifest works and matches
        let registry = DistroRegistry::with_defaults();
        let distro = registry.lookup("bootc:localhost/fake-cnt").unwrap();
        let image_type = distro.image_type(Arch::X86_64, "qcow2").unwrap();
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        image_type
            .instantiate(
                &mut manifest,
                &Blueprint::default(),
                &ImageOptions::default(),
                &mut rng,
            )
            .unwrap();
        let resolved = bootc_resolved(&manifest);
        let first = manifest.serialize(&resolved).unwrap();
        let second = manifest.serialize(&resolved).unwrap();
        assert_eq!(first, second);
    }
}
