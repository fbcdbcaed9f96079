//! Boundary types exchanged with the external content resolvers.
//!
//! The compiler never resolves content itself. It declares what it needs
//! (package sets, container sources, OSTree sources) and accepts the
//! resolved results (package specs with checksums, container specs with
//! digests, commit specs) back from the caller. These are the value types
//! that cross that boundary in both directions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── RPM packages ────────────────────────────────────────────────────────────

/// A single RPM repository made available to the solver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub base_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metalink: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpg_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_gpg: Option<bool>,
}

/// A package request handed to the solver: include/exclude lists against a
/// set of repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSet {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepoConfig>,
    #[serde(default)]
    pub install_weak_deps: bool,
}

impl PackageSet {
    pub fn append(&mut self, other: PackageSet) {
        self.include.extend(other.include);
        self.exclude.extend(other.exclude);
    }
}

/// A depsolved package, pinned to a location and checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    #[serde(default)]
    pub epoch: u64,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub remote_location: String,
    /// Content address in `<algorithm>:<hex>` form.
    pub checksum: String,
    #[serde(default)]
    pub check_gpg: bool,
}

// ── Containers ──────────────────────────────────────────────────────────────

/// A container image reference as requested by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSourceSpec {
    /// Registry reference, e.g. `quay.io/fedora/fedora:latest`.
    pub source: String,
    /// Name to use inside the image; defaults to the source reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
    /// Resolve from the host's local container storage instead of a registry.
    #[serde(default)]
    pub local: bool,
}

/// A resolved container image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub source: String,
    /// Manifest digest (`sha256:…`) of the resolved image.
    pub digest: String,
    /// Container image identifier.
    pub image_id: String,
    /// Name under which the image is stored in the tree.
    pub local_name: String,
    /// Digest of the manifest list, if the source resolved through one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_digest: Option<String>,
    #[serde(default)]
    pub local_storage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
}

// ── OSTree commits ──────────────────────────────────────────────────────────

/// An OSTree ref + repository to resolve a commit from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OstreeSourceSpec {
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

/// A resolved OSTree commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OstreeCommitSpec {
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: String,
    /// Commit ID (checksum) of the resolved ref.
    pub checksum: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_set_append() {
        let mut a = PackageSet {
            include: vec!["rpm".into()],
            exclude: vec!["nano".into()],
            ..Default::default()
        };
        a.append(PackageSet {
            include: vec!["vim".into()],
            ..Default::default()
        });
        assert_eq!(a.include, vec!["rpm".to_string(), "vim".to_string()]);
        assert_eq!(a.exclude, vec!["nano".to_string()]);
    }

    #[test]
    fn test_ostree_ref_field_name() {
        let spec = OstreeSourceSpec {
            url: "https://example.com/repo".into(),
            reference: "fedora/x86_64/iot".into(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ref"], "fedora/x86_64/iot");
    }
}
