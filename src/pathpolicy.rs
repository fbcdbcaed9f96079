//! Path policies for user-supplied mountpoints, files, and directories.
//!
//! A policy set is a prefix tree over absolute paths. Checking a path finds
//! the deepest configured ancestor and applies its rule: `deny` rejects the
//! whole subtree, `exact` allows only the configured path itself.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use anyhow::{bail, Result};

/// Rule attached to a path prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathPolicy {
    /// Paths at or below this prefix are rejected.
    pub deny: bool,
    /// Only this exact path is allowed, not its descendants.
    pub exact: bool,
}

#[derive(Debug, Default)]
struct PathTrieNode {
    policy: Option<PathPolicy>,
    children: BTreeMap<String, PathTrieNode>,
}

/// A set of path policies checked by longest-prefix match.
#[derive(Debug, Default)]
pub struct PathPolicies {
    root: PathTrieNode,
}

fn path_components(path: &Path) -> Result<Vec<String>> {
    if !path.is_absolute() {
        bail!("path {:?} must be absolute", path);
    }
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => bail!("path {:?} must be canonical", path),
        }
    }
    Ok(parts)
}

impl PathPolicies {
    pub fn new(entries: &[(&str, PathPolicy)]) -> Self {
        let mut policies = PathPolicies::default();
        for (path, policy) in entries {
            let parts =
                path_components(Path::new(path)).expect("policy table path must be canonical");
            let mut node = &mut policies.root;
            for part in parts {
                node = node.children.entry(part).or_default();
            }
            node.policy = Some(*policy);
        }
        assert!(
            policies.root.policy.is_some(),
            "policy table must cover the root path"
        );
        policies
    }

    /// Check `path` against the policies.
    pub fn check(&self, path: &Path) -> Result<()> {
        let parts = path_components(path)?;

        // walk to the deepest node that carries a policy
        let mut node = &self.root;
        let mut policy = self.root.policy.expect("root policy always present");
        let mut matched_depth = 0;
        for (depth, part) in parts.iter().enumerate() {
            match node.children.get(part) {
                Some(child) => {
                    node = child;
                    if let Some(p) = child.policy {
                        policy = p;
                        matched_depth = depth + 1;
                    }
                }
                None => break,
            }
        }

        if policy.deny {
            bail!("path {:?} is not allowed", path.display().to_string());
        }
        if policy.exact && matched_depth != parts.len() {
            bail!(
                "path {:?} must match the policy path exactly",
                path.display().to_string()
            );
        }
        Ok(())
    }
}

/// Mountpoint rules for filesystem customizations.
pub fn mountpoint_policies() -> PathPolicies {
    PathPolicies::new(&[
        ("/", PathPolicy::default()),
        // /etc must be on the root filesystem
        ("/etc", PathPolicy { deny: true, exact: false }),
        // mountpoints under /usr are not visible to the fstab generator in
        // the initramfs before switch-root
        ("/usr", PathPolicy { deny: false, exact: true }),
        // API filesystems
        ("/sys", PathPolicy { deny: true, exact: false }),
        ("/proc", PathPolicy { deny: true, exact: false }),
        ("/dev", PathPolicy { deny: true, exact: false }),
        ("/run", PathPolicy { deny: true, exact: false }),
        // merged-usr symlinks
        ("/bin", PathPolicy { deny: true, exact: false }),
        ("/sbin", PathPolicy { deny: true, exact: false }),
        ("/lib", PathPolicy { deny: true, exact: false }),
        ("/lib64", PathPolicy { deny: true, exact: false }),
        ("/lost+found", PathPolicy { deny: true, exact: false }),
        ("/sysroot", PathPolicy { deny: true, exact: false }),
        // symlinks into /run which is on tmpfs
        ("/var/run", PathPolicy { deny: true, exact: false }),
        ("/var/lock", PathPolicy { deny: true, exact: false }),
    ])
}

/// Rules for custom files from the blueprint.
pub fn custom_files_policies() -> PathPolicies {
    PathPolicies::new(&[
        ("/", PathPolicy::default()),
        ("/bin", PathPolicy { deny: true, exact: false }),
        ("/boot", PathPolicy { deny: true, exact: false }),
        ("/dev", PathPolicy { deny: true, exact: false }),
        ("/efi", PathPolicy { deny: true, exact: false }),
        ("/etc/fstab", PathPolicy { deny: true, exact: false }),
        ("/etc/group", PathPolicy { deny: true, exact: false }),
        ("/etc/passwd", PathPolicy { deny: true, exact: false }),
        ("/etc/shadow", PathPolicy { deny: true, exact: false }),
        ("/lib", PathPolicy { deny: true, exact: false }),
        ("/lib64", PathPolicy { deny: true, exact: false }),
        ("/lost+found", PathPolicy { deny: true, exact: false }),
        ("/proc", PathPolicy { deny: true, exact: false }),
        ("/run", PathPolicy { deny: true, exact: false }),
        ("/sbin", PathPolicy { deny: true, exact: false }),
        ("/sys", PathPolicy { deny: true, exact: false }),
        ("/sysroot", PathPolicy { deny: true, exact: false }),
        ("/tmp", PathPolicy { deny: true, exact: false }),
        ("/usr", PathPolicy { deny: true, exact: false }),
        ("/usr/local", PathPolicy::default()),
        ("/var/run", PathPolicy { deny: true, exact: false }),
        ("/var/tmp", PathPolicy { deny: true, exact: false }),
    ])
}

/// Rules for custom directories from the blueprint.
pub fn custom_directories_policies() -> PathPolicies {
    PathPolicies::new(&[
        ("/", PathPolicy::default()),
        ("/bin", PathPolicy { deny: true, exact: false }),
        ("/boot", PathPolicy { deny: true, exact: false }),
        ("/dev", PathPolicy { deny: true, exact: false }),
        ("/efi", PathPolicy { deny: true, exact: false }),
        ("/lib", PathPolicy { deny: true, exact: false }),
        ("/lib64", PathPolicy { deny: true, exact: false }),
        ("/lost+found", PathPolicy { deny: true, exact: false }),
        ("/proc", PathPolicy { deny: true, exact: false }),
        ("/run", PathPolicy { deny: true, exact: false }),
        ("/sbin", PathPolicy { deny: true, exact: false }),
        ("/sys", PathPolicy { deny: true, exact: false }),
        ("/sysroot", PathPolicy { deny: true, exact: false }),
        ("/tmp", PathPolicy { deny: true, exact: false }),
        ("/usr", PathPolicy { deny: true, exact: false }),
        ("/usr/local", PathPolicy::default()),
        ("/var/run", PathPolicy { deny: true, exact: false }),
        ("/var/tmp", PathPolicy { deny: true, exact: false }),
    ])
}

/// Mountpoint rules for OSTree-based images, where most of the classic
/// hierarchy is symlinks into /var or /sysroot.
pub fn ostree_mountpoint_policies() -> PathPolicies {
    PathPolicies::new(&[
        ("/", PathPolicy::default()),
        ("/home", PathPolicy { deny: true, exact: false }),
        ("/mnt", PathPolicy { deny: true, exact: false }),
        ("/opt", PathPolicy { deny: true, exact: false }),
        ("/ostree", PathPolicy { deny: true, exact: false }),
        ("/root", PathPolicy { deny: true, exact: false }),
        ("/srv", PathPolicy { deny: true, exact: false }),
        ("/var/home", PathPolicy { deny: true, exact: false }),
        ("/var/mnt", PathPolicy { deny: true, exact: false }),
        ("/var/opt", PathPolicy { deny: true, exact: false }),
        ("/var/roothome", PathPolicy { deny: true, exact: false }),
        ("/var/srv", PathPolicy { deny: true, exact: false }),
        ("/var/usrlocal", PathPolicy { deny: true, exact: false }),
    ])
}

/// Rules for custom files in OSTree-based images: only a few writable
/// locations exist, everything else is rejected.
pub fn ostree_custom_files_policies() -> PathPolicies {
    PathPolicies::new(&[
        ("/", PathPolicy { deny: true, exact: false }),
        ("/etc", PathPolicy::default()),
        ("/root", PathPolicy::default()),
        ("/usr/local/bin", PathPolicy::default()),
        ("/usr/local/sbin", PathPolicy::default()),
        ("/etc/fstab", PathPolicy { deny: true, exact: false }),
        ("/etc/shadow", PathPolicy { deny: true, exact: false }),
        ("/etc/passwd", PathPolicy { deny: true, exact: false }),
        ("/etc/group", PathPolicy { deny: true, exact: false }),
    ])
}

/// Rules for custom directories in OSTree-based images.
pub fn ostree_custom_directories_policies() -> PathPolicies {
    PathPolicies::new(&[
        ("/", PathPolicy { deny: true, exact: false }),
        ("/etc", PathPolicy::default()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mountpoint_policies() {
        let policies = mountpoint_policies();
        let cases = [
            ("/", true),
            ("/bin", false),
            ("/dev", false),
            ("/etc", false),
            ("/lost+found", false),
            ("/mnt", true),
            ("/custom", true),
            ("/custom/dir", true),
            ("/boot", true),
            ("/var", true),
            ("/var/lib", true),
            ("/var/run", false),
            ("/var/lock", false),
            ("/usr", true),
            ("/usr/bin", false),
            ("/usr/local", false),
            ("/home/user", true),
        ];
        for (path, allowed) in cases {
            let result = policies.check(Path::new(path));
            assert_eq!(result.is_ok(), allowed, "{path}: {result:?}");
        }
    }

    #[test]
    fn test_custom_files_policies() {
        let policies = custom_files_policies();
        assert!(policies.check(Path::new("/etc/motd")).is_ok());
        assert!(policies.check(Path::new("/usr/local/bin/tool")).is_ok());
        assert!(policies.check(Path::new("/etc/passwd")).is_err());
        assert!(policies.check(Path::new("/boot/vmlinuz")).is_err());
        assert!(policies.check(Path::new("/not/allowed")).is_ok());
    }

    #[test]
    fn test_ostree_custom_files_policies() {
        let policies = ostree_custom_files_policies();
        assert!(policies.check(Path::new("/etc/motd")).is_ok());
        assert!(policies.check(Path::new("/usr/local/bin/tool")).is_ok());
        assert!(policies.check(Path::new("/not/allowed")).is_err());
        assert!(policies.check(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_ostree_policies() {
        let policies = ostree_mountpoint_policies();
        assert!(policies.check(Path::new("/foo/bar")).is_ok());
        assert!(policies.check(Path::new("/var/myfiles")).is_ok());
        assert!(policies.check(Path::new("/var/roothome")).is_err());
        assert!(policies.check(Path::new("/home/shadowman")).is_err());
    }

    #[test]
    fn test_relative_path_rejected() {
        let policies = mountpoint_policies();
        assert!(policies.check(Path::new("relative/path")).is_err());
    }
}
