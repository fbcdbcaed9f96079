//! Custom filesystem nodes placed into the image tree.
//!
//! Blueprints can request extra files and directories. Files carry their
//! content as bytes; during manifest serialization the content becomes an
//! inline source addressed by its sha256.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Owner of a filesystem node, either by name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeOwner {
    Name(String),
    Id(u32),
}

/// A regular file to create in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    path: PathBuf,
    pub mode: Option<u32>,
    pub user: Option<NodeOwner>,
    pub group: Option<NodeOwner>,
    data: Vec<u8>,
}

/// A directory to create in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    path: PathBuf,
    pub mode: Option<u32>,
    pub user: Option<NodeOwner>,
    pub group: Option<NodeOwner>,
    /// Create missing parent directories with default ownership.
    pub ensure_parent_dirs: bool,
}

fn validate_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        bail!("path {:?} must be absolute", path);
    }
    for component in path.components() {
        match component {
            Component::RootDir | Component::Normal(_) => {}
            _ => bail!("path {:?} must be canonical", path),
        }
    }
    if path == Path::new("/") {
        bail!("path {:?} must not be the root", path);
    }
    Ok(())
}

impl FileNode {
    pub fn new(path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(FileNode {
            path,
            mode: None,
            user: None,
            group: None,
            data: data.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl DirectoryNode {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(DirectoryNode {
            path,
            mode: None,
            user: None,
            group: None,
            ensure_parent_dirs: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_node_requires_absolute_canonical_path() {
        assert!(FileNode::new("/etc/motd", b"hello".to_vec()).is_ok());
        assert!(FileNode::new("etc/motd", b"".to_vec()).is_err());
        assert!(FileNode::new("/etc/../motd", b"".to_vec()).is_err());
        assert!(FileNode::new("/", b"".to_vec()).is_err());
    }

    #[test]
    fn test_directory_node() {
        let d = DirectoryNode::new("/var/lib/custom").unwrap();
        assert_eq!(d.path(), Path::new("/var/lib/custom"));
        assert!(DirectoryNode::new("relative").is_err());
    }
}
