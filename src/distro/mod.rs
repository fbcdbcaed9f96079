//! The distro registry: mapping distro id strings to image-type factories.
//!
//! Distribution data (package-set tables, image-type definitions, partition
//! templates) lives outside the core; this module defines the interface the
//! core consumes plus the built-in `bootc:` pseudo-distro, whose content
//! comes entirely from the container image being installed.

mod bootc;

pub use bootc::BootcDistro;

use anyhow::Result;
use rand::RngCore;

use crate::arch::Arch;
use crate::blueprint::Blueprint;
use crate::image::Artifact;
use crate::manifest::Manifest;

/// Caller-supplied options that are not part of the blueprint.
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    /// Requested image size in bytes; zero uses the image type's default.
    pub size: u64,
}

/// One buildable image kind of a distro on one architecture.
pub trait ImageType {
    fn name(&self) -> &str;
    /// Static metadata available without building a manifest.
    fn filename(&self) -> &str;
    fn mime_type(&self) -> Option<&str>;
    /// Pipeline names exported by manifests of this type.
    fn exports(&self) -> Vec<String>;
    /// Declare the pipeline graph for this image into `manifest`.
    fn instantiate(
        &self,
        manifest: &mut Manifest,
        blueprint: &Blueprint,
        options: &ImageOptions,
        rng: &mut dyn RngCore,
    ) -> Result<Artifact>;
}

/// A distribution definition.
pub trait Distro {
    fn name(&self) -> &str;
    fn codename(&self) -> &str;
    fn release_version(&self) -> &str;
    fn arches(&self) -> Vec<Arch>;
    fn image_types(&self, arch: Arch) -> Vec<String>;
    fn image_type(&self, arch: Arch, name: &str) -> Option<Box<dyn ImageType>>;
}

/// A factory claims distro id strings and produces distros for them.
pub type DistroFactory = fn(&str) -> Option<Box<dyn Distro>>;

/// The process-wide distro lookup table, populated once at startup.
pub struct DistroRegistry {
    factories: Vec<DistroFactory>,
}

impl DistroRegistry {
    pub fn new(factories: Vec<DistroFactory>) -> Self {
        DistroRegistry { factories }
    }

    /// A registry with the built-in factories.
    pub fn with_defaults() -> Self {
        DistroRegistry::new(vec![bootc::factory])
    }

    pub fn register(&mut self, factory: DistroFactory) {
        self.factories.push(factory);
    }

    /// Find the distro for an id string, first factory wins.
    pub fn lookup(&self, id: &str) -> Option<Box<dyn Distro>> {
        self.factories.iter().find_map(|factory| factory(id))
    }
}
