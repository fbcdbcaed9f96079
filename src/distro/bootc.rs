//! The `bootc:` pseudo-distro: disk images installed from a bootable
//! container image instead of a package set.

use anyhow::Result;
use rand::RngCore;

use super::{Distro, ImageOptions, ImageType};
use crate::arch::Arch;
use crate::blueprint::Blueprint;
use crate::content::ContainerSourceSpec;
use crate::datasizes::GIB;
use crate::disk::{template, PartitionTable, PartitioningMode, TemplateKind};
use crate::image::{check_bootc_customizations, Artifact, BootcDiskImage};
use crate::manifest::Manifest;
use crate::platform::{ImageFormat, Platform};

const BOOTC_PREFIX: &str = "bootc:";
const DEFAULT_SIZE: u64 = 10 * GIB;

/// Claims every `bootc:<imageref>` id.
pub fn factory(id: &str) -> Option<Box<dyn Distro>> {
    let image_ref = id.strip_prefix(BOOTC_PREFIX)?;
    Some(Box::new(BootcDistro {
        image_ref: image_ref.to_string(),
    }))
}

pub struct BootcDistro {
    image_ref: String,
}

impl Distro for BootcDistro {
    fn name(&self) -> &str {
        "bootc"
    }

    fn codename(&self) -> &str {
        ""
    }

    fn release_version(&self) -> &str {
        ""
    }

    fn arches(&self) -> Vec<Arch> {
        vec![Arch::X86_64, Arch::Aarch64, Arch::Ppc64le, Arch::S390x, Arch::Riscv64]
    }

    fn image_types(&self, _arch: Arch) -> Vec<String> {
        ["raw", "qcow2", "vmdk"]
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    fn image_type(&self, arch: Arch, name: &str) -> Option<Box<dyn ImageType>> {
        let (format, filename) = match name {
            "raw" => (ImageFormat::Raw, "disk.raw"),
            "qcow2" => (ImageFormat::Qcow2, "disk.qcow2"),
            "vmdk" => (ImageFormat::Vmdk, "disk.vmdk"),
            _ => return None,
        };
        Some(Box::new(BootcImageType {
            image_ref: self.image_ref.clone(),
            arch,
            format,
            name: name.to_string(),
            filename: filename.to_string(),
        }))
    }
}

struct BootcImageType {
    image_ref: String,
    arch: Arch,
    format: ImageFormat,
    name: String,
    filename: String,
}

impl BootcImageType {
    fn partition_table(
        &self,
        blueprint: &Blueprint,
        options: &ImageOptions,
        rng: &mut dyn RngCore,
    ) -> Result<PartitionTable> {
        let customizations = blueprint.customizations();
        let size = if options.size > 0 {
            options.size
        } else {
            DEFAULT_SIZE
        };
        let mountpoints = customizations.filesystem_requests();
        PartitionTable::plan(
            &template(TemplateKind::Plain),
            &mountpoints,
            size,
            customizations
                .partitioning_mode
                .unwrap_or(PartitioningMode::Raw),
            None,
            rng,
        )
    }
}

impl ImageType for BootcImageType {
    fn name(&self) -> &str {
        &self.name
    }

    fn filename(&self) -> &str {
        &self.filename
    }

    fn mime_type(&self) -> Option<&str> {
        match self.format {
            ImageFormat::Qcow2 => Some("application/x-qemu-disk"),
            _ => Some("application/octet-stream"),
        }
    }

    fn exports(&self) -> Vec<String> {
        let pipeline = match self.format {
            ImageFormat::Raw | ImageFormat::Unset => "image",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
            _ => "image",
        };
        vec![pipeline.to_string()]
    }

    fn instantiate(
        &self,
        manifest: &mut Manifest,
        blueprint: &Blueprint,
        options: &ImageOptions,
        rng: &mut dyn RngCore,
    ) -> Result<Artifact> {
        let customizations = blueprint.customizations();
        check_bootc_customizations(&customizations)?;

        let image = BootcDiskImage {
            platform: Platform {
                arch: self.arch,
                image_format: self.format,
                qcow2_compat: "1.1".to_string(),
                ..Platform::default()
            },
            container: ContainerSourceSpec {
                source: self.image_ref.clone(),
                ..ContainerSourceSpec::default()
            },
            partition_table: Some(self.partition_table(blueprint, options, rng)?),
            users: customizations.user.clone(),
            kernel_options_append: customizations.kernel_append(),
            selinux: String::new(),
            filename: self.filename.clone(),
            compression: String::new(),
        };
        image.instantiate(manifest, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_bootc_distro_surface() {
        let distro = factory("bootc:localhost/fake-cnt").unwrap();
        assert!(distro.arches().contains(&Arch::X86_64));
        assert!(distro
            .image_types(Arch::X86_64)
            .contains(&"qcow2".to_string()));
        assert!(distro.image_type(Arch::X86_64, "ami").is_none());

        let image_type = distro.image_type(Arch::X86_64, "qcow2").unwrap();
        assert_eq!(image_type.filename(), "disk.qcow2");
        assert_eq!(image_type.exports(), vec!["qcow2".to_string()]);
    }

    #[test]
    fn test_bootc_qcow2_manifest() {
        let distro = factory("bootc:localhost/fake-cnt").unwrap();
        let image_type = distro.image_type(Arch::X86_64, "qcow2").unwrap();
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        let artifact = image_type
            .instantiate(
                &mut manifest,
                &Blueprint::default(),
                &ImageOptions::default(),
                &mut rng,
            )
            .unwrap();
        assert_eq!(artifact.pipeline, "qcow2");
        let names: Vec<&str> = manifest.pipelines().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["build", "image", "qcow2"]);
    }
}
