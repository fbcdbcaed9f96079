//! The Anaconda installer ISO.

use anyhow::{bail, Result};
use rand::{Rng, RngCore};

use super::{export_artifact, Artifact};
use crate::blueprint::InstallerCustomization;
use crate::content::RepoConfig;
use crate::datasizes::{GIB, MIB};
use crate::disk::{Filesystem, FilesystemType, Partition, PartitionTable, Payload};
use crate::manifest::{
    AnacondaTreePipeline, BuildPipeline, EfiBootTreePipeline, IsoBootType, IsoPipeline,
    IsoRootfsImagePipeline, IsoRootfsType, IsoTreePipeline, KickstartOptions, Manifest, Pipeline,
};
use crate::platform::Platform;

#[derive(Debug, Clone, Default)]
pub struct AnacondaInstallerIso {
    pub platform: Platform,
    pub repos: Vec<RepoConfig>,
    pub runner: String,
    pub build_packages: Vec<String>,
    /// Extra packages for the installer runtime on top of anaconda itself.
    pub installer_packages: Vec<String>,
    pub payload: crate::manifest::PayloadSource,
    pub kickstart: KickstartOptions,
    pub installer: Option<InstallerCustomization>,
    pub product: String,
    pub version: String,
    pub release: String,
    pub iso_label: String,
    pub rootfs_type: IsoRootfsType,
    pub boot_type: IsoBootType,
    pub install_rootfs_type: FilesystemType,
    pub kernel_opts: Vec<String>,
    pub filename: String,
}

/// Single-partition vfat layout for efiboot.img.
fn efiboot_table(rng: &mut dyn RngCore) -> PartitionTable {
    let size = 20 * MIB;
    let volid: u32 = rng.gen();
    PartitionTable {
        size,
        partitions: vec![Partition {
            start: 0,
            size,
            payload: Some(Payload::Filesystem(Filesystem {
                fs_type: FilesystemType::Vfat,
                uuid: format!("{:04X}-{:04X}", volid >> 16, volid & 0xffff),
                mountpoint: "/".to_string(),
                ..Filesystem::default()
            })),
            ..Partition::default()
        }],
        ..PartitionTable::default()
    }
}

impl AnacondaInstallerIso {
    /// Validate the kickstart-related customizations. User-supplied
    /// kickstart content cannot be combined with options whose generated
    /// answers it would override.
    fn check_kickstart(&self) -> Result<()> {
        if self.kickstart.user_file.is_some() {
            if self.kickstart.unattended {
                bail!(
                    "kickstart customizations cannot be combined: unattended mode \
                     conflicts with user-supplied kickstart content"
                );
            }
            if !self.kickstart.sudo_nopasswd.is_empty() {
                bail!(
                    "kickstart customizations cannot be combined: sudo-nopasswd \
                     conflicts with user-supplied kickstart content"
                );
            }
        }
        Ok(())
    }

    pub fn instantiate(
        &self,
        manifest: &mut Manifest,
        rng: &mut dyn RngCore,
    ) -> Result<Artifact> {
        self.check_kickstart()?;

        let mut anaconda = AnacondaTreePipeline::new(
            "anaconda-tree",
            "build",
            self.platform.clone(),
            self.repos.clone(),
        );
        anaconda.packages = self.installer_packages.clone();
        anaconda.product = self.product.clone();
        anaconda.version = self.version.clone();
        if let Some(installer) = &self.installer {
            if let Some(modules) = &installer.modules {
                anaconda.enabled_modules = modules.enable.clone();
                anaconda.disabled_modules = modules.disable.clone();
            }
        }

        let mut build = BuildPipeline::new(
            "build",
            &self.runner,
            self.repos.clone(),
            self.build_packages.clone(),
        );
        build.base.checkpoint = true;

        let efiboot = EfiBootTreePipeline {
            iso_label: self.iso_label.clone(),
            kernel_opts: self.kernel_opts.clone(),
            ..EfiBootTreePipeline::new(
                "efiboot-tree",
                "build",
                self.platform.clone(),
                &self.product,
                &self.version,
            )
        };

        let mut tree = IsoTreePipeline::new(
            "bootiso-tree",
            "build",
            "anaconda-tree",
            self.payload.clone(),
            self.platform.clone(),
        );
        tree.kickstart = self.kickstart.clone();
        tree.product = self.product.clone();
        tree.version = self.version.clone();
        tree.release = self.release.clone();
        tree.iso_label = self.iso_label.clone();
        tree.rootfs_type = self.rootfs_type;
        tree.boot_type = self.boot_type;
        tree.install_rootfs_type = self.install_rootfs_type;
        tree.kernel_opts = self.kernel_opts.clone();
        tree.efiboot_pipeline = Some("efiboot-tree".to_string());
        tree.efiboot_table = Some(efiboot_table(rng));
        if self.rootfs_type == IsoRootfsType::SquashfsExt4 {
            tree.rootfs_pipeline = Some("rootfs-image".to_string());
        }

        build.add_packages(&tree.build_packages());

        let mut iso = IsoPipeline::new("bootiso", "build", "bootiso-tree", &self.iso_label);
        iso.boot_type = self.boot_type;
        iso.filename = self.filename.clone();
        build.add_packages(&iso.build_packages());

        manifest.add(Pipeline::Build(build));
        manifest.add(Pipeline::AnacondaTree(Box::new(anaconda)));
        if self.rootfs_type == IsoRootfsType::SquashfsExt4 {
            manifest.add(Pipeline::IsoRootfsImage(IsoRootfsImagePipeline::new(
                "rootfs-image",
                "build",
                "anaconda-tree",
                4 * GIB,
            )));
        }
        manifest.add(Pipeline::EfiBootTree(efiboot));
        manifest.add(Pipeline::IsoTree(Box::new(tree)));
        manifest.add(Pipeline::Iso(iso));

        Ok(export_artifact(
            manifest,
            "bootiso",
            &self.filename,
            Some("application/x-iso9660-image"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PayloadSource;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn iso() -> AnacondaInstallerIso {
        AnacondaInstallerIso {
            runner: "org.osbuild.fedora40".to_string(),
            product: "Fedora".to_string(),
            version: "40".to_string(),
            iso_label: "Fedora-40-x86_64".to_string(),
            filename: "installer.iso".to_string(),
            kickstart: KickstartOptions {
                path: "/osbuild.ks".to_string(),
                ..KickstartOptions::default()
            },
            ..AnacondaInstallerIso::default()
        }
    }

    #[test]
    fn test_installer_pipeline_names() {
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        let artifact = iso().instantiate(&mut manifest, &mut rng).unwrap();
        let names: Vec<&str> = manifest.pipelines().iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec!["build", "anaconda-tree", "efiboot-tree", "bootiso-tree", "bootiso"]
        );
        assert_eq!(artifact.mime_type.as_deref(), Some("application/x-iso9660-image"));
    }

    #[test]
    fn test_squashfs_ext4_adds_rootfs_image() {
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        let mut image = iso();
        image.rootfs_type = IsoRootfsType::SquashfsExt4;
        image.instantiate(&mut manifest, &mut rng).unwrap();
        let names: Vec<&str> = manifest.pipelines().iter().map(|p| p.name()).collect();
        assert!(names.contains(&"rootfs-image"));
    }

    #[test]
    fn test_user_kickstart_conflicts() {
        let mut image = iso();
        image.kickstart.user_file = Some("text\n".to_string());
        image.kickstart.unattended = true;
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        assert!(image.instantiate(&mut manifest, &mut rng).is_err());

        let mut image = iso();
        image.kickstart.user_file = Some("text\n".to_string());
        image.kickstart.sudo_nopasswd = vec!["%wheel".to_string()];
        assert!(image.instantiate(&mut manifest, &mut rng).is_err());
    }

    #[test]
    fn test_container_payload_iso() {
        let mut image = iso();
        image.payload = PayloadSource::Container {
            source: crate::content::ContainerSourceSpec {
                source: "registry.example.org/org/image".to_string(),
                ..crate::content::ContainerSourceSpec::default()
            },
        };
        let mut manifest = Manifest::default();
        let mut rng = StdRng::seed_from_u64(13);
        image.instantiate(&mut manifest, &mut rng).unwrap();
        let queries = manifest.content_queries();
        assert_eq!(
            queries.containers["bootiso-tree"][0].source,
            "registry.example.org/org/image"
        );
        assert!(queries.commits.is_empty());
    }
}
