//! The pipeline graph and its three-phase lifecycle.
//!
//! A [`Manifest`] owns an ordered collection of pipelines. Image-type
//! composers *declare* pipelines (wiring build-parents and inputs by
//! pipeline name), the caller *plans* by resolving the declared content
//! queries through the external solver and resolvers, and finally
//! [`Manifest::serialize`] walks the graph in declaration order and emits
//! the document.
//!
//! Declaration order is serialization order: a pipeline can only be added
//! after the pipelines it references, so the order is topological by
//! construction and cycles cannot be expressed. Name collisions and
//! dangling build references are programming errors and panic.

mod build;
mod convert;
mod iso;
mod os;
mod ostree_deployment;
mod pxetree;
mod raw_bootc;
mod raw_image;

pub use build::{BuildPipeline, BuildSource};
pub use convert::{
    CompressFormat, CompressPipeline, ConvertFormat, ConvertPipeline, OvfPipeline, TarPipeline,
};
pub use iso::{
    AnacondaTreePipeline, EfiBootTreePipeline, IsoBootType, IsoPipeline, IsoRootfsImagePipeline,
    IsoRootfsType, IsoTreePipeline, KickstartOptions, PayloadSource,
};
pub use os::{
    OsCustomizations, OsPipeline, OscapConfig, OscapTailoring, SubscriptionConfig, WorkloadConfig,
};
pub use ostree_deployment::OstreeDeploymentPipeline;
pub use pxetree::{PxeRootfsType, PxeTreePipeline};
pub use raw_bootc::RawBootcPipeline;
pub use raw_image::RawImagePipeline;

use std::collections::BTreeMap;

use anyhow::Result;

use crate::content::{
    ContainerSourceSpec, ContainerSpec, OstreeCommitSpec, OstreeSourceSpec, PackageSet,
    PackageSpec, RepoConfig,
};
use crate::osbuild;

/// Compile-time configuration of a manifest, fixed at creation.
#[derive(Debug, Clone, Default)]
pub struct ManifestConfig {
    /// Clamp file timestamps for reproducible builds.
    pub source_epoch: Option<i64>,
    /// Use a container as the bootstrap buildroot instead of depsolved RPMs.
    /// Experimental; threaded through explicitly instead of read from the
    /// environment.
    pub bootstrap_container: Option<ContainerSourceSpec>,
}

/// Shared identity and graph-position fields of every pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineBase {
    pub name: String,
    /// Name of the build pipeline this pipeline runs inside. Build
    /// pipelines themselves and bootstrap buildroots have none.
    pub build: Option<String>,
    pub checkpoint: bool,
    pub export: bool,
}

impl PipelineBase {
    pub fn new(name: &str, build: Option<&str>) -> Self {
        PipelineBase {
            name: name.to_string(),
            build: build.map(String::from),
            checkpoint: false,
            export: false,
        }
    }
}

/// The declared content needs of the graph, keyed by pipeline name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentQueries {
    /// Package-set chains; order within a chain matters to the solver.
    pub packages: BTreeMap<String, Vec<PackageSet>>,
    pub containers: BTreeMap<String, Vec<ContainerSourceSpec>>,
    pub commits: BTreeMap<String, Vec<OstreeSourceSpec>>,
}

/// Resolved content handed back by the caller, keyed by pipeline name.
#[derive(Debug, Clone, Default)]
pub struct ResolvedContent {
    pub packages: BTreeMap<String, Vec<PackageSpec>>,
    pub repos: BTreeMap<String, Vec<RepoConfig>>,
    pub containers: BTreeMap<String, Vec<ContainerSpec>>,
    pub commits: BTreeMap<String, Vec<OstreeCommitSpec>>,
}

/// The per-pipeline slice of [`ResolvedContent`] injected at the start of
/// serialization.
#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    pub packages: Vec<PackageSpec>,
    pub repos: Vec<RepoConfig>,
    pub containers: Vec<ContainerSpec>,
    pub commits: Vec<OstreeCommitSpec>,
}

impl ResolvedContent {
    fn inputs_for(&self, pipeline: &str) -> PipelineInputs {
        PipelineInputs {
            packages: self.packages.get(pipeline).cloned().unwrap_or_default(),
            repos: self.repos.get(pipeline).cloned().unwrap_or_default(),
            containers: self.containers.get(pipeline).cloned().unwrap_or_default(),
            commits: self.commits.get(pipeline).cloned().unwrap_or_default(),
        }
    }
}

/// Every pipeline kind the compiler can emit. Closed set; graph operations
/// match exhaustively.
#[derive(Debug, Clone)]
pub enum Pipeline {
    Build(BuildPipeline),
    Os(Box<OsPipeline>),
    OstreeDeployment(Box<OstreeDeploymentPipeline>),
    RawImage(RawImagePipeline),
    RawBootc(RawBootcPipeline),
    Convert(ConvertPipeline),
    Ovf(OvfPipeline),
    Tar(TarPipeline),
    Compress(CompressPipeline),
    AnacondaTree(Box<AnacondaTreePipeline>),
    IsoRootfsImage(IsoRootfsImagePipeline),
    EfiBootTree(EfiBootTreePipeline),
    IsoTree(Box<IsoTreePipeline>),
    Iso(IsoPipeline),
    PxeTree(PxeTreePipeline),
}

macro_rules! for_each_pipeline {
    ($self:expr, $p:ident => $body:expr) => {
        match $self {
            Pipeline::Build($p) => $body,
            Pipeline::Os($p) => $body,
            Pipeline::OstreeDeployment($p) => $body,
            Pipeline::RawImage($p) => $body,
            Pipeline::RawBootc($p) => $body,
            Pipeline::Convert($p) => $body,
            Pipeline::Ovf($p) => $body,
            Pipeline::Tar($p) => $body,
            Pipeline::Compress($p) => $body,
            Pipeline::AnacondaTree($p) => $body,
            Pipeline::IsoRootfsImage($p) => $body,
            Pipeline::EfiBootTree($p) => $body,
            Pipeline::IsoTree($p) => $body,
            Pipeline::Iso($p) => $body,
            Pipeline::PxeTree($p) => $body,
        }
    };
}

impl Pipeline {
    pub fn base(&self) -> &PipelineBase {
        for_each_pipeline!(self, p => &p.base)
    }

    pub fn base_mut(&mut self) -> &mut PipelineBase {
        for_each_pipeline!(self, p => &mut p.base)
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    /// Declared package-set chain for the solver.
    fn declared_packages(&self) -> Vec<PackageSet> {
        match self {
            Pipeline::Build(p) => p.declared_packages(),
            Pipeline::Os(p) => p.declared_packages(),
            Pipeline::AnacondaTree(p) => p.declared_packages(),
            _ => Vec::new(),
        }
    }

    fn declared_containers(&self) -> Vec<ContainerSourceSpec> {
        match self {
            Pipeline::Build(p) => p.declared_containers(),
            Pipeline::Os(p) => p.declared_containers(),
            Pipeline::RawBootc(p) => p.declared_containers(),
            Pipeline::IsoTree(p) => p.declared_containers(),
            _ => Vec::new(),
        }
    }

    fn declared_commits(&self) -> Vec<OstreeSourceSpec> {
        match self {
            Pipeline::Os(p) => p.declared_commits(),
            Pipeline::OstreeDeployment(p) => p.declared_commits(),
            Pipeline::IsoTree(p) => p.declared_commits(),
            _ => Vec::new(),
        }
    }

    fn serialize_start(&mut self, inputs: PipelineInputs) {
        match self {
            Pipeline::Build(p) => p.serialize_start(inputs),
            Pipeline::Os(p) => p.serialize_start(inputs),
            Pipeline::OstreeDeployment(p) => p.serialize_start(inputs),
            Pipeline::RawBootc(p) => p.serialize_start(inputs),
            Pipeline::IsoTree(p) => p.serialize_start(inputs),
            Pipeline::AnacondaTree(p) => p.serialize_start(inputs),
            _ => {}
        }
    }

    fn serialize_end(&mut self) {
        match self {
            Pipeline::Build(p) => p.serialize_end(),
            Pipeline::Os(p) => p.serialize_end(),
            Pipeline::OstreeDeployment(p) => p.serialize_end(),
            Pipeline::RawBootc(p) => p.serialize_end(),
            Pipeline::IsoTree(p) => p.serialize_end(),
            Pipeline::AnacondaTree(p) => p.serialize_end(),
            _ => {}
        }
    }

    fn serialize(&self) -> Result<osbuild::Pipeline> {
        match self {
            Pipeline::Build(p) => p.serialize(),
            Pipeline::Os(p) => p.serialize(),
            Pipeline::OstreeDeployment(p) => p.serialize(),
            Pipeline::RawImage(p) => p.serialize(),
            Pipeline::RawBootc(p) => p.serialize(),
            Pipeline::Convert(p) => p.serialize(),
            Pipeline::Ovf(p) => p.serialize(),
            Pipeline::Tar(p) => p.serialize(),
            Pipeline::Compress(p) => p.serialize(),
            Pipeline::AnacondaTree(p) => p.serialize(),
            Pipeline::IsoRootfsImage(p) => p.serialize(),
            Pipeline::EfiBootTree(p) => p.serialize(),
            Pipeline::IsoTree(p) => p.serialize(),
            Pipeline::Iso(p) => p.serialize(),
            Pipeline::PxeTree(p) => p.serialize(),
        }
    }

    /// Resolved packages held during serialization, for source collection.
    fn resolved_packages(&self) -> Vec<PackageSpec> {
        match self {
            Pipeline::Build(p) => p.resolved_packages(),
            Pipeline::Os(p) => p.resolved_packages(),
            Pipeline::AnacondaTree(p) => p.resolved_packages(),
            _ => Vec::new(),
        }
    }

    fn resolved_containers(&self) -> Vec<ContainerSpec> {
        match self {
            Pipeline::Build(p) => p.resolved_containers(),
            Pipeline::Os(p) => p.resolved_containers(),
            Pipeline::RawBootc(p) => p.resolved_containers(),
            Pipeline::IsoTree(p) => p.resolved_containers(),
            _ => Vec::new(),
        }
    }

    fn resolved_commits(&self) -> Vec<OstreeCommitSpec> {
        match self {
            Pipeline::Os(p) => p.resolved_commits(),
            Pipeline::OstreeDeployment(p) => p.resolved_commits(),
            Pipeline::IsoTree(p) => p.resolved_commits(),
            _ => Vec::new(),
        }
    }

    /// Inline blobs accumulated while serializing; they become
    /// content-addressed sources.
    fn inline_data(&self) -> Vec<String> {
        match self {
            Pipeline::Os(p) => p.inline_data(),
            Pipeline::IsoTree(p) => p.inline_data(),
            Pipeline::PxeTree(p) => p.inline_data(),
            _ => Vec::new(),
        }
    }

    /// The artifact filename, for pipelines that produce a single file.
    pub fn filename(&self) -> Option<&str> {
        match self {
            Pipeline::RawImage(p) => Some(&p.filename),
            Pipeline::RawBootc(p) => Some(&p.filename),
            Pipeline::Convert(p) => Some(&p.filename),
            Pipeline::Tar(p) => Some(&p.filename),
            Pipeline::Compress(p) => Some(&p.filename),
            Pipeline::Iso(p) => Some(&p.filename),
            _ => None,
        }
    }

    /// Rename the artifact of a file pipeline; no-op for tree pipelines.
    pub fn set_filename(&mut self, filename: &str) {
        match self {
            Pipeline::RawImage(p) => p.filename = filename.to_string(),
            Pipeline::RawBootc(p) => p.filename = filename.to_string(),
            Pipeline::Convert(p) => p.filename = filename.to_string(),
            Pipeline::Tar(p) => p.filename = filename.to_string(),
            Pipeline::Compress(p) => p.filename = filename.to_string(),
            Pipeline::Iso(p) => p.filename = filename.to_string(),
            _ => {}
        }
    }

    fn runner(&self) -> Option<&str> {
        match self {
            Pipeline::Build(p) => Some(&p.runner),
            _ => None,
        }
    }
}

/// An ordered, named collection of pipelines plus the manifest-wide
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub config: ManifestConfig,
    pipelines: Vec<Pipeline>,
}

impl Manifest {
    pub fn new(config: ManifestConfig) -> Self {
        Manifest {
            config,
            pipelines: Vec::new(),
        }
    }

    /// Add a pipeline to the graph. Panics on duplicate names and on build
    /// references to pipelines that have not been added yet; both are
    /// programming errors in the composer.
    pub fn add(&mut self, pipeline: Pipeline) {
        let name = pipeline.name().to_string();
        if self.pipelines.iter().any(|p| p.name() == name) {
            panic!("duplicate pipeline name {name:?}; this is a programming error");
        }
        if let Some(build) = &pipeline.base().build {
            if !self.pipelines.iter().any(|p| p.name() == *build) {
                panic!(
                    "pipeline {name:?} references unknown build pipeline {build:?}; \
                     this is a programming error"
                );
            }
        }
        self.pipelines.push(pipeline);
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Pipeline> {
        self.pipelines.iter_mut().find(|p| p.name() == name)
    }

    /// Pipeline names marked as executor cache points.
    pub fn checkpoints(&self) -> Vec<String> {
        self.pipelines
            .iter()
            .filter(|p| p.base().checkpoint)
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Pipeline names whose artifacts the executor must return.
    pub fn exports(&self) -> Vec<String> {
        self.pipelines
            .iter()
            .filter(|p| p.base().export)
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Aggregate the declared content needs of all pipelines.
    pub fn content_queries(&self) -> ContentQueries {
        let mut queries = ContentQueries::default();
        for pipeline in &self.pipelines {
            let packages = pipeline.declared_packages();
            if !packages.is_empty() {
                queries.packages.insert(pipeline.name().to_string(), packages);
            }
            let containers = pipeline.declared_containers();
            if !containers.is_empty() {
                queries
                    .containers
                    .insert(pipeline.name().to_string(), containers);
            }
            let commits = pipeline.declared_commits();
            if !commits.is_empty() {
                queries.commits.insert(pipeline.name().to_string(), commits);
            }
        }
        queries
    }

    /// Serialize the graph into the final document.
    ///
    /// Injects the resolved content into each pipeline, serializes them in
    /// declaration order, collects all sources, and releases the resolved
    /// references again on every exit path.
    pub fn serialize(&mut self, resolved: &ResolvedContent) -> Result<osbuild::Document> {
        for pipeline in &mut self.pipelines {
            let inputs = resolved.inputs_for(pipeline.name());
            pipeline.serialize_start(inputs);
        }
        self.propagate_kernel_versions();

        let result = self.serialize_inner();

        for pipeline in &mut self.pipelines {
            pipeline.serialize_end();
        }
        result
    }

    /// Installer and PXE trees copy the kernel and initrd out of their
    /// tree pipelines by version, which is only known after depsolving.
    /// Push the resolved versions across before serializing.
    fn propagate_kernel_versions(&mut self) {
        let anaconda_kernel = self.pipelines.iter().find_map(|pipeline| match pipeline {
            Pipeline::AnacondaTree(anaconda) if !anaconda.kernel_version().is_empty() => {
                Some(anaconda.kernel_version().to_string())
            }
            _ => None,
        });
        let os_kernel = self.pipelines.iter().find_map(|pipeline| match pipeline {
            Pipeline::Os(os) if !os.kernel_version().is_empty() => {
                Some(os.kernel_version().to_string())
            }
            _ => None,
        });

        for pipeline in &mut self.pipelines {
            match pipeline {
                Pipeline::IsoTree(tree) if tree.kernel_version.is_empty() => {
                    if let Some(version) = &anaconda_kernel {
                        tree.kernel_version = version.clone();
                    }
                }
                Pipeline::PxeTree(pxe) if pxe.kernel_version.is_empty() => {
                    if let Some(version) = &os_kernel {
                        pxe.kernel_version = version.clone();
                    }
                }
                _ => {}
            }
        }
    }

    fn serialize_inner(&self) -> Result<osbuild::Document> {
        let mut documents = Vec::with_capacity(self.pipelines.len());
        let mut all_packages: Vec<PackageSpec> = Vec::new();
        let mut all_containers: Vec<ContainerSpec> = Vec::new();
        let mut all_commits: Vec<OstreeCommitSpec> = Vec::new();
        let mut all_inline: Vec<String> = Vec::new();

        for pipeline in &self.pipelines {
            let mut document = pipeline.serialize()?;
            document.build = pipeline
                .base()
                .build
                .as_ref()
                .map(|build| format!("name:{build}"));
            document.runner = pipeline.runner().map(String::from);
            document.source_epoch = self.config.source_epoch;
            documents.push(document);

            all_packages.extend(pipeline.resolved_packages());
            all_containers.extend(pipeline.resolved_containers());
            all_commits.extend(pipeline.resolved_commits());
            all_inline.extend(pipeline.inline_data());
        }

        let sources = osbuild::gen_sources(&all_packages, &all_commits, &all_inline, &all_containers)?;
        Ok(osbuild::Document {
            version: "2".to_string(),
            pipelines: documents,
            sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_pipeline(name: &str) -> Pipeline {
        Pipeline::Build(BuildPipeline::new(
            name,
            "org.osbuild.fedora40",
            vec![],
            vec![],
        ))
    }

    #[test]
    #[should_panic(expected = "duplicate pipeline name")]
    fn test_duplicate_names_panic() {
        let mut manifest = Manifest::default();
        manifest.add(build_pipeline("build"));
        manifest.add(build_pipeline("build"));
    }

    #[test]
    #[should_panic(expected = "unknown build pipeline")]
    fn test_forward_build_reference_panics() {
        let mut manifest = Manifest::default();
        let mut orphan = build_pipeline("orphan");
        orphan.base_mut().build = Some("missing".to_string());
        manifest.add(orphan);
    }

    #[test]
    fn test_checkpoints_and_exports() {
        let mut manifest = Manifest::default();
        let mut build = build_pipeline("build");
        build.base_mut().checkpoint = true;
        manifest.add(build);
        let mut other = build_pipeline("build2");
        other.base_mut().export = true;
        manifest.add(other);
        assert_eq!(manifest.checkpoints(), vec!["build".to_string()]);
        assert_eq!(manifest.exports(), vec!["build2".to_string()]);
    }

    #[test]
    fn test_content_queries_keyed_by_pipeline() {
        let mut manifest = Manifest::default();
        let build = BuildPipeline::new(
            "build",
            "org.osbuild.fedora40",
            vec![],
            vec!["rpm".to_string(), "dnf".to_string()],
        );
        manifest.add(Pipeline::Build(build));

        let queries = manifest.content_queries();
        let chain = &queries.packages["build"];
        assert_eq!(chain.len(), 1);
        assert!(chain[0].include.contains(&"rpm".to_string()));
    }

    #[test]
    fn test_serialize_sets_build_references() {
        let mut manifest = Manifest::default();
        manifest.add(build_pipeline("build"));
        let mut dependent = build_pipeline("build2");
        dependent.base_mut().build = Some("build".to_string());
        manifest.add(dependent);

        let resolved = ResolvedContent {
            packages: BTreeMap::from([
                ("build".to_string(), vec![Default::default()]),
                ("build2".to_string(), vec![Default::default()]),
            ]),
            ..ResolvedContent::default()
        };
        let document = manifest.serialize(&resolved).unwrap();
        assert_eq!(document.version, "2");
        assert_eq!(document.pipelines[1].build.as_deref(), Some("name:build"));
        assert_eq!(
            document.pipelines[0].runner.as_deref(),
            Some("org.osbuild.fedora40")
        );
    }
}
