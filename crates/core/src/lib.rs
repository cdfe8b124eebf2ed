//! Stagehand core types: chart identities, pipelines, promotions and the collaborator seams.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Label carrying the pipeline a release belongs to.
pub const PIPELINE_NAME_LABEL: &str = "pipelines.gitops.pro/name";
/// Label carrying the environment (stage) of a release within its pipeline.
pub const PIPELINE_ENVIRONMENT_LABEL: &str = "pipelines.gitops.pro/environment";
/// Label naming the environment that precedes this one.
pub const PIPELINE_ENVIRONMENT_AFTER_LABEL: &str = "pipelines.gitops.pro/environment-after";

/// Source kind Kustomization locations are resolved for.
pub const GIT_REPOSITORY_KIND: &str = "GitRepository";

/// Reference to the repository object that owns a chart's version catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
}

impl SourceRef {
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self { kind: kind.to_string(), namespace: namespace.to_string(), name: name.to_string(), api_version: String::new() }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.api_version.is_empty() {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        } else {
            write!(f, "{}/{}/{}/{}", self.api_version, self.kind, self.namespace, self.name)
        }
    }
}

/// Reference to the resource instance that deploys a chart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    /// Ordering used whenever resource lists leave the engine.
    pub fn sort_key(&self) -> (&str, &str, &str, &str) {
        (&self.name, &self.namespace, &self.kind, &self.api_version)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A named chart at a specific version, tied to its source repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChartIdentity {
    pub name: String,
    pub version: String,
    pub source: SourceRef,
}

impl ChartIdentity {
    pub fn new(name: &str, version: &str, source: SourceRef) -> Self {
        Self { name: name.to_string(), version: version.to_string(), source }
    }

    /// Same chart (name and source) deployed at a different version.
    pub fn is_other_version_of(&self, other: &ChartIdentity) -> bool {
        self.name == other.name && self.source == other.source && self.version != other.version
    }

    /// Composite key `(name, version, source)` giving charts a total order.
    pub fn sort_key(&self) -> (String, String, String) {
        (self.name.clone(), self.version.clone(), self.source.to_string())
    }
}

impl fmt::Display for ChartIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.source)
    }
}

/// A deployment stage and the charts deployed in it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    /// Deduplicated, sorted by [`ChartIdentity::sort_key`].
    pub charts: Vec<ChartIdentity>,
}

/// An ordered promotion path of environments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub name: String,
    pub environments: Vec<Environment>,
    /// Resources deploying each chart identity, across every environment of the pipeline.
    #[serde(skip)]
    pub chart_resources: ChartResources,
}

impl Pipeline {
    /// Resources currently deploying `chart`; empty when the chart is unknown.
    pub fn resources_of(&self, chart: &ChartIdentity) -> &[ResourceRef] {
        self.chart_resources.get(chart).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Map from chart identity to the sorted, deduplicated resources deploying it.
pub type ChartResources = rustc_hash::FxHashMap<ChartIdentity, Vec<ResourceRef>>;

/// Version drift of one chart between two adjacent environments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    /// The downstream environment receiving the promotion.
    pub environment: String,
    /// Chart currently deployed in `environment`.
    pub from: ChartIdentity,
    /// Upstream chart whose version `environment` should adopt.
    pub to: ChartIdentity,
    pub promoted_resources: Vec<ResourceRef>,
}

/// A newer published version of a deployed chart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChartUpgrade {
    pub current: ChartIdentity,
    pub available: ChartIdentity,
}

/// A deployed chart-release resource as read from the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartRelease {
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    pub chart: String,
    pub version: String,
    pub source: SourceRef,
}

impl ChartRelease {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            kind: self.kind.clone(),
            api_version: self.api_version.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Labels of an object that can be placed in a pipeline.
pub trait PipelineMember {
    fn labels(&self) -> &[(String, String)];

    /// Non-empty value of `key`, if present.
    fn label(&self, key: &str) -> Option<&str> {
        self.labels()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

impl PipelineMember for ChartRelease {
    fn labels(&self) -> &[(String, String)] { &self.labels }
}

/// Borrow a homogeneous slice as pipeline members.
pub fn as_members<T: PipelineMember>(items: &[T]) -> Vec<&dyn PipelineMember> {
    items.iter().map(|i| i as &dyn PipelineMember).collect()
}

/// A deployed Flux Kustomization as read from the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
    pub labels: SmallVec<[(String, String); 8]>,
    /// Path inside the source artifact.
    pub path: String,
    pub source: SourceRef,
}

impl PipelineMember for Kustomization {
    fn labels(&self) -> &[(String, String)] { &self.labels }
}

/// Git reference a GitRepository tracks. Unset fields are omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct GitReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Where a GitRepository source points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitRepository {
    pub url: String,
    pub reference: Option<GitReference>,
}

/// One deployed Kustomization path, with its source location once resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EnvironmentKustomization {
    pub path: String,
    pub source: SourceRef,
    /// Empty until the source has been resolved, or when it could not be.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<GitReference>,
}

impl EnvironmentKustomization {
    /// `(path, source)`; the order Kustomizations are listed in.
    pub fn sort_key(&self) -> (String, String) {
        (self.path.clone(), self.source.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KustomizationEnvironment {
    pub name: String,
    pub kustomizations: Vec<EnvironmentKustomization>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KustomizationPipeline {
    pub name: String,
    pub environments: Vec<KustomizationEnvironment>,
}

/// Ordered environment names per pipeline name.
pub type Topology = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("pipeline {pipeline}: environments form a cycle through {environment}")]
    Cycle { pipeline: String, environment: String },
    #[error("pipeline {pipeline}: environment {environment} follows both {first} and {second}")]
    ConflictingPredecessor { pipeline: String, environment: String, first: String, second: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Resolves the environment order of every pipeline present in a release collection.
pub trait TopologyResolver: Send + Sync {
    fn resolve(&self, members: &[&dyn PipelineMember]) -> Result<Topology, TopologyError>;
}

/// Supplies the labelled chart releases the engine works on.
#[async_trait::async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn list_releases(&self) -> anyhow::Result<Vec<ChartRelease>>;
}

/// Supplies the labelled Kustomizations.
#[async_trait::async_trait]
pub trait KustomizationSource: Send + Sync {
    async fn list_kustomizations(&self) -> anyhow::Result<Vec<Kustomization>>;
}

/// Resolves GitRepository source references; `Ok(None)` when the object does not exist.
#[async_trait::async_trait]
pub trait GitRepositoryLookup: Send + Sync {
    async fn resolve(&self, source: &SourceRef) -> anyhow::Result<Option<GitRepository>>;
}

pub mod prelude {
    pub use super::{
        as_members, ChartIdentity, ChartRelease, ChartUpgrade, Environment, EnvironmentKustomization, GitReference,
        GitRepository, GitRepositoryLookup, Kustomization, KustomizationEnvironment, KustomizationPipeline,
        KustomizationSource, Pipeline, PipelineMember, Promotion, ReleaseSource, ResourceRef, SourceRef, Topology,
        TopologyError, TopologyResolver,
    };
}
