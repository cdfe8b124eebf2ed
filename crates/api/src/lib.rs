//! Stagehand public API façade (in-process).
//!
//! Frontends depend on [`PipelinesApi`]; [`InProcApi`] wires the cluster-backed
//! collaborators, or injected ones for tests.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use rustc_hash::FxHashSet;
use stagehand_core::{
    ChartRelease, ChartUpgrade, GitRepositoryLookup, KustomizationPipeline, KustomizationSource, Pipeline, Promotion,
    ReleaseSource, ResourceRef, TopologyResolver,
};
use stagehand_kubehub::SharedClient;
use stagehand_store::PipelineError;
use stagehand_upgrades::{IndexGetters, RepositoryLookup, UpgradeError};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use stagehand_apply::{ApplyReport, PatchedRelease, ReleasePatcher};

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Source { .. } => ApiError::Internal(e.to_string()),
            other => ApiError::Validation(other.to_string()),
        }
    }
}

impl From<stagehand_promote::PromotionError> for ApiError {
    fn from(e: stagehand_promote::PromotionError) -> Self { ApiError::Validation(e.to_string()) }
}

impl From<UpgradeError> for ApiError {
    fn from(e: UpgradeError) -> Self {
        match e {
            UpgradeError::Cancelled => ApiError::Cancelled("upgrade check cancelled".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Pipeline API surface.
#[async_trait::async_trait]
pub trait PipelinesApi: Send + Sync {
    /// Every pipeline found in the release scope, sorted by name.
    async fn list_pipelines(&self) -> ApiResult<Vec<Pipeline>>;

    /// Promotions pending along `pipeline`.
    async fn promotions(&self, pipeline: &str) -> ApiResult<Vec<Promotion>>;

    /// Newer published versions of the charts deployed in `pipeline`.
    async fn upgrades(&self, pipeline: &str, cancel: CancellationToken) -> ApiResult<Vec<ChartUpgrade>>;

    /// Patch every promoted release of `pipeline` to its promotion target.
    async fn apply_promotions(&self, pipeline: &str, dry_run: bool) -> ApiResult<ApplyReport>;

    /// Kustomization pipelines, with Git sources resolved where they still exist.
    async fn kustomization_pipelines(&self) -> ApiResult<Vec<KustomizationPipeline>>;
}

/// In-process implementation.
#[derive(Clone)]
pub struct InProcApi {
    releases: Arc<dyn ReleaseSource>,
    topology: Arc<dyn TopologyResolver>,
    repositories: Arc<dyn RepositoryLookup>,
    getters: IndexGetters,
    patcher: Arc<dyn ReleasePatcher>,
    kustomizations: Arc<dyn KustomizationSource>,
    git: Arc<dyn GitRepositoryLookup>,
}

impl InProcApi {
    /// Cluster-backed API over resources in `namespace` (all namespaces when `None`).
    ///
    /// Every collaborator shares one kube client, built on first use.
    pub fn new(namespace: Option<String>) -> Self {
        let client = SharedClient::new();
        Self {
            releases: Arc::new(stagehand_kubehub::KubeReleaseSource::new(namespace.clone(), client.clone())),
            topology: Arc::new(stagehand_store::LabelTopology::new()),
            repositories: Arc::new(stagehand_kubehub::KubeRepositoryLookup::new(client.clone())),
            getters: IndexGetters::default(),
            patcher: Arc::new(stagehand_apply::KubePatcher::new(client.clone())),
            kustomizations: Arc::new(stagehand_kubehub::KubeKustomizationSource::new(namespace, client.clone())),
            git: Arc::new(stagehand_kubehub::KubeGitRepositoryLookup::new(client)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        releases: Arc<dyn ReleaseSource>,
        topology: Arc<dyn TopologyResolver>,
        repositories: Arc<dyn RepositoryLookup>,
        getters: IndexGetters,
        patcher: Arc<dyn ReleasePatcher>,
        kustomizations: Arc<dyn KustomizationSource>,
        git: Arc<dyn GitRepositoryLookup>,
    ) -> Self {
        Self { releases, topology, repositories, getters, patcher, kustomizations, git }
    }

    async fn load(&self) -> ApiResult<(Vec<ChartRelease>, Vec<Pipeline>)> {
        let releases = self.releases.list_releases().await.map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
        let pipelines = stagehand_store::parse_pipelines(&releases, self.topology.as_ref())?;
        Ok((releases, pipelines))
    }

    async fn pipeline(&self, name: &str) -> ApiResult<(Vec<ChartRelease>, Pipeline)> {
        if name.trim().is_empty() {
            return Err(ApiError::Validation("pipeline name must not be empty".into()));
        }
        let (releases, pipelines) = self.load().await?;
        let p = pipelines
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ApiError::NotFound(format!("pipeline {}", name)))?;
        Ok((releases, p))
    }
}

/// Keep only promoted resources labelled with the promotion's own environment.
///
/// Chart resources are tracked per pipeline, so a chart identity deployed in several
/// environments lists all of their releases; patching must not reach past the
/// environment being promoted.
pub fn scope_to_environment(pipeline: &Pipeline, promotions: &mut [Promotion], releases: &[ChartRelease]) {
    let placed: FxHashSet<(String, ResourceRef)> = stagehand_store::extract_facts(releases)
        .into_iter()
        .filter(|f| f.pipeline == pipeline.name)
        .map(|f| (f.environment, f.resource))
        .collect();
    for promotion in promotions.iter_mut() {
        let env = promotion.environment.clone();
        promotion.promoted_resources.retain(|r| placed.contains(&(env.clone(), r.clone())));
    }
}

#[async_trait::async_trait]
impl PipelinesApi for InProcApi {
    async fn list_pipelines(&self) -> ApiResult<Vec<Pipeline>> {
        let t0 = Instant::now();
        let (_, pipelines) = self.load().await?;
        info!(pipelines = pipelines.len(), took_ms = %t0.elapsed().as_millis(), "api: list_pipelines ok");
        Ok(pipelines)
    }

    async fn promotions(&self, pipeline: &str) -> ApiResult<Vec<Promotion>> {
        let t0 = Instant::now();
        let (_, p) = self.pipeline(pipeline).await?;
        let promotions = stagehand_promote::compute_promotions(&p)?;
        info!(pipeline, promotions = promotions.len(), took_ms = %t0.elapsed().as_millis(), "api: promotions ok");
        Ok(promotions)
    }

    async fn upgrades(&self, pipeline: &str, cancel: CancellationToken) -> ApiResult<Vec<ChartUpgrade>> {
        let t0 = Instant::now();
        let (_, p) = self.pipeline(pipeline).await?;
        let upgrades =
            stagehand_upgrades::identify_upgrades(&p, self.repositories.as_ref(), &self.getters, &cancel).await?;
        info!(pipeline, upgrades = upgrades.len(), took_ms = %t0.elapsed().as_millis(), "api: upgrades ok");
        Ok(upgrades)
    }

    async fn apply_promotions(&self, pipeline: &str, dry_run: bool) -> ApiResult<ApplyReport> {
        let t0 = Instant::now();
        let (releases, p) = self.pipeline(pipeline).await?;
        let mut promotions = stagehand_promote::compute_promotions(&p)?;
        scope_to_environment(&p, &mut promotions, &releases);
        let report = stagehand_apply::apply_promotions(self.patcher.as_ref(), &promotions, dry_run)
            .await
            .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
        info!(pipeline, dry_run, patched = report.patched.len(), took_ms = %t0.elapsed().as_millis(), "api: apply_promotions ok");
        Ok(report)
    }

    async fn kustomization_pipelines(&self) -> ApiResult<Vec<KustomizationPipeline>> {
        let t0 = Instant::now();
        let kusts = self
            .kustomizations
            .list_kustomizations()
            .await
            .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
        let mut pipelines = stagehand_store::parse_kustomization_pipelines(&kusts, self.topology.as_ref())?;
        stagehand_store::resolve_git_sources(&mut pipelines, self.git.as_ref()).await?;
        info!(kustomizations = kusts.len(), pipelines = pipelines.len(), took_ms = %t0.elapsed().as_millis(), "api: kustomization_pipelines ok");
        Ok(pipelines)
    }
}
