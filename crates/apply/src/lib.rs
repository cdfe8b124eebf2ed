//! Stagehand apply: write computed promotions back to the releases that need them.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, Patch, PatchParams},
    core::DynamicObject,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use stagehand_core::{Promotion, ResourceRef};
use stagehand_kubehub::SharedClient;
use tracing::{info, warn};

const FIELD_MANAGER: &str = "stagehand";

/// Updates the chart version of a single release.
#[async_trait::async_trait]
pub trait ReleasePatcher: Send + Sync {
    async fn set_chart_version(&self, target: &ResourceRef, version: &str, dry_run: bool) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchedRelease {
    pub resource: ResourceRef,
    pub environment: String,
    pub chart: String,
    pub from_version: String,
    pub to_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub dry_run: bool,
    pub patched: Vec<PatchedRelease>,
}

/// Merge patch moving a HelmRelease to `version`.
pub fn version_patch(version: &str) -> Json {
    serde_json::json!({ "spec": { "chart": { "spec": { "version": version } } } })
}

/// Set every promoted resource to its promotion's target version, in order.
///
/// Stops at the first failed patch; releases patched before it stay patched.
pub async fn apply_promotions(patcher: &dyn ReleasePatcher, promotions: &[Promotion], dry_run: bool) -> Result<ApplyReport> {
    let t0 = std::time::Instant::now();
    let mut report = ApplyReport { dry_run, patched: Vec::new() };
    for promotion in promotions {
        if promotion.promoted_resources.is_empty() {
            warn!(environment = %promotion.environment, chart = %promotion.from.name, "promotion has no resources to update");
        }
        for target in &promotion.promoted_resources {
            let already = report
                .patched
                .iter()
                .any(|p| p.resource == *target && p.to_version == promotion.to.version);
            if already {
                continue;
            }
            if let Err(e) = patcher.set_chart_version(target, &promotion.to.version, dry_run).await {
                counter!("promotion_apply_err", 1u64);
                return Err(e.context(format!(
                    "promoting {} in {} to {}",
                    target, promotion.environment, promotion.to.version
                )));
            }
            counter!("promotions_applied", 1u64);
            info!(resource = %target, environment = %promotion.environment, chart = %promotion.from.name, from = %promotion.from.version, to = %promotion.to.version, dry_run, "release promoted");
            report.patched.push(PatchedRelease {
                resource: target.clone(),
                environment: promotion.environment.clone(),
                chart: promotion.from.name.clone(),
                from_version: promotion.from.version.clone(),
                to_version: promotion.to.version.clone(),
            });
        }
    }
    histogram!("promotion_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    Ok(report)
}

/// Patches releases through the current kube context.
#[derive(Clone, Default)]
pub struct KubePatcher {
    client: SharedClient,
}

impl KubePatcher {
    pub fn new(client: SharedClient) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ReleasePatcher for KubePatcher {
    async fn set_chart_version(&self, target: &ResourceRef, version: &str, dry_run: bool) -> Result<()> {
        if target.namespace.is_empty() {
            return Err(anyhow!("{} has no namespace", target));
        }
        let ar = stagehand_kubehub::api_resource_for(&target.api_version, &target.kind)?;
        let client = self.client.get().await?;
        let api: Api<DynamicObject> = Api::namespaced_with(client, &target.namespace, &ar);
        let mut pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        if dry_run {
            pp = pp.dry_run();
        }
        api.patch(&target.name, &pp, &Patch::Merge(&version_patch(version)))
            .await
            .with_context(|| format!("patching {}", target))?;
        Ok(())
    }
}
