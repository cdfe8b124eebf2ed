//! Kustomization pipelines: deployed paths per environment and the Git sources behind them.

use rustc_hash::{FxHashMap, FxHashSet};
use stagehand_core::{
    as_members, EnvironmentKustomization, GitRepository, GitRepositoryLookup, Kustomization, KustomizationEnvironment,
    KustomizationPipeline, PipelineMember, ResourceRef, SourceRef, Topology, TopologyResolver, GIT_REPOSITORY_KIND,
    PIPELINE_ENVIRONMENT_LABEL, PIPELINE_NAME_LABEL,
};
use tracing::debug;

use crate::PipelineError;

/// One Kustomization placed in a pipeline environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KustomizationFact {
    pub pipeline: String,
    pub environment: String,
    pub path: String,
    pub source: SourceRef,
    pub resource: ResourceRef,
}

/// Extract one fact per Kustomization carrying both pipeline labels.
pub fn extract_kustomization_facts(kustomizations: &[Kustomization]) -> Vec<KustomizationFact> {
    let mut out = Vec::with_capacity(kustomizations.len());
    for k in kustomizations {
        let (Some(pipeline), Some(environment)) = (k.label(PIPELINE_NAME_LABEL), k.label(PIPELINE_ENVIRONMENT_LABEL))
        else {
            debug!(kustomization = %format!("{}/{}", k.namespace, k.name), "kustomization not placed in a pipeline; skipping");
            continue;
        };
        out.push(KustomizationFact {
            pipeline: pipeline.to_string(),
            environment: environment.to_string(),
            path: k.path.clone(),
            source: k.source.clone(),
            resource: ResourceRef {
                kind: k.kind.clone(),
                api_version: k.api_version.clone(),
                namespace: k.namespace.clone(),
                name: k.name.clone(),
            },
        });
    }
    out
}

/// Group facts into pipelines, environments in topology order.
///
/// Kustomizations deploying the same path from the same source collapse into one entry;
/// entries are sorted by path then source. Source locations are left unresolved.
pub fn build_kustomization_pipelines(topology: &Topology, facts: &[KustomizationFact]) -> Vec<KustomizationPipeline> {
    let mut out = Vec::with_capacity(topology.len());
    for (name, envs) in topology {
        let mut by_env: FxHashMap<&str, FxHashSet<EnvironmentKustomization>> = FxHashMap::default();
        for f in facts.iter().filter(|f| &f.pipeline == name) {
            by_env.entry(f.environment.as_str()).or_default().insert(EnvironmentKustomization {
                path: f.path.clone(),
                source: f.source.clone(),
                ..Default::default()
            });
        }
        let environments = envs
            .iter()
            .map(|env| {
                let mut kustomizations: Vec<_> =
                    by_env.remove(env.as_str()).map(|set| set.into_iter().collect()).unwrap_or_default();
                kustomizations.sort_by_key(|k: &EnvironmentKustomization| k.sort_key());
                KustomizationEnvironment { name: env.clone(), kustomizations }
            })
            .collect();
        out.push(KustomizationPipeline { name: name.clone(), environments });
    }
    out
}

/// Resolve the topology of `kustomizations` and build their pipelines.
pub fn parse_kustomization_pipelines(
    kustomizations: &[Kustomization],
    resolver: &dyn TopologyResolver,
) -> Result<Vec<KustomizationPipeline>, PipelineError> {
    let topology = resolver.resolve(&as_members(kustomizations))?;
    let facts = extract_kustomization_facts(kustomizations);
    Ok(build_kustomization_pipelines(&topology, &facts))
}

/// Fill in the URL and Git reference of every GitRepository-backed entry.
///
/// Other source kinds, and GitRepositories that no longer exist, stay unresolved.
/// A failed lookup fails the whole call.
pub async fn resolve_git_sources(
    pipelines: &mut [KustomizationPipeline],
    lookup: &dyn GitRepositoryLookup,
) -> Result<(), PipelineError> {
    let mut seen: FxHashMap<SourceRef, Option<GitRepository>> = FxHashMap::default();
    for p in pipelines.iter_mut() {
        for env in p.environments.iter_mut() {
            for k in env.kustomizations.iter_mut() {
                if k.source.kind != GIT_REPOSITORY_KIND {
                    debug!(source = %k.source, "not a GitRepository; leaving unresolved");
                    continue;
                }
                let repo = match seen.get(&k.source) {
                    Some(cached) => cached.clone(),
                    None => {
                        let found = lookup
                            .resolve(&k.source)
                            .await
                            .map_err(|source| PipelineError::Source { source_ref: k.source.to_string(), source })?;
                        if found.is_none() {
                            debug!(source = %k.source, "GitRepository not found");
                        }
                        seen.insert(k.source.clone(), found.clone());
                        found
                    }
                };
                if let Some(repo) = repo {
                    k.url = repo.url;
                    k.reference = repo.reference;
                }
            }
        }
    }
    Ok(())
}
