//! Stagehand store: turns labelled chart releases into ordered pipeline snapshots.

#![forbid(unsafe_code)]

mod kustomizations;
mod topology;

pub use kustomizations::{
    build_kustomization_pipelines, extract_kustomization_facts, parse_kustomization_pipelines, resolve_git_sources,
    KustomizationFact,
};
pub use topology::LabelTopology;

use rustc_hash::{FxHashMap, FxHashSet};
use stagehand_core::{
    as_members, ChartIdentity, ChartRelease, ChartResources, Environment, Pipeline, PipelineMember, ResourceRef,
    SourceRef, Topology, TopologyError, TopologyResolver, PIPELINE_ENVIRONMENT_LABEL, PIPELINE_NAME_LABEL,
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to calculate pipelines: {0}")]
    Topology(#[from] TopologyError),
    #[error("failed to load source {source_ref}: {source:#}")]
    Source { source_ref: String, source: anyhow::Error },
}

/// One deployed chart placed in a pipeline environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartFact {
    pub pipeline: String,
    pub environment: String,
    pub chart: String,
    pub version: String,
    pub source: SourceRef,
    pub resource: ResourceRef,
}

impl ChartFact {
    pub fn identity(&self) -> ChartIdentity {
        ChartIdentity { name: self.chart.clone(), version: self.version.clone(), source: self.source.clone() }
    }
}

/// Extract one fact per release that carries both pipeline labels.
///
/// Releases missing either label cannot be placed in a pipeline and are skipped.
pub fn extract_facts(releases: &[ChartRelease]) -> Vec<ChartFact> {
    let mut out = Vec::with_capacity(releases.len());
    for rel in releases {
        let (Some(pipeline), Some(environment)) =
            (rel.label(PIPELINE_NAME_LABEL), rel.label(PIPELINE_ENVIRONMENT_LABEL))
        else {
            debug!(release = %rel.resource_ref(), "release not placed in a pipeline; skipping");
            continue;
        };
        out.push(ChartFact {
            pipeline: pipeline.to_string(),
            environment: environment.to_string(),
            chart: rel.chart.clone(),
            version: rel.version.clone(),
            source: rel.source.clone(),
            resource: rel.resource_ref(),
        });
    }
    out
}

/// Accumulates facts for a single pipeline.
pub struct PipelineBuilder {
    name: String,
    env_charts: FxHashMap<String, FxHashSet<ChartIdentity>>,
    chart_resources: FxHashMap<ChartIdentity, FxHashSet<ResourceRef>>,
}

impl PipelineBuilder {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), env_charts: FxHashMap::default(), chart_resources: FxHashMap::default() }
    }

    /// Facts belonging to other pipelines are ignored.
    pub fn add(&mut self, fact: &ChartFact) {
        if fact.pipeline != self.name {
            return;
        }
        let id = fact.identity();
        self.env_charts.entry(fact.environment.clone()).or_default().insert(id.clone());
        self.chart_resources.entry(id).or_default().insert(fact.resource.clone());
    }

    /// Materialize the pipeline with environments in `order`.
    ///
    /// Environments named in `order` without facts are kept with no charts.
    pub fn freeze(&self, order: &[String]) -> Pipeline {
        let environments = order
            .iter()
            .map(|env| Environment {
                name: env.clone(),
                charts: self.env_charts.get(env).map(sorted_charts).unwrap_or_default(),
            })
            .collect();
        let chart_resources: ChartResources = self
            .chart_resources
            .iter()
            .map(|(id, refs)| (id.clone(), sorted_resources(refs)))
            .collect();
        Pipeline { name: self.name.clone(), environments, chart_resources }
    }
}

fn sorted_charts(set: &FxHashSet<ChartIdentity>) -> Vec<ChartIdentity> {
    let mut keyed: Vec<_> = set.iter().map(|c| (c.sort_key(), c)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, c)| c.clone()).collect()
}

fn sorted_resources(set: &FxHashSet<ResourceRef>) -> Vec<ResourceRef> {
    let mut v: Vec<ResourceRef> = set.iter().cloned().collect();
    v.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    v
}

/// Build every pipeline in `topology` from the given facts, in topology order.
pub fn build_pipelines(topology: &Topology, facts: &[ChartFact]) -> Vec<Pipeline> {
    let mut out = Vec::with_capacity(topology.len());
    for (name, envs) in topology {
        let mut builder = PipelineBuilder::new(name);
        for f in facts.iter().filter(|f| &f.pipeline == name) {
            builder.add(f);
        }
        let p = builder.freeze(envs);
        debug!(pipeline = %name, environments = p.environments.len(), charts = p.chart_resources.len(), "pipeline built");
        out.push(p);
    }
    out
}

/// Resolve the topology of `releases` and build their pipelines.
pub fn parse_pipelines(releases: &[ChartRelease], resolver: &dyn TopologyResolver) -> Result<Vec<Pipeline>, PipelineError> {
    let topology = resolver.resolve(&as_members(releases))?;
    let facts = extract_facts(releases);
    Ok(build_pipelines(&topology, &facts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn release(name: &str, ns: &str, pipeline: Option<&str>, env: Option<&str>, chart: &str, version: &str) -> ChartRelease {
        let mut labels = smallvec![];
        if let Some(p) = pipeline { labels.push((PIPELINE_NAME_LABEL.to_string(), p.to_string())); }
        if let Some(e) = env { labels.push((PIPELINE_ENVIRONMENT_LABEL.to_string(), e.to_string())); }
        ChartRelease {
            kind: "HelmRelease".to_string(),
            api_version: "helm.toolkit.fluxcd.io/v2beta1".to_string(),
            namespace: ns.to_string(),
            name: name.to_string(),
            labels,
            chart: chart.to_string(),
            version: version.to_string(),
            source: SourceRef::new("HelmRepository", "default", "test-repository"),
        }
    }

    #[test]
    fn extract_skips_unlabelled_releases() {
        let rels = vec![
            release("a", "default", Some("demo"), Some("staging"), "redis", "1.0.9"),
            release("b", "default", Some("demo"), None, "redis", "1.0.9"),
            release("c", "default", None, Some("staging"), "redis", "1.0.9"),
            release("d", "default", None, None, "redis", "1.0.9"),
        ];
        let facts = extract_facts(&rels);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].resource.name, "a");
        assert_eq!(facts[0].pipeline, "demo");
        assert_eq!(facts[0].environment, "staging");
        assert_eq!(facts[0].resource.kind, "HelmRelease");
    }

    #[test]
    fn builder_dedups_charts_and_unions_resources_across_environments() {
        let rels = vec![
            release("redis-a", "staging", Some("demo"), Some("staging"), "redis", "1.0.9"),
            release("redis-b", "staging", Some("demo"), Some("staging"), "redis", "1.0.9"),
            release("redis-prod", "production", Some("demo"), Some("production"), "redis", "1.0.9"),
        ];
        let facts = extract_facts(&rels);
        let mut b = PipelineBuilder::new("demo");
        for f in &facts { b.add(f); }
        let p = b.freeze(&["staging".to_string(), "production".to_string()]);

        assert_eq!(p.environments[0].charts.len(), 1);
        assert_eq!(p.environments[1].charts.len(), 1);
        let names: Vec<_> = p.resources_of(&p.environments[0].charts[0]).iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["redis-a", "redis-b", "redis-prod"]);
    }

    #[test]
    fn builder_keeps_empty_environments_from_order() {
        let b = PipelineBuilder::new("demo");
        let p = b.freeze(&["dev".to_string()]);
        assert_eq!(p.environments.len(), 1);
        assert!(p.environments[0].charts.is_empty());
    }

    #[test]
    fn charts_sorted_by_name_then_version() {
        let rels = vec![
            release("r2", "ns", Some("demo"), Some("dev"), "redis", "2.0.0"),
            release("p1", "ns", Some("demo"), Some("dev"), "postgresql", "13.0.1"),
            release("r1", "ns", Some("demo"), Some("dev"), "redis", "1.0.0"),
        ];
        let facts = extract_facts(&rels);
        let mut b = PipelineBuilder::new("demo");
        for f in &facts { b.add(f); }
        let p = b.freeze(&["dev".to_string()]);
        let got: Vec<_> = p.environments[0].charts.iter().map(|c| format!("{}@{}", c.name, c.version)).collect();
        assert_eq!(got, vec!["postgresql@13.0.1", "redis@1.0.0", "redis@2.0.0"]);
    }
}
