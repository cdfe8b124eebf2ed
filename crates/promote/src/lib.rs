//! Stagehand promotions: version drift between adjacent environments of a pipeline.
//!
//! A promotion is not necessarily an upgrade; it only records that the environment
//! immediately upstream deploys the same chart at a different version.

#![forbid(unsafe_code)]

use stagehand_core::{ChartIdentity, Environment, Pipeline, Promotion};
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromotionError {
    #[error("pipeline {pipeline}: environment {environment} deploys {chart} at several versions ({versions:?}); cannot choose one to promote")]
    AmbiguousUpstream { pipeline: String, environment: String, chart: String, versions: Vec<String> },
}

/// Adjacent `(upstream, downstream)` environment pairs in pipeline order.
pub fn promotion_pairs(pipeline: &Pipeline) -> impl Iterator<Item = (&Environment, &Environment)> {
    pipeline.environments.windows(2).map(|w| (&w[0], &w[1]))
}

/// Compute the promotions needed to align each environment with the one before it.
pub fn compute_promotions(pipeline: &Pipeline) -> Result<Vec<Promotion>, PromotionError> {
    let mut out = Vec::new();
    for (upstream, downstream) in promotion_pairs(pipeline) {
        for chart in &downstream.charts {
            let Some(target) = find_other_version(pipeline, upstream, chart)? else { continue };
            debug!(pipeline = %pipeline.name, environment = %downstream.name, chart = %chart.name, from = %chart.version, to = %target.version, "promotion found");
            out.push(Promotion {
                environment: downstream.name.clone(),
                from: chart.clone(),
                to: target.clone(),
                promoted_resources: pipeline.resources_of(chart).to_vec(),
            });
        }
    }
    Ok(out)
}

fn find_other_version<'a>(
    pipeline: &Pipeline,
    upstream: &'a Environment,
    chart: &ChartIdentity,
) -> Result<Option<&'a ChartIdentity>, PromotionError> {
    let mut matches = upstream.charts.iter().filter(|c| c.is_other_version_of(chart));
    let Some(first) = matches.next() else { return Ok(None) };
    let rest: Vec<&ChartIdentity> = matches.collect();
    if !rest.is_empty() {
        let versions = std::iter::once(first).chain(rest).map(|c| c.version.clone()).collect();
        return Err(PromotionError::AmbiguousUpstream {
            pipeline: pipeline.name.clone(),
            environment: upstream.name.clone(),
            chart: chart.name.clone(),
            versions,
        });
    }
    Ok(Some(first))
}
