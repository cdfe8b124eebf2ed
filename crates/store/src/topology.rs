use std::collections::{BTreeMap, BTreeSet};

use stagehand_core::{
    PipelineMember, Topology, TopologyError, TopologyResolver, PIPELINE_ENVIRONMENT_AFTER_LABEL,
    PIPELINE_ENVIRONMENT_LABEL, PIPELINE_NAME_LABEL,
};

/// Orders environments by their `environment-after` label.
///
/// Roots (no predecessor, or a predecessor nobody deploys to) come first; ties are
/// broken by environment name so the result does not depend on listing order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelTopology;

impl LabelTopology {
    pub fn new() -> Self { Self }
}

impl TopologyResolver for LabelTopology {
    fn resolve(&self, members: &[&dyn PipelineMember]) -> Result<Topology, TopologyError> {
        // pipeline -> env -> predecessor
        let mut graph: BTreeMap<String, BTreeMap<String, Option<String>>> = BTreeMap::new();
        for rel in members {
            let (Some(pipeline), Some(env)) = (rel.label(PIPELINE_NAME_LABEL), rel.label(PIPELINE_ENVIRONMENT_LABEL)) else {
                continue;
            };
            let after = rel.label(PIPELINE_ENVIRONMENT_AFTER_LABEL).map(str::to_string);
            let slot = graph.entry(pipeline.to_string()).or_default().entry(env.to_string()).or_insert(None);
            if let Some(second) = after {
                match slot {
                    Some(first) if *first != second => {
                        return Err(TopologyError::ConflictingPredecessor {
                            pipeline: pipeline.to_string(),
                            environment: env.to_string(),
                            first: first.clone(),
                            second,
                        });
                    }
                    _ => *slot = Some(second),
                }
            }
        }

        let mut out = Topology::new();
        for (pipeline, envs) in graph {
            let order = order_environments(&pipeline, &envs)?;
            out.insert(pipeline, order);
        }
        Ok(out)
    }
}

fn order_environments(pipeline: &str, envs: &BTreeMap<String, Option<String>>) -> Result<Vec<String>, TopologyError> {
    let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    for (env, after) in envs {
        let known = after.as_deref().filter(|a| envs.contains_key(*a) && *a != env.as_str());
        match known {
            Some(pred) => {
                successors.entry(pred).or_default().push(env.as_str());
                pending.insert(env.as_str(), 1);
            }
            None => { pending.insert(env.as_str(), 0); }
        }
    }

    let mut ready: BTreeSet<&str> = pending.iter().filter(|(_, n)| **n == 0).map(|(e, _)| *e).collect();
    let mut order = Vec::with_capacity(envs.len());
    while let Some(env) = ready.pop_first() {
        order.push(env.to_string());
        for next in successors.get(env).into_iter().flatten() {
            if let Some(n) = pending.get_mut(next) {
                *n -= 1;
                if *n == 0 { ready.insert(*next); }
            }
        }
    }

    if order.len() < envs.len() {
        let stuck = pending
            .iter()
            .find(|(_, n)| **n > 0)
            .map(|(e, _)| e.to_string())
            .unwrap_or_default();
        return Err(TopologyError::Cycle { pipeline: pipeline.to_string(), environment: stuck });
    }
    Ok(order)
}
