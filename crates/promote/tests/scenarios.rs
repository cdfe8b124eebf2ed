#![forbid(unsafe_code)]

use smallvec::smallvec;
use stagehand_core::{
    ChartIdentity, ChartRelease, SourceRef, PIPELINE_ENVIRONMENT_AFTER_LABEL, PIPELINE_ENVIRONMENT_LABEL,
    PIPELINE_NAME_LABEL,
};
use stagehand_promote::compute_promotions;
use stagehand_store::{parse_pipelines, LabelTopology};

fn repo() -> SourceRef { SourceRef::new("HelmRepository", "default", "test-repository") }

fn release(name: &str, env: &str, after: &str, chart: &str, version: &str) -> ChartRelease {
    let mut labels = smallvec![
        (PIPELINE_NAME_LABEL.to_string(), "demo-pipeline".to_string()),
        (PIPELINE_ENVIRONMENT_LABEL.to_string(), env.to_string()),
    ];
    if !after.is_empty() {
        labels.push((PIPELINE_ENVIRONMENT_AFTER_LABEL.to_string(), after.to_string()));
    }
    ChartRelease {
        kind: "HelmRelease".to_string(),
        api_version: "helm.toolkit.fluxcd.io/v2beta1".to_string(),
        namespace: env.to_string(),
        name: name.to_string(),
        labels,
        chart: chart.to_string(),
        version: version.to_string(),
        source: repo(),
    }
}

#[test]
fn staging_ahead_of_production_promotes_redis() {
    let rels = vec![
        release("redis-staging", "staging", "", "redis", "1.0.12"),
        release("redis-production", "production", "staging", "redis", "1.0.9"),
    ];
    let pipelines = parse_pipelines(&rels, &LabelTopology).unwrap();
    assert_eq!(pipelines.len(), 1);

    let promotions = compute_promotions(&pipelines[0]).unwrap();
    assert_eq!(promotions.len(), 1);
    let p = &promotions[0];
    assert_eq!(p.environment, "production");
    assert_eq!(p.from, ChartIdentity::new("redis", "1.0.9", repo()));
    assert_eq!(p.to, ChartIdentity::new("redis", "1.0.12", repo()));
    let names: Vec<_> = p.promoted_resources.iter().map(|r| format!("{}/{}", r.namespace, r.name)).collect();
    assert_eq!(names, vec!["production/redis-production"]);
}

#[test]
fn identical_charts_are_not_promoted() {
    let rels = vec![
        release("redis-staging", "staging", "", "redis", "1.0.12"),
        release("pg-staging", "staging", "", "postgresql", "13.0.1"),
        release("redis-production", "production", "staging", "redis", "1.0.9"),
        release("pg-production", "production", "staging", "postgresql", "13.0.1"),
    ];
    let pipelines = parse_pipelines(&rels, &LabelTopology).unwrap();
    let promotions = compute_promotions(&pipelines[0]).unwrap();
    assert_eq!(promotions.len(), 1);
    assert_eq!(promotions[0].from.name, "redis");
}

#[test]
fn chart_only_downstream_is_not_promoted() {
    let rels = vec![
        release("redis-staging", "staging", "", "redis", "1.0.12"),
        release("pg-production", "production", "staging", "postgresql", "13.0.1"),
    ];
    let pipelines = parse_pipelines(&rels, &LabelTopology).unwrap();
    assert!(compute_promotions(&pipelines[0]).unwrap().is_empty());
}

#[test]
fn promotions_match_name_and_source_with_differing_versions() {
    let rels = vec![
        release("a", "dev", "", "redis", "2.0.0"),
        release("b", "dev", "", "postgresql", "14.0.0"),
        release("c", "staging", "dev", "redis", "1.5.0"),
        release("d", "staging", "dev", "postgresql", "14.0.0"),
        release("e", "production", "staging", "redis", "1.0.0"),
        release("f", "production", "staging", "nginx", "1.0.0"),
    ];
    let pipelines = parse_pipelines(&rels, &LabelTopology).unwrap();
    let envs: Vec<_> = pipelines[0].environments.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(envs, vec!["dev", "staging", "production"]);
    for p in compute_promotions(&pipelines[0]).unwrap() {
        assert_eq!(p.from.name, p.to.name);
        assert_eq!(p.from.source, p.to.source);
        assert_ne!(p.from.version, p.to.version);
        assert_ne!(p.environment, "dev");
    }
}

#[test]
fn pipelines_are_identical_for_any_listing_order() {
    let rels = vec![
        release("redis-staging", "staging", "", "redis", "1.0.12"),
        release("pg-staging", "staging", "", "postgresql", "13.0.1"),
        release("redis-staging-2", "staging", "", "redis", "1.0.12"),
        release("redis-production", "production", "staging", "redis", "1.0.9"),
        release("pg-production", "production", "staging", "postgresql", "13.0.0"),
    ];
    let baseline = parse_pipelines(&rels, &LabelTopology).unwrap();
    let baseline_promotions = compute_promotions(&baseline[0]).unwrap();

    let mut rotated = rels.clone();
    for _ in 0..rels.len() {
        rotated.rotate_left(1);
        let mut reversed = rotated.clone();
        reversed.reverse();
        for input in [&rotated, &reversed] {
            let got = parse_pipelines(input, &LabelTopology).unwrap();
            assert_eq!(got, baseline);
            assert_eq!(compute_promotions(&got[0]).unwrap(), baseline_promotions);
        }
    }
}
