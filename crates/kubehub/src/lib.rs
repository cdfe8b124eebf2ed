//! Stagehand kubehub: reads Flux releases, Kustomizations and their sources from the cluster.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::Discovery,
    Client,
};
use serde_json::Value as Json;
use smallvec::SmallVec;
use stagehand_core::{
    ChartRelease, GitReference, GitRepository, GitRepositoryLookup, Kustomization, KustomizationSource, ReleaseSource,
    SourceRef, GIT_REPOSITORY_KIND, PIPELINE_NAME_LABEL,
};
use stagehand_upgrades::{Repository, RepositoryLookup};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub const HELM_RELEASE_GROUP: &str = "helm.toolkit.fluxcd.io";
pub const HELM_RELEASE_KIND: &str = "HelmRelease";
/// Used when discovery does not list the HelmRelease group.
pub const HELM_RELEASE_API_VERSION: &str = "helm.toolkit.fluxcd.io/v2beta1";
pub const HELM_REPOSITORY_KIND: &str = "HelmRepository";
pub const HELM_REPOSITORY_API_VERSION: &str = "source.toolkit.fluxcd.io/v1beta2";
pub const KUSTOMIZATION_GROUP: &str = "kustomize.toolkit.fluxcd.io";
pub const KUSTOMIZATION_KIND: &str = "Kustomization";
/// Used when discovery does not list the Kustomization group.
pub const KUSTOMIZATION_API_VERSION: &str = "kustomize.toolkit.fluxcd.io/v1beta2";
pub const GIT_REPOSITORY_API_VERSION: &str = "source.toolkit.fluxcd.io/v1beta2";

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("creating kube client from current context")
}

/// A kube client built from the current context on first use, then shared by every clone.
#[derive(Clone, Default)]
pub struct SharedClient(Arc<OnceCell<Client>>);

impl SharedClient {
    pub fn new() -> Self { Self::default() }

    /// Use an already built client.
    pub fn from_client(client: Client) -> Self { Self(Arc::new(OnceCell::new_with(Some(client)))) }

    pub async fn get(&self) -> Result<Client> {
        self.0.get_or_try_init(get_kube_client).await.cloned()
    }

    pub fn is_initialized(&self) -> bool { self.0.initialized() }

    pub fn shares_with(&self, other: &SharedClient) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}

/// Split `group/version` (or a bare core `version`) and build an ApiResource for `kind`.
pub fn api_resource_for(api_version: &str, kind: &str) -> Result<ApiResource> {
    let gvk = match api_version.split('/').collect::<Vec<_>>().as_slice() {
        [version] if !version.is_empty() => GroupVersionKind::gvk("", version, kind),
        [group, version] if !group.is_empty() && !version.is_empty() => GroupVersionKind::gvk(group, version, kind),
        _ => return Err(anyhow!("invalid apiVersion {:?} for kind {}", api_version, kind)),
    };
    Ok(ApiResource::from_gvk(&gvk))
}

/// Preferred served version of `kind` in `group`, if the cluster serves it.
async fn discover_kind(client: Client, group: &str, kind: &str) -> Result<Option<ApiResource>> {
    let discovery = Discovery::new(client).filter(&[group]).run().await?;
    for g in discovery.groups() {
        if g.name() != group {
            continue;
        }
        if let Some((ar, _caps)) = g.recommended_kind(kind) {
            return Ok(Some(ar));
        }
    }
    Ok(None)
}

fn str_at<'a>(v: &'a Json, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for p in path {
        cur = cur.get(*p)?;
    }
    cur.as_str()
}

fn labels_of(raw: &Json) -> SmallVec<[(String, String); 8]> {
    let mut labels = SmallVec::new();
    if let Some(map) = raw.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.as_object()) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                labels.push((k.clone(), s.to_string()));
            }
        }
    }
    labels
}

/// Convert a raw HelmRelease object into a [`ChartRelease`].
///
/// `apiVersion`/`kind` in the object win over the fallbacks (list items usually omit them).
/// A missing chart version means "latest" to Flux and is kept as `*`; a source reference
/// without a namespace points into the release's own namespace.
pub fn release_from_raw(raw: &Json, api_version: &str, kind: &str) -> Result<ChartRelease> {
    let name = str_at(raw, &["metadata", "name"]).ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let namespace = str_at(raw, &["metadata", "namespace"]).unwrap_or("default");
    let spec = raw
        .get("spec")
        .and_then(|s| s.get("chart"))
        .and_then(|c| c.get("spec"))
        .ok_or_else(|| anyhow!("{}/{}: missing spec.chart.spec", namespace, name))?;
    let chart = str_at(spec, &["chart"]).ok_or_else(|| anyhow!("{}/{}: missing spec.chart.spec.chart", namespace, name))?;
    let version = str_at(spec, &["version"]).filter(|v| !v.is_empty()).unwrap_or("*");
    let source_ref = spec.get("sourceRef").ok_or_else(|| anyhow!("{}/{}: missing spec.chart.spec.sourceRef", namespace, name))?;
    let source = SourceRef {
        kind: str_at(source_ref, &["kind"]).unwrap_or(HELM_REPOSITORY_KIND).to_string(),
        namespace: str_at(source_ref, &["namespace"]).filter(|s| !s.is_empty()).unwrap_or(namespace).to_string(),
        name: str_at(source_ref, &["name"]).ok_or_else(|| anyhow!("{}/{}: sourceRef missing name", namespace, name))?.to_string(),
        api_version: str_at(source_ref, &["apiVersion"]).unwrap_or("").to_string(),
    };

    Ok(ChartRelease {
        kind: str_at(raw, &["kind"]).unwrap_or(kind).to_string(),
        api_version: str_at(raw, &["apiVersion"]).unwrap_or(api_version).to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        labels: labels_of(raw),
        chart: chart.to_string(),
        version: version.to_string(),
        source,
    })
}

/// List HelmReleases carrying the pipeline-name label.
pub async fn list_releases(client: Client, namespace: Option<&str>) -> Result<Vec<ChartRelease>> {
    let ar = match discover_kind(client.clone(), HELM_RELEASE_GROUP, HELM_RELEASE_KIND).await {
        Ok(Some(ar)) => ar,
        Ok(None) => {
            warn!(group = HELM_RELEASE_GROUP, "HelmRelease not served; using default version");
            api_resource_for(HELM_RELEASE_API_VERSION, HELM_RELEASE_KIND)?
        }
        Err(e) => return Err(e.context("discovering HelmRelease resource")),
    };
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    let lp = ListParams::default().labels(PIPELINE_NAME_LABEL);
    let list = api.list(&lp).await.context("failed to list helm releases")?;
    let mut out = Vec::with_capacity(list.items.len());
    for obj in list.items.iter() {
        let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
        out.push(release_from_raw(&raw, &ar.api_version, &ar.kind)?);
    }
    info!(count = out.len(), ns = ?namespace, version = %ar.version, "helm releases listed");
    Ok(out)
}

/// Release source backed by the current kube context.
#[derive(Clone, Default)]
pub struct KubeReleaseSource {
    pub namespace: Option<String>,
    client: SharedClient,
}

impl KubeReleaseSource {
    pub fn new(namespace: Option<String>, client: SharedClient) -> Self { Self { namespace, client } }
}

#[async_trait::async_trait]
impl ReleaseSource for KubeReleaseSource {
    async fn list_releases(&self) -> Result<Vec<ChartRelease>> {
        let client = self.client.get().await?;
        list_releases(client, self.namespace.as_deref()).await
    }
}

/// Read `status.url` from a raw HelmRepository object.
pub fn repository_url_from_raw(raw: &Json) -> Result<String> {
    match str_at(raw, &["status", "url"]) {
        Some(url) if !url.trim().is_empty() => Ok(url.to_string()),
        _ => Err(anyhow!("repository has no status.url (not reconciled yet?)")),
    }
}

/// Resolves HelmRepository source references through the cluster.
#[derive(Clone, Default)]
pub struct KubeRepositoryLookup {
    client: SharedClient,
}

impl KubeRepositoryLookup {
    pub fn new(client: SharedClient) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl RepositoryLookup for KubeRepositoryLookup {
    async fn resolve(&self, source: &SourceRef) -> Result<Repository> {
        if source.kind != HELM_REPOSITORY_KIND {
            return Err(anyhow!("unsupported source kind {} (only {} is supported)", source.kind, HELM_REPOSITORY_KIND));
        }
        let api_version = if source.api_version.is_empty() { HELM_REPOSITORY_API_VERSION } else { source.api_version.as_str() };
        let ar = api_resource_for(api_version, &source.kind)?;
        let client = self.client.get().await?;
        let api: Api<DynamicObject> = Api::namespaced_with(client, &source.namespace, &ar);
        let obj = api.get(&source.name).await.with_context(|| format!("getting {}", source))?;
        let raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
        let url = repository_url_from_raw(&raw).with_context(|| format!("{}", source))?;
        debug!(source = %source, url = %url, "repository resolved");
        Ok(Repository { source: source.clone(), url })
    }
}

/// Convert a raw Kustomization object into a [`Kustomization`].
///
/// A source reference without a namespace points into the Kustomization's own namespace.
pub fn kustomization_from_raw(raw: &Json, api_version: &str, kind: &str) -> Result<Kustomization> {
    let name = str_at(raw, &["metadata", "name"]).ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let namespace = str_at(raw, &["metadata", "namespace"]).unwrap_or("default");
    let spec = raw.get("spec").ok_or_else(|| anyhow!("{}/{}: missing spec", namespace, name))?;
    let source_ref = spec.get("sourceRef").ok_or_else(|| anyhow!("{}/{}: missing spec.sourceRef", namespace, name))?;
    let source = SourceRef {
        kind: str_at(source_ref, &["kind"]).unwrap_or(GIT_REPOSITORY_KIND).to_string(),
        namespace: str_at(source_ref, &["namespace"]).filter(|s| !s.is_empty()).unwrap_or(namespace).to_string(),
        name: str_at(source_ref, &["name"]).ok_or_else(|| anyhow!("{}/{}: sourceRef missing name", namespace, name))?.to_string(),
        api_version: str_at(source_ref, &["apiVersion"]).unwrap_or("").to_string(),
    };
    Ok(Kustomization {
        kind: str_at(raw, &["kind"]).unwrap_or(kind).to_string(),
        api_version: str_at(raw, &["apiVersion"]).unwrap_or(api_version).to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        labels: labels_of(raw),
        path: str_at(spec, &["path"]).unwrap_or("").to_string(),
        source,
    })
}

/// List Kustomizations carrying the pipeline-name label.
pub async fn list_kustomizations(client: Client, namespace: Option<&str>) -> Result<Vec<Kustomization>> {
    let ar = match discover_kind(client.clone(), KUSTOMIZATION_GROUP, KUSTOMIZATION_KIND).await {
        Ok(Some(ar)) => ar,
        Ok(None) => {
            warn!(group = KUSTOMIZATION_GROUP, "Kustomization not served; using default version");
            api_resource_for(KUSTOMIZATION_API_VERSION, KUSTOMIZATION_KIND)?
        }
        Err(e) => return Err(e.context("discovering Kustomization resource")),
    };
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    let lp = ListParams::default().labels(PIPELINE_NAME_LABEL);
    let list = api.list(&lp).await.context("failed to list kustomizations")?;
    let mut out = Vec::with_capacity(list.items.len());
    for obj in list.items.iter() {
        let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
        out.push(kustomization_from_raw(&raw, &ar.api_version, &ar.kind)?);
    }
    info!(count = out.len(), ns = ?namespace, version = %ar.version, "kustomizations listed");
    Ok(out)
}

/// Kustomization source backed by the current kube context.
#[derive(Clone, Default)]
pub struct KubeKustomizationSource {
    pub namespace: Option<String>,
    client: SharedClient,
}

impl KubeKustomizationSource {
    pub fn new(namespace: Option<String>, client: SharedClient) -> Self { Self { namespace, client } }
}

#[async_trait::async_trait]
impl KustomizationSource for KubeKustomizationSource {
    async fn list_kustomizations(&self) -> Result<Vec<Kustomization>> {
        let client = self.client.get().await?;
        list_kustomizations(client, self.namespace.as_deref()).await
    }
}

/// Read `spec.url` and `spec.ref` from a raw GitRepository object.
pub fn git_repository_from_raw(raw: &Json) -> Result<GitRepository> {
    let url = str_at(raw, &["spec", "url"]).ok_or_else(|| anyhow!("GitRepository missing spec.url"))?;
    let reference = match raw.get("spec").and_then(|s| s.get("ref")) {
        Some(r) if !r.is_null() => Some(serde_json::from_value::<GitReference>(r.clone()).context("parsing spec.ref")?),
        _ => None,
    };
    Ok(GitRepository { url: url.to_string(), reference })
}

/// Resolves GitRepository source references through the cluster.
#[derive(Clone, Default)]
pub struct KubeGitRepositoryLookup {
    client: SharedClient,
}

impl KubeGitRepositoryLookup {
    pub fn new(client: SharedClient) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl GitRepositoryLookup for KubeGitRepositoryLookup {
    async fn resolve(&self, source: &SourceRef) -> Result<Option<GitRepository>> {
        let api_version = if source.api_version.is_empty() { GIT_REPOSITORY_API_VERSION } else { source.api_version.as_str() };
        let ar = api_resource_for(api_version, GIT_REPOSITORY_KIND)?;
        let client = self.client.get().await?;
        let api: Api<DynamicObject> = Api::namespaced_with(client, &source.namespace, &ar);
        let Some(obj) = api.get_opt(&source.name).await.with_context(|| format!("getting {}", source))? else {
            return Ok(None);
        };
        let raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
        let repo = git_repository_from_raw(&raw).with_context(|| format!("{}", source))?;
        debug!(source = %source, url = %repo.url, "git repository resolved");
        Ok(Some(repo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::{PipelineMember, PIPELINE_ENVIRONMENT_LABEL, PIPELINE_NAME_LABEL};

    fn helm_release(version: Option<&str>, source_ns: Option<&str>) -> Json {
        let mut chart_spec = serde_json::json!({
            "chart": "redis",
            "sourceRef": { "kind": "HelmRepository", "name": "test-repository" }
        });
        if let Some(v) = version { chart_spec["version"] = Json::String(v.to_string()); }
        if let Some(ns) = source_ns { chart_spec["sourceRef"]["namespace"] = Json::String(ns.to_string()); }
        serde_json::json!({
            "metadata": {
                "name": "redis-production",
                "namespace": "production",
                "labels": {
                    PIPELINE_NAME_LABEL: "demo-pipeline",
                    PIPELINE_ENVIRONMENT_LABEL: "production"
                }
            },
            "spec": { "interval": "1m", "chart": { "spec": chart_spec } }
        })
    }

    #[test]
    fn converts_helm_release() {
        let rel = release_from_raw(&helm_release(Some("1.0.9"), Some("default")), HELM_RELEASE_API_VERSION, HELM_RELEASE_KIND).unwrap();
        assert_eq!(rel.name, "redis-production");
        assert_eq!(rel.namespace, "production");
        assert_eq!(rel.kind, "HelmRelease");
        assert_eq!(rel.api_version, HELM_RELEASE_API_VERSION);
        assert_eq!(rel.chart, "redis");
        assert_eq!(rel.version, "1.0.9");
        assert_eq!(rel.source, SourceRef::new("HelmRepository", "default", "test-repository"));
        assert_eq!(rel.label(PIPELINE_NAME_LABEL), Some("demo-pipeline"));
        assert_eq!(rel.label(PIPELINE_ENVIRONMENT_LABEL), Some("production"));
    }

    #[test]
    fn source_namespace_defaults_to_release_namespace() {
        let rel = release_from_raw(&helm_release(None, None), HELM_RELEASE_API_VERSION, HELM_RELEASE_KIND).unwrap();
        assert_eq!(rel.source.namespace, "production");
        assert_eq!(rel.version, "*");
    }

    #[test]
    fn object_type_meta_wins_over_fallback() {
        let mut raw = helm_release(Some("1.0.9"), None);
        raw["apiVersion"] = Json::String("helm.toolkit.fluxcd.io/v2".into());
        raw["kind"] = Json::String("HelmRelease".into());
        let rel = release_from_raw(&raw, HELM_RELEASE_API_VERSION, HELM_RELEASE_KIND).unwrap();
        assert_eq!(rel.api_version, "helm.toolkit.fluxcd.io/v2");
    }

    #[test]
    fn missing_chart_spec_is_an_error() {
        let raw = serde_json::json!({ "metadata": { "name": "x", "namespace": "y" }, "spec": {} });
        assert!(release_from_raw(&raw, HELM_RELEASE_API_VERSION, HELM_RELEASE_KIND).is_err());
    }

    #[test]
    fn repository_url_requires_status() {
        let ok = serde_json::json!({ "status": { "url": "http://charts.example/index.yaml" } });
        assert_eq!(repository_url_from_raw(&ok).unwrap(), "http://charts.example/index.yaml");
        assert!(repository_url_from_raw(&serde_json::json!({ "status": { "url": "" } })).is_err());
        assert!(repository_url_from_raw(&serde_json::json!({})).is_err());
    }

    #[test]
    fn api_resource_for_splits_group_version() {
        let ar = api_resource_for("source.toolkit.fluxcd.io/v1beta2", "HelmRepository").unwrap();
        assert_eq!(ar.group, "source.toolkit.fluxcd.io");
        assert_eq!(ar.version, "v1beta2");
        assert_eq!(ar.plural, "helmrepositories");
        let core = api_resource_for("v1", "ConfigMap").unwrap();
        assert_eq!(core.group, "");
        assert!(api_resource_for("a/b/c", "X").is_err());
        assert!(api_resource_for("", "X").is_err());
    }

    #[test]
    fn converts_kustomization() {
        let raw = serde_json::json!({
            "metadata": {
                "name": "production-deploys",
                "namespace": "production",
                "labels": { PIPELINE_NAME_LABEL: "demo-pipeline", PIPELINE_ENVIRONMENT_LABEL: "production" }
            },
            "spec": { "path": "./testing", "sourceRef": { "kind": "GitRepository", "name": "test-repo" } }
        });
        let k = kustomization_from_raw(&raw, KUSTOMIZATION_API_VERSION, KUSTOMIZATION_KIND).unwrap();
        assert_eq!(k.path, "./testing");
        assert_eq!(k.kind, KUSTOMIZATION_KIND);
        assert_eq!(k.source, SourceRef::new("GitRepository", "production", "test-repo"));
        assert_eq!(k.label(PIPELINE_ENVIRONMENT_LABEL), Some("production"));
    }

    #[test]
    fn git_repository_reads_url_and_ref() {
        let raw = serde_json::json!({
            "spec": { "url": "https://github.com/example/example.git", "ref": { "branch": "main" } }
        });
        let repo = git_repository_from_raw(&raw).unwrap();
        assert_eq!(repo.url, "https://github.com/example/example.git");
        assert_eq!(repo.reference, Some(GitReference { branch: Some("main".into()), ..Default::default() }));

        let no_ref = git_repository_from_raw(&serde_json::json!({ "spec": { "url": "https://x" } })).unwrap();
        assert!(no_ref.reference.is_none());
        assert!(git_repository_from_raw(&serde_json::json!({ "spec": {} })).is_err());
    }

    #[test]
    fn collaborators_share_one_lazily_built_client() {
        let shared = SharedClient::new();
        let releases = KubeReleaseSource::new(None, shared.clone());
        let repos = KubeRepositoryLookup::new(shared.clone());
        assert!(releases.client.shares_with(&repos.client));
        assert!(releases.client.shares_with(&shared));
        assert!(!shared.is_initialized());
        assert!(!SharedClient::new().shares_with(&shared));
    }
}
