//! Stagehand upgrades: compare deployed charts with their repository index.

#![forbid(unsafe_code)]

pub mod getter;
pub mod index;
mod version;

pub use getter::{HttpGetter, HttpGetterOptions, IndexGetter, IndexGetters};
pub use index::{find_newer_version, ChartEntry, IndexFile};
pub use version::parse_version;

use std::future::Future;
use std::time::Instant;

use metrics::{counter, histogram};
use stagehand_core::{ChartIdentity, ChartUpgrade, Pipeline, SourceRef};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Repository object backing a chart source reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub source: SourceRef,
    /// Advertised URL of the repository's index document.
    pub url: String,
}

/// Resolves chart source references to repository objects.
#[async_trait::async_trait]
pub trait RepositoryLookup: Send + Sync {
    async fn resolve(&self, source: &SourceRef) -> anyhow::Result<Repository>;
}

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("failed to resolve repository {source_ref}: {source:#}")]
    Repository { source_ref: String, source: anyhow::Error },
    #[error("error parsing URL {url:?}: {source}")]
    InvalidUrl { url: String, source: url::ParseError },
    #[error("no provider for scheme {scheme:?} ({url})")]
    UnsupportedScheme { scheme: String, url: String },
    #[error("error fetching index file {url}: {source:#}")]
    Fetch { url: String, source: anyhow::Error },
    #[error("error parsing index file {url}: {source}")]
    MalformedIndex { url: String, source: serde_yaml::Error },
    #[error("index file {url} is missing its format version: no API version specified")]
    NoApiVersion { url: String },
    #[error("failed to parse version {version:?} for chart {chart:?}: {source}")]
    InvalidVersion { chart: String, version: String, source: semver::Error },
    #[error("repository publishes invalid version {version:?} for chart {chart:?}: {source}")]
    InvalidIndexVersion { chart: String, version: String, source: semver::Error },
    #[error("upgrade check cancelled")]
    Cancelled,
}

/// Detects newer chart versions for every chart in a pipeline.
pub struct UpgradeDetector<'a> {
    lookup: &'a dyn RepositoryLookup,
    getters: &'a IndexGetters,
}

impl<'a> UpgradeDetector<'a> {
    pub fn new(lookup: &'a dyn RepositoryLookup, getters: &'a IndexGetters) -> Self {
        Self { lookup, getters }
    }

    /// Check every deployed chart, environment by environment, one at a time.
    ///
    /// The first failure aborts the whole check; no partial results are returned.
    pub async fn identify_upgrades(&self, pipeline: &Pipeline, cancel: &CancellationToken) -> Result<Vec<ChartUpgrade>, UpgradeError> {
        let t0 = Instant::now();
        let mut upgrades = Vec::new();
        let mut checked = 0usize;
        for env in &pipeline.environments {
            for chart in &env.charts {
                let index = self.chart_index(chart, cancel).await?;
                checked += 1;
                if let Some(available) = find_newer_version(chart, &index)? {
                    debug!(pipeline = %pipeline.name, environment = %env.name, chart = %chart.name, current = %chart.version, available = %available.version, "upgrade available");
                    upgrades.push(ChartUpgrade { current: chart.clone(), available });
                }
            }
        }
        info!(pipeline = %pipeline.name, checked, upgrades = upgrades.len(), took_ms = %t0.elapsed().as_millis(), "upgrade check done");
        Ok(upgrades)
    }

    /// Fetch, validate and sort the index of the repository backing `chart`.
    pub async fn chart_index(&self, chart: &ChartIdentity, cancel: &CancellationToken) -> Result<IndexFile, UpgradeError> {
        let repo = cancellable(cancel, self.lookup.resolve(&chart.source))
            .await?
            .map_err(|source| UpgradeError::Repository { source_ref: chart.source.to_string(), source })?;

        let url = Url::parse(&repo.url).map_err(|source| UpgradeError::InvalidUrl { url: repo.url.clone(), source })?;
        let getter = self
            .getters
            .by_scheme(url.scheme())
            .ok_or_else(|| UpgradeError::UnsupportedScheme { scheme: url.scheme().to_string(), url: repo.url.clone() })?;

        let t0 = Instant::now();
        counter!("index_fetch_total", 1u64);
        let fetched = cancellable(cancel, getter.get(&url)).await?;
        histogram!("index_fetch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let bytes = fetched.map_err(|source| {
            counter!("index_fetch_err", 1u64);
            UpgradeError::Fetch { url: url.to_string(), source }
        })?;
        debug!(url = %url, bytes = bytes.len(), "index fetched");

        let mut index = IndexFile::parse(url.as_str(), &bytes)?;
        index.sort_entries();
        Ok(index)
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, UpgradeError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UpgradeError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Convenience wrapper around [`UpgradeDetector::identify_upgrades`].
pub async fn identify_upgrades(
    pipeline: &Pipeline,
    lookup: &dyn RepositoryLookup,
    getters: &IndexGetters,
    cancel: &CancellationToken,
) -> Result<Vec<ChartUpgrade>, UpgradeError> {
    UpgradeDetector::new(lookup, getters).identify_upgrades(pipeline, cancel).await
}
