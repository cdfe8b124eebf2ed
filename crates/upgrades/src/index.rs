//! Chart repository index (`index.yaml`) model and newest-version selection.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use semver::Version;
use serde::{Deserialize, Serialize};
use stagehand_core::ChartIdentity;

use crate::version::parse_version;
use crate::UpgradeError;

/// Published catalog of a chart repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFile {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub generated: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ChartEntry>>,
}

/// One published version of a chart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartEntry {
    pub version: String,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}

impl IndexFile {
    /// Parse an index document; a document without `apiVersion` is rejected.
    pub fn parse(url: &str, bytes: &[u8]) -> Result<Self, UpgradeError> {
        let index: IndexFile = serde_yaml::from_slice(bytes)
            .map_err(|source| UpgradeError::MalformedIndex { url: url.to_string(), source })?;
        if index.api_version.trim().is_empty() {
            return Err(UpgradeError::NoApiVersion { url: url.to_string() });
        }
        Ok(index)
    }

    /// Sort every chart's entries newest first by precedence; unparseable versions sink to the end.
    ///
    /// Entries differing only in build metadata keep their published order.
    pub fn sort_entries(&mut self) {
        for versions in self.entries.values_mut() {
            versions.sort_by(|a, b| match (parse_version(&a.version), parse_version(&b.version)) {
                (Ok(va), Ok(vb)) => vb.cmp_precedence(&va),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => a.version.cmp(&b.version),
            });
        }
    }

    pub fn versions_of(&self, chart: &str) -> &[ChartEntry] {
        self.entries.get(chart).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Highest version of `chart` published in `index` that is strictly newer than the deployed one.
///
/// Versions compare by semver precedence, so build metadata never makes a version newer.
/// Any unparseable version, deployed or published, fails the lookup.
pub fn find_newer_version(chart: &ChartIdentity, index: &IndexFile) -> Result<Option<ChartIdentity>, UpgradeError> {
    let current = parse_version(&chart.version).map_err(|source| UpgradeError::InvalidVersion {
        chart: chart.name.clone(),
        version: chart.version.clone(),
        source,
    })?;
    let mut best: Option<Version> = None;
    for entry in index.versions_of(&chart.name) {
        let v = parse_version(&entry.version).map_err(|source| UpgradeError::InvalidIndexVersion {
            chart: chart.name.clone(),
            version: entry.version.clone(),
            source,
        })?;
        if v.cmp_precedence(&current) != Ordering::Greater {
            continue;
        }
        if best.as_ref().map_or(true, |b| v.cmp_precedence(b) == Ordering::Greater) {
            best = Some(v);
        }
    }
    Ok(best.map(|v| ChartIdentity {
        name: chart.name.clone(),
        version: v.to_string(),
        source: chart.source.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::SourceRef;

    const INDEX: &str = r#"
apiVersion: v1
entries:
  test-service:
    - version: 1.0.1
      appVersion: "1.0"
      urls: [test-service-1.0.1.tgz]
    - version: 1.1.2
      urls: [test-service-1.1.2.tgz]
    - version: 1.0.12
  other:
    - version: 9.9.9
generated: "2022-06-01T00:00:00Z"
"#;

    fn chart(name: &str, version: &str) -> ChartIdentity {
        ChartIdentity::new(name, version, SourceRef::new("HelmRepository", "testing", "testing"))
    }

    #[test]
    fn picks_the_highest_newer_version() {
        let idx = IndexFile::parse("mem://index.yaml", INDEX.as_bytes()).unwrap();
        let got = find_newer_version(&chart("test-service", "1.0.1"), &idx).unwrap().unwrap();
        assert_eq!(got, chart("test-service", "1.1.2"));
    }

    #[test]
    fn no_upgrade_when_current_is_latest_or_ahead() {
        let idx = IndexFile::parse("mem://index.yaml", INDEX.as_bytes()).unwrap();
        assert_eq!(find_newer_version(&chart("test-service", "1.1.2"), &idx).unwrap(), None);
        assert_eq!(find_newer_version(&chart("test-service", "2.0.0"), &idx).unwrap(), None);
        assert_eq!(find_newer_version(&chart("missing", "1.0.0"), &idx).unwrap(), None);
    }

    #[test]
    fn compares_by_precedence() {
        let idx = IndexFile::parse("mem://index.yaml", INDEX.as_bytes()).unwrap();
        let got = find_newer_version(&chart("test-service", "1.0.9"), &idx).unwrap().unwrap();
        assert_eq!(got.version, "1.1.2");
    }

    #[test]
    fn missing_api_version_is_rejected() {
        let err = IndexFile::parse("mem://index.yaml", b"entries: {}\n").unwrap_err();
        assert!(matches!(err, UpgradeError::NoApiVersion { .. }));
    }

    #[test]
    fn non_index_document_is_malformed() {
        let err = IndexFile::parse("mem://index.yaml", b"<html>not found</html>").unwrap_err();
        assert!(matches!(err, UpgradeError::MalformedIndex { .. }));
    }

    #[test]
    fn malformed_current_version_fails() {
        let idx = IndexFile::parse("mem://index.yaml", INDEX.as_bytes()).unwrap();
        let err = find_newer_version(&chart("test-service", "latest"), &idx).unwrap_err();
        assert!(matches!(err, UpgradeError::InvalidVersion { ref chart, .. } if chart == "test-service"));
    }

    #[test]
    fn malformed_published_version_fails_the_chart() {
        let doc = "apiVersion: v1\nentries:\n  web:\n    - version: 2.0.0\n    - version: not-a-version\n";
        let idx = IndexFile::parse("mem://index.yaml", doc.as_bytes()).unwrap();
        let err = find_newer_version(&chart("web", "1.0.0"), &idx).unwrap_err();
        assert!(matches!(err, UpgradeError::InvalidIndexVersion { ref version, .. } if version == "not-a-version"));
    }

    #[test]
    fn build_metadata_alone_is_not_an_upgrade() {
        let doc = "apiVersion: v1\nentries:\n  web:\n    - version: 1.0.1+build.7\n    - version: 1.0.1\n";
        let idx = IndexFile::parse("mem://index.yaml", doc.as_bytes()).unwrap();
        assert_eq!(find_newer_version(&chart("web", "1.0.1"), &idx).unwrap(), None);
        assert_eq!(find_newer_version(&chart("web", "1.0.1+build.3"), &idx).unwrap(), None);
    }

    #[test]
    fn build_metadata_does_not_pick_among_equal_versions() {
        let doc = "apiVersion: v1\nentries:\n  web:\n    - version: 1.2.0+a\n    - version: 1.2.0+z\n    - version: 1.1.0\n";
        let mut idx = IndexFile::parse("mem://index.yaml", doc.as_bytes()).unwrap();
        let got = find_newer_version(&chart("web", "1.0.0"), &idx).unwrap().unwrap();
        assert_eq!(got.version, "1.2.0+a");
        idx.sort_entries();
        let order: Vec<_> = idx.versions_of("web").iter().map(|e| e.version.as_str()).collect();
        assert_eq!(order, vec!["1.2.0+a", "1.2.0+z", "1.1.0"]);
    }

    #[test]
    fn reports_the_normalized_version() {
        let doc = "apiVersion: v1\nentries:\n  web:\n    - version: v2.1\n    - version: 1.0.0\n";
        let idx = IndexFile::parse("mem://index.yaml", doc.as_bytes()).unwrap();
        let got = find_newer_version(&chart("web", "1.0.0"), &idx).unwrap().unwrap();
        assert_eq!(got.version, "2.1.0");
    }

    #[test]
    fn sort_entries_puts_newest_first() {
        let mut idx = IndexFile::parse("mem://index.yaml", INDEX.as_bytes()).unwrap();
        idx.sort_entries();
        let got: Vec<_> = idx.versions_of("test-service").iter().map(|e| e.version.as_str()).collect();
        assert_eq!(got, vec!["1.1.2", "1.0.12", "1.0.1"]);
    }
}
