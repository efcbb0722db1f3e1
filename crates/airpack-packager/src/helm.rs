//! Helm chart sources that are not plain directories
//!
//! - chart repositories: `index.yaml` lists every chart version and where
//!   its archive lives
//! - OCI charts: `oci://registry/path/chart`, tagged with the chart version

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

use airpack_core::ChartSpec;
use airpack_core::checksums::hash_file;
use airpack_oci::{OCI_SCHEME, OciReference, Registry, fetch_blob_to};

use crate::error::{PackagerError, Result};
use crate::resolver::HttpFetcher;

/// Layer media type of a Helm chart stored in a registry
pub const HELM_CHART_LAYER: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

/// `index.yaml` of a chart repository
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartIndex {
    #[serde(default)]
    pub api_version: String,

    /// Chart versions by chart name
    #[serde(default)]
    pub entries: HashMap<String, Vec<ChartVersion>>,
}

/// One version of a chart in a repository index
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChartVersion {
    #[serde(default)]
    pub name: String,

    pub version: String,

    /// Archive locations, absolute or relative to the repository
    #[serde(default)]
    pub urls: Vec<String>,

    /// sha256 of the archive
    #[serde(default)]
    pub digest: Option<String>,
}

impl ChartIndex {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PackagerError::config(format!("invalid chart repository index: {}", e)))
    }

    /// Entry of `name` at exactly `version`; a leading `v` is ignored on both sides
    pub fn get_version(&self, name: &str, version: &str) -> Option<&ChartVersion> {
        let wanted = version.trim_start_matches('v');
        self.entries
            .get(name)?
            .iter()
            .find(|e| e.version.trim_start_matches('v') == wanted)
    }
}

impl ChartVersion {
    /// First archive URL, resolved against the repository URL
    pub fn download_url(&self, repo_url: &str) -> Result<String> {
        let url = self.urls.first().ok_or_else(|| {
            PackagerError::config(format!("chart {} {} has no download URL", self.name, self.version))
        })?;
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.clone());
        }
        let base = Url::parse(&format!("{}/", repo_url.trim_end_matches('/'))).map_err(|e| {
            PackagerError::config(format!("invalid chart repository URL {}: {}", repo_url, e))
        })?;
        base.join(url)
            .map(|u| u.to_string())
            .map_err(|e| PackagerError::config(format!("invalid chart URL {}: {}", url, e)))
    }
}

/// URL of the index of a chart repository
pub fn index_url(repo_url: &str) -> String {
    format!("{}/index.yaml", repo_url.trim_end_matches('/'))
}

pub fn is_oci_chart(chart: &ChartSpec) -> bool {
    chart.url.starts_with(OCI_SCHEME)
}

/// Name of the chart inside its repository
fn repo_chart_name(chart: &ChartSpec) -> &str {
    if chart.repo_name.is_empty() {
        &chart.name
    } else {
        &chart.repo_name
    }
}

fn require_version(chart: &ChartSpec) -> Result<&str> {
    if chart.version.is_empty() {
        return Err(PackagerError::config(format!(
            "chart {} from {} needs a version",
            chart.name, chart.url
        )));
    }
    Ok(&chart.version)
}

fn chart_output(chart: &ChartSpec, version: &str, charts_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(charts_dir).map_err(|e| PackagerError::io(charts_dir, e))?;
    Ok(charts_dir.join(format!("{}-{}.tgz", chart.name, version)))
}

/// Download a chart version listed in a repository index into `charts_dir`
pub async fn pull_repo_chart(http: &HttpFetcher, chart: &ChartSpec, charts_dir: &Path) -> Result<PathBuf> {
    let version = require_version(chart)?;
    let name = repo_chart_name(chart);

    let url = index_url(&chart.url);
    let data = http.fetch_bytes(&url).await?;
    let text = std::str::from_utf8(&data)
        .map_err(|e| PackagerError::config(format!("index {} is not UTF-8: {}", url, e)))?;
    let index = ChartIndex::from_yaml(text)?;

    let entry = index.get_version(name, version).ok_or_else(|| {
        PackagerError::config(format!(
            "chart {} version {} not found in {}",
            name, version, chart.url
        ))
    })?;
    let download = entry.download_url(&chart.url)?;
    let output = chart_output(chart, version, charts_dir)?;
    http.download(&download, &output).await?;

    if let Some(expected) = entry.digest.as_deref().filter(|d| !d.is_empty()) {
        let expected = expected.trim_start_matches("sha256:");
        let actual = hash_file(&output)?;
        if !actual.eq_ignore_ascii_case(expected) {
            let _ = std::fs::remove_file(&output);
            return Err(PackagerError::IntegrityCheckFailed {
                source_ref: download,
                expected: expected.to_string(),
                actual,
            });
        }
    }
    tracing::debug!(chart = %name, version, url = %download, "pulled chart from repository");
    Ok(output)
}

/// Pull a chart stored in a registry into `charts_dir`
///
/// The reference tag defaults to the chart version.
pub async fn pull_oci_chart(registry: &dyn Registry, chart: &ChartSpec, charts_dir: &Path) -> Result<PathBuf> {
    let mut reference = OciReference::parse(&chart.url)?;
    let version = match (&reference.tag, chart.version.is_empty()) {
        (_, false) => chart.version.clone(),
        (Some(tag), true) => tag.clone(),
        (None, true) => require_version(chart)?.to_string(),
    };
    if reference.tag.is_none() && reference.digest.is_none() {
        reference = reference.with_tag(&version);
    }

    let remote = registry.fetch_manifest(&reference).await?;
    let layer = remote
        .manifest
        .layers
        .iter()
        .find(|l| l.media_type == HELM_CHART_LAYER)
        .ok_or_else(|| {
            PackagerError::config(format!("{} is not a Helm chart", reference))
        })?;

    let output = chart_output(chart, &version, charts_dir)?;
    if output.exists() {
        std::fs::remove_file(&output).map_err(|e| PackagerError::io(&output, e))?;
    }
    fetch_blob_to(registry, &reference, layer, &output).await?;
    tracing::debug!(chart = %chart.name, reference = %reference, "pulled chart from registry");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
apiVersion: v1
entries:
  podinfo:
    - name: podinfo
      version: 6.4.0
      urls:
        - podinfo-6.4.0.tgz
      digest: abc
    - name: podinfo
      version: 6.3.0
      urls:
        - https://cdn.example.com/podinfo-6.3.0.tgz
"#;

    #[test]
    fn test_index_lookup() {
        let index = ChartIndex::from_yaml(INDEX).unwrap();
        assert_eq!(index.get_version("podinfo", "6.4.0").unwrap().digest.as_deref(), Some("abc"));
        assert!(index.get_version("podinfo", "v6.3.0").is_some());
        assert!(index.get_version("podinfo", "1.0.0").is_none());
        assert!(index.get_version("redis", "6.4.0").is_none());
    }

    #[test]
    fn test_download_url_resolution() {
        let index = ChartIndex::from_yaml(INDEX).unwrap();
        let relative = index.get_version("podinfo", "6.4.0").unwrap();
        assert_eq!(
            relative.download_url("https://charts.example.com/stable/").unwrap(),
            "https://charts.example.com/stable/podinfo-6.4.0.tgz"
        );
        let absolute = index.get_version("podinfo", "6.3.0").unwrap();
        assert_eq!(
            absolute.download_url("https://charts.example.com").unwrap(),
            "https://cdn.example.com/podinfo-6.3.0.tgz"
        );
        assert_eq!(index_url("https://charts.example.com/"), "https://charts.example.com/index.yaml");
    }

    #[test]
    fn test_repo_chart_name() {
        let chart = ChartSpec {
            name: "web".to_string(),
            repo_name: "podinfo".to_string(),
            ..Default::default()
        };
        assert_eq!(repo_chart_name(&chart), "podinfo");
    }
}
