//! External collaborators of the build
//!
//! Git, kustomize, chart packaging and SBOM cataloging sit behind traits so
//! the pipeline can be driven without those tools installed. The defaults
//! shell out to `git` and `kustomize`, package local charts directly and
//! write a file inventory as the SBOM.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use airpack_core::archive::{archive_dir, create_package_archive};
use airpack_core::checksums::hash_file;
use airpack_core::{ChartSpec, ImageRef};

use airpack_oci::Registry;

use crate::error::{PackagerError, Result};
use crate::helm::{is_oci_chart, pull_oci_chart, pull_repo_chart};
use crate::resolver::{HttpFetcher, is_url};

/// Clones git repositories
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Clone `url` into `dest`, checked out at `reference` when given
    async fn clone_repo(&self, url: &str, reference: Option<&str>, dest: &Path) -> Result<()>;
}

/// Renders kustomizations
#[async_trait]
pub trait KustomizeBuilder: Send + Sync {
    /// Build the kustomization in `dir` into a single YAML file at `dest`
    async fn build(&self, dir: &Path, dest: &Path, allow_any_directory: bool) -> Result<()>;
}

/// Packages Helm charts
#[async_trait]
pub trait ChartPackager: Send + Sync {
    /// Package `chart` into `charts_dir`, returning the archive path
    async fn package(&self, chart: &ChartSpec, base: &Path, charts_dir: &Path) -> Result<PathBuf>;
}

/// Produces the SBOM catalog of a package
#[async_trait]
pub trait SbomCataloger: Send + Sync {
    /// Catalog component files and images into the tarball at `output`
    async fn catalog(
        &self,
        base: &Path,
        components: &BTreeMap<String, Vec<PathBuf>>,
        images: &[ImageRef],
        output: &Path,
    ) -> Result<()>;
}

/// The collaborators one build uses
#[derive(Clone)]
pub struct Toolchain {
    pub git: Arc<dyn GitClient>,
    pub kustomize: Arc<dyn KustomizeBuilder>,
    pub charts: Arc<dyn ChartPackager>,
    pub sbom: Arc<dyn SbomCataloger>,
}

impl Toolchain {
    /// Defaults backed by the `git` and `kustomize` binaries
    ///
    /// `registry` serves `oci://` charts.
    pub fn system(registry: Arc<dyn Registry>) -> Result<Self> {
        let git: Arc<dyn GitClient> = Arc::new(GitCli);
        Ok(Self {
            charts: Arc::new(
                DefaultChartPackager::new(HttpFetcher::new()?, git.clone()).with_registry(registry),
            ),
            kustomize: Arc::new(KustomizeCli),
            sbom: Arc::new(FileListCataloger),
            git,
        })
    }
}

/// Run an external program and return its stdout
pub(crate) async fn run_tool(
    tool: &'static str,
    program: &str,
    args: &[&str],
    target: &str,
) -> Result<Vec<u8>> {
    tracing::debug!(tool, program, ?args, "running");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PackagerError::Tool {
            tool,
            target: target.to_string(),
            message: format!("failed to run {}: {}", program, e),
        })?;

    if !output.status.success() {
        return Err(PackagerError::Tool {
            tool,
            target: target.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// `git` command line client
#[derive(Debug, Default, Clone, Copy)]
pub struct GitCli;

fn is_commit_sha(reference: &str) -> bool {
    reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl GitClient for GitCli {
    async fn clone_repo(&self, url: &str, reference: Option<&str>, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy().to_string();
        let dest_str = dest.as_str();
        match reference {
            Some(r) if is_commit_sha(r) => {
                run_tool("git", "git", &["clone", "--quiet", url, dest_str], url).await?;
                run_tool("git", "git", &["-C", dest_str, "checkout", "--quiet", r], url).await?;
            }
            Some(r) => {
                let branch = r
                    .strip_prefix("refs/heads/")
                    .or_else(|| r.strip_prefix("refs/tags/"))
                    .unwrap_or(r);
                run_tool(
                    "git",
                    "git",
                    &["clone", "--quiet", "--branch", branch, url, dest_str],
                    url,
                )
                .await?;
            }
            None => {
                run_tool("git", "git", &["clone", "--quiet", url, dest_str], url).await?;
            }
        }
        Ok(())
    }
}

/// `kustomize` command line builder
#[derive(Debug, Default, Clone, Copy)]
pub struct KustomizeCli;

#[async_trait]
impl KustomizeBuilder for KustomizeCli {
    async fn build(&self, dir: &Path, dest: &Path, allow_any_directory: bool) -> Result<()> {
        let dir_str = dir.to_string_lossy().to_string();
        let mut args = vec!["build", dir_str.as_str()];
        if allow_any_directory {
            args.extend(["--load-restrictor", "LoadRestrictionsNone"]);
        }
        let rendered = run_tool("kustomize", "kustomize", &args, &dir_str).await?;
        tokio::fs::write(dest, rendered)
            .await
            .map_err(|e| PackagerError::io(dest, e))
    }
}

/// Chart packager for charts on disk, in git, in a chart repository, in a
/// registry or at a direct archive URL
pub struct DefaultChartPackager {
    http: HttpFetcher,
    git: Arc<dyn GitClient>,
    registry: Option<Arc<dyn Registry>>,
}

impl DefaultChartPackager {
    pub fn new(http: HttpFetcher, git: Arc<dyn GitClient>) -> Self {
        Self {
            http,
            git,
            registry: None,
        }
    }

    /// Registry for `oci://` charts
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

fn chart_version(chart: &ChartSpec, dir: &Path) -> Result<String> {
    if !chart.version.is_empty() {
        return Ok(chart.version.clone());
    }
    let path = dir.join("Chart.yaml");
    let content = std::fs::read_to_string(&path).map_err(|e| PackagerError::io(&path, e))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|e| {
        PackagerError::config(format!("invalid {}: {}", path.display(), e))
    })?;
    value
        .get("version")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| PackagerError::config(format!("{} has no version", path.display())))
}

fn package_chart_dir(chart: &ChartSpec, dir: &Path, charts_dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(PackagerError::config(format!(
            "chart {} not found at {}",
            chart.name,
            dir.display()
        )));
    }
    let version = chart_version(chart, dir)?;
    let output = charts_dir.join(format!("{}-{}.tgz", chart.name, version));
    archive_dir(dir, &output, &chart.name, true)?;
    Ok(output)
}

#[async_trait]
impl ChartPackager for DefaultChartPackager {
    async fn package(&self, chart: &ChartSpec, base: &Path, charts_dir: &Path) -> Result<PathBuf> {
        if !chart.local_path.is_empty() {
            return package_chart_dir(chart, &base.join(&chart.local_path), charts_dir);
        }

        if !chart.git_path.is_empty() {
            let (url, reference) = airpack_core::differential::split_repo_ref(&chart.url);
            let checkout = tempfile::tempdir()?;
            let repo = checkout.path().join("repo");
            self.git.clone_repo(url, reference, &repo).await?;
            return package_chart_dir(chart, &repo.join(&chart.git_path), charts_dir);
        }

        if is_url(&chart.url) && (chart.url.ends_with(".tgz") || chart.url.ends_with(".tar.gz")) {
            let version = if chart.version.is_empty() {
                "0.0.0"
            } else {
                chart.version.as_str()
            };
            let output = charts_dir.join(format!("{}-{}.tgz", chart.name, version));
            self.http.download(&chart.url, &output).await?;
            return Ok(output);
        }

        if is_oci_chart(chart) {
            let registry = self.registry.as_ref().ok_or_else(|| {
                PackagerError::config(format!(
                    "chart {} is in {} but no registry is configured",
                    chart.name, chart.url
                ))
            })?;
            return pull_oci_chart(registry.as_ref(), chart, charts_dir).await;
        }

        if is_url(&chart.url) {
            return pull_repo_chart(&self.http, chart, charts_dir).await;
        }

        Err(PackagerError::config(format!(
            "chart {} needs a localPath, a gitPath or a repository url",
            chart.name
        )))
    }
}

#[derive(Debug, Serialize)]
struct FileRecord {
    path: String,
    sha256: String,
    size: u64,
}

#[derive(Debug, Serialize)]
struct ComponentInventory<'a> {
    component: &'a str,
    files: Vec<FileRecord>,
}

#[derive(Debug, Serialize)]
struct ImageInventory {
    image: String,
}

/// Writes a JSON inventory of component files and images
#[derive(Debug, Default, Clone, Copy)]
pub struct FileListCataloger;

#[async_trait]
impl SbomCataloger for FileListCataloger {
    async fn catalog(
        &self,
        base: &Path,
        components: &BTreeMap<String, Vec<PathBuf>>,
        images: &[ImageRef],
        output: &Path,
    ) -> Result<()> {
        let staging = tempfile::tempdir()?;

        for (name, files) in components {
            let mut records = Vec::with_capacity(files.len());
            for file in files {
                let size = std::fs::metadata(file)
                    .map_err(|e| PackagerError::io(file, e))?
                    .len();
                records.push(FileRecord {
                    path: file
                        .strip_prefix(base)
                        .unwrap_or(file)
                        .to_string_lossy()
                        .replace('\\', "/"),
                    sha256: hash_file(file)?,
                    size,
                });
            }
            let inventory = ComponentInventory {
                component: name,
                files: records,
            };
            write_json(&staging.path().join(format!("component-{}.json", name)), &inventory)?;
        }

        for image in images {
            let normalized = image.normalized();
            let key = hex::encode(Sha256::digest(normalized.as_bytes()));
            write_json(
                &staging.path().join(format!("image-{}.json", &key[..16])),
                &ImageInventory { image: normalized },
            )?;
        }

        create_package_archive(staging.path(), output, true)?;
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| PackagerError::config(format!("failed to serialize {}: {}", path.display(), e)))?;
    std::fs::write(path, data).map_err(|e| PackagerError::io(path, e))
}

/// Directory name of a cloned repository: `<name>-<hash of url>`
pub fn repo_dir_name(url: &str) -> String {
    let (url, _) = airpack_core::differential::split_repo_ref(url);
    let name = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git");
    let hash = hex::encode(Sha256::digest(url.as_bytes()));
    format!("{}-{}", name, &hash[..8])
}
