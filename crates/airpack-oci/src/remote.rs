//! Package transfer to and from an OCI registry
//!
//! A published package is one image manifest whose layers are the files of the
//! package build directory, each annotated with its relative path. Pulls skip
//! layers already on disk with the right size; publishes skip blobs the
//! registry already holds.

use futures::stream::{self, StreamExt};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use serde::Serialize;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use airpack_core::PackageDefinition;
use airpack_core::layout::PackagePaths;
use airpack_core::package::PACKAGE_YAML;
use airpack_core::progress::Progress;

use crate::error::{OciError, Result};
use crate::reference::OciReference;
use crate::registry::{Registry, sha256_digest};
use crate::store::{commit_partial, partial_path, remove_path, verify_digest};

pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";
pub const DESCRIPTION_ANNOTATION: &str = "org.opencontainers.image.description";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.airpack.config.v1+json";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DEFAULT_CONCURRENCY: usize = 3;

const LAYER_MEDIA_TYPE_PREFIX: &str = "application/vnd.airpack.layer.v1";

/// Media type of a package layer, from its file name
pub fn layer_media_type(path: &str) -> String {
    let suffix = if path.ends_with(".tar.gz") || path.ends_with(".tgz") || path.ends_with(".gz") {
        "tar+gzip"
    } else {
        match path.rsplit_once('.').map(|(_, ext)| ext) {
            Some("tar") => "tar",
            Some("yaml") | Some("yml") => "yaml",
            Some("json") => "json",
            Some("txt") => "txt",
            Some("sig") => "sig",
            _ => "unknown",
        }
    };
    format!("{}.{}", LAYER_MEDIA_TYPE_PREFIX, suffix)
}

/// Title annotation of a descriptor
pub fn layer_title(descriptor: &OciDescriptor) -> Option<&str> {
    descriptor
        .annotations
        .as_ref()
        .and_then(|a| a.get(TITLE_ANNOTATION))
        .map(String::as_str)
}

/// Whether a descriptor stands for "no content"
pub fn is_empty(descriptor: &OciDescriptor) -> bool {
    descriptor.digest.is_empty() || descriptor.size == 0
}

/// The manifest at the root of a published package
#[derive(Debug, Clone)]
pub struct RootManifest {
    pub manifest: OciImageManifest,
    pub digest: String,
}

impl RootManifest {
    /// Descriptor of the layer titled `title`, or an empty descriptor
    pub fn locate(&self, title: &str) -> OciDescriptor {
        self.manifest
            .layers
            .iter()
            .find(|layer| layer_title(layer) == Some(title))
            .cloned()
            .unwrap_or_else(|| OciDescriptor {
                digest: String::new(),
                size: 0,
                ..Default::default()
            })
    }

    pub fn layers(&self) -> &[OciDescriptor] {
        &self.manifest.layers
    }

    /// Titles of every layer, in manifest order
    pub fn titles(&self) -> Vec<&str> {
        self.manifest.layers.iter().filter_map(layer_title).collect()
    }
}

/// Summary of a finished transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub transferred: Vec<String>,
    pub skipped: Vec<String>,
}

enum LayerOutcome {
    Transferred(String),
    Skipped(String),
}

/// A package repository on a registry
pub struct OciRemote {
    registry: Arc<dyn Registry>,
    reference: OciReference,
    concurrency: usize,
    cancel: CancellationToken,
}

impl OciRemote {
    pub fn new(registry: Arc<dyn Registry>, reference: OciReference) -> Self {
        Self {
            registry,
            reference,
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }

    /// Bound the number of layers in flight
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Share a cancellation token with the caller
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn reference(&self) -> &OciReference {
        &self.reference
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Fetch the package manifest
    pub async fn fetch_root(&self) -> Result<RootManifest> {
        let remote = self.registry.fetch_manifest(&self.reference).await?;
        Ok(RootManifest {
            manifest: remote.manifest,
            digest: remote.digest,
        })
    }

    /// Fetch and parse only the package definition
    pub async fn fetch_definition(&self, root: &RootManifest) -> Result<PackageDefinition> {
        let descriptor = root.locate(PACKAGE_YAML);
        if is_empty(&descriptor) {
            return Err(OciError::LayerNotFound {
                title: PACKAGE_YAML.to_string(),
                reference: self.reference.to_string(),
            });
        }
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(PACKAGE_YAML);
        self.registry
            .fetch_blob(&self.reference, &descriptor, &path)
            .await?;
        verify_digest(&path, PACKAGE_YAML, &descriptor.digest)?;
        Ok(PackageDefinition::load(&path)?)
    }

    /// Pull every layer of the package into `dest`
    pub async fn pull_package(&self, dest: &Path, progress: &dyn Progress) -> Result<RootManifest> {
        let root = self.fetch_root().await?;
        progress.start(&format!("Pulling {}", self.reference));
        match self.pull_layers(root.layers(), dest, progress).await {
            Ok(summary) => {
                progress.success(&format!(
                    "Pulled {} ({} layers, {} already present)",
                    self.reference,
                    summary.transferred.len() + summary.skipped.len(),
                    summary.skipped.len()
                ));
                Ok(root)
            }
            Err(e) => {
                progress.fail(&format!("Failed to pull {}", self.reference));
                Err(e)
            }
        }
    }

    /// Pull the given layers into `dest`, each at its titled path
    ///
    /// A layer whose target already exists with the expected size is not
    /// fetched again. The first failure cancels layers not yet started; layers
    /// in flight finish or discard their staging file before this returns.
    pub async fn pull_layers(
        &self,
        layers: &[OciDescriptor],
        dest: &Path,
        progress: &dyn Progress,
    ) -> Result<TransferSummary> {
        let mut targets = Vec::with_capacity(layers.len());
        for layer in layers {
            let title = layer_title(layer).ok_or_else(|| OciError::LayerNotFound {
                title: layer.digest.clone(),
                reference: self.reference.to_string(),
            })?;
            targets.push((layer, title.to_string(), safe_join(dest, title)?));
        }

        let cancel = self.cancel.child_token();
        let results = stream::iter(targets)
            .map(|(layer, title, target)| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Err(OciError::Cancelled);
                    }
                    let outcome = self.pull_layer(layer, &title, &target).await;
                    match &outcome {
                        Ok(LayerOutcome::Transferred(t)) => progress.update(&format!("Pulled {}", t)),
                        Ok(LayerOutcome::Skipped(t)) => {
                            progress.update(&format!("{} already present", t))
                        }
                        Err(_) => cancel.cancel(),
                    }
                    outcome
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        summarize(results)
    }

    async fn pull_layer(
        &self,
        layer: &OciDescriptor,
        title: &str,
        target: &Path,
    ) -> Result<LayerOutcome> {
        if let Ok(meta) = std::fs::metadata(target)
            && meta.is_file()
            && meta.len() as i64 == layer.size
        {
            tracing::debug!(layer = %title, "layer already present, skipping");
            return Ok(LayerOutcome::Skipped(title.to_string()));
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| OciError::io(parent, e))?;
        }

        let partial = partial_path(target);
        let fetched = async {
            self.registry
                .fetch_blob(&self.reference, layer, &partial)
                .await?;
            verify_digest(&partial, title, &layer.digest)
        }
        .await;
        if let Err(e) = fetched {
            remove_path(&partial);
            return Err(e);
        }

        // Pulls may refresh a stale file of the wrong size
        if target.exists() {
            remove_path(target);
        }
        commit_partial(&partial, target)?;
        tracing::debug!(layer = %title, digest = %layer.digest, "pulled layer");
        Ok(LayerOutcome::Transferred(title.to_string()))
    }

    /// Publish every file of a package build directory
    ///
    /// Blobs already present in the repository are not uploaded again.
    /// Returns the manifest digest.
    pub async fn publish_dir(
        &self,
        base: &Path,
        pkg: &PackageDefinition,
        progress: &dyn Progress,
    ) -> Result<String> {
        let files = PackagePaths::new(base).files()?;
        progress.start(&format!("Publishing {} to {}", pkg.metadata.name, self.reference));

        let mut layers = Vec::with_capacity(files.len());
        for (title, path) in &files {
            let digest = format!("sha256:{}", airpack_core::hash_file(path)?);
            let size = std::fs::metadata(path)
                .map_err(|e| OciError::io(path, e))?
                .len() as i64;
            layers.push((
                OciDescriptor {
                    media_type: layer_media_type(title),
                    digest,
                    size,
                    annotations: Some(
                        [(TITLE_ANNOTATION.to_string(), title.clone())]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                },
                path.clone(),
            ));
        }

        let cancel = self.cancel.child_token();
        let results = stream::iter(layers.iter())
            .map(|(descriptor, path)| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Err(OciError::Cancelled);
                    }
                    let title = layer_title(descriptor).unwrap_or_default().to_string();
                    let outcome = self.push_layer(descriptor, path, &title).await;
                    match &outcome {
                        Ok(LayerOutcome::Transferred(t)) => progress.update(&format!("Pushed {}", t)),
                        Ok(LayerOutcome::Skipped(t)) => {
                            progress.update(&format!("{} already exists", t))
                        }
                        Err(_) => cancel.cancel(),
                    }
                    outcome
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        if let Err(e) = summarize(results) {
            progress.fail(&format!("Failed to publish {}", pkg.metadata.name));
            return Err(e);
        }

        let config = self.push_config(pkg).await?;
        let manifest = OciImageManifest {
            schema_version: 2,
            media_type: Some(MANIFEST_MEDIA_TYPE.to_string()),
            config,
            layers: layers.into_iter().map(|(descriptor, _)| descriptor).collect(),
            annotations: Some(manifest_annotations(pkg).into_iter().collect()),
            ..Default::default()
        };
        let digest = self
            .registry
            .push_manifest(&self.reference, &manifest)
            .await?;

        progress.success(&format!("Published {} ({})", self.reference, digest));
        tracing::info!(reference = %self.reference, digest = %digest, "published package");
        Ok(digest)
    }

    async fn push_layer(
        &self,
        descriptor: &OciDescriptor,
        path: &Path,
        title: &str,
    ) -> Result<LayerOutcome> {
        if self
            .registry
            .blob_exists(&self.reference, &descriptor.digest)
            .await?
        {
            tracing::debug!(layer = %title, "blob already in registry, skipping");
            return Ok(LayerOutcome::Skipped(title.to_string()));
        }
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| OciError::io(path, e))?;
        self.registry
            .push_blob(&self.reference, data, &descriptor.digest)
            .await?;
        Ok(LayerOutcome::Transferred(title.to_string()))
    }

    async fn push_config(&self, pkg: &PackageDefinition) -> Result<OciDescriptor> {
        let data = serde_json::to_vec(&PackageConfig::from(pkg))?;
        let digest = sha256_digest(&data);
        let descriptor = OciDescriptor {
            media_type: CONFIG_MEDIA_TYPE.to_string(),
            digest: digest.clone(),
            size: data.len() as i64,
            ..Default::default()
        };
        if !self.registry.blob_exists(&self.reference, &digest).await? {
            self.registry
                .push_blob(&self.reference, data, &digest)
                .await?;
        }
        Ok(descriptor)
    }
}

/// Config blob of a published package
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PackageConfig<'a> {
    architecture: &'a str,
    os: &'static str,
    name: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aggregate_checksum: Option<&'a str>,
}

impl<'a> From<&'a PackageDefinition> for PackageConfig<'a> {
    fn from(pkg: &'a PackageDefinition) -> Self {
        Self {
            architecture: pkg.architecture(),
            os: "linux",
            name: &pkg.metadata.name,
            version: &pkg.metadata.version,
            description: pkg.metadata.description.as_deref(),
            aggregate_checksum: Some(pkg.metadata.aggregate_checksum.as_str())
                .filter(|c| !c.is_empty()),
        }
    }
}

fn manifest_annotations(pkg: &PackageDefinition) -> Vec<(String, String)> {
    let mut annotations = vec![(TITLE_ANNOTATION.to_string(), pkg.metadata.name.clone())];
    if let Some(description) = &pkg.metadata.description {
        annotations.push((DESCRIPTION_ANNOTATION.to_string(), description.clone()));
    }
    annotations
}

fn summarize(results: Vec<Result<LayerOutcome>>) -> Result<TransferSummary> {
    let mut summary = TransferSummary::default();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(LayerOutcome::Transferred(t)) => summary.transferred.push(t),
            Ok(LayerOutcome::Skipped(t)) => summary.skipped.push(t),
            // Cancellations are a consequence of the real failure
            Err(OciError::Cancelled) if first_error.is_some() => {}
            Err(e) => {
                if first_error.is_none() || matches!(first_error, Some(OciError::Cancelled)) {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => {
            summary.transferred.sort();
            summary.skipped.sort();
            Ok(summary)
        }
    }
}

/// Join a layer title onto `dest`, rejecting titles that escape it
fn safe_join(dest: &Path, title: &str) -> Result<PathBuf> {
    let relative = Path::new(title);
    if title.is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, PathComponent::Normal(_)))
    {
        return Err(OciError::InvalidReference {
            reference: title.to_string(),
            reason: "layer title is not a relative path".to_string(),
        });
    }
    Ok(dest.join(relative))
}
