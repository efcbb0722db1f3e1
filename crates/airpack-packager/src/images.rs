//! Image aggregation
//!
//! Every image across every component is collected into one ordered,
//! deduplicated list and pulled into the package's OCI image layout.
//! Pulls run concurrently, the recorded list keeps first-seen order.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use airpack_core::layout::ImagePaths;
use airpack_core::{Component, ImageRef, Progress, unique_images};
use airpack_oci::{OciReference, Registry, fetch_blob_to, manifest_digest};

use crate::error::{PackagerError, Result};

const OCI_LAYOUT_VERSION: &str = "1.0.0";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
const IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// An image stored in the package layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    pub image: ImageRef,
    pub manifest_digest: String,
    pub manifest_size: u64,
    /// Whether the image carries filesystem layers worth cataloging
    pub has_layers: bool,
}

/// Pulls a single image for one architecture into an OCI layout
#[async_trait]
pub trait ImagePuller: Send + Sync {
    async fn pull(&self, image: &ImageRef, architecture: &str, layout: &ImagePaths) -> Result<PulledImage>;
}

/// Bounded retry with fixed backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Same attempt count without waiting between attempts
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: Duration::ZERO,
        }
    }
}

/// Collect the images of every component, deduplicated in first-seen order
///
/// Registry overrides are applied before deduplication, so two references
/// that land on the same mirror are pulled once.
pub fn collect_images(
    components: &[Component],
    overrides: &IndexMap<String, String>,
) -> Result<Vec<ImageRef>> {
    let declared = unique_images(
        components
            .iter()
            .flat_map(|c| c.images.iter().map(String::as_str)),
    )?;

    let mut seen = IndexSet::new();
    let mut images = Vec::with_capacity(declared.len());
    for image in declared {
        let image = image.with_overrides(overrides)?;
        if seen.insert(image.normalized()) {
            images.push(image);
        }
    }
    Ok(images)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OciLayout<'a> {
    image_layout_version: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageIndex {
    schema_version: u32,
    media_type: &'static str,
    manifests: Vec<IndexEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    media_type: &'static str,
    digest: String,
    size: u64,
    annotations: BTreeMap<String, String>,
}

/// Pulls the aggregated image list with retry and bounded concurrency
pub struct ImageAggregator {
    puller: Arc<dyn ImagePuller>,
    retry: RetryPolicy,
    concurrency: usize,
    cancel: CancellationToken,
}

impl ImageAggregator {
    pub fn new(puller: Arc<dyn ImagePuller>) -> Self {
        Self {
            puller,
            retry: RetryPolicy::default(),
            concurrency: airpack_oci::remote::DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Pull every image for `architecture` and write the layout index
    ///
    /// A failed round is retried after the backoff; images that already
    /// succeeded are not pulled again. The result follows the order of
    /// `images`.
    pub async fn pull_all(
        &self,
        images: &[ImageRef],
        architecture: &str,
        layout: &ImagePaths,
        progress: &dyn Progress,
    ) -> Result<Vec<PulledImage>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        std::fs::create_dir_all(&layout.blobs).map_err(|e| PackagerError::io(&layout.blobs, e))?;

        progress.start(&format!("Pulling {} {} images", images.len(), architecture));
        let attempts = self.retry.attempts.max(1);
        let mut pulled: HashMap<String, PulledImage> = HashMap::new();

        for attempt in 1..=attempts {
            let pending: Vec<&ImageRef> = images
                .iter()
                .filter(|image| !pulled.contains_key(&image.normalized()))
                .collect();

            match self
                .pull_round(&pending, architecture, layout, progress, &mut pulled)
                .await
            {
                Ok(()) => break,
                Err((_, PackagerError::Cancelled)) => return Err(PackagerError::Cancelled),
                Err((image, e)) if attempt == attempts => {
                    progress.fail(&format!("Unable to pull {}", image));
                    return Err(PackagerError::ImagePull {
                        image: image.to_string(),
                        attempts,
                        source: Box::new(e),
                    });
                }
                Err((image, e)) => {
                    tracing::warn!(
                        image = %image,
                        attempt,
                        error = %e,
                        "image pull failed, retrying in {:?}",
                        self.retry.backoff
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(PackagerError::Cancelled),
                        _ = tokio::time::sleep(self.retry.backoff) => {}
                    }
                }
            }
        }

        let recorded: Vec<PulledImage> = images
            .iter()
            .filter_map(|image| pulled.remove(&image.normalized()))
            .collect();
        write_layout(layout, &recorded)?;
        progress.success(&format!("Pulled {} images", recorded.len()));
        Ok(recorded)
    }

    /// One pass over the pending images
    ///
    /// After the first failure no new pulls start; in-flight pulls drain
    /// before the error is returned.
    async fn pull_round(
        &self,
        pending: &[&ImageRef],
        architecture: &str,
        layout: &ImagePaths,
        progress: &dyn Progress,
        pulled: &mut HashMap<String, PulledImage>,
    ) -> std::result::Result<(), (ImageRef, PackagerError)> {
        let round = self.cancel.child_token();
        let mut results = stream::iter(pending.iter().map(|image| {
            let round = round.clone();
            async move {
                if round.is_cancelled() {
                    return (*image, Err(PackagerError::Cancelled));
                }
                (*image, self.puller.pull(image, architecture, layout).await)
            }
        }))
        .buffer_unordered(self.concurrency);

        let mut first_error = None;
        while let Some((image, result)) = results.next().await {
            match result {
                Ok(record) => {
                    tracing::debug!(image = %image, digest = %record.manifest_digest, "pulled image");
                    progress.update(&format!("Pulled {}", image));
                    pulled.insert(image.normalized(), record);
                }
                Err(PackagerError::Cancelled) if first_error.is_some() => {}
                Err(e) => {
                    round.cancel();
                    if first_error.is_none() {
                        first_error = Some((image.clone(), e));
                    }
                }
            }
        }

        match first_error {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

fn write_layout(layout: &ImagePaths, images: &[PulledImage]) -> Result<()> {
    let marker = serde_json::to_vec(&OciLayout {
        image_layout_version: OCI_LAYOUT_VERSION,
    })
    .map_err(|e| PackagerError::config(format!("unable to encode oci-layout: {}", e)))?;
    std::fs::write(&layout.oci_layout, marker)
        .map_err(|e| PackagerError::io(&layout.oci_layout, e))?;

    let index = ImageIndex {
        schema_version: 2,
        media_type: "application/vnd.oci.image.index.v1+json",
        manifests: images
            .iter()
            .map(|p| IndexEntry {
                media_type: IMAGE_MANIFEST_MEDIA_TYPE,
                digest: p.manifest_digest.clone(),
                size: p.manifest_size,
                annotations: BTreeMap::from([(REF_NAME_ANNOTATION.to_string(), p.image.normalized())]),
            })
            .collect(),
    };
    let data = serde_json::to_vec_pretty(&index)
        .map_err(|e| PackagerError::config(format!("unable to encode image index: {}", e)))?;
    std::fs::write(&layout.index, data).map_err(|e| PackagerError::io(&layout.index, e))
}

/// Pulls images from their registries
///
/// Multi-platform images are narrowed to the package architecture before
/// any blob is fetched.
pub struct RegistryImagePuller {
    registry: Arc<dyn Registry>,
}

impl RegistryImagePuller {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ImagePuller for RegistryImagePuller {
    async fn pull(&self, image: &ImageRef, architecture: &str, layout: &ImagePaths) -> Result<PulledImage> {
        let reference = OciReference::parse(&image.normalized())?;
        let remote = self
            .registry
            .fetch_image_manifest(&reference, architecture)
            .await?;
        let manifest = remote.manifest;

        let registry = self.registry.as_ref();
        fetch_blob_to(registry, &reference, &manifest.config, &layout.blob(&manifest.config.digest))
            .await?;
        for layer in &manifest.layers {
            fetch_blob_to(registry, &reference, layer, &layout.blob(&layer.digest)).await?;
        }

        let (data, digest) = manifest_digest(&manifest)?;
        let path = layout.blob(&digest);
        if !path.is_file() {
            std::fs::write(&path, &data).map_err(|e| PackagerError::io(&path, e))?;
        }

        Ok(PulledImage {
            image: image.clone(),
            manifest_digest: digest,
            manifest_size: data.len() as u64,
            has_layers: !manifest.layers.is_empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airpack_core::PackagePaths;
    use airpack_core::progress::RecordingProgress;
    use airpack_oci::{MemoryRegistry, OciImageManifest};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Fails the first `failures` pulls of every image
    struct FlakyPuller {
        failures: u32,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl FlakyPuller {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls(&self, image: &str) -> u32 {
            let key = ImageRef::parse(image).unwrap().normalized();
            self.calls.lock().unwrap().get(&key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ImagePuller for FlakyPuller {
        async fn pull(&self, image: &ImageRef, _architecture: &str, _layout: &ImagePaths) -> Result<PulledImage> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let count = calls.entry(image.normalized()).or_insert(0);
                *count += 1;
                *count
            };
            if call <= self.failures {
                return Err(PackagerError::Network {
                    url: image.to_string(),
                    message: "connection reset".to_string(),
                });
            }
            Ok(PulledImage {
                image: image.clone(),
                manifest_digest: format!("sha256:{:064x}", call),
                manifest_size: 10,
                has_layers: true,
            })
        }
    }

    fn component(name: &str, images: &[&str]) -> Component {
        Component {
            name: name.to_string(),
            images: images.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn refs(images: &[&str]) -> Vec<ImageRef> {
        images.iter().map(|i| ImageRef::parse(i).unwrap()).collect()
    }

    #[test]
    fn test_collect_images_first_seen_order() {
        let components = vec![
            component("a", &["a:1", "b:2", "a:1"]),
            component("b", &["c:3"]),
        ];
        let images = collect_images(&components, &IndexMap::new()).unwrap();
        let names: Vec<String> = images.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "docker.io/library/a:1",
                "docker.io/library/b:2",
                "docker.io/library/c:3"
            ]
        );
    }

    #[test]
    fn test_collect_images_applies_overrides() {
        let components = vec![component("a", &["nginx:1.25", "mirror.local/library/nginx:1.25"])];
        let mut overrides = IndexMap::new();
        overrides.insert("docker.io".to_string(), "mirror.local".to_string());

        let images = collect_images(&components, &overrides).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].to_string(), "mirror.local/library/nginx:1.25");
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let dir = TempDir::new().unwrap();
        let paths = PackagePaths::new(dir.path());
        let puller = Arc::new(FlakyPuller::new(2));
        let aggregator =
            ImageAggregator::new(puller.clone()).with_retry(RetryPolicy::immediate(3));

        let pulled = aggregator
            .pull_all(&refs(&["nginx:1.25"]), "amd64", &paths.images, &RecordingProgress::default())
            .await
            .unwrap();

        assert_eq!(pulled.len(), 1);
        assert_eq!(puller.calls("nginx:1.25"), 3);
        assert!(paths.images.index.is_file());
        assert!(paths.images.oci_layout.is_file());
    }

    #[tokio::test]
    async fn test_retry_exhausted_names_image() {
        let dir = TempDir::new().unwrap();
        let paths = PackagePaths::new(dir.path());
        let puller = Arc::new(FlakyPuller::new(u32::MAX));
        let aggregator =
            ImageAggregator::new(puller.clone()).with_retry(RetryPolicy::immediate(3));

        let err = aggregator
            .pull_all(&refs(&["nginx:1.25"]), "amd64", &paths.images, &RecordingProgress::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("docker.io/library/nginx:1.25"));
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(puller.calls("nginx:1.25"), 3);
    }

    #[tokio::test]
    async fn test_recorded_order_follows_input() {
        let dir = TempDir::new().unwrap();
        let paths = PackagePaths::new(dir.path());
        let aggregator = ImageAggregator::new(Arc::new(FlakyPuller::new(0))).with_concurrency(4);
        let input = refs(&["c:3", "a:1", "b:2"]);

        let pulled = aggregator
            .pull_all(&input, "amd64", &paths.images, &RecordingProgress::default())
            .await
            .unwrap();
        let order: Vec<&ImageRef> = pulled.iter().map(|p| &p.image).collect();
        assert_eq!(order, input.iter().collect::<Vec<_>>());

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&paths.images.index).unwrap()).unwrap();
        assert_eq!(
            index["manifests"][0]["annotations"][REF_NAME_ANNOTATION],
            "docker.io/library/c:3"
        );
    }

    #[tokio::test]
    async fn test_registry_puller_writes_layout_blobs() {
        let dir = TempDir::new().unwrap();
        let paths = PackagePaths::new(dir.path());
        std::fs::create_dir_all(&paths.images.blobs).unwrap();

        let registry = Arc::new(MemoryRegistry::new());
        let config = registry.insert_blob("application/vnd.oci.image.config.v1+json", b"{}".to_vec());
        let layer = registry.insert_blob(
            "application/vnd.oci.image.layer.v1.tar+gzip",
            b"layer bytes".to_vec(),
        );
        let manifest = OciImageManifest {
            config,
            layers: vec![layer.clone()],
            ..Default::default()
        };
        let reference = OciReference::parse("docker.io/library/nginx:1.25").unwrap();
        registry.insert_manifest(&reference, manifest).unwrap();

        let puller = RegistryImagePuller::new(registry.clone());
        let image = ImageRef::parse("nginx:1.25").unwrap();
        let pulled = puller.pull(&image, "amd64", &paths.images).await.unwrap();

        assert!(pulled.has_layers);
        assert_eq!(
            std::fs::read(paths.images.blob(&layer.digest)).unwrap(),
            b"layer bytes"
        );
        assert!(paths.images.blob(&pulled.manifest_digest).is_file());

        // Present blobs are not fetched again
        puller.pull(&image, "amd64", &paths.images).await.unwrap();
        assert_eq!(registry.fetch_count(&layer.digest), 1);
    }

    fn platform_manifest(registry: &MemoryRegistry, layer: &[u8]) -> OciImageManifest {
        OciImageManifest {
            config: registry.insert_blob("application/vnd.oci.image.config.v1+json", b"{}".to_vec()),
            layers: vec![registry.insert_blob(
                "application/vnd.oci.image.layer.v1.tar+gzip",
                layer.to_vec(),
            )],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_registry_puller_pulls_package_architecture() {
        let dir = TempDir::new().unwrap();
        let paths = PackagePaths::new(dir.path());
        std::fs::create_dir_all(&paths.images.blobs).unwrap();

        let registry = Arc::new(MemoryRegistry::new());
        let reference = OciReference::parse("docker.io/library/nginx:1.25").unwrap();
        for arch in ["amd64", "arm64"] {
            let layer = format!("{} layer", arch);
            registry
                .insert_platform_manifest(&reference, arch, platform_manifest(&registry, layer.as_bytes()))
                .unwrap();
        }
        let arm64_layer = airpack_oci::sha256_digest(b"arm64 layer");
        let amd64_layer = airpack_oci::sha256_digest(b"amd64 layer");

        let aggregator = ImageAggregator::new(Arc::new(RegistryImagePuller::new(registry.clone())))
            .with_retry(RetryPolicy::immediate(1));
        let pulled = aggregator
            .pull_all(&refs(&["nginx:1.25"]), "arm64", &paths.images, &RecordingProgress::default())
            .await
            .unwrap();

        assert_eq!(pulled.len(), 1);
        assert!(paths.images.blob(&arm64_layer).is_file());
        assert!(!paths.images.blob(&amd64_layer).exists());
        assert_eq!(registry.fetch_count(&amd64_layer), 0);
    }

    #[tokio::test]
    async fn test_missing_architecture_fails_pull() {
        let dir = TempDir::new().unwrap();
        let paths = PackagePaths::new(dir.path());

        let registry = Arc::new(MemoryRegistry::new());
        let reference = OciReference::parse("docker.io/library/nginx:1.25").unwrap();
        registry
            .insert_platform_manifest(&reference, "amd64", platform_manifest(&registry, b"amd64 layer"))
            .unwrap();

        let aggregator = ImageAggregator::new(Arc::new(RegistryImagePuller::new(registry)))
            .with_retry(RetryPolicy::immediate(1));
        let err = aggregator
            .pull_all(&refs(&["nginx:1.25"]), "arm64", &paths.images, &RecordingProgress::default())
            .await
            .unwrap_err();

        match err {
            PackagerError::ImagePull { source, .. } => {
                assert!(source.to_string().contains("no linux/arm64 image"));
            }
            other => panic!("expected an image pull error, got {}", other),
        }
    }
}
