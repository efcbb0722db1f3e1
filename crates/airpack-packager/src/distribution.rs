//! Moving packages to and from registries
//!
//! - `publish_archive`: push a package archive built earlier
//! - `publish_skeleton`: push a package directory with only its local
//!   content resolved, so other packages can import its components
//! - `pull`: fetch a published package into a local archive

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use airpack_core::archive::{archive_name, create_package_archive, extract_archive};
use airpack_core::package::SKELETON_ARCH;
use airpack_core::split::{is_split_metadata, reassemble};
use airpack_core::{
    ChecksumManifest, Component, ComponentPaths, PACKAGE_YAML, PackageDefinition, PackagePaths,
    Progress,
};
use airpack_oci::{OciCache, OciReference, OciRemote, Registry, identity_key};

use crate::composer::{Composer, RemoteImports};
use crate::creator::{CreateOptions, finalize, stamp_build_metadata};
use crate::error::{PackagerError, Result};
use crate::resolver::{ResolveOptions, Resolver, is_url};
use crate::tools::GitClient;

/// Parameters of `airpack package publish`
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Package archive, or a package directory for a skeleton publish
    pub source: PathBuf,
    /// `oci://registry/repository` to publish under
    pub repository: String,
    pub signing_key: Option<PathBuf>,
    pub signing_key_password: Option<String>,
    pub concurrency: usize,
}

/// Parameters of `airpack package pull`
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// `oci://` reference of the published package
    pub reference: String,
    pub output_dir: PathBuf,
    pub concurrency: usize,
}

/// A package stored in a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPackage {
    pub reference: String,
    pub digest: String,
}

/// Publishes and pulls packages through one registry
pub struct PackageDistributor {
    registry: Arc<dyn Registry>,
    cache: Option<OciCache>,
    git: Arc<dyn GitClient>,
    cancel: CancellationToken,
}

impl PackageDistributor {
    pub fn new(registry: Arc<dyn Registry>, git: Arc<dyn GitClient>) -> Self {
        Self {
            registry,
            cache: None,
            git,
            cancel: CancellationToken::new(),
        }
    }

    /// Cache for remote imports met while publishing a skeleton
    pub fn with_cache(mut self, cache: OciCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn remote(&self, reference: OciReference, concurrency: usize) -> OciRemote {
        let remote = OciRemote::new(self.registry.clone(), reference)
            .with_cancellation(self.cancel.clone());
        if concurrency > 0 {
            remote.with_concurrency(concurrency)
        } else {
            remote
        }
    }

    /// Publish a directory as a skeleton, anything else as a package archive
    pub async fn publish(&self, options: &PublishOptions, progress: &dyn Progress) -> Result<PublishedPackage> {
        if options.source.is_dir() {
            self.publish_skeleton(options, progress).await
        } else {
            self.publish_archive(options, progress).await
        }
    }

    /// Publish a package archive (or the `.part000` of a split archive)
    pub async fn publish_archive(&self, options: &PublishOptions, progress: &dyn Progress) -> Result<PublishedPackage> {
        let staging = tempfile::Builder::new().prefix("airpack-publish-").tempdir()?;
        let contents = staging.path().join("package");
        unpack_package(&options.source, staging.path(), &contents)?;

        let pkg = PackageDefinition::load(contents.join(PACKAGE_YAML))?;
        let reference = OciReference::for_package(&options.repository, &pkg)?;
        let digest = self
            .remote(reference.clone(), options.concurrency)
            .publish_dir(&contents, &pkg, progress)
            .await
            .map_err(|e| PackagerError::Publish {
                source: Box::new(e.into()),
            })?;
        Ok(PublishedPackage {
            reference: reference.to_string(),
            digest,
        })
    }

    /// Publish the package directory `options.source` as a skeleton
    ///
    /// Local files, values, manifests and kustomizations are copied into
    /// the component directories and their paths rewritten to match; remote
    /// content and images are left as references.
    pub async fn publish_skeleton(&self, options: &PublishOptions, progress: &dyn Progress) -> Result<PublishedPackage> {
        let base = &options.source;
        let mut pkg = PackageDefinition::load(base.join(PACKAGE_YAML))?;
        pkg.validate()?;
        pkg.metadata.architecture = SKELETON_ARCH.to_string();
        pkg.build.architecture = SKELETON_ARCH.to_string();
        stamp_build_metadata(
            &mut pkg,
            &CreateOptions {
                architecture: SKELETON_ARCH.to_string(),
                ..Default::default()
            },
        );

        let mut composer = Composer::new(base, SKELETON_ARCH)?;
        if let Some(cache) = &self.cache {
            composer = composer.with_remote(RemoteImports::new(self.registry.clone(), cache.clone()));
        }
        composer.compose_package(&mut pkg, progress).await?;

        let build_dir = tempfile::Builder::new().prefix("airpack-skeleton-").tempdir()?;
        let mut paths = PackagePaths::new(build_dir.path());
        let resolver = Resolver::new(base, self.git.clone())?.with_cancellation(self.cancel.clone());

        for component in &mut pkg.components {
            let component_paths = paths
                .create_component_paths(&component.name)
                .map_err(|e| PackagerError::from(e).in_component(&component.name))?;
            let name = component.name.clone();
            skeletonize(component, &component_paths, &resolver)
                .await
                .map_err(|e| e.in_component(&name))?;
            component_paths.cleanup()?;
        }

        finalize(
            &mut pkg,
            &paths,
            options.signing_key.as_deref(),
            options.signing_key_password.as_deref(),
        )
        .map_err(|e| PackagerError::Archive { source: Box::new(e) })?;

        let reference = OciReference::for_package(&options.repository, &pkg)?;
        let digest = self
            .remote(reference.clone(), options.concurrency)
            .publish_dir(&paths.base, &pkg, progress)
            .await
            .map_err(|e| PackagerError::Publish {
                source: Box::new(e.into()),
            })?;
        Ok(PublishedPackage {
            reference: reference.to_string(),
            digest,
        })
    }

    /// Pull a published package into an archive under `options.output_dir`
    ///
    /// Layers are staged in a directory next to the output that outlives a
    /// failed pull, so a retry only fetches what is still missing. Every
    /// layer is checked against `checksums.txt` before the archive is
    /// written.
    pub async fn pull(&self, options: &PullOptions, progress: &dyn Progress) -> Result<PathBuf> {
        let reference = OciReference::parse(&options.reference)?;
        let staging = pull_staging_dir(&options.output_dir, &reference);
        self.remote(reference, options.concurrency)
            .pull_package(&staging, progress)
            .await?;

        let pkg = match verify_pulled(&staging, &options.reference) {
            Ok(pkg) => pkg,
            Err(e) => {
                // Bad content would otherwise be skipped as present on the next pull
                remove_staging(&staging);
                return Err(e);
            }
        };

        let output = options.output_dir.join(archive_name(&pkg));
        create_package_archive(&staging, &output, pkg.metadata.uncompressed)?;
        std::fs::remove_dir_all(&staging).map_err(|e| PackagerError::io(&staging, e))?;
        Ok(output)
    }
}

/// Stable staging directory of one reference under `output_dir`
fn pull_staging_dir(output_dir: &Path, reference: &OciReference) -> PathBuf {
    let key = identity_key(&reference.to_string(), "pull");
    output_dir.join(format!(".airpack-pull-{}", &key[..16]))
}

fn remove_staging(staging: &Path) {
    if let Err(e) = std::fs::remove_dir_all(staging) {
        tracing::warn!(path = %staging.display(), error = %e, "unable to remove pull staging directory");
    }
}

/// Check a pulled package directory against its checksums
fn verify_pulled(staging: &Path, reference: &str) -> Result<PackageDefinition> {
    let pkg = PackageDefinition::load(staging.join(PACKAGE_YAML))?;
    let checksums = ChecksumManifest::load(staging)?;
    let result = checksums.verify(staging)?;
    if let Some(bad) = result.mismatched.first() {
        return Err(PackagerError::IntegrityCheckFailed {
            source_ref: format!("{} ({})", reference, bad.path),
            expected: bad.expected.clone(),
            actual: bad.actual.clone(),
        });
    }
    if let Some(missing) = result.missing.first() {
        return Err(PackagerError::config(format!(
            "{} is missing {} listed in its checksums",
            reference, missing
        )));
    }
    if checksums.aggregate() != pkg.metadata.aggregate_checksum {
        return Err(PackagerError::IntegrityCheckFailed {
            source_ref: format!("{} (checksums.txt)", reference),
            expected: pkg.metadata.aggregate_checksum.clone(),
            actual: checksums.aggregate(),
        });
    }
    Ok(pkg)
}

/// Extract a package archive, joining split parts first
pub(crate) fn unpack_package(source: &Path, scratch: &Path, dest: &Path) -> Result<()> {
    let archive = if is_split_metadata(source) {
        reassemble(source, scratch)?
    } else {
        source.to_path_buf()
    };
    extract_archive(&archive, dest)?;
    Ok(())
}

fn file_name(target: &str) -> Result<String> {
    Path::new(target)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PackagerError::config(format!("invalid target path {:?}", target)))
}

/// Copy a local source under the component and return its component-relative path
async fn localize(
    resolver: &Resolver,
    paths: &ComponentPaths,
    source: &str,
    relative: &str,
    options: &ResolveOptions,
) -> Result<String> {
    resolver
        .resolve(source, &paths.base.join(relative), options)
        .await?;
    Ok(relative.to_string())
}

async fn skeletonize(component: &mut Component, paths: &ComponentPaths, resolver: &Resolver) -> Result<()> {
    for (idx, chart) in component.charts.iter_mut().enumerate() {
        if !chart.local_path.is_empty() {
            let relative = format!("charts/{}-{}", chart.name, idx);
            chart.local_path =
                localize(resolver, paths, &chart.local_path, &relative, &ResolveOptions::default()).await?;
        }
        for (v_idx, values) in chart.values_files.iter_mut().enumerate() {
            if is_url(values) {
                continue;
            }
            let relative = format!("values/{}-{}", chart.name, v_idx);
            *values = localize(resolver, paths, values, &relative, &ResolveOptions::default()).await?;
        }
    }

    for (idx, file) in component.files.iter_mut().enumerate() {
        if is_url(&file.source) {
            continue;
        }
        let relative = format!("files/{}/{}", idx, file_name(&file.target)?);
        let options = ResolveOptions::default()
            .checksum(&file.shasum)
            .extract_path(&file.extract_path)
            .executable(file.executable);
        file.source = localize(resolver, paths, &file.source, &relative, &options).await?;
        file.extract_path.clear();
    }

    for (idx, data) in component.data_injections.iter_mut().enumerate() {
        if is_url(&data.source) {
            continue;
        }
        let relative = format!("data/{}/{}", idx, file_name(&data.target.path)?);
        data.source = localize(resolver, paths, &data.source, &relative, &ResolveOptions::default()).await?;
    }

    for manifest in &mut component.manifests {
        for (idx, file) in manifest.files.iter_mut().enumerate() {
            if is_url(file) {
                continue;
            }
            let relative = format!("manifests/{}-{}.yaml", manifest.name, idx);
            *file = localize(resolver, paths, file, &relative, &ResolveOptions::default()).await?;
        }
        for (idx, kustomization) in manifest.kustomizations.iter_mut().enumerate() {
            if is_url(kustomization) {
                continue;
            }
            let relative = format!("manifests/kustomization-{}-{}", manifest.name, idx);
            *kustomization =
                localize(resolver, paths, kustomization, &relative, &ResolveOptions::default()).await?;
        }
    }
    Ok(())
}
