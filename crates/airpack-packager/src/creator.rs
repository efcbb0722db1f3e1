//! Package creation
//!
//! `PackageCreator` runs the three build phases in order:
//! 1. load the definition: stamp build metadata, compose imports, run
//!    extensions, drop content already shipped by a differential base
//! 2. assemble every component, then pull the aggregated image list
//! 3. output: archive components, write checksums and the final
//!    definition, sign, then write the archive or publish to a registry

use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use airpack_core::archive::{archive_component, archive_name, create_package_archive};
use airpack_core::differential::{self, DifferentialData};
use airpack_core::split::split_archive;
use airpack_core::{
    ChecksumManifest, Component, PACKAGE_YAML, PackageDefinition, PackagePaths, Progress,
    read_package_definition, signing,
};
use airpack_oci::{OCI_SCHEME, OciCache, OciReference, OciRemote, Registry};

use crate::assembler::ComponentAssembler;
use crate::composer::{Composer, RemoteImports};
use crate::error::{PackagerError, Result};
use crate::images::{ImageAggregator, ImagePuller, PulledImage, RetryPolicy, collect_images};
use crate::resolver::Resolver;
use crate::tools::Toolchain;

/// Migrations every newly built package is considered to have applied
pub const MIGRATIONS: &[&str] = &["scripts-to-actions", "pluralize-set-variable"];

/// Mode of the final `airpack.yaml`
const DEFINITION_MODE: u32 = 0o400;

/// Hook that may extend components while the definition loads
pub trait ComponentExtension: Send + Sync {
    fn name(&self) -> &str;

    /// Mutate `component`, e.g. append images, repos or manifests
    fn extend(&self, component: &mut Component, base: &Path) -> Result<()>;
}

/// Parameters of `airpack package create`
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Directory holding `airpack.yaml`
    pub base_dir: PathBuf,
    /// Output directory, or an `oci://` repository to publish into
    pub output: String,
    /// Split the archive into parts of this many MB; 0 disables splitting
    pub max_package_size_mb: u64,
    pub signing_key: Option<PathBuf>,
    pub signing_key_password: Option<String>,
    /// Previous package archive a differential build is compared against
    pub differential: Option<PathBuf>,
    pub skip_sbom: bool,
    /// Added to `build.registryOverrides`; these win over the definition
    pub registry_overrides: IndexMap<String, String>,
    /// Target architecture when the definition does not set one
    pub architecture: String,
    /// Parent of the build directory; the system temp dir when unset
    pub tmp_dir: Option<PathBuf>,
    pub oci_concurrency: usize,
}

/// Where a created package ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutput {
    Archive {
        path: PathBuf,
        /// Split parts, metadata part first; empty when not split
        parts: Vec<PathBuf>,
    },
    Published {
        reference: String,
        digest: String,
    },
}

/// What assembly produced besides the component directories
#[derive(Debug, Clone, Default)]
pub struct AssemblyReport {
    pub images: Vec<PulledImage>,
    /// SBOM-eligible files per component
    pub sbom_files: BTreeMap<String, Vec<PathBuf>>,
}

/// Builds one package
pub struct PackageCreator {
    options: CreateOptions,
    tools: Toolchain,
    puller: Arc<dyn ImagePuller>,
    registry: Option<Arc<dyn Registry>>,
    cache: Option<OciCache>,
    extensions: Vec<Box<dyn ComponentExtension>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl PackageCreator {
    pub fn new(options: CreateOptions, tools: Toolchain, puller: Arc<dyn ImagePuller>) -> Self {
        Self {
            options,
            tools,
            puller,
            registry: None,
            cache: None,
            extensions: Vec::new(),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Registry used for remote imports and `oci://` output
    pub fn with_registry(mut self, registry: Arc<dyn Registry>, cache: OciCache) -> Self {
        self.registry = Some(registry);
        self.cache = Some(cache);
        self
    }

    pub fn with_extension(mut self, extension: Box<dyn ComponentExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &CreateOptions {
        &self.options
    }

    /// Run every phase in a fresh build directory
    pub async fn create(&self, progress: &dyn Progress) -> Result<CreateOutput> {
        let build_dir = self.build_dir()?;
        let mut paths = PackagePaths::new(build_dir.path());

        let mut pkg = self.load_package_definition(progress).await?;
        self.assemble(&pkg, &mut paths, progress).await?;
        self.output(&mut pkg, &paths, progress).await
    }

    fn build_dir(&self) -> Result<tempfile::TempDir> {
        let builder = tempfile::Builder::new().prefix("airpack-").tempdir_in(
            self.options
                .tmp_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        );
        builder.map_err(|e| PackagerError::io(self.options.tmp_dir.clone().unwrap_or_default(), e))
    }

    /// Load and prepare the definition in `base_dir`
    pub async fn load_package_definition(&self, progress: &dyn Progress) -> Result<PackageDefinition> {
        let base = &self.options.base_dir;
        let mut pkg = PackageDefinition::load(base.join(PACKAGE_YAML))?;
        pkg.validate()?;

        // Checked before any work so a bad version pair fails fast
        let differential = match &self.options.differential {
            Some(path) => {
                let data = load_differential(path)?;
                differential::validate_versions(&data.version, &pkg.metadata.version)?;
                Some(data)
            }
            None => None,
        };

        stamp_build_metadata(&mut pkg, &self.options);

        let mut composer = Composer::new(base, pkg.architecture().to_string())?;
        if let (Some(registry), Some(cache)) = (&self.registry, &self.cache) {
            composer = composer.with_remote(RemoteImports::new(registry.clone(), cache.clone()));
        }
        composer.compose_package(&mut pkg, progress).await?;

        for extension in &self.extensions {
            for component in &mut pkg.components {
                tracing::debug!(extension = %extension.name(), component = %component.name, "running extension");
                extension.extend(component, base)?;
            }
        }

        if let Some(data) = differential {
            differential::apply(&mut pkg, &data)?;
        }

        pkg.validate()?;
        Ok(pkg)
    }

    /// Assemble every component in declared order, then pull images and
    /// catalog the SBOM
    pub async fn assemble(
        &self,
        pkg: &PackageDefinition,
        paths: &mut PackagePaths,
        progress: &dyn Progress,
    ) -> Result<AssemblyReport> {
        let resolver = Resolver::new(&self.options.base_dir, self.tools.git.clone())?
            .with_cancellation(self.cancel.clone());
        let assembler = ComponentAssembler::new(&resolver, &self.tools);
        let mut report = AssemblyReport::default();

        for component in &pkg.components {
            progress.start(&format!("Adding component {}", component.name));
            let component_paths = paths
                .create_component_paths(&component.name)
                .map_err(|e| PackagerError::from(e).in_component(&component.name))?;
            match assembler.assemble(component, &component_paths).await {
                Ok(files) => {
                    component_paths
                        .cleanup()
                        .map_err(|e| PackagerError::from(e).in_component(&component.name))?;
                    if !files.is_empty() {
                        report.sbom_files.insert(component.name.clone(), files);
                    }
                    progress.success(&format!("Added component {}", component.name));
                }
                Err(e) => {
                    progress.fail(&format!("Unable to add component {}", component.name));
                    return Err(e);
                }
            }
        }

        let images = collect_images(&pkg.components, &pkg.build.registry_overrides)?;
        if !images.is_empty() {
            let aggregator = ImageAggregator::new(self.puller.clone())
                .with_retry(self.retry)
                .with_concurrency(self.concurrency())
                .with_cancellation(self.cancel.clone());
            report.images = aggregator
                .pull_all(&images, pkg.architecture(), &paths.images, progress)
                .await?;
        }

        if self.options.skip_sbom {
            tracing::debug!("skipping SBOM cataloging");
        } else {
            let layered: Vec<_> = report
                .images
                .iter()
                .filter(|p| p.has_layers)
                .map(|p| p.image.clone())
                .collect();
            if !report.sbom_files.is_empty() || !layered.is_empty() {
                // SBOM failures are reported, never fatal
                if let Err(e) = self
                    .tools
                    .sbom
                    .catalog(&paths.base, &report.sbom_files, &layered, &paths.sboms)
                    .await
                {
                    tracing::warn!(error = %e, "unable to create SBOM, continuing without it");
                    if paths.sboms.exists() {
                        std::fs::remove_file(&paths.sboms)
                            .map_err(|e| PackagerError::io(&paths.sboms, e))?;
                    }
                    progress.update("Skipped SBOM");
                }
            }
        }

        Ok(report)
    }

    /// Archive the assembled build directory or publish it
    pub async fn output(
        &self,
        pkg: &mut PackageDefinition,
        paths: &PackagePaths,
        progress: &dyn Progress,
    ) -> Result<CreateOutput> {
        finalize(pkg, paths, self.options.signing_key.as_deref(), self.options.signing_key_password.as_deref())
            .map_err(|e| PackagerError::Archive { source: Box::new(e) })?;

        if self.options.output.starts_with(OCI_SCHEME) {
            let (reference, digest) = self
                .publish(pkg, paths, progress)
                .await
                .map_err(|e| PackagerError::Publish { source: Box::new(e) })?;
            return Ok(CreateOutput::Published { reference, digest });
        }

        let output_dir = if self.options.output.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&self.options.output)
        };
        write_archive(pkg, paths, &output_dir, self.options.max_package_size_mb, progress)
            .map_err(|e| PackagerError::Archive { source: Box::new(e) })
    }

    async fn publish(
        &self,
        pkg: &PackageDefinition,
        paths: &PackagePaths,
        progress: &dyn Progress,
    ) -> Result<(String, String)> {
        let registry = self.registry.clone().ok_or_else(|| {
            PackagerError::config(format!("publishing to {} needs a registry", self.options.output))
        })?;
        let reference = OciReference::for_package(&self.options.output, pkg)?;
        let remote = OciRemote::new(registry, reference.clone())
            .with_concurrency(self.concurrency())
            .with_cancellation(self.cancel.clone());
        let digest = remote.publish_dir(&paths.base, pkg, progress).await?;
        Ok((reference.to_string(), digest))
    }

    fn concurrency(&self) -> usize {
        if self.options.oci_concurrency == 0 {
            airpack_oci::remote::DEFAULT_CONCURRENCY
        } else {
            self.options.oci_concurrency
        }
    }
}

/// Read the definition of a differential base, from an archive or a directory
fn load_differential(path: &Path) -> Result<DifferentialData> {
    let base = if path.is_dir() {
        PackageDefinition::load(path)?
    } else {
        read_package_definition(path)?
    };
    Ok(DifferentialData::from_definition(&base)?)
}

pub(crate) fn stamp_build_metadata(pkg: &mut PackageDefinition, options: &CreateOptions) {
    if pkg.metadata.architecture.is_empty() && !pkg.is_skeleton() {
        pkg.metadata.architecture = options.architecture.clone();
    }
    let arch = pkg.architecture().to_string();
    let build = &mut pkg.build;
    build.architecture = arch;
    build.terminal = hostname();
    build.user = username();
    build.timestamp = chrono::Local::now().to_rfc2822();
    build.version = env!("CARGO_PKG_VERSION").to_string();
    for (from, to) in &options.registry_overrides {
        build.registry_overrides.insert(from.clone(), to.clone());
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_default()
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

/// Archive components, write checksums and the final definition, then sign
///
/// After this the build directory holds exactly what gets shipped.
pub(crate) fn finalize(
    pkg: &mut PackageDefinition,
    paths: &PackagePaths,
    signing_key: Option<&Path>,
    signing_key_password: Option<&str>,
) -> Result<()> {
    for component in &pkg.components {
        archive_component(paths, &component.name)?;
    }

    let checksums = ChecksumManifest::generate(&paths.base)?;
    pkg.metadata.aggregate_checksum = checksums.write(&paths.base)?;
    pkg.build.migrations = MIGRATIONS.iter().map(|m| m.to_string()).collect();
    pkg.write(&paths.definition, DEFINITION_MODE)?;

    if let Some(key) = signing_key {
        let secret = signing::load_secret_key(key, signing_key_password)?;
        let comment = format!(
            "airpack package {} {} {}",
            pkg.metadata.name,
            pkg.metadata.version,
            pkg.metadata.aggregate_checksum
        );
        signing::sign_file(&paths.definition, &paths.signature, &secret, &comment)?;
    }
    Ok(())
}

fn write_archive(
    pkg: &PackageDefinition,
    paths: &PackagePaths,
    output_dir: &Path,
    max_package_size_mb: u64,
    progress: &dyn Progress,
) -> Result<CreateOutput> {
    let archive = output_dir.join(archive_name(pkg));
    if archive.exists() {
        std::fs::remove_file(&archive).map_err(|e| PackagerError::io(&archive, e))?;
    }

    progress.start(&format!("Writing {}", archive.display()));
    create_package_archive(&paths.base, &archive, pkg.metadata.uncompressed)?;
    let parts = split_archive(&archive, max_package_size_mb)?;
    if parts.is_empty() {
        progress.success(&format!("Wrote {}", archive.display()));
    } else {
        progress.success(&format!("Wrote {} in {} parts", archive.display(), parts.len() - 1));
    }
    Ok(CreateOutput::Archive {
        path: archive,
        parts,
    })
}
