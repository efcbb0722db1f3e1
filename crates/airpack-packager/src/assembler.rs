//! Component assembly
//!
//! One component is materialized into its own `ComponentPaths` tree in a
//! fixed order: before actions, charts, files, data injections, manifests,
//! repos, after actions. Any failure runs the component's `onFailure`
//! actions before the error is returned.

use std::path::{Path, PathBuf};

use airpack_core::layout::expand_files;
use airpack_core::{Component, ComponentPaths};

use crate::actions::ActionRunner;
use crate::error::{PackagerError, Result};
use crate::resolver::{ResolveOptions, Resolver, is_url};
use crate::tools::{Toolchain, repo_dir_name};

/// Final path segment of a declared target, used to name the stored copy
fn target_name(target: &str) -> Result<&str> {
    Path::new(target)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PackagerError::config(format!("invalid target path {:?}", target)))
}

/// Materializes components for one package
pub struct ComponentAssembler<'a> {
    resolver: &'a Resolver,
    tools: &'a Toolchain,
}

impl<'a> ComponentAssembler<'a> {
    pub fn new(resolver: &'a Resolver, tools: &'a Toolchain) -> Self {
        Self { resolver, tools }
    }

    /// Assemble `component` into `paths`
    ///
    /// Returns the SBOM-eligible files (resolved files and data injections,
    /// directories expanded). Errors carry the component name.
    pub async fn assemble(&self, component: &Component, paths: &ComponentPaths) -> Result<Vec<PathBuf>> {
        tracing::info!(component = %component.name, "assembling component");
        let actions = &component.actions.on_create;
        let runner = ActionRunner::new(self.resolver.base());

        let result = async {
            runner.run(&actions.defaults, &actions.before).await?;
            let sbom_files = self.add_content(component, paths).await?;
            runner.run(&actions.defaults, &actions.after).await?;
            runner.run(&actions.defaults, &actions.on_success).await?;
            Ok::<_, PackagerError>(sbom_files)
        }
        .await;

        match result {
            Ok(files) => Ok(files),
            Err(e) => {
                runner
                    .run_best_effort(&actions.defaults, &actions.on_failure)
                    .await;
                Err(e.in_component(&component.name))
            }
        }
    }

    async fn add_content(&self, component: &Component, paths: &ComponentPaths) -> Result<Vec<PathBuf>> {
        let base = self.resolver.base();
        let mut sbom_candidates = Vec::new();

        for chart in &component.charts {
            let archive = self.tools.charts.package(chart, base, &paths.charts).await?;
            tracing::debug!(chart = %chart.name, archive = %archive.display(), "packaged chart");
            for (idx, values) in chart.values_files.iter().enumerate() {
                let dest = paths.values.join(format!("{}-{}", chart.name, idx));
                self.resolver
                    .resolve(values, &dest, &ResolveOptions::default())
                    .await?;
            }
        }

        for (idx, file) in component.files.iter().enumerate() {
            let dest = paths
                .files
                .join(idx.to_string())
                .join(target_name(&file.target)?);
            let options = ResolveOptions::default()
                .checksum(&file.shasum)
                .extract_path(&file.extract_path)
                .executable(file.executable);
            self.resolver.resolve(&file.source, &dest, &options).await?;
            tracing::debug!(source = %file.source, dest = %dest.display(), "resolved file");
            sbom_candidates.push(dest);
        }

        for (idx, data) in component.data_injections.iter().enumerate() {
            let dest = paths
                .data_injections
                .join(idx.to_string())
                .join(target_name(&data.target.path)?);
            self.resolver
                .resolve(&data.source, &dest, &ResolveOptions::default())
                .await?;
            sbom_candidates.push(dest);
        }

        for manifest in &component.manifests {
            for (idx, file) in manifest.files.iter().enumerate() {
                let dest = paths
                    .manifests
                    .join(format!("{}-{}.yaml", manifest.name, idx));
                self.resolver
                    .resolve(file, &dest, &ResolveOptions::default())
                    .await?;
            }
            for (idx, kustomization) in manifest.kustomizations.iter().enumerate() {
                let dest = paths
                    .manifests
                    .join(format!("kustomization-{}-{}.yaml", manifest.name, idx));
                let dir = if is_url(kustomization) {
                    PathBuf::from(kustomization)
                } else {
                    base.join(kustomization)
                };
                std::fs::create_dir_all(&paths.manifests)
                    .map_err(|e| PackagerError::io(&paths.manifests, e))?;
                self.tools
                    .kustomize
                    .build(&dir, &dest, manifest.kustomize_allow_any_directory)
                    .await?;
            }
        }

        for repo in &component.repos {
            let (url, reference) = airpack_core::differential::split_repo_ref(repo);
            let dest = paths.repos.join(repo_dir_name(repo));
            if dest.exists() {
                std::fs::remove_dir_all(&dest).map_err(|e| PackagerError::io(&dest, e))?;
            }
            self.tools.git.clone_repo(url, reference, &dest).await?;
            tracing::debug!(repo = %repo, dest = %dest.display(), "cloned repository");
        }

        sbom_files(&sbom_candidates)
    }
}

/// Expand directories; paths that no longer exist are skipped
fn sbom_files(candidates: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in candidates {
        if !path.exists() {
            continue;
        }
        files.extend(expand_files(path)?);
    }
    Ok(files)
}
