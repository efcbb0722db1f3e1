//! Differential packages
//!
//! A differential build drops images and repositories already shipped in a
//! base package, as long as their reference is pinned. Floating references
//! (`latest`, branches) are always kept since their content may have moved.

use std::collections::HashSet;

use crate::error::{CoreError, Result};
use crate::image::ImageRef;
use crate::package::PackageDefinition;

const FLOATING_TAGS: &[&str] = &["latest", "stable", "nightly"];

/// Content of the base package a differential build is compared against
#[derive(Debug, Clone, Default)]
pub struct DifferentialData {
    pub version: String,
    /// Normalized image references
    pub images: HashSet<String>,
    pub repos: HashSet<String>,
    pub components: Vec<String>,
}

impl DifferentialData {
    pub fn from_definition(base: &PackageDefinition) -> Result<Self> {
        let mut images = HashSet::new();
        let mut repos = HashSet::new();
        for component in &base.components {
            for image in &component.images {
                images.insert(ImageRef::parse(image)?.normalized());
            }
            repos.extend(component.repos.iter().cloned());
        }
        Ok(Self {
            version: base.metadata.version.clone(),
            images,
            repos,
            components: base.components.iter().map(|c| c.name.clone()).collect(),
        })
    }
}

/// Check the version pair before any differential work starts
pub fn validate_versions(base_version: &str, version: &str) -> Result<()> {
    if base_version.is_empty() || version.is_empty() {
        return Err(CoreError::DifferentialNoVersion);
    }
    if base_version == version {
        return Err(CoreError::DifferentialSameVersion {
            version: version.to_string(),
        });
    }
    Ok(())
}

/// Remove pinned images and repos already present in `base` and stamp build info
pub fn apply(pkg: &mut PackageDefinition, base: &DifferentialData) -> Result<()> {
    validate_versions(&base.version, &pkg.metadata.version)?;

    for component in &mut pkg.components {
        let mut images = Vec::with_capacity(component.images.len());
        for image in component.images.drain(..) {
            let parsed = ImageRef::parse(&image)?;
            if !is_floating_image(&parsed) && base.images.contains(&parsed.normalized()) {
                tracing::debug!(component = %component.name, image = %image, "image already in base package");
                continue;
            }
            images.push(image);
        }
        component.images = images;

        component.repos.retain(|repo| {
            let keep = is_floating_repo(repo) || !base.repos.contains(repo);
            if !keep {
                tracing::debug!(component = %component.name, repo = %repo, "repo already in base package");
            }
            keep
        });
    }

    let current: HashSet<&str> = pkg.components.iter().map(|c| c.name.as_str()).collect();
    pkg.build.differential = true;
    pkg.build.differential_package_version = base.version.clone();
    pkg.build.differential_missing = base
        .components
        .iter()
        .filter(|name| !current.contains(name.as_str()))
        .cloned()
        .collect();

    Ok(())
}

fn is_floating_image(image: &ImageRef) -> bool {
    image.digest.is_none()
        && image
            .tag
            .as_deref()
            .is_none_or(|tag| FLOATING_TAGS.contains(&tag))
}

/// Repos without a ref or pinned to a branch may change between builds
fn is_floating_repo(repo: &str) -> bool {
    match split_repo_ref(repo) {
        (_, None) => true,
        (_, Some(reference)) => reference.starts_with("refs/heads/"),
    }
}

/// Split `url@ref`, ignoring `@` in the userinfo part of the URL
pub fn split_repo_ref(repo: &str) -> (&str, Option<&str>) {
    let path_start = repo.find("://").map(|i| i + 3).unwrap_or(0);
    let host_end = repo[path_start..]
        .find('/')
        .map(|i| path_start + i)
        .unwrap_or(repo.len());
    match repo[host_end..].rfind('@') {
        Some(i) => {
            let at = host_end + i;
            (&repo[..at], Some(&repo[at + 1..]))
        }
        None => (repo, None),
    }
}
