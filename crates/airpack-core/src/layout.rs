//! On-disk layout of a package being built
//!
//! ```text
//! <base>/airpack.yaml
//! <base>/checksums.txt
//! <base>/airpack.yaml.sig
//! <base>/components/<name>/{files,data,manifests,charts,values,repos,temp}
//! <base>/components/<name>.tar
//! <base>/images/          OCI image layout
//! <base>/sboms.tar
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::checksums::{CHECKSUMS_TXT, SIGNATURE_FILE, relative_slash_path};
use crate::error::{CoreError, Result};
use crate::package::PACKAGE_YAML;

pub const COMPONENTS_DIR: &str = "components";
pub const IMAGES_DIR: &str = "images";
pub const SBOMS_TAR: &str = "sboms.tar";
pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const INDEX_JSON: &str = "index.json";

/// Paths of a package build directory
#[derive(Debug)]
pub struct PackagePaths {
    pub base: PathBuf,
    pub definition: PathBuf,
    pub checksums: PathBuf,
    pub signature: PathBuf,
    pub components: PathBuf,
    pub images: ImagePaths,
    pub sboms: PathBuf,
    claimed: HashSet<String>,
}

/// OCI image layout inside the package
#[derive(Debug, Clone)]
pub struct ImagePaths {
    pub base: PathBuf,
    pub blobs: PathBuf,
    pub index: PathBuf,
    pub oci_layout: PathBuf,
}

impl ImagePaths {
    fn new(base: PathBuf) -> Self {
        Self {
            blobs: base.join("blobs").join("sha256"),
            index: base.join(INDEX_JSON),
            oci_layout: base.join(OCI_LAYOUT_FILE),
            base,
        }
    }

    /// Path of a blob given `sha256:<hex>` or `<hex>`
    pub fn blob(&self, digest: &str) -> PathBuf {
        self.blobs.join(digest.trim_start_matches("sha256:"))
    }
}

impl PackagePaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            definition: base.join(PACKAGE_YAML),
            checksums: base.join(CHECKSUMS_TXT),
            signature: base.join(SIGNATURE_FILE),
            components: base.join(COMPONENTS_DIR),
            images: ImagePaths::new(base.join(IMAGES_DIR)),
            sboms: base.join(SBOMS_TAR),
            claimed: HashSet::new(),
            base,
        }
    }

    /// Create a fresh, exclusively owned directory tree for one component
    ///
    /// Any leftover directory from a previous run is removed first. Claiming the
    /// same name twice is an error.
    pub fn create_component_paths(&mut self, name: &str) -> Result<ComponentPaths> {
        if !self.claimed.insert(name.to_string()) {
            return Err(CoreError::DuplicateComponent {
                name: name.to_string(),
            });
        }

        let paths = ComponentPaths::new(self.components.join(name));
        if paths.base.exists() {
            std::fs::remove_dir_all(&paths.base).map_err(|e| CoreError::io(&paths.base, e))?;
        }
        for dir in paths.all_dirs() {
            create_private_dir(dir)?;
        }
        Ok(paths)
    }

    /// Paths of a component that may or may not have been created
    pub fn component(&self, name: &str) -> ComponentPaths {
        ComponentPaths::new(self.components.join(name))
    }

    /// Path of the archived component tarball
    pub fn component_tarball(&self, name: &str) -> PathBuf {
        self.components.join(format!("{}.tar", name))
    }

    /// Every regular file in the build directory, keyed by relative slash path
    pub fn files(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut files = BTreeMap::new();
        if !self.base.exists() {
            return Ok(files);
        }
        for entry in WalkDir::new(&self.base) {
            let entry = entry.map_err(|e| CoreError::Archive {
                message: format!("failed to walk {}: {}", self.base.display(), e),
            })?;
            if entry.file_type().is_file() {
                files.insert(
                    relative_slash_path(&self.base, entry.path()),
                    entry.path().to_path_buf(),
                );
            }
        }
        Ok(files)
    }
}

/// Per-component assembly directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentPaths {
    pub base: PathBuf,
    pub temp: PathBuf,
    pub files: PathBuf,
    pub charts: PathBuf,
    pub values: PathBuf,
    pub repos: PathBuf,
    pub manifests: PathBuf,
    pub data_injections: PathBuf,
}

impl ComponentPaths {
    pub fn new(base: PathBuf) -> Self {
        Self {
            temp: base.join("temp"),
            files: base.join("files"),
            charts: base.join("charts"),
            values: base.join("values"),
            repos: base.join("repos"),
            manifests: base.join("manifests"),
            data_injections: base.join("data"),
            base,
        }
    }

    fn all_dirs(&self) -> [&Path; 8] {
        [
            &self.base,
            &self.temp,
            &self.files,
            &self.charts,
            &self.values,
            &self.repos,
            &self.manifests,
            &self.data_injections,
        ]
    }

    /// Remove the scratch directory and any empty content directories
    pub fn cleanup(&self) -> Result<()> {
        if self.temp.exists() {
            std::fs::remove_dir_all(&self.temp).map_err(|e| CoreError::io(&self.temp, e))?;
        }
        for dir in &self.all_dirs()[2..] {
            if dir.exists() && is_empty_dir(dir)? {
                std::fs::remove_dir(dir).map_err(|e| CoreError::io(dir, e))?;
            }
        }
        Ok(())
    }

    /// Whether any content landed in the component directory
    pub fn has_content(&self) -> Result<bool> {
        if !self.base.exists() {
            return Ok(false);
        }
        Ok(!expand_files(&self.base)?.is_empty())
    }
}

/// List regular files under `path`, or `path` itself when it is a file
pub fn expand_files(path: &Path) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(path).map_err(|e| CoreError::io(path, e))?;
    if !meta.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|e| CoreError::Archive {
            message: format!("failed to walk {}: {}", path.display(), e),
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Create a directory readable only by the owner
pub fn create_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| CoreError::io(path, e))?;
    crate::package::set_mode(path, 0o700)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(path).map_err(|e| CoreError::io(path, e))?;
    Ok(entries.next().is_none())
}
