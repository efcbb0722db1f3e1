//! Content-addressed cache for remote package content
//!
//! ```text
//! <cache>/oci/blobs/sha256/<hex>    raw layer bytes
//! <cache>/oci/dirs/<hex|identity>   extracted directory form
//! ```
//!
//! Entries are immutable once present. Writers stage into a sibling
//! `.partial-<random>` path and rename; a final path that already exists is
//! never rewritten, so concurrent writers of the same digest need no lock.

use oci_distribution::manifest::OciDescriptor;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use airpack_core::archive::extract_stripped;
use airpack_core::checksums::hash_file;
use airpack_core::layout::create_private_dir;

use crate::error::{OciError, Result};
use crate::reference::OciReference;
use crate::registry::Registry;

/// Disk cache shared by every remote fetch in the process
#[derive(Debug, Clone)]
pub struct OciCache {
    root: PathBuf,
    blobs: PathBuf,
    dirs: PathBuf,
}

/// Sibling path used while staging `path`
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".partial-{:016x}", rand::random::<u64>()));
    path.with_file_name(name)
}

/// Move a staged path into place unless another writer got there first
pub(crate) fn commit_partial(partial: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        remove_path(partial);
        return Ok(());
    }
    if let Err(e) = std::fs::rename(partial, target) {
        remove_path(partial);
        if target.exists() {
            return Ok(());
        }
        return Err(OciError::io(target, e));
    }
    Ok(())
}

pub(crate) fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(e) = result
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %e, "failed to remove staging path");
    }
}

/// Verify a staged file against a `sha256:<hex>` digest
pub(crate) fn verify_digest(path: &Path, name: &str, digest: &str) -> Result<()> {
    let expected = digest.trim_start_matches("sha256:");
    let actual = hash_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(OciError::IntegrityCheckFailed {
            name: name.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Fetch a blob into a content-addressed `target` unless it is already there
///
/// Returns whether a transfer happened. The bytes are verified against the
/// descriptor digest before the file appears at `target`.
pub async fn fetch_blob_to(
    registry: &dyn Registry,
    reference: &OciReference,
    descriptor: &OciDescriptor,
    target: &Path,
) -> Result<bool> {
    if target.is_file() {
        tracing::debug!(digest = %descriptor.digest, "blob already present");
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| OciError::io(parent, e))?;
    }

    let partial = partial_path(target);
    let fetched = async {
        registry.fetch_blob(reference, descriptor, &partial).await?;
        verify_digest(&partial, &descriptor.digest, &descriptor.digest)
    }
    .await;
    if let Err(e) = fetched {
        remove_path(&partial);
        return Err(e);
    }

    commit_partial(&partial, target)?;
    tracing::debug!(digest = %descriptor.digest, "fetched blob");
    Ok(true)
}

impl OciCache {
    /// Open (and create) a cache rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let cache = Self {
            blobs: root.join("blobs").join("sha256"),
            dirs: root.join("dirs"),
            root,
        };
        create_private_dir(&cache.blobs)?;
        create_private_dir(&cache.dirs)?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a blob given `sha256:<hex>` or `<hex>`
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs.join(digest.trim_start_matches("sha256:"))
    }

    /// Path of an extracted directory
    pub fn dir_path(&self, key: &str) -> PathBuf {
        self.dirs.join(key.trim_start_matches("sha256:"))
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Ensure a blob is cached, fetching it at most once
    ///
    /// A blob already on disk is trusted without re-hashing.
    pub async fn fetch_blob(
        &self,
        registry: &dyn Registry,
        reference: &OciReference,
        descriptor: &OciDescriptor,
    ) -> Result<PathBuf> {
        let target = self.blob_path(&descriptor.digest);
        fetch_blob_to(registry, reference, descriptor, &target).await?;
        Ok(target)
    }

    /// Extract a cached tarball into `dirs/<key>`, dropping `strip` leading
    /// path components
    ///
    /// Nothing happens when the directory already exists.
    pub fn extract_dir(&self, blob: &Path, key: &str, strip: usize) -> Result<PathBuf> {
        let target = self.dir_path(key);
        if target.is_dir() {
            return Ok(target);
        }

        let partial = partial_path(&target);
        if let Err(e) = extract_stripped(blob, &partial, strip) {
            remove_path(&partial);
            return Err(e.into());
        }
        commit_partial(&partial, &target)?;
        Ok(target)
    }

    /// An empty directory under `dirs/<key>`, for content with no packaged files
    pub fn empty_dir(&self, key: &str) -> Result<PathBuf> {
        let target = self.dir_path(key);
        create_private_dir(&target)?;
        Ok(target)
    }
}

/// Cache key for content that has no digest of its own
pub fn identity_key(url: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())
}
