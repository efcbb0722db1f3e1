//! Registry access behind a trait
//!
//! `OciDistributionRegistry` talks to real registries; `MemoryRegistry` keeps
//! everything in process and counts fetches, which lets callers assert that a
//! cached digest is never downloaded twice.

use async_trait::async_trait;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::RegistryOperation;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use crate::credentials::Credentials;
use crate::error::{OciError, Result, is_not_found_message};
use crate::reference::OciReference;

/// A manifest together with its content digest
#[derive(Debug, Clone)]
pub struct RemoteManifest {
    pub manifest: OciImageManifest,
    pub digest: String,
}

/// Operations the transport needs from a registry
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a reference to an image manifest
    async fn fetch_manifest(&self, reference: &OciReference) -> Result<RemoteManifest>;

    /// Resolve a reference to the image manifest for `architecture`
    ///
    /// Multi-platform indexes are narrowed to their `linux/<architecture>`
    /// entry; a plain image manifest is returned as is.
    async fn fetch_image_manifest(
        &self,
        reference: &OciReference,
        architecture: &str,
    ) -> Result<RemoteManifest>;

    /// Download a blob into `dest`, replacing any existing file
    async fn fetch_blob(
        &self,
        reference: &OciReference,
        descriptor: &OciDescriptor,
        dest: &Path,
    ) -> Result<()>;

    /// Whether the repository already holds a blob
    async fn blob_exists(&self, reference: &OciReference, digest: &str) -> Result<bool>;

    /// Upload a blob
    async fn push_blob(&self, reference: &OciReference, data: Vec<u8>, digest: &str) -> Result<()>;

    /// Upload a manifest under the reference's tag, returning its digest
    async fn push_manifest(
        &self,
        reference: &OciReference,
        manifest: &OciImageManifest,
    ) -> Result<String>;
}

/// Digest of a manifest as serialized for upload
pub fn manifest_digest(manifest: &OciImageManifest) -> Result<(Vec<u8>, String)> {
    let data = serde_json::to_vec(manifest)?;
    let digest = sha256_digest(&data);
    Ok((data, digest))
}

/// `sha256:<hex>` of some bytes
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Transport settings for a registry client
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    /// Plain HTTP for every registry
    pub insecure: bool,
    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

impl RemoteOptions {
    /// Transport settings from the user configuration
    pub fn from_config(config: &airpack_core::Config) -> Self {
        Self {
            insecure: config.insecure,
            insecure_registries: config.insecure_registries.clone(),
        }
    }
}

/// Registry client backed by `oci-distribution`
pub struct OciDistributionRegistry {
    client: Client,
    credentials: Credentials,
}

impl OciDistributionRegistry {
    pub fn new(options: &RemoteOptions, credentials: Credentials) -> Self {
        // Plain HTTP is only ever an explicit choice, never a TLS fallback
        let protocol = if options.insecure {
            ClientProtocol::Http
        } else if !options.insecure_registries.is_empty() {
            ClientProtocol::HttpsExcept(options.insecure_registries.clone())
        } else {
            ClientProtocol::Https
        };

        let config = ClientConfig {
            protocol,
            ..Default::default()
        };

        Self {
            client: Client::new(config),
            credentials,
        }
    }

    async fn authenticate(
        &self,
        reference: &oci_distribution::Reference,
        registry: &str,
        operation: RegistryOperation,
    ) -> Result<()> {
        // Push tokens must carry both pull and push scopes, which the
        // push operation requests
        let auth = self.credentials.auth_for(registry);
        self.client
            .auth(reference, &auth, operation)
            .await
            .map_err(|e| OciError::AuthFailed {
                registry: registry.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// Digest of the `linux/<arch>` entry of an image index
pub fn resolve_platform(entries: &[ImageIndexEntry], arch: &str) -> Option<String> {
    entries
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

fn registry_error(operation: &'static str, reference: &OciReference, e: impl ToString) -> OciError {
    OciError::Registry {
        operation,
        reference: reference.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl Registry for OciDistributionRegistry {
    async fn fetch_manifest(&self, reference: &OciReference) -> Result<RemoteManifest> {
        let r = reference.to_distribution()?;
        let auth = self.credentials.auth_for(&reference.registry);
        match self.client.pull_image_manifest(&r, &auth).await {
            Ok((manifest, digest)) => Ok(RemoteManifest { manifest, digest }),
            Err(e) if is_not_found_message(&e.to_string()) => Err(OciError::ManifestNotFound {
                reference: reference.to_string(),
            }),
            Err(e) => Err(registry_error("fetch manifest", reference, e)),
        }
    }

    async fn fetch_image_manifest(
        &self,
        reference: &OciReference,
        architecture: &str,
    ) -> Result<RemoteManifest> {
        let r = reference.to_distribution()?;
        let auth = self.credentials.auth_for(&reference.registry);
        let (manifest, digest) = match self.client.pull_manifest(&r, &auth).await {
            Ok(pulled) => pulled,
            Err(e) if is_not_found_message(&e.to_string()) => {
                return Err(OciError::ManifestNotFound {
                    reference: reference.to_string(),
                });
            }
            Err(e) => return Err(registry_error("fetch manifest", reference, e)),
        };

        let index = match manifest {
            OciManifest::Image(manifest) => return Ok(RemoteManifest { manifest, digest }),
            OciManifest::ImageIndex(index) => index,
        };
        let platform_digest =
            resolve_platform(&index.manifests, architecture).ok_or_else(|| {
                OciError::PlatformNotFound {
                    reference: reference.to_string(),
                    architecture: architecture.to_string(),
                }
            })?;
        tracing::debug!(reference = %reference, architecture, digest = %platform_digest, "resolved platform manifest");
        let pinned = reference.with_digest(&platform_digest);
        self.fetch_manifest(&pinned).await
    }

    async fn fetch_blob(
        &self,
        reference: &OciReference,
        descriptor: &OciDescriptor,
        dest: &Path,
    ) -> Result<()> {
        let r = reference.to_distribution()?;
        self.authenticate(&r, &reference.registry, RegistryOperation::Pull)
            .await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| OciError::io(dest, e))?;
        self.client
            .pull_blob(&r, descriptor, &mut file)
            .await
            .map_err(|e| registry_error("fetch blob from", reference, e))?;
        file.flush().await.map_err(|e| OciError::io(dest, e))?;
        Ok(())
    }

    async fn blob_exists(&self, reference: &OciReference, digest: &str) -> Result<bool> {
        let r = reference.to_distribution()?;
        self.authenticate(&r, &reference.registry, RegistryOperation::Pull)
            .await?;

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };
        // Opening the stream only reads the response head; dropping it
        // abandons the body
        match self.client.pull_blob_stream(&r, &descriptor).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found_message(&e.to_string()) => Ok(false),
            Err(e) => Err(registry_error("check blob in", reference, e)),
        }
    }

    async fn push_blob(&self, reference: &OciReference, data: Vec<u8>, digest: &str) -> Result<()> {
        let r = reference.to_distribution()?;
        self.authenticate(&r, &reference.registry, RegistryOperation::Push)
            .await?;
        self.client
            .push_blob(&r, &data, digest)
            .await
            .map_err(|e| registry_error("push blob to", reference, e))?;
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &OciReference,
        manifest: &OciImageManifest,
    ) -> Result<String> {
        let r = reference.to_distribution()?;
        self.authenticate(&r, &reference.registry, RegistryOperation::Push)
            .await?;
        let (_, digest) = manifest_digest(manifest)?;
        self.client
            .push_manifest(&r, &OciManifest::Image(manifest.clone()))
            .await
            .map_err(|e| registry_error("push manifest to", reference, e))?;
        Ok(digest)
    }
}

/// In-process registry that records how often each blob is fetched
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    manifests: Mutex<HashMap<String, RemoteManifest>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// Index entries per reference: (architecture, manifest digest)
    platforms: Mutex<HashMap<String, Vec<(String, String)>>>,
    fetches: Mutex<HashMap<String, usize>>,
    pushes: Mutex<HashMap<String, usize>>,
}

fn poisoned() -> OciError {
    OciError::Serialization("registry state lock poisoned".to_string())
}

fn repository_key(reference: &OciReference) -> String {
    format!("{}/{}", reference.registry, reference.repository)
}

fn manifest_key(reference: &OciReference) -> String {
    let tag = reference
        .digest
        .clone()
        .or_else(|| reference.tag.clone())
        .unwrap_or_else(|| "latest".to_string());
    format!("{}:{}", repository_key(reference), tag)
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob and return its descriptor
    pub fn insert_blob(&self, media_type: &str, data: Vec<u8>) -> OciDescriptor {
        let digest = sha256_digest(&data);
        let size = data.len() as i64;
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(digest.clone(), data);
        }
        OciDescriptor {
            media_type: media_type.to_string(),
            digest,
            size,
            ..Default::default()
        }
    }

    /// Serve different bytes under an existing digest
    pub fn replace_blob(&self, digest: &str, data: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(digest.to_string(), data);
        }
    }

    /// Store a manifest under a reference
    pub fn insert_manifest(&self, reference: &OciReference, manifest: OciImageManifest) -> Result<String> {
        let (_, digest) = manifest_digest(&manifest)?;
        let mut manifests = self.manifests.lock().map_err(|_| poisoned())?;
        manifests.insert(
            manifest_key(reference),
            RemoteManifest {
                manifest,
                digest: digest.clone(),
            },
        );
        Ok(digest)
    }

    /// Store the `architecture` entry of a multi-platform index under a reference
    pub fn insert_platform_manifest(
        &self,
        reference: &OciReference,
        architecture: &str,
        manifest: OciImageManifest,
    ) -> Result<String> {
        let (_, digest) = manifest_digest(&manifest)?;
        self.insert_manifest(&reference.with_digest(&digest), manifest)?;
        self.platforms
            .lock()
            .map_err(|_| poisoned())?
            .entry(manifest_key(reference))
            .or_default()
            .push((architecture.to_string(), digest.clone()));
        Ok(digest)
    }

    /// Times a blob has been downloaded
    pub fn fetch_count(&self, digest: &str) -> usize {
        self.fetches
            .lock()
            .map(|f| f.get(digest).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Times a blob has been uploaded
    pub fn push_count(&self, digest: &str) -> usize {
        self.pushes
            .lock()
            .map(|p| p.get(digest).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blobs
            .lock()
            .map(|b| b.contains_key(digest))
            .unwrap_or(false)
    }

    /// Stored manifest for a reference
    pub fn manifest(&self, reference: &OciReference) -> Option<RemoteManifest> {
        self.manifests
            .lock()
            .ok()
            .and_then(|m| m.get(&manifest_key(reference)).cloned())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn fetch_manifest(&self, reference: &OciReference) -> Result<RemoteManifest> {
        self.manifest(reference)
            .ok_or_else(|| OciError::ManifestNotFound {
                reference: reference.to_string(),
            })
    }

    async fn fetch_image_manifest(
        &self,
        reference: &OciReference,
        architecture: &str,
    ) -> Result<RemoteManifest> {
        let entries = self
            .platforms
            .lock()
            .map_err(|_| poisoned())?
            .get(&manifest_key(reference))
            .cloned();
        let Some(entries) = entries else {
            return self.fetch_manifest(reference).await;
        };
        let digest = entries
            .iter()
            .find(|(arch, _)| arch == architecture)
            .map(|(_, digest)| digest.clone())
            .ok_or_else(|| OciError::PlatformNotFound {
                reference: reference.to_string(),
                architecture: architecture.to_string(),
            })?;
        self.fetch_manifest(&reference.with_digest(&digest)).await
    }

    async fn fetch_blob(
        &self,
        reference: &OciReference,
        descriptor: &OciDescriptor,
        dest: &Path,
    ) -> Result<()> {
        let data = {
            let blobs = self.blobs.lock().map_err(|_| poisoned())?;
            blobs
                .get(&descriptor.digest)
                .cloned()
                .ok_or_else(|| registry_error("fetch blob from", reference, "blob unknown"))?
        };
        {
            let mut fetches = self.fetches.lock().map_err(|_| poisoned())?;
            *fetches.entry(descriptor.digest.clone()).or_default() += 1;
        }
        tokio::fs::write(dest, data)
            .await
            .map_err(|e| OciError::io(dest, e))
    }

    async fn blob_exists(&self, _reference: &OciReference, digest: &str) -> Result<bool> {
        Ok(self.has_blob(digest))
    }

    async fn push_blob(&self, _reference: &OciReference, data: Vec<u8>, digest: &str) -> Result<()> {
        let actual = sha256_digest(&data);
        if actual != digest {
            return Err(OciError::IntegrityCheckFailed {
                name: "pushed blob".to_string(),
                expected: digest.to_string(),
                actual,
            });
        }
        self.blobs
            .lock()
            .map_err(|_| poisoned())?
            .insert(digest.to_string(), data);
        *self
            .pushes
            .lock()
            .map_err(|_| poisoned())?
            .entry(digest.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &OciReference,
        manifest: &OciImageManifest,
    ) -> Result<String> {
        self.insert_manifest(reference, manifest.clone())
    }
}
