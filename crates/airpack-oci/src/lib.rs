//! Airpack OCI - registry transport for airpack packages
//!
//! Provides:
//! - `OciReference`: `oci://` package references and tag conventions
//! - `Registry`: the registry seam, with a real client and an in-memory one
//! - `OciRemote`: pull and publish of whole packages, layer by layer
//! - `OciCache`: the content-addressed cache used for remote imports
//! - `Credentials`: credential lookup from the Docker config

pub mod credentials;
pub mod error;
pub mod reference;
pub mod registry;
pub mod remote;
pub mod store;

pub use credentials::{Credentials, DockerConfig};
pub use error::{OciError, Result};
pub use reference::{OCI_SCHEME, OciReference, package_tag, skeleton_tag};
pub use registry::{
    MemoryRegistry, OciDistributionRegistry, Registry, RemoteManifest, RemoteOptions,
    manifest_digest, sha256_digest,
};
pub use remote::{OciRemote, RootManifest, TransferSummary, is_empty, layer_media_type};
pub use store::{OciCache, fetch_blob_to, identity_key};

// Re-exported so callers can build descriptors without a direct dependency
pub use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
