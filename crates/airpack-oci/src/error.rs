//! Error types for registry operations

use std::path::PathBuf;
use thiserror::Error;

use airpack_core::CoreError;

/// Registry and cache errors
#[derive(Debug, Error)]
pub enum OciError {
    // ============ Reference Errors ============
    #[error("Invalid OCI reference: {reference} - {reason}")]
    InvalidReference { reference: String, reason: String },

    // ============ Registry Errors ============
    #[error("OCI manifest not found: {reference}")]
    ManifestNotFound { reference: String },

    #[error("{reference} has no linux/{architecture} image")]
    PlatformNotFound {
        reference: String,
        architecture: String,
    },

    #[error("Layer {title} not found in {reference}")]
    LayerNotFound { title: String, reference: String },

    #[error("Failed to {operation} {reference}: {message}")]
    Registry {
        operation: &'static str,
        reference: String,
        message: String,
    },

    #[error("Authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    // ============ Integrity Errors ============
    #[error("Integrity check failed for {name}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    // ============ IO Errors ============
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {path}: {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ============ Other ============
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, OciError>;

impl OciError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OciError::PathIo {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            OciError::Registry { message, .. } => !is_not_found_message(message),
            OciError::Io(_) | OciError::PathIo { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for OciError {
    fn from(e: serde_json::Error) -> Self {
        OciError::Serialization(e.to_string())
    }
}

/// Registries report missing content in many shapes; match the common ones
pub(crate) fn is_not_found_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("not found")
        || message.contains("manifest unknown")
        || message.contains("blob unknown")
        || message.contains("404")
}
