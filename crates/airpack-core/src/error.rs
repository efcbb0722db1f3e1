//! Core error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Package definition not found: {path}")]
    PackageNotFound { path: String },

    #[error("Invalid package definition: {message}")]
    InvalidPackage { message: String },

    #[error("Invalid component {component:?}: {message}")]
    InvalidComponent { component: String, message: String },

    #[error("Component name {name:?} is used more than once")]
    DuplicateComponent { name: String },

    #[error("Failed to parse package definition: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {path}: {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid version {version:?}: {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("Invalid image reference {reference:?}: {message}")]
    InvalidImageReference { reference: String, message: String },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Archive error: {message}")]
    Archive { message: String },

    #[error("Cannot create differential package: package version and differential version are both {version:?}")]
    DifferentialSameVersion { version: String },

    #[error("Cannot create differential package: a version must be set on both the package and the differential package")]
    DifferentialNoVersion,

    #[error("Signing error: {message}")]
    Signing { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// Attach a path to an IO error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::PathIo {
            path: path.into(),
            source,
        }
    }

    /// Whether the error reflects an invalid definition rather than a runtime failure
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidPackage { .. }
                | CoreError::InvalidComponent { .. }
                | CoreError::DuplicateComponent { .. }
                | CoreError::InvalidVersion { .. }
                | CoreError::DifferentialSameVersion { .. }
                | CoreError::DifferentialNoVersion
                | CoreError::Config { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
