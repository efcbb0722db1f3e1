//! Error types for the build pipeline

use std::path::PathBuf;
use thiserror::Error;

use airpack_core::CoreError;
use airpack_oci::OciError;

/// Build pipeline errors
#[derive(Debug, Error)]
pub enum PackagerError {
    // ============ Configuration Errors ============
    #[error("Invalid package configuration: {message}")]
    Config { message: String },

    #[error(
        "Component {component} imports {url}, whose component itself declares a remote import; nested remote imports are not supported"
    )]
    NestedRemoteImport { component: String, url: String },

    #[error("Import cycle detected: {chain}")]
    ImportCycle { chain: String },

    #[error("Component {name} not found in imported package {path}")]
    ImportedComponentNotFound { name: String, path: String },

    // ============ Integrity Errors ============
    #[error("Integrity check failed for {source_ref}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        source_ref: String,
        expected: String,
        actual: String,
    },

    // ============ Network Errors ============
    #[error("HTTP {status} while downloading {url}")]
    Http { url: String, status: u16 },

    #[error("Network error while downloading {url}: {message}")]
    Network { url: String, message: String },

    #[error(transparent)]
    Oci(#[from] OciError),

    #[error("Unable to pull image {image} after {attempts} attempts")]
    ImagePull {
        image: String,
        attempts: u32,
        #[source]
        source: Box<PackagerError>,
    },

    // ============ Lifecycle Errors ============
    #[error("Action `{command}` failed: {message}")]
    ActionFailed { command: String, message: String },

    #[error("{tool} failed for {target}: {message}")]
    Tool {
        tool: &'static str,
        target: String,
        message: String,
    },

    // ============ Wrapping ============
    #[error("Unable to add component {name:?}")]
    Component {
        name: String,
        #[source]
        source: Box<PackagerError>,
    },

    #[error("Unable to archive package")]
    Archive {
        #[source]
        source: Box<PackagerError>,
    },

    #[error("Unable to publish package")]
    Publish {
        #[source]
        source: Box<PackagerError>,
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

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for build operations
pub type Result<T> = std::result::Result<T, PackagerError>;

impl PackagerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PackagerError::PathIo {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PackagerError::Config {
            message: message.into(),
        }
    }

    /// Wrap with the name of the component being assembled
    pub fn in_component(self, name: &str) -> Self {
        PackagerError::Component {
            name: name.to_string(),
            source: Box::new(self),
        }
    }

    /// Whether a retry of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            PackagerError::Network { .. } | PackagerError::Io(_) | PackagerError::PathIo { .. } => {
                true
            }
            PackagerError::Http { status, .. } => *status >= 500 || *status == 429,
            PackagerError::Oci(e) => e.is_transient(),
            PackagerError::Tool { .. } => true,
            PackagerError::Component { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether the package definition itself is at fault
    pub fn is_configuration(&self) -> bool {
        match self {
            PackagerError::Config { .. }
            | PackagerError::NestedRemoteImport { .. }
            | PackagerError::ImportCycle { .. }
            | PackagerError::ImportedComponentNotFound { .. } => true,
            PackagerError::Core(e) => e.is_configuration(),
            PackagerError::Component { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}
