//! CLI error types with exit code handling
//!
//! Library errors are folded into one enum whose variants map to exit
//! codes, so scripts can tell a bad definition from a tampered package.

use miette::Diagnostic;
use std::error::Error as StdError;
use thiserror::Error;

use airpack_core::CoreError;
use airpack_oci::OciError;
use airpack_packager::PackagerError;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// The package definition or the command input is invalid
    #[error("Configuration error: {message}")]
    #[diagnostic(code(airpack::cli::configuration))]
    Configuration {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Content does not match its declared checksum
    #[error("Integrity check failed: {message}")]
    #[diagnostic(
        code(airpack::cli::integrity),
        help("The content changed since its checksum was recorded; do not use it.")
    )]
    Integrity { message: String },

    /// Building or archiving the package failed
    #[error("Package error: {message}")]
    #[diagnostic(code(airpack::cli::package))]
    Package {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Registry or download failure worth retrying
    #[error("Network error: {message}")]
    #[diagnostic(
        code(airpack::cli::network),
        help("Check connectivity and credentials, then retry.")
    )]
    Network { message: String },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(airpack::cli::io))]
    Io { message: String },

    #[error("Operation cancelled")]
    #[diagnostic(code(airpack::cli::cancelled))]
    Cancelled,

    /// Wrapped error for passthrough (stores the formatted message)
    #[error("{message}")]
    #[diagnostic(code(airpack::cli::error))]
    Other { message: String },

    /// Internal error (runtime, unexpected failure)
    #[error("Internal error: {message}")]
    #[diagnostic(code(airpack::cli::internal))]
    Internal { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Configuration { .. } => exit_codes::CONFIGURATION_ERROR,
            CliError::Integrity { .. } => exit_codes::INTEGRITY_ERROR,
            CliError::Package { .. } => exit_codes::PACKAGE_ERROR,
            CliError::Network { .. } => exit_codes::NETWORK_ERROR,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Cancelled => exit_codes::CANCELLED,
            CliError::Other { .. } => exit_codes::ERROR,
            CliError::Internal { .. } => exit_codes::ERROR,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            help: None,
        }
    }

    /// Create a configuration error with help text
    pub fn configuration_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create an integrity error
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

/// Error message followed by every cause, `outer: inner: leaf`
pub fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn is_integrity(err: &PackagerError) -> bool {
    match err {
        PackagerError::IntegrityCheckFailed { .. }
        | PackagerError::Core(CoreError::ChecksumMismatch { .. })
        | PackagerError::Oci(OciError::IntegrityCheckFailed { .. }) => true,
        PackagerError::Component { source, .. }
        | PackagerError::Archive { source }
        | PackagerError::Publish { source }
        | PackagerError::ImagePull { source, .. } => is_integrity(source),
        _ => false,
    }
}

fn is_io(err: &PackagerError) -> bool {
    match err {
        PackagerError::Io(_) | PackagerError::PathIo { .. } => true,
        PackagerError::Core(CoreError::Io(_) | CoreError::PathIo { .. }) => true,
        PackagerError::Component { source, .. } | PackagerError::Archive { source } => is_io(source),
        _ => false,
    }
}

fn is_cancelled(err: &PackagerError) -> bool {
    match err {
        PackagerError::Cancelled | PackagerError::Oci(OciError::Cancelled) => true,
        PackagerError::Component { source, .. }
        | PackagerError::Archive { source }
        | PackagerError::Publish { source }
        | PackagerError::ImagePull { source, .. } => is_cancelled(source),
        _ => false,
    }
}

impl From<PackagerError> for CliError {
    fn from(err: PackagerError) -> Self {
        let message = error_chain(&err);
        if is_cancelled(&err) {
            CliError::Cancelled
        } else if is_integrity(&err) {
            CliError::Integrity { message }
        } else if err.is_configuration() {
            CliError::Configuration {
                message,
                help: None,
            }
        } else if is_io(&err) {
            CliError::Io { message }
        } else if err.is_transient() {
            CliError::Network { message }
        } else {
            CliError::Package {
                message,
                help: None,
            }
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        PackagerError::Core(err).into()
    }
}

impl From<OciError> for CliError {
    fn from(err: OciError) -> Self {
        PackagerError::Oci(err).into()
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<miette::Report> for CliError {
    fn from(err: miette::Report) -> Self {
        CliError::Other {
            message: format!("{:?}", err),
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_integrity_maps_to_integrity_exit() {
        let err = PackagerError::IntegrityCheckFailed {
            source_ref: "a.txt".to_string(),
            expected: "deadbeef".to_string(),
            actual: "8f434346".to_string(),
        }
        .in_component("web");

        let cli: CliError = err.into();
        assert_eq!(cli.exit_code(), exit_codes::INTEGRITY_ERROR);
        assert_eq!(
            cli.to_string(),
            "Integrity check failed: Unable to add component \"web\": Integrity check failed for a.txt: expected deadbeef, got 8f434346"
        );
    }

    #[test]
    fn test_classification() {
        let cli: CliError = PackagerError::config("bad import").into();
        assert_eq!(cli.exit_code(), exit_codes::CONFIGURATION_ERROR);

        let cli: CliError = PackagerError::Network {
            url: "https://example.com/a".to_string(),
            message: "connection reset".to_string(),
        }
        .into();
        assert_eq!(cli.exit_code(), exit_codes::NETWORK_ERROR);

        let cli: CliError = PackagerError::Cancelled.in_component("web").into();
        assert_eq!(cli.exit_code(), exit_codes::CANCELLED);

        let cli: CliError = CoreError::DifferentialNoVersion.into();
        assert_eq!(cli.exit_code(), exit_codes::CONFIGURATION_ERROR);
    }
}
