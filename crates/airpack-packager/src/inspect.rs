//! Reading and verifying built packages

use std::fmt;
use std::path::Path;

use airpack_core::checksums::VerificationResult;
use airpack_core::{
    ChecksumManifest, PACKAGE_YAML, PackageDefinition, PackagePaths, read_package_definition,
    signing,
};

use crate::distribution::unpack_package;
use crate::error::{PackagerError, Result};

/// Read the definition of a package archive, split archive or directory
/// without extracting the rest
pub fn inspect_package(path: &Path) -> Result<PackageDefinition> {
    if path.is_dir() {
        return Ok(PackageDefinition::load(path.join(PACKAGE_YAML))?);
    }
    Ok(read_package_definition(path)?)
}

/// Outcome of the signature check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    /// Verified against the given key; holds the trusted comment
    Verified(String),
    /// Signed, but no key was given
    NotVerified,
    Unsigned,
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureStatus::Verified(comment) if comment.is_empty() => write!(f, "signature verified"),
            SignatureStatus::Verified(comment) => write!(f, "signature verified ({})", comment),
            SignatureStatus::NotVerified => write!(f, "signature not verified"),
            SignatureStatus::Unsigned => write!(f, "package is not signed"),
        }
    }
}

/// Result of `verify_package`
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub definition: PackageDefinition,
    pub checksums: VerificationResult,
    /// Whether `checksums.txt` hashes to `metadata.aggregateChecksum`
    pub aggregate_matches: bool,
    pub signature: SignatureStatus,
}

impl VerifyReport {
    /// Content is intact; the signature status is reported separately
    pub fn is_valid(&self) -> bool {
        self.checksums.valid && self.aggregate_matches
    }
}

/// Re-hash every file of a package and check its signature
///
/// A package signed but checked without `public_key` is reported as
/// [`SignatureStatus::NotVerified`]. Asking for a key check on an unsigned
/// package is an error.
pub fn verify_package(path: &Path, public_key: Option<&Path>) -> Result<VerifyReport> {
    let staging = tempfile::Builder::new().prefix("airpack-verify-").tempdir()?;
    let root = if path.is_dir() {
        path.to_path_buf()
    } else {
        let dest = staging.path().join("package");
        unpack_package(path, staging.path(), &dest)?;
        dest
    };
    let paths = PackagePaths::new(&root);

    let definition = PackageDefinition::load(&paths.definition)?;
    let manifest = ChecksumManifest::load(&paths.base)?;
    let checksums = manifest.verify(&paths.base)?;
    let aggregate_matches = manifest.aggregate() == definition.metadata.aggregate_checksum;

    let signed = paths.signature.is_file();
    let signature = match (signed, public_key) {
        (true, Some(key)) => {
            let pk = signing::load_public_key(key)?;
            SignatureStatus::Verified(signing::verify_file(&paths.definition, &paths.signature, &pk)?)
        }
        (true, None) => SignatureStatus::NotVerified,
        (false, Some(_)) => {
            return Err(PackagerError::config(format!(
                "{} is not signed, so it cannot be verified against a key",
                path.display()
            )));
        }
        (false, None) => SignatureStatus::Unsigned,
    };

    tracing::debug!(
        package = %definition.metadata.name,
        files = manifest.entries.len(),
        valid = checksums.valid,
        aggregate_matches,
        "verified package"
    );
    Ok(VerifyReport {
        definition,
        checksums,
        aggregate_matches,
        signature,
    })
}
