//! Checksum manifest for package integrity verification
//!
//! `checksums.txt` lists every file of a built package as `<sha256>  <path>`,
//! sorted by path. The SHA-256 of that text is the aggregate checksum stored in
//! the package metadata, so an external verifier can validate a transported
//! package without deploying it.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{CoreError, Result};
use crate::package::PACKAGE_YAML;

/// File name of the checksum sidecar inside a package
pub const CHECKSUMS_TXT: &str = "checksums.txt";

/// File name of the detached package signature
pub const SIGNATURE_FILE: &str = "airpack.yaml.sig";

/// Files that never appear in the checksum list (they embed the aggregate)
const EXCLUDED: &[&str] = &[CHECKSUMS_TXT, PACKAGE_YAML, SIGNATURE_FILE];

/// A file entry in the checksum manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    /// Relative path with forward slashes
    pub path: String,
    /// SHA-256 of the file contents
    pub sha256: String,
}

/// Ordered checksum list for a package directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    pub entries: Vec<ChecksumEntry>,
}

impl std::fmt::Display for ChecksumManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}  {}", entry.sha256, entry.path)?;
        }
        Ok(())
    }
}

impl ChecksumManifest {
    /// Hash every regular file under `root`, skipping the package definition,
    /// its signature and the checksum file itself
    pub fn generate(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| CoreError::Archive {
                message: format!("failed to walk {}: {}", root.display(), e),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let rel_path = relative_slash_path(root, entry.path());
            if EXCLUDED.contains(&rel_path.as_str()) {
                continue;
            }

            let hash = hash_file(entry.path())?;
            files.insert(rel_path, hash);
        }

        let entries = files
            .into_iter()
            .map(|(path, sha256)| ChecksumEntry { path, sha256 })
            .collect();

        Ok(Self { entries })
    }

    /// Parse the text form of `checksums.txt`
    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (sha256, path) = line.split_once("  ").ok_or_else(|| CoreError::Archive {
                message: format!("malformed checksum line {}: {:?}", idx + 1, line),
            })?;
            entries.push(ChecksumEntry {
                path: path.to_string(),
                sha256: sha256.to_string(),
            });
        }

        Ok(Self { entries })
    }

    /// Read `checksums.txt` from a package directory
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CHECKSUMS_TXT);
        let content = std::fs::read_to_string(&path).map_err(|e| CoreError::io(&path, e))?;
        Self::parse(&content)
    }

    /// Write `checksums.txt` into `root` and return the aggregate checksum
    pub fn write(&self, root: &Path) -> Result<String> {
        let path = root.join(CHECKSUMS_TXT);
        let content = self.to_string();
        std::fs::write(&path, &content).map_err(|e| CoreError::io(&path, e))?;
        Ok(hash_bytes(content.as_bytes()))
    }

    /// SHA-256 of the text form
    pub fn aggregate(&self) -> String {
        hash_bytes(self.to_string().as_bytes())
    }

    /// Re-hash every listed file relative to `root`
    pub fn verify(&self, root: &Path) -> Result<VerificationResult> {
        self.verify_files(|path| std::fs::read(root.join(path)))
    }

    /// Verify that all files match their checksums
    ///
    /// Takes a function that reads file content given a relative path
    pub fn verify_files<F>(&self, read_file: F) -> Result<VerificationResult>
    where
        F: Fn(&str) -> std::io::Result<Vec<u8>>,
    {
        let mut result = VerificationResult {
            valid: true,
            mismatched: Vec::new(),
            missing: Vec::new(),
        };

        for entry in &self.entries {
            match read_file(&entry.path) {
                Ok(content) => {
                    let actual = hash_bytes(&content);
                    if actual != entry.sha256 {
                        result.valid = false;
                        result.mismatched.push(MismatchedFile {
                            path: entry.path.clone(),
                            expected: entry.sha256.clone(),
                            actual,
                        });
                    }
                }
                Err(_) => {
                    result.valid = false;
                    result.missing.push(entry.path.clone());
                }
            }
        }

        Ok(result)
    }
}

/// Result of checksum verification
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Whether all verifications passed
    pub valid: bool,
    /// Files with mismatched checksums
    pub mismatched: Vec<MismatchedFile>,
    /// Files that are missing
    pub missing: Vec<String>,
}

/// A file with a mismatched checksum
#[derive(Debug, Clone)]
pub struct MismatchedFile {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

/// Calculate SHA-256 of a file
pub fn hash_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path).map_err(|e| CoreError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| CoreError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Calculate SHA-256 of bytes
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare the SHA-256 of a file against an expected value
///
/// The comparison is case-insensitive; an empty expectation always passes.
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    if expected.is_empty() {
        return Ok(());
    }
    let actual = hash_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(CoreError::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.to_lowercase(),
            actual,
        });
    }
    Ok(())
}

pub(crate) fn relative_slash_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
