//! `oci://` references for published packages

use std::fmt;

use airpack_core::PackageDefinition;
use airpack_core::package::SKELETON_ARCH;

use crate::error::{OciError, Result};

pub const OCI_SCHEME: &str = "oci://";

/// A parsed `oci://registry/repository[:tag][@digest]` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OciReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl OciReference {
    /// Parse an OCI reference, with or without the `oci://` scheme
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| OciError::InvalidReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        let clean = s.trim().trim_start_matches(OCI_SCHEME);
        if clean.contains("://") {
            return Err(invalid("only the oci:// scheme is supported"));
        }

        let (registry, rest) = clean
            .split_once('/')
            .ok_or_else(|| invalid("expected registry/repository"))?;
        if registry.is_empty() || rest.is_empty() {
            return Err(invalid("expected registry/repository"));
        }

        let (repo_tag, digest) = match rest.rsplit_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (rest, None),
        };

        let last_slash = repo_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match repo_tag[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (
                    repo_tag[..split].to_string(),
                    Some(repo_tag[split + 1..].to_string()),
                )
            }
            None => (repo_tag.to_string(), None),
        };

        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(invalid("missing repository or tag"));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag,
            digest,
        })
    }

    /// Reference of a package under a base repository
    ///
    /// `oci://ghcr.io/org/packages` + `demo` 1.0.0 amd64 becomes
    /// `ghcr.io/org/packages/demo:1.0.0-amd64`.
    pub fn for_package(base: &str, pkg: &PackageDefinition) -> Result<Self> {
        let mut reference = Self::parse(base)?;
        if reference.tag.is_some() || reference.digest.is_some() {
            return Err(OciError::InvalidReference {
                reference: base.to_string(),
                reason: "publish target must be a repository without tag or digest".to_string(),
            });
        }
        reference.repository = format!("{}/{}", reference.repository, pkg.metadata.name);
        reference.tag = Some(package_tag(&pkg.metadata.version, pkg.architecture()));
        Ok(reference)
    }

    /// Same repository with another tag
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        }
    }

    /// Convert to string representation without scheme
    pub fn to_oci_string(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// The same repository pinned to `digest`
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Convert to the client library's reference type
    pub fn to_distribution(&self) -> Result<oci_distribution::Reference> {
        self.to_oci_string()
            .parse::<oci_distribution::Reference>()
            .map_err(|e| OciError::InvalidReference {
                reference: self.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for OciReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", OCI_SCHEME, self.to_oci_string())
    }
}

/// Tag of a package: `<version>-<arch>`, with `+` replaced since tags cannot carry it
pub fn package_tag(version: &str, arch: &str) -> String {
    let version = version.replace('+', "_");
    match (version.is_empty(), arch.is_empty()) {
        (true, true) => "latest".to_string(),
        (true, false) => arch.to_string(),
        (false, true) => version,
        (false, false) => format!("{}-{}", version, arch),
    }
}

/// Tag of the skeleton form of a package version
pub fn skeleton_tag(version: &str) -> String {
    package_tag(version, SKELETON_ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let r = OciReference::parse("oci://ghcr.io/org/packages/demo:1.0.0-amd64").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/packages/demo");
        assert_eq!(r.tag.as_deref(), Some("1.0.0-amd64"));
        assert!(r.digest.is_none());

        let r = OciReference::parse("localhost:5000/demo@sha256:abc").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "demo");
        assert!(r.tag.is_none());
        assert_eq!(r.digest.as_deref(), Some("sha256:abc"));
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(OciReference::parse("https://ghcr.io/org/demo").is_err());
        assert!(OciReference::parse("oci://ghcr.io").is_err());
        assert!(OciReference::parse("oci://ghcr.io/demo:").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let s = "oci://ghcr.io/org/demo:1.0.0@sha256:abc";
        assert_eq!(OciReference::parse(s).unwrap().to_string(), s);
    }

    #[test]
    fn test_for_package() {
        let mut pkg = PackageDefinition::default();
        pkg.metadata.name = "demo".to_string();
        pkg.metadata.version = "1.0.0+build.5".to_string();
        pkg.metadata.architecture = "arm64".to_string();

        let r = OciReference::for_package("oci://ghcr.io/org/packages", &pkg).unwrap();
        assert_eq!(r.to_string(), "oci://ghcr.io/org/packages/demo:1.0.0_build.5-arm64");

        assert!(OciReference::for_package("oci://ghcr.io/org/packages:v1", &pkg).is_err());
    }

    #[test]
    fn test_skeleton_tag() {
        assert_eq!(skeleton_tag("0.1.0"), "0.1.0-skeleton");
        assert_eq!(package_tag("", ""), "latest");
    }

    #[test]
    fn test_to_distribution() {
        let r = OciReference::parse("oci://ghcr.io/org/demo:1.0.0").unwrap();
        let d = r.to_distribution().unwrap();
        assert_eq!(d.registry(), "ghcr.io");
        assert_eq!(d.repository(), "org/demo");
        assert_eq!(d.tag(), Some("1.0.0"));
    }
}
