//! Container image references
//!
//! References are normalized to `registry/repository(:tag)(@digest)`, the
//! uniqueness key used when aggregating images across components.

use indexmap::{IndexMap, IndexSet};
use std::fmt;

use crate::error::{CoreError, Result};

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// A normalized container image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
    /// The reference exactly as declared
    pub source: String,
}

impl ImageRef {
    /// Parse and normalize an image reference
    ///
    /// - missing registry defaults to `docker.io`
    /// - single-segment Docker Hub repositories get the `library/` prefix
    /// - missing tag and digest defaults the tag to `latest`
    pub fn parse(reference: &str) -> Result<Self> {
        let source = reference.trim();
        let invalid = |message: &str| CoreError::InvalidImageReference {
            reference: reference.to_string(),
            message: message.to_string(),
        };

        if source.is_empty() {
            return Err(invalid("empty reference"));
        }
        if source.contains("://") {
            return Err(invalid("image references cannot carry a scheme"));
        }

        let (name_tag, digest) = match source.split_once('@') {
            Some((n, d)) => {
                if !d.contains(':') {
                    return Err(invalid("digest must be algorithm:hex"));
                }
                (n, Some(d.to_string()))
            }
            None => (source, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are ports
        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(invalid("missing repository or tag"));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        let registry = if registry == "index.docker.io" {
            DEFAULT_REGISTRY.to_string()
        } else {
            registry
        };

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository must be lowercase"));
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
            source: source.to_string(),
        })
    }

    /// `registry/repository` without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Normalized reference string, the deduplication key
    pub fn normalized(&self) -> String {
        self.to_string()
    }

    /// Rewrite the registry (and optional repository prefix) using the first matching override
    ///
    /// Keys are matched against `registry/repository` on path-segment boundaries.
    pub fn with_overrides(&self, overrides: &IndexMap<String, String>) -> Result<Self> {
        let name = self.name();
        for (from, to) in overrides {
            let from = from.trim_end_matches('/');
            if name == from || name.starts_with(&format!("{}/", from)) {
                let rewritten = format!("{}{}", to.trim_end_matches('/'), &name[from.len()..]);
                let mut reference = rewritten;
                if let Some(tag) = &self.tag {
                    reference.push(':');
                    reference.push_str(tag);
                }
                if let Some(digest) = &self.digest {
                    reference.push('@');
                    reference.push_str(digest);
                }
                let mut image = ImageRef::parse(&reference)?;
                image.source = self.source.clone();
                return Ok(image);
            }
        }
        Ok(self.clone())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Deduplicate image references by normalized form, keeping first-seen order
pub fn unique_images<'a, I>(references: I) -> Result<Vec<ImageRef>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = IndexSet::new();
    let mut images = Vec::new();
    for reference in references {
        let image = ImageRef::parse(reference)?;
        if seen.insert(image.normalized()) {
            images.push(image);
        }
    }
    Ok(images)
}
