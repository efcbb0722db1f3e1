//! User configuration
//!
//! Stored in `~/.config/airpack/config.yaml`. Every field has a default, and
//! `AIRPACK_*` environment variables override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

pub const ENV_CACHE: &str = "AIRPACK_CACHE";
pub const ENV_TMPDIR: &str = "AIRPACK_TMPDIR";
pub const ENV_INSECURE: &str = "AIRPACK_INSECURE";
pub const ENV_OCI_CONCURRENCY: &str = "AIRPACK_OCI_CONCURRENCY";

/// Tool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root of the content cache
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Scratch directory for package builds (system temp when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp_dir: Option<PathBuf>,

    /// Registries reached over plain HTTP
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insecure_registries: Vec<String>,

    /// Use plain HTTP for every registry
    #[serde(default)]
    pub insecure: bool,

    /// Parallel layer transfers
    #[serde(default = "default_oci_concurrency")]
    pub oci_concurrency: usize,

    /// Default target architecture
    #[serde(default = "default_architecture")]
    pub architecture: String,
}

fn default_cache_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".airpack-cache"))
        .unwrap_or_else(|| PathBuf::from(".airpack-cache"))
}

fn default_oci_concurrency() -> usize {
    3
}

/// Host architecture in OCI platform naming
pub fn default_architecture() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
    .to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            tmp_dir: None,
            insecure_registries: Vec::new(),
            insecure: false,
            oci_concurrency: default_oci_concurrency(),
            architecture: default_architecture(),
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        let config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(|e| CoreError::io(path, e))?;
        Ok(())
    }

    /// Get default configuration path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| CoreError::Config {
            message: "Could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("airpack").join("config.yaml"))
    }

    /// Apply overrides read through `lookup`
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cache) = lookup(ENV_CACHE).filter(|v| !v.is_empty()) {
            self.cache_path = PathBuf::from(cache);
        }
        if let Some(tmp) = lookup(ENV_TMPDIR).filter(|v| !v.is_empty()) {
            self.tmp_dir = Some(PathBuf::from(tmp));
        }
        if let Some(insecure) = lookup(ENV_INSECURE) {
            self.insecure = matches!(insecure.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(concurrency) = lookup(ENV_OCI_CONCURRENCY) {
            self.oci_concurrency = concurrency.parse().map_err(|_| CoreError::Config {
                message: format!("{} must be a positive integer, got {:?}", ENV_OCI_CONCURRENCY, concurrency),
            })?;
        }
        if self.oci_concurrency == 0 {
            return Err(CoreError::Config {
                message: "ociConcurrency must be at least 1".to_string(),
            });
        }
        Ok(self)
    }

    /// Cache directory for OCI content
    pub fn oci_cache(&self) -> PathBuf {
        self.cache_path.join("oci")
    }

    /// Whether `registry` should be reached over plain HTTP
    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure || self.insecure_registries.iter().any(|r| r == registry)
    }
}
