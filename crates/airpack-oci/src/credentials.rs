//! Registry credentials from the local Docker credential store
//!
//! Reads `$DOCKER_CONFIG/config.json` (default `~/.docker/config.json`).
//! Docker Hub is special: `docker login` stores its credentials under
//! `https://index.docker.io/v1/` while images are pulled from
//! `registry-1.docker.io`, so every Docker Hub alias maps to that key.

use base64::Engine;
use oci_distribution::secrets::RegistryAuth;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{OciError, Result};

/// Key under which `docker login` stores Docker Hub credentials
pub const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Docker config.json format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerAuth {
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    pub identity_token: Option<String>,
}

impl DockerAuth {
    fn to_basic(&self) -> Option<(String, String)> {
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            return Some((u.clone(), p.clone()));
        }
        let encoded = self.auth.as_deref()?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let creds = String::from_utf8(decoded).ok()?;
        let (user, pass) = creds.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

/// Whether `registry` is one of the Docker Hub host names
pub fn is_docker_hub(registry: &str) -> bool {
    DOCKER_HUB_ALIASES.contains(&registry)
}

/// Credential store key for a registry host
pub fn auth_key(registry: &str) -> &str {
    if is_docker_hub(registry) {
        DOCKER_HUB_AUTH_KEY
    } else {
        registry
    }
}

impl DockerConfig {
    /// Load Docker config from `$DOCKER_CONFIG` or `~/.docker`
    pub fn load() -> Result<Self> {
        let dir = match std::env::var_os("DOCKER_CONFIG") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or_else(|| OciError::AuthFailed {
                    registry: String::new(),
                    message: "Could not determine home directory".to_string(),
                })?
                .join(".docker"),
        };
        Self::load_from(&dir.join("config.json"))
    }

    /// Load a config file; a missing file yields an empty store
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| OciError::io(path, e))?;
        let config: DockerConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Authentication for a registry host, anonymous when nothing is stored
    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        let key = auth_key(registry);
        let candidates = [
            key.to_string(),
            format!("https://{}", key),
            format!("http://{}", key),
        ];

        for candidate in &candidates {
            if let Some((user, pass)) = self.auths.get(candidate).and_then(DockerAuth::to_basic) {
                tracing::debug!(registry = %registry, key = %candidate, "using stored registry credentials");
                return RegistryAuth::Basic(user, pass);
            }
        }
        RegistryAuth::Anonymous
    }
}

/// Source of registry credentials
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    /// No credentials
    #[default]
    Anonymous,
    /// The same username/password for every registry
    Basic { username: String, password: String },
    /// Look up per registry in a Docker config
    Docker(DockerConfig),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials from the local Docker store
    pub fn from_docker_config() -> Result<Self> {
        Ok(Credentials::Docker(DockerConfig::load()?))
    }

    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        match self {
            Credentials::Anonymous => RegistryAuth::Anonymous,
            Credentials::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            Credentials::Docker(config) => config.auth_for(registry),
        }
    }
}
