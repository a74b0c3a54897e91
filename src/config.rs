use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_AUTH_URL: &str = "https://auth.docker.io/token";
pub const DEFAULT_AUTH_SERVICE: &str = "registry.docker.io";
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.hub.docker.com/v2";

/// Where images come from and where sandbox roots are built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Token endpoint of the auth service, without query string.
    pub auth_url: String,
    /// Value of the `service` parameter sent to the auth service.
    pub auth_service: String,
    /// Registry API base, up to and including the `/v2` segment.
    pub registry_url: String,
    /// Parent directory under which each sandbox root is allocated.
    pub temp_base: PathBuf,
    /// Leave the sandbox root on disk after the run.
    pub keep_root: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            auth_service: DEFAULT_AUTH_SERVICE.to_string(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            temp_base: std::env::temp_dir(),
            keep_root: false,
        }
    }
}

impl Config {
    /// Reads a JSON config file. Fields it leaves out keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn token_uri(&self, scope: &str) -> String {
        format!("{}?service={}&scope={scope}", self.auth_url, self.auth_service)
    }

    pub fn manifest_uri(&self, repository: &str, image: &str, tag: &str) -> String {
        format!("{}/{repository}/{image}/manifests/{tag}", self.registry_url.trim_end_matches('/'))
    }

    pub fn blob_uri(&self, repository: &str, image: &str, digest: &str) -> String {
        format!("{}/{repository}/{image}/blobs/{digest}", self.registry_url.trim_end_matches('/'))
    }
}
