use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::reference::ImageReference;
use crate::transport::Transport;

/// Bearer token for one pull. Never cached between runs.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

pub struct DockerRegistryClient<'a, T: Transport> {
    transport: &'a T,
    config: &'a Config,
}

impl<'a, T: Transport> DockerRegistryClient<'a, T> {
    pub fn new(transport: &'a T, config: &'a Config) -> Self {
        Self { transport, config }
    }

    pub async fn request_token(&self, scope: &str) -> Result<AuthToken> {
        let uri = self.config.token_uri(scope);
        let auth_err = |reason: String| SandboxError::Auth {
            scope: scope.to_string(),
            reason,
        };

        let body = self
            .transport
            .get(&uri, None)
            .await
            .map_err(|e| auth_err(e.to_string()))?;

        let token = parse_token(&String::from_utf8_lossy(&body))
            .ok_or_else(|| auth_err("response carries no token".to_string()))?;

        tracing::debug!(scope, "obtained auth token");
        Ok(AuthToken(token))
    }

    /// Layer digests of `reference` in manifest order. An empty list is not an
    /// error here.
    pub async fn fetch_manifest(
        &self,
        token: &AuthToken,
        reference: &ImageReference,
    ) -> Result<Vec<String>> {
        let uri = self
            .config
            .manifest_uri(reference.repository(), reference.image(), reference.tag());

        let body = self
            .transport
            .get(&uri, Some(token.as_str()))
            .await
            .map_err(|e| SandboxError::Manifest {
                image: reference.to_string(),
                reason: e.to_string(),
            })?;

        let layers = parse_layers(&String::from_utf8_lossy(&body));
        tracing::debug!(image = %reference, layers = layers.len(), "fetched manifest");
        Ok(layers)
    }

    pub async fn fetch_layer_blob(
        &self,
        token: &AuthToken,
        reference: &ImageReference,
        digest: &str,
        dest: &Path,
    ) -> Result<()> {
        let uri = self
            .config
            .blob_uri(reference.repository(), reference.image(), digest);

        self.transport
            .get_to_file(&uri, dest, Some(token.as_str()))
            .await
            .map_err(|source| SandboxError::Download {
                digest: digest.to_string(),
                source,
            })?;

        tracing::debug!(digest, dest = %dest.display(), "downloaded layer");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DockerManifest {
    #[serde(rename = "fsLayers")]
    fs_layers: Vec<FsLayer>,
    layers: Vec<DockerManifestLayer>,
}

#[derive(Debug, Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Debug, Deserialize)]
struct DockerManifestLayer {
    digest: String,
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#""token"\s*:\s*"([^"]*)""#).unwrap())
}

fn blob_sum_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#""blobSum"\s*:\s*"([^"]*)""#).unwrap())
}

/// First `token` value of an auth response, or `None` when there is none.
pub fn parse_token(body: &str) -> Option<String> {
    match serde_json::from_str::<TokenResponse>(body) {
        Ok(response) => response.token,
        Err(_) => token_pattern()
            .captures(body)
            .map(|c| c[1].to_string()),
    }
}

/// Every `blobSum` value of a manifest, in document order. Schema 2
/// `layers[].digest` entries are used only when there is no `blobSum`.
pub fn parse_layers(body: &str) -> Vec<String> {
    match serde_json::from_str::<DockerManifest>(body) {
        Ok(manifest) if !manifest.fs_layers.is_empty() => manifest
            .fs_layers
            .into_iter()
            .map(|l| l.blob_sum)
            .collect(),
        Ok(manifest) => manifest.layers.into_iter().map(|l| l.digest).collect(),
        Err(_) => blob_sum_pattern()
            .captures_iter(body)
            .map(|c| c[1].to_string())
            .collect(),
    }
}
