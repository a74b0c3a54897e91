use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::TransportError;

/// The two GETs the registry client needs. `bearer` is sent as
/// `Authorization: Bearer <token>` when present.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, uri: &str, bearer: Option<&str>) -> Result<Bytes, TransportError>;

    async fn get_to_file(
        &self,
        uri: &str,
        dest: &Path,
        bearer: Option<&str>,
    ) -> Result<(), TransportError>;
}

/// `Transport` backed by a reqwest client.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn send(&self, uri: &str, bearer: Option<&str>) -> Result<reqwest::Response, TransportError> {
        let mut request = self.client.get(uri);
        if let Some(token) = bearer {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|source| TransportError::Request {
            uri: uri.to_string(),
            source,
        })?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                uri: uri.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, uri: &str, bearer: Option<&str>) -> Result<Bytes, TransportError> {
        tracing::debug!(uri, "GET");
        let response = self.send(uri, bearer).await?;
        response.bytes().await.map_err(|source| TransportError::Request {
            uri: uri.to_string(),
            source,
        })
    }

    async fn get_to_file(
        &self,
        uri: &str,
        dest: &Path,
        bearer: Option<&str>,
    ) -> Result<(), TransportError> {
        tracing::debug!(uri, dest = %dest.display(), "GET to file");
        let mut response = self.send(uri, bearer).await?;

        let io_err = |source| TransportError::Io {
            path: dest.to_path_buf(),
            source,
        };

        let mut file = File::create(dest).await.map_err(io_err)?;
        while let Some(chunk) = response.chunk().await.map_err(|source| TransportError::Request {
            uri: uri.to_string(),
            source,
        })? {
            file.write_all(chunk.as_ref()).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;

        Ok(())
    }
}
