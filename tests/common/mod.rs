#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use minidock::{Config, Transport, TransportError};
use tar::{Builder, Header};

/// In-memory registry: answers token, manifest and blob requests and records
/// every request it sees.
#[derive(Default)]
pub struct FakeTransport {
    pub token_body: Option<String>,
    pub manifest_body: Option<String>,
    pub blobs: HashMap<String, Vec<u8>>,
    pub requests: Mutex<Vec<Request>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub uri: String,
    pub bearer: Option<String>,
}

impl FakeTransport {
    pub fn serving(token: &str, layers: &[(&str, Vec<u8>)]) -> Self {
        let manifest = manifest_with(&layers.iter().map(|(d, _)| *d).collect::<Vec<_>>());
        Self {
            token_body: Some(format!(r#"{{"token":"{token}","expires_in":300}}"#)),
            manifest_body: Some(manifest),
            blobs: layers
                .iter()
                .map(|(d, b)| (d.to_string(), b.clone()))
                .collect(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn blob_requests(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|r| r.uri.split_once("/blobs/").map(|(_, d)| d.to_string()))
            .collect()
    }

    fn respond(&self, uri: &str, bearer: Option<&str>) -> Result<Vec<u8>, TransportError> {
        self.requests.lock().unwrap().push(Request {
            uri: uri.to_string(),
            bearer: bearer.map(str::to_string),
        });

        let body = if uri.contains("/token?") {
            self.token_body.clone().map(String::into_bytes)
        } else if uri.contains("/manifests/") {
            self.manifest_body.clone().map(String::into_bytes)
        } else if let Some((_, digest)) = uri.split_once("/blobs/") {
            self.blobs.get(digest).cloned()
        } else {
            None
        };

        body.ok_or_else(|| TransportError::Status {
            uri: uri.to_string(),
            status: 401,
        })
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, uri: &str, bearer: Option<&str>) -> Result<Bytes, TransportError> {
        self.respond(uri, bearer).map(Bytes::from)
    }

    async fn get_to_file(
        &self,
        uri: &str,
        dest: &Path,
        bearer: Option<&str>,
    ) -> Result<(), TransportError> {
        let body = self.respond(uri, bearer)?;
        std::fs::write(dest, body).map_err(|source| TransportError::Io {
            path: PathBuf::from(dest),
            source,
        })
    }
}

pub fn manifest_with(digests: &[&str]) -> String {
    let fs_layers: Vec<String> = digests
        .iter()
        .map(|d| format!(r#"{{"blobSum":"{d}"}}"#))
        .collect();
    format!(
        r#"{{"schemaVersion":1,"name":"library/alpine","tag":"latest","fsLayers":[{}]}}"#,
        fs_layers.join(",")
    )
}

/// Gzip-compressed tar holding `files` as `(path, mode, contents)`.
pub fn layer(files: &[(&str, u32, &[u8])]) -> Vec<u8> {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, mode, data) in files {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn config_in(base: &Path) -> Config {
    Config {
        temp_base: base.to_path_buf(),
        ..Config::default()
    }
}

pub fn entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}
