use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single HTTP exchange with the registry or auth service.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {uri} failed: {source}")]
    Request {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {uri} returned status {status}")]
    Status { uri: String, status: u16 },

    #[error("failed writing response body to {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything that can abort the pull-and-launch pipeline before the child runs.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start the pull runtime: {source}")]
    Runtime {
        #[source]
        source: io::Error,
    },

    #[error("failed to obtain auth token for scope {scope}: {reason}")]
    Auth { scope: String, reason: String },

    #[error("failed to fetch manifest for {image}: {reason}")]
    Manifest { image: String, reason: String },

    #[error("failed to download layer {digest}: {source}")]
    Download {
        digest: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to extract {}: {source}", .blob.display())]
    Extraction {
        blob: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stage {}: {source}", .path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to isolate into {}: {source}", .root.display())]
    Isolation {
        root: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// A configuration file that could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_failure_is_not_reported_as_spawn() {
        let err = SandboxError::Runtime {
            source: io::Error::new(io::ErrorKind::Other, "no threads"),
        };
        assert!(!matches!(err, SandboxError::Spawn { .. }));
        assert_eq!(err.to_string(), "failed to start the pull runtime: no threads");
    }
}
